//! Index pages.
//!
//! Rendering is best-effort: a broken page is logged and served empty with
//! `200 OK`, never turned into a request failure.

use axum::response::{Html, IntoResponse, Response};
use tera::{Context, Tera};
use tracing::warn;

use crate::error::{DiagnosticsError, DiagnosticsResult};

pub const ROOT_PAGE: &str = "root.html";
pub const PPROF_INDEX_PAGE: &str = "pprof_index.html";
pub const PLUGINS_PAGE: &str = "plugins.html";
pub const PLUGIN_PAGE: &str = "plugin.html";

const ROOT_TEMPLATE: &str = r#"<html>
  <body>{% if metrics %}
    <div><a href="/metrics">Metrics</a></div>{% endif %}
{% for link in profiles %}    <div><a href="/debug/pprof/{{ link.path }}">{{ link.title }}</a></div>
{% endfor %}    <div><a href="/plugins">Plugins Profiling</a></div>
  </body>
</html>
"#;

const PPROF_INDEX_TEMPLATE: &str = r#"<html>
  <head><title>/debug/pprof/</title></head>
  <body>
    <div><a href="cmdline">cmdline</a>: The command line invocation of the current program</div>
    <div><a href="profile?seconds=30">profile</a>: CPU usage of the process, sampled once per second</div>
    <div><a href="symbol">symbol</a>: Symbol lookup</div>
    <div><a href="trace?seconds=1">trace</a>: Async runtime activity over a time window</div>
{% for profile in profiles %}    <div><a href="{{ profile.name }}">{{ profile.name }}</a>: {{ profile.description }}</div>
{% endfor %}  </body>
</html>
"#;

const PLUGINS_TEMPLATE: &str = r#"<html>
  <body>
{% for id in plugins %}    <div><a href="/plugins/{{ id }}">{{ id }}</a></div>
{% endfor %}  </body>
</html>
"#;

const PLUGIN_TEMPLATE: &str = r#"<html>
  <body>
    <div><a href="metrics">Metrics</a></div>
{% for link in profiles %}    <div><a href="debug/pprof/{{ link.path }}">{{ link.title }}</a></div>
{% endfor %}  </body>
</html>
"#;

/// Renders the fixed set of diagnostics index pages.
pub struct PageRenderer {
    tera: Tera,
}

impl PageRenderer {
    /// Compile the built-in templates.
    pub fn new() -> DiagnosticsResult<Self> {
        let mut tera = Tera::default();
        tera.add_raw_templates(vec![
            (ROOT_PAGE, ROOT_TEMPLATE),
            (PPROF_INDEX_PAGE, PPROF_INDEX_TEMPLATE),
            (PLUGINS_PAGE, PLUGINS_TEMPLATE),
            (PLUGIN_PAGE, PLUGIN_TEMPLATE),
        ])
        .map_err(|e| DiagnosticsError::Render(format!("failed to create template: {e}")))?;
        Ok(Self { tera })
    }

    /// Render `template` for the request at `path`.
    pub fn render(&self, template: &str, context: &Context, path: &str) -> Response {
        match self.tera.render(template, context) {
            Ok(body) => Html(body).into_response(),
            Err(e) => {
                warn!(path = %path, error = %e, "Failed to render diagnostics page");
                Html(String::new()).into_response()
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::profiling::PROFILE_LINKS;
    use axum::body::to_bytes;
    use axum::http::StatusCode;

    async fn body_of(response: Response) -> String {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        String::from_utf8(bytes.to_vec()).unwrap()
    }

    fn root_context(metrics: bool) -> Context {
        let mut ctx = Context::new();
        ctx.insert("metrics", &metrics);
        ctx.insert("profiles", PROFILE_LINKS);
        ctx
    }

    #[tokio::test]
    async fn root_page_toggles_metrics_link() {
        let renderer = PageRenderer::new().unwrap();

        let with = body_of(renderer.render(ROOT_PAGE, &root_context(true), "/")).await;
        assert!(with.contains(r#"<a href="/metrics">Metrics</a>"#));
        assert!(with.contains(r#"<a href="/debug/pprof/cmdline">Profiling Command Line</a>"#));

        let without = body_of(renderer.render(ROOT_PAGE, &root_context(false), "/")).await;
        assert!(!without.contains("/metrics"));
        assert!(without.contains(r#"<a href="/plugins">Plugins Profiling</a>"#));
    }

    #[tokio::test]
    async fn plugin_ids_are_escaped() {
        let renderer = PageRenderer::new().unwrap();
        let mut ctx = Context::new();
        ctx.insert("plugins", &vec!["a<b"]);

        let body = body_of(renderer.render(PLUGINS_PAGE, &ctx, "/plugins/")).await;
        assert!(body.contains("a&lt;b"));
    }

    #[tokio::test]
    async fn render_failure_is_not_a_request_failure() {
        let renderer = PageRenderer::new().unwrap();

        // `profiles` is missing from the context.
        let response = renderer.render(PLUGIN_PAGE, &Context::new(), "/plugins/x/");
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_of(response).await, "");

        let response = renderer.render("missing.html", &Context::new(), "/");
        assert_eq!(response.status(), StatusCode::OK);
    }
}
