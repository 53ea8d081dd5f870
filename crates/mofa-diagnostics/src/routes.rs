//! Route assembly.
//!
//! A route tree is built once per lifecycle transition and never patched.
//! Routes the host registers through
//! [`DiagnosticsServer::handle_route`](crate::server::DiagnosticsServer::handle_route)
//! live in a separate [`ExtraRoutes`] table that the tree consults from its
//! fallback, so they can be added while a tree is being served.
//!
//! | Method | Path | Handler |
//! |--------|------|---------|
//! | `GET` | `/` | root index page |
//! | `GET` | `/debug` | `301` to `/` |
//! | `GET` | `/debug/pprof/*` | process profiling |
//! | `GET` | `/metrics` | metrics backend (when configured) |
//! | `GET` | `/plugins/` | active plugin list |
//! | `GET` | `/plugins/{plugin_id}/` | per-plugin index page |
//! | `ANY` | `/plugins/{plugin_id}/metrics[/...]` | plugin metrics hook |
//! | `ANY` | `/plugins/{plugin_id}/debug[/...]` | plugin debug hook |
//!
//! The plugin metrics and debug subtrees forward every method: the plugin
//! decides which ones it answers. Everything else is `GET` only.

use axum::{
    Router,
    extract::{Request, State},
    http::{StatusCode, Uri, header},
    response::{IntoResponse, Response},
    routing::{MethodRouter, any, get},
};
use parking_lot::RwLock;
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use tera::Context;
use tower::ServiceExt;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use crate::config::DiagnosticsConfig;
use crate::error::{DiagnosticsError, DiagnosticsResult};
use crate::metrics::MetricsBackend;
use crate::plugin::PluginEnvironmentSource;
use crate::profiling::{self, PROFILE_LINKS, Profile};
use crate::render::{PPROF_INDEX_PAGE, PageRenderer, ROOT_PAGE};
use crate::resolver;

/// State shared by every handler of one route tree.
#[derive(Clone)]
pub struct RouteState {
    /// Configuration snapshot taken when the tree was assembled.
    pub config: Arc<DiagnosticsConfig>,
    pub plugins: Arc<dyn PluginEnvironmentSource>,
    pub metrics: Option<Arc<dyn MetricsBackend>>,
    pub renderer: Arc<PageRenderer>,
    pub extra: ExtraRoutes,
}

/// Host-registered routes, shared across every tree a server builds.
#[derive(Clone, Default)]
pub struct ExtraRoutes {
    inner: Arc<RwLock<ExtraRoutesInner>>,
}

#[derive(Default)]
struct ExtraRoutesInner {
    router: Router,
    // Mirror of `router`'s path table; conflicts surface here as errors
    // instead of panics inside `Router::route`.
    matcher: matchit::Router<()>,
    paths: HashSet<String>,
}

impl ExtraRoutes {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `method_router` at `path`.
    ///
    /// Paths use axum's `{param}` / `{*rest}` syntax. A path that is
    /// relative, already registered, uses the legacy `:param` / `*rest`
    /// segments or conflicts with an earlier registration is rejected and
    /// the table is left unchanged.
    pub fn insert(&self, path: &str, method_router: MethodRouter) -> DiagnosticsResult<()> {
        let invalid = |reason: String| DiagnosticsError::InvalidRoute(path.to_string(), reason);

        if !path.starts_with('/') {
            return Err(invalid("paths must start with '/'".to_string()));
        }
        if let Some(segment) = path
            .split('/')
            .find(|s| s.starts_with(':') || s.starts_with('*'))
        {
            return Err(invalid(format!(
                "segment '{segment}' must use {{param}} or {{*rest}} syntax"
            )));
        }

        let mut inner = self.inner.write();
        if inner.paths.contains(path) {
            return Err(invalid("already registered".to_string()));
        }

        let mut matcher = inner.matcher.clone();
        matcher
            .insert(path, ())
            .map_err(|e| invalid(e.to_string()))?;

        let router = inner.router.clone().route(path, method_router);
        inner.matcher = matcher;
        inner.router = router;
        inner.paths.insert(path.to_string());
        Ok(())
    }

    pub fn contains(&self, path: &str) -> bool {
        self.inner.read().paths.contains(path)
    }

    fn snapshot(&self) -> Router {
        self.inner.read().router.clone().fallback(not_found)
    }
}

async fn not_found(uri: Uri) -> Response {
    DiagnosticsError::NotFound(format!("no route for {}", uri.path())).into_response()
}

async fn serve_extra(State(state): State<RouteState>, req: Request) -> Response {
    match state.extra.snapshot().oneshot(req).await {
        Ok(response) => response,
        Err(never) => match never {},
    }
}

#[derive(Serialize)]
struct ProfileEntry {
    name: &'static str,
    description: &'static str,
}

async fn serve_root(State(state): State<RouteState>, uri: Uri) -> Response {
    let mut ctx = Context::new();
    ctx.insert("metrics", &state.metrics.is_some());
    ctx.insert("profiles", PROFILE_LINKS);
    state.renderer.render(ROOT_PAGE, &ctx, uri.path())
}

async fn serve_pprof_index(State(state): State<RouteState>, uri: Uri) -> Response {
    let profiles: Vec<ProfileEntry> = Profile::ALL
        .into_iter()
        .map(|p| ProfileEntry {
            name: p.name(),
            description: p.description(),
        })
        .collect();
    let mut ctx = Context::new();
    ctx.insert("profiles", &profiles);
    state.renderer.render(PPROF_INDEX_PAGE, &ctx, uri.path())
}

async fn serve_metrics(State(state): State<RouteState>) -> Response {
    match &state.metrics {
        Some(metrics) => metrics.render().await,
        None => DiagnosticsError::NotFound("no metrics backend configured".to_string())
            .into_response(),
    }
}

fn moved_permanently(location: &'static str) -> MethodRouter<RouteState> {
    get(move || async move {
        (StatusCode::MOVED_PERMANENTLY, [(header::LOCATION, location)]).into_response()
    })
}

/// Assemble the route tree for one lifecycle transition.
///
/// Also applies the configured block profile rate, which is process-wide.
/// Callers hold the lifecycle lock, so rebuilds never race on it.
pub fn assemble(
    config: Arc<DiagnosticsConfig>,
    plugins: Arc<dyn PluginEnvironmentSource>,
    metrics: Option<Arc<dyn MetricsBackend>>,
    extra: ExtraRoutes,
) -> DiagnosticsResult<Router> {
    profiling::set_block_profile_rate(config.block_profile_rate);

    let request_timeout = config.request_timeout();
    let has_metrics = metrics.is_some();
    let state = RouteState {
        config,
        plugins,
        metrics,
        renderer: Arc::new(PageRenderer::new()?),
        extra,
    };

    let mut router = Router::new()
        .route("/", get(serve_root))
        .route("/debug", moved_permanently("/"))
        .route("/debug/pprof", moved_permanently("/debug/pprof/"))
        .route("/debug/pprof/", get(serve_pprof_index))
        .route("/debug/pprof/cmdline", get(profiling::cmdline))
        .route(
            "/debug/pprof/symbol",
            get(profiling::symbol_count).post(profiling::symbol_lookup),
        )
        .route("/debug/pprof/profile", get(profiling::cpu_profile))
        .route("/debug/pprof/trace", get(profiling::trace));

    for profile in Profile::ALL {
        router = router.route(
            &format!("/debug/pprof/{}", profile.name()),
            get(move || profiling::serve_profile(profile)),
        );
    }

    if has_metrics {
        router = router.route("/metrics", get(serve_metrics));
    }

    let router = router
        .route("/plugins", moved_permanently("/plugins/"))
        .route("/plugins/", get(resolver::serve_plugin_list))
        .route("/plugins/{plugin_id}", get(resolver::redirect_plugin_index))
        .route("/plugins/{plugin_id}/", get(resolver::serve_plugin_index))
        .route("/plugins/{plugin_id}/metrics", any(resolver::serve_plugin_metrics))
        .route("/plugins/{plugin_id}/metrics/", any(resolver::serve_plugin_metrics))
        .route(
            "/plugins/{plugin_id}/metrics/{*rest}",
            any(resolver::serve_plugin_metrics),
        )
        .route("/plugins/{plugin_id}/debug", any(resolver::serve_plugin_debug))
        .route("/plugins/{plugin_id}/debug/", any(resolver::serve_plugin_debug))
        .route(
            "/plugins/{plugin_id}/debug/{*rest}",
            any(resolver::serve_plugin_debug),
        )
        .fallback(serve_extra)
        .with_state(state);

    let router = match request_timeout {
        Some(timeout) => router.layer(TimeoutLayer::new(timeout)),
        None => router,
    };

    Ok(router
        .layer(CatchPanicLayer::new())
        .layer(TraceLayer::new_for_http()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorBody;
    use crate::plugin::{
        InMemoryPluginEnvironment, PluginContext, PluginEnvironment, PluginHooks, PluginManifest,
        SharedPluginEnvironment,
    };
    use async_trait::async_trait;
    use axum::body::{Body, to_bytes};

    struct PathEcho;

    #[async_trait]
    impl PluginHooks for PathEcho {
        async fn serve_metrics(&self, ctx: &PluginContext, req: Request) -> Response {
            assert_eq!(ctx, &PluginContext::default());
            format!("metrics {}", req.uri()).into_response()
        }

        async fn serve_debug(&self, _ctx: &PluginContext, req: Request) -> Response {
            format!("debug {}", req.uri()).into_response()
        }
    }

    struct StaticMetrics;

    #[async_trait]
    impl MetricsBackend for StaticMetrics {
        fn register(&self) {}

        async fn render(&self) -> Response {
            "app_up 1\n".into_response()
        }
    }

    fn no_plugins() -> Arc<dyn PluginEnvironmentSource> {
        Arc::new(SharedPluginEnvironment::new())
    }

    fn with_plugins(ids: &[&str]) -> Arc<dyn PluginEnvironmentSource> {
        let env = InMemoryPluginEnvironment::new();
        for id in ids {
            env.activate(PluginManifest::new(id), Arc::new(PathEcho));
        }
        Arc::new(SharedPluginEnvironment::with_environment(Arc::new(env)))
    }

    fn build(
        config: DiagnosticsConfig,
        plugins: Arc<dyn PluginEnvironmentSource>,
        metrics: Option<Arc<dyn MetricsBackend>>,
    ) -> Router {
        assemble(Arc::new(config), plugins, metrics, ExtraRoutes::new()).unwrap()
    }

    async fn get_path(app: &Router, path: &str) -> (StatusCode, String) {
        let response = app
            .clone()
            .oneshot(Request::builder().uri(path).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn root_page_lists_metrics_only_with_backend() {
        let app = build(DiagnosticsConfig::default(), no_plugins(), Some(Arc::new(StaticMetrics)));
        let (status, body) = get_path(&app, "/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(r#"href="/metrics""#));

        let app = build(DiagnosticsConfig::default(), no_plugins(), None);
        let (_, body) = get_path(&app, "/").await;
        assert!(!body.contains(r#"href="/metrics""#));
        assert!(body.contains("Profiling CPU"));
    }

    #[tokio::test]
    async fn metrics_route_only_mounted_with_backend() {
        let app = build(DiagnosticsConfig::default(), no_plugins(), Some(Arc::new(StaticMetrics)));
        assert_eq!(get_path(&app, "/metrics").await, (StatusCode::OK, "app_up 1\n".to_string()));

        let app = build(DiagnosticsConfig::default(), no_plugins(), None);
        assert_eq!(get_path(&app, "/metrics").await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn debug_redirects_to_root() {
        let app = build(DiagnosticsConfig::default(), no_plugins(), None);
        let response = app
            .oneshot(Request::builder().uri("/debug").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::MOVED_PERMANENTLY);
        assert_eq!(response.headers()[header::LOCATION], "/");
    }

    #[tokio::test]
    async fn profiling_endpoints_are_mounted() {
        let app = build(DiagnosticsConfig::default(), no_plugins(), None);
        let (status, body) = get_path(&app, "/debug/pprof/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(r#"<a href="threadcreate">threadcreate</a>"#));

        for path in ["/debug/pprof/cmdline", "/debug/pprof/symbol", "/debug/pprof/goroutine"] {
            assert_eq!(get_path(&app, path).await.0, StatusCode::OK, "{path}");
        }
        assert_eq!(get_path(&app, "/debug/pprof/nope").await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn plugin_requests_without_environment_are_501() {
        let app = build(DiagnosticsConfig::default(), no_plugins(), None);
        for path in [
            "/plugins/",
            "/plugins/any/metrics",
            "/plugins/other-id/metrics/x",
            "/plugins/any/debug/pprof/",
        ] {
            let (status, body) = get_path(&app, path).await;
            assert_eq!(status, StatusCode::NOT_IMPLEMENTED, "{path}");
            let body: ErrorBody = serde_json::from_str(&body).unwrap();
            assert_eq!(body.status, 501);
            assert!(!body.message.is_empty());
        }
    }

    #[tokio::test]
    async fn unknown_plugin_is_404() {
        let app = build(DiagnosticsConfig::default(), with_plugins(&["abc"]), None);
        let (status, body) = get_path(&app, "/plugins/unknown-id/metrics").await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let body: ErrorBody = serde_json::from_str(&body).unwrap();
        assert_eq!(body.status, 404);

        assert_eq!(
            get_path(&app, "/plugins/unknown-id/debug/pprof/").await.0,
            StatusCode::NOT_FOUND
        );
    }

    #[tokio::test]
    async fn plugin_sees_path_relative_to_its_mount() {
        let app = build(DiagnosticsConfig::default(), with_plugins(&["abc"]), None);
        assert_eq!(
            get_path(&app, "/plugins/abc/metrics/extra/path").await,
            (StatusCode::OK, "metrics /extra/path".to_string())
        );
        assert_eq!(
            get_path(&app, "/plugins/abc/metrics").await,
            (StatusCode::OK, "metrics /".to_string())
        );
        assert_eq!(
            get_path(&app, "/plugins/abc/debug/pprof/heap?debug=1").await,
            (StatusCode::OK, "debug /pprof/heap?debug=1".to_string())
        );
    }

    #[tokio::test]
    async fn percent_encoded_plugin_id_is_stripped() {
        let app = build(DiagnosticsConfig::default(), with_plugins(&["abc"]), None);
        assert_eq!(
            get_path(&app, "/plugins/ab%63/metrics/x").await,
            (StatusCode::OK, "metrics /x".to_string())
        );
        assert_eq!(
            get_path(&app, "/plugins/%61bc/debug/pprof/").await,
            (StatusCode::OK, "debug /pprof/".to_string())
        );
    }

    #[tokio::test]
    async fn site_url_subpath_is_accounted_for() {
        let config = DiagnosticsConfig::default().with_site_url("https://example.com/company");
        let app = build(config, with_plugins(&["abc"]), None);
        assert_eq!(
            get_path(&app, "/plugins/abc/metrics/x").await,
            (StatusCode::OK, "metrics /x".to_string())
        );
    }

    #[tokio::test]
    async fn plugin_list_is_sorted() {
        let app = build(DiagnosticsConfig::default(), with_plugins(&["zeta", "alpha"]), None);
        let (status, body) = get_path(&app, "/plugins/").await;
        assert_eq!(status, StatusCode::OK);
        let alpha = body.find("/plugins/alpha").unwrap();
        let zeta = body.find("/plugins/zeta").unwrap();
        assert!(alpha < zeta);
    }

    #[tokio::test]
    async fn plugin_index_and_redirects() {
        let app = build(DiagnosticsConfig::default(), no_plugins(), None);
        let (status, body) = get_path(&app, "/plugins/abc/").await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.contains(r#"<a href="metrics">Metrics</a>"#));

        assert_eq!(get_path(&app, "/plugins/abc").await.0, StatusCode::MOVED_PERMANENTLY);
        assert_eq!(get_path(&app, "/plugins").await.0, StatusCode::MOVED_PERMANENTLY);
        assert_eq!(get_path(&app, "/plugins/a%20b/").await.0, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn extra_routes_are_served_from_fallback() {
        let extra = ExtraRoutes::new();
        let app = assemble(
            Arc::new(DiagnosticsConfig::default()),
            no_plugins(),
            None,
            extra.clone(),
        )
        .unwrap();

        assert_eq!(get_path(&app, "/custom").await.0, StatusCode::NOT_FOUND);

        // Registered after assembly, visible to the already built tree.
        extra.insert("/custom", get(|| async { "custom" })).unwrap();
        assert_eq!(
            get_path(&app, "/custom").await,
            (StatusCode::OK, "custom".to_string())
        );
    }

    #[test]
    fn extra_routes_reject_duplicates_and_relative_paths() {
        let extra = ExtraRoutes::new();
        extra.insert("/a", get(|| async { "a" })).unwrap();
        assert!(extra.contains("/a"));
        assert!(matches!(
            extra.insert("/a", get(|| async { "again" })),
            Err(DiagnosticsError::InvalidRoute(..))
        ));
        assert!(matches!(
            extra.insert("relative", get(|| async { "r" })),
            Err(DiagnosticsError::InvalidRoute(..))
        ));
    }

    #[tokio::test]
    async fn conflicting_extra_routes_are_rejected_without_losing_state() {
        let extra = ExtraRoutes::new();
        extra.insert("/users/{id}", get(|| async { "user" })).unwrap();

        assert!(matches!(
            extra.insert("/users/{name}", get(|| async { "name" })),
            Err(DiagnosticsError::InvalidRoute(..))
        ));
        assert!(matches!(
            extra.insert("/items/:id", get(|| async { "item" })),
            Err(DiagnosticsError::InvalidRoute(..))
        ));
        assert!(matches!(
            extra.insert("/files/*rest", get(|| async { "file" })),
            Err(DiagnosticsError::InvalidRoute(..))
        ));
        assert!(!extra.contains("/users/{name}"));
        assert!(!extra.contains("/items/:id"));

        // Earlier registrations are still served and new ones still work.
        extra.insert("/items/{id}", get(|| async { "item" })).unwrap();
        let app = assemble(
            Arc::new(DiagnosticsConfig::default()),
            no_plugins(),
            None,
            extra,
        )
        .unwrap();
        assert_eq!(
            get_path(&app, "/users/7").await,
            (StatusCode::OK, "user".to_string())
        );
        assert_eq!(
            get_path(&app, "/items/9").await,
            (StatusCode::OK, "item".to_string())
        );
    }

    async fn boom() -> &'static str {
        panic!("boom")
    }

    #[tokio::test]
    async fn panicking_handler_becomes_500() {
        let extra = ExtraRoutes::new();
        extra.insert("/boom", get(boom)).unwrap();
        let app = assemble(Arc::new(DiagnosticsConfig::default()), no_plugins(), None, extra)
            .unwrap();
        assert_eq!(get_path(&app, "/boom").await.0, StatusCode::INTERNAL_SERVER_ERROR);
    }
}
