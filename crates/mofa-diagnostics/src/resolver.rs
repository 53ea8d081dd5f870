//! Plugin path resolution.
//!
//! Every request under `/plugins/{plugin_id}/...` is resolved against the
//! plugin environment at request time. A missing environment is an
//! infrastructure problem (501, logged at error). A missing plugin is an
//! ordinary 404.

use axum::{
    extract::{Path, RawPathParams, Request, State},
    http::{StatusCode, Uri, header},
    response::{IntoResponse, Response},
};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;
use tera::Context;
use tracing::{debug, error};

use crate::config::clean_path;
use crate::error::DiagnosticsError;
use crate::plugin::{PluginContext, PluginEnvironment};
use crate::profiling::PROFILE_LINKS;
use crate::render::{PLUGIN_PAGE, PLUGINS_PAGE};
use crate::routes::RouteState;

const PLUGINS_DISABLED_DETAIL: &str = "Enable plugins to serve plugin metric requests";

/// Validated plugin identity taken from the request path.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PluginId(String);

impl PluginId {
    /// Accepts `[A-Za-z0-9._-]+`.
    pub fn parse(raw: &str) -> Result<Self, DiagnosticsError> {
        let valid = !raw.is_empty()
            && raw
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-'));
        if valid {
            Ok(Self(raw.to_string()))
        } else {
            Err(DiagnosticsError::NotFound(format!("invalid plugin id '{raw}'")))
        }
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PluginId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Which plugin hook a request is addressed to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PluginRoute {
    Metrics,
    Debug,
}

impl PluginRoute {
    fn segment(self) -> &'static str {
        match self {
            PluginRoute::Metrics => "metrics",
            PluginRoute::Debug => "debug",
        }
    }
}

fn plugin_id_from(params: &HashMap<String, String>) -> Result<PluginId, DiagnosticsError> {
    PluginId::parse(params.get("plugin_id").map(String::as_str).unwrap_or_default())
}

/// The plugin id segment exactly as it appears in the request path, before
/// percent-decoding.
fn raw_plugin_id(raw: &RawPathParams) -> Option<String> {
    raw.iter()
        .find(|(key, _)| *key == "plugin_id")
        .map(|(_, value)| value.to_string())
}

fn plugins_disabled(operation: &str) -> Response {
    let err = DiagnosticsError::FeatureDisabled(PLUGINS_DISABLED_DETAIL.to_string());
    error!(operation, error = %err, "plugin environment unavailable");
    err.into_response()
}

/// Strip the plugin mount prefix from `path`.
///
/// `raw_id` is the id segment as it appears in `path`, still
/// percent-encoded. The prefix is `{subpath}/plugins/{raw_id}/{route}`.
/// Requests that reach the gateway without the host's sub-path are stripped
/// of the bare `/plugins/{raw_id}/{route}` prefix instead. The remainder
/// always starts with `/`. `None` when `path` is under neither prefix.
pub fn strip_plugin_prefix(
    path: &str,
    subpath: &str,
    raw_id: &str,
    route: PluginRoute,
) -> Option<String> {
    let bare = format!("/plugins/{}/{}", raw_id, route.segment());
    let mounted = clean_path(&format!("{subpath}{bare}"));

    let rest = path
        .strip_prefix(mounted.as_str())
        .or_else(|| path.strip_prefix(bare.as_str()))?;

    // `/plugins/abc/metricsfoo` is not under `/plugins/abc/metrics`.
    if rest.is_empty() {
        Some("/".to_string())
    } else if rest.starts_with('/') {
        Some(rest.to_string())
    } else {
        None
    }
}

/// Rewrite the request URI so the plugin only sees its own relative path.
fn rebase_request(
    req: Request,
    state: &RouteState,
    raw_id: &str,
    route: PluginRoute,
) -> Result<Request, DiagnosticsError> {
    let subpath = state
        .config
        .subpath()
        .map_err(|e| DiagnosticsError::SubpathParse(e.to_string()))?;

    let (mut parts, body) = req.into_parts();
    let relative = strip_plugin_prefix(parts.uri.path(), &subpath, raw_id, route)
        .ok_or_else(|| {
            DiagnosticsError::NotFound(format!("{} is not a plugin route", parts.uri.path()))
        })?;
    let rebased = match parts.uri.query() {
        Some(query) => format!("{relative}?{query}"),
        None => relative,
    };
    parts.uri = rebased
        .parse::<Uri>()
        .map_err(|e| DiagnosticsError::Internal(e.to_string()))?;
    Ok(Request::from_parts(parts, body))
}

fn log_and_respond(operation: &str, err: DiagnosticsError) -> Response {
    error!(operation, error = %err, "failed to serve plugin request");
    err.into_response()
}

/// `GET /plugins/` — sorted list of active plugins.
pub async fn serve_plugin_list(State(state): State<RouteState>, uri: Uri) -> Response {
    let Some(environment) = state.plugins.environment() else {
        return plugins_disabled("serve_plugin_list");
    };

    let mut ids: Vec<String> = environment.active().into_iter().map(|m| m.id).collect();
    ids.sort();

    let mut ctx = Context::new();
    ctx.insert("plugins", &ids);
    state.renderer.render(PLUGINS_PAGE, &ctx, uri.path())
}

/// `GET /plugins/{plugin_id}/` — links to the plugin's endpoints.
pub async fn serve_plugin_index(
    State(state): State<RouteState>,
    Path(params): Path<HashMap<String, String>>,
    uri: Uri,
) -> Response {
    if let Err(e) = plugin_id_from(&params) {
        return e.into_response();
    }
    let mut ctx = Context::new();
    ctx.insert("profiles", PROFILE_LINKS);
    state.renderer.render(PLUGIN_PAGE, &ctx, uri.path())
}

/// `GET /plugins/{plugin_id}` — add the trailing slash so relative links resolve.
pub async fn redirect_plugin_index(Path(params): Path<HashMap<String, String>>) -> Response {
    match plugin_id_from(&params) {
        Ok(id) => (
            StatusCode::MOVED_PERMANENTLY,
            [(header::LOCATION, format!("/plugins/{id}/"))],
        )
            .into_response(),
        Err(e) => e.into_response(),
    }
}

/// `/plugins/{plugin_id}/metrics[/...]` — forwarded to the plugin's metrics hook.
pub async fn serve_plugin_metrics(
    State(state): State<RouteState>,
    Path(params): Path<HashMap<String, String>>,
    raw: RawPathParams,
    req: Request,
) -> Response {
    let id = match plugin_id_from(&params) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    let raw_id = raw_plugin_id(&raw).unwrap_or_else(|| id.to_string());

    let Some(environment) = state.plugins.environment() else {
        return plugins_disabled("serve_plugin_metrics");
    };

    let hooks = match environment.hooks_for_plugin(id.as_str()) {
        Ok(hooks) => hooks,
        Err(e) => {
            debug!(
                missing_plugin_id = %id,
                url = %req.uri(),
                error = %e,
                "Access to route for non-existent plugin"
            );
            return DiagnosticsError::NotFound(e.to_string()).into_response();
        }
    };

    let req = match rebase_request(req, &state, &raw_id, PluginRoute::Metrics) {
        Ok(req) => req,
        Err(e) => return log_and_respond("serve_plugin_metrics", e),
    };

    hooks.serve_metrics(&PluginContext::default(), req).await
}

/// `/plugins/{plugin_id}/debug[/...]` — forwarded to the environment's debug router.
///
/// Missing plugins are answered with 404 without logging.
pub async fn serve_plugin_debug(
    State(state): State<RouteState>,
    Path(params): Path<HashMap<String, String>>,
    raw: RawPathParams,
    req: Request,
) -> Response {
    let id = match plugin_id_from(&params) {
        Ok(id) => id,
        Err(e) => return e.into_response(),
    };
    let raw_id = raw_plugin_id(&raw).unwrap_or_else(|| id.to_string());

    let Some(environment) = state.plugins.environment() else {
        return plugins_disabled("serve_plugin_debug");
    };

    let req = match rebase_request(req, &state, &raw_id, PluginRoute::Debug) {
        Ok(req) => req,
        Err(e) => return log_and_respond("serve_plugin_debug", e),
    };

    forward_debug(environment, &id, req).await
}

async fn forward_debug(
    environment: Arc<dyn PluginEnvironment>,
    id: &PluginId,
    req: Request,
) -> Response {
    match environment
        .serve_debug(id.as_str(), &PluginContext::default(), req)
        .await
    {
        Ok(response) => response,
        Err(e) => DiagnosticsError::NotFound(e.to_string()).into_response(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plugin_id_character_class() {
        assert!(PluginId::parse("com.example.demo-plugin_2").is_ok());
        for bad in ["", "a b", "a/b", "a%2Fb", "ü"] {
            assert!(PluginId::parse(bad).is_err(), "{bad:?} should be rejected");
        }
    }

    fn strip(path: &str, subpath: &str, raw_id: &str, route: PluginRoute) -> Option<String> {
        strip_plugin_prefix(path, subpath, raw_id, route)
    }

    #[test]
    fn strips_bare_prefix() {
        assert_eq!(
            strip("/plugins/abc/metrics/extra/path", "/", "abc", PluginRoute::Metrics).as_deref(),
            Some("/extra/path")
        );
        assert_eq!(
            strip("/plugins/abc/metrics", "/", "abc", PluginRoute::Metrics).as_deref(),
            Some("/")
        );
        assert_eq!(
            strip("/plugins/abc/debug/pprof/heap", "/", "abc", PluginRoute::Debug).as_deref(),
            Some("/pprof/heap")
        );
    }

    #[test]
    fn strips_subpath_qualified_prefix() {
        assert_eq!(
            strip("/company/plugins/abc/metrics/x", "/company", "abc", PluginRoute::Metrics)
                .as_deref(),
            Some("/x")
        );
        // Requests that arrive without the sub-path are still rebased.
        assert_eq!(
            strip("/plugins/abc/metrics/x", "/company", "abc", PluginRoute::Metrics).as_deref(),
            Some("/x")
        );
    }

    #[test]
    fn strips_percent_encoded_id_segment() {
        assert_eq!(
            strip("/plugins/ab%63/metrics/x", "/", "ab%63", PluginRoute::Metrics).as_deref(),
            Some("/x")
        );
    }

    #[test]
    fn paths_outside_the_mount_are_not_rebased() {
        assert_eq!(strip("/plugins/ab%63/metrics/x", "/", "abc", PluginRoute::Metrics), None);
        assert_eq!(strip("/plugins/abc/metricsx", "/", "abc", PluginRoute::Metrics), None);
        assert_eq!(strip("/plugins/abc/debug/x", "/", "abc", PluginRoute::Metrics), None);
    }

    #[test]
    fn remainder_is_preserved_exactly() {
        assert_eq!(
            strip("/plugins/abc/metrics//a/./b/", "/", "abc", PluginRoute::Metrics).as_deref(),
            Some("//a/./b/")
        );
    }
}
