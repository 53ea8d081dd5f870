//! Plugin host boundary.
//!
//! The gateway does not load plugins. It asks a [`PluginEnvironmentSource`]
//! for the environment on every request, because the set of active plugins
//! changes independently of the gateway lifecycle.

use async_trait::async_trait;
use axum::{
    extract::Request,
    response::{IntoResponse, Response},
};
use parking_lot::RwLock;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::error::DiagnosticsError;

/// Errors reported by a plugin environment.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum PluginError {
    #[error("plugin '{0}' is not active")]
    NotFound(String),
}

/// Request context handed to plugin hooks.
///
/// Always empty at this layer: access control for diagnostic endpoints is
/// not decided here.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PluginContext {
    pub session_id: Option<String>,
    pub user_id: Option<String>,
}

/// Manifest of an active plugin.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PluginManifest {
    pub id: String,
    pub version: Option<String>,
}

impl PluginManifest {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            version: None,
        }
    }

    pub fn with_version(mut self, version: &str) -> Self {
        self.version = Some(version.to_string());
        self
    }
}

/// Hooks a plugin exposes to the diagnostics gateway.
///
/// The request path is relative to the hook's mount point: a request to
/// `/plugins/abc/metrics/extra` reaches `serve_metrics` as `/extra`.
#[async_trait]
pub trait PluginHooks: Send + Sync {
    async fn serve_metrics(&self, ctx: &PluginContext, req: Request) -> Response;

    async fn serve_debug(&self, _ctx: &PluginContext, req: Request) -> Response {
        DiagnosticsError::NotFound(format!("no debug handler for {}", req.uri().path()))
            .into_response()
    }
}

/// The set of currently active plugins.
#[async_trait]
pub trait PluginEnvironment: Send + Sync {
    /// Manifests of every active plugin.
    fn active(&self) -> Vec<PluginManifest>;

    /// Hooks of one active plugin.
    fn hooks_for_plugin(&self, id: &str) -> Result<Arc<dyn PluginHooks>, PluginError>;

    /// Route a debug request to a plugin.
    async fn serve_debug(
        &self,
        id: &str,
        ctx: &PluginContext,
        req: Request,
    ) -> Result<Response, PluginError> {
        let hooks = self.hooks_for_plugin(id)?;
        Ok(hooks.serve_debug(ctx, req).await)
    }
}

/// Accessor for the plugin environment; `None` means plugins are disabled.
pub trait PluginEnvironmentSource: Send + Sync {
    fn environment(&self) -> Option<Arc<dyn PluginEnvironment>>;
}

impl<F> PluginEnvironmentSource for F
where
    F: Fn() -> Option<Arc<dyn PluginEnvironment>> + Send + Sync,
{
    fn environment(&self) -> Option<Arc<dyn PluginEnvironment>> {
        self()
    }
}

/// Environment slot the host fills when plugins are enabled and clears when
/// they are disabled.
#[derive(Default)]
pub struct SharedPluginEnvironment {
    inner: RwLock<Option<Arc<dyn PluginEnvironment>>>,
}

impl SharedPluginEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_environment(environment: Arc<dyn PluginEnvironment>) -> Self {
        Self {
            inner: RwLock::new(Some(environment)),
        }
    }

    pub fn set(&self, environment: Arc<dyn PluginEnvironment>) {
        *self.inner.write() = Some(environment);
    }

    pub fn clear(&self) {
        *self.inner.write() = None;
    }
}

impl PluginEnvironmentSource for SharedPluginEnvironment {
    fn environment(&self) -> Option<Arc<dyn PluginEnvironment>> {
        self.inner.read().clone()
    }
}

/// [`PluginEnvironment`] backed by a map of registered hooks.
///
/// Suitable for embedding and tests; real hosts adapt their own plugin
/// supervisor to the trait.
#[derive(Default)]
pub struct InMemoryPluginEnvironment {
    plugins: RwLock<BTreeMap<String, (PluginManifest, Arc<dyn PluginHooks>)>>,
}

impl InMemoryPluginEnvironment {
    pub fn new() -> Self {
        Self::default()
    }

    /// Activate a plugin, replacing any previous registration with the same id.
    pub fn activate(&self, manifest: PluginManifest, hooks: Arc<dyn PluginHooks>) {
        self.plugins
            .write()
            .insert(manifest.id.clone(), (manifest, hooks));
    }

    /// Deactivate a plugin; returns whether it was active.
    pub fn deactivate(&self, id: &str) -> bool {
        self.plugins.write().remove(id).is_some()
    }
}

impl PluginEnvironment for InMemoryPluginEnvironment {
    fn active(&self) -> Vec<PluginManifest> {
        self.plugins
            .read()
            .values()
            .map(|(manifest, _)| manifest.clone())
            .collect()
    }

    fn hooks_for_plugin(&self, id: &str) -> Result<Arc<dyn PluginHooks>, PluginError> {
        self.plugins
            .read()
            .get(id)
            .map(|(_, hooks)| hooks.clone())
            .ok_or_else(|| PluginError::NotFound(id.to_string()))
    }
}
