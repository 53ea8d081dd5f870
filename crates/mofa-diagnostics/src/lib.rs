//! `mofa-diagnostics` — MoFA diagnostics and metrics gateway.
//!
//! One reloadable HTTP surface for operators of a running MoFA process:
//!
//! | Path | Served by |
//! |------|-----------|
//! | `/metrics` | [`metrics::MetricsBackend`] (Prometheus text format) |
//! | `/debug/pprof/...` | [`profiling`] process diagnostics |
//! | `/plugins/{plugin_id}/metrics[/...]` | the plugin's [`plugin::PluginHooks::serve_metrics`] |
//! | `/plugins/{plugin_id}/debug[/...]` | [`plugin::PluginEnvironment::serve_debug`] |
//! | anything registered with [`server::DiagnosticsServer::handle_route`] | host handlers |
//!
//! The [`server::DiagnosticsServer`] binds, rebinds and releases the listener
//! as the configuration changes. The [`watch::ConfigWatcher`] drives it from
//! a configuration file.
//!
//! # Quick start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use mofa_diagnostics::config::{DiagnosticsConfig, SharedConfig};
//! use mofa_diagnostics::metrics::PrometheusMetrics;
//! use mofa_diagnostics::server::DiagnosticsServer;
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = Arc::new(SharedConfig::new(
//!         DiagnosticsConfig::new()
//!             .with_enable(true)
//!             .with_listen_address(":8067"),
//!     ));
//!
//!     let server = DiagnosticsServer::new(config.clone())
//!         .with_metrics(Arc::new(PrometheusMetrics::new()));
//!     server.apply_config().await.unwrap();
//!
//!     // Later: turn the surface off without restarting the process.
//!     config.update(|c| c.enable = false);
//!     server.apply_config().await.unwrap();
//! }
//! ```

pub mod config;
pub mod error;
pub mod metrics;
pub mod plugin;
pub mod profiling;
pub mod render;
pub mod resolver;
pub mod routes;
pub mod server;
pub mod watch;

pub use config::{ConfigSource, DiagnosticsConfig, SharedConfig};
pub use error::{DiagnosticsError, DiagnosticsResult, ErrorBody};
pub use metrics::{MetricsBackend, PrometheusMetrics};
pub use plugin::{
    InMemoryPluginEnvironment, PluginEnvironment, PluginEnvironmentSource, PluginHooks,
    SharedPluginEnvironment,
};
pub use server::DiagnosticsServer;
