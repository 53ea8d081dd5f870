//! Application metrics backend boundary.
//!
//! The gateway only mounts the backend's handler at `/metrics`; collecting
//! the numbers is the backend's business.

use async_trait::async_trait;
use axum::{
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use parking_lot::Mutex;
use prometheus::{Encoder, IntGauge, Opts, Registry, TextEncoder};
use std::time::Instant;
use tracing::warn;

/// Metrics backend mounted at `/metrics`.
#[async_trait]
pub trait MetricsBackend: Send + Sync {
    /// Called once per enabled gateway rebuild. Must be idempotent.
    fn register(&self);

    /// Serve a scrape.
    async fn render(&self) -> Response;
}

/// [`MetricsBackend`] over a `prometheus::Registry`.
pub struct PrometheusMetrics {
    registry: Registry,
    uptime: Mutex<Option<IntGauge>>,
    started: Instant,
}

impl PrometheusMetrics {
    pub fn new() -> Self {
        Self::with_registry(Registry::new())
    }

    /// Serve an existing registry, typically the host's own.
    pub fn with_registry(registry: Registry) -> Self {
        Self {
            registry,
            uptime: Mutex::new(None),
            started: Instant::now(),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    fn encode(&self) -> Result<String, prometheus::Error> {
        if let Some(uptime) = self.uptime.lock().as_ref() {
            uptime.set(self.started.elapsed().as_secs() as i64);
        }
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}

impl Default for PrometheusMetrics {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MetricsBackend for PrometheusMetrics {
    fn register(&self) {
        let mut uptime = self.uptime.lock();
        if uptime.is_some() {
            return;
        }

        let gauge = match IntGauge::with_opts(Opts::new(
            "mofa_diagnostics_uptime_seconds",
            "Seconds since the metrics backend was created",
        )) {
            Ok(gauge) => gauge,
            Err(e) => {
                warn!(error = %e, "failed to create uptime gauge");
                return;
            }
        };
        if let Err(e) = self.registry.register(Box::new(gauge.clone())) {
            warn!(error = %e, "failed to register uptime gauge");
            return;
        }
        *uptime = Some(gauge);
    }

    async fn render(&self) -> Response {
        match self.encode() {
            Ok(body) => (
                StatusCode::OK,
                [(header::CONTENT_TYPE, prometheus::TEXT_FORMAT)],
                body,
            )
                .into_response(),
            Err(e) => {
                warn!(error = %e, "failed to encode metrics");
                (StatusCode::INTERNAL_SERVER_ERROR, e.to_string()).into_response()
            }
        }
    }
}
