//! Diagnostics server lifecycle.
//!
//! [`DiagnosticsServer`] owns the listening socket, the serve task and the
//! route tree of the running instance. Every transition runs under one
//! async mutex, so transitions are totally ordered and each one observes the
//! completed effect of the previous one. At most one listener is bound at
//! any time.

use axum::{Router, routing::MethodRouter};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::sync::{Mutex, oneshot};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

use crate::config::{ConfigSource, DiagnosticsConfig};
use crate::error::{DiagnosticsError, DiagnosticsResult};
use crate::metrics::MetricsBackend;
use crate::plugin::{PluginEnvironmentSource, SharedPluginEnvironment};
use crate::routes::{self, ExtraRoutes};

/// How long in-flight requests may run after shutdown starts.
pub const SHUTDOWN_DEADLINE: Duration = Duration::from_secs(1);

/// Invoked when the serve loop dies for a reason other than shutdown.
pub type FatalServeHandler = Arc<dyn Fn(&DiagnosticsError) + Send + Sync>;

fn exit_process() -> FatalServeHandler {
    Arc::new(|err: &DiagnosticsError| {
        error!(error = %err, "diagnostics surface lost, terminating");
        std::process::exit(1);
    })
}

struct RunningGateway {
    address: SocketAddr,
    shutdown_tx: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// Lifecycle manager of the diagnostics HTTP surface.
pub struct DiagnosticsServer {
    config: Arc<dyn ConfigSource>,
    plugins: Arc<dyn PluginEnvironmentSource>,
    metrics: Option<Arc<dyn MetricsBackend>>,
    extra: ExtraRoutes,
    on_fatal: FatalServeHandler,
    running: Mutex<Option<RunningGateway>>,
}

impl DiagnosticsServer {
    /// Create a stopped server. Nothing is bound until
    /// [`apply_config`](Self::apply_config) or [`start`](Self::start).
    pub fn new(config: Arc<dyn ConfigSource>) -> Self {
        Self {
            config,
            plugins: Arc::new(SharedPluginEnvironment::new()),
            metrics: None,
            extra: ExtraRoutes::new(),
            on_fatal: exit_process(),
            running: Mutex::new(None),
        }
    }

    /// Source of the plugin environment (default: plugins disabled).
    pub fn with_plugins(mut self, plugins: Arc<dyn PluginEnvironmentSource>) -> Self {
        self.plugins = plugins;
        self
    }

    /// Metrics backend mounted at `/metrics`.
    pub fn with_metrics(mut self, metrics: Arc<dyn MetricsBackend>) -> Self {
        self.metrics = Some(metrics);
        self
    }

    /// Replace the default fatal handler, which exits the process.
    pub fn with_fatal_handler(mut self, handler: FatalServeHandler) -> Self {
        self.on_fatal = handler;
        self
    }

    /// Mount an additional route next to the diagnostics routes.
    ///
    /// Valid before or after the gateway starts; registrations survive
    /// restarts. Fixed diagnostics routes take precedence.
    pub fn handle_route(&self, path: &str, method_router: MethodRouter) -> DiagnosticsResult<()> {
        self.extra.insert(path, method_router)
    }

    /// Bound address of the running instance.
    pub async fn listen_addr(&self) -> Option<SocketAddr> {
        self.running.lock().await.as_ref().map(|r| r.address)
    }

    pub async fn is_running(&self) -> bool {
        self.running.lock().await.is_some()
    }

    /// Bring the server in line with the current configuration.
    ///
    /// Disabled: any running instance is stopped. Enabled: any running
    /// instance is stopped, then the route tree is rebuilt and a fresh
    /// listener is bound on the configured address. A failed bind leaves the
    /// server stopped.
    pub async fn apply_config(&self) -> DiagnosticsResult<()> {
        let mut running = self.running.lock().await;
        self.apply_locked(&mut running).await
    }

    /// Stop, then re-apply the current configuration, as one transition.
    pub async fn restart(&self) -> DiagnosticsResult<()> {
        let mut running = self.running.lock().await;
        self.stop_locked(&mut running).await?;
        self.apply_locked(&mut running).await
    }

    /// Bind and serve regardless of the enable flag. A running instance is
    /// stopped first. Returns once the listener is bound.
    pub async fn start(&self) -> DiagnosticsResult<SocketAddr> {
        let mut running = self.running.lock().await;
        self.stop_locked(&mut running).await?;
        let config = self.config.current();
        self.start_locked(&mut running, config).await
    }

    /// Gracefully stop the running instance. A no-op when stopped.
    pub async fn stop(&self) -> DiagnosticsResult<()> {
        let mut running = self.running.lock().await;
        self.stop_locked(&mut running).await
    }

    async fn apply_locked(&self, running: &mut Option<RunningGateway>) -> DiagnosticsResult<()> {
        let config = self.config.current();
        if !config.enable {
            return self.stop_locked(running).await;
        }

        self.stop_locked(running).await?;
        if let Some(metrics) = &self.metrics {
            metrics.register();
        }
        self.start_locked(running, config).await.map(|_| ())
    }

    async fn start_locked(
        &self,
        running: &mut Option<RunningGateway>,
        config: Arc<DiagnosticsConfig>,
    ) -> DiagnosticsResult<SocketAddr> {
        let bind_address = config.bind_address()?;
        let router = routes::assemble(
            config.clone(),
            self.plugins.clone(),
            self.metrics.clone(),
            self.extra.clone(),
        )?;

        let listener =
            TcpListener::bind(&bind_address)
                .await
                .map_err(|source| DiagnosticsError::Bind {
                    address: config.listen_address.clone(),
                    source,
                })?;
        let address = listener
            .local_addr()
            .map_err(|source| DiagnosticsError::Bind {
                address: config.listen_address.clone(),
                source,
            })?;

        let (shutdown_tx, shutdown_rx) = oneshot::channel();
        let task = tokio::spawn(serve(listener, router, shutdown_rx, self.on_fatal.clone()));

        info!(address = %address, "Metrics and profiling server is started");
        *running = Some(RunningGateway {
            address,
            shutdown_tx,
            task,
        });
        Ok(address)
    }

    async fn stop_locked(&self, running: &mut Option<RunningGateway>) -> DiagnosticsResult<()> {
        let Some(RunningGateway {
            address,
            shutdown_tx,
            mut task,
        }) = running.take()
        else {
            return Ok(());
        };

        // The serve task may already be gone; that is not a shutdown failure.
        let _ = shutdown_tx.send(());

        match tokio::time::timeout(SHUTDOWN_DEADLINE, &mut task).await {
            Ok(Ok(())) => {
                info!(address = %address, "Metrics and profiling server is stopped");
                Ok(())
            }
            Ok(Err(e)) => Err(DiagnosticsError::Shutdown(e.to_string())),
            Err(_) => {
                warn!(
                    address = %address,
                    deadline = ?SHUTDOWN_DEADLINE,
                    "graceful shutdown timed out, closing listener"
                );
                // Closes the listener. Connections already accepted run on
                // their own tasks and finish independently.
                task.abort();
                let _ = task.await;
                Err(DiagnosticsError::ShutdownTimeout(SHUTDOWN_DEADLINE))
            }
        }
    }
}

async fn serve(
    listener: TcpListener,
    router: Router,
    shutdown_rx: oneshot::Receiver<()>,
    on_fatal: FatalServeHandler,
) {
    let result = axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            let _ = shutdown_rx.await;
        })
        .await;

    if let Err(e) = result {
        let err = DiagnosticsError::FatalServe(e.to_string());
        error!(error = %err, "diagnostics serve loop failed");
        on_fatal(&err);
    }
}
