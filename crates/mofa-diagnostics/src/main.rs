//! MoFA diagnostics gateway — entry point.
//!
//! Serves the metrics, profiling and plugin debug surface of a standalone
//! process.
//!
//! # Configuration
//!
//! | Source | Example |
//! |--------|---------|
//! | `--config <file>` | `diagnostics.toml`, `.yaml`, `.yml` or `.json` |
//! | `MOFA_DIAGNOSTICS__<FIELD>` | `MOFA_DIAGNOSTICS__LISTEN_ADDRESS=:9000` |
//! | `--listen`, `--enable` | override the loaded file |
//! | `RUST_LOG` | `mofa_diagnostics=debug,tower_http=debug` |

use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use mofa_diagnostics::config::{DiagnosticsConfig, SharedConfig, load_config};
use mofa_diagnostics::metrics::PrometheusMetrics;
use mofa_diagnostics::plugin::SharedPluginEnvironment;
use mofa_diagnostics::server::DiagnosticsServer;
use mofa_diagnostics::watch::{ConfigWatcher, DEFAULT_DEBOUNCE};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(name = "mofa-diagnostics", version, about = "MoFA diagnostics and metrics gateway")]
struct Args {
    /// Configuration file.
    #[arg(short, long, env = "MOFA_DIAGNOSTICS_CONFIG")]
    config: Option<PathBuf>,

    /// Listen address, e.g. `:8067` or `127.0.0.1:9000`.
    #[arg(short, long)]
    listen: Option<String>,

    /// Enable the surface regardless of the file.
    #[arg(long)]
    enable: bool,

    /// Emit logs as JSON lines.
    #[arg(long)]
    json: bool,

    /// Reload the configuration file when it changes.
    #[arg(long, requires = "config")]
    watch: bool,
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("mofa_diagnostics=info,tower_http=warn"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

#[tokio::main]
async fn main() {
    let args = Args::parse();
    init_tracing(args.json);

    let mut config = match &args.config {
        Some(path) => match load_config(&path.to_string_lossy()) {
            Ok(config) => config,
            Err(e) => {
                error!(path = %path.display(), error = %e, "failed to load configuration");
                std::process::exit(1);
            }
        },
        None => DiagnosticsConfig::default(),
    };
    if let Some(listen) = &args.listen {
        config.listen_address = listen.clone();
    }
    if args.enable {
        config.enable = true;
    }

    if !config.enable {
        warn!("diagnostics surface is disabled; pass --enable or set enable = true");
    }

    let shared = Arc::new(SharedConfig::new(config));
    let server = Arc::new(
        DiagnosticsServer::new(shared.clone())
            .with_metrics(Arc::new(PrometheusMetrics::new()))
            .with_plugins(Arc::new(SharedPluginEnvironment::new())),
    );

    if let Err(e) = server.apply_config().await {
        error!(error = %e, "failed to start diagnostics server");
        std::process::exit(1);
    }

    let _watcher = match (&args.config, args.watch) {
        (Some(path), true) => {
            match ConfigWatcher::spawn(path, shared.clone(), server.clone(), DEFAULT_DEBOUNCE) {
                Ok(watcher) => Some(watcher),
                Err(e) => {
                    warn!(path = %path.display(), error = %e, "configuration watch unavailable");
                    None
                }
            }
        }
        _ => None,
    };

    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutting down");

    if let Err(e) = server.stop().await {
        error!(error = %e, "diagnostics server did not stop cleanly");
        std::process::exit(1);
    }
}
