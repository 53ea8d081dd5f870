//! Configuration file watcher
//!
//! Reloads the configuration file when it changes and re-applies it to the
//! diagnostics server. A file that fails to load is logged and the previous
//! configuration stays in effect.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use notify::{Config, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::config::{SharedConfig, load_config};
use crate::error::{DiagnosticsError, DiagnosticsResult};
use crate::server::DiagnosticsServer;

/// Quiet period after the last file event before reloading.
pub const DEFAULT_DEBOUNCE: Duration = Duration::from_millis(250);

/// Load `path` into `shared` and re-apply it to `server`.
pub async fn reload(
    path: &Path,
    shared: &SharedConfig,
    server: &DiagnosticsServer,
) -> DiagnosticsResult<()> {
    let path_str = path
        .to_str()
        .ok_or_else(|| DiagnosticsError::Internal(format!("non UTF-8 path {path:?}")))?;
    let config = load_config(path_str)?;
    info!(path = %path.display(), enable = config.enable, "diagnostics configuration reloaded");
    shared.set(config);
    server.apply_config().await
}

/// Running watch on one configuration file. Dropping it stops the watch.
pub struct ConfigWatcher {
    _watcher: RecommendedWatcher,
    task: JoinHandle<()>,
}

impl ConfigWatcher {
    /// Watch `path` and reload on change.
    pub fn spawn(
        path: impl AsRef<Path>,
        shared: Arc<SharedConfig>,
        server: Arc<DiagnosticsServer>,
        debounce: Duration,
    ) -> Result<Self, notify::Error> {
        let path = std::fs::canonicalize(path.as_ref()).map_err(notify::Error::io)?;
        // Watch the directory: editors often replace the file instead of writing to it.
        let dir = path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| PathBuf::from("."));

        let (tx, rx) = mpsc::channel(64);
        let mut watcher = RecommendedWatcher::new(
            move |result: Result<Event, notify::Error>| match result {
                Ok(event) => {
                    let _ = tx.blocking_send(event);
                }
                Err(e) => warn!(error = %e, "config watch error"),
            },
            Config::default(),
        )?;
        watcher.watch(&dir, RecursiveMode::NonRecursive)?;
        info!(path = %path.display(), "watching diagnostics configuration");

        let task = tokio::spawn(run(path, rx, shared, server, debounce));
        Ok(Self {
            _watcher: watcher,
            task,
        })
    }
}

impl Drop for ConfigWatcher {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn concerns(event: &Event, path: &Path) -> bool {
    matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) && event.paths.iter().any(|p| p == path)
}

async fn run(
    path: PathBuf,
    mut rx: mpsc::Receiver<Event>,
    shared: Arc<SharedConfig>,
    server: Arc<DiagnosticsServer>,
    debounce: Duration,
) {
    while let Some(event) = rx.recv().await {
        if !concerns(&event, &path) {
            continue;
        }

        // Swallow the burst of events a single save produces.
        loop {
            match tokio::time::timeout(debounce, rx.recv()).await {
                Ok(Some(_)) => continue,
                Ok(None) => return,
                Err(_) => break,
            }
        }

        debug!(path = %path.display(), "configuration file changed");
        if let Err(e) = reload(&path, &shared, &server).await {
            error!(path = %path.display(), error = %e, "failed to apply diagnostics configuration");
        }
    }
}
