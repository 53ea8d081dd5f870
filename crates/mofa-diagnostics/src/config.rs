//! Diagnostics configuration
//!
//! The gateway never caches configuration across lifecycle transitions: every
//! transition asks its [`ConfigSource`] for a fresh snapshot.
//!
//! Files are loaded through the `config` crate with the format inferred from
//! the extension, `${VAR}` substitution, and an environment overlay using the
//! `MOFA_DIAGNOSTICS__` prefix (for example
//! `MOFA_DIAGNOSTICS__LISTEN_ADDRESS=127.0.0.1:9000`).

use config::{Config as Cfg, Environment, File, FileFormat};
use parking_lot::RwLock;
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::{Arc, LazyLock};
use std::time::Duration;

/// Prefix for environment overrides.
pub const ENV_PREFIX: &str = "MOFA_DIAGNOSTICS";

/// Configuration loading error
#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Config parsing error: {0}")]
    Parse(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid listen address: '{0}'")]
    InvalidListenAddress(String),

    #[error("Invalid site URL '{0}': {1}")]
    InvalidSiteUrl(String, String),
}

pub type ConfigResult<T> = Result<T, ConfigError>;

/// Settings consumed by the diagnostics gateway.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiagnosticsConfig {
    /// Serve the diagnostics surface at all.
    pub enable: bool,
    /// `host:port`; a bare `:port` listens on every interface.
    pub listen_address: String,
    /// Seconds allowed for reading a request.
    pub read_timeout_secs: u64,
    /// Seconds allowed for writing a response.
    pub write_timeout_secs: u64,
    /// Process-wide block profiling rate; `0` disables it.
    pub block_profile_rate: u64,
    /// Public URL of the host service; its path is the mount sub-path.
    pub site_url: Option<String>,
}

impl Default for DiagnosticsConfig {
    fn default() -> Self {
        Self {
            enable: false,
            listen_address: ":8067".to_string(),
            read_timeout_secs: 300,
            write_timeout_secs: 300,
            block_profile_rate: 0,
            site_url: None,
        }
    }
}

impl DiagnosticsConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enable(mut self, enable: bool) -> Self {
        self.enable = enable;
        self
    }

    pub fn with_listen_address(mut self, address: &str) -> Self {
        self.listen_address = address.to_string();
        self
    }

    pub fn with_timeouts(mut self, read_secs: u64, write_secs: u64) -> Self {
        self.read_timeout_secs = read_secs;
        self.write_timeout_secs = write_secs;
        self
    }

    pub fn with_block_profile_rate(mut self, rate: u64) -> Self {
        self.block_profile_rate = rate;
        self
    }

    pub fn with_site_url(mut self, url: &str) -> Self {
        self.site_url = Some(url.to_string());
        self
    }

    /// Address in a form accepted by `TcpListener::bind`.
    pub fn bind_address(&self) -> ConfigResult<String> {
        let address = self.listen_address.trim();
        if address.is_empty() {
            return Err(ConfigError::InvalidListenAddress(self.listen_address.clone()));
        }
        if let Some(port) = address.strip_prefix(':') {
            if port.is_empty() || port.parse::<u16>().is_err() {
                return Err(ConfigError::InvalidListenAddress(self.listen_address.clone()));
            }
            return Ok(format!("0.0.0.0:{port}"));
        }
        Ok(address.to_string())
    }

    /// Upper bound for one request/response exchange; `None` when unlimited.
    pub fn request_timeout(&self) -> Option<Duration> {
        let secs = self.read_timeout_secs.saturating_add(self.write_timeout_secs);
        (secs > 0).then(|| Duration::from_secs(secs))
    }

    /// Mount sub-path derived from `site_url`, always starting with `/` and
    /// never ending with one (except the root itself).
    pub fn subpath(&self) -> ConfigResult<String> {
        let Some(site_url) = self.site_url.as_deref().filter(|u| !u.trim().is_empty()) else {
            return Ok("/".to_string());
        };
        let uri: axum::http::Uri = site_url
            .trim()
            .parse()
            .map_err(|e: axum::http::uri::InvalidUri| {
                ConfigError::InvalidSiteUrl(site_url.to_string(), e.to_string())
            })?;
        Ok(clean_path(uri.path()))
    }
}

/// Lexically clean a path: collapse separators, drop `.` and resolve `..`.
pub(crate) fn clean_path(path: &str) -> String {
    let mut parts: Vec<&str> = Vec::new();
    for segment in path.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    format!("/{}", parts.join("/"))
}

/// Read accessor for the current configuration.
pub trait ConfigSource: Send + Sync {
    fn current(&self) -> Arc<DiagnosticsConfig>;
}

impl<F> ConfigSource for F
where
    F: Fn() -> Arc<DiagnosticsConfig> + Send + Sync,
{
    fn current(&self) -> Arc<DiagnosticsConfig> {
        self()
    }
}

/// Mutable configuration cell shared between the host and the gateway.
pub struct SharedConfig {
    inner: RwLock<Arc<DiagnosticsConfig>>,
}

impl SharedConfig {
    pub fn new(config: DiagnosticsConfig) -> Self {
        Self {
            inner: RwLock::new(Arc::new(config)),
        }
    }

    /// Replace the whole configuration.
    pub fn set(&self, config: DiagnosticsConfig) {
        *self.inner.write() = Arc::new(config);
    }

    /// Modify a copy of the current configuration and publish it.
    pub fn update(&self, f: impl FnOnce(&mut DiagnosticsConfig)) {
        let mut guard = self.inner.write();
        let mut next = (**guard).clone();
        f(&mut next);
        *guard = Arc::new(next);
    }
}

impl Default for SharedConfig {
    fn default() -> Self {
        Self::new(DiagnosticsConfig::default())
    }
}

impl ConfigSource for SharedConfig {
    fn current(&self) -> Arc<DiagnosticsConfig> {
        self.inner.read().clone()
    }
}

/// Detect configuration format from file extension
pub fn detect_format(path: &str) -> ConfigResult<FileFormat> {
    let ext = Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .ok_or_else(|| ConfigError::UnsupportedFormat("No file extension found".to_string()))?;

    match ext.to_lowercase().as_str() {
        "yaml" | "yml" => Ok(FileFormat::Yaml),
        "toml" => Ok(FileFormat::Toml),
        "json" => Ok(FileFormat::Json),
        _ => Err(ConfigError::UnsupportedFormat(ext.to_string())),
    }
}

static ENV_VAR_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{([A-Za-z_][A-Za-z0-9_]*)\}").expect("env var pattern is valid")
});

/// Substitute `${VAR}` references with environment values; unknown
/// variables are left untouched.
pub fn substitute_env_vars(content: &str) -> String {
    ENV_VAR_RE
        .replace_all(content, |caps: &regex::Captures| {
            std::env::var(&caps[1]).unwrap_or_else(|_| caps[0].to_string())
        })
        .to_string()
}

/// Load a [`DiagnosticsConfig`] from a file, then apply environment overrides.
pub fn load_config(path: &str) -> ConfigResult<DiagnosticsConfig> {
    let format = detect_format(path)?;
    let content = std::fs::read_to_string(path)?;
    let substituted = substitute_env_vars(&content);

    Cfg::builder()
        .add_source(File::from_str(&substituted, format))
        .add_source(
            Environment::with_prefix(ENV_PREFIX)
                .prefix_separator("__")
                .try_parsing(true),
        )
        .build()
        .and_then(|cfg| cfg.try_deserialize())
        .map_err(|e| ConfigError::Parse(e.to_string()))
}
