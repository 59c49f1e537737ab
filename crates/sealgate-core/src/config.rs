//! Service configuration.

use crate::store::{DEFAULT_PREFIX, DEFAULT_SWEEP_BATCH};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Log output format.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

impl FromStr for LogFormat {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "text" | "pretty" | "" => Ok(Self::Text),
            "json" => Ok(Self::Json),
            other => Err(format!("unknown log format: {other}")),
        }
    }
}

impl fmt::Display for LogFormat {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Text => "text",
            Self::Json => "json",
        })
    }
}

/// Shared-store password. Never serialized or printed.
#[derive(Clone, PartialEq, Eq, Deserialize)]
#[serde(transparent)]
pub struct Credential(String);

impl Credential {
    pub fn new(secret: impl Into<String>) -> Self {
        Self(secret.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Where the capability store lives, as selected by [`ServiceConfig`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreLocation<'a> {
    /// SQLite file, shared by the instances on one host.
    File(&'a Path),
    /// Redis server, shared across hosts.
    Remote {
        host: &'a str,
        port: u16,
        password: Option<&'a str>,
    },
}

impl fmt::Display for StoreLocation<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::File(path) => write!(f, "{}", path.display()),
            Self::Remote { host, port, .. } => write!(f, "redis://{host}:{port}"),
        }
    }
}

/// Runtime settings for one service instance.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceConfig {
    /// Log verbosity (`trace` .. `error`) or a full filter directive.
    #[serde(default = "default_log_level")]
    pub log_level: String,

    #[serde(default)]
    pub log_format: LogFormat,

    /// HTTP listen port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Expose `POST /sign` on this instance.
    #[serde(default)]
    pub sign_server: bool,

    /// Run the expiry sweeper alongside the HTTP surface.
    #[serde(default)]
    pub background_worker: bool,

    /// SQLite file shared by every instance on the host. Ignored when
    /// `store_host` is set.
    #[serde(default = "default_store_path")]
    pub store_path: PathBuf,

    /// Redis host. Setting it moves the store off the local file.
    #[serde(default)]
    pub store_host: Option<String>,

    #[serde(default = "default_store_port")]
    pub store_port: u16,

    #[serde(default, skip_serializing)]
    pub store_pass: Option<Credential>,

    /// Namespace prepended to every key id in the store.
    #[serde(default = "default_store_prefix")]
    pub store_prefix: String,

    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,

    #[serde(default = "default_sweep_batch")]
    pub sweep_batch_size: usize,

    /// Allowed CORS origins; `*` allows any.
    #[serde(default = "default_cors_origins")]
    pub cors_origins: Vec<String>,

    /// Deadline for one backend request/response cycle.
    #[serde(default = "default_exec_timeout")]
    pub exec_timeout_secs: u64,
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_store_path() -> PathBuf {
    PathBuf::from("sealgate.db")
}

fn default_store_port() -> u16 {
    6379
}

fn default_store_prefix() -> String {
    DEFAULT_PREFIX.to_string()
}

fn default_sweep_interval() -> u64 {
    60
}

fn default_sweep_batch() -> usize {
    DEFAULT_SWEEP_BATCH
}

fn default_cors_origins() -> Vec<String> {
    vec!["*".to_string()]
}

fn default_exec_timeout() -> u64 {
    30
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
            log_format: LogFormat::default(),
            port: default_port(),
            sign_server: false,
            background_worker: false,
            store_path: default_store_path(),
            store_host: None,
            store_port: default_store_port(),
            store_pass: None,
            store_prefix: default_store_prefix(),
            sweep_interval_secs: default_sweep_interval(),
            sweep_batch_size: default_sweep_batch(),
            cors_origins: default_cors_origins(),
            exec_timeout_secs: default_exec_timeout(),
        }
    }
}

impl ServiceConfig {
    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs.max(1))
    }

    pub fn exec_timeout(&self) -> Duration {
        Duration::from_secs(self.exec_timeout_secs.max(1))
    }

    /// A non-empty `store_host` selects the networked store.
    pub fn store_location(&self) -> StoreLocation<'_> {
        match self.store_host.as_deref().map(str::trim) {
            Some(host) if !host.is_empty() => StoreLocation::Remote {
                host,
                port: self.store_port,
                password: self
                    .store_pass
                    .as_ref()
                    .map(Credential::expose)
                    .filter(|p| !p.is_empty()),
            },
            _ => StoreLocation::File(&self.store_path),
        }
    }

    /// True when the allow-list is empty or contains `*`.
    pub fn allows_any_origin(&self) -> bool {
        self.cors_origins.is_empty() || self.cors_origins.iter().any(|o| o.trim() == "*")
    }

    /// Enable or disable `POST /sign`.
    pub fn with_sign_server(mut self, enabled: bool) -> Self {
        self.sign_server = enabled;
        self
    }

    pub fn with_background_worker(mut self, enabled: bool) -> Self {
        self.background_worker = enabled;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    pub fn with_store_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.store_path = path.into();
        self
    }

    pub fn with_store_host(mut self, host: impl Into<String>, port: u16) -> Self {
        self.store_host = Some(host.into());
        self.store_port = port;
        self
    }

    pub fn with_store_pass(mut self, password: impl Into<String>) -> Self {
        self.store_pass = Some(Credential::new(password));
        self
    }

    pub fn with_store_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.store_prefix = prefix.into();
        self
    }

    pub fn with_sweep_interval(mut self, interval: Duration) -> Self {
        self.sweep_interval_secs = interval.as_secs();
        self
    }

    pub fn with_sweep_batch_size(mut self, size: usize) -> Self {
        self.sweep_batch_size = size;
        self
    }

    pub fn with_cors_origins<I, S>(mut self, origins: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.cors_origins = origins.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_exec_timeout(mut self, timeout: Duration) -> Self {
        self.exec_timeout_secs = timeout.as_secs();
        self
    }

    pub fn with_log_level(mut self, level: impl Into<String>) -> Self {
        self.log_level = level.into();
        self
    }

    pub fn with_log_format(mut self, format: LogFormat) -> Self {
        self.log_format = format;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let cfg = ServiceConfig::default();
        assert_eq!(cfg.port, 8080);
        assert!(!cfg.sign_server);
        assert!(!cfg.background_worker);
        assert_eq!(cfg.store_prefix, "keys:");
        assert_eq!(cfg.sweep_interval(), Duration::from_secs(60));
        assert_eq!(cfg.sweep_batch_size, 100);
        assert_eq!(cfg.exec_timeout(), Duration::from_secs(30));
        assert!(cfg.allows_any_origin());
    }

    #[test]
    fn test_serde_fills_defaults() {
        let cfg: ServiceConfig = serde_json::from_str(r#"{"port": 9000, "log_format": "json"}"#).unwrap();
        assert_eq!(cfg.port, 9000);
        assert_eq!(cfg.log_format, LogFormat::Json);
        assert_eq!(cfg, ServiceConfig::default().with_port(9000).with_log_format(LogFormat::Json));
    }

    #[test]
    fn test_explicit_origins_disable_wildcard() {
        let cfg = ServiceConfig::default().with_cors_origins(["https://app.example"]);
        assert!(!cfg.allows_any_origin());
    }

    #[test]
    fn test_store_location_selects_backend() {
        let cfg = ServiceConfig::default();
        assert_eq!(cfg.store_location(), StoreLocation::File(Path::new("sealgate.db")));

        // blank host falls back to the file
        let cfg = ServiceConfig::default().with_store_host("  ", 6379);
        assert!(matches!(cfg.store_location(), StoreLocation::File(_)));

        let cfg = ServiceConfig::default()
            .with_store_host("cache.internal", 6380)
            .with_store_pass("hunter2");
        assert_eq!(
            cfg.store_location(),
            StoreLocation::Remote {
                host: "cache.internal",
                port: 6380,
                password: Some("hunter2"),
            }
        );
        assert_eq!(cfg.store_location().to_string(), "redis://cache.internal:6380");
    }

    #[test]
    fn test_store_pass_is_never_exposed() {
        let cfg = ServiceConfig::default()
            .with_store_host("cache.internal", 6379)
            .with_store_pass("hunter2");

        assert!(!format!("{cfg:?}").contains("hunter2"));
        let v = serde_json::to_value(&cfg).unwrap();
        assert!(v.get("store_pass").is_none());
        assert_eq!(v["store_host"], "cache.internal");

        let back: ServiceConfig =
            serde_json::from_str(r#"{"store_host": "h", "store_pass": "pw"}"#).unwrap();
        assert_eq!(back.store_pass.as_ref().map(Credential::expose), Some("pw"));
        assert_eq!(back.store_port, 6379);
    }

    #[test]
    fn test_log_format_parse() {
        assert_eq!("JSON".parse::<LogFormat>().unwrap(), LogFormat::Json);
        assert!("xml".parse::<LogFormat>().is_err());
    }
}
