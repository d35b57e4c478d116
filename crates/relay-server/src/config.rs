//! Server configuration.
//!
//! Configuration is layered:
//! - A TOML file (`relay.toml`, `/etc/relay/relay.toml` or
//!   `~/.config/relay/relay.toml`, or an explicit path)
//! - Environment variables (`RELAY__PORT`, `RELAY__AUTH__JWT_SECRET`, ...)
//!
//! Anything not set falls back to the defaults below.

use anyhow::{ensure, Context, Result};
use relay_core::{HubConfig, RateLimitConfig};
use relay_protocol::codec::MAX_FRAME_SIZE;
use serde::{Deserialize, Serialize};
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;

const CONFIG_PATHS: [&str; 3] = [
    "relay.toml",
    "/etc/relay/relay.toml",
    "~/.config/relay/relay.toml",
];

/// Server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Host to bind to.
    #[serde(default = "default_host")]
    pub host: String,

    /// Port to listen on.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Transport configuration.
    #[serde(default)]
    pub transport: TransportConfig,

    /// Hub channel sizes.
    #[serde(default)]
    pub hub: HubSettings,

    /// Token verification.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Rate-limit store.
    #[serde(default)]
    pub store: StoreConfig,

    /// Rate limits.
    #[serde(default)]
    pub rate_limit: RateLimitSettings,

    /// Metrics configuration.
    #[serde(default)]
    pub metrics: MetricsConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Transport configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Path for the WebSocket endpoint.
    #[serde(default = "default_ws_path")]
    pub websocket_path: String,

    /// Maximum inbound message size in bytes.
    #[serde(default = "default_max_message_size")]
    pub max_message_size: usize,

    /// Longest a single write to a client may take, in milliseconds.
    #[serde(default = "default_write_timeout")]
    pub write_timeout_ms: u64,
}

/// Hub channel sizes.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HubSettings {
    /// Capacity of the hub's ingress channel.
    #[serde(default = "default_ingress_capacity")]
    pub ingress_capacity: usize,

    /// Capacity of each connection's outbound queue.
    #[serde(default = "default_outbound_capacity")]
    pub outbound_capacity: usize,
}

/// Token verification settings.
#[derive(Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    /// HS256 secret shared with the token issuer.
    #[serde(default)]
    pub jwt_secret: String,

    /// Cookie that may carry the token.
    #[serde(default = "default_cookie_name")]
    pub cookie_name: String,
}

impl std::fmt::Debug for AuthConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AuthConfig")
            .field("jwt_secret", &"<redacted>")
            .field("cookie_name", &self.cookie_name)
            .finish()
    }
}

/// Which backend holds rate-limit windows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StoreBackend {
    /// Process-local windows.
    #[default]
    Memory,
    /// Shared windows in Redis.
    Redis,
}

/// Rate-limit store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Backend to use.
    #[serde(default)]
    pub backend: StoreBackend,

    /// Redis connection URL.
    #[serde(default = "default_redis_url")]
    pub redis_url: String,

    /// Upper bound on a single Redis round trip in milliseconds.
    #[serde(default = "default_redis_timeout")]
    pub timeout_ms: u64,

    /// How often expired in-memory windows are reclaimed, in seconds.
    #[serde(default = "default_sweep_interval")]
    pub sweep_interval_secs: u64,
}

/// One sliding-window limit.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct LimitConfig {
    /// Events admitted per window.
    #[serde(default = "default_limit")]
    pub limit: u64,

    /// Window length in seconds.
    #[serde(default = "default_window_secs")]
    pub window_secs: u64,
}

/// Rate limits per surface.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RateLimitSettings {
    /// WebSocket upgrades, keyed by client IP.
    #[serde(default)]
    pub upgrade: LimitConfig,

    /// Room management calls, keyed by user id.
    #[serde(default)]
    pub api: LimitConfig,
}

/// Metrics configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    /// Enable metrics export.
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Metrics port.
    #[serde(default = "default_metrics_port")]
    pub port: u16,

    /// How often hub gauges are refreshed, in milliseconds.
    #[serde(default = "default_refresh_interval")]
    pub refresh_interval_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Filter used when `RUST_LOG` is not set.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_true() -> bool {
    true
}

fn default_ws_path() -> String {
    "/ws".to_string()
}

fn default_max_message_size() -> usize {
    64 * 1024 // 64 KB
}

fn default_write_timeout() -> u64 {
    10_000
}

fn default_ingress_capacity() -> usize {
    1024
}

fn default_outbound_capacity() -> usize {
    256
}

fn default_cookie_name() -> String {
    "access".to_string()
}

fn default_redis_url() -> String {
    "redis://127.0.0.1:6379/".to_string()
}

fn default_redis_timeout() -> u64 {
    500
}

fn default_sweep_interval() -> u64 {
    30
}

fn default_limit() -> u64 {
    10
}

fn default_window_secs() -> u64 {
    60
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_refresh_interval() -> u64 {
    5_000
}

fn default_log_level() -> String {
    "relay=info,relay_server=info,relay_core=info,relay_transport=info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            transport: TransportConfig::default(),
            hub: HubSettings::default(),
            auth: AuthConfig::default(),
            store: StoreConfig::default(),
            rate_limit: RateLimitSettings::default(),
            metrics: MetricsConfig::default(),
            logging: LoggingConfig::default(),
        }
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            websocket_path: default_ws_path(),
            max_message_size: default_max_message_size(),
            write_timeout_ms: default_write_timeout(),
        }
    }
}

impl Default for HubSettings {
    fn default() -> Self {
        Self {
            ingress_capacity: default_ingress_capacity(),
            outbound_capacity: default_outbound_capacity(),
        }
    }
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            jwt_secret: String::new(),
            cookie_name: default_cookie_name(),
        }
    }
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            backend: StoreBackend::default(),
            redis_url: default_redis_url(),
            timeout_ms: default_redis_timeout(),
            sweep_interval_secs: default_sweep_interval(),
        }
    }
}

impl Default for LimitConfig {
    fn default() -> Self {
        Self {
            limit: default_limit(),
            window_secs: default_window_secs(),
        }
    }
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            refresh_interval_ms: default_refresh_interval(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl LimitConfig {
    /// Limits in the form the rate limiter takes.
    #[must_use]
    pub fn to_rate_limit(&self) -> RateLimitConfig {
        RateLimitConfig {
            limit: self.limit,
            window: Duration::from_secs(self.window_secs),
        }
    }
}

impl TransportConfig {
    /// Write deadline for the connection pumps.
    #[must_use]
    pub fn write_timeout(&self) -> Duration {
        Duration::from_millis(self.write_timeout_ms)
    }
}

impl HubSettings {
    /// Settings in the form the hub takes.
    #[must_use]
    pub fn to_hub_config(&self) -> HubConfig {
        HubConfig {
            ingress_capacity: self.ingress_capacity,
            outbound_capacity: self.outbound_capacity,
        }
    }
}

impl Config {
    /// Load configuration from the first default path that exists, with
    /// environment overrides applied on top.
    ///
    /// # Errors
    ///
    /// Returns an error if a config file exists but cannot be parsed, or the
    /// result fails [`Config::validate`].
    pub fn load() -> Result<Self> {
        let found = CONFIG_PATHS
            .iter()
            .map(|path| PathBuf::from(shellexpand::tilde(path).as_ref()))
            .find(|path| path.exists());
        Self::load_layered(found.as_deref())
    }

    /// Load configuration from `path` with environment overrides applied on
    /// top.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed, or the result
    /// fails [`Config::validate`].
    pub fn load_from(path: impl AsRef<Path>) -> Result<Self> {
        let expanded = shellexpand::tilde(&path.as_ref().to_string_lossy()).into_owned();
        Self::load_layered(Some(Path::new(&expanded)))
    }

    fn load_layered(file: Option<&Path>) -> Result<Self> {
        let mut builder = config::Config::builder();
        if let Some(path) = file {
            builder = builder.add_source(
                config::File::from(path)
                    .format(config::FileFormat::Toml)
                    .required(true),
            );
        }
        builder = builder.add_source(
            config::Environment::with_prefix("RELAY")
                .separator("__")
                .try_parsing(true),
        );

        let source = file.map_or_else(|| "environment".to_string(), |p| p.display().to_string());
        let config: Config = builder
            .build()
            .and_then(|built| built.try_deserialize::<Config>())
            .with_context(|| format!("Failed to load configuration from {}", source))?;

        config.validate()?;
        Ok(config)
    }

    /// Parse a specific TOML file without environment overrides.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        let config: Config = toml::from_str(&contents)
            .with_context(|| format!("Failed to parse config file: {}", path.display()))?;

        Ok(config)
    }

    /// Reject settings the server cannot run with.
    ///
    /// # Errors
    ///
    /// Returns an error naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        ensure!(
            !self.auth.jwt_secret.is_empty(),
            "auth.jwt_secret must be set (RELAY__AUTH__JWT_SECRET)"
        );
        ensure!(
            !self.auth.cookie_name.is_empty(),
            "auth.cookie_name must not be empty"
        );
        ensure!(
            self.transport.websocket_path.starts_with('/'),
            "transport.websocket_path must start with '/'"
        );
        ensure!(
            self.transport.max_message_size > 0,
            "transport.max_message_size must be positive"
        );
        ensure!(
            self.transport.max_message_size <= MAX_FRAME_SIZE,
            "transport.max_message_size must not exceed {} bytes",
            MAX_FRAME_SIZE
        );
        ensure!(
            self.transport.write_timeout_ms > 0,
            "transport.write_timeout_ms must be positive"
        );
        ensure!(
            self.hub.ingress_capacity > 0,
            "hub.ingress_capacity must be positive"
        );
        ensure!(
            self.hub.outbound_capacity > 0,
            "hub.outbound_capacity must be positive"
        );
        for (name, limit) in [
            ("upgrade", &self.rate_limit.upgrade),
            ("api", &self.rate_limit.api),
        ] {
            ensure!(limit.limit > 0, "rate_limit.{}.limit must be positive", name);
            ensure!(
                limit.window_secs > 0,
                "rate_limit.{}.window_secs must be positive",
                name
            );
        }
        if self.store.backend == StoreBackend::Redis {
            ensure!(
                !self.store.redis_url.is_empty(),
                "store.redis_url must be set for the redis backend"
            );
        }
        Ok(())
    }

    /// Get the socket address to bind to.
    ///
    /// # Errors
    ///
    /// Returns an error if `host:port` is not a socket address.
    pub fn bind_addr(&self) -> Result<SocketAddr> {
        format!("{}:{}", self.host, self.port)
            .parse()
            .with_context(|| format!("Invalid bind address {}:{}", self.host, self.port))
    }
}
