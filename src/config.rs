use serde::Deserialize;
use std::time::Duration;

/// Main configuration for the telemetry gateway
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Service configuration
    #[serde(default)]
    pub service: ServiceConfig,
    /// Gateway (socket) configuration
    #[serde(default)]
    pub gateway: GatewayConfig,
    /// Ingestion buffer configuration
    #[serde(default)]
    pub buffer: BufferConfig,
    /// Database configuration
    #[serde(default)]
    pub database: DatabaseConfig,
}

/// Service-level configuration
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Service name for logging/metrics
    #[serde(default = "default_service_name")]
    pub name: String,
    /// Log level (trace, debug, info, warn, error)
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Prometheus metrics port
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
}

/// Connection gateway configuration
#[derive(Debug, Clone, Deserialize)]
pub struct GatewayConfig {
    /// Listen address
    #[serde(default = "default_host")]
    pub host: String,
    /// Listen port
    #[serde(default = "default_port")]
    pub port: u16,
    /// Interval between liveness checks in milliseconds
    #[serde(default = "default_health_check_interval_ms")]
    pub health_check_interval_ms: u64,
    /// Grace period without a pong before a connection is terminated
    #[serde(default = "default_pong_timeout_ms")]
    pub pong_timeout_ms: u64,
    /// Block duration installed by a force-disconnect
    #[serde(default = "default_block_duration_ms")]
    pub block_duration_ms: u64,
    /// Delay between the force-disconnect notice and the close frame
    #[serde(default = "default_close_grace_ms")]
    pub close_grace_ms: u64,
    /// Enable CORS on the status API
    #[serde(default = "default_true")]
    pub cors_enabled: bool,
}

/// Ingestion buffer configuration
#[derive(Debug, Clone, Deserialize)]
pub struct BufferConfig {
    /// Buffered readings that trigger an immediate flush
    #[serde(default = "default_flush_threshold")]
    pub flush_threshold: usize,
    /// Timer-driven flush interval in milliseconds
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    /// Hard cap on buffered readings; overflow drops the oldest
    #[serde(default = "default_max_buffered")]
    pub max_buffered: usize,
    /// Loss-rate ratio above which a warning is logged
    #[serde(default = "default_loss_warn_ratio")]
    pub loss_warn_ratio: f64,
}

/// Database configuration
#[derive(Debug, Clone, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite connection URL
    #[serde(default = "default_database_url")]
    pub url: String,
    /// Maximum number of connections in the pool
    #[serde(default = "default_max_connections")]
    pub max_connections: u32,
    /// Connection timeout in seconds
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    /// Run migrations on startup
    #[serde(default = "default_true")]
    pub run_migrations: bool,
}

// Default value functions
fn default_service_name() -> String {
    "telemetry-gateway".to_string()
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_metrics_port() -> u16 {
    9090
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_health_check_interval_ms() -> u64 {
    30000
}

fn default_pong_timeout_ms() -> u64 {
    60000
}

fn default_block_duration_ms() -> u64 {
    60000
}

fn default_close_grace_ms() -> u64 {
    100
}

fn default_flush_threshold() -> usize {
    1000
}

fn default_flush_interval_ms() -> u64 {
    5000
}

fn default_max_buffered() -> usize {
    100_000
}

fn default_loss_warn_ratio() -> f64 {
    0.005
}

fn default_database_url() -> String {
    "sqlite://telemetry.db?mode=rwc".to_string()
}

fn default_max_connections() -> u32 {
    5
}

fn default_connect_timeout_secs() -> u64 {
    30
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from environment and config files
    pub fn load() -> anyhow::Result<Self> {
        let config = config::Config::builder()
            .add_source(config::File::with_name("config/gateway").required(false))
            .add_source(config::File::with_name("/etc/telemetry/gateway").required(false))
            // TELEMETRY__BUFFER__FLUSH_THRESHOLD -> buffer.flush_threshold
            .add_source(
                config::Environment::with_prefix("TELEMETRY")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        config.try_deserialize().map_err(Into::into)
    }

    /// Get the flush interval as a Duration
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.buffer.flush_interval_ms)
    }

    /// Get the health-check interval as a Duration
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_millis(self.gateway.health_check_interval_ms)
    }

    /// Get the pong grace period as a Duration
    pub fn pong_timeout(&self) -> Duration {
        Duration::from_millis(self.gateway.pong_timeout_ms)
    }

    /// Get the database connect timeout as a Duration
    pub fn db_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.database.connect_timeout_secs)
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service: ServiceConfig::default(),
            gateway: GatewayConfig::default(),
            buffer: BufferConfig::default(),
            database: DatabaseConfig::default(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            log_level: default_log_level(),
            metrics_port: default_metrics_port(),
        }
    }
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            health_check_interval_ms: default_health_check_interval_ms(),
            pong_timeout_ms: default_pong_timeout_ms(),
            block_duration_ms: default_block_duration_ms(),
            close_grace_ms: default_close_grace_ms(),
            cors_enabled: default_true(),
        }
    }
}

impl Default for BufferConfig {
    fn default() -> Self {
        Self {
            flush_threshold: default_flush_threshold(),
            flush_interval_ms: default_flush_interval_ms(),
            max_buffered: default_max_buffered(),
            loss_warn_ratio: default_loss_warn_ratio(),
        }
    }
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            url: default_database_url(),
            max_connections: default_max_connections(),
            connect_timeout_secs: default_connect_timeout_secs(),
            run_migrations: default_true(),
        }
    }
}
