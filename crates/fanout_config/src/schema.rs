use serde::{Deserialize, Serialize};

/// `server.host` / `server.port` — where the forward proxy listens for
/// client connections.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ServerSection {
    pub host: String,
    pub port: u16,
}

/// One entry of the `proxies` array: an upstream SOCKS5 proxy the
/// dispatcher may route traffic through.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq, Eq, Hash)]
pub struct ProxyEntry {
    pub host: String,
    pub port: u16,
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub password: Option<String>,
}

impl ProxyEntry {
    /// The `"host:port"` fingerprint used as this proxy's identity key
    /// throughout the registry.
    pub fn key(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// The full JSON configuration document.
///
/// Required keys have no `#[serde(default)]` so a missing one surfaces as
/// a deserialize error, which `loader::load` turns into
/// `ConfigError::Invalid` at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FanoutConfig {
    pub server: ServerSection,
    pub proxies: Vec<ProxyEntry>,
    pub health_check_interval: f64,
    pub max_retries: u32,

    #[serde(default = "default_algorithm")]
    pub load_balancing_algorithm: String,
    #[serde(default = "default_connection_timeout")]
    pub connection_timeout: f64,
    #[serde(default = "default_overload_backoff_base_secs")]
    pub overload_backoff_base_secs: f64,
    #[serde(default)]
    pub rest_check_interval: Option<f64>,
    #[serde(default = "default_ssl_cert")]
    pub ssl_cert: String,
    #[serde(default = "default_ssl_key")]
    pub ssl_key: String,
    #[serde(default = "default_proxy_pool_max_per_addr")]
    pub proxy_pool_max_per_addr: usize,

    // Observability cadences (non-core; consumed by the CLI's stats
    // reporter, not by the traffic-routing engine).
    #[serde(default = "default_stats_interval")]
    pub stats_interval: f64,
    #[serde(default = "default_monitoring_interval")]
    pub monitoring_interval: f64,
    #[serde(default = "default_stats_log_interval")]
    pub stats_log_interval: f64,
    #[serde(default = "default_console_stats_interval")]
    pub console_stats_interval: f64,
    #[serde(default)]
    pub compact_console_stats: bool,
}

impl FanoutConfig {
    /// `rest_check_interval`'s effective value: the configured override,
    /// or `health_check_interval / 6`.
    pub fn rest_check_interval(&self) -> f64 {
        self.rest_check_interval
            .unwrap_or(self.health_check_interval / 6.0)
    }

    /// The tick cadence of the health checker: the faster of the two
    /// configured intervals.
    pub fn health_checker_tick_secs(&self) -> f64 {
        self.health_check_interval.min(self.rest_check_interval())
    }
}

fn default_algorithm() -> String {
    "random".to_string()
}

fn default_connection_timeout() -> f64 {
    5.0
}

fn default_overload_backoff_base_secs() -> f64 {
    30.0
}

fn default_ssl_cert() -> String {
    "cert.pem".to_string()
}

fn default_ssl_key() -> String {
    "key.pem".to_string()
}

fn default_proxy_pool_max_per_addr() -> usize {
    20
}

fn default_stats_interval() -> f64 {
    30.0
}

fn default_monitoring_interval() -> f64 {
    10.0
}

fn default_stats_log_interval() -> f64 {
    60.0
}

fn default_console_stats_interval() -> f64 {
    30.0
}
