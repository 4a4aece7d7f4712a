use std::collections::HashSet;

use crate::error::ConfigError;
use crate::schema::FanoutConfig;

/// Validate a parsed configuration: non-empty proxy set, unique
/// `"host:port"` keys, sane ports, a selector name the factory can
/// resolve (or fall back from, with a warning — see
/// `fanout_registry::selector::SelectorFactory`).
///
/// Startup-fatal: any violation aborts the process rather than
/// degrading gracefully.
pub fn validate(cfg: &FanoutConfig) -> Result<(), ConfigError> {
    if cfg.server.host.trim().is_empty() {
        return Err(ConfigError::Invalid("server.host must not be empty".into()));
    }
    if cfg.server.port == 0 {
        return Err(ConfigError::Invalid("server.port must be nonzero".into()));
    }

    if cfg.proxies.is_empty() {
        return Err(ConfigError::Invalid(
            "proxies must contain at least one upstream SOCKS5 proxy".into(),
        ));
    }

    let mut seen = HashSet::new();
    for proxy in &cfg.proxies {
        if proxy.host.trim().is_empty() {
            return Err(ConfigError::Invalid(
                "a proxy entry has an empty host".into(),
            ));
        }
        if proxy.port == 0 {
            return Err(ConfigError::Invalid(format!(
                "proxy '{}' has an invalid port 0",
                proxy.host
            )));
        }
        if !seen.insert(proxy.key()) {
            return Err(ConfigError::Invalid(format!(
                "duplicate proxy entry '{}'",
                proxy.key()
            )));
        }
    }

    if cfg.health_check_interval <= 0.0 {
        return Err(ConfigError::Invalid(
            "health_check_interval must be positive".into(),
        ));
    }

    if cfg.max_retries == 0 {
        return Err(ConfigError::Invalid("max_retries must be at least 1".into()));
    }

    Ok(())
}

/// Normalize `load_balancing_algorithm` to a known selector name,
/// returning `None` (and letting the caller warn) for anything else.
/// `fanout_registry::selector::SelectorFactory::create` applies the same
/// fallback; this helper exists so config validation and selector
/// construction agree without duplicating the match arms.
pub fn known_selector_name(name: &str) -> Option<&'static str> {
    match name.to_ascii_lowercase().as_str() {
        "random" => Some("random"),
        "round_robin" => Some("round_robin"),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::schema::{ProxyEntry, ServerSection};

    fn base_config() -> FanoutConfig {
        FanoutConfig {
            server: ServerSection {
                host: "0.0.0.0".into(),
                port: 8080,
            },
            proxies: vec![ProxyEntry {
                host: "10.0.0.1".into(),
                port: 1080,
                username: None,
                password: None,
            }],
            health_check_interval: 30.0,
            max_retries: 3,
            load_balancing_algorithm: "random".into(),
            connection_timeout: 5.0,
            overload_backoff_base_secs: 30.0,
            rest_check_interval: None,
            ssl_cert: "cert.pem".into(),
            ssl_key: "key.pem".into(),
            proxy_pool_max_per_addr: 20,
            stats_interval: 30.0,
            monitoring_interval: 10.0,
            stats_log_interval: 60.0,
            console_stats_interval: 30.0,
            compact_console_stats: false,
        }
    }

    #[test]
    fn accepts_a_well_formed_config() {
        assert!(validate(&base_config()).is_ok());
    }

    #[test]
    fn rejects_empty_proxy_list() {
        let mut cfg = base_config();
        cfg.proxies.clear();
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn rejects_duplicate_proxy_keys() {
        let mut cfg = base_config();
        cfg.proxies.push(cfg.proxies[0].clone());
        assert!(validate(&cfg).is_err());
    }

    #[test]
    fn unknown_selector_falls_back_to_none() {
        assert_eq!(known_selector_name("RANDOM"), Some("random"));
        assert_eq!(known_selector_name("round_robin"), Some("round_robin"));
        assert_eq!(known_selector_name("least_conn"), None);
    }
}
