//! Environment-driven settings shared by the binaries.

use std::str::FromStr;

use tracing::warn;

use crate::{NumericIdentity, MAXIMAL_ALLOCATION_IDENTITY, MINIMAL_ALLOCATION_IDENTITY};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// `tracing_subscriber::EnvFilter` directive (`IDCACHE_LOG`).
    pub log: String,
    /// Prometheus listener, `host:port` (`IDCACHE_METRICS_ADDR`).
    pub metrics_addr: Option<String>,
    /// When false the cache runs local-only (`IDCACHE_KVSTORE=0`).
    pub kvstore_enabled: bool,
    pub min_id: NumericIdentity,
    pub max_id: NumericIdentity,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            log: "info".to_string(),
            metrics_addr: None,
            kvstore_enabled: true,
            min_id: MINIMAL_ALLOCATION_IDENTITY,
            max_id: MAXIMAL_ALLOCATION_IDENTITY,
        }
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> { std::env::var(name).ok().and_then(|s| s.parse().ok()) }

fn parse_flag(s: &str) -> Option<bool> {
    match s.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
    }
}

impl Config {
    pub fn from_env() -> Self {
        let d = Self::default();
        let log = std::env::var("IDCACHE_LOG").unwrap_or(d.log);
        let metrics_addr = std::env::var("IDCACHE_METRICS_ADDR").ok().filter(|s| !s.is_empty());
        let kvstore_enabled = std::env::var("IDCACHE_KVSTORE")
            .ok()
            .and_then(|s| parse_flag(&s))
            .unwrap_or(d.kvstore_enabled);
        let mut min_id = env_parse::<NumericIdentity>("IDCACHE_MIN_ID").unwrap_or(d.min_id);
        let mut max_id = env_parse::<NumericIdentity>("IDCACHE_MAX_ID").unwrap_or(d.max_id);
        if min_id > max_id || min_id.is_reserved() {
            warn!(min = %min_id, max = %max_id, "invalid identity range; using defaults");
            min_id = d.min_id;
            max_id = d.max_id;
        }
        Self { log, metrics_addr, kvstore_enabled, min_id, max_id }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flags() {
        assert_eq!(parse_flag("0"), Some(false));
        assert_eq!(parse_flag("TRUE"), Some(true));
        assert_eq!(parse_flag("maybe"), None);
    }

    #[test]
    fn defaults_cover_allocation_range() {
        let c = Config::default();
        assert!(c.kvstore_enabled);
        assert_eq!(c.min_id, MINIMAL_ALLOCATION_IDENTITY);
        assert_eq!(c.max_id, MAXIMAL_ALLOCATION_IDENTITY);
    }
}
