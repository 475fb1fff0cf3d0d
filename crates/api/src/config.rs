//! Process configuration from environment variables.
//!
//! | Variable | Default |
//! |----------|---------|
//! | `STOCKLEDGER_BIND_ADDR` | `0.0.0.0:8080` |
//! | `USE_PERSISTENT_STORES` | `false` |
//! | `DATABASE_URL` | required when persistent |
//! | `STOCKLEDGER_CONFLICT_RETRIES` | `3` |
//! | `STOCKLEDGER_REFRESH_SECS` | `30` (`0` disables the refresh task) |
//!
//! Unparseable values fall back to the default with a warning.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use stockledger_infra::dispatcher::DEFAULT_CONFLICT_RETRIES;

pub const DEFAULT_BIND_ADDR: &str = "0.0.0.0:8080";
pub const DEFAULT_REFRESH_SECS: u64 = 30;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ApiConfig {
    pub bind_addr: SocketAddr,
    pub use_persistent_stores: bool,
    pub database_url: Option<String>,
    pub conflict_retries: u32,
    /// `None` disables the periodic stock view refresh.
    pub refresh_interval: Option<Duration>,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self {
            bind_addr: SocketAddr::from(([0, 0, 0, 0], 8080)),
            use_persistent_stores: false,
            database_url: None,
            conflict_retries: DEFAULT_CONFLICT_RETRIES,
            refresh_interval: Some(Duration::from_secs(DEFAULT_REFRESH_SECS)),
        }
    }
}

impl ApiConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup (the environment in production, a map in tests).
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let defaults = Self::default();

        let refresh_secs = parse_or(&lookup, "STOCKLEDGER_REFRESH_SECS", DEFAULT_REFRESH_SECS);

        Self {
            bind_addr: parse_or(&lookup, "STOCKLEDGER_BIND_ADDR", defaults.bind_addr),
            use_persistent_stores: parse_or(&lookup, "USE_PERSISTENT_STORES", false),
            database_url: lookup("DATABASE_URL").filter(|s| !s.trim().is_empty()),
            conflict_retries: parse_or(&lookup, "STOCKLEDGER_CONFLICT_RETRIES", defaults.conflict_retries),
            refresh_interval: (refresh_secs > 0).then(|| Duration::from_secs(refresh_secs)),
        }
    }
}

fn parse_or<T>(lookup: &impl Fn(&str) -> Option<String>, key: &str, default: T) -> T
where
    T: FromStr + std::fmt::Debug,
{
    match lookup(key) {
        None => default,
        Some(raw) => match raw.trim().parse() {
            Ok(v) => v,
            Err(_) => {
                tracing::warn!(key, value = %raw, default = ?default, "invalid config value, using default");
                default
            }
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn config(pairs: &[(&str, &str)]) -> ApiConfig {
        let env: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        ApiConfig::from_lookup(|k| env.get(k).cloned())
    }

    #[test]
    fn empty_environment_gives_defaults() {
        let cfg = config(&[]);
        assert_eq!(cfg, ApiConfig::default());
        assert_eq!(cfg.bind_addr.to_string(), DEFAULT_BIND_ADDR);
    }

    #[test]
    fn values_are_read() {
        let cfg = config(&[
            ("STOCKLEDGER_BIND_ADDR", "127.0.0.1:9000"),
            ("USE_PERSISTENT_STORES", "true"),
            ("DATABASE_URL", "postgres://localhost/stock"),
            ("STOCKLEDGER_CONFLICT_RETRIES", "7"),
            ("STOCKLEDGER_REFRESH_SECS", "0"),
        ]);
        assert_eq!(cfg.bind_addr.port(), 9000);
        assert!(cfg.use_persistent_stores);
        assert_eq!(cfg.database_url.as_deref(), Some("postgres://localhost/stock"));
        assert_eq!(cfg.conflict_retries, 7);
        assert_eq!(cfg.refresh_interval, None);
    }

    #[test]
    fn garbage_falls_back_to_defaults() {
        let cfg = config(&[
            ("STOCKLEDGER_BIND_ADDR", "not-an-address"),
            ("USE_PERSISTENT_STORES", "yes please"),
            ("STOCKLEDGER_CONFLICT_RETRIES", "-1"),
            ("STOCKLEDGER_REFRESH_SECS", "soon"),
        ]);
        assert_eq!(cfg, ApiConfig::default());
    }
}
