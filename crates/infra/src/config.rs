//! Process configuration read from the environment.

use std::time::Duration;

use flashsale_core::{ConfigError, IdGenerator};

pub const DEFAULT_REDIS_URL: &str = "redis://127.0.0.1:6379";
pub const DEFAULT_SNOWFLAKE_EPOCH: &str = "2023-12-01";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AppConfig {
    /// Postgres URL. Without it the process runs on in-memory stores.
    pub database_url: Option<String>,
    pub redis_url: String,
    /// Id-generator epoch, `YYYY-MM-DD`.
    pub snowflake_epoch: String,
    pub snowflake_node: i64,
    pub cache_ttl_base: Duration,
    pub cache_ttl_jitter: Duration,
    /// Consumers on the flash-sale intake queue.
    pub intake_workers: usize,
    pub intake_max_deliveries: u32,
    /// How long a consumer waits for a message before re-checking for shutdown.
    pub intake_poll: Duration,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            redis_url: DEFAULT_REDIS_URL.to_string(),
            snowflake_epoch: DEFAULT_SNOWFLAKE_EPOCH.to_string(),
            snowflake_node: 1,
            cache_ttl_base: Duration::from_secs(600),
            cache_ttl_jitter: Duration::from_secs(60),
            intake_workers: 2,
            intake_max_deliveries: 5,
            intake_poll: Duration::from_millis(1000),
        }
    }
}

impl AppConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from an arbitrary key lookup; unset or blank keys take their default.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|v| !v.trim().is_empty());
        let defaults = Self::default();

        let config = Self {
            database_url: get("DATABASE_URL"),
            redis_url: get("REDIS_URL").unwrap_or(defaults.redis_url),
            snowflake_epoch: get("SNOWFLAKE_EPOCH").unwrap_or(defaults.snowflake_epoch),
            snowflake_node: parse_or("SNOWFLAKE_NODE", get("SNOWFLAKE_NODE"), defaults.snowflake_node)?,
            cache_ttl_base: parse_or("CACHE_TTL_BASE_SECS", get("CACHE_TTL_BASE_SECS"), 600u64)
                .map(Duration::from_secs)?,
            cache_ttl_jitter: parse_or("CACHE_TTL_JITTER_SECS", get("CACHE_TTL_JITTER_SECS"), 60u64)
                .map(Duration::from_secs)?,
            intake_workers: parse_or("INTAKE_WORKERS", get("INTAKE_WORKERS"), defaults.intake_workers)?,
            intake_max_deliveries: parse_or(
                "INTAKE_MAX_DELIVERIES",
                get("INTAKE_MAX_DELIVERIES"),
                defaults.intake_max_deliveries,
            )?,
            intake_poll: parse_or("INTAKE_POLL_MS", get("INTAKE_POLL_MS"), 1000u64)
                .map(Duration::from_millis)?,
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.intake_workers == 0 {
            return Err(ConfigError::invalid("INTAKE_WORKERS", "must be at least 1"));
        }
        if self.intake_max_deliveries == 0 {
            return Err(ConfigError::invalid("INTAKE_MAX_DELIVERIES", "must be at least 1"));
        }
        if self.intake_poll.is_zero() {
            return Err(ConfigError::invalid("INTAKE_POLL_MS", "must be positive"));
        }
        if self.cache_ttl_base.is_zero() {
            return Err(ConfigError::invalid("CACHE_TTL_BASE_SECS", "must be positive"));
        }
        Ok(())
    }

    /// Fails on a malformed or future epoch, or a node outside the valid range.
    pub fn id_generator(&self) -> Result<IdGenerator, ConfigError> {
        IdGenerator::new(&self.snowflake_epoch, self.snowflake_node)
    }
}

fn parse_or<T>(key: &'static str, raw: Option<String>, default: T) -> Result<T, ConfigError>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match raw {
        None => Ok(default),
        Some(v) => v
            .trim()
            .parse()
            .map_err(|e: T::Err| ConfigError::invalid(key, format!("'{v}': {e}"))),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(pairs: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn empty_environment_yields_defaults() {
        let config = AppConfig::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config, AppConfig::default());
        assert!(config.id_generator().is_ok());
    }

    #[test]
    fn values_are_parsed() {
        let config = AppConfig::from_lookup(lookup(&[
            ("DATABASE_URL", "postgres://localhost/flashsale"),
            ("SNOWFLAKE_NODE", "7"),
            ("CACHE_TTL_BASE_SECS", "30"),
            ("INTAKE_WORKERS", "4"),
            ("INTAKE_POLL_MS", "250"),
        ]))
        .unwrap();
        assert_eq!(config.database_url.as_deref(), Some("postgres://localhost/flashsale"));
        assert_eq!(config.snowflake_node, 7);
        assert_eq!(config.cache_ttl_base, Duration::from_secs(30));
        assert_eq!(config.intake_workers, 4);
        assert_eq!(config.intake_poll, Duration::from_millis(250));
    }

    #[test]
    fn garbage_is_a_config_error() {
        let err = AppConfig::from_lookup(lookup(&[("INTAKE_WORKERS", "many")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { key: "INTAKE_WORKERS", .. }));

        let err = AppConfig::from_lookup(lookup(&[("INTAKE_WORKERS", "0")])).unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { .. }));
    }

    #[test]
    fn bad_epoch_fails_when_building_the_generator() {
        let config = AppConfig::from_lookup(lookup(&[("SNOWFLAKE_EPOCH", "01/12/2023")])).unwrap();
        assert!(matches!(
            config.id_generator(),
            Err(ConfigError::InvalidEpoch { .. })
        ));

        let config = AppConfig::from_lookup(lookup(&[("SNOWFLAKE_NODE", "4096")])).unwrap();
        assert!(matches!(
            config.id_generator(),
            Err(ConfigError::NodeOutOfRange { .. })
        ));
    }
}
