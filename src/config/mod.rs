//! Configuration for kquant.
//!
//! Tunables come from a YAML file (unknown keys rejected at startup,
//! defaults applied to any missing recognized key); credentials and
//! environment selection come from environment variables.

mod broker_env;
mod file;

pub use broker_env::{BrokerEnv, Environment, NotifierEnv};
pub use file::{
    ApiRetryConfig, CacheTtlConfig, CircuitBreakerConfig, CompositeWeightsConfig,
    ConcurrencyConfig, DrawdownConfig, FileConfig, FunctionsConfig, KellyConfig,
    LegacyFilterConfig, Phase1Config, Phase2Config, PathsConfig, PriorityCalcConfig,
    RateLimitConfig, RegimeAdjustmentsConfig, RiskConfig, TargetCountsConfig,
    VolatilityWindowConfig,
};

use anyhow::{Context, Result};
use std::path::Path;

/// Fully resolved application configuration.
#[derive(Debug, Clone)]
pub struct Config {
    pub file: FileConfig,
    pub broker: BrokerEnv,
    pub notifier: NotifierEnv,
    pub redis_url: Option<String>,
    pub database_url: String,
    pub db_pool_size: u32,
    pub structured_logging: bool,
}

impl Config {
    /// Load the YAML file (if present) and compose with environment
    /// variables. A missing file means all-defaults; a malformed or
    /// unknown-key file is a startup error (exit code 2).
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let file = match config_path {
            Some(path) => FileConfig::from_path(path)?,
            None => FileConfig::default(),
        };
        file.validate()?;

        let broker = BrokerEnv::from_env().context("Failed to load brokerage credentials")?;
        let notifier = NotifierEnv::from_env().context("Failed to load notifier credentials")?;

        let redis_url = std::env::var("REDIS_URL").ok();
        let database_url = std::env::var("DATABASE_URL")
            .unwrap_or_else(|_| "sqlite://data/kquant.db".to_string());
        let db_pool_size = std::env::var("DB_POOL_SIZE")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(5);
        let structured_logging = std::env::var("LOG_JSON")
            .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
            .unwrap_or(false);

        Ok(Self {
            file,
            broker,
            notifier,
            redis_url,
            database_url,
            db_pool_size,
            structured_logging,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn write_config(yaml: &str) -> tempfile::NamedTempFile {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        f.write_all(yaml.as_bytes()).unwrap();
        f
    }

    #[test]
    fn test_defaults_when_sections_missing() {
        let f = write_config("phase2:\n  batches: 12\n");
        let config = FileConfig::from_path(f.path()).unwrap();
        assert_eq!(config.phase2.batches, 12);
        // Untouched sections fall back to defaults.
        assert_eq!(config.rate_limit.per_sec, 5);
        assert_eq!(config.phase2.sector_cap, 3);
    }

    #[test]
    fn test_unknown_keys_rejected() {
        let f = write_config("phase2:\n  batchez: 12\n");
        assert!(FileConfig::from_path(f.path()).is_err());

        let f = write_config("not_a_section: true\n");
        assert!(FileConfig::from_path(f.path()).is_err());
    }

    #[test]
    fn test_preset_selects_caps() {
        let f = write_config("rate_limit:\n  preset: conservative\n");
        let config = FileConfig::from_path(f.path()).unwrap();
        assert_eq!(config.rate_limit.per_min, 80);
        assert_eq!(config.rate_limit.per_hour, 1200);

        let f = write_config("rate_limit:\n  preset: standard\n");
        let config = FileConfig::from_path(f.path()).unwrap();
        assert_eq!(config.rate_limit.per_min, 100);
        assert_eq!(config.rate_limit.per_hour, 1500);
    }

    #[test]
    fn test_explicit_caps_override_preset() {
        let f = write_config("rate_limit:\n  preset: conservative\n  per_min: 60\n");
        let config = FileConfig::from_path(f.path()).unwrap();
        assert_eq!(config.rate_limit.per_min, 60);
        assert_eq!(config.rate_limit.per_hour, 1200);
    }
}
