use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Root of the YAML configuration file. Every recognized key is listed
/// here; anything else fails deserialization.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FileConfig {
    pub rate_limit: RateLimitConfig,
    pub cache: CacheSection,
    pub concurrency: ConcurrencyConfig,
    pub phase1: Phase1Config,
    pub phase2: Phase2Config,
    pub risk: RiskConfig,
    pub api: ApiSection,
    pub paths: PathsConfig,
    pub functions: FunctionsConfig,
}

impl FileConfig {
    pub fn from_path(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        let config: FileConfig = serde_yaml::from_str(&raw)
            .with_context(|| format!("Failed to parse config file {}", path.display()))?;
        Ok(config)
    }

    /// Cross-field checks that serde cannot express.
    pub fn validate(&self) -> Result<()> {
        let p = &self.phase2.priority_calculation;
        let priority_sum = p.technical_w + p.volume_w + p.volatility_w;
        if (priority_sum - 1.0).abs() > 1e-6 {
            anyhow::bail!("phase2.priority_calculation weights must sum to 1, got {priority_sum}");
        }
        if self.phase2.batches == 0 {
            anyhow::bail!("phase2.batches must be at least 1");
        }
        let d = &self.risk.drawdown;
        if !(d.warn < d.reduce && d.reduce < d.halt && d.halt < d.close_half && d.close_half < d.close_all)
        {
            anyhow::bail!("risk.drawdown thresholds must be strictly increasing");
        }
        if self.risk.kelly.min_pos >= self.risk.kelly.max_pos {
            anyhow::bail!("risk.kelly.min_pos must be below max_pos");
        }
        if self.api.batch_success_floor <= 0.0 || self.api.batch_success_floor > 1.0 {
            anyhow::bail!("api.batch_success_floor must be in (0, 1]");
        }
        Ok(())
    }
}

/// Governor window caps. `preset` picks one of the two documented broker
/// regimes; explicit per-window values override the preset.
#[derive(Debug, Clone, Deserialize)]
#[serde(try_from = "RawRateLimit")]
pub struct RateLimitConfig {
    pub per_sec: u32,
    pub per_min: u32,
    pub per_hour: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            per_sec: 5,
            per_min: 100,
            per_hour: 1500,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
struct RawRateLimit {
    preset: Option<String>,
    #[serde(alias = "1s")]
    per_sec: Option<u32>,
    #[serde(alias = "1m")]
    per_min: Option<u32>,
    #[serde(alias = "1h")]
    per_hour: Option<u32>,
}

impl TryFrom<RawRateLimit> for RateLimitConfig {
    type Error = anyhow::Error;

    fn try_from(raw: RawRateLimit) -> Result<Self> {
        let (per_sec, per_min, per_hour) = match raw.preset.as_deref() {
            None | Some("standard") => (5, 100, 1500),
            Some("conservative") => (5, 80, 1200),
            Some(other) => anyhow::bail!(
                "Unknown rate_limit.preset '{}': expected 'standard' or 'conservative'",
                other
            ),
        };
        Ok(Self {
            per_sec: raw.per_sec.unwrap_or(per_sec),
            per_min: raw.per_min.unwrap_or(per_min),
            per_hour: raw.per_hour.unwrap_or(per_hour),
        })
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheSection {
    pub ttls: CacheTtlConfig,
}

/// Per-operation-class TTLs, in seconds.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CacheTtlConfig {
    pub price: u64,
    pub ohlcv: u64,
    pub financial: u64,
    pub universe: u64,
}

impl Default for CacheTtlConfig {
    fn default() -> Self {
        Self {
            price: 300,
            ohlcv: 600,
            financial: 21_600,
            universe: 86_400,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ConcurrencyConfig {
    pub brokerage_max_inflight: usize,
}

impl Default for ConcurrencyConfig {
    fn default() -> Self {
        Self {
            brokerage_max_inflight: 10,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Phase1Config {
    pub score_threshold: f64,
    pub max_watchlist: usize,
    pub success_floor: f64,
}

impl Default for Phase1Config {
    fn default() -> Self {
        Self {
            score_threshold: 60.0,
            max_watchlist: 100,
            success_floor: 0.9,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Phase2Config {
    pub batches: usize,
    pub legacy_filter: LegacyFilterConfig,
    pub priority_calculation: PriorityCalcConfig,
    pub composite_weights: CompositeWeightsConfig,
    pub target_counts: TargetCountsConfig,
    pub sector_cap: usize,
}

impl Default for Phase2Config {
    fn default() -> Self {
        Self {
            batches: 18,
            legacy_filter: LegacyFilterConfig::default(),
            priority_calculation: PriorityCalcConfig::default(),
            composite_weights: CompositeWeightsConfig::default(),
            target_counts: TargetCountsConfig::default(),
            sector_cap: 3,
        }
    }
}

/// Safety-filter thresholds. These exist only here; no code path carries a
/// hardcoded copy.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct LegacyFilterConfig {
    pub risk_max: f64,
    pub volume_min: f64,
    pub confidence_min: f64,
    pub technical_min: f64,
}

impl Default for LegacyFilterConfig {
    fn default() -> Self {
        Self {
            risk_max: 70.0,
            volume_min: 30.0,
            confidence_min: 0.6,
            technical_min: 40.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PriorityCalcConfig {
    pub technical_w: f64,
    pub volume_w: f64,
    pub volatility_w: f64,
    pub volatility: VolatilityWindowConfig,
}

impl Default for PriorityCalcConfig {
    fn default() -> Self {
        Self {
            technical_w: 0.5,
            volume_w: 0.3,
            volatility_w: 0.2,
            volatility: VolatilityWindowConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct VolatilityWindowConfig {
    pub min: f64,
    pub max: f64,
    pub scale: f64,
}

impl Default for VolatilityWindowConfig {
    fn default() -> Self {
        Self {
            min: 0.15,
            max: 0.45,
            scale: 2.0,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CompositeWeightsConfig {
    pub technical: f64,
    pub volume: f64,
    pub risk: f64,
    pub confidence: f64,
}

impl Default for CompositeWeightsConfig {
    fn default() -> Self {
        Self {
            technical: 0.4,
            volume: 0.2,
            risk: 0.2,
            confidence: 0.2,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct TargetCountsConfig {
    pub bullish: usize,
    pub neutral: usize,
    pub bearish: usize,
}

impl Default for TargetCountsConfig {
    fn default() -> Self {
        Self {
            bullish: 12,
            neutral: 8,
            bearish: 5,
        }
    }
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RiskConfig {
    pub kelly: KellyConfig,
    pub regime_adjustments: RegimeAdjustmentsConfig,
    pub drawdown: DrawdownConfig,
    pub circuit_breaker: CircuitBreakerConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct KellyConfig {
    /// Fixed fraction used until `min_trades` completed trades exist.
    pub fraction: f64,
    pub min_trades: usize,
    pub min_pos: f64,
    pub max_pos: f64,
}

impl Default for KellyConfig {
    fn default() -> Self {
        Self {
            fraction: 0.05,
            min_trades: 30,
            min_pos: 0.02,
            max_pos: 0.25,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct RegimeAdjustmentsConfig {
    pub bull: f64,
    pub sideways: f64,
    pub bear: f64,
    pub high_vol: f64,
}

impl Default for RegimeAdjustmentsConfig {
    fn default() -> Self {
        Self {
            bull: 1.0,
            sideways: 0.75,
            bear: 0.5,
            high_vol: 0.3,
        }
    }
}

/// Drawdown response thresholds, as fractions of equity.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DrawdownConfig {
    pub warn: f64,
    pub reduce: f64,
    pub halt: f64,
    pub close_half: f64,
    pub close_all: f64,
}

impl Default for DrawdownConfig {
    fn default() -> Self {
        Self {
            warn: 0.03,
            reduce: 0.05,
            halt: 0.08,
            close_half: 0.10,
            close_all: 0.12,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct CircuitBreakerConfig {
    /// Daily loss fraction tripping the breaker.
    pub daily_loss: f64,
    pub consec_losses: usize,
    /// System errors within one hour tripping the breaker.
    pub error_spike: usize,
    /// Single-session index move fraction tripping the breaker.
    pub market_vol: f64,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            daily_loss: 0.02,
            consec_losses: 5,
            error_spike: 3,
            market_vol: 0.05,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ApiSection {
    pub retry: ApiRetryConfig,
    pub batch_success_floor: f64,
}

impl Default for ApiSection {
    fn default() -> Self {
        Self {
            retry: ApiRetryConfig::default(),
            batch_success_floor: 0.9,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ApiRetryConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
}

impl Default for ApiRetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            max_delay_ms: 8_000,
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct PathsConfig {
    pub data_root: String,
}

impl Default for PathsConfig {
    fn default() -> Self {
        Self {
            data_root: "data".to_string(),
        }
    }
}

/// Named implementations resolved through the function registry at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct FunctionsConfig {
    pub screening: String,
    pub volatility_fit: String,
    pub regime: String,
    pub optimizer: String,
}

impl Default for FunctionsConfig {
    fn default() -> Self {
        Self {
            screening: "composite_v2".to_string(),
            volatility_fit: "plateau_v1".to_string(),
            regime: "ma_spread_v1".to_string(),
            optimizer: "risk_parity_v1".to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_validates() {
        let config = FileConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.phase2.batches, 18);
        assert_eq!(config.cache.ttls.financial, 21_600);
        assert_eq!(config.risk.circuit_breaker.consec_losses, 5);
    }

    #[test]
    fn test_window_alias_keys() {
        let yaml = "rate_limit:\n  \"1s\": 4\n  \"1m\": 90\n  \"1h\": 1400\n";
        let config: FileConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.rate_limit.per_sec, 4);
        assert_eq!(config.rate_limit.per_min, 90);
        assert_eq!(config.rate_limit.per_hour, 1400);
    }

    #[test]
    fn test_priority_weights_must_sum_to_one() {
        let yaml = "phase2:\n  priority_calculation:\n    technical_w: 0.6\n";
        let config: FileConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_drawdown_ordering_enforced() {
        let yaml = "risk:\n  drawdown:\n    warn: 0.09\n";
        let config: FileConfig = serde_yaml::from_str(yaml).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_bad_preset_rejected() {
        let yaml = "rate_limit:\n  preset: aggressive\n";
        let result: Result<FileConfig, _> = serde_yaml::from_str(yaml);
        assert!(result.is_err());
    }
}
