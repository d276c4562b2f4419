use thiserror::Error;
use rust_decimal::Decimal;

/// Errors surfaced by the brokerage API facade.
///
/// The retry policy lives in one place (the client); everything else
/// dispatches on these variants instead of inspecting raw responses.
#[derive(Debug, Error)]
pub enum BrokerError {
    #[error("Network error: {0}")]
    Network(#[from] reqwest::Error),

    #[error("Broker HTTP {status}: {body}")]
    Http { status: u16, body: String },

    /// Non-zero `rt_cd` that is neither token-expired nor rate-limit.
    #[error("Broker API error [{code}]: {message}")]
    Api { code: String, message: String },

    #[error("Access token expired (broker code {code})")]
    TokenExpired { code: String },

    #[error("Broker rate limit hit (retry after {retry_after_ms}ms)")]
    RateLimited { retry_after_ms: u64 },

    #[error("Malformed broker response: {reason}")]
    MalformedResponse { reason: String },

    #[error("Request schema violation for {endpoint}: {reason}")]
    SchemaViolation { endpoint: String, reason: String },

    #[error("Token refresh failed after {attempts} attempts: {reason}")]
    RefreshFailed { attempts: u32, reason: String },

    #[error("Batch success rate {rate:.3} below floor {floor:.3}")]
    BatchFloorBreached { rate: f64, floor: f64 },
}

impl BrokerError {
    /// Transient failures are retried by the client; everything else
    /// propagates to the caller untouched.
    pub fn is_transient(&self) -> bool {
        match self {
            BrokerError::Network(_) => true,
            BrokerError::Http { status, .. } => *status >= 500,
            BrokerError::RateLimited { .. } => true,
            _ => false,
        }
    }
}

/// Stock code validation failures.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum CodeError {
    #[error("Invalid stock code '{raw}': {reason}")]
    InvalidStockCode { raw: String, reason: String },
}

/// Structured business-rule rejections.
///
/// These are not errors in the taxonomy sense: they surface to the caller as
/// a reason and are logged, but never retried or escalated.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum TradeRejection {
    #[error("correlation cap: {correlated} open positions above |rho| {threshold}")]
    CorrelationCap { correlated: usize, threshold: f64 },

    #[error("circuit open: {trigger} (cooldown until {until})")]
    CircuitOpen { trigger: String, until: String },

    #[error("drawdown halt: {drawdown_pct:.2}% >= {threshold_pct:.2}%")]
    DrawdownHalt {
        drawdown_pct: f64,
        threshold_pct: f64,
    },

    #[error("sector cap: {sector} already has {count} selections (cap {cap})")]
    SectorCap {
        sector: String,
        count: usize,
        cap: usize,
    },

    #[error("market closed")]
    MarketClosed,

    #[error("insufficient cash: need {need}, available {available}")]
    InsufficientCash { need: Decimal, available: Decimal },
}

/// Invariant violations fall back to safe defaults and emit a high-severity
/// event; they are never silent.
#[derive(Debug, Error)]
pub enum InvariantViolation {
    #[error("Factor weight sum {sum} outside 1 +/- {tolerance}")]
    WeightSum { sum: f64, tolerance: f64 },

    #[error("Factor weight '{factor}' = {value} outside [{min}, {max}]")]
    WeightRange {
        factor: String,
        value: f64,
        min: f64,
        max: f64,
    },

    #[error("Factor weight '{factor}' moved {delta:.4} in one update (max {max:.4})")]
    WeightDelta { factor: String, delta: f64, max: f64 },

    #[error("Checksum mismatch on {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("Corrupted cache entry for key {key}: {reason}")]
    CorruptCacheEntry { key: String, reason: String },

    #[error("Position fraction {fraction} outside [{min}, {max}]")]
    FractionRange {
        fraction: Decimal,
        min: Decimal,
        max: Decimal,
    },
}

/// Errors from artifact inspection; the recovery manager treats any of these
/// as "job not done".
#[derive(Debug, Error)]
pub enum ArtifactError {
    #[error("Artifact missing: {path}")]
    Missing { path: String },

    #[error("Artifact at {path} is stale: stamped {stamped}, expected {expected}")]
    StaleDate {
        path: String,
        stamped: String,
        expected: String,
    },

    #[error("Artifact at {path} unparsable: {reason}")]
    Unparsable { path: String, reason: String },

    #[error("I/O failure on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        let err = BrokerError::Http {
            status: 503,
            body: "gateway".to_string(),
        };
        assert!(err.is_transient());

        let err = BrokerError::Http {
            status: 400,
            body: "bad request".to_string(),
        };
        assert!(!err.is_transient());

        let err = BrokerError::TokenExpired {
            code: "EGW00123".to_string(),
        };
        assert!(!err.is_transient());

        assert!(BrokerError::RateLimited { retry_after_ms: 500 }.is_transient());
    }

    #[test]
    fn test_rejection_formatting() {
        let rejection = TradeRejection::CorrelationCap {
            correlated: 2,
            threshold: 0.7,
        };
        assert!(rejection.to_string().contains("correlation cap"));

        let rejection = TradeRejection::SectorCap {
            sector: "Semiconductors".to_string(),
            count: 3,
            cap: 3,
        };
        let msg = rejection.to_string();
        assert!(msg.contains("Semiconductors"));
        assert!(msg.contains("3"));
    }

    #[test]
    fn test_invariant_formatting() {
        let violation = InvariantViolation::WeightSum {
            sum: 1.07,
            tolerance: 1e-6,
        };
        assert!(violation.to_string().contains("1.07"));
    }
}
