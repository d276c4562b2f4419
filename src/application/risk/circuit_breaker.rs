use crate::config::CircuitBreakerConfig;
use crate::domain::errors::TradeRejection;
use chrono::{DateTime, Duration, Utc};
use sha2::{Digest, Sha256};
use std::sync::Mutex;
use tracing::{error, info, warn};

/// What tripped the breaker; each trigger carries its own cooldown.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TripReason {
    DailyLoss,
    ConsecutiveLosses,
    ErrorSpike,
    MarketVolatility,
}

impl TripReason {
    pub fn cooldown(&self) -> Duration {
        match self {
            TripReason::DailyLoss => Duration::hours(24),
            TripReason::ConsecutiveLosses => Duration::hours(48),
            TripReason::ErrorSpike => Duration::hours(1),
            TripReason::MarketVolatility => Duration::hours(4),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TripReason::DailyLoss => "daily_loss",
            TripReason::ConsecutiveLosses => "consecutive_losses",
            TripReason::ErrorSpike => "error_spike",
            TripReason::MarketVolatility => "market_volatility",
        }
    }
}

/// Risk inputs evaluated on every engine tick.
#[derive(Debug, Clone, Copy, Default)]
pub struct BreakerInputs {
    /// Signed daily pnl as a fraction of equity (-0.021 = down 2.1%).
    pub daily_pnl_pct: f64,
    pub consecutive_losses: usize,
    pub errors_last_hour: usize,
    /// Absolute single-session index move fraction.
    pub market_move_pct: f64,
}

struct BreakerState {
    tripped: Option<(TripReason, DateTime<Utc>)>,
}

/// Global trading circuit breaker.
///
/// When open, every entry attempt is refused with a structured reason; the
/// breaker auto-resets after the per-trigger cooldown, or earlier via a
/// signed manual reset key.
pub struct CircuitBreaker {
    config: CircuitBreakerConfig,
    reset_secret: Option<String>,
    state: Mutex<BreakerState>,
}

impl CircuitBreaker {
    pub fn new(config: CircuitBreakerConfig, reset_secret: Option<String>) -> Self {
        Self {
            config,
            reset_secret,
            state: Mutex::new(BreakerState { tripped: None }),
        }
    }

    /// Evaluate trip conditions; returns the reason if this call tripped
    /// the breaker (already-open calls return None).
    pub fn evaluate(&self, inputs: &BreakerInputs) -> Option<TripReason> {
        let reason = self.trip_reason(inputs)?;
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.tripped.is_some() {
            return None;
        }
        let until = Utc::now() + reason.cooldown();
        error!(
            "CircuitBreaker: TRIPPED ({}), auto-reset at {}",
            reason.as_str(),
            until
        );
        state.tripped = Some((reason, until));
        Some(reason)
    }

    fn trip_reason(&self, inputs: &BreakerInputs) -> Option<TripReason> {
        if inputs.daily_pnl_pct <= -self.config.daily_loss {
            Some(TripReason::DailyLoss)
        } else if inputs.consecutive_losses >= self.config.consec_losses {
            Some(TripReason::ConsecutiveLosses)
        } else if inputs.errors_last_hour >= self.config.error_spike {
            Some(TripReason::ErrorSpike)
        } else if inputs.market_move_pct >= self.config.market_vol {
            Some(TripReason::MarketVolatility)
        } else {
            None
        }
    }

    /// Gate for new entries. `Ok` when closed; the rejection carries the
    /// trigger and the auto-reset time when open.
    pub fn check(&self) -> Result<(), TradeRejection> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        match state.tripped {
            None => Ok(()),
            Some((reason, until)) => {
                if Utc::now() >= until {
                    info!("CircuitBreaker: cooldown elapsed, auto-reset ({})", reason.as_str());
                    state.tripped = None;
                    return Ok(());
                }
                Err(TradeRejection::CircuitOpen {
                    trigger: reason.as_str().to_string(),
                    until: until.to_rfc3339(),
                })
            }
        }
    }

    pub fn is_open(&self) -> bool {
        self.check().is_err()
    }

    /// Manual reset requires today's signed key from the out-of-band
    /// secret holder.
    pub fn manual_reset(&self, key: &str) -> Result<(), String> {
        let Some(secret) = self.reset_secret.as_deref() else {
            return Err("manual reset not configured".to_string());
        };
        let expected = reset_key(secret, Utc::now().date_naive());
        if key != expected {
            warn!("CircuitBreaker: manual reset rejected (bad key, prefix {})",
                &key.chars().take(8).collect::<String>());
            return Err("invalid reset key".to_string());
        }
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        if state.tripped.take().is_some() {
            info!("CircuitBreaker: manual reset accepted");
        }
        Ok(())
    }
}

/// Day-scoped reset key: sha256(secret || YYYY-MM-DD), hex.
pub fn reset_key(secret: &str, date: chrono::NaiveDate) -> String {
    let mut hasher = Sha256::new();
    hasher.update(secret.as_bytes());
    hasher.update(date.format("%Y-%m-%d").to_string().as_bytes());
    hex::encode(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn breaker() -> CircuitBreaker {
        CircuitBreaker::new(CircuitBreakerConfig::default(), Some("hunter2".to_string()))
    }

    #[test]
    fn test_daily_loss_trips() {
        let cb = breaker();
        let reason = cb.evaluate(&BreakerInputs {
            daily_pnl_pct: -0.0205,
            ..Default::default()
        });
        assert_eq!(reason, Some(TripReason::DailyLoss));
        assert!(cb.is_open());

        match cb.check() {
            Err(TradeRejection::CircuitOpen { trigger, .. }) => {
                assert_eq!(trigger, "daily_loss");
            }
            other => panic!("expected circuit open, got {other:?}"),
        }
    }

    #[test]
    fn test_thresholds_not_crossed_stay_closed() {
        let cb = breaker();
        assert_eq!(
            cb.evaluate(&BreakerInputs {
                daily_pnl_pct: -0.019,
                consecutive_losses: 4,
                errors_last_hour: 2,
                market_move_pct: 0.049,
            }),
            None
        );
        assert!(cb.check().is_ok());
    }

    #[test]
    fn test_consecutive_losses_and_error_spike() {
        let cb = breaker();
        assert_eq!(
            cb.evaluate(&BreakerInputs {
                consecutive_losses: 5,
                ..Default::default()
            }),
            Some(TripReason::ConsecutiveLosses)
        );

        let cb = breaker();
        assert_eq!(
            cb.evaluate(&BreakerInputs {
                errors_last_hour: 3,
                ..Default::default()
            }),
            Some(TripReason::ErrorSpike)
        );

        let cb = breaker();
        assert_eq!(
            cb.evaluate(&BreakerInputs {
                market_move_pct: 0.052,
                ..Default::default()
            }),
            Some(TripReason::MarketVolatility)
        );
    }

    #[test]
    fn test_second_evaluate_does_not_retrip() {
        let cb = breaker();
        let inputs = BreakerInputs {
            daily_pnl_pct: -0.03,
            ..Default::default()
        };
        assert!(cb.evaluate(&inputs).is_some());
        assert!(cb.evaluate(&inputs).is_none());
    }

    #[test]
    fn test_cooldowns_ordering() {
        assert_eq!(TripReason::DailyLoss.cooldown(), Duration::hours(24));
        assert_eq!(TripReason::ConsecutiveLosses.cooldown(), Duration::hours(48));
        assert_eq!(TripReason::ErrorSpike.cooldown(), Duration::hours(1));
        assert_eq!(TripReason::MarketVolatility.cooldown(), Duration::hours(4));
    }

    #[test]
    fn test_manual_reset_with_signed_key() {
        let cb = breaker();
        cb.evaluate(&BreakerInputs {
            daily_pnl_pct: -0.03,
            ..Default::default()
        });
        assert!(cb.is_open());

        assert!(cb.manual_reset("wrong-key").is_err());
        assert!(cb.is_open());

        let key = reset_key("hunter2", Utc::now().date_naive());
        assert!(cb.manual_reset(&key).is_ok());
        assert!(!cb.is_open());
    }

    #[test]
    fn test_manual_reset_unconfigured() {
        let cb = CircuitBreaker::new(CircuitBreakerConfig::default(), None);
        assert!(cb.manual_reset("anything").is_err());
    }
}
