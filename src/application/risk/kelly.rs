use crate::config::{KellyConfig, RegimeAdjustmentsConfig};
use crate::domain::market_regime::MarketRegime;
use crate::infrastructure::persistence::repositories::TradeStats;
use rust_decimal::prelude::FromPrimitive;
use rust_decimal::Decimal;
use tracing::debug;

/// Half-Kelly multiplier applied to the raw Kelly fraction.
const KELLY_MULTIPLIER: f64 = 0.5;

/// Kelly-based dynamic position sizer.
///
/// Below `min_trades` completed round trips the fixed default fraction is
/// used; either way the base fraction is clamped to `[min_pos, max_pos]`
/// and then adjusted by signal confidence, the market-regime multiplier,
/// and the consecutive-loss shrinker.
pub struct KellySizer {
    config: KellyConfig,
    regime_adjustments: RegimeAdjustmentsConfig,
}

impl KellySizer {
    pub fn new(config: KellyConfig, regime_adjustments: RegimeAdjustmentsConfig) -> Self {
        Self {
            config,
            regime_adjustments,
        }
    }

    /// Target fraction of account equity for the next buy.
    pub fn position_fraction(
        &self,
        stats: &TradeStats,
        confidence: f64,
        regime: MarketRegime,
    ) -> Decimal {
        let base = if stats.completed < self.config.min_trades {
            debug!(
                "KellySizer: {} trades < {} required, using default fraction {}",
                stats.completed, self.config.min_trades, self.config.fraction
            );
            self.config.fraction
        } else {
            self.kelly_fraction(stats)
        };

        let clamped = base.clamp(self.config.min_pos, self.config.max_pos);
        let adjusted = clamped
            * confidence.clamp(0.0, 1.0)
            * self.regime_multiplier(regime)
            * loss_shrinker(stats.consecutive_losses);

        Decimal::from_f64(adjusted).unwrap_or(Decimal::ZERO).round_dp(6)
    }

    /// f* = (p*b - q) / b with b = avg_win / |avg_loss|, then half-Kelly.
    fn kelly_fraction(&self, stats: &TradeStats) -> f64 {
        let p = stats.win_rate();
        let q = 1.0 - p;
        let loss = stats.avg_loss.abs();

        let f_star = if loss < f64::EPSILON {
            // No losing trades on record; the payoff ratio is unbounded and
            // f* degenerates to the win rate.
            p
        } else if stats.avg_win <= 0.0 {
            0.0
        } else {
            let b = stats.avg_win / loss;
            (p * b - q) / b
        };

        if f_star <= 0.0 {
            // Negative edge: fall back to the smallest permitted size.
            debug!("KellySizer: non-positive Kelly fraction {f_star:.4}, using min_pos");
            return self.config.min_pos;
        }
        f_star * KELLY_MULTIPLIER
    }

    fn regime_multiplier(&self, regime: MarketRegime) -> f64 {
        match regime {
            MarketRegime::Bull => self.regime_adjustments.bull,
            MarketRegime::Sideways => self.regime_adjustments.sideways,
            MarketRegime::Bear => self.regime_adjustments.bear,
            MarketRegime::HighVolatility => self.regime_adjustments.high_vol,
        }
    }
}

/// Consecutive-loss shrinker: 3 losses halve-and-some, 5 losses cut deep.
fn loss_shrinker(consecutive_losses: usize) -> f64 {
    match consecutive_losses {
        0..=2 => 1.0,
        3..=4 => 0.6,
        _ => 0.3,
    }
}
