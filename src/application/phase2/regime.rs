use crate::application::phase2::scoring::annualized_volatility;
use crate::domain::market_regime::MarketRegime;
use crate::domain::registry::RegimeInputs;

const MA_FAST: usize = 20;
const MA_SLOW: usize = 60;
/// Annualized index volatility above this is its own regime.
const HIGH_VOL_THRESHOLD: f64 = 0.30;
/// Directional spread needed to call a trend.
const TREND_THRESHOLD: f64 = 0.02;

/// Default regime detector (`ma_spread_v1`), driven by the market index:
/// high volatility preempts direction; otherwise the fast/slow moving-
/// average spread labels bull, bear, or sideways.
pub fn detect_regime(inputs: &RegimeInputs) -> MarketRegime {
    let closes = &inputs.index_closes;
    if closes.len() < MA_SLOW {
        return MarketRegime::Sideways;
    }

    if let Some(vol) = annualized_volatility(closes) {
        if vol >= HIGH_VOL_THRESHOLD {
            return MarketRegime::HighVolatility;
        }
    }

    let ma_fast = mean(&closes[closes.len() - MA_FAST..]);
    let ma_slow = mean(&closes[closes.len() - MA_SLOW..]);
    if ma_slow < f64::EPSILON {
        return MarketRegime::Sideways;
    }
    let spread = ma_fast / ma_slow - 1.0;

    if spread >= TREND_THRESHOLD {
        MarketRegime::Bull
    } else if spread <= -TREND_THRESHOLD {
        MarketRegime::Bear
    } else {
        MarketRegime::Sideways
    }
}

fn mean(values: &[f64]) -> f64 {
    if values.is_empty() {
        return 0.0;
    }
    values.iter().sum::<f64>() / values.len() as f64
}
