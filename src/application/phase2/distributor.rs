use crate::config::PriorityCalcConfig;
use crate::domain::registry::{VolatilityFitFn, VolatilityFitParams};
use crate::domain::types::StockCode;
use serde::{Deserialize, Serialize};

/// One watchlist stock with its computed batch priority.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PrioritizedStock {
    pub code: StockCode,
    pub sector: String,
    pub priority: f64,
    pub technical: f64,
    pub volume_trend: f64,
    pub volatility: f64,
}

/// Composite batch priority:
/// `technical_w * technical + volume_w * volume_trend + volatility_w * fit`.
/// All three components arrive on a 0..100 scale; the volatility fit maps
/// annualized volatility through the pluggable fit function.
pub fn composite_priority(
    config: &PriorityCalcConfig,
    technical: f64,
    volume_trend: f64,
    volatility: f64,
    fit: &VolatilityFitFn,
) -> f64 {
    let params = VolatilityFitParams {
        optimal_min: config.volatility.min,
        optimal_max: config.volatility.max,
        scale_factor: config.volatility.scale,
    };
    let volatility_fit = fit(volatility, &params) * 100.0;
    config.technical_w * technical
        + config.volume_w * volume_trend
        + config.volatility_w * volatility_fit
}

/// Default volatility-fit implementation (`plateau_v1`): 1.0 inside the
/// optimal band, decaying linearly with normalized distance outside it,
/// steeper for larger `scale_factor`.
pub fn plateau_volatility_fit(volatility: f64, params: &VolatilityFitParams) -> f64 {
    let span = (params.optimal_max - params.optimal_min).max(f64::EPSILON);
    let distance = if volatility < params.optimal_min {
        (params.optimal_min - volatility) / span
    } else if volatility > params.optimal_max {
        (volatility - params.optimal_max) / span
    } else {
        return 1.0;
    };
    (1.0 - params.scale_factor * distance).clamp(0.0, 1.0)
}

/// Split prioritized stocks into `batches` time-spaced batches.
///
/// Sorted by priority descending (ties by code), then dealt round-robin so
/// every batch carries a similar aggregate priority. Deterministic for a
/// given input set.
pub fn distribute(mut stocks: Vec<PrioritizedStock>, batches: usize) -> Vec<Vec<PrioritizedStock>> {
    let batches = batches.max(1);
    stocks.sort_by(|a, b| {
        b.priority
            .partial_cmp(&a.priority)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.code.cmp(&b.code))
    });

    let mut out: Vec<Vec<PrioritizedStock>> = (0..batches).map(|_| Vec::new()).collect();
    for (i, stock) in stocks.into_iter().enumerate() {
        out[i % batches].push(stock);
    }
    out
}
