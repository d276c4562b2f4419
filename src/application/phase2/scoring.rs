use crate::domain::factors::{FactorScores, FactorWeights};
use crate::domain::types::{Candle, StockCode};
use crate::infrastructure::broker::FinancialRatios;
use rust_decimal::prelude::ToPrimitive;
use statrs::statistics::Statistics;

/// Composite scale parameters: mean 50, stdev 15, clamped to [0, 100].
const SCALE_MEAN: f64 = 50.0;
const SCALE_STDEV: f64 = 15.0;

const MOMENTUM_WINDOW: usize = 20;
const VOLUME_FAST: usize = 5;
const VOLUME_SLOW: usize = 20;
const MA_FAST: usize = 20;
const MA_SLOW: usize = 60;
/// Trading days per year, for annualizing volatility.
const ANNUALIZATION: f64 = 252.0;

/// Raw (un-normalized) values for the seven factors, computed from daily
/// candles (oldest first), the latest financial ratios, and an aligned
/// market-index close series. Returns None when there is not enough
/// history to evaluate the slowest window.
pub fn raw_factors(
    candles: &[Candle],
    financials: &FinancialRatios,
    index_closes: &[f64],
) -> Option<FactorScores> {
    if candles.len() < MA_SLOW + 1 {
        return None;
    }
    let closes: Vec<f64> = candles.iter().filter_map(|c| c.close.to_f64()).collect();
    let volumes: Vec<f64> = candles.iter().map(|c| c.volume as f64).collect();
    if closes.len() != candles.len() {
        return None;
    }
    let last = *closes.last()?;

    let momentum = window_return(&closes, MOMENTUM_WINDOW)?;

    // Value: cheaper multiples score higher; absent data scores neutral.
    let value = {
        let per_component = financials.per.filter(|p| *p > 0.0).map(|p| 1.0 / p).unwrap_or(0.0);
        let pbr_component = financials.pbr.filter(|p| *p > 0.0).map(|p| 1.0 / p).unwrap_or(0.0);
        per_component + pbr_component
    };

    let quality = financials.roe.unwrap_or(0.0);

    let volume = {
        let fast = trailing_mean(&volumes, VOLUME_FAST)?;
        let slow = trailing_mean(&volumes, VOLUME_SLOW)?;
        if slow < f64::EPSILON {
            0.0
        } else {
            fast / slow - 1.0
        }
    };

    let volatility = annualized_volatility(&closes)?;

    let technical = {
        let ma_fast = trailing_mean(&closes, MA_FAST)?;
        let ma_slow = trailing_mean(&closes, MA_SLOW)?;
        (last / ma_fast - 1.0) + (last / ma_slow - 1.0)
    };

    let market_strength = {
        let index_return = window_return(index_closes, MOMENTUM_WINDOW).unwrap_or(0.0);
        momentum - index_return
    };

    Some(FactorScores {
        momentum,
        value,
        quality,
        volume,
        volatility,
        technical,
        market_strength,
    })
}

/// Annualized standard deviation of daily log-free returns.
pub fn annualized_volatility(closes: &[f64]) -> Option<f64> {
    if closes.len() < VOLUME_SLOW {
        return None;
    }
    let returns: Vec<f64> = closes
        .windows(2)
        .filter(|w| w[0] > f64::EPSILON)
        .map(|w| w[1] / w[0] - 1.0)
        .collect();
    if returns.len() < 2 {
        return None;
    }
    Some(returns.as_slice().std_dev() * ANNUALIZATION.sqrt())
}

fn window_return(closes: &[f64], window: usize) -> Option<f64> {
    if closes.len() < window + 1 {
        return None;
    }
    let past = closes[closes.len() - window - 1];
    let last = *closes.last()?;
    if past < f64::EPSILON {
        return None;
    }
    Some(last / past - 1.0)
}

fn trailing_mean(values: &[f64], window: usize) -> Option<f64> {
    if values.len() < window {
        return None;
    }
    Some(values[values.len() - window..].iter().sum::<f64>() / window as f64)
}

/// A candidate after batch-relative normalization and weighting.
#[derive(Debug, Clone)]
pub struct ScoredCandidate {
    pub code: StockCode,
    pub sector: String,
    pub priority: f64,
    pub factors: FactorScores,
    pub composite: f64,
    pub risk_score: f64,
    pub volume_score: f64,
    pub technical_score: f64,
    pub confidence: f64,
    pub signal_count: u32,
}

/// Score one batch: z-score every factor across the batch's candidates,
/// combine with the active weight vector, and map the result onto the
/// common 0..100 scale (mean 50, stdev 15).
pub fn score_batch(
    candidates: Vec<(StockCode, String, f64, FactorScores)>,
    weights: &FactorWeights,
) -> Vec<ScoredCandidate> {
    if candidates.is_empty() {
        return Vec::new();
    }

    // Per-factor z-scores across the batch.
    let columns: Vec<Vec<f64>> = (0..7)
        .map(|f| candidates.iter().map(|(_, _, _, s)| s.as_array()[f]).collect())
        .collect();
    let stats: Vec<(f64, f64)> = columns
        .iter()
        .map(|column| (column.as_slice().mean(), column.as_slice().std_dev()))
        .collect();

    let zscores: Vec<FactorScores> = candidates
        .iter()
        .map(|(_, _, _, scores)| {
            let mut z = [0.0f64; 7];
            for (f, value) in scores.as_array().iter().enumerate() {
                let (mean, std) = stats[f];
                z[f] = if std.is_finite() && std > f64::EPSILON {
                    (value - mean) / std
                } else {
                    0.0
                };
            }
            FactorScores::from_array(z)
        })
        .collect();

    // Weighted composite, itself normalized across the batch before the
    // final 50/15 mapping.
    let raw_composites: Vec<f64> = zscores.iter().map(|z| weights.combine(z)).collect();
    let composite_mean = raw_composites.as_slice().mean();
    let composite_std = raw_composites.as_slice().std_dev();

    candidates
        .into_iter()
        .zip(zscores)
        .zip(raw_composites)
        .map(|(((code, sector, priority, factors), z), raw)| {
            let composite = if composite_std.is_finite() && composite_std > f64::EPSILON {
                scale((raw - composite_mean) / composite_std)
            } else {
                SCALE_MEAN
            };
            // Higher volatility z means more risk.
            let risk_score = scale(z.volatility);
            let volume_score = scale(z.volume);
            let technical_score = scale(z.technical);
            let signals = z
                .as_array()
                .iter()
                .filter(|value| **value > 0.0)
                .count() as u32;

            ScoredCandidate {
                code,
                sector,
                priority,
                factors,
                composite,
                risk_score,
                volume_score,
                technical_score,
                confidence: signals as f64 / 7.0,
                signal_count: signals,
            }
        })
        .collect()
}

fn scale(z: f64) -> f64 {
    (SCALE_MEAN + SCALE_STDEV * z).clamp(0.0, 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;
    use rust_decimal::prelude::FromPrimitive;
    use rust_decimal::Decimal;

    fn candles(closes: &[f64]) -> Vec<Candle> {
        let code = StockCode::parse("005930").unwrap();
        let start = NaiveDate::from_ymd_opt(2025, 10, 1).unwrap();
        closes
            .iter()
            .enumerate()
            .map(|(i, close)| Candle {
                code: code.clone(),
                date: start + chrono::Duration::days(i as i64),
                open: Decimal::from_f64(close * 0.995).unwrap(),
                high: Decimal::from_f64(close * 1.01).unwrap(),
                low: Decimal::from_f64(close * 0.99).unwrap(),
                close: Decimal::from_f64(*close).unwrap(),
                volume: 1_000_000 + (i as u64 * 10_000),
            })
            .collect()
    }

    fn rising_closes(n: usize) -> Vec<f64> {
        (0..n).map(|i| 50_000.0 * (1.0 + 0.002 * i as f64)).collect()
    }

    fn ratios() -> FinancialRatios {
        FinancialRatios {
            per: Some(10.0),
            pbr: Some(1.2),
            roe: Some(0.14),
            eps: Some(5_000.0),
        }
    }

    #[test]
    fn test_raw_factors_need_slow_window() {
        let short = candles(&rising_closes(40));
        assert!(raw_factors(&short, &ratios(), &rising_closes(40)).is_none());

        let enough = candles(&rising_closes(70));
        assert!(raw_factors(&enough, &ratios(), &rising_closes(70)).is_some());
    }

    #[test]
    fn test_uptrend_scores_positive_momentum_and_technical() {
        let factors = raw_factors(&candles(&rising_closes(70)), &ratios(), &[]).unwrap();
        assert!(factors.momentum > 0.0);
        assert!(factors.technical > 0.0);
        assert!(factors.value > 0.0);
        assert_eq!(factors.quality, 0.14);
    }

    #[test]
    fn test_market_strength_is_relative() {
        // Stock up 0.2%/day against an index up 0.4%/day: negative strength.
        let stock = candles(&rising_closes(70));
        let index: Vec<f64> = (0..70).map(|i| 300.0 * (1.0 + 0.004 * i as f64)).collect();
        let factors = raw_factors(&stock, &ratios(), &index).unwrap();
        assert!(factors.market_strength < 0.0);
    }

    #[test]
    fn test_score_batch_scale_properties() {
        let candidates: Vec<(StockCode, String, f64, FactorScores)> = (0..20)
            .map(|i| {
                let mut values = [0.0f64; 7];
                for (f, value) in values.iter_mut().enumerate() {
                    *value = (i as f64 * 0.37 + f as f64 * 1.31).sin();
                }
                (
                    StockCode::parse(&format!("{:06}", 100000 + i)).unwrap(),
                    "Tech".to_string(),
                    50.0,
                    FactorScores::from_array(values),
                )
            })
            .collect();

        let scored = score_batch(candidates, &FactorWeights::defaults());
        assert_eq!(scored.len(), 20);

        let composites: Vec<f64> = scored.iter().map(|s| s.composite).collect();
        let mean = composites.as_slice().mean();
        assert!((mean - 50.0).abs() < 5.0, "mean {mean}");
        assert!(composites.iter().all(|c| (0.0..=100.0).contains(c)));
        // Differentiation exists.
        let max = composites.iter().cloned().fold(f64::MIN, f64::max);
        let min = composites.iter().cloned().fold(f64::MAX, f64::min);
        assert!(max - min > 10.0);

        for candidate in &scored {
            assert!((0.0..=1.0).contains(&candidate.confidence));
            assert_eq!(candidate.signal_count as usize, (candidate.confidence * 7.0).round() as usize);
        }
    }

    #[test]
    fn test_single_candidate_batch_is_neutral() {
        let scored = score_batch(
            vec![(
                StockCode::parse("005930").unwrap(),
                "Tech".to_string(),
                60.0,
                FactorScores::from_array([1.0; 7]),
            )],
            &FactorWeights::defaults(),
        );
        assert_eq!(scored.len(), 1);
        assert_eq!(scored[0].composite, 50.0);
        assert_eq!(scored[0].risk_score, 50.0);
    }

    #[test]
    fn test_empty_batch() {
        assert!(score_batch(Vec::new(), &FactorWeights::defaults()).is_empty());
    }
}
