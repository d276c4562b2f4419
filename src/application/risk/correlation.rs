use crate::domain::errors::TradeRejection;
use crate::domain::types::StockCode;
use tracing::info;

/// Trailing window used for pairwise return correlation.
pub const CORRELATION_WINDOW_DAYS: usize = 60;
/// Series shorter than this are ignored rather than guessed at.
const MIN_OVERLAP: usize = 20;

/// Correlation-based rejection of new positions.
///
/// A buy is rejected once the portfolio already holds `cap` or more
/// positions whose 60-day return correlation with the candidate exceeds
/// the threshold in absolute value. Rejected candidates are skipped, not
/// re-queued.
pub struct CorrelationGate {
    threshold: f64,
    cap: usize,
}

impl Default for CorrelationGate {
    fn default() -> Self {
        Self {
            threshold: 0.7,
            cap: 2,
        }
    }
}

impl CorrelationGate {
    pub fn new(threshold: f64, cap: usize) -> Self {
        Self { threshold, cap }
    }

    /// `candidate` and each open position supply aligned daily return
    /// series (newest last), already limited to the correlation window.
    pub fn check(
        &self,
        candidate_code: &StockCode,
        candidate: &[f64],
        open_positions: &[(StockCode, Vec<f64>)],
    ) -> Result<(), TradeRejection> {
        if open_positions.is_empty() {
            return Ok(());
        }

        let mut correlated = 0usize;
        for (code, returns) in open_positions {
            let Some(rho) = pearson(candidate, returns) else {
                continue;
            };
            if rho.abs() > self.threshold {
                info!(
                    "CorrelationGate: {} vs open position {}: |rho|={:.3} > {:.2}",
                    candidate_code, code, rho.abs(), self.threshold
                );
                correlated += 1;
            }
        }

        if correlated >= self.cap {
            return Err(TradeRejection::CorrelationCap {
                correlated,
                threshold: self.threshold,
            });
        }
        Ok(())
    }
}

/// Pearson correlation over the overlapping suffix of two series.
/// Returns None when the overlap is too short or either series is flat.
pub fn pearson(a: &[f64], b: &[f64]) -> Option<f64> {
    let n = a.len().min(b.len()).min(CORRELATION_WINDOW_DAYS);
    if n < MIN_OVERLAP {
        return None;
    }
    let a = &a[a.len() - n..];
    let b = &b[b.len() - n..];

    let mean_a = a.iter().sum::<f64>() / n as f64;
    let mean_b = b.iter().sum::<f64>() / n as f64;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for i in 0..n {
        let da = a[i] - mean_a;
        let db = b[i] - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a < f64::EPSILON || var_b < f64::EPSILON {
        return None;
    }
    Some(cov / (var_a.sqrt() * var_b.sqrt()))
}
