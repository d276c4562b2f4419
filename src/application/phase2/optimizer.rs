use crate::domain::registry::OptimizerInputs;
use tracing::warn;

const SUM_TOLERANCE: f64 = 1e-9;
const MAX_PROJECTION_ROUNDS: usize = 32;

/// Default portfolio optimizer (`risk_parity_v1`): weights proportional to
/// inverse return volatility, projected into the configured per-position
/// bounds. Returns None when the inputs are degenerate; the pipeline then
/// falls back to equal weight.
pub fn risk_parity(inputs: &OptimizerInputs) -> Option<Vec<f64>> {
    let n = inputs.returns.len();
    if n == 0 || !bounds_feasible(n, inputs.weight_min, inputs.weight_max) {
        return None;
    }

    let mut inverse_vols = Vec::with_capacity(n);
    for series in &inputs.returns {
        let vol = volatility(series)?;
        if vol < f64::EPSILON {
            return None;
        }
        inverse_vols.push(1.0 / vol);
    }

    let total: f64 = inverse_vols.iter().sum();
    let raw: Vec<f64> = inverse_vols.iter().map(|v| v / total).collect();
    project_into_bounds(raw, inputs.weight_min, inputs.weight_max)
}

/// Equal-weight fallback, still respecting the bounds. None only when the
/// bounds themselves are infeasible for `n` positions.
pub fn equal_weights(n: usize, weight_min: f64, weight_max: f64) -> Option<Vec<f64>> {
    if n == 0 || !bounds_feasible(n, weight_min, weight_max) {
        return None;
    }
    project_into_bounds(vec![1.0 / n as f64; n], weight_min, weight_max)
}

fn bounds_feasible(n: usize, min: f64, max: f64) -> bool {
    n as f64 * min <= 1.0 + SUM_TOLERANCE && n as f64 * max >= 1.0 - SUM_TOLERANCE
}

/// Clamp-and-redistribute projection: clamp every weight, then spread the
/// residual across the weights still inside the bounds, repeating until
/// the sum settles at 1.
fn project_into_bounds(mut weights: Vec<f64>, min: f64, max: f64) -> Option<Vec<f64>> {
    let n = weights.len();
    for _ in 0..MAX_PROJECTION_ROUNDS {
        for weight in weights.iter_mut() {
            *weight = weight.clamp(min, max);
        }
        let sum: f64 = weights.iter().sum();
        let residual = 1.0 - sum;
        if residual.abs() <= SUM_TOLERANCE {
            return Some(weights);
        }

        // Indices with headroom in the direction of the residual.
        let adjustable: Vec<usize> = (0..n)
            .filter(|&i| {
                if residual > 0.0 {
                    weights[i] < max - SUM_TOLERANCE
                } else {
                    weights[i] > min + SUM_TOLERANCE
                }
            })
            .collect();
        if adjustable.is_empty() {
            warn!("Optimizer projection stuck with residual {residual:.6}");
            return None;
        }
        let step = residual / adjustable.len() as f64;
        for i in adjustable {
            weights[i] += step;
        }
    }
    warn!("Optimizer projection failed to converge");
    None
}

fn volatility(returns: &[f64]) -> Option<f64> {
    if returns.len() < 2 {
        return None;
    }
    let n = returns.len() as f64;
    let mean = returns.iter().sum::<f64>() / n;
    let variance = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / (n - 1.0);
    Some(variance.sqrt())
}
