use crate::domain::market_regime::MarketRegime;
use std::collections::HashMap;
use std::sync::Arc;

/// Inputs to the pluggable Phase-1 screening score.
#[derive(Debug, Clone)]
pub struct ScreeningInputs {
    pub closes: Vec<f64>,
    pub volumes: Vec<f64>,
    pub per: Option<f64>,
    pub pbr: Option<f64>,
    pub roe: Option<f64>,
}

/// Component scores emitted by a screening function.
#[derive(Debug, Clone, Copy)]
pub struct ScreeningScores {
    pub fundamental: f64,
    pub technical: f64,
    pub momentum: f64,
}

impl ScreeningScores {
    pub fn total(&self) -> f64 {
        self.fundamental + self.technical + self.momentum
    }
}

/// Parameters for the volatility-fit priority component.
#[derive(Debug, Clone, Copy)]
pub struct VolatilityFitParams {
    pub optimal_min: f64,
    pub optimal_max: f64,
    pub scale_factor: f64,
}

/// Inputs to regime detection: an index-level price history.
#[derive(Debug, Clone)]
pub struct RegimeInputs {
    pub index_closes: Vec<f64>,
}

/// Inputs to portfolio weight optimization.
#[derive(Debug, Clone)]
pub struct OptimizerInputs {
    /// Per-candidate daily return series, aligned.
    pub returns: Vec<Vec<f64>>,
    pub weight_min: f64,
    pub weight_max: f64,
}

pub type ScreeningScoreFn = Arc<dyn Fn(&ScreeningInputs) -> ScreeningScores + Send + Sync>;
pub type VolatilityFitFn = Arc<dyn Fn(f64, &VolatilityFitParams) -> f64 + Send + Sync>;
pub type RegimeDetectFn = Arc<dyn Fn(&RegimeInputs) -> MarketRegime + Send + Sync>;
pub type OptimizeFn = Arc<dyn Fn(&OptimizerInputs) -> Option<Vec<f64>> + Send + Sync>;

/// Metadata every registered implementation declares.
#[derive(Debug, Clone)]
pub struct FunctionMeta {
    pub name: String,
    pub version: String,
    pub input_columns: Vec<&'static str>,
}

struct Entry<F> {
    meta: FunctionMeta,
    func: F,
}

/// Named registry for the pluggable pure computations: screening score,
/// volatility fit, regime detection, and portfolio optimization.
///
/// Implementations are registered at startup and selected by name from
/// config; swapping one never touches the pipeline code.
#[derive(Default)]
pub struct FunctionRegistry {
    screening: HashMap<String, Entry<ScreeningScoreFn>>,
    volatility_fit: HashMap<String, Entry<VolatilityFitFn>>,
    regime: HashMap<String, Entry<RegimeDetectFn>>,
    optimize: HashMap<String, Entry<OptimizeFn>>,
}

impl FunctionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register_screening(&mut self, meta: FunctionMeta, func: ScreeningScoreFn) {
        self.screening.insert(meta.name.clone(), Entry { meta, func });
    }

    pub fn register_volatility_fit(&mut self, meta: FunctionMeta, func: VolatilityFitFn) {
        self.volatility_fit
            .insert(meta.name.clone(), Entry { meta, func });
    }

    pub fn register_regime(&mut self, meta: FunctionMeta, func: RegimeDetectFn) {
        self.regime.insert(meta.name.clone(), Entry { meta, func });
    }

    pub fn register_optimize(&mut self, meta: FunctionMeta, func: OptimizeFn) {
        self.optimize.insert(meta.name.clone(), Entry { meta, func });
    }

    pub fn screening(&self, name: &str) -> anyhow::Result<ScreeningScoreFn> {
        self.screening
            .get(name)
            .map(|e| e.func.clone())
            .ok_or_else(|| anyhow::anyhow!("Unknown screening function: {}", name))
    }

    pub fn volatility_fit(&self, name: &str) -> anyhow::Result<VolatilityFitFn> {
        self.volatility_fit
            .get(name)
            .map(|e| e.func.clone())
            .ok_or_else(|| anyhow::anyhow!("Unknown volatility-fit function: {}", name))
    }

    pub fn regime(&self, name: &str) -> anyhow::Result<RegimeDetectFn> {
        self.regime
            .get(name)
            .map(|e| e.func.clone())
            .ok_or_else(|| anyhow::anyhow!("Unknown regime function: {}", name))
    }

    pub fn optimize(&self, name: &str) -> anyhow::Result<OptimizeFn> {
        self.optimize
            .get(name)
            .map(|e| e.func.clone())
            .ok_or_else(|| anyhow::anyhow!("Unknown optimizer function: {}", name))
    }

    pub fn describe(&self) -> Vec<FunctionMeta> {
        let mut all: Vec<FunctionMeta> = self
            .screening
            .values()
            .map(|e| e.meta.clone())
            .chain(self.volatility_fit.values().map(|e| e.meta.clone()))
            .chain(self.regime.values().map(|e| e.meta.clone()))
            .chain(self.optimize.values().map(|e| e.meta.clone()))
            .collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}
