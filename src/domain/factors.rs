use crate::domain::errors::InvariantViolation;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub const WEIGHT_MIN: f64 = 0.05;
pub const WEIGHT_MAX: f64 = 0.40;
pub const WEIGHT_SUM_TOLERANCE: f64 = 1e-6;
pub const WEIGHT_MAX_DELTA: f64 = 0.05;

pub const FACTOR_NAMES: [&str; 7] = [
    "momentum",
    "value",
    "quality",
    "volume",
    "volatility",
    "technical",
    "market_strength",
];

/// Raw values for the seven scoring factors, one candidate.
/// All values are on a common normalized scale before weighting.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FactorScores {
    pub momentum: f64,
    pub value: f64,
    pub quality: f64,
    pub volume: f64,
    pub volatility: f64,
    pub technical: f64,
    pub market_strength: f64,
}

impl FactorScores {
    pub fn as_array(&self) -> [f64; 7] {
        [
            self.momentum,
            self.value,
            self.quality,
            self.volume,
            self.volatility,
            self.technical,
            self.market_strength,
        ]
    }

    pub fn from_array(values: [f64; 7]) -> Self {
        Self {
            momentum: values[0],
            value: values[1],
            quality: values[2],
            volume: values[3],
            volatility: values[4],
            technical: values[5],
            market_strength: values[6],
        }
    }
}

/// Weight vector over the seven factors.
///
/// `validated` is the only way to construct one, so an out-of-range vector
/// cannot exist in the type. Loaded vectors are additionally checksum-
/// verified and delta-checked against the previously active vector.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct FactorWeights {
    momentum: f64,
    value: f64,
    quality: f64,
    volume: f64,
    volatility: f64,
    technical: f64,
    market_strength: f64,
}

impl FactorWeights {
    /// Fixed fallback constants, used whenever a loaded vector fails
    /// verification.
    pub fn defaults() -> Self {
        Self {
            momentum: 0.20,
            value: 0.15,
            quality: 0.15,
            volume: 0.10,
            volatility: 0.10,
            technical: 0.20,
            market_strength: 0.10,
        }
    }

    pub fn validated(values: [f64; 7]) -> Result<Self, InvariantViolation> {
        for (name, value) in FACTOR_NAMES.iter().zip(values.iter()) {
            if *value < WEIGHT_MIN || *value > WEIGHT_MAX {
                return Err(InvariantViolation::WeightRange {
                    factor: name.to_string(),
                    value: *value,
                    min: WEIGHT_MIN,
                    max: WEIGHT_MAX,
                });
            }
        }
        let sum: f64 = values.iter().sum();
        if (sum - 1.0).abs() > WEIGHT_SUM_TOLERANCE {
            return Err(InvariantViolation::WeightSum {
                sum,
                tolerance: WEIGHT_SUM_TOLERANCE,
            });
        }
        Ok(Self {
            momentum: values[0],
            value: values[1],
            quality: values[2],
            volume: values[3],
            volatility: values[4],
            technical: values[5],
            market_strength: values[6],
        })
    }

    /// Verify that no component moved more than `WEIGHT_MAX_DELTA` absolute
    /// relative to the previously active vector.
    pub fn check_delta(&self, previous: &FactorWeights) -> Result<(), InvariantViolation> {
        let current = self.as_array();
        let prior = previous.as_array();
        for (i, name) in FACTOR_NAMES.iter().enumerate() {
            let delta = (current[i] - prior[i]).abs();
            if delta > WEIGHT_MAX_DELTA + WEIGHT_SUM_TOLERANCE {
                return Err(InvariantViolation::WeightDelta {
                    factor: name.to_string(),
                    delta,
                    max: WEIGHT_MAX_DELTA,
                });
            }
        }
        Ok(())
    }

    pub fn as_array(&self) -> [f64; 7] {
        [
            self.momentum,
            self.value,
            self.quality,
            self.volume,
            self.volatility,
            self.technical,
            self.market_strength,
        ]
    }

    /// Weighted sum of normalized factor values.
    pub fn combine(&self, scores: &FactorScores) -> f64 {
        self.as_array()
            .iter()
            .zip(scores.as_array().iter())
            .map(|(w, s)| w * s)
            .sum()
    }

    /// Checksum over the canonical fixed-precision rendering of the vector.
    /// Stable across processes; used to verify persisted weight files.
    pub fn checksum(&self) -> String {
        let canonical = self
            .as_array()
            .iter()
            .map(|w| format!("{w:.6}"))
            .collect::<Vec<_>>()
            .join(",");
        let digest = Sha256::digest(canonical.as_bytes());
        hex::encode(digest)
    }
}
