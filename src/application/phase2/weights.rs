use crate::domain::factors::FactorWeights;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Persisted dynamic weight vector with its integrity checksum. The
/// feedback process (outside the core) rewrites this file between days.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct WeightsFile {
    weights: [f64; 7],
    checksum: String,
    #[serde(default)]
    updated_at: Option<chrono::DateTime<chrono::Utc>>,
}

/// Loads the adaptive factor weights, falling back to the fixed defaults
/// on any checksum mismatch or invariant violation. The fallback is never
/// silent.
pub struct WeightStore {
    path: PathBuf,
}

impl WeightStore {
    pub fn new(data_root: &Path) -> Self {
        Self {
            path: data_root.join("weights").join("factor_weights.json"),
        }
    }

    /// `previous` is the vector active on the prior run; a loaded vector
    /// that moved any component more than the per-update bound is rejected.
    pub fn load(&self, previous: Option<&FactorWeights>) -> FactorWeights {
        match self.try_load(previous) {
            Ok(weights) => weights,
            Err(reason) => {
                warn!(
                    "WeightStore: {}, falling back to default factor weights",
                    reason
                );
                FactorWeights::defaults()
            }
        }
    }

    fn try_load(&self, previous: Option<&FactorWeights>) -> Result<FactorWeights, String> {
        if !self.path.exists() {
            return Err(format!("no weight file at {}", self.path.display()));
        }
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|e| format!("unreadable weight file: {e}"))?;
        let file: WeightsFile =
            serde_json::from_str(&raw).map_err(|e| format!("unparsable weight file: {e}"))?;

        let weights = FactorWeights::validated(file.weights)
            .map_err(|e| format!("invariant violation in weight file: {e}"))?;

        let expected = weights.checksum();
        if file.checksum != expected {
            return Err(format!(
                "checksum mismatch on {} (expected {}, got {})",
                self.path.display(),
                &expected[..12],
                &file.checksum.chars().take(12).collect::<String>()
            ));
        }

        if let Some(previous) = previous {
            weights
                .check_delta(previous)
                .map_err(|e| format!("update delta violation: {e}"))?;
        }

        info!("WeightStore: loaded dynamic weights (checksum {})", &expected[..12]);
        Ok(weights)
    }

    /// Persist a vector with its checksum (write-temp + rename).
    pub fn save(&self, weights: &FactorWeights) -> std::io::Result<()> {
        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let file = WeightsFile {
            weights: weights.as_array(),
            checksum: weights.checksum(),
            updated_at: Some(chrono::Utc::now()),
        };
        let tmp = self.path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&file)?)?;
        std::fs::rename(&tmp, &self.path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = WeightStore::new(dir.path());
        assert_eq!(store.load(None), FactorWeights::defaults());
    }

    #[test]
    fn test_save_load_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = WeightStore::new(dir.path());
        let weights =
            FactorWeights::validated([0.22, 0.14, 0.14, 0.10, 0.10, 0.20, 0.10]).unwrap();
        store.save(&weights).unwrap();
        assert_eq!(store.load(None), weights);
    }

    #[test]
    fn test_checksum_mismatch_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = WeightStore::new(dir.path());
        let weights = FactorWeights::defaults();
        store.save(&weights).unwrap();

        // Tamper with one component without updating the checksum.
        let raw = std::fs::read_to_string(store.path.clone()).unwrap();
        let tampered = raw.replace("0.2,", "0.25,");
        std::fs::write(&store.path, tampered).unwrap();

        assert_eq!(store.load(None), FactorWeights::defaults());
    }

    #[test]
    fn test_invariant_violation_falls_back() {
        let dir = tempfile::tempdir().unwrap();
        let store = WeightStore::new(dir.path());
        // Out-of-range component with a self-consistent checksum: bypass
        // save() and write directly.
        let file = serde_json::json!({
            "weights": [0.45, 0.05, 0.10, 0.10, 0.10, 0.10, 0.10],
            "checksum": "not-checked-before-validation"
        });
        std::fs::create_dir_all(store.path.parent().unwrap()).unwrap();
        std::fs::write(&store.path, serde_json::to_vec(&file).unwrap()).unwrap();

        assert_eq!(store.load(None), FactorWeights::defaults());
    }

    #[test]
    fn test_delta_bound_enforced_against_previous() {
        let dir = tempfile::tempdir().unwrap();
        let store = WeightStore::new(dir.path());
        let previous = FactorWeights::defaults(); // momentum 0.20
        let jumped =
            FactorWeights::validated([0.28, 0.15, 0.15, 0.10, 0.10, 0.12, 0.10]).unwrap();
        store.save(&jumped).unwrap();

        // Moved momentum by 0.08 in one update: rejected.
        assert_eq!(store.load(Some(&previous)), FactorWeights::defaults());
        // Without a previous vector the same file loads fine.
        assert_eq!(store.load(None), jumped);
    }
}
