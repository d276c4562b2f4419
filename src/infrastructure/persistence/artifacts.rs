use crate::domain::errors::ArtifactError;
use crate::domain::selection::{BatchArtifact, SelectionSnapshot};
use crate::domain::watchlist::WatchlistSnapshot;
use chrono::NaiveDate;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::path::{Path, PathBuf};
use tracing::debug;

/// JSON artifact store rooted at `paths.data_root`.
///
/// Artifacts signal job completion to the recovery manager, so every write
/// is all-or-nothing: serialize to a temp file, fsync, rename.
pub struct ArtifactStore {
    root: PathBuf,
}

impl ArtifactStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn watchlist_path(&self) -> PathBuf {
        self.root.join("watchlist").join("watchlist.json")
    }

    pub fn batch_path(&self, date: NaiveDate, batch_id: usize) -> PathBuf {
        self.day_dir(date).join(format!("batch_{batch_id:02}.json"))
    }

    pub fn selection_path(&self, date: NaiveDate) -> PathBuf {
        self.day_dir(date).join("selection.json")
    }

    fn day_dir(&self, date: NaiveDate) -> PathBuf {
        self.root
            .join("daily_selection")
            .join(date.format("%Y-%m-%d").to_string())
    }

    pub fn write_watchlist(&self, snapshot: &WatchlistSnapshot) -> Result<(), ArtifactError> {
        self.write_json(&self.watchlist_path(), snapshot)
    }

    pub fn read_watchlist(&self) -> Result<WatchlistSnapshot, ArtifactError> {
        self.read_json(&self.watchlist_path())
    }

    pub fn write_batch(&self, artifact: &BatchArtifact) -> Result<(), ArtifactError> {
        self.write_json(&self.batch_path(artifact.run_date, artifact.batch_id), artifact)
    }

    /// A batch artifact counts only when it parses and is stamped with the
    /// expected date.
    pub fn read_batch(
        &self,
        date: NaiveDate,
        batch_id: usize,
    ) -> Result<BatchArtifact, ArtifactError> {
        let path = self.batch_path(date, batch_id);
        let artifact: BatchArtifact = self.read_json(&path)?;
        if !artifact.is_valid_for(date) {
            return Err(ArtifactError::StaleDate {
                path: path.display().to_string(),
                stamped: artifact.run_date.to_string(),
                expected: date.to_string(),
            });
        }
        Ok(artifact)
    }

    /// Generic day-scoped artifact (e.g. the Phase-2 distribution plan).
    pub fn write_day_json<T: Serialize>(
        &self,
        date: NaiveDate,
        name: &str,
        value: &T,
    ) -> Result<(), ArtifactError> {
        self.write_json(&self.day_dir(date).join(name), value)
    }

    pub fn read_day_json<T: DeserializeOwned>(
        &self,
        date: NaiveDate,
        name: &str,
    ) -> Result<T, ArtifactError> {
        self.read_json(&self.day_dir(date).join(name))
    }

    pub fn write_selection(&self, snapshot: &SelectionSnapshot) -> Result<(), ArtifactError> {
        self.write_json(&self.selection_path(snapshot.run_date), snapshot)
    }

    pub fn read_selection(&self, date: NaiveDate) -> Result<SelectionSnapshot, ArtifactError> {
        let path = self.selection_path(date);
        let snapshot: SelectionSnapshot = self.read_json(&path)?;
        if snapshot.run_date != date {
            return Err(ArtifactError::StaleDate {
                path: path.display().to_string(),
                stamped: snapshot.run_date.to_string(),
                expected: date.to_string(),
            });
        }
        Ok(snapshot)
    }

    fn write_json<T: Serialize>(&self, path: &Path, value: &T) -> Result<(), ArtifactError> {
        let io_err = |source: std::io::Error| ArtifactError::Io {
            path: path.display().to_string(),
            source,
        };

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(io_err)?;
        }
        let body = serde_json::to_vec_pretty(value).map_err(|e| ArtifactError::Unparsable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;

        let tmp = path.with_extension("json.tmp");
        {
            use std::io::Write;
            let mut file = std::fs::File::create(&tmp).map_err(io_err)?;
            file.write_all(&body).map_err(io_err)?;
            file.sync_all().map_err(io_err)?;
        }
        std::fs::rename(&tmp, path).map_err(io_err)?;
        debug!("Artifact written: {}", path.display());
        Ok(())
    }

    fn read_json<T: DeserializeOwned>(&self, path: &Path) -> Result<T, ArtifactError> {
        if !path.exists() {
            return Err(ArtifactError::Missing {
                path: path.display().to_string(),
            });
        }
        let raw = std::fs::read_to_string(path).map_err(|source| ArtifactError::Io {
            path: path.display().to_string(),
            source,
        })?;
        if raw.trim().is_empty() {
            return Err(ArtifactError::Unparsable {
                path: path.display().to_string(),
                reason: "empty file".to_string(),
            });
        }
        serde_json::from_str(&raw).map_err(|e| ArtifactError::Unparsable {
            path: path.display().to_string(),
            reason: e.to_string(),
        })
    }
}
