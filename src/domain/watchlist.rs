use crate::domain::types::StockCode;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One stock on the daily-selection-eligible watchlist.
///
/// Entries are long-lived (weeks). Phase 1 creates them; deactivation is
/// explicit. At most one active entry per stock.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistEntry {
    pub code: StockCode,
    pub name: String,
    pub sector: String,
    pub fundamental_score: f64,
    pub technical_score: f64,
    pub momentum_score: f64,
    pub total_score: f64,
    pub added_at: DateTime<Utc>,
    pub active: bool,
}

impl WatchlistEntry {
    pub fn new(
        code: StockCode,
        name: String,
        sector: String,
        fundamental_score: f64,
        technical_score: f64,
        momentum_score: f64,
    ) -> Self {
        let total_score = fundamental_score + technical_score + momentum_score;
        Self {
            code,
            name,
            sector,
            fundamental_score,
            technical_score,
            momentum_score,
            total_score,
            added_at: Utc::now(),
            active: true,
        }
    }
}

/// Snapshot artifact written to `data/watchlist/watchlist.json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WatchlistSnapshot {
    pub generated_at: DateTime<Utc>,
    pub entries: Vec<WatchlistEntry>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_total_is_sum_of_components() {
        let entry = WatchlistEntry::new(
            StockCode::parse("005930").unwrap(),
            "Samsung Electronics".to_string(),
            "Semiconductors".to_string(),
            30.0,
            25.5,
            12.5,
        );
        assert_eq!(entry.total_score, 68.0);
        assert!(entry.active);
    }
}
