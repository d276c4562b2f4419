use crate::domain::errors::InvariantViolation;
use crate::domain::factors::FactorScores;
use crate::domain::types::StockCode;
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

pub const POSITION_FRACTION_MIN: Decimal = dec!(0.02);
pub const POSITION_FRACTION_MAX: Decimal = dec!(0.40);

/// Lifecycle of a daily selection; transitioned only by the trading engine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SelectionStatus {
    Pending,
    Bought,
    Sold,
    Cancelled,
}

impl fmt::Display for SelectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SelectionStatus::Pending => write!(f, "pending"),
            SelectionStatus::Bought => write!(f, "bought"),
            SelectionStatus::Sold => write!(f, "sold"),
            SelectionStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl FromStr for SelectionStatus {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(SelectionStatus::Pending),
            "bought" => Ok(SelectionStatus::Bought),
            "sold" => Ok(SelectionStatus::Sold),
            "cancelled" => Ok(SelectionStatus::Cancelled),
            _ => anyhow::bail!("Invalid selection status: {}", s),
        }
    }
}

/// One stock chosen by Phase 2 for a given trading day. Unique by
/// (code, selection_date); re-runs upsert rather than duplicate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailySelection {
    pub code: StockCode,
    pub selection_date: NaiveDate,
    pub entry_price: Decimal,
    pub attractiveness: f64,
    pub risk_score: f64,
    pub signal_count: u32,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub target_position_fraction: Decimal,
    pub sector: String,
    pub status: SelectionStatus,
}

impl DailySelection {
    /// Per-position fraction bound; the portfolio-level sum check lives with
    /// the optimizer output.
    pub fn check_fraction(&self) -> Result<(), InvariantViolation> {
        if self.target_position_fraction < POSITION_FRACTION_MIN
            || self.target_position_fraction > POSITION_FRACTION_MAX
        {
            return Err(InvariantViolation::FractionRange {
                fraction: self.target_position_fraction,
                min: POSITION_FRACTION_MIN,
                max: POSITION_FRACTION_MAX,
            });
        }
        Ok(())
    }
}

/// One scored candidate inside a batch artifact: the raw factor snapshot
/// plus the batch-scaled scores the safety filter ran against.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchEntry {
    pub code: StockCode,
    pub priority_score: f64,
    pub factors: FactorScores,
    pub composite: f64,
    pub risk_score: f64,
    pub volume_score: f64,
    pub technical_score: f64,
    pub confidence: f64,
    pub signal_count: u32,
    pub passed_filter: bool,
}

/// Per-batch JSON artifact. Presence + valid JSON + today's date is the sole
/// source of truth for "this batch completed".
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchArtifact {
    pub batch_id: usize,
    pub run_date: NaiveDate,
    pub skipped: bool,
    pub entries: Vec<BatchEntry>,
    pub completed_at: DateTime<Utc>,
}

impl BatchArtifact {
    pub fn completed(batch_id: usize, run_date: NaiveDate, entries: Vec<BatchEntry>) -> Self {
        Self {
            batch_id,
            run_date,
            skipped: false,
            entries,
            completed_at: Utc::now(),
        }
    }

    pub fn skipped(batch_id: usize, run_date: NaiveDate) -> Self {
        Self {
            batch_id,
            run_date,
            skipped: true,
            entries: Vec::new(),
            completed_at: Utc::now(),
        }
    }

    pub fn is_valid_for(&self, date: NaiveDate) -> bool {
        self.run_date == date
    }
}

/// Final daily selection snapshot (`selection.json`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SelectionSnapshot {
    pub run_date: NaiveDate,
    pub regime: String,
    pub selections: Vec<DailySelection>,
    pub completed_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    fn selection(fraction: Decimal) -> DailySelection {
        DailySelection {
            code: StockCode::parse("005930").unwrap(),
            selection_date: NaiveDate::from_ymd_opt(2026, 3, 2).unwrap(),
            entry_price: dec!(71000),
            attractiveness: 72.5,
            risk_score: 31.0,
            signal_count: 4,
            stop_loss: dec!(68000),
            take_profit: dec!(76500),
            target_position_fraction: fraction,
            sector: "Semiconductors".to_string(),
            status: SelectionStatus::Pending,
        }
    }

    #[test]
    fn test_fraction_bounds() {
        assert!(selection(dec!(0.10)).check_fraction().is_ok());
        assert!(selection(dec!(0.02)).check_fraction().is_ok());
        assert!(selection(dec!(0.40)).check_fraction().is_ok());
        assert!(selection(dec!(0.01)).check_fraction().is_err());
        assert!(selection(dec!(0.41)).check_fraction().is_err());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            SelectionStatus::Pending,
            SelectionStatus::Bought,
            SelectionStatus::Sold,
            SelectionStatus::Cancelled,
        ] {
            let parsed: SelectionStatus = status.to_string().parse().unwrap();
            assert_eq!(parsed, status);
        }
    }

    #[test]
    fn test_artifact_date_validity() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let artifact = BatchArtifact::completed(3, date, Vec::new());
        assert!(artifact.is_valid_for(date));
        assert!(!artifact.is_valid_for(date.succ_opt().unwrap()));
    }

    #[test]
    fn test_artifact_serde_round_trip_is_stable() {
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let artifact = BatchArtifact::completed(
            0,
            date,
            vec![BatchEntry {
                code: StockCode::parse("000660").unwrap(),
                priority_score: 81.25,
                factors: crate::domain::factors::FactorScores::from_array([0.5; 7]),
                composite: 55.0,
                risk_score: 48.0,
                volume_score: 52.0,
                technical_score: 57.0,
                confidence: 0.71,
                signal_count: 5,
                passed_filter: true,
            }],
        );
        let json = serde_json::to_string(&artifact).unwrap();
        let parsed: BatchArtifact = serde_json::from_str(&json).unwrap();
        let rejson = serde_json::to_string(&parsed).unwrap();
        assert_eq!(json, rejson);
    }
}
