use crate::domain::selection::{DailySelection, SelectionStatus};
use crate::domain::types::StockCode;
use crate::infrastructure::persistence::database::Database;
use anyhow::{Context, Result};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use std::str::FromStr;

pub struct SelectionRepository {
    database: Database,
}

impl SelectionRepository {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    /// Upsert by (code, date): re-running Phase 2 never duplicates rows.
    pub async fn upsert(&self, selection: &DailySelection) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO daily_selections (
                code, selection_date, entry_price, attractiveness, risk_score,
                signal_count, stop_loss, take_profit, target_position_fraction,
                sector, status, updated_at
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, CURRENT_TIMESTAMP)
            ON CONFLICT(code, selection_date) DO UPDATE SET
                entry_price = excluded.entry_price,
                attractiveness = excluded.attractiveness,
                risk_score = excluded.risk_score,
                signal_count = excluded.signal_count,
                stop_loss = excluded.stop_loss,
                take_profit = excluded.take_profit,
                target_position_fraction = excluded.target_position_fraction,
                sector = excluded.sector,
                updated_at = CURRENT_TIMESTAMP
            "#,
        )
        .bind(selection.code.as_str())
        .bind(selection.selection_date)
        .bind(selection.entry_price.to_string())
        .bind(selection.attractiveness)
        .bind(selection.risk_score)
        .bind(selection.signal_count as i64)
        .bind(selection.stop_loss.to_string())
        .bind(selection.take_profit.to_string())
        .bind(selection.target_position_fraction.to_string())
        .bind(&selection.sector)
        .bind(selection.status.to_string())
        .execute(&self.database.pool)
        .await
        .context("Failed to upsert daily selection")?;
        Ok(())
    }

    pub async fn for_date(&self, date: NaiveDate) -> Result<Vec<DailySelection>> {
        self.query_selections(date, None).await
    }

    pub async fn pending_for_date(&self, date: NaiveDate) -> Result<Vec<DailySelection>> {
        self.query_selections(date, Some(SelectionStatus::Pending)).await
    }

    /// Status transitions are owned by the trading engine.
    pub async fn set_status(
        &self,
        code: &StockCode,
        date: NaiveDate,
        status: SelectionStatus,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE daily_selections
            SET status = $3, updated_at = CURRENT_TIMESTAMP
            WHERE code = $1 AND selection_date = $2
            "#,
        )
        .bind(code.as_str())
        .bind(date)
        .bind(status.to_string())
        .execute(&self.database.pool)
        .await
        .context("Failed to update selection status")?;
        Ok(())
    }

    async fn query_selections(
        &self,
        date: NaiveDate,
        status: Option<SelectionStatus>,
    ) -> Result<Vec<DailySelection>> {
        let base = r#"
            SELECT code, selection_date, entry_price, attractiveness, risk_score,
                   signal_count, stop_loss, take_profit, target_position_fraction,
                   sector, status
            FROM daily_selections
            WHERE selection_date = $1
        "#;
        let sql = match status {
            Some(_) => format!("{base} AND status = $2 ORDER BY attractiveness DESC"),
            None => format!("{base} ORDER BY attractiveness DESC"),
        };

        let mut query = sqlx::query_as::<
            _,
            (String, NaiveDate, String, f64, f64, i64, String, String, String, String, String),
        >(&sql)
        .bind(date);
        if let Some(status) = status {
            query = query.bind(status.to_string());
        }

        let rows = query
            .fetch_all(&self.database.pool)
            .await
            .context("Failed to load daily selections")?;

        let mut selections = Vec::with_capacity(rows.len());
        for (
            code,
            selection_date,
            entry_price,
            attractiveness,
            risk_score,
            signal_count,
            stop_loss,
            take_profit,
            fraction,
            sector,
            status,
        ) in rows
        {
            selections.push(DailySelection {
                code: StockCode::parse(&code)
                    .map_err(|e| anyhow::anyhow!("corrupt selection row: {e}"))?,
                selection_date,
                entry_price: Decimal::from_str(&entry_price).unwrap_or_default(),
                attractiveness,
                risk_score,
                signal_count: signal_count as u32,
                stop_loss: Decimal::from_str(&stop_loss).unwrap_or_default(),
                take_profit: Decimal::from_str(&take_profit).unwrap_or_default(),
                target_position_fraction: Decimal::from_str(&fraction).unwrap_or_default(),
                sector,
                status: status.parse()?,
            });
        }
        Ok(selections)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn selection(code: &str, date: NaiveDate) -> DailySelection {
        DailySelection {
            code: StockCode::parse(code).unwrap(),
            selection_date: date,
            entry_price: dec!(71000),
            attractiveness: 72.5,
            risk_score: 31.0,
            signal_count: 4,
            stop_loss: dec!(67250),
            take_profit: dec!(77000),
            target_position_fraction: dec!(0.125),
            sector: "Semiconductors".to_string(),
            status: SelectionStatus::Pending,
        }
    }

    #[tokio::test]
    async fn test_upsert_no_duplicates() {
        let db = Database::in_memory().await.unwrap();
        let repo = SelectionRepository::new(db);
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();

        repo.upsert(&selection("005930", date)).await.unwrap();
        repo.upsert(&selection("005930", date)).await.unwrap();

        let rows = repo.for_date(date).await.unwrap();
        assert_eq!(rows.len(), 1);
    }

    #[tokio::test]
    async fn test_status_transition_survives_upsert() {
        let db = Database::in_memory().await.unwrap();
        let repo = SelectionRepository::new(db);
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();
        let code = StockCode::parse("005930").unwrap();

        repo.upsert(&selection("005930", date)).await.unwrap();
        repo.set_status(&code, date, SelectionStatus::Bought)
            .await
            .unwrap();

        // An idempotent re-run must not reset the engine-owned status.
        repo.upsert(&selection("005930", date)).await.unwrap();
        let rows = repo.for_date(date).await.unwrap();
        assert_eq!(rows[0].status, SelectionStatus::Bought);

        let pending = repo.pending_for_date(date).await.unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_round_trip_preserves_fields() {
        let db = Database::in_memory().await.unwrap();
        let repo = SelectionRepository::new(db);
        let date = NaiveDate::from_ymd_opt(2026, 3, 2).unwrap();

        let original = selection("000660", date);
        repo.upsert(&original).await.unwrap();
        let loaded = &repo.for_date(date).await.unwrap()[0];

        assert_eq!(loaded.entry_price, original.entry_price);
        assert_eq!(loaded.target_position_fraction, original.target_position_fraction);
        assert_eq!(loaded.signal_count, original.signal_count);
        assert_eq!(loaded.sector, original.sector);
    }
}
