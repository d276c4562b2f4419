use crate::domain::types::StockCode;
use crate::domain::watchlist::WatchlistEntry;
use crate::infrastructure::persistence::database::Database;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};

pub struct WatchlistRepository {
    database: Database,
}

impl WatchlistRepository {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    /// Upsert an entry; one row per stock, reactivated on re-screening.
    pub async fn upsert(&self, entry: &WatchlistEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO watchlist_stocks (
                code, name, sector,
                fundamental_score, technical_score, momentum_score, total_score,
                added_at, active
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT(code) DO UPDATE SET
                name = excluded.name,
                sector = excluded.sector,
                fundamental_score = excluded.fundamental_score,
                technical_score = excluded.technical_score,
                momentum_score = excluded.momentum_score,
                total_score = excluded.total_score,
                active = excluded.active
            "#,
        )
        .bind(entry.code.as_str())
        .bind(&entry.name)
        .bind(&entry.sector)
        .bind(entry.fundamental_score)
        .bind(entry.technical_score)
        .bind(entry.momentum_score)
        .bind(entry.total_score)
        .bind(entry.added_at)
        .bind(entry.active)
        .execute(&self.database.pool)
        .await
        .context("Failed to upsert watchlist entry")?;
        Ok(())
    }

    pub async fn active_entries(&self) -> Result<Vec<WatchlistEntry>> {
        let rows = sqlx::query_as::<
            _,
            (String, String, String, f64, f64, f64, f64, DateTime<Utc>, bool),
        >(
            r#"
            SELECT code, name, sector,
                   fundamental_score, technical_score, momentum_score, total_score,
                   added_at, active
            FROM watchlist_stocks
            WHERE active = 1
            ORDER BY total_score DESC
            "#,
        )
        .fetch_all(&self.database.pool)
        .await
        .context("Failed to load active watchlist")?;

        let mut entries = Vec::with_capacity(rows.len());
        for (code, name, sector, fundamental, technical, momentum, total, added_at, active) in rows
        {
            let code = StockCode::parse(&code)
                .map_err(|e| anyhow::anyhow!("corrupt watchlist row: {e}"))?;
            entries.push(WatchlistEntry {
                code,
                name,
                sector,
                fundamental_score: fundamental,
                technical_score: technical,
                momentum_score: momentum,
                total_score: total,
                added_at,
                active,
            });
        }
        Ok(entries)
    }

    /// Deactivate every active entry not present in `keep`.
    pub async fn deactivate_except(&self, keep: &[StockCode]) -> Result<u64> {
        let placeholders: Vec<String> = (1..=keep.len()).map(|i| format!("${i}")).collect();
        let sql = if keep.is_empty() {
            "UPDATE watchlist_stocks SET active = 0 WHERE active = 1".to_string()
        } else {
            format!(
                "UPDATE watchlist_stocks SET active = 0 WHERE active = 1 AND code NOT IN ({})",
                placeholders.join(", ")
            )
        };
        let mut query = sqlx::query(&sql);
        for code in keep {
            query = query.bind(code.as_str());
        }
        let result = query
            .execute(&self.database.pool)
            .await
            .context("Failed to deactivate watchlist entries")?;
        Ok(result.rows_affected())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(code: &str, total: f64) -> WatchlistEntry {
        WatchlistEntry::new(
            StockCode::parse(code).unwrap(),
            format!("Stock {code}"),
            "Semiconductors".to_string(),
            total / 2.0,
            total / 4.0,
            total / 4.0,
        )
    }

    #[tokio::test]
    async fn test_upsert_and_load() {
        let db = Database::in_memory().await.unwrap();
        let repo = WatchlistRepository::new(db);

        repo.upsert(&entry("005930", 80.0)).await.unwrap();
        repo.upsert(&entry("000660", 60.0)).await.unwrap();

        let active = repo.active_entries().await.unwrap();
        assert_eq!(active.len(), 2);
        // Ordered by total score, best first.
        assert_eq!(active[0].code.as_str(), "005930");
    }

    #[tokio::test]
    async fn test_upsert_is_idempotent() {
        let db = Database::in_memory().await.unwrap();
        let repo = WatchlistRepository::new(db);

        repo.upsert(&entry("005930", 80.0)).await.unwrap();
        repo.upsert(&entry("005930", 85.0)).await.unwrap();

        let active = repo.active_entries().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].total_score, 85.0);
    }

    #[tokio::test]
    async fn test_deactivate_except() {
        let db = Database::in_memory().await.unwrap();
        let repo = WatchlistRepository::new(db);

        repo.upsert(&entry("005930", 80.0)).await.unwrap();
        repo.upsert(&entry("000660", 60.0)).await.unwrap();
        repo.upsert(&entry("035720", 50.0)).await.unwrap();

        let keep = vec![StockCode::parse("005930").unwrap()];
        let deactivated = repo.deactivate_except(&keep).await.unwrap();
        assert_eq!(deactivated, 2);

        let active = repo.active_entries().await.unwrap();
        assert_eq!(active.len(), 1);
        assert_eq!(active[0].code.as_str(), "005930");
    }
}
