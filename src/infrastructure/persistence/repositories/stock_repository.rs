use crate::domain::types::{Market, Stock, StockCode};
use crate::infrastructure::persistence::database::Database;
use anyhow::{Context, Result};
use std::str::FromStr;

/// Master listing of instruments seen by the universe scan.
pub struct StockRepository {
    database: Database,
}

impl StockRepository {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    pub async fn upsert_all(&self, stocks: &[Stock]) -> Result<()> {
        let mut tx = self.database.pool.begin().await?;
        for stock in stocks {
            sqlx::query(
                r#"
                INSERT INTO stocks (code, name, market, sector, updated_at)
                VALUES ($1, $2, $3, $4, CURRENT_TIMESTAMP)
                ON CONFLICT(code) DO UPDATE SET
                    name = excluded.name,
                    market = excluded.market,
                    sector = excluded.sector,
                    updated_at = CURRENT_TIMESTAMP
                "#,
            )
            .bind(stock.code.as_str())
            .bind(&stock.name)
            .bind(stock.market.to_string())
            .bind(&stock.sector)
            .execute(&mut *tx)
            .await
            .context("Failed to upsert stock")?;
        }
        tx.commit().await.context("Failed to commit stock upserts")?;
        Ok(())
    }

    pub async fn get(&self, code: &StockCode) -> Result<Option<Stock>> {
        let row = sqlx::query_as::<_, (String, String, String, String)>(
            "SELECT code, name, market, sector FROM stocks WHERE code = $1",
        )
        .bind(code.as_str())
        .fetch_optional(&self.database.pool)
        .await
        .context("Failed to load stock")?;

        row.map(|(code, name, market, sector)| {
            Ok(Stock {
                code: StockCode::parse(&code)
                    .map_err(|e| anyhow::anyhow!("corrupt stock row: {e}"))?,
                name,
                market: Market::from_str(&market)?,
                sector,
            })
        })
        .transpose()
    }
}
