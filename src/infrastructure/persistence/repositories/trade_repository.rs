use crate::domain::trade::TradeRecord;
use crate::domain::types::{OrderSide, StockCode};
use crate::infrastructure::persistence::database::Database;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use std::str::FromStr;

/// Aggregate trade statistics feeding Kelly sizing.
#[derive(Debug, Clone, Copy, Default)]
pub struct TradeStats {
    pub completed: usize,
    pub wins: usize,
    pub avg_win: f64,
    pub avg_loss: f64,
    pub consecutive_losses: usize,
}

impl TradeStats {
    pub fn win_rate(&self) -> f64 {
        if self.completed == 0 {
            return 0.0;
        }
        self.wins as f64 / self.completed as f64
    }
}

pub struct TradeRepository {
    database: Database,
}

impl TradeRepository {
    pub fn new(database: Database) -> Self {
        Self { database }
    }

    /// Append a fill. Trades are never updated in place except for the
    /// realized-pnl backfill on close.
    pub async fn insert(&self, trade: &TradeRecord) -> Result<i64> {
        let result = sqlx::query(
            r#"
            INSERT INTO trades (
                code, side, requested_price, filled_price, quantity,
                fees, commission, slippage_pct, realized_pnl,
                entry_time, exit_time, strategy_tag
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)
            "#,
        )
        .bind(trade.code.as_str())
        .bind(trade.side.to_string())
        .bind(trade.requested_price.to_string())
        .bind(trade.filled_price.to_string())
        .bind(trade.quantity as i64)
        .bind(trade.fees.to_string())
        .bind(trade.commission.to_string())
        .bind(trade.slippage_pct.to_string())
        .bind(trade.realized_pnl.map(|p| p.to_string()))
        .bind(trade.entry_time)
        .bind(trade.exit_time)
        .bind(&trade.strategy_tag)
        .execute(&self.database.pool)
        .await
        .context("Failed to insert trade")?;
        Ok(result.last_insert_rowid())
    }

    /// Backfill realized pnl onto the most recent open buy for this code
    /// and stamp its exit time.
    pub async fn close_out_buy(
        &self,
        code: &StockCode,
        realized_pnl: Decimal,
        exit_time: DateTime<Utc>,
    ) -> Result<()> {
        sqlx::query(
            r#"
            UPDATE trades
            SET realized_pnl = $2, exit_time = $3
            WHERE id = (
                SELECT id FROM trades
                WHERE code = $1 AND side = 'BUY' AND realized_pnl IS NULL
                ORDER BY entry_time DESC
                LIMIT 1
            )
            "#,
        )
        .bind(code.as_str())
        .bind(realized_pnl.to_string())
        .bind(exit_time)
        .execute(&self.database.pool)
        .await
        .context("Failed to backfill realized pnl")?;
        Ok(())
    }

    /// Rolling stats over the last `window` completed round trips.
    pub async fn stats(&self, window: usize) -> Result<TradeStats> {
        let rows = sqlx::query_as::<_, (String,)>(
            r#"
            SELECT realized_pnl FROM trades
            WHERE side = 'BUY' AND realized_pnl IS NOT NULL
            ORDER BY exit_time DESC
            LIMIT $1
            "#,
        )
        .bind(window as i64)
        .fetch_all(&self.database.pool)
        .await
        .context("Failed to load trade stats")?;

        use rust_decimal::prelude::ToPrimitive;
        let pnls: Vec<f64> = rows
            .iter()
            .filter_map(|(raw,)| Decimal::from_str(raw).ok())
            .filter_map(|d| d.to_f64())
            .collect();

        let mut stats = TradeStats {
            completed: pnls.len(),
            ..Default::default()
        };
        let wins: Vec<f64> = pnls.iter().copied().filter(|p| *p > 0.0).collect();
        let losses: Vec<f64> = pnls.iter().copied().filter(|p| *p <= 0.0).collect();
        stats.wins = wins.len();
        stats.avg_win = if wins.is_empty() {
            0.0
        } else {
            wins.iter().sum::<f64>() / wins.len() as f64
        };
        stats.avg_loss = if losses.is_empty() {
            0.0
        } else {
            losses.iter().sum::<f64>() / losses.len() as f64
        };
        // Rows are newest first; count losses until the first win.
        stats.consecutive_losses = pnls.iter().take_while(|p| **p <= 0.0).count();

        Ok(stats)
    }

    pub async fn trades_for_day(&self, day: chrono::NaiveDate) -> Result<Vec<TradeRecord>> {
        let rows = sqlx::query_as::<
            _,
            (
                i64,
                String,
                String,
                String,
                String,
                i64,
                String,
                String,
                String,
                Option<String>,
                DateTime<Utc>,
                Option<DateTime<Utc>>,
                String,
            ),
        >(
            r#"
            SELECT id, code, side, requested_price, filled_price, quantity,
                   fees, commission, slippage_pct, realized_pnl,
                   entry_time, exit_time, strategy_tag
            FROM trades
            WHERE DATE(entry_time) = $1
            ORDER BY entry_time ASC
            "#,
        )
        .bind(day.format("%Y-%m-%d").to_string())
        .fetch_all(&self.database.pool)
        .await
        .context("Failed to load trades for day")?;

        let mut trades = Vec::with_capacity(rows.len());
        for (
            id,
            code,
            side,
            requested,
            filled,
            quantity,
            fees,
            commission,
            slippage,
            pnl,
            entry_time,
            exit_time,
            strategy_tag,
        ) in rows
        {
            trades.push(TradeRecord {
                id: Some(id),
                code: StockCode::parse(&code)
                    .map_err(|e| anyhow::anyhow!("corrupt trade row: {e}"))?,
                side: if side == "SELL" { OrderSide::Sell } else { OrderSide::Buy },
                requested_price: Decimal::from_str(&requested).unwrap_or_default(),
                filled_price: Decimal::from_str(&filled).unwrap_or_default(),
                quantity: quantity as u32,
                fees: Decimal::from_str(&fees).unwrap_or_default(),
                commission: Decimal::from_str(&commission).unwrap_or_default(),
                slippage_pct: Decimal::from_str(&slippage).unwrap_or_default(),
                realized_pnl: pnl.and_then(|p| Decimal::from_str(&p).ok()),
                entry_time,
                exit_time,
                strategy_tag,
            });
        }
        Ok(trades)
    }
}
