use crate::domain::types::{OrderSide, StockCode};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

/// Append-only fill record. Closing a position writes a paired sell record
/// and backfills `realized_pnl` on the matching buy via join.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeRecord {
    pub id: Option<i64>,
    pub code: StockCode,
    pub side: OrderSide,
    pub requested_price: Decimal,
    pub filled_price: Decimal,
    pub quantity: u32,
    pub fees: Decimal,
    pub commission: Decimal,
    pub slippage_pct: Decimal,
    pub realized_pnl: Option<Decimal>,
    pub entry_time: DateTime<Utc>,
    pub exit_time: Option<DateTime<Utc>>,
    pub strategy_tag: String,
}

impl TradeRecord {
    /// Signed deviation of the fill from the requested price, as a fraction
    /// of the requested price.
    pub fn slippage_of(requested: Decimal, filled: Decimal) -> Decimal {
        if requested.is_zero() {
            return Decimal::ZERO;
        }
        (filled - requested) / requested
    }
}

/// Derived open-position view: open buys minus closed-out quantity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub code: StockCode,
    pub quantity: u32,
    pub average_entry: Decimal,
    pub atr_at_entry: Decimal,
    pub stop_loss: Decimal,
    pub take_profit: Decimal,
    pub opened_at: DateTime<Utc>,
    pub sector: String,
}

impl Position {
    pub fn exposure(&self, current_price: Decimal) -> Decimal {
        current_price * Decimal::from(self.quantity)
    }

    pub fn unrealized_pnl(&self, current_price: Decimal) -> Decimal {
        (current_price - self.average_entry) * Decimal::from(self.quantity)
    }

    pub fn holding_days(&self, now: DateTime<Utc>) -> i64 {
        (now - self.opened_at).num_days()
    }
}
