use crate::application::risk::stops::trail_stop;
use crate::application::risk::{
    BreakerInputs, CircuitBreaker, CorrelationGate, DrawdownMonitor, KellySizer,
    CORRELATION_WINDOW_DAYS,
};
use crate::domain::errors::TradeRejection;
use crate::domain::market_regime::MarketRegime;
use crate::domain::selection::{DailySelection, SelectionStatus};
use crate::domain::trade::{Position, TradeRecord};
use crate::domain::types::{OrderSide, OrderType, StockCode};
use crate::infrastructure::broker::BrokerClient;
use crate::infrastructure::notify::Notifier;
use crate::infrastructure::persistence::repositories::{
    ErrorLogRepository, ErrorLogRow, SelectionRepository, Severity, TradeRepository,
};
use anyhow::{Context, Result};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use rust_decimal::Decimal;
use rust_decimal_macros::dec;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Slippage above this fraction logs a warning.
const SLIPPAGE_WARN: Decimal = dec!(0.005);
/// Time-based exit: maximum holding period in calendar days.
const DEFAULT_MAX_HOLDING_DAYS: i64 = 20;
/// Rolling trade window feeding Kelly statistics.
const KELLY_STATS_WINDOW: usize = 100;
/// KRX brokerage fee estimate per side, fraction of notional.
const FEE_RATE: Decimal = dec!(0.00015);
/// Securities transaction tax on sells.
const SELL_TAX_RATE: Decimal = dec!(0.0018);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    StopLoss,
    TakeProfit,
    MaxHolding,
    Forced,
    DrawdownCloseHalf,
    DrawdownCloseAll,
}

impl ExitReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExitReason::StopLoss => "stop_loss",
            ExitReason::TakeProfit => "take_profit",
            ExitReason::MaxHolding => "max_holding",
            ExitReason::Forced => "forced",
            ExitReason::DrawdownCloseHalf => "drawdown_close_half",
            ExitReason::DrawdownCloseAll => "drawdown_close_all",
        }
    }
}

/// Pure exit decision for one position at one price.
pub fn exit_reason(
    position: &Position,
    price: Decimal,
    now: DateTime<Utc>,
    max_holding_days: i64,
) -> Option<ExitReason> {
    if price <= position.stop_loss {
        Some(ExitReason::StopLoss)
    } else if price >= position.take_profit {
        Some(ExitReason::TakeProfit)
    } else if position.holding_days(now) >= max_holding_days {
        Some(ExitReason::MaxHolding)
    } else {
        None
    }
}

/// Consumes the day's selections and manages the order lifecycle.
///
/// Order placement is serialized per account; the engine exclusively
/// writes trade records and selection status transitions.
pub struct TradingEngine {
    broker: Arc<BrokerClient>,
    selections: Arc<SelectionRepository>,
    trades: Arc<TradeRepository>,
    error_log: Arc<ErrorLogRepository>,
    notifier: Arc<Notifier>,
    kelly: KellySizer,
    correlation: CorrelationGate,
    drawdown: Arc<DrawdownMonitor>,
    breaker: Arc<CircuitBreaker>,
    order_gate: tokio::sync::Mutex<()>,
    positions: tokio::sync::RwLock<HashMap<StockCode, Position>>,
    open_orders: std::sync::Mutex<Vec<String>>,
    regime: std::sync::Mutex<MarketRegime>,
    max_holding_days: i64,
    /// Set once per escalation so drawdown responses stay idempotent.
    last_drawdown_acted: std::sync::Mutex<crate::application::risk::DrawdownResponse>,
}

impl TradingEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<BrokerClient>,
        selections: Arc<SelectionRepository>,
        trades: Arc<TradeRepository>,
        error_log: Arc<ErrorLogRepository>,
        notifier: Arc<Notifier>,
        kelly: KellySizer,
        drawdown: Arc<DrawdownMonitor>,
        breaker: Arc<CircuitBreaker>,
    ) -> Self {
        Self {
            broker,
            selections,
            trades,
            error_log,
            notifier,
            kelly,
            correlation: CorrelationGate::default(),
            drawdown,
            breaker,
            order_gate: tokio::sync::Mutex::new(()),
            positions: tokio::sync::RwLock::new(HashMap::new()),
            open_orders: std::sync::Mutex::new(Vec::new()),
            regime: std::sync::Mutex::new(MarketRegime::Sideways),
            max_holding_days: DEFAULT_MAX_HOLDING_DAYS,
            last_drawdown_acted: std::sync::Mutex::new(
                crate::application::risk::DrawdownResponse::Normal,
            ),
        }
    }

    pub fn set_regime(&self, regime: MarketRegime) {
        *self.regime.lock().unwrap_or_else(|e| e.into_inner()) = regime;
    }

    fn regime(&self) -> MarketRegime {
        *self.regime.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// One trading-loop iteration: refresh risk state, manage exits, then
    /// attempt entries for remaining pending selections.
    pub async fn tick(&self, date: NaiveDate) -> Result<()> {
        let balance = self
            .broker
            .get_account_balance()
            .await
            .context("refreshing account balance")?;
        let snapshot = self.drawdown.observe(balance.total_equity, date);

        self.apply_drawdown_responses(snapshot.response).await;

        let stats = self.trades.stats(KELLY_STATS_WINDOW).await?;
        let daily_pnl_pct = -snapshot.daily;
        let inputs = BreakerInputs {
            daily_pnl_pct,
            consecutive_losses: stats.consecutive_losses,
            errors_last_hour: self.error_log.errors_in_last_hour().await.unwrap_or(0),
            market_move_pct: self.session_index_move().await.unwrap_or(0.0),
        };
        if let Some(reason) = self.breaker.evaluate(&inputs) {
            let correlation_id = Uuid::new_v4().to_string();
            warn!("Circuit breaker tripped ({}), cancelling outstanding orders", reason.as_str());
            self.cancel_outstanding().await;
            self.error_log
                .insert(
                    &ErrorLogRow::new(
                        Severity::Critical,
                        "trading",
                        format!("circuit breaker tripped: {}", reason.as_str()),
                    )
                    .with_type_tag("circuit_breaker")
                    .with_correlation_id(correlation_id.clone()),
                )
                .await
                .ok();
            self.notifier
                .alert(
                    "Circuit breaker tripped",
                    &format!("trigger: {}", reason.as_str()),
                    &correlation_id,
                )
                .await;
        }

        self.manage_exits(Utc::now()).await?;

        // Entries last: every gate is consulted per candidate.
        let pending = self.selections.pending_for_date(date).await?;
        for selection in pending {
            match self.try_enter(&selection, balance.total_equity, &stats).await {
                Ok(()) => {}
                Err(EntrySkip::Rejected(rejection)) => {
                    info!("Entry rejected for {}: {}", selection.code, rejection);
                    if matches!(rejection, TradeRejection::CorrelationCap { .. }) {
                        // Correlation-capped candidates are dropped for the
                        // day, not re-queued.
                        self.selections
                            .set_status(&selection.code, date, SelectionStatus::Cancelled)
                            .await?;
                    }
                }
                Err(EntrySkip::Failed(e)) => {
                    warn!("Entry failed for {}: {e:#}", selection.code);
                    self.error_log
                        .insert(
                            &ErrorLogRow::new(
                                Severity::Error,
                                "trading",
                                format!("entry failed for {}: {e:#}", selection.code),
                            )
                            .with_type_tag("entry_failure"),
                        )
                        .await
                        .ok();
                }
            }
        }
        Ok(())
    }

    async fn try_enter(
        &self,
        selection: &DailySelection,
        equity: Decimal,
        stats: &crate::infrastructure::persistence::repositories::TradeStats,
    ) -> std::result::Result<(), EntrySkip> {
        {
            let positions = self.positions.read().await;
            if positions.contains_key(&selection.code) {
                return Ok(());
            }
        }

        self.breaker.check().map_err(EntrySkip::Rejected)?;

        let response = self.drawdown.response();
        if !response.allows_new_entries() {
            return Err(EntrySkip::Rejected(TradeRejection::DrawdownHalt {
                drawdown_pct: 0.0,
                threshold_pct: 0.0,
            }));
        }

        // Correlation gate over the open book.
        let candidate_returns = self
            .returns_for(&selection.code)
            .await
            .map_err(EntrySkip::Failed)?;
        let open: Vec<(StockCode, Vec<f64>)> = {
            let positions = self.positions.read().await;
            let codes: Vec<StockCode> = positions.keys().cloned().collect();
            drop(positions);
            let mut series = Vec::with_capacity(codes.len());
            for code in codes {
                match self.returns_for(&code).await {
                    Ok(returns) => series.push((code, returns)),
                    Err(e) => warn!("Correlation series unavailable for {}: {e:#}", code),
                }
            }
            series
        };
        self.correlation
            .check(&selection.code, &candidate_returns, &open)
            .map_err(EntrySkip::Rejected)?;

        // Dynamic sizing.
        let confidence = (selection.signal_count as f64 / 7.0).clamp(0.0, 1.0);
        let fraction = self.kelly.position_fraction(stats, confidence, self.regime());
        let fraction = fraction
            * rust_decimal::Decimal::from_f64_retain(response.size_multiplier())
                .unwrap_or(Decimal::ONE);

        let quote = self
            .broker
            .get_price(&selection.code)
            .await
            .map_err(|e| EntrySkip::Failed(e.into()))?;
        let budget = equity * fraction;
        let quantity = (budget / quote.price)
            .floor()
            .to_u32()
            .unwrap_or(0);
        if quantity == 0 {
            return Err(EntrySkip::Rejected(TradeRejection::InsufficientCash {
                need: quote.price,
                available: budget,
            }));
        }

        self.place_and_record(selection, quantity, quote.price).await
    }

    /// Serialized order placement and fill recording.
    async fn place_and_record(
        &self,
        selection: &DailySelection,
        quantity: u32,
        requested_price: Decimal,
    ) -> std::result::Result<(), EntrySkip> {
        let _gate = self.order_gate.lock().await;

        let receipt = self
            .broker
            .place_order(
                OrderSide::Buy,
                &selection.code,
                quantity,
                requested_price,
                OrderType::Market,
            )
            .await
            .map_err(|e| EntrySkip::Failed(e.into()))?;
        {
            let mut orders = self.open_orders.lock().unwrap_or_else(|e| e.into_inner());
            orders.push(receipt.order_no.clone());
        }

        // Market orders fill immediately; the post-trade quote stands in
        // for the execution report's fill price.
        let filled_price = self
            .broker
            .get_price(&selection.code)
            .await
            .map(|q| q.price)
            .unwrap_or(requested_price);
        {
            let mut orders = self.open_orders.lock().unwrap_or_else(|e| e.into_inner());
            orders.retain(|o| o != &receipt.order_no);
        }

        let slippage = TradeRecord::slippage_of(requested_price, filled_price);
        if slippage.abs() > SLIPPAGE_WARN {
            warn!(
                "Slippage warning for {}: requested {} filled {} ({:.3}%)",
                selection.code,
                requested_price,
                filled_price,
                slippage * dec!(100)
            );
        }

        let notional = filled_price * Decimal::from(quantity);
        let trade = TradeRecord {
            id: None,
            code: selection.code.clone(),
            side: OrderSide::Buy,
            requested_price,
            filled_price,
            quantity,
            fees: (notional * FEE_RATE).round_dp(0),
            commission: Decimal::ZERO,
            slippage_pct: slippage.round_dp(6),
            realized_pnl: None,
            entry_time: Utc::now(),
            exit_time: None,
            strategy_tag: "daily_selection".to_string(),
        };
        self.trades.insert(&trade).await.map_err(EntrySkip::Failed)?;

        {
            let mut positions = self.positions.write().await;
            positions.insert(
                selection.code.clone(),
                Position {
                    code: selection.code.clone(),
                    quantity,
                    average_entry: filled_price,
                    atr_at_entry: (selection.take_profit - selection.entry_price)
                        / Decimal::from(4),
                    stop_loss: selection.stop_loss,
                    take_profit: selection.take_profit,
                    opened_at: Utc::now(),
                    sector: selection.sector.clone(),
                },
            );
        }
        self.selections
            .set_status(&selection.code, selection.selection_date, SelectionStatus::Bought)
            .await
            .map_err(EntrySkip::Failed)?;
        info!(
            "Entered {} x{} @ {} (stop {}, target {})",
            selection.code, quantity, filled_price, selection.stop_loss, selection.take_profit
        );
        Ok(())
    }

    /// Stop/target checks and trailing-stop maintenance for the open book.
    pub async fn manage_exits(&self, now: DateTime<Utc>) -> Result<()> {
        let snapshot: Vec<Position> = {
            let positions = self.positions.read().await;
            positions.values().cloned().collect()
        };

        for position in snapshot {
            let quote = match self.broker.get_price(&position.code).await {
                Ok(quote) => quote,
                Err(e) => {
                    warn!("Exit check: no quote for {}: {}", position.code, e);
                    continue;
                }
            };

            if let Some(reason) = exit_reason(&position, quote.price, now, self.max_holding_days) {
                self.close_position(&position.code, reason).await?;
                continue;
            }

            // Trailing stop: ratchets up only.
            let new_stop = trail_stop(
                position.stop_loss,
                quote.price,
                position.atr_at_entry,
                self.regime(),
            );
            if new_stop > position.stop_loss {
                let mut positions = self.positions.write().await;
                if let Some(held) = positions.get_mut(&position.code) {
                    info!(
                        "Trailing stop for {}: {} -> {}",
                        position.code, held.stop_loss, new_stop
                    );
                    held.stop_loss = new_stop;
                }
            }
        }
        Ok(())
    }

    /// Sell out a position and backfill realized pnl on the paired buy.
    pub async fn close_position(&self, code: &StockCode, reason: ExitReason) -> Result<()> {
        let Some(position) = ({
            let positions = self.positions.read().await;
            positions.get(code).cloned()
        }) else {
            return Ok(());
        };

        let _gate = self.order_gate.lock().await;
        let quote = self.broker.get_price(code).await?;
        self.broker
            .place_order(
                OrderSide::Sell,
                code,
                position.quantity,
                quote.price,
                OrderType::Market,
            )
            .await
            .with_context(|| format!("sell order for {code}"))?;

        let notional = quote.price * Decimal::from(position.quantity);
        let fees = (notional * FEE_RATE).round_dp(0);
        let tax = (notional * SELL_TAX_RATE).round_dp(0);
        let realized =
            (quote.price - position.average_entry) * Decimal::from(position.quantity) - fees - tax;

        let sell = TradeRecord {
            id: None,
            code: code.clone(),
            side: OrderSide::Sell,
            requested_price: quote.price,
            filled_price: quote.price,
            quantity: position.quantity,
            fees,
            commission: tax,
            slippage_pct: Decimal::ZERO,
            realized_pnl: Some(realized),
            entry_time: position.opened_at,
            exit_time: Some(Utc::now()),
            strategy_tag: reason.as_str().to_string(),
        };
        self.trades.insert(&sell).await?;
        self.trades.close_out_buy(code, realized, Utc::now()).await?;

        {
            let mut positions = self.positions.write().await;
            positions.remove(code);
        }
        self.selections
            .set_status(code, chrono::Local::now().date_naive(), SelectionStatus::Sold)
            .await
            .ok();
        info!(
            "Closed {} x{} @ {} ({}, pnl {})",
            code,
            position.quantity,
            quote.price,
            reason.as_str(),
            realized
        );
        Ok(())
    }

    /// Drawdown ladder actions; idempotent per escalation level.
    async fn apply_drawdown_responses(&self, response: crate::application::risk::DrawdownResponse) {
        use crate::application::risk::DrawdownResponse;
        let already = {
            let mut last = self
                .last_drawdown_acted
                .lock()
                .unwrap_or_else(|e| e.into_inner());
            if *last == response {
                true
            } else {
                *last = response;
                false
            }
        };
        if already {
            return;
        }

        match response {
            DrawdownResponse::CloseHalf => {
                let codes = self.half_of_book_by_exposure().await;
                for code in codes {
                    if let Err(e) = self.close_position(&code, ExitReason::DrawdownCloseHalf).await {
                        warn!("Drawdown close-half failed for {}: {e:#}", code);
                    }
                }
            }
            DrawdownResponse::CloseAll => {
                let codes: Vec<StockCode> = {
                    let positions = self.positions.read().await;
                    positions.keys().cloned().collect()
                };
                for code in codes {
                    if let Err(e) = self.close_position(&code, ExitReason::DrawdownCloseAll).await {
                        warn!("Drawdown close-all failed for {}: {e:#}", code);
                    }
                }
            }
            _ => {}
        }
    }

    async fn half_of_book_by_exposure(&self) -> Vec<StockCode> {
        let positions = self.positions.read().await;
        let mut by_exposure: Vec<(StockCode, Decimal)> = positions
            .values()
            .map(|p| (p.code.clone(), p.average_entry * Decimal::from(p.quantity)))
            .collect();
        by_exposure.sort_by(|a, b| b.1.cmp(&a.1));
        by_exposure
            .into_iter()
            .take(positions.len().div_ceil(2))
            .map(|(code, _)| code)
            .collect()
    }

    /// Cancel every outstanding order; in-flight fetches are left to
    /// finish on their own.
    pub async fn cancel_outstanding(&self) {
        let orders: Vec<String> = {
            let mut open = self.open_orders.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *open)
        };
        for order_no in orders {
            if let Err(e) = self.broker.cancel_order(&order_no).await {
                warn!("Cancel failed for order {}: {}", order_no, e);
            }
        }
    }

    /// Forced exit of the entire book (pre-event risk-off).
    pub async fn force_exit_all(&self) -> Result<()> {
        let codes: Vec<StockCode> = {
            let positions = self.positions.read().await;
            positions.keys().cloned().collect()
        };
        for code in codes {
            self.close_position(&code, ExitReason::Forced).await?;
        }
        Ok(())
    }

    /// Rebuild the in-memory book from the brokerage at startup.
    pub async fn sync_positions(&self) -> Result<()> {
        let broker_positions = self.broker.get_positions().await?;
        let mut positions = self.positions.write().await;
        positions.clear();
        for held in broker_positions {
            let Ok(code) = StockCode::parse(&held.code) else {
                continue;
            };
            let atr_estimate = held.average_price * dec!(0.02);
            positions.insert(
                code.clone(),
                Position {
                    code,
                    quantity: held.quantity,
                    average_entry: held.average_price,
                    atr_at_entry: atr_estimate,
                    stop_loss: held.average_price - atr_estimate * Decimal::TWO,
                    take_profit: held.average_price + atr_estimate * Decimal::from(3),
                    opened_at: Utc::now(),
                    sector: "Unknown".to_string(),
                },
            );
        }
        info!("Position book synced: {} holdings", positions.len());
        Ok(())
    }

    async fn returns_for(&self, code: &StockCode) -> Result<Vec<f64>> {
        let candles = self
            .broker
            .get_daily_ohlcv(code, CORRELATION_WINDOW_DAYS + 1)
            .await?;
        let closes: Vec<f64> = candles.iter().filter_map(|c| c.close.to_f64()).collect();
        Ok(closes
            .windows(2)
            .filter(|w| w[0] > f64::EPSILON)
            .map(|w| w[1] / w[0] - 1.0)
            .collect())
    }

    /// Single-session move of the index proxy, for the breaker's market
    /// volatility trigger.
    async fn session_index_move(&self) -> Result<f64> {
        let code = StockCode::parse("069500").map_err(|e| anyhow::anyhow!("{e}"))?;
        let quote = self.broker.get_price(&code).await?;
        Ok((quote.change_pct.to_f64().unwrap_or(0.0) / 100.0).abs())
    }
}

enum EntrySkip {
    Rejected(TradeRejection),
    Failed(anyhow::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn position(stop: Decimal, target: Decimal, opened_days_ago: i64) -> Position {
        Position {
            code: StockCode::parse("005930").unwrap(),
            quantity: 10,
            average_entry: dec!(70000),
            atr_at_entry: dec!(1500),
            stop_loss: stop,
            take_profit: target,
            opened_at: Utc::now() - chrono::Duration::days(opened_days_ago),
            sector: "Semiconductors".to_string(),
        }
    }

    #[test]
    fn test_exit_on_stop_loss() {
        let p = position(dec!(66250), dec!(76000), 1);
        assert_eq!(
            exit_reason(&p, dec!(66000), Utc::now(), 20),
            Some(ExitReason::StopLoss)
        );
        assert_eq!(
            exit_reason(&p, dec!(66250), Utc::now(), 20),
            Some(ExitReason::StopLoss)
        );
    }

    #[test]
    fn test_exit_on_take_profit() {
        let p = position(dec!(66250), dec!(76000), 1);
        assert_eq!(
            exit_reason(&p, dec!(76500), Utc::now(), 20),
            Some(ExitReason::TakeProfit)
        );
    }

    #[test]
    fn test_exit_on_max_holding() {
        let p = position(dec!(66250), dec!(76000), 21);
        assert_eq!(
            exit_reason(&p, dec!(70000), Utc::now(), 20),
            Some(ExitReason::MaxHolding)
        );
    }

    #[test]
    fn test_no_exit_in_band() {
        let p = position(dec!(66250), dec!(76000), 5);
        assert_eq!(exit_reason(&p, dec!(71000), Utc::now(), 20), None);
    }
}
