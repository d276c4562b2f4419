use crate::application::risk::DrawdownMonitor;
use crate::infrastructure::broker::BrokerClient;
use crate::infrastructure::notify::Notifier;
use crate::infrastructure::persistence::repositories::TradeRepository;
use crate::infrastructure::persistence::ArtifactStore;
use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

pub const PERFORMANCE_FILE: &str = "performance.json";

/// End-of-day performance record; doubles as the close-out job's
/// completion artifact.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DailyPerformance {
    pub run_date: NaiveDate,
    pub trades: usize,
    pub closed: usize,
    pub wins: usize,
    pub realized_pnl: Decimal,
    pub total_equity: Decimal,
    pub current_drawdown: f64,
    pub completed_at: chrono::DateTime<Utc>,
}

/// 16:00 close-out: aggregate the day's fills, snapshot equity and
/// drawdown, persist the artifact, and send the daily summary.
pub struct CloseOut {
    broker: Arc<BrokerClient>,
    trades: Arc<TradeRepository>,
    artifacts: Arc<ArtifactStore>,
    drawdown: Arc<DrawdownMonitor>,
    notifier: Arc<Notifier>,
}

impl CloseOut {
    pub fn new(
        broker: Arc<BrokerClient>,
        trades: Arc<TradeRepository>,
        artifacts: Arc<ArtifactStore>,
        drawdown: Arc<DrawdownMonitor>,
        notifier: Arc<Notifier>,
    ) -> Self {
        Self {
            broker,
            trades,
            artifacts,
            drawdown,
            notifier,
        }
    }

    pub async fn run(&self, date: NaiveDate) -> Result<DailyPerformance> {
        let day_trades = self.trades.trades_for_day(date).await?;
        let closed: Vec<_> = day_trades
            .iter()
            .filter(|t| t.realized_pnl.is_some())
            .collect();
        let realized_pnl: Decimal = closed.iter().filter_map(|t| t.realized_pnl).sum();
        let wins = closed
            .iter()
            .filter(|t| t.realized_pnl.unwrap_or_default() > Decimal::ZERO)
            .count();

        let balance = self
            .broker
            .get_account_balance()
            .await
            .context("close-out balance inquiry")?;
        let snapshot = self.drawdown.observe(balance.total_equity, date);

        let performance = DailyPerformance {
            run_date: date,
            trades: day_trades.len(),
            closed: closed.len(),
            wins,
            realized_pnl,
            total_equity: balance.total_equity,
            current_drawdown: snapshot.current,
            completed_at: Utc::now(),
        };

        self.artifacts
            .write_day_json(date, PERFORMANCE_FILE, &performance)
            .context("writing performance artifact")?;

        self.notifier
            .send(&format!(
                "📊 Daily close-out {}\ntrades: {} ({} closed, {} wins)\nrealized pnl: {}\nequity: {}\ndrawdown: {:.2}%",
                date,
                performance.trades,
                performance.closed,
                performance.wins,
                performance.realized_pnl,
                performance.total_equity,
                performance.current_drawdown * 100.0
            ))
            .await;

        info!(
            "Close-out {}: {} trades, realized pnl {}",
            date, performance.trades, performance.realized_pnl
        );
        Ok(performance)
    }
}
