//! Phase 1: universe-wide pre-market screening.

use crate::config::Phase1Config;
use crate::domain::registry::{ScreeningInputs, ScreeningScoreFn, ScreeningScores};
use crate::domain::watchlist::{WatchlistEntry, WatchlistSnapshot};
use crate::infrastructure::broker::BrokerClient;
use crate::infrastructure::persistence::repositories::{StockRepository, WatchlistRepository};
use crate::infrastructure::persistence::ArtifactStore;
use anyhow::{Context, Result};
use chrono::Utc;
use rust_decimal::prelude::ToPrimitive;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{info, warn};

const HISTORY_DAYS: usize = 80;

/// Universe scanner: fetches per-stock data in bounded-parallel batches,
/// scores through the pluggable screening function, and emits the
/// watchlist. Partial failures never abort the phase while the success
/// rate stays at or above the configured floor.
pub struct Screener {
    broker: Arc<BrokerClient>,
    watchlist: Arc<WatchlistRepository>,
    stocks: Arc<StockRepository>,
    artifacts: Arc<ArtifactStore>,
    config: Phase1Config,
    max_inflight: usize,
    score: ScreeningScoreFn,
}

impl Screener {
    pub fn new(
        broker: Arc<BrokerClient>,
        watchlist: Arc<WatchlistRepository>,
        stocks: Arc<StockRepository>,
        artifacts: Arc<ArtifactStore>,
        config: Phase1Config,
        max_inflight: usize,
        score: ScreeningScoreFn,
    ) -> Self {
        Self {
            broker,
            watchlist,
            stocks,
            artifacts,
            config,
            max_inflight: max_inflight.max(1),
            score,
        }
    }

    /// Run the daily screen; returns the emitted watchlist size.
    pub async fn run(&self) -> Result<usize> {
        let universe = self
            .broker
            .get_stock_universe()
            .await
            .context("loading stock universe")?;
        info!("Phase 1: screening {} listed stocks", universe.len());
        self.stocks
            .upsert_all(&universe)
            .await
            .context("refreshing stock master")?;

        let semaphore = Arc::new(Semaphore::new(self.max_inflight));
        let mut tasks = Vec::with_capacity(universe.len());
        for stock in universe.iter().cloned() {
            let semaphore = semaphore.clone();
            let broker = self.broker.clone();
            let score = self.score.clone();
            tasks.push(async move {
                let _permit = semaphore.acquire_owned().await.ok();

                let candles = match broker.get_daily_ohlcv(&stock.code, HISTORY_DAYS).await {
                    Ok(candles) if candles.len() >= 21 => candles,
                    Ok(_) => return (stock, None, true),
                    Err(e) => {
                        warn!("Phase 1: history fetch failed for {}: {}", stock.code, e);
                        return (stock, None, false);
                    }
                };
                let financials = broker.get_financial_ratios(&stock.code).await.ok();

                let inputs = ScreeningInputs {
                    closes: candles.iter().filter_map(|c| c.close.to_f64()).collect(),
                    volumes: candles.iter().map(|c| c.volume as f64).collect(),
                    per: financials.as_ref().and_then(|f| f.per),
                    pbr: financials.as_ref().and_then(|f| f.pbr),
                    roe: financials.as_ref().and_then(|f| f.roe),
                };
                let scores = score(&inputs);
                (stock, Some(scores), true)
            });
        }

        let results = futures::future::join_all(tasks).await;
        let attempted = results.len();
        let failures = results.iter().filter(|(_, _, ok)| !ok).count();
        let success_rate = if attempted == 0 {
            1.0
        } else {
            (attempted - failures) as f64 / attempted as f64
        };
        if success_rate < self.config.success_floor {
            anyhow::bail!(
                "phase 1 aborted: success rate {:.3} below floor {:.3}",
                success_rate,
                self.config.success_floor
            );
        }

        let mut entries: Vec<WatchlistEntry> = results
            .into_iter()
            .filter_map(|(stock, scores, _)| scores.map(|s| (stock, s)))
            .filter(|(_, scores)| scores.total() >= self.config.score_threshold)
            .map(|(stock, scores)| {
                WatchlistEntry::new(
                    stock.code,
                    stock.name,
                    stock.sector,
                    scores.fundamental,
                    scores.technical,
                    scores.momentum,
                )
            })
            .collect();

        entries.sort_by(|a, b| {
            b.total_score
                .partial_cmp(&a.total_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.code.cmp(&b.code))
        });
        entries.truncate(self.config.max_watchlist);

        for entry in &entries {
            self.watchlist.upsert(entry).await?;
        }
        let keep: Vec<_> = entries.iter().map(|e| e.code.clone()).collect();
        let dropped = self.watchlist.deactivate_except(&keep).await?;

        self.artifacts
            .write_watchlist(&WatchlistSnapshot {
                generated_at: Utc::now(),
                entries: entries.clone(),
            })
            .context("writing watchlist artifact")?;

        info!(
            "Phase 1 complete: {} on watchlist ({} deactivated, success rate {:.3})",
            entries.len(),
            dropped,
            success_rate
        );
        Ok(entries.len())
    }
}

/// Default screening score (`composite_v2`): fundamentals from valuation
/// and profitability, technicals from moving-average position, momentum
/// from the trailing 20-day return. Each component lands on a 0..40-ish
/// band so a strong stock totals near 100.
pub fn composite_screening_score(inputs: &ScreeningInputs) -> ScreeningScores {
    let fundamental = {
        let per = inputs
            .per
            .filter(|p| *p > 0.0)
            .map(|p| (20.0 / p).min(2.0) * 10.0)
            .unwrap_or(5.0);
        let pbr = inputs
            .pbr
            .filter(|p| *p > 0.0)
            .map(|p| (1.5 / p).min(2.0) * 5.0)
            .unwrap_or(2.5);
        let roe = inputs.roe.map(|r| (r * 100.0).clamp(0.0, 10.0)).unwrap_or(0.0);
        per + pbr + roe
    };

    let technical = if inputs.closes.len() >= 20 {
        let last = *inputs.closes.last().unwrap_or(&0.0);
        let ma20 = inputs.closes[inputs.closes.len() - 20..].iter().sum::<f64>() / 20.0;
        if ma20 > f64::EPSILON {
            (15.0 + (last / ma20 - 1.0) * 300.0).clamp(0.0, 30.0)
        } else {
            0.0
        }
    } else {
        0.0
    };

    let momentum = if inputs.closes.len() >= 21 {
        let past = inputs.closes[inputs.closes.len() - 21];
        let last = *inputs.closes.last().unwrap_or(&0.0);
        if past > f64::EPSILON {
            (15.0 + (last / past - 1.0) * 150.0).clamp(0.0, 30.0)
        } else {
            0.0
        }
    } else {
        0.0
    };

    ScreeningScores {
        fundamental,
        technical,
        momentum,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn inputs(closes: Vec<f64>, per: Option<f64>, roe: Option<f64>) -> ScreeningInputs {
        ScreeningInputs {
            volumes: vec![1_000_000.0; closes.len()],
            closes,
            per,
            pbr: Some(1.0),
            roe,
        }
    }

    #[test]
    fn test_uptrending_cheap_stock_scores_high() {
        let closes: Vec<f64> = (0..40).map(|i| 10_000.0 * (1.0 + 0.004 * i as f64)).collect();
        let scores = composite_screening_score(&inputs(closes, Some(8.0), Some(0.15)));
        assert!(scores.fundamental > 20.0);
        assert!(scores.technical > 15.0);
        assert!(scores.momentum > 15.0);
        assert!(scores.total() > 60.0);
    }

    #[test]
    fn test_downtrending_expensive_stock_scores_low() {
        let closes: Vec<f64> = (0..40).map(|i| 10_000.0 * (1.0 - 0.005 * i as f64)).collect();
        let scores = composite_screening_score(&inputs(closes, Some(80.0), Some(0.01)));
        assert!(scores.total() < 40.0, "total {}", scores.total());
    }

    #[test]
    fn test_missing_fundamentals_score_neutral() {
        let closes: Vec<f64> = (0..40).map(|_| 10_000.0).collect();
        let scores = composite_screening_score(&inputs(closes, None, None));
        assert!(scores.fundamental > 0.0);
        assert!(scores.total() < 60.0);
    }

    #[test]
    fn test_short_history_scores_zero_technical() {
        let scores = composite_screening_score(&inputs(vec![10_000.0; 5], Some(10.0), None));
        assert_eq!(scores.technical, 0.0);
        assert_eq!(scores.momentum, 0.0);
    }
}
