use crate::application::phase2::distributor::{
    composite_priority, distribute, PrioritizedStock,
};
use crate::application::phase2::optimizer::equal_weights;
use crate::application::phase2::scoring::{annualized_volatility, raw_factors, score_batch};
use crate::application::phase2::selector::{
    attractiveness, passes_safety_filter, select_with_sector_cap, target_count,
};
use crate::application::phase2::weights::WeightStore;
use crate::application::risk::stops::{atr, initial_stops};
use crate::config::FileConfig;
use crate::domain::errors::ArtifactError;
use crate::domain::factors::FactorWeights;
use crate::domain::market_regime::MarketRegime;
use crate::domain::registry::{OptimizerInputs, OptimizeFn, RegimeDetectFn, RegimeInputs, VolatilityFitFn};
use crate::domain::selection::{
    BatchArtifact, BatchEntry, DailySelection, SelectionSnapshot, SelectionStatus,
};
use crate::domain::types::{Candle, StockCode};
use crate::infrastructure::broker::BrokerClient;
use crate::infrastructure::persistence::repositories::{
    ErrorLogRepository, ErrorLogRow, SelectionRepository, Severity, WatchlistRepository,
};
use crate::infrastructure::persistence::ArtifactStore;
use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use rust_decimal::prelude::ToPrimitive;
use serde::{Deserialize, Serialize};
use statrs::statistics::Statistics;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use uuid::Uuid;

/// KODEX 200 ETF, the market-index proxy for regime detection and the
/// market-strength factor.
const INDEX_PROXY: &str = "069500";
/// Daily bars fetched per stock: enough for the 60-day windows plus slack.
const HISTORY_DAYS: usize = 80;
const BATCH_MAX_RETRIES: usize = 2;
const RETRY_BASE_DELAY: Duration = Duration::from_secs(2);

/// The day's batch assignment, persisted so that recovery re-runs batches
/// against the same membership the morning run used.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DistributionPlan {
    pub run_date: NaiveDate,
    pub batches: Vec<Vec<PrioritizedStock>>,
}

const PLAN_FILE: &str = "plan.json";

/// Phase-2 batch distributor and scoring pipeline.
pub struct Phase2Pipeline {
    broker: Arc<BrokerClient>,
    watchlist: Arc<WatchlistRepository>,
    selections: Arc<SelectionRepository>,
    error_log: Arc<ErrorLogRepository>,
    artifacts: Arc<ArtifactStore>,
    weight_store: WeightStore,
    config: FileConfig,
    volatility_fit: VolatilityFitFn,
    regime_detect: RegimeDetectFn,
    optimize: OptimizeFn,
    active_weights: tokio::sync::Mutex<FactorWeights>,
}

impl Phase2Pipeline {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        broker: Arc<BrokerClient>,
        watchlist: Arc<WatchlistRepository>,
        selections: Arc<SelectionRepository>,
        error_log: Arc<ErrorLogRepository>,
        artifacts: Arc<ArtifactStore>,
        weight_store: WeightStore,
        config: FileConfig,
        volatility_fit: VolatilityFitFn,
        regime_detect: RegimeDetectFn,
        optimize: OptimizeFn,
    ) -> Self {
        Self {
            broker,
            watchlist,
            selections,
            error_log,
            artifacts,
            weight_store,
            config,
            volatility_fit,
            regime_detect,
            optimize,
            active_weights: tokio::sync::Mutex::new(FactorWeights::defaults()),
        }
    }

    pub fn batch_count(&self) -> usize {
        self.config.phase2.batches
    }

    /// Run one batch with retry and backoff. A persistently failing batch
    /// is marked skipped so the phase can still complete.
    pub async fn run_batch_with_retry(&self, date: NaiveDate, batch_id: usize) -> Result<()> {
        let mut delay = RETRY_BASE_DELAY;
        for attempt in 0..=BATCH_MAX_RETRIES {
            match self.run_batch(date, batch_id).await {
                Ok(()) => return Ok(()),
                Err(e) if attempt < BATCH_MAX_RETRIES => {
                    warn!(
                        "Batch {} attempt {}/{} failed: {e:#}",
                        batch_id,
                        attempt + 1,
                        BATCH_MAX_RETRIES + 1
                    );
                    tokio::time::sleep(delay).await;
                    delay *= 2;
                }
                Err(e) => {
                    let correlation_id = Uuid::new_v4().to_string();
                    warn!(
                        "Batch {} failed permanently, marking skipped (correlation {}): {e:#}",
                        batch_id, correlation_id
                    );
                    self.error_log
                        .insert(
                            &ErrorLogRow::new(
                                Severity::Error,
                                "phase2",
                                format!("batch {batch_id} skipped after retries: {e:#}"),
                            )
                            .with_type_tag("batch_failure")
                            .with_correlation_id(correlation_id),
                        )
                        .await
                        .ok();
                    self.artifacts
                        .write_batch(&BatchArtifact::skipped(batch_id, date))
                        .context("writing skipped-batch artifact")?;
                    return Ok(());
                }
            }
        }
        unreachable!("retry loop returns");
    }

    /// Run one batch: fetch, score, filter, and write the artifact
    /// atomically. Idempotent: an existing valid artifact short-circuits.
    pub async fn run_batch(&self, date: NaiveDate, batch_id: usize) -> Result<()> {
        if self.artifacts.read_batch(date, batch_id).is_ok() {
            info!("Batch {} already has a valid artifact, skipping re-run", batch_id);
            return Ok(());
        }

        let started = std::time::Instant::now();
        let plan = self.ensure_plan(date).await?;
        let Some(batch) = plan.batches.get(batch_id) else {
            anyhow::bail!("batch id {batch_id} outside plan ({} batches)", plan.batches.len());
        };

        // Empty watchlist: the whole phase completes immediately with every
        // batch marked skipped and zero brokerage calls.
        if plan.batches.iter().all(|b| b.is_empty()) {
            self.artifacts
                .write_batch(&BatchArtifact::skipped(batch_id, date))?;
            info!("Batch {}: empty watchlist, marked skipped", batch_id);
            return Ok(());
        }

        if batch.is_empty() {
            self.artifacts
                .write_batch(&BatchArtifact::completed(batch_id, date, Vec::new()))?;
            return Ok(());
        }

        let codes: Vec<StockCode> = batch.iter().map(|s| s.code.clone()).collect();
        let quotes = self.broker.get_prices(&codes).await;
        let floor = self.config.api.batch_success_floor;
        if !quotes.meets_floor(floor) {
            anyhow::bail!(
                "batch {} quote success rate {:.3} below floor {:.3}",
                batch_id,
                quotes.success_rate(),
                floor
            );
        }

        let index_closes = self.index_closes().await?;

        // Collect raw factors per candidate; stocks without enough history
        // drop out with a warning rather than failing the batch.
        let mut inputs = Vec::with_capacity(batch.len());
        for stock in batch {
            if !quotes.quotes.contains_key(&stock.code) {
                continue;
            }
            let candles = match self.broker.get_daily_ohlcv(&stock.code, HISTORY_DAYS).await {
                Ok(candles) => candles,
                Err(e) => {
                    warn!("Batch {}: no history for {}: {}", batch_id, stock.code, e);
                    continue;
                }
            };
            let financials = self
                .broker
                .get_financial_ratios(&stock.code)
                .await
                .unwrap_or(crate::infrastructure::broker::FinancialRatios {
                    per: None,
                    pbr: None,
                    roe: None,
                    eps: None,
                });
            match raw_factors(&candles, &financials, &index_closes) {
                Some(factors) => {
                    inputs.push((stock.code.clone(), stock.sector.clone(), stock.priority, factors))
                }
                None => warn!(
                    "Batch {}: insufficient history for {}, dropped",
                    batch_id, stock.code
                ),
            }
        }

        let weights = {
            let mut active = self.active_weights.lock().await;
            let loaded = self.weight_store.load(Some(&active));
            *active = loaded;
            loaded
        };

        let scored = score_batch(inputs, &weights);
        let filter = &self.config.phase2.legacy_filter;

        let mut entries: Vec<BatchEntry> = scored
            .iter()
            .map(|candidate| BatchEntry {
                code: candidate.code.clone(),
                priority_score: candidate.priority,
                factors: candidate.factors,
                composite: candidate.composite,
                risk_score: candidate.risk_score,
                volume_score: candidate.volume_score,
                technical_score: candidate.technical_score,
                confidence: candidate.confidence,
                signal_count: candidate.signal_count,
                passed_filter: passes_safety_filter(candidate, filter),
            })
            .collect();

        // Deterministic artifact order: priority descending, ties by code.
        entries.sort_by(|a, b| {
            b.priority_score
                .partial_cmp(&a.priority_score)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.code.cmp(&b.code))
        });

        let passed = entries.iter().filter(|e| e.passed_filter).count();
        self.artifacts
            .write_batch(&BatchArtifact::completed(batch_id, date, entries))?;
        info!(
            "Batch {} completed in {:?}: {} scored, {} passed filter",
            batch_id,
            started.elapsed(),
            scored.len(),
            passed
        );
        Ok(())
    }

    /// Aggregate all batch artifacts into the day's ranked selection,
    /// optimize weights, persist rows (upsert) and the snapshot.
    pub async fn finalize(&self, date: NaiveDate) -> Result<SelectionSnapshot> {
        let plan = self.ensure_plan(date).await?;
        let mut candidates = Vec::new();
        for batch_id in 0..self.config.phase2.batches {
            match self.artifacts.read_batch(date, batch_id) {
                Ok(artifact) => {
                    for entry in artifact.entries.into_iter().filter(|e| e.passed_filter) {
                        let sector = plan
                            .batches
                            .iter()
                            .flatten()
                            .find(|s| s.code == entry.code)
                            .map(|s| s.sector.clone())
                            .unwrap_or_else(|| "Unknown".to_string());
                        candidates.push(crate::application::phase2::scoring::ScoredCandidate {
                            code: entry.code,
                            sector,
                            priority: entry.priority_score,
                            factors: entry.factors,
                            composite: entry.composite,
                            risk_score: entry.risk_score,
                            volume_score: entry.volume_score,
                            technical_score: entry.technical_score,
                            confidence: entry.confidence,
                            signal_count: entry.signal_count,
                        });
                    }
                }
                Err(ArtifactError::Missing { .. }) => {
                    anyhow::bail!("cannot finalize: batch {batch_id} artifact missing")
                }
                Err(e) => anyhow::bail!("cannot finalize: batch {batch_id} artifact invalid: {e}"),
            }
        }

        // Nothing survived (or the watchlist was empty): finish without
        // touching the brokerage at all.
        if candidates.is_empty() {
            let snapshot = SelectionSnapshot {
                run_date: date,
                regime: MarketRegime::Sideways.to_string(),
                selections: Vec::new(),
                completed_at: Utc::now(),
            };
            self.artifacts.write_selection(&snapshot)?;
            info!("Phase 2 finalized with an empty selection");
            return Ok(snapshot);
        }

        let regime = match self.index_closes().await {
            Ok(closes) => (self.regime_detect)(&RegimeInputs { index_closes: closes }),
            Err(e) => {
                warn!("Regime detection fell back to sideways: {e:#}");
                MarketRegime::Sideways
            }
        };

        let target = target_count(regime, &self.config.phase2.target_counts);
        let selected =
            select_with_sector_cap(candidates, target, self.config.phase2.sector_cap);

        // Position weights from the pluggable optimizer, equal-weight on
        // failure. Both paths respect the per-position bounds.
        let mut histories: Vec<Vec<Candle>> = Vec::with_capacity(selected.len());
        for candidate in &selected {
            histories.push(
                self.broker
                    .get_daily_ohlcv(&candidate.code, HISTORY_DAYS)
                    .await
                    .with_context(|| format!("history for {}", candidate.code))?,
            );
        }
        let returns: Vec<Vec<f64>> = histories.iter().map(|candles| daily_returns(candles)).collect();

        let bounds = (
            crate::domain::selection::POSITION_FRACTION_MIN
                .to_f64()
                .unwrap_or(0.02),
            crate::domain::selection::POSITION_FRACTION_MAX
                .to_f64()
                .unwrap_or(0.40),
        );
        let optimizer_inputs = OptimizerInputs {
            returns,
            weight_min: bounds.0,
            weight_max: bounds.1,
        };
        let fractions = match (self.optimize)(&optimizer_inputs) {
            Some(weights) => weights,
            None => {
                warn!("Portfolio optimization failed, using equal-weight fallback");
                match equal_weights(selected.len(), bounds.0, bounds.1) {
                    Some(weights) => weights,
                    None => {
                        // Too few names for a fully invested portfolio; cap
                        // each at the maximum and leave the rest in cash.
                        warn!(
                            "Equal weight infeasible for {} positions, capping at {}",
                            selected.len(),
                            bounds.1
                        );
                        vec![(1.0 / selected.len() as f64).min(bounds.1); selected.len()]
                    }
                }
            }
        };

        let mut selections = Vec::with_capacity(selected.len());
        for (candidate, (fraction, candles)) in
            selected.iter().zip(fractions.iter().zip(histories.iter()))
        {
            let quote = self
                .broker
                .get_price(&candidate.code)
                .await
                .with_context(|| format!("entry quote for {}", candidate.code))?;
            let atr_value = atr(candles).unwrap_or_else(|| quote.price * rust_decimal_macros::dec!(0.02));
            let (stop_loss, take_profit) = initial_stops(quote.price, atr_value, regime);

            let selection = DailySelection {
                code: candidate.code.clone(),
                selection_date: date,
                entry_price: quote.price,
                attractiveness: attractiveness(candidate, &self.config.phase2.composite_weights),
                risk_score: candidate.risk_score,
                signal_count: candidate.signal_count,
                stop_loss,
                take_profit,
                target_position_fraction: rust_decimal::Decimal::from_f64_retain(*fraction)
                    .unwrap_or_default()
                    .round_dp(6),
                sector: candidate.sector.clone(),
                status: SelectionStatus::Pending,
            };
            if let Err(e) = selection.check_fraction() {
                warn!("Selection {} fraction out of bounds: {}", selection.code, e);
            }
            self.selections.upsert(&selection).await?;
            selections.push(selection);
        }

        let snapshot = SelectionSnapshot {
            run_date: date,
            regime: regime.to_string(),
            selections,
            completed_at: Utc::now(),
        };
        self.artifacts.write_selection(&snapshot)?;
        info!(
            "Phase 2 finalized: {} selections, regime {}",
            snapshot.selections.len(),
            regime
        );
        Ok(snapshot)
    }

    /// Load or build the day's distribution plan. The plan is itself an
    /// artifact, so a restart distributes identically.
    pub async fn ensure_plan(&self, date: NaiveDate) -> Result<DistributionPlan> {
        if let Ok(plan) = self
            .artifacts
            .read_day_json::<DistributionPlan>(date, PLAN_FILE)
        {
            if plan.run_date == date && plan.batches.len() == self.config.phase2.batches {
                return Ok(plan);
            }
        }

        let entries = self.watchlist.active_entries().await?;
        if entries.is_empty() {
            let plan = DistributionPlan {
                run_date: date,
                batches: vec![Vec::new(); self.config.phase2.batches],
            };
            self.artifacts.write_day_json(date, PLAN_FILE, &plan)?;
            info!("Distribution plan: watchlist empty, all batches empty");
            return Ok(plan);
        }

        // Raw priority components per stock, then scaled across the
        // watchlist so the configured weights mix comparable magnitudes.
        let mut raw: Vec<(StockCode, String, f64, f64, f64)> = Vec::new();
        for entry in &entries {
            let candles = match self.broker.get_daily_ohlcv(&entry.code, HISTORY_DAYS).await {
                Ok(candles) if candles.len() >= 61 => candles,
                Ok(_) | Err(_) => {
                    warn!("Plan: dropping {} (insufficient history)", entry.code);
                    continue;
                }
            };
            let closes: Vec<f64> = candles.iter().filter_map(|c| c.close.to_f64()).collect();
            if closes.len() < 61 {
                warn!("Plan: dropping {} (unparsable close series)", entry.code);
                continue;
            }
            let volumes: Vec<f64> = candles.iter().map(|c| c.volume as f64).collect();
            let last = *closes.last().unwrap_or(&0.0);
            let ma20 = closes[closes.len() - 20..].iter().sum::<f64>() / 20.0;
            let ma60 = closes[closes.len() - 60..].iter().sum::<f64>() / 60.0;
            let technical = (last / ma20 - 1.0) + (last / ma60 - 1.0);
            let fast = volumes[volumes.len() - 5..].iter().sum::<f64>() / 5.0;
            let slow = volumes[volumes.len() - 20..].iter().sum::<f64>() / 20.0;
            let volume_trend = if slow > f64::EPSILON { fast / slow - 1.0 } else { 0.0 };
            let volatility = annualized_volatility(&closes).unwrap_or(0.0);
            raw.push((entry.code.clone(), entry.sector.clone(), technical, volume_trend, volatility));
        }

        let technical_scaled = scale_column(raw.iter().map(|r| r.2).collect());
        let volume_scaled = scale_column(raw.iter().map(|r| r.3).collect());

        let stocks: Vec<PrioritizedStock> = raw
            .into_iter()
            .enumerate()
            .map(|(i, (code, sector, _, _, volatility))| {
                let priority = composite_priority(
                    &self.config.phase2.priority_calculation,
                    technical_scaled[i],
                    volume_scaled[i],
                    volatility,
                    &self.volatility_fit,
                );
                PrioritizedStock {
                    code,
                    sector,
                    priority,
                    technical: technical_scaled[i],
                    volume_trend: volume_scaled[i],
                    volatility,
                }
            })
            .collect();

        let plan = DistributionPlan {
            run_date: date,
            batches: distribute(stocks, self.config.phase2.batches),
        };
        self.artifacts.write_day_json(date, PLAN_FILE, &plan)?;
        info!(
            "Distribution plan built: {} stocks over {} batches",
            plan.batches.iter().map(|b| b.len()).sum::<usize>(),
            plan.batches.len()
        );
        Ok(plan)
    }

    async fn index_closes(&self) -> Result<Vec<f64>> {
        let code = StockCode::parse(INDEX_PROXY)
            .map_err(|e| anyhow::anyhow!("index proxy code: {e}"))?;
        let candles = self
            .broker
            .get_daily_ohlcv(&code, HISTORY_DAYS)
            .await
            .context("index proxy history")?;
        Ok(candles.iter().filter_map(|c| c.close.to_f64()).collect())
    }
}

/// Scale a raw component column to the common 0..100 band (mean 50,
/// stdev 15) used by the priority mix.
fn scale_column(values: Vec<f64>) -> Vec<f64> {
    let mean = values.as_slice().mean();
    let std = values.as_slice().std_dev();
    values
        .iter()
        .map(|v| {
            if std.is_finite() && std > f64::EPSILON {
                (50.0 + 15.0 * (v - mean) / std).clamp(0.0, 100.0)
            } else {
                50.0
            }
        })
        .collect()
}

fn daily_returns(candles: &[Candle]) -> Vec<f64> {
    let closes: Vec<f64> = candles.iter().filter_map(|c| c.close.to_f64()).collect();
    closes
        .windows(2)
        .filter(|w| w[0] > f64::EPSILON)
        .map(|w| w[1] / w[0] - 1.0)
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_scale_column_neutral_on_flat_input() {
        let scaled = scale_column(vec![3.0, 3.0, 3.0]);
        assert!(scaled.iter().all(|v| (*v - 50.0).abs() < 1e-9));
    }

    #[test]
    fn test_scale_column_orders_preserved() {
        let scaled = scale_column(vec![1.0, 5.0, 3.0]);
        assert!(scaled[1] > scaled[2] && scaled[2] > scaled[0]);
        assert!(scaled.iter().all(|v| (0.0..=100.0).contains(v)));
    }

    #[test]
    fn test_daily_returns() {
        use chrono::NaiveDate;
        use rust_decimal::prelude::FromPrimitive;
        let code = StockCode::parse("005930").unwrap();
        let start = NaiveDate::from_ymd_opt(2026, 1, 5).unwrap();
        let candles: Vec<Candle> = [100.0, 110.0, 99.0]
            .iter()
            .enumerate()
            .map(|(i, close)| Candle {
                code: code.clone(),
                date: start + chrono::Duration::days(i as i64),
                open: rust_decimal::Decimal::from_f64(*close).unwrap(),
                high: rust_decimal::Decimal::from_f64(*close).unwrap(),
                low: rust_decimal::Decimal::from_f64(*close).unwrap(),
                close: rust_decimal::Decimal::from_f64(*close).unwrap(),
                volume: 1,
            })
            .collect();
        let returns = daily_returns(&candles);
        assert_eq!(returns.len(), 2);
        assert!((returns[0] - 0.10).abs() < 1e-9);
        assert!((returns[1] + 0.10).abs() < 1e-9);
    }
}
