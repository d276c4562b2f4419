use crate::application::phase2::{Phase2Pipeline, WeightStore};
use crate::application::risk::{CircuitBreaker, DrawdownMonitor, KellySizer};
use crate::application::scheduler::{JobExecutor, JobKind, RecoveryManager, Scheduler};
use crate::application::screener::{composite_screening_score, Screener};
use crate::application::trading::{CloseOut, TradingEngine};
use crate::config::Config;
use crate::domain::registry::{FunctionMeta, FunctionRegistry};
use crate::infrastructure::broker::{BrokerClient, HttpTokenIssuer, ReqwestTransport};
use crate::infrastructure::cache::Cache;
use crate::infrastructure::governor::{Governor, WindowTag};
use crate::infrastructure::notify::Notifier;
use crate::infrastructure::observability::Metrics;
use crate::infrastructure::persistence::repositories::{
    ErrorLogRepository, SelectionRepository, StockRepository, TradeRepository,
    WatchlistRepository,
};
use crate::infrastructure::persistence::{ArtifactStore, Database};
use crate::infrastructure::token::{TokenManager, TokenStore};
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::NaiveDate;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};

/// Register the built-in pluggable computations. Config selects by name;
/// additional implementations register here.
pub fn default_registry() -> FunctionRegistry {
    let mut registry = FunctionRegistry::new();
    registry.register_screening(
        FunctionMeta {
            name: "composite_v2".to_string(),
            version: "2".to_string(),
            input_columns: vec!["closes", "volumes", "per", "pbr", "roe"],
        },
        Arc::new(composite_screening_score),
    );
    registry.register_volatility_fit(
        FunctionMeta {
            name: "plateau_v1".to_string(),
            version: "1".to_string(),
            input_columns: vec!["volatility"],
        },
        Arc::new(crate::application::phase2::distributor::plateau_volatility_fit),
    );
    registry.register_regime(
        FunctionMeta {
            name: "ma_spread_v1".to_string(),
            version: "1".to_string(),
            input_columns: vec!["index_closes"],
        },
        Arc::new(crate::application::phase2::regime::detect_regime),
    );
    registry.register_optimize(
        FunctionMeta {
            name: "risk_parity_v1".to_string(),
            version: "1".to_string(),
            input_columns: vec!["returns"],
        },
        Arc::new(crate::application::phase2::optimizer::risk_parity),
    );
    registry
}

/// The assembled service: every process-wide resource is created here at
/// init and nowhere else.
pub struct Service {
    pub config: Config,
    pub cache: Arc<Cache>,
    pub governor: Arc<Governor>,
    pub metrics: Metrics,
    pub error_log: Arc<ErrorLogRepository>,
    screener: Screener,
    pipeline: Phase2Pipeline,
    engine: Arc<TradingEngine>,
    closeout: CloseOut,
    artifacts: Arc<ArtifactStore>,
}

impl Service {
    pub async fn build(config: Config) -> Result<Self> {
        let registry = default_registry();
        let functions = &config.file.functions;
        let screening_fn = registry.screening(&functions.screening)?;
        let volatility_fit = registry.volatility_fit(&functions.volatility_fit)?;
        let regime_detect = registry.regime(&functions.regime)?;
        let optimize = registry.optimize(&functions.optimizer)?;
        info!(
            "Function registry: {}",
            registry
                .describe()
                .iter()
                .map(|meta| format!("{} v{}", meta.name, meta.version))
                .collect::<Vec<_>>()
                .join(", ")
        );

        let data_root = Path::new(&config.file.paths.data_root);
        let database = Database::with_pool_size(&config.database_url, config.db_pool_size)
            .await
            .context("database unavailable")?;

        let governor = Arc::new(Governor::new(&config.file.rate_limit));
        let cache = Arc::new(Cache::new(
            config.redis_url.as_deref(),
            config.file.cache.ttls.clone(),
        ));

        let token_store = TokenStore::new(data_root, config.broker.environment);
        let issuer = Arc::new(
            HttpTokenIssuer::new(config.broker.clone()).context("building token issuer")?,
        );
        let tokens = Arc::new(TokenManager::new(token_store, issuer));

        let transport = Arc::new(ReqwestTransport::new().context("building HTTP transport")?);
        let broker = Arc::new(BrokerClient::new(
            transport,
            governor.clone(),
            tokens,
            cache.clone(),
            config.broker.clone(),
            config.file.api.retry.clone(),
            config.file.concurrency.brokerage_max_inflight,
        ));

        let artifacts = Arc::new(ArtifactStore::new(data_root));
        let stocks = Arc::new(StockRepository::new(database.clone()));
        let watchlist = Arc::new(WatchlistRepository::new(database.clone()));
        let selections = Arc::new(SelectionRepository::new(database.clone()));
        let trades = Arc::new(TradeRepository::new(database.clone()));
        let error_log = Arc::new(ErrorLogRepository::new(database.clone()));
        let notifier = Arc::new(Notifier::new(config.notifier.clone()));

        let screener = Screener::new(
            broker.clone(),
            watchlist.clone(),
            stocks,
            artifacts.clone(),
            config.file.phase1.clone(),
            config.file.concurrency.brokerage_max_inflight,
            screening_fn,
        );

        let pipeline = Phase2Pipeline::new(
            broker.clone(),
            watchlist.clone(),
            selections.clone(),
            error_log.clone(),
            artifacts.clone(),
            WeightStore::new(data_root),
            config.file.clone(),
            volatility_fit,
            regime_detect,
            optimize,
        );

        let drawdown = Arc::new(DrawdownMonitor::new(config.file.risk.drawdown.clone()));
        let breaker = Arc::new(CircuitBreaker::new(
            config.file.risk.circuit_breaker.clone(),
            std::env::var("CIRCUIT_RESET_SECRET").ok(),
        ));
        let kelly = KellySizer::new(
            config.file.risk.kelly.clone(),
            config.file.risk.regime_adjustments.clone(),
        );

        let engine = Arc::new(TradingEngine::new(
            broker.clone(),
            selections.clone(),
            trades.clone(),
            error_log.clone(),
            notifier.clone(),
            kelly,
            drawdown.clone(),
            breaker,
        ));

        let closeout = CloseOut::new(
            broker,
            trades,
            artifacts.clone(),
            drawdown,
            notifier,
        );

        let metrics = Metrics::new().context("building metrics registry")?;

        Ok(Self {
            config,
            cache,
            governor,
            metrics,
            error_log,
            screener,
            pipeline,
            engine,
            closeout,
            artifacts,
        })
    }

    pub fn scheduler(self: &Arc<Self>) -> Scheduler {
        let recovery = RecoveryManager::new(
            self.artifacts.clone(),
            self.config.file.phase2.batches,
        );
        Scheduler::new(self.clone(), recovery, self.config.file.phase2.batches)
    }

    /// Periodic telemetry: governor saturation and cache health.
    pub fn spawn_metrics_reporter(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            loop {
                let up = service.cache.ping_primary().await;
                service.metrics.cache_primary_up.set(if up { 1.0 } else { 0.0 });
                for (window, saturation) in service.governor.saturation() {
                    let label = match window {
                        WindowTag::PerSecond => "per_sec",
                        WindowTag::PerMinute => "per_min",
                        WindowTag::PerHour => "per_hour",
                    };
                    service
                        .metrics
                        .governor_saturation
                        .with_label_values(&[label])
                        .set(saturation);
                }
                tokio::time::sleep(Duration::from_secs(30)).await;
            }
        })
    }
}

#[async_trait]
impl JobExecutor for Service {
    async fn execute(&self, kind: JobKind, date: NaiveDate) -> Result<()> {
        match kind {
            JobKind::Phase1 => {
                self.screener.run().await?;
            }
            JobKind::Phase2Batch(batch_id) => {
                self.pipeline.run_batch_with_retry(date, batch_id).await?;
            }
            JobKind::Phase2Finalize => {
                let snapshot = self.pipeline.finalize(date).await?;
                if let Ok(regime) = snapshot.regime.parse() {
                    self.engine.set_regime(regime);
                }
            }
            JobKind::MarketOpen => {
                self.engine.sync_positions().await?;
                if let Ok(snapshot) = self.artifacts.read_selection(date) {
                    if let Ok(regime) = snapshot.regime.parse() {
                        self.engine.set_regime(regime);
                    }
                }
            }
            JobKind::MarketClose => {
                self.engine.cancel_outstanding().await;
                info!("Market close housekeeping done");
            }
            JobKind::CloseOut => {
                self.closeout.run(date).await?;
            }
            JobKind::CacheFlush => {
                self.cache.flush_namespace().await;
            }
        }
        Ok(())
    }

    async fn trading_tick(&self, date: NaiveDate) -> Result<()> {
        if let Err(e) = self.engine.tick(date).await {
            warn!("Trading tick: {e:#}");
        }
        Ok(())
    }
}
