//! Prometheus metrics definitions for kquant
//!
//! All metrics use the `kquant_` prefix and are read-only.

use prometheus::{
    core::{AtomicF64, GenericGauge, GenericGaugeVec},
    CounterVec, Gauge, GaugeVec, Opts, Registry, TextEncoder,
};
use std::sync::Arc;

/// Prometheus metrics for the trading service
#[derive(Clone)]
pub struct Metrics {
    registry: Arc<Registry>,
    /// Redis primary-tier health (1 = up, 0 = demoted to fallback)
    pub cache_primary_up: GenericGauge<AtomicF64>,
    /// Cache lookups by tier and outcome
    pub cache_lookups_total: CounterVec,
    /// Governor window saturation (used / cap) per window
    pub governor_saturation: GenericGaugeVec<AtomicF64>,
    /// Brokerage API calls by endpoint and outcome
    pub api_calls_total: CounterVec,
    /// Circuit breaker status (0 = closed, 1 = tripped)
    pub circuit_breaker_status: GenericGauge<AtomicF64>,
    /// Current drawdown fraction
    pub drawdown_current: GenericGauge<AtomicF64>,
    /// Phase-2 batch runtime, seconds, by batch id
    pub batch_duration_seconds: GenericGaugeVec<AtomicF64>,
    /// Orders placed by side and result
    pub orders_total: CounterVec,
    /// Realtime stream reconnects
    pub ws_reconnects_total: CounterVec,
}

impl Metrics {
    pub fn new() -> anyhow::Result<Self> {
        let registry = Registry::new();

        let cache_primary_up = Gauge::with_opts(Opts::new(
            "kquant_cache_primary_up",
            "Redis primary tier health (1 up, 0 demoted)",
        ))?;
        registry.register(Box::new(cache_primary_up.clone()))?;

        let cache_lookups_total = CounterVec::new(
            Opts::new("kquant_cache_lookups_total", "Cache lookups by tier and outcome"),
            &["tier", "outcome"],
        )?;
        registry.register(Box::new(cache_lookups_total.clone()))?;

        let governor_saturation = GaugeVec::new(
            Opts::new("kquant_governor_saturation", "Rate window saturation (used / cap)"),
            &["window"],
        )?;
        registry.register(Box::new(governor_saturation.clone()))?;

        let api_calls_total = CounterVec::new(
            Opts::new("kquant_api_calls_total", "Brokerage API calls by endpoint and outcome"),
            &["endpoint", "outcome"],
        )?;
        registry.register(Box::new(api_calls_total.clone()))?;

        let circuit_breaker_status = Gauge::with_opts(Opts::new(
            "kquant_circuit_breaker_status",
            "Circuit breaker status (0 closed, 1 tripped)",
        ))?;
        registry.register(Box::new(circuit_breaker_status.clone()))?;

        let drawdown_current = Gauge::with_opts(Opts::new(
            "kquant_drawdown_current",
            "Current drawdown fraction from the high-water mark",
        ))?;
        registry.register(Box::new(drawdown_current.clone()))?;

        let batch_duration_seconds = GaugeVec::new(
            Opts::new("kquant_batch_duration_seconds", "Phase-2 batch runtime in seconds"),
            &["batch"],
        )?;
        registry.register(Box::new(batch_duration_seconds.clone()))?;

        let orders_total = CounterVec::new(
            Opts::new("kquant_orders_total", "Orders placed by side and result"),
            &["side", "result"],
        )?;
        registry.register(Box::new(orders_total.clone()))?;

        let ws_reconnects_total = CounterVec::new(
            Opts::new("kquant_ws_reconnects_total", "Realtime stream reconnects"),
            &["reason"],
        )?;
        registry.register(Box::new(ws_reconnects_total.clone()))?;

        Ok(Self {
            registry: Arc::new(registry),
            cache_primary_up,
            cache_lookups_total,
            governor_saturation,
            api_calls_total,
            circuit_breaker_status,
            drawdown_current,
            batch_duration_seconds,
            orders_total,
            ws_reconnects_total,
        })
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> anyhow::Result<String> {
        let encoder = TextEncoder::new();
        let families = self.registry.gather();
        Ok(encoder.encode_to_string(&families)?)
    }
}
