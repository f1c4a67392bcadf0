// =============================================================================
// Metrics — Prometheus registry served over axum, with port auto-retry
// =============================================================================
//
// Pull model: GET /metrics for the Prometheus text format, GET /healthz for
// liveness. Label cardinality is bounded at the source: rejection reasons go
// through risk::metric_reason (<= 9 values) and API error types through
// ExchangeError::error_type (<= 7 values).
// =============================================================================

use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{routing::get, Router};
use prometheus::{
    Encoder, HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGauge, Gauge, Opts,
    Registry, TextEncoder,
};
use tracing::{info, warn};

pub struct Metrics {
    registry: Registry,

    pub cycles_total: IntCounterVec,
    pub stage_duration_seconds: HistogramVec,
    pub exposure_at_risk_pct: Gauge,
    pub exposure_pending_pct: Gauge,
    pub nav_usd: Gauge,
    pub open_positions: IntGauge,
    pub open_orders: IntGauge,
    pub fills_total: IntCounterVec,
    pub orders_placed_total: IntCounter,
    pub fill_ratio: Gauge,
    pub order_rejections_total: IntCounterVec,
    pub circuit_breaker_state: IntCounterVec,
    pub api_errors_total: IntCounterVec,
    pub api_consecutive_errors: IntGauge,
    pub no_trade_reason_total: IntCounterVec,
}

impl Metrics {
    pub fn new() -> Result<Arc<Self>> {
        let registry = Registry::new();

        let cycles_total = IntCounterVec::new(
            Opts::new("meridian_cycles_total", "Completed cycles by outcome"),
            &["status"],
        )?;
        let stage_duration_seconds = HistogramVec::new(
            HistogramOpts::new(
                "meridian_stage_duration_seconds",
                "Per-stage wall clock duration",
            )
            .buckets(vec![0.01, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0]),
            &["stage"],
        )?;
        let exposure_at_risk_pct = Gauge::with_opts(Opts::new(
            "meridian_exposure_at_risk_pct",
            "Open position value as percent of NAV",
        ))?;
        let exposure_pending_pct = Gauge::with_opts(Opts::new(
            "meridian_exposure_pending_pct",
            "Pending buy order value as percent of NAV",
        ))?;
        let nav_usd = Gauge::with_opts(Opts::new("meridian_nav_usd", "Net asset value"))?;
        let open_positions = IntGauge::with_opts(Opts::new(
            "meridian_open_positions",
            "Non-dust open positions",
        ))?;
        let open_orders = IntGauge::with_opts(Opts::new(
            "meridian_open_orders",
            "Active (non-terminal) orders",
        ))?;
        let fills_total = IntCounterVec::new(
            Opts::new("meridian_fills_total", "Fills applied, by side"),
            &["side"],
        )?;
        let orders_placed_total = IntCounter::with_opts(Opts::new(
            "meridian_orders_placed_total",
            "Orders sent to the exchange",
        ))?;
        let fill_ratio = Gauge::with_opts(Opts::new(
            "meridian_fill_ratio",
            "Fills over placements, lifetime",
        ))?;
        let order_rejections_total = IntCounterVec::new(
            Opts::new(
                "meridian_order_rejections_total",
                "Risk rejections by bounded reason",
            ),
            &["reason"],
        )?;
        let circuit_breaker_state = IntCounterVec::new(
            Opts::new(
                "meridian_circuit_breaker_trips_total",
                "Circuit breaker trips by breaker",
            ),
            &["breaker"],
        )?;
        let api_errors_total = IntCounterVec::new(
            Opts::new(
                "meridian_api_errors_total",
                "Exchange API errors by normalized type",
            ),
            &["error_type"],
        )?;
        let api_consecutive_errors = IntGauge::with_opts(Opts::new(
            "meridian_api_consecutive_errors",
            "Consecutive exchange API errors",
        ))?;
        let no_trade_reason_total = IntCounterVec::new(
            Opts::new(
                "meridian_no_trade_reason_total",
                "NO_TRADE cycles by reason",
            ),
            &["reason"],
        )?;

        registry.register(Box::new(cycles_total.clone()))?;
        registry.register(Box::new(stage_duration_seconds.clone()))?;
        registry.register(Box::new(exposure_at_risk_pct.clone()))?;
        registry.register(Box::new(exposure_pending_pct.clone()))?;
        registry.register(Box::new(nav_usd.clone()))?;
        registry.register(Box::new(open_positions.clone()))?;
        registry.register(Box::new(open_orders.clone()))?;
        registry.register(Box::new(fills_total.clone()))?;
        registry.register(Box::new(orders_placed_total.clone()))?;
        registry.register(Box::new(fill_ratio.clone()))?;
        registry.register(Box::new(order_rejections_total.clone()))?;
        registry.register(Box::new(circuit_breaker_state.clone()))?;
        registry.register(Box::new(api_errors_total.clone()))?;
        registry.register(Box::new(api_consecutive_errors.clone()))?;
        registry.register(Box::new(no_trade_reason_total.clone()))?;

        Ok(Arc::new(Self {
            registry,
            cycles_total,
            stage_duration_seconds,
            exposure_at_risk_pct,
            exposure_pending_pct,
            nav_usd,
            open_positions,
            open_orders,
            fills_total,
            orders_placed_total,
            fill_ratio,
            order_rejections_total,
            circuit_breaker_state,
            api_errors_total,
            api_consecutive_errors,
            no_trade_reason_total,
        }))
    }

    pub fn render(&self) -> String {
        let encoder = TextEncoder::new();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&self.registry.gather(), &mut buffer) {
            warn!(error = %e, "metrics encode failed");
        }
        String::from_utf8(buffer).unwrap_or_default()
    }

    /// Serve /metrics and /healthz. On bind conflict, the port is retried
    /// across a small range before giving up.
    pub async fn serve(self: Arc<Self>, base_port: u16, retry_range: u16) -> Result<()> {
        let mut last_err: Option<std::io::Error> = None;
        for offset in 0..=retry_range {
            let port = base_port + offset;
            let addr = format!("127.0.0.1:{port}");
            match tokio::net::TcpListener::bind(&addr).await {
                Ok(listener) => {
                    if offset > 0 {
                        warn!(port, base_port, "metrics port conflict, using fallback port");
                    }
                    info!(addr = %addr, "metrics server listening");
                    let metrics = self.clone();
                    let app = Router::new()
                        .route(
                            "/metrics",
                            get(move || {
                                let metrics = metrics.clone();
                                async move { metrics.render() }
                            }),
                        )
                        .route("/healthz", get(|| async { "ok" }));
                    axum::serve(listener, app)
                        .await
                        .context("metrics server failed")?;
                    return Ok(());
                }
                Err(e) => {
                    last_err = Some(e);
                }
            }
        }
        anyhow::bail!(
            "failed to bind metrics port in {}..={}: {:?}",
            base_port,
            base_port + retry_range,
            last_err
        )
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_renders_all_series() {
        let metrics = Metrics::new().unwrap();
        metrics.cycles_total.with_label_values(&["TRADE"]).inc();
        metrics.cycles_total.with_label_values(&["NO_TRADE"]).inc();
        metrics
            .stage_duration_seconds
            .with_label_values(&["universe_build"])
            .observe(0.12);
        metrics.exposure_at_risk_pct.set(12.5);
        metrics.open_positions.set(3);
        metrics
            .order_rejections_total
            .with_label_values(&["pacing"])
            .inc();
        metrics
            .api_errors_total
            .with_label_values(&["timeout"])
            .inc();
        metrics
            .no_trade_reason_total
            .with_label_values(&["empty_universe"])
            .inc();

        let text = metrics.render();
        assert!(text.contains("meridian_cycles_total"));
        assert!(text.contains("meridian_stage_duration_seconds"));
        assert!(text.contains("meridian_exposure_at_risk_pct 12.5"));
        assert!(text.contains("meridian_order_rejections_total"));
        assert!(text.contains("no_trade_reason_total"));
    }

    #[tokio::test]
    async fn port_conflict_falls_through_to_next_port() {
        // Occupy a port, then ask the server to bind the same base port.
        let holder = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let taken = holder.local_addr().unwrap().port();

        let metrics = Metrics::new().unwrap();
        let handle = tokio::spawn(metrics.serve(taken, 3));

        // Give the server a moment to bind its fallback port.
        tokio::time::sleep(std::time::Duration::from_millis(150)).await;
        let mut bound = false;
        for offset in 1..=3u16 {
            if tokio::net::TcpStream::connect(("127.0.0.1", taken + offset))
                .await
                .is_ok()
            {
                bound = true;
                break;
            }
        }
        assert!(bound, "metrics server did not bind a fallback port");
        handle.abort();
    }
}
