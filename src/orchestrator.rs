// =============================================================================
// Cycle Orchestrator — the deterministic trading pipeline
// =============================================================================
//
// One cycle, strict stage order:
//   reconcile -> portfolio -> universe -> regime -> signals -> trim -> purge
//   -> proposals -> risk -> execution -> post-trade reconcile -> stale-order
//   cleanup -> audit
//
// Each stage runs inside a timer with a configurable budget; overruns warn
// and alert but never abort. Any error inside a cycle marks the cycle ERROR,
// fires an alert, and the loop continues: only the kill switch or a shutdown
// signal stops the process.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Context, Result};
use chrono::Utc;
use futures_util::{stream, StreamExt};
use rand::Rng;
use tracing::{error, info, warn};

use crate::alerts::{AlertPipeline, AlertSeverity};
use crate::audit::{AuditWriter, CycleAudit, UniverseAudit};
use crate::coinbase::{Candle, ExchangeApi, Product, QuoteTick};
use crate::config::Config;
use crate::execution::{ExecutionEngine, ExecutionOutcome};
use crate::metrics::Metrics;
use crate::orders::OrderStateMachine;
use crate::portfolio::{build_portfolio, PortfolioState};
use crate::regime::{RegimeDetector, RegimeInput};
use crate::risk::{self, RiskEngine, RiskInputs, RiskResult};
use crate::sentinel;
use crate::signals::SignalManager;
use crate::store::StateStore;
use crate::strategies::{merge_proposals, ProposalSource, Strategy, StrategyContext};
use crate::types::{CycleOutcome, ExecutionMode, Regime};
use crate::universe::{UniverseManager, UniverseSnapshot};

/// 15-minute bars for signal scans; enough history for the 24 h mean.
const SIGNAL_GRANULARITY_SECS: u32 = 900;
const SIGNAL_BARS: u32 = 120;
/// Hourly bars for regime detection.
const REGIME_GRANULARITY_SECS: u32 = 3600;
const REGIME_BARS: u32 = 30;
const CANDLE_FETCH_WORKERS: usize = 5;
/// Sleep slices so the stop flag is honored promptly between cycles.
const SLEEP_SLICE: Duration = Duration::from_millis(500);

pub struct Orchestrator {
    cfg: Config,
    config_hash: String,
    data_dir: PathBuf,
    exchange: Arc<dyn ExchangeApi>,
    store: Arc<StateStore>,
    alerts: Arc<AlertPipeline>,
    universe_mgr: UniverseManager,
    signal_mgr: SignalManager,
    strategies: Vec<Box<dyn Strategy>>,
    advisors: Vec<Box<dyn ProposalSource>>,
    risk: RiskEngine,
    exec: Arc<ExecutionEngine>,
    osm: Arc<OrderStateMachine>,
    metrics: Arc<Metrics>,
    audit: AuditWriter,
    regime_detector: RegimeDetector,
    stop: Arc<AtomicBool>,
    last_cycle_ms: u64,
}

impl Orchestrator {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        cfg: Config,
        exchange: Arc<dyn ExchangeApi>,
        store: Arc<StateStore>,
        alerts: Arc<AlertPipeline>,
        osm: Arc<OrderStateMachine>,
        exec: Arc<ExecutionEngine>,
        strategies: Vec<Box<dyn Strategy>>,
        advisors: Vec<Box<dyn ProposalSource>>,
        metrics: Arc<Metrics>,
        stop: Arc<AtomicBool>,
    ) -> Self {
        let config_hash = cfg.hash();
        let data_dir = PathBuf::from(&cfg.app.data_dir);
        let mut signal_mgr = SignalManager::new(cfg.signals.clone());
        signal_mgr.restore_auto_tune(&store);

        Self {
            universe_mgr: UniverseManager::new(cfg.universe.clone()),
            signal_mgr,
            risk: RiskEngine::new(
                cfg.policy.risk.clone(),
                cfg.policy.execution.clone(),
                &cfg.strategies.strategies,
            ),
            regime_detector: RegimeDetector::new(cfg.universe.regime.clone()),
            audit: AuditWriter::new(&cfg.app.data_dir),
            config_hash,
            data_dir,
            cfg,
            exchange,
            store,
            alerts,
            strategies,
            advisors,
            exec,
            osm,
            metrics,
            stop,
            last_cycle_ms: 0,
        }
    }

    // =========================================================================
    // Startup validations (first cycle only)
    // =========================================================================

    pub async fn startup_validations(&self) -> Result<()> {
        info!(
            config_hash = %self.config_hash,
            mode = %self.cfg.app.mode,
            "startup validations"
        );

        // Clock skew against the exchange clock that signs our requests.
        let server_time = self
            .exchange
            .get_server_time()
            .await
            .context("failed to fetch exchange server time")?;
        let skew_ms = (Utc::now() - server_time).num_milliseconds().unsigned_abs();
        if skew_ms > self.cfg.policy.startup.max_clock_skew_ms {
            bail!(
                "clock skew {}ms exceeds the {}ms limit; refusing to start",
                skew_ms,
                self.cfg.policy.startup.max_clock_skew_ms
            );
        }
        info!(skew_ms, "clock skew within bounds");

        // Secret rotation freshness (warn-only).
        if let Some(max_days) = self.cfg.policy.startup.max_key_age_days {
            if let Ok(created) = std::env::var("CB_KEY_CREATED_AT") {
                if let Ok(ts) = chrono::DateTime::parse_from_rfc3339(&created) {
                    let age_days = (Utc::now() - ts.with_timezone(&Utc)).num_days();
                    if age_days > max_days as i64 {
                        warn!(age_days, max_days, "API key is older than the rotation policy");
                    }
                }
            }
        }

        Ok(())
    }

    // =========================================================================
    // The loop
    // =========================================================================

    pub async fn run_loop(&mut self) -> Result<()> {
        self.startup_validations().await?;

        while !self.stop.load(Ordering::Relaxed) {
            let outcome = self.run_cycle().await;
            info!(outcome = %outcome, cycle_ms = self.last_cycle_ms, "cycle complete");

            if self.stop.load(Ordering::Relaxed) {
                break;
            }
            self.sleep_between_cycles().await;
        }

        self.shutdown().await
    }

    pub async fn run_once(&mut self) -> Result<CycleOutcome> {
        self.startup_validations().await?;
        let outcome = self.run_cycle().await;
        self.store.flush().context("final state flush failed")?;
        Ok(outcome)
    }

    async fn sleep_between_cycles(&self) {
        let base_ms = self.cfg.app.loop_interval_seconds as f64 * 1000.0;
        let jitter = self.cfg.app.loop_jitter_pct;
        let factor = 1.0 + rand::rng().random_range(-jitter..=jitter);

        // Auto-backoff: a cycle that ate too much of its interval earns the
        // loop a longer breather.
        let utilization = self.last_cycle_ms as f64 / base_ms;
        let backoff_ms = if utilization > self.cfg.app.cycle_utilization_target {
            warn!(
                utilization = format!("{utilization:.2}"),
                target = self.cfg.app.cycle_utilization_target,
                "cycle utilization over target, backing off"
            );
            base_ms * 0.5
        } else {
            0.0
        };

        let total = Duration::from_millis((base_ms * factor + backoff_ms) as u64);
        let deadline = Instant::now() + total;
        while !self.stop.load(Ordering::Relaxed) {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            tokio::time::sleep(SLEEP_SLICE.min(remaining)).await;
        }
    }

    /// Graceful shutdown: cancel all active orders (batch with individual
    /// fallback), flush state, emit a summary.
    pub async fn shutdown(&mut self) -> Result<()> {
        warn!("shutdown: canceling active orders and flushing state");
        let canceled = self.exec.cancel_all_active().await.unwrap_or(0);
        self.store.flush().context("shutdown state flush failed")?;
        let (positions, cycles) = self
            .store
            .with(|s| (s.positions.len(), s.cycle_count));
        info!(
            canceled_orders = canceled,
            open_positions = positions,
            total_cycles = cycles,
            "cleanup complete"
        );
        Ok(())
    }

    // =========================================================================
    // One cycle
    // =========================================================================

    pub async fn run_cycle(&mut self) -> CycleOutcome {
        let cycle_number = self.store.update(|s| {
            s.cycle_count += 1;
            s.cycle_count
        });
        let cycle_start = Instant::now();
        let mut audit = CycleAudit::begin(cycle_number, self.regime_detector.current(), &self.config_hash);

        let outcome = match self.cycle_inner(&mut audit).await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "cycle failed");
                audit.error = Some(e.to_string());
                audit.no_trade_reason = Some("cycle_error".to_string());

                let burst = self.store.update(|s| s.record_cycle_error(Utc::now()));
                let severity = if burst >= 2 {
                    AlertSeverity::Critical
                } else {
                    AlertSeverity::Warning
                };
                self.alerts.notify(
                    severity,
                    if burst >= 2 { "exception_burst" } else { "cycle_error" },
                    &format!("cycle {cycle_number} failed: {e}"),
                    serde_json::json!({ "errors_in_window": burst }),
                );
                CycleOutcome::Error
            }
        };

        self.last_cycle_ms = cycle_start.elapsed().as_millis() as u64;
        audit.total_ms = self.last_cycle_ms;
        audit.status = outcome;

        if self.last_cycle_ms > self.cfg.policy.latency.total_budget_ms {
            warn!(
                cycle_ms = self.last_cycle_ms,
                budget_ms = self.cfg.policy.latency.total_budget_ms,
                "cycle exceeded total latency budget"
            );
            self.alerts.notify(
                AlertSeverity::Warning,
                "latency_budget_exceeded",
                &format!(
                    "cycle took {}ms (budget {}ms)",
                    self.last_cycle_ms, self.cfg.policy.latency.total_budget_ms
                ),
                serde_json::Value::Null,
            );
        }

        self.metrics
            .cycles_total
            .with_label_values(&[&outcome.to_string()])
            .inc();
        if outcome == CycleOutcome::NoTrade {
            let reason = audit
                .no_trade_reason
                .clone()
                .unwrap_or_else(|| "none".to_string());
            self.metrics
                .no_trade_reason_total
                .with_label_values(&[&reason])
                .inc();
        }
        self.metrics
            .api_consecutive_errors
            .set(self.exchange.consecutive_errors() as i64);
        self.metrics.open_orders.set(self.osm.active_orders().len() as i64);

        self.alerts.tick(Utc::now());
        self.audit.append(&audit);
        self.osm.prune_terminal();
        outcome
    }

    async fn cycle_inner(&mut self, audit: &mut CycleAudit) -> Result<CycleOutcome> {
        // ── 2. Reconcile open orders (ghost markers cleared first) ──────
        let t = Instant::now();
        self.reconcile_open_orders().await;
        self.finish_stage(audit, "reconcile_orders", t, None);

        // ── 3. Portfolio ────────────────────────────────────────────────
        let t = Instant::now();
        let held: Vec<String> = self.store.with(|s| s.positions.keys().cloned().collect());
        let mut quotes = self.fetch_quotes(&held).await;
        let balances = if self.cfg.app.mode == ExecutionMode::Live {
            self.exchange
                .get_accounts()
                .await
                .map_err(|e| anyhow::anyhow!("get_accounts failed: {e}"))?
        } else {
            Vec::new()
        };
        let portfolio = build_portfolio(
            self.cfg.app.mode,
            &self.store,
            &balances,
            &quotes,
            self.cfg.app.paper_nav_usd,
            self.cfg.policy.risk.min_dust_usd,
            Utc::now(),
        );
        self.metrics.nav_usd.set(portfolio.nav_usd);
        self.metrics
            .exposure_at_risk_pct
            .set(portfolio.total_exposure_pct);
        let pending_pct = if portfolio.nav_usd > 0.0 {
            portfolio
                .pending_orders
                .values()
                .filter(|o| o.side == crate::types::Side::Buy && !o.status.is_terminal())
                .map(|o| o.size_quote)
                .sum::<f64>()
                / portfolio.nav_usd
                * 100.0
        } else {
            0.0
        };
        self.metrics.exposure_pending_pct.set(pending_pct);
        self.metrics
            .open_positions
            .set(portfolio.open_position_count() as i64);
        self.finish_stage(audit, "portfolio", t, None);

        // ── 4. Universe (built under the previous cycle's regime) ──────
        let t = Instant::now();
        let products = self.fetch_products().await?;
        let regime_for_universe = self.regime_detector.current();
        let snapshot = self
            .universe_mgr
            .build(
                self.exchange.as_ref(),
                &products,
                &self.store,
                &self.alerts,
                regime_for_universe,
            )
            .await?;
        audit.universe = UniverseAudit {
            eligible_per_tier: [
                snapshot.tiers[0].len(),
                snapshot.tiers[1].len(),
                snapshot.tiers[2].len(),
            ],
            excluded: snapshot.excluded.len(),
        };
        self.finish_stage(
            audit,
            "universe_build",
            t,
            Some(self.cfg.policy.latency.universe_build_ms),
        );

        // ── 5. Regime detection (feeds the NEXT universe build) ─────────
        let t = Instant::now();
        let regime = self.detect_regime(&snapshot, &portfolio).await;
        audit.regime = regime;
        self.finish_stage(audit, "regime", t, None);

        if regime == Regime::Crash {
            audit.no_trade_reason = Some("crash_regime".to_string());
            return Ok(CycleOutcome::NoTrade);
        }
        if snapshot.eligible_count() == 0 {
            audit.no_trade_reason = Some("empty_universe".to_string());
            return Ok(CycleOutcome::NoTrade);
        }

        // Quotes for everything the rest of the cycle may touch.
        let eligible = snapshot.eligible_symbols();
        quotes.extend(self.fetch_quotes(&eligible).await);

        // ── 6. Signal scan ──────────────────────────────────────────────
        let t = Instant::now();
        let candles = self
            .fetch_candles(&eligible, SIGNAL_GRANULARITY_SECS, SIGNAL_BARS)
            .await;
        let triggers = self.signal_mgr.scan_universe(&snapshot, &candles, regime);
        let outlier_skipped = self.signal_mgr.outlier_skipped(&snapshot, &candles);
        self.signal_mgr
            .note_cycle_result(&self.store, !triggers.is_empty());
        audit.triggers = triggers.clone();
        self.finish_stage(
            audit,
            "signal_scan",
            t,
            Some(self.cfg.policy.latency.signal_scan_ms),
        );

        // ── 7. Auto-trim ────────────────────────────────────────────────
        let t = Instant::now();
        if self.cfg.policy.auto_trim_enabled
            && portfolio.total_exposure_pct > self.cfg.policy.risk.max_total_at_risk_pct
        {
            self.exec
                .auto_trim(
                    &portfolio,
                    self.cfg.policy.risk.max_total_at_risk_pct,
                    &quotes,
                )
                .await?;
        }
        self.finish_stage(audit, "trim", t, None);

        // ── 8. Purge ineligible / banned holdings ───────────────────────
        let t = Instant::now();
        self.exec
            .purge_ineligible(&portfolio, &snapshot, &quotes)
            .await?;
        self.finish_stage(audit, "purge", t, None);

        // ── 9. Proposals (strategies + external sources, deduped) ───────
        let t = Instant::now();
        let ctx = StrategyContext {
            universe: &snapshot,
            triggers: &triggers,
            regime,
            timestamp: Utc::now(),
            portfolio: &portfolio,
        };
        let mut raw: Vec<_> = Vec::new();
        for strategy in &self.strategies {
            raw.extend(strategy.generate(&ctx));
        }
        for advisor in &self.advisors {
            raw.extend(advisor.propose(&ctx));
        }
        let proposals = merge_proposals(raw, self.cfg.policy.risk.max_single_trade_pct);
        audit.proposals = proposals.clone();
        self.finish_stage(audit, "proposals", t, None);

        if proposals.is_empty() {
            audit.no_trade_reason = Some(if triggers.is_empty() {
                "no_triggers".to_string()
            } else {
                "no_proposals".to_string()
            });
            return Ok(CycleOutcome::NoTrade);
        }

        // ── 10. Risk check ──────────────────────────────────────────────
        let t = Instant::now();
        let result = self.risk.check(
            &self.store,
            RiskInputs {
                proposals: proposals.clone(),
                portfolio: &portfolio,
                universe: &snapshot,
                products: &products,
                quotes: &quotes,
                outlier_skipped: &outlier_skipped,
                consecutive_api_errors: self.exchange.consecutive_errors(),
                kill_switch_file_present: sentinel::kill_switch_present(&self.data_dir),
                now: Utc::now(),
            },
        );
        audit.approved = result.approved_proposals.clone();
        audit.rejections = result.proposal_rejections.clone();
        for check in &result.violated_checks {
            self.metrics
                .order_rejections_total
                .with_label_values(&[risk::metric_reason(check)])
                .inc();
        }
        self.finish_stage(
            audit,
            "risk_check",
            t,
            Some(self.cfg.policy.latency.risk_check_ms),
        );

        self.raise_risk_alerts(&result).await;

        if result.approved_proposals.is_empty() {
            audit.no_trade_reason = Some(
                result
                    .reason
                    .clone()
                    .or_else(|| result.violated_checks.first().cloned())
                    .unwrap_or_else(|| "risk_rejected".to_string()),
            );
            return Ok(CycleOutcome::NoTrade);
        }

        // ── 11. Execute ─────────────────────────────────────────────────
        let t = Instant::now();
        let reports = self
            .exec
            .execute(
                &result.approved_proposals,
                &portfolio,
                &products,
                &quotes,
                &snapshot,
            )
            .await?;
        for report in &reports {
            if matches!(
                report.outcome,
                ExecutionOutcome::Placed { .. } | ExecutionOutcome::Filled { .. }
            ) {
                self.metrics.orders_placed_total.inc();
            }
            if let ExecutionOutcome::Filled { .. } = report.outcome {
                self.metrics
                    .fills_total
                    .with_label_values(&[&report.side.to_string()])
                    .inc();
            }
        }
        audit.executions = reports.clone();
        self.finish_stage(
            audit,
            "execution",
            t,
            Some(self.cfg.policy.latency.execution_ms),
        );

        // ── 12. Post-trade wait, then reconcile fills ───────────────────
        let t = Instant::now();
        let placed_any = reports
            .iter()
            .any(|r| matches!(r.outcome, ExecutionOutcome::Placed { .. }));
        if placed_any {
            tokio::time::sleep(Duration::from_millis(
                self.cfg.policy.execution.post_trade_reconcile_wait_ms,
            ))
            .await;
        }
        audit.fills_applied = self.exec.reconcile_fills().await.unwrap_or(0);
        let placed_total = self.metrics.orders_placed_total.get();
        if placed_total > 0 {
            let fills: u64 = ["BUY", "SELL"]
                .iter()
                .map(|s| self.metrics.fills_total.with_label_values(&[*s]).get())
                .sum();
            self.metrics
                .fill_ratio
                .set(fills as f64 / placed_total as f64);
        }
        self.finish_stage(
            audit,
            "post_trade_reconcile",
            t,
            Some(self.cfg.policy.latency.reconcile_ms),
        );

        // ── 13. Stale-order cleanup ─────────────────────────────────────
        let t = Instant::now();
        self.exec.manage_open_orders().await?;
        self.finish_stage(audit, "manage_orders", t, None);

        let traded = reports.iter().any(|r| {
            matches!(
                r.outcome,
                ExecutionOutcome::Filled { .. }
                    | ExecutionOutcome::Placed { .. }
                    | ExecutionOutcome::DryRun
            )
        });
        if traded {
            Ok(CycleOutcome::Trade)
        } else {
            audit.no_trade_reason = Some("execution_failed".to_string());
            Ok(CycleOutcome::NoTrade)
        }
    }

    // =========================================================================
    // Stage helpers
    // =========================================================================

    fn finish_stage(
        &self,
        audit: &mut CycleAudit,
        stage: &str,
        started: Instant,
        budget_ms: Option<u64>,
    ) {
        let ms = started.elapsed().as_millis() as u64;
        audit.stage_latency_ms.insert(stage.to_string(), ms);
        self.metrics
            .stage_duration_seconds
            .with_label_values(&[stage])
            .observe(ms as f64 / 1000.0);

        if let Some(budget) = budget_ms {
            if ms > budget {
                warn!(stage, ms, budget, "stage exceeded latency budget");
                self.alerts.notify(
                    AlertSeverity::Warning,
                    "latency_budget_exceeded",
                    &format!("stage {stage} took {ms}ms (budget {budget}ms)"),
                    serde_json::Value::Null,
                );
            }
        }
    }

    /// Stage 2: read exchange open orders through the ghost filter and close
    /// store entries whose orders reached a terminal state.
    async fn reconcile_open_orders(&self) {
        if self.cfg.app.mode == ExecutionMode::Live {
            match self.exchange.list_open_orders().await {
                Ok(open) => {
                    let visible = self.exec.filter_ghosts(open);
                    tracing::debug!(open = visible.len(), "exchange open orders after ghost filter");
                }
                Err(e) => {
                    self.metrics
                        .api_errors_total
                        .with_label_values(&[e.error_type()])
                        .inc();
                    warn!(error = %e, "open-order reconcile failed");
                }
            }
        }

        // The state store never keeps terminal orders as pending.
        let stale: Vec<(String, crate::orders::OrderStatus)> = self.store.with(|s| {
            s.pending_orders
                .keys()
                .filter_map(|id| {
                    self.osm
                        .get(id)
                        .filter(|o| o.status.is_terminal())
                        .map(|o| (id.clone(), o.status))
                })
                .collect()
        });
        for (id, status) in stale {
            self.store.close_order(&id, status);
        }
    }

    async fn detect_regime(
        &self,
        snapshot: &UniverseSnapshot,
        portfolio: &PortfolioState,
    ) -> Regime {
        // Core symbols: tier 1 plus anything force-eligible.
        let mut symbols: Vec<String> = self.cfg.universe.tier1.clone();
        for s in &self.cfg.universe.force_eligible_symbols {
            if !symbols.contains(s) {
                symbols.push(s.clone());
            }
        }
        if symbols.is_empty() {
            symbols = snapshot.eligible_symbols();
        }

        let candle_map = self
            .fetch_candles(&symbols, REGIME_GRANULARITY_SECS, REGIME_BARS)
            .await;

        let inputs: Vec<RegimeInput> = symbols
            .iter()
            .filter_map(|symbol| {
                let candles = candle_map.get(symbol)?.clone();
                // NAV weight when held, volume share otherwise.
                let weight = portfolio
                    .positions
                    .get(symbol)
                    .map(|p| p.usd_value)
                    .filter(|v| *v > 0.0)
                    .unwrap_or_else(|| {
                        snapshot
                            .assets
                            .get(symbol)
                            .map(|a| a.volume_24h_usd.max(1.0).ln().max(1.0))
                            .unwrap_or(1.0)
                    });
                Some(RegimeInput {
                    symbol: symbol.clone(),
                    candles,
                    weight,
                })
            })
            .collect();

        let (reading, changed) = self.regime_detector.update(&inputs);
        if changed {
            // Regime-aware thresholds shift: force a fresh universe build.
            self.universe_mgr.invalidate();
        }
        reading.regime
    }

    async fn raise_risk_alerts(&self, result: &RiskResult) {
        for check in &result.violated_checks {
            match check.as_str() {
                risk::checks::KILL_SWITCH => {
                    self.alerts.notify(
                        AlertSeverity::Critical,
                        "kill_switch_activated",
                        "kill switch detected: trading halted, canceling open orders",
                        serde_json::Value::Null,
                    );
                    // Cancel within the kill-switch budget, then persist.
                    if let Err(e) = self.exec.cancel_all_active().await {
                        error!(error = %e, "kill-switch cancel-all failed");
                    }
                    if let Err(e) = self.store.flush() {
                        error!(error = %e, "kill-switch state flush failed");
                    }
                }
                risk::checks::DAILY_STOP_LOSS => {
                    self.alerts.notify(
                        AlertSeverity::Critical,
                        "daily_stop_loss_hit",
                        "daily stop-loss breached: trading halted for the day",
                        serde_json::Value::Null,
                    );
                }
                risk::checks::WEEKLY_STOP_LOSS => {
                    self.alerts.notify(
                        AlertSeverity::Critical,
                        "weekly_stop_loss_hit",
                        "weekly stop-loss breached: trading halted for the week",
                        serde_json::Value::Null,
                    );
                }
                risk::checks::MAX_DRAWDOWN => {
                    self.alerts.notify(
                        AlertSeverity::Critical,
                        "max_drawdown_breached",
                        "drawdown from high-water mark exceeds the limit",
                        serde_json::Value::Null,
                    );
                }
                risk::checks::CONNECTIVITY => {
                    self.metrics
                        .circuit_breaker_state
                        .with_label_values(&["connectivity"])
                        .inc();
                    self.alerts.notify(
                        AlertSeverity::Warning,
                        "api_error_burst",
                        "consecutive exchange API errors tripped the connectivity breaker",
                        serde_json::Value::Null,
                    );
                }
                _ => {}
            }
        }
    }

    // =========================================================================
    // Market-data fetch helpers (bounded parallelism)
    // =========================================================================

    async fn fetch_products(&self) -> Result<HashMap<String, Product>> {
        let products = self
            .exchange
            .list_products()
            .await
            .map_err(|e| anyhow::anyhow!("list_products failed: {e}"))?;
        Ok(products
            .into_iter()
            .map(|p| (p.product_id.clone(), p))
            .collect())
    }

    async fn fetch_quotes(&self, symbols: &[String]) -> HashMap<String, QuoteTick> {
        let unique: HashSet<&String> = symbols.iter().collect();
        stream::iter(unique.into_iter().map(|symbol| async move {
            match self.exchange.get_quote(symbol).await {
                Ok(q) => Some((symbol.clone(), q)),
                Err(e) => {
                    self.metrics
                        .api_errors_total
                        .with_label_values(&[e.error_type()])
                        .inc();
                    None
                }
            }
        }))
        .buffer_unordered(CANDLE_FETCH_WORKERS)
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .flatten()
        .collect()
    }

    async fn fetch_candles(
        &self,
        symbols: &[String],
        granularity: u32,
        bars: u32,
    ) -> HashMap<String, Vec<Candle>> {
        stream::iter(symbols.iter().map(|symbol| async move {
            match self.exchange.get_ohlcv(symbol, granularity, bars).await {
                Ok(candles) => Some((symbol.clone(), candles)),
                Err(e) => {
                    self.metrics
                        .api_errors_total
                        .with_label_values(&[e.error_type()])
                        .inc();
                    None
                }
            }
        }))
        .buffer_unordered(CANDLE_FETCH_WORKERS)
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .flatten()
        .collect()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::coinbase::{OrderBook, ProductStatus};
    use crate::config::AlertConfig;
    use crate::execution::ExecutionEngine;
    use crate::mock_exchange::MockExchange;
    use crate::strategies::{build_strategies, default_entries};
    use crate::types::Side;
    use uuid::Uuid;

    fn spike_15m_candles() -> Vec<Candle> {
        let mut candles: Vec<Candle> = (0..120)
            .map(|i| Candle {
                start: i * 900,
                open: 100.0,
                high: 100.1,
                low: 99.9,
                close: 100.0,
                volume: 1000.0,
            })
            .collect();
        // A 4% final bar on 2.6x volume clears the bull thresholds the flat
        // history plus this spike put the regime detector into.
        let last = candles.last_mut().unwrap();
        last.close = 104.0;
        last.volume = 2600.0;
        candles
    }

    fn mock_with_market(symbols: &[&str]) -> MockExchange {
        let mut mock = MockExchange::new();
        for s in symbols {
            mock.products.push(Product {
                product_id: s.to_string(),
                status: ProductStatus::Online,
                lot_size: 0.001,
                tick_size: 0.01,
                min_notional_usd: 1.0,
                volume_24h_usd: 50_000_000.0,
                price: 100.0,
            });
            mock.quotes.insert(
                s.to_string(),
                QuoteTick { bid: 99.97, ask: 100.03, ts: Utc::now() },
            );
            mock.books.insert(
                s.to_string(),
                OrderBook {
                    bids: vec![(99.97, 5_000.0); 5],
                    asks: vec![(100.03, 5_000.0); 5],
                },
            );
            mock.candles.insert(s.to_string(), spike_15m_candles());
        }
        mock
    }

    struct Harness {
        orchestrator: Orchestrator,
        store: Arc<StateStore>,
        alerts: Arc<AlertPipeline>,
        data_dir: PathBuf,
    }

    fn harness(mock: MockExchange, tweak: impl FnOnce(&mut Config)) -> Harness {
        let tag = Uuid::new_v4();
        let data_dir = std::env::temp_dir().join(format!("meridian-orch-{tag}"));
        std::fs::create_dir_all(&data_dir).unwrap();

        let mut cfg = Config::default();
        cfg.app.mode = ExecutionMode::Paper;
        cfg.app.data_dir = data_dir.to_string_lossy().to_string();
        cfg.universe.tier1 = vec!["SOL-USD".into()];
        cfg.universe.min_eligible_assets = 1;
        cfg.universe.eligible_grace_cycles = 1;
        cfg.strategies.strategies = default_entries();
        tweak(&mut cfg);

        let exchange: Arc<MockExchange> = Arc::new(mock);
        let store = Arc::new(
            StateStore::load(data_dir.join("state.json")).unwrap(),
        );
        let alerts = Arc::new(AlertPipeline::new(AlertConfig::default()));
        let osm = Arc::new(OrderStateMachine::new(Duration::from_secs(60)));
        let exec = Arc::new(ExecutionEngine::new(
            exchange.clone(),
            osm.clone(),
            store.clone(),
            alerts.clone(),
            cfg.policy.execution.clone(),
            cfg.policy.purge_execution.clone(),
            cfg.policy.risk.clone(),
            cfg.app.mode,
        ));
        let strategies = build_strategies(&cfg.strategies);
        let metrics = Metrics::new().unwrap();
        let stop = Arc::new(AtomicBool::new(false));

        let orchestrator = Orchestrator::new(
            cfg,
            exchange,
            store.clone(),
            alerts.clone(),
            osm,
            exec,
            strategies,
            Vec::new(),
            metrics,
            stop,
        );
        Harness { orchestrator, store, alerts, data_dir }
    }

    #[tokio::test]
    async fn paper_cycle_trades_on_a_trigger() {
        let mock = mock_with_market(&["SOL-USD"]);
        let mut h = harness(mock, |_| {});

        let outcome = h.orchestrator.run_cycle().await;
        assert_eq!(outcome, CycleOutcome::Trade);

        h.store.with(|s| {
            let pos = s.positions.get("SOL-USD").expect("position opened");
            assert!(pos.quantity_base > 0.0);
            assert!(s.last_trade_ts.is_some());
            assert_eq!(s.cycle_count, 1);
        });
        std::fs::remove_dir_all(&h.data_dir).ok();
    }

    #[tokio::test]
    async fn empty_universe_is_no_trade_with_reason() {
        // No products and failing quotes: nothing can be eligible.
        let mut mock = MockExchange::new();
        mock.candles.insert("SOL-USD".into(), spike_15m_candles());
        let mut h = harness(mock, |cfg| {
            cfg.universe.min_eligible_assets = 3;
        });

        let outcome = h.orchestrator.run_cycle().await;
        assert_eq!(outcome, CycleOutcome::NoTrade);

        // The empty-universe CRITICAL alert fired.
        let sent = h.alerts.outbound_history();
        assert!(sent.iter().any(|a| a.title == "empty_universe"));
        std::fs::remove_dir_all(&h.data_dir).ok();
    }

    #[tokio::test]
    async fn kill_switch_file_blocks_trading_and_cancels_orders() {
        let mock = mock_with_market(&["SOL-USD"]);
        let mut h = harness(mock, |_| {});

        // A resting order from a previous cycle.
        let client_id = h.orchestrator.osm.create(
            "SOL-USD",
            Side::Buy,
            "post_only_limit",
            99.0,
            0.1,
            9.9,
            "trigger_follow",
        );
        h.orchestrator.osm.acknowledge(&client_id, "X-REST");

        // Operator touches the kill switch.
        std::fs::write(sentinel::kill_switch_path(&h.data_dir), "").unwrap();

        let outcome = h.orchestrator.run_cycle().await;
        assert_eq!(outcome, CycleOutcome::NoTrade);

        let sent = h.alerts.outbound_history();
        assert!(sent.iter().any(|a| a.title == "kill_switch_activated"));
        assert_eq!(
            h.orchestrator.osm.get(&client_id).unwrap().status,
            crate::orders::OrderStatus::Canceled
        );
        h.store.with(|s| assert!(s.positions.is_empty()));
        std::fs::remove_dir_all(&h.data_dir).ok();
    }

    #[tokio::test]
    async fn flat_market_is_no_trade_no_triggers() {
        let mut mock = mock_with_market(&["SOL-USD"]);
        // Flat candles: no trigger fires.
        mock.candles.insert(
            "SOL-USD".into(),
            (0..120)
                .map(|i| Candle {
                    start: i * 900,
                    open: 100.0,
                    high: 100.0,
                    low: 100.0,
                    close: 100.0,
                    volume: 1000.0,
                })
                .collect(),
        );
        let mut h = harness(mock, |_| {});

        let outcome = h.orchestrator.run_cycle().await;
        assert_eq!(outcome, CycleOutcome::NoTrade);
        assert_eq!(h.store.with(|s| s.zero_trigger_cycles), 1);
        std::fs::remove_dir_all(&h.data_dir).ok();
    }

    #[tokio::test]
    async fn audit_record_is_written_each_cycle() {
        let mock = mock_with_market(&["SOL-USD"]);
        let mut h = harness(mock, |_| {});
        h.orchestrator.run_cycle().await;

        let audit_dir = h.data_dir.join("audit");
        let entries: Vec<_> = std::fs::read_dir(&audit_dir).unwrap().collect();
        assert_eq!(entries.len(), 1);
        let content =
            std::fs::read_to_string(entries[0].as_ref().unwrap().path()).unwrap();
        let parsed: serde_json::Value =
            serde_json::from_str(content.lines().next().unwrap()).unwrap();
        assert!(parsed["config_hash"].is_string());
        assert!(parsed["stage_latency_ms"]["risk_check"].is_number());
        std::fs::remove_dir_all(&h.data_dir).ok();
    }

    #[tokio::test]
    async fn second_buy_same_symbol_is_blocked_by_pyramiding() {
        let mock = mock_with_market(&["SOL-USD"]);
        let mut h = harness(mock, |cfg| {
            // Disable pacing so only pyramiding binds on the second cycle.
            cfg.policy.risk.min_seconds_between_trades = 0;
            cfg.policy.risk.min_seconds_between_trades_same_symbol = 0;
            // Keep the exit strategy from selling the fresh position.
            cfg.strategies.strategies.retain(|s| s.kind != "position_exit");
        });

        assert_eq!(h.orchestrator.run_cycle().await, CycleOutcome::Trade);
        let qty_after_first = h
            .store
            .with(|s| s.positions.get("SOL-USD").map(|p| p.quantity_base).unwrap());

        let outcome = h.orchestrator.run_cycle().await;
        assert_eq!(outcome, CycleOutcome::NoTrade);
        let qty_after_second = h
            .store
            .with(|s| s.positions.get("SOL-USD").map(|p| p.quantity_base).unwrap());
        assert_eq!(qty_after_first, qty_after_second);
        std::fs::remove_dir_all(&h.data_dir).ok();
    }
}
