// =============================================================================
// Execution Engine — maker-first placement, fill reconciliation, auto-trim,
// and purge-with-backoff
// =============================================================================
//
// Order lifecycle: size the proposal, rest a post-only limit at the top of
// book for ~25 s, then cancel and fall back to an IOC taker within the
// slippage cap. Every placement is recorded in both the order state machine
// and the state store under one stable client_order_id.
//
// Fill parsing honours the size_in_quote flag BEFORE assigning meaning to
// the size field, and a fill-notional mismatch is fatal for that order: the
// fill is discarded and no state update occurs.
// =============================================================================

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{bail, Result};
use chrono::Utc;
use serde::Serialize;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::alerts::{AlertPipeline, AlertSeverity};
use crate::coinbase::{
    ExchangeApi, Fill, Liquidity, OpenOrder, OrderKind, OrderRequest, Product, QuoteTick,
};
use crate::config::{ExecutionConfig, PurgeConfig, RiskConfig};
use crate::orders::{Order, OrderFill, OrderStateMachine, OrderStatus};
use crate::portfolio::PortfolioState;
use crate::sim::PaperFillModel;
use crate::store::{StateStore, StoredOrder, StoredPosition};
use crate::strategies::TradeProposal;
use crate::types::{ExecutionMode, Side, Tier};
use crate::universe::UniverseSnapshot;

/// How often the maker-TTL wait polls for fills.
const MAKER_POLL_INTERVAL: Duration = Duration::from_secs(3);

// ---------------------------------------------------------------------------
// Reports
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "snake_case", tag = "outcome")]
pub enum ExecutionOutcome {
    /// Dry-run: the order never left the process.
    DryRun,
    /// Resting on the exchange, not yet filled.
    Placed { client_order_id: String },
    Filled {
        client_order_id: String,
        fill_price: f64,
        base: f64,
        quote: f64,
        fee: f64,
    },
    Failed { reason: String },
}

#[derive(Debug, Clone, Serialize)]
pub struct ExecutionReport {
    pub symbol: String,
    pub side: Side,
    pub strategy: String,
    #[serde(flatten)]
    pub outcome: ExecutionOutcome,
}

/// requested-vs-computed notional sanity gate (see accounting violations).
pub fn fill_notional_mismatch(requested: f64, computed: f64) -> bool {
    (requested - computed).abs() > 0.20_f64.max(0.02 * requested)
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct ExecutionEngine {
    exchange: Arc<dyn ExchangeApi>,
    osm: Arc<OrderStateMachine>,
    store: Arc<StateStore>,
    alerts: Arc<AlertPipeline>,
    cfg: ExecutionConfig,
    purge_cfg: PurgeConfig,
    risk_cfg: RiskConfig,
    mode: ExecutionMode,
    paper: PaperFillModel,
}

impl ExecutionEngine {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        exchange: Arc<dyn ExchangeApi>,
        osm: Arc<OrderStateMachine>,
        store: Arc<StateStore>,
        alerts: Arc<AlertPipeline>,
        cfg: ExecutionConfig,
        purge_cfg: PurgeConfig,
        risk_cfg: RiskConfig,
        mode: ExecutionMode,
    ) -> Self {
        Self {
            exchange,
            osm,
            store,
            alerts,
            cfg,
            purge_cfg,
            risk_cfg,
            mode,
            paper: PaperFillModel,
        }
    }

    // =========================================================================
    // Proposal execution
    // =========================================================================

    pub async fn execute(
        &self,
        proposals: &[TradeProposal],
        portfolio: &PortfolioState,
        products: &HashMap<String, Product>,
        quotes: &HashMap<String, QuoteTick>,
        universe: &UniverseSnapshot,
    ) -> Result<Vec<ExecutionReport>> {
        // Mode/adapter mismatch is refused before ANY processing.
        if self.mode == ExecutionMode::Live && self.exchange.read_only() {
            bail!("live execution requested but the exchange adapter is read-only");
        }

        let mut reports = Vec::with_capacity(proposals.len());
        for proposal in proposals {
            let report = self
                .execute_one(proposal, portfolio, products, quotes, universe)
                .await;
            info!(
                symbol = %proposal.symbol,
                side = %proposal.side,
                strategy = %proposal.strategy,
                outcome = ?report.outcome,
                "execution result"
            );
            reports.push(report);
        }
        Ok(reports)
    }

    async fn execute_one(
        &self,
        proposal: &TradeProposal,
        portfolio: &PortfolioState,
        products: &HashMap<String, Product>,
        quotes: &HashMap<String, QuoteTick>,
        universe: &UniverseSnapshot,
    ) -> ExecutionReport {
        let symbol = &proposal.symbol;
        let report = |outcome: ExecutionOutcome| ExecutionReport {
            symbol: symbol.clone(),
            side: proposal.side,
            strategy: proposal.strategy.clone(),
            outcome,
        };

        let Some(quote) = quotes.get(symbol) else {
            return report(ExecutionOutcome::Failed { reason: "no_quote".into() });
        };
        let Some(product) = products.get(symbol) else {
            return report(ExecutionOutcome::Failed { reason: "no_product".into() });
        };

        // Sizing: % of NAV -> fee-adjusted base units floored to lot size.
        let notional = proposal.size_pct / 100.0 * portfolio.nav_usd;
        let fee_frac = self.cfg.taker_fee_bps / 10_000.0;
        let limit_price = self.maker_price(quote, product, proposal.side);
        let base = match proposal.side {
            Side::Buy => floor_to_lot(notional * (1.0 - fee_frac) / limit_price, product.lot_size),
            Side::Sell => {
                // Sells are sized from the held quantity, never above it.
                let held = portfolio
                    .positions
                    .get(symbol)
                    .map(|p| p.quantity_base)
                    .unwrap_or(0.0);
                floor_to_lot((notional / limit_price).min(held), product.lot_size)
            }
        };
        if base <= 0.0 {
            return report(ExecutionOutcome::Failed { reason: "zero_base_size".into() });
        }
        let size_quote = base * limit_price;

        match self.mode {
            ExecutionMode::DryRun => {
                info!(
                    symbol = %symbol,
                    side = %proposal.side,
                    base,
                    notional = size_quote,
                    "DRY RUN: order not sent"
                );
                report(ExecutionOutcome::DryRun)
            }
            ExecutionMode::Paper => {
                let tier = universe.tier_of(symbol).unwrap_or(Tier::Three);
                self.execute_paper(proposal, quote, base, size_quote, limit_price, tier, report)
            }
            ExecutionMode::Live => {
                self.execute_live(proposal, product, quote, base, size_quote, limit_price, report)
                    .await
            }
        }
    }

    /// Paper: maker attempt resolved by the fill model, taker fallback at the
    /// modeled slippage price. Positions update through the same path as
    /// live reconciliation.
    #[allow(clippy::too_many_arguments)]
    fn execute_paper(
        &self,
        proposal: &TradeProposal,
        quote: &QuoteTick,
        base: f64,
        size_quote: f64,
        limit_price: f64,
        tier: Tier,
        report: impl Fn(ExecutionOutcome) -> ExecutionReport,
    ) -> ExecutionReport {
        let volatility = proposal
            .metadata
            .get("volatility")
            .and_then(|v| v.as_f64())
            .unwrap_or(1.0);

        let maker_fraction = if self.cfg.maker_first {
            self.paper.maker_fill(tier)
        } else {
            None
        };

        let (fill_price, fee_bps, fraction, liquidity) = match maker_fraction {
            Some(fraction) => (limit_price, self.cfg.maker_fee_bps, fraction, Liquidity::Maker),
            None if self.cfg.taker_fallback => {
                let price = self.paper.taker_fill_price(
                    quote.mid(),
                    proposal.side,
                    size_quote,
                    volatility,
                    tier,
                );
                (price, self.cfg.taker_fee_bps, 1.0, Liquidity::Taker)
            }
            None => {
                return report(ExecutionOutcome::Failed {
                    reason: "maker_unfilled_no_fallback".into(),
                })
            }
        };

        let fill_base = floor_to_lot(base * fraction, 0.0);
        let fill_quote = fill_base * fill_price;
        let fee = fill_quote * fee_bps / 10_000.0;

        let client_order_id = self.create_tracked_order(
            proposal,
            match liquidity {
                Liquidity::Maker => "post_only_limit",
                Liquidity::Taker => "ioc_limit",
            },
            fill_price,
            base,
            size_quote,
        );
        self.osm
            .acknowledge(&client_order_id, &format!("PAPER-{}", Uuid::new_v4()));
        self.osm.record_fill(
            &client_order_id,
            OrderFill {
                trade_id: format!("paper-{}", Uuid::new_v4()),
                price: fill_price,
                size_base: fill_base,
                value_quote: fill_quote,
                fee,
                liquidity,
                time: Utc::now(),
            },
            self.cfg.partial_fill_tolerance,
        );

        // Pacing markers record against the pre-fill position state.
        self.record_trade_markers(proposal);
        self.apply_fill_to_state(
            &proposal.symbol,
            proposal.side,
            fill_base,
            fill_quote,
            fee,
            fill_price,
            &proposal.strategy,
        );
        let status = self
            .osm
            .get(&client_order_id)
            .map(|o| o.status)
            .unwrap_or(OrderStatus::Filled);
        self.store.close_order(&client_order_id, status);

        report(ExecutionOutcome::Filled {
            client_order_id,
            fill_price,
            base: fill_base,
            quote: fill_quote,
            fee,
        })
    }

    /// Live: post-only at top of book, poll for fills until the TTL, then
    /// cancel and fall back to an IOC within the slippage cap.
    #[allow(clippy::too_many_arguments)]
    async fn execute_live(
        &self,
        proposal: &TradeProposal,
        product: &Product,
        quote: &QuoteTick,
        base: f64,
        size_quote: f64,
        limit_price: f64,
        report: impl Fn(ExecutionOutcome) -> ExecutionReport,
    ) -> ExecutionReport {
        let symbol = &proposal.symbol;

        if self.cfg.maker_first {
            let client_order_id =
                self.create_tracked_order(proposal, "post_only_limit", limit_price, base, size_quote);

            match self
                .place(&client_order_id, symbol, proposal.side, OrderKind::PostOnlyLimit {
                    price: limit_price,
                    size_base: base,
                })
                .await
            {
                PlacementResult::Accepted => {
                    self.record_trade_markers(proposal);
                    if self.wait_for_maker_fill(&client_order_id, symbol).await {
                        let order = self.osm.get(&client_order_id);
                        return match order {
                            Some(o) => report(ExecutionOutcome::Filled {
                                client_order_id,
                                fill_price: avg_fill_price(&o),
                                base: o.filled_size,
                                quote: o.filled_value,
                                fee: o.fees,
                            }),
                            None => report(ExecutionOutcome::Failed {
                                reason: "order_vanished".into(),
                            }),
                        };
                    }

                    // TTL expired unfilled (or partially filled): cancel.
                    self.cancel_tracked(&client_order_id).await;
                    if !self.cfg.taker_fallback {
                        return report(ExecutionOutcome::Failed {
                            reason: "maker_ttl_expired".into(),
                        });
                    }
                }
                PlacementResult::Rejected(reason) => {
                    // A post-only reject (would cross) is expected; anything
                    // else ends the attempt here unless fallback is on.
                    if !self.cfg.taker_fallback {
                        return report(ExecutionOutcome::Failed { reason });
                    }
                }
                PlacementResult::Error(reason) => {
                    return report(ExecutionOutcome::Failed { reason });
                }
            }
        }

        if !self.cfg.taker_fallback && self.cfg.maker_first {
            return report(ExecutionOutcome::Failed { reason: "maker_path_exhausted".into() });
        }

        // Taker IOC within the slippage cap.
        let slip = self.cfg.max_slippage_bps / 10_000.0;
        let ioc_price = match proposal.side {
            Side::Buy => quote.mid() * (1.0 + slip),
            Side::Sell => quote.mid() * (1.0 - slip),
        };
        let ioc_price = round_to_tick(ioc_price, product.tick_size);

        let client_order_id =
            self.create_tracked_order(proposal, "ioc_limit", ioc_price, base, size_quote);
        match self
            .place(&client_order_id, symbol, proposal.side, OrderKind::IocLimit {
                price: ioc_price,
                size_base: base,
            })
            .await
        {
            PlacementResult::Accepted => {
                self.record_trade_markers(proposal);
                report(ExecutionOutcome::Placed { client_order_id })
            }
            PlacementResult::Rejected(reason) | PlacementResult::Error(reason) => {
                report(ExecutionOutcome::Failed { reason })
            }
        }
    }

    /// Best maker price: one tick inside the book when the spread allows.
    fn maker_price(&self, quote: &QuoteTick, product: &Product, side: Side) -> f64 {
        let tick = product.tick_size.max(0.0);
        let improvable = quote.ask - quote.bid > 2.0 * tick;
        match side {
            Side::Buy => {
                if improvable {
                    quote.bid + tick
                } else {
                    quote.bid
                }
            }
            Side::Sell => {
                if improvable {
                    quote.ask - tick
                } else {
                    quote.ask
                }
            }
        }
    }

    fn create_tracked_order(
        &self,
        proposal: &TradeProposal,
        kind_label: &str,
        price: f64,
        base: f64,
        size_quote: f64,
    ) -> String {
        let client_order_id = self.osm.create(
            &proposal.symbol,
            proposal.side,
            kind_label,
            price,
            base,
            size_quote,
            &proposal.strategy,
        );
        self.store.update(|s| {
            s.pending_orders.insert(
                client_order_id.clone(),
                StoredOrder {
                    client_order_id: client_order_id.clone(),
                    exchange_order_id: None,
                    symbol: proposal.symbol.clone(),
                    side: proposal.side,
                    order_type: kind_label.to_string(),
                    price,
                    size_base: base,
                    size_quote,
                    status: OrderStatus::New,
                    created_at: Utc::now(),
                    strategy: proposal.strategy.clone(),
                },
            );
        });
        client_order_id
    }

    async fn place(
        &self,
        client_order_id: &str,
        symbol: &str,
        side: Side,
        kind: OrderKind,
    ) -> PlacementResult {
        let request = OrderRequest {
            client_order_id: client_order_id.to_string(),
            product_id: symbol.to_string(),
            side,
            kind,
        };

        match self.exchange.place_order(&request).await {
            Ok(resp) if resp.accepted() => {
                let exchange_order_id = resp.order_id.expect("accepted implies id");
                self.osm.acknowledge(client_order_id, &exchange_order_id);
                self.store.update(|s| {
                    if let Some(o) = s.pending_orders.get_mut(client_order_id) {
                        o.exchange_order_id = Some(exchange_order_id.clone());
                        o.status = OrderStatus::Open;
                    }
                });
                PlacementResult::Accepted
            }
            Ok(resp) => {
                let reason = resp.error.unwrap_or_else(|| "unknown rejection".into());
                // ORDER_REJECT: the full error response is preserved.
                error!(
                    target: "order_reject",
                    client_order_id,
                    symbol = %symbol,
                    side = %side,
                    reason = %reason,
                    raw = %resp
                        .error_response
                        .as_ref()
                        .map(|v| v.to_string())
                        .unwrap_or_default(),
                    "ORDER_REJECT"
                );
                self.osm.transition(client_order_id, OrderStatus::Rejected);
                self.store.close_order(client_order_id, OrderStatus::Rejected);

                let burst = self
                    .store
                    .update(|s| s.record_rejection(symbol, Utc::now()));
                if burst >= 3 {
                    self.alerts.notify(
                        AlertSeverity::Warning,
                        "order_rejection_burst",
                        &format!("{burst} order rejections for {symbol} within 10 minutes"),
                        serde_json::json!({ "symbol": symbol, "last_reason": reason }),
                    );
                }
                PlacementResult::Rejected(reason)
            }
            Err(e) => {
                warn!(client_order_id, symbol = %symbol, error = %e, "order placement error");
                self.osm.transition(client_order_id, OrderStatus::Rejected);
                self.store.close_order(client_order_id, OrderStatus::Rejected);
                PlacementResult::Error(e.to_string())
            }
        }
    }

    /// Poll list_fills until the maker order fills or its TTL lapses.
    async fn wait_for_maker_fill(&self, client_order_id: &str, symbol: &str) -> bool {
        let deadline = Instant::now() + Duration::from_secs(self.cfg.post_only_ttl_seconds);
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            tokio::time::sleep(remaining.min(MAKER_POLL_INTERVAL)).await;

            let since = Utc::now() - chrono::Duration::minutes(5);
            match self.exchange.list_fills(Some(symbol), Some(since), 50).await {
                Ok(fills) => {
                    for fill in fills {
                        self.ingest_fill(&fill);
                    }
                }
                Err(e) => debug!(symbol = %symbol, error = %e, "fill poll failed"),
            }

            if let Some(order) = self.osm.get(client_order_id) {
                if order.status == OrderStatus::Filled {
                    return true;
                }
            }
        }
    }

    async fn cancel_tracked(&self, client_order_id: &str) {
        let Some(order) = self.osm.get(client_order_id) else {
            return;
        };
        if order.status.is_terminal() {
            // Canceling a CANCELED/FILLED order is a no-op: no exchange call.
            return;
        }
        if let Some(xid) = &order.exchange_order_id {
            if let Err(e) = self.exchange.cancel_order(xid).await {
                // The order may already be gone; CANCELED is applied anyway.
                debug!(client_order_id, error = %e, "cancel API error (treated as canceled)");
            }
        }
        self.osm.mark_canceled(&order);
        self.osm.transition(client_order_id, OrderStatus::Canceled);
        self.store.close_order(client_order_id, OrderStatus::Canceled);
    }

    // =========================================================================
    // Fill reconciliation
    // =========================================================================

    /// Pull recent fills and fold them into orders, positions, and PnL.
    pub async fn reconcile_fills(&self) -> Result<u32> {
        if self.mode != ExecutionMode::Live {
            return Ok(0);
        }
        let since = Utc::now() - chrono::Duration::minutes(self.cfg.fills_lookback_minutes as i64);
        let fills = self
            .exchange
            .list_fills(None, Some(since), 250)
            .await
            .map_err(|e| anyhow::anyhow!("list_fills failed: {e}"))?;

        let mut applied = 0;
        for fill in &fills {
            if self.ingest_fill(fill) {
                applied += 1;
            }
        }
        if applied > 0 {
            info!(applied, "fills reconciled");
        }
        Ok(applied)
    }

    /// Fold one exchange fill into the state machine and (when accepted)
    /// into positions. Returns true when the fill was newly applied.
    fn ingest_fill(&self, fill: &Fill) -> bool {
        let Some(order) = self.osm.by_exchange_id(&fill.order_id) else {
            debug!(order_id = %fill.order_id, "fill for untracked order ignored");
            return false;
        };

        // size_in_quote precedence: resolve BEFORE using the size field.
        let Some((base, quote)) = fill.parsed_quantities() else {
            error!(trade_id = %fill.trade_id, "fill with unusable price discarded");
            return false;
        };

        // Accounting violation gate: a completed order whose notional is far
        // from the request must not touch state.
        let prospective_value = order.filled_value + quote;
        let completes = order.size_base > 0.0
            && order.filled_size + base >= order.size_base * (1.0 - self.cfg.partial_fill_tolerance);
        if completes && fill_notional_mismatch(order.size_quote, prospective_value) {
            error!(
                client_order_id = %order.client_order_id,
                requested = order.size_quote,
                computed = prospective_value,
                "fill notional mismatch: fill discarded, order marked failed"
            );
            self.alerts.notify(
                AlertSeverity::Critical,
                "fill_notional_mismatch",
                &format!(
                    "{}: requested ${:.2} vs computed ${:.2}",
                    order.symbol, order.size_quote, prospective_value
                ),
                serde_json::json!({ "client_order_id": order.client_order_id }),
            );
            self.osm.transition(&order.client_order_id, OrderStatus::Rejected);
            self.store.close_order(&order.client_order_id, OrderStatus::Rejected);
            return false;
        }

        let recorded = self.osm.record_fill(
            &order.client_order_id,
            OrderFill {
                trade_id: fill.trade_id.clone(),
                price: fill.price,
                size_base: base,
                value_quote: quote,
                fee: fill.commission,
                liquidity: fill.liquidity_indicator,
                time: fill.trade_time,
            },
            self.cfg.partial_fill_tolerance,
        );
        if !recorded {
            return false;
        }

        self.apply_fill_to_state(
            &order.symbol,
            order.side,
            base,
            quote,
            fill.commission,
            fill.price,
            &order.strategy,
        );

        if let Some(updated) = self.osm.get(&order.client_order_id) {
            if updated.status.is_terminal() {
                self.store.close_order(&order.client_order_id, updated.status);
            }
        }
        true
    }

    /// Positions, realized PnL, cooldowns, and paper cash.
    #[allow(clippy::too_many_arguments)]
    fn apply_fill_to_state(
        &self,
        symbol: &str,
        side: Side,
        base: f64,
        quote: f64,
        fee: f64,
        price: f64,
        strategy: &str,
    ) {
        let now = Utc::now();
        let paper = self.mode != ExecutionMode::Live;
        let risk = &self.risk_cfg;

        self.store.update(|s| {
            match side {
                Side::Buy => {
                    let pos = s.positions.entry(symbol.to_string()).or_insert(StoredPosition {
                        symbol: symbol.to_string(),
                        quantity_base: 0.0,
                        avg_entry_price: 0.0,
                        entry_time: now,
                        strategy: strategy.to_string(),
                    });
                    let new_qty = pos.quantity_base + base;
                    if new_qty > 0.0 {
                        pos.avg_entry_price =
                            (pos.quantity_base * pos.avg_entry_price + quote) / new_qty;
                    }
                    pos.quantity_base = new_qty;
                    if paper {
                        if let Some(cash) = s.paper_cash_usd.as_mut() {
                            *cash -= quote + fee;
                        }
                    }
                }
                Side::Sell => {
                    let mut remove_symbol = false;
                    let mut realized_info = None;
                    if let Some(pos) = s.positions.get_mut(symbol) {
                        let sold = base.min(pos.quantity_base);
                        let cost = sold * pos.avg_entry_price;
                        let realized = quote - cost - fee;
                        let pnl_pct = if pos.avg_entry_price > 0.0 {
                            (price - pos.avg_entry_price) / pos.avg_entry_price * 100.0
                        } else {
                            0.0
                        };
                        pos.quantity_base -= sold;

                        if pos.quantity_base * price < 1e-9_f64.max(0.000_001 * price) {
                            remove_symbol = true;
                        }
                        realized_info = Some((realized, pnl_pct));
                    }
                    if let Some((realized, pnl_pct)) = realized_info {
                        s.record_realized_pnl(realized, now);

                        // Closed-trade cooldowns: win short, loss medium,
                        // stop-out long.
                        let (minutes, reason) = if pnl_pct <= risk.stop_out_pnl_pct {
                            (risk.cooldown_stop_out_minutes, "stop_out")
                        } else if realized < 0.0 {
                            (risk.cooldown_loss_minutes, "loss")
                        } else {
                            (risk.cooldown_win_minutes, "win")
                        };
                        s.set_cooldown(
                            symbol,
                            now + chrono::Duration::minutes(minutes as i64),
                            reason,
                        );

                        if remove_symbol {
                            s.positions.remove(symbol);
                        }
                        if paper {
                            if let Some(cash) = s.paper_cash_usd.as_mut() {
                                *cash += quote - fee;
                            }
                        }
                        debug!(
                            symbol = %symbol,
                            realized,
                            pnl_pct,
                            cooldown = reason,
                            "position reduced"
                        );
                    }
                }
            }
        });
    }

    fn record_trade_markers(&self, proposal: &TradeProposal) {
        if proposal.side != Side::Buy {
            return;
        }
        let is_add = self
            .store
            .with(|s| s.positions.contains_key(&proposal.symbol));
        self.store.update(|s| {
            s.record_trade(&proposal.symbol, &proposal.strategy, is_add, Utc::now())
        });
    }

    // =========================================================================
    // Open-order management
    // =========================================================================

    /// Open-order reads filtered through the ghost cache.
    pub fn filter_ghosts(&self, orders: Vec<OpenOrder>) -> Vec<OpenOrder> {
        orders
            .into_iter()
            .filter(|o| {
                let ghost =
                    self.osm.is_ghost(&o.order_id) || self.osm.is_ghost(&o.client_order_id);
                if ghost {
                    debug!(order_id = %o.order_id, "ghost order filtered from exchange read");
                }
                !ghost
            })
            .collect()
    }

    /// Cancel non-terminal orders older than cancel_after_seconds, by local
    /// creation time. Orders transition to CANCELED even when the cancel API
    /// errors (the order may already be gone on the exchange).
    pub async fn manage_open_orders(&self) -> Result<u32> {
        let stale = self
            .osm
            .stale_orders(Duration::from_secs(self.cfg.cancel_after_seconds));
        if stale.is_empty() {
            return Ok(0);
        }
        warn!(count = stale.len(), "canceling stale orders");
        self.cancel_orders_batch(&stale).await;
        Ok(stale.len() as u32)
    }

    /// Cancel every active order (kill switch / shutdown path). Batch first,
    /// individual fallback.
    pub async fn cancel_all_active(&self) -> Result<u32> {
        let active = self.osm.active_orders();
        if active.is_empty() {
            return Ok(0);
        }
        info!(count = active.len(), "canceling all active orders");
        self.cancel_orders_batch(&active).await;
        Ok(active.len() as u32)
    }

    async fn cancel_orders_batch(&self, orders: &[Order]) {
        let exchange_ids: Vec<String> = orders
            .iter()
            .filter_map(|o| o.exchange_order_id.clone())
            .collect();

        let mut acked: Vec<String> = Vec::new();
        if !exchange_ids.is_empty() && self.mode == ExecutionMode::Live {
            match self.exchange.cancel_orders(&exchange_ids).await {
                Ok(ids) => acked = ids,
                Err(e) => warn!(error = %e, "batch cancel failed, falling back to individual"),
            }

            for id in &exchange_ids {
                if !acked.contains(id) {
                    if let Err(e) = self.exchange.cancel_order(id).await {
                        debug!(order_id = %id, error = %e, "individual cancel error (treated as canceled)");
                    }
                }
            }
        }

        for order in orders {
            self.osm.mark_canceled(order);
            self.osm.transition(&order.client_order_id, OrderStatus::Canceled);
            self.store.close_order(&order.client_order_id, OrderStatus::Canceled);
        }
    }

    // =========================================================================
    // Auto-trim and purge
    // =========================================================================

    /// Liquidate enough of the worst positions to bring exposure back under
    /// the cap. Greedy: losers first, then oldest.
    pub async fn auto_trim(
        &self,
        portfolio: &PortfolioState,
        cap_pct: f64,
        quotes: &HashMap<String, QuoteTick>,
    ) -> Result<()> {
        let excess_pct = portfolio.total_exposure_pct - cap_pct;
        if excess_pct <= 0.0 {
            return Ok(());
        }
        let mut excess_usd = excess_pct / 100.0 * portfolio.nav_usd;
        warn!(
            exposure_pct = portfolio.total_exposure_pct,
            cap_pct,
            excess_usd,
            "auto-trim: exposure over cap"
        );

        let mut candidates: Vec<_> = portfolio
            .positions
            .values()
            .filter(|p| p.usd_value >= portfolio.min_dust_usd)
            .collect();
        candidates.sort_by(|a, b| {
            a.unrealized_pnl_pct
                .partial_cmp(&b.unrealized_pnl_pct)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| a.entry_time.cmp(&b.entry_time))
        });

        let mut any_failure = false;
        for pos in candidates {
            if excess_usd <= 0.0 {
                break;
            }
            let Some(quote) = quotes.get(&pos.symbol) else {
                continue;
            };
            let target_usd = excess_usd.min(pos.usd_value);
            let qty = target_usd / quote.mid();
            match self.twap_liquidate(&pos.symbol, qty, quote.mid()).await {
                Ok(sold_usd) => excess_usd -= sold_usd,
                Err(e) => {
                    warn!(symbol = %pos.symbol, error = %e, "trim slice failed");
                    any_failure = true;
                }
            }
        }

        if any_failure {
            let failures = self.store.update(|s| {
                s.trim_failures += 1;
                s.trim_failures
            });
            if failures >= self.purge_cfg.max_trim_failures_before_alert {
                self.alerts.notify(
                    AlertSeverity::Critical,
                    "auto_trim_failing",
                    &format!("{failures} consecutive auto-trim failures"),
                    serde_json::Value::Null,
                );
            }
        } else {
            self.store.update(|s| s.trim_failures = 0);
        }
        Ok(())
    }

    /// Liquidate holdings of ineligible or banned assets, honouring the
    /// per-symbol failure backoff.
    pub async fn purge_ineligible(
        &self,
        portfolio: &PortfolioState,
        universe: &UniverseSnapshot,
        quotes: &HashMap<String, QuoteTick>,
    ) -> Result<()> {
        let now = Utc::now();
        let banned = self.store.update(|s| s.active_bans(now));

        for pos in portfolio.positions.values() {
            let ineligible = !universe.is_eligible(&pos.symbol) || banned.contains_key(&pos.symbol);
            if !ineligible || pos.usd_value < self.purge_cfg.min_liquidation_value_usd {
                continue;
            }

            if let Some(until) = self.store.with(|s| s.purge_backoff_until(&pos.symbol)) {
                if until > now {
                    let count = self
                        .store
                        .with(|s| s.purge_failures.get(&pos.symbol).map(|f| f.count).unwrap_or(0));
                    let backoff_h = ((until - now).num_minutes() as f64 / 60.0).ceil() as i64;
                    info!(
                        symbol = %pos.symbol,
                        failures = count,
                        "Skipping purge for {}: {} recent failures, backoff {}h",
                        pos.symbol,
                        count,
                        backoff_h
                    );
                    continue;
                }
            }

            let Some(quote) = quotes.get(&pos.symbol) else {
                continue;
            };
            match self.twap_liquidate(&pos.symbol, pos.quantity_base, quote.mid()).await {
                Ok(sold) => {
                    info!(symbol = %pos.symbol, sold_usd = sold, "purge complete");
                    self.store.update(|s| s.clear_purge_failures(&pos.symbol));
                }
                Err(e) => {
                    let count = self
                        .store
                        .update(|s| s.record_purge_failure(&pos.symbol, &e, now));
                    warn!(symbol = %pos.symbol, failures = count, error = %e, "purge failed");
                }
            }
        }
        Ok(())
    }

    /// Sell `qty` in time-spaced slices. Returns the USD value sold, or the
    /// first slice error.
    async fn twap_liquidate(&self, symbol: &str, qty: f64, price: f64) -> Result<f64, String> {
        if self.mode == ExecutionMode::DryRun {
            info!(symbol = %symbol, qty, "DRY RUN: TWAP liquidation not sent");
            return Ok(qty * price);
        }

        let slice_qty = (self.purge_cfg.twap_slice_notional_usd / price).max(1e-9);
        let mut remaining = qty;
        let mut sold_usd = 0.0;

        while remaining * price > self.purge_cfg.residual_value_threshold_usd {
            let this_qty = remaining.min(slice_qty);

            if self.mode == ExecutionMode::Live {
                let client_order_id = Uuid::new_v4().to_string();
                let request = OrderRequest {
                    client_order_id: client_order_id.clone(),
                    product_id: symbol.to_string(),
                    side: Side::Sell,
                    kind: OrderKind::IocLimit {
                        price: price * (1.0 - self.cfg.max_slippage_bps / 10_000.0),
                        size_base: this_qty,
                    },
                };
                match self.exchange.place_order(&request).await {
                    Ok(resp) if resp.accepted() => {}
                    Ok(resp) => {
                        return Err(resp.error.unwrap_or_else(|| "slice rejected".into()));
                    }
                    Err(e) => return Err(e.to_string()),
                }
            } else {
                // Paper: apply the sale directly.
                let fee = this_qty * price * self.cfg.taker_fee_bps / 10_000.0;
                self.apply_fill_to_state(
                    symbol,
                    Side::Sell,
                    this_qty,
                    this_qty * price,
                    fee,
                    price,
                    "liquidation",
                );
            }

            remaining -= this_qty;
            sold_usd += this_qty * price;
            if remaining * price > self.purge_cfg.residual_value_threshold_usd {
                tokio::time::sleep(Duration::from_millis(self.purge_cfg.twap_slice_interval_ms))
                    .await;
            }
        }

        Ok(sold_usd)
    }
}

enum PlacementResult {
    Accepted,
    Rejected(String),
    Error(String),
}

fn floor_to_lot(base: f64, lot: f64) -> f64 {
    if lot > 0.0 {
        (base / lot).floor() * lot
    } else {
        base
    }
}

fn round_to_tick(price: f64, tick: f64) -> f64 {
    if tick > 0.0 {
        (price / tick).round() * tick
    } else {
        price
    }
}

fn avg_fill_price(order: &Order) -> f64 {
    if order.filled_size > 0.0 {
        order.filled_value / order.filled_size
    } else {
        order.price
    }
}

impl std::fmt::Debug for ExecutionEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionEngine")
            .field("mode", &self.mode)
            .field("maker_first", &self.cfg.maker_first)
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::coinbase::ProductStatus;
    use crate::config::AlertConfig;
    use crate::mock_exchange::MockExchange;
    use crate::types::Regime;
    use std::sync::atomic::Ordering;

    fn store() -> Arc<StateStore> {
        let path = std::env::temp_dir().join(format!("meridian-exec-{}.json", Uuid::new_v4()));
        Arc::new(StateStore::load(path).unwrap())
    }

    fn engine_with(mode: ExecutionMode, exchange: Arc<MockExchange>) -> (ExecutionEngine, Arc<StateStore>, Arc<OrderStateMachine>) {
        let store = store();
        let osm = Arc::new(OrderStateMachine::new(Duration::from_secs(60)));
        let engine = ExecutionEngine::new(
            exchange,
            osm.clone(),
            store.clone(),
            Arc::new(AlertPipeline::new(AlertConfig::default())),
            ExecutionConfig::default(),
            PurgeConfig::default(),
            RiskConfig::default(),
            mode,
        );
        (engine, store, osm)
    }

    fn product(symbol: &str) -> Product {
        Product {
            product_id: symbol.to_string(),
            status: ProductStatus::Online,
            lot_size: 0.001,
            tick_size: 0.01,
            min_notional_usd: 1.0,
            volume_24h_usd: 10_000_000.0,
            price: 100.0,
        }
    }

    fn portfolio(nav: f64) -> PortfolioState {
        PortfolioState {
            nav_usd: nav,
            cash_usd: nav,
            positions: HashMap::new(),
            pending_orders: HashMap::new(),
            total_exposure_pct: 0.0,
            daily_pnl_pct: 0.0,
            weekly_pnl_pct: 0.0,
            high_water_mark: nav,
            drawdown_pct: 0.0,
            cycle_count: 1,
            last_trade_ts: None,
            per_symbol_last_trade: HashMap::new(),
            min_dust_usd: 1.0,
        }
    }

    fn proposal(symbol: &str, side: Side, size_pct: f64) -> TradeProposal {
        TradeProposal {
            symbol: symbol.to_string(),
            side,
            size_pct,
            reason: "test".into(),
            confidence: 0.7,
            stop_loss_pct: Some(5.0),
            take_profit_pct: Some(9.0),
            strategy: "trigger_follow".into(),
            metadata: serde_json::json!({ "volatility": 1.0 }),
        }
    }

    fn universe(symbols: &[&str]) -> UniverseSnapshot {
        let mut snap = UniverseSnapshot::empty(Regime::Chop);
        for s in symbols {
            snap.tiers[0].push(s.to_string());
        }
        snap
    }

    fn fill(order_id: &str, trade_id: &str, price: f64, size: f64, size_in_quote: bool) -> Fill {
        Fill {
            entry_id: format!("e-{trade_id}"),
            trade_id: trade_id.to_string(),
            order_id: order_id.to_string(),
            product_id: "SOL-USD".into(),
            trade_time: Utc::now(),
            price,
            size,
            size_in_quote,
            commission: 0.12,
            liquidity_indicator: Liquidity::Taker,
            side: Side::Buy,
        }
    }

    #[tokio::test]
    async fn dry_run_never_touches_the_exchange() {
        let exchange = Arc::new(MockExchange::new().with_quote("SOL-USD", 99.95, 100.05));
        let (engine, store, _) = engine_with(ExecutionMode::DryRun, exchange.clone());

        let mut products = HashMap::new();
        products.insert("SOL-USD".to_string(), product("SOL-USD"));
        let quotes = exchange.quotes.clone();

        let reports = engine
            .execute(
                &[proposal("SOL-USD", Side::Buy, 2.0)],
                &portfolio(1_000.0),
                &products,
                &quotes,
                &universe(&["SOL-USD"]),
            )
            .await
            .unwrap();

        assert!(matches!(reports[0].outcome, ExecutionOutcome::DryRun));
        assert!(exchange.placed.lock().is_empty());
        assert!(store.with(|s| s.positions.is_empty()));
    }

    #[tokio::test]
    async fn live_with_read_only_adapter_is_refused_up_front() {
        let mut mock = MockExchange::new().with_quote("SOL-USD", 99.95, 100.05);
        mock.read_only = true;
        let exchange = Arc::new(mock);
        let (engine, _, _) = engine_with(ExecutionMode::Live, exchange.clone());

        let result = engine
            .execute(
                &[proposal("SOL-USD", Side::Buy, 2.0)],
                &portfolio(1_000.0),
                &HashMap::new(),
                &HashMap::new(),
                &universe(&["SOL-USD"]),
            )
            .await;
        assert!(result.is_err());
        assert!(exchange.placed.lock().is_empty());
    }

    #[tokio::test]
    async fn paper_buy_creates_position_and_spends_cash() {
        let exchange = Arc::new(MockExchange::new().with_quote("SOL-USD", 99.95, 100.05));
        let (engine, store, osm) = engine_with(ExecutionMode::Paper, exchange.clone());
        store.update(|s| s.paper_cash_usd = Some(1_000.0));

        let mut products = HashMap::new();
        products.insert("SOL-USD".to_string(), product("SOL-USD"));
        let quotes = exchange.quotes.clone();

        let reports = engine
            .execute(
                &[proposal("SOL-USD", Side::Buy, 2.0)],
                &portfolio(1_000.0),
                &products,
                &quotes,
                &universe(&["SOL-USD"]),
            )
            .await
            .unwrap();

        match &reports[0].outcome {
            ExecutionOutcome::Filled { base, quote, .. } => {
                assert!(*base > 0.0);
                assert!(*quote > 0.0);
            }
            other => panic!("expected fill, got {other:?}"),
        }

        store.with(|s| {
            let pos = s.positions.get("SOL-USD").expect("position opened");
            assert!(pos.quantity_base > 0.0);
            assert!(pos.avg_entry_price > 99.0);
            assert!(s.paper_cash_usd.unwrap() < 1_000.0);
            assert!(s.last_trade_ts.is_some());
        });
        // Order landed in a terminal state and left pending_orders.
        assert!(store.with(|s| s.pending_orders.is_empty()));
        assert!(osm.active_orders().is_empty());
    }

    #[tokio::test]
    async fn live_rejection_records_burst_history() {
        let exchange = Arc::new(MockExchange::new().with_quote("SOL-USD", 99.95, 100.05));
        let (engine, store, _) = engine_with(ExecutionMode::Live, exchange.clone());

        let mut products = HashMap::new();
        products.insert("SOL-USD".to_string(), product("SOL-USD"));
        let quotes = exchange.quotes.clone();
        let pf = portfolio(1_000.0);
        let uni = universe(&["SOL-USD"]);

        exchange.reject_next_placement.store(true, Ordering::SeqCst);
        // Also reject the fallback IOC.
        let reports = {
            exchange.reject_next_placement.store(true, Ordering::SeqCst);
            engine
                .execute(&[proposal("SOL-USD", Side::Buy, 2.0)], &pf, &products, &quotes, &uni)
                .await
                .unwrap()
        };
        // Maker was rejected, IOC fallback got a fresh id from the mock and
        // was accepted, so the attempt ends Placed; rejection history has 1.
        let burst = store.with(|s| s.rejection_history.get("SOL-USD").map(|v| v.len()).unwrap_or(0));
        assert!(burst >= 1);
        assert!(!reports.is_empty());
    }

    #[tokio::test]
    async fn size_in_quote_fill_reconciles_to_correct_base() {
        // Scenario: requested $2.68 of ETH; exchange reports
        // size=2.6399716828, size_in_quote=true, price=2975.32.
        let exchange = Arc::new(MockExchange::new().with_quote("ETH-USD", 2975.0, 2975.64));
        let (engine, store, osm) = engine_with(ExecutionMode::Live, exchange.clone());

        let client_id = osm.create(
            "ETH-USD",
            Side::Buy,
            "ioc_limit",
            2975.32,
            0.0009,
            2.68,
            "trigger_follow",
        );
        osm.acknowledge(&client_id, "X-ETH");
        store.update(|s| {
            s.pending_orders.insert(
                client_id.clone(),
                StoredOrder {
                    client_order_id: client_id.clone(),
                    exchange_order_id: Some("X-ETH".into()),
                    symbol: "ETH-USD".into(),
                    side: Side::Buy,
                    order_type: "ioc_limit".into(),
                    price: 2975.32,
                    size_base: 0.0009,
                    size_quote: 2.68,
                    status: OrderStatus::Open,
                    created_at: Utc::now(),
                    strategy: "trigger_follow".into(),
                },
            );
        });

        let mut f = fill("X-ETH", "t-eth-1", 2975.32, 2.6399716828, true);
        f.product_id = "ETH-USD".into();
        exchange.push_fill(f);

        let applied = engine.reconcile_fills().await.unwrap();
        assert_eq!(applied, 1);

        store.with(|s| {
            let pos = s.positions.get("ETH-USD").expect("position created");
            // base = 2.64 / 2975.32 ≈ 0.000887, NOT 2.64.
            assert!((pos.quantity_base - 2.6399716828 / 2975.32).abs() < 1e-9);
            assert!(pos.quantity_base < 0.001);
        });

        let order = osm.get(&client_id).unwrap();
        assert!((order.filled_value - 2.6399716828).abs() < 1e-9);
        assert_eq!(order.status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn notional_mismatch_discards_fill_and_fails_order() {
        let exchange = Arc::new(MockExchange::new());
        let (engine, store, osm) = engine_with(ExecutionMode::Live, exchange.clone());

        let client_id = osm.create(
            "SOL-USD",
            Side::Buy,
            "ioc_limit",
            100.0,
            0.2,
            20.0,
            "trigger_follow",
        );
        osm.acknowledge(&client_id, "X-SOL");

        // Exchange claims a $45 fill against a $20 request: way out.
        exchange.push_fill(fill("X-SOL", "t-bad", 100.0, 0.45, false));

        let applied = engine.reconcile_fills().await.unwrap();
        assert_eq!(applied, 0);
        assert!(store.with(|s| s.positions.is_empty()), "no state update on mismatch");
        assert_eq!(osm.get(&client_id).unwrap().status, OrderStatus::Rejected);
    }

    #[test]
    fn mismatch_threshold_boundaries() {
        // Scenario B: |2.68 - 2.64| = 0.04 < max(0.20, 0.0536) -> ok.
        assert!(!fill_notional_mismatch(2.68, 2.6399716828));
        // Small notional: absolute 20c floor governs.
        assert!(fill_notional_mismatch(2.0, 2.30));
        assert!(!fill_notional_mismatch(2.0, 2.15));
        // Large notional: 2% governs.
        assert!(fill_notional_mismatch(1_000.0, 1_025.0));
        assert!(!fill_notional_mismatch(1_000.0, 1_015.0));
    }

    #[tokio::test]
    async fn duplicate_trade_ids_do_not_double_fill() {
        let exchange = Arc::new(MockExchange::new());
        let (engine, store, osm) = engine_with(ExecutionMode::Live, exchange.clone());

        let client_id = osm.create(
            "SOL-USD",
            Side::Buy,
            "ioc_limit",
            100.0,
            0.2,
            20.0,
            "trigger_follow",
        );
        osm.acknowledge(&client_id, "X-1");
        exchange.push_fill(fill("X-1", "t-dup", 100.0, 0.2, false));

        assert_eq!(engine.reconcile_fills().await.unwrap(), 1);
        // The same fill appears again on the next poll.
        assert_eq!(engine.reconcile_fills().await.unwrap(), 0);

        store.with(|s| {
            let pos = &s.positions["SOL-USD"];
            assert!((pos.quantity_base - 0.2).abs() < 1e-12);
        });
    }

    #[tokio::test]
    async fn sell_fill_realizes_pnl_and_sets_cooldown() {
        let exchange = Arc::new(MockExchange::new());
        let (engine, store, osm) = engine_with(ExecutionMode::Live, exchange.clone());

        store.update(|s| {
            s.positions.insert(
                "SOL-USD".into(),
                StoredPosition {
                    symbol: "SOL-USD".into(),
                    quantity_base: 0.2,
                    avg_entry_price: 100.0,
                    entry_time: Utc::now(),
                    strategy: "trigger_follow".into(),
                },
            );
        });

        let client_id = osm.create(
            "SOL-USD",
            Side::Sell,
            "ioc_limit",
            110.0,
            0.2,
            22.0,
            "position_exit",
        );
        osm.acknowledge(&client_id, "X-SELL");
        let mut f = fill("X-SELL", "t-sell", 110.0, 0.2, false);
        f.side = Side::Sell;
        exchange.push_fill(f);

        engine.reconcile_fills().await.unwrap();

        store.with(|s| {
            assert!(s.positions.is_empty(), "position fully closed");
            let pnl: f64 = s.realized_pnl_by_day.values().sum();
            // 0.2 * (110 - 100) - 0.12 fee = 1.88
            assert!((pnl - 1.88).abs() < 1e-9);
            let cd = s.cooldowns.get("SOL-USD").expect("cooldown set");
            assert_eq!(cd.reason, "win");
        });
    }

    #[tokio::test]
    async fn losing_sell_sets_loss_cooldown() {
        let exchange = Arc::new(MockExchange::new());
        let (engine, store, osm) = engine_with(ExecutionMode::Live, exchange.clone());
        store.update(|s| {
            s.positions.insert(
                "SOL-USD".into(),
                StoredPosition {
                    symbol: "SOL-USD".into(),
                    quantity_base: 0.2,
                    avg_entry_price: 100.0,
                    entry_time: Utc::now(),
                    strategy: "trigger_follow".into(),
                },
            );
        });

        let client_id = osm.create("SOL-USD", Side::Sell, "ioc_limit", 98.0, 0.2, 19.6, "position_exit");
        osm.acknowledge(&client_id, "X-L");
        let mut f = fill("X-L", "t-loss", 98.0, 0.2, false);
        f.side = Side::Sell;
        exchange.push_fill(f);
        engine.reconcile_fills().await.unwrap();

        store.with(|s| {
            assert_eq!(s.cooldowns["SOL-USD"].reason, "loss");
        });
    }

    #[tokio::test]
    async fn deep_losing_sell_sets_stop_out_cooldown() {
        let exchange = Arc::new(MockExchange::new());
        let (engine, store, osm) = engine_with(ExecutionMode::Live, exchange.clone());
        store.update(|s| {
            s.positions.insert(
                "SOL-USD".into(),
                StoredPosition {
                    symbol: "SOL-USD".into(),
                    quantity_base: 0.2,
                    avg_entry_price: 100.0,
                    entry_time: Utc::now(),
                    strategy: "trigger_follow".into(),
                },
            );
        });

        let client_id = osm.create("SOL-USD", Side::Sell, "ioc_limit", 92.0, 0.2, 18.4, "position_exit");
        osm.acknowledge(&client_id, "X-S");
        let mut f = fill("X-S", "t-stop", 92.0, 0.2, false);
        f.side = Side::Sell;
        exchange.push_fill(f);
        engine.reconcile_fills().await.unwrap();

        store.with(|s| {
            assert_eq!(s.cooldowns["SOL-USD"].reason, "stop_out");
        });
    }

    #[tokio::test]
    async fn cancel_of_terminal_order_is_a_no_op() {
        let exchange = Arc::new(MockExchange::new());
        let (engine, _, osm) = engine_with(ExecutionMode::Live, exchange.clone());

        let client_id = osm.create("SOL-USD", Side::Buy, "ioc_limit", 100.0, 0.2, 20.0, "s");
        osm.acknowledge(&client_id, "X-DONE");
        osm.record_fill(
            &client_id,
            OrderFill {
                trade_id: "t-full".into(),
                price: 100.0,
                size_base: 0.2,
                value_quote: 20.0,
                fee: 0.02,
                liquidity: Liquidity::Taker,
                time: Utc::now(),
            },
            0.05,
        );
        assert_eq!(osm.get(&client_id).unwrap().status, OrderStatus::Filled);

        engine.cancel_tracked(&client_id).await;
        assert!(exchange.canceled.lock().is_empty(), "no exchange request");
        assert_eq!(osm.get(&client_id).unwrap().status, OrderStatus::Filled);
    }

    #[tokio::test]
    async fn ghost_orders_are_filtered_from_exchange_reads() {
        let exchange = Arc::new(MockExchange::new());
        let (engine, _, osm) = engine_with(ExecutionMode::Live, exchange.clone());

        let client_id = osm.create("SOL-USD", Side::Buy, "post_only_limit", 100.0, 0.2, 20.0, "s");
        osm.acknowledge(&client_id, "XID");
        let order = osm.get(&client_id).unwrap();
        osm.mark_canceled(&order);

        let open = vec![
            OpenOrder {
                order_id: "XID".into(),
                client_order_id: client_id.clone(),
                product_id: "SOL-USD".into(),
                side: Side::Buy,
                price: 100.0,
                size_base: 0.2,
                filled_size: 0.0,
            },
            OpenOrder {
                order_id: "OTHER".into(),
                client_order_id: "other-client".into(),
                product_id: "ETH-USD".into(),
                side: Side::Buy,
                price: 3000.0,
                size_base: 0.01,
                filled_size: 0.0,
            },
        ];
        let filtered = engine.filter_ghosts(open);
        assert_eq!(filtered.len(), 1);
        assert_eq!(filtered[0].order_id, "OTHER");
    }

    #[tokio::test]
    async fn stale_orders_are_canceled_even_when_batch_fails() {
        let exchange = Arc::new(MockExchange::new());
        exchange.fail_batch_cancel.store(true, Ordering::SeqCst);
        let (mut cfg, purge, risk) = (
            ExecutionConfig::default(),
            PurgeConfig::default(),
            RiskConfig::default(),
        );
        cfg.cancel_after_seconds = 0; // everything is instantly stale

        let store = store();
        let osm = Arc::new(OrderStateMachine::new(Duration::from_secs(60)));
        let engine = ExecutionEngine::new(
            exchange.clone(),
            osm.clone(),
            store.clone(),
            Arc::new(AlertPipeline::new(AlertConfig::default())),
            cfg,
            purge,
            risk,
            ExecutionMode::Live,
        );

        let client_id = osm.create("SOL-USD", Side::Buy, "post_only_limit", 100.0, 0.2, 20.0, "s");
        osm.acknowledge(&client_id, "X-STALE");

        let canceled = engine.manage_open_orders().await.unwrap();
        assert_eq!(canceled, 1);
        // Batch reported nothing, so the individual path ran too.
        assert!(exchange.canceled.lock().iter().any(|id| id == "X-STALE"));
        assert_eq!(osm.get(&client_id).unwrap().status, OrderStatus::Canceled);
        assert!(osm.is_ghost("X-STALE"));
    }

    #[tokio::test]
    async fn purge_respects_backoff_and_clears_on_success() {
        let exchange = Arc::new(MockExchange::new().with_quote("BONK-USD", 0.99, 1.01));
        let (engine, store, _) = engine_with(ExecutionMode::Paper, exchange.clone());
        store.update(|s| {
            s.paper_cash_usd = Some(0.0);
            s.positions.insert(
                "BONK-USD".into(),
                StoredPosition {
                    symbol: "BONK-USD".into(),
                    quantity_base: 50.0,
                    avg_entry_price: 1.0,
                    entry_time: Utc::now(),
                    strategy: "trigger_follow".into(),
                },
            );
        });

        // Three prior failures put the symbol in a 1h backoff window.
        let now = Utc::now();
        store.update(|s| {
            for _ in 0..3 {
                s.record_purge_failure("BONK-USD", "INVALID_ORDER_CONFIGURATION", now);
            }
        });

        let mut pf = portfolio(50.0);
        pf.positions.insert(
            "BONK-USD".into(),
            crate::portfolio::Position {
                symbol: "BONK-USD".into(),
                quantity_base: 50.0,
                avg_entry_price: 1.0,
                usd_value: 50.0,
                unrealized_pnl_pct: 0.0,
                entry_time: now,
                strategy: "trigger_follow".into(),
            },
        );
        let uni = universe(&[]); // BONK ineligible
        let quotes = exchange.quotes.clone();

        engine.purge_ineligible(&pf, &uni, &quotes).await.unwrap();
        // Backoff held: the position is untouched.
        store.with(|s| assert!(s.positions.contains_key("BONK-USD")));

        // Clear the failure record and purge for real.
        store.update(|s| s.clear_purge_failures("BONK-USD"));
        engine.purge_ineligible(&pf, &uni, &quotes).await.unwrap();
        store.with(|s| {
            assert!(!s.positions.contains_key("BONK-USD"), "purged");
            assert!(!s.purge_failures.contains_key("BONK-USD"));
        });
    }

    #[tokio::test]
    async fn auto_trim_sells_losers_first() {
        let exchange = Arc::new(
            MockExchange::new()
                .with_quote("A-USD", 99.0, 101.0)
                .with_quote("B-USD", 99.0, 101.0),
        );
        let (engine, store, _) = engine_with(ExecutionMode::Paper, exchange.clone());
        store.update(|s| {
            s.paper_cash_usd = Some(0.0);
            for (sym, qty) in [("A-USD", 2.0), ("B-USD", 2.0)] {
                s.positions.insert(
                    sym.into(),
                    StoredPosition {
                        symbol: sym.into(),
                        quantity_base: qty,
                        avg_entry_price: 100.0,
                        entry_time: Utc::now(),
                        strategy: "trigger_follow".into(),
                    },
                );
            }
        });

        let mut pf = portfolio(400.0);
        pf.total_exposure_pct = 100.0;
        pf.positions.insert(
            "A-USD".into(),
            crate::portfolio::Position {
                symbol: "A-USD".into(),
                quantity_base: 2.0,
                avg_entry_price: 100.0,
                usd_value: 200.0,
                unrealized_pnl_pct: -10.0, // the loser
                entry_time: Utc::now(),
                strategy: "trigger_follow".into(),
            },
        );
        pf.positions.insert(
            "B-USD".into(),
            crate::portfolio::Position {
                symbol: "B-USD".into(),
                quantity_base: 2.0,
                avg_entry_price: 100.0,
                usd_value: 200.0,
                unrealized_pnl_pct: 5.0,
                entry_time: Utc::now(),
                strategy: "trigger_follow".into(),
            },
        );

        let quotes = exchange.quotes.clone();
        // Cap 75%: excess = 25% of $400 = $100, covered by trimming A.
        engine.auto_trim(&pf, 75.0, &quotes).await.unwrap();

        store.with(|s| {
            let a = s.positions.get("A-USD").map(|p| p.quantity_base).unwrap_or(0.0);
            let b = s.positions.get("B-USD").map(|p| p.quantity_base).unwrap_or(0.0);
            assert!(a < 2.0, "loser was trimmed");
            assert!((b - 2.0).abs() < 1e-9, "winner untouched");
        });
    }
}
