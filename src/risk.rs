// =============================================================================
// Risk Engine — ordered pre-trade checks protecting capital
// =============================================================================
//
// Runs every cycle between proposal generation and execution. Fatal checks
// (kill switch, connectivity, stop-losses, pacing, trade caps) reject the
// whole cycle; per-proposal checks filter and resize individual proposals.
//
// Proposals are processed in descending (confidence, tier-priority) order,
// and capacity-constrained resizing is greedy in that order: the most
// confident proposal gets first claim on remaining exposure headroom.
// =============================================================================

use std::collections::{HashMap, HashSet};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::coinbase::{Product, QuoteTick};
use crate::config::{ExecutionConfig, RiskConfig, StrategyEntry};
use crate::portfolio::PortfolioState;
use crate::store::StateStore;
use crate::strategies::TradeProposal;
use crate::types::Side;
use crate::universe::UniverseSnapshot;

// ---------------------------------------------------------------------------
// Check names and the bounded metrics vocabulary
// ---------------------------------------------------------------------------

pub mod checks {
    pub const KILL_SWITCH: &str = "kill_switch";
    pub const CONNECTIVITY: &str = "connectivity";
    pub const PRODUCT_STATUS: &str = "product_status";
    pub const DAILY_STOP_LOSS: &str = "daily_stop_loss";
    pub const WEEKLY_STOP_LOSS: &str = "weekly_stop_loss";
    pub const MAX_DRAWDOWN: &str = "max_drawdown";
    pub const GLOBAL_SPACING: &str = "global_spacing";
    pub const HOURLY_CAP: &str = "hourly_cap";
    pub const DAILY_CAP: &str = "daily_cap";
    pub const STRATEGY_BUDGET: &str = "strategy_budget";
    pub const COOLDOWN: &str = "cooldown";
    pub const SYMBOL_SPACING: &str = "symbol_spacing";
    pub const OUTLIER: &str = "outlier";
    pub const PENDING_BUY: &str = "pending_buy";
    pub const PYRAMIDING: &str = "pyramiding";
    pub const SIZE_CONSTRAINT: &str = "size_constraint";
    pub const MAX_OPEN_POSITIONS: &str = "max_open_positions";
}

/// Collapse check names into the bounded (<= 9) metrics label vocabulary.
pub fn metric_reason(check: &str) -> &'static str {
    use checks::*;
    match check {
        KILL_SWITCH => "kill_switch",
        CONNECTIVITY => "connectivity",
        PRODUCT_STATUS => "product_status",
        DAILY_STOP_LOSS | WEEKLY_STOP_LOSS | MAX_DRAWDOWN => "stop_loss_halt",
        GLOBAL_SPACING | SYMBOL_SPACING => "pacing",
        HOURLY_CAP | DAILY_CAP | MAX_OPEN_POSITIONS => "trade_cap",
        COOLDOWN | OUTLIER => "cooldown",
        PENDING_BUY | PYRAMIDING => "duplicate_position",
        _ => "size_constraint",
    }
}

// ---------------------------------------------------------------------------
// Result
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct RiskResult {
    /// False when a fatal check halted the whole cycle.
    pub approved: bool,
    /// Reason for a cycle-level halt.
    pub reason: Option<String>,
    pub approved_proposals: Vec<TradeProposal>,
    /// Per-symbol rejection reasons.
    pub proposal_rejections: HashMap<String, Vec<String>>,
    /// Names of every check that fired this cycle.
    pub violated_checks: Vec<String>,
}

impl RiskResult {
    fn halt(reason: &str, check: &str, proposals: &[TradeProposal]) -> Self {
        let mut rejections: HashMap<String, Vec<String>> = HashMap::new();
        for p in proposals {
            rejections
                .entry(p.symbol.clone())
                .or_default()
                .push(check.to_string());
        }
        Self {
            approved: false,
            reason: Some(reason.to_string()),
            approved_proposals: Vec::new(),
            proposal_rejections: rejections,
            violated_checks: vec![check.to_string()],
        }
    }
}

/// Everything the risk engine needs for one cycle, gathered by the
/// orchestrator.
pub struct RiskInputs<'a> {
    pub proposals: Vec<TradeProposal>,
    pub portfolio: &'a PortfolioState,
    pub universe: &'a UniverseSnapshot,
    pub products: &'a HashMap<String, Product>,
    pub quotes: &'a HashMap<String, QuoteTick>,
    /// Symbols the outlier guard skipped this cycle (mirrored check for
    /// late-arriving proposals from external sources).
    pub outlier_skipped: &'a HashSet<String>,
    pub consecutive_api_errors: u32,
    pub kill_switch_file_present: bool,
    pub now: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// Engine
// ---------------------------------------------------------------------------

pub struct RiskEngine {
    risk: RiskConfig,
    execution: ExecutionConfig,
    strategy_entries: HashMap<String, StrategyEntry>,
}

impl RiskEngine {
    pub fn new(
        risk: RiskConfig,
        execution: ExecutionConfig,
        strategies: &[StrategyEntry],
    ) -> Self {
        Self {
            risk,
            execution,
            strategy_entries: strategies
                .iter()
                .map(|s| (s.name.clone(), s.clone()))
                .collect(),
        }
    }

    pub fn check(&self, store: &StateStore, inputs: RiskInputs) -> RiskResult {
        let proposals = &inputs.proposals;

        // ── 1. Kill switch ──────────────────────────────────────────────
        let kill_state = store.with(|s| s.kill_switch_active);
        if inputs.kill_switch_file_present || kill_state {
            warn!("kill switch active: all trading halted");
            return RiskResult::halt("kill_switch_active", checks::KILL_SWITCH, proposals);
        }

        // ── 2. Exchange connectivity ────────────────────────────────────
        if inputs.consecutive_api_errors >= self.risk.max_consecutive_api_errors {
            warn!(
                consecutive = inputs.consecutive_api_errors,
                limit = self.risk.max_consecutive_api_errors,
                "connectivity degraded: trading halted"
            );
            return RiskResult::halt("connectivity_degraded", checks::CONNECTIVITY, proposals);
        }

        // ── 4. Stop-losses (portfolio level) ────────────────────────────
        let pf = inputs.portfolio;
        if pf.daily_pnl_pct <= -self.risk.daily_stop_loss_pct {
            warn!(daily_pnl_pct = pf.daily_pnl_pct, "daily stop-loss hit");
            return RiskResult::halt("daily_stop_loss_hit", checks::DAILY_STOP_LOSS, proposals);
        }
        if pf.weekly_pnl_pct <= -self.risk.weekly_stop_loss_pct {
            warn!(weekly_pnl_pct = pf.weekly_pnl_pct, "weekly stop-loss hit");
            return RiskResult::halt("weekly_stop_loss_hit", checks::WEEKLY_STOP_LOSS, proposals);
        }
        if pf.drawdown_pct >= self.risk.max_drawdown_pct {
            warn!(
                drawdown_pct = pf.drawdown_pct,
                hwm = pf.high_water_mark,
                "max drawdown exceeded"
            );
            return RiskResult::halt("max_drawdown_exceeded", checks::MAX_DRAWDOWN, proposals);
        }

        let has_entries = proposals.iter().any(|p| p.side == Side::Buy);

        // ── 5. Global trade spacing ─────────────────────────────────────
        if has_entries {
            if let Some(last) = pf.last_trade_ts {
                let elapsed = (inputs.now - last).num_seconds();
                if elapsed < self.risk.min_seconds_between_trades as i64 {
                    return RiskResult::halt(
                        "global_trade_spacing",
                        checks::GLOBAL_SPACING,
                        proposals,
                    );
                }
            }
        }

        // ── 6. Hourly / daily trade caps ────────────────────────────────
        if has_entries {
            let (hourly, daily) =
                store.with(|s| (s.trades_last_hour(inputs.now), s.trades_today(inputs.now)));
            if hourly >= self.risk.max_trades_per_hour {
                return RiskResult::halt("hourly_trade_cap", checks::HOURLY_CAP, proposals);
            }
            if daily >= self.risk.max_trades_per_day {
                return RiskResult::halt("daily_trade_cap", checks::DAILY_CAP, proposals);
            }
        }

        // ── Per-proposal gauntlet (checks 3, 7-15) ──────────────────────
        // Descending (confidence, tier-priority); greedy capacity claims.
        let mut ordered = inputs.proposals.clone();
        ordered.sort_by(|a, b| {
            b.confidence
                .partial_cmp(&a.confidence)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    let ta = inputs.universe.tier_of(&a.symbol).map(|t| t.priority()).unwrap_or(9);
                    let tb = inputs.universe.tier_of(&b.symbol).map(|t| t.priority()).unwrap_or(9);
                    ta.cmp(&tb)
                })
        });

        let mut approved: Vec<TradeProposal> = Vec::new();
        let mut rejections: HashMap<String, Vec<String>> = HashMap::new();
        let mut violated: Vec<String> = Vec::new();

        // Capacity accumulators for greedy resizing.
        let pending_buy_pct: f64 = if pf.nav_usd > 0.0 {
            pf.pending_orders
                .values()
                .filter(|o| o.side == Side::Buy && !o.status.is_terminal())
                .map(|o| o.size_quote)
                .sum::<f64>()
                / pf.nav_usd
                * 100.0
        } else {
            0.0
        };
        let mut global_used_pct = pf.total_exposure_pct + pending_buy_pct;
        let mut strategy_used_pct: HashMap<String, f64> = HashMap::new();
        let mut strategy_trades_this_cycle: HashMap<String, u32> = HashMap::new();
        let mut cluster_used_pct: HashMap<String, f64> = self
            .risk
            .clusters
            .iter()
            .map(|(name, members)| {
                let used: f64 = members.iter().map(|m| pf.exposure_pct(m)).sum();
                (name.clone(), used)
            })
            .collect();
        let mut new_positions = 0u32;

        let reject = |rejections: &mut HashMap<String, Vec<String>>,
                          violated: &mut Vec<String>,
                          symbol: &str,
                          check: &str| {
            rejections
                .entry(symbol.to_string())
                .or_default()
                .push(check.to_string());
            if !violated.iter().any(|v| v == check) {
                violated.push(check.to_string());
            }
        };

        for mut proposal in ordered {
            let symbol = proposal.symbol.clone();

            // ── 3. Exchange product status (fail-closed) ────────────
            let tradable = inputs
                .products
                .get(&symbol)
                .map(|p| p.status.tradable())
                .unwrap_or(false);
            if !tradable {
                reject(&mut rejections, &mut violated, &symbol, checks::PRODUCT_STATUS);
                continue;
            }

            // ── 7. Per-strategy budgets ─────────────────────────────
            let entry = self.strategy_entries.get(&proposal.strategy);
            if let Some(entry) = entry {
                let trades = strategy_trades_this_cycle
                    .get(&proposal.strategy)
                    .copied()
                    .unwrap_or(0);
                if trades >= entry.max_trades_per_cycle {
                    reject(&mut rejections, &mut violated, &symbol, checks::STRATEGY_BUDGET);
                    continue;
                }
            }

            if proposal.side == Side::Buy {
                // ── 8. Per-symbol cooldowns ─────────────────────────
                let cooldown = store.update(|s| s.active_cooldown(&symbol, inputs.now));
                if let Some(cd) = cooldown {
                    info!(symbol = %symbol, until = %cd.until, reason = %cd.reason, "symbol in cooldown");
                    reject(&mut rejections, &mut violated, &symbol, checks::COOLDOWN);
                    continue;
                }

                // ── 9. Per-symbol pacing ────────────────────────────
                if let Some(last) = pf.per_symbol_last_trade.get(&symbol) {
                    let elapsed = (inputs.now - *last).num_seconds();
                    if elapsed < self.risk.min_seconds_between_trades_same_symbol as i64 {
                        reject(&mut rejections, &mut violated, &symbol, checks::SYMBOL_SPACING);
                        continue;
                    }
                }

                // ── 10. Outlier guard mirror ────────────────────────
                if inputs.outlier_skipped.contains(&symbol) {
                    reject(&mut rejections, &mut violated, &symbol, checks::OUTLIER);
                    continue;
                }

                // ── 11. Pending-buy dedupe ──────────────────────────
                if store.with(|s| s.has_pending_buy(&symbol)) {
                    reject(&mut rejections, &mut violated, &symbol, checks::PENDING_BUY);
                    continue;
                }

                // ── 12. Pyramiding ──────────────────────────────────
                let is_add = pf.has_position(&symbol);
                if is_add {
                    if !self.risk.pyramiding_enabled {
                        reject(&mut rejections, &mut violated, &symbol, checks::PYRAMIDING);
                        continue;
                    }
                    let adds = store.with(|s| s.adds_for(&symbol, inputs.now));
                    if adds >= self.risk.max_adds_per_asset_per_day {
                        reject(&mut rejections, &mut violated, &symbol, checks::PYRAMIDING);
                        continue;
                    }
                    let pyramided = store.with(|s| {
                        s.adds_today
                            .iter()
                            .filter(|(sym, d)| {
                                d.count > 0 && pf.has_position(sym) && *sym != &symbol
                            })
                            .count() as u32
                    });
                    if adds == 0 && pyramided >= self.risk.max_pyramid_positions {
                        reject(&mut rejections, &mut violated, &symbol, checks::PYRAMIDING);
                        continue;
                    }
                }

                // ── 15. Max open positions ──────────────────────────
                if !is_add
                    && pf.open_position_count() as u32 + new_positions
                        >= self.risk.max_open_positions
                {
                    reject(&mut rejections, &mut violated, &symbol, checks::MAX_OPEN_POSITIONS);
                    continue;
                }

                // ── 13. Exposure caps (greedy resize) ───────────────
                let mut headroom =
                    self.risk.max_position_size_pct - pf.exposure_pct(&symbol);
                headroom = headroom.min(self.risk.max_total_at_risk_pct - global_used_pct);
                for (cluster, members) in &self.risk.clusters {
                    if members.iter().any(|m| m == &symbol) {
                        if let Some(cap) = self.risk.cluster_caps_pct.get(cluster) {
                            let used = cluster_used_pct.get(cluster).copied().unwrap_or(0.0);
                            headroom = headroom.min(cap - used);
                        }
                    }
                }
                if let Some(entry) = entry {
                    let used = pf.strategy_exposure_pct(&proposal.strategy)
                        + strategy_used_pct
                            .get(&proposal.strategy)
                            .copied()
                            .unwrap_or(0.0);
                    headroom = headroom.min(entry.max_at_risk_pct - used);
                }

                if headroom <= 0.0 {
                    reject(&mut rejections, &mut violated, &symbol, checks::SIZE_CONSTRAINT);
                    continue;
                }
                if proposal.size_pct > headroom {
                    info!(
                        symbol = %symbol,
                        requested = proposal.size_pct,
                        resized = headroom,
                        "proposal resized to fit exposure headroom"
                    );
                    proposal.size_pct = headroom;
                }

                // ── 14. Fee-aware sizing ────────────────────────────
                match self.fee_aware_size(&proposal, pf, &inputs, headroom) {
                    Some(size_pct) => proposal.size_pct = size_pct,
                    None => {
                        reject(&mut rejections, &mut violated, &symbol, checks::SIZE_CONSTRAINT);
                        continue;
                    }
                }

                // Claim capacity.
                global_used_pct += proposal.size_pct;
                *strategy_used_pct.entry(proposal.strategy.clone()).or_insert(0.0) +=
                    proposal.size_pct;
                for (cluster, members) in &self.risk.clusters {
                    if members.iter().any(|m| m == &symbol) {
                        *cluster_used_pct.entry(cluster.clone()).or_insert(0.0) +=
                            proposal.size_pct;
                    }
                }
                if !is_add {
                    new_positions += 1;
                }
            } else {
                // SELL: only the notional floor applies; exits reduce risk.
                let notional = proposal.size_pct / 100.0 * pf.nav_usd;
                if notional < self.execution.min_order_notional_usd {
                    reject(&mut rejections, &mut violated, &symbol, checks::SIZE_CONSTRAINT);
                    continue;
                }
            }

            *strategy_trades_this_cycle
                .entry(proposal.strategy.clone())
                .or_insert(0) += 1;
            approved.push(proposal);
        }

        let approved_any = !approved.is_empty();
        RiskResult {
            approved: approved_any || inputs.proposals.is_empty(),
            reason: if approved_any || inputs.proposals.is_empty() {
                None
            } else {
                Some("all_proposals_rejected".to_string())
            },
            approved_proposals: approved,
            proposal_rejections: rejections,
            violated_checks: violated,
        }
    }

    /// Adjust the notional so that, after the worst-case fee, the remaining
    /// base units floored to the lot size still clear the exchange minimum.
    /// Returns the adjusted size_pct, or None when unachievable.
    fn fee_aware_size(
        &self,
        proposal: &TradeProposal,
        pf: &PortfolioState,
        inputs: &RiskInputs,
        headroom_pct: f64,
    ) -> Option<f64> {
        if pf.nav_usd <= 0.0 {
            return None;
        }
        let product = inputs.products.get(&proposal.symbol)?;
        let price = inputs.quotes.get(&proposal.symbol).map(|q| q.mid())?;
        if price <= 0.0 {
            return None;
        }

        let fee_bps = if self.execution.taker_fallback {
            self.execution.taker_fee_bps
        } else {
            self.execution.maker_fee_bps
        };
        let fee_frac = fee_bps / 10_000.0;

        let min_notional = product
            .min_notional_usd
            .max(self.execution.min_order_notional_usd)
            .max(self.risk.min_trade_notional_usd);

        let mut notional = proposal.size_pct / 100.0 * pf.nav_usd;

        // The post-fee, lot-floored base must clear the exchange minimum.
        let clears = |notional: f64| -> bool {
            let base = notional * (1.0 - fee_frac) / price;
            let floored = if product.lot_size > 0.0 {
                (base / product.lot_size).floor() * product.lot_size
            } else {
                base
            };
            floored > 0.0 && floored * price >= min_notional * (1.0 - fee_frac)
        };

        if !clears(notional) {
            // Bump up to the smallest workable notional, if headroom allows.
            let bumped = (min_notional / (1.0 - fee_frac)) * 1.01
                + product.lot_size * price;
            let bumped_pct = bumped / pf.nav_usd * 100.0;
            if bumped_pct <= headroom_pct && clears(bumped) {
                notional = bumped;
            } else {
                return None;
            }
        }

        Some(notional / pf.nav_usd * 100.0)
    }
}

impl std::fmt::Debug for RiskEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RiskEngine")
            .field("max_total_at_risk_pct", &self.risk.max_total_at_risk_pct)
            .field("max_open_positions", &self.risk.max_open_positions)
            .field("strategies", &self.strategy_entries.len())
            .finish()
    }
}
