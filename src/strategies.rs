// =============================================================================
// Strategies — pure proposal generators over an immutable cycle context
// =============================================================================
//
// A Strategy sees the universe snapshot, the cycle's triggers, the regime,
// and the portfolio, and returns zero or more TradeProposals. Strategies
// perform no I/O, which keeps them trivially testable and backtestable.
//
// External proposal sources (the AI advisor / meta-arbitrator seam) share
// the exact same TradeProposal contract through ProposalSource.
// =============================================================================

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::config::{StrategiesConfig, StrategyEntry};
use crate::portfolio::PortfolioState;
use crate::signals::{TriggerKind, TriggerSignal};
use crate::types::{Regime, Side};
use crate::universe::UniverseSnapshot;

// ---------------------------------------------------------------------------
// Proposal
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TradeProposal {
    pub symbol: String,
    pub side: Side,
    /// Requested size as % of NAV. Clamped to the policy maximum at merge.
    pub size_pct: f64,
    pub reason: String,
    pub confidence: f64,
    pub stop_loss_pct: Option<f64>,
    pub take_profit_pct: Option<f64>,
    pub strategy: String,
    #[serde(default)]
    pub metadata: serde_json::Value,
}

/// Immutable context handed to every strategy.
pub struct StrategyContext<'a> {
    pub universe: &'a UniverseSnapshot,
    pub triggers: &'a [TriggerSignal],
    pub regime: Regime,
    pub timestamp: DateTime<Utc>,
    pub portfolio: &'a PortfolioState,
}

pub trait Strategy: Send + Sync {
    fn name(&self) -> &str;
    fn generate(&self, ctx: &StrategyContext) -> Vec<TradeProposal>;
}

/// External proposal source with the same contract as local strategies.
/// The AI advisor and the dual-trader meta-arbitrator plug in here.
// TODO: wire the advisor transport once its service contract is settled;
// its thresholds stay out of the risk engine either way.
pub trait ProposalSource: Send + Sync {
    fn name(&self) -> &str;
    fn propose(&self, ctx: &StrategyContext) -> Vec<TradeProposal>;
}

// ---------------------------------------------------------------------------
// TriggerFollow — buy the strongest buy-side triggers
// ---------------------------------------------------------------------------

pub struct TriggerFollowStrategy {
    entry: StrategyEntry,
}

impl TriggerFollowStrategy {
    pub fn new(entry: StrategyEntry) -> Self {
        Self { entry }
    }
}

impl Strategy for TriggerFollowStrategy {
    fn name(&self) -> &str {
        &self.entry.name
    }

    fn generate(&self, ctx: &StrategyContext) -> Vec<TradeProposal> {
        let mut proposals = Vec::new();
        for trig in ctx.triggers {
            if trig.direction != Side::Buy
                || trig.kind == TriggerKind::MeanReversion
                || trig.confidence < self.entry.min_confidence
                || !ctx.universe.is_eligible(&trig.symbol)
            {
                continue;
            }

            // Size scales with confidence above the floor.
            let scale = 0.5 + 0.5 * trig.confidence;
            proposals.push(TradeProposal {
                symbol: trig.symbol.clone(),
                side: Side::Buy,
                size_pct: self.entry.size_pct * scale,
                reason: format!("{} trigger, strength {:.2}", trig.kind, trig.strength),
                confidence: trig.confidence,
                stop_loss_pct: Some(self.entry.stop_loss_pct),
                take_profit_pct: Some(self.entry.take_profit_pct),
                strategy: self.entry.name.clone(),
                metadata: serde_json::json!({
                    "trigger_kind": trig.kind.to_string(),
                    "volatility": trig.volatility,
                }),
            });
        }
        proposals
    }
}

// ---------------------------------------------------------------------------
// DipBuyer — buy mean-reversion dips in chop
// ---------------------------------------------------------------------------

pub struct DipBuyerStrategy {
    entry: StrategyEntry,
}

impl DipBuyerStrategy {
    pub fn new(entry: StrategyEntry) -> Self {
        Self { entry }
    }
}

impl Strategy for DipBuyerStrategy {
    fn name(&self) -> &str {
        &self.entry.name
    }

    fn generate(&self, ctx: &StrategyContext) -> Vec<TradeProposal> {
        if ctx.regime != Regime::Chop {
            return Vec::new();
        }
        let mut proposals = Vec::new();
        for trig in ctx.triggers {
            if trig.kind != TriggerKind::MeanReversion
                || trig.direction != Side::Buy
                || trig.confidence < self.entry.min_confidence
                || !ctx.universe.is_eligible(&trig.symbol)
            {
                continue;
            }
            proposals.push(TradeProposal {
                symbol: trig.symbol.clone(),
                side: Side::Buy,
                size_pct: self.entry.size_pct,
                reason: format!("mean reversion dip, strength {:.2}", trig.strength),
                confidence: trig.confidence,
                stop_loss_pct: Some(self.entry.stop_loss_pct),
                take_profit_pct: Some(self.entry.take_profit_pct),
                strategy: self.entry.name.clone(),
                metadata: serde_json::json!({ "volatility": trig.volatility }),
            });
        }
        proposals
    }
}

// ---------------------------------------------------------------------------
// PositionExit — close positions through their stop / target
// ---------------------------------------------------------------------------

pub struct PositionExitStrategy {
    entry: StrategyEntry,
}

impl PositionExitStrategy {
    pub fn new(entry: StrategyEntry) -> Self {
        Self { entry }
    }
}

impl Strategy for PositionExitStrategy {
    fn name(&self) -> &str {
        &self.entry.name
    }

    fn generate(&self, ctx: &StrategyContext) -> Vec<TradeProposal> {
        let mut proposals = Vec::new();
        for pos in ctx.portfolio.positions.values() {
            if pos.usd_value < ctx.portfolio.min_dust_usd {
                continue;
            }
            let exit_reason = if pos.unrealized_pnl_pct <= -self.entry.stop_loss_pct {
                Some(format!(
                    "stop loss: {:.2}% <= -{:.2}%",
                    pos.unrealized_pnl_pct, self.entry.stop_loss_pct
                ))
            } else if pos.unrealized_pnl_pct >= self.entry.take_profit_pct {
                Some(format!(
                    "take profit: {:.2}% >= {:.2}%",
                    pos.unrealized_pnl_pct, self.entry.take_profit_pct
                ))
            } else {
                None
            };

            if let Some(reason) = exit_reason {
                let size_pct = if ctx.portfolio.nav_usd > 0.0 {
                    pos.usd_value / ctx.portfolio.nav_usd * 100.0
                } else {
                    0.0
                };
                proposals.push(TradeProposal {
                    symbol: pos.symbol.clone(),
                    side: Side::Sell,
                    size_pct,
                    reason,
                    // Exits carry full conviction so they sort ahead of entries.
                    confidence: 0.99,
                    stop_loss_pct: None,
                    take_profit_pct: None,
                    strategy: self.entry.name.clone(),
                    metadata: serde_json::json!({
                        "unrealized_pnl_pct": pos.unrealized_pnl_pct,
                    }),
                });
            }
        }
        proposals
    }
}

// ---------------------------------------------------------------------------
// Registry + merge
// ---------------------------------------------------------------------------

/// Build the enabled strategies from config. Unknown kinds are skipped with
/// a debug log rather than failing startup.
pub fn build_strategies(cfg: &StrategiesConfig) -> Vec<Box<dyn Strategy>> {
    let mut out: Vec<Box<dyn Strategy>> = Vec::new();
    for entry in &cfg.strategies {
        if !entry.enabled {
            continue;
        }
        match entry.kind.as_str() {
            "trigger_follow" => out.push(Box::new(TriggerFollowStrategy::new(entry.clone()))),
            "dip_buyer" => out.push(Box::new(DipBuyerStrategy::new(entry.clone()))),
            "position_exit" => out.push(Box::new(PositionExitStrategy::new(entry.clone()))),
            other => debug!(kind = other, name = %entry.name, "unknown strategy kind, skipped"),
        }
    }
    out
}

/// Default strategy set used when strategies.yaml lists none.
pub fn default_entries() -> Vec<StrategyEntry> {
    let base = |name: &str, kind: &str| StrategyEntry {
        name: name.to_string(),
        kind: kind.to_string(),
        enabled: true,
        size_pct: 2.0,
        min_confidence: 0.55,
        max_at_risk_pct: 10.0,
        max_trades_per_cycle: 2,
        stop_loss_pct: 5.0,
        take_profit_pct: 9.0,
    };
    vec![
        base("trigger_follow", "trigger_follow"),
        base("dip_buyer", "dip_buyer"),
        base("position_exit", "position_exit"),
    ]
}

/// Merge proposals from all sources: clamp sizes to the policy maximum and
/// dedupe by symbol keeping the higher-confidence proposal. SELLs beat BUYs
/// on the same symbol regardless of confidence.
pub fn merge_proposals(
    mut proposals: Vec<TradeProposal>,
    max_single_trade_pct: f64,
) -> Vec<TradeProposal> {
    for p in &mut proposals {
        p.size_pct = p.size_pct.min(max_single_trade_pct).max(0.0);
        p.confidence = p.confidence.clamp(0.0, 1.0);
    }

    let mut by_symbol: std::collections::HashMap<String, TradeProposal> =
        std::collections::HashMap::new();
    for p in proposals {
        match by_symbol.get(&p.symbol) {
            None => {
                by_symbol.insert(p.symbol.clone(), p);
            }
            Some(existing) => {
                let replace = match (existing.side, p.side) {
                    (Side::Buy, Side::Sell) => true,
                    (Side::Sell, Side::Buy) => false,
                    _ => p.confidence > existing.confidence,
                };
                if replace {
                    by_symbol.insert(p.symbol.clone(), p);
                }
            }
        }
    }

    let mut merged: Vec<TradeProposal> = by_symbol.into_values().collect();
    merged.sort_by(|a, b| {
        b.confidence
            .partial_cmp(&a.confidence)
            .unwrap_or(std::cmp::Ordering::Equal)
    });
    merged
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Tier;
    use std::collections::HashMap;

    fn snapshot(symbols: &[&str]) -> UniverseSnapshot {
        let mut snap = UniverseSnapshot::empty(Regime::Chop);
        for s in symbols {
            snap.tiers[Tier::One.index()].push(s.to_string());
        }
        snap
    }

    fn portfolio() -> PortfolioState {
        PortfolioState {
            nav_usd: 1_000.0,
            cash_usd: 1_000.0,
            positions: HashMap::new(),
            pending_orders: HashMap::new(),
            total_exposure_pct: 0.0,
            daily_pnl_pct: 0.0,
            weekly_pnl_pct: 0.0,
            high_water_mark: 1_000.0,
            drawdown_pct: 0.0,
            cycle_count: 1,
            last_trade_ts: None,
            per_symbol_last_trade: HashMap::new(),
            min_dust_usd: 1.0,
        }
    }

    fn trigger(symbol: &str, kind: TriggerKind, direction: Side, confidence: f64) -> TriggerSignal {
        TriggerSignal {
            symbol: symbol.to_string(),
            kind,
            strength: 0.6,
            confidence,
            direction,
            volatility: 1.0,
            timestamp: Utc::now(),
        }
    }

    fn entry() -> StrategyEntry {
        default_entries()[0].clone()
    }

    #[test]
    fn trigger_follow_buys_confident_triggers() {
        let strat = TriggerFollowStrategy::new(entry());
        let snap = snapshot(&["SOL-USD"]);
        let pf = portfolio();
        let triggers = vec![trigger("SOL-USD", TriggerKind::PriceMove, Side::Buy, 0.7)];
        let ctx = StrategyContext {
            universe: &snap,
            triggers: &triggers,
            regime: Regime::Chop,
            timestamp: Utc::now(),
            portfolio: &pf,
        };
        let proposals = strat.generate(&ctx);
        assert_eq!(proposals.len(), 1);
        assert_eq!(proposals[0].side, Side::Buy);
        assert!(proposals[0].stop_loss_pct.is_some());
    }

    #[test]
    fn trigger_follow_ignores_low_confidence_and_ineligible() {
        let strat = TriggerFollowStrategy::new(entry());
        let snap = snapshot(&["SOL-USD"]);
        let pf = portfolio();
        let triggers = vec![
            trigger("SOL-USD", TriggerKind::PriceMove, Side::Buy, 0.3),
            trigger("XYZ-USD", TriggerKind::PriceMove, Side::Buy, 0.9),
        ];
        let ctx = StrategyContext {
            universe: &snap,
            triggers: &triggers,
            regime: Regime::Chop,
            timestamp: Utc::now(),
            portfolio: &pf,
        };
        assert!(strat.generate(&ctx).is_empty());
    }

    #[test]
    fn dip_buyer_only_acts_on_mean_reversion_in_chop() {
        let mut e = entry();
        e.name = "dip_buyer".into();
        let strat = DipBuyerStrategy::new(e);
        let snap = snapshot(&["SOL-USD"]);
        let pf = portfolio();
        let triggers = vec![trigger("SOL-USD", TriggerKind::MeanReversion, Side::Buy, 0.7)];

        let ctx = StrategyContext {
            universe: &snap,
            triggers: &triggers,
            regime: Regime::Chop,
            timestamp: Utc::now(),
            portfolio: &pf,
        };
        assert_eq!(strat.generate(&ctx).len(), 1);

        let ctx_bull = StrategyContext {
            universe: &snap,
            triggers: &triggers,
            regime: Regime::Bull,
            timestamp: Utc::now(),
            portfolio: &pf,
        };
        assert!(strat.generate(&ctx_bull).is_empty());
    }

    #[test]
    fn position_exit_sells_through_stop_and_target() {
        let mut e = entry();
        e.name = "position_exit".into();
        let strat = PositionExitStrategy::new(e);
        let snap = snapshot(&[]);
        let mut pf = portfolio();
        pf.positions.insert(
            "DOWN-USD".into(),
            crate::portfolio::Position {
                symbol: "DOWN-USD".into(),
                quantity_base: 1.0,
                avg_entry_price: 100.0,
                usd_value: 94.0,
                unrealized_pnl_pct: -6.0,
                entry_time: Utc::now(),
                strategy: "trigger_follow".into(),
            },
        );
        pf.positions.insert(
            "UP-USD".into(),
            crate::portfolio::Position {
                symbol: "UP-USD".into(),
                quantity_base: 1.0,
                avg_entry_price: 100.0,
                usd_value: 110.0,
                unrealized_pnl_pct: 10.0,
                entry_time: Utc::now(),
                strategy: "trigger_follow".into(),
            },
        );
        pf.positions.insert(
            "FLAT-USD".into(),
            crate::portfolio::Position {
                symbol: "FLAT-USD".into(),
                quantity_base: 1.0,
                avg_entry_price: 100.0,
                usd_value: 101.0,
                unrealized_pnl_pct: 1.0,
                entry_time: Utc::now(),
                strategy: "trigger_follow".into(),
            },
        );

        let ctx = StrategyContext {
            universe: &snap,
            triggers: &[],
            regime: Regime::Chop,
            timestamp: Utc::now(),
            portfolio: &pf,
        };
        let proposals = strat.generate(&ctx);
        let symbols: Vec<&str> = proposals.iter().map(|p| p.symbol.as_str()).collect();
        assert!(symbols.contains(&"DOWN-USD"));
        assert!(symbols.contains(&"UP-USD"));
        assert!(!symbols.contains(&"FLAT-USD"));
        assert!(proposals.iter().all(|p| p.side == Side::Sell));
    }

    #[test]
    fn merge_clamps_sizes_to_policy_max() {
        let proposals = vec![TradeProposal {
            symbol: "SOL-USD".into(),
            side: Side::Buy,
            size_pct: 50.0, // a runaway advisor suggestion
            reason: "x".into(),
            confidence: 0.9,
            stop_loss_pct: None,
            take_profit_pct: None,
            strategy: "advisor".into(),
            metadata: serde_json::Value::Null,
        }];
        let merged = merge_proposals(proposals, 3.0);
        assert_eq!(merged.len(), 1);
        assert!((merged[0].size_pct - 3.0).abs() < 1e-12);
    }

    #[test]
    fn merge_dedupes_by_symbol_keeping_higher_confidence() {
        let mk = |conf: f64, strategy: &str| TradeProposal {
            symbol: "SOL-USD".into(),
            side: Side::Buy,
            size_pct: 2.0,
            reason: "x".into(),
            confidence: conf,
            stop_loss_pct: None,
            take_profit_pct: None,
            strategy: strategy.into(),
            metadata: serde_json::Value::Null,
        };
        let merged = merge_proposals(vec![mk(0.6, "a"), mk(0.8, "b"), mk(0.7, "c")], 3.0);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].strategy, "b");
    }

    #[test]
    fn merge_prefers_sell_over_buy_for_same_symbol() {
        let mk = |side: Side, conf: f64| TradeProposal {
            symbol: "SOL-USD".into(),
            side,
            size_pct: 2.0,
            reason: "x".into(),
            confidence: conf,
            stop_loss_pct: None,
            take_profit_pct: None,
            strategy: "s".into(),
            metadata: serde_json::Value::Null,
        };
        let merged = merge_proposals(vec![mk(Side::Buy, 0.95), mk(Side::Sell, 0.5)], 3.0);
        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].side, Side::Sell);
    }

    #[test]
    fn merge_sorts_by_descending_confidence() {
        let mk = |symbol: &str, conf: f64| TradeProposal {
            symbol: symbol.into(),
            side: Side::Buy,
            size_pct: 2.0,
            reason: "x".into(),
            confidence: conf,
            stop_loss_pct: None,
            take_profit_pct: None,
            strategy: "s".into(),
            metadata: serde_json::Value::Null,
        };
        let merged = merge_proposals(
            vec![mk("A-USD", 0.6), mk("B-USD", 0.9), mk("C-USD", 0.7)],
            3.0,
        );
        let order: Vec<&str> = merged.iter().map(|p| p.symbol.as_str()).collect();
        assert_eq!(order, vec!["B-USD", "C-USD", "A-USD"]);
    }

    #[test]
    fn registry_builds_only_enabled_known_kinds() {
        let mut cfg = StrategiesConfig::default();
        cfg.strategies = default_entries();
        cfg.strategies[1].enabled = false;
        cfg.strategies.push(StrategyEntry {
            name: "mystery".into(),
            kind: "quantum_leap".into(),
            enabled: true,
            size_pct: 1.0,
            min_confidence: 0.5,
            max_at_risk_pct: 5.0,
            max_trades_per_cycle: 1,
            stop_loss_pct: 2.0,
            take_profit_pct: 4.0,
        });
        let strategies = build_strategies(&cfg);
        let names: Vec<&str> = strategies.iter().map(|s| s.name()).collect();
        assert_eq!(names, vec!["trigger_follow", "position_exit"]);
    }
}
