// =============================================================================
// Portfolio — NAV, exposure, and PnL accounting built fresh every cycle
// =============================================================================
//
// The portfolio view combines exchange balances (live) or simulated cash
// (paper / dry-run) with the state store's positions, priced at current
// quotes. Dust positions are excluded from exposure arithmetic but still
// listed, so a wallet full of crumbs cannot block trading.
// =============================================================================

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::debug;

use crate::coinbase::{Balance, QuoteTick};
use crate::store::{StateStore, StoredOrder};
use crate::types::ExecutionMode;

/// Quote currencies treated as cash.
const CASH_CURRENCIES: [&str; 2] = ["USD", "USDC"];

#[derive(Debug, Clone, Serialize)]
pub struct Position {
    pub symbol: String,
    pub quantity_base: f64,
    pub avg_entry_price: f64,
    pub usd_value: f64,
    pub unrealized_pnl_pct: f64,
    pub entry_time: DateTime<Utc>,
    pub strategy: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct PortfolioState {
    pub nav_usd: f64,
    pub cash_usd: f64,
    pub positions: HashMap<String, Position>,
    pub pending_orders: HashMap<String, StoredOrder>,
    /// Sum of non-dust position values as % of NAV.
    pub total_exposure_pct: f64,
    pub daily_pnl_pct: f64,
    pub weekly_pnl_pct: f64,
    pub high_water_mark: f64,
    pub drawdown_pct: f64,
    pub cycle_count: u64,
    pub last_trade_ts: Option<DateTime<Utc>>,
    pub per_symbol_last_trade: HashMap<String, DateTime<Utc>>,
    /// Dust threshold the exposure numbers were computed with.
    pub min_dust_usd: f64,
}

impl PortfolioState {
    /// Current exposure to one symbol, % of NAV. Dust counts as zero.
    pub fn exposure_pct(&self, symbol: &str) -> f64 {
        if self.nav_usd <= 0.0 {
            return 0.0;
        }
        self.positions
            .get(symbol)
            .filter(|p| p.usd_value >= self.min_dust_usd)
            .map(|p| p.usd_value / self.nav_usd * 100.0)
            .unwrap_or(0.0)
    }

    /// Exposure attributed to a strategy, % of NAV.
    pub fn strategy_exposure_pct(&self, strategy: &str) -> f64 {
        if self.nav_usd <= 0.0 {
            return 0.0;
        }
        self.positions
            .values()
            .filter(|p| p.strategy == strategy && p.usd_value >= self.min_dust_usd)
            .map(|p| p.usd_value)
            .sum::<f64>()
            / self.nav_usd
            * 100.0
    }

    /// Non-dust position count (the max_open_positions denominator).
    pub fn open_position_count(&self) -> usize {
        self.positions
            .values()
            .filter(|p| p.usd_value >= self.min_dust_usd)
            .count()
    }

    /// Whether a non-dust position exists for the symbol.
    pub fn has_position(&self, symbol: &str) -> bool {
        self.positions
            .get(symbol)
            .map(|p| p.usd_value >= self.min_dust_usd)
            .unwrap_or(false)
    }
}

/// Build the cycle's portfolio view. Mutates the store only for HWM
/// maintenance, PnL baselines, and paper-cash initialisation.
pub fn build_portfolio(
    mode: ExecutionMode,
    store: &StateStore,
    balances: &[Balance],
    quotes: &HashMap<String, QuoteTick>,
    paper_nav_default: f64,
    min_dust_usd: f64,
    now: DateTime<Utc>,
) -> PortfolioState {
    let cash_usd = match mode {
        ExecutionMode::Live => balances
            .iter()
            .filter(|b| CASH_CURRENCIES.contains(&b.currency.as_str()))
            .map(|b| b.available)
            .sum(),
        ExecutionMode::Paper | ExecutionMode::DryRun => store.update(|s| {
            *s.paper_cash_usd.get_or_insert(paper_nav_default)
        }),
    };

    let (stored_positions, pending_orders, last_trade_ts, per_symbol_last_trade, cycle_count) =
        store.with(|s| {
            (
                s.positions.clone(),
                s.pending_orders.clone(),
                s.last_trade_ts,
                s.per_symbol_last_trade.clone(),
                s.cycle_count,
            )
        });

    let mut positions = HashMap::new();
    let mut invested = 0.0;
    let mut exposed = 0.0;

    for (symbol, sp) in stored_positions {
        let price = quotes
            .get(&symbol)
            .map(|q| q.mid())
            .unwrap_or(sp.avg_entry_price);
        let usd_value = sp.quantity_base * price;
        let unrealized_pnl_pct = if sp.avg_entry_price > 0.0 {
            (price - sp.avg_entry_price) / sp.avg_entry_price * 100.0
        } else {
            0.0
        };

        invested += usd_value;
        if usd_value >= min_dust_usd {
            exposed += usd_value;
        }

        positions.insert(
            symbol.clone(),
            Position {
                symbol,
                quantity_base: sp.quantity_base,
                avg_entry_price: sp.avg_entry_price,
                usd_value,
                unrealized_pnl_pct,
                entry_time: sp.entry_time,
                strategy: sp.strategy,
            },
        );
    }

    let nav_usd = cash_usd + invested;

    // HWM only ever rises; drawdown is measured against it.
    let high_water_mark = store.update(|s| {
        if nav_usd > s.high_water_mark {
            s.high_water_mark = nav_usd;
        }
        s.high_water_mark
    });
    let drawdown_pct = if high_water_mark > 0.0 {
        ((high_water_mark - nav_usd) / high_water_mark * 100.0).max(0.0)
    } else {
        0.0
    };

    let (daily_base, weekly_base) = store.update(|s| {
        (s.daily_baseline(nav_usd, now), s.weekly_baseline(nav_usd, now))
    });
    let daily_pnl_pct = if daily_base > 0.0 {
        (nav_usd - daily_base) / daily_base * 100.0
    } else {
        0.0
    };
    let weekly_pnl_pct = if weekly_base > 0.0 {
        (nav_usd - weekly_base) / weekly_base * 100.0
    } else {
        0.0
    };

    let total_exposure_pct = if nav_usd > 0.0 {
        exposed / nav_usd * 100.0
    } else {
        0.0
    };

    debug!(
        nav = nav_usd,
        cash = cash_usd,
        exposure_pct = total_exposure_pct,
        drawdown_pct,
        positions = positions.len(),
        "portfolio built"
    );

    PortfolioState {
        nav_usd,
        cash_usd,
        positions,
        pending_orders,
        total_exposure_pct,
        daily_pnl_pct,
        weekly_pnl_pct,
        high_water_mark,
        drawdown_pct,
        cycle_count,
        last_trade_ts,
        per_symbol_last_trade,
        min_dust_usd,
    }
}
