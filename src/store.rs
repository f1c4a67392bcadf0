// =============================================================================
// State Store — durable, crash-safe engine state with a background flusher
// =============================================================================
//
// The persisted document holds everything that must survive a restart:
// positions, pending orders, cooldowns, red-flag bans, purge failures, the
// high-water mark, trade pacing counters, and the auto-tune latch.
//
// Persistence uses the atomic tmp + rename pattern. A background flusher
// writes the cached in-memory state every `persist_interval_seconds`; any
// external mutation of the underlying file while the process runs will be
// overwritten on the next flush. Mutations must go through this API or happen
// while the process is stopped.
//
// Every field carries `#[serde(default)]` so adding fields never breaks
// loading an older state file.
// =============================================================================

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info, warn};

use crate::orders::OrderStatus;
use crate::types::Side;

// ---------------------------------------------------------------------------
// Persisted records
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredPosition {
    pub symbol: String,
    pub quantity_base: f64,
    pub avg_entry_price: f64,
    pub entry_time: DateTime<Utc>,
    /// Strategy that opened (or last added to) the position.
    #[serde(default)]
    pub strategy: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredOrder {
    pub client_order_id: String,
    #[serde(default)]
    pub exchange_order_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    #[serde(default)]
    pub order_type: String,
    pub price: f64,
    pub size_base: f64,
    pub size_quote: f64,
    pub status: OrderStatus,
    pub created_at: DateTime<Utc>,
    #[serde(default)]
    pub strategy: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CooldownEntry {
    pub until: DateTime<Utc>,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BanEntry {
    pub reason: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeFailure {
    pub count: u32,
    pub last_failed_at: DateTime<Utc>,
    pub last_error: String,
}

/// A per-UTC-day counter that resets when the date rolls.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DayCount {
    pub date: String,
    pub count: u32,
}

impl DayCount {
    fn bump(&mut self, today: &str) -> u32 {
        if self.date != today {
            self.date = today.to_string();
            self.count = 0;
        }
        self.count += 1;
        self.count
    }

    fn current(&self, today: &str) -> u32 {
        if self.date == today {
            self.count
        } else {
            0
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NavBaseline {
    pub key: String,
    pub nav: f64,
}

// ---------------------------------------------------------------------------
// The persisted document
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PersistentState {
    #[serde(default)]
    pub positions: HashMap<String, StoredPosition>,

    /// Pending (non-terminal) orders by client_order_id. Authoritative for
    /// the pending-buy dedupe check; never rebuilt from exchange reads.
    #[serde(default)]
    pub pending_orders: HashMap<String, StoredOrder>,

    #[serde(default)]
    pub cooldowns: HashMap<String, CooldownEntry>,

    #[serde(default)]
    pub red_flag_bans: HashMap<String, BanEntry>,

    #[serde(default)]
    pub purge_failures: HashMap<String, PurgeFailure>,

    #[serde(default)]
    pub high_water_mark: f64,

    #[serde(default)]
    pub zero_trigger_cycles: u32,

    #[serde(default)]
    pub auto_tune_applied: bool,

    #[serde(default)]
    pub kill_switch_active: bool,

    #[serde(default)]
    pub last_trade_ts: Option<DateTime<Utc>>,

    #[serde(default)]
    pub per_symbol_last_trade: HashMap<String, DateTime<Utc>>,

    /// Rolling one-hour window of trade timestamps.
    #[serde(default)]
    pub hourly_trades: Vec<DateTime<Utc>>,

    #[serde(default)]
    pub daily_trades: DayCount,

    /// Pyramiding adds per asset per UTC day.
    #[serde(default)]
    pub adds_today: HashMap<String, DayCount>,

    /// Trades per strategy per UTC day.
    #[serde(default)]
    pub strategy_trades: HashMap<String, DayCount>,

    /// Order-rejection timestamps per symbol (burst alerting).
    #[serde(default)]
    pub rejection_history: HashMap<String, Vec<DateTime<Utc>>>,

    /// Cycle-level error timestamps (exception-burst alerting).
    #[serde(default)]
    pub cycle_errors: Vec<DateTime<Utc>>,

    #[serde(default)]
    pub realized_pnl_by_day: HashMap<String, f64>,

    #[serde(default)]
    pub nav_baseline_daily: Option<NavBaseline>,

    #[serde(default)]
    pub nav_baseline_weekly: Option<NavBaseline>,

    /// Simulated cash for paper / dry-run portfolios.
    #[serde(default)]
    pub paper_cash_usd: Option<f64>,

    #[serde(default)]
    pub trim_failures: u32,

    #[serde(default)]
    pub cycle_count: u64,
}

fn day_key(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m-%d").to_string()
}

fn week_key(ts: DateTime<Utc>) -> String {
    let iso = ts.iso_week();
    format!("{}-W{:02}", iso.year(), iso.week())
}

impl PersistentState {
    // -- trade pacing ---------------------------------------------------------

    /// Record an executed trade for pacing, caps, and pyramiding bookkeeping.
    pub fn record_trade(&mut self, symbol: &str, strategy: &str, is_add: bool, now: DateTime<Utc>) {
        let today = day_key(now);
        self.last_trade_ts = Some(now);
        self.per_symbol_last_trade.insert(symbol.to_string(), now);
        self.hourly_trades.push(now);
        self.prune_hourly(now);
        self.daily_trades.bump(&today);
        self.strategy_trades
            .entry(strategy.to_string())
            .or_default()
            .bump(&today);
        if is_add {
            self.adds_today
                .entry(symbol.to_string())
                .or_default()
                .bump(&today);
        }
    }

    pub fn prune_hourly(&mut self, now: DateTime<Utc>) {
        let cutoff = now - chrono::Duration::hours(1);
        self.hourly_trades.retain(|t| *t > cutoff);
    }

    pub fn trades_last_hour(&self, now: DateTime<Utc>) -> u32 {
        let cutoff = now - chrono::Duration::hours(1);
        self.hourly_trades.iter().filter(|t| **t > cutoff).count() as u32
    }

    pub fn trades_today(&self, now: DateTime<Utc>) -> u32 {
        self.daily_trades.current(&day_key(now))
    }

    pub fn strategy_trades_today(&self, strategy: &str, now: DateTime<Utc>) -> u32 {
        self.strategy_trades
            .get(strategy)
            .map(|d| d.current(&day_key(now)))
            .unwrap_or(0)
    }

    pub fn adds_for(&self, symbol: &str, now: DateTime<Utc>) -> u32 {
        self.adds_today
            .get(symbol)
            .map(|d| d.current(&day_key(now)))
            .unwrap_or(0)
    }

    // -- cooldowns ------------------------------------------------------------

    pub fn set_cooldown(&mut self, symbol: &str, until: DateTime<Utc>, reason: &str) {
        self.cooldowns.insert(
            symbol.to_string(),
            CooldownEntry { until, reason: reason.to_string() },
        );
    }

    /// Active cooldown for `symbol`, expiring stale entries on read.
    pub fn active_cooldown(&mut self, symbol: &str, now: DateTime<Utc>) -> Option<CooldownEntry> {
        if let Some(entry) = self.cooldowns.get(symbol) {
            if entry.until > now {
                return Some(entry.clone());
            }
            self.cooldowns.remove(symbol);
        }
        None
    }

    // -- red-flag bans --------------------------------------------------------

    pub fn flag_ban(&mut self, symbol: &str, hours: u64, reason: &str, now: DateTime<Utc>) {
        self.red_flag_bans.insert(
            symbol.to_string(),
            BanEntry {
                reason: reason.to_string(),
                expires_at: now + chrono::Duration::hours(hours as i64),
            },
        );
    }

    /// Currently-banned symbols; expired bans are removed on read.
    pub fn active_bans(&mut self, now: DateTime<Utc>) -> HashMap<String, BanEntry> {
        self.red_flag_bans.retain(|_, b| b.expires_at > now);
        self.red_flag_bans.clone()
    }

    // -- purge backoff --------------------------------------------------------

    pub fn record_purge_failure(&mut self, symbol: &str, error: &str, now: DateTime<Utc>) -> u32 {
        let entry = self
            .purge_failures
            .entry(symbol.to_string())
            .or_insert(PurgeFailure {
                count: 0,
                last_failed_at: now,
                last_error: String::new(),
            });
        entry.count += 1;
        entry.last_failed_at = now;
        entry.last_error = error.to_string();
        entry.count
    }

    pub fn clear_purge_failures(&mut self, symbol: &str) {
        self.purge_failures.remove(symbol);
    }

    /// Exponential purge backoff: 3 failures -> 1 h, 4 -> 2 h, 5+ -> 4 h cap.
    /// Returns the instant before which the symbol must not be retried.
    pub fn purge_backoff_until(&self, symbol: &str) -> Option<DateTime<Utc>> {
        let entry = self.purge_failures.get(symbol)?;
        let hours = match entry.count {
            0..=2 => return None,
            3 => 1,
            4 => 2,
            _ => 4,
        };
        Some(entry.last_failed_at + chrono::Duration::hours(hours))
    }

    // -- order close ----------------------------------------------------------

    /// Close a pending order. Idempotent: closing an already-closed order is
    /// a no-op and returns false.
    pub fn close_order(&mut self, client_order_id: &str, status: OrderStatus) -> bool {
        match self.pending_orders.remove(client_order_id) {
            Some(order) => {
                debug!(
                    client_order_id,
                    symbol = %order.symbol,
                    status = %status,
                    "order closed in state store"
                );
                true
            }
            None => false,
        }
    }

    /// Whether an unfilled BUY already exists for `symbol`.
    pub fn has_pending_buy(&self, symbol: &str) -> bool {
        self.pending_orders
            .values()
            .any(|o| o.symbol == symbol && o.side == Side::Buy && !o.status.is_terminal())
    }

    // -- burst tracking -------------------------------------------------------

    /// Record an order rejection; returns the count within the last 10 min.
    pub fn record_rejection(&mut self, symbol: &str, now: DateTime<Utc>) -> usize {
        let cutoff = now - chrono::Duration::minutes(10);
        let history = self.rejection_history.entry(symbol.to_string()).or_default();
        history.push(now);
        history.retain(|t| *t > cutoff);
        history.len()
    }

    /// Record a cycle error; returns the count within the last 5 min.
    pub fn record_cycle_error(&mut self, now: DateTime<Utc>) -> usize {
        let cutoff = now - chrono::Duration::minutes(5);
        self.cycle_errors.push(now);
        self.cycle_errors.retain(|t| *t > cutoff);
        self.cycle_errors.len()
    }

    // -- PnL baselines --------------------------------------------------------

    /// Daily baseline NAV, set on the first observation of each UTC day.
    pub fn daily_baseline(&mut self, nav: f64, now: DateTime<Utc>) -> f64 {
        let key = day_key(now);
        match &self.nav_baseline_daily {
            Some(b) if b.key == key => b.nav,
            _ => {
                self.nav_baseline_daily = Some(NavBaseline { key, nav });
                nav
            }
        }
    }

    /// Weekly baseline NAV, keyed by ISO week.
    pub fn weekly_baseline(&mut self, nav: f64, now: DateTime<Utc>) -> f64 {
        let key = week_key(now);
        match &self.nav_baseline_weekly {
            Some(b) if b.key == key => b.nav,
            _ => {
                self.nav_baseline_weekly = Some(NavBaseline { key, nav });
                nav
            }
        }
    }

    pub fn record_realized_pnl(&mut self, pnl: f64, now: DateTime<Utc>) {
        *self.realized_pnl_by_day.entry(day_key(now)).or_insert(0.0) += pnl;
    }
}

// ---------------------------------------------------------------------------
// The store
// ---------------------------------------------------------------------------

pub struct StateStore {
    path: PathBuf,
    cache: RwLock<PersistentState>,
    dirty: AtomicBool,
}

impl StateStore {
    /// Load state from `path`, or start from defaults when the file does not
    /// exist yet. A malformed file is a hard error: silently discarding
    /// positions is worse than refusing to start.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();

        let state = if path.exists() {
            let content = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read state from {}", path.display()))?;
            let state: PersistentState = serde_json::from_str(&content)
                .with_context(|| format!("failed to parse state from {}", path.display()))?;
            info!(
                path = %path.display(),
                positions = state.positions.len(),
                pending_orders = state.pending_orders.len(),
                hwm = state.high_water_mark,
                "state loaded"
            );
            state
        } else {
            info!(path = %path.display(), "no state file, starting fresh");
            PersistentState::default()
        };

        Ok(Self {
            path,
            cache: RwLock::new(state),
            dirty: AtomicBool::new(false),
        })
    }

    /// Read access to the cached state.
    pub fn with<R>(&self, f: impl FnOnce(&PersistentState) -> R) -> R {
        f(&self.cache.read())
    }

    /// Mutate the cached state and mark it dirty for the next flush.
    pub fn update<R>(&self, f: impl FnOnce(&mut PersistentState) -> R) -> R {
        let result = f(&mut self.cache.write());
        self.dirty.store(true, Ordering::Release);
        result
    }

    /// Persist the cached state with an atomic tmp + rename write.
    pub fn flush(&self) -> Result<()> {
        let content = {
            let state = self.cache.read();
            serde_json::to_string_pretty(&*state).context("failed to serialise state")?
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create {}", parent.display()))?;
        }

        let tmp_path = self.path.with_extension("json.tmp");
        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp state to {}", tmp_path.display()))?;
        std::fs::rename(&tmp_path, &self.path)
            .with_context(|| format!("failed to rename tmp state to {}", self.path.display()))?;

        self.dirty.store(false, Ordering::Release);
        debug!(path = %self.path.display(), "state flushed (atomic)");
        Ok(())
    }

    /// Spawn the background flusher. It persists dirty state every
    /// `interval` and keeps running until the task is aborted.
    pub fn spawn_flusher(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                ticker.tick().await;
                if store.dirty.load(Ordering::Acquire) {
                    if let Err(e) = store.flush() {
                        error!(error = %e, "background state flush failed");
                    }
                } else {
                    debug!("state clean, skipping flush");
                }
            }
        })
    }

    /// Idempotent order close, delegating to the cached state.
    pub fn close_order(&self, client_order_id: &str, status: OrderStatus) -> bool {
        let closed = self.update(|s| s.close_order(client_order_id, status));
        if !closed {
            warn!(client_order_id, "close_order on unknown or already-closed order (no-op)");
        }
        closed
    }
}

impl std::fmt::Debug for StateStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StateStore")
            .field("path", &self.path)
            .field("dirty", &self.dirty.load(Ordering::Relaxed))
            .finish()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    fn tmp_path(tag: &str) -> PathBuf {
        std::env::temp_dir().join(format!(
            "meridian-store-{tag}-{}.json",
            uuid::Uuid::new_v4()
        ))
    }

    fn ts(s: &str) -> DateTime<Utc> {
        DateTime::parse_from_rfc3339(s).unwrap().with_timezone(&Utc)
    }

    #[test]
    fn save_load_roundtrip_is_identity() {
        let path = tmp_path("roundtrip");
        let store = StateStore::load(&path).unwrap();
        store.update(|s| {
            s.high_water_mark = 12_345.0;
            s.zero_trigger_cycles = 7;
            s.auto_tune_applied = true;
            s.positions.insert(
                "SOL-USD".into(),
                StoredPosition {
                    symbol: "SOL-USD".into(),
                    quantity_base: 0.199,
                    avg_entry_price: 100.10,
                    entry_time: ts("2025-06-01T00:00:00Z"),
                    strategy: "trigger_follow".into(),
                },
            );
        });
        store.flush().unwrap();

        let reloaded = StateStore::load(&path).unwrap();
        reloaded.with(|s| {
            assert_eq!(s.high_water_mark, 12_345.0);
            assert_eq!(s.zero_trigger_cycles, 7);
            assert!(s.auto_tune_applied);
            let pos = &s.positions["SOL-USD"];
            assert_eq!(pos.quantity_base, 0.199);
            assert_eq!(pos.avg_entry_price, 100.10);
        });
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn missing_fields_get_defaults() {
        let state: PersistentState = serde_json::from_str("{}").unwrap();
        assert_eq!(state.high_water_mark, 0.0);
        assert!(state.positions.is_empty());
        assert!(!state.kill_switch_active);
    }

    #[test]
    fn close_order_is_idempotent() {
        let path = tmp_path("close");
        let store = StateStore::load(&path).unwrap();
        store.update(|s| {
            s.pending_orders.insert(
                "c1".into(),
                StoredOrder {
                    client_order_id: "c1".into(),
                    exchange_order_id: Some("x1".into()),
                    symbol: "BTC-USD".into(),
                    side: Side::Buy,
                    order_type: "post_only_limit".into(),
                    price: 50_000.0,
                    size_base: 0.001,
                    size_quote: 50.0,
                    status: OrderStatus::Open,
                    created_at: Utc::now(),
                    strategy: "trigger_follow".into(),
                },
            );
        });

        assert!(store.close_order("c1", OrderStatus::Filled));
        let after_first = store.with(|s| s.clone());
        assert!(!store.close_order("c1", OrderStatus::Filled));
        let after_second = store.with(|s| s.clone());
        assert_eq!(
            after_first.pending_orders.len(),
            after_second.pending_orders.len()
        );
        std::fs::remove_file(&path).ok();
    }

    #[test]
    fn pending_buy_detection() {
        let mut state = PersistentState::default();
        assert!(!state.has_pending_buy("ETH-USD"));
        state.pending_orders.insert(
            "c2".into(),
            StoredOrder {
                client_order_id: "c2".into(),
                exchange_order_id: None,
                symbol: "ETH-USD".into(),
                side: Side::Buy,
                order_type: "post_only_limit".into(),
                price: 3000.0,
                size_base: 0.01,
                size_quote: 30.0,
                status: OrderStatus::Open,
                created_at: Utc::now(),
                strategy: "x".into(),
            },
        );
        assert!(state.has_pending_buy("ETH-USD"));
        assert!(!state.has_pending_buy("BTC-USD"));
    }

    #[test]
    fn cooldowns_expire_on_read() {
        let mut state = PersistentState::default();
        let now = ts("2025-06-01T12:00:00Z");
        state.set_cooldown("DOGE-USD", now + chrono::Duration::minutes(30), "loss");

        assert!(state.active_cooldown("DOGE-USD", now).is_some());
        let later = now + chrono::Duration::minutes(31);
        assert!(state.active_cooldown("DOGE-USD", later).is_none());
        assert!(state.cooldowns.is_empty());
    }

    #[test]
    fn bans_expire_after_ttl() {
        let mut state = PersistentState::default();
        let now = ts("2025-06-01T00:00:00Z");
        state.flag_ban("BONK-USD", 24, "rug_risk", now);

        let during = now + chrono::Duration::hours(23);
        assert!(state.active_bans(during).contains_key("BONK-USD"));

        let after = now + chrono::Duration::hours(25);
        assert!(!state.active_bans(after).contains_key("BONK-USD"));
    }

    #[test]
    fn purge_backoff_escalates() {
        let mut state = PersistentState::default();
        let now = ts("2025-06-01T00:00:00Z");

        state.record_purge_failure("BONK-USD", "INVALID_ORDER_CONFIGURATION", now);
        state.record_purge_failure("BONK-USD", "INVALID_ORDER_CONFIGURATION", now);
        assert!(state.purge_backoff_until("BONK-USD").is_none());

        state.record_purge_failure("BONK-USD", "INVALID_ORDER_CONFIGURATION", now);
        assert_eq!(
            state.purge_backoff_until("BONK-USD").unwrap(),
            now + chrono::Duration::hours(1)
        );

        state.record_purge_failure("BONK-USD", "INVALID_ORDER_CONFIGURATION", now);
        assert_eq!(
            state.purge_backoff_until("BONK-USD").unwrap(),
            now + chrono::Duration::hours(2)
        );

        state.record_purge_failure("BONK-USD", "INVALID_ORDER_CONFIGURATION", now);
        state.record_purge_failure("BONK-USD", "INVALID_ORDER_CONFIGURATION", now);
        assert_eq!(
            state.purge_backoff_until("BONK-USD").unwrap(),
            now + chrono::Duration::hours(4)
        );

        state.clear_purge_failures("BONK-USD");
        assert!(state.purge_backoff_until("BONK-USD").is_none());
    }

    #[test]
    fn trade_pacing_counters() {
        let mut state = PersistentState::default();
        let t0 = ts("2025-06-01T10:00:00Z");
        state.record_trade("SOL-USD", "trigger_follow", false, t0);
        state.record_trade("ETH-USD", "trigger_follow", false, t0 + chrono::Duration::minutes(5));

        assert_eq!(state.trades_last_hour(t0 + chrono::Duration::minutes(10)), 2);
        assert_eq!(state.trades_today(t0), 2);
        assert_eq!(
            state.strategy_trades_today("trigger_follow", t0),
            2
        );

        // The hourly window rolls off.
        assert_eq!(state.trades_last_hour(t0 + chrono::Duration::minutes(70)), 1);

        // The daily counter resets on date rollover.
        let tomorrow = ts("2025-06-02T00:01:00Z");
        assert_eq!(state.trades_today(tomorrow), 0);
    }

    #[test]
    fn rejection_burst_window() {
        let mut state = PersistentState::default();
        let t0 = ts("2025-06-01T10:00:00Z");
        assert_eq!(state.record_rejection("ETH-USD", t0), 1);
        assert_eq!(
            state.record_rejection("ETH-USD", t0 + chrono::Duration::minutes(2)),
            2
        );
        assert_eq!(
            state.record_rejection("ETH-USD", t0 + chrono::Duration::minutes(4)),
            3
        );
        // Outside the 10-minute window the old entries are pruned.
        assert_eq!(
            state.record_rejection("ETH-USD", t0 + chrono::Duration::minutes(20)),
            1
        );
    }

    #[test]
    fn nav_baselines_pin_per_period() {
        let mut state = PersistentState::default();
        let monday = ts("2025-06-02T08:00:00Z");
        assert_eq!(state.daily_baseline(1000.0, monday), 1000.0);
        // Later the same day the original baseline holds.
        assert_eq!(
            state.daily_baseline(900.0, monday + chrono::Duration::hours(4)),
            1000.0
        );
        // Next day resets.
        assert_eq!(
            state.daily_baseline(900.0, monday + chrono::Duration::days(1)),
            900.0
        );

        assert_eq!(state.weekly_baseline(1000.0, monday), 1000.0);
        let thursday = monday + chrono::Duration::days(3);
        assert_eq!(state.weekly_baseline(700.0, thursday), 1000.0);
        let next_monday = monday + chrono::Duration::days(7);
        assert_eq!(state.weekly_baseline(700.0, next_monday), 700.0);
    }
}
