// =============================================================================
// Universe Manager — tiered eligibility with hysteresis and red-flag bans
// =============================================================================
//
// Eligibility pipeline per cycle:
//   1. Configured tier lists (a symbol in several lists keeps its best tier).
//   2. Drop never_trade and excluded_symbols.
//   3. Drop red-flag-banned symbols (bans auto-expire on read).
//   4. Fetch quote + top-of-book depth (bounded parallelism, 5 workers).
//   5. Tier gates: spread, depth, 24h volume (loosened in chop).
//   6. Crash regime empties the universe entirely.
//   7. force_eligible_symbols bypass the liquidity gates.
//   8. Promotion/demotion hysteresis over consecutive cycles.
//
// Snapshots are cached for the configured TTL and invalidated on regime
// change.
// =============================================================================

use std::collections::{HashMap, HashSet};
use std::time::Instant;

use anyhow::Result;
use chrono::{DateTime, Utc};
use futures_util::{stream, StreamExt};
use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::alerts::{AlertPipeline, AlertSeverity};
use crate::coinbase::{ExchangeApi, Product};
use crate::config::UniverseConfig;
use crate::store::StateStore;
use crate::types::{Regime, Tier};

const QUOTE_FETCH_WORKERS: usize = 5;
const DEPTH_LEVELS: usize = 10;

// ---------------------------------------------------------------------------
// Snapshot types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize)]
pub struct Asset {
    pub symbol: String,
    pub tier: Tier,
    pub volume_24h_usd: f64,
    pub spread_bps: f64,
    pub depth_usd: f64,
    pub eligible: bool,
    pub ineligible_reason: Option<String>,
}

/// Immutable per-cycle view of the tradable universe.
#[derive(Debug, Clone, Serialize)]
pub struct UniverseSnapshot {
    pub timestamp: DateTime<Utc>,
    pub regime: Regime,
    /// Eligible symbols per tier; a symbol appears in at most one tier.
    pub tiers: [Vec<String>; 3],
    pub assets: HashMap<String, Asset>,
    /// Excluded symbols with the reason they were dropped.
    pub excluded: HashMap<String, String>,
}

impl UniverseSnapshot {
    pub fn empty(regime: Regime) -> Self {
        Self {
            timestamp: Utc::now(),
            regime,
            tiers: [Vec::new(), Vec::new(), Vec::new()],
            assets: HashMap::new(),
            excluded: HashMap::new(),
        }
    }

    /// Eligible symbols, best tier first.
    pub fn eligible_symbols(&self) -> Vec<String> {
        self.tiers.iter().flatten().cloned().collect()
    }

    pub fn eligible_count(&self) -> usize {
        self.tiers.iter().map(|t| t.len()).sum()
    }

    pub fn is_eligible(&self, symbol: &str) -> bool {
        self.tiers.iter().any(|t| t.iter().any(|s| s == symbol))
    }

    pub fn tier_of(&self, symbol: &str) -> Option<Tier> {
        for (i, tier) in self.tiers.iter().enumerate() {
            if tier.iter().any(|s| s == symbol) {
                return Some(Tier::all()[i]);
            }
        }
        None
    }
}

/// Raw liquidity metrics for one symbol, before gating.
#[derive(Debug, Clone, Default)]
pub struct SymbolMetrics {
    pub spread_bps: f64,
    pub depth_usd: f64,
    pub volume_24h_usd: f64,
    pub fetched: bool,
}

// ---------------------------------------------------------------------------
// Hysteresis
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
struct GraceState {
    eligible_now: bool,
    consecutive_pass: u32,
    consecutive_fail: u32,
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

struct CachedSnapshot {
    snapshot: UniverseSnapshot,
    built_at: Instant,
}

pub struct UniverseManager {
    cfg: UniverseConfig,
    grace: Mutex<HashMap<String, GraceState>>,
    cache: Mutex<Option<CachedSnapshot>>,
}

impl UniverseManager {
    pub fn new(cfg: UniverseConfig) -> Self {
        Self {
            cfg,
            grace: Mutex::new(HashMap::new()),
            cache: Mutex::new(None),
        }
    }

    /// Drop the cached snapshot (called on regime change).
    pub fn invalidate(&self) {
        *self.cache.lock() = None;
    }

    /// Red-flag a symbol: banned from the universe for `hours` (default TTL
    /// when zero), effective from the next build.
    pub fn flag(&self, store: &StateStore, symbol: &str, hours: u64, reason: &str) {
        let hours = if hours == 0 {
            self.cfg.temporary_ban_hours
        } else {
            hours
        };
        store.update(|s| s.flag_ban(symbol, hours, reason, Utc::now()));
        self.invalidate();
        warn!(symbol, hours, reason, "symbol red-flagged");
    }

    /// Tier assignment from config: best tier wins, never_trade and
    /// excluded_symbols removed.
    fn tier_assignments(&self) -> Vec<(String, Tier)> {
        let never: HashSet<&String> = self
            .cfg
            .never_trade
            .iter()
            .chain(self.cfg.excluded_symbols.iter())
            .collect();

        let mut seen = HashSet::new();
        let mut out = Vec::new();
        for (tier, list) in [
            (Tier::One, &self.cfg.tier1),
            (Tier::Two, &self.cfg.tier2),
            (Tier::Three, &self.cfg.tier3),
        ] {
            for symbol in list {
                if never.contains(symbol) || !seen.insert(symbol.clone()) {
                    continue;
                }
                out.push((symbol.clone(), tier));
            }
        }
        out
    }

    /// Build (or return the cached) snapshot for the current cycle.
    pub async fn build(
        &self,
        exchange: &dyn ExchangeApi,
        products: &HashMap<String, Product>,
        store: &StateStore,
        alerts: &AlertPipeline,
        regime: Regime,
    ) -> Result<UniverseSnapshot> {
        {
            let cache = self.cache.lock();
            if let Some(cached) = cache.as_ref() {
                let fresh = cached.built_at.elapsed().as_secs() < self.cfg.snapshot_ttl_seconds;
                if fresh && cached.snapshot.regime == regime {
                    debug!("universe snapshot served from cache");
                    return Ok(cached.snapshot.clone());
                }
            }
        }

        let now = Utc::now();
        let candidates = self.tier_assignments();
        let bans = store.update(|s| s.active_bans(now));

        // Crash regime: no trading, the universe is emptied outright.
        if regime == Regime::Crash {
            let mut snapshot = UniverseSnapshot::empty(regime);
            for (symbol, _) in &candidates {
                snapshot
                    .excluded
                    .insert(symbol.clone(), "crash_regime".to_string());
            }
            warn!("crash regime: universe emptied");
            self.check_min_eligible(&snapshot, alerts);
            self.store_cache(snapshot.clone());
            return Ok(snapshot);
        }

        // Fetch liquidity metrics with bounded parallelism.
        let fetch_list: Vec<(String, Tier)> = candidates
            .iter()
            .filter(|(s, _)| !bans.contains_key(s))
            .cloned()
            .collect();

        let metrics: HashMap<String, SymbolMetrics> = stream::iter(fetch_list.iter().map(
            |(symbol, _)| async move {
                let quote = exchange.get_quote(symbol).await;
                let book = exchange.get_orderbook(symbol).await;
                let metrics = match (quote, book) {
                    (Ok(q), Ok(b)) => SymbolMetrics {
                        spread_bps: q.spread_bps(),
                        depth_usd: b.top_depth_usd(DEPTH_LEVELS),
                        volume_24h_usd: 0.0,
                        fetched: true,
                    },
                    (q, b) => {
                        debug!(
                            symbol = %symbol,
                            quote_ok = q.is_ok(),
                            book_ok = b.is_ok(),
                            "liquidity fetch incomplete"
                        );
                        SymbolMetrics::default()
                    }
                };
                (symbol.clone(), metrics)
            },
        ))
        .buffer_unordered(QUOTE_FETCH_WORKERS)
        .collect::<Vec<_>>()
        .await
        .into_iter()
        .map(|(symbol, mut m)| {
            m.volume_24h_usd = products
                .get(&symbol)
                .map(|p| p.volume_24h_usd)
                .unwrap_or(0.0);
            (symbol, m)
        })
        .collect();

        let snapshot = self.assemble(now, regime, &candidates, &bans_to_reasons(&bans), &metrics);
        self.check_min_eligible(&snapshot, alerts);

        info!(
            eligible = snapshot.eligible_count(),
            excluded = snapshot.excluded.len(),
            regime = %regime,
            "universe built"
        );

        self.store_cache(snapshot.clone());
        Ok(snapshot)
    }

    /// Pure assembly over pre-fetched metrics; hysteresis state mutates here.
    pub fn assemble(
        &self,
        now: DateTime<Utc>,
        regime: Regime,
        candidates: &[(String, Tier)],
        banned: &HashMap<String, String>,
        metrics: &HashMap<String, SymbolMetrics>,
    ) -> UniverseSnapshot {
        let forced: HashSet<&String> = self.cfg.force_eligible_symbols.iter().collect();
        let loosen = if regime == Regime::Chop {
            self.cfg.chop_threshold_multiplier
        } else {
            1.0
        };

        let mut snapshot = UniverseSnapshot::empty(regime);
        snapshot.timestamp = now;
        let mut grace = self.grace.lock();

        for (symbol, tier) in candidates {
            if let Some(reason) = banned.get(symbol) {
                snapshot
                    .excluded
                    .insert(symbol.clone(), format!("red_flag_ban: {reason}"));
                continue;
            }

            let m = metrics.get(symbol).cloned().unwrap_or_default();
            let idx = tier.index();

            let raw = if forced.contains(symbol) {
                Ok(())
            } else if !m.fetched {
                Err("no_quote".to_string())
            } else {
                self.gate(&m, idx, loosen)
            };

            // Hysteresis: promotion and demotion both need consecutive
            // confirming cycles; the first sighting takes its raw verdict.
            let state = grace.entry(symbol.clone()).or_insert_with(|| GraceState {
                eligible_now: raw.is_ok(),
                consecutive_pass: 0,
                consecutive_fail: 0,
            });
            match &raw {
                Ok(()) => {
                    state.consecutive_pass += 1;
                    state.consecutive_fail = 0;
                    if !state.eligible_now
                        && state.consecutive_pass >= self.cfg.eligible_grace_cycles
                    {
                        state.eligible_now = true;
                        debug!(symbol = %symbol, "symbol promoted to eligible");
                    }
                }
                Err(reason) => {
                    state.consecutive_fail += 1;
                    state.consecutive_pass = 0;
                    if state.eligible_now
                        && state.consecutive_fail >= self.cfg.ineligible_grace_cycles
                    {
                        state.eligible_now = false;
                        debug!(symbol = %symbol, reason = %reason, "symbol demoted to ineligible");
                    }
                }
            }

            let eligible = state.eligible_now;
            let reason = raw.err();

            if eligible {
                snapshot.tiers[idx].push(symbol.clone());
            } else {
                snapshot.excluded.insert(
                    symbol.clone(),
                    reason.clone().unwrap_or_else(|| "grace_pending".to_string()),
                );
            }

            snapshot.assets.insert(
                symbol.clone(),
                Asset {
                    symbol: symbol.clone(),
                    tier: *tier,
                    volume_24h_usd: m.volume_24h_usd,
                    spread_bps: m.spread_bps,
                    depth_usd: m.depth_usd,
                    eligible,
                    ineligible_reason: if eligible { None } else { reason },
                },
            );
        }

        snapshot
    }

    /// Tier-specific liquidity gate, with chop loosening applied.
    fn gate(&self, m: &SymbolMetrics, tier_idx: usize, loosen: f64) -> Result<(), String> {
        let max_spread = self.cfg.tier_max_spread_bps[tier_idx] * loosen;
        if m.spread_bps > max_spread {
            return Err(format!(
                "spread {:.1}bps > {:.1}bps",
                m.spread_bps, max_spread
            ));
        }

        let depth_floor = self.cfg.tier_min_depth_usd[tier_idx] / loosen;
        let required_depth = depth_floor.max(
            self.cfg.required_depth_multiplier * self.cfg.target_order_notional_usd,
        );
        if m.depth_usd < required_depth {
            return Err(format!(
                "depth ${:.0} < ${:.0}",
                m.depth_usd, required_depth
            ));
        }

        let min_volume = self.cfg.tier_min_volume_usd[tier_idx] / loosen;
        if m.volume_24h_usd < min_volume {
            return Err(format!(
                "volume ${:.0} < ${:.0}",
                m.volume_24h_usd, min_volume
            ));
        }

        Ok(())
    }

    fn check_min_eligible(&self, snapshot: &UniverseSnapshot, alerts: &AlertPipeline) {
        let count = snapshot.eligible_count();
        if (count as u32) < self.cfg.min_eligible_assets {
            alerts.notify(
                AlertSeverity::Critical,
                "empty_universe",
                &format!(
                    "only {count} eligible assets (minimum {})",
                    self.cfg.min_eligible_assets
                ),
                serde_json::json!({ "eligible": count, "regime": snapshot.regime.to_string() }),
            );
        }
    }

    fn store_cache(&self, snapshot: UniverseSnapshot) {
        *self.cache.lock() = Some(CachedSnapshot {
            snapshot,
            built_at: Instant::now(),
        });
    }
}

fn bans_to_reasons(bans: &HashMap<String, crate::store::BanEntry>) -> HashMap<String, String> {
    bans.iter()
        .map(|(k, v)| (k.clone(), v.reason.clone()))
        .collect()
}

impl std::fmt::Debug for UniverseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("UniverseManager")
            .field("tracked", &self.grace.lock().len())
            .finish()
    }
}
