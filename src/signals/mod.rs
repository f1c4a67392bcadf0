// =============================================================================
// Signal Engine — regime-aware trigger detection with outlier rejection
// =============================================================================
//
// A registry of Signal implementations scans every eligible symbol each
// cycle. The outlier guard runs before any signal decides; a rejected candle
// skips the whole asset for the cycle. Each signal declares the regimes it
// may fire in, and the manager applies a regime-specific confidence
// adjustment to whatever fires.
//
// Auto-tune: after N consecutive zero-trigger cycles the chop thresholds are
// loosened once by the configured deltas, never past the hard floors. The
// `auto_tune_applied` latch in the state store survives restarts and
// prevents re-application.
// =============================================================================

pub mod mean_reversion;
pub mod momentum;
pub mod outlier;
pub mod price_move;

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::coinbase::Candle;
use crate::config::SignalsConfig;
use crate::store::StateStore;
use crate::types::{Regime, Side};
use crate::universe::UniverseSnapshot;

use mean_reversion::MeanReversionSignal;
use momentum::MomentumSignal;
use outlier::OutlierGuard;
use price_move::PriceMoveSignal;

// ---------------------------------------------------------------------------
// Trigger types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    PriceMove,
    VolumeSpike,
    Momentum,
    MeanReversion,
}

impl std::fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::PriceMove => write!(f, "price_move"),
            Self::VolumeSpike => write!(f, "volume_spike"),
            Self::Momentum => write!(f, "momentum"),
            Self::MeanReversion => write!(f, "mean_reversion"),
        }
    }
}

/// Immutable after creation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TriggerSignal {
    pub symbol: String,
    pub kind: TriggerKind,
    /// Normalized [0, 1].
    pub strength: f64,
    /// Normalized [0, 1].
    pub confidence: f64,
    pub direction: Side,
    /// Recent return volatility, percent.
    pub volatility: f64,
    pub timestamp: DateTime<Utc>,
}

// ---------------------------------------------------------------------------
// The Signal seam
// ---------------------------------------------------------------------------

pub trait Signal: Send + Sync {
    fn name(&self) -> &'static str;

    /// Regimes in which this signal is allowed to fire.
    fn allowed_regimes(&self) -> &'static [Regime];

    /// `candles` are 15-minute bars, oldest first.
    fn scan(&self, symbol: &str, candles: &[Candle], regime: Regime) -> Option<TriggerSignal>;
}

// ---------------------------------------------------------------------------
// Shared helpers
// ---------------------------------------------------------------------------

/// Last bar volume over the average of the preceding `window` bars.
pub(crate) fn volume_ratio(candles: &[Candle], window: usize) -> Option<f64> {
    if candles.len() < window + 1 {
        return None;
    }
    let last = candles[candles.len() - 1].volume;
    let avg = candles[candles.len() - 1 - window..candles.len() - 1]
        .iter()
        .map(|c| c.volume)
        .sum::<f64>()
        / window as f64;
    if avg <= 0.0 {
        return None;
    }
    Some(last / avg)
}

/// Standard deviation of bar-to-bar returns over the trailing window, pct.
pub(crate) fn returns_stddev_pct(candles: &[Candle], window: usize) -> f64 {
    if candles.len() < window + 1 {
        return 0.0;
    }
    let tail = &candles[candles.len() - window - 1..];
    let returns: Vec<f64> = tail
        .windows(2)
        .filter(|w| w[0].close > 0.0)
        .map(|w| (w[1].close - w[0].close) / w[0].close)
        .collect();
    if returns.is_empty() {
        return 0.0;
    }
    let mean = returns.iter().sum::<f64>() / returns.len() as f64;
    let var = returns.iter().map(|r| (r - mean).powi(2)).sum::<f64>() / returns.len() as f64;
    var.sqrt() * 100.0
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

pub struct SignalManager {
    cfg: SignalsConfig,
    registry: Vec<Box<dyn Signal>>,
    guard: OutlierGuard,
}

impl SignalManager {
    pub fn new(cfg: SignalsConfig) -> Self {
        let mut manager = Self {
            guard: OutlierGuard::new(cfg.outlier.clone()),
            registry: Vec::new(),
            cfg,
        };
        manager.rebuild();
        manager
    }

    /// Re-apply the auto-tune loosening after a restart when the latch is
    /// already set, so tuned thresholds survive the process.
    pub fn restore_auto_tune(&mut self, store: &StateStore) {
        if store.with(|s| s.auto_tune_applied) {
            self.loosen_chop_thresholds();
            info!("auto-tuned chop thresholds restored from state");
        }
    }

    fn rebuild(&mut self) {
        self.registry = vec![
            Box::new(PriceMoveSignal::new(self.cfg.price_move.clone())) as Box<dyn Signal>,
            Box::new(MomentumSignal::new(self.cfg.momentum.clone())),
            Box::new(MeanReversionSignal::new(self.cfg.mean_reversion.clone())),
        ];
    }

    /// Scan one symbol. The outlier guard runs first; a rejection skips the
    /// asset entirely this cycle.
    pub fn scan_symbol(
        &self,
        symbol: &str,
        candles: &[Candle],
        regime: Regime,
    ) -> Vec<TriggerSignal> {
        if let Err(reason) = self.guard.check(candles) {
            warn!(symbol = %symbol, reason = %reason, "asset skipped by outlier guard");
            return Vec::new();
        }

        let mut triggers = Vec::new();
        for signal in &self.registry {
            if !signal.allowed_regimes().contains(&regime) {
                continue;
            }
            if let Some(mut trig) = signal.scan(symbol, candles, regime) {
                trig.confidence = self.regime_adjusted_confidence(&trig, regime);
                debug!(
                    symbol = %symbol,
                    signal = signal.name(),
                    kind = %trig.kind,
                    direction = %trig.direction,
                    confidence = trig.confidence,
                    "trigger"
                );
                triggers.push(trig);
            }
        }
        triggers
    }

    /// Symbols whose latest candle the outlier guard rejects. The risk
    /// engine mirrors this set against late-arriving external proposals.
    pub fn outlier_skipped(
        &self,
        snapshot: &UniverseSnapshot,
        candles: &HashMap<String, Vec<Candle>>,
    ) -> std::collections::HashSet<String> {
        snapshot
            .eligible_symbols()
            .into_iter()
            .filter(|symbol| {
                candles
                    .get(symbol)
                    .map(|series| self.guard.check(series).is_err())
                    .unwrap_or(false)
            })
            .collect()
    }

    /// Scan every eligible symbol in the snapshot.
    pub fn scan_universe(
        &self,
        snapshot: &UniverseSnapshot,
        candles: &HashMap<String, Vec<Candle>>,
        regime: Regime,
    ) -> Vec<TriggerSignal> {
        let mut triggers = Vec::new();
        for symbol in snapshot.eligible_symbols() {
            let Some(series) = candles.get(&symbol) else {
                continue;
            };
            triggers.extend(self.scan_symbol(&symbol, series, regime));
        }
        triggers
    }

    /// Bull boosts buys and penalizes sells; bear does the opposite.
    fn regime_adjusted_confidence(&self, trig: &TriggerSignal, regime: Regime) -> f64 {
        let delta = match (regime, trig.direction) {
            (Regime::Bull, Side::Buy) => self.cfg.bull_confidence_boost,
            (Regime::Bull, Side::Sell) => -self.cfg.bull_confidence_boost,
            (Regime::Bear, Side::Buy) => -self.cfg.bear_confidence_penalty,
            (Regime::Bear, Side::Sell) => self.cfg.bear_confidence_penalty,
            _ => 0.0,
        };
        (trig.confidence + delta).clamp(0.0, 1.0)
    }

    /// Track the zero-trigger streak and apply the one-shot loosening when
    /// the streak reaches the configured length.
    pub fn note_cycle_result(&mut self, store: &StateStore, had_triggers: bool) {
        if had_triggers {
            store.update(|s| s.zero_trigger_cycles = 0);
            return;
        }

        let (streak, already_applied) = store.update(|s| {
            s.zero_trigger_cycles += 1;
            (s.zero_trigger_cycles, s.auto_tune_applied)
        });

        if !self.cfg.auto_tune.enabled
            || already_applied
            || streak < self.cfg.auto_tune.zero_trigger_cycles
        {
            return;
        }

        self.loosen_chop_thresholds();
        store.update(|s| s.auto_tune_applied = true);
        info!(
            streak,
            chop_15m = self.cfg.price_move.chop_move_15m_pct,
            chop_60m = self.cfg.price_move.chop_move_60m_pct,
            "auto-tune applied: chop thresholds loosened (one-shot)"
        );
    }

    fn loosen_chop_thresholds(&mut self) {
        let t = &self.cfg.auto_tune;
        self.cfg.price_move.chop_move_15m_pct =
            (self.cfg.price_move.chop_move_15m_pct - t.loosen_15m_delta_pct).max(t.floor_15m_pct);
        self.cfg.price_move.chop_move_60m_pct =
            (self.cfg.price_move.chop_move_60m_pct - t.loosen_60m_delta_pct).max(t.floor_60m_pct);
        self.rebuild();
    }

    /// Current chop thresholds (for the audit record).
    pub fn chop_thresholds(&self) -> (f64, f64) {
        (
            self.cfg.price_move.chop_move_15m_pct,
            self.cfg.price_move.chop_move_60m_pct,
        )
    }
}

impl std::fmt::Debug for SignalManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignalManager")
            .field("signals", &self.registry.len())
            .finish()
    }
}
