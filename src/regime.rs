// =============================================================================
// Regime Detector — market state from breadth and weighted index returns
// =============================================================================
//
// Inputs are hourly candles for the universe's core symbols plus a weight per
// symbol (NAV weight when held, 24 h volume share otherwise). The detection
// itself is a pure function of those inputs so it is testable without I/O
// and identical between live and backtest runs.
// =============================================================================

use parking_lot::Mutex;
use serde::Serialize;
use tracing::{debug, info};

use crate::coinbase::Candle;
use crate::config::RegimeConfig;
use crate::types::Regime;

/// One symbol's contribution to the regime calculation.
#[derive(Debug, Clone)]
pub struct RegimeInput {
    pub symbol: String,
    /// Hourly candles, oldest first, covering at least 24 bars.
    pub candles: Vec<Candle>,
    pub weight: f64,
}

#[derive(Debug, Clone, Serialize)]
pub struct RegimeReading {
    pub regime: Regime,
    pub breadth: f64,
    pub index_return_24h_pct: f64,
    pub index_return_4h_pct: f64,
}

/// Pure regime classification.
pub fn detect_regime(cfg: &RegimeConfig, inputs: &[RegimeInput]) -> RegimeReading {
    let mut above_mean = 0usize;
    let mut counted = 0usize;
    let mut weighted_24h = 0.0;
    let mut weighted_4h = 0.0;
    let mut total_weight = 0.0;

    for input in inputs {
        let candles = &input.candles;
        if candles.len() < 24 {
            continue;
        }
        let last = candles[candles.len() - 1].close;
        let open_24h = candles[candles.len() - 24].close;
        let open_4h = candles[candles.len() - 4].close;
        if last <= 0.0 || open_24h <= 0.0 || open_4h <= 0.0 {
            continue;
        }

        counted += 1;
        let window = &candles[candles.len() - 24..];
        let mean: f64 = window.iter().map(|c| c.close).sum::<f64>() / window.len() as f64;
        if last > mean {
            above_mean += 1;
        }

        let weight = input.weight.max(0.0);
        weighted_24h += weight * (last - open_24h) / open_24h;
        weighted_4h += weight * (last - open_4h) / open_4h;
        total_weight += weight;
    }

    if counted == 0 || total_weight <= 0.0 {
        // No usable data: stay defensive in chop.
        return RegimeReading {
            regime: Regime::Chop,
            breadth: 0.0,
            index_return_24h_pct: 0.0,
            index_return_4h_pct: 0.0,
        };
    }

    let breadth = above_mean as f64 / counted as f64;
    let index_return_24h_pct = weighted_24h / total_weight * 100.0;
    let index_return_4h_pct = weighted_4h / total_weight * 100.0;

    let regime = if index_return_4h_pct <= cfg.crash_index_drop_pct {
        Regime::Crash
    } else if breadth >= cfg.bull_breadth && index_return_24h_pct >= cfg.trend_return_pct {
        Regime::Bull
    } else if breadth <= cfg.bear_breadth && index_return_24h_pct <= -cfg.trend_return_pct {
        Regime::Bear
    } else {
        Regime::Chop
    };

    RegimeReading {
        regime,
        breadth,
        index_return_24h_pct,
        index_return_4h_pct,
    }
}

/// Stateful wrapper that remembers the previous regime so the orchestrator
/// can force a universe refresh on change.
pub struct RegimeDetector {
    cfg: RegimeConfig,
    last: Mutex<Option<RegimeReading>>,
}

impl RegimeDetector {
    pub fn new(cfg: RegimeConfig) -> Self {
        Self {
            cfg,
            last: Mutex::new(None),
        }
    }

    /// Run detection; returns the reading and whether the regime changed.
    pub fn update(&self, inputs: &[RegimeInput]) -> (RegimeReading, bool) {
        let reading = detect_regime(&self.cfg, inputs);
        let mut last = self.last.lock();
        let changed = last
            .as_ref()
            .map(|prev| prev.regime != reading.regime)
            .unwrap_or(false);

        if changed {
            info!(
                from = %last.as_ref().map(|r| r.regime).unwrap_or_default(),
                to = %reading.regime,
                breadth = reading.breadth,
                index_24h_pct = reading.index_return_24h_pct,
                "regime changed"
            );
        } else {
            debug!(
                regime = %reading.regime,
                breadth = reading.breadth,
                index_24h_pct = reading.index_return_24h_pct,
                "regime unchanged"
            );
        }

        *last = Some(reading.clone());
        (reading, changed)
    }

    pub fn current(&self) -> Regime {
        self.last
            .lock()
            .as_ref()
            .map(|r| r.regime)
            .unwrap_or_default()
    }
}

impl std::fmt::Debug for RegimeDetector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegimeDetector")
            .field("current", &self.current())
            .finish()
    }
}
