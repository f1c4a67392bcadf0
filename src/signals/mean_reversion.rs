// =============================================================================
// MeanReversion signal — fade a stretched move showing exhaustion
// =============================================================================
//
// Fires only in chop. Requires a meaningful deviation from the 24 h mean plus
// exhaustion evidence: declining volume and a slowing move.
// =============================================================================

use chrono::Utc;

use crate::coinbase::Candle;
use crate::config::MeanReversionConfig;
use crate::types::{Regime, Side};

use super::{returns_stddev_pct, Signal, TriggerKind, TriggerSignal};

/// 24 hours of 15-minute bars.
const MEAN_WINDOW: usize = 96;

pub struct MeanReversionSignal {
    cfg: MeanReversionConfig,
}

impl MeanReversionSignal {
    pub fn new(cfg: MeanReversionConfig) -> Self {
        Self { cfg }
    }
}

impl Signal for MeanReversionSignal {
    fn name(&self) -> &'static str {
        "mean_reversion"
    }

    fn allowed_regimes(&self) -> &'static [Regime] {
        &[Regime::Chop]
    }

    fn scan(&self, symbol: &str, candles: &[Candle], regime: Regime) -> Option<TriggerSignal> {
        if !self.cfg.enabled || regime != Regime::Chop || candles.len() < MEAN_WINDOW {
            return None;
        }

        let window = &candles[candles.len() - MEAN_WINDOW..];
        let mean = window.iter().map(|c| c.close).sum::<f64>() / window.len() as f64;
        if mean <= 0.0 {
            return None;
        }

        let last = window[window.len() - 1];
        let deviation_pct = (last.close - mean) / mean * 100.0;
        if deviation_pct.abs() < self.cfg.min_deviation_pct {
            return None;
        }

        // Exhaustion: the last three bars shrink in both volume and range.
        let c3 = window[window.len() - 3];
        let c2 = window[window.len() - 2];
        let c1 = last;
        let volume_declining = c1.volume < c2.volume && c2.volume < c3.volume;
        let move_slowing = (c1.close - c2.close).abs() < (c2.close - c3.close).abs();
        if !(volume_declining && move_slowing) {
            return None;
        }

        // Fade the stretch: above the mean we sell, below it we buy.
        let direction = if deviation_pct > 0.0 { Side::Sell } else { Side::Buy };
        let strength = (deviation_pct.abs() / (2.0 * self.cfg.min_deviation_pct)).min(1.0);
        let confidence = (0.5 + 0.2 * strength).min(0.9);

        Some(TriggerSignal {
            symbol: symbol.to_string(),
            kind: TriggerKind::MeanReversion,
            strength,
            confidence,
            direction,
            volatility: returns_stddev_pct(candles, 20),
            timestamp: Utc::now(),
        })
    }
}
