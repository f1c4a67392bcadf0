// =============================================================================
// Momentum signal — sustained directional trend with increasing volume
// =============================================================================

use chrono::Utc;

use crate::coinbase::Candle;
use crate::config::MomentumConfig;
use crate::types::{Regime, Side};

use super::{returns_stddev_pct, Signal, TriggerKind, TriggerSignal};

/// 15-minute bars per hour.
const BARS_PER_HOUR: usize = 4;
/// Lookback split into this many segments for the monotonicity check.
const SEGMENTS: usize = 4;

pub struct MomentumSignal {
    cfg: MomentumConfig,
}

impl MomentumSignal {
    pub fn new(cfg: MomentumConfig) -> Self {
        Self { cfg }
    }

    fn lookback_bars(&self) -> usize {
        self.cfg.lookback_hours as usize * BARS_PER_HOUR
    }
}

impl Signal for MomentumSignal {
    fn name(&self) -> &'static str {
        "momentum"
    }

    fn allowed_regimes(&self) -> &'static [Regime] {
        &[Regime::Bull, Regime::Bear]
    }

    fn scan(&self, symbol: &str, candles: &[Candle], _regime: Regime) -> Option<TriggerSignal> {
        let bars = self.lookback_bars();
        if !self.cfg.enabled || candles.len() < bars || bars < SEGMENTS * 2 {
            return None;
        }

        let window = &candles[candles.len() - bars..];
        let first = window.first()?.close;
        let last = window.last()?.close;
        if first <= 0.0 {
            return None;
        }

        let total_move_pct = (last - first) / first * 100.0;
        if total_move_pct.abs() < self.cfg.min_trend_pct {
            return None;
        }

        // Segment means must march in one direction: a sustained trend, not
        // a single impulse bar.
        let seg_len = bars / SEGMENTS;
        let seg_means: Vec<f64> = (0..SEGMENTS)
            .map(|i| {
                let seg = &window[i * seg_len..(i + 1) * seg_len];
                seg.iter().map(|c| c.close).sum::<f64>() / seg.len() as f64
            })
            .collect();
        let rising = seg_means.windows(2).all(|w| w[1] > w[0]);
        let falling = seg_means.windows(2).all(|w| w[1] < w[0]);
        if !(rising || falling) {
            return None;
        }
        if rising != (total_move_pct > 0.0) {
            return None;
        }

        // Volume must build into the move.
        let half = bars / 2;
        let vol_first: f64 = window[..half].iter().map(|c| c.volume).sum();
        let vol_second: f64 = window[half..].iter().map(|c| c.volume).sum();
        if vol_first <= 0.0 || vol_second < vol_first * self.cfg.volume_increase_ratio {
            return None;
        }

        let direction = if rising { Side::Buy } else { Side::Sell };
        let strength = (total_move_pct.abs() / (2.0 * self.cfg.min_trend_pct)).min(1.0);
        let vol_build = vol_second / vol_first;
        let confidence =
            (0.55 + 0.15 * strength + if vol_build > 1.5 { 0.1 } else { 0.0 }).min(0.95);

        Some(TriggerSignal {
            symbol: symbol.to_string(),
            kind: TriggerKind::Momentum,
            strength,
            confidence,
            direction,
            volatility: returns_stddev_pct(candles, 20),
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// 48 bars trending from 100 to `end`, volume ramping by `vol_ramp`.
    fn trending(end: f64, vol_ramp: f64) -> Vec<Candle> {
        let n = 48;
        (0..n)
            .map(|i| {
                let t = i as f64 / (n - 1) as f64;
                let price = 100.0 + (end - 100.0) * t;
                Candle {
                    start: i as i64 * 900,
                    open: price,
                    high: price,
                    low: price,
                    close: price,
                    volume: 1000.0 * (1.0 + (vol_ramp - 1.0) * t),
                }
            })
            .collect()
    }

    fn signal() -> MomentumSignal {
        MomentumSignal::new(MomentumConfig::default())
    }

    #[test]
    fn sustained_uptrend_with_building_volume_fires() {
        let candles = trending(106.0, 2.0);
        let trig = signal().scan("ETH-USD", &candles, Regime::Bull).unwrap();
        assert_eq!(trig.kind, TriggerKind::Momentum);
        assert_eq!(trig.direction, Side::Buy);
        assert!(trig.confidence >= 0.55);
    }

    #[test]
    fn downtrend_fires_sell() {
        let candles = trending(94.0, 2.0);
        let trig = signal().scan("ETH-USD", &candles, Regime::Bear).unwrap();
        assert_eq!(trig.direction, Side::Sell);
    }

    #[test]
    fn flat_volume_does_not_fire() {
        let candles = trending(106.0, 1.0);
        assert!(signal().scan("ETH-USD", &candles, Regime::Bull).is_none());
    }

    #[test]
    fn small_move_does_not_fire() {
        let candles = trending(101.0, 2.0);
        assert!(signal().scan("ETH-USD", &candles, Regime::Bull).is_none());
    }

    #[test]
    fn whipsaw_is_not_momentum() {
        // Up then down: segments are not monotone.
        let mut candles = trending(106.0, 2.0);
        let n = candles.len();
        for c in candles[n - 12..].iter_mut() {
            c.close = 98.0;
            c.open = 98.0;
            c.high = 98.0;
            c.low = 98.0;
        }
        assert!(signal().scan("ETH-USD", &candles, Regime::Bull).is_none());
    }
}
