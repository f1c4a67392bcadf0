// =============================================================================
// PriceMove signal — 15m/60m percentage move confirmed by volume
// =============================================================================

use chrono::Utc;

use crate::coinbase::Candle;
use crate::config::PriceMoveConfig;
use crate::types::{Regime, Side};

use super::{returns_stddev_pct, Signal, TriggerKind, TriggerSignal, volume_ratio};

/// Bars are 15-minute candles, oldest first.
const BARS_60M: usize = 4;
const VOLUME_WINDOW: usize = 20;

pub struct PriceMoveSignal {
    cfg: PriceMoveConfig,
}

impl PriceMoveSignal {
    pub fn new(cfg: PriceMoveConfig) -> Self {
        Self { cfg }
    }

    /// (move_15m, move_60m, volume_ratio) thresholds for the regime.
    fn thresholds(&self, regime: Regime) -> Option<(f64, f64, f64)> {
        match regime {
            Regime::Chop => Some((
                self.cfg.chop_move_15m_pct,
                self.cfg.chop_move_60m_pct,
                self.cfg.chop_min_volume_ratio,
            )),
            Regime::Bull => Some((
                self.cfg.bull_move_15m_pct,
                self.cfg.bull_move_60m_pct,
                self.cfg.min_volume_ratio,
            )),
            Regime::Bear => Some((
                self.cfg.bear_move_15m_pct,
                self.cfg.bear_move_60m_pct,
                self.cfg.min_volume_ratio,
            )),
            Regime::Crash => None,
        }
    }
}

impl Signal for PriceMoveSignal {
    fn name(&self) -> &'static str {
        "price_move"
    }

    fn allowed_regimes(&self) -> &'static [Regime] {
        &[Regime::Bull, Regime::Bear, Regime::Chop]
    }

    fn scan(&self, symbol: &str, candles: &[Candle], regime: Regime) -> Option<TriggerSignal> {
        if !self.cfg.enabled || candles.len() < VOLUME_WINDOW + BARS_60M + 1 {
            return None;
        }
        let (t15, t60, min_vr) = self.thresholds(regime)?;

        let last = candles[candles.len() - 1];
        let prev = candles[candles.len() - 2];
        let hour_ago = candles[candles.len() - 1 - BARS_60M];
        if prev.close <= 0.0 || hour_ago.close <= 0.0 {
            return None;
        }

        let move_15m = (last.close - prev.close) / prev.close * 100.0;
        let move_60m = (last.close - hour_ago.close) / hour_ago.close * 100.0;
        let vr = volume_ratio(candles, VOLUME_WINDOW)?;

        let hit_15m = move_15m.abs() >= t15;
        let hit_60m = move_60m.abs() >= t60;
        if !(hit_15m || hit_60m) || vr < min_vr {
            return None;
        }

        // The dominant window decides direction and strength.
        let (dominant_move, threshold) = if hit_15m {
            (move_15m, t15)
        } else {
            (move_60m, t60)
        };
        let direction = if dominant_move >= 0.0 { Side::Buy } else { Side::Sell };
        let strength = (dominant_move.abs() / (2.0 * threshold)).min(1.0);

        let mut confidence = 0.5 + 0.2 * strength;
        if hit_15m && hit_60m && move_15m.signum() == move_60m.signum() {
            confidence += 0.1;
        }
        let confidence = confidence.min(0.95);

        // An extreme volume surge is its own flavour of trigger.
        let kind = if vr >= 3.0 * min_vr {
            TriggerKind::VolumeSpike
        } else {
            TriggerKind::PriceMove
        };

        Some(TriggerSignal {
            symbol: symbol.to_string(),
            kind,
            strength,
            confidence,
            direction,
            volatility: returns_stddev_pct(candles, VOLUME_WINDOW),
            timestamp: Utc::now(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Flat history then a final bar moved by `move_pct` on `vol_mult`x volume.
    fn scenario(move_pct: f64, vol_mult: f64) -> Vec<Candle> {
        let mut candles: Vec<Candle> = (0..30)
            .map(|i| Candle {
                start: i * 900,
                open: 100.0,
                high: 100.1,
                low: 99.9,
                close: 100.0,
                volume: 1000.0,
            })
            .collect();
        let last = candles.last_mut().unwrap();
        last.close = 100.0 * (1.0 + move_pct / 100.0);
        last.volume = 1000.0 * vol_mult;
        candles
    }

    fn signal() -> PriceMoveSignal {
        PriceMoveSignal::new(PriceMoveConfig::default())
    }

    #[test]
    fn chop_move_with_volume_fires_buy() {
        let candles = scenario(2.5, 2.5);
        let trig = signal().scan("SOL-USD", &candles, Regime::Chop).unwrap();
        assert_eq!(trig.direction, Side::Buy);
        assert!(trig.confidence > 0.5);
        assert!(trig.strength > 0.0 && trig.strength <= 1.0);
    }

    #[test]
    fn move_without_volume_does_not_fire() {
        let candles = scenario(2.5, 1.0);
        assert!(signal().scan("SOL-USD", &candles, Regime::Chop).is_none());
    }

    #[test]
    fn volume_without_move_does_not_fire() {
        let candles = scenario(0.5, 5.0);
        assert!(signal().scan("SOL-USD", &candles, Regime::Chop).is_none());
    }

    #[test]
    fn bull_needs_larger_move_than_chop() {
        // 2.5% clears the chop threshold (2.0) but not bull (3.5).
        let candles = scenario(2.5, 2.5);
        assert!(signal().scan("SOL-USD", &candles, Regime::Chop).is_some());
        assert!(signal().scan("SOL-USD", &candles, Regime::Bull).is_none());
    }

    #[test]
    fn downward_move_fires_sell() {
        let candles = scenario(-2.5, 2.5);
        let trig = signal().scan("SOL-USD", &candles, Regime::Chop).unwrap();
        assert_eq!(trig.direction, Side::Sell);
    }

    #[test]
    fn crash_regime_never_fires() {
        let candles = scenario(10.0, 5.0);
        assert!(signal().scan("SOL-USD", &candles, Regime::Crash).is_none());
    }

    #[test]
    fn extreme_volume_classifies_as_volume_spike() {
        let candles = scenario(2.5, 8.0);
        let trig = signal().scan("SOL-USD", &candles, Regime::Chop).unwrap();
        assert_eq!(trig.kind, TriggerKind::VolumeSpike);
    }

    #[test]
    fn short_history_is_skipped() {
        let candles: Vec<Candle> = scenario(5.0, 5.0).into_iter().take(10).collect();
        assert!(signal().scan("SOL-USD", &candles, Regime::Chop).is_none());
    }
}
