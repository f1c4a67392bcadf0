// =============================================================================
// Outlier Guard — rejects bad candles before any signal sees them
// =============================================================================
//
// A bar that deviates hard from the recent moving average on thin volume is
// far more likely to be a data glitch or a manipulated print than a real
// move. Such bars cause the whole asset to be skipped for the cycle.
// =============================================================================

use crate::coinbase::Candle;
use crate::config::OutlierConfig;

#[derive(Debug, Clone)]
pub struct OutlierGuard {
    cfg: OutlierConfig,
}

impl OutlierGuard {
    pub fn new(cfg: OutlierConfig) -> Self {
        Self { cfg }
    }

    /// Check the latest bar against the `lookback_bars` preceding it.
    /// `Err(reason)` means the asset must be skipped this cycle.
    pub fn check(&self, candles: &[Candle]) -> Result<(), String> {
        let n = self.cfg.lookback_bars;
        if candles.len() < n + 1 {
            // Not enough history to judge; signals will not fire anyway.
            return Ok(());
        }

        let current = &candles[candles.len() - 1];
        let window = &candles[candles.len() - 1 - n..candles.len() - 1];

        let ma = window.iter().map(|c| c.close).sum::<f64>() / n as f64;
        let avg_volume = window.iter().map(|c| c.volume).sum::<f64>() / n as f64;

        if ma <= 0.0 {
            return Err("zero average price".to_string());
        }
        if avg_volume <= 0.0 {
            return Err("zero average volume".to_string());
        }

        let deviation_pct = ((current.close - ma) / ma).abs() * 100.0;
        let volume_ratio = current.volume / avg_volume;

        if deviation_pct > self.cfg.max_deviation_pct && volume_ratio < self.cfg.min_volume_ratio {
            return Err(format!(
                "outlier: {deviation_pct:.1}% off MA on {volume_ratio:.2}x volume"
            ));
        }

        Ok(())
    }
}
