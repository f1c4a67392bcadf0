// =============================================================================
// Paper fill model — slippage, market impact, and probabilistic maker fills
// =============================================================================
//
// fill = mid +/- (tier_slippage + impact(notional) + volatility_adjustment)
// in basis points, against the trade. Tier-1 assets get the tightest
// slippage bucket. Maker orders on lower tiers fill probabilistically, and
// sometimes only partially.
// =============================================================================

use rand::Rng;

use crate::types::{Side, Tier};

/// Per-tier base slippage, basis points.
const TIER_SLIPPAGE_BPS: [f64; 3] = [2.0, 6.0, 15.0];
/// Impact coefficient: bps per $1k of notional.
const IMPACT_BPS_PER_1K: f64 = 0.8;
/// Cap on the volatility adjustment, bps.
const MAX_VOL_ADJUSTMENT_BPS: f64 = 10.0;
/// Probability a resting post-only order fills within its TTL, per tier.
const MAKER_FILL_PROBABILITY: [f64; 3] = [0.70, 0.50, 0.35];
/// Probability a maker fill on tiers 2/3 is partial.
const PARTIAL_FILL_PROBABILITY: f64 = 0.25;

#[derive(Debug, Clone, Default)]
pub struct PaperFillModel;

impl PaperFillModel {
    /// Effective taker fill price for a `notional` USD order at `mid`.
    pub fn taker_fill_price(
        &self,
        mid: f64,
        side: Side,
        notional_usd: f64,
        volatility_pct: f64,
        tier: Tier,
    ) -> f64 {
        let slippage_bps = TIER_SLIPPAGE_BPS[tier.index()]
            + IMPACT_BPS_PER_1K * (notional_usd / 1_000.0)
            + (volatility_pct * 2.0).min(MAX_VOL_ADJUSTMENT_BPS);
        let frac = slippage_bps / 10_000.0;
        match side {
            Side::Buy => mid * (1.0 + frac),
            Side::Sell => mid * (1.0 - frac),
        }
    }

    /// Whether a resting maker order fills within its TTL, and what fraction
    /// of the size fills (1.0 = complete).
    pub fn maker_fill(&self, tier: Tier) -> Option<f64> {
        let mut rng = rand::rng();
        if rng.random_range(0.0..1.0) >= MAKER_FILL_PROBABILITY[tier.index()] {
            return None;
        }
        if tier != Tier::One && rng.random_range(0.0..1.0) < PARTIAL_FILL_PROBABILITY {
            return Some(rng.random_range(0.3..0.9));
        }
        Some(1.0)
    }
}
