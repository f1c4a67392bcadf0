// =============================================================================
// Configuration — five YAML files loaded from --config-dir, with a cross-field
// sanity gate that refuses startup on contradictory or unsafe values
// =============================================================================
//
// Files: app.yaml, policy.yaml, universe.yaml, signals.yaml, strategies.yaml.
//
// Every field carries a serde default so that older config files missing new
// fields still deserialise. New features ship disabled by default.
// =============================================================================

use std::collections::HashMap;
use std::path::Path;

use anyhow::{bail, Context, Result};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::types::ExecutionMode;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_true() -> bool {
    true
}

fn default_name() -> String {
    "meridian".to_string()
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_loop_interval() -> u64 {
    30
}

fn default_jitter_pct() -> f64 {
    0.10
}

fn default_utilization_target() -> f64 {
    0.8
}

fn default_paper_nav() -> f64 {
    10_000.0
}

fn default_metrics_port() -> u16 {
    9633
}

fn default_port_retry_range() -> u16 {
    5
}

fn default_persist_interval() -> u64 {
    60
}

// =============================================================================
// app.yaml
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_metrics_port")]
    pub port: u16,
    /// On bind conflict, retry port, port+1, ... up to this many candidates.
    #[serde(default = "default_port_retry_range")]
    pub port_retry_range: u16,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            port: default_metrics_port(),
            port_retry_range: default_port_retry_range(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Instance name. Used for the pid lock file (`data/<name>.pid`).
    #[serde(default = "default_name")]
    pub name: String,

    /// Execution mode. Ships as dry_run; live requires a CLI opt-in too.
    #[serde(default)]
    pub mode: ExecutionMode,

    /// Base loop interval in seconds.
    #[serde(default = "default_loop_interval")]
    pub loop_interval_seconds: u64,

    /// Sleep jitter as a fraction of the interval (0.10 = ±10 %).
    #[serde(default = "default_jitter_pct")]
    pub loop_jitter_pct: f64,

    /// When cycle_ms / interval_ms exceeds this, the loop adds backoff.
    #[serde(default = "default_utilization_target")]
    pub cycle_utilization_target: f64,

    /// Directory for persisted state, audit logs, and sentinel files.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// Starting cash for paper / dry-run portfolios.
    #[serde(default = "default_paper_nav")]
    pub paper_nav_usd: f64,

    /// State-store flush cadence in seconds.
    #[serde(default = "default_persist_interval")]
    pub persist_interval_seconds: u64,

    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl Default for AppConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty AppConfig deserialises")
    }
}

// =============================================================================
// policy.yaml
// =============================================================================

fn default_max_total_at_risk() -> f64 {
    25.0
}
fn default_max_position_size() -> f64 {
    4.0
}
fn default_max_single_trade() -> f64 {
    3.0
}
fn default_daily_stop() -> f64 {
    3.0
}
fn default_weekly_stop() -> f64 {
    8.0
}
fn default_max_drawdown() -> f64 {
    10.0
}
fn default_trade_spacing() -> u64 {
    90
}
fn default_symbol_spacing() -> u64 {
    900
}
fn default_trades_per_hour() -> u32 {
    6
}
fn default_trades_per_day() -> u32 {
    24
}
fn default_cooldown_win() -> u64 {
    15
}
fn default_cooldown_loss() -> u64 {
    60
}
fn default_cooldown_stop_out() -> u64 {
    240
}
fn default_max_open_positions() -> u32 {
    6
}
fn default_min_dust() -> f64 {
    1.0
}
fn default_min_trade_notional() -> f64 {
    10.0
}
fn default_max_api_errors() -> u32 {
    5
}
fn default_stop_out_pnl() -> f64 {
    -5.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RiskConfig {
    /// Global cap on the sum of open position values, % of NAV.
    #[serde(default = "default_max_total_at_risk")]
    pub max_total_at_risk_pct: f64,

    /// Per-symbol position cap, % of NAV.
    #[serde(default = "default_max_position_size")]
    pub max_position_size_pct: f64,

    /// Hard clamp on any single proposal's size, % of NAV.
    #[serde(default = "default_max_single_trade")]
    pub max_single_trade_pct: f64,

    /// Theme clusters: cluster name -> member symbols.
    #[serde(default)]
    pub clusters: HashMap<String, Vec<String>>,

    /// Per-cluster exposure caps, % of NAV (e.g. l2: 10.0).
    #[serde(default)]
    pub cluster_caps_pct: HashMap<String, f64>,

    /// Daily stop-loss: halt when daily PnL <= -this. Positive number.
    #[serde(default = "default_daily_stop")]
    pub daily_stop_loss_pct: f64,

    /// Weekly stop-loss. Must be looser than the daily stop.
    #[serde(default = "default_weekly_stop")]
    pub weekly_stop_loss_pct: f64,

    /// Drawdown-from-HWM halt threshold.
    #[serde(default = "default_max_drawdown")]
    pub max_drawdown_pct: f64,

    #[serde(default = "default_trade_spacing")]
    pub min_seconds_between_trades: u64,

    #[serde(default = "default_symbol_spacing")]
    pub min_seconds_between_trades_same_symbol: u64,

    #[serde(default = "default_trades_per_hour")]
    pub max_trades_per_hour: u32,

    #[serde(default = "default_trades_per_day")]
    pub max_trades_per_day: u32,

    #[serde(default = "default_cooldown_win")]
    pub cooldown_win_minutes: u64,

    #[serde(default = "default_cooldown_loss")]
    pub cooldown_loss_minutes: u64,

    #[serde(default = "default_cooldown_stop_out")]
    pub cooldown_stop_out_minutes: u64,

    /// Realized PnL% at or below which a close is classified as a stop-out.
    #[serde(default = "default_stop_out_pnl")]
    pub stop_out_pnl_pct: f64,

    /// Pyramiding (adding to an existing position). Disabled by default.
    #[serde(default)]
    pub pyramiding_enabled: bool,

    #[serde(default)]
    pub max_adds_per_asset_per_day: u32,

    #[serde(default)]
    pub max_pyramid_positions: u32,

    #[serde(default = "default_max_open_positions")]
    pub max_open_positions: u32,

    /// Positions below this USD value are dust: excluded from exposure.
    #[serde(default = "default_min_dust")]
    pub min_dust_usd: f64,

    /// Smallest trade the risk engine will approve after resizing.
    #[serde(default = "default_min_trade_notional")]
    pub min_trade_notional_usd: f64,

    /// Consecutive exchange API errors at which trading halts.
    #[serde(default = "default_max_api_errors")]
    pub max_consecutive_api_errors: u32,
}

impl Default for RiskConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty RiskConfig deserialises")
    }
}

fn default_post_only_ttl() -> u64 {
    25
}
fn default_max_slippage_bps() -> f64 {
    12.0
}
fn default_cancel_after() -> u64 {
    60
}
fn default_reconcile_wait_ms() -> u64 {
    600
}
fn default_partial_fill_tolerance() -> f64 {
    0.05
}
fn default_min_order_notional() -> f64 {
    5.0
}
fn default_maker_fee_bps() -> f64 {
    40.0
}
fn default_taker_fee_bps() -> f64 {
    60.0
}
fn default_fills_lookback() -> u64 {
    30
}
fn default_ghost_ttl() -> u64 {
    60
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionConfig {
    /// Try a post-only maker order before any taker order.
    #[serde(default = "default_true")]
    pub maker_first: bool,

    /// Seconds a post-only order may rest before the taker fallback.
    #[serde(default = "default_post_only_ttl")]
    pub post_only_ttl_seconds: u64,

    /// Fall back to an IOC taker order when the maker TTL expires unfilled.
    #[serde(default = "default_true")]
    pub taker_fallback: bool,

    /// Worst acceptable taker price, basis points from mid.
    #[serde(default = "default_max_slippage_bps")]
    pub max_slippage_bps: f64,

    /// Age at which a resting order is treated as stale and canceled.
    #[serde(default = "default_cancel_after")]
    pub cancel_after_seconds: u64,

    /// Wait between order placement and the fill-reconcile pass.
    #[serde(default = "default_reconcile_wait_ms")]
    pub post_trade_reconcile_wait_ms: u64,

    /// filled_size >= size * (1 - tolerance) counts as FILLED.
    #[serde(default = "default_partial_fill_tolerance")]
    pub partial_fill_tolerance: f64,

    /// Absolute floor for any order we send to the exchange.
    #[serde(default = "default_min_order_notional")]
    pub min_order_notional_usd: f64,

    #[serde(default = "default_maker_fee_bps")]
    pub maker_fee_bps: f64,

    #[serde(default = "default_taker_fee_bps")]
    pub taker_fee_bps: f64,

    /// How far back list_fills looks when reconciling.
    #[serde(default = "default_fills_lookback")]
    pub fills_lookback_minutes: u64,

    /// TTL of the recently-canceled ghost-order filter cache.
    #[serde(default = "default_ghost_ttl")]
    pub ghost_ttl_seconds: u64,
}

impl Default for ExecutionConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty ExecutionConfig deserialises")
    }
}

fn default_min_liquidation() -> f64 {
    5.0
}
fn default_twap_slice_notional() -> f64 {
    50.0
}
fn default_twap_interval_ms() -> u64 {
    400
}
fn default_residual_threshold() -> f64 {
    2.0
}
fn default_trim_failure_alert() -> u32 {
    3
}

/// TWAP liquidation settings shared by the auto-trim and purge paths.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PurgeConfig {
    /// Holdings below this value are not worth liquidating.
    #[serde(default = "default_min_liquidation")]
    pub min_liquidation_value_usd: f64,

    #[serde(default = "default_twap_slice_notional")]
    pub twap_slice_notional_usd: f64,

    #[serde(default = "default_twap_interval_ms")]
    pub twap_slice_interval_ms: u64,

    /// Residual value at which the TWAP stops slicing.
    #[serde(default = "default_residual_threshold")]
    pub residual_value_threshold_usd: f64,

    /// Consecutive trim failures before the CRITICAL alert fires.
    #[serde(default = "default_trim_failure_alert")]
    pub max_trim_failures_before_alert: u32,
}

impl Default for PurgeConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty PurgeConfig deserialises")
    }
}

fn default_total_budget_ms() -> u64 {
    10_000
}
fn default_universe_budget_ms() -> u64 {
    2_000
}
fn default_signal_budget_ms() -> u64 {
    1_500
}
fn default_risk_budget_ms() -> u64 {
    500
}
fn default_execution_budget_ms() -> u64 {
    5_000
}
fn default_reconcile_budget_ms() -> u64 {
    1_500
}

/// Per-stage latency budgets. Overruns log a warning and fire the latency
/// alert; they are never hard failures.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LatencyConfig {
    #[serde(default = "default_total_budget_ms")]
    pub total_budget_ms: u64,
    #[serde(default = "default_universe_budget_ms")]
    pub universe_build_ms: u64,
    #[serde(default = "default_signal_budget_ms")]
    pub signal_scan_ms: u64,
    #[serde(default = "default_risk_budget_ms")]
    pub risk_check_ms: u64,
    #[serde(default = "default_execution_budget_ms")]
    pub execution_ms: u64,
    #[serde(default = "default_reconcile_budget_ms")]
    pub reconcile_ms: u64,
}

impl Default for LatencyConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty LatencyConfig deserialises")
    }
}

fn default_dedupe_window() -> u64 {
    60
}
fn default_escalation_seconds() -> u64 {
    120
}
fn default_stale_seconds() -> u64 {
    300
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AlertConfig {
    #[serde(default = "default_dedupe_window")]
    pub dedupe_window_seconds: u64,

    #[serde(default = "default_escalation_seconds")]
    pub escalation_seconds: u64,

    /// Inactive records are dropped after this, enabling a fresh cycle.
    #[serde(default = "default_stale_seconds")]
    pub stale_seconds: u64,

    #[serde(default)]
    pub webhook_url: Option<String>,

    /// Escalated alerts are additionally routed here when set.
    #[serde(default)]
    pub escalation_webhook_url: Option<String>,
}

impl Default for AlertConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty AlertConfig deserialises")
    }
}

fn default_max_clock_skew_ms() -> u64 {
    5_000
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartupConfig {
    /// Refuse startup when local clock differs from the exchange by more.
    #[serde(default = "default_max_clock_skew_ms")]
    pub max_clock_skew_ms: u64,

    /// Warn when the API key is older than this many days (from
    /// CB_KEY_CREATED_AT). None disables the check.
    #[serde(default)]
    pub max_key_age_days: Option<u32>,
}

impl Default for StartupConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty StartupConfig deserialises")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default)]
    pub risk: RiskConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub purge_execution: PurgeConfig,
    #[serde(default)]
    pub latency: LatencyConfig,
    #[serde(default)]
    pub alerts: AlertConfig,
    #[serde(default)]
    pub startup: StartupConfig,
    /// Auto-trim excess exposure back under the global cap.
    #[serde(default = "default_true")]
    pub auto_trim_enabled: bool,
}

impl Default for PolicyConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty PolicyConfig deserialises")
    }
}

// =============================================================================
// universe.yaml
// =============================================================================

fn default_tier_spread_bps() -> [f64; 3] {
    [20.0, 35.0, 60.0]
}
fn default_tier_min_volume() -> [f64; 3] {
    [5_000_000.0, 1_000_000.0, 250_000.0]
}
fn default_tier_min_depth() -> [f64; 3] {
    [50_000.0, 10_000.0, 2_500.0]
}
fn default_depth_multiplier() -> f64 {
    3.0
}
fn default_target_notional() -> f64 {
    100.0
}
fn default_eligible_grace() -> u32 {
    2
}
fn default_ineligible_grace() -> u32 {
    3
}
fn default_min_eligible() -> u32 {
    3
}
fn default_snapshot_ttl() -> u64 {
    120
}
fn default_ban_hours() -> u64 {
    24
}
fn default_chop_loosen() -> f64 {
    1.25
}

fn default_crash_index_drop_pct() -> f64 {
    -8.0
}
fn default_bull_breadth() -> f64 {
    0.6
}
fn default_bear_breadth() -> f64 {
    0.4
}
fn default_trend_return_pct() -> f64 {
    1.5
}

/// Regime detector thresholds. Breadth is the fraction of universe symbols
/// trading above their 24 h mean.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegimeConfig {
    /// NAV-weighted 4 h index return at or below which the regime is crash.
    #[serde(default = "default_crash_index_drop_pct")]
    pub crash_index_drop_pct: f64,

    #[serde(default = "default_bull_breadth")]
    pub bull_breadth: f64,

    #[serde(default = "default_bear_breadth")]
    pub bear_breadth: f64,

    /// Minimum |24 h index return| for a bull/bear call.
    #[serde(default = "default_trend_return_pct")]
    pub trend_return_pct: f64,
}

impl Default for RegimeConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty RegimeConfig deserialises")
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UniverseConfig {
    #[serde(default)]
    pub tier1: Vec<String>,
    #[serde(default)]
    pub tier2: Vec<String>,
    #[serde(default)]
    pub tier3: Vec<String>,

    /// Never tradable under any circumstances (stablecoins etc.).
    #[serde(default)]
    pub never_trade: Vec<String>,

    #[serde(default)]
    pub excluded_symbols: Vec<String>,

    /// Core assets that bypass the liquidity gates.
    #[serde(default)]
    pub force_eligible_symbols: Vec<String>,

    #[serde(default = "default_tier_spread_bps")]
    pub tier_max_spread_bps: [f64; 3],

    #[serde(default = "default_tier_min_volume")]
    pub tier_min_volume_usd: [f64; 3],

    #[serde(default = "default_tier_min_depth")]
    pub tier_min_depth_usd: [f64; 3],

    /// Depth must also cover this multiple of the target order notional.
    #[serde(default = "default_depth_multiplier")]
    pub required_depth_multiplier: f64,

    #[serde(default = "default_target_notional")]
    pub target_order_notional_usd: f64,

    /// Consecutive passing cycles before an ineligible symbol is promoted.
    #[serde(default = "default_eligible_grace")]
    pub eligible_grace_cycles: u32,

    /// Consecutive failing cycles before an eligible symbol is demoted.
    #[serde(default = "default_ineligible_grace")]
    pub ineligible_grace_cycles: u32,

    /// Below this count the empty_universe CRITICAL alert fires.
    #[serde(default = "default_min_eligible")]
    pub min_eligible_assets: u32,

    #[serde(default = "default_snapshot_ttl")]
    pub snapshot_ttl_seconds: u64,

    /// Default TTL for red-flag bans.
    #[serde(default = "default_ban_hours")]
    pub temporary_ban_hours: u64,

    /// In chop, tier thresholds are loosened by this multiplier.
    #[serde(default = "default_chop_loosen")]
    pub chop_threshold_multiplier: f64,

    #[serde(default)]
    pub regime: RegimeConfig,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty UniverseConfig deserialises")
    }
}

// =============================================================================
// signals.yaml
// =============================================================================

fn default_pm_chop_15m() -> f64 {
    2.0
}
fn default_pm_chop_60m() -> f64 {
    4.0
}
fn default_pm_bull_15m() -> f64 {
    3.5
}
fn default_pm_bull_60m() -> f64 {
    7.0
}
fn default_pm_bear_15m() -> f64 {
    3.0
}
fn default_pm_bear_60m() -> f64 {
    7.0
}
fn default_pm_volume_ratio() -> f64 {
    2.0
}
fn default_pm_chop_volume_ratio() -> f64 {
    1.9
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PriceMoveConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_pm_chop_15m")]
    pub chop_move_15m_pct: f64,
    #[serde(default = "default_pm_chop_60m")]
    pub chop_move_60m_pct: f64,
    #[serde(default = "default_pm_bull_15m")]
    pub bull_move_15m_pct: f64,
    #[serde(default = "default_pm_bull_60m")]
    pub bull_move_60m_pct: f64,
    #[serde(default = "default_pm_bear_15m")]
    pub bear_move_15m_pct: f64,
    #[serde(default = "default_pm_bear_60m")]
    pub bear_move_60m_pct: f64,
    #[serde(default = "default_pm_volume_ratio")]
    pub min_volume_ratio: f64,
    #[serde(default = "default_pm_chop_volume_ratio")]
    pub chop_min_volume_ratio: f64,
}

impl Default for PriceMoveConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty PriceMoveConfig deserialises")
    }
}

fn default_momentum_lookback_hours() -> u64 {
    12
}
fn default_momentum_min_trend_pct() -> f64 {
    4.0
}
fn default_momentum_volume_increase() -> f64 {
    1.2
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MomentumConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_momentum_lookback_hours")]
    pub lookback_hours: u64,
    #[serde(default = "default_momentum_min_trend_pct")]
    pub min_trend_pct: f64,
    /// Second-half volume must exceed first-half volume by this ratio.
    #[serde(default = "default_momentum_volume_increase")]
    pub volume_increase_ratio: f64,
}

impl Default for MomentumConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty MomentumConfig deserialises")
    }
}

fn default_mr_min_deviation() -> f64 {
    3.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MeanReversionConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Minimum deviation from the 24 h mean.
    #[serde(default = "default_mr_min_deviation")]
    pub min_deviation_pct: f64,
}

impl Default for MeanReversionConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty MeanReversionConfig deserialises")
    }
}

fn default_outlier_lookback() -> usize {
    20
}
fn default_outlier_max_deviation() -> f64 {
    10.0
}
fn default_outlier_min_volume_ratio() -> f64 {
    0.1
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutlierConfig {
    #[serde(default = "default_outlier_lookback")]
    pub lookback_bars: usize,
    #[serde(default = "default_outlier_max_deviation")]
    pub max_deviation_pct: f64,
    #[serde(default = "default_outlier_min_volume_ratio")]
    pub min_volume_ratio: f64,
}

impl Default for OutlierConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty OutlierConfig deserialises")
    }
}

fn default_zero_trigger_cycles() -> u32 {
    12
}
fn default_loosen_15m_delta() -> f64 {
    0.4
}
fn default_loosen_60m_delta() -> f64 {
    0.8
}
fn default_floor_15m() -> f64 {
    1.2
}
fn default_floor_60m() -> f64 {
    2.5
}

/// One-shot loosening of the chop thresholds after a dry spell.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AutoTuneConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_zero_trigger_cycles")]
    pub zero_trigger_cycles: u32,
    #[serde(default = "default_loosen_15m_delta")]
    pub loosen_15m_delta_pct: f64,
    #[serde(default = "default_loosen_60m_delta")]
    pub loosen_60m_delta_pct: f64,
    /// Hard floors: thresholds never loosen past these.
    #[serde(default = "default_floor_15m")]
    pub floor_15m_pct: f64,
    #[serde(default = "default_floor_60m")]
    pub floor_60m_pct: f64,
}

impl Default for AutoTuneConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty AutoTuneConfig deserialises")
    }
}

fn default_bull_boost() -> f64 {
    0.05
}
fn default_bear_penalty() -> f64 {
    0.05
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SignalsConfig {
    #[serde(default)]
    pub price_move: PriceMoveConfig,
    #[serde(default)]
    pub momentum: MomentumConfig,
    #[serde(default)]
    pub mean_reversion: MeanReversionConfig,
    #[serde(default)]
    pub outlier: OutlierConfig,
    #[serde(default)]
    pub auto_tune: AutoTuneConfig,
    /// Confidence adjustment applied to buy-side signals in a bull regime.
    #[serde(default = "default_bull_boost")]
    pub bull_confidence_boost: f64,
    /// Confidence penalty applied to buy-side signals in a bear regime.
    #[serde(default = "default_bear_penalty")]
    pub bear_confidence_penalty: f64,
}

impl Default for SignalsConfig {
    fn default() -> Self {
        serde_yaml::from_str("{}").expect("empty SignalsConfig deserialises")
    }
}

// =============================================================================
// strategies.yaml
// =============================================================================

fn default_strategy_size_pct() -> f64 {
    2.0
}
fn default_strategy_min_confidence() -> f64 {
    0.55
}
fn default_strategy_at_risk() -> f64 {
    10.0
}
fn default_strategy_trades_per_cycle() -> u32 {
    2
}
fn default_stop_loss_pct() -> f64 {
    5.0
}
fn default_take_profit_pct() -> f64 {
    9.0
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StrategyEntry {
    pub name: String,
    /// Strategy kind: trigger_follow | dip_buyer | position_exit.
    pub kind: String,
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_strategy_size_pct")]
    pub size_pct: f64,
    #[serde(default = "default_strategy_min_confidence")]
    pub min_confidence: f64,
    /// Open exposure attributable to this strategy, % of NAV.
    #[serde(default = "default_strategy_at_risk")]
    pub max_at_risk_pct: f64,
    #[serde(default = "default_strategy_trades_per_cycle")]
    pub max_trades_per_cycle: u32,
    #[serde(default = "default_stop_loss_pct")]
    pub stop_loss_pct: f64,
    #[serde(default = "default_take_profit_pct")]
    pub take_profit_pct: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdvisorConfig {
    /// External proposal source (AI advisor). Ships disabled.
    #[serde(default)]
    pub enabled: bool,
}

impl Default for AdvisorConfig {
    fn default() -> Self {
        Self { enabled: false }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StrategiesConfig {
    #[serde(default)]
    pub strategies: Vec<StrategyEntry>,
    #[serde(default)]
    pub advisor: AdvisorConfig,
}

// =============================================================================
// Merged Config
// =============================================================================

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    pub app: AppConfig,
    pub policy: PolicyConfig,
    pub universe: UniverseConfig,
    pub signals: SignalsConfig,
    pub strategies: StrategiesConfig,
}

impl Config {
    /// Load all five YAML files from `dir`. Missing files fall back to
    /// defaults with a warning; malformed files are hard errors.
    pub fn load_dir(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();

        let config = Self {
            app: load_yaml(dir.join("app.yaml"))?,
            policy: load_yaml(dir.join("policy.yaml"))?,
            universe: load_yaml(dir.join("universe.yaml"))?,
            signals: load_yaml(dir.join("signals.yaml"))?,
            strategies: load_yaml(dir.join("strategies.yaml"))?,
        };

        info!(
            dir = %dir.display(),
            mode = %config.app.mode,
            hash = %config.hash(),
            "configuration loaded"
        );

        Ok(config)
    }

    /// SHA-256 over the canonical JSON form of the merged config. Stamped
    /// into every audit record so a run can be tied to the exact config.
    pub fn hash(&self) -> String {
        let json = serde_json::to_vec(self).expect("config serialises");
        let mut hasher = Sha256::new();
        hasher.update(&json);
        hex::encode(hasher.finalize())[..16].to_string()
    }

    /// Cross-field sanity gate. Schema validation alone cannot catch these;
    /// a failure here refuses startup.
    pub fn validate(&self) -> Result<()> {
        let r = &self.policy.risk;
        let e = &self.policy.execution;

        if r.daily_stop_loss_pct <= 0.0 || r.weekly_stop_loss_pct <= 0.0 {
            bail!("stop-loss percentages must be positive");
        }
        if r.daily_stop_loss_pct >= r.weekly_stop_loss_pct {
            bail!(
                "daily stop ({}%) must be tighter than weekly stop ({}%)",
                r.daily_stop_loss_pct,
                r.weekly_stop_loss_pct
            );
        }
        if r.pyramiding_enabled && r.max_adds_per_asset_per_day == 0 {
            bail!("pyramiding enabled but max_adds_per_asset_per_day is 0");
        }
        if r.max_open_positions as f64 * r.max_position_size_pct
            > r.max_total_at_risk_pct + 1e-9
        {
            bail!(
                "max_open_positions ({}) x max_position_size_pct ({}%) exceeds max_total_at_risk_pct ({}%)",
                r.max_open_positions,
                r.max_position_size_pct,
                r.max_total_at_risk_pct
            );
        }
        if r.max_single_trade_pct > r.max_position_size_pct {
            bail!("max_single_trade_pct exceeds max_position_size_pct");
        }
        if e.min_order_notional_usd > r.min_trade_notional_usd {
            bail!(
                "execution min_order_notional_usd ({}) exceeds risk min_trade_notional_usd ({})",
                e.min_order_notional_usd,
                r.min_trade_notional_usd
            );
        }
        if !(0.0..=0.5).contains(&e.partial_fill_tolerance) {
            bail!("partial_fill_tolerance must be within [0, 0.5]");
        }
        if e.max_slippage_bps <= 0.0 {
            bail!("max_slippage_bps must be positive");
        }
        if self.app.loop_jitter_pct > 0.5 {
            bail!("loop_jitter_pct above 0.5 makes the loop interval meaningless");
        }
        for (name, cap) in &r.cluster_caps_pct {
            if !r.clusters.contains_key(name) {
                bail!("cluster cap for '{name}' has no cluster member list");
            }
            if *cap <= 0.0 {
                bail!("cluster cap for '{name}' must be positive");
            }
        }
        for s in &self.strategies.strategies {
            if s.stop_loss_pct >= s.take_profit_pct {
                bail!(
                    "strategy '{}': stop_loss_pct ({}%) must be below take_profit_pct ({}%)",
                    s.name,
                    s.stop_loss_pct,
                    s.take_profit_pct
                );
            }
        }
        let t = &self.signals.auto_tune;
        if t.floor_15m_pct > self.signals.price_move.chop_move_15m_pct
            || t.floor_60m_pct > self.signals.price_move.chop_move_60m_pct
        {
            bail!("auto-tune floors must not exceed the base chop thresholds");
        }
        for i in 0..3 {
            if self.universe.tier_max_spread_bps[i] <= 0.0
                || self.universe.tier_min_depth_usd[i] <= 0.0
                || self.universe.tier_min_volume_usd[i] <= 0.0
            {
                bail!("tier thresholds must be positive");
            }
        }
        Ok(())
    }
}

fn load_yaml<T: for<'de> Deserialize<'de> + Default>(path: std::path::PathBuf) -> Result<T> {
    if !path.exists() {
        tracing::warn!(path = %path.display(), "config file missing, using defaults");
        return Ok(T::default());
    }
    let content = std::fs::read_to_string(&path)
        .with_context(|| format!("failed to read config from {}", path.display()))?;
    serde_yaml::from_str(&content)
        .with_context(|| format!("failed to parse config from {}", path.display()))
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_pass_validation() {
        let cfg = Config::default();
        cfg.validate().unwrap();
    }

    #[test]
    fn default_mode_is_dry_run() {
        let cfg = Config::default();
        assert_eq!(cfg.app.mode, ExecutionMode::DryRun);
        assert!(!cfg.strategies.advisor.enabled);
    }

    #[test]
    fn daily_stop_must_be_tighter_than_weekly() {
        let mut cfg = Config::default();
        cfg.policy.risk.daily_stop_loss_pct = 9.0;
        cfg.policy.risk.weekly_stop_loss_pct = 8.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn pyramiding_without_adds_is_rejected() {
        let mut cfg = Config::default();
        cfg.policy.risk.pyramiding_enabled = true;
        cfg.policy.risk.max_adds_per_asset_per_day = 0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn position_cap_product_must_fit_total_cap() {
        let mut cfg = Config::default();
        cfg.policy.risk.max_open_positions = 10;
        cfg.policy.risk.max_position_size_pct = 5.0;
        cfg.policy.risk.max_total_at_risk_pct = 25.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn execution_min_must_not_exceed_risk_min() {
        let mut cfg = Config::default();
        cfg.policy.execution.min_order_notional_usd = 50.0;
        cfg.policy.risk.min_trade_notional_usd = 10.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn auto_tune_floor_above_base_is_rejected() {
        let mut cfg = Config::default();
        cfg.signals.auto_tune.floor_15m_pct = 5.0;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn strategy_stop_above_take_profit_is_rejected() {
        let mut cfg = Config::default();
        cfg.strategies.strategies.push(StrategyEntry {
            name: "bad".into(),
            kind: "trigger_follow".into(),
            enabled: true,
            size_pct: 2.0,
            min_confidence: 0.5,
            max_at_risk_pct: 10.0,
            max_trades_per_cycle: 2,
            stop_loss_pct: 10.0,
            take_profit_pct: 5.0,
        });
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn empty_yaml_deserialises_with_defaults() {
        let policy: PolicyConfig = serde_yaml::from_str("{}").unwrap();
        assert!((policy.risk.max_total_at_risk_pct - 25.0).abs() < f64::EPSILON);
        assert_eq!(policy.execution.cancel_after_seconds, 60);
        assert_eq!(policy.alerts.escalation_seconds, 120);
    }

    #[test]
    fn partial_yaml_fills_defaults() {
        let yaml = "risk:\n  max_trades_per_day: 10\n";
        let policy: PolicyConfig = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(policy.risk.max_trades_per_day, 10);
        assert_eq!(policy.risk.max_trades_per_hour, 6);
    }

    #[test]
    fn config_hash_is_stable_and_sensitive() {
        let cfg = Config::default();
        let h1 = cfg.hash();
        let h2 = cfg.hash();
        assert_eq!(h1, h2);

        let mut changed = cfg.clone();
        changed.policy.risk.max_trades_per_day = 99;
        assert_ne!(h1, changed.hash());
    }
}
