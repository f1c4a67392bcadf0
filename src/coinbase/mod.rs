// =============================================================================
// Coinbase Advanced Trade adapter — shared types, error taxonomy, and the
// ExchangeApi seam the rest of the engine is written against
// =============================================================================

pub mod client;
pub mod rate_limit;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::types::Side;

// ---------------------------------------------------------------------------
// Error taxonomy
// ---------------------------------------------------------------------------

/// Classified exchange errors. The risk engine and metrics rely on the
/// classification, never on string matching.
#[derive(Debug, thiserror::Error)]
pub enum ExchangeError {
    #[error("request timed out")]
    Timeout,

    #[error("rate limited by exchange")]
    RateLimited,

    #[error("exchange returned {status}: {body}")]
    Http { status: u16, body: String },

    /// 4xx with a business reason. The full error response is preserved for
    /// the ORDER_REJECT log.
    #[error("order rejected: {code} {message}")]
    Rejected {
        code: String,
        message: String,
        preview_failure_reason: Option<String>,
        raw: serde_json::Value,
    },

    #[error("failed to parse exchange response: {0}")]
    Parse(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("adapter is read-only; mutating call refused")]
    ReadOnly,
}

impl ExchangeError {
    /// Transient errors feed the consecutive-error counter and are retried
    /// once inside the adapter.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::RateLimited | Self::Transport(_)
        ) || matches!(self, Self::Http { status, .. } if *status >= 500)
    }

    /// Normalized error type for metrics. Bounded vocabulary (7 values).
    pub fn error_type(&self) -> &'static str {
        match self {
            Self::Timeout => "timeout",
            Self::RateLimited => "rate_limited",
            Self::Http { status, .. } if *status >= 500 => "server",
            Self::Http { .. } => "client",
            Self::Rejected { .. } => "rejected",
            Self::Parse(_) => "parse",
            Self::Auth(_) | Self::ReadOnly => "auth",
            Self::Transport(_) => "transport",
        }
    }
}

// ---------------------------------------------------------------------------
// Market data types
// ---------------------------------------------------------------------------

/// Per-product trading status as reported by the exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ProductStatus {
    Online,
    PostOnly,
    LimitOnly,
    CancelOnly,
    Offline,
    Unknown,
}

impl ProductStatus {
    pub fn from_api(s: &str) -> Self {
        match s {
            "online" | "ONLINE" => Self::Online,
            "POST_ONLY" => Self::PostOnly,
            "LIMIT_ONLY" => Self::LimitOnly,
            "CANCEL_ONLY" => Self::CancelOnly,
            "offline" | "OFFLINE" | "delisted" => Self::Offline,
            _ => Self::Unknown,
        }
    }

    /// Whether new orders in both directions are accepted.
    pub fn tradable(self) -> bool {
        self == Self::Online
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Product {
    pub product_id: String,
    pub status: ProductStatus,
    /// Smallest base-size increment.
    pub lot_size: f64,
    /// Smallest price increment.
    pub tick_size: f64,
    pub min_notional_usd: f64,
    pub volume_24h_usd: f64,
    pub price: f64,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct QuoteTick {
    pub bid: f64,
    pub ask: f64,
    pub ts: DateTime<Utc>,
}

impl QuoteTick {
    pub fn mid(&self) -> f64 {
        (self.bid + self.ask) / 2.0
    }

    pub fn spread_bps(&self) -> f64 {
        let mid = self.mid();
        if mid <= 0.0 {
            return f64::MAX;
        }
        (self.ask - self.bid) / mid * 10_000.0
    }
}

/// Top-of-book depth. Price/size pairs sorted best-first.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct OrderBook {
    pub bids: Vec<(f64, f64)>,
    pub asks: Vec<(f64, f64)>,
}

impl OrderBook {
    /// USD value resting within the first `levels` on the thinner side.
    pub fn top_depth_usd(&self, levels: usize) -> f64 {
        let side_value = |side: &[(f64, f64)]| {
            side.iter()
                .take(levels)
                .map(|(price, size)| price * size)
                .sum::<f64>()
        };
        side_value(&self.bids).min(side_value(&self.asks))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    /// Bar start, unix seconds.
    pub start: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub currency: String,
    #[serde(default)]
    pub available: f64,
    #[serde(default)]
    pub hold: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Liquidity {
    Maker,
    Taker,
}

/// A single execution as reported by the exchange.
///
/// When `size_in_quote` is true the `size` field is denominated in the QUOTE
/// currency (USD), not base units. Consumers must check the flag before
/// assigning meaning to `size`; see `parsed_quantities`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Fill {
    pub entry_id: String,
    pub trade_id: String,
    pub order_id: String,
    pub product_id: String,
    pub trade_time: DateTime<Utc>,
    pub price: f64,
    pub size: f64,
    pub size_in_quote: bool,
    pub commission: f64,
    pub liquidity_indicator: Liquidity,
    pub side: Side,
}

impl Fill {
    /// Resolve the fill into (base_quantity, quote_notional), honouring the
    /// size_in_quote flag. Returns None when the fill price is unusable.
    pub fn parsed_quantities(&self) -> Option<(f64, f64)> {
        if self.price <= 0.0 {
            return None;
        }
        if self.size_in_quote {
            Some((self.size / self.price, self.size))
        } else {
            Some((self.size, self.size * self.price))
        }
    }
}

// ---------------------------------------------------------------------------
// Order placement types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type")]
pub enum OrderKind {
    /// Maker-only limit; rejected by the exchange if it would cross.
    PostOnlyLimit { price: f64, size_base: f64 },
    /// Immediate-or-cancel limit; any remainder is canceled.
    IocLimit { price: f64, size_base: f64 },
    /// Market order sized in quote currency.
    Market { quote_size: f64 },
}

impl OrderKind {
    pub fn label(&self) -> &'static str {
        match self {
            Self::PostOnlyLimit { .. } => "post_only_limit",
            Self::IocLimit { .. } => "ioc_limit",
            Self::Market { .. } => "market",
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    /// Client-assigned id, stable across retries of the same placement.
    pub client_order_id: String,
    pub product_id: String,
    pub side: Side,
    pub kind: OrderKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlaceOrderResponse {
    pub order_id: Option<String>,
    pub error: Option<String>,
    pub error_response: Option<serde_json::Value>,
}

impl PlaceOrderResponse {
    pub fn accepted(&self) -> bool {
        self.order_id.is_some() && self.error.is_none()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OpenOrder {
    pub order_id: String,
    pub client_order_id: String,
    pub product_id: String,
    pub side: Side,
    pub price: f64,
    pub size_base: f64,
    pub filled_size: f64,
}

// ---------------------------------------------------------------------------
// The adapter seam
// ---------------------------------------------------------------------------

/// Exchange operations the engine depends on. The live REST client, the
/// backtest data provider, and test doubles all implement this.
#[async_trait]
pub trait ExchangeApi: Send + Sync {
    async fn list_products(&self) -> Result<Vec<Product>, ExchangeError>;

    async fn get_quote(&self, product_id: &str) -> Result<QuoteTick, ExchangeError>;

    async fn get_orderbook(&self, product_id: &str) -> Result<OrderBook, ExchangeError>;

    /// Most-recent-last candles at the given granularity.
    async fn get_ohlcv(
        &self,
        product_id: &str,
        granularity_secs: u32,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError>;

    async fn get_accounts(&self) -> Result<Vec<Balance>, ExchangeError>;

    async fn place_order(&self, req: &OrderRequest) -> Result<PlaceOrderResponse, ExchangeError>;

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError>;

    /// Batch cancel; returns the ids that were accepted for cancellation.
    async fn cancel_orders(&self, order_ids: &[String]) -> Result<Vec<String>, ExchangeError>;

    async fn list_open_orders(&self) -> Result<Vec<OpenOrder>, ExchangeError>;

    async fn list_fills(
        &self,
        product_id: Option<&str>,
        start_time: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Fill>, ExchangeError>;

    async fn get_server_time(&self) -> Result<DateTime<Utc>, ExchangeError>;

    /// When true, every mutating call fails with ExchangeError::ReadOnly.
    fn read_only(&self) -> bool;

    /// Consecutive failed private API calls; resets to zero on success.
    fn consecutive_errors(&self) -> u32;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn size_in_quote_resolves_to_base_and_notional() {
        let fill = Fill {
            entry_id: "e1".into(),
            trade_id: "t1".into(),
            order_id: "o1".into(),
            product_id: "ETH-USD".into(),
            trade_time: Utc::now(),
            price: 2975.32,
            size: 2.6399716828,
            size_in_quote: true,
            commission: 0.02,
            liquidity_indicator: Liquidity::Taker,
            side: Side::Buy,
        };
        let (base, quote) = fill.parsed_quantities().unwrap();
        assert!((quote - 2.6399716828).abs() < 1e-9);
        assert!((base - 2.6399716828 / 2975.32).abs() < 1e-9);
        // The dangerous misread: treating size as base units.
        assert!(base < 0.001, "base quantity must not be 2.64 ETH");
    }

    #[test]
    fn size_in_base_resolves_directly() {
        let fill = Fill {
            entry_id: "e2".into(),
            trade_id: "t2".into(),
            order_id: "o2".into(),
            product_id: "SOL-USD".into(),
            trade_time: Utc::now(),
            price: 100.10,
            size: 0.199,
            size_in_quote: false,
            commission: 0.12,
            liquidity_indicator: Liquidity::Taker,
            side: Side::Buy,
        };
        let (base, quote) = fill.parsed_quantities().unwrap();
        assert!((base - 0.199).abs() < 1e-12);
        assert!((quote - 0.199 * 100.10).abs() < 1e-9);
    }

    #[test]
    fn zero_price_fill_is_unusable() {
        let fill = Fill {
            entry_id: "e3".into(),
            trade_id: "t3".into(),
            order_id: "o3".into(),
            product_id: "BTC-USD".into(),
            trade_time: Utc::now(),
            price: 0.0,
            size: 1.0,
            size_in_quote: true,
            commission: 0.0,
            liquidity_indicator: Liquidity::Maker,
            side: Side::Buy,
        };
        assert!(fill.parsed_quantities().is_none());
    }

    #[test]
    fn error_type_vocabulary_is_bounded() {
        let errors: Vec<ExchangeError> = vec![
            ExchangeError::Timeout,
            ExchangeError::RateLimited,
            ExchangeError::Http { status: 503, body: String::new() },
            ExchangeError::Http { status: 404, body: String::new() },
            ExchangeError::Rejected {
                code: "INSUFFICIENT_FUND".into(),
                message: String::new(),
                preview_failure_reason: None,
                raw: serde_json::Value::Null,
            },
            ExchangeError::Parse("x".into()),
            ExchangeError::Auth("x".into()),
            ExchangeError::Transport("x".into()),
            ExchangeError::ReadOnly,
        ];
        let types: std::collections::HashSet<&str> =
            errors.iter().map(|e| e.error_type()).collect();
        assert!(types.len() <= 7, "error_type cardinality must stay bounded");
    }

    #[test]
    fn transient_classification() {
        assert!(ExchangeError::Timeout.is_transient());
        assert!(ExchangeError::Http { status: 502, body: String::new() }.is_transient());
        assert!(!ExchangeError::Http { status: 400, body: String::new() }.is_transient());
        assert!(!ExchangeError::ReadOnly.is_transient());
    }

    #[test]
    fn orderbook_depth_uses_thinner_side() {
        let book = OrderBook {
            bids: vec![(100.0, 2.0), (99.0, 2.0)],
            asks: vec![(101.0, 0.5)],
        };
        // bids: 398, asks: 50.5 -> thinner side wins
        assert!((book.top_depth_usd(10) - 50.5).abs() < 1e-9);
    }

    #[test]
    fn product_status_mapping() {
        assert_eq!(ProductStatus::from_api("online"), ProductStatus::Online);
        assert_eq!(ProductStatus::from_api("POST_ONLY"), ProductStatus::PostOnly);
        assert_eq!(ProductStatus::from_api("weird"), ProductStatus::Unknown);
        assert!(ProductStatus::Online.tradable());
        assert!(!ProductStatus::CancelOnly.tradable());
    }
}
