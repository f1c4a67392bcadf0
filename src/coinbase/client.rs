// =============================================================================
// Coinbase Advanced Trade REST client — HMAC-SHA256 signed requests
// =============================================================================
//
// SECURITY: the secret is never logged or serialized. Signed requests carry
// CB-ACCESS-KEY / CB-ACCESS-SIGN / CB-ACCESS-TIMESTAMP headers; the signature
// covers timestamp + method + path + body.
//
// Transient failures (timeout, 5xx, 429) are retried exactly once with a
// short backoff; the consecutive-error counter feeds the connectivity
// circuit breaker in the risk engine.
// =============================================================================

use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use sha2::Sha256;
use tracing::{debug, instrument, warn};

use super::rate_limit::{EndpointClass, RateLimiter};
use super::{
    Balance, Candle, ExchangeApi, ExchangeError, Fill, Liquidity, OpenOrder, OrderBook,
    OrderKind, OrderRequest, PlaceOrderResponse, Product, ProductStatus, QuoteTick,
};
use crate::types::Side;

type HmacSha256 = Hmac<Sha256>;

const BASE_URL: &str = "https://api.coinbase.com";
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
const RETRY_BACKOFF: Duration = Duration::from_millis(750);

pub struct CoinbaseClient {
    api_key: String,
    api_secret: String,
    base_url: String,
    client: reqwest::Client,
    limiter: RateLimiter,
    read_only: bool,
    consecutive_errors: AtomicU32,
}

impl CoinbaseClient {
    /// # Arguments
    /// * `api_key` / `api_secret` — credentials from the environment. May be
    ///   empty for public-data-only use (dry-run / paper market data).
    /// * `read_only` — when true every mutating call is refused locally.
    pub fn new(api_key: impl Into<String>, api_secret: impl Into<String>, read_only: bool) -> Self {
        let client = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .expect("failed to build reqwest client");

        debug!(read_only, "CoinbaseClient initialised (base_url={BASE_URL})");

        Self {
            api_key: api_key.into(),
            api_secret: api_secret.into(),
            base_url: BASE_URL.to_string(),
            client,
            limiter: RateLimiter::coinbase_defaults(),
            read_only,
            consecutive_errors: AtomicU32::new(0),
        }
    }

    pub fn has_credentials(&self) -> bool {
        !self.api_key.is_empty() && !self.api_secret.is_empty()
    }

    // -------------------------------------------------------------------------
    // Signing
    // -------------------------------------------------------------------------

    fn sign(&self, timestamp: &str, method: &str, path: &str, body: &str) -> String {
        let payload = format!("{timestamp}{method}{path}{body}");
        let mut mac = HmacSha256::new_from_slice(self.api_secret.as_bytes())
            .expect("HMAC accepts any key size");
        mac.update(payload.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    // -------------------------------------------------------------------------
    // Request plumbing
    // -------------------------------------------------------------------------

    /// Send one request with rate limiting and a single transient retry.
    async fn request(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<serde_json::Value>,
        class: EndpointClass,
    ) -> Result<serde_json::Value, ExchangeError> {
        let mut attempt = 0u8;
        loop {
            attempt += 1;
            match self.request_once(method.clone(), path, body.as_ref(), class).await {
                Ok(value) => {
                    self.consecutive_errors.store(0, Ordering::Relaxed);
                    return Ok(value);
                }
                Err(e) => {
                    if e.is_transient() {
                        self.consecutive_errors.fetch_add(1, Ordering::Relaxed);
                    }
                    if e.is_transient() && attempt == 1 {
                        warn!(path, error = %e, "transient exchange error, retrying once");
                        tokio::time::sleep(RETRY_BACKOFF).await;
                        continue;
                    }
                    return Err(e);
                }
            }
        }
    }

    async fn request_once(
        &self,
        method: reqwest::Method,
        path: &str,
        body: Option<&serde_json::Value>,
        class: EndpointClass,
    ) -> Result<serde_json::Value, ExchangeError> {
        self.limiter.acquire(class).await;

        let url = format!("{}{}", self.base_url, path);
        let body_str = body.map(|b| b.to_string()).unwrap_or_default();

        let mut req = self.client.request(method.clone(), &url);

        if class == EndpointClass::Private {
            if !self.has_credentials() {
                return Err(ExchangeError::Auth("missing API credentials".into()));
            }
            // Signature covers the path without the query string's host part.
            let sign_path = path.split('?').next().unwrap_or(path);
            let timestamp = Utc::now().timestamp().to_string();
            let signature = self.sign(&timestamp, method.as_str(), sign_path, &body_str);
            req = req
                .header("CB-ACCESS-KEY", &self.api_key)
                .header("CB-ACCESS-SIGN", signature)
                .header("CB-ACCESS-TIMESTAMP", timestamp);
        }

        if body.is_some() {
            req = req
                .header("Content-Type", "application/json")
                .body(body_str.clone());
        }

        let resp = req.send().await.map_err(|e| {
            if e.is_timeout() {
                ExchangeError::Timeout
            } else {
                ExchangeError::Transport(e.to_string())
            }
        })?;

        let status = resp.status();
        let text = resp
            .text()
            .await
            .map_err(|e| ExchangeError::Transport(e.to_string()))?;

        if status.as_u16() == 429 {
            return Err(ExchangeError::RateLimited);
        }
        if status.as_u16() == 401 || status.as_u16() == 403 {
            return Err(ExchangeError::Auth(text));
        }
        if !status.is_success() {
            return Err(ExchangeError::Http {
                status: status.as_u16(),
                body: text,
            });
        }

        serde_json::from_str(&text).map_err(|e| ExchangeError::Parse(e.to_string()))
    }

    // -------------------------------------------------------------------------
    // Parse helpers
    // -------------------------------------------------------------------------

    /// Parse a JSON value that may be either a string or a number into `f64`.
    fn parse_f64(val: &serde_json::Value) -> Result<f64, ExchangeError> {
        if let Some(s) = val.as_str() {
            s.parse::<f64>()
                .map_err(|_| ExchangeError::Parse(format!("failed to parse '{s}' as f64")))
        } else if let Some(n) = val.as_f64() {
            Ok(n)
        } else if val.is_null() {
            Ok(0.0)
        } else {
            Err(ExchangeError::Parse(format!(
                "expected string or number, got: {val}"
            )))
        }
    }

    fn granularity_label(secs: u32) -> &'static str {
        match secs {
            60 => "ONE_MINUTE",
            300 => "FIVE_MINUTE",
            900 => "FIFTEEN_MINUTE",
            1800 => "THIRTY_MINUTE",
            3600 => "ONE_HOUR",
            21600 => "SIX_HOUR",
            86400 => "ONE_DAY",
            _ => "FIFTEEN_MINUTE",
        }
    }
}

#[async_trait]
impl ExchangeApi for CoinbaseClient {
    #[instrument(skip(self), name = "coinbase::list_products")]
    async fn list_products(&self) -> Result<Vec<Product>, ExchangeError> {
        let body = self
            .request(
                reqwest::Method::GET,
                "/api/v3/brokerage/market/products?product_type=SPOT",
                None,
                EndpointClass::Public,
            )
            .await?;

        let raw = body["products"]
            .as_array()
            .ok_or_else(|| ExchangeError::Parse("products response missing 'products'".into()))?;

        let mut products = Vec::with_capacity(raw.len());
        for p in raw {
            let product_id = match p["product_id"].as_str() {
                Some(id) => id.to_string(),
                None => continue,
            };
            products.push(Product {
                product_id,
                status: ProductStatus::from_api(p["status"].as_str().unwrap_or("")),
                lot_size: Self::parse_f64(&p["base_increment"]).unwrap_or(0.0),
                tick_size: Self::parse_f64(&p["quote_increment"]).unwrap_or(0.0),
                min_notional_usd: Self::parse_f64(&p["quote_min_size"]).unwrap_or(1.0),
                volume_24h_usd: Self::parse_f64(&p["approximate_quote_24h_volume"])
                    .or_else(|_| Self::parse_f64(&p["volume_24h"]))
                    .unwrap_or(0.0),
                price: Self::parse_f64(&p["price"]).unwrap_or(0.0),
            });
        }

        debug!(count = products.len(), "products fetched");
        Ok(products)
    }

    #[instrument(skip(self), name = "coinbase::get_quote")]
    async fn get_quote(&self, product_id: &str) -> Result<QuoteTick, ExchangeError> {
        let path = format!(
            "/api/v3/brokerage/market/product_book?product_id={product_id}&limit=1"
        );
        let body = self
            .request(reqwest::Method::GET, &path, None, EndpointClass::Public)
            .await?;

        let pricebook = &body["pricebook"];
        let bid = pricebook["bids"]
            .as_array()
            .and_then(|b| b.first())
            .map(|l| Self::parse_f64(&l["price"]))
            .transpose()?
            .unwrap_or(0.0);
        let ask = pricebook["asks"]
            .as_array()
            .and_then(|a| a.first())
            .map(|l| Self::parse_f64(&l["price"]))
            .transpose()?
            .unwrap_or(0.0);

        if bid <= 0.0 || ask <= 0.0 {
            return Err(ExchangeError::Parse(format!(
                "empty book for {product_id}"
            )));
        }

        Ok(QuoteTick { bid, ask, ts: Utc::now() })
    }

    #[instrument(skip(self), name = "coinbase::get_orderbook")]
    async fn get_orderbook(&self, product_id: &str) -> Result<OrderBook, ExchangeError> {
        let path = format!(
            "/api/v3/brokerage/market/product_book?product_id={product_id}&limit=10"
        );
        let body = self
            .request(reqwest::Method::GET, &path, None, EndpointClass::Public)
            .await?;

        let parse_side = |levels: &serde_json::Value| -> Result<Vec<(f64, f64)>, ExchangeError> {
            let mut out = Vec::new();
            if let Some(arr) = levels.as_array() {
                for l in arr {
                    out.push((Self::parse_f64(&l["price"])?, Self::parse_f64(&l["size"])?));
                }
            }
            Ok(out)
        };

        Ok(OrderBook {
            bids: parse_side(&body["pricebook"]["bids"])?,
            asks: parse_side(&body["pricebook"]["asks"])?,
        })
    }

    #[instrument(skip(self), name = "coinbase::get_ohlcv")]
    async fn get_ohlcv(
        &self,
        product_id: &str,
        granularity_secs: u32,
        limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        let end = Utc::now().timestamp();
        let start = end - (granularity_secs as i64 * limit as i64);
        let path = format!(
            "/api/v3/brokerage/market/products/{product_id}/candles?start={start}&end={end}&granularity={}",
            Self::granularity_label(granularity_secs)
        );
        let body = self
            .request(reqwest::Method::GET, &path, None, EndpointClass::Public)
            .await?;

        let raw = body["candles"]
            .as_array()
            .ok_or_else(|| ExchangeError::Parse("candles response missing 'candles'".into()))?;

        let mut candles = Vec::with_capacity(raw.len());
        for c in raw {
            candles.push(Candle {
                start: c["start"]
                    .as_str()
                    .and_then(|s| s.parse().ok())
                    .or_else(|| c["start"].as_i64())
                    .unwrap_or(0),
                open: Self::parse_f64(&c["open"])?,
                high: Self::parse_f64(&c["high"])?,
                low: Self::parse_f64(&c["low"])?,
                close: Self::parse_f64(&c["close"])?,
                volume: Self::parse_f64(&c["volume"])?,
            });
        }

        // Coinbase returns newest-first; the engine expects oldest-first.
        candles.sort_by_key(|c| c.start);
        debug!(product_id, count = candles.len(), "candles fetched");
        Ok(candles)
    }

    #[instrument(skip(self), name = "coinbase::get_accounts")]
    async fn get_accounts(&self) -> Result<Vec<Balance>, ExchangeError> {
        let body = self
            .request(
                reqwest::Method::GET,
                "/api/v3/brokerage/accounts?limit=250",
                None,
                EndpointClass::Private,
            )
            .await?;

        let raw = body["accounts"]
            .as_array()
            .ok_or_else(|| ExchangeError::Parse("accounts response missing 'accounts'".into()))?;

        let mut balances = Vec::new();
        for a in raw {
            let currency = a["currency"].as_str().unwrap_or("").to_string();
            let available = Self::parse_f64(&a["available_balance"]["value"]).unwrap_or(0.0);
            let hold = Self::parse_f64(&a["hold"]["value"]).unwrap_or(0.0);
            if !currency.is_empty() && (available > 0.0 || hold > 0.0) {
                balances.push(Balance { currency, available, hold });
            }
        }

        debug!(count = balances.len(), "accounts fetched");
        Ok(balances)
    }

    #[instrument(skip(self, req), name = "coinbase::place_order", fields(product_id = %req.product_id, side = %req.side))]
    async fn place_order(&self, req: &OrderRequest) -> Result<PlaceOrderResponse, ExchangeError> {
        if self.read_only {
            return Err(ExchangeError::ReadOnly);
        }

        let order_configuration = match &req.kind {
            OrderKind::PostOnlyLimit { price, size_base } => serde_json::json!({
                "limit_limit_gtc": {
                    "base_size": format!("{size_base}"),
                    "limit_price": format!("{price}"),
                    "post_only": true,
                }
            }),
            OrderKind::IocLimit { price, size_base } => serde_json::json!({
                "sor_limit_ioc": {
                    "base_size": format!("{size_base}"),
                    "limit_price": format!("{price}"),
                }
            }),
            OrderKind::Market { quote_size } => serde_json::json!({
                "market_market_ioc": {
                    "quote_size": format!("{quote_size}"),
                }
            }),
        };

        let payload = serde_json::json!({
            "client_order_id": req.client_order_id,
            "product_id": req.product_id,
            "side": req.side.to_string(),
            "order_configuration": order_configuration,
        });

        let body = self
            .request(
                reqwest::Method::POST,
                "/api/v3/brokerage/orders",
                Some(payload),
                EndpointClass::Private,
            )
            .await?;

        if body["success"].as_bool() == Some(false) {
            let err = &body["error_response"];
            return Ok(PlaceOrderResponse {
                order_id: None,
                error: Some(
                    err["error"]
                        .as_str()
                        .or_else(|| err["message"].as_str())
                        .unwrap_or("unknown rejection")
                        .to_string(),
                ),
                error_response: Some(err.clone()),
            });
        }

        Ok(PlaceOrderResponse {
            order_id: body["success_response"]["order_id"]
                .as_str()
                .or_else(|| body["order_id"].as_str())
                .map(|s| s.to_string()),
            error: None,
            error_response: None,
        })
    }

    #[instrument(skip(self), name = "coinbase::cancel_order")]
    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError> {
        let canceled = self.cancel_orders(&[order_id.to_string()]).await?;
        if canceled.iter().any(|id| id == order_id) {
            Ok(())
        } else {
            Err(ExchangeError::Http {
                status: 400,
                body: format!("cancel of {order_id} not acknowledged"),
            })
        }
    }

    #[instrument(skip(self, order_ids), name = "coinbase::cancel_orders", fields(count = order_ids.len()))]
    async fn cancel_orders(&self, order_ids: &[String]) -> Result<Vec<String>, ExchangeError> {
        if self.read_only {
            return Err(ExchangeError::ReadOnly);
        }
        if order_ids.is_empty() {
            return Ok(Vec::new());
        }

        let payload = serde_json::json!({ "order_ids": order_ids });
        let body = self
            .request(
                reqwest::Method::POST,
                "/api/v3/brokerage/orders/batch_cancel",
                Some(payload),
                EndpointClass::Private,
            )
            .await?;

        let mut canceled = Vec::new();
        if let Some(results) = body["results"].as_array() {
            for r in results {
                if r["success"].as_bool() == Some(true) {
                    if let Some(id) = r["order_id"].as_str() {
                        canceled.push(id.to_string());
                    }
                }
            }
        }
        Ok(canceled)
    }

    #[instrument(skip(self), name = "coinbase::list_open_orders")]
    async fn list_open_orders(&self) -> Result<Vec<OpenOrder>, ExchangeError> {
        let body = self
            .request(
                reqwest::Method::GET,
                "/api/v3/brokerage/orders/historical/batch?order_status=OPEN&limit=250",
                None,
                EndpointClass::Private,
            )
            .await?;

        let raw = body["orders"].as_array().cloned().unwrap_or_default();
        let mut orders = Vec::with_capacity(raw.len());
        for o in &raw {
            let side = match o["side"].as_str() {
                Some("BUY") => Side::Buy,
                Some("SELL") => Side::Sell,
                _ => continue,
            };
            orders.push(OpenOrder {
                order_id: o["order_id"].as_str().unwrap_or("").to_string(),
                client_order_id: o["client_order_id"].as_str().unwrap_or("").to_string(),
                product_id: o["product_id"].as_str().unwrap_or("").to_string(),
                side,
                price: Self::parse_f64(&o["order_configuration"]["limit_limit_gtc"]["limit_price"])
                    .unwrap_or(0.0),
                size_base: Self::parse_f64(
                    &o["order_configuration"]["limit_limit_gtc"]["base_size"],
                )
                .unwrap_or(0.0),
                filled_size: Self::parse_f64(&o["filled_size"]).unwrap_or(0.0),
            });
        }

        debug!(count = orders.len(), "open orders fetched");
        Ok(orders)
    }

    #[instrument(skip(self), name = "coinbase::list_fills")]
    async fn list_fills(
        &self,
        product_id: Option<&str>,
        start_time: Option<DateTime<Utc>>,
        limit: u32,
    ) -> Result<Vec<Fill>, ExchangeError> {
        let mut path = format!("/api/v3/brokerage/orders/historical/fills?limit={limit}");
        if let Some(pid) = product_id {
            path.push_str(&format!("&product_id={pid}"));
        }
        if let Some(start) = start_time {
            path.push_str(&format!("&start_sequence_timestamp={}", start.to_rfc3339()));
        }

        let body = self
            .request(reqwest::Method::GET, &path, None, EndpointClass::Private)
            .await?;

        let raw = body["fills"].as_array().cloned().unwrap_or_default();
        let mut fills = Vec::with_capacity(raw.len());
        for f in &raw {
            let side = match f["side"].as_str() {
                Some("BUY") => Side::Buy,
                Some("SELL") => Side::Sell,
                _ => continue,
            };
            let liquidity = match f["liquidity_indicator"].as_str() {
                Some("MAKER") => Liquidity::Maker,
                _ => Liquidity::Taker,
            };
            fills.push(Fill {
                entry_id: f["entry_id"].as_str().unwrap_or("").to_string(),
                trade_id: f["trade_id"].as_str().unwrap_or("").to_string(),
                order_id: f["order_id"].as_str().unwrap_or("").to_string(),
                product_id: f["product_id"].as_str().unwrap_or("").to_string(),
                trade_time: f["trade_time"]
                    .as_str()
                    .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
                    .map(|t| t.with_timezone(&Utc))
                    .unwrap_or_else(Utc::now),
                price: Self::parse_f64(&f["price"])?,
                size: Self::parse_f64(&f["size"])?,
                size_in_quote: f["size_in_quote"].as_bool().unwrap_or(false),
                commission: Self::parse_f64(&f["commission"]).unwrap_or(0.0),
                liquidity_indicator: liquidity,
                side,
            });
        }

        debug!(count = fills.len(), "fills fetched");
        Ok(fills)
    }

    #[instrument(skip(self), name = "coinbase::get_server_time")]
    async fn get_server_time(&self) -> Result<DateTime<Utc>, ExchangeError> {
        let body = self
            .request(
                reqwest::Method::GET,
                "/api/v3/brokerage/time",
                None,
                EndpointClass::Public,
            )
            .await?;

        let epoch = body["epochSeconds"]
            .as_str()
            .and_then(|s| s.parse::<i64>().ok())
            .or_else(|| body["epochSeconds"].as_i64())
            .ok_or_else(|| ExchangeError::Parse("time response missing epochSeconds".into()))?;

        Utc.timestamp_opt(epoch, 0)
            .single()
            .ok_or_else(|| ExchangeError::Parse(format!("invalid epoch {epoch}")))
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::Relaxed)
    }
}

impl std::fmt::Debug for CoinbaseClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CoinbaseClient")
            .field("api_key", &"<redacted>")
            .field("api_secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .field("read_only", &self.read_only)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn signature_is_deterministic() {
        let client = CoinbaseClient::new("key", "secret", true);
        let a = client.sign("1700000000", "GET", "/api/v3/brokerage/accounts", "");
        let b = client.sign("1700000000", "GET", "/api/v3/brokerage/accounts", "");
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);

        let c = client.sign("1700000001", "GET", "/api/v3/brokerage/accounts", "");
        assert_ne!(a, c);
    }

    #[test]
    fn debug_redacts_secrets() {
        let client = CoinbaseClient::new("visible-key", "visible-secret", true);
        let debug = format!("{client:?}");
        assert!(!debug.contains("visible-key"));
        assert!(!debug.contains("visible-secret"));
    }

    #[test]
    fn parse_f64_accepts_string_and_number() {
        assert_eq!(
            CoinbaseClient::parse_f64(&serde_json::json!("2975.32")).unwrap(),
            2975.32
        );
        assert_eq!(CoinbaseClient::parse_f64(&serde_json::json!(42.5)).unwrap(), 42.5);
        assert_eq!(CoinbaseClient::parse_f64(&serde_json::Value::Null).unwrap(), 0.0);
        assert!(CoinbaseClient::parse_f64(&serde_json::json!("abc")).is_err());
    }

    #[test]
    fn granularity_labels() {
        assert_eq!(CoinbaseClient::granularity_label(900), "FIFTEEN_MINUTE");
        assert_eq!(CoinbaseClient::granularity_label(3600), "ONE_HOUR");
    }

    #[tokio::test]
    async fn read_only_client_refuses_mutations() {
        let client = CoinbaseClient::new("k", "s", true);
        let req = OrderRequest {
            client_order_id: "c1".into(),
            product_id: "BTC-USD".into(),
            side: Side::Buy,
            kind: OrderKind::Market { quote_size: 10.0 },
        };
        assert!(matches!(
            client.place_order(&req).await,
            Err(ExchangeError::ReadOnly)
        ));
        assert!(matches!(
            client.cancel_orders(&["x".into()]).await,
            Err(ExchangeError::ReadOnly)
        ));
    }
}
