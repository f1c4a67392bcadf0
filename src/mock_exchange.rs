// =============================================================================
// In-memory ExchangeApi double used by execution and orchestrator tests
// =============================================================================

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, Ordering};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;

use crate::coinbase::{
    Balance, Candle, ExchangeApi, ExchangeError, Fill, OpenOrder, OrderBook, OrderRequest,
    PlaceOrderResponse, Product, QuoteTick,
};

#[derive(Default)]
pub struct MockExchange {
    pub read_only: bool,
    pub products: Vec<Product>,
    pub quotes: HashMap<String, QuoteTick>,
    pub books: HashMap<String, OrderBook>,
    pub candles: HashMap<String, Vec<Candle>>,
    pub balances: Vec<Balance>,
    /// Fills returned by list_fills.
    pub fills: Mutex<Vec<Fill>>,
    /// Orders returned by list_open_orders.
    pub open_orders: Mutex<Vec<OpenOrder>>,
    /// Every placement that reached the exchange.
    pub placed: Mutex<Vec<OrderRequest>>,
    /// Every order id cancel was called for.
    pub canceled: Mutex<Vec<String>>,
    /// When set, the next placement returns a rejection.
    pub reject_next_placement: AtomicBool,
    /// When set, batch cancel reports no acks (forcing the individual path).
    pub fail_batch_cancel: AtomicBool,
    pub consecutive_errors: AtomicU32,
    order_seq: AtomicU32,
}

impl MockExchange {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_quote(mut self, symbol: &str, bid: f64, ask: f64) -> Self {
        self.quotes.insert(
            symbol.to_string(),
            QuoteTick { bid, ask, ts: Utc::now() },
        );
        self
    }

    pub fn push_fill(&self, fill: Fill) {
        self.fills.lock().push(fill);
    }
}

#[async_trait]
impl ExchangeApi for MockExchange {
    async fn list_products(&self) -> Result<Vec<Product>, ExchangeError> {
        Ok(self.products.clone())
    }

    async fn get_quote(&self, product_id: &str) -> Result<QuoteTick, ExchangeError> {
        self.quotes
            .get(product_id)
            .copied()
            .ok_or_else(|| ExchangeError::Parse(format!("no quote for {product_id}")))
    }

    async fn get_orderbook(&self, product_id: &str) -> Result<OrderBook, ExchangeError> {
        Ok(self.books.get(product_id).cloned().unwrap_or_default())
    }

    async fn get_ohlcv(
        &self,
        product_id: &str,
        _granularity_secs: u32,
        _limit: u32,
    ) -> Result<Vec<Candle>, ExchangeError> {
        Ok(self.candles.get(product_id).cloned().unwrap_or_default())
    }

    async fn get_accounts(&self) -> Result<Vec<Balance>, ExchangeError> {
        Ok(self.balances.clone())
    }

    async fn place_order(&self, req: &OrderRequest) -> Result<PlaceOrderResponse, ExchangeError> {
        if self.read_only {
            return Err(ExchangeError::ReadOnly);
        }
        self.placed.lock().push(req.clone());
        if self.reject_next_placement.swap(false, Ordering::SeqCst) {
            return Ok(PlaceOrderResponse {
                order_id: None,
                error: Some("INVALID_ORDER_CONFIGURATION".to_string()),
                error_response: Some(serde_json::json!({
                    "error": "INVALID_ORDER_CONFIGURATION",
                    "message": "size precision too high",
                    "preview_failure_reason": "PREVIEW_INVALID_BASE_SIZE",
                })),
            });
        }
        let seq = self.order_seq.fetch_add(1, Ordering::SeqCst);
        Ok(PlaceOrderResponse {
            order_id: Some(format!("X-{seq}")),
            error: None,
            error_response: None,
        })
    }

    async fn cancel_order(&self, order_id: &str) -> Result<(), ExchangeError> {
        self.canceled.lock().push(order_id.to_string());
        Ok(())
    }

    async fn cancel_orders(&self, order_ids: &[String]) -> Result<Vec<String>, ExchangeError> {
        if self.fail_batch_cancel.load(Ordering::SeqCst) {
            return Ok(Vec::new());
        }
        let mut canceled = self.canceled.lock();
        for id in order_ids {
            canceled.push(id.clone());
        }
        Ok(order_ids.to_vec())
    }

    async fn list_open_orders(&self) -> Result<Vec<OpenOrder>, ExchangeError> {
        Ok(self.open_orders.lock().clone())
    }

    async fn list_fills(
        &self,
        product_id: Option<&str>,
        start_time: Option<DateTime<Utc>>,
        _limit: u32,
    ) -> Result<Vec<Fill>, ExchangeError> {
        Ok(self
            .fills
            .lock()
            .iter()
            .filter(|f| product_id.map(|p| f.product_id == p).unwrap_or(true))
            .filter(|f| start_time.map(|t| f.trade_time >= t).unwrap_or(true))
            .cloned()
            .collect())
    }

    async fn get_server_time(&self) -> Result<DateTime<Utc>, ExchangeError> {
        Ok(Utc::now())
    }

    fn read_only(&self) -> bool {
        self.read_only
    }

    fn consecutive_errors(&self) -> u32 {
        self.consecutive_errors.load(Ordering::Relaxed)
    }
}
