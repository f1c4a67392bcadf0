// =============================================================================
// Order State Machine — order lifecycle tracking, ghost-order filtering, and
// stale-order detection
// =============================================================================
//
// Status machine:
//
//   NEW -> SUBMITTED -> { OPEN | REJECTED }
//   OPEN -> { PARTIAL_FILL -> FILLED, FILLED, CANCELED, EXPIRED }
//
// FILLED, CANCELED, REJECTED, EXPIRED are terminal. Terminal transitions are
// idempotent; an invalid transition is logged as an ERROR and not applied.
//
// Order age is always computed from the local `created_at` Instant captured
// at creation, never from exchange timestamps.
// =============================================================================

use std::collections::HashMap;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tracing::{debug, error, info};
use uuid::Uuid;

use crate::coinbase::Liquidity;
use crate::types::Side;

// ---------------------------------------------------------------------------
// Status
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum OrderStatus {
    New,
    Submitted,
    Open,
    PartialFill,
    Filled,
    Canceled,
    Rejected,
    Expired,
}

impl OrderStatus {
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Self::Filled | Self::Canceled | Self::Rejected | Self::Expired
        )
    }

    /// Legal edges of the status machine.
    pub fn can_transition(self, to: OrderStatus) -> bool {
        use OrderStatus::*;
        if self.is_terminal() {
            // Idempotent terminal re-entry only.
            return self == to;
        }
        match (self, to) {
            (New, Submitted) | (New, Rejected) | (New, Canceled) => true,
            (Submitted, Open)
            | (Submitted, Rejected)
            | (Submitted, PartialFill)
            | (Submitted, Filled)
            | (Submitted, Canceled)
            | (Submitted, Expired) => true,
            (Open, PartialFill) | (Open, Filled) | (Open, Canceled) | (Open, Expired) => true,
            (PartialFill, PartialFill)
            | (PartialFill, Filled)
            | (PartialFill, Canceled)
            | (PartialFill, Expired) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::New => "NEW",
            Self::Submitted => "SUBMITTED",
            Self::Open => "OPEN",
            Self::PartialFill => "PARTIAL_FILL",
            Self::Filled => "FILLED",
            Self::Canceled => "CANCELED",
            Self::Rejected => "REJECTED",
            Self::Expired => "EXPIRED",
        };
        write!(f, "{s}")
    }
}

// ---------------------------------------------------------------------------
// Orders
// ---------------------------------------------------------------------------

#[derive(Debug, Clone)]
pub struct OrderFill {
    pub trade_id: String,
    pub price: f64,
    pub size_base: f64,
    pub value_quote: f64,
    pub fee: f64,
    pub liquidity: Liquidity,
    pub time: DateTime<Utc>,
}

/// A tracked order. `created_at` is the local monotonic clock at creation;
/// `created_wall` exists only for audit output.
#[derive(Debug, Clone)]
pub struct Order {
    pub client_order_id: String,
    pub exchange_order_id: Option<String>,
    pub symbol: String,
    pub side: Side,
    pub kind_label: String,
    pub price: f64,
    pub size_base: f64,
    pub size_quote: f64,
    pub created_at: Instant,
    pub created_wall: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub status: OrderStatus,
    pub filled_size: f64,
    pub filled_value: f64,
    pub fees: f64,
    pub fills: Vec<OrderFill>,
    pub strategy: String,
}

impl Order {
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// FILLED once filled_size >= size * (1 - tolerance).
    pub fn fill_complete(&self, tolerance: f64) -> bool {
        self.size_base > 0.0 && self.filled_size >= self.size_base * (1.0 - tolerance)
    }
}

// ---------------------------------------------------------------------------
// Ghost cache
// ---------------------------------------------------------------------------

/// Recently-canceled order ids. Exchange reads are only eventually
/// consistent: a canceled order can reappear in open-order listings for up
/// to ~60 s. Ids in this cache are filtered out of every such read.
pub struct GhostCache {
    ttl: Duration,
    entries: HashMap<String, Instant>,
}

impl GhostCache {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            entries: HashMap::new(),
        }
    }

    pub fn add(&mut self, id: impl Into<String>) {
        self.entries.insert(id.into(), Instant::now());
    }

    pub fn contains(&mut self, id: &str) -> bool {
        self.sweep();
        self.entries.contains_key(id)
    }

    fn sweep(&mut self) {
        let ttl = self.ttl;
        self.entries.retain(|_, added| added.elapsed() < ttl);
    }

    pub fn len(&mut self) -> usize {
        self.sweep();
        self.entries.len()
    }
}

// ---------------------------------------------------------------------------
// The state machine
// ---------------------------------------------------------------------------

pub struct OrderStateMachine {
    orders: RwLock<HashMap<String, Order>>,
    ghosts: Mutex<GhostCache>,
}

impl OrderStateMachine {
    pub fn new(ghost_ttl: Duration) -> Self {
        Self {
            orders: RwLock::new(HashMap::new()),
            ghosts: Mutex::new(GhostCache::new(ghost_ttl)),
        }
    }

    /// Create a NEW order and return its client_order_id. The id is stable
    /// for the lifetime of the placement, including retries.
    #[allow(clippy::too_many_arguments)]
    pub fn create(
        &self,
        symbol: &str,
        side: Side,
        kind_label: &str,
        price: f64,
        size_base: f64,
        size_quote: f64,
        strategy: &str,
    ) -> String {
        let client_order_id = Uuid::new_v4().to_string();
        let order = Order {
            client_order_id: client_order_id.clone(),
            exchange_order_id: None,
            symbol: symbol.to_string(),
            side,
            kind_label: kind_label.to_string(),
            price,
            size_base,
            size_quote,
            created_at: Instant::now(),
            created_wall: Utc::now(),
            last_updated: Utc::now(),
            status: OrderStatus::New,
            filled_size: 0.0,
            filled_value: 0.0,
            fees: 0.0,
            fills: Vec::new(),
            strategy: strategy.to_string(),
        };
        debug!(
            client_order_id = %client_order_id,
            symbol,
            side = %side,
            kind = kind_label,
            price,
            size_base,
            "order created"
        );
        self.orders.write().insert(client_order_id.clone(), order);
        client_order_id
    }

    /// Attach the exchange order id after an ack and move to SUBMITTED.
    pub fn acknowledge(&self, client_order_id: &str, exchange_order_id: &str) -> bool {
        let mut orders = self.orders.write();
        let Some(order) = orders.get_mut(client_order_id) else {
            error!(client_order_id, "acknowledge on unknown order");
            return false;
        };
        order.exchange_order_id = Some(exchange_order_id.to_string());
        drop(orders);
        self.transition(client_order_id, OrderStatus::Submitted)
            && self.transition(client_order_id, OrderStatus::Open)
    }

    /// Apply a status transition. Terminal re-entry is an idempotent no-op;
    /// an illegal edge is logged as an ERROR and NOT applied.
    pub fn transition(&self, client_order_id: &str, to: OrderStatus) -> bool {
        let mut orders = self.orders.write();
        let Some(order) = orders.get_mut(client_order_id) else {
            error!(client_order_id, to = %to, "transition on unknown order");
            return false;
        };

        if order.status == to {
            return true;
        }
        if !order.status.can_transition(to) {
            error!(
                client_order_id,
                from = %order.status,
                to = %to,
                "invalid order state transition, not applied"
            );
            return false;
        }

        debug!(client_order_id, from = %order.status, to = %to, "order transition");
        order.status = to;
        order.last_updated = Utc::now();
        true
    }

    /// Record a fill, de-duplicated by trade_id. Returns false when the fill
    /// is a duplicate or the order is unknown.
    pub fn record_fill(&self, client_order_id: &str, fill: OrderFill, tolerance: f64) -> bool {
        let mut orders = self.orders.write();
        let Some(order) = orders.get_mut(client_order_id) else {
            error!(client_order_id, "fill for unknown order");
            return false;
        };

        if order.fills.iter().any(|f| f.trade_id == fill.trade_id) {
            debug!(
                client_order_id,
                trade_id = %fill.trade_id,
                "duplicate fill event ignored"
            );
            return false;
        }

        order.filled_size += fill.size_base;
        order.filled_value += fill.value_quote;
        order.fees += fill.fee;
        order.fills.push(fill);
        order.last_updated = Utc::now();

        let complete = order.fill_complete(tolerance);
        let status = order.status;
        drop(orders);

        if complete {
            self.transition(client_order_id, OrderStatus::Filled);
        } else if !status.is_terminal() {
            self.transition(client_order_id, OrderStatus::PartialFill);
        }
        true
    }

    // -- lookups (immutable snapshots) ----------------------------------------

    pub fn get(&self, client_order_id: &str) -> Option<Order> {
        self.orders.read().get(client_order_id).cloned()
    }

    pub fn by_exchange_id(&self, exchange_order_id: &str) -> Option<Order> {
        self.orders
            .read()
            .values()
            .find(|o| o.exchange_order_id.as_deref() == Some(exchange_order_id))
            .cloned()
    }

    pub fn active_orders(&self) -> Vec<Order> {
        self.orders
            .read()
            .values()
            .filter(|o| !o.status.is_terminal())
            .cloned()
            .collect()
    }

    /// Non-terminal orders older than `max_age` by the local clock.
    pub fn stale_orders(&self, max_age: Duration) -> Vec<Order> {
        self.orders
            .read()
            .values()
            .filter(|o| !o.status.is_terminal() && o.age() > max_age)
            .cloned()
            .collect()
    }

    /// Drop terminal orders older than an hour to bound memory.
    pub fn prune_terminal(&self) {
        let cutoff = Duration::from_secs(3600);
        let mut orders = self.orders.write();
        let before = orders.len();
        orders.retain(|_, o| !(o.status.is_terminal() && o.created_at.elapsed() > cutoff));
        let removed = before - orders.len();
        if removed > 0 {
            info!(removed, "pruned terminal orders");
        }
    }

    // -- ghost filtering ------------------------------------------------------

    /// Remember ids of an order we just canceled, so eventually-consistent
    /// exchange reads do not resurrect it.
    pub fn mark_canceled(&self, order: &Order) {
        let mut ghosts = self.ghosts.lock();
        ghosts.add(order.client_order_id.clone());
        if let Some(xid) = &order.exchange_order_id {
            ghosts.add(xid.clone());
        }
    }

    pub fn is_ghost(&self, id: &str) -> bool {
        self.ghosts.lock().contains(id)
    }
}

impl std::fmt::Debug for OrderStateMachine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OrderStateMachine")
            .field("orders", &self.orders.read().len())
            .finish()
    }
}
