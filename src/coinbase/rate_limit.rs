// =============================================================================
// Rate limiter — token buckets with separate public / private budgets
// =============================================================================
//
// Coinbase Advanced Trade enforces roughly 10 req/s on public market-data
// endpoints and 30 req/s on signed private endpoints per key. Callers acquire
// a token before each request and block (async) until one is available, so a
// burst of universe-build quote fetches cannot starve order placement.
// =============================================================================

use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::{debug, warn};

/// Endpoint class determines which bucket a request draws from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointClass {
    Public,
    Private,
}

struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(capacity: f64, refill_per_sec: f64) -> Self {
        Self {
            capacity,
            tokens: capacity,
            refill_per_sec,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self, now: Instant) {
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take one token, or return how long the caller must wait.
    fn try_take(&mut self, now: Instant) -> Result<(), Duration> {
        self.refill(now);
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - self.tokens;
            Err(Duration::from_secs_f64(deficit / self.refill_per_sec))
        }
    }
}

/// Shared limiter; one instance per exchange client.
pub struct RateLimiter {
    public: Mutex<Bucket>,
    private: Mutex<Bucket>,
}

impl RateLimiter {
    pub fn new(public_per_sec: f64, private_per_sec: f64) -> Self {
        Self {
            public: Mutex::new(Bucket::new(public_per_sec * 2.0, public_per_sec)),
            private: Mutex::new(Bucket::new(private_per_sec * 2.0, private_per_sec)),
        }
    }

    /// Defaults tuned below the documented exchange limits.
    pub fn coinbase_defaults() -> Self {
        Self::new(8.0, 20.0)
    }

    /// Acquire a token for `class`, sleeping as needed.
    pub async fn acquire(&self, class: EndpointClass) {
        loop {
            let wait = {
                let bucket = match class {
                    EndpointClass::Public => &self.public,
                    EndpointClass::Private => &self.private,
                };
                bucket.lock().try_take(Instant::now())
            };
            match wait {
                Ok(()) => return,
                Err(d) => {
                    if d > Duration::from_millis(500) {
                        warn!(class = ?class, wait_ms = d.as_millis() as u64, "rate limiter backpressure");
                    } else {
                        debug!(class = ?class, wait_ms = d.as_millis() as u64, "rate limiter wait");
                    }
                    tokio::time::sleep(d).await;
                }
            }
        }
    }
}

impl std::fmt::Debug for RateLimiter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RateLimiter").finish_non_exhaustive()
    }
}
