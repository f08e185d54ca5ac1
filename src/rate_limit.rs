//! Token-bucket rate limiting per tenant.
//!
//! Two buckets: requests per minute and model tokens per minute, both
//! refilling continuously. A query first takes one request token, then
//! reserves its token estimate; after the call the reservation is
//! reconciled against actual usage. Denials carry a `retry_after` bounded
//! by the window.

use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

use crate::config::RateConfig;
use crate::error::{Error, Result};

const WINDOW_SECS: f64 = 60.0;

struct Bucket {
    capacity: f64,
    tokens: f64,
    refill_per_sec: f64,
    last_refill: Instant,
}

impl Bucket {
    fn new(per_minute: f64) -> Self {
        Self {
            capacity: per_minute,
            tokens: per_minute,
            refill_per_sec: per_minute / WINDOW_SECS,
            last_refill: Instant::now(),
        }
    }

    fn refill(&mut self) {
        let now = Instant::now();
        let elapsed = now.duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * self.refill_per_sec).min(self.capacity);
        self.last_refill = now;
    }

    /// Take `cost` tokens or report how long until they are available.
    fn try_take(&mut self, cost: f64) -> std::result::Result<(), f64> {
        self.refill();
        if self.tokens >= cost {
            self.tokens -= cost;
            Ok(())
        } else {
            let deficit = cost - self.tokens;
            Err((deficit / self.refill_per_sec).min(WINDOW_SECS))
        }
    }

    fn give_back(&mut self, amount: f64) {
        self.tokens = (self.tokens + amount).min(self.capacity);
    }

    /// Draw down past zero (actual usage exceeded the reservation); debt
    /// is bounded by one full window.
    fn draw_down(&mut self, amount: f64) {
        self.tokens = (self.tokens - amount).max(-self.capacity);
    }
}

struct TenantRate {
    requests: Bucket,
    tokens: Bucket,
}

#[derive(Debug, Clone, Serialize)]
pub struct RateStatus {
    pub requests_remaining: f64,
    pub tokens_remaining: f64,
}

pub struct RateLimiter {
    config: RateConfig,
    tenants: Mutex<HashMap<String, TenantRate>>,
}

impl RateLimiter {
    pub fn new(config: RateConfig) -> Self {
        Self {
            config,
            tenants: Mutex::new(HashMap::new()),
        }
    }

    fn with_tenant<T>(&self, tenant_id: &str, f: impl FnOnce(&mut TenantRate) -> T) -> T {
        let mut tenants = self.tenants.lock().unwrap();
        let entry = tenants.entry(tenant_id.to_string()).or_insert_with(|| TenantRate {
            requests: Bucket::new(self.config.rpm as f64),
            tokens: Bucket::new(self.config.tpm as f64),
        });
        f(entry)
    }

    /// Take one request token and reserve `estimated_tokens` model tokens.
    pub fn acquire(&self, tenant_id: &str, estimated_tokens: i64) -> Result<()> {
        self.with_tenant(tenant_id, |rate| {
            rate.requests
                .try_take(1.0)
                .map_err(|retry_after| Error::RateLimited { retry_after })?;
            if let Err(retry_after) = rate.tokens.try_take(estimated_tokens as f64) {
                // The request token goes back: the caller was never admitted.
                rate.requests.give_back(1.0);
                return Err(Error::RateLimited { retry_after });
            }
            Ok(())
        })
    }

    /// Request-only admission (greetings bypass the token bucket).
    pub fn acquire_request(&self, tenant_id: &str) -> Result<()> {
        self.with_tenant(tenant_id, |rate| {
            rate.requests
                .try_take(1.0)
                .map_err(|retry_after| Error::RateLimited { retry_after })
        })
    }

    /// Settle a reservation against actual usage: excess is returned,
    /// overrun is drawn down.
    pub fn reconcile(&self, tenant_id: &str, estimated_tokens: i64, actual_tokens: i64) {
        let delta = estimated_tokens - actual_tokens;
        self.with_tenant(tenant_id, |rate| {
            if delta > 0 {
                rate.tokens.give_back(delta as f64);
            } else if delta < 0 {
                rate.tokens.draw_down((-delta) as f64);
            }
        })
    }

    /// Release a full reservation (the call never happened).
    pub fn release(&self, tenant_id: &str, estimated_tokens: i64) {
        self.with_tenant(tenant_id, |rate| {
            rate.requests.give_back(1.0);
            rate.tokens.give_back(estimated_tokens as f64);
        })
    }

    pub fn status(&self, tenant_id: &str) -> RateStatus {
        self.with_tenant(tenant_id, |rate| {
            rate.requests.refill();
            rate.tokens.refill();
            RateStatus {
                requests_remaining: rate.requests.tokens.max(0.0),
                tokens_remaining: rate.tokens.tokens.max(0.0),
            }
        })
    }
}
