//! Per-client token-bucket admission.
//!
//! Capacity and refill rate are both `rate_per_second`: a full bucket admits
//! one second's worth of burst, then refills by elapsed whole seconds.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Instant;

#[derive(Debug)]
struct Bucket {
    tokens: u64,
    last_refill: Instant,
}

/// Token-bucket rate limiter keyed by client id.
///
/// `try_acquire` is O(1) and never blocks beyond the internal mutex.
#[derive(Debug)]
pub struct RateLimiter {
    rate_per_second: u64,
    buckets: Mutex<HashMap<String, Bucket>>,
}

impl RateLimiter {
    pub fn new(rate_per_second: u64) -> Self {
        RateLimiter {
            rate_per_second,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Take one token for `client_id`; false means rate-limited.
    pub fn try_acquire(&self, client_id: &str) -> bool {
        let now = Instant::now();
        let mut buckets = self.buckets.lock().expect("limiter mutex poisoned");
        let bucket = buckets.entry(client_id.to_owned()).or_insert(Bucket {
            tokens: self.rate_per_second,
            last_refill: now,
        });

        // Refill by elapsed whole seconds, clamped to capacity.
        let elapsed_secs = now.duration_since(bucket.last_refill).as_secs();
        if elapsed_secs > 0 {
            bucket.tokens = bucket
                .tokens
                .saturating_add(elapsed_secs.saturating_mul(self.rate_per_second))
                .min(self.rate_per_second);
            bucket.last_refill = now;
        }

        if bucket.tokens > 0 {
            bucket.tokens -= 1;
            true
        } else {
            false
        }
    }

    /// Drop the bucket for a client (used at disconnect and in tests).
    pub fn reset(&self, client_id: &str) {
        self.buckets
            .lock()
            .expect("limiter mutex poisoned")
            .remove(client_id);
    }

    /// Remaining tokens per client, for the admin surface and tests.
    pub fn snapshot(&self) -> HashMap<String, u64> {
        self.buckets
            .lock()
            .expect("limiter mutex poisoned")
            .iter()
            .map(|(k, b)| (k.clone(), b.tokens))
            .collect()
    }
}
