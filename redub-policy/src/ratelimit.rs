use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;

use crate::error::{PolicyError, PolicyResult};

/// Endpoint classes with distinct budgets. Streaming connections are
/// limited on establishment, not per event.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EndpointClass {
    Auth,
    Submit,
    Upload,
    Read,
    Stream,
    Admin,
}

#[derive(Debug, Clone, Copy)]
struct Rule {
    capacity: f64,
    refill_per_sec: f64,
}

struct Bucket {
    tokens: f64,
    last: Instant,
}

/// Token buckets keyed by `(caller, endpoint class)`. The caller key is
/// the resolved identity where one exists, otherwise the client IP as
/// determined by the network gate (socket peer, or forwarded header when
/// the peer is a trusted proxy).
pub struct RateLimiter {
    rules: HashMap<EndpointClass, Rule>,
    buckets: Mutex<HashMap<(String, EndpointClass), Bucket>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        let mut rules = HashMap::new();
        rules.insert(EndpointClass::Auth, Rule { capacity: 10.0, refill_per_sec: 10.0 / 60.0 });
        rules.insert(EndpointClass::Submit, Rule { capacity: 30.0, refill_per_sec: 0.5 });
        rules.insert(EndpointClass::Upload, Rule { capacity: 120.0, refill_per_sec: 4.0 });
        rules.insert(EndpointClass::Read, Rule { capacity: 300.0, refill_per_sec: 10.0 });
        rules.insert(EndpointClass::Stream, Rule { capacity: 30.0, refill_per_sec: 0.5 });
        rules.insert(EndpointClass::Admin, Rule { capacity: 60.0, refill_per_sec: 1.0 });
        Self {
            rules,
            buckets: Mutex::new(HashMap::new()),
        }
    }

    /// Consume one token; errs with a retry hint when the bucket is dry.
    pub fn check(&self, caller: &str, class: EndpointClass) -> PolicyResult<()> {
        let rule = self.rules[&class];
        let now = Instant::now();
        let mut buckets = self.buckets.lock();
        let bucket = buckets
            .entry((caller.to_string(), class))
            .or_insert_with(|| Bucket {
                tokens: rule.capacity,
                last: now,
            });

        let elapsed = now.duration_since(bucket.last).as_secs_f64();
        bucket.tokens = (bucket.tokens + elapsed * rule.refill_per_sec).min(rule.capacity);
        bucket.last = now;

        if bucket.tokens >= 1.0 {
            bucket.tokens -= 1.0;
            Ok(())
        } else {
            let deficit = 1.0 - bucket.tokens;
            let retry_after_secs = (deficit / rule.refill_per_sec).ceil() as u64;
            Err(PolicyError::RateLimited {
                retry_after_secs: retry_after_secs.max(1),
            })
        }
    }

    /// Drop buckets idle long enough to be full again. Called from a
    /// maintenance sweep to bound memory.
    pub fn compact(&self) {
        let now = Instant::now();
        let rules = self.rules.clone();
        self.buckets.lock().retain(|(_, class), bucket| {
            let rule = rules[class];
            let refilled =
                bucket.tokens + now.duration_since(bucket.last).as_secs_f64() * rule.refill_per_sec;
            refilled < rule.capacity
        });
    }
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn budget_exhausts_then_reports_retry_after() {
        let limiter = RateLimiter::new();
        for _ in 0..10 {
            limiter.check("usr_a", EndpointClass::Auth).unwrap();
        }
        let err = limiter.check("usr_a", EndpointClass::Auth).unwrap_err();
        match err {
            PolicyError::RateLimited { retry_after_secs } => assert!(retry_after_secs >= 1),
            other => panic!("expected RateLimited, got {other}"),
        }
    }

    #[test]
    fn buckets_are_per_caller_and_class() {
        let limiter = RateLimiter::new();
        for _ in 0..10 {
            limiter.check("usr_a", EndpointClass::Auth).unwrap();
        }
        // Different caller and different class are unaffected.
        limiter.check("usr_b", EndpointClass::Auth).unwrap();
        limiter.check("usr_a", EndpointClass::Read).unwrap();
    }

    #[test]
    fn compact_drops_full_buckets() {
        let limiter = RateLimiter::new();
        limiter.check("usr_a", EndpointClass::Read).unwrap();
        limiter.compact();
        // The partially drained bucket survives compaction.
        assert_eq!(limiter.buckets.lock().len(), 1);
    }
}
