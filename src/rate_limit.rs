use std::{
    collections::VecDeque,
    sync::Arc,
    time::{Duration, Instant},
};

use dashmap::DashMap;
use parking_lot::Mutex;
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    pub retry_after: Duration,
}

#[derive(Debug, Clone, Error)]
#[error(
    "Rate limit exceeded for {category}: {max_calls} calls per {} seconds",
    .period.as_secs_f64()
)]
pub struct RateLimitExceeded {
    pub category: String,
    pub max_calls: u32,
    pub period: Duration,
    pub retry_after: Duration,
}

/// Call timestamps recorded inside the trailing window of one bucket.
#[derive(Debug, Default)]
struct SlidingWindow {
    calls: VecDeque<Instant>,
}

impl SlidingWindow {
    fn evaluate(&mut self, now: Instant, max_calls: u32, period: Duration) -> RateLimitDecision {
        self.calls
            .retain(|at| now.saturating_duration_since(*at) < period);

        let in_window = u32::try_from(self.calls.len()).unwrap_or(u32::MAX);
        if in_window >= max_calls {
            let retry_after = self
                .calls
                .iter()
                .min()
                .map(|oldest| (*oldest + period).saturating_duration_since(now))
                .unwrap_or(period);
            return RateLimitDecision {
                allowed: false,
                limit: max_calls,
                remaining: 0,
                retry_after,
            };
        }

        self.calls.push_back(now);
        RateLimitDecision {
            allowed: true,
            limit: max_calls,
            remaining: max_calls - in_window - 1,
            retry_after: Duration::ZERO,
        }
    }
}

/// Sliding-window call counters keyed by (tenant, category).
///
/// Buckets are created lazily and live for the lifetime of the registry. Each
/// bucket has its own mutex, so the prune/count/append sequence is serialized
/// per key while distinct keys proceed in parallel.
#[derive(Debug, Default)]
pub struct RateLimiterRegistry {
    buckets: DashMap<(String, String), Arc<Mutex<SlidingWindow>>>,
}

impl RateLimiterRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    #[cfg(test)]
    pub fn allow(&self, tenant: &str, category: &str, max_calls: u32, period: Duration) -> bool {
        self.decide(tenant, category, max_calls, period).allowed
    }

    pub fn check(
        &self,
        tenant: &str,
        category: &str,
        max_calls: u32,
        period: Duration,
    ) -> Result<RateLimitDecision, RateLimitExceeded> {
        let decision = self.decide(tenant, category, max_calls, period);
        if decision.allowed {
            Ok(decision)
        } else {
            Err(RateLimitExceeded {
                category: category.to_string(),
                max_calls,
                period,
                retry_after: decision.retry_after,
            })
        }
    }

    pub fn decide(
        &self,
        tenant: &str,
        category: &str,
        max_calls: u32,
        period: Duration,
    ) -> RateLimitDecision {
        let bucket = self.bucket(tenant, category);
        let mut window = bucket.lock();
        // Sampled under the lock so appends stay in arrival order.
        let now = Instant::now();
        window.evaluate(now, max_calls, period)
    }

    #[cfg(test)]
    pub fn decide_at(
        &self,
        tenant: &str,
        category: &str,
        max_calls: u32,
        period: Duration,
        now: Instant,
    ) -> RateLimitDecision {
        let bucket = self.bucket(tenant, category);
        let mut window = bucket.lock();
        window.evaluate(now, max_calls, period)
    }

    #[cfg(test)]
    pub fn bucket_count(&self) -> usize {
        self.buckets.len()
    }

    fn bucket(&self, tenant: &str, category: &str) -> Arc<Mutex<SlidingWindow>> {
        let key = (tenant.to_string(), category.to_string());
        if let Some(existing) = self.buckets.get(&key) {
            return existing.clone();
        }
        self.buckets.entry(key).or_default().clone()
    }
}

#[cfg(test)]
mod tests {
    use std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc, Barrier,
        },
        thread,
        time::{Duration, Instant},
    };

    use super::RateLimiterRegistry;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn allows_exactly_max_calls_in_fresh_window() {
        let limiter = RateLimiterRegistry::new();
        for _ in 0..5 {
            assert!(limiter.allow("acme", "command", 5, MINUTE));
        }
        assert!(!limiter.allow("acme", "command", 5, MINUTE));
    }

    #[test]
    fn sliding_window_expires_oldest_call_only() {
        let limiter = RateLimiterRegistry::new();
        let period = Duration::from_millis(100);
        let t0 = Instant::now();

        assert!(limiter.decide_at("acme", "query", 2, period, t0).allowed);
        assert!(
            limiter
                .decide_at("acme", "query", 2, period, t0 + Duration::from_millis(30))
                .allowed
        );

        let rejected = limiter.decide_at("acme", "query", 2, period, t0 + Duration::from_millis(60));
        assert!(!rejected.allowed);
        assert_eq!(rejected.retry_after, Duration::from_millis(40));

        // t=0 has aged out, t=30ms is still inside the window.
        let later = limiter.decide_at("acme", "query", 2, period, t0 + Duration::from_millis(110));
        assert!(later.allowed);
        assert_eq!(later.remaining, 0);
    }

    #[test]
    fn tenants_and_categories_do_not_share_counters() {
        let limiter = RateLimiterRegistry::new();
        for _ in 0..3 {
            assert!(limiter.allow("acme", "command", 3, MINUTE));
        }
        assert!(!limiter.allow("acme", "command", 3, MINUTE));

        assert!(limiter.allow("acme", "query", 3, MINUTE));
        assert!(limiter.allow("globex", "command", 3, MINUTE));
        assert_eq!(limiter.bucket_count(), 3);
    }

    #[test]
    fn concurrent_callers_are_counted_exactly() {
        let limiter = Arc::new(RateLimiterRegistry::new());
        let barrier = Arc::new(Barrier::new(10));
        let accepted = Arc::new(AtomicUsize::new(0));
        let rejected = Arc::new(AtomicUsize::new(0));

        let handles = (0..10)
            .map(|_| {
                let limiter = limiter.clone();
                let barrier = barrier.clone();
                let accepted = accepted.clone();
                let rejected = rejected.clone();
                thread::spawn(move || {
                    barrier.wait();
                    if limiter.allow("acme", "shell", 5, MINUTE) {
                        accepted.fetch_add(1, Ordering::SeqCst);
                    } else {
                        rejected.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect::<Vec<_>>();

        for handle in handles {
            handle.join().expect("limiter thread panicked");
        }

        assert_eq!(accepted.load(Ordering::SeqCst), 5);
        assert_eq!(rejected.load(Ordering::SeqCst), 5);
    }

    #[test]
    fn zero_max_calls_always_rejects() {
        let limiter = RateLimiterRegistry::new();
        assert!(!limiter.allow("acme", "command", 0, MINUTE));
        assert!(!limiter.allow("acme", "command", 0, Duration::from_nanos(1)));
    }

    #[test]
    fn sub_millisecond_period_reopens_quickly() {
        let limiter = RateLimiterRegistry::new();
        let period = Duration::from_micros(500);
        assert!(limiter.allow("acme", "burst", 1, period));
        thread::sleep(Duration::from_millis(2));
        assert!(limiter.allow("acme", "burst", 1, period));
    }

    #[test]
    fn check_reports_category_in_error() {
        let limiter = RateLimiterRegistry::new();
        limiter
            .check("acme", "file_write", 1, MINUTE)
            .expect("first call allowed");
        let err = limiter
            .check("acme", "file_write", 1, MINUTE)
            .expect_err("second call rejected");
        assert_eq!(
            err.to_string(),
            "Rate limit exceeded for file_write: 1 calls per 60 seconds"
        );
        assert!(err.retry_after <= MINUTE);
    }
}
