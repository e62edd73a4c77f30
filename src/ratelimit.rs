//! Per-domain rate limiting with configurable min-interval + jitter.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use rand::Rng;

/// Enforces minimum intervals between requests to the same domain.
///
/// Tracks the last request timestamp per domain on the monotonic clock and
/// sleeps when a new request would arrive too soon. The first request to a
/// domain never waits.
#[derive(Debug)]
pub struct RateLimiter {
    min_interval: f64,
    jitter: f64,
    last_request: Mutex<HashMap<String, Instant>>,
}

impl RateLimiter {
    pub fn new(min_interval: f64, jitter: f64) -> Self {
        Self {
            min_interval,
            jitter,
            last_request: Mutex::new(HashMap::new()),
        }
    }

    fn delay_for(&self, domain: &str) -> Duration {
        let last = {
            let map = self.last_request.lock().expect("rate limiter poisoned");
            map.get(domain).copied()
        };
        let Some(last) = last else {
            return Duration::ZERO;
        };
        let elapsed = last.elapsed().as_secs_f64();
        let target = self.min_interval + rand::thread_rng().gen_range(0.0..=self.jitter.max(0.0));
        let remaining = target - elapsed;
        if remaining > 0.0 {
            Duration::from_secs_f64(remaining)
        } else {
            Duration::ZERO
        }
    }

    /// Suspend until it is safe to send a request. Returns the delay applied.
    pub async fn wait(&self, domain: &str) -> Duration {
        let delay = self.delay_for(domain);
        if delay > Duration::ZERO {
            log::debug!(
                "Rate limiter: waiting {:.2}s for {domain}",
                delay.as_secs_f64()
            );
            tokio::time::sleep(delay).await;
        }
        delay
    }

    /// Record that a request was sent to this domain.
    pub fn record(&self, domain: &str) {
        let mut map = self.last_request.lock().expect("rate limiter poisoned");
        map.insert(domain.to_string(), Instant::now());
    }
}
