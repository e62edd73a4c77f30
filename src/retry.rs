//! Retry bookkeeping: backoff, jitter, Retry-After parsing, split budgets.

use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;

/// Parse a `Retry-After` header value (integer seconds or HTTP-date).
///
/// Returns seconds to wait, or `None` if unparseable or empty.
pub fn parse_retry_after(value: &str) -> Option<f64> {
    let value = value.trim();
    if value.is_empty() {
        return None;
    }

    if let Ok(secs) = value.parse::<i64>() {
        return Some(secs.max(0) as f64);
    }

    // HTTP-date per RFC 7231 §7.1.1.1 (IMF-fixdate is RFC 2822 compatible)
    if let Ok(parsed) = DateTime::parse_from_rfc2822(value) {
        let delta = (parsed.with_timezone(&Utc) - Utc::now()).num_milliseconds() as f64 / 1000.0;
        return Some(delta.max(0.0));
    }

    None
}

/// Exponential backoff with jitter.
///
/// Returns `min(base * 2^attempt, max_delay)` plus uniform jitter in
/// `[0, 0.5 * delay]`.
pub fn calculate_backoff(attempt: u32, base: f64, max_delay: f64) -> Duration {
    let delay = (base * 2f64.powi(attempt as i32)).min(max_delay);
    let jitter = rand::thread_rng().gen_range(0.0..=delay * 0.5);
    Duration::from_secs_f64(delay + jitter)
}

/// Backoff with the engine defaults (base 1s, cap 30s).
pub fn backoff(attempt: u32) -> Duration {
    calculate_backoff(attempt, 1.0, 30.0)
}

/// Per-request retry counters.
///
/// Two independent budgets: normal retries cover 5xx, transport errors, and
/// empty bodies; rotation retries cover 403/429/challenges (session identity
/// issues). Inline solves have their own cap and consume neither budget.
#[derive(Debug, Clone)]
pub struct RetryState {
    pub max_retries: u32,
    pub max_rotations: u32,
    pub normal_retries: u32,
    pub rotation_retries: u32,
    pub inline_solves: u32,
    pub max_inline_solves: u32,
}

impl RetryState {
    pub fn new(max_retries: u32, max_rotations: u32) -> Self {
        Self {
            max_retries,
            max_rotations,
            normal_retries: 0,
            rotation_retries: 0,
            inline_solves: 0,
            max_inline_solves: 3,
        }
    }

    pub fn can_retry(&self) -> bool {
        self.normal_retries < self.max_retries
    }

    pub fn can_rotate(&self) -> bool {
        self.rotation_retries < self.max_rotations
    }

    pub fn use_retry(&mut self) {
        self.normal_retries += 1;
    }

    pub fn use_rotation(&mut self) {
        self.rotation_retries += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        for attempt in 0..8 {
            let base = (2f64.powi(attempt)).min(30.0);
            let delay = calculate_backoff(attempt as u32, 1.0, 30.0).as_secs_f64();
            assert!(delay >= base, "attempt {attempt}: {delay} < {base}");
            assert!(delay <= base * 1.5, "attempt {attempt}: {delay} > {}", base * 1.5);
        }
    }

    #[test]
    fn retry_after_integer_seconds() {
        assert_eq!(parse_retry_after("5"), Some(5.0));
        assert_eq!(parse_retry_after("0"), Some(0.0));
        assert_eq!(parse_retry_after("-3"), Some(0.0));
    }

    #[test]
    fn retry_after_http_date() {
        let future = Utc::now() + chrono::Duration::seconds(120);
        let value = future.to_rfc2822();
        let parsed = parse_retry_after(&value).expect("should parse");
        assert!(parsed > 110.0 && parsed <= 121.0, "{parsed}");
    }

    #[test]
    fn retry_after_past_date_clamps_to_zero() {
        assert_eq!(
            parse_retry_after("Sun, 06 Nov 1994 08:49:37 GMT"),
            Some(0.0)
        );
    }

    #[test]
    fn retry_after_garbage() {
        assert_eq!(parse_retry_after(""), None);
        assert_eq!(parse_retry_after("soon"), None);
    }

    #[test]
    fn budgets_are_independent() {
        let mut state = RetryState::new(2, 1);
        assert!(state.can_retry());
        state.use_retry();
        state.use_retry();
        assert!(!state.can_retry());
        assert!(state.can_rotate());
        state.use_rotation();
        assert!(!state.can_rotate());
        assert_eq!(state.normal_retries, 2);
        assert_eq!(state.rotation_retries, 1);
    }
}
