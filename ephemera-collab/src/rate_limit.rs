//! Fixed-window limit on document creation per client address.
//!
//! Best effort: counters live in process memory only.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use axum::http::{HeaderMap, HeaderValue};

use crate::clock::Clock;

const HEADER_LIMIT: &str = "x-ratelimit-limit";
const HEADER_REMAINING: &str = "x-ratelimit-remaining";
const HEADER_RESET: &str = "x-ratelimit-reset";

/// Prune expired windows once the table grows past this many clients.
const PRUNE_THRESHOLD: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitConfig {
    /// Creations allowed per window (default: 10)
    pub max_requests: u32,
    /// Window length (default: 1 hour)
    pub window: Duration,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 10,
            window: Duration::from_secs(60 * 60),
        }
    }
}

/// Outcome of one rate-limit check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub limit: u32,
    pub remaining: u32,
    /// End of the current window (ms since epoch)
    pub reset_at: u64,
}

impl RateLimitDecision {
    /// `X-RateLimit-*` headers; the reset is in whole seconds, rounded up.
    pub fn headers(&self) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(HEADER_LIMIT, HeaderValue::from(self.limit));
        headers.insert(HEADER_REMAINING, HeaderValue::from(self.remaining));
        headers.insert(HEADER_RESET, HeaderValue::from(self.reset_at.div_ceil(1000)));
        headers
    }
}

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: u64,
}

pub struct RateLimiter {
    config: RateLimitConfig,
    clock: Arc<dyn Clock>,
    windows: Mutex<HashMap<String, Window>>,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            config,
            clock,
            windows: Mutex::new(HashMap::new()),
        }
    }

    /// Count one request from `client` and decide whether it may proceed.
    pub fn check(&self, client: &str) -> RateLimitDecision {
        let now = self.clock.now_ms();
        let limit = self.config.max_requests;
        let window_ms = self.config.window.as_millis() as u64;

        let Ok(mut windows) = self.windows.lock() else {
            // A poisoned table must not lock everyone out
            return RateLimitDecision {
                allowed: true,
                limit,
                remaining: limit,
                reset_at: now + window_ms,
            };
        };

        if windows.len() > PRUNE_THRESHOLD {
            windows.retain(|_, w| w.reset_at >= now);
        }

        let window = windows.entry(client.to_string()).or_insert(Window {
            count: 0,
            reset_at: now + window_ms,
        });
        if window.reset_at < now {
            *window = Window {
                count: 0,
                reset_at: now + window_ms,
            };
        }

        if window.count >= limit {
            log::debug!("Rate limit hit for {client}");
            return RateLimitDecision {
                allowed: false,
                limit,
                remaining: 0,
                reset_at: window.reset_at,
            };
        }

        window.count += 1;
        RateLimitDecision {
            allowed: true,
            limit,
            remaining: limit - window.count,
            reset_at: window.reset_at,
        }
    }
}

/// Client address as reported by the fronting proxy.
pub fn client_address(headers: &HeaderMap) -> String {
    let header = |name: &str| {
        headers
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::trim)
            .filter(|v| !v.is_empty())
    };
    header("cf-connecting-ip")
        .or_else(|| {
            header("x-forwarded-for")
                .and_then(|v| v.split(',').next())
                .map(str::trim)
        })
        .unwrap_or("unknown")
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn limiter(clock: Arc<ManualClock>) -> RateLimiter {
        RateLimiter::new(RateLimitConfig::default(), clock)
    }

    #[test]
    fn test_allows_up_to_limit() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(clock);

        for expected_remaining in (0..10).rev() {
            let decision = limiter.check("1.2.3.4");
            assert!(decision.allowed);
            assert_eq!(decision.remaining, expected_remaining);
        }
        let denied = limiter.check("1.2.3.4");
        assert!(!denied.allowed);
        assert_eq!(denied.remaining, 0);
        assert_eq!(denied.reset_at, 3_600_000);

        // Other clients are unaffected
        assert!(limiter.check("5.6.7.8").allowed);
    }

    #[test]
    fn test_window_resets() {
        let clock = Arc::new(ManualClock::new(0));
        let limiter = limiter(clock.clone());
        for _ in 0..10 {
            limiter.check("ip");
        }
        assert!(!limiter.check("ip").allowed);

        clock.advance(Duration::from_millis(3_600_001));
        let decision = limiter.check("ip");
        assert!(decision.allowed);
        assert_eq!(decision.remaining, 9);
    }

    #[test]
    fn test_headers() {
        let decision = RateLimitDecision {
            allowed: true,
            limit: 10,
            remaining: 7,
            reset_at: 1_700_000_000_001,
        };
        let headers = decision.headers();
        assert_eq!(headers["x-ratelimit-limit"], "10");
        assert_eq!(headers["x-ratelimit-remaining"], "7");
        assert_eq!(headers["x-ratelimit-reset"], "1700000001");
    }

    #[test]
    fn test_client_address() {
        let mut headers = HeaderMap::new();
        assert_eq!(client_address(&headers), "unknown");

        headers.insert("x-forwarded-for", HeaderValue::from_static("9.9.9.9, 10.0.0.1"));
        assert_eq!(client_address(&headers), "9.9.9.9");

        headers.insert("cf-connecting-ip", HeaderValue::from_static("1.1.1.1"));
        assert_eq!(client_address(&headers), "1.1.1.1");
    }
}
