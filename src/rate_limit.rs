use std::collections::HashMap;
use std::env;
use std::sync::Mutex;
use std::time::Instant;

use rocket::http::Header;
use rocket::response::{self, Responder, Response};
use rocket::serde::json::Json;
use rocket::Request;

/// Rate limits apply only to the auth-adjacent HTTP surface — issuing and
/// refreshing tokens (§5 "rate limiting guards authentication, not the
/// message path"; an abusive message sender is handled by send-queue
/// backpressure and session close, not a 429).
///
/// Environment variables:
/// - `RATE_LIMIT_LOGIN` — max token issuances (and `/ws` connection attempts)
///   per minute per IP (default: 10)
pub struct RateLimitConfig {
    pub login_max: usize,
    pub login_window_secs: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            login_max: 10,
            login_window_secs: 60,
        }
    }
}

impl RateLimitConfig {
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(val) = env::var("RATE_LIMIT_LOGIN")
            && let Ok(n) = val.parse::<usize>()
        {
            config.login_max = n;
        }

        config
    }
}

pub struct RateLimiter {
    limits: Mutex<HashMap<String, Vec<Instant>>>,
}

impl Default for RateLimiter {
    fn default() -> Self {
        Self::new()
    }
}

/// Information about rate limit status for a given key.
#[derive(Debug, Clone)]
pub struct RateLimitInfo {
    pub allowed: bool,
    pub limit: usize,
    pub remaining: usize,
    /// Seconds until the oldest request in the window expires. 0 if there's
    /// remaining capacity.
    pub retry_after_secs: u64,
}

impl RateLimiter {
    pub fn new() -> Self {
        RateLimiter {
            limits: Mutex::new(HashMap::new()),
        }
    }

    /// `key` is typically "login:ip" or "refresh:ip".
    pub fn check(&self, key: &str, max: usize, window_secs: u64) -> bool {
        self.check_with_info(key, max, window_secs).allowed
    }

    pub fn check_with_info(&self, key: &str, max: usize, window_secs: u64) -> RateLimitInfo {
        let mut limits = self.limits.lock().unwrap_or_else(|e| e.into_inner());
        let now = Instant::now();
        let window = std::time::Duration::from_secs(window_secs);

        let entries = limits.entry(key.to_string()).or_default();
        entries.retain(|t| now.duration_since(*t) < window);

        if entries.len() >= max {
            let oldest = match entries.iter().min() {
                Some(t) => *t,
                None => {
                    return RateLimitInfo {
                        allowed: false,
                        remaining: 0,
                        limit: max,
                        retry_after_secs: 1,
                    }
                }
            };
            let elapsed = now.duration_since(oldest);
            let retry_after = if elapsed < window {
                (window - elapsed).as_secs() + 1
            } else {
                1
            };

            return RateLimitInfo {
                allowed: false,
                limit: max,
                remaining: 0,
                retry_after_secs: retry_after,
            };
        }

        entries.push(now);
        let remaining = max - entries.len();

        RateLimitInfo {
            allowed: true,
            limit: max,
            remaining,
            retry_after_secs: 0,
        }
    }
}

/// Error responder for rate-limited (429) responses with standard headers.
pub struct RateLimitedError {
    pub info: RateLimitInfo,
    pub message: String,
}

impl<'r, 'o: 'r> Responder<'r, 'o> for RateLimitedError {
    fn respond_to(self, req: &'r Request<'_>) -> response::Result<'o> {
        let body = Json(serde_json::json!({
            "error": self.message,
            "retry_after_secs": self.info.retry_after_secs,
            "limit": self.info.limit,
            "remaining": 0
        }));

        Response::build_from(body.respond_to(req)?)
            .status(rocket::http::Status::TooManyRequests)
            .header(Header::new("X-RateLimit-Limit", self.info.limit.to_string()))
            .header(Header::new("X-RateLimit-Remaining", "0".to_string()))
            .header(Header::new(
                "X-RateLimit-Reset",
                self.info.retry_after_secs.to_string(),
            ))
            .header(Header::new(
                "Retry-After",
                self.info.retry_after_secs.to_string(),
            ))
            .ok()
    }
}
