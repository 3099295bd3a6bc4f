//! Bearer authentication and per-source rate limiting.

use std::collections::HashMap;

use axum::http::HeaderMap;
use claude_mem_schema::AgentRecord;
use tokio::sync::Mutex;

use crate::error::ApiError;
use crate::state::AppState;

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    pub requests_per_minute: u32,
    pub burst: u32,
}

struct TokenBucket {
    tokens: f64,
    max_tokens: f64,
    refill_rate: f64,
    last_refill: chrono::DateTime<chrono::Utc>,
}

impl TokenBucket {
    fn new(config: &RateLimitConfig) -> Self {
        Self {
            tokens: config.burst as f64,
            max_tokens: config.burst as f64,
            refill_rate: config.requests_per_minute as f64 / 60.0,
            last_refill: chrono::Utc::now(),
        }
    }

    fn try_consume(&mut self) -> bool {
        let now = chrono::Utc::now();
        let elapsed = (now - self.last_refill).num_milliseconds() as f64 / 1000.0;
        self.tokens = (self.tokens + elapsed * self.refill_rate).min(self.max_tokens);
        self.last_refill = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }
}

/// One bucket per source key. Applied to the agent register/verify routes.
pub struct RateLimiter {
    buckets: Mutex<HashMap<String, TokenBucket>>,
    config: RateLimitConfig,
}

impl RateLimiter {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            buckets: Mutex::new(HashMap::new()),
            config,
        }
    }

    pub async fn check(&self, key: &str) -> bool {
        let mut buckets = self.buckets.lock().await;
        let bucket = buckets
            .entry(key.to_string())
            .or_insert_with(|| TokenBucket::new(&self.config));
        bucket.try_consume()
    }
}

/// Rate-limit bucket key for a request. The worker normally binds loopback,
/// so a forwarded-for header is the only useful source distinction.
pub fn source_key(headers: &HeaderMap) -> String {
    headers
        .get("x-forwarded-for")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
        .unwrap_or_else(|| "local".to_string())
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")?
        .to_str()
        .ok()?
        .strip_prefix("Bearer ")
}

/// Resolve the caller's agent when a bearer token is present. Absent tokens
/// yield `None`: the worker binds loopback, and anonymous local access is
/// part of the contract (visibility filtering still applies).
pub async fn maybe_agent(
    state: &AppState,
    headers: &HeaderMap,
    ip: Option<&str>,
) -> Result<Option<AgentRecord>, ApiError> {
    match bearer_token(headers) {
        Some(token) => Ok(Some(state.registry.authenticate(token, ip).await?)),
        None => Ok(None),
    }
}

/// Like [`maybe_agent`], but the route requires authentication.
pub async fn require_agent(
    state: &AppState,
    headers: &HeaderMap,
    ip: Option<&str>,
) -> Result<AgentRecord, ApiError> {
    match bearer_token(headers) {
        Some(token) => Ok(state.registry.authenticate(token, ip).await?),
        None => Err(ApiError::unauthorized("bearer token required")),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn bucket_exhausts_then_refuses() {
        let limiter = RateLimiter::new(RateLimitConfig {
            requests_per_minute: 60,
            burst: 2,
        });
        assert!(limiter.check("1.2.3.4").await);
        assert!(limiter.check("1.2.3.4").await);
        assert!(!limiter.check("1.2.3.4").await);
        // Another source has its own bucket.
        assert!(limiter.check("5.6.7.8").await);
    }

    #[test]
    fn bearer_extraction() {
        let mut headers = HeaderMap::new();
        assert!(bearer_token(&headers).is_none());
        headers.insert("authorization", "Bearer cm_abc".parse().unwrap());
        assert_eq!(bearer_token(&headers), Some("cm_abc"));
        headers.insert("authorization", "Basic dXNlcg==".parse().unwrap());
        assert!(bearer_token(&headers).is_none());
    }
}
