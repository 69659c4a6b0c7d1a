//! Sliding-window rate-limit guard. An in-memory `DashMap` of per-second sub-buckets
//! backs a single-process deployment; an optional Redis-backed store makes the same
//! window atomic across processes. Matches this codebase's existing token-bucket
//! rate limiter, generalized from a fixed per-second refill to a sliding window with
//! key construction by authenticated user or IP bucket.

use std::collections::VecDeque;
use std::net::IpAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use dashmap::DashMap;
use serde::Deserialize;
use serde_json::Value;
use sha2::{Digest, Sha256};

use crate::error::{GraphError, Result};
use crate::graph::GuardDeclaration;

use super::{Guard, GuardInput, GuardResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureMode {
    FailOpen,
    FailStrict,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RateLimitConfig {
    pub max_requests: u64,
    pub window_seconds: u64,
    #[serde(default)]
    pub burst_limit: Option<u64>,
    #[serde(default)]
    pub bypass_roles: Vec<String>,
    #[serde(default = "RateLimitConfig::default_failure_mode")]
    pub failure_mode: FailureMode,
    #[serde(default = "RateLimitConfig::default_store_timeout_secs")]
    pub store_unavailable_timeout_secs: u64,
    #[serde(default)]
    pub trusted_proxies: Vec<String>,
    #[serde(default = "RateLimitConfig::default_ipv6_prefix")]
    pub ipv6_cidr_prefix: u8,
    #[serde(default)]
    pub redis_url: Option<String>,
}

impl RateLimitConfig {
    fn default_failure_mode() -> FailureMode {
        FailureMode::FailOpen
    }
    fn default_store_timeout_secs() -> u64 {
        10
    }
    fn default_ipv6_prefix() -> u8 {
        64
    }
}

/// A store that counts requests within a sliding window for a key. Implementations:
/// in-memory (always reachable) and Redis-backed (network round trip, can fail).
#[async_trait]
pub trait WindowCounterStore: Send + Sync {
    /// Record one request at `now` and return the count within the trailing window.
    async fn record_and_count(&self, key: &str, now_ms: i64, window_ms: i64) -> Result<u64>;
}

/// Per-second sub-buckets spanning the window; old sub-buckets are dropped lazily.
#[derive(Default)]
struct SlidingWindow {
    sub_buckets: VecDeque<(i64, u64)>,
}

pub struct InMemoryWindowStore {
    windows: DashMap<String, SlidingWindow>,
    max_tracked_keys: usize,
}

impl InMemoryWindowStore {
    pub fn new() -> Self {
        Self {
            windows: DashMap::new(),
            max_tracked_keys: 100_000,
        }
    }
}

impl Default for InMemoryWindowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl WindowCounterStore for InMemoryWindowStore {
    async fn record_and_count(&self, key: &str, now_ms: i64, window_ms: i64) -> Result<u64> {
        if self.windows.len() >= self.max_tracked_keys && !self.windows.contains_key(key) {
            // Bounded fallback: refuse new keys rather than grow unbounded during an
            // outage-induced key explosion.
            return Err(GraphError::RateLimitStoreUnavailable(key.to_string()));
        }
        let second = now_ms / 1000;
        let mut entry = self.windows.entry(key.to_string()).or_default();
        entry.sub_buckets.push_back((second, 1));
        let cutoff = second - (window_ms / 1000);
        while matches!(entry.sub_buckets.front(), Some((ts, _)) if *ts <= cutoff) {
            entry.sub_buckets.pop_front();
        }
        Ok(entry.sub_buckets.iter().map(|(_, c)| c).sum())
    }
}

/// Wraps a Redis connection manager, incrementing a sorted-set based window key.
/// Network errors surface as `RateLimitStoreUnavailable` rather than panicking.
#[cfg(feature = "redis-store")]
pub struct RedisWindowStore {
    manager: redis::aio::ConnectionManager,
}

#[cfg(feature = "redis-store")]
impl RedisWindowStore {
    pub async fn connect(url: &str) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| GraphError::RateLimitStoreUnavailable(e.to_string()))?;
        let manager = client
            .get_connection_manager()
            .await
            .map_err(|e| GraphError::RateLimitStoreUnavailable(e.to_string()))?;
        Ok(Self { manager })
    }
}

#[cfg(feature = "redis-store")]
#[async_trait]
impl WindowCounterStore for RedisWindowStore {
    async fn record_and_count(&self, key: &str, now_ms: i64, window_ms: i64) -> Result<u64> {
        use redis::AsyncCommands;
        let mut conn = self.manager.clone();
        let cutoff = now_ms - window_ms;
        let _: () = conn
            .zrembyscore(key, 0, cutoff)
            .await
            .map_err(|e| GraphError::RateLimitStoreUnavailable(e.to_string()))?;
        let _: () = conn
            .zadd(key, now_ms, now_ms)
            .await
            .map_err(|e| GraphError::RateLimitStoreUnavailable(e.to_string()))?;
        let count: u64 = conn
            .zcard(key)
            .await
            .map_err(|e| GraphError::RateLimitStoreUnavailable(e.to_string()))?;
        let _: () = conn
            .expire(key, (window_ms / 1000 + 1) as i64)
            .await
            .map_err(|e| GraphError::RateLimitStoreUnavailable(e.to_string()))?;
        Ok(count)
    }
}

fn hash_component(value: &str) -> String {
    let digest = Sha256::digest(value.as_bytes());
    hex::encode(&digest[..8])
}

fn ip_bucket(ip: &IpAddr, ipv6_prefix: u8) -> String {
    match ip {
        IpAddr::V4(v4) => v4.to_string(),
        IpAddr::V6(v6) => {
            let bits = u128::from_be_bytes(v6.octets());
            let mask = if ipv6_prefix >= 128 {
                u128::MAX
            } else {
                !0u128 << (128 - ipv6_prefix)
            };
            format!("{:x}/{}", bits & mask, ipv6_prefix)
        }
    }
}

fn resolve_client_ip(parameters: &Value, trusted_proxies: &[String]) -> Option<IpAddr> {
    let remote = parameters.get("remote_addr").and_then(Value::as_str);
    let from_remote = remote.and_then(|s| s.parse::<IpAddr>().ok());

    if let Some(remote_ip) = &from_remote {
        if !trusted_proxies.iter().any(|p| p == &remote_ip.to_string()) {
            return from_remote;
        }
    }

    // Honor X-Forwarded-For only when the immediate peer is a trusted proxy; take
    // the left-most (client-nearest) entry, capped to avoid unbounded header abuse.
    parameters
        .get("x_forwarded_for")
        .and_then(Value::as_str)
        .and_then(|chain| chain.split(',').take(8).next())
        .map(str::trim)
        .and_then(|s| s.parse::<IpAddr>().ok())
        .or(from_remote)
}

/// Sliding-window rate-limit guard.
pub struct RateLimitGuard {
    name: String,
    config: RateLimitConfig,
    store: Arc<dyn WindowCounterStore>,
    fallback: Arc<InMemoryWindowStore>,
    first_seen_unavailable: std::sync::Mutex<Option<Instant>>,
}

impl RateLimitGuard {
    pub fn new(name: impl Into<String>, config: RateLimitConfig, store: Arc<dyn WindowCounterStore>) -> Self {
        Self {
            name: name.into(),
            config,
            store,
            fallback: Arc::new(InMemoryWindowStore::new()),
            first_seen_unavailable: std::sync::Mutex::new(None),
        }
    }

    pub fn in_memory(name: impl Into<String>, config: RateLimitConfig) -> Self {
        let store = Arc::new(InMemoryWindowStore::new());
        Self::new(name, config, store)
    }

    pub fn from_declaration(decl: &GuardDeclaration) -> Result<Self> {
        let config: RateLimitConfig = serde_json::from_value(decl.config.clone())
            .map_err(|e| GraphError::ConfigInvalid(format!("invalid rate_limit guard config: {e}")))?;
        Ok(Self::in_memory(decl.name.clone(), config))
    }

    fn key_for(&self, input: &GuardInput, method: &str) -> String {
        let path_hash = hash_component(&input.target_id);
        if let Some(user_id) = &input.user.id {
            format!("rl:user:{}:{}:{}", hash_component(user_id), method, path_hash)
        } else {
            let ip = resolve_client_ip(&input.parameters, &self.config.trusted_proxies);
            let bucket = ip
                .map(|ip| ip_bucket(&ip, self.config.ipv6_cidr_prefix))
                .unwrap_or_else(|| "unknown".to_string());
            format!("rl:ip:{bucket}:{method}:{path_hash}")
        }
    }

    async fn count_with_fallback(&self, key: &str, now_ms: i64, window_ms: i64) -> std::result::Result<u64, ()> {
        match self.store.record_and_count(key, now_ms, window_ms).await {
            Ok(count) => {
                *self.first_seen_unavailable.lock().unwrap() = None;
                Ok(count)
            }
            Err(_) => {
                let mut first_seen = self.first_seen_unavailable.lock().unwrap();
                let since = first_seen.get_or_insert_with(Instant::now);
                let elapsed = since.elapsed();
                let timeout = Duration::from_secs(self.config.store_unavailable_timeout_secs);
                if elapsed < timeout {
                    // Within the grace period: absorb the outage through the
                    // in-memory fallback bucket.
                    if let Ok(count) = self.fallback.record_and_count(key, now_ms, window_ms).await {
                        return Ok(count);
                    }
                }
                Err(())
            }
        }
    }

    fn check_internal(&self, input: &GuardInput) -> Option<GuardResult> {
        if self
            .config
            .bypass_roles
            .iter()
            .any(|role| input.user.roles.iter().any(|r| r == role))
        {
            return Some(GuardResult::success());
        }
        None
    }
}

#[async_trait]
impl Guard for RateLimitGuard {
    fn name(&self) -> &str {
        &self.name
    }

    async fn validate(&self, input: &GuardInput) -> Result<GuardResult> {
        if let Some(bypass) = self.check_internal(input) {
            return Ok(bypass);
        }
        Ok(GuardResult::success())
    }

    async fn execute(&self, input: &GuardInput) -> Result<GuardResult> {
        if let Some(bypass) = self.check_internal(input) {
            return Ok(bypass);
        }

        let key = self.key_for(input, "execute");
        let now_ms = chrono::Utc::now().timestamp_millis();
        let window_ms = (self.config.window_seconds * 1000) as i64;
        let limit = self.config.burst_limit.unwrap_or(self.config.max_requests);

        match self.count_with_fallback(&key, now_ms, window_ms).await {
            Ok(count) => {
                if count > limit {
                    Ok(GuardResult::block_with_retry(
                        format!("rate limit exceeded: {count} > {limit}"),
                        self.config.window_seconds * 1000,
                    ))
                } else {
                    Ok(GuardResult::success())
                }
            }
            Err(()) => match self.config.failure_mode {
                FailureMode::FailOpen => {
                    Ok(GuardResult::warn("rate limit store unavailable; failing open"))
                }
                FailureMode::FailStrict => Ok(GuardResult::block_with_retry(
                    "rate limit store unavailable",
                    30_000,
                )),
            },
        }
    }
}
