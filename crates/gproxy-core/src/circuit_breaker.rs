//! Per-provider circuit breaker (spec §4.5).
//!
//! `closed -> open` once `failure_count >= threshold` inside the failure
//! window; `open -> half_open` once `open_until` elapses and a request is
//! attempted (or an external probe succeeds — driven by `force_half_open`,
//! called by the smart-probe scheduler this crate does not own);
//! `half_open -> closed` after `min_successes` consecutive successes, any
//! failure in `half_open` reverts to `open` with a fresh cooldown.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use tokio::sync::RwLock;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl CircuitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Closed => "closed",
            Self::Open => "open",
            Self::HalfOpen => "half_open",
        }
    }
}

#[derive(Debug, Clone)]
struct BreakerEntry {
    state: CircuitState,
    failure_count: u32,
    last_failure_at: Option<SystemTime>,
    open_until: Option<SystemTime>,
    half_open_success_count: u32,
}

impl Default for BreakerEntry {
    fn default() -> Self {
        Self {
            state: CircuitState::Closed,
            failure_count: 0,
            last_failure_at: None,
            open_until: None,
            half_open_success_count: 0,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BreakerConfig {
    pub failure_threshold: u32,
    pub failure_window: Duration,
    pub cooldown: Duration,
    pub half_open_min_successes: u32,
}

impl Default for BreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            failure_window: Duration::from_secs(120),
            cooldown: Duration::from_secs(60),
            half_open_min_successes: 2,
        }
    }
}

/// Snapshot returned to callers deciding whether a provider is selectable.
#[derive(Debug, Clone, Copy)]
pub struct BreakerStatus {
    pub state: CircuitState,
    pub failure_count: u32,
    pub threshold: u32,
}

/// Only `PROVIDER_ERROR` (any 4xx/5xx upstream) and `EmptyResponseError` feed
/// the breaker; `SYSTEM_ERROR`, `CLIENT_ABORT`, `NON_RETRYABLE_CLIENT_ERROR`,
/// and `RESOURCE_NOT_FOUND` must not (spec §4.5, cross-referenced by §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BreakerFeedKind {
    ProviderError,
    EmptyResponse,
    Other,
}

impl BreakerFeedKind {
    pub fn feeds_breaker(&self) -> bool {
        matches!(self, Self::ProviderError | Self::EmptyResponse)
    }
}

/// In-process circuit breaker. `gproxy-router::admin` wires a Redis-backed
/// variant in front of this for multi-process deployments; single-process
/// deployments use this directly (it is the source of truth either way for
/// the in-flight request path, since Redis is only a cross-process mirror).
pub struct CircuitBreaker {
    config: BreakerConfig,
    entries: RwLock<HashMap<i64, BreakerEntry>>,
}

impl CircuitBreaker {
    pub fn new(config: BreakerConfig) -> Arc<Self> {
        Arc::new(Self {
            config,
            entries: RwLock::new(HashMap::new()),
        })
    }

    pub async fn status(&self, provider_id: i64) -> BreakerStatus {
        let mut guard = self.entries.write().await;
        let entry = guard.entry(provider_id).or_default();
        self.advance_if_cooldown_elapsed(entry);
        BreakerStatus {
            state: entry.state,
            failure_count: entry.failure_count,
            threshold: self.config.failure_threshold,
        }
    }

    /// `open -> half_open` lazily when a caller attempts a request after
    /// `open_until` has elapsed.
    fn advance_if_cooldown_elapsed(&self, entry: &mut BreakerEntry) {
        if entry.state == CircuitState::Open {
            if let Some(until) = entry.open_until {
                if SystemTime::now() >= until {
                    entry.state = CircuitState::HalfOpen;
                    entry.half_open_success_count = 0;
                }
            }
        }
    }

    pub async fn record_failure(&self, provider_id: i64, kind: BreakerFeedKind) {
        if !kind.feeds_breaker() {
            return;
        }
        let mut guard = self.entries.write().await;
        let entry = guard.entry(provider_id).or_default();
        self.advance_if_cooldown_elapsed(entry);

        let now = SystemTime::now();
        let within_window = entry
            .last_failure_at
            .map(|t| now.duration_since(t).unwrap_or_default() <= self.config.failure_window)
            .unwrap_or(true);
        entry.failure_count = if within_window {
            entry.failure_count.saturating_add(1)
        } else {
            1
        };
        entry.last_failure_at = Some(now);

        match entry.state {
            CircuitState::HalfOpen => {
                entry.state = CircuitState::Open;
                entry.open_until = Some(now + self.config.cooldown);
                entry.half_open_success_count = 0;
                warn!(event = "circuit_breaker.reopened", provider_id, probe_failed = true);
            }
            CircuitState::Closed => {
                if entry.failure_count >= self.config.failure_threshold {
                    entry.state = CircuitState::Open;
                    entry.open_until = Some(now + self.config.cooldown);
                    warn!(
                        event = "circuit_breaker.opened",
                        provider_id,
                        failure_count = entry.failure_count,
                        threshold = self.config.failure_threshold
                    );
                }
            }
            CircuitState::Open => {
                entry.open_until = Some(now + self.config.cooldown);
            }
        }
    }

    pub async fn record_success(&self, provider_id: i64) {
        let mut guard = self.entries.write().await;
        let entry = guard.entry(provider_id).or_default();
        self.advance_if_cooldown_elapsed(entry);

        match entry.state {
            CircuitState::HalfOpen => {
                entry.half_open_success_count += 1;
                if entry.half_open_success_count >= self.config.half_open_min_successes {
                    entry.state = CircuitState::Closed;
                    entry.failure_count = 0;
                    entry.half_open_success_count = 0;
                    entry.open_until = None;
                    info!(event = "circuit_breaker.closed", provider_id);
                }
            }
            CircuitState::Closed => {
                entry.failure_count = 0;
            }
            CircuitState::Open => {}
        }
    }

    /// Called by the external smart-probe scheduler on a successful probe.
    pub async fn force_half_open(&self, provider_id: i64) {
        let mut guard = self.entries.write().await;
        let entry = guard.entry(provider_id).or_default();
        if entry.state == CircuitState::Open {
            entry.state = CircuitState::HalfOpen;
            entry.half_open_success_count = 0;
        }
    }

    pub async fn is_open(&self, provider_id: i64) -> bool {
        self.status(provider_id).await.state == CircuitState::Open
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fast_config() -> BreakerConfig {
        BreakerConfig {
            failure_threshold: 3,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_millis(20),
            half_open_min_successes: 2,
        }
    }

    #[tokio::test]
    async fn opens_after_threshold_failures() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..2 {
            cb.record_failure(1, BreakerFeedKind::ProviderError).await;
        }
        assert_eq!(cb.status(1).await.state, CircuitState::Closed);
        cb.record_failure(1, BreakerFeedKind::ProviderError).await;
        assert_eq!(cb.status(1).await.state, CircuitState::Open);
    }

    #[tokio::test]
    async fn non_feeding_kinds_never_open_it() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..10 {
            cb.record_failure(1, BreakerFeedKind::Other).await;
        }
        assert_eq!(cb.status(1).await.state, CircuitState::Closed);
    }

    #[tokio::test]
    async fn half_open_failure_reopens_with_fresh_cooldown() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            cb.record_failure(1, BreakerFeedKind::ProviderError).await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        assert_eq!(cb.status(1).await.state, CircuitState::HalfOpen);
        cb.record_failure(1, BreakerFeedKind::ProviderError).await;
        assert_eq!(cb.status(1).await.state, CircuitState::Open);
    }

    #[tokio::test]
    async fn half_open_closes_after_min_successes() {
        let cb = CircuitBreaker::new(fast_config());
        for _ in 0..3 {
            cb.record_failure(1, BreakerFeedKind::ProviderError).await;
        }
        tokio::time::sleep(Duration::from_millis(30)).await;
        cb.status(1).await;
        cb.record_success(1).await;
        assert_eq!(cb.status(1).await.state, CircuitState::HalfOpen);
        cb.record_success(1).await;
        assert_eq!(cb.status(1).await.state, CircuitState::Closed);
    }
}
