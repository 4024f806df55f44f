//! Smart-probe scheduler (spec §4.5): the probe strategy itself (which
//! endpoint to hit, backoff between attempts) is out of scope, but its
//! *effect* on circuit-breaker state — periodically nudging an `open`
//! breaker toward `half_open` without waiting for the next live request —
//! is in scope.
//!
//! `CircuitBreaker::status` already performs this transition lazily on
//! read, so the minimal scheduler below just has to call it on a timer for
//! every known provider; no network probe is required to get the state
//! transition spec §4.5 describes.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::debug;

use crate::circuit_breaker::CircuitBreaker;

/// Supplies the set of provider ids to sweep on each tick. `AppState`
/// implements this over its `snapshot` so the scheduler always sees the
/// current provider list without holding a direct `AppState` dependency.
pub trait ProbeScheduler: Send + Sync {
    fn spawn(self: Arc<Self>, breaker: Arc<CircuitBreaker>, interval: Duration);
}

/// Ticks every `interval` and calls `breaker.status(id)` for each id
/// `provider_ids` currently returns, which is enough to flip any breaker
/// past its `open_until` deadline into `half_open`.
pub struct IntervalProbeScheduler<F> {
    provider_ids: F,
}

impl<F> IntervalProbeScheduler<F>
where
    F: Fn() -> Vec<i64> + Send + Sync + 'static,
{
    pub fn new(provider_ids: F) -> Arc<Self> {
        Arc::new(Self { provider_ids })
    }
}

impl<F> ProbeScheduler for IntervalProbeScheduler<F>
where
    F: Fn() -> Vec<i64> + Send + Sync + 'static,
{
    fn spawn(self: Arc<Self>, breaker: Arc<CircuitBreaker>, interval: Duration) {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let ids = (self.provider_ids)();
                for id in ids {
                    let status = breaker.status(id).await;
                    debug!(event = "probe.swept", provider_id = id, state = status.state.as_str());
                }
            }
        });
    }
}

/// Disables the background sweep; `open -> half_open` still happens lazily
/// on the next `status`/`is_open` call from the selector, just not ahead of
/// traffic. Used in tests and any deployment that opts out of probing.
pub struct NoopProbeScheduler;

impl ProbeScheduler for NoopProbeScheduler {
    fn spawn(self: Arc<Self>, _breaker: Arc<CircuitBreaker>, _interval: Duration) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{BreakerConfig, BreakerFeedKind, CircuitState};

    #[tokio::test]
    async fn sweep_advances_expired_breaker_to_half_open() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            failure_window: Duration::from_secs(60),
            cooldown: Duration::from_millis(10),
            half_open_min_successes: 1,
        });
        breaker.record_failure(1, BreakerFeedKind::ProviderError).await;
        assert_eq!(breaker.status(1).await.state, CircuitState::Open);

        tokio::time::sleep(Duration::from_millis(20)).await;

        let scheduler = IntervalProbeScheduler::new(|| vec![1]);
        scheduler.spawn(breaker.clone(), Duration::from_millis(5));
        tokio::time::sleep(Duration::from_millis(30)).await;

        assert_eq!(breaker.status(1).await.state, CircuitState::HalfOpen);
    }
}
