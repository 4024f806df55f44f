//! Closes the loop the guard pipeline and provider selector only open:
//! once a response's status (and, when available, usage) is known, release
//! the provider's concurrency admission (spec §4.3 step 8 pairs an atomic
//! *admit* with an eventual release), feed the circuit breaker (spec §4.5),
//! track spend for the next request's rate-limit check (spec §4.4 "tracking
//! on success"), and update the persisted `message_requests` row in place
//! (spec §4.8).
//!
//! Kept independent of `Session` so callers that only have a response status
//! (not a live session) after the forwarder returns can still finalize.

use gproxy_storage::{MessageRequestOutcome, ProviderChainItemInput, Storage};
use gproxy_transform::middleware::UsageSummary;
use tracing::info;

use crate::circuit_breaker::{BreakerFeedKind, CircuitBreaker};
use crate::limits::DailyResetMode;
use crate::pricing::{BillingModelSource, PriceTable};
use crate::rate_limit::{RateLimitStore, Scope};
use crate::session::{AuthState, ProviderChainItem, Session};

/// Snapshot of the fields `finalize_request` needs, captured from a
/// `Session` once the guard pipeline has run (and, typically, just before
/// the forwarder consumes or drops the session).
pub struct FinalizeContext {
    pub session_id: Option<String>,
    pub message_request_id: Option<i64>,
    pub provider_id: Option<i64>,
    pub key_id: Option<String>,
    pub user_id: Option<String>,
    /// Spec's twelve-step check applies the *user's* daily reset mode to
    /// both key and user daily spend (rate_limit::check_twelve_steps);
    /// tracking mirrors that so a key's recorded spend lands in the same
    /// window its own check read from.
    pub daily_reset_mode: DailyResetMode,
    /// User's configured `HH:mm` daily reset time, mirrored alongside
    /// `daily_reset_mode` for the same reason.
    pub daily_reset_time: Option<String>,
    /// Pre-redirect model name (spec §3 invariant iv billing candidate).
    pub original_model: String,
    /// Model actually forwarded upstream (post-redirect, if any).
    pub model: String,
    /// `cost_multiplier` of the provider this request was sent to.
    pub cost_multiplier: f64,
    /// `requestSequence` assigned to this session as of the snapshot
    /// (`Session::current_sequence`); pairs with `session_id` to address the
    /// `message_requests`/`provider_chain_items` rows this attempt owns.
    pub request_sequence: i32,
    /// Decision chain as of the snapshot. Its last entry is the attempt this
    /// `FinalizeContext` will be finalized against.
    pub provider_chain: Vec<ProviderChainItem>,
}

impl FinalizeContext {
    pub fn from_session(session: &Session) -> Self {
        let (key_id, user_id, daily_reset_mode, daily_reset_time) = match &session.auth {
            Some(AuthState::Success { user, key }) => (
                Some(key.key_id.to_string()),
                Some(user.user_id.to_string()),
                user.limits.daily_reset_mode,
                Some(user.limits.daily_reset_time.clone()),
            ),
            _ => (None, None, DailyResetMode::Fixed, None),
        };
        Self {
            session_id: session.session_id.clone(),
            message_request_id: session.message_request_id,
            provider_id: session.provider_chain.last().map(|item| item.provider_id),
            key_id,
            user_id,
            daily_reset_mode,
            daily_reset_time,
            original_model: session
                .original_model_name()
                .unwrap_or(&session.model)
                .to_string(),
            model: session.model.clone(),
            cost_multiplier: session.cost_multiplier,
            request_sequence: session.current_sequence() as i32,
            provider_chain: session.provider_chain.clone(),
        }
    }
}

/// Resolves `ctx`'s billing candidates against `prices` (spec §4.8 "compute
/// cost"), billing the post-redirect model first and falling back to the
/// pre-redirect name per invariant (iv). `None` if `usage` is absent (no
/// generate response was decoded, e.g. a non-2xx or non-generate request) or
/// neither candidate has a price entry.
pub fn compute_request_cost(
    prices: &PriceTable,
    ctx: &FinalizeContext,
    usage: Option<&UsageSummary>,
) -> Option<f64> {
    let usage = usage?;
    prices.compute_cost(
        &ctx.original_model,
        &ctx.model,
        BillingModelSource::Redirected,
        usage,
        ctx.cost_multiplier,
    )
}

/// Runs once per request after the forwarder's response status (and,
/// best-effort, a computed cost) are known. `cost` is `None` when no price
/// table entry matched the billing candidate model — spec's non-goal is to
/// record the request and proceed rather than fail it.
pub async fn finalize_request(
    breaker: &CircuitBreaker,
    rate_limit: &dyn RateLimitStore,
    storage: &dyn Storage,
    ctx: &FinalizeContext,
    status: u16,
    cost: Option<f64>,
    usage: Option<&UsageSummary>,
    duration_ms: Option<i64>,
) {
    let success = (200..300).contains(&status);

    if let (Some(provider_id), Some(session_id)) = (ctx.provider_id, ctx.session_id.as_deref()) {
        let owner_key = format!("provider:{provider_id}:concurrent");
        rate_limit.release_concurrent(&owner_key, session_id).await;

        // Only upstream errors feed the breaker (spec §4.5: SYSTEM_ERROR,
        // CLIENT_ABORT, NON_RETRYABLE_CLIENT_ERROR, RESOURCE_NOT_FOUND do
        // not). This layer only has a status code to go on, so a 4xx/5xx
        // here is treated as PROVIDER_ERROR; finer-grained classification
        // happens earlier, in the forwarder, via `error_rules::classify`.
        if success {
            breaker.record_success(provider_id).await;
        } else {
            breaker
                .record_failure(provider_id, BreakerFeedKind::ProviderError)
                .await;
        }
    }

    if success && let Some(cost) = cost.filter(|c| *c > 0.0) {
        if let Some(key_id) = &ctx.key_id {
            rate_limit
                .track_success(
                    Scope::Key,
                    key_id,
                    ctx.daily_reset_mode,
                    ctx.daily_reset_time.as_deref(),
                    cost,
                )
                .await;
        }
        if let Some(user_id) = &ctx.user_id {
            rate_limit
                .track_success(
                    Scope::User,
                    user_id,
                    ctx.daily_reset_mode,
                    ctx.daily_reset_time.as_deref(),
                    cost,
                )
                .await;
        }
        if let Some(provider_id) = ctx.provider_id {
            rate_limit
                .track_success(
                    Scope::Provider,
                    &provider_id.to_string(),
                    DailyResetMode::Fixed,
                    None,
                    cost,
                )
                .await;
        }
    }

    if let (Some(session_id), Some(item)) =
        (ctx.session_id.as_deref(), ctx.provider_chain.last())
    {
        let _ = storage
            .append_provider_chain_item(ProviderChainItemInput {
                session_id,
                request_sequence: ctx.request_sequence,
                provider_id: item.provider_id,
                attempt_no: item.attempt_no as i32,
                outcome: if success { "success" } else { "error" },
                reason: Some(item.reason.as_str()),
            })
            .await;
    }

    if let Some(id) = ctx.message_request_id {
        let status_label = if success { "success" } else { "error" };
        let outcome = MessageRequestOutcome {
            status: status_label,
            status_code: Some(i32::from(status)),
            provider_id: ctx.provider_id,
            final_model: Some(&ctx.model),
            cost,
            duration_ms,
            // TTFB needs instrumentation at the streaming layer
            // (`UpstreamHttpResponse` carries no timing today); left
            // unset until that lands.
            ttfb_ms: None,
            input_tokens: usage.and_then(|u| u.input_tokens).map(i64::from),
            output_tokens: usage.and_then(|u| u.output_tokens).map(i64::from),
            cache_read_tokens: usage
                .and_then(|u| u.cache_read_input_tokens)
                .map(i64::from),
            cache_creation_5m_tokens: usage
                .and_then(|u| u.cache_creation_5m_tokens)
                .map(i64::from),
            cache_creation_1h_tokens: usage
                .and_then(|u| u.cache_creation_1h_tokens)
                .map(i64::from),
            error_message: None,
            error_stack: None,
            special_settings: None,
        };
        let _ = storage.update_message_request(id, outcome).await;
        info!(
            event = "request.finalized",
            message_request_id = id,
            provider_id = ?ctx.provider_id,
            status,
            cost = ?cost
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::circuit_breaker::{BreakerConfig, CircuitState};
    use crate::rate_limit::InMemoryRateLimitStore;
    use gproxy_storage::snapshot::{GlobalConfigRow, MessageRequestRow, StorageSnapshot};
    use gproxy_storage::storage::{
        LogQueryFilter, LogQueryResult, MessageRequestOutcome, ProviderChainItemInput, Storage,
        StorageResult, UsageAggregate, UsageAggregateFilter,
    };
    use std::sync::Mutex;

    #[derive(Default)]
    struct FakeStorage {
        updated: Mutex<Vec<(i64, String, Option<i64>, Option<f64>)>>,
        chain_items: Mutex<Vec<(i32, i64, i32, String, Option<String>)>>,
    }

    #[async_trait::async_trait]
    impl Storage for FakeStorage {
        async fn sync(&self) -> StorageResult<()> {
            Ok(())
        }
        async fn load_global_config(&self) -> StorageResult<Option<GlobalConfigRow>> {
            Ok(None)
        }
        async fn upsert_global_config(&self, _config: &gproxy_common::GlobalConfig) -> StorageResult<()> {
            Ok(())
        }
        async fn load_snapshot(&self) -> StorageResult<StorageSnapshot> {
            Ok(StorageSnapshot {
                global_config: None,
                providers: Vec::new(),
                credentials: Vec::new(),
                users: Vec::new(),
                user_keys: Vec::new(),
            })
        }
        async fn upsert_provider(
            &self,
            _name: &str,
            _config_json: &serde_json::Value,
            _routing_json: &serde_json::Value,
            _enabled: bool,
        ) -> StorageResult<i64> {
            Ok(1)
        }
        async fn set_provider_routing(
            &self,
            _provider_id: i64,
            _routing_json: &serde_json::Value,
        ) -> StorageResult<()> {
            Ok(())
        }
        async fn delete_provider(&self, _name: &str) -> StorageResult<()> {
            Ok(())
        }
        async fn insert_credential(
            &self,
            _provider_name: &str,
            _name: Option<&str>,
            _settings_json: &serde_json::Value,
            _secret_json: &serde_json::Value,
            _enabled: bool,
        ) -> StorageResult<i64> {
            Ok(1)
        }
        async fn update_credential(
            &self,
            _credential_id: i64,
            _name: Option<&str>,
            _settings_json: &serde_json::Value,
            _secret_json: &serde_json::Value,
        ) -> StorageResult<()> {
            Ok(())
        }
        async fn set_credential_enabled(&self, _id: i64, _enabled: bool) -> StorageResult<()> {
            Ok(())
        }
        async fn delete_credential(&self, _id: i64) -> StorageResult<()> {
            Ok(())
        }
        async fn upsert_user_by_id(
            &self,
            _user_id: i64,
            _name: &str,
            _enabled: bool,
            _limits_json: &serde_json::Value,
        ) -> StorageResult<()> {
            Ok(())
        }
        async fn set_user_enabled(&self, _id: i64, _enabled: bool) -> StorageResult<()> {
            Ok(())
        }
        async fn set_user_limits(&self, _id: i64, _limits_json: &serde_json::Value) -> StorageResult<()> {
            Ok(())
        }
        async fn delete_user(&self, _id: i64) -> StorageResult<()> {
            Ok(())
        }
        async fn insert_user_key(
            &self,
            _user_id: i64,
            _api_key: &str,
            _label: Option<&str>,
            _enabled: bool,
            _routing_json: &serde_json::Value,
        ) -> StorageResult<i64> {
            Ok(1)
        }
        async fn set_user_key_enabled(&self, _id: i64, _enabled: bool) -> StorageResult<()> {
            Ok(())
        }
        async fn update_user_key_label(&self, _id: i64, _label: Option<&str>) -> StorageResult<()> {
            Ok(())
        }
        async fn set_user_key_routing(
            &self,
            _id: i64,
            _routing_json: &serde_json::Value,
        ) -> StorageResult<()> {
            Ok(())
        }
        async fn delete_user_key(&self, _id: i64) -> StorageResult<()> {
            Ok(())
        }
        async fn append_event(&self, _event: &gproxy_provider_core::Event) -> StorageResult<()> {
            Ok(())
        }
        async fn aggregate_usage_tokens(
            &self,
            _filter: UsageAggregateFilter,
        ) -> StorageResult<UsageAggregate> {
            Ok(UsageAggregate::default())
        }
        async fn query_logs(&self, _filter: LogQueryFilter) -> StorageResult<LogQueryResult> {
            Ok(LogQueryResult { rows: Vec::new(), has_more: false })
        }
        async fn append_provider_chain_item(
            &self,
            item: ProviderChainItemInput<'_>,
        ) -> StorageResult<i64> {
            self.chain_items.lock().unwrap().push((
                item.request_sequence,
                item.provider_id,
                item.attempt_no,
                item.outcome.to_string(),
                item.reason.map(|s| s.to_string()),
            ));
            Ok(1)
        }
        async fn insert_message_request(
            &self,
            _session_id: &str,
            _request_sequence: i32,
            _user_id: Option<i64>,
            _user_key_id: Option<i64>,
            _original_model_name: &str,
            _model: &str,
        ) -> StorageResult<i64> {
            Ok(1)
        }
        async fn update_message_request(
            &self,
            id: i64,
            outcome: MessageRequestOutcome<'_>,
        ) -> StorageResult<()> {
            self.updated.lock().unwrap().push((
                id,
                outcome.status.to_string(),
                outcome.provider_id,
                outcome.cost,
            ));
            Ok(())
        }
        async fn find_message_request(
            &self,
            _session_id: &str,
            _request_sequence: i32,
        ) -> StorageResult<Option<MessageRequestRow>> {
            Ok(None)
        }
    }

    #[tokio::test]
    async fn success_feeds_breaker_and_updates_row() {
        let breaker = CircuitBreaker::new(BreakerConfig::default());
        let rate_limit = InMemoryRateLimitStore::new();
        let storage = FakeStorage::default();
        let ctx = FinalizeContext {
            session_id: Some("sess_1".to_string()),
            message_request_id: Some(42),
            provider_id: Some(7),
            key_id: Some("1".to_string()),
            user_id: Some("2".to_string()),
            daily_reset_mode: DailyResetMode::Fixed,
            daily_reset_time: None,
            original_model: "claude-opus".to_string(),
            model: "claude-opus".to_string(),
            cost_multiplier: 1.0,
            request_sequence: 1,
            provider_chain: vec![ProviderChainItem {
                provider_id: 7,
                provider_name: "anthropic".to_string(),
                reason: crate::session::ChainReason::InitialSelection,
                attempt_no: 1,
                status_code: None,
                circuit_state: "closed".to_string(),
                circuit_failure_count: 0,
                at: "2026-01-01T00:00:00Z".to_string(),
            }],
        };

        let usage = UsageSummary {
            input_tokens: Some(100),
            output_tokens: Some(50),
            cache_read_input_tokens: None,
            cache_creation_input_tokens: None,
            cache_creation_5m_tokens: None,
            cache_creation_1h_tokens: None,
        };
        finalize_request(
            breaker.as_ref(),
            rate_limit.as_ref(),
            &storage,
            &ctx,
            200,
            Some(0.05),
            Some(&usage),
            Some(120),
        )
        .await;

        assert_eq!(breaker.status(7).await.state, CircuitState::Closed);
        let updated = storage.updated.lock().unwrap();
        assert_eq!(updated.len(), 1);
        assert_eq!(updated[0], (42, "success".to_string(), Some(7), Some(0.05)));
        let chain_items = storage.chain_items.lock().unwrap();
        assert_eq!(chain_items.len(), 1);
        assert_eq!(chain_items[0].3, "success");

        let spent = rate_limit
            .cost_sum(Scope::Key, "1", crate::rate_limit::Period::Total, DailyResetMode::Fixed, None)
            .await;
        assert!((spent - 0.05).abs() < 1e-9);
    }

    #[tokio::test]
    async fn failure_does_not_track_spend_but_updates_row() {
        let breaker = CircuitBreaker::new(BreakerConfig {
            failure_threshold: 1,
            ..BreakerConfig::default()
        });
        let rate_limit = InMemoryRateLimitStore::new();
        let storage = FakeStorage::default();
        let ctx = FinalizeContext {
            session_id: Some("sess_1".to_string()),
            message_request_id: Some(9),
            provider_id: Some(3),
            key_id: Some("1".to_string()),
            user_id: Some("2".to_string()),
            daily_reset_mode: DailyResetMode::Fixed,
            daily_reset_time: None,
            original_model: "claude-opus".to_string(),
            model: "claude-opus".to_string(),
            cost_multiplier: 1.0,
            request_sequence: 1,
            provider_chain: vec![ProviderChainItem {
                provider_id: 3,
                provider_name: "anthropic".to_string(),
                reason: crate::session::ChainReason::InitialSelection,
                attempt_no: 1,
                status_code: None,
                circuit_state: "closed".to_string(),
                circuit_failure_count: 0,
                at: "2026-01-01T00:00:00Z".to_string(),
            }],
        };

        finalize_request(
            breaker.as_ref(),
            rate_limit.as_ref(),
            &storage,
            &ctx,
            502,
            Some(0.05),
            None,
            None,
        )
        .await;

        assert_eq!(breaker.status(3).await.state, CircuitState::Open);
        let spent = rate_limit
            .cost_sum(Scope::Key, "1", crate::rate_limit::Period::Total, DailyResetMode::Fixed, None)
            .await;
        assert_eq!(spent, 0.0);
        let updated = storage.updated.lock().unwrap();
        assert_eq!(updated[0].1, "error");
    }

    #[test]
    fn compute_request_cost_bills_redirected_model_first() {
        let mut entries = std::collections::HashMap::new();
        entries.insert(
            "provider-internal-name".to_string(),
            crate::pricing::PriceEntry {
                input_cost_per_token: 0.00001,
                output_cost_per_token: 0.00002,
                ..Default::default()
            },
        );
        let prices = PriceTable::new(entries);
        let ctx = FinalizeContext {
            session_id: None,
            message_request_id: None,
            provider_id: None,
            key_id: None,
            user_id: None,
            daily_reset_mode: DailyResetMode::Fixed,
            daily_reset_time: None,
            original_model: "claude-opus".to_string(),
            model: "provider-internal-name".to_string(),
            cost_multiplier: 1.0,
            request_sequence: 0,
            provider_chain: Vec::new(),
        };
        let usage = UsageSummary {
            input_tokens: Some(1000),
            output_tokens: Some(500),
            cache_read_input_tokens: None,
            cache_creation_input_tokens: None,
            cache_creation_5m_tokens: None,
            cache_creation_1h_tokens: None,
        };
        let cost = compute_request_cost(&prices, &ctx, Some(&usage));
        assert!(cost.is_some());
    }

    #[test]
    fn compute_request_cost_none_without_usage() {
        let prices = PriceTable::empty();
        let ctx = FinalizeContext {
            session_id: None,
            message_request_id: None,
            provider_id: None,
            key_id: None,
            user_id: None,
            daily_reset_mode: DailyResetMode::Fixed,
            daily_reset_time: None,
            original_model: "claude-opus".to_string(),
            model: "claude-opus".to_string(),
            cost_multiplier: 1.0,
            request_sequence: 0,
            provider_chain: Vec::new(),
        };
        assert_eq!(compute_request_cost(&prices, &ctx, None), None);
    }
}
