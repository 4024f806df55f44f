//! Ties the guard pipeline and provider selector (spec §4.2-4.3) into
//! `ProxyEngine`, for the router's no-explicit-provider endpoints. Endpoints
//! that still name a provider in the URL or in `"provider/model"` keep using
//! `handle_protocol` directly; this path exists so automatic selection has a
//! single, storage-backed entry point instead of being reimplemented per
//! handler.

use std::collections::HashSet;

use bytes::Bytes;

use gproxy_provider_core::Headers;
use gproxy_storage::snapshot::{UserKeyRow, UserRow};

use crate::guard::{self, GuardOutcome, GuardPipelineResources, GuardPreset, GuardResponse};
use crate::limits::{KeyLimits, UserLimits};
use crate::session::{
    AuthState, AuthenticatedKey, AuthenticatedUser, ChainReason, ProviderChainItem, Session,
    SessionError,
};

use super::{ProxyAuth, ProxyEngine};

/// Result of running the guard pipeline ahead of dispatch.
pub enum PipelineOutcome {
    /// A guard short-circuited (auth failure, rate limit, no eligible
    /// provider, ...). Render this response to the caller as-is.
    Respond(GuardResponse),
    /// Every guard passed. `session.provider_chain` carries the selected
    /// provider; `session.model` is the (possibly rewritten) model name.
    Continue(Box<Session>),
}

impl ProxyEngine {
    /// Runs `preset` against a freshly built `Session` for `body_raw`,
    /// selecting a provider automatically instead of requiring one named in
    /// the URL. `auth` is the identity the router's own auth middleware
    /// already resolved (and whose credential it already stripped from
    /// `headers`), so the pipeline's auth step is satisfied from `auth`
    /// instead of re-extracting a credential that is no longer present.
    pub async fn run_guard_pipeline(
        &self,
        method: String,
        url: String,
        headers: Headers,
        body_raw: Bytes,
        preset: GuardPreset,
        auth: &ProxyAuth,
    ) -> PipelineOutcome {
        let mut session = match Session::from_request(method, url, headers, body_raw) {
            Ok(s) => s,
            Err(SessionError::BodyTooLargeWithoutModel) => {
                return PipelineOutcome::Respond(GuardResponse::error(
                    413,
                    "invalid_request_error",
                    "request body exceeds the proxy limit and no model could be determined",
                ));
            }
        };

        let snapshot = self.state.snapshot.load_full();
        let providers = snapshot.providers.clone();
        let users = snapshot.users.clone();
        let user_keys = snapshot.user_keys.clone();

        let Some(user_row) = users.iter().find(|u| u.id == auth.user_id && u.enabled) else {
            return PipelineOutcome::Respond(GuardResponse::error(
                401,
                "authentication_error",
                "user is disabled or no longer exists",
            ));
        };
        let Some(key_row) = user_keys
            .iter()
            .find(|k| k.id == auth.user_key_id && k.enabled)
        else {
            return PipelineOutcome::Respond(GuardResponse::error(
                401,
                "authentication_error",
                "key is disabled or no longer exists",
            ));
        };
        session.auth = Some(AuthState::Success {
            user: AuthenticatedUser {
                user_id: user_row.id,
                user_name: user_row.name.clone(),
                limits: UserLimits::from_json(&user_row.limits_json),
            },
            key: AuthenticatedKey {
                key_id: key_row.id,
                credential_prefix: key_row.api_key.chars().take(10).collect(),
                limits: KeyLimits::from_json(&key_row.routing_json),
            },
        });

        let lookup_key = move |credential: &str| -> Option<(UserRow, UserKeyRow)> {
            let key = user_keys
                .iter()
                .find(|k| k.enabled && k.api_key == credential)?;
            let user = users.iter().find(|u| u.id == key.user_id && u.enabled)?;
            Some((user.clone(), key.clone()))
        };

        let resources = GuardPipelineResources {
            breaker: self.state.breaker.clone(),
            rate_limit: self.state.rate_limit.clone(),
            selector: self.state.selector.clone(),
            storage: self.storage.clone(),
            global: self.state.global.load_full(),
            request_filters: self.state.request_filters.load_full(),
        };

        let outcome =
            guard::run_pipeline(&mut session, &resources, preset, &providers, lookup_key).await;
        match outcome {
            GuardOutcome::Respond(r) => PipelineOutcome::Respond(r),
            GuardOutcome::Continue => PipelineOutcome::Continue(Box::new(session)),
        }
    }

    /// Counterpart to `run_guard_pipeline`/provider selection: releases the
    /// concurrency admission, feeds the circuit breaker, tracks spend, and
    /// updates the `message_requests` row once the forwarder's response
    /// status and usage (when the attempt decoded a generate response) are
    /// known (spec §4.3 step 8, §4.4, §4.5, §4.8). Cost is computed from
    /// `usage` against the live price table and left uncharged (`None`)
    /// when there is no usage or no matching price entry.
    pub async fn finalize_request(
        &self,
        ctx: &crate::finalize::FinalizeContext,
        status: u16,
        usage: Option<&gproxy_transform::middleware::UsageSummary>,
        duration_ms: Option<i64>,
    ) {
        let cost = crate::finalize::compute_request_cost(self.state.prices.as_ref(), ctx, usage);
        crate::finalize::finalize_request(
            self.state.breaker.as_ref(),
            self.state.rate_limit.as_ref(),
            self.storage.as_ref(),
            ctx,
            status,
            cost,
            usage,
            duration_ms,
        )
        .await;
    }

    /// Cross-provider failover (spec §4.7 step 5): called once a dispatch to
    /// an auto-selected provider comes back classified as `PROVIDER_ERROR`.
    /// Records the failure as a `RetryFailed` chain item, then re-runs
    /// provider selection with `failed_provider_id` excluded. Returns the new
    /// `(provider_name, model, FinalizeContext)` to retry with, or `None` if
    /// no alternate provider is eligible (the caller keeps the original
    /// response).
    pub async fn reselect_after_failure(
        &self,
        session: &mut Session,
        failed_provider_id: i64,
        failed_status: Option<u16>,
    ) -> Option<(String, String, crate::finalize::FinalizeContext)> {
        let failed_name = session
            .provider_chain
            .iter()
            .rev()
            .find(|item| item.provider_id == failed_provider_id)
            .map(|item| item.provider_name.clone())
            .unwrap_or_default();
        let circuit = self.state.breaker.status(failed_provider_id).await;
        session.push_chain_item(ProviderChainItem {
            provider_id: failed_provider_id,
            provider_name: failed_name,
            reason: if failed_status.is_some() {
                ChainReason::RetryFailed
            } else {
                ChainReason::SystemError
            },
            attempt_no: session.provider_chain.len() as u32 + 1,
            status_code: failed_status,
            circuit_state: circuit.state.as_str().to_string(),
            circuit_failure_count: circuit.failure_count,
            at: time::OffsetDateTime::now_utc().to_string(),
        });

        let snapshot = self.state.snapshot.load_full();
        let mut excluded = HashSet::new();
        excluded.insert(failed_provider_id);

        let outcome = guard::provider_guard(
            self.state.selector.as_ref(),
            self.state.rate_limit.as_ref(),
            self.state.breaker.as_ref(),
            session,
            &snapshot.providers,
            &excluded,
        )
        .await;

        match outcome {
            GuardOutcome::Continue => {
                let provider_name = session.provider_chain.last()?.provider_name.clone();
                let model = session.model.clone();
                let ctx = crate::finalize::FinalizeContext::from_session(session);
                Some((provider_name, model, ctx))
            }
            GuardOutcome::Respond(_) => None,
        }
    }
}
