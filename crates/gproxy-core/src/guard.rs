//! Guard Pipeline (spec §4.2): an ordered list of independent admission
//! checks, each returning either "continue" or a finished response.

use std::collections::HashSet;
use std::sync::Arc;

use regex::Regex;
use serde_json::Value as JsonValue;
use tracing::{info, warn};

use gproxy_common::GlobalConfig;
use gproxy_provider_core::Headers;
use gproxy_storage::snapshot::{ProviderRow, UserKeyRow, UserRow};
use gproxy_storage::Storage;

use crate::circuit_breaker::CircuitBreaker;
use crate::limits::{KeyLimits, ProviderRouting, UserLimits};
use crate::rate_limit::{check_twelve_steps, RateLimitStore};
use crate::selector::ProviderSelector;
use crate::session::{
    generate_deterministic_session_id, AuthState, AuthenticatedKey, AuthenticatedUser, ChainReason,
    FormatDialect, ProviderChainItem, Session,
};

/// Minimal HTTP response a guard step can short-circuit with. Kept decoupled
/// from axum so this crate doesn't need to depend on it.
#[derive(Debug, Clone)]
pub struct GuardResponse {
    pub status: u16,
    pub body: JsonValue,
    pub headers: Vec<(String, String)>,
}

impl GuardResponse {
    pub fn error(status: u16, error_type: &str, message: impl Into<String>) -> Self {
        Self {
            status,
            body: serde_json::json!({"error": {"type": error_type, "message": message.into()}}),
            headers: Vec::new(),
        }
    }
}

pub enum GuardOutcome {
    Continue,
    Respond(GuardResponse),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardPreset {
    Chat,
    CountTokens,
}

impl GuardPreset {
    pub fn steps(&self) -> &'static [GuardStep] {
        match self {
            GuardPreset::Chat => &[
                GuardStep::Auth,
                GuardStep::Sensitive,
                GuardStep::Client,
                GuardStep::Model,
                GuardStep::Version,
                GuardStep::Probe,
                GuardStep::Session,
                GuardStep::Warmup,
                GuardStep::RequestFilter,
                GuardStep::RateLimit,
                GuardStep::Provider,
                GuardStep::ProviderRequestFilter,
                GuardStep::MessageContext,
            ],
            GuardPreset::CountTokens => &[
                GuardStep::Auth,
                GuardStep::Client,
                GuardStep::Model,
                GuardStep::Version,
                GuardStep::Probe,
                GuardStep::RequestFilter,
                GuardStep::Provider,
                GuardStep::ProviderRequestFilter,
            ],
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GuardStep {
    Auth,
    Sensitive,
    Client,
    Model,
    Version,
    Probe,
    Session,
    Warmup,
    RequestFilter,
    RateLimit,
    Provider,
    ProviderRequestFilter,
    MessageContext,
}

/// Header/body content filter applied pre-selection (4.2.f) and again scoped
/// to the chosen provider/group (4.2.j).
#[derive(Debug, Clone)]
pub struct RequestFilter {
    pub scope: FilterScope,
    pub action: FilterAction,
    pub match_type: MatchType,
    pub target: String,
    pub replacement: String,
    pub group_tags: Vec<String>,
    compiled: Option<Regex>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterScope {
    Header,
    Body,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterAction {
    Remove,
    Set,
    JsonPath,
    TextReplace,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchType {
    Exact,
    Contains,
    Regex,
}

impl RequestFilter {
    /// Compiles the regex (if any) and rejects catastrophically-backtracking
    /// patterns at load time, per the spec's ReDoS safety requirement.
    pub fn compile(
        scope: FilterScope,
        action: FilterAction,
        match_type: MatchType,
        target: String,
        replacement: String,
        group_tags: Vec<String>,
    ) -> Result<Self, String> {
        let compiled = if match_type == MatchType::Regex {
            if looks_redos_prone(&target) {
                return Err(format!("rejected potentially catastrophic regex: {target}"));
            }
            Some(Regex::new(&target).map_err(|e| e.to_string())?)
        } else {
            None
        };
        Ok(Self {
            scope,
            action,
            match_type,
            target,
            replacement,
            group_tags,
            compiled,
        })
    }

    /// Parses a `gproxy_common::RequestFilterSpec` (the admin-facing,
    /// DB-persisted form) into a compiled filter. Invalid scope/action/
    /// match_type strings or rejected regexes are logged and skipped rather
    /// than failing config load, matching the guard pipeline's fail-open
    /// stance on filter configuration.
    pub fn from_spec(spec: &gproxy_common::RequestFilterSpec) -> Option<Self> {
        let scope = match spec.scope.as_str() {
            "header" => FilterScope::Header,
            "body" => FilterScope::Body,
            other => {
                warn!(event = "guard.request_filter_invalid", field = "scope", value = other);
                return None;
            }
        };
        let action = match spec.action.as_str() {
            "remove" => FilterAction::Remove,
            "set" => FilterAction::Set,
            "json_path" => FilterAction::JsonPath,
            "text_replace" => FilterAction::TextReplace,
            other => {
                warn!(event = "guard.request_filter_invalid", field = "action", value = other);
                return None;
            }
        };
        let match_type = match spec.match_type.as_str() {
            "exact" => MatchType::Exact,
            "contains" => MatchType::Contains,
            "regex" => MatchType::Regex,
            other => {
                warn!(event = "guard.request_filter_invalid", field = "match_type", value = other);
                return None;
            }
        };
        match Self::compile(
            scope,
            action,
            match_type,
            spec.target.clone(),
            spec.replacement.clone(),
            spec.group_tags.clone(),
        ) {
            Ok(filter) => Some(filter),
            Err(reason) => {
                warn!(event = "guard.request_filter_rejected", reason = %reason);
                None
            }
        }
    }

    fn matches(&self, value: &str) -> bool {
        match self.match_type {
            MatchType::Exact => value == self.target,
            MatchType::Contains => value.contains(&self.target),
            MatchType::Regex => self.compiled.as_ref().map(|re| re.is_match(value)).unwrap_or(false),
        }
    }
}

/// Rejects regex patterns with nested quantifiers over the same group, a
/// common catastrophic-backtracking shape (e.g. `(a+)+`, `(a*)*`).
fn looks_redos_prone(pattern: &str) -> bool {
    let nested = Regex::new(r"\([^()]*[+*]\)[+*]").unwrap();
    nested.is_match(pattern)
}

/// Applies `filters` (optionally restricted to `scoped_group_tags`) to the
/// request's headers and body. Failures never block the request (fail-open).
pub fn apply_request_filters(
    session: &mut Session,
    filters: &[RequestFilter],
    scoped_group_tags: Option<&[String]>,
) {
    for filter in filters {
        if let Some(tags) = scoped_group_tags {
            if !filter.group_tags.is_empty() && !filter.group_tags.iter().any(|t| tags.contains(t)) {
                continue;
            }
        }
        match filter.scope {
            FilterScope::Header => apply_header_filter(session, filter),
            FilterScope::Body => apply_body_filter(session, filter),
        }
    }
}

fn apply_header_filter(session: &mut Session, filter: &RequestFilter) {
    match filter.action {
        FilterAction::Remove => {
            session.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(&filter.target));
        }
        FilterAction::Set => {
            session.headers.retain(|(k, _)| !k.eq_ignore_ascii_case(&filter.target));
            session.headers.push((filter.target.clone(), filter.replacement.clone()));
        }
        FilterAction::TextReplace => {
            for (_, v) in session.headers.iter_mut() {
                if filter.matches(v) {
                    *v = apply_replacement(v, filter);
                }
            }
        }
        FilterAction::JsonPath => {}
    }
}

fn apply_body_filter(session: &mut Session, filter: &RequestFilter) {
    match filter.action {
        FilterAction::JsonPath => {
            if let Some(v) = json_path_get_mut(&mut session.body_json, &filter.target) {
                *v = serde_json::Value::String(filter.replacement.clone());
            }
        }
        FilterAction::TextReplace => {
            walk_and_replace_strings(&mut session.body_json, filter);
        }
        FilterAction::Remove | FilterAction::Set => {}
    }
}

fn apply_replacement(value: &str, filter: &RequestFilter) -> String {
    match filter.match_type {
        MatchType::Regex => filter
            .compiled
            .as_ref()
            .map(|re| re.replace_all(value, filter.replacement.as_str()).into_owned())
            .unwrap_or_else(|| value.to_string()),
        _ => value.replace(&filter.target, &filter.replacement),
    }
}

fn walk_and_replace_strings(value: &mut JsonValue, filter: &RequestFilter) {
    match value {
        JsonValue::String(s) => {
            if filter.matches(s) {
                *s = apply_replacement(s, filter);
            }
        }
        JsonValue::Array(arr) => {
            for item in arr.iter_mut() {
                walk_and_replace_strings(item, filter);
            }
        }
        JsonValue::Object(map) => {
            for (_, v) in map.iter_mut() {
                walk_and_replace_strings(v, filter);
            }
        }
        _ => {}
    }
}

/// Resolves a dot-path (`a.b.c`) mutably; does not create missing segments.
fn json_path_get_mut<'a>(root: &'a mut JsonValue, path: &str) -> Option<&'a mut JsonValue> {
    let mut current = root;
    for segment in path.split('.') {
        current = current.get_mut(segment)?;
    }
    Some(current)
}

/// 4.2.a: extracts and validates a credential from one of the three accepted
/// sources, rejecting conflicting values across sources.
pub fn auth_guard(
    session: &mut Session,
    lookup_key: impl Fn(&str) -> Option<(UserRow, UserKeyRow)>,
) -> GuardOutcome {
    let bearer = gproxy_provider_core::header_get(&session.headers, "authorization")
        .and_then(|v| v.strip_prefix("Bearer ").map(|s| s.trim().to_string()));
    let api_key_header = gproxy_provider_core::header_get(&session.headers, "x-api-key").map(|s| s.to_string());
    let goog_header = gproxy_provider_core::header_get(&session.headers, "x-goog-api-key")
        .map(|s| s.to_string())
        .or_else(|| query_param(&session.url, "key"));

    let candidates: Vec<String> = [bearer, api_key_header, goog_header].into_iter().flatten().collect();
    let mut distinct: Vec<&String> = Vec::new();
    for c in &candidates {
        if !distinct.contains(&c) {
            distinct.push(c);
        }
    }
    if distinct.len() > 1 {
        return respond_auth_failure(session, 401, "authentication_error", "conflicting credentials");
    }
    let Some(credential) = distinct.first() else {
        return respond_auth_failure(session, 401, "authentication_error", "missing credentials");
    };

    let Some((user_row, key_row)) = lookup_key(credential) else {
        return respond_auth_failure(session, 401, "authentication_error", "invalid credentials");
    };

    if !user_row.enabled {
        return respond_auth_failure(session, 401, "user_disabled", "user is disabled");
    }

    let user_limits = UserLimits::from_json(&user_row.limits_json);
    if let Some(expires_at) = &user_limits.expires_at {
        if let Ok(expiry) = time::OffsetDateTime::parse(expires_at, &time::format_description::well_known::Rfc3339) {
            if time::OffsetDateTime::now_utc() > expiry {
                return respond_auth_failure(session, 401, "user_expired", "user access has expired");
            }
        }
    }

    let key_limits = KeyLimits::from_json(&key_row.routing_json);
    session.auth = Some(AuthState::Success {
        user: AuthenticatedUser {
            user_id: user_row.id,
            user_name: user_row.name.clone(),
            limits: user_limits,
        },
        key: AuthenticatedKey {
            key_id: key_row.id,
            credential_prefix: credential.chars().take(10).collect(),
            limits: key_limits,
        },
    });
    GuardOutcome::Continue
}

fn respond_auth_failure(session: &mut Session, status: u16, error_type: &'static str, message: &str) -> GuardOutcome {
    warn!(event = "guard.auth_rejected", error_type, status, session_id = ?session.session_id);
    session.auth = Some(AuthState::Failure {
        status,
        error_type,
        message: message.to_string(),
    });
    GuardOutcome::Respond(GuardResponse::error(status, error_type, message))
}

fn query_param<'a>(url: &'a str, name: &str) -> Option<String> {
    let (_, query) = url.split_once('?')?;
    query.split('&').find_map(|pair| {
        let (k, v) = pair.split_once('=')?;
        (k == name).then(|| v.to_string())
    })
}

const CLAUDE_CLI_SYSTEM_MARKER: &str = "You are Claude Code, Anthropic's official CLI for Claude";

fn claude_user_id_regex() -> Regex {
    Regex::new(r"^user_[a-f0-9]{64}_account__session_[a-f0-9-]{36}$").unwrap()
}

/// 4.2.b: non-Claude-CLI traffic on the Claude wire format is force-routed to
/// the `2api` group and marked for disguise; `allowedClients` is enforced
/// for every format.
pub fn client_guard(session: &mut Session, user_agent: Option<&str>, allowed_clients: &[String]) -> GuardOutcome {
    if session.original_format == FormatDialect::Claude {
        let is_cli = is_claude_cli(session, user_agent);
        if !is_cli {
            session.needs_claude_disguise = true;
            force_group(session, "2api");
        }
    }

    if !allowed_clients.is_empty() {
        let ua = normalize_client_token(user_agent.unwrap_or_default());
        let allowed = allowed_clients
            .iter()
            .any(|pattern| ua.contains(&normalize_client_token(pattern)));
        if !allowed {
            return GuardOutcome::Respond(GuardResponse::error(403, "forbidden_client", "client not allowed"));
        }
    }
    GuardOutcome::Continue
}

fn normalize_client_token(s: &str) -> String {
    s.to_ascii_lowercase().replace(['-', '_'], "")
}

fn is_claude_cli(session: &Session, user_agent: Option<&str>) -> bool {
    let ua_matches = user_agent.map(|ua| ua.to_ascii_lowercase().contains("claude-cli")).unwrap_or(false);
    if !ua_matches {
        return false;
    }
    let has_system_marker = (0..2).any(|i| {
        session
            .body_json
            .get("system")
            .and_then(|s| s.get(i))
            .and_then(|v| v.as_str().or_else(|| v.get("text").and_then(|t| t.as_str())))
            .map(|text| text.contains(CLAUDE_CLI_SYSTEM_MARKER))
            .unwrap_or(false)
    });
    let user_id_matches = session
        .body_json
        .get("metadata")
        .and_then(|m| m.get("user_id"))
        .and_then(|v| v.as_str())
        .map(|id| claude_user_id_regex().is_match(id))
        .unwrap_or(false);
    has_system_marker && user_id_matches
}

fn force_group(session: &mut Session, group: &str) {
    if let Some(AuthState::Success { key, .. }) = session.auth.as_mut() {
        key.limits.provider_group = Some(group.to_string());
    }
}

/// 4.2.c model guard.
pub fn model_guard(session: &Session, allowed_models: &[String]) -> GuardOutcome {
    if allowed_models.is_empty() {
        return GuardOutcome::Continue;
    }
    let matches = allowed_models.iter().any(|m| m.eq_ignore_ascii_case(&session.model));
    if matches {
        GuardOutcome::Continue
    } else {
        GuardOutcome::Respond(GuardResponse::error(400, "invalid_request", "model not allowed"))
    }
}

/// 4.2.c probe guard: a single user turn of exactly `foo`/`count`, across
/// whichever turn shape the client's format dialect carries (spec §4.2.c
/// runs this guard unconditionally for every format the Chat/CountTokens
/// presets serve, not just Claude's `messages`).
pub fn probe_guard(session: &Session) -> GuardOutcome {
    let Some((turns, role_field)) = probe_turns(session) else {
        return GuardOutcome::Continue;
    };
    if turns.len() != 1 {
        return GuardOutcome::Continue;
    }
    let Some(turn) = turns.first() else {
        return GuardOutcome::Continue;
    };
    if turn.get(role_field).and_then(|r| r.as_str()) != Some("user") {
        return GuardOutcome::Continue;
    }
    let text = extract_message_text(turn, session.original_format);
    let normalized = text.trim().to_ascii_lowercase();
    if normalized == "foo" || normalized == "count" {
        GuardOutcome::Respond(GuardResponse {
            status: 200,
            body: serde_json::json!({"input_tokens": 0}),
            headers: Vec::new(),
        })
    } else {
        GuardOutcome::Continue
    }
}

/// Locates the turn array and its role key for the session's format dialect.
/// Gemini nests a `request.contents` shape for some callers alongside the
/// top-level `contents` one; both use `role`.
fn probe_turns(session: &Session) -> Option<(&Vec<JsonValue>, &'static str)> {
    let body = &session.body_json;
    match session.original_format {
        FormatDialect::Gemini => body
            .get("contents")
            .and_then(|v| v.as_array())
            .or_else(|| body.get("request").and_then(|r| r.get("contents")).and_then(|v| v.as_array()))
            .map(|turns| (turns, "role")),
        FormatDialect::OpenAiResponse => body
            .get("input")
            .and_then(|v| v.as_array())
            .map(|turns| (turns, "role")),
        FormatDialect::Claude | FormatDialect::OpenAiChat | FormatDialect::GeminiCli => body
            .get("messages")
            .and_then(|v| v.as_array())
            .map(|turns| (turns, "role")),
    }
}

fn extract_message_text(msg: &JsonValue, format: FormatDialect) -> String {
    if format == FormatDialect::Gemini {
        return msg
            .get("parts")
            .and_then(|p| p.as_array())
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                    .collect::<Vec<_>>()
                    .join("")
            })
            .unwrap_or_default();
    }
    if let Some(s) = msg.get("content").and_then(|c| c.as_str()) {
        return s.to_string();
    }
    msg.get("content")
        .and_then(|c| c.as_array())
        .map(|blocks| {
            blocks
                .iter()
                .filter_map(|b| {
                    b.get("text")
                        .or_else(|| b.get("input_text"))
                        .and_then(|t| t.as_str())
                })
                .collect::<Vec<_>>()
                .join("")
        })
        .unwrap_or_default()
}

/// 4.2.d session guard: resolve/derive the session id and bump its sequence.
pub fn session_guard(
    session: &mut Session,
    client_session_id: Option<&str>,
    user_agent: Option<&str>,
    first_forwarded_ip: Option<&str>,
) -> GuardOutcome {
    let key_prefix = match &session.auth {
        Some(AuthState::Success { key, .. }) => Some(key.credential_prefix.clone()),
        _ => None,
    };
    let id = client_session_id
        .map(|s| s.to_string())
        .or_else(|| generate_deterministic_session_id(user_agent, first_forwarded_ip, key_prefix.as_deref()));
    session.session_id = id;
    let _ = session.next_sequence();
    GuardOutcome::Continue
}

/// 4.2.e warmup guard, off by default.
pub fn warmup_guard(session: &Session, enabled: bool) -> GuardOutcome {
    if !enabled {
        return GuardOutcome::Continue;
    }
    if !is_anthropic_warmup(session) {
        return GuardOutcome::Continue;
    }
    info!(event = "guard.warmup_intercepted", session_id = ?session.session_id);
    GuardOutcome::Respond(GuardResponse {
        status: 200,
        body: serde_json::json!({
            "id": format!("msg_cch_{}", warmup_suffix()),
            "type": "message",
            "role": "assistant",
            "content": [],
            "stop_reason": "end_turn",
            "usage": {"input_tokens": 0, "output_tokens": 0},
        }),
        headers: Vec::new(),
    })
}

fn is_anthropic_warmup(session: &Session) -> bool {
    session.original_format == FormatDialect::Claude
        && session
            .body_json
            .get("messages")
            .and_then(|m| m.as_array())
            .map(|a| a.is_empty())
            .unwrap_or(false)
}

fn warmup_suffix() -> String {
    use std::time::{SystemTime, UNIX_EPOCH};
    let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_nanos();
    format!("{:x}", nanos & 0xffff_ffff)
}

/// 4.2.g sensitive-word guard: flattened message text vs. a pattern list.
pub fn sensitive_word_guard(session: &Session, patterns: &[String], message: &str) -> GuardOutcome {
    if patterns.is_empty() {
        return GuardOutcome::Continue;
    }
    let flattened = flatten_text(&session.body_json);
    let lower = flattened.to_ascii_lowercase();
    if patterns.iter().any(|p| lower.contains(&p.to_ascii_lowercase())) {
        warn!(event = "guard.sensitive_word_blocked", session_id = ?session.session_id);
        GuardOutcome::Respond(GuardResponse::error(400, "invalid_request", message))
    } else {
        GuardOutcome::Continue
    }
}

fn flatten_text(value: &JsonValue) -> String {
    match value {
        JsonValue::String(s) => s.clone(),
        JsonValue::Array(arr) => arr.iter().map(flatten_text).collect::<Vec<_>>().join(" "),
        JsonValue::Object(map) => map.values().map(flatten_text).collect::<Vec<_>>().join(" "),
        _ => String::new(),
    }
}

/// 4.2.h rate-limit guard.
pub async fn rate_limit_guard(
    store: &dyn RateLimitStore,
    session: &Session,
) -> GuardOutcome {
    let Some(AuthState::Success { user, key }) = &session.auth else {
        return GuardOutcome::Continue;
    };
    let session_id = session.session_id.as_deref().unwrap_or("");
    match check_twelve_steps(
        store,
        &key.key_id.to_string(),
        &key.limits,
        &user.user_id.to_string(),
        &user.limits,
        session_id,
    )
    .await
    {
        Ok(()) => GuardOutcome::Continue,
        Err(err) => {
            let status = err.status_code();
            let reset_epoch = time::OffsetDateTime::parse(&err.reset_time, &time::format_description::well_known::Rfc3339)
                .map(|t| t.unix_timestamp())
                .unwrap_or(0);
            let retry_after = (reset_epoch - time::OffsetDateTime::now_utc().unix_timestamp()).max(0);
            GuardOutcome::Respond(GuardResponse {
                status,
                body: serde_json::json!({
                    "error": {
                        "type": if status == 429 { "rate_limit_error" } else { "spend_limit_error" },
                        "limit_type": err.limit_type,
                        "current_usage": err.current_usage,
                        "limit_value": err.limit_value,
                        "reset_time": err.reset_time,
                    }
                }),
                headers: vec![
                    ("X-RateLimit-Limit".to_string(), err.limit_value.to_string()),
                    ("X-RateLimit-Remaining".to_string(), "0".to_string()),
                    ("X-RateLimit-Reset".to_string(), err.reset_time.clone()),
                    ("Retry-After".to_string(), retry_after.to_string()),
                ],
            })
        }
    }
}

/// 4.2.i provider selection, delegating to the selector. Before running a
/// fresh selection, tries the session-reuse path (spec §4.3 "Session reuse":
/// `shouldReuseProvider()` plus the bound provider re-validated via steps
/// 2-5) so a multi-turn conversation keeps talking to the same provider.
pub async fn provider_guard(
    selector: &ProviderSelector,
    rate_limit: &dyn RateLimitStore,
    breaker: &CircuitBreaker,
    session: &mut Session,
    providers: &[ProviderRow],
    excluded: &HashSet<i64>,
) -> GuardOutcome {
    let Some(AuthState::Success { user, key }) = &session.auth else {
        return GuardOutcome::Respond(GuardResponse::error(401, "authentication_error", "no authenticated session"));
    };
    let session_id = session.session_id.clone().unwrap_or_default();
    session.set_original_model_name_once(&session.model.clone());

    let reused = if session.should_reuse_provider() && !session_id.is_empty() {
        match rate_limit.get_session_provider(&session_id).await {
            Some(provider_id) if !excluded.contains(&provider_id) => {
                match providers.iter().find(|p| p.id == provider_id) {
                    Some(row) => {
                        selector
                            .validate_reuse(row, session.original_format, &session.model, session.wants_1m_context)
                            .await
                    }
                    None => None,
                }
            }
            _ => None,
        }
    } else {
        None
    };

    let (chosen, reason) = match reused {
        Some(chosen) => (Some(chosen), ChainReason::SessionReuse),
        None => {
            let outcome = selector
                .select(
                    providers,
                    session.original_format,
                    &session.model,
                    &key.limits,
                    &user.limits,
                    session.wants_1m_context,
                    excluded,
                    &session_id,
                )
                .await;
            (outcome.provider, outcome.reason)
        }
    };

    match chosen {
        Some(chosen) => {
            if let Some(target) = chosen.routing.model_redirects.get(&session.model) {
                session.model = target.clone();
            }
            session.provider_id = Some(chosen.provider_id);
            session.provider_type = Some(chosen.provider_type.as_str().to_string());
            session.cost_multiplier = chosen.routing.cost_multiplier;
            if !session_id.is_empty() {
                rate_limit.bind_session_provider(&session_id, chosen.provider_id).await;
            }
            let circuit = breaker.status(chosen.provider_id).await;
            session.push_chain_item(ProviderChainItem {
                provider_id: chosen.provider_id,
                provider_name: chosen.name,
                reason,
                attempt_no: session.provider_chain.len() as u32 + 1,
                status_code: None,
                circuit_state: circuit.state.as_str().to_string(),
                circuit_failure_count: circuit.failure_count,
                at: time::OffsetDateTime::now_utc().to_string(),
            });
            GuardOutcome::Continue
        }
        None => GuardOutcome::Respond(GuardResponse::error(
            503,
            "no_provider_available",
            "no eligible provider for this request",
        )),
    }
}

/// 4.2.k message-context guard: creates the persistent `MessageRequest` row
/// and copies the pre-redirect model into `originalModel` exactly once.
pub async fn message_context_guard(
    storage: &dyn Storage,
    session: &mut Session,
) -> GuardOutcome {
    session.set_original_model_name_once(&session.model.clone());
    let (user_id, user_key_id) = match &session.auth {
        Some(AuthState::Success { user, key }) => (Some(user.user_id), Some(key.key_id)),
        _ => (None, None),
    };
    let session_id = session.session_id.clone().unwrap_or_default();
    let sequence = session.next_sequence() as i32;
    let original_model = session.original_model_name().unwrap_or(&session.model).to_string();
    let result = storage
        .insert_message_request(&session_id, sequence, user_id, user_key_id, &original_model, &session.model)
        .await;
    // message-context bookkeeping failure must not block the request.
    if let Ok(id) = result {
        session.message_request_id = Some(id);
    }
    GuardOutcome::Continue
}

pub struct GuardPipelineResources {
    pub breaker: Arc<CircuitBreaker>,
    pub rate_limit: Arc<dyn RateLimitStore>,
    pub selector: Arc<ProviderSelector>,
    pub storage: Arc<dyn Storage>,
    pub global: Arc<GlobalConfig>,
    /// Compiled from `global.request_filters`; rebuilt by `AppState`
    /// whenever the global config changes so `run_pipeline` never compiles
    /// a regex on the request path.
    pub request_filters: Arc<Vec<RequestFilter>>,
}

/// Runs every step of a `GuardPreset` against `session` in order,
/// short-circuiting on the first `Respond`. This is the orchestrator spec
/// §4.2 describes as "an ordered list of steps executed in sequence"; the
/// individual `*_guard` functions above stay independently callable (and
/// independently tested) for callers that need to run a subset.
///
/// `lookup_key` backs the auth guard's credential lookup; `providers` is the
/// request-scoped provider snapshot the provider guard selects from.
pub async fn run_pipeline(
    session: &mut Session,
    resources: &GuardPipelineResources,
    preset: GuardPreset,
    providers: &[ProviderRow],
    lookup_key: impl Fn(&str) -> Option<(UserRow, UserKeyRow)>,
) -> GuardOutcome {
    let excluded: HashSet<i64> = HashSet::new();

    for step in preset.steps() {
        match step {
            GuardStep::Auth => {
                // A caller that authenticated upstream of the pipeline (e.g. a
                // router middleware that already stripped the credential from
                // the headers it forwards) can pre-populate `session.auth`;
                // `auth_guard` only runs when that hasn't happened yet.
                if session.auth.is_none()
                    && let GuardOutcome::Respond(r) = auth_guard(session, &lookup_key)
                {
                    return GuardOutcome::Respond(r);
                }
            }
            GuardStep::Sensitive => {
                if let GuardOutcome::Respond(r) = sensitive_word_guard(
                    session,
                    &resources.global.sensitive_words,
                    &resources.global.sensitive_word_message,
                ) {
                    return GuardOutcome::Respond(r);
                }
            }
            GuardStep::Client => {
                let user_agent = gproxy_provider_core::header_get(&session.headers, "user-agent")
                    .map(|s| s.to_string());
                let allowed_clients = match &session.auth {
                    Some(AuthState::Success { user, .. }) => user.limits.allowed_clients.clone(),
                    _ => Vec::new(),
                };
                if let GuardOutcome::Respond(r) =
                    client_guard(session, user_agent.as_deref(), &allowed_clients)
                {
                    return GuardOutcome::Respond(r);
                }
            }
            GuardStep::Model => {
                let allowed_models = match &session.auth {
                    Some(AuthState::Success { user, .. }) => user.limits.allowed_models.clone(),
                    _ => Vec::new(),
                };
                if let GuardOutcome::Respond(r) = model_guard(session, &allowed_models) {
                    return GuardOutcome::Respond(r);
                }
            }
            GuardStep::Version => {
                // Spec leaves the version guard undetailed beyond the
                // model/probe pair it sits between; nothing to enforce today.
            }
            GuardStep::Probe => {
                if let GuardOutcome::Respond(r) = probe_guard(session) {
                    return GuardOutcome::Respond(r);
                }
            }
            GuardStep::Session => {
                let user_agent = gproxy_provider_core::header_get(&session.headers, "user-agent")
                    .map(|s| s.to_string());
                let first_forwarded_ip =
                    gproxy_provider_core::header_get(&session.headers, "x-forwarded-for")
                        .and_then(|v| v.split(',').next().map(|s| s.trim().to_string()));
                let client_session_id = client_session_id_from_body(&session.body_json);
                let _ = session_guard(
                    session,
                    client_session_id.as_deref(),
                    user_agent.as_deref(),
                    first_forwarded_ip.as_deref(),
                );
            }
            GuardStep::Warmup => {
                if let GuardOutcome::Respond(r) =
                    warmup_guard(session, resources.global.warmup_enabled)
                {
                    return GuardOutcome::Respond(r);
                }
            }
            GuardStep::RequestFilter => {
                // Global (pre-selection) filters: those with no group_tags.
                // Provider-scoped filters run at `ProviderRequestFilter` once
                // a provider (and its group tags) are known.
                let global_filters: Vec<RequestFilter> = resources
                    .request_filters
                    .iter()
                    .filter(|f| f.group_tags.is_empty())
                    .cloned()
                    .collect();
                apply_request_filters(session, &global_filters, None);
            }
            GuardStep::RateLimit => {
                if let GuardOutcome::Respond(r) =
                    rate_limit_guard(resources.rate_limit.as_ref(), session).await
                {
                    return GuardOutcome::Respond(r);
                }
            }
            GuardStep::Provider => {
                if let GuardOutcome::Respond(r) = provider_guard(
                    &resources.selector,
                    resources.rate_limit.as_ref(),
                    resources.breaker.as_ref(),
                    session,
                    providers,
                    &excluded,
                )
                .await
                {
                    return GuardOutcome::Respond(r);
                }
            }
            GuardStep::ProviderRequestFilter => {
                if let Some(provider_id) = session.provider_id
                    && let Some(row) = providers.iter().find(|p| p.id == provider_id)
                {
                    let group_tags = ProviderRouting::from_json(&row.routing_json).group_tags();
                    let scoped_filters: Vec<RequestFilter> = resources
                        .request_filters
                        .iter()
                        .filter(|f| !f.group_tags.is_empty())
                        .cloned()
                        .collect();
                    apply_request_filters(session, &scoped_filters, Some(&group_tags));
                }
            }
            GuardStep::MessageContext => {
                let _ = message_context_guard(resources.storage.as_ref(), session).await;
            }
        }
    }

    GuardOutcome::Continue
}

/// Extracts a client-provided session id from `metadata.session_id`
/// (Claude/OpenAI-style) or `metadata.sessionId` (Gemini-style), per spec
/// §4.2.d.
fn client_session_id_from_body(body: &JsonValue) -> Option<String> {
    body.get("metadata")
        .and_then(|m| m.get("session_id").or_else(|| m.get("sessionId")))
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regex_filter_rejects_redos_pattern() {
        let err = RequestFilter::compile(
            FilterScope::Body,
            FilterAction::TextReplace,
            MatchType::Regex,
            "(a+)+".to_string(),
            "x".to_string(),
            vec![],
        );
        assert!(err.is_err());
    }

    #[test]
    fn probe_guard_matches_foo_case_insensitive() {
        let headers: Headers = vec![];
        let body = serde_json::json!({"messages": [{"role": "user", "content": "FOO"}]});
        let session = Session::from_request(
            "POST".to_string(),
            "/v1/messages".to_string(),
            headers,
            bytes::Bytes::from(serde_json::to_vec(&body).unwrap()),
        )
        .unwrap();
        assert!(matches!(probe_guard(&session), GuardOutcome::Respond(_)));
    }

    #[test]
    fn probe_guard_matches_gemini_contents_shape() {
        let headers: Headers = vec![];
        let body = serde_json::json!({"contents": [{"role": "user", "parts": [{"text": "count"}]}]});
        let session = Session::from_request(
            "POST".to_string(),
            "/v1beta/models/gemini-pro:generateContent".to_string(),
            headers,
            bytes::Bytes::from(serde_json::to_vec(&body).unwrap()),
        )
        .unwrap();
        assert_eq!(session.original_format, FormatDialect::Gemini);
        assert!(matches!(probe_guard(&session), GuardOutcome::Respond(_)));
    }

    #[test]
    fn sensitive_word_guard_blocks_match() {
        let headers: Headers = vec![];
        let body = serde_json::json!({"messages": [{"role": "user", "content": "do something bad"}]});
        let session = Session::from_request(
            "POST".to_string(),
            "/v1/messages".to_string(),
            headers,
            bytes::Bytes::from(serde_json::to_vec(&body).unwrap()),
        )
        .unwrap();
        let outcome = sensitive_word_guard(&session, &["bad".to_string()], "blocked");
        assert!(matches!(outcome, GuardOutcome::Respond(_)));
    }

    #[test]
    fn chat_preset_has_thirteen_steps_in_order() {
        assert_eq!(GuardPreset::Chat.steps().len(), 13);
        assert_eq!(GuardPreset::Chat.steps()[0], GuardStep::Auth);
        assert_eq!(GuardPreset::Chat.steps()[12], GuardStep::MessageContext);
    }

    #[test]
    fn count_tokens_preset_skips_sensitive_session_warmup_ratelimit() {
        let steps = GuardPreset::CountTokens.steps();
        assert!(!steps.contains(&GuardStep::Sensitive));
        assert!(!steps.contains(&GuardStep::Session));
        assert!(!steps.contains(&GuardStep::Warmup));
        assert!(!steps.contains(&GuardStep::RateLimit));
    }
}
