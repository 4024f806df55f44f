//! Request-scoped state threaded through the guard pipeline (spec §4.1).
//!
//! Kept decoupled from axum: the router layer adapts `HeaderMap`/`Bytes` into
//! a `Session` once per request, then every guard step takes `&mut Session`.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use time::OffsetDateTime;

use gproxy_provider_core::Headers;

use crate::limits::{KeyLimits, UserLimits};

/// The wire dialect a caller or upstream speaks.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FormatDialect {
    Claude,
    OpenAiChat,
    OpenAiResponse,
    Gemini,
    GeminiCli,
}

impl FormatDialect {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Claude => "claude",
            Self::OpenAiChat => "openai",
            Self::OpenAiResponse => "response",
            Self::Gemini => "gemini",
            Self::GeminiCli => "gemini-cli",
        }
    }
}

/// The maximum body size read before the session guard gives up extracting a
/// model name and fails the request outright (spec §4.1, 10 MiB).
pub const BODY_TRUNCATION_THRESHOLD: usize = 10 * 1024 * 1024;

#[derive(Debug, Clone)]
pub struct AuthenticatedUser {
    pub user_id: i64,
    pub user_name: String,
    pub limits: UserLimits,
}

#[derive(Debug, Clone)]
pub struct AuthenticatedKey {
    pub key_id: i64,
    /// First 10 chars of the raw credential, used only for session-id derivation.
    pub credential_prefix: String,
    pub limits: KeyLimits,
}

/// Outcome of the auth guard: either a bound identity, or a prebuilt error to
/// return as-is (spec: "auth guard presently throws an already-constructed
/// Response" — reimplemented here as a typed variant instead).
#[derive(Debug, Clone)]
pub enum AuthState {
    Success {
        user: AuthenticatedUser,
        key: AuthenticatedKey,
    },
    Failure {
        status: u16,
        error_type: &'static str,
        message: String,
    },
}

impl AuthState {
    pub fn is_success(&self) -> bool {
        matches!(self, AuthState::Success { .. })
    }
}

/// One entry in the append-only provider decision chain (spec §3 `ProviderChainItem`).
#[derive(Debug, Clone, serde::Serialize)]
pub struct ProviderChainItem {
    pub provider_id: i64,
    pub provider_name: String,
    pub reason: ChainReason,
    pub attempt_no: u32,
    pub status_code: Option<u16>,
    pub circuit_state: String,
    pub circuit_failure_count: u32,
    pub at: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChainReason {
    SessionReuse,
    InitialSelection,
    ConcurrentLimitFailed,
    RequestSuccess,
    RetryFailed,
    SystemError,
    ResourceNotFound,
    ClientErrorNonRetryable,
    Http2Fallback,
}

impl ChainReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChainReason::SessionReuse => "session_reuse",
            ChainReason::InitialSelection => "initial_selection",
            ChainReason::ConcurrentLimitFailed => "concurrent_limit_failed",
            ChainReason::RequestSuccess => "request_success",
            ChainReason::RetryFailed => "retry_failed",
            ChainReason::SystemError => "system_error",
            ChainReason::ResourceNotFound => "resource_not_found",
            ChainReason::ClientErrorNonRetryable => "client_error_non_retryable",
            ChainReason::Http2Fallback => "http2_fallback",
        }
    }
}

/// Request-scoped, single-owner state (spec §4.1).
pub struct Session {
    pub start: OffsetDateTime,
    pub method: String,
    pub url: String,
    pub headers_original: Headers,
    pub headers: Headers,
    pub body_raw: bytes::Bytes,
    pub body_json: JsonValue,
    pub original_format: FormatDialect,
    pub model: String,
    /// Set exactly once, before any redirect/model-rewrite. Write-once invariant.
    original_model_name: Option<String>,
    pub auth: Option<AuthState>,
    pub provider_id: Option<i64>,
    pub provider_type: Option<String>,
    /// `cost_multiplier` of the selected provider's routing config, carried
    /// forward so `finalize_request`'s cost computation doesn't need to
    /// re-resolve the provider row after the forwarder returns.
    pub cost_multiplier: f64,
    pub session_id: Option<String>,
    sequence: Arc<AtomicI64>,
    pub provider_chain: Vec<ProviderChainItem>,
    pub wants_1m_context: bool,
    pub needs_claude_disguise: bool,
    /// Row id of the `message_requests` entry created by the message-context
    /// guard (spec §4.2.k), if it ran and succeeded. Carried forward so the
    /// caller can update the row in place once the upstream response lands.
    pub message_request_id: Option<i64>,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("invalid_request: body exceeds the proxy body-size limit and no model could be determined")]
    BodyTooLargeWithoutModel,
}

impl Session {
    /// `fromRequest` (spec §4.1): classify format, extract model, enforce the
    /// body-truncation threshold.
    pub fn from_request(
        method: String,
        url: String,
        headers: Headers,
        body_raw: bytes::Bytes,
    ) -> Result<Self, SessionError> {
        let body_json: JsonValue = serde_json::from_slice(&body_raw)
            .unwrap_or_else(|_| serde_json::json!({"raw": String::from_utf8_lossy(&body_raw)}));

        let original_format = detect_format(&headers, &url, &body_json);
        let model = extract_model(&headers, &url, &body_json, original_format);

        if model.is_none() && body_raw.len() > BODY_TRUNCATION_THRESHOLD {
            return Err(SessionError::BodyTooLargeWithoutModel);
        }

        let wants_1m_context = gproxy_provider_core::header_get(&headers, "anthropic-beta")
            .map(|v| v.contains("context-1m"))
            .unwrap_or(false);

        Ok(Self {
            start: OffsetDateTime::now_utc(),
            method,
            url,
            headers_original: headers.clone(),
            headers,
            body_raw,
            body_json,
            original_format,
            model: model.clone().unwrap_or_default(),
            original_model_name: None,
            auth: None,
            provider_id: None,
            provider_type: None,
            cost_multiplier: 1.0,
            session_id: None,
            sequence: Arc::new(AtomicI64::new(0)),
            provider_chain: Vec::new(),
            wants_1m_context,
            needs_claude_disguise: false,
            message_request_id: None,
        })
    }

    /// Set once; subsequent calls are no-ops (write-once invariant in spec §3).
    pub fn set_original_model_name_once(&mut self, model: &str) {
        if self.original_model_name.is_none() {
            self.original_model_name = Some(model.to_string());
        }
    }

    pub fn original_model_name(&self) -> Option<&str> {
        self.original_model_name.as_deref()
    }

    /// True iff the working header differs from the as-received snapshot.
    pub fn is_header_modified(&self, name: &str) -> bool {
        gproxy_provider_core::header_get(&self.headers_original, name)
            != gproxy_provider_core::header_get(&self.headers, name)
    }

    /// True iff the normalized message list looks like a continuation
    /// (more than one turn), per spec §4.1 `shouldReuseProvider`.
    pub fn should_reuse_provider(&self) -> bool {
        message_count(&self.body_json, self.original_format) > 1
    }

    /// Atomically bump and return the next `requestSequence` for this session.
    /// Backed by a shared counter so concurrent guard steps observe a single
    /// monotonic source (the real source of truth is the session store, e.g.
    /// Redis `INCR`; this is the in-process fallback).
    pub fn next_sequence(&self) -> i64 {
        self.sequence.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// The `requestSequence` last assigned by `next_sequence` (0 if it was
    /// never called for this session), without bumping the counter. Lets a
    /// later step persist an append-only row under the same sequence the
    /// message-context guard used.
    pub fn current_sequence(&self) -> i64 {
        self.sequence.load(Ordering::SeqCst)
    }

    pub fn push_chain_item(&mut self, item: ProviderChainItem) {
        self.provider_chain.push(item);
    }
}

/// `generateDeterministicSessionId` (spec §4.1): SHA-256 over
/// `user-agent | first-forwarded-ip | first-10-chars-of-api-key`, first 32
/// hex chars, prefixed `sess_`. Returns `None` if none of the ingredients
/// are present.
pub fn generate_deterministic_session_id(
    user_agent: Option<&str>,
    first_forwarded_ip: Option<&str>,
    api_key_prefix10: Option<&str>,
) -> Option<String> {
    if user_agent.is_none() && first_forwarded_ip.is_none() && api_key_prefix10.is_none() {
        return None;
    }
    let mut hasher = Sha256::new();
    hasher.update(user_agent.unwrap_or_default().as_bytes());
    hasher.update(b"|");
    hasher.update(first_forwarded_ip.unwrap_or_default().as_bytes());
    hasher.update(b"|");
    hasher.update(api_key_prefix10.unwrap_or_default().as_bytes());
    let digest = hasher.finalize();
    let hex = hex_encode(&digest);
    Some(format!("sess_{}", &hex[..32]))
}

fn hex_encode(bytes: &[u8]) -> String {
    use std::fmt::Write;
    let mut out = String::with_capacity(bytes.len() * 2);
    for b in bytes {
        let _ = write!(out, "{:02x}", b);
    }
    out
}

fn detect_format(headers: &Headers, url: &str, body: &JsonValue) -> FormatDialect {
    if gproxy_provider_core::header_get(headers, "anthropic-version").is_some() {
        return FormatDialect::Claude;
    }
    if gproxy_provider_core::header_get(headers, "x-goog-api-key").is_some()
        || url.contains("/v1beta/")
    {
        return FormatDialect::Gemini;
    }
    if body.get("input").and_then(|v| v.as_array()).is_some() {
        return FormatDialect::OpenAiResponse;
    }
    if body.get("contents").and_then(|v| v.as_array()).is_some()
        || body
            .get("request")
            .and_then(|r| r.get("contents"))
            .and_then(|v| v.as_array())
            .is_some()
    {
        return FormatDialect::Gemini;
    }
    FormatDialect::OpenAiChat
}

fn extract_model(
    headers: &Headers,
    url: &str,
    body: &JsonValue,
    format: FormatDialect,
) -> Option<String> {
    if let Some(m) = body.get("model").and_then(|v| v.as_str()) {
        if !m.is_empty() {
            return Some(m.to_string());
        }
    }
    let _ = headers;
    if let Some(model) = model_from_path(url) {
        return Some(model);
    }
    if format == FormatDialect::Gemini {
        return Some("gemini-pro".to_string());
    }
    None
}

/// Parses `/v1beta/models/{model}:action` or `/v1/models/{model}:action`.
fn model_from_path(url: &str) -> Option<String> {
    let path = url.split('?').next().unwrap_or(url);
    let marker = "/models/";
    let idx = path.find(marker)?;
    let rest = &path[idx + marker.len()..];
    let model_part = rest.split('/').next().unwrap_or(rest);
    let model = model_part.split(':').next().unwrap_or(model_part);
    if model.is_empty() {
        None
    } else {
        Some(model.to_string())
    }
}

/// Counts the normalized turn list for the dialect actually in play.
/// Claude/OpenAI-Chat/Gemini-CLI carry `messages`; Gemini (and the
/// `request.contents` nesting some Gemini callers use) carries `contents`;
/// OpenAI Responses/Codex carries `input`.
fn message_count(body: &JsonValue, format: FormatDialect) -> usize {
    match format {
        FormatDialect::Gemini => body
            .get("contents")
            .and_then(|v| v.as_array())
            .or_else(|| {
                body.get("request")
                    .and_then(|r| r.get("contents"))
                    .and_then(|v| v.as_array())
            })
            .map(|a| a.len())
            .unwrap_or(0),
        FormatDialect::OpenAiResponse => body
            .get("input")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0),
        FormatDialect::Claude | FormatDialect::OpenAiChat | FormatDialect::GeminiCli => body
            .get("messages")
            .and_then(|v| v.as_array())
            .map(|a| a.len())
            .unwrap_or(0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic_session_id_requires_some_ingredient() {
        assert!(generate_deterministic_session_id(None, None, None).is_none());
        let id = generate_deterministic_session_id(Some("ua"), None, None).unwrap();
        assert!(id.starts_with("sess_"));
        assert_eq!(id.len(), "sess_".len() + 32);
    }

    #[test]
    fn deterministic_session_id_is_stable() {
        let a = generate_deterministic_session_id(Some("ua"), Some("1.2.3.4"), Some("sk-0123456789"));
        let b = generate_deterministic_session_id(Some("ua"), Some("1.2.3.4"), Some("sk-0123456789"));
        assert_eq!(a, b);
    }

    #[test]
    fn detects_gemini_from_path() {
        let headers: Headers = vec![];
        let body = serde_json::json!({});
        let fmt = detect_format(&headers, "/v1beta/models/gemini-pro:generateContent", &body);
        assert_eq!(fmt, FormatDialect::Gemini);
        assert_eq!(
            model_from_path("/v1beta/models/gemini-pro:generateContent").as_deref(),
            Some("gemini-pro")
        );
    }

    #[test]
    fn detects_response_format_from_body_shape() {
        let headers: Headers = vec![];
        let body = serde_json::json!({"input": []});
        assert_eq!(
            detect_format(&headers, "/v1/responses", &body),
            FormatDialect::OpenAiResponse
        );
    }

    #[test]
    fn body_too_large_without_model_fails() {
        let headers: Headers = vec![];
        let body = vec![b'a'; BODY_TRUNCATION_THRESHOLD + 1];
        let err = Session::from_request(
            "POST".to_string(),
            "/v1/chat/completions".to_string(),
            headers,
            bytes::Bytes::from(body),
        )
        .unwrap_err();
        assert!(matches!(err, SessionError::BodyTooLargeWithoutModel));
    }
}
