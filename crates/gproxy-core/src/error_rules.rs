//! Error taxonomy and the rule engine that overrides it (spec §7, §4.9).

use std::collections::HashSet;
use std::sync::Arc;

use arc_swap::ArcSwap;
use bytes::Bytes;
use regex::Regex;
use serde_json::Value as JsonValue;

use gproxy_provider_core::Headers;
use gproxy_provider_core::provider::{UpstreamFailure, UpstreamTransportErrorKind};

use crate::circuit_breaker::BreakerFeedKind;

/// Five top-level kinds; first match wins (spec §7).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    ClientAbort,
    NonRetryableClientError,
    ResourceNotFound,
    ProviderError,
    SystemError,
}

impl ErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ClientAbort => "CLIENT_ABORT",
            Self::NonRetryableClientError => "NON_RETRYABLE_CLIENT_ERROR",
            Self::ResourceNotFound => "RESOURCE_NOT_FOUND",
            Self::ProviderError => "PROVIDER_ERROR",
            Self::SystemError => "SYSTEM_ERROR",
        }
    }

    pub fn breaker_feed(&self) -> BreakerFeedKind {
        match self {
            Self::ProviderError => BreakerFeedKind::ProviderError,
            _ => BreakerFeedKind::Other,
        }
    }
}

const SENSITIVE_HEADERS: &[&str] = &[
    "authorization",
    "x-api-key",
    "cookie",
    "set-cookie",
    "proxy-authorization",
];

const SENSITIVE_PARAMS: &[&str] = &["key", "api_key", "token", "access_token", "secret", "password"];

const MAX_TEXT_TRUNCATION: usize = 500;

/// A parsed upstream error, ready for classification and reporting.
#[derive(Debug, Clone)]
pub struct ProxyError {
    pub status: Option<u16>,
    pub kind: ErrorKind,
    pub provider_message: Option<String>,
    pub request_id: Option<String>,
    pub body_excerpt: Option<String>,
    pub provider_name: Option<String>,
}

impl ProxyError {
    /// No provider name, no raw upstream body.
    pub fn client_safe_message(&self) -> String {
        self.provider_message
            .clone()
            .unwrap_or_else(|| "An error occurred while processing the request.".to_string())
    }

    /// Includes provider name and upstream body excerpt, for logs/DB only.
    pub fn detailed_message(&self) -> String {
        let provider = self.provider_name.as_deref().unwrap_or("unknown");
        let msg = self.provider_message.as_deref().unwrap_or("(no message)");
        match &self.body_excerpt {
            Some(body) => format!("[{provider}] {msg} :: {body}"),
            None => format!("[{provider}] {msg}"),
        }
    }
}

/// Classifies client disconnects (detected upstream of this engine, e.g. by
/// the connection-drop future winning a `select!`) and upstream failures into
/// the five-kind taxonomy, and parses a best-effort `ProxyError` out of an
/// HTTP failure body.
pub fn classify(
    failure: &UpstreamFailure,
    client_disconnected: bool,
    provider_name: Option<&str>,
    rules: &ErrorRuleEngine,
) -> ProxyError {
    if client_disconnected {
        return ProxyError {
            status: None,
            kind: ErrorKind::ClientAbort,
            provider_message: Some("client disconnected".to_string()),
            request_id: None,
            body_excerpt: None,
            provider_name: provider_name.map(|s| s.to_string()),
        };
    }

    match failure {
        UpstreamFailure::Transport { message, .. } => ProxyError {
            status: None,
            kind: ErrorKind::SystemError,
            provider_message: Some(message.clone()),
            request_id: None,
            body_excerpt: None,
            provider_name: provider_name.map(|s| s.to_string()),
        },
        UpstreamFailure::Http { status, headers, body } => {
            let request_id = extract_request_id(headers, body);
            let provider_message = extract_provider_message(body);
            let body_excerpt = truncate_body(body);

            let rule_match = rules.match_error(body, provider_message.as_deref());
            let mut kind = if *status == 404 {
                ErrorKind::ResourceNotFound
            } else if rule_match.as_ref().map(|m| m.non_retryable).unwrap_or(false) {
                ErrorKind::NonRetryableClientError
            } else if is_non_retryable_status(*status) {
                ErrorKind::NonRetryableClientError
            } else {
                ErrorKind::ProviderError
            };
            let mut effective_status = Some(*status);
            if let Some(rule) = &rule_match {
                if let Some(override_status) = rule.override_status {
                    effective_status = Some(override_status.clamp(400, 599));
                }
            }
            if body.is_empty() {
                kind = ErrorKind::ProviderError;
            }

            ProxyError {
                status: effective_status,
                kind,
                provider_message: rule_match
                    .as_ref()
                    .and_then(|r| r.override_message.clone())
                    .or(provider_message),
                request_id,
                body_excerpt,
                provider_name: provider_name.map(|s| s.to_string()),
            }
        }
    }
}

fn is_non_retryable_status(status: u16) -> bool {
    matches!(status, 400 | 401 | 403 | 422)
}

/// True when a final HTTP status (as returned to the client) corresponds to
/// `ErrorKind::ProviderError` and should trigger spec §4.7 step 5 cross-provider
/// failover. Mirrors `classify`'s status-only branches; callers at the router
/// layer only see the final status code, not the upstream body or rule engine,
/// so 404 and the non-retryable-client set are excluded the same way.
pub fn is_provider_error_status(status: u16) -> bool {
    (400..600).contains(&status) && status != 404 && !is_non_retryable_status(status)
}

/// `x-request-id`, `request-id`, `x-amzn-requestid` headers, else a best-effort
/// walk through the body (including a JSON string embedded in `error.message`,
/// parsed up to two levels deep).
fn extract_request_id(headers: &Headers, body: &Bytes) -> Option<String> {
    for name in ["x-request-id", "request-id", "x-amzn-requestid"] {
        if let Some(v) = gproxy_provider_core::header_get(headers, name) {
            return Some(v.to_string());
        }
    }
    let parsed: JsonValue = serde_json::from_slice(body).ok()?;
    find_request_id_in_json(&parsed, 0)
}

fn find_request_id_in_json(value: &JsonValue, depth: u8) -> Option<String> {
    if depth > 2 {
        return None;
    }
    if let Some(obj) = value.as_object() {
        for key in ["request_id", "requestId", "requestID"] {
            if let Some(v) = obj.get(key).and_then(|v| v.as_str()) {
                return Some(v.to_string());
            }
        }
        if let Some(message) = obj.get("error").and_then(|e| e.get("message")).and_then(|m| m.as_str()) {
            if let Ok(nested) = serde_json::from_str::<JsonValue>(message) {
                if let Some(found) = find_request_id_in_json(&nested, depth + 1) {
                    return Some(found);
                }
            }
        }
        for v in obj.values() {
            if let Some(found) = find_request_id_in_json(v, depth + 1) {
                return Some(found);
            }
        }
    }
    None
}

/// Extracts a human message from Claude (`error.message`), OpenAI
/// (`error.message`), or Gemini (`error.message` or `[{error:{message}}]`) body shapes.
fn extract_provider_message(body: &Bytes) -> Option<String> {
    let parsed: JsonValue = serde_json::from_slice(body).ok()?;
    let candidate = if let Some(arr) = parsed.as_array() {
        arr.first().and_then(|v| v.get("error")).and_then(|e| e.get("message"))
    } else {
        parsed.get("error").and_then(|e| e.get("message"))
    };
    candidate.and_then(|v| v.as_str()).map(|s| s.to_string())
}

/// JSON bodies are re-serialized in full; text bodies are truncated to 500 chars.
fn truncate_body(body: &Bytes) -> Option<String> {
    if body.is_empty() {
        return None;
    }
    if let Ok(parsed) = serde_json::from_slice::<JsonValue>(body) {
        return serde_json::to_string(&parsed).ok();
    }
    let text = String::from_utf8_lossy(body);
    if text.chars().count() > MAX_TEXT_TRUNCATION {
        Some(format!("{}...", text.chars().take(MAX_TEXT_TRUNCATION).collect::<String>()))
    } else {
        Some(text.into_owned())
    }
}

/// Masks sensitive headers/URL params before persistence.
pub fn mask_sensitive(headers: &Headers, url: &str) -> (Headers, String) {
    let masked_headers = headers
        .iter()
        .map(|(k, v)| {
            if SENSITIVE_HEADERS.contains(&k.to_ascii_lowercase().as_str()) {
                (k.clone(), "***".to_string())
            } else {
                (k.clone(), v.clone())
            }
        })
        .collect();

    let masked_url = mask_url_params(url);
    (masked_headers, masked_url)
}

fn mask_url_params(url: &str) -> String {
    let Some((base, query)) = url.split_once('?') else {
        return url.to_string();
    };
    let masked: Vec<String> = query
        .split('&')
        .map(|pair| {
            let Some((k, _v)) = pair.split_once('=') else {
                return pair.to_string();
            };
            let lower = k.to_ascii_lowercase();
            if SENSITIVE_PARAMS.iter().any(|p| lower.contains(p)) {
                format!("{k}=***")
            } else {
                pair.to_string()
            }
        })
        .collect();
    format!("{base}?{}", masked.join("&"))
}

/// A single hot-reloadable rule: matches upstream error content and optionally
/// overrides the returned status/message, or marks the error non-retryable.
#[derive(Debug, Clone)]
pub struct ErrorRule {
    pub id: String,
    pub pattern: String,
    pub is_regex: bool,
    pub non_retryable: bool,
    pub override_status: Option<u16>,
    pub override_message: Option<String>,
}

pub struct RuleMatch {
    pub rule_id: String,
    pub non_retryable: bool,
    pub override_status: Option<u16>,
    pub override_message: Option<String>,
}

/// Pattern-matches upstream error content against a hot-reloadable rules
/// table. Rules are swapped atomically (spec: "hot-reloaded via a pub/sub
/// channel" — this crate exposes `replace_rules` for the admin layer to call
/// once it has drained that channel).
pub struct ErrorRuleEngine {
    rules: ArcSwap<Vec<ErrorRule>>,
}

impl ErrorRuleEngine {
    pub fn new(rules: Vec<ErrorRule>) -> Arc<Self> {
        Arc::new(Self {
            rules: ArcSwap::from_pointee(rules),
        })
    }

    pub fn empty() -> Arc<Self> {
        Self::new(Vec::new())
    }

    pub fn replace_rules(&self, rules: Vec<ErrorRule>) {
        self.rules.store(Arc::new(rules));
    }

    /// Prefers the raw upstream body; falls back to the extracted message.
    pub fn match_error(&self, body: &Bytes, message: Option<&str>) -> Option<RuleMatch> {
        let body_text = String::from_utf8_lossy(body);
        let haystacks: [&str; 2] = [body_text.as_ref(), message.unwrap_or("")];
        let rules = self.rules.load();
        for rule in rules.iter() {
            let status = rule.override_status.map(|s| s.clamp(400, 599));
            for haystack in haystacks {
                if haystack.is_empty() {
                    continue;
                }
                let matched = if rule.is_regex {
                    Regex::new(&rule.pattern).map(|re| re.is_match(haystack)).unwrap_or(false)
                } else {
                    haystack.contains(&rule.pattern)
                };
                if matched {
                    return Some(RuleMatch {
                        rule_id: rule.id.clone(),
                        non_retryable: rule.non_retryable,
                        override_status: status,
                        override_message: rule.override_message.clone(),
                    });
                }
            }
        }
        None
    }
}

/// spec 4.7 step 6: the thinking-signature rectifier. Runs before one extra
/// same-provider retry on Claude-family upstreams when the error message
/// matches one of the three known thinking-block shapes.
pub fn is_thinking_signature_error(message: &str) -> bool {
    const NEEDLES: &[&str] = &[
        "Invalid signature in thinking block",
        "Expected thinking",
        "signature field required",
    ];
    NEEDLES.iter().any(|n| message.contains(n))
}

/// Strips `thinking`/`redacted_thinking` blocks and any stray `signature`
/// field on non-thinking blocks from a Claude-format message body; removes
/// the top-level `thinking` config if the last assistant message doesn't
/// start with a thinking block but contains `tool_use`.
pub fn rectify_thinking_blocks(body: &mut JsonValue) {
    let Some(messages) = body.get_mut("messages").and_then(|m| m.as_array_mut()) else {
        return;
    };

    let mut last_assistant_starts_with_thinking = false;
    let mut last_assistant_has_tool_use = false;

    for message in messages.iter_mut() {
        let is_assistant = message.get("role").and_then(|r| r.as_str()) == Some("assistant");
        let Some(content) = message.get_mut("content").and_then(|c| c.as_array_mut()) else {
            continue;
        };

        if is_assistant {
            last_assistant_starts_with_thinking = content
                .first()
                .and_then(|b| b.get("type"))
                .and_then(|t| t.as_str())
                .map(|t| t == "thinking" || t == "redacted_thinking")
                .unwrap_or(false);
            last_assistant_has_tool_use = content
                .iter()
                .any(|b| b.get("type").and_then(|t| t.as_str()) == Some("tool_use"));
        }

        content.retain(|block| {
            !matches!(
                block.get("type").and_then(|t| t.as_str()),
                Some("thinking") | Some("redacted_thinking")
            )
        });
        for block in content.iter_mut() {
            if block.get("type").and_then(|t| t.as_str()) != Some("thinking") {
                if let Some(obj) = block.as_object_mut() {
                    obj.remove("signature");
                }
            }
        }
    }

    if !last_assistant_starts_with_thinking && last_assistant_has_tool_use {
        if let Some(obj) = body.as_object_mut() {
            obj.remove("thinking");
        }
    }
}

pub fn dedupe_provider_names(names: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    names.iter().filter(|n| seen.insert((*n).clone())).cloned().collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_404_is_resource_not_found() {
        let engine = ErrorRuleEngine::empty();
        let failure = UpstreamFailure::Http {
            status: 404,
            headers: vec![],
            body: Bytes::from_static(b"{}"),
        };
        let err = classify(&failure, false, Some("acme"), &engine);
        assert_eq!(err.kind, ErrorKind::ResourceNotFound);
    }

    #[test]
    fn transport_failure_is_system_error() {
        let engine = ErrorRuleEngine::empty();
        let failure = UpstreamFailure::Transport {
            kind: UpstreamTransportErrorKind::Connect,
            message: "connection refused".to_string(),
        };
        let err = classify(&failure, false, None, &engine);
        assert_eq!(err.kind, ErrorKind::SystemError);
    }

    #[test]
    fn client_disconnect_wins_over_everything() {
        let engine = ErrorRuleEngine::empty();
        let failure = UpstreamFailure::Http {
            status: 500,
            headers: vec![],
            body: Bytes::from_static(b"{}"),
        };
        let err = classify(&failure, true, None, &engine);
        assert_eq!(err.kind, ErrorKind::ClientAbort);
    }

    #[test]
    fn rule_override_status_is_clamped() {
        let engine = ErrorRuleEngine::new(vec![ErrorRule {
            id: "r1".to_string(),
            pattern: "overloaded".to_string(),
            is_regex: false,
            non_retryable: false,
            override_status: Some(900),
            override_message: Some("try again later".to_string()),
        }]);
        let failure = UpstreamFailure::Http {
            status: 503,
            headers: vec![],
            body: Bytes::from_static(b"{\"error\":{\"message\":\"overloaded\"}}"),
        };
        let err = classify(&failure, false, Some("acme"), &engine);
        assert_eq!(err.status, Some(599));
        assert_eq!(err.provider_message.as_deref(), Some("try again later"));
    }

    #[test]
    fn provider_error_status_excludes_client_and_not_found() {
        assert!(is_provider_error_status(500));
        assert!(is_provider_error_status(502));
        assert!(is_provider_error_status(429));
        assert!(!is_provider_error_status(404));
        assert!(!is_provider_error_status(400));
        assert!(!is_provider_error_status(401));
        assert!(!is_provider_error_status(422));
        assert!(!is_provider_error_status(200));
        assert!(!is_provider_error_status(301));
    }

    #[test]
    fn request_id_found_nested_two_levels() {
        let body = Bytes::from_static(
            b"{\"error\":{\"message\":\"{\\\"request_id\\\":\\\"req_abc\\\"}\"}}",
        );
        let id = extract_request_id(&vec![], &body);
        assert_eq!(id.as_deref(), Some("req_abc"));
    }

    #[test]
    fn masks_sensitive_header_and_param() {
        let headers = vec![("Authorization".to_string(), "Bearer xyz".to_string())];
        let (masked, url) = mask_sensitive(&headers, "https://x.test/v1?api_key=secret123&foo=bar");
        assert_eq!(masked[0].1, "***");
        assert!(url.contains("api_key=***"));
        assert!(url.contains("foo=bar"));
    }

    #[test]
    fn detects_thinking_signature_errors() {
        assert!(is_thinking_signature_error("Invalid signature in thinking block"));
        assert!(is_thinking_signature_error("signature field required"));
        assert!(!is_thinking_signature_error("unrelated error"));
    }

    #[test]
    fn rectifies_thinking_blocks() {
        let mut body = serde_json::json!({
            "thinking": {"type": "enabled"},
            "messages": [
                {"role": "user", "content": [{"type": "text", "text": "hi"}]},
                {"role": "assistant", "content": [
                    {"type": "text", "text": "ok", "signature": "abc"},
                    {"type": "tool_use", "name": "x"}
                ]}
            ]
        });
        rectify_thinking_blocks(&mut body);
        assert!(body.get("thinking").is_none());
        let content = body["messages"][1]["content"].as_array().unwrap();
        assert!(content.iter().all(|b| b.get("signature").is_none()));
    }
}
