use std::collections::HashMap;

use serde::{Deserialize, Serialize};

#[derive(Debug, thiserror::Error)]
pub enum GlobalConfigError {
    #[error("missing required global config field: {0}")]
    MissingField(&'static str),
}

/// How `message_request` rows are persisted while a request is in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum MessageRequestWriteMode {
    /// Insert once at request start, update in place at completion.
    UpdateInPlace,
    /// Never persist request/response bodies, only the decision chain summary.
    SummaryOnly,
}

impl Default for MessageRequestWriteMode {
    fn default() -> Self {
        Self::UpdateInPlace
    }
}

impl MessageRequestWriteMode {
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "update_in_place" => Some(Self::UpdateInPlace),
            "summary_only" => Some(Self::SummaryOnly),
            _ => None,
        }
    }
}

/// Plain-data description of a `gproxy-core::guard::RequestFilter` (spec
/// §4.2.f/j), stored on `GlobalConfig` so it round-trips through the
/// `config_json` blob without this crate depending on `gproxy-core`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestFilterSpec {
    /// `"header"` or `"body"`.
    pub scope: String,
    /// `"remove"`, `"set"`, `"json_path"`, or `"text_replace"`.
    pub action: String,
    /// `"exact"`, `"contains"`, or `"regex"`.
    pub match_type: String,
    pub target: String,
    #[serde(default)]
    pub replacement: String,
    /// Restricts this filter to providers whose group tags intersect this
    /// list; empty means every provider (global, pre-selection filtering).
    #[serde(default)]
    pub group_tags: Vec<String>,
}

/// Plain-data mirror of `gproxy-core::pricing::PriceEntry`, stored on
/// `GlobalConfig` for the same reason as `RequestFilterSpec`: this crate
/// can't depend on `gproxy-core`. Price-table *synchronization* (fetching or
/// generating these entries) is out of scope (spec §1) — this is just the
/// carrier for whatever table the operator last pushed.
#[derive(Debug, Clone, Copy, Default, PartialEq, Serialize, Deserialize)]
pub struct PriceEntrySpec {
    #[serde(default)]
    pub input_cost_per_token: f64,
    #[serde(default)]
    pub output_cost_per_token: f64,
    #[serde(default)]
    pub cache_read_cost_per_token: f64,
    #[serde(default)]
    pub cache_write_cost_per_token: f64,
}

/// Final, merged global configuration used by the running process.
///
/// Merge order (after DB connection): CLI > ENV > DB, then persist back to DB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GlobalConfig {
    pub host: String,
    pub port: u16,
    /// Stored as a hash (not plaintext).
    pub admin_key_hash: String,
    /// Optional outbound proxy (for upstream egress).
    pub proxy: Option<String>,
    /// Database DSN used for this process.
    pub dsn: String,
    /// Whether to redact sensitive fields in emitted events.
    pub event_redact_sensitive: bool,
    /// Redis connection URL backing the rate-limit store and circuit breaker.
    /// `None` runs the gateway with an always-allow, in-memory-only store.
    pub redis_url: Option<String>,
    pub fetch_connect_timeout_ms: u64,
    pub fetch_headers_timeout_ms: u64,
    pub fetch_body_timeout_ms: u64,
    pub log_level: String,
    pub enable_smart_probing: bool,
    pub probe_interval_ms: u64,
    pub probe_timeout_ms: u64,
    pub message_request_write_mode: MessageRequestWriteMode,
    /// Whether the 4.2.e warmup guard intercepts Anthropic CLI capability
    /// probes locally. Off by default per spec.
    #[serde(default)]
    pub warmup_enabled: bool,
    /// Case-insensitive substrings that trip the 4.2.g sensitive-word guard.
    /// Empty means the guard is a no-op.
    #[serde(default)]
    pub sensitive_words: Vec<String>,
    #[serde(default = "default_sensitive_word_message")]
    pub sensitive_word_message: String,
    /// Global and provider-scoped request filters (spec §4.2.f/j).
    #[serde(default)]
    pub request_filters: Vec<RequestFilterSpec>,
    /// Per-model price table for cost computation (spec §4.8). Keyed by the
    /// model name the price applies to; empty means every request records
    /// uncharged.
    #[serde(default)]
    pub prices: HashMap<String, PriceEntrySpec>,
}

fn default_sensitive_word_message() -> String {
    "request blocked by content policy".to_string()
}

/// Optional layer used for merging global config.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct GlobalConfigPatch {
    pub host: Option<String>,
    pub port: Option<u16>,
    pub admin_key_hash: Option<String>,
    pub proxy: Option<String>,
    pub dsn: Option<String>,
    pub event_redact_sensitive: Option<bool>,
    pub redis_url: Option<String>,
    pub fetch_connect_timeout_ms: Option<u64>,
    pub fetch_headers_timeout_ms: Option<u64>,
    pub fetch_body_timeout_ms: Option<u64>,
    pub log_level: Option<String>,
    pub enable_smart_probing: Option<bool>,
    pub probe_interval_ms: Option<u64>,
    pub probe_timeout_ms: Option<u64>,
    pub message_request_write_mode: Option<MessageRequestWriteMode>,
    pub warmup_enabled: Option<bool>,
    pub sensitive_words: Option<Vec<String>>,
    pub sensitive_word_message: Option<String>,
    pub request_filters: Option<Vec<RequestFilterSpec>>,
    pub prices: Option<HashMap<String, PriceEntrySpec>>,
}

impl GlobalConfigPatch {
    pub fn overlay(&mut self, other: GlobalConfigPatch) {
        if other.host.is_some() {
            self.host = other.host;
        }
        if other.port.is_some() {
            self.port = other.port;
        }
        if other.admin_key_hash.is_some() {
            self.admin_key_hash = other.admin_key_hash;
        }
        if other.proxy.is_some() {
            self.proxy = other.proxy;
        }
        if other.dsn.is_some() {
            self.dsn = other.dsn;
        }
        if other.event_redact_sensitive.is_some() {
            self.event_redact_sensitive = other.event_redact_sensitive;
        }
        if other.redis_url.is_some() {
            self.redis_url = other.redis_url;
        }
        if other.fetch_connect_timeout_ms.is_some() {
            self.fetch_connect_timeout_ms = other.fetch_connect_timeout_ms;
        }
        if other.fetch_headers_timeout_ms.is_some() {
            self.fetch_headers_timeout_ms = other.fetch_headers_timeout_ms;
        }
        if other.fetch_body_timeout_ms.is_some() {
            self.fetch_body_timeout_ms = other.fetch_body_timeout_ms;
        }
        if other.log_level.is_some() {
            self.log_level = other.log_level;
        }
        if other.enable_smart_probing.is_some() {
            self.enable_smart_probing = other.enable_smart_probing;
        }
        if other.probe_interval_ms.is_some() {
            self.probe_interval_ms = other.probe_interval_ms;
        }
        if other.probe_timeout_ms.is_some() {
            self.probe_timeout_ms = other.probe_timeout_ms;
        }
        if other.message_request_write_mode.is_some() {
            self.message_request_write_mode = other.message_request_write_mode;
        }
        if other.warmup_enabled.is_some() {
            self.warmup_enabled = other.warmup_enabled;
        }
        if other.sensitive_words.is_some() {
            self.sensitive_words = other.sensitive_words;
        }
        if other.sensitive_word_message.is_some() {
            self.sensitive_word_message = other.sensitive_word_message;
        }
        if other.request_filters.is_some() {
            self.request_filters = other.request_filters;
        }
        if other.prices.is_some() {
            self.prices = other.prices;
        }
    }

    /// Overlay from process environment variables, using the names in the
    /// deployment's env-knob list (`GPROXY_*` plus the legacy `FETCH_*`/probe
    /// names carried over from the source system this gateway replaces).
    pub fn overlay_env(&mut self) {
        fn env_u64(key: &str) -> Option<u64> {
            std::env::var(key).ok().and_then(|v| v.parse().ok())
        }
        fn env_bool(key: &str) -> Option<bool> {
            std::env::var(key).ok().and_then(|v| match v.as_str() {
                "1" | "true" | "TRUE" | "yes" => Some(true),
                "0" | "false" | "FALSE" | "no" => Some(false),
                _ => None,
            })
        }

        let env = GlobalConfigPatch {
            host: std::env::var("GPROXY_HOST").ok(),
            port: env_u64("GPROXY_PORT").map(|v| v as u16),
            admin_key_hash: std::env::var("GPROXY_ADMIN_KEY_HASH").ok(),
            proxy: std::env::var("GPROXY_PROXY").ok(),
            dsn: std::env::var("GPROXY_DSN").ok(),
            event_redact_sensitive: env_bool("GPROXY_EVENT_REDACT_SENSITIVE"),
            redis_url: std::env::var("GPROXY_REDIS_URL").ok(),
            fetch_connect_timeout_ms: env_u64("FETCH_CONNECT_TIMEOUT"),
            fetch_headers_timeout_ms: env_u64("FETCH_HEADERS_TIMEOUT"),
            fetch_body_timeout_ms: env_u64("FETCH_BODY_TIMEOUT"),
            log_level: std::env::var("LOG_LEVEL").ok(),
            enable_smart_probing: env_bool("ENABLE_SMART_PROBING"),
            probe_interval_ms: env_u64("PROBE_INTERVAL_MS"),
            probe_timeout_ms: env_u64("PROBE_TIMEOUT_MS"),
            message_request_write_mode: std::env::var("MESSAGE_REQUEST_WRITE_MODE")
                .ok()
                .and_then(|v| MessageRequestWriteMode::parse(&v)),
            warmup_enabled: env_bool("WARMUP_ENABLED"),
            // Sensitive-word list, request filters, and the price table are
            // admin-managed (persisted to the DB via the patch merge below),
            // not simple scalar env knobs.
            sensitive_words: None,
            sensitive_word_message: None,
            request_filters: None,
            prices: None,
        };
        self.overlay(env);
    }

    pub fn into_config(self) -> Result<GlobalConfig, GlobalConfigError> {
        Ok(GlobalConfig {
            host: self.host.unwrap_or_else(|| "0.0.0.0".to_string()),
            port: self.port.unwrap_or(8787),
            admin_key_hash: self
                .admin_key_hash
                .ok_or(GlobalConfigError::MissingField("admin_key_hash"))?,
            proxy: self.proxy,
            dsn: self.dsn.ok_or(GlobalConfigError::MissingField("dsn"))?,
            event_redact_sensitive: self.event_redact_sensitive.unwrap_or(true),
            redis_url: self.redis_url,
            fetch_connect_timeout_ms: self.fetch_connect_timeout_ms.unwrap_or(10_000),
            fetch_headers_timeout_ms: self.fetch_headers_timeout_ms.unwrap_or(60_000),
            fetch_body_timeout_ms: self.fetch_body_timeout_ms.unwrap_or(600_000),
            log_level: self.log_level.unwrap_or_else(|| "info".to_string()),
            enable_smart_probing: self.enable_smart_probing.unwrap_or(false),
            probe_interval_ms: self.probe_interval_ms.unwrap_or(30_000),
            probe_timeout_ms: self.probe_timeout_ms.unwrap_or(5_000),
            message_request_write_mode: self.message_request_write_mode.unwrap_or_default(),
            warmup_enabled: self.warmup_enabled.unwrap_or(false),
            sensitive_words: self.sensitive_words.unwrap_or_default(),
            sensitive_word_message: self
                .sensitive_word_message
                .unwrap_or_else(default_sensitive_word_message),
            request_filters: self.request_filters.unwrap_or_default(),
            prices: self.prices.unwrap_or_default(),
        })
    }
}

impl From<GlobalConfig> for GlobalConfigPatch {
    fn from(value: GlobalConfig) -> Self {
        Self {
            host: Some(value.host),
            port: Some(value.port),
            admin_key_hash: Some(value.admin_key_hash),
            proxy: value.proxy,
            dsn: Some(value.dsn),
            event_redact_sensitive: Some(value.event_redact_sensitive),
            redis_url: value.redis_url,
            fetch_connect_timeout_ms: Some(value.fetch_connect_timeout_ms),
            fetch_headers_timeout_ms: Some(value.fetch_headers_timeout_ms),
            fetch_body_timeout_ms: Some(value.fetch_body_timeout_ms),
            log_level: Some(value.log_level),
            enable_smart_probing: Some(value.enable_smart_probing),
            probe_interval_ms: Some(value.probe_interval_ms),
            probe_timeout_ms: Some(value.probe_timeout_ms),
            message_request_write_mode: Some(value.message_request_write_mode),
            warmup_enabled: Some(value.warmup_enabled),
            sensitive_words: Some(value.sensitive_words),
            sensitive_word_message: Some(value.sensitive_word_message),
            request_filters: Some(value.request_filters),
            prices: Some(value.prices),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn into_config_applies_defaults() {
        let patch = GlobalConfigPatch {
            admin_key_hash: Some("hash".to_string()),
            dsn: Some("sqlite://gproxy.db".to_string()),
            ..Default::default()
        };
        let cfg = patch.into_config().unwrap();
        assert_eq!(cfg.fetch_body_timeout_ms, 600_000);
        assert_eq!(cfg.log_level, "info");
        assert!(!cfg.enable_smart_probing);
        assert_eq!(
            cfg.message_request_write_mode,
            MessageRequestWriteMode::UpdateInPlace
        );
    }

    #[test]
    fn into_config_requires_dsn_and_admin_key() {
        let err = GlobalConfigPatch::default().into_config().unwrap_err();
        assert!(matches!(err, GlobalConfigError::MissingField("dsn")));
    }
}
