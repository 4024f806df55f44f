use async_trait::async_trait;
use time::OffsetDateTime;

use gproxy_common::GlobalConfig;
use gproxy_provider_core::Event;

use crate::snapshot::{GlobalConfigRow, MessageRequestRow, StorageSnapshot};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct UsageAggregateFilter {
    pub from: OffsetDateTime,
    pub to: OffsetDateTime,
    pub provider: Option<String>,
    pub credential_id: Option<i64>,
    pub model: Option<String>,
    pub model_contains: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct UsageAggregate {
    pub matched_rows: i64,
    pub input_tokens: i64,
    pub output_tokens: i64,
    pub cache_read_input_tokens: i64,
    pub cache_creation_input_tokens: i64,
    pub total_tokens: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogRecordKind {
    Upstream,
    Downstream,
}

#[derive(Debug, Clone)]
pub struct LogQueryFilter {
    pub from: OffsetDateTime,
    pub to: OffsetDateTime,
    pub kind: Option<LogRecordKind>,
    pub provider: Option<String>,
    pub credential_id: Option<i64>,
    pub user_id: Option<i64>,
    pub user_key_id: Option<i64>,
    pub trace_id: Option<String>,
    pub operation: Option<String>,
    pub request_path_contains: Option<String>,
    pub status_min: Option<i32>,
    pub status_max: Option<i32>,
    pub limit: usize,
    pub offset: usize,
}

#[derive(Debug, Clone)]
pub struct LogRecord {
    pub id: i64,
    pub kind: LogRecordKind,
    pub at: OffsetDateTime,
    pub trace_id: Option<String>,
    pub provider: Option<String>,
    pub credential_id: Option<i64>,
    pub user_id: Option<i64>,
    pub user_key_id: Option<i64>,
    pub attempt_no: Option<i32>,
    pub operation: Option<String>,
    pub request_method: String,
    pub request_path: String,
    pub response_status: Option<i32>,
    pub error_kind: Option<String>,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LogQueryResult {
    pub rows: Vec<LogRecord>,
    pub has_more: bool,
}

/// One attempt recorded for the append-only `provider_chain_items` log.
#[derive(Debug, Clone)]
pub struct ProviderChainItemInput<'a> {
    pub session_id: &'a str,
    pub request_sequence: i32,
    pub provider_id: i64,
    pub attempt_no: i32,
    pub outcome: &'a str,
    pub reason: Option<&'a str>,
}

/// Terminal fields written to a `message_requests` row once a request's
/// outcome (success, a failed attempt retried elsewhere, or a final error)
/// is known. Every field but `status` is best-effort: callers pass `None`
/// for whatever their vantage point didn't observe (e.g. a non-generate
/// request has no token counts; a non-streaming one has no TTFB).
#[derive(Debug, Clone, Default)]
pub struct MessageRequestOutcome<'a> {
    pub status: &'a str,
    pub status_code: Option<i32>,
    pub provider_id: Option<i64>,
    pub final_model: Option<&'a str>,
    pub cost: Option<f64>,
    pub duration_ms: Option<i64>,
    pub ttfb_ms: Option<i64>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cache_read_tokens: Option<i64>,
    pub cache_creation_5m_tokens: Option<i64>,
    pub cache_creation_1h_tokens: Option<i64>,
    pub error_message: Option<&'a str>,
    pub error_stack: Option<&'a str>,
    pub special_settings: Option<&'a serde_json::Value>,
}

/// Storage is used for:
/// - bootstrap (load_snapshot)
/// - admin mutations (writes only)
/// - event persistence (append_event)
///
/// Runtime reads must NOT hit DB; they read from in-memory snapshots.
#[async_trait]
pub trait Storage: Send + Sync {
    /// Entity-first schema sync (SeaORM 2.0). Enabled by default at bootstrap.
    async fn sync(&self) -> StorageResult<()>;

    async fn load_global_config(&self) -> StorageResult<Option<GlobalConfigRow>>;
    async fn upsert_global_config(&self, config: &GlobalConfig) -> StorageResult<()>;

    async fn load_snapshot(&self) -> StorageResult<StorageSnapshot>;

    // Providers
    async fn upsert_provider(
        &self,
        name: &str,
        config_json: &serde_json::Value,
        routing_json: &serde_json::Value,
        enabled: bool,
    ) -> StorageResult<i64>;
    async fn set_provider_routing(
        &self,
        provider_id: i64,
        routing_json: &serde_json::Value,
    ) -> StorageResult<()>;
    /// Soft-delete: sets `deleted_at` rather than removing the row, so
    /// historical `provider_chain_items`/`upstream_requests` foreign keys
    /// stay resolvable.
    async fn delete_provider(&self, name: &str) -> StorageResult<()>;

    // Credentials
    async fn insert_credential(
        &self,
        provider_name: &str,
        name: Option<&str>,
        settings_json: &serde_json::Value,
        secret_json: &serde_json::Value,
        enabled: bool,
    ) -> StorageResult<i64>;
    async fn update_credential(
        &self,
        credential_id: i64,
        name: Option<&str>,
        settings_json: &serde_json::Value,
        secret_json: &serde_json::Value,
    ) -> StorageResult<()>;
    async fn set_credential_enabled(&self, credential_id: i64, enabled: bool) -> StorageResult<()>;
    async fn delete_credential(&self, credential_id: i64) -> StorageResult<()>;

    // Users / keys (auth)
    async fn upsert_user_by_id(
        &self,
        user_id: i64,
        name: &str,
        enabled: bool,
        limits_json: &serde_json::Value,
    ) -> StorageResult<()>;
    async fn set_user_enabled(&self, user_id: i64, enabled: bool) -> StorageResult<()>;
    async fn set_user_limits(
        &self,
        user_id: i64,
        limits_json: &serde_json::Value,
    ) -> StorageResult<()>;
    async fn delete_user(&self, user_id: i64) -> StorageResult<()>;
    async fn insert_user_key(
        &self,
        user_id: i64,
        api_key: &str,
        label: Option<&str>,
        enabled: bool,
        routing_json: &serde_json::Value,
    ) -> StorageResult<i64>;
    async fn set_user_key_enabled(&self, user_key_id: i64, enabled: bool) -> StorageResult<()>;
    async fn update_user_key_label(
        &self,
        user_key_id: i64,
        label: Option<&str>,
    ) -> StorageResult<()>;
    async fn set_user_key_routing(
        &self,
        user_key_id: i64,
        routing_json: &serde_json::Value,
    ) -> StorageResult<()>;
    async fn delete_user_key(&self, user_key_id: i64) -> StorageResult<()>;

    async fn append_event(&self, event: &Event) -> StorageResult<()>;

    async fn aggregate_usage_tokens(
        &self,
        filter: UsageAggregateFilter,
    ) -> StorageResult<UsageAggregate>;

    async fn query_logs(&self, filter: LogQueryFilter) -> StorageResult<LogQueryResult>;

    /// Appends one attempt to the append-only provider decision chain.
    async fn append_provider_chain_item(
        &self,
        item: ProviderChainItemInput<'_>,
    ) -> StorageResult<i64>;

    /// Inserts the initial row for a logical client request. Returns the row id.
    async fn insert_message_request(
        &self,
        session_id: &str,
        request_sequence: i32,
        user_id: Option<i64>,
        user_key_id: Option<i64>,
        original_model_name: &str,
        model: &str,
    ) -> StorageResult<i64>;

    /// Updates a `message_requests` row in place with its terminal outcome
    /// (spec's "updated in place with duration, TTFB, token counts,
    /// cache-creation 5m/1h breakdown, cache-read tokens, ... cost, status
    /// code, error message/stack").
    async fn update_message_request(
        &self,
        id: i64,
        outcome: MessageRequestOutcome<'_>,
    ) -> StorageResult<()>;

    async fn find_message_request(
        &self,
        session_id: &str,
        request_sequence: i32,
    ) -> StorageResult<Option<MessageRequestRow>>;
}
