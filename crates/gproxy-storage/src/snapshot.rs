use gproxy_common::GlobalConfig;
use serde_json::Value as JsonValue;
use time::OffsetDateTime;

#[derive(Debug, Clone)]
pub struct GlobalConfigRow {
    pub id: i64,
    pub config: GlobalConfig,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct ProviderRow {
    pub id: i64,
    pub name: String,
    pub config_json: JsonValue,
    pub routing_json: JsonValue,
    pub enabled: bool,
    pub deleted_at: Option<OffsetDateTime>,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct CredentialRow {
    pub id: i64,
    pub provider_id: i64,
    pub name: Option<String>,
    pub settings_json: JsonValue,
    pub secret_json: JsonValue,
    pub enabled: bool,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct UserRow {
    pub id: i64,
    pub name: String,
    pub enabled: bool,
    pub limits_json: JsonValue,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct UserKeyRow {
    pub id: i64,
    pub user_id: i64,
    pub api_key: String,
    pub label: Option<String>,
    pub enabled: bool,
    pub routing_json: JsonValue,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct ProviderChainItemRow {
    pub id: i64,
    pub session_id: String,
    pub request_sequence: i32,
    pub provider_id: i64,
    pub attempt_no: i32,
    pub outcome: String,
    pub reason: Option<String>,
    pub at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct MessageRequestRow {
    pub id: i64,
    pub session_id: String,
    pub request_sequence: i32,
    pub user_id: Option<i64>,
    pub user_key_id: Option<i64>,
    pub original_model_name: String,
    pub model: String,
    pub final_model: Option<String>,
    pub status: String,
    pub status_code: Option<i32>,
    pub provider_id: Option<i64>,
    pub cost: Option<f64>,
    pub duration_ms: Option<i64>,
    pub ttfb_ms: Option<i64>,
    pub input_tokens: Option<i64>,
    pub output_tokens: Option<i64>,
    pub cache_read_tokens: Option<i64>,
    pub cache_creation_5m_tokens: Option<i64>,
    pub cache_creation_1h_tokens: Option<i64>,
    pub error_message: Option<String>,
    pub error_stack: Option<String>,
    pub special_settings: Option<JsonValue>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Debug, Clone)]
pub struct StorageSnapshot {
    pub global_config: Option<GlobalConfigRow>,
    pub providers: Vec<ProviderRow>,
    pub credentials: Vec<CredentialRow>,
    pub users: Vec<UserRow>,
    pub user_keys: Vec<UserKeyRow>,
}
