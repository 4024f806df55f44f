use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// One logical client request, updated in place as its provider chain
/// resolves. Pairs with `provider_chain_items` rows sharing `session_id` and
/// `request_sequence`.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "message_requests")]
pub struct Model {
    #[sea_orm(primary_key)]
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
    pub special_settings: Option<Json>,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
