use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// One provider attempt within a session's routing decision chain.
///
/// Append-only: a session that tries three providers before a terminal
/// response writes three rows sharing `session_id`, ordered by
/// `request_sequence`/`attempt_no`.
#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "provider_chain_items")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub session_id: String,
    pub request_sequence: i32,
    pub provider_id: i64,
    pub attempt_no: i32,
    pub outcome: String,
    pub reason: Option<String>,
    pub at: OffsetDateTime,
}

impl ActiveModelBehavior for ActiveModel {}
