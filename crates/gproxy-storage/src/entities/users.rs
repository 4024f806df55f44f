use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

#[sea_orm::model]
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "users")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(unique_key = "user_name")]
    pub name: String,
    pub enabled: bool,
    /// `provider_group`, per-period spend limits, `daily_reset_time`/`mode`,
    /// `rpm`, `allowed_clients`, `allowed_models`, `expires_at`.
    /// See `gproxy_core::guards::rate_limit::UserLimits`.
    pub limits_json: Json,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
    #[sea_orm(has_many)]
    pub keys: HasMany<super::user_keys::Entity>,
}

impl ActiveModelBehavior for ActiveModel {}
