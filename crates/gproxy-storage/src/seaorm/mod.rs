use sea_orm::sea_query::Index;
use sea_orm::{
    ActiveModelTrait, ActiveValue, ColumnTrait, ConnectionTrait, DatabaseBackend,
    DatabaseConnection, EntityTrait, FromQueryResult, QueryFilter, QueryOrder, QuerySelect, Schema,
};
use time::OffsetDateTime;

use gproxy_common::GlobalConfig;
use gproxy_provider_core::{Event, Headers};

use crate::db;
use crate::entities;
use crate::snapshot::{
    CredentialRow, GlobalConfigRow, MessageRequestRow, ProviderRow, StorageSnapshot, UserKeyRow,
    UserRow,
};
use crate::storage::{
    LogQueryFilter, LogQueryResult, LogRecord, LogRecordKind, MessageRequestOutcome,
    ProviderChainItemInput, Storage, StorageError, StorageResult, UsageAggregate,
    UsageAggregateFilter,
};

#[derive(Debug, FromQueryResult)]
struct UsageAggregateRow {
    matched_rows: Option<i64>,
    input_tokens: Option<i64>,
    output_tokens: Option<i64>,
    cache_read_input_tokens: Option<i64>,
    cache_creation_input_tokens: Option<i64>,
}

fn headers_to_json(headers: &Headers) -> serde_json::Value {
    serde_json::to_value(headers).unwrap_or(serde_json::Value::Null)
}

#[derive(Clone)]
pub struct SeaOrmStorage {
    db: DatabaseConnection,
}

impl SeaOrmStorage {
    pub async fn connect(dsn: &str) -> StorageResult<Self> {
        let db = db::connect_shared(dsn).await?;
        if db.get_database_backend() == DatabaseBackend::Sqlite {
            db.execute_unprepared("PRAGMA foreign_keys = ON").await?;
        }
        Ok(Self { db })
    }

    pub fn connection(&self) -> &DatabaseConnection {
        &self.db
    }

    pub async fn provider_names(&self) -> StorageResult<Vec<String>> {
        use entities::providers::Column;
        let rows = entities::Providers::find()
            .filter(Column::DeletedAt.is_null())
            .all(&self.db)
            .await?;
        Ok(rows.into_iter().map(|m| m.name).collect())
    }

    async fn ensure_performance_indexes(&self) -> StorageResult<()> {
        use entities::upstream_requests::Column as UpstreamColumn;
        use entities::upstream_usages::Column as UpstreamUsageColumn;

        let statements = vec![
            Index::create()
                .name("idx_upstream_requests_at_id")
                .table(entities::UpstreamRequests)
                .col(UpstreamColumn::At)
                .col(UpstreamColumn::Id)
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_upstream_requests_provider_at_id")
                .table(entities::UpstreamRequests)
                .col(UpstreamColumn::Provider)
                .col(UpstreamColumn::At)
                .col(UpstreamColumn::Id)
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_upstream_requests_user_at_id")
                .table(entities::UpstreamRequests)
                .col(UpstreamColumn::UserId)
                .col(UpstreamColumn::At)
                .col(UpstreamColumn::Id)
                .if_not_exists()
                .to_owned(),
            Index::create()
                .name("idx_upstream_usages_provider_at")
                .table(entities::UpstreamUsages)
                .col(UpstreamUsageColumn::Provider)
                .col(UpstreamUsageColumn::At)
                .if_not_exists()
                .to_owned(),
        ];

        for statement in statements {
            self.db.execute(&statement).await?;
        }
        Ok(())
    }
}

#[async_trait::async_trait]
impl Storage for SeaOrmStorage {
    async fn sync(&self) -> StorageResult<()> {
        Schema::new(self.db.get_database_backend())
            .builder()
            .register(entities::GlobalConfig)
            .register(entities::Providers)
            .register(entities::Credentials)
            .register(entities::Users)
            .register(entities::UserKeys)
            .register(entities::DownstreamRequests)
            .register(entities::UpstreamRequests)
            .register(entities::UpstreamUsages)
            .register(entities::InternalEvents)
            .register(entities::ProviderChainItems)
            .register(entities::MessageRequests)
            .sync(&self.db)
            .await?;
        self.ensure_performance_indexes().await?;
        Ok(())
    }

    async fn load_global_config(&self) -> StorageResult<Option<GlobalConfigRow>> {
        use entities::global_config::Column;
        let row = entities::GlobalConfig::find()
            .order_by_asc(Column::Id)
            .one(&self.db)
            .await?;
        let Some(model) = row else {
            return Ok(None);
        };
        let config: GlobalConfig = serde_json::from_value(model.config_json)?;
        Ok(Some(GlobalConfigRow {
            id: model.id,
            config,
            updated_at: model.updated_at,
        }))
    }

    async fn upsert_global_config(&self, config: &GlobalConfig) -> StorageResult<()> {
        use entities::global_config::ActiveModel as GlobalActive;

        let now = OffsetDateTime::now_utc();
        let id = 1_i64;
        let config_json = serde_json::to_value(config)?;

        let existing = entities::GlobalConfig::find_by_id(id).one(&self.db).await?;
        match existing {
            Some(model) => {
                let mut active: GlobalActive = model.into();
                active.config_json = ActiveValue::Set(config_json);
                active.updated_at = ActiveValue::Set(now);
                active.update(&self.db).await?;
            }
            None => {
                let active = GlobalActive {
                    id: ActiveValue::Set(id),
                    config_json: ActiveValue::Set(config_json),
                    updated_at: ActiveValue::Set(now),
                };
                active.insert(&self.db).await?;
            }
        }
        Ok(())
    }

    async fn load_snapshot(&self) -> StorageResult<StorageSnapshot> {
        let global_config = self.load_global_config().await?;

        let providers = entities::Providers::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|m| ProviderRow {
                id: m.id,
                name: m.name,
                config_json: m.config_json,
                routing_json: m.routing_json,
                enabled: m.enabled,
                deleted_at: m.deleted_at,
                updated_at: m.updated_at,
            })
            .collect();

        let credentials = entities::Credentials::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|m| CredentialRow {
                id: m.id,
                provider_id: m.provider_id,
                name: m.name,
                settings_json: m.settings.unwrap_or(serde_json::Value::Null),
                secret_json: m.secret,
                enabled: m.enabled,
                created_at: m.created_at,
                updated_at: m.updated_at,
            })
            .collect();

        let users = entities::Users::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|m| UserRow {
                id: m.id,
                name: m.name,
                enabled: m.enabled,
                limits_json: m.limits_json,
                created_at: m.created_at,
                updated_at: m.updated_at,
            })
            .collect();

        let user_keys = entities::UserKeys::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|m| UserKeyRow {
                id: m.id,
                user_id: m.user_id,
                api_key: m.api_key,
                label: m.label,
                enabled: m.enabled,
                routing_json: m.routing_json,
                created_at: m.created_at,
                updated_at: m.updated_at,
            })
            .collect();

        Ok(StorageSnapshot {
            global_config,
            providers,
            credentials,
            users,
            user_keys,
        })
    }

    async fn upsert_provider(
        &self,
        name: &str,
        config_json: &serde_json::Value,
        routing_json: &serde_json::Value,
        enabled: bool,
    ) -> StorageResult<i64> {
        use entities::providers::{ActiveModel as ProviderActive, Column};

        let now = OffsetDateTime::now_utc();
        let existing = entities::Providers::find()
            .filter(Column::Name.eq(name))
            .one(&self.db)
            .await?;

        match existing {
            Some(model) => {
                let id = model.id;
                let mut active: ProviderActive = model.into();
                active.config_json = ActiveValue::Set(config_json.clone());
                active.routing_json = ActiveValue::Set(routing_json.clone());
                active.enabled = ActiveValue::Set(enabled);
                active.deleted_at = ActiveValue::Set(None);
                active.updated_at = ActiveValue::Set(now);
                active.update(&self.db).await?;
                Ok(id)
            }
            None => {
                let active = ProviderActive {
                    id: ActiveValue::NotSet,
                    name: ActiveValue::Set(name.to_string()),
                    config_json: ActiveValue::Set(config_json.clone()),
                    routing_json: ActiveValue::Set(routing_json.clone()),
                    enabled: ActiveValue::Set(enabled),
                    deleted_at: ActiveValue::Set(None),
                    updated_at: ActiveValue::Set(now),
                };
                let inserted = active.insert(&self.db).await?;
                Ok(inserted.id)
            }
        }
    }

    async fn set_provider_routing(
        &self,
        provider_id: i64,
        routing_json: &serde_json::Value,
    ) -> StorageResult<()> {
        use entities::providers::ActiveModel as ProviderActive;
        if let Some(model) = entities::Providers::find_by_id(provider_id)
            .one(&self.db)
            .await?
        {
            let mut active: ProviderActive = model.into();
            active.routing_json = ActiveValue::Set(routing_json.clone());
            active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
            active.update(&self.db).await?;
        }
        Ok(())
    }

    async fn delete_provider(&self, name: &str) -> StorageResult<()> {
        use entities::providers::{ActiveModel as ProviderActive, Column};
        if let Some(model) = entities::Providers::find()
            .filter(Column::Name.eq(name))
            .one(&self.db)
            .await?
        {
            let mut active: ProviderActive = model.into();
            active.enabled = ActiveValue::Set(false);
            active.deleted_at = ActiveValue::Set(Some(OffsetDateTime::now_utc()));
            active.update(&self.db).await?;
        }
        Ok(())
    }

    async fn insert_credential(
        &self,
        provider_name: &str,
        name: Option<&str>,
        settings_json: &serde_json::Value,
        secret_json: &serde_json::Value,
        enabled: bool,
    ) -> StorageResult<i64> {
        use entities::credentials::ActiveModel as CredentialActive;
        use entities::providers::Column as ProviderColumn;

        let provider = entities::Providers::find()
            .filter(ProviderColumn::Name.eq(provider_name))
            .one(&self.db)
            .await?
            .ok_or_else(|| {
                StorageError::Db(sea_orm::DbErr::RecordNotFound(format!(
                    "provider not found: {provider_name}"
                )))
            })?;

        let now = OffsetDateTime::now_utc();
        let active = CredentialActive {
            id: ActiveValue::NotSet,
            provider_id: ActiveValue::Set(provider.id),
            name: ActiveValue::Set(name.map(|s| s.to_string())),
            settings: ActiveValue::Set(Some(settings_json.clone())),
            secret: ActiveValue::Set(secret_json.clone()),
            enabled: ActiveValue::Set(enabled),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
        };
        let inserted = active.insert(&self.db).await?;
        Ok(inserted.id)
    }

    async fn update_credential(
        &self,
        credential_id: i64,
        name: Option<&str>,
        settings_json: &serde_json::Value,
        secret_json: &serde_json::Value,
    ) -> StorageResult<()> {
        use entities::credentials::ActiveModel as CredentialActive;
        if let Some(model) = entities::Credentials::find_by_id(credential_id)
            .one(&self.db)
            .await?
        {
            let mut active: CredentialActive = model.into();
            active.name = ActiveValue::Set(name.map(|s| s.to_string()));
            active.settings = ActiveValue::Set(Some(settings_json.clone()));
            active.secret = ActiveValue::Set(secret_json.clone());
            active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
            active.update(&self.db).await?;
        }
        Ok(())
    }

    async fn set_credential_enabled(&self, credential_id: i64, enabled: bool) -> StorageResult<()> {
        use entities::credentials::ActiveModel as CredentialActive;
        if let Some(model) = entities::Credentials::find_by_id(credential_id)
            .one(&self.db)
            .await?
        {
            let mut active: CredentialActive = model.into();
            active.enabled = ActiveValue::Set(enabled);
            active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
            active.update(&self.db).await?;
        }
        Ok(())
    }

    async fn delete_credential(&self, credential_id: i64) -> StorageResult<()> {
        entities::Credentials::delete_by_id(credential_id)
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn upsert_user_by_id(
        &self,
        user_id: i64,
        name: &str,
        enabled: bool,
        limits_json: &serde_json::Value,
    ) -> StorageResult<()> {
        use entities::users::ActiveModel as UserActive;

        let now = OffsetDateTime::now_utc();
        let existing = entities::Users::find_by_id(user_id).one(&self.db).await?;
        match existing {
            Some(model) => {
                let mut active: UserActive = model.into();
                active.name = ActiveValue::Set(name.to_string());
                active.enabled = ActiveValue::Set(enabled);
                active.limits_json = ActiveValue::Set(limits_json.clone());
                active.updated_at = ActiveValue::Set(now);
                active.update(&self.db).await?;
            }
            None => {
                let active = UserActive {
                    id: ActiveValue::Set(user_id),
                    name: ActiveValue::Set(name.to_string()),
                    enabled: ActiveValue::Set(enabled),
                    limits_json: ActiveValue::Set(limits_json.clone()),
                    created_at: ActiveValue::Set(now),
                    updated_at: ActiveValue::Set(now),
                };
                active.insert(&self.db).await?;
            }
        }
        Ok(())
    }

    async fn set_user_enabled(&self, user_id: i64, enabled: bool) -> StorageResult<()> {
        use entities::users::ActiveModel as UserActive;
        if let Some(model) = entities::Users::find_by_id(user_id).one(&self.db).await? {
            let mut active: UserActive = model.into();
            active.enabled = ActiveValue::Set(enabled);
            active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
            active.update(&self.db).await?;
        }
        Ok(())
    }

    async fn set_user_limits(
        &self,
        user_id: i64,
        limits_json: &serde_json::Value,
    ) -> StorageResult<()> {
        use entities::users::ActiveModel as UserActive;
        if let Some(model) = entities::Users::find_by_id(user_id).one(&self.db).await? {
            let mut active: UserActive = model.into();
            active.limits_json = ActiveValue::Set(limits_json.clone());
            active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
            active.update(&self.db).await?;
        }
        Ok(())
    }

    async fn delete_user(&self, user_id: i64) -> StorageResult<()> {
        entities::Users::delete_by_id(user_id).exec(&self.db).await?;
        Ok(())
    }

    async fn insert_user_key(
        &self,
        user_id: i64,
        api_key: &str,
        label: Option<&str>,
        enabled: bool,
        routing_json: &serde_json::Value,
    ) -> StorageResult<i64> {
        use entities::user_keys::ActiveModel as UserKeyActive;

        let now = OffsetDateTime::now_utc();
        let active = UserKeyActive {
            id: ActiveValue::NotSet,
            user_id: ActiveValue::Set(user_id),
            api_key: ActiveValue::Set(api_key.to_string()),
            label: ActiveValue::Set(label.map(|s| s.to_string())),
            enabled: ActiveValue::Set(enabled),
            routing_json: ActiveValue::Set(routing_json.clone()),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
        };
        let inserted = active.insert(&self.db).await?;
        Ok(inserted.id)
    }

    async fn set_user_key_enabled(&self, user_key_id: i64, enabled: bool) -> StorageResult<()> {
        use entities::user_keys::ActiveModel as UserKeyActive;
        if let Some(model) = entities::UserKeys::find_by_id(user_key_id)
            .one(&self.db)
            .await?
        {
            let mut active: UserKeyActive = model.into();
            active.enabled = ActiveValue::Set(enabled);
            active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
            active.update(&self.db).await?;
        }
        Ok(())
    }

    async fn update_user_key_label(
        &self,
        user_key_id: i64,
        label: Option<&str>,
    ) -> StorageResult<()> {
        use entities::user_keys::ActiveModel as UserKeyActive;
        if let Some(model) = entities::UserKeys::find_by_id(user_key_id)
            .one(&self.db)
            .await?
        {
            let mut active: UserKeyActive = model.into();
            active.label = ActiveValue::Set(label.map(|s| s.to_string()));
            active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
            active.update(&self.db).await?;
        }
        Ok(())
    }

    async fn set_user_key_routing(
        &self,
        user_key_id: i64,
        routing_json: &serde_json::Value,
    ) -> StorageResult<()> {
        use entities::user_keys::ActiveModel as UserKeyActive;
        if let Some(model) = entities::UserKeys::find_by_id(user_key_id)
            .one(&self.db)
            .await?
        {
            let mut active: UserKeyActive = model.into();
            active.routing_json = ActiveValue::Set(routing_json.clone());
            active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
            active.update(&self.db).await?;
        }
        Ok(())
    }

    async fn delete_user_key(&self, user_key_id: i64) -> StorageResult<()> {
        entities::UserKeys::delete_by_id(user_key_id)
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn append_event(&self, event: &Event) -> StorageResult<()> {
        match event {
            Event::Downstream(ev) => {
                use entities::downstream_requests::ActiveModel as DownstreamActive;
                let active = DownstreamActive {
                    id: ActiveValue::NotSet,
                    trace_id: ActiveValue::Set(ev.trace_id.clone()),
                    at: ActiveValue::Set(OffsetDateTime::from(ev.at)),
                    user_id: ActiveValue::Set(ev.user_id),
                    user_key_id: ActiveValue::Set(ev.user_key_id),
                    operation: ActiveValue::Set(ev.request_path.clone()),
                    request_method: ActiveValue::Set(ev.request_method.clone()),
                    request_path: ActiveValue::Set(ev.request_path.clone()),
                    response_status: ActiveValue::Set(ev.response_status.map(i32::from)),
                    error_kind: ActiveValue::Set(None),
                    error_message: ActiveValue::Set(None),
                    created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
                };
                entities::DownstreamRequests::insert(active)
                    .exec(&self.db)
                    .await?;
            }
            Event::Upstream(ev) => {
                use entities::upstream_requests::ActiveModel as UpstreamActive;
                use entities::upstream_usages::ActiveModel as UsageActive;

                let now = OffsetDateTime::now_utc();
                let active = UpstreamActive {
                    id: ActiveValue::NotSet,
                    trace_id: ActiveValue::Set(ev.trace_id.clone()),
                    at: ActiveValue::Set(OffsetDateTime::from(ev.at)),
                    user_id: ActiveValue::Set(ev.user_id),
                    user_key_id: ActiveValue::Set(ev.user_key_id),
                    provider: ActiveValue::Set(ev.provider.clone()),
                    credential_id: ActiveValue::Set(ev.credential_id),
                    internal: ActiveValue::Set(ev.internal),
                    attempt_no: ActiveValue::Set(ev.attempt_no as i32),
                    operation: ActiveValue::Set(ev.operation.clone()),
                    request_method: ActiveValue::Set(ev.request_method.clone()),
                    request_headers_json: ActiveValue::Set(headers_to_json(&ev.request_headers)),
                    request_path: ActiveValue::Set(ev.request_path.clone()),
                    request_query: ActiveValue::Set(ev.request_query.clone()),
                    request_body: ActiveValue::Set(ev.request_body.clone()),
                    response_status: ActiveValue::Set(ev.response_status.map(i32::from)),
                    response_headers_json: ActiveValue::Set(headers_to_json(&ev.response_headers)),
                    response_body: ActiveValue::Set(ev.response_body.clone()),
                    error_kind: ActiveValue::Set(ev.error_kind.clone()),
                    error_message: ActiveValue::Set(ev.error_message.clone()),
                    transport_kind: ActiveValue::Set(
                        ev.transport_kind.map(|kind| format!("{kind:?}")),
                    ),
                    created_at: ActiveValue::Set(now),
                };
                let inserted = entities::UpstreamRequests::insert(active)
                    .exec_with_returning(&self.db)
                    .await?;

                if let Some(usage) = &ev.usage {
                    let usage_active = UsageActive {
                        id: ActiveValue::NotSet,
                        upstream_request_id: ActiveValue::Set(inserted.id),
                        trace_id: ActiveValue::Set(ev.trace_id.clone()),
                        at: ActiveValue::Set(OffsetDateTime::from(ev.at)),
                        user_id: ActiveValue::Set(ev.user_id),
                        user_key_id: ActiveValue::Set(ev.user_key_id),
                        provider: ActiveValue::Set(ev.provider.clone()),
                        credential_id: ActiveValue::Set(ev.credential_id),
                        internal: ActiveValue::Set(ev.internal),
                        attempt_no: ActiveValue::Set(ev.attempt_no as i32),
                        operation: ActiveValue::Set(ev.operation.clone()),
                        model: ActiveValue::Set(None),
                        input_tokens: ActiveValue::Set(usage.input_tokens.map(i64::from)),
                        output_tokens: ActiveValue::Set(usage.output_tokens.map(i64::from)),
                        cache_read_input_tokens: ActiveValue::Set(
                            usage.cache_read_input_tokens.map(i64::from),
                        ),
                        cache_creation_input_tokens: ActiveValue::Set(
                            usage.cache_creation_input_tokens.map(i64::from),
                        ),
                        created_at: ActiveValue::Set(now),
                    };
                    entities::UpstreamUsages::insert(usage_active)
                        .exec(&self.db)
                        .await?;
                }
            }
            Event::Operational(op) => {
                use entities::internal_events::ActiveModel as InternalActive;
                let (event_type, payload_json, at) = match op {
                    gproxy_provider_core::OperationalEvent::UnavailableStart(e) => (
                        "unavailable_start",
                        serde_json::to_value(e)?,
                        OffsetDateTime::from(e.at),
                    ),
                    gproxy_provider_core::OperationalEvent::UnavailableEnd(e) => (
                        "unavailable_end",
                        serde_json::to_value(e)?,
                        OffsetDateTime::from(e.at),
                    ),
                    gproxy_provider_core::OperationalEvent::ModelUnavailableStart(e) => (
                        "model_unavailable_start",
                        serde_json::to_value(e)?,
                        OffsetDateTime::from(e.at),
                    ),
                    gproxy_provider_core::OperationalEvent::ModelUnavailableEnd(e) => (
                        "model_unavailable_end",
                        serde_json::to_value(e)?,
                        OffsetDateTime::from(e.at),
                    ),
                };
                let active = InternalActive {
                    id: ActiveValue::NotSet,
                    event_type: ActiveValue::Set(event_type.to_string()),
                    payload_json: ActiveValue::Set(payload_json),
                    at: ActiveValue::Set(at),
                    created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
                };
                entities::InternalEvents::insert(active)
                    .exec(&self.db)
                    .await?;
            }
        }
        Ok(())
    }

    async fn aggregate_usage_tokens(
        &self,
        filter: UsageAggregateFilter,
    ) -> StorageResult<UsageAggregate> {
        use entities::upstream_usages::Column;

        let mut query = entities::UpstreamUsages::find()
            .filter(Column::At.gte(filter.from))
            .filter(Column::At.lte(filter.to));
        if let Some(provider) = &filter.provider {
            query = query.filter(Column::Provider.eq(provider.clone()));
        }
        if let Some(credential_id) = filter.credential_id {
            query = query.filter(Column::CredentialId.eq(credential_id));
        }
        if let Some(model) = &filter.model {
            query = query.filter(Column::Model.eq(model.clone()));
        }
        if let Some(contains) = &filter.model_contains {
            query = query.filter(Column::Model.contains(contains));
        }

        let row = query
            .select_only()
            .column_as(Column::Id.count(), "matched_rows")
            .column_as(Column::InputTokens.sum(), "input_tokens")
            .column_as(Column::OutputTokens.sum(), "output_tokens")
            .column_as(Column::CacheReadInputTokens.sum(), "cache_read_input_tokens")
            .column_as(
                Column::CacheCreationInputTokens.sum(),
                "cache_creation_input_tokens",
            )
            .into_model::<UsageAggregateRow>()
            .one(&self.db)
            .await?;

        let row = row.unwrap_or(UsageAggregateRow {
            matched_rows: Some(0),
            input_tokens: Some(0),
            output_tokens: Some(0),
            cache_read_input_tokens: Some(0),
            cache_creation_input_tokens: Some(0),
        });
        let input_tokens = row.input_tokens.unwrap_or(0);
        let output_tokens = row.output_tokens.unwrap_or(0);
        Ok(UsageAggregate {
            matched_rows: row.matched_rows.unwrap_or(0),
            input_tokens,
            output_tokens,
            cache_read_input_tokens: row.cache_read_input_tokens.unwrap_or(0),
            cache_creation_input_tokens: row.cache_creation_input_tokens.unwrap_or(0),
            total_tokens: input_tokens + output_tokens,
        })
    }

    async fn query_logs(&self, filter: LogQueryFilter) -> StorageResult<LogQueryResult> {
        let query_upstream = filter.kind != Some(LogRecordKind::Downstream);
        let query_downstream = filter.kind != Some(LogRecordKind::Upstream);
        let limit = filter.limit.max(1) as u64;

        let mut rows = Vec::new();

        if query_upstream {
            use entities::upstream_requests::Column;
            let mut q = entities::UpstreamRequests::find()
                .filter(Column::At.gte(filter.from))
                .filter(Column::At.lte(filter.to));
            if let Some(provider) = &filter.provider {
                q = q.filter(Column::Provider.eq(provider.clone()));
            }
            if let Some(credential_id) = filter.credential_id {
                q = q.filter(Column::CredentialId.eq(credential_id));
            }
            if let Some(user_id) = filter.user_id {
                q = q.filter(Column::UserId.eq(user_id));
            }
            if let Some(user_key_id) = filter.user_key_id {
                q = q.filter(Column::UserKeyId.eq(user_key_id));
            }
            if let Some(trace_id) = &filter.trace_id {
                q = q.filter(Column::TraceId.eq(trace_id.clone()));
            }
            if let Some(operation) = &filter.operation {
                q = q.filter(Column::Operation.eq(operation.clone()));
            }
            if let Some(path_contains) = &filter.request_path_contains {
                q = q.filter(Column::RequestPath.contains(path_contains));
            }
            if let Some(status_min) = filter.status_min {
                q = q.filter(Column::ResponseStatus.gte(status_min));
            }
            if let Some(status_max) = filter.status_max {
                q = q.filter(Column::ResponseStatus.lte(status_max));
            }

            let models = q
                .order_by_desc(Column::At)
                .order_by_desc(Column::Id)
                .offset(filter.offset as u64)
                .limit(limit + 1)
                .all(&self.db)
                .await?;
            rows.extend(models.into_iter().map(|m| LogRecord {
                id: m.id,
                kind: LogRecordKind::Upstream,
                at: m.at,
                trace_id: m.trace_id,
                provider: Some(m.provider),
                credential_id: m.credential_id,
                user_id: m.user_id,
                user_key_id: m.user_key_id,
                attempt_no: Some(m.attempt_no),
                operation: Some(m.operation),
                request_method: m.request_method,
                request_path: m.request_path,
                response_status: m.response_status,
                error_kind: m.error_kind,
                error_message: m.error_message,
            }));
        }

        if query_downstream {
            use entities::downstream_requests::Column;
            let mut q = entities::DownstreamRequests::find()
                .filter(Column::At.gte(filter.from))
                .filter(Column::At.lte(filter.to));
            if let Some(user_id) = filter.user_id {
                q = q.filter(Column::UserId.eq(user_id));
            }
            if let Some(user_key_id) = filter.user_key_id {
                q = q.filter(Column::UserKeyId.eq(user_key_id));
            }
            if let Some(trace_id) = &filter.trace_id {
                q = q.filter(Column::TraceId.eq(trace_id.clone()));
            }
            if let Some(path_contains) = &filter.request_path_contains {
                q = q.filter(Column::RequestPath.contains(path_contains));
            }
            if let Some(status_min) = filter.status_min {
                q = q.filter(Column::ResponseStatus.gte(status_min));
            }
            if let Some(status_max) = filter.status_max {
                q = q.filter(Column::ResponseStatus.lte(status_max));
            }

            let models = q
                .order_by_desc(Column::At)
                .order_by_desc(Column::Id)
                .offset(filter.offset as u64)
                .limit(limit + 1)
                .all(&self.db)
                .await?;
            rows.extend(models.into_iter().map(|m| LogRecord {
                id: m.id,
                kind: LogRecordKind::Downstream,
                at: m.at,
                trace_id: m.trace_id,
                provider: None,
                credential_id: None,
                user_id: m.user_id,
                user_key_id: m.user_key_id,
                attempt_no: None,
                operation: Some(m.operation),
                request_method: m.request_method,
                request_path: m.request_path,
                response_status: m.response_status,
                error_kind: m.error_kind,
                error_message: m.error_message,
            }));
        }

        rows.sort_by(|a, b| b.at.cmp(&a.at).then_with(|| b.id.cmp(&a.id)));
        let has_more = rows.len() as u64 > limit;
        rows.truncate(filter.limit.max(1));

        Ok(LogQueryResult { rows, has_more })
    }

    async fn append_provider_chain_item(
        &self,
        item: ProviderChainItemInput<'_>,
    ) -> StorageResult<i64> {
        use entities::provider_chain_items::ActiveModel as ChainActive;
        let active = ChainActive {
            id: ActiveValue::NotSet,
            session_id: ActiveValue::Set(item.session_id.to_string()),
            request_sequence: ActiveValue::Set(item.request_sequence),
            provider_id: ActiveValue::Set(item.provider_id),
            attempt_no: ActiveValue::Set(item.attempt_no),
            outcome: ActiveValue::Set(item.outcome.to_string()),
            reason: ActiveValue::Set(item.reason.map(|s| s.to_string())),
            at: ActiveValue::Set(OffsetDateTime::now_utc()),
        };
        let inserted = active.insert(&self.db).await?;
        Ok(inserted.id)
    }

    async fn insert_message_request(
        &self,
        session_id: &str,
        request_sequence: i32,
        user_id: Option<i64>,
        user_key_id: Option<i64>,
        original_model_name: &str,
        model: &str,
    ) -> StorageResult<i64> {
        use entities::message_requests::ActiveModel as RequestActive;
        let now = OffsetDateTime::now_utc();
        let active = RequestActive {
            id: ActiveValue::NotSet,
            session_id: ActiveValue::Set(session_id.to_string()),
            request_sequence: ActiveValue::Set(request_sequence),
            user_id: ActiveValue::Set(user_id),
            user_key_id: ActiveValue::Set(user_key_id),
            original_model_name: ActiveValue::Set(original_model_name.to_string()),
            model: ActiveValue::Set(model.to_string()),
            final_model: ActiveValue::Set(None),
            status: ActiveValue::Set("pending".to_string()),
            status_code: ActiveValue::Set(None),
            provider_id: ActiveValue::Set(None),
            cost: ActiveValue::Set(None),
            duration_ms: ActiveValue::Set(None),
            ttfb_ms: ActiveValue::Set(None),
            input_tokens: ActiveValue::Set(None),
            output_tokens: ActiveValue::Set(None),
            cache_read_tokens: ActiveValue::Set(None),
            cache_creation_5m_tokens: ActiveValue::Set(None),
            cache_creation_1h_tokens: ActiveValue::Set(None),
            error_message: ActiveValue::Set(None),
            error_stack: ActiveValue::Set(None),
            special_settings: ActiveValue::Set(None),
            created_at: ActiveValue::Set(now),
            updated_at: ActiveValue::Set(now),
        };
        let inserted = active.insert(&self.db).await?;
        Ok(inserted.id)
    }

    async fn update_message_request(
        &self,
        id: i64,
        outcome: MessageRequestOutcome<'_>,
    ) -> StorageResult<()> {
        use entities::message_requests::ActiveModel as RequestActive;
        if let Some(model) = entities::MessageRequests::find_by_id(id)
            .one(&self.db)
            .await?
        {
            let mut active: RequestActive = model.into();
            active.status = ActiveValue::Set(outcome.status.to_string());
            if outcome.status_code.is_some() {
                active.status_code = ActiveValue::Set(outcome.status_code);
            }
            if outcome.provider_id.is_some() {
                active.provider_id = ActiveValue::Set(outcome.provider_id);
            }
            if let Some(final_model) = outcome.final_model {
                active.final_model = ActiveValue::Set(Some(final_model.to_string()));
            }
            if outcome.cost.is_some() {
                active.cost = ActiveValue::Set(outcome.cost);
            }
            if outcome.duration_ms.is_some() {
                active.duration_ms = ActiveValue::Set(outcome.duration_ms);
            }
            if outcome.ttfb_ms.is_some() {
                active.ttfb_ms = ActiveValue::Set(outcome.ttfb_ms);
            }
            if outcome.input_tokens.is_some() {
                active.input_tokens = ActiveValue::Set(outcome.input_tokens);
            }
            if outcome.output_tokens.is_some() {
                active.output_tokens = ActiveValue::Set(outcome.output_tokens);
            }
            if outcome.cache_read_tokens.is_some() {
                active.cache_read_tokens = ActiveValue::Set(outcome.cache_read_tokens);
            }
            if outcome.cache_creation_5m_tokens.is_some() {
                active.cache_creation_5m_tokens = ActiveValue::Set(outcome.cache_creation_5m_tokens);
            }
            if outcome.cache_creation_1h_tokens.is_some() {
                active.cache_creation_1h_tokens = ActiveValue::Set(outcome.cache_creation_1h_tokens);
            }
            if let Some(error_message) = outcome.error_message {
                active.error_message = ActiveValue::Set(Some(error_message.to_string()));
            }
            if let Some(error_stack) = outcome.error_stack {
                active.error_stack = ActiveValue::Set(Some(error_stack.to_string()));
            }
            if let Some(special_settings) = outcome.special_settings {
                active.special_settings = ActiveValue::Set(Some(special_settings.clone()));
            }
            active.updated_at = ActiveValue::Set(OffsetDateTime::now_utc());
            active.update(&self.db).await?;
        }
        Ok(())
    }

    async fn find_message_request(
        &self,
        session_id: &str,
        request_sequence: i32,
    ) -> StorageResult<Option<MessageRequestRow>> {
        use entities::message_requests::Column;
        let row = entities::MessageRequests::find()
            .filter(Column::SessionId.eq(session_id))
            .filter(Column::RequestSequence.eq(request_sequence))
            .one(&self.db)
            .await?;
        Ok(row.map(|m| MessageRequestRow {
            id: m.id,
            session_id: m.session_id,
            request_sequence: m.request_sequence,
            user_id: m.user_id,
            user_key_id: m.user_key_id,
            original_model_name: m.original_model_name,
            model: m.model,
            final_model: m.final_model,
            status: m.status,
            status_code: m.status_code,
            provider_id: m.provider_id,
            cost: m.cost,
            duration_ms: m.duration_ms,
            ttfb_ms: m.ttfb_ms,
            input_tokens: m.input_tokens,
            output_tokens: m.output_tokens,
            cache_read_tokens: m.cache_read_tokens,
            cache_creation_5m_tokens: m.cache_creation_5m_tokens,
            cache_creation_1h_tokens: m.cache_creation_1h_tokens,
            error_message: m.error_message,
            error_stack: m.error_stack,
            special_settings: m.special_settings,
            created_at: m.created_at,
            updated_at: m.updated_at,
        }))
    }
}
