use async_trait::async_trait;
use sea_orm::sea_query::Expr;
use sea_orm::{
    ActiveValue, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter,
};
use time::OffsetDateTime;

use crate::entities::{abilities, channels, error_logs, logs, tokens, users};
use crate::snapshot::{
    json_object, split_csv, AbilityRow, ChannelRow, StorageSnapshot, TokenRow, UserRow,
};

pub type StorageResult<T> = Result<T, StorageError>;

#[derive(Debug, thiserror::Error)]
pub enum StorageError {
    #[error("db error: {0}")]
    Db(#[from] sea_orm::DbErr),
    #[error("serde json error: {0}")]
    Serde(#[from] serde_json::Error),
}

#[derive(Debug, Clone)]
pub struct UsageLogRow {
    pub user_id: i64,
    pub token_id: i64,
    pub channel_id: i64,
    pub model_name: String,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub quota: i64,
    pub is_stream: bool,
    pub content: String,
}

#[derive(Debug, Clone)]
pub struct ErrorLogRow {
    pub user_id: i64,
    pub token_id: i64,
    pub channel_id: i64,
    pub channel_name: String,
    pub channel_type: i32,
    pub model_name: String,
    pub user_group: String,
    pub error_kind: String,
    pub status_code: i32,
    pub is_multi_key: bool,
    pub multi_key_index: Option<i32>,
    pub use_channel: Vec<i64>,
    /// Already scrubbed by the caller.
    pub message: String,
}

/// Storage is used for bootstrap (`load_snapshot`), quota settlement, channel
/// state writes, and the append-only sinks. Runtime reads never hit the DB;
/// they work from in-memory snapshots.
#[async_trait]
pub trait Storage: Send + Sync {
    async fn load_snapshot(&self) -> StorageResult<StorageSnapshot>;

    /// Atomically debit the user iff the balance covers the amount. Returns
    /// false when it does not; no partial debit ever happens.
    async fn debit_user_quota(&self, user_id: i64, amount: i64) -> StorageResult<bool>;

    /// Unconditional credit (refunds).
    async fn credit_user_quota(&self, user_id: i64, amount: i64) -> StorageResult<()>;

    /// Record actual consumption: moves the amount into used_quota.
    async fn add_used_quota(&self, user_id: i64, amount: i64) -> StorageResult<()>;

    /// Token-level hold bookkeeping; unlimited tokens are left alone.
    async fn debit_token_quota(&self, token_id: i64, amount: i64) -> StorageResult<()>;

    async fn set_channel_status(&self, channel_id: i64, status: i32) -> StorageResult<()>;

    async fn bump_channel_error_count(&self, channel_id: i64) -> StorageResult<()>;

    async fn append_usage_log(&self, row: UsageLogRow) -> StorageResult<()>;

    async fn append_error_log(&self, row: ErrorLogRow) -> StorageResult<()>;
}

pub struct SeaOrmStorage {
    db: DatabaseConnection,
}

impl SeaOrmStorage {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }
}

#[async_trait]
impl Storage for SeaOrmStorage {
    async fn load_snapshot(&self) -> StorageResult<StorageSnapshot> {
        let channels = channels::Entity::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|row| ChannelRow {
                id: row.id,
                channel_type: row.channel_type,
                name: row.name,
                base_url: row.base_url.trim_end_matches('/').to_string(),
                key: row.key,
                models: split_csv(&row.models),
                groups: split_csv(&row.user_group),
                priority: row.priority,
                weight: row.weight,
                status: row.status,
                auto_ban: row.auto_ban,
                model_mapping: json_object(row.model_mapping.as_ref()),
                param_override: json_object(row.param_override.as_ref()),
            })
            .collect();

        let abilities = abilities::Entity::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|row| AbilityRow {
                user_group: row.user_group,
                model: row.model,
                channel_id: row.channel_id,
                priority: row.priority,
                weight: row.weight,
                enabled: row.enabled,
            })
            .collect();

        let users = users::Entity::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|row| UserRow {
                id: row.id,
                username: row.username,
                user_group: row.user_group,
                quota: row.quota,
                enabled: row.enabled,
            })
            .collect();

        let tokens = tokens::Entity::find()
            .all(&self.db)
            .await?
            .into_iter()
            .map(|row| TokenRow {
                id: row.id,
                user_id: row.user_id,
                key_hash: row.key_hash,
                name: row.name,
                remain_quota: row.remain_quota,
                unlimited_quota: row.unlimited_quota,
                enabled: row.enabled,
            })
            .collect();

        Ok(StorageSnapshot {
            channels,
            abilities,
            users,
            tokens,
        })
    }

    async fn debit_user_quota(&self, user_id: i64, amount: i64) -> StorageResult<bool> {
        let result = users::Entity::update_many()
            .col_expr(
                users::Column::Quota,
                Expr::col(users::Column::Quota).sub(amount),
            )
            .filter(users::Column::Id.eq(user_id))
            .filter(users::Column::Quota.gte(amount))
            .exec(&self.db)
            .await?;
        Ok(result.rows_affected > 0)
    }

    async fn credit_user_quota(&self, user_id: i64, amount: i64) -> StorageResult<()> {
        users::Entity::update_many()
            .col_expr(
                users::Column::Quota,
                Expr::col(users::Column::Quota).add(amount),
            )
            .filter(users::Column::Id.eq(user_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn add_used_quota(&self, user_id: i64, amount: i64) -> StorageResult<()> {
        users::Entity::update_many()
            .col_expr(
                users::Column::UsedQuota,
                Expr::col(users::Column::UsedQuota).add(amount),
            )
            .filter(users::Column::Id.eq(user_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn debit_token_quota(&self, token_id: i64, amount: i64) -> StorageResult<()> {
        tokens::Entity::update_many()
            .col_expr(
                tokens::Column::RemainQuota,
                Expr::col(tokens::Column::RemainQuota).sub(amount),
            )
            .filter(tokens::Column::Id.eq(token_id))
            .filter(tokens::Column::UnlimitedQuota.eq(false))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn set_channel_status(&self, channel_id: i64, status: i32) -> StorageResult<()> {
        channels::Entity::update_many()
            .col_expr(channels::Column::Status, Expr::value(status))
            .col_expr(
                channels::Column::UpdatedAt,
                Expr::value(OffsetDateTime::now_utc()),
            )
            .filter(channels::Column::Id.eq(channel_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn bump_channel_error_count(&self, channel_id: i64) -> StorageResult<()> {
        channels::Entity::update_many()
            .col_expr(
                channels::Column::ErrorCount,
                Expr::col(channels::Column::ErrorCount).add(1),
            )
            .filter(channels::Column::Id.eq(channel_id))
            .exec(&self.db)
            .await?;
        Ok(())
    }

    async fn append_usage_log(&self, row: UsageLogRow) -> StorageResult<()> {
        logs::Entity::insert(logs::ActiveModel {
            id: ActiveValue::NotSet,
            user_id: ActiveValue::Set(row.user_id),
            token_id: ActiveValue::Set(row.token_id),
            channel_id: ActiveValue::Set(row.channel_id),
            model_name: ActiveValue::Set(row.model_name),
            prompt_tokens: ActiveValue::Set(row.prompt_tokens),
            completion_tokens: ActiveValue::Set(row.completion_tokens),
            quota: ActiveValue::Set(row.quota),
            is_stream: ActiveValue::Set(row.is_stream),
            content: ActiveValue::Set(row.content),
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
        })
        .exec(&self.db)
        .await?;
        Ok(())
    }

    async fn append_error_log(&self, row: ErrorLogRow) -> StorageResult<()> {
        error_logs::Entity::insert(error_logs::ActiveModel {
            id: ActiveValue::NotSet,
            user_id: ActiveValue::Set(row.user_id),
            token_id: ActiveValue::Set(row.token_id),
            channel_id: ActiveValue::Set(row.channel_id),
            channel_name: ActiveValue::Set(row.channel_name),
            channel_type: ActiveValue::Set(row.channel_type),
            model_name: ActiveValue::Set(row.model_name),
            user_group: ActiveValue::Set(row.user_group),
            error_kind: ActiveValue::Set(row.error_kind),
            status_code: ActiveValue::Set(row.status_code),
            is_multi_key: ActiveValue::Set(row.is_multi_key),
            multi_key_index: ActiveValue::Set(row.multi_key_index),
            use_channel: ActiveValue::Set(serde_json::to_value(&row.use_channel)?),
            message: ActiveValue::Set(row.message),
            created_at: ActiveValue::Set(OffsetDateTime::now_utc()),
        })
        .exec(&self.db)
        .await?;
        Ok(())
    }
}
