use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Channel status values; the core only ever soft-disables.
pub const STATUS_ENABLED: i32 = 1;
pub const STATUS_MANUAL_DISABLED: i32 = 2;
pub const STATUS_AUTO_DISABLED: i32 = 3;

#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "channels")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(column_name = "type")]
    pub channel_type: i32,
    pub name: String,
    pub base_url: String,
    /// Single credential, or a JSON array of credentials for multi-key
    /// channels.
    pub key: String,
    /// Comma-separated model allowlist.
    pub models: String,
    /// Comma-separated group membership.
    #[sea_orm(column_name = "group")]
    pub user_group: String,
    pub priority: i64,
    pub weight: i64,
    pub status: i32,
    pub auto_ban: bool,
    pub model_mapping: Option<Json>,
    pub param_override: Option<Json>,
    pub error_count: i64,
    pub created_at: OffsetDateTime,
    pub updated_at: OffsetDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
