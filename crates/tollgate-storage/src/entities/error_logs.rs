use sea_orm::entity::prelude::*;
use time::OffsetDateTime;

/// Append-only sink for scrubbed relay errors. Message text is masked before
/// it ever reaches this table.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "error_logs")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    pub user_id: i64,
    pub token_id: i64,
    pub channel_id: i64,
    pub channel_name: String,
    pub channel_type: i32,
    pub model_name: String,
    #[sea_orm(column_name = "group")]
    pub user_group: String,
    pub error_kind: String,
    pub status_code: i32,
    pub is_multi_key: bool,
    pub multi_key_index: Option<i32>,
    /// Channels tried by the request, in order.
    pub use_channel: Json,
    pub message: String,
    pub created_at: OffsetDateTime,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
