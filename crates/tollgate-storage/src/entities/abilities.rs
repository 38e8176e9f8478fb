use sea_orm::entity::prelude::*;

/// One `(group, model) -> channel` eligibility row; the selector index is
/// built from these.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel)]
#[sea_orm(table_name = "abilities")]
pub struct Model {
    #[sea_orm(primary_key)]
    pub id: i64,
    #[sea_orm(column_name = "group")]
    pub user_group: String,
    pub model: String,
    pub channel_id: i64,
    pub priority: i64,
    pub weight: i64,
    pub enabled: bool,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
