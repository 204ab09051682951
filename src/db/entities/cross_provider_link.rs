use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "cross_provider_links")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub content_hash: String,
    pub provider_count: i32,
    pub merged_is_read: bool,
    pub merged_is_starred: bool,
    pub merged_folder: String,
    #[sea_orm(column_type = "JsonBinary")]
    pub merged_labels: serde_json::Value,
    pub conflict_strategy: String,
    #[sea_orm(column_type = "JsonBinary", nullable)]
    pub last_conflict: Option<serde_json::Value>,
    pub last_resolved_at: Option<chrono::DateTime<chrono::Utc>>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(has_many = "super::email::Entity")]
    Emails,
}

impl Related<super::email::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::Emails.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
