use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Mirrored message. `remote_*` columns hold the state last reported by the
/// owning provider; `is_read`, `is_starred`, `folder` and `labels` hold the
/// state merged across every provider sharing the link.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "emails")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub tenant_id: Uuid,
    pub provider_id: Uuid,
    pub remote_id: String,
    pub thread_id: Option<String>,
    pub message_id: Option<String>,
    #[sea_orm(column_type = "Text")]
    pub subject: String,
    pub from_address: String,
    #[sea_orm(column_type = "JsonBinary")]
    pub to_addresses: serde_json::Value,
    #[sea_orm(column_type = "Text")]
    pub snippet: String,
    pub sent_at: chrono::DateTime<chrono::Utc>,
    pub received_at: chrono::DateTime<chrono::Utc>,
    pub folder_path: String,
    pub content_hash: String,
    pub link_id: Option<Uuid>,
    pub remote_is_read: bool,
    pub remote_is_starred: bool,
    pub remote_folder: String,
    #[sea_orm(column_type = "JsonBinary")]
    pub remote_labels: serde_json::Value,
    pub remote_changed_at: chrono::DateTime<chrono::Utc>,
    pub is_read: bool,
    pub is_starred: bool,
    pub folder: String,
    #[sea_orm(column_type = "JsonBinary")]
    pub labels: serde_json::Value,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub updated_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {
    #[sea_orm(
        belongs_to = "super::provider_config::Entity",
        from = "Column::ProviderId",
        to = "super::provider_config::Column::Id"
    )]
    ProviderConfig,
    #[sea_orm(
        belongs_to = "super::cross_provider_link::Entity",
        from = "Column::LinkId",
        to = "super::cross_provider_link::Column::Id"
    )]
    CrossProviderLink,
}

impl Related<super::provider_config::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::ProviderConfig.def()
    }
}

impl Related<super::cross_provider_link::Entity> for Entity {
    fn to() -> RelationDef {
        Relation::CrossProviderLink.def()
    }
}

impl ActiveModelBehavior for ActiveModel {}
