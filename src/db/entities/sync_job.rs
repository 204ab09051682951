use sea_orm::entity::prelude::*;
use serde::{Deserialize, Serialize};

/// Durable queue row. `dedup_key` carries the idempotency key while the job is
/// waiting, active or delayed and is cleared once it reaches a terminal state,
/// so the unique index admits one live job per key.
#[derive(Clone, Debug, PartialEq, DeriveEntityModel, Serialize, Deserialize)]
#[sea_orm(table_name = "sync_jobs")]
pub struct Model {
    #[sea_orm(primary_key, auto_increment = false)]
    pub id: Uuid,
    pub lane: String,
    pub kind: String,
    pub idempotency_key: String,
    #[sea_orm(unique, nullable)]
    pub dedup_key: Option<String>,
    pub tenant_id: Uuid,
    pub provider_id: Uuid,
    pub provider_type: String,
    #[sea_orm(column_type = "JsonBinary")]
    pub payload: serde_json::Value,
    pub status: String,
    pub attempts_made: i32,
    pub max_attempts: i32,
    pub run_at: chrono::DateTime<chrono::Utc>,
    pub locked_until: Option<chrono::DateTime<chrono::Utc>>,
    pub lock_token: Option<Uuid>,
    #[sea_orm(column_type = "Text", nullable)]
    pub last_error: Option<String>,
    pub created_at: chrono::DateTime<chrono::Utc>,
    pub started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub finished_at: Option<chrono::DateTime<chrono::Utc>>,
    pub duration_ms: Option<i64>,
}

#[derive(Copy, Clone, Debug, EnumIter, DeriveRelation)]
pub enum Relation {}

impl ActiveModelBehavior for ActiveModel {}
