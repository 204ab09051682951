use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sea_orm::prelude::Expr;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QuerySelect, Set,
};
use std::collections::HashSet;
use uuid::Uuid;

use super::conflict::ConflictStrategy;
use super::fingerprint;
use crate::db::entities::{cross_provider_link, email};
use crate::providers::INBOX;

/// What the dedup engine needs to know about a stored email row.
#[derive(Debug, Clone)]
pub struct EmailIdentity {
    pub tenant_id: Uuid,
    pub provider_id: Uuid,
    pub email_id: Uuid,
    pub message_id: Option<String>,
    pub subject: String,
    pub sent_at: DateTime<Utc>,
}

impl EmailIdentity {
    pub fn from_model(model: &email::Model) -> Self {
        Self {
            tenant_id: model.tenant_id,
            provider_id: model.provider_id,
            email_id: model.id,
            message_id: model.message_id.clone(),
            subject: model.subject.clone(),
            sent_at: model.sent_at,
        }
    }

    pub fn content_hash(&self) -> String {
        fingerprint::content_hash(self.message_id.as_deref(), &self.subject, self.sent_at)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct DedupOutcome {
    /// First sighting of this logical message from this provider.
    pub is_new_email: bool,
    pub link_id: Uuid,
    /// Other email rows already in the link.
    pub matched_email_ids: Vec<Uuid>,
}

async fn find_link<C: ConnectionTrait>(
    conn: &C,
    tenant_id: Uuid,
    hash: &str,
) -> Result<Option<cross_provider_link::Model>> {
    cross_provider_link::Entity::find()
        .filter(cross_provider_link::Column::TenantId.eq(tenant_id))
        .filter(cross_provider_link::Column::ContentHash.eq(hash))
        .one(conn)
        .await
        .context("find cross-provider link")
}

async fn find_or_create_link<C: ConnectionTrait>(
    conn: &C,
    tenant_id: Uuid,
    hash: &str,
) -> Result<cross_provider_link::Model> {
    if let Some(link) = find_link(conn, tenant_id, hash).await? {
        return Ok(link);
    }

    let now = Utc::now();
    let link = cross_provider_link::ActiveModel {
        id: Set(Uuid::new_v4()),
        tenant_id: Set(tenant_id),
        content_hash: Set(hash.to_string()),
        provider_count: Set(0),
        merged_is_read: Set(false),
        merged_is_starred: Set(false),
        merged_folder: Set(INBOX.to_string()),
        merged_labels: Set(serde_json::json!([])),
        conflict_strategy: Set(ConflictStrategy::default().as_str().to_string()),
        last_conflict: Set(None),
        last_resolved_at: Set(None),
        created_at: Set(now),
        updated_at: Set(now),
    };
    // A concurrent worker may create the same link first.
    cross_provider_link::Entity::insert(link)
        .on_conflict(
            OnConflict::columns([
                cross_provider_link::Column::TenantId,
                cross_provider_link::Column::ContentHash,
            ])
            .do_nothing()
            .to_owned(),
        )
        .exec_without_returning(conn)
        .await
        .or_else(|err| match err {
            sea_orm::DbErr::RecordNotInserted => Ok(0),
            other => Err(other),
        })
        .context("create cross-provider link")?;

    find_link(conn, tenant_id, hash)
        .await?
        .context("cross-provider link vanished after insert")
}

/// Links an email to the logical message it represents within its tenant.
pub async fn dedup_email<C: ConnectionTrait>(
    conn: &C,
    identity: &EmailIdentity,
) -> Result<DedupOutcome> {
    let hash = identity.content_hash();
    let link = find_or_create_link(conn, identity.tenant_id, &hash).await?;

    let members: Vec<(Uuid, Uuid)> = email::Entity::find()
        .select_only()
        .column(email::Column::Id)
        .column(email::Column::ProviderId)
        .filter(email::Column::LinkId.eq(link.id))
        .into_tuple()
        .all(conn)
        .await
        .context("load link members")?;

    let matched_email_ids: Vec<Uuid> = members
        .iter()
        .filter(|(id, _)| *id != identity.email_id)
        .map(|(id, _)| *id)
        .collect();
    let provider_present = members
        .iter()
        .any(|(_, provider_id)| *provider_id == identity.provider_id);

    // Keep the row's hash current even when it joins nothing.
    email::Entity::update_many()
        .col_expr(email::Column::ContentHash, Expr::value(hash.clone()))
        .filter(email::Column::Id.eq(identity.email_id))
        .exec(conn)
        .await
        .context("store content hash")?;

    if provider_present {
        tracing::debug!(
            link_id = %link.id,
            provider_id = %identity.provider_id,
            "Provider already represented in link"
        );
        return Ok(DedupOutcome {
            is_new_email: false,
            link_id: link.id,
            matched_email_ids,
        });
    }

    email::Entity::update_many()
        .col_expr(email::Column::LinkId, Expr::value(link.id))
        .filter(email::Column::Id.eq(identity.email_id))
        .exec(conn)
        .await
        .context("attach email to link")?;
    cross_provider_link::Entity::update_many()
        .col_expr(
            cross_provider_link::Column::ProviderCount,
            Expr::col(cross_provider_link::Column::ProviderCount).add(1),
        )
        .col_expr(cross_provider_link::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(cross_provider_link::Column::Id.eq(link.id))
        .exec(conn)
        .await
        .context("increment provider count")?;

    if !matched_email_ids.is_empty() {
        tracing::debug!(
            link_id = %link.id,
            matched = matched_email_ids.len(),
            "Email matched across providers"
        );
    }
    Ok(DedupOutcome {
        is_new_email: true,
        link_id: link.id,
        matched_email_ids,
    })
}

/// Recounts the providers of a link after member rows were deleted. Deletes
/// the link once no email references it; returns whether it still exists.
pub async fn detach_provider<C: ConnectionTrait>(conn: &C, link_id: Uuid) -> Result<bool> {
    let providers: Vec<Uuid> = email::Entity::find()
        .select_only()
        .column(email::Column::ProviderId)
        .filter(email::Column::LinkId.eq(link_id))
        .into_tuple()
        .all(conn)
        .await
        .context("load link providers")?;
    let count = providers.into_iter().collect::<HashSet<_>>().len();

    if count == 0 {
        cross_provider_link::Entity::delete_by_id(link_id)
            .exec(conn)
            .await
            .context("delete empty link")?;
        tracing::debug!(%link_id, "Removed cross-provider link with no members");
        return Ok(false);
    }

    let Some(link) = cross_provider_link::Entity::find_by_id(link_id)
        .one(conn)
        .await
        .context("load link")?
    else {
        return Ok(false);
    };
    let mut active: cross_provider_link::ActiveModel = link.into();
    active.provider_count = Set(count as i32);
    active.updated_at = Set(Utc::now());
    active.update(conn).await.context("update provider count")?;
    Ok(true)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fixtures::{insert_email, insert_provider};
    use crate::db::test_db;
    use crate::providers::ProviderType;
    use sea_orm::PaginatorTrait;

    #[tokio::test]
    async fn test_same_identity_twice_links_once() {
        let db = test_db().await;
        let tenant = Uuid::new_v4();
        let gmail = insert_provider(&db, tenant, ProviderType::Gmail, serde_json::json!({})).await;
        let row = insert_email(&db, &gmail, "g1", Some("<a@x>")).await;
        let identity = EmailIdentity::from_model(&row);

        let first = dedup_email(&db, &identity).await.unwrap();
        let second = dedup_email(&db, &identity).await.unwrap();

        assert!(first.is_new_email);
        assert!(!second.is_new_email);
        assert_eq!(first.link_id, second.link_id);
        assert_eq!(cross_provider_link::Entity::find().count(&db).await.unwrap(), 1);
        let link = cross_provider_link::Entity::find_by_id(first.link_id)
            .one(&db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(link.provider_count, 1);
        assert_eq!(link.merged_folder, "INBOX");
        assert_eq!(link.conflict_strategy, "LAST_WRITE_WINS");
    }

    #[tokio::test]
    async fn test_second_provider_joins_existing_link() {
        let db = test_db().await;
        let tenant = Uuid::new_v4();
        let gmail = insert_provider(&db, tenant, ProviderType::Gmail, serde_json::json!({})).await;
        let outlook =
            insert_provider(&db, tenant, ProviderType::Outlook, serde_json::json!({})).await;
        let a = insert_email(&db, &gmail, "g1", Some("<Shared@Example.com>")).await;
        let b = insert_email(&db, &outlook, "o1", Some("shared@example.com")).await;

        let first = dedup_email(&db, &EmailIdentity::from_model(&a)).await.unwrap();
        let second = dedup_email(&db, &EmailIdentity::from_model(&b)).await.unwrap();

        assert!(second.is_new_email);
        assert_eq!(first.link_id, second.link_id);
        assert_eq!(second.matched_email_ids, vec![a.id]);
        let link = cross_provider_link::Entity::find_by_id(first.link_id)
            .one(&db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(link.provider_count, 2);
    }

    #[tokio::test]
    async fn test_tenants_never_share_links() {
        let db = test_db().await;
        let p1 = insert_provider(&db, Uuid::new_v4(), ProviderType::Gmail, serde_json::json!({}))
            .await;
        let p2 = insert_provider(&db, Uuid::new_v4(), ProviderType::Gmail, serde_json::json!({}))
            .await;
        let a = insert_email(&db, &p1, "1", Some("<same@x>")).await;
        let b = insert_email(&db, &p2, "1", Some("<same@x>")).await;

        let first = dedup_email(&db, &EmailIdentity::from_model(&a)).await.unwrap();
        let second = dedup_email(&db, &EmailIdentity::from_model(&b)).await.unwrap();

        assert_ne!(first.link_id, second.link_id);
        assert!(second.matched_email_ids.is_empty());
    }

    #[tokio::test]
    async fn test_detach_drops_link_without_members() {
        let db = test_db().await;
        let tenant = Uuid::new_v4();
        let gmail = insert_provider(&db, tenant, ProviderType::Gmail, serde_json::json!({})).await;
        let imap = insert_provider(&db, tenant, ProviderType::Imap, serde_json::json!({})).await;
        let a = insert_email(&db, &gmail, "g1", Some("<d@x>")).await;
        let b = insert_email(&db, &imap, "1:7", Some("<d@x>")).await;
        let link_id = dedup_email(&db, &EmailIdentity::from_model(&a)).await.unwrap().link_id;
        dedup_email(&db, &EmailIdentity::from_model(&b)).await.unwrap();

        email::Entity::delete_by_id(b.id).exec(&db).await.unwrap();
        assert!(detach_provider(&db, link_id).await.unwrap());
        let link = cross_provider_link::Entity::find_by_id(link_id)
            .one(&db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(link.provider_count, 1);

        email::Entity::delete_by_id(a.id).exec(&db).await.unwrap();
        assert!(!detach_provider(&db, link_id).await.unwrap());
        assert!(cross_provider_link::Entity::find_by_id(link_id)
            .one(&db)
            .await
            .unwrap()
            .is_none());
    }
}
