use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, Set,
};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

use super::folders::{self, FolderCount, FolderSyncStats};
use super::scheduler::next_activity_rate;
use crate::crossprovider::{self, EmailIdentity, ProviderPriority};
use crate::db::entities::{email, provider_config};
use crate::providers::{MessageChange, ProviderType, RemoteFolder, RemoteMessage, SyncResult};

/// What one applied batch changed in the mirror.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct AppliedSync {
    pub new: u32,
    pub updated: u32,
    pub deleted: u32,
    pub links_resolved: u32,
    pub conflicts: u32,
    pub folders: Option<FolderSyncStats>,
    pub folder_counts: Vec<FolderCount>,
    /// Count changes on other providers' folders caused by fan-out.
    pub peer_folder_counts: BTreeMap<Uuid, Vec<FolderCount>>,
}

/// Copies `metadata` and sets `key`, leaving every other key in place.
pub fn merge_metadata(
    metadata: &serde_json::Value,
    key: &str,
    value: Option<&str>,
) -> serde_json::Value {
    let mut merged = metadata.as_object().cloned().unwrap_or_default();
    match value {
        Some(value) => {
            merged.insert(key.to_string(), serde_json::Value::String(value.to_string()));
        }
        None => {
            merged.remove(key);
        }
    }
    serde_json::Value::Object(merged)
}

/// Drops the provider's stored cursor so the next sync starts over.
pub async fn clear_cursor<C: ConnectionTrait>(
    conn: &C,
    provider: &provider_config::Model,
    provider_type: ProviderType,
) -> Result<()> {
    let mut active: provider_config::ActiveModel = provider.clone().into();
    active.metadata = Set(merge_metadata(&provider.metadata, provider_type.cursor_key(), None));
    active.updated_at = Set(Utc::now());
    active.update(conn).await.context("clear sync cursor")?;
    Ok(())
}

fn labels_json(labels: &[String]) -> serde_json::Value {
    let sorted: BTreeSet<&String> = labels.iter().collect();
    serde_json::json!(sorted)
}

fn same_remote_state(row: &email::Model, message: &RemoteMessage) -> bool {
    row.remote_is_read == message.is_read
        && row.remote_is_starred == message.is_starred
        && row.remote_folder == message.folder
        && row.remote_labels == labels_json(&message.labels)
}

/// Inserts or refreshes one message. Returns the row and whether it is new.
async fn upsert_email<C: ConnectionTrait>(
    conn: &C,
    provider: &provider_config::Model,
    message: &RemoteMessage,
    now: DateTime<Utc>,
) -> Result<(email::Model, bool)> {
    let existing = email::Entity::find()
        .filter(email::Column::ProviderId.eq(provider.id))
        .filter(email::Column::RemoteId.eq(message.remote_id.as_str()))
        .one(conn)
        .await
        .context("find email")?;

    match existing {
        Some(row) => {
            let state_changed = !same_remote_state(&row, message);
            let unlinked = row.link_id.is_none();
            let mut active: email::ActiveModel = row.into();
            active.thread_id = Set(message.thread_id.clone());
            active.message_id = Set(message.message_id.clone());
            active.subject = Set(message.subject.clone());
            active.from_address = Set(message.from.clone());
            active.to_addresses = Set(serde_json::json!(message.to));
            active.snippet = Set(message.snippet.clone());
            active.sent_at = Set(message.sent_at);
            active.received_at = Set(message.received_at);
            active.folder_path = Set(message.folder_path.clone());
            if state_changed {
                active.remote_is_read = Set(message.is_read);
                active.remote_is_starred = Set(message.is_starred);
                active.remote_folder = Set(message.folder.clone());
                active.remote_labels = Set(labels_json(&message.labels));
                active.remote_changed_at = Set(now);
            }
            if unlinked {
                active.is_read = Set(message.is_read);
                active.is_starred = Set(message.is_starred);
                active.folder = Set(message.folder.clone());
                active.labels = Set(labels_json(&message.labels));
            }
            active.updated_at = Set(now);
            let row = active.update(conn).await.context("update email")?;
            Ok((row, false))
        }
        None => {
            let row = email::ActiveModel {
                id: Set(Uuid::new_v4()),
                tenant_id: Set(provider.tenant_id),
                provider_id: Set(provider.id),
                remote_id: Set(message.remote_id.clone()),
                thread_id: Set(message.thread_id.clone()),
                message_id: Set(message.message_id.clone()),
                subject: Set(message.subject.clone()),
                from_address: Set(message.from.clone()),
                to_addresses: Set(serde_json::json!(message.to)),
                snippet: Set(message.snippet.clone()),
                sent_at: Set(message.sent_at),
                received_at: Set(message.received_at),
                folder_path: Set(message.folder_path.clone()),
                content_hash: Set(String::new()),
                link_id: Set(None),
                remote_is_read: Set(message.is_read),
                remote_is_starred: Set(message.is_starred),
                remote_folder: Set(message.folder.clone()),
                remote_labels: Set(labels_json(&message.labels)),
                remote_changed_at: Set(now),
                is_read: Set(message.is_read),
                is_starred: Set(message.is_starred),
                folder: Set(message.folder.clone()),
                labels: Set(labels_json(&message.labels)),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(conn)
            .await
            .context("insert email")?;
            Ok((row, true))
        }
    }
}

async fn delete_email<C: ConnectionTrait>(
    conn: &C,
    row: &email::Model,
    detached: &mut BTreeSet<Uuid>,
) -> Result<()> {
    if let Some(link_id) = row.link_id {
        detached.insert(link_id);
    }
    email::Entity::delete_by_id(row.id)
        .exec(conn)
        .await
        .context("delete email")?;
    Ok(())
}

/// Applies one drained batch to the mirror: message changes, dedup and
/// conflict resolution of every touched link (once each), folder tree and
/// counts, then the provider's cursor and health signals. Run inside one
/// transaction so the cursor only advances together with the changes.
pub async fn apply_sync_result<C: ConnectionTrait>(
    conn: &C,
    provider: &provider_config::Model,
    provider_type: ProviderType,
    result: &SyncResult,
    remote_folders: Option<&[RemoteFolder]>,
    priority: &ProviderPriority,
    activity_alpha: f64,
) -> Result<AppliedSync> {
    let now = Utc::now();
    let mut applied = AppliedSync::default();
    let mut touched: BTreeSet<Uuid> = BTreeSet::new();
    let mut detached: BTreeSet<Uuid> = BTreeSet::new();

    // Before the upserts, so re-fetched copies can take over the links.
    if let Some(prefix) = result.live_prefix.as_deref() {
        let stale = email::Entity::find()
            .filter(email::Column::ProviderId.eq(provider.id))
            .filter(email::Column::RemoteId.not_like(format!("{}%", prefix)))
            .all(conn)
            .await
            .context("find stale emails")?;
        if !stale.is_empty() {
            tracing::info!(
                provider_id = %provider.id,
                removed = stale.len(),
                "Dropping emails from a superseded id generation"
            );
        }
        for row in stale {
            delete_email(conn, &row, &mut detached).await?;
            applied.deleted += 1;
        }
    }

    for change in &result.changes {
        match change {
            MessageChange::Upsert(message) => {
                let (row, is_new) = upsert_email(conn, provider, message, now).await?;
                if is_new {
                    applied.new += 1;
                } else {
                    applied.updated += 1;
                }
                let outcome =
                    crossprovider::dedup_email(conn, &EmailIdentity::from_model(&row)).await?;
                if row.link_id.is_some() || outcome.is_new_email {
                    touched.insert(outcome.link_id);
                }
            }
            MessageChange::Deleted { remote_id } => {
                let Some(row) = email::Entity::find()
                    .filter(email::Column::ProviderId.eq(provider.id))
                    .filter(email::Column::RemoteId.eq(remote_id.as_str()))
                    .one(conn)
                    .await
                    .context("find deleted email")?
                else {
                    continue;
                };
                delete_email(conn, &row, &mut detached).await?;
                applied.deleted += 1;
            }
        }
    }

    for link_id in detached {
        if crossprovider::detach_provider(conn, link_id).await? {
            touched.insert(link_id);
        } else {
            touched.remove(&link_id);
        }
    }
    let mut peers: BTreeSet<Uuid> = BTreeSet::new();
    for link_id in touched {
        if let Some(reconciled) = crossprovider::reconcile_link(conn, link_id, priority).await? {
            applied.links_resolved += 1;
            if reconciled.resolution.has_conflict() {
                applied.conflicts += 1;
            }
            peers.extend(reconciled.providers);
        }
    }

    if let Some(remote_folders) = remote_folders {
        applied.folders = Some(folders::sync_folders(conn, provider.id, remote_folders).await?);
    }
    applied.folder_counts = folders::refresh_folder_counts(conn, provider.id).await?;
    peers.remove(&provider.id);
    for peer_id in peers {
        let counts = folders::refresh_folder_counts(conn, peer_id).await?;
        if !counts.is_empty() {
            applied.peer_folder_counts.insert(peer_id, counts);
        }
    }

    let mut active: provider_config::ActiveModel = provider.clone().into();
    if let Some(cursor) = result.next_cursor.as_deref() {
        active.metadata = Set(merge_metadata(
            &provider.metadata,
            provider_type.cursor_key(),
            Some(cursor),
        ));
    }
    active.last_synced_at = Set(Some(now));
    active.error_streak = Set(0);
    active.last_error = Set(None);
    active.activity_rate = Set(next_activity_rate(
        provider.activity_rate,
        applied.new,
        activity_alpha,
    ));
    active.updated_at = Set(now);
    active.update(conn).await.context("update provider after sync")?;

    Ok(applied)
}

/// Folder-only variant: tree and counts, cursor untouched.
pub async fn apply_folder_sync<C: ConnectionTrait>(
    conn: &C,
    provider: &provider_config::Model,
    remote_folders: &[RemoteFolder],
) -> Result<AppliedSync> {
    let stats = folders::sync_folders(conn, provider.id, remote_folders).await?;
    let folder_counts = folders::refresh_folder_counts(conn, provider.id).await?;
    Ok(AppliedSync {
        folders: Some(stats),
        folder_counts,
        ..Default::default()
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::entities::cross_provider_link;
    use crate::db::fixtures::insert_provider;
    use crate::db::test_db;
    use pretty_assertions::assert_eq;

    fn message(remote_id: &str, message_id: &str, is_read: bool) -> RemoteMessage {
        RemoteMessage {
            remote_id: remote_id.to_string(),
            thread_id: None,
            message_id: Some(message_id.to_string()),
            subject: "Quarterly report".into(),
            from: "boss@example.com".into(),
            to: vec!["me@example.com".into()],
            snippet: "numbers".into(),
            sent_at: Utc::now(),
            received_at: Utc::now(),
            is_read,
            is_starred: false,
            folder: "INBOX".into(),
            folder_path: "INBOX".into(),
            labels: vec![],
        }
    }

    fn batch(changes: Vec<MessageChange>, cursor: &str) -> SyncResult {
        SyncResult::from_changes(changes, 0, Some(cursor.to_string()), vec![])
    }

    #[test]
    fn test_metadata_merge_keeps_other_keys() {
        let metadata = serde_json::json!({"imapHost": "mail.example.com", "lastUid": "1:5"});
        let merged = merge_metadata(&metadata, "lastUid", Some("1:9"));
        assert_eq!(
            merged,
            serde_json::json!({"imapHost": "mail.example.com", "lastUid": "1:9"})
        );
        let cleared = merge_metadata(&merged, "lastUid", None);
        assert_eq!(cleared, serde_json::json!({"imapHost": "mail.example.com"}));
        assert_eq!(
            merge_metadata(&serde_json::Value::Null, "historyId", Some("7")),
            serde_json::json!({"historyId": "7"})
        );
    }

    #[tokio::test]
    async fn test_batch_links_and_stores_cursor() {
        let db = test_db().await;
        let tenant = Uuid::new_v4();
        let gmail = insert_provider(
            &db,
            tenant,
            ProviderType::Gmail,
            serde_json::json!({"historyId": "100", "label": "keep"}),
        )
        .await;
        let outlook =
            insert_provider(&db, tenant, ProviderType::Outlook, serde_json::json!({})).await;
        let priority = ProviderPriority::default();

        let applied = apply_sync_result(
            &db,
            &gmail,
            ProviderType::Gmail,
            &batch(vec![MessageChange::Upsert(message("g1", "<q@x>", false))], "150"),
            None,
            &priority,
            0.3,
        )
        .await
        .unwrap();
        assert_eq!(applied.new, 1);

        // The same message read in Outlook propagates to the Gmail mirror.
        let applied = apply_sync_result(
            &db,
            &outlook,
            ProviderType::Outlook,
            &batch(
                vec![MessageChange::Upsert(message("o1", "<Q@X>", true))],
                "https://graph/delta?token=1",
            ),
            None,
            &priority,
            0.3,
        )
        .await
        .unwrap();
        assert_eq!(applied.links_resolved, 1);
        assert_eq!(applied.conflicts, 1);

        let rows = email::Entity::find().all(&db).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(rows.iter().all(|r| r.is_read));
        assert_eq!(rows[0].link_id, rows[1].link_id);

        let stored = provider_config::Entity::find_by_id(gmail.id)
            .one(&db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            stored.metadata,
            serde_json::json!({"historyId": "150", "label": "keep"})
        );
        assert!(stored.last_synced_at.is_some());
        assert!(stored.activity_rate > 0.0);
    }

    #[tokio::test]
    async fn test_deleting_last_member_removes_link() {
        let db = test_db().await;
        let provider =
            insert_provider(&db, Uuid::new_v4(), ProviderType::Gmail, serde_json::json!({})).await;
        let priority = ProviderPriority::default();
        apply_sync_result(
            &db,
            &provider,
            ProviderType::Gmail,
            &batch(vec![MessageChange::Upsert(message("g1", "<z@x>", false))], "2"),
            None,
            &priority,
            0.3,
        )
        .await
        .unwrap();

        let applied = apply_sync_result(
            &db,
            &provider,
            ProviderType::Gmail,
            &batch(
                vec![MessageChange::Deleted {
                    remote_id: "g1".into(),
                }],
                "3",
            ),
            None,
            &priority,
            0.3,
        )
        .await
        .unwrap();
        assert_eq!(applied.deleted, 1);
        assert!(email::Entity::find().all(&db).await.unwrap().is_empty());
        assert!(cross_provider_link::Entity::find().all(&db).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_reapplying_same_state_records_no_conflict() {
        let db = test_db().await;
        let provider =
            insert_provider(&db, Uuid::new_v4(), ProviderType::Imap, serde_json::json!({})).await;
        let priority = ProviderPriority::default();
        let changes = vec![MessageChange::Upsert(message("1:4", "<r@x>", true))];
        for cursor in ["1:4", "1:4"] {
            apply_sync_result(
                &db,
                &provider,
                ProviderType::Imap,
                &batch(changes.clone(), cursor),
                None,
                &priority,
                0.3,
            )
            .await
            .unwrap();
        }
        let link = cross_provider_link::Entity::find().one(&db).await.unwrap().unwrap();
        assert_eq!(link.provider_count, 1);
        assert!(link.merged_is_read);
        assert!(link.last_conflict.is_none());
    }

    #[tokio::test]
    async fn test_fan_out_recounts_peer_folders() {
        use crate::db::entities::folder;

        let db = test_db().await;
        let tenant = Uuid::new_v4();
        let gmail = insert_provider(&db, tenant, ProviderType::Gmail, serde_json::json!({})).await;
        let outlook =
            insert_provider(&db, tenant, ProviderType::Outlook, serde_json::json!({})).await;
        let priority = ProviderPriority::default();
        let inbox = vec![RemoteFolder {
            path: "INBOX".into(),
            name: "Inbox".into(),
            delimiter: None,
            special_use: None,
            is_selectable: true,
        }];

        apply_sync_result(
            &db,
            &gmail,
            ProviderType::Gmail,
            &batch(vec![MessageChange::Upsert(message("g1", "<f@x>", false))], "10"),
            Some(&inbox),
            &priority,
            0.3,
        )
        .await
        .unwrap();

        let applied = apply_sync_result(
            &db,
            &outlook,
            ProviderType::Outlook,
            &batch(
                vec![MessageChange::Upsert(message("o1", "<f@x>", true))],
                "https://graph/delta?token=2",
            ),
            None,
            &priority,
            0.3,
        )
        .await
        .unwrap();

        let gmail_inbox = folder::Entity::find()
            .filter(folder::Column::ProviderId.eq(gmail.id))
            .one(&db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(gmail_inbox.total_count, 1);
        assert_eq!(gmail_inbox.unread_count, 0);

        let peer_counts = &applied.peer_folder_counts[&gmail.id];
        assert_eq!(peer_counts.len(), 1);
        assert_eq!(peer_counts[0].unread_count, 0);
        assert!(!applied.peer_folder_counts.contains_key(&outlook.id));
    }

    #[tokio::test]
    async fn test_full_sync_drops_superseded_uid_generation() {
        let db = test_db().await;
        let provider =
            insert_provider(&db, Uuid::new_v4(), ProviderType::Imap, serde_json::json!({})).await;
        let priority = ProviderPriority::default();
        apply_sync_result(
            &db,
            &provider,
            ProviderType::Imap,
            &batch(
                vec![
                    MessageChange::Upsert(message("100:1", "<a@x>", false)),
                    MessageChange::Upsert(message("100:2", "<b@x>", true)),
                ],
                "100:2",
            ),
            None,
            &priority,
            0.3,
        )
        .await
        .unwrap();

        // The mailbox was recreated: same messages, new UIDVALIDITY.
        let mut resync = batch(
            vec![
                MessageChange::Upsert(message("200:1", "<a@x>", false)),
                MessageChange::Upsert(message("200:2", "<b@x>", true)),
            ],
            "200:2",
        );
        resync.live_prefix = Some("200:".into());
        let applied = apply_sync_result(
            &db,
            &provider,
            ProviderType::Imap,
            &resync,
            None,
            &priority,
            0.3,
        )
        .await
        .unwrap();
        assert_eq!(applied.new, 2);
        assert_eq!(applied.deleted, 2);

        let mut remote_ids: Vec<String> = email::Entity::find()
            .all(&db)
            .await
            .unwrap()
            .into_iter()
            .map(|row| row.remote_id)
            .collect();
        remote_ids.sort();
        assert_eq!(remote_ids, vec!["200:1", "200:2"]);
        let links = cross_provider_link::Entity::find().all(&db).await.unwrap();
        assert_eq!(links.len(), 2);
        assert!(links.iter().all(|link| link.provider_count == 1));
    }
}
