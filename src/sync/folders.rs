use anyhow::{Context, Result};
use chrono::Utc;
use sea_orm::prelude::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QuerySelect, Set,
};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

use crate::db::entities::{email, folder};
use crate::providers::{RemoteFolder, SpecialUse};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FolderSyncStats {
    pub created: u32,
    pub updated: u32,
    pub removed: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderCount {
    pub folder_id: Uuid,
    pub path: String,
    pub total_count: i32,
    pub unread_count: i32,
}

fn delimiter_of(remote: &RemoteFolder) -> Option<&str> {
    remote.delimiter.as_deref().filter(|d| !d.is_empty())
}

fn level_of(remote: &RemoteFolder) -> i32 {
    delimiter_of(remote).map_or(0, |d| remote.path.matches(d).count() as i32)
}

fn parent_path(remote: &RemoteFolder) -> Option<&str> {
    let delimiter = delimiter_of(remote)?;
    remote.path.rsplit_once(delimiter).map(|(parent, _)| parent)
}

/// Mirrors the provider's folder tree: upserts by path, links parents,
/// removes folders that disappeared remotely.
pub async fn sync_folders<C: ConnectionTrait>(
    conn: &C,
    provider_id: Uuid,
    remote: &[RemoteFolder],
) -> Result<FolderSyncStats> {
    let existing: HashMap<String, folder::Model> = folder::Entity::find()
        .filter(folder::Column::ProviderId.eq(provider_id))
        .all(conn)
        .await
        .context("load folders")?
        .into_iter()
        .map(|f| (f.path.clone(), f))
        .collect();

    // Parents before children.
    let mut ordered: Vec<&RemoteFolder> = remote.iter().collect();
    ordered.sort_by_key(|f| level_of(f));

    let now = Utc::now();
    let mut stats = FolderSyncStats::default();
    let mut ids: HashMap<&str, Uuid> = HashMap::new();
    for remote_folder in ordered {
        if ids.contains_key(remote_folder.path.as_str()) {
            continue;
        }
        let parent_id = parent_path(remote_folder).and_then(|p| ids.get(p).copied());
        let special_use = remote_folder
            .special_use
            .or_else(|| SpecialUse::from_name(&remote_folder.path))
            .map(|s| s.as_str().to_string());
        let level = level_of(remote_folder);

        let id = match existing.get(&remote_folder.path) {
            Some(current) => {
                let unchanged = current.name == remote_folder.name
                    && current.delimiter == remote_folder.delimiter
                    && current.parent_id == parent_id
                    && current.level == level
                    && current.special_use == special_use
                    && current.is_selectable == remote_folder.is_selectable;
                if !unchanged {
                    let mut active: folder::ActiveModel = current.clone().into();
                    active.name = Set(remote_folder.name.clone());
                    active.delimiter = Set(remote_folder.delimiter.clone());
                    active.parent_id = Set(parent_id);
                    active.level = Set(level);
                    active.special_use = Set(special_use);
                    active.is_selectable = Set(remote_folder.is_selectable);
                    active.updated_at = Set(now);
                    active.update(conn).await.context("update folder")?;
                    stats.updated += 1;
                }
                current.id
            }
            None => {
                let created = folder::ActiveModel {
                    id: Set(Uuid::new_v4()),
                    provider_id: Set(provider_id),
                    path: Set(remote_folder.path.clone()),
                    name: Set(remote_folder.name.clone()),
                    delimiter: Set(remote_folder.delimiter.clone()),
                    parent_id: Set(parent_id),
                    level: Set(level),
                    special_use: Set(special_use),
                    is_selectable: Set(remote_folder.is_selectable),
                    total_count: Set(0),
                    unread_count: Set(0),
                    created_at: Set(now),
                    updated_at: Set(now),
                }
                .insert(conn)
                .await
                .context("insert folder")?;
                stats.created += 1;
                created.id
            }
        };
        ids.insert(remote_folder.path.as_str(), id);
    }

    let remote_paths: HashSet<&str> = remote.iter().map(|f| f.path.as_str()).collect();
    let gone: Vec<Uuid> = existing
        .values()
        .filter(|f| !remote_paths.contains(f.path.as_str()))
        .map(|f| f.id)
        .collect();
    if !gone.is_empty() {
        let deleted = folder::Entity::delete_many()
            .filter(folder::Column::Id.is_in(gone))
            .exec(conn)
            .await
            .context("remove folders")?;
        stats.removed = deleted.rows_affected as u32;
    }

    tracing::debug!(
        %provider_id,
        created = stats.created,
        updated = stats.updated,
        removed = stats.removed,
        "Folders synced"
    );
    Ok(stats)
}

async fn counts_by_path<C: ConnectionTrait>(
    conn: &C,
    provider_id: Uuid,
    unread_only: bool,
) -> Result<HashMap<String, i64>> {
    let mut query = email::Entity::find()
        .select_only()
        .column(email::Column::FolderPath)
        .column_as(Expr::col(email::Column::Id).count(), "count")
        .filter(email::Column::ProviderId.eq(provider_id));
    if unread_only {
        query = query.filter(email::Column::IsRead.eq(false));
    }
    let rows: Vec<(String, i64)> = query
        .group_by(email::Column::FolderPath)
        .into_tuple()
        .all(conn)
        .await
        .context("count emails per folder")?;
    Ok(rows.into_iter().collect())
}

/// Recomputes total and unread counts from the mirrored emails. Returns the
/// folders whose counts changed.
pub async fn refresh_folder_counts<C: ConnectionTrait>(
    conn: &C,
    provider_id: Uuid,
) -> Result<Vec<FolderCount>> {
    let totals = counts_by_path(conn, provider_id, false).await?;
    let unread = counts_by_path(conn, provider_id, true).await?;
    let folders = folder::Entity::find()
        .filter(folder::Column::ProviderId.eq(provider_id))
        .all(conn)
        .await
        .context("load folders")?;

    let mut changed = Vec::new();
    for current in folders {
        let total_count = totals.get(&current.path).copied().unwrap_or(0) as i32;
        let unread_count = unread.get(&current.path).copied().unwrap_or(0) as i32;
        if current.total_count == total_count && current.unread_count == unread_count {
            continue;
        }
        let id = current.id;
        let path = current.path.clone();
        let mut active: folder::ActiveModel = current.into();
        active.total_count = Set(total_count);
        active.unread_count = Set(unread_count);
        active.updated_at = Set(Utc::now());
        active.update(conn).await.context("update folder counts")?;
        changed.push(FolderCount {
            folder_id: id,
            path,
            total_count,
            unread_count,
        });
    }
    Ok(changed)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::fixtures::{insert_email, insert_provider};
    use crate::db::test_db;
    use crate::providers::ProviderType;

    fn remote(path: &str, special_use: Option<SpecialUse>) -> RemoteFolder {
        RemoteFolder {
            path: path.to_string(),
            name: path.rsplit('/').next().unwrap_or(path).to_string(),
            delimiter: Some("/".into()),
            special_use,
            is_selectable: true,
        }
    }

    #[tokio::test]
    async fn test_folder_tree_upsert_and_removal() {
        let db = test_db().await;
        let provider =
            insert_provider(&db, Uuid::new_v4(), ProviderType::Imap, serde_json::json!({})).await;

        let tree = vec![
            remote("Projects/2024/Q1", None),
            remote("INBOX", None),
            remote("Projects", None),
            remote("Projects/2024", None),
            remote("Sent", Some(SpecialUse::Sent)),
        ];
        let stats = sync_folders(&db, provider.id, &tree).await.unwrap();
        assert_eq!(stats.created, 5);

        let rows = folder::Entity::find().all(&db).await.unwrap();
        let by_path: HashMap<_, _> = rows.iter().map(|f| (f.path.as_str(), f)).collect();
        let q1 = by_path["Projects/2024/Q1"];
        assert_eq!(q1.level, 2);
        assert_eq!(q1.parent_id, Some(by_path["Projects/2024"].id));
        assert_eq!(by_path["INBOX"].special_use.as_deref(), Some("INBOX"));
        assert_eq!(by_path["Sent"].special_use.as_deref(), Some("SENT"));

        // Second pass with one folder gone: nothing recreated.
        let stats = sync_folders(&db, provider.id, &tree[1..]).await.unwrap();
        assert_eq!(stats, FolderSyncStats { created: 0, updated: 0, removed: 1 });
        assert_eq!(folder::Entity::find().all(&db).await.unwrap().len(), 4);
    }

    #[tokio::test]
    async fn test_counts_follow_mirrored_emails() {
        let db = test_db().await;
        let provider =
            insert_provider(&db, Uuid::new_v4(), ProviderType::Imap, serde_json::json!({})).await;
        sync_folders(&db, provider.id, &[remote("INBOX", None), remote("Sent", None)])
            .await
            .unwrap();
        insert_email(&db, &provider, "1:1", None).await;
        let read = insert_email(&db, &provider, "1:2", None).await;
        let mut active: email::ActiveModel = read.into();
        active.is_read = Set(true);
        active.update(&db).await.unwrap();

        let changed = refresh_folder_counts(&db, provider.id).await.unwrap();
        assert_eq!(changed.len(), 1);
        assert_eq!(changed[0].path, "INBOX");
        assert_eq!(changed[0].total_count, 2);
        assert_eq!(changed[0].unread_count, 1);

        assert!(refresh_folder_counts(&db, provider.id).await.unwrap().is_empty());
    }
}
