use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use sea_orm::prelude::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, EntityTrait, QueryFilter, QuerySelect, Set,
};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeSet, HashSet};
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

use crate::config::ConflictConfig;
use crate::db::entities::{cross_provider_link, email, provider_config};
use crate::providers::{ProviderType, INBOX};

/// Per-provider state of one logical message, as last reported by that provider.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EmailState {
    pub email_id: Uuid,
    pub provider_id: Uuid,
    pub provider_type: ProviderType,
    pub is_read: bool,
    pub is_starred: bool,
    pub folder: String,
    pub labels: Vec<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ConflictStrategy {
    #[default]
    LastWriteWins,
    Union,
    Intersection,
    PriorityBased,
}

impl ConflictStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictStrategy::LastWriteWins => "LAST_WRITE_WINS",
            ConflictStrategy::Union => "UNION",
            ConflictStrategy::Intersection => "INTERSECTION",
            ConflictStrategy::PriorityBased => "PRIORITY_BASED",
        }
    }
}

impl fmt::Display for ConflictStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown conflict strategy: {0}")]
pub struct UnknownStrategy(String);

impl FromStr for ConflictStrategy {
    type Err = UnknownStrategy;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "LAST_WRITE_WINS" => Ok(ConflictStrategy::LastWriteWins),
            "UNION" => Ok(ConflictStrategy::Union),
            "INTERSECTION" => Ok(ConflictStrategy::Intersection),
            "PRIORITY_BASED" => Ok(ConflictStrategy::PriorityBased),
            _ => Err(UnknownStrategy(s.to_string())),
        }
    }
}

/// Provider ranking used by `PRIORITY_BASED`, highest first.
#[derive(Debug, Clone, PartialEq)]
pub struct ProviderPriority(Vec<ProviderType>);

impl ProviderPriority {
    pub fn new(order: Vec<ProviderType>) -> Self {
        Self(order)
    }

    /// Lower is better; unranked providers come last.
    pub fn rank(&self, provider_type: ProviderType) -> usize {
        self.0
            .iter()
            .position(|p| *p == provider_type)
            .unwrap_or(self.0.len())
    }
}

impl Default for ProviderPriority {
    fn default() -> Self {
        Self::from(&ConflictConfig::default())
    }
}

impl From<&ConflictConfig> for ProviderPriority {
    fn from(config: &ConflictConfig) -> Self {
        Self(config.provider_priority.clone())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedState {
    pub is_read: bool,
    pub is_starred: bool,
    pub folder: String,
    pub labels: Vec<String>,
}

impl From<&EmailState> for ResolvedState {
    fn from(state: &EmailState) -> Self {
        Self {
            is_read: state.is_read,
            is_starred: state.is_starred,
            folder: state.folder.clone(),
            labels: sorted_labels(&state.labels),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub strategy: ConflictStrategy,
    pub resolved: ResolvedState,
    /// Fields with more than one distinct value across states.
    pub conflicting_fields: Vec<&'static str>,
}

impl Resolution {
    pub fn has_conflict(&self) -> bool {
        !self.conflicting_fields.is_empty()
    }
}

fn sorted_labels(labels: &[String]) -> Vec<String> {
    labels
        .iter()
        .cloned()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

fn distinct<T: std::hash::Hash + Eq>(values: impl Iterator<Item = T>) -> usize {
    values.collect::<HashSet<_>>().len()
}

fn conflicting_fields(states: &[EmailState]) -> Vec<&'static str> {
    let mut fields = Vec::new();
    if distinct(states.iter().map(|s| s.is_read)) > 1 {
        fields.push("isRead");
    }
    if distinct(states.iter().map(|s| s.is_starred)) > 1 {
        fields.push("isStarred");
    }
    if distinct(states.iter().map(|s| s.folder.as_str())) > 1 {
        fields.push("folder");
    }
    if distinct(states.iter().map(|s| sorted_labels(&s.labels))) > 1 {
        fields.push("labels");
    }
    fields
}

fn latest(states: &[EmailState]) -> Option<&EmailState> {
    states.iter().max_by_key(|s| s.updated_at)
}

/// Merges divergent per-provider states into one. `None` for no states.
pub fn resolve(
    states: &[EmailState],
    strategy: ConflictStrategy,
    priority: &ProviderPriority,
) -> Option<Resolution> {
    let first = states.first()?;
    if states.len() == 1 {
        return Some(Resolution {
            strategy,
            resolved: ResolvedState::from(first),
            conflicting_fields: Vec::new(),
        });
    }

    let resolved = match strategy {
        ConflictStrategy::LastWriteWins => ResolvedState::from(latest(states)?),
        ConflictStrategy::Union => ResolvedState {
            is_read: states.iter().any(|s| s.is_read),
            is_starred: states.iter().any(|s| s.is_starred),
            folder: states
                .iter()
                .map(|s| s.folder.as_str())
                .find(|f| *f != INBOX)
                .unwrap_or(INBOX)
                .to_string(),
            labels: states
                .iter()
                .flat_map(|s| s.labels.iter().cloned())
                .collect::<BTreeSet<_>>()
                .into_iter()
                .collect(),
        },
        ConflictStrategy::Intersection => {
            let mut common: BTreeSet<String> = first.labels.iter().cloned().collect();
            for state in &states[1..] {
                let labels: BTreeSet<String> = state.labels.iter().cloned().collect();
                common = common.intersection(&labels).cloned().collect();
            }
            let folder = if states.iter().all(|s| s.folder == first.folder) {
                first.folder.clone()
            } else {
                INBOX.to_string()
            };
            ResolvedState {
                is_read: states.iter().all(|s| s.is_read),
                is_starred: states.iter().all(|s| s.is_starred),
                folder,
                labels: common.into_iter().collect(),
            }
        }
        ConflictStrategy::PriorityBased => {
            let winner = states
                .iter()
                .min_by(|a, b| {
                    priority
                        .rank(a.provider_type)
                        .cmp(&priority.rank(b.provider_type))
                        .then(b.updated_at.cmp(&a.updated_at))
                })
                .unwrap_or(first);
            ResolvedState::from(winner)
        }
    };

    Some(Resolution {
        strategy,
        resolved,
        conflicting_fields: conflicting_fields(states),
    })
}

fn labels_from_json(value: &serde_json::Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|v| v.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// Provider-reported states of every email in a link.
pub async fn link_states<C: ConnectionTrait>(conn: &C, link_id: Uuid) -> Result<Vec<EmailState>> {
    let rows = email::Entity::find()
        .filter(email::Column::LinkId.eq(link_id))
        .find_also_related(provider_config::Entity)
        .all(conn)
        .await
        .context("load link members")?;

    let mut states = Vec::with_capacity(rows.len());
    for (row, provider) in rows {
        let Some(provider) = provider else { continue };
        let Ok(provider_type) = provider.provider_type.parse::<ProviderType>() else {
            tracing::warn!(provider_id = %provider.id, "Skipping email of unknown provider type");
            continue;
        };
        states.push(EmailState {
            email_id: row.id,
            provider_id: row.provider_id,
            provider_type,
            is_read: row.remote_is_read,
            is_starred: row.remote_is_starred,
            folder: row.remote_folder,
            labels: labels_from_json(&row.remote_labels),
            updated_at: row.remote_changed_at,
        });
    }
    Ok(states)
}

/// Resolves a link and stores the merged state on it. Conflicts also leave an
/// audit snapshot in `last_conflict`.
pub async fn resolve_link<C: ConnectionTrait>(
    conn: &C,
    link_id: Uuid,
    priority: &ProviderPriority,
) -> Result<Option<Resolution>> {
    let Some(link) = cross_provider_link::Entity::find_by_id(link_id)
        .one(conn)
        .await
        .context("load link")?
    else {
        return Ok(None);
    };
    let strategy = link.conflict_strategy.parse().unwrap_or_else(|err| {
        tracing::warn!(%link_id, error = %err, "Falling back to last-write-wins");
        ConflictStrategy::default()
    });

    let states = link_states(conn, link_id).await?;
    let Some(resolution) = resolve(&states, strategy, priority) else {
        return Ok(None);
    };

    let now = Utc::now();
    let mut active: cross_provider_link::ActiveModel = link.into();
    active.merged_is_read = Set(resolution.resolved.is_read);
    active.merged_is_starred = Set(resolution.resolved.is_starred);
    active.merged_folder = Set(resolution.resolved.folder.clone());
    active.merged_labels = Set(serde_json::json!(resolution.resolved.labels));
    active.last_resolved_at = Set(Some(now));
    active.updated_at = Set(now);
    if resolution.has_conflict() {
        tracing::info!(
            %link_id,
            strategy = %strategy,
            fields = ?resolution.conflicting_fields,
            "Resolved cross-provider conflict"
        );
        active.last_conflict = Set(Some(serde_json::json!({
            "strategy": strategy,
            "conflictingFields": resolution.conflicting_fields,
            "states": states,
            "resolved": resolution.resolved,
            "resolvedAt": now,
        })));
    }
    active.update(conn).await.context("store merged state")?;
    Ok(Some(resolution))
}

/// Copies a link's merged state onto every email row in it. Returns the
/// providers whose rows were rewritten.
pub async fn apply_resolved_state<C: ConnectionTrait>(
    conn: &C,
    link_id: Uuid,
) -> Result<BTreeSet<Uuid>> {
    let Some(link) = cross_provider_link::Entity::find_by_id(link_id)
        .one(conn)
        .await
        .context("load link")?
    else {
        return Ok(BTreeSet::new());
    };
    let providers: Vec<Uuid> = email::Entity::find()
        .select_only()
        .column(email::Column::ProviderId)
        .distinct()
        .filter(email::Column::LinkId.eq(link_id))
        .into_tuple()
        .all(conn)
        .await
        .context("load link providers")?;
    email::Entity::update_many()
        .col_expr(email::Column::IsRead, Expr::value(link.merged_is_read))
        .col_expr(email::Column::IsStarred, Expr::value(link.merged_is_starred))
        .col_expr(email::Column::Folder, Expr::value(link.merged_folder))
        .col_expr(email::Column::Labels, Expr::value(link.merged_labels))
        .col_expr(email::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(email::Column::LinkId.eq(link_id))
        .exec(conn)
        .await
        .context("fan out merged state")?;
    Ok(providers.into_iter().collect())
}

/// A resolved link and the providers its fan-out wrote to.
#[derive(Debug, Clone, PartialEq)]
pub struct Reconciled {
    pub resolution: Resolution,
    pub providers: BTreeSet<Uuid>,
}

/// Resolve then fan out.
pub async fn reconcile_link<C: ConnectionTrait>(
    conn: &C,
    link_id: Uuid,
    priority: &ProviderPriority,
) -> Result<Option<Reconciled>> {
    let Some(resolution) = resolve_link(conn, link_id, priority).await? else {
        return Ok(None);
    };
    let providers = apply_resolved_state(conn, link_id).await?;
    Ok(Some(Reconciled {
        resolution,
        providers,
    }))
}

pub async fn set_link_strategy<C: ConnectionTrait>(
    conn: &C,
    link_id: Uuid,
    strategy: ConflictStrategy,
) -> Result<()> {
    let result = cross_provider_link::Entity::update_many()
        .col_expr(
            cross_provider_link::Column::ConflictStrategy,
            Expr::value(strategy.as_str()),
        )
        .col_expr(cross_provider_link::Column::UpdatedAt, Expr::value(Utc::now()))
        .filter(cross_provider_link::Column::Id.eq(link_id))
        .exec(conn)
        .await
        .context("set conflict strategy")?;
    if result.rows_affected == 0 {
        bail!("cross-provider link {} not found", link_id);
    }
    Ok(())
}
