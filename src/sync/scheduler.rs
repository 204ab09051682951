use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sea_orm::sea_query::NullOrdering;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, ConnectionTrait, DatabaseConnection, EntityTrait, Order,
    QueryFilter, QueryOrder, QuerySelect, Set,
};
use std::sync::Arc;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::config::SchedulerConfig;
use crate::db::entities::provider_config;
use crate::providers::{ProviderType, SyncType};
use crate::queue::{JobKind, Priority, QueueService, SubmitOutcome, SyncJobData};

const RECENT_SYNC_HOURS: i64 = 24;
const STALE_SYNC_DAYS: i64 = 7;

/// Lane for a provider's next periodic sync.
pub fn lane_for(
    last_synced_at: Option<DateTime<Utc>>,
    activity_rate: f64,
    busy_activity_rate: f64,
    now: DateTime<Utc>,
) -> Priority {
    let Some(last) = last_synced_at else {
        return Priority::Normal;
    };
    let age = now - last;
    if age < ChronoDuration::hours(RECENT_SYNC_HOURS) {
        if activity_rate >= busy_activity_rate {
            Priority::Normal
        } else {
            Priority::Low
        }
    } else if age > ChronoDuration::days(STALE_SYNC_DAYS) {
        Priority::High
    } else {
        Priority::Normal
    }
}

/// Exponential moving average of new messages per sync.
pub fn next_activity_rate(previous: f64, new_messages: u32, alpha: f64) -> f64 {
    let alpha = alpha.clamp(0.0, 1.0);
    alpha * f64::from(new_messages) + (1.0 - alpha) * previous
}

/// Job payload for a provider row. Incremental when a cursor is stored.
pub fn job_for(
    provider: &provider_config::Model,
    priority: Priority,
    kind: JobKind,
) -> Result<SyncJobData> {
    let provider_type: ProviderType = provider.provider_type.parse()?;
    let sync_type = if provider.metadata_str(provider_type.cursor_key()).is_some() {
        SyncType::Incremental
    } else {
        SyncType::Full
    };
    Ok(SyncJobData {
        tenant_id: provider.tenant_id,
        provider_id: provider.id,
        provider_type,
        email: provider.email.clone(),
        priority,
        sync_type,
        last_synced_at: provider.last_synced_at,
        auth_token: None,
        kind,
    })
}

/// Counts the failure against the provider and deactivates it once the streak
/// reaches `max_error_streak`. Returns whether it was deactivated.
pub async fn record_failure<C: ConnectionTrait>(
    conn: &C,
    provider_id: Uuid,
    error: &str,
    max_error_streak: i32,
) -> Result<bool> {
    let Some(provider) = provider_config::Entity::find_by_id(provider_id)
        .one(conn)
        .await
        .context("load provider")?
    else {
        return Ok(false);
    };
    let streak = provider.error_streak.saturating_add(1);
    let deactivate = provider.is_active && streak >= max_error_streak;

    let mut active: provider_config::ActiveModel = provider.into();
    active.error_streak = Set(streak);
    active.last_error = Set(Some(error.to_string()));
    if deactivate {
        active.is_active = Set(false);
    }
    active.updated_at = Set(Utc::now());
    active.update(conn).await.context("record provider failure")?;

    if deactivate {
        tracing::warn!(%provider_id, streak, "Provider deactivated after repeated failures");
    }
    Ok(deactivate)
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ScheduleStats {
    pub considered: usize,
    pub enqueued: usize,
    pub duplicates: usize,
}

pub struct SyncScheduler {
    db: DatabaseConnection,
    queue: QueueService,
    config: Arc<SchedulerConfig>,
}

impl SyncScheduler {
    pub fn new(db: DatabaseConnection, queue: QueueService, config: SchedulerConfig) -> Self {
        Self {
            db,
            queue,
            config: Arc::new(config),
        }
    }

    /// Enqueues the stalest active providers, never-synced ones first.
    pub async fn schedule_batch(&self) -> Result<ScheduleStats> {
        let providers = provider_config::Entity::find()
            .filter(provider_config::Column::IsActive.eq(true))
            .order_by_with_nulls(
                provider_config::Column::LastSyncedAt,
                Order::Asc,
                NullOrdering::First,
            )
            .limit(self.config.batch_size)
            .all(&self.db)
            .await
            .context("load providers due for sync")?;

        let now = Utc::now();
        let mut jobs = Vec::with_capacity(providers.len());
        for provider in &providers {
            let lane = lane_for(
                provider.last_synced_at,
                provider.activity_rate,
                self.config.busy_activity_rate,
                now,
            );
            match job_for(provider, lane, JobKind::EmailSync) {
                Ok(job) => jobs.push(job),
                Err(err) => {
                    tracing::warn!(provider_id = %provider.id, error = %err, "Skipping provider");
                }
            }
        }

        let mut stats = ScheduleStats {
            considered: providers.len(),
            ..Default::default()
        };
        if jobs.is_empty() {
            return Ok(stats);
        }
        for outcome in self.queue.add_bulk_sync_jobs(jobs).await? {
            match outcome {
                SubmitOutcome::Enqueued(_) => stats.enqueued += 1,
                SubmitOutcome::Duplicate => stats.duplicates += 1,
            }
        }
        tracing::info!(
            considered = stats.considered,
            enqueued = stats.enqueued,
            duplicates = stats.duplicates,
            "Scheduled sync batch"
        );
        Ok(stats)
    }

    async fn trigger(&self, provider_id: Uuid, kind: JobKind) -> Result<Option<SubmitOutcome>> {
        let Some(provider) = provider_config::Entity::find_by_id(provider_id)
            .one(&self.db)
            .await
            .context("load provider")?
        else {
            return Ok(None);
        };
        if !provider.is_active {
            tracing::info!(%provider_id, "Manual sync requested for inactive provider");
            return Ok(None);
        }
        let job = job_for(&provider, Priority::High, kind)?;
        Ok(Some(self.queue.add_sync_job(job).await?))
    }

    /// Immediate high-priority sync of one provider. `None` when the provider
    /// does not exist or is inactive.
    pub async fn trigger_manual(&self, provider_id: Uuid) -> Result<Option<SubmitOutcome>> {
        self.trigger(provider_id, JobKind::EmailSync).await
    }

    pub async fn trigger_folder_sync(&self, provider_id: Uuid) -> Result<Option<SubmitOutcome>> {
        self.trigger(provider_id, JobKind::FolderSync).await
    }

    pub async fn record_failure(&self, provider_id: Uuid, error: &str) -> Result<bool> {
        record_failure(&self.db, provider_id, error, self.config.max_error_streak).await
    }

    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        tracing::info!(interval_secs = self.config.interval.as_secs(), "Sync scheduler started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.schedule_batch().await {
                        tracing::error!(error = %err, "Scheduling pass failed");
                    }
                }
            }
        }
        tracing::info!("Sync scheduler stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::db::fixtures::insert_provider;
    use crate::db::test_db;

    #[test]
    fn test_lane_heuristic() {
        let now = Utc::now();
        let busy = 5.0;
        assert_eq!(lane_for(None, 0.0, busy, now), Priority::Normal);
        assert_eq!(
            lane_for(Some(now - ChronoDuration::hours(2)), 0.5, busy, now),
            Priority::Low
        );
        assert_eq!(
            lane_for(Some(now - ChronoDuration::hours(2)), 8.0, busy, now),
            Priority::Normal
        );
        assert_eq!(
            lane_for(Some(now - ChronoDuration::days(3)), 0.0, busy, now),
            Priority::Normal
        );
        assert_eq!(
            lane_for(Some(now - ChronoDuration::days(8)), 0.0, busy, now),
            Priority::High
        );
    }

    #[test]
    fn test_activity_rate_is_moving_average() {
        let rate = next_activity_rate(0.0, 10, 0.3);
        assert!((rate - 3.0).abs() < 1e-9);
        let rate = next_activity_rate(rate, 0, 0.3);
        assert!((rate - 2.1).abs() < 1e-9);
    }

    async fn scheduler(batch_size: u64) -> (SyncScheduler, QueueService, DatabaseConnection) {
        let db = test_db().await;
        let queue = QueueService::new(db.clone(), QueueConfig::default());
        let config = SchedulerConfig {
            batch_size,
            max_error_streak: 2,
            ..Default::default()
        };
        (SyncScheduler::new(db.clone(), queue.clone(), config), queue, db)
    }

    #[tokio::test]
    async fn test_batch_picks_stalest_active_providers() {
        let (scheduler, queue, db) = scheduler(2).await;
        let tenant = Uuid::new_v4();
        let _never =
            insert_provider(&db, tenant, ProviderType::Gmail, serde_json::json!({})).await;
        let stale = insert_provider(
            &db,
            tenant,
            ProviderType::Outlook,
            serde_json::json!({"deltaLink": "https://graph/delta?x"}),
        )
        .await;
        let fresh = insert_provider(&db, tenant, ProviderType::Imap, serde_json::json!({})).await;
        for (row, age) in [(&stale, ChronoDuration::days(10)), (&fresh, ChronoDuration::hours(1))] {
            let mut active: provider_config::ActiveModel = row.clone().into();
            active.last_synced_at = Set(Some(Utc::now() - age));
            active.update(&db).await.unwrap();
        }

        let stats = scheduler.schedule_batch().await.unwrap();
        assert_eq!(stats, ScheduleStats { considered: 2, enqueued: 2, duplicates: 0 });
        assert_eq!(queue.lane_counts(Priority::Normal).await.unwrap().waiting, 1);
        let high = queue.claim_next(Priority::High).await.unwrap().unwrap();
        assert_eq!(high.data.provider_id, stale.id);
        assert_eq!(high.data.sync_type, SyncType::Incremental);
        assert_eq!(queue.lane_counts(Priority::Low).await.unwrap().waiting, 0);

        // Still pending: nothing new on the next pass.
        let again = scheduler.schedule_batch().await.unwrap();
        assert_eq!(again.enqueued, 0);
        assert_eq!(again.duplicates, 2);
    }

    #[tokio::test]
    async fn test_manual_trigger_uses_high_lane() {
        let (scheduler, queue, db) = scheduler(10).await;
        let provider =
            insert_provider(&db, Uuid::new_v4(), ProviderType::Imap, serde_json::json!({})).await;

        let outcome = scheduler.trigger_manual(provider.id).await.unwrap();
        assert!(matches!(outcome, Some(SubmitOutcome::Enqueued(_))));
        assert_eq!(
            scheduler.trigger_manual(provider.id).await.unwrap(),
            Some(SubmitOutcome::Duplicate)
        );
        let job = queue.claim_next(Priority::High).await.unwrap().unwrap();
        assert_eq!(job.data.sync_type, SyncType::Full);
        assert!(scheduler.trigger_manual(Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_error_streak_deactivates_provider() {
        let (scheduler, _queue, db) = scheduler(10).await;
        let provider =
            insert_provider(&db, Uuid::new_v4(), ProviderType::Gmail, serde_json::json!({})).await;

        assert!(!scheduler.record_failure(provider.id, "boom").await.unwrap());
        assert!(scheduler.record_failure(provider.id, "boom again").await.unwrap());

        let stored = provider_config::Entity::find_by_id(provider.id)
            .one(&db)
            .await
            .unwrap()
            .unwrap();
        assert!(!stored.is_active);
        assert_eq!(stored.error_streak, 2);
        assert_eq!(stored.last_error.as_deref(), Some("boom again"));
        assert!(scheduler.trigger_manual(provider.id).await.unwrap().is_none());
    }
}
