//! Durable three-lane job queue backed by the `sync_jobs` table.
//!
//! Jobs carry an idempotency key (`"<provider id>:<kind>"`). While a job is
//! waiting, active or delayed the key also sits in the unique `dedup_key`
//! column, so a second submission for the same key inserts nothing. Workers
//! claim jobs with a conditional update and hold a lease (`locked_until`)
//! that they renew while the job runs; a lapsed lease counts as a failed
//! attempt.

pub mod metrics;

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use sea_orm::prelude::Expr;
use sea_orm::sea_query::OnConflict;
use sea_orm::{
    ColumnTrait, ConnectionTrait, DatabaseConnection, DbErr, EntityTrait, QueryFilter,
    QueryOrder, QuerySelect, Set, TransactionTrait,
};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use uuid::Uuid;

pub use metrics::{JobEvent, LaneSnapshot, QueueMetrics};

use crate::config::QueueConfig;
use crate::db::entities::sync_job;
use crate::providers::{ProviderType, SyncType};

const EVENT_CAPACITY: usize = 1024;
const CLAIM_RETRIES: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    pub const ALL: [Priority; 3] = [Priority::High, Priority::Normal, Priority::Low];

    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::High => "high",
            Priority::Normal => "normal",
            Priority::Low => "low",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|p| p.as_str() == value)
    }
}

impl fmt::Display for Priority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What a job does; part of the idempotency key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum JobKind {
    #[default]
    EmailSync,
    FolderSync,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::EmailSync => "email-sync",
            JobKind::FolderSync => "folder-sync",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobStatus {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

impl JobStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Waiting => "waiting",
            JobStatus::Active => "active",
            JobStatus::Delayed => "delayed",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
        }
    }
}

/// Durable job payload.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncJobData {
    pub tenant_id: Uuid,
    pub provider_id: Uuid,
    pub provider_type: ProviderType,
    pub email: String,
    pub priority: Priority,
    pub sync_type: SyncType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_synced_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth_token: Option<String>,
    #[serde(default)]
    pub kind: JobKind,
}

impl SyncJobData {
    pub fn idempotency_key(&self) -> String {
        format!("{}:{}", self.provider_id, self.kind.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmitOutcome {
    Enqueued(Uuid),
    /// A waiting, active or delayed job with the same key already exists.
    Duplicate,
}

/// A job held by one worker under a lease.
#[derive(Debug, Clone)]
pub struct ClaimedJob {
    pub id: Uuid,
    pub lane: Priority,
    pub lock_token: Uuid,
    /// Attempts including the current one.
    pub attempt: i32,
    pub max_attempts: i32,
    pub started_at: DateTime<Utc>,
    pub data: SyncJobData,
}

/// How the queue should treat a failed attempt.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFailure {
    pub message: String,
    /// Lower bound on the delay before the next attempt.
    pub retry_after: Option<Duration>,
    /// Skip remaining attempts and fail the job now.
    pub abandon: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailOutcome {
    Retrying { run_at: DateTime<Utc> },
    Failed,
    /// The lease had already lapsed; the stalled-job reaper owns the row.
    LeaseLost,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct LaneCounts {
    pub waiting: u64,
    pub active: u64,
    pub delayed: u64,
    pub completed: u64,
    pub failed: u64,
}

/// Exponential backoff: `base * 2^(attempt - 1)`.
pub fn backoff_delay(base: Duration, attempt: i32) -> Duration {
    let exponent = attempt.saturating_sub(1).clamp(0, 20) as u32;
    base.saturating_mul(1u32 << exponent)
}

fn chrono_duration(duration: Duration) -> chrono::Duration {
    chrono::Duration::from_std(duration).unwrap_or(chrono::Duration::MAX)
}

#[derive(Clone)]
pub struct QueueService {
    db: DatabaseConnection,
    config: Arc<QueueConfig>,
    events: broadcast::Sender<JobEvent>,
}

impl QueueService {
    pub fn new(db: DatabaseConnection, config: QueueConfig) -> Self {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Self {
            db,
            config: Arc::new(config),
            events,
        }
    }

    pub fn config(&self) -> &QueueConfig {
        &self.config
    }

    pub fn subscribe(&self) -> broadcast::Receiver<JobEvent> {
        self.events.subscribe()
    }

    fn emit(&self, event: JobEvent) {
        // No subscribers is fine.
        let _ = self.events.send(event);
    }

    async fn insert_job<C: ConnectionTrait>(
        conn: &C,
        config: &QueueConfig,
        data: &SyncJobData,
        now: DateTime<Utc>,
    ) -> Result<SubmitOutcome> {
        let id = Uuid::new_v4();
        let key = data.idempotency_key();
        let row = sync_job::ActiveModel {
            id: Set(id),
            lane: Set(data.priority.as_str().to_string()),
            kind: Set(data.kind.as_str().to_string()),
            idempotency_key: Set(key.clone()),
            dedup_key: Set(Some(key)),
            tenant_id: Set(data.tenant_id),
            provider_id: Set(data.provider_id),
            provider_type: Set(data.provider_type.as_str().to_string()),
            payload: Set(serde_json::to_value(data).context("serialize job payload")?),
            status: Set(JobStatus::Waiting.as_str().to_string()),
            attempts_made: Set(0),
            max_attempts: Set(config.lane(data.priority).attempts.max(1) as i32),
            run_at: Set(now),
            locked_until: Set(None),
            lock_token: Set(None),
            last_error: Set(None),
            created_at: Set(now),
            started_at: Set(None),
            finished_at: Set(None),
            duration_ms: Set(None),
        };

        let inserted = sync_job::Entity::insert(row)
            .on_conflict(
                OnConflict::column(sync_job::Column::DedupKey)
                    .do_nothing()
                    .to_owned(),
            )
            .exec_without_returning(conn)
            .await;

        match inserted {
            Ok(0) | Err(DbErr::RecordNotInserted) => Ok(SubmitOutcome::Duplicate),
            Ok(_) => Ok(SubmitOutcome::Enqueued(id)),
            Err(err) => Err(err).context("insert sync job"),
        }
    }

    fn report_submission(&self, data: &SyncJobData, outcome: SubmitOutcome) {
        match outcome {
            SubmitOutcome::Enqueued(job_id) => {
                tracing::info!(
                    lane = %data.priority,
                    provider_id = %data.provider_id,
                    sync_type = data.sync_type.as_str(),
                    %job_id,
                    "Enqueued sync job"
                );
                self.emit(JobEvent::Enqueued {
                    lane: data.priority,
                    job_id,
                    provider_id: data.provider_id,
                });
            }
            SubmitOutcome::Duplicate => {
                let key = data.idempotency_key();
                tracing::debug!(lane = %data.priority, idempotency_key = %key, "Sync job already pending, skipped");
                self.emit(JobEvent::Duplicate {
                    lane: data.priority,
                    idempotency_key: key,
                });
            }
        }
    }

    /// Submits one job; a no-op when a non-terminal job with the same key exists.
    pub async fn add_sync_job(&self, data: SyncJobData) -> Result<SubmitOutcome> {
        let outcome = Self::insert_job(&self.db, &self.config, &data, Utc::now()).await?;
        self.report_submission(&data, outcome);
        Ok(outcome)
    }

    /// Submits jobs grouped by lane, each lane's batch in one transaction.
    /// Outcomes are returned in input order.
    pub async fn add_bulk_sync_jobs(&self, jobs: Vec<SyncJobData>) -> Result<Vec<SubmitOutcome>> {
        let mut by_lane: BTreeMap<Priority, Vec<(usize, SyncJobData)>> = BTreeMap::new();
        for (index, job) in jobs.into_iter().enumerate() {
            by_lane.entry(job.priority).or_default().push((index, job));
        }

        let mut outcomes = Vec::new();
        for (lane, batch) in by_lane {
            let now = Utc::now();
            let txn = self.db.begin().await.context("begin bulk submission")?;
            let mut lane_outcomes = Vec::with_capacity(batch.len());
            for (index, job) in batch {
                let outcome = Self::insert_job(&txn, &self.config, &job, now).await?;
                lane_outcomes.push((index, job, outcome));
            }
            txn.commit().await.context("commit bulk submission")?;
            tracing::debug!(%lane, jobs = lane_outcomes.len(), "Bulk submission committed");
            for (index, job, outcome) in lane_outcomes {
                self.report_submission(&job, outcome);
                outcomes.push((index, outcome));
            }
        }
        outcomes.sort_by_key(|(index, _)| *index);
        Ok(outcomes.into_iter().map(|(_, o)| o).collect())
    }

    /// Claims the oldest due job of a lane.
    pub async fn claim_next(&self, lane: Priority) -> Result<Option<ClaimedJob>> {
        for _ in 0..CLAIM_RETRIES {
            let now = Utc::now();
            let candidate = sync_job::Entity::find()
                .filter(sync_job::Column::Lane.eq(lane.as_str()))
                .filter(sync_job::Column::Status.is_in([
                    JobStatus::Waiting.as_str(),
                    JobStatus::Delayed.as_str(),
                ]))
                .filter(sync_job::Column::RunAt.lte(now))
                .order_by_asc(sync_job::Column::RunAt)
                .order_by_asc(sync_job::Column::CreatedAt)
                .one(&self.db)
                .await
                .context("find due job")?;
            let Some(job) = candidate else {
                return Ok(None);
            };

            let lock_token = Uuid::new_v4();
            let claimed = sync_job::Entity::update_many()
                .col_expr(
                    sync_job::Column::Status,
                    Expr::value(JobStatus::Active.as_str()),
                )
                .col_expr(sync_job::Column::LockToken, Expr::value(lock_token))
                .col_expr(
                    sync_job::Column::LockedUntil,
                    Expr::value(now + chrono_duration(self.config.lock_duration)),
                )
                .col_expr(sync_job::Column::StartedAt, Expr::value(now))
                .col_expr(
                    sync_job::Column::AttemptsMade,
                    Expr::col(sync_job::Column::AttemptsMade).add(1),
                )
                .filter(sync_job::Column::Id.eq(job.id))
                .filter(sync_job::Column::Status.eq(job.status.as_str()))
                .exec(&self.db)
                .await
                .context("claim job")?;
            if claimed.rows_affected != 1 {
                // Another worker won the race.
                continue;
            }

            let attempt = job.attempts_made + 1;
            let data: SyncJobData = match serde_json::from_value(job.payload.clone()) {
                Ok(data) => data,
                Err(err) => {
                    tracing::error!(job_id = %job.id, error = %err, "Unreadable job payload, failing job");
                    self.finish_terminal(
                        job.id,
                        lock_token,
                        JobStatus::Failed,
                        Some(format!("invalid payload: {}", err)),
                        now,
                        now,
                    )
                    .await?;
                    self.emit(JobEvent::Failed {
                        lane,
                        job_id: job.id,
                        provider_id: job.provider_id,
                        error: err.to_string(),
                    });
                    continue;
                }
            };

            self.emit(JobEvent::Active {
                lane,
                job_id: job.id,
                attempt,
            });
            return Ok(Some(ClaimedJob {
                id: job.id,
                lane,
                lock_token,
                attempt,
                max_attempts: job.max_attempts,
                started_at: now,
                data,
            }));
        }
        Ok(None)
    }

    /// Renews the lease of a running job. Returns false once the lease is lost.
    pub async fn extend_lease(&self, job: &ClaimedJob) -> Result<bool> {
        self.hold_lease(&self.db, job).await
    }

    /// Renews the lease through `conn`. Run inside a transaction, it makes the
    /// transaction's other writes conditional on this executor still owning
    /// the job.
    pub async fn hold_lease<C: ConnectionTrait>(
        &self,
        conn: &C,
        job: &ClaimedJob,
    ) -> Result<bool> {
        let until = Utc::now() + chrono_duration(self.config.lock_duration);
        let result = sync_job::Entity::update_many()
            .col_expr(sync_job::Column::LockedUntil, Expr::value(until))
            .filter(sync_job::Column::Id.eq(job.id))
            .filter(sync_job::Column::LockToken.eq(job.lock_token))
            .filter(sync_job::Column::Status.eq(JobStatus::Active.as_str()))
            .exec(conn)
            .await
            .context("extend job lease")?;
        Ok(result.rows_affected == 1)
    }

    async fn finish_terminal(
        &self,
        job_id: Uuid,
        lock_token: Uuid,
        status: JobStatus,
        error: Option<String>,
        started_at: DateTime<Utc>,
        now: DateTime<Utc>,
    ) -> Result<bool> {
        let duration_ms = (now - started_at).num_milliseconds().max(0);
        let result = sync_job::Entity::update_many()
            .col_expr(sync_job::Column::Status, Expr::value(status.as_str()))
            .col_expr(sync_job::Column::DedupKey, Expr::value(Option::<String>::None))
            .col_expr(sync_job::Column::LockToken, Expr::value(Option::<Uuid>::None))
            .col_expr(
                sync_job::Column::LockedUntil,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .col_expr(sync_job::Column::FinishedAt, Expr::value(now))
            .col_expr(sync_job::Column::DurationMs, Expr::value(duration_ms))
            .col_expr(sync_job::Column::LastError, Expr::value(error))
            .filter(sync_job::Column::Id.eq(job_id))
            .filter(sync_job::Column::LockToken.eq(lock_token))
            .exec(&self.db)
            .await
            .context("finish job")?;
        Ok(result.rows_affected == 1)
    }

    pub async fn complete(&self, job: &ClaimedJob) -> Result<()> {
        let now = Utc::now();
        let owned = self
            .finish_terminal(
                job.id,
                job.lock_token,
                JobStatus::Completed,
                None,
                job.started_at,
                now,
            )
            .await?;
        if !owned {
            tracing::warn!(job_id = %job.id, "Completed job after its lease lapsed");
            return Ok(());
        }
        let duration = (now - job.started_at).to_std().unwrap_or_default();
        tracing::info!(
            lane = %job.lane,
            job_id = %job.id,
            provider_id = %job.data.provider_id,
            duration_ms = duration.as_millis() as u64,
            "Sync job completed"
        );
        self.emit(JobEvent::Completed {
            lane: job.lane,
            job_id: job.id,
            provider_id: job.data.provider_id,
            duration,
        });
        self.prune(job.lane).await
    }

    /// Records a failed attempt: schedules a retry with backoff, or fails the
    /// job for good once attempts are exhausted or the failure is abandoned.
    pub async fn fail(&self, job: &ClaimedJob, failure: JobFailure) -> Result<FailOutcome> {
        let now = Utc::now();
        if failure.abandon || job.attempt >= job.max_attempts {
            let owned = self
                .finish_terminal(
                    job.id,
                    job.lock_token,
                    JobStatus::Failed,
                    Some(failure.message.clone()),
                    job.started_at,
                    now,
                )
                .await?;
            if !owned {
                return Ok(FailOutcome::LeaseLost);
            }
            tracing::error!(
                lane = %job.lane,
                job_id = %job.id,
                provider_id = %job.data.provider_id,
                attempt = job.attempt,
                error = %failure.message,
                "Sync job failed permanently"
            );
            self.emit(JobEvent::Failed {
                lane: job.lane,
                job_id: job.id,
                provider_id: job.data.provider_id,
                error: failure.message,
            });
            self.prune(job.lane).await?;
            return Ok(FailOutcome::Failed);
        }

        let backoff = backoff_delay(self.config.lane(job.lane).backoff_base, job.attempt);
        let delay = failure.retry_after.map_or(backoff, |hint| hint.max(backoff));
        let run_at = now + chrono_duration(delay);
        let result = sync_job::Entity::update_many()
            .col_expr(sync_job::Column::Status, Expr::value(JobStatus::Delayed.as_str()))
            .col_expr(sync_job::Column::RunAt, Expr::value(run_at))
            .col_expr(sync_job::Column::LockToken, Expr::value(Option::<Uuid>::None))
            .col_expr(
                sync_job::Column::LockedUntil,
                Expr::value(Option::<DateTime<Utc>>::None),
            )
            .col_expr(sync_job::Column::LastError, Expr::value(failure.message.clone()))
            .filter(sync_job::Column::Id.eq(job.id))
            .filter(sync_job::Column::LockToken.eq(job.lock_token))
            .exec(&self.db)
            .await
            .context("schedule job retry")?;
        if result.rows_affected != 1 {
            return Ok(FailOutcome::LeaseLost);
        }

        tracing::warn!(
            lane = %job.lane,
            job_id = %job.id,
            attempt = job.attempt,
            max_attempts = job.max_attempts,
            delay_ms = delay.as_millis() as u64,
            error = %failure.message,
            "Sync job failed, retry scheduled"
        );
        self.emit(JobEvent::Retrying {
            lane: job.lane,
            job_id: job.id,
            attempt: job.attempt,
            run_at,
        });
        Ok(FailOutcome::Retrying { run_at })
    }

    /// Returns active jobs whose lease lapsed to the queue, counting the lapsed
    /// run as a failed attempt.
    pub async fn recover_stalled(&self) -> Result<u64> {
        let now = Utc::now();
        let stalled = sync_job::Entity::find()
            .filter(sync_job::Column::Status.eq(JobStatus::Active.as_str()))
            .filter(sync_job::Column::LockedUntil.lt(now))
            .all(&self.db)
            .await
            .context("find stalled jobs")?;

        let mut recovered = 0;
        for job in stalled {
            let Some(lane) = Priority::parse(&job.lane) else {
                continue;
            };
            let Some(lock_token) = job.lock_token else {
                continue;
            };
            let claimed = ClaimedJob {
                id: job.id,
                lane,
                lock_token,
                attempt: job.attempts_made,
                max_attempts: job.max_attempts,
                started_at: job.started_at.unwrap_or(now),
                data: match serde_json::from_value(job.payload.clone()) {
                    Ok(data) => data,
                    Err(_) => continue,
                },
            };
            tracing::warn!(%lane, job_id = %job.id, "Job lease lapsed, treating as stalled");
            self.emit(JobEvent::Stalled {
                lane,
                job_id: job.id,
            });
            let outcome = self
                .fail(
                    &claimed,
                    JobFailure {
                        message: "job stalled: lease expired".to_string(),
                        retry_after: None,
                        abandon: false,
                    },
                )
                .await?;
            if outcome != FailOutcome::LeaseLost {
                recovered += 1;
            }
        }
        Ok(recovered)
    }

    /// Deletes the oldest terminal rows beyond the lane's retention counts.
    async fn prune(&self, lane: Priority) -> Result<()> {
        let lane_config = self.config.lane(lane);
        for (status, keep) in [
            (JobStatus::Completed, lane_config.keep_completed),
            (JobStatus::Failed, lane_config.keep_failed),
        ] {
            let ids: Vec<Uuid> = sync_job::Entity::find()
                .select_only()
                .column(sync_job::Column::Id)
                .filter(sync_job::Column::Lane.eq(lane.as_str()))
                .filter(sync_job::Column::Status.eq(status.as_str()))
                .order_by_desc(sync_job::Column::FinishedAt)
                .into_tuple()
                .all(&self.db)
                .await
                .context("list terminal jobs")?;
            if ids.len() <= keep {
                continue;
            }
            let expired: Vec<Uuid> = ids.into_iter().skip(keep).collect();
            let deleted = sync_job::Entity::delete_many()
                .filter(sync_job::Column::Id.is_in(expired))
                .exec(&self.db)
                .await
                .context("prune terminal jobs")?;
            tracing::debug!(%lane, status = status.as_str(), deleted = deleted.rows_affected, "Pruned old jobs");
        }
        Ok(())
    }

    pub async fn lane_counts(&self, lane: Priority) -> Result<LaneCounts> {
        let rows: Vec<(String, i64)> = sync_job::Entity::find()
            .select_only()
            .column(sync_job::Column::Status)
            .column_as(Expr::col(sync_job::Column::Id).count(), "count")
            .filter(sync_job::Column::Lane.eq(lane.as_str()))
            .group_by(sync_job::Column::Status)
            .into_tuple()
            .all(&self.db)
            .await
            .context("count jobs")?;

        let mut counts = LaneCounts::default();
        for (status, count) in rows {
            let count = count.max(0) as u64;
            match status.as_str() {
                "waiting" => counts.waiting = count,
                "active" => counts.active = count,
                "delayed" => counts.delayed = count,
                "completed" => counts.completed = count,
                "failed" => counts.failed = count,
                _ => {}
            }
        }
        Ok(counts)
    }
}
