use anyhow::Context;
use sea_orm::{DatabaseConnection, EntityTrait, TransactionTrait};
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use super::persist::{self, AppliedSync};
use super::scheduler;
use crate::config::{ConflictConfig, QueueConfig, SchedulerConfig};
use crate::crossprovider::ProviderPriority;
use crate::db::entities::provider_config;
use crate::events::{self, RealtimeEventEmitter};
use crate::providers::{
    MailProvider, ProviderError, ProviderRegistry, ProviderType, ProviderWithToken, RemoteFolder,
    SyncOptions, SyncResult, SyncType, TokenSupplier,
};
use crate::queue::{ClaimedJob, JobFailure, JobKind, Priority, QueueService};

/// Why a job attempt failed, and therefore how the queue should treat it.
#[derive(Debug, thiserror::Error)]
pub enum JobError {
    #[error(transparent)]
    Provider(#[from] ProviderError),

    #[error("provider {0} no longer exists")]
    ProviderMissing(Uuid),

    #[error("provider {0} is inactive")]
    ProviderInactive(Uuid),

    #[error("job {0} is now owned by another executor")]
    LeaseLost(Uuid),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl JobError {
    /// Short machine-readable kind for logs and `sync.failed` events.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::Provider(err) => err.kind(),
            JobError::ProviderMissing(_) => "provider_missing",
            JobError::ProviderInactive(_) => "provider_inactive",
            JobError::LeaseLost(_) => "lease_lost",
            JobError::Internal(_) => "internal",
        }
    }

    pub fn to_failure(&self) -> JobFailure {
        let message = self.to_string();
        match self {
            JobError::Provider(err) => JobFailure {
                message,
                retry_after: err.retry_after(),
                abandon: err.is_credential_error(),
            },
            JobError::ProviderMissing(_) | JobError::ProviderInactive(_) => JobFailure {
                message,
                retry_after: None,
                abandon: true,
            },
            JobError::LeaseLost(_) | JobError::Internal(_) => JobFailure {
                message,
                retry_after: None,
                abandon: false,
            },
        }
    }
}

/// Knobs the worker needs from the wider configuration.
#[derive(Debug, Clone)]
pub struct WorkerSettings {
    pub max_messages: u32,
    pub activity_alpha: f64,
    pub max_error_streak: i32,
    pub priority: ProviderPriority,
}

impl WorkerSettings {
    pub fn from_config(scheduler: &SchedulerConfig, conflict: &ConflictConfig) -> Self {
        Self {
            max_messages: scheduler.max_messages,
            activity_alpha: scheduler.activity_alpha,
            max_error_streak: scheduler.max_error_streak,
            priority: ProviderPriority::from(conflict),
        }
    }
}

/// Executes claimed sync jobs. Cheap to clone; every pool task holds one.
#[derive(Clone)]
pub struct SyncWorker {
    db: DatabaseConnection,
    queue: QueueService,
    tokens: Arc<dyn TokenSupplier>,
    registry: Arc<ProviderRegistry>,
    events: Arc<dyn RealtimeEventEmitter>,
    settings: Arc<WorkerSettings>,
}

impl SyncWorker {
    pub fn new(
        db: DatabaseConnection,
        queue: QueueService,
        tokens: Arc<dyn TokenSupplier>,
        registry: Arc<ProviderRegistry>,
        events: Arc<dyn RealtimeEventEmitter>,
        settings: WorkerSettings,
    ) -> Self {
        Self {
            db,
            queue,
            tokens,
            registry,
            events,
            settings: Arc::new(settings),
        }
    }

    /// Claims and runs one job of `lane`. Returns false when the lane was empty.
    pub async fn run_once(&self, lane: Priority) -> anyhow::Result<bool> {
        let Some(job) = self.queue.claim_next(lane).await? else {
            return Ok(false);
        };
        tracing::info!(
            %lane,
            job_id = %job.id,
            provider_id = %job.data.provider_id,
            provider_type = %job.data.provider_type,
            kind = job.data.kind.as_str(),
            attempt = job.attempt,
            "Processing sync job"
        );

        let renewal = CancellationToken::new();
        let renewal_task = self.spawn_lease_renewal(job.clone(), renewal.clone());
        let outcome = self.process(&job).await;
        renewal.cancel();
        let _ = renewal_task.await;

        match outcome {
            Ok(applied) => {
                self.queue.complete(&job).await?;
                self.emit_success(&job, &applied);
            }
            Err(err @ JobError::LeaseLost(_)) => {
                tracing::warn!(job_id = %job.id, error = %err, "Discarded sync results");
                self.queue.fail(&job, err.to_failure()).await?;
            }
            Err(err) => {
                tracing::warn!(
                    job_id = %job.id,
                    provider_id = %job.data.provider_id,
                    kind = err.kind(),
                    error = %err,
                    "Sync job attempt failed"
                );
                let failure = err.to_failure();
                if let Err(record_err) = scheduler::record_failure(
                    &self.db,
                    job.data.provider_id,
                    &failure.message,
                    self.settings.max_error_streak,
                )
                .await
                {
                    tracing::error!(error = %record_err, "Could not record provider failure");
                }
                self.events.emit(
                    job.data.tenant_id,
                    events::SYNC_FAILED,
                    serde_json::json!({
                        "providerId": job.data.provider_id,
                        "jobId": job.id,
                        "error": failure.message,
                        "errorKind": err.kind(),
                        "attempt": job.attempt,
                    }),
                );
                self.queue.fail(&job, failure).await?;
            }
        }
        Ok(true)
    }

    fn spawn_lease_renewal(&self, job: ClaimedJob, stop: CancellationToken) -> JoinHandle<()> {
        let queue = self.queue.clone();
        let every = (queue.config().lock_duration / 3).max(Duration::from_millis(100));
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = stop.cancelled() => break,
                    _ = tokio::time::sleep(every) => {
                        match queue.extend_lease(&job).await {
                            Ok(true) => {}
                            Ok(false) => {
                                tracing::warn!(job_id = %job.id, "Lost lease on running job");
                                break;
                            }
                            Err(err) => {
                                tracing::warn!(job_id = %job.id, error = %err, "Lease renewal failed");
                            }
                        }
                    }
                }
            }
        })
    }

    async fn session(&self, provider_id: Uuid) -> Result<ProviderWithToken, JobError> {
        let session = match self.tokens.get_provider_with_token(provider_id).await {
            Ok(session) => session,
            Err(ProviderError::NotFound(_)) => return Err(JobError::ProviderMissing(provider_id)),
            Err(err) => return Err(err.into()),
        };
        if !session.provider.is_active {
            return Err(JobError::ProviderInactive(provider_id));
        }
        Ok(session)
    }

    async fn process(&self, job: &ClaimedJob) -> Result<AppliedSync, JobError> {
        let session = self.session(job.data.provider_id).await?;
        let provider_type: ProviderType = session
            .provider
            .provider_type
            .parse()
            .context("stored provider type")?;
        let adapter = self.registry.build(&session)?;

        match job.data.kind {
            JobKind::FolderSync => {
                let remote_folders = adapter.list_folders().await?;
                let txn = self.db.begin().await.context("begin folder sync")?;
                if !self.queue.hold_lease(&txn, job).await? {
                    return Err(JobError::LeaseLost(job.id));
                }
                let applied =
                    persist::apply_folder_sync(&txn, &session.provider, &remote_folders).await?;
                txn.commit().await.context("commit folder sync")?;
                Ok(applied)
            }
            JobKind::EmailSync => self.sync_emails(job, &session, provider_type, adapter).await,
        }
    }

    async fn list_folders(
        &self,
        adapter: &dyn MailProvider,
    ) -> Result<Option<Vec<RemoteFolder>>, JobError> {
        match adapter.list_folders().await {
            Ok(folders) => Ok(Some(folders)),
            Err(err) if err.is_credential_error() || err.retry_after().is_some() => Err(err.into()),
            Err(err) => {
                tracing::warn!(error = %err, "Folder listing failed, syncing messages only");
                Ok(None)
            }
        }
    }

    async fn fetch_changes(
        &self,
        session: &ProviderWithToken,
        provider_type: ProviderType,
        sync_type: SyncType,
        adapter: &dyn MailProvider,
    ) -> Result<SyncResult, JobError> {
        let cursor = session
            .provider
            .metadata_str(provider_type.cursor_key())
            .map(str::to_string);
        let sync_type = match (sync_type, &cursor) {
            (SyncType::Incremental, Some(_)) => SyncType::Incremental,
            _ => SyncType::Full,
        };
        let options = SyncOptions {
            sync_type,
            max_messages: self.settings.max_messages,
            cursor: if sync_type == SyncType::Incremental {
                cursor
            } else {
                None
            },
        };

        match adapter.sync_emails(&options).await {
            Err(ProviderError::CursorInvalid(reason)) => {
                tracing::warn!(
                    provider_id = %session.provider.id,
                    %reason,
                    "Sync cursor rejected, falling back to full sync"
                );
                persist::clear_cursor(&self.db, &session.provider, provider_type).await?;
                let full = SyncOptions {
                    sync_type: SyncType::Full,
                    max_messages: self.settings.max_messages,
                    cursor: None,
                };
                Ok(adapter.sync_emails(&full).await?)
            }
            other => Ok(other?),
        }
    }

    async fn sync_emails(
        &self,
        job: &ClaimedJob,
        session: &ProviderWithToken,
        provider_type: ProviderType,
        adapter: Arc<dyn MailProvider>,
    ) -> Result<AppliedSync, JobError> {
        let remote_folders = self.list_folders(adapter.as_ref()).await?;
        let result = self
            .fetch_changes(session, provider_type, job.data.sync_type, adapter.as_ref())
            .await?;
        for item in &result.errors {
            tracing::warn!(
                provider_id = %session.provider.id,
                remote_id = ?item.remote_id,
                error = %item.message,
                "Message skipped during sync"
            );
        }

        // Reload: the cursor may have been cleared above.
        let provider = provider_config::Entity::find_by_id(session.provider.id)
            .one(&self.db)
            .await
            .context("reload provider")?
            .ok_or(JobError::ProviderMissing(session.provider.id))?;
        let txn = self.db.begin().await.context("begin sync apply")?;
        if !self.queue.hold_lease(&txn, job).await? {
            return Err(JobError::LeaseLost(job.id));
        }
        let applied = persist::apply_sync_result(
            &txn,
            &provider,
            provider_type,
            &result,
            remote_folders.as_deref(),
            &self.settings.priority,
            self.settings.activity_alpha,
        )
        .await?;
        txn.commit().await.context("commit sync apply")?;
        Ok(applied)
    }

    fn emit_success(&self, job: &ClaimedJob, applied: &AppliedSync) {
        let tenant_id = job.data.tenant_id;
        if !applied.folder_counts.is_empty() {
            self.events.emit(
                tenant_id,
                events::FOLDER_COUNTS_UPDATED,
                serde_json::json!({
                    "providerId": job.data.provider_id,
                    "folders": applied.folder_counts,
                }),
            );
        }
        for (peer_id, counts) in &applied.peer_folder_counts {
            self.events.emit(
                tenant_id,
                events::FOLDER_COUNTS_UPDATED,
                serde_json::json!({
                    "providerId": peer_id,
                    "folders": counts,
                }),
            );
        }
        self.events.emit(
            tenant_id,
            events::SYNC_COMPLETED,
            serde_json::json!({
                "providerId": job.data.provider_id,
                "jobId": job.id,
                "kind": job.data.kind.as_str(),
                "new": applied.new,
                "updated": applied.updated,
                "deleted": applied.deleted,
                "conflicts": applied.conflicts,
            }),
        );
    }
}

/// Per-lane worker tasks plus the stalled-job reaper.
pub struct WorkerPool;

impl WorkerPool {
    pub fn spawn(
        worker: SyncWorker,
        config: &QueueConfig,
        cancel: CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        let mut handles = Vec::new();
        for lane in Priority::ALL {
            let concurrency = config.lane(lane).concurrency;
            for slot in 0..concurrency {
                let worker = worker.clone();
                let cancel = cancel.clone();
                let poll = config.poll_interval;
                handles.push(tokio::spawn(async move {
                    tracing::debug!(%lane, slot, "Worker started");
                    // Running jobs are never interrupted; shutdown waits for them.
                    while !cancel.is_cancelled() {
                        match worker.run_once(lane).await {
                            Ok(true) => continue,
                            Ok(false) => {}
                            Err(err) => {
                                tracing::error!(%lane, error = %err, "Worker iteration failed");
                            }
                        }
                        tokio::select! {
                            _ = cancel.cancelled() => break,
                            _ = tokio::time::sleep(poll) => {}
                        }
                    }
                    tracing::debug!(%lane, slot, "Worker stopped");
                }));
            }
            tracing::info!(%lane, concurrency, "Lane workers spawned");
        }

        let queue = worker.queue.clone();
        let every = config.stalled_check_interval;
        handles.push(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(every);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => match queue.recover_stalled().await {
                        Ok(0) => {}
                        Ok(recovered) => tracing::warn!(recovered, "Recovered stalled jobs"),
                        Err(err) => tracing::error!(error = %err, "Stalled job check failed"),
                    },
                }
            }
        }));
        handles
    }
}
