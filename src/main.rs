mod accounts;
mod api;
mod config;
mod crossprovider;
mod crypto;
mod db;
mod events;
mod migration;
mod providers;
mod queue;
mod sync;
mod webhook;

use std::sync::Arc;

use config::AppConfig;
use sea_orm_migration::MigratorTrait;
use tokio_util::sync::CancellationToken;

use accounts::AccountService;
use crossprovider::ProviderPriority;
use crypto::CredentialCipher;
use events::BroadcastEmitter;
use providers::{ProviderRegistry, StoredTokenSupplier, TokenSupplier};
use queue::{QueueMetrics, QueueService};
use sync::{SyncScheduler, SyncWorker, WorkerPool, WorkerSettings};
use webhook::WebhookManager;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub queue: QueueService,
    pub metrics: Arc<QueueMetrics>,
    pub scheduler: Arc<SyncScheduler>,
    pub webhooks: Arc<WebhookManager>,
    pub accounts: Arc<AccountService>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info,mailmirror=debug")),
        )
        .init();

    // Load configuration
    let config = AppConfig::from_env()?;
    tracing::info!("mailmirror starting...");
    tracing::info!("Server: {}:{}", config.server.host, config.server.port);
    tracing::info!(
        "Lanes: high={} normal={} low={} workers",
        config.queue.high.concurrency,
        config.queue.normal.concurrency,
        config.queue.low.concurrency
    );

    // Connect to database
    let db = db::connect(&config.database.url).await?;

    // Run migrations
    migration::Migrator::up(&db, None).await?;
    tracing::info!("Database migrations complete");

    let cipher = CredentialCipher::from_base64(&config.oauth.credentials_key)?;
    let tokens: Arc<dyn TokenSupplier> = Arc::new(StoredTokenSupplier::new(
        db.clone(),
        cipher.clone(),
        config.oauth.clone(),
    ));
    let registry = Arc::new(ProviderRegistry::with_defaults(
        &config.oauth,
        &config.webhook,
    ));
    let realtime = BroadcastEmitter::new(1024);
    let mut realtime_rx = realtime.subscribe();

    let queue = QueueService::new(db.clone(), config.queue.clone());
    let metrics = Arc::new(QueueMetrics::new());
    let scheduler = Arc::new(SyncScheduler::new(
        db.clone(),
        queue.clone(),
        config.scheduler.clone(),
    ));
    let webhooks = Arc::new(WebhookManager::new(
        db.clone(),
        tokens.clone(),
        registry.clone(),
        queue.clone(),
        config.webhook.clone(),
    ));
    let accounts = Arc::new(AccountService::new(
        db.clone(),
        cipher,
        scheduler.clone(),
        webhooks.clone(),
        ProviderPriority::from(&config.conflict),
    ));
    let worker = SyncWorker::new(
        db,
        queue.clone(),
        tokens,
        registry,
        Arc::new(realtime),
        WorkerSettings::from_config(&config.scheduler, &config.conflict),
    );

    // Background loops
    let cancel = CancellationToken::new();
    let mut tasks = WorkerPool::spawn(worker, &config.queue, cancel.clone());
    tasks.push(metrics.clone().spawn_listener(queue.subscribe(), cancel.clone()));
    tasks.push(tokio::spawn(scheduler.clone().run(cancel.clone())));
    tasks.push(tokio::spawn(webhooks.clone().run_renewal(cancel.clone())));
    let realtime_cancel = cancel.clone();
    tasks.push(tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = realtime_cancel.cancelled() => break,
                received = realtime_rx.recv() => match received {
                    Ok(event) => tracing::debug!(
                        tenant_id = %event.tenant_id,
                        kind = %event.kind,
                        "Realtime event"
                    ),
                    Err(tokio::sync::broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "Realtime log sink lagged behind");
                    }
                    Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
                },
            }
        }
    }));
    tracing::info!("Started {} background tasks", tasks.len());

    let state = AppState {
        queue,
        metrics,
        scheduler,
        webhooks,
        accounts,
    };
    let app = api::build_router(state);

    // Start server
    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("mailmirror API listening on {}", addr);

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(err) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %err, "Failed to listen for shutdown signal");
            }
            tracing::info!("Shutdown requested");
            shutdown.cancel();
        })
        .await?;

    cancel.cancel();
    for task in tasks {
        if let Err(err) = task.await {
            tracing::warn!(error = %err, "Background task ended abnormally");
        }
    }
    tracing::info!("mailmirror stopped");
    Ok(())
}
