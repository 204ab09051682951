//! Push subscription lifecycle: creation, renewal before expiry, removal, and
//! verification of incoming change notifications.

pub mod payload;
pub mod secret;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use sea_orm::prelude::Expr;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, Set,
};
use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

pub use payload::{
    gmail_notification, GraphNotificationBatch, PubSubEnvelope, WebhookNotification,
};

use crate::config::WebhookConfig;
use crate::db::entities::{provider_config, webhook_subscription};
use crate::providers::{
    MailProvider, ProviderError, ProviderRegistry, ProviderType, SubscriptionRequest,
    TokenSupplier,
};
use crate::queue::{JobKind, Priority, QueueService, SubmitOutcome};
use crate::sync::scheduler::job_for;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Absent,
    Active,
    ExpiringSoon,
}

/// Lifecycle state of a stored subscription at `now`.
pub fn subscription_state(
    subscription: Option<&webhook_subscription::Model>,
    now: DateTime<Utc>,
    renewal_window: Duration,
) -> SubscriptionState {
    let Some(sub) = subscription.filter(|s| s.is_active && s.expires_at > now) else {
        return SubscriptionState::Absent;
    };
    let window =
        ChronoDuration::from_std(renewal_window).unwrap_or_else(|_| ChronoDuration::days(365));
    if sub.expires_at - now <= window {
        SubscriptionState::ExpiringSoon
    } else {
        SubscriptionState::Active
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RenewalStats {
    pub renewed: u32,
    pub recreated: u32,
    pub failed: u32,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct NotificationOutcome {
    pub accepted: u32,
    pub rejected: u32,
    pub unknown: u32,
    pub enqueued: u32,
}

pub struct WebhookManager {
    db: DatabaseConnection,
    tokens: Arc<dyn TokenSupplier>,
    registry: Arc<ProviderRegistry>,
    queue: QueueService,
    config: Arc<WebhookConfig>,
}

impl WebhookManager {
    pub fn new(
        db: DatabaseConnection,
        tokens: Arc<dyn TokenSupplier>,
        registry: Arc<ProviderRegistry>,
        queue: QueueService,
        config: WebhookConfig,
    ) -> Self {
        Self {
            db,
            tokens,
            registry,
            queue,
            config: Arc::new(config),
        }
    }

    fn request(&self, provider_type: ProviderType, client_state: String) -> SubscriptionRequest {
        let ttl = ChronoDuration::from_std(self.config.subscription_ttl)
            .unwrap_or_else(|_| ChronoDuration::hours(70));
        SubscriptionRequest {
            notification_url: format!(
                "{}/webhooks/{}",
                self.config.public_url.trim_end_matches('/'),
                provider_type
            ),
            client_state,
            expires_at: Utc::now() + ttl,
        }
    }

    fn client_state_for(&self, provider_type: ProviderType) -> String {
        match provider_type {
            ProviderType::Gmail => self.config.gmail_push_token.clone(),
            _ => secret::generate_client_state(),
        }
    }

    async fn adapter(
        &self,
        provider_id: Uuid,
    ) -> Result<Option<(provider_config::Model, ProviderType, Arc<dyn MailProvider>)>> {
        let session = match self.tokens.get_provider_with_token(provider_id).await {
            Ok(session) => session,
            Err(ProviderError::NotFound(_)) => return Ok(None),
            Err(err) => return Err(err).context("resolve provider credential"),
        };
        let provider_type: ProviderType = session.provider.provider_type.parse()?;
        let adapter = self.registry.build(&session)?;
        Ok(Some((session.provider, provider_type, adapter)))
    }

    async fn stored_subscription(
        &self,
        provider_id: Uuid,
    ) -> Result<Option<webhook_subscription::Model>> {
        webhook_subscription::Entity::find()
            .filter(webhook_subscription::Column::ProviderId.eq(provider_id))
            .one(&self.db)
            .await
            .context("load subscription")
    }

    async fn create(
        &self,
        provider: &provider_config::Model,
        provider_type: ProviderType,
        adapter: &dyn MailProvider,
        stale: Option<webhook_subscription::Model>,
    ) -> Result<Option<webhook_subscription::Model>> {
        let client_state = self.client_state_for(provider_type);
        let remote = match adapter
            .create_subscription(&self.request(provider_type, client_state.clone()))
            .await
        {
            Ok(remote) => remote,
            Err(ProviderError::Unsupported(reason)) => {
                tracing::info!(provider_id = %provider.id, %reason, "Push not available, relying on polling");
                return Ok(None);
            }
            Err(err) => return Err(err).context("create subscription"),
        };

        let now = Utc::now();
        let model = match stale {
            Some(existing) => {
                let mut active: webhook_subscription::ActiveModel = existing.into();
                active.resource = Set(remote.resource);
                active.external_id = Set(remote.external_id);
                active.client_state = Set(client_state);
                active.expires_at = Set(remote.expires_at);
                active.is_active = Set(true);
                active.updated_at = Set(now);
                active.update(&self.db).await.context("replace subscription")?
            }
            None => webhook_subscription::ActiveModel {
                id: Set(Uuid::new_v4()),
                provider_id: Set(provider.id),
                resource: Set(remote.resource),
                external_id: Set(remote.external_id),
                client_state: Set(client_state),
                expires_at: Set(remote.expires_at),
                notification_count: Set(0),
                last_notification_at: Set(None),
                is_active: Set(true),
                created_at: Set(now),
                updated_at: Set(now),
            }
            .insert(&self.db)
            .await
            .context("store subscription")?,
        };
        tracing::info!(
            provider_id = %provider.id,
            external_id = %model.external_id,
            expires_at = %model.expires_at,
            "Webhook subscription created"
        );
        Ok(Some(model))
    }

    async fn renew(
        &self,
        subscription: webhook_subscription::Model,
        provider: &provider_config::Model,
        provider_type: ProviderType,
        adapter: &dyn MailProvider,
    ) -> Result<(webhook_subscription::Model, bool)> {
        let request = self.request(provider_type, subscription.client_state.clone());
        match adapter
            .renew_subscription(&subscription.external_id, &request)
            .await
        {
            Ok(remote) => {
                let mut active: webhook_subscription::ActiveModel = subscription.into();
                active.expires_at = Set(remote.expires_at);
                active.updated_at = Set(Utc::now());
                let model = active.update(&self.db).await.context("extend subscription")?;
                tracing::debug!(external_id = %model.external_id, "Webhook subscription renewed");
                Ok((model, false))
            }
            Err(ProviderError::NotFound(_)) => {
                tracing::warn!(
                    external_id = %subscription.external_id,
                    "Provider lost the subscription, recreating"
                );
                let model = self
                    .create(provider, provider_type, adapter, Some(subscription))
                    .await?
                    .context("subscription could not be recreated")?;
                Ok((model, true))
            }
            Err(err) => Err(err).context("renew subscription"),
        }
    }

    /// Makes sure a push provider has a live subscription. `None` for
    /// providers without push support.
    pub async fn ensure_subscription(
        &self,
        provider_id: Uuid,
    ) -> Result<Option<webhook_subscription::Model>> {
        let Some((provider, provider_type, adapter)) = self.adapter(provider_id).await? else {
            return Ok(None);
        };
        if !provider_type.supports_push() {
            return Ok(None);
        }

        let stored = self.stored_subscription(provider_id).await?;
        match subscription_state(stored.as_ref(), Utc::now(), self.config.renewal_window) {
            SubscriptionState::Active => Ok(stored),
            SubscriptionState::ExpiringSoon => match stored {
                Some(sub) => {
                    let (model, _) = self
                        .renew(sub, &provider, provider_type, adapter.as_ref())
                        .await?;
                    Ok(Some(model))
                }
                None => Ok(None),
            },
            SubscriptionState::Absent => {
                self.create(&provider, provider_type, adapter.as_ref(), stored)
                    .await
            }
        }
    }

    /// Renews every active subscription expiring within the renewal window.
    pub async fn renew_expiring(&self) -> Result<RenewalStats> {
        let window = ChronoDuration::from_std(self.config.renewal_window)
            .unwrap_or_else(|_| ChronoDuration::hours(24));
        let due = webhook_subscription::Entity::find()
            .filter(webhook_subscription::Column::IsActive.eq(true))
            .filter(webhook_subscription::Column::ExpiresAt.lte(Utc::now() + window))
            .all(&self.db)
            .await
            .context("load expiring subscriptions")?;

        let mut stats = RenewalStats::default();
        for sub in due {
            let provider_id = sub.provider_id;
            let external_id = sub.external_id.clone();
            let result = match self.adapter(provider_id).await {
                Ok(Some((provider, provider_type, adapter))) => {
                    self.renew(sub, &provider, provider_type, adapter.as_ref())
                        .await
                }
                Ok(None) => continue,
                Err(err) => Err(err),
            };
            match result {
                Ok((_, true)) => stats.recreated += 1,
                Ok((_, false)) => stats.renewed += 1,
                Err(err) => {
                    stats.failed += 1;
                    tracing::warn!(%provider_id, %external_id, error = %err, "Subscription renewal failed");
                }
            }
        }
        if stats != RenewalStats::default() {
            tracing::info!(
                renewed = stats.renewed,
                recreated = stats.recreated,
                failed = stats.failed,
                "Subscription renewal sweep finished"
            );
        }
        Ok(stats)
    }

    /// Deletes a provider's subscriptions, remotely when possible and locally
    /// always.
    pub async fn remove_subscriptions(&self, provider_id: Uuid) -> Result<u64> {
        let subs = webhook_subscription::Entity::find()
            .filter(webhook_subscription::Column::ProviderId.eq(provider_id))
            .all(&self.db)
            .await
            .context("load subscriptions")?;
        if subs.is_empty() {
            return Ok(0);
        }

        match self.adapter(provider_id).await {
            Ok(Some((_, _, adapter))) => {
                for sub in &subs {
                    if let Err(err) = adapter.delete_subscription(&sub.external_id).await {
                        tracing::warn!(external_id = %sub.external_id, error = %err, "Remote subscription delete failed");
                    }
                }
            }
            Ok(None) => {}
            Err(err) => {
                tracing::warn!(%provider_id, error = %err, "Skipping remote subscription delete");
            }
        }

        let deleted = webhook_subscription::Entity::delete_many()
            .filter(webhook_subscription::Column::ProviderId.eq(provider_id))
            .exec(&self.db)
            .await
            .context("delete subscriptions")?;
        Ok(deleted.rows_affected)
    }

    /// Verifies each notification against its subscription and enqueues one
    /// high-priority incremental sync per notified provider.
    pub async fn handle_notifications(
        &self,
        notifications: Vec<WebhookNotification>,
    ) -> Result<NotificationOutcome> {
        let mut outcome = NotificationOutcome::default();
        let mut providers: BTreeSet<Uuid> = BTreeSet::new();

        for notification in notifications {
            let candidates = webhook_subscription::Entity::find()
                .filter(webhook_subscription::Column::ExternalId.eq(notification.subscription_id.as_str()))
                .filter(webhook_subscription::Column::IsActive.eq(true))
                .all(&self.db)
                .await
                .context("look up subscription")?;
            if candidates.is_empty() {
                outcome.unknown += 1;
                tracing::warn!(subscription_id = %notification.subscription_id, "Notification for unknown subscription dropped");
                continue;
            }

            let provided = notification.client_state.as_deref().unwrap_or_default();
            let verified: Vec<_> = candidates
                .into_iter()
                .filter(|sub| {
                    !provided.is_empty()
                        && secret::verify_client_state(
                            &self.config.verify_key,
                            &sub.client_state,
                            provided,
                        )
                })
                .collect();
            if verified.is_empty() {
                outcome.rejected += 1;
                tracing::warn!(subscription_id = %notification.subscription_id, "Notification failed secret verification, dropped");
                continue;
            }

            outcome.accepted += 1;
            for sub in verified {
                webhook_subscription::Entity::update_many()
                    .col_expr(
                        webhook_subscription::Column::NotificationCount,
                        Expr::col(webhook_subscription::Column::NotificationCount).add(1),
                    )
                    .col_expr(
                        webhook_subscription::Column::LastNotificationAt,
                        Expr::value(Utc::now()),
                    )
                    .filter(webhook_subscription::Column::Id.eq(sub.id))
                    .exec(&self.db)
                    .await
                    .context("count notification")?;
                providers.insert(sub.provider_id);
            }
        }

        for provider_id in providers {
            let Some(provider) = provider_config::Entity::find_by_id(provider_id)
                .one(&self.db)
                .await
                .context("load notified provider")?
            else {
                continue;
            };
            if !provider.is_active {
                continue;
            }
            let job = job_for(&provider, Priority::High, JobKind::EmailSync)?;
            if let SubmitOutcome::Enqueued(_) = self.queue.add_sync_job(job).await? {
                outcome.enqueued += 1;
            }
        }
        Ok(outcome)
    }

    pub async fn run_renewal(self: Arc<Self>, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.config.renewal_interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => {
                    if let Err(err) = self.renew_expiring().await {
                        tracing::error!(error = %err, "Subscription renewal sweep failed");
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::db::fixtures::insert_provider;
    use crate::db::test_db;
    use crate::providers::testing::{DbTokens, ScriptedProvider};

    struct Harness {
        db: DatabaseConnection,
        queue: QueueService,
        manager: WebhookManager,
        adapter: Arc<ScriptedProvider>,
    }

    async fn harness() -> Harness {
        let db = test_db().await;
        let queue = QueueService::new(db.clone(), QueueConfig::default());
        let adapter = ScriptedProvider::new(ProviderType::Outlook, vec![]);
        let config = WebhookConfig {
            gmail_push_token: "push-token".into(),
            ..Default::default()
        };
        let manager = WebhookManager::new(
            db.clone(),
            Arc::new(DbTokens(db.clone())),
            Arc::new(adapter.registry()),
            queue.clone(),
            config,
        );
        Harness {
            db,
            queue,
            manager,
            adapter,
        }
    }

    fn sub(expires_in: ChronoDuration, is_active: bool) -> webhook_subscription::Model {
        let now = Utc::now();
        webhook_subscription::Model {
            id: Uuid::new_v4(),
            provider_id: Uuid::new_v4(),
            resource: "r".into(),
            external_id: "x".into(),
            client_state: "s".into(),
            expires_at: now + expires_in,
            notification_count: 0,
            last_notification_at: None,
            is_active,
            created_at: now,
            updated_at: now,
        }
    }

    #[test]
    fn test_state_machine() {
        let now = Utc::now();
        let window = Duration::from_secs(24 * 3600);
        assert_eq!(subscription_state(None, now, window), SubscriptionState::Absent);
        let healthy = sub(ChronoDuration::hours(60), true);
        assert_eq!(subscription_state(Some(&healthy), now, window), SubscriptionState::Active);
        let expiring = sub(ChronoDuration::hours(3), true);
        assert_eq!(
            subscription_state(Some(&expiring), now, window),
            SubscriptionState::ExpiringSoon
        );
        let expired = sub(ChronoDuration::hours(-1), true);
        assert_eq!(subscription_state(Some(&expired), now, window), SubscriptionState::Absent);
        let inactive = sub(ChronoDuration::hours(60), false);
        assert_eq!(subscription_state(Some(&inactive), now, window), SubscriptionState::Absent);
    }

    #[tokio::test]
    async fn test_ensure_creates_once_for_push_providers() {
        let h = harness().await;
        let outlook =
            insert_provider(&h.db, Uuid::new_v4(), ProviderType::Outlook, serde_json::json!({}))
                .await;
        let imap =
            insert_provider(&h.db, Uuid::new_v4(), ProviderType::Imap, serde_json::json!({})).await;

        let first = h.manager.ensure_subscription(outlook.id).await.unwrap().unwrap();
        let second = h.manager.ensure_subscription(outlook.id).await.unwrap().unwrap();
        assert_eq!(first.id, second.id);
        assert_eq!(first.client_state.len(), 64);
        assert!(h.manager.ensure_subscription(imap.id).await.unwrap().is_none());
        assert_eq!(h.adapter.calls(), vec!["create"]);
    }

    #[tokio::test]
    async fn test_gmail_subscription_uses_push_token() {
        let h = harness().await;
        let gmail =
            insert_provider(&h.db, Uuid::new_v4(), ProviderType::Gmail, serde_json::json!({}))
                .await;
        let sub = h.manager.ensure_subscription(gmail.id).await.unwrap().unwrap();
        assert_eq!(sub.client_state, "push-token");
    }

    async fn expire_soon(db: &DatabaseConnection, sub: webhook_subscription::Model) {
        let mut active: webhook_subscription::ActiveModel = sub.into();
        active.expires_at = Set(Utc::now() + ChronoDuration::hours(2));
        active.update(db).await.unwrap();
    }

    #[tokio::test]
    async fn test_renewal_extends_or_recreates() {
        let h = harness().await;
        let outlook =
            insert_provider(&h.db, Uuid::new_v4(), ProviderType::Outlook, serde_json::json!({}))
                .await;
        let created = h.manager.ensure_subscription(outlook.id).await.unwrap().unwrap();
        expire_soon(&h.db, created.clone()).await;

        let stats = h.manager.renew_expiring().await.unwrap();
        assert_eq!(stats, RenewalStats { renewed: 1, recreated: 0, failed: 0 });
        let renewed = webhook_subscription::Entity::find_by_id(created.id)
            .one(&h.db)
            .await
            .unwrap()
            .unwrap();
        assert!(renewed.expires_at > Utc::now() + ChronoDuration::hours(24));

        expire_soon(&h.db, renewed).await;
        h.adapter
            .fail_renewals_with(ProviderError::NotFound("subscription".into()));
        let stats = h.manager.renew_expiring().await.unwrap();
        assert_eq!(stats.recreated, 1);
        let replaced = webhook_subscription::Entity::find_by_id(created.id)
            .one(&h.db)
            .await
            .unwrap()
            .unwrap();
        assert_ne!(replaced.external_id, created.external_id);
        assert_ne!(replaced.client_state, created.client_state);
    }

    #[tokio::test]
    async fn test_mismatched_secret_never_enqueues() {
        let h = harness().await;
        let outlook =
            insert_provider(&h.db, Uuid::new_v4(), ProviderType::Outlook, serde_json::json!({}))
                .await;
        let sub = h.manager.ensure_subscription(outlook.id).await.unwrap().unwrap();

        let forged = WebhookNotification {
            subscription_id: sub.external_id.clone(),
            client_state: Some("forged".into()),
            resource: None,
            change_type: Some("created".into()),
        };
        let missing = WebhookNotification {
            client_state: None,
            ..forged.clone()
        };
        let unknown = WebhookNotification {
            subscription_id: "nope".into(),
            ..forged.clone()
        };
        let outcome = h
            .manager
            .handle_notifications(vec![forged, missing, unknown])
            .await
            .unwrap();
        assert_eq!(
            outcome,
            NotificationOutcome { accepted: 0, rejected: 2, unknown: 1, enqueued: 0 }
        );
        let counts = h.queue.lane_counts(Priority::High).await.unwrap();
        assert_eq!(counts.waiting, 0);
    }

    #[tokio::test]
    async fn test_verified_notifications_enqueue_one_job() {
        let h = harness().await;
        let outlook = insert_provider(
            &h.db,
            Uuid::new_v4(),
            ProviderType::Outlook,
            serde_json::json!({"deltaLink": "https://graph/delta?t=1"}),
        )
        .await;
        let sub = h.manager.ensure_subscription(outlook.id).await.unwrap().unwrap();
        let genuine = WebhookNotification {
            subscription_id: sub.external_id.clone(),
            client_state: Some(sub.client_state.clone()),
            resource: None,
            change_type: Some("updated".into()),
        };

        let outcome = h
            .manager
            .handle_notifications(vec![genuine.clone(), genuine])
            .await
            .unwrap();
        assert_eq!(outcome.accepted, 2);
        assert_eq!(outcome.enqueued, 1);

        let job = h.queue.claim_next(Priority::High).await.unwrap().unwrap();
        assert_eq!(job.data.provider_id, outlook.id);
        assert_eq!(job.data.sync_type, crate::providers::SyncType::Incremental);
        let stored = webhook_subscription::Entity::find_by_id(sub.id)
            .one(&h.db)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.notification_count, 2);
    }

    #[tokio::test]
    async fn test_remove_deletes_remote_and_local() {
        let h = harness().await;
        let outlook =
            insert_provider(&h.db, Uuid::new_v4(), ProviderType::Outlook, serde_json::json!({}))
                .await;
        let sub = h.manager.ensure_subscription(outlook.id).await.unwrap().unwrap();

        assert_eq!(h.manager.remove_subscriptions(outlook.id).await.unwrap(), 1);
        assert!(h
            .adapter
            .calls()
            .contains(&format!("delete:{}", sub.external_id)));
        assert!(webhook_subscription::Entity::find().all(&h.db).await.unwrap().is_empty());
    }
}
