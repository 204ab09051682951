//! Connecting and disconnecting provider accounts.

use anyhow::Context;
use chrono::Utc;
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QuerySelect, Set,
    TransactionTrait,
};
use serde::Deserialize;
use std::collections::BTreeSet;
use std::sync::Arc;
use uuid::Uuid;

use crate::crossprovider::{detach_provider, reconcile_link, ProviderPriority};
use crate::crypto::CredentialCipher;
use crate::db::entities::{email, provider_config, webhook_subscription};
use crate::providers::token::Credentials;
use crate::providers::ProviderType;
use crate::queue::SubmitOutcome;
use crate::sync::folders::refresh_folder_counts;
use crate::sync::SyncScheduler;
use crate::webhook::WebhookManager;

#[derive(Debug, thiserror::Error)]
pub enum AccountError {
    #[error("{provider_type} account {email} is already connected")]
    AlreadyConnected {
        provider_type: ProviderType,
        email: String,
    },
    #[error("invalid account: {0}")]
    Invalid(String),
    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NewProvider {
    pub tenant_id: Uuid,
    pub user_id: Uuid,
    pub provider_type: ProviderType,
    pub email: String,
    pub credentials: Credentials,
    /// IMAP connection hints (`host`, `port`) and any other adapter settings.
    #[serde(default)]
    pub metadata: Option<serde_json::Value>,
    #[serde(default)]
    pub supports_contacts: bool,
    #[serde(default)]
    pub supports_calendar: bool,
}

#[derive(Debug)]
pub struct ConnectedProvider {
    pub provider: provider_config::Model,
    pub subscription: Option<webhook_subscription::Model>,
    pub initial_sync: Option<SubmitOutcome>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DisconnectStats {
    pub subscriptions_removed: u64,
    pub links_kept: u32,
    pub links_dropped: u32,
}

pub struct AccountService {
    db: DatabaseConnection,
    cipher: CredentialCipher,
    scheduler: Arc<SyncScheduler>,
    webhooks: Arc<WebhookManager>,
    priority: ProviderPriority,
}

impl AccountService {
    pub fn new(
        db: DatabaseConnection,
        cipher: CredentialCipher,
        scheduler: Arc<SyncScheduler>,
        webhooks: Arc<WebhookManager>,
        priority: ProviderPriority,
    ) -> Self {
        Self {
            db,
            cipher,
            scheduler,
            webhooks,
            priority,
        }
    }

    /// Stores the account with sealed credentials, subscribes to push
    /// notifications where the provider offers them and queues the first
    /// full sync.
    pub async fn connect_provider(
        &self,
        input: NewProvider,
    ) -> Result<ConnectedProvider, AccountError> {
        let email = input.email.trim().to_lowercase();
        if email.is_empty() || !email.contains('@') {
            return Err(AccountError::Invalid(format!("'{}' is not an address", input.email)));
        }
        let metadata = input.metadata.unwrap_or_else(|| serde_json::json!({}));
        if !metadata.is_object() {
            return Err(AccountError::Invalid("metadata must be an object".into()));
        }

        let existing = provider_config::Entity::find()
            .filter(provider_config::Column::TenantId.eq(input.tenant_id))
            .filter(provider_config::Column::ProviderType.eq(input.provider_type.as_str()))
            .filter(provider_config::Column::Email.eq(email.as_str()))
            .one(&self.db)
            .await
            .context("check existing account")?;
        if existing.is_some() {
            return Err(AccountError::AlreadyConnected {
                provider_type: input.provider_type,
                email,
            });
        }

        let now = Utc::now();
        let provider = provider_config::ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(input.tenant_id),
            user_id: Set(input.user_id),
            provider_type: Set(input.provider_type.as_str().to_string()),
            email: Set(email),
            credentials: Set(self.cipher.seal_json(&input.credentials)?),
            is_active: Set(true),
            supports_contacts: Set(input.supports_contacts),
            supports_calendar: Set(input.supports_calendar),
            last_synced_at: Set(None),
            metadata: Set(metadata),
            error_streak: Set(0),
            activity_rate: Set(0.0),
            last_error: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(&self.db)
        .await
        .context("store provider")?;
        tracing::info!(
            provider_id = %provider.id,
            tenant_id = %provider.tenant_id,
            provider_type = %provider.provider_type,
            "Provider connected"
        );

        // Polling still covers the account when push setup fails.
        let subscription = if input.provider_type.supports_push() {
            match self.webhooks.ensure_subscription(provider.id).await {
                Ok(sub) => sub,
                Err(err) => {
                    tracing::warn!(provider_id = %provider.id, error = %format!("{err:#}"), "Webhook subscription failed");
                    None
                }
            }
        } else {
            None
        };
        let initial_sync = self.scheduler.trigger_manual(provider.id).await?;

        Ok(ConnectedProvider {
            provider,
            subscription,
            initial_sync,
        })
    }

    /// Removes the account with everything mirrored from it. Links it shared
    /// with other accounts are recounted and re-resolved. `None` when the
    /// provider does not exist.
    pub async fn disconnect_provider(
        &self,
        provider_id: Uuid,
    ) -> Result<Option<DisconnectStats>, AccountError> {
        let exists = provider_config::Entity::find_by_id(provider_id)
            .one(&self.db)
            .await
            .context("load provider")?
            .is_some();
        if !exists {
            return Ok(None);
        }

        let mut stats = DisconnectStats {
            subscriptions_removed: self.webhooks.remove_subscriptions(provider_id).await?,
            ..Default::default()
        };

        let txn = self.db.begin().await.context("begin disconnect")?;
        let link_ids: BTreeSet<Uuid> = email::Entity::find()
            .select_only()
            .column(email::Column::LinkId)
            .filter(email::Column::ProviderId.eq(provider_id))
            .filter(email::Column::LinkId.is_not_null())
            .into_tuple::<Option<Uuid>>()
            .all(&txn)
            .await
            .context("collect links")?
            .into_iter()
            .flatten()
            .collect();

        provider_config::Entity::delete_by_id(provider_id)
            .exec(&txn)
            .await
            .context("delete provider")?;
        // Explicit so links are recounted even where cascades are not enforced.
        email::Entity::delete_many()
            .filter(email::Column::ProviderId.eq(provider_id))
            .exec(&txn)
            .await
            .context("delete mirrored emails")?;

        let mut peers = BTreeSet::new();
        for link_id in link_ids {
            if detach_provider(&txn, link_id).await? {
                if let Some(reconciled) = reconcile_link(&txn, link_id, &self.priority).await? {
                    peers.extend(reconciled.providers);
                }
                stats.links_kept += 1;
            } else {
                stats.links_dropped += 1;
            }
        }
        for peer_id in peers {
            refresh_folder_counts(&txn, peer_id).await?;
        }
        txn.commit().await.context("commit disconnect")?;

        tracing::info!(
            %provider_id,
            subscriptions = stats.subscriptions_removed,
            links_kept = stats.links_kept,
            links_dropped = stats.links_dropped,
            "Provider disconnected"
        );
        Ok(Some(stats))
    }
}
