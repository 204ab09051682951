//! In-memory adapter and token supplier for worker and webhook tests.

use async_trait::async_trait;
use futures::future::BoxFuture;
use sea_orm::{DatabaseConnection, EntityTrait};
use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use super::{
    MailProvider, MessagePage, MessageQuery, OutgoingMessage, ProviderError, ProviderRegistry,
    ProviderResult, ProviderType, ProviderWithToken, RemoteFolder, RemoteMessage,
    RemoteSubscription, SubscriptionRequest, SyncOptions, SyncResult, TokenSupplier,
};
use crate::db::entities::provider_config;

/// Replays scripted sync results and records every call it receives.
pub struct ScriptedProvider {
    provider_type: ProviderType,
    results: Mutex<VecDeque<ProviderResult<SyncResult>>>,
    seen: Mutex<Vec<SyncOptions>>,
    calls: Mutex<Vec<String>>,
    renew_error: Mutex<Option<ProviderError>>,
    before_sync: Mutex<Option<BoxFuture<'static, ()>>>,
}

impl ScriptedProvider {
    pub fn new(
        provider_type: ProviderType,
        results: Vec<ProviderResult<SyncResult>>,
    ) -> Arc<Self> {
        Arc::new(Self {
            provider_type,
            results: Mutex::new(results.into()),
            seen: Mutex::new(Vec::new()),
            calls: Mutex::new(Vec::new()),
            renew_error: Mutex::new(None),
            before_sync: Mutex::new(None),
        })
    }

    /// `(sync_type, cursor)` of every `sync_emails` call.
    pub fn seen(&self) -> Vec<(super::SyncType, Option<String>)> {
        self.seen
            .lock()
            .unwrap()
            .iter()
            .map(|o| (o.sync_type, o.cursor.clone()))
            .collect()
    }

    /// Subscription calls as `create`, `renew:<id>` and `delete:<id>`.
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn fail_renewals_with(&self, error: ProviderError) {
        *self.renew_error.lock().unwrap() = Some(error);
    }

    /// Runs `hook` inside the next `sync_emails` call, before it returns.
    pub fn before_next_sync(&self, hook: BoxFuture<'static, ()>) {
        *self.before_sync.lock().unwrap() = Some(hook);
    }

    /// Registry serving this adapter for every provider type.
    pub fn registry(self: &Arc<Self>) -> ProviderRegistry {
        let mut registry = ProviderRegistry::new();
        for provider_type in [ProviderType::Gmail, ProviderType::Outlook, ProviderType::Imap] {
            let adapter = self.clone();
            registry.register(
                provider_type.as_str(),
                move |_: &ProviderWithToken| -> ProviderResult<Arc<dyn MailProvider>> {
                    Ok(adapter.clone() as Arc<dyn MailProvider>)
                },
            );
        }
        registry
    }
}

#[async_trait]
impl MailProvider for ScriptedProvider {
    fn provider_type(&self) -> ProviderType {
        self.provider_type
    }

    async fn sync_emails(&self, options: &SyncOptions) -> ProviderResult<SyncResult> {
        self.seen.lock().unwrap().push(options.clone());
        let hook = self.before_sync.lock().unwrap().take();
        if let Some(hook) = hook {
            hook.await;
        }
        self.results
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Err(ProviderError::Provider("script exhausted".into())))
    }

    async fn list_messages(&self, _query: &MessageQuery) -> ProviderResult<MessagePage> {
        Ok(MessagePage::default())
    }

    async fn get_message(&self, remote_id: &str) -> ProviderResult<RemoteMessage> {
        Err(ProviderError::NotFound(remote_id.to_string()))
    }

    async fn send_message(&self, _message: &OutgoingMessage) -> ProviderResult<String> {
        Err(ProviderError::Unsupported("send".into()))
    }

    async fn modify_labels(
        &self,
        _remote_id: &str,
        _add: &[String],
        _remove: &[String],
    ) -> ProviderResult<()> {
        Ok(())
    }

    async fn list_folders(&self) -> ProviderResult<Vec<RemoteFolder>> {
        Ok(vec![RemoteFolder {
            path: "INBOX".into(),
            name: "Inbox".into(),
            delimiter: None,
            special_use: None,
            is_selectable: true,
        }])
    }

    async fn create_subscription(
        &self,
        request: &SubscriptionRequest,
    ) -> ProviderResult<RemoteSubscription> {
        let mut calls = self.calls.lock().unwrap();
        calls.push("create".to_string());
        Ok(RemoteSubscription {
            external_id: format!("sub-{}", calls.len()),
            resource: "me/mailFolders('Inbox')/messages".into(),
            expires_at: request.expires_at,
        })
    }

    async fn renew_subscription(
        &self,
        external_id: &str,
        request: &SubscriptionRequest,
    ) -> ProviderResult<RemoteSubscription> {
        if let Some(err) = self.renew_error.lock().unwrap().clone() {
            return Err(err);
        }
        self.calls
            .lock()
            .unwrap()
            .push(format!("renew:{}", external_id));
        Ok(RemoteSubscription {
            external_id: external_id.to_string(),
            resource: "me/mailFolders('Inbox')/messages".into(),
            expires_at: request.expires_at,
        })
    }

    async fn delete_subscription(&self, external_id: &str) -> ProviderResult<()> {
        self.calls
            .lock()
            .unwrap()
            .push(format!("delete:{}", external_id));
        Ok(())
    }
}

/// Serves provider rows straight from the database with a fixed token.
pub struct DbTokens(pub DatabaseConnection);

#[async_trait]
impl TokenSupplier for DbTokens {
    async fn get_provider_with_token(&self, provider_id: Uuid) -> ProviderResult<ProviderWithToken> {
        let provider = provider_config::Entity::find_by_id(provider_id)
            .one(&self.0)
            .await
            .map_err(|e| ProviderError::Provider(e.to_string()))?
            .ok_or_else(|| ProviderError::NotFound(provider_id.to_string()))?;
        Ok(ProviderWithToken {
            provider,
            access_token: "token".into(),
        })
    }
}
