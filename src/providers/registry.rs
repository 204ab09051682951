use std::collections::HashMap;
use std::sync::Arc;

use super::error::{ProviderError, ProviderResult};
use super::gmail::GmailProvider;
use super::imap::ImapProvider;
use super::outlook::OutlookProvider;
use super::token::ProviderWithToken;
use super::types::ProviderType;
use super::MailProvider;
use crate::config::{OAuthConfig, WebhookConfig};

/// Builds an adapter bound to one provider row and its live credential.
pub trait ProviderFactory: Send + Sync {
    fn build(&self, session: &ProviderWithToken) -> ProviderResult<Arc<dyn MailProvider>>;
}

impl<F> ProviderFactory for F
where
    F: Fn(&ProviderWithToken) -> ProviderResult<Arc<dyn MailProvider>> + Send + Sync,
{
    fn build(&self, session: &ProviderWithToken) -> ProviderResult<Arc<dyn MailProvider>> {
        self(session)
    }
}

/// Adapter factories keyed by the provider-type string stored on each row.
#[derive(Clone, Default)]
pub struct ProviderRegistry {
    factories: HashMap<String, Arc<dyn ProviderFactory>>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with the Gmail, Outlook and IMAP adapters.
    pub fn with_defaults(oauth: &OAuthConfig, webhook: &WebhookConfig) -> Self {
        let mut registry = Self::new();
        let http = super::http::build_client();

        let gmail_base = oauth.gmail_api_base.clone();
        let topic = webhook.gmail_topic.clone();
        let gmail_http = http.clone();
        registry.register(
            ProviderType::Gmail.as_str(),
            move |session: &ProviderWithToken| -> ProviderResult<Arc<dyn MailProvider>> {
                Ok(Arc::new(GmailProvider::new(
                    gmail_http.clone(),
                    gmail_base.clone(),
                    session.access_token.clone(),
                    session.provider.email.clone(),
                    topic.clone(),
                )))
            },
        );

        let graph_base = oauth.graph_api_base.clone();
        registry.register(
            ProviderType::Outlook.as_str(),
            move |session: &ProviderWithToken| -> ProviderResult<Arc<dyn MailProvider>> {
                Ok(Arc::new(OutlookProvider::new(
                    http.clone(),
                    graph_base.clone(),
                    session.access_token.clone(),
                    session.provider.email.clone(),
                )))
            },
        );

        registry.register(
            ProviderType::Imap.as_str(),
            |session: &ProviderWithToken| -> ProviderResult<Arc<dyn MailProvider>> {
                Ok(Arc::new(ImapProvider::from_session(session)?))
            },
        );

        registry
    }

    pub fn register(&mut self, provider_type: &str, factory: impl ProviderFactory + 'static) {
        self.factories
            .insert(provider_type.to_string(), Arc::new(factory));
    }

    pub fn build(&self, session: &ProviderWithToken) -> ProviderResult<Arc<dyn MailProvider>> {
        let key = session.provider.provider_type.as_str();
        let factory = self.factories.get(key).ok_or_else(|| {
            ProviderError::Unsupported(format!("no adapter registered for '{}'", key))
        })?;
        factory.build(session)
    }

    pub fn supports(&self, provider_type: &str) -> bool {
        self.factories.contains_key(provider_type)
    }
}
