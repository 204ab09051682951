pub mod error;
pub mod gmail;
pub mod http;
pub mod imap;
pub mod outlook;
pub mod registry;
#[cfg(test)]
pub mod testing;
pub mod token;
pub mod types;

use async_trait::async_trait;

pub use error::{ProviderError, ProviderResult};
pub use registry::{ProviderFactory, ProviderRegistry};
pub use token::{ProviderWithToken, StoredTokenSupplier, TokenSupplier};
pub use types::*;

/// Uniform capability set implemented by every provider adapter.
/// Each adapter hides its own pagination, cursor format and error shapes.
#[async_trait]
pub trait MailProvider: Send + Sync {
    fn provider_type(&self) -> ProviderType;

    /// Full sync without a cursor establishes one; incremental sync returns the
    /// changes since `options.cursor` with all pages drained.
    async fn sync_emails(&self, options: &SyncOptions) -> ProviderResult<SyncResult>;

    async fn list_messages(&self, query: &MessageQuery) -> ProviderResult<MessagePage>;

    async fn get_message(&self, remote_id: &str) -> ProviderResult<RemoteMessage>;

    /// Sends a message and returns its provider id.
    async fn send_message(&self, message: &OutgoingMessage) -> ProviderResult<String>;

    async fn modify_labels(
        &self,
        remote_id: &str,
        add: &[String],
        remove: &[String],
    ) -> ProviderResult<()>;

    async fn list_folders(&self) -> ProviderResult<Vec<RemoteFolder>>;

    async fn create_subscription(
        &self,
        _request: &SubscriptionRequest,
    ) -> ProviderResult<RemoteSubscription> {
        Err(ProviderError::Unsupported(format!(
            "{} has no push subscriptions",
            self.provider_type()
        )))
    }

    async fn renew_subscription(
        &self,
        _external_id: &str,
        _request: &SubscriptionRequest,
    ) -> ProviderResult<RemoteSubscription> {
        Err(ProviderError::Unsupported(format!(
            "{} has no push subscriptions",
            self.provider_type()
        )))
    }

    async fn delete_subscription(&self, _external_id: &str) -> ProviderResult<()> {
        Err(ProviderError::Unsupported(format!(
            "{} has no push subscriptions",
            self.provider_type()
        )))
    }
}
