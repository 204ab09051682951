use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
use base64::Engine;
use serde::Deserialize;

use crate::providers::INBOX;

/// Provider-neutral change notification handed to the lifecycle manager.
#[derive(Debug, Clone, PartialEq)]
pub struct WebhookNotification {
    /// Provider-side subscription id, matched against `external_id`.
    pub subscription_id: String,
    pub client_state: Option<String>,
    pub resource: Option<String>,
    pub change_type: Option<String>,
}

/// Body of a Microsoft Graph change notification POST.
#[derive(Debug, Deserialize)]
pub struct GraphNotificationBatch {
    #[serde(default)]
    pub value: Vec<GraphNotification>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GraphNotification {
    pub subscription_id: String,
    pub client_state: Option<String>,
    pub resource: Option<String>,
    pub change_type: Option<String>,
}

impl From<GraphNotification> for WebhookNotification {
    fn from(n: GraphNotification) -> Self {
        Self {
            subscription_id: n.subscription_id,
            client_state: n.client_state,
            resource: n.resource,
            change_type: n.change_type,
        }
    }
}

/// Google Cloud Pub/Sub push envelope.
#[derive(Debug, Deserialize)]
pub struct PubSubEnvelope {
    pub message: PubSubMessage,
    #[serde(default)]
    pub subscription: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PubSubMessage {
    #[serde(default)]
    pub data: Option<String>,
    #[serde(default)]
    pub message_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailPush {
    email_address: String,
}

/// Decodes a Gmail push. The push token from the endpoint's query string
/// serves as the client secret.
pub fn gmail_notification(
    envelope: &PubSubEnvelope,
    token: Option<String>,
) -> Option<WebhookNotification> {
    let data = envelope.message.data.as_deref()?;
    let decoded = BASE64_STANDARD.decode(data).ok()?;
    let push: GmailPush = serde_json::from_slice(&decoded).ok()?;
    Some(WebhookNotification {
        subscription_id: format!("gmail:{}", push.email_address.trim().to_lowercase()),
        client_state: token,
        resource: Some(INBOX.to_string()),
        change_type: Some("history".to_string()),
    })
}
