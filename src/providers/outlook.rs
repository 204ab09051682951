//! Microsoft Graph adapter. The cursor is the inbox `@odata.deltaLink`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Deserialize;

use super::error::{ProviderError, ProviderResult};
use super::http;
use super::types::*;
use super::MailProvider;

const MESSAGE_FIELDS: &str = "id,conversationId,internetMessageId,subject,from,toRecipients,\
bodyPreview,sentDateTime,receivedDateTime,createdDateTime,lastModifiedDateTime,isRead,flag,\
categories,parentFolderId";
const PAGE_SIZE: u32 = 100;
const MAX_FOLDER_DEPTH: usize = 4;
const SUBSCRIPTION_RESOURCE: &str = "me/mailFolders('Inbox')/messages";

pub struct OutlookProvider {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
    email: String,
}

#[derive(Debug, Deserialize)]
struct Page<T> {
    #[serde(default = "Vec::new")]
    value: Vec<T>,
    #[serde(rename = "@odata.nextLink")]
    next_link: Option<String>,
    #[serde(rename = "@odata.deltaLink")]
    delta_link: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GraphMessage {
    id: String,
    conversation_id: Option<String>,
    internet_message_id: Option<String>,
    subject: Option<String>,
    from: Option<Recipient>,
    #[serde(default)]
    to_recipients: Vec<Recipient>,
    body_preview: Option<String>,
    sent_date_time: Option<DateTime<Utc>>,
    received_date_time: Option<DateTime<Utc>>,
    created_date_time: Option<DateTime<Utc>>,
    last_modified_date_time: Option<DateTime<Utc>>,
    is_read: Option<bool>,
    flag: Option<Flag>,
    #[serde(default)]
    categories: Vec<String>,
    #[serde(rename = "@removed")]
    removed: Option<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Recipient {
    email_address: Option<EmailAddress>,
}

#[derive(Debug, Deserialize)]
struct EmailAddress {
    address: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Flag {
    flag_status: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MailFolder {
    id: String,
    display_name: String,
    #[serde(default)]
    child_folder_count: u32,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Subscription {
    id: String,
    resource: String,
    expiration_date_time: DateTime<Utc>,
}

#[derive(Debug, Deserialize)]
struct CreatedMessage {
    id: String,
}

impl Recipient {
    fn address(&self) -> Option<String> {
        self.email_address
            .as_ref()
            .and_then(|e| e.address.as_deref())
            .map(str::trim)
            .filter(|a| !a.is_empty())
            .map(str::to_string)
    }
}

impl OutlookProvider {
    pub fn new(http: reqwest::Client, base_url: String, access_token: String, email: String) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token,
            email,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    async fn get_url<T: DeserializeOwned>(&self, url: &str) -> ProviderResult<T> {
        let response = self
            .http
            .get(url)
            .bearer_auth(&self.access_token)
            .header("Prefer", format!("odata.maxpagesize={}", PAGE_SIZE))
            .send()
            .await?;
        http::read_json(response).await
    }

    async fn send_json<T: DeserializeOwned>(
        &self,
        method: reqwest::Method,
        path: &str,
        body: &serde_json::Value,
    ) -> ProviderResult<T> {
        let response = self
            .http
            .request(method, self.url(path))
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await?;
        http::read_json(response).await
    }

    /// Display name of the inbox, used as its folder path.
    async fn inbox_path(&self) -> ProviderResult<String> {
        let inbox: MailFolder = self.get_url(&self.url("/me/mailFolders/inbox")).await?;
        Ok(inbox.display_name)
    }

    async fn full_sync(&self, options: &SyncOptions) -> ProviderResult<SyncResult> {
        let inbox = self.inbox_path().await?;

        let mut changes = Vec::new();
        let mut next = Some(format!(
            "{}?$top={}&$select={}&$orderby=receivedDateTime desc",
            self.url("/me/mailFolders/inbox/messages"),
            options.max_messages.clamp(1, PAGE_SIZE),
            MESSAGE_FIELDS
        ));
        while let Some(url) = next.take() {
            let page: Page<GraphMessage> = self.get_url(&url).await?;
            for message in page.value {
                if changes.len() as u32 >= options.max_messages {
                    break;
                }
                changes.push(MessageChange::Upsert(to_remote_message(message, &inbox)));
            }
            if (changes.len() as u32) < options.max_messages {
                next = page.next_link;
            }
        }

        // One delta round establishes the baseline link; its pages are not needed.
        let mut url = format!("{}?$select=id", self.url("/me/mailFolders/inbox/messages/delta"));
        let delta_link = loop {
            let page: Page<serde_json::Value> = self.get_url(&url).await?;
            match (page.next_link, page.delta_link) {
                (Some(next_link), _) => url = next_link,
                (None, Some(delta_link)) => break delta_link,
                (None, None) => {
                    return Err(ProviderError::Provider(
                        "delta round ended without a deltaLink".to_string(),
                    ))
                }
            }
        };

        let new = changes.len() as u32;
        Ok(SyncResult::from_changes(changes, new, Some(delta_link), Vec::new()))
    }

    async fn incremental_sync(&self, delta_link: &str) -> ProviderResult<SyncResult> {
        let inbox = self.inbox_path().await?;

        let mut changes = Vec::new();
        let mut new = 0u32;
        let mut url = delta_link.to_string();
        let next_cursor = loop {
            let page: Page<GraphMessage> = match self.get_url(&url).await {
                Ok(page) => page,
                Err(err) => return Err(cursor_error(err)),
            };
            for message in page.value {
                if message.removed.is_some() {
                    changes.push(MessageChange::Deleted {
                        remote_id: message.id,
                    });
                    continue;
                }
                if message.created_date_time.is_some()
                    && message.created_date_time == message.last_modified_date_time
                {
                    new += 1;
                }
                changes.push(MessageChange::Upsert(to_remote_message(message, &inbox)));
            }
            match (page.next_link, page.delta_link) {
                (Some(next_link), _) => url = next_link,
                (None, Some(link)) => break link,
                (None, None) => {
                    return Err(ProviderError::Provider(
                        "delta page without nextLink or deltaLink".to_string(),
                    ))
                }
            }
        };
        tracing::debug!(changes = changes.len(), "Graph delta drained");

        Ok(SyncResult::from_changes(changes, new, Some(next_cursor), Vec::new()))
    }

    /// Walks the folder tree breadth-first down to `MAX_FOLDER_DEPTH`.
    async fn collect_folders(&self) -> ProviderResult<Vec<RemoteFolder>> {
        let mut out = Vec::new();
        let mut pending = vec![(
            format!("{}?$top={}", self.url("/me/mailFolders"), PAGE_SIZE),
            None::<String>,
            0usize,
        )];
        let mut cursor = 0;
        while cursor < pending.len() {
            let (url, parent_path, depth) = pending[cursor].clone();
            cursor += 1;
            let mut next = Some(url);
            while let Some(url) = next.take() {
                let page: Page<MailFolder> = self.get_url(&url).await?;
                for folder in page.value {
                    let path = match &parent_path {
                        Some(parent) => format!("{}/{}", parent, folder.display_name),
                        None => folder.display_name.clone(),
                    };
                    if folder.child_folder_count > 0 && depth + 1 < MAX_FOLDER_DEPTH {
                        let children = self.url(&format!("/me/mailFolders/{}/childFolders", folder.id));
                        pending.push((
                            format!("{}?$top={}", children, PAGE_SIZE),
                            Some(path.clone()),
                            depth + 1,
                        ));
                    }
                    out.push(RemoteFolder {
                        special_use: parent_path
                            .is_none()
                            .then(|| SpecialUse::from_name(&folder.display_name))
                            .flatten(),
                        path,
                        name: folder.display_name,
                        delimiter: Some("/".to_string()),
                        is_selectable: true,
                    });
                }
                next = page.next_link;
            }
        }
        Ok(out)
    }

    fn subscription(sub: Subscription) -> RemoteSubscription {
        RemoteSubscription {
            external_id: sub.id,
            resource: sub.resource,
            expires_at: sub.expiration_date_time,
        }
    }
}

/// Graph reports a stale delta token as 410 or as a `resyncRequired`/`syncStateNotFound` error.
fn cursor_error(err: ProviderError) -> ProviderError {
    match err {
        ProviderError::NotFound(message) => ProviderError::CursorInvalid(message),
        ProviderError::Provider(message)
            if message.contains("resync") || message.contains("syncState") =>
        {
            ProviderError::CursorInvalid(message)
        }
        other => other,
    }
}

#[async_trait]
impl MailProvider for OutlookProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Outlook
    }

    async fn sync_emails(&self, options: &SyncOptions) -> ProviderResult<SyncResult> {
        match (options.sync_type, options.cursor.as_deref()) {
            (SyncType::Incremental, Some(cursor)) => self.incremental_sync(cursor).await,
            _ => self.full_sync(options).await,
        }
    }

    async fn list_messages(&self, query: &MessageQuery) -> ProviderResult<MessagePage> {
        let url = match &query.page_token {
            Some(next_link) => next_link.clone(),
            None => format!(
                "{}?$top={}&$select={}",
                self.url(&format!(
                    "/me/mailFolders/{}/messages",
                    query.folder.as_deref().unwrap_or("inbox")
                )),
                query.limit.clamp(1, PAGE_SIZE),
                MESSAGE_FIELDS
            ),
        };
        let folder = query.folder.clone().unwrap_or_else(|| INBOX.to_string());
        let page: Page<GraphMessage> = self.get_url(&url).await?;
        Ok(MessagePage {
            messages: page
                .value
                .into_iter()
                .map(|m| to_remote_message(m, &folder))
                .collect(),
            next_page_token: page.next_link,
        })
    }

    async fn get_message(&self, remote_id: &str) -> ProviderResult<RemoteMessage> {
        let message: GraphMessage = self
            .get_url(&format!(
                "{}?$select={}",
                self.url(&format!("/me/messages/{}", remote_id)),
                MESSAGE_FIELDS
            ))
            .await?;
        Ok(to_remote_message(message, INBOX))
    }

    async fn send_message(&self, message: &OutgoingMessage) -> ProviderResult<String> {
        let recipients = |list: &[String]| -> Vec<serde_json::Value> {
            list.iter()
                .map(|a| serde_json::json!({ "emailAddress": { "address": a } }))
                .collect()
        };
        let (content_type, content) = match &message.html_body {
            Some(html) => ("HTML", html.as_str()),
            None => ("Text", message.text_body.as_str()),
        };
        let draft: CreatedMessage = self
            .send_json(
                reqwest::Method::POST,
                "/me/messages",
                &serde_json::json!({
                    "subject": message.subject,
                    "body": { "contentType": content_type, "content": content },
                    "toRecipients": recipients(&message.to),
                    "ccRecipients": recipients(&message.cc),
                }),
            )
            .await?;

        let response = self
            .http
            .post(self.url(&format!("/me/messages/{}/send", draft.id)))
            .bearer_auth(&self.access_token)
            .header(reqwest::header::CONTENT_LENGTH, "0")
            .send()
            .await?;
        http::check_status(response).await?;
        tracing::debug!(from = %self.email, "Sent message through Graph");
        Ok(draft.id)
    }

    /// Labels map onto Graph categories.
    async fn modify_labels(
        &self,
        remote_id: &str,
        add: &[String],
        remove: &[String],
    ) -> ProviderResult<()> {
        let current: GraphMessage = self
            .get_url(&format!(
                "{}?$select=id,categories",
                self.url(&format!("/me/messages/{}", remote_id))
            ))
            .await?;
        let mut categories: Vec<String> = current
            .categories
            .into_iter()
            .filter(|c| !remove.contains(c))
            .collect();
        for label in add {
            if !categories.contains(label) {
                categories.push(label.clone());
            }
        }
        let _: serde_json::Value = self
            .send_json(
                reqwest::Method::PATCH,
                &format!("/me/messages/{}", remote_id),
                &serde_json::json!({ "categories": categories }),
            )
            .await?;
        Ok(())
    }

    async fn list_folders(&self) -> ProviderResult<Vec<RemoteFolder>> {
        self.collect_folders().await
    }

    async fn create_subscription(
        &self,
        request: &SubscriptionRequest,
    ) -> ProviderResult<RemoteSubscription> {
        let sub: Subscription = self
            .send_json(
                reqwest::Method::POST,
                "/subscriptions",
                &serde_json::json!({
                    "changeType": "created,updated,deleted",
                    "notificationUrl": request.notification_url,
                    "resource": SUBSCRIPTION_RESOURCE,
                    "expirationDateTime": request.expires_at.to_rfc3339(),
                    "clientState": request.client_state,
                }),
            )
            .await?;
        Ok(Self::subscription(sub))
    }

    async fn renew_subscription(
        &self,
        external_id: &str,
        request: &SubscriptionRequest,
    ) -> ProviderResult<RemoteSubscription> {
        let sub: Subscription = self
            .send_json(
                reqwest::Method::PATCH,
                &format!("/subscriptions/{}", external_id),
                &serde_json::json!({ "expirationDateTime": request.expires_at.to_rfc3339() }),
            )
            .await?;
        Ok(Self::subscription(sub))
    }

    async fn delete_subscription(&self, external_id: &str) -> ProviderResult<()> {
        let response = self
            .http
            .delete(self.url(&format!("/subscriptions/{}", external_id)))
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        match http::check_status(response).await {
            Ok(_) | Err(ProviderError::NotFound(_)) => Ok(()),
            Err(err) => Err(err),
        }
    }
}

fn to_remote_message(message: GraphMessage, folder_path: &str) -> RemoteMessage {
    let received_at = message.received_date_time.unwrap_or_else(Utc::now);
    let folder = SpecialUse::from_name(folder_path)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|| folder_path.to_string());
    RemoteMessage {
        remote_id: message.id,
        thread_id: message.conversation_id,
        message_id: message.internet_message_id,
        subject: message.subject.unwrap_or_default(),
        from: message
            .from
            .as_ref()
            .and_then(Recipient::address)
            .unwrap_or_default(),
        to: message
            .to_recipients
            .iter()
            .filter_map(Recipient::address)
            .collect(),
        snippet: message.body_preview.unwrap_or_default(),
        sent_at: message.sent_date_time.unwrap_or(received_at),
        received_at,
        is_read: message.is_read.unwrap_or(false),
        is_starred: message
            .flag
            .and_then(|f| f.flag_status)
            .is_some_and(|s| s.eq_ignore_ascii_case("flagged")),
        folder,
        folder_path: folder_path.to_string(),
        labels: message.categories,
    }
}
