//! Gmail REST adapter. The cursor is the mailbox history id.

use async_trait::async_trait;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use chrono::{DateTime, TimeZone, Utc};
use futures::{StreamExt, TryStreamExt};
use mail_builder::MessageBuilder;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use std::collections::BTreeSet;

use super::error::{ProviderError, ProviderResult};
use super::http;
use super::types::*;
use super::MailProvider;

const PAGE_SIZE: u32 = 500;
const FETCH_CONCURRENCY: usize = 8;

const SYSTEM_LABELS: [&str; 9] = [
    "INBOX", "SENT", "DRAFT", "TRASH", "SPAM", "UNREAD", "STARRED", "IMPORTANT", "CHAT",
];

pub struct GmailProvider {
    http: reqwest::Client,
    base_url: String,
    access_token: String,
    email: String,
    topic: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Profile {
    history_id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageRef {
    id: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct MessageList {
    #[serde(default)]
    messages: Vec<MessageRef>,
    next_page_token: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct GmailMessage {
    id: String,
    thread_id: Option<String>,
    #[serde(default)]
    label_ids: Vec<String>,
    #[serde(default)]
    snippet: String,
    internal_date: Option<String>,
    payload: Option<MessagePayload>,
}

#[derive(Debug, Deserialize)]
struct MessagePayload {
    #[serde(default)]
    headers: Vec<Header>,
}

#[derive(Debug, Deserialize)]
struct Header {
    name: String,
    value: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryPage {
    #[serde(default)]
    history: Vec<HistoryRecord>,
    next_page_token: Option<String>,
    history_id: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct HistoryRecord {
    #[serde(default)]
    messages_added: Vec<HistoryMessage>,
    #[serde(default)]
    messages_deleted: Vec<HistoryMessage>,
    #[serde(default)]
    labels_added: Vec<HistoryMessage>,
    #[serde(default)]
    labels_removed: Vec<HistoryMessage>,
}

#[derive(Debug, Deserialize)]
struct HistoryMessage {
    message: MessageRef,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct LabelList {
    #[serde(default)]
    labels: Vec<Label>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct Label {
    id: String,
    name: String,
    #[serde(rename = "type")]
    label_type: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct WatchResponse {
    expiration: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SentMessage {
    id: String,
}

impl GmailProvider {
    pub fn new(
        http: reqwest::Client,
        base_url: String,
        access_token: String,
        email: String,
        topic: Option<String>,
    ) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            access_token,
            email,
            topic,
        }
    }

    async fn get<T: DeserializeOwned>(
        &self,
        path: &str,
        query: &[(&str, String)],
    ) -> ProviderResult<T> {
        let response = self
            .http
            .get(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.access_token)
            .query(query)
            .send()
            .await?;
        http::read_json(response).await
    }

    async fn post<T: DeserializeOwned>(
        &self,
        path: &str,
        body: &serde_json::Value,
    ) -> ProviderResult<T> {
        let response = self
            .http
            .post(format!("{}{}", self.base_url, path))
            .bearer_auth(&self.access_token)
            .json(body)
            .send()
            .await?;
        http::read_json(response).await
    }

    async fn fetch_message(&self, id: &str) -> ProviderResult<RemoteMessage> {
        let message: GmailMessage = self
            .get(
                &format!("/messages/{}", id),
                &[
                    ("format", "metadata".to_string()),
                    ("metadataHeaders", "Subject".to_string()),
                    ("metadataHeaders", "From".to_string()),
                    ("metadataHeaders", "To".to_string()),
                    ("metadataHeaders", "Date".to_string()),
                    ("metadataHeaders", "Message-ID".to_string()),
                ],
            )
            .await?;
        Ok(to_remote_message(message))
    }

    /// Fetches the given messages; ones deleted in the meantime become deletions.
    async fn fetch_changes(&self, ids: Vec<String>) -> ProviderResult<Vec<MessageChange>> {
        futures::stream::iter(ids)
            .map(|id| async move {
                match self.fetch_message(&id).await {
                    Ok(message) => Ok(MessageChange::Upsert(message)),
                    Err(ProviderError::NotFound(_)) => Ok(MessageChange::Deleted { remote_id: id }),
                    Err(err) => Err(err),
                }
            })
            .buffered(FETCH_CONCURRENCY)
            .try_collect()
            .await
    }

    async fn list_ids(&self, limit: u32, label: Option<&str>) -> ProviderResult<Vec<String>> {
        let mut ids = Vec::new();
        let mut page_token: Option<String> = None;
        loop {
            let remaining = limit.saturating_sub(ids.len() as u32);
            if remaining == 0 {
                break;
            }
            let mut query = vec![("maxResults", remaining.min(PAGE_SIZE).to_string())];
            if let Some(label) = label {
                query.push(("labelIds", label.to_string()));
            }
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }
            let page: MessageList = self.get("/messages", &query).await?;
            ids.extend(page.messages.into_iter().map(|m| m.id));
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }
        ids.truncate(limit as usize);
        Ok(ids)
    }

    async fn full_sync(&self, options: &SyncOptions) -> ProviderResult<SyncResult> {
        // Read the history id first so changes made while listing are replayed next time.
        let profile: Profile = self.get("/profile", &[]).await?;
        let ids = self.list_ids(options.max_messages, None).await?;
        tracing::debug!(count = ids.len(), "Gmail full sync listed messages");
        let changes = self.fetch_changes(ids).await?;
        let new = changes
            .iter()
            .filter(|c| matches!(c, MessageChange::Upsert(_)))
            .count() as u32;
        Ok(SyncResult::from_changes(
            changes,
            new,
            Some(profile.history_id),
            Vec::new(),
        ))
    }

    async fn incremental_sync(&self, cursor: &str) -> ProviderResult<SyncResult> {
        let start: u64 = cursor
            .trim()
            .parse()
            .map_err(|_| ProviderError::CursorInvalid(format!("malformed history id '{}'", cursor)))?;

        let mut latest = start;
        let mut added = BTreeSet::new();
        let mut touched = BTreeSet::new();
        let mut deleted = BTreeSet::new();
        let mut page_token: Option<String> = None;

        loop {
            let mut query = vec![("startHistoryId", start.to_string())];
            if let Some(token) = &page_token {
                query.push(("pageToken", token.clone()));
            }
            let page: HistoryPage = match self.get("/history", &query).await {
                Ok(page) => page,
                Err(ProviderError::NotFound(message)) => {
                    return Err(ProviderError::CursorInvalid(message))
                }
                Err(err) => return Err(err),
            };

            for record in page.history {
                for m in record.messages_added {
                    added.insert(m.message.id.clone());
                    touched.insert(m.message.id);
                }
                for m in record.labels_added.into_iter().chain(record.labels_removed) {
                    touched.insert(m.message.id);
                }
                for m in record.messages_deleted {
                    deleted.insert(m.message.id);
                }
            }
            if let Some(id) = page.history_id.and_then(|h| h.parse::<u64>().ok()) {
                latest = latest.max(id);
            }
            match page.next_page_token {
                Some(token) => page_token = Some(token),
                None => break,
            }
        }

        let to_fetch: Vec<String> = touched.difference(&deleted).cloned().collect();
        let mut changes = self.fetch_changes(to_fetch).await?;
        changes.extend(
            deleted
                .into_iter()
                .map(|remote_id| MessageChange::Deleted { remote_id }),
        );
        let new = changes
            .iter()
            .filter(|c| matches!(c, MessageChange::Upsert(m) if added.contains(&m.remote_id)))
            .count() as u32;

        Ok(SyncResult::from_changes(
            changes,
            new,
            Some(latest.to_string()),
            Vec::new(),
        ))
    }

    fn build_raw(&self, message: &OutgoingMessage) -> ProviderResult<String> {
        let mut builder = MessageBuilder::new()
            .from(self.email.as_str())
            .to(message.to.iter().map(String::as_str).collect::<Vec<_>>())
            .subject(message.subject.as_str())
            .text_body(message.text_body.as_str());
        if !message.cc.is_empty() {
            builder = builder.cc(message.cc.iter().map(String::as_str).collect::<Vec<_>>());
        }
        if let Some(html) = &message.html_body {
            builder = builder.html_body(html.as_str());
        }
        let raw = builder
            .write_to_vec()
            .map_err(|e| ProviderError::Provider(format!("build message: {}", e)))?;
        Ok(URL_SAFE_NO_PAD.encode(raw))
    }

    async fn watch(&self) -> ProviderResult<RemoteSubscription> {
        let topic = self.topic.as_deref().ok_or_else(|| {
            ProviderError::Unsupported("no Pub/Sub topic configured for Gmail push".to_string())
        })?;
        let response: WatchResponse = self
            .post(
                "/watch",
                &serde_json::json!({ "topicName": topic, "labelIds": [INBOX] }),
            )
            .await?;
        let expires_at = response
            .expiration
            .and_then(|ms| ms.parse::<i64>().ok())
            .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
            .unwrap_or_else(|| Utc::now() + chrono::Duration::days(7));
        Ok(RemoteSubscription {
            external_id: format!("gmail:{}", self.email.to_lowercase()),
            resource: INBOX.to_string(),
            expires_at,
        })
    }
}

#[async_trait]
impl MailProvider for GmailProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Gmail
    }

    async fn sync_emails(&self, options: &SyncOptions) -> ProviderResult<SyncResult> {
        match (options.sync_type, options.cursor.as_deref()) {
            (SyncType::Incremental, Some(cursor)) => self.incremental_sync(cursor).await,
            _ => self.full_sync(options).await,
        }
    }

    async fn list_messages(&self, query: &MessageQuery) -> ProviderResult<MessagePage> {
        let mut params = vec![("maxResults", query.limit.clamp(1, PAGE_SIZE).to_string())];
        if let Some(folder) = &query.folder {
            params.push(("labelIds", folder.clone()));
        }
        if let Some(token) = &query.page_token {
            params.push(("pageToken", token.clone()));
        }
        let page: MessageList = self.get("/messages", &params).await?;
        let messages = futures::stream::iter(page.messages)
            .map(|m| async move { self.fetch_message(&m.id).await })
            .buffered(FETCH_CONCURRENCY)
            .try_collect()
            .await?;
        Ok(MessagePage {
            messages,
            next_page_token: page.next_page_token,
        })
    }

    async fn get_message(&self, remote_id: &str) -> ProviderResult<RemoteMessage> {
        self.fetch_message(remote_id).await
    }

    async fn send_message(&self, message: &OutgoingMessage) -> ProviderResult<String> {
        let raw = self.build_raw(message)?;
        let sent: SentMessage = self
            .post("/messages/send", &serde_json::json!({ "raw": raw }))
            .await?;
        Ok(sent.id)
    }

    async fn modify_labels(
        &self,
        remote_id: &str,
        add: &[String],
        remove: &[String],
    ) -> ProviderResult<()> {
        let _: serde_json::Value = self
            .post(
                &format!("/messages/{}/modify", remote_id),
                &serde_json::json!({ "addLabelIds": add, "removeLabelIds": remove }),
            )
            .await?;
        Ok(())
    }

    async fn list_folders(&self) -> ProviderResult<Vec<RemoteFolder>> {
        let list: LabelList = self.get("/labels", &[]).await?;
        Ok(list
            .labels
            .into_iter()
            .filter_map(|label| {
                let system = label.label_type.as_deref() == Some("system");
                if system {
                    let special_use = system_special_use(&label.id)?;
                    Some(RemoteFolder {
                        path: label.id,
                        name: label.name,
                        delimiter: None,
                        special_use: Some(special_use),
                        is_selectable: true,
                    })
                } else {
                    Some(RemoteFolder {
                        special_use: SpecialUse::from_name(&label.name),
                        path: label.name.clone(),
                        name: label.name.rsplit('/').next().unwrap_or(&label.name).to_string(),
                        delimiter: Some("/".to_string()),
                        is_selectable: true,
                    })
                }
            })
            .collect())
    }

    async fn create_subscription(
        &self,
        _request: &SubscriptionRequest,
    ) -> ProviderResult<RemoteSubscription> {
        self.watch().await
    }

    /// A repeated `watch` call extends the existing registration.
    async fn renew_subscription(
        &self,
        _external_id: &str,
        _request: &SubscriptionRequest,
    ) -> ProviderResult<RemoteSubscription> {
        self.watch().await
    }

    async fn delete_subscription(&self, _external_id: &str) -> ProviderResult<()> {
        let response = self
            .http
            .post(format!("{}/stop", self.base_url))
            .bearer_auth(&self.access_token)
            .send()
            .await?;
        http::check_status(response).await?;
        Ok(())
    }
}

fn system_special_use(label_id: &str) -> Option<SpecialUse> {
    match label_id {
        "INBOX" => Some(SpecialUse::Inbox),
        "SENT" => Some(SpecialUse::Sent),
        "DRAFT" => Some(SpecialUse::Drafts),
        "TRASH" => Some(SpecialUse::Trash),
        "SPAM" => Some(SpecialUse::Junk),
        "STARRED" => Some(SpecialUse::Flagged),
        _ => None,
    }
}

/// Folder of a message from its system labels; no location label means archived.
fn folder_of(labels: &[String]) -> (String, String) {
    let has = |l: &str| labels.iter().any(|x| x == l);
    let (special, path) = if has("INBOX") {
        (SpecialUse::Inbox, "INBOX")
    } else if has("TRASH") {
        (SpecialUse::Trash, "TRASH")
    } else if has("SPAM") {
        (SpecialUse::Junk, "SPAM")
    } else if has("DRAFT") {
        (SpecialUse::Drafts, "DRAFT")
    } else if has("SENT") {
        (SpecialUse::Sent, "SENT")
    } else {
        (SpecialUse::Archive, "ARCHIVE")
    };
    (special.as_str().to_string(), path.to_string())
}

fn to_remote_message(message: GmailMessage) -> RemoteMessage {
    let headers = message
        .payload
        .map(|p| p.headers)
        .unwrap_or_default();
    let header = |name: &str| {
        headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .map(|h| h.value.clone())
    };

    let received_at = message
        .internal_date
        .as_deref()
        .and_then(|ms| ms.parse::<i64>().ok())
        .and_then(|ms| Utc.timestamp_millis_opt(ms).single())
        .unwrap_or_else(Utc::now);
    let sent_at = header("Date")
        .and_then(|d| parse_date(&d))
        .unwrap_or(received_at);

    let (folder, folder_path) = folder_of(&message.label_ids);
    let labels = message
        .label_ids
        .iter()
        .filter(|l| !SYSTEM_LABELS.contains(&l.as_str()) && !l.starts_with("CATEGORY_"))
        .cloned()
        .collect();

    RemoteMessage {
        remote_id: message.id,
        thread_id: message.thread_id,
        message_id: header("Message-ID"),
        subject: header("Subject").unwrap_or_default(),
        from: header("From").unwrap_or_default(),
        to: header("To")
            .map(|to| {
                to.split(',')
                    .map(|a| a.trim().to_string())
                    .filter(|a| !a.is_empty())
                    .collect()
            })
            .unwrap_or_default(),
        snippet: message.snippet,
        sent_at,
        received_at,
        is_read: !message.label_ids.iter().any(|l| l == "UNREAD"),
        is_starred: message.label_ids.iter().any(|l| l == "STARRED"),
        folder,
        folder_path,
        labels,
    }
}

pub(crate) fn parse_date(value: &str) -> Option<DateTime<Utc>> {
    let secs = mailparse::dateparse(value).ok()?;
    Utc.timestamp_opt(secs, 0).single()
}

#[cfg(test)]
mod tests {
    use super::*;
    use wiremock::matchers::{body_partial_json, header, method, path, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn provider(server: &MockServer) -> GmailProvider {
        GmailProvider::new(
            reqwest::Client::new(),
            server.uri(),
            "token".into(),
            "me@gmail.com".into(),
            Some("projects/p/topics/mail".into()),
        )
    }

    fn message_json(id: &str, labels: &[&str]) -> serde_json::Value {
        serde_json::json!({
            "id": id,
            "threadId": format!("t-{}", id),
            "labelIds": labels,
            "snippet": "hello",
            "internalDate": "1700000000000",
            "payload": {"headers": [
                {"name": "Subject", "value": format!("Subject {}", id)},
                {"name": "From", "value": "alice@example.com"},
                {"name": "To", "value": "me@gmail.com, bob@example.com"},
                {"name": "Message-ID", "value": format!("<{}@mail.example.com>", id)},
                {"name": "Date", "value": "Tue, 14 Nov 2023 22:13:20 +0000"}
            ]}
        })
    }

    async fn mount_message(server: &MockServer, id: &str, labels: &[&str]) {
        Mock::given(method("GET"))
            .and(path(format!("/messages/{}", id)))
            .respond_with(ResponseTemplate::new(200).set_body_json(message_json(id, labels)))
            .mount(server)
            .await;
    }

    #[tokio::test]
    async fn test_full_sync_drains_pages_and_sets_cursor() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/profile"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"historyId": "900"})),
            )
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/messages"))
            .and(query_param("pageToken", "p2"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": [{"id": "m3"}]
            })))
            .mount(&server)
            .await;
        Mock::given(method("GET"))
            .and(path("/messages"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "messages": [{"id": "m1"}, {"id": "m2"}],
                "nextPageToken": "p2"
            })))
            .up_to_n_times(1)
            .mount(&server)
            .await;
        mount_message(&server, "m1", &["INBOX", "UNREAD"]).await;
        mount_message(&server, "m2", &["INBOX", "STARRED", "Label_7"]).await;
        mount_message(&server, "m3", &["SENT"]).await;

        let result = provider(&server)
            .sync_emails(&SyncOptions {
                sync_type: SyncType::Full,
                max_messages: 10,
                cursor: None,
            })
            .await
            .unwrap();

        assert!(result.success);
        assert_eq!(result.processed, 3);
        assert_eq!(result.new, 3);
        assert_eq!(result.next_cursor.as_deref(), Some("900"));

        let upserts: Vec<&RemoteMessage> = result
            .changes
            .iter()
            .filter_map(|c| match c {
                MessageChange::Upsert(m) => Some(m),
                _ => None,
            })
            .collect();
        assert!(!upserts[0].is_read);
        assert!(upserts[1].is_starred);
        assert_eq!(upserts[1].labels, vec!["Label_7".to_string()]);
        assert_eq!(upserts[2].folder, "SENT");
        assert_eq!(
            upserts[0].message_id.as_deref(),
            Some("<m1@mail.example.com>")
        );
        assert_eq!(upserts[0].to.len(), 2);
    }

    #[tokio::test]
    async fn test_incremental_sync_collects_history() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/history"))
            .and(query_param("startHistoryId", "100"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "history": [
                    {"messagesAdded": [{"message": {"id": "a1"}}]},
                    {"labelsRemoved": [{"message": {"id": "old"}}]},
                    {"messagesDeleted": [{"message": {"id": "gone"}}]}
                ],
                "historyId": "140"
            })))
            .mount(&server)
            .await;
        mount_message(&server, "a1", &["INBOX", "UNREAD"]).await;
        mount_message(&server, "old", &["INBOX"]).await;

        let result = provider(&server)
            .sync_emails(&SyncOptions {
                sync_type: SyncType::Incremental,
                max_messages: 10,
                cursor: Some("100".into()),
            })
            .await
            .unwrap();

        assert_eq!(result.next_cursor.as_deref(), Some("140"));
        assert_eq!(result.new, 1);
        assert_eq!(result.updated, 1);
        assert_eq!(result.deleted, 1);
    }

    #[tokio::test]
    async fn test_history_cursor_never_moves_backwards() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/history"))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(serde_json::json!({"historyId": "50"})),
            )
            .mount(&server)
            .await;

        let result = provider(&server)
            .sync_emails(&SyncOptions {
                sync_type: SyncType::Incremental,
                max_messages: 10,
                cursor: Some("100".into()),
            })
            .await
            .unwrap();
        assert_eq!(result.next_cursor.as_deref(), Some("100"));
        assert_eq!(result.processed, 0);
    }

    #[tokio::test]
    async fn test_expired_history_is_cursor_invalid() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/history"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "error": {"code": 404, "message": "Requested entity was not found."}
            })))
            .mount(&server)
            .await;

        let err = provider(&server)
            .sync_emails(&SyncOptions {
                sync_type: SyncType::Incremental,
                max_messages: 10,
                cursor: Some("1".into()),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, ProviderError::CursorInvalid(_)));
    }

    #[tokio::test]
    async fn test_rate_limit_carries_retry_after() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/profile"))
            .respond_with(ResponseTemplate::new(429).insert_header("Retry-After", "120"))
            .mount(&server)
            .await;

        let err = provider(&server)
            .sync_emails(&SyncOptions {
                sync_type: SyncType::Full,
                max_messages: 10,
                cursor: None,
            })
            .await
            .unwrap_err();
        assert_eq!(
            err,
            ProviderError::RateLimited {
                retry_after_secs: Some(120)
            }
        );
    }

    #[tokio::test]
    async fn test_labels_become_folders() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/labels"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "labels": [
                    {"id": "INBOX", "name": "INBOX", "type": "system"},
                    {"id": "UNREAD", "name": "UNREAD", "type": "system"},
                    {"id": "SPAM", "name": "SPAM", "type": "system"},
                    {"id": "Label_1", "name": "Projects/Alpha", "type": "user"}
                ]
            })))
            .mount(&server)
            .await;

        let folders = provider(&server).list_folders().await.unwrap();
        assert_eq!(folders.len(), 3);
        assert_eq!(folders[1].special_use, Some(SpecialUse::Junk));
        assert_eq!(folders[2].path, "Projects/Alpha");
        assert_eq!(folders[2].name, "Alpha");
    }

    #[tokio::test]
    async fn test_watch_returns_subscription() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/watch"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "historyId": "10",
                "expiration": "1700000000000"
            })))
            .mount(&server)
            .await;

        let sub = provider(&server)
            .create_subscription(&SubscriptionRequest {
                notification_url: String::new(),
                client_state: String::new(),
                expires_at: Utc::now(),
            })
            .await
            .unwrap();
        assert_eq!(sub.external_id, "gmail:me@gmail.com");
        assert_eq!(sub.expires_at.timestamp(), 1_700_000_000);
    }

    #[tokio::test]
    async fn test_send_posts_built_mime_message() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages/send"))
            .and(header("authorization", "Bearer token"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_json(serde_json::json!({"id": "sent-1", "threadId": "t-9"})),
            )
            .expect(1)
            .mount(&server)
            .await;

        let id = provider(&server)
            .send_message(&OutgoingMessage {
                to: vec!["bob@example.com".into()],
                cc: vec!["carol@example.com".into()],
                subject: "Quarterly numbers".into(),
                text_body: "See attached.".into(),
                html_body: None,
            })
            .await
            .unwrap();
        assert_eq!(id, "sent-1");

        let requests = server.received_requests().await.unwrap();
        let body: serde_json::Value = serde_json::from_slice(&requests[0].body).unwrap();
        let raw = URL_SAFE_NO_PAD
            .decode(body["raw"].as_str().unwrap())
            .unwrap();
        let mime = String::from_utf8(raw).unwrap();
        let header_has = |name: &str, value: &str| {
            mime.lines()
                .any(|line| line.starts_with(name) && line.contains(value))
        };
        assert!(header_has("From:", "me@gmail.com"));
        assert!(header_has("To:", "bob@example.com"));
        assert!(header_has("Cc:", "carol@example.com"));
        assert!(header_has("Subject:", "Quarterly numbers"));
        assert!(mime.contains("See attached."));
    }

    #[tokio::test]
    async fn test_modify_labels_posts_label_delta() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(path("/messages/m1/modify"))
            .and(body_partial_json(serde_json::json!({
                "addLabelIds": ["STARRED"],
                "removeLabelIds": ["UNREAD"]
            })))
            .respond_with(
                ResponseTemplate::new(200).set_body_json(message_json("m1", &["INBOX", "STARRED"])),
            )
            .expect(1)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .and(path("/messages/gone/modify"))
            .respond_with(ResponseTemplate::new(404).set_body_json(serde_json::json!({
                "error": {"code": 404, "message": "Requested entity was not found."}
            })))
            .mount(&server)
            .await;

        let gmail = provider(&server);
        gmail
            .modify_labels("m1", &["STARRED".to_string()], &["UNREAD".to_string()])
            .await
            .unwrap();
        assert!(matches!(
            gmail.modify_labels("gone", &[], &["INBOX".to_string()]).await,
            Err(ProviderError::NotFound(_))
        ));
    }
}
