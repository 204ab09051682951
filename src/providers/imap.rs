//! Generic pull provider over IMAP. The cursor is `"<uidvalidity>:<last uid>"`.

use async_imap::types::{Fetch, Flag, NameAttribute};
use async_imap::Session;
use async_native_tls::TlsStream;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::StreamExt;
use mailparse::MailHeaderMap;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_util::compat::{Compat, TokioAsyncReadCompatExt};

use futures::io::{AsyncRead, AsyncWrite};
use std::pin::Pin;
use std::task::{Context as TaskContext, Poll};

use super::error::{ProviderError, ProviderResult};
use super::gmail::parse_date;
use super::token::ProviderWithToken;
use super::types::*;
use super::MailProvider;

const FETCH_ITEMS: &str = "(UID FLAGS INTERNALDATE BODY.PEEK[HEADER])";
/// Newest already-seen messages whose flags are re-read on each incremental pass.
const FLAG_REFRESH_WINDOW: usize = 200;

/// Wrapper for either TLS or Plain IMAP stream
enum StreamWrapper {
    Tls(TlsStream<Compat<TcpStream>>),
    Plain(Compat<TcpStream>),
}

impl AsyncRead for StreamWrapper {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &mut [u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            StreamWrapper::Tls(s) => Pin::new(s).poll_read(cx, buf),
            StreamWrapper::Plain(s) => Pin::new(s).poll_read(cx, buf),
        }
    }
}

impl AsyncWrite for StreamWrapper {
    fn poll_write(
        self: Pin<&mut Self>,
        cx: &mut TaskContext<'_>,
        buf: &[u8],
    ) -> Poll<std::io::Result<usize>> {
        match self.get_mut() {
            StreamWrapper::Tls(s) => Pin::new(s).poll_write(cx, buf),
            StreamWrapper::Plain(s) => Pin::new(s).poll_write(cx, buf),
        }
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            StreamWrapper::Tls(s) => Pin::new(s).poll_flush(cx),
            StreamWrapper::Plain(s) => Pin::new(s).poll_flush(cx),
        }
    }

    fn poll_close(self: Pin<&mut Self>, cx: &mut TaskContext<'_>) -> Poll<std::io::Result<()>> {
        match self.get_mut() {
            StreamWrapper::Tls(s) => Pin::new(s).poll_close(cx),
            StreamWrapper::Plain(s) => Pin::new(s).poll_close(cx),
        }
    }
}

impl std::fmt::Debug for StreamWrapper {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamWrapper::Tls(_) => write!(f, "StreamWrapper::Tls"),
            StreamWrapper::Plain(_) => write!(f, "StreamWrapper::Plain"),
        }
    }
}

unsafe impl Send for StreamWrapper {}
impl Unpin for StreamWrapper {}

/// Connection settings read from the provider row's metadata.
#[derive(Debug, Clone, PartialEq)]
pub struct ImapSettings {
    pub host: String,
    pub port: u16,
    pub username: String,
    pub tls: bool,
}

impl ImapSettings {
    pub fn from_metadata(metadata: &serde_json::Value, email: &str) -> ProviderResult<Self> {
        let host = metadata
            .get("imapHost")
            .and_then(|v| v.as_str())
            .filter(|h| !h.is_empty())
            .ok_or_else(|| ProviderError::Provider("imapHost missing from metadata".to_string()))?
            .to_string();
        let port = match metadata.get("imapPort") {
            Some(serde_json::Value::Number(n)) => n.as_u64().and_then(|p| u16::try_from(p).ok()),
            Some(serde_json::Value::String(s)) => s.parse().ok(),
            _ => Some(993),
        }
        .ok_or_else(|| ProviderError::Provider("imapPort is not a valid port".to_string()))?;
        let username = metadata
            .get("imapUsername")
            .and_then(|v| v.as_str())
            .unwrap_or(email)
            .to_string();
        let tls = metadata
            .get("imapTls")
            .and_then(|v| v.as_bool())
            .unwrap_or(port == 993 || port == 3993);
        Ok(Self {
            host,
            port,
            username,
            tls,
        })
    }
}

/// `"<uidvalidity>:<last uid>"`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UidCursor {
    pub uid_validity: u32,
    pub last_uid: u32,
}

impl UidCursor {
    pub fn parse(raw: &str) -> ProviderResult<Self> {
        let (validity, last) = raw
            .split_once(':')
            .ok_or_else(|| ProviderError::CursorInvalid(format!("malformed uid cursor '{}'", raw)))?;
        match (validity.trim().parse(), last.trim().parse()) {
            (Ok(uid_validity), Ok(last_uid)) => Ok(Self {
                uid_validity,
                last_uid,
            }),
            _ => Err(ProviderError::CursorInvalid(format!(
                "malformed uid cursor '{}'",
                raw
            ))),
        }
    }

    pub fn encode(&self) -> String {
        format!("{}:{}", self.uid_validity, self.last_uid)
    }
}

/// IMAP pull provider. Authenticates with the account password.
pub struct ImapProvider {
    settings: ImapSettings,
    password: String,
    session: Mutex<Option<Session<StreamWrapper>>>,
}

fn imap_err(context: &str, err: async_imap::error::Error) -> ProviderError {
    ProviderError::Provider(format!("{}: {}", context, err))
}

impl ImapProvider {
    pub fn new(settings: ImapSettings, password: String) -> Self {
        Self {
            settings,
            password,
            session: Mutex::new(None),
        }
    }

    pub fn from_session(session: &ProviderWithToken) -> ProviderResult<Self> {
        let settings =
            ImapSettings::from_metadata(&session.provider.metadata, &session.provider.email)?;
        Ok(Self::new(settings, session.access_token.clone()))
    }

    /// Establish a new IMAP connection
    async fn connect(&self) -> ProviderResult<Session<StreamWrapper>> {
        let ImapSettings {
            host, port, tls, ..
        } = &self.settings;
        tracing::debug!("Connecting to IMAP {}:{}", host, port);

        let tcp = TcpStream::connect(format!("{}:{}", host, port))
            .await
            .map_err(|e| ProviderError::Provider(format!("connect to IMAP server: {}", e)))?;

        let stream = if *tls {
            let connector = async_native_tls::TlsConnector::new();
            let tls_stream = connector
                .connect(host.as_str(), tcp.compat())
                .await
                .map_err(|e| ProviderError::Provider(format!("TLS handshake failed: {}", e)))?;
            StreamWrapper::Tls(tls_stream)
        } else {
            StreamWrapper::Plain(tcp.compat())
        };

        let client = async_imap::Client::new(stream);
        let session = client
            .login(&self.settings.username, &self.password)
            .await
            .map_err(|(err, _)| ProviderError::TokenExpired(format!("IMAP login failed: {}", err)))?;

        tracing::debug!("IMAP login successful for {}", self.settings.username);
        Ok(session)
    }

    /// Reconnect if the session is stale
    async fn session(
        &self,
    ) -> ProviderResult<tokio::sync::MutexGuard<'_, Option<Session<StreamWrapper>>>> {
        let mut guard = self.session.lock().await;
        let needs_reconnect = match guard.as_mut() {
            Some(session) => session.noop().await.is_err(),
            None => true,
        };
        if needs_reconnect {
            *guard = Some(self.connect().await?);
        }
        Ok(guard)
    }

    async fn fetch_uids(
        session: &mut Session<StreamWrapper>,
        uid_validity: u32,
        folder: &str,
        uids: &[u32],
    ) -> ProviderResult<Vec<RemoteMessage>> {
        if uids.is_empty() {
            return Ok(Vec::new());
        }
        let set = uids
            .iter()
            .map(u32::to_string)
            .collect::<Vec<_>>()
            .join(",");
        let mut stream = session
            .uid_fetch(set, FETCH_ITEMS)
            .await
            .map_err(|e| imap_err("IMAP UID FETCH failed", e))?;

        let mut messages = Vec::with_capacity(uids.len());
        while let Some(result) = stream.next().await {
            let fetch = result.map_err(|e| imap_err("error fetching message", e))?;
            if let Some(message) = message_from_fetch(&fetch, uid_validity, folder) {
                messages.push(message);
            }
        }
        messages.sort_by_key(|m| std::cmp::Reverse(m.received_at));
        Ok(messages)
    }
}

fn message_from_fetch(fetch: &Fetch, uid_validity: u32, folder: &str) -> Option<RemoteMessage> {
    let uid = fetch.uid?;
    let mut seen = false;
    let mut flagged = false;
    let mut keywords = Vec::new();
    for flag in fetch.flags() {
        match flag {
            Flag::Seen => seen = true,
            Flag::Flagged => flagged = true,
            Flag::Custom(keyword) if !keyword.starts_with('$') && !keyword.starts_with('\\') => {
                keywords.push(keyword.to_string())
            }
            _ => {}
        }
    }
    let internal_date = fetch.internal_date().map(|d| d.with_timezone(&Utc));
    Some(message_from_parts(
        uid_validity,
        uid,
        fetch.header().unwrap_or_default(),
        seen,
        flagged,
        keywords,
        internal_date,
        folder,
    ))
}

#[allow(clippy::too_many_arguments)]
fn message_from_parts(
    uid_validity: u32,
    uid: u32,
    raw_headers: &[u8],
    seen: bool,
    flagged: bool,
    keywords: Vec<String>,
    internal_date: Option<DateTime<Utc>>,
    folder_path: &str,
) -> RemoteMessage {
    let headers = mailparse::parse_headers(raw_headers)
        .map(|(headers, _)| headers)
        .unwrap_or_default();
    let received_at = internal_date.unwrap_or_else(Utc::now);
    let sent_at = headers
        .get_first_value("Date")
        .and_then(|d| parse_date(&d))
        .unwrap_or(received_at);
    let folder = SpecialUse::from_name(folder_path)
        .map(|s| s.as_str().to_string())
        .unwrap_or_else(|| folder_path.to_string());

    RemoteMessage {
        remote_id: remote_id(uid_validity, uid),
        thread_id: None,
        message_id: headers.get_first_value("Message-ID"),
        subject: headers.get_first_value("Subject").unwrap_or_default(),
        from: headers.get_first_value("From").unwrap_or_default(),
        to: headers
            .get_first_value("To")
            .map(|to| {
                to.split(',')
                    .map(|a| a.trim().to_string())
                    .filter(|a| !a.is_empty())
                    .collect()
            })
            .unwrap_or_default(),
        snippet: String::new(),
        sent_at,
        received_at,
        is_read: seen,
        is_starred: flagged,
        folder,
        folder_path: folder_path.to_string(),
        labels: keywords,
    }
}

fn folder_from_name(
    name: &str,
    delimiter: Option<&str>,
    attributes: &[NameAttribute<'_>],
) -> RemoteFolder {
    let is_selectable = !attributes.iter().any(|a| matches!(a, NameAttribute::NoSelect));
    let special_use = attributes
        .iter()
        .find_map(|a| match a {
            NameAttribute::Sent => Some(SpecialUse::Sent),
            NameAttribute::Drafts => Some(SpecialUse::Drafts),
            NameAttribute::Trash => Some(SpecialUse::Trash),
            NameAttribute::Junk => Some(SpecialUse::Junk),
            NameAttribute::Archive | NameAttribute::All => Some(SpecialUse::Archive),
            NameAttribute::Flagged => Some(SpecialUse::Flagged),
            NameAttribute::Extension(ext) => SpecialUse::from_attribute(ext),
            _ => None,
        })
        .or_else(|| {
            if name.eq_ignore_ascii_case(INBOX) {
                Some(SpecialUse::Inbox)
            } else {
                SpecialUse::from_name(name)
            }
        });
    let leaf = match delimiter {
        Some(d) if !d.is_empty() => name.rsplit(d).next().unwrap_or(name),
        _ => name,
    };
    RemoteFolder {
        path: name.to_string(),
        name: leaf.to_string(),
        delimiter: delimiter.map(str::to_string),
        special_use,
        is_selectable,
    }
}

/// Oldest UID an incremental pass looks at for expunged messages.
const DELETION_SCAN_LIMIT: u32 = 5_000;

fn remote_id(uid_validity: u32, uid: u32) -> String {
    format!("{}:{}", uid_validity, uid)
}

/// What one incremental pass fetches and reports as gone.
#[derive(Debug, Default, PartialEq)]
struct UidPlan {
    /// Above the cursor, oldest first.
    fresh: Vec<u32>,
    /// Newest already-seen UIDs, re-read for flag changes.
    refresh: Vec<u32>,
    /// At or below the cursor, inside the refresh range, and no longer in the mailbox.
    expunged: Vec<u32>,
}

fn incremental_plan(all: &[u32], last_uid: u32, window: usize) -> UidPlan {
    let mut fresh: Vec<u32> = all.iter().copied().filter(|uid| *uid > last_uid).collect();
    fresh.sort_unstable();
    let mut refresh: Vec<u32> = all.iter().copied().filter(|uid| *uid <= last_uid).collect();
    refresh.sort_unstable_by(|a, b| b.cmp(a));
    refresh.truncate(window);

    // With nothing left to refresh, everything up to the cursor may be gone.
    let floor = refresh
        .last()
        .copied()
        .unwrap_or(1)
        .max(last_uid.saturating_sub(DELETION_SCAN_LIMIT))
        .max(1);
    let present: std::collections::HashSet<u32> = all.iter().copied().collect();
    let expunged = if last_uid == 0 {
        Vec::new()
    } else {
        (floor..=last_uid).filter(|uid| !present.contains(uid)).collect()
    };
    UidPlan {
        fresh,
        refresh,
        expunged,
    }
}

#[async_trait]
impl MailProvider for ImapProvider {
    fn provider_type(&self) -> ProviderType {
        ProviderType::Imap
    }

    async fn sync_emails(&self, options: &SyncOptions) -> ProviderResult<SyncResult> {
        let mut guard = self.session().await?;
        let session = guard
            .as_mut()
            .ok_or_else(|| ProviderError::Provider("no IMAP session".to_string()))?;

        let mailbox = session
            .select(INBOX)
            .await
            .map_err(|e| imap_err("failed to SELECT INBOX", e))?;
        let uid_validity = mailbox.uid_validity.unwrap_or(0);

        let cursor = match (options.sync_type, options.cursor.as_deref()) {
            (SyncType::Incremental, Some(raw)) => {
                let cursor = UidCursor::parse(raw)?;
                if cursor.uid_validity != uid_validity {
                    return Err(ProviderError::CursorInvalid(format!(
                        "UIDVALIDITY changed from {} to {}",
                        cursor.uid_validity, uid_validity
                    )));
                }
                Some(cursor)
            }
            _ => None,
        };

        let mut all: Vec<u32> = session
            .uid_search("ALL")
            .await
            .map_err(|e| imap_err("IMAP UID SEARCH failed", e))?
            .into_iter()
            .collect();
        all.sort_unstable();
        let highest = all.last().copied().unwrap_or(0);

        let plan = match cursor {
            Some(cursor) => incremental_plan(&all, cursor.last_uid, FLAG_REFRESH_WINDOW),
            None => {
                let start = all.len().saturating_sub(options.max_messages as usize);
                UidPlan {
                    fresh: all[start..].to_vec(),
                    ..Default::default()
                }
            }
        };

        let mut changes: Vec<MessageChange> =
            Self::fetch_uids(session, uid_validity, INBOX, &plan.fresh)
                .await?
                .into_iter()
                .map(MessageChange::Upsert)
                .collect();
        let new = changes.len() as u32;
        changes.extend(
            Self::fetch_uids(session, uid_validity, INBOX, &plan.refresh)
                .await?
                .into_iter()
                .map(MessageChange::Upsert),
        );
        changes.extend(
            plan.expunged
                .iter()
                .map(|uid| MessageChange::Deleted {
                    remote_id: remote_id(uid_validity, *uid),
                }),
        );

        let last_uid = cursor.map_or(highest, |c| c.last_uid.max(highest));
        let next = UidCursor {
            uid_validity,
            last_uid,
        };
        let mut result = SyncResult::from_changes(changes, new, Some(next.encode()), Vec::new());
        if cursor.is_none() {
            // Rows from an earlier UIDVALIDITY generation are stale.
            result.live_prefix = Some(format!("{}:", uid_validity));
        }
        Ok(result)
    }

    async fn list_messages(&self, query: &MessageQuery) -> ProviderResult<MessagePage> {
        let folder = query.folder.clone().unwrap_or_else(|| INBOX.to_string());
        let mut guard = self.session().await?;
        let session = guard
            .as_mut()
            .ok_or_else(|| ProviderError::Provider("no IMAP session".to_string()))?;

        let mailbox = session
            .select(&folder)
            .await
            .map_err(|e| imap_err("failed to SELECT folder", e))?;
        let mut uids: Vec<u32> = session
            .uid_search("ALL")
            .await
            .map_err(|e| imap_err("IMAP UID SEARCH failed", e))?
            .into_iter()
            .collect();
        uids.sort_unstable_by(|a, b| b.cmp(a));

        let offset: usize = query
            .page_token
            .as_deref()
            .and_then(|t| t.parse().ok())
            .unwrap_or(0);
        let limit = query.limit.max(1) as usize;
        let page: Vec<u32> = uids.iter().skip(offset).take(limit).copied().collect();
        let messages =
            Self::fetch_uids(session, mailbox.uid_validity.unwrap_or(0), &folder, &page).await?;
        let next_page_token = (offset + limit < uids.len()).then(|| (offset + limit).to_string());
        Ok(MessagePage {
            messages,
            next_page_token,
        })
    }

    async fn get_message(&self, remote_id: &str) -> ProviderResult<RemoteMessage> {
        let cursor = UidCursor::parse(remote_id)
            .map_err(|_| ProviderError::NotFound(format!("message {}", remote_id)))?;
        let mut guard = self.session().await?;
        let session = guard
            .as_mut()
            .ok_or_else(|| ProviderError::Provider("no IMAP session".to_string()))?;
        let mailbox = session
            .select(INBOX)
            .await
            .map_err(|e| imap_err("failed to SELECT INBOX", e))?;
        if mailbox.uid_validity.unwrap_or(0) != cursor.uid_validity {
            return Err(ProviderError::NotFound(format!("message {}", remote_id)));
        }
        Self::fetch_uids(session, cursor.uid_validity, INBOX, &[cursor.last_uid])
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ProviderError::NotFound(format!("message {}", remote_id)))
    }

    async fn send_message(&self, _message: &OutgoingMessage) -> ProviderResult<String> {
        Err(ProviderError::Unsupported(
            "sending is not available for IMAP accounts".to_string(),
        ))
    }

    /// Labels map onto IMAP keywords.
    async fn modify_labels(
        &self,
        remote_id: &str,
        add: &[String],
        remove: &[String],
    ) -> ProviderResult<()> {
        let cursor = UidCursor::parse(remote_id)
            .map_err(|_| ProviderError::NotFound(format!("message {}", remote_id)))?;
        let mut guard = self.session().await?;
        let session = guard
            .as_mut()
            .ok_or_else(|| ProviderError::Provider("no IMAP session".to_string()))?;
        session
            .select(INBOX)
            .await
            .map_err(|e| imap_err("failed to SELECT INBOX", e))?;

        for (op, keywords) in [("+FLAGS", add), ("-FLAGS", remove)] {
            if keywords.is_empty() {
                continue;
            }
            let store_stream = session
                .uid_store(
                    cursor.last_uid.to_string(),
                    format!("{} ({})", op, keywords.join(" ")),
                )
                .await
                .map_err(|e| imap_err("IMAP UID STORE failed", e))?;
            tokio::pin!(store_stream);
            while store_stream.next().await.is_some() {}
        }
        Ok(())
    }

    async fn list_folders(&self) -> ProviderResult<Vec<RemoteFolder>> {
        let mut guard = self.session().await?;
        let session = guard
            .as_mut()
            .ok_or_else(|| ProviderError::Provider("no IMAP session".to_string()))?;

        let mut stream = session
            .list(Some(""), Some("*"))
            .await
            .map_err(|e| imap_err("IMAP LIST failed", e))?;
        let mut folders = Vec::new();
        while let Some(result) = stream.next().await {
            let name = result.map_err(|e| imap_err("error reading LIST response", e))?;
            folders.push(folder_from_name(
                name.name(),
                name.delimiter(),
                name.attributes(),
            ));
        }
        Ok(folders)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::borrow::Cow;

    #[test]
    fn test_uid_cursor_parsing() {
        let cursor = UidCursor::parse("1700:42").unwrap();
        assert_eq!(cursor.uid_validity, 1700);
        assert_eq!(cursor.last_uid, 42);
        assert_eq!(cursor.encode(), "1700:42");
        assert!(matches!(
            UidCursor::parse("42"),
            Err(ProviderError::CursorInvalid(_))
        ));
        assert!(matches!(
            UidCursor::parse("a:b"),
            Err(ProviderError::CursorInvalid(_))
        ));
    }

    #[test]
    fn test_incremental_plan_splits_new_and_known() {
        let all = vec![3, 9, 10, 11, 12, 20];
        let plan = incremental_plan(&all, 11, 2);
        assert_eq!(plan.fresh, vec![12, 20]);
        assert_eq!(plan.refresh, vec![11, 10]);
        assert!(plan.expunged.is_empty());
    }

    #[test]
    fn test_incremental_plan_reports_expunged_uids() {
        // 3, 5, 7 and 8 were expunged since the cursor was stored at 8.
        let all = vec![2, 4, 6, 9];
        let plan = incremental_plan(&all, 8, 3);
        assert_eq!(plan.fresh, vec![9]);
        assert_eq!(plan.refresh, vec![6, 4, 2]);
        assert_eq!(plan.expunged, vec![3, 5, 7, 8]);

        // Older than the refresh window is left alone.
        let plan = incremental_plan(&all, 8, 1);
        assert_eq!(plan.refresh, vec![6]);
        assert_eq!(plan.expunged, vec![7, 8]);

        // An emptied mailbox reports everything up to the cursor.
        let plan = incremental_plan(&[], 3, 200);
        assert!(plan.fresh.is_empty() && plan.refresh.is_empty());
        assert_eq!(plan.expunged, vec![1, 2, 3]);

        assert_eq!(incremental_plan(&[], 0, 200), UidPlan::default());
    }

    #[test]
    fn test_headers_become_remote_message() {
        let raw = b"Subject: Invoice 7\r\nFrom: billing@example.com\r\nTo: a@example.com, b@example.com\r\nMessage-ID: <inv-7@example.com>\r\nDate: Fri, 01 Mar 2024 10:00:00 +0000\r\n\r\n";
        let message = message_from_parts(
            77,
            5,
            raw,
            true,
            false,
            vec!["work".into()],
            None,
            INBOX,
        );
        assert_eq!(message.remote_id, "77:5");
        assert_eq!(message.subject, "Invoice 7");
        assert_eq!(message.message_id.as_deref(), Some("<inv-7@example.com>"));
        assert_eq!(message.to.len(), 2);
        assert_eq!(message.sent_at.to_rfc3339(), "2024-03-01T10:00:00+00:00");
        assert!(message.is_read);
        assert_eq!(message.folder, "INBOX");
        assert_eq!(message.labels, vec!["work".to_string()]);
    }

    #[test]
    fn test_list_attributes_map_to_special_use() {
        let sent = folder_from_name("Sent", Some("/"), &[NameAttribute::Sent]);
        assert_eq!(sent.special_use, Some(SpecialUse::Sent));

        let parent = folder_from_name("[Gmail]", Some("/"), &[NameAttribute::NoSelect]);
        assert!(!parent.is_selectable);

        let nested = folder_from_name("INBOX.Receipts.2024", Some("."), &[]);
        assert_eq!(nested.name, "2024");
        assert_eq!(nested.special_use, None);

        let custom = folder_from_name(
            "Stuff",
            Some("/"),
            &[NameAttribute::Extension(Cow::Borrowed("\\Junk"))],
        );
        assert_eq!(custom.special_use, Some(SpecialUse::Junk));

        let inbox = folder_from_name("INBOX", Some("/"), &[]);
        assert_eq!(inbox.special_use, Some(SpecialUse::Inbox));
    }

    #[test]
    fn test_settings_from_metadata() {
        let settings = ImapSettings::from_metadata(
            &serde_json::json!({"imapHost": "imap.example.com", "imapPort": 143}),
            "me@example.com",
        )
        .unwrap();
        assert_eq!(settings.port, 143);
        assert!(!settings.tls);
        assert_eq!(settings.username, "me@example.com");

        let tls = ImapSettings::from_metadata(
            &serde_json::json!({"imapHost": "imap.example.com"}),
            "me@example.com",
        )
        .unwrap();
        assert!(tls.tls);
        assert!(ImapSettings::from_metadata(&serde_json::json!({}), "x").is_err());
    }
}
