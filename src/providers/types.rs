use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Folder name used when a message has no more specific location.
pub const INBOX: &str = "INBOX";

/// Connected provider kinds. Gmail and Outlook push change notifications,
/// IMAP is polled.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ProviderType {
    Gmail,
    Outlook,
    Imap,
}

#[derive(Debug, thiserror::Error)]
#[error("unknown provider type '{0}'")]
pub struct UnknownProviderType(pub String);

impl ProviderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderType::Gmail => "gmail",
            ProviderType::Outlook => "outlook",
            ProviderType::Imap => "imap",
        }
    }

    /// Metadata key under which this provider's sync cursor is stored.
    pub fn cursor_key(&self) -> &'static str {
        match self {
            ProviderType::Gmail => "historyId",
            ProviderType::Outlook => "deltaLink",
            ProviderType::Imap => "lastUid",
        }
    }

    pub fn supports_push(&self) -> bool {
        matches!(self, ProviderType::Gmail | ProviderType::Outlook)
    }
}

impl fmt::Display for ProviderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ProviderType {
    type Err = UnknownProviderType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "gmail" | "google" => Ok(ProviderType::Gmail),
            "outlook" | "microsoft" | "graph" => Ok(ProviderType::Outlook),
            "imap" => Ok(ProviderType::Imap),
            other => Err(UnknownProviderType(other.to_string())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncType {
    Full,
    Incremental,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::Full => "full",
            SyncType::Incremental => "incremental",
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncOptions {
    pub sync_type: SyncType,
    pub max_messages: u32,
    /// Opaque provider cursor; required for incremental syncs.
    pub cursor: Option<String>,
}

/// A message as reported by a provider, normalised across providers.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RemoteMessage {
    pub remote_id: String,
    pub thread_id: Option<String>,
    pub message_id: Option<String>,
    pub subject: String,
    pub from: String,
    pub to: Vec<String>,
    pub snippet: String,
    pub sent_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub is_read: bool,
    pub is_starred: bool,
    /// Special-use name (`INBOX`, `ARCHIVE`, ...) when known, otherwise the path.
    pub folder: String,
    /// Provider path of the containing folder, matching `RemoteFolder::path`.
    pub folder_path: String,
    pub labels: Vec<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageChange {
    Upsert(RemoteMessage),
    Deleted { remote_id: String },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SyncItemError {
    pub remote_id: Option<String>,
    pub message: String,
}

/// Outcome of one `sync_emails` call. `changes` is the fully drained batch.
#[derive(Debug, Clone, Default)]
pub struct SyncResult {
    pub success: bool,
    pub processed: u32,
    pub new: u32,
    pub updated: u32,
    pub deleted: u32,
    pub next_cursor: Option<String>,
    pub changes: Vec<MessageChange>,
    pub errors: Vec<SyncItemError>,
    /// Set by a full sync when remote ids carry a generation prefix: mirrored
    /// rows of this provider without the prefix no longer exist remotely.
    pub live_prefix: Option<String>,
}

impl SyncResult {
    /// Builds a successful result and derives the counters from the change list.
    pub fn from_changes(
        changes: Vec<MessageChange>,
        new: u32,
        next_cursor: Option<String>,
        errors: Vec<SyncItemError>,
    ) -> Self {
        let deleted = changes
            .iter()
            .filter(|c| matches!(c, MessageChange::Deleted { .. }))
            .count() as u32;
        let processed = changes.len() as u32;
        Self {
            success: true,
            processed,
            new: new.min(processed - deleted),
            updated: processed - deleted - new.min(processed - deleted),
            deleted,
            next_cursor,
            changes,
            errors,
            live_prefix: None,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MessageQuery {
    pub folder: Option<String>,
    pub limit: u32,
    pub page_token: Option<String>,
}

#[derive(Debug, Clone, Default)]
pub struct MessagePage {
    pub messages: Vec<RemoteMessage>,
    pub next_page_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct OutgoingMessage {
    pub to: Vec<String>,
    pub cc: Vec<String>,
    pub subject: String,
    pub text_body: String,
    pub html_body: Option<String>,
}

/// RFC 6154 special-use mailbox roles.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum SpecialUse {
    Inbox,
    Sent,
    Drafts,
    Trash,
    Junk,
    Archive,
    Flagged,
}

impl SpecialUse {
    pub fn as_str(&self) -> &'static str {
        match self {
            SpecialUse::Inbox => "INBOX",
            SpecialUse::Sent => "SENT",
            SpecialUse::Drafts => "DRAFTS",
            SpecialUse::Trash => "TRASH",
            SpecialUse::Junk => "JUNK",
            SpecialUse::Archive => "ARCHIVE",
            SpecialUse::Flagged => "FLAGGED",
        }
    }

    /// Maps an IMAP LIST attribute such as `\Sent`.
    pub fn from_attribute(attribute: &str) -> Option<Self> {
        match attribute.trim_start_matches('\\').to_ascii_lowercase().as_str() {
            "inbox" => Some(SpecialUse::Inbox),
            "sent" => Some(SpecialUse::Sent),
            "drafts" => Some(SpecialUse::Drafts),
            "trash" => Some(SpecialUse::Trash),
            "junk" | "spam" => Some(SpecialUse::Junk),
            "archive" | "all" => Some(SpecialUse::Archive),
            "flagged" => Some(SpecialUse::Flagged),
            _ => None,
        }
    }

    /// Maps well-known folder names of servers that do not advertise attributes.
    pub fn from_name(name: &str) -> Option<Self> {
        let leaf = name.rsplit(['/', '.']).next().unwrap_or(name);
        match leaf.trim().to_ascii_lowercase().as_str() {
            "inbox" => Some(SpecialUse::Inbox),
            "sent" | "sent items" | "sent mail" | "sent messages" => Some(SpecialUse::Sent),
            "drafts" | "draft" => Some(SpecialUse::Drafts),
            "trash" | "deleted items" | "deleted messages" | "bin" => Some(SpecialUse::Trash),
            "junk" | "junk email" | "junk e-mail" | "spam" => Some(SpecialUse::Junk),
            "archive" | "archives" | "all mail" => Some(SpecialUse::Archive),
            "starred" | "flagged" => Some(SpecialUse::Flagged),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteFolder {
    pub path: String,
    pub name: String,
    pub delimiter: Option<String>,
    pub special_use: Option<SpecialUse>,
    pub is_selectable: bool,
}

#[derive(Debug, Clone)]
pub struct SubscriptionRequest {
    pub notification_url: String,
    pub client_state: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RemoteSubscription {
    pub external_id: String,
    pub resource: String,
    pub expires_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_type_parsing() {
        assert_eq!("Gmail".parse::<ProviderType>().unwrap(), ProviderType::Gmail);
        assert_eq!("graph".parse::<ProviderType>().unwrap(), ProviderType::Outlook);
        assert!("pop3".parse::<ProviderType>().is_err());
        assert!(ProviderType::Outlook.supports_push());
        assert!(!ProviderType::Imap.supports_push());
    }

    #[test]
    fn test_special_use_mapping() {
        assert_eq!(SpecialUse::from_attribute("\\Sent"), Some(SpecialUse::Sent));
        assert_eq!(SpecialUse::from_attribute("\\All"), Some(SpecialUse::Archive));
        assert_eq!(SpecialUse::from_attribute("\\HasNoChildren"), None);
        assert_eq!(
            SpecialUse::from_name("[Gmail]/Sent Mail"),
            Some(SpecialUse::Sent)
        );
        assert_eq!(SpecialUse::from_name("INBOX.Junk"), Some(SpecialUse::Junk));
        assert_eq!(SpecialUse::from_name("Projects/2024"), None);
    }

    #[test]
    fn test_sync_result_counters() {
        let msg = RemoteMessage {
            remote_id: "1".into(),
            thread_id: None,
            message_id: None,
            subject: "s".into(),
            from: "a@example.com".into(),
            to: vec![],
            snippet: String::new(),
            sent_at: Utc::now(),
            received_at: Utc::now(),
            is_read: false,
            is_starred: false,
            folder: INBOX.into(),
            folder_path: INBOX.into(),
            labels: vec![],
        };
        let changes = vec![
            MessageChange::Upsert(msg.clone()),
            MessageChange::Upsert(RemoteMessage {
                remote_id: "2".into(),
                ..msg
            }),
            MessageChange::Deleted {
                remote_id: "3".into(),
            },
        ];
        let result = SyncResult::from_changes(changes, 1, Some("9".into()), vec![]);
        assert_eq!(result.processed, 3);
        assert_eq!(result.deleted, 1);
        assert_eq!(result.new, 1);
        assert_eq!(result.updated, 1);
    }
}
