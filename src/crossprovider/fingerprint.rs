use chrono::{DateTime, SecondsFormat, Utc};
use sha2::{Digest, Sha256};

/// Compute SHA256 hex digest
pub fn compute_sha256(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

/// Trimmed, angle brackets stripped, lower-cased. `None` when nothing is left.
pub fn normalize_message_id(message_id: &str) -> Option<String> {
    let trimmed = message_id
        .trim()
        .trim_start_matches('<')
        .trim_end_matches('>')
        .trim();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_lowercase())
    }
}

/// Content hash identifying one logical message across providers.
///
/// Uses the normalised Message-ID when the message has one, otherwise the
/// lower-cased subject followed by the send time. The fallback can merge two
/// distinct messages that share subject and timestamp.
pub fn content_hash(message_id: Option<&str>, subject: &str, sent_at: DateTime<Utc>) -> String {
    match message_id.and_then(normalize_message_id) {
        Some(id) => compute_sha256(id.as_bytes()),
        None => {
            let material = format!(
                "{}{}",
                subject.to_lowercase(),
                sent_at.to_rfc3339_opts(SecondsFormat::Millis, true)
            );
            compute_sha256(material.as_bytes())
        }
    }
}
