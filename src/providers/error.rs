use std::time::Duration;

/// Result type alias for provider adapter operations.
pub type ProviderResult<T> = std::result::Result<T, ProviderError>;

/// Errors surfaced by a provider adapter, classified at the adapter boundary.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ProviderError {
    /// The access token was rejected (HTTP 401 or an IMAP login failure).
    #[error("access token expired or revoked: {0}")]
    TokenExpired(String),

    /// The credential lacks a scope the operation needs (HTTP 403).
    #[error("insufficient permissions: {message} (required scopes: {required_scopes:?})")]
    InsufficientPermissions {
        message: String,
        required_scopes: Vec<String>,
    },

    /// Provider-side throttling (HTTP 429 or a quota 403).
    #[error("rate limited, retry after {retry_after_secs:?} seconds")]
    RateLimited { retry_after_secs: Option<u64> },

    #[error("not found: {0}")]
    NotFound(String),

    /// The stored sync cursor can no longer be used; a full sync is required.
    #[error("sync cursor is no longer valid: {0}")]
    CursorInvalid(String),

    #[error("operation not supported by this provider: {0}")]
    Unsupported(String),

    /// Anything else, with the original message preserved.
    #[error("provider error: {0}")]
    Provider(String),
}

impl ProviderError {
    /// Errors that need a refreshed or re-consented credential before a retry can help.
    pub fn is_credential_error(&self) -> bool {
        matches!(
            self,
            ProviderError::TokenExpired(_) | ProviderError::InsufficientPermissions { .. }
        )
    }

    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            ProviderError::RateLimited {
                retry_after_secs: Some(secs),
            } => Some(Duration::from_secs(*secs)),
            _ => None,
        }
    }

    /// Short machine-readable kind, reported alongside failure messages.
    pub fn kind(&self) -> &'static str {
        match self {
            ProviderError::TokenExpired(_) => "token_expired",
            ProviderError::InsufficientPermissions { .. } => "insufficient_permissions",
            ProviderError::RateLimited { .. } => "rate_limited",
            ProviderError::NotFound(_) => "not_found",
            ProviderError::CursorInvalid(_) => "cursor_invalid",
            ProviderError::Unsupported(_) => "unsupported",
            ProviderError::Provider(_) => "provider_error",
        }
    }
}

impl From<reqwest::Error> for ProviderError {
    fn from(err: reqwest::Error) -> Self {
        ProviderError::Provider(err.to_string())
    }
}

impl From<serde_json::Error> for ProviderError {
    fn from(err: serde_json::Error) -> Self {
        ProviderError::Provider(format!("malformed provider response: {}", err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_credential_errors() {
        assert!(ProviderError::TokenExpired("x".into()).is_credential_error());
        assert!(ProviderError::InsufficientPermissions {
            message: "scope".into(),
            required_scopes: vec!["Mail.Read".into()],
        }
        .is_credential_error());
        assert!(!ProviderError::RateLimited {
            retry_after_secs: Some(3)
        }
        .is_credential_error());
    }

    #[test]
    fn test_retry_after_only_for_rate_limits() {
        let limited = ProviderError::RateLimited {
            retry_after_secs: Some(42),
        };
        assert_eq!(limited.retry_after(), Some(Duration::from_secs(42)));
        assert_eq!(ProviderError::Provider("boom".into()).retry_after(), None);
    }

    #[test]
    fn test_kinds_are_stable_identifiers() {
        assert_eq!(ProviderError::TokenExpired("x".into()).kind(), "token_expired");
        assert_eq!(
            ProviderError::RateLimited {
                retry_after_secs: None
            }
            .kind(),
            "rate_limited"
        );
        assert_eq!(ProviderError::CursorInvalid("gone".into()).kind(), "cursor_invalid");
    }
}
