//! Mapping of REST responses onto the provider error taxonomy.

use reqwest::header::{HeaderMap, RETRY_AFTER, WWW_AUTHENTICATE};
use reqwest::{Response, StatusCode};
use serde::de::DeserializeOwned;

use super::error::{ProviderError, ProviderResult};

/// Retry delay assumed when a provider throttles without a `Retry-After` header.
pub const DEFAULT_RETRY_AFTER_SECS: u64 = 60;

const QUOTA_PATTERNS: [&str; 6] = [
    "userratelimitexceeded",
    "ratelimitexceeded",
    "quotaexceeded",
    "servicelimit",
    "daily limit",
    "billing limit",
];

pub fn build_client() -> reqwest::Client {
    reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(60))
        .build()
        .unwrap_or_default()
}

/// Decodes a successful JSON response or classifies the failure.
pub async fn read_json<T: DeserializeOwned>(response: Response) -> ProviderResult<T> {
    let response = check_status(response).await?;
    let body = response.text().await?;
    Ok(serde_json::from_str(&body)?)
}

/// Passes successful responses through and turns every other status into a
/// `ProviderError`.
pub async fn check_status(response: Response) -> ProviderResult<Response> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let headers = response.headers().clone();
    let body = response.text().await.unwrap_or_default();
    Err(classify(status, &headers, &body))
}

pub fn classify(status: StatusCode, headers: &HeaderMap, body: &str) -> ProviderError {
    match status {
        StatusCode::UNAUTHORIZED => {
            ProviderError::TokenExpired(error_message(body).unwrap_or_else(|| status.to_string()))
        }
        StatusCode::FORBIDDEN => {
            let lower = body.to_lowercase();
            if QUOTA_PATTERNS.iter().any(|p| lower.contains(p)) {
                return ProviderError::RateLimited {
                    retry_after_secs: Some(
                        retry_after(headers).unwrap_or(DEFAULT_RETRY_AFTER_SECS),
                    ),
                };
            }
            ProviderError::InsufficientPermissions {
                message: error_message(body).unwrap_or_else(|| "access forbidden".to_string()),
                required_scopes: required_scopes(headers),
            }
        }
        StatusCode::TOO_MANY_REQUESTS => ProviderError::RateLimited {
            retry_after_secs: Some(retry_after(headers).unwrap_or(DEFAULT_RETRY_AFTER_SECS)),
        },
        StatusCode::NOT_FOUND => {
            ProviderError::NotFound(error_message(body).unwrap_or_else(|| "not found".to_string()))
        }
        StatusCode::GONE => ProviderError::CursorInvalid(
            error_message(body).unwrap_or_else(|| "sync state expired".to_string()),
        ),
        _ => ProviderError::Provider(format!(
            "status {}: {}",
            status,
            error_message(body).unwrap_or_else(|| body.chars().take(512).collect())
        )),
    }
}

fn retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.trim().parse().ok())
}

/// Reads `scope="a b c"` out of a bearer challenge.
fn required_scopes(headers: &HeaderMap) -> Vec<String> {
    let Some(challenge) = headers.get(WWW_AUTHENTICATE).and_then(|v| v.to_str().ok()) else {
        return Vec::new();
    };
    let Some(start) = challenge.find("scope=\"") else {
        return Vec::new();
    };
    let rest = &challenge[start + "scope=\"".len()..];
    let value = rest.split('"').next().unwrap_or_default();
    value.split_whitespace().map(str::to_string).collect()
}

/// Google and Graph both nest the message as `{"error": {"message": ..}}`.
fn error_message(body: &str) -> Option<String> {
    let value: serde_json::Value = serde_json::from_str(body).ok()?;
    let error = value.get("error")?;
    error
        .get("message")
        .and_then(|m| m.as_str())
        .or_else(|| error.as_str())
        .map(str::to_string)
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    #[test]
    fn test_classify_status_codes() {
        let empty = HeaderMap::new();
        assert!(matches!(
            classify(StatusCode::UNAUTHORIZED, &empty, ""),
            ProviderError::TokenExpired(_)
        ));
        assert!(matches!(
            classify(StatusCode::NOT_FOUND, &empty, ""),
            ProviderError::NotFound(_)
        ));
        assert!(matches!(
            classify(StatusCode::GONE, &empty, ""),
            ProviderError::CursorInvalid(_)
        ));
        let generic = classify(
            StatusCode::INTERNAL_SERVER_ERROR,
            &empty,
            r#"{"error":{"message":"backend exploded"}}"#,
        );
        assert_eq!(
            generic,
            ProviderError::Provider("status 500 Internal Server Error: backend exploded".into())
        );
    }

    #[test]
    fn test_forbidden_carries_required_scopes() {
        let mut headers = HeaderMap::new();
        headers.insert(
            WWW_AUTHENTICATE,
            HeaderValue::from_static(
                r#"Bearer realm="x", error="insufficient_scope", scope="Mail.Read Mail.Send""#,
            ),
        );
        let err = classify(StatusCode::FORBIDDEN, &headers, "{}");
        assert_eq!(
            err,
            ProviderError::InsufficientPermissions {
                message: "access forbidden".into(),
                required_scopes: vec!["Mail.Read".into(), "Mail.Send".into()],
            }
        );
    }

    #[test]
    fn test_quota_forbidden_is_rate_limit() {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_static("17"));
        let err = classify(
            StatusCode::FORBIDDEN,
            &headers,
            r#"{"error":{"errors":[{"reason":"userRateLimitExceeded"}]}}"#,
        );
        assert_eq!(
            err,
            ProviderError::RateLimited {
                retry_after_secs: Some(17)
            }
        );
        let err = classify(StatusCode::TOO_MANY_REQUESTS, &HeaderMap::new(), "");
        assert_eq!(err.retry_after().map(|d| d.as_secs()), Some(60));
    }
}
