use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, IntoActiveModel, Set};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::error::{ProviderError, ProviderResult};
use super::http;
use super::types::ProviderType;
use crate::config::{OAuthClient, OAuthConfig};
use crate::crypto::CredentialCipher;
use crate::db::entities::provider_config;

/// Access tokens expiring within this margin are refreshed before use.
const REFRESH_MARGIN_SECS: i64 = 60;

/// A provider row together with a credential that is live right now.
#[derive(Debug, Clone)]
pub struct ProviderWithToken {
    pub provider: provider_config::Model,
    /// OAuth bearer token, or the account password for IMAP.
    pub access_token: String,
}

/// Resolves and refreshes credentials per provider record.
#[async_trait]
pub trait TokenSupplier: Send + Sync {
    /// Fails when the row is missing or its credential cannot be made usable.
    async fn get_provider_with_token(&self, provider_id: Uuid)
        -> ProviderResult<ProviderWithToken>;
}

/// Plaintext shape of `provider_configs.credentials` before sealing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Credentials {
    #[serde(rename = "oauth")]
    OAuth {
        access_token: String,
        refresh_token: Option<String>,
        expires_at: Option<DateTime<Utc>>,
    },
    Password { password: String },
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    expires_in: Option<i64>,
    refresh_token: Option<String>,
}

/// Token supplier backed by the sealed credentials column.
#[derive(Clone)]
pub struct StoredTokenSupplier {
    db: DatabaseConnection,
    cipher: CredentialCipher,
    oauth: OAuthConfig,
    http: reqwest::Client,
}

impl StoredTokenSupplier {
    pub fn new(db: DatabaseConnection, cipher: CredentialCipher, oauth: OAuthConfig) -> Self {
        Self {
            db,
            cipher,
            oauth,
            http: http::build_client(),
        }
    }

    fn oauth_client(&self, provider_type: ProviderType) -> ProviderResult<&OAuthClient> {
        match provider_type {
            ProviderType::Gmail => Ok(&self.oauth.google),
            ProviderType::Outlook => Ok(&self.oauth.microsoft),
            ProviderType::Imap => Err(ProviderError::Unsupported(
                "imap accounts do not use oauth".to_string(),
            )),
        }
    }

    async fn refresh(
        &self,
        provider_type: ProviderType,
        refresh_token: &str,
    ) -> ProviderResult<TokenResponse> {
        let client = self.oauth_client(provider_type)?;
        let response = self
            .http
            .post(&client.token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", refresh_token),
                ("client_id", client.client_id.as_str()),
                ("client_secret", client.client_secret.as_str()),
            ])
            .send()
            .await?;

        // invalid_grant comes back as 400; the refresh token is dead either way.
        let status = response.status();
        if status == reqwest::StatusCode::BAD_REQUEST || status == reqwest::StatusCode::UNAUTHORIZED
        {
            let body = response.text().await.unwrap_or_default();
            return Err(ProviderError::TokenExpired(format!(
                "token refresh rejected: {}",
                body.chars().take(256).collect::<String>()
            )));
        }
        http::read_json(response).await
    }
}

#[async_trait]
impl TokenSupplier for StoredTokenSupplier {
    async fn get_provider_with_token(
        &self,
        provider_id: Uuid,
    ) -> ProviderResult<ProviderWithToken> {
        let provider = provider_config::Entity::find_by_id(provider_id)
            .one(&self.db)
            .await
            .map_err(|e| ProviderError::Provider(e.to_string()))?
            .ok_or_else(|| ProviderError::NotFound(format!("provider {}", provider_id)))?;

        let credentials: Credentials = self
            .cipher
            .open_json(&provider.credentials)
            .map_err(|e| ProviderError::TokenExpired(format!("stored credentials unusable: {e:#}")))?;

        let (access_token, refresh_token, expires_at) = match credentials {
            Credentials::Password { password } => {
                return Ok(ProviderWithToken {
                    provider,
                    access_token: password,
                })
            }
            Credentials::OAuth {
                access_token,
                refresh_token,
                expires_at,
            } => (access_token, refresh_token, expires_at),
        };

        let now = Utc::now();
        let fresh = expires_at.map_or(true, |at| at > now + Duration::seconds(REFRESH_MARGIN_SECS));
        if fresh {
            return Ok(ProviderWithToken {
                provider,
                access_token,
            });
        }

        let Some(refresh_token) = refresh_token else {
            return Err(ProviderError::TokenExpired(
                "access token expired and no refresh token is stored".to_string(),
            ));
        };
        let provider_type: ProviderType = provider
            .provider_type
            .parse()
            .map_err(|e: super::types::UnknownProviderType| ProviderError::Provider(e.to_string()))?;

        let refreshed = self.refresh(provider_type, &refresh_token).await?;
        let renewed = Credentials::OAuth {
            access_token: refreshed.access_token.clone(),
            refresh_token: refreshed.refresh_token.or(Some(refresh_token)),
            expires_at: refreshed
                .expires_in
                .map(|secs| now + Duration::seconds(secs)),
        };
        let sealed = self
            .cipher
            .seal_json(&renewed)
            .map_err(|e| ProviderError::Provider(format!("{e:#}")))?;

        let mut active = provider.into_active_model();
        active.credentials = Set(sealed);
        active.updated_at = Set(now);
        let provider = active
            .update(&self.db)
            .await
            .map_err(|e| ProviderError::Provider(e.to_string()))?;

        tracing::info!(provider_id = %provider_id, "Refreshed access token");
        Ok(ProviderWithToken {
            provider,
            access_token: refreshed.access_token,
        })
    }
}
