pub mod entities;

use sea_orm::{ConnectOptions, Database, DatabaseConnection};
use std::time::Duration;

pub async fn connect(database_url: &str) -> anyhow::Result<DatabaseConnection> {
    let mut options = ConnectOptions::new(database_url.to_string());
    options
        .max_connections(32)
        .connect_timeout(Duration::from_secs(10))
        .sqlx_logging(false);
    let db = Database::connect(options).await?;
    tracing::info!("Connected to database");
    Ok(db)
}

/// Fresh in-memory database with the production schema applied.
#[cfg(test)]
pub async fn test_db() -> DatabaseConnection {
    use sea_orm_migration::MigratorTrait;

    // One connection: every new connection to `sqlite::memory:` is a new database.
    let mut options = ConnectOptions::new("sqlite::memory:".to_string());
    options
        .max_connections(1)
        .min_connections(1)
        .sqlx_logging(false);
    let db = Database::connect(options)
        .await
        .expect("open in-memory sqlite");
    crate::migration::Migrator::up(&db, None)
        .await
        .expect("apply migrations");
    db
}

/// Row builders shared by store tests.
#[cfg(test)]
pub mod fixtures {
    use base64::engine::general_purpose::STANDARD as BASE64_STANDARD;
    use base64::Engine;
    use chrono::Utc;
    use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
    use uuid::Uuid;

    use super::entities::{email, provider_config};
    use crate::crypto::CredentialCipher;
    use crate::providers::token::Credentials;
    use crate::providers::ProviderType;

    pub fn cipher() -> CredentialCipher {
        CredentialCipher::from_base64(&BASE64_STANDARD.encode([42u8; 32])).expect("test key")
    }

    pub async fn insert_provider_with(
        db: &DatabaseConnection,
        provider_type: ProviderType,
        cipher: &CredentialCipher,
        credentials: &Credentials,
    ) -> provider_config::Model {
        insert_provider_full(
            db,
            Uuid::new_v4(),
            provider_type,
            cipher.seal_json(credentials).expect("seal"),
            serde_json::json!({}),
        )
        .await
    }

    /// Active provider for `tenant_id` with password credentials and the given metadata.
    pub async fn insert_provider(
        db: &DatabaseConnection,
        tenant_id: Uuid,
        provider_type: ProviderType,
        metadata: serde_json::Value,
    ) -> provider_config::Model {
        let sealed = cipher()
            .seal_json(&Credentials::Password {
                password: "secret".into(),
            })
            .expect("seal");
        insert_provider_full(db, tenant_id, provider_type, sealed, metadata).await
    }

    async fn insert_provider_full(
        db: &DatabaseConnection,
        tenant_id: Uuid,
        provider_type: ProviderType,
        credentials: String,
        metadata: serde_json::Value,
    ) -> provider_config::Model {
        let now = Utc::now();
        let id = Uuid::new_v4();
        provider_config::ActiveModel {
            id: Set(id),
            tenant_id: Set(tenant_id),
            user_id: Set(Uuid::new_v4()),
            provider_type: Set(provider_type.as_str().to_string()),
            email: Set(format!("{}@{}.example.com", &id.to_string()[..8], provider_type)),
            credentials: Set(credentials),
            is_active: Set(true),
            supports_contacts: Set(false),
            supports_calendar: Set(false),
            last_synced_at: Set(None),
            metadata: Set(metadata),
            error_streak: Set(0),
            activity_rate: Set(0.0),
            last_error: Set(None),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(db)
        .await
        .expect("insert provider")
    }

    /// Inbox message of `provider`, unread and unstarred on the provider side.
    pub async fn insert_email(
        db: &DatabaseConnection,
        provider: &provider_config::Model,
        remote_id: &str,
        message_id: Option<&str>,
    ) -> email::Model {
        let now = Utc::now();
        email::ActiveModel {
            id: Set(Uuid::new_v4()),
            tenant_id: Set(provider.tenant_id),
            provider_id: Set(provider.id),
            remote_id: Set(remote_id.to_string()),
            thread_id: Set(None),
            message_id: Set(message_id.map(str::to_string)),
            subject: Set(format!("Subject {}", remote_id)),
            from_address: Set("sender@example.com".into()),
            to_addresses: Set(serde_json::json!([provider.email])),
            snippet: Set(String::new()),
            sent_at: Set(now),
            received_at: Set(now),
            folder_path: Set("INBOX".into()),
            content_hash: Set(String::new()),
            link_id: Set(None),
            remote_is_read: Set(false),
            remote_is_starred: Set(false),
            remote_folder: Set("INBOX".into()),
            remote_labels: Set(serde_json::json!([])),
            remote_changed_at: Set(now),
            is_read: Set(false),
            is_starred: Set(false),
            folder: Set("INBOX".into()),
            labels: Set(serde_json::json!([])),
            created_at: Set(now),
            updated_at: Set(now),
        }
        .insert(db)
        .await
        .expect("insert email")
    }
}
