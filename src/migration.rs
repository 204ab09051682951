use sea_orm_migration::prelude::*;

pub struct Migrator;

#[async_trait::async_trait]
impl MigratorTrait for Migrator {
    fn migrations() -> Vec<Box<dyn MigrationTrait>> {
        vec![Box::new(Migration001CreateTables)]
    }
}

pub struct Migration001CreateTables;

impl MigrationName for Migration001CreateTables {
    fn name(&self) -> &str {
        "m001_create_tables"
    }
}

#[async_trait::async_trait]
impl MigrationTrait for Migration001CreateTables {
    async fn up(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        // provider_configs table
        manager
            .create_table(
                Table::create()
                    .table(ProviderConfigs::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(ProviderConfigs::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(ProviderConfigs::TenantId).uuid().not_null())
                    .col(ColumnDef::new(ProviderConfigs::UserId).uuid().not_null())
                    .col(
                        ColumnDef::new(ProviderConfigs::ProviderType)
                            .string_len(32)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ProviderConfigs::Email)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(ColumnDef::new(ProviderConfigs::Credentials).text().not_null())
                    .col(
                        ColumnDef::new(ProviderConfigs::IsActive)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(ProviderConfigs::SupportsContacts)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(ProviderConfigs::SupportsCalendar)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(ProviderConfigs::LastSyncedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(ProviderConfigs::Metadata).json_binary().not_null())
                    .col(
                        ColumnDef::new(ProviderConfigs::ErrorStreak)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(ProviderConfigs::ActivityRate)
                            .double()
                            .not_null()
                            .default(0.0),
                    )
                    .col(ColumnDef::new(ProviderConfigs::LastError).text().null())
                    .col(
                        ColumnDef::new(ProviderConfigs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(ProviderConfigs::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_provider_configs_tenant")
                    .table(ProviderConfigs::Table)
                    .col(ProviderConfigs::TenantId)
                    .to_owned(),
            )
            .await?;

        // sync_jobs table
        manager
            .create_table(
                Table::create()
                    .table(SyncJobs::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(SyncJobs::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(SyncJobs::Lane).string_len(16).not_null())
                    .col(ColumnDef::new(SyncJobs::Kind).string_len(32).not_null())
                    .col(
                        ColumnDef::new(SyncJobs::IdempotencyKey)
                            .string_len(128)
                            .not_null(),
                    )
                    .col(ColumnDef::new(SyncJobs::DedupKey).string_len(128).null())
                    .col(ColumnDef::new(SyncJobs::TenantId).uuid().not_null())
                    .col(ColumnDef::new(SyncJobs::ProviderId).uuid().not_null())
                    .col(ColumnDef::new(SyncJobs::ProviderType).string_len(32).not_null())
                    .col(ColumnDef::new(SyncJobs::Payload).json_binary().not_null())
                    .col(
                        ColumnDef::new(SyncJobs::Status)
                            .string_len(16)
                            .not_null()
                            .default("waiting"),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::AttemptsMade)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(SyncJobs::MaxAttempts).integer().not_null())
                    .col(
                        ColumnDef::new(SyncJobs::RunAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::LockedUntil)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(SyncJobs::LockToken).uuid().null())
                    .col(ColumnDef::new(SyncJobs::LastError).text().null())
                    .col(
                        ColumnDef::new(SyncJobs::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::StartedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(SyncJobs::FinishedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(ColumnDef::new(SyncJobs::DurationMs).big_integer().null())
                    .to_owned(),
            )
            .await?;

        // NULL dedup keys (terminal jobs) never collide
        manager
            .create_index(
                Index::create()
                    .name("idx_sync_jobs_dedup_key")
                    .table(SyncJobs::Table)
                    .col(SyncJobs::DedupKey)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_sync_jobs_lane_status_run_at")
                    .table(SyncJobs::Table)
                    .col(SyncJobs::Lane)
                    .col(SyncJobs::Status)
                    .col(SyncJobs::RunAt)
                    .to_owned(),
            )
            .await?;

        // cross_provider_links table
        manager
            .create_table(
                Table::create()
                    .table(CrossProviderLinks::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(CrossProviderLinks::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(ColumnDef::new(CrossProviderLinks::TenantId).uuid().not_null())
                    .col(
                        ColumnDef::new(CrossProviderLinks::ContentHash)
                            .string_len(64)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CrossProviderLinks::ProviderCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(CrossProviderLinks::MergedIsRead)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(CrossProviderLinks::MergedIsStarred)
                            .boolean()
                            .not_null()
                            .default(false),
                    )
                    .col(
                        ColumnDef::new(CrossProviderLinks::MergedFolder)
                            .string_len(255)
                            .not_null()
                            .default("INBOX"),
                    )
                    .col(
                        ColumnDef::new(CrossProviderLinks::MergedLabels)
                            .json_binary()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CrossProviderLinks::ConflictStrategy)
                            .string_len(32)
                            .not_null()
                            .default("LAST_WRITE_WINS"),
                    )
                    .col(
                        ColumnDef::new(CrossProviderLinks::LastConflict)
                            .json_binary()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CrossProviderLinks::LastResolvedAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(CrossProviderLinks::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(CrossProviderLinks::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .to_owned(),
            )
            .await?;

        // One link per fingerprint per tenant
        manager
            .create_index(
                Index::create()
                    .name("idx_cross_provider_links_tenant_hash")
                    .table(CrossProviderLinks::Table)
                    .col(CrossProviderLinks::TenantId)
                    .col(CrossProviderLinks::ContentHash)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // emails table
        manager
            .create_table(
                Table::create()
                    .table(Emails::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Emails::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Emails::TenantId).uuid().not_null())
                    .col(ColumnDef::new(Emails::ProviderId).uuid().not_null())
                    .col(ColumnDef::new(Emails::RemoteId).string_len(255).not_null())
                    .col(ColumnDef::new(Emails::ThreadId).string_len(255).null())
                    .col(ColumnDef::new(Emails::MessageId).string_len(998).null())
                    .col(ColumnDef::new(Emails::Subject).text().not_null())
                    .col(ColumnDef::new(Emails::FromAddress).string_len(512).not_null())
                    .col(ColumnDef::new(Emails::ToAddresses).json_binary().not_null())
                    .col(ColumnDef::new(Emails::Snippet).text().not_null())
                    .col(
                        ColumnDef::new(Emails::SentAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Emails::ReceivedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Emails::FolderPath).string_len(512).not_null())
                    .col(ColumnDef::new(Emails::ContentHash).string_len(64).not_null())
                    .col(ColumnDef::new(Emails::LinkId).uuid().null())
                    .col(ColumnDef::new(Emails::RemoteIsRead).boolean().not_null())
                    .col(ColumnDef::new(Emails::RemoteIsStarred).boolean().not_null())
                    .col(ColumnDef::new(Emails::RemoteFolder).string_len(512).not_null())
                    .col(ColumnDef::new(Emails::RemoteLabels).json_binary().not_null())
                    .col(
                        ColumnDef::new(Emails::RemoteChangedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(ColumnDef::new(Emails::IsRead).boolean().not_null())
                    .col(ColumnDef::new(Emails::IsStarred).boolean().not_null())
                    .col(ColumnDef::new(Emails::Folder).string_len(512).not_null())
                    .col(ColumnDef::new(Emails::Labels).json_binary().not_null())
                    .col(
                        ColumnDef::new(Emails::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Emails::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .from(Emails::Table, Emails::ProviderId)
                            .to(ProviderConfigs::Table, ProviderConfigs::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .from(Emails::Table, Emails::LinkId)
                            .to(CrossProviderLinks::Table, CrossProviderLinks::Id)
                            .on_delete(ForeignKeyAction::SetNull),
                    )
                    .to_owned(),
            )
            .await?;

        // Unique index on (provider_id, remote_id)
        manager
            .create_index(
                Index::create()
                    .name("idx_emails_provider_remote")
                    .table(Emails::Table)
                    .col(Emails::ProviderId)
                    .col(Emails::RemoteId)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_emails_link")
                    .table(Emails::Table)
                    .col(Emails::LinkId)
                    .to_owned(),
            )
            .await?;

        // folders table
        manager
            .create_table(
                Table::create()
                    .table(Folders::Table)
                    .if_not_exists()
                    .col(ColumnDef::new(Folders::Id).uuid().not_null().primary_key())
                    .col(ColumnDef::new(Folders::ProviderId).uuid().not_null())
                    .col(ColumnDef::new(Folders::Path).text().not_null())
                    .col(ColumnDef::new(Folders::Name).string_len(255).not_null())
                    .col(ColumnDef::new(Folders::Delimiter).string_len(8).null())
                    .col(ColumnDef::new(Folders::ParentId).uuid().null())
                    .col(
                        ColumnDef::new(Folders::Level)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(ColumnDef::new(Folders::SpecialUse).string_len(16).null())
                    .col(
                        ColumnDef::new(Folders::IsSelectable)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(Folders::TotalCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Folders::UnreadCount)
                            .integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(Folders::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(Folders::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .from(Folders::Table, Folders::ProviderId)
                            .to(ProviderConfigs::Table, ProviderConfigs::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Unique index on (provider_id, path)
        manager
            .create_index(
                Index::create()
                    .name("idx_folders_provider_path")
                    .table(Folders::Table)
                    .col(Folders::ProviderId)
                    .col(Folders::Path)
                    .unique()
                    .to_owned(),
            )
            .await?;

        // webhook_subscriptions table
        manager
            .create_table(
                Table::create()
                    .table(WebhookSubscriptions::Table)
                    .if_not_exists()
                    .col(
                        ColumnDef::new(WebhookSubscriptions::Id)
                            .uuid()
                            .not_null()
                            .primary_key(),
                    )
                    .col(
                        ColumnDef::new(WebhookSubscriptions::ProviderId)
                            .uuid()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WebhookSubscriptions::Resource)
                            .string_len(512)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WebhookSubscriptions::ExternalId)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WebhookSubscriptions::ClientState)
                            .string_len(255)
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WebhookSubscriptions::ExpiresAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WebhookSubscriptions::NotificationCount)
                            .big_integer()
                            .not_null()
                            .default(0),
                    )
                    .col(
                        ColumnDef::new(WebhookSubscriptions::LastNotificationAt)
                            .timestamp_with_time_zone()
                            .null(),
                    )
                    .col(
                        ColumnDef::new(WebhookSubscriptions::IsActive)
                            .boolean()
                            .not_null()
                            .default(true),
                    )
                    .col(
                        ColumnDef::new(WebhookSubscriptions::CreatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .col(
                        ColumnDef::new(WebhookSubscriptions::UpdatedAt)
                            .timestamp_with_time_zone()
                            .not_null(),
                    )
                    .foreign_key(
                        ForeignKey::create()
                            .from(WebhookSubscriptions::Table, WebhookSubscriptions::ProviderId)
                            .to(ProviderConfigs::Table, ProviderConfigs::Id)
                            .on_delete(ForeignKeyAction::Cascade),
                    )
                    .to_owned(),
            )
            .await?;

        // Unique index on (provider_id, resource)
        manager
            .create_index(
                Index::create()
                    .name("idx_webhook_subscriptions_provider_resource")
                    .table(WebhookSubscriptions::Table)
                    .col(WebhookSubscriptions::ProviderId)
                    .col(WebhookSubscriptions::Resource)
                    .unique()
                    .to_owned(),
            )
            .await?;

        manager
            .create_index(
                Index::create()
                    .name("idx_webhook_subscriptions_external")
                    .table(WebhookSubscriptions::Table)
                    .col(WebhookSubscriptions::ExternalId)
                    .to_owned(),
            )
            .await?;

        Ok(())
    }

    async fn down(&self, manager: &SchemaManager) -> Result<(), DbErr> {
        manager
            .drop_table(Table::drop().table(WebhookSubscriptions::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Folders::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(Emails::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(CrossProviderLinks::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(SyncJobs::Table).to_owned())
            .await?;
        manager
            .drop_table(Table::drop().table(ProviderConfigs::Table).to_owned())
            .await?;
        Ok(())
    }
}

// ========== Table identifiers ==========

#[derive(Iden)]
enum ProviderConfigs {
    Table,
    Id,
    TenantId,
    UserId,
    ProviderType,
    Email,
    Credentials,
    IsActive,
    SupportsContacts,
    SupportsCalendar,
    LastSyncedAt,
    Metadata,
    ErrorStreak,
    ActivityRate,
    LastError,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum SyncJobs {
    Table,
    Id,
    Lane,
    Kind,
    IdempotencyKey,
    DedupKey,
    TenantId,
    ProviderId,
    ProviderType,
    Payload,
    Status,
    AttemptsMade,
    MaxAttempts,
    RunAt,
    LockedUntil,
    LockToken,
    LastError,
    CreatedAt,
    StartedAt,
    FinishedAt,
    DurationMs,
}

#[derive(Iden)]
enum CrossProviderLinks {
    Table,
    Id,
    TenantId,
    ContentHash,
    ProviderCount,
    MergedIsRead,
    MergedIsStarred,
    MergedFolder,
    MergedLabels,
    ConflictStrategy,
    LastConflict,
    LastResolvedAt,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum Emails {
    Table,
    Id,
    TenantId,
    ProviderId,
    RemoteId,
    ThreadId,
    MessageId,
    Subject,
    FromAddress,
    ToAddresses,
    Snippet,
    SentAt,
    ReceivedAt,
    FolderPath,
    ContentHash,
    LinkId,
    RemoteIsRead,
    RemoteIsStarred,
    RemoteFolder,
    RemoteLabels,
    RemoteChangedAt,
    IsRead,
    IsStarred,
    Folder,
    Labels,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum Folders {
    Table,
    Id,
    ProviderId,
    Path,
    Name,
    Delimiter,
    ParentId,
    Level,
    SpecialUse,
    IsSelectable,
    TotalCount,
    UnreadCount,
    CreatedAt,
    UpdatedAt,
}

#[derive(Iden)]
enum WebhookSubscriptions {
    Table,
    Id,
    ProviderId,
    Resource,
    ExternalId,
    ClientState,
    ExpiresAt,
    NotificationCount,
    LastNotificationAt,
    IsActive,
    CreatedAt,
    UpdatedAt,
}
