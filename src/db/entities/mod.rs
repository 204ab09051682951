pub mod cross_provider_link;
pub mod email;
pub mod folder;
pub mod provider_config;
pub mod sync_job;
pub mod webhook_subscription;
