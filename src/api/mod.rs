//! Thin HTTP surface: provider webhooks, account lifecycle, manual triggers
//! and queue health.

pub mod error;
mod health;
mod providers;
pub mod router;
mod webhooks;

pub use error::ApiError;
pub use router::build_router;
