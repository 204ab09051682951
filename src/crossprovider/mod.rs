//! Recognising the same message across a tenant's accounts and keeping its
//! state consistent between them.

pub mod conflict;
pub mod dedup;
pub mod fingerprint;

pub use conflict::{
    apply_resolved_state, reconcile_link, resolve, resolve_link, set_link_strategy,
    ConflictStrategy, EmailState, ProviderPriority, Reconciled, Resolution, ResolvedState,
};
pub use dedup::{dedup_email, detach_provider, DedupOutcome, EmailIdentity};
