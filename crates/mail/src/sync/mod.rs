//! Sync engine for mirroring remote mailbox state
//!
//! Provides idempotent sync operations that can be safely retried: the
//! coordinator picks full vs incremental strategy and drives the mailbox
//! client; the reconciler merges fetched messages into the local store
//! without duplicating rows.

mod coordinator;
mod reconcile;
mod timing;

pub use coordinator::{SyncCoordinator, SyncOptions, SyncReport, SyncType};
pub use reconcile::{ReconcileStats, reconcile_messages};
pub use timing::cooldown_elapsed;
