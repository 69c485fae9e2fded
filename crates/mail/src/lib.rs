//! Mail crate - the Harbor portal's email engine
//!
//! This crate provides the portal's mailbox mirror and delivery
//! pipeline:
//! - Domain models (Account, Thread, Message, SyncState, SendStatus)
//! - The mailbox client capability and a Gmail-backed implementation
//! - Storage trait abstractions (in-memory and SQLite)
//! - Idempotent sync engine with incremental change-log consumption
//! - Send pipeline with bounce classification, automatic retries,
//!   durable scheduled sends and open tracking
//! - Action handlers for label mutations (read/unread, star, trash)
//! - Query API for route-layer consumption
//!
//! This crate has zero UI and route dependencies; the portal's HTTP
//! layer drives it through the public types below.

pub mod actions;
pub mod config;
pub mod mailbox;
pub mod models;
pub mod query;
pub mod send;
pub mod storage;
pub mod sync;

pub use actions::ActionHandler;
pub use config::MailboxOAuthConfig;
pub use mailbox::{
    CredentialStore, GmailMailboxClient, HistoryExpiredError, MailboxClient, MailboxTokens,
    StoredCredentialStore, TokenCipher, TransportError, normalize_message,
};
pub use models::{
    Account, Attachment, BounceKind, DeliveryState, Draft, EmailAddress, Message, MessageId,
    OutgoingEmail, SendStatus, SyncState, SyncStatus, Thread, ThreadId,
};
pub use query::{
    ThreadDetail, ThreadSummary, get_thread_detail, list_threads, list_threads_by_label,
};
pub use send::{
    RetryScanner, RetryStats, ScheduleStats, ScheduledSendRunner, SendOutcome, SendPipeline,
    TRACKING_PIXEL_GIF, classify_bounce, inject_tracking_pixel, new_tracking_id, next_retry_at,
    record_open, serve_open_pixel,
};
pub use storage::{InMemoryMailStore, MailStore, OpenEvent, ScheduledSend, SqliteMailStore};
pub use sync::{
    ReconcileStats, SyncCoordinator, SyncOptions, SyncReport, SyncType, cooldown_elapsed,
    reconcile_messages,
};
