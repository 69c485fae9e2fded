//! Storage trait definitions

use crate::models::{
    Account, Draft, Message, MessageId, OutgoingEmail, SendStatus, SyncState, Thread, ThreadId,
};
use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A deferred outbound message, durable across process restarts
///
/// Dispatched by the scheduled-send scanner once `due_at` has passed,
/// then deleted; the delivery audit trail lives on the SendStatus row
/// the dispatch creates.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScheduledSend {
    /// Unique integer identifier (database primary key)
    pub id: i64,
    /// Owning account (database primary key)
    pub account_id: i64,
    /// The outbound parameters to send
    pub email: OutgoingEmail,
    /// Earliest time the scanner may dispatch this row
    pub due_at: DateTime<Utc>,
    /// When the send was scheduled
    pub created_at: DateTime<Utc>,
}

/// One recorded open of a tracked message
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OpenEvent {
    /// Unique integer identifier (database primary key)
    pub id: i64,
    /// The tracking pixel id that was hit
    pub tracking_id: String,
    /// The message the pixel belongs to
    pub message_id: MessageId,
    /// When the open was recorded
    pub opened_at: DateTime<Utc>,
    /// Requesting IP, if known
    pub ip: Option<String>,
    /// Coarse IP-derived location, resolved by the caller
    pub location: Option<String>,
    /// Requesting user agent, if known
    pub user_agent: Option<String>,
}

/// Trait for mail storage operations
///
/// Abstracts over storage backends (in-memory for tests, SQLite for the
/// portal) and provides the persistence operations the sync engine and
/// delivery pipeline need.
pub trait MailStore: Send + Sync {
    // === Accounts ===

    /// Insert an account, returning it with its assigned id
    ///
    /// Also creates the account's initial SyncState (1:1).
    fn insert_account(&self, account: Account) -> Result<Account>;

    /// Get an account by id
    fn get_account(&self, id: i64) -> Result<Option<Account>>;

    /// Get an account by email address
    fn get_account_by_email(&self, email: &str) -> Result<Option<Account>>;

    /// Replace an account's encrypted token blob
    ///
    /// The blob is ciphertext owned by the credential store; the mail
    /// store never sees plaintext.
    fn update_account_tokens(&self, account_id: i64, ciphertext: &str) -> Result<()>;

    // === Threads ===

    /// Insert or update a thread
    fn upsert_thread(&self, thread: Thread) -> Result<()>;

    /// Get a thread by account and remote id
    fn get_thread(&self, account_id: i64, id: &ThreadId) -> Result<Option<Thread>>;

    /// Check if a thread exists
    fn has_thread(&self, account_id: i64, id: &ThreadId) -> Result<bool>;

    /// List an account's threads, ordered by last_message_at descending
    fn list_threads(&self, account_id: i64, limit: usize, offset: usize) -> Result<Vec<Thread>>;

    /// List an account's threads that have at least one message with the
    /// given label, ordered by last_message_at descending
    fn list_threads_by_label(
        &self,
        account_id: i64,
        label: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Thread>>;

    /// Count an account's threads
    fn count_threads(&self, account_id: i64) -> Result<usize>;

    // === Messages ===

    /// Insert a message, or refresh its mutable fields if it exists
    ///
    /// Remote message ids are globally unique; on conflict only the label
    /// set and read/starred flags are updated. Body fields and identifiers
    /// are immutable once stored.
    fn upsert_message(&self, message: Message) -> Result<()>;

    /// Get a message by remote id, bodies included
    fn get_message(&self, id: &MessageId) -> Result<Option<Message>>;

    /// Check if a message exists
    fn has_message(&self, id: &MessageId) -> Result<bool>;

    /// List messages for a thread, ordered by received_at ascending
    fn list_messages_for_thread(
        &self,
        account_id: i64,
        thread_id: &ThreadId,
    ) -> Result<Vec<Message>>;

    /// List message ids for a thread
    fn get_message_ids_for_thread(
        &self,
        account_id: i64,
        thread_id: &ThreadId,
    ) -> Result<Vec<MessageId>>;

    /// Count messages in a thread
    fn count_messages_in_thread(&self, account_id: i64, thread_id: &ThreadId) -> Result<usize>;

    /// Replace a message's label set, refreshing its read/starred flags
    /// and the owning thread's aggregates
    fn update_message_labels(&self, id: &MessageId, label_ids: Vec<String>) -> Result<()>;

    /// Find the message carrying the given tracking pixel id
    fn find_message_by_tracking_id(&self, tracking_id: &str) -> Result<Option<Message>>;

    // === Sync state ===

    /// Get sync state for an account
    fn get_sync_state(&self, account_id: i64) -> Result<Option<SyncState>>;

    /// Save sync state (upsert)
    fn save_sync_state(&self, state: SyncState) -> Result<()>;

    /// Atomically claim the account's sync lease
    ///
    /// Creates the state row if the account has never synced. Returns the
    /// claimed state, or `None` when another sync holds a live lease.
    fn try_claim_sync(
        &self,
        account_id: i64,
        now: DateTime<Utc>,
        lease_secs: i64,
    ) -> Result<Option<SyncState>>;

    // === Drafts ===

    /// Persist an outbound parameter set, returning the draft row
    fn insert_draft(&self, account_id: i64, email: &OutgoingEmail) -> Result<Draft>;

    /// Get a draft by id
    fn get_draft(&self, id: i64) -> Result<Option<Draft>>;

    // === Send status ===

    /// Insert a send status row, returning it with its assigned id
    fn insert_send_status(&self, status: SendStatus) -> Result<SendStatus>;

    /// Get a send status row by id
    fn get_send_status(&self, id: i64) -> Result<Option<SendStatus>>;

    /// Persist a send status row's current fields
    fn update_send_status(&self, status: &SendStatus) -> Result<()>;

    /// Rows in a failure state with retry budget left and a due
    /// next_retry_at, oldest due first
    fn list_retry_eligible(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SendStatus>>;

    // === Scheduled sends ===

    /// Persist a deferred send due at `due_at`
    fn insert_scheduled_send(
        &self,
        account_id: i64,
        email: &OutgoingEmail,
        due_at: DateTime<Utc>,
    ) -> Result<ScheduledSend>;

    /// Scheduled sends whose due_at has passed, oldest first
    fn list_due_scheduled_sends(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledSend>>;

    /// Remove a dispatched (or abandoned) scheduled send
    fn delete_scheduled_send(&self, id: i64) -> Result<()>;

    // === Open tracking ===

    /// Append an open event, returning it with its assigned id
    fn insert_open_event(&self, event: OpenEvent) -> Result<OpenEvent>;

    /// Open events recorded for a message, oldest first
    fn list_open_events(&self, message_id: &MessageId) -> Result<Vec<OpenEvent>>;

    // === Maintenance ===

    /// Clear all data (for testing)
    fn clear(&self) -> Result<()>;
}
