//! Thread query functions

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::models::{Message, Thread, ThreadId};
use crate::storage::MailStore;

/// Summary information for displaying a thread in a list
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadSummary {
    /// Thread ID
    pub id: ThreadId,
    /// Account this thread belongs to
    pub account_id: i64,
    /// Subject line
    pub subject: String,
    /// Preview snippet
    pub snippet: String,
    /// Timestamp of the most recent message
    pub last_message_at: DateTime<Utc>,
    /// Number of messages in the thread
    pub message_count: usize,
    /// Number of unread messages in the thread
    pub unread_count: usize,
    /// Whether the thread has unread messages
    pub is_unread: bool,
    /// Whether any message in the thread is starred
    pub is_starred: bool,
}

impl From<Thread> for ThreadSummary {
    fn from(thread: Thread) -> Self {
        let is_unread = thread.is_unread();
        Self {
            id: thread.id,
            account_id: thread.account_id,
            subject: thread.subject,
            snippet: thread.snippet,
            last_message_at: thread.last_message_at,
            message_count: thread.message_count,
            unread_count: thread.unread_count,
            is_unread,
            is_starred: thread.is_starred,
        }
    }
}

/// Detailed thread information including all messages
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ThreadDetail {
    /// The thread metadata
    pub thread: Thread,
    /// All messages in the thread, ordered chronologically
    pub messages: Vec<Message>,
}

/// List an account's threads with pagination
///
/// Returns threads sorted by last_message_at descending (newest first).
pub fn list_threads(
    store: &dyn MailStore,
    account_id: i64,
    limit: usize,
    offset: usize,
) -> Result<Vec<ThreadSummary>> {
    let threads = store.list_threads(account_id, limit, offset)?;
    Ok(threads.into_iter().map(ThreadSummary::from).collect())
}

/// List an account's threads by label with pagination
///
/// The portal's folder views are label filters: "INBOX", "TRASH",
/// "STARRED". Returns threads that have at least one message with the
/// given label, sorted by last_message_at descending.
pub fn list_threads_by_label(
    store: &dyn MailStore,
    account_id: i64,
    label: &str,
    limit: usize,
    offset: usize,
) -> Result<Vec<ThreadSummary>> {
    let threads = store.list_threads_by_label(account_id, label, limit, offset)?;
    Ok(threads.into_iter().map(ThreadSummary::from).collect())
}

/// Get detailed thread information including all messages with bodies
pub fn get_thread_detail(
    store: &dyn MailStore,
    account_id: i64,
    thread_id: &ThreadId,
) -> Result<Option<ThreadDetail>> {
    let thread = match store.get_thread(account_id, thread_id)? {
        Some(t) => t,
        None => return Ok(None),
    };

    let messages = store.list_messages_for_thread(account_id, thread_id)?;

    Ok(Some(ThreadDetail { thread, messages }))
}
