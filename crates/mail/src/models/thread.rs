//! Thread model representing one remote conversation

use super::{EmailAddress, labels};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a thread (remote-assigned thread ID)
///
/// Thread identity is scoped per account: the same remote ID under two
/// accounts is two local threads.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ThreadId(pub String);

impl ThreadId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for ThreadId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for ThreadId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// A thread mirrors one remote conversation containing one or more messages
///
/// Threads are never deleted locally; trashing is expressed through the
/// label set.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Thread {
    /// Remote thread ID
    pub id: ThreadId,
    /// Owning account (database primary key)
    pub account_id: i64,
    /// Subject line of the thread
    pub subject: String,
    /// Preview text (snippet) of the latest message
    pub snippet: String,
    /// Everyone who appears on a message in the thread
    pub participants: Vec<EmailAddress>,
    /// Union of the provider labels across the thread's messages
    pub label_ids: Vec<String>,
    /// Whether any message in the thread is starred
    pub is_starred: bool,
    /// Number of messages in the thread
    pub message_count: usize,
    /// Number of unread messages in the thread
    pub unread_count: usize,
    /// Timestamp of the most recent message in the thread
    pub last_message_at: DateTime<Utc>,
    /// When the local mirror row last changed
    pub updated_at: DateTime<Utc>,
}

impl Thread {
    /// Create a new thread with the given core properties
    pub fn new(
        id: ThreadId,
        account_id: i64,
        subject: impl Into<String>,
        snippet: impl Into<String>,
        last_message_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            account_id,
            subject: subject.into(),
            snippet: snippet.into(),
            participants: Vec::new(),
            label_ids: Vec::new(),
            is_starred: false,
            message_count: 0,
            unread_count: 0,
            last_message_at,
            updated_at: Utc::now(),
        }
    }

    pub fn with_participants(mut self, participants: Vec<EmailAddress>) -> Self {
        self.participants = participants;
        self
    }

    pub fn with_labels(mut self, label_ids: Vec<String>) -> Self {
        self.label_ids = label_ids;
        self
    }

    pub fn with_starred(mut self, is_starred: bool) -> Self {
        self.is_starred = is_starred;
        self
    }

    pub fn with_counts(mut self, message_count: usize, unread_count: usize) -> Self {
        self.message_count = message_count;
        self.unread_count = unread_count;
        self
    }

    /// Whether the thread has unread messages
    pub fn is_unread(&self) -> bool {
        self.unread_count > 0
    }

    /// Whether the thread carries the trash marker label
    pub fn is_trashed(&self) -> bool {
        self.label_ids.iter().any(|l| l == labels::TRASH)
    }
}
