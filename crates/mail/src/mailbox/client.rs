//! Mailbox client capability
//!
//! The sync engine and delivery pipeline consume the remote mailbox
//! through this trait; implementations are injected at construction so
//! tests can substitute scripted doubles.

use anyhow::Result;

use super::api::{HistoryPage, MailboxProfile, MessageRef, OutboundMessage, RemoteMessage, SentMessage};
use crate::models::MessageId;

/// Error indicating the change-log watermark has expired
///
/// Callers catch this specifically to fall back to a full sync; it is
/// never surfaced past the sync coordinator.
#[derive(Debug, thiserror::Error)]
#[error("History ID expired or invalid")]
pub struct HistoryExpiredError;

/// A failure reported by the underlying transport
///
/// The message text is what bounce classification runs against.
#[derive(Debug, thiserror::Error)]
#[error("{0}")]
pub struct TransportError(pub String);

impl TransportError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// The remote mailbox capability
///
/// One implementation talks to the real provider over HTTP; tests use
/// scripted stubs. All calls are synchronous; callers run them on worker
/// threads.
pub trait MailboxClient: Send + Sync {
    /// List message references, most recent first
    fn list_messages(
        &self,
        query: Option<&str>,
        max_results: usize,
        label_ids: &[String],
    ) -> Result<Vec<MessageRef>>;

    /// Fetch one full message
    fn get_message(&self, id: &MessageId) -> Result<RemoteMessage>;

    /// Fetch the change log since `start_history_id`
    ///
    /// Fails with [`HistoryExpiredError`] when the watermark is no longer
    /// valid on the remote side.
    fn get_history(&self, start_history_id: &str, max_results: usize) -> Result<HistoryPage>;

    /// Fetch the mailbox profile (identity + current change-log head)
    fn get_profile(&self) -> Result<MailboxProfile>;

    /// Transmit a composed message
    ///
    /// Fails with [`TransportError`] carrying the transport's message
    /// text.
    fn send(&self, outgoing: &OutboundMessage) -> Result<SentMessage>;

    /// Add and remove labels on a batch of messages
    fn modify_labels(
        &self,
        message_ids: &[MessageId],
        add: &[&str],
        remove: &[&str],
    ) -> Result<()>;
}
