//! Message reconciliation
//!
//! Merges freshly fetched remote messages into the local thread/message
//! mirror with dedup guarantees. One bad item never aborts a batch: it
//! is logged and skipped while the rest proceed.

use anyhow::Result;
use chrono::Utc;
use std::collections::HashMap;

use crate::models::{EmailAddress, Message, Thread, ThreadId};
use crate::storage::MailStore;

/// Counters from a reconciliation pass
///
/// Threads and messages already present count as processed work but not
/// as created/stored; only new rows increment the first two counters.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ReconcileStats {
    /// Number of threads created this pass
    pub threads_created: usize,
    /// Number of new messages stored this pass
    pub messages_stored: usize,
    /// Number of items skipped due to per-item errors
    pub errors: usize,
}

impl ReconcileStats {
    pub fn merge(&mut self, other: &ReconcileStats) {
        self.threads_created += other.threads_created;
        self.messages_stored += other.messages_stored;
        self.errors += other.errors;
    }
}

/// Upsert a batch of fetched messages and their threads
///
/// Messages are grouped by thread. Exactly one local thread exists per
/// (account, remote thread id) and one local message per remote message
/// id; processing the same batch twice changes nothing the second time.
pub fn reconcile_messages(
    store: &dyn MailStore,
    account_id: i64,
    fetched: Vec<Message>,
) -> Result<ReconcileStats> {
    let mut stats = ReconcileStats::default();

    // Group messages by thread
    let mut by_thread: HashMap<ThreadId, Vec<Message>> = HashMap::new();
    for message in fetched {
        by_thread
            .entry(message.thread_id.clone())
            .or_default()
            .push(message);
    }

    for (thread_id, group) in by_thread {
        let existing = match store.get_thread(account_id, &thread_id) {
            Ok(existing) => existing,
            Err(e) => {
                log::warn!(
                    "[SYNC] Failed to load thread {}: {:#}",
                    thread_id.as_str(),
                    e
                );
                stats.errors += group.len();
                continue;
            }
        };

        // Store messages first so thread counts read back accurately
        for message in &group {
            let is_new = match store.has_message(&message.id) {
                Ok(exists) => !exists,
                Err(e) => {
                    log::warn!("[SYNC] Failed to check message {}: {:#}", message.id.as_str(), e);
                    stats.errors += 1;
                    continue;
                }
            };

            if let Err(e) = store.upsert_message(message.clone()) {
                log::warn!("[SYNC] Failed to store message {}: {:#}", message.id.as_str(), e);
                stats.errors += 1;
                continue;
            }

            if is_new {
                stats.messages_stored += 1;
            }
        }

        let thread = compute_thread(store, account_id, &thread_id, &group, existing.as_ref());

        match store.upsert_thread(thread) {
            Ok(()) => {
                if existing.is_none() {
                    stats.threads_created += 1;
                }
            }
            Err(e) => {
                log::warn!(
                    "[SYNC] Failed to store thread {}: {:#}",
                    thread_id.as_str(),
                    e
                );
                stats.errors += 1;
            }
        }
    }

    Ok(stats)
}

/// Compute the thread row from the batch and any existing row
///
/// Subject, snippet and participants follow the most recent message in
/// the batch. The unread count is recomputed from the batch alone, not
/// kept as a running total; the next sync pass that touches the thread
/// corrects any drift outside the synced window.
fn compute_thread(
    store: &dyn MailStore,
    account_id: i64,
    thread_id: &ThreadId,
    group: &[Message],
    existing: Option<&Thread>,
) -> Thread {
    let latest = group
        .iter()
        .max_by_key(|m| m.received_at)
        .expect("Thread group must have at least one message");

    let message_count = store
        .count_messages_in_thread(account_id, thread_id)
        .unwrap_or(group.len());
    let unread_count = group.iter().filter(|m| !m.is_read).count();
    let is_starred = group.iter().any(|m| m.is_starred);

    let mut label_ids: Vec<String> = Vec::new();
    for message in group {
        for label in &message.label_ids {
            if !label_ids.contains(label) {
                label_ids.push(label.clone());
            }
        }
    }

    let mut participants: Vec<EmailAddress> = Vec::new();
    let everyone = std::iter::once(&latest.from)
        .chain(latest.to.iter())
        .chain(latest.cc.iter());
    for addr in everyone {
        if !participants.iter().any(|p| p.email == addr.email) {
            participants.push(addr.clone());
        }
    }

    let subject = if latest.subject.is_empty() {
        existing
            .map(|t| t.subject.clone())
            .unwrap_or_else(|| "(no subject)".to_string())
    } else {
        latest.subject.clone()
    };

    let last_message_at = match existing {
        Some(t) => t.last_message_at.max(latest.received_at),
        None => latest.received_at,
    };

    let mut thread = Thread::new(
        thread_id.clone(),
        account_id,
        subject,
        latest.snippet.clone(),
        last_message_at,
    )
    .with_participants(participants)
    .with_labels(label_ids)
    .with_starred(is_starred)
    .with_counts(message_count, unread_count);
    thread.updated_at = Utc::now();
    thread
}
