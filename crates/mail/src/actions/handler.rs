//! Action handler for email label mutations
//!
//! Coordinates between the mailbox provider and local storage.

use anyhow::Result;
use log::info;
use std::sync::Arc;

use crate::mailbox::MailboxClient;
use crate::models::{ThreadId, labels};
use crate::storage::MailStore;

/// Handler for thread-level label mutations: read/unread, star/unstar,
/// trash/restore
///
/// Actions are performed in two steps:
/// 1. Call the provider to update server state
/// 2. Update local storage to reflect the change
///
/// This keeps the server the source of truth, with the local mirror
/// following it.
pub struct ActionHandler {
    client: Arc<dyn MailboxClient>,
    store: Arc<dyn MailStore>,
}

impl ActionHandler {
    /// Create a new action handler
    pub fn new(client: Arc<dyn MailboxClient>, store: Arc<dyn MailStore>) -> Self {
        Self { client, store }
    }

    /// Set the read status for a thread
    ///
    /// Marks all messages in the thread as read or unread.
    pub fn set_read(&self, account_id: i64, thread_id: &ThreadId, is_read: bool) -> Result<()> {
        let msg_ids = self.store.get_message_ids_for_thread(account_id, thread_id)?;
        if msg_ids.is_empty() {
            return Ok(());
        }

        info!(
            "Marking thread {} as {}",
            thread_id.as_str(),
            if is_read { "read" } else { "unread" }
        );

        if is_read {
            self.client.modify_labels(&msg_ids, &[], &[labels::UNREAD])?;
        } else {
            self.client.modify_labels(&msg_ids, &[labels::UNREAD], &[])?;
        }

        for msg_id in &msg_ids {
            if let Some(msg) = self.store.get_message(msg_id)? {
                let mut new_labels = msg.label_ids.clone();
                if is_read {
                    new_labels.retain(|l| l != labels::UNREAD);
                } else if !new_labels.contains(&labels::UNREAD.to_string()) {
                    new_labels.push(labels::UNREAD.to_string());
                }
                self.store.update_message_labels(msg_id, new_labels)?;
            }
        }

        Ok(())
    }

    /// Toggle read status for a thread
    ///
    /// Returns the new read state (true = read, false = unread).
    pub fn toggle_read(&self, account_id: i64, thread_id: &ThreadId) -> Result<bool> {
        let thread = self.store.get_thread(account_id, thread_id)?;
        let has_unread = thread.is_some_and(|t| t.is_unread());

        // If unread, mark as read. If read, mark as unread.
        let new_is_read = has_unread;
        self.set_read(account_id, thread_id, new_is_read)?;

        Ok(new_is_read)
    }

    /// Toggle star status for a thread
    ///
    /// Stars/unstars all messages in the thread.
    /// Returns the new starred state (true = starred, false = unstarred).
    pub fn toggle_star(&self, account_id: i64, thread_id: &ThreadId) -> Result<bool> {
        let msg_ids = self.store.get_message_ids_for_thread(account_id, thread_id)?;
        if msg_ids.is_empty() {
            return Ok(false);
        }

        let is_starred = self
            .store
            .get_thread(account_id, thread_id)?
            .is_some_and(|t| t.is_starred);

        let new_starred = !is_starred;
        info!(
            "Toggling star for thread {} to {}",
            thread_id.as_str(),
            if new_starred { "starred" } else { "unstarred" }
        );

        if new_starred {
            self.client.modify_labels(&msg_ids, &[labels::STARRED], &[])?;
        } else {
            self.client.modify_labels(&msg_ids, &[], &[labels::STARRED])?;
        }

        for msg_id in &msg_ids {
            if let Some(msg) = self.store.get_message(msg_id)? {
                let mut new_labels = msg.label_ids.clone();
                if new_starred {
                    if !new_labels.contains(&labels::STARRED.to_string()) {
                        new_labels.push(labels::STARRED.to_string());
                    }
                } else {
                    new_labels.retain(|l| l != labels::STARRED);
                }
                self.store.update_message_labels(msg_id, new_labels)?;
            }
        }

        Ok(new_starred)
    }

    /// Move a thread to trash
    ///
    /// The rows are preserved; trash is a label, not a delete.
    pub fn trash_thread(&self, account_id: i64, thread_id: &ThreadId) -> Result<()> {
        let msg_ids = self.store.get_message_ids_for_thread(account_id, thread_id)?;
        if msg_ids.is_empty() {
            return Ok(());
        }

        info!(
            "Trashing thread {} ({} messages)",
            thread_id.as_str(),
            msg_ids.len()
        );

        // Add TRASH and remove INBOX
        self.client
            .modify_labels(&msg_ids, &[labels::TRASH], &[labels::INBOX])?;

        for msg_id in &msg_ids {
            if let Some(msg) = self.store.get_message(msg_id)? {
                let mut new_labels = msg.label_ids.clone();
                new_labels.retain(|l| l != labels::INBOX);
                if !new_labels.contains(&labels::TRASH.to_string()) {
                    new_labels.push(labels::TRASH.to_string());
                }
                self.store.update_message_labels(msg_id, new_labels)?;
            }
        }

        Ok(())
    }

    /// Restore a thread from trash back to the inbox
    pub fn restore_thread(&self, account_id: i64, thread_id: &ThreadId) -> Result<()> {
        let msg_ids = self.store.get_message_ids_for_thread(account_id, thread_id)?;
        if msg_ids.is_empty() {
            return Ok(());
        }

        info!("Restoring thread {} from trash", thread_id.as_str());

        self.client
            .modify_labels(&msg_ids, &[labels::INBOX], &[labels::TRASH])?;

        for msg_id in &msg_ids {
            if let Some(msg) = self.store.get_message(msg_id)? {
                let mut new_labels = msg.label_ids.clone();
                new_labels.retain(|l| l != labels::TRASH);
                if !new_labels.contains(&labels::INBOX.to_string()) {
                    new_labels.push(labels::INBOX.to_string());
                }
                self.store.update_message_labels(msg_id, new_labels)?;
            }
        }

        Ok(())
    }
}
