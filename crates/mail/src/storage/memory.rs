//! In-memory storage implementation
//!
//! Used for tests and as a deterministic double behind the same trait
//! the SQLite store implements.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;
use std::sync::atomic::{AtomicI64, Ordering};

use super::traits::{MailStore, OpenEvent, ScheduledSend};
use crate::models::{
    Account, Draft, Message, MessageId, OutgoingEmail, SendStatus, SyncState, Thread, ThreadId,
    labels,
};

/// In-memory implementation of MailStore
///
/// HashMaps protected by RwLocks for thread-safe access; integer ids
/// handed out from a single atomic counter.
pub struct InMemoryMailStore {
    next_id: AtomicI64,
    accounts: RwLock<HashMap<i64, Account>>,
    /// Threads keyed by (account_id, remote thread id)
    threads: RwLock<HashMap<(i64, String), Thread>>,
    /// Messages keyed by remote message id (globally unique)
    messages: RwLock<HashMap<String, Message>>,
    sync_states: RwLock<HashMap<i64, SyncState>>,
    drafts: RwLock<HashMap<i64, Draft>>,
    send_statuses: RwLock<BTreeMap<i64, SendStatus>>,
    scheduled_sends: RwLock<BTreeMap<i64, ScheduledSend>>,
    open_events: RwLock<Vec<OpenEvent>>,
}

impl InMemoryMailStore {
    /// Create a new empty in-memory store
    pub fn new() -> Self {
        Self {
            next_id: AtomicI64::new(1),
            accounts: RwLock::new(HashMap::new()),
            threads: RwLock::new(HashMap::new()),
            messages: RwLock::new(HashMap::new()),
            sync_states: RwLock::new(HashMap::new()),
            drafts: RwLock::new(HashMap::new()),
            send_statuses: RwLock::new(BTreeMap::new()),
            scheduled_sends: RwLock::new(BTreeMap::new()),
            open_events: RwLock::new(Vec::new()),
        }
    }

    fn alloc_id(&self) -> i64 {
        self.next_id.fetch_add(1, Ordering::SeqCst)
    }

    /// Recompute a thread's label union, starred flag and unread count
    /// from its messages
    fn refresh_thread_aggregates(&self, account_id: i64, thread_id: &str) {
        let messages = self.messages.read().unwrap();
        let thread_messages: Vec<&Message> = messages
            .values()
            .filter(|m| m.account_id == account_id && m.thread_id.as_str() == thread_id)
            .collect();

        let mut label_union: Vec<String> = Vec::new();
        for msg in &thread_messages {
            for label in &msg.label_ids {
                if !label_union.contains(label) {
                    label_union.push(label.clone());
                }
            }
        }
        let unread_count = thread_messages.iter().filter(|m| !m.is_read).count();
        let is_starred = thread_messages.iter().any(|m| m.is_starred);
        drop(messages);

        let mut threads = self.threads.write().unwrap();
        if let Some(thread) = threads.get_mut(&(account_id, thread_id.to_string())) {
            thread.label_ids = label_union;
            thread.unread_count = unread_count;
            thread.is_starred = is_starred;
            thread.updated_at = Utc::now();
        }
    }

    fn sorted_threads(&self, account_id: i64) -> Vec<Thread> {
        let threads = self.threads.read().unwrap();
        let mut list: Vec<Thread> = threads
            .values()
            .filter(|t| t.account_id == account_id)
            .cloned()
            .collect();
        list.sort_by(|a, b| b.last_message_at.cmp(&a.last_message_at));
        list
    }
}

impl Default for InMemoryMailStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MailStore for InMemoryMailStore {
    fn insert_account(&self, mut account: Account) -> Result<Account> {
        account.id = self.alloc_id();
        self.accounts
            .write()
            .unwrap()
            .insert(account.id, account.clone());
        self.sync_states
            .write()
            .unwrap()
            .insert(account.id, SyncState::new(account.id));
        Ok(account)
    }

    fn get_account(&self, id: i64) -> Result<Option<Account>> {
        Ok(self.accounts.read().unwrap().get(&id).cloned())
    }

    fn get_account_by_email(&self, email: &str) -> Result<Option<Account>> {
        Ok(self
            .accounts
            .read()
            .unwrap()
            .values()
            .find(|a| a.email == email)
            .cloned())
    }

    fn update_account_tokens(&self, account_id: i64, ciphertext: &str) -> Result<()> {
        if let Some(account) = self.accounts.write().unwrap().get_mut(&account_id) {
            account.encrypted_tokens = Some(ciphertext.to_string());
        }
        Ok(())
    }

    fn upsert_thread(&self, thread: Thread) -> Result<()> {
        let key = (thread.account_id, thread.id.0.clone());
        self.threads.write().unwrap().insert(key, thread);
        Ok(())
    }

    fn get_thread(&self, account_id: i64, id: &ThreadId) -> Result<Option<Thread>> {
        Ok(self
            .threads
            .read()
            .unwrap()
            .get(&(account_id, id.0.clone()))
            .cloned())
    }

    fn has_thread(&self, account_id: i64, id: &ThreadId) -> Result<bool> {
        Ok(self
            .threads
            .read()
            .unwrap()
            .contains_key(&(account_id, id.0.clone())))
    }

    fn list_threads(&self, account_id: i64, limit: usize, offset: usize) -> Result<Vec<Thread>> {
        Ok(self
            .sorted_threads(account_id)
            .into_iter()
            .skip(offset)
            .take(limit)
            .collect())
    }

    fn list_threads_by_label(
        &self,
        account_id: i64,
        label: &str,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<Thread>> {
        Ok(self
            .sorted_threads(account_id)
            .into_iter()
            .filter(|t| t.label_ids.iter().any(|l| l == label))
            .skip(offset)
            .take(limit)
            .collect())
    }

    fn count_threads(&self, account_id: i64) -> Result<usize> {
        Ok(self
            .threads
            .read()
            .unwrap()
            .values()
            .filter(|t| t.account_id == account_id)
            .count())
    }

    fn upsert_message(&self, message: Message) -> Result<()> {
        let account_id = message.account_id;
        let thread_id = message.thread_id.0.clone();

        {
            let mut messages = self.messages.write().unwrap();
            match messages.get_mut(&message.id.0) {
                // Bodies and identifiers are immutable; only labels and
                // flags follow the incoming row
                Some(existing) => {
                    existing.label_ids = message.label_ids;
                    existing.is_read = message.is_read;
                    existing.is_starred = message.is_starred;
                }
                None => {
                    messages.insert(message.id.0.clone(), message);
                }
            }
        }

        self.refresh_thread_aggregates(account_id, &thread_id);
        Ok(())
    }

    fn get_message(&self, id: &MessageId) -> Result<Option<Message>> {
        Ok(self.messages.read().unwrap().get(&id.0).cloned())
    }

    fn has_message(&self, id: &MessageId) -> Result<bool> {
        Ok(self.messages.read().unwrap().contains_key(&id.0))
    }

    fn list_messages_for_thread(
        &self,
        account_id: i64,
        thread_id: &ThreadId,
    ) -> Result<Vec<Message>> {
        let messages = self.messages.read().unwrap();
        let mut result: Vec<Message> = messages
            .values()
            .filter(|m| m.account_id == account_id && m.thread_id == *thread_id)
            .cloned()
            .collect();
        result.sort_by(|a, b| a.received_at.cmp(&b.received_at));
        Ok(result)
    }

    fn get_message_ids_for_thread(
        &self,
        account_id: i64,
        thread_id: &ThreadId,
    ) -> Result<Vec<MessageId>> {
        Ok(self
            .list_messages_for_thread(account_id, thread_id)?
            .into_iter()
            .map(|m| m.id)
            .collect())
    }

    fn count_messages_in_thread(&self, account_id: i64, thread_id: &ThreadId) -> Result<usize> {
        Ok(self
            .messages
            .read()
            .unwrap()
            .values()
            .filter(|m| m.account_id == account_id && m.thread_id == *thread_id)
            .count())
    }

    fn update_message_labels(&self, id: &MessageId, label_ids: Vec<String>) -> Result<()> {
        let location = {
            let mut messages = self.messages.write().unwrap();
            match messages.get_mut(&id.0) {
                Some(message) => {
                    message.is_read = !label_ids.iter().any(|l| l == labels::UNREAD);
                    message.is_starred = label_ids.iter().any(|l| l == labels::STARRED);
                    message.label_ids = label_ids;
                    Some((message.account_id, message.thread_id.0.clone()))
                }
                None => None,
            }
        };

        if let Some((account_id, thread_id)) = location {
            self.refresh_thread_aggregates(account_id, &thread_id);
        }
        Ok(())
    }

    fn find_message_by_tracking_id(&self, tracking_id: &str) -> Result<Option<Message>> {
        Ok(self
            .messages
            .read()
            .unwrap()
            .values()
            .find(|m| m.tracking_pixel_id.as_deref() == Some(tracking_id))
            .cloned())
    }

    fn get_sync_state(&self, account_id: i64) -> Result<Option<SyncState>> {
        Ok(self.sync_states.read().unwrap().get(&account_id).cloned())
    }

    fn save_sync_state(&self, state: SyncState) -> Result<()> {
        self.sync_states
            .write()
            .unwrap()
            .insert(state.account_id, state);
        Ok(())
    }

    fn try_claim_sync(
        &self,
        account_id: i64,
        now: DateTime<Utc>,
        lease_secs: i64,
    ) -> Result<Option<SyncState>> {
        let mut states = self.sync_states.write().unwrap();
        let state = states
            .entry(account_id)
            .or_insert_with(|| SyncState::new(account_id));

        if state.lease_active(now) {
            return Ok(None);
        }

        state.claim(now, lease_secs);
        Ok(Some(state.clone()))
    }

    fn insert_draft(&self, account_id: i64, email: &OutgoingEmail) -> Result<Draft> {
        let draft = Draft {
            id: self.alloc_id(),
            account_id,
            email: email.clone(),
            created_at: Utc::now(),
        };
        self.drafts.write().unwrap().insert(draft.id, draft.clone());
        Ok(draft)
    }

    fn get_draft(&self, id: i64) -> Result<Option<Draft>> {
        Ok(self.drafts.read().unwrap().get(&id).cloned())
    }

    fn insert_send_status(&self, mut status: SendStatus) -> Result<SendStatus> {
        status.id = self.alloc_id();
        self.send_statuses
            .write()
            .unwrap()
            .insert(status.id, status.clone());
        Ok(status)
    }

    fn get_send_status(&self, id: i64) -> Result<Option<SendStatus>> {
        Ok(self.send_statuses.read().unwrap().get(&id).cloned())
    }

    fn update_send_status(&self, status: &SendStatus) -> Result<()> {
        self.send_statuses
            .write()
            .unwrap()
            .insert(status.id, status.clone());
        Ok(())
    }

    fn list_retry_eligible(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<SendStatus>> {
        let statuses = self.send_statuses.read().unwrap();
        let mut eligible: Vec<SendStatus> = statuses
            .values()
            .filter(|s| s.retry_eligible(now))
            .cloned()
            .collect();
        eligible.sort_by_key(|s| s.next_retry_at);
        eligible.truncate(limit);
        Ok(eligible)
    }

    fn insert_scheduled_send(
        &self,
        account_id: i64,
        email: &OutgoingEmail,
        due_at: DateTime<Utc>,
    ) -> Result<ScheduledSend> {
        let row = ScheduledSend {
            id: self.alloc_id(),
            account_id,
            email: email.clone(),
            due_at,
            created_at: Utc::now(),
        };
        self.scheduled_sends
            .write()
            .unwrap()
            .insert(row.id, row.clone());
        Ok(row)
    }

    fn list_due_scheduled_sends(
        &self,
        now: DateTime<Utc>,
        limit: usize,
    ) -> Result<Vec<ScheduledSend>> {
        let scheduled = self.scheduled_sends.read().unwrap();
        let mut due: Vec<ScheduledSend> = scheduled
            .values()
            .filter(|s| s.due_at <= now)
            .cloned()
            .collect();
        due.sort_by_key(|s| s.due_at);
        due.truncate(limit);
        Ok(due)
    }

    fn delete_scheduled_send(&self, id: i64) -> Result<()> {
        self.scheduled_sends.write().unwrap().remove(&id);
        Ok(())
    }

    fn insert_open_event(&self, mut event: OpenEvent) -> Result<OpenEvent> {
        event.id = self.alloc_id();
        self.open_events.write().unwrap().push(event.clone());
        Ok(event)
    }

    fn list_open_events(&self, message_id: &MessageId) -> Result<Vec<OpenEvent>> {
        Ok(self
            .open_events
            .read()
            .unwrap()
            .iter()
            .filter(|e| e.message_id == *message_id)
            .cloned()
            .collect())
    }

    fn clear(&self) -> Result<()> {
        self.accounts.write().unwrap().clear();
        self.threads.write().unwrap().clear();
        self.messages.write().unwrap().clear();
        self.sync_states.write().unwrap().clear();
        self.drafts.write().unwrap().clear();
        self.send_statuses.write().unwrap().clear();
        self.scheduled_sends.write().unwrap().clear();
        self.open_events.write().unwrap().clear();
        Ok(())
    }
}
