//! Sync coordination
//!
//! Decides full vs incremental strategy, drives the mailbox client,
//! hands fetched messages to the reconciler and advances the change
//! watermark. A failed incremental pass transparently falls back to a
//! full sync; only a failed full sync surfaces to the caller.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;
use rayon::prelude::*;

use super::reconcile::{ReconcileStats, reconcile_messages};
use super::timing::cooldown_elapsed;
use crate::mailbox::{HistoryExpiredError, MailboxClient, normalize_message};
use crate::models::{Message, MessageId, SyncState, labels};
use crate::storage::MailStore;

/// How long a sync owns its account before the lease is reclaimable
const SYNC_LEASE_SECS: i64 = 600;

/// Options for one sync invocation
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Run a full sync even when a watermark is stored
    pub force_full_sync: bool,
    /// Message cap for a full sync pass
    pub max_results: usize,
    /// Restrict a full sync to one provider label
    pub label_filter: Option<String>,
    /// Change-log entry cap for an incremental pass
    pub history_batch_size: usize,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            force_full_sync: false,
            max_results: 50,
            label_filter: None,
            history_batch_size: 100,
        }
    }
}

/// Which strategy a sync pass ran
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncType {
    Full,
    Incremental,
}

impl SyncType {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncType::Full => "full",
            SyncType::Incremental => "incremental",
        }
    }
}

/// Outcome of one sync invocation
///
/// Unrecoverable failures come back as `success: false` with the error
/// text, mirrored into the account's sync state for later status
/// queries.
#[derive(Debug, Clone)]
pub struct SyncReport {
    pub success: bool,
    pub sync_type: SyncType,
    /// Threads created this pass
    pub threads_processed: usize,
    /// New messages stored this pass
    pub messages_processed: usize,
    pub error: Option<String>,
}

impl SyncReport {
    fn failure(sync_type: SyncType, error: impl Into<String>) -> Self {
        Self {
            success: false,
            sync_type,
            threads_processed: 0,
            messages_processed: 0,
            error: Some(error.into()),
        }
    }
}

/// Drives mailbox sync for accounts
pub struct SyncCoordinator {
    client: Arc<dyn MailboxClient>,
    store: Arc<dyn MailStore>,
}

impl SyncCoordinator {
    pub fn new(client: Arc<dyn MailboxClient>, store: Arc<dyn MailStore>) -> Self {
        Self { client, store }
    }

    /// Whether a sync trigger should fire for this account right now
    ///
    /// Callers are expected to serialize triggers per account per
    /// scheduling tick; this is the cooldown half of that contract.
    pub fn should_sync(&self, account_id: i64, cooldown_secs: u64) -> Result<bool> {
        let state = self.store.get_sync_state(account_id)?;
        Ok(cooldown_elapsed(
            state.and_then(|s| s.last_synced_at),
            cooldown_secs,
        ))
    }

    /// Synchronize one account's mailbox into the local mirror
    pub fn sync(&self, account_id: i64, options: &SyncOptions) -> Result<SyncReport> {
        let now = Utc::now();

        // Strategy selection: forced, or no watermark yet, means full
        let prior = self.store.get_sync_state(account_id)?;
        let has_watermark = prior
            .as_ref()
            .and_then(|s| s.history_id.as_deref())
            .is_some();
        let strategy = if options.force_full_sync || !has_watermark {
            SyncType::Full
        } else {
            SyncType::Incremental
        };

        // Single-owner lease: exactly one sync runs per account
        let Some(mut state) = self.store.try_claim_sync(account_id, now, SYNC_LEASE_SECS)? else {
            log::info!("[SYNC] Account {} sync already in progress, skipping", account_id);
            return Ok(SyncReport::failure(strategy, "sync already in progress"));
        };

        let (sync_type, outcome) = match strategy {
            SyncType::Incremental => {
                let watermark = state
                    .history_id
                    .clone()
                    .unwrap_or_default();
                match self.incremental_sync(account_id, &watermark, options, &mut state) {
                    Ok(stats) => (SyncType::Incremental, Ok(stats)),
                    // Any incremental failure (expired watermark included)
                    // transparently retries as a full sync
                    Err(e) => {
                        if e.downcast_ref::<HistoryExpiredError>().is_some() {
                            log::info!(
                                "[SYNC] Account {} watermark expired, falling back to full sync",
                                account_id
                            );
                        } else {
                            log::warn!(
                                "[SYNC] Account {} incremental sync failed ({:#}), falling back to full sync",
                                account_id,
                                e
                            );
                        }
                        (
                            SyncType::Full,
                            self.full_sync(account_id, options, &mut state),
                        )
                    }
                }
            }
            SyncType::Full => (
                SyncType::Full,
                self.full_sync(account_id, options, &mut state),
            ),
        };

        match outcome {
            Ok(stats) => {
                state.mark_synced();
                self.store.save_sync_state(state)?;
                if stats.errors > 0 {
                    log::warn!(
                        "[SYNC] Account {} synced with {} skipped items",
                        account_id,
                        stats.errors
                    );
                }
                Ok(SyncReport {
                    success: true,
                    sync_type,
                    threads_processed: stats.threads_created,
                    messages_processed: stats.messages_stored,
                    error: None,
                })
            }
            Err(e) => {
                // The watermark is left untouched so a future sync can
                // retry from the last known-good point
                let message = format!("{:#}", e);
                state.mark_error(message.clone());
                self.store.save_sync_state(state)?;
                log::warn!("[SYNC] Account {} sync failed: {}", account_id, message);
                Ok(SyncReport::failure(sync_type, message))
            }
        }
    }

    /// Fetch the most recent messages and reconcile them
    fn full_sync(
        &self,
        account_id: i64,
        options: &SyncOptions,
        state: &mut SyncState,
    ) -> Result<ReconcileStats> {
        let label_ids: Vec<String> = options.label_filter.iter().cloned().collect();
        let refs = self
            .client
            .list_messages(None, options.max_results, &label_ids)?;

        let ids: Vec<MessageId> = refs.iter().map(|r| MessageId::new(&r.id)).collect();
        let messages = self.fetch_and_normalize(account_id, &ids);
        let stats = reconcile_messages(self.store.as_ref(), account_id, messages)?;

        // Refresh the watermark from the change-log head when obtainable;
        // a profile failure never fails the sync
        match self.client.get_profile() {
            Ok(profile) => {
                if let Some(history_id) = profile.history_id {
                    state.advance_history(&history_id);
                }
            }
            Err(e) => {
                log::debug!("[SYNC] Account {} profile unavailable: {:#}", account_id, e);
            }
        }

        Ok(stats)
    }

    /// Consume the change log since the stored watermark
    fn incremental_sync(
        &self,
        account_id: i64,
        watermark: &str,
        options: &SyncOptions,
        state: &mut SyncState,
    ) -> Result<ReconcileStats> {
        let page = self
            .client
            .get_history(watermark, options.history_batch_size)?;

        // Collect ids to fetch; deletions are handled in place without a
        // full fetch
        let mut changed_ids: Vec<MessageId> = Vec::new();
        let mut push_changed = |id: &str| {
            let id = MessageId::new(id);
            if !changed_ids.contains(&id) {
                changed_ids.push(id);
            }
        };

        let mut stats = ReconcileStats::default();
        for record in &page.records {
            for change in record
                .messages_added
                .iter()
                .chain(record.labels_added.iter())
                .chain(record.labels_removed.iter())
            {
                push_changed(&change.message.id);
            }

            for deleted in &record.messages_deleted {
                if let Err(e) = self.mark_message_trashed(&MessageId::new(&deleted.message.id)) {
                    log::warn!(
                        "[SYNC] Failed to trash deleted message {}: {:#}",
                        deleted.message.id,
                        e
                    );
                    stats.errors += 1;
                }
            }
        }

        let messages = self.fetch_and_normalize(account_id, &changed_ids);
        stats.merge(&reconcile_messages(
            self.store.as_ref(),
            account_id,
            messages,
        )?);

        if let Some(history_id) = &page.new_history_id {
            state.advance_history(history_id);
        }

        Ok(stats)
    }

    /// Tag a locally mirrored message as trashed; the row is preserved
    fn mark_message_trashed(&self, id: &MessageId) -> Result<()> {
        let Some(message) = self.store.get_message(id)? else {
            // Never mirrored locally, nothing to tag
            return Ok(());
        };

        let mut label_ids = message.label_ids;
        if !label_ids.iter().any(|l| l == labels::TRASH) {
            label_ids.push(labels::TRASH.to_string());
        }
        self.store.update_message_labels(id, label_ids)
    }

    /// Fetch full messages in parallel and normalize them
    ///
    /// Per-item failures are logged and skipped; one bad message never
    /// sinks the batch.
    fn fetch_and_normalize(&self, account_id: i64, ids: &[MessageId]) -> Vec<Message> {
        let results: Vec<(MessageId, Result<Message>)> = ids
            .par_iter()
            .map(|id| {
                let fetched = self
                    .client
                    .get_message(id)
                    .and_then(|remote| normalize_message(remote, account_id));
                (id.clone(), fetched)
            })
            .collect();

        let mut messages = Vec::new();
        for (id, result) in results {
            match result {
                Ok(message) => messages.push(message),
                Err(e) => {
                    log::warn!("[SYNC] Skipping message {}: {:#}", id.as_str(), e);
                }
            }
        }
        messages
    }
}
