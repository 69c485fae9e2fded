//! Automatic retry scanner
//!
//! A periodic task that finds failed SendStatus rows whose retry slot
//! has come due and pushes them back through the pipeline's transport
//! step, re-sending from the persisted draft fields. Rows whose retry
//! budget is exhausted stay in their last failure state forever.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use super::pipeline::SendPipeline;
use crate::models::DeliveryState;
use crate::storage::MailStore;

/// Rows examined per scanner pass
const RETRY_BATCH_SIZE: usize = 50;

/// Counters from one scanner pass
#[derive(Debug, Default, Clone, PartialEq)]
pub struct RetryStats {
    /// Rows selected for this pass
    pub scanned: usize,
    /// Retries that delivered
    pub succeeded: usize,
    /// Retries that failed again
    pub failed: usize,
    /// Rows skipped because their draft or account is gone
    pub skipped: usize,
}

/// Scans for retry-eligible send failures and re-sends them
pub struct RetryScanner {
    pipeline: SendPipeline,
}

impl RetryScanner {
    pub fn new(pipeline: SendPipeline) -> Self {
        Self { pipeline }
    }

    fn store(&self) -> &Arc<dyn MailStore> {
        self.pipeline.store()
    }

    /// Run one scanner pass
    ///
    /// Each selected row is claimed (retry count incremented, status set
    /// to sending) before its transport attempt, so a concurrent pass
    /// does not pick it up twice.
    pub fn run_auto_retry(&self) -> Result<RetryStats> {
        let now = Utc::now();
        let rows = self.store().list_retry_eligible(now, RETRY_BATCH_SIZE)?;

        let mut stats = RetryStats {
            scanned: rows.len(),
            ..Default::default()
        };

        for mut row in rows {
            // Without the originating draft there is nothing to re-send
            let draft = match row.draft_id {
                Some(draft_id) => self.store().get_draft(draft_id)?,
                None => None,
            };
            let Some(draft) = draft else {
                log::warn!(
                    "[RETRY] Status {} has no originating draft, skipping",
                    row.id
                );
                stats.skipped += 1;
                continue;
            };

            let Some(account) = self.store().get_account(draft.account_id)? else {
                log::warn!(
                    "[RETRY] Status {} belongs to missing account {}, skipping",
                    row.id,
                    draft.account_id
                );
                stats.skipped += 1;
                continue;
            };

            // Claim the row before transmitting
            row.retry_count += 1;
            row.status = DeliveryState::Sending;
            self.store().update_send_status(&row)?;

            log::info!(
                "[RETRY] Re-sending status {} (attempt {}/{})",
                row.id,
                row.retry_count,
                row.max_retries
            );

            match self.pipeline.transmit(&account, &draft.email, &mut row) {
                Ok(_) => stats.succeeded += 1,
                // transmit already reclassified and recorded the failure
                Err(e) => {
                    log::warn!("[RETRY] Status {} failed again: {:#}", row.id, e);
                    stats.failed += 1;
                }
            }
        }

        Ok(stats)
    }
}
