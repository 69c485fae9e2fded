//! Scheduled-send scanner
//!
//! Deferred sends are durable rows, not in-process timers: a restart
//! loses nothing. This scanner dispatches rows whose due time has
//! passed through the send pipeline, then removes them; the delivery
//! audit trail lives on the SendStatus rows the dispatches create.

use std::sync::Arc;

use anyhow::Result;
use chrono::Utc;

use super::pipeline::SendPipeline;
use crate::storage::MailStore;

/// Rows dispatched per scanner pass
const SCHEDULE_BATCH_SIZE: usize = 50;

/// Counters from one scanner pass
#[derive(Debug, Default, Clone, PartialEq)]
pub struct ScheduleStats {
    /// Due rows selected for this pass
    pub scanned: usize,
    /// Dispatches that delivered
    pub sent: usize,
    /// Dispatches that failed (the retry scanner takes over)
    pub failed: usize,
    /// Rows dropped because their account is gone
    pub skipped: usize,
}

/// Dispatches deferred sends that have come due
pub struct ScheduledSendRunner {
    pipeline: SendPipeline,
}

impl ScheduledSendRunner {
    pub fn new(pipeline: SendPipeline) -> Self {
        Self { pipeline }
    }

    fn store(&self) -> &Arc<dyn MailStore> {
        self.pipeline.store()
    }

    /// Run one scanner pass
    ///
    /// Every selected row is removed after its dispatch attempt: a
    /// failed dispatch already has a SendStatus failure row, and the
    /// retry scanner owns it from there.
    pub fn run_due(&self) -> Result<ScheduleStats> {
        let now = Utc::now();
        let due = self
            .store()
            .list_due_scheduled_sends(now, SCHEDULE_BATCH_SIZE)?;

        let mut stats = ScheduleStats {
            scanned: due.len(),
            ..Default::default()
        };

        for row in due {
            let Some(account) = self.store().get_account(row.account_id)? else {
                log::warn!(
                    "[SCHEDULE] Dropping scheduled send {} for missing account {}",
                    row.id,
                    row.account_id
                );
                self.store().delete_scheduled_send(row.id)?;
                stats.skipped += 1;
                continue;
            };

            log::info!(
                "[SCHEDULE] Dispatching scheduled send {} (due {})",
                row.id,
                row.due_at
            );

            match self.pipeline.send(&account, row.email.clone()) {
                Ok(_) => stats.sent += 1,
                Err(e) => {
                    log::warn!("[SCHEDULE] Scheduled send {} failed: {:#}", row.id, e);
                    stats.failed += 1;
                }
            }

            self.store().delete_scheduled_send(row.id)?;
        }

        Ok(stats)
    }
}
