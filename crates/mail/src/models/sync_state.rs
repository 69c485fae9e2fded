//! Sync state tracking for incremental mailbox sync

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

/// Lifecycle status of an account's sync
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncStatus {
    Idle,
    Syncing,
    Error,
}

impl SyncStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncStatus::Idle => "idle",
            SyncStatus::Syncing => "syncing",
            SyncStatus::Error => "error",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "syncing" => SyncStatus::Syncing,
            "error" => SyncStatus::Error,
            _ => SyncStatus::Idle,
        }
    }
}

/// Tracks sync progress for a mailbox account
///
/// Persisted 1:1 with the account. The history id is the change watermark:
/// it only moves forward, and only after a successful reconciliation pass.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncState {
    /// Owning account (database primary key)
    pub account_id: i64,
    /// Current lifecycle status
    pub status: SyncStatus,
    /// Change watermark for incremental sync (None until first full sync)
    pub history_id: Option<String>,
    /// When we last successfully synced
    pub last_synced_at: Option<DateTime<Utc>>,
    /// Message of the last unrecoverable sync failure
    pub last_error: Option<String>,
    /// Single-owner sync lease; a live lease excludes concurrent syncs
    pub lease_expires_at: Option<DateTime<Utc>>,
}

impl SyncState {
    /// Create the initial state for a freshly connected account
    pub fn new(account_id: i64) -> Self {
        Self {
            account_id,
            status: SyncStatus::Idle,
            history_id: None,
            last_synced_at: None,
            last_error: None,
            lease_expires_at: None,
        }
    }

    /// Whether a sync lease is still live at `now`
    pub fn lease_active(&self, now: DateTime<Utc>) -> bool {
        self.status == SyncStatus::Syncing
            && self.lease_expires_at.is_some_and(|expiry| expiry > now)
    }

    /// Take the sync lease for `lease_secs` seconds
    pub fn claim(&mut self, now: DateTime<Utc>, lease_secs: i64) {
        self.status = SyncStatus::Syncing;
        self.lease_expires_at = Some(now + Duration::seconds(lease_secs));
    }

    /// Record a successful sync, releasing the lease
    pub fn mark_synced(&mut self) {
        self.status = SyncStatus::Idle;
        self.last_synced_at = Some(Utc::now());
        self.last_error = None;
        self.lease_expires_at = None;
    }

    /// Record an unrecoverable sync failure, releasing the lease
    ///
    /// The watermark is left untouched so a future sync retries from the
    /// last known-good point.
    pub fn mark_error(&mut self, error: impl Into<String>) {
        self.status = SyncStatus::Error;
        self.last_error = Some(error.into());
        self.lease_expires_at = None;
    }

    /// Advance the watermark, refusing to move backwards
    ///
    /// History ids are opaque but numeric in practice; when both sides
    /// parse, a numerically earlier candidate is ignored. A non-numeric
    /// candidate replaces the stored value.
    pub fn advance_history(&mut self, candidate: &str) {
        if candidate.is_empty() {
            return;
        }
        if let Some(current) = &self.history_id
            && let (Ok(old), Ok(new)) = (current.parse::<u64>(), candidate.parse::<u64>())
            && new < old
        {
            return;
        }
        self.history_id = Some(candidate.to_string());
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_new_sync_state() {
        let state = SyncState::new(7);
        assert_eq!(state.account_id, 7);
        assert_eq!(state.status, SyncStatus::Idle);
        assert!(state.history_id.is_none());
        assert!(state.last_synced_at.is_none());
    }

    #[test]
    fn test_advance_history_monotonic() {
        let mut state = SyncState::new(1);
        state.advance_history("100");
        assert_eq!(state.history_id.as_deref(), Some("100"));

        state.advance_history("250");
        assert_eq!(state.history_id.as_deref(), Some("250"));

        // Earlier candidate is refused
        state.advance_history("99");
        assert_eq!(state.history_id.as_deref(), Some("250"));
    }

    #[test]
    fn test_advance_history_non_numeric() {
        let mut state = SyncState::new(1);
        state.advance_history("100");
        state.advance_history("opaque-token");
        assert_eq!(state.history_id.as_deref(), Some("opaque-token"));
        // Once non-numeric, candidates are accepted as-is
        state.advance_history("123");
        assert_eq!(state.history_id.as_deref(), Some("123"));
    }

    #[test]
    fn test_advance_history_ignores_empty() {
        let mut state = SyncState::new(1);
        state.advance_history("");
        assert!(state.history_id.is_none());
    }

    #[test]
    fn test_claim_and_release() {
        let now = Utc::now();
        let mut state = SyncState::new(1);
        assert!(!state.lease_active(now));

        state.claim(now, 600);
        assert_eq!(state.status, SyncStatus::Syncing);
        assert!(state.lease_active(now));
        assert!(!state.lease_active(now + Duration::seconds(601)));

        state.mark_synced();
        assert_eq!(state.status, SyncStatus::Idle);
        assert!(!state.lease_active(now));
        assert!(state.last_synced_at.is_some());
        assert!(state.last_error.is_none());
    }

    #[test]
    fn test_mark_error_keeps_watermark() {
        let mut state = SyncState::new(1);
        state.advance_history("500");
        state.claim(Utc::now(), 600);
        state.mark_error("boom");

        assert_eq!(state.status, SyncStatus::Error);
        assert_eq!(state.last_error.as_deref(), Some("boom"));
        assert_eq!(state.history_id.as_deref(), Some("500"));
        assert!(state.lease_expires_at.is_none());
    }

    #[test]
    fn test_status_round_trip() {
        for status in [SyncStatus::Idle, SyncStatus::Syncing, SyncStatus::Error] {
            assert_eq!(SyncStatus::parse(status.as_str()), status);
        }
    }
}
