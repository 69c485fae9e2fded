//! Delivery lifecycle record for one logical outbound message

use super::MessageId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Classification of a delivery failure
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BounceKind {
    /// Permanent failure (bad address, unknown user)
    Hard,
    /// Temporary failure (full mailbox, throttling)
    Soft,
    /// Recipient-side rejection (spam filtering, blocklist)
    Complaint,
}

impl BounceKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BounceKind::Hard => "hard",
            BounceKind::Soft => "soft",
            BounceKind::Complaint => "complaint",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hard" => Some(BounceKind::Hard),
            "soft" => Some(BounceKind::Soft),
            "complaint" => Some(BounceKind::Complaint),
            _ => None,
        }
    }
}

/// Delivery state of a send attempt lineage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryState {
    /// A transport attempt is in flight
    Sending,
    /// Delivered; terminal
    Sent,
    /// Failed with no recognizable bounce classification
    Failed,
    /// Hard bounce
    Hard,
    /// Soft bounce
    Soft,
    /// Complaint rejection
    Complaint,
}

impl DeliveryState {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryState::Sending => "sending",
            DeliveryState::Sent => "sent",
            DeliveryState::Failed => "failed",
            DeliveryState::Hard => "hard",
            DeliveryState::Soft => "soft",
            DeliveryState::Complaint => "complaint",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "sending" => DeliveryState::Sending,
            "sent" => DeliveryState::Sent,
            "hard" => DeliveryState::Hard,
            "soft" => DeliveryState::Soft,
            "complaint" => DeliveryState::Complaint,
            _ => DeliveryState::Failed,
        }
    }

    /// The failure state matching a bounce classification
    pub fn from_bounce(bounce: Option<BounceKind>) -> Self {
        match bounce {
            Some(BounceKind::Hard) => DeliveryState::Hard,
            Some(BounceKind::Soft) => DeliveryState::Soft,
            Some(BounceKind::Complaint) => DeliveryState::Complaint,
            None => DeliveryState::Failed,
        }
    }

    /// Whether this is one of the failure states
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            DeliveryState::Failed
                | DeliveryState::Hard
                | DeliveryState::Soft
                | DeliveryState::Complaint
        )
    }
}

/// Audit/state record for one logical outbound message
///
/// One row per send lineage, not per retry. Rows are never deleted.
/// Once `Sent`, the record is terminal; once retries are exhausted in a
/// failure state, the automatic retry scanner leaves it alone forever.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SendStatus {
    /// Unique integer identifier (database primary key)
    pub id: i64,
    /// Owning account (database primary key)
    pub account_id: i64,
    /// Current delivery state
    pub status: DeliveryState,
    /// Number of automatic retries performed so far
    pub retry_count: u32,
    /// Ceiling for automatic retries
    pub max_retries: u32,
    /// Message text of the most recent transport failure
    pub error_message: Option<String>,
    /// Bounce classification of the most recent failure
    pub bounce_type: Option<BounceKind>,
    /// The phrase that triggered the classification
    pub bounce_reason: Option<String>,
    /// Earliest time the retry scanner may pick this row up
    pub next_retry_at: Option<DateTime<Utc>>,
    /// When delivery succeeded
    pub sent_at: Option<DateTime<Utc>>,
    /// When the most recent attempt failed
    pub failed_at: Option<DateTime<Utc>>,
    /// Persisted outbound parameters the retry scanner re-sends from
    pub draft_id: Option<i64>,
    /// The mirrored Message row created on successful delivery
    pub message_id: Option<MessageId>,
    /// When the lineage was created
    pub created_at: DateTime<Utc>,
}

impl SendStatus {
    pub const DEFAULT_MAX_RETRIES: u32 = 3;

    /// Create a fresh lineage about to make its first transport attempt
    pub fn new(account_id: i64, draft_id: Option<i64>) -> Self {
        Self {
            id: 0,
            account_id,
            status: DeliveryState::Sending,
            retry_count: 0,
            max_retries: Self::DEFAULT_MAX_RETRIES,
            error_message: None,
            bounce_type: None,
            bounce_reason: None,
            next_retry_at: None,
            sent_at: None,
            failed_at: None,
            draft_id,
            message_id: None,
            created_at: Utc::now(),
        }
    }

    /// Record a successful delivery
    pub fn mark_sent(&mut self, message_id: MessageId) {
        self.status = DeliveryState::Sent;
        self.sent_at = Some(Utc::now());
        self.message_id = Some(message_id);
        self.error_message = None;
        self.next_retry_at = None;
    }

    /// Record a failed transport attempt
    pub fn mark_failed(
        &mut self,
        error: impl Into<String>,
        bounce: Option<BounceKind>,
        reason: Option<String>,
        next_retry_at: Option<DateTime<Utc>>,
    ) {
        self.status = DeliveryState::from_bounce(bounce);
        self.error_message = Some(error.into());
        self.bounce_type = bounce;
        self.bounce_reason = reason;
        self.failed_at = Some(Utc::now());
        self.next_retry_at = next_retry_at;
    }

    /// Whether the automatic retry budget is used up
    pub fn retries_exhausted(&self) -> bool {
        self.retry_count >= self.max_retries
    }

    /// Whether the retry scanner should pick this row up at `now`
    pub fn retry_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status.is_failure()
            && !self.retries_exhausted()
            && self.next_retry_at.is_some_and(|at| at <= now)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    #[test]
    fn test_new_lineage() {
        let status = SendStatus::new(1, Some(9));
        assert_eq!(status.status, DeliveryState::Sending);
        assert_eq!(status.retry_count, 0);
        assert_eq!(status.max_retries, 3);
        assert_eq!(status.draft_id, Some(9));
    }

    #[test]
    fn test_mark_sent_is_terminal_shape() {
        let mut status = SendStatus::new(1, None);
        status.mark_sent(MessageId::new("m1"));
        assert_eq!(status.status, DeliveryState::Sent);
        assert!(status.sent_at.is_some());
        assert!(status.next_retry_at.is_none());
        assert!(!status.retry_eligible(Utc::now()));
    }

    #[test]
    fn test_mark_failed_classified() {
        let mut status = SendStatus::new(1, None);
        let retry_at = Utc::now() + Duration::minutes(1);
        status.mark_failed(
            "550 user unknown",
            Some(BounceKind::Hard),
            Some("user unknown".to_string()),
            Some(retry_at),
        );
        assert_eq!(status.status, DeliveryState::Hard);
        assert_eq!(status.bounce_type, Some(BounceKind::Hard));
        assert!(status.failed_at.is_some());
    }

    #[test]
    fn test_retry_eligibility_window() {
        let mut status = SendStatus::new(1, None);
        let now = Utc::now();
        status.mark_failed("timeout", None, None, Some(now + Duration::minutes(5)));

        assert!(!status.retry_eligible(now));
        assert!(status.retry_eligible(now + Duration::minutes(6)));
    }

    #[test]
    fn test_retry_ceiling() {
        let mut status = SendStatus::new(1, None);
        status.mark_failed("timeout", None, None, Some(Utc::now() - Duration::minutes(1)));
        status.retry_count = status.max_retries;
        assert!(status.retries_exhausted());
        assert!(!status.retry_eligible(Utc::now()));
    }

    #[test]
    fn test_state_round_trip() {
        for state in [
            DeliveryState::Sending,
            DeliveryState::Sent,
            DeliveryState::Failed,
            DeliveryState::Hard,
            DeliveryState::Soft,
            DeliveryState::Complaint,
        ] {
            assert_eq!(DeliveryState::parse(state.as_str()), state);
        }
        for kind in [BounceKind::Hard, BounceKind::Soft, BounceKind::Complaint] {
            assert_eq!(BounceKind::parse(kind.as_str()), Some(kind));
        }
    }
}
