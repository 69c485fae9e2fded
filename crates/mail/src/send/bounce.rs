//! Bounce classification and retry backoff
//!
//! Deterministic functions over the transport error's message text. An
//! unrecognized error is not fatal; it simply classifies as generic
//! failure.

use chrono::{DateTime, Duration, Utc};

use crate::models::BounceKind;

/// Phrases indicating a permanent delivery failure
const HARD_BOUNCE_PHRASES: &[&str] = &[
    "user unknown",
    "address rejected",
    "no such user",
    "mailbox not found",
    "domain not found",
];

/// Phrases indicating a temporary delivery failure
const SOFT_BOUNCE_PHRASES: &[&str] = &[
    "mailbox full",
    "quota exceeded",
    "temporarily unavailable",
    "try again later",
];

/// Phrases indicating a recipient-side rejection
const COMPLAINT_PHRASES: &[&str] = &["spam", "blocked", "blacklist"];

/// Backoff schedule in minutes, indexed by retry count and clamped to
/// the last entry
const RETRY_BACKOFF_MINUTES: &[i64] = &[1, 5, 30, 120];

/// Classify a transport error's message text
///
/// Evaluated in priority order hard, soft, complaint; matching is
/// case-insensitive. Returns the bounce kind together with the phrase
/// that triggered it, or `None` for an unrecognized error.
pub fn classify_bounce(error_text: &str) -> Option<(BounceKind, &'static str)> {
    let text = error_text.to_lowercase();

    for phrase in HARD_BOUNCE_PHRASES {
        if text.contains(phrase) {
            return Some((BounceKind::Hard, phrase));
        }
    }
    for phrase in SOFT_BOUNCE_PHRASES {
        if text.contains(phrase) {
            return Some((BounceKind::Soft, phrase));
        }
    }
    for phrase in COMPLAINT_PHRASES {
        if text.contains(phrase) {
            return Some((BounceKind::Complaint, phrase));
        }
    }

    None
}

/// When the retry scanner may next pick up a row that failed with the
/// given retry count
pub fn next_retry_at(retry_count: u32, now: DateTime<Utc>) -> DateTime<Utc> {
    let index = (retry_count as usize).min(RETRY_BACKOFF_MINUTES.len() - 1);
    now + Duration::minutes(RETRY_BACKOFF_MINUTES[index])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hard_bounce_phrases() {
        for text in [
            "550 5.1.1 User unknown",
            "Recipient address rejected: access denied",
            "no such user here",
            "Mailbox not found on this server",
            "DOMAIN NOT FOUND",
        ] {
            let (kind, _) = classify_bounce(text).unwrap();
            assert_eq!(kind, BounceKind::Hard, "{}", text);
        }
    }

    #[test]
    fn test_soft_bounce_phrases() {
        for text in [
            "452 mailbox full",
            "Quota exceeded for user",
            "Service temporarily unavailable",
            "please try again later",
        ] {
            let (kind, _) = classify_bounce(text).unwrap();
            assert_eq!(kind, BounceKind::Soft, "{}", text);
        }
    }

    #[test]
    fn test_complaint_phrases() {
        for text in [
            "Message identified as spam",
            "Sender blocked by policy",
            "IP found on blacklist",
        ] {
            let (kind, _) = classify_bounce(text).unwrap();
            assert_eq!(kind, BounceKind::Complaint, "{}", text);
        }
    }

    #[test]
    fn test_priority_order() {
        // Hard phrases win over soft and complaint
        let (kind, phrase) = classify_bounce("user unknown, mailbox full, spam").unwrap();
        assert_eq!(kind, BounceKind::Hard);
        assert_eq!(phrase, "user unknown");

        // Soft phrases win over complaint
        let (kind, _) = classify_bounce("mailbox full and looks like spam").unwrap();
        assert_eq!(kind, BounceKind::Soft);
    }

    #[test]
    fn test_unrecognized_is_none() {
        assert!(classify_bounce("connection reset by peer").is_none());
        assert!(classify_bounce("").is_none());
    }

    #[test]
    fn test_backoff_monotonic_escalation() {
        let now = Utc::now();
        // Strictly increasing up to the table length
        let delays: Vec<_> = (0..4).map(|n| next_retry_at(n, now)).collect();
        for pair in delays.windows(2) {
            assert!(pair[0] < pair[1]);
        }

        // Constant past the end of the table
        assert_eq!(next_retry_at(3, now), next_retry_at(4, now));
        assert_eq!(next_retry_at(3, now), next_retry_at(100, now));
    }

    #[test]
    fn test_backoff_table_values() {
        let now = Utc::now();
        assert_eq!(next_retry_at(0, now), now + Duration::minutes(1));
        assert_eq!(next_retry_at(1, now), now + Duration::minutes(5));
        assert_eq!(next_retry_at(2, now), now + Duration::minutes(30));
        assert_eq!(next_retry_at(3, now), now + Duration::hours(2));
    }
}
