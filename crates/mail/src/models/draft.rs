//! Outbound message parameters, persisted so retries can re-send them

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A binary attachment, carried base64-encoded until transmission
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Attachment {
    pub filename: String,
    #[serde(default)]
    pub content_type: Option<String>,
    pub data_base64: String,
}

/// The caller-supplied parameter set for one outbound message
///
/// Serialized as-is into the drafts table; the retry scanner re-sends
/// from these persisted fields.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OutgoingEmail {
    pub to: Vec<String>,
    #[serde(default)]
    pub cc: Vec<String>,
    #[serde(default)]
    pub bcc: Vec<String>,
    pub subject: String,
    #[serde(default)]
    pub body_html: Option<String>,
    #[serde(default)]
    pub body_text: Option<String>,
    /// Message-Id of the message being replied to
    #[serde(default)]
    pub in_reply_to: Option<String>,
    /// References chain for reply threading
    #[serde(default)]
    pub references: Vec<String>,
    /// Remote thread id, so the provider preserves conversation grouping
    #[serde(default)]
    pub thread_id: Option<String>,
    #[serde(default)]
    pub attachments: Vec<Attachment>,
    #[serde(default)]
    pub tracking_enabled: bool,
    /// Set by the pipeline when it instruments the HTML body; persisted
    /// so retries keep the same pixel
    #[serde(default)]
    pub tracking_pixel_id: Option<String>,
}

impl OutgoingEmail {
    /// Create a minimal outbound message to a single recipient
    pub fn new(to: impl Into<String>, subject: impl Into<String>) -> Self {
        Self {
            to: vec![to.into()],
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: subject.into(),
            body_html: None,
            body_text: None,
            in_reply_to: None,
            references: Vec::new(),
            thread_id: None,
            attachments: Vec::new(),
            tracking_enabled: false,
            tracking_pixel_id: None,
        }
    }

    pub fn with_html(mut self, html: impl Into<String>) -> Self {
        self.body_html = Some(html.into());
        self
    }

    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.body_text = Some(text.into());
        self
    }

    pub fn with_tracking(mut self, enabled: bool) -> Self {
        self.tracking_enabled = enabled;
        self
    }

    /// Mark as a reply carrying the prior message's linkage fields
    pub fn as_reply(
        mut self,
        thread_id: impl Into<String>,
        in_reply_to: impl Into<String>,
        references: Vec<String>,
    ) -> Self {
        self.thread_id = Some(thread_id.into());
        self.in_reply_to = Some(in_reply_to.into());
        self.references = references;
        self
    }
}

/// A persisted outbound parameter set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Draft {
    /// Unique integer identifier (database primary key)
    pub id: i64,
    /// Owning account (database primary key)
    pub account_id: i64,
    /// The outbound parameters
    pub email: OutgoingEmail,
    /// When the draft was persisted
    pub created_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_payload_round_trip() {
        let email = OutgoingEmail::new("to@example.com", "Quote follow-up")
            .with_html("<p>hi</p>")
            .with_tracking(true)
            .as_reply("t1", "<orig@mail>", vec!["<root@mail>".to_string()]);

        let json = serde_json::to_string(&email).unwrap();
        let back: OutgoingEmail = serde_json::from_str(&json).unwrap();
        assert_eq!(email, back);
    }

    #[test]
    fn test_defaults_tolerate_sparse_payloads() {
        let back: OutgoingEmail =
            serde_json::from_str(r#"{"to":["a@b.c"],"subject":"hi"}"#).unwrap();
        assert!(back.cc.is_empty());
        assert!(back.attachments.is_empty());
        assert!(!back.tracking_enabled);
    }
}
