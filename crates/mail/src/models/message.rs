//! Message model representing one remote mailbox message

use super::{ThreadId, labels};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Unique identifier for a message (remote-assigned message ID)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MessageId(pub String);

impl MessageId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<String> for MessageId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

impl From<&str> for MessageId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

/// An email address with optional display name
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EmailAddress {
    /// Display name (e.g., "John Doe")
    pub name: Option<String>,
    /// Email address (e.g., "john@example.com")
    pub email: String,
}

impl EmailAddress {
    /// Create a new email address with just the email
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            name: None,
            email: email.into(),
        }
    }

    /// Create a new email address with a display name
    pub fn with_name(name: impl Into<String>, email: impl Into<String>) -> Self {
        Self {
            name: Some(name.into()),
            email: email.into(),
        }
    }

    /// Parse an email address from a string like "John Doe <john@example.com>"
    pub fn parse(s: &str) -> Self {
        let s = s.trim();

        // Try to parse "Name <email>" format
        if let Some(angle_start) = s.rfind('<')
            && let Some(angle_end) = s.rfind('>')
            && angle_start < angle_end
        {
            let name = s[..angle_start].trim().trim_matches('"');
            let email = s[angle_start + 1..angle_end].trim();
            return Self {
                name: if name.is_empty() {
                    None
                } else {
                    Some(name.to_string())
                },
                email: email.to_string(),
            };
        }

        // Otherwise, treat the whole string as an email
        Self {
            name: None,
            email: s.to_string(),
        }
    }

    /// Parse a comma-separated address list header value
    pub fn parse_list(s: &str) -> Vec<Self> {
        s.split(',')
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .map(Self::parse)
            .collect()
    }

    /// Format the email address for display
    pub fn display(&self) -> String {
        match &self.name {
            Some(name) => format!("{} <{}>", name, self.email),
            None => self.email.clone(),
        }
    }
}

/// A single email message within a thread
///
/// Body fields and identifiers are immutable once stored; only the label
/// set and the read/starred flags change on later syncs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Message {
    /// Remote message ID
    pub id: MessageId,
    /// ID of the thread this message belongs to
    pub thread_id: ThreadId,
    /// Owning account (database primary key)
    pub account_id: i64,
    /// Sender's email address
    pub from: EmailAddress,
    /// Recipients (To field)
    pub to: Vec<EmailAddress>,
    /// CC recipients
    pub cc: Vec<EmailAddress>,
    /// BCC recipients (present on sent mail only)
    pub bcc: Vec<EmailAddress>,
    /// Subject line
    pub subject: String,
    /// Plain text preview of the body
    pub snippet: String,
    /// Full plain text body, if available
    pub body_text: Option<String>,
    /// Full HTML body, if available
    pub body_html: Option<String>,
    /// Provider label IDs (e.g., "INBOX", "SENT", "UNREAD")
    pub label_ids: Vec<String>,
    /// Whether the message has been read
    pub is_read: bool,
    /// Whether the message is starred
    pub is_starred: bool,
    /// When the message was sent (outbound mail)
    pub sent_at: Option<DateTime<Utc>>,
    /// When the message was received
    pub received_at: DateTime<Utc>,
    /// Raw header map, in wire order
    pub headers: Vec<(String, String)>,
    /// Open-tracking pixel id embedded in the body, if any
    pub tracking_pixel_id: Option<String>,
}

impl Message {
    /// Create a new message builder
    pub fn builder(id: MessageId, thread_id: ThreadId) -> MessageBuilder {
        MessageBuilder::new(id, thread_id)
    }

    /// Whether the message carries the trash marker label
    pub fn is_trashed(&self) -> bool {
        self.label_ids.iter().any(|l| l == labels::TRASH)
    }

    /// First header value with the given name, case-insensitive
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers
            .iter()
            .find(|(n, _)| n.eq_ignore_ascii_case(name))
            .map(|(_, v)| v.as_str())
    }
}

/// Builder for creating Message instances
pub struct MessageBuilder {
    id: MessageId,
    thread_id: ThreadId,
    account_id: i64,
    from: Option<EmailAddress>,
    to: Vec<EmailAddress>,
    cc: Vec<EmailAddress>,
    bcc: Vec<EmailAddress>,
    subject: String,
    snippet: String,
    body_text: Option<String>,
    body_html: Option<String>,
    label_ids: Vec<String>,
    is_read: Option<bool>,
    is_starred: Option<bool>,
    sent_at: Option<DateTime<Utc>>,
    received_at: Option<DateTime<Utc>>,
    headers: Vec<(String, String)>,
    tracking_pixel_id: Option<String>,
}

impl MessageBuilder {
    fn new(id: MessageId, thread_id: ThreadId) -> Self {
        Self {
            id,
            thread_id,
            account_id: 0,
            from: None,
            to: Vec::new(),
            cc: Vec::new(),
            bcc: Vec::new(),
            subject: String::new(),
            snippet: String::new(),
            body_text: None,
            body_html: None,
            label_ids: Vec::new(),
            is_read: None,
            is_starred: None,
            sent_at: None,
            received_at: None,
            headers: Vec::new(),
            tracking_pixel_id: None,
        }
    }

    pub fn account_id(mut self, account_id: i64) -> Self {
        self.account_id = account_id;
        self
    }

    pub fn from(mut self, from: EmailAddress) -> Self {
        self.from = Some(from);
        self
    }

    pub fn to(mut self, to: Vec<EmailAddress>) -> Self {
        self.to = to;
        self
    }

    pub fn cc(mut self, cc: Vec<EmailAddress>) -> Self {
        self.cc = cc;
        self
    }

    pub fn bcc(mut self, bcc: Vec<EmailAddress>) -> Self {
        self.bcc = bcc;
        self
    }

    pub fn subject(mut self, subject: impl Into<String>) -> Self {
        self.subject = subject.into();
        self
    }

    pub fn snippet(mut self, snippet: impl Into<String>) -> Self {
        self.snippet = snippet.into();
        self
    }

    pub fn body_text(mut self, body_text: Option<String>) -> Self {
        self.body_text = body_text;
        self
    }

    pub fn body_html(mut self, body_html: Option<String>) -> Self {
        self.body_html = body_html;
        self
    }

    pub fn label_ids(mut self, label_ids: Vec<String>) -> Self {
        self.label_ids = label_ids;
        self
    }

    pub fn is_read(mut self, is_read: bool) -> Self {
        self.is_read = Some(is_read);
        self
    }

    pub fn is_starred(mut self, is_starred: bool) -> Self {
        self.is_starred = Some(is_starred);
        self
    }

    pub fn sent_at(mut self, sent_at: DateTime<Utc>) -> Self {
        self.sent_at = Some(sent_at);
        self
    }

    pub fn received_at(mut self, received_at: DateTime<Utc>) -> Self {
        self.received_at = Some(received_at);
        self
    }

    pub fn headers(mut self, headers: Vec<(String, String)>) -> Self {
        self.headers = headers;
        self
    }

    pub fn tracking_pixel_id(mut self, id: Option<String>) -> Self {
        self.tracking_pixel_id = id;
        self
    }

    pub fn build(self) -> Message {
        // Unless set explicitly, the read/starred flags mirror the label set
        let is_read = self
            .is_read
            .unwrap_or_else(|| !self.label_ids.iter().any(|l| l == labels::UNREAD));
        let is_starred = self
            .is_starred
            .unwrap_or_else(|| self.label_ids.iter().any(|l| l == labels::STARRED));

        Message {
            id: self.id,
            thread_id: self.thread_id,
            account_id: self.account_id,
            from: self
                .from
                .unwrap_or_else(|| EmailAddress::new("unknown@unknown.invalid")),
            to: self.to,
            cc: self.cc,
            bcc: self.bcc,
            subject: self.subject,
            snippet: self.snippet,
            body_text: self.body_text,
            body_html: self.body_html,
            label_ids: self.label_ids,
            is_read,
            is_starred,
            sent_at: self.sent_at,
            received_at: self.received_at.unwrap_or_else(Utc::now),
            headers: self.headers,
            tracking_pixel_id: self.tracking_pixel_id,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_email_with_name() {
        let addr = EmailAddress::parse("John Doe <john@example.com>");
        assert_eq!(addr.name, Some("John Doe".to_string()));
        assert_eq!(addr.email, "john@example.com");
    }

    #[test]
    fn test_parse_email_without_name() {
        let addr = EmailAddress::parse("john@example.com");
        assert_eq!(addr.name, None);
        assert_eq!(addr.email, "john@example.com");
    }

    #[test]
    fn test_parse_email_quoted_name() {
        let addr = EmailAddress::parse("\"Doe, John\" <john@example.com>");
        assert_eq!(addr.email, "john@example.com");
    }

    #[test]
    fn test_parse_list() {
        let addrs = EmailAddress::parse_list("a@example.com, Bob <b@example.com>, ");
        assert_eq!(addrs.len(), 2);
        assert_eq!(addrs[1].name, Some("Bob".to_string()));
    }

    #[test]
    fn test_display_with_name() {
        let addr = EmailAddress::with_name("John Doe", "john@example.com");
        assert_eq!(addr.display(), "John Doe <john@example.com>");
    }

    #[test]
    fn test_flags_follow_labels() {
        let msg = Message::builder(MessageId::new("m1"), ThreadId::new("t1"))
            .label_ids(vec!["INBOX".to_string(), "UNREAD".to_string()])
            .build();
        assert!(!msg.is_read);
        assert!(!msg.is_starred);

        let msg = Message::builder(MessageId::new("m2"), ThreadId::new("t1"))
            .label_ids(vec!["INBOX".to_string(), "STARRED".to_string()])
            .build();
        assert!(msg.is_read);
        assert!(msg.is_starred);
    }

    #[test]
    fn test_explicit_flags_win() {
        let msg = Message::builder(MessageId::new("m1"), ThreadId::new("t1"))
            .label_ids(vec!["UNREAD".to_string()])
            .is_read(true)
            .build();
        assert!(msg.is_read);
    }

    #[test]
    fn test_is_trashed() {
        let msg = Message::builder(MessageId::new("m1"), ThreadId::new("t1"))
            .label_ids(vec!["TRASH".to_string()])
            .build();
        assert!(msg.is_trashed());
    }

    #[test]
    fn test_header_lookup_case_insensitive() {
        let msg = Message::builder(MessageId::new("m1"), ThreadId::new("t1"))
            .headers(vec![("Message-Id".to_string(), "<abc@mail>".to_string())])
            .build();
        assert_eq!(msg.header("message-id"), Some("<abc@mail>"));
        assert_eq!(msg.header("References"), None);
    }
}
