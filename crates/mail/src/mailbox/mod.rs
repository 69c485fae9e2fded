//! Mailbox provider integration
//!
//! This module provides:
//! - The `MailboxClient` capability the sync engine and delivery
//!   pipeline are written against
//! - The credential store boundary (encrypted tokens, decrypt-on-read)
//! - A Gmail-backed HTTP client implementation
//! - Wire response normalization to domain models

mod client;
mod credentials;
mod http;
mod normalize;

pub use client::{HistoryExpiredError, MailboxClient, TransportError};
pub use credentials::{
    CredentialStore, MailboxTokens, StoredCredentialStore, TokenCipher,
};
pub use http::GmailMailboxClient;
pub use normalize::normalize_message;

/// Mailbox wire types
pub mod api {
    use serde::{Deserialize, Serialize};

    /// Response from listing messages
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct ListMessagesResponse {
        pub messages: Option<Vec<MessageRef>>,
        pub next_page_token: Option<String>,
        pub result_size_estimate: Option<u32>,
    }

    /// Reference to a message (just ID and thread ID)
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessageRef {
        pub id: String,
        pub thread_id: String,
    }

    /// Full message from the provider
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct RemoteMessage {
        pub id: String,
        pub thread_id: String,
        pub label_ids: Option<Vec<String>>,
        #[serde(default)]
        pub snippet: String,
        pub internal_date: String,
        pub payload: Option<MessagePayload>,
    }

    /// Message payload containing headers and body
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessagePayload {
        pub headers: Option<Vec<Header>>,
        pub body: Option<MessageBody>,
        pub parts: Option<Vec<MessagePart>>,
        pub mime_type: Option<String>,
    }

    /// Email header (name-value pair)
    #[derive(Debug, Clone, Deserialize, Serialize)]
    pub struct Header {
        pub name: String,
        pub value: String,
    }

    /// Message body (may be base64 encoded)
    #[derive(Debug, Clone, Deserialize)]
    pub struct MessageBody {
        pub size: Option<u32>,
        pub data: Option<String>,
    }

    /// Message part (for multipart messages)
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessagePart {
        pub part_id: Option<String>,
        pub mime_type: Option<String>,
        pub filename: Option<String>,
        pub headers: Option<Vec<Header>>,
        pub body: Option<MessageBody>,
        pub parts: Option<Vec<MessagePart>>,
    }

    /// One record in the change log
    ///
    /// The provider reports each change as the message reference it
    /// touched; absent arrays mean no changes of that kind.
    #[derive(Debug, Clone, Default, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryRecord {
        #[serde(default)]
        pub messages_added: Vec<MessageChange>,
        #[serde(default)]
        pub messages_deleted: Vec<MessageChange>,
        #[serde(default)]
        pub labels_added: Vec<MessageChange>,
        #[serde(default)]
        pub labels_removed: Vec<MessageChange>,
    }

    /// The message a history record refers to
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MessageChange {
        pub message: MessageRef,
    }

    /// Raw history response
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct HistoryResponse {
        pub history_id: Option<String>,
        pub history: Option<Vec<HistoryRecord>>,
        pub next_page_token: Option<String>,
    }

    /// One page of the change log, already flattened for consumption
    #[derive(Debug, Clone, Default)]
    pub struct HistoryPage {
        pub records: Vec<HistoryRecord>,
        /// The watermark to store once the page is reconciled
        pub new_history_id: Option<String>,
    }

    /// The mailbox profile: identity plus the current change-log head
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct MailboxProfile {
        pub email_address: String,
        pub history_id: Option<String>,
    }

    /// A composed outbound message ready for transmission
    #[derive(Debug, Clone, Serialize)]
    #[serde(rename_all = "camelCase")]
    pub struct OutboundMessage {
        /// base64url-encoded RFC 822 message
        pub raw: String,
        /// Remote thread to attach the message to (reply grouping)
        #[serde(skip_serializing_if = "Option::is_none")]
        pub thread_id: Option<String>,
    }

    /// The provider's acknowledgement of a transmitted message
    #[derive(Debug, Clone, Deserialize)]
    #[serde(rename_all = "camelCase")]
    pub struct SentMessage {
        pub id: String,
        pub thread_id: Option<String>,
    }
}
