//! Gmail-backed mailbox client
//!
//! Implements the `MailboxClient` capability over the Gmail REST API.
//! Uses synchronous HTTP (ureq) to be executor-agnostic. Bearer tokens
//! come from the credential store; the access token is refreshed through
//! the OAuth token endpoint when expired.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::Deserialize;

use super::api::{
    HistoryPage, HistoryResponse, ListMessagesResponse, MailboxProfile, MessageRef,
    OutboundMessage, RemoteMessage, SentMessage,
};
use super::client::{HistoryExpiredError, MailboxClient, TransportError};
use super::credentials::{CredentialStore, MailboxTokens};
use crate::config::MailboxOAuthConfig;
use crate::models::MessageId;

/// Token response from the OAuth token endpoint
#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    refresh_token: Option<String>,
    expires_in: Option<u64>,
}

/// Gmail API client for one account's mailbox
pub struct GmailMailboxClient {
    account_id: i64,
    credentials: Arc<dyn CredentialStore>,
    oauth: MailboxOAuthConfig,
}

impl GmailMailboxClient {
    /// Gmail API base URL
    const BASE_URL: &'static str = "https://gmail.googleapis.com/gmail/v1";

    /// OAuth token endpoint for access-token refresh
    const TOKEN_URL: &'static str = "https://oauth2.googleapis.com/token";

    /// Create a client for the given account
    pub fn new(
        account_id: i64,
        credentials: Arc<dyn CredentialStore>,
        oauth: MailboxOAuthConfig,
    ) -> Self {
        Self {
            account_id,
            credentials,
            oauth,
        }
    }

    /// Get a usable access token, refreshing through the token endpoint
    /// when the stored one has expired
    fn access_token(&self) -> Result<String> {
        let tokens = self.credentials.decrypt(self.account_id)?;

        if tokens.access_token_fresh(chrono::Utc::now().timestamp()) {
            return Ok(tokens.access_token);
        }

        let refresh_token = tokens
            .refresh_token
            .clone()
            .context("Access token expired and no refresh token is stored")?;

        let refreshed = self.refresh_access_token(&refresh_token)?;
        self.credentials.update(self.account_id, &refreshed)?;
        Ok(refreshed.access_token)
    }

    /// Refresh an access token using a refresh token
    fn refresh_access_token(&self, refresh_token: &str) -> Result<MailboxTokens> {
        let response = ureq::post(Self::TOKEN_URL)
            .send_form([
                ("client_id", self.oauth.client_id.as_str()),
                ("client_secret", self.oauth.client_secret.as_str()),
                ("refresh_token", refresh_token),
                ("grant_type", "refresh_token"),
            ])
            .context("Failed to refresh access token")?;

        let token: TokenResponse = response
            .into_body()
            .read_json()
            .context("Failed to parse refresh token response")?;

        Ok(MailboxTokens {
            access_token: token.access_token,
            // Preserve the refresh token if not returned
            refresh_token: token
                .refresh_token
                .or_else(|| Some(refresh_token.to_string())),
            expires_at: token
                .expires_in
                .map(|d| chrono::Utc::now().timestamp() + d as i64),
        })
    }

    /// Get a message with exponential backoff retry
    fn get_message_with_retry(&self, id: &MessageId, max_retries: u32) -> Result<RemoteMessage> {
        let mut last_error = None;
        let mut delay = Duration::from_millis(100);

        for attempt in 0..max_retries {
            match self.fetch_message(id) {
                Ok(msg) => return Ok(msg),
                Err(e) => {
                    last_error = Some(e);
                    if attempt < max_retries - 1 {
                        // Add jitter to delay
                        let jitter = Duration::from_millis(rand_jitter());
                        std::thread::sleep(delay + jitter);
                        delay *= 2;
                    }
                }
            }
        }

        Err(last_error.unwrap())
    }

    fn fetch_message(&self, id: &MessageId) -> Result<RemoteMessage> {
        let access_token = self.access_token()?;

        let url = format!(
            "{}/users/me/messages/{}?format=full",
            Self::BASE_URL,
            id.as_str()
        );

        let mut response = ureq::get(&url)
            .header("Authorization", &format!("Bearer {}", access_token))
            .call()
            .context("Failed to send get message request")?;

        let message: RemoteMessage = response
            .body_mut()
            .read_json()
            .context("Failed to parse message response")?;

        Ok(message)
    }
}

impl MailboxClient for GmailMailboxClient {
    fn list_messages(
        &self,
        query: Option<&str>,
        max_results: usize,
        label_ids: &[String],
    ) -> Result<Vec<MessageRef>> {
        let access_token = self.access_token()?;

        let mut url = format!(
            "{}/users/me/messages?maxResults={}",
            Self::BASE_URL,
            max_results.min(500)
        );

        if let Some(query) = query {
            url.push_str(&format!("&q={}", urlencoding::encode(query)));
        }
        for label in label_ids {
            url.push_str(&format!("&labelIds={}", urlencoding::encode(label)));
        }

        let mut response = ureq::get(&url)
            .header("Authorization", &format!("Bearer {}", access_token))
            .call()
            .context("Failed to send list messages request")?;

        let list: ListMessagesResponse = response
            .body_mut()
            .read_json()
            .context("Failed to parse list messages response")?;

        Ok(list.messages.unwrap_or_default())
    }

    fn get_message(&self, id: &MessageId) -> Result<RemoteMessage> {
        self.get_message_with_retry(id, 3)
    }

    fn get_history(&self, start_history_id: &str, max_results: usize) -> Result<HistoryPage> {
        let access_token = self.access_token()?;

        let url = format!(
            "{}/users/me/history?startHistoryId={}&maxResults={}\
             &historyTypes=messageAdded&historyTypes=messageDeleted\
             &historyTypes=labelAdded&historyTypes=labelRemoved",
            Self::BASE_URL,
            urlencoding::encode(start_history_id),
            max_results.min(500)
        );

        let response = ureq::get(&url)
            .header("Authorization", &format!("Bearer {}", access_token))
            .call();

        match response {
            Ok(mut resp) => {
                let history: HistoryResponse = resp
                    .body_mut()
                    .read_json()
                    .context("Failed to parse history response")?;
                Ok(HistoryPage {
                    records: history.history.unwrap_or_default(),
                    new_history_id: history.history_id,
                })
            }
            // The provider reports an expired or invalid watermark as 404
            Err(ureq::Error::StatusCode(404)) => Err(HistoryExpiredError.into()),
            Err(e) => Err(anyhow::anyhow!("Failed to fetch history: {}", e)),
        }
    }

    fn get_profile(&self) -> Result<MailboxProfile> {
        let access_token = self.access_token()?;

        let url = format!("{}/users/me/profile", Self::BASE_URL);

        let mut response = ureq::get(&url)
            .header("Authorization", &format!("Bearer {}", access_token))
            .call()
            .context("Failed to send profile request")?;

        let profile: MailboxProfile = response
            .body_mut()
            .read_json()
            .context("Failed to parse profile response")?;

        Ok(profile)
    }

    fn send(&self, outgoing: &OutboundMessage) -> Result<SentMessage> {
        let access_token = self
            .access_token()
            .map_err(|e| TransportError::new(format!("credential failure: {:#}", e)))?;

        let url = format!("{}/users/me/messages/send", Self::BASE_URL);

        let response = ureq::post(&url)
            .header("Authorization", &format!("Bearer {}", access_token))
            .send_json(outgoing);

        match response {
            Ok(mut resp) => {
                let sent: SentMessage = resp
                    .body_mut()
                    .read_json()
                    .context("Failed to parse send response")?;
                Ok(sent)
            }
            Err(ureq::Error::StatusCode(code)) => Err(TransportError::new(format!(
                "transport rejected send with status {}",
                code
            ))
            .into()),
            Err(e) => Err(TransportError::new(e.to_string()).into()),
        }
    }

    fn modify_labels(
        &self,
        message_ids: &[MessageId],
        add: &[&str],
        remove: &[&str],
    ) -> Result<()> {
        if message_ids.is_empty() {
            return Ok(());
        }

        let access_token = self.access_token()?;

        let url = format!("{}/users/me/messages/batchModify", Self::BASE_URL);
        let body = serde_json::json!({
            "ids": message_ids.iter().map(|m| m.as_str()).collect::<Vec<_>>(),
            "addLabelIds": add,
            "removeLabelIds": remove,
        });

        ureq::post(&url)
            .header("Authorization", &format!("Bearer {}", access_token))
            .send_json(&body)
            .context("Failed to send batch modify request")?;

        Ok(())
    }
}

/// Generate a random jitter value (0-100ms)
fn rand_jitter() -> u64 {
    use std::collections::hash_map::RandomState;
    use std::hash::{BuildHasher, Hasher};

    let hasher = RandomState::new().build_hasher();
    hasher.finish() % 100
}
