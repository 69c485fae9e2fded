//! Credential store boundary
//!
//! OAuth tokens rest encrypted on the account row; this module is the
//! narrow decrypt-on-read seam between that ciphertext and the HTTP
//! client. Plaintext tokens exist only in memory on the way into a
//! transport call and are never logged.

use std::sync::Arc;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::storage::MailStore;

/// Decrypted OAuth token material for one account
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MailboxTokens {
    pub access_token: String,
    pub refresh_token: Option<String>,
    /// Unix timestamp the access token expires at, if known
    pub expires_at: Option<i64>,
}

impl MailboxTokens {
    /// Whether the access token is still usable (with a 5 minute buffer)
    pub fn access_token_fresh(&self, now_ts: i64) -> bool {
        match self.expires_at {
            Some(expires_at) => expires_at > now_ts + 300,
            // No expiry recorded: assume usable and let the API reject it
            None => true,
        }
    }
}

/// Black-box encrypt/decrypt pair for token material at rest
///
/// Provided by the host application; this crate never implements a real
/// cipher.
pub trait TokenCipher: Send + Sync {
    fn encrypt(&self, plaintext: &str) -> Result<String>;
    fn decrypt(&self, ciphertext: &str) -> Result<String>;
}

/// Decrypt-on-read access to per-account mailbox credentials
pub trait CredentialStore: Send + Sync {
    /// Decrypt the account's stored tokens
    fn decrypt(&self, account_id: i64) -> Result<MailboxTokens>;

    /// Re-encrypt and persist refreshed tokens
    fn update(&self, account_id: i64, tokens: &MailboxTokens) -> Result<()>;
}

/// Credential store backed by the mail store's account rows
pub struct StoredCredentialStore {
    store: Arc<dyn MailStore>,
    cipher: Arc<dyn TokenCipher>,
}

impl StoredCredentialStore {
    pub fn new(store: Arc<dyn MailStore>, cipher: Arc<dyn TokenCipher>) -> Self {
        Self { store, cipher }
    }
}

impl CredentialStore for StoredCredentialStore {
    fn decrypt(&self, account_id: i64) -> Result<MailboxTokens> {
        let account = self
            .store
            .get_account(account_id)?
            .with_context(|| format!("No account with id {}", account_id))?;

        let ciphertext = account
            .encrypted_tokens
            .with_context(|| format!("Account {} has no stored credentials", account_id))?;

        let plaintext = self
            .cipher
            .decrypt(&ciphertext)
            .context("Failed to decrypt stored credentials")?;

        serde_json::from_str(&plaintext).context("Failed to parse decrypted credentials")
    }

    fn update(&self, account_id: i64, tokens: &MailboxTokens) -> Result<()> {
        let plaintext = serde_json::to_string(tokens)?;
        let ciphertext = self
            .cipher
            .encrypt(&plaintext)
            .context("Failed to encrypt refreshed credentials")?;
        self.store.update_account_tokens(account_id, &ciphertext)
    }
}
