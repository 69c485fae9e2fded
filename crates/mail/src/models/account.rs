//! Account model representing one connected mailbox

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// A connected mailbox account
///
/// Credential material is an opaque encrypted string owned by the
/// credential store; plaintext tokens never appear on this type.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Account {
    /// Unique integer identifier (database primary key)
    pub id: i64,
    /// Email address (unique)
    pub email: String,
    /// Display name shown on outbound mail
    pub display_name: Option<String>,
    /// Whether this is the primary/default account
    pub is_primary: bool,
    /// When the account was connected
    pub added_at: DateTime<Utc>,
    /// Encrypted OAuth token blob (ciphertext only)
    pub encrypted_tokens: Option<String>,
}

impl Account {
    /// Create a new account (id will be assigned by the database)
    pub fn new(email: impl Into<String>) -> Self {
        Self {
            id: 0,
            email: email.into(),
            display_name: None,
            is_primary: false,
            added_at: Utc::now(),
            encrypted_tokens: None,
        }
    }

    /// Create an account with a known ID (loaded from the database)
    pub fn with_id(id: i64, email: impl Into<String>) -> Self {
        Self {
            id,
            ..Self::new(email)
        }
    }

    /// Set the encrypted token blob
    pub fn with_encrypted_tokens(mut self, ciphertext: impl Into<String>) -> Self {
        self.encrypted_tokens = Some(ciphertext.into());
        self
    }

    /// Set as primary account
    pub fn with_primary(mut self, is_primary: bool) -> Self {
        self.is_primary = is_primary;
        self
    }

    /// Set display name
    pub fn with_display_name(mut self, name: impl Into<String>) -> Self {
        self.display_name = Some(name.into());
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_account_new() {
        let account = Account::new("test@example.com");
        assert_eq!(account.id, 0);
        assert_eq!(account.email, "test@example.com");
        assert!(!account.is_primary);
        assert!(account.encrypted_tokens.is_none());
    }

    #[test]
    fn test_account_with_id() {
        let account = Account::with_id(42, "test@example.com");
        assert_eq!(account.id, 42);
    }

    #[test]
    fn test_account_with_tokens() {
        let account = Account::new("test@example.com").with_encrypted_tokens("ciphertext");
        assert_eq!(account.encrypted_tokens.as_deref(), Some("ciphertext"));
    }
}
