//! Configuration loading for mail services
//!
//! Supports loading OAuth client configuration from (in order of
//! priority):
//! 1. JSON file (provider console format) in the Harbor config directory
//! 2. Runtime environment variables (fallback)

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Credentials filename in the Harbor config directory
const CREDENTIALS_FILE: &str = "mailbox-credentials.json";

/// OAuth client configuration for the mailbox provider
///
/// This identifies the portal application to the provider; per-account
/// token material lives in the credential store, not here.
#[derive(Debug, Clone)]
pub struct MailboxOAuthConfig {
    pub client_id: String,
    pub client_secret: String,
}

/// Provider console credential file format
#[derive(Deserialize)]
struct CredentialFile {
    installed: Option<ClientEntry>,
    web: Option<ClientEntry>,
}

#[derive(Deserialize)]
struct ClientEntry {
    client_id: String,
    client_secret: String,
}

impl MailboxOAuthConfig {
    /// Load configuration from the config file, falling back to
    /// environment variables
    pub fn load() -> Result<Self> {
        if config::config_exists(CREDENTIALS_FILE) {
            let file: CredentialFile = config::load_json(CREDENTIALS_FILE)?;
            return Self::from_credential_file(file);
        }

        Self::from_env()
    }

    /// Load configuration from a specific JSON file
    pub fn from_file(path: &Path) -> Result<Self> {
        let file: CredentialFile = config::load_json_file(path)?;
        Self::from_credential_file(file)
    }

    /// Parse configuration from a JSON string (provider console format)
    pub fn from_json(json: &str) -> Result<Self> {
        let file: CredentialFile =
            serde_json::from_str(json).context("Failed to parse credentials JSON")?;
        Self::from_credential_file(file)
    }

    /// Load configuration from environment variables
    pub fn from_env() -> Result<Self> {
        Ok(Self {
            client_id: config::require_env("HARBOR_MAILBOX_CLIENT_ID")?,
            client_secret: config::require_env("HARBOR_MAILBOX_CLIENT_SECRET")?,
        })
    }

    fn from_credential_file(file: CredentialFile) -> Result<Self> {
        // Support both "installed" (desktop) and "web" credential types
        let entry = file
            .installed
            .or(file.web)
            .context("Credentials file missing 'installed' or 'web' section")?;

        Ok(Self {
            client_id: entry.client_id,
            client_secret: entry.client_secret,
        })
    }

    /// Check if configuration is available (file or env vars)
    pub fn is_available() -> bool {
        if config::config_exists(CREDENTIALS_FILE) {
            return true;
        }
        std::env::var("HARBOR_MAILBOX_CLIENT_ID").is_ok()
            && std::env::var("HARBOR_MAILBOX_CLIENT_SECRET").is_ok()
    }
}
