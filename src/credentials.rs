//! Per-inbox persistence of OAuth tokens
//!
//! Tokens live in the store's `config` table under `credentials::` keys, so a
//! single database file carries both the ledger and every inbox's credential.

use chrono::{DateTime, Utc};
use std::sync::Arc;

use crate::error::{GoAwayError, Result};
use crate::models::Credential;
use crate::store::Store;

pub const CREDENTIALS_PREFIX: &str = "credentials::";
pub const ACCESS_TOKEN_KEY: &str = "credentials::accessToken";
pub const REFRESH_TOKEN_KEY: &str = "credentials::refreshToken";
pub const EXPIRES_AT_KEY: &str = "credentials::expiresAt";

/// Storage for one inbox's credential
///
/// Only the credential manager writes through this trait, and only after a
/// successful token exchange.
pub trait CredentialStore: Send + Sync {
    /// The stored credential, if an access token has ever been saved
    fn load(&self) -> Result<Option<Credential>>;

    /// Persist a full credential from an authorization-code exchange
    fn save(&self, credential: &Credential) -> Result<()>;

    /// Persist a refreshed access token, leaving the refresh token untouched
    fn update_access_token(&self, access_token: &str, expires_at: Option<DateTime<Utc>>) -> Result<()>;

    /// Forget every stored token for the inbox
    fn clear(&self) -> Result<()>;
}

/// [`CredentialStore`] backed by the shared SQLite store
#[derive(Clone)]
pub struct SqliteCredentialStore {
    store: Arc<Store>,
    inbox_id: i64,
}

impl SqliteCredentialStore {
    pub fn new(store: Arc<Store>, inbox_id: i64) -> Self {
        Self { store, inbox_id }
    }
}

impl CredentialStore for SqliteCredentialStore {
    fn load(&self) -> Result<Option<Credential>> {
        let access_token = match self.store.config_get(self.inbox_id, ACCESS_TOKEN_KEY)? {
            Some(token) if !token.is_empty() => token,
            _ => return Ok(None),
        };
        let refresh_token = self
            .store
            .config_get(self.inbox_id, REFRESH_TOKEN_KEY)?
            .filter(|token| !token.is_empty());
        let expires_at = match self.store.config_get(self.inbox_id, EXPIRES_AT_KEY)? {
            Some(raw) if !raw.is_empty() => Some(
                DateTime::parse_from_rfc3339(&raw)
                    .map_err(|e| {
                        GoAwayError::State(format!("invalid stored token expiry '{}': {}", raw, e))
                    })?
                    .with_timezone(&Utc),
            ),
            _ => None,
        };

        Ok(Some(Credential {
            access_token,
            refresh_token,
            expires_at,
        }))
    }

    fn save(&self, credential: &Credential) -> Result<()> {
        let expires_at = credential
            .expires_at
            .map(|at| at.to_rfc3339())
            .unwrap_or_default();
        let mut entries = vec![
            (ACCESS_TOKEN_KEY, credential.access_token.as_str()),
            (EXPIRES_AT_KEY, expires_at.as_str()),
        ];
        if let Some(refresh_token) = &credential.refresh_token {
            entries.push((REFRESH_TOKEN_KEY, refresh_token.as_str()));
        }
        self.store.config_set_many(self.inbox_id, &entries)
    }

    fn update_access_token(&self, access_token: &str, expires_at: Option<DateTime<Utc>>) -> Result<()> {
        let expires_at = expires_at.map(|at| at.to_rfc3339()).unwrap_or_default();
        self.store.config_set_many(
            self.inbox_id,
            &[(ACCESS_TOKEN_KEY, access_token), (EXPIRES_AT_KEY, expires_at.as_str())],
        )
    }

    fn clear(&self) -> Result<()> {
        self.store
            .config_clear_prefix(self.inbox_id, CREDENTIALS_PREFIX)?;
        Ok(())
    }
}
