//! Provider-independent mail capability and its construction from config

use async_trait::async_trait;
use std::sync::Arc;
use tracing::info;

use crate::auth::{AuthorizationPrompt, CredentialManager, OAuthClientConfig};
use crate::config::Config;
use crate::credentials::SqliteCredentialStore;
use crate::error::Result;
use crate::gmail::GmailProvider;
use crate::http::HttpClient;
use crate::models::{Inbox, Message, ProviderKind};
use crate::store::Store;

/// What the orchestrator needs from an inbox
#[async_trait]
pub trait MailProvider: Send + Sync {
    /// Fetch the current batch of messages
    async fn get_mail(&self) -> Result<Vec<Message>>;

    /// Send a plain-text message from the inbox's own address
    async fn send(&self, to: &str, subject: &str, body: &str) -> Result<()>;
}

/// Build the credential manager for an inbox, without touching the network
pub async fn credential_manager(
    inbox: &Inbox,
    config: &Config,
    store: Arc<Store>,
    prompt: Arc<dyn AuthorizationPrompt>,
    http: HttpClient,
) -> Result<Arc<CredentialManager>> {
    let oauth = match inbox.provider {
        ProviderKind::Gmail => OAuthClientConfig::resolve(&config.gmail).await?,
    };
    let credentials = Arc::new(SqliteCredentialStore::new(store, inbox.id));
    Ok(Arc::new(CredentialManager::new(oauth, credentials, prompt, http)))
}

/// Connect to an inbox: make sure it holds credentials, then build its provider
pub async fn connect(
    inbox: &Inbox,
    config: &Config,
    store: Arc<Store>,
    prompt: Arc<dyn AuthorizationPrompt>,
    http: HttpClient,
) -> Result<Arc<dyn MailProvider>> {
    let credentials = credential_manager(inbox, config, store, prompt, http.clone()).await?;
    credentials.ensure_credentials().await?;

    let provider: Arc<dyn MailProvider> = match inbox.provider {
        ProviderKind::Gmail => Arc::new(GmailProvider::new(
            &inbox.address,
            &config.gmail,
            credentials,
            http,
        )?),
    };
    info!("Connected {} inbox {}", inbox.provider, inbox.address);
    Ok(provider)
}
