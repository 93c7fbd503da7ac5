//! OAuth2 credential lifecycle for one inbox
//!
//! The manager runs the authorization-code flow when no usable credential is
//! stored, and refreshes the access token when a provider request is
//! rejected. Refreshes are serialized: a caller that was rejected with an
//! already-replaced token gets the newer token instead of a second refresh.

use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::GmailConfig;
use crate::credentials::CredentialStore;
use crate::error::{GoAwayError, Result};
use crate::http::{ApiRequest, HttpClient};
use crate::loopback::LoopbackListener;
use crate::models::Credential;

/// Scopes requested for Gmail inboxes: read headers, send unsubscribe mail
pub const GMAIL_SCOPES: &[&str] = &[
    "https://www.googleapis.com/auth/gmail.readonly",
    "https://www.googleapis.com/auth/gmail.send",
];

pub const DEFAULT_AUTH_URI: &str = "https://accounts.google.com/o/oauth2/v2/auth";
pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";

pub const CLIENT_ID_ENV: &str = "GO_AWAY_GMAIL_CLIENT_ID";
pub const CLIENT_SECRET_ENV: &str = "GO_AWAY_GMAIL_CLIENT_SECRET";

/// Credential structure matching Google's OAuth2 credentials JSON format
#[derive(Debug, Serialize, Deserialize)]
pub struct Credentials {
    pub installed: InstalledApp,
}

/// Installed application credentials (desktop/CLI app)
#[derive(Debug, Serialize, Deserialize)]
pub struct InstalledApp {
    pub client_id: String,
    #[serde(default)]
    pub project_id: Option<String>,
    #[serde(default)]
    pub auth_uri: Option<String>,
    #[serde(default)]
    pub token_uri: Option<String>,
    pub client_secret: String,
    #[serde(default)]
    pub redirect_uris: Vec<String>,
}

/// Load OAuth2 client credentials downloaded from the Google Cloud console
pub async fn load_credentials(path: &Path) -> Result<Credentials> {
    let content = tokio::fs::read_to_string(path).await?;
    let creds = serde_json::from_str(&content)?;
    Ok(creds)
}

/// OAuth client registration used for one provider
#[derive(Debug, Clone)]
pub struct OAuthClientConfig {
    pub client_id: String,
    pub client_secret: String,
    pub auth_uri: Url,
    pub token_uri: String,
    pub scopes: Vec<String>,
}

impl OAuthClientConfig {
    pub fn new(
        client_id: impl Into<String>,
        client_secret: impl Into<String>,
        auth_uri: &str,
        token_uri: impl Into<String>,
    ) -> Result<Self> {
        let auth_uri = Url::parse(auth_uri)
            .map_err(|e| GoAwayError::Config(format!("invalid auth_uri '{}': {}", auth_uri, e)))?;
        Ok(Self {
            client_id: client_id.into(),
            client_secret: client_secret.into(),
            auth_uri,
            token_uri: token_uri.into(),
            scopes: GMAIL_SCOPES.iter().map(|s| s.to_string()).collect(),
        })
    }

    /// Resolve client id and secret from the environment, then the `[gmail]`
    /// section, then the credentials file it points to
    pub async fn resolve(gmail: &GmailConfig) -> Result<Self> {
        let mut client_id = env::var(CLIENT_ID_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| gmail.client_id.clone().filter(|v| !v.is_empty()));
        let mut client_secret = env::var(CLIENT_SECRET_ENV)
            .ok()
            .filter(|v| !v.is_empty())
            .or_else(|| gmail.client_secret.clone().filter(|v| !v.is_empty()));

        if client_id.is_none() || client_secret.is_none() {
            if let Some(path) = &gmail.credentials_file {
                debug!("Loading OAuth client from {:?}", path);
                let creds = load_credentials(path).await.map_err(|e| {
                    GoAwayError::Config(format!(
                        "failed to read OAuth client file {:?}: {}",
                        path, e
                    ))
                })?;
                client_id.get_or_insert(creds.installed.client_id);
                client_secret.get_or_insert(creds.installed.client_secret);
            }
        }

        match (client_id, client_secret) {
            (Some(id), Some(secret)) => Self::new(id, secret, &gmail.auth_uri, gmail.token_uri.clone()),
            _ => Err(GoAwayError::Config(format!(
                "Gmail OAuth client is not configured: set {} and {}, \
                 [gmail] client_id/client_secret, or [gmail] credentials_file",
                CLIENT_ID_ENV, CLIENT_SECRET_ENV
            ))),
        }
    }

    /// Consent-page URL for the given loopback redirect
    pub fn authorization_url(&self, redirect_uri: &str) -> String {
        let mut url = self.auth_uri.clone();
        url.query_pairs_mut()
            .append_pair("client_id", &self.client_id)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.scopes.join(" "))
            .append_pair("access_type", "offline")
            .append_pair("prompt", "consent");
        url.to_string()
    }
}

/// Code returned by the authorization server, with the redirect it was sent to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthorizationCode {
    pub code: String,
    pub redirect_uri: String,
}

/// Builds the consent-page URL for a redirect URI chosen by the prompt
pub type AuthorizationUrl<'a> = dyn for<'u> Fn(&'u str) -> String + Send + Sync + 'a;

/// Interactive step of the authorization-code flow
///
/// The prompt picks its own redirect URI and calls `authorization_url` with
/// it to obtain the page the operator must visit.
#[async_trait]
pub trait AuthorizationPrompt: Send + Sync {
    async fn request_code(
        &self,
        authorization_url: &AuthorizationUrl<'_>,
    ) -> Result<AuthorizationCode>;
}

/// Prints the consent URL and waits for the browser redirect on a loopback port
pub struct LoopbackPrompt {
    timeout: Duration,
    shutdown_grace: Duration,
}

impl LoopbackPrompt {
    pub fn new(timeout: Duration, shutdown_grace: Duration) -> Self {
        Self {
            timeout,
            shutdown_grace,
        }
    }
}

#[async_trait]
impl AuthorizationPrompt for LoopbackPrompt {
    async fn request_code(
        &self,
        authorization_url: &AuthorizationUrl<'_>,
    ) -> Result<AuthorizationCode> {
        let mut listener = LoopbackListener::bind().await?;
        let redirect_uri = listener.redirect_uri();

        println!(
            "\nOpen this URL in your browser to authorize go-away:\n\n  {}\n",
            authorization_url(&redirect_uri)
        );
        info!(
            "Waiting up to {}s for the authorization redirect on {}",
            self.timeout.as_secs(),
            redirect_uri
        );

        let code = listener.wait_for_code(self.timeout).await;
        listener.shutdown(self.shutdown_grace).await;

        Ok(AuthorizationCode {
            code: code?,
            redirect_uri,
        })
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
    #[serde(default)]
    refresh_token: Option<String>,
    #[serde(default)]
    expires_in: Option<i64>,
}

/// Access token handed to a request, tagged with the refresh generation it
/// belongs to
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BearerToken {
    pub access_token: String,
    generation: u64,
}

#[derive(Debug, Default)]
struct RefreshState {
    generation: u64,
}

/// Produces valid bearer tokens for one inbox
pub struct CredentialManager {
    oauth: OAuthClientConfig,
    store: Arc<dyn CredentialStore>,
    prompt: Arc<dyn AuthorizationPrompt>,
    http: HttpClient,
    refresh: Mutex<RefreshState>,
}

impl CredentialManager {
    pub fn new(
        oauth: OAuthClientConfig,
        store: Arc<dyn CredentialStore>,
        prompt: Arc<dyn AuthorizationPrompt>,
        http: HttpClient,
    ) -> Self {
        Self {
            oauth,
            store,
            prompt,
            http,
            refresh: Mutex::new(RefreshState::default()),
        }
    }

    /// Return the stored credential, running the authorization flow when
    /// either token is missing
    ///
    /// Expiry is not checked here; an expired access token surfaces as a
    /// 401 and is refreshed then.
    pub async fn ensure_credentials(&self) -> Result<Credential> {
        if let Some(credential) = self.store.load()? {
            if credential.is_complete() {
                debug!("Using stored credential");
                return Ok(credential);
            }
        }

        info!("No usable credential stored, starting authorization flow");
        let mut state = self.refresh.lock().await;

        let grant = self
            .prompt
            .request_code(&|redirect_uri: &str| self.oauth.authorization_url(redirect_uri))
            .await?;

        let token = self
            .exchange(&[
                ("code", grant.code.as_str()),
                ("client_id", self.oauth.client_id.as_str()),
                ("client_secret", self.oauth.client_secret.as_str()),
                ("redirect_uri", grant.redirect_uri.as_str()),
                ("grant_type", "authorization_code"),
            ])
            .await?;

        self.store.save(&Credential {
            access_token: token.access_token,
            refresh_token: token.refresh_token.filter(|t| !t.is_empty()),
            expires_at: expiry(token.expires_in),
        })?;
        state.generation += 1;

        match self.store.load()? {
            Some(credential) if credential.is_complete() => {
                info!("Authorization complete");
                Ok(credential)
            }
            _ => Err(GoAwayError::Auth(
                "token endpoint did not return a refresh token".to_string(),
            )),
        }
    }

    /// Exchange the stored refresh token for a new access token
    pub async fn refresh_credentials(&self) -> Result<BearerToken> {
        let mut state = self.refresh.lock().await;
        self.refresh_locked(&mut state).await
    }

    /// Current access token for outbound requests
    pub async fn bearer(&self) -> Result<BearerToken> {
        let state = self.refresh.lock().await;
        let credential = self.store.load()?.ok_or_else(|| {
            GoAwayError::Auth("no stored credential, run `go-away auth` first".to_string())
        })?;
        Ok(BearerToken {
            access_token: credential.access_token,
            generation: state.generation,
        })
    }

    /// Called after `rejected` drew a 401
    ///
    /// Refreshes only if nobody replaced that token in the meantime, so
    /// concurrent rejections share a single token-endpoint call.
    pub async fn refresh_rejected(&self, rejected: &BearerToken) -> Result<BearerToken> {
        let mut state = self.refresh.lock().await;
        if state.generation != rejected.generation {
            debug!("Access token already refreshed by another request");
            let credential = self.store.load()?.ok_or_else(|| {
                GoAwayError::Auth("credential disappeared during refresh".to_string())
            })?;
            return Ok(BearerToken {
                access_token: credential.access_token,
                generation: state.generation,
            });
        }
        self.refresh_locked(&mut state).await
    }

    /// Forget stored tokens so the next `ensure_credentials` re-authorizes
    pub async fn reset_credentials(&self) -> Result<()> {
        let mut state = self.refresh.lock().await;
        self.store.clear()?;
        state.generation += 1;
        info!("Cleared stored credential");
        Ok(())
    }

    async fn refresh_locked(&self, state: &mut RefreshState) -> Result<BearerToken> {
        let refresh_token = self
            .store
            .load()?
            .and_then(|credential| credential.refresh_token)
            .ok_or_else(|| GoAwayError::Auth("no refresh token stored".to_string()))?;

        warn!("Access token rejected, refreshing");
        let token = self
            .exchange(&[
                ("client_id", self.oauth.client_id.as_str()),
                ("client_secret", self.oauth.client_secret.as_str()),
                ("refresh_token", refresh_token.as_str()),
                ("grant_type", "refresh_token"),
            ])
            .await?;

        self.store
            .update_access_token(&token.access_token, expiry(token.expires_in))?;
        state.generation += 1;
        debug!("Access token refreshed (generation {})", state.generation);

        Ok(BearerToken {
            access_token: token.access_token,
            generation: state.generation,
        })
    }

    async fn exchange(&self, fields: &[(&str, &str)]) -> Result<TokenResponse> {
        let request = ApiRequest::post_form(self.oauth.token_uri.as_str(), fields.iter().copied());
        let response = self.http.send(&request).await?;

        if !response.is_success() {
            return Err(GoAwayError::Auth(format!(
                "token endpoint returned HTTP {}: {}",
                response.status.as_u16(),
                String::from_utf8_lossy(&response.body)
            )));
        }

        response
            .json::<TokenResponse>()
            .map_err(|e| GoAwayError::Auth(format!("malformed token response: {}", e)))
    }
}

fn expiry(expires_in: Option<i64>) -> Option<chrono::DateTime<Utc>> {
    expires_in
        .filter(|seconds| *seconds > 0)
        .map(|seconds| Utc::now() + ChronoDuration::seconds(seconds))
}
