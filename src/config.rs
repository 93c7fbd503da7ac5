use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::auth::{DEFAULT_AUTH_URI, DEFAULT_TOKEN_URI};
use crate::error::{GoAwayError, Result};
use crate::models::ProviderKind;

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct Config {
    #[serde(default)]
    pub storage: StorageConfig,
    #[serde(default)]
    pub gmail: GmailConfig,
    #[serde(default)]
    pub auth: AuthConfig,
    #[serde(default)]
    pub http: HttpConfig,
    #[serde(default)]
    pub scan: ScanConfig,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub inboxes: Vec<InboxSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    #[serde(default = "default_database")]
    pub database: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            database: default_database(),
        }
    }
}

/// OAuth client and REST settings for Gmail inboxes
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GmailConfig {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub client_secret: Option<String>,
    /// Google "installed app" client JSON, used when id/secret are not set
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_file: Option<PathBuf>,
    #[serde(default = "default_auth_uri")]
    pub auth_uri: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    /// Gmail search expression applied when listing messages
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query: Option<String>,
}

impl Default for GmailConfig {
    fn default() -> Self {
        Self {
            client_id: None,
            client_secret: None,
            credentials_file: None,
            auth_uri: default_auth_uri(),
            token_uri: default_token_uri(),
            api_base: default_api_base(),
            page_size: default_page_size(),
            query: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default = "default_authorization_timeout_secs")]
    pub authorization_timeout_secs: u64,
    #[serde(default = "default_shutdown_grace_secs")]
    pub shutdown_grace_secs: u64,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            authorization_timeout_secs: default_authorization_timeout_secs(),
            shutdown_grace_secs: default_shutdown_grace_secs(),
        }
    }
}

impl AuthConfig {
    pub fn authorization_timeout(&self) -> Duration {
        Duration::from_secs(self.authorization_timeout_secs)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HttpConfig {
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for HttpConfig {
    fn default() -> Self {
        Self {
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

impl HttpConfig {
    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ScanConfig {
    /// Substrings of From headers whose mail is never acted on
    #[serde(default)]
    pub safe_senders: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub dry_run: bool,
}

/// One configured inbox, tagged by provider
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum InboxSpec {
    Gmail { address: String },
}

impl InboxSpec {
    pub fn provider(&self) -> ProviderKind {
        match self {
            InboxSpec::Gmail { .. } => ProviderKind::Gmail,
        }
    }

    pub fn address(&self) -> &str {
        match self {
            InboxSpec::Gmail { address } => address,
        }
    }
}

fn default_database() -> PathBuf {
    PathBuf::from("go-away.sqlite3")
}

fn default_auth_uri() -> String {
    DEFAULT_AUTH_URI.to_string()
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

fn default_api_base() -> String {
    "https://gmail.googleapis.com".to_string()
}

fn default_page_size() -> u32 {
    25
}

fn default_authorization_timeout_secs() -> u64 {
    300
}

fn default_shutdown_grace_secs() -> u64 {
    5
}

fn default_request_timeout_secs() -> u64 {
    30
}

impl Config {
    pub async fn load(path: &Path) -> Result<Self> {
        // If file doesn't exist, return default config with warning
        if !path.exists() {
            tracing::warn!("Config file not found at {:?}, using defaults", path);
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| GoAwayError::Config(format!("Failed to read config file: {}", e)))?;

        let config: Self = toml::from_str(&content)
            .map_err(|e| GoAwayError::Config(format!("Failed to parse config file: {}", e)))?;

        config.validate()?;

        tracing::info!("Loaded configuration from {:?}", path);
        Ok(config)
    }

    pub async fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(|e| {
                GoAwayError::Config(format!("Failed to create config directory: {}", e))
            })?;
        }

        let content = toml::to_string_pretty(self)
            .map_err(|e| GoAwayError::Config(format!("Failed to serialize config: {}", e)))?;

        tokio::fs::write(path, content)
            .await
            .map_err(|e| GoAwayError::Config(format!("Failed to write config file: {}", e)))?;

        tracing::info!("Saved configuration to {:?}", path);
        Ok(())
    }

    /// Validate configuration values
    pub fn validate(&self) -> Result<()> {
        if self.storage.database.as_os_str().is_empty() {
            return Err(GoAwayError::Config(
                "storage.database cannot be empty".to_string(),
            ));
        }

        // Gmail caps maxResults at 500
        if self.gmail.page_size == 0 {
            return Err(GoAwayError::Config(
                "gmail.page_size must be at least 1".to_string(),
            ));
        }
        if self.gmail.page_size > 500 {
            return Err(GoAwayError::Config(
                "gmail.page_size cannot exceed 500".to_string(),
            ));
        }

        for (name, value) in [
            ("gmail.auth_uri", &self.gmail.auth_uri),
            ("gmail.token_uri", &self.gmail.token_uri),
            ("gmail.api_base", &self.gmail.api_base),
        ] {
            url::Url::parse(value).map_err(|e| {
                GoAwayError::Config(format!("Invalid {}: '{}' ({})", name, value, e))
            })?;
        }

        if self.auth.authorization_timeout_secs == 0 {
            return Err(GoAwayError::Config(
                "auth.authorization_timeout_secs must be greater than 0".to_string(),
            ));
        }

        if self.http.request_timeout_secs == 0 {
            return Err(GoAwayError::Config(
                "http.request_timeout_secs must be greater than 0".to_string(),
            ));
        }

        // An empty entry would match every sender
        for sender in &self.scan.safe_senders {
            if sender.trim().is_empty() {
                return Err(GoAwayError::Config(
                    "scan.safe_senders cannot contain empty strings".to_string(),
                ));
            }
        }

        let mut seen = HashSet::new();
        for inbox in &self.inboxes {
            let address = inbox.address().trim();
            if address.is_empty() || !address.contains('@') {
                return Err(GoAwayError::Config(format!(
                    "Invalid inbox address: '{}'",
                    inbox.address()
                )));
            }
            if !seen.insert((inbox.provider(), address.to_lowercase())) {
                return Err(GoAwayError::Config(format!(
                    "Inbox {} is configured more than once",
                    address
                )));
            }
        }

        tracing::debug!("Configuration validation passed");
        Ok(())
    }

    /// Create an example configuration file
    pub async fn create_example(path: &Path) -> Result<()> {
        let config = Self {
            scan: ScanConfig {
                safe_senders: vec!["@mybank.example".to_string()],
            },
            inboxes: vec![InboxSpec::Gmail {
                address: "you@gmail.com".to_string(),
            }],
            ..Self::default()
        };
        config.save(path).await
    }
}
