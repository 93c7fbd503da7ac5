//! go-away
//!
//! Scans mail inboxes for `List-Unsubscribe` directives and unsubscribes by
//! sending the requested `mailto:` message, at most once per mailing list.
//!
//! # Overview
//!
//! - **Credentials**: OAuth2 authorization-code flow through a loopback
//!   redirect, with tokens stored per inbox and refreshed on a 401
//! - **Providers**: Gmail over its REST API, behind the [`MailProvider`] trait
//! - **Resolution**: `List-Unsubscribe` parsing into an executable action
//! - **Ledger**: SQLite record of seen messages and unsubscribed lists, so
//!   repeated runs never send twice
//! - **Orchestration**: concurrent per-inbox processing with cancellation
//!
//! # Example Usage
//!
//! ```no_run
//! use go_away::{Config, Orchestrator, SafeSenders, Store};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let config = Config::load("go-away.toml".as_ref()).await?;
//!     let store = Arc::new(Store::open(&config.storage.database)?);
//!
//!     let orchestrator = Orchestrator::new(
//!         store,
//!         SafeSenders::new(&config.scan.safe_senders),
//!         config.execution.dry_run,
//!     );
//!
//!     // Connect inboxes with `provider::connect`, then:
//!     let report = orchestrator.run(Vec::new()).await?;
//!     println!("{}", report.to_markdown());
//!     Ok(())
//! }
//! ```
//!
//! # Module Organization
//!
//! - [`auth`] - OAuth client configuration and the credential lifecycle
//! - [`cli`] - Command-line interface and command pipelines
//! - [`config`] - Configuration management
//! - [`credentials`] - Per-inbox token persistence
//! - [`error`] - Error types and result aliases
//! - [`gmail`] - Gmail REST provider
//! - [`http`] - HTTPS client with request timeouts
//! - [`ledger`] - Exactly-once ledger over the store
//! - [`loopback`] - Local redirect listener for authorization codes
//! - [`models`] - Core data structures
//! - [`orchestrator`] - Per-inbox pipeline and run reports
//! - [`provider`] - The mail provider capability and its construction
//! - [`safe_senders`] - Sender allow-list
//! - [`store`] - SQLite database
//! - [`unsubscribe`] - `List-Unsubscribe` resolution

pub mod auth;
pub mod cli;
pub mod config;
pub mod credentials;
pub mod error;
pub mod gmail;
pub mod http;
pub mod ledger;
pub mod loopback;
pub mod models;
pub mod orchestrator;
pub mod provider;
pub mod safe_senders;
pub mod store;
pub mod unsubscribe;

// Re-export commonly used types for convenience
pub use error::{GoAwayError, Result};

pub use models::{Action, Credential, Header, Inbox, Message, ProviderKind};

pub use auth::{
    AuthorizationPrompt, AuthorizationUrl, CredentialManager, LoopbackPrompt, OAuthClientConfig,
};
pub use config::{Config, InboxSpec};
pub use credentials::{CredentialStore, SqliteCredentialStore};
pub use ledger::{Ledger, LedgerCounts};
pub use store::Store;

pub use gmail::GmailProvider;
pub use provider::MailProvider;

pub use orchestrator::{InboxReport, Orchestrator, Outcome, RunReport};
pub use safe_senders::SafeSenders;
pub use unsubscribe::{resolve, Resolution, Unsubscribe};

pub use cli::{Cli, Commands};
