//! Command-line interface

use clap::{Parser, Subcommand};
use indicatif::MultiProgress;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::auth::{AuthorizationPrompt, LoopbackPrompt};
use crate::config::Config;
use crate::credentials::{CredentialStore, SqliteCredentialStore};
use crate::error::{GoAwayError, Result};
use crate::http::HttpClient;
use crate::models::Inbox;
use crate::orchestrator::{Orchestrator, RunReport};
use crate::provider::{self, MailProvider};
use crate::safe_senders::SafeSenders;
use crate::store::Store;

#[derive(Parser, Debug)]
#[command(name = "go-away")]
#[command(version = "0.1.0")]
#[command(about = "Unsubscribe from mailing lists straight from your inbox, exactly once", long_about = None)]
pub struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "go-away.toml")]
    pub config: PathBuf,

    /// Path to the SQLite database (overrides storage.database)
    #[arg(long)]
    pub database: Option<PathBuf>,

    /// Verbose logging
    #[arg(short, long)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Authorize access to the configured inboxes
    Auth {
        /// Only authorize this inbox address
        #[arg(long)]
        inbox: Option<String>,

        /// Discard stored tokens and authorize again
        #[arg(long)]
        force: bool,
    },

    /// Scan inboxes and send unsubscribe requests
    Run {
        /// Dry run mode (resolve and report, send nothing, record nothing)
        #[arg(long)]
        dry_run: bool,

        /// Write a Markdown report to this path
        #[arg(long)]
        report: Option<PathBuf>,
    },

    /// Show registered inboxes and ledger totals
    Status,

    /// Generate example configuration file
    InitConfig {
        /// Path to create config file
        #[arg(short, long, default_value = "go-away.toml")]
        output: PathBuf,

        /// Overwrite existing file
        #[arg(long)]
        force: bool,
    },
}

/// Status of one inbox, as shown by `go-away status`
#[derive(Debug, Clone)]
pub struct InboxStatus {
    pub inbox: Inbox,
    pub authorized: bool,
    pub seen: u64,
    pub unsubscribed: u64,
}

/// Open the database and register every configured inbox
pub fn open_store(cli: &Cli, config: &Config) -> Result<(Arc<Store>, Vec<Inbox>)> {
    let path = cli
        .database
        .clone()
        .unwrap_or_else(|| config.storage.database.clone());
    let store = Arc::new(Store::open(&path)?);

    let mut inboxes = Vec::with_capacity(config.inboxes.len());
    for entry in &config.inboxes {
        inboxes.push(store.upsert_inbox(entry.address().trim(), entry.provider())?);
    }
    Ok((store, inboxes))
}

fn loopback_prompt(config: &Config) -> Arc<dyn AuthorizationPrompt> {
    Arc::new(LoopbackPrompt::new(
        config.auth.authorization_timeout(),
        config.auth.shutdown_grace(),
    ))
}

fn require_inboxes(inboxes: &[Inbox], config_path: &Path) -> Result<()> {
    if inboxes.is_empty() {
        return Err(GoAwayError::Config(format!(
            "No inboxes configured. Add an [[inboxes]] entry to {:?}",
            config_path
        )));
    }
    Ok(())
}

/// Authorize inboxes, optionally discarding stored tokens first
///
/// Inboxes are handled one at a time since each may need the operator.
pub async fn authenticate(
    cli: &Cli,
    config: &Config,
    only: Option<&str>,
    force: bool,
) -> Result<Vec<Inbox>> {
    let (store, inboxes) = open_store(cli, config)?;
    require_inboxes(&inboxes, &cli.config)?;

    let selected: Vec<Inbox> = inboxes
        .into_iter()
        .filter(|inbox| only.map_or(true, |address| inbox.address.eq_ignore_ascii_case(address)))
        .collect();
    if selected.is_empty() {
        return Err(GoAwayError::Config(format!(
            "Inbox {} is not configured",
            only.unwrap_or_default()
        )));
    }

    let http = HttpClient::new(config.http.request_timeout())?;
    let prompt = loopback_prompt(config);
    for inbox in &selected {
        let credentials = provider::credential_manager(
            inbox,
            config,
            Arc::clone(&store),
            Arc::clone(&prompt),
            http.clone(),
        )
        .await?;
        if force {
            credentials.reset_credentials().await?;
        }
        credentials.ensure_credentials().await?;
        info!("Inbox {} is authorized", inbox.address);
    }

    Ok(selected)
}

/// Main orchestration function: connect every inbox and run the pipeline
///
/// # Arguments
/// * `cli` - CLI arguments containing configuration paths
/// * `config` - Loaded configuration
/// * `dry_run` - If true, don't send or record anything
/// * `report_path` - Optional Markdown report destination
/// * `multi` - Progress display shared with the log writer
/// * `cancel` - Fired on Ctrl-C
pub async fn run_pipeline(
    cli: &Cli,
    config: &Config,
    dry_run: bool,
    report_path: Option<&Path>,
    multi: MultiProgress,
    cancel: CancellationToken,
) -> Result<RunReport> {
    let (store, inboxes) = open_store(cli, config)?;
    require_inboxes(&inboxes, &cli.config)?;

    let http = HttpClient::new(config.http.request_timeout())?;
    let prompt = loopback_prompt(config);

    let mut connected: Vec<(Inbox, Arc<dyn MailProvider>)> = Vec::with_capacity(inboxes.len());
    for inbox in inboxes {
        let provider = tokio::select! {
            _ = cancel.cancelled() => {
                return Err(GoAwayError::Cancelled("connecting inboxes".to_string()));
            }
            result = provider::connect(
                &inbox,
                config,
                Arc::clone(&store),
                Arc::clone(&prompt),
                http.clone(),
            ) => result?,
        };
        connected.push((inbox, provider));
    }

    let orchestrator = Orchestrator::new(
        store,
        SafeSenders::new(&config.scan.safe_senders),
        dry_run,
    )
    .with_cancellation(cancel)
    .with_progress(multi);

    let report = orchestrator.run(connected).await?;

    if let Some(path) = report_path {
        report.save(path).await?;
        info!("Report saved to {:?}", path);
    }

    Ok(report)
}

/// Registered inboxes with credential state and ledger totals
pub fn status(cli: &Cli, config: &Config) -> Result<Vec<InboxStatus>> {
    let (store, _) = open_store(cli, config)?;

    let mut statuses = Vec::new();
    for inbox in store.list_inboxes()? {
        let authorized = SqliteCredentialStore::new(Arc::clone(&store), inbox.id)
            .load()?
            .is_some_and(|credential| credential.is_complete());
        let counts = store.counts(&inbox.address)?;
        statuses.push(InboxStatus {
            inbox,
            authorized,
            seen: counts.seen,
            unsubscribed: counts.unsubscribed,
        });
    }
    Ok(statuses)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::InboxSpec;
    use crate::ledger::Ledger;
    use crate::models::Credential;
    use tempfile::TempDir;

    fn cli(dir: &TempDir, command: Commands) -> Cli {
        Cli {
            config: dir.path().join("go-away.toml"),
            database: Some(dir.path().join("state").join("go-away.sqlite3")),
            verbose: false,
            command,
        }
    }

    fn config_with(addresses: &[&str]) -> Config {
        Config {
            inboxes: addresses
                .iter()
                .map(|address| InboxSpec::Gmail {
                    address: address.to_string(),
                })
                .collect(),
            ..Config::default()
        }
    }

    #[test]
    fn test_parse_run_command() {
        let cli = Cli::parse_from(["go-away", "--verbose", "run", "--dry-run", "--report", "out.md"]);
        assert!(cli.verbose);
        assert_eq!(cli.config, PathBuf::from("go-away.toml"));
        match cli.command {
            Commands::Run { dry_run, report } => {
                assert!(dry_run);
                assert_eq!(report, Some(PathBuf::from("out.md")));
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_parse_auth_command() {
        let cli = Cli::parse_from([
            "go-away",
            "--database",
            "/tmp/db.sqlite3",
            "auth",
            "--inbox",
            "me@gmail.com",
            "--force",
        ]);
        assert_eq!(cli.database, Some(PathBuf::from("/tmp/db.sqlite3")));
        match cli.command {
            Commands::Auth { inbox, force } => {
                assert_eq!(inbox.as_deref(), Some("me@gmail.com"));
                assert!(force);
            }
            other => panic!("unexpected command: {other:?}"),
        }
    }

    #[test]
    fn test_open_store_registers_configured_inboxes() {
        let dir = TempDir::new().unwrap();
        let cli = cli(&dir, Commands::Status);
        let config = config_with(&["me@gmail.com", "work@gmail.com"]);

        let (_, first) = open_store(&cli, &config).unwrap();
        let (store, second) = open_store(&cli, &config).unwrap();

        assert_eq!(first, second);
        assert_eq!(store.list_inboxes().unwrap().len(), 2);
    }

    #[test]
    fn test_status_reports_counts_and_authorization() {
        let dir = TempDir::new().unwrap();
        let cli = cli(&dir, Commands::Status);
        let config = config_with(&["me@gmail.com", "work@gmail.com"]);

        let (store, inboxes) = open_store(&cli, &config).unwrap();
        SqliteCredentialStore::new(Arc::clone(&store), inboxes[0].id)
            .save(&Credential {
                access_token: "a".to_string(),
                refresh_token: Some("r".to_string()),
                expires_at: None,
            })
            .unwrap();
        store.mark_seen("m1", "me@gmail.com").unwrap();
        store
            .record_unsubscribe("m1", "news.example", "me@gmail.com")
            .unwrap();
        drop(store);

        let statuses = status(&cli, &config).unwrap();
        assert_eq!(statuses.len(), 2);
        assert!(statuses[0].authorized);
        assert_eq!(statuses[0].seen, 1);
        assert_eq!(statuses[0].unsubscribed, 1);
        assert!(!statuses[1].authorized);
        assert_eq!(statuses[1].seen, 0);
    }

    #[tokio::test]
    async fn test_run_without_inboxes_is_config_error() {
        let dir = TempDir::new().unwrap();
        let cli = cli(
            &dir,
            Commands::Run {
                dry_run: false,
                report: None,
            },
        );

        let result = run_pipeline(
            &cli,
            &Config::default(),
            false,
            None,
            MultiProgress::new(),
            CancellationToken::new(),
        )
        .await;
        assert!(matches!(result, Err(GoAwayError::Config(_))));
    }

    #[tokio::test]
    async fn test_authenticate_unknown_inbox() {
        let dir = TempDir::new().unwrap();
        let cli = cli(
            &dir,
            Commands::Auth {
                inbox: Some("other@gmail.com".to_string()),
                force: false,
            },
        );
        let config = config_with(&["me@gmail.com"]);

        let result = authenticate(&cli, &config, Some("other@gmail.com"), false).await;
        assert!(matches!(result, Err(GoAwayError::Config(ref msg)) if msg.contains("not configured")));
    }
}
