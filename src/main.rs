use anyhow::Result;
use clap::Parser;
use go_away::cli::{self, Cli, Commands};
use go_away::config::Config;
use go_away::error::GoAwayError;
use indicatif::MultiProgress;
use std::io::Write;
use std::process;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::fmt::MakeWriter;
use tracing_subscriber::EnvFilter;

/// A writer that prints through MultiProgress to avoid progress bar conflicts
#[derive(Clone)]
struct MultiProgressWriter {
    multi: Arc<MultiProgress>,
    buffer: Vec<u8>,
}

impl Write for MultiProgressWriter {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        self.buffer.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> std::io::Result<()> {
        if !self.buffer.is_empty() {
            let msg = String::from_utf8_lossy(&self.buffer);
            let msg = msg.trim_end_matches('\n');
            if !msg.is_empty() {
                let _ = self.multi.println(msg);
            }
            self.buffer.clear();
        }
        Ok(())
    }
}

impl Drop for MultiProgressWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

#[derive(Clone)]
struct MultiProgressMakeWriter {
    multi: Arc<MultiProgress>,
}

impl<'a> MakeWriter<'a> for MultiProgressMakeWriter {
    type Writer = MultiProgressWriter;

    fn make_writer(&'a self) -> Self::Writer {
        MultiProgressWriter {
            multi: Arc::clone(&self.multi),
            buffer: Vec::new(),
        }
    }
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {}", e);
        if let Some(hint) = e.downcast_ref::<GoAwayError>().and_then(hint) {
            eprintln!("\nHint: {}", hint);
        }
        eprintln!("\nFor help, run: go-away --help");
        process::exit(1);
    }
}

fn hint(error: &GoAwayError) -> Option<&'static str> {
    match error {
        GoAwayError::Auth(_) | GoAwayError::Unauthorized(_) => {
            Some("Stored tokens may have been revoked. Try running: go-away auth --force")
        }
        GoAwayError::AuthorizationTimeout(_) => {
            Some("Open the printed URL in a browser on this machine and finish signing in.")
        }
        GoAwayError::Config(_) => Some("Check your configuration file, or run: go-away init-config"),
        GoAwayError::RateLimitExceeded { .. } => {
            Some("Gmail is rate limiting this account. Unsent requests are retried on the next run.")
        }
        _ => None,
    }
}

async fn run() -> Result<()> {
    // Both aws-lc-rs and ring may be linked; pick one explicitly
    #[cfg(not(windows))]
    rustls::crypto::aws_lc_rs::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    #[cfg(windows)]
    rustls::crypto::ring::default_provider()
        .install_default()
        .map_err(|_| anyhow::anyhow!("Failed to install default crypto provider"))?;

    let cli = Cli::parse();

    let filter = if cli.verbose {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("go_away=debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("go_away=info"))
    };

    // Logs print above the per-inbox spinners
    let multi_progress = Arc::new(MultiProgress::new());
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(MultiProgressMakeWriter {
            multi: Arc::clone(&multi_progress),
        })
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    match &cli.command {
        Commands::Auth { inbox, force } => {
            let config = Config::load(&cli.config).await?;
            let authorized = cli::authenticate(&cli, &config, inbox.as_deref(), *force).await?;

            for inbox in &authorized {
                println!("Authorized {} ({})", inbox.address, inbox.provider.as_str());
            }
            Ok(())
        }

        Commands::Run { dry_run, report } => {
            let config = Config::load(&cli.config).await?;
            let dry_run = *dry_run || config.execution.dry_run;
            if dry_run {
                println!("Running in DRY RUN mode - nothing will be sent or recorded");
            }

            let cancel = CancellationToken::new();
            let on_signal = cancel.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    tracing::warn!("Interrupted, finishing in-flight work...");
                    on_signal.cancel();
                }
            });

            let report = cli::run_pipeline(
                &cli,
                &config,
                dry_run,
                report.as_deref(),
                (*multi_progress).clone(),
                cancel,
            )
            .await?;

            println!("\n========================================");
            println!("Run Summary");
            println!("========================================");
            println!("Run ID: {}", report.run_id);
            println!(
                "Duration: {} seconds",
                (report.completed_at - report.started_at).num_seconds()
            );
            for inbox in &report.inboxes {
                println!(
                    "{}: scanned {}, unsubscribed {}, planned {}, retry later {}, failed {}",
                    inbox.address,
                    inbox.scanned,
                    inbox.unsubscribed,
                    inbox.planned,
                    inbox.retry_later,
                    inbox.send_failed
                );
                if let Some(error) = &inbox.error {
                    println!("  error: {}", error);
                }
            }
            println!("Messages scanned: {}", report.messages_scanned());
            if report.dry_run {
                println!("Unsubscribes planned: {}", report.actions_planned());
            } else {
                println!("Unsubscribes sent: {}", report.actions_executed());
            }
            println!("========================================");
            Ok(())
        }

        Commands::Status => {
            let config = Config::load(&cli.config).await?;
            let statuses = cli::status(&cli, &config)?;

            if statuses.is_empty() {
                println!("No inboxes registered.");
                println!("Add one to {:?} and run: go-away auth", cli.config);
                return Ok(());
            }

            println!("\n========================================");
            println!("Inboxes");
            println!("========================================");
            for status in &statuses {
                println!(
                    "{} [{}] {}",
                    status.inbox.address,
                    status.inbox.provider.as_str(),
                    if status.authorized {
                        "authorized"
                    } else {
                        "not authorized"
                    }
                );
                println!(
                    "  messages seen: {}, lists unsubscribed: {}",
                    status.seen, status.unsubscribed
                );
            }
            println!("========================================");
            Ok(())
        }

        Commands::InitConfig { output, force } => {
            if output.exists() && !force {
                return Err(GoAwayError::Config(format!(
                    "Configuration file already exists at {:?}. Use --force to overwrite.",
                    output
                ))
                .into());
            }

            Config::create_example(output).await?;

            println!("Created example configuration file at: {:?}", output);
            println!("\nPlease edit this file before running. Key settings:");
            println!("  - inboxes: the Gmail addresses to scan");
            println!("  - gmail.client_id / gmail.client_secret: your OAuth client");
            println!("  - scan.safe_senders: senders that are never unsubscribed from");
            println!("  - execution.dry_run: report without sending");
            Ok(())
        }
    }
}
