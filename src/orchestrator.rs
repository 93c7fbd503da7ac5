//! Per-inbox unsubscribe pipeline and run-level coordination
//!
//! For every fetched message the orchestrator consults the safe-sender list
//! and the ledger before resolving, so no network side effect happens for a
//! message that was already handled. A send is reserved in the ledger before
//! it goes out and recorded in one transaction after it succeeded, so a
//! failed ledger write can cost an unsubscribe but never repeat one.

use chrono::{DateTime, Utc};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::error::{GoAwayError, Result};
use crate::ledger::Ledger;
use crate::models::{Inbox, Message};
use crate::provider::MailProvider;
use crate::safe_senders::SafeSenders;
use crate::unsubscribe::{resolve, Resolution, Unsubscribe};

/// What happened to one message
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    SafeSender,
    AlreadySeen,
    NoDirective,
    Unusable,
    AlreadyUnsubscribed,
    Unsubscribed,
    /// Dry run: would have sent
    Planned,
    /// Transient send failure, left unseen for the next run
    RetryLater,
    /// Permanent send failure, marked seen
    SendFailed,
}

/// An unsubscribe request that was sent (or would be, in a dry run)
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutedAction {
    pub message_id: String,
    pub list_id: String,
    pub mailto: String,
    pub subject: String,
}

/// Counters for one inbox
#[derive(Debug, Clone, Default)]
pub struct InboxReport {
    pub address: String,
    /// Messages considered, excluding safe senders
    pub scanned: usize,
    pub safe_senders: usize,
    pub already_seen: usize,
    pub no_directive: usize,
    pub unusable: usize,
    pub already_unsubscribed: usize,
    pub unsubscribed: usize,
    pub planned: usize,
    pub retry_later: usize,
    pub send_failed: usize,
    pub actions: Vec<ExecutedAction>,
    /// Inbox-level failure that stopped processing early
    pub error: Option<String>,
}

impl InboxReport {
    fn new(address: &str) -> Self {
        Self {
            address: address.to_string(),
            ..Self::default()
        }
    }

    fn record(&mut self, outcome: Outcome) {
        if outcome != Outcome::SafeSender {
            self.scanned += 1;
        }
        match outcome {
            Outcome::SafeSender => self.safe_senders += 1,
            Outcome::AlreadySeen => self.already_seen += 1,
            Outcome::NoDirective => self.no_directive += 1,
            Outcome::Unusable => self.unusable += 1,
            Outcome::AlreadyUnsubscribed => self.already_unsubscribed += 1,
            Outcome::Unsubscribed => self.unsubscribed += 1,
            Outcome::Planned => self.planned += 1,
            Outcome::RetryLater => self.retry_later += 1,
            Outcome::SendFailed => self.send_failed += 1,
        }
    }

    /// Unsubscribe requests actually sent
    pub fn actions_executed(&self) -> usize {
        self.unsubscribed
    }
}

/// Summary of a whole run across inboxes
#[derive(Debug, Clone)]
pub struct RunReport {
    pub run_id: String,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    pub dry_run: bool,
    pub inboxes: Vec<InboxReport>,
}

impl RunReport {
    pub fn messages_scanned(&self) -> usize {
        self.inboxes.iter().map(|i| i.scanned).sum()
    }

    pub fn actions_executed(&self) -> usize {
        self.inboxes.iter().map(|i| i.actions_executed()).sum()
    }

    pub fn actions_planned(&self) -> usize {
        self.inboxes.iter().map(|i| i.planned).sum()
    }

    /// Generate Markdown report
    pub fn to_markdown(&self) -> String {
        let mut md = String::new();

        if self.dry_run {
            md.push_str("# Unsubscribe Report (DRY RUN)\n\n");
            md.push_str("> **DRY RUN MODE** - No mail was sent and nothing was recorded.\n\n");
        } else {
            md.push_str("# Unsubscribe Report\n\n");
        }
        md.push_str(&format!(
            "Generated: {}\n\n",
            self.completed_at.format("%Y-%m-%d %H:%M:%S")
        ));

        let duration = (self.completed_at - self.started_at).num_seconds().max(0);
        md.push_str("## Summary\n\n");
        md.push_str(&format!("- **Run ID:** {}\n", self.run_id));
        md.push_str(&format!("- **Inboxes:** {}\n", self.inboxes.len()));
        md.push_str(&format!("- **Messages scanned:** {}\n", self.messages_scanned()));
        if self.dry_run {
            md.push_str(&format!(
                "- **Unsubscribes planned:** {}\n",
                self.actions_planned()
            ));
        } else {
            md.push_str(&format!(
                "- **Unsubscribes sent:** {}\n",
                self.actions_executed()
            ));
        }
        md.push_str(&format!(
            "- **Processing time:** {} minutes {} seconds\n\n",
            duration / 60,
            duration % 60
        ));

        for inbox in &self.inboxes {
            md.push_str(&format!("## {}\n\n", inbox.address));
            if let Some(error) = &inbox.error {
                md.push_str(&format!("> **Stopped early:** {}\n\n", error));
            }

            md.push_str("| Outcome | Messages |\n");
            md.push_str("|---------|----------|\n");
            for (label, count) in [
                ("Scanned", inbox.scanned),
                ("Safe senders (skipped)", inbox.safe_senders),
                ("Already seen", inbox.already_seen),
                ("No List-Unsubscribe", inbox.no_directive),
                ("Unusable directive", inbox.unusable),
                ("Already unsubscribed", inbox.already_unsubscribed),
                ("Unsubscribed", inbox.unsubscribed),
                ("Planned (dry run)", inbox.planned),
                ("Send failed, retry next run", inbox.retry_later),
                ("Send failed permanently", inbox.send_failed),
            ] {
                if count > 0 || label == "Scanned" {
                    md.push_str(&format!("| {} | {} |\n", label, count));
                }
            }
            md.push('\n');

            if !inbox.actions.is_empty() {
                md.push_str("| List | Sent to | Subject |\n");
                md.push_str("|------|---------|---------|\n");
                for action in &inbox.actions {
                    md.push_str(&format!(
                        "| {} | {} | {} |\n",
                        action.list_id.replace('|', "\\|"),
                        action.mailto.replace('|', "\\|"),
                        action.subject.replace('|', "\\|")
                    ));
                }
                md.push('\n');
            }
        }

        if self.dry_run {
            md.push_str("---\n\n");
            md.push_str("_To send these requests, run the command again without the `--dry-run` flag._\n");
        }

        md
    }

    /// Save report to file
    pub async fn save(&self, path: &Path) -> std::io::Result<()> {
        if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(path, self.to_markdown()).await
    }
}

/// Runs the pipeline for one or more inboxes
#[derive(Clone)]
pub struct Orchestrator {
    ledger: Arc<dyn Ledger>,
    safe_senders: Arc<SafeSenders>,
    dry_run: bool,
    cancel: CancellationToken,
    progress: Option<MultiProgress>,
}

impl Orchestrator {
    pub fn new(ledger: Arc<dyn Ledger>, safe_senders: SafeSenders, dry_run: bool) -> Self {
        Self {
            ledger,
            safe_senders: Arc::new(safe_senders),
            dry_run,
            cancel: CancellationToken::new(),
            progress: None,
        }
    }

    /// Stop between messages when `cancel` fires
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Show a spinner per inbox
    pub fn with_progress(mut self, multi: MultiProgress) -> Self {
        self.progress = Some(multi);
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Process all inboxes concurrently
    ///
    /// A fatal error in any inbox cancels the others and is returned.
    /// Non-fatal inbox failures are recorded in that inbox's report.
    pub async fn run(&self, inboxes: Vec<(Inbox, Arc<dyn MailProvider>)>) -> Result<RunReport> {
        let run_id = uuid::Uuid::new_v4().to_string();
        let started_at = Utc::now();
        info!(
            "Starting run {} over {} inbox(es){}",
            run_id,
            inboxes.len(),
            if self.dry_run { " (dry run)" } else { "" }
        );

        let mut tasks = JoinSet::new();
        for (index, (inbox, provider)) in inboxes.into_iter().enumerate() {
            let orchestrator = self.clone();
            tasks.spawn(async move {
                let result = orchestrator.process_inbox(&inbox, provider.as_ref()).await;
                (index, inbox, result)
            });
        }

        let mut reports = Vec::new();
        let mut fatal: Option<GoAwayError> = None;
        while let Some(joined) = tasks.join_next().await {
            let (index, inbox, result) = match joined {
                Ok(done) => done,
                Err(e) => {
                    error!("Inbox task failed: {}", e);
                    self.cancel.cancel();
                    fatal.get_or_insert(GoAwayError::State(format!("inbox task failed: {}", e)));
                    continue;
                }
            };

            match result {
                Ok(report) => reports.push((index, report)),
                Err(e) => {
                    error!("Inbox {} aborted: {}", inbox.address, e);
                    self.cancel.cancel();
                    // Prefer the error that caused the cancellation
                    let replace = match &fatal {
                        None => true,
                        Some(GoAwayError::Cancelled(_)) => !matches!(e, GoAwayError::Cancelled(_)),
                        Some(_) => false,
                    };
                    if replace {
                        fatal = Some(e);
                    }
                }
            }
        }

        if let Some(e) = fatal {
            return Err(e);
        }

        reports.sort_by_key(|(index, _)| *index);
        let report = RunReport {
            run_id,
            started_at,
            completed_at: Utc::now(),
            dry_run: self.dry_run,
            inboxes: reports.into_iter().map(|(_, report)| report).collect(),
        };

        info!(
            "Run {} complete: {} messages scanned, {} unsubscribe(s) sent",
            report.run_id,
            report.messages_scanned(),
            report.actions_executed()
        );
        Ok(report)
    }

    /// Fetch and process one inbox
    ///
    /// Returns `Err` only for fatal errors (including cancellation).
    pub async fn process_inbox(&self, inbox: &Inbox, provider: &dyn MailProvider) -> Result<InboxReport> {
        let mut report = InboxReport::new(&inbox.address);
        let spinner = self.spinner(&inbox.address);

        let fetched = tokio::select! {
            _ = self.cancel.cancelled() => {
                return Err(GoAwayError::Cancelled(format!("fetching mail for {}", inbox.address)));
            }
            fetched = provider.get_mail() => fetched,
        };
        let messages = match fetched {
            Ok(messages) => messages,
            Err(e) if e.is_fatal() => return Err(e),
            Err(e) => {
                warn!("Could not fetch mail for {}: {}", inbox.address, e);
                report.error = Some(e.to_string());
                finish(spinner, &inbox.address, &report);
                return Ok(report);
            }
        };

        info!("Processing {} messages for {}", messages.len(), inbox.address);
        for message in &messages {
            if self.cancel.is_cancelled() {
                return Err(GoAwayError::Cancelled(format!(
                    "processing {} after {} messages",
                    inbox.address, report.scanned
                )));
            }

            let outcome = self
                .process_message(&inbox.address, provider, message, &mut report)
                .await?;
            debug!("Message {} for {}: {:?}", message.id, inbox.address, outcome);
            report.record(outcome);

            if let Some(spinner) = &spinner {
                spinner.set_message(format!(
                    "{}: {} scanned, {} unsubscribed",
                    inbox.address, report.scanned, report.unsubscribed
                ));
            }
        }

        finish(spinner, &inbox.address, &report);
        Ok(report)
    }

    async fn process_message(
        &self,
        recipient: &str,
        provider: &dyn MailProvider,
        message: &Message,
        report: &mut InboxReport,
    ) -> Result<Outcome> {
        if let Some(pattern) = self.safe_senders.matching(message.sender()) {
            debug!("Message {} is from safe sender '{}'", message.id, pattern);
            return Ok(Outcome::SafeSender);
        }

        if self.ledger.seen(&message.id, recipient)? {
            return Ok(Outcome::AlreadySeen);
        }

        let unsubscribe = match resolve(message) {
            Resolution::NoDirective => {
                self.mark_seen(&message.id, recipient)?;
                return Ok(Outcome::NoDirective);
            }
            Resolution::Unusable { reasons } => {
                debug!("Message {} has no usable directive: {}", message.id, reasons.join("; "));
                self.mark_seen(&message.id, recipient)?;
                return Ok(Outcome::Unusable);
            }
            Resolution::Actionable(unsubscribe) => unsubscribe,
        };

        let list_id = unsubscribe.list_id.as_str();
        if self.ledger.unsubscribed(list_id, recipient)? {
            debug!("{} already unsubscribed from {}", recipient, list_id);
            self.mark_seen(&message.id, recipient)?;
            return Ok(Outcome::AlreadyUnsubscribed);
        }

        if let Some(reserved_by) = self.ledger.pending_unsubscribe(list_id, recipient)? {
            warn!(
                "Request to unsubscribe {} from {} (message {}) may have been sent without being recorded; treating it as sent",
                recipient, list_id, reserved_by
            );
            if !self.dry_run {
                self.ledger.complete_unsubscribe(&reserved_by, list_id, recipient)?;
                self.ledger.mark_seen(&message.id, recipient)?;
            }
            return Ok(Outcome::AlreadyUnsubscribed);
        }

        if self.dry_run {
            info!(
                "[dry run] Would unsubscribe {} from {} via mailto:{}",
                recipient, list_id, unsubscribe.action.recipient
            );
            report.actions.push(executed(&message.id, &unsubscribe));
            return Ok(Outcome::Planned);
        }

        if !self.ledger.begin_unsubscribe(&message.id, list_id, recipient)? {
            debug!("Another run is unsubscribing {} from {}", recipient, list_id);
            return Ok(Outcome::RetryLater);
        }

        let action = &unsubscribe.action;
        match provider
            .send(&action.recipient, &action.subject, &action.body)
            .await
        {
            Ok(()) => {
                self.ledger.complete_unsubscribe(&message.id, list_id, recipient)?;
                info!(
                    "Unsubscribed {} from {} (mailto:{})",
                    recipient, list_id, action.recipient
                );
                report.actions.push(executed(&message.id, &unsubscribe));
                Ok(Outcome::Unsubscribed)
            }
            Err(e) if e.is_fatal() => {
                if let Err(release) = self
                    .ledger
                    .abandon_unsubscribe(&message.id, list_id, recipient, false)
                {
                    error!("Could not release reservation on {}: {}", list_id, release);
                }
                Err(e)
            }
            Err(e) if e.is_transient() => {
                warn!("Unsubscribe from {} failed, will retry next run: {}", list_id, e);
                self.ledger
                    .abandon_unsubscribe(&message.id, list_id, recipient, false)?;
                Ok(Outcome::RetryLater)
            }
            Err(e) => {
                warn!("Unsubscribe from {} failed: {}", list_id, e);
                self.ledger
                    .abandon_unsubscribe(&message.id, list_id, recipient, true)?;
                Ok(Outcome::SendFailed)
            }
        }
    }

    fn mark_seen(&self, message_id: &str, recipient: &str) -> Result<()> {
        if !self.dry_run {
            self.ledger.mark_seen(message_id, recipient)?;
        }
        Ok(())
    }

    fn spinner(&self, address: &str) -> Option<ProgressBar> {
        let multi = self.progress.as_ref()?;
        let spinner = multi.add(ProgressBar::new_spinner());
        if let Ok(style) = ProgressStyle::default_spinner().template("{spinner:.green} [{elapsed:>6}] {msg}") {
            spinner.set_style(style.tick_chars("⠁⠂⠄⡀⢀⠠⠐⠈ "));
        }
        spinner.set_message(format!("{}: fetching mail", address));
        spinner.enable_steady_tick(Duration::from_millis(100));
        Some(spinner)
    }
}

fn executed(message_id: &str, unsubscribe: &Unsubscribe) -> ExecutedAction {
    ExecutedAction {
        message_id: message_id.to_string(),
        list_id: unsubscribe.list_id.clone(),
        mailto: unsubscribe.action.recipient.clone(),
        subject: unsubscribe.action.subject.clone(),
    }
}

fn finish(spinner: Option<ProgressBar>, address: &str, report: &InboxReport) {
    let summary = format!(
        "{}: {} scanned, {} unsubscribed",
        address, report.scanned, report.unsubscribed
    );
    match spinner {
        Some(spinner) => spinner.finish_with_message(summary),
        None => debug!("{}", summary),
    }
}
