mod console;

pub use console::{Console, StdConsole};

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use chrono::{DateTime, FixedOffset};
use thiserror::Error;
use tokio::task::JoinError;
use tracing::{debug, info, warn};

use crate::mail::{self, MailClient, MessageQuery, MessageStub, SortOrder, MAX_CONCURRENT_OPERATIONS};
use crate::output::lines;

pub const QUIT_KEYWORD: &str = "QUIT";
pub const QUIT_ACK: &str = "User requested quit. Finishing current batch...";
pub const COMPLETE_MESSAGE: &str = "No more old emails found. Purge complete!";
pub const DEFAULT_BATCH_SIZE: usize = 50;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeRequest {
    pub folder_id: String,
    pub batch_size: usize,
    pub cutoff: DateTime<FixedOffset>,
    pub dry_run: bool,
}

impl PurgeRequest {
    /// The lines printed before a run starts. `before_label` is the cutoff as
    /// the user typed it.
    pub fn banner(&self, before_label: &str) -> Vec<String> {
        let mode = if self.dry_run { "DRY-RUN: " } else { "" };
        vec![
            format!(
                "{mode}Purging emails from folder '{}' before {before_label}",
                self.folder_id
            ),
            format!("Batch size: {}", self.batch_size),
            format!(
                "Type '{QUIT_KEYWORD}' (case-insensitive) and press Enter to finish current batch and exit"
            ),
            "-".repeat(60),
        ]
    }

    fn query(&self, skip: usize) -> MessageQuery {
        MessageQuery {
            received_before: Some(self.cutoff),
            received_on_or_after: None,
            order: SortOrder::Ascending,
            top: self.batch_size,
            skip,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunTally {
    pub iteration: u64,
    pub total_deleted: u64,
    pub failed: u64,
}

impl Default for RunTally {
    fn default() -> Self {
        Self {
            iteration: 1,
            total_deleted: 0,
            failed: 0,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PurgeSummary {
    pub folder_id: String,
    pub cutoff: DateTime<FixedOffset>,
    pub dry_run: bool,
    pub iterations: u64,
    pub total: u64,
    pub failed_ids: Vec<String>,
}

#[derive(Debug, Error)]
pub enum PurgeError {
    #[error("failed to fetch messages: {0:#}")]
    Fetch(anyhow::Error),
    #[error("purge task did not complete: {0}")]
    Worker(#[from] JoinError),
}

/// One-way stop flag shared by the purge loop and the input listener.
#[derive(Debug, Clone, Default)]
pub struct CancellationSignal(Arc<AtomicBool>);

impl CancellationSignal {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set(&self) {
        self.0.store(true, Ordering::Release);
    }

    pub fn is_set(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

#[derive(Clone)]
pub struct PurgeCoordinator {
    client: Arc<dyn MailClient>,
    console: Arc<dyn Console>,
}

impl PurgeCoordinator {
    pub fn new(client: Arc<dyn MailClient>, console: Arc<dyn Console>) -> Self {
        Self { client, console }
    }

    /// Runs the purge loop on a background task while a listener thread
    /// watches the console for the quit keyword. Returns once the loop has
    /// finished, whatever the listener is doing.
    pub async fn run(&self, request: PurgeRequest) -> Result<PurgeSummary, PurgeError> {
        let signal = CancellationSignal::new();
        spawn_quit_listener(Arc::clone(&self.console), signal.clone());

        let worker = {
            let coordinator = self.clone();
            let signal = signal.clone();
            tokio::spawn(async move { coordinator.drive(&request, &signal).await })
        };
        let outcome = worker.await?;

        // Lets a listener that is still waiting on input exit at its next line.
        signal.set();
        outcome
    }

    /// The purge loop itself, on the caller's task. The signal is only
    /// checked between batches.
    pub async fn drive(
        &self,
        request: &PurgeRequest,
        signal: &CancellationSignal,
    ) -> Result<PurgeSummary, PurgeError> {
        info!(
            folder = %request.folder_id,
            batch_size = request.batch_size,
            dry_run = request.dry_run,
            "starting purge"
        );

        let mut tally = RunTally::default();
        let mut failed_ids = Vec::new();
        // Ids whose delete failed. They may still sit in the folder and are
        // never reported twice.
        let mut failed_set: HashSet<String> = HashSet::new();
        // Position of the first message this run has not looked at yet.
        let mut skip = 0usize;
        // Set after restarting from the head; cleared once that pass finds
        // something new.
        let mut verifying = false;

        while !signal.is_set() {
            debug!(iteration = tally.iteration, skip, "fetching purge batch");
            let page = self
                .client
                .list_messages(&request.folder_id, &request.query(skip))
                .await
                .map_err(PurgeError::Fetch)?;

            if page.messages.is_empty() {
                // A failed delete may still have removed its message, which
                // leaves the cursor past unseen ones. Walk once more from
                // the head before calling it done.
                if skip > 0 && !request.dry_run && !verifying {
                    debug!(skip, "end of folder reached with a cursor; rescanning from the head");
                    skip = 0;
                    verifying = true;
                    continue;
                }
                self.console.write_line(COMPLETE_MESSAGE);
                signal.set();
                break;
            }

            let fetched = page.messages.len();
            let batch: Vec<MessageStub> = page
                .messages
                .into_iter()
                .filter_map(MessageStub::from_summary)
                .filter(|stub| !failed_set.contains(&stub.id))
                .collect();
            if batch.is_empty() {
                debug!(fetched, "batch held no deletable messages");
                skip += fetched;
                continue;
            }
            verifying = false;

            self.report(request, &mut tally, &batch);

            // Everything fetched stays in the folder except what was
            // actually deleted.
            if request.dry_run {
                skip += fetched;
            } else {
                let failures = self.delete_all(&batch).await;
                skip += fetched - (batch.len() - failures.len());
                tally.failed += failures.len() as u64;
                failed_set.extend(failures.iter().cloned());
                failed_ids.extend(failures);
            }

            tally.iteration += 1;
        }

        self.console.write_line(&lines::result_line(
            request.dry_run,
            tally.total_deleted,
            &request.folder_id,
            &request.cutoff,
        ));
        info!(
            total = tally.total_deleted,
            failed = tally.failed,
            iterations = tally.iteration - 1,
            "purge finished"
        );

        Ok(PurgeSummary {
            folder_id: request.folder_id.clone(),
            cutoff: request.cutoff,
            dry_run: request.dry_run,
            iterations: tally.iteration - 1,
            total: tally.total_deleted,
            failed_ids,
        })
    }

    fn report(&self, request: &PurgeRequest, tally: &mut RunTally, batch: &[MessageStub]) {
        for stub in batch {
            self.console
                .write_line(&lines::purge_message_line(request.dry_run, stub));
        }
        tally.total_deleted += batch.len() as u64;
        self.console.write_line(&lines::progress_line(
            tally.total_deleted,
            tally.iteration,
            batch.len(),
        ));
    }

    /// Deletes the whole batch, at most four at a time, and returns the ids
    /// that failed.
    async fn delete_all(&self, batch: &[MessageStub]) -> Vec<String> {
        let ids: Vec<String> = batch.iter().map(|stub| stub.id.clone()).collect();
        let outcomes = mail::fan_out(ids, MAX_CONCURRENT_OPERATIONS, |id| {
            let client = Arc::clone(&self.client);
            async move { client.delete_message(&id).await }
        })
        .await;

        let mut failed = Vec::new();
        for outcome in outcomes {
            if let Err(err) = outcome.result {
                warn!(message_id = %outcome.message_id, error = %format!("{err:#}"), "delete failed");
                self.console
                    .write_line(&lines::delete_failed_line(&outcome.message_id, &err));
                failed.push(outcome.message_id);
            }
        }
        failed
    }
}

pub fn is_quit(line: &str) -> bool {
    line.trim().eq_ignore_ascii_case(QUIT_KEYWORD)
}

/// Reads console lines until the quit keyword, end of input, or the signal
/// being set by someone else. Returns whether the user asked to quit.
pub fn listen_for_quit(console: &dyn Console, signal: &CancellationSignal) -> bool {
    while !signal.is_set() {
        let Some(line) = console.read_line() else {
            debug!("console input closed; purge continues");
            return false;
        };
        if signal.is_set() {
            break;
        }
        if is_quit(&line) {
            signal.set();
            console.write_line(QUIT_ACK);
            info!("quit requested");
            return true;
        }
    }
    false
}

/// The listener blocks on input, so it lives on its own OS thread and is
/// never joined.
fn spawn_quit_listener(console: Arc<dyn Console>, signal: CancellationSignal) {
    let spawned = thread::Builder::new()
        .name("purge-quit-listener".to_string())
        .spawn(move || {
            listen_for_quit(console.as_ref(), &signal);
        });
    if let Err(err) = spawned {
        warn!(error = %err, "could not start quit listener; purge cannot be interrupted");
    }
}
