use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{mpsc, Arc, Mutex};
use std::time::Duration;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, FixedOffset};

use outlook::config::DEFAULT_TIMEZONE;
use outlook::dates;
use outlook::mail::{MailClient, MessagePage, MessageQuery, MessageSummary, SortOrder};
use outlook::purge::{
    CancellationSignal, Console, PurgeCoordinator, PurgeError, PurgeRequest, COMPLETE_MESSAGE,
    QUIT_ACK,
};

fn at(raw: &str) -> DateTime<FixedOffset> {
    DateTime::parse_from_rfc3339(raw).expect("valid timestamp")
}

fn message(id: &str, subject: &str, received: &str) -> MessageSummary {
    MessageSummary {
        id: Some(id.to_string()),
        subject: Some(subject.to_string()),
        received_at: Some(at(received)),
        ..MessageSummary::default()
    }
}

/// The three old messages from the basic purge walkthrough, stored out of
/// order, plus one message newer than the cutoff.
fn scenario_messages() -> Vec<MessageSummary> {
    vec![
        message("m3", "Third", "2023-12-20T00:00:00Z"),
        message("new", "Too recent", "2024-02-01T00:00:00Z"),
        message("m1", "First", "2023-12-01T00:00:00Z"),
        message("m2", "Second", "2023-12-15T00:00:00Z"),
    ]
}

fn request(batch_size: usize, dry_run: bool) -> PurgeRequest {
    PurgeRequest {
        folder_id: "inbox".to_string(),
        batch_size,
        cutoff: dates::parse_cutoff("2024-01-01", DEFAULT_TIMEZONE).expect("valid cutoff"),
        dry_run,
    }
}

/// In-memory folder that honours the query the coordinator sends.
#[derive(Default)]
struct FakeMailbox {
    messages: Mutex<Vec<MessageSummary>>,
    fetches: AtomicUsize,
    queries: Mutex<Vec<MessageQuery>>,
    deleted: Mutex<Vec<String>>,
    delete_calls: AtomicUsize,
    failing_ids: HashSet<String>,
    /// Deletes that remove the message but still report an error, like a
    /// gateway timeout on a request the server completed.
    vanishing_failures: HashSet<String>,
    fail_fetch_number: Option<usize>,
    delete_delay: Duration,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    cancel_on_first_delete: Mutex<Option<CancellationSignal>>,
    quit_on_first_delete: Mutex<Option<(mpsc::Sender<String>, Arc<RecordingConsole>)>>,
}

impl FakeMailbox {
    fn with_messages(messages: Vec<MessageSummary>) -> Self {
        Self {
            messages: Mutex::new(messages),
            ..Self::default()
        }
    }

    fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    fn deleted(&self) -> Vec<String> {
        let mut deleted = self.deleted.lock().expect("deleted lock").clone();
        deleted.sort();
        deleted
    }

    fn remaining_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .messages
            .lock()
            .expect("messages lock")
            .iter()
            .filter_map(|message| message.id.clone())
            .collect();
        ids.sort();
        ids
    }
}

#[async_trait]
impl MailClient for FakeMailbox {
    async fn list_messages(&self, folder_id: &str, query: &MessageQuery) -> Result<MessagePage> {
        let fetch_number = self.fetches.fetch_add(1, Ordering::SeqCst) + 1;
        self.queries.lock().expect("queries lock").push(query.clone());
        if self.fail_fetch_number == Some(fetch_number) {
            return Err(anyhow!("graph request failed: status=503"));
        }
        assert_eq!(folder_id, "inbox");

        let mut matching: Vec<MessageSummary> = self
            .messages
            .lock()
            .expect("messages lock")
            .iter()
            .filter(|message| query.matches(message.received_at.as_ref()))
            .cloned()
            .collect();
        matching.sort_by_key(|message| message.received_at);
        if query.order == SortOrder::Descending {
            matching.reverse();
        }

        let available = matching.len().saturating_sub(query.skip);
        let messages: Vec<MessageSummary> = matching
            .into_iter()
            .skip(query.skip)
            .take(query.top)
            .collect();
        Ok(MessagePage {
            more_available: available > messages.len(),
            messages,
        })
    }

    async fn delete_message(&self, message_id: &str) -> Result<()> {
        self.delete_calls.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak_in_flight.fetch_max(now, Ordering::SeqCst);

        let cancel = self.cancel_on_first_delete.lock().expect("cancel lock").take();
        if let Some(signal) = cancel {
            signal.set();
        }

        let quit = self.quit_on_first_delete.lock().expect("quit lock").take();
        if let Some((input, console)) = quit {
            input.send("quit".to_string()).expect("send quit");
            console.wait_for(QUIT_ACK).await;
        }

        if !self.delete_delay.is_zero() {
            tokio::time::sleep(self.delete_delay).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        if self.failing_ids.contains(message_id) {
            return Err(anyhow!("status=403 | access denied"));
        }
        self.messages
            .lock()
            .expect("messages lock")
            .retain(|message| message.id.as_deref() != Some(message_id));
        if self.vanishing_failures.contains(message_id) {
            return Err(anyhow!("status=504 gateway timeout"));
        }
        self.deleted
            .lock()
            .expect("deleted lock")
            .push(message_id.to_string());
        Ok(())
    }
}

/// Records output; input comes from a channel so tests decide when (and
/// whether) the user types something. Dropping the sender is end of input.
struct RecordingConsole {
    output: Mutex<Vec<String>>,
    input: Mutex<mpsc::Receiver<String>>,
}

impl RecordingConsole {
    fn new() -> (Arc<Self>, mpsc::Sender<String>) {
        let (sender, receiver) = mpsc::channel();
        let console = Arc::new(Self {
            output: Mutex::new(Vec::new()),
            input: Mutex::new(receiver),
        });
        (console, sender)
    }

    fn lines(&self) -> Vec<String> {
        self.output.lock().expect("output lock").clone()
    }

    async fn wait_for(&self, line: &str) {
        for _ in 0..500 {
            if self.lines().iter().any(|seen| seen == line) {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("console never printed {line:?}");
    }
}

impl Console for RecordingConsole {
    fn write_line(&self, line: &str) {
        self.output.lock().expect("output lock").push(line.to_string());
    }

    fn read_line(&self) -> Option<String> {
        self.input.lock().expect("input lock").recv().ok()
    }
}

fn coordinator(mailbox: &Arc<FakeMailbox>, console: &Arc<RecordingConsole>) -> PurgeCoordinator {
    PurgeCoordinator::new(mailbox.clone(), console.clone())
}

const SCENARIO_A_OUTPUT: &[&str] = &[
    "DELETING|m1|First|2023-12-01T00:00:00Z",
    "DELETING|m2|Second|2023-12-15T00:00:00Z",
    "PROGRESS|total=2|iteration=1|batch=2",
    "DELETING|m3|Third|2023-12-20T00:00:00Z",
    "PROGRESS|total=3|iteration=2|batch=1",
    COMPLETE_MESSAGE,
    "RESULT|DELETED|total=3|folder_id=inbox|before=2024-01-01T00:00:00-05:00",
];

#[tokio::test]
async fn deletes_old_messages_in_ascending_batches_until_empty() {
    let mailbox = Arc::new(FakeMailbox::with_messages(scenario_messages()));
    let (console, _input) = RecordingConsole::new();
    let signal = CancellationSignal::new();

    let summary = coordinator(&mailbox, &console)
        .drive(&request(2, false), &signal)
        .await
        .expect("purge succeeds");

    assert_eq!(console.lines(), SCENARIO_A_OUTPUT);
    assert_eq!(summary.total, 3);
    assert_eq!(summary.iterations, 2);
    assert!(summary.failed_ids.is_empty());
    assert_eq!(mailbox.fetches(), 3);
    assert_eq!(mailbox.deleted(), vec!["m1", "m2", "m3"]);
    assert_eq!(mailbox.remaining_ids(), vec!["new"]);
    assert!(signal.is_set());

    let queries = mailbox.queries.lock().expect("queries lock");
    assert!(queries.iter().all(|query| query.order == SortOrder::Ascending
        && query.top == 2
        && query.skip == 0
        && query.received_before == Some(request(2, false).cutoff)));
}

#[tokio::test]
async fn dry_run_reports_the_same_batches_without_deleting() {
    let mailbox = Arc::new(FakeMailbox::with_messages(scenario_messages()));
    let (console, _input) = RecordingConsole::new();

    let summary = coordinator(&mailbox, &console)
        .drive(&request(2, true), &CancellationSignal::new())
        .await
        .expect("dry run succeeds");

    let expected: Vec<String> = SCENARIO_A_OUTPUT
        .iter()
        .map(|line| {
            line.replacen("DELETING|", "DRY-RUN|", 1)
                .replacen("RESULT|DELETED|", "RESULT|DRY-RUN|", 1)
        })
        .collect();
    assert_eq!(console.lines(), expected);
    assert_eq!(
        console.lines().last().map(String::as_str),
        Some("RESULT|DRY-RUN|total=3|folder_id=inbox|before=2024-01-01T00:00:00-05:00")
    );
    assert!(summary.dry_run);
    assert_eq!(summary.total, 3);
    assert_eq!(mailbox.delete_calls.load(Ordering::SeqCst), 0);
    assert_eq!(mailbox.remaining_ids(), vec!["m1", "m2", "m3", "new"]);

    let skips: Vec<usize> = mailbox
        .queries
        .lock()
        .expect("queries lock")
        .iter()
        .map(|query| query.skip)
        .collect();
    assert_eq!(skips, vec![0, 2, 3]);
}

#[tokio::test]
async fn running_total_is_the_sum_of_batch_sizes() {
    let messages = (1..=5)
        .map(|day| {
            message(
                &format!("m{day}"),
                &format!("Day {day}"),
                &format!("2023-11-0{day}T12:00:00Z"),
            )
        })
        .collect();
    let mailbox = Arc::new(FakeMailbox::with_messages(messages));
    let (console, _input) = RecordingConsole::new();

    let summary = coordinator(&mailbox, &console)
        .drive(&request(2, false), &CancellationSignal::new())
        .await
        .expect("purge succeeds");

    let progress: Vec<String> = console
        .lines()
        .into_iter()
        .filter(|line| line.starts_with("PROGRESS|"))
        .collect();
    assert_eq!(
        progress,
        vec![
            "PROGRESS|total=2|iteration=1|batch=2",
            "PROGRESS|total=4|iteration=2|batch=2",
            "PROGRESS|total=5|iteration=3|batch=1",
        ]
    );
    assert_eq!(summary.total, 5);
}

#[tokio::test]
async fn empty_folder_completes_after_a_single_fetch() {
    let mailbox = Arc::new(FakeMailbox::default());
    let (console, _input) = RecordingConsole::new();

    let summary = coordinator(&mailbox, &console)
        .drive(&request(50, false), &CancellationSignal::new())
        .await
        .expect("purge succeeds");

    assert_eq!(
        console.lines(),
        vec![
            COMPLETE_MESSAGE,
            "RESULT|DELETED|total=0|folder_id=inbox|before=2024-01-01T00:00:00-05:00",
        ]
    );
    assert_eq!(mailbox.fetches(), 1);
    assert_eq!(summary.iterations, 0);
}

#[tokio::test]
async fn cancellation_takes_effect_only_between_batches() {
    let mailbox = Arc::new(FakeMailbox::with_messages(scenario_messages()));
    let signal = CancellationSignal::new();
    *mailbox.cancel_on_first_delete.lock().expect("cancel lock") = Some(signal.clone());
    let (console, _input) = RecordingConsole::new();

    let summary = coordinator(&mailbox, &console)
        .drive(&request(2, false), &signal)
        .await
        .expect("purge succeeds");

    // The batch in flight when the signal was raised still finishes.
    assert_eq!(mailbox.deleted(), vec!["m1", "m2"]);
    assert_eq!(mailbox.fetches(), 1);
    assert_eq!(summary.total, 2);
    let lines = console.lines();
    assert!(!lines.iter().any(|line| line.contains("iteration=2")));
    assert!(!lines.iter().any(|line| line == COMPLETE_MESSAGE));
    assert_eq!(
        lines.last().map(String::as_str),
        Some("RESULT|DELETED|total=2|folder_id=inbox|before=2024-01-01T00:00:00-05:00")
    );
}

#[tokio::test]
async fn signal_set_before_start_skips_fetching() {
    let mailbox = Arc::new(FakeMailbox::with_messages(scenario_messages()));
    let (console, _input) = RecordingConsole::new();
    let signal = CancellationSignal::new();
    signal.set();

    let summary = coordinator(&mailbox, &console)
        .drive(&request(2, false), &signal)
        .await
        .expect("purge succeeds");

    assert_eq!(mailbox.fetches(), 0);
    assert_eq!(summary.total, 0);
    assert_eq!(console.lines().len(), 1);
}

#[tokio::test]
async fn at_most_four_deletes_are_in_flight() {
    let messages = (10..30)
        .map(|n| {
            message(
                &format!("m{n}"),
                "Bulk",
                &format!("2023-10-{n}T08:00:00Z"),
            )
        })
        .collect();
    let mailbox = Arc::new(FakeMailbox {
        delete_delay: Duration::from_millis(20),
        ..FakeMailbox::with_messages(messages)
    });
    let (console, _input) = RecordingConsole::new();

    let summary = coordinator(&mailbox, &console)
        .drive(&request(10, false), &CancellationSignal::new())
        .await
        .expect("purge succeeds");

    assert_eq!(summary.total, 20);
    assert_eq!(mailbox.deleted().len(), 20);
    assert_eq!(mailbox.peak_in_flight.load(Ordering::SeqCst), 4);
}

#[tokio::test]
async fn failed_deletes_are_reported_and_skipped() {
    let mailbox = Arc::new(FakeMailbox {
        failing_ids: HashSet::from(["m2".to_string()]),
        ..FakeMailbox::with_messages(scenario_messages())
    });
    let (console, _input) = RecordingConsole::new();

    let summary = coordinator(&mailbox, &console)
        .drive(&request(2, false), &CancellationSignal::new())
        .await
        .expect("purge keeps going after a failed delete");

    assert_eq!(summary.failed_ids, vec!["m2"]);
    assert_eq!(summary.total, 3);
    assert_eq!(mailbox.deleted(), vec!["m1", "m3"]);
    assert_eq!(mailbox.remaining_ids(), vec!["m2", "new"]);
    // Two batches, the empty end, one pass from the head past m2, then empty.
    assert_eq!(mailbox.fetches(), 5);
    let lines = console.lines();
    assert_eq!(lines.iter().filter(|line| line.starts_with("DELETING|m2|")).count(), 1);
    assert!(lines.contains(&"DELETE-FAILED|m2|status=403 \\| access denied".to_string()));
    assert!(lines.contains(&"DELETING|m3|Third|2023-12-20T00:00:00Z".to_string()));
    assert_eq!(
        lines.last().map(String::as_str),
        Some("RESULT|DELETED|total=3|folder_id=inbox|before=2024-01-01T00:00:00-05:00")
    );
}

#[tokio::test]
async fn failed_delete_that_removed_its_message_does_not_strand_later_ones() {
    let mailbox = Arc::new(FakeMailbox {
        vanishing_failures: HashSet::from(["m1".to_string()]),
        ..FakeMailbox::with_messages(scenario_messages())
    });
    let (console, _input) = RecordingConsole::new();

    let summary = coordinator(&mailbox, &console)
        .drive(&request(1, false), &CancellationSignal::new())
        .await
        .expect("purge keeps going after a failed delete");

    assert_eq!(mailbox.remaining_ids(), vec!["new"]);
    assert_eq!(mailbox.deleted(), vec!["m2", "m3"]);
    assert_eq!(summary.failed_ids, vec!["m1"]);
    assert_eq!(summary.total, 3);

    let lines = console.lines();
    assert!(lines.contains(&"DELETING|m2|Second|2023-12-15T00:00:00Z".to_string()));
    assert_eq!(lines.iter().filter(|line| *line == COMPLETE_MESSAGE).count(), 1);
    assert_eq!(
        lines[lines.len() - 2..],
        [
            COMPLETE_MESSAGE.to_string(),
            "RESULT|DELETED|total=3|folder_id=inbox|before=2024-01-01T00:00:00-05:00".to_string(),
        ]
    );
}

#[tokio::test]
async fn fetch_failure_aborts_without_a_result_line() {
    let mailbox = Arc::new(FakeMailbox {
        fail_fetch_number: Some(2),
        ..FakeMailbox::with_messages(scenario_messages())
    });
    let (console, _input) = RecordingConsole::new();

    let err = coordinator(&mailbox, &console)
        .drive(&request(2, false), &CancellationSignal::new())
        .await
        .expect_err("second fetch fails");

    assert!(matches!(err, PurgeError::Fetch(_)));
    assert!(err.to_string().contains("status=503"));
    let lines = console.lines();
    assert!(lines.contains(&"PROGRESS|total=2|iteration=1|batch=2".to_string()));
    assert!(!lines.iter().any(|line| line.starts_with("RESULT|")));
    assert_eq!(mailbox.fetches(), 2);
}

#[tokio::test]
async fn messages_without_ids_are_never_reported() {
    let mut messages = scenario_messages();
    messages.push(MessageSummary {
        id: None,
        subject: Some("Ghost".to_string()),
        received_at: Some(at("2023-11-01T00:00:00Z")),
        ..MessageSummary::default()
    });
    let mailbox = Arc::new(FakeMailbox::with_messages(messages));
    let (console, _input) = RecordingConsole::new();

    let summary = coordinator(&mailbox, &console)
        .drive(&request(2, false), &CancellationSignal::new())
        .await
        .expect("purge succeeds");

    assert_eq!(summary.total, 3);
    assert!(!console.lines().iter().any(|line| line.contains("Ghost")));
    assert_eq!(mailbox.deleted(), vec!["m1", "m2", "m3"]);
}

#[tokio::test]
async fn run_stops_after_the_batch_during_which_quit_was_typed() {
    let mailbox = Arc::new(FakeMailbox::with_messages(scenario_messages()));
    let (console, input) = RecordingConsole::new();
    *mailbox.quit_on_first_delete.lock().expect("quit lock") =
        Some((input, console.clone()));

    let summary = coordinator(&mailbox, &console)
        .run(request(2, false))
        .await
        .expect("purge succeeds");

    assert_eq!(summary.total, 2);
    assert_eq!(mailbox.deleted(), vec!["m1", "m2"]);
    assert_eq!(mailbox.fetches(), 1);

    let lines = console.lines();
    assert!(lines.iter().any(|line| line == QUIT_ACK));
    assert!(!lines.iter().any(|line| line.contains("iteration=2")));
    assert_eq!(
        lines.last().map(String::as_str),
        Some("RESULT|DELETED|total=2|folder_id=inbox|before=2024-01-01T00:00:00-05:00")
    );
}

#[tokio::test]
async fn run_finishes_when_input_closes_without_quit() {
    let mailbox = Arc::new(FakeMailbox::with_messages(scenario_messages()));
    let (console, input) = RecordingConsole::new();
    input.send("not now".to_string()).expect("send line");
    drop(input);

    let summary = coordinator(&mailbox, &console)
        .run(request(2, false))
        .await
        .expect("purge succeeds");

    assert_eq!(summary.total, 3);
    assert_eq!(console.lines(), SCENARIO_A_OUTPUT);
}

#[tokio::test]
async fn run_returns_while_the_listener_is_still_waiting_for_input() {
    let mailbox = Arc::new(FakeMailbox::with_messages(scenario_messages()));
    let (console, _input) = RecordingConsole::new();

    let summary = tokio::time::timeout(
        Duration::from_secs(5),
        coordinator(&mailbox, &console).run(request(2, true)),
    )
    .await
    .expect("run does not wait for the listener")
    .expect("dry run succeeds");

    assert_eq!(summary.total, 3);
    assert!(!console.lines().iter().any(|line| line == QUIT_ACK));
}
