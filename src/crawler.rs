//! Crawl orchestrator: pulls candidates from a source, makes the dedup decision, dispatches
//! fetches to a bounded worker pool and records successes in the ledger.
//!
//! Admission is atomic per identifier: the ledger lookup and the in-flight claim happen under
//! one lock, so two workers never fetch the same item. Ledger appends go through the same lock,
//! which makes the ledger single-writer. Cancellation and time-budget expiry stop admission;
//! queued items that no worker has started are released unfetched, in-flight fetches drain.

use crate::candidate::{deadline_passed, CandidateItem, CandidateSource, SourcePoll};
use crate::controls::CrawlControls;
use crate::fetch::{FetchError, Fetcher};
use crate::ledger::{Ledger, LedgerError, LedgerRecord, LEDGER_FILE_NAME};
use futures_util::future::join_all;
use std::collections::HashSet;
use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::sync::{mpsc, Mutex};
use tokio::time::sleep;
use tokio_util::sync::CancellationToken;

/// Errors that end a run. Per-item failures never surface here.
#[derive(Debug, Error)]
pub enum CrawlError {
    /// The ledger could not be loaded (corruption, unreadable file).
    #[error(transparent)]
    Ledger(#[from] LedgerError),
    /// Storage kept failing for consecutive items.
    #[error("aborting after {consecutive} consecutive storage failures (last: {last})")]
    SustainedStorageFailure {
        /// Failures in a row.
        consecutive: usize,
        /// Message of the most recent failure.
        last: String,
        /// Counts of the run up to the abort.
        summary: Box<RunSummary>,
    },
    /// The output directory could not be created.
    #[error("cannot prepare output directory {path:?}: {source}")]
    OutputDir {
        /// Directory path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// The HTTP client could not be built.
    #[error("failed to build http client: {0}")]
    Client(#[from] reqwest::Error),
}

impl CrawlError {
    /// Counts gathered before the run was aborted, when the run got that far.
    pub fn partial_summary(&self) -> Option<&RunSummary> {
        match self {
            Self::SustainedStorageFailure { summary, .. } => Some(&**summary),
            _ => None,
        }
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    /// The source reported exhaustion.
    Completed,
    /// The time budget elapsed before the source was exhausted.
    TimeExpired,
    /// Stopped by cancellation or a source failure.
    Aborted,
}

impl fmt::Display for RunOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self {
            Self::Completed => "completed",
            Self::TimeExpired => "time expired",
            Self::Aborted => "aborted",
        };
        f.write_str(label)
    }
}

/// Result of the atomic admission check.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// The caller now owns the identifier and must commit or release it.
    Claimed,
    /// A record already exists in the ledger.
    Captured,
    /// Another worker holds the claim.
    InFlight,
}

struct GateState {
    ledger: Ledger,
    in_flight: HashSet<String>,
}

/// The ledger plus the in-flight claims of the workers feeding it.
pub struct LedgerGate {
    state: Mutex<GateState>,
}

impl LedgerGate {
    /// Wraps a loaded ledger.
    pub fn new(ledger: Ledger) -> Self {
        Self {
            state: Mutex::new(GateState {
                ledger,
                in_flight: HashSet::new(),
            }),
        }
    }

    /// Checks the ledger and the in-flight set and claims `identifier` in one step.
    pub async fn admit(&self, identifier: &str) -> Admission {
        let mut state = self.state.lock().await;
        if state.ledger.contains(identifier) {
            Admission::Captured
        } else if !state.in_flight.insert(identifier.to_string()) {
            Admission::InFlight
        } else {
            Admission::Claimed
        }
    }

    /// Appends `record` and drops its claim whether or not the append succeeds.
    pub async fn commit(&self, record: LedgerRecord) -> Result<(), LedgerError> {
        let mut state = self.state.lock().await;
        let identifier = record.identifier.clone();
        let result = state.ledger.append(record);
        state.in_flight.remove(&identifier);
        result
    }

    /// Drops a claim without recording anything.
    pub async fn release(&self, identifier: &str) {
        self.state.lock().await.in_flight.remove(identifier);
    }

    /// True iff the ledger holds `identifier`.
    pub async fn contains(&self, identifier: &str) -> bool {
        self.state.lock().await.ledger.contains(identifier)
    }

    /// Number of persisted records.
    pub async fn len(&self) -> usize {
        self.state.lock().await.ledger.len()
    }

    /// Copy of the persisted records in capture order.
    pub async fn records(&self) -> Vec<LedgerRecord> {
        self.state.lock().await.ledger.records().to_vec()
    }
}

/// Explicit per-run context: where assets go and which ledger guards them.
#[derive(Clone)]
pub struct CrawlContext {
    gate: Arc<LedgerGate>,
    output_dir: PathBuf,
}

impl CrawlContext {
    /// Creates `output_dir` if needed and loads `<output_dir>/image_info.json`.
    pub fn open(output_dir: impl Into<PathBuf>) -> Result<Self, CrawlError> {
        let output_dir = output_dir.into();
        fs::create_dir_all(&output_dir).map_err(|source| CrawlError::OutputDir {
            path: output_dir.clone(),
            source,
        })?;
        let ledger = Ledger::open(output_dir.join(LEDGER_FILE_NAME))?;
        Ok(Self::new(ledger, output_dir))
    }

    /// Pairs an already loaded ledger with an output directory.
    pub fn new(ledger: Ledger, output_dir: impl Into<PathBuf>) -> Self {
        Self {
            gate: Arc::new(LedgerGate::new(ledger)),
            output_dir: output_dir.into(),
        }
    }

    /// Directory receiving `<identifier>.png` assets.
    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Shared ledger gate.
    pub fn gate(&self) -> &LedgerGate {
        &self.gate
    }
}

/// Counts reported at the end of a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunSummary {
    /// Source label.
    pub source: String,
    /// Terminal state.
    pub outcome: RunOutcome,
    /// Candidates received from the source.
    pub attempted: usize,
    /// Candidates skipped as already captured, in flight, or seen earlier in the run.
    pub skipped: usize,
    /// Candidates stored and recorded.
    pub fetched: usize,
    /// Candidates whose fetch or storage failed.
    pub failed: usize,
    /// Claimed candidates abandoned unfetched at the cutoff.
    pub released: usize,
    /// Failures by kind.
    pub failures: FailureBreakdown,
    /// Wall-clock duration of the run.
    pub elapsed: Duration,
}

/// Per-kind failure counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct FailureBreakdown {
    /// Transport errors and non-success statuses.
    pub http: usize,
    /// Requests that hit the timeout.
    pub timeout: usize,
    /// Payloads that were not images or failed to re-encode.
    pub decode: usize,
    /// Local write or ledger failures.
    pub storage: usize,
    /// Identifiers that cannot name an asset file.
    pub rejected: usize,
}

impl FailureBreakdown {
    /// Sum over all kinds.
    pub fn total(&self) -> usize {
        self.http + self.timeout + self.decode + self.storage + self.rejected
    }
}

impl RunSummary {
    /// Prints the summary block to stdout.
    pub fn report(&self) {
        let secs = self.elapsed.as_secs_f32();
        println!("--- crawl summary: {} ({secs:.2}s) ---", self.source);
        println!("outcome: {}", self.outcome);
        println!("attempted: {}", self.attempted);
        println!("skipped as duplicate: {}", self.skipped);
        println!("fetched: {}", self.fetched);
        println!(
            "failed: {} (http {}, timeout {}, decode {}, storage {}, rejected {})",
            self.failed,
            self.failures.http,
            self.failures.timeout,
            self.failures.decode,
            self.failures.storage,
            self.failures.rejected
        );
        if self.released > 0 {
            println!("released at cutoff: {}", self.released);
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FailureKind {
    Http,
    Timeout,
    Decode,
    Storage,
    Rejected,
}

impl FailureKind {
    fn of(err: &FetchError) -> Self {
        match err {
            FetchError::Http { .. } | FetchError::HttpStatus { .. } => Self::Http,
            FetchError::Timeout { .. } => Self::Timeout,
            FetchError::Decode { .. } | FetchError::Encode { .. } | FetchError::Join(_) => {
                Self::Decode
            }
            FetchError::Storage { .. } => Self::Storage,
            FetchError::UnsafeIdentifier { .. } => Self::Rejected,
        }
    }
}

#[derive(Default)]
struct Metrics {
    attempted: AtomicUsize,
    skipped: AtomicUsize,
    fetched: AtomicUsize,
    released: AtomicUsize,
    http_errors: AtomicUsize,
    timeouts: AtomicUsize,
    decode_errors: AtomicUsize,
    storage_errors: AtomicUsize,
    rejected: AtomicUsize,
}

impl Metrics {
    fn record_attempted(&self) {
        self.attempted.fetch_add(1, Ordering::Relaxed);
    }

    fn record_duplicate(&self) {
        self.skipped.fetch_add(1, Ordering::Relaxed);
    }

    fn record_fetched(&self) {
        self.fetched.fetch_add(1, Ordering::Relaxed);
    }

    fn record_released(&self) {
        self.released.fetch_add(1, Ordering::Relaxed);
    }

    fn record_error(&self, kind: FailureKind) {
        let counter = match kind {
            FailureKind::Http => &self.http_errors,
            FailureKind::Timeout => &self.timeouts,
            FailureKind::Decode => &self.decode_errors,
            FailureKind::Storage => &self.storage_errors,
            FailureKind::Rejected => &self.rejected,
        };
        counter.fetch_add(1, Ordering::Relaxed);
    }

    fn summary(&self, source: &str, outcome: RunOutcome, elapsed: Duration) -> RunSummary {
        let failures = FailureBreakdown {
            http: self.http_errors.load(Ordering::Relaxed),
            timeout: self.timeouts.load(Ordering::Relaxed),
            decode: self.decode_errors.load(Ordering::Relaxed),
            storage: self.storage_errors.load(Ordering::Relaxed),
            rejected: self.rejected.load(Ordering::Relaxed),
        };
        RunSummary {
            source: source.to_string(),
            outcome,
            attempted: self.attempted.load(Ordering::Relaxed),
            skipped: self.skipped.load(Ordering::Relaxed),
            fetched: self.fetched.load(Ordering::Relaxed),
            failed: failures.total(),
            released: self.released.load(Ordering::Relaxed),
            failures,
            elapsed,
        }
    }
}

struct SharedRun {
    fetcher: Fetcher,
    gate: Arc<LedgerGate>,
    output_dir: PathBuf,
    metrics: Metrics,
    stop: CancellationToken,
    deadline: Option<Instant>,
    politeness_delay: Duration,
    max_storage_failures: usize,
    storage_failures: AtomicUsize,
    // Failure count and message of the storage failure that aborted the run.
    fatal: Mutex<Option<(usize, String)>>,
}

impl SharedRun {
    fn admission_closed(&self) -> bool {
        self.stop.is_cancelled() || deadline_passed(self.deadline)
    }

    async fn note_storage_failure(&self, message: String) {
        let consecutive = self.storage_failures.fetch_add(1, Ordering::AcqRel) + 1;
        if consecutive < self.max_storage_failures {
            return;
        }
        let mut fatal = self.fatal.lock().await;
        if fatal.is_none() {
            tracing::error!(consecutive, "storage keeps failing; aborting run");
            *fatal = Some((consecutive, message));
        }
        self.stop.cancel();
    }
}

/// Drives one source against one context.
pub struct Crawler {
    controls: CrawlControls,
    fetcher: Fetcher,
}

impl Crawler {
    /// Builds a crawler with its own HTTP client.
    pub fn new(controls: CrawlControls) -> Result<Self, CrawlError> {
        let fetcher = Fetcher::new(controls.request_timeout())?;
        Ok(Self { controls, fetcher })
    }

    /// Builds a crawler around an existing fetcher.
    pub fn with_fetcher(controls: CrawlControls, fetcher: Fetcher) -> Self {
        Self { controls, fetcher }
    }

    /// Controls this crawler runs with.
    pub fn controls(&self) -> &CrawlControls {
        &self.controls
    }

    /// Runs `source` until it is exhausted, the time budget elapses or `cancel` fires.
    ///
    /// Returns `Err` only for fatal conditions; every per-item failure is logged and counted.
    pub async fn run<S>(
        &self,
        source: &mut S,
        context: &CrawlContext,
        cancel: CancellationToken,
    ) -> Result<RunSummary, CrawlError>
    where
        S: CandidateSource + ?Sized,
    {
        let start = Instant::now();
        let source_name = source.name().to_string();
        let workers = self.controls.workers();
        let shared = Arc::new(SharedRun {
            fetcher: self.fetcher.clone(),
            gate: Arc::clone(&context.gate),
            output_dir: context.output_dir.clone(),
            metrics: Metrics::default(),
            stop: cancel.child_token(),
            deadline: self.controls.time_budget().map(|budget| start + budget),
            politeness_delay: self.controls.politeness_delay(),
            max_storage_failures: self.controls.max_storage_failures(),
            storage_failures: AtomicUsize::new(0),
            fatal: Mutex::new(None),
        });
        tracing::info!(
            source = %source_name,
            output = ?context.output_dir,
            workers,
            budget = ?self.controls.time_budget(),
            "crawl started"
        );

        let (tx, rx) = mpsc::channel::<CandidateItem>(workers);
        let rx = Arc::new(Mutex::new(rx));
        let handles: Vec<_> = (0..workers)
            .map(|id| {
                let shared = Arc::clone(&shared);
                let rx = Arc::clone(&rx);
                tokio::spawn(async move { worker_loop(id, shared, rx).await })
            })
            .collect();

        let outcome = dispatch(source, &shared, tx).await;

        for joined in join_all(handles).await {
            if let Err(err) = joined {
                tracing::error!(error = %err, "crawl worker panicked");
            }
        }

        let fatal = shared.fatal.lock().await.take();
        let outcome = if fatal.is_some() {
            RunOutcome::Aborted
        } else {
            outcome
        };
        let summary = shared
            .metrics
            .summary(&source_name, outcome, start.elapsed());
        if let Some((consecutive, last)) = fatal {
            return Err(CrawlError::SustainedStorageFailure {
                consecutive,
                last,
                summary: Box::new(summary),
            });
        }

        tracing::info!(
            source = %summary.source,
            outcome = %summary.outcome,
            attempted = summary.attempted,
            skipped = summary.skipped,
            fetched = summary.fetched,
            failed = summary.failed,
            "crawl finished"
        );
        Ok(summary)
    }
}

async fn dispatch<S>(
    source: &mut S,
    shared: &SharedRun,
    tx: mpsc::Sender<CandidateItem>,
) -> RunOutcome
where
    S: CandidateSource + ?Sized,
{
    let mut seen_this_run: HashSet<String> = HashSet::new();
    'crawl: loop {
        if shared.stop.is_cancelled() {
            break RunOutcome::Aborted;
        }
        if deadline_passed(shared.deadline) {
            break RunOutcome::TimeExpired;
        }

        let poll = tokio::select! {
            biased;
            _ = shared.stop.cancelled() => break RunOutcome::Aborted,
            poll = source.next_batch(shared.deadline) => poll,
        };
        let items = match poll {
            Ok(SourcePoll::Batch(items)) => items,
            Ok(SourcePoll::Exhausted) => break RunOutcome::Completed,
            Ok(SourcePoll::BudgetSpent) => break RunOutcome::TimeExpired,
            Err(err) => {
                tracing::error!(source = source.name(), error = %err, "source failed");
                break RunOutcome::Aborted;
            }
        };

        for item in items {
            if shared.stop.is_cancelled() {
                break 'crawl RunOutcome::Aborted;
            }
            if deadline_passed(shared.deadline) {
                break 'crawl RunOutcome::TimeExpired;
            }
            shared.metrics.record_attempted();

            let identifier = item.identifier().to_string();
            if !seen_this_run.insert(identifier.clone()) {
                tracing::debug!(identifier = %identifier, "already handled in this run");
                shared.metrics.record_duplicate();
                continue;
            }
            match shared.gate.admit(&identifier).await {
                Admission::Claimed => {}
                Admission::Captured => {
                    tracing::info!(identifier = %identifier, "already captured, skipping");
                    shared.metrics.record_duplicate();
                    continue;
                }
                Admission::InFlight => {
                    tracing::debug!(identifier = %identifier, "already in flight, skipping");
                    shared.metrics.record_duplicate();
                    continue;
                }
            }

            let sent = tokio::select! {
                biased;
                _ = shared.stop.cancelled() => false,
                sent = tx.send(item) => sent.is_ok(),
            };
            if !sent {
                shared.gate.release(&identifier).await;
                shared.metrics.record_released();
                break 'crawl RunOutcome::Aborted;
            }
        }
    }
}

async fn worker_loop(
    worker: usize,
    shared: Arc<SharedRun>,
    queue: Arc<Mutex<mpsc::Receiver<CandidateItem>>>,
) {
    let mut handled_any = false;
    loop {
        let next = { queue.lock().await.recv().await };
        let Some(item) = next else {
            break;
        };

        if handled_any && !shared.politeness_delay.is_zero() && !shared.admission_closed() {
            tokio::select! {
                _ = sleep(shared.politeness_delay) => {}
                _ = shared.stop.cancelled() => {}
            }
        }
        if shared.admission_closed() {
            tracing::debug!(worker, identifier = item.identifier(), "released at cutoff");
            shared.gate.release(item.identifier()).await;
            shared.metrics.record_released();
            continue;
        }

        handled_any = true;
        capture(worker, &shared, item).await;
    }
}

async fn capture(worker: usize, shared: &SharedRun, item: CandidateItem) {
    let identifier = item.identifier().to_string();
    let asset = match shared.fetcher.fetch(&item, &shared.output_dir).await {
        Ok(asset) => asset,
        Err(err) => {
            shared.gate.release(&identifier).await;
            tracing::warn!(worker, identifier = %identifier, url = item.source_url(), error = %err, "fetch failed");
            shared.metrics.record_error(FailureKind::of(&err));
            if err.is_storage_failure() {
                shared.note_storage_failure(err.to_string()).await;
            }
            return;
        }
    };

    match shared.gate.commit(LedgerRecord::from_candidate(&item)).await {
        Ok(()) => {
            shared.storage_failures.store(0, Ordering::Release);
            shared.metrics.record_fetched();
            tracing::info!(
                worker,
                identifier = %identifier,
                path = ?asset.path,
                bytes = asset.bytes_written,
                "captured"
            );
        }
        Err(LedgerError::DuplicateIdentifier(_)) => {
            // Another writer recorded it first; the file on disk is theirs.
            tracing::debug!(worker, identifier = %identifier, "lost capture race");
            shared.metrics.record_duplicate();
        }
        Err(err) => {
            if let Err(remove_err) = fs::remove_file(&asset.path) {
                tracing::error!(path = ?asset.path, error = %remove_err, "failed to remove unrecorded asset");
            }
            tracing::warn!(worker, identifier = %identifier, error = %err, "ledger append failed");
            shared.metrics.record_error(FailureKind::Storage);
            shared.note_storage_failure(err.to_string()).await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::SourceError;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use tempfile::TempDir;
    use wiremock::matchers::method;
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct ListSource {
        batches: VecDeque<Vec<CandidateItem>>,
    }

    impl ListSource {
        fn new(batches: Vec<Vec<CandidateItem>>) -> Self {
            Self {
                batches: batches.into(),
            }
        }
    }

    #[async_trait]
    impl CandidateSource for ListSource {
        fn name(&self) -> &str {
            "list"
        }

        async fn next_batch(
            &mut self,
            _deadline: Option<Instant>,
        ) -> Result<SourcePoll, SourceError> {
            Ok(match self.batches.pop_front() {
                Some(batch) => SourcePoll::Batch(batch),
                None => SourcePoll::Exhausted,
            })
        }
    }

    struct BrokenSource;

    #[async_trait]
    impl CandidateSource for BrokenSource {
        fn name(&self) -> &str {
            "broken"
        }

        async fn next_batch(
            &mut self,
            _deadline: Option<Instant>,
        ) -> Result<SourcePoll, SourceError> {
            Err(SourceError::Driver("session lost".to_string()))
        }
    }

    fn item(id: &str) -> CandidateItem {
        // Port 9 (discard) refuses connections, so any fetch fails fast.
        CandidateItem::new(id, "", format!("http://127.0.0.1:9/{id}.png"), "1x1", None).unwrap()
    }

    fn png_fixture() -> Vec<u8> {
        let image = image::RgbImage::from_pixel(2, 2, image::Rgb([10, 120, 200]));
        let mut bytes = Vec::new();
        image
            .write_to(&mut std::io::Cursor::new(&mut bytes), image::ImageFormat::Png)
            .unwrap();
        bytes
    }

    fn served_item(server: &MockServer, id: &str) -> CandidateItem {
        CandidateItem::new(id, "", format!("{}/{id}.png", server.uri()), "2x2", None).unwrap()
    }

    fn quick_controls() -> CrawlControls {
        CrawlControls::default().with_politeness_delay(Duration::ZERO)
    }

    #[tokio::test]
    async fn gate_claims_each_identifier_once() {
        let dir = TempDir::new().unwrap();
        let gate = LedgerGate::new(Ledger::open(dir.path().join(LEDGER_FILE_NAME)).unwrap());

        assert_eq!(gate.admit("a1").await, Admission::Claimed);
        assert_eq!(gate.admit("a1").await, Admission::InFlight);
        gate.release("a1").await;
        assert_eq!(gate.admit("a1").await, Admission::Claimed);

        let record = LedgerRecord::from_candidate(&item("a1"));
        gate.commit(record).await.unwrap();
        assert_eq!(gate.admit("a1").await, Admission::Captured);
        assert!(gate.contains("a1").await);
    }

    #[tokio::test]
    async fn captured_identifiers_are_skipped_without_fetching() {
        let dir = TempDir::new().unwrap();
        let context = CrawlContext::open(dir.path()).unwrap();
        context
            .gate()
            .commit(LedgerRecord::from_candidate(&item("a1")))
            .await
            .unwrap();

        let crawler = Crawler::new(quick_controls()).unwrap();
        let mut source = ListSource::new(vec![vec![item("a1"), item("a1")]]);
        let summary = crawler
            .run(&mut source, &context, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.attempted, 2);
        assert_eq!(summary.skipped, 2);
        assert_eq!(summary.failed, 0);
        assert_eq!(context.gate().len().await, 1);
    }

    #[tokio::test]
    async fn failed_fetches_are_counted_and_left_uncaptured() {
        let dir = TempDir::new().unwrap();
        let context = CrawlContext::open(dir.path()).unwrap();
        let crawler = Crawler::new(quick_controls().with_workers(2)).unwrap();
        let mut source = ListSource::new(vec![vec![item("b1"), item("b2")], vec![item("b1")]]);

        let summary = crawler
            .run(&mut source, &context, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.attempted, 3);
        assert_eq!(summary.failed, 2);
        assert_eq!(summary.failures.http, 2);
        assert_eq!(summary.skipped, 1);
        assert_eq!(context.gate().len().await, 0);
        assert!(!context.gate().contains("b1").await);
    }

    #[tokio::test]
    async fn zero_budget_expires_before_admitting() {
        let dir = TempDir::new().unwrap();
        let context = CrawlContext::open(dir.path()).unwrap();
        let crawler =
            Crawler::new(quick_controls().with_time_budget(Some(Duration::ZERO))).unwrap();
        let mut source = ListSource::new(vec![vec![item("c1")]]);

        let summary = crawler
            .run(&mut source, &context, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.outcome, RunOutcome::TimeExpired);
        assert_eq!(summary.attempted, 0);
    }

    #[tokio::test]
    async fn cancelled_token_aborts_the_run() {
        let dir = TempDir::new().unwrap();
        let context = CrawlContext::open(dir.path()).unwrap();
        let crawler = Crawler::new(quick_controls()).unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut source = ListSource::new(vec![vec![item("d1")]]);

        let summary = crawler.run(&mut source, &context, cancel).await.unwrap();
        assert_eq!(summary.outcome, RunOutcome::Aborted);
        assert_eq!(summary.attempted, 0);
    }

    #[tokio::test]
    async fn source_failure_aborts_without_error() {
        let dir = TempDir::new().unwrap();
        let context = CrawlContext::open(dir.path()).unwrap();
        let crawler = Crawler::new(quick_controls()).unwrap();

        let summary = crawler
            .run(&mut BrokenSource, &context, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(summary.outcome, RunOutcome::Aborted);
    }

    #[tokio::test]
    async fn path_like_identifiers_fail_per_item_without_aborting() {
        let dir = TempDir::new().unwrap();
        let context = CrawlContext::open(dir.path()).unwrap();
        let crawler = Crawler::new(quick_controls()).unwrap();
        let bad: Vec<_> = ["job/1", "job/2", "job/3", "../e4", "e\\5"]
            .into_iter()
            .map(|id| CandidateItem::new(id, "", "http://127.0.0.1:9/x", "", None).unwrap())
            .collect();
        let mut source = ListSource::new(vec![bad, vec![item("ok")]]);

        let summary = crawler
            .run(&mut source, &context, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.outcome, RunOutcome::Completed);
        assert_eq!(summary.attempted, 6);
        assert_eq!(summary.failures.rejected, 5);
        assert_eq!(summary.failures.storage, 0);
        assert_eq!(summary.failed, 6);
    }

    #[tokio::test]
    async fn sustained_storage_failures_are_fatal() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(png_fixture()))
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        // A regular file where the asset directory should be.
        let blocked = dir.path().join("blocked");
        fs::write(&blocked, b"").unwrap();
        let ledger = Ledger::open(dir.path().join(LEDGER_FILE_NAME)).unwrap();
        let context = CrawlContext::new(ledger, &blocked);
        let items: Vec<_> = (0..5)
            .map(|n| served_item(&server, &format!("e{n}")))
            .collect();
        let mut source = ListSource::new(vec![items]);

        let err = Crawler::new(quick_controls())
            .unwrap()
            .run(&mut source, &context, CancellationToken::new())
            .await
            .expect_err("run aborts");

        assert!(matches!(
            err,
            CrawlError::SustainedStorageFailure { consecutive: 3, .. }
        ));
        let summary = err.partial_summary().expect("counts survive the abort");
        assert_eq!(summary.outcome, RunOutcome::Aborted);
        assert_eq!(summary.failures.storage, 3);
        assert_eq!(summary.failed, 3);
        assert_eq!(summary.fetched, 0);
        assert_eq!(context.gate().len().await, 0);
    }

    #[tokio::test]
    async fn ledger_failure_after_write_removes_the_asset() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(png_fixture()))
            .expect(1)
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        let context = CrawlContext::open(dir.path()).unwrap();
        // The ledger rewrite cannot rename over a directory.
        fs::create_dir(dir.path().join(LEDGER_FILE_NAME)).unwrap();
        let mut source = ListSource::new(vec![vec![served_item(&server, "a1")]]);

        let summary = Crawler::new(quick_controls())
            .unwrap()
            .run(&mut source, &context, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(summary.fetched, 0);
        assert_eq!(summary.failures.storage, 1);
        assert!(!dir.path().join("a1.png").exists());
        assert_eq!(context.gate().len().await, 0);
        assert!(!context.gate().contains("a1").await);
    }

    #[test]
    fn corrupted_ledger_refuses_to_open_context() {
        let dir = TempDir::new().unwrap();
        fs::write(dir.path().join(LEDGER_FILE_NAME), "[{").unwrap();
        assert!(matches!(
            CrawlContext::open(dir.path()),
            Err(CrawlError::Ledger(LedgerError::Corrupted { .. }))
        ));
    }
}
