//! Per-source run directories and sequencing of several crawls under one base directory.
//!
//! Layout: `<base>/<source>/<stamp>/` with `image_info.json` next to the assets. The stamp is
//! the run start time (`%Y%m%d_%H%M%S`) unless a label is given, in which case the labelled
//! directory is reused and its ledger keeps deduplicating across runs.

use crate::candidate::CandidateSource;
use crate::controls::CrawlControls;
use crate::crawler::{CrawlContext, CrawlError, Crawler, RunOutcome, RunSummary};
use crate::fetch::Fetcher;
use chrono::Local;
use reqwest::Client;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Timestamp format used for fresh run directories.
pub const RUN_STAMP_FORMAT: &str = "%Y%m%d_%H%M%S";

/// One source to crawl with its own controls.
pub struct PlannedRun {
    /// Source to drain.
    pub source: Box<dyn CandidateSource>,
    /// Controls for this source (time budget, workers, delay).
    pub controls: CrawlControls,
}

/// Outcome of one planned run.
#[derive(Debug, Clone)]
pub struct SourceRun {
    /// Directory that received the assets and the ledger.
    pub output_dir: PathBuf,
    /// Counts and outcome.
    pub summary: RunSummary,
}

/// A fatal error in one source, with the runs that finished before it.
#[derive(Debug, Error)]
#[error("source failed after {} completed run(s)", .completed.len())]
pub struct RunAllError {
    /// Runs that ended before the failing one.
    pub completed: Vec<SourceRun>,
    /// Error of the failing run; may carry its partial summary.
    #[source]
    pub source: CrawlError,
}

/// Places each source's run in its own directory and runs sources in order.
#[derive(Debug, Clone)]
pub struct RunManager {
    base_dir: PathBuf,
    stamp: String,
    client: Option<Client>,
}

impl RunManager {
    /// Uses the current local time as the run stamp.
    pub fn new(base_dir: impl Into<PathBuf>) -> Self {
        let stamp = Local::now().format(RUN_STAMP_FORMAT).to_string();
        Self::with_stamp(base_dir, stamp)
    }

    /// Uses a fixed stamp; a stable label makes later runs resume the same ledger.
    pub fn with_stamp(base_dir: impl Into<PathBuf>, stamp: impl Into<String>) -> Self {
        Self {
            base_dir: base_dir.into(),
            stamp: stamp.into(),
            client: None,
        }
    }

    /// Fetches every source's payloads with `client` instead of a client per run.
    pub fn with_client(mut self, client: Client) -> Self {
        self.client = Some(client);
        self
    }

    /// Same as [`RunManager::new`] unless `label` is set and non-blank.
    pub fn with_label(base_dir: impl Into<PathBuf>, label: Option<&str>) -> Self {
        match label.map(str::trim).filter(|label| !label.is_empty()) {
            Some(label) => Self::with_stamp(base_dir, label),
            None => Self::new(base_dir),
        }
    }

    /// Root directory.
    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    /// Stamp shared by every source of this manager.
    pub fn stamp(&self) -> &str {
        &self.stamp
    }

    /// `<base>/<source>/<stamp>`; not created.
    pub fn run_dir(&self, source: &str) -> PathBuf {
        self.base_dir.join(source).join(&self.stamp)
    }

    /// Creates the run directory of `source` and loads its ledger.
    pub fn prepare(&self, source: &str) -> Result<CrawlContext, CrawlError> {
        CrawlContext::open(self.run_dir(source))
    }

    /// Crawls one source into its run directory.
    pub async fn run_source(
        &self,
        source: &mut dyn CandidateSource,
        controls: CrawlControls,
        cancel: CancellationToken,
    ) -> Result<SourceRun, CrawlError> {
        let context = self.prepare(source.name())?;
        let crawler = match &self.client {
            Some(client) => Crawler::with_fetcher(controls, Fetcher::with_client(client.clone())),
            None => Crawler::new(controls)?,
        };
        let summary = crawler.run(source, &context, cancel).await?;
        Ok(SourceRun {
            output_dir: context.output_dir().to_path_buf(),
            summary,
        })
    }

    /// Crawls each planned source in order.
    ///
    /// Stops at the first fatal error, or after a run that ended because `cancel` fired.
    /// A fatal error keeps the runs completed before it.
    pub async fn run_all(
        &self,
        plans: Vec<PlannedRun>,
        cancel: CancellationToken,
    ) -> Result<Vec<SourceRun>, RunAllError> {
        let mut runs = Vec::with_capacity(plans.len());
        for PlannedRun {
            mut source,
            controls,
        } in plans
        {
            if cancel.is_cancelled() {
                tracing::info!(source = source.name(), "cancelled; not starting source");
                break;
            }
            let run = match self
                .run_source(source.as_mut(), controls, cancel.clone())
                .await
            {
                Ok(run) => run,
                Err(source) => {
                    return Err(RunAllError {
                        completed: runs,
                        source,
                    })
                }
            };
            let aborted = run.summary.outcome == RunOutcome::Aborted;
            runs.push(run);
            if aborted && cancel.is_cancelled() {
                break;
            }
        }
        Ok(runs)
    }
}
