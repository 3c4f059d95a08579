//! Candidate items and the capability interface every gallery source implements.

use async_trait::async_trait;
use std::time::Instant;
use thiserror::Error;

/// Ratio label used when a source cannot report dimensions.
pub const UNKNOWN_RATIO: &str = "unknown";

/// One discovered gallery entry awaiting the dedup decision.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandidateItem {
    identifier: String,
    description: String,
    source_url: String,
    ratio: String,
    author: Option<String>,
}

impl CandidateItem {
    /// Builds a candidate, returning `None` when the identifier is blank.
    ///
    /// The identifier is the dedup key and the asset file stem, so an empty one can never be
    /// captured.
    pub fn new(
        identifier: impl Into<String>,
        description: impl Into<String>,
        source_url: impl Into<String>,
        ratio: impl Into<String>,
        author: Option<String>,
    ) -> Option<Self> {
        let identifier = identifier.into().trim().to_string();
        if identifier.is_empty() {
            return None;
        }
        let ratio = ratio.into();
        let ratio = if ratio.trim().is_empty() {
            UNKNOWN_RATIO.to_string()
        } else {
            ratio
        };
        Some(Self {
            identifier,
            description: description.into(),
            source_url: source_url.into(),
            ratio,
            author: author.filter(|name| !name.is_empty()),
        })
    }

    /// Stable unique key within the originating source.
    pub fn identifier(&self) -> &str {
        &self.identifier
    }

    /// Free-text prompt or caption; may be empty.
    pub fn description(&self) -> &str {
        &self.description
    }

    /// Location of the binary payload.
    pub fn source_url(&self) -> &str {
        &self.source_url
    }

    /// `"WxH"`, a source-defined label, or [`UNKNOWN_RATIO`].
    pub fn ratio(&self) -> &str {
        &self.ratio
    }

    /// Author name when the gallery exposes one.
    pub fn author(&self) -> Option<&str> {
        self.author.as_deref()
    }
}

/// Result of asking a source for its next step.
#[derive(Debug)]
pub enum SourcePoll {
    /// Items discovered by one page fetch or one scroll step. May be empty.
    Batch(Vec<CandidateItem>),
    /// The source signalled that no further items exist.
    Exhausted,
    /// The caller-supplied deadline passed before the next step could start.
    BudgetSpent,
}

/// Failures that stop a source outright. Per-item problems never surface here.
#[derive(Debug, Error)]
pub enum SourceError {
    /// The browser or page driver stopped responding or rejected a command.
    #[error("page driver error: {0}")]
    Driver(String),
    /// The source was misconfigured (bad base URL, selector, ...).
    #[error("invalid source configuration: {0}")]
    Config(String),
}

/// A gallery that yields candidate items step by step.
///
/// Implementations keep their own cursor (page number, scroll depth) and are not restartable:
/// once [`SourcePoll::Exhausted`] is returned every later poll returns it too.
#[async_trait]
pub trait CandidateSource: Send {
    /// Short label used for logging and run directories.
    fn name(&self) -> &str;

    /// Advances the cursor by one step.
    ///
    /// `deadline` is the run's time budget; sources with expensive steps check it before
    /// starting one and answer [`SourcePoll::BudgetSpent`].
    async fn next_batch(&mut self, deadline: Option<Instant>) -> Result<SourcePoll, SourceError>;
}

/// Returns true once `deadline` has passed.
pub fn deadline_passed(deadline: Option<Instant>) -> bool {
    deadline.is_some_and(|at| Instant::now() >= at)
}
