#![warn(missing_docs)]
//! Incremental crawl-and-dedup engine for AI image galleries.
//!
//! A [`CandidateSource`] yields gallery entries, the [`Crawler`] checks each identifier against
//! the run's [`Ledger`] before fetching, the [`Fetcher`] stores the payload as PNG, and only then
//! is the entry recorded. [`RunManager`] lays out per-source run directories.

pub mod candidate;
pub mod controls;
pub mod crawler;
pub mod fetch;
pub mod inspire;
pub mod ledger;
pub mod run_manager;
pub mod sources;

pub use candidate::{CandidateItem, CandidateSource, SourceError, SourcePoll, UNKNOWN_RATIO};
pub use controls::{Cli, CrawlControls, MiaohuaArgs, RecraftArgs, SourceCommand};
pub use crawler::{CrawlContext, CrawlError, Crawler, RunOutcome, RunSummary};
pub use fetch::{build_client, FetchError, Fetcher, ImageAsset};
pub use inspire::{
    extract_valid_prompts, InspirationClient, InspireError, InspiredPrompt, PromptInspirer,
    SceneAnalysis, TextGenerator, TextModel,
};
pub use ledger::{Ledger, LedgerError, LedgerRecord, LEDGER_FILE_NAME};
pub use run_manager::{PlannedRun, RunAllError, RunManager, SourceRun};
pub use sources::{PagedApiSource, PagedSourceConfig, ScrollPage, ScrollSource, ScrollSourceConfig};
