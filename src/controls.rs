//! Crawl throttle knobs and the command-line surface that builds them.

use crate::sources::paged::{DEFAULT_GALLERY_API, DEFAULT_QUERY};
use crate::sources::scroll::{DEFAULT_COMMUNITY_URL, DEFAULT_IMAGE_SELECTOR};
use crate::sources::{PagedSourceConfig, ScrollSourceConfig};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;
use std::time::Duration;

/// Tunable knobs that bound one orchestrator run.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CrawlControls {
    politeness_delay: Duration,
    time_budget: Option<Duration>,
    workers: usize,
    request_timeout: Duration,
    max_storage_failures: usize,
}

impl CrawlControls {
    /// Constructs a new set of crawl controls.
    pub fn new(
        politeness_delay: Duration,
        time_budget: Option<Duration>,
        workers: usize,
        request_timeout: Duration,
        max_storage_failures: usize,
    ) -> Self {
        Self {
            politeness_delay,
            time_budget,
            workers: workers.max(1),
            request_timeout,
            max_storage_failures: max_storage_failures.max(1),
        }
    }

    /// Pause a worker takes before each item after its first.
    pub fn politeness_delay(&self) -> Duration {
        self.politeness_delay
    }

    /// Wall-clock budget after which no new candidates are admitted.
    pub fn time_budget(&self) -> Option<Duration> {
        self.time_budget
    }

    /// Number of parallel fetch workers.
    pub fn workers(&self) -> usize {
        self.workers
    }

    /// Timeout applied to every HTTP request.
    pub fn request_timeout(&self) -> Duration {
        self.request_timeout
    }

    /// Consecutive storage failures tolerated before the run aborts.
    pub fn max_storage_failures(&self) -> usize {
        self.max_storage_failures
    }

    /// Returns a copy with a different time budget.
    pub fn with_time_budget(mut self, time_budget: Option<Duration>) -> Self {
        self.time_budget = time_budget;
        self
    }

    /// Returns a copy with a different worker count.
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// Returns a copy with a different politeness delay.
    pub fn with_politeness_delay(mut self, delay: Duration) -> Self {
        self.politeness_delay = delay;
        self
    }
}

impl Default for CrawlControls {
    fn default() -> Self {
        Self {
            politeness_delay: Duration::from_secs(1),
            time_budget: None,
            workers: 1,
            request_timeout: Duration::from_secs(30),
            max_storage_failures: 3,
        }
    }
}

/// Command-line interface of the crawler binary.
#[derive(Parser, Debug, Clone)]
#[command(name = "gallerycrawl", about = "Incremental AI image gallery crawler")]
pub struct Cli {
    /// Gallery to crawl
    #[command(subcommand)]
    pub command: SourceCommand,

    /// Root directory for per-source run directories
    #[arg(long, global = true, env = "GALLERYCRAWL_SAVE_DIR", default_value = "spider_data")]
    pub save_dir: PathBuf,

    /// Reuse `<save-dir>/<source>/<label>` instead of a fresh timestamped directory
    #[arg(long, global = true, env = "GALLERYCRAWL_RUN_LABEL")]
    pub run_label: Option<String>,

    /// Milliseconds each worker waits between downloads
    #[arg(long, global = true, env = "GALLERYCRAWL_DELAY_MS", default_value_t = 1000)]
    pub delay_ms: u64,

    /// Number of parallel download workers
    #[arg(long, global = true, env = "GALLERYCRAWL_WORKERS", default_value_t = 1)]
    pub workers: usize,

    /// Timeout for every HTTP request, in seconds
    #[arg(long, global = true, env = "GALLERYCRAWL_REQUEST_TIMEOUT_SECS", default_value_t = 30)]
    pub request_timeout_secs: u64,

    /// Consecutive storage failures tolerated before aborting
    #[arg(long, global = true, env = "GALLERYCRAWL_MAX_STORAGE_FAILURES", default_value_t = 3)]
    pub max_storage_failures: usize,
}

/// Source selection.
#[derive(Subcommand, Debug, Clone)]
pub enum SourceCommand {
    /// Crawl the paged Miaohua gallery API
    Miaohua(MiaohuaArgs),
    /// Crawl the infinite-scroll Recraft community page
    Recraft(RecraftArgs),
    /// Crawl Miaohua, then Recraft
    All {
        /// Miaohua options
        #[command(flatten)]
        miaohua: MiaohuaArgs,
        /// Recraft options
        #[command(flatten)]
        recraft: RecraftArgs,
    },
}

/// Options of the paged source.
#[derive(Args, Debug, Clone)]
pub struct MiaohuaArgs {
    /// Search keyword
    #[arg(long, env = "GALLERYCRAWL_MIAOHUA_QUERY", default_value = DEFAULT_QUERY)]
    pub miaohua_query: String,

    /// Number of pages to request
    #[arg(long, env = "GALLERYCRAWL_MIAOHUA_PAGES", default_value_t = 1)]
    pub miaohua_pages: u32,

    /// Items per page
    #[arg(long, env = "GALLERYCRAWL_MIAOHUA_PER_PAGE", default_value_t = 30)]
    pub per_page: u32,

    /// Gallery API endpoint
    #[arg(long, env = "GALLERYCRAWL_MIAOHUA_API", default_value = DEFAULT_GALLERY_API)]
    pub api_url: String,
}

impl MiaohuaArgs {
    /// Builds the paged source configuration.
    pub fn source_config(&self) -> PagedSourceConfig {
        PagedSourceConfig {
            api_url: self.api_url.clone(),
            query: self.miaohua_query.clone(),
            per_page: self.per_page.max(1),
            start_page: 1,
            max_pages: self.miaohua_pages,
        }
    }
}

/// Options of the scroll source.
#[derive(Args, Debug, Clone)]
pub struct RecraftArgs {
    /// Search keyword
    #[arg(long, env = "GALLERYCRAWL_RECRAFT_QUERY", default_value = DEFAULT_QUERY)]
    pub recraft_query: String,

    /// Seconds after which no new candidates are admitted
    #[arg(long, env = "GALLERYCRAWL_RECRAFT_TIME_LIMIT", default_value_t = 100)]
    pub recraft_time_limit: u64,

    /// Crawl until the page stops growing, ignoring --recraft-time-limit
    #[arg(long, default_value_t = false)]
    pub no_time_limit: bool,

    /// Community page URL
    #[arg(long, env = "GALLERYCRAWL_RECRAFT_URL", default_value = DEFAULT_COMMUNITY_URL)]
    pub page_url: String,

    /// WebDriver server driving the headless browser
    #[arg(long, env = "GALLERYCRAWL_WEBDRIVER_URL", default_value = "http://localhost:9515")]
    pub webdriver_url: String,

    /// CSS selector of gallery images
    #[arg(long, env = "GALLERYCRAWL_RECRAFT_SELECTOR", default_value = DEFAULT_IMAGE_SELECTOR)]
    pub selector: String,

    /// Milliseconds to let the page settle after each scroll
    #[arg(long, env = "GALLERYCRAWL_SETTLE_MS", default_value_t = 2000)]
    pub settle_ms: u64,
}

impl RecraftArgs {
    /// Builds the scroll source configuration.
    pub fn source_config(&self) -> ScrollSourceConfig {
        ScrollSourceConfig {
            page_url: self.page_url.clone(),
            query: Some(self.recraft_query.clone()).filter(|q| !q.trim().is_empty()),
            settle_delay: Duration::from_millis(self.settle_ms),
        }
    }

    /// Requested time budget, if any.
    pub fn time_budget(&self) -> Option<Duration> {
        (!self.no_time_limit).then(|| Duration::from_secs(self.recraft_time_limit))
    }
}

impl Cli {
    /// Converts the parsed CLI into `CrawlControls`.
    pub fn build_controls(&self) -> CrawlControls {
        CrawlControls::new(
            Duration::from_millis(self.delay_ms),
            None,
            self.workers,
            Duration::from_secs(self.request_timeout_secs.max(1)),
            self.max_storage_failures,
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn controls_clamp_degenerate_values() {
        let controls = CrawlControls::new(Duration::ZERO, None, 0, Duration::from_secs(1), 0);
        assert_eq!(controls.workers(), 1);
        assert_eq!(controls.max_storage_failures(), 1);
        assert_eq!(controls.with_workers(0).workers(), 1);
    }

    #[test]
    fn parses_all_subcommand_with_shared_flags() {
        let cli = Cli::parse_from([
            "gallerycrawl",
            "all",
            "--miaohua-query",
            "lantern",
            "--miaohua-pages",
            "3",
            "--recraft-time-limit",
            "0",
            "--workers",
            "4",
            "--delay-ms",
            "0",
        ]);
        let controls = cli.build_controls();
        assert_eq!(controls.workers(), 4);
        assert_eq!(controls.politeness_delay(), Duration::ZERO);
        match cli.command {
            SourceCommand::All { miaohua, recraft } => {
                let paged = miaohua.source_config();
                assert_eq!(paged.query, "lantern");
                assert_eq!(paged.max_pages, 3);
                assert_eq!(recraft.time_budget(), Some(Duration::ZERO));
            }
            other => panic!("expected all, got {other:?}"),
        }
    }

    #[test]
    fn recraft_time_limit_can_be_disabled() {
        let cli = Cli::parse_from(["gallerycrawl", "recraft", "--no-time-limit"]);
        match cli.command {
            SourceCommand::Recraft(args) => {
                assert_eq!(args.time_budget(), None);
                assert_eq!(args.source_config().query.as_deref(), Some(DEFAULT_QUERY));
            }
            other => panic!("expected recraft, got {other:?}"),
        }
    }
}
