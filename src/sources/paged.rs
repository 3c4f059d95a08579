//! Paged JSON gallery API source.
//!
//! Each poll requests `?page=N&per_page=M&query=Q` and expects
//! `{code, info: {list: [{prompt, ratio, large, task_id, user_name}]}}`. A non-success status,
//! a non-zero `code`, an empty list or an unreadable payload ends the source.

use crate::candidate::{CandidateItem, CandidateSource, SourceError, SourcePoll};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use std::time::Instant;

/// Public gallery endpoint of the Miaohua service.
pub const DEFAULT_GALLERY_API: &str = "https://miaohua.sensetime.com/api/v2/public/gallery";
/// Search term used when none is given.
pub const DEFAULT_QUERY: &str = "春节";

/// Knobs for [`PagedApiSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagedSourceConfig {
    /// Gallery endpoint.
    pub api_url: String,
    /// Search term forwarded as `query`.
    pub query: String,
    /// Page size forwarded as `per_page`.
    pub per_page: u32,
    /// First page to request (1-based).
    pub start_page: u32,
    /// Upper bound on pages requested in one run.
    pub max_pages: u32,
}

impl Default for PagedSourceConfig {
    fn default() -> Self {
        Self {
            api_url: DEFAULT_GALLERY_API.to_string(),
            query: DEFAULT_QUERY.to_string(),
            per_page: 30,
            start_page: 1,
            max_pages: 1,
        }
    }
}

/// Source that walks a paged gallery API one page per poll.
pub struct PagedApiSource {
    client: Client,
    config: PagedSourceConfig,
    next_page: u32,
    pages_requested: u32,
    exhausted: bool,
}

impl PagedApiSource {
    /// Creates a source positioned at `config.start_page`.
    pub fn new(client: Client, config: PagedSourceConfig) -> Self {
        Self {
            client,
            next_page: config.start_page.max(1),
            pages_requested: 0,
            exhausted: false,
            config,
        }
    }

    async fn fetch_page(&self, page: u32) -> Option<Vec<CandidateItem>> {
        let per_page = self.config.per_page.to_string();
        let page_param = page.to_string();
        let response = match self
            .client
            .get(&self.config.api_url)
            .query(&[
                ("page", page_param.as_str()),
                ("per_page", per_page.as_str()),
                ("query", self.config.query.as_str()),
            ])
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                tracing::warn!(page, error = %err, "gallery page request failed");
                return None;
            }
        };

        let status = response.status();
        if !status.is_success() {
            tracing::warn!(page, %status, "gallery page returned non-success status");
            return None;
        }

        let payload: GalleryResponse = match response.json().await {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(page, error = %err, "gallery page payload unreadable");
                return None;
            }
        };
        if payload.code != Some(0) {
            tracing::info!(page, code = ?payload.code, "gallery reported an error code");
            return None;
        }

        let entries = payload.info.map(|info| info.list).unwrap_or_default();
        if entries.is_empty() {
            return None;
        }

        let total = entries.len();
        let items: Vec<CandidateItem> = entries.into_iter().filter_map(parse_entry).collect();
        if items.len() < total {
            tracing::debug!(page, skipped = total - items.len(), "dropped unusable gallery entries");
        }
        Some(items)
    }
}

#[async_trait]
impl CandidateSource for PagedApiSource {
    fn name(&self) -> &str {
        "miaohua"
    }

    async fn next_batch(&mut self, _deadline: Option<Instant>) -> Result<SourcePoll, SourceError> {
        if self.exhausted || self.pages_requested >= self.config.max_pages {
            self.exhausted = true;
            return Ok(SourcePoll::Exhausted);
        }

        let page = self.next_page;
        self.next_page += 1;
        self.pages_requested += 1;
        tracing::info!(page, query = %self.config.query, "requesting gallery page");

        match self.fetch_page(page).await {
            Some(items) => Ok(SourcePoll::Batch(items)),
            None => {
                self.exhausted = true;
                Ok(SourcePoll::Exhausted)
            }
        }
    }
}

#[derive(Debug, Deserialize)]
struct GalleryResponse {
    #[serde(default)]
    code: Option<i64>,
    #[serde(default)]
    info: Option<GalleryInfo>,
}

#[derive(Debug, Deserialize)]
struct GalleryInfo {
    #[serde(default)]
    list: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct GalleryEntry {
    #[serde(default)]
    prompt: Option<String>,
    #[serde(default)]
    ratio: Option<serde_json::Value>,
    #[serde(default)]
    large: Option<String>,
    #[serde(default)]
    task_id: Option<serde_json::Value>,
    #[serde(default)]
    user_name: Option<serde_json::Value>,
}

// Entries are decoded one by one so a malformed entry only drops itself.
fn parse_entry(raw: serde_json::Value) -> Option<CandidateItem> {
    let entry: GalleryEntry = match serde_json::from_value(raw) {
        Ok(entry) => entry,
        Err(err) => {
            tracing::debug!(error = %err, "skipping malformed gallery entry");
            return None;
        }
    };
    let identifier = entry.task_id.as_ref().and_then(scalar_to_string)?;
    let url = entry.large.filter(|url| !url.trim().is_empty())?;
    let ratio = entry
        .ratio
        .as_ref()
        .and_then(scalar_to_string)
        .unwrap_or_default();
    CandidateItem::new(
        identifier,
        entry.prompt.unwrap_or_default(),
        url,
        ratio,
        entry.user_name.as_ref().and_then(scalar_to_string),
    )
}

fn scalar_to_string(value: &serde_json::Value) -> Option<String> {
    match value {
        serde_json::Value::String(text) => Some(text.clone()),
        serde_json::Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}
