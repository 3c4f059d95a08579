//! Infinite-scroll gallery source.
//!
//! Each poll is one scroll step: measure the page height, scroll to the bottom, let the page
//! settle, measure again and enumerate the visible images. When a step leaves the height
//! unchanged the items of that step are still returned and the next poll reports exhaustion.

use crate::candidate::{
    deadline_passed, CandidateItem, CandidateSource, SourceError, SourcePoll, UNKNOWN_RATIO,
};
use async_trait::async_trait;
use scraper::{Html, Selector};
use std::collections::HashSet;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use url::Url;

/// Community gallery page of the Recraft service.
pub const DEFAULT_COMMUNITY_URL: &str = "https://www.recraft.ai/community";
/// Selector matching gallery thumbnails on the community page.
pub const DEFAULT_IMAGE_SELECTOR: &str = "img.c-crbeIZ";
/// Pause after each scroll so lazy-loaded images can render.
pub const DEFAULT_SETTLE_DELAY: Duration = Duration::from_secs(2);

/// Attributes of one rendered `<img>` element.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ImageElement {
    /// `src` attribute.
    pub src: Option<String>,
    /// `alt` attribute, used as the description.
    pub alt: Option<String>,
    /// `width` attribute.
    pub width: Option<String>,
    /// `height` attribute.
    pub height: Option<String>,
}

impl ImageElement {
    /// Maps the element to a candidate; `None` when it has no usable `src`.
    pub fn to_candidate(&self) -> Option<CandidateItem> {
        let src = self.src.as_deref().map(str::trim).filter(|s| !s.is_empty())?;
        let identifier = identifier_from_src(src)?;
        let ratio = match (non_empty(&self.width), non_empty(&self.height)) {
            (Some(width), Some(height)) => format!("{width}x{height}"),
            _ => UNKNOWN_RATIO.to_string(),
        };
        CandidateItem::new(
            identifier,
            self.alt.clone().unwrap_or_default(),
            src,
            ratio,
            None,
        )
    }
}

fn non_empty(value: &Option<String>) -> Option<&str> {
    value.as_deref().map(str::trim).filter(|v| !v.is_empty())
}

/// Derives the identifier from the last path segment of `src`, cut at the first `@`.
pub fn identifier_from_src(src: &str) -> Option<String> {
    let segment = match Url::parse(src) {
        Ok(url) => url
            .path_segments()
            .and_then(|mut segments| segments.next_back())
            .map(str::to_string),
        Err(_) => src
            .split(['?', '#'])
            .next()
            .and_then(|path| path.rsplit('/').next())
            .map(str::to_string),
    }?;
    let identifier = segment.split('@').next().unwrap_or_default().trim();
    (!identifier.is_empty()).then(|| identifier.to_string())
}

/// Extracts image elements matching `selector` from a rendered DOM snapshot.
pub fn parse_image_elements(html: &str, selector: &str) -> Result<Vec<ImageElement>, SourceError> {
    let selector = Selector::parse(selector)
        .map_err(|err| SourceError::Config(format!("invalid selector {selector:?}: {err}")))?;
    let document = Html::parse_document(html);
    Ok(document
        .select(&selector)
        .map(|element| {
            let attr = |name: &str| element.value().attr(name).map(str::to_string);
            ImageElement {
                src: attr("src"),
                alt: attr("alt"),
                width: attr("width"),
                height: attr("height"),
            }
        })
        .collect())
}

/// Browser-side operations the scroll source needs.
#[async_trait]
pub trait ScrollPage: Send {
    /// Navigates to `url` and waits until the gallery has rendered.
    async fn open(&mut self, url: &str) -> Result<(), SourceError>;
    /// Current document height in pixels.
    async fn scroll_height(&mut self) -> Result<u64, SourceError>;
    /// Scrolls the viewport to the bottom of the document.
    async fn scroll_to_bottom(&mut self) -> Result<(), SourceError>;
    /// Images currently present in the document.
    async fn visible_images(&mut self) -> Result<Vec<ImageElement>, SourceError>;
    /// Releases the page. Called once when the source finishes.
    async fn close(&mut self) -> Result<(), SourceError> {
        Ok(())
    }
}

/// Knobs for [`ScrollSource`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrollSourceConfig {
    /// Gallery page without query.
    pub page_url: String,
    /// Optional search term appended as `q`.
    pub query: Option<String>,
    /// Wait between scrolling and re-measuring.
    pub settle_delay: Duration,
}

impl Default for ScrollSourceConfig {
    fn default() -> Self {
        Self {
            page_url: DEFAULT_COMMUNITY_URL.to_string(),
            query: None,
            settle_delay: DEFAULT_SETTLE_DELAY,
        }
    }
}

impl ScrollSourceConfig {
    /// Page URL with the search term encoded into `q`.
    pub fn target_url(&self) -> Result<String, SourceError> {
        let mut url = Url::parse(&self.page_url)
            .map_err(|err| SourceError::Config(format!("bad page url {}: {err}", self.page_url)))?;
        if let Some(query) = self.query.as_deref().filter(|q| !q.is_empty()) {
            url.query_pairs_mut().append_pair("q", query);
        }
        Ok(url.into())
    }
}

/// Source that discovers items by scrolling an infinite gallery page.
pub struct ScrollSource<P> {
    page: P,
    config: ScrollSourceConfig,
    opened: bool,
    finished: bool,
    emitted: HashSet<String>,
}

impl<P: ScrollPage> ScrollSource<P> {
    /// Wraps `page`; navigation happens on the first poll.
    pub fn new(page: P, config: ScrollSourceConfig) -> Self {
        Self {
            page,
            config,
            opened: false,
            finished: false,
            emitted: HashSet::new(),
        }
    }

    async fn finish(&mut self) {
        if self.finished {
            return;
        }
        self.finished = true;
        if self.opened {
            if let Err(err) = self.page.close().await {
                tracing::warn!(error = %err, "failed to close gallery page");
            }
        }
    }

    fn fresh_candidates(&mut self, elements: &[ImageElement]) -> Vec<CandidateItem> {
        elements
            .iter()
            .filter_map(ImageElement::to_candidate)
            .filter(|item| self.emitted.insert(item.identifier().to_string()))
            .collect()
    }

    async fn step(&mut self) -> Result<Vec<CandidateItem>, SourceError> {
        if !self.opened {
            let target = self.config.target_url()?;
            tracing::info!(url = %target, "opening gallery page");
            self.page.open(&target).await?;
            self.opened = true;
        }

        let last_height = self.page.scroll_height().await?;
        self.page.scroll_to_bottom().await?;
        sleep(self.config.settle_delay).await;
        let new_height = self.page.scroll_height().await?;

        let elements = self.page.visible_images().await?;
        let items = self.fresh_candidates(&elements);
        tracing::debug!(
            last_height,
            new_height,
            visible = elements.len(),
            fresh = items.len(),
            "scroll step complete"
        );

        if new_height == last_height {
            tracing::info!("reached the bottom of the gallery");
            self.finish().await;
        }
        Ok(items)
    }
}

#[async_trait]
impl<P: ScrollPage> CandidateSource for ScrollSource<P> {
    fn name(&self) -> &str {
        "recraft"
    }

    async fn next_batch(&mut self, deadline: Option<Instant>) -> Result<SourcePoll, SourceError> {
        if self.finished {
            return Ok(SourcePoll::Exhausted);
        }
        if deadline_passed(deadline) {
            tracing::info!("time budget spent before next scroll step");
            self.finish().await;
            return Ok(SourcePoll::BudgetSpent);
        }

        match self.step().await {
            Ok(items) => Ok(SourcePoll::Batch(items)),
            Err(err) => {
                self.finish().await;
                Err(err)
            }
        }
    }
}
