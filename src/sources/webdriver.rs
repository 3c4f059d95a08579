//! [`ScrollPage`] backed by a WebDriver session (chromedriver, geckodriver, ...).

use super::scroll::{parse_image_elements, ImageElement, ScrollPage};
use crate::candidate::SourceError;
use crate::fetch::USER_AGENT;
use async_trait::async_trait;
use fantoccini::{Client, ClientBuilder, Locator};
use serde_json::json;
use std::time::Duration;

const RENDER_WAIT: Duration = Duration::from_secs(10);

fn driver_error(err: impl std::fmt::Display) -> SourceError {
    SourceError::Driver(err.to_string())
}

/// Headless browser page driven over the WebDriver protocol.
pub struct WebDriverPage {
    client: Client,
    selector: String,
}

impl WebDriverPage {
    /// Starts a headless Chrome session through the WebDriver server at `webdriver_url`.
    pub async fn connect(
        webdriver_url: &str,
        selector: impl Into<String>,
    ) -> Result<Self, SourceError> {
        let mut capabilities = serde_json::Map::new();
        capabilities.insert(
            "goog:chromeOptions".to_string(),
            json!({
                "args": ["--headless", "--disable-gpu", format!("user-agent={USER_AGENT}")]
            }),
        );
        let client = ClientBuilder::rustls()
            .map_err(driver_error)?
            .capabilities(capabilities)
            .connect(webdriver_url)
            .await
            .map_err(driver_error)?;
        Ok(Self {
            client,
            selector: selector.into(),
        })
    }
}

#[async_trait]
impl ScrollPage for WebDriverPage {
    async fn open(&mut self, url: &str) -> Result<(), SourceError> {
        self.client.goto(url).await.map_err(driver_error)?;
        self.client
            .wait()
            .at_most(RENDER_WAIT)
            .for_element(Locator::Css(&self.selector))
            .await
            .map_err(driver_error)?;
        Ok(())
    }

    async fn scroll_height(&mut self) -> Result<u64, SourceError> {
        let height = self
            .client
            .execute("return document.body.scrollHeight", Vec::new())
            .await
            .map_err(driver_error)?;
        height
            .as_u64()
            .or_else(|| height.as_f64().map(|h| h as u64))
            .ok_or_else(|| SourceError::Driver(format!("unexpected scroll height {height}")))
    }

    async fn scroll_to_bottom(&mut self) -> Result<(), SourceError> {
        self.client
            .execute(
                "window.scrollTo(0, document.body.scrollHeight);",
                Vec::new(),
            )
            .await
            .map_err(driver_error)?;
        Ok(())
    }

    async fn visible_images(&mut self) -> Result<Vec<ImageElement>, SourceError> {
        let html = self.client.source().await.map_err(driver_error)?;
        parse_image_elements(&html, &self.selector)
    }

    async fn close(&mut self) -> Result<(), SourceError> {
        self.client.clone().close().await.map_err(driver_error)
    }
}
