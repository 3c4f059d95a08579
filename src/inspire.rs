//! Prompt inspiration: sends captured descriptions to a remote text-generation endpoint and
//! collects the structured rewrites it returns.
//!
//! Failures never propagate out of [`PromptInspirer::inspire`]; they become a sentinel result
//! whose `inspired_prompt` is [`FAILED_PROMPT`], which [`extract_valid_prompts`] filters out.

use crate::ledger::{Ledger, LedgerError};
use reqwest::blocking::Client;
use reqwest::header::{HeaderMap, HeaderValue, CONTENT_TYPE};
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use thiserror::Error;

/// Proxy endpoint serving every supported model.
pub const DEFAULT_PROXY_URL: &str =
    "https://edge.microsoft.com/taggrouptitlegeneration/api/actionai/proxyv3";
/// Token in the system prompt template replaced by the description.
pub const MESSAGE_PLACEHOLDER: &str = "MESSAGE";
/// `inspired_prompt` of the sentinel result.
pub const FAILED_PROMPT: &str = "processing failed";
/// Value of every sentinel analysis field.
pub const UNKNOWN_FIELD: &str = "unknown";
/// Default request timeout; generation is slow.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(420);
/// Default number of attempts per description.
pub const DEFAULT_ATTEMPTS: usize = 3;

const LEGACY_FAILED_PROMPTS: [&str; 2] = ["处理失败", "Processing failed"];

/// Errors raised while producing an inspired prompt.
#[derive(Debug, Error)]
pub enum InspireError {
    /// No API key was configured.
    #[error("missing text-generation API key")]
    MissingApiKey,
    /// The API key cannot be sent as a header.
    #[error("invalid API key header: {0}")]
    InvalidApiKey(#[from] reqwest::header::InvalidHeaderValue),
    /// The HTTP client could not be built.
    #[error("failed to build text-generation client: {0}")]
    Client(#[source] reqwest::Error),
    /// Every attempt failed.
    #[error("text-generation request failed after {attempts} attempts: {last}")]
    Exhausted {
        /// Attempts made.
        attempts: usize,
        /// Last status or transport error.
        last: String,
    },
    /// The endpoint answered with an empty body.
    #[error("text-generation endpoint returned an empty response")]
    EmptyResponse,
    /// The body is not a valid inspired-prompt object.
    #[error("unparsable text-generation response: {0}")]
    Parse(#[from] serde_json::Error),
    /// A template or result file could not be read or written.
    #[error("i/o error on {path:?}: {source}")]
    Io {
        /// File path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// The input ledger could not be loaded.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Hosted model selection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum TextModel {
    /// `deucalionv1`
    Deucalion,
    /// `gpt4turbo`
    Gpt4turbo,
    /// `gpt4o`
    Gpt4o,
}

impl TextModel {
    /// Value of the `modelName` query parameter.
    pub fn model_name(self) -> &'static str {
        match self {
            Self::Deucalion => "deucalionv1",
            Self::Gpt4turbo => "gpt4turbo",
            Self::Gpt4o => "gpt4o",
        }
    }
}

/// Structured scene breakdown returned alongside the rewritten prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct SceneAnalysis {
    /// Salient subjects.
    pub main_elements: Vec<String>,
    /// Kind of scene.
    pub scene_type: String,
    /// Artistic style.
    pub art_style: String,
    /// Emotional tone.
    pub mood: String,
    /// Framing and layout.
    pub composition: String,
    /// Dominant palette.
    pub color_scheme: String,
}

/// One description and its inspired rewrite.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InspiredPrompt {
    /// Description that was sent.
    #[serde(default)]
    pub original_prompt: String,
    /// Rewritten prompt, or [`FAILED_PROMPT`].
    #[serde(default)]
    pub inspired_prompt: String,
    /// Scene breakdown.
    #[serde(default)]
    pub analysis: SceneAnalysis,
}

impl InspiredPrompt {
    /// Sentinel returned when inspiration fails for `description`.
    pub fn failed(description: &str) -> Self {
        Self {
            original_prompt: description.to_string(),
            inspired_prompt: FAILED_PROMPT.to_string(),
            analysis: SceneAnalysis {
                main_elements: Vec::new(),
                scene_type: UNKNOWN_FIELD.to_string(),
                art_style: UNKNOWN_FIELD.to_string(),
                mood: UNKNOWN_FIELD.to_string(),
                composition: UNKNOWN_FIELD.to_string(),
                color_scheme: UNKNOWN_FIELD.to_string(),
            },
        }
    }

    /// True for usable results.
    pub fn is_valid(&self) -> bool {
        let prompt = self.inspired_prompt.trim();
        !prompt.is_empty() && prompt != FAILED_PROMPT && !LEGACY_FAILED_PROMPTS.contains(&prompt)
    }
}

/// Something that turns a full prompt into raw response text.
pub trait TextGenerator {
    /// Returns the raw body of a successful generation.
    fn generate(&self, prompt: &str) -> Result<String, InspireError>;
}

#[derive(Serialize)]
struct GenerationRequest<'a> {
    prompt: &'a str,
    temperature: f32,
    max_tokens: u32,
    top_p: f32,
    frequency_penalty: f32,
    presence_penalty: f32,
    stop: [&'static str; 2],
}

/// Blocking client for the hosted text-generation proxy.
#[derive(Clone)]
pub struct InspirationClient {
    client: Client,
    endpoint: String,
    model: TextModel,
    max_attempts: usize,
    retry_delay: Duration,
}

impl InspirationClient {
    /// Builds a client; `api_key` is sent as `x-api-key`.
    pub fn new(
        api_key: &str,
        base_url: &str,
        model: TextModel,
        timeout: Duration,
    ) -> Result<Self, InspireError> {
        if api_key.trim().is_empty() {
            return Err(InspireError::MissingApiKey);
        }
        let mut headers = HeaderMap::new();
        headers.insert("x-api-key", HeaderValue::from_str(api_key.trim())?);
        headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        let client = Client::builder()
            .timeout(timeout)
            .default_headers(headers)
            .build()
            .map_err(InspireError::Client)?;
        Ok(Self {
            client,
            endpoint: base_url.to_string(),
            model,
            max_attempts: DEFAULT_ATTEMPTS,
            retry_delay: Duration::from_millis(500),
        })
    }

    /// Overrides the attempt count (minimum 1).
    pub fn with_attempts(mut self, max_attempts: usize) -> Self {
        self.max_attempts = max_attempts.max(1);
        self
    }

    /// Overrides the pause between attempts.
    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }
}

impl TextGenerator for InspirationClient {
    fn generate(&self, prompt: &str) -> Result<String, InspireError> {
        let request = GenerationRequest {
            prompt,
            temperature: 0.8,
            max_tokens: 8192,
            top_p: 1.0,
            frequency_penalty: 0.0,
            presence_penalty: 0.0,
            stop: ["```", "<|im_end|>"],
        };

        let mut last = String::new();
        for attempt in 1..=self.max_attempts {
            let response = self
                .client
                .post(&self.endpoint)
                .query(&[("modelName", self.model.model_name())])
                .json(&request)
                .send();
            match response {
                Ok(resp) if resp.status().is_success() => {
                    return resp.text().map_err(|err| InspireError::Exhausted {
                        attempts: attempt,
                        last: err.to_string(),
                    });
                }
                Ok(resp) => {
                    last = format!("status {}", resp.status());
                }
                Err(err) => {
                    last = err.to_string();
                }
            }
            tracing::warn!(attempt, error = %last, "text-generation attempt failed");
            if attempt < self.max_attempts && !self.retry_delay.is_zero() {
                thread::sleep(self.retry_delay);
            }
        }
        Err(InspireError::Exhausted {
            attempts: self.max_attempts,
            last,
        })
    }
}

/// Fills the system prompt template and parses what the generator returns.
pub struct PromptInspirer<G> {
    template: String,
    generator: G,
}

impl<G: TextGenerator> PromptInspirer<G> {
    /// Uses `template` as the system prompt.
    pub fn new(template: impl Into<String>, generator: G) -> Self {
        Self {
            template: template.into(),
            generator,
        }
    }

    /// Reads the system prompt template from `path`.
    pub fn from_template_file(path: &Path, generator: G) -> Result<Self, InspireError> {
        let template = fs::read_to_string(path).map_err(|source| InspireError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(Self::new(template, generator))
    }

    /// Full prompt sent for `description`.
    pub fn render(&self, description: &str) -> String {
        self.template.replace(MESSAGE_PLACEHOLDER, description)
    }

    /// Inspires one description, surfacing failures.
    pub fn try_inspire(&self, description: &str) -> Result<InspiredPrompt, InspireError> {
        let body = self.generator.generate(&self.render(description))?;
        if body.trim().is_empty() {
            return Err(InspireError::EmptyResponse);
        }
        Ok(serde_json::from_str(body.trim())?)
    }

    /// Inspires one description, returning the sentinel on failure.
    pub fn inspire(&self, description: &str) -> InspiredPrompt {
        match self.try_inspire(description) {
            Ok(result) => result,
            Err(err) => {
                tracing::warn!(error = %err, "inspiration failed");
                InspiredPrompt::failed(description)
            }
        }
    }

    /// Inspires every record of the ledger at `path` that has a description.
    pub fn inspire_ledger(&self, path: &Path) -> Result<Vec<InspiredPrompt>, InspireError> {
        let ledger = Ledger::open(path)?;
        let mut results = Vec::new();
        for record in ledger.records() {
            let description = record.description.trim();
            if description.is_empty() {
                tracing::debug!(identifier = %record.identifier, "skipping record without description");
                continue;
            }
            let preview: String = description.chars().take(50).collect();
            tracing::info!(identifier = %record.identifier, description = %preview, "inspiring");
            results.push(self.inspire(description));
        }
        Ok(results)
    }
}

/// Inspired prompts of the results that did not fail, in order.
pub fn extract_valid_prompts(results: &[InspiredPrompt]) -> Vec<String> {
    results
        .iter()
        .filter(|result| result.is_valid())
        .map(|result| result.inspired_prompt.clone())
        .collect()
}

/// Loads a results document written by [`write_results`].
pub fn read_results(path: &Path) -> Result<Vec<InspiredPrompt>, InspireError> {
    let raw = fs::read(path).map_err(|source| InspireError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    Ok(serde_json::from_slice(&raw)?)
}

/// Writes results as a pretty-printed JSON array.
pub fn write_results(path: &Path, results: &[InspiredPrompt]) -> Result<(), InspireError> {
    let body = serde_json::to_vec_pretty(results)?;
    fs::write(path, body).map_err(|source| InspireError::Io {
        path: path.to_path_buf(),
        source,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::candidate::CandidateItem;
    use crate::ledger::{LedgerRecord, LEDGER_FILE_NAME};
    use pretty_assertions::assert_eq;
    use std::cell::RefCell;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, query_param};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    struct Canned {
        replies: RefCell<Vec<Result<String, InspireError>>>,
        seen: RefCell<Vec<String>>,
    }

    impl Canned {
        fn new(replies: Vec<Result<String, InspireError>>) -> Self {
            Self {
                replies: RefCell::new(replies),
                seen: RefCell::new(Vec::new()),
            }
        }
    }

    impl TextGenerator for &Canned {
        fn generate(&self, prompt: &str) -> Result<String, InspireError> {
            self.seen.borrow_mut().push(prompt.to_string());
            self.replies.borrow_mut().remove(0)
        }
    }

    const REPLY: &str = r#"{
        "original_prompt": "red lantern",
        "inspired_prompt": "a red paper lantern glowing over a snowy alley",
        "analysis": {"main_elements": ["lantern", "snow"], "scene_type": "street",
                     "art_style": "watercolor", "mood": "festive",
                     "composition": "centered", "color_scheme": "red and white"}
    }"#;

    #[test]
    fn substitutes_the_description_and_parses_the_reply() {
        let generator = Canned::new(vec![Ok(REPLY.to_string())]);
        let inspirer = PromptInspirer::new("Rewrite: MESSAGE\nAnswer in JSON.", &generator);

        let result = inspirer.inspire("red lantern");

        assert_eq!(
            generator.seen.borrow().as_slice(),
            ["Rewrite: red lantern\nAnswer in JSON.".to_string()]
        );
        assert!(result.is_valid());
        assert_eq!(result.analysis.main_elements, vec!["lantern", "snow"]);
        assert_eq!(result.analysis.mood, "festive");
    }

    #[test]
    fn failures_become_the_sentinel() {
        let generator = Canned::new(vec![
            Ok("not json".to_string()),
            Ok("   ".to_string()),
            Err(InspireError::MissingApiKey),
        ]);
        let inspirer = PromptInspirer::new("MESSAGE", &generator);

        for _ in 0..3 {
            let result = inspirer.inspire("dragon");
            assert_eq!(result, InspiredPrompt::failed("dragon"));
            assert_eq!(result.analysis.art_style, UNKNOWN_FIELD);
        }
    }

    #[test]
    fn extraction_drops_sentinels_and_blanks() {
        let mut legacy = InspiredPrompt::failed("x");
        legacy.inspired_prompt = "处理失败".to_string();
        let mut good = InspiredPrompt::failed("y");
        good.inspired_prompt = "a quiet harbor at dawn".to_string();
        let mut blank = InspiredPrompt::failed("z");
        blank.inspired_prompt = String::new();

        let results = vec![InspiredPrompt::failed("w"), legacy, good, blank];
        assert_eq!(
            extract_valid_prompts(&results),
            vec!["a quiet harbor at dawn".to_string()]
        );
    }

    #[test]
    fn ledger_records_without_descriptions_are_skipped() {
        let dir = TempDir::new().unwrap();
        let mut ledger = Ledger::open(dir.path().join(LEDGER_FILE_NAME)).unwrap();
        for (id, description) in [("a1", "red lantern"), ("a2", "")] {
            let item = CandidateItem::new(id, description, "http://x", "1:1", None).unwrap();
            ledger.append(LedgerRecord::from_candidate(&item)).unwrap();
        }
        let generator = Canned::new(vec![Ok(REPLY.to_string())]);
        let inspirer = PromptInspirer::new("MESSAGE", &generator);

        let results = inspirer.inspire_ledger(ledger.path()).unwrap();
        assert_eq!(results.len(), 1);
        assert_eq!(generator.seen.borrow().as_slice(), ["red lantern".to_string()]);

        let out = dir.path().join("generated_prompts.json");
        write_results(&out, &results).unwrap();
        assert_eq!(read_results(&out).unwrap(), results);
    }

    #[test]
    fn client_requires_an_api_key() {
        assert!(matches!(
            InspirationClient::new(" ", DEFAULT_PROXY_URL, TextModel::Gpt4o, DEFAULT_TIMEOUT),
            Err(InspireError::MissingApiKey)
        ));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn client_retries_then_returns_the_body() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .and(query_param("modelName", "gpt4o"))
            .and(header("x-api-key", "secret"))
            .respond_with(ResponseTemplate::new(502))
            .up_to_n_times(2)
            .expect(2)
            .mount(&server)
            .await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(200).set_body_string(REPLY))
            .expect(1)
            .mount(&server)
            .await;

        let url = server.uri();
        let body = tokio::task::spawn_blocking(move || {
            InspirationClient::new("secret", &url, TextModel::Gpt4o, Duration::from_secs(5))
                .unwrap()
                .with_retry_delay(Duration::ZERO)
                .generate("hello")
        })
        .await
        .unwrap()
        .unwrap();
        assert!(body.contains("paper lantern"));
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn client_gives_up_after_three_attempts() {
        let server = MockServer::start().await;
        Mock::given(method("POST"))
            .respond_with(ResponseTemplate::new(500))
            .expect(3)
            .mount(&server)
            .await;

        let url = server.uri();
        let err = tokio::task::spawn_blocking(move || {
            InspirationClient::new("secret", &url, TextModel::Deucalion, Duration::from_secs(5))
                .unwrap()
                .with_retry_delay(Duration::ZERO)
                .generate("hello")
        })
        .await
        .unwrap()
        .unwrap_err();
        assert!(matches!(err, InspireError::Exhausted { attempts: 3, .. }));
    }
}
