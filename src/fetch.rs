//! Payload download, canonical PNG normalization and atomic asset writes.

use crate::candidate::CandidateItem;
use image::{ColorType, DynamicImage, ImageFormat};
use reqwest::{Client, StatusCode};
use std::fs::File;
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use thiserror::Error;

/// Identifying header sent with every request.
pub const USER_AGENT: &str =
    "Mozilla/5.0 (compatible; gallerycrawl/0.1; +https://github.com/gallerycrawl/gallerycrawl)";
/// Extension of every stored asset.
pub const ASSET_EXTENSION: &str = "png";

/// A normalized image stored under its deterministic name.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAsset {
    /// Identifier the file is named after.
    pub identifier: String,
    /// Final path, `<dir>/<identifier>.png`.
    pub path: PathBuf,
    /// Decoded width in pixels.
    pub width: u32,
    /// Decoded height in pixels.
    pub height: u32,
    /// Size of the PNG on disk.
    pub bytes_written: u64,
}

/// Per-item failures. Only [`FetchError::Storage`] counts toward the sustained-failure abort.
#[derive(Debug, Error)]
pub enum FetchError {
    /// Transport-level failure.
    #[error("request to {url} failed: {source}")]
    Http {
        /// Payload URL.
        url: String,
        /// Underlying client error.
        #[source]
        source: reqwest::Error,
    },
    /// The server answered with a non-success status.
    #[error("{url} answered with status {status}")]
    HttpStatus {
        /// Payload URL.
        url: String,
        /// Returned status.
        status: StatusCode,
    },
    /// The request exceeded the configured timeout.
    #[error("request to {url} timed out")]
    Timeout {
        /// Payload URL.
        url: String,
    },
    /// The body is not an image the decoder understands.
    #[error("payload from {url} is not a decodable image: {source}")]
    Decode {
        /// Payload URL.
        url: String,
        /// Decoder error.
        #[source]
        source: image::ImageError,
    },
    /// Re-encoding to PNG failed.
    #[error("failed to encode {identifier} as png: {source}")]
    Encode {
        /// Asset identifier.
        identifier: String,
        /// Encoder error.
        #[source]
        source: image::ImageError,
    },
    /// The identifier cannot be used as a file name; a property of the item, not of storage.
    #[error("identifier {identifier:?} is not a valid file name")]
    UnsafeIdentifier {
        /// Offending identifier.
        identifier: String,
    },
    /// The asset could not be written (disk full, permissions).
    #[error("failed to store asset at {path:?}: {source}")]
    Storage {
        /// Target path.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// The blocking normalization task panicked or was cancelled.
    #[error("normalization task failed: {0}")]
    Join(#[from] tokio::task::JoinError),
}

impl FetchError {
    /// True for failures of local storage rather than of the remote side.
    pub fn is_storage_failure(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }

    fn from_reqwest(url: &str, source: reqwest::Error) -> Self {
        if source.is_timeout() {
            Self::Timeout {
                url: url.to_string(),
            }
        } else {
            Self::Http {
                url: url.to_string(),
                source,
            }
        }
    }

    fn storage(path: &Path, source: io::Error) -> Self {
        Self::Storage {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Client with the crate user agent, bounded redirects and `timeout` on every request.
///
/// Sources and the fetcher of one run share it.
pub fn build_client(timeout: Duration) -> Result<Client, reqwest::Error> {
    Client::builder()
        .user_agent(USER_AGENT)
        .redirect(reqwest::redirect::Policy::limited(5))
        .connect_timeout(timeout)
        .timeout(timeout)
        .build()
}

/// Downloads payloads and stores them as PNG assets.
#[derive(Clone)]
pub struct Fetcher {
    client: Client,
}

impl Fetcher {
    /// Builds a fetcher whose requests all carry `timeout`.
    pub fn new(timeout: Duration) -> Result<Self, reqwest::Error> {
        Ok(Self::with_client(build_client(timeout)?))
    }

    /// Shares an already configured client.
    pub fn with_client(client: Client) -> Self {
        Self { client }
    }

    /// Underlying HTTP client, reused by sources that talk to the same hosts.
    pub fn client(&self) -> &Client {
        &self.client
    }

    /// Deterministic asset location for `identifier` inside `dir`.
    pub fn asset_path(dir: &Path, identifier: &str) -> PathBuf {
        dir.join(format!("{identifier}.{ASSET_EXTENSION}"))
    }

    /// Fetches `item`, normalizes it to PNG and stores it under `destination`.
    ///
    /// The asset is only visible under its final name once it is complete.
    pub async fn fetch(
        &self,
        item: &CandidateItem,
        destination: &Path,
    ) -> Result<ImageAsset, FetchError> {
        let identifier = item.identifier().to_string();
        let path = Self::asset_path(destination, &identifier);
        if !is_safe_file_stem(&identifier) {
            return Err(FetchError::UnsafeIdentifier { identifier });
        }

        let url = item.source_url().to_string();
        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|err| FetchError::from_reqwest(&url, err))?;
        let status = response.status();
        if !status.is_success() {
            return Err(FetchError::HttpStatus { url, status });
        }
        let body = response
            .bytes()
            .await
            .map_err(|err| FetchError::from_reqwest(&url, err))?;

        tokio::task::spawn_blocking(move || {
            let image = decode_payload(&url, &body)?;
            let bytes_written = write_staged(&path, |writer| {
                image
                    .write_to(writer, ImageFormat::Png)
                    .map_err(|source| FetchError::Encode {
                        identifier: identifier.clone(),
                        source,
                    })
            })?;
            Ok(ImageAsset {
                width: image.width(),
                height: image.height(),
                identifier,
                path,
                bytes_written,
            })
        })
        .await?
    }
}

fn is_safe_file_stem(identifier: &str) -> bool {
    !identifier.is_empty()
        && identifier != "."
        && identifier != ".."
        && !identifier.contains(['/', '\\', '\0'])
}

/// Decodes any supported format into a buffer the PNG encoder accepts.
fn decode_payload(url: &str, body: &[u8]) -> Result<DynamicImage, FetchError> {
    let image = image::load_from_memory(body).map_err(|source| FetchError::Decode {
        url: url.to_string(),
        source,
    })?;
    Ok(match image.color() {
        ColorType::Rgb32F | ColorType::Rgba32F => DynamicImage::ImageRgba8(image.to_rgba8()),
        _ => image,
    })
}

/// Runs `encode` against a temporary sibling of `path` and renames it into place on success.
///
/// Any error from `encode`, the flush or the rename discards the temporary file, so `path`
/// either holds a complete asset or is left untouched.
fn write_staged<F>(path: &Path, encode: F) -> Result<u64, FetchError>
where
    F: FnOnce(&mut BufWriter<&mut File>) -> Result<(), FetchError>,
{
    let dir = match path.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    let mut staged = NamedTempFile::new_in(dir).map_err(|err| FetchError::storage(dir, err))?;
    {
        let mut writer = BufWriter::new(staged.as_file_mut());
        encode(&mut writer)?;
        writer
            .flush()
            .map_err(|err| FetchError::storage(path, err))?;
    }
    staged
        .as_file()
        .sync_all()
        .map_err(|err| FetchError::storage(path, err))?;
    let bytes_written = staged
        .as_file()
        .metadata()
        .map_err(|err| FetchError::storage(path, err))?
        .len();
    staged
        .persist(path)
        .map_err(|err| FetchError::storage(path, err.error))?;
    Ok(bytes_written)
}

#[cfg(test)]
mod tests {
    use super::*;
    use image::{ImageBuffer, Rgb};
    use std::io::Cursor;
    use tempfile::TempDir;
    use wiremock::matchers::{header, method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    fn jpeg_fixture() -> Vec<u8> {
        let buffer: ImageBuffer<Rgb<u8>, Vec<u8>> =
            ImageBuffer::from_fn(3, 2, |x, y| Rgb([(x * 40) as u8, (y * 90) as u8, 200]));
        let mut bytes = Vec::new();
        DynamicImage::ImageRgb8(buffer)
            .write_to(&mut Cursor::new(&mut bytes), ImageFormat::Jpeg)
            .expect("encode jpeg fixture");
        bytes
    }

    fn candidate(id: &str, url: String) -> CandidateItem {
        CandidateItem::new(id, "prompt", url, "3x2", None).expect("candidate")
    }

    fn dir_is_empty(dir: &Path) -> bool {
        std::fs::read_dir(dir).unwrap().next().is_none()
    }

    #[tokio::test]
    async fn jpeg_payload_is_stored_as_png() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/a1.jpg"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(jpeg_fixture()))
            .expect(1)
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        let fetcher = Fetcher::new(Duration::from_secs(5)).unwrap();

        let asset = fetcher
            .fetch(&candidate("a1", format!("{}/a1.jpg", server.uri())), dir.path())
            .await
            .expect("fetch succeeds");

        assert_eq!(asset.path, dir.path().join("a1.png"));
        assert_eq!((asset.width, asset.height), (3, 2));
        let stored = std::fs::read(&asset.path).unwrap();
        assert_eq!(stored.len() as u64, asset.bytes_written);
        assert_eq!(image::guess_format(&stored).unwrap(), ImageFormat::Png);
    }

    #[tokio::test]
    async fn non_success_status_creates_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(404))
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        let fetcher = Fetcher::new(Duration::from_secs(5)).unwrap();

        let err = fetcher
            .fetch(&candidate("gone", format!("{}/gone.png", server.uri())), dir.path())
            .await
            .expect_err("404 is an error");
        assert!(matches!(err, FetchError::HttpStatus { status, .. } if status == StatusCode::NOT_FOUND));
        assert!(dir_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn undecodable_body_creates_nothing() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_string("<html>not an image</html>"))
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        let fetcher = Fetcher::new(Duration::from_secs(5)).unwrap();

        let err = fetcher
            .fetch(&candidate("bad", format!("{}/bad.png", server.uri())), dir.path())
            .await
            .expect_err("decode fails");
        assert!(matches!(err, FetchError::Decode { .. }));
        assert!(dir_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn slow_server_surfaces_as_timeout() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(
                ResponseTemplate::new(200)
                    .set_body_bytes(jpeg_fixture())
                    .set_delay(Duration::from_secs(2)),
            )
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        let fetcher = Fetcher::new(Duration::from_millis(100)).unwrap();

        let err = fetcher
            .fetch(&candidate("slow", format!("{}/slow.png", server.uri())), dir.path())
            .await
            .expect_err("times out");
        assert!(matches!(err, FetchError::Timeout { .. }), "got {err:?}");
        assert!(dir_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn path_like_identifier_is_refused_before_request() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(jpeg_fixture()))
            .expect(0)
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        let fetcher = Fetcher::new(Duration::from_secs(5)).unwrap();

        let err = fetcher
            .fetch(&candidate("../evil", format!("{}/evil.png", server.uri())), dir.path())
            .await
            .expect_err("rejected");
        assert!(matches!(err, FetchError::UnsafeIdentifier { .. }), "got {err:?}");
        assert!(!err.is_storage_failure());
        assert!(dir_is_empty(dir.path()));
    }

    #[tokio::test]
    async fn shared_client_identifies_itself() {
        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(header("user-agent", USER_AGENT))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(jpeg_fixture()))
            .expect(1)
            .mount(&server)
            .await;
        let dir = TempDir::new().unwrap();
        let client = build_client(Duration::from_secs(5)).unwrap();
        let fetcher = Fetcher::with_client(client.clone());

        let asset = fetcher
            .fetch(&candidate("ua", format!("{}/ua.jpg", server.uri())), dir.path())
            .await
            .unwrap();
        assert!(asset.path.exists());
    }

    #[test]
    fn encoder_failure_leaves_no_file() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("a1.png");

        let result = write_staged(&target, |writer| {
            writer.write_all(b"\x89PNG\r\n\x1a\npartial").unwrap();
            Err(FetchError::Encode {
                identifier: "a1".to_string(),
                source: image::ImageError::IoError(io::Error::other("encoder crashed")),
            })
        });

        assert!(matches!(result, Err(FetchError::Encode { .. })));
        assert!(!target.exists());
        assert!(dir_is_empty(dir.path()));
    }

    #[test]
    fn staged_write_replaces_existing_asset() {
        let dir = TempDir::new().unwrap();
        let target = dir.path().join("a1.png");
        std::fs::write(&target, b"stale").unwrap();

        let written = write_staged(&target, |writer| {
            writer
                .write_all(b"fresh bytes")
                .map_err(|err| FetchError::storage(&target, err))
        })
        .expect("write");

        assert_eq!(written, 11);
        assert_eq!(std::fs::read(&target).unwrap(), b"fresh bytes");
    }
}
