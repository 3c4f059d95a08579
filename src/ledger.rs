//! Append-only dedup ledger persisted as a single JSON array.
//!
//! The whole document is rewritten after every successful append. Rewrites are staged in a
//! sibling temporary file and renamed over the target, so a crash mid-write leaves the previous
//! document in place. A document that cannot be parsed is reported as corruption and never
//! replaced with an empty ledger.

use crate::candidate::CandidateItem;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use tempfile::NamedTempFile;
use thiserror::Error;

/// File name used for the ledger inside a run directory.
pub const LEDGER_FILE_NAME: &str = "image_info.json";

/// Persisted form of a captured candidate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerRecord {
    /// Prompt or caption text.
    #[serde(default, deserialize_with = "lenient_string")]
    pub description: String,
    /// Display dimensions or source label.
    #[serde(default, deserialize_with = "lenient_string")]
    pub ratio: String,
    /// Payload URL the asset was fetched from.
    #[serde(rename = "img_url", default, deserialize_with = "lenient_string")]
    pub source_url: String,
    /// Dedup key, also the asset file stem.
    #[serde(rename = "task_id", deserialize_with = "lenient_string")]
    pub identifier: String,
    /// Author name, `null` when the gallery does not expose one.
    #[serde(rename = "user_name", default)]
    pub author: Option<String>,
}

impl LedgerRecord {
    /// Captures the metadata of a candidate that has been stored successfully.
    pub fn from_candidate(item: &CandidateItem) -> Self {
        Self {
            description: item.description().to_string(),
            ratio: item.ratio().to_string(),
            source_url: item.source_url().to_string(),
            identifier: item.identifier().to_string(),
            author: item.author().map(str::to_string),
        }
    }
}

// Older documents carry numeric task ids and `null` captions.
fn lenient_string<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    match serde_json::Value::deserialize(deserializer)? {
        serde_json::Value::Null => Ok(String::new()),
        serde_json::Value::String(value) => Ok(value),
        serde_json::Value::Number(value) => Ok(value.to_string()),
        other => Err(serde::de::Error::custom(format!(
            "expected string, number or null, found {other}"
        ))),
    }
}

/// Errors raised by ledger operations.
#[derive(Debug, Error)]
pub enum LedgerError {
    /// The persisted document exists but cannot be trusted.
    #[error("ledger {path:?} is corrupted ({reason}); move or repair it before running again")]
    Corrupted {
        /// Ledger file.
        path: PathBuf,
        /// Parser or validation message.
        reason: String,
    },
    /// A record with this identifier is already persisted.
    #[error("identifier {0:?} is already recorded in the ledger")]
    DuplicateIdentifier(String),
    /// Records must carry a non-empty identifier.
    #[error("ledger records require a non-empty identifier")]
    EmptyIdentifier,
    /// Reading or rewriting the document failed.
    #[error("ledger io error at {path:?}: {source}")]
    Io {
        /// File or directory involved.
        path: PathBuf,
        /// Underlying error.
        #[source]
        source: io::Error,
    },
    /// The in-memory records could not be encoded.
    #[error("failed to encode ledger document: {0}")]
    Encode(#[from] serde_json::Error),
}

impl LedgerError {
    fn io(path: &Path, source: io::Error) -> Self {
        Self::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// Identifier-indexed record store backed by one JSON document.
#[derive(Debug)]
pub struct Ledger {
    path: PathBuf,
    records: Vec<LedgerRecord>,
    identifiers: HashSet<String>,
}

impl Ledger {
    /// Loads the ledger at `path`; a missing file yields an empty ledger.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self, LedgerError> {
        let path = path.into();
        let records = match fs::read_to_string(&path) {
            Ok(raw) => parse_document(&path, &raw)?,
            Err(err) if err.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(err) => return Err(LedgerError::io(&path, err)),
        };

        let mut identifiers = HashSet::with_capacity(records.len());
        for record in &records {
            if record.identifier.is_empty() {
                return Err(LedgerError::Corrupted {
                    path,
                    reason: "record with empty task_id".to_string(),
                });
            }
            if !identifiers.insert(record.identifier.clone()) {
                return Err(LedgerError::Corrupted {
                    path,
                    reason: format!("task_id {:?} appears more than once", record.identifier),
                });
            }
        }

        tracing::debug!(path = ?path, records = records.len(), "ledger loaded");
        Ok(Self {
            path,
            records,
            identifiers,
        })
    }

    /// Location of the persisted document.
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// True iff a record with `identifier` is persisted.
    pub fn contains(&self, identifier: &str) -> bool {
        self.identifiers.contains(identifier)
    }

    /// Records in capture order.
    pub fn records(&self) -> &[LedgerRecord] {
        &self.records
    }

    /// Number of persisted records.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// True when nothing has been captured yet.
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    /// Adds `record` and rewrites the document.
    ///
    /// The identifier is re-validated even though callers check [`Ledger::contains`] first.
    /// When the rewrite fails the in-memory state is left exactly as it was.
    pub fn append(&mut self, record: LedgerRecord) -> Result<(), LedgerError> {
        if record.identifier.is_empty() {
            return Err(LedgerError::EmptyIdentifier);
        }
        if self.contains(&record.identifier) {
            return Err(LedgerError::DuplicateIdentifier(record.identifier));
        }

        let identifier = record.identifier.clone();
        self.records.push(record);
        if let Err(err) = self.flush() {
            self.records.pop();
            return Err(err);
        }
        self.identifiers.insert(identifier);
        Ok(())
    }

    fn flush(&self) -> Result<(), LedgerError> {
        stage_document(&self.path, &self.records)?.commit(&self.path)
    }
}

fn parse_document(path: &Path, raw: &str) -> Result<Vec<LedgerRecord>, LedgerError> {
    serde_json::from_str(raw).map_err(|err| LedgerError::Corrupted {
        path: path.to_path_buf(),
        reason: err.to_string(),
    })
}

/// A fully written replacement document that has not been swapped in yet.
struct StagedDocument {
    file: NamedTempFile,
}

impl StagedDocument {
    fn commit(self, target: &Path) -> Result<(), LedgerError> {
        self.file
            .persist(target)
            .map(|_| ())
            .map_err(|err| LedgerError::io(target, err.error))
    }
}

fn stage_document(target: &Path, records: &[LedgerRecord]) -> Result<StagedDocument, LedgerError> {
    let dir = match target.parent() {
        Some(parent) if !parent.as_os_str().is_empty() => parent,
        _ => Path::new("."),
    };
    fs::create_dir_all(dir).map_err(|err| LedgerError::io(dir, err))?;

    let encoded = serde_json::to_vec_pretty(records)?;
    let mut file = NamedTempFile::new_in(dir).map_err(|err| LedgerError::io(dir, err))?;
    file.write_all(&encoded)
        .and_then(|_| file.as_file().sync_all())
        .map_err(|err| LedgerError::io(file.path(), err))?;
    Ok(StagedDocument { file })
}
