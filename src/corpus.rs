//! Corpus and query-workload text sources
//!
//! Downloading datasets from remote hubs is a collaborator concern; this
//! module only reads the cached files such a loader leaves behind and turns
//! them into ordered text sets. Corpus order defines doc-ids, workload
//! order defines query-ids.

use std::path::Path;

use serde::Deserialize;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum CorpusError {
    #[error("IO error reading {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
    #[error("malformed JSON in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("{path} contains no texts")]
    Empty { path: String },
}

/// An ordered, identified collection of texts.
///
/// Used for both corpora (position = doc-id) and query workloads
/// (position = query-id).
#[derive(Debug, Clone)]
pub struct TextSet {
    /// Stable identifier, part of the persistence key for derived blobs.
    pub id: String,
    pub texts: Vec<String>,
}

/// Cached corpus file shape: `{"text": ["...", ...]}`.
#[derive(Deserialize)]
struct CorpusFile {
    text: Vec<String>,
}

/// Cached query file shape: `[{"question": "..."}, ...]`.
#[derive(Deserialize)]
struct QueryRecord {
    question: String,
}

impl TextSet {
    pub fn new(id: impl Into<String>, texts: Vec<String>) -> Self {
        Self {
            id: id.into(),
            texts,
        }
    }

    /// Load a cached corpus JSON file of the form `{"text": [...]}`.
    pub fn from_corpus_json(id: impl Into<String>, path: &Path) -> Result<Self, CorpusError> {
        let raw = read(path)?;
        let file: CorpusFile = serde_json::from_str(&raw).map_err(|source| CorpusError::Json {
            path: path.display().to_string(),
            source,
        })?;
        Self::non_empty(id, file.text, path)
    }

    /// Load a cached query-set JSON file of the form `[{"question": ...}]`.
    pub fn from_query_json(id: impl Into<String>, path: &Path) -> Result<Self, CorpusError> {
        let raw = read(path)?;
        let records: Vec<QueryRecord> =
            serde_json::from_str(&raw).map_err(|source| CorpusError::Json {
                path: path.display().to_string(),
                source,
            })?;
        Self::non_empty(id, records.into_iter().map(|r| r.question).collect(), path)
    }

    /// Load a plain text file, one text per non-empty line.
    pub fn from_lines(id: impl Into<String>, path: &Path) -> Result<Self, CorpusError> {
        let raw = read(path)?;
        let texts: Vec<String> = raw
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(str::to_string)
            .collect();
        Self::non_empty(id, texts, path)
    }

    fn non_empty(
        id: impl Into<String>,
        texts: Vec<String>,
        path: &Path,
    ) -> Result<Self, CorpusError> {
        if texts.is_empty() {
            return Err(CorpusError::Empty {
                path: path.display().to_string(),
            });
        }
        let set = Self::new(id, texts);
        tracing::info!(id = %set.id, texts = set.texts.len(), "Loaded text set");
        Ok(set)
    }

    pub fn len(&self) -> usize {
        self.texts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.texts.is_empty()
    }

    /// Borrowed view of the texts, the shape embedders consume.
    pub fn as_strs(&self) -> Vec<&str> {
        self.texts.iter().map(String::as_str).collect()
    }
}

fn read(path: &Path) -> Result<String, CorpusError> {
    std::fs::read_to_string(path).map_err(|source| CorpusError::Io {
        path: path.display().to_string(),
        source,
    })
}
