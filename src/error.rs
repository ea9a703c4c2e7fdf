//! Error types shared by the data store, cache and expression loader.

use thiserror::Error;

/// Failures reading a document from the data store.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("HTTP request for {url} failed: {source}")]
    Http {
        url: String,
        #[source]
        source: reqwest::Error,
    },

    #[error("{url} returned status {status}")]
    Status { url: String, status: u16 },

    #[error("malformed JSON in {path}: {source}")]
    Json {
        path: String,
        #[source]
        source: serde_json::Error,
    },
}

impl StoreError {
    /// True when the document simply does not exist (404 or missing file).
    pub fn is_not_found(&self) -> bool {
        match self {
            StoreError::Io { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            StoreError::Status { status, .. } => *status == 404,
            _ => false,
        }
    }
}

/// Errors surfaced by dataset and expression loading.
#[derive(Debug, Error)]
pub enum LoadError {
    /// A required per-strain metadata document failed or was malformed.
    #[error("failed to load {document}: {reason}")]
    MetadataFetch { document: String, reason: String },

    /// A single gene row could not be fetched.
    #[error("failed to fetch gene {index}: {reason}")]
    GeneFetch { index: usize, reason: String },

    /// Every uncached gene of a batch failed.
    #[error("all gene fetches failed: {failed_indices:?}")]
    AllFetchesFailed { failed_indices: Vec<usize> },

    /// The remote array returned a payload that is not a numeric row.
    #[error("decode error: {0}")]
    Decode(String),

    #[error("invalid input: {0}")]
    InvalidInput(String),
}

impl LoadError {
    pub fn metadata(document: impl Into<String>, reason: impl ToString) -> Self {
        LoadError::MetadataFetch {
            document: document.into(),
            reason: reason.to_string(),
        }
    }

    pub fn gene(index: usize, reason: impl ToString) -> Self {
        LoadError::GeneFetch {
            index,
            reason: reason.to_string(),
        }
    }
}

/// Persistent cache failures. Never propagated past the loader.
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("cache I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("corrupt cache entry: {0}")]
    Corrupt(String),

    #[error("cache task failed: {0}")]
    Task(String),
}

pub type Result<T> = std::result::Result<T, LoadError>;
