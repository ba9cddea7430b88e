use std::path::PathBuf;

use thiserror::Error;

pub type Result<T> = std::result::Result<T, MirrorError>;

/// Everything that can abort a mirror run.
///
/// Transient network failures are retried inside the client; the variant here
/// is what surfaces once the retry budget is exhausted. All other variants
/// abort the run immediately without advancing the trusted STH.
#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("network failure after {attempts} attempts against {url}: {reason}")]
    TransientNetwork {
        url: String,
        attempts: u32,
        reason: String,
    },

    #[error("log rejected request with status {status}: {url}")]
    HttpClient { status: u16, url: String },

    #[error("entry {index}: {reason}")]
    Decode { index: u64, reason: String },

    #[error("tree head signature rejected: {0}")]
    SignatureInvalid(String),

    #[error("consistency proof between sizes {first} and {second} rejected: {reason}")]
    ConsistencyProofFailed {
        first: u64,
        second: u64,
        reason: String,
    },

    #[error("recomputed root {computed} does not match signed root {expected} at tree size {tree_size}")]
    RootMismatch {
        tree_size: u64,
        expected: String,
        computed: String,
    },

    #[error("log reported tree size {new}, below the trusted size {trusted}")]
    TreeSizeRegression { trusted: u64, new: u64 },

    #[error("archive I/O failure")]
    Disk(#[from] std::io::Error),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("log {0} is not in the known-logs list")]
    UnknownLog(String),

    #[error("archive at {0} is locked by another run")]
    ArchiveLocked(PathBuf),

    #[error("run cancelled")]
    Cancelled,
}

impl MirrorError {
    pub fn decode(index: u64, reason: impl Into<String>) -> Self {
        Self::Decode {
            index,
            reason: reason.into(),
        }
    }
}
