//! Error taxonomy for the archive engine.
//!
//! Single-file failures during a batch import never abort the batch; they
//! surface in the per-file outcome list. Integrity and reconcile-policy
//! failures are always surfaced to the operator.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ArchiveError {
    /// Source file could not be read. Retried with backoff up to a bounded
    /// count by the ingest pipeline, then the file is skipped.
    #[error("unreadable source {path}: {source}")]
    IoFailure {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Codec cannot be decoded for perceptual fingerprinting. The file is
    /// still exact-hashed and stored, but excluded from similarity matching.
    #[error("unsupported format {path}: {detail}")]
    UnsupportedFormat { path: PathBuf, detail: String },

    /// Stored bytes fail fingerprint verification on read. Fatal for the
    /// affected tier operation; never auto-repaired.
    #[error("integrity violation at {path}: expected {expected}, found {actual}")]
    IntegrityViolation {
        path: PathBuf,
        expected: String,
        actual: String,
    },

    /// Reconcile policy misconfiguration. Fatal at startup validation.
    #[error("reconcile policy conflict: {0}")]
    ReconcileConflict(String),

    /// Failed to acquire a per-fingerprint or per-group lock within the
    /// configured bound.
    #[error("timed out acquiring lock for {key}")]
    ConcurrencyTimeout { key: String },

    /// Sidecar document could not be parsed.
    #[error("malformed sidecar {path}: {source}")]
    MalformedSidecar {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("record not found for fingerprint {0}")]
    RecordNotFound(String),

    /// Caller-supplied text failed to parse into a domain value.
    #[error("invalid {what}: {value}")]
    InvalidValue { what: &'static str, value: String },

    #[error(transparent)]
    Database(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ArchiveError {
    pub fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        Self::IoFailure {
            path: path.into(),
            source,
        }
    }

    pub fn unsupported(path: impl Into<PathBuf>, detail: impl Into<String>) -> Self {
        Self::UnsupportedFormat {
            path: path.into(),
            detail: detail.into(),
        }
    }

    /// Whether a retry could plausibly succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::IoFailure { .. } | Self::ConcurrencyTimeout { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, ArchiveError>;
