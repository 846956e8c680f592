//! Error taxonomy shared by the store, the pipelines, and the HTTP API.
//!
//! | Variant | Handling |
//! |---------|----------|
//! | [`Error::NotFound`] | keyed lookup miss, surfaced to the caller |
//! | [`Error::DuplicateKey`] | caller-supplied uuid collided |
//! | [`Error::NoAncestor`] | oldest Version of a Page; the diff pipeline records it and moves on |
//! | [`Error::DiffService`] | transient; retried with backoff, then requeued or dead-lettered |
//! | [`Error::CaptureRead`] | bad capture file; only that ingestion is aborted |
//! | [`Error::Scoring`] | scorer failure; the Diff stays unprocessed |
//! | [`Error::Storage`] | store unavailable; fatal for the whole run |

use std::path::PathBuf;

use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{kind} not found: {id}")]
    NotFound { kind: &'static str, id: String },

    #[error("duplicate {kind} key: {id}")]
    DuplicateKey { kind: &'static str, id: String },

    #[error("version {version} has no ancestor")]
    NoAncestor { version: Uuid },

    #[error("diff service failed after {attempts} attempt(s): {message}")]
    DiffService { attempts: u32, message: String },

    #[error("cannot read capture {}: {reason}", path.display())]
    CaptureRead { path: PathBuf, reason: String },

    #[error("scorer '{scorer}' failed on diff {diff}: {message}")]
    Scoring {
        scorer: String,
        diff: Uuid,
        message: String,
    },

    #[error("versions {from} and {to} belong to different pages")]
    PageMismatch { from: Uuid, to: Uuid },

    #[error("{0}")]
    QueueEmpty(String),

    #[error("diff payload error at {uri}: {reason}")]
    Payload { uri: String, reason: String },

    #[error("storage error: {0}")]
    Storage(#[source] Box<dyn std::error::Error + Send + Sync>),
}

impl Error {
    pub fn not_found(kind: &'static str, id: impl ToString) -> Self {
        Error::NotFound {
            kind,
            id: id.to_string(),
        }
    }

    /// Wrap a backend error (sqlx, I/O on the database file, ...) as a
    /// storage failure.
    pub fn storage<E>(err: E) -> Self
    where
        E: std::error::Error + Send + Sync + 'static,
    {
        Error::Storage(Box::new(err))
    }

    /// Only storage unavailability aborts a pipeline run; every other
    /// variant is handled per item.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Error::Storage(_))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound { .. })
    }
}
