//! Core data models.
//!
//! A [`Page`] owns a chronological series of [`Version`]s. The diff
//! pipeline turns each consecutive pair into a [`Diff`], triage assigns the
//! Diff a [`Priority`], and reviewers attach [`Annotation`]s to it.
//!
//! The `New*` types are insert requests: `uuid` is normally `None` and the
//! store generates one.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

/// Review urgency assigned by a [`Scorer`](crate::scoring::Scorer). Higher
/// values are reviewed first.
pub type Priority = f64;

/// A monitored URL.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Page {
    pub uuid: Uuid,
    pub url: String,
    pub title: String,
    pub agency: String,
    pub site: String,
}

#[derive(Debug, Clone, Default)]
pub struct NewPage {
    pub uuid: Option<Uuid>,
    pub url: String,
    pub title: String,
    pub agency: String,
    pub site: String,
}

/// One timestamped capture of a Page.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Version {
    pub uuid: Uuid,
    pub page_uuid: Uuid,
    pub capture_time: DateTime<Utc>,
    /// Location of the raw captured bytes (a filesystem path).
    pub uri: String,
    /// SHA-256 hex digest of the raw bytes.
    pub version_hash: String,
    pub source_type: String,
    pub source_metadata: serde_json::Value,
}

impl Version {
    /// Total order of Versions within a Page. Equal capture times are
    /// broken by uuid so every Version has at most one predecessor.
    pub fn ordering_key(&self) -> (DateTime<Utc>, Uuid) {
        (self.capture_time, self.uuid)
    }
}

#[derive(Debug, Clone)]
pub struct NewVersion {
    pub uuid: Option<Uuid>,
    pub page_uuid: Uuid,
    pub capture_time: DateTime<Utc>,
    pub uri: String,
    pub version_hash: String,
    pub source_type: String,
    pub source_metadata: serde_json::Value,
}

/// The persisted record of a Change between two Versions of one Page.
///
/// `content` is never stored inline: stores return it as `None` and the
/// payload store fills it from `uri` on demand.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Diff {
    pub uuid: Uuid,
    pub version_from: Uuid,
    pub version_to: Uuid,
    pub diffhash: String,
    pub uri: String,
    pub source_type: String,
    pub source_metadata: serde_json::Value,
    pub priority: Option<Priority>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<serde_json::Value>,
}

#[derive(Debug, Clone)]
pub struct NewDiff {
    pub uuid: Option<Uuid>,
    pub version_from: Uuid,
    pub version_to: Uuid,
    pub diffhash: String,
    pub uri: String,
    pub source_type: String,
    pub source_metadata: serde_json::Value,
}

/// Result of [`Store::insert_diff`](crate::store::Store::insert_diff).
///
/// Inserting a second Diff for an existing (version_from, version_to) pair
/// is not an error; the store hands back the Diff already on record.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiffInsert {
    Created(Uuid),
    Existing(Uuid),
}

impl DiffInsert {
    pub fn uuid(&self) -> Uuid {
        match self {
            DiffInsert::Created(id) | DiffInsert::Existing(id) => *id,
        }
    }

    pub fn is_created(&self) -> bool {
        matches!(self, DiffInsert::Created(_))
    }
}

/// A reviewer's note on a Diff. Append-only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Annotation {
    pub uuid: Uuid,
    pub diff_uuid: Uuid,
    pub author: String,
    pub content: serde_json::Value,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewAnnotation {
    pub uuid: Option<Uuid>,
    pub diff_uuid: Uuid,
    pub author: String,
    pub content: serde_json::Value,
}

/// Why a Version left the unprocessed queue without producing a Diff, or
/// why it was pushed to the back of it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum VersionOutcome {
    /// Oldest Version of its Page. Cleared when an older Version arrives.
    NoAncestor,
    /// Diff-service attempts were exhausted; try again after fresh work.
    Retry { reason: String },
    /// Requeue budget spent; excluded until explicitly requeued.
    DeadLetter { reason: String },
}

impl VersionOutcome {
    pub fn status(&self) -> &'static str {
        match self {
            VersionOutcome::NoAncestor => "no_ancestor",
            VersionOutcome::Retry { .. } => "retry",
            VersionOutcome::DeadLetter { .. } => "dead_letter",
        }
    }

    pub fn reason(&self) -> &str {
        match self {
            VersionOutcome::NoAncestor => "no ancestor",
            VersionOutcome::Retry { reason } | VersionOutcome::DeadLetter { reason } => reason,
        }
    }
}

/// A dead-lettered Version awaiting operator attention.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeadLetter {
    pub version_uuid: Uuid,
    pub reason: String,
    pub attempts: u32,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    pub pages: u64,
    pub versions: u64,
    pub diffs: u64,
    pub annotations: u64,
    pub unprocessed_versions: u64,
    pub unprocessed_diffs: u64,
    pub no_ancestor: u64,
    pub dead_letters: u64,
}

/// Lowercase hex SHA-256 of `bytes`.
pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
