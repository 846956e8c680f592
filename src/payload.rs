//! Content-addressed storage for diff payloads.
//!
//! Every diffing-service response is written once to
//! `{payload_dir}/{hash[0..2]}/{hash}.json`, keyed by its diffhash. Two
//! Diffs that produced identical output share one file. The path is
//! recorded as the Diff's `uri`, and triage reads it back to score.

use std::path::{Path, PathBuf};

use serde_json::Value;
use web_monitoring_core::models::Diff;
use web_monitoring_core::{Error, Result};

/// Shortest diffhash accepted as a file key.
const MIN_HASH_LEN: usize = 8;

#[derive(Debug, Clone)]
pub struct PayloadStore {
    root: PathBuf,
}

impl PayloadStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Path a payload with this hash is stored at.
    pub fn path_for(&self, diffhash: &str) -> Result<PathBuf> {
        if diffhash.len() < MIN_HASH_LEN || !diffhash.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(Error::Payload {
                uri: diffhash.to_string(),
                reason: "diffhash must be at least 8 hex characters".into(),
            });
        }
        Ok(self
            .root
            .join(&diffhash[..2])
            .join(format!("{}.json", diffhash)))
    }

    /// Store `bytes` under `diffhash` and return its uri.
    ///
    /// An existing file is never rewritten. New files are written to a
    /// temporary sibling and renamed into place so a reader never sees a
    /// partial payload.
    pub async fn write(&self, diffhash: &str, bytes: &[u8]) -> Result<String> {
        let path = self.path_for(diffhash)?;
        let uri = path.display().to_string();

        if tokio::fs::try_exists(&path).await.unwrap_or(false) {
            return Ok(uri);
        }

        let fail = |e: std::io::Error| Error::Payload {
            uri: uri.clone(),
            reason: e.to_string(),
        };

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(fail)?;
        }
        let tmp = path.with_extension(format!("json.{}.tmp", uuid::Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, bytes).await.map_err(fail)?;
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            let _ = tokio::fs::remove_file(&tmp).await;
            return Err(fail(e));
        }

        tracing::debug!(diffhash, uri = %uri, bytes = bytes.len(), "stored diff payload");
        Ok(uri)
    }

    /// Read and parse a stored payload.
    pub async fn read(&self, uri: &str) -> Result<Value> {
        let bytes = tokio::fs::read(uri).await.map_err(|e| Error::Payload {
            uri: uri.to_string(),
            reason: e.to_string(),
        })?;
        serde_json::from_slice(&bytes).map_err(|e| Error::Payload {
            uri: uri.to_string(),
            reason: format!("invalid JSON: {}", e),
        })
    }

    /// Attach the stored payload to `diff.content`.
    pub async fn load_content(&self, mut diff: Diff) -> Result<Diff> {
        diff.content = Some(self.read(&diff.uri).await?);
        Ok(diff)
    }
}
