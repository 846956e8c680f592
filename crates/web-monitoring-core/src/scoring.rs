//! Priority scoring strategies.
//!
//! Triage hands each unprocessed [`Diff`] (with its payload loaded) to a
//! [`Scorer`] and records the returned [`Priority`]. Scorers must be pure:
//! the same Diff content always yields the same priority and scoring has no
//! side effects.
//!
//! Built-in scorers:
//! - [`ConstantScorer`]: every Diff gets the same priority.
//! - [`ChangeSizeScorer`]: fraction of characters inserted or deleted,
//!   read from a PageFreezer-style `output.diffs` payload.

use serde_json::Value;

use crate::error::{Error, Result};
use crate::models::{Diff, Priority};

pub trait Scorer: Send + Sync {
    /// Identifier used in logs and error messages.
    fn name(&self) -> &str;

    /// Compute the review priority of a Diff whose `content` is loaded.
    fn score(&self, diff: &Diff) -> Result<Priority>;
}

/// Assigns the same priority to every Diff.
pub struct ConstantScorer {
    value: Priority,
}

impl ConstantScorer {
    pub fn new(value: Priority) -> Self {
        Self { value }
    }
}

impl Scorer for ConstantScorer {
    fn name(&self) -> &str {
        "constant"
    }

    fn score(&self, _diff: &Diff) -> Result<Priority> {
        Ok(self.value)
    }
}

/// Scores a Diff by the share of its text that changed, in `[0.0, 1.0]`.
///
/// The payload is expected to carry a list of `[op, text]` pairs, either at
/// `output.diffs` (the full diffing-service response) or at the top level.
/// `op` is `-1` for deletions, `0` for unchanged text, and `1` for
/// insertions.
pub struct ChangeSizeScorer;

impl ChangeSizeScorer {
    fn fail(&self, diff: &Diff, message: impl Into<String>) -> Error {
        Error::Scoring {
            scorer: self.name().to_string(),
            diff: diff.uuid,
            message: message.into(),
        }
    }
}

impl Scorer for ChangeSizeScorer {
    fn name(&self) -> &str {
        "change_size"
    }

    fn score(&self, diff: &Diff) -> Result<Priority> {
        let content = diff
            .content
            .as_ref()
            .ok_or_else(|| self.fail(diff, "diff payload not loaded"))?;
        let ops = diff_ops(content).ok_or_else(|| self.fail(diff, "payload has no diffs list"))?;

        let mut changed = 0usize;
        let mut total = 0usize;
        for op in ops {
            let (kind, text) = match op.as_array().map(Vec::as_slice) {
                Some([kind, text]) => (kind.as_i64(), text.as_str()),
                _ => return Err(self.fail(diff, format!("malformed diff entry: {}", op))),
            };
            let (Some(kind), Some(text)) = (kind, text) else {
                return Err(self.fail(diff, format!("malformed diff entry: {}", op)));
            };
            let len = text.chars().count();
            total += len;
            if kind != 0 {
                changed += len;
            }
        }

        if total == 0 {
            return Ok(0.0);
        }
        Ok(changed as f64 / total as f64)
    }
}

fn diff_ops(content: &Value) -> Option<&Vec<Value>> {
    content
        .pointer("/output/diffs")
        .and_then(Value::as_array)
        .or_else(|| content.as_array())
}
