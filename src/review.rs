//! Review checkout.
//!
//! Hands reviewers prioritized Diffs, highest priority first, making sure
//! no two reviewers hold the same Diff. Each reviewer holds at most one
//! Diff. Checkouts are in-process state owned by the server; they are not
//! persisted and a restart releases them all.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::Mutex;
use uuid::Uuid;
use web_monitoring_core::models::Diff;
use web_monitoring_core::store::Store;
use web_monitoring_core::{Error, Result};

use crate::config::Config;
use crate::db;
use crate::sqlite_store::SqliteStore;

/// Ranked Diffs scanned per `checkout_next`.
const SCAN_LIMIT: usize = 1000;

pub struct ReviewQueue {
    store: Arc<dyn Store>,
    /// reviewer -> Diff
    checked_out: Mutex<HashMap<String, Uuid>>,
}

impl ReviewQueue {
    pub fn new(store: Arc<dyn Store>) -> Self {
        Self {
            store,
            checked_out: Mutex::new(HashMap::new()),
        }
    }

    /// Check out the highest-priority Diff nobody holds.
    ///
    /// Fails with [`Error::QueueEmpty`] when every prioritized Diff is
    /// checked out or none exist.
    pub async fn checkout_next(&self, user: &str) -> Result<Diff> {
        let mut checked_out = self.checked_out.lock().await;
        let ranked = self.store.ranked_diffs(SCAN_LIMIT).await?;

        let next = ranked
            .into_iter()
            .find(|diff| !checked_out.values().any(|held| *held == diff.uuid));
        match next {
            Some(diff) => {
                checked_out.insert(user.to_string(), diff.uuid);
                tracing::debug!(user, diff = %diff.uuid, "checked out diff");
                Ok(diff)
            }
            None => Err(Error::QueueEmpty(
                "All work is complete or checked out.".into(),
            )),
        }
    }

    /// Check out a specific Diff, releasing whatever `user` held before.
    pub async fn checkout(&self, user: &str, diff: Uuid) -> Result<Diff> {
        let found = self.store.get_diff(diff).await?;
        let mut checked_out = self.checked_out.lock().await;
        checked_out.insert(user.to_string(), diff);
        Ok(found)
    }

    /// Release `user`'s Diff without marking it reviewed.
    pub async fn checkin(&self, user: &str) -> Result<Uuid> {
        self.checked_out
            .lock()
            .await
            .remove(user)
            .ok_or_else(|| Error::not_found("checkout", user))
    }

    pub async fn held_by(&self, user: &str) -> Option<Uuid> {
        self.checked_out.lock().await.get(user).copied()
    }
}

/// CLI entry point for `wm queue`: the ranked review queue.
pub async fn run_queue(config: &Config, limit: usize) -> anyhow::Result<()> {
    let store = SqliteStore::new(db::connect(config).await?);
    let ranked = store.ranked_diffs(limit).await?;

    if ranked.is_empty() {
        println!("Review queue is empty.");
    } else {
        println!("  {:>8}  {:<36}  {}", "PRIORITY", "DIFF", "CHANGE");
        println!("  {}", "-".repeat(76));
        for diff in &ranked {
            println!(
                "  {:>8.4}  {:<36}  {} -> {}",
                diff.priority.unwrap_or_default(),
                diff.uuid,
                diff.version_from,
                diff.version_to
            );
        }
    }

    store.close().await;
    Ok(())
}
