//! Priority triage.
//!
//! Loads each unprioritized Diff's payload, hands it to the configured
//! [`Scorer`], and records the result. A scoring failure is logged and the
//! Diff stays unprioritized for a later run.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use anyhow::bail;
use serde::Serialize;
use tokio::task::JoinSet;
use web_monitoring_core::models::{Diff, Priority};
use web_monitoring_core::scoring::{ChangeSizeScorer, ConstantScorer, Scorer};
use web_monitoring_core::store::Store;
use web_monitoring_core::{Error, Result};

use crate::config::{Config, TriageConfig};
use crate::db;
use crate::payload::PayloadStore;
use crate::queue::{Budget, ClaimSet, DiffQueue, Pop};
use crate::sqlite_store::SqliteStore;

/// Build the scorer named in `[triage]`.
///
/// | `scorer` | Implementation |
/// |----------|----------------|
/// | `"constant"` | [`ConstantScorer`] with `constant` |
/// | `"change_size"` | [`ChangeSizeScorer`] |
pub fn create_scorer(config: &TriageConfig) -> anyhow::Result<Arc<dyn Scorer>> {
    match config.scorer.as_str() {
        "constant" => Ok(Arc::new(ConstantScorer::new(config.constant))),
        "change_size" => Ok(Arc::new(ChangeSizeScorer)),
        other => bail!("Unknown triage scorer: {}", other),
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Triaged {
    Scored(Priority),
    /// Another writer set the priority first.
    AlreadySet,
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct TriageReport {
    pub scored: usize,
    pub already_set: usize,
    pub failed: usize,
}

#[derive(Clone)]
pub struct Triage {
    store: Arc<dyn Store>,
    scorer: Arc<dyn Scorer>,
    payloads: PayloadStore,
    workers: usize,
}

impl Triage {
    pub fn new(store: Arc<dyn Store>, scorer: Arc<dyn Scorer>, payloads: PayloadStore) -> Self {
        Self {
            store,
            scorer,
            payloads,
            workers: 1,
        }
    }

    pub fn from_config(config: &Config, store: Arc<dyn Store>) -> anyhow::Result<Self> {
        Ok(Self::new(
            store,
            create_scorer(&config.triage)?,
            PayloadStore::new(&config.storage.payload_dir),
        )
        .with_workers(config.pipeline.workers))
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    pub fn scorer(&self) -> &dyn Scorer {
        self.scorer.as_ref()
    }

    /// Score one Diff and record its priority.
    pub async fn process_diff(&self, diff: Diff) -> Result<Triaged> {
        let id = diff.uuid;
        let diff = self.payloads.load_content(diff).await?;
        let priority = self.scorer.score(&diff)?;
        if !priority.is_finite() {
            return Err(Error::Scoring {
                scorer: self.scorer.name().to_string(),
                diff: id,
                message: format!("non-finite priority {}", priority),
            });
        }

        if self.store.set_priority(id, priority).await? {
            tracing::debug!(diff = %id, priority, scorer = self.scorer.name(), "scored diff");
            Ok(Triaged::Scored(priority))
        } else {
            Ok(Triaged::AlreadySet)
        }
    }

    /// Score every unprioritized Diff, at most `limit` of them.
    pub async fn run(&self, limit: Option<usize>) -> Result<TriageReport> {
        let queue = Arc::new(DiffQueue::new(Arc::clone(&self.store), ClaimSet::new()));
        let report = Arc::new(Mutex::new(TriageReport::default()));
        let budget = Arc::new(Budget::new(limit));

        let mut workers = JoinSet::new();
        for _ in 0..self.workers {
            let this = self.clone();
            let queue = Arc::clone(&queue);
            let report = Arc::clone(&report);
            let budget = Arc::clone(&budget);
            workers.spawn(async move { this.work(&queue, &report, &budget).await });
        }

        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined.map_err(Error::storage).and_then(|r| r) {
                workers.abort_all();
                return Err(e);
            }
        }

        let report = report
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        tracing::info!(
            scorer = self.scorer.name(),
            scored = report.scored,
            failed = report.failed,
            "triage run complete"
        );
        Ok(report)
    }

    async fn work(
        &self,
        queue: &DiffQueue,
        report: &Mutex<TriageReport>,
        budget: &Budget,
    ) -> Result<()> {
        loop {
            if !budget.take() {
                return Ok(());
            }
            let item = match queue.pop().await? {
                Pop::Item(item) => item,
                Pop::Busy => {
                    budget.give_back();
                    queue.claims().wait_release(Duration::from_millis(100)).await;
                    continue;
                }
                Pop::Empty => return Ok(()),
            };

            let id = item.diff.uuid;
            let outcome = self.process_diff(item.diff).await;
            drop(item.claim);

            let mut report = report.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            match outcome {
                Ok(Triaged::Scored(_)) => report.scored += 1,
                Ok(Triaged::AlreadySet) => report.already_set += 1,
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(diff = %id, error = %e, "triage failed, diff left unprioritized");
                }
            }
        }
    }
}

/// CLI entry point for `wm triage`.
pub async fn run_triage(config: &Config, limit: Option<usize>) -> anyhow::Result<()> {
    let store = Arc::new(SqliteStore::new(db::connect(config).await?));
    let triage = Triage::from_config(config, store.clone())?;

    let report = triage.run(limit).await?;

    println!("triage ({})", triage.scorer().name());
    println!("  scored: {}", report.scored);
    if report.already_set > 0 {
        println!("  already scored: {}", report.already_set);
    }
    println!("  failed: {}", report.failed);
    println!("ok");

    store.close().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn creates_configured_scorer() {
        let constant = create_scorer(&TriageConfig {
            scorer: "constant".into(),
            constant: 0.5,
        })
        .unwrap();
        assert_eq!(constant.name(), "constant");

        let size = create_scorer(&TriageConfig {
            scorer: "change_size".into(),
            constant: 0.0,
        })
        .unwrap();
        assert_eq!(size.name(), "change_size");

        assert!(create_scorer(&TriageConfig {
            scorer: "oracle".into(),
            constant: 0.0,
        })
        .is_err());
    }
}
