//! Diff pipeline.
//!
//! Pops unprocessed Versions, diffs each against its immediate predecessor
//! through the [`DiffService`], stores the payload, and records the Diff.
//!
//! # Per-Version Flow
//!
//! ```text
//! predecessor? ──no──▶ record no_ancestor, skip
//!      │yes
//! Diff for (pred, v) exists? ──yes──▶ done (idempotent re-run)
//!      │no
//! compare_with_retry ──exhausted──▶ record retry, or dead_letter at requeue_limit
//!      │ok
//! write payload ──▶ insert Diff (Existing if a racer won)
//! ```
//!
//! # Concurrency
//!
//! [`DiffPipeline::run`] spawns `workers` tasks sharing one
//! [`VersionQueue`]. Claims are per Page, so Versions of different Pages
//! are diffed in parallel while each Page's predecessor is read from
//! current state. Only [`Error::Storage`] aborts a run; every other
//! failure is recorded against its Version and the workers move on.
//! Cancelling a run mid-call leaves no partial Diff: the Diff row is the
//! last thing written.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinSet;
use uuid::Uuid;
use web_monitoring_core::models::{DiffInsert, NewDiff, Version, VersionOutcome};
use web_monitoring_core::store::Store;
use web_monitoring_core::{Error, Result};

use crate::config::Config;
use crate::db;
use crate::diff_service::{compare_with_retry, DiffService, HttpDiffService, RetryPolicy};
use crate::payload::PayloadStore;
use crate::queue::{Budget, ClaimSet, Pop, VersionQueue};
use crate::sqlite_store::SqliteStore;

/// What happened to one popped Version.
#[derive(Debug, Clone, PartialEq)]
pub enum Processed {
    Created { diff: Uuid },
    /// A Diff for this pair already existed; nothing was written.
    Existing { diff: Uuid },
    NoAncestor,
    Requeued { attempts: u32, reason: String },
    DeadLettered { attempts: u32, reason: String },
}

#[derive(Debug, Default, Clone, PartialEq, Eq, Serialize)]
pub struct RunReport {
    pub processed: usize,
    pub created: usize,
    pub existing: usize,
    pub no_ancestor: usize,
    pub requeued: usize,
    pub dead_lettered: usize,
    /// Non-fatal errors outside the retry bookkeeping.
    pub failed: usize,
}

impl RunReport {
    fn record(&mut self, processed: &Processed) {
        self.processed += 1;
        match processed {
            Processed::Created { .. } => self.created += 1,
            Processed::Existing { .. } => self.existing += 1,
            Processed::NoAncestor => self.no_ancestor += 1,
            Processed::Requeued { .. } => self.requeued += 1,
            Processed::DeadLettered { .. } => self.dead_lettered += 1,
        }
    }
}

#[derive(Clone)]
pub struct DiffPipeline {
    store: Arc<dyn Store>,
    service: Arc<dyn DiffService>,
    payloads: PayloadStore,
    policy: RetryPolicy,
    requeue_limit: u32,
    workers: usize,
}

impl DiffPipeline {
    pub fn new(store: Arc<dyn Store>, service: Arc<dyn DiffService>, payloads: PayloadStore) -> Self {
        Self {
            store,
            service,
            payloads,
            policy: RetryPolicy::default(),
            requeue_limit: 3,
            workers: 4,
        }
    }

    pub fn from_config(
        config: &Config,
        store: Arc<dyn Store>,
        service: Arc<dyn DiffService>,
    ) -> Self {
        Self::new(store, service, PayloadStore::new(&config.storage.payload_dir))
            .with_policy(RetryPolicy::from_config(&config.diff_service))
            .with_requeue_limit(config.pipeline.requeue_limit)
            .with_workers(config.pipeline.workers)
    }

    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_requeue_limit(mut self, limit: u32) -> Self {
        self.requeue_limit = limit.max(1);
        self
    }

    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = workers.max(1);
        self
    }

    /// The immediate chronological predecessor of `version` in current
    /// store state, or [`Error::NoAncestor`].
    pub async fn find_ancestor(&self, version: &Version) -> Result<Version> {
        self.store
            .predecessor(version)
            .await?
            .ok_or(Error::NoAncestor {
                version: version.uuid,
            })
    }

    /// Diff one Version against its predecessor.
    ///
    /// The caller is expected to hold the Page's claim.
    pub async fn process_version(&self, version: &Version) -> Result<Processed> {
        let from = match self.find_ancestor(version).await {
            Ok(from) => from,
            Err(Error::NoAncestor { .. }) => {
                if self.store.record_no_ancestor(version.uuid).await? {
                    tracing::debug!(version = %version.uuid, "oldest version of page, skipped");
                    return Ok(Processed::NoAncestor);
                }
                // An older capture was ingested after the lookup.
                tracing::debug!(version = %version.uuid, "predecessor appeared, diffing");
                self.find_ancestor(version).await?
            }
            Err(e) => return Err(e),
        };

        if let Some(existing) = self.store.diff_for_pair(from.uuid, version.uuid).await? {
            return Ok(Processed::Existing {
                diff: existing.uuid,
            });
        }

        let result = match compare_with_retry(self.service.as_ref(), &self.policy, &from, version)
            .await
        {
            Ok(result) => result,
            Err(e @ Error::DiffService { .. }) => return self.requeue(version, e.to_string()).await,
            Err(e) => return Err(e),
        };

        let uri = match self.payloads.write(&result.diffhash, &result.payload).await {
            Ok(uri) => uri,
            Err(e @ Error::Payload { .. }) => return self.requeue(version, e.to_string()).await,
            Err(e) => return Err(e),
        };

        let inserted = self
            .store
            .insert_diff(&NewDiff {
                uuid: None,
                version_from: from.uuid,
                version_to: version.uuid,
                diffhash: result.diffhash.clone(),
                uri,
                source_type: self.service.source_type().to_string(),
                source_metadata: serde_json::json!({
                    "attempts": result.attempts,
                    "elapsed_ms": result.elapsed.as_millis() as u64,
                }),
            })
            .await?;

        Ok(match inserted {
            DiffInsert::Created(diff) => {
                tracing::info!(
                    diff = %diff,
                    from = %from.uuid,
                    to = %version.uuid,
                    diffhash = %result.diffhash,
                    "created diff"
                );
                Processed::Created { diff }
            }
            DiffInsert::Existing(diff) => Processed::Existing { diff },
        })
    }

    /// Send a failed Version to the back of the queue, or dead-letter it
    /// once it has failed `requeue_limit` pops.
    async fn requeue(&self, version: &Version, reason: String) -> Result<Processed> {
        let previous = self.store.version_attempts(version.uuid).await?;
        if previous + 1 >= self.requeue_limit {
            let attempts = self
                .store
                .record_outcome(
                    version.uuid,
                    &VersionOutcome::DeadLetter {
                        reason: reason.clone(),
                    },
                )
                .await?;
            tracing::warn!(version = %version.uuid, attempts, reason = %reason, "dead-lettered version");
            Ok(Processed::DeadLettered { attempts, reason })
        } else {
            let attempts = self
                .store
                .record_outcome(
                    version.uuid,
                    &VersionOutcome::Retry {
                        reason: reason.clone(),
                    },
                )
                .await?;
            tracing::warn!(version = %version.uuid, attempts, reason = %reason, "requeued version");
            Ok(Processed::Requeued { attempts, reason })
        }
    }

    /// Drain the unprocessed Version queue with a bounded worker pool.
    ///
    /// Each Version is popped at most once per run, so requeued Versions
    /// wait for the next run. `limit` caps the number of Versions popped.
    pub async fn run(&self, limit: Option<usize>) -> Result<RunReport> {
        let queue = Arc::new(VersionQueue::new(Arc::clone(&self.store), ClaimSet::new()));
        let report = Arc::new(Mutex::new(RunReport::default()));
        let budget = Arc::new(Budget::new(limit));

        let mut workers = JoinSet::new();
        for worker in 0..self.workers {
            let this = self.clone();
            let queue = Arc::clone(&queue);
            let report = Arc::clone(&report);
            let budget = Arc::clone(&budget);
            workers.spawn(async move { this.work(worker, &queue, &report, &budget).await });
        }

        while let Some(joined) = workers.join_next().await {
            let outcome = joined.map_err(Error::storage).and_then(|r| r);
            if let Err(e) = outcome {
                workers.abort_all();
                return Err(e);
            }
        }

        let report = report
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone();
        tracing::info!(
            processed = report.processed,
            created = report.created,
            no_ancestor = report.no_ancestor,
            requeued = report.requeued,
            dead_lettered = report.dead_lettered,
            failed = report.failed,
            "diff run complete"
        );
        Ok(report)
    }

    async fn work(
        &self,
        worker: usize,
        queue: &VersionQueue,
        report: &Mutex<RunReport>,
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
                    queue.claims().wait_release(Duration::from_millis(250)).await;
                    continue;
                }
                Pop::Empty => {
                    budget.give_back();
                    return Ok(());
                }
            };

            let outcome = self.process_version(&item.version).await;
            drop(item.claim);

            let mut report = report.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            match outcome {
                Ok(processed) => report.record(&processed),
                Err(e) if e.is_fatal() => return Err(e),
                Err(e) => {
                    report.failed += 1;
                    tracing::warn!(worker, version = %item.version.uuid, error = %e, "version failed");
                }
            }
        }
    }
}

/// CLI entry point for `wm diff`.
pub async fn run_diff(config: &Config, limit: Option<usize>) -> anyhow::Result<()> {
    let store = Arc::new(SqliteStore::new(db::connect(config).await?));
    let service = Arc::new(HttpDiffService::from_config(&config.diff_service)?);
    let pipeline = DiffPipeline::from_config(config, store.clone(), service);

    let report = pipeline.run(limit).await?;

    println!("diff");
    println!("  processed: {}", report.processed);
    println!("  created: {}", report.created);
    if report.existing > 0 {
        println!("  already diffed: {}", report.existing);
    }
    println!("  no ancestor: {}", report.no_ancestor);
    println!("  requeued: {}", report.requeued);
    println!("  dead-lettered: {}", report.dead_lettered);
    if report.failed > 0 {
        println!("  failed: {}", report.failed);
    }
    println!("ok");

    store.close().await;
    Ok(())
}

/// CLI entry point for `wm dead-letters`.
pub async fn run_dead_letters(config: &Config, requeue: bool) -> anyhow::Result<()> {
    let store = SqliteStore::new(db::connect(config).await?);

    if requeue {
        let n = store.requeue_dead_letters().await?;
        println!("requeued {} version(s)", n);
        store.close().await;
        return Ok(());
    }

    let letters = store.dead_letters().await?;
    if letters.is_empty() {
        println!("No dead letters.");
    } else {
        println!("  {:<36}  {:>8}  {}", "VERSION", "ATTEMPTS", "REASON");
        println!("  {}", "-".repeat(76));
        for letter in &letters {
            println!(
                "  {:<36}  {:>8}  {}",
                letter.version_uuid, letter.attempts, letter.reason
            );
        }
    }

    store.close().await;
    Ok(())
}
