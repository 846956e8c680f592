//! In-memory [`Store`] implementation for tests and embedding.
//!
//! Everything lives behind one `std::sync::RwLock`, so each operation is
//! atomic with respect to every other. Versions are additionally indexed per
//! Page in a `BTreeSet` keyed by (capture_time, uuid), which makes the
//! predecessor lookup a single range query.
//!
//! The unprocessed-version queue is a `BTreeSet` keyed by (attempts,
//! insertion sequence). Writes re-evaluate only the Versions they touch.

use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::error::{Error, Result};
use crate::models::{
    Annotation, DeadLetter, Diff, DiffInsert, NewAnnotation, NewDiff, NewPage, NewVersion, Page,
    Priority, StoreStats, Version, VersionOutcome,
};

use super::Store;

type OrderKey = (DateTime<Utc>, Uuid);

/// (attempts, insertion sequence, uuid): fresh work first, then oldest known.
type QueueKey = (u32, u64, Uuid);

struct OutcomeRecord {
    outcome: VersionOutcome,
    attempts: u32,
    updated_at: DateTime<Utc>,
}

#[derive(Default)]
struct Inner {
    pages: HashMap<Uuid, Page>,
    page_urls: HashMap<String, Uuid>,
    versions: HashMap<Uuid, Version>,
    /// Insertion order, the queue's "oldest known first".
    version_seq: HashMap<Uuid, u64>,
    queue: BTreeSet<QueueKey>,
    queued: HashMap<Uuid, QueueKey>,
    page_index: HashMap<Uuid, BTreeSet<OrderKey>>,
    diffs: HashMap<Uuid, Diff>,
    diff_seq: Vec<Uuid>,
    diff_pairs: HashMap<(Uuid, Uuid), Uuid>,
    annotations: HashMap<Uuid, Annotation>,
    annotations_by_diff: HashMap<Uuid, Vec<Uuid>>,
    outcomes: HashMap<Uuid, OutcomeRecord>,
}

impl Inner {
    fn predecessor_of(&self, version: &Version) -> Option<Uuid> {
        self.page_index
            .get(&version.page_uuid)?
            .range(..version.ordering_key())
            .next_back()
            .map(|(_, id)| *id)
    }

    fn is_unprocessed(&self, version: &Version) -> bool {
        if let Some(record) = self.outcomes.get(&version.uuid) {
            if !matches!(record.outcome, VersionOutcome::Retry { .. }) {
                return false;
            }
        }
        match self.predecessor_of(version) {
            Some(pred) => !self.diff_pairs.contains_key(&(pred, version.uuid)),
            None => true,
        }
    }

    fn attempts(&self, id: &Uuid) -> u32 {
        self.outcomes.get(id).map(|r| r.attempts).unwrap_or(0)
    }

    /// Re-evaluate one Version's queue membership after a write touched it.
    fn refresh(&mut self, id: Uuid) {
        if let Some(key) = self.queued.remove(&id) {
            self.queue.remove(&key);
        }
        let Some(version) = self.versions.get(&id) else {
            return;
        };
        if !self.is_unprocessed(version) {
            return;
        }
        let seq = self.version_seq.get(&id).copied().unwrap_or(u64::MAX);
        let key = (self.attempts(&id), seq, id);
        self.queue.insert(key);
        self.queued.insert(id, key);
    }

    fn successor_of(&self, version: &Version) -> Option<Uuid> {
        use std::ops::Bound::{Excluded, Unbounded};
        self.page_index
            .get(&version.page_uuid)?
            .range((Excluded(version.ordering_key()), Unbounded))
            .next()
            .map(|(_, id)| *id)
    }
}

fn fresh_uuid<T>(
    requested: Option<Uuid>,
    kind: &'static str,
    table: &HashMap<Uuid, T>,
) -> Result<Uuid> {
    match requested {
        Some(id) if table.contains_key(&id) => Err(Error::DuplicateKey {
            kind,
            id: id.to_string(),
        }),
        Some(id) => Ok(id),
        None => Ok(Uuid::new_v4()),
    }
}

/// In-memory store.
pub struct InMemoryStore {
    inner: RwLock<Inner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner::default()),
        }
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, Inner>> {
        self.inner
            .read()
            .map_err(|_| Error::Storage("in-memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, Inner>> {
        self.inner
            .write()
            .map_err(|_| Error::Storage("in-memory store lock poisoned".into()))
    }
}

impl Default for InMemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn insert_page(&self, page: &NewPage) -> Result<Uuid> {
        let mut inner = self.write()?;
        let id = fresh_uuid(page.uuid, "page", &inner.pages)?;
        if inner.page_urls.contains_key(&page.url) {
            return Err(Error::DuplicateKey {
                kind: "page url",
                id: page.url.clone(),
            });
        }
        inner.page_urls.insert(page.url.clone(), id);
        inner.pages.insert(
            id,
            Page {
                uuid: id,
                url: page.url.clone(),
                title: page.title.clone(),
                agency: page.agency.clone(),
                site: page.site.clone(),
            },
        );
        Ok(id)
    }

    async fn get_page(&self, id: Uuid) -> Result<Page> {
        self.read()?
            .pages
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("page", id))
    }

    async fn page_by_url(&self, url: &str) -> Result<Option<Page>> {
        let inner = self.read()?;
        Ok(inner
            .page_urls
            .get(url)
            .and_then(|id| inner.pages.get(id))
            .cloned())
    }

    async fn insert_version(&self, version: &NewVersion) -> Result<Uuid> {
        let mut inner = self.write()?;
        if !inner.pages.contains_key(&version.page_uuid) {
            return Err(Error::not_found("page", version.page_uuid));
        }
        let id = fresh_uuid(version.uuid, "version", &inner.versions)?;
        let record = Version {
            uuid: id,
            page_uuid: version.page_uuid,
            capture_time: version.capture_time,
            uri: version.uri.clone(),
            version_hash: version.version_hash.clone(),
            source_type: version.source_type.clone(),
            source_metadata: version.source_metadata.clone(),
        };
        let key = record.ordering_key();

        // Later Versions that were the oldest now have an ancestor.
        let later: Vec<Uuid> = inner
            .page_index
            .get(&version.page_uuid)
            .map(|index| index.range(key..).map(|(_, v)| *v).collect())
            .unwrap_or_default();
        let mut touched = Vec::new();
        for later_id in later {
            let cleared = inner
                .outcomes
                .get(&later_id)
                .is_some_and(|rec| rec.outcome == VersionOutcome::NoAncestor);
            if cleared {
                inner.outcomes.remove(&later_id);
                touched.push(later_id);
            }
        }

        inner
            .page_index
            .entry(version.page_uuid)
            .or_default()
            .insert(key);
        let seq = inner.version_seq.len() as u64;
        inner.version_seq.insert(id, seq);
        touched.extend(inner.successor_of(&record));
        inner.versions.insert(id, record);

        inner.refresh(id);
        for touched_id in touched {
            inner.refresh(touched_id);
        }
        Ok(id)
    }

    async fn get_version(&self, id: Uuid) -> Result<Version> {
        self.read()?
            .versions
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("version", id))
    }

    async fn page_versions(&self, page: Uuid) -> Result<Vec<Version>> {
        let inner = self.read()?;
        Ok(inner
            .page_index
            .get(&page)
            .map(|index| {
                index
                    .iter()
                    .filter_map(|(_, id)| inner.versions.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn predecessor(&self, version: &Version) -> Result<Option<Version>> {
        let inner = self.read()?;
        Ok(inner
            .predecessor_of(version)
            .and_then(|id| inner.versions.get(&id))
            .cloned())
    }

    async fn insert_diff(&self, diff: &NewDiff) -> Result<DiffInsert> {
        let mut inner = self.write()?;
        let from = inner
            .versions
            .get(&diff.version_from)
            .ok_or_else(|| Error::not_found("version", diff.version_from))?;
        let to = inner
            .versions
            .get(&diff.version_to)
            .ok_or_else(|| Error::not_found("version", diff.version_to))?;
        if from.page_uuid != to.page_uuid {
            return Err(Error::PageMismatch {
                from: diff.version_from,
                to: diff.version_to,
            });
        }
        if let Some(existing) = inner.diff_pairs.get(&(diff.version_from, diff.version_to)) {
            return Ok(DiffInsert::Existing(*existing));
        }
        let id = fresh_uuid(diff.uuid, "diff", &inner.diffs)?;
        inner.diffs.insert(
            id,
            Diff {
                uuid: id,
                version_from: diff.version_from,
                version_to: diff.version_to,
                diffhash: diff.diffhash.clone(),
                uri: diff.uri.clone(),
                source_type: diff.source_type.clone(),
                source_metadata: diff.source_metadata.clone(),
                priority: None,
                content: None,
            },
        );
        inner
            .diff_pairs
            .insert((diff.version_from, diff.version_to), id);
        inner.diff_seq.push(id);
        inner.outcomes.remove(&diff.version_to);
        inner.refresh(diff.version_to);
        Ok(DiffInsert::Created(id))
    }

    async fn get_diff(&self, id: Uuid) -> Result<Diff> {
        self.read()?
            .diffs
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("diff", id))
    }

    async fn diff_for_pair(&self, from: Uuid, to: Uuid) -> Result<Option<Diff>> {
        let inner = self.read()?;
        Ok(inner
            .diff_pairs
            .get(&(from, to))
            .and_then(|id| inner.diffs.get(id))
            .cloned())
    }

    async fn set_priority(&self, id: Uuid, priority: Priority) -> Result<bool> {
        let mut inner = self.write()?;
        let diff = inner
            .diffs
            .get_mut(&id)
            .ok_or_else(|| Error::not_found("diff", id))?;
        if diff.priority.is_some() {
            return Ok(false);
        }
        diff.priority = Some(priority);
        Ok(true)
    }

    async fn insert_annotation(&self, annotation: &NewAnnotation) -> Result<Uuid> {
        let mut inner = self.write()?;
        if !inner.diffs.contains_key(&annotation.diff_uuid) {
            return Err(Error::not_found("diff", annotation.diff_uuid));
        }
        let id = fresh_uuid(annotation.uuid, "annotation", &inner.annotations)?;
        inner.annotations.insert(
            id,
            Annotation {
                uuid: id,
                diff_uuid: annotation.diff_uuid,
                author: annotation.author.clone(),
                content: annotation.content.clone(),
                created_at: Utc::now(),
            },
        );
        inner
            .annotations_by_diff
            .entry(annotation.diff_uuid)
            .or_default()
            .push(id);
        Ok(id)
    }

    async fn get_annotation(&self, id: Uuid) -> Result<Annotation> {
        self.read()?
            .annotations
            .get(&id)
            .cloned()
            .ok_or_else(|| Error::not_found("annotation", id))
    }

    async fn annotations_for_diff(&self, diff: Uuid) -> Result<Vec<Annotation>> {
        let inner = self.read()?;
        Ok(inner
            .annotations_by_diff
            .get(&diff)
            .map(|ids| {
                ids.iter()
                    .filter_map(|id| inner.annotations.get(id).cloned())
                    .collect()
            })
            .unwrap_or_default())
    }

    async fn unprocessed_versions(&self, limit: usize) -> Result<Vec<Uuid>> {
        let inner = self.read()?;
        Ok(inner
            .queue
            .iter()
            .take(limit)
            .map(|(_, _, id)| *id)
            .collect())
    }

    async fn unprocessed_diffs(&self, limit: usize) -> Result<Vec<Uuid>> {
        let inner = self.read()?;
        Ok(inner
            .diff_seq
            .iter()
            .filter(|id| {
                inner
                    .diffs
                    .get(id)
                    .map(|d| d.priority.is_none())
                    .unwrap_or(false)
            })
            .take(limit)
            .copied()
            .collect())
    }

    async fn record_outcome(&self, version: Uuid, outcome: &VersionOutcome) -> Result<u32> {
        if *outcome == VersionOutcome::NoAncestor {
            self.record_no_ancestor(version).await?;
            return self.version_attempts(version).await;
        }
        let mut inner = self.write()?;
        if !inner.versions.contains_key(&version) {
            return Err(Error::not_found("version", version));
        }
        let attempts = inner.attempts(&version) + 1;
        inner.outcomes.insert(
            version,
            OutcomeRecord {
                outcome: outcome.clone(),
                attempts,
                updated_at: Utc::now(),
            },
        );
        inner.refresh(version);
        Ok(attempts)
    }

    async fn record_no_ancestor(&self, version: Uuid) -> Result<bool> {
        let mut inner = self.write()?;
        let record = inner
            .versions
            .get(&version)
            .ok_or_else(|| Error::not_found("version", version))?;
        if inner.predecessor_of(record).is_some() {
            return Ok(false);
        }
        let attempts = inner.attempts(&version);
        inner.outcomes.insert(
            version,
            OutcomeRecord {
                outcome: VersionOutcome::NoAncestor,
                attempts,
                updated_at: Utc::now(),
            },
        );
        inner.refresh(version);
        Ok(true)
    }

    async fn version_attempts(&self, version: Uuid) -> Result<u32> {
        let inner = self.read()?;
        if !inner.versions.contains_key(&version) {
            return Err(Error::not_found("version", version));
        }
        Ok(inner.attempts(&version))
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>> {
        let inner = self.read()?;
        let mut letters: Vec<DeadLetter> = inner
            .outcomes
            .iter()
            .filter_map(|(id, rec)| match &rec.outcome {
                VersionOutcome::DeadLetter { reason } => Some(DeadLetter {
                    version_uuid: *id,
                    reason: reason.clone(),
                    attempts: rec.attempts,
                    updated_at: rec.updated_at,
                }),
                _ => None,
            })
            .collect();
        letters.sort_by_key(|l| (l.updated_at, l.version_uuid));
        Ok(letters)
    }

    async fn requeue_dead_letters(&self) -> Result<u64> {
        let mut inner = self.write()?;
        let letters: Vec<Uuid> = inner
            .outcomes
            .iter()
            .filter(|(_, rec)| matches!(rec.outcome, VersionOutcome::DeadLetter { .. }))
            .map(|(id, _)| *id)
            .collect();
        for id in &letters {
            inner.outcomes.remove(id);
            inner.refresh(*id);
        }
        Ok(letters.len() as u64)
    }

    async fn ranked_diffs(&self, limit: usize) -> Result<Vec<Diff>> {
        let inner = self.read()?;
        let mut ranked: Vec<(usize, &Diff)> = inner
            .diff_seq
            .iter()
            .enumerate()
            .filter_map(|(seq, id)| inner.diffs.get(id).map(|d| (seq, d)))
            .filter(|(_, d)| d.priority.is_some())
            .collect();
        ranked.sort_by(|(seq_a, a), (seq_b, b)| {
            b.priority
                .partial_cmp(&a.priority)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then(seq_a.cmp(seq_b))
        });
        Ok(ranked
            .into_iter()
            .take(limit)
            .map(|(_, d)| d.clone())
            .collect())
    }

    async fn stats(&self) -> Result<StoreStats> {
        let inner = self.read()?;
        let count_status = |status: &str| {
            inner
                .outcomes
                .values()
                .filter(|r| r.outcome.status() == status)
                .count() as u64
        };
        Ok(StoreStats {
            pages: inner.pages.len() as u64,
            versions: inner.versions.len() as u64,
            diffs: inner.diffs.len() as u64,
            annotations: inner.annotations.len() as u64,
            unprocessed_versions: inner.queue.len() as u64,
            unprocessed_diffs: inner
                .diffs
                .values()
                .filter(|d| d.priority.is_none())
                .count() as u64,
            no_ancestor: count_status("no_ancestor"),
            dead_letters: count_status("dead_letter"),
        })
    }
}
