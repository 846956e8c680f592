//! Storage abstraction for web-monitoring.
//!
//! The [`Store`] trait defines every keyed read/write the ingestion, diff,
//! triage, and review components need, so the pipelines run unchanged
//! against SQLite in production and [`memory::InMemoryStore`] in tests.
//!
//! The two work queues are derived from the entity tables:
//!
//! - **unprocessed versions**: Versions with no Diff from their *current*
//!   predecessor, excluding those with a `no_ancestor` or `dead_letter`
//!   outcome. Versions with a `retry` outcome sort after fresh work.
//!   Stores keep this set indexed as they write, so popping it costs the
//!   size of the queue rather than the size of the Version table. Every
//!   write that can change membership (`insert_version`, `insert_diff`,
//!   the outcome writes, `requeue_dead_letters`) updates the index in the
//!   same atomic step.
//! - **unprocessed diffs**: Diffs whose priority is unset.
//!
//! Implementations must be `Send + Sync` and make each write atomic per
//! record.

pub mod memory;

pub use memory::InMemoryStore;

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::Result;
use crate::models::{
    Annotation, DeadLetter, Diff, DiffInsert, NewAnnotation, NewDiff, NewPage, NewVersion, Page,
    Priority, StoreStats, Version, VersionOutcome,
};

/// Abstract storage backend.
///
/// # Operations
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`insert_page`](Store::insert_page) / [`get_page`](Store::get_page) / [`page_by_url`](Store::page_by_url) | Pages |
/// | [`insert_version`](Store::insert_version) / [`get_version`](Store::get_version) / [`page_versions`](Store::page_versions) / [`predecessor`](Store::predecessor) | Versions and the per-Page ordering |
/// | [`insert_diff`](Store::insert_diff) / [`get_diff`](Store::get_diff) / [`diff_for_pair`](Store::diff_for_pair) / [`set_priority`](Store::set_priority) | Diffs |
/// | [`insert_annotation`](Store::insert_annotation) / [`get_annotation`](Store::get_annotation) / [`annotations_for_diff`](Store::annotations_for_diff) | Annotations |
/// | [`unprocessed_versions`](Store::unprocessed_versions) / [`unprocessed_diffs`](Store::unprocessed_diffs) | Derived work queues |
/// | [`record_outcome`](Store::record_outcome) / [`record_no_ancestor`](Store::record_no_ancestor) / [`version_attempts`](Store::version_attempts) / [`dead_letters`](Store::dead_letters) / [`requeue_dead_letters`](Store::requeue_dead_letters) | Skip and retry bookkeeping |
#[async_trait]
pub trait Store: Send + Sync {
    /// Insert a Page. Fails with `DuplicateKey` if the uuid or url is taken.
    async fn insert_page(&self, page: &NewPage) -> Result<Uuid>;

    async fn get_page(&self, id: Uuid) -> Result<Page>;

    async fn page_by_url(&self, url: &str) -> Result<Option<Page>>;

    /// Insert a Version of an existing Page.
    ///
    /// A `no_ancestor` outcome on any later Version of the same Page is
    /// cleared in the same write, since that Version now has a predecessor.
    async fn insert_version(&self, version: &NewVersion) -> Result<Uuid>;

    async fn get_version(&self, id: Uuid) -> Result<Version>;

    /// All Versions of a Page in ascending (capture_time, uuid) order.
    async fn page_versions(&self, page: Uuid) -> Result<Vec<Version>>;

    /// The immediately preceding Version of the same Page, evaluated
    /// against current store state.
    async fn predecessor(&self, version: &Version) -> Result<Option<Version>>;

    /// Insert a Diff, or return the Diff already recorded for the same
    /// (version_from, version_to) pair.
    ///
    /// Fails with `NotFound` if either Version is missing and
    /// `PageMismatch` if they belong to different Pages.
    async fn insert_diff(&self, diff: &NewDiff) -> Result<DiffInsert>;

    /// Fetch a Diff record. `content` is always `None`.
    async fn get_diff(&self, id: Uuid) -> Result<Diff>;

    async fn diff_for_pair(&self, from: Uuid, to: Uuid) -> Result<Option<Diff>>;

    /// Set a Diff's priority if it is still unset.
    ///
    /// Returns `false` when a priority was already recorded; the existing
    /// value is kept.
    async fn set_priority(&self, id: Uuid, priority: Priority) -> Result<bool>;

    /// Append an Annotation. Fails with `NotFound` if the Diff is missing.
    async fn insert_annotation(&self, annotation: &NewAnnotation) -> Result<Uuid>;

    async fn get_annotation(&self, id: Uuid) -> Result<Annotation>;

    /// Annotations on a Diff, oldest first.
    async fn annotations_for_diff(&self, diff: Uuid) -> Result<Vec<Annotation>>;

    /// Up to `limit` unprocessed Version uuids, front of the queue first.
    async fn unprocessed_versions(&self, limit: usize) -> Result<Vec<Uuid>>;

    /// Up to `limit` Diff uuids with no priority, oldest first.
    async fn unprocessed_diffs(&self, limit: usize) -> Result<Vec<Uuid>>;

    /// Record why a Version left (or moved to the back of) the queue.
    ///
    /// `Retry` and `DeadLetter` increment the attempt counter. `NoAncestor`
    /// goes through [`record_no_ancestor`](Store::record_no_ancestor) and is
    /// dropped when the Version has a predecessor. Returns the attempt count
    /// after the update.
    async fn record_outcome(&self, version: Uuid, outcome: &VersionOutcome) -> Result<u32>;

    /// Mark a Version as the oldest of its Page, in one step with checking
    /// that no predecessor exists.
    ///
    /// Returns `false` without writing anything when a predecessor is
    /// present, e.g. an older capture ingested after the caller's lookup.
    async fn record_no_ancestor(&self, version: Uuid) -> Result<bool>;

    /// Failed pops recorded so far for a Version; 0 if it has no outcome.
    async fn version_attempts(&self, version: Uuid) -> Result<u32>;

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>>;

    /// Return every dead-lettered Version to the queue. Returns how many
    /// were requeued.
    async fn requeue_dead_letters(&self) -> Result<u64>;

    /// Diffs with a priority, highest first, ties oldest first.
    async fn ranked_diffs(&self, limit: usize) -> Result<Vec<Diff>>;

    async fn stats(&self) -> Result<StoreStats>;

    /// Versions of a Page, newest first.
    async fn history(&self, page: Uuid) -> Result<Vec<Version>> {
        let mut versions = self.page_versions(page).await?;
        versions.reverse();
        Ok(versions)
    }

    /// The oldest Version of a Page, if it has any.
    async fn oldest(&self, page: Uuid) -> Result<Option<Version>> {
        Ok(self.page_versions(page).await?.into_iter().next())
    }

    /// Annotations on the Change between two Versions.
    async fn annotations_for_change(&self, from: Uuid, to: Uuid) -> Result<Vec<Annotation>> {
        match self.diff_for_pair(from, to).await? {
            Some(diff) => self.annotations_for_diff(diff.uuid).await,
            None => Ok(Vec::new()),
        }
    }
}
