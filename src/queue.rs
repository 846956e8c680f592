//! Claiming work from the derived queues.
//!
//! The queues themselves are store queries ([`Store::unprocessed_versions`],
//! [`Store::unprocessed_diffs`]). This module adds the in-process claim
//! discipline on top:
//!
//! - [`VersionQueue`] claims the owning **Page**, so at most one Version per
//!   Page is diffed at a time and predecessors are read from current state.
//! - [`DiffQueue`] claims the Diff itself.
//!
//! A claim is a [`Claim`] guard; dropping it releases the key and wakes any
//! worker waiting for one. Nothing is removed from the store on pop, so a
//! crash mid-item leaves it queued for the next run.
//!
//! Each queue also remembers what it handed out during its lifetime, so an
//! item that failed and was requeued is not popped again in the same run.

use std::collections::HashSet;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use tokio::sync::Notify;
use uuid::Uuid;
use web_monitoring_core::models::{Diff, Version};
use web_monitoring_core::store::Store;
use web_monitoring_core::Result;

/// Candidates fetched per pop, on top of those already handed out.
const POP_WINDOW: usize = 64;

/// Set of keys currently being worked on.
#[derive(Default)]
pub struct ClaimSet {
    held: Mutex<HashSet<Uuid>>,
    released: Notify,
}

impl ClaimSet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn held(&self) -> MutexGuard<'_, HashSet<Uuid>> {
        self.held.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Claim `key` unless someone else holds it.
    pub fn try_claim(self: &Arc<Self>, key: Uuid) -> Option<Claim> {
        if self.held().insert(key) {
            Some(Claim {
                set: Arc::clone(self),
                key,
            })
        } else {
            None
        }
    }

    pub fn is_claimed(&self, key: &Uuid) -> bool {
        self.held().contains(key)
    }

    pub fn len(&self) -> usize {
        self.held().len()
    }

    pub fn is_empty(&self) -> bool {
        self.held().is_empty()
    }

    /// Wait until some claim is released, or `timeout` passes.
    pub async fn wait_release(&self, timeout: Duration) {
        let _ = tokio::time::timeout(timeout, self.released.notified()).await;
    }
}

/// Held claim on one key. Released on drop.
pub struct Claim {
    set: Arc<ClaimSet>,
    key: Uuid,
}

impl Claim {
    pub fn key(&self) -> Uuid {
        self.key
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.set.held().remove(&self.key);
        self.set.released.notify_waiters();
    }
}

impl std::fmt::Debug for Claim {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Claim").field("key", &self.key).finish()
    }
}

/// Result of a pop.
#[derive(Debug)]
pub enum Pop<T> {
    /// A claimed item; the claim lives as long as the value.
    Item(T),
    /// Work remains but every candidate is claimed by another worker.
    Busy,
    Empty,
}

/// An unprocessed Version with its Page claimed.
#[derive(Debug)]
pub struct ClaimedVersion {
    pub version: Version,
    pub claim: Claim,
}

/// An unprioritized Diff with the Diff claimed.
#[derive(Debug)]
pub struct ClaimedDiff {
    pub diff: Diff,
    pub claim: Claim,
}

/// Shared cap on items popped across workers; `None` is unlimited.
pub struct Budget(Option<AtomicUsize>);

impl Budget {
    pub fn new(limit: Option<usize>) -> Self {
        Self(limit.map(AtomicUsize::new))
    }

    /// Reserve one pop. False once the cap is spent.
    pub fn take(&self) -> bool {
        match &self.0 {
            None => true,
            Some(left) => left
                .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
                .is_ok(),
        }
    }

    /// Return a reservation that did not yield an item.
    pub fn give_back(&self) {
        if let Some(left) = &self.0 {
            left.fetch_add(1, Ordering::SeqCst);
        }
    }
}

fn lock(seen: &Mutex<HashSet<Uuid>>) -> MutexGuard<'_, HashSet<Uuid>> {
    seen.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

pub struct VersionQueue {
    store: Arc<dyn Store>,
    claims: Arc<ClaimSet>,
    seen: Mutex<HashSet<Uuid>>,
}

impl VersionQueue {
    pub fn new(store: Arc<dyn Store>, claims: Arc<ClaimSet>) -> Self {
        Self {
            store,
            claims,
            seen: Mutex::new(HashSet::new()),
        }
    }

    pub fn claims(&self) -> &Arc<ClaimSet> {
        &self.claims
    }

    /// Claim the oldest-known unprocessed Version whose Page is free.
    pub async fn pop(&self) -> Result<Pop<ClaimedVersion>> {
        let window = POP_WINDOW + lock(&self.seen).len();
        let candidates = self.store.unprocessed_versions(window).await?;
        let mut busy = false;

        for id in candidates {
            if lock(&self.seen).contains(&id) {
                continue;
            }
            let version = match self.store.get_version(id).await {
                Ok(v) => v,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            let Some(claim) = self.claims.try_claim(version.page_uuid) else {
                busy = true;
                continue;
            };
            // Re-check under the claim: another worker may have just
            // finished this Page.
            if !lock(&self.seen).insert(id) {
                continue;
            }
            return Ok(Pop::Item(ClaimedVersion { version, claim }));
        }

        Ok(if busy { Pop::Busy } else { Pop::Empty })
    }
}

pub struct DiffQueue {
    store: Arc<dyn Store>,
    claims: Arc<ClaimSet>,
    seen: Mutex<HashSet<Uuid>>,
}

impl DiffQueue {
    pub fn new(store: Arc<dyn Store>, claims: Arc<ClaimSet>) -> Self {
        Self {
            store,
            claims,
            seen: Mutex::new(HashSet::new()),
        }
    }

    pub fn claims(&self) -> &Arc<ClaimSet> {
        &self.claims
    }

    /// Claim the oldest unprioritized Diff not claimed by another worker.
    pub async fn pop(&self) -> Result<Pop<ClaimedDiff>> {
        let window = POP_WINDOW + lock(&self.seen).len();
        let candidates = self.store.unprocessed_diffs(window).await?;
        let mut busy = false;

        for id in candidates {
            if lock(&self.seen).contains(&id) {
                continue;
            }
            let Some(claim) = self.claims.try_claim(id) else {
                busy = true;
                continue;
            };
            let diff = match self.store.get_diff(id).await {
                Ok(d) => d,
                Err(e) if e.is_not_found() => continue,
                Err(e) => return Err(e),
            };
            if diff.priority.is_some() || !lock(&self.seen).insert(id) {
                continue;
            }
            return Ok(Pop::Item(ClaimedDiff { diff, claim }));
        }

        Ok(if busy { Pop::Busy } else { Pop::Empty })
    }
}
