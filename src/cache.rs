//! Bounded in-process view of pending intents.
//!
//! Keyed by fingerprint, least-recently-seen out when full. The ingest loop
//! is the only writer; the cycle loop reads reference snapshots, so a
//! reconcile racing a snapshot never invalidates the reader's view.

use crate::types::{Fingerprint, Intent};
use lru::LruCache;
use parking_lot::Mutex;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// Result of reconciling the cache against the chain's pending set.
#[derive(Debug, Default)]
pub struct ReconcileOutcome {
    pub inserted: Vec<Fingerprint>,
    /// Fingerprints dropped from candidacy; the caller propagates these to
    /// the vector index and the embedding memo.
    pub removed: Vec<Fingerprint>,
}

/// Authoritative cache of pending intents.
pub struct IntentCache {
    inner: Mutex<LruCache<Fingerprint, Arc<Intent>>>,
}

impl IntentCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            inner: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Apply the authoritative pending set from the chain. Entries on chain
    /// but not cached are inserted; cached entries absent from the chain (or
    /// no longer pending) are removed. A failed fetch never reaches this
    /// method, so a flaky chain leaves the cache stale rather than empty.
    pub fn reconcile(&self, pending: Vec<Intent>) -> ReconcileOutcome {
        let mut outcome = ReconcileOutcome::default();
        let mut cache = self.inner.lock();

        let live: std::collections::HashSet<&str> =
            pending.iter().map(|i| i.fingerprint.as_str()).collect();
        let stale: Vec<Fingerprint> = cache
            .iter()
            .filter(|(fp, _)| !live.contains(fp.as_str()))
            .map(|(fp, _)| fp.clone())
            .collect();
        for fp in stale {
            cache.pop(&fp);
            outcome.removed.push(fp);
        }

        for intent in pending {
            let fingerprint = intent.fingerprint.clone();
            if cache.contains(&fingerprint) {
                // Refresh recency without replacing the shared record.
                cache.promote(&fingerprint);
                continue;
            }
            if let Some((evicted_fp, _)) = cache.push(fingerprint.clone(), Arc::new(intent)) {
                if evicted_fp != fingerprint {
                    outcome.removed.push(evicted_fp);
                }
            }
            outcome.inserted.push(fingerprint);
        }

        outcome
    }

    /// Drop one intent from candidacy (oversize, unalignable, no longer
    /// pending).
    pub fn remove(&self, fingerprint: &str) -> bool {
        self.inner.lock().pop(fingerprint).is_some()
    }

    pub fn get(&self, fingerprint: &str) -> Option<Arc<Intent>> {
        self.inner.lock().peek(fingerprint).cloned()
    }

    pub fn contains(&self, fingerprint: &str) -> bool {
        self.inner.lock().contains(fingerprint)
    }

    pub fn len(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().is_empty()
    }

    /// Reference snapshot in least-recently-seen-first order, so long-waiting
    /// intents get scanned first.
    pub fn snapshot(&self) -> Vec<Arc<Intent>> {
        let cache = self.inner.lock();
        let mut intents: Vec<Arc<Intent>> = cache.iter().map(|(_, v)| v.clone()).collect();
        intents.reverse();
        intents
    }
}
