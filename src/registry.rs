//! Registry of live computed values, and eviction.
//!
//! The registry maps each [`ComputedKey`] to the latest node computed for it.
//! It holds nodes strongly; dependents hold their dependencies strongly too, so
//! evicting a node only drops it once nothing else uses it.

use std::sync::Arc;
use std::time::Duration;

use papaya::{Compute, HashMap, Operation};
use tokio::time::Instant;
use tracing::{debug, trace};

use crate::computed::{AnyComputed, ComputedState};
use crate::invalidation::InvalidationReason;
use crate::key::ComputedKey;
use crate::tag::Tag;
use crate::tracer::{Tracer, TracerKey};

/// Monotonic clock measuring time since the runtime was built.
///
/// Built on [`tokio::time::Instant`], so a paused test clock drives eviction.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Clock {
    epoch: Instant,
}

impl Clock {
    pub(crate) fn new() -> Self {
        Self {
            epoch: Instant::now(),
        }
    }

    pub(crate) fn now(&self) -> Duration {
        Instant::now().saturating_duration_since(self.epoch)
    }

    pub(crate) fn now_millis(&self) -> u64 {
        u64::try_from(self.now().as_millis()).unwrap_or(u64::MAX)
    }
}

/// Statistics of one prune pass.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    /// Nodes inspected.
    pub scanned: usize,
    /// Nodes removed from the registry.
    pub removed: usize,
}

/// Concurrent map from computed keys to their latest node.
pub struct Registry {
    entries: HashMap<ComputedKey, Arc<dyn AnyComputed>, ahash::RandomState>,
}

impl Registry {
    pub(crate) fn new() -> Self {
        Self {
            entries: HashMap::with_hasher(ahash::RandomState::new()),
        }
    }

    /// Look up the node registered for `key`.
    pub fn get(&self, key: &ComputedKey) -> Option<Arc<dyn AnyComputed>> {
        self.entries.pin().get(key).cloned()
    }

    /// Register `node` under its key, replacing any previous node.
    pub(crate) fn register(&self, node: Arc<dyn AnyComputed>) {
        trace!(key = ?node.key(), tag = %node.tag(), "registered");
        self.entries.pin().insert(node.key().clone(), node);
    }

    /// Remove the node registered for `key` if it still carries `tag`.
    ///
    /// A newer node registered under the same key is left alone.
    pub fn unregister(&self, key: &ComputedKey, tag: Tag) -> bool {
        let entries = self.entries.pin();
        let result = entries.compute(key.clone(), |entry| match entry {
            Some((_, node)) if node.tag() == tag => Operation::Remove,
            _ => Operation::Abort(()),
        });
        matches!(result, Compute::Removed(..))
    }

    /// Number of registered nodes.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Returns true if no node is registered.
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Keys of all registered nodes.
    pub fn keys(&self) -> Vec<ComputedKey> {
        self.entries.pin().keys().cloned().collect()
    }

    /// Snapshot of all registered nodes.
    pub fn nodes(&self) -> Vec<Arc<dyn AnyComputed>> {
        self.entries.pin().values().cloned().collect()
    }

    /// Remove nodes that are unused and whose keep-alive window has elapsed.
    ///
    /// A node is removed only if it is not computing, has no live dependents,
    /// and was last accessed at least `max(keep_alive, grace)` before `now`.
    /// Invalidated leftovers are always removed. Pruning never invalidates.
    ///
    /// A dependent that was pruned but is still held somewhere, by a caller or
    /// by the map's deferred reclamation, still counts as live. Its dependency
    /// becomes prunable once that handle is released or the dependent is
    /// invalidated.
    pub(crate) fn prune(&self, now: Duration, grace: Duration, tracer: &dyn Tracer) -> PruneStats {
        let entries = self.entries.pin();
        let mut stats = PruneStats::default();

        let candidates: Vec<(ComputedKey, Tag)> = entries
            .iter()
            .filter_map(|(key, node)| {
                stats.scanned += 1;
                is_prunable(node.as_ref(), now, grace).then(|| (key.clone(), node.tag()))
            })
            .collect();

        for (key, tag) in candidates {
            // Re-check under the entry: the node may have been used since the scan.
            let result = entries.compute(key, |entry| match entry {
                Some((_, node)) if node.tag() == tag && is_prunable(node.as_ref(), now, grace) => {
                    Operation::Remove
                }
                _ => Operation::Abort(()),
            });
            if let Compute::Removed(key, _) = result {
                trace!(?key, %tag, "pruned");
                tracer.on_pruned(TracerKey::from(key), tag);
                stats.removed += 1;
            }
        }

        if stats.removed > 0 {
            debug!(scanned = stats.scanned, removed = stats.removed, "prune pass");
        }
        stats
    }

    /// Invalidate every registered node.
    ///
    /// Returns how many registered nodes were consistent before the call,
    /// whether they were invalidated directly or by a cascade.
    pub(crate) fn invalidate_everything(&self) -> usize {
        let nodes = self.nodes();
        let live = nodes
            .iter()
            .filter(|node| node.state() != ComputedState::Invalidated)
            .count();
        for node in nodes {
            node.invalidate_with(InvalidationReason::InvalidateEverything);
        }
        live
    }

    /// Drop every node from the registry without invalidating it.
    pub(crate) fn clear(&self) {
        self.entries.pin().clear();
    }
}

impl std::fmt::Debug for Registry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Registry").field("len", &self.len()).finish()
    }
}

fn is_prunable(node: &dyn AnyComputed, now: Duration, grace: Duration) -> bool {
    match node.state() {
        ComputedState::Computing => false,
        ComputedState::Invalidated => true,
        ComputedState::Computed => {
            node.used_by_count() == 0
                && now.saturating_sub(node.last_access()) >= node.keep_alive().max(grace)
        }
    }
}
