//! Tracer trait for observing computed value activity.
//!
//! This module defines the [`Tracer`] trait and related types for observing
//! computations, invalidations and evictions. The default [`NoopTracer`]
//! discards every event. Structured logging through the `tracing` crate
//! happens independently of the installed tracer.
//!
//! # Example
//!
//! ```ignore
//! use compute_flow::{ComputeRuntime, InvalidationReason, Tag, Tracer, TracerKey};
//!
//! // Forward invalidations to replicas.
//! struct Replicator { /* ... */ }
//!
//! impl Tracer for Replicator {
//!     fn on_invalidated(&self, key: TracerKey, tag: Tag, _reason: &InvalidationReason) {
//!         self.publish(key, tag);
//!     }
//! }
//!
//! let runtime = ComputeRuntime::builder().tracer(Replicator { /* ... */ }).build();
//! ```

use crate::invalidation::InvalidationReason;
use crate::key::ComputedKey;
use crate::tag::Tag;

/// Represents a computed key in a type-erased manner for tracing.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TracerKey {
    /// The producing function's name.
    pub function: String,
    /// Debug representation of the input key.
    pub key_debug: String,
}

impl TracerKey {
    /// Create a new tracer key.
    #[inline]
    pub fn new(function: impl Into<String>, key_debug: impl Into<String>) -> Self {
        Self {
            function: function.into(),
            key_debug: key_debug.into(),
        }
    }
}

impl From<&ComputedKey> for TracerKey {
    fn from(key: &ComputedKey) -> Self {
        TracerKey::new(key.function_name(), format!("{:?}", key.key()))
    }
}

/// Computation result classification.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExecutionResult {
    /// The producer returned a value.
    Computed,
    /// The producer failed; the error is cached as the output.
    Error {
        /// Display output of the error.
        message: String,
    },
    /// The node was invalidated while computing; its output was not published.
    Discarded,
    /// The producer panicked.
    Panicked,
}

/// Tracer trait for observing computed value activity.
///
/// All methods have default empty implementations, so you only need to
/// override the events you're interested in.
///
/// # Thread Safety
///
/// Implementations must be `Send + Sync` as the tracer may be called from
/// multiple tasks concurrently. Methods are called synchronously from inside
/// the cache and must not block.
pub trait Tracer: Send + Sync + 'static {
    /// Called when a producer invocation starts for a fresh node.
    #[inline]
    fn on_compute_start(&self, _key: TracerKey, _tag: Tag) {}

    /// Called when a producer invocation ends.
    #[inline]
    fn on_compute_end(&self, _key: TracerKey, _tag: Tag, _result: ExecutionResult) {}

    /// Called when an access is served from an already computed node.
    #[inline]
    fn on_cache_hit(&self, _key: TracerKey, _tag: Tag) {}

    /// Called when a dependency edge is linked during a computation.
    #[inline]
    fn on_dependency_registered(&self, _parent: TracerKey, _dependency: TracerKey) {}

    /// Called once per node when it transitions to `Invalidated`.
    #[inline]
    fn on_invalidated(&self, _key: TracerKey, _tag: Tag, _reason: &InvalidationReason) {}

    /// Called when the prune pass evicts a node from the registry.
    #[inline]
    fn on_pruned(&self, _key: TracerKey, _tag: Tag) {}

    /// Called when a circular dependency is detected.
    #[inline]
    fn on_cycle_detected(&self, _path: Vec<TracerKey>) {}
}

/// Tracer that discards all events.
///
/// This is the default tracer for [`ComputeRuntime`](crate::ComputeRuntime).
pub struct NoopTracer;

impl Tracer for NoopTracer {}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    struct CountingTracer {
        start_count: AtomicUsize,
        end_count: AtomicUsize,
    }

    impl CountingTracer {
        fn new() -> Self {
            Self {
                start_count: AtomicUsize::new(0),
                end_count: AtomicUsize::new(0),
            }
        }
    }

    impl Tracer for CountingTracer {
        fn on_compute_start(&self, _key: TracerKey, _tag: Tag) {
            self.start_count.fetch_add(1, Ordering::Relaxed);
        }

        fn on_compute_end(&self, _key: TracerKey, _tag: Tag, _result: ExecutionResult) {
            self.end_count.fetch_add(1, Ordering::Relaxed);
        }
    }

    #[test]
    fn test_counting_tracer() {
        let tracer = CountingTracer::new();
        let key = TracerKey::new("users", "1");

        tracer.on_compute_start(key.clone(), Tag(1));
        tracer.on_compute_start(key.clone(), Tag(2));
        tracer.on_compute_end(key, Tag(1), ExecutionResult::Computed);

        assert_eq!(tracer.start_count.load(Ordering::Relaxed), 2);
        assert_eq!(tracer.end_count.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn test_tracer_key_from_computed_key() {
        let key = ComputedKey::new(crate::key::FunctionId(1), "users".into(), 42u32);
        let traced = TracerKey::from(&key);
        assert_eq!(traced.function, "users");
        assert_eq!(traced.key_debug, "42");
    }

    #[test]
    fn test_tracer_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<NoopTracer>();
        assert_send_sync::<Arc<CountingTracer>>();
    }
}
