//! Computed values: memoized producer outputs linked into a dependency graph.
//!
//! A computed value moves through `Computing -> Computed -> Invalidated` and
//! never goes back. Recomputing a key always creates a new node with a newer
//! [`Tag`]; the old node stays readable by whoever still holds it.
//!
//! Edges are kept on both ends. A node holds its dependencies ("used") strongly
//! and its dependents ("used by") weakly, so an invalidated leaf keeps nothing
//! alive and an unreferenced dependent can be dropped without touching the
//! nodes it read.

use std::any::Any;
use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use slab::Slab;
use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace, warn};

use crate::config::ComputedOptions;
use crate::context::{CallMode, ComputeContext};
use crate::error::ComputeError;
use crate::function::Recompute;
use crate::invalidation::InvalidationReason;
use crate::key::ComputedKey;
use crate::registry::Clock;
use crate::runtime::RuntimeShared;
use crate::tag::Tag;
use crate::tracer::{ExecutionResult, TracerKey};

/// Output of a computed value: the shared value or the cached error.
pub type ComputedOutput<T> = Result<Arc<T>, ComputeError>;

/// Lifecycle state of a computed value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ComputedState {
    /// The producer is running. Only the function that created the node can
    /// link dependencies into it.
    Computing,
    /// The output is available and consistent with its dependencies.
    Computed,
    /// Terminal. The output, if any, is stale.
    Invalidated,
}

/// Handle returned by [`Computed::on_invalidated`], used to unsubscribe.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct HandlerId(usize);

type InvalidatedHandler = Box<dyn FnOnce(&InvalidationReason) + Send>;

mod sealed {
    pub trait Sealed {}
}

/// Type-erased view of a computed value, as stored in the registry and on
/// dependency edges.
///
/// This trait is sealed: the only implementation is the node behind
/// [`Computed`]. Use [`Computed::from_any`] to recover a typed handle.
pub trait AnyComputed: sealed::Sealed + Send + Sync + 'static {
    /// Registry key of this node.
    fn key(&self) -> &ComputedKey;

    /// Version stamp of this node.
    fn tag(&self) -> Tag;

    /// Current lifecycle state.
    fn state(&self) -> ComputedState;

    /// Invalidate this node and, transitively, everything that used it.
    ///
    /// Returns `true` only for the call that performed the transition.
    fn invalidate_with(&self, reason: InvalidationReason) -> bool;

    /// Why this node was invalidated, if it was.
    fn invalidation_reason(&self) -> Option<InvalidationReason>;

    /// Time of the last access, relative to the runtime's clock epoch.
    fn last_access(&self) -> Duration;

    /// Record an access now.
    fn touch(&self);

    /// Keep-alive window from the producing function's options.
    fn keep_alive(&self) -> Duration;

    /// Dependencies linked while this node was computing.
    fn used(&self) -> Vec<Arc<dyn AnyComputed>>;

    /// Live dependents of this node.
    fn used_by(&self) -> Vec<Arc<dyn AnyComputed>>;

    /// Number of dependent edges recorded on this node.
    ///
    /// A dependent removes its edge when it is invalidated or dropped. A
    /// dependent evicted from the registry keeps its edge until its last
    /// handle goes away, and the registry may release its handle lazily.
    fn used_by_count(&self) -> usize;

    #[doc(hidden)]
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;

    #[doc(hidden)]
    fn add_used(&self, used: Arc<dyn AnyComputed>) -> Result<(), ComputeError>;

    #[doc(hidden)]
    fn add_used_by(&self, dependent: Weak<dyn AnyComputed>, tag: Tag) -> Result<bool, ComputeError>;

    #[doc(hidden)]
    fn remove_used_by(&self, tag: Tag);

    #[doc(hidden)]
    fn invalidate_local(&self, reason: InvalidationReason) -> Option<Vec<Arc<dyn AnyComputed>>>;
}

impl fmt::Debug for dyn AnyComputed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyComputed")
            .field("key", self.key())
            .field("tag", &self.tag())
            .field("state", &self.state())
            .finish()
    }
}

struct ComputedInner<T> {
    state: ComputedState,
    output: Option<ComputedOutput<T>>,
    reason: Option<InvalidationReason>,
    used: HashMap<Tag, Arc<dyn AnyComputed>, ahash::RandomState>,
    used_by: HashMap<Tag, Weak<dyn AnyComputed>, ahash::RandomState>,
    handlers: Slab<InvalidatedHandler>,
}

pub(crate) struct ComputedBody<T> {
    key: ComputedKey,
    tag: Tag,
    options: ComputedOptions,
    clock: Clock,
    last_access: AtomicU64,
    runtime: Weak<RuntimeShared>,
    function: Weak<dyn Recompute<T>>,
    this: Weak<ComputedBody<T>>,
    inner: Mutex<ComputedInner<T>>,
}

impl<T> Drop for ComputedBody<T> {
    fn drop(&mut self) {
        for dependency in self.inner.get_mut().used.values() {
            dependency.remove_used_by(self.tag);
        }
    }
}

enum Link {
    Linked,
    Skipped,
    InvalidateSelf,
}

impl<T: Send + Sync + 'static> ComputedBody<T> {
    fn as_weak_dyn(&self) -> Weak<dyn AnyComputed> {
        self.this.clone()
    }

    fn cause(&self) -> InvalidationReason {
        InvalidationReason::DependencyInvalidated {
            key: self.key.clone(),
            tag: self.tag,
        }
    }

    fn schedule_invalidation(&self, is_error: bool) {
        let Some(delay) = self.options.invalidation_delay(is_error) else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            warn!(key = ?self.key, "no tokio runtime, auto-invalidation skipped");
            return;
        };
        let this = self.this.clone();
        handle.spawn(async move {
            tokio::time::sleep(delay).await;
            if let Some(this) = this.upgrade() {
                this.invalidate_with(InvalidationReason::Timeout);
            }
        });
    }
}

impl<T> sealed::Sealed for ComputedBody<T> {}

impl<T: Send + Sync + 'static> AnyComputed for ComputedBody<T> {
    fn key(&self) -> &ComputedKey {
        &self.key
    }

    fn tag(&self) -> Tag {
        self.tag
    }

    fn state(&self) -> ComputedState {
        self.inner.lock().state
    }

    fn invalidate_with(&self, reason: InvalidationReason) -> bool {
        let Some(dependents) = self.invalidate_local(reason) else {
            return false;
        };

        // Cascade with an explicit worklist so deep graphs don't grow the stack.
        let cause = self.cause();
        let mut pending: Vec<_> = dependents.into_iter().map(|d| (cause.clone(), d)).collect();
        while let Some((cause, node)) = pending.pop() {
            if let Some(next) = node.invalidate_local(cause) {
                let cause = InvalidationReason::DependencyInvalidated {
                    key: node.key().clone(),
                    tag: node.tag(),
                };
                pending.extend(next.into_iter().map(|d| (cause.clone(), d)));
            }
        }
        true
    }

    fn invalidation_reason(&self) -> Option<InvalidationReason> {
        self.inner.lock().reason.clone()
    }

    fn last_access(&self) -> Duration {
        Duration::from_millis(self.last_access.load(Ordering::Relaxed))
    }

    fn touch(&self) {
        self.last_access.store(self.clock.now_millis(), Ordering::Relaxed);
    }

    fn keep_alive(&self) -> Duration {
        self.options.keep_alive
    }

    fn used(&self) -> Vec<Arc<dyn AnyComputed>> {
        self.inner.lock().used.values().cloned().collect()
    }

    fn used_by(&self) -> Vec<Arc<dyn AnyComputed>> {
        let weak: Vec<_> = self.inner.lock().used_by.values().cloned().collect();
        weak.iter().filter_map(Weak::upgrade).collect()
    }

    fn used_by_count(&self) -> usize {
        self.inner.lock().used_by.len()
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }

    fn add_used(&self, used: Arc<dyn AnyComputed>) -> Result<(), ComputeError> {
        let link = {
            let mut inner = self.inner.lock();
            match inner.state {
                ComputedState::Invalidated => Link::Skipped,
                // The node already published its output; a late read can't be
                // tracked, so the output can't be trusted anymore.
                ComputedState::Computed => Link::InvalidateSelf,
                ComputedState::Computing if inner.used.contains_key(&used.tag()) => Link::Skipped,
                ComputedState::Computing => {
                    if used.add_used_by(self.as_weak_dyn(), self.tag)? {
                        inner.used.insert(used.tag(), used.clone());
                        Link::Linked
                    } else {
                        Link::InvalidateSelf
                    }
                }
            }
        };

        match link {
            Link::Linked => {
                trace!(parent = ?self.key, dependency = ?used.key(), "dependency linked");
                if let Some(runtime) = self.runtime.upgrade() {
                    runtime
                        .tracer
                        .on_dependency_registered(TracerKey::from(&self.key), TracerKey::from(used.key()));
                }
            }
            Link::Skipped => {}
            Link::InvalidateSelf => {
                self.invalidate_with(InvalidationReason::DependencyInvalidated {
                    key: used.key().clone(),
                    tag: used.tag(),
                });
            }
        }
        Ok(())
    }

    fn add_used_by(&self, dependent: Weak<dyn AnyComputed>, tag: Tag) -> Result<bool, ComputeError> {
        let mut inner = self.inner.lock();
        match inner.state {
            ComputedState::Computing => Err(ComputeError::invalid_state(format!(
                "{:?}{} used as a dependency while still computing",
                self.key, self.tag
            ))),
            ComputedState::Invalidated => Ok(false),
            ComputedState::Computed => {
                inner.used_by.insert(tag, dependent);
                Ok(true)
            }
        }
    }

    fn remove_used_by(&self, tag: Tag) {
        self.inner.lock().used_by.remove(&tag);
    }

    fn invalidate_local(&self, reason: InvalidationReason) -> Option<Vec<Arc<dyn AnyComputed>>> {
        let (used, used_by, handlers, was_computing) = {
            let mut inner = self.inner.lock();
            if inner.state == ComputedState::Invalidated {
                return None;
            }
            let was_computing = inner.state == ComputedState::Computing;
            inner.state = ComputedState::Invalidated;
            inner.reason = Some(reason.clone());
            (
                mem::take(&mut inner.used),
                mem::take(&mut inner.used_by),
                mem::take(&mut inner.handlers),
                was_computing,
            )
        };

        debug!(key = ?self.key, tag = %self.tag, %reason, was_computing, "invalidated");

        if let Some(runtime) = self.runtime.upgrade() {
            runtime.registry.unregister(&self.key, self.tag);
            runtime
                .tracer
                .on_invalidated(TracerKey::from(&self.key), self.tag, &reason);
        }

        for dependency in used.values() {
            dependency.remove_used_by(self.tag);
        }

        for (_, handler) in handlers {
            handler(&reason);
        }

        Some(used_by.values().filter_map(Weak::upgrade).collect())
    }
}

/// A memoized output of one compute function for one input key.
///
/// `Computed` is a cheap, cloneable handle. Clones refer to the same node and
/// keep it alive, even after the registry has evicted it.
pub struct Computed<T> {
    body: Arc<ComputedBody<T>>,
}

impl<T> Clone for Computed<T> {
    fn clone(&self) -> Self {
        Self {
            body: self.body.clone(),
        }
    }
}

impl<T: Send + Sync + 'static> fmt::Debug for Computed<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Computed")
            .field("key", &self.body.key)
            .field("tag", &self.body.tag)
            .field("state", &self.state())
            .finish()
    }
}

impl<T: Send + Sync + 'static> Computed<T> {
    /// Create a node in the `Computing` state.
    pub(crate) fn computing(
        key: ComputedKey,
        options: ComputedOptions,
        runtime: &Arc<RuntimeShared>,
        function: Weak<dyn Recompute<T>>,
    ) -> Self {
        let tag = runtime.tags.next();
        let clock = runtime.clock;
        let body = Arc::new_cyclic(|this| ComputedBody {
            key,
            tag,
            options,
            clock,
            last_access: AtomicU64::new(clock.now_millis()),
            runtime: Arc::downgrade(runtime),
            function,
            this: this.clone(),
            inner: Mutex::new(ComputedInner {
                state: ComputedState::Computing,
                output: None,
                reason: None,
                used: HashMap::default(),
                used_by: HashMap::default(),
                handlers: Slab::new(),
            }),
        });
        Self { body }
    }

    /// Recover a typed handle from a type-erased node.
    ///
    /// Returns `None` if the node holds a different output type.
    pub fn from_any(node: Arc<dyn AnyComputed>) -> Option<Self> {
        node.into_any()
            .downcast::<ComputedBody<T>>()
            .ok()
            .map(|body| Self { body })
    }

    /// Type-erased view of this node.
    pub fn as_any(&self) -> Arc<dyn AnyComputed> {
        self.body.clone()
    }

    /// Registry key of this node.
    pub fn key(&self) -> &ComputedKey {
        &self.body.key
    }

    /// Version stamp of this node.
    pub fn tag(&self) -> Tag {
        self.body.tag
    }

    /// Current lifecycle state.
    pub fn state(&self) -> ComputedState {
        self.body.state()
    }

    /// Returns true while the output is consistent with its dependencies.
    pub fn is_consistent(&self) -> bool {
        self.state() == ComputedState::Computed
    }

    /// Why this node was invalidated, if it was.
    pub fn invalidation_reason(&self) -> Option<InvalidationReason> {
        self.body.invalidation_reason()
    }

    /// Read the output.
    ///
    /// An invalidated node still returns the output it computed. Reading a
    /// node that is still computing is an [`ComputeError::InvalidState`].
    pub fn output(&self) -> ComputedOutput<T> {
        let inner = self.body.inner.lock();
        match (&inner.output, inner.state) {
            (Some(output), _) => output.clone(),
            (None, ComputedState::Computing) => Err(ComputeError::invalid_state(format!(
                "output of {:?}{} read while computing",
                self.body.key, self.body.tag
            ))),
            (None, _) => Err(ComputeError::invalid_state(format!(
                "{:?}{} was invalidated before producing an output",
                self.body.key, self.body.tag
            ))),
        }
    }

    /// Store the producer's output.
    ///
    /// Returns `false` if the node was invalidated while computing: the output
    /// is kept for the caller that computed it but never published.
    pub(crate) fn complete(&self, output: ComputedOutput<T>) -> bool {
        let is_error = output.is_err();
        let result = match &output {
            Ok(_) => ExecutionResult::Computed,
            Err(err) => ExecutionResult::Error {
                message: err.to_string(),
            },
        };

        let published = {
            let mut inner = self.body.inner.lock();
            inner.output = Some(output);
            if inner.state == ComputedState::Computing {
                inner.state = ComputedState::Computed;
                true
            } else {
                false
            }
        };

        self.body.touch();
        if let Some(runtime) = self.body.runtime.upgrade() {
            let result = if published {
                result
            } else {
                ExecutionResult::Discarded
            };
            runtime
                .tracer
                .on_compute_end(TracerKey::from(&self.body.key), self.body.tag, result);
        }

        if published {
            debug!(key = ?self.body.key, tag = %self.body.tag, is_error, "computed");
            self.body.schedule_invalidation(is_error);
        } else {
            debug!(key = ?self.body.key, tag = %self.body.tag, "invalidated while computing, output discarded");
        }
        published
    }

    /// Invalidate this node and everything that transitively used it.
    ///
    /// Returns `true` only for the call that performed the transition; later
    /// calls are no-ops.
    pub fn invalidate(&self) -> bool {
        self.body.invalidate_with(InvalidationReason::Explicit)
    }

    /// [`Computed::invalidate`] with an explicit reason.
    pub fn invalidate_with(&self, reason: InvalidationReason) -> bool {
        self.body.invalidate_with(reason)
    }

    /// Subscribe to this node's invalidation.
    ///
    /// The handler runs once, synchronously, on the invalidating task. If the
    /// node is already invalidated the handler runs immediately and `None` is
    /// returned.
    pub fn on_invalidated<F>(&self, handler: F) -> Option<HandlerId>
    where
        F: FnOnce(&InvalidationReason) + Send + 'static,
    {
        let mut inner = self.body.inner.lock();
        if inner.state == ComputedState::Invalidated {
            let reason = inner.reason.clone().unwrap_or(InvalidationReason::Explicit);
            drop(inner);
            handler(&reason);
            return None;
        }
        Some(HandlerId(inner.handlers.insert(Box::new(handler))))
    }

    /// Unsubscribe a handler registered with [`Computed::on_invalidated`].
    ///
    /// Returns `false` if the handler already ran or was removed.
    pub fn remove_invalidated_handler(&self, id: HandlerId) -> bool {
        self.body.inner.lock().handlers.try_remove(id.0).is_some()
    }

    /// Wait until this node is invalidated.
    pub async fn when_invalidated(&self) -> InvalidationReason {
        let (tx, rx) = oneshot::channel();
        self.on_invalidated(move |reason| {
            let _ = tx.send(reason.clone());
        });
        rx.await.unwrap_or(InvalidationReason::Abandoned)
    }

    /// Dependencies linked while this node was computing.
    pub fn used(&self) -> Vec<Arc<dyn AnyComputed>> {
        self.body.used()
    }

    /// Live dependents of this node.
    pub fn used_by(&self) -> Vec<Arc<dyn AnyComputed>> {
        self.body.used_by()
    }

    /// Returns a consistent node for the same key.
    ///
    /// A `Computed` node is returned as-is. Otherwise the key is resolved
    /// through its function again, which either finds a newer node or runs the
    /// producer with this node's output as the previous value. Renewing never
    /// links a dependency into the caller's computation.
    pub async fn renew(&self) -> Result<Computed<T>, ComputeError> {
        self.renew_with_cancel(&CancellationToken::new()).await
    }

    /// [`Computed::renew`] with a cancellation token.
    pub async fn renew_with_cancel(
        &self,
        cancel: &CancellationToken,
    ) -> Result<Computed<T>, ComputeError> {
        if self.state() == ComputedState::Computed {
            self.body.touch();
            return Ok(self.clone());
        }
        let function = self
            .body
            .function
            .upgrade()
            .ok_or_else(|| ComputeError::FunctionDropped {
                key: self.body.key.debug_repr(),
            })?;
        let previous = self.output().ok();
        function
            .recompute(&self.body.key, previous, cancel.clone())
            .await
    }

    /// Read a consistent output and record this node as a dependency of the
    /// computation running in the current context.
    pub async fn use_value(&self) -> ComputedOutput<T> {
        let node = self.renew().await?;
        if let Some(context) = ComputeContext::current() {
            if context.mode() == CallMode::Normal {
                context.link(node.as_any())?;
            }
        }
        node.output()
    }

    /// Record an access now, extending the keep-alive window.
    pub fn touch(&self) {
        self.body.touch();
    }

    /// Time of the last access, relative to the runtime's clock epoch.
    pub fn last_access(&self) -> Duration {
        self.body.last_access()
    }
}

/// Invalidates a node that was abandoned before its producer completed.
pub(crate) struct CompletionGuard<T: Send + Sync + 'static> {
    node: Option<Computed<T>>,
}

impl<T: Send + Sync + 'static> CompletionGuard<T> {
    pub(crate) fn new(node: Computed<T>) -> Self {
        Self { node: Some(node) }
    }

    pub(crate) fn complete(mut self, output: ComputedOutput<T>) -> bool {
        match self.node.take() {
            Some(node) => node.complete(output),
            None => false,
        }
    }
}

impl<T: Send + Sync + 'static> Drop for CompletionGuard<T> {
    fn drop(&mut self) {
        if let Some(node) = self.node.take() {
            warn!(key = ?node.key(), tag = %node.tag(), "computation abandoned");
            if let Some(runtime) = node.body.runtime.upgrade() {
                runtime
                    .tracer
                    .on_compute_end(TracerKey::from(node.key()), node.tag(), ExecutionResult::Panicked);
            }
            node.body.invalidate_with(InvalidationReason::Abandoned);
        }
    }
}
