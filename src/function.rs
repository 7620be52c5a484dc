//! Compute functions: producers bound to the cache.
//!
//! A [`ComputeFunction`] owns a [`Producer`] and turns calls into cached,
//! single-flight, dependency-tracked computed values. Per key, at most one
//! producer invocation runs at a time; concurrent callers wait for it and
//! share its node.

use std::future::Future;
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::future::join_all;
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, trace, Instrument};

use crate::computed::{CompletionGuard, Computed, ComputedOutput, ComputedState};
use crate::config::ComputedOptions;
use crate::context::{CallMode, ComputeContext};
use crate::error::ComputeError;
use crate::invalidation::InvalidationReason;
use crate::key::{ComputedKey, FunctionId, FunctionKey};
use crate::lock::{AsyncLockSet, ReentryMode};
use crate::runtime::RuntimeShared;
use crate::tracer::TracerKey;

/// Computes the value for one key.
///
/// `previous` carries the output of the invalidated node being renewed, if
/// any, so producers can compute incrementally. `cancel` fires when the
/// runtime shuts down; it does not fire when a waiting caller gives up, since
/// other callers may still be waiting for the same value.
///
/// Closures `Fn(K, Option<Arc<T>>, CancellationToken) -> impl Future` implement
/// this trait.
///
/// # Example
///
/// ```ignore
/// struct LoadUser { db: Db }
///
/// #[async_trait]
/// impl Producer<UserId, User> for LoadUser {
///     async fn produce(
///         &self,
///         id: &UserId,
///         _previous: Option<Arc<User>>,
///         _cancel: CancellationToken,
///     ) -> anyhow::Result<User> {
///         Ok(self.db.load_user(*id).await?)
///     }
/// }
/// ```
#[async_trait]
pub trait Producer<K, T>: Send + Sync + 'static {
    /// Produce the value for `key`.
    async fn produce(
        &self,
        key: &K,
        previous: Option<Arc<T>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<T>;
}

#[async_trait]
impl<K, T, F, Fut> Producer<K, T> for F
where
    K: Clone + Send + Sync + 'static,
    T: Send + Sync + 'static,
    F: Fn(K, Option<Arc<T>>, CancellationToken) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
{
    async fn produce(
        &self,
        key: &K,
        previous: Option<Arc<T>>,
        cancel: CancellationToken,
    ) -> anyhow::Result<T> {
        (self)(key.clone(), previous, cancel).await
    }
}

/// Re-resolution of a type-erased key, used to renew invalidated nodes.
#[async_trait]
pub(crate) trait Recompute<T>: Send + Sync {
    async fn recompute(
        &self,
        key: &ComputedKey,
        previous: Option<Arc<T>>,
        cancel: CancellationToken,
    ) -> Result<Computed<T>, ComputeError>;
}

struct FunctionShared<K, T> {
    id: FunctionId,
    name: Arc<str>,
    producer: Arc<dyn Producer<K, T>>,
    options: ComputedOptions,
    runtime: Arc<RuntimeShared>,
    locks: AsyncLockSet<K>,
    this: Weak<FunctionShared<K, T>>,
}

/// A producer bound to a runtime.
///
/// Cloning is cheap; clones share the same cache entries.
///
/// # Example
///
/// ```ignore
/// let runtime = ComputeRuntime::new();
/// let square = runtime.function("square", |n: u64, _previous, _cancel| async move {
///     Ok(n * n)
/// });
/// assert_eq!(*square.get(7).await?, 49);
/// ```
pub struct ComputeFunction<K, T> {
    shared: Arc<FunctionShared<K, T>>,
}

impl<K, T> Clone for ComputeFunction<K, T> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K, T> std::fmt::Debug for ComputeFunction<K, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeFunction")
            .field("id", &self.shared.id)
            .field("name", &self.shared.name)
            .finish()
    }
}

impl<K: FunctionKey, T: Send + Sync + 'static> ComputeFunction<K, T> {
    pub(crate) fn new(
        name: Arc<str>,
        options: ComputedOptions,
        runtime: Arc<RuntimeShared>,
        producer: Arc<dyn Producer<K, T>>,
    ) -> Self {
        let shared = Arc::new_cyclic(|this| FunctionShared {
            id: FunctionId::next(),
            name,
            producer,
            options,
            runtime,
            locks: AsyncLockSet::new(ReentryMode::UncheckedDeadlock),
            this: this.clone(),
        });
        Self { shared }
    }

    /// Identity of this function.
    pub fn id(&self) -> FunctionId {
        self.shared.id
    }

    /// Display name of this function.
    pub fn name(&self) -> &str {
        &self.shared.name
    }

    /// Options applied to the computed values of this function.
    pub fn options(&self) -> &ComputedOptions {
        &self.shared.options
    }

    /// Registry key of the computed value for `key`.
    pub fn computed_key(&self, key: K) -> ComputedKey {
        self.shared.computed_key(key)
    }

    /// Get the value for `key`, computing it if needed.
    ///
    /// Called from inside another producer, the resolved node is recorded as a
    /// dependency of the node that producer computes.
    pub async fn get(&self, key: K) -> ComputedOutput<T> {
        self.get_with_cancel(key, &CancellationToken::new()).await
    }

    /// [`ComputeFunction::get`] with a cancellation token.
    ///
    /// Cancelling only detaches this caller. A producer already running for
    /// the key keeps running for other callers.
    pub async fn get_with_cancel(&self, key: K, cancel: &CancellationToken) -> ComputedOutput<T> {
        self.computed_with_cancel(key, cancel).await?.output()
    }

    /// Get the values for several keys concurrently.
    ///
    /// Results are in the order of `keys`.
    pub async fn get_all(&self, keys: impl IntoIterator<Item = K>) -> Vec<ComputedOutput<T>> {
        join_all(keys.into_iter().map(|key| self.get(key))).await
    }

    /// Get the computed value node for `key`, computing it if needed.
    pub async fn computed(&self, key: K) -> Result<Computed<T>, ComputeError> {
        self.computed_with_cancel(key, &CancellationToken::new())
            .await
    }

    /// [`ComputeFunction::computed`] with a cancellation token.
    pub async fn computed_with_cancel(
        &self,
        key: K,
        cancel: &CancellationToken,
    ) -> Result<Computed<T>, ComputeError> {
        self.shared.resolve(key, None, true, cancel).await
    }

    /// The consistent node for `key`, if one is registered. Never computes.
    pub fn try_get_cached(&self, key: &K) -> Option<Computed<T>> {
        self.shared.cached(&self.shared.computed_key(key.clone()))
    }

    /// Invalidate the registered node for `key`, if any.
    ///
    /// Returns `true` if a node transitioned to `Invalidated`.
    pub fn invalidate(&self, key: &K) -> bool {
        let full_key = self.shared.computed_key(key.clone());
        match self.shared.runtime.registry.get(&full_key) {
            Some(node) => node.invalidate_with(InvalidationReason::Explicit),
            None => false,
        }
    }
}

impl<K: FunctionKey, T: Send + Sync + 'static> FunctionShared<K, T> {
    fn computed_key(&self, key: K) -> ComputedKey {
        ComputedKey::new(self.id, self.name.clone(), key)
    }

    /// Registered node for `full_key`, if it is consistent.
    fn cached(&self, full_key: &ComputedKey) -> Option<Computed<T>> {
        let node = Computed::<T>::from_any(self.runtime.registry.get(full_key)?)?;
        if node.state() != ComputedState::Computed {
            return None;
        }
        node.touch();
        trace!(key = ?full_key, tag = %node.tag(), "cache hit");
        self.runtime
            .tracer
            .on_cache_hit(TracerKey::from(full_key), node.tag());
        Some(node)
    }

    async fn resolve(
        &self,
        key: K,
        previous: Option<Arc<T>>,
        link: bool,
        cancel: &CancellationToken,
    ) -> Result<Computed<T>, ComputeError> {
        let full_key = self.computed_key(key.clone());
        let context = ComputeContext::current();

        if let Some(context) = context.as_ref().filter(|c| c.mode() == CallMode::Invalidate) {
            if let Some(node) = self.runtime.registry.get(&full_key) {
                if node.invalidate_with(InvalidationReason::Explicit) {
                    context.record(node);
                }
            }
            return Err(ComputeError::Intercepted);
        }

        if let Some(path) = context.as_ref().and_then(|c| c.find_cycle(&full_key)) {
            debug!(key = ?full_key, "circular dependency detected");
            self.runtime
                .tracer
                .on_cycle_detected(path.iter().map(TracerKey::from).collect());
            return Err(ComputeError::Cycle {
                path: path.iter().map(ComputedKey::debug_repr).collect(),
            });
        }

        let node = self
            .get_or_compute(key, &full_key, previous, context.clone(), cancel)
            .await?;

        if let Some(context) = &context {
            match context.mode() {
                CallMode::Capture => context.record(node.as_any()),
                CallMode::Normal if link => context.link(node.as_any())?,
                _ => {}
            }
        }
        Ok(node)
    }

    async fn get_or_compute(
        &self,
        key: K,
        full_key: &ComputedKey,
        previous: Option<Arc<T>>,
        context: Option<ComputeContext>,
        cancel: &CancellationToken,
    ) -> Result<Computed<T>, ComputeError> {
        if let Some(node) = self.cached(full_key) {
            return Ok(node);
        }

        let guard = self.locks.lock(key.clone(), cancel).await?;

        // Another caller may have computed the value while we waited.
        if let Some(node) = self.cached(full_key) {
            return Ok(node);
        }

        let node = Computed::computing(
            full_key.clone(),
            self.options,
            &self.runtime,
            self.this.clone(),
        );
        self.runtime.registry.register(node.as_any());
        self.runtime
            .tracer
            .on_compute_start(TracerKey::from(full_key), node.tag());

        let span = debug_span!("compute", key = ?full_key, tag = %node.tag());
        let producer = self.producer.clone();
        let token = self.runtime.shutdown.child_token();
        let completion = CompletionGuard::new(node.clone());
        let task = ComputeContext::computing(node.as_any(), context).scope(
            async move {
                trace!("producer started");
                let output = producer
                    .produce(&key, previous, token)
                    .await
                    .map(Arc::new)
                    .map_err(ComputeError::from_producer);
                completion.complete(output);
                // The key stays locked until the node is complete.
                drop(guard);
            }
            .instrument(span),
        );

        // The producer runs on its own task so cancelling this caller leaves it
        // running for the others waiting on the key lock.
        let handle = tokio::spawn(task);

        let joined = tokio::select! {
            biased;
            _ = cancel.cancelled() => return Err(ComputeError::Cancelled),
            joined = handle => joined,
        };

        match joined {
            Ok(()) => Ok(node),
            Err(err) if err.is_panic() => Err(ComputeError::Panicked {
                key: full_key.debug_repr(),
            }),
            Err(_) => Err(ComputeError::Cancelled),
        }
    }
}

#[async_trait]
impl<K: FunctionKey, T: Send + Sync + 'static> Recompute<T> for FunctionShared<K, T> {
    async fn recompute(
        &self,
        key: &ComputedKey,
        previous: Option<Arc<T>>,
        cancel: CancellationToken,
    ) -> Result<Computed<T>, ComputeError> {
        let key = key.downcast::<K>().cloned().ok_or_else(|| {
            ComputeError::invalid_state(format!("{key:?} does not belong to {}", self.name))
        })?;
        self.resolve(key, previous, false, &cancel).await
    }
}
