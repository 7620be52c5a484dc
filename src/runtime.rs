//! The compute runtime: shared registry, tag source and tracer.

use std::future::Future;
use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::config::{ComputedOptions, DEFAULT_PRUNE_GRACE};
use crate::function::{ComputeFunction, Producer};
use crate::key::FunctionKey;
use crate::registry::{Clock, PruneStats, Registry};
use crate::tag::TagGenerator;
use crate::tracer::{NoopTracer, Tracer};

pub(crate) struct RuntimeShared {
    pub(crate) registry: Registry,
    pub(crate) tags: TagGenerator,
    pub(crate) clock: Clock,
    pub(crate) tracer: Arc<dyn Tracer>,
    pub(crate) shutdown: CancellationToken,
    default_options: ComputedOptions,
    prune_grace: Duration,
}

impl RuntimeShared {
    fn prune(&self) -> PruneStats {
        self.registry
            .prune(self.clock.now(), self.prune_grace, &*self.tracer)
    }
}

/// Owner of a registry of computed values and the functions that fill it.
///
/// Cloning is cheap; clones share the same registry. Functions created from a
/// runtime keep it alive.
///
/// # Example
///
/// ```ignore
/// let runtime = ComputeRuntime::builder()
///     .prune_grace(Duration::from_millis(250))
///     .build();
/// let _pruner = runtime.spawn_pruner(Duration::from_secs(1));
///
/// let user = runtime.function("user", |id: u64, _previous, _cancel| async move {
///     load_user(id).await
/// });
/// ```
#[derive(Clone)]
pub struct ComputeRuntime {
    shared: Arc<RuntimeShared>,
}

impl Default for ComputeRuntime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for ComputeRuntime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeRuntime")
            .field("registry", &self.shared.registry)
            .field("default_options", &self.shared.default_options)
            .field("prune_grace", &self.shared.prune_grace)
            .finish()
    }
}

impl ComputeRuntime {
    /// Create a runtime with default settings.
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Create a builder for configuring a runtime.
    pub fn builder() -> ComputeRuntimeBuilder {
        ComputeRuntimeBuilder::new()
    }

    /// Bind a producer closure to this runtime with the runtime's default options.
    pub fn function<K, T, F, Fut>(&self, name: impl Into<Arc<str>>, producer: F) -> ComputeFunction<K, T>
    where
        K: FunctionKey,
        T: Send + Sync + 'static,
        F: Fn(K, Option<Arc<T>>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.function_with_options(name, self.shared.default_options, producer)
    }

    /// Bind a producer closure to this runtime with explicit options.
    pub fn function_with_options<K, T, F, Fut>(
        &self,
        name: impl Into<Arc<str>>,
        options: ComputedOptions,
        producer: F,
    ) -> ComputeFunction<K, T>
    where
        K: FunctionKey,
        T: Send + Sync + 'static,
        F: Fn(K, Option<Arc<T>>, CancellationToken) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<T>> + Send + 'static,
    {
        self.producer_function(name, options, producer)
    }

    /// Bind a [`Producer`] implementation to this runtime.
    pub fn producer_function<K, T, P>(
        &self,
        name: impl Into<Arc<str>>,
        options: ComputedOptions,
        producer: P,
    ) -> ComputeFunction<K, T>
    where
        K: FunctionKey,
        T: Send + Sync + 'static,
        P: Producer<K, T>,
    {
        let name = name.into();
        debug!(function = %name, ?options, "function registered");
        ComputeFunction::new(name, options, self.shared.clone(), Arc::new(producer))
    }

    /// The registry of live computed values.
    pub fn registry(&self) -> &Registry {
        &self.shared.registry
    }

    /// Default options of functions created with [`ComputeRuntime::function`].
    pub fn default_options(&self) -> &ComputedOptions {
        &self.shared.default_options
    }

    /// Run one eviction pass now.
    pub fn prune(&self) -> PruneStats {
        self.shared.prune()
    }

    /// Run eviction every `interval` on a background task.
    ///
    /// The task stops when the returned handle is dropped, when the runtime
    /// shuts down, or when the last runtime handle is dropped.
    pub fn spawn_pruner(&self, interval: Duration) -> PrunerHandle {
        let shared: Weak<RuntimeShared> = Arc::downgrade(&self.shared);
        let shutdown = self.shared.shutdown.clone();
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval.max(Duration::from_millis(1)));
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(shared) = shared.upgrade() else {
                    break;
                };
                shared.prune();
            }
            debug!("pruner stopped");
        });
        PrunerHandle { handle }
    }

    /// Invalidate every registered computed value.
    ///
    /// Returns the number of values that transitioned to `Invalidated`.
    pub fn invalidate_everything(&self) -> usize {
        let count = self.shared.registry.invalidate_everything();
        info!(count, "invalidated everything");
        count
    }

    /// Drop every computed value from the registry without invalidating it.
    ///
    /// Holders of [`Computed`](crate::Computed) handles keep them, still
    /// consistent; subsequent calls compute fresh values.
    pub fn clear(&self) {
        self.shared.registry.clear();
    }

    /// Tear the runtime down.
    ///
    /// Cancels the token of every running producer, stops pruners and clears
    /// the registry. Functions stay usable, but producers started afterwards
    /// observe a cancelled token.
    pub fn shutdown(&self) {
        info!("shutting down");
        self.shared.shutdown.cancel();
        self.shared.registry.clear();
    }

    /// Returns true once [`ComputeRuntime::shutdown`] has been called.
    pub fn is_shut_down(&self) -> bool {
        self.shared.shutdown.is_cancelled()
    }
}

/// Builder for [`ComputeRuntime`].
pub struct ComputeRuntimeBuilder {
    default_options: ComputedOptions,
    prune_grace: Duration,
    tracer: Arc<dyn Tracer>,
}

impl Default for ComputeRuntimeBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ComputeRuntimeBuilder {
    /// Create a new builder with default settings.
    pub fn new() -> Self {
        Self {
            default_options: ComputedOptions::default(),
            prune_grace: DEFAULT_PRUNE_GRACE,
            tracer: Arc::new(NoopTracer),
        }
    }

    /// Set the options used by [`ComputeRuntime::function`].
    pub fn default_options(mut self, options: ComputedOptions) -> Self {
        self.default_options = options;
        self
    }

    /// Set the minimum age below which no computed value is pruned, whatever
    /// its keep-alive.
    pub fn prune_grace(mut self, grace: Duration) -> Self {
        self.prune_grace = grace;
        self
    }

    /// Install a tracer.
    pub fn tracer(mut self, tracer: impl Tracer) -> Self {
        self.tracer = Arc::new(tracer);
        self
    }

    /// Install a shared tracer.
    pub fn tracer_arc(mut self, tracer: Arc<dyn Tracer>) -> Self {
        self.tracer = tracer;
        self
    }

    /// Build the runtime.
    pub fn build(self) -> ComputeRuntime {
        ComputeRuntime {
            shared: Arc::new(RuntimeShared {
                registry: Registry::new(),
                tags: TagGenerator::default(),
                clock: Clock::new(),
                tracer: self.tracer,
                shutdown: CancellationToken::new(),
                default_options: self.default_options,
                prune_grace: self.prune_grace,
            }),
        }
    }
}

/// Handle of a background pruner; aborts it on drop.
#[derive(Debug)]
pub struct PrunerHandle {
    handle: JoinHandle<()>,
}

impl PrunerHandle {
    /// Stop the pruner.
    pub fn stop(self) {}
}

impl Drop for PrunerHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}
