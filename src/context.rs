//! Ambient computation context.
//!
//! Every producer runs inside a [`ComputeContext`] naming the node it computes.
//! Compute functions called from the producer find it through
//! [`ComputeContext::current`] and link their result as a dependency, so
//! dependency tracking needs no explicit plumbing.
//!
//! The context is a tokio task-local. It follows `.await` points within one
//! task and is *not* inherited by `tokio::spawn`ed tasks: work spawned from a
//! producer runs untracked unless it is wrapped with [`ComputeContext::scope`].

use std::future::Future;
use std::sync::Arc;

use parking_lot::Mutex;

use crate::computed::{AnyComputed, Computed};
use crate::error::ComputeError;
use crate::key::ComputedKey;

tokio::task_local! {
    static CURRENT: ComputeContext;
}

/// How compute functions treat calls made in a context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallMode {
    /// Resolve the value and link it into the computing node.
    Normal,
    /// Resolve the value and record the first resolved node instead of
    /// linking it. See [`capture`].
    Capture,
    /// Invalidate the existing node instead of resolving. See [`invalidate`].
    Invalidate,
}

struct ContextInner {
    mode: CallMode,
    computing: Option<Arc<dyn AnyComputed>>,
    parent: Option<ComputeContext>,
    captured: Mutex<Vec<Arc<dyn AnyComputed>>>,
}

/// The computation a piece of async code runs on behalf of.
#[derive(Clone)]
pub struct ComputeContext {
    inner: Arc<ContextInner>,
}

impl std::fmt::Debug for ComputeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ComputeContext")
            .field("mode", &self.inner.mode)
            .field("computing", &self.inner.computing.as_ref().map(|n| n.key()))
            .finish()
    }
}

impl ComputeContext {
    fn new(
        mode: CallMode,
        computing: Option<Arc<dyn AnyComputed>>,
        parent: Option<ComputeContext>,
    ) -> Self {
        Self {
            inner: Arc::new(ContextInner {
                mode,
                computing,
                parent,
                captured: Mutex::new(Vec::new()),
            }),
        }
    }

    /// The context of the current task, if any.
    pub fn current() -> Option<ComputeContext> {
        CURRENT.try_with(|context| context.clone()).ok()
    }

    /// A context computing `node`, nested in `parent`.
    pub(crate) fn computing(node: Arc<dyn AnyComputed>, parent: Option<ComputeContext>) -> Self {
        Self::new(CallMode::Normal, Some(node), parent)
    }

    /// Call mode of this context.
    pub fn mode(&self) -> CallMode {
        self.inner.mode
    }

    /// The node being computed in this context, if any.
    pub fn computing_node(&self) -> Option<&Arc<dyn AnyComputed>> {
        self.inner.computing.as_ref()
    }

    /// The context this one was entered from.
    pub fn parent(&self) -> Option<&ComputeContext> {
        self.inner.parent.as_ref()
    }

    /// Run `future` with this context as the current one.
    pub async fn scope<F: Future>(self, future: F) -> F::Output {
        CURRENT.scope(self, future).await
    }

    /// Record `node` as a dependency of the computing node.
    pub(crate) fn link(&self, node: Arc<dyn AnyComputed>) -> Result<(), ComputeError> {
        match &self.inner.computing {
            Some(parent) => parent.add_used(node),
            None => Ok(()),
        }
    }

    /// Record a node resolved or invalidated under a capture or invalidation
    /// scope. A capture scope keeps only the first one.
    pub(crate) fn record(&self, node: Arc<dyn AnyComputed>) {
        let mut captured = self.inner.captured.lock();
        if self.inner.mode == CallMode::Capture && !captured.is_empty() {
            return;
        }
        captured.push(node);
    }

    fn take_recorded(&self) -> Vec<Arc<dyn AnyComputed>> {
        std::mem::take(&mut *self.inner.captured.lock())
    }

    /// If `key` is already being computed somewhere up the chain, returns the
    /// cycle path: the computations from the first occurrence of `key` down to
    /// the current one, followed by `key` again.
    pub(crate) fn find_cycle(&self, key: &ComputedKey) -> Option<Vec<ComputedKey>> {
        let mut chain = Vec::new();
        let mut context = Some(self);
        while let Some(current) = context {
            if let Some(node) = &current.inner.computing {
                chain.push(node.key().clone());
            }
            context = current.inner.parent.as_ref();
        }
        chain.reverse();

        let start = chain.iter().position(|k| k == key)?;
        let mut path = chain.split_off(start);
        path.push(key.clone());
        Some(path)
    }
}

/// Run `future` and return the first computed value resolved directly in it.
///
/// Resolved values are not linked into any enclosing computation. Calls made by
/// producers the future triggers are tracked as usual, since those producers
/// run in their own context.
///
/// # Example
///
/// ```ignore
/// let node = capture::<String, _>(async { title.get(1).await }).await;
/// node.unwrap().when_invalidated().await;
/// ```
pub async fn capture<T, F>(future: F) -> Option<Computed<T>>
where
    T: Send + Sync + 'static,
    F: Future,
{
    let context = ComputeContext::new(CallMode::Capture, None, ComputeContext::current());
    context.clone().scope(future).await;
    context
        .take_recorded()
        .into_iter()
        .next()
        .and_then(Computed::from_any)
}

/// Run `future` with every compute function call turned into an invalidation.
///
/// Each call made directly in the future invalidates the registered node for
/// its key, if any, and fails with [`ComputeError::Intercepted`] instead of
/// producing a value. Returns the number of nodes invalidated.
///
/// # Example
///
/// ```ignore
/// invalidate(async {
///     let _ = users.get(42).await;
///     let _ = user_title.get(42).await;
/// })
/// .await;
/// ```
pub async fn invalidate<F: Future>(future: F) -> usize {
    let context = ComputeContext::new(CallMode::Invalidate, None, ComputeContext::current());
    context.clone().scope(future).await;
    context.take_recorded().len()
}
