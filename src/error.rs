//! Error types for computed value access.

use std::fmt;
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

use thiserror::Error;

/// Errors surfaced by computed value access.
///
/// Producer failures are carried unchanged in [`ComputeError::Producer`]: the
/// `Display` output is the producer's own message and the original error can
/// be recovered with [`ComputeError::downcast_ref`]. All other variants are
/// raised by the cache itself.
#[derive(Debug, Clone, Error)]
pub enum ComputeError {
    /// The producer failed.
    ///
    /// Producer errors are cached as the node output: every caller sees the
    /// same error until the node is invalidated or evicted.
    #[error("{0}")]
    Producer(Arc<anyhow::Error>),

    /// A computation re-entered itself within one logical flow.
    ///
    /// The `path` lists the computations of the cycle, outermost first.
    #[error("circular dependency detected: {}", .path.join(" -> "))]
    Cycle {
        /// Debug representation of the computations forming the cycle.
        path: Vec<String>,
    },

    /// The caller's cancellation token fired before a result was available.
    ///
    /// Cancellation only detaches the cancelling caller; an in-flight
    /// producer keeps running for other waiters.
    #[error("computation cancelled")]
    Cancelled,

    /// A broken invariant of the computed value graph.
    #[error("invalid computed state: {message}")]
    InvalidState {
        /// Description of the violated invariant.
        message: String,
    },

    /// The call was made inside an invalidation scope, which resolves and
    /// invalidates the backing computed value instead of producing one.
    #[error("call intercepted by an invalidation scope")]
    Intercepted,

    /// The producer task panicked.
    #[error("producer panicked while computing {key}")]
    Panicked {
        /// Debug representation of the computation that panicked.
        key: String,
    },

    /// The function that owns a computed value has been dropped, so the value
    /// can no longer be renewed.
    #[error("compute function for {key} was dropped")]
    FunctionDropped {
        /// Debug representation of the orphaned computation.
        key: String,
    },
}

impl ComputeError {
    pub(crate) fn invalid_state(message: impl Into<String>) -> Self {
        ComputeError::InvalidState {
            message: message.into(),
        }
    }

    /// Convert a producer's error into a `ComputeError`.
    ///
    /// A `ComputeError` that travelled through a producer via `?` is returned
    /// as-is, so a nested cycle or cancellation keeps its variant.
    pub fn from_producer(err: anyhow::Error) -> Self {
        match err.downcast::<ComputeError>() {
            Ok(inner) => inner,
            Err(err) => ComputeError::Producer(Arc::new(err)),
        }
    }

    /// Returns a reference to the producer error if this is a `Producer` variant.
    pub fn producer_error(&self) -> Option<&Arc<anyhow::Error>> {
        match self {
            ComputeError::Producer(e) => Some(e),
            _ => None,
        }
    }

    /// Attempts to downcast the producer error to a specific type.
    ///
    /// Returns `Some(&E)` if this is a `Producer` error containing an error of
    /// type `E`, otherwise returns `None`.
    pub fn downcast_ref<E: std::error::Error + Send + Sync + 'static>(&self) -> Option<&E> {
        self.producer_error().and_then(|e| e.downcast_ref::<E>())
    }

    /// Returns `true` if this is a `Producer` error containing an error of type `E`.
    pub fn is<E: std::error::Error + Send + Sync + 'static>(&self) -> bool {
        self.downcast_ref::<E>().is_some()
    }

    /// Returns `true` if this error came from the cache rather than a producer.
    pub fn is_system(&self) -> bool {
        !matches!(self, ComputeError::Producer(_))
    }
}

impl From<anyhow::Error> for ComputeError {
    fn from(err: anyhow::Error) -> Self {
        ComputeError::from_producer(err)
    }
}

/// Errors raised by [`AsyncLock`](crate::AsyncLock) and [`AsyncLockSet`](crate::AsyncLockSet).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum LockError {
    /// The cancellation token fired before the lock was acquired.
    #[error("lock acquisition cancelled")]
    Cancelled,
    /// The lock is already held by the current flow and re-entry is refused.
    #[error("lock is already held by the current task")]
    Reentry,
}

impl From<LockError> for ComputeError {
    fn from(err: LockError) -> Self {
        match err {
            LockError::Cancelled => ComputeError::Cancelled,
            LockError::Reentry => ComputeError::invalid_state(err.to_string()),
        }
    }
}

/// A typed wrapper around a producer error that provides `Deref` access to the
/// inner error type.
///
/// # Example
///
/// ```ignore
/// use compute_flow::ComputeResultExt;
///
/// match users.get(42).await.downcast_err::<NotFound>()? {
///     Ok(user) => println!("{}", user.name),
///     Err(not_found) => println!("missing: {}", not_found.id),
/// }
/// ```
#[derive(Clone)]
pub struct TypedErr<E> {
    arc: Arc<anyhow::Error>,
    _marker: PhantomData<E>,
}

impl<E: std::error::Error + Send + Sync + 'static> TypedErr<E> {
    fn new(arc: Arc<anyhow::Error>) -> Option<Self> {
        if arc.downcast_ref::<E>().is_some() {
            Some(Self {
                arc,
                _marker: PhantomData,
            })
        } else {
            None
        }
    }

    /// Returns a reference to the inner error.
    pub fn get(&self) -> &E {
        match self.arc.downcast_ref::<E>() {
            Some(err) => err,
            None => unreachable!("TypedErr is only constructed after a successful downcast"),
        }
    }

    /// The cached producer error, including any context the producer attached.
    ///
    /// The error is shared with the node output, so every caller of the same
    /// node sees the same instance.
    pub fn as_anyhow(&self) -> &anyhow::Error {
        &self.arc
    }

    /// Converts back into the [`ComputeError::Producer`] it came from.
    pub fn into_compute_error(self) -> ComputeError {
        ComputeError::Producer(self.arc)
    }
}

impl<E: std::error::Error + Send + Sync + 'static> Deref for TypedErr<E> {
    type Target = E;

    fn deref(&self) -> &E {
        self.get()
    }
}

impl<E: std::error::Error + Send + Sync + 'static> fmt::Debug for TypedErr<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self.get(), f)
    }
}

impl<E: std::error::Error + Send + Sync + 'static> fmt::Display for TypedErr<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self.get(), f)
    }
}

/// Extension trait for computed value results that provides ergonomic error
/// downcasting.
///
/// Implemented for [`ComputedOutput`](crate::ComputedOutput), the result of
/// `ComputeFunction::get` and `Computed::output`. Only sticky producer errors
/// are candidates for the downcast. Failures of the cache itself (cycles,
/// cancellation, panics) always stay on the outer `Err`, so `?` propagates them.
///
/// # Example
///
/// ```ignore
/// use compute_flow::ComputeResultExt;
///
/// let profile = match profiles.get(id).await.downcast_err::<NotFound>()? {
///     Ok(profile) => profile,
///     Err(_) => Arc::new(Profile::anonymous()),
/// };
/// ```
pub trait ComputeResultExt<T> {
    /// Attempts to downcast a `Producer` error to a specific error type.
    ///
    /// # Returns
    ///
    /// - `Ok(Ok(value))` - The computation succeeded with `value`
    /// - `Ok(Err(typed_err))` - The producer failed with an error of type `E`
    /// - `Err(compute_error)` - The cache failed (cycle, cancellation, panic, ...),
    ///   or the producer failed with an error that is not of type `E`
    fn downcast_err<E: std::error::Error + Send + Sync + 'static>(
        self,
    ) -> Result<Result<Arc<T>, TypedErr<E>>, ComputeError>;
}

impl<T> ComputeResultExt<T> for Result<Arc<T>, ComputeError> {
    fn downcast_err<E: std::error::Error + Send + Sync + 'static>(
        self,
    ) -> Result<Result<Arc<T>, TypedErr<E>>, ComputeError> {
        match self {
            Ok(value) => Ok(Ok(value)),
            Err(ComputeError::Producer(arc)) => match TypedErr::new(arc.clone()) {
                Some(typed) => Ok(Err(typed)),
                None => Err(ComputeError::Producer(arc)),
            },
            Err(other) => Err(other),
        }
    }
}
