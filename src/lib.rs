#![deny(missing_docs)]
#![doc = include_str!("../README.md")]

mod computed;
mod config;
mod context;
mod error;
mod function;
mod invalidation;
mod key;
mod lock;
mod registry;
mod runtime;
mod tag;
pub mod tracer;

pub use computed::{AnyComputed, Computed, ComputedOutput, ComputedState, HandlerId};
pub use config::{ComputedOptions, DEFAULT_KEEP_ALIVE, DEFAULT_PRUNE_GRACE};
pub use context::{capture, invalidate, CallMode, ComputeContext};
pub use error::{ComputeError, ComputeResultExt, LockError, TypedErr};
pub use function::{ComputeFunction, Producer};
pub use invalidation::InvalidationReason;
pub use key::{CacheKey, ComputedKey, DynEq, FunctionId, FunctionKey};
pub use lock::{AsyncLock, AsyncLockGuard, AsyncLockSet, AsyncLockSetGuard, ReentryMode};
pub use registry::{PruneStats, Registry};
pub use runtime::{ComputeRuntime, ComputeRuntimeBuilder, PrunerHandle};
pub use tag::Tag;
pub use tracer::{ExecutionResult, NoopTracer, Tracer, TracerKey};

/// Re-exported for producer signatures.
pub use tokio_util::sync::CancellationToken;
