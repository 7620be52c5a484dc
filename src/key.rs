//! Key types identifying computed values.

use std::any::Any;
use std::fmt::Debug;
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dyn_hash::DynHash;

/// Object-safe equality comparison.
///
/// This trait enables comparing two trait objects for equality
/// by downcasting and comparing the concrete types.
pub trait DynEq: Any {
    /// Compare self with another value for equality.
    ///
    /// Returns `true` if `other` is the same concrete type and equal to `self`.
    fn dyn_eq(&self, other: &dyn Any) -> bool;
}

impl<T: Eq + 'static> DynEq for T {
    fn dyn_eq(&self, other: &dyn Any) -> bool {
        other.downcast_ref::<T>().is_some_and(|o| self == o)
    }
}

/// Trait for types that can serve as input keys of a [`ComputeFunction`](crate::ComputeFunction).
///
/// Automatically implemented for every `Hash + Eq + Debug + Send + Sync + 'static`
/// type. Equality and hashing are value-based, so two structurally equal keys
/// address the same computed value.
pub trait CacheKey: DynHash + DynEq + Debug + Send + Sync {
    /// Get the key as `Any` for downcasting.
    fn as_any(&self) -> &dyn Any;

    /// Get the type name for this key.
    fn type_name(&self) -> &'static str;
}

impl<T: Hash + Eq + Debug + Send + Sync + 'static> CacheKey for T {
    fn as_any(&self) -> &dyn Any {
        self
    }

    fn type_name(&self) -> &'static str {
        std::any::type_name::<T>()
    }
}

dyn_hash::hash_trait_object!(CacheKey);

/// Bounds required of a [`ComputeFunction`](crate::ComputeFunction) input key.
///
/// Keys are cloned into the producer task and into the per-key lock set.
pub trait FunctionKey: Hash + Eq + Clone + Debug + Send + Sync + 'static {}

impl<T> FunctionKey for T where T: Hash + Eq + Clone + Debug + Send + Sync + 'static {}

/// Identity of one compute function registered with a runtime.
///
/// Two functions built from the same closure type are still distinct
/// functions; identity is assigned at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FunctionId(pub u64);

static NEXT_FUNCTION_ID: AtomicU64 = AtomicU64::new(1);

impl FunctionId {
    pub(crate) fn next() -> Self {
        FunctionId(NEXT_FUNCTION_ID.fetch_add(1, Ordering::Relaxed))
    }
}

/// Registry key of a computed value: the producing function plus its input.
#[derive(Clone)]
pub struct ComputedKey {
    function: FunctionId,
    function_name: Arc<str>,
    key: Arc<dyn CacheKey>,
}

impl ComputedKey {
    /// Create a new computed key.
    pub fn new<K: CacheKey + 'static>(
        function: FunctionId,
        function_name: Arc<str>,
        key: K,
    ) -> Self {
        Self {
            function,
            function_name,
            key: Arc::new(key),
        }
    }

    /// Get the debug representation of this key.
    pub fn debug_repr(&self) -> String {
        format!("{}({:?})", self.function_name, self.key)
    }

    /// Downcast the input key to its original type.
    pub fn downcast<K: 'static>(&self) -> Option<&K> {
        self.key.as_any().downcast_ref()
    }

    /// Get the producing function's identity.
    pub fn function(&self) -> FunctionId {
        self.function
    }

    /// Get the producing function's display name.
    pub fn function_name(&self) -> &str {
        &self.function_name
    }

    /// Get a reference to the type-erased input key.
    pub fn key(&self) -> &Arc<dyn CacheKey> {
        &self.key
    }
}

impl Debug for ComputedKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}({:?})", self.function_name, self.key)
    }
}

impl Hash for ComputedKey {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.function.hash(state);
        self.key.hash(state);
    }
}

impl PartialEq for ComputedKey {
    fn eq(&self, other: &Self) -> bool {
        self.function == other.function && self.key.dyn_eq(other.key.as_any())
    }
}

impl Eq for ComputedKey {}
