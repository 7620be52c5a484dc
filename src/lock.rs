//! Async mutual exclusion with optional re-entry tracking, and per-key lock sets.
//!
//! Waiting for a lock suspends the calling task instead of blocking a worker
//! thread. Locks are released by dropping the guard, so a lock is released
//! exactly once, including when the owning future is dropped mid-flight.
//!
//! The logical flow that owns a lock is identified by the tokio task id.
//! Outside a tokio task there is no flow identity, and the checked modes
//! behave like [`ReentryMode::UncheckedDeadlock`].

use std::collections::HashMap;
use std::fmt;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::sync::Semaphore;
use tokio::task::Id as TaskId;
use tokio_util::sync::CancellationToken;

use crate::error::LockError;

/// Maximum number of released lock entries an [`AsyncLockSet`] keeps for reuse.
const POOL_CAPACITY: usize = 64;

/// How a lock reacts when the task that holds it tries to acquire it again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ReentryMode {
    /// Nested acquisition fails with [`LockError::Reentry`].
    CheckedFail,
    /// Nested acquisition succeeds and is counted; the lock is released when
    /// every guard has been dropped.
    CheckedPass,
    /// No tracking. Nested acquisition deadlocks.
    #[default]
    UncheckedDeadlock,
}

#[derive(Clone, Copy)]
struct Owner {
    task: TaskId,
    depth: usize,
}

struct LockState {
    mode: ReentryMode,
    semaphore: Semaphore,
    owner: Mutex<Option<Owner>>,
}

impl LockState {
    fn new(mode: ReentryMode) -> Self {
        Self {
            mode,
            semaphore: Semaphore::new(1),
            owner: Mutex::new(None),
        }
    }

    fn is_locked(&self) -> bool {
        self.semaphore.available_permits() == 0
    }
}

async fn acquire(
    state: &Arc<LockState>,
    cancel: &CancellationToken,
) -> Result<AsyncLockGuard, LockError> {
    let task = match state.mode {
        ReentryMode::UncheckedDeadlock => None,
        ReentryMode::CheckedFail | ReentryMode::CheckedPass => tokio::task::try_id(),
    };

    if let Some(task) = task {
        let mut owner = state.owner.lock();
        if let Some(owner) = owner.as_mut().filter(|o| o.task == task) {
            if state.mode == ReentryMode::CheckedFail {
                return Err(LockError::Reentry);
            }
            owner.depth += 1;
            return Ok(AsyncLockGuard {
                state: state.clone(),
                tracked: true,
            });
        }
    }

    if cancel.is_cancelled() {
        return Err(LockError::Cancelled);
    }

    tokio::select! {
        biased;
        _ = cancel.cancelled() => return Err(LockError::Cancelled),
        permit = state.semaphore.acquire() => match permit {
            Ok(permit) => permit.forget(),
            // The semaphore is never closed.
            Err(_) => return Err(LockError::Cancelled),
        },
    }

    if let Some(task) = task {
        *state.owner.lock() = Some(Owner { task, depth: 1 });
    }

    Ok(AsyncLockGuard {
        state: state.clone(),
        tracked: task.is_some(),
    })
}

/// An async mutex without a protected value.
///
/// # Example
///
/// ```ignore
/// let lock = AsyncLock::new(ReentryMode::CheckedFail);
/// let guard = lock.lock(&CancellationToken::new()).await?;
/// // ... critical section ...
/// drop(guard);
/// ```
pub struct AsyncLock {
    state: Arc<LockState>,
}

impl AsyncLock {
    /// Create an unlocked lock.
    pub fn new(mode: ReentryMode) -> Self {
        Self {
            state: Arc::new(LockState::new(mode)),
        }
    }

    /// The re-entry mode of this lock.
    pub fn mode(&self) -> ReentryMode {
        self.state.mode
    }

    /// Returns true if any guard currently holds the lock.
    pub fn is_locked(&self) -> bool {
        self.state.is_locked()
    }

    /// Acquire the lock, suspending until it is free.
    ///
    /// # Errors
    ///
    /// - `LockError::Cancelled` - `cancel` fired first; nothing is held
    /// - `LockError::Reentry` - the current task already holds a
    ///   [`ReentryMode::CheckedFail`] lock
    pub async fn lock(&self, cancel: &CancellationToken) -> Result<AsyncLockGuard, LockError> {
        acquire(&self.state, cancel).await
    }
}

impl Default for AsyncLock {
    fn default() -> Self {
        Self::new(ReentryMode::default())
    }
}

impl fmt::Debug for AsyncLock {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncLock")
            .field("mode", &self.state.mode)
            .field("locked", &self.is_locked())
            .finish()
    }
}

/// Guard of an acquired [`AsyncLock`]; the lock is released on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct AsyncLockGuard {
    state: Arc<LockState>,
    tracked: bool,
}

impl Drop for AsyncLockGuard {
    fn drop(&mut self) {
        let release = if self.tracked {
            let mut owner = self.state.owner.lock();
            match owner.as_mut() {
                Some(o) if o.depth > 1 => {
                    o.depth -= 1;
                    false
                }
                _ => {
                    *owner = None;
                    true
                }
            }
        } else {
            true
        };

        if release {
            self.state.semaphore.add_permits(1);
        }
    }
}

struct LockSetEntry {
    state: Arc<LockState>,
    users: usize,
}

struct LockSetShared<K> {
    mode: ReentryMode,
    entries: Mutex<HashMap<K, LockSetEntry, ahash::RandomState>>,
    pool: Mutex<Vec<Arc<LockState>>>,
}

impl<K: Hash + Eq + Clone> LockSetShared<K> {
    fn enter(&self, key: &K) -> Arc<LockState> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(key) {
            entry.users += 1;
            return entry.state.clone();
        }
        let state = self
            .pool
            .lock()
            .pop()
            .unwrap_or_else(|| Arc::new(LockState::new(self.mode)));
        entries.insert(
            key.clone(),
            LockSetEntry {
                state: state.clone(),
                users: 1,
            },
        );
        state
    }

    fn leave(&self, key: &K) {
        let mut entries = self.entries.lock();
        let Some(entry) = entries.get_mut(key) else {
            return;
        };
        entry.users -= 1;
        if entry.users > 0 {
            return;
        }
        if let Some(entry) = entries.remove(key) {
            let mut pool = self.pool.lock();
            if pool.len() < POOL_CAPACITY && Arc::strong_count(&entry.state) == 1 {
                pool.push(entry.state);
            }
        }
    }
}

/// A set of independent async locks addressed by key.
///
/// An entry exists only while at least one acquisition for its key is pending
/// or held. Released entries go back to a small pool, so uncontended locking
/// does not allocate once the pool is warm.
///
/// Cheap to clone; clones share the same locks.
pub struct AsyncLockSet<K> {
    shared: Arc<LockSetShared<K>>,
}

impl<K> Clone for AsyncLockSet<K> {
    fn clone(&self) -> Self {
        Self {
            shared: self.shared.clone(),
        }
    }
}

impl<K: Hash + Eq + Clone> AsyncLockSet<K> {
    /// Create an empty lock set whose locks use `mode`.
    pub fn new(mode: ReentryMode) -> Self {
        Self {
            shared: Arc::new(LockSetShared {
                mode,
                entries: Mutex::new(HashMap::with_hasher(ahash::RandomState::new())),
                pool: Mutex::new(Vec::new()),
            }),
        }
    }

    /// Acquire the lock for `key`, suspending until it is free.
    ///
    /// Dropping the returned future before it completes releases its claim on
    /// the entry without disturbing other waiters.
    pub async fn lock(
        &self,
        key: K,
        cancel: &CancellationToken,
    ) -> Result<AsyncLockSetGuard<K>, LockError> {
        let state = self.shared.enter(&key);
        let reservation = Reservation {
            shared: self.shared.clone(),
            key,
        };
        let guard = acquire(&state, cancel).await?;
        Ok(AsyncLockSetGuard {
            _guard: guard,
            _reservation: reservation,
        })
    }

    /// Returns true if the lock for `key` is currently held.
    pub fn is_locked(&self, key: &K) -> bool {
        self.shared
            .entries
            .lock()
            .get(key)
            .is_some_and(|entry| entry.state.is_locked())
    }

    /// Number of keys with a pending or held acquisition.
    pub fn len(&self) -> usize {
        self.shared.entries.lock().len()
    }

    /// Returns true if no key is pending or held.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

struct Reservation<K: Hash + Eq + Clone> {
    shared: Arc<LockSetShared<K>>,
    key: K,
}

impl<K: Hash + Eq + Clone> Drop for Reservation<K> {
    fn drop(&mut self) {
        self.shared.leave(&self.key);
    }
}

/// Guard of one key of an [`AsyncLockSet`]; the key is released on drop.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct AsyncLockSetGuard<K: Hash + Eq + Clone> {
    // Field order matters: the lock is released before the entry is left.
    _guard: AsyncLockGuard,
    _reservation: Reservation<K>,
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_mutual_exclusion() {
        let lock = Arc::new(AsyncLock::new(ReentryMode::UncheckedDeadlock));
        let inside = Arc::new(AtomicUsize::new(0));
        let max_inside = Arc::new(AtomicUsize::new(0));

        let tasks: Vec<_> = (0..8)
            .map(|_| {
                let lock = lock.clone();
                let inside = inside.clone();
                let max_inside = max_inside.clone();
                tokio::spawn(async move {
                    let _guard = lock.lock(&CancellationToken::new()).await.unwrap();
                    let now = inside.fetch_add(1, Ordering::SeqCst) + 1;
                    max_inside.fetch_max(now, Ordering::SeqCst);
                    tokio::task::yield_now().await;
                    inside.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();
        for task in tasks {
            task.await.unwrap();
        }

        assert_eq!(max_inside.load(Ordering::SeqCst), 1);
        assert!(!lock.is_locked());
    }

    #[tokio::test]
    async fn test_checked_fail_rejects_reentry() {
        let lock = Arc::new(AsyncLock::new(ReentryMode::CheckedFail));
        let result = tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let _outer = lock.lock(&cancel).await.unwrap();
            lock.lock(&cancel).await.map(|_| ())
        })
        .await
        .unwrap();
        assert_eq!(result, Err(LockError::Reentry));
    }

    #[tokio::test]
    async fn test_checked_pass_counts_reentry() {
        let lock = Arc::new(AsyncLock::new(ReentryMode::CheckedPass));
        let inner_lock = lock.clone();
        tokio::spawn(async move {
            let cancel = CancellationToken::new();
            let outer = inner_lock.lock(&cancel).await.unwrap();
            let inner = inner_lock.lock(&cancel).await.unwrap();
            drop(inner);
            assert!(inner_lock.is_locked());
            drop(outer);
            assert!(!inner_lock.is_locked());
        })
        .await
        .unwrap();
        assert!(!lock.is_locked());
    }

    #[tokio::test]
    async fn test_cancelled_waiter_holds_nothing() {
        let lock = AsyncLock::new(ReentryMode::UncheckedDeadlock);
        let holder = lock.lock(&CancellationToken::new()).await.unwrap();

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(lock.lock(&cancel).await.err(), Some(LockError::Cancelled));

        drop(holder);
        assert!(!lock.is_locked());
        let _again = lock.lock(&CancellationToken::new()).await.unwrap();
        assert!(lock.is_locked());
    }

    #[tokio::test]
    async fn test_lock_set_removes_released_entries() {
        let set = AsyncLockSet::new(ReentryMode::UncheckedDeadlock);
        let cancel = CancellationToken::new();

        let a = set.lock("a", &cancel).await.unwrap();
        let b = set.lock("b", &cancel).await.unwrap();
        assert_eq!(set.len(), 2);
        assert!(set.is_locked(&"a"));

        drop(a);
        assert_eq!(set.len(), 1);
        drop(b);
        assert!(set.is_empty());

        // Reuses a pooled entry.
        let _a = set.lock("a", &cancel).await.unwrap();
        assert_eq!(set.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_lock_set_dropped_waiter_does_not_leak() {
        let set = AsyncLockSet::new(ReentryMode::UncheckedDeadlock);
        let cancel = CancellationToken::new();
        let held = set.lock(1u32, &cancel).await.unwrap();

        let waited =
            tokio::time::timeout(Duration::from_millis(10), set.lock(1u32, &cancel)).await;
        assert!(waited.is_err());
        assert_eq!(set.len(), 1);

        drop(held);
        assert!(set.is_empty());
    }

    #[tokio::test]
    async fn test_lock_set_waiter_is_not_lost() {
        let set = AsyncLockSet::new(ReentryMode::UncheckedDeadlock);
        let cancel = CancellationToken::new();
        let held = set.lock(7u32, &cancel).await.unwrap();

        let waiter = {
            let set = set.clone();
            tokio::spawn(async move {
                let _guard = set.lock(7u32, &CancellationToken::new()).await.unwrap();
            })
        };
        tokio::task::yield_now().await;
        drop(held);
        waiter.await.unwrap();
        assert!(set.is_empty());
    }
}
