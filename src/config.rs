//! Per-function options for computed values.

use std::time::Duration;

/// Default keep-alive window of a computed value after its last access.
pub const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(1);

/// Default minimum age before any computed value becomes prunable.
pub const DEFAULT_PRUNE_GRACE: Duration = Duration::from_millis(100);

/// Options applied to every computed value produced by one function.
///
/// # Example
///
/// ```
/// # use compute_flow::ComputedOptions;
/// # use std::time::Duration;
/// let options = ComputedOptions::default()
///     .with_keep_alive(Duration::from_secs(30))
///     .with_error_invalidation_delay(Duration::from_secs(5));
/// assert_eq!(options.auto_invalidation_delay, None);
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ComputedOptions {
    /// Minimum time a computed value stays in the registry after its last
    /// access. Only eviction looks at this; it never affects correctness.
    pub keep_alive: Duration,
    /// Invalidate every computed value this long after it was computed.
    pub auto_invalidation_delay: Option<Duration>,
    /// Invalidate computed values holding an error this long after they were
    /// computed. Falls back to `auto_invalidation_delay`; when both are unset,
    /// errors are sticky until invalidated explicitly.
    pub error_invalidation_delay: Option<Duration>,
}

impl Default for ComputedOptions {
    fn default() -> Self {
        Self {
            keep_alive: DEFAULT_KEEP_ALIVE,
            auto_invalidation_delay: None,
            error_invalidation_delay: None,
        }
    }
}

impl ComputedOptions {
    /// Set the keep-alive window.
    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    /// Set the auto-invalidation delay.
    pub fn with_auto_invalidation_delay(mut self, delay: Duration) -> Self {
        self.auto_invalidation_delay = Some(delay);
        self
    }

    /// Set the auto-invalidation delay for error outputs.
    pub fn with_error_invalidation_delay(mut self, delay: Duration) -> Self {
        self.error_invalidation_delay = Some(delay);
        self
    }

    pub(crate) fn invalidation_delay(&self, is_error: bool) -> Option<Duration> {
        if is_error {
            self.error_invalidation_delay
                .or(self.auto_invalidation_delay)
        } else {
            self.auto_invalidation_delay
        }
    }
}
