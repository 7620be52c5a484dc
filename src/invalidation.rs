use std::fmt;

use crate::key::ComputedKey;
use crate::tag::Tag;

/// InvalidationReason is a record of why a computed value was invalidated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvalidationReason {
    /// Invalidated by an explicit call.
    Explicit,
    /// A computed value this one used was invalidated.
    DependencyInvalidated {
        /// Key of the invalidated dependency.
        key: ComputedKey,
        /// Tag of the invalidated dependency.
        tag: Tag,
    },
    /// The auto-invalidation delay elapsed.
    Timeout,
    /// The computation was abandoned before producing an output.
    Abandoned,
    /// The whole registry was invalidated.
    InvalidateEverything,
}

impl fmt::Display for InvalidationReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            InvalidationReason::Explicit => write!(f, "explicit"),
            InvalidationReason::DependencyInvalidated { key, tag } => {
                write!(f, "dependency {:?}{} invalidated", key, tag)
            }
            InvalidationReason::Timeout => write!(f, "timeout"),
            InvalidationReason::Abandoned => write!(f, "abandoned"),
            InvalidationReason::InvalidateEverything => write!(f, "invalidate everything"),
        }
    }
}
