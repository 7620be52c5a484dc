use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

/// Tag is a version stamp of a computed value, analogous to an HTTP ETag.
///
/// Tags are handed out by one strictly increasing counter per runtime, so two
/// evaluations of the same key never share a tag, even when they produce
/// identical outputs. Comparing tags is the cheap way to detect "did this
/// change" without comparing values.
///
/// # Examples
///
/// ```
/// # use compute_flow::Tag;
/// let first = Tag(5);
/// let recomputed = Tag(9);
/// assert!(recomputed.is_newer_than(first));
/// assert!(!first.is_newer_than(recomputed));
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Tag(pub u64);

impl Tag {
    /// Returns true if this tag was issued after the other one.
    pub fn is_newer_than(&self, other: Tag) -> bool {
        self.0 > other.0
    }
}

impl fmt::Display for Tag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "@{}", self.0)
    }
}

/// Source of strictly increasing tags.
#[derive(Debug)]
pub(crate) struct TagGenerator {
    next: AtomicU64,
}

impl Default for TagGenerator {
    fn default() -> Self {
        Self {
            next: AtomicU64::new(1),
        }
    }
}

impl TagGenerator {
    pub(crate) fn next(&self) -> Tag {
        Tag(self.next.fetch_add(1, Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tags_strictly_increase() {
        let tags = TagGenerator::default();
        let mut last = tags.next();
        for _ in 0..100 {
            let next = tags.next();
            assert!(next.is_newer_than(last));
            last = next;
        }
    }
}
