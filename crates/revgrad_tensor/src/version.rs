use std::sync::{
    atomic::{AtomicUsize, Ordering},
    Arc,
};

/// Mutation counter shared by every tensor viewing the same storage.
///
/// Updated atomically and without any lock, so unrelated nodes can run
/// concurrently while still observing each other's in-place writes.
#[derive(Debug, Clone, Default)]
pub struct VersionCounter(Arc<AtomicUsize>);

impl VersionCounter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn current(&self) -> usize {
        self.0.load(Ordering::Acquire)
    }

    /// Records one in-place write and returns the new version.
    pub fn bump(&self) -> usize {
        self.0.fetch_add(1, Ordering::AcqRel) + 1
    }

    pub fn shares_with(&self, other: &VersionCounter) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }
}
