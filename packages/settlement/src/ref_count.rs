use std::sync::atomic::{self, AtomicUsize};

/// Above this many references we assume something has gone badly wrong (e.g. a leak in a loop)
/// and refuse to continue rather than risk wrapping around to zero.
const MAX_REF_COUNT: usize = isize::MAX.unsigned_abs();

/// A thread-safe reference count.
///
/// Unlike `Arc`, the count is not bound to a specific allocation, so the owner of the count
/// can reset it when the storage it guards is recycled for a new occupant.
#[derive(Debug)]
pub(crate) struct RefCount {
    count: AtomicUsize,
}

impl RefCount {
    /// Creates a new reference count with a single reference.
    #[must_use]
    pub(crate) fn new() -> Self {
        Self {
            count: AtomicUsize::new(1),
        }
    }

    /// Increments the reference count.
    ///
    /// # Panics
    ///
    /// Panics if the reference count was zero (indicating resurrection).
    ///
    /// Panics if the reference count exceeds `isize::MAX`.
    pub(crate) fn inc(&self) {
        // Relaxed is enough: a new reference can only be created from an existing one,
        // which already provides the necessary synchronization.
        let previous = self.count.fetch_add(1, atomic::Ordering::Relaxed);

        assert_ne!(
            previous, 0,
            "reference count resurrected from zero - a released container was retained"
        );
        assert!(
            previous < MAX_REF_COUNT,
            "reference count overflow - indicates a reference leak"
        );
    }

    /// Decrements the reference count and returns true if this was the last reference.
    ///
    /// # Panics
    ///
    /// Panics if the reference count would underflow (go below zero).
    #[cfg_attr(test, mutants::skip)] // Critical primitive - mutation causes use-after-free.
    pub(crate) fn dec(&self) -> bool {
        match self.count.fetch_sub(1, atomic::Ordering::Release) {
            1 => {
                // We need an Acquire fence here to ensure we have observed all writes
                // made by other holders before we clear or recycle the guarded storage.
                atomic::fence(atomic::Ordering::Acquire);

                true
            }
            0 => panic!(
                "reference count underflow - indicates a serious bug in reference counting logic"
            ),
            _ => false,
        }
    }

    /// Returns the current reference count.
    ///
    /// This is a snapshot and may be stale by the time the caller looks at it.
    #[must_use]
    pub(crate) fn get(&self) -> usize {
        self.count.load(atomic::Ordering::Relaxed)
    }

    /// Resets the count to a single reference. Exclusive access proves nobody else holds one.
    pub(crate) fn reset(&mut self) {
        *self.count.get_mut() = 1;
    }
}
