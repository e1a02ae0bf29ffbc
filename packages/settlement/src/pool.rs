use std::any::{Any, TypeId, type_name};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use foldhash::fast::RandomState;
use parking_lot::Mutex;
use tracing::trace;

/// Each payload type keeps at most this many free containers. Releasing beyond this
/// simply drops the container, so a burst of settlements cannot pin memory forever.
const MAX_FREE_PER_TYPE: usize = 256;

/// Determines which value containers are recycled through the pool when their last
/// reference is released.
///
/// # Examples
///
/// ```
/// use settlement::{Context, PoolingPolicy};
///
/// // Every acquire allocates fresh, useful to make leaks visible to allocation tracking.
/// let context = Context::builder().pooling(PoolingPolicy::None).build();
/// assert_eq!(context.pooling(), PoolingPolicy::None);
/// ```
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
#[non_exhaustive]
pub enum PoolingPolicy {
    /// Containers are never recycled. Every acquire allocates a new container.
    None,

    /// Only containers manufactured by this crate itself (e.g. for cancelation) are recycled.
    InternalOnly,

    /// All containers are recycled. This is the default.
    #[default]
    All,
}

impl PoolingPolicy {
    pub(crate) fn permits(self, origin: ContainerOrigin) -> bool {
        match self {
            Self::None => false,
            Self::InternalOnly => origin == ContainerOrigin::Internal,
            Self::All => true,
        }
    }
}

/// Who created a value container, which determines whether it is eligible for pooling
/// under [`PoolingPolicy::InternalOnly`].
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum ContainerOrigin {
    /// Created to carry a value provided by user code.
    User,

    /// Created by this crate to carry a value it produced itself.
    Internal,
}

/// A snapshot of container pool activity.
#[derive(Clone, Copy, Debug, Default, Eq, PartialEq)]
pub struct PoolStats {
    free: usize,
    recycled: u64,
    reused: u64,
}

impl PoolStats {
    /// Number of containers currently waiting in free lists, across all payload types.
    #[must_use]
    pub fn free(&self) -> usize {
        self.free
    }

    /// Total number of containers that have been returned to a free list.
    #[must_use]
    pub fn recycled(&self) -> u64 {
        self.recycled
    }

    /// Total number of acquires that were satisfied from a free list.
    #[must_use]
    pub fn reused(&self) -> u64 {
        self.reused
    }
}

/// Free lists of value container storage, keyed by the concrete storage type.
///
/// Items are only ever added here after being fully reset by their owner (payload cleared,
/// no outstanding references), so anything taken out is safe to hand to a new owner.
#[derive(Debug)]
pub(crate) struct ContainerPool {
    policy: PoolingPolicy,
    free: Mutex<HashMap<TypeId, Vec<Box<dyn Any + Send>>, RandomState>>,
    recycled: AtomicU64,
    reused: AtomicU64,
}

impl ContainerPool {
    pub(crate) fn new(policy: PoolingPolicy) -> Self {
        Self {
            policy,
            free: Mutex::new(HashMap::with_hasher(RandomState::default())),
            recycled: AtomicU64::new(0),
            reused: AtomicU64::new(0),
        }
    }

    pub(crate) fn policy(&self) -> PoolingPolicy {
        self.policy
    }

    /// Takes a free item of type `S`, if there is one.
    ///
    /// # Panics
    ///
    /// Panics if the free list for `S` contains an item of another type. This means the pool
    /// has been corrupted and handing anything out would alias unrelated settlements.
    pub(crate) fn take<S: Any + Send>(&self) -> Option<Box<S>> {
        if self.policy == PoolingPolicy::None {
            return None;
        }

        let item = self.free.lock().get_mut(&TypeId::of::<S>())?.pop()?;

        match item.downcast::<S>() {
            Ok(item) => {
                self.reused.fetch_add(1, Ordering::Relaxed);
                trace!(storage = type_name::<S>(), "reusing pooled container");
                Some(item)
            }
            Err(_) => panic!(
                "container pool free list for {} holds an item of another type",
                type_name::<S>()
            ),
        }
    }

    /// Returns an item to the free list for `S`.
    ///
    /// The caller must have already reset the item so that it carries no state from its
    /// previous use. If the free list is full, the item is dropped instead.
    pub(crate) fn give<S: Any + Send>(&self, item: Box<S>) {
        {
            let mut free = self.free.lock();
            let list = free.entry(TypeId::of::<S>()).or_default();

            if list.len() >= MAX_FREE_PER_TYPE {
                // Drop outside the lock.
                drop(free);
                drop(item);
                return;
            }

            list.push(item);
        }

        self.recycled.fetch_add(1, Ordering::Relaxed);
        trace!(storage = type_name::<S>(), "recycled container into pool");
    }

    /// Number of free items of type `S`.
    #[cfg(test)]
    pub(crate) fn free_count<S: Any>(&self) -> usize {
        self.free
            .lock()
            .get(&TypeId::of::<S>())
            .map_or(0, Vec::len)
    }

    pub(crate) fn stats(&self) -> PoolStats {
        let free = self.free.lock().values().map(Vec::len).sum();

        PoolStats {
            free,
            recycled: self.recycled.load(Ordering::Relaxed),
            reused: self.reused.load(Ordering::Relaxed),
        }
    }

    /// Visits every free item of type `S`.
    #[cfg(test)]
    pub(crate) fn inspect_free<S: Any>(&self, mut f: impl FnMut(&S)) {
        if let Some(list) = self.free.lock().get(&TypeId::of::<S>()) {
            for item in list.iter().filter_map(|item| item.downcast_ref::<S>()) {
                f(item);
            }
        }
    }
}
