use std::collections::HashMap;
use std::fmt;
use std::mem;
use std::sync::{Arc, Weak};

use foldhash::fast::RandomState;
use parking_lot::Mutex;

use crate::{CallSite, PromiseCore, PromiseId};

/// A deferred controller that was still unsettled when the tracking set was inspected.
pub struct UnsettledDeferred {
    promise_id: PromiseId,
    payload_type: &'static str,
    call_site: CallSite,
}

impl UnsettledDeferred {
    /// The promise the controller was bound to.
    #[must_use]
    pub fn promise_id(&self) -> PromiseId {
        self.promise_id
    }

    /// The name of the type the promise resolves to.
    #[must_use]
    pub fn payload_type(&self) -> &'static str {
        self.payload_type
    }

    /// Where the controller was created, if this was captured.
    #[must_use]
    pub fn call_site(&self) -> &CallSite {
        &self.call_site
    }

    pub(crate) fn into_call_site(self) -> CallSite {
        self.call_site
    }
}

impl fmt::Debug for UnsettledDeferred {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnsettledDeferred")
            .field("promise_id", &self.promise_id)
            .field("payload_type", &self.payload_type)
            .field("call_site", &self.call_site)
            .finish()
    }
}

#[derive(Debug)]
struct Tracked {
    promise: Weak<PromiseCore>,
    call_site: CallSite,
}

/// The set of live deferred controllers whose promise has not been settled yet.
///
/// Entries are added when a controller is created and removed when its promise settles or the
/// controller is dropped.
#[derive(Debug, Default)]
pub(crate) struct DeferredTracker {
    live: Mutex<HashMap<PromiseId, Tracked, RandomState>>,
}

impl DeferredTracker {
    pub(crate) fn insert(&self, promise: &Arc<PromiseCore>, call_site: CallSite) {
        let previous = self.live.lock().insert(
            promise.id(),
            Tracked {
                promise: Arc::downgrade(promise),
                call_site,
            },
        );

        assert!(
            previous.is_none(),
            "promise {} was tracked twice - promise identifiers must be unique",
            promise.id()
        );
    }

    /// Stops tracking a promise, returning where its controller was created.
    pub(crate) fn remove(&self, id: PromiseId) -> Option<CallSite> {
        self.live.lock().remove(&id).map(|tracked| tracked.call_site)
    }

    pub(crate) fn len(&self) -> usize {
        self.live.lock().len()
    }

    /// Removes all entries, returning the ones whose promise is still alive and pending.
    pub(crate) fn take_unsettled(&self) -> Vec<(Arc<PromiseCore>, UnsettledDeferred)> {
        let live = mem::take(&mut *self.live.lock());

        let mut unsettled: Vec<_> = live
            .into_iter()
            .filter_map(|(promise_id, tracked)| {
                let promise = tracked.promise.upgrade()?;

                if promise.state().is_settled() {
                    return None;
                }

                let entry = UnsettledDeferred {
                    promise_id,
                    payload_type: promise.payload_type(),
                    call_site: tracked.call_site,
                };

                Some((promise, entry))
            })
            .collect();

        unsettled.sort_by_key(|(_, entry)| entry.promise_id);
        unsettled
    }
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{ContainerOrigin, Context, PayloadOps, SettlementKind};

    assert_impl_all!(UnsettledDeferred: Send, Sync);
    assert_impl_all!(DeferredTracker: Send, Sync);

    fn promise(context: &Context, id: u64) -> Arc<PromiseCore> {
        Arc::new(PromiseCore::new(
            PromiseId::new(id),
            "u8",
            Arc::clone(&context.shared),
        ))
    }

    #[test]
    fn insert_remove() {
        let context = Context::new();
        let tracker = DeferredTracker::default();
        let first = promise(&context, 1);

        tracker.insert(&first, CallSite::empty());
        assert_eq!(tracker.len(), 1);

        assert!(tracker.remove(PromiseId::new(1)).is_some());
        assert!(tracker.remove(PromiseId::new(1)).is_none());
        assert_eq!(tracker.len(), 0);
    }

    #[test]
    fn take_unsettled_skips_dead_and_settled() {
        let context = Context::new();
        let tracker = DeferredTracker::default();

        let pending_b = promise(&context, 3);
        let pending_a = promise(&context, 2);
        let settled = promise(&context, 4);
        let dead = promise(&context, 5);

        for promise in [&pending_b, &pending_a, &settled, &dead] {
            tracker.insert(promise, CallSite::empty());
        }
        drop(dead);

        // Settling via the core removes the entry from the context's own tracker, not this one.
        settled
            .settle(
                SettlementKind::Resolved,
                ContainerOrigin::User,
                PayloadOps::of::<u8>(),
                1_u8,
            )
            .unwrap();

        let unsettled = tracker.take_unsettled();
        let ids: Vec<_> = unsettled
            .iter()
            .map(|(_, entry)| entry.promise_id().get())
            .collect();
        assert_eq!(ids, [2, 3]);
        assert_eq!(unsettled[0].1.payload_type(), "u8");

        assert_eq!(tracker.len(), 0);
    }

    #[test]
    #[should_panic(expected = "was tracked twice")]
    fn double_insert_panics() {
        let context = Context::new();
        let tracker = DeferredTracker::default();
        let first = promise(&context, 1);

        tracker.insert(&first, CallSite::empty());
        tracker.insert(&first, CallSite::empty());
    }
}
