use std::any::{Any, TypeId};
use std::fmt;
use std::marker::PhantomData;
use std::ptr::NonNull;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use crate::conversion::convert;
use crate::{
    ContainerOrigin, ConversionPolicy, ErasedPayload, OutcomeKind, Payload, PayloadOps,
    PayloadRef, PromiseId, RefCount, SettlementKind, Shared, UnhandledOutcome,
};

/// The storage behind a value container. Allocated once and then either recycled through the
/// pool or dropped when the last reference is released.
pub(crate) struct Slot<V> {
    ref_count: RefCount,
    kind: SettlementKind,
    origin: ContainerOrigin,
    handled: AtomicBool,

    /// Always `Some` while the reference count is nonzero. Cleared before the slot is
    /// recycled, so a pooled slot never exposes the payload of a previous settlement.
    payload: Option<V>,
    ops: PayloadOps,
    promise_id: Option<PromiseId>,

    /// Present while the slot is in use; taken on release so pooled slots do not keep the
    /// context alive (the context owns the pool they sit in).
    shared: Option<Arc<Shared>>,
}

impl<V> Slot<V> {
    fn new(ops: PayloadOps) -> Self {
        Self {
            ref_count: RefCount::new(),
            kind: SettlementKind::Resolved,
            origin: ContainerOrigin::User,
            handled: AtomicBool::new(false),
            payload: None,
            ops,
            promise_id: None,
            shared: None,
        }
    }

    #[cfg(test)]
    pub(crate) fn is_cleared(&self) -> bool {
        self.payload.is_none() && self.shared.is_none() && self.promise_id.is_none()
    }
}

/// Parameters for acquiring a container.
#[derive(Debug)]
pub(crate) struct Acquire {
    pub(crate) kind: SettlementKind,
    pub(crate) origin: ContainerOrigin,
    pub(crate) ops: PayloadOps,
    pub(crate) promise_id: Option<PromiseId>,
}

/// A reference-counted holder of one settlement payload of static type `V`.
///
/// Cloning a container retains it (increments the reference count) and dropping a container
/// releases it. When the last reference is released, the payload is cleared and the storage
/// is returned to the pool of the [`Context`][crate::Context] it came from (depending on the
/// [`PoolingPolicy`][crate::PoolingPolicy]).
///
/// If a rejected or canceled container is released for the last time without ever having been
/// [marked as handled][Self::mark_handled], its payload is reported as an unhandled outcome.
///
/// # Examples
///
/// ```
/// use settlement::{Context, SettlementKind};
///
/// let context = Context::new();
///
/// let container = context.acquire(SettlementKind::Resolved, 42_i32);
/// let second = container.retain();
/// assert_eq!(container.ref_count(), 2);
///
/// assert_eq!(*second.get(), 42);
/// assert_eq!(second.try_get_as::<i32>(), Some(42));
///
/// second.release();
/// container.release();
/// ```
pub struct Container<V: Payload> {
    slot: NonNull<Slot<V>>,

    _owns: PhantomData<Slot<V>>,
}

// SAFETY: The slot is only mutated while exclusively owned (before the first handle exists and
// after the last one is released). While shared, it is only read, plus atomic fields. `V` is
// `Send + Sync` by the `Payload` bound, so moving or sharing handles across threads is sound.
unsafe impl<V: Payload> Send for Container<V> {}
// SAFETY: See above.
unsafe impl<V: Payload> Sync for Container<V> {}

impl<V: Payload> Container<V> {
    /// Obtains a container holding `payload`, from the pool if possible, with one reference.
    pub(crate) fn acquire(shared: &Arc<Shared>, params: Acquire, payload: V) -> Self {
        let mut slot = if shared.pool.policy().permits(params.origin) {
            shared
                .pool
                .take::<Slot<V>>()
                .unwrap_or_else(|| Box::new(Slot::new(params.ops)))
        } else {
            Box::new(Slot::new(params.ops))
        };

        slot.ref_count.reset();
        slot.kind = params.kind;
        slot.origin = params.origin;
        *slot.handled.get_mut() = false;
        slot.payload = Some(payload);
        slot.ops = params.ops;
        slot.promise_id = params.promise_id;
        slot.shared = Some(Arc::clone(shared));

        Self {
            slot: NonNull::from(Box::leak(slot)),
            _owns: PhantomData,
        }
    }

    fn slot(&self) -> &Slot<V> {
        // SAFETY: We hold a reference, so the count is nonzero and the slot is alive.
        // Nobody creates an exclusive reference to the slot while any handle exists.
        unsafe { self.slot.as_ref() }
    }

    /// Adds a reference to the container, returning a new handle to it.
    #[must_use]
    pub fn retain(&self) -> Self {
        self.slot().ref_count.inc();

        Self {
            slot: self.slot,
            _owns: PhantomData,
        }
    }

    /// Releases this reference to the container.
    ///
    /// Equivalent to dropping the handle. The handle cannot be used afterwards.
    pub fn release(self) {
        drop(self);
    }

    /// The settlement kind this container represents.
    #[must_use]
    pub fn kind(&self) -> SettlementKind {
        self.slot().kind
    }

    /// Who created this container.
    #[must_use]
    pub fn origin(&self) -> ContainerOrigin {
        self.slot().origin
    }

    /// The promise whose settlement this container carries, if any.
    #[must_use]
    pub fn promise_id(&self) -> Option<PromiseId> {
        self.slot().promise_id
    }

    /// The current number of references to this container.
    ///
    /// This is a snapshot and may be stale immediately if other threads hold references.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.slot().ref_count.get()
    }

    /// The payload, as its static type.
    #[must_use]
    pub fn get(&self) -> &V {
        match &self.slot().payload {
            Some(payload) => payload,
            None => unreachable!("a container with live references always holds a payload"),
        }
    }

    /// Borrows the payload as a `T` if `T` is exactly the static payload type.
    #[must_use]
    pub fn try_get_ref<T: Any>(&self) -> Option<&T> {
        let payload: &dyn Any = self.get();
        payload.downcast_ref::<T>()
    }

    /// Reads the payload as a `T`, converting it via the active conversion policy if `T` is not
    /// the static payload type.
    ///
    /// Returns `None` if the payload is not compatible with `T`.
    #[must_use]
    pub fn try_get_as<T: Payload>(&self) -> Option<T> {
        if TypeId::of::<T>() == TypeId::of::<V>() {
            return self.try_get_ref::<T>().cloned();
        }

        convert(self.payload_ref(), &*self.conversion())
    }

    /// A type-erased view of the payload.
    #[must_use]
    pub fn payload_ref(&self) -> PayloadRef<'_> {
        let slot = self.slot();
        PayloadRef::new(self.get(), &slot.ops)
    }

    /// Marks the payload as observed, so releasing the container does not report it as an
    /// unhandled outcome.
    pub fn mark_handled(&self) {
        self.slot().handled.store(true, Ordering::Release);
    }

    /// Whether the payload has been marked as observed.
    #[must_use]
    pub fn is_handled(&self) -> bool {
        self.slot().handled.load(Ordering::Acquire)
    }

    /// Erases the payload type, keeping this reference.
    #[must_use]
    pub fn into_any(self) -> AnyContainer {
        AnyContainer {
            inner: Box::new(self),
        }
    }

    fn conversion(&self) -> Arc<dyn ConversionPolicy> {
        match &self.slot().shared {
            Some(shared) => shared.conversion(),
            None => unreachable!("a container with live references is always bound to a context"),
        }
    }
}

impl<V: Payload> Clone for Container<V> {
    fn clone(&self) -> Self {
        self.retain()
    }
}

impl<V: Payload> Drop for Container<V> {
    #[cfg_attr(test, mutants::skip)] // Critical - mutation can cause UB and double frees.
    fn drop(&mut self) {
        if !self.slot().ref_count.dec() {
            return;
        }

        // SAFETY: That was the last reference, so we have exclusive access to the slot and it
        // was originally leaked from a `Box` in `acquire`.
        let mut slot = unsafe { Box::from_raw(self.slot.as_ptr()) };

        let payload = slot.payload.take();
        let promise_id = slot.promise_id.take();
        let Some(shared) = slot.shared.take() else {
            unreachable!("a container with live references is always bound to a context");
        };

        let unhandled_kind = match slot.kind {
            SettlementKind::Resolved => None,
            SettlementKind::Rejected => Some(OutcomeKind::Rejected),
            SettlementKind::Canceled => Some(OutcomeKind::Canceled),
        };

        let handled = *slot.handled.get_mut();

        match (unhandled_kind, payload) {
            (Some(kind), Some(payload)) if !handled => {
                shared.unhandled.report(UnhandledOutcome::new(
                    kind,
                    Some(ErasedPayload::new(payload, slot.ops)),
                    promise_id,
                    shared.conversion(),
                ));
            }
            _ => {}
        }

        if shared.pool.policy().permits(slot.origin) {
            shared.pool.give(slot);
        }
    }
}

impl<V: Payload> fmt::Debug for Container<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.slot();

        f.debug_struct("Container")
            .field("kind", &slot.kind)
            .field("type_name", &slot.ops.type_name())
            .field("ref_count", &slot.ref_count.get())
            .field("promise_id", &slot.promise_id)
            .finish_non_exhaustive()
    }
}

/// Operations on a container whose payload type has been erased.
trait ErasedContainer: Send + Sync {
    fn kind(&self) -> SettlementKind;
    fn origin(&self) -> ContainerOrigin;
    fn promise_id(&self) -> Option<PromiseId>;
    fn ref_count(&self) -> usize;
    fn payload_ref(&self) -> PayloadRef<'_>;
    fn conversion(&self) -> Arc<dyn ConversionPolicy>;
    fn mark_handled(&self);
    fn is_handled(&self) -> bool;
    fn retain_erased(&self) -> Box<dyn ErasedContainer>;
    fn into_any_box(self: Box<Self>) -> Box<dyn Any>;
}

impl<V: Payload> ErasedContainer for Container<V> {
    fn kind(&self) -> SettlementKind {
        Self::kind(self)
    }

    fn origin(&self) -> ContainerOrigin {
        Self::origin(self)
    }

    fn promise_id(&self) -> Option<PromiseId> {
        Self::promise_id(self)
    }

    fn ref_count(&self) -> usize {
        Self::ref_count(self)
    }

    fn payload_ref(&self) -> PayloadRef<'_> {
        Self::payload_ref(self)
    }

    fn conversion(&self) -> Arc<dyn ConversionPolicy> {
        Self::conversion(self)
    }

    fn mark_handled(&self) {
        Self::mark_handled(self);
    }

    fn is_handled(&self) -> bool {
        Self::is_handled(self)
    }

    fn retain_erased(&self) -> Box<dyn ErasedContainer> {
        Box::new(self.retain())
    }

    fn into_any_box(self: Box<Self>) -> Box<dyn Any> {
        self
    }
}

/// A value container whose payload type has been erased.
///
/// This is the uniform runtime interface over containers of any payload type, used where the
/// static type is not known, such as when choosing between handlers for a rejection.
///
/// Cloning retains the container and dropping releases it, exactly as with [`Container`].
pub struct AnyContainer {
    inner: Box<dyn ErasedContainer>,
}

impl AnyContainer {
    /// The settlement kind this container represents.
    #[must_use]
    pub fn kind(&self) -> SettlementKind {
        self.inner.kind()
    }

    /// Who created this container.
    #[must_use]
    pub fn origin(&self) -> ContainerOrigin {
        self.inner.origin()
    }

    /// The promise whose settlement this container carries, if any.
    #[must_use]
    pub fn promise_id(&self) -> Option<PromiseId> {
        self.inner.promise_id()
    }

    /// The current number of references to this container.
    #[must_use]
    pub fn ref_count(&self) -> usize {
        self.inner.ref_count()
    }

    /// The [`TypeId`] of the static payload type.
    #[must_use]
    pub fn payload_type_id(&self) -> TypeId {
        self.inner.payload_ref().type_id()
    }

    /// The name of the static payload type, for diagnostics.
    #[must_use]
    pub fn payload_type_name(&self) -> &'static str {
        self.inner.payload_ref().type_name()
    }

    /// A type-erased view of the payload.
    #[must_use]
    pub fn payload_ref(&self) -> PayloadRef<'_> {
        self.inner.payload_ref()
    }

    /// Borrows the payload as a `T` if `T` is exactly the static payload type.
    ///
    /// This never allocates and never consults the conversion policy.
    #[must_use]
    pub fn try_get_ref<T: Any>(&self) -> Option<&T> {
        self.inner.payload_ref().as_any().downcast_ref::<T>()
    }

    /// Reads the payload as a `T`, converting it via the active conversion policy if `T` is not
    /// the static payload type.
    ///
    /// Returns `None` if the payload is not compatible with `T`.
    #[must_use]
    pub fn try_get_as<T: Payload>(&self) -> Option<T> {
        if let Some(value) = self.try_get_ref::<T>() {
            return Some(value.clone());
        }

        convert(self.inner.payload_ref(), &*self.inner.conversion())
    }

    /// Marks the payload as observed, so releasing the container does not report it as an
    /// unhandled outcome.
    pub fn mark_handled(&self) {
        self.inner.mark_handled();
    }

    /// Whether the payload has been marked as observed.
    #[must_use]
    pub fn is_handled(&self) -> bool {
        self.inner.is_handled()
    }

    /// Adds a reference to the container, returning a new handle to it.
    #[must_use]
    pub fn retain(&self) -> Self {
        Self {
            inner: self.inner.retain_erased(),
        }
    }

    /// Releases this reference to the container.
    pub fn release(self) {
        drop(self);
    }

    /// Recovers the typed container if the static payload type is `V`.
    ///
    /// # Errors
    ///
    /// Returns the container unchanged if the static payload type is not `V`.
    pub fn into_typed<V: Payload>(self) -> Result<Container<V>, Self> {
        if self.payload_type_id() != TypeId::of::<V>() {
            return Err(self);
        }

        match self.inner.into_any_box().downcast::<Container<V>>() {
            Ok(container) => Ok(*container),
            Err(_) => unreachable!("payload type was checked to match the container type"),
        }
    }
}

impl Clone for AnyContainer {
    fn clone(&self) -> Self {
        self.retain()
    }
}

impl<V: Payload> From<Container<V>> for AnyContainer {
    fn from(container: Container<V>) -> Self {
        container.into_any()
    }
}

impl fmt::Debug for AnyContainer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AnyContainer")
            .field("kind", &self.kind())
            .field("type_name", &self.payload_type_name())
            .field("ref_count", &self.ref_count())
            .field("promise_id", &self.promise_id())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::{AnyValue, Context, PoolingPolicy};

    assert_impl_all!(Container<i32>: Send, Sync, Clone);
    assert_impl_all!(AnyContainer: Send, Sync, Clone);
    assert_not_impl_any!(Container<i32>: Copy);

    #[test]
    fn retain_release_balance() {
        let context = Context::new();
        let container = context.acquire(SettlementKind::Resolved, 42_i32);
        assert_eq!(container.ref_count(), 1);

        let retained: Vec<_> = (0..5).map(|_| container.retain()).collect();
        assert_eq!(container.ref_count(), 6);

        for handle in retained {
            handle.release();
        }

        assert_eq!(container.ref_count(), 1);
        assert_eq!(context.pool_stats().recycled(), 0);

        container.release();
        assert_eq!(context.pool_stats().recycled(), 1);
    }

    #[test]
    fn pool_eligible_exactly_once() {
        let context = Context::new();
        let container = context.acquire(SettlementKind::Resolved, "boom".to_string());
        let a = container.retain();
        let b = container.retain();
        assert_eq!(container.ref_count(), 3);

        container.release();
        a.release();
        assert_eq!(context.shared.pool.free_count::<Slot<String>>(), 0);

        b.release();
        assert_eq!(context.shared.pool.free_count::<Slot<String>>(), 1);
        assert_eq!(context.pool_stats().recycled(), 1);
    }

    #[test]
    fn recycled_slot_is_cleared() {
        let context = Context::new();
        let container = context.acquire(SettlementKind::Rejected, "boom".to_string());
        container.mark_handled();
        container.release();

        let mut inspected = 0;
        context.shared.pool.inspect_free::<Slot<String>>(|slot| {
            inspected += 1;
            assert!(slot.is_cleared());
        });
        assert_eq!(inspected, 1);

        let next = context.acquire(SettlementKind::Rejected, "next".to_string());
        assert_eq!(next.get(), "next");
        assert_eq!(next.ref_count(), 1);
        assert!(!next.is_handled());
        assert_eq!(context.pool_stats().reused(), 1);

        next.mark_handled();
    }

    #[test]
    fn pooling_none_never_recycles() {
        let context = Context::builder().pooling(PoolingPolicy::None).build();
        context.acquire(SettlementKind::Resolved, 1_u8).release();
        context.acquire(SettlementKind::Resolved, 2_u8).release();

        let stats = context.pool_stats();
        assert_eq!(stats.recycled(), 0);
        assert_eq!(stats.reused(), 0);
        assert_eq!(stats.free(), 0);
    }

    #[test]
    fn pooling_internal_only_skips_user_containers() {
        let context = Context::builder()
            .pooling(PoolingPolicy::InternalOnly)
            .build();

        context.acquire(SettlementKind::Resolved, 1_u8).release();
        assert_eq!(context.pool_stats().recycled(), 0);

        context.acquire_internal(SettlementKind::Resolved, 1_u8).release();
        assert_eq!(context.pool_stats().recycled(), 1);
    }

    #[test]
    fn unhandled_rejection_reported_on_last_release() {
        let context = Context::new();
        let container = context.acquire(SettlementKind::Rejected, "boom".to_string());
        let forwarded = container.retain();

        container.release();
        assert!(context.drain_unhandled().is_empty());

        forwarded.release();

        let unhandled = context.drain_unhandled();
        assert_eq!(unhandled.len(), 1);
        assert_eq!(unhandled[0].kind(), OutcomeKind::Rejected);
        assert_eq!(unhandled[0].try_get_as::<String>().as_deref(), Some("boom"));
    }

    #[test]
    fn handled_rejection_not_reported() {
        let context = Context::new();
        let container = context.acquire(SettlementKind::Canceled, 5_u32);
        container.retain().mark_handled();
        container.release();

        assert!(context.drain_unhandled().is_empty());
    }

    #[test]
    fn resolved_never_reported() {
        let context = Context::new();
        context.acquire(SettlementKind::Resolved, 5_u32).release();

        assert!(context.drain_unhandled().is_empty());
    }

    #[test]
    fn try_get_as_exact_and_converted() {
        let context = Context::new();
        let container = context.acquire(SettlementKind::Resolved, 42_i32);

        assert_eq!(container.try_get_as::<i32>(), Some(42));
        assert_eq!(container.try_get_ref::<i32>(), Some(&42));
        assert_eq!(container.try_get_as::<u32>(), None);
        assert!(container.try_get_ref::<u32>().is_none());

        let widened = container.try_get_as::<AnyValue>().unwrap();
        assert_eq!(widened.downcast_ref::<i32>(), Some(&42));
    }

    #[test]
    fn erased_round_trip() {
        let context = Context::new();
        let container = context.acquire(SettlementKind::Resolved, 42_i32).into_any();

        assert_eq!(container.kind(), SettlementKind::Resolved);
        assert_eq!(container.payload_type_id(), TypeId::of::<i32>());
        assert_eq!(container.try_get_as::<i32>(), Some(42));

        let second = container.retain();
        assert_eq!(container.ref_count(), 2);

        let container = container.into_typed::<u8>().unwrap_err();
        let typed = container.into_typed::<i32>().unwrap();
        assert_eq!(*typed.get(), 42);
        assert_eq!(typed.ref_count(), 2);

        drop(second);
        assert_eq!(typed.ref_count(), 1);
    }

    #[test]
    fn concurrent_retain_release() {
        testing::with_watchdog(|| {
            const THREADS: usize = 8;
            const ITERATIONS: usize = 1_000;

            let context = Context::new();
            let container = context.acquire(SettlementKind::Resolved, 7_u64);
            let barrier = Barrier::new(THREADS);

            thread::scope(|s| {
                for _ in 0..THREADS {
                    s.spawn(|| {
                        barrier.wait();

                        for _ in 0..ITERATIONS {
                            let handle = container.retain();
                            assert_eq!(*handle.get(), 7);
                            handle.release();
                        }
                    });
                }
            });

            assert_eq!(container.ref_count(), 1);
            container.release();
            assert_eq!(context.pool_stats().recycled(), 1);
        });
    }
}
