use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};

use parking_lot::Mutex;
use tracing::warn;

use crate::{
    Acquire, AnyContainer, CallSite, Container, ContainerOrigin, NotPending, Payload, PayloadOps,
    ReasonView, ResultView, STATE_PENDING, SettlementKind, SettlementState, Shared, UsageError,
    invoke_with_reason, invoke_with_result,
};

/// Identifies a promise within the [`Context`][crate::Context] that created it.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct PromiseId(u64);

impl PromiseId {
    pub(crate) fn new(value: u64) -> Self {
        Self(value)
    }

    /// The numeric value of the identifier.
    #[must_use]
    pub fn get(self) -> u64 {
        self.0
    }
}

impl fmt::Display for PromiseId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// The state shared between a deferred controller and the promises it settles.
pub(crate) struct PromiseCore {
    id: PromiseId,

    /// Written only while holding the `result` lock, so a reader that observes a terminal state
    /// here will also find the container in `result`.
    state: AtomicU8,

    result: Mutex<Option<AnyContainer>>,

    /// Bits of an `f64` in `[0, 1]`. Only ever increases.
    progress: AtomicU64,

    /// Set once the promise has been reported as abandoned, so it is only ever reported once.
    abandon_reported: AtomicBool,

    payload_type: &'static str,

    shared: Arc<Shared>,
}

impl PromiseCore {
    pub(crate) fn new(id: PromiseId, payload_type: &'static str, shared: Arc<Shared>) -> Self {
        Self {
            id,
            state: AtomicU8::new(STATE_PENDING),
            result: Mutex::new(None),
            progress: AtomicU64::new(0.0_f64.to_bits()),
            abandon_reported: AtomicBool::new(false),
            payload_type,
            shared,
        }
    }

    pub(crate) fn id(&self) -> PromiseId {
        self.id
    }

    pub(crate) fn payload_type(&self) -> &'static str {
        self.payload_type
    }

    pub(crate) fn shared(&self) -> &Arc<Shared> {
        &self.shared
    }

    pub(crate) fn state(&self) -> SettlementState {
        SettlementState::from_u8(self.state.load(Ordering::Acquire))
    }

    /// Transitions the promise from pending to `kind`, storing `payload` in a freshly acquired
    /// container.
    ///
    /// Exactly one call per promise succeeds. All others get their payload back.
    #[cfg_attr(test, mutants::skip)] // Critical - mutation breaks settle-once.
    pub(crate) fn settle<V: Payload>(
        &self,
        kind: SettlementKind,
        origin: ContainerOrigin,
        ops: PayloadOps,
        payload: V,
    ) -> Result<(), NotPending<V>> {
        {
            let mut result = self.result.lock();

            let current = self.state();
            if current != SettlementState::Pending {
                return Err(NotPending::new(payload, self.id, current));
            }

            let container = Container::acquire(
                &self.shared,
                Acquire {
                    kind,
                    origin,
                    ops,
                    promise_id: Some(self.id),
                },
                payload,
            );

            *result = Some(container.into_any());
            self.state.store(kind.as_u8(), Ordering::Release);
        }

        // Any tracked entry is now stale.
        self.shared.tracker.remove(self.id);

        Ok(())
    }

    /// The settlement container, retained for the caller. `None` while pending.
    pub(crate) fn result(&self) -> Option<AnyContainer> {
        self.result.lock().as_ref().map(AnyContainer::retain)
    }

    pub(crate) fn progress(&self) -> f64 {
        f64::from_bits(self.progress.load(Ordering::Acquire))
    }

    /// Raises the progress to `value` unless it is already at least that high.
    pub(crate) fn report_progress(&self, value: f64) -> Result<(), UsageError> {
        if !(0.0..=1.0).contains(&value) {
            return Err(UsageError::ProgressOutOfRange {
                value,
                call_site: CallSite::capture(),
            });
        }

        if self.state().is_settled() {
            warn!(
                promise_id = %self.id,
                progress = value,
                "progress reported after settlement, ignoring"
            );
            return Ok(());
        }

        // Non-negative floats order the same way as their bit patterns. `abs` turns -0.0 into 0.0.
        self.progress
            .fetch_max(value.abs().to_bits(), Ordering::AcqRel);

        Ok(())
    }

    /// Returns `true` for the first caller only.
    pub(crate) fn mark_abandon_reported(&self) -> bool {
        !self.abandon_reported.swap(true, Ordering::AcqRel)
    }
}

impl fmt::Debug for PromiseCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PromiseCore")
            .field("id", &self.id)
            .field("state", &self.state())
            .field("payload_type", &self.payload_type)
            .finish_non_exhaustive()
    }
}

/// The read side of a settlement: observes the state and outcome of a pending computation.
///
/// A promise is settled through its [`DeferredController`][crate::DeferredController] at most
/// once, after which it holds a container with the resolved value (of type `T`), the rejection
/// reason (of any type) or the cancel reason ([`CancelReason`][crate::CancelReason]).
///
/// Promises are cheap to clone; all clones observe the same settlement.
///
/// If a promise is rejected or canceled and nobody ever reads the reason through
/// [`observe_reason`][Self::observe_reason] (marking it handled) or forwards the container, the
/// reason is reported as an unhandled outcome once the last promise clone is dropped.
pub struct Promise<T: Payload> {
    core: Arc<PromiseCore>,

    _value: PhantomData<fn() -> T>,
}

impl<T: Payload> Promise<T> {
    pub(crate) fn new(core: Arc<PromiseCore>) -> Self {
        Self {
            core,
            _value: PhantomData,
        }
    }

    /// Identifies the promise within its context.
    #[must_use]
    pub fn id(&self) -> PromiseId {
        self.core.id()
    }

    /// The current state of the promise.
    #[must_use]
    pub fn state(&self) -> SettlementState {
        self.core.state()
    }

    /// Whether the promise has not been settled yet.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        !self.state().is_settled()
    }

    /// The last progress reported for the promise, in `[0, 1]`.
    ///
    /// Progress is not adjusted on settlement; it stays at the last reported value.
    #[must_use]
    pub fn progress(&self) -> f64 {
        self.core.progress()
    }

    /// A retained handle to the settlement container, or `None` while pending.
    ///
    /// The chaining layer uses this to decide which handler to invoke and to forward the
    /// container to the next link.
    #[must_use]
    pub fn container(&self) -> Option<AnyContainer> {
        self.core.result()
    }

    /// The resolved value, or `None` if the promise is pending or was not resolved.
    #[must_use]
    pub fn value(&self) -> Option<T> {
        let container = self.core.result()?;

        if container.kind() != SettlementKind::Resolved {
            return None;
        }

        container.try_get_as::<T>()
    }

    /// Invokes `callback` with a view over the settlement, if the promise is settled.
    ///
    /// The view is only valid for the duration of the callback.
    pub fn observe_result<R>(&self, callback: impl FnOnce(ResultView<'_, T>) -> R) -> Option<R> {
        let container = self.core.result()?;
        Some(invoke_with_result(&container, callback))
    }

    /// Invokes `callback` with a view over the rejection or cancel reason, if the promise was
    /// rejected or canceled.
    ///
    /// The callback decides whether it handled the reason by calling
    /// [`ReasonView::mark_handled`].
    pub fn observe_reason<R>(&self, callback: impl FnOnce(ReasonView<'_>) -> R) -> Option<R> {
        let container = self.core.result()?;

        if container.kind() == SettlementKind::Resolved {
            return None;
        }

        Some(invoke_with_reason(&container, callback))
    }
}

impl<T: Payload> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self::new(Arc::clone(&self.core))
    }
}

impl<T: Payload> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("id", &self.id())
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Barrier;
    use std::thread;

    use static_assertions::{assert_impl_all, assert_not_impl_any};

    use super::*;
    use crate::{CancelReason, Context, OutcomeKind};

    assert_impl_all!(Promise<String>: Send, Sync, Clone);
    assert_impl_all!(PromiseCore: Send, Sync);
    assert_not_impl_any!(PromiseId: Default);

    fn new_core(context: &Context) -> PromiseCore {
        PromiseCore::new(PromiseId::new(1), "i32", Arc::clone(&context.shared))
    }

    #[test]
    fn settles_exactly_once() {
        let context = Context::new();
        let core = new_core(&context);
        assert_eq!(core.state(), SettlementState::Pending);
        assert!(core.result().is_none());

        core.settle(
            SettlementKind::Resolved,
            ContainerOrigin::User,
            PayloadOps::of::<i32>(),
            42_i32,
        )
        .unwrap();

        let error = core
            .settle(
                SettlementKind::Rejected,
                ContainerOrigin::User,
                PayloadOps::of::<String>(),
                "late".to_string(),
            )
            .unwrap_err();

        assert_eq!(error.state(), SettlementState::Resolved);
        assert_eq!(error.into_payload(), "late");
        assert_eq!(core.state(), SettlementState::Resolved);

        let container = core.result().unwrap();
        assert_eq!(container.try_get_as::<i32>(), Some(42));
        assert_eq!(container.promise_id(), Some(PromiseId::new(1)));
    }

    #[test]
    fn concurrent_settlement_has_one_winner() {
        testing::with_watchdog(|| {
            const THREADS: usize = 4;

            for _ in 0..50 {
                let context = Context::new();
                let core = new_core(&context);
                let barrier = Barrier::new(THREADS);

                let winners = thread::scope(|s| {
                    let handles: Vec<_> = (0..THREADS)
                        .map(|index| {
                            let core = &core;
                            let barrier = &barrier;
                            s.spawn(move || {
                                barrier.wait();
                                core.settle(
                                    SettlementKind::Resolved,
                                    ContainerOrigin::User,
                                    PayloadOps::of::<usize>(),
                                    index,
                                )
                                .is_ok()
                            })
                        })
                        .collect();

                    handles
                        .into_iter()
                        .filter_map(|handle| handle.join().ok())
                        .filter(|won| *won)
                        .count()
                });

                assert_eq!(winners, 1);
                assert_eq!(core.state(), SettlementState::Resolved);
            }
        });
    }

    #[test]
    fn progress_is_monotonic_and_validated() {
        let context = Context::new();
        let core = new_core(&context);

        core.report_progress(0.5).unwrap();
        core.report_progress(0.25).unwrap();
        assert!((core.progress() - 0.5).abs() < f64::EPSILON);

        assert!(matches!(
            core.report_progress(1.5),
            Err(UsageError::ProgressOutOfRange { .. })
        ));
        assert!(matches!(
            core.report_progress(f64::NAN),
            Err(UsageError::ProgressOutOfRange { .. })
        ));

        core.settle(
            SettlementKind::Resolved,
            ContainerOrigin::User,
            PayloadOps::of::<i32>(),
            1_i32,
        )
        .unwrap();

        // Ignored with a warning.
        core.report_progress(1.0).unwrap();
        assert!((core.progress() - 0.5).abs() < f64::EPSILON);
    }

    #[test]
    fn abandon_reported_once() {
        let context = Context::new();
        let core = new_core(&context);

        assert!(core.mark_abandon_reported());
        assert!(!core.mark_abandon_reported());
    }

    #[test]
    fn unobserved_rejection_reported_when_promise_dropped() {
        let context = Context::new();
        let core = Arc::new(new_core(&context));
        let promise = Promise::<i32>::new(Arc::clone(&core));

        core.settle(
            SettlementKind::Rejected,
            ContainerOrigin::User,
            PayloadOps::of::<String>(),
            "boom".to_string(),
        )
        .unwrap();

        assert_eq!(promise.value(), None);
        drop(promise);
        assert!(context.drain_unhandled().is_empty());

        drop(core);
        let unhandled = context.drain_unhandled();
        assert_eq!(unhandled.len(), 1);
        assert_eq!(unhandled[0].kind(), OutcomeKind::Rejected);
    }

    #[test]
    fn observed_reason_is_not_reported() {
        let context = Context::new();
        let core = Arc::new(new_core(&context));
        let promise = Promise::<i32>::new(Arc::clone(&core));

        core.settle(
            SettlementKind::Canceled,
            ContainerOrigin::Internal,
            PayloadOps::of::<CancelReason>(),
            CancelReason::default(),
        )
        .unwrap();

        assert!(promise.observe_result(|view| view.value().is_err()).unwrap());

        let seen = promise.observe_reason(|view| {
            view.mark_handled().unwrap();
            view.kind().unwrap()
        });
        assert_eq!(seen, Some(SettlementKind::Canceled));

        drop(promise);
        drop(core);
        assert!(context.drain_unhandled().is_empty());
    }
}
