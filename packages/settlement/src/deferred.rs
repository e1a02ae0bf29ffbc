use std::any::type_name;
use std::error::Error;
use std::fmt;
use std::marker::PhantomData;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::{debug, warn};

use crate::{
    AnyValue, CallSite, CancelReason, CancelationRegistration, CancelationToken, ContainerOrigin,
    ErasedPayload, NotPending, OutcomeKind, Payload, PayloadOps, Promise, PromiseCore, PromiseId,
    SettlementKind, SettlementState, Shared, UnhandledOutcome, UsageError,
};

/// The handle authorized to settle one specific [`Promise`].
///
/// A controller settles its promise at most once, by resolving it with a `T`, rejecting it with
/// a reason of any type or canceling it. Settlement methods take `&self`; once the promise is
/// no longer pending they stop having any effect on it:
///
/// * The `try_*` methods return the payload to the caller in a [`NotPending`] error.
/// * The other methods log a warning and record the payload as an
///   [orphaned][OutcomeKind::Orphaned] unhandled outcome, since nothing is left to receive it.
///   If the context uses [strict settlement][crate::ContextBuilder::strict_settlement] (the
///   default in debug builds), they also return [`UsageError::NotPending`].
///
/// A controller may be registered against a [`CancelationToken`], in which case the promise is
/// canceled when the token fires, unless it has been settled by then. Settling the promise
/// unregisters from the token first.
///
/// Dropping a controller while its promise is still pending records the promise as
/// [abandoned][OutcomeKind::Abandoned].
///
/// # Examples
///
/// ```
/// use settlement::{Context, SettlementState};
///
/// let context = Context::new();
///
/// let deferred = context.deferred::<u32>();
/// let promise = deferred.promise();
///
/// deferred.resolve(42)?;
///
/// assert_eq!(promise.state(), SettlementState::Resolved);
/// assert_eq!(promise.value(), Some(42));
/// # Ok::<(), settlement::UsageError>(())
/// ```
pub struct DeferredController<T: Payload> {
    core: Arc<PromiseCore>,

    registration: Mutex<Option<CancelationRegistration>>,

    _value: PhantomData<fn(T)>,
}

impl<T: Payload> DeferredController<T> {
    pub(crate) fn new(shared: &Arc<Shared>) -> Self {
        let core = Arc::new(PromiseCore::new(
            shared.next_promise_id(),
            type_name::<T>(),
            Arc::clone(shared),
        ));

        shared.tracker.insert(&core, shared.call_site());

        Self {
            core,
            registration: Mutex::new(None),
            _value: PhantomData,
        }
    }

    /// A promise that observes the settlement made through this controller.
    #[must_use]
    pub fn promise(&self) -> Promise<T> {
        Promise::new(Arc::clone(&self.core))
    }

    /// Identifies the controlled promise within its context.
    #[must_use]
    pub fn promise_id(&self) -> PromiseId {
        self.core.id()
    }

    /// The current state of the controlled promise.
    #[must_use]
    pub fn state(&self) -> SettlementState {
        self.core.state()
    }

    /// Whether the controlled promise can still be settled.
    #[must_use]
    pub fn is_pending(&self) -> bool {
        !self.state().is_settled()
    }

    /// Resolves the promise with `value`, giving `value` back if the promise is not pending.
    pub fn try_resolve(&self, value: T) -> Result<(), NotPending<T>> {
        self.try_settle(
            SettlementKind::Resolved,
            ContainerOrigin::User,
            PayloadOps::of::<T>(),
            value,
        )
    }

    /// Resolves the promise with `value`.
    ///
    /// If the promise is not pending, `value` is recorded as an orphaned unhandled outcome.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::NotPending`] if the promise is not pending and the context uses
    /// strict settlement.
    pub fn resolve(&self, value: T) -> Result<(), UsageError> {
        self.settle_or_orphan(
            SettlementKind::Resolved,
            ContainerOrigin::User,
            PayloadOps::of::<T>(),
            value,
        )
    }

    /// Rejects the promise with `reason`, giving `reason` back if the promise is not pending.
    pub fn try_reject<E: Payload>(&self, reason: E) -> Result<(), NotPending<E>> {
        self.try_settle(
            SettlementKind::Rejected,
            ContainerOrigin::User,
            PayloadOps::of::<E>(),
            reason,
        )
    }

    /// Rejects the promise with `reason`.
    ///
    /// If the promise is not pending, `reason` is recorded as an orphaned unhandled outcome.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::NotPending`] if the promise is not pending and the context uses
    /// strict settlement.
    pub fn reject<E: Payload>(&self, reason: E) -> Result<(), UsageError> {
        self.settle_or_orphan(
            SettlementKind::Rejected,
            ContainerOrigin::User,
            PayloadOps::of::<E>(),
            reason,
        )
    }

    /// Rejects the promise with an error.
    ///
    /// Unlike [`reject`][Self::reject], the reason can later also be read as an
    /// [`AnyError`][crate::AnyError], so handlers for "any error" can observe it.
    ///
    /// # Errors
    ///
    /// Same as [`reject`][Self::reject].
    pub fn reject_error<E: Payload + Error>(&self, error: E) -> Result<(), UsageError> {
        self.settle_or_orphan(
            SettlementKind::Rejected,
            ContainerOrigin::User,
            PayloadOps::of_error::<E>(),
            error,
        )
    }

    /// Cancels the promise without a reason, giving the cancel reason back if the promise is
    /// not pending.
    pub fn try_cancel(&self) -> Result<(), NotPending<CancelReason>> {
        self.try_settle(
            SettlementKind::Canceled,
            ContainerOrigin::Internal,
            PayloadOps::of::<CancelReason>(),
            CancelReason::default(),
        )
    }

    /// Cancels the promise without a reason.
    ///
    /// # Errors
    ///
    /// Same as [`reject`][Self::reject].
    pub fn cancel(&self) -> Result<(), UsageError> {
        self.settle_or_orphan(
            SettlementKind::Canceled,
            ContainerOrigin::Internal,
            PayloadOps::of::<CancelReason>(),
            CancelReason::default(),
        )
    }

    /// Cancels the promise, carrying `reason` as the explanation.
    ///
    /// # Errors
    ///
    /// Same as [`reject`][Self::reject].
    pub fn cancel_with(&self, reason: AnyValue) -> Result<(), UsageError> {
        self.settle_or_orphan(
            SettlementKind::Canceled,
            ContainerOrigin::Internal,
            PayloadOps::of::<CancelReason>(),
            CancelReason::new(Some(reason)),
        )
    }

    /// Cancels the promise when `token` fires, unless the promise has been settled by then.
    ///
    /// If the token has already fired, the promise is canceled before this method returns.
    /// Replaces any earlier registration of this controller.
    pub fn register_for_cancelation(&self, token: &CancelationToken) {
        let promise = Arc::downgrade(&self.core);

        let registration = token.register(move |reason| {
            let Some(core) = promise.upgrade() else {
                return;
            };

            if let Err(lost) = core.settle(
                SettlementKind::Canceled,
                ContainerOrigin::Internal,
                PayloadOps::of::<CancelReason>(),
                reason.clone(),
            ) {
                debug!(
                    promise_id = %lost.promise_id(),
                    state = %lost.state(),
                    "cancelation lost the race against settlement"
                );
            }
        });

        let previous = self.registration.lock().replace(registration);

        if let Some(previous) = previous {
            previous.dispose();
        }
    }

    /// Reports how far the pending computation has progressed, as a fraction in `[0, 1]`.
    ///
    /// Progress never decreases; reports lower than the current progress are ignored. Reports
    /// made after the promise settled are ignored with a warning.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::ProgressOutOfRange`] if `value` is not within `[0, 1]`.
    pub fn report_progress(&self, value: f64) -> Result<(), UsageError> {
        self.core.report_progress(value)
    }

    fn unregister(&self) {
        let registration = self.registration.lock().take();

        if let Some(registration) = registration {
            registration.dispose();
        }
    }

    fn try_settle<V: Payload>(
        &self,
        kind: SettlementKind,
        origin: ContainerOrigin,
        ops: PayloadOps,
        payload: V,
    ) -> Result<(), NotPending<V>> {
        // A cancelation that fires from now on cannot also settle the promise. One that is
        // already firing races with us below and exactly one of us wins.
        self.unregister();

        self.core.settle(kind, origin, ops, payload)
    }

    fn settle_or_orphan<V: Payload>(
        &self,
        kind: SettlementKind,
        origin: ContainerOrigin,
        ops: PayloadOps,
        payload: V,
    ) -> Result<(), UsageError> {
        let Err(error) = self.try_settle(kind, origin, ops, payload) else {
            return Ok(());
        };

        warn!(
            promise_id = %error.promise_id(),
            attempted = %kind,
            state = %error.state(),
            payload_type = ops.type_name(),
            "settlement attempted on a promise that is no longer pending"
        );

        let shared = self.core.shared();
        let promise_id = error.promise_id();
        let state = error.state();

        shared.unhandled.report(
            UnhandledOutcome::new(
                OutcomeKind::Orphaned(kind),
                Some(ErasedPayload::new(error.into_payload(), ops)),
                Some(promise_id),
                shared.conversion(),
            )
            .with_call_site(shared.call_site()),
        );

        if shared.strict_settlement() {
            Err(UsageError::NotPending {
                promise_id,
                state,
                call_site: shared.call_site(),
            })
        } else {
            Ok(())
        }
    }
}

impl<T: Payload> Drop for DeferredController<T> {
    fn drop(&mut self) {
        if let Some(registration) = self.registration.get_mut().take() {
            registration.dispose();
        }

        if self.core.state().is_settled() {
            return;
        }

        let shared = self.core.shared();
        let call_site = shared.tracker.remove(self.core.id());

        if !self.core.mark_abandon_reported() {
            // Already reported by a sweep.
            return;
        }

        warn!(
            promise_id = %self.core.id(),
            payload_type = self.core.payload_type(),
            "deferred controller dropped while its promise was still pending"
        );

        shared.unhandled.report(
            UnhandledOutcome::new(
                OutcomeKind::Abandoned,
                None,
                Some(self.core.id()),
                shared.conversion(),
            )
            .with_call_site(call_site.unwrap_or_else(CallSite::empty)),
        );
    }
}

impl<T: Payload> fmt::Debug for DeferredController<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeferredController")
            .field("core", &self.core)
            .field("registration", &self.registration)
            .finish_non_exhaustive()
    }
}
