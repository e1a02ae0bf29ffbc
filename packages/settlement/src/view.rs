//! Validity-scoped views handed to continuation callbacks.
//!
//! Every callback invocation gets a fresh identifier from a process-wide counter, which becomes
//! the ambient identifier of the current thread for the duration of the callback. A view is
//! stamped with the identifier of the invocation it was created for and every accessor checks
//! the stamp against the ambient identifier, so a view that escapes its callback fails with
//! [`UsageError::ViewExpired`] instead of returning stale data.

use std::any::{Any, type_name};
use std::cell::Cell;
use std::fmt;
use std::marker::PhantomData;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::{
    AnyContainer, CallSite, CallbackError, Payload, SettlementKind, Signal, UsageError,
};

/// Zero is never handed out, so it means "not inside any invocation".
static NEXT_INVOCATION: AtomicU64 = AtomicU64::new(1);

thread_local! {
    static CURRENT_INVOCATION: Cell<u64> = const { Cell::new(0) };
}

/// Makes a new invocation identifier ambient on the current thread until dropped, at which
/// point the previous one (from an enclosing invocation, if any) becomes ambient again.
struct InvocationScope {
    id: u64,
    previous: u64,

    _single_threaded: PhantomData<*const ()>,
}

impl InvocationScope {
    fn enter() -> Self {
        let id = NEXT_INVOCATION.fetch_add(1, Ordering::Relaxed);
        let previous = CURRENT_INVOCATION.replace(id);

        Self {
            id,
            previous,
            _single_threaded: PhantomData,
        }
    }
}

impl Drop for InvocationScope {
    fn drop(&mut self) {
        debug_assert_eq!(
            CURRENT_INVOCATION.get(),
            self.id,
            "invocation scopes must be exited in reverse order of entering"
        );

        CURRENT_INVOCATION.set(self.previous);
    }
}

/// A view stamped with an invocation identifier.
#[derive(Clone, Copy)]
struct Stamped<'a> {
    container: &'a AnyContainer,
    stamp: u64,
}

impl<'a> Stamped<'a> {
    fn check(&self) -> Result<&'a AnyContainer, UsageError> {
        if CURRENT_INVOCATION.get() == self.stamp {
            Ok(self.container)
        } else {
            Err(UsageError::ViewExpired {
                call_site: CallSite::capture(),
            })
        }
    }

    fn rethrow_if(&self, kind: SettlementKind) -> Result<(), CallbackError> {
        let container = self.check()?;

        if container.kind() == kind {
            return Err(Signal::Rethrow(container.retain()).into());
        }

        Ok(())
    }
}

/// Read access to the settlement of any kind, for a callback that expects a `T` on success.
///
/// Only valid during the callback invocation it was handed to.
pub struct ResultView<'a, T> {
    inner: Stamped<'a>,

    _value: PhantomData<fn() -> T>,
    _single_threaded: PhantomData<*const ()>,
}

impl<'a, T: Payload> ResultView<'a, T> {
    /// The kind of settlement.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::ViewExpired`] if called outside the invocation.
    pub fn kind(&self) -> Result<SettlementKind, UsageError> {
        Ok(self.inner.check()?.kind())
    }

    /// The resolved value.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::ViewExpired`] if called outside the invocation,
    /// [`UsageError::WrongKind`] if the settlement is not a resolution and
    /// [`UsageError::TypeMismatch`] if the resolved value is not a `T`.
    pub fn value(&self) -> Result<&'a T, UsageError> {
        let container = self.inner.check()?;

        if container.kind() != SettlementKind::Resolved {
            return Err(UsageError::WrongKind {
                expected: SettlementKind::Resolved,
                actual: container.kind(),
                call_site: CallSite::capture(),
            });
        }

        container
            .try_get_ref::<T>()
            .ok_or_else(|| UsageError::TypeMismatch {
                expected: type_name::<T>(),
                actual: container.payload_type_name(),
                call_site: CallSite::capture(),
            })
    }

    /// Reads the payload (of any settlement kind) as a `U`, via the active conversion policy.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::ViewExpired`] if called outside the invocation.
    pub fn try_get_as<U: Payload>(&self) -> Result<Option<U>, UsageError> {
        Ok(self.inner.check()?.try_get_as::<U>())
    }

    /// Signals a rethrow if the settlement is a rejection.
    ///
    /// # Errors
    ///
    /// Returns [`CallbackError::Signal`] with [`Signal::Rethrow`] if the settlement is a
    /// rejection, or [`CallbackError::Usage`] if called outside the invocation.
    pub fn rethrow_if_rejected(&self) -> Result<(), CallbackError> {
        self.inner.rethrow_if(SettlementKind::Rejected)
    }

    /// Signals a rethrow if the settlement is a cancelation.
    ///
    /// # Errors
    ///
    /// Returns [`CallbackError::Signal`] with [`Signal::Rethrow`] if the settlement is a
    /// cancelation, or [`CallbackError::Usage`] if called outside the invocation.
    pub fn rethrow_if_canceled(&self) -> Result<(), CallbackError> {
        self.inner.rethrow_if(SettlementKind::Canceled)
    }

    /// Retains the underlying container so it can be used after the callback returns.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::ViewExpired`] if called outside the invocation.
    pub fn retain(&self) -> Result<AnyContainer, UsageError> {
        Ok(self.inner.check()?.retain())
    }
}

impl<T> fmt::Debug for ResultView<'_, T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultView")
            .field("stamp", &self.inner.stamp)
            .field("value_type", &type_name::<T>())
            .finish_non_exhaustive()
    }
}

/// Read access to a rejection or cancelation reason.
///
/// Only valid during the callback invocation it was handed to.
pub struct ReasonView<'a> {
    inner: Stamped<'a>,

    _single_threaded: PhantomData<*const ()>,
}

impl<'a> ReasonView<'a> {
    /// The kind of settlement.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::ViewExpired`] if called outside the invocation.
    pub fn kind(&self) -> Result<SettlementKind, UsageError> {
        Ok(self.inner.check()?.kind())
    }

    /// The name of the static type of the reason.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::ViewExpired`] if called outside the invocation.
    pub fn type_name(&self) -> Result<&'static str, UsageError> {
        Ok(self.inner.check()?.payload_type_name())
    }

    /// Borrows the reason as a `U` if that is exactly its static type.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::ViewExpired`] if called outside the invocation.
    pub fn try_get_ref<U: Any>(&self) -> Result<Option<&'a U>, UsageError> {
        Ok(self.inner.check()?.try_get_ref::<U>())
    }

    /// Reads the reason as a `U`, via the active conversion policy.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::ViewExpired`] if called outside the invocation.
    pub fn try_get_as<U: Payload>(&self) -> Result<Option<U>, UsageError> {
        Ok(self.inner.check()?.try_get_as::<U>())
    }

    /// Marks the reason as observed, so it is not reported as unhandled.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::ViewExpired`] if called outside the invocation.
    pub fn mark_handled(&self) -> Result<(), UsageError> {
        self.inner.check()?.mark_handled();
        Ok(())
    }

    /// Signals a rethrow if the settlement is a rejection.
    ///
    /// # Errors
    ///
    /// Returns [`CallbackError::Signal`] with [`Signal::Rethrow`] if the settlement is a
    /// rejection, or [`CallbackError::Usage`] if called outside the invocation.
    pub fn rethrow_if_rejected(&self) -> Result<(), CallbackError> {
        self.inner.rethrow_if(SettlementKind::Rejected)
    }

    /// Signals a rethrow if the settlement is a cancelation.
    ///
    /// # Errors
    ///
    /// Returns [`CallbackError::Signal`] with [`Signal::Rethrow`] if the settlement is a
    /// cancelation, or [`CallbackError::Usage`] if called outside the invocation.
    pub fn rethrow_if_canceled(&self) -> Result<(), CallbackError> {
        self.inner.rethrow_if(SettlementKind::Canceled)
    }
}

impl fmt::Debug for ReasonView<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReasonView")
            .field("stamp", &self.inner.stamp)
            .finish_non_exhaustive()
    }
}

/// Invokes `callback` with a [`ResultView`] over `container` that is valid for exactly the
/// duration of the call.
///
/// This is the hook through which a chaining layer hands settlements to user callbacks.
pub fn invoke_with_result<'c, T, R>(
    container: &'c AnyContainer,
    callback: impl FnOnce(ResultView<'c, T>) -> R,
) -> R
where
    T: Payload,
{
    let scope = InvocationScope::enter();

    let view = ResultView {
        inner: Stamped {
            container,
            stamp: scope.id,
        },
        _value: PhantomData,
        _single_threaded: PhantomData,
    };

    callback(view)
}

/// Invokes `callback` with a [`ReasonView`] over `container` that is valid for exactly the
/// duration of the call.
///
/// This is the hook through which a chaining layer hands rejections and cancelations to
/// user callbacks.
pub fn invoke_with_reason<'c, R>(
    container: &'c AnyContainer,
    callback: impl FnOnce(ReasonView<'c>) -> R,
) -> R {
    let scope = InvocationScope::enter();

    let view = ReasonView {
        inner: Stamped {
            container,
            stamp: scope.id,
        },
        _single_threaded: PhantomData,
    };

    callback(view)
}

#[cfg(test)]
mod tests {
    use static_assertions::assert_not_impl_any;

    use super::*;
    use crate::Context;

    assert_not_impl_any!(ResultView<'static, i32>: Send, Sync);
    assert_not_impl_any!(ReasonView<'static>: Send, Sync);

    #[test]
    fn result_view_reads_value() {
        let context = Context::new();
        let container = context.acquire(SettlementKind::Resolved, 42_i32).into_any();

        let value = invoke_with_result::<i32, _>(&container, |view| {
            assert_eq!(view.kind().unwrap(), SettlementKind::Resolved);
            assert!(view.rethrow_if_rejected().is_ok());
            assert!(view.rethrow_if_canceled().is_ok());
            *view.value().unwrap()
        });

        assert_eq!(value, 42);
    }

    #[test]
    fn escaped_view_is_expired() {
        let context = Context::new();
        let container = context.acquire(SettlementKind::Resolved, 42_i32).into_any();

        let escaped = invoke_with_result::<i32, _>(&container, |view| view);

        assert!(matches!(
            escaped.value(),
            Err(UsageError::ViewExpired { .. })
        ));
        assert!(matches!(
            escaped.kind(),
            Err(UsageError::ViewExpired { .. })
        ));
        assert!(matches!(
            escaped.rethrow_if_rejected(),
            Err(CallbackError::Usage(UsageError::ViewExpired { .. }))
        ));
    }

    #[test]
    fn outer_view_invalid_during_nested_invocation() {
        let context = Context::new();
        let outer = context.acquire(SettlementKind::Resolved, 1_i32).into_any();
        let inner = context.acquire(SettlementKind::Resolved, 2_i32).into_any();

        invoke_with_result::<i32, _>(&outer, |outer_view| {
            invoke_with_result::<i32, _>(&inner, |inner_view| {
                assert_eq!(*inner_view.value().unwrap(), 2);
                assert!(outer_view.value().is_err());
            });

            // The enclosing invocation is ambient again.
            assert_eq!(*outer_view.value().unwrap(), 1);
        });
    }

    #[test]
    fn value_of_wrong_kind_or_type() {
        let context = Context::new();
        let rejected = context
            .acquire(SettlementKind::Rejected, "boom".to_string())
            .into_any();
        rejected.mark_handled();

        invoke_with_result::<i32, _>(&rejected, |view| {
            assert!(matches!(view.value(), Err(UsageError::WrongKind { .. })));
            assert_eq!(view.try_get_as::<String>().unwrap().as_deref(), Some("boom"));
        });

        let resolved = context.acquire(SettlementKind::Resolved, 1_u8).into_any();

        invoke_with_result::<i32, _>(&resolved, |view| {
            assert!(matches!(view.value(), Err(UsageError::TypeMismatch { .. })));
        });
    }

    #[test]
    fn rethrow_forwards_retained_container() {
        let context = Context::new();
        let container = context
            .acquire(SettlementKind::Rejected, "boom".to_string())
            .into_any();

        let result = invoke_with_reason(&container, |view| -> Result<(), CallbackError> {
            view.rethrow_if_canceled()?;
            view.rethrow_if_rejected()?;
            Ok(())
        });

        let Some(Signal::Rethrow(forwarded)) = result.unwrap_err().into_signal() else {
            panic!("expected a rethrow signal");
        };

        assert_eq!(container.ref_count(), 2);
        assert_eq!(forwarded.kind(), SettlementKind::Rejected);

        // The next link handles it.
        forwarded.mark_handled();
    }

    #[test]
    fn reason_view_reads_and_marks_handled() {
        let context = Context::new();
        let container = context
            .acquire(SettlementKind::Canceled, "stop".to_string())
            .into_any();

        invoke_with_reason(&container, |view| {
            assert_eq!(view.kind().unwrap(), SettlementKind::Canceled);
            assert_eq!(view.type_name().unwrap(), type_name::<String>());
            assert_eq!(view.try_get_ref::<String>().unwrap().unwrap(), "stop");
            assert!(view.try_get_ref::<u8>().unwrap().is_none());
            view.mark_handled().unwrap();
        });

        container.release();
        assert!(context.drain_unhandled().is_empty());
    }
}
