use std::fmt;

use thiserror::Error;

use crate::{CallSite, PromiseId, SettlementKind, SettlementState, UnsettledDeferred};

/// An operation was used in a way that violates its contract.
///
/// Where applicable, the error carries the [`CallSite`] at which the violation was detected.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum UsageError {
    /// A settlement or progress operation was attempted on a promise that is no longer pending.
    #[error("promise {promise_id} is no longer pending (it is {state})")]
    NotPending {
        /// The promise that was targeted.
        promise_id: PromiseId,

        /// The state the promise was found in.
        state: SettlementState,

        /// Where the attempt was made.
        call_site: CallSite,
    },

    /// A result or reason view was accessed after the callback that received it had returned.
    #[error("view accessed outside of the callback invocation that received it")]
    ViewExpired {
        /// Where the access was attempted.
        call_site: CallSite,
    },

    /// A view was asked for its value as a type that the container does not hold.
    #[error("view over a {actual} container was read as {expected}")]
    TypeMismatch {
        /// The requested type.
        expected: &'static str,

        /// The static payload type of the container.
        actual: &'static str,

        /// Where the access was attempted.
        call_site: CallSite,
    },

    /// A view was asked for a resolved value but the container holds another kind of settlement.
    #[error("view over a {actual} container was read as {expected}")]
    WrongKind {
        /// The settlement kind the access requires.
        expected: SettlementKind,

        /// The settlement kind of the container.
        actual: SettlementKind,

        /// Where the access was attempted.
        call_site: CallSite,
    },

    /// A progress value outside of `[0, 1]` (or not a number) was reported.
    #[error("progress {value} is outside of the range [0, 1]")]
    ProgressOutOfRange {
        /// The reported value.
        value: f64,

        /// Where the report was made.
        call_site: CallSite,
    },

    /// Deferred controllers were found unsettled when all were required to be settled.
    #[error("{} deferred controller(s) were never settled", .unsettled.len())]
    UnsettledAtShutdown {
        /// The controllers that were still unsettled.
        unsettled: Vec<UnsettledDeferred>,
    },

    /// A global context was installed when one was already in use.
    #[error("a global context has already been installed or used")]
    ContextAlreadyInstalled,
}

impl UsageError {
    /// The call site at which the violation was detected, if the error carries one.
    #[must_use]
    pub fn call_site(&self) -> Option<&CallSite> {
        match self {
            Self::NotPending { call_site, .. }
            | Self::ViewExpired { call_site }
            | Self::TypeMismatch { call_site, .. }
            | Self::WrongKind { call_site, .. }
            | Self::ProgressOutOfRange { call_site, .. } => Some(call_site),
            Self::UnsettledAtShutdown { .. } | Self::ContextAlreadyInstalled => None,
        }
    }
}

/// A settlement was attempted on a promise that is no longer pending.
///
/// The payload that could not be delivered is handed back to the caller, who becomes
/// responsible for it.
#[derive(Error)]
#[error("promise {promise_id} is no longer pending (it is {state})")]
pub struct NotPending<V> {
    payload: V,
    promise_id: PromiseId,
    state: SettlementState,
}

impl<V> NotPending<V> {
    pub(crate) fn new(payload: V, promise_id: PromiseId, state: SettlementState) -> Self {
        Self {
            payload,
            promise_id,
            state,
        }
    }

    /// The promise that was targeted.
    #[must_use]
    pub fn promise_id(&self) -> PromiseId {
        self.promise_id
    }

    /// The state the promise was found in.
    #[must_use]
    pub fn state(&self) -> SettlementState {
        self.state
    }

    /// The payload that could not be delivered.
    #[must_use]
    pub fn payload(&self) -> &V {
        &self.payload
    }

    /// Takes back the payload that could not be delivered.
    #[must_use]
    pub fn into_payload(self) -> V {
        self.payload
    }
}

impl<V> fmt::Debug for NotPending<V> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NotPending")
            .field("promise_id", &self.promise_id)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error as StdError;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(UsageError: Send, Sync, StdError);
    assert_impl_all!(NotPending<String>: Send, Sync, StdError);

    #[test]
    fn not_pending_gives_payload_back() {
        let error = NotPending::new(
            "late".to_string(),
            PromiseId::new(3),
            SettlementState::Resolved,
        );

        assert_eq!(error.promise_id(), PromiseId::new(3));
        assert_eq!(error.state(), SettlementState::Resolved);
        assert_eq!(error.payload(), "late");
        assert_eq!(error.into_payload(), "late");
    }

    #[test]
    fn call_site_presence() {
        let error = UsageError::ViewExpired {
            call_site: CallSite::empty(),
        };
        assert!(error.call_site().is_some());

        let error = UsageError::ContextAlreadyInstalled;
        assert!(error.call_site().is_none());
    }
}
