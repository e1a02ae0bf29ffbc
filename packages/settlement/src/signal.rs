use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;

use thiserror::Error;

use crate::{AnyContainer, AnyError, CancelReason, UsageError};

/// A control transfer out of a user callback toward the chaining layer.
///
/// Signals are not errors. They are how a callback says "forward this settlement" or "cancel
/// from here" without returning normally, and the chaining layer must treat them differently
/// from genuine failures.
pub enum Signal {
    /// Forward the settlement held by the container to the next link, unobserved.
    ///
    /// The signal holds a reference to the container, keeping it alive until the next link
    /// receives it.
    Rethrow(AnyContainer),

    /// Cancel the downstream promise for the given reason.
    Cancel(CancelReason),
}

impl Signal {
    /// A signal to cancel the downstream promise without a reason.
    #[must_use]
    pub fn cancel() -> Self {
        Self::Cancel(CancelReason::default())
    }
}

impl fmt::Debug for Signal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rethrow(container) => f.debug_tuple("Rethrow").field(container).finish(),
            Self::Cancel(reason) => f.debug_tuple("Cancel").field(reason).finish(),
        }
    }
}

impl fmt::Display for Signal {
    #[cfg_attr(test, mutants::skip)] // No API contract for display output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Rethrow(container) => write!(f, "rethrow of {} settlement", container.kind()),
            Self::Cancel(_) => f.write_str("cancel from callback"),
        }
    }
}

/// The ways a user callback can exit other than by returning a value.
#[derive(Debug, Error)]
pub enum CallbackError {
    /// A control transfer. Not an error.
    #[error("control transfer: {0}")]
    Signal(Signal),

    /// The callback misused an API, such as accessing an expired view.
    #[error(transparent)]
    Usage(#[from] UsageError),

    /// The callback failed with its own error.
    #[error(transparent)]
    User(AnyError),
}

impl CallbackError {
    /// Wraps a user error.
    pub fn user<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        Self::User(Arc::new(error))
    }

    /// Whether this is a control transfer rather than a genuine error.
    #[must_use]
    pub fn is_signal(&self) -> bool {
        matches!(self, Self::Signal(_))
    }

    /// The control transfer, if this is one.
    #[must_use]
    pub fn into_signal(self) -> Option<Signal> {
        match self {
            Self::Signal(signal) => Some(signal),
            Self::Usage(_) | Self::User(_) => None,
        }
    }
}

impl From<Signal> for CallbackError {
    fn from(signal: Signal) -> Self {
        Self::Signal(signal)
    }
}
