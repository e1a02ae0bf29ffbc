//! Settlement state machine.
//!
//! The following states exist, encoded as `u8` for atomic storage:
//!
//! 0 - pending - initial state; no settlement has happened yet.
//! 1 - resolved - the promise completed with a value.
//! 2 - rejected - the promise completed with a rejection reason.
//! 3 - canceled - the promise was canceled, either directly or by a cancelation source.
//!
//! The only legal transition is from pending to exactly one of the terminal states.

use std::fmt;

pub(crate) const STATE_PENDING: u8 = 0;
pub(crate) const STATE_RESOLVED: u8 = 1;
pub(crate) const STATE_REJECTED: u8 = 2;
pub(crate) const STATE_CANCELED: u8 = 3;

/// The observable state of a promise.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SettlementState {
    /// The promise has not been settled yet.
    Pending,

    /// The promise completed with a value.
    Resolved,

    /// The promise completed with a rejection reason.
    Rejected,

    /// The promise was canceled.
    Canceled,
}

impl SettlementState {
    /// Whether this is a terminal state.
    #[must_use]
    pub fn is_settled(self) -> bool {
        self != Self::Pending
    }

    /// The terminal kind of this state, or `None` if still pending.
    #[must_use]
    pub fn kind(self) -> Option<SettlementKind> {
        match self {
            Self::Pending => None,
            Self::Resolved => Some(SettlementKind::Resolved),
            Self::Rejected => Some(SettlementKind::Rejected),
            Self::Canceled => Some(SettlementKind::Canceled),
        }
    }

    pub(crate) fn from_u8(value: u8) -> Self {
        match value {
            STATE_PENDING => Self::Pending,
            STATE_RESOLVED => Self::Resolved,
            STATE_REJECTED => Self::Rejected,
            STATE_CANCELED => Self::Canceled,
            _ => unreachable!("settlement state is only ever written from the known constants"),
        }
    }
}

impl fmt::Display for SettlementState {
    #[cfg_attr(test, mutants::skip)] // No API contract for display output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Pending => f.write_str("pending"),
            Self::Resolved => f.write_str("resolved"),
            Self::Rejected => f.write_str("rejected"),
            Self::Canceled => f.write_str("canceled"),
        }
    }
}

/// The terminal kind of a settlement. Value containers only exist for settled promises,
/// so every container has exactly one of these.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum SettlementKind {
    /// Settled with a value.
    Resolved,

    /// Settled with a rejection reason.
    Rejected,

    /// Settled by cancelation.
    Canceled,
}

impl SettlementKind {
    pub(crate) fn as_u8(self) -> u8 {
        match self {
            Self::Resolved => STATE_RESOLVED,
            Self::Rejected => STATE_REJECTED,
            Self::Canceled => STATE_CANCELED,
        }
    }
}

impl From<SettlementKind> for SettlementState {
    fn from(kind: SettlementKind) -> Self {
        match kind {
            SettlementKind::Resolved => Self::Resolved,
            SettlementKind::Rejected => Self::Rejected,
            SettlementKind::Canceled => Self::Canceled,
        }
    }
}

impl fmt::Display for SettlementKind {
    #[cfg_attr(test, mutants::skip)] // No API contract for display output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        SettlementState::from(*self).fmt(f)
    }
}
