#[cfg(debug_assertions)]
use std::backtrace::Backtrace;
use std::fmt;

/// The call site at which a usage error was detected or a deferred controller was created.
///
/// A backtrace is only captured if both:
///
/// 1. `RUST_BACKTRACE=1` (or `RUST_LIB_BACKTRACE=1`) is set.
/// 2. `cfg(debug_assertions)` is enabled (e.g. you are using the default `dev` Cargo profile).
///
/// In other configurations this type is empty and costs nothing to create.
pub struct CallSite {
    #[cfg(debug_assertions)]
    backtrace: Option<Backtrace>,
}

impl CallSite {
    /// Captures the current call site.
    pub(crate) fn capture() -> Self {
        Self::capture_if(true)
    }

    /// Captures the current call site if `enabled`, otherwise returns an empty call site.
    pub(crate) fn capture_if(enabled: bool) -> Self {
        #[cfg(debug_assertions)]
        {
            Self {
                backtrace: enabled.then(Backtrace::capture),
            }
        }
        #[cfg(not(debug_assertions))]
        {
            _ = enabled;
            Self {}
        }
    }

    /// A call site that carries no information.
    pub(crate) fn empty() -> Self {
        Self::capture_if(false)
    }

    /// The backtrace captured at the call site, if one was captured.
    ///
    /// This method is only available in debug builds (`cfg(debug_assertions)`).
    #[cfg(debug_assertions)]
    #[must_use]
    pub fn backtrace(&self) -> Option<&Backtrace> {
        self.backtrace.as_ref()
    }
}

impl fmt::Debug for CallSite {
    #[cfg_attr(test, mutants::skip)] // No API contract for debug output.
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut s = f.debug_struct("CallSite");

        #[cfg(debug_assertions)]
        s.field("backtrace", &self.backtrace);

        s.finish()
    }
}
