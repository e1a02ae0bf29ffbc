//! Settlement and value propagation core for asynchronous composition.
//!
//! A [`Promise`] tracks a pending computation through exactly one of three terminal outcomes:
//! resolved, rejected or canceled. It is settled through its [`DeferredController`], the only
//! handle permitted to settle it, which can also be registered against a
//! [`CancelationToken`] so that firing a [`CancelationSource`] cancels the promise.
//!
//! The settled payload lives in a reference-counted [`Container`], which is recycled through a
//! per-type pool once the last reference is released. Handlers read payloads through
//! type-directed conversion ([`Container::try_get_as`]), which first checks for an exact type
//! match and otherwise consults the active [`ConversionPolicy`].
//!
//! Rejections and cancelations that are never observed, settlements attempted on promises that
//! were already settled and controllers dropped while pending are recorded as
//! [`UnhandledOutcome`]s, which a diagnostic consumer drains with
//! [`Context::drain_unhandled`].
//!
//! All of this operates within a [`Context`], which holds the pool, the conversion policy and the
//! unhandled outcome registry.
//!
//! # Examples
//!
//! ```
//! use settlement::{CancelationSource, Context, SettlementState};
//!
//! let context = Context::new();
//! let source = CancelationSource::new();
//!
//! let deferred = context.deferred::<String>();
//! deferred.register_for_cancelation(&source.token());
//!
//! let promise = deferred.promise();
//! assert_eq!(promise.state(), SettlementState::Pending);
//!
//! deferred.resolve("done".to_string())?;
//!
//! // The controller unregistered from the source when it settled the promise.
//! source.cancel();
//!
//! assert_eq!(promise.value().as_deref(), Some("done"));
//! assert!(context.drain_unhandled().is_empty());
//! # Ok::<(), settlement::UsageError>(())
//! ```
//!
//! # Callback views
//!
//! The chaining layer invokes user callbacks with a [`ResultView`] or [`ReasonView`] via
//! [`invoke_with_result`] and [`invoke_with_reason`]. A view is only valid during the callback
//! that received it; access after the callback returned fails with
//! [`UsageError::ViewExpired`].
//!
//! # Logging
//!
//! Diagnostic warnings (such as settling a promise twice) are emitted via `tracing`. The crate
//! does not install a subscriber.

mod backtrace;
mod cancelation;
mod container;
mod context;
mod conversion;
mod deferred;
mod error;
mod payload;
mod pool;
mod promise;
mod ref_count;
mod signal;
mod state;
mod tracker;
mod unhandled;
mod view;

pub use backtrace::*;
pub use cancelation::*;
pub use container::*;
pub use context::*;
pub use conversion::*;
pub use deferred::*;
pub use error::*;
pub use payload::*;
pub use pool::*;
pub use promise::*;
pub(crate) use ref_count::*;
pub use signal::*;
pub use state::*;
pub use tracker::*;
pub use unhandled::*;
pub use view::*;
