//! Cooperative cancelation.
//!
//! A [`CancelationSource`] is a broadcastable trigger. Cancelable operations subscribe to it via
//! its [`CancelationToken`], receiving a [`CancelationRegistration`] that can later be used to
//! unsubscribe.
//!
//! The source state machine:
//!
//! * Open - accepts new registrations.
//! * Canceling - callbacks are being invoked. Registrations made by the callbacks themselves are
//!   queued and invoked after the current batch, never as part of it.
//! * Canceled - all callbacks have been invoked. New registrations invoke their callback
//!   immediately, so a subscriber never misses a cancelation that happened just before it
//!   subscribed.
//!
//! Each callback is invoked at most once. Whoever removes a callback from the source (the firing
//! pass or an unregistration) owns it, which makes unregistration safe under concurrent firing.
//!
//! A panicking callback does not stop the others. The source still reaches the Canceled state
//! and the first panic is resumed on the thread that requested cancelation.

use std::collections::BTreeMap;
use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::Mutex;
use tracing::debug;

use crate::AnyValue;

const SOURCE_OPEN: u8 = 0;
const SOURCE_CANCELING: u8 = 1;
const SOURCE_CANCELED: u8 = 2;

/// The state of a cancelation source.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum CancelationState {
    /// Cancelation has not been requested.
    Open,

    /// Cancelation has been requested and callbacks are being invoked.
    Canceling,

    /// Cancelation has been requested and all callbacks have been invoked.
    Canceled,
}

/// The reason a promise was canceled, stored as the payload of canceled containers.
#[derive(Clone, Default)]
pub struct CancelReason {
    reason: Option<AnyValue>,
}

impl CancelReason {
    /// Creates a cancel reason, optionally carrying a value explaining the cancelation.
    #[must_use]
    pub fn new(reason: Option<AnyValue>) -> Self {
        Self { reason }
    }

    /// The value explaining the cancelation, if any.
    #[must_use]
    pub fn reason(&self) -> Option<&AnyValue> {
        self.reason.as_ref()
    }

    /// Borrows the value explaining the cancelation as a `T`, if it is one.
    #[must_use]
    pub fn downcast_ref<T: 'static>(&self) -> Option<&T> {
        self.reason.as_ref()?.downcast_ref::<T>()
    }
}

impl fmt::Debug for CancelReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelReason")
            .field("has_reason", &self.reason.is_some())
            .finish()
    }
}

type Callback = Box<dyn FnOnce(&CancelReason) + Send>;

/// Pending callbacks, keyed by their registration position.
///
/// Positions are handed out in increasing order and never reused, so iterating the map yields
/// callbacks in registration order. Unregistering removes the entry outright.
struct Callbacks {
    entries: BTreeMap<u64, Callback>,
    next_position: u64,
    reason: CancelReason,
}

impl Callbacks {
    fn push(&mut self, callback: Callback) -> u64 {
        let position = self.next_position;

        self.next_position = position
            .checked_add(1)
            .expect("registration positions cannot realistically overflow u64");
        self.entries.insert(position, callback);

        position
    }

    fn take(&mut self, position: u64) -> Option<Callback> {
        self.entries.remove(&position)
    }

    /// Removes all entries, returning them in registration order.
    fn flush(&mut self) -> BTreeMap<u64, Callback> {
        mem::take(&mut self.entries)
    }
}

struct SourceCore {
    /// Only written while holding the `callbacks` lock; may be read without it.
    state: AtomicU8,

    callbacks: Mutex<Callbacks>,

    /// Registrations of a linked source against its parents, released when it is dropped.
    links: Mutex<Vec<CancelationRegistration>>,
}

impl SourceCore {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(SOURCE_OPEN),
            callbacks: Mutex::new(Callbacks {
                entries: BTreeMap::new(),
                next_position: 0,
                reason: CancelReason::default(),
            }),
            links: Mutex::new(Vec::new()),
        }
    }

    fn state(&self) -> CancelationState {
        match self.state.load(Ordering::Acquire) {
            SOURCE_OPEN => CancelationState::Open,
            SOURCE_CANCELING => CancelationState::Canceling,
            _ => CancelationState::Canceled,
        }
    }

    fn register(self: &Arc<Self>, callback: Callback) -> CancelationRegistration {
        let mut callbacks = self.callbacks.lock();

        if self.state.load(Ordering::Relaxed) == SOURCE_CANCELED {
            let reason = callbacks.reason.clone();
            drop(callbacks);

            // Fire-on-subscribe: the cancelation already happened.
            callback(&reason);
            return CancelationRegistration::inert();
        }

        let position = callbacks.push(callback);

        CancelationRegistration {
            source: Arc::downgrade(self),
            position,
        }
    }

    fn try_unregister(&self, position: u64) -> bool {
        let callback = self.callbacks.lock().take(position);

        // The callback may own arbitrary resources, so it is dropped without holding the lock.
        callback.is_some()
    }

    #[cfg_attr(test, mutants::skip)] // Critical - mutation causes hangs or lost callbacks.
    fn cancel(&self, reason: CancelReason) -> bool {
        {
            let mut callbacks = self.callbacks.lock();

            if self.state.load(Ordering::Relaxed) != SOURCE_OPEN {
                return false;
            }

            callbacks.reason = reason;
            self.state.store(SOURCE_CANCELING, Ordering::Release);
        }

        let mut invoked: usize = 0;
        let mut first_panic = None;

        loop {
            let (batch, reason) = {
                let mut callbacks = self.callbacks.lock();
                let batch = callbacks.flush();

                if batch.is_empty() {
                    // From now on, registrations fire immediately instead of being queued.
                    self.state.store(SOURCE_CANCELED, Ordering::Release);
                    break;
                }

                (batch, callbacks.reason.clone())
            };

            // Callbacks registered by these callbacks go into the next batch.
            for callback in batch.into_values() {
                let outcome = panic::catch_unwind(AssertUnwindSafe(|| callback(&reason)));

                if let Err(payload) = outcome {
                    // Only the first panic is resumed; later ones are dropped.
                    if first_panic.is_none() {
                        first_panic = Some(payload);
                    }
                }

                invoked = invoked.wrapping_add(1);
            }
        }

        debug!(callbacks = invoked, "cancelation source fired");

        if let Some(payload) = first_panic {
            panic::resume_unwind(payload);
        }

        true
    }
}

impl Drop for SourceCore {
    fn drop(&mut self) {
        for mut link in self.links.get_mut().drain(..) {
            link.try_unregister();
        }
    }
}

/// A broadcastable cancelation trigger.
///
/// Dropping the source does not cancel it. Tokens obtained from a dropped source simply never
/// fire (unless the source is linked to a parent that does).
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use std::sync::atomic::{AtomicBool, Ordering};
///
/// use settlement::CancelationSource;
///
/// let source = CancelationSource::new();
/// let fired = Arc::new(AtomicBool::new(false));
///
/// let fired_clone = Arc::clone(&fired);
/// let _registration = source.token().register(move |_| {
///     fired_clone.store(true, Ordering::Relaxed);
/// });
///
/// source.cancel();
/// assert!(fired.load(Ordering::Relaxed));
/// ```
pub struct CancelationSource {
    core: Arc<SourceCore>,
}

impl CancelationSource {
    /// Creates a new open cancelation source.
    #[must_use]
    pub fn new() -> Self {
        Self {
            core: Arc::new(SourceCore::new()),
        }
    }

    /// Creates a new source that is canceled when any of the `parents` is canceled,
    /// with the same reason. It can also be canceled directly.
    ///
    /// If a parent is already canceled, the new source is canceled before it is returned.
    #[must_use]
    pub fn linked(parents: &[CancelationToken]) -> Self {
        let source = Self::new();

        for parent in parents {
            let child = Arc::downgrade(&source.core);

            let registration = parent.register(move |reason| {
                if let Some(child) = child.upgrade() {
                    child.cancel(reason.clone());
                }
            });

            if registration.is_registered() {
                source.core.links.lock().push(registration);
            }
        }

        source
    }

    /// A token for subscribing to this source.
    #[must_use]
    pub fn token(&self) -> CancelationToken {
        CancelationToken {
            core: Some(Arc::clone(&self.core)),
        }
    }

    /// Cancels the source without a reason, invoking all registered callbacks.
    ///
    /// Returns `false` if cancelation had already been requested.
    pub fn cancel(&self) -> bool {
        self.core.cancel(CancelReason::default())
    }

    /// Cancels the source with a reason that is passed to every callback.
    ///
    /// Returns `false` if cancelation had already been requested, in which case
    /// `reason` is dropped.
    pub fn cancel_with(&self, reason: AnyValue) -> bool {
        self.core.cancel(CancelReason::new(Some(reason)))
    }

    /// The current state of the source.
    #[must_use]
    pub fn state(&self) -> CancelationState {
        self.core.state()
    }

    /// Whether cancelation has been requested.
    #[must_use]
    pub fn is_cancelation_requested(&self) -> bool {
        self.state() != CancelationState::Open
    }
}

impl Default for CancelationSource {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for CancelationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelationSource")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

/// The subscribe-only side of a [`CancelationSource`].
#[derive(Clone, Default)]
pub struct CancelationToken {
    core: Option<Arc<SourceCore>>,
}

impl CancelationToken {
    /// A token that is never canceled.
    #[must_use]
    pub fn none() -> Self {
        Self { core: None }
    }

    /// Whether this token is connected to a source and can therefore ever be canceled.
    #[must_use]
    pub fn can_be_canceled(&self) -> bool {
        self.core.is_some()
    }

    /// Whether cancelation has been requested from the source.
    #[must_use]
    pub fn is_cancelation_requested(&self) -> bool {
        self.core
            .as_ref()
            .is_some_and(|core| core.state() != CancelationState::Open)
    }

    /// Registers `callback` to be invoked once when the source is canceled.
    ///
    /// If the source has already been canceled, `callback` is invoked immediately, before this
    /// method returns, and the returned registration is inert. If this token can never be
    /// canceled, `callback` is dropped and the returned registration is inert.
    pub fn register<F>(&self, callback: F) -> CancelationRegistration
    where
        F: FnOnce(&CancelReason) + Send + 'static,
    {
        match &self.core {
            Some(core) => core.register(Box::new(callback)),
            None => CancelationRegistration::inert(),
        }
    }
}

impl fmt::Debug for CancelationToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelationToken")
            .field("state", &self.core.as_ref().map(|core| core.state()))
            .finish()
    }
}

/// A subscription of one callback to a cancelation source.
///
/// The registration only refers to the source weakly and never keeps it alive. Dropping the
/// registration does not unregister the callback.
#[derive(Debug)]
pub struct CancelationRegistration {
    source: Weak<SourceCore>,
    position: u64,
}

impl CancelationRegistration {
    fn inert() -> Self {
        Self {
            source: Weak::new(),
            position: 0,
        }
    }

    /// Whether this registration may still have a pending callback.
    ///
    /// Returns `false` after unregistering and for registrations whose callback was invoked
    /// during registration. Returns `true` if the callback is pending or is being invoked or
    /// was invoked by a firing source, since the registration cannot tell those apart without
    /// asking the source; use [`try_unregister`][Self::try_unregister] for a definite answer.
    #[must_use]
    pub fn is_registered(&self) -> bool {
        self.source.strong_count() > 0
    }

    /// Removes the callback from the source if it has not been invoked yet.
    ///
    /// Returns whether a pending callback was removed. The callback is never invoked by this
    /// method. If the source is firing concurrently, the callback is invoked at most once
    /// regardless of which side gets to it first.
    ///
    /// After this call the registration is inert, so calling it again returns `false`.
    pub fn try_unregister(&mut self) -> bool {
        let source = mem::take(&mut self.source);

        source
            .upgrade()
            .is_some_and(|core| core.try_unregister(self.position))
    }

    /// Unregisters the callback if it is still pending, releasing whatever it holds.
    pub fn dispose(mut self) {
        self.try_unregister();
    }
}

impl fmt::Debug for SourceCore {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SourceCore")
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}
