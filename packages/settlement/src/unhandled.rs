use std::fmt;
use std::mem;
use std::sync::Arc;

use parking_lot::Mutex;
use tracing::debug;

use crate::conversion::convert;
use crate::{CallSite, ConversionPolicy, ErasedPayload, Payload, PromiseId, SettlementKind};

/// Why a settlement value ended up in the unhandled outcome registry.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
#[non_exhaustive]
pub enum OutcomeKind {
    /// A rejection reached the end of its life without any handler observing it.
    Rejected,

    /// A cancelation reached the end of its life without any handler observing it.
    Canceled,

    /// A deferred controller was discarded while its promise was still pending.
    Abandoned,

    /// A settlement was attempted on a promise that was no longer pending, so the payload
    /// had nowhere to go. Carries the kind of settlement that was attempted.
    Orphaned(SettlementKind),
}

/// A settlement value that was never observed by any handler.
pub struct UnhandledOutcome {
    kind: OutcomeKind,
    payload: Option<ErasedPayload>,
    origin: Option<PromiseId>,
    conversion: Arc<dyn ConversionPolicy>,
    call_site: CallSite,
}

impl UnhandledOutcome {
    pub(crate) fn new(
        kind: OutcomeKind,
        payload: Option<ErasedPayload>,
        origin: Option<PromiseId>,
        conversion: Arc<dyn ConversionPolicy>,
    ) -> Self {
        Self {
            kind,
            payload,
            origin,
            conversion,
            call_site: CallSite::empty(),
        }
    }

    pub(crate) fn with_call_site(mut self, call_site: CallSite) -> Self {
        self.call_site = call_site;
        self
    }

    /// Why this outcome was recorded.
    #[must_use]
    pub fn kind(&self) -> OutcomeKind {
        self.kind
    }

    /// The promise the outcome belongs to, if it belonged to one.
    #[must_use]
    pub fn origin(&self) -> Option<PromiseId> {
        self.origin
    }

    /// Whether the outcome carries a payload. Abandoned controllers never do.
    #[must_use]
    pub fn has_payload(&self) -> bool {
        self.payload.is_some()
    }

    /// The name of the static type of the payload, if there is one.
    #[must_use]
    pub fn payload_type_name(&self) -> Option<&'static str> {
        self.payload
            .as_ref()
            .map(|payload| payload.as_payload_ref().type_name())
    }

    /// Reads the payload as a `T`, using the conversion policy that was active when the outcome
    /// was recorded.
    ///
    /// Returns `None` if there is no payload or it is not compatible with `T`.
    #[must_use]
    pub fn try_get_as<T: Payload>(&self) -> Option<T> {
        let payload = self.payload.as_ref()?;
        convert(payload.as_payload_ref(), &*self.conversion)
    }

    /// Where the outcome was produced, if this was captured.
    ///
    /// For abandoned controllers this is where the controller was created.
    #[must_use]
    pub fn call_site(&self) -> &CallSite {
        &self.call_site
    }
}

impl fmt::Debug for UnhandledOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("UnhandledOutcome")
            .field("kind", &self.kind)
            .field("payload", &self.payload)
            .field("origin", &self.origin)
            .field("call_site", &self.call_site)
            .finish_non_exhaustive()
    }
}

pub(crate) type Observer = Box<dyn Fn(&UnhandledOutcome) + Send + Sync>;

/// Collects settlement values that were never observed by any handler, for diagnostic
/// reporting.
///
/// Reports are appended from any thread. A diagnostic consumer drains all collected entries
/// at once; entries reported while a drain is in progress land in the next drain.
#[derive(derive_more::Debug)]
pub(crate) struct UnhandledRegistry {
    entries: Mutex<Vec<UnhandledOutcome>>,

    #[debug(ignore)]
    observer: Option<Observer>,
}

impl UnhandledRegistry {
    pub(crate) fn new(observer: Option<Observer>) -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
            observer,
        }
    }

    pub(crate) fn report(&self, outcome: UnhandledOutcome) {
        debug!(
            kind = ?outcome.kind,
            origin = ?outcome.origin,
            payload_type = outcome.payload_type_name(),
            "unhandled settlement outcome recorded"
        );

        // The observer is user code, so we call it without holding our lock.
        if let Some(observer) = &self.observer {
            observer(&outcome);
        }

        self.entries.lock().push(outcome);
    }

    pub(crate) fn drain(&self) -> Vec<UnhandledOutcome> {
        mem::take(&mut *self.entries.lock())
    }

    pub(crate) fn len(&self) -> usize {
        self.entries.lock().len()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::thread;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{DefaultConversion, PayloadOps};

    assert_impl_all!(UnhandledOutcome: Send, Sync);
    assert_impl_all!(UnhandledRegistry: Send, Sync);

    fn rejected(reason: &str) -> UnhandledOutcome {
        UnhandledOutcome::new(
            OutcomeKind::Rejected,
            Some(ErasedPayload::new(reason.to_string(), PayloadOps::of::<String>())),
            None,
            Arc::new(DefaultConversion),
        )
    }

    #[test]
    fn drain_returns_everything_once() {
        let registry = UnhandledRegistry::new(None);
        registry.report(rejected("a"));
        registry.report(rejected("b"));
        assert_eq!(registry.len(), 2);

        let drained = registry.drain();
        assert_eq!(drained.len(), 2);
        assert_eq!(drained[0].try_get_as::<String>().as_deref(), Some("a"));
        assert_eq!(drained[1].try_get_as::<String>().as_deref(), Some("b"));

        assert!(registry.drain().is_empty());
    }

    #[test]
    fn observer_sees_every_report() {
        let seen = Arc::new(AtomicUsize::new(0));
        let seen_clone = Arc::clone(&seen);

        let registry = UnhandledRegistry::new(Some(Box::new(move |outcome| {
            assert_eq!(outcome.kind(), OutcomeKind::Rejected);
            seen_clone.fetch_add(1, Ordering::Relaxed);
        })));

        registry.report(rejected("a"));
        registry.report(rejected("b"));

        assert_eq!(seen.load(Ordering::Relaxed), 2);
        assert_eq!(registry.drain().len(), 2);
    }

    #[test]
    fn outcome_without_payload() {
        let outcome = UnhandledOutcome::new(
            OutcomeKind::Abandoned,
            None,
            None,
            Arc::new(DefaultConversion),
        );

        assert!(!outcome.has_payload());
        assert!(outcome.payload_type_name().is_none());
        assert!(outcome.try_get_as::<String>().is_none());
    }

    #[test]
    fn concurrent_reports_are_not_lost() {
        testing::with_watchdog(|| {
            const THREADS: usize = 4;
            const PER_THREAD: usize = 250;

            let registry = UnhandledRegistry::new(None);
            let mut total = 0;

            thread::scope(|s| {
                for _ in 0..THREADS {
                    s.spawn(|| {
                        for _ in 0..PER_THREAD {
                            registry.report(rejected("x"));
                        }
                    });
                }

                // Drain while reports are still arriving.
                for _ in 0..10 {
                    total += registry.drain().len();
                }
            });

            total += registry.drain().len();
            assert_eq!(total, THREADS * PER_THREAD);
        });
    }
}
