use std::error::Error;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};

use parking_lot::RwLock;
use tracing::warn;

use crate::{
    Acquire, CallSite, Container, ContainerOrigin, ContainerPool, ConversionPolicy,
    DefaultConversion, DeferredController, DeferredTracker, Observer, OutcomeKind, Payload,
    PayloadOps, PoolStats, PoolingPolicy, PromiseId, SettlementKind, UnhandledOutcome,
    UnhandledRegistry, UsageError,
};

static GLOBAL: OnceLock<Context> = OnceLock::new();

/// State shared by everything created from one [`Context`].
#[derive(derive_more::Debug)]
pub(crate) struct Shared {
    pub(crate) pool: ContainerPool,
    pub(crate) unhandled: UnhandledRegistry,
    pub(crate) tracker: DeferredTracker,

    conversion: RwLock<Arc<dyn ConversionPolicy>>,
    capture_traces: bool,
    strict_settlement: bool,

    #[debug(ignore)]
    next_promise_id: AtomicU64,
}

impl Shared {
    pub(crate) fn conversion(&self) -> Arc<dyn ConversionPolicy> {
        Arc::clone(&self.conversion.read())
    }

    pub(crate) fn call_site(&self) -> CallSite {
        CallSite::capture_if(self.capture_traces)
    }

    pub(crate) fn strict_settlement(&self) -> bool {
        self.strict_settlement
    }

    pub(crate) fn next_promise_id(&self) -> PromiseId {
        PromiseId::new(self.next_promise_id.fetch_add(1, Ordering::Relaxed))
    }
}

/// The configuration and process-wide state that settlements operate in: the container pool,
/// the active conversion policy, the unhandled outcome registry and the set of unsettled
/// deferred controllers.
///
/// Independent contexts do not share any state, which lets tests run with their own
/// configuration. Embedding code that wants a single process-wide context installs one at
/// startup with [`install_global`][Self::install_global] and reads it with
/// [`global`][Self::global].
///
/// Cloning a context is cheap and yields a handle to the same state.
///
/// # Examples
///
/// ```
/// use settlement::{Context, OutcomeKind};
///
/// let context = Context::new();
///
/// let deferred = context.deferred::<u32>();
/// deferred.reject("out of coffee".to_string()).unwrap();
///
/// // Nobody looked at the rejection before the promise went away.
/// drop(deferred);
///
/// let unhandled = context.drain_unhandled();
/// assert_eq!(unhandled.len(), 1);
/// assert_eq!(unhandled[0].kind(), OutcomeKind::Rejected);
/// assert_eq!(
///     unhandled[0].try_get_as::<String>().as_deref(),
///     Some("out of coffee")
/// );
/// ```
#[derive(Clone)]
pub struct Context {
    pub(crate) shared: Arc<Shared>,
}

impl Context {
    /// Creates a context with the default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::builder().build()
    }

    /// Starts building a context with a custom configuration.
    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    /// Makes `self` the process-wide context returned by [`global`][Self::global].
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::ContextAlreadyInstalled`] if a global context has already been
    /// installed, or if [`global`][Self::global] has already been called (which installs a
    /// default context).
    ///
    /// # Examples
    ///
    /// ```
    /// use settlement::{Context, PoolingPolicy};
    ///
    /// Context::builder()
    ///     .pooling(PoolingPolicy::InternalOnly)
    ///     .build()
    ///     .install_global()
    ///     .unwrap();
    ///
    /// assert_eq!(Context::global().pooling(), PoolingPolicy::InternalOnly);
    /// ```
    pub fn install_global(self) -> Result<(), UsageError> {
        if GLOBAL.set(self).is_err() {
            return Err(UsageError::ContextAlreadyInstalled);
        }

        Ok(())
    }

    /// The process-wide context.
    ///
    /// If none has been installed, a context with the default configuration is installed on
    /// first use.
    #[must_use]
    pub fn global() -> &'static Self {
        GLOBAL.get_or_init(Self::new)
    }

    /// Creates a new pending promise, returning the controller that settles it.
    ///
    /// Use [`DeferredController::promise`] to obtain the read side.
    #[must_use]
    pub fn deferred<T: Payload>(&self) -> DeferredController<T> {
        DeferredController::new(&self.shared)
    }

    /// Acquires a container holding `payload`, from the pool if the pooling policy allows.
    ///
    /// The container starts with a reference count of one.
    #[must_use]
    pub fn acquire<V: Payload>(&self, kind: SettlementKind, payload: V) -> Container<V> {
        self.acquire_with(kind, ContainerOrigin::User, PayloadOps::of::<V>(), payload)
    }

    /// Acquires a container holding an error, whose payload can also be read as an
    /// [`AnyError`][crate::AnyError].
    #[must_use]
    pub fn acquire_error<E: Payload + Error>(
        &self,
        kind: SettlementKind,
        error: E,
    ) -> Container<E> {
        self.acquire_with(kind, ContainerOrigin::User, PayloadOps::of_error::<E>(), error)
    }

    #[cfg(test)]
    pub(crate) fn acquire_internal<V: Payload>(
        &self,
        kind: SettlementKind,
        payload: V,
    ) -> Container<V> {
        self.acquire_with(kind, ContainerOrigin::Internal, PayloadOps::of::<V>(), payload)
    }

    fn acquire_with<V: Payload>(
        &self,
        kind: SettlementKind,
        origin: ContainerOrigin,
        ops: PayloadOps,
        payload: V,
    ) -> Container<V> {
        Container::acquire(
            &self.shared,
            Acquire {
                kind,
                origin,
                ops,
                promise_id: None,
            },
            payload,
        )
    }

    /// The pooling policy the context was built with.
    #[must_use]
    pub fn pooling(&self) -> PoolingPolicy {
        self.shared.pool.policy()
    }

    /// A snapshot of container pool activity.
    #[must_use]
    pub fn pool_stats(&self) -> PoolStats {
        self.shared.pool.stats()
    }

    /// The active conversion policy.
    #[must_use]
    pub fn conversion(&self) -> Arc<dyn ConversionPolicy> {
        self.shared.conversion()
    }

    /// Replaces the active conversion policy.
    ///
    /// Conversions that are already in progress finish with the previous policy. Unhandled
    /// outcomes that were already recorded keep the policy that was active when they were
    /// recorded.
    pub fn set_conversion(&self, policy: impl ConversionPolicy) {
        *self.shared.conversion.write() = Arc::new(policy);
    }

    /// Removes and returns all unhandled outcomes recorded so far, oldest first.
    ///
    /// Outcomes recorded concurrently with the drain are either returned by this call or
    /// kept for the next one.
    #[must_use]
    pub fn drain_unhandled(&self) -> Vec<UnhandledOutcome> {
        self.shared.unhandled.drain()
    }

    /// The number of unhandled outcomes waiting to be drained.
    #[must_use]
    pub fn unhandled_len(&self) -> usize {
        self.shared.unhandled.len()
    }

    /// The number of deferred controllers that are alive and have not settled their promise.
    #[must_use]
    pub fn unsettled_len(&self) -> usize {
        self.shared.tracker.len()
    }

    /// Verifies that every deferred controller created from this context has settled its
    /// promise or been dropped. Intended to be called at shutdown or at the end of a test.
    ///
    /// The controllers listed in the error are no longer tracked afterwards.
    ///
    /// # Errors
    ///
    /// Returns [`UsageError::UnsettledAtShutdown`] listing the controllers that are still
    /// pending.
    pub fn check_all_settled(&self) -> Result<(), UsageError> {
        let unsettled: Vec<_> = self
            .shared
            .tracker
            .take_unsettled()
            .into_iter()
            .map(|(_, entry)| entry)
            .collect();

        if unsettled.is_empty() {
            Ok(())
        } else {
            Err(UsageError::UnsettledAtShutdown { unsettled })
        }
    }

    /// Records every pending deferred controller as an abandoned unhandled outcome and stops
    /// tracking it. Returns the number of controllers recorded.
    ///
    /// A controller recorded here is not recorded again when it is dropped.
    pub fn sweep_unsettled(&self) -> usize {
        let mut swept: usize = 0;

        for (promise, entry) in self.shared.tracker.take_unsettled() {
            if !promise.mark_abandon_reported() {
                continue;
            }

            warn!(
                promise_id = %entry.promise_id(),
                payload_type = entry.payload_type(),
                "deferred controller still pending at sweep"
            );

            self.shared.unhandled.report(
                UnhandledOutcome::new(
                    OutcomeKind::Abandoned,
                    None,
                    Some(entry.promise_id()),
                    self.shared.conversion(),
                )
                .with_call_site(entry.into_call_site()),
            );

            swept = swept.wrapping_add(1);
        }

        swept
    }
}

impl Default for Context {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Context")
            .field("pooling", &self.pooling())
            .field("conversion", &self.conversion())
            .field("pool_stats", &self.pool_stats())
            .field("unhandled_len", &self.unhandled_len())
            .field("unsettled_len", &self.unsettled_len())
            .finish()
    }
}

/// Builder for creating an instance of [`Context`].
///
/// # Examples
///
/// ```
/// use settlement::{Context, PoolingPolicy};
///
/// // Default context.
/// let context = Context::builder().build();
///
/// // Without container pooling, so every acquisition allocates.
/// let context = Context::builder().pooling(PoolingPolicy::None).build();
/// ```
#[derive(derive_more::Debug)]
#[must_use]
pub struct ContextBuilder {
    pooling: PoolingPolicy,
    conversion: Arc<dyn ConversionPolicy>,
    capture_traces: bool,
    strict_settlement: bool,

    #[debug(ignore)]
    on_unhandled: Option<Observer>,
}

impl ContextBuilder {
    fn new() -> Self {
        Self {
            pooling: PoolingPolicy::default(),
            conversion: Arc::new(DefaultConversion),
            capture_traces: cfg!(debug_assertions),
            strict_settlement: cfg!(debug_assertions),
            on_unhandled: None,
        }
    }

    /// Sets the [pooling policy][PoolingPolicy] for value containers.
    pub fn pooling(mut self, policy: PoolingPolicy) -> Self {
        self.pooling = policy;
        self
    }

    /// Sets the initial [conversion policy][ConversionPolicy].
    pub fn conversion(mut self, policy: impl ConversionPolicy) -> Self {
        self.conversion = Arc::new(policy);
        self
    }

    /// Sets whether call sites are captured when deferred controllers are created and when
    /// unhandled outcomes are recorded.
    ///
    /// Capturing only ever happens in debug builds and only if backtraces are enabled via
    /// `RUST_BACKTRACE`. Enabled by default in debug builds.
    pub fn capture_traces(mut self, enabled: bool) -> Self {
        self.capture_traces = enabled;
        self
    }

    /// Sets whether settling a promise that is no longer pending is a usage error.
    ///
    /// The payload is recorded as an orphaned unhandled outcome either way. When strict,
    /// [`DeferredController::resolve`][crate::DeferredController::resolve] and its siblings
    /// also return [`UsageError::NotPending`]; otherwise they only log a warning and return
    /// `Ok`. Enabled by default in debug builds.
    pub fn strict_settlement(mut self, enabled: bool) -> Self {
        self.strict_settlement = enabled;
        self
    }

    /// Sets an observer that is called with every unhandled outcome as it is recorded, before
    /// it is queued for [`Context::drain_unhandled`].
    ///
    /// The observer is called on whichever thread records the outcome, often from within
    /// `drop`. It must not panic.
    pub fn on_unhandled<F>(mut self, observer: F) -> Self
    where
        F: Fn(&UnhandledOutcome) + Send + Sync + 'static,
    {
        self.on_unhandled = Some(Box::new(observer));
        self
    }

    /// Builds the context with the specified configuration.
    #[must_use]
    pub fn build(self) -> Context {
        Context {
            shared: Arc::new(Shared {
                pool: ContainerPool::new(self.pooling),
                unhandled: UnhandledRegistry::new(self.on_unhandled),
                tracker: DeferredTracker::default(),
                conversion: RwLock::new(self.conversion),
                capture_traces: self.capture_traces,
                strict_settlement: self.strict_settlement,
                next_promise_id: AtomicU64::new(1),
            }),
        }
    }
}
