use std::any::{Any, TypeId, type_name};
use std::error::Error;
use std::fmt;
use std::sync::Arc;

/// A value that can be carried by a settlement.
///
/// Settlement values may be observed by several continuations at once, potentially on different
/// threads, so they must be shareable and cloneable. This trait is implemented automatically
/// for every type that meets the requirements.
pub trait Payload: Clone + Send + Sync + 'static {}

impl<T> Payload for T where T: Clone + Send + Sync + 'static {}

/// The widest settlement value type. Every payload can be viewed as an `AnyValue`.
///
/// A container typed as `AnyValue` may still hold a narrower live value, which handlers can
/// request by its concrete type.
pub type AnyValue = Arc<dyn Any + Send + Sync>;

/// The base error interface. Payloads stored via the error-aware constructors can be viewed
/// as an `AnyError`.
///
/// Like [`AnyValue`], a container typed as `AnyError` can be narrowed to the concrete error
/// type it holds.
pub type AnyError = Arc<dyn SharedError>;

/// An error that can be shared between threads and inspected by its concrete type.
///
/// This trait is implemented automatically for every `Send + Sync + 'static` error type.
pub trait SharedError: Error + Send + Sync + 'static {
    /// The error as `Any`, for narrowing to its concrete type.
    fn as_dyn_any(&self) -> &(dyn Any + Send + Sync);
}

impl<E> SharedError for E
where
    E: Error + Send + Sync + 'static,
{
    fn as_dyn_any(&self) -> &(dyn Any + Send + Sync) {
        self
    }
}

/// Type-erased operations captured at the moment a payload of a known static type enters a
/// container, so conversions can later be performed without knowing that type.
#[derive(Clone, Copy, Debug)]
pub(crate) struct PayloadOps {
    type_id: TypeId,
    type_name: &'static str,
    to_any_value: fn(&dyn Any) -> Option<AnyValue>,
    to_error: Option<fn(&dyn Any) -> Option<AnyError>>,
}

impl PayloadOps {
    pub(crate) fn of<V: Payload>() -> Self {
        Self {
            type_id: TypeId::of::<V>(),
            type_name: type_name::<V>(),
            to_any_value: to_any_value::<V>,
            to_error: None,
        }
    }

    pub(crate) fn of_error<E: Payload + Error>() -> Self {
        Self {
            to_error: Some(to_error::<E>),
            ..Self::of::<E>()
        }
    }

    pub(crate) fn type_id(&self) -> TypeId {
        self.type_id
    }

    pub(crate) fn type_name(&self) -> &'static str {
        self.type_name
    }
}

fn to_any_value<V: Payload>(value: &dyn Any) -> Option<AnyValue> {
    // An `AnyValue` is already as wide as it gets, so we hand out the same allocation
    // instead of nesting it inside another one.
    if let Some(any) = value.downcast_ref::<AnyValue>() {
        return Some(Arc::clone(any));
    }

    value
        .downcast_ref::<V>()
        .map(|v| -> AnyValue { Arc::new(v.clone()) })
}

fn to_error<E: Payload + Error>(value: &dyn Any) -> Option<AnyError> {
    value
        .downcast_ref::<E>()
        .map(|e| -> AnyError { Arc::new(e.clone()) })
}

/// A borrowed, type-erased view of a settlement payload.
///
/// This is what a [`ConversionPolicy`][crate::ConversionPolicy] inspects when deciding whether
/// a payload satisfies the type requested by a handler.
#[derive(Clone, Copy)]
pub struct PayloadRef<'a> {
    value: &'a (dyn Any + Send + Sync),
    ops: &'a PayloadOps,
}

impl<'a> PayloadRef<'a> {
    pub(crate) fn new(value: &'a (dyn Any + Send + Sync), ops: &'a PayloadOps) -> Self {
        Self { value, ops }
    }

    /// The [`TypeId`] of the static payload type.
    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.ops.type_id
    }

    /// The name of the static payload type, for diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.ops.type_name
    }

    /// The payload as its static type, erased.
    #[must_use]
    pub fn as_any(&self) -> &'a (dyn Any + Send + Sync) {
        self.value
    }

    /// The live value of the payload.
    ///
    /// For most payloads this is the same as [`as_any`][Self::as_any]. If the static type is
    /// [`AnyValue`] or [`AnyError`], this looks through the `Arc` to whatever it actually holds.
    #[must_use]
    pub fn live_value(&self) -> &'a (dyn Any + Send + Sync) {
        if let Some(any) = self.value.downcast_ref::<AnyValue>() {
            return &**any;
        }

        // The `Arc` is itself an error, so the deref is needed to reach the inner value.
        if let Some(error) = self.value.downcast_ref::<AnyError>() {
            return (**error).as_dyn_any();
        }

        self.value
    }

    /// Attempts to borrow the payload as a `T`, looking through [`AnyValue`] and [`AnyError`]
    /// if necessary.
    #[must_use]
    pub fn downcast_ref<T: Any>(&self) -> Option<&'a T> {
        self.value
            .downcast_ref::<T>()
            .or_else(|| self.live_value().downcast_ref::<T>())
    }

    /// Widens the payload to [`AnyValue`]. This is always possible.
    #[must_use]
    pub fn to_any_value(&self) -> Option<AnyValue> {
        (self.ops.to_any_value)(self.value)
    }

    /// Widens the payload to [`AnyError`], if the payload was stored as an error.
    #[must_use]
    pub fn to_error(&self) -> Option<AnyError> {
        if let Some(error) = self.value.downcast_ref::<AnyError>() {
            return Some(Arc::clone(error));
        }

        self.ops.to_error.and_then(|f| f(self.value))
    }
}

impl fmt::Debug for PayloadRef<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PayloadRef")
            .field("type_name", &self.ops.type_name)
            .finish_non_exhaustive()
    }
}

/// An owned, type-erased payload that has been detached from its container.
///
/// Unhandled outcomes carry one of these so diagnostic code can still inspect the payload
/// by type after the container itself has been recycled.
pub(crate) struct ErasedPayload {
    value: Box<dyn Any + Send + Sync>,
    ops: PayloadOps,
}

impl ErasedPayload {
    pub(crate) fn new<V: Payload>(value: V, ops: PayloadOps) -> Self {
        Self {
            value: Box::new(value),
            ops,
        }
    }

    pub(crate) fn as_payload_ref(&self) -> PayloadRef<'_> {
        PayloadRef::new(&*self.value, &self.ops)
    }
}

impl fmt::Debug for ErasedPayload {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ErasedPayload")
            .field("type_name", &self.ops.type_name)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use static_assertions::assert_impl_all;

    use super::*;

    assert_impl_all!(PayloadRef<'static>: Send, Sync);
    assert_impl_all!(ErasedPayload: Send, Sync);

    #[derive(Clone, Debug, thiserror::Error)]
    #[error("disk on fire")]
    struct DiskOnFire;

    #[test]
    fn ops_record_static_type() {
        let ops = PayloadOps::of::<u32>();
        assert_eq!(ops.type_id(), TypeId::of::<u32>());
        assert_eq!(ops.type_name(), "u32");
    }

    #[test]
    fn any_value_is_not_nested() {
        let inner: AnyValue = Arc::new(5_u8);
        let ops = PayloadOps::of::<AnyValue>();
        let payload = ErasedPayload::new(Arc::clone(&inner), ops);

        let widened = payload.as_payload_ref().to_any_value().unwrap();
        assert!(Arc::ptr_eq(&widened, &inner));
    }

    #[test]
    fn live_value_looks_through_any_value() {
        let inner: AnyValue = Arc::new("hello".to_string());
        let payload = ErasedPayload::new(inner, PayloadOps::of::<AnyValue>());
        let payload_ref = payload.as_payload_ref();

        assert!(payload_ref.as_any().downcast_ref::<String>().is_none());
        assert_eq!(payload_ref.downcast_ref::<String>().unwrap(), "hello");
    }

    #[test]
    fn error_widening_requires_error_ops() {
        let plain = ErasedPayload::new(DiskOnFire, PayloadOps::of::<DiskOnFire>());
        assert!(plain.as_payload_ref().to_error().is_none());

        let aware = ErasedPayload::new(DiskOnFire, PayloadOps::of_error::<DiskOnFire>());
        let error = aware.as_payload_ref().to_error().unwrap();
        assert_eq!(error.to_string(), "disk on fire");
    }

    #[test]
    fn any_error_payload_widens_to_itself() {
        let error: AnyError = Arc::new(io::Error::other("nope"));
        let payload = ErasedPayload::new(Arc::clone(&error), PayloadOps::of::<AnyError>());

        let widened = payload.as_payload_ref().to_error().unwrap();
        assert!(Arc::ptr_eq(&widened, &error));
    }

    #[test]
    fn live_value_looks_through_any_error() {
        let error: AnyError = Arc::new(DiskOnFire);
        let payload = ErasedPayload::new(error, PayloadOps::of::<AnyError>());
        let payload_ref = payload.as_payload_ref();

        assert!(payload_ref.as_any().downcast_ref::<DiskOnFire>().is_none());
        assert!(payload_ref.live_value().is::<DiskOnFire>());
        assert!(payload_ref.downcast_ref::<DiskOnFire>().is_some());
    }
}
