//! Type-directed conversion of settlement payloads.
//!
//! Conversion is a two-tier dispatch:
//!
//! 1. If the requested type is exactly the static payload type, the payload is accessed
//!    directly. No boxing, no policy call.
//! 2. Otherwise, the active [`ConversionPolicy`] decides. The default policy handles widening
//!    to [`AnyValue`] and [`AnyError`] and narrowing a wide payload (either of the two) to the
//!    type of its live value.

use std::any::{Any, TypeId, type_name};
use std::fmt;

use crate::{AnyError, AnyValue, Payload, PayloadRef};

/// Decides whether a payload satisfies a type requested by a handler and, if it does,
/// produces the value of the requested type.
///
/// Implementations must not panic for incompatible types; returning `false` is how a
/// non-matching handler is skipped.
///
/// The policy is only consulted when the requested type differs from the static payload type.
pub trait ConversionPolicy: Send + Sync + fmt::Debug + 'static {
    /// Attempts to fill `target` with a value derived from `source`.
    ///
    /// Returns `true` if `target` was filled.
    fn convert(&self, source: PayloadRef<'_>, target: &mut ConversionTarget<'_>) -> bool;
}

/// The default conversion policy.
///
/// * Any payload can be widened to [`AnyValue`].
/// * Payloads stored as errors can be widened to [`AnyError`].
/// * A payload whose live value is a `T` can be narrowed to `T`, even if its static type is wider
///   (e.g. an [`AnyValue`] or [`AnyError`] container holding a specific error type).
#[derive(Clone, Copy, Debug, Default)]
pub struct DefaultConversion;

impl ConversionPolicy for DefaultConversion {
    fn convert(&self, source: PayloadRef<'_>, target: &mut ConversionTarget<'_>) -> bool {
        if target.is::<AnyValue>() {
            return source
                .to_any_value()
                .is_some_and(|value| target.accept(value));
        }

        if target.is::<AnyError>() {
            return source.to_error().is_some_and(|error| target.accept(error));
        }

        target.accept_ref(source.live_value())
    }
}

/// The destination of a conversion, standing in for a value of the type requested by a handler.
pub struct ConversionTarget<'a> {
    type_id: TypeId,
    type_name: &'static str,
    sink: &'a mut dyn Sink,
}

impl ConversionTarget<'_> {
    /// The [`TypeId`] of the requested type.
    #[must_use]
    pub fn type_id(&self) -> TypeId {
        self.type_id
    }

    /// The name of the requested type, for diagnostics.
    #[must_use]
    pub fn type_name(&self) -> &'static str {
        self.type_name
    }

    /// Whether the requested type is `T`.
    #[must_use]
    pub fn is<T: Any>(&self) -> bool {
        self.type_id == TypeId::of::<T>()
    }

    /// Fills the target with a clone of `value` if it is of the requested type.
    ///
    /// Returns whether the target was filled.
    pub fn accept_ref(&mut self, value: &dyn Any) -> bool {
        self.sink.accept_ref(value)
    }

    /// Fills the target with `value` if it is of the requested type.
    ///
    /// Returns whether the target was filled.
    pub fn accept<T: Any>(&mut self, value: T) -> bool {
        let mut value = Some(value);
        self.sink.accept_owned(&mut value)
    }
}

impl fmt::Debug for ConversionTarget<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConversionTarget")
            .field("type_name", &self.type_name)
            .finish_non_exhaustive()
    }
}

/// Receives the converted value. Implemented by `Option<T>` for the requested `T`.
trait Sink {
    fn accept_ref(&mut self, value: &dyn Any) -> bool;

    /// `value` is an `Option<U>` for some `U`; it is taken if `U` is the requested type.
    fn accept_owned(&mut self, value: &mut dyn Any) -> bool;
}

impl<T: Payload> Sink for Option<T> {
    fn accept_ref(&mut self, value: &dyn Any) -> bool {
        match value.downcast_ref::<T>() {
            Some(value) => {
                *self = Some(value.clone());
                true
            }
            None => false,
        }
    }

    fn accept_owned(&mut self, value: &mut dyn Any) -> bool {
        match value.downcast_mut::<Option<T>>().and_then(Option::take) {
            Some(value) => {
                *self = Some(value);
                true
            }
            None => false,
        }
    }
}

/// Reads `source` as a `T`, first by exact type and then via `policy`.
pub(crate) fn convert<T: Payload>(
    source: PayloadRef<'_>,
    policy: &dyn ConversionPolicy,
) -> Option<T> {
    if source.type_id() == TypeId::of::<T>() {
        return source.as_any().downcast_ref::<T>().cloned();
    }

    let mut result: Option<T> = None;

    let mut target = ConversionTarget {
        type_id: TypeId::of::<T>(),
        type_name: type_name::<T>(),
        sink: &mut result,
    };

    if policy.convert(source, &mut target) {
        result
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use std::error::Error;
    use std::sync::Arc;

    use static_assertions::assert_impl_all;

    use super::*;
    use crate::{ErasedPayload, PayloadOps};

    assert_impl_all!(DefaultConversion: ConversionPolicy, Send, Sync);

    #[derive(Clone, Debug, PartialEq, thiserror::Error)]
    #[error("connection reset: {0}")]
    struct ConnectionReset(u16);

    /// Formats any error payload as a string, the way a handler for "any message" might want it.
    #[derive(Debug)]
    struct ErrorsAsStrings;

    impl ConversionPolicy for ErrorsAsStrings {
        fn convert(&self, source: PayloadRef<'_>, target: &mut ConversionTarget<'_>) -> bool {
            if target.is::<String>() {
                return source
                    .to_error()
                    .is_some_and(|error| target.accept(error.to_string()));
            }

            DefaultConversion.convert(source, target)
        }
    }

    #[test]
    fn exact_type_skips_policy() {
        #[derive(Debug)]
        struct Refuses;

        impl ConversionPolicy for Refuses {
            fn convert(&self, _: PayloadRef<'_>, _: &mut ConversionTarget<'_>) -> bool {
                panic!("policy must not be consulted for an exact type match");
            }
        }

        let payload = ErasedPayload::new(42_i32, PayloadOps::of::<i32>());
        assert_eq!(convert::<i32>(payload.as_payload_ref(), &Refuses), Some(42));
    }

    #[test]
    fn widen_to_any_value() {
        let payload = ErasedPayload::new(42_i32, PayloadOps::of::<i32>());

        let any = convert::<AnyValue>(payload.as_payload_ref(), &DefaultConversion).unwrap();
        assert_eq!(any.downcast_ref::<i32>(), Some(&42));
    }

    #[test]
    fn widen_to_any_error() {
        let payload = ErasedPayload::new(
            ConnectionReset(7),
            PayloadOps::of_error::<ConnectionReset>(),
        );

        let error = convert::<AnyError>(payload.as_payload_ref(), &DefaultConversion).unwrap();
        assert_eq!(error.to_string(), "connection reset: 7");
        assert!(error.source().is_none());
    }

    #[test]
    fn narrow_wide_payload_by_live_value() {
        let wide: AnyValue = Arc::new(ConnectionReset(9));
        let payload = ErasedPayload::new(wide, PayloadOps::of::<AnyValue>());

        assert_eq!(
            convert::<ConnectionReset>(payload.as_payload_ref(), &DefaultConversion),
            Some(ConnectionReset(9))
        );
    }

    #[test]
    fn narrow_any_error_by_live_value() {
        let wide: AnyError = Arc::new(ConnectionReset(11));
        let payload = ErasedPayload::new(wide, PayloadOps::of::<AnyError>());

        assert_eq!(
            convert::<ConnectionReset>(payload.as_payload_ref(), &DefaultConversion),
            Some(ConnectionReset(11))
        );
        assert_eq!(convert::<String>(payload.as_payload_ref(), &DefaultConversion), None);
    }

    #[test]
    fn incompatible_types_fail_quietly() {
        let payload = ErasedPayload::new("boom".to_string(), PayloadOps::of::<String>());

        assert_eq!(convert::<i32>(payload.as_payload_ref(), &DefaultConversion), None);
        assert!(convert::<AnyError>(payload.as_payload_ref(), &DefaultConversion).is_none());
    }

    #[test]
    fn custom_policy_extends_default() {
        let payload = ErasedPayload::new(
            ConnectionReset(3),
            PayloadOps::of_error::<ConnectionReset>(),
        );

        assert_eq!(
            convert::<String>(payload.as_payload_ref(), &ErrorsAsStrings),
            Some("connection reset: 3".to_string())
        );
        assert_eq!(convert::<String>(payload.as_payload_ref(), &DefaultConversion), None);

        // Delegation keeps the default behavior for other targets.
        assert!(convert::<AnyValue>(payload.as_payload_ref(), &ErrorsAsStrings).is_some());
    }

    #[test]
    fn accept_rejects_wrong_type() {
        let mut result: Option<u8> = None;
        let mut target = ConversionTarget {
            type_id: TypeId::of::<u8>(),
            type_name: type_name::<u8>(),
            sink: &mut result,
        };

        assert!(!target.accept(1_u16));
        assert!(!target.accept_ref(&1_u16));
        assert!(target.accept(1_u8));
        assert_eq!(result, Some(1));
    }
}
