//! Hands settlements to callbacks through validity-scoped views, the way a chaining layer would.

use settlement::{
    AnyContainer, CallbackError, Context, SettlementKind, Signal, invoke_with_reason,
    invoke_with_result,
};

/// A continuation that only handles resolutions and forwards everything else.
fn on_resolved(container: &AnyContainer) -> Option<AnyContainer> {
    invoke_with_result::<String, _>(container, |view| {
        if let Err(CallbackError::Signal(Signal::Rethrow(forwarded))) = view.rethrow_if_rejected() {
            println!("not my business, forwarding");
            return Some(forwarded);
        }

        println!("resolved with {}", view.value().unwrap());
        None
    })
}

/// A continuation that handles string rejections.
fn on_rejected(container: &AnyContainer) {
    invoke_with_reason(container, |view| {
        if let Some(reason) = view.try_get_as::<String>().unwrap() {
            println!("handled rejection: {reason}");
            view.mark_handled().unwrap();
        }
    });
}

fn main() {
    let context = Context::new();

    let resolved = context
        .acquire(SettlementKind::Resolved, "hello".to_string())
        .into_any();
    assert!(on_resolved(&resolved).is_none());

    let rejected = context
        .acquire(SettlementKind::Rejected, "boom".to_string())
        .into_any();
    let forwarded = on_resolved(&rejected).unwrap();
    on_rejected(&forwarded);

    drop(rejected);
    drop(forwarded);
    drop(resolved);

    assert!(context.drain_unhandled().is_empty());
    println!("nothing left unhandled");
}
