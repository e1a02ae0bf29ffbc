//! Settles promises in a few different ways and prints what a diagnostic consumer sees.

use std::sync::Arc;

use settlement::{CancelationSource, Context, SettlementState};

fn main() {
    let context = Context::builder()
        .on_unhandled(|outcome| {
            println!("unhandled: {:?} from {:?}", outcome.kind(), outcome.origin());
        })
        .build();

    // Resolved normally.
    let deferred = context.deferred::<u64>();
    let promise = deferred.promise();
    deferred.report_progress(0.5).unwrap();
    deferred.resolve(42).unwrap();
    println!("{} resolved with {:?}", promise.id(), promise.value());

    // Canceled through a cancelation source.
    let source = CancelationSource::new();
    let deferred = context.deferred::<u64>();
    let canceled = deferred.promise();
    deferred.register_for_cancelation(&source.token());
    source.cancel_with(Arc::new("user pressed stop"));
    assert_eq!(canceled.state(), SettlementState::Canceled);

    // Resolving after cancelation has no effect on the promise.
    if let Err(error) = deferred.resolve(7) {
        println!("late resolution: {error}");
    }

    // Nobody looked at the cancelation either.
    drop(deferred);
    drop(canceled);

    // Nobody handles this rejection.
    let rejected = context.deferred::<u64>();
    rejected.reject("disk full".to_string()).unwrap();
    drop(rejected);

    // Never settled.
    drop(context.deferred::<u64>());

    for outcome in context.drain_unhandled() {
        println!(
            "drained {:?} carrying {}",
            outcome.kind(),
            outcome.payload_type_name().unwrap_or("nothing")
        );
    }

    println!("pool: {:?}", context.pool_stats());
}
