// Self-checks for the `bluecap test` command
//
// Each check drives the library through one end-to-end scenario and reports
// a failed expectation as an error instead of panicking.

use anyhow::{ensure, Result};
use bluecap_core::futures::AlreadyCompletedFault;
use bluecap_core::{ExecutionContexts, Future, FutureError, Promise, StreamPromise};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const WAIT: Duration = Duration::from_secs(5);

pub type Check = fn(&ExecutionContexts) -> Result<()>;

pub const CHECKS: &[(&str, Check)] = &[
    ("Immediate callbacks run before succeed returns", immediate_callbacks),
    ("Stream capacity bounds only the backlog", stream_capacity),
    ("flat_map propagates inner failure", flat_map_failure),
    ("Double completion is refused or raised", double_completion),
    ("Cancelling one subscription spares the other", cancel_isolation),
    ("Serial context keeps callback order", serial_order),
];

fn immediate_callbacks(contexts: &ExecutionContexts) -> Result<()> {
    let promise = Promise::<i32>::new();
    let seen = Arc::new(Mutex::new(Vec::new()));
    for _ in 0..2 {
        let seen = Arc::clone(&seen);
        promise
            .future()
            .on_success(&contexts.immediate(), move |v| seen.lock().push(v));
    }
    promise.succeed(42);
    ensure!(*seen.lock() == [42, 42], "callbacks saw {:?}", seen.lock());
    Ok(())
}

fn stream_capacity(contexts: &ExecutionContexts) -> Result<()> {
    let promise = StreamPromise::<()>::new(Some(2));
    let failures = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&failures);
    promise
        .stream()
        .on_failure(&contexts.immediate(), None, move |e| sink.lock().push(e));

    for i in 0..3 {
        promise.push_error(FutureError::custom(format!("failure {i}")));
    }

    let failures = failures.lock();
    ensure!(failures.len() == 3, "observed {} failures", failures.len());
    ensure!(
        failures[2] == FutureError::custom("failure 2"),
        "out of order: {:?}",
        *failures
    );
    Ok(())
}

fn flat_map_failure(contexts: &ExecutionContexts) -> Result<()> {
    let inner = Promise::<u8>::new();
    let inner_future = inner.future();
    let chained = Future::succeeded(1u8).flat_map(&contexts.immediate(), move |_| inner_future);
    inner.fail(FutureError::custom("boom"));
    ensure!(
        chained.result() == Some(Err(FutureError::custom("boom"))),
        "chain ended with {:?}",
        chained.result()
    );
    Ok(())
}

fn double_completion(_contexts: &ExecutionContexts) -> Result<()> {
    let promise = Promise::<u8>::new();
    ensure!(promise.try_succeed(1), "first completion refused");
    ensure!(!promise.try_succeed(2), "second completion accepted");

    // The strict variant panics; keep the default hook from printing it
    let hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(|_| {}));
    let strict = std::panic::catch_unwind(std::panic::AssertUnwindSafe(|| promise.succeed(3)));
    std::panic::set_hook(hook);
    ensure!(
        matches!(&strict, Err(payload) if AlreadyCompletedFault::is_payload(payload.as_ref())),
        "strict second completion did not raise"
    );

    ensure!(
        promise.future().result() == Some(Ok(1)),
        "result changed after completion"
    );
    Ok(())
}

fn cancel_isolation(contexts: &ExecutionContexts) -> Result<()> {
    let promise = contexts.stream_promise::<u32>();
    let stream = promise.stream();
    let (cancelled, _) = stream.subscribe(&contexts.immediate());
    let (kept, _) = stream.subscribe(&contexts.immediate());

    promise.push(1);
    cancelled.cancel();
    promise.push(2);

    ensure!(cancelled.try_next() == Some(Ok(1)), "missing entry before cancel");
    ensure!(
        cancelled.try_next() == Some(Err(FutureError::Cancelled)),
        "cancelled subscription not notified"
    );
    ensure!(cancelled.try_next().is_none(), "cancelled subscription kept going");
    ensure!(kept.try_next() == Some(Ok(1)), "other subscription lost entry 1");
    ensure!(kept.try_next() == Some(Ok(2)), "other subscription lost entry 2");
    Ok(())
}

fn serial_order(contexts: &ExecutionContexts) -> Result<()> {
    let serial = contexts.serial();
    let futures: Vec<_> = (0..20u32)
        .map(|i| Future::spawn(&serial, move || Ok(i)))
        .collect();
    let order = Arc::new(Mutex::new(Vec::new()));
    for future in &futures {
        let order = Arc::clone(&order);
        future.on_success(&serial, move |v| order.lock().push(v));
    }
    let last = Future::spawn(&serial, || Ok(()));
    ensure!(last.wait_timeout(WAIT).is_some(), "serial context stalled");
    // Callbacks registered after spawn may queue behind `last`; flush once more
    ensure!(
        Future::spawn(&serial, || Ok(())).wait_timeout(WAIT).is_some(),
        "serial context stalled"
    );
    let order = order.lock();
    ensure!(
        *order == (0..20).collect::<Vec<_>>(),
        "serial callbacks ran as {:?}",
        *order
    );
    Ok(())
}
