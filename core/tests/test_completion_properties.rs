//! Property-based tests for completion and delivery guarantees
//!
//! # Promise
//! - At most one completion takes effect, whatever the attempt sequence
//! - Every registered callback runs exactly once with the winning result
//!
//! # FutureStream
//! - A draining subscriber sees every push, in order, regardless of capacity
//! - A stalled handle keeps only the newest `capacity` entries
//! - Cancelling one subscription never disturbs another

use bluecap_core::futures::{sequence, UNBOUNDED_HISTORY_LIMIT};
use bluecap_core::{
    Future, FutureError, FutureResult, ImmediateContext, Promise, SharedContext, StreamPromise,
};
use parking_lot::Mutex;
use proptest::prelude::*;
use std::sync::Arc;

fn immediate() -> SharedContext {
    ImmediateContext::shared()
}

// ============================================================================
// Arbitrary Generators
// ============================================================================

fn arb_result() -> impl Strategy<Value = FutureResult<i32>> {
    prop_oneof![
        any::<i32>().prop_map(Ok),
        "[a-z]{1,8}".prop_map(|m| Err(FutureError::custom(m))),
        Just(Err(FutureError::InvalidValue)),
    ]
}

fn arb_capacity() -> impl Strategy<Value = Option<usize>> {
    prop_oneof![Just(None), (1usize..8).prop_map(Some)]
}

// ============================================================================
// Promise
// ============================================================================

proptest! {
    #[test]
    fn prop_first_completion_wins(attempts in prop::collection::vec(arb_result(), 1..16)) {
        let promise = Promise::<i32>::new();
        let future = promise.future();
        let calls = Arc::new(Mutex::new(Vec::new()));
        for _ in 0..3 {
            let calls = Arc::clone(&calls);
            future.on_complete(&immediate(), move |r| calls.lock().push(r));
        }

        let accepted: Vec<bool> = attempts
            .iter()
            .map(|r| promise.try_complete(r.clone()))
            .collect();

        prop_assert!(accepted[0]);
        prop_assert!(accepted[1..].iter().all(|a| !a));
        prop_assert_eq!(future.result(), Some(attempts[0].clone()));
        prop_assert_eq!(calls.lock().clone(), vec![attempts[0].clone(); 3]);
    }

    #[test]
    fn prop_late_registration_sees_same_result(result in arb_result()) {
        let future = Future::from_result(result.clone());
        let seen = Arc::new(Mutex::new(None));
        let s = Arc::clone(&seen);
        future.on_complete(&immediate(), move |r| *s.lock() = Some(r));
        prop_assert_eq!(seen.lock().clone(), Some(result));
    }

    #[test]
    fn prop_sequence_keeps_input_order(values in prop::collection::vec(any::<u16>(), 0..32)) {
        let promises: Vec<Promise<u16>> = values.iter().map(|_| Promise::new()).collect();
        let all = sequence(&immediate(), promises.iter().map(Promise::future));
        // Complete back to front
        for (promise, value) in promises.iter().zip(&values).rev() {
            promise.succeed(*value);
        }
        prop_assert_eq!(all.result(), Some(Ok(values)));
    }
}

// ============================================================================
// FutureStream
// ============================================================================

proptest! {
    #[test]
    fn prop_draining_subscriber_sees_every_push(
        capacity in arb_capacity(),
        pushes in prop::collection::vec(arb_result(), 0..256),
    ) {
        let promise = StreamPromise::<i32>::new(capacity);
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        promise.stream().on_complete(&immediate(), None, move |r| sink.lock().push(r));

        for push in &pushes {
            promise.push_result(push.clone());
        }

        prop_assert_eq!(seen.lock().clone(), pushes.clone());
        let retained = pushes.len().min(capacity.unwrap_or(UNBOUNDED_HISTORY_LIMIT));
        prop_assert_eq!(promise.stream().count(), retained);
    }

    #[test]
    fn prop_stalled_handle_keeps_newest(
        capacity in 1usize..8,
        values in prop::collection::vec(any::<i32>(), 0..64),
    ) {
        let promise = StreamPromise::<i32>::new(Some(capacity));
        let (subscription, _) = promise.stream().subscribe(&immediate());
        for v in &values {
            promise.push(*v);
        }

        let kept = values.len().min(capacity);
        prop_assert_eq!(subscription.dropped(), (values.len() - kept) as u64);
        let drained: Vec<_> = std::iter::from_fn(|| subscription.try_next()).collect();
        let expected: Vec<_> = values[values.len() - kept..].iter().copied().map(Ok).collect();
        prop_assert_eq!(drained, expected);
    }

    #[test]
    fn prop_cancel_isolated(
        values in prop::collection::vec(any::<i32>(), 1..48),
        cancel_at in any::<prop::sample::Index>(),
    ) {
        let promise = StreamPromise::<i32>::default();
        let stream = promise.stream();
        let cut = cancel_at.index(values.len());

        let kept = Arc::new(Mutex::new(Vec::new()));
        let k = Arc::clone(&kept);
        stream.on_success(&immediate(), None, move |v| k.lock().push(v));
        let dropped = Arc::new(Mutex::new(Vec::new()));
        let d = Arc::clone(&dropped);
        let token = stream.on_complete(&immediate(), None, move |r| d.lock().push(r));

        for (i, v) in values.iter().enumerate() {
            if i == cut {
                prop_assert!(stream.cancel(token));
            }
            promise.push(*v);
        }

        prop_assert_eq!(kept.lock().clone(), values.clone());
        let expected: Vec<_> = values[..cut].iter().copied().map(Ok).collect();
        prop_assert_eq!(dropped.lock().clone(), expected);
        prop_assert!(!stream.cancel(token));
    }
}
