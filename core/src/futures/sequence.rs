//! Combining several Futures into one

use super::context::{MaxStackDepthContext, SharedContext};
use super::error::{FutureError, FutureResult};
use super::future::{Future, Promise};
use std::sync::Arc;

/// Nesting depth after which `fold` hops to the caller's context
pub const DEFAULT_MAX_STACK_DEPTH: usize = 20;

/// Reduce `futures` in iteration order.
///
/// Fails with the first failure in iteration order, even when a later
/// Future fails earlier in time.
pub fn fold<T, R, I, F>(context: &SharedContext, futures: I, initial: R, combine: F) -> Future<R>
where
    T: Clone + Send + 'static,
    R: Clone + Send + 'static,
    I: IntoIterator<Item = Future<T>>,
    F: Fn(R, T) -> FutureResult<R> + Send + Sync + 'static,
{
    fold_with_depth(context, DEFAULT_MAX_STACK_DEPTH, futures, initial, combine)
}

/// `fold` with an explicit inline nesting limit
pub fn fold_with_depth<T, R, I, F>(
    context: &SharedContext,
    max_stack_depth: usize,
    futures: I,
    initial: R,
    combine: F,
) -> Future<R>
where
    T: Clone + Send + 'static,
    R: Clone + Send + 'static,
    I: IntoIterator<Item = Future<T>>,
    F: Fn(R, T) -> FutureResult<R> + Send + Sync + 'static,
{
    let chain_context = MaxStackDepthContext::shared(max_stack_depth, Arc::clone(context));
    let combine = Arc::new(combine);

    futures
        .into_iter()
        .fold(Future::succeeded(initial), |accumulated, next| {
            let combine = Arc::clone(&combine);
            let element_context = Arc::clone(context);
            accumulated.flat_map(&chain_context, move |acc| {
                next.map(&element_context, move |value| combine(acc, value))
            })
        })
}

/// Collect every value, preserving input order
pub fn sequence<T, I>(context: &SharedContext, futures: I) -> Future<Vec<T>>
where
    T: Clone + Send + 'static,
    I: IntoIterator<Item = Future<T>>,
{
    fold(context, futures, Vec::new(), |mut values, value| {
        values.push(value);
        Ok(values)
    })
}

/// Map each item to a Future and collect the values in input order
pub fn traverse<A, T, I, F>(context: &SharedContext, items: I, f: F) -> Future<Vec<T>>
where
    T: Clone + Send + 'static,
    I: IntoIterator<Item = A>,
    F: FnMut(A) -> Future<T>,
{
    sequence(context, items.into_iter().map(f))
}

/// Race: completes with whichever input completes first.
///
/// An empty input fails immediately with `NoSuchElement`.
pub fn first_completed<T, I>(context: &SharedContext, futures: I) -> Future<T>
where
    T: Clone + Send + 'static,
    I: IntoIterator<Item = Future<T>>,
{
    let promise = Promise::new();
    let mut any = false;
    for future in futures {
        any = true;
        let racer = promise.clone();
        future.on_complete(context, move |result| {
            racer.try_complete(result);
        });
    }
    if !any {
        promise.fail(FutureError::NoSuchElement);
    }
    promise.future()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::futures::context::{ImmediateContext, PoolContext};
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(5);

    fn immediate() -> SharedContext {
        ImmediateContext::shared()
    }

    #[test]
    fn test_sequence_preserves_input_order() {
        let promises: Vec<Promise<u32>> = (0..4).map(|_| Promise::new()).collect();
        let all = sequence(&immediate(), promises.iter().map(Promise::future));

        // Complete out of order
        for i in [3, 1, 0, 2] {
            promises[i].succeed(i as u32 * 10);
        }
        assert_eq!(all.result(), Some(Ok(vec![0, 10, 20, 30])));
    }

    #[test]
    fn test_sequence_fails_with_first_failure_in_order() {
        let first = Promise::<u8>::new();
        let second = Promise::<u8>::new();
        let all = sequence(&immediate(), [first.future(), second.future()]);

        second.fail(FutureError::custom("second"));
        assert!(!all.is_completed());
        first.fail(FutureError::custom("first"));
        assert_eq!(all.result(), Some(Err(FutureError::custom("first"))));
    }

    #[test]
    fn test_fold_sums() {
        let futures = (1..=10).map(Future::succeeded);
        let total = fold(&immediate(), futures, 0u64, |acc, v| Ok(acc + v));
        assert_eq!(total.result(), Some(Ok(55)));
    }

    #[test]
    fn test_fold_combine_error() {
        let futures = vec![Future::succeeded(1), Future::succeeded(2)];
        let result = fold(&immediate(), futures, 0, |_, v| {
            if v == 2 {
                Err(FutureError::InvalidValue)
            } else {
                Ok(v)
            }
        });
        assert_eq!(result.result(), Some(Err(FutureError::InvalidValue)));
    }

    #[test]
    fn test_fold_long_chain_hops_to_pool() {
        let pool = PoolContext::new(2).unwrap().shared();
        let futures = (0..5000).map(|_| Future::succeeded(1u32));
        let total = fold_with_depth(&pool, 8, futures, 0u32, |acc, v| Ok(acc + v));
        assert_eq!(total.wait_timeout(WAIT), Some(Ok(5000)));
    }

    #[test]
    fn test_traverse_and_empty_inputs() {
        let doubled = traverse(&immediate(), vec![1, 2, 3], |v| Future::succeeded(v * 2));
        assert_eq!(doubled.result(), Some(Ok(vec![2, 4, 6])));

        let empty = sequence::<u8, _>(&immediate(), Vec::new());
        assert_eq!(empty.result(), Some(Ok(vec![])));
    }

    #[test]
    fn test_first_completed_wins_race() {
        let slow = Promise::<&str>::new();
        let fast = Promise::<&str>::new();
        let race = first_completed(&immediate(), [slow.future(), fast.future()]);

        fast.succeed("fast");
        slow.succeed("slow");
        assert_eq!(race.result(), Some(Ok("fast")));
    }

    #[test]
    fn test_first_completed_with_timer() {
        let pool = PoolContext::new(1).unwrap();
        let read = Promise::<u8>::new();
        let timeout = Duration::from_millis(20);
        let race = first_completed(
            &pool.shared(),
            [
                read.future(),
                Future::after(&pool, timeout, Err(FutureError::Timeout(timeout))),
            ],
        );
        assert_eq!(
            race.wait_timeout(WAIT),
            Some(Err(FutureError::Timeout(timeout)))
        );
        // A late read no longer changes the outcome
        read.succeed(1);
        assert_eq!(race.result(), Some(Err(FutureError::Timeout(timeout))));
    }

    #[test]
    fn test_first_completed_empty_fails() {
        let race = first_completed::<u8, _>(&immediate(), Vec::new());
        assert_eq!(race.result(), Some(Err(FutureError::NoSuchElement)));
    }
}
