//! Single-result Future / Promise pair
//!
//! A `Future<T>` is a shared read handle to a result that is set exactly once
//! by its `Promise<T>`. State (result slot + pending callbacks) sits behind a
//! single mutex per Future. The mutex is never held while a callback runs:
//! callbacks are collected under the lock and handed to their execution
//! context after it is released, so registering from inside a callback or
//! completing from inside a callback cannot deadlock.

use super::context::{ImmediateContext, PoolContext, SharedContext};
use super::cancel::CancelToken;
use super::error::{catch_panic, AlreadyCompletedFault, FutureError, FutureResult};
use super::stream::{FutureStream, StreamPromise};
use parking_lot::{Condvar, Mutex};
use std::fmt;
use std::future::IntoFuture;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};
use tracing::{debug, error, warn};

type Callback<T> = Box<dyn FnOnce(FutureResult<T>) + Send + 'static>;

enum State<T> {
    Pending(Vec<(SharedContext, Callback<T>)>),
    Completed(FutureResult<T>),
}

struct Inner<T> {
    state: Mutex<State<T>>,
    completed: Condvar,
}

// ============================================================================
// FUTURE
// ============================================================================

/// Read handle to an eventual `FutureResult<T>`.
///
/// Clones share the same underlying slot.
pub struct Future<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for Future<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for Future<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let completed = matches!(*self.inner.state.lock(), State::Completed(_));
        f.debug_struct("Future")
            .field("completed", &completed)
            .finish()
    }
}

impl<T> Future<T>
where
    T: Clone + Send + 'static,
{
    fn with_state(state: State<T>) -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(state),
                completed: Condvar::new(),
            }),
        }
    }

    pub(crate) fn pending() -> Self {
        Self::with_state(State::Pending(Vec::new()))
    }

    /// An already successful Future
    pub fn succeeded(value: T) -> Self {
        Self::from_result(Ok(value))
    }

    /// An already failed Future
    pub fn failed(error: FutureError) -> Self {
        Self::from_result(Err(error))
    }

    pub fn from_result(result: FutureResult<T>) -> Self {
        Self::with_state(State::Completed(result))
    }

    /// A Future nobody can complete
    pub fn never() -> Self {
        Self::pending()
    }

    /// Run `task` on `context` and complete with its result.
    ///
    /// A panicking task completes the Future with `Panicked`.
    pub fn spawn<F>(context: &SharedContext, task: F) -> Self
    where
        F: FnOnce() -> FutureResult<T> + Send + 'static,
    {
        let promise = Promise::new();
        let future = promise.future();
        context.execute(Box::new(move || promise.complete(catch_panic(task))));
        future
    }

    /// Hand a Promise to callback-style code and return its Future
    pub fn from_resolver<F>(resolver: F) -> Self
    where
        F: FnOnce(Promise<T>),
    {
        let promise = Promise::new();
        let future = promise.future();
        resolver(promise);
        future
    }

    /// Complete with `result` after `delay`, driven by the pool's timer
    pub fn after(pool: &PoolContext, delay: Duration, result: FutureResult<T>) -> Self {
        let promise = Promise::new();
        let future = promise.future();
        pool.schedule_after(
            delay,
            Box::new(move || {
                promise.try_complete(result);
            }),
        );
        future
    }

    /// The result, if already completed
    pub fn result(&self) -> Option<FutureResult<T>> {
        match &*self.inner.state.lock() {
            State::Completed(result) => Some(result.clone()),
            State::Pending(_) => None,
        }
    }

    pub fn is_completed(&self) -> bool {
        matches!(*self.inner.state.lock(), State::Completed(_))
    }

    /// Block the calling thread until completion
    pub fn wait(&self) -> FutureResult<T> {
        let mut state = self.inner.state.lock();
        loop {
            if let State::Completed(result) = &*state {
                return result.clone();
            }
            self.inner.completed.wait(&mut state);
        }
    }

    /// Block for at most `timeout`; `None` if still pending
    pub fn wait_timeout(&self, timeout: Duration) -> Option<FutureResult<T>> {
        let deadline = Instant::now() + timeout;
        let mut state = self.inner.state.lock();
        loop {
            if let State::Completed(result) = &*state {
                return Some(result.clone());
            }
            if self
                .inner
                .completed
                .wait_until(&mut state, deadline)
                .timed_out()
            {
                return match &*state {
                    State::Completed(result) => Some(result.clone()),
                    State::Pending(_) => None,
                };
            }
        }
    }

    /// Transition pending -> completed. Returns `false` if already completed.
    pub(crate) fn try_complete(&self, result: FutureResult<T>) -> bool {
        let callbacks = {
            let mut state = self.inner.state.lock();
            let callbacks = match &mut *state {
                State::Completed(_) => return false,
                State::Pending(callbacks) => std::mem::take(callbacks),
            };
            *state = State::Completed(result.clone());
            callbacks
        };
        self.inner.completed.notify_all();

        debug!(
            "Future completed ({}), dispatching {} callbacks",
            if result.is_ok() { "success" } else { "failure" },
            callbacks.len()
        );
        for (context, callback) in callbacks {
            let result = result.clone();
            context.execute(Box::new(move || callback(result)));
        }
        true
    }

    // ------------------------------------------------------------------------
    // Registration
    // ------------------------------------------------------------------------

    /// Invoke `callback` exactly once with the final result, on `context`
    pub fn on_complete<F>(&self, context: &SharedContext, callback: F)
    where
        F: FnOnce(FutureResult<T>) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        match &mut *state {
            State::Pending(callbacks) => {
                callbacks.push((Arc::clone(context), Box::new(callback)));
            }
            State::Completed(result) => {
                let result = result.clone();
                drop(state);
                context.execute(Box::new(move || callback(result)));
            }
        }
    }

    pub fn on_success<F>(&self, context: &SharedContext, callback: F)
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.on_complete(context, move |result| {
            if let Ok(value) = result {
                callback(value);
            }
        });
    }

    pub fn on_failure<F>(&self, context: &SharedContext, callback: F)
    where
        F: FnOnce(FutureError) + Send + 'static,
    {
        self.on_complete(context, move |result| {
            if let Err(error) = result {
                callback(error);
            }
        });
    }

    /// Same as `on_success`; reads better at the end of a chain
    pub fn for_each<F>(&self, context: &SharedContext, apply: F)
    where
        F: FnOnce(T) + Send + 'static,
    {
        self.on_success(context, apply);
    }

    // ------------------------------------------------------------------------
    // Combinators
    // ------------------------------------------------------------------------

    /// Transform the success value; failures pass through and `mapping` is
    /// never called for them.
    pub fn map<U, F>(&self, context: &SharedContext, mapping: F) -> Future<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> FutureResult<U> + Send + 'static,
    {
        let promise = Promise::new();
        let future = promise.future();
        self.on_complete(context, move |result| {
            promise.complete(result.and_then(|value| catch_panic(move || mapping(value))));
        });
        future
    }

    /// Chain into the Future produced by `mapping`
    pub fn flat_map<U, F>(&self, context: &SharedContext, mapping: F) -> Future<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> Future<U> + Send + 'static,
    {
        let promise = Promise::new();
        let future = promise.future();
        let chain_context = Arc::clone(context);
        self.on_complete(context, move |result| {
            match result.and_then(|value| catch_panic(move || Ok(mapping(value)))) {
                Ok(next) => promise.complete_with(&chain_context, &next),
                Err(error) => promise.fail(error),
            }
        });
        future
    }

    /// Replace a failure with the result of `recovery`; successes pass through
    pub fn recover<F>(&self, context: &SharedContext, recovery: F) -> Future<T>
    where
        F: FnOnce(FutureError) -> FutureResult<T> + Send + 'static,
    {
        let promise = Promise::new();
        let future = promise.future();
        self.on_complete(context, move |result| {
            promise.complete(match result {
                Ok(value) => Ok(value),
                Err(error) => catch_panic(move || recovery(error)),
            });
        });
        future
    }

    /// Replace a failure with the Future produced by `recovery`
    pub fn recover_with<F>(&self, context: &SharedContext, recovery: F) -> Future<T>
    where
        F: FnOnce(FutureError) -> Future<T> + Send + 'static,
    {
        let promise = Promise::new();
        let future = promise.future();
        let chain_context = Arc::clone(context);
        self.on_complete(context, move |result| match result {
            Ok(value) => promise.succeed(value),
            Err(error) => match catch_panic(move || Ok(recovery(error))) {
                Ok(next) => promise.complete_with(&chain_context, &next),
                Err(error) => promise.fail(error),
            },
        });
        future
    }

    /// Observe the result without altering it
    pub fn and_then<F>(&self, context: &SharedContext, side_effect: F) -> Future<T>
    where
        F: FnOnce(&FutureResult<T>) + Send + 'static,
    {
        let promise = Promise::new();
        let future = promise.future();
        self.on_complete(context, move |result| {
            if let Err(error) = catch_panic(|| {
                side_effect(&result);
                Ok(())
            }) {
                warn!("and_then side effect failed: {}", error);
            }
            promise.complete(result);
        });
        future
    }

    pub fn map_error<F>(&self, context: &SharedContext, mapping: F) -> Future<T>
    where
        F: FnOnce(FutureError) -> FutureError + Send + 'static,
    {
        let promise = Promise::new();
        let future = promise.future();
        self.on_complete(context, move |result| {
            promise.complete(result.map_err(|error| {
                match catch_panic(move || Ok(mapping(error))) {
                    Ok(mapped) | Err(mapped) => mapped,
                }
            }));
        });
        future
    }

    /// Fail with `NoSuchElement` when `predicate` rejects the value
    pub fn with_filter<F>(&self, context: &SharedContext, predicate: F) -> Future<T>
    where
        F: FnOnce(&T) -> bool + Send + 'static,
    {
        let promise = Promise::new();
        let future = promise.future();
        self.on_complete(context, move |result| {
            promise.complete(result.and_then(|value| {
                catch_panic(move || {
                    if predicate(&value) {
                        Ok(value)
                    } else {
                        Err(FutureError::NoSuchElement)
                    }
                })
            }));
        });
        future
    }

    /// Feed every entry of the stream produced by `mapping` into a new stream
    pub fn flat_map_stream<U, F>(
        &self,
        capacity: Option<usize>,
        context: &SharedContext,
        mapping: F,
    ) -> FutureStream<U>
    where
        U: Clone + Send + 'static,
        F: FnOnce(T) -> FutureStream<U> + Send + 'static,
    {
        let promise = StreamPromise::new(capacity);
        let stream = promise.stream();
        let chain_context = Arc::clone(context);
        self.on_complete(context, move |result| {
            match result.and_then(|value| catch_panic(move || Ok(mapping(value)))) {
                Ok(source) => {
                    promise.complete_with_stream(&chain_context, &source);
                }
                Err(error) => promise.push_error(error),
            }
        });
        stream
    }

    /// On failure, switch to the stream produced by `recovery`
    pub fn recover_with_stream<F>(
        &self,
        capacity: Option<usize>,
        context: &SharedContext,
        recovery: F,
    ) -> FutureStream<T>
    where
        F: FnOnce(FutureError) -> FutureStream<T> + Send + 'static,
    {
        let promise = StreamPromise::new(capacity);
        let stream = promise.stream();
        let chain_context = Arc::clone(context);
        self.on_complete(context, move |result| match result {
            Ok(value) => promise.push(value),
            Err(error) => match catch_panic(move || Ok(recovery(error))) {
                Ok(source) => {
                    promise.complete_with_stream(&chain_context, &source);
                }
                Err(error) => promise.push_error(error),
            },
        });
        stream
    }
}

// ============================================================================
// ASYNC BRIDGE
// ============================================================================

/// `std::future::Future` adapter returned by `Future::into_future`
pub struct Completion<T> {
    future: Future<T>,
    waker: Option<Arc<Mutex<Option<Waker>>>>,
}

impl<T> std::future::Future for Completion<T>
where
    T: Clone + Send + 'static,
{
    type Output = FutureResult<T>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if let Some(result) = this.future.result() {
            return Poll::Ready(result);
        }

        match &this.waker {
            Some(slot) => *slot.lock() = Some(cx.waker().clone()),
            None => {
                let slot = Arc::new(Mutex::new(Some(cx.waker().clone())));
                let notify = Arc::clone(&slot);
                this.future
                    .on_complete(&ImmediateContext::shared(), move |_| {
                        if let Some(waker) = notify.lock().take() {
                            waker.wake();
                        }
                    });
                this.waker = Some(slot);
            }
        }

        // Completion may have landed between the first check and storing the waker
        match this.future.result() {
            Some(result) => Poll::Ready(result),
            None => Poll::Pending,
        }
    }
}

impl<T> IntoFuture for Future<T>
where
    T: Clone + Send + 'static,
{
    type Output = FutureResult<T>;
    type IntoFuture = Completion<T>;

    fn into_future(self) -> Self::IntoFuture {
        Completion {
            future: self,
            waker: None,
        }
    }
}

// ============================================================================
// PROMISE
// ============================================================================

/// Write capability for one Future.
///
/// Clones complete the same Future; at most one completion takes effect.
pub struct Promise<T> {
    future: Future<T>,
}

impl<T> Clone for Promise<T> {
    fn clone(&self) -> Self {
        Self {
            future: self.future.clone(),
        }
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("future", &self.future)
            .finish()
    }
}

impl<T> Default for Promise<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Promise<T>
where
    T: Clone + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            future: Future::pending(),
        }
    }

    pub fn future(&self) -> Future<T> {
        self.future.clone()
    }

    pub fn is_completed(&self) -> bool {
        self.future.is_completed()
    }

    /// Complete the Future.
    ///
    /// # Panics
    /// With an `AlreadyCompletedFault` payload if the Future was already
    /// completed. A second completion means some producer lost a result; use
    /// `try_complete` where racing is expected. Callback and combinator
    /// isolation never swallows this panic.
    #[track_caller]
    pub fn complete(&self, result: FutureResult<T>) {
        if !self.future.try_complete(result) {
            error!("Promise completed more than once");
            std::panic::panic_any(AlreadyCompletedFault);
        }
    }

    #[track_caller]
    pub fn succeed(&self, value: T) {
        self.complete(Ok(value));
    }

    #[track_caller]
    pub fn fail(&self, error: FutureError) {
        self.complete(Err(error));
    }

    pub fn try_complete(&self, result: FutureResult<T>) -> bool {
        self.future.try_complete(result)
    }

    pub fn try_succeed(&self, value: T) -> bool {
        self.try_complete(Ok(value))
    }

    pub fn try_fail(&self, error: FutureError) -> bool {
        self.try_complete(Err(error))
    }

    /// Complete with whatever `future` eventually produces
    pub fn complete_with(&self, context: &SharedContext, future: &Future<T>) {
        let promise = self.clone();
        future.on_complete(context, move |result| promise.complete(result));
    }

    /// Complete with the first entry `stream` yields from now on.
    ///
    /// The returned token is cancelled on `stream` once that entry arrives;
    /// cancel it earlier to give up waiting. Later entries are ignored.
    pub fn complete_with_stream(
        &self,
        context: &SharedContext,
        stream: &FutureStream<T>,
    ) -> CancelToken {
        let token = CancelToken::new();
        let promise = self.clone();
        let source = stream.downgrade();
        stream.on_complete(context, Some(token), move |result| {
            if promise.try_complete(result) {
                if let Some(source) = source.upgrade() {
                    source.cancel(token);
                }
            }
        })
    }
}
