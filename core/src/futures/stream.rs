//! Repeated-result FutureStream / StreamPromise pair
//!
//! A FutureStream is hot: a subscription sees only entries pushed after it
//! was registered. Each subscription owns a bounded backlog of undelivered
//! entries plus a "draining" flag, so at most one delivery task per
//! subscription is ever in flight and entries arrive in push order even on a
//! pool context.
//!
//! Lock order is stream -> subscription backlog. Neither lock is held while
//! a user callback runs.

use super::cancel::CancelToken;
use super::context::SharedContext;
use super::error::{catch_panic, FutureError, FutureResult};
use super::future::Future;
use parking_lot::{Condvar, Mutex};
use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};
use tracing::{debug, trace, warn};

/// Entries a stream without a capacity keeps for `count()` / `entries()`
pub const UNBOUNDED_HISTORY_LIMIT: usize = 128;

type StreamCallback<T> = Arc<dyn Fn(FutureResult<T>) + Send + Sync + 'static>;

enum Sink<T> {
    /// Deliver by invoking a callback on the subscription's context
    Callback(StreamCallback<T>),
    /// Deliver by waking whoever holds the `Subscription` handle
    Handle,
}

struct Backlog<T> {
    entries: VecDeque<FutureResult<T>>,
    draining: bool,
    waker: Option<Waker>,
    cancel_reported: bool,
    dropped: u64,
}

struct Subscriber<T> {
    token: CancelToken,
    context: SharedContext,
    sink: Sink<T>,
    capacity: Option<usize>,
    cancelled: AtomicBool,
    backlog: Mutex<Backlog<T>>,
    ready: Condvar,
}

impl<T> Subscriber<T>
where
    T: Clone + Send + 'static,
{
    fn new(
        token: CancelToken,
        context: SharedContext,
        sink: Sink<T>,
        capacity: Option<usize>,
    ) -> Self {
        Self {
            token,
            context,
            sink,
            capacity,
            cancelled: AtomicBool::new(false),
            backlog: Mutex::new(Backlog {
                entries: VecDeque::new(),
                draining: false,
                waker: None,
                cancel_reported: false,
                dropped: 0,
            }),
            ready: Condvar::new(),
        }
    }

    fn is_cancelled(&self) -> bool {
        self.cancelled.load(Ordering::Acquire)
    }

    /// Append to the backlog, evicting the oldest undelivered entry when
    /// full. Returns `true` when a delivery task must be scheduled.
    fn enqueue(&self, entry: FutureResult<T>) -> bool {
        let mut backlog = self.backlog.lock();
        if self.is_cancelled() {
            return false;
        }
        if let Some(capacity) = self.capacity {
            if backlog.entries.len() >= capacity {
                backlog.entries.pop_front();
                backlog.dropped += 1;
                trace!(
                    "Subscription {} backlog full ({}), dropped oldest entry",
                    self.token,
                    capacity
                );
            }
        }
        backlog.entries.push_back(entry);
        match self.sink {
            Sink::Callback(_) if backlog.draining => false,
            Sink::Callback(_) => {
                backlog.draining = true;
                true
            }
            Sink::Handle => true,
        }
    }

    fn schedule(self: &Arc<Self>) {
        let subscriber = Arc::clone(self);
        match self.sink {
            Sink::Callback(_) => self.context.execute(Box::new(move || subscriber.drain())),
            Sink::Handle => self.context.execute(Box::new(move || subscriber.notify())),
        }
    }

    fn drain(&self) {
        let Sink::Callback(callback) = &self.sink else {
            return;
        };
        loop {
            let entry = {
                let mut backlog = self.backlog.lock();
                if self.is_cancelled() {
                    backlog.entries.clear();
                    backlog.draining = false;
                    return;
                }
                match backlog.entries.pop_front() {
                    Some(entry) => entry,
                    None => {
                        backlog.draining = false;
                        return;
                    }
                }
            };
            if let Err(error) = catch_panic(|| {
                callback(entry);
                Ok(())
            }) {
                warn!("Stream callback for subscription {} failed: {}", self.token, error);
            }
        }
    }

    fn notify(&self) {
        let waker = self.backlog.lock().waker.take();
        self.ready.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
        let waker = {
            let mut backlog = self.backlog.lock();
            backlog.entries.clear();
            backlog.waker.take()
        };
        self.ready.notify_all();
        if let Some(waker) = waker {
            waker.wake();
        }
    }

    /// Next buffered entry; after cancellation, a single `Cancelled`
    fn next_entry(&self, backlog: &mut Backlog<T>) -> Option<FutureResult<T>> {
        if let Some(entry) = backlog.entries.pop_front() {
            return Some(entry);
        }
        if self.is_cancelled() && !backlog.cancel_reported {
            backlog.cancel_reported = true;
            return Some(Err(FutureError::Cancelled));
        }
        None
    }
}

// ============================================================================
// FUTURE STREAM
// ============================================================================

struct StreamState<T> {
    subscribers: HashMap<CancelToken, Vec<Arc<Subscriber<T>>>>,
    entries: VecDeque<Future<T>>,
    upstream: Option<CancelToken>,
}

struct StreamInner<T> {
    capacity: Option<usize>,
    state: Mutex<StreamState<T>>,
}

/// Ordered, multi-subscriber sequence of pushed results
pub struct FutureStream<T> {
    inner: Arc<StreamInner<T>>,
}

/// Non-owning stream handle for callbacks registered on the stream itself
pub(crate) struct WeakFutureStream<T> {
    inner: Weak<StreamInner<T>>,
}

impl<T> WeakFutureStream<T> {
    pub(crate) fn upgrade(&self) -> Option<FutureStream<T>> {
        self.inner.upgrade().map(|inner| FutureStream { inner })
    }
}

impl<T> Clone for FutureStream<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for FutureStream<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("FutureStream")
            .field("capacity", &self.inner.capacity)
            .field("entries", &state.entries.len())
            .field("subscriptions", &state.subscribers.len())
            .finish()
    }
}

impl<T> FutureStream<T>
where
    T: Clone + Send + 'static,
{
    /// `None` means unbounded. A capacity of zero is treated as one.
    pub(crate) fn new(capacity: Option<usize>) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                capacity: capacity.map(|c| c.max(1)),
                state: Mutex::new(StreamState {
                    subscribers: HashMap::new(),
                    entries: VecDeque::new(),
                    upstream: None,
                }),
            }),
        }
    }

    pub fn capacity(&self) -> Option<usize> {
        self.inner.capacity
    }

    /// Number of retained entries: the most recent `capacity`, or at most
    /// `UNBOUNDED_HISTORY_LIMIT` without one
    pub fn count(&self) -> usize {
        self.inner.state.lock().entries.len()
    }

    /// Snapshot of the retained entries, oldest first
    pub fn entries(&self) -> Vec<Future<T>> {
        self.inner.state.lock().entries.iter().cloned().collect()
    }

    /// Number of live cancel tokens
    pub fn subscription_count(&self) -> usize {
        self.inner.state.lock().subscribers.len()
    }

    /// Token this derived stream uses on its source; cancel it there to detach
    pub fn upstream_token(&self) -> Option<CancelToken> {
        self.inner.state.lock().upstream
    }

    pub(crate) fn downgrade(&self) -> WeakFutureStream<T> {
        WeakFutureStream {
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// No handle besides `self` and no subscriptions: nothing can observe
    /// further entries.
    fn is_orphaned(&self) -> bool {
        Arc::strong_count(&self.inner) == 1 && self.inner.state.lock().subscribers.is_empty()
    }

    pub(crate) fn complete(&self, result: FutureResult<T>) {
        let mut scheduled = Vec::new();
        {
            let mut state = self.inner.state.lock();
            let history = self.inner.capacity.unwrap_or(UNBOUNDED_HISTORY_LIMIT);
            while state.entries.len() >= history {
                state.entries.pop_front();
            }
            state.entries.push_back(Future::from_result(result.clone()));

            for subscriber in state.subscribers.values().flatten() {
                if subscriber.enqueue(result.clone()) {
                    scheduled.push(Arc::clone(subscriber));
                }
            }
        }
        for subscriber in scheduled {
            subscriber.schedule();
        }
    }

    fn register(
        &self,
        context: &SharedContext,
        token: CancelToken,
        sink: Sink<T>,
    ) -> Arc<Subscriber<T>> {
        let subscriber = Arc::new(Subscriber::new(
            token,
            Arc::clone(context),
            sink,
            self.inner.capacity,
        ));
        self.inner
            .state
            .lock()
            .subscribers
            .entry(token)
            .or_default()
            .push(Arc::clone(&subscriber));
        debug!("Stream subscription {} registered", token);
        subscriber
    }

    // ------------------------------------------------------------------------
    // Subscription
    // ------------------------------------------------------------------------

    /// Pull-style subscription; receives every entry pushed from now on
    pub fn subscribe(&self, context: &SharedContext) -> (Subscription<T>, CancelToken) {
        let token = CancelToken::new();
        let subscriber = self.register(context, token, Sink::Handle);
        (
            Subscription {
                stream: self.clone(),
                subscriber,
            },
            token,
        )
    }

    /// Invoke `callback` once per pushed entry.
    ///
    /// Callbacks registered under the same token are cancelled together.
    pub fn on_complete<F>(
        &self,
        context: &SharedContext,
        cancel_token: Option<CancelToken>,
        callback: F,
    ) -> CancelToken
    where
        F: Fn(FutureResult<T>) + Send + Sync + 'static,
    {
        let token = cancel_token.unwrap_or_default();
        self.register(context, token, Sink::Callback(Arc::new(callback)));
        token
    }

    pub fn on_success<F>(
        &self,
        context: &SharedContext,
        cancel_token: Option<CancelToken>,
        callback: F,
    ) -> CancelToken
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.on_complete(context, cancel_token, move |result| {
            if let Ok(value) = result {
                callback(value);
            }
        })
    }

    pub fn on_failure<F>(
        &self,
        context: &SharedContext,
        cancel_token: Option<CancelToken>,
        callback: F,
    ) -> CancelToken
    where
        F: Fn(FutureError) + Send + Sync + 'static,
    {
        self.on_complete(context, cancel_token, move |result| {
            if let Err(error) = result {
                callback(error);
            }
        })
    }

    pub fn for_each<F>(
        &self,
        context: &SharedContext,
        cancel_token: Option<CancelToken>,
        apply: F,
    ) -> CancelToken
    where
        F: Fn(T) + Send + Sync + 'static,
    {
        self.on_success(context, cancel_token, apply)
    }

    /// Stop delivery to every callback registered under `token`.
    ///
    /// Returns `false` if the token is unknown or was already cancelled.
    pub fn cancel(&self, token: CancelToken) -> bool {
        let removed = self.inner.state.lock().subscribers.remove(&token);
        match removed {
            Some(subscribers) => {
                for subscriber in subscribers {
                    subscriber.cancel();
                }
                debug!("Stream subscription {} cancelled", token);
                true
            }
            None => false,
        }
    }

    // ------------------------------------------------------------------------
    // Combinators
    // ------------------------------------------------------------------------

    /// Feed a new stream from this one.
    ///
    /// The derived stream stays attached while someone holds it or it has
    /// subscriptions; the first entry pushed after both are gone cancels the
    /// upstream token instead of being forwarded.
    fn derive<U, F>(&self, context: &SharedContext, forward: F) -> FutureStream<U>
    where
        U: Clone + Send + 'static,
        F: Fn(&StreamPromise<U>, FutureResult<T>) + Send + Sync + 'static,
    {
        let promise = StreamPromise::new(self.inner.capacity);
        let derived = promise.stream();
        let token = CancelToken::new();
        let source = self.downgrade();
        self.on_complete(context, Some(token), move |result| {
            if promise.stream.is_orphaned() {
                if let Some(source) = source.upgrade() {
                    debug!("Derived stream dropped, detaching {}", token);
                    source.cancel(token);
                }
                return;
            }
            forward(&promise, result);
        });
        derived.inner.state.lock().upstream = Some(token);
        derived
    }

    pub fn map<U, F>(&self, context: &SharedContext, mapping: F) -> FutureStream<U>
    where
        U: Clone + Send + 'static,
        F: Fn(T) -> FutureResult<U> + Send + Sync + 'static,
    {
        self.derive(context, move |promise, result| {
            promise.push_result(result.and_then(|value| catch_panic(|| mapping(value))));
        })
    }

    /// Per entry, forward whatever the Future produced by `mapping` yields.
    ///
    /// Entries land in the derived stream in completion order of those Futures.
    pub fn flat_map<U, F>(&self, context: &SharedContext, mapping: F) -> FutureStream<U>
    where
        U: Clone + Send + 'static,
        F: Fn(T) -> Future<U> + Send + Sync + 'static,
    {
        let chain_context = Arc::clone(context);
        self.derive(context, move |promise, result| {
            match result.and_then(|value| catch_panic(|| Ok(mapping(value)))) {
                Ok(next) => promise.complete_with_future(&chain_context, &next),
                Err(error) => promise.push_error(error),
            }
        })
    }

    /// Per entry, forward every entry of the stream produced by `mapping`
    pub fn flat_map_stream<U, F>(&self, context: &SharedContext, mapping: F) -> FutureStream<U>
    where
        U: Clone + Send + 'static,
        F: Fn(T) -> FutureStream<U> + Send + Sync + 'static,
    {
        let chain_context = Arc::clone(context);
        self.derive(context, move |promise, result| {
            match result.and_then(|value| catch_panic(|| Ok(mapping(value)))) {
                Ok(source) => {
                    promise.complete_with_stream(&chain_context, &source);
                }
                Err(error) => promise.push_error(error),
            }
        })
    }

    pub fn recover<F>(&self, context: &SharedContext, recovery: F) -> FutureStream<T>
    where
        F: Fn(FutureError) -> FutureResult<T> + Send + Sync + 'static,
    {
        self.derive(context, move |promise, result| {
            promise.push_result(match result {
                Ok(value) => Ok(value),
                Err(error) => catch_panic(|| recovery(error)),
            });
        })
    }

    pub fn recover_with<F>(&self, context: &SharedContext, recovery: F) -> FutureStream<T>
    where
        F: Fn(FutureError) -> Future<T> + Send + Sync + 'static,
    {
        let chain_context = Arc::clone(context);
        self.derive(context, move |promise, result| match result {
            Ok(value) => promise.push(value),
            Err(error) => match catch_panic(|| Ok(recovery(error))) {
                Ok(next) => promise.complete_with_future(&chain_context, &next),
                Err(error) => promise.push_error(error),
            },
        })
    }

    /// Observe each entry without altering it
    pub fn and_then<F>(&self, context: &SharedContext, side_effect: F) -> FutureStream<T>
    where
        F: Fn(&FutureResult<T>) + Send + Sync + 'static,
    {
        self.derive(context, move |promise, result| {
            if let Err(error) = catch_panic(|| {
                side_effect(&result);
                Ok(())
            }) {
                warn!("and_then side effect failed: {}", error);
            }
            promise.push_result(result);
        })
    }

    pub fn map_error<F>(&self, context: &SharedContext, mapping: F) -> FutureStream<T>
    where
        F: Fn(FutureError) -> FutureError + Send + Sync + 'static,
    {
        self.derive(context, move |promise, result| {
            promise.push_result(result.map_err(|error| {
                match catch_panic(|| Ok(mapping(error))) {
                    Ok(mapped) | Err(mapped) => mapped,
                }
            }));
        })
    }

    /// Rejected values become `NoSuchElement` entries
    pub fn with_filter<F>(&self, context: &SharedContext, predicate: F) -> FutureStream<T>
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.derive(context, move |promise, result| {
            promise.push_result(result.and_then(|value| {
                catch_panic(|| {
                    if predicate(&value) {
                        Ok(value)
                    } else {
                        Err(FutureError::NoSuchElement)
                    }
                })
            }));
        })
    }
}

// ============================================================================
// SUBSCRIPTION HANDLE
// ============================================================================

/// Pull-side handle returned by `FutureStream::subscribe`.
///
/// Implements `futures::Stream`. After cancellation it yields one
/// `Err(Cancelled)` and then ends. Dropping the handle cancels it.
pub struct Subscription<T>
where
    T: Clone + Send + 'static,
{
    stream: FutureStream<T>,
    subscriber: Arc<Subscriber<T>>,
}

impl<T> Subscription<T>
where
    T: Clone + Send + 'static,
{
    pub fn token(&self) -> CancelToken {
        self.subscriber.token
    }

    /// Next entry without waiting
    pub fn try_next(&self) -> Option<FutureResult<T>> {
        let mut backlog = self.subscriber.backlog.lock();
        self.subscriber.next_entry(&mut backlog)
    }

    /// Wait up to `timeout` for the next entry
    pub fn next_timeout(&self, timeout: Duration) -> Option<FutureResult<T>> {
        let deadline = Instant::now() + timeout;
        let mut backlog = self.subscriber.backlog.lock();
        loop {
            if let Some(entry) = self.subscriber.next_entry(&mut backlog) {
                return Some(entry);
            }
            if backlog.cancel_reported {
                return None;
            }
            if self
                .subscriber
                .ready
                .wait_until(&mut backlog, deadline)
                .timed_out()
            {
                return self.subscriber.next_entry(&mut backlog);
            }
        }
    }

    /// Undelivered entries currently buffered
    pub fn backlog_len(&self) -> usize {
        self.subscriber.backlog.lock().entries.len()
    }

    /// Entries evicted because the backlog was full
    pub fn dropped(&self) -> u64 {
        self.subscriber.backlog.lock().dropped
    }

    pub fn is_cancelled(&self) -> bool {
        self.subscriber.is_cancelled()
    }

    pub fn cancel(&self) -> bool {
        self.stream.cancel(self.subscriber.token)
    }
}

impl<T> Drop for Subscription<T>
where
    T: Clone + Send + 'static,
{
    fn drop(&mut self) {
        if !self.subscriber.is_cancelled() {
            self.stream.cancel(self.subscriber.token);
        }
    }
}

impl<T> futures::Stream for Subscription<T>
where
    T: Clone + Send + 'static,
{
    type Item = FutureResult<T>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let subscriber = &self.subscriber;
        let mut backlog = subscriber.backlog.lock();
        if let Some(entry) = subscriber.next_entry(&mut backlog) {
            return Poll::Ready(Some(entry));
        }
        if backlog.cancel_reported {
            return Poll::Ready(None);
        }
        backlog.waker = Some(cx.waker().clone());
        Poll::Pending
    }
}

// ============================================================================
// STREAM PROMISE
// ============================================================================

/// Write capability for a FutureStream.
///
/// Each push becomes one entry; the stream itself never completes.
pub struct StreamPromise<T> {
    stream: FutureStream<T>,
}

impl<T> Clone for StreamPromise<T> {
    fn clone(&self) -> Self {
        Self {
            stream: self.stream.clone(),
        }
    }
}

impl<T> Default for StreamPromise<T>
where
    T: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new(None)
    }
}

impl<T> StreamPromise<T>
where
    T: Clone + Send + 'static,
{
    pub fn new(capacity: Option<usize>) -> Self {
        Self {
            stream: FutureStream::new(capacity),
        }
    }

    pub fn stream(&self) -> FutureStream<T> {
        self.stream.clone()
    }

    pub fn push(&self, value: T) {
        self.stream.complete(Ok(value));
    }

    pub fn push_error(&self, error: FutureError) {
        self.stream.complete(Err(error));
    }

    pub fn push_result(&self, result: FutureResult<T>) {
        self.stream.complete(result);
    }

    /// Push the result of `future` once it completes
    pub fn complete_with_future(&self, context: &SharedContext, future: &Future<T>) {
        let stream = self.stream.clone();
        future.on_complete(context, move |result| stream.complete(result));
    }

    /// Forward every entry of `source`; cancel the returned token on
    /// `source` to stop forwarding.
    pub fn complete_with_stream(
        &self,
        context: &SharedContext,
        source: &FutureStream<T>,
    ) -> CancelToken {
        let stream = self.stream.clone();
        source.on_complete(context, None, move |result| stream.complete(result))
    }
}
