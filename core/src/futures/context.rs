//! Execution contexts: where a callback runs
//!
//! Contexts are plain values passed into every registration call. Nothing
//! here is a process-wide singleton; the application builds its contexts once
//! (see `config::ExecutionContexts`) and hands them down.

use super::error::AlreadyCompletedFault;
use std::cell::Cell;
use std::sync::Arc;
use std::thread;
use std::time::Duration;
use thiserror::Error;
use tokio::runtime::{Builder, Handle, Runtime};
use tokio::sync::mpsc;
use tracing::{debug, error, warn};

/// Unit of work submitted to a context
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Shared, type-erased context handle
pub type SharedContext = Arc<dyn ExecutionContext>;

/// Schedules tasks. `execute` must return without waiting for the task.
#[cfg_attr(test, mockall::automock)]
pub trait ExecutionContext: Send + Sync {
    fn execute(&self, task: Task);
}

/// Errors raised while building contexts
#[derive(Debug, Error)]
pub enum ContextError {
    #[error("Failed to spawn worker thread: {0}")]
    SpawnFailed(#[source] std::io::Error),

    #[error("Failed to build runtime: {0}")]
    RuntimeBuild(#[source] std::io::Error),

    #[error("Worker count must be > 0")]
    NoWorkers,
}

/// Run a task, containing any panic so the caller's scheduling loop survives.
///
/// An `AlreadyCompletedFault` is logged and then re-raised.
pub(crate) fn run_isolated(context: &str, task: Task) {
    if let Err(payload) = std::panic::catch_unwind(std::panic::AssertUnwindSafe(task)) {
        if AlreadyCompletedFault::is_payload(payload.as_ref()) {
            error!("Promise completed twice on {} context", context);
            std::panic::resume_unwind(payload);
        }
        let message = payload
            .downcast_ref::<&'static str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic payload".to_string());
        error!("Task panicked on {} context: {}", context, message);
    }
}

// ============================================================================
// IMMEDIATE
// ============================================================================

/// Runs each task synchronously on the calling thread.
///
/// Meant for deterministic tests. Completion never happens under a lock in
/// this crate, so using it in production is safe but serializes work onto
/// whichever thread completes the Promise.
#[derive(Debug, Clone, Copy, Default)]
pub struct ImmediateContext;

impl ImmediateContext {
    pub fn shared() -> SharedContext {
        Arc::new(ImmediateContext)
    }
}

impl ExecutionContext for ImmediateContext {
    fn execute(&self, task: Task) {
        run_isolated("immediate", task);
    }
}

// ============================================================================
// SERIAL
// ============================================================================

/// One dedicated worker thread running tasks in submission order.
///
/// Clones share the same worker. The worker exits once every clone is gone
/// and the queue is drained.
#[derive(Clone)]
pub struct SerialContext {
    name: Arc<str>,
    sender: mpsc::UnboundedSender<Task>,
}

impl SerialContext {
    pub fn new(name: impl Into<String>) -> Result<Self, ContextError> {
        let name: Arc<str> = Arc::from(name.into());
        let (sender, mut receiver) = mpsc::unbounded_channel::<Task>();

        let worker_name = Arc::clone(&name);
        thread::Builder::new()
            .name(name.to_string())
            .spawn(move || {
                debug!("Serial context {} started", worker_name);
                while let Some(task) = receiver.blocking_recv() {
                    run_isolated(&worker_name, task);
                }
                debug!("Serial context {} stopped", worker_name);
            })
            .map_err(ContextError::SpawnFailed)?;

        Ok(Self { name, sender })
    }

    pub fn shared(name: impl Into<String>) -> Result<SharedContext, ContextError> {
        Ok(Arc::new(Self::new(name)?))
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl ExecutionContext for SerialContext {
    fn execute(&self, task: Task) {
        if self.sender.send(task).is_err() {
            warn!("Serial context {} has no worker; task dropped", self.name);
        }
    }
}

impl std::fmt::Debug for SerialContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialContext").field("name", &self.name).finish()
    }
}

// ============================================================================
// POOL
// ============================================================================

/// Shuts an owned runtime down without blocking, so the last owner may be
/// dropped from inside one of the runtime's own workers.
struct OwnedRuntime(Option<Runtime>);

impl Drop for OwnedRuntime {
    fn drop(&mut self) {
        if let Some(runtime) = self.0.take() {
            runtime.shutdown_background();
        }
    }
}

/// Tasks run concurrently on a tokio worker pool; no ordering across tasks.
#[derive(Clone)]
pub struct PoolContext {
    handle: Handle,
    _runtime: Option<Arc<OwnedRuntime>>,
}

impl PoolContext {
    /// Build a pool with its own multi-threaded runtime
    pub fn new(workers: usize) -> Result<Self, ContextError> {
        if workers == 0 {
            return Err(ContextError::NoWorkers);
        }
        let runtime = Builder::new_multi_thread()
            .worker_threads(workers)
            .thread_name("bluecap-pool")
            .enable_time()
            .build()
            .map_err(ContextError::RuntimeBuild)?;
        debug!("Pool context started with {} workers", workers);
        Ok(Self {
            handle: runtime.handle().clone(),
            _runtime: Some(Arc::new(OwnedRuntime(Some(runtime)))),
        })
    }

    /// Borrow a runtime someone else owns (e.g. the CLI's `#[tokio::main]`)
    pub fn from_handle(handle: Handle) -> Self {
        Self {
            handle,
            _runtime: None,
        }
    }

    pub fn handle(&self) -> &Handle {
        &self.handle
    }

    pub fn shared(&self) -> SharedContext {
        Arc::new(self.clone())
    }

    /// Run `task` on the pool once `delay` has elapsed
    pub fn schedule_after(&self, delay: Duration, task: Task) {
        self.handle.spawn(async move {
            tokio::time::sleep(delay).await;
            run_isolated("pool", task);
        });
    }
}

impl ExecutionContext for PoolContext {
    fn execute(&self, task: Task) {
        self.handle.spawn(async move {
            run_isolated("pool", task);
        });
    }
}

// ============================================================================
// MAX STACK DEPTH
// ============================================================================

thread_local! {
    static TASK_DEPTH: Cell<usize> = const { Cell::new(0) };
}

/// Restores the thread's nesting depth even if the task unwinds
struct DepthGuard(usize);

impl DepthGuard {
    fn enter(depth: usize) -> Self {
        TASK_DEPTH.with(|d| d.set(depth + 1));
        Self(depth)
    }
}

impl Drop for DepthGuard {
    fn drop(&mut self) {
        TASK_DEPTH.with(|d| d.set(self.0));
    }
}

/// Runs inline until the per-thread nesting depth reaches `max_depth`, then
/// hands the task to `fallback`.
pub struct MaxStackDepthContext {
    max_depth: usize,
    fallback: SharedContext,
}

impl MaxStackDepthContext {
    pub fn new(max_depth: usize, fallback: SharedContext) -> Self {
        Self {
            max_depth,
            fallback,
        }
    }

    pub fn shared(max_depth: usize, fallback: SharedContext) -> SharedContext {
        Arc::new(Self::new(max_depth, fallback))
    }
}

impl ExecutionContext for MaxStackDepthContext {
    fn execute(&self, task: Task) {
        let depth = TASK_DEPTH.with(Cell::get);
        if depth < self.max_depth {
            let _restore = DepthGuard::enter(depth);
            run_isolated("max-stack-depth", task);
        } else {
            self.fallback.execute(task);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::mpsc as std_mpsc;

    const WAIT: Duration = Duration::from_secs(5);

    #[test]
    fn test_immediate_runs_inline() {
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        ImmediateContext.execute(Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_immediate_isolates_panics() {
        ImmediateContext.execute(Box::new(|| panic!("bad callback")));
        let ran = Arc::new(AtomicUsize::new(0));
        let r = Arc::clone(&ran);
        ImmediateContext.execute(Box::new(move || {
            r.fetch_add(1, Ordering::SeqCst);
        }));
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_immediate_reraises_already_completed_fault() {
        let outcome = std::panic::catch_unwind(|| {
            ImmediateContext.execute(Box::new(|| std::panic::panic_any(AlreadyCompletedFault)));
        });
        let payload = outcome.expect_err("fault must reach the caller");
        assert!(AlreadyCompletedFault::is_payload(payload.as_ref()));
    }

    #[test]
    fn test_serial_preserves_submission_order() {
        let serial = SerialContext::new("test.serial").unwrap();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = std_mpsc::channel();

        for i in 0..100 {
            let seen = Arc::clone(&seen);
            serial.execute(Box::new(move || seen.lock().push(i)));
        }
        serial.execute(Box::new(move || done_tx.send(()).unwrap()));

        done_rx.recv_timeout(WAIT).unwrap();
        assert_eq!(*seen.lock(), (0..100).collect::<Vec<_>>());
    }

    #[test]
    fn test_serial_survives_panicking_task() {
        let serial = SerialContext::new("test.serial.panic").unwrap();
        let (tx, rx) = std_mpsc::channel();

        serial.execute(Box::new(|| panic!("first task fails")));
        serial.execute(Box::new(move || tx.send(42).unwrap()));

        assert_eq!(rx.recv_timeout(WAIT).unwrap(), 42);
    }

    #[test]
    fn test_serial_runs_on_named_thread() {
        let serial = SerialContext::new("bluecap.test.worker").unwrap();
        assert_eq!(serial.name(), "bluecap.test.worker");
        let (tx, rx) = std_mpsc::channel();
        serial.execute(Box::new(move || {
            tx.send(thread::current().name().map(str::to_string)).unwrap();
        }));
        assert_eq!(
            rx.recv_timeout(WAIT).unwrap().as_deref(),
            Some("bluecap.test.worker")
        );
    }

    #[test]
    fn test_pool_rejects_zero_workers() {
        assert!(matches!(PoolContext::new(0), Err(ContextError::NoWorkers)));
    }

    #[test]
    fn test_pool_runs_all_tasks() {
        let pool = PoolContext::new(2).unwrap();
        let (tx, rx) = std_mpsc::channel();
        for i in 0..20 {
            let tx = tx.clone();
            pool.execute(Box::new(move || tx.send(i).unwrap()));
        }
        let mut got: Vec<i32> = (0..20).map(|_| rx.recv_timeout(WAIT).unwrap()).collect();
        got.sort();
        assert_eq!(got, (0..20).collect::<Vec<_>>());
    }

    #[test]
    fn test_pool_schedule_after() {
        let pool = PoolContext::new(1).unwrap();
        let (tx, rx) = std_mpsc::channel();
        let started = std::time::Instant::now();
        pool.schedule_after(
            Duration::from_millis(30),
            Box::new(move || tx.send(()).unwrap()),
        );
        rx.recv_timeout(WAIT).unwrap();
        assert!(started.elapsed() >= Duration::from_millis(30));
    }

    #[test]
    fn test_max_stack_depth_falls_back() {
        let mut fallback = MockExecutionContext::new();
        fallback.expect_execute().times(1).returning(|task| task());
        let context: SharedContext = Arc::new(MaxStackDepthContext::new(2, Arc::new(fallback)));

        let depth_seen = Arc::new(AtomicUsize::new(0));

        fn nest(context: SharedContext, remaining: usize, depth_seen: Arc<AtomicUsize>) {
            if remaining == 0 {
                return;
            }
            let inner = Arc::clone(&context);
            context.execute(Box::new(move || {
                depth_seen.fetch_add(1, Ordering::SeqCst);
                nest(inner, remaining - 1, depth_seen);
            }));
        }

        // Depth 0 and 1 run inline, the third nested task goes to the fallback.
        nest(Arc::clone(&context), 3, Arc::clone(&depth_seen));
        assert_eq!(depth_seen.load(Ordering::SeqCst), 3);
    }
}
