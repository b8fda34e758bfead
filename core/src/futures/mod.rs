// Futures module: deferred single and repeated results

pub mod cancel;
pub mod context;
pub mod error;
pub mod future;
pub mod sequence;
pub mod stream;

pub use cancel::CancelToken;
pub use context::{
    ContextError, ExecutionContext, ImmediateContext, MaxStackDepthContext, PoolContext,
    SerialContext, SharedContext, Task,
};
pub use error::{result_from_parts, AlreadyCompletedFault, FutureError, FutureResult};
pub use future::{Completion, Future, Promise};
pub use sequence::{
    first_completed, fold, fold_with_depth, sequence, traverse, DEFAULT_MAX_STACK_DEPTH,
};
pub use stream::{FutureStream, StreamPromise, Subscription, UNBOUNDED_HISTORY_LIMIT};
