// Bluecap Core: deferred results for BLE and location plumbing
//
// Every asynchronous operation (power-on, scan, connect, characteristic
// read/write, notifications, region updates) is expressed as a Future or a
// FutureStream and chained through combinators on an explicit context.

pub mod config;
pub mod futures;

pub use config::{ContextSettings, ExecutionContexts, SettingsError};
pub use crate::futures::{
    CancelToken, ExecutionContext, Future, FutureError, FutureResult, FutureStream,
    ImmediateContext, PoolContext, Promise, SerialContext, SharedContext, StreamPromise,
    Subscription,
};
