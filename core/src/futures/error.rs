//! Error taxonomy for deferred results
//!
//! Every Future and FutureStream entry carries a `FutureResult<T>`. Failures
//! travel through `map`, `flat_map` and `and_then` untouched and are only
//! intercepted by the `recover` family.

use std::any::Any;
use std::error::Error as StdError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

/// Result carried by a completed Future or a stream entry
pub type FutureResult<T> = Result<T, FutureError>;

/// Errors observed by Future and FutureStream consumers
#[derive(Debug, Clone, Error)]
pub enum FutureError {
    /// A collaborator's native error (Bluetooth stack, location service, ...)
    #[error("Operation failed: {0}")]
    OperationFailed(Arc<dyn StdError + Send + Sync>),

    #[error("Promise already completed")]
    AlreadyCompleted,

    /// Only ever observed by the subscription that was cancelled
    #[error("Subscription cancelled")]
    Cancelled,

    #[error("No such element")]
    NoSuchElement,

    #[error("Invalid value")]
    InvalidValue,

    #[error("Callback panicked: {0}")]
    Panicked(String),

    #[error("Timed out after {0:?}")]
    Timeout(Duration),

    #[error("{0}")]
    Custom(String),
}

impl FutureError {
    /// Wrap a collaborator error
    pub fn operation_failed<E>(error: E) -> Self
    where
        E: StdError + Send + Sync + 'static,
    {
        FutureError::OperationFailed(Arc::new(error))
    }

    /// Build an ad-hoc domain error
    pub fn custom(message: impl Into<String>) -> Self {
        FutureError::Custom(message.into())
    }

    /// Convert a caught panic payload into a failure
    pub fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        FutureError::Panicked(message)
    }

    pub fn is_cancelled(&self) -> bool {
        matches!(self, FutureError::Cancelled)
    }
}

impl PartialEq for FutureError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (FutureError::OperationFailed(a), FutureError::OperationFailed(b)) => {
                a.to_string() == b.to_string()
            }
            (FutureError::AlreadyCompleted, FutureError::AlreadyCompleted) => true,
            (FutureError::Cancelled, FutureError::Cancelled) => true,
            (FutureError::NoSuchElement, FutureError::NoSuchElement) => true,
            (FutureError::InvalidValue, FutureError::InvalidValue) => true,
            (FutureError::Panicked(a), FutureError::Panicked(b)) => a == b,
            (FutureError::Timeout(a), FutureError::Timeout(b)) => a == b,
            (FutureError::Custom(a), FutureError::Custom(b)) => a == b,
            _ => false,
        }
    }
}

impl From<anyhow::Error> for FutureError {
    fn from(err: anyhow::Error) -> Self {
        let boxed: Box<dyn StdError + Send + Sync> = err.into();
        FutureError::OperationFailed(Arc::from(boxed))
    }
}

/// Convert a callback-style `(value, error)` pair into a result.
///
/// A value wins over an error; when both are missing the producer broke its
/// contract and the result is `InvalidValue`.
pub fn result_from_parts<T>(value: Option<T>, error: Option<FutureError>) -> FutureResult<T> {
    match (value, error) {
        (Some(value), _) => Ok(value),
        (None, Some(error)) => Err(error),
        (None, None) => Err(FutureError::InvalidValue),
    }
}

/// Panic payload raised by a strict completion of an already completed
/// Promise.
///
/// Unlike ordinary callback panics this one is never isolated: every catch
/// point in the crate re-raises it, so it reaches whoever drives the
/// offending context.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AlreadyCompletedFault;

impl fmt::Display for AlreadyCompletedFault {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", FutureError::AlreadyCompleted)
    }
}

impl AlreadyCompletedFault {
    /// Whether a caught panic payload is this fault
    pub fn is_payload(payload: &(dyn Any + Send)) -> bool {
        payload.is::<AlreadyCompletedFault>()
    }
}

/// Resume unwinding for faults that must never be contained
pub(crate) fn rethrow_fault(payload: Box<dyn Any + Send>) -> Box<dyn Any + Send> {
    if AlreadyCompletedFault::is_payload(payload.as_ref()) {
        std::panic::resume_unwind(payload);
    }
    payload
}

/// Run `f`, turning a panic into `Err(Panicked)`.
///
/// `AlreadyCompletedFault` keeps unwinding.
pub(crate) fn catch_panic<R>(f: impl FnOnce() -> FutureResult<R>) -> FutureResult<R> {
    std::panic::catch_unwind(std::panic::AssertUnwindSafe(f))
        .unwrap_or_else(|payload| Err(FutureError::from_panic(rethrow_fault(payload))))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug, Error)]
    #[error("gatt status 0x{0:02x}")]
    struct GattError(u8);

    #[test]
    fn test_operation_failed_wraps_cause() {
        let err = FutureError::operation_failed(GattError(0x0a));
        assert_eq!(err.to_string(), "Operation failed: gatt status 0x0a");
        assert_eq!(err, FutureError::operation_failed(GattError(0x0a)));
        assert_ne!(err, FutureError::operation_failed(GattError(0x0b)));
    }

    #[test]
    fn test_from_anyhow() {
        let err: FutureError = anyhow::anyhow!("characteristic not found").into();
        match err {
            FutureError::OperationFailed(cause) => {
                assert_eq!(cause.to_string(), "characteristic not found")
            }
            other => panic!("Unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_result_from_parts() {
        assert_eq!(result_from_parts(Some(1), None), Ok(1));
        assert_eq!(
            result_from_parts(Some(1), Some(FutureError::Cancelled)),
            Ok(1)
        );
        assert_eq!(
            result_from_parts::<i32>(None, Some(FutureError::custom("boom"))),
            Err(FutureError::custom("boom"))
        );
        assert_eq!(
            result_from_parts::<i32>(None, None),
            Err(FutureError::InvalidValue)
        );
    }

    #[test]
    fn test_catch_panic_converts_payloads() {
        let static_msg: FutureResult<()> = catch_panic(|| panic!("static"));
        assert_eq!(static_msg, Err(FutureError::Panicked("static".into())));

        let owned: FutureResult<()> = catch_panic(|| panic!("{}", String::from("owned")));
        assert_eq!(owned, Err(FutureError::Panicked("owned".into())));

        assert_eq!(catch_panic(|| Ok(5)), Ok(5));
    }

    #[test]
    fn test_catch_panic_rethrows_already_completed_fault() {
        let outcome = std::panic::catch_unwind(|| {
            let _: FutureResult<()> =
                catch_panic(|| std::panic::panic_any(AlreadyCompletedFault));
        });
        let payload = outcome.expect_err("fault must escape catch_panic");
        assert!(AlreadyCompletedFault::is_payload(payload.as_ref()));
        assert_eq!(
            AlreadyCompletedFault.to_string(),
            FutureError::AlreadyCompleted.to_string()
        );
    }

    #[test]
    fn test_variants_are_distinct() {
        assert_ne!(FutureError::Cancelled, FutureError::AlreadyCompleted);
        assert!(FutureError::Cancelled.is_cancelled());
        assert!(!FutureError::NoSuchElement.is_cancelled());
        assert_eq!(
            FutureError::Timeout(Duration::from_millis(5)).to_string(),
            "Timed out after 5ms"
        );
    }
}
