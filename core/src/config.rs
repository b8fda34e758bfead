//! Execution context settings
//!
//! Contexts are built once at startup from `ContextSettings` and handed to
//! whoever registers callbacks. Nothing here is a process-wide singleton.

use crate::futures::{
    ContextError, ImmediateContext, PoolContext, SerialContext, SharedContext, StreamPromise,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::runtime::Handle;
use tracing::info;

// ============================================================================
// ERROR TYPES
// ============================================================================

/// Errors that can occur during settings validation or context construction
#[derive(Debug, Error)]
pub enum SettingsError {
    #[error("Invalid pool size: must be > 0")]
    InvalidPoolWorkers,

    #[error("Invalid stream capacity: must be > 0 when set")]
    InvalidStreamCapacity,

    #[error("Invalid max stack depth: must be > 0")]
    InvalidStackDepth,

    #[error("Invalid serial context name: cannot be empty")]
    EmptySerialName,

    #[error("Failed to build execution contexts: {0}")]
    Context(#[from] ContextError),
}

// ============================================================================
// SETTINGS
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextSettings {
    /// Worker threads in the shared pool context
    pub pool_workers: usize,

    /// Thread name of the serial context
    pub serial_name: String,

    /// Per-subscription backlog bound for new streams (None = unbounded)
    pub stream_capacity: Option<usize>,

    /// Inline nesting allowed before `fold` hops to the pool
    pub max_stack_depth: usize,
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            pool_workers: 4,
            serial_name: "bluecap.futures".to_string(),
            stream_capacity: None,
            max_stack_depth: crate::futures::DEFAULT_MAX_STACK_DEPTH,
        }
    }
}

impl ContextSettings {
    pub fn validate(&self) -> Result<(), SettingsError> {
        if self.pool_workers == 0 {
            return Err(SettingsError::InvalidPoolWorkers);
        }

        if self.stream_capacity == Some(0) {
            return Err(SettingsError::InvalidStreamCapacity);
        }

        if self.max_stack_depth == 0 {
            return Err(SettingsError::InvalidStackDepth);
        }

        if self.serial_name.trim().is_empty() {
            return Err(SettingsError::EmptySerialName);
        }

        Ok(())
    }
}

// ============================================================================
// CONTEXTS
// ============================================================================

/// The application's execution contexts, built once
#[derive(Clone)]
pub struct ExecutionContexts {
    immediate: SharedContext,
    serial: SharedContext,
    pool: PoolContext,
    stream_capacity: Option<usize>,
    max_stack_depth: usize,
}

impl ExecutionContexts {
    /// Build contexts with a dedicated pool runtime
    pub fn from_settings(settings: &ContextSettings) -> Result<Self, SettingsError> {
        settings.validate()?;
        let pool = PoolContext::new(settings.pool_workers)?;
        Self::assemble(settings, pool)
    }

    /// Build contexts whose pool borrows an existing tokio runtime
    pub fn from_settings_on(
        settings: &ContextSettings,
        handle: Handle,
    ) -> Result<Self, SettingsError> {
        settings.validate()?;
        Self::assemble(settings, PoolContext::from_handle(handle))
    }

    fn assemble(settings: &ContextSettings, pool: PoolContext) -> Result<Self, SettingsError> {
        let serial = SerialContext::shared(settings.serial_name.clone())?;
        info!(
            "Execution contexts ready: serial={}, pool_workers={}, stream_capacity={:?}",
            settings.serial_name, settings.pool_workers, settings.stream_capacity
        );
        Ok(Self {
            immediate: ImmediateContext::shared(),
            serial,
            pool,
            stream_capacity: settings.stream_capacity,
            max_stack_depth: settings.max_stack_depth,
        })
    }

    pub fn immediate(&self) -> SharedContext {
        self.immediate.clone()
    }

    /// FIFO context; use it for anything that touches presentation state
    pub fn serial(&self) -> SharedContext {
        self.serial.clone()
    }

    pub fn pool(&self) -> SharedContext {
        self.pool.shared()
    }

    /// The pool itself, for timer-backed producers
    pub fn pool_context(&self) -> &PoolContext {
        &self.pool
    }

    pub fn stream_capacity(&self) -> Option<usize> {
        self.stream_capacity
    }

    pub fn max_stack_depth(&self) -> usize {
        self.max_stack_depth
    }

    /// New stream bounded by the configured capacity
    pub fn stream_promise<T>(&self) -> StreamPromise<T>
    where
        T: Clone + Send + 'static,
    {
        StreamPromise::new(self.stream_capacity)
    }
}

impl std::fmt::Debug for ExecutionContexts {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExecutionContexts")
            .field("stream_capacity", &self.stream_capacity)
            .field("max_stack_depth", &self.max_stack_depth)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::futures::Future;
    use std::time::Duration;

    #[test]
    fn test_default_settings() {
        let settings = ContextSettings::default();
        assert_eq!(settings.pool_workers, 4);
        assert_eq!(settings.serial_name, "bluecap.futures");
        assert_eq!(settings.stream_capacity, None);
        assert_eq!(settings.max_stack_depth, 20);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_zero_values() {
        let mut settings = ContextSettings {
            pool_workers: 0,
            ..Default::default()
        };
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::InvalidPoolWorkers)
        ));

        settings.pool_workers = 1;
        settings.stream_capacity = Some(0);
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::InvalidStreamCapacity)
        ));

        settings.stream_capacity = Some(8);
        settings.max_stack_depth = 0;
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::InvalidStackDepth)
        ));

        settings.max_stack_depth = 4;
        settings.serial_name = "  ".into();
        assert!(matches!(
            settings.validate(),
            Err(SettingsError::EmptySerialName)
        ));
    }

    #[test]
    fn test_partial_json_uses_defaults() {
        let settings: ContextSettings =
            serde_json::from_str(r#"{"stream_capacity": 16}"#).unwrap();
        assert_eq!(settings.stream_capacity, Some(16));
        assert_eq!(settings.pool_workers, 4);
    }

    #[test]
    fn test_contexts_from_settings() {
        let settings = ContextSettings {
            pool_workers: 1,
            serial_name: "bluecap.test.config".into(),
            stream_capacity: Some(3),
            ..Default::default()
        };
        let contexts = ExecutionContexts::from_settings(&settings).unwrap();
        assert_eq!(contexts.stream_capacity(), Some(3));
        assert_eq!(contexts.stream_promise::<u8>().stream().capacity(), Some(3));

        let on_serial = Future::spawn(&contexts.serial(), || {
            Ok(std::thread::current().name().map(str::to_string))
        });
        assert_eq!(
            on_serial.wait_timeout(Duration::from_secs(5)),
            Some(Ok(Some("bluecap.test.config".to_string())))
        );

        let on_pool = Future::spawn(&contexts.pool(), || Ok(7));
        assert_eq!(on_pool.wait_timeout(Duration::from_secs(5)), Some(Ok(7)));
    }

    #[test]
    fn test_invalid_settings_build_nothing() {
        let settings = ContextSettings {
            max_stack_depth: 0,
            ..Default::default()
        };
        assert!(ExecutionContexts::from_settings(&settings).is_err());
    }

    #[tokio::test]
    async fn test_contexts_on_existing_runtime() {
        let contexts = ExecutionContexts::from_settings_on(
            &ContextSettings::default(),
            tokio::runtime::Handle::current(),
        )
        .unwrap();
        let value = Future::spawn(&contexts.pool(), || Ok("pooled")).await;
        assert_eq!(value, Ok("pooled"));
    }
}
