//! Failure injection for the mock repository
//!
//! Supports configurable failure injection for testing error paths.

use std::collections::HashMap;
use std::time::Duration;

use crate::repository::RepositoryError;

/// Repository operations that accept injected failures
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MockOp {
    CreateDeposition,
    AttachMetadata,
    OpenUpload,
    UploadChunk,
    CompleteUpload,
    Finalize,
    GetStatus,
    FetchRecord,
}

/// Failure configuration for an operation
#[derive(Debug, Clone)]
pub struct FailureConfig {
    /// Error to return (if any)
    pub error: Option<RepositoryError>,
    /// Delay to add before responding
    pub delay: Option<Duration>,
    /// Number of times to fail before succeeding (None = always fail)
    pub fail_count: Option<u32>,
    /// Only calls at this byte offset are affected (chunk uploads)
    pub at_offset: Option<u64>,
}

impl FailureConfig {
    /// Create a config that returns an error
    pub fn error(error: RepositoryError) -> Self {
        Self {
            error: Some(error),
            delay: None,
            fail_count: None,
            at_offset: None,
        }
    }

    /// A retryable failure (timeout, connection reset, 5xx)
    pub fn transient(message: impl Into<String>) -> Self {
        Self::error(RepositoryError::Transient(message.into()))
    }

    /// Create a config that just adds delay
    pub fn delay(duration: Duration) -> Self {
        Self {
            error: None,
            delay: Some(duration),
            fail_count: None,
            at_offset: None,
        }
    }

    /// Set the number of times to fail before succeeding
    pub fn with_fail_count(mut self, count: u32) -> Self {
        self.fail_count = Some(count);
        self
    }

    pub fn at_offset(mut self, offset: u64) -> Self {
        self.at_offset = Some(offset);
        self
    }
}

/// Failure injector for the mock repository
#[derive(Debug, Default)]
pub struct FailureInjector {
    /// Per-operation failure configs
    configs: HashMap<MockOp, FailureConfig>,
    /// Matching call counts per operation (for fail_count tracking)
    call_counts: HashMap<MockOp, u32>,
}

impl FailureInjector {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inject a failure for an operation, replacing any earlier one
    pub fn inject(&mut self, op: MockOp, config: FailureConfig) {
        self.configs.insert(op, config);
        self.call_counts.insert(op, 0);
    }

    pub fn clear(&mut self) {
        self.configs.clear();
        self.call_counts.clear();
    }

    pub fn clear_op(&mut self, op: MockOp) {
        self.configs.remove(&op);
        self.call_counts.remove(&op);
    }

    /// Check whether a call should fail. Calls at a different offset than
    /// the config targets are not counted.
    pub fn check(&mut self, op: MockOp, offset: Option<u64>) -> Option<FailureConfig> {
        let config = self.configs.get(&op)?;
        if config.at_offset.is_some() && config.at_offset != offset {
            return None;
        }

        let count = self.call_counts.entry(op).or_insert(0);
        *count += 1;
        if let Some(fail_limit) = config.fail_count {
            if *count > fail_limit {
                return None;
            }
        }
        Some(config.clone())
    }
}
