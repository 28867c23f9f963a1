//! Structured error types for the ema runtime core.

use thiserror::Error;

/// Primary error type returned by the core's public operations.
#[derive(Error, Debug, Clone)]
pub enum EmaError {
    /// A public operation received input that fails its preconditions.
    /// Rejected synchronously; does not mutate state.
    #[error("validation failed: {reason}")]
    Validation { reason: String },

    /// Cancellation was observed, either from an explicit abort or an
    /// upstream signal. Not retried.
    #[error("cancelled: {context}")]
    Cancelled { context: String },

    /// A retry policy ran out of attempts.
    #[error("retry exhausted after {attempts} attempt(s): {last_error}")]
    RetryExhausted { attempts: u32, last_error: String },

    /// A tool call failed; captured as a `ToolResult`, never propagated
    /// out of the agent loop.
    #[error("tool '{tool}' failed: {reason}")]
    ToolFailure { tool: String, reason: String },

    /// A tool name with no registered implementation was requested.
    #[error("unknown tool: {tool}")]
    UnknownTool { tool: String },

    /// A buffer write into the conversation store failed.
    #[error("persistence failed: {reason}")]
    Persistence { reason: String },

    /// The agent loop exhausted its step budget without a terminal
    /// decision from the model.
    #[error("task couldn't be completed after {max_steps} steps")]
    StepLimitExceeded { max_steps: usize },

    /// A scheduler operation failed (unknown job, unsupported schedule,
    /// store failure).
    #[error("scheduler error: {reason}")]
    Scheduler { reason: String },
}

impl EmaError {
    pub fn validation(reason: impl Into<String>) -> Self {
        Self::Validation { reason: reason.into() }
    }

    pub fn cancelled(context: impl Into<String>) -> Self {
        Self::Cancelled { context: context.into() }
    }

    pub fn scheduler(reason: impl Into<String>) -> Self {
        Self::Scheduler { reason: reason.into() }
    }

    /// True for errors that represent a cooperative cancellation rather
    /// than a genuine failure.
    pub fn is_cancellation(&self) -> bool {
        matches!(self, EmaError::Cancelled { .. })
    }
}

pub type EmaResult<T> = Result<T, EmaError>;
