//! Error objects carried by failed runs and steps

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Structured error recorded on run and step entities and inside
/// `run_failed` / `step_failed` / `step_retrying` events.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorObject {
    /// Human-readable message
    pub message: String,

    /// Captured stack or backtrace, when available
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stack: Option<String>,

    /// Structured kind for programmatic handling (e.g. "fatal")
    #[serde(skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
}

impl ErrorObject {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            stack: None,
            kind: None,
        }
    }

    pub fn with_kind(mut self, kind: impl Into<String>) -> Self {
        self.kind = Some(kind.into());
        self
    }

    pub fn with_stack(mut self, stack: impl Into<String>) -> Self {
        self.stack = Some(stack.into());
        self
    }
}

impl std::fmt::Display for ErrorObject {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

/// Failure raised by a user step body
///
/// `Fatal` terminates the step immediately; `Retryable` lets the executor
/// schedule another attempt, optionally no earlier than `retry_after`.
/// Any other error a step body produces is treated as retryable.
#[derive(Debug, Clone)]
pub enum StepFailure {
    Fatal(ErrorObject),
    Retryable {
        error: ErrorObject,
        retry_after: Option<DateTime<Utc>>,
    },
}

impl StepFailure {
    /// Create a fatal failure: no further attempts
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::Fatal(ErrorObject::new(message).with_kind("fatal"))
    }

    /// Create a retryable failure
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            error: ErrorObject::new(message),
            retry_after: None,
        }
    }

    /// Create a retryable failure that may not retry before `at`
    pub fn retryable_after(message: impl Into<String>, at: DateTime<Utc>) -> Self {
        Self::Retryable {
            error: ErrorObject::new(message),
            retry_after: Some(at),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Fatal(_))
    }

    pub fn error_object(&self) -> &ErrorObject {
        match self {
            Self::Fatal(error) => error,
            Self::Retryable { error, .. } => error,
        }
    }

    pub fn retry_after(&self) -> Option<DateTime<Utc>> {
        match self {
            Self::Fatal(_) => None,
            Self::Retryable { retry_after, .. } => *retry_after,
        }
    }
}

impl std::fmt::Display for StepFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.error_object().message)
    }
}

impl std::error::Error for StepFailure {}

impl From<anyhow::Error> for StepFailure {
    fn from(err: anyhow::Error) -> Self {
        Self::Retryable {
            error: ErrorObject::new(err.to_string()),
            retry_after: None,
        }
    }
}
