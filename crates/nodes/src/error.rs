//! Node-level error type.

use std::time::Duration;

use thiserror::Error;

/// Errors returned by a node's `execute` method.
///
/// The dispatcher uses the variant to decide retry behaviour:
/// - `Invalid`  : bad or missing input; the task fails without retry.
/// - `Retryable`: the task is re-queued with exponential back-off while its
///   retry budget lasts.
/// - `Fatal`    : the task is immediately marked as failed.
#[derive(Debug, Error, Clone, PartialEq)]
pub enum NodeError {
    #[error("invalid node input: {0}")]
    Invalid(String),

    /// Transient failure.  `retry_after` is a hint; the dispatcher only
    /// honours it when it is longer than its own back-off.
    #[error("retryable node error: {message}")]
    Retryable {
        message: String,
        retry_after: Option<Duration>,
    },

    /// Permanent failure; no retry should be attempted.
    #[error("fatal node error: {0}")]
    Fatal(String),
}

impl NodeError {
    pub fn retryable(message: impl Into<String>) -> Self {
        Self::Retryable {
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }

    /// The message without the variant prefix, as stored on the task row.
    pub fn message(&self) -> &str {
        match self {
            Self::Invalid(msg) | Self::Fatal(msg) => msg,
            Self::Retryable { message, .. } => message,
        }
    }
}
