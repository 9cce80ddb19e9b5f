//! SDK error type.

use std::time::Duration;

/// Top-level SDK error.
#[derive(thiserror::Error, Debug)]
pub enum NodeSdkError {
    /// Malformed input: unknown behavior name, behavior declared twice,
    /// instance of the wrong kind, missing protocol.
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    /// The client or its protocol is in a state that forbids the operation.
    #[error("invalid state: {0}")]
    InvalidState(String),
    #[error("timeout after {0:?}")]
    Timeout(Duration),
    /// Unrecoverable protocol run failure.
    #[error("fatal: {0}")]
    Fatal(String),
    /// The task scope's sentinel is gone; the scope must be rebuilt.
    #[error("task scope {0} is dead")]
    DeadScope(String),
    #[error("cancelled")]
    Cancelled,
    #[error("service {topic}: {message}")]
    Service { topic: String, message: String },
    #[error("connection: {0}")]
    Connection(String),
    #[error("config: {0}")]
    Config(String),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("{0}")]
    Other(#[from] anyhow::Error),
}

impl NodeSdkError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, NodeSdkError::Cancelled)
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, NodeSdkError::Timeout(_))
    }

    /// Errors a retry can never fix.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            NodeSdkError::Fatal(_)
                | NodeSdkError::InvalidArgument(_)
                | NodeSdkError::InvalidState(_)
                | NodeSdkError::Cancelled
                | NodeSdkError::DeadScope(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, NodeSdkError>;
