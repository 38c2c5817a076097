use thiserror::Error;

use crate::rate_limit::RateLimitExceeded;

/// Coarse outcome of a failed tool invocation, used by the dispatcher to pick
/// a wire error code.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    NotFound,
    InvalidParams,
    RateLimited,
    ExecutionFailed,
}

#[derive(Debug, Error)]
pub enum ToolError {
    #[error("Unknown tool: {0}")]
    NotFound(String),

    #[error("{0}")]
    InvalidArguments(String),

    #[error(transparent)]
    RateLimited(#[from] RateLimitExceeded),

    #[error("{0}")]
    ExecutionFailed(#[from] anyhow::Error),
}

impl ToolError {
    pub fn invalid(message: impl Into<String>) -> Self {
        Self::InvalidArguments(message.into())
    }

    pub fn failed(message: impl Into<String>) -> Self {
        Self::ExecutionFailed(anyhow::anyhow!(message.into()))
    }

    pub fn kind(&self) -> FailureKind {
        match self {
            Self::NotFound(_) => FailureKind::NotFound,
            Self::InvalidArguments(_) => FailureKind::InvalidParams,
            Self::RateLimited(_) => FailureKind::RateLimited,
            Self::ExecutionFailed(_) => FailureKind::ExecutionFailed,
        }
    }
}
