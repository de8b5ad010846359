use crate::artifact::Role;
use std::result;
use thiserror::Error;

/// Everything that can terminate a signing job. None of these are retried
/// automatically: re-running the tool against credentials it may already
/// have consumed risks corrupt or duplicate output, so each failure is
/// surfaced verbatim to the caller.
#[derive(Error, Debug, Clone)]
pub enum JobError {
    #[error("invalid {role} artifact: {reason}")]
    InvalidArtifact { role: Role, reason: String },

    #[error("{role} upload exceeds the {limit} byte limit")]
    PayloadTooLarge { role: Role, limit: u64 },

    #[error("resource exhausted: {0}")]
    ResourceExhausted(String),

    #[error("signing tool failed (exit {code:?}): {stderr}")]
    ToolFailure { code: Option<i32>, stderr: String },

    #[error("deadline exceeded")]
    TimedOut,

    #[error("job queue is full")]
    Overloaded,

    #[error("job was aborted")]
    Aborted,

    #[error("no such job exists")]
    DoesNotExist,
}

impl JobError {
    /// Stable machine-readable failure kind, used for `failed:<kind>`
    /// statuses on the wire.
    pub fn kind(&self) -> &'static str {
        match self {
            JobError::InvalidArtifact { .. } => "invalid_artifact",
            JobError::PayloadTooLarge { .. } => "payload_too_large",
            JobError::ResourceExhausted(_) => "resource_exhausted",
            JobError::ToolFailure { .. } => "tool_failure",
            JobError::TimedOut => "timed_out",
            JobError::Overloaded => "overloaded",
            JobError::Aborted => "aborted",
            JobError::DoesNotExist => "does_not_exist",
        }
    }
}

pub type Result<T> = result::Result<T, JobError>;
