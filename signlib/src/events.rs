use crate::delivery::SignedPackage;
use crate::error::JobError;

/// Where a job currently is in its pipeline. Published by the worker
/// through a watch channel; `Done` and `Aborted` are terminal.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum JobState {
    Queued,
    Staging,
    Invoking,
    Delivering,
    Done,
    Aborted,
}

impl JobState {
    pub fn is_terminal(self) -> bool {
        matches!(self, JobState::Done | JobState::Aborted)
    }
}

/// Caller-facing view of a job, derived from its state and (once
/// terminal) its outcome.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum JobStatus {
    Queued,
    Staging,
    Invoking,
    Delivering,
    Succeeded,
    Failed {
        kind: &'static str,
        detail: String,
    },
}

/// Terminal result of one job. Success hands over the signed package
/// (which owns the workspace until delivery finishes); every failure
/// carries the taxonomy error that ended the job.
pub enum JobOutcome {
    Success(SignedPackage),
    Failure(JobError),
}
