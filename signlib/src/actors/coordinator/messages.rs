use crate::error::Result;
use crate::events::{JobOutcome, JobStatus};
use crate::types::{JobId, JobInputs};
use tokio::sync::oneshot;

pub enum CoordinatorMessage {
    Submit {
        inputs: JobInputs,
        response: oneshot::Sender<Result<JobId>>,
    },
    GetStatus {
        job_id: JobId,
        response: oneshot::Sender<Result<JobStatus>>,
    },
    AwaitOutcome {
        job_id: JobId,
        response: oneshot::Sender<Result<JobOutcome>>,
    },
    Cancel {
        job_id: JobId,
        response: oneshot::Sender<Result<()>>,
    },
    /// Sent by a worker when its job reaches a terminal state.
    Finished {
        job_id: JobId,
        outcome: JobOutcome,
    },
    /// Sent by the expiry timer for an outcome nobody collected.
    Expire {
        job_id: JobId,
    },
}
