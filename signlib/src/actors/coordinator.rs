mod actor;
pub(super) mod messages;

use self::actor::JobCoordinator;
use self::messages::CoordinatorMessage::{self, AwaitOutcome, Cancel, GetStatus, Submit};
use crate::config::Config;
use crate::error::{JobError, Result};
use crate::events::{JobOutcome, JobStatus};
use crate::types::{JobId, JobInputs};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// A `JobCoordinator` which admits signing jobs, runs them through the
/// staging/invocation pipeline on a bounded slot pool, and hands back
/// their outcomes.
///
/// This struct is actually an actor handle; the real work is done in the
/// actor spawned by `JobCoordinatorHandle::spawn`. The handle can be
/// cloned freely across tasks without any extra synchronization — the
/// actor's mailbox is the only shared state.
#[derive(Clone)]
pub struct JobCoordinatorHandle {
    sender: mpsc::Sender<CoordinatorMessage>,
}

impl JobCoordinatorHandle {
    /// Spawn a new coordinator with the given configuration.
    ///
    /// The mailbox is sized past the admission bound so workers reporting
    /// completion never contend with callers for capacity.
    pub fn spawn(config: Config) -> Self {
        let capacity = config.max_concurrent_invocations + config.max_queue_depth + 16;
        let (sender, receiver) = mpsc::channel(capacity);
        JobCoordinator::spawn(config, receiver, sender.clone());
        Self { sender }
    }

    /// Admit a new signing job. Returns its id immediately, or
    /// `Overloaded` once the pool plus queue are at capacity.
    pub async fn submit(&self, inputs: JobInputs) -> Result<JobId> {
        let (tx, rx) = oneshot::channel();
        let msg = Submit {
            inputs,
            response: tx,
        };
        self.sender.send(msg).await.expect("JobCoordinator exited");
        rx.await.expect("JobCoordinator exited")
    }

    pub async fn status(&self, job_id: JobId) -> Result<JobStatus> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(GetStatus {
                job_id,
                response: tx,
            })
            .await
            .expect("JobCoordinator exited");
        rx.await.expect("JobCoordinator exited")
    }

    /// Suspend until the job reaches a terminal state, or until `wait`
    /// elapses. A timeout here reports `TimedOut` to this caller only;
    /// the underlying job keeps running. A terminal outcome is handed out
    /// exactly once.
    pub async fn await_outcome(&self, job_id: JobId, wait: Duration) -> Result<JobOutcome> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(AwaitOutcome {
                job_id,
                response: tx,
            })
            .await
            .expect("JobCoordinator exited");
        match tokio::time::timeout(wait, rx).await {
            Ok(Ok(result)) => result,
            // our pending wait was displaced by a newer one for this job
            Ok(Err(_)) => Err(JobError::Aborted),
            Err(_) => Err(JobError::TimedOut),
        }
    }

    /// Cancel a job. Before it holds an invocation slot this removes it
    /// from the queue with no side effects; afterwards the signing tool
    /// is terminated best-effort. Cancelling an already-terminal job is a
    /// no-op.
    pub async fn cancel(&self, job_id: JobId) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(Cancel {
                job_id,
                response: tx,
            })
            .await
            .expect("JobCoordinator exited");
        rx.await.expect("JobCoordinator exited")
    }
}
