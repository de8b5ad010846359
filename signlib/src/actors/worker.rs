use super::coordinator::messages::CoordinatorMessage;
use crate::artifact::{ArtifactStore, Role};
use crate::delivery::SignedPackage;
use crate::error::{JobError, Result};
use crate::events::{JobOutcome, JobState};
use crate::invoker::{InvocationStatus, SignerInvoker};
use crate::types::{JobId, JobInputs};
use crate::workspace::WorkspaceManager;
use tokio::select;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

/// Runs one job's pipeline: wait for an invocation slot, stage the
/// uploads, run the signing tool, hand the output to delivery.
///
/// The pipeline future owns the workspace and the child process, so
/// dropping it (cancellation or the job deadline) kills the tool and
/// reclaims the directory in one motion.
pub(crate) struct Worker {
    pub job_id: JobId,
    pub inputs: JobInputs,
    pub deadline: Instant,
    /// Fires when the coordinator grants this job an invocation slot.
    pub start_rx: oneshot::Receiver<()>,
    pub workspaces: WorkspaceManager,
    pub store: ArtifactStore,
    pub invoker: SignerInvoker,
    pub state_tx: watch::Sender<JobState>,
    pub done_tx: mpsc::Sender<CoordinatorMessage>,
}

impl Worker {
    pub(crate) fn spawn(self, cancel_rx: oneshot::Receiver<()>) {
        tokio::spawn(self.run(cancel_rx));
    }

    async fn run(self, mut cancel_rx: oneshot::Receiver<()>) {
        let Worker {
            job_id,
            inputs,
            deadline,
            start_rx,
            workspaces,
            store,
            invoker,
            state_tx,
            done_tx,
        } = self;

        // the pipeline future owns the workspace and the child process;
        // leaving this scope drops it, so cleanup is done before the
        // coordinator hears about the outcome
        let outcome = {
            let pipeline = pipeline(job_id, inputs, start_rx, workspaces, store, invoker, &state_tx);
            tokio::pin!(pipeline);
            select! {
                _ = &mut cancel_rx => {
                    tracing::info!(%job_id, "job aborted by caller");
                    JobOutcome::Failure(JobError::Aborted)
                }
                res = tokio::time::timeout_at(deadline, &mut pipeline) => match res {
                    Ok(Ok(package)) => JobOutcome::Success(package),
                    Ok(Err(err)) => {
                        tracing::info!(%job_id, kind = err.kind(), %err, "job failed");
                        JobOutcome::Failure(err)
                    }
                    Err(_) => {
                        tracing::info!(%job_id, "job exceeded max lifetime");
                        JobOutcome::Failure(JobError::TimedOut)
                    }
                }
            }
        };

        state_tx.send_replace(match outcome {
            JobOutcome::Success(_) => JobState::Done,
            JobOutcome::Failure(_) => JobState::Aborted,
        });
        let _ = done_tx
            .send(CoordinatorMessage::Finished { job_id, outcome })
            .await;
    }
}

async fn pipeline(
    job_id: JobId,
    inputs: JobInputs,
    start_rx: oneshot::Receiver<()>,
    workspaces: WorkspaceManager,
    store: ArtifactStore,
    invoker: SignerInvoker,
    state_tx: &watch::Sender<JobState>,
) -> Result<SignedPackage> {
    // parked until the coordinator grants an invocation slot; grants are
    // issued strictly in admission order, so the queue is FIFO
    start_rx.await.map_err(|_| JobError::Aborted)?;

    state_tx.send_replace(JobState::Staging);
    let workspace = workspaces.allocate(job_id).await?;
    tracing::debug!(%job_id, path = %workspace.path().display(), "staging inputs");

    let JobInputs {
        package,
        certificate,
        profile,
        entitlements,
    } = inputs;
    // all roles staged concurrently, entitlements included: multipart
    // uploads arrive in caller-chosen field order, and bounded channels
    // would deadlock if we insisted on draining the roles sequentially
    tokio::try_join!(
        store.stage(&workspace, Role::Package, package),
        store.stage(&workspace, Role::Certificate, certificate),
        store.stage(&workspace, Role::Profile, profile),
        async {
            match entitlements {
                Some(source) => {
                    store
                        .stage_optional(&workspace, Role::Entitlements, source)
                        .await
                }
                None => Ok(None),
            }
        },
    )?;

    state_tx.send_replace(JobState::Invoking);
    let result = invoker.invoke(&workspace).await?;
    match result.status {
        InvocationStatus::Succeeded { output } => {
            state_tx.send_replace(JobState::Delivering);
            Ok(SignedPackage::new(output, workspace))
        }
        InvocationStatus::Failed { code } => {
            workspace.release().await;
            Err(JobError::ToolFailure {
                code,
                stderr: result.stderr,
            })
        }
        InvocationStatus::TimedOut => {
            workspace.release().await;
            Err(JobError::TimedOut)
        }
    }
}
