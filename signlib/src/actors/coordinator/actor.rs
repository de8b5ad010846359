use super::messages::CoordinatorMessage;
use crate::actors::worker::Worker;
use crate::artifact::ArtifactStore;
use crate::config::Config;
use crate::error::{JobError, Result};
use crate::events::{JobOutcome, JobState, JobStatus};
use crate::invoker::SignerInvoker;
use crate::types::{JobId, JobInputs};
use crate::workspace::WorkspaceManager;
use std::collections::{HashMap, VecDeque};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

/// Grace period after a job's deadline during which an uncollected
/// terminal outcome can still be fetched before its workspace is
/// reclaimed.
const OUTCOME_GRACE: Duration = Duration::from_secs(5);

pub struct JobCoordinator {
    inbox: mpsc::Receiver<CoordinatorMessage>,
    /// Cloned into workers and expiry timers so they can report back.
    notify_tx: mpsc::Sender<CoordinatorMessage>,
    config: Config,
    workspaces: WorkspaceManager,
    store: ArtifactStore,
    invoker: SignerInvoker,
    /// Invocation slots not currently held by a running job. The
    /// coordinator grants them itself, in admission order, so the queue
    /// is FIFO by construction rather than by scheduler timing.
    free_slots: usize,
    /// Admitted jobs waiting for a slot grant, in admission order.
    wait_queue: VecDeque<JobId>,
    jobs: HashMap<JobId, JobEntry>,
    /// Jobs admitted but not yet terminal.
    active: usize,
}

struct JobEntry {
    state_rx: watch::Receiver<JobState>,
    cancel_tx: Option<oneshot::Sender<()>>,
    /// Grants the worker its invocation slot; consumed on dispatch.
    start_tx: Option<oneshot::Sender<()>>,
    holds_slot: bool,
    outcome: Option<JobOutcome>,
    waiter: Option<oneshot::Sender<Result<JobOutcome>>>,
    deadline: Instant,
}

impl JobCoordinator {
    pub fn spawn(
        config: Config,
        inbox: mpsc::Receiver<CoordinatorMessage>,
        notify_tx: mpsc::Sender<CoordinatorMessage>,
    ) {
        let workspaces = WorkspaceManager::new(config.workspace_root.clone());
        let store = ArtifactStore::new(config.upload_limits);
        let invoker = SignerInvoker::new(&config);
        let actor = Self {
            inbox,
            notify_tx,
            workspaces,
            store,
            invoker,
            free_slots: config.max_concurrent_invocations,
            wait_queue: VecDeque::new(),
            jobs: HashMap::new(),
            active: 0,
            config,
        };
        tokio::spawn(async move { actor.run().await });
    }

    async fn run(mut self) {
        // reclaim workspaces orphaned by an earlier crash
        if let Err(err) = self
            .workspaces
            .sweep_stale(self.config.max_job_lifetime)
            .await
        {
            tracing::warn!(%err, "startup workspace sweep failed");
        }

        use CoordinatorMessage::*;
        while let Some(msg) = self.inbox.recv().await {
            match msg {
                Submit { inputs, response } => {
                    self.submit(inputs, response);
                }
                GetStatus { job_id, response } => {
                    let _ = response.send(self.job_status(job_id));
                }
                AwaitOutcome { job_id, response } => {
                    self.await_outcome(job_id, response);
                }
                Cancel { job_id, response } => {
                    let _ = response.send(self.cancel(job_id));
                }
                Finished { job_id, outcome } => {
                    self.finished(job_id, outcome);
                }
                Expire { job_id } => {
                    self.expire(job_id);
                }
            }
        }
    }

    fn submit(&mut self, inputs: JobInputs, response: oneshot::Sender<Result<JobId>>) {
        let bound = self.config.max_concurrent_invocations + self.config.max_queue_depth;
        if self.active >= bound {
            tracing::debug!(active = self.active, bound, "admission rejected");
            let _ = response.send(Err(JobError::Overloaded));
            return;
        }

        let job_id = uuid::Uuid::new_v4();
        let deadline = Instant::now() + self.config.max_job_lifetime;
        let (state_tx, state_rx) = watch::channel(JobState::Queued);
        let (cancel_tx, cancel_rx) = oneshot::channel();
        let (start_tx, start_rx) = oneshot::channel();
        Worker {
            job_id,
            inputs,
            deadline,
            start_rx,
            workspaces: self.workspaces.clone(),
            store: self.store.clone(),
            invoker: self.invoker.clone(),
            state_tx,
            done_tx: self.notify_tx.clone(),
        }
        .spawn(cancel_rx);

        self.jobs.insert(
            job_id,
            JobEntry {
                state_rx,
                cancel_tx: Some(cancel_tx),
                start_tx: Some(start_tx),
                holds_slot: false,
                outcome: None,
                waiter: None,
                deadline,
            },
        );
        self.active += 1;
        self.wait_queue.push_back(job_id);
        self.dispatch();
        tracing::info!(%job_id, active = self.active, "job admitted");
        let _ = response.send(Ok(job_id));
    }

    /// Hand free slots to waiting jobs, strictly in admission order.
    /// Jobs whose worker already went away (cancelled or expired while
    /// queued) are skipped without consuming a slot.
    fn dispatch(&mut self) {
        while self.free_slots > 0 {
            let Some(job_id) = self.wait_queue.pop_front() else {
                break;
            };
            let Some(entry) = self.jobs.get_mut(&job_id) else {
                continue;
            };
            let Some(start_tx) = entry.start_tx.take() else {
                continue;
            };
            if start_tx.send(()).is_ok() {
                entry.holds_slot = true;
                self.free_slots -= 1;
            }
        }
    }

    fn job_status(&self, job_id: JobId) -> Result<JobStatus> {
        let entry = self.jobs.get(&job_id).ok_or(JobError::DoesNotExist)?;
        if let Some(outcome) = &entry.outcome {
            return Ok(match outcome {
                JobOutcome::Success(_) => JobStatus::Succeeded,
                JobOutcome::Failure(err) => JobStatus::Failed {
                    kind: err.kind(),
                    detail: err.to_string(),
                },
            });
        }
        Ok(match *entry.state_rx.borrow() {
            JobState::Queued => JobStatus::Queued,
            JobState::Staging => JobStatus::Staging,
            JobState::Invoking => JobStatus::Invoking,
            // terminal but the worker's report is still in the mailbox
            JobState::Delivering | JobState::Done => JobStatus::Delivering,
            JobState::Aborted => JobStatus::Failed {
                kind: JobError::Aborted.kind(),
                detail: JobError::Aborted.to_string(),
            },
        })
    }

    fn await_outcome(&mut self, job_id: JobId, response: oneshot::Sender<Result<JobOutcome>>) {
        let Some(entry) = self.jobs.get_mut(&job_id) else {
            let _ = response.send(Err(JobError::DoesNotExist));
            return;
        };
        if let Some(outcome) = entry.outcome.take() {
            match response.send(Ok(outcome)) {
                Ok(()) => {
                    // outcome handed over; the job is fully accounted for
                    self.jobs.remove(&job_id);
                }
                Err(returned) => {
                    // the caller gave up before we replied; keep the
                    // outcome for the next await
                    entry.outcome = returned.ok();
                }
            }
        } else {
            entry.waiter = Some(response);
        }
    }

    fn cancel(&mut self, job_id: JobId) -> Result<()> {
        let entry = self.jobs.get_mut(&job_id).ok_or(JobError::DoesNotExist)?;
        if let Some(cancel_tx) = entry.cancel_tx.take() {
            tracing::info!(%job_id, "cancellation requested");
            // a still-queued job must never be granted a slot
            entry.start_tx = None;
            let _ = cancel_tx.send(());
        }
        Ok(())
    }

    fn finished(&mut self, job_id: JobId, outcome: JobOutcome) {
        self.active = self.active.saturating_sub(1);
        if let Some(entry) = self.jobs.get_mut(&job_id) {
            if entry.holds_slot {
                entry.holds_slot = false;
                self.free_slots += 1;
            }
        }
        self.dispatch();

        let Some(entry) = self.jobs.get_mut(&job_id) else {
            // entry already expired; dropping the outcome reclaims the
            // workspace
            return;
        };
        entry.cancel_tx = None;
        entry.start_tx = None;
        if let Some(waiter) = entry.waiter.take() {
            match waiter.send(Ok(outcome)) {
                Ok(()) => {
                    self.jobs.remove(&job_id);
                    return;
                }
                Err(returned) => {
                    entry.outcome = returned.ok();
                }
            }
        } else {
            entry.outcome = Some(outcome);
        }

        // nobody is waiting; keep the outcome until the job deadline
        // (plus a small grace so a late caller still sees the result),
        // then reclaim it
        let expire_at = entry.deadline.max(Instant::now()) + OUTCOME_GRACE;
        let notify_tx = self.notify_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep_until(expire_at).await;
            let _ = notify_tx.send(CoordinatorMessage::Expire { job_id }).await;
        });
    }

    fn expire(&mut self, job_id: JobId) {
        let Some(entry) = self.jobs.get(&job_id) else {
            return;
        };
        if entry.outcome.is_some() {
            tracing::info!(%job_id, "uncollected outcome expired");
            self.jobs.remove(&job_id);
        }
    }
}
