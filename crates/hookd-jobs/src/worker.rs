//! Background worker that claims maintenance jobs and records their outcome.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::{
    sync::{mpsc, watch},
    task::JoinHandle,
};
use tracing::{debug, error, info, warn};

use crate::{Job, JobStore};

const WORKER_JOB_QUEUE_CAPACITY: usize = 32;

/// Maintenance operation bound to a worker.
#[async_trait]
pub trait MaintenanceTask: Send + Sync {
    fn name(&self) -> &str;

    async fn run(&self, job: &Job) -> anyhow::Result<()>;
}

/// Observable worker state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WorkerPhase {
    Idle,
    Claiming,
    Executing,
    Succeeded,
    Failed,
    Stopped,
}

/// What happened to one delivered job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    /// The claim was lost, the job vanished or the claim itself failed.
    Skipped,
    Succeeded,
    Failed,
}

pub struct MaintenanceWorker {
    name: String,
    store: Arc<dyn JobStore>,
    task: Arc<dyn MaintenanceTask>,
}

impl MaintenanceWorker {
    pub fn new(
        name: impl Into<String>,
        store: Arc<dyn JobStore>,
        task: Arc<dyn MaintenanceTask>,
    ) -> Self {
        Self {
            name: name.into(),
            store,
            task,
        }
    }

    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Starts the worker loop on the current runtime.
    pub fn spawn(self) -> WorkerHandle {
        let (jobs_tx, jobs_rx) = mpsc::channel(WORKER_JOB_QUEUE_CAPACITY);
        let (stop_tx, stop_rx) = watch::channel(false);
        let (phase_tx, phase_rx) = watch::channel(WorkerPhase::Idle);
        let name = self.name.clone();
        let join = tokio::spawn(self.run(jobs_rx, stop_rx, phase_tx));
        WorkerHandle {
            name,
            jobs_tx,
            stop_tx,
            phase_rx,
            join,
        }
    }

    async fn run(
        self,
        mut jobs: mpsc::Receiver<Job>,
        mut stop: watch::Receiver<bool>,
        phase: watch::Sender<WorkerPhase>,
    ) {
        info!(worker = %self.name, task = self.task.name(), "maintenance worker started");
        loop {
            tokio::select! {
                biased;
                changed = stop.changed() => {
                    if changed.is_err() || *stop.borrow() {
                        break;
                    }
                }
                job = jobs.recv() => {
                    let Some(job) = job else {
                        break;
                    };
                    self.process_job(job, &phase).await;
                    phase.send_replace(WorkerPhase::Idle);
                }
            }
        }
        phase.send_replace(WorkerPhase::Stopped);
        info!(worker = %self.name, "maintenance worker stopped");
    }

    /// Claims `job` and, when the claim wins, runs the task and records the
    /// terminal status. Failures are logged and never propagate.
    pub async fn process_job(&self, job: Job, phase: &watch::Sender<WorkerPhase>) -> JobOutcome {
        phase.send_replace(WorkerPhase::Claiming);
        match self.store.claim(&job.id).await {
            Ok(true) => {}
            Ok(false) => {
                debug!(worker = %self.name, job_id = %job.id, "job already claimed; skipping");
                return JobOutcome::Skipped;
            }
            Err(error) => {
                info!(worker = %self.name, job_id = %job.id, error = %error, "failed to claim job");
                return JobOutcome::Skipped;
            }
        }

        phase.send_replace(WorkerPhase::Executing);
        info!(worker = %self.name, job_id = %job.id, task = self.task.name(), "worker running job");
        match self.task.run(&job).await {
            Ok(()) => match self.store.set_success(&job.id).await {
                Ok(()) => {
                    info!(worker = %self.name, job_id = %job.id, "job finished successfully");
                    phase.send_replace(WorkerPhase::Succeeded);
                    JobOutcome::Succeeded
                }
                Err(error) => {
                    error!(
                        worker = %self.name,
                        job_id = %job.id,
                        error = %error,
                        "failed to record job success"
                    );
                    self.record_error(&job, &error.to_string()).await;
                    phase.send_replace(WorkerPhase::Failed);
                    JobOutcome::Failed
                }
            },
            Err(error) => {
                let message = format!("{error:#}");
                error!(worker = %self.name, job_id = %job.id, error = %message, "job failed");
                self.record_error(&job, &message).await;
                phase.send_replace(WorkerPhase::Failed);
                JobOutcome::Failed
            }
        }
    }

    async fn record_error(&self, job: &Job, message: &str) {
        if let Err(error) = self.store.set_error(&job.id, message).await {
            error!(
                worker = %self.name,
                job_id = %job.id,
                error = %error,
                "failed to record job error"
            );
        }
    }
}

/// Handle to a running worker loop.
pub struct WorkerHandle {
    name: String,
    jobs_tx: mpsc::Sender<Job>,
    stop_tx: watch::Sender<bool>,
    phase_rx: watch::Receiver<WorkerPhase>,
    join: JoinHandle<()>,
}

impl WorkerHandle {
    pub fn name(&self) -> &str {
        self.name.as_str()
    }

    /// Sender the scheduler delivers jobs through.
    pub fn job_sender(&self) -> mpsc::Sender<Job> {
        self.jobs_tx.clone()
    }

    /// Queues a job. Returns false when the worker has stopped.
    pub async fn submit(&self, job: Job) -> bool {
        self.jobs_tx.send(job).await.is_ok()
    }

    pub fn phase(&self) -> WorkerPhase {
        *self.phase_rx.borrow()
    }

    pub fn phase_watch(&self) -> watch::Receiver<WorkerPhase> {
        self.phase_rx.clone()
    }

    /// Signals the loop to stop and waits until it has exited. A job already
    /// executing runs to completion first.
    pub async fn stop(self) {
        debug!(worker = %self.name, "stopping maintenance worker");
        self.stop_tx.send_replace(true);
        if let Err(error) = self.join.await {
            warn!(worker = %self.name, error = %error, "maintenance worker task failed");
        }
    }
}
