//! Periodic creation and delivery of plugin maintenance jobs.

use std::{sync::Arc, time::Duration};

use anyhow::Result;
use tokio::{
    sync::{mpsc, watch},
    time::{interval_at, Instant, MissedTickBehavior},
};
use tracing::{debug, info, warn};

use crate::{
    Job, JobStatus, JobStore, JobStoreResult, JOB_TYPE_PLUGINS, TASK_DELETE_EXPIRED_PLUGIN_KEYS,
};

pub const MAINTENANCE_INTERVAL_SECS_DEFAULT: u64 = 86_400;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SchedulerConfig {
    pub interval: Duration,
    pub task: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            interval: Duration::from_secs(MAINTENANCE_INTERVAL_SECS_DEFAULT),
            task: TASK_DELETE_EXPIRED_PLUGIN_KEYS.to_string(),
        }
    }
}

pub struct MaintenanceScheduler {
    store: Arc<dyn JobStore>,
    jobs: mpsc::Sender<Job>,
    config: SchedulerConfig,
}

impl MaintenanceScheduler {
    pub fn new(store: Arc<dyn JobStore>, jobs: mpsc::Sender<Job>, config: SchedulerConfig) -> Self {
        Self {
            store,
            jobs,
            config,
        }
    }

    /// Delivers pending jobs for this task left behind by a previous run.
    pub async fn redeliver_pending(&self) -> JobStoreResult<usize> {
        let pending = self.pending_jobs().await?;
        let mut delivered = 0;
        for job in pending {
            if !self.deliver(job).await {
                break;
            }
            delivered += 1;
        }
        Ok(delivered)
    }

    /// Creates and delivers a job unless one for this task is still pending.
    pub async fn schedule_if_idle(&self) -> JobStoreResult<Option<Job>> {
        if !self.pending_jobs().await?.is_empty() {
            debug!(task = %self.config.task, "maintenance job already outstanding; not scheduling");
            return Ok(None);
        }
        let job = Job::plugin_maintenance(&self.config.task);
        self.store.save(job.clone()).await?;
        info!(job_id = %job.id, task = %self.config.task, "scheduled maintenance job");
        self.deliver(job.clone()).await;
        Ok(Some(job))
    }

    /// Redelivers leftovers, then schedules a job every interval until
    /// `shutdown` flips to true.
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) -> Result<()> {
        let redelivered = self.redeliver_pending().await?;
        if redelivered > 0 {
            info!(count = redelivered, "redelivered pending maintenance jobs");
        }

        let mut ticks = interval_at(Instant::now() + self.config.interval, self.config.interval);
        ticks.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
                _ = ticks.tick() => {
                    if let Err(error) = self.schedule_if_idle().await {
                        warn!(error = %error, "failed to schedule maintenance job");
                    }
                }
            }
        }
        Ok(())
    }

    async fn pending_jobs(&self) -> JobStoreResult<Vec<Job>> {
        let jobs = self
            .store
            .list_by_type_and_status(JOB_TYPE_PLUGINS, JobStatus::Pending)
            .await?;
        Ok(jobs
            .into_iter()
            .filter(|job| job.task() == Some(self.config.task.as_str()))
            .collect())
    }

    async fn deliver(&self, job: Job) -> bool {
        let job_id = job.id.clone();
        if self.jobs.send(job).await.is_err() {
            warn!(job_id = %job_id, "maintenance worker unavailable; job left pending");
            return false;
        }
        true
    }
}
