use std::sync::Arc;

use anyhow::{bail, Result};
use async_trait::async_trait;
use hookd_jobs::{Job, MaintenanceTask, TASK_DELETE_EXPIRED_PLUGIN_KEYS};
use hookd_plugins::KeyValueStore;
use tracing::info;

/// Purges expired plugin key/value entries.
pub(crate) struct ExpiredPluginKeysTask {
    kv: Arc<dyn KeyValueStore>,
}

impl ExpiredPluginKeysTask {
    pub(crate) fn new(kv: Arc<dyn KeyValueStore>) -> Self {
        Self { kv }
    }
}

#[async_trait]
impl MaintenanceTask for ExpiredPluginKeysTask {
    fn name(&self) -> &str {
        TASK_DELETE_EXPIRED_PLUGIN_KEYS
    }

    async fn run(&self, job: &Job) -> Result<()> {
        match job.task() {
            Some(TASK_DELETE_EXPIRED_PLUGIN_KEYS) => {}
            Some(other) => bail!("unsupported maintenance task '{other}'"),
            None => bail!("job {} carries no task", job.id),
        }
        let removed = self.kv.delete_all_expired().await?;
        info!(job_id = %job.id, removed, "deleted expired plugin keys");
        Ok(())
    }
}
