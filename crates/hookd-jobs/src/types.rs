use std::{
    collections::BTreeMap,
    sync::atomic::{AtomicU64, Ordering},
};

use hookd_core::current_unix_timestamp_ms;
use serde::{Deserialize, Serialize};

/// Job type tag the plugin maintenance worker is registered under.
pub const JOB_TYPE_PLUGINS: &str = "plugins";
/// Data key naming the maintenance task a job correlates with.
pub const JOB_DATA_TASK_KEY: &str = "task";
/// Data key holding the failure message of an `error` job.
pub const JOB_DATA_ERROR_KEY: &str = "error";
pub const TASK_DELETE_EXPIRED_PLUGIN_KEYS: &str = "delete_expired_plugin_keys";

static JOB_ID_SEQUENCE: AtomicU64 = AtomicU64::new(1);

/// Lifecycle state of a job record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    InProgress,
    Success,
    Error,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::InProgress => "in_progress",
            Self::Success => "success",
            Self::Error => "error",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw {
            "pending" => Some(Self::Pending),
            "in_progress" => Some(Self::InProgress),
            "success" => Some(Self::Success),
            "error" => Some(Self::Error),
            _ => None,
        }
    }

    /// Returns whether a status transition is valid.
    pub fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Pending, Self::InProgress)
                | (Self::InProgress, Self::Success)
                | (Self::InProgress, Self::Error)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Success | Self::Error)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Job {
    pub id: String,
    pub job_type: String,
    pub status: JobStatus,
    #[serde(default)]
    pub data: BTreeMap<String, String>,
    pub create_at_ms: u64,
    #[serde(default)]
    pub start_at_ms: Option<u64>,
    pub last_activity_at_ms: u64,
}

impl Job {
    /// Builds a pending job with a fresh id.
    pub fn pending(job_type: impl Into<String>, data: BTreeMap<String, String>) -> Self {
        let job_type = job_type.into();
        let now_ms = current_unix_timestamp_ms();
        let sequence = JOB_ID_SEQUENCE.fetch_add(1, Ordering::Relaxed);
        Self {
            id: format!("{job_type}-{now_ms}-{sequence}"),
            job_type,
            status: JobStatus::Pending,
            data,
            create_at_ms: now_ms,
            start_at_ms: None,
            last_activity_at_ms: now_ms,
        }
    }

    /// Pending plugin-maintenance job correlated with `task`.
    pub fn plugin_maintenance(task: &str) -> Self {
        let mut data = BTreeMap::new();
        data.insert(JOB_DATA_TASK_KEY.to_string(), task.to_string());
        Self::pending(JOB_TYPE_PLUGINS, data)
    }

    pub fn task(&self) -> Option<&str> {
        self.data.get(JOB_DATA_TASK_KEY).map(String::as_str)
    }

    pub fn error_message(&self) -> Option<&str> {
        self.data.get(JOB_DATA_ERROR_KEY).map(String::as_str)
    }
}
