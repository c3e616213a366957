//! SQLite-backed `JobStore` implementation with durable persistence.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
    time::Duration,
};

use async_trait::async_trait;
use hookd_core::current_unix_timestamp_ms;
use rusqlite::{params, Connection, OptionalExtension, Row, TransactionBehavior};

use crate::{Job, JobStatus, JobStore, JobStoreError, JobStoreResult, JOB_DATA_ERROR_KEY};

const JOB_COLUMNS: &str =
    "id, job_type, status, data_json, create_at_ms, start_at_ms, last_activity_at_ms";

/// Persistent SQLite job ledger.
#[derive(Debug)]
pub struct SqliteJobStore {
    db_path: PathBuf,
}

impl SqliteJobStore {
    /// Opens (or creates) the database at `path` and ensures the schema exists.
    pub fn new(path: impl AsRef<Path>) -> JobStoreResult<Self> {
        let db_path = path.as_ref().to_path_buf();
        if let Some(parent) = db_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let store = Self { db_path };
        let connection = store.open_connection()?;
        store.initialize_schema(&connection)?;
        Ok(store)
    }

    pub fn path(&self) -> &Path {
        self.db_path.as_path()
    }

    fn open_connection(&self) -> JobStoreResult<Connection> {
        let connection = Connection::open(&self.db_path)?;
        connection.busy_timeout(Duration::from_secs(5))?;
        connection.execute_batch(
            r#"
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            "#,
        )?;
        Ok(connection)
    }

    fn initialize_schema(&self, connection: &Connection) -> JobStoreResult<()> {
        connection.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                job_type TEXT NOT NULL,
                status TEXT NOT NULL,
                data_json TEXT NOT NULL,
                create_at_ms INTEGER NOT NULL,
                start_at_ms INTEGER,
                last_activity_at_ms INTEGER NOT NULL
            );
            CREATE INDEX IF NOT EXISTS idx_jobs_type_status ON jobs (job_type, status);
            "#,
        )?;
        Ok(())
    }

    fn finish(&self, id: &str, next: JobStatus, message: Option<&str>) -> JobStoreResult<()> {
        let mut connection = self.open_connection()?;
        let transaction = connection.transaction_with_behavior(TransactionBehavior::Immediate)?;

        let current: Option<(String, String)> = transaction
            .query_row(
                "SELECT status, data_json FROM jobs WHERE id = ?1",
                params![id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .optional()?;
        let Some((status, data_json)) = current else {
            return Err(JobStoreError::NotFound(id.to_string()));
        };
        let status = status_from_db(&status)?;
        if !status.can_transition_to(next) {
            return Err(JobStoreError::InvalidTransition {
                id: id.to_string(),
                from: status,
                to: next,
            });
        }

        let mut data: BTreeMap<String, String> = serde_json::from_str(&data_json)?;
        if let Some(message) = message {
            data.insert(JOB_DATA_ERROR_KEY.to_string(), message.to_string());
        }
        transaction.execute(
            "UPDATE jobs SET status = ?2, data_json = ?3, last_activity_at_ms = ?4 WHERE id = ?1",
            params![
                id,
                next.as_str(),
                serde_json::to_string(&data)?,
                u64_to_i64(current_unix_timestamp_ms())
            ],
        )?;
        transaction.commit()?;
        Ok(())
    }
}

#[async_trait]
impl JobStore for SqliteJobStore {
    async fn save(&self, job: Job) -> JobStoreResult<()> {
        let connection = self.open_connection()?;
        let inserted = connection.execute(
            r#"
            INSERT OR IGNORE INTO jobs (
                id, job_type, status, data_json, create_at_ms, start_at_ms, last_activity_at_ms
            ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
            "#,
            params![
                job.id,
                job.job_type,
                job.status.as_str(),
                serde_json::to_string(&job.data)?,
                u64_to_i64(job.create_at_ms),
                job.start_at_ms.map(u64_to_i64),
                u64_to_i64(job.last_activity_at_ms),
            ],
        )?;
        if inserted == 0 {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        Ok(())
    }

    async fn get(&self, id: &str) -> JobStoreResult<Option<Job>> {
        let connection = self.open_connection()?;
        connection
            .query_row(
                &format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = ?1"),
                params![id],
                raw_job_from_row,
            )
            .optional()?
            .map(RawJob::into_job)
            .transpose()
    }

    async fn claim(&self, id: &str) -> JobStoreResult<bool> {
        let connection = self.open_connection()?;
        let now_ms = u64_to_i64(current_unix_timestamp_ms());
        let updated = connection.execute(
            r#"
            UPDATE jobs
            SET status = ?2, start_at_ms = ?3, last_activity_at_ms = ?3
            WHERE id = ?1 AND status = ?4
            "#,
            params![
                id,
                JobStatus::InProgress.as_str(),
                now_ms,
                JobStatus::Pending.as_str()
            ],
        )?;
        Ok(updated == 1)
    }

    async fn set_success(&self, id: &str) -> JobStoreResult<()> {
        self.finish(id, JobStatus::Success, None)
    }

    async fn set_error(&self, id: &str, message: &str) -> JobStoreResult<()> {
        self.finish(id, JobStatus::Error, Some(message))
    }

    async fn list_by_type_and_status(
        &self,
        job_type: &str,
        status: JobStatus,
    ) -> JobStoreResult<Vec<Job>> {
        let connection = self.open_connection()?;
        let mut statement = connection.prepare(&format!(
            "SELECT {JOB_COLUMNS} FROM jobs WHERE job_type = ?1 AND status = ?2 ORDER BY create_at_ms, id"
        ))?;
        let rows = statement.query_map(params![job_type, status.as_str()], raw_job_from_row)?;
        let mut jobs = Vec::new();
        for row in rows {
            jobs.push(row?.into_job()?);
        }
        Ok(jobs)
    }
}

struct RawJob {
    id: String,
    job_type: String,
    status: String,
    data_json: String,
    create_at_ms: i64,
    start_at_ms: Option<i64>,
    last_activity_at_ms: i64,
}

impl RawJob {
    fn into_job(self) -> JobStoreResult<Job> {
        Ok(Job {
            id: self.id,
            job_type: self.job_type,
            status: status_from_db(&self.status)?,
            data: serde_json::from_str(&self.data_json)?,
            create_at_ms: i64_to_u64("create_at_ms", self.create_at_ms)?,
            start_at_ms: self
                .start_at_ms
                .map(|value| i64_to_u64("start_at_ms", value))
                .transpose()?,
            last_activity_at_ms: i64_to_u64("last_activity_at_ms", self.last_activity_at_ms)?,
        })
    }
}

fn raw_job_from_row(row: &Row<'_>) -> rusqlite::Result<RawJob> {
    Ok(RawJob {
        id: row.get(0)?,
        job_type: row.get(1)?,
        status: row.get(2)?,
        data_json: row.get(3)?,
        create_at_ms: row.get(4)?,
        start_at_ms: row.get(5)?,
        last_activity_at_ms: row.get(6)?,
    })
}

fn status_from_db(raw: &str) -> JobStoreResult<JobStatus> {
    JobStatus::parse(raw).ok_or_else(|| JobStoreError::InvalidPersistedValue {
        field: "status",
        value: raw.to_string(),
    })
}

fn u64_to_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn i64_to_u64(field: &'static str, value: i64) -> JobStoreResult<u64> {
    u64::try_from(value).map_err(|_| JobStoreError::InvalidPersistedValue {
        field,
        value: value.to_string(),
    })
}

#[cfg(test)]
mod tests {
    use super::SqliteJobStore;
    use crate::{Job, JobStatus, JobStore, JobStoreError, TASK_DELETE_EXPIRED_PLUGIN_KEYS};
    use tempfile::tempdir;

    #[tokio::test]
    async fn functional_sqlite_job_store_persists_transitions_across_reopen() {
        let temp = tempdir().expect("tempdir");
        let path = temp.path().join("nested").join("jobs.sqlite");
        let job = Job::plugin_maintenance(TASK_DELETE_EXPIRED_PLUGIN_KEYS);
        {
            let store = SqliteJobStore::new(&path).expect("open store");
            store.save(job.clone()).await.expect("save");
            assert!(store.claim(&job.id).await.expect("claim"));
            assert!(!store.claim(&job.id).await.expect("second claim"));
            store
                .set_error(&job.id, "disk full")
                .await
                .expect("set error");
        }

        let reopened = SqliteJobStore::new(&path).expect("reopen store");
        let loaded = reopened
            .get(&job.id)
            .await
            .expect("get")
            .expect("job exists");
        assert_eq!(loaded.status, JobStatus::Error);
        assert_eq!(loaded.error_message(), Some("disk full"));
        assert_eq!(loaded.task(), Some(TASK_DELETE_EXPIRED_PLUGIN_KEYS));
        assert!(loaded.start_at_ms.is_some());
    }

    #[tokio::test]
    async fn regression_sqlite_job_store_rejects_duplicates_and_invalid_transitions() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteJobStore::new(temp.path().join("jobs.sqlite")).expect("open store");
        let job = Job::plugin_maintenance(TASK_DELETE_EXPIRED_PLUGIN_KEYS);
        store.save(job.clone()).await.expect("save");

        assert!(matches!(
            store.save(job.clone()).await,
            Err(JobStoreError::AlreadyExists(_))
        ));
        assert!(matches!(
            store.set_success(&job.id).await,
            Err(JobStoreError::InvalidTransition {
                from: JobStatus::Pending,
                to: JobStatus::Success,
                ..
            })
        ));
        assert!(matches!(
            store.set_success("missing").await,
            Err(JobStoreError::NotFound(_))
        ));
        assert!(!store.claim("missing").await.expect("claim missing"));
    }

    #[tokio::test]
    async fn functional_sqlite_job_store_lists_by_type_and_status_oldest_first() {
        let temp = tempdir().expect("tempdir");
        let store = SqliteJobStore::new(temp.path().join("jobs.sqlite")).expect("open store");
        let mut older = Job::plugin_maintenance(TASK_DELETE_EXPIRED_PLUGIN_KEYS);
        older.create_at_ms = 10;
        let mut newer = Job::plugin_maintenance(TASK_DELETE_EXPIRED_PLUGIN_KEYS);
        newer.create_at_ms = 20;
        let mut other_type = Job::plugin_maintenance(TASK_DELETE_EXPIRED_PLUGIN_KEYS);
        other_type.job_type = "exports".to_string();
        for job in [newer.clone(), other_type, older.clone()] {
            store.save(job).await.expect("save");
        }
        store.claim(&newer.id).await.expect("claim");

        let pending = store
            .list_by_type_and_status("plugins", JobStatus::Pending)
            .await
            .expect("list pending");
        assert_eq!(pending, vec![older]);
        let in_progress = store
            .list_by_type_and_status("plugins", JobStatus::InProgress)
            .await
            .expect("list in progress");
        assert_eq!(in_progress.len(), 1);
        assert_eq!(in_progress[0].id, newer.id);
    }
}
