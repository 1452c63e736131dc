//! A durable [`jobqueue::store::Store`] backed by SQLite.
//!
//! Jobs are kept in a single `jobqueue_jobs` table created by the embedded migrations. Every
//! update is a conditional `UPDATE` on the status and attempt count that were read, so
//! concurrent writers to one job are decided by the database.
//!
//! # Example
//!
//! ```no_run
//! # use jobqueue::prelude::*;
//! # use jobqueue_sqlx::JobQueueSqliteStore;
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = QueueConfig::from_env()?;
//! let store = JobQueueSqliteStore::connect(&config.database_url).await?;
//! # Ok(())
//! # }
//! ```
use std::{str::FromStr, time::Duration};

use sqlx::{
    migrate::MigrateError,
    sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions},
    SqlitePool,
};
use thiserror::Error;

mod query;
mod store;
mod types;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_CONNECTIONS: u32 = 5;

#[derive(Clone, Debug)]
pub struct JobQueueSqliteStore {
    pool: SqlitePool,
}

impl std::ops::Deref for JobQueueSqliteStore {
    type Target = SqlitePool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl From<SqlitePool> for JobQueueSqliteStore {
    fn from(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

impl From<&SqlitePool> for JobQueueSqliteStore {
    fn from(value: &SqlitePool) -> Self {
        Self {
            pool: value.to_owned(),
        }
    }
}

#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("Error connecting to the database")]
    Database(#[from] sqlx::Error),
    #[error("Error running migrations")]
    Migrate(#[from] MigrateError),
}

impl JobQueueSqliteStore {
    /// Connects to the database at `url`, creating it if missing, and runs the migrations.
    pub async fn connect(url: &str) -> Result<Self, ConnectError> {
        let options = SqliteConnectOptions::from_str(url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(BUSY_TIMEOUT);
        let pool = SqlitePoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .connect_with(options)
            .await?;
        let store = Self::from(pool);
        store.run_migrations().await?;
        tracing::debug!(url, "Connected job store");
        Ok(store)
    }

    /// A private in memory database, migrated and ready for use.
    ///
    /// Every connection to `:memory:` opens a new database, so the pool is pinned to a single
    /// connection that is never recycled.
    pub async fn in_memory() -> Result<Self, ConnectError> {
        let options = SqliteConnectOptions::from_str("sqlite::memory:")?;
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .min_connections(1)
            .idle_timeout(None)
            .max_lifetime(None)
            .connect_with(options)
            .await?;
        let store = Self::from(pool);
        store.run_migrations().await?;
        Ok(store)
    }

    pub async fn run_migrations(&self) -> Result<(), MigrateError> {
        tracing::info!("Running jobqueue migrations");
        sqlx::migrate!("./migrations").run(&self.pool).await
    }
}

#[cfg(test)]
mod test {
    use std::time::Duration;

    use jobqueue::{
        config::{BackoffConfig, QueueConfig},
        job::{Job, JobStatus, Mutation},
        store::Store,
        testing::{wait_for_terminal, Script, ScriptedWork},
        work::ErrorType,
        JobQueue,
    };
    use serde_json::json;

    use super::*;

    const WAIT: Duration = Duration::from_secs(5);

    jobqueue::test_suite!(for: JobQueueSqliteStore::in_memory().await.unwrap());

    fn database_url(dir: &tempfile::TempDir) -> String {
        format!("sqlite://{}", dir.path().join("jobs.db").display())
    }

    fn config() -> QueueConfig {
        QueueConfig::default().with_retry_backoff(BackoffConfig::Constant {
            delay: chrono::TimeDelta::milliseconds(1),
        })
    }

    #[tokio::test]
    async fn jobs_survive_reconnecting() {
        let dir = tempfile::tempdir().unwrap();
        let url = database_url(&dir);
        let job = Job::new("alice".into(), json!({"op": "always-succeed"}));

        let store = JobQueueSqliteStore::connect(&url).await.unwrap();
        store.create(job.clone()).await.unwrap();
        store
            .update(job.id, JobStatus::Queued, Mutation::Claim)
            .await
            .unwrap();
        store.close().await;

        let store = JobQueueSqliteStore::connect(&url).await.unwrap();
        let stored = store.get(job.id).await.unwrap();
        assert_eq!(stored.status, JobStatus::Running);
        assert_eq!(stored.attempt_count, 1);
        assert_eq!(stored.request, job.request);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn engine_runs_jobs_to_completion() {
        let store = JobQueueSqliteStore::in_memory().await.unwrap();
        let queue = JobQueue::start(store, ScriptedWork::default(), config())
            .await
            .unwrap();
        let tenant = "alice".into();

        let receipt = queue
            .submit(&tenant, &Script::FailTwiceThenSucceed)
            .await
            .unwrap();
        let job = wait_for_terminal(&queue, &tenant, receipt.job_id, WAIT)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempt_count, 3);
        assert_eq!(job.result, Some(ScriptedWork::output()));
        assert!(job.error.is_none());
        queue.graceful_shutdown().await.unwrap();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn restart_recovers_left_over_jobs() {
        let dir = tempfile::tempdir().unwrap();
        let url = database_url(&dir);
        let tenant = "alice".into();
        let mut stranded = Job::new("alice".into(), json!({"op": "always-succeed"}));
        stranded.created_at = chrono::Utc::now() - chrono::TimeDelta::minutes(5);
        let interrupted = Job::new("alice".into(), json!({"op": "always-succeed"}));

        let store = JobQueueSqliteStore::connect(&url).await.unwrap();
        store.create(stranded.clone()).await.unwrap();
        store.create(interrupted.clone()).await.unwrap();
        store
            .update(interrupted.id, JobStatus::Queued, Mutation::Claim)
            .await
            .unwrap();
        store.close().await;

        let work = ScriptedWork::default();
        let store = JobQueueSqliteStore::connect(&url).await.unwrap();
        let queue = JobQueue::start(store, work.clone(), config()).await.unwrap();

        let job = wait_for_terminal(&queue, &tenant, stranded.id, WAIT)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(work.probe().calls(stranded.id), 1);

        let job = queue.get(&tenant, interrupted.id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.error.unwrap().error_type, ErrorType::Interrupted);
        assert_eq!(work.probe().calls(interrupted.id), 0);
        queue.graceful_shutdown().await.unwrap();
    }
}
