use std::ops::Deref;

use async_trait::async_trait;
use jobqueue::{
    job::{Job, JobId, JobStatus, Mutation},
    store::{Query, Store, StoreError},
};
use sqlx::types::Json;
use tracing::instrument;

use crate::{
    query::ToQuery,
    types::{self, to_micros, COLUMNS},
    JobQueueSqliteStore,
};

fn map_err(error: sqlx::Error) -> StoreError {
    match error {
        sqlx::Error::Decode(err) | sqlx::Error::ColumnDecode { source: err, .. } => {
            StoreError::Decode(err.to_string())
        }
        err => StoreError::Unavailable(err.to_string()),
    }
}

#[async_trait]
impl Store for JobQueueSqliteStore {
    #[instrument(skip_all, fields(job_id = %job.id))]
    async fn create(&self, job: Job) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO jobqueue_jobs (
                id,
                tenant_id,
                status,
                created_at,
                completed_at,
                request,
                result,
                error,
                attempt_count
            ) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)"#,
        )
        .bind(job.id.to_string())
        .bind(job.tenant_id.as_str())
        .bind(types::JobStatus::from(job.status))
        .bind(to_micros(job.created_at))
        .bind(job.completed_at.map(to_micros))
        .bind(Json(&job.request))
        .bind(job.result.as_ref().map(Json))
        .bind(job.error.as_ref().map(Json))
        .bind(i64::from(job.attempt_count))
        .execute(self.deref())
        .await
        .map_err(|err| match err.as_database_error() {
            Some(db_err) if db_err.is_unique_violation() => StoreError::DuplicateId(job.id),
            _ => map_err(err),
        })?;
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Job, StoreError> {
        let sql = format!("SELECT {COLUMNS} FROM jobqueue_jobs WHERE id = ?");
        let row = sqlx::query_as::<_, types::Job>(&sql)
            .bind(id.to_string())
            .fetch_optional(self.deref())
            .await
            .map_err(map_err)?
            .ok_or(StoreError::NotFound(id))?;
        row.try_into()
    }

    #[instrument(skip(self, mutation))]
    async fn update(
        &self,
        id: JobId,
        expected: JobStatus,
        mutation: Mutation,
    ) -> Result<Job, StoreError> {
        loop {
            let current = self.get(id).await?;
            if current.status != expected {
                return Err(StoreError::Conflict {
                    id,
                    expected,
                    actual: current.status,
                });
            }
            let mut updated = current.clone();
            updated.apply(mutation.clone())?;

            let result = sqlx::query(
                r#"UPDATE jobqueue_jobs SET
                    status = ?,
                    completed_at = ?,
                    result = ?,
                    error = ?,
                    attempt_count = ?
                WHERE id = ? AND status = ? AND attempt_count = ?"#,
            )
            .bind(types::JobStatus::from(updated.status))
            .bind(updated.completed_at.map(to_micros))
            .bind(updated.result.as_ref().map(Json))
            .bind(updated.error.as_ref().map(Json))
            .bind(i64::from(updated.attempt_count))
            .bind(id.to_string())
            .bind(types::JobStatus::from(current.status))
            .bind(i64::from(current.attempt_count))
            .execute(self.deref())
            .await
            .map_err(map_err)?;

            if result.rows_affected() == 1 {
                return Ok(updated);
            }
            tracing::debug!(%id, "Job {id} changed while updating, re-reading");
        }
    }

    async fn list(&self, query: Query) -> Result<Vec<Job>, StoreError> {
        let mut builder = query.query();
        let rows = builder
            .build_query_as::<types::Job>()
            .fetch_all(self.deref())
            .await
            .map_err(map_err)?;
        rows.into_iter().map(Job::try_from).collect()
    }
}
