use chrono::{DateTime, Utc};
use jobqueue::{store::StoreError, work::WorkError};
use sqlx::{prelude::FromRow, types::Json};

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(rename_all = "lowercase")]
pub(crate) enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl From<JobStatus> for jobqueue::job::JobStatus {
    fn from(value: JobStatus) -> Self {
        match value {
            JobStatus::Queued => Self::Queued,
            JobStatus::Running => Self::Running,
            JobStatus::Completed => Self::Completed,
            JobStatus::Failed => Self::Failed,
        }
    }
}

impl From<jobqueue::job::JobStatus> for JobStatus {
    fn from(value: jobqueue::job::JobStatus) -> Self {
        match value {
            jobqueue::job::JobStatus::Queued => Self::Queued,
            jobqueue::job::JobStatus::Running => Self::Running,
            jobqueue::job::JobStatus::Completed => Self::Completed,
            jobqueue::job::JobStatus::Failed => Self::Failed,
        }
    }
}

/// A row of the `jobqueue_jobs` table.
#[derive(Debug, FromRow)]
pub(crate) struct Job {
    pub id: String,
    pub tenant_id: String,
    pub status: JobStatus,
    pub created_at: i64,
    pub completed_at: Option<i64>,
    pub request: Json<serde_json::Value>,
    pub result: Option<Json<serde_json::Value>>,
    pub error: Option<Json<WorkError>>,
    pub attempt_count: i64,
}

pub(crate) const COLUMNS: &str = "id, tenant_id, status, created_at, completed_at, request, \
                                  result, error, attempt_count";

pub(crate) fn to_micros(timestamp: DateTime<Utc>) -> i64 {
    timestamp.timestamp_micros()
}

fn from_micros(micros: i64) -> Result<DateTime<Utc>, StoreError> {
    DateTime::from_timestamp_micros(micros)
        .ok_or_else(|| StoreError::Decode(format!("timestamp out of range: {micros}")))
}

impl TryFrom<Job> for jobqueue::job::Job {
    type Error = StoreError;

    fn try_from(value: Job) -> Result<Self, Self::Error> {
        Ok(Self {
            id: value
                .id
                .parse()
                .map_err(|err| StoreError::Decode(format!("invalid job id {}: {err}", value.id)))?,
            tenant_id: value.tenant_id.into(),
            status: value.status.into(),
            created_at: from_micros(value.created_at)?,
            completed_at: value.completed_at.map(from_micros).transpose()?,
            request: value.request.0,
            result: value.result.map(|result| result.0),
            error: value.error.map(|error| error.0),
            attempt_count: u32::try_from(value.attempt_count).map_err(|_| {
                StoreError::Decode(format!("invalid attempt count {}", value.attempt_count))
            })?,
        })
    }
}
