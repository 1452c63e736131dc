//! The job record and its lifecycle.
//!
//! A [`Job`] moves through a strictly monotonic set of statuses:
//!
//! ```text
//! queued ──► running ──► completed
//!    │          │
//!    └──────────┴──────► failed
//! ```
//!
//! All changes to a stored job are expressed as a [`Mutation`] and applied through
//! [`Job::apply`], which rejects every transition not shown above.
use std::{fmt::Display, str::FromStr};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{store::StoreError, work::WorkError};

pub(crate) mod runner;

/// Opaque unique identifier of a job, generated at submission.
#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// Generates a new random [`JobId`].
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<JobId> for Uuid {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

/// The owner of a job and the sole authorization boundary of the engine.
#[derive(Debug, Eq, PartialEq, Clone, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(String);

impl TenantId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TenantId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

impl From<String> for TenantId {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl std::ops::Deref for TenantId {
    type Target = str;

    fn deref(&self) -> &Self::Target {
        &self.0
    }
}

impl Display for TenantId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    Queued,
    Running,
    Completed,
    Failed,
}

impl JobStatus {
    /// Whether the status is final. A terminal job never changes again.
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Queued => "queued",
            Self::Running => "running",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Error, PartialEq, Eq)]
#[error("Unknown job status: {0}")]
pub struct UnknownStatus(pub String);

impl FromStr for JobStatus {
    type Err = UnknownStatus;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "queued" => Ok(Self::Queued),
            "running" => Ok(Self::Running),
            "completed" => Ok(Self::Completed),
            "failed" => Ok(Self::Failed),
            other => Err(UnknownStatus(other.to_owned())),
        }
    }
}

/// A unit of submitted work as persisted in the [`crate::store::Store`].
///
/// `result` is present only once the job is [`JobStatus::Completed`] and `error` only once it
/// is [`JobStatus::Failed`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub request: serde_json::Value,
    pub result: Option<serde_json::Value>,
    pub error: Option<WorkError>,
    pub attempt_count: u32,
}

impl Job {
    /// Creates a new queued job with a freshly generated [`JobId`].
    pub fn new(tenant_id: TenantId, request: serde_json::Value) -> Self {
        Self {
            id: JobId::new(),
            tenant_id,
            status: JobStatus::Queued,
            created_at: Utc::now(),
            completed_at: None,
            request,
            result: None,
            error: None,
            attempt_count: 0,
        }
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }

    /// Applies a [`Mutation`] to the job in place.
    ///
    /// Fails with [`StoreError::InvalidTransition`], leaving the job untouched, when the mutation
    /// is not valid from the job's current status.
    pub fn apply(&mut self, mutation: Mutation) -> Result<(), StoreError> {
        let valid = matches!(
            (self.status, &mutation),
            (JobStatus::Queued, Mutation::Claim)
                | (JobStatus::Running, Mutation::BeginAttempt)
                | (JobStatus::Running, Mutation::Complete { .. })
                | (JobStatus::Queued | JobStatus::Running, Mutation::Fail { .. })
        );
        if !valid {
            return Err(StoreError::InvalidTransition {
                id: self.id,
                from: self.status,
                to: mutation.target_status(),
            });
        }

        match mutation {
            Mutation::Claim => {
                self.status = JobStatus::Running;
                self.attempt_count += 1;
            }
            Mutation::BeginAttempt => self.attempt_count += 1,
            Mutation::Complete { result } => {
                self.status = JobStatus::Completed;
                self.result = Some(result);
                self.completed_at = Some(Utc::now());
            }
            Mutation::Fail { error } => {
                self.status = JobStatus::Failed;
                self.error = Some(error);
                self.completed_at = Some(Utc::now());
            }
        }
        Ok(())
    }
}

/// An atomic change to a stored job.
#[derive(Debug, Clone, PartialEq)]
pub enum Mutation {
    /// Take ownership of a queued job and start its first attempt.
    Claim,
    /// Start another attempt of an already running job.
    BeginAttempt,
    /// Record the result of a successful attempt.
    Complete { result: serde_json::Value },
    /// Record a terminal error, either from the retry policy giving up or from cancellation.
    Fail { error: WorkError },
}

impl Mutation {
    pub fn target_status(&self) -> JobStatus {
        match self {
            Self::Claim | Self::BeginAttempt => JobStatus::Running,
            Self::Complete { .. } => JobStatus::Completed,
            Self::Fail { .. } => JobStatus::Failed,
        }
    }
}

/// The lightweight `{job_id, status}` payload returned by status lookups and submissions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobStatusView {
    pub job_id: JobId,
    pub status: JobStatus,
}

impl From<&Job> for JobStatusView {
    fn from(job: &Job) -> Self {
        Self {
            job_id: job.id,
            status: job.status,
        }
    }
}
