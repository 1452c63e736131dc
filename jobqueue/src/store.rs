//! The persistence contract of the engine.
//!
//! A [`Store`] is the single source of truth for job state. Every state change goes through
//! [`Store::update`], which is conditional on the status the caller last observed. This makes
//! the store the arbiter of races: when two parties try to move the same job, exactly one of
//! them wins and the other receives [`StoreError::Conflict`].
//!
//! [`memory::InMemoryStore`] is provided for tests and single process use. Durable
//! implementations should run the conformance suite generated by [`crate::test_suite`].
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::job::{Job, JobId, JobStatus, Mutation, TenantId};

pub mod memory;
mod queryable;
#[doc(hidden)]
pub mod testing;

/// Durable keyed storage of [`Job`] records.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Store: Send + Sync + 'static {
    /// Persists a new job. Fails with [`StoreError::DuplicateId`] if the id is already taken.
    async fn create(&self, job: Job) -> Result<(), StoreError>;

    async fn get(&self, id: JobId) -> Result<Job, StoreError>;

    /// Atomically applies `mutation` to the job provided it is still in status `expected`,
    /// returning the updated job.
    ///
    /// Fails with [`StoreError::Conflict`] when the job has moved on, in which case nothing is
    /// written.
    async fn update(
        &self,
        id: JobId,
        expected: JobStatus,
        mutation: Mutation,
    ) -> Result<Job, StoreError>;

    /// Returns the jobs matching the query in creation order.
    async fn list(&self, query: Query) -> Result<Vec<Job>, StoreError>;
}

/// A filter over stored jobs.
#[derive(Debug, Clone, PartialEq)]
pub enum Query {
    And(Vec<Query>),
    TenantEqual(TenantId),
    StatusEqual(JobStatus),
    CreatedBefore(DateTime<Utc>),
}

impl Query {
    /// Every job of `tenant`, optionally restricted to one status.
    pub fn for_tenant(tenant: TenantId, status: Option<JobStatus>) -> Self {
        match status {
            None => Self::TenantEqual(tenant),
            Some(status) => Self::And(vec![Self::TenantEqual(tenant), Self::StatusEqual(status)]),
        }
    }

    /// Queued jobs created before `cutoff`.
    pub fn stranded(cutoff: DateTime<Utc>) -> Self {
        Self::And(vec![
            Self::StatusEqual(JobStatus::Queued),
            Self::CreatedBefore(cutoff),
        ])
    }
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("Job {0} not found")]
    NotFound(JobId),
    #[error("Job {0} already exists")]
    DuplicateId(JobId),
    #[error("Job {id} was expected to be {expected} but is {actual}")]
    Conflict {
        id: JobId,
        expected: JobStatus,
        actual: JobStatus,
    },
    #[error("Job {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: JobId,
        from: JobStatus,
        to: JobStatus,
    },
    #[error("Stored job could not be decoded: {0}")]
    Decode(String),
    #[error("System in bad state")]
    BadState,
    #[error("Store unavailable: {0}")]
    Unavailable(String),
}

impl StoreError {
    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict { .. })
    }
}
