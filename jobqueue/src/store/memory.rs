//! Provides an in memory implementation of [`Store`].
//!
//! It is a correct implementation suitable for tests and for single process deployments where
//! losing jobs on restart is acceptable.
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use fxhash::FxHashMap;

use crate::job::{Job, JobId, JobStatus, Mutation};

use super::{queryable::Queryable, Query, Store, StoreError};

/// An in memory implementation of [`Store`].
///
/// Cloning yields a handle to the same underlying jobs.
#[derive(Clone, Default)]
pub struct InMemoryStore {
    inner: Arc<RwLock<Inner>>,
}

#[derive(Default)]
struct Inner {
    jobs: Vec<Job>,
    index: FxHashMap<JobId, usize>,
}

impl InMemoryStore {
    /// Creates a new empty instance of [`InMemoryStore`].
    pub fn new() -> Self {
        Self::default()
    }

    /// The number of jobs held.
    pub fn len(&self) -> usize {
        self.inner.read().map(|inner| inner.jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[async_trait]
impl Store for InMemoryStore {
    async fn create(&self, job: Job) -> Result<(), StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::BadState)?;
        if inner.index.contains_key(&job.id) {
            return Err(StoreError::DuplicateId(job.id));
        }
        let position = inner.jobs.len();
        inner.index.insert(job.id, position);
        inner.jobs.push(job);
        Ok(())
    }

    async fn get(&self, id: JobId) -> Result<Job, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::BadState)?;
        inner
            .index
            .get(&id)
            .map(|&position| inner.jobs[position].clone())
            .ok_or(StoreError::NotFound(id))
    }

    async fn update(
        &self,
        id: JobId,
        expected: JobStatus,
        mutation: Mutation,
    ) -> Result<Job, StoreError> {
        let mut inner = self.inner.write().map_err(|_| StoreError::BadState)?;
        let position = *inner.index.get(&id).ok_or(StoreError::NotFound(id))?;
        let job = &mut inner.jobs[position];
        if job.status != expected {
            return Err(StoreError::Conflict {
                id,
                expected,
                actual: job.status,
            });
        }
        let mut updated = job.clone();
        updated.apply(mutation)?;
        *job = updated.clone();
        Ok(updated)
    }

    async fn list(&self, query: Query) -> Result<Vec<Job>, StoreError> {
        let inner = self.inner.read().map_err(|_| StoreError::BadState)?;
        Ok(inner
            .jobs
            .iter()
            .filter(|job| query.matches(job))
            .cloned()
            .collect())
    }
}
