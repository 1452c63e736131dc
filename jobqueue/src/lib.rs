//! A tenant scoped, submit then poll job execution engine.
//!
//! Callers submit a request on behalf of a tenant and receive a job id straight away. The job is
//! executed in the background by a bounded pool of workers invoking a [`WorkFunction`],
//! retried according to a [`RetryPolicy`], and its status, result or error can be polled at any
//! time by the tenant that owns it.
//!
//! Job state lives in a [`Store`]. The in memory store in [`store::memory`] is suitable for tests,
//! durable stores such as the SQLite store in `jobqueue-sqlx` survive restarts, in which case jobs
//! left behind by the previous process are recovered on start.
//!
//! # Example
//!
//! ```
//! use jobqueue::prelude::*;
//! use jobqueue::store::memory::InMemoryStore;
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Serialize, Deserialize)]
//! struct Shout(String);
//!
//! struct Shouter;
//!
//! #[async_trait::async_trait]
//! impl WorkFunction for Shouter {
//!     type Request = Shout;
//!     type Output = String;
//!     const NAME: &'static str = "shouter";
//!
//!     async fn call(&self, request: Shout, _: WorkContext) -> Result<String, WorkError> {
//!         Ok(request.0.to_uppercase())
//!     }
//! }
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let queue = JobQueue::start(InMemoryStore::new(), Shouter, QueueConfig::default())
//!     .await
//!     .unwrap();
//! let tenant = TenantId::from("tenant-alice");
//!
//! let receipt = queue.submit(&tenant, &Shout("hello".to_owned())).await.unwrap();
//! assert_eq!(receipt.status, JobStatus::Queued);
//!
//! let job = jobqueue::testing::wait_for_terminal(
//!     &queue,
//!     &tenant,
//!     receipt.job_id,
//!     std::time::Duration::from_secs(1),
//! )
//! .await
//! .unwrap()
//! .unwrap();
//! assert_eq!(job.result, Some(serde_json::json!("HELLO")));
//!
//! queue.graceful_shutdown().await.unwrap();
//! # });
//! ```
use std::{fmt, marker::PhantomData, sync::Arc};

use thiserror::Error;
use tokio::{
    sync::mpsc::{self, error::TrySendError},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use tracing::instrument;

use crate::{
    config::{ConfigError, QueueConfig},
    job::{
        runner::{Dispatch, InFlight, JobRunner},
        Job, JobId, JobStatus, JobStatusView, Mutation, TenantId,
    },
    recovery::{runner::RecoveryRunner, Recovery},
    store::{Query, Store, StoreError},
    work::{WorkAdapter, WorkError, WorkFunction},
};

pub mod auth;
pub mod backoff;
pub mod config;
pub mod job;
pub mod prelude;
mod recovery;
pub mod retry;
pub mod store;
pub mod testing;
pub mod work;

#[doc(inline)]
pub use retry::RetryPolicy;

const CREATE_ATTEMPTS: usize = 3;
const CANCEL_ATTEMPTS: usize = 3;

/// The submission and query boundary of the engine.
///
/// Every operation is scoped to a tenant: a job owned by another tenant behaves exactly as a job
/// that does not exist.
pub struct JobQueue<S, W> {
    store: Arc<S>,
    dispatcher: mpsc::Sender<Dispatch>,
    in_flight: InFlight,
    recovery: Recovery<S>,
    shutdown: CancellationToken,
    handles: Vec<JoinHandle<()>>,
    _work: PhantomData<fn() -> W>,
}

impl<S, W> JobQueue<S, W>
where
    S: Store,
    W: WorkFunction,
{
    /// Starts the workers and the recovery runner.
    ///
    /// Jobs left `running` in the store by a previous process are failed as interrupted before
    /// any work starts, and stranded `queued` jobs are re-offered straight away.
    pub async fn start(store: S, work: W, config: QueueConfig) -> Result<Self, JobQueueError> {
        let store = Arc::new(store);
        let (dispatcher, receiver) = mpsc::channel(config.queue_capacity.max(1));
        let shutdown = CancellationToken::new();
        let in_flight = InFlight::default();

        let recovery = Recovery::new(
            store.clone(),
            dispatcher.clone(),
            config.crash_recovery_grace_period,
        );
        let interrupted = recovery.fail_interrupted_jobs().await?;
        if interrupted > 0 {
            tracing::warn!(interrupted, "Failed {interrupted} interrupted job(s) on start");
        }

        let mut handles = JobRunner::new(
            store.clone(),
            WorkAdapter::new(work, config.work_function_timeout),
            config.retry_policy(),
            in_flight.clone(),
            dispatcher.clone(),
            shutdown.clone(),
        )
        .spawn_workers(receiver, config.max_concurrent_jobs);

        handles.push(
            RecoveryRunner::new(
                Recovery::new(
                    store.clone(),
                    dispatcher.clone(),
                    config.crash_recovery_grace_period,
                ),
                config.recovery_schedule.clone(),
            )
            .spawn(shutdown.clone()),
        );

        tracing::info!(
            workers = config.max_concurrent_jobs,
            work = W::NAME,
            "Started job queue for {}",
            W::NAME
        );

        Ok(Self {
            store,
            dispatcher,
            in_flight,
            recovery,
            shutdown,
            handles,
            _work: PhantomData,
        })
    }

    /// Creates a queued job for `tenant_id` and hands it to the workers.
    ///
    /// Submission does not wait for a worker. When the dispatch queue is full the job remains
    /// queued and is picked up by the recovery scan.
    pub async fn submit(
        &self,
        tenant_id: &TenantId,
        request: &W::Request,
    ) -> Result<JobStatusView, JobQueueError> {
        let request = serde_json::to_value(request)?;
        self.submit_json(tenant_id, request).await
    }

    /// Like [`JobQueue::submit`] for a request that has already been encoded, e.g. the body of an
    /// HTTP request. A request the work function cannot decode fails the job permanently.
    #[instrument(skip(self, request))]
    pub async fn submit_json(
        &self,
        tenant_id: &TenantId,
        request: serde_json::Value,
    ) -> Result<JobStatusView, JobQueueError> {
        let mut job = Job::new(tenant_id.clone(), request);
        let mut attempt = 1;
        loop {
            match self.store.create(job.clone()).await {
                Ok(()) => break,
                Err(StoreError::DuplicateId(job_id)) if attempt < CREATE_ATTEMPTS => {
                    tracing::debug!(%job_id, "Job id {job_id} already taken, regenerating");
                    job.id = JobId::new();
                    attempt += 1;
                }
                Err(err) => return Err(err.into()),
            }
        }

        let job_id = job.id;
        tracing::debug!(%job_id, "Created job {job_id}");
        match self.dispatcher.try_send(Dispatch::Claim(job_id)) {
            Ok(()) => {}
            Err(TrySendError::Full(_)) => tracing::warn!(
                %job_id,
                "Job queue full, job {job_id} deferred to the recovery scan"
            ),
            Err(TrySendError::Closed(_)) => tracing::warn!(
                %job_id,
                "Job queue closed, job {job_id} will run on next start"
            ),
        }
        Ok(JobStatusView::from(&job))
    }

    pub async fn get(&self, tenant_id: &TenantId, job_id: JobId) -> Result<Job, JobQueueError> {
        match self.store.get(job_id).await {
            Ok(job) if job.tenant_id == *tenant_id => Ok(job),
            Ok(_) | Err(StoreError::NotFound(_)) => Err(JobQueueError::NotFound(job_id)),
            Err(err) => Err(err.into()),
        }
    }

    pub async fn get_status(
        &self,
        tenant_id: &TenantId,
        job_id: JobId,
    ) -> Result<JobStatusView, JobQueueError> {
        self.get(tenant_id, job_id)
            .await
            .map(|job| JobStatusView::from(&job))
    }

    /// The tenant's jobs in creation order, optionally restricted to one status.
    pub async fn list(
        &self,
        tenant_id: &TenantId,
        status: Option<JobStatus>,
    ) -> Result<Vec<Job>, JobQueueError> {
        Ok(self
            .store
            .list(Query::for_tenant(tenant_id.clone(), status))
            .await?)
    }

    /// Fails a queued or running job with a `cancelled` error, interrupting its current attempt.
    ///
    /// A job that is already terminal is returned unchanged.
    #[instrument(skip(self))]
    pub async fn cancel(&self, tenant_id: &TenantId, job_id: JobId) -> Result<Job, JobQueueError> {
        for _ in 0..CANCEL_ATTEMPTS {
            let job = self.get(tenant_id, job_id).await?;
            if job.is_terminal() {
                return Ok(job);
            }
            let mutation = Mutation::Fail {
                error: WorkError::cancelled(),
            };
            match self.store.update(job_id, job.status, mutation).await {
                Ok(job) => {
                    self.in_flight.cancel(job_id);
                    tracing::info!(%job_id, "Cancelled job {job_id}");
                    return Ok(job);
                }
                Err(err) if err.is_conflict() => {
                    tracing::debug!(%job_id, "Job {job_id} moved while cancelling: {err}");
                }
                Err(err) => return Err(err.into()),
            }
        }
        self.get(tenant_id, job_id).await
    }

    /// Runs the stranded job scan now rather than waiting for the schedule. Returns the number
    /// of jobs re-offered to the workers.
    pub async fn recover_stranded_jobs(&self) -> Result<usize, JobQueueError> {
        Ok(self.recovery.requeue_stranded_jobs().await?)
    }

    /// Stops the workers and the recovery runner and waits for them.
    ///
    /// Workers finish the attempt they are running. Pending retries are abandoned, leaving their
    /// jobs `running`. The next [`JobQueue::start`] fails them as interrupted, including jobs that
    /// still had attempts left, since a `running` job at start is indistinguishable from one
    /// whose process crashed mid attempt.
    pub async fn graceful_shutdown(mut self) -> Result<(), JobQueueError> {
        tracing::debug!("Shutting down job queue tasks");
        self.shutdown.cancel();
        futures::future::join_all(std::mem::take(&mut self.handles))
            .await
            .into_iter()
            .collect::<Result<Vec<_>, _>>()
            .map_err(|_| JobQueueError::GracefulShutdownFailed)?;
        Ok(())
    }
}

impl<S, W> fmt::Debug for JobQueue<S, W> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("JobQueue")
            .field("tasks", &self.handles.len())
            .finish_non_exhaustive()
    }
}

impl<S, W> Drop for JobQueue<S, W> {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

#[derive(Debug, Error)]
pub enum JobQueueError {
    #[error("Job {0} not found")]
    NotFound(JobId),
    #[error("Error communicating with the store")]
    Store(#[from] StoreError),
    #[error("Error encoding or decoding value")]
    Encode(#[from] serde_json::Error),
    #[error("Invalid configuration")]
    Config(#[from] ConfigError),
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
}
