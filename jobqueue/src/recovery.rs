//! Crash recovery.
//!
//! Two kinds of jobs can be left behind by a process that stopped unexpectedly:
//!
//! - jobs still `running`, whose owner no longer exists. As this is a single process engine,
//!   every `running` job found at start up is failed with an `interrupted` error.
//! - jobs still `queued`, either because the process stopped between create and claim or
//!   because the dispatch queue was full at submission. These are re-offered to the workers by
//!   a periodic scan once they are older than the grace period.
use std::sync::Arc;

use chrono::{TimeDelta, Utc};
use tokio::sync::mpsc::{self, error::TrySendError};
use tracing::instrument;

use crate::{
    job::{runner::Dispatch, JobStatus, Mutation},
    store::{Query, Store, StoreError},
    work::WorkError,
};

pub(crate) mod runner;

pub(crate) struct Recovery<S> {
    store: Arc<S>,
    dispatcher: mpsc::Sender<Dispatch>,
    grace_period: TimeDelta,
}

impl<S> Recovery<S>
where
    S: Store,
{
    pub(crate) fn new(
        store: Arc<S>,
        dispatcher: mpsc::Sender<Dispatch>,
        grace_period: TimeDelta,
    ) -> Self {
        Self {
            store,
            dispatcher,
            grace_period,
        }
    }

    /// Fails every job left `running` by a previous process. Returns the number of jobs failed.
    #[instrument(skip(self))]
    pub(crate) async fn fail_interrupted_jobs(&self) -> Result<usize, StoreError> {
        let running = self
            .store
            .list(Query::StatusEqual(JobStatus::Running))
            .await?;
        let mut failed = 0;
        for job in running {
            let job_id = job.id;
            match self
                .store
                .update(
                    job_id,
                    JobStatus::Running,
                    Mutation::Fail {
                        error: WorkError::interrupted(),
                    },
                )
                .await
            {
                Ok(_) => {
                    tracing::warn!(%job_id, "Job {job_id} was interrupted and has been failed");
                    failed += 1;
                }
                Err(err) if err.is_conflict() => {}
                Err(err) => return Err(err),
            }
        }
        Ok(failed)
    }

    /// Re-offers queued jobs older than the grace period to the workers. Returns the number of
    /// jobs offered.
    ///
    /// Offering stops early when the dispatch queue is full, the remainder is picked up by the
    /// next scan.
    #[instrument(skip(self))]
    pub(crate) async fn requeue_stranded_jobs(&self) -> Result<usize, StoreError> {
        let cutoff = Utc::now() - self.grace_period;
        let stranded = self.store.list(Query::stranded(cutoff)).await?;
        let mut offered = 0;
        for job in stranded {
            let job_id = job.id;
            match self.dispatcher.try_send(Dispatch::Claim(job_id)) {
                Ok(()) => {
                    tracing::debug!(%job_id, "Re-offered stranded job {job_id}");
                    offered += 1;
                }
                Err(TrySendError::Full(_)) => {
                    tracing::warn!("Job queue full, deferring remaining stranded jobs");
                    break;
                }
                Err(TrySendError::Closed(_)) => break,
            }
        }
        if offered > 0 {
            tracing::info!(offered, "Re-offered {offered} stranded job(s)");
        }
        Ok(offered)
    }
}
