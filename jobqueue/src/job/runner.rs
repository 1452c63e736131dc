use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use chrono::TimeDelta;
use fxhash::FxHashMap;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Instrument};

use crate::{
    retry::{RetryDecision, RetryPolicy},
    store::Store,
    work::{WorkAdapter, WorkFunction},
};

use super::{Job, JobId, JobStatus, Mutation};

const FINISH_ATTEMPTS: u32 = 3;
const FINISH_RETRY_DELAY: Duration = Duration::from_millis(50);

/// A request for a worker to pick up a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Dispatch {
    /// Claim a queued job and make its first attempt.
    Claim(JobId),
    /// Make another attempt of a job this process already owns.
    Retry(JobId),
}

/// Jobs owned by this process, from claim until their terminal write, and the token used to
/// interrupt them.
#[derive(Clone, Default)]
pub(crate) struct InFlight(Arc<Mutex<FxHashMap<JobId, CancellationToken>>>);

impl InFlight {
    /// Takes ownership of `job_id`, returning [`None`] if it is already owned.
    fn register(&self, job_id: JobId) -> Option<CancellationToken> {
        let mut jobs = self.0.lock().unwrap_or_else(PoisonError::into_inner);
        if jobs.contains_key(&job_id) {
            return None;
        }
        let token = CancellationToken::new();
        jobs.insert(job_id, token.clone());
        Some(token)
    }

    fn get(&self, job_id: JobId) -> Option<CancellationToken> {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&job_id)
            .cloned()
    }

    fn release(&self, job_id: JobId) {
        self.0
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&job_id);
    }

    /// Interrupts the job's current attempt or pending retry. Returns whether the job was owned.
    pub(crate) fn cancel(&self, job_id: JobId) -> bool {
        match self.get(job_id) {
            Some(token) => {
                token.cancel();
                true
            }
            None => false,
        }
    }

    #[cfg(test)]
    pub(crate) fn len(&self) -> usize {
        self.0.lock().unwrap_or_else(PoisonError::into_inner).len()
    }
}

/// Drives jobs from claim to a terminal status on a fixed pool of workers.
pub(crate) struct JobRunner<S, W> {
    store: Arc<S>,
    adapter: Arc<WorkAdapter<W>>,
    policy: RetryPolicy,
    in_flight: InFlight,
    dispatcher: mpsc::Sender<Dispatch>,
    shutdown: CancellationToken,
}

impl<S, W> Clone for JobRunner<S, W> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            adapter: self.adapter.clone(),
            policy: self.policy.clone(),
            in_flight: self.in_flight.clone(),
            dispatcher: self.dispatcher.clone(),
            shutdown: self.shutdown.clone(),
        }
    }
}

impl<S, W> JobRunner<S, W>
where
    S: Store,
    W: WorkFunction,
{
    pub(crate) fn new(
        store: Arc<S>,
        adapter: WorkAdapter<W>,
        policy: RetryPolicy,
        in_flight: InFlight,
        dispatcher: mpsc::Sender<Dispatch>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            store,
            adapter: Arc::new(adapter),
            policy,
            in_flight,
            dispatcher,
            shutdown,
        }
    }

    /// Spawns `workers` tasks sharing `receiver`. Each worker handles one job at a time, which
    /// bounds the number of concurrent work function invocations to `workers`.
    pub(crate) fn spawn_workers(
        self,
        receiver: mpsc::Receiver<Dispatch>,
        workers: usize,
    ) -> Vec<JoinHandle<()>> {
        let receiver = Arc::new(tokio::sync::Mutex::new(receiver));
        (0..workers.max(1))
            .map(|worker| {
                let runner = self.clone();
                let receiver = receiver.clone();
                tokio::spawn(async move { runner.work(worker, receiver).await })
            })
            .collect()
    }

    async fn work(
        self,
        worker: usize,
        receiver: Arc<tokio::sync::Mutex<mpsc::Receiver<Dispatch>>>,
    ) {
        tracing::debug!(worker, "Starting job worker {worker}");
        loop {
            let dispatch = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                dispatch = async { receiver.lock().await.recv().await } => dispatch,
            };
            match dispatch {
                Some(dispatch) => self.handle(dispatch).await,
                None => break,
            }
        }
        tracing::debug!(worker, "Shutting down job worker {worker}");
    }

    pub(crate) async fn handle(&self, dispatch: Dispatch) {
        let owned = match dispatch {
            Dispatch::Claim(job_id) => self.claim(job_id).await,
            Dispatch::Retry(job_id) => self.begin_retry(job_id).await,
        };
        if let Some((job, token)) = owned {
            self.execute(job, token).await;
        }
    }

    #[instrument(skip(self))]
    async fn claim(&self, job_id: JobId) -> Option<(Job, CancellationToken)> {
        let Some(token) = self.in_flight.register(job_id) else {
            tracing::debug!(%job_id, "Job {job_id} is already in flight, skipping claim");
            return None;
        };
        match self
            .store
            .update(job_id, JobStatus::Queued, Mutation::Claim)
            .await
        {
            Ok(job) => {
                tracing::debug!(%job_id, "Claimed job {job_id}");
                Some((job, token))
            }
            Err(err) => {
                self.in_flight.release(job_id);
                if err.is_conflict() {
                    tracing::debug!(%job_id, "Job {job_id} was claimed elsewhere: {err}");
                } else {
                    tracing::error!(?err, %job_id, "Failed to claim job {job_id}, error: {err}");
                }
                None
            }
        }
    }

    #[instrument(skip(self))]
    async fn begin_retry(&self, job_id: JobId) -> Option<(Job, CancellationToken)> {
        let token = self.in_flight.get(job_id)?;
        if token.is_cancelled() {
            self.in_flight.release(job_id);
            return None;
        }
        match self
            .store
            .update(job_id, JobStatus::Running, Mutation::BeginAttempt)
            .await
        {
            Ok(job) => Some((job, token)),
            Err(err) => {
                self.in_flight.release(job_id);
                if err.is_conflict() {
                    tracing::debug!(%job_id, "Abandoning retry of job {job_id}: {err}");
                } else {
                    tracing::error!(?err, %job_id, "Failed to retry job {job_id}, error: {err}");
                }
                None
            }
        }
    }

    #[instrument(skip_all, fields(job_id = %job.id, attempt = job.attempt_count))]
    async fn execute(&self, job: Job, token: CancellationToken) {
        let job_id = job.id;
        match self.adapter.invoke(&job, &token).await {
            Ok(result) => {
                tracing::debug!(%job_id, "Job complete {job_id}");
                self.finish(job_id, Mutation::Complete { result }).await;
            }
            Err(error) => match self.policy.decide(job.attempt_count, &error) {
                RetryDecision::RetryAfter(delay) => {
                    tracing::warn!(
                        %job_id,
                        ?error,
                        "Job {job_id} attempt {} failed and will be retried in {delay}: error type: {}, message: {}",
                        job.attempt_count,
                        error.error_type,
                        error.message
                    );
                    self.schedule_retry(job_id, delay, token);
                }
                RetryDecision::GiveUp => {
                    tracing::error!(
                        %job_id,
                        ?error,
                        "Job {job_id} failed after {} attempt(s): error type: {}, message: {}",
                        job.attempt_count,
                        error.error_type,
                        error.message
                    );
                    self.finish(job_id, Mutation::Fail { error }).await;
                }
            },
        }
    }

    /// Writes the terminal outcome, retrying transient store failures a bounded number of times.
    /// A job whose outcome cannot be written stays `running` until the next start.
    async fn finish(&self, job_id: JobId, mutation: Mutation) {
        for attempt in 1..=FINISH_ATTEMPTS {
            match self
                .store
                .update(job_id, JobStatus::Running, mutation.clone())
                .await
            {
                Ok(_) => break,
                Err(err) if err.is_conflict() => {
                    tracing::debug!(%job_id, "Discarding outcome of job {job_id}: {err}");
                    break;
                }
                Err(err) if attempt < FINISH_ATTEMPTS => {
                    tracing::warn!(
                        ?err,
                        %job_id,
                        "Failed to record outcome of job {job_id}, retrying: {err}"
                    );
                    tokio::time::sleep(FINISH_RETRY_DELAY * attempt).await;
                }
                Err(err) => tracing::error!(
                    ?err,
                    %job_id,
                    "Failed to record outcome of job {job_id}, error: {err:?}",
                ),
            }
        }
        self.in_flight.release(job_id);
    }

    fn schedule_retry(&self, job_id: JobId, delay: TimeDelta, token: CancellationToken) {
        let dispatcher = self.dispatcher.clone();
        let in_flight = self.in_flight.clone();
        let shutdown = self.shutdown.clone();
        let delay = delay.to_std().unwrap_or(Duration::ZERO);
        tokio::spawn(
            async move {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        if dispatcher.send(Dispatch::Retry(job_id)).await.is_err() {
                            tracing::warn!(%job_id, "Job queue closed, job {job_id} will not be retried");
                            in_flight.release(job_id);
                        }
                    }
                    _ = token.cancelled() => {
                        tracing::debug!(%job_id, "Pending retry of job {job_id} cancelled");
                        in_flight.release(job_id);
                    }
                    _ = shutdown.cancelled() => {}
                }
            }
            .in_current_span(),
        );
    }
}

#[cfg(test)]
mod test {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use chrono::TimeDelta;

    use super::*;
    use crate::{
        backoff::BackoffStrategy,
        store::{memory::InMemoryStore, MockStore, StoreError},
        testing::{Script, ScriptedWork},
        work::WorkError,
    };

    struct Harness {
        store: Arc<InMemoryStore>,
        runner: JobRunner<InMemoryStore, ScriptedWork>,
        work: ScriptedWork,
        receiver: mpsc::Receiver<Dispatch>,
    }

    fn harness(max_attempts: u32) -> Harness {
        let store = Arc::new(InMemoryStore::new());
        let work = ScriptedWork::default();
        let (sender, receiver) = mpsc::channel(16);
        let runner = JobRunner::new(
            store.clone(),
            WorkAdapter::new(work.clone(), Duration::from_secs(5)),
            RetryPolicy::new(
                max_attempts,
                BackoffStrategy::constant(TimeDelta::milliseconds(1)),
            ),
            InFlight::default(),
            sender,
            CancellationToken::new(),
        );
        Harness {
            store,
            runner,
            work,
            receiver,
        }
    }

    impl Harness {
        async fn submit(&self, script: Script) -> JobId {
            let job = Job::new("tenant".into(), serde_json::to_value(script).unwrap());
            let id = job.id;
            self.store.create(job).await.unwrap();
            id
        }

        /// Handles dispatches, including retries, until the job is terminal.
        async fn drive(&mut self, job_id: JobId) -> Job {
            self.runner.handle(Dispatch::Claim(job_id)).await;
            loop {
                let job = self.store.get(job_id).await.unwrap();
                if job.is_terminal() {
                    return job;
                }
                let dispatch = tokio::time::timeout(Duration::from_secs(1), self.receiver.recv())
                    .await
                    .unwrap()
                    .unwrap();
                self.runner.handle(dispatch).await;
            }
        }
    }

    #[tokio::test]
    async fn successful_job_completes_after_one_attempt() {
        let mut harness = harness(3);
        let job_id = harness.submit(Script::AlwaysSucceed).await;

        let job = harness.drive(job_id).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.result, Some(ScriptedWork::output()));
        assert_eq!(job.attempt_count, 1);
        assert_eq!(harness.runner.in_flight.len(), 0);
    }

    #[tokio::test]
    async fn transient_failures_are_retried_until_success() {
        let mut harness = harness(3);
        let job_id = harness.submit(Script::FailTwiceThenSucceed).await;

        let job = harness.drive(job_id).await;

        assert_eq!(job.status, JobStatus::Completed);
        assert_eq!(job.attempt_count, 3);
        assert_eq!(harness.work.probe().calls(job_id), 3);
    }

    #[tokio::test]
    async fn retries_are_exhausted_at_max_attempts() {
        let mut harness = harness(2);
        let job_id = harness.submit(Script::AlwaysFailTransient).await;

        let job = harness.drive(job_id).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, 2);
        assert!(job.error.unwrap().transient);
        assert!(job.result.is_none());
    }

    #[tokio::test]
    async fn permanent_failure_is_not_retried() {
        let mut harness = harness(3);
        let job_id = harness.submit(Script::AlwaysFailPermanent).await;

        let job = harness.drive(job_id).await;

        assert_eq!(job.status, JobStatus::Failed);
        assert_eq!(job.attempt_count, 1);
        assert!(!job.error.unwrap().transient);
    }

    #[tokio::test]
    async fn claiming_twice_invokes_once() {
        let harness = harness(3);
        let job_id = harness.submit(Script::AlwaysSucceed).await;

        harness.runner.handle(Dispatch::Claim(job_id)).await;
        harness.runner.handle(Dispatch::Claim(job_id)).await;

        assert_eq!(harness.work.probe().calls(job_id), 1);
        assert_eq!(
            harness.store.get(job_id).await.unwrap().status,
            JobStatus::Completed
        );
    }

    #[tokio::test]
    async fn concurrent_claims_of_one_job_never_overlap() {
        let harness = harness(3);
        let job_id = harness.submit(Script::Sleep { millis: 20 }).await;

        futures::future::join_all((0..4).map(|_| harness.runner.handle(Dispatch::Claim(job_id))))
            .await;

        assert_eq!(harness.work.probe().calls(job_id), 1);
        assert_eq!(harness.work.probe().max_in_flight_per_job(), 1);
    }

    #[tokio::test]
    async fn retry_of_unowned_job_is_ignored() {
        let harness = harness(3);
        let job_id = harness.submit(Script::AlwaysSucceed).await;

        harness.runner.handle(Dispatch::Retry(job_id)).await;

        assert_eq!(harness.work.probe().calls(job_id), 0);
        assert_eq!(
            harness.store.get(job_id).await.unwrap().status,
            JobStatus::Queued
        );
    }

    #[tokio::test]
    async fn cancelled_pending_retry_is_abandoned() {
        let mut harness = harness(3);
        let job_id = harness.submit(Script::AlwaysFailTransient).await;
        harness.runner.handle(Dispatch::Claim(job_id)).await;

        harness
            .store
            .update(
                job_id,
                JobStatus::Running,
                Mutation::Fail {
                    error: WorkError::cancelled(),
                },
            )
            .await
            .unwrap();
        assert!(harness.runner.in_flight.cancel(job_id));

        tokio::time::sleep(Duration::from_millis(20)).await;
        while let Ok(dispatch) = harness.receiver.try_recv() {
            harness.runner.handle(dispatch).await;
        }

        let job = harness.store.get(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.error.unwrap().is_cancellation());
        assert_eq!(job.attempt_count, 1);
        assert_eq!(harness.runner.in_flight.len(), 0);
    }

    #[tokio::test]
    async fn outcome_losing_race_is_discarded() {
        let harness = harness(3);
        let job_id = harness.submit(Script::Sleep { millis: 50 }).await;

        let runner = harness.runner.clone();
        let handle = tokio::spawn(async move { runner.handle(Dispatch::Claim(job_id)).await });
        tokio::time::sleep(Duration::from_millis(10)).await;
        harness
            .store
            .update(
                job_id,
                JobStatus::Running,
                Mutation::Fail {
                    error: WorkError::cancelled(),
                },
            )
            .await
            .unwrap();
        handle.await.unwrap();

        let job = harness.store.get(job_id).await.unwrap();
        assert_eq!(job.status, JobStatus::Failed);
        assert!(job.result.is_none());
        assert_eq!(job.error, Some(WorkError::cancelled()));
    }

    #[tokio::test]
    async fn outcome_write_is_retried_when_store_is_unavailable() {
        let mut claimed = Job::new(
            "tenant".into(),
            serde_json::to_value(Script::AlwaysSucceed).unwrap(),
        );
        claimed.status = JobStatus::Running;
        claimed.attempt_count = 1;
        let job_id = claimed.id;
        let writes = Arc::new(AtomicUsize::new(0));

        let mut store = MockStore::new();
        store
            .expect_update()
            .withf(|_, expected, mutation| {
                *expected == JobStatus::Queued && *mutation == Mutation::Claim
            })
            .times(1)
            .returning(move |_, _, _| Ok(claimed.clone()));
        store
            .expect_update()
            .withf(|_, _, mutation| matches!(mutation, Mutation::Complete { .. }))
            .times(2)
            .returning({
                let writes = writes.clone();
                move |id, _, _| match writes.fetch_add(1, Ordering::SeqCst) {
                    0 => Err(StoreError::Unavailable("database is locked".to_owned())),
                    _ => {
                        let mut job = Job::new("tenant".into(), serde_json::Value::Null);
                        job.id = id;
                        job.status = JobStatus::Completed;
                        Ok(job)
                    }
                }
            });
        let work = ScriptedWork::default();
        let (sender, _receiver) = mpsc::channel(1);
        let runner = JobRunner::new(
            Arc::new(store),
            WorkAdapter::new(work.clone(), Duration::from_secs(5)),
            RetryPolicy::default(),
            InFlight::default(),
            sender,
            CancellationToken::new(),
        );

        runner.handle(Dispatch::Claim(job_id)).await;

        assert_eq!(writes.load(Ordering::SeqCst), 2);
        assert_eq!(work.probe().calls(job_id), 1);
        assert_eq!(runner.in_flight.len(), 0);
    }

    #[tokio::test]
    async fn workers_stop_on_shutdown() {
        let harness = harness(3);
        let shutdown = harness.runner.shutdown.clone();
        let handles = harness.runner.spawn_workers(harness.receiver, 2);

        shutdown.cancel();

        for handle in handles {
            tokio::time::timeout(Duration::from_secs(1), handle)
                .await
                .unwrap()
                .unwrap();
        }
    }
}
