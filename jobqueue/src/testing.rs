//! Helpers for testing code built on the engine.
//!
//! [`ScriptedWork`] is a [`WorkFunction`] whose behaviour is chosen by the request itself, and
//! which records every invocation in a [`Probe`] so tests can assert on attempt counts and
//! concurrency.
use std::{
    sync::{
        atomic::{AtomicUsize, Ordering},
        Arc, Mutex, PoisonError,
    },
    time::Duration,
};

use async_trait::async_trait;
use fxhash::FxHashMap;
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::{
    job::{Job, JobId, TenantId},
    store::Store,
    work::{WorkContext, WorkError, WorkFunction},
    JobQueue, JobQueueError,
};

/// The behaviour of a [`ScriptedWork`] invocation, encoded in the job's request as
/// `{"op": "<kebab-case name>", ...}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum Script {
    AlwaysSucceed,
    /// Fails transiently on the first two attempts.
    FailTwiceThenSucceed,
    AlwaysFailPermanent,
    AlwaysFailTransient,
    Panic,
    /// Succeeds after sleeping, stopping early if cancelled.
    Sleep {
        millis: u64,
    },
    /// Blocks its thread without yielding, ignoring cancellation until it returns.
    Block {
        millis: u64,
    },
    /// Like [`Script::Sleep`] but overrides the timeout of the invocation.
    SleepWithTimeout {
        millis: u64,
        timeout_millis: u64,
    },
}

/// Invocation counters shared by all clones of a [`ScriptedWork`].
#[derive(Debug, Default)]
pub struct Probe {
    running: AtomicUsize,
    max_running: AtomicUsize,
    max_in_flight_per_job: AtomicUsize,
    jobs: Mutex<FxHashMap<JobId, JobCounters>>,
}

#[derive(Debug, Default, Clone, Copy)]
struct JobCounters {
    in_flight: usize,
    calls: usize,
}

impl Probe {
    /// Invocations currently running.
    pub fn running(&self) -> usize {
        self.running.load(Ordering::SeqCst)
    }

    /// The most invocations ever observed running at once, across all jobs.
    pub fn max_running(&self) -> usize {
        self.max_running.load(Ordering::SeqCst)
    }

    /// The most invocations ever observed running at once for a single job.
    pub fn max_in_flight_per_job(&self) -> usize {
        self.max_in_flight_per_job.load(Ordering::SeqCst)
    }

    /// Total invocations made for `job_id`.
    pub fn calls(&self, job_id: JobId) -> usize {
        self.jobs()
            .get(&job_id)
            .map(|counters| counters.calls)
            .unwrap_or(0)
    }

    fn jobs(&self) -> std::sync::MutexGuard<'_, FxHashMap<JobId, JobCounters>> {
        self.jobs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn enter(self: &Arc<Self>, job_id: JobId) -> InvocationGuard {
        let in_flight = {
            let mut jobs = self.jobs();
            let counters = jobs.entry(job_id).or_default();
            counters.calls += 1;
            counters.in_flight += 1;
            counters.in_flight
        };
        self.max_in_flight_per_job
            .fetch_max(in_flight, Ordering::SeqCst);
        let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_running.fetch_max(running, Ordering::SeqCst);
        InvocationGuard {
            probe: self.clone(),
            job_id,
        }
    }
}

struct InvocationGuard {
    probe: Arc<Probe>,
    job_id: JobId,
}

impl Drop for InvocationGuard {
    fn drop(&mut self) {
        if let Some(counters) = self.probe.jobs().get_mut(&self.job_id) {
            counters.in_flight -= 1;
        }
        self.probe.running.fetch_sub(1, Ordering::SeqCst);
    }
}

/// A [`WorkFunction`] driven by [`Script`] requests.
#[derive(Debug, Clone, Default)]
pub struct ScriptedWork {
    probe: Arc<Probe>,
}

impl ScriptedWork {
    /// The result produced by every successful invocation.
    pub fn output() -> serde_json::Value {
        json!({"output": "success"})
    }

    pub fn probe(&self) -> &Probe {
        &self.probe
    }
}

#[async_trait]
impl WorkFunction for ScriptedWork {
    type Request = Script;
    type Output = serde_json::Value;
    const NAME: &'static str = "scripted";

    async fn call(
        &self,
        request: Script,
        context: WorkContext,
    ) -> Result<serde_json::Value, WorkError> {
        let _guard = self.probe.enter(context.job_id);
        match request {
            Script::AlwaysSucceed => Ok(Self::output()),
            Script::FailTwiceThenSucceed if context.attempt <= 2 => Err(WorkError::transient(
                format!("scripted failure on attempt {}", context.attempt),
            )),
            Script::FailTwiceThenSucceed => Ok(Self::output()),
            Script::AlwaysFailPermanent => Err(WorkError::permanent("scripted permanent failure")),
            Script::AlwaysFailTransient => Err(WorkError::transient("scripted transient failure")),
            Script::Panic => panic!("scripted panic"),
            Script::Block { millis } => {
                std::thread::sleep(Duration::from_millis(millis));
                Ok(Self::output())
            }
            Script::Sleep { millis } | Script::SleepWithTimeout { millis, .. } => {
                tokio::select! {
                    _ = tokio::time::sleep(Duration::from_millis(millis)) => Ok(Self::output()),
                    _ = context.cancellation.cancelled() => Err(WorkError::cancelled()),
                }
            }
        }
    }

    fn timeout(&self, request: &Script) -> Option<Duration> {
        match request {
            Script::SleepWithTimeout { timeout_millis, .. } => {
                Some(Duration::from_millis(*timeout_millis))
            }
            _ => None,
        }
    }
}

/// Polls `queue` until the job is terminal, returning [`None`] if it is not within `timeout`.
pub async fn wait_for_terminal<S, W>(
    queue: &JobQueue<S, W>,
    tenant_id: &TenantId,
    job_id: JobId,
    timeout: Duration,
) -> Result<Option<Job>, JobQueueError>
where
    S: Store,
    W: WorkFunction,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        let job = queue.get(tenant_id, job_id).await?;
        if job.is_terminal() {
            return Ok(Some(job));
        }
        if tokio::time::Instant::now() >= deadline {
            return Ok(None);
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
