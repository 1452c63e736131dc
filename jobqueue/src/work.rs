//! The work function contract and the adapter that invokes it.
//!
//! The engine never interprets a job's request. A [`WorkFunction`] receives the decoded request
//! and either produces an output or fails with a [`WorkError`]. The adapter adds three
//! guarantees on top of any work function:
//!
//! - every invocation is bounded by a timeout,
//! - a panic inside the work function becomes a transient [`WorkError`] rather than taking down
//!   a worker, and
//! - cancellation of the job interrupts the invocation through its [`CancellationToken`].
use std::{sync::Arc, time::Duration};

use async_trait::async_trait;
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use thiserror::Error;
use tokio::task::{JoinError, JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{instrument, Instrument};

use crate::job::{Job, JobId, TenantId};

/// The computation the engine executes for every job.
///
/// # Example
///
/// ```
/// use jobqueue::prelude::*;
/// use serde::{Deserialize, Serialize};
///
/// #[derive(Serialize, Deserialize)]
/// struct Greet {
///     name: String,
/// }
///
/// struct Greeter;
///
/// #[async_trait::async_trait]
/// impl WorkFunction for Greeter {
///     type Request = Greet;
///     type Output = String;
///     const NAME: &'static str = "greeter";
///
///     async fn call(&self, request: Greet, _context: WorkContext) -> Result<String, WorkError> {
///         if request.name.is_empty() {
///             return Err(WorkError::permanent("name must not be empty"));
///         }
///         Ok(format!("Hello, {}!", request.name))
///     }
/// }
/// ```
#[async_trait]
pub trait WorkFunction: Send + Sync + 'static {
    /// The caller supplied payload, stored verbatim as the job's `request`.
    type Request: Serialize + DeserializeOwned + Send + Sync;
    /// The value stored as the job's `result` on success.
    type Output: Serialize + Send;
    /// Used to identify the work function in logs.
    const NAME: &'static str;

    async fn call(
        &self,
        request: Self::Request,
        context: WorkContext,
    ) -> Result<Self::Output, WorkError>;

    /// Overrides the engine wide timeout for a single request.
    fn timeout(&self, _request: &Self::Request) -> Option<Duration> {
        None
    }
}

/// Information about the invocation passed alongside the request.
#[derive(Debug, Clone)]
pub struct WorkContext {
    pub job_id: JobId,
    pub tenant_id: TenantId,
    /// The attempt being made, starting at 1.
    pub attempt: u32,
    /// Cancelled when the invocation times out or the job is cancelled. Long running work
    /// should select on [`CancellationToken::cancelled`] to stop early.
    pub cancellation: CancellationToken,
}

/// The error produced by a failed invocation of a [`WorkFunction`].
///
/// It is recorded verbatim as the `error` of a job that failed.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[error("{error_type} error: {message}")]
pub struct WorkError {
    pub error_type: ErrorType,
    pub message: String,
    /// Transient errors may succeed when retried, permanent ones never will.
    pub transient: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorType {
    Panic,
    Timeout,
    Cancelled,
    InvalidRequest,
    Interrupted,
    #[serde(untagged)]
    Other(String),
}

impl std::fmt::Display for ErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let val = match self {
            Self::Panic => "panic",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
            Self::InvalidRequest => "invalid_request",
            Self::Interrupted => "interrupted",
            Self::Other(val) => val,
        };
        write!(f, "{val}")
    }
}

const ERROR_TYPE_WORK: &str = "work";

impl WorkError {
    /// An error worth retrying, e.g. a rate limit or a dropped connection.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            error_type: ErrorType::Other(ERROR_TYPE_WORK.to_owned()),
            message: message.into(),
            transient: true,
        }
    }

    /// An error that will not go away by retrying, e.g. a malformed request.
    pub fn permanent(message: impl Into<String>) -> Self {
        Self {
            error_type: ErrorType::Other(ERROR_TYPE_WORK.to_owned()),
            message: message.into(),
            transient: false,
        }
    }

    /// Replaces the error type, useful for distinguishing failures of one work function.
    pub fn with_type(self, error_type: impl Into<String>) -> Self {
        Self {
            error_type: ErrorType::Other(error_type.into()),
            ..self
        }
    }

    pub fn cancelled() -> Self {
        Self {
            error_type: ErrorType::Cancelled,
            message: "Job was cancelled".to_owned(),
            transient: false,
        }
    }

    pub(crate) fn timeout(timeout: Duration) -> Self {
        Self {
            error_type: ErrorType::Timeout,
            message: format!("Job failed to complete within timeout: {timeout:?}"),
            transient: true,
        }
    }

    pub(crate) fn interrupted() -> Self {
        Self {
            error_type: ErrorType::Interrupted,
            message: "Job was running when the engine stopped".to_owned(),
            transient: false,
        }
    }

    fn invalid_request(error: serde_json::Error) -> Self {
        Self {
            error_type: ErrorType::InvalidRequest,
            message: format!("Failed to decode request: {error}"),
            transient: false,
        }
    }

    pub fn is_transient(&self) -> bool {
        self.transient
    }

    pub fn is_cancellation(&self) -> bool {
        self.error_type == ErrorType::Cancelled
    }
}

impl From<JoinError> for WorkError {
    fn from(value: JoinError) -> Self {
        if value.is_cancelled() {
            return Self::cancelled();
        }
        let msg = value.to_string();
        let message = match value.try_into_panic() {
            Ok(panic) => panic
                .downcast_ref::<&str>()
                .map(ToString::to_string)
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or(msg),
            Err(_) => msg,
        };
        Self {
            error_type: ErrorType::Panic,
            message,
            transient: true,
        }
    }
}

/// Wraps a [`WorkFunction`] behind the uniform `job -> result | WorkError` call used by the
/// runner.
pub(crate) struct WorkAdapter<W> {
    work: Arc<W>,
    default_timeout: Duration,
}

impl<W> WorkAdapter<W>
where
    W: WorkFunction,
{
    pub(crate) fn new(work: W, default_timeout: Duration) -> Self {
        Self {
            work: Arc::new(work),
            default_timeout,
        }
    }

    #[instrument(skip_all, fields(job_id = %job.id, attempt = job.attempt_count, work = W::NAME))]
    pub(crate) async fn invoke(
        &self,
        job: &Job,
        cancellation: &CancellationToken,
    ) -> Result<serde_json::Value, WorkError> {
        let request: W::Request =
            serde_json::from_value(job.request.clone()).map_err(WorkError::invalid_request)?;
        let timeout = self.work.timeout(&request).unwrap_or(self.default_timeout);
        let context = WorkContext {
            job_id: job.id,
            tenant_id: job.tenant_id.clone(),
            attempt: job.attempt_count,
            cancellation: cancellation.child_token(),
        };
        let invocation = context.cancellation.clone();

        tracing::debug!(job_id = %job.id, "Invoking {} for job {}", W::NAME, job.id);
        let work = self.work.clone();
        let mut handle =
            tokio::spawn(async move { work.call(request, context).await }.in_current_span());

        let outcome = tokio::select! {
            outcome = tokio::time::timeout(timeout, &mut handle) => outcome,
            _ = cancellation.cancelled() => {
                Self::stop(handle).await;
                return Err(WorkError::cancelled());
            }
        };

        match outcome {
            Ok(Ok(Ok(output))) => serde_json::to_value(output).map_err(|error| {
                WorkError::permanent(format!("Failed to encode output: {error}"))
                    .with_type("encode")
            }),
            Ok(Ok(Err(error))) => Err(error),
            Ok(Err(join_error)) => Err(join_error.into()),
            Err(_elapsed) => {
                invocation.cancel();
                Self::stop(handle).await;
                Err(WorkError::timeout(timeout))
            }
        }
    }

    /// Aborts the invocation and waits for its task to end. Abort only lands at the next await
    /// point, so a work function that does not yield keeps running until it does.
    async fn stop(handle: JoinHandle<Result<W::Output, WorkError>>) {
        handle.abort();
        if let Err(err) = handle.await {
            if err.is_panic() {
                tracing::warn!(?err, "Work function panicked while being stopped");
            }
        }
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;
    use serde_json::json;

    use super::*;
    use crate::testing::{Script, ScriptedWork};

    fn job(script: Script) -> Job {
        let mut job = Job::new("tenant".into(), serde_json::to_value(script).unwrap());
        job.attempt_count = 1;
        job
    }

    fn adapter(work: ScriptedWork) -> WorkAdapter<ScriptedWork> {
        WorkAdapter::new(work, Duration::from_secs(5))
    }

    #[tokio::test]
    async fn successful_invocation_returns_encoded_output() {
        let result = adapter(ScriptedWork::default())
            .invoke(&job(Script::AlwaysSucceed), &CancellationToken::new())
            .await;

        assert_eq!(result, Ok(ScriptedWork::output()));
    }

    #[tokio::test]
    async fn work_errors_are_passed_through() {
        let result = adapter(ScriptedWork::default())
            .invoke(&job(Script::AlwaysFailPermanent), &CancellationToken::new())
            .await;

        assert_matches!(result, Err(WorkError { transient: false, .. }));
    }

    #[tokio::test]
    async fn panics_become_transient_errors() {
        let work = ScriptedWork::default();
        let result = adapter(work.clone())
            .invoke(&job(Script::Panic), &CancellationToken::new())
            .await;

        let error = result.unwrap_err();
        assert_eq!(error.error_type, ErrorType::Panic);
        assert_eq!(error.message, "scripted panic");
        assert!(error.transient);
        assert_eq!(work.probe().running(), 0);
    }

    #[tokio::test]
    async fn slow_invocations_time_out() {
        let work = ScriptedWork::default();
        let adapter = WorkAdapter::new(work.clone(), Duration::from_millis(20));

        let result = adapter
            .invoke(
                &job(Script::Sleep { millis: 10_000 }),
                &CancellationToken::new(),
            )
            .await;

        let error = result.unwrap_err();
        assert_eq!(error.error_type, ErrorType::Timeout);
        assert!(error.transient);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn timed_out_invocation_has_ended_on_return() {
        let work = ScriptedWork::default();
        let adapter = WorkAdapter::new(work.clone(), Duration::from_millis(20));

        let result = adapter
            .invoke(&job(Script::Block { millis: 100 }), &CancellationToken::new())
            .await;

        assert_eq!(result.unwrap_err().error_type, ErrorType::Timeout);
        assert_eq!(work.probe().running(), 0);
    }

    #[tokio::test]
    async fn work_function_can_override_timeout() {
        let adapter = WorkAdapter::new(ScriptedWork::default(), Duration::from_secs(60));

        let result = adapter
            .invoke(
                &job(Script::SleepWithTimeout {
                    millis: 10_000,
                    timeout_millis: 20,
                }),
                &CancellationToken::new(),
            )
            .await;

        assert_matches!(
            result,
            Err(WorkError {
                error_type: ErrorType::Timeout,
                ..
            })
        );
    }

    #[tokio::test]
    async fn cancellation_interrupts_invocation() {
        let token = CancellationToken::new();
        let adapter = adapter(ScriptedWork::default());
        let job = job(Script::Sleep { millis: 10_000 });

        let handle = tokio::spawn({
            let token = token.clone();
            async move { adapter.invoke(&job, &token).await }
        });
        tokio::time::sleep(Duration::from_millis(10)).await;
        token.cancel();

        let result = tokio::time::timeout(Duration::from_secs(1), handle)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(result, Err(WorkError::cancelled()));
    }

    #[tokio::test]
    async fn undecodable_request_is_a_permanent_error() {
        let mut job = Job::new("tenant".into(), json!({"op": "no-such-op"}));
        job.attempt_count = 1;
        let work = ScriptedWork::default();

        let result = adapter(work.clone())
            .invoke(&job, &CancellationToken::new())
            .await;

        let error = result.unwrap_err();
        assert_eq!(error.error_type, ErrorType::InvalidRequest);
        assert!(!error.transient);
        assert_eq!(work.probe().calls(job.id), 0);
    }

    #[test]
    fn error_types_serialize_as_strings() {
        let error = WorkError::transient("rate limited").with_type("rate_limit");

        assert_eq!(
            serde_json::to_value(&error).unwrap(),
            json!({"error_type": "rate_limit", "message": "rate limited", "transient": true})
        );
        assert_eq!(
            serde_json::to_value(WorkError::cancelled()).unwrap()["error_type"],
            json!("cancelled")
        );
        let decoded: WorkError = serde_json::from_value(
            json!({"error_type": "timeout", "message": "slow", "transient": true}),
        )
        .unwrap();
        assert_eq!(decoded.error_type, ErrorType::Timeout);
    }
}
