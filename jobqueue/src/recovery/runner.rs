use std::{ops::Sub, time::Duration};

use chrono::{TimeDelta, Utc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::store::Store;

use super::Recovery;

/// Runs the stranded job scan immediately and then on every tick of `schedule`.
pub(crate) struct RecoveryRunner<S> {
    recovery: Recovery<S>,
    schedule: cron::Schedule,
}

impl<S> RecoveryRunner<S>
where
    S: Store,
{
    pub(crate) fn new(recovery: Recovery<S>, schedule: cron::Schedule) -> Self {
        Self { recovery, schedule }
    }

    pub(crate) fn spawn(self, cancellation_token: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.scan().await;
            loop {
                let Some(next) = self.schedule.upcoming(Utc).next() else {
                    tracing::warn!("No future scheduled time for the recovery scan");
                    break;
                };
                let delay = next
                    .sub(Utc::now())
                    .sub(TimeDelta::milliseconds(10))
                    .to_std()
                    .unwrap_or(Duration::ZERO);
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        let delay = next - Utc::now();
                        if let Ok(delay) = delay.to_std() {
                            tokio::time::sleep(delay).await;
                        }
                        self.scan().await;
                    }
                    _ = cancellation_token.cancelled() => {
                        tracing::debug!("Shutting down the recovery runner");
                        break;
                    },
                }
            }
        })
    }

    async fn scan(&self) {
        let _ = self
            .recovery
            .requeue_stranded_jobs()
            .await
            .inspect_err(|err| {
                tracing::error!(?err, "Failed to scan for stranded jobs, error: {err}")
            });
    }
}
