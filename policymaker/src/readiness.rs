use std::time;

use policymaker_common::broker::{Broker, BrokerError, RUNNING};
use policymaker_common::metrics::READINESS_WAIT_SECONDS;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::error::ReadinessError;

/// Polls a queue until the broker reports it as running.
///
/// Every mutation of a queue's policy or mirrors is followed by a wait, so the next action only
/// runs against a settled queue. Without a timeout the wait is unbounded; a shutdown
/// cancels it either way.
#[derive(Clone)]
pub struct ReadinessWaiter {
    /// The interval between two polls.
    interval: time::Duration,
    /// Upper bound for a single wait.
    timeout: Option<time::Duration>,
    shutdown: CancellationToken,
}

impl ReadinessWaiter {
    pub fn new(
        interval: time::Duration,
        timeout: Option<time::Duration>,
        shutdown: CancellationToken,
    ) -> Self {
        Self {
            interval,
            timeout,
            shutdown,
        }
    }

    /// True once shutdown was requested. Nothing new should be started on the broker then.
    pub fn is_shutting_down(&self) -> bool {
        self.shutdown.is_cancelled()
    }

    pub async fn wait_until_running(
        &self,
        broker: &dyn Broker,
        vhost: &str,
        queue: &str,
    ) -> Result<(), ReadinessError> {
        let started = tokio::time::Instant::now();

        let result = match self.timeout {
            Some(timeout) => tokio::time::timeout(timeout, self.poll(broker, vhost, queue))
                .await
                .unwrap_or_else(|_| {
                    Err(ReadinessError::TimedOut {
                        vhost: vhost.to_owned(),
                        queue: queue.to_owned(),
                        waited: timeout,
                    })
                }),
            None => self.poll(broker, vhost, queue).await,
        };

        metrics::histogram!(READINESS_WAIT_SECONDS).record(started.elapsed().as_secs_f64());

        result
    }

    async fn poll(
        &self,
        broker: &dyn Broker,
        vhost: &str,
        queue: &str,
    ) -> Result<(), ReadinessError> {
        loop {
            if self.shutdown.is_cancelled() {
                return Err(self.cancelled(vhost, queue));
            }

            match broker.get_queue(vhost, queue).await {
                Ok(details) => match details.require_state() {
                    Ok(RUNNING) => {
                        info!(vhost, queue, state = RUNNING, "queue is running");
                        return Ok(());
                    }
                    Ok(state) => info!(vhost, queue, state, "queue is not running yet"),
                    Err(error) => warn!(vhost, queue, %error, "broker API not ready to answer"),
                },
                Err(error @ BrokerError::TransientFieldMissing { .. }) => {
                    warn!(vhost, queue, %error, "broker API not ready to answer")
                }
                Err(source) => {
                    return Err(ReadinessError::Broker {
                        vhost: vhost.to_owned(),
                        queue: queue.to_owned(),
                        source,
                    })
                }
            }

            tokio::select! {
                _ = self.shutdown.cancelled() => return Err(self.cancelled(vhost, queue)),
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
    }

    fn cancelled(&self, vhost: &str, queue: &str) -> ReadinessError {
        ReadinessError::Cancelled {
            vhost: vhost.to_owned(),
            queue: queue.to_owned(),
        }
    }
}
