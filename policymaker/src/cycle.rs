use std::time;

use policymaker_common::broker::{Broker, BrokerError};
use policymaker_common::health::{ComponentStatus, HealthHandle};
use policymaker_common::metrics::{
    CYCLES, POLICIES_CREATED, POLICY_FAILURES, QUEUES_WITHOUT_POLICY,
};
use policymaker_common::retry::RetryPolicy;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::balancer::{LoadBalancer, RelocationOutcome};
use crate::error::CycleError;
use crate::policy::{PolicyEngine, PolicyOutcome};

/// What a single evaluation cycle did.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct CycleReport {
    pub queues_without_policy: usize,
    pub policies_created: usize,
    pub policies_dry_run: usize,
    pub policy_failures: usize,
    /// `None` when balancing is disabled.
    pub relocation: Option<RelocationOutcome>,
}

/// Runs the Policy Engine then the Load Balancer, one after the other, once per cycle.
pub struct Policymaker {
    engine: PolicyEngine,
    balancer: LoadBalancer,
    balancing: bool,
}

impl Policymaker {
    pub fn new(engine: PolicyEngine, balancer: LoadBalancer, balancing: bool) -> Self {
        Self {
            engine,
            balancer,
            balancing,
        }
    }

    /// One evaluation cycle against a fresh read of the broker state.
    ///
    /// A queue whose policy could not be installed is logged and skipped. Failing to list the
    /// cluster state ends the cycle.
    pub async fn run_cycle(&self) -> Result<CycleReport, CycleError> {
        let queues = self.engine.find_queues_needing_policy().await?;
        metrics::gauge!(QUEUES_WITHOUT_POLICY).set(queues.len() as f64);
        info!(count = queues.len(), "queues without policy");

        let mut report = CycleReport {
            queues_without_policy: queues.len(),
            ..Default::default()
        };

        for queue in &queues {
            match self.engine.create_policy(&queue.vhost, &queue.name).await {
                Ok(PolicyOutcome::Created(_)) => {
                    metrics::counter!(POLICIES_CREATED).increment(1);
                    report.policies_created += 1;
                }
                Ok(PolicyOutcome::DryRun(_)) => report.policies_dry_run += 1,
                Err(error) if error.is_cancelled() => return Err(CycleError::Cancelled),
                Err(error) => {
                    error!(vhost = %queue.vhost, queue = %queue.name, %error, "failed to create policy");
                    metrics::counter!(POLICY_FAILURES).increment(1);
                    report.policy_failures += 1;
                }
            }
        }

        if self.balancing {
            let outcome = self.balancer.relocate().await.map_err(|error| {
                if error.is_cancelled() {
                    CycleError::Cancelled
                } else {
                    CycleError::Balance(error)
                }
            })?;
            self.balancer.report_queues_on_nodes().await?;
            report.relocation = Some(outcome);
        }

        for (vhost, queues) in self.engine.queues_by_vhost().await? {
            info!(vhost = %vhost, queues = queues.len(), "queues in vhost");
        }

        Ok(report)
    }

    /// Run cycles until shutdown, a fatal error, or after the first cycle in `run_once` mode.
    pub async fn run(
        &self,
        interval: time::Duration,
        run_once: bool,
        liveness: &HealthHandle,
        shutdown: &CancellationToken,
    ) -> Result<(), CycleError> {
        loop {
            let result = self.run_cycle().await;
            metrics::counter!(CYCLES, "result" => cycle_result_label(&result)).increment(1);

            match result {
                Ok(report) => {
                    info!(
                        created = report.policies_created,
                        dry_run = report.policies_dry_run,
                        failed = report.policy_failures,
                        relocation = ?report.relocation,
                        "cycle completed"
                    );
                    liveness.report_healthy();
                }
                Err(CycleError::Cancelled) => {
                    info!("cycle interrupted by shutdown");
                    return Ok(());
                }
                Err(error) if error.is_fatal() => {
                    error!(%error, "fatal cycle error, stopping");
                    liveness.report_status(ComponentStatus::Unhealthy);
                    return Err(error);
                }
                Err(error) => {
                    warn!(%error, "cycle failed, retrying next cycle");
                    liveness.report_healthy();
                }
            }

            if run_once {
                return Ok(());
            }

            tokio::select! {
                _ = shutdown.cancelled() => {
                    info!("stopping cycle loop");
                    return Ok(());
                }
                _ = tokio::time::sleep(interval) => {}
            }
        }
    }
}

fn cycle_result_label(result: &Result<CycleReport, CycleError>) -> &'static str {
    match result {
        Ok(report) if report.policy_failures > 0 => "partial",
        Ok(_) => "ok",
        Err(CycleError::Cancelled) => "cancelled",
        Err(error) if error.is_fatal() => "fatal",
        Err(_) => "failed",
    }
}

/// Wait until the broker answers, retrying with backoff while it is unreachable.
pub async fn wait_for_broker(
    broker: &dyn Broker,
    retry_policy: &RetryPolicy,
    shutdown: &CancellationToken,
) -> Result<(), CycleError> {
    let mut attempt: u32 = 0;

    loop {
        match broker.list_vhosts().await {
            Ok(vhosts) => {
                info!(vhosts = vhosts.len(), "broker is up");
                return Ok(());
            }
            Err(error @ BrokerError::NetworkUnavailable(_)) => {
                let wait = retry_policy.time_until_next_retry(attempt);
                warn!(%error, attempt, ?wait, "broker unavailable, retrying");
                attempt = attempt.saturating_add(1);

                tokio::select! {
                    _ = shutdown.cancelled() => return Err(CycleError::Cancelled),
                    _ = tokio::time::sleep(wait) => {}
                }
            }
            Err(error) => return Err(CycleError::BrokerUnavailable(error)),
        }
    }
}
