use std::time;

use policymaker_common::broker::BrokerError;
use thiserror::Error;

use crate::balancer::RelocationStep;

/// Enumeration of configuration errors. All of them abort start-up before any broker call.
#[derive(Error, Debug, PartialEq, Eq)]
pub enum ConfigError {
    #[error("policy groups are not a valid JSON object of host lists: {0}")]
    InvalidPolicyGroupsJson(String),
    #[error("no policy groups configured")]
    NoPolicyGroups,
    #[error("policy group key {key:?} is not a bucket index in 0..{count}")]
    InvalidGroupKey { key: String, count: usize },
    #[error("policy group {0} has no hosts")]
    EmptyGroup(usize),
    #[error("host {host} appears in policy groups {first} and {second}")]
    OverlappingGroups {
        host: String,
        first: usize,
        second: usize,
    },
    #[error("{0} is not an http(s) management API URL")]
    InvalidApiUrl(String),
}

/// Enumeration of errors while waiting for a queue to report running.
#[derive(Error, Debug)]
pub enum ReadinessError {
    #[error("failed to read state of queue {vhost}/{queue}: {source}")]
    Broker {
        vhost: String,
        queue: String,
        #[source]
        source: BrokerError,
    },
    #[error("queue {vhost}/{queue} was not running after {waited:?}")]
    TimedOut {
        vhost: String,
        queue: String,
        waited: time::Duration,
    },
    #[error("stopped waiting for queue {vhost}/{queue}: shutting down")]
    Cancelled { vhost: String, queue: String },
}

/// Enumeration of errors related to installing the standing HA policy of one queue.
#[derive(Error, Debug)]
pub enum PolicyError {
    #[error("a queue needs a non-empty vhost and name, got {vhost:?}/{queue:?}")]
    InvalidQueue { vhost: String, queue: String },
    #[error("policy group {0} is not configured")]
    MissingGroup(usize),
    #[error("failed to create policy for {vhost}/{queue}: {source}")]
    Create {
        vhost: String,
        queue: String,
        #[source]
        source: BrokerError,
    },
    #[error("failed to sync queue {vhost}/{queue}: {source}")]
    Sync {
        vhost: String,
        queue: String,
        #[source]
        source: BrokerError,
    },
    #[error(transparent)]
    Readiness(#[from] ReadinessError),
}

impl PolicyError {
    pub fn is_cancelled(&self) -> bool {
        matches!(self, PolicyError::Readiness(ReadinessError::Cancelled { .. }))
    }
}

/// A failure of a single step of the relocation protocol.
#[derive(Error, Debug)]
pub enum StepError {
    #[error(transparent)]
    Broker(#[from] BrokerError),
    #[error(transparent)]
    Readiness(#[from] ReadinessError),
}

/// Enumeration of errors related to balancing queue masters.
#[derive(Error, Debug)]
pub enum BalanceError {
    #[error("failed to read cluster state: {0}")]
    Discovery(#[from] BrokerError),
    #[error("relocation of {vhost}/{queue} not started: shutting down")]
    Cancelled { vhost: String, queue: String },
    #[error("relocation policy {policy} is still installed on vhost {vhost}, remove it manually")]
    StrayRelocationPolicy { vhost: String, policy: String },
    #[error(
        "relocation of {vhost}/{queue} to {to_node} failed at step {position} ({step:?}), relocation policy installed: {policy_installed}: {source}"
    )]
    Relocation {
        vhost: String,
        queue: String,
        to_node: String,
        step: RelocationStep,
        position: usize,
        policy_installed: bool,
        #[source]
        source: StepError,
    },
}

impl BalanceError {
    /// A relocation policy left behind must be remediated by an operator before anything else runs.
    pub fn leaves_relocation_policy(&self) -> bool {
        match self {
            BalanceError::StrayRelocationPolicy { .. } => true,
            BalanceError::Relocation {
                policy_installed, ..
            } => *policy_installed,
            BalanceError::Discovery(_) | BalanceError::Cancelled { .. } => false,
        }
    }

    /// A shutdown that left nothing behind. Interrupting a wait while the relocation policy is
    /// installed is not a clean shutdown and stays a relocation failure.
    pub fn is_cancelled(&self) -> bool {
        matches!(
            self,
            BalanceError::Cancelled { .. }
                | BalanceError::Relocation {
                    source: StepError::Readiness(ReadinessError::Cancelled { .. }),
                    policy_installed: false,
                    ..
                }
        )
    }
}

/// Enumeration of errors that end an evaluation cycle.
#[derive(Error, Debug)]
pub enum CycleError {
    #[error("failed to discover queues without policy: {0}")]
    Discovery(#[from] BrokerError),
    #[error(transparent)]
    Balance(#[from] BalanceError),
    #[error("broker did not come up: {0}")]
    BrokerUnavailable(BrokerError),
    #[error("cycle interrupted by shutdown")]
    Cancelled,
}

impl CycleError {
    /// Fatal errors stop the run loop instead of waiting for the next cycle.
    pub fn is_fatal(&self) -> bool {
        match self {
            CycleError::Balance(error) => error.leaves_relocation_policy(),
            CycleError::BrokerUnavailable(_) => true,
            CycleError::Discovery(_) | CycleError::Cancelled => false,
        }
    }
}
