use std::collections::BTreeMap;
use std::sync::Arc;

use policymaker_common::broker::{
    ApplyTo, Broker, BrokerError, HaMode, PolicyBody, PolicyDefinition, Queue, QueueAction,
    QueueMode,
};
use tracing::{debug, info, instrument};

use crate::error::PolicyError;
use crate::groups::PolicyGroups;
use crate::readiness::ReadinessWaiter;

pub const STANDING_POLICY_PRIORITY: i32 = 30;

/// A regex matching exactly the given queue name and nothing else.
pub fn anchored_pattern(queue: &str) -> String {
    format!("^{}$", regex::escape(queue))
}

/// Broker node identity for a host, e.g. `rabbit@rabbit-dc1-1`.
pub fn node_name(tag: &str, host: &str) -> String {
    format!("{}@{}", tag, host)
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PolicyOutcome {
    /// The policy was created and the queue reported running afterwards.
    Created(PolicyBody),
    /// Dry run: nothing was sent.
    DryRun(PolicyBody),
}

/// Installs a standing HA policy, named after the queue, on every queue lacking one.
pub struct PolicyEngine {
    broker: Arc<dyn Broker>,
    groups: PolicyGroups,
    node_tag: String,
    dry_run: bool,
    waiter: ReadinessWaiter,
}

impl PolicyEngine {
    pub fn new(
        broker: Arc<dyn Broker>,
        groups: PolicyGroups,
        node_tag: &str,
        dry_run: bool,
        waiter: ReadinessWaiter,
    ) -> Self {
        Self {
            broker,
            groups,
            node_tag: node_tag.to_owned(),
            dry_run,
            waiter,
        }
    }

    /// Queues that are neither exclusive nor auto-delete and have no policy named after them.
    ///
    /// The policy recorded on the queue is only a hint: unless it is the queue's own policy,
    /// the broker is asked for a policy with the queue's name and only a not found answer
    /// counts as missing.
    pub async fn find_queues_needing_policy(&self) -> Result<Vec<Queue>, BrokerError> {
        let mut needing_policy = Vec::new();

        for queue in self.broker.list_queues().await? {
            if queue.is_excluded() || queue.has_own_policy() {
                continue;
            }

            match self.broker.get_policy(&queue.vhost, &queue.name).await {
                Ok(policy) => {
                    debug!(vhost = %queue.vhost, queue = %queue.name, policy = %policy.name, "policy exists")
                }
                Err(error) if error.is_not_found() => {
                    debug!(vhost = %queue.vhost, queue = %queue.name, "queue without policy");
                    needing_policy.push(queue);
                }
                Err(error) => return Err(error),
            }
        }

        Ok(needing_policy)
    }

    /// Non excluded queue names per vhost. Every listed vhost is present, possibly empty.
    pub async fn queues_by_vhost(&self) -> Result<BTreeMap<String, Vec<String>>, BrokerError> {
        let mut by_vhost: BTreeMap<String, Vec<String>> = self
            .broker
            .list_vhosts()
            .await?
            .into_iter()
            .map(|vhost| (vhost, Vec::new()))
            .collect();

        for queue in self.broker.list_queues().await? {
            if queue.is_excluded() {
                continue;
            }
            by_vhost.entry(queue.vhost).or_default().push(queue.name);
        }

        Ok(by_vhost)
    }

    /// The standing policy of a queue: mirrored on every node of the queue's group, lazy.
    pub fn build_policy(&self, vhost: &str, queue: &str) -> Result<PolicyBody, PolicyError> {
        let bucket = self.groups.bucket_for(vhost, queue);
        let hosts = self
            .groups
            .hosts(bucket)
            .ok_or(PolicyError::MissingGroup(bucket))?;

        Ok(PolicyBody {
            pattern: anchored_pattern(queue),
            definition: PolicyDefinition {
                ha_mode: HaMode::Nodes,
                ha_params: hosts
                    .iter()
                    .map(|host| node_name(&self.node_tag, host))
                    .collect(),
                queue_mode: Some(QueueMode::Lazy),
            },
            priority: STANDING_POLICY_PRIORITY,
            apply_to: ApplyTo::Queues,
        })
    }

    /// Create the standing policy of a queue, then wait for the queue to settle, force a sync
    /// and wait again.
    #[instrument(skip(self))]
    pub async fn create_policy(
        &self,
        vhost: &str,
        queue: &str,
    ) -> Result<PolicyOutcome, PolicyError> {
        if vhost.is_empty() || queue.is_empty() {
            return Err(PolicyError::InvalidQueue {
                vhost: vhost.to_owned(),
                queue: queue.to_owned(),
            });
        }

        let body = self.build_policy(vhost, queue)?;
        let rendered = serde_json::to_string(&body).unwrap_or_default();

        if self.dry_run {
            info!(vhost, queue, body = %rendered, "dry run, policy body would be");
            return Ok(PolicyOutcome::DryRun(body));
        }

        info!(vhost, queue, body = %rendered, "creating policy");
        self.broker
            .create_policy(vhost, queue, &body)
            .await
            .map_err(|source| PolicyError::Create {
                vhost: vhost.to_owned(),
                queue: queue.to_owned(),
                source,
            })?;

        self.waiter
            .wait_until_running(self.broker.as_ref(), vhost, queue)
            .await?;
        self.broker
            .queue_action(vhost, queue, QueueAction::Sync)
            .await
            .map_err(|source| PolicyError::Sync {
                vhost: vhost.to_owned(),
                queue: queue.to_owned(),
                source,
            })?;
        self.waiter
            .wait_until_running(self.broker.as_ref(), vhost, queue)
            .await?;

        info!(vhost, queue, "policy created and queue is running");
        Ok(PolicyOutcome::Created(body))
    }
}
