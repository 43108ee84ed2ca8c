use std::sync::Arc;

use policymaker_common::broker::{
    ApplyTo, Broker, HaMode, Node, PolicyBody, PolicyDefinition, Queue, QueueAction,
};
use tracing::{error, info, warn};

use crate::error::{BalanceError, StepError};
use crate::groups::PolicyGroups;
use crate::policy::anchored_pattern;
use crate::readiness::ReadinessWaiter;

/// Name of the temporary policy moving a queue master. Never the name of a standing policy.
pub const RELOCATION_POLICY_NAME: &str = "queue_master_balancer";
pub const RELOCATION_POLICY_PRIORITY: i32 = 999;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelocationStep {
    InstallPolicy,
    WaitUntilRunning,
    ForceSync,
    RemovePolicy,
}

/// The relocation protocol. A single sync does not guarantee the master has moved by the time
/// the next step runs, so every step is a barrier and the sequence runs exactly as listed.
pub const RELOCATION_PROTOCOL: [RelocationStep; 9] = [
    RelocationStep::InstallPolicy,
    RelocationStep::WaitUntilRunning,
    RelocationStep::ForceSync,
    RelocationStep::WaitUntilRunning,
    RelocationStep::ForceSync,
    RelocationStep::WaitUntilRunning,
    RelocationStep::RemovePolicy,
    RelocationStep::ForceSync,
    RelocationStep::WaitUntilRunning,
];

/// Queue counts of the nodes of one group, in the order the broker listed the nodes.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct GroupLoad {
    pub counts: Vec<(String, usize)>,
}

impl GroupLoad {
    pub fn get(&self, node: &str) -> Option<usize> {
        self.counts
            .iter()
            .find(|(name, _)| name == node)
            .map(|(_, count)| *count)
    }

    /// The first node with the fewest queues.
    pub fn least_loaded(&self) -> Option<(&str, usize)> {
        self.counts
            .iter()
            .fold(None, |least: Option<(&str, usize)>, (node, count)| match least {
                Some((_, least_count)) if least_count <= *count => least,
                _ => Some((node.as_str(), *count)),
            })
    }

    /// The first node with the most queues.
    pub fn most_loaded(&self) -> Option<(&str, usize)> {
        self.counts
            .iter()
            .fold(None, |most: Option<(&str, usize)>, (node, count)| match most {
                Some((_, most_count)) if most_count >= *count => most,
                _ => Some((node.as_str(), *count)),
            })
    }
}

/// A node and the non excluded queues it masters.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeQueues {
    pub node: String,
    pub queues: Vec<Queue>,
}

/// A queue to move from the most loaded node of a group to its least loaded node.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Candidate {
    pub queue: String,
    pub vhost: String,
    pub from_node: String,
    pub to_node: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RelocationOutcome {
    /// No group is out of balance.
    Balanced,
    /// Dry run: the policy that would have been installed.
    DryRun { candidate: Candidate, body: PolicyBody },
    Relocated(Candidate),
}

/// Every node with the non excluded queues it masters, in broker listing order.
pub fn queues_on_nodes(nodes: &[Node], queues: &[Queue]) -> Vec<NodeQueues> {
    nodes
        .iter()
        .map(|node| NodeQueues {
            node: node.name.clone(),
            queues: queues
                .iter()
                .filter(|queue| !queue.is_excluded() && queue.is_hosted_on(&node.name))
                .cloned()
                .collect(),
        })
        .collect()
}

/// Queue counts for the nodes whose host belongs to `group_hosts`.
pub fn group_load(group_hosts: &[String], nodes: &[Node], queues: &[Queue]) -> GroupLoad {
    let counts = nodes
        .iter()
        .filter(|node| group_hosts.iter().any(|host| host == node.host()))
        .map(|node| {
            let count = queues
                .iter()
                .filter(|queue| !queue.is_excluded() && queue.is_hosted_on(&node.name))
                .count();
            (node.name.clone(), count)
        })
        .collect();

    GroupLoad { counts }
}

/// The first group, in bucket order, whose spread exceeds `queues_delta` yields the candidate:
/// the first queue listed on its most loaded node, to be moved to its least loaded node.
pub fn select_candidate(
    groups: &PolicyGroups,
    nodes: &[Node],
    queues: &[Queue],
    queues_delta: usize,
) -> Option<Candidate> {
    for (bucket, hosts) in groups.iter() {
        let load = group_load(hosts, nodes, queues);
        let (Some((min_node, min_count)), Some((max_node, max_count))) =
            (load.least_loaded(), load.most_loaded())
        else {
            warn!(bucket, "no cluster node belongs to policy group");
            continue;
        };

        info!(
            bucket,
            max_node,
            max_count,
            min_node,
            min_count,
            "policy group load"
        );

        if max_count - min_count <= queues_delta {
            continue;
        }

        let Some(queue) = queues
            .iter()
            .find(|queue| !queue.is_excluded() && queue.is_hosted_on(max_node))
        else {
            continue;
        };

        return Some(Candidate {
            queue: queue.name.clone(),
            vhost: queue.vhost.clone(),
            from_node: max_node.to_owned(),
            to_node: min_node.to_owned(),
        });
    }

    None
}

/// The temporary policy pinning a queue's mirrors, hence its master, to a single node.
pub fn relocation_policy(candidate: &Candidate) -> PolicyBody {
    PolicyBody {
        pattern: anchored_pattern(&candidate.queue),
        definition: PolicyDefinition {
            ha_mode: HaMode::Nodes,
            ha_params: vec![candidate.to_node.clone()],
            queue_mode: None,
        },
        priority: RELOCATION_POLICY_PRIORITY,
        apply_to: ApplyTo::Queues,
    }
}

/// Moves at most one queue master per run, from the busiest node of a group to its quietest.
pub struct LoadBalancer {
    broker: Arc<dyn Broker>,
    groups: PolicyGroups,
    queues_delta: usize,
    dry_run: bool,
    waiter: ReadinessWaiter,
}

impl LoadBalancer {
    pub fn new(
        broker: Arc<dyn Broker>,
        groups: PolicyGroups,
        queues_delta: usize,
        dry_run: bool,
        waiter: ReadinessWaiter,
    ) -> Self {
        Self {
            broker,
            groups,
            queues_delta,
            dry_run,
            waiter,
        }
    }

    pub async fn current_load(&self, group_hosts: &[String]) -> Result<GroupLoad, BalanceError> {
        let nodes = self.broker.list_nodes().await?;
        let queues = self.broker.list_queues().await?;

        Ok(group_load(group_hosts, &nodes, &queues))
    }

    pub async fn select_relocation_candidate(&self) -> Result<Option<Candidate>, BalanceError> {
        let nodes = self.broker.list_nodes().await?;
        let queues = self.broker.list_queues().await?;

        Ok(select_candidate(
            &self.groups,
            &nodes,
            &queues,
            self.queues_delta,
        ))
    }

    /// Log how many queues every node masters.
    pub async fn report_queues_on_nodes(&self) -> Result<Vec<NodeQueues>, BalanceError> {
        let nodes = self.broker.list_nodes().await?;
        let queues = self.broker.list_queues().await?;

        let report = queues_on_nodes(&nodes, &queues);
        for node in &report {
            info!(node = %node.node, queues = node.queues.len(), "queues on node");
        }

        Ok(report)
    }

    /// A relocation policy found on any vhost was left behind by a failed relocation.
    pub async fn ensure_no_stray_relocation_policy(&self) -> Result<(), BalanceError> {
        for vhost in self.broker.list_vhosts().await? {
            match self.broker.get_policy(&vhost, RELOCATION_POLICY_NAME).await {
                Ok(_) => {
                    error!(vhost = %vhost, policy = RELOCATION_POLICY_NAME, "stray relocation policy");
                    return Err(BalanceError::StrayRelocationPolicy {
                        vhost,
                        policy: RELOCATION_POLICY_NAME.to_owned(),
                    });
                }
                Err(error) if error.is_not_found() => {}
                Err(error) => return Err(error.into()),
            }
        }

        Ok(())
    }

    pub async fn relocate(&self) -> Result<RelocationOutcome, BalanceError> {
        self.ensure_no_stray_relocation_policy().await?;

        let Some(candidate) = self.select_relocation_candidate().await? else {
            info!("nothing to balance");
            return Ok(RelocationOutcome::Balanced);
        };

        let body = relocation_policy(&candidate);
        info!(
            vhost = %candidate.vhost,
            queue = %candidate.queue,
            from_node = %candidate.from_node,
            to_node = %candidate.to_node,
            body = %serde_json::to_string(&body).unwrap_or_default(),
            "relocating queue"
        );

        if self.dry_run {
            info!("dry run, nothing changed");
            return Ok(RelocationOutcome::DryRun { candidate, body });
        }

        if self.waiter.is_shutting_down() {
            info!(vhost = %candidate.vhost, queue = %candidate.queue, "shutting down, relocation not started");
            return Err(BalanceError::Cancelled {
                vhost: candidate.vhost,
                queue: candidate.queue,
            });
        }

        let mut policy_installed = false;
        for (index, step) in RELOCATION_PROTOCOL.iter().enumerate() {
            if let Err(source) = self.run_step(*step, &candidate, &body).await {
                error!(
                    vhost = %candidate.vhost,
                    queue = %candidate.queue,
                    step = ?step,
                    position = index + 1,
                    policy_installed,
                    %source,
                    "relocation failed"
                );
                return Err(BalanceError::Relocation {
                    vhost: candidate.vhost,
                    queue: candidate.queue,
                    to_node: candidate.to_node,
                    step: *step,
                    position: index + 1,
                    policy_installed,
                    source,
                });
            }

            match step {
                RelocationStep::InstallPolicy => policy_installed = true,
                RelocationStep::RemovePolicy => policy_installed = false,
                _ => {}
            }
        }

        metrics::counter!(policymaker_common::metrics::RELOCATIONS).increment(1);
        info!(
            vhost = %candidate.vhost,
            queue = %candidate.queue,
            from_node = %candidate.from_node,
            to_node = %candidate.to_node,
            "queue relocated"
        );

        Ok(RelocationOutcome::Relocated(candidate))
    }

    async fn run_step(
        &self,
        step: RelocationStep,
        candidate: &Candidate,
        body: &PolicyBody,
    ) -> Result<(), StepError> {
        let vhost = candidate.vhost.as_str();
        let queue = candidate.queue.as_str();

        match step {
            RelocationStep::InstallPolicy => {
                self.broker
                    .create_policy(vhost, RELOCATION_POLICY_NAME, body)
                    .await?
            }
            RelocationStep::WaitUntilRunning => {
                self.waiter
                    .wait_until_running(self.broker.as_ref(), vhost, queue)
                    .await?
            }
            RelocationStep::ForceSync => {
                self.broker
                    .queue_action(vhost, queue, QueueAction::Sync)
                    .await?
            }
            RelocationStep::RemovePolicy => {
                info!(vhost, policy = RELOCATION_POLICY_NAME, "deleting relocation policy");
                self.broker
                    .delete_policy(vhost, RELOCATION_POLICY_NAME)
                    .await?
            }
        }

        Ok(())
    }
}
