#![allow(dead_code)]

use std::sync::Arc;
use std::time;

use policymaker::balancer::LoadBalancer;
use policymaker::cycle::Policymaker;
use policymaker::groups::PolicyGroups;
use policymaker::policy::PolicyEngine;
use policymaker::readiness::ReadinessWaiter;
use policymaker_common::broker::{Node, Policy, Queue};
use policymaker_common::mock::MockBroker;
use tokio_util::sync::CancellationToken;

pub const QUEUES_DELTA: usize = 3;

/// A nine node cluster over three datacenters, with three policy groups of one node per
/// datacenter. Group 0 is out of balance.
pub fn fixture_broker() -> MockBroker {
    let vhosts: Vec<String> =
        serde_json::from_str(include_str!("../data/vhosts.json")).expect("invalid vhosts fixture");
    let queues: Vec<Queue> =
        serde_json::from_str(include_str!("../data/queues.json")).expect("invalid queues fixture");
    let nodes: Vec<Node> =
        serde_json::from_str(include_str!("../data/nodes.json")).expect("invalid nodes fixture");
    let policies: Vec<Policy> = serde_json::from_str(include_str!("../data/policies.json"))
        .expect("invalid policies fixture");

    MockBroker::new(vhosts, queues, nodes).with_policies(policies)
}

pub fn fixture_groups() -> PolicyGroups {
    include_str!("../data/policy_groups.json")
        .parse()
        .expect("invalid policy groups fixture")
}

pub fn waiter() -> ReadinessWaiter {
    waiter_until(CancellationToken::new())
}

pub fn waiter_until(shutdown: CancellationToken) -> ReadinessWaiter {
    ReadinessWaiter::new(
        time::Duration::from_millis(1),
        Some(time::Duration::from_secs(5)),
        shutdown,
    )
}

pub fn policymaker(broker: Arc<MockBroker>, dry_run: bool, balancing: bool) -> Policymaker {
    policymaker_until(broker, dry_run, balancing, CancellationToken::new())
}

pub fn policymaker_until(
    broker: Arc<MockBroker>,
    dry_run: bool,
    balancing: bool,
    shutdown: CancellationToken,
) -> Policymaker {
    let groups = fixture_groups();

    Policymaker::new(
        PolicyEngine::new(
            broker.clone(),
            groups.clone(),
            "rabbit",
            dry_run,
            waiter_until(shutdown.clone()),
        ),
        LoadBalancer::new(broker, groups, QUEUES_DELTA, dry_run, waiter_until(shutdown)),
        balancing,
    )
}
