use std::sync::Arc;
use std::time;

use assert_json_diff::assert_json_eq;
use eyre::Result;
use serde_json::json;
use tokio_util::sync::CancellationToken;

use policymaker::balancer::{
    Candidate, LoadBalancer, RelocationOutcome, RelocationStep, RELOCATION_POLICY_NAME,
};
use policymaker::cycle::{wait_for_broker, CycleReport};
use policymaker::error::{BalanceError, CycleError};
use policymaker::policy::PolicyEngine;
use policymaker_common::broker::{BrokerError, QueueAction};
use policymaker_common::health::HealthRegistry;
use policymaker_common::mock::{Call, MockBroker, Mutation, QueueStateReply};
use policymaker_common::retry::RetryPolicy;

use crate::common::*;
mod common;

fn created(vhost: &str, name: &str) -> (String, String) {
    (vhost.to_owned(), name.to_owned())
}

/// (vhost, name) of every policy created, in order.
fn created_policies(broker: &MockBroker) -> Vec<(String, String)> {
    broker
        .mutations()
        .into_iter()
        .filter_map(|call| match call {
            Call::CreatePolicy { vhost, name, .. } => Some((vhost, name)),
            _ => None,
        })
        .collect()
}

fn expected_candidate() -> Candidate {
    Candidate {
        queue: "aliveness-test".to_owned(),
        vhost: "/".to_owned(),
        from_node: "rabbit@rabbit-dc1-1".to_owned(),
        to_node: "rabbit@rabbit-dc3-1".to_owned(),
    }
}

#[tokio::test]
async fn it_finds_queues_needing_a_policy() -> Result<()> {
    let broker = Arc::new(fixture_broker());
    let engine = PolicyEngine::new(broker, fixture_groups(), "rabbit", false, waiter());

    let needing: Vec<(String, String)> = engine
        .find_queues_needing_policy()
        .await?
        .into_iter()
        .map(|queue| (queue.vhost, queue.name))
        .collect();

    assert_eq!(
        needing,
        vec![
            created("/", "orders"),
            created("first_vhost", "payments"),
            created("my_app", "notifications"),
            created("some_vhost", "mail"),
        ]
    );

    Ok(())
}

#[tokio::test]
async fn it_runs_a_full_cycle() -> Result<()> {
    let broker = Arc::new(fixture_broker());

    let report = policymaker(broker.clone(), false, true).run_cycle().await?;

    assert_eq!(
        report,
        CycleReport {
            queues_without_policy: 4,
            policies_created: 4,
            policies_dry_run: 0,
            policy_failures: 0,
            relocation: Some(RelocationOutcome::Relocated(expected_candidate())),
        }
    );

    let sync = |vhost: &str, name: &str| Call::QueueAction {
        vhost: vhost.to_owned(),
        name: name.to_owned(),
        action: QueueAction::Sync,
    };
    let mutations = broker.mutations();
    let kinds: Vec<(&str, String)> = mutations
        .iter()
        .map(|call| match call {
            Call::CreatePolicy { vhost, name, .. } => ("create", format!("{}/{}", vhost, name)),
            Call::DeletePolicy { vhost, name } => ("delete", format!("{}/{}", vhost, name)),
            Call::QueueAction { vhost, name, .. } => ("sync", format!("{}/{}", vhost, name)),
            Call::GetQueue { vhost, name } => ("get", format!("{}/{}", vhost, name)),
        })
        .collect();

    assert_eq!(
        kinds,
        vec![
            ("create", "//orders".to_owned()),
            ("sync", "//orders".to_owned()),
            ("create", "first_vhost/payments".to_owned()),
            ("sync", "first_vhost/payments".to_owned()),
            ("create", "my_app/notifications".to_owned()),
            ("sync", "my_app/notifications".to_owned()),
            ("create", "some_vhost/mail".to_owned()),
            ("sync", "some_vhost/mail".to_owned()),
            ("create", format!("//{}", RELOCATION_POLICY_NAME)),
            ("sync", "//aliveness-test".to_owned()),
            ("sync", "//aliveness-test".to_owned()),
            ("delete", format!("//{}", RELOCATION_POLICY_NAME)),
            ("sync", "//aliveness-test".to_owned()),
        ]
    );
    assert_eq!(mutations[1], sync("/", "orders"));
    assert!(!broker.has_policy("/", RELOCATION_POLICY_NAME));

    Ok(())
}

#[tokio::test]
async fn it_sends_group_policies() -> Result<()> {
    let broker = Arc::new(fixture_broker());

    policymaker(broker.clone(), false, false).run_cycle().await?;

    let bodies: Vec<serde_json::Value> = broker
        .mutations()
        .into_iter()
        .filter_map(|call| match call {
            Call::CreatePolicy { body, .. } => serde_json::to_value(body).ok(),
            _ => None,
        })
        .collect();

    assert_eq!(bodies.len(), 4);
    assert_json_eq!(
        bodies[0],
        json!({
            "pattern": "^orders$",
            "definition": {
                "ha-mode": "nodes",
                "ha-params": ["rabbit@rabbit-dc1-1", "rabbit@rabbit-dc2-1", "rabbit@rabbit-dc3-1"],
                "queue-mode": "lazy"
            },
            "priority": 30,
            "apply-to": "queues"
        })
    );
    assert_eq!(
        bodies[2]["definition"]["ha-params"],
        json!(["rabbit@rabbit-dc1-3", "rabbit@rabbit-dc2-3", "rabbit@rabbit-dc3-3"])
    );
    assert_eq!(
        bodies[3]["definition"]["ha-params"],
        json!(["rabbit@rabbit-dc1-2", "rabbit@rabbit-dc2-2", "rabbit@rabbit-dc3-2"])
    );

    Ok(())
}

#[tokio::test]
async fn it_selects_the_candidate_from_the_unbalanced_group() -> Result<()> {
    let broker = Arc::new(fixture_broker());
    let balancer = LoadBalancer::new(broker, fixture_groups(), QUEUES_DELTA, false, waiter());
    let groups = fixture_groups();

    let load = balancer
        .current_load(groups.hosts(0).expect("group 0 is configured"))
        .await?;
    assert_eq!(
        load.counts,
        vec![
            ("rabbit@rabbit-dc1-1".to_owned(), 5),
            ("rabbit@rabbit-dc2-1".to_owned(), 2),
            ("rabbit@rabbit-dc3-1".to_owned(), 0),
        ]
    );

    let load = balancer
        .current_load(groups.hosts(2).expect("group 2 is configured"))
        .await?;
    assert_eq!(load.most_loaded(), Some(("rabbit@rabbit-dc1-3", 2)));

    assert_eq!(
        balancer.select_relocation_candidate().await?,
        Some(expected_candidate())
    );

    let report = balancer.report_queues_on_nodes().await?;
    assert_eq!(report.len(), 9);
    assert!(report[2].queues.is_empty());

    Ok(())
}

#[tokio::test]
async fn it_continues_after_a_failed_queue() -> Result<()> {
    let broker = Arc::new(fixture_broker().fail_on(Mutation::QueueAction, 2));

    let report = policymaker(broker.clone(), false, false).run_cycle().await?;

    assert_eq!(report.policies_created, 3);
    assert_eq!(report.policy_failures, 1);
    assert_eq!(created_policies(&broker).len(), 4);

    Ok(())
}

#[tokio::test]
async fn it_stops_when_the_relocation_policy_stays_installed() -> Result<()> {
    let broker = Arc::new(fixture_broker().fail_on(Mutation::DeletePolicy, 1));
    let policymaker = policymaker(broker.clone(), false, true);

    match policymaker.run_cycle().await {
        Err(error @ CycleError::Balance(BalanceError::Relocation { .. })) => {
            assert!(error.is_fatal());
            if let CycleError::Balance(BalanceError::Relocation { step, position, .. }) = error {
                assert_eq!(step, RelocationStep::RemovePolicy);
                assert_eq!(position, 7);
            }
        }
        other => panic!("Expected a relocation error, got {:?}", other),
    }
    assert!(broker.has_policy("/", RELOCATION_POLICY_NAME));

    let registry = HealthRegistry::new("liveness");
    let liveness = registry.register("cycle", ::time::Duration::seconds(30));
    let error = policymaker
        .run(
            time::Duration::from_secs(3600),
            false,
            &liveness,
            &CancellationToken::new(),
        )
        .await
        .expect_err("a stray relocation policy must stop the loop");

    assert!(matches!(
        error,
        CycleError::Balance(BalanceError::StrayRelocationPolicy { .. })
    ));
    assert!(!registry.get_status().healthy);

    Ok(())
}

#[tokio::test]
async fn it_does_not_mutate_in_dry_run() -> Result<()> {
    let broker = Arc::new(fixture_broker());

    let report = policymaker(broker.clone(), true, true).run_cycle().await?;

    assert_eq!(report.policies_dry_run, 4);
    assert_eq!(report.policies_created, 0);
    match report.relocation {
        Some(RelocationOutcome::DryRun { candidate, body }) => {
            assert_eq!(candidate, expected_candidate());
            assert_eq!(body.definition.ha_params, vec!["rabbit@rabbit-dc3-1"]);
        }
        other => panic!("Expected a dry run relocation, got {:?}", other),
    }
    assert!(broker.calls().is_empty());

    Ok(())
}

#[tokio::test]
async fn it_waits_for_the_broker() -> Result<()> {
    let broker = fixture_broker().unavailable_for(2);
    let retry_policy = RetryPolicy::new(2, time::Duration::from_millis(1), None);

    wait_for_broker(&broker, &retry_policy, &CancellationToken::new()).await?;

    Ok(())
}

#[tokio::test]
async fn it_fails_discovery_when_a_policy_lookup_fails() -> Result<()> {
    let broker = Arc::new(fixture_broker().fail_get_policy(
        "first_vhost",
        "payments",
        BrokerError::NetworkUnavailable("connection reset".to_owned()),
    ));

    match policymaker(broker.clone(), false, true).run_cycle().await {
        Err(error @ CycleError::Discovery(BrokerError::NetworkUnavailable(_))) => {
            assert!(!error.is_fatal())
        }
        other => panic!("Expected a discovery error, got {:?}", other),
    }
    assert!(broker.mutations().is_empty());

    Ok(())
}

#[tokio::test]
async fn it_does_not_start_a_relocation_during_shutdown() -> Result<()> {
    let broker = Arc::new(fixture_broker());
    policymaker(broker.clone(), false, false).run_cycle().await?;

    let shutdown = CancellationToken::new();
    shutdown.cancel();
    let registry = HealthRegistry::new("liveness");
    let liveness = registry.register("cycle", ::time::Duration::seconds(30));

    policymaker_until(broker.clone(), false, true, shutdown.clone())
        .run(time::Duration::from_secs(3600), false, &liveness, &shutdown)
        .await?;

    assert!(!broker.has_policy("/", RELOCATION_POLICY_NAME));
    assert!(!created_policies(&broker)
        .iter()
        .any(|(_, name)| name == RELOCATION_POLICY_NAME));

    Ok(())
}

#[tokio::test]
async fn it_stops_loudly_when_shutdown_interrupts_a_relocation() -> Result<()> {
    let broker = Arc::new(fixture_broker().with_queue_states(
        "/",
        "aliveness-test",
        vec![QueueStateReply::State("syncing"); 100_000],
    ));
    policymaker(broker.clone(), false, false).run_cycle().await?;

    let shutdown = CancellationToken::new();
    let registry = HealthRegistry::new("liveness");
    let liveness = registry.register("cycle", ::time::Duration::seconds(30));
    let policymaker = policymaker_until(broker.clone(), false, true, shutdown.clone());

    let handle = tokio::spawn({
        let shutdown = shutdown.clone();
        async move {
            policymaker
                .run(time::Duration::from_secs(3600), false, &liveness, &shutdown)
                .await
        }
    });
    while !broker.has_policy("/", RELOCATION_POLICY_NAME) {
        tokio::task::yield_now().await;
    }
    shutdown.cancel();

    let error = handle
        .await?
        .expect_err("an installed relocation policy must fail the loop");

    assert!(error.is_fatal());
    assert!(matches!(
        error,
        CycleError::Balance(BalanceError::Relocation {
            policy_installed: true,
            ..
        })
    ));
    assert!(broker.has_policy("/", RELOCATION_POLICY_NAME));
    assert!(!registry.get_status().healthy);

    Ok(())
}
