//! An in-memory `Broker` for tests, loaded from fixtures and recording every mutation.
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::broker::{
    Broker, BrokerError, Node, Policy, PolicyBody, Queue, QueueAction, RUNNING,
};

/// A call received by a `MockBroker`, in the order it was received. Listings are not recorded.
#[derive(Debug, Clone, PartialEq)]
pub enum Call {
    CreatePolicy {
        vhost: String,
        name: String,
        body: PolicyBody,
    },
    DeletePolicy {
        vhost: String,
        name: String,
    },
    QueueAction {
        vhost: String,
        name: String,
        action: QueueAction,
    },
    GetQueue {
        vhost: String,
        name: String,
    },
}

/// The kind of a mutating call, used to inject failures.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Mutation {
    CreatePolicy,
    DeletePolicy,
    QueueAction,
}

/// A scripted answer to `get_queue`.
#[derive(Debug, Clone)]
pub enum QueueStateReply {
    State(&'static str),
    MissingState,
    NotFound,
}

#[derive(Default)]
struct MockState {
    policies: HashMap<(String, String), Policy>,
    states: HashMap<(String, String), VecDeque<QueueStateReply>>,
    calls: Vec<Call>,
    fail_on: Option<(Mutation, usize)>,
    policy_lookup_failures: HashMap<(String, String), BrokerError>,
    mutations_seen: HashMap<Mutation, usize>,
    listing_unavailable: usize,
}

#[derive(Default)]
pub struct MockBroker {
    vhosts: Vec<String>,
    queues: Vec<Queue>,
    nodes: Vec<Node>,
    state: Mutex<MockState>,
}

impl MockBroker {
    pub fn new(vhosts: Vec<String>, queues: Vec<Queue>, nodes: Vec<Node>) -> Self {
        Self {
            vhosts,
            queues,
            nodes,
            state: Mutex::new(MockState::default()),
        }
    }

    pub fn with_policies(self, policies: Vec<Policy>) -> Self {
        {
            let mut state = self.state.lock().expect("poisoned MockBroker mutex");
            for policy in policies {
                state
                    .policies
                    .insert((policy.vhost.clone(), policy.name.clone()), policy);
            }
        }
        self
    }

    /// Script the successive answers of `get_queue` for one queue.
    /// Once the script runs out the queue reports `running`.
    pub fn with_queue_states(self, vhost: &str, name: &str, replies: Vec<QueueStateReply>) -> Self {
        self.state
            .lock()
            .expect("poisoned MockBroker mutex")
            .states
            .insert((vhost.to_owned(), name.to_owned()), replies.into());
        self
    }

    /// Fail the `nth` (starting at 1) call of the given mutation kind with `MutationRejected`.
    pub fn fail_on(self, mutation: Mutation, nth: usize) -> Self {
        self.state.lock().expect("poisoned MockBroker mutex").fail_on = Some((mutation, nth));
        self
    }

    /// Answer the next `get_policy` for this policy with `error` instead of looking it up.
    pub fn fail_get_policy(self, vhost: &str, name: &str, error: BrokerError) -> Self {
        self.state
            .lock()
            .expect("poisoned MockBroker mutex")
            .policy_lookup_failures
            .insert((vhost.to_owned(), name.to_owned()), error);
        self
    }

    /// Answer the next `count` calls to `list_vhosts` with `NetworkUnavailable`.
    pub fn unavailable_for(self, count: usize) -> Self {
        self.state
            .lock()
            .expect("poisoned MockBroker mutex")
            .listing_unavailable = count;
        self
    }

    pub fn calls(&self) -> Vec<Call> {
        self.state
            .lock()
            .expect("poisoned MockBroker mutex")
            .calls
            .clone()
    }

    /// Mutating calls only, leaving out readiness polls.
    pub fn mutations(&self) -> Vec<Call> {
        self.calls()
            .into_iter()
            .filter(|call| !matches!(call, Call::GetQueue { .. }))
            .collect()
    }

    pub fn has_policy(&self, vhost: &str, name: &str) -> bool {
        self.state
            .lock()
            .expect("poisoned MockBroker mutex")
            .policies
            .contains_key(&(vhost.to_owned(), name.to_owned()))
    }

    fn record_mutation(
        &self,
        mutation: Mutation,
        call: Call,
        vhost: &str,
        name: &str,
    ) -> Result<(), BrokerError> {
        let mut state = self.state.lock().expect("poisoned MockBroker mutex");
        state.calls.push(call);

        let seen = state.mutations_seen.entry(mutation).or_insert(0);
        *seen += 1;
        let seen = *seen;

        match state.fail_on {
            Some((failing, nth)) if failing == mutation && nth == seen => {
                Err(BrokerError::MutationRejected {
                    action: match mutation {
                        Mutation::CreatePolicy => "create policy",
                        Mutation::DeletePolicy => "delete policy",
                        Mutation::QueueAction => "sync",
                    },
                    vhost: vhost.to_owned(),
                    name: name.to_owned(),
                    reason: "rejected by mock".to_owned(),
                })
            }
            _ => Ok(()),
        }
    }
}

#[async_trait]
impl Broker for MockBroker {
    async fn list_vhosts(&self) -> Result<Vec<String>, BrokerError> {
        let mut state = self.state.lock().expect("poisoned MockBroker mutex");
        if state.listing_unavailable > 0 {
            state.listing_unavailable -= 1;
            return Err(BrokerError::NetworkUnavailable(
                "connection refused".to_owned(),
            ));
        }
        Ok(self.vhosts.clone())
    }

    async fn list_queues(&self) -> Result<Vec<Queue>, BrokerError> {
        Ok(self.queues.clone())
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, BrokerError> {
        Ok(self.nodes.clone())
    }

    async fn get_queue(&self, vhost: &str, name: &str) -> Result<Queue, BrokerError> {
        let mut state = self.state.lock().expect("poisoned MockBroker mutex");
        state.calls.push(Call::GetQueue {
            vhost: vhost.to_owned(),
            name: name.to_owned(),
        });

        let mut queue = self
            .queues
            .iter()
            .find(|queue| queue.vhost == vhost && queue.name == name)
            .cloned()
            .unwrap_or_else(|| Queue {
                name: name.to_owned(),
                vhost: vhost.to_owned(),
                node: None,
                exclusive: false,
                auto_delete: false,
                policy: None,
                state: None,
            });

        let reply = state
            .states
            .get_mut(&(vhost.to_owned(), name.to_owned()))
            .and_then(|replies| replies.pop_front());

        match reply {
            Some(QueueStateReply::State(value)) => queue.state = Some(value.to_owned()),
            Some(QueueStateReply::MissingState) => queue.state = None,
            Some(QueueStateReply::NotFound) => {
                return Err(BrokerError::not_found("queue", vhost, name))
            }
            None => queue.state = Some(RUNNING.to_owned()),
        }

        Ok(queue)
    }

    async fn get_policy(&self, vhost: &str, name: &str) -> Result<Policy, BrokerError> {
        let mut state = self.state.lock().expect("poisoned MockBroker mutex");
        let key = (vhost.to_owned(), name.to_owned());

        if let Some(error) = state.policy_lookup_failures.remove(&key) {
            return Err(error);
        }

        state
            .policies
            .get(&key)
            .cloned()
            .ok_or_else(|| BrokerError::not_found("policy", vhost, name))
    }

    async fn create_policy(
        &self,
        vhost: &str,
        name: &str,
        body: &PolicyBody,
    ) -> Result<(), BrokerError> {
        self.record_mutation(
            Mutation::CreatePolicy,
            Call::CreatePolicy {
                vhost: vhost.to_owned(),
                name: name.to_owned(),
                body: body.clone(),
            },
            vhost,
            name,
        )?;

        let policy = Policy {
            name: name.to_owned(),
            vhost: vhost.to_owned(),
            pattern: body.pattern.clone(),
            definition: serde_json::to_value(&body.definition)
                .map_err(|error| BrokerError::Decode(error.to_string()))?,
            priority: i64::from(body.priority),
            apply_to: Some("queues".to_owned()),
        };
        self.state
            .lock()
            .expect("poisoned MockBroker mutex")
            .policies
            .insert((vhost.to_owned(), name.to_owned()), policy);

        Ok(())
    }

    async fn delete_policy(&self, vhost: &str, name: &str) -> Result<(), BrokerError> {
        self.record_mutation(
            Mutation::DeletePolicy,
            Call::DeletePolicy {
                vhost: vhost.to_owned(),
                name: name.to_owned(),
            },
            vhost,
            name,
        )?;

        self.state
            .lock()
            .expect("poisoned MockBroker mutex")
            .policies
            .remove(&(vhost.to_owned(), name.to_owned()))
            .map(|_| ())
            .ok_or_else(|| BrokerError::not_found("policy", vhost, name))
    }

    async fn queue_action(
        &self,
        vhost: &str,
        name: &str,
        action: QueueAction,
    ) -> Result<(), BrokerError> {
        self.record_mutation(
            Mutation::QueueAction,
            Call::QueueAction {
                vhost: vhost.to_owned(),
                name: name.to_owned(),
                action,
            },
            vhost,
            name,
        )
    }
}
