use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The state the management API reports for a queue that is fully operational.
pub const RUNNING: &str = "running";

/// Enumeration of errors returned by a `Broker`.
/// `NotFound` is a meaningful answer (e.g. a policy is absent), not necessarily a failure.
#[derive(Error, Debug)]
pub enum BrokerError {
    #[error("broker management endpoint is unreachable: {0}")]
    NetworkUnavailable(String),
    #[error("{kind} not found: {vhost}/{name}")]
    NotFound {
        kind: &'static str,
        vhost: String,
        name: String,
    },
    #[error("broker returned a {kind} record without field {field}")]
    TransientFieldMissing {
        kind: &'static str,
        field: &'static str,
    },
    #[error("broker rejected {action} on {vhost}/{name}: {reason}")]
    MutationRejected {
        action: &'static str,
        vhost: String,
        name: String,
        reason: String,
    },
    #[error("unexpected status {status} from {url}")]
    UnexpectedStatus { status: u16, url: String },
    #[error("failed to decode broker response: {0}")]
    Decode(String),
}

impl BrokerError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, BrokerError::NotFound { .. })
    }

    pub fn not_found(kind: &'static str, vhost: &str, name: &str) -> Self {
        BrokerError::NotFound {
            kind,
            vhost: vhost.to_owned(),
            name: name.to_owned(),
        }
    }
}

/// A queue as listed by the management API. Only the attributes we act on are kept.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Queue {
    pub name: String,
    pub vhost: String,
    #[serde(default)]
    pub node: Option<String>,
    #[serde(default)]
    pub exclusive: bool,
    #[serde(default)]
    pub auto_delete: bool,
    #[serde(default)]
    pub policy: Option<String>,
    #[serde(default)]
    pub state: Option<String>,
}

impl Queue {
    /// Exclusive and auto-delete queues are client-owned and never receive an HA policy.
    pub fn is_excluded(&self) -> bool {
        self.exclusive || self.auto_delete
    }

    /// The applied policy is the queue's own standing policy.
    pub fn has_own_policy(&self) -> bool {
        self.policy.as_deref() == Some(self.name.as_str())
    }

    pub fn is_hosted_on(&self, node: &str) -> bool {
        self.node.as_deref() == Some(node)
    }

    /// The reported state, or `TransientFieldMissing` while the broker is still materializing it.
    pub fn require_state(&self) -> Result<&str, BrokerError> {
        self.state
            .as_deref()
            .ok_or(BrokerError::TransientFieldMissing {
                kind: "queue",
                field: "state",
            })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
pub struct Node {
    pub name: String,
}

impl Node {
    /// The host part of a `<tag>@<host>` node name. Names without a tag are returned as is.
    pub fn host(&self) -> &str {
        self.name
            .split_once('@')
            .map(|(_, host)| host)
            .unwrap_or(&self.name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum HaMode {
    Nodes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum QueueMode {
    Lazy,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ApplyTo {
    Queues,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PolicyDefinition {
    pub ha_mode: HaMode,
    pub ha_params: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub queue_mode: Option<QueueMode>,
}

/// The body sent to the broker when creating a policy.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "kebab-case")]
pub struct PolicyBody {
    pub pattern: String,
    pub definition: PolicyDefinition,
    pub priority: i32,
    pub apply_to: ApplyTo,
}

/// A policy as returned by the management API. The definition is kept opaque as policies
/// installed by operators may carry keys we know nothing about.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Policy {
    pub name: String,
    pub vhost: String,
    #[serde(default)]
    pub pattern: String,
    #[serde(default)]
    pub definition: serde_json::Value,
    #[serde(default)]
    pub priority: i64,
    #[serde(default, rename = "apply-to")]
    pub apply_to: Option<String>,
}

/// Actions that can be triggered on a queue through the management API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum QueueAction {
    Sync,
}

impl QueueAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            QueueAction::Sync => "sync",
        }
    }
}

/// Read and write operations against a broker cluster.
/// Implemented over the management HTTP API and by an in-memory mock for tests.
#[async_trait]
pub trait Broker: Send + Sync {
    async fn list_vhosts(&self) -> Result<Vec<String>, BrokerError>;

    async fn list_queues(&self) -> Result<Vec<Queue>, BrokerError>;

    async fn list_nodes(&self) -> Result<Vec<Node>, BrokerError>;

    async fn get_queue(&self, vhost: &str, name: &str) -> Result<Queue, BrokerError>;

    async fn get_policy(&self, vhost: &str, name: &str) -> Result<Policy, BrokerError>;

    async fn create_policy(
        &self,
        vhost: &str,
        name: &str,
        body: &PolicyBody,
    ) -> Result<(), BrokerError>;

    async fn delete_policy(&self, vhost: &str, name: &str) -> Result<(), BrokerError>;

    async fn queue_action(
        &self,
        vhost: &str,
        name: &str,
        action: QueueAction,
    ) -> Result<(), BrokerError>;
}
