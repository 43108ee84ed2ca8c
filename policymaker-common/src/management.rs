//! `Broker` implementation over the RabbitMQ management HTTP API.
use std::time;

use async_trait::async_trait;
use reqwest::{header, RequestBuilder, StatusCode};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use tracing::debug;
use url::Url;

use crate::broker::{Broker, BrokerError, Node, Policy, PolicyBody, Queue, QueueAction};

const QUEUE_COLUMNS: &str = "name,vhost,node,exclusive,auto_delete,policy,state";
const NODE_COLUMNS: &str = "name";

#[derive(Deserialize)]
struct Vhost {
    name: String,
}

/// A client for the management API of a RabbitMQ cluster.
pub struct ManagementClient {
    /// Base URL of the management API, e.g. `http://localhost:15672`.
    base_url: Url,
    user: String,
    password: String,
    client: reqwest::Client,
}

impl ManagementClient {
    pub fn new(
        base_url: Url,
        user: &str,
        password: &str,
        request_timeout: time::Duration,
    ) -> Result<Self, reqwest::Error> {
        let mut headers = header::HeaderMap::new();
        headers.insert(
            header::CONTENT_TYPE,
            header::HeaderValue::from_static("application/json"),
        );

        let client = reqwest::Client::builder()
            .default_headers(headers)
            .user_agent("rabbitmq-policymaker")
            .timeout(request_timeout)
            .build()?;

        Ok(Self {
            base_url,
            user: user.to_owned(),
            password: password.to_owned(),
            client,
        })
    }

    /// Build an API URL out of path segments. Each segment is percent-encoded on its own,
    /// so the default vhost `/` becomes `%2F`.
    pub fn endpoint(&self, segments: &[&str]) -> Result<Url, BrokerError> {
        let mut url = self.base_url.clone();
        url.path_segments_mut()
            .map_err(|_| BrokerError::Decode(format!("{} cannot be a base URL", self.base_url)))?
            .pop_if_empty()
            .push("api")
            .extend(segments);
        Ok(url)
    }

    fn authorized(&self, request: RequestBuilder) -> RequestBuilder {
        request.basic_auth(&self.user, Some(&self.password))
    }

    async fn get_json<T: DeserializeOwned>(
        &self,
        url: Url,
        not_found: impl FnOnce() -> BrokerError,
    ) -> Result<T, BrokerError> {
        debug!(%url, "GET");
        let response = self
            .authorized(self.client.get(url.clone()))
            .send()
            .await
            .map_err(transport_error)?;

        match response.status() {
            status if status.is_success() => response
                .json::<T>()
                .await
                .map_err(|error| BrokerError::Decode(error.to_string())),
            StatusCode::NOT_FOUND => Err(not_found()),
            status => Err(BrokerError::UnexpectedStatus {
                status: status.as_u16(),
                url: url.to_string(),
            }),
        }
    }

    async fn mutate(
        &self,
        request: RequestBuilder,
        action: &'static str,
        kind: &'static str,
        vhost: &str,
        name: &str,
    ) -> Result<(), BrokerError> {
        let response = self
            .authorized(request)
            .send()
            .await
            .map_err(transport_error)?;

        let status = response.status();
        if status.is_success() {
            return Ok(());
        }
        if status == StatusCode::NOT_FOUND {
            return Err(BrokerError::not_found(kind, vhost, name));
        }

        let text = response.text().await.unwrap_or_default();
        Err(BrokerError::MutationRejected {
            action,
            vhost: vhost.to_owned(),
            name: name.to_owned(),
            reason: format!("{}: {}", status, text),
        })
    }
}

fn transport_error(error: reqwest::Error) -> BrokerError {
    BrokerError::NetworkUnavailable(error.to_string())
}

#[async_trait]
impl Broker for ManagementClient {
    async fn list_vhosts(&self) -> Result<Vec<String>, BrokerError> {
        let url = self.endpoint(&["vhosts"])?;
        let vhosts: Vec<Vhost> = self
            .get_json(url, || BrokerError::Decode("vhost listing not found".to_owned()))
            .await?;

        Ok(vhosts.into_iter().map(|vhost| vhost.name).collect())
    }

    async fn list_queues(&self) -> Result<Vec<Queue>, BrokerError> {
        let mut url = self.endpoint(&["queues"])?;
        url.query_pairs_mut().append_pair("columns", QUEUE_COLUMNS);

        self.get_json(url, || {
            BrokerError::Decode("queue listing not found".to_owned())
        })
        .await
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, BrokerError> {
        let mut url = self.endpoint(&["nodes"])?;
        url.query_pairs_mut().append_pair("columns", NODE_COLUMNS);

        self.get_json(url, || BrokerError::Decode("node listing not found".to_owned()))
            .await
    }

    async fn get_queue(&self, vhost: &str, name: &str) -> Result<Queue, BrokerError> {
        let url = self.endpoint(&["queues", vhost, name])?;

        self.get_json(url, || BrokerError::not_found("queue", vhost, name))
            .await
    }

    async fn get_policy(&self, vhost: &str, name: &str) -> Result<Policy, BrokerError> {
        let url = self.endpoint(&["policies", vhost, name])?;

        self.get_json(url, || BrokerError::not_found("policy", vhost, name))
            .await
    }

    async fn create_policy(
        &self,
        vhost: &str,
        name: &str,
        body: &PolicyBody,
    ) -> Result<(), BrokerError> {
        let url = self.endpoint(&["policies", vhost, name])?;
        let request = self.client.put(url).json(body);

        self.mutate(request, "create policy", "vhost", vhost, name)
            .await
    }

    async fn delete_policy(&self, vhost: &str, name: &str) -> Result<(), BrokerError> {
        let url = self.endpoint(&["policies", vhost, name])?;
        let request = self.client.delete(url);

        self.mutate(request, "delete policy", "policy", vhost, name)
            .await
    }

    async fn queue_action(
        &self,
        vhost: &str,
        name: &str,
        action: QueueAction,
    ) -> Result<(), BrokerError> {
        let url = self.endpoint(&["queues", vhost, name, "actions"])?;
        let request = self
            .client
            .post(url)
            .json(&json!({ "action": action.as_str() }));

        self.mutate(request, action.as_str(), "queue", vhost, name)
            .await
    }
}
