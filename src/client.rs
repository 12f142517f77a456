//! Control plane API client.
//!
//! The node condition exporter talks to the control plane through the
//! [`NodeClient`] trait so that reconciliation logic stays independent of the
//! transport. The shipped implementation is a thin HTTP client; tests mock
//! the trait instead.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;

use crate::error::ClientError;

/// Upper bound on any single API request. A stalled control plane connection
/// must fail the call rather than wedge the reconcile loop, which holds the
/// exporter's state lock while it runs.
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

pub const EVENT_TYPE_NORMAL: &str = "Normal";
pub const EVENT_TYPE_WARNING: &str = "Warning";

pub const CONDITION_TRUE: &str = "True";
pub const CONDITION_FALSE: &str = "False";

/// One entry in the node's condition list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NodeCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    /// "True" when the subsystem is healthy, "False" otherwise.
    pub status: String,
    pub reason: String,
    pub message: String,
    pub last_heartbeat_time: DateTime<Utc>,
    pub last_transition_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ObjectMeta {
    #[serde(default)]
    pub name: String,
}

/// Node status as fetched from the control plane. Condition entries are kept
/// as raw JSON values so that entries owned by other writers survive a
/// fetch/patch round trip untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct NodeStatus {
    #[serde(default)]
    pub conditions: Vec<serde_json::Value>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Node {
    #[serde(default)]
    pub metadata: ObjectMeta,
    #[serde(default)]
    pub status: NodeStatus,
}

/// A one-shot event record attached to the node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Event {
    pub node_name: String,
    /// "Normal" or "Warning".
    pub event_type: String,
    pub reason: String,
    pub message: String,
}

/// Operations the exporter needs from the control plane.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Fetches the current remote node object.
    async fn get_node(&self, name: &str) -> Result<Node, ClientError>;

    /// Merge-patches the node's status conditions. The supplied list is the
    /// full condition list to publish; the patch must not disturb any other
    /// status field.
    async fn patch_node_conditions(
        &self,
        name: &str,
        conditions: &[serde_json::Value],
    ) -> Result<(), ClientError>;

    /// Records a short-lived event against the node.
    async fn record_event(&self, event: &Event) -> Result<(), ClientError>;
}

/// HTTP implementation of [`NodeClient`].
pub struct HttpNodeClient {
    client: reqwest::Client,
    base_url: String,
    token: Option<String>,
    timeout: Duration,
}

impl HttpNodeClient {
    pub fn new(base_url: impl Into<String>, token: Option<String>) -> Self {
        Self::with_timeout(base_url, token, REQUEST_TIMEOUT)
    }

    pub fn with_timeout(
        base_url: impl Into<String>,
        token: Option<String>,
        timeout: Duration,
    ) -> Self {
        HttpNodeClient {
            client: reqwest::Client::new(),
            base_url: base_url.into().trim_end_matches('/').to_string(),
            token,
            timeout,
        }
    }

    fn node_url(&self, name: &str) -> String {
        format!("{}/api/v1/nodes/{}", self.base_url, name)
    }

    fn node_status_url(&self, name: &str) -> String {
        format!("{}/api/v1/nodes/{}/status", self.base_url, name)
    }

    fn events_url(&self) -> String {
        format!("{}/api/v1/namespaces/default/events", self.base_url)
    }

    fn authorize(&self, request: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        let request = request.timeout(self.timeout);
        match &self.token {
            Some(token) => request.bearer_auth(token),
            None => request,
        }
    }

    async fn check(response: reqwest::Response) -> Result<reqwest::Response, ClientError> {
        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }
        let message = response.text().await.unwrap_or_default();
        Err(ClientError::Api {
            status: status.as_u16(),
            message,
        })
    }
}

#[async_trait]
impl NodeClient for HttpNodeClient {
    async fn get_node(&self, name: &str) -> Result<Node, ClientError> {
        let response = self
            .authorize(self.client.get(self.node_url(name)))
            .send()
            .await?;
        Ok(Self::check(response).await?.json::<Node>().await?)
    }

    async fn patch_node_conditions(
        &self,
        name: &str,
        conditions: &[serde_json::Value],
    ) -> Result<(), ClientError> {
        let body = json!({ "status": { "conditions": conditions } });
        let response = self
            .authorize(self.client.patch(self.node_status_url(name)))
            .header(reqwest::header::CONTENT_TYPE, "application/merge-patch+json")
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }

    async fn record_event(&self, event: &Event) -> Result<(), ClientError> {
        let body = json!({
            "metadata": { "generateName": format!("{}.", event.node_name) },
            "involvedObject": { "kind": "Node", "name": event.node_name },
            "type": event.event_type,
            "reason": event.reason,
            "message": event.message,
            "firstTimestamp": Utc::now(),
        });
        let response = self
            .authorize(self.client.post(self.events_url()))
            .json(&body)
            .send()
            .await?;
        Self::check(response).await?;
        Ok(())
    }
}
