//! Compute capabilities consumed by the orchestrator and instance manager,
//! the HTTP gateway client that implements them, and the per-region pool.

use std::collections::BTreeMap;
use std::convert::Infallible;
use std::sync::Arc;

use async_trait::async_trait;
use fleetbot_contracts::{HealthStatus, InstanceState};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::cache::MemoCache;

#[derive(Debug, Error)]
pub enum CloudError {
    #[error("compute request failed: {0}")]
    Transport(String),
    #[error("compute API returned {status}: {body}")]
    Api { status: u16, body: String },
    #[error("compute response could not be decoded: {0}")]
    Decode(String),
}

#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct RunTaskRequest {
    pub cluster_id: String,
    pub task_template_id: String,
    pub subnet_id: String,
    pub security_group_id: String,
    pub tags: BTreeMap<String, String>,
    pub environment: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteTask {
    pub task_id: String,
    pub cluster_id: String,
    #[serde(default)]
    pub last_status: String,
    #[serde(default = "unknown_health")]
    pub health: HealthStatus,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub public_ip: Option<String>,
    #[serde(default)]
    pub started_at: Option<String>,
}

fn unknown_health() -> HealthStatus {
    HealthStatus::Unknown
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RemoteInstance {
    pub instance_id: String,
    pub state: InstanceState,
    #[serde(default)]
    pub tags: BTreeMap<String, String>,
    #[serde(default)]
    pub public_ip: Option<String>,
}

#[async_trait]
pub trait TaskApi: Send + Sync {
    async fn run_task(&self, request: RunTaskRequest) -> Result<RemoteTask, CloudError>;
    async fn list_tasks(&self, cluster_id: &str) -> Result<Vec<RemoteTask>, CloudError>;
    async fn describe_task(
        &self,
        cluster_id: &str,
        task_id: &str,
    ) -> Result<Option<RemoteTask>, CloudError>;
    async fn stop_task(&self, cluster_id: &str, task_id: &str, reason: &str)
        -> Result<(), CloudError>;
}

#[async_trait]
pub trait InstanceApi: Send + Sync {
    async fn describe_instances(&self) -> Result<Vec<RemoteInstance>, CloudError>;
    async fn start_instance(&self, instance_id: &str) -> Result<(), CloudError>;
    async fn stop_instance(&self, instance_id: &str) -> Result<(), CloudError>;
    async fn reboot_instance(&self, instance_id: &str) -> Result<(), CloudError>;
}

/// Region-scoped client for the compute gateway's REST surface.
pub struct HttpComputeClient {
    client: reqwest::Client,
    endpoint: String,
    api_token: Option<String>,
    region: String,
}

#[derive(Deserialize)]
struct TaskList {
    #[serde(default)]
    tasks: Vec<RemoteTask>,
}

#[derive(Deserialize)]
struct InstanceList {
    #[serde(default)]
    instances: Vec<RemoteInstance>,
}

impl HttpComputeClient {
    pub fn new(
        client: reqwest::Client,
        endpoint: &str,
        api_token: Option<String>,
        region: &str,
    ) -> Self {
        Self {
            client,
            endpoint: endpoint.trim_end_matches('/').to_string(),
            api_token,
            region: region.to_string(),
        }
    }

    fn region_url(&self) -> String {
        format!("{}/v1/regions/{}", self.endpoint, self.region)
    }

    fn authorized(&self, builder: reqwest::RequestBuilder) -> reqwest::RequestBuilder {
        match &self.api_token {
            Some(token) => builder.bearer_auth(token),
            None => builder,
        }
    }

    async fn send(&self, builder: reqwest::RequestBuilder) -> Result<reqwest::Response, CloudError> {
        let resp = self
            .authorized(builder)
            .send()
            .await
            .map_err(|e| CloudError::Transport(e.to_string()))?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(CloudError::Api {
                status: status.as_u16(),
                body,
            });
        }
        Ok(resp)
    }

    async fn post_action(&self, url: String) -> Result<(), CloudError> {
        self.send(self.client.post(url)).await.map(|_| ())
    }
}

#[async_trait]
impl TaskApi for HttpComputeClient {
    async fn run_task(&self, request: RunTaskRequest) -> Result<RemoteTask, CloudError> {
        let url = format!(
            "{}/clusters/{}/tasks",
            self.region_url(),
            request.cluster_id
        );
        let resp = self.send(self.client.post(url).json(&request)).await?;
        resp.json()
            .await
            .map_err(|e| CloudError::Decode(e.to_string()))
    }

    async fn list_tasks(&self, cluster_id: &str) -> Result<Vec<RemoteTask>, CloudError> {
        let url = format!("{}/clusters/{cluster_id}/tasks", self.region_url());
        let resp = self.send(self.client.get(url)).await?;
        let list: TaskList = resp
            .json()
            .await
            .map_err(|e| CloudError::Decode(e.to_string()))?;
        Ok(list.tasks)
    }

    async fn describe_task(
        &self,
        cluster_id: &str,
        task_id: &str,
    ) -> Result<Option<RemoteTask>, CloudError> {
        let url = format!("{}/clusters/{cluster_id}/tasks/{task_id}", self.region_url());
        match self.send(self.client.get(url)).await {
            Ok(resp) => resp
                .json()
                .await
                .map(Some)
                .map_err(|e| CloudError::Decode(e.to_string())),
            Err(CloudError::Api { status, .. }) if status == StatusCode::NOT_FOUND.as_u16() => {
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn stop_task(
        &self,
        cluster_id: &str,
        task_id: &str,
        reason: &str,
    ) -> Result<(), CloudError> {
        let url = format!(
            "{}/clusters/{cluster_id}/tasks/{task_id}/stop",
            self.region_url()
        );
        self.send(
            self.client
                .post(url)
                .json(&serde_json::json!({ "reason": reason })),
        )
        .await
        .map(|_| ())
    }
}

#[async_trait]
impl InstanceApi for HttpComputeClient {
    async fn describe_instances(&self) -> Result<Vec<RemoteInstance>, CloudError> {
        let url = format!("{}/instances", self.region_url());
        let resp = self.send(self.client.get(url)).await?;
        let list: InstanceList = resp
            .json()
            .await
            .map_err(|e| CloudError::Decode(e.to_string()))?;
        Ok(list.instances)
    }

    async fn start_instance(&self, instance_id: &str) -> Result<(), CloudError> {
        self.post_action(format!("{}/instances/{instance_id}/start", self.region_url()))
            .await
    }

    async fn stop_instance(&self, instance_id: &str) -> Result<(), CloudError> {
        self.post_action(format!("{}/instances/{instance_id}/stop", self.region_url()))
            .await
    }

    async fn reboot_instance(&self, instance_id: &str) -> Result<(), CloudError> {
        self.post_action(format!("{}/instances/{instance_id}/reboot", self.region_url()))
            .await
    }
}

pub type ClientFactory<T> = Arc<dyn Fn(&str) -> Arc<T> + Send + Sync>;

/// One client per region for a single resource kind, created on first use.
pub struct ClientPool<T: ?Sized> {
    factory: ClientFactory<T>,
    clients: MemoCache<String, Arc<T>>,
}

impl<T: ?Sized + Send + Sync> ClientPool<T> {
    pub fn new(factory: ClientFactory<T>) -> Self {
        Self {
            factory,
            clients: MemoCache::new(),
        }
    }

    pub async fn client(&self, region: &str) -> Arc<T> {
        let factory = &self.factory;
        let loaded = self
            .clients
            .get_or_load(&region.to_string(), || async move {
                tracing::debug!(region, "creating compute client");
                Ok::<_, Infallible>(factory(region))
            })
            .await;
        match loaded {
            Ok(client) => client,
            Err(never) => match never {},
        }
    }
}
