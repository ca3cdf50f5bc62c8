use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use fleetbot_contracts::{InstanceInfo, InstanceState, TAG_NAME};
use thiserror::Error;

use crate::cloud::{ClientPool, CloudError, InstanceApi, RemoteInstance};
use crate::waiter::{wait_for_status, WaitOutcome, WaitPolicy};

#[derive(Debug, Error)]
pub enum InstanceError {
    #[error("instance {0} not found")]
    NotFound(String),
    #[error("instance {name} is {state}")]
    InvalidState { name: String, state: InstanceState },
    #[error(transparent)]
    Cloud(#[from] CloudError),
}

/// Receives progress notes as translation keys with positional parameters.
#[async_trait]
pub trait MessageSink: Send + Sync {
    async fn notify(&self, template: &str, params: &[String]);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerRequest {
    Issued,
    AlreadyInTarget,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebootAction {
    Rebooted,
    Started,
}

#[derive(Debug, Clone)]
pub struct InstanceSettings {
    pub poll_delay: Duration,
    pub operation_timeout: Duration,
}

pub struct InstanceManager {
    regions: Vec<String>,
    clients: Arc<ClientPool<dyn InstanceApi>>,
    settings: InstanceSettings,
}

struct Located {
    region: String,
    instance: RemoteInstance,
}

impl InstanceManager {
    pub fn new(
        regions: Vec<String>,
        clients: Arc<ClientPool<dyn InstanceApi>>,
        settings: InstanceSettings,
    ) -> Self {
        Self {
            regions,
            clients,
            settings,
        }
    }

    pub async fn get_all_instances(&self) -> Result<Vec<InstanceInfo>, InstanceError> {
        let mut all = Vec::new();
        for region in &self.regions {
            let client = self.clients.client(region).await;
            all.extend(
                client
                    .describe_instances()
                    .await?
                    .iter()
                    .map(|i| instance_info(i, region)),
            );
        }
        Ok(all)
    }

    /// First region with an exact id match or exactly one `Name` tag match.
    async fn locate(&self, name_or_id: &str) -> Result<Located, InstanceError> {
        for region in &self.regions {
            let client = self.clients.client(region).await;
            let instances = client.describe_instances().await?;
            if let Some(hit) = instances.iter().find(|i| i.instance_id == name_or_id) {
                return Ok(Located {
                    region: region.clone(),
                    instance: hit.clone(),
                });
            }
            let named: Vec<_> = instances
                .iter()
                .filter(|i| i.tags.get(TAG_NAME).is_some_and(|n| n == name_or_id))
                .collect();
            match named.as_slice() {
                [only] => {
                    return Ok(Located {
                        region: region.clone(),
                        instance: (*only).clone(),
                    })
                }
                [] => {}
                several => {
                    tracing::warn!(region = %region, name = name_or_id, matches = several.len(), "ambiguous instance name");
                }
            }
        }
        Err(InstanceError::NotFound(name_or_id.to_string()))
    }

    pub async fn start_instance(&self, name_or_id: &str) -> Result<PowerRequest, InstanceError> {
        let located = self.locate(name_or_id).await?;
        self.request_start(&located).await
    }

    pub async fn stop_instance(&self, name_or_id: &str) -> Result<PowerRequest, InstanceError> {
        let located = self.locate(name_or_id).await?;
        self.request_stop(&located).await
    }

    async fn request_start(&self, located: &Located) -> Result<PowerRequest, InstanceError> {
        if matches!(
            located.instance.state,
            InstanceState::Running | InstanceState::Pending
        ) {
            return Ok(PowerRequest::AlreadyInTarget);
        }
        let client = self.clients.client(&located.region).await;
        client.start_instance(&located.instance.instance_id).await?;
        tracing::info!(instance_id = %located.instance.instance_id, region = %located.region, "instance start requested");
        Ok(PowerRequest::Issued)
    }

    async fn request_stop(&self, located: &Located) -> Result<PowerRequest, InstanceError> {
        if matches!(
            located.instance.state,
            InstanceState::Stopped | InstanceState::Stopping
        ) {
            return Ok(PowerRequest::AlreadyInTarget);
        }
        let client = self.clients.client(&located.region).await;
        client.stop_instance(&located.instance.instance_id).await?;
        tracing::info!(instance_id = %located.instance.instance_id, region = %located.region, "instance stop requested");
        Ok(PowerRequest::Issued)
    }

    async fn await_state(
        &self,
        located: &Located,
        target: InstanceState,
    ) -> Result<WaitOutcome<RemoteInstance>, InstanceError> {
        let client = self.clients.client(&located.region).await;
        let id = located.instance.instance_id.clone();
        let policy = WaitPolicy::constant(self.settings.poll_delay, self.settings.operation_timeout);
        let outcome = wait_for_status(
            &policy,
            || {
                let client = client.clone();
                let id = id.clone();
                async move {
                    let instances = client.describe_instances().await?;
                    Ok::<_, CloudError>(
                        instances
                            .into_iter()
                            .find(|i| i.instance_id == id)
                            .unwrap_or(RemoteInstance {
                                instance_id: id,
                                state: InstanceState::Unknown,
                                tags: Default::default(),
                                public_ip: None,
                            }),
                    )
                }
            },
            |observed| observed.state == target,
        )
        .await?;
        Ok(outcome)
    }

    /// Returns whether the instance was observed running before the timeout.
    pub async fn start_server_gracefully(
        &self,
        name: &str,
        sink: &dyn MessageSink,
    ) -> Result<bool, InstanceError> {
        let located = self.locate(name).await?;
        if located.instance.state == InstanceState::Running {
            sink.notify("servers.already_running", &[name.to_string()]).await;
            return Ok(true);
        }
        sink.notify("servers.starting", &[name.to_string()]).await;
        self.request_start(&located).await?;
        match self.await_state(&located, InstanceState::Running).await? {
            WaitOutcome::Reached(instance) => {
                let address = instance.public_ip.unwrap_or_else(|| "-".to_string());
                sink.notify("servers.started", &[name.to_string(), address]).await;
                Ok(true)
            }
            WaitOutcome::TimedOut(_) => {
                self.notify_timeout(sink, name, InstanceState::Running).await;
                Ok(false)
            }
        }
    }

    /// Returns whether the instance was observed stopped before the timeout.
    pub async fn stop_server_gracefully(
        &self,
        name: &str,
        sink: &dyn MessageSink,
    ) -> Result<bool, InstanceError> {
        let located = self.locate(name).await?;
        if located.instance.state == InstanceState::Stopped {
            sink.notify("servers.already_stopped", &[name.to_string()]).await;
            return Ok(true);
        }
        sink.notify("servers.stopping", &[name.to_string()]).await;
        self.request_stop(&located).await?;
        match self.await_state(&located, InstanceState::Stopped).await? {
            WaitOutcome::Reached(_) => {
                sink.notify("servers.stopped", &[name.to_string()]).await;
                Ok(true)
            }
            WaitOutcome::TimedOut(_) => {
                self.notify_timeout(sink, name, InstanceState::Stopped).await;
                Ok(false)
            }
        }
    }

    /// Stops then starts; the start is skipped if the stop never completes.
    pub async fn restart_server_gracefully(
        &self,
        name: &str,
        sink: &dyn MessageSink,
    ) -> Result<bool, InstanceError> {
        if !self.stop_server_gracefully(name, sink).await? {
            return Ok(false);
        }
        self.start_server_gracefully(name, sink).await
    }

    pub async fn reboot_server(&self, name: &str) -> Result<RebootAction, InstanceError> {
        let located = self.locate(name).await?;
        let client = self.clients.client(&located.region).await;
        let id = &located.instance.instance_id;
        match located.instance.state {
            InstanceState::Stopped => {
                client.start_instance(id).await?;
                tracing::info!(instance_id = %id, "reboot of stopped instance issued as start");
                Ok(RebootAction::Started)
            }
            InstanceState::Running => {
                client.reboot_instance(id).await?;
                tracing::info!(instance_id = %id, "instance reboot requested");
                Ok(RebootAction::Rebooted)
            }
            state => Err(InstanceError::InvalidState {
                name: name.to_string(),
                state,
            }),
        }
    }

    async fn notify_timeout(&self, sink: &dyn MessageSink, name: &str, target: InstanceState) {
        tracing::warn!(name, target = %target, "instance did not reach target state in time");
        sink.notify(
            "servers.timeout",
            &[
                name.to_string(),
                target.to_string(),
                self.settings.operation_timeout.as_secs().to_string(),
            ],
        )
        .await;
    }
}

fn instance_info(instance: &RemoteInstance, region: &str) -> InstanceInfo {
    InstanceInfo {
        instance_id: instance.instance_id.clone(),
        name: instance.tags.get(TAG_NAME).cloned(),
        state: instance.state,
        region: region.to_string(),
        public_ip: instance.public_ip.clone(),
    }
}
