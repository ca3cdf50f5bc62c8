//! Container task lifecycle: launch, health polling, discovery and teardown
//! across every configured region and service type.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use fleetbot_contracts::{
    HealthStatus, Region, ServiceType, TaskInfo, TaskRuntimeParameters, TAG_HOSTNAME, TAG_OWNER,
    TAG_SERVICE,
};
use fleetbot_kernel::{node_hostname, normalize_username, resolve_region, split_key_value};
use thiserror::Error;

use crate::cloud::{ClientPool, CloudError, RemoteTask, RunTaskRequest, TaskApi};
use crate::store::StoreError;
use crate::task_config::TaskConfigCache;
use crate::waiter::{wait_for_status, WaitOutcome, WaitPolicy};

const STOPPED_STATUS: &str = "STOPPED";

#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("unknown region {0}")]
    UnknownRegion(String),
    #[error("{service} is not supported in {region}")]
    UnsupportedRegion { service: ServiceType, region: String },
    #[error("hostname {hostname} is already in use in {region}")]
    HostnameTaken { hostname: String, region: String },
    #[error("no free hostname after {0} attempts")]
    HostnameExhausted(u32),
    #[error("argument {0} is not KEY=VALUE")]
    InvalidExtraArgument(String),
    #[error(transparent)]
    Cloud(#[from] CloudError),
    #[error(transparent)]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct NodeSettings {
    pub health_poll_interval: Duration,
    pub health_timeout: Duration,
    pub hostname_max_attempts: u32,
}

pub struct NodeOrchestrator {
    regions: Vec<Region>,
    tasks: Arc<ClientPool<dyn TaskApi>>,
    task_config: Arc<TaskConfigCache>,
    settings: NodeSettings,
}

impl NodeOrchestrator {
    pub fn new(
        regions: Vec<Region>,
        tasks: Arc<ClientPool<dyn TaskApi>>,
        task_config: Arc<TaskConfigCache>,
        settings: NodeSettings,
    ) -> Self {
        Self {
            regions,
            tasks,
            task_config,
            settings,
        }
    }

    pub fn is_region_valid(&self, region_or_city: &str) -> bool {
        resolve_region(&self.regions, region_or_city).is_some()
    }

    pub fn resolve_region(&self, region_or_city: &str) -> Result<&Region, OrchestratorError> {
        resolve_region(&self.regions, region_or_city)
            .ok_or_else(|| OrchestratorError::UnknownRegion(region_or_city.to_string()))
    }

    pub async fn is_region_supported(
        &self,
        region: &str,
        service: ServiceType,
    ) -> Result<bool, OrchestratorError> {
        let region = self.resolve_region(region)?;
        Ok(self
            .task_config
            .get(&region.id, service, false)
            .await?
            .is_some())
    }

    async fn runtime_parameters(
        &self,
        region: &Region,
        service: ServiceType,
    ) -> Result<TaskRuntimeParameters, OrchestratorError> {
        self.task_config
            .get(&region.id, service, false)
            .await?
            .ok_or_else(|| OrchestratorError::UnsupportedRegion {
                service,
                region: region.id.clone(),
            })
    }

    async fn hostnames_in_use(
        &self,
        region: &Region,
        params: &TaskRuntimeParameters,
        service: ServiceType,
    ) -> Result<HashSet<String>, OrchestratorError> {
        let client = self.tasks.client(&region.id).await;
        let listed = client.list_tasks(&params.cluster_id).await?;
        Ok(listed
            .iter()
            .filter(|t| is_live(t) && carries_service(t, service))
            .filter_map(|t| t.tags.get(TAG_HOSTNAME))
            .map(|h| h.to_ascii_lowercase())
            .collect())
    }

    pub async fn is_hostname_available(
        &self,
        region: &str,
        hostname: &str,
        service: ServiceType,
    ) -> Result<bool, OrchestratorError> {
        let region = self.resolve_region(region)?;
        let params = self.runtime_parameters(region, service).await?;
        let in_use = self.hostnames_in_use(region, &params, service).await?;
        Ok(!in_use.contains(&hostname.to_ascii_lowercase()))
    }

    pub async fn run_node(
        &self,
        region: &str,
        owner_id: &str,
        hostname: Option<&str>,
        service: ServiceType,
        extra_args: &[String],
    ) -> Result<TaskInfo, OrchestratorError> {
        let region = self.resolve_region(region)?;
        let environment = parse_environment(extra_args)?;
        let params = self.runtime_parameters(region, service).await?;
        let in_use = self.hostnames_in_use(region, &params, service).await?;
        let owner = normalize_username(owner_id);

        let hostname = match hostname {
            Some(requested) => {
                if in_use.contains(&requested.to_ascii_lowercase()) {
                    return Err(OrchestratorError::HostnameTaken {
                        hostname: requested.to_string(),
                        region: region.id.clone(),
                    });
                }
                requested.to_string()
            }
            None => (1..=self.settings.hostname_max_attempts)
                .map(|n| node_hostname(&owner, &region.city, service.hostname_prefix(), n))
                .find(|candidate| !in_use.contains(candidate))
                .ok_or(OrchestratorError::HostnameExhausted(
                    self.settings.hostname_max_attempts,
                ))?,
        };

        let tags = BTreeMap::from([
            (TAG_HOSTNAME.to_string(), hostname.clone()),
            (TAG_OWNER.to_string(), owner.clone()),
            (TAG_SERVICE.to_string(), service.name().to_string()),
        ]);
        let client = self.tasks.client(&region.id).await;
        let launched = client
            .run_task(RunTaskRequest {
                cluster_id: params.cluster_id.clone(),
                task_template_id: params.task_template_id.clone(),
                subnet_id: params.subnet_id.clone(),
                security_group_id: params.security_group_id.clone(),
                tags,
                environment,
            })
            .await?;
        tracing::info!(
            task_id = %launched.task_id,
            region = %region.id,
            service = %service,
            hostname = %hostname,
            owner = %owner,
            "node launched"
        );
        Ok(task_info(&launched, region, Some(service)))
    }

    /// Polls until healthy or explicitly unhealthy. A task that disappears or
    /// stops counts as unhealthy; running out of time yields `Unknown`.
    pub async fn check_node_status(
        &self,
        task: &TaskInfo,
    ) -> Result<HealthStatus, OrchestratorError> {
        let client = self.tasks.client(&task.region).await;
        let policy = WaitPolicy::constant(
            self.settings.health_poll_interval,
            self.settings.health_timeout,
        );
        let outcome = wait_for_status(
            &policy,
            || {
                let client = client.clone();
                async move {
                    let described = client.describe_task(&task.cluster_id, &task.id).await?;
                    Ok::<_, CloudError>(match described {
                        Some(remote) if is_live(&remote) => remote.health,
                        _ => HealthStatus::Unhealthy,
                    })
                }
            },
            |status| *status != HealthStatus::Unknown,
        )
        .await?;
        Ok(match outcome {
            WaitOutcome::Reached(status) => status,
            WaitOutcome::TimedOut(_) => {
                tracing::warn!(task_id = %task.id, "health check timed out");
                HealthStatus::Unknown
            }
        })
    }

    pub async fn get_full_task_info(
        &self,
        region: &str,
        cluster_id: &str,
        task_id: &str,
    ) -> Result<Option<TaskInfo>, OrchestratorError> {
        let region = self.resolve_region(region)?;
        let client = self.tasks.client(&region.id).await;
        Ok(client
            .describe_task(cluster_id, task_id)
            .await?
            .map(|remote| task_info(&remote, region, None)))
    }

    /// Every live task of every supported (region, service) pair, optionally
    /// restricted to one owner. Regions whose listing fails are skipped.
    pub async fn list_tasks(&self, owner_id: Option<&str>) -> Result<Vec<TaskInfo>, OrchestratorError> {
        let owner = owner_id.map(normalize_username);
        let mut found = Vec::new();
        for region in &self.regions {
            let client = self.tasks.client(&region.id).await;
            for service in ServiceType::ALL {
                let Some(params) = self.task_config.get(&region.id, service, false).await? else {
                    continue;
                };
                let listed = match client.list_tasks(&params.cluster_id).await {
                    Ok(listed) => listed,
                    Err(err) => {
                        tracing::warn!(error = %err, region = %region.id, service = %service, "task listing failed");
                        continue;
                    }
                };
                found.extend(
                    listed
                        .iter()
                        .filter(|t| is_live(t) && carries_service(t, service))
                        .filter(|t| match &owner {
                            Some(owner) => t.tags.get(TAG_OWNER).is_some_and(|o| o.eq_ignore_ascii_case(owner)),
                            None => true,
                        })
                        .map(|t| task_info(t, region, Some(service))),
                );
            }
        }
        Ok(found)
    }

    /// Matches a task id exactly or a hostname ignoring case.
    pub async fn find_task(&self, reference: &str) -> Result<Option<TaskInfo>, OrchestratorError> {
        Ok(self
            .list_tasks(None)
            .await?
            .into_iter()
            .find(|t| t.id == reference || t.host_name.eq_ignore_ascii_case(reference)))
    }

    pub async fn stop_node(&self, task: &TaskInfo, requested_by: &str) -> Result<(), OrchestratorError> {
        let client = self.tasks.client(&task.region).await;
        client
            .stop_task(
                &task.cluster_id,
                &task.id,
                &format!("stopped by {requested_by}"),
            )
            .await?;
        tracing::info!(task_id = %task.id, region = %task.region, requested_by, "node stop requested");
        Ok(())
    }

    /// Regions where at least one service type has runtime parameters.
    pub async fn get_supported_region_descriptions(&self) -> Result<Vec<Region>, OrchestratorError> {
        let mut supported = Vec::new();
        for region in &self.regions {
            for service in ServiceType::ALL {
                if self.task_config.get(&region.id, service, false).await?.is_some() {
                    supported.push(region.clone());
                    break;
                }
            }
        }
        Ok(supported)
    }

    pub fn get_supported_service_types(&self) -> Vec<ServiceType> {
        ServiceType::ALL.to_vec()
    }
}

fn parse_environment(extra_args: &[String]) -> Result<BTreeMap<String, String>, OrchestratorError> {
    extra_args
        .iter()
        .map(|arg| {
            split_key_value(arg)
                .map(|(k, v)| (k.to_string(), v.to_string()))
                .ok_or_else(|| OrchestratorError::InvalidExtraArgument(arg.clone()))
        })
        .collect()
}

fn is_live(task: &RemoteTask) -> bool {
    !task.last_status.eq_ignore_ascii_case(STOPPED_STATUS)
}

fn carries_service(task: &RemoteTask, service: ServiceType) -> bool {
    task.tags
        .get(TAG_SERVICE)
        .is_some_and(|s| s.eq_ignore_ascii_case(service.name()))
}

fn task_info(remote: &RemoteTask, region: &Region, service: Option<ServiceType>) -> TaskInfo {
    let service_name = remote
        .tags
        .get(TAG_SERVICE)
        .cloned()
        .or_else(|| service.map(|s| s.name().to_string()))
        .unwrap_or_default();
    TaskInfo {
        id: remote.task_id.clone(),
        host_name: remote
            .tags
            .get(TAG_HOSTNAME)
            .cloned()
            .unwrap_or_else(|| remote.task_id.clone()),
        state: remote.last_status.clone(),
        cluster_id: remote.cluster_id.clone(),
        region: region.id.clone(),
        location: region.label.clone(),
        public_ip: remote.public_ip.clone(),
        service_name,
        owner_id: remote.tags.get(TAG_OWNER).cloned().unwrap_or_default(),
        started_at: remote.started_at.clone(),
    }
}
