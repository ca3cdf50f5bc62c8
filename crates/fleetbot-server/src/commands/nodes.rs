use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use fleetbot_contracts::{HealthStatus, Permission, ServiceType};
use fleetbot_kernel::{bullet_list, describe_age, normalize_username, LINE_SEPARATOR};

use super::{node_failure, usage};
use crate::dispatch::{Command, CommandCall, CommandError, Reply};
use crate::orchestrator::NodeOrchestrator;

const NO_VALUE: &str = "-";

fn parse_service(call: &CommandCall<'_>, raw: &str) -> Result<ServiceType, CommandError> {
    raw.parse::<ServiceType>().map_err(|_| {
        usage(
            call,
            "nodes.unknown_service",
            &[raw.to_string(), ServiceType::all_names().join(", ")],
        )
    })
}

pub struct RunNodeCommand {
    orchestrator: Arc<NodeOrchestrator>,
}

impl RunNodeCommand {
    pub fn new(orchestrator: Arc<NodeOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl Command for RunNodeCommand {
    fn description(&self) -> &'static str {
        "command.runnode.description"
    }

    fn required_permissions(&self) -> &'static [Permission] {
        &[Permission::RunNodes]
    }

    async fn run(&self, call: &CommandCall<'_>) -> Result<Reply, CommandError> {
        let [service, region, rest @ ..] = call.args else {
            return Err(usage(call, "usage.runnode", &[]));
        };
        let service = parse_service(call, service)?;
        if !self.orchestrator.is_region_valid(region) {
            return Err(usage(call, "nodes.unknown_region", &[region.clone()]));
        }
        if !call
            .dispatcher
            .authz()
            .has_permission_for_service(&call.ctx.username, Permission::RunNodes, service.name())
            .await
        {
            return Err(CommandError::Unauthorized(format!("RUN_NODES on {service}")));
        }

        let (hostname, extra) = match rest.split_first() {
            Some((first, tail)) if !first.contains('=') => (Some(first.as_str()), tail),
            _ => (None, rest),
        };
        let task = self
            .orchestrator
            .run_node(region, &call.ctx.username, hostname, service, extra)
            .await
            .map_err(|e| node_failure(call, e))?;
        call.send(&call.tr(
            "nodes.launching",
            &[
                service.to_string(),
                task.host_name.clone(),
                task.location.clone(),
            ],
        ))
        .await;

        match self
            .orchestrator
            .check_node_status(&task)
            .await
            .map_err(|e| node_failure(call, e))?
        {
            HealthStatus::Healthy => {
                let address = self
                    .orchestrator
                    .get_full_task_info(&task.region, &task.cluster_id, &task.id)
                    .await
                    .map_err(|e| node_failure(call, e))?
                    .and_then(|full| full.public_ip)
                    .unwrap_or_else(|| NO_VALUE.to_string());
                Ok(Reply::Text(
                    call.tr("nodes.ready", &[task.host_name.clone(), address]),
                ))
            }
            HealthStatus::Unhealthy => Err(CommandError::ExecutionFailed(
                call.tr("nodes.unhealthy", &[task.host_name.clone()]),
            )),
            HealthStatus::Unknown => Ok(Reply::Text(
                call.tr("nodes.timeout", &[task.host_name.clone()]),
            )),
        }
    }
}

/// `/nodes` shows the caller's own nodes; `/nodes all` shows everyone's and
/// needs root. Both are narrowed to the services the caller may list.
pub struct ListNodesCommand {
    orchestrator: Arc<NodeOrchestrator>,
}

impl ListNodesCommand {
    pub fn new(orchestrator: Arc<NodeOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl Command for ListNodesCommand {
    fn description(&self) -> &'static str {
        "command.nodes.description"
    }

    fn required_permissions(&self) -> &'static [Permission] {
        &[Permission::ListNodes]
    }

    async fn run(&self, call: &CommandCall<'_>) -> Result<Reply, CommandError> {
        let authz = call.dispatcher.authz();
        let username = &call.ctx.username;
        let everyone = match call.args {
            [] => false,
            [scope] if scope.eq_ignore_ascii_case("all") => true,
            _ => return Err(usage(call, "usage.nodes", &[])),
        };
        if everyone && !authz.has_permission(username, Permission::RootAccess).await {
            return Err(CommandError::Unauthorized("ROOT_ACCESS for /nodes all".to_string()));
        }

        let allowed = authz
            .get_allowed_services(username, Permission::ListNodes)
            .await;
        let owner = (!everyone).then_some(username.as_str());
        let tasks = self
            .orchestrator
            .list_tasks(owner)
            .await
            .map_err(|e| node_failure(call, e))?;
        let now = Utc::now();
        let items: Vec<String> = tasks
            .into_iter()
            .filter(|t| allowed.contains(&t.service_name.to_ascii_lowercase()))
            .map(|t| {
                let age = t
                    .started_at
                    .as_deref()
                    .and_then(|s| describe_age(s, now))
                    .unwrap_or_else(|| NO_VALUE.to_string());
                call.tr(
                    "nodes.item",
                    &[
                        t.host_name,
                        t.service_name,
                        t.location,
                        t.state,
                        t.public_ip.unwrap_or_else(|| NO_VALUE.to_string()),
                        t.owner_id,
                        age,
                    ],
                )
            })
            .collect();
        if items.is_empty() {
            return Ok(Reply::Text(call.tr("nodes.empty", &[])));
        }
        Ok(Reply::Text(format!(
            "{}{LINE_SEPARATOR}{}",
            call.tr("nodes.header", &[]),
            bullet_list(items)
        )))
    }
}

pub struct StopNodeCommand {
    orchestrator: Arc<NodeOrchestrator>,
}

impl StopNodeCommand {
    pub fn new(orchestrator: Arc<NodeOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl Command for StopNodeCommand {
    fn description(&self) -> &'static str {
        "command.stopnode.description"
    }

    fn required_permissions(&self) -> &'static [Permission] {
        &[Permission::StopNodes]
    }

    async fn run(&self, call: &CommandCall<'_>) -> Result<Reply, CommandError> {
        let [reference] = call.args else {
            return Err(usage(call, "usage.stopnode", &[]));
        };
        let authz = call.dispatcher.authz();
        let username = &call.ctx.username;

        let task = self
            .orchestrator
            .find_task(reference)
            .await
            .map_err(|e| node_failure(call, e))?
            .ok_or_else(|| {
                CommandError::ExecutionFailed(call.tr("nodes.not_found", &[reference.clone()]))
            })?;
        if !authz
            .has_permission_for_service(username, Permission::StopNodes, &task.service_name)
            .await
        {
            return Err(CommandError::Unauthorized(format!(
                "STOP_NODES on {}",
                task.service_name
            )));
        }
        if task.owner_id != normalize_username(username)
            && !authz.has_permission(username, Permission::RootAccess).await
        {
            return Err(CommandError::ExecutionFailed(call.tr(
                "nodes.not_owner",
                &[task.host_name.clone(), task.owner_id.clone()],
            )));
        }

        self.orchestrator
            .stop_node(&task, username)
            .await
            .map_err(|e| node_failure(call, e))?;
        Ok(Reply::Text(call.tr("nodes.stopped", &[task.host_name])))
    }
}
