use std::sync::Arc;

use async_trait::async_trait;
use fleetbot_contracts::Permission;
use fleetbot_kernel::{bullet_list, LINE_SEPARATOR};

use super::{server_failure, usage};
use crate::dispatch::{Command, CommandCall, CommandError, Reply};
use crate::instances::{InstanceManager, RebootAction};

fn server_name<'a>(call: &'a CommandCall<'_>) -> Result<&'a str, CommandError> {
    match call.args {
        [name] => Ok(name.as_str()),
        _ => Err(usage(call, "usage.server", &[call.name.to_string()])),
    }
}

pub struct ListServersCommand {
    instances: Arc<InstanceManager>,
}

impl ListServersCommand {
    pub fn new(instances: Arc<InstanceManager>) -> Self {
        Self { instances }
    }
}

#[async_trait]
impl Command for ListServersCommand {
    fn description(&self) -> &'static str {
        "command.servers.description"
    }

    fn required_permissions(&self) -> &'static [Permission] {
        &[Permission::ManageServers]
    }

    async fn run(&self, call: &CommandCall<'_>) -> Result<Reply, CommandError> {
        let instances = self
            .instances
            .get_all_instances()
            .await
            .map_err(|e| server_failure(call, e))?;
        if instances.is_empty() {
            return Ok(Reply::Text(call.tr("servers.empty", &[])));
        }
        let items = instances.into_iter().map(|i| {
            call.tr(
                "servers.item",
                &[
                    i.name.unwrap_or_else(|| i.instance_id.clone()),
                    i.instance_id,
                    i.region,
                    i.state.to_string(),
                ],
            )
        });
        Ok(Reply::Text(format!(
            "{}{LINE_SEPARATOR}{}",
            call.tr("servers.header", &[]),
            bullet_list(items)
        )))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PowerOp {
    Start,
    Stop,
    Restart,
}

/// Start, stop or restart a server and wait for it to settle. Progress goes
/// straight to the chat, so the command itself replies with nothing.
pub struct ServerPowerCommand {
    instances: Arc<InstanceManager>,
    op: PowerOp,
}

impl ServerPowerCommand {
    pub fn new(instances: Arc<InstanceManager>, op: PowerOp) -> Self {
        Self { instances, op }
    }
}

#[async_trait]
impl Command for ServerPowerCommand {
    fn description(&self) -> &'static str {
        match self.op {
            PowerOp::Start => "command.startserver.description",
            PowerOp::Stop => "command.stopserver.description",
            PowerOp::Restart => "command.restartserver.description",
        }
    }

    fn required_permissions(&self) -> &'static [Permission] {
        &[Permission::ManageServers]
    }

    async fn run(&self, call: &CommandCall<'_>) -> Result<Reply, CommandError> {
        let name = server_name(call)?;
        let settled = match self.op {
            PowerOp::Start => self.instances.start_server_gracefully(name, call).await,
            PowerOp::Stop => self.instances.stop_server_gracefully(name, call).await,
            PowerOp::Restart => self.instances.restart_server_gracefully(name, call).await,
        }
        .map_err(|e| server_failure(call, e))?;
        if !settled {
            tracing::info!(server = name, op = ?self.op, "server left mid-transition");
        }
        Ok(Reply::Silent)
    }
}

pub struct RebootServerCommand {
    instances: Arc<InstanceManager>,
}

impl RebootServerCommand {
    pub fn new(instances: Arc<InstanceManager>) -> Self {
        Self { instances }
    }
}

#[async_trait]
impl Command for RebootServerCommand {
    fn description(&self) -> &'static str {
        "command.rebootserver.description"
    }

    fn required_permissions(&self) -> &'static [Permission] {
        &[Permission::ManageServers]
    }

    async fn run(&self, call: &CommandCall<'_>) -> Result<Reply, CommandError> {
        let name = server_name(call)?;
        let key = match self
            .instances
            .reboot_server(name)
            .await
            .map_err(|e| server_failure(call, e))?
        {
            RebootAction::Rebooted => "servers.rebooting",
            RebootAction::Started => "servers.reboot_starting",
        };
        Ok(Reply::Text(call.tr(key, &[name.to_string()])))
    }
}
