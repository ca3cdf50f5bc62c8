use std::sync::Arc;

use async_trait::async_trait;
use fleetbot_contracts::Permission;
use fleetbot_kernel::{bullet_list, LINE_SEPARATOR};

use super::node_failure;
use crate::dispatch::{Command, CommandCall, CommandError, Reply};
use crate::orchestrator::NodeOrchestrator;

pub struct HelpCommand;

#[async_trait]
impl Command for HelpCommand {
    fn description(&self) -> &'static str {
        "command.help.description"
    }

    fn required_permissions(&self) -> &'static [Permission] {
        &[]
    }

    async fn run(&self, call: &CommandCall<'_>) -> Result<Reply, CommandError> {
        Ok(Reply::Text(
            match call.dispatcher.render_command_list(call.ctx).await {
                Some(list) => format!("{}{LINE_SEPARATOR}{list}", call.tr("help.header", &[])),
                None => call.tr("help.empty", &[]),
            },
        ))
    }
}

pub struct RegionsCommand {
    orchestrator: Arc<NodeOrchestrator>,
}

impl RegionsCommand {
    pub fn new(orchestrator: Arc<NodeOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl Command for RegionsCommand {
    fn description(&self) -> &'static str {
        "command.regions.description"
    }

    fn required_permissions(&self) -> &'static [Permission] {
        &[]
    }

    async fn run(&self, call: &CommandCall<'_>) -> Result<Reply, CommandError> {
        let regions = self
            .orchestrator
            .get_supported_region_descriptions()
            .await
            .map_err(|e| node_failure(call, e))?;
        if regions.is_empty() {
            return Ok(Reply::Text(call.tr("regions.empty", &[])));
        }
        let items = regions.into_iter().map(|r| {
            call.tr("regions.item", &[r.id, r.city, r.label])
        });
        Ok(Reply::Text(format!(
            "{}{LINE_SEPARATOR}{}",
            call.tr("regions.header", &[]),
            bullet_list(items)
        )))
    }
}

pub struct ServicesCommand {
    orchestrator: Arc<NodeOrchestrator>,
}

impl ServicesCommand {
    pub fn new(orchestrator: Arc<NodeOrchestrator>) -> Self {
        Self { orchestrator }
    }
}

#[async_trait]
impl Command for ServicesCommand {
    fn description(&self) -> &'static str {
        "command.services.description"
    }

    fn required_permissions(&self) -> &'static [Permission] {
        &[]
    }

    async fn run(&self, call: &CommandCall<'_>) -> Result<Reply, CommandError> {
        let services = self.orchestrator.get_supported_service_types();
        Ok(Reply::Text(format!(
            "{}{LINE_SEPARATOR}{}",
            call.tr("services.header", &[]),
            bullet_list(services.iter().map(|s| s.name()))
        )))
    }
}
