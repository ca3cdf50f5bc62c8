//! The chat command set.

mod info;
mod nodes;
mod servers;
mod users;

use std::sync::Arc;

use crate::authz::AuthorizationEngine;
use crate::dispatch::{CommandCall, CommandError, CommandRegistry};
use crate::instances::{InstanceError, InstanceManager};
use crate::orchestrator::{NodeOrchestrator, OrchestratorError};

pub use info::{HelpCommand, RegionsCommand, ServicesCommand};
pub use nodes::{ListNodesCommand, RunNodeCommand, StopNodeCommand};
pub use servers::{ListServersCommand, PowerOp, RebootServerCommand, ServerPowerCommand};
pub use users::{GrantCommand, RevokeCommand, UsersCommand};

#[derive(Clone)]
pub struct CommandDeps {
    pub orchestrator: Arc<NodeOrchestrator>,
    pub instances: Arc<InstanceManager>,
    pub authz: Arc<AuthorizationEngine>,
}

pub fn default_registry(deps: &CommandDeps) -> CommandRegistry {
    let mut registry = CommandRegistry::new();
    registry.register("/help", Arc::new(HelpCommand));
    registry.register("/regions", Arc::new(RegionsCommand::new(deps.orchestrator.clone())));
    registry.register("/services", Arc::new(ServicesCommand::new(deps.orchestrator.clone())));
    registry.register("/runnode", Arc::new(RunNodeCommand::new(deps.orchestrator.clone())));
    registry.register("/nodes", Arc::new(ListNodesCommand::new(deps.orchestrator.clone())));
    registry.register("/stopnode", Arc::new(StopNodeCommand::new(deps.orchestrator.clone())));
    registry.register("/servers", Arc::new(ListServersCommand::new(deps.instances.clone())));
    for (name, op) in [
        ("/startserver", PowerOp::Start),
        ("/stopserver", PowerOp::Stop),
        ("/restartserver", PowerOp::Restart),
    ] {
        registry.register(name, Arc::new(ServerPowerCommand::new(deps.instances.clone(), op)));
    }
    registry.register(
        "/rebootserver",
        Arc::new(RebootServerCommand::new(deps.instances.clone())),
    );
    registry.register("/grant", Arc::new(GrantCommand::new(deps.authz.clone())));
    registry.register("/revoke", Arc::new(RevokeCommand::new(deps.authz.clone())));
    registry.register("/users", Arc::new(UsersCommand::new(deps.authz.clone())));
    registry
}

fn node_failure(call: &CommandCall<'_>, err: OrchestratorError) -> CommandError {
    match err {
        OrchestratorError::UnknownRegion(region) => {
            CommandError::ExecutionFailed(call.tr("nodes.unknown_region", &[region]))
        }
        OrchestratorError::UnsupportedRegion { service, region } => CommandError::ExecutionFailed(
            call.tr("nodes.unsupported_region", &[service.to_string(), region]),
        ),
        OrchestratorError::HostnameTaken { hostname, region } => {
            CommandError::ExecutionFailed(call.tr("nodes.hostname_taken", &[hostname, region]))
        }
        OrchestratorError::HostnameExhausted(attempts) => CommandError::ExecutionFailed(
            call.tr("nodes.hostname_exhausted", &[attempts.to_string()]),
        ),
        OrchestratorError::InvalidExtraArgument(arg) => {
            CommandError::InvalidSyntax(call.tr("usage.bad_argument", &[arg]))
        }
        OrchestratorError::Cloud(err) => {
            CommandError::ExecutionFailed(call.tr("nodes.cloud_error", &[err.to_string()]))
        }
        OrchestratorError::Store(err) => CommandError::Internal(err.to_string()),
    }
}

fn server_failure(call: &CommandCall<'_>, err: InstanceError) -> CommandError {
    match err {
        InstanceError::NotFound(name) => {
            CommandError::ExecutionFailed(call.tr("servers.not_found", &[name]))
        }
        InstanceError::InvalidState { name, state } => CommandError::ExecutionFailed(
            call.tr("servers.invalid_state", &[name, state.to_string()]),
        ),
        InstanceError::Cloud(err) => {
            CommandError::ExecutionFailed(call.tr("servers.cloud_error", &[err.to_string()]))
        }
    }
}

fn usage(call: &CommandCall<'_>, key: &str, params: &[String]) -> CommandError {
    CommandError::InvalidSyntax(call.tr(key, params))
}
