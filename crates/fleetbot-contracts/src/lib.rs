use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

pub const TAG_HOSTNAME: &str = "hostname";
pub const TAG_OWNER: &str = "owner";
pub const TAG_SERVICE: &str = "service";
pub const TAG_NAME: &str = "Name";

/// Inbound webhook payload, shaped like a Telegram `Update`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundUpdate {
    pub update_id: i64,
    #[serde(default)]
    pub message: Option<InboundMessage>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InboundMessage {
    #[serde(default)]
    pub chat: Option<Chat>,
    #[serde(default)]
    pub text: Option<String>,
    #[serde(default)]
    pub from: Option<Sender>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Chat {
    pub id: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Sender {
    #[serde(default)]
    pub username: Option<String>,
    #[serde(default)]
    pub language_code: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Permission {
    ListNodes,
    RunNodes,
    StopNodes,
    ManageServers,
    ManageUsers,
    RootAccess,
}

impl Permission {
    pub const ALL: [Permission; 6] = [
        Permission::ListNodes,
        Permission::RunNodes,
        Permission::StopNodes,
        Permission::ManageServers,
        Permission::ManageUsers,
        Permission::RootAccess,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Permission::ListNodes => "LIST_NODES",
            Permission::RunNodes => "RUN_NODES",
            Permission::StopNodes => "STOP_NODES",
            Permission::ManageServers => "MANAGE_SERVERS",
            Permission::ManageUsers => "MANAGE_USERS",
            Permission::RootAccess => "ROOT_ACCESS",
        }
    }
}

impl fmt::Display for Permission {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Permission {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_uppercase().replace('-', "_");
        Permission::ALL
            .into_iter()
            .find(|p| p.as_str() == normalized)
            .ok_or_else(|| format!("unknown permission {raw}"))
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, PartialOrd, Ord)]
#[serde(rename_all = "snake_case")]
pub enum ServiceType {
    Vpn,
    Minecraft,
}

impl ServiceType {
    pub const ALL: [ServiceType; 2] = [ServiceType::Vpn, ServiceType::Minecraft];

    pub fn name(self) -> &'static str {
        match self {
            ServiceType::Vpn => "vpn",
            ServiceType::Minecraft => "minecraft",
        }
    }

    pub fn hostname_prefix(self) -> &'static str {
        match self {
            ServiceType::Vpn => "vpn",
            ServiceType::Minecraft => "mc",
        }
    }

    pub fn all_names() -> Vec<&'static str> {
        ServiceType::ALL.iter().map(|s| s.name()).collect()
    }
}

impl fmt::Display for ServiceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ServiceType {
    type Err = String;

    fn from_str(raw: &str) -> Result<Self, Self::Err> {
        let normalized = raw.trim().to_ascii_lowercase();
        ServiceType::ALL
            .into_iter()
            .find(|s| s.name() == normalized)
            .ok_or_else(|| format!("unknown service {raw}"))
    }
}

/// A (service, permission) pair; `service = None` applies to every service.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Entitlement {
    #[serde(default)]
    pub service: Option<String>,
    pub permission: Permission,
}

impl Entitlement {
    pub fn global(permission: Permission) -> Self {
        Self {
            service: None,
            permission,
        }
    }

    pub fn scoped(service: &str, permission: Permission) -> Self {
        Self {
            service: Some(service.to_string()),
            permission,
        }
    }
}

pub type PermissionTable = BTreeMap<String, Vec<Entitlement>>;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Region {
    pub id: String,
    pub city: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskRuntimeParameters {
    pub cluster_id: String,
    pub task_template_id: String,
    pub subnet_id: String,
    pub security_group_id: String,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum HealthStatus {
    Healthy,
    Unhealthy,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct TaskInfo {
    pub id: String,
    pub host_name: String,
    pub state: String,
    pub cluster_id: String,
    pub region: String,
    pub location: String,
    #[serde(default)]
    pub public_ip: Option<String>,
    pub service_name: String,
    pub owner_id: String,
    #[serde(default)]
    pub started_at: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum InstanceState {
    Pending,
    Running,
    ShuttingDown,
    Terminated,
    Stopping,
    Stopped,
    #[serde(other)]
    Unknown,
}

impl InstanceState {
    pub fn as_str(self) -> &'static str {
        match self {
            InstanceState::Pending => "pending",
            InstanceState::Running => "running",
            InstanceState::ShuttingDown => "shutting-down",
            InstanceState::Terminated => "terminated",
            InstanceState::Stopping => "stopping",
            InstanceState::Stopped => "stopped",
            InstanceState::Unknown => "unknown",
        }
    }
}

impl fmt::Display for InstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A VM instance paired with the region it was discovered in.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct InstanceInfo {
    pub instance_id: String,
    pub name: Option<String>,
    pub state: InstanceState,
    pub region: String,
    #[serde(default)]
    pub public_ip: Option<String>,
}
