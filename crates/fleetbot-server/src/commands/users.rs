use std::sync::Arc;

use async_trait::async_trait;
use fleetbot_contracts::{Entitlement, Permission, ServiceType};
use fleetbot_kernel::{bullet_list, normalize_username, LINE_SEPARATOR};

use super::usage;
use crate::authz::AuthorizationEngine;
use crate::dispatch::{Command, CommandCall, CommandError, Reply};

fn parse_permission(call: &CommandCall<'_>, raw: &str) -> Result<Permission, CommandError> {
    raw.parse::<Permission>().map_err(|_| {
        let known: Vec<&str> = Permission::ALL.iter().map(|p| p.as_str()).collect();
        usage(
            call,
            "users.unknown_permission",
            &[raw.to_string(), known.join(", ")],
        )
    })
}

fn describe_entitlement(call: &CommandCall<'_>, entitlement: &Entitlement) -> String {
    let scope = match &entitlement.service {
        Some(service) => service.clone(),
        None => call.tr("users.any_service", &[]),
    };
    format!("{} ({scope})", entitlement.permission)
}

/// Root entitlements are only handed out or taken away by root holders.
async fn require_root(call: &CommandCall<'_>, action: &str) -> Result<(), CommandError> {
    if call
        .dispatcher
        .authz()
        .has_permission(&call.ctx.username, Permission::RootAccess)
        .await
    {
        return Ok(());
    }
    Err(CommandError::Unauthorized(format!("{action} needs ROOT_ACCESS")))
}

pub struct GrantCommand {
    authz: Arc<AuthorizationEngine>,
}

impl GrantCommand {
    pub fn new(authz: Arc<AuthorizationEngine>) -> Self {
        Self { authz }
    }
}

#[async_trait]
impl Command for GrantCommand {
    fn description(&self) -> &'static str {
        "command.grant.description"
    }

    fn required_permissions(&self) -> &'static [Permission] {
        &[Permission::ManageUsers]
    }

    async fn run(&self, call: &CommandCall<'_>) -> Result<Reply, CommandError> {
        let (user, permission, service) = match call.args {
            [user, permission] => (user, permission, None),
            [user, permission, service] => (user, permission, Some(service)),
            _ => return Err(usage(call, "usage.grant", &[])),
        };
        let user = normalize_username(user);
        if user.is_empty() {
            return Err(usage(call, "usage.grant", &[]));
        }
        let permission = parse_permission(call, permission)?;
        let service = match service {
            Some(raw) => Some(
                raw.parse::<ServiceType>()
                    .map_err(|_| {
                        usage(
                            call,
                            "nodes.unknown_service",
                            &[raw.clone(), ServiceType::all_names().join(", ")],
                        )
                    })?
                    .name()
                    .to_string(),
            ),
            None => None,
        };
        if permission == Permission::RootAccess {
            require_root(call, "granting root").await?;
        }

        let entitlement = Entitlement {
            service,
            permission,
        };
        let label = describe_entitlement(call, &entitlement);
        let key = if self.authz.grant(&user, entitlement).await? {
            tracing::info!(granted_by = %call.ctx.username, user = %user, entitlement = %label, "permission granted");
            "users.granted"
        } else {
            "users.already_granted"
        };
        Ok(Reply::Text(call.tr(key, &[user, label])))
    }
}

pub struct RevokeCommand {
    authz: Arc<AuthorizationEngine>,
}

impl RevokeCommand {
    pub fn new(authz: Arc<AuthorizationEngine>) -> Self {
        Self { authz }
    }
}

#[async_trait]
impl Command for RevokeCommand {
    fn description(&self) -> &'static str {
        "command.revoke.description"
    }

    fn required_permissions(&self) -> &'static [Permission] {
        &[Permission::ManageUsers]
    }

    async fn run(&self, call: &CommandCall<'_>) -> Result<Reply, CommandError> {
        let (user, permission) = match call.args {
            [user] => (user, None),
            [user, permission] => (user, Some(parse_permission(call, permission)?)),
            _ => return Err(usage(call, "usage.revoke", &[])),
        };
        let user = normalize_username(user);
        let table = self.authz.table().await?;
        let target_is_root = table
            .get(&user)
            .is_some_and(|held| held.iter().any(|e| e.permission == Permission::RootAccess));
        if target_is_root {
            require_root(call, "revoking from a root holder").await?;
        }

        let removed = self.authz.revoke(&user, permission).await?;
        if removed == 0 {
            return Ok(Reply::Text(call.tr("users.nothing_revoked", &[user])));
        }
        tracing::info!(revoked_by = %call.ctx.username, user = %user, removed, "permissions revoked");
        Ok(Reply::Text(
            call.tr("users.revoked", &[user, removed.to_string()]),
        ))
    }
}

pub struct UsersCommand {
    authz: Arc<AuthorizationEngine>,
}

impl UsersCommand {
    pub fn new(authz: Arc<AuthorizationEngine>) -> Self {
        Self { authz }
    }
}

#[async_trait]
impl Command for UsersCommand {
    fn description(&self) -> &'static str {
        "command.users.description"
    }

    fn required_permissions(&self) -> &'static [Permission] {
        &[Permission::ManageUsers]
    }

    async fn run(&self, call: &CommandCall<'_>) -> Result<Reply, CommandError> {
        let table = self.authz.table().await?;
        let items: Vec<String> = table
            .iter()
            .filter(|(_, held)| !held.is_empty())
            .map(|(user, held)| {
                let described: Vec<String> =
                    held.iter().map(|e| describe_entitlement(call, e)).collect();
                call.tr("users.item", &[user.clone(), described.join(", ")])
            })
            .collect();
        if items.is_empty() {
            return Ok(Reply::Text(call.tr("users.empty", &[])));
        }
        Ok(Reply::Text(format!(
            "{}{LINE_SEPARATOR}{}",
            call.tr("users.header", &[]),
            bullet_list(items)
        )))
    }
}

#[cfg(test)]
mod tests {
    use crate::authz::Authorizer;
    use crate::commands::testing::Bot;
    use crate::dispatch::DispatchOutcome;
    use fleetbot_contracts::Permission;
    use serde_json::json;

    async fn bot() -> Bot {
        Bot::new(json!({
            "admin": [{"service": null, "permission": "MANAGE_USERS"}],
            "root": [{"service": null, "permission": "ROOT_ACCESS"}]
        }))
        .await
    }

    #[tokio::test]
    async fn grant_adds_scoped_entitlement_once() {
        let bot = bot().await;
        bot.say("admin", "/grant @Carol run_nodes VPN").await;
        assert_eq!(bot.last_reply(), "Granted RUN_NODES (vpn) to carol.");
        assert!(bot
            .authz
            .has_permission_for_service("carol", Permission::RunNodes, "vpn")
            .await);
        assert!(!bot
            .authz
            .has_permission_for_service("carol", Permission::RunNodes, "minecraft")
            .await);

        bot.say("admin", "/grant carol RUN_NODES vpn").await;
        assert_eq!(bot.last_reply(), "carol already holds RUN_NODES (vpn).");
    }

    #[tokio::test]
    async fn grant_rejects_unknown_names() {
        let bot = bot().await;
        let outcome = bot.say("admin", "/grant carol FLY").await;
        assert_eq!(outcome.reason_code(), "invalid_syntax");
        assert_eq!(
            bot.last_reply(),
            "Invalid syntax: Unknown permission FLY. Known: LIST_NODES, RUN_NODES, STOP_NODES, MANAGE_SERVERS, MANAGE_USERS, ROOT_ACCESS"
        );
        bot.say("admin", "/grant carol RUN_NODES ftp").await;
        assert_eq!(
            bot.last_reply(),
            "Invalid syntax: Unknown service ftp. Supported: vpn, minecraft"
        );
        bot.say("admin", "/grant carol").await;
        assert_eq!(
            bot.last_reply(),
            "Invalid syntax: /grant <user> <PERMISSION> [service]"
        );
    }

    #[tokio::test]
    async fn only_root_hands_out_or_removes_root() {
        let bot = bot().await;
        let outcome = bot.say("admin", "/grant carol ROOT_ACCESS").await;
        assert!(matches!(outcome, DispatchOutcome::Unauthorized { .. }));
        let outcome = bot.say("admin", "/revoke root").await;
        assert!(matches!(outcome, DispatchOutcome::Unauthorized { .. }));
        assert!(bot.authz.has_permission("root", Permission::RootAccess).await);

        bot.say("root", "/grant carol ROOT_ACCESS").await;
        assert_eq!(bot.last_reply(), "Granted ROOT_ACCESS (all services) to carol.");
    }

    #[tokio::test]
    async fn root_holders_keep_lesser_entitlements_against_admins() {
        let bot = bot().await;
        bot.say("root", "/grant root LIST_NODES").await;

        let outcome = bot.say("admin", "/revoke root LIST_NODES").await;
        assert!(matches!(outcome, DispatchOutcome::Unauthorized { .. }));
        assert_eq!(bot.last_reply(), "You are not authorized to perform this action.");
        assert_eq!(bot.authz.table().await.unwrap()["root"].len(), 2);

        bot.say("root", "/revoke root LIST_NODES").await;
        assert_eq!(bot.last_reply(), "Removed 1 permission(s) from root.");
    }

    #[tokio::test]
    async fn revoke_and_list_users() {
        let bot = bot().await;
        bot.say("admin", "/grant carol RUN_NODES vpn").await;
        bot.say("admin", "/grant carol LIST_NODES").await;

        bot.say("admin", "/users").await;
        assert_eq!(
            bot.last_reply(),
            "Users:\n• admin: MANAGE_USERS (all services)\n• carol: RUN_NODES (vpn), LIST_NODES (all services)\n• root: ROOT_ACCESS (all services)"
        );

        bot.say("admin", "/revoke carol run_nodes").await;
        assert_eq!(bot.last_reply(), "Removed 1 permission(s) from carol.");
        bot.say("admin", "/revoke carol RUN_NODES").await;
        assert_eq!(bot.last_reply(), "carol holds no matching permissions.");
        bot.say("admin", "/revoke carol").await;
        assert_eq!(bot.last_reply(), "Removed 1 permission(s) from carol.");
        assert!(!bot.authz.has_permission("carol", Permission::ListNodes).await);
    }
}
