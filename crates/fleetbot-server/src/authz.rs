//! Permission checks over the entitlement table kept in the blob store.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use async_trait::async_trait;
use fleetbot_contracts::{Entitlement, Permission, PermissionTable, ServiceType};
use fleetbot_kernel::{allowed_services, entitlements_grant, normalize_username};
use serde_json::Value;
use tokio::sync::Mutex;

use crate::cache::MemoCache;
use crate::store::{get_json, put_json, BlobStore, StoreError};

#[async_trait]
pub trait Authorizer: Send + Sync {
    async fn has_permission(&self, username: &str, permission: Permission) -> bool;
    async fn has_permission_for_service(
        &self,
        username: &str,
        permission: Permission,
        service: &str,
    ) -> bool;
    async fn get_allowed_services(&self, username: &str, permission: Permission)
        -> BTreeSet<String>;
}

pub struct AuthorizationEngine {
    enabled: bool,
    store: Arc<dyn BlobStore>,
    key: String,
    table: MemoCache<String, Arc<PermissionTable>>,
    write_lock: Mutex<()>,
}

impl AuthorizationEngine {
    pub fn new(enabled: bool, store: Arc<dyn BlobStore>, permissions_key: &str) -> Self {
        Self {
            enabled,
            store,
            key: permissions_key.to_string(),
            table: MemoCache::new(),
            write_lock: Mutex::new(()),
        }
    }

    pub async fn table(&self) -> Result<Arc<PermissionTable>, StoreError> {
        self.table
            .get_or_load(&self.key, || async {
                Ok::<_, StoreError>(Arc::new(self.load_table().await?))
            })
            .await
    }

    /// Entries that no longer name a known permission are skipped one by one so
    /// the rest of the table stays usable.
    async fn load_table(&self) -> Result<PermissionTable, StoreError> {
        let raw: Option<BTreeMap<String, Vec<Value>>> =
            get_json(self.store.as_ref(), &self.key).await?;
        let mut table = PermissionTable::new();
        for (username, entries) in raw.unwrap_or_default() {
            let held: Vec<Entitlement> = entries
                .into_iter()
                .filter_map(|entry| match serde_json::from_value::<Entitlement>(entry.clone()) {
                    Ok(entitlement) => Some(entitlement),
                    Err(err) => {
                        tracing::warn!(username = %username, entry = %entry, error = %err, "skipping unrecognized entitlement");
                        None
                    }
                })
                .collect();
            table.insert(username, held);
        }
        Ok(table)
    }

    /// Store failures deny: a caller whose entitlements cannot be read holds none.
    async fn entitlements_of(&self, username: &str) -> Vec<Entitlement> {
        match self.table().await {
            Ok(table) => table
                .get(&normalize_username(username))
                .cloned()
                .unwrap_or_default(),
            Err(err) => {
                tracing::error!(error = %err, username, "permission table unavailable");
                Vec::new()
            }
        }
    }

    /// Returns `false` when the user already held the exact entitlement.
    pub async fn grant(&self, username: &str, entitlement: Entitlement) -> Result<bool, StoreError> {
        let username = normalize_username(username);
        let entitlement = Entitlement {
            service: entitlement.service.map(|s| s.to_ascii_lowercase()),
            permission: entitlement.permission,
        };
        self.mutate(|table| {
            let held = table.entry(username.clone()).or_default();
            if held.contains(&entitlement) {
                return false;
            }
            held.push(entitlement.clone());
            true
        })
        .await
    }

    /// Removes every entitlement with `permission`, or all of them when `None`.
    /// Returns how many were removed.
    pub async fn revoke(
        &self,
        username: &str,
        permission: Option<Permission>,
    ) -> Result<usize, StoreError> {
        let username = normalize_username(username);
        self.mutate(|table| {
            let Some(held) = table.get_mut(&username) else {
                return 0;
            };
            let before = held.len();
            held.retain(|e| permission.is_some_and(|p| e.permission != p));
            let removed = before - held.len();
            if held.is_empty() {
                table.remove(&username);
            }
            removed
        })
        .await
    }

    /// Seeds `ROOT_ACCESS` for admins that hold nothing yet.
    pub async fn bootstrap_admins(&self, admins: &[String]) -> Result<(), StoreError> {
        if admins.is_empty() {
            return Ok(());
        }
        let seeded = self
            .mutate(|table| {
                let mut seeded = Vec::new();
                for admin in admins.iter().map(|a| normalize_username(a)) {
                    if admin.is_empty() || table.get(&admin).is_some_and(|e| !e.is_empty()) {
                        continue;
                    }
                    table.insert(admin.clone(), vec![Entitlement::global(Permission::RootAccess)]);
                    seeded.push(admin);
                }
                seeded
            })
            .await?;
        if !seeded.is_empty() {
            tracing::info!(admins = ?seeded, "bootstrap administrators granted root access");
        }
        Ok(())
    }

    /// Read-modify-write against the store, bypassing the cache, then invalidate.
    async fn mutate<R, F>(&self, apply: F) -> Result<R, StoreError>
    where
        F: FnOnce(&mut PermissionTable) -> R,
    {
        let _guard = self.write_lock.lock().await;
        let mut table = self.load_table().await?;
        let result = apply(&mut table);
        put_json(self.store.as_ref(), &self.key, &table).await?;
        self.table.invalidate(&self.key).await;
        Ok(result)
    }
}

#[async_trait]
impl Authorizer for AuthorizationEngine {
    async fn has_permission(&self, username: &str, permission: Permission) -> bool {
        if !self.enabled {
            return true;
        }
        entitlements_grant(&self.entitlements_of(username).await, permission, None)
    }

    async fn has_permission_for_service(
        &self,
        username: &str,
        permission: Permission,
        service: &str,
    ) -> bool {
        if !self.enabled {
            return true;
        }
        entitlements_grant(
            &self.entitlements_of(username).await,
            permission,
            Some(service),
        )
    }

    async fn get_allowed_services(
        &self,
        username: &str,
        permission: Permission,
    ) -> BTreeSet<String> {
        let known = ServiceType::all_names();
        if !self.enabled {
            return known.iter().map(|s| s.to_string()).collect();
        }
        allowed_services(&self.entitlements_of(username).await, permission, &known)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryBlobStore;
    use serde_json::json;

    async fn engine_with(table: serde_json::Value) -> (AuthorizationEngine, Arc<dyn BlobStore>) {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::default());
        put_json(store.as_ref(), "permissions.json", &table)
            .await
            .unwrap();
        (
            AuthorizationEngine::new(true, store.clone(), "permissions.json"),
            store,
        )
    }

    #[tokio::test]
    async fn scoped_and_global_checks() {
        let (engine, _) = engine_with(json!({
            "alice": [{"service": "vpn", "permission": "RUN_NODES"}],
            "bob": [{"service": null, "permission": "LIST_NODES"}]
        }))
        .await;

        assert!(engine.has_permission("alice", Permission::RunNodes).await);
        assert!(engine.has_permission_for_service("alice", Permission::RunNodes, "vpn").await);
        assert!(
            !engine
                .has_permission_for_service("alice", Permission::RunNodes, "minecraft")
                .await
        );
        assert!(
            engine
                .has_permission_for_service("bob", Permission::ListNodes, "minecraft")
                .await
        );
        assert!(!engine.has_permission("carol", Permission::ListNodes).await);
        assert!(engine
            .get_allowed_services("carol", Permission::ListNodes)
            .await
            .is_empty());
    }

    #[tokio::test]
    async fn root_on_any_service_passes_everything() {
        let (engine, _) = engine_with(json!({
            "root": [{"service": "minecraft", "permission": "ROOT_ACCESS"}]
        }))
        .await;
        for permission in Permission::ALL {
            assert!(engine.has_permission("root", permission).await);
            assert!(engine.has_permission_for_service("root", permission, "vpn").await);
        }
        assert_eq!(
            engine.get_allowed_services("root", Permission::StopNodes).await,
            BTreeSet::from(["minecraft".to_string(), "vpn".to_string()])
        );
    }

    #[tokio::test]
    async fn disabled_engine_allows_everything() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::default());
        let engine = AuthorizationEngine::new(false, store, "permissions.json");
        assert!(engine.has_permission("anyone", Permission::ManageUsers).await);
        assert_eq!(
            engine.get_allowed_services("anyone", Permission::RunNodes).await.len(),
            ServiceType::ALL.len()
        );
    }

    #[tokio::test]
    async fn writes_invalidate_the_cache() {
        let (engine, store) = engine_with(json!({})).await;
        assert!(!engine.has_permission("dave", Permission::StopNodes).await);

        assert!(engine
            .grant("@Dave", Entitlement::scoped("VPN", Permission::StopNodes))
            .await
            .unwrap());
        assert!(!engine
            .grant("dave", Entitlement::scoped("vpn", Permission::StopNodes))
            .await
            .unwrap());
        assert!(engine.has_permission_for_service("dave", Permission::StopNodes, "vpn").await);

        let persisted: PermissionTable = get_json(store.as_ref(), "permissions.json")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted["dave"], vec![Entitlement::scoped("vpn", Permission::StopNodes)]);

        assert_eq!(engine.revoke("dave", Some(Permission::RunNodes)).await.unwrap(), 0);
        assert_eq!(engine.revoke("dave", None).await.unwrap(), 1);
        assert!(!engine.has_permission("dave", Permission::StopNodes).await);
        assert!(!engine.table().await.unwrap().contains_key("dave"));
    }

    #[tokio::test]
    async fn bootstrap_only_seeds_empty_admins() {
        let (engine, _) = engine_with(json!({
            "erin": [{"service": "vpn", "permission": "LIST_NODES"}]
        }))
        .await;
        engine
            .bootstrap_admins(&["erin".to_string(), "Frank".to_string()])
            .await
            .unwrap();
        let table = engine.table().await.unwrap();
        assert_eq!(table["frank"], vec![Entitlement::global(Permission::RootAccess)]);
        assert!(!engine.has_permission("erin", Permission::RootAccess).await);
    }

    #[tokio::test]
    async fn unreadable_table_denies() {
        let store: Arc<dyn BlobStore> = Arc::new(MemoryBlobStore::default());
        store
            .put("permissions.json", b"not json".to_vec())
            .await
            .unwrap();
        let engine = AuthorizationEngine::new(true, store, "permissions.json");
        assert!(!engine.has_permission("alice", Permission::ListNodes).await);
    }

    #[tokio::test]
    async fn unknown_permission_entries_are_skipped() {
        let (engine, store) = engine_with(json!({
            "root": [{"service": null, "permission": "ROOT_ACCESS"}],
            "legacy": [
                {"permission": "ADMIN"},
                {"service": "vpn", "permission": "LIST_NODES"}
            ]
        }))
        .await;
        assert!(engine.has_permission("root", Permission::ManageUsers).await);
        assert!(engine.has_permission_for_service("legacy", Permission::ListNodes, "vpn").await);
        assert!(!engine.has_permission("legacy", Permission::RunNodes).await);

        engine.bootstrap_admins(&["gina".to_string()]).await.unwrap();
        assert!(engine.has_permission("gina", Permission::RootAccess).await);
        let persisted: PermissionTable = get_json(store.as_ref(), "permissions.json")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(persisted["legacy"], vec![Entitlement::scoped("vpn", Permission::ListNodes)]);
    }
}
