use std::sync::Arc;

use async_trait::async_trait;
use fleetbot_contracts::{ServiceType, TaskRuntimeParameters};

use crate::cache::MemoCache;
use crate::store::{get_json, BlobStore, StoreError};

/// Slow source of per-(region, service) runtime parameters.
#[async_trait]
pub trait RuntimeParameterSource: Send + Sync {
    async fn load(
        &self,
        region: &str,
        service: ServiceType,
    ) -> Result<Option<TaskRuntimeParameters>, StoreError>;
}

/// Reads one JSON blob per (region, service) at a key template containing
/// `{region}` and `{service}`.
pub struct BlobParameterSource {
    store: Arc<dyn BlobStore>,
    key_template: String,
}

impl BlobParameterSource {
    pub fn new(store: Arc<dyn BlobStore>, key_template: &str) -> Self {
        Self {
            store,
            key_template: key_template.to_string(),
        }
    }

    pub fn key_for(&self, region: &str, service: ServiceType) -> String {
        self.key_template
            .replace("{region}", region)
            .replace("{service}", service.name())
    }
}

#[async_trait]
impl RuntimeParameterSource for BlobParameterSource {
    async fn load(
        &self,
        region: &str,
        service: ServiceType,
    ) -> Result<Option<TaskRuntimeParameters>, StoreError> {
        get_json(self.store.as_ref(), &self.key_for(region, service)).await
    }
}

/// Memoizes lookups, including negative ones; `bypass_cache` forces a reload.
pub struct TaskConfigCache {
    source: Arc<dyn RuntimeParameterSource>,
    entries: MemoCache<(String, ServiceType), Option<TaskRuntimeParameters>>,
}

impl TaskConfigCache {
    pub fn new(source: Arc<dyn RuntimeParameterSource>) -> Self {
        Self {
            source,
            entries: MemoCache::new(),
        }
    }

    pub async fn get(
        &self,
        region: &str,
        service: ServiceType,
        bypass_cache: bool,
    ) -> Result<Option<TaskRuntimeParameters>, StoreError> {
        let key = (region.to_string(), service);
        let load = || self.source.load(region, service);
        if bypass_cache {
            self.entries.refresh(&key, load).await
        } else {
            self.entries.get_or_load(&key, load).await
        }
    }
}
