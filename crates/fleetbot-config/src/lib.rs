use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("read config failed: {0}")]
    Read(String),
    #[error("parse config failed: {0}")]
    Parse(String),
    #[error("schema load failed: {0}")]
    SchemaLoad(String),
    #[error("schema validation failed: {0}")]
    SchemaValidation(String),
    #[error("unsupported config: {0}")]
    UnsupportedConfig(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub server: Server,
    pub bot: Bot,
    pub store: Store,
    pub dedup: Dedup,
    pub authz: Authz,
    pub regions: Vec<RegionEntry>,
    #[serde(default)]
    pub nodes: Nodes,
    #[serde(default)]
    pub instances: Instances,
    pub compute: Compute,
    #[serde(default)]
    pub messages: Messages,
    pub audit: Audit,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Server {
    pub listen_addr: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bot {
    pub token: String,
    #[serde(default = "default_bot_api_base_url")]
    pub api_base_url: String,
    #[serde(default)]
    pub webhook_secret: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Store {
    #[serde(rename = "type")]
    pub kind: String,
    pub sqlite_path: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dedup {
    pub root_path: String,
    pub ttl_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Authz {
    pub enabled: bool,
    #[serde(default = "default_permissions_key")]
    pub permissions_key: String,
    #[serde(default)]
    pub bootstrap_admins: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RegionEntry {
    pub id: String,
    pub city: String,
    pub label: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nodes {
    #[serde(default = "default_task_parameters_key")]
    pub task_parameters_key: String,
    #[serde(default = "default_poll_ms")]
    pub health_poll_interval_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub health_timeout_ms: u64,
    #[serde(default = "default_hostname_max_attempts")]
    pub hostname_max_attempts: u32,
}

impl Default for Nodes {
    fn default() -> Self {
        Self {
            task_parameters_key: default_task_parameters_key(),
            health_poll_interval_ms: default_poll_ms(),
            health_timeout_ms: default_timeout_ms(),
            hostname_max_attempts: default_hostname_max_attempts(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Instances {
    #[serde(default)]
    pub regions: Vec<String>,
    #[serde(default = "default_poll_ms")]
    pub poll_delay_ms: u64,
    #[serde(default = "default_timeout_ms")]
    pub operation_timeout_ms: u64,
}

impl Default for Instances {
    fn default() -> Self {
        Self {
            regions: Vec::new(),
            poll_delay_ms: default_poll_ms(),
            operation_timeout_ms: default_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Compute {
    pub endpoint: String,
    #[serde(default)]
    pub api_token: Option<String>,
    #[serde(default = "default_compute_timeout_ms")]
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Messages {
    #[serde(default = "default_language")]
    pub default_language: String,
    #[serde(default)]
    pub catalog_path: Option<String>,
}

impl Default for Messages {
    fn default() -> Self {
        Self {
            default_language: default_language(),
            catalog_path: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Audit {
    pub jsonl_path: String,
    #[serde(default)]
    pub immutable_mirror_path: Option<String>,
}

fn default_bot_api_base_url() -> String {
    "https://api.telegram.org".to_string()
}

fn default_permissions_key() -> String {
    "permissions.json".to_string()
}

fn default_task_parameters_key() -> String {
    "runtime/{region}/{service}".to_string()
}

fn default_poll_ms() -> u64 {
    5_000
}

fn default_timeout_ms() -> u64 {
    60_000
}

fn default_hostname_max_attempts() -> u32 {
    100
}

fn default_compute_timeout_ms() -> u64 {
    10_000
}

fn default_language() -> String {
    "en".to_string()
}

pub fn load_and_validate(path: &str) -> Result<Config, ConfigError> {
    let config_text =
        std::fs::read_to_string(path).map_err(|e| ConfigError::Read(e.to_string()))?;
    let value: serde_yaml::Value =
        serde_yaml::from_str(&config_text).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let instance = serde_json::to_value(value).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_against_schema(&instance)?;

    let cfg: Config =
        serde_json::from_value(instance).map_err(|e| ConfigError::Parse(e.to_string()))?;
    validate_runtime_support(&cfg)?;
    Ok(cfg)
}

fn validate_against_schema(instance: &serde_json::Value) -> Result<(), ConfigError> {
    let schema_path = [
        std::path::PathBuf::from("config/config.schema.json"),
        std::path::Path::new(env!("CARGO_MANIFEST_DIR"))
            .join("../..")
            .join("config/config.schema.json"),
    ]
    .into_iter()
    .find(|p| p.exists())
    .ok_or_else(|| {
        ConfigError::SchemaLoad(
            "config schema not found at config/config.schema.json or workspace config path"
                .to_string(),
        )
    })?;

    let schema_text =
        std::fs::read_to_string(schema_path).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    let schema: serde_json::Value =
        serde_json::from_str(&schema_text).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;

    let validator =
        jsonschema::validator_for(&schema).map_err(|e| ConfigError::SchemaLoad(e.to_string()))?;
    if let Err(first) = validator.validate(instance) {
        return Err(ConfigError::SchemaValidation(first.to_string()));
    }
    Ok(())
}

pub fn validate_runtime_support(cfg: &Config) -> Result<(), ConfigError> {
    if cfg.store.kind != "memory" && cfg.store.kind != "sqlite" {
        return Err(ConfigError::UnsupportedConfig(format!(
            "store.type={} is not implemented; supported: memory, sqlite",
            cfg.store.kind
        )));
    }
    if cfg.store.kind == "memory" && cfg.store.sqlite_path.is_some() {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is not supported when store.type=memory".to_string(),
        ));
    }
    if cfg.store.kind == "sqlite"
        && cfg
            .store
            .sqlite_path
            .as_ref()
            .map(|v| v.trim().is_empty())
            .unwrap_or(true)
    {
        return Err(ConfigError::UnsupportedConfig(
            "store.sqlite_path is required when store.type=sqlite".to_string(),
        ));
    }
    if cfg.bot.token.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "bot.token must be non-empty".to_string(),
        ));
    }
    if cfg.dedup.ttl_seconds == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "dedup.ttl_seconds must be >= 1".to_string(),
        ));
    }
    if cfg.dedup.root_path.trim().is_empty() {
        return Err(ConfigError::UnsupportedConfig(
            "dedup.root_path must be non-empty".to_string(),
        ));
    }

    let mut ids = HashSet::new();
    let mut cities = HashSet::new();
    for region in &cfg.regions {
        if region.id.trim().is_empty() || region.city.trim().is_empty() {
            return Err(ConfigError::UnsupportedConfig(
                "regions[].id and regions[].city must be non-empty".to_string(),
            ));
        }
        if !ids.insert(region.id.to_ascii_lowercase()) {
            return Err(ConfigError::UnsupportedConfig(format!(
                "duplicate region id {}",
                region.id
            )));
        }
        if !cities.insert(region.city.to_ascii_lowercase()) {
            return Err(ConfigError::UnsupportedConfig(format!(
                "duplicate region city {}",
                region.city
            )));
        }
    }

    let key = &cfg.nodes.task_parameters_key;
    if !key.contains("{region}") || !key.contains("{service}") {
        return Err(ConfigError::UnsupportedConfig(
            "nodes.task_parameters_key must contain {region} and {service}".to_string(),
        ));
    }
    if cfg.nodes.health_poll_interval_ms == 0 || cfg.nodes.health_timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "nodes.health_poll_interval_ms and nodes.health_timeout_ms must be >= 1".to_string(),
        ));
    }
    if cfg.nodes.hostname_max_attempts == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "nodes.hostname_max_attempts must be >= 1".to_string(),
        ));
    }
    if cfg.instances.poll_delay_ms == 0 || cfg.instances.operation_timeout_ms == 0 {
        return Err(ConfigError::UnsupportedConfig(
            "instances.poll_delay_ms and instances.operation_timeout_ms must be >= 1".to_string(),
        ));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{SystemTime, UNIX_EPOCH};

    fn write_temp_config(contents: &str) -> String {
        let nanos = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .expect("system time before unix epoch")
            .as_nanos();
        let path = std::env::temp_dir().join(format!("fleetbot-config-test-{nanos}.yaml"));
        std::fs::write(&path, contents).expect("write temp config");
        path.to_string_lossy().to_string()
    }

    fn base_yaml() -> String {
        r#"
server:
  listen_addr: "127.0.0.1:0"

bot:
  token: "123:abc"

store:
  type: "memory"

dedup:
  root_path: "/tmp/fleetbot-dedup"
  ttl_seconds: 600

authz:
  enabled: true

regions:
  - id: "eu-central-1"
    city: "frankfurt"
    label: "Frankfurt, Germany"
  - id: "us-east-1"
    city: "virginia"
    label: "Virginia, USA"

instances:
  regions: ["eu-central-1"]

compute:
  endpoint: "http://127.0.0.1:9000"

audit:
  jsonl_path: "./fleetbot-audit.jsonl"
"#
        .to_string()
    }

    #[test]
    fn base_config_fills_defaults() {
        let path = write_temp_config(&base_yaml());
        let cfg = load_and_validate(&path).expect("base config should be accepted");
        assert_eq!(cfg.bot.api_base_url, "https://api.telegram.org");
        assert_eq!(cfg.authz.permissions_key, "permissions.json");
        assert_eq!(cfg.nodes.task_parameters_key, "runtime/{region}/{service}");
        assert_eq!(cfg.nodes.hostname_max_attempts, 100);
        assert_eq!(cfg.instances.operation_timeout_ms, 60_000);
        assert_eq!(cfg.messages.default_language, "en");
        assert_eq!(cfg.regions.len(), 2);
    }

    #[test]
    fn supports_sqlite_store_type_with_path() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"sqlite\"\n  sqlite_path: \"./a.db\"",
        ));
        let cfg = load_and_validate(&path).expect("sqlite config should be accepted");
        assert_eq!(cfg.store.kind, "sqlite");
        assert_eq!(cfg.store.sqlite_path.as_deref(), Some("./a.db"));
    }

    #[test]
    fn rejects_sqlite_path_even_when_memory() {
        let path = write_temp_config(&base_yaml().replace(
            "type: \"memory\"",
            "type: \"memory\"\n  sqlite_path: \"./a.db\"",
        ));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_zero_dedup_ttl() {
        let path = write_temp_config(&base_yaml().replace("ttl_seconds: 600", "ttl_seconds: 0"));
        let err = load_and_validate(&path).expect_err("expected unsupported config");
        assert!(matches!(
            err,
            ConfigError::SchemaValidation(_) | ConfigError::UnsupportedConfig(_)
        ));
    }

    #[test]
    fn rejects_duplicate_region_city() {
        let path = write_temp_config(
            &base_yaml().replace("city: \"virginia\"", "city: \"Frankfurt\""),
        );
        let err = load_and_validate(&path).expect_err("expected duplicate city rejection");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn rejects_parameter_key_without_placeholders() {
        let path = write_temp_config(&format!(
            "{}\nnodes:\n  task_parameters_key: \"runtime/static\"\n",
            base_yaml()
        ));
        let err = load_and_validate(&path).expect_err("expected key template rejection");
        assert!(matches!(err, ConfigError::UnsupportedConfig(_)));
    }

    #[test]
    fn missing_file_is_a_read_error() {
        let err = load_and_validate("/nonexistent/fleetbot.yaml").expect_err("missing file");
        assert!(matches!(err, ConfigError::Read(_)));
    }
}
