use std::sync::Arc;

use chrono::Utc;
use fleetbot_kernel::jcs_sha256_hex;
use serde::{Deserialize, Serialize};
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;

/// Hash-chained JSONL log of invocation outcomes.
pub struct AuditJsonl {
    file: Arc<Mutex<tokio::fs::File>>,
    immutable_mirror: Option<Arc<Mutex<tokio::fs::File>>>,
    last_hash: Arc<Mutex<Option<String>>>,
}

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
pub struct AuditRecord {
    pub audit_id: String,
    pub event_id: String,
    pub chat_id: i64,
    pub username: String,
    pub command: String,
    pub result: String,
    pub reason_code: String,
    pub ts: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub prev_hash: Option<String>,
    pub record_hash: String,
}

impl AuditRecord {
    pub fn new(
        event_id: &str,
        chat_id: i64,
        username: &str,
        command: &str,
        result: &str,
        reason_code: &str,
    ) -> Self {
        Self {
            audit_id: format!("audit_{}", uuid::Uuid::new_v4().as_simple()),
            event_id: event_id.to_string(),
            chat_id,
            username: username.to_string(),
            command: command.to_string(),
            result: result.to_string(),
            reason_code: reason_code.to_string(),
            ts: Utc::now().to_rfc3339(),
            prev_hash: None,
            record_hash: String::new(),
        }
    }

    fn seal_hash(&self) -> Result<String, String> {
        let mut seeded = self.clone();
        seeded.record_hash.clear();
        let value = serde_json::to_value(&seeded).map_err(|e| e.to_string())?;
        jcs_sha256_hex(&value)
    }
}

impl AuditJsonl {
    pub async fn new(path: &str, immutable_mirror_path: Option<&str>) -> Result<Self, String> {
        let last_hash = std::fs::read_to_string(path).ok().and_then(|text| {
            text.lines().rev().find_map(|line| {
                serde_json::from_str::<serde_json::Value>(line)
                    .ok()
                    .and_then(|v| {
                        v.get("record_hash")
                            .and_then(|hash| hash.as_str())
                            .map(|s| s.to_string())
                    })
            })
        });

        let file = open_append(path).await?;
        let immutable_mirror = match immutable_mirror_path {
            Some(path) if !path.is_empty() => Some(Arc::new(Mutex::new(open_append(path).await?))),
            _ => None,
        };

        Ok(Self {
            file: Arc::new(Mutex::new(file)),
            immutable_mirror,
            last_hash: Arc::new(Mutex::new(last_hash)),
        })
    }

    /// Write failures are logged and swallowed; auditing never fails a request.
    pub async fn append(&self, mut rec: AuditRecord) {
        // Holding the file lock across hashing keeps prev_hash ordering consistent.
        let mut file = self.file.lock().await;
        rec.prev_hash = self.last_hash.lock().await.clone();
        rec.record_hash = match rec.seal_hash() {
            Ok(hash) => hash,
            Err(err) => {
                tracing::error!(error = %err, event_id = %rec.event_id, "audit hash failed");
                return;
            }
        };
        let line = match serde_json::to_string(&rec) {
            Ok(line) => line,
            Err(err) => {
                tracing::error!(error = %err, "audit serialize failed");
                return;
            }
        };

        if let Err(err) = write_line(&mut file, &line).await {
            tracing::error!(error = %err, "audit append failed");
            return;
        }
        if let Some(mirror) = &self.immutable_mirror {
            let mut mirror_file = mirror.lock().await;
            if let Err(err) = write_line(&mut mirror_file, &line).await {
                tracing::warn!(error = %err, "audit mirror append failed");
            }
        }
        *self.last_hash.lock().await = Some(rec.record_hash);
    }
}

async fn open_append(path: &str) -> Result<tokio::fs::File, String> {
    if let Some(parent) = std::path::Path::new(path).parent() {
        if !parent.as_os_str().is_empty() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| format!("create audit dir failed: {e}"))?;
        }
    }
    tokio::fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .await
        .map_err(|e| format!("open audit log {path} failed: {e}"))
}

async fn write_line(file: &mut tokio::fs::File, line: &str) -> std::io::Result<()> {
    file.write_all(line.as_bytes()).await?;
    file.write_all(b"\n").await?;
    file.flush().await
}

pub fn verify_audit_chain(path: &str) -> Result<String, String> {
    let text = std::fs::read_to_string(path).map_err(|e| e.to_string())?;
    let mut prev: Option<String> = None;
    let mut count = 0usize;

    for (idx, line) in text.lines().enumerate() {
        if line.trim().is_empty() {
            continue;
        }
        let rec: AuditRecord = serde_json::from_str(line)
            .map_err(|e| format!("line {} parse failed: {e}", idx + 1))?;
        if count > 0 && rec.prev_hash != prev {
            return Err(format!(
                "line {} prev_hash mismatch: expected {:?}, got {:?}",
                idx + 1,
                prev,
                rec.prev_hash
            ));
        }
        let expected_hash = rec
            .seal_hash()
            .map_err(|e| format!("line {} hash seed failed: {e}", idx + 1))?;
        if rec.record_hash != expected_hash {
            return Err(format!(
                "line {} record_hash mismatch: expected {}, got {}",
                idx + 1,
                expected_hash,
                rec.record_hash
            ));
        }
        prev = Some(rec.record_hash);
        count += 1;
    }

    Ok(format!("audit chain verified: {count} records"))
}
