//! Durable at-least-once delivery filter.
//!
//! Each processed event leaves an empty marker file named after its id. A
//! marker counts only while younger than the TTL; expired markers are swept
//! on every registration. Registration creates the marker exclusively, so
//! concurrent deliveries of one event yield a single claim.

use std::io::ErrorKind;
use std::path::PathBuf;
use std::time::{Duration, SystemTime};

use fleetbot_kernel::marker_file_name;

pub struct DedupRegistry {
    root: PathBuf,
    ttl: Duration,
}

impl DedupRegistry {
    pub fn new(root: impl Into<PathBuf>, ttl: Duration) -> Self {
        Self {
            root: root.into(),
            ttl,
        }
    }

    pub async fn has_already_processed(&self, event_id: &str) -> bool {
        let marker = self.root.join(marker_file_name(event_id));
        match tokio::fs::metadata(&marker).await {
            Ok(meta) => !self.is_expired(meta.modified().ok(), SystemTime::now()),
            Err(_) => false,
        }
    }

    /// Claims `event_id` for processing. Returns `false` only when a live
    /// marker already exists; filesystem failures are logged and the event is
    /// treated as new.
    pub async fn register_event(&self, event_id: &str) -> bool {
        if let Err(err) = tokio::fs::create_dir_all(&self.root).await {
            tracing::warn!(error = %err, root = %self.root.display(), "dedup root not writable");
            return true;
        }
        self.cleanup_expired().await;
        let marker = self.root.join(marker_file_name(event_id));
        let created = tokio::fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&marker)
            .await;
        match created {
            Ok(_) => true,
            Err(err) if err.kind() == ErrorKind::AlreadyExists => {
                if self.has_already_processed(event_id).await {
                    return false;
                }
                // expired marker the sweep could not remove
                if let Err(err) = tokio::fs::write(&marker, b"").await {
                    tracing::warn!(error = %err, event_id, "dedup marker refresh failed");
                }
                true
            }
            Err(err) => {
                tracing::warn!(error = %err, event_id, "dedup marker write failed");
                true
            }
        }
    }

    async fn cleanup_expired(&self) {
        let mut entries = match tokio::fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) => {
                tracing::warn!(error = %err, "dedup sweep skipped");
                return;
            }
        };
        let now = SystemTime::now();
        loop {
            let entry = match entries.next_entry().await {
                Ok(Some(entry)) => entry,
                Ok(None) => break,
                Err(err) => {
                    tracing::warn!(error = %err, "dedup sweep aborted");
                    break;
                }
            };
            let modified = match entry.metadata().await {
                Ok(meta) if meta.is_file() => meta.modified().ok(),
                _ => continue,
            };
            if self.is_expired(modified, now) {
                if let Err(err) = tokio::fs::remove_file(entry.path()).await {
                    tracing::debug!(error = %err, path = %entry.path().display(), "stale marker not removed");
                }
            }
        }
    }

    fn is_expired(&self, modified: Option<SystemTime>, now: SystemTime) -> bool {
        match modified {
            Some(modified) => now
                .duration_since(modified)
                .map(|age| age >= self.ttl)
                .unwrap_or(false),
            None => true,
        }
    }
}
