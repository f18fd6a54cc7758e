//! Per-table pull checkpoints
//!
//! One timestamp per table marks the boundary of remote changes already
//! applied. Checkpoints live in the settings store so they survive restarts
//! and never move backwards.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::local_db::SettingsStore;
use crate::shared::error::SyncError;
use crate::shared::timestamp::{normalize_timestamp, to_canonical};

const KEY_PREFIX: &str = "sync_checkpoint:";

#[derive(Clone)]
pub struct CheckpointStore {
    settings: Arc<dyn SettingsStore>,
    /// Serializes read-modify-write on advance
    lock: Arc<Mutex<()>>,
}

impl std::fmt::Debug for CheckpointStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CheckpointStore").finish_non_exhaustive()
    }
}

impl CheckpointStore {
    pub fn new(settings: Arc<dyn SettingsStore>) -> Self {
        Self {
            settings,
            lock: Arc::new(Mutex::new(())),
        }
    }

    fn key(table: &str) -> String {
        format!("{}{}", KEY_PREFIX, table)
    }

    /// Current checkpoint of a table
    pub async fn get(&self, table: &str) -> Result<Option<DateTime<Utc>>, SyncError> {
        let raw = self.settings.get_setting(&Self::key(table)).await?;
        Ok(raw.as_deref().and_then(|r| {
            let parsed = normalize_timestamp(r);
            if parsed.is_none() {
                tracing::warn!("[Pull] Ignoring corrupt checkpoint for {}: {}", table, r);
            }
            parsed
        }))
    }

    /// Move a checkpoint forward; returns the stored value
    pub async fn advance(&self, table: &str, to: DateTime<Utc>) -> Result<DateTime<Utc>, SyncError> {
        let _guard = self.lock.lock().await;
        let current = self.get(table).await?;
        let next = current.map_or(to, |c| c.max(to));
        if Some(next) != current {
            self.settings
                .set_setting(&Self::key(table), &to_canonical(&next))
                .await?;
            tracing::debug!("[Pull] Checkpoint for {} advanced to {}", table, to_canonical(&next));
        }
        Ok(next)
    }
}
