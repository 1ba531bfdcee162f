//! Local key-value store
//!
//! One file per key in the agent data directory. The whole tool crib
//! snapshot lives under a single key, next to the sync bookkeeping.

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::PathBuf;
use toolcrib_core::{SnapshotBackend, StoreError};

/// Key holding the serialized snapshot
pub const SNAPSHOT_KEY: &str = "tool_management_db";
pub const SYNC_STATE_KEY: &str = "sync_state";

#[derive(Debug, Clone)]
pub struct KvStore {
    dir: PathBuf,
}

impl KvStore {
    pub fn open(dir: impl Into<PathBuf>) -> std::io::Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    fn key_path(&self, key: &str) -> PathBuf {
        let safe: String = key
            .chars()
            .map(|c| if c.is_ascii_alphanumeric() || c == '_' || c == '-' { c } else { '_' })
            .collect();
        self.dir.join(format!("{safe}.json"))
    }

    pub fn get(&self, key: &str) -> std::io::Result<Option<String>> {
        let path = self.key_path(key);
        if !path.exists() {
            return Ok(None);
        }
        fs::read_to_string(path).map(Some)
    }

    pub fn set(&self, key: &str, value: &str) -> std::io::Result<()> {
        let path = self.key_path(key);
        let tmp = path.with_extension("json.tmp");
        fs::write(&tmp, value)?;
        fs::rename(tmp, path)
    }

    pub fn remove(&self, key: &str) -> std::io::Result<bool> {
        let path = self.key_path(key);
        if path.exists() {
            fs::remove_file(path)?;
            Ok(true)
        } else {
            Ok(false)
        }
    }

    /// Drops the local copy and the sync bookkeeping; the next pull starts over
    pub fn forget_local_copy(&self) -> std::io::Result<bool> {
        let snapshot = self.remove(SNAPSHOT_KEY)?;
        let state = self.remove(SYNC_STATE_KEY)?;
        Ok(snapshot || state)
    }

    /// Snapshot backend bound to one key
    pub fn snapshot_backend(&self, key: &str) -> KvSnapshotBackend {
        KvSnapshotBackend {
            kv: self.clone(),
            key: key.to_string(),
        }
    }
}

pub struct KvSnapshotBackend {
    kv: KvStore,
    key: String,
}

impl SnapshotBackend for KvSnapshotBackend {
    fn read_blob(&self) -> Result<Option<String>, StoreError> {
        Ok(self.kv.get(&self.key)?)
    }

    fn write_blob(&self, blob: &str) -> Result<(), StoreError> {
        Ok(self.kv.set(&self.key, blob)?)
    }

    fn describe(&self) -> String {
        format!("kv:{}/{}", self.kv.dir.display(), self.key)
    }
}

/// What the agent knows about its last exchange with the server
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncState {
    /// Server revision the local snapshot is based on
    pub base_revision: Option<u64>,
    /// Local changes not yet accepted by the server
    pub dirty: bool,
    pub last_pull: Option<DateTime<Utc>>,
    pub last_push: Option<DateTime<Utc>>,
}

impl SyncState {
    /// Missing or unreadable state = never synced
    pub fn load(kv: &KvStore) -> Self {
        match kv.get(SYNC_STATE_KEY) {
            Ok(Some(txt)) => serde_json::from_str(&txt).unwrap_or_else(|e| {
                tracing::warn!("[sync] unreadable sync state, starting over: {}", e);
                Self::default()
            }),
            Ok(None) => Self::default(),
            Err(e) => {
                tracing::warn!("[sync] cannot read sync state: {}", e);
                Self::default()
            }
        }
    }

    pub fn save(&self, kv: &KvStore) -> Result<()> {
        kv.set(SYNC_STATE_KEY, &serde_json::to_string_pretty(self)?)?;
        Ok(())
    }
}
