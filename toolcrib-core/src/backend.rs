//! Blob persistence behind the store
//!
//! The store serializes the whole snapshot into one JSON blob; a backend
//! only knows how to read and write that blob.

use crate::store::StoreError;
use parking_lot::Mutex;
use std::fs;
use std::path::{Path, PathBuf};

pub trait SnapshotBackend: Send + Sync {
    /// `Ok(None)` when nothing was ever written
    fn read_blob(&self) -> Result<Option<String>, StoreError>;
    fn write_blob(&self, blob: &str) -> Result<(), StoreError>;
    fn describe(&self) -> String;
}

/// Single JSON file, replaced atomically through a sibling temp file
pub struct JsonFileBackend {
    path: PathBuf,
}

impl JsonFileBackend {
    pub fn new<P: Into<PathBuf>>(path: P) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl SnapshotBackend for JsonFileBackend {
    fn read_blob(&self) -> Result<Option<String>, StoreError> {
        if !self.path.exists() {
            return Ok(None);
        }
        Ok(Some(fs::read_to_string(&self.path)?))
    }

    fn write_blob(&self, blob: &str) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, blob)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// In-memory blob, for tests and throwaway stores
#[derive(Default)]
pub struct MemoryBackend {
    blob: Mutex<Option<String>>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_blob(blob: impl Into<String>) -> Self {
        Self {
            blob: Mutex::new(Some(blob.into())),
        }
    }

    pub fn blob(&self) -> Option<String> {
        self.blob.lock().clone()
    }
}

impl SnapshotBackend for MemoryBackend {
    fn read_blob(&self) -> Result<Option<String>, StoreError> {
        Ok(self.blob.lock().clone())
    }

    fn write_blob(&self, blob: &str) -> Result<(), StoreError> {
        *self.blob.lock() = Some(blob.to_string());
        Ok(())
    }

    fn describe(&self) -> String {
        "memory".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_json_file_roundtrip_creates_parent() {
        let dir = TempDir::new().unwrap();
        let backend = JsonFileBackend::new(dir.path().join("nested").join("crib.json"));
        assert!(backend.read_blob().unwrap().is_none());

        backend.write_blob(r#"{"revision":3}"#).unwrap();
        assert_eq!(backend.read_blob().unwrap().as_deref(), Some(r#"{"revision":3}"#));
        assert!(!backend.path().with_extension("json.tmp").exists());
    }
}
