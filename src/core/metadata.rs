//! Knowledge-base metadata sidecars.
//!
//! Each KB keeps an `info.json` next to its uploads at
//! `<upload_root>/kb_<id>/info.json`, updated in lockstep with the catalog
//! counts on every stats refresh. The sidecar makes a KB directory
//! self-describing when moved between deployments.

use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum MetadataError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serde(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MetadataError>;

/// Contents of a KB's `info.json`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct KbMetadata {
    pub kb_id: i64,
    pub name: String,
    pub description: Option<String>,
    pub embedding_model: String,
    pub embedding_provider: String,
    pub created_at: String,
    pub updated_at: String,
    pub total_files: i64,
    pub total_chunks: i64,
    pub version: String,
}

/// Manages `info.json` sidecars under the upload root.
#[derive(Clone)]
pub struct MetadataStore {
    upload_root: PathBuf,
}

impl MetadataStore {
    pub fn new(upload_root: PathBuf) -> Self {
        Self { upload_root }
    }

    fn info_path(&self, kb_id: i64) -> PathBuf {
        self.upload_root
            .join(format!("kb_{}", kb_id))
            .join("info.json")
    }

    /// Create the sidecar for a freshly created KB with zeroed counts.
    pub fn create(
        &self,
        kb_id: i64,
        name: &str,
        description: Option<&str>,
        embedding_model: &str,
        embedding_provider: &str,
        created_at: &str,
    ) -> Result<()> {
        let metadata = KbMetadata {
            kb_id,
            name: name.to_string(),
            description: description.map(str::to_string),
            embedding_model: embedding_model.to_string(),
            embedding_provider: embedding_provider.to_string(),
            created_at: created_at.to_string(),
            updated_at: chrono::Utc::now().to_rfc3339(),
            total_files: 0,
            total_chunks: 0,
            version: "1.0".to_string(),
        };

        let path = self.info_path(kb_id);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, serde_json::to_string_pretty(&metadata)?)?;

        tracing::debug!(kb_id, "metadata sidecar created");
        Ok(())
    }

    /// Refresh the counts (and timestamp) after a stats update. A missing
    /// sidecar is recreated from nothing worth keeping, so this is a no-op
    /// with a warning instead.
    pub fn update_counts(&self, kb_id: i64, total_files: i64, total_chunks: i64) -> Result<()> {
        let path = self.info_path(kb_id);
        let Ok(raw) = std::fs::read_to_string(&path) else {
            tracing::warn!(kb_id, "metadata sidecar missing, skipping count update");
            return Ok(());
        };

        let mut metadata: KbMetadata = serde_json::from_str(&raw)?;
        metadata.total_files = total_files;
        metadata.total_chunks = total_chunks;
        metadata.updated_at = chrono::Utc::now().to_rfc3339();

        std::fs::write(&path, serde_json::to_string_pretty(&metadata)?)?;
        Ok(())
    }

    /// Read a KB's sidecar, if present and well-formed.
    pub fn read(&self, kb_id: i64) -> Option<KbMetadata> {
        let raw = std::fs::read_to_string(self.info_path(kb_id)).ok()?;
        serde_json::from_str(&raw).ok()
    }

    /// Delete the sidecar. Missing files are a no-op success.
    pub fn delete(&self, kb_id: i64) -> Result<()> {
        let path = self.info_path(kb_id);
        if path.exists() {
            std::fs::remove_file(path)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn store() -> (MetadataStore, TempDir) {
        let dir = TempDir::new().unwrap();
        (MetadataStore::new(dir.path().to_path_buf()), dir)
    }

    #[test]
    fn test_create_and_read() {
        let (store, _dir) = store();
        store
            .create(1, "docs", Some("notes"), "nomic-embed-text", "remote", "2026-01-01T00:00:00Z")
            .unwrap();

        let metadata = store.read(1).unwrap();
        assert_eq!(metadata.kb_id, 1);
        assert_eq!(metadata.name, "docs");
        assert_eq!(metadata.total_files, 0);
        assert_eq!(metadata.version, "1.0");
    }

    #[test]
    fn test_update_counts() {
        let (store, _dir) = store();
        store.create(1, "docs", None, "m", "remote", "2026-01-01T00:00:00Z").unwrap();
        store.update_counts(1, 3, 42).unwrap();

        let metadata = store.read(1).unwrap();
        assert_eq!(metadata.total_files, 3);
        assert_eq!(metadata.total_chunks, 42);
    }

    #[test]
    fn test_update_missing_sidecar_is_noop() {
        let (store, _dir) = store();
        store.update_counts(9, 1, 1).unwrap();
        assert!(store.read(9).is_none());
    }

    #[test]
    fn test_delete_is_idempotent() {
        let (store, _dir) = store();
        store.create(1, "docs", None, "m", "remote", "2026-01-01T00:00:00Z").unwrap();
        store.delete(1).unwrap();
        assert!(store.read(1).is_none());
        store.delete(1).unwrap();
    }
}
