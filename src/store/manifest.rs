//! Store manifest: the durable index of the current generation.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

pub const MANIFEST_FILE: &str = "manifest.json";

/// One segment written by a physical write.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SegmentEntry {
    /// File name inside the generation directory.
    pub file: String,
    pub rows: u64,
    pub bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Manifest {
    pub generation: u64,
    pub segments: Vec<SegmentEntry>,
    pub rows: u64,
    pub bytes: u64,
    /// Set once ingestion into this generation has completed.
    #[serde(default)]
    pub sealed: bool,
}

/// Directory holding the segments of `generation`.
pub fn generation_dir(root: &Path, generation: u64) -> PathBuf {
    root.join(format!("gen-{generation:06}"))
}

impl Manifest {
    pub fn new(generation: u64) -> Self {
        Self {
            generation,
            segments: Vec::new(),
            rows: 0,
            bytes: 0,
            sealed: false,
        }
    }

    pub fn next_segment_name(&self) -> String {
        format!("seg-{:06}.arrow", self.segments.len() + 1)
    }

    pub fn record_segment(&mut self, file: String, rows: u64, bytes: u64) {
        self.rows += rows;
        self.bytes += bytes;
        self.segments.push(SegmentEntry { file, rows, bytes });
    }

    /// Segment paths in storage order.
    pub fn segment_paths(&self, root: &Path) -> Vec<PathBuf> {
        let dir = generation_dir(root, self.generation);
        self.segments.iter().map(|s| dir.join(&s.file)).collect()
    }

    /// Load the manifest under `root`, if one has been written.
    pub async fn load(root: &Path) -> Result<Option<Self>> {
        let path = root.join(MANIFEST_FILE);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(EngineError::from_storage_io(e, &path)),
        }
    }

    /// Replace the manifest under `root` atomically.
    pub async fn save(&self, root: &Path) -> Result<()> {
        let path = root.join(MANIFEST_FILE);
        let tmp = root.join(format!("{MANIFEST_FILE}.tmp"));
        let bytes = serde_json::to_vec_pretty(self)?;
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| EngineError::from_storage_io(e, &tmp))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| EngineError::from_storage_io(e, &path))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_manifest_save_load() {
        let dir = tempfile::tempdir().unwrap();
        assert!(Manifest::load(dir.path()).await.unwrap().is_none());

        let mut manifest = Manifest::new(3);
        let name = manifest.next_segment_name();
        assert_eq!(name, "seg-000001.arrow");
        manifest.record_segment(name, 10, 400);
        manifest.record_segment(manifest.next_segment_name(), 5, 200);
        manifest.save(dir.path()).await.unwrap();
        assert!(!dir.path().join(format!("{MANIFEST_FILE}.tmp")).exists());

        let loaded = Manifest::load(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded, manifest);
        assert_eq!(loaded.rows, 15);
        assert_eq!(loaded.bytes, 600);
        assert_eq!(
            loaded.segment_paths(dir.path())[1],
            dir.path().join("gen-000003").join("seg-000002.arrow")
        );
    }

    #[tokio::test]
    async fn test_manifest_save_replaces_previous() {
        let dir = tempfile::tempdir().unwrap();
        Manifest::new(1).save(dir.path()).await.unwrap();
        let mut sealed = Manifest::new(2);
        sealed.sealed = true;
        sealed.save(dir.path()).await.unwrap();

        let loaded = Manifest::load(dir.path()).await.unwrap().unwrap();
        assert_eq!(loaded.generation, 2);
        assert!(loaded.sealed);
    }

    #[tokio::test]
    async fn test_manifest_load_rejects_corrupt_file() {
        let dir = tempfile::tempdir().unwrap();
        tokio::fs::write(dir.path().join(MANIFEST_FILE), b"{not json")
            .await
            .unwrap();
        assert!(matches!(
            Manifest::load(dir.path()).await,
            Err(EngineError::Json { .. })
        ));
    }
}
