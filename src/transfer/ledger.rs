//! Client-side memory of in-flight uploads.
//!
//! The ledger maps a local file (path, size and modification time) to the
//! upload id it was last sent under, so a restarted client can resume
//! without being told the id.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    pub upload_id: String,
    pub size_bytes: u64,
    pub modified_ms: i64,
    pub chunk_size_bytes: u64,
}

/// JSON-file ledger of resumable uploads.
#[derive(Debug, Clone)]
pub struct ResumeLedger {
    path: PathBuf,
    entries: BTreeMap<String, LedgerEntry>,
}

fn file_key(file: &Path) -> String {
    fs::canonicalize(file)
        .unwrap_or_else(|_| file.to_path_buf())
        .display()
        .to_string()
}

impl ResumeLedger {
    /// Open the ledger at `path`; a missing file is an empty ledger.
    pub fn open(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries = match fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes)?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => BTreeMap::new(),
            Err(e) => return Err(EngineError::from_storage_io(e, &path)),
        };
        Ok(Self { path, entries })
    }

    /// Upload id recorded for `file`, if its size and mtime are unchanged.
    pub fn lookup(&self, file: &Path, size_bytes: u64, modified_ms: i64) -> Option<&LedgerEntry> {
        self.entries
            .get(&file_key(file))
            .filter(|e| e.size_bytes == size_bytes && e.modified_ms == modified_ms)
    }

    pub fn record(&mut self, file: &Path, entry: LedgerEntry) -> Result<()> {
        self.entries.insert(file_key(file), entry);
        self.save()
    }

    pub fn forget(&mut self, file: &Path) -> Result<()> {
        if self.entries.remove(&file_key(file)).is_some() {
            self.save()?;
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    fn save(&self) -> Result<()> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|e| EngineError::from_storage_io(e, parent))?;
        }
        let tmp = self.path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec_pretty(&self.entries)?)
            .map_err(|e| EngineError::from_storage_io(e, &tmp))?;
        fs::rename(&tmp, &self.path).map_err(|e| EngineError::from_storage_io(e, &self.path))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ledger_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("tx.csv");
        fs::write(&file, b"x").unwrap();
        let ledger_path = dir.path().join("state").join("ledger.json");

        let mut ledger = ResumeLedger::open(&ledger_path).unwrap();
        assert!(ledger.is_empty());
        ledger
            .record(
                &file,
                LedgerEntry {
                    upload_id: "u1".into(),
                    size_bytes: 1,
                    modified_ms: 42,
                    chunk_size_bytes: 1024,
                },
            )
            .unwrap();

        let reopened = ResumeLedger::open(&ledger_path).unwrap();
        assert_eq!(reopened.lookup(&file, 1, 42).map(|e| e.upload_id.as_str()), Some("u1"));
        assert!(reopened.lookup(&file, 2, 42).is_none());
        assert!(reopened.lookup(&file, 1, 43).is_none());

        ledger.forget(&file).unwrap();
        assert!(ResumeLedger::open(&ledger_path).unwrap().is_empty());
    }
}
