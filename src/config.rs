//! Engine configuration.
//!
//! Every section has documented defaults, and the whole tree can be loaded
//! from a TOML file where any missing key falls back to its default.

use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{EngineError, Result};

const MIB: u64 = 1024 * 1024;

/// Smallest chunk size a client may declare.
pub const MIN_CHUNK_BYTES: u64 = MIB;

/// Top-level configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub store: StoreConfig,
    pub ingest: IngestConfig,
    pub transfer: TransferConfig,
    pub server: ServerConfig,
    pub modes: ModeThresholds,
    pub scheduler: SchedulerConfig,
}

impl EngineConfig {
    /// Parse a configuration from TOML text.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        toml::from_str(text)
            .map_err(|e| EngineError::validation(format!("Invalid configuration: {e}")))
    }

    /// Load a configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let text = std::fs::read_to_string(path.as_ref())?;
        Self::from_toml_str(&text)
    }
}

/// Local streaming store settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    /// Root directory. `None` means the host has no persistent storage.
    pub root: Option<PathBuf>,
    /// Maximum bytes of segment data (default: 2 GiB).
    pub max_size_bytes: u64,
    /// Records per physical write (default: 20,000).
    pub physical_write_rows: usize,
    /// Records per batch handed to scan consumers (default: 5,000).
    pub scan_batch_rows: usize,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: None,
            max_size_bytes: 2 * 1024 * MIB,
            physical_write_rows: 20_000,
            scan_batch_rows: 5_000,
        }
    }
}

impl StoreConfig {
    /// Configuration rooted at `root` with default limits.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: Some(root.into()),
            ..Default::default()
        }
    }
}

/// Ingestion pipeline settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct IngestConfig {
    /// Raw input bytes parsed per step (default: 4 MiB).
    pub raw_batch_bytes: u64,
}

impl Default for IngestConfig {
    fn default() -> Self {
        Self {
            raw_batch_bytes: 4 * MIB,
        }
    }
}

/// Client side of the resumable transfer protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransferConfig {
    /// Part size declared at init (default: 8 MiB).
    pub chunk_size_bytes: u64,
    /// Attempts per part before giving up (default: 5).
    pub max_attempts: u32,
    /// First retry delay in milliseconds (default: 500).
    pub initial_backoff_ms: u64,
    /// Cap on a single retry delay in milliseconds (default: 30,000).
    pub max_backoff_ms: u64,
    /// Delete the server session on a fatal error (default: false).
    pub delete_on_fatal: bool,
    /// Where to remember upload ids for automatic resume.
    pub ledger_path: Option<PathBuf>,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size_bytes: 8 * MIB,
            max_attempts: 5,
            initial_backoff_ms: 500,
            max_backoff_ms: 30_000,
            delete_on_fatal: false,
            ledger_path: None,
        }
    }
}

/// Request body limits of the hosting environment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UploadEnvironment {
    /// Serverless or proxied hosts with small request bodies.
    Constrained,
    /// Dedicated hosts.
    #[default]
    Standard,
}

impl UploadEnvironment {
    /// Largest chunk size this environment accepts.
    pub fn max_chunk_bytes(self) -> u64 {
        match self {
            UploadEnvironment::Constrained => 4 * MIB,
            UploadEnvironment::Standard => 128 * MIB,
        }
    }
}

/// Server side of the resumable transfer protocol.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Root for sessions, parts, stored objects and dataset indexes.
    pub root: PathBuf,
    pub environment: UploadEnvironment,
    /// Overrides the environment's chunk cap when set.
    pub max_chunk_bytes: Option<u64>,
    /// Idle sessions older than this are swept by `cleanup_expired`.
    pub session_ttl_secs: u64,
    /// Quota for each server-side dataset index (default: 16 GiB).
    pub dataset_max_bytes: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from("txnlens-data"),
            environment: UploadEnvironment::default(),
            max_chunk_bytes: None,
            session_ttl_secs: 24 * 60 * 60,
            dataset_max_bytes: 16 * 1024 * MIB,
        }
    }
}

impl ServerConfig {
    /// Configuration rooted at `root` with default limits.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Default::default()
        }
    }

    /// Effective upper bound on declared chunk sizes.
    pub fn chunk_limit(&self) -> u64 {
        self.max_chunk_bytes
            .unwrap_or_else(|| self.environment.max_chunk_bytes())
    }
}

/// File size thresholds used to pick a storage mode.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(default)]
pub struct ModeThresholds {
    /// Files up to this size are held in memory (default: 64 MiB).
    pub in_memory_max_bytes: u64,
    /// Files up to this size stream into the local store (default: 1 GiB).
    pub local_store_max_bytes: u64,
}

impl Default for ModeThresholds {
    fn default() -> Self {
        Self {
            in_memory_max_bytes: 64 * MIB,
            local_store_max_bytes: 1024 * MIB,
        }
    }
}

/// Recompute scheduling for filter changes.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Quiet period before a filter change is recomputed (default: 150 ms).
    pub debounce_ms: u64,
    /// Matching records kept for the table preview (default: 200).
    pub preview_rows: usize,
    /// Records kept when the local store degrades to a sample (default: 50,000).
    pub fallback_sample_rows: usize,
    /// In-memory records processed between yields (default: 50,000).
    pub memory_yield_rows: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            debounce_ms: 150,
            preview_rows: 200,
            fallback_sample_rows: 50_000,
            memory_yield_rows: 50_000,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert!(config.store.root.is_none());
        assert_eq!(config.store.physical_write_rows, 20_000);
        assert_eq!(config.ingest.raw_batch_bytes, 4 * MIB);
        assert_eq!(config.transfer.chunk_size_bytes, 8 * MIB);
        assert!(!config.transfer.delete_on_fatal);
        assert_eq!(config.server.chunk_limit(), 128 * MIB);
        assert_eq!(config.scheduler.debounce_ms, 150);
    }

    #[test]
    fn test_environment_caps() {
        assert_eq!(UploadEnvironment::Constrained.max_chunk_bytes(), 4 * MIB);
        assert!(
            UploadEnvironment::Constrained.max_chunk_bytes()
                < UploadEnvironment::Standard.max_chunk_bytes()
        );

        let server = ServerConfig {
            max_chunk_bytes: Some(2 * MIB),
            ..Default::default()
        };
        assert_eq!(server.chunk_limit(), 2 * MIB);
    }

    #[test]
    fn test_partial_toml() {
        let config = EngineConfig::from_toml_str(
            r#"
            [store]
            root = "/var/lib/txnlens"
            physical_write_rows = 10000

            [server]
            environment = "constrained"

            [modes]
            in_memory_max_bytes = 1024
            "#,
        )
        .unwrap();

        assert_eq!(config.store.root, Some(PathBuf::from("/var/lib/txnlens")));
        assert_eq!(config.store.physical_write_rows, 10_000);
        assert_eq!(config.store.scan_batch_rows, 5_000);
        assert_eq!(config.server.environment, UploadEnvironment::Constrained);
        assert_eq!(config.modes.in_memory_max_bytes, 1024);
        assert_eq!(config.modes.local_store_max_bytes, 1024 * MIB);
    }

    #[test]
    fn test_invalid_toml() {
        let err = EngineConfig::from_toml_str("[store]\nmax_size_bytes = \"lots\"").unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
    }
}
