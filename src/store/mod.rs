//! Local streaming store.
//!
//! An append-only record store on the local filesystem. Records for the
//! current generation live in Arrow IPC segments, one per physical write,
//! indexed by a JSON manifest:
//!
//! ```text
//! <root>/manifest.json
//! <root>/gen-000001/seg-000001.arrow
//! <root>/gen-000001/seg-000002.arrow
//! ```
//!
//! Reads go through a [`ScanCursor`] that decodes one segment at a time, so
//! peak memory is bounded by a segment plus one delivered batch regardless of
//! dataset size.
//!
//! A generation is owned by its single writer until ingestion completes.
//! After that any number of cursors may read it concurrently.

mod cursor;
mod manifest;
pub mod segment;

pub use cursor::ScanCursor;
pub use manifest::{generation_dir, Manifest, SegmentEntry};

use std::collections::BTreeSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::aggregate::{Accumulator, AggregateResult};
use crate::config::StoreConfig;
use crate::error::{EngineError, Result};
use crate::predicate::{FilterPredicate, ScanFilter};
use crate::progress::CancellationToken;
use crate::record::{Dimension, Record};

// ---------------------------------------------------------------------------
// Statistics
// ---------------------------------------------------------------------------

/// Counters accumulated over the lifetime of a store handle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct StoreStats {
    /// Records the scan cursor has evaluated against a predicate.
    pub rows_scanned: u64,
    pub segments_read: u64,
    pub segments_written: u64,
}

#[derive(Debug, Default)]
pub(crate) struct StoreCounters {
    pub(crate) rows_scanned: AtomicU64,
    pub(crate) segments_read: AtomicU64,
    pub(crate) segments_written: AtomicU64,
}

// ---------------------------------------------------------------------------
// LocalStore
// ---------------------------------------------------------------------------

/// Append-only, cursor-scanned record store.
pub struct LocalStore {
    config: StoreConfig,
    manifest: RwLock<Option<Manifest>>,
    writer: tokio::sync::Mutex<()>,
    pub(crate) counters: StoreCounters,
}

impl std::fmt::Debug for LocalStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LocalStore")
            .field("root", &self.config.root)
            .field("manifest", &*self.manifest.read())
            .finish()
    }
}

impl LocalStore {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            manifest: RwLock::new(None),
            writer: tokio::sync::Mutex::new(()),
            counters: StoreCounters::default(),
        }
    }

    /// Create a store rooted at `root` with default limits.
    pub fn at(root: impl Into<PathBuf>) -> Self {
        Self::new(StoreConfig::at(root))
    }

    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    fn root(&self) -> Result<&Path> {
        self.config.root.as_deref().ok_or_else(|| {
            EngineError::storage_unavailable("no persistent local storage is configured")
        })
    }

    /// Prepare the store for the current generation.
    ///
    /// Idempotent. Reopens an existing manifest when one is present so a
    /// restarted process sees previously ingested data.
    pub async fn init(&self) -> Result<()> {
        if self.manifest.read().is_some() {
            return Ok(());
        }
        let root = self.root()?.to_path_buf();
        tokio::fs::create_dir_all(&root).await.map_err(|e| {
            EngineError::storage_unavailable(format!("{}: {e}", root.display()))
        })?;

        let _guard = self.writer.lock().await;
        if self.manifest.read().is_some() {
            return Ok(());
        }
        let manifest = match Manifest::load(&root).await? {
            Some(existing) => existing,
            None => {
                let fresh = Manifest::new(1);
                fresh.save(&root).await?;
                fresh
            }
        };
        let dir = generation_dir(&root, manifest.generation);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| EngineError::from_storage_io(e, &dir))?;

        info!(
            root = %root.display(),
            generation = manifest.generation,
            rows = manifest.rows,
            "Local store ready"
        );
        *self.manifest.write() = Some(manifest);
        Ok(())
    }

    fn current(&self) -> Result<Manifest> {
        self.manifest
            .read()
            .clone()
            .ok_or_else(|| EngineError::storage_unavailable("local store is not initialized"))
    }

    /// The current generation.
    pub fn generation(&self) -> Result<u64> {
        self.manifest
            .read()
            .as_ref()
            .map(|m| m.generation)
            .ok_or_else(|| EngineError::storage_unavailable("local store is not initialized"))
    }

    pub(crate) fn ensure_generation(&self, expected: u64) -> Result<()> {
        let current = self.generation()?;
        if current != expected {
            return Err(EngineError::StaleGeneration { expected, current });
        }
        Ok(())
    }

    /// Drop every record by advancing to a fresh, empty generation.
    ///
    /// Returns the new generation. Readers and writers pinned to the old one
    /// fail with [`EngineError::StaleGeneration`].
    pub async fn clear(&self) -> Result<u64> {
        let root = self.root()?.to_path_buf();
        let _guard = self.writer.lock().await;
        let old = self.current()?;
        let next = Manifest::new(old.generation + 1);

        let dir = generation_dir(&root, next.generation);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| EngineError::from_storage_io(e, &dir))?;
        next.save(&root).await?;
        *self.manifest.write() = Some(next.clone());

        let old_dir = generation_dir(&root, old.generation);
        if let Err(e) = tokio::fs::remove_dir_all(&old_dir).await {
            warn!(path = %old_dir.display(), error = %e, "Failed to remove old generation");
        }
        info!(generation = next.generation, "Local store cleared");
        Ok(next.generation)
    }

    /// Total records in the current generation, read from the manifest.
    pub fn count(&self) -> Result<u64> {
        self.manifest
            .read()
            .as_ref()
            .map(|m| m.rows)
            .ok_or_else(|| EngineError::storage_unavailable("local store is not initialized"))
    }

    /// Bytes of segment data in the current generation.
    pub fn size_bytes(&self) -> Result<u64> {
        Ok(self.current()?.bytes)
    }

    /// Append records to the current generation.
    pub async fn add_batch(&self, records: &[Record]) -> Result<u64> {
        let generation = self.generation()?;
        self.add_batch_for(generation, records).await
    }

    /// Append records to `generation`, which must still be current.
    ///
    /// Records are written in chunks of `physical_write_rows`, yielding between
    /// writes. The call is not atomic: a failure part way through leaves the
    /// chunks already written in place.
    pub async fn add_batch_for(&self, generation: u64, records: &[Record]) -> Result<u64> {
        let root = self.root()?.to_path_buf();
        let _guard = self.writer.lock().await;
        let mut written = 0u64;

        for (i, chunk) in records.chunks(self.config.physical_write_rows.max(1)).enumerate() {
            if i > 0 {
                tokio::task::yield_now().await;
            }
            let mut manifest = self.current()?;
            if manifest.generation != generation {
                return Err(EngineError::StaleGeneration {
                    expected: generation,
                    current: manifest.generation,
                });
            }
            if manifest.sealed {
                return Err(EngineError::validation(format!(
                    "generation {generation} is sealed"
                )));
            }

            let bytes = segment::encode(chunk)?;
            let projected = manifest.bytes + bytes.len() as u64;
            if projected > self.config.max_size_bytes {
                return Err(EngineError::quota_exceeded(format!(
                    "writing {} bytes would bring the store to {projected} of {} bytes",
                    bytes.len(),
                    self.config.max_size_bytes
                )));
            }

            let file = manifest.next_segment_name();
            let path = generation_dir(&root, generation).join(&file);
            let len = bytes.len() as u64;
            tokio::fs::write(&path, bytes)
                .await
                .map_err(|e| EngineError::from_storage_io(e, &path))?;

            manifest.record_segment(file, chunk.len() as u64, len);
            manifest.save(&root).await?;
            *self.manifest.write() = Some(manifest);
            self.counters.segments_written.fetch_add(1, Ordering::Relaxed);
            written += chunk.len() as u64;

            debug!(generation, rows = chunk.len(), bytes = len, "Segment written");
        }
        Ok(written)
    }

    /// Mark the current generation as fully ingested.
    pub async fn seal(&self) -> Result<()> {
        let root = self.root()?.to_path_buf();
        let _guard = self.writer.lock().await;
        let mut manifest = self.current()?;
        if !manifest.sealed {
            manifest.sealed = true;
            manifest.save(&root).await?;
            *self.manifest.write() = Some(manifest);
        }
        Ok(())
    }

    pub fn is_sealed(&self) -> bool {
        self.manifest.read().as_ref().is_some_and(|m| m.sealed)
    }

    // -- reads --------------------------------------------------------------

    /// Open a cursor over the current generation.
    ///
    /// Pass [`ScanFilter::All`] to read back every stored record, or a
    /// `&FilterPredicate` for analytic reads.
    pub fn scan(
        &self,
        filter: impl Into<ScanFilter>,
        batch_size: usize,
        cancel: &CancellationToken,
    ) -> Result<ScanCursor<'_>> {
        let root = self.root()?;
        let manifest = self.current()?;
        Ok(ScanCursor::new(
            self,
            manifest.generation,
            manifest.segment_paths(root),
            filter.into(),
            batch_size,
            cancel.clone(),
        ))
    }

    /// Fold every matching batch through `on_batch`, in storage order.
    ///
    /// `on_batch` runs between cursor steps, never alongside one. An error
    /// from the cursor or from `on_batch` aborts the scan.
    pub async fn stream_scan<F>(
        &self,
        filter: impl Into<ScanFilter>,
        batch_size: usize,
        cancel: &CancellationToken,
        mut on_batch: F,
    ) -> Result<()>
    where
        F: FnMut(Vec<Record>) -> Result<()>,
    {
        let mut cursor = self.scan(filter, batch_size, cancel)?;
        while let Some(batch) = cursor.next_batch().await? {
            on_batch(batch)?;
        }
        Ok(())
    }

    /// Up to `max_rows` matching records in storage order.
    pub async fn sample(&self, max_rows: usize, predicate: &FilterPredicate) -> Result<Vec<Record>> {
        let cancel = CancellationToken::new();
        Ok(self
            .sample_with_cancel(max_rows, predicate, &cancel)
            .await?
            .unwrap_or_default())
    }

    /// Like [`LocalStore::sample`], returning `None` if cancelled.
    ///
    /// The cursor stops at the `max_rows`-th match; nothing past it is read.
    pub async fn sample_with_cancel(
        &self,
        max_rows: usize,
        predicate: &FilterPredicate,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<Record>>> {
        if max_rows == 0 {
            return Ok(Some(Vec::new()));
        }
        let mut cursor = self.scan(predicate, max_rows, cancel)?;
        let rows = cursor.next_batch().await?.unwrap_or_default();
        if cancel.is_cancelled() {
            return Ok(None);
        }
        Ok(Some(rows))
    }

    /// Aggregate every matching record in one scan pass.
    pub async fn aggregate(&self, predicate: &FilterPredicate) -> Result<AggregateResult> {
        let cancel = CancellationToken::new();
        self.aggregate_with_cancel(predicate, &cancel)
            .await?
            .ok_or(EngineError::Cancelled)
    }

    /// Like [`LocalStore::aggregate`]; a cancelled pass yields `None`, never a
    /// partial result.
    pub async fn aggregate_with_cancel(
        &self,
        predicate: &FilterPredicate,
        cancel: &CancellationToken,
    ) -> Result<Option<AggregateResult>> {
        let mut acc = Accumulator::new();
        self.stream_scan(predicate, self.config.scan_batch_rows, cancel, |batch| {
            acc.extend(&batch);
            Ok(())
        })
        .await?;
        if cancel.is_cancelled() {
            return Ok(None);
        }
        Ok(Some(acc.finish()))
    }

    /// Sorted, trimmed, non-empty values of one dimension.
    pub async fn distinct_values(&self, dimension: Dimension) -> Result<BTreeSet<String>> {
        let root = self.root()?;
        let manifest = self.current()?;
        let mut values = BTreeSet::new();
        for path in manifest.segment_paths(root) {
            self.ensure_generation(manifest.generation)?;
            let part =
                tokio::task::spawn_blocking(move || segment::read_dimension(&path, dimension))
                    .await??;
            self.counters.segments_read.fetch_add(1, Ordering::Relaxed);
            values.extend(part);
            tokio::task::yield_now().await;
        }
        Ok(values)
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            rows_scanned: self.counters.rows_scanned.load(Ordering::Relaxed),
            segments_read: self.counters.segments_read.load(Ordering::Relaxed),
            segments_written: self.counters.segments_written.load(Ordering::Relaxed),
        }
    }
}
