//! Ingestion pipeline.
//!
//! Turns raw CSV bytes into normalized [`Record`] batches and hands each batch
//! to a [`RecordSink`]. Parsing and normalization run on the blocking pool,
//! one raw batch (`raw_batch_bytes` of input) at a time. The next raw batch
//! is not parsed until the sink has accepted the previous one, so peak
//! memory is bounded by the batch size rather than the file size.
//!
//! Row-level problems (unparseable timestamp or amount, invalid UTF-8) skip
//! the row. Only an input that yields no usable rows at all is fatal.

use std::fs::File;
use std::io::{BufReader, Read};
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use serde::Serialize;
use tracing::{debug, info, trace};

use crate::config::IngestConfig;
use crate::error::{EngineError, Result};
use crate::progress::{CancellationToken, ProgressTracker, Stage};
use crate::record::{ColumnMap, Record};
use crate::store::LocalStore;

// ---------------------------------------------------------------------------
// Sinks
// ---------------------------------------------------------------------------

/// Destination of normalized batches.
#[async_trait]
pub trait RecordSink: Send {
    /// Take ownership of one batch. Returns how many records were kept.
    async fn accept(&mut self, records: Vec<Record>) -> Result<u64>;

    /// Whether the sink wants no more records.
    fn is_full(&self) -> bool {
        false
    }
}

#[async_trait]
impl RecordSink for Vec<Record> {
    async fn accept(&mut self, records: Vec<Record>) -> Result<u64> {
        let kept = records.len() as u64;
        self.extend(records);
        Ok(kept)
    }
}

/// Writes into one generation of a [`LocalStore`].
#[derive(Debug, Clone)]
pub struct StoreSink {
    store: Arc<LocalStore>,
    generation: u64,
}

impl StoreSink {
    /// Pin the sink to the store's current generation.
    pub fn new(store: Arc<LocalStore>) -> Result<Self> {
        let generation = store.generation()?;
        Ok(Self { store, generation })
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}

#[async_trait]
impl RecordSink for StoreSink {
    async fn accept(&mut self, records: Vec<Record>) -> Result<u64> {
        self.store.add_batch_for(self.generation, &records).await
    }
}

/// Keeps the first `limit` records and reports full after that.
#[derive(Debug, Clone)]
pub struct BoundedSink {
    records: Vec<Record>,
    limit: usize,
}

impl BoundedSink {
    pub fn new(limit: usize) -> Self {
        Self {
            records: Vec::new(),
            limit,
        }
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

#[async_trait]
impl RecordSink for BoundedSink {
    async fn accept(&mut self, records: Vec<Record>) -> Result<u64> {
        let room = self.limit.saturating_sub(self.records.len());
        let kept = records.len().min(room);
        self.records.extend(records.into_iter().take(kept));
        Ok(kept as u64)
    }

    fn is_full(&self) -> bool {
        self.records.len() >= self.limit
    }
}

// ---------------------------------------------------------------------------
// Pipeline
// ---------------------------------------------------------------------------

/// Outcome of one ingestion run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct IngestSummary {
    /// Data rows encountered, including skipped ones.
    pub rows_seen: u64,
    /// Records the sink kept.
    pub rows_ingested: u64,
    pub rows_skipped: u64,
    pub bytes_read: u64,
    /// Batches handed to the sink.
    pub batches: u64,
}

struct RawBatch {
    rows: Vec<csv::StringRecord>,
    bad_rows: u64,
    position: u64,
    exhausted: bool,
}

fn read_raw_batch<R: Read>(reader: &mut csv::Reader<R>, limit: u64) -> Result<RawBatch> {
    let start = reader.position().byte();
    let mut rows = Vec::new();
    let mut bad_rows = 0;
    let mut row = csv::StringRecord::new();

    loop {
        match reader.read_record(&mut row) {
            Ok(true) => rows.push(row.clone()),
            Ok(false) => {
                return Ok(RawBatch {
                    rows,
                    bad_rows,
                    position: reader.position().byte(),
                    exhausted: true,
                })
            }
            Err(e) if e.is_io_error() => return Err(EngineError::csv(e.to_string())),
            Err(e) => {
                trace!(error = %e, "Skipping malformed row");
                bad_rows += 1;
            }
        }
        if reader.position().byte() - start >= limit {
            return Ok(RawBatch {
                rows,
                bad_rows,
                position: reader.position().byte(),
                exhausted: false,
            });
        }
    }
}

fn normalize_rows(columns: &ColumnMap, rows: &[csv::StringRecord]) -> (Vec<Record>, u64) {
    let mut records = Vec::with_capacity(rows.len());
    let mut skipped = 0;
    for row in rows {
        let cells: Vec<&str> = row.iter().collect();
        match columns.normalize(&cells) {
            Ok(record) => records.push(record),
            Err(e) => {
                trace!(error = ?e, "Skipping row");
                skipped += 1;
            }
        }
    }
    (records, skipped)
}

/// Streams CSV input into a [`RecordSink`].
#[derive(Debug, Clone, Default)]
pub struct IngestionPipeline {
    config: IngestConfig,
    progress: ProgressTracker,
}

impl IngestionPipeline {
    pub fn new(config: IngestConfig) -> Self {
        Self {
            config,
            progress: ProgressTracker::default(),
        }
    }

    /// Report through an existing tracker.
    pub fn with_progress(mut self, progress: ProgressTracker) -> Self {
        self.progress = progress;
        self
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    /// Ingest a CSV file.
    pub async fn ingest_file<S>(
        &self,
        path: &Path,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<IngestSummary>
    where
        S: RecordSink + ?Sized,
    {
        let file = File::open(path).map_err(|e| EngineError::from_storage_io(e, path))?;
        let total = file.metadata().map(|m| m.len()).unwrap_or(0);
        self.ingest(BufReader::new(file), total, sink, cancel).await
    }

    /// Ingest CSV from `source`, whose length is `total_bytes` (0 if unknown).
    ///
    /// Stops early without error once the sink reports full. Returns
    /// [`EngineError::Cancelled`] if `cancel` fires between raw batches.
    pub async fn ingest<R, S>(
        &self,
        source: R,
        total_bytes: u64,
        sink: &mut S,
        cancel: &CancellationToken,
    ) -> Result<IngestSummary>
    where
        R: Read + Send + 'static,
        S: RecordSink + ?Sized,
    {
        let progress = &self.progress;
        progress.set_total(total_bytes);
        progress.update(0, Stage::Reading);

        let limit = self.config.raw_batch_bytes.max(1);
        let (mut reader, headers) = tokio::task::spawn_blocking(move || {
            let mut reader = csv::ReaderBuilder::new()
                .flexible(true)
                .trim(csv::Trim::All)
                .from_reader(source);
            let headers = reader
                .byte_headers()
                .map(|h| {
                    h.iter()
                        .map(|cell| String::from_utf8_lossy(cell).into_owned())
                        .collect::<Vec<_>>()
                })
                .map_err(|e| EngineError::csv(e.to_string()));
            (reader, headers)
        })
        .await?;

        let columns = Arc::new(ColumnMap::resolve(headers?.iter().map(String::as_str)));
        if !columns.has_timestamp() {
            return Err(EngineError::EmptyOrUnparseableInput {
                rows_seen: 0,
                rows_skipped: 0,
            });
        }

        let mut summary = IngestSummary::default();
        let mut usable_rows = 0u64;

        loop {
            if cancel.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            if sink.is_full() {
                debug!(rows = summary.rows_ingested, "Sink full, stopping ingestion");
                break;
            }

            let (back, raw) = tokio::task::spawn_blocking(move || {
                let raw = read_raw_batch(&mut reader, limit);
                (reader, raw)
            })
            .await?;
            reader = back;
            let raw = raw?;

            summary.bytes_read = raw.position;
            summary.rows_seen += raw.rows.len() as u64 + raw.bad_rows;
            summary.rows_skipped += raw.bad_rows;
            progress.update(raw.position, Stage::Parsing);

            let exhausted = raw.exhausted;
            let rows = raw.rows;
            let map = Arc::clone(&columns);
            let (records, skipped) =
                tokio::task::spawn_blocking(move || normalize_rows(&map, &rows)).await?;
            summary.rows_skipped += skipped;
            usable_rows += records.len() as u64;
            progress.update(summary.bytes_read, Stage::Normalizing);

            if !records.is_empty() {
                let count = records.len();
                summary.rows_ingested += sink.accept(records).await?;
                summary.batches += 1;
                debug!(
                    rows = count,
                    bytes = summary.bytes_read,
                    batch = summary.batches,
                    "Ingested batch"
                );
            }

            if exhausted {
                break;
            }
            tokio::task::yield_now().await;
        }

        if usable_rows == 0 {
            return Err(EngineError::EmptyOrUnparseableInput {
                rows_seen: summary.rows_seen,
                rows_skipped: summary.rows_skipped,
            });
        }

        progress.finish();
        info!(
            rows = summary.rows_ingested,
            skipped = summary.rows_skipped,
            bytes = summary.bytes_read,
            "Ingestion complete"
        );
        Ok(summary)
    }
}
