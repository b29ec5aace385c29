//! Mode orchestrator.
//!
//! Picks a storage mode per loaded dataset and answers filter, aggregate,
//! sample and distinct-value requests the same way whatever the mode:
//!
//! - [`StorageMode::InMemory`]: records held in a [`MemoryEngine`].
//! - [`StorageMode::LocalStore`]: records streamed into the [`LocalStore`].
//! - [`StorageMode::RemoteDelegated`]: bytes sent through the transfer
//!   protocol; queries forwarded to the server holding the stored object.
//!
//! Filter changes go through a [`RecomputeScheduler`], so only the latest
//! recompute can ever become observable.

mod memory;
mod scheduler;

pub use memory::MemoryEngine;
pub use scheduler::{RecomputeScheduler, RecomputeTicket};

use std::collections::BTreeSet;
use std::fmt;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::RwLock;
use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::aggregate::AggregateResult;
use crate::config::{EngineConfig, ModeThresholds};
use crate::error::{EngineError, Result};
use crate::ingest::{BoundedSink, IngestSummary, IngestionPipeline, StoreSink};
use crate::predicate::FilterPredicate;
use crate::progress::{CancellationToken, ProgressTracker};
use crate::record::{Dimension, Record};
use crate::store::LocalStore;
use crate::transfer::{RemoteQueryEndpoint, TransferClient, TransferEndpoint, UploadOutcome};

// ---------------------------------------------------------------------------
// Modes
// ---------------------------------------------------------------------------

/// Where the authoritative copy of the loaded dataset lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StorageMode {
    InMemory,
    LocalStore,
    RemoteDelegated,
}

impl fmt::Display for StorageMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            StorageMode::InMemory => "in_memory",
            StorageMode::LocalStore => "local_store",
            StorageMode::RemoteDelegated => "remote_delegated",
        };
        f.write_str(name)
    }
}

/// Pick the mode for a file of `size_bytes`.
///
/// Without a remote endpoint, files above the local-store threshold still go
/// to the local store and rely on the degradation policy.
pub fn select_mode(
    size_bytes: u64,
    thresholds: &ModeThresholds,
    remote_available: bool,
) -> StorageMode {
    if size_bytes <= thresholds.in_memory_max_bytes {
        StorageMode::InMemory
    } else if size_bytes <= thresholds.local_store_max_bytes || !remote_available {
        StorageMode::LocalStore
    } else {
        StorageMode::RemoteDelegated
    }
}

/// A reduced-fidelity answer the caller must be told about.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Degradation {
    /// Only the first `rows_kept` records of the file are loaded.
    Sampled { rows_kept: usize, reason: String },
}

impl fmt::Display for Degradation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Degradation::Sampled { rows_kept, reason } => {
                write!(f, "showing a sample of the first {rows_kept} rows: {reason}")
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Reports and views
// ---------------------------------------------------------------------------

/// Result of loading a dataset.
#[derive(Debug, Clone, Serialize)]
pub struct LoadReport {
    pub mode: StorageMode,
    /// Records held locally; `None` when the rows live on the server.
    pub rows: Option<u64>,
    pub stored_file_id: Option<String>,
    pub degradation: Option<Degradation>,
    pub summary: Option<IngestSummary>,
}

/// Observable state after a filter change.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct FilterView {
    /// Dataset generation the view was computed against.
    pub generation: u64,
    pub predicate: FilterPredicate,
    /// First matching records, in storage order.
    pub preview: Vec<Record>,
    pub aggregate: AggregateResult,
    pub degradation: Option<Degradation>,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RecomputeOutcome {
    Applied(FilterView),
    /// A newer filter change or dataset load replaced this one.
    Superseded,
}

/// Sampled records together with any degradation of the dataset.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SampleResult {
    pub records: Vec<Record>,
    pub degradation: Option<Degradation>,
}

// ---------------------------------------------------------------------------
// Backing engines
// ---------------------------------------------------------------------------

#[derive(Clone)]
struct RemoteEndpoints {
    transfer: Arc<dyn TransferEndpoint>,
    queries: Arc<dyn RemoteQueryEndpoint>,
}

enum Backing {
    Empty,
    Memory(MemoryEngine),
    Local(Arc<LocalStore>),
    Remote {
        queries: Arc<dyn RemoteQueryEndpoint>,
        stored_file_id: String,
    },
}

struct Dataset {
    generation: u64,
    mode: Option<StorageMode>,
    backing: Backing,
    degradation: Option<Degradation>,
}

impl Dataset {
    fn empty(generation: u64) -> Self {
        Self {
            generation,
            mode: None,
            backing: Backing::Empty,
            degradation: None,
        }
    }

    fn no_dataset() -> EngineError {
        EngineError::not_found("no dataset is loaded")
    }

    async fn sample(
        &self,
        max_rows: usize,
        predicate: &FilterPredicate,
        cancel: &CancellationToken,
    ) -> Result<Option<Vec<Record>>> {
        match &self.backing {
            Backing::Empty => Err(Self::no_dataset()),
            Backing::Memory(engine) => Ok(engine.sample(max_rows, predicate, cancel).await),
            Backing::Local(store) => store.sample_with_cancel(max_rows, predicate, cancel).await,
            Backing::Remote {
                queries,
                stored_file_id,
            } => {
                let rows = queries.sample(stored_file_id, max_rows, predicate).await?;
                Ok((!cancel.is_cancelled()).then_some(rows))
            }
        }
    }

    async fn aggregate(
        &self,
        predicate: &FilterPredicate,
        cancel: &CancellationToken,
    ) -> Result<Option<AggregateResult>> {
        match &self.backing {
            Backing::Empty => Err(Self::no_dataset()),
            Backing::Memory(engine) => Ok(engine.aggregate(predicate, cancel).await),
            Backing::Local(store) => store.aggregate_with_cancel(predicate, cancel).await,
            Backing::Remote {
                queries,
                stored_file_id,
            } => {
                let result = queries.aggregate(stored_file_id, predicate).await?;
                Ok((!cancel.is_cancelled()).then_some(result))
            }
        }
    }

    async fn distinct_values(&self, dimension: Dimension) -> Result<BTreeSet<String>> {
        match &self.backing {
            Backing::Empty => Err(Self::no_dataset()),
            Backing::Memory(engine) => Ok(engine.distinct_values(dimension)),
            Backing::Local(store) => store.distinct_values(dimension).await,
            Backing::Remote {
                queries,
                stored_file_id,
            } => queries.distinct_values(stored_file_id, dimension).await,
        }
    }
}

// ---------------------------------------------------------------------------
// Orchestrator
// ---------------------------------------------------------------------------

/// Uniform query surface over whichever engine holds the loaded dataset.
pub struct Orchestrator {
    config: EngineConfig,
    store: Arc<LocalStore>,
    remote: Option<RemoteEndpoints>,
    dataset: RwLock<Arc<Dataset>>,
    predicate: RwLock<FilterPredicate>,
    view: RwLock<Option<FilterView>>,
    scheduler: RecomputeScheduler,
}

impl fmt::Debug for Orchestrator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let dataset = self.dataset.read();
        f.debug_struct("Orchestrator")
            .field("generation", &dataset.generation)
            .field("mode", &dataset.mode)
            .field("remote", &self.remote.is_some())
            .finish()
    }
}

impl Orchestrator {
    pub fn new(config: EngineConfig) -> Self {
        let store = Arc::new(LocalStore::new(config.store.clone()));
        let scheduler =
            RecomputeScheduler::new(Duration::from_millis(config.scheduler.debounce_ms));
        Self {
            config,
            store,
            remote: None,
            dataset: RwLock::new(Arc::new(Dataset::empty(0))),
            predicate: RwLock::new(FilterPredicate::all()),
            view: RwLock::new(None),
            scheduler,
        }
    }

    /// Enable remote-delegated mode through these endpoints.
    pub fn with_remote(
        mut self,
        transfer: Arc<dyn TransferEndpoint>,
        queries: Arc<dyn RemoteQueryEndpoint>,
    ) -> Self {
        self.remote = Some(RemoteEndpoints { transfer, queries });
        self
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn store(&self) -> &Arc<LocalStore> {
        &self.store
    }

    /// Mode of the loaded dataset, `None` before the first load.
    pub fn mode(&self) -> Option<StorageMode> {
        self.dataset.read().mode
    }

    /// Generation of the loaded dataset. Every load advances it.
    pub fn generation(&self) -> u64 {
        self.dataset.read().generation
    }

    pub fn degradation(&self) -> Option<Degradation> {
        self.dataset.read().degradation.clone()
    }

    /// The last applied filter view for the current dataset.
    pub fn current_view(&self) -> Option<FilterView> {
        self.view.read().clone()
    }

    /// Predicate of the most recent filter change.
    pub fn predicate(&self) -> FilterPredicate {
        self.predicate.read().clone()
    }

    fn current(&self) -> Arc<Dataset> {
        Arc::clone(&self.dataset.read())
    }

    // -- loading ------------------------------------------------------------

    /// Load a CSV file with a fresh progress tracker and no cancellation.
    pub async fn load_file(&self, path: &Path) -> Result<LoadReport> {
        self.load_file_with(path, &ProgressTracker::default(), &CancellationToken::new())
            .await
    }

    /// Load a CSV file, replacing the current dataset.
    ///
    /// In-flight recomputes are cancelled and the dataset generation advances
    /// before any bytes are read. The filter resets to match everything.
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn load_file_with(
        &self,
        path: &Path,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<LoadReport> {
        let size = tokio::fs::metadata(path)
            .await
            .map_err(|e| EngineError::from_storage_io(e, path))?
            .len();
        let mode = select_mode(size, &self.config.modes, self.remote.is_some());

        self.scheduler.cancel_all();
        let generation = {
            let mut dataset = self.dataset.write();
            let generation = dataset.generation + 1;
            *dataset = Arc::new(Dataset::empty(generation));
            generation
        };
        *self.view.write() = None;
        *self.predicate.write() = FilterPredicate::all();
        info!(size, %mode, generation, "Loading dataset");

        let (backing, report) = match mode {
            StorageMode::InMemory => self.load_in_memory(path, progress, cancel).await?,
            StorageMode::LocalStore => self.load_local(path, progress, cancel).await?,
            StorageMode::RemoteDelegated => self.load_remote(path, progress, cancel).await?,
        };

        let mut dataset = self.dataset.write();
        if dataset.generation != generation {
            // Another load started while this one ran.
            return Err(EngineError::StaleGeneration {
                expected: generation,
                current: dataset.generation,
            });
        }
        *dataset = Arc::new(Dataset {
            generation,
            mode: Some(mode),
            backing,
            degradation: report.degradation.clone(),
        });
        info!(
            %mode,
            generation,
            rows = ?report.rows,
            degraded = report.degradation.is_some(),
            "Dataset loaded"
        );
        Ok(report)
    }

    fn pipeline(&self, progress: &ProgressTracker) -> IngestionPipeline {
        IngestionPipeline::new(self.config.ingest.clone()).with_progress(progress.clone())
    }

    async fn load_in_memory(
        &self,
        path: &Path,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<(Backing, LoadReport)> {
        let mut records = Vec::new();
        let summary = self
            .pipeline(progress)
            .ingest_file(path, &mut records, cancel)
            .await?;
        let report = LoadReport {
            mode: StorageMode::InMemory,
            rows: Some(records.len() as u64),
            stored_file_id: None,
            degradation: None,
            summary: Some(summary),
        };
        let engine = MemoryEngine::new(records, self.config.scheduler.memory_yield_rows);
        Ok((Backing::Memory(engine), report))
    }

    async fn load_local(
        &self,
        path: &Path,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<(Backing, LoadReport)> {
        match self.ingest_into_store(path, progress, cancel).await {
            Ok(summary) => {
                let report = LoadReport {
                    mode: StorageMode::LocalStore,
                    rows: Some(self.store.count()?),
                    stored_file_id: None,
                    degradation: None,
                    summary: Some(summary),
                };
                Ok((Backing::Local(Arc::clone(&self.store)), report))
            }
            Err(err @ (EngineError::QuotaExceeded { .. } | EngineError::StorageUnavailable { .. })) => {
                warn!(error = %err, "Local store cannot hold the dataset, falling back to a sample");
                if matches!(err, EngineError::QuotaExceeded { .. }) {
                    self.store.clear().await?;
                }
                self.load_sampled(path, progress, cancel, err.to_string())
                    .await
            }
            Err(err) => Err(err),
        }
    }

    async fn ingest_into_store(
        &self,
        path: &Path,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<IngestSummary> {
        self.store.init().await?;
        if self.store.count()? > 0 || self.store.is_sealed() {
            self.store.clear().await?;
        }
        let mut sink = StoreSink::new(Arc::clone(&self.store))?;
        let summary = self.pipeline(progress).ingest_file(path, &mut sink, cancel).await?;
        self.store.seal().await?;
        Ok(summary)
    }

    async fn load_sampled(
        &self,
        path: &Path,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
        reason: String,
    ) -> Result<(Backing, LoadReport)> {
        // The failed store pass already moved the tracker; this is a new read.
        progress.restart(0);
        let mut sink = BoundedSink::new(self.config.scheduler.fallback_sample_rows);
        let summary = self.pipeline(progress).ingest_file(path, &mut sink, cancel).await?;
        let records = sink.into_records();
        let degradation = Degradation::Sampled {
            rows_kept: records.len(),
            reason,
        };
        let report = LoadReport {
            mode: StorageMode::LocalStore,
            rows: Some(records.len() as u64),
            stored_file_id: None,
            degradation: Some(degradation),
            summary: Some(summary),
        };
        let engine = MemoryEngine::new(records, self.config.scheduler.memory_yield_rows);
        Ok((Backing::Memory(engine), report))
    }

    async fn load_remote(
        &self,
        path: &Path,
        progress: &ProgressTracker,
        cancel: &CancellationToken,
    ) -> Result<(Backing, LoadReport)> {
        let remote = self
            .remote
            .clone()
            .ok_or_else(|| EngineError::internal("remote mode selected without an endpoint"))?;
        let client = TransferClient::new(remote.transfer, self.config.transfer.clone())
            .with_progress(progress.clone());
        match client.upload_file(path, None, cancel).await? {
            UploadOutcome::Completed { stored_file_id, .. } => {
                let report = LoadReport {
                    mode: StorageMode::RemoteDelegated,
                    rows: None,
                    stored_file_id: Some(stored_file_id.clone()),
                    degradation: None,
                    summary: None,
                };
                let backing = Backing::Remote {
                    queries: remote.queries,
                    stored_file_id,
                };
                Ok((backing, report))
            }
            UploadOutcome::Cancelled { .. } => Err(EngineError::Cancelled),
        }
    }

    // -- queries ------------------------------------------------------------

    /// Recompute the preview and aggregate for `predicate`.
    ///
    /// Waits out the debounce window, then runs a filter pass (preview) and
    /// an aggregate pass with a yield between them. Returns
    /// [`RecomputeOutcome::Superseded`] if a newer call or a load replaced
    /// this one at any point; a superseded result is never applied.
    pub async fn apply_filter(&self, predicate: FilterPredicate) -> Result<RecomputeOutcome> {
        predicate.validate()?;
        let ticket = self.scheduler.issue();
        *self.predicate.write() = predicate.clone();

        if !self.scheduler.settle(&ticket).await {
            debug!(ticket = ticket.generation(), "Filter change superseded while debouncing");
            return Ok(RecomputeOutcome::Superseded);
        }

        match self.recompute(&ticket, predicate).await {
            Ok(outcome) => Ok(outcome),
            Err(_) if !self.scheduler.is_current(&ticket) => Ok(RecomputeOutcome::Superseded),
            Err(e) => Err(e),
        }
    }

    async fn recompute(
        &self,
        ticket: &RecomputeTicket,
        predicate: FilterPredicate,
    ) -> Result<RecomputeOutcome> {
        let dataset = self.current();
        let cancel = ticket.cancel_token();

        let Some(preview) = dataset
            .sample(self.config.scheduler.preview_rows, &predicate, cancel)
            .await?
        else {
            return Ok(RecomputeOutcome::Superseded);
        };
        tokio::task::yield_now().await;
        if !self.scheduler.is_current(ticket) {
            return Ok(RecomputeOutcome::Superseded);
        }

        let Some(aggregate) = dataset.aggregate(&predicate, cancel).await? else {
            return Ok(RecomputeOutcome::Superseded);
        };

        let view = FilterView {
            generation: dataset.generation,
            predicate,
            preview,
            aggregate,
            degradation: dataset.degradation.clone(),
        };
        let applied = self.scheduler.commit(ticket, || {
            *self.view.write() = Some(view.clone());
        });
        if applied {
            debug!(
                ticket = ticket.generation(),
                total = view.aggregate.total_count,
                "Filter view applied"
            );
            Ok(RecomputeOutcome::Applied(view))
        } else {
            Ok(RecomputeOutcome::Superseded)
        }
    }

    /// Aggregate under the current filter.
    pub async fn get_aggregate(&self) -> Result<AggregateResult> {
        let dataset = self.current();
        let predicate = self.predicate();
        if let Some(view) = self.view.read().as_ref() {
            if view.generation == dataset.generation && view.predicate == predicate {
                return Ok(view.aggregate.clone());
            }
        }
        dataset
            .aggregate(&predicate, &CancellationToken::new())
            .await?
            .ok_or(EngineError::Cancelled)
    }

    /// Up to `max_rows` records matching the current filter.
    pub async fn get_sample(&self, max_rows: usize) -> Result<SampleResult> {
        let dataset = self.current();
        let records = dataset
            .sample(max_rows, &self.predicate(), &CancellationToken::new())
            .await?
            .ok_or(EngineError::Cancelled)?;
        Ok(SampleResult {
            records,
            degradation: dataset.degradation.clone(),
        })
    }

    /// Sorted distinct values of `dimension` across the whole dataset.
    pub async fn get_distinct_values(&self, dimension: Dimension) -> Result<BTreeSet<String>> {
        self.current().distinct_values(dimension).await
    }
}
