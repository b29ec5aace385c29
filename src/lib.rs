//! txnlens - Large-dataset ingestion and streaming analytics for transaction data
//!
//! txnlens loads multi-gigabyte CSV exports of payment transactions and lets
//! callers filter and aggregate them without ever holding the full dataset in
//! memory, and without losing progress when an upload is interrupted.
//!
//! # Components
//!
//! - **Local store**: an append-only, Arrow IPC segment store with cursor
//!   scans, early-terminating samples and single-pass aggregation.
//! - **Ingestion**: bounded-batch CSV parsing and normalization with
//!   backpressure into any [`RecordSink`].
//! - **Transfer**: a resumable, chunked upload protocol with an in-process
//!   server, an HTTP binding and a retrying client.
//! - **Orchestrator**: picks in-memory, local-store or remote-delegated mode
//!   per dataset and serves one filter/aggregate/sample API over all three.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use txnlens::{Dimension, EngineConfig, FilterPredicate, Orchestrator, RecomputeOutcome};
//!
//! # async fn run() -> txnlens::Result<()> {
//! let orchestrator = Orchestrator::new(EngineConfig::default());
//! let report = orchestrator.load_file("data/transactions.csv".as_ref()).await?;
//! println!("loaded in {} mode", report.mode);
//!
//! let predicate = FilterPredicate::all().with_values(Dimension::Gateway, ["PAYU"]);
//! if let RecomputeOutcome::Applied(view) = orchestrator.apply_filter(predicate).await? {
//!     println!("success rate {:.2}%", view.aggregate.success_rate);
//! }
//! # Ok(())
//! # }
//! ```
//!
//! # Resumable Uploads
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use txnlens::{CancellationToken, HttpEndpoint, TransferClient, TransferConfig};
//!
//! # async fn run() -> txnlens::Result<()> {
//! let endpoint = Arc::new(HttpEndpoint::new("http://127.0.0.1:8080")?);
//! let client = TransferClient::new(endpoint, TransferConfig::default());
//! let outcome = client
//!     .upload_file("data/transactions.csv".as_ref(), None, &CancellationToken::new())
//!     .await?;
//! println!("{outcome:?}");
//! # Ok(())
//! # }
//! ```

pub mod aggregate;
pub mod config;
pub mod engine;
pub mod error;
pub mod ingest;
pub mod predicate;
pub mod progress;
pub mod record;
pub mod store;
pub mod transfer;

// Re-export commonly used types
pub use aggregate::{Accumulator, AggregateResult, DailyBucket};
pub use config::{
    EngineConfig, IngestConfig, ModeThresholds, SchedulerConfig, ServerConfig, StoreConfig,
    TransferConfig, UploadEnvironment,
};
pub use engine::{
    select_mode, Degradation, FilterView, LoadReport, MemoryEngine, Orchestrator,
    RecomputeOutcome, SampleResult, StorageMode,
};
pub use error::{EngineError, Result};
pub use ingest::{BoundedSink, IngestSummary, IngestionPipeline, RecordSink, StoreSink};
pub use predicate::{FilterPredicate, ScanFilter, TimeRange};
pub use progress::{CancellationToken, ProgressSnapshot, ProgressTracker, Stage};
pub use record::{Dimension, Record};
pub use store::{LocalStore, ScanCursor, StoreStats};
pub use transfer::{
    HttpEndpoint, RemoteQueryEndpoint, TransferClient, TransferEndpoint, UploadOutcome,
    UploadServer,
};
