//! txnlens CLI - serve uploads, push files resumably, query datasets

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use chrono::DateTime;
use clap::{Args, Parser, Subcommand};
use indicatif::{ProgressBar, ProgressStyle};
use tracing::{info, warn};

use txnlens::transfer::serve;
use txnlens::{
    CancellationToken, Dimension, EngineConfig, EngineError, FilterPredicate, HttpEndpoint,
    Orchestrator, ProgressTracker, RecomputeOutcome, Result, Stage, TransferClient,
    UploadEnvironment, UploadOutcome, UploadServer,
};

#[derive(Debug, Parser)]
#[command(name = "txnlens", version, about = "Large transaction dataset ingestion and analytics")]
struct Cli {
    /// TOML configuration file
    #[arg(long, global = true, env = "TXNLENS_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Run the upload server
    Serve(ServeArgs),
    /// Upload a file to a server, resuming where a previous attempt stopped
    Upload(UploadArgs),
    /// Load a file and print its aggregate under a filter
    Query(QueryArgs),
}

#[derive(Debug, Args)]
struct ServeArgs {
    /// Directory for sessions, parts and stored objects
    #[arg(long)]
    root: Option<PathBuf>,
    #[arg(long, default_value = "127.0.0.1:8080")]
    addr: SocketAddr,
    /// Cap chunk sizes for small request-body environments
    #[arg(long)]
    constrained: bool,
}

#[derive(Debug, Args)]
struct UploadArgs {
    file: PathBuf,
    /// Server base URL
    #[arg(long, env = "TXNLENS_SERVER")]
    server: String,
    /// Part size in bytes
    #[arg(long)]
    chunk_size: Option<u64>,
    /// Upload id of an interrupted upload to resume
    #[arg(long)]
    resume: Option<String>,
    /// Where to remember upload ids for automatic resume
    #[arg(long)]
    ledger: Option<PathBuf>,
}

#[derive(Debug, Args)]
struct QueryArgs {
    file: PathBuf,
    /// Inclusive start, RFC 3339
    #[arg(long)]
    from: Option<String>,
    /// Inclusive end, RFC 3339
    #[arg(long)]
    to: Option<String>,
    /// Keep only these gateways (repeatable)
    #[arg(long)]
    gateway: Vec<String>,
    /// Also print up to N matching records
    #[arg(long)]
    sample: Option<usize>,
    /// Delegate large files to this server
    #[arg(long, env = "TXNLENS_SERVER")]
    server: Option<String>,
    /// Local store directory for files too large for memory
    #[arg(long, env = "TXNLENS_STORE")]
    store: Option<PathBuf>,
}

/// Local store used when neither `--store` nor the config names one.
const DEFAULT_STORE_DIR: &str = "txnlens-data/store";

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let result = run(cli).await;
    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    match cli.command {
        Commands::Serve(args) => run_serve(config, args).await,
        Commands::Upload(args) => run_upload(config, args).await,
        Commands::Query(args) => run_query(config, args).await,
    }
}

fn cancel_on_ctrl_c() -> CancellationToken {
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("Interrupted, stopping after the current step");
            token.cancel();
        }
    });
    cancel
}

// ---------------------------------------------------------------------------
// serve
// ---------------------------------------------------------------------------

async fn run_serve(config: EngineConfig, args: ServeArgs) -> Result<()> {
    let mut server_config = config.server;
    if let Some(root) = args.root {
        server_config.root = root;
    }
    if args.constrained {
        server_config.environment = UploadEnvironment::Constrained;
    }
    let sweep_every = Duration::from_secs((server_config.session_ttl_secs / 4).clamp(60, 3600));
    let server = Arc::new(UploadServer::open(server_config).await?);

    let sweeper = {
        let server = Arc::clone(&server);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(sweep_every);
            loop {
                interval.tick().await;
                match server.cleanup_expired().await {
                    Ok(0) => {}
                    Ok(n) => info!(aborted = n, "Swept expired upload sessions"),
                    Err(e) => warn!(error = %e, "Session sweep failed"),
                }
            }
        })
    };

    let listener = tokio::net::TcpListener::bind(args.addr).await?;
    serve(server, listener, async {
        let _ = tokio::signal::ctrl_c().await;
        info!("Shutting down");
    })
    .await?;
    sweeper.abort();
    Ok(())
}

// ---------------------------------------------------------------------------
// upload
// ---------------------------------------------------------------------------

fn progress_bar(progress: &ProgressTracker) -> tokio::task::JoinHandle<()> {
    let mut rx = progress.subscribe();
    tokio::spawn(async move {
        let bar = ProgressBar::new(0);
        if let Ok(style) = ProgressStyle::with_template(
            "{spinner} {msg:12} {bar:40.green/blue} {bytes}/{total_bytes} ({bytes_per_sec}, {eta})",
        ) {
            bar.set_style(style.progress_chars("██ "));
        }
        loop {
            let snapshot = *rx.borrow_and_update();
            bar.set_length(snapshot.total);
            bar.set_position(snapshot.processed);
            bar.set_message(snapshot.stage.to_string());
            if snapshot.stage == Stage::Complete {
                break;
            }
            if rx.changed().await.is_err() {
                break;
            }
        }
        bar.finish();
    })
}

async fn run_upload(config: EngineConfig, args: UploadArgs) -> Result<()> {
    let mut transfer = config.transfer;
    if let Some(chunk_size) = args.chunk_size {
        transfer.chunk_size_bytes = chunk_size;
    }
    if args.ledger.is_some() {
        transfer.ledger_path = args.ledger;
    }

    let endpoint = Arc::new(HttpEndpoint::new(&args.server)?);
    let progress = ProgressTracker::default();
    let client = TransferClient::new(endpoint, transfer).with_progress(progress.clone());
    let bar = progress_bar(&progress);
    let cancel = cancel_on_ctrl_c();

    let outcome = client
        .upload_file(&args.file, args.resume.as_deref(), &cancel)
        .await;
    drop(client);
    drop(progress);
    let _ = bar.await;

    match outcome? {
        UploadOutcome::Completed {
            upload_id,
            stored_file_id,
            sha256_hex,
        } => {
            println!("upload_id:      {upload_id}");
            println!("stored_file_id: {stored_file_id}");
            if let Some(hash) = sha256_hex {
                println!("sha256:         {hash}");
            }
            Ok(())
        }
        UploadOutcome::Cancelled {
            upload_id,
            received_parts,
        } => {
            eprintln!(
                "Upload {upload_id} paused with {} parts on the server; rerun with --resume {upload_id}",
                received_parts.len()
            );
            Err(EngineError::Cancelled)
        }
    }
}

// ---------------------------------------------------------------------------
// query
// ---------------------------------------------------------------------------

fn parse_instant(value: Option<&str>) -> Result<Option<i64>> {
    value
        .map(|v| {
            DateTime::parse_from_rfc3339(v)
                .map(|dt| dt.timestamp_millis())
                .map_err(|e| EngineError::validation(format!("Invalid RFC 3339 time {v}: {e}")))
        })
        .transpose()
}

fn resolve_store_root(config: &mut EngineConfig, store: Option<PathBuf>) {
    match store {
        Some(root) => config.store.root = Some(root),
        None => {
            config
                .store
                .root
                .get_or_insert_with(|| PathBuf::from(DEFAULT_STORE_DIR));
        }
    }
}

async fn run_query(mut config: EngineConfig, args: QueryArgs) -> Result<()> {
    resolve_store_root(&mut config, args.store.clone());
    let mut orchestrator = Orchestrator::new(config);
    if let Some(server) = &args.server {
        let endpoint = Arc::new(HttpEndpoint::new(server)?);
        orchestrator = orchestrator.with_remote(endpoint.clone(), endpoint);
    }

    let progress = ProgressTracker::default();
    let bar = progress_bar(&progress);
    let report = orchestrator
        .load_file_with(&args.file, &progress, &cancel_on_ctrl_c())
        .await;
    progress.finish();
    let _ = bar.await;
    let report = report?;
    if let Some(degradation) = &report.degradation {
        warn!(%degradation, "Results are degraded");
    }
    eprintln!("{}", serde_json::to_string_pretty(&report)?);

    let from = parse_instant(args.from.as_deref())?;
    let to = parse_instant(args.to.as_deref())?;
    let mut predicate = FilterPredicate::all();
    if from.is_some() || to.is_some() {
        predicate = predicate.with_time_range(from, to);
    }
    if !args.gateway.is_empty() {
        predicate = predicate.with_values(Dimension::Gateway, args.gateway);
    }

    let view = match orchestrator.apply_filter(predicate).await? {
        RecomputeOutcome::Applied(view) => view,
        RecomputeOutcome::Superseded => return Err(EngineError::Cancelled),
    };
    println!("{}", serde_json::to_string_pretty(&view.aggregate)?);

    if let Some(n) = args.sample {
        let sample = orchestrator.get_sample(n).await?;
        for record in &sample.records {
            println!("{}", serde_json::to_string(record)?);
        }
        eprintln!("{} of up to {n} records", sample.records.len());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn query_args(argv: &[&str]) -> QueryArgs {
        let cli = Cli::try_parse_from(argv).unwrap();
        match cli.command {
            Commands::Query(args) => args,
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_store_flag_sets_root() {
        let args = query_args(&["txnlens", "query", "tx.csv", "--store", "/tmp/txnlens-store"]);
        let mut config = EngineConfig::default();
        config.store.root = Some(PathBuf::from("/from/config"));
        resolve_store_root(&mut config, args.store);
        assert_eq!(config.store.root, Some(PathBuf::from("/tmp/txnlens-store")));
    }

    #[test]
    fn test_store_root_defaults_when_unset() {
        let args = query_args(&["txnlens", "query", "tx.csv"]);
        let mut config = EngineConfig::default();
        resolve_store_root(&mut config, args.store);
        assert_eq!(config.store.root, Some(PathBuf::from(DEFAULT_STORE_DIR)));

        let mut config = EngineConfig::default();
        config.store.root = Some(PathBuf::from("/from/config"));
        resolve_store_root(&mut config, None);
        assert_eq!(config.store.root, Some(PathBuf::from("/from/config")));
    }
}
