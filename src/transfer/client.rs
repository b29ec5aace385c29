//! Resumable upload client.

use std::collections::BTreeSet;
use std::future::Future;
use std::io::SeekFrom;
use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use backoff::future::retry_notify;
use backoff::{Error as BackoffError, ExponentialBackoffBuilder};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::{debug, info, instrument, warn};

use super::ledger::{LedgerEntry, ResumeLedger};
use super::session::SessionStatus;
use super::{
    expected_parts, part_range, InitUploadRequest, TransferEndpoint, UploadSessionState,
};
use crate::config::TransferConfig;
use crate::error::{EngineError, Result, TransferShape};
use crate::progress::{CancellationToken, ProgressTracker, Stage};

/// How an upload call ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum UploadOutcome {
    Completed {
        upload_id: String,
        stored_file_id: String,
        sha256_hex: Option<String>,
    },
    /// Stopped by the cancellation token. The session is kept for resume.
    Cancelled {
        upload_id: String,
        received_parts: Vec<u32>,
    },
}

impl UploadOutcome {
    pub fn upload_id(&self) -> &str {
        match self {
            UploadOutcome::Completed { upload_id, .. } | UploadOutcome::Cancelled { upload_id, .. } => {
                upload_id
            }
        }
    }

    pub fn stored_file_id(&self) -> Option<&str> {
        match self {
            UploadOutcome::Completed { stored_file_id, .. } => Some(stored_file_id),
            UploadOutcome::Cancelled { .. } => None,
        }
    }
}

/// Uploads files part by part through a [`TransferEndpoint`].
///
/// Parts are sent strictly in sequence. A failing part is retried with
/// exponential backoff; the transfer as a whole is never restarted.
pub struct TransferClient {
    endpoint: Arc<dyn TransferEndpoint>,
    config: TransferConfig,
    progress: ProgressTracker,
}

impl std::fmt::Debug for TransferClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransferClient")
            .field("config", &self.config)
            .finish()
    }
}

struct LocalFile {
    size_bytes: u64,
    modified_ms: i64,
}

impl TransferClient {
    pub fn new(endpoint: Arc<dyn TransferEndpoint>, config: TransferConfig) -> Self {
        Self {
            endpoint,
            config,
            progress: ProgressTracker::default(),
        }
    }

    pub fn with_progress(mut self, progress: ProgressTracker) -> Self {
        self.progress = progress;
        self
    }

    pub fn progress(&self) -> &ProgressTracker {
        &self.progress
    }

    pub fn config(&self) -> &TransferConfig {
        &self.config
    }

    /// Run `op` until it succeeds, fails permanently or runs out of attempts.
    async fn with_retry<T, F, Fut>(&self, what: &str, mut op: F) -> Result<T>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let max_attempts = self.config.max_attempts.max(1);
        let attempt = AtomicU32::new(0);
        let backoff = ExponentialBackoffBuilder::new()
            .with_initial_interval(Duration::from_millis(self.config.initial_backoff_ms))
            .with_multiplier(2.0)
            .with_randomization_factor(0.2)
            .with_max_interval(Duration::from_millis(self.config.max_backoff_ms))
            .with_max_elapsed_time(None)
            .build();

        retry_notify(
            backoff,
            || {
                let n = attempt.fetch_add(1, Ordering::Relaxed) + 1;
                let call = op();
                async move {
                    match call.await {
                        Ok(value) => Ok(value),
                        Err(err) if err.is_retryable() && n < max_attempts => {
                            Err(BackoffError::transient(err))
                        }
                        Err(err) => Err(BackoffError::permanent(err)),
                    }
                }
            },
            |err: EngineError, wait: Duration| {
                warn!(
                    what,
                    attempt = attempt.load(Ordering::Relaxed),
                    max_attempts,
                    retry_in_ms = wait.as_millis() as u64,
                    error = %err,
                    "Retrying transfer step"
                );
            },
        )
        .await
    }

    async fn inspect(path: &Path) -> Result<LocalFile> {
        let meta = tokio::fs::metadata(path)
            .await
            .map_err(|e| EngineError::from_storage_io(e, path))?;
        let modified_ms = meta
            .modified()
            .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
            .unwrap_or(0);
        Ok(LocalFile {
            size_bytes: meta.len(),
            modified_ms,
        })
    }

    /// Find the session to resume, if any. `None` means start fresh.
    async fn resume_state(
        &self,
        upload_id: &str,
        file: &LocalFile,
    ) -> Result<Option<UploadSessionState>> {
        let state = match self.endpoint.get_upload_session(upload_id).await {
            Ok(state) => state,
            Err(EngineError::NotFound { .. }) => {
                warn!(upload_id, "Upload session is gone, starting over");
                return Ok(None);
            }
            Err(e) => return Err(e),
        };

        if state.size_bytes != file.size_bytes
            || state.chunk_size_bytes != self.config.chunk_size_bytes
        {
            return Err(EngineError::ResumeMismatch {
                upload_id: upload_id.to_string(),
                local: TransferShape {
                    size_bytes: file.size_bytes,
                    chunk_size_bytes: self.config.chunk_size_bytes,
                },
                session: TransferShape {
                    size_bytes: state.size_bytes,
                    chunk_size_bytes: state.chunk_size_bytes,
                },
            });
        }
        if state.status == SessionStatus::Aborted {
            info!(upload_id, "Upload session was aborted, starting over");
            return Ok(None);
        }
        Ok(Some(state))
    }

    /// Upload `path`, resuming `resume_upload_id` (or the ledger's entry for
    /// the file) when given.
    ///
    /// A resume whose session no longer matches the local file's size or the
    /// configured chunk size fails with [`EngineError::ResumeMismatch`].
    #[instrument(skip_all, fields(path = %path.display()))]
    pub async fn upload_file(
        &self,
        path: &Path,
        resume_upload_id: Option<&str>,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome> {
        let file = Self::inspect(path).await?;
        if file.size_bytes == 0 {
            return Err(EngineError::validation(format!(
                "{} is empty",
                path.display()
            )));
        }

        let mut ledger = match &self.config.ledger_path {
            Some(ledger_path) => Some(ResumeLedger::open(ledger_path)?),
            None => None,
        };
        let candidate = resume_upload_id.map(str::to_string).or_else(|| {
            ledger
                .as_ref()
                .and_then(|l| l.lookup(path, file.size_bytes, file.modified_ms))
                .map(|e| e.upload_id.clone())
        });

        let resumed = match &candidate {
            Some(upload_id) => self.resume_state(upload_id, &file).await?,
            None => None,
        };

        let state = match resumed {
            Some(state) => {
                info!(
                    upload_id = %state.upload_id,
                    received = state.received_parts.len(),
                    expected = state.expected_parts,
                    "Resuming upload"
                );
                state
            }
            None => {
                let name = path
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
                    .unwrap_or_else(|| "upload".to_string());
                let request = InitUploadRequest {
                    original_name: name,
                    content_type: Some("text/csv".to_string()),
                    size_bytes: file.size_bytes,
                    chunk_size_bytes: self.config.chunk_size_bytes,
                };
                let init = self
                    .with_retry("init", || self.endpoint.init_upload(request.clone()))
                    .await?;
                if let Some(ledger) = ledger.as_mut() {
                    ledger.record(
                        path,
                        LedgerEntry {
                            upload_id: init.upload_id.clone(),
                            size_bytes: file.size_bytes,
                            modified_ms: file.modified_ms,
                            chunk_size_bytes: self.config.chunk_size_bytes,
                        },
                    )?;
                }
                UploadSessionState {
                    upload_id: init.upload_id,
                    size_bytes: file.size_bytes,
                    chunk_size_bytes: self.config.chunk_size_bytes,
                    expected_parts: init.expected_parts,
                    received_bytes: 0,
                    received_parts: Vec::new(),
                    status: SessionStatus::Initiated,
                    stored_file_id: None,
                }
            }
        };

        let upload_id = state.upload_id.clone();
        match self.transfer_parts(path, state, cancel).await {
            Ok(outcome) => {
                if matches!(outcome, UploadOutcome::Completed { .. }) {
                    if let Some(ledger) = ledger.as_mut() {
                        ledger.forget(path)?;
                    }
                    self.progress.finish();
                }
                Ok(outcome)
            }
            Err(err) => {
                if self.config.delete_on_fatal {
                    warn!(upload_id = %upload_id, error = %err, "Deleting upload after fatal error");
                    if let Err(e) = self.endpoint.delete_upload(&upload_id).await {
                        warn!(upload_id = %upload_id, error = %e, "Failed to delete upload");
                    }
                    if let Some(ledger) = ledger.as_mut() {
                        ledger.forget(path)?;
                    }
                }
                Err(err)
            }
        }
    }

    async fn transfer_parts(
        &self,
        path: &Path,
        state: UploadSessionState,
        cancel: &CancellationToken,
    ) -> Result<UploadOutcome> {
        let upload_id = state.upload_id;
        if state.status == SessionStatus::Completed {
            if let Some(stored_file_id) = state.stored_file_id {
                return Ok(UploadOutcome::Completed {
                    upload_id,
                    stored_file_id,
                    sha256_hex: None,
                });
            }
        }

        let size = state.size_bytes;
        let chunk = state.chunk_size_bytes;
        let parts = u32::try_from(expected_parts(size, chunk))
            .map_err(|_| EngineError::validation("too many parts"))?;
        let mut received: BTreeSet<u32> = state.received_parts.into_iter().collect();

        self.progress.set_total(size);
        self.progress.update(state.received_bytes, Stage::Uploading);

        let mut file = tokio::fs::File::open(path)
            .await
            .map_err(|e| EngineError::from_storage_io(e, path))?;

        for part in 1..=parts {
            if received.contains(&part) {
                continue;
            }
            if cancel.is_cancelled() {
                info!(upload_id = %upload_id, next_part = part, "Upload cancelled, session kept");
                return Ok(UploadOutcome::Cancelled {
                    upload_id,
                    received_parts: received.into_iter().collect(),
                });
            }

            let (start, end) = part_range(part, chunk, size);
            let mut buf = vec![0u8; (end - start) as usize];
            file.seek(SeekFrom::Start(start))
                .await
                .map_err(|e| EngineError::from_storage_io(e, path))?;
            file.read_exact(&mut buf).await.map_err(|e| {
                EngineError::transfer_at(
                    format!("reading local file failed: {e}"),
                    upload_id.clone(),
                    Some(part),
                    Some((start, end)),
                )
            })?;
            let bytes = Bytes::from(buf);

            self.with_retry("put_part", || {
                self.endpoint.put_part(&upload_id, part, bytes.clone())
            })
            .await
            .map_err(|e| match e {
                EngineError::Transfer { message, .. } => EngineError::transfer_at(
                    message,
                    upload_id.clone(),
                    Some(part),
                    Some((start, end)),
                ),
                other => other,
            })?;

            received.insert(part);
            self.progress.advance(end - start, Stage::Uploading);
            debug!(upload_id = %upload_id, part, start, end, "Part uploaded");
        }

        let done = self
            .with_retry("complete", || self.endpoint.complete_upload(&upload_id, parts))
            .await?;
        info!(
            upload_id = %upload_id,
            stored_file_id = %done.stored_file_id,
            "Upload complete"
        );
        Ok(UploadOutcome::Completed {
            upload_id,
            stored_file_id: done.stored_file_id,
            sha256_hex: done.sha256_hex,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::transfer::{CompleteUploadResponse, InitUploadResponse, UploadServer};
    use async_trait::async_trait;
    use parking_lot::Mutex;
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    /// Delegates to a real server, failing the first `failures` part uploads.
    struct Flaky {
        inner: UploadServer,
        failures: Mutex<u32>,
        puts: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl TransferEndpoint for Flaky {
        async fn init_upload(&self, request: InitUploadRequest) -> Result<InitUploadResponse> {
            self.inner.init_upload(request).await
        }

        async fn get_upload_session(&self, upload_id: &str) -> Result<UploadSessionState> {
            self.inner.get_upload_session(upload_id).await
        }

        async fn put_part(&self, upload_id: &str, part: u32, bytes: Bytes) -> Result<()> {
            {
                let mut failures = self.failures.lock();
                if *failures > 0 {
                    *failures -= 1;
                    return Err(EngineError::transfer("connection reset"));
                }
            }
            self.puts.lock().push(part);
            self.inner.put_part(upload_id, part, bytes).await
        }

        async fn complete_upload(
            &self,
            upload_id: &str,
            total_parts: u32,
        ) -> Result<CompleteUploadResponse> {
            self.inner.complete_upload(upload_id, total_parts).await
        }

        async fn delete_upload(&self, upload_id: &str) -> Result<()> {
            self.inner.delete_upload(upload_id).await
        }
    }

    fn fast_config() -> TransferConfig {
        TransferConfig {
            chunk_size_bytes: MIB,
            max_attempts: 3,
            initial_backoff_ms: 1,
            max_backoff_ms: 5,
            ..Default::default()
        }
    }

    async fn flaky(dir: &TempDir, failures: u32) -> Arc<Flaky> {
        Arc::new(Flaky {
            inner: UploadServer::open(ServerConfig::at(dir.path().join("server")))
                .await
                .unwrap(),
            failures: Mutex::new(failures),
            puts: Mutex::new(Vec::new()),
        })
    }

    fn write_file(dir: &TempDir, len: usize) -> (std::path::PathBuf, Vec<u8>) {
        let data: Vec<u8> = (0..len).map(|i| (i % 253) as u8).collect();
        let path = dir.path().join("data.csv");
        std::fs::write(&path, &data).unwrap();
        (path, data)
    }

    #[tokio::test]
    async fn test_retries_transient_part_failures() {
        let dir = TempDir::new().unwrap();
        let endpoint = flaky(&dir, 2).await;
        let (path, data) = write_file(&dir, (2 * MIB + 3) as usize);

        let client = TransferClient::new(endpoint.clone(), fast_config());
        let outcome = client
            .upload_file(&path, None, &CancellationToken::new())
            .await
            .unwrap();

        let stored_file_id = outcome.stored_file_id().unwrap();
        let stored = std::fs::read(endpoint.inner.object_path(stored_file_id)).unwrap();
        assert_eq!(stored, data);
        assert_eq!(*endpoint.puts.lock(), vec![1, 2, 3]);
        assert_eq!(client.progress().snapshot().stage, Stage::Complete);
    }

    #[tokio::test]
    async fn test_gives_up_after_max_attempts() {
        let dir = TempDir::new().unwrap();
        let endpoint = flaky(&dir, 10).await;
        let (path, _) = write_file(&dir, MIB as usize);

        let client = TransferClient::new(endpoint.clone(), fast_config());
        let err = client
            .upload_file(&path, None, &CancellationToken::new())
            .await
            .unwrap_err();
        match err {
            EngineError::Transfer { context, .. } => {
                let context = context.unwrap();
                assert_eq!(context.part, Some(1));
                assert_eq!(context.byte_range, Some((0, MIB)));
            }
            other => panic!("expected transfer error, got {other:?}"),
        }
        assert_eq!(*endpoint.failures.lock(), 7);
        assert_eq!(endpoint.inner.active_sessions().await, 1);
    }

    #[tokio::test]
    async fn test_delete_on_fatal_is_opt_in() {
        let dir = TempDir::new().unwrap();
        let endpoint = flaky(&dir, 10).await;
        let (path, _) = write_file(&dir, MIB as usize);

        let client = TransferClient::new(
            endpoint.clone(),
            TransferConfig {
                delete_on_fatal: true,
                ..fast_config()
            },
        );
        assert!(client
            .upload_file(&path, None, &CancellationToken::new())
            .await
            .is_err());
        assert_eq!(endpoint.inner.active_sessions().await, 0);
    }

    #[tokio::test]
    async fn test_resume_mismatch_is_refused() {
        let dir = TempDir::new().unwrap();
        let endpoint = flaky(&dir, 0).await;
        let (path, _) = write_file(&dir, (MIB + 1) as usize);

        let init = endpoint
            .init_upload(InitUploadRequest {
                original_name: "data.csv".into(),
                content_type: None,
                size_bytes: MIB + 2,
                chunk_size_bytes: MIB,
            })
            .await
            .unwrap();

        let client = TransferClient::new(endpoint.clone(), fast_config());
        let err = client
            .upload_file(&path, Some(&init.upload_id), &CancellationToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::ResumeMismatch { .. }));
        assert!(endpoint.puts.lock().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_keeps_session_and_ledger_resumes() {
        let dir = TempDir::new().unwrap();
        let endpoint = flaky(&dir, 0).await;
        let (path, data) = write_file(&dir, (3 * MIB) as usize);
        let config = TransferConfig {
            ledger_path: Some(dir.path().join("ledger.json")),
            ..fast_config()
        };

        let cancel = CancellationToken::new();
        cancel.cancel();
        let client = TransferClient::new(endpoint.clone(), config.clone());
        let outcome = client.upload_file(&path, None, &cancel).await.unwrap();
        let upload_id = match outcome {
            UploadOutcome::Cancelled {
                upload_id,
                received_parts,
            } => {
                assert!(received_parts.is_empty());
                upload_id
            }
            other => panic!("expected cancellation, got {other:?}"),
        };
        endpoint
            .inner
            .put_part(&upload_id, 2, Bytes::copy_from_slice(&data[MIB as usize..2 * MIB as usize]))
            .await
            .unwrap();

        let client = TransferClient::new(endpoint.clone(), config);
        let outcome = client
            .upload_file(&path, None, &CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(outcome.upload_id(), upload_id);
        assert_eq!(*endpoint.puts.lock(), vec![1, 3]);

        let stored = std::fs::read(endpoint.inner.object_path(outcome.stored_file_id().unwrap()))
            .unwrap();
        assert_eq!(stored, data);
        assert!(ResumeLedger::open(dir.path().join("ledger.json"))
            .unwrap()
            .is_empty());
    }
}
