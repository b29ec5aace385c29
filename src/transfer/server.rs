//! Disk-backed upload server.
//!
//! ```text
//! <root>/uploads/<upload_id>/session.json
//! <root>/uploads/<upload_id>/part-000001
//! <root>/objects/<stored_file_id>.bin
//! <root>/objects/<stored_file_id>.json
//! <root>/datasets/<stored_file_id>/        local store index of the object
//! ```
//!
//! Sessions and parts survive a restart: [`UploadServer::open`] reloads every
//! session found under `uploads/`.

use std::collections::{BTreeSet, HashMap};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, OnceCell};
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::session::{SessionStatus, UploadSession};
use super::{
    CompleteUploadResponse, InitUploadRequest, InitUploadResponse, RemoteQueryEndpoint,
    TransferEndpoint, UploadSessionState,
};
use crate::aggregate::AggregateResult;
use crate::config::{IngestConfig, ServerConfig, StoreConfig, MIN_CHUNK_BYTES};
use crate::error::{EngineError, Result};
use crate::ingest::{IngestionPipeline, StoreSink};
use crate::predicate::FilterPredicate;
use crate::progress::CancellationToken;
use crate::record::{Dimension, Record};
use crate::store::LocalStore;

const SESSION_FILE: &str = "session.json";

/// Metadata written next to every stored object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredObjectMeta {
    pub stored_file_id: String,
    pub upload_id: String,
    pub original_name: String,
    pub content_type: Option<String>,
    pub size_bytes: u64,
    pub sha256_hex: String,
    pub created_at: DateTime<Utc>,
}

/// Server side of the resumable transfer protocol.
#[derive(Debug)]
pub struct UploadServer {
    config: ServerConfig,
    sessions: Mutex<HashMap<String, UploadSession>>,
    /// One cell per stored object, so indexing one dataset never blocks
    /// lookups of another.
    datasets: Mutex<HashMap<String, Arc<OnceCell<Arc<LocalStore>>>>>,
}

impl UploadServer {
    /// Open the server root, reloading persisted sessions.
    pub async fn open(config: ServerConfig) -> Result<Self> {
        for dir in ["uploads", "objects", "datasets"] {
            let path = config.root.join(dir);
            tokio::fs::create_dir_all(&path)
                .await
                .map_err(|e| EngineError::from_storage_io(e, &path))?;
        }

        let mut sessions = HashMap::new();
        let uploads = config.root.join("uploads");
        let mut entries = tokio::fs::read_dir(&uploads)
            .await
            .map_err(|e| EngineError::from_storage_io(e, &uploads))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path().join(SESSION_FILE);
            match tokio::fs::read(&path).await {
                Ok(bytes) => match serde_json::from_slice::<UploadSession>(&bytes) {
                    Ok(session) => {
                        sessions.insert(session.upload_id.clone(), session);
                    }
                    Err(e) => warn!(path = %path.display(), error = %e, "Ignoring corrupt session"),
                },
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(EngineError::from_storage_io(e, &path)),
            }
        }

        info!(
            root = %config.root.display(),
            sessions = sessions.len(),
            chunk_limit = config.chunk_limit(),
            "Upload server ready"
        );
        Ok(Self {
            config,
            sessions: Mutex::new(sessions),
            datasets: Mutex::new(HashMap::new()),
        })
    }

    pub fn config(&self) -> &ServerConfig {
        &self.config
    }

    fn upload_dir(&self, upload_id: &str) -> PathBuf {
        self.config.root.join("uploads").join(upload_id)
    }

    fn part_path(&self, upload_id: &str, part: u32) -> PathBuf {
        self.upload_dir(upload_id).join(format!("part-{part:06}"))
    }

    /// Path of a stored object's bytes.
    pub fn object_path(&self, stored_file_id: &str) -> PathBuf {
        self.config
            .root
            .join("objects")
            .join(format!("{stored_file_id}.bin"))
    }

    fn object_meta_path(&self, stored_file_id: &str) -> PathBuf {
        self.config
            .root
            .join("objects")
            .join(format!("{stored_file_id}.json"))
    }

    async fn persist(&self, session: &UploadSession) -> Result<()> {
        let dir = self.upload_dir(&session.upload_id);
        let path = dir.join(SESSION_FILE);
        let tmp = dir.join(format!("{SESSION_FILE}.tmp"));
        let bytes = serde_json::to_vec_pretty(session)?;
        tokio::fs::write(&tmp, bytes)
            .await
            .map_err(|e| EngineError::from_storage_io(e, &tmp))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .map_err(|e| EngineError::from_storage_io(e, &path))
    }

    async fn remove_parts(&self, session: &UploadSession) {
        for part in 1..=session.expected_parts {
            discard(&self.part_path(&session.upload_id, part)).await;
        }
    }

    async fn with_session<T>(
        &self,
        upload_id: &str,
        f: impl FnOnce(&UploadSession) -> Result<T>,
    ) -> Result<T> {
        let sessions = self.sessions.lock().await;
        let session = sessions
            .get(upload_id)
            .ok_or_else(|| EngineError::not_found(format!("upload session {upload_id}")))?;
        f(session)
    }

    /// Metadata of a stored object.
    pub async fn stored_object(&self, stored_file_id: &str) -> Result<StoredObjectMeta> {
        let path = self.object_meta_path(stored_file_id);
        match tokio::fs::read(&path).await {
            Ok(bytes) => Ok(serde_json::from_slice(&bytes)?),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(EngineError::not_found(
                format!("stored object {stored_file_id}"),
            )),
            Err(e) => Err(EngineError::from_storage_io(e, &path)),
        }
    }

    /// Abort sessions idle for longer than the configured TTL.
    ///
    /// Returns how many sessions were aborted. Completed sessions are left
    /// alone.
    pub async fn cleanup_expired(&self) -> Result<usize> {
        let cutoff = Utc::now() - Duration::seconds(self.config.session_ttl_secs as i64);
        let mut sessions = self.sessions.lock().await;
        let expired: Vec<String> = sessions
            .values()
            .filter(|s| s.status().accepts_parts() && !s.is_completing() && s.updated_at < cutoff)
            .map(|s| s.upload_id.clone())
            .collect();

        for upload_id in &expired {
            if let Some(session) = sessions.get_mut(upload_id) {
                session.transition(SessionStatus::Aborted)?;
                self.persist(session).await?;
                self.remove_parts(session).await;
                info!(upload_id = %upload_id, "Expired upload session aborted");
            }
        }
        Ok(expired.len())
    }

    /// Number of sessions still accepting parts.
    pub async fn active_sessions(&self) -> usize {
        self.sessions
            .lock()
            .await
            .values()
            .filter(|s| s.status().accepts_parts())
            .count()
    }

    /// Assemble the parts of `session` into a stored object and write its
    /// metadata. Returns the hex sha256 of the object. Nothing is left
    /// behind on failure.
    async fn store_object(&self, session: &UploadSession, stored_file_id: &str) -> Result<String> {
        let path = self.object_path(stored_file_id);
        let tmp = path.with_extension("bin.tmp");
        let sha256_hex = match self.concatenate(session, &tmp).await {
            Ok(sha256_hex) => sha256_hex,
            Err(e) => {
                discard(&tmp).await;
                return Err(e);
            }
        };
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            discard(&tmp).await;
            return Err(EngineError::from_storage_io(e, &path));
        }

        let meta = StoredObjectMeta {
            stored_file_id: stored_file_id.to_string(),
            upload_id: session.upload_id.clone(),
            original_name: session.original_name.clone(),
            content_type: session.content_type.clone(),
            size_bytes: session.size_bytes,
            sha256_hex: sha256_hex.clone(),
            created_at: Utc::now(),
        };
        let meta_path = self.object_meta_path(stored_file_id);
        let written = match serde_json::to_vec_pretty(&meta) {
            Ok(bytes) => tokio::fs::write(&meta_path, bytes)
                .await
                .map_err(|e| EngineError::from_storage_io(e, &meta_path)),
            Err(e) => Err(e.into()),
        };
        if let Err(e) = written {
            discard(&path).await;
            discard(&meta_path).await;
            return Err(e);
        }
        Ok(sha256_hex)
    }

    async fn concatenate(&self, session: &UploadSession, tmp: &Path) -> Result<String> {
        let mut file = tokio::fs::File::create(tmp)
            .await
            .map_err(|e| EngineError::from_storage_io(e, tmp))?;
        let mut hasher = Sha256::new();

        for part in 1..=session.expected_parts {
            let part_path = self.part_path(&session.upload_id, part);
            let bytes = tokio::fs::read(&part_path)
                .await
                .map_err(|e| EngineError::from_storage_io(e, &part_path))?;
            let (start, end) = session.part_range(part)?;
            if bytes.len() as u64 != end - start {
                return Err(EngineError::internal(format!(
                    "stored part {part} of upload {} has {} bytes, expected {}",
                    session.upload_id,
                    bytes.len(),
                    end - start
                )));
            }
            hasher.update(&bytes);
            file.write_all(&bytes)
                .await
                .map_err(|e| EngineError::from_storage_io(e, tmp))?;
        }
        file.flush()
            .await
            .map_err(|e| EngineError::from_storage_io(e, tmp))?;
        file.sync_all()
            .await
            .map_err(|e| EngineError::from_storage_io(e, tmp))?;
        Ok(format!("{:x}", hasher.finalize()))
    }

    // -- datasets -----------------------------------------------------------

    /// The sealed local-store index of a stored object, built on first use.
    ///
    /// Concurrent callers for the same object wait on one build. A failed
    /// build leaves the cell empty for the next caller to retry.
    pub async fn dataset(&self, stored_file_id: &str) -> Result<Arc<LocalStore>> {
        let cell = {
            let mut datasets = self.datasets.lock().await;
            Arc::clone(datasets.entry(stored_file_id.to_string()).or_default())
        };
        let store = cell
            .get_or_try_init(|| self.build_dataset(stored_file_id))
            .await?;
        Ok(Arc::clone(store))
    }

    async fn build_dataset(&self, stored_file_id: &str) -> Result<Arc<LocalStore>> {
        let meta = self.stored_object(stored_file_id).await?;
        let store = Arc::new(LocalStore::new(StoreConfig {
            max_size_bytes: self.config.dataset_max_bytes,
            ..StoreConfig::at(self.config.root.join("datasets").join(stored_file_id))
        }));
        store.init().await?;

        if !store.is_sealed() {
            if store.count()? > 0 {
                store.clear().await?;
            }
            let mut sink = StoreSink::new(Arc::clone(&store))?;
            let summary = IngestionPipeline::new(IngestConfig::default())
                .ingest_file(
                    &self.object_path(stored_file_id),
                    &mut sink,
                    &CancellationToken::new(),
                )
                .await?;
            store.seal().await?;
            info!(
                stored_file_id,
                name = %meta.original_name,
                rows = summary.rows_ingested,
                "Dataset indexed"
            );
        }
        Ok(store)
    }
}

async fn discard(path: &Path) {
    match tokio::fs::remove_file(path).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %path.display(), error = %e, "Failed to remove leftover file"),
    }
}

// ---------------------------------------------------------------------------
// Protocol
// ---------------------------------------------------------------------------

#[async_trait]
impl TransferEndpoint for UploadServer {
    async fn init_upload(&self, request: InitUploadRequest) -> Result<InitUploadResponse> {
        if request.size_bytes == 0 {
            return Err(EngineError::validation("sizeBytes must be greater than zero"));
        }
        let limit = self.config.chunk_limit();
        if request.chunk_size_bytes < MIN_CHUNK_BYTES || request.chunk_size_bytes > limit {
            return Err(EngineError::validation(format!(
                "chunkSizeBytes {} is outside [{MIN_CHUNK_BYTES}, {limit}]",
                request.chunk_size_bytes
            )));
        }

        let upload_id = Uuid::new_v4().to_string();
        let session = UploadSession::new(upload_id.clone(), &request)?;
        let dir = self.upload_dir(&upload_id);
        tokio::fs::create_dir_all(&dir)
            .await
            .map_err(|e| EngineError::from_storage_io(e, &dir))?;
        self.persist(&session).await?;

        let response = InitUploadResponse {
            upload_id: upload_id.clone(),
            expected_parts: session.expected_parts,
        };
        info!(
            upload_id = %upload_id,
            name = %request.original_name,
            size = request.size_bytes,
            parts = session.expected_parts,
            "Upload initiated"
        );
        self.sessions.lock().await.insert(upload_id, session);
        Ok(response)
    }

    async fn get_upload_session(&self, upload_id: &str) -> Result<UploadSessionState> {
        self.sessions
            .lock()
            .await
            .get(upload_id)
            .map(UploadSession::state)
            .ok_or_else(|| EngineError::not_found(format!("upload session {upload_id}")))
    }

    async fn put_part(&self, upload_id: &str, part: u32, bytes: Bytes) -> Result<()> {
        let len = bytes.len() as u64;
        self.with_session(upload_id, |session| session.validate_part(part, len))
            .await?;

        // Written under a unique name, then renamed over any previous copy
        // once the session is known to still take parts.
        let path = self.part_path(upload_id, part);
        let tmp = path.with_extension(format!("tmp-{}", Uuid::new_v4()));
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| EngineError::from_storage_io(e, &tmp))?;

        let mut sessions = self.sessions.lock().await;
        let recorded = match sessions.get_mut(upload_id) {
            Some(session) => session.validate_part(part, len).map(|()| session),
            None => Err(EngineError::not_found(format!("upload session {upload_id}"))),
        };
        let session = match recorded {
            Ok(session) => session,
            Err(e) => {
                discard(&tmp).await;
                return Err(e);
            }
        };
        if let Err(e) = tokio::fs::rename(&tmp, &path).await {
            discard(&tmp).await;
            return Err(EngineError::from_storage_io(e, &path));
        }
        session.record_part(part, len)?;
        self.persist(session).await?;
        debug!(upload_id, part, bytes = len, "Part stored");
        Ok(())
    }

    async fn complete_upload(
        &self,
        upload_id: &str,
        total_parts: u32,
    ) -> Result<CompleteUploadResponse> {
        let snapshot = {
            let mut sessions = self.sessions.lock().await;
            let session = sessions
                .get_mut(upload_id)
                .ok_or_else(|| EngineError::not_found(format!("upload session {upload_id}")))?;

            if total_parts != session.expected_parts {
                return Err(EngineError::validation(format!(
                    "upload {upload_id} expects {} parts, complete named {total_parts}",
                    session.expected_parts
                )));
            }
            match session.status() {
                SessionStatus::Completed => {
                    if let Some(stored_file_id) = session.stored_file_id.clone() {
                        return Ok(CompleteUploadResponse {
                            stored_file_id,
                            sha256_hex: session.sha256_hex.clone(),
                        });
                    }
                }
                SessionStatus::Aborted => {
                    return Err(EngineError::validation(format!(
                        "upload {upload_id} was aborted"
                    )));
                }
                SessionStatus::Initiated | SessionStatus::Receiving => {}
            }

            let missing = session.missing_parts();
            if !missing.is_empty() {
                return Err(EngineError::MissingParts {
                    upload_id: upload_id.to_string(),
                    missing,
                });
            }
            session.begin_completion()?;
            session.clone()
        };

        // Parts are frozen by the claim, so assembly runs without the lock.
        let stored_file_id = Uuid::new_v4().to_string();
        let assembled = self.store_object(&snapshot, &stored_file_id).await;

        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(upload_id)
            .ok_or_else(|| EngineError::not_found(format!("upload session {upload_id}")))?;
        session.finish_completion();
        let sha256_hex = assembled?;

        session.stored_file_id = Some(stored_file_id.clone());
        session.sha256_hex = Some(sha256_hex.clone());
        session.transition(SessionStatus::Completed)?;
        self.persist(session).await?;
        self.remove_parts(session).await;

        info!(
            upload_id,
            stored_file_id = %stored_file_id,
            sha256 = %sha256_hex,
            "Upload completed"
        );
        Ok(CompleteUploadResponse {
            stored_file_id,
            sha256_hex: Some(sha256_hex),
        })
    }

    async fn delete_upload(&self, upload_id: &str) -> Result<()> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(upload_id)
            .ok_or_else(|| EngineError::not_found(format!("upload session {upload_id}")))?;
        if session.is_completing() {
            return Err(EngineError::storage_busy(format!(
                "upload {upload_id} is being assembled"
            )));
        }
        session.transition(SessionStatus::Aborted)?;
        self.persist(session).await?;
        self.remove_parts(session).await;
        info!(upload_id, "Upload aborted");
        Ok(())
    }
}

#[async_trait]
impl RemoteQueryEndpoint for UploadServer {
    async fn aggregate(
        &self,
        stored_file_id: &str,
        predicate: &FilterPredicate,
    ) -> Result<AggregateResult> {
        predicate.validate()?;
        self.dataset(stored_file_id).await?.aggregate(predicate).await
    }

    async fn sample(
        &self,
        stored_file_id: &str,
        max_rows: usize,
        predicate: &FilterPredicate,
    ) -> Result<Vec<Record>> {
        predicate.validate()?;
        self.dataset(stored_file_id)
            .await?
            .sample(max_rows, predicate)
            .await
    }

    async fn distinct_values(
        &self,
        stored_file_id: &str,
        dimension: Dimension,
    ) -> Result<BTreeSet<String>> {
        self.dataset(stored_file_id)
            .await?
            .distinct_values(dimension)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::UploadEnvironment;
    use tempfile::TempDir;

    const MIB: u64 = 1024 * 1024;

    fn request(size: u64, chunk: u64) -> InitUploadRequest {
        InitUploadRequest {
            original_name: "tx.csv".into(),
            content_type: Some("text/csv".into()),
            size_bytes: size,
            chunk_size_bytes: chunk,
        }
    }

    async fn server(dir: &TempDir) -> UploadServer {
        UploadServer::open(ServerConfig::at(dir.path())).await.unwrap()
    }

    #[tokio::test]
    async fn test_init_validation() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir).await;

        assert!(server.init_upload(request(0, MIB)).await.is_err());
        assert!(server.init_upload(request(10 * MIB, MIB - 1)).await.is_err());
        assert!(server.init_upload(request(10 * MIB, 129 * MIB)).await.is_err());

        let init = server.init_upload(request(10 * MIB, 3 * MIB)).await.unwrap();
        assert_eq!(init.expected_parts, 4);
        let state = server.get_upload_session(&init.upload_id).await.unwrap();
        assert_eq!(state.status, SessionStatus::Initiated);
        assert!(state.received_parts.is_empty());
    }

    #[tokio::test]
    async fn test_constrained_environment_caps_chunks() {
        let dir = TempDir::new().unwrap();
        let server = UploadServer::open(ServerConfig {
            environment: UploadEnvironment::Constrained,
            ..ServerConfig::at(dir.path())
        })
        .await
        .unwrap();

        let err = server.init_upload(request(64 * MIB, 8 * MIB)).await.unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
        assert!(server.init_upload(request(64 * MIB, 4 * MIB)).await.is_ok());
    }

    #[tokio::test]
    async fn test_put_part_rejects_wrong_length_and_index() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir).await;
        let init = server.init_upload(request(MIB + 10, MIB)).await.unwrap();
        let id = &init.upload_id;

        let err = server
            .put_part(id, 1, Bytes::from(vec![0u8; 10]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
        assert!(server.put_part(id, 3, Bytes::from(vec![0u8; 10])).await.is_err());
        server.put_part(id, 2, Bytes::from(vec![0u8; 10])).await.unwrap();

        let state = server.get_upload_session(id).await.unwrap();
        assert_eq!(state.received_parts, vec![2]);
        assert_eq!(state.status, SessionStatus::Receiving);
    }

    #[tokio::test]
    async fn test_complete_reports_missing_parts() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir).await;
        let init = server.init_upload(request(2 * MIB + 1, MIB)).await.unwrap();
        server
            .put_part(&init.upload_id, 2, Bytes::from(vec![1u8; MIB as usize]))
            .await
            .unwrap();

        match server.complete_upload(&init.upload_id, 3).await {
            Err(EngineError::MissingParts { missing, .. }) => assert_eq!(missing, vec![1, 3]),
            other => panic!("expected missing parts, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn test_complete_is_idempotent_and_hashes() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir).await;
        let data: Vec<u8> = (0..(MIB + 7)).map(|i| (i % 251) as u8).collect();
        let init = server
            .init_upload(request(data.len() as u64, MIB))
            .await
            .unwrap();
        server
            .put_part(&init.upload_id, 1, Bytes::copy_from_slice(&data[..MIB as usize]))
            .await
            .unwrap();
        server
            .put_part(&init.upload_id, 2, Bytes::copy_from_slice(&data[MIB as usize..]))
            .await
            .unwrap();

        let first = server.complete_upload(&init.upload_id, 2).await.unwrap();
        let again = server.complete_upload(&init.upload_id, 2).await.unwrap();
        assert_eq!(first, again);

        let stored = std::fs::read(server.object_path(&first.stored_file_id)).unwrap();
        assert_eq!(stored, data);
        assert_eq!(
            first.sha256_hex.as_deref(),
            Some(format!("{:x}", Sha256::digest(&data)).as_str())
        );

        let meta = server.stored_object(&first.stored_file_id).await.unwrap();
        assert_eq!(meta.size_bytes, data.len() as u64);
        assert_eq!(meta.upload_id, init.upload_id);

        let err = server
            .put_part(&init.upload_id, 1, Bytes::copy_from_slice(&data[..MIB as usize]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
    }

    #[tokio::test]
    async fn test_delete_aborts_and_keeps_record() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir).await;
        let init = server.init_upload(request(MIB, MIB)).await.unwrap();
        server
            .put_part(&init.upload_id, 1, Bytes::from(vec![0u8; MIB as usize]))
            .await
            .unwrap();
        server.delete_upload(&init.upload_id).await.unwrap();

        let state = server.get_upload_session(&init.upload_id).await.unwrap();
        assert_eq!(state.status, SessionStatus::Aborted);
        assert!(!server.part_path(&init.upload_id, 1).exists());
        assert!(server.complete_upload(&init.upload_id, 1).await.is_err());
        assert!(server.delete_upload("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_cleanup_expired() {
        let dir = TempDir::new().unwrap();
        let server = UploadServer::open(ServerConfig {
            session_ttl_secs: 0,
            ..ServerConfig::at(dir.path())
        })
        .await
        .unwrap();
        let init = server.init_upload(request(MIB, MIB)).await.unwrap();
        tokio::time::sleep(std::time::Duration::from_millis(5)).await;

        assert_eq!(server.cleanup_expired().await.unwrap(), 1);
        assert_eq!(server.active_sessions().await, 0);
        let state = server.get_upload_session(&init.upload_id).await.unwrap();
        assert_eq!(state.status, SessionStatus::Aborted);
    }

    #[tokio::test]
    async fn test_dataset_queries_over_stored_object() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir).await;

        let mut csv = String::from("timestamp,amount,status,gateway,bank\n");
        while (csv.len() as u64) < MIB + 100 {
            csv.push_str("2024-01-02 10:00:00,100,SUCCESS,PAYU,HDFC\n");
            csv.push_str("2024-01-03 10:00:00,50,FAILED,RAZORPAY,ICICI\n");
        }
        let data = csv.into_bytes();
        let init = server
            .init_upload(request(data.len() as u64, MIB))
            .await
            .unwrap();
        server
            .put_part(&init.upload_id, 1, Bytes::copy_from_slice(&data[..MIB as usize]))
            .await
            .unwrap();
        server
            .put_part(&init.upload_id, 2, Bytes::copy_from_slice(&data[MIB as usize..]))
            .await
            .unwrap();
        let done = server.complete_upload(&init.upload_id, 2).await.unwrap();

        let aggregate = server
            .aggregate(&done.stored_file_id, &FilterPredicate::all())
            .await
            .unwrap();
        assert!(aggregate.total_count > 0);
        assert_eq!(aggregate.success_count + aggregate.failed_count, aggregate.total_count);
        assert_eq!(aggregate.daily.len(), 2);

        let banks = server
            .distinct_values(&done.stored_file_id, Dimension::Bank)
            .await
            .unwrap();
        assert_eq!(banks.len(), 2);

        let sample = server
            .sample(&done.stored_file_id, 3, &FilterPredicate::all())
            .await
            .unwrap();
        assert_eq!(sample.len(), 3);

        assert!(matches!(
            server.aggregate("nope", &FilterPredicate::all()).await,
            Err(EngineError::NotFound { .. })
        ));
    }

    #[tokio::test]
    async fn test_assembly_claim_refuses_parts_and_deletes() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir).await;
        let init = server.init_upload(request(2 * MIB, MIB)).await.unwrap();
        let other = server.init_upload(request(MIB, MIB)).await.unwrap();
        let id = &init.upload_id;
        server
            .put_part(id, 1, Bytes::from(vec![1u8; MIB as usize]))
            .await
            .unwrap();
        server
            .put_part(id, 2, Bytes::from(vec![2u8; MIB as usize]))
            .await
            .unwrap();

        server
            .sessions
            .lock()
            .await
            .get_mut(id.as_str())
            .unwrap()
            .begin_completion()
            .unwrap();

        let err = server
            .put_part(id, 1, Bytes::from(vec![9u8; MIB as usize]))
            .await
            .unwrap_err();
        assert!(matches!(err, EngineError::Validation { .. }));
        assert!(matches!(
            server.complete_upload(id, 2).await,
            Err(EngineError::StorageBusy { .. })
        ));
        assert!(matches!(
            server.delete_upload(id).await,
            Err(EngineError::StorageBusy { .. })
        ));
        assert!(server.get_upload_session(&other.upload_id).await.is_ok());

        // The refused part left no file behind and the stored copy is intact.
        let leftovers: Vec<_> = std::fs::read_dir(server.upload_dir(id))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .filter(|name| name.contains("tmp"))
            .collect();
        assert!(leftovers.is_empty(), "leftover files: {leftovers:?}");
        let part = std::fs::read(server.part_path(id, 1)).unwrap();
        assert!(part.iter().all(|&b| b == 1));

        server
            .sessions
            .lock()
            .await
            .get_mut(id.as_str())
            .unwrap()
            .finish_completion();
        let done = server.complete_upload(id, 2).await.unwrap();
        let stored = std::fs::read(server.object_path(&done.stored_file_id)).unwrap();
        assert_eq!(stored.len() as u64, 2 * MIB);
    }

    #[tokio::test]
    async fn test_concurrent_completes_store_one_object() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir).await;
        let init = server.init_upload(request(3 * MIB, MIB)).await.unwrap();
        for part in 1..=3u32 {
            server
                .put_part(&init.upload_id, part, Bytes::from(vec![part as u8; MIB as usize]))
                .await
                .unwrap();
        }

        let (a, b) = tokio::join!(
            server.complete_upload(&init.upload_id, 3),
            server.complete_upload(&init.upload_id, 3)
        );
        let ids: Vec<String> = [a, b]
            .into_iter()
            .filter_map(|r| match r {
                Ok(done) => Some(done.stored_file_id),
                Err(EngineError::StorageBusy { .. }) => None,
                Err(e) => panic!("unexpected {e}"),
            })
            .collect();
        assert!(!ids.is_empty());
        assert!(ids.iter().all(|id| id == &ids[0]));

        let objects: Vec<_> = std::fs::read_dir(dir.path().join("objects"))
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().into_owned())
            .collect();
        assert_eq!(objects.len(), 2, "objects: {objects:?}");
        assert!(objects.iter().all(|name| !name.ends_with(".tmp")));
    }

    #[tokio::test]
    async fn test_failed_assembly_leaves_no_temp_object() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir).await;
        let init = server.init_upload(request(2 * MIB, MIB)).await.unwrap();
        let id = &init.upload_id;
        for part in 1..=2u32 {
            server
                .put_part(id, part, Bytes::from(vec![0u8; MIB as usize]))
                .await
                .unwrap();
        }
        std::fs::write(server.part_path(id, 2), b"truncated").unwrap();

        let err = server.complete_upload(id, 2).await.unwrap_err();
        assert!(matches!(err, EngineError::Internal { .. }));
        assert_eq!(std::fs::read_dir(dir.path().join("objects")).unwrap().count(), 0);

        let state = server.get_upload_session(id).await.unwrap();
        assert_eq!(state.status, SessionStatus::Receiving);
        server
            .put_part(id, 2, Bytes::from(vec![0u8; MIB as usize]))
            .await
            .unwrap();
        assert!(server.complete_upload(id, 2).await.is_ok());
    }

    #[tokio::test]
    async fn test_concurrent_dataset_builds_share_one_index() {
        let dir = TempDir::new().unwrap();
        let server = server(&dir).await;
        let mut csv = String::from("timestamp,amount,status,gateway\n");
        while (csv.len() as u64) < MIB {
            csv.push_str("2024-01-02 10:00:00,100,SUCCESS,PAYU\n");
        }
        let data = csv.into_bytes();
        let init = server
            .init_upload(request(data.len() as u64, MIB))
            .await
            .unwrap();
        let mut part = 1;
        for chunk in data.chunks(MIB as usize) {
            server
                .put_part(&init.upload_id, part, Bytes::copy_from_slice(chunk))
                .await
                .unwrap();
            part += 1;
        }
        let done = server
            .complete_upload(&init.upload_id, part - 1)
            .await
            .unwrap();

        let (a, b, missing) = tokio::join!(
            server.dataset(&done.stored_file_id),
            server.dataset(&done.stored_file_id),
            server.dataset("nope")
        );
        assert!(Arc::ptr_eq(&a.unwrap(), &b.unwrap()));
        assert!(matches!(missing, Err(EngineError::NotFound { .. })));
        assert!(matches!(
            server.dataset("nope").await,
            Err(EngineError::NotFound { .. })
        ));
    }
}
