//! Resumable chunked transfer protocol.
//!
//! A three-phase protocol (init, parts, complete) that moves a large file
//! to a server without ever restarting from zero:
//!
//! 1. **Init** declares the file size and a fixed chunk size and returns an
//!    upload id plus `expected_parts = ceil(size / chunk)`.
//! 2. **Parts** are uploaded strictly in sequence by 1-based index. Each part
//!    carries exactly `[(i-1)*chunk, min(i*chunk, size))`. Re-sending a part
//!    overwrites it with identical bytes.
//! 3. **Complete** verifies every part is present, concatenates them into a
//!    hash-verified stored object and marks the session completed.
//!
//! [`TransferEndpoint`] is implemented by the in-process [`UploadServer`] and
//! by [`HttpEndpoint`], so [`TransferClient`] works against either.

mod client;
mod http;
mod ledger;
mod server;
mod session;

pub use client::{TransferClient, UploadOutcome};
pub use http::{router, serve, ErrorBody, ErrorDetails, HttpEndpoint};
pub use ledger::{LedgerEntry, ResumeLedger};
pub use server::{StoredObjectMeta, UploadServer};
pub use session::{SessionStatus, UploadSession};

use std::collections::BTreeSet;

use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};

use crate::aggregate::AggregateResult;
use crate::error::Result;
use crate::predicate::FilterPredicate;
use crate::record::{Dimension, Record};

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadRequest {
    pub original_name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_type: Option<String>,
    pub size_bytes: u64,
    pub chunk_size_bytes: u64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct InitUploadResponse {
    pub upload_id: String,
    pub expected_parts: u32,
}

/// Server view of an upload session, as returned by `GetUploadSession`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadSessionState {
    pub upload_id: String,
    pub size_bytes: u64,
    pub chunk_size_bytes: u64,
    pub expected_parts: u32,
    pub received_bytes: u64,
    /// Ascending.
    pub received_parts: Vec<u32>,
    pub status: SessionStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stored_file_id: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadRequest {
    pub total_parts: u32,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CompleteUploadResponse {
    pub stored_file_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sha256_hex: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SampleRequest {
    pub max_rows: usize,
    #[serde(default)]
    pub predicate: FilterPredicate,
}

/// Number of parts a file of `size_bytes` splits into.
pub fn expected_parts(size_bytes: u64, chunk_size_bytes: u64) -> u64 {
    size_bytes.div_ceil(chunk_size_bytes.max(1))
}

/// Byte range `[start, end)` carried by 1-based `part`.
pub fn part_range(part: u32, chunk_size_bytes: u64, size_bytes: u64) -> (u64, u64) {
    let start = (u64::from(part).saturating_sub(1)) * chunk_size_bytes;
    let end = (start + chunk_size_bytes).min(size_bytes);
    (start.min(size_bytes), end)
}

// ---------------------------------------------------------------------------
// Endpoints
// ---------------------------------------------------------------------------

/// The server side of the transfer protocol.
#[async_trait]
pub trait TransferEndpoint: Send + Sync {
    async fn init_upload(&self, request: InitUploadRequest) -> Result<InitUploadResponse>;

    async fn get_upload_session(&self, upload_id: &str) -> Result<UploadSessionState>;

    async fn put_part(&self, upload_id: &str, part: u32, bytes: Bytes) -> Result<()>;

    async fn complete_upload(
        &self,
        upload_id: &str,
        total_parts: u32,
    ) -> Result<CompleteUploadResponse>;

    async fn delete_upload(&self, upload_id: &str) -> Result<()>;
}

/// Queries answered by the server against a stored object.
#[async_trait]
pub trait RemoteQueryEndpoint: Send + Sync {
    async fn aggregate(
        &self,
        stored_file_id: &str,
        predicate: &FilterPredicate,
    ) -> Result<AggregateResult>;

    async fn sample(
        &self,
        stored_file_id: &str,
        max_rows: usize,
        predicate: &FilterPredicate,
    ) -> Result<Vec<Record>>;

    async fn distinct_values(
        &self,
        stored_file_id: &str,
        dimension: Dimension,
    ) -> Result<BTreeSet<String>>;
}
