//! HTTP binding of the transfer protocol and remote queries.
//!
//! ```text
//! POST   /api/v1/uploads                               init
//! GET    /api/v1/uploads/{upload_id}                   session state
//! DELETE /api/v1/uploads/{upload_id}                   abort
//! PUT    /api/v1/uploads/{upload_id}/parts/{index}     part bytes
//! POST   /api/v1/uploads/{upload_id}/complete          complete
//! POST   /api/v1/datasets/{stored_id}/aggregate        FilterPredicate
//! POST   /api/v1/datasets/{stored_id}/sample           SampleRequest
//! GET    /api/v1/datasets/{stored_id}/distinct/{dim}   distinct values
//! ```
//!
//! Errors travel as an [`ErrorBody`] with the HTTP status of the error kind.

use std::collections::BTreeSet;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::{DefaultBodyLimit, Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use bytes::Bytes;
use reqwest::{Client as HttpClient, RequestBuilder, Url};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::net::TcpListener;
use tracing::{debug, info, instrument};

use super::{
    CompleteUploadRequest, CompleteUploadResponse, InitUploadRequest, InitUploadResponse,
    RemoteQueryEndpoint, SampleRequest, TransferEndpoint, UploadServer, UploadSessionState,
};
use crate::aggregate::AggregateResult;
use crate::error::{EngineError, Result, TransferContext, TransferShape};
use crate::predicate::FilterPredicate;
use crate::record::{Dimension, Record};

/// Headroom over the chunk limit for request framing.
const BODY_LIMIT_SLACK: usize = 64 * 1024;

// ---------------------------------------------------------------------------
// Error body
// ---------------------------------------------------------------------------

/// JSON error payload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ErrorBody {
    pub code: u16,
    /// Error kind, see [`EngineError::kind`].
    pub error: String,
    pub message: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub upload_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub missing: Option<Vec<u32>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<ErrorDetails>,
}

/// Variant payload the client needs to rebuild the exact error.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ErrorDetails {
    ResumeMismatch {
        local: TransferShape,
        session: TransferShape,
    },
    EmptyInput {
        rows_seen: u64,
        rows_skipped: u64,
    },
    StaleGeneration {
        expected: u64,
        current: u64,
    },
    Transfer {
        context: TransferContext,
    },
}

impl EngineError {
    /// HTTP status this error is reported with.
    pub fn http_status(&self) -> StatusCode {
        match self {
            EngineError::Validation { .. } | EngineError::ResumeMismatch { .. } => {
                StatusCode::BAD_REQUEST
            }
            EngineError::NotFound { .. } => StatusCode::NOT_FOUND,
            EngineError::MissingParts { .. } | EngineError::StaleGeneration { .. } => {
                StatusCode::CONFLICT
            }
            EngineError::EmptyOrUnparseableInput { .. } => StatusCode::UNPROCESSABLE_ENTITY,
            EngineError::StorageBusy { .. }
            | EngineError::StorageUnavailable { .. }
            | EngineError::Transfer { .. }
            | EngineError::Cancelled => StatusCode::SERVICE_UNAVAILABLE,
            EngineError::QuotaExceeded { .. } => StatusCode::INSUFFICIENT_STORAGE,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_body(&self) -> ErrorBody {
        let status = self.http_status();
        let mut body = ErrorBody {
            code: status.as_u16(),
            error: self.kind().to_string(),
            message: self.to_string(),
            upload_id: None,
            missing: None,
            details: None,
        };
        match self {
            EngineError::MissingParts { upload_id, missing } => {
                body.upload_id = Some(upload_id.clone());
                body.missing = Some(missing.clone());
            }
            EngineError::ResumeMismatch {
                upload_id,
                local,
                session,
            } => {
                body.upload_id = Some(upload_id.clone());
                body.details = Some(ErrorDetails::ResumeMismatch {
                    local: *local,
                    session: *session,
                });
            }
            EngineError::EmptyOrUnparseableInput {
                rows_seen,
                rows_skipped,
            } => {
                body.details = Some(ErrorDetails::EmptyInput {
                    rows_seen: *rows_seen,
                    rows_skipped: *rows_skipped,
                });
            }
            EngineError::StaleGeneration { expected, current } => {
                body.details = Some(ErrorDetails::StaleGeneration {
                    expected: *expected,
                    current: *current,
                });
            }
            EngineError::Transfer {
                context: Some(context),
                ..
            } => {
                body.upload_id = Some(context.upload_id.clone());
                body.details = Some(ErrorDetails::Transfer {
                    context: context.clone(),
                });
            }
            _ => {}
        }
        body
    }
}

impl IntoResponse for EngineError {
    fn into_response(self) -> Response {
        let body = self.error_body();
        (self.http_status(), Json(body)).into_response()
    }
}

impl ErrorBody {
    /// Rebuild the engine error a server reported.
    ///
    /// Kinds whose payload is missing degrade to the closest message-only
    /// variant with the same retry behavior.
    fn into_error(self) -> EngineError {
        match (self.error.as_str(), self.details) {
            ("resume_mismatch", Some(ErrorDetails::ResumeMismatch { local, session })) => {
                EngineError::ResumeMismatch {
                    upload_id: self.upload_id.unwrap_or_default(),
                    local,
                    session,
                }
            }
            (
                "empty_or_unparseable_input",
                Some(ErrorDetails::EmptyInput {
                    rows_seen,
                    rows_skipped,
                }),
            ) => EngineError::EmptyOrUnparseableInput {
                rows_seen,
                rows_skipped,
            },
            ("stale_generation", Some(ErrorDetails::StaleGeneration { expected, current })) => {
                EngineError::StaleGeneration { expected, current }
            }
            ("transfer", Some(ErrorDetails::Transfer { context })) => EngineError::Transfer {
                message: self.message,
                context: Some(context),
            },
            ("cancelled", _) => EngineError::Cancelled,
            ("validation" | "resume_mismatch" | "empty_or_unparseable_input", _) => {
                EngineError::validation(self.message)
            }
            ("not_found", _) => EngineError::not_found(self.message),
            ("missing_parts", _) => EngineError::MissingParts {
                upload_id: self.upload_id.unwrap_or_default(),
                missing: self.missing.unwrap_or_default(),
            },
            ("quota_exceeded", _) => EngineError::quota_exceeded(self.message),
            ("storage_busy", _) => EngineError::storage_busy(self.message),
            ("storage_unavailable", _) => EngineError::storage_unavailable(self.message),
            _ if self.code >= 500 => EngineError::transfer(self.message),
            _ => EngineError::internal(self.message),
        }
    }
}

// ---------------------------------------------------------------------------
// Server
// ---------------------------------------------------------------------------

type ApiResult<T> = std::result::Result<Json<T>, EngineError>;

/// Build the HTTP router for `server`.
pub fn router(server: Arc<UploadServer>) -> Router {
    let body_limit = usize::try_from(server.config().chunk_limit())
        .unwrap_or(usize::MAX)
        .saturating_add(BODY_LIMIT_SLACK);

    Router::new()
        .route("/api/v1/uploads", post(init_upload))
        .route(
            "/api/v1/uploads/{upload_id}",
            get(get_upload_session).delete(delete_upload),
        )
        .route("/api/v1/uploads/{upload_id}/parts/{index}", put(put_part))
        .route("/api/v1/uploads/{upload_id}/complete", post(complete_upload))
        .route("/api/v1/datasets/{stored_id}/aggregate", post(aggregate))
        .route("/api/v1/datasets/{stored_id}/sample", post(sample))
        .route(
            "/api/v1/datasets/{stored_id}/distinct/{dimension}",
            get(distinct_values),
        )
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(server)
}

/// Serve `server` on `listener` until `shutdown` resolves.
pub async fn serve<F>(server: Arc<UploadServer>, listener: TcpListener, shutdown: F) -> Result<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    let addr = listener.local_addr()?;
    info!(%addr, root = %server.config().root.display(), "Listening");
    axum::serve(listener, router(server))
        .with_graceful_shutdown(shutdown)
        .await?;
    info!("Server stopped");
    Ok(())
}

async fn init_upload(
    State(server): State<Arc<UploadServer>>,
    Json(request): Json<InitUploadRequest>,
) -> ApiResult<InitUploadResponse> {
    server.init_upload(request).await.map(Json)
}

async fn get_upload_session(
    State(server): State<Arc<UploadServer>>,
    Path(upload_id): Path<String>,
) -> ApiResult<UploadSessionState> {
    server.get_upload_session(&upload_id).await.map(Json)
}

#[instrument(skip_all, fields(upload_id = %upload_id, part = index))]
async fn put_part(
    State(server): State<Arc<UploadServer>>,
    Path((upload_id, index)): Path<(String, u32)>,
    body: Bytes,
) -> std::result::Result<StatusCode, EngineError> {
    server.put_part(&upload_id, index, body).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip_all, fields(upload_id = %upload_id))]
async fn complete_upload(
    State(server): State<Arc<UploadServer>>,
    Path(upload_id): Path<String>,
    Json(request): Json<CompleteUploadRequest>,
) -> ApiResult<CompleteUploadResponse> {
    server
        .complete_upload(&upload_id, request.total_parts)
        .await
        .map(Json)
}

#[instrument(skip_all, fields(upload_id = %upload_id))]
async fn delete_upload(
    State(server): State<Arc<UploadServer>>,
    Path(upload_id): Path<String>,
) -> std::result::Result<StatusCode, EngineError> {
    server.delete_upload(&upload_id).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[instrument(skip_all, fields(stored_id = %stored_id))]
async fn aggregate(
    State(server): State<Arc<UploadServer>>,
    Path(stored_id): Path<String>,
    Json(predicate): Json<FilterPredicate>,
) -> ApiResult<AggregateResult> {
    RemoteQueryEndpoint::aggregate(server.as_ref(), &stored_id, &predicate)
        .await
        .map(Json)
}

#[instrument(skip_all, fields(stored_id = %stored_id))]
async fn sample(
    State(server): State<Arc<UploadServer>>,
    Path(stored_id): Path<String>,
    Json(request): Json<SampleRequest>,
) -> ApiResult<Vec<Record>> {
    RemoteQueryEndpoint::sample(
        server.as_ref(),
        &stored_id,
        request.max_rows,
        &request.predicate,
    )
    .await
    .map(Json)
}

async fn distinct_values(
    State(server): State<Arc<UploadServer>>,
    Path((stored_id, dimension)): Path<(String, String)>,
) -> ApiResult<BTreeSet<String>> {
    let dimension: Dimension = dimension.parse()?;
    RemoteQueryEndpoint::distinct_values(server.as_ref(), &stored_id, dimension)
        .await
        .map(Json)
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

/// A remote server reached over HTTP.
#[derive(Debug, Clone)]
pub struct HttpEndpoint {
    /// Base URL of the server, ending in `/`.
    base: Url,
    client: HttpClient,
}

impl HttpEndpoint {
    pub fn new(base: &str) -> Result<Self> {
        let mut base = base.to_string();
        if !base.ends_with('/') {
            base.push('/');
        }
        let base = Url::parse(&base)
            .map_err(|e| EngineError::validation(format!("Invalid server URL {base}: {e}")))?;
        let client = HttpClient::builder()
            .user_agent(concat!("txnlens/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(|e| EngineError::internal(format!("HTTP client setup failed: {e}")))?;
        Ok(Self { base, client })
    }

    pub fn base(&self) -> &Url {
        &self.base
    }

    fn url(&self, path: &str) -> Result<Url> {
        self.base
            .join(path)
            .map_err(|e| EngineError::validation(format!("Invalid request path {path}: {e}")))
    }

    async fn send(&self, request: RequestBuilder) -> Result<reqwest::Response> {
        let response = request
            .send()
            .await
            .map_err(|e| EngineError::transfer(format!("request failed: {e}")))?;
        if response.status().is_success() {
            return Ok(response);
        }

        let status = response.status();
        let text = response
            .text()
            .await
            .map_err(|e| EngineError::transfer(format!("reading error body failed: {e}")))?;
        Err(match serde_json::from_str::<ErrorBody>(&text) {
            Ok(body) => body.into_error(),
            Err(_) if status.is_server_error() => {
                EngineError::transfer(format!("HTTP {status}: {text}"))
            }
            Err(_) => EngineError::validation(format!("HTTP {status}: {text}")),
        })
    }

    async fn send_json<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        self.send(request)
            .await?
            .json()
            .await
            .map_err(|e| EngineError::transfer(format!("decoding response failed: {e}")))
    }
}

#[async_trait]
impl TransferEndpoint for HttpEndpoint {
    async fn init_upload(&self, request: InitUploadRequest) -> Result<InitUploadResponse> {
        let url = self.url("api/v1/uploads")?;
        self.send_json(self.client.post(url).json(&request)).await
    }

    async fn get_upload_session(&self, upload_id: &str) -> Result<UploadSessionState> {
        let url = self.url(&format!("api/v1/uploads/{upload_id}"))?;
        self.send_json(self.client.get(url)).await
    }

    async fn put_part(&self, upload_id: &str, part: u32, bytes: Bytes) -> Result<()> {
        let url = self.url(&format!("api/v1/uploads/{upload_id}/parts/{part}"))?;
        debug!(upload_id, part, bytes = bytes.len(), "PUT part");
        self.send(
            self.client
                .put(url)
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(bytes),
        )
        .await?;
        Ok(())
    }

    async fn complete_upload(
        &self,
        upload_id: &str,
        total_parts: u32,
    ) -> Result<CompleteUploadResponse> {
        let url = self.url(&format!("api/v1/uploads/{upload_id}/complete"))?;
        self.send_json(
            self.client
                .post(url)
                .json(&CompleteUploadRequest { total_parts }),
        )
        .await
    }

    async fn delete_upload(&self, upload_id: &str) -> Result<()> {
        let url = self.url(&format!("api/v1/uploads/{upload_id}"))?;
        self.send(self.client.delete(url)).await?;
        Ok(())
    }
}

#[async_trait]
impl RemoteQueryEndpoint for HttpEndpoint {
    async fn aggregate(
        &self,
        stored_file_id: &str,
        predicate: &FilterPredicate,
    ) -> Result<AggregateResult> {
        let url = self.url(&format!("api/v1/datasets/{stored_file_id}/aggregate"))?;
        self.send_json(self.client.post(url).json(predicate)).await
    }

    async fn sample(
        &self,
        stored_file_id: &str,
        max_rows: usize,
        predicate: &FilterPredicate,
    ) -> Result<Vec<Record>> {
        let url = self.url(&format!("api/v1/datasets/{stored_file_id}/sample"))?;
        let request = SampleRequest {
            max_rows,
            predicate: predicate.clone(),
        };
        self.send_json(self.client.post(url).json(&request)).await
    }

    async fn distinct_values(
        &self,
        stored_file_id: &str,
        dimension: Dimension,
    ) -> Result<BTreeSet<String>> {
        let url = self.url(&format!(
            "api/v1/datasets/{stored_file_id}/distinct/{dimension}"
        ))?;
        self.send_json(self.client.get(url)).await
    }
}
