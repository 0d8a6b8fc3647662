//! HTTP surface: router construction, authentication middleware, request
//! ids, error mapping, and upload body handling.
//!
//! Handlers return `Result<_, ApiError>`; conversions from component errors
//! pick the right status class (400 validation, 401 auth, 404 not found,
//! 503 transient backend, 500 permanent). A middleware assigns each request
//! a correlation id which is echoed in error bodies and the
//! `x-request-id` response header.

mod chunks;
mod documents;
mod search;
mod tubs;

use crate::auth::{self, AuthError};
use crate::blob::{BlobError, BlobStore};
use crate::chunker::ChunkerError;
use crate::config::Config;
use crate::convert::ConvertError;
use crate::embedding::{EmbedError, Embedder};
use crate::filter::FilterError;
use crate::pipeline::{Pipeline, PipelineError};
use crate::queue::QueueError;
use crate::store::{MetaStore, StoreError};
use axum::body::{Body, to_bytes};
use axum::extract::{FromRequestParts, Request, State};
use axum::http::header::{CONTENT_LENGTH, HeaderValue};
use axum::http::{StatusCode, request::Parts};
use axum::middleware::{self, Next};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::{Json, Router};
use bytes::{Bytes, BytesMut};
use futures::StreamExt;
use serde_json::json;
use std::io::Read;
use std::sync::Arc;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tower_http::trace::TraceLayer;
use uuid::Uuid;

/// Shared application state handed to every handler.
pub struct AppState {
    /// Parsed service configuration.
    pub config: Config,
    /// Metadata store.
    pub store: MetaStore,
    /// Blob store.
    pub blobs: Arc<BlobStore>,
    /// Embedding client.
    pub embedder: Arc<Embedder>,
    /// Ingestion pipeline.
    pub pipeline: Arc<Pipeline>,
}

/// Error returned by HTTP handlers, mapped onto a status class.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    /// 400: the request itself is malformed.
    pub fn validation(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }

    /// 401: missing or insufficient credentials.
    pub fn auth(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::UNAUTHORIZED,
            message: message.into(),
        }
    }

    /// 404: the addressed resource does not exist.
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::NOT_FOUND,
            message: message.into(),
        }
    }

    /// 503: a backing service failed in a retryable way.
    pub fn transient(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::SERVICE_UNAVAILABLE,
            message: message.into(),
        }
    }

    /// 500: the request cannot succeed no matter how often it is retried.
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::INTERNAL_SERVER_ERROR,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ApiError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(json!({ "error": self.message }))).into_response()
    }
}

impl From<StoreError> for ApiError {
    fn from(err: StoreError) -> Self {
        match &err {
            StoreError::InvalidTubName
            | StoreError::InvalidDocumentId(_)
            | StoreError::MissingRequiredHeader(_)
            | StoreError::DocumentsMissingHeaders(_)
            | StoreError::VectorDimensionMismatch { .. }
            | StoreError::MissingEmbeddingColumn(_) => Self::validation(err.to_string()),
            StoreError::NotFound(_) => Self::not_found(err.to_string()),
            StoreError::PermissionDenied => Self::auth(err.to_string()),
            StoreError::Database(_) | StoreError::Migrate(_) => Self::transient(err.to_string()),
            StoreError::InvalidModelName
            | StoreError::InvalidModelDimensions { .. }
            | StoreError::EmbeddingCountMismatch { .. } => Self::internal(err.to_string()),
        }
    }
}

impl From<BlobError> for ApiError {
    fn from(err: BlobError) -> Self {
        match &err {
            BlobError::NotFound(_) => Self::not_found(err.to_string()),
            BlobError::Store(_) | BlobError::PrefixDelete { .. } => {
                Self::transient(err.to_string())
            }
        }
    }
}

impl From<EmbedError> for ApiError {
    fn from(err: EmbedError) -> Self {
        Self::transient(err.to_string())
    }
}

impl From<QueueError> for ApiError {
    fn from(err: QueueError) -> Self {
        Self::transient(err.to_string())
    }
}

impl From<FilterError> for ApiError {
    fn from(err: FilterError) -> Self {
        Self::validation(err.to_string())
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        Self::auth(err.to_string())
    }
}

impl From<ConvertError> for ApiError {
    fn from(err: ConvertError) -> Self {
        Self::internal(err.to_string())
    }
}

impl From<ChunkerError> for ApiError {
    fn from(err: ChunkerError) -> Self {
        Self::internal(err.to_string())
    }
}

impl From<PipelineError> for ApiError {
    fn from(err: PipelineError) -> Self {
        match err {
            PipelineError::Store(inner) => inner.into(),
            PipelineError::Blob(inner) => inner.into(),
            PipelineError::Queue(inner) => inner.into(),
            PipelineError::Convert(inner) => inner.into(),
            PipelineError::Chunker(inner) => inner.into(),
            PipelineError::Embed(inner) => inner.into(),
            other => Self::internal(other.to_string()),
        }
    }
}

/// Access key resolved from the request's bearer, stored in extensions by
/// the auth middleware and extracted by handlers.
#[derive(Debug, Clone)]
pub struct AccessKey(
    /// The resolved `rag_<uuid>` access key.
    pub String,
);

impl<S> FromRequestParts<S> for AccessKey
where
    S: Send + Sync,
{
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        parts
            .extensions
            .get::<AccessKey>()
            .cloned()
            .ok_or_else(|| ApiError::auth("no access token was provided"))
    }
}

/// Correlation id assigned to every request.
#[derive(Debug, Clone)]
pub struct RequestId(
    /// UUID echoed in error bodies and the `x-request-id` header.
    pub String,
);

/// Build the full application router.
pub fn create_router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/tubs", get(tubs::list_tubs).post(tubs::create_tub))
        .route(
            "/tubs/{tub}",
            get(tubs::get_tub).put(tubs::update_tub).delete(tubs::delete_tub),
        )
        .route(
            "/tubs/{tub}/documents",
            get(documents::list_documents).post(documents::create_document),
        )
        .route(
            "/tubs/{tub}/documents/{document_id}",
            get(documents::get_document)
                .put(documents::update_document)
                .delete(documents::delete_document),
        )
        .route(
            "/tubs/{tub}/documents/{document_id}/download",
            get(documents::download_document),
        )
        .route(
            "/tubs/{tub}/documents/{document_id}/download/markdown",
            get(documents::download_document_markdown),
        )
        .route(
            "/tubs/{tub}/documents/{document_id}/status",
            get(documents::document_status),
        )
        .route(
            "/tubs/{tub}/documents/{document_id}/chunks",
            get(chunks::list_chunks),
        )
        .route(
            "/tubs/{tub}/document/{document_id}/chunks/{index}",
            get(chunks::get_chunk),
        )
        .route("/search/xnn/{tub}", get(search::search_xnn))
        .route("/ping", get(ping))
        .route("/ping/db", get(ping_db))
        .route("/.well-known/openapi.json", get(openapi))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            resolve_access_key,
        ))
        .layer(middleware::from_fn(request_context))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

async fn ping() -> &'static str {
    "pong"
}

async fn ping_db(State(state): State<Arc<AppState>>) -> Result<&'static str, ApiError> {
    state.store.ping().await?;
    Ok("pong")
}

/// Minimal machine-readable description of the HTTP surface.
async fn openapi(State(state): State<Arc<AppState>>) -> Json<serde_json::Value> {
    Json(json!({
        "openapi": "3.0.0",
        "info": {
            "title": "Ragnar API",
            "description": "RAG API for retrieving internal information for AI use",
            "version": "1.0.0"
        },
        "servers": [{ "url": state.config.http_uri }],
        "paths": {
            "/tubs": {},
            "/tubs/{tub}": {},
            "/tubs/{tub}/documents": {},
            "/tubs/{tub}/documents/{document_id}": {},
            "/tubs/{tub}/documents/{document_id}/download": {},
            "/tubs/{tub}/documents/{document_id}/download/markdown": {},
            "/tubs/{tub}/documents/{document_id}/status": {},
            "/tubs/{tub}/documents/{document_id}/chunks": {},
            "/tubs/{tub}/document/{document_id}/chunks/{index}": {},
            "/search/xnn/{tub}": {},
            "/ping": {},
            "/ping/db": {}
        }
    }))
}

/// Assign a request id, log failures with it, and echo it both as a header
/// and inside JSON error bodies.
async fn request_context(mut request: Request, next: Next) -> Response {
    let request_id = Uuid::new_v4().to_string();
    request.extensions_mut().insert(RequestId(request_id.clone()));

    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let response = next.run(request).await;
    let status = response.status();

    let mut response = if status.is_client_error() || status.is_server_error() {
        annotate_error_body(response, &request_id, &method, &path).await
    } else {
        response
    };

    if let Ok(value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    response
}

async fn annotate_error_body(
    response: Response,
    request_id: &str,
    method: &axum::http::Method,
    path: &str,
) -> Response {
    let status = response.status();
    let (mut parts, body) = response.into_parts();
    let Ok(bytes) = to_bytes(body, 256 * 1024).await else {
        return Response::from_parts(parts, Body::empty());
    };

    let message = match serde_json::from_slice::<serde_json::Value>(&bytes) {
        Ok(value) => value
            .get("error")
            .and_then(|e| e.as_str())
            .unwrap_or_default()
            .to_string(),
        Err(_) => String::from_utf8_lossy(&bytes).trim().to_string(),
    };
    if status.is_server_error() {
        tracing::error!(request_id, %method, path, status = status.as_u16(), error = %message, "Request failed");
    } else {
        tracing::warn!(request_id, %method, path, status = status.as_u16(), error = %message, "Request rejected");
    }

    let annotated = match serde_json::from_slice::<serde_json::Value>(&bytes) {
        Ok(serde_json::Value::Object(mut map)) => {
            map.insert("request_id".to_string(), json!(request_id));
            serde_json::to_vec(&serde_json::Value::Object(map)).unwrap_or_else(|_| bytes.to_vec())
        }
        _ => bytes.to_vec(),
    };
    parts.headers.remove(CONTENT_LENGTH);
    Response::from_parts(parts, Body::from(annotated))
}

/// Resolve the `Authorization: Bearer ..` header to an access key.
///
/// Raw `rag_<uuid>` bearers pass through directly; JWT bearers resolve
/// their `kid` to a stored token and must verify against its secret. An
/// unresolvable bearer is simply not attached, so the first ACL check in a
/// handler answers 401 for it.
async fn resolve_access_key(
    State(state): State<Arc<AppState>>,
    mut request: Request,
    next: Next,
) -> Response {
    let bearer = request
        .headers()
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer "))
        .map(str::to_owned);

    if let Some(bearer) = bearer {
        if auth::is_access_key(&bearer) {
            request.extensions_mut().insert(AccessKey(bearer));
        } else {
            match resolve_jwt_bearer(&state.store, &bearer).await {
                Ok(access_key) => {
                    request.extensions_mut().insert(AccessKey(access_key));
                }
                Err(err) => {
                    tracing::warn!(error = %err, "Failed to resolve bearer");
                }
            }
        }
    }
    next.run(request).await
}

async fn resolve_jwt_bearer(store: &MetaStore, bearer: &str) -> Result<String, ApiError> {
    let key_id = auth::jwt_key_id(bearer)?;
    let token = store.access_token_by_key_id(&key_id).await?;
    auth::verify_jwt(&token.access_key, bearer)?;
    Ok(token.access_key)
}

/// Read an upload body while enforcing the configured size limit.
///
/// Bodies exactly at the limit are rejected so truncation can never pass
/// unnoticed. When no content length was declared the stream is spooled to
/// a temp file to learn it before the bytes are handed on. Gzip content
/// encoding is decoded after spooling, with the decompressed size held to
/// the same limit.
pub(crate) async fn read_upload_body(
    body: Body,
    declared_length: Option<u64>,
    gzip: bool,
    limit: u64,
) -> Result<Bytes, ApiError> {
    let too_large = || {
        ApiError::validation(format!("Request body is too large, max {} bytes", limit - 1))
    };

    if declared_length.is_some_and(|len| len >= limit) {
        return Err(too_large());
    }

    let raw = match declared_length {
        Some(_) => collect_stream(body, limit).await?,
        None => spool_stream(body, limit).await?,
    };

    if !gzip {
        return Ok(raw);
    }

    enum GzipFailure {
        TooLarge,
        Corrupt(std::io::Error),
    }

    let decompressed = tokio::task::spawn_blocking(move || -> Result<Vec<u8>, GzipFailure> {
        let mut decoder = flate2::read::GzDecoder::new(raw.as_ref());
        let mut out = Vec::new();
        let mut buffer = [0u8; 64 * 1024];
        loop {
            let n = decoder.read(&mut buffer).map_err(GzipFailure::Corrupt)?;
            if n == 0 {
                break;
            }
            out.extend_from_slice(&buffer[..n]);
            if out.len() as u64 >= limit {
                return Err(GzipFailure::TooLarge);
            }
        }
        Ok(out)
    })
    .await
    .map_err(|e| ApiError::internal(format!("gzip worker failed: {e}")))?;

    match decompressed {
        Ok(data) => Ok(Bytes::from(data)),
        Err(GzipFailure::TooLarge) => Err(too_large()),
        Err(GzipFailure::Corrupt(err)) => {
            Err(ApiError::validation(format!("error decoding gzip body: {err}")))
        }
    }
}

async fn collect_stream(body: Body, limit: u64) -> Result<Bytes, ApiError> {
    let mut stream = body.into_data_stream();
    let mut collected = BytesMut::new();
    while let Some(frame) = stream.next().await {
        let frame = frame.map_err(|e| ApiError::validation(format!("failed to read request body: {e}")))?;
        collected.extend_from_slice(&frame);
        if collected.len() as u64 >= limit {
            return Err(ApiError::validation(format!(
                "Request body is too large, max {} bytes",
                limit - 1
            )));
        }
    }
    Ok(collected.freeze())
}

async fn spool_stream(body: Body, limit: u64) -> Result<Bytes, ApiError> {
    let spool = tempfile::tempfile()
        .map_err(|e| ApiError::internal(format!("failed to create temporary file: {e}")))?;
    let mut file = tokio::fs::File::from_std(spool);

    let mut stream = body.into_data_stream();
    let mut written: u64 = 0;
    while let Some(frame) = stream.next().await {
        let frame = frame.map_err(|e| ApiError::validation(format!("failed to read request body: {e}")))?;
        written += frame.len() as u64;
        if written >= limit {
            return Err(ApiError::validation(format!(
                "Request body is too large, max {} bytes",
                limit - 1
            )));
        }
        file.write_all(&frame)
            .await
            .map_err(|e| ApiError::internal(format!("failed to spool request body: {e}")))?;
    }

    file.rewind()
        .await
        .map_err(|e| ApiError::internal(format!("failed to rewind spool file: {e}")))?;
    let mut data = Vec::with_capacity(written as usize);
    file.read_to_end(&mut data)
        .await
        .map_err(|e| ApiError::internal(format!("failed to read spool file: {e}")))?;
    Ok(Bytes::from(data))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn body_at_limit_is_rejected_and_below_accepted() {
        let limit = 16u64;
        let at_limit = Body::from(vec![b'x'; 16]);
        let err = read_upload_body(at_limit, Some(16), false, limit).await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
        assert!(err.message.contains("max 15 bytes"));

        let below = Body::from(vec![b'x'; 15]);
        let data = read_upload_body(below, Some(15), false, limit).await.unwrap();
        assert_eq!(data.len(), 15);
    }

    #[tokio::test]
    async fn unknown_length_body_is_spooled_and_measured() {
        let body = Body::from("spooled contents");
        let data = read_upload_body(body, None, false, 1024).await.unwrap();
        assert_eq!(&data[..], b"spooled contents");
    }

    #[tokio::test]
    async fn unknown_length_body_still_honors_limit() {
        let body = Body::from(vec![b'y'; 32]);
        let err = read_upload_body(body, None, false, 32).await.unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn gzip_bodies_are_decoded() {
        use flate2::{Compression, write::GzEncoder};
        use std::io::Write;

        let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
        encoder.write_all(b"hello gzip").unwrap();
        let compressed = encoder.finish().unwrap();
        let declared = compressed.len() as u64;

        let data = read_upload_body(Body::from(compressed), Some(declared), true, 1024)
            .await
            .unwrap();
        assert_eq!(&data[..], b"hello gzip");
    }

    #[tokio::test]
    async fn corrupt_gzip_is_a_validation_error() {
        let err = read_upload_body(Body::from("not gzip"), Some(8), true, 1024)
            .await
            .unwrap_err();
        assert_eq!(err.status, StatusCode::BAD_REQUEST);
    }

    #[test]
    fn store_errors_map_to_status_classes() {
        assert_eq!(
            ApiError::from(StoreError::InvalidTubName).status,
            StatusCode::BAD_REQUEST
        );
        assert_eq!(
            ApiError::from(StoreError::NotFound("tub")).status,
            StatusCode::NOT_FOUND
        );
        assert_eq!(
            ApiError::from(StoreError::PermissionDenied).status,
            StatusCode::UNAUTHORIZED
        );
    }

    mod router {
        use super::super::*;
        use crate::blob::{BlobConfig, BlobStore};
        use crate::config::Config;
        use crate::embedding::{EmbedModel, Embedder};
        use crate::pipeline::Pipeline;
        use crate::queue::TaskQueue;
        use axum::http::Request as HttpRequest;
        use clap::Parser;
        use tower::ServiceExt;

        /// State over a lazy pool: routes that fail before any query (auth
        /// rejections, liveness of the router itself) are testable without
        /// infrastructure.
        fn test_state() -> Arc<AppState> {
            let config = Config::try_parse_from([
                "ragnard",
                "--db-uri",
                "postgres://localhost/ragnar-test",
                "--s3-endpoint",
                "localhost:9000",
                "--s3-bucket",
                "ragnar-test",
                "--s3-access-key",
                "test",
                "--s3-secret-key",
                "test",
            ])
            .expect("test config parses");

            let pool = sqlx::postgres::PgPoolOptions::new()
                .connect_lazy(&config.db_uri)
                .expect("lazy pool");
            let store = MetaStore::from_pool(pool.clone());
            let blobs = Arc::new(
                BlobStore::new(&BlobConfig {
                    endpoint: config.s3_endpoint.clone(),
                    bucket: config.s3_bucket.clone(),
                    access_key: config.s3_access_key.clone(),
                    secret_key: config.s3_secret_key.clone(),
                    production: false,
                })
                .expect("blob store builds"),
            );
            let embedder = Arc::new(Embedder::new(
                "http://127.0.0.1:1",
                "ragnar",
                "key",
                EmbedModel::lookup(&config.default_embed_model).expect("default model"),
            ));
            let pipeline = Arc::new(Pipeline::new(
                store.clone(),
                blobs.clone(),
                embedder.clone(),
                TaskQueue::new(pool),
            ));
            Arc::new(AppState {
                config,
                store,
                blobs,
                embedder,
                pipeline,
            })
        }

        #[tokio::test]
        async fn ping_answers_pong() {
            let app = create_router(test_state());
            let response = app
                .oneshot(
                    HttpRequest::builder()
                        .uri("/ping")
                        .body(Body::empty())
                        .expect("request"),
                )
                .await
                .expect("router response");
            assert_eq!(response.status(), StatusCode::OK);
            let body = to_bytes(response.into_body(), 1024).await.expect("body");
            assert_eq!(&body[..], b"pong");
        }

        #[tokio::test]
        async fn missing_bearer_is_rejected_with_request_id() {
            let app = create_router(test_state());
            let response = app
                .oneshot(
                    HttpRequest::builder()
                        .uri("/tubs")
                        .body(Body::empty())
                        .expect("request"),
                )
                .await
                .expect("router response");
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
            assert!(response.headers().contains_key("x-request-id"));

            let body = to_bytes(response.into_body(), 64 * 1024).await.expect("body");
            let json: serde_json::Value = serde_json::from_slice(&body).expect("json body");
            assert_eq!(json["error"], "no access token was provided");
            assert!(json["request_id"].is_string());
        }

        #[tokio::test]
        async fn malformed_bearer_is_not_resolved() {
            let app = create_router(test_state());
            let response = app
                .oneshot(
                    HttpRequest::builder()
                        .uri("/tubs")
                        .header("authorization", "Bearer not-a-key-or-jwt")
                        .body(Body::empty())
                        .expect("request"),
                )
                .await
                .expect("router response");
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }

        #[tokio::test]
        async fn search_requires_authentication() {
            let app = create_router(test_state());
            let response = app
                .oneshot(
                    HttpRequest::builder()
                        .uri("/search/xnn/some-tub?q=hello")
                        .body(Body::empty())
                        .expect("request"),
                )
                .await
                .expect("router response");
            assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        }
    }
}
