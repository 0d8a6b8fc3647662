//! Document handlers: upserts (single-file and multipart), listing with
//! header filters, downloads, pipeline status, and deletion.
//!
//! Upserts write the metadata row first, then blobs, then schedule the
//! right pipeline stage for what actually changed. For brand-new documents
//! any later failure triggers a best-effort rollback in reverse order;
//! updates may leave partial state behind and answer 5xx instead.

use super::{AccessKey, ApiError, AppState, read_upload_body};
use crate::model::{Document, DocumentStatus, Headers, Tub, UploadedChunk};
use crate::util::{chunks_content_equal, sha256_hex};
use axum::Json;
use axum::body::Body;
use axum::extract::{Path, Query, Request, State};
use axum::http::header::{CONTENT_DISPOSITION, CONTENT_ENCODING, CONTENT_LENGTH, CONTENT_TYPE};
use axum::http::{HeaderMap, HeaderName, HeaderValue, StatusCode};
use axum::response::Response;
use bytes::Bytes;
use serde::Deserialize;
use std::sync::Arc;

/// Prefix for custom document headers on requests and download responses.
const HEADER_PREFIX: &str = "x-ragnar-";

/// Headers stored on documents that keep their own name on downloads.
const WHITELISTED_HEADERS: [&str; 3] = ["content-type", "content-length", "content-disposition"];

#[derive(Debug, Deserialize)]
pub(super) struct ListQuery {
    #[serde(default)]
    filter: Option<String>,
    #[serde(default)]
    sort: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

pub(super) async fn list_documents(
    State(state): State<Arc<AppState>>,
    AccessKey(access_key): AccessKey,
    Path(tub): Path<String>,
    Query(query): Query<ListQuery>,
) -> Result<Json<Vec<Document>>, ApiError> {
    let filter = crate::filter::DocumentFilter::parse(query.filter.as_deref().unwrap_or(""))
        .map_err(|e| ApiError::validation(format!("Invalid JSON format in 'filter' query parameter: {e}")))?;

    // Sorting is accepted for interface compatibility; listing order is
    // unspecified.
    if let Some(sort) = query.sort.as_deref().filter(|s| !s.trim().is_empty())
        && serde_json::from_str::<serde_json::Value>(sort).is_err()
    {
        return Err(ApiError::validation(
            "Invalid JSON format in 'sort' query parameter",
        ));
    }

    let documents = state
        .store
        .list_documents(
            &access_key,
            &tub,
            &filter,
            query.limit.unwrap_or(100),
            query.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(documents))
}

pub(super) async fn get_document(
    State(state): State<Arc<AppState>>,
    AccessKey(access_key): AccessKey,
    Path((tub, document_id)): Path<(String, String)>,
) -> Result<Json<Document>, ApiError> {
    let document = state.store.get_document(&access_key, &tub, &document_id).await?;
    Ok(Json(document))
}

pub(super) async fn create_document(
    State(state): State<Arc<AppState>>,
    access_key: AccessKey,
    Path(tub): Path<String>,
    request: Request,
) -> Result<(StatusCode, Json<Document>), ApiError> {
    upsert_document(state, access_key, tub, None, request).await
}

pub(super) async fn update_document(
    State(state): State<Arc<AppState>>,
    access_key: AccessKey,
    Path((tub, document_id)): Path<(String, String)>,
    request: Request,
) -> Result<(StatusCode, Json<Document>), ApiError> {
    upsert_document(state, access_key, tub, Some(document_id), request).await
}

async fn upsert_document(
    state: Arc<AppState>,
    AccessKey(access_key): AccessKey,
    tub_name: String,
    document_id: Option<String>,
    request: Request,
) -> Result<(StatusCode, Json<Document>), ApiError> {
    let tub = state.store.get_tub(&access_key, &tub_name).await?;

    let headers = request.headers().clone();
    let content_type = headers
        .get(CONTENT_TYPE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_owned)
        .ok_or_else(|| ApiError::validation("Content-Type header is missing"))?;

    for required in tub.required_document_headers() {
        let direct = header_value(&headers, &required);
        let prefixed = header_value(&headers, &format!("{HEADER_PREFIX}{required}"));
        if direct.is_none() && prefixed.is_none() {
            return Err(ApiError::validation(format!(
                "missing required document header: {required}"
            )));
        }
    }

    let media_type = content_type
        .split(';')
        .next()
        .unwrap_or_default()
        .trim()
        .to_ascii_lowercase();

    if media_type == "multipart/form-data" {
        multipart_upsert(state, access_key, tub, document_id, &content_type, headers, request)
            .await
    } else {
        single_file_upsert(state, access_key, tub, document_id, content_type, headers, request)
            .await
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .filter(|v| !v.is_empty())
        .map(str::to_owned)
}

/// Collect document headers: content metadata plus `x-ragnar-*` request
/// headers with the prefix stripped and keys lowercased.
fn document_headers(
    request_headers: &HeaderMap,
    content_type: &str,
    content_length: usize,
    content_disposition: &str,
) -> Headers {
    let mut collected = Headers::new();
    collected.insert("content-type".into(), Some(content_type.to_string()));
    collected.insert("content-length".into(), Some(content_length.to_string()));
    collected.insert(
        "content-disposition".into(),
        Some(content_disposition.to_string()),
    );
    for (name, value) in request_headers {
        let name = name.as_str().to_lowercase();
        if let Some(stripped) = name.strip_prefix(HEADER_PREFIX)
            && let Ok(value) = value.to_str()
        {
            collected.insert(stripped.to_string(), Some(value.to_string()));
        }
    }
    collected
}

/// Best-effort reversal for failed brand-new uploads: blob first, then the
/// metadata row.
async fn rollback_new_document(state: &Arc<AppState>, access_key: &str, document: &Document, delete_blob: bool) {
    if delete_blob
        && let Err(err) = state
            .blobs
            .delete_document(&document.tub_name, &document.document_id)
            .await
    {
        tracing::warn!(document_id = %document.document_id, error = %err, "Rollback: failed to delete blob");
    }
    if let Err(err) = state
        .store
        .delete_document(access_key, &document.tub_name, &document.document_id)
        .await
    {
        tracing::warn!(document_id = %document.document_id, error = %err, "Rollback: failed to delete document row");
    }
}

async fn single_file_upsert(
    state: Arc<AppState>,
    access_key: String,
    tub: Tub,
    document_id: Option<String>,
    content_type: String,
    headers: HeaderMap,
    request: Request,
) -> Result<(StatusCode, Json<Document>), ApiError> {
    let gzip = header_value(&headers, CONTENT_ENCODING.as_str()).as_deref() == Some("gzip");
    let declared_length = header_value(&headers, CONTENT_LENGTH.as_str()).and_then(|v| v.parse().ok());

    let data = read_upload_body(
        request.into_body(),
        declared_length,
        gzip,
        state.config.http_upload_limit,
    )
    .await?;

    let content_disposition = header_value(&headers, CONTENT_DISPOSITION.as_str())
        .unwrap_or_else(|| r#"attachment; filename="file""#.to_string());

    let doc_headers = document_headers(&headers, &content_type, data.len(), &content_disposition);
    let document_hash = sha256_hex(&data);
    let is_new = document_id.is_none();

    let document = state
        .store
        .upsert_document(&access_key, &tub, document_id.as_deref(), doc_headers)
        .await?;

    let document_changed = match state
        .blobs
        .put_document(
            &document.tub_name,
            &document.document_id,
            data,
            &document.headers,
            &document_hash,
        )
        .await
    {
        Ok(changed) => changed,
        Err(err) => {
            if is_new {
                rollback_new_document(&state, &access_key, &document, false).await;
            }
            return Err(err.into());
        }
    };

    if document_changed
        && let Err(err) = state.pipeline.schedule_conversion(&document).await
    {
        if is_new {
            rollback_new_document(&state, &access_key, &document, true).await;
        }
        return Err(err.into());
    }

    let document = if !is_new && document_changed {
        state
            .store
            .set_document_updated_now(&document.tub_name, &document.document_id)
            .await?
    } else {
        document
    };

    Ok((StatusCode::CREATED, Json(document)))
}

struct FilePart {
    data: Bytes,
    content_type: String,
    content_disposition: String,
}

async fn multipart_upsert(
    state: Arc<AppState>,
    access_key: String,
    tub: Tub,
    document_id: Option<String>,
    content_type: &str,
    headers: HeaderMap,
    request: Request,
) -> Result<(StatusCode, Json<Document>), ApiError> {
    let boundary = multer::parse_boundary(content_type)
        .map_err(|_| ApiError::validation("multipart boundary not found"))?;

    let gzip = header_value(&headers, CONTENT_ENCODING.as_str()).as_deref() == Some("gzip");
    let declared_length = header_value(&headers, CONTENT_LENGTH.as_str()).and_then(|v| v.parse().ok());
    let body = read_upload_body(
        request.into_body(),
        declared_length,
        gzip,
        state.config.http_upload_limit,
    )
    .await?;

    let stream = futures::stream::once(async move { Ok::<Bytes, std::io::Error>(body) });
    let mut multipart = multer::Multipart::new(stream, boundary);

    let mut file: Option<FilePart> = None;
    let mut markdown: Option<Bytes> = None;
    let mut chunks: Vec<UploadedChunk> = Vec::new();

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::validation(format!("error reading multipart: {e}")))?
    {
        match field.name() {
            Some("file") => {
                let part_content_type = field
                    .content_type()
                    .map(|m| m.to_string())
                    .ok_or_else(|| ApiError::validation("file part must have Content-Type header"))?;
                let part_disposition = field
                    .headers()
                    .get(CONTENT_DISPOSITION)
                    .and_then(|v| v.to_str().ok())
                    .map(str::to_owned)
                    .unwrap_or_else(|| {
                        format!(
                            r#"attachment; filename="{}""#,
                            field.file_name().unwrap_or("file")
                        )
                    });
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::validation(format!("failed to read file part: {e}")))?;
                file = Some(FilePart {
                    data,
                    content_type: part_content_type,
                    content_disposition: part_disposition,
                });
            }
            Some("markdown") => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::validation(format!("failed to read markdown part: {e}")))?;
                markdown = Some(data);
            }
            Some("chunks") => {
                let data = field
                    .bytes()
                    .await
                    .map_err(|e| ApiError::validation(format!("failed to read chunks part: {e}")))?;
                chunks = serde_json::from_slice(&data)
                    .map_err(|e| ApiError::validation(format!("invalid chunks JSON: {e}")))?;
                for (index, chunk) in chunks.iter().enumerate() {
                    if chunk.chunk_id != index as i32 {
                        return Err(ApiError::validation(
                            "chunk ids must be sequential starting from 0",
                        ));
                    }
                }
            }
            _ => {}
        }
    }

    let file = file.ok_or_else(|| ApiError::validation("file part is required"))?;
    if file.data.len() as u64 >= state.config.http_upload_limit {
        return Err(ApiError::validation(format!(
            "File is too large, max {} bytes",
            state.config.http_upload_limit - 1
        )));
    }
    if !chunks.is_empty() && markdown.is_none() {
        return Err(ApiError::validation(
            "chunks provided but markdown part is missing",
        ));
    }

    let doc_headers = document_headers(
        &headers,
        &file.content_type,
        file.data.len(),
        &file.content_disposition,
    );
    let document_hash = sha256_hex(&file.data);
    let is_new = document_id.is_none();

    let document = state
        .store
        .upsert_document(&access_key, &tub, document_id.as_deref(), doc_headers)
        .await?;

    let document_changed = match state
        .blobs
        .put_document(
            &document.tub_name,
            &document.document_id,
            file.data,
            &document.headers,
            &document_hash,
        )
        .await
    {
        Ok(changed) => changed,
        Err(err) => {
            if is_new {
                rollback_new_document(&state, &access_key, &document, false).await;
            }
            return Err(err.into());
        }
    };

    let mut markdown_changed = false;
    if let Some(markdown_data) = &markdown {
        let markdown_hash = sha256_hex(markdown_data);
        markdown_changed = match state
            .blobs
            .put_markdown(
                &document.tub_name,
                &document.document_id,
                markdown_data.clone(),
                &document.headers,
                &markdown_hash,
            )
            .await
        {
            Ok(changed) => changed,
            Err(err) => {
                if is_new {
                    rollback_new_document(&state, &access_key, &document, true).await;
                }
                return Err(err.into());
            }
        };
    }

    let mut chunks_changed = false;
    if !chunks.is_empty() {
        let current = match state.store.internal_get_chunks(&document).await {
            Ok(current) => current,
            Err(err) => {
                if is_new {
                    rollback_new_document(&state, &access_key, &document, true).await;
                }
                return Err(err.into());
            }
        };
        chunks_changed = !chunks_content_equal(&current, &chunks);
        if chunks_changed {
            let contents: Vec<String> = chunks.iter().map(|c| c.content.clone()).collect();
            if let Err(err) = state.store.internal_replace_chunks(&document, &contents).await {
                if is_new {
                    rollback_new_document(&state, &access_key, &document, true).await;
                }
                return Err(err.into());
            }
        } else {
            tracing::info!(document_id = %document.document_id, "Uploaded chunks identical to existing chunks");
        }
    }

    // Stage selection: client-supplied chunks beat Markdown, and
    // client-supplied Markdown beats re-conversion even when the original
    // bytes changed too.
    let scheduled = if !chunks.is_empty() {
        if chunks_changed {
            state.pipeline.schedule_embedding(&document).await
        } else {
            tracing::info!(document_id = %document.document_id, "Chunks unchanged, skipping embedding");
            Ok(())
        }
    } else if markdown.is_some() {
        if markdown_changed {
            state.pipeline.schedule_chunking(&document).await
        } else {
            tracing::info!(document_id = %document.document_id, "Markdown unchanged, skipping chunking");
            Ok(())
        }
    } else if document_changed {
        state.pipeline.schedule_conversion(&document).await
    } else {
        tracing::info!(document_id = %document.document_id, "Document unchanged, skipping conversion");
        Ok(())
    };
    if let Err(err) = scheduled {
        if is_new {
            rollback_new_document(&state, &access_key, &document, true).await;
        }
        return Err(err.into());
    }

    let document = if !is_new && (document_changed || markdown_changed || chunks_changed) {
        state
            .store
            .set_document_updated_now(&document.tub_name, &document.document_id)
            .await?
    } else {
        document
    };

    Ok((StatusCode::CREATED, Json(document)))
}

/// Attach a document's stored headers to a download response, prefixing
/// non-whitelisted names with `x-ragnar-`. `content-length` is always left
/// to the transport.
fn apply_download_headers(response: &mut Response, document: &Document) {
    for (key, value) in document.headers.iter() {
        let Some(value) = value else { continue };
        if key == "content-length" {
            continue;
        }
        let name = if WHITELISTED_HEADERS.contains(&key.as_str()) {
            key.clone()
        } else {
            format!("{HEADER_PREFIX}{key}")
        };
        if let (Ok(name), Ok(value)) = (
            HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            response.headers_mut().insert(name, value);
        }
    }
}

pub(super) async fn download_document(
    State(state): State<Arc<AppState>>,
    AccessKey(access_key): AccessKey,
    Path((tub, document_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let document = state.store.get_document(&access_key, &tub, &document_id).await?;
    let data = state
        .blobs
        .get_document(&document.tub_name, &document.document_id)
        .await?;

    let mut response = Response::new(Body::from(data));
    apply_download_headers(&mut response, &document);
    Ok(response)
}

pub(super) async fn download_document_markdown(
    State(state): State<Arc<AppState>>,
    AccessKey(access_key): AccessKey,
    Path((tub, document_id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let document = state.store.get_document(&access_key, &tub, &document_id).await?;
    let data = state
        .blobs
        .get_markdown(&document.tub_name, &document.document_id)
        .await?;

    let mut response = Response::new(Body::from(data));
    apply_download_headers(&mut response, &document);
    response
        .headers_mut()
        .insert(CONTENT_TYPE, HeaderValue::from_static("text/markdown"));
    Ok(response)
}

pub(super) async fn document_status(
    State(state): State<Arc<AppState>>,
    AccessKey(access_key): AccessKey,
    Path((tub, document_id)): Path<(String, String)>,
) -> Result<Json<DocumentStatus>, ApiError> {
    let document = state.store.get_document(&access_key, &tub, &document_id).await?;
    let status = state.pipeline.document_status(&document.document_id).await?;
    Ok(Json(status))
}

pub(super) async fn delete_document(
    State(state): State<Arc<AppState>>,
    AccessKey(access_key): AccessKey,
    Path((tub, document_id)): Path<(String, String)>,
) -> Result<Json<Document>, ApiError> {
    let document = state.store.get_document(&access_key, &tub, &document_id).await?;
    state
        .store
        .delete_document(&access_key, &tub, &document_id)
        .await?;
    state
        .blobs
        .delete_document(&document.tub_name, &document.document_id)
        .await?;
    Ok(Json(document))
}
