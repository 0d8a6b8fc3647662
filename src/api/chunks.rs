//! Chunk handlers: paginated listing and single-chunk lookup.

use super::{AccessKey, ApiError, AppState};
use crate::model::Chunk;
use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use std::sync::Arc;

/// Chunk listings default to effectively-everything; documents rarely have
/// more chunks than this.
const DEFAULT_CHUNK_LIMIT: i64 = 10_000;

#[derive(Debug, Deserialize)]
pub(super) struct ChunkListQuery {
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

pub(super) async fn list_chunks(
    State(state): State<Arc<AppState>>,
    AccessKey(access_key): AccessKey,
    Path((tub, document_id)): Path<(String, String)>,
    Query(query): Query<ChunkListQuery>,
) -> Result<Json<Vec<Chunk>>, ApiError> {
    let chunks = state
        .store
        .get_chunks(
            &access_key,
            &tub,
            &document_id,
            query.limit.unwrap_or(DEFAULT_CHUNK_LIMIT),
            query.offset.unwrap_or(0),
        )
        .await?;
    Ok(Json(chunks))
}

pub(super) async fn get_chunk(
    State(state): State<Arc<AppState>>,
    AccessKey(access_key): AccessKey,
    Path((tub, document_id, index)): Path<(String, String, i32)>,
) -> Result<Json<Chunk>, ApiError> {
    let chunk = state
        .store
        .get_chunk(&access_key, &tub, &document_id, index)
        .await?;
    Ok(Json(chunk))
}
