//! Similarity search: embed the query, rank chunks by cosine distance.

use super::{AccessKey, ApiError, AppState};
use crate::filter::DocumentFilter;
use crate::model::Chunk;
use axum::Json;
use axum::extract::{Path, Query, State};
use serde::Deserialize;
use std::sync::Arc;

#[derive(Debug, Deserialize)]
pub(super) struct SearchQuery {
    #[serde(default)]
    q: Option<String>,
    #[serde(default)]
    filter: Option<String>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

pub(super) async fn search_xnn(
    State(state): State<Arc<AppState>>,
    AccessKey(access_key): AccessKey,
    Path(tub): Path<String>,
    Query(query): Query<SearchQuery>,
) -> Result<Json<Vec<Chunk>>, ApiError> {
    let tub = state.store.get_tub(&access_key, &tub).await?;

    let text = query
        .q
        .as_deref()
        .map(str::trim)
        .filter(|q| !q.is_empty())
        .ok_or_else(|| ApiError::validation("No query provided"))?;

    let filter = DocumentFilter::parse(query.filter.as_deref().unwrap_or(""))
        .map_err(|e| ApiError::validation(format!("Invalid JSON format in 'filter' query parameter: {e}")))?;

    let limit = query.limit.unwrap_or(10);
    let offset = query.offset.unwrap_or(0);

    let model = state.embedder.model_or_default(tub.setting("embed_model"));
    tracing::debug!(
        tub = %tub.tub_name,
        model = %model.fqn(),
        query = text,
        limit,
        offset,
        "Similarity search"
    );

    let query_vector = state.embedder.embed_query(&model, text).await?;

    let chunks = state
        .store
        .query_chunk_embeds(
            &access_key,
            &tub.tub_name,
            &model,
            &filter,
            query_vector,
            limit,
            offset,
        )
        .await?;

    Ok(Json(chunks))
}
