//! Tub handlers: list, create, get, update settings, delete with cascade.

use super::{AccessKey, ApiError, AppState};
use crate::auth::AclOperation;
use crate::model::{Headers, Tub};
use axum::Json;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use serde::Deserialize;
use std::sync::Arc;

/// Request body for tub creation and settings updates.
#[derive(Debug, Deserialize)]
pub(super) struct TubRequest {
    tub_name: Option<String>,
    #[serde(default)]
    settings: Headers,
}

pub(super) async fn list_tubs(
    State(state): State<Arc<AppState>>,
    AccessKey(access_key): AccessKey,
) -> Result<Json<Vec<Tub>>, ApiError> {
    state
        .store
        .allowed_operation(&access_key, &[AclOperation::Read])
        .await?;
    let tubs = state.store.list_tubs(&access_key).await?;
    Ok(Json(tubs))
}

pub(super) async fn create_tub(
    State(state): State<Arc<AppState>>,
    AccessKey(access_key): AccessKey,
    Json(request): Json<TubRequest>,
) -> Result<(StatusCode, Json<Tub>), ApiError> {
    tracing::info!("Create tub request received");
    state
        .store
        .allowed_operation(&access_key, &[AclOperation::Create])
        .await?;

    let tub_name = request
        .tub_name
        .as_deref()
        .ok_or_else(|| ApiError::validation("tub_name is required"))?;
    let tub = state.store.create_tub(&access_key, tub_name).await?;

    if !request.settings.is_empty() {
        let tub = state
            .store
            .update_tub(&access_key, &tub.tub_name, request.settings)
            .await?;
        return Ok((StatusCode::CREATED, Json(tub)));
    }
    Ok((StatusCode::CREATED, Json(tub)))
}

pub(super) async fn get_tub(
    State(state): State<Arc<AppState>>,
    AccessKey(access_key): AccessKey,
    Path(tub): Path<String>,
) -> Result<Json<Tub>, ApiError> {
    let tub = state.store.get_tub(&access_key, &tub).await?;
    Ok(Json(tub))
}

pub(super) async fn update_tub(
    State(state): State<Arc<AppState>>,
    AccessKey(access_key): AccessKey,
    Path(tub): Path<String>,
    Json(request): Json<TubRequest>,
) -> Result<Json<Tub>, ApiError> {
    let tub = state
        .store
        .update_tub(&access_key, &tub, request.settings)
        .await?;
    Ok(Json(tub))
}

pub(super) async fn delete_tub(
    State(state): State<Arc<AppState>>,
    AccessKey(access_key): AccessKey,
    Path(tub): Path<String>,
) -> Result<Json<Tub>, ApiError> {
    tracing::info!(tub = %tub, "Delete tub request received");

    let record = state.store.get_tub(&access_key, &tub).await?;
    state.store.delete_tub(&access_key, &tub).await?;
    state.blobs.delete_tub_prefix(&record.tub_name).await?;

    Ok(Json(record))
}
