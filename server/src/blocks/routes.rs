//! REST endpoints for block intake, promotion, download and deletion.
//!
//! POST   /blocks                        — Intake blocks (JSON metadata + base64 photos)
//! GET    /blocks/list                   — Received block ids
//! GET    /processed_blocks/list         — Processed block ids
//! GET    /blocks/{id}/files             — File names of a block
//! GET    /blocks/{id}/files/{name}      — Download one file (raw binary)
//! POST   /blocks/{id}/upload_glb        — Promote with the raw artifact body
//! DELETE /blocks/{id}                   — Delete a processed block

use axum::{
    body::Bytes,
    extract::{rejection::JsonRejection, Path, Query, State},
    http::{header, HeaderMap, HeaderValue, StatusCode},
    Json,
};
use serde::{Deserialize, Serialize};
use tokio::task::JoinError;

use crate::blocks::lifecycle::PromotionReceipt;
use crate::blocks::model::BlocksPayload;
use crate::blocks::stage::Stage;
use crate::error::BlockError;
use crate::state::AppState;

type ApiError = (StatusCode, String);

// --- Request/Response types ---

#[derive(Debug, Deserialize)]
pub struct StageQuery {
    /// Restrict the lookup to one stage; otherwise processed is searched first.
    pub stage: Option<Stage>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub status: String,
    pub message: String,
}

#[derive(Debug, Serialize)]
pub struct IntakeResponse {
    pub status: String,
    pub message: String,
    pub count: usize,
    pub block_ids: Vec<String>,
    /// Artifacts produced by the mesh generator, when it is enabled
    pub artifacts: Vec<PromotionReceipt>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BlockListResponse {
    pub stage: Stage,
    pub blocks: Vec<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct BlockFilesResponse {
    pub block_id: String,
    pub stage: Stage,
    pub files: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct UploadResponse {
    pub status: String,
    pub message: String,
    pub artifact: PromotionReceipt,
}

// --- Error mapping ---

fn error_response(e: BlockError) -> ApiError {
    let status = match &e {
        BlockError::Validation(_) | BlockError::InvalidKey { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        BlockError::NotFound(_) => StatusCode::NOT_FOUND,
        BlockError::Io { .. } | BlockError::Metadata(_) | BlockError::ExternalTool(_) => {
            tracing::error!("Block request failed: {}", e);
            StatusCode::INTERNAL_SERVER_ERROR
        }
    };
    (status, e.to_string())
}

fn join_error(e: JoinError) -> ApiError {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        format!("Task join error: {}", e),
    )
}

fn content_type_for(name: &str) -> &'static str {
    let extension = name
        .rsplit_once('.')
        .map(|(_, ext)| ext.to_ascii_lowercase())
        .unwrap_or_default();
    match extension.as_str() {
        "glb" => "model/gltf-binary",
        "json" => "application/json",
        "txt" => "text/plain; charset=utf-8",
        "jpg" | "jpeg" => "image/jpeg",
        "png" => "image/png",
        "webp" => "image/webp",
        _ => "application/octet-stream",
    }
}

// --- Handlers ---

/// GET /
pub async fn root_status() -> Json<StatusResponse> {
    Json(StatusResponse {
        status: "ok".to_string(),
        message: "Block API is running".to_string(),
    })
}

/// POST /blocks
///
/// Validates every block before writing any. With the mesh generator enabled,
/// each block is meshed and promoted before the response is sent.
pub async fn receive_blocks(
    State(state): State<AppState>,
    payload: Result<Json<BlocksPayload>, JsonRejection>,
) -> Result<Json<IntakeResponse>, ApiError> {
    let Json(payload) = payload.map_err(|e| (StatusCode::UNPROCESSABLE_ENTITY, e.body_text()))?;

    let lifecycle = state.lifecycle.clone();
    let mesh = state.mesh.clone();

    let (block_ids, artifacts) = tokio::task::spawn_blocking(move || {
        let block_ids = lifecycle.intake_batch(payload.blocks)?;
        let mut artifacts = Vec::new();
        if let Some(generator) = mesh {
            for block_id in &block_ids {
                artifacts.push(generator.generate(&lifecycle, block_id)?);
            }
        }
        Ok::<_, BlockError>((block_ids, artifacts))
    })
    .await
    .map_err(join_error)?
    .map_err(error_response)?;

    let count = block_ids.len();
    Ok(Json(IntakeResponse {
        status: "success".to_string(),
        message: format!("{} blocks received", count),
        count,
        block_ids,
        artifacts,
    }))
}

async fn list_stage(state: AppState, stage: Stage) -> Result<Json<BlockListResponse>, ApiError> {
    let blocks = tokio::task::spawn_blocking(move || state.lifecycle.list(stage))
        .await
        .map_err(join_error)?
        .map_err(error_response)?;
    Ok(Json(BlockListResponse { stage, blocks }))
}

/// GET /blocks/list
pub async fn list_received(
    State(state): State<AppState>,
) -> Result<Json<BlockListResponse>, ApiError> {
    list_stage(state, Stage::Received).await
}

/// GET /processed_blocks/list
pub async fn list_processed(
    State(state): State<AppState>,
) -> Result<Json<BlockListResponse>, ApiError> {
    list_stage(state, Stage::Processed).await
}

/// GET /blocks/{id}/files
pub async fn list_block_files(
    State(state): State<AppState>,
    Path(block_id): Path<String>,
    Query(query): Query<StageQuery>,
) -> Result<Json<BlockFilesResponse>, ApiError> {
    let lifecycle = state.lifecycle.clone();
    let id = block_id.clone();
    let (stage, files) =
        tokio::task::spawn_blocking(move || lifecycle.list_files(query.stage, &id))
            .await
            .map_err(join_error)?
            .map_err(error_response)?;

    Ok(Json(BlockFilesResponse {
        block_id,
        stage,
        files,
    }))
}

/// GET /blocks/{id}/files/{name}
///
/// Returns the raw file with a content type derived from its extension.
pub async fn download_block_file(
    State(state): State<AppState>,
    Path((block_id, name)): Path<(String, String)>,
    Query(query): Query<StageQuery>,
) -> Result<(StatusCode, HeaderMap, Vec<u8>), ApiError> {
    let lifecycle = state.lifecycle.clone();
    let file_name = name.clone();
    let (stage, data) = tokio::task::spawn_blocking(move || {
        lifecycle.read_file(query.stage, &block_id, &file_name)
    })
    .await
    .map_err(join_error)?
    .map_err(error_response)?;

    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_static(content_type_for(&name)),
    );
    headers.insert("x-block-stage", HeaderValue::from_static(stage.as_str()));
    Ok((StatusCode::OK, headers, data))
}

/// POST /blocks/{id}/upload_glb
///
/// The raw body is the finished artifact. Stores it in the processed stage and
/// removes the received copy if there is one. Bodies over `max_upload_bytes` are
/// turned away with 413 by the router's body limit before this runs.
pub async fn upload_glb(
    State(state): State<AppState>,
    Path(block_id): Path<String>,
    body: Bytes,
) -> Result<Json<UploadResponse>, ApiError> {
    let lifecycle = state.lifecycle.clone();
    let artifact = tokio::task::spawn_blocking(move || lifecycle.promote(&block_id, &body))
        .await
        .map_err(join_error)?
        .map_err(error_response)?;

    Ok(Json(UploadResponse {
        status: "success".to_string(),
        message: format!("Artifact for block {} stored", artifact.block_id),
        artifact,
    }))
}

/// DELETE /blocks/{id}
pub async fn delete_block(
    State(state): State<AppState>,
    Path(block_id): Path<String>,
) -> Result<Json<StatusResponse>, ApiError> {
    let lifecycle = state.lifecycle.clone();
    let id = block_id.clone();
    tokio::task::spawn_blocking(move || lifecycle.expel(&id))
        .await
        .map_err(join_error)?
        .map_err(error_response)?;

    Ok(Json(StatusResponse {
        status: "success".to_string(),
        message: format!("Block {} deleted", block_id),
    }))
}
