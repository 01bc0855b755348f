use axum::{
    extract::DefaultBodyLimit,
    routing::{delete, get, post},
    Router,
};

use crate::blocks::routes as block_routes;
use crate::state::AppState;

/// Build the full axum Router with all routes and middleware.
pub fn build_router(state: AppState) -> Router {
    let body_limit = usize::try_from(state.max_upload_bytes).unwrap_or(usize::MAX);

    // Static segments win over `{id}`, so /blocks/list never reaches the id routes.
    let block_routes = Router::new()
        .route("/blocks", post(block_routes::receive_blocks))
        .route("/blocks/list", get(block_routes::list_received))
        .route("/processed_blocks/list", get(block_routes::list_processed))
        .route("/blocks/{id}", delete(block_routes::delete_block))
        .route("/blocks/{id}/files", get(block_routes::list_block_files))
        .route(
            "/blocks/{id}/files/{name}",
            get(block_routes::download_block_file),
        )
        .route("/blocks/{id}/upload_glb", post(block_routes::upload_glb))
        .layer(DefaultBodyLimit::max(body_limit));

    let health = Router::new()
        .route("/", get(block_routes::root_status))
        .route("/health", get(health_check));

    Router::new()
        .merge(block_routes)
        .merge(health)
        .with_state(state)
}

/// Basic health check endpoint
async fn health_check() -> &'static str {
    "ok"
}
