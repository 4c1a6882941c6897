pub mod tasks;
pub mod ws;

use std::sync::Arc;

use axum::Router;
use utoipa::OpenApi;

use crate::state::AppState;

/// Routes nested under `/v1`.
pub fn router(upload_limit: usize) -> Router<Arc<AppState>> {
    Router::new().merge(tasks::router(upload_limit))
}

pub fn api_docs() -> utoipa::openapi::OpenApi {
    tasks::TasksApi::openapi()
}
