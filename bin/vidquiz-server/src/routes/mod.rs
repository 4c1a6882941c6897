//! Axum router construction.
//!
//! [`build`] assembles the complete application router:
//! - middleware layers (CORS, per-request trace id)
//! - the OpenAPI document at `/api-docs/openapi.json`
//! - the health route
//! - task routes under `/v1`

pub mod doc;
mod health;
mod v1;

use std::sync::Arc;

use axum::routing::get;
use axum::{Json, Router, middleware};
use tower::ServiceBuilder;

use crate::middleware::{cors, trace};
use crate::state::AppState;

/// Build the complete Axum [`Router`] for the application.
pub fn build(state: Arc<AppState>) -> Router {
    // Multipart framing and the language field ride on top of the video.
    let upload_limit = usize::try_from(state.config.pipeline.max_video_bytes())
        .unwrap_or(usize::MAX)
        .saturating_add(1024 * 1024);

    Router::new()
        .merge(health::router())
        .nest("/v1", v1::router(upload_limit))
        .route("/api-docs/openapi.json", get(|| async { Json(doc::get_docs()) }))
        .layer(ServiceBuilder::new().layer(cors::cors_layer(state.clone())))
        .layer(middleware::from_fn(trace::trace_middleware))
        .with_state(state)
}
