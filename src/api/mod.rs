mod handlers;

use std::sync::Arc;

use axum::Router;
use axum::http::{Method, header};
use axum::routing::{get, post};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::sticker_core::Engine;

/// Build the control-plane router. Everything lives under `/api/*` with a
/// permissive CORS policy so the desktop GUI can call in from any origin;
/// preflight OPTIONS requests are answered by the CORS layer.
pub fn router(engine: Arc<Engine>) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([
            Method::GET,
            Method::POST,
            Method::PUT,
            Method::DELETE,
            Method::OPTIONS,
        ])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION]);

    Router::new()
        .route("/api/health", get(handlers::health))
        .route("/api/analyze-video", post(handlers::analyze_video))
        .route("/api/convert-videos", post(handlers::convert_videos))
        .route("/api/hex-edit", post(handlers::hex_edit))
        .route(
            "/api/conversion-progress/{process_id}",
            get(handlers::conversion_progress),
        )
        .route("/api/stop-process", post(handlers::stop_process))
        .route("/api/pause-operation", post(handlers::pause_operation))
        .route("/api/resume-operation", post(handlers::resume_operation))
        .route("/api/cleanup-processes", post(handlers::cleanup_processes))
        .route("/api/debug/processes", get(handlers::debug_processes))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(engine)
}
