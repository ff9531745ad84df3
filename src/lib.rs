pub mod api;
pub mod config;
pub mod entities;
pub mod infrastructure;
pub mod models;
pub mod services;
pub mod utils;

use crate::config::GatewayConfig;
use crate::services::pipeline::Orchestrator;
use crate::services::scan_log::ScanLogService;
use crate::services::scanner::Scanner;
use crate::services::storage::StorageService;
use axum::{
    Router,
    http::HeaderValue,
    middleware::from_fn,
    routing::{get, post},
};
use sea_orm::DatabaseConnection;
use std::sync::Arc;
use tower_http::cors::{AllowOrigin, Any, CorsLayer};
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

#[derive(OpenApi)]
#[openapi(
    paths(
        api::handlers::sessions::create_session,
        api::handlers::sessions::get_session,
        api::handlers::sessions::abort_upload,
        api::handlers::upload::upload_file,
        api::handlers::ws::upload_progress,
        api::handlers::download::download_file,
        api::handlers::download::file_status,
        api::handlers::stats::scan_stats,
        api::handlers::health::health_check,
    ),
    components(
        schemas(
            api::handlers::sessions::CreateSessionRequest,
            api::handlers::sessions::CreateSessionResponse,
            api::handlers::sessions::SessionStatusResponse,
            api::handlers::download::FileStatusResponse,
            api::handlers::health::HealthResponse,
            services::scan_log::ScanStatistics,
            models::SessionState,
            models::UploadResult,
            models::Stage,
            models::ProgressEvent,
        )
    ),
    tags(
        (name = "sessions", description = "Upload session endpoints"),
        (name = "upload", description = "Upload and progress endpoints"),
        (name = "download", description = "Stored file endpoints"),
        (name = "system", description = "Health and statistics")
    )
)]
pub struct ApiDoc;

#[derive(Clone)]
pub struct AppState {
    pub db: DatabaseConnection,
    pub storage: Arc<dyn StorageService>,
    pub local_scanner: Option<Arc<dyn Scanner>>,
    pub pipeline: Arc<Orchestrator>,
    pub scan_log: ScanLogService,
    pub config: GatewayConfig,
}

/// Request body ceiling for uploads: the file limit plus multipart overhead
fn upload_body_limit(config: &GatewayConfig) -> usize {
    usize::try_from(config.max_file_size.saturating_add(10 * 1024 * 1024)).unwrap_or(usize::MAX)
}

fn cors_layer(config: &GatewayConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = config
        .allowed_origins
        .iter()
        .filter_map(|o| HeaderValue::from_str(o).ok())
        .collect();

    let allow_origin = if origins.is_empty() {
        AllowOrigin::any()
    } else {
        AllowOrigin::list(origins)
    };

    CorsLayer::new()
        .allow_origin(allow_origin)
        .allow_methods(Any)
        .allow_headers(Any)
        .expose_headers(Any)
}

pub fn create_app(state: AppState) -> Router {
    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .route("/api/health", get(api::handlers::health::health_check))
        .route("/api/scan/stats", get(api::handlers::stats::scan_stats))
        .route(
            "/api/create_session",
            post(api::handlers::sessions::create_session),
        )
        .route(
            "/api/session/:token",
            get(api::handlers::sessions::get_session),
        )
        .route(
            "/api/upload/:token",
            post(api::handlers::upload::upload_file)
                .delete(api::handlers::sessions::abort_upload)
                .layer(axum::extract::DefaultBodyLimit::max(upload_body_limit(
                    &state.config,
                ))),
        )
        .route(
            "/ws/upload/:token",
            get(api::handlers::ws::upload_progress),
        )
        .route(
            "/download/:download_id",
            get(api::handlers::download::download_file),
        )
        .route(
            "/api/file/:download_id/status",
            get(api::handlers::download::file_status),
        )
        .layer(from_fn(api::middleware::request_id::request_id_middleware))
        .layer(cors_layer(&state.config))
        .with_state(state)
}
