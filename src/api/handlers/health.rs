use crate::AppState;
use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct HealthResponse {
    /// `ok` when the database is reachable, `degraded` otherwise
    pub status: String,
    pub database: String,
    pub storage: String,
    pub clamav: String,
    pub virustotal: String,
    pub version: String,
}

#[utoipa::path(
    get,
    path = "/api/health",
    responses(
        (status = 200, description = "System health status", body = HealthResponse),
        (status = 503, description = "Database unreachable", body = HealthResponse)
    ),
    tag = "system"
)]
pub async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    let db_ok = state.db.ping().await.is_ok();

    // A missing key is a normal answer; only transport failures count
    let storage_status = match state.storage.file_exists("health-check").await {
        Ok(_) => "connected",
        Err(e) => {
            tracing::warn!("Storage health probe failed: {}", e);
            "disconnected"
        }
    };

    let clamav_status = match &state.local_scanner {
        Some(scanner) if scanner.health_check().await => "connected",
        Some(_) => "disconnected",
        None => "disabled",
    };

    let virustotal_status = if state.config.virustotal_api_key.is_some() {
        "configured"
    } else {
        "disabled"
    };

    let status = if db_ok {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(HealthResponse {
            status: if db_ok { "ok" } else { "degraded" }.to_string(),
            database: if db_ok { "connected" } else { "disconnected" }.to_string(),
            storage: storage_status.to_string(),
            clamav: clamav_status.to_string(),
            virustotal: virustotal_status.to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }),
    )
}
