use crate::AppState;
use crate::api::error::AppError;
use crate::services::scan_log::ScanStatistics;
use axum::{Json, extract::State};

#[utoipa::path(
    get,
    path = "/api/scan/stats",
    responses(
        (status = 200, description = "Aggregate scan statistics", body = ScanStatistics)
    ),
    tag = "system"
)]
pub async fn scan_stats(State(state): State<AppState>) -> Result<Json<ScanStatistics>, AppError> {
    let stats = state.scan_log.statistics().await?;
    Ok(Json(stats))
}
