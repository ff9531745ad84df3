use crate::AppState;
use crate::api::error::AppError;
use crate::entities::{prelude::*, stored_files};
use crate::utils::validation::content_disposition;
use axum::{
    Json,
    body::Body,
    extract::{Path, State},
    http::{StatusCode, header},
    response::Response,
};
use chrono::{DateTime, Utc};
use sea_orm::EntityTrait;
use serde::{Deserialize, Serialize};
use tokio_util::io::ReaderStream;
use utoipa::ToSchema;

pub const SCAN_STATUS_HEADER: &str = "x-virus-scan-status";
pub const CLAMAV_RESULT_HEADER: &str = "x-clamav-result";
pub const VIRUSTOTAL_RESULT_HEADER: &str = "x-virustotal-result";

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct FileStatusResponse {
    pub file_id: String,
    pub filename: String,
    pub size: i64,
    pub mime_type: String,
    pub sha256: String,
    pub virus_scan: String,
    pub clamav_result: String,
    pub virustotal_result: String,
    pub warning: Option<String>,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub expired: bool,
}

async fn find_stored_file(
    state: &AppState,
    download_id: &str,
) -> Result<stored_files::Model, AppError> {
    StoredFiles::find_by_id(download_id.to_string())
        .one(&state.db)
        .await?
        .ok_or_else(|| AppError::NotFound("File not found".to_string()))
}

#[utoipa::path(
    get,
    path = "/download/{download_id}",
    params(
        ("download_id" = String, Path, description = "Opaque download id from the upload result")
    ),
    responses(
        (status = 200, description = "File content stream"),
        (status = 403, description = "File flagged as infected"),
        (status = 404, description = "File not found"),
        (status = 410, description = "File expired")
    ),
    tag = "download"
)]
pub async fn download_file(
    State(state): State<AppState>,
    Path(download_id): Path<String>,
) -> Result<Response, AppError> {
    // 1. Resolve the stored file
    let file = find_stored_file(&state, &download_id).await?;

    // 2. Check expiration
    if Utc::now() > file.expires_at {
        return Err(AppError::Gone("File has expired".to_string()));
    }

    // 3. Never serve anything the scanners flagged
    if file.virus_scan == "infected" {
        tracing::warn!("Blocked access to infected file: {}", download_id);
        return Err(AppError::Forbidden("File is infected with malware".to_string()));
    }

    // 4. Stream from storage
    let reader = state
        .storage
        .open_object(&file.storage_key)
        .await
        .map_err(|e| {
            tracing::error!("Failed to open object {}: {}", file.storage_key, e);
            AppError::NotFound("File content missing".to_string())
        })?;

    tracing::info!("📎 Download started: id={} name={}", download_id, file.filename);

    Response::builder()
        .status(StatusCode::OK)
        .header(header::CONTENT_TYPE, &file.mime_type)
        .header(header::CONTENT_LENGTH, file.size)
        .header(header::CONTENT_DISPOSITION, content_disposition(&file.filename))
        .header(header::CACHE_CONTROL, "private, no-store")
        .header(SCAN_STATUS_HEADER, &file.virus_scan)
        .header(CLAMAV_RESULT_HEADER, header_safe(&file.clamav_result))
        .header(VIRUSTOTAL_RESULT_HEADER, header_safe(&file.virustotal_result))
        .body(Body::from_stream(ReaderStream::new(reader)))
        .map_err(|e| AppError::Internal(e.to_string()))
}

#[utoipa::path(
    get,
    path = "/api/file/{download_id}/status",
    params(
        ("download_id" = String, Path, description = "Opaque download id from the upload result")
    ),
    responses(
        (status = 200, description = "Stored file scan status", body = FileStatusResponse),
        (status = 404, description = "File not found")
    ),
    tag = "download"
)]
pub async fn file_status(
    State(state): State<AppState>,
    Path(download_id): Path<String>,
) -> Result<Json<FileStatusResponse>, AppError> {
    let file = find_stored_file(&state, &download_id).await?;
    let expired = Utc::now() > file.expires_at;

    Ok(Json(FileStatusResponse {
        file_id: file.download_id,
        filename: file.filename,
        size: file.size,
        mime_type: file.mime_type,
        sha256: file.digest,
        virus_scan: file.virus_scan,
        clamav_result: file.clamav_result,
        virustotal_result: file.virustotal_result,
        warning: file.warning,
        created_at: file.created_at,
        expires_at: file.expires_at,
        expired,
    }))
}

/// Scanner details can carry arbitrary text; keep headers to visible ASCII
fn header_safe(value: &str) -> String {
    value
        .chars()
        .map(|c| if c.is_ascii_graphic() || c == ' ' { c } else { '?' })
        .collect()
}
