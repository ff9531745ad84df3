use crate::AppState;
use crate::api::error::AppError;
use crate::models::{SessionState, UploadResult};
use crate::services::error::PipelineError;
use crate::services::pipeline::UploadRequest;
use crate::utils::validation::sanitize_filename;
use axum::{
    Json,
    extract::{Multipart, Path, State},
    http::{HeaderMap, header},
};
use futures::TryStreamExt;
use tokio_util::io::StreamReader;

/// Client hint for the total file size, checked before any bytes are stored
pub const FILE_SIZE_HEADER: &str = "x-file-size";

/// Slack for multipart framing when comparing Content-Length to the limit
const MULTIPART_OVERHEAD: u64 = 10 * 1024 * 1024;

#[utoipa::path(
    post,
    path = "/api/upload/{token}",
    params(
        ("token" = String, Path, description = "Upload session token")
    ),
    request_body(content = Multipart, description = "Multipart form with a `file` field"),
    responses(
        (status = 200, description = "File scanned and stored", body = UploadResult),
        (status = 400, description = "Malformed or interrupted upload"),
        (status = 404, description = "Unknown or expired session"),
        (status = 409, description = "Session already used"),
        (status = 413, description = "File too large"),
        (status = 415, description = "File type not allowed"),
        (status = 422, description = "File rejected by security checks"),
        (status = 503, description = "Scanner or storage unavailable")
    ),
    tag = "upload"
)]
pub async fn upload_file(
    State(state): State<AppState>,
    Path(token): Path<String>,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> Result<Json<UploadResult>, AppError> {
    // Use a result to capture errors so we can consume the multipart stream if needed
    let result: Result<Json<UploadResult>, AppError> = async {
        // 0. Session must exist and still be waiting for its file
        let session = state
            .pipeline
            .sessions()
            .get(&token)
            .ok_or(PipelineError::SessionNotFound)?;
        if session.state != SessionState::Pending {
            return Err(PipelineError::SessionConflict("upload already received".to_string()).into());
        }

        // 1. Early size rejection from headers
        let mut declared_size = header_u64(&headers, FILE_SIZE_HEADER);
        if declared_size.is_some_and(|s| s > session.size_limit) {
            return Err(PipelineError::TooLarge {
                limit: session.size_limit,
            }
            .into());
        }
        if header_u64(&headers, header::CONTENT_LENGTH.as_str())
            .is_some_and(|len| len > session.size_limit + MULTIPART_OVERHEAD)
        {
            return Err(PipelineError::TooLarge {
                limit: session.size_limit,
            }
            .into());
        }

        while let Some(field) = multipart.next_field().await.map_err(|e| {
            let err_msg = e.to_string();
            if err_msg.contains("length limit exceeded") {
                AppError::Pipeline(PipelineError::TooLarge {
                    limit: session.size_limit,
                })
            } else {
                AppError::BadRequest(err_msg)
            }
        })? {
            let name = field.name().unwrap_or_default().to_string();

            if name == "file_size" || name == "total_size" {
                let text = field.text().await.unwrap_or_default();
                declared_size = text.trim().parse().ok().or(declared_size);
                continue;
            }
            if name != "file" {
                continue;
            }

            // 2. Sanitize filename and check the allowlist
            let original_filename = field.file_name().unwrap_or("unnamed").to_string();
            let filename = sanitize_filename(&original_filename)
                .map_err(|e| AppError::BadRequest(e.to_string()))?;
            if !state.config.is_extension_allowed(&filename) {
                return Err(AppError::UnsupportedMediaType(format!(
                    "File type of '{}' is not allowed",
                    filename
                )));
            }

            // 3. Run the pipeline over the field stream
            let body_with_io_error = field.map_err(std::io::Error::other);
            let reader = StreamReader::new(body_with_io_error);
            let uploaded = state
                .pipeline
                .run_pipeline(
                    &token,
                    UploadRequest {
                        filename,
                        declared_size,
                        reader,
                    },
                )
                .await?;
            return Ok(Json(uploaded));
        }

        Err(AppError::BadRequest("No file provided".to_string()))
    }
    .await;

    match result {
        Ok(res) => Ok(res),
        Err(e) => {
            // Consume the remaining multipart stream so the client sees our response, not a reset
            tracing::warn!("Upload failed early: {}. Consuming remaining stream...", e);
            while let Ok(Some(mut field)) = multipart.next_field().await {
                while let Ok(Some(_)) = field.chunk().await {}
            }
            Err(e)
        }
    }
}

fn header_u64(headers: &HeaderMap, name: &str) -> Option<u64> {
    headers
        .get(name)
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.trim().parse().ok())
}
