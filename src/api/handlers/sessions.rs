use crate::AppState;
use crate::api::error::AppError;
use crate::models::SessionState;
use crate::services::error::PipelineError;
use axum::{
    Json,
    extract::{Path, State},
    http::StatusCode,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

#[derive(Debug, Default, Deserialize, Validate, ToSchema)]
pub struct CreateSessionRequest {
    /// Free-form identifier of whoever requested the session (e.g. a chat user id)
    #[validate(length(min = 1, max = 128))]
    pub owner: Option<String>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct CreateSessionResponse {
    pub token: String,
    pub upload_url: String,
    pub progress_url: String,
    pub expires_at: DateTime<Utc>,
    pub max_file_size: u64,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
pub struct SessionStatusResponse {
    pub token: String,
    pub state: SessionState,
    pub expires_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

#[utoipa::path(
    post,
    path = "/api/create_session",
    request_body = CreateSessionRequest,
    responses(
        (status = 201, description = "Upload session created", body = CreateSessionResponse),
        (status = 400, description = "Invalid request")
    ),
    tag = "sessions"
)]
pub async fn create_session(
    State(state): State<AppState>,
    body: Option<Json<CreateSessionRequest>>,
) -> Result<(StatusCode, Json<CreateSessionResponse>), AppError> {
    let req = body.map(|Json(r)| r).unwrap_or_default();
    req.validate()
        .map_err(|e| AppError::BadRequest(e.to_string()))?;

    let session = state.pipeline.sessions().create(req.owner);
    let base = state.config.public_base_url.trim_end_matches('/');

    Ok((
        StatusCode::CREATED,
        Json(CreateSessionResponse {
            upload_url: format!("{}/api/upload/{}", base, session.token),
            progress_url: format!("{}/ws/upload/{}", base, session.token),
            token: session.token,
            expires_at: session.expires_at,
            max_file_size: session.size_limit,
        }),
    ))
}

#[utoipa::path(
    get,
    path = "/api/session/{token}",
    params(
        ("token" = String, Path, description = "Upload session token")
    ),
    responses(
        (status = 200, description = "Session state", body = SessionStatusResponse),
        (status = 404, description = "Unknown or expired session")
    ),
    tag = "sessions"
)]
pub async fn get_session(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<Json<SessionStatusResponse>, AppError> {
    let session = state
        .pipeline
        .sessions()
        .get(&token)
        .ok_or(PipelineError::SessionNotFound)?;

    Ok(Json(SessionStatusResponse {
        token: session.token,
        state: session.state,
        expires_at: session.expires_at,
        finished_at: session.finished_at,
    }))
}

#[utoipa::path(
    delete,
    path = "/api/upload/{token}",
    params(
        ("token" = String, Path, description = "Upload session token")
    ),
    responses(
        (status = 204, description = "Upload aborted"),
        (status = 404, description = "Unknown session"),
        (status = 409, description = "Upload already finished")
    ),
    tag = "sessions"
)]
pub async fn abort_upload(
    State(state): State<AppState>,
    Path(token): Path<String>,
) -> Result<StatusCode, AppError> {
    state.pipeline.abort(&token)?;
    Ok(StatusCode::NO_CONTENT)
}
