use crate::services::error::PipelineError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum AppError {
    #[error(transparent)]
    Pipeline(#[from] PipelineError),

    #[error("Database error: {0}")]
    Database(#[from] sea_orm::DbErr),

    #[error("Bad Request: {0}")]
    BadRequest(String),

    #[error("Not Found: {0}")]
    NotFound(String),

    #[error("Forbidden: {0}")]
    Forbidden(String),

    #[error("File Expired")]
    Gone(String),

    #[error("Unsupported Media Type: {0}")]
    UnsupportedMediaType(String),

    #[error("Internal Server Error: {0}")]
    Internal(String),

    #[error("Anyhow error: {0}")]
    Anyhow(#[from] anyhow::Error),
}

impl AppError {
    pub fn status(&self) -> StatusCode {
        match self {
            AppError::Pipeline(e) => match e {
                PipelineError::TooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
                PipelineError::Blocked(_) => StatusCode::UNPROCESSABLE_ENTITY,
                PipelineError::ScanUnavailable(_) | PipelineError::StorageUnavailable(_) => {
                    StatusCode::SERVICE_UNAVAILABLE
                }
                PipelineError::Transport(_) => StatusCode::BAD_REQUEST,
                PipelineError::SessionNotFound => StatusCode::NOT_FOUND,
                PipelineError::SessionConflict(_) => StatusCode::CONFLICT,
            },
            AppError::BadRequest(_) => StatusCode::BAD_REQUEST,
            AppError::NotFound(_) => StatusCode::NOT_FOUND,
            AppError::Forbidden(_) => StatusCode::FORBIDDEN,
            AppError::Gone(_) => StatusCode::GONE,
            AppError::UnsupportedMediaType(_) => StatusCode::UNSUPPORTED_MEDIA_TYPE,
            AppError::Database(_) | AppError::Internal(_) | AppError::Anyhow(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            AppError::Pipeline(e) => e.kind(),
            AppError::BadRequest(_) => "bad_request",
            AppError::NotFound(_) => "not_found",
            AppError::Forbidden(_) => "forbidden",
            AppError::Gone(_) => "gone",
            AppError::UnsupportedMediaType(_) => "unsupported_media_type",
            AppError::Database(_) | AppError::Internal(_) | AppError::Anyhow(_) => "internal",
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let status = self.status();
        let kind = self.kind();
        let message = match self {
            AppError::Database(e) => {
                tracing::error!("Database error: {:?}", e);
                "Internal Server Error".to_string()
            }
            AppError::Internal(msg) => {
                tracing::error!("Internal error: {}", msg);
                "Internal Server Error".to_string()
            }
            AppError::Anyhow(e) => {
                tracing::error!("Anyhow error: {:?}", e);
                "Internal Server Error".to_string()
            }
            AppError::Pipeline(e) => e.public_message(),
            AppError::BadRequest(msg)
            | AppError::NotFound(msg)
            | AppError::Forbidden(msg)
            | AppError::Gone(msg)
            | AppError::UnsupportedMediaType(msg) => msg,
        };

        let body = Json(json!({
            "detail": message,
            "kind": kind,
        }));

        (status, body).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_pipeline_error_status_mapping() {
        let cases = [
            (PipelineError::TooLarge { limit: 1 }, StatusCode::PAYLOAD_TOO_LARGE),
            (PipelineError::Blocked("x".into()), StatusCode::UNPROCESSABLE_ENTITY),
            (PipelineError::ScanUnavailable("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (PipelineError::StorageUnavailable("x".into()), StatusCode::SERVICE_UNAVAILABLE),
            (PipelineError::Transport("x".into()), StatusCode::BAD_REQUEST),
            (PipelineError::SessionNotFound, StatusCode::NOT_FOUND),
            (PipelineError::SessionConflict("x".into()), StatusCode::CONFLICT),
        ];
        for (err, status) in cases {
            assert_eq!(AppError::from(err).status(), status);
        }
    }

    async fn detail(error: AppError) -> String {
        let bytes = axum::body::to_bytes(error.into_response().into_body(), usize::MAX)
            .await
            .unwrap();
        let body: serde_json::Value = serde_json::from_slice(&bytes).unwrap();
        body["detail"].as_str().unwrap().to_string()
    }

    #[tokio::test]
    async fn test_internal_details_are_hidden() {
        let response = AppError::Internal("db password wrong".into()).into_response();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        assert_eq!(
            detail(AppError::Internal("db password wrong".into())).await,
            "Internal Server Error"
        );
        assert_eq!(
            detail(PipelineError::StorageUnavailable("disk I/O error at /var/data".into()).into())
                .await,
            "Storage is temporarily unavailable"
        );
    }
}
