use thiserror::Error;

/// Terminal failures of an upload pipeline run
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum PipelineError {
    #[error("File exceeds the maximum allowed size of {limit} bytes")]
    TooLarge { limit: u64 },

    #[error("Security scan unavailable: {0}")]
    ScanUnavailable(String),

    #[error("File rejected: {0}")]
    Blocked(String),

    #[error("Storage unavailable: {0}")]
    StorageUnavailable(String),

    #[error("Upload interrupted: {0}")]
    Transport(String),

    #[error("Upload session not found or expired")]
    SessionNotFound,

    #[error("Upload session is not accepting uploads: {0}")]
    SessionConflict(String),
}

impl PipelineError {
    /// Stable machine-readable kind used in API and progress payloads
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::TooLarge { .. } => "too_large",
            PipelineError::ScanUnavailable(_) => "scan_unavailable",
            PipelineError::Blocked(_) => "blocked",
            PipelineError::StorageUnavailable(_) => "storage_unavailable",
            PipelineError::Transport(_) => "transport",
            PipelineError::SessionNotFound => "session_not_found",
            PipelineError::SessionConflict(_) => "session_conflict",
        }
    }

    /// Text safe to hand to clients. Infrastructure causes stay in the logs.
    pub fn public_message(&self) -> String {
        match self {
            PipelineError::StorageUnavailable(_) => {
                "Storage is temporarily unavailable".to_string()
            }
            PipelineError::Transport(_) => "Upload was interrupted".to_string(),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_public_message_hides_infrastructure_detail() {
        let err = PipelineError::StorageUnavailable(
            "temp file: No such file or directory at path \"/tmp/upload-x\"".to_string(),
        );
        assert_eq!(err.public_message(), "Storage is temporarily unavailable");

        let err = PipelineError::Transport("connection reset by peer".to_string());
        assert_eq!(err.public_message(), "Upload was interrupted");

        let err = PipelineError::Blocked("malware detected by ClamAV: Eicar".to_string());
        assert!(err.public_message().contains("Eicar"));
    }
}
