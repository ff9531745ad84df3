use crate::entities::stored_files;
use crate::models::{Classification, FileArtifact, ScanSource, UploadResult, UploadSession, Verdict};
use crate::services::error::PipelineError;
use crate::services::storage::StorageService;
use base64::Engine;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::Utc;
use rand::RngCore;
use sea_orm::{ActiveModelTrait, DatabaseConnection, Set};
use std::sync::Arc;
use std::time::Duration;

/// 256 bits of entropy, URL-safe
pub fn generate_download_id() -> String {
    let mut bytes = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Persists accepted artifacts and issues their download identifiers
pub struct StorageFinalizer {
    db: DatabaseConnection,
    storage: Arc<dyn StorageService>,
    public_base_url: url::Url,
    retention: chrono::Duration,
}

impl StorageFinalizer {
    pub fn new(
        db: DatabaseConnection,
        storage: Arc<dyn StorageService>,
        public_base_url: &str,
        retention: Duration,
    ) -> anyhow::Result<Self> {
        // A trailing slash makes `join` append rather than replace the last segment
        let mut base = url::Url::parse(public_base_url)?;
        if !base.path().ends_with('/') {
            let path = format!("{}/", base.path());
            base.set_path(&path);
        }
        Ok(Self {
            db,
            storage,
            public_base_url: base,
            retention: chrono::Duration::from_std(retention)?,
        })
    }

    pub fn download_url(&self, download_id: &str) -> Result<String, PipelineError> {
        self.public_base_url
            .join(&format!("download/{}", download_id))
            .map(|u| u.to_string())
            .map_err(|e| {
                tracing::error!("Failed to build download URL for {}: {}", download_id, e);
                PipelineError::StorageUnavailable("download url".to_string())
            })
    }

    pub async fn persist(
        &self,
        artifact: &FileArtifact,
        session: &UploadSession,
        verdict: &Verdict,
    ) -> Result<UploadResult, PipelineError> {
        if verdict.classification == Classification::Blocked {
            return Err(PipelineError::Blocked(
                "blocked files are never stored".to_string(),
            ));
        }

        let now = Utc::now();
        let download_id = generate_download_id();
        let storage_key = format!("uploads/{}/{}", now.format("%Y-%m-%d"), download_id);
        let download_url = self.download_url(&download_id)?;

        // 1. Object write (atomic per backend)
        self.storage
            .put_file(&storage_key, artifact.temporary_storage_path())
            .await
            .map_err(|e| {
                tracing::error!("Failed to store {}: {}", storage_key, e);
                PipelineError::StorageUnavailable("object write failed".to_string())
            })?;

        let clamav_result = finding_summary(verdict, ScanSource::LocalScanner);
        let virustotal_result = finding_summary(verdict, ScanSource::ReputationScanner);
        let warning = if verdict.warnings.is_empty() {
            None
        } else {
            Some(verdict.warnings.join("; "))
        };
        let expires_at = now + self.retention;

        // 2. Record; roll back the object if the row cannot be written
        let record = stored_files::ActiveModel {
            download_id: Set(download_id.clone()),
            session_token: Set(session.token.clone()),
            storage_key: Set(storage_key.clone()),
            filename: Set(artifact.original_name.clone()),
            size: Set(artifact.size_bytes as i64),
            mime_type: Set(artifact.mime_type_guess.clone()),
            digest: Set(artifact.digest.clone()),
            virus_scan: Set(verdict.classification.as_str().to_string()),
            clamav_result: Set(clamav_result.clone()),
            virustotal_result: Set(virustotal_result.clone()),
            warning: Set(warning.clone()),
            created_at: Set(now),
            expires_at: Set(expires_at),
        };
        if let Err(e) = record.insert(&self.db).await {
            tracing::error!("Failed to record {}: {}. Removing object.", download_id, e);
            if let Err(cleanup) = self.storage.delete_file(&storage_key).await {
                tracing::error!("Cleanup of {} failed: {}", storage_key, cleanup);
            }
            return Err(PipelineError::StorageUnavailable(
                "file record failed".to_string(),
            ));
        }

        tracing::info!(
            "💾 Stored '{}' ({} bytes) as {}",
            artifact.original_name,
            artifact.size_bytes,
            download_id
        );

        Ok(UploadResult {
            success: true,
            download_id,
            filename: artifact.original_name.clone(),
            size_bytes: artifact.size_bytes,
            download_url,
            virus_scan: verdict.classification.as_str().to_string(),
            clamav_result,
            virustotal_result,
            warning,
            warnings: verdict.warnings.clone(),
            expires_at,
        })
    }
}

/// Per-scanner status string; `skipped` when the scanner did not run
pub fn finding_summary(verdict: &Verdict, source: ScanSource) -> String {
    verdict
        .contributing_findings
        .iter()
        .find(|f| f.source == source)
        .map(|f| f.summary())
        .unwrap_or_else(|| "skipped".to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;

    #[test]
    fn test_download_ids_are_unique_and_url_safe() {
        let ids: HashSet<String> = (0..1000).map(|_| generate_download_id()).collect();
        assert_eq!(ids.len(), 1000);
        for id in &ids {
            assert_eq!(id.len(), 43);
            assert!(id.chars().all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_'));
        }
    }

    #[test]
    fn test_finding_summary_skipped() {
        let verdict = Verdict {
            classification: Classification::Clean,
            contributing_findings: vec![crate::models::ScanFinding::new(
                ScanSource::LocalScanner,
                crate::models::ScanOutcome::Clean,
                "",
            )],
            warnings: vec![],
        };
        assert_eq!(finding_summary(&verdict, ScanSource::LocalScanner), "clean");
        assert_eq!(
            finding_summary(&verdict, ScanSource::ReputationScanner),
            "skipped"
        );
    }
}
