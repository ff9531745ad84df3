use crate::entities::{prelude::*, scan_logs};
use crate::services::blacklist::DenylistStore;
use chrono::{Duration, Utc};
use sea_orm::{
    ActiveModelTrait, ColumnTrait, DatabaseConnection, EntityTrait, PaginatorTrait, QueryFilter,
    Set,
};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

/// One pipeline outcome, as written to `scan_logs`
#[derive(Debug, Clone, Default)]
pub struct ScanLogEntry {
    pub session_token: String,
    pub file_name: String,
    pub file_extension: Option<String>,
    pub file_size: Option<u64>,
    pub file_hash: Option<String>,
    pub clamav_result: Option<String>,
    pub virustotal_result: Option<String>,
    pub rejection_reason: Option<String>,
    pub owner: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct ScanStatistics {
    pub total_scans: u64,
    pub successful_uploads: u64,
    pub rejected_uploads: u64,
    pub infected_detections: u64,
    pub blacklisted_hashes: u64,
}

#[derive(Clone)]
pub struct ScanLogService {
    db: DatabaseConnection,
}

impl ScanLogService {
    pub fn new(db: DatabaseConnection) -> Self {
        Self { db }
    }

    pub async fn record(&self, entry: ScanLogEntry) -> Result<(), sea_orm::DbErr> {
        let status = if entry.rejection_reason.is_some() {
            "rejected"
        } else {
            "success"
        };
        scan_logs::ActiveModel {
            id: Set(Uuid::new_v4().to_string()),
            created_at: Set(Utc::now()),
            session_token: Set(entry.session_token),
            file_name: Set(entry.file_name),
            file_extension: Set(entry.file_extension),
            file_size: Set(entry.file_size.map(|s| s as i64)),
            file_hash: Set(entry.file_hash),
            clamav_result: Set(entry.clamav_result),
            virustotal_result: Set(entry.virustotal_result),
            upload_status: Set(status.to_string()),
            rejection_reason: Set(entry.rejection_reason),
            owner: Set(entry.owner),
        }
        .insert(&self.db)
        .await?;
        Ok(())
    }

    pub async fn statistics(&self) -> Result<ScanStatistics, sea_orm::DbErr> {
        let total_scans = ScanLogs::find().count(&self.db).await?;
        let successful_uploads = ScanLogs::find()
            .filter(scan_logs::Column::UploadStatus.eq("success"))
            .count(&self.db)
            .await?;
        let infected_detections = ScanLogs::find()
            .filter(
                scan_logs::Column::ClamavResult
                    .starts_with("infected")
                    .or(scan_logs::Column::VirustotalResult.starts_with("infected")),
            )
            .count(&self.db)
            .await?;
        let blacklisted_hashes = DenylistStore::count(&self.db)
            .await
            .map_err(|e| sea_orm::DbErr::Custom(e.to_string()))?;

        Ok(ScanStatistics {
            total_scans,
            successful_uploads,
            rejected_uploads: total_scans.saturating_sub(successful_uploads),
            infected_detections,
            blacklisted_hashes,
        })
    }

    /// Deletes log rows older than `days`. Returns the number removed.
    pub async fn purge_older_than(&self, days: i64) -> Result<u64, sea_orm::DbErr> {
        let cutoff = Utc::now() - Duration::days(days);
        let res = ScanLogs::delete_many()
            .filter(scan_logs::Column::CreatedAt.lt(cutoff))
            .exec(&self.db)
            .await?;
        Ok(res.rows_affected)
    }
}
