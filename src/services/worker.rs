use crate::entities::{prelude::*, stored_files};
use crate::services::blacklist::DenylistStore;
use crate::services::error::PipelineError;
use crate::services::progress::ProgressHub;
use crate::services::scan_log::ScanLogService;
use crate::services::session::SessionStore;
use crate::services::storage::StorageService;
use chrono::Utc;
use sea_orm::{ColumnTrait, DatabaseConnection, EntityTrait, QueryFilter, QuerySelect};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{MissedTickBehavior, interval};

const CLEANUP_INTERVAL: Duration = Duration::from_secs(600);

pub struct BackgroundWorker {
    db: DatabaseConnection,
    storage: Arc<dyn StorageService>,
    sessions: Arc<SessionStore>,
    progress: Arc<ProgressHub>,
    denylist: Arc<DenylistStore>,
    scan_log: ScanLogService,
    denylist_refresh: Duration,
    scan_log_retention_days: i64,
    shutdown: watch::Receiver<bool>,
}

impl BackgroundWorker {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        db: DatabaseConnection,
        storage: Arc<dyn StorageService>,
        sessions: Arc<SessionStore>,
        progress: Arc<ProgressHub>,
        denylist: Arc<DenylistStore>,
        denylist_refresh: Duration,
        scan_log_retention_days: i64,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        let scan_log = ScanLogService::new(db.clone());
        Self {
            db,
            storage,
            sessions,
            progress,
            denylist,
            scan_log,
            denylist_refresh,
            scan_log_retention_days,
            shutdown,
        }
    }

    pub async fn run(mut self) {
        tracing::info!("🚀 Background worker started");

        let mut refresh_tick = interval(self.denylist_refresh.max(Duration::from_secs(1)));
        refresh_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);
        let mut cleanup_tick = interval(CLEANUP_INTERVAL);
        cleanup_tick.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = self.shutdown.changed() => {
                    tracing::info!("🛑 Background worker shutting down");
                    break;
                }
                _ = refresh_tick.tick() => {
                    if let Err(e) = self.denylist.refresh(&self.db).await {
                        tracing::warn!("⚠️ Denylist refresh failed, keeping previous snapshot: {}", e);
                    }
                }
                _ = cleanup_tick.tick() => {
                    self.perform_cleanup().await;
                }
            }
        }
    }

    pub async fn perform_cleanup(&self) {
        tracing::info!("🧹 Running background cleanup tasks...");

        // 1. Sessions (and any listener still attached to them)
        let purged = self.purge_sessions();
        if purged > 0 {
            tracing::info!("Purged {} upload sessions", purged);
        }

        // 2. Expired files
        match self.expire_files().await {
            Ok(0) => {}
            Ok(n) => tracing::info!("Expired {} stored files", n),
            Err(e) => tracing::error!("Failed to expire files: {}", e),
        }

        // 3. Scan log retention
        match self.scan_log.purge_older_than(self.scan_log_retention_days).await {
            Ok(0) => {}
            Ok(n) => tracing::info!("Pruned {} scan log entries", n),
            Err(e) => tracing::error!("Failed to prune scan logs: {}", e),
        }

        tracing::info!("✅ Background cleanup completed");
    }

    pub fn purge_sessions(&self) -> usize {
        let removed = self.sessions.purge_expired(Utc::now());
        for token in &removed {
            self.progress.close(token, Err(&PipelineError::SessionNotFound));
        }
        removed.len()
    }

    /// Deletes the object first, then the row, so a failed delete is retried next pass
    pub async fn expire_files(&self) -> Result<usize, sea_orm::DbErr> {
        let expired = StoredFiles::find()
            .filter(stored_files::Column::ExpiresAt.lt(Utc::now()))
            .limit(100)
            .all(&self.db)
            .await?;

        let mut removed = 0;
        for file in expired {
            if let Err(e) = self.storage.delete_file(&file.storage_key).await {
                tracing::error!("Failed to delete object {}: {}", file.storage_key, e);
                continue;
            }
            StoredFiles::delete_by_id(file.download_id.clone())
                .exec(&self.db)
                .await?;
            tracing::info!("Expired file: {}", file.download_id);
            removed += 1;
        }
        Ok(removed)
    }
}
