use crate::entities::{hash_blacklist, prelude::*};
use crate::models::{FileArtifact, ScanFinding, ScanOutcome, ScanSource};
use crate::utils::hash::normalize_digest;
use anyhow::Result;
use chrono::Utc;
use sea_orm::{ActiveModelTrait, DatabaseConnection, EntityTrait, PaginatorTrait, Set};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};

/// Immutable snapshot of everything the blacklist stage rejects
#[derive(Debug, Clone, Default)]
pub struct Denylist {
    /// sha256 hex -> reason
    pub digests: HashMap<String, String>,
    /// ".ext" -> reason
    pub extensions: HashMap<String, String>,
}

impl Denylist {
    pub fn new(
        digests: impl IntoIterator<Item = (String, String)>,
        extensions: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            digests: digests
                .into_iter()
                .filter_map(|(d, reason)| normalize_digest(&d).map(|d| (d, reason)))
                .collect(),
            extensions: extensions
                .into_iter()
                .map(|e| {
                    let e = e.to_lowercase();
                    let reason = format!("file type {} is not allowed", e);
                    (e, reason)
                })
                .collect(),
        }
    }

    /// Returns the rejection reason if the artifact is denied
    pub fn lookup(&self, digest: &str, extension: Option<&str>) -> Option<&str> {
        if let Some(reason) = self.digests.get(digest) {
            return Some(reason);
        }
        extension.and_then(|ext| self.extensions.get(ext).map(String::as_str))
    }
}

/// Holds the current denylist snapshot. Snapshots are swapped wholesale on
/// refresh and never mutated in place, so readers always see a consistent list.
pub struct DenylistStore {
    current: RwLock<Option<Arc<Denylist>>>,
    blocked_extensions: Vec<String>,
}

impl DenylistStore {
    pub fn new(blocked_extensions: Vec<String>) -> Self {
        Self {
            current: RwLock::new(None),
            blocked_extensions,
        }
    }

    /// Store seeded with a snapshot, bypassing the database
    pub fn with_snapshot(denylist: Denylist) -> Self {
        Self {
            current: RwLock::new(Some(Arc::new(denylist))),
            blocked_extensions: Vec::new(),
        }
    }

    pub fn snapshot(&self) -> Option<Arc<Denylist>> {
        self.current
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    pub fn replace(&self, denylist: Denylist) {
        *self.current.write().unwrap_or_else(|e| e.into_inner()) = Some(Arc::new(denylist));
    }

    /// Rebuilds the snapshot from the `hash_blacklist` table. On failure the
    /// previous snapshot stays in place.
    pub async fn refresh(&self, db: &DatabaseConnection) -> Result<usize> {
        let rows = HashBlacklist::find().all(db).await?;
        let denylist = Denylist::new(
            rows.into_iter().map(|r| {
                let reason = format!("previously detected by {}: {}", r.detection_source, r.detail);
                (r.file_hash, reason)
            }),
            self.blocked_extensions.iter().cloned(),
        );
        let count = denylist.digests.len();
        self.replace(denylist);
        tracing::debug!("Denylist refreshed: {} digests", count);
        Ok(count)
    }

    /// Persists a malware detection and publishes a new snapshot containing it
    pub async fn record_detection(
        &self,
        db: &DatabaseConnection,
        digest: &str,
        source: ScanSource,
        detail: &str,
    ) -> Result<()> {
        let now = Utc::now();
        match HashBlacklist::find_by_id(digest.to_string()).one(db).await? {
            Some(existing) => {
                let count = existing.detection_count + 1;
                let mut active: hash_blacklist::ActiveModel = existing.into();
                active.last_detected = Set(now);
                active.detection_count = Set(count);
                active.detail = Set(detail.to_string());
                active.update(db).await?;
            }
            None => {
                hash_blacklist::ActiveModel {
                    file_hash: Set(digest.to_string()),
                    detection_source: Set(source.display_name().to_string()),
                    detail: Set(detail.to_string()),
                    first_detected: Set(now),
                    last_detected: Set(now),
                    detection_count: Set(1),
                }
                .insert(db)
                .await?;
            }
        }
        tracing::warn!(
            "☣️ Added {} to hash blacklist ({}: {})",
            digest,
            source.display_name(),
            detail
        );

        // Publish immediately even if the follow-up reload fails
        let mut next = self.snapshot().map(|s| (*s).clone()).unwrap_or_default();
        next.digests.insert(
            digest.to_string(),
            format!("previously detected by {}: {}", source.display_name(), detail),
        );
        self.replace(next);
        if let Err(e) = self.refresh(db).await {
            tracing::warn!("Denylist reload after detection failed: {}", e);
        }
        Ok(())
    }

    pub async fn count(db: &DatabaseConnection) -> Result<u64> {
        Ok(HashBlacklist::find().count(db).await?)
    }
}

/// Blacklist stage: a pure lookup against the current snapshot
pub struct BlacklistChecker {
    store: Arc<DenylistStore>,
}

impl BlacklistChecker {
    pub fn new(store: Arc<DenylistStore>) -> Self {
        Self { store }
    }

    pub fn check(&self, artifact: &FileArtifact) -> ScanFinding {
        let started = std::time::Instant::now();
        let Some(denylist) = self.store.snapshot() else {
            return ScanFinding::new(
                ScanSource::Blacklist,
                ScanOutcome::Error,
                "denylist not loaded",
            );
        };

        let extension = artifact.extension();
        let finding = match denylist.lookup(&artifact.digest, extension.as_deref()) {
            Some(reason) => ScanFinding::new(ScanSource::Blacklist, ScanOutcome::Blocked, reason),
            None => ScanFinding::new(ScanSource::Blacklist, ScanOutcome::Clean, ""),
        };
        finding.with_latency(started.elapsed().as_millis() as u64)
    }
}
