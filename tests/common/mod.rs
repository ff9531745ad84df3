#![allow(dead_code)]

use async_trait::async_trait;
use file_scan_gateway::config::FailurePolicy;
use file_scan_gateway::infrastructure::database;
use file_scan_gateway::models::{FileArtifact, ScanSource};
use file_scan_gateway::services::blacklist::{Denylist, DenylistStore};
use file_scan_gateway::services::finalizer::StorageFinalizer;
use file_scan_gateway::services::pipeline::{Orchestrator, PipelineDeps, PipelineSettings};
use file_scan_gateway::services::progress::ProgressHub;
use file_scan_gateway::services::scan_log::ScanLogService;
use file_scan_gateway::services::scanner::{ScanResult, Scanner};
use file_scan_gateway::services::session::SessionStore;
use file_scan_gateway::services::storage::{LocalStorageService, ObjectReader, StorageService};
use sea_orm::DatabaseConnection;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::TempDir;
use tokio_util::sync::CancellationToken;

/// Scanner that answers with a fixed result after an optional delay
pub struct MockScanner {
    source: ScanSource,
    result: ScanResult,
    delay: Duration,
    pub calls: AtomicUsize,
}

impl MockScanner {
    pub fn new(source: ScanSource, result: ScanResult) -> Arc<Self> {
        Self::slow(source, result, Duration::ZERO)
    }

    pub fn slow(source: ScanSource, result: ScanResult, delay: Duration) -> Arc<Self> {
        Arc::new(Self {
            source,
            result,
            delay,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn clean(source: ScanSource) -> Arc<Self> {
        Self::new(source, ScanResult::Clean)
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Scanner for MockScanner {
    fn source(&self) -> ScanSource {
        self.source
    }

    async fn inspect(
        &self,
        _artifact: &FileArtifact,
        cancel: &CancellationToken,
    ) -> anyhow::Result<ScanResult> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if !self.delay.is_zero() {
            tokio::select! {
                _ = cancel.cancelled() => anyhow::bail!("cancelled"),
                _ = tokio::time::sleep(self.delay) => {}
            }
        }
        Ok(self.result.clone())
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// Scanner that errors for its first `failures` calls, then reports clean
pub struct FlakyScanner {
    source: ScanSource,
    failures: usize,
    pub calls: AtomicUsize,
}

impl FlakyScanner {
    pub fn new(source: ScanSource, failures: usize) -> Arc<Self> {
        Arc::new(Self {
            source,
            failures,
            calls: AtomicUsize::new(0),
        })
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl Scanner for FlakyScanner {
    fn source(&self) -> ScanSource {
        self.source
    }

    async fn inspect(
        &self,
        _artifact: &FileArtifact,
        _cancel: &CancellationToken,
    ) -> anyhow::Result<ScanResult> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst);
        if call < self.failures {
            anyhow::bail!("connection refused");
        }
        Ok(ScanResult::Clean)
    }

    async fn health_check(&self) -> bool {
        true
    }
}

/// Storage whose writes always fail
pub struct BrokenStorage;

#[async_trait]
impl StorageService for BrokenStorage {
    async fn put_file(&self, _key: &str, _source: &Path) -> anyhow::Result<()> {
        anyhow::bail!("bucket unreachable")
    }

    async fn open_object(&self, _key: &str) -> anyhow::Result<ObjectReader> {
        anyhow::bail!("bucket unreachable")
    }

    async fn delete_file(&self, _key: &str) -> anyhow::Result<()> {
        Ok(())
    }

    async fn file_exists(&self, _key: &str) -> anyhow::Result<bool> {
        anyhow::bail!("bucket unreachable")
    }
}

pub struct HarnessOptions {
    pub local_scanner: Option<Arc<dyn Scanner>>,
    pub reputation_scanner: Option<Arc<dyn Scanner>>,
    pub denylist: Denylist,
    pub failure_policy: FailurePolicy,
    pub require_reputation: bool,
    pub size_limit: u64,
    pub local_timeout: Duration,
    pub reputation_timeout: Duration,
    pub max_retries: u32,
    pub broken_storage: bool,
}

impl Default for HarnessOptions {
    fn default() -> Self {
        Self {
            local_scanner: Some(MockScanner::clean(ScanSource::LocalScanner)),
            reputation_scanner: Some(MockScanner::clean(ScanSource::ReputationScanner)),
            denylist: Denylist::default(),
            failure_policy: FailurePolicy::FailClosed,
            require_reputation: false,
            size_limit: 1024 * 1024,
            local_timeout: Duration::from_secs(5),
            reputation_timeout: Duration::from_secs(5),
            max_retries: 1,
            broken_storage: false,
        }
    }
}

/// One orchestrator wired to a throwaway SQLite database and directories
pub struct Harness {
    _dir: TempDir,
    pub db: DatabaseConnection,
    pub storage: Arc<dyn StorageService>,
    pub orchestrator: Arc<Orchestrator>,
    pub scan_log: ScanLogService,
    pub temp_dir: PathBuf,
    pub storage_root: PathBuf,
}

impl Harness {
    pub async fn new(options: HarnessOptions) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let temp_dir = dir.path().join("tmp");
        let storage_root = dir.path().join("storage");
        std::fs::create_dir_all(&temp_dir).unwrap();
        std::fs::create_dir_all(&storage_root).unwrap();

        let db_url = format!("sqlite://{}?mode=rwc", dir.path().join("db.sqlite").display());
        let db = database::setup_database(&db_url).await.unwrap();

        let storage: Arc<dyn StorageService> = if options.broken_storage {
            Arc::new(BrokenStorage)
        } else {
            Arc::new(LocalStorageService::new(storage_root.clone()))
        };

        let scan_log = ScanLogService::new(db.clone());
        let finalizer = StorageFinalizer::new(
            db.clone(),
            storage.clone(),
            "http://gateway.test",
            Duration::from_secs(3600),
        )
        .unwrap();

        let orchestrator = Arc::new(Orchestrator::new(
            PipelineDeps {
                db: db.clone(),
                sessions: Arc::new(SessionStore::new(
                    Duration::from_secs(3600),
                    Duration::from_secs(60),
                    options.size_limit,
                )),
                progress: Arc::new(ProgressHub::new()),
                denylist: Arc::new(DenylistStore::with_snapshot(options.denylist)),
                local_scanner: options.local_scanner,
                reputation_scanner: options.reputation_scanner,
                finalizer,
                scan_log: scan_log.clone(),
            },
            PipelineSettings {
                temp_dir: temp_dir.clone(),
                local_timeout: options.local_timeout,
                reputation_timeout: options.reputation_timeout,
                max_retries: options.max_retries,
                retry_backoff: Duration::from_millis(10),
                failure_policy: options.failure_policy,
                require_reputation: options.require_reputation,
            },
        ));

        Self {
            _dir: dir,
            db,
            storage,
            orchestrator,
            scan_log,
            temp_dir,
            storage_root,
        }
    }

    pub fn new_session(&self) -> String {
        self.orchestrator.sessions().create(None).token
    }

    pub fn temp_file_count(&self) -> usize {
        std::fs::read_dir(&self.temp_dir).unwrap().count()
    }

    /// Regular files anywhere under the storage root
    pub fn stored_object_count(&self) -> usize {
        fn walk(dir: &Path) -> usize {
            std::fs::read_dir(dir)
                .unwrap()
                .map(|e| e.unwrap().path())
                .map(|p| if p.is_dir() { walk(&p) } else { 1 })
                .sum()
        }
        walk(&self.storage_root)
    }
}
