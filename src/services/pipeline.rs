use crate::config::{FailurePolicy, GatewayConfig};
use crate::models::{
    Classification, FileArtifact, ProgressEvent, ScanFinding, ScanOutcome, ScanSource,
    SessionState, Stage, UploadResult, UploadSession,
};
use crate::services::blacklist::{BlacklistChecker, DenylistStore};
use crate::services::error::PipelineError;
use crate::services::finalizer::{StorageFinalizer, finding_summary};
use crate::services::hasher;
use crate::services::progress::{ChannelMessage, ProgressHub};
use crate::services::scan_log::{ScanLogEntry, ScanLogService};
use crate::services::scanner::Scanner;
use crate::services::session::SessionStore;
use crate::services::verdict::{self, VerdictPolicy};
use sea_orm::DatabaseConnection;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::io::AsyncRead;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;

/// Incoming file for a session
pub struct UploadRequest<R> {
    pub filename: String,
    pub declared_size: Option<u64>,
    pub reader: R,
}

#[derive(Debug, Clone)]
pub struct PipelineSettings {
    pub temp_dir: PathBuf,
    pub local_timeout: Duration,
    pub reputation_timeout: Duration,
    pub max_retries: u32,
    pub retry_backoff: Duration,
    pub failure_policy: FailurePolicy,
    pub require_reputation: bool,
}

impl PipelineSettings {
    pub fn from_config(config: &GatewayConfig) -> Self {
        Self {
            temp_dir: config.temp_dir.clone(),
            local_timeout: config.clamav_timeout,
            reputation_timeout: config.virustotal_timeout,
            max_retries: config.scan_max_retries,
            retry_backoff: config.scan_retry_backoff,
            failure_policy: config.failure_policy,
            require_reputation: config.require_reputation_scan,
        }
    }
}

/// Shared services the orchestrator drives
pub struct PipelineDeps {
    pub db: DatabaseConnection,
    pub sessions: Arc<SessionStore>,
    pub progress: Arc<ProgressHub>,
    pub denylist: Arc<DenylistStore>,
    pub local_scanner: Option<Arc<dyn Scanner>>,
    pub reputation_scanner: Option<Arc<dyn Scanner>>,
    pub finalizer: StorageFinalizer,
    pub scan_log: ScanLogService,
}

/// Drives one upload through hashing, blacklist, scanning, verdict and
/// storage, reporting progress on the session's channel.
pub struct Orchestrator {
    deps: PipelineDeps,
    blacklist: BlacklistChecker,
    settings: PipelineSettings,
}

/// Marks the session failed if the pipeline future is dropped mid-run
struct RunGuard<'a> {
    token: &'a str,
    sessions: &'a SessionStore,
    progress: &'a ProgressHub,
    armed: bool,
}

impl Drop for RunGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            tracing::warn!("⚠️ Upload {} abandoned by client", self.token);
            self.sessions.fail(self.token);
            self.progress.close(
                self.token,
                Err(&PipelineError::Transport("client disconnected".to_string())),
            );
        }
    }
}

impl Orchestrator {
    pub fn new(deps: PipelineDeps, settings: PipelineSettings) -> Self {
        let blacklist = BlacklistChecker::new(deps.denylist.clone());
        Self {
            deps,
            blacklist,
            settings,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionStore> {
        &self.deps.sessions
    }

    pub fn progress(&self) -> &Arc<ProgressHub> {
        &self.deps.progress
    }

    /// Aborts `token`. A running pipeline closes the channel itself when it
    /// notices the cancellation; a pending session is closed here.
    pub fn abort(&self, token: &str) -> Result<(), PipelineError> {
        if self.deps.sessions.abort(token)? == SessionState::Pending {
            self.deps.progress.close(
                token,
                Err(&PipelineError::Transport("upload cancelled".to_string())),
            );
        }
        Ok(())
    }

    /// Attaches a progress listener to a live session. Finished sessions will
    /// never publish again, so they are refused instead of left hanging.
    pub fn subscribe(
        &self,
        token: &str,
    ) -> Result<(u64, UnboundedReceiver<ChannelMessage>), PipelineError> {
        self.ensure_subscribable(token)?;
        let (id, rx) = self.deps.progress.subscribe(token);
        // The terminal transition happens before the final close, so a state
        // read after registering cannot miss it
        if let Err(e) = self.ensure_subscribable(token) {
            self.deps.progress.unsubscribe(token, id);
            return Err(e);
        }
        Ok((id, rx))
    }

    /// Checks that `token` names a session that can still report progress
    pub fn ensure_subscribable(&self, token: &str) -> Result<(), PipelineError> {
        let session = self
            .deps
            .sessions
            .get(token)
            .ok_or(PipelineError::SessionNotFound)?;
        if session.state.is_terminal() {
            return Err(PipelineError::SessionConflict(
                "upload already finished".to_string(),
            ));
        }
        Ok(())
    }

    fn policy(&self) -> VerdictPolicy {
        let mut required = vec![ScanSource::Blacklist];
        if self.deps.local_scanner.is_some() {
            required.push(ScanSource::LocalScanner);
        }
        if self.settings.require_reputation {
            required.push(ScanSource::ReputationScanner);
        }
        VerdictPolicy::new(self.settings.failure_policy, required)
    }

    /// Runs the whole pipeline for `token`. Every terminal outcome closes the
    /// session's progress channel and is written to the scan log.
    pub async fn run_pipeline<R>(
        &self,
        token: &str,
        request: UploadRequest<R>,
    ) -> Result<UploadResult, PipelineError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let (session, cancel) = self.deps.sessions.begin(token)?;
        let mut guard = RunGuard {
            token,
            sessions: &self.deps.sessions,
            progress: &self.deps.progress,
            armed: true,
        };

        tracing::info!("🚀 Pipeline started for session {} ('{}')", token, request.filename);

        let mut log = ScanLogEntry {
            session_token: token.to_string(),
            file_name: request.filename.clone(),
            file_extension: crate::utils::validation::extension_of(&request.filename),
            owner: session.owner.clone(),
            ..Default::default()
        };

        let outcome = self.execute(&session, &cancel, request, &mut log).await;
        guard.armed = false;

        match &outcome {
            Ok(result) => {
                self.deps.sessions.transition(token, SessionState::Done);
                self.deps.progress.close(token, Ok(result));
                tracing::info!(
                    "✅ Session {} complete: {} ({})",
                    token,
                    result.download_id,
                    result.virus_scan
                );
            }
            Err(e) => {
                self.deps.sessions.fail(token);
                self.deps.progress.close(token, Err(e));
                log.rejection_reason = Some(e.to_string());
                tracing::warn!("🛡️ Session {} rejected: {}", token, e);
            }
        }

        if let Err(e) = self.deps.scan_log.record(log).await {
            tracing::error!("Failed to write scan log for {}: {}", token, e);
        }

        outcome
    }

    async fn execute<R>(
        &self,
        session: &UploadSession,
        cancel: &CancellationToken,
        request: UploadRequest<R>,
        log: &mut ScanLogEntry,
    ) -> Result<UploadResult, PipelineError>
    where
        R: AsyncRead + Unpin + Send,
    {
        let token = session.token.as_str();

        // 1. Hashing (size limit enforced before and during the stream)
        ensure_live(cancel)?;
        let artifact = hasher::hash_upload(
            request.reader,
            &request.filename,
            request.declared_size,
            session.size_limit,
            &self.settings.temp_dir,
            cancel,
        )
        .await?;
        log.file_size = Some(artifact.size_bytes);
        log.file_hash = Some(artifact.digest.clone());
        self.advance(token, SessionState::BlacklistCheck);
        self.publish(token, Stage::Hashing, 20, "File received and hashed");

        // 2. Blacklist
        ensure_live(cancel)?;
        let blacklist_finding = self.check_blacklist(&artifact).await;
        self.publish(token, Stage::BlacklistCheck, 30, "Blacklist check complete");
        if blacklist_finding.outcome == ScanOutcome::Blocked {
            return Err(PipelineError::Blocked(format!(
                "File is blacklisted: {}",
                blacklist_finding.detail
            )));
        }

        // 3. Local and reputation scans, concurrently
        ensure_live(cancel)?;
        self.advance(token, SessionState::Scanning);
        let scanner_count = [
            self.deps.local_scanner.is_some(),
            self.deps.reputation_scanner.is_some(),
        ]
        .iter()
        .filter(|enabled| **enabled)
        .count();
        let completed = AtomicUsize::new(0);
        let (local, reputation) = tokio::join!(
            self.run_scanner(
                self.deps.local_scanner.as_ref(),
                self.settings.local_timeout,
                &artifact,
                cancel,
                (&completed, scanner_count),
                token,
            ),
            self.run_scanner(
                self.deps.reputation_scanner.as_ref(),
                self.settings.reputation_timeout,
                &artifact,
                cancel,
                (&completed, scanner_count),
                token,
            ),
        );
        ensure_live(cancel)?;

        // 4. Verdict
        self.advance(token, SessionState::Verdict);
        let mut findings = vec![blacklist_finding];
        findings.extend(local);
        match reputation {
            Some(f) => findings.push(f),
            None if self.settings.require_reputation => findings.push(ScanFinding::new(
                ScanSource::ReputationScanner,
                ScanOutcome::Error,
                "not configured",
            )),
            None => {}
        }

        let verdict = verdict::resolve(&findings, &self.policy());
        log.clamav_result = Some(finding_summary(&verdict, ScanSource::LocalScanner));
        log.virustotal_result = Some(finding_summary(&verdict, ScanSource::ReputationScanner));
        self.publish(token, Stage::FinalCheck, 90, "Security checks complete");

        self.remember_detections(&artifact, &findings).await;

        if verdict.classification == Classification::Blocked {
            if verdict::is_inconclusive(&verdict) {
                let failed: Vec<&str> = findings
                    .iter()
                    .filter(|f| f.outcome == ScanOutcome::Error)
                    .map(|f| f.source.display_name())
                    .collect();
                return Err(PipelineError::ScanUnavailable(format!(
                    "{} could not verify the file",
                    failed.join(", ")
                )));
            }
            let reason = findings
                .iter()
                .find(|f| f.outcome == ScanOutcome::Blocked)
                .map(|f| format!("malware detected by {}: {}", f.source.display_name(), f.detail))
                .unwrap_or_else(|| "malware detected".to_string());
            return Err(PipelineError::Blocked(reason));
        }

        // 5. Saving
        ensure_live(cancel)?;
        self.advance(token, SessionState::Saving);
        let result = self.deps.finalizer.persist(&artifact, session, &verdict).await?;
        self.publish(token, Stage::Saving, 95, "File saved");

        Ok(result)
    }

    fn advance(&self, token: &str, next: SessionState) {
        self.deps.sessions.transition(token, next);
    }

    fn publish(&self, token: &str, stage: Stage, percent: u8, message: &str) {
        self.deps
            .progress
            .publish(token, ProgressEvent::new(stage, percent, message));
    }

    /// Blacklist lookup; a missing snapshot is retried after a forced reload
    async fn check_blacklist(&self, artifact: &FileArtifact) -> ScanFinding {
        let mut finding = self.blacklist.check(artifact);
        let mut attempt = 0;
        while finding.outcome == ScanOutcome::Error && attempt < self.settings.max_retries {
            attempt += 1;
            if let Err(e) = self.deps.denylist.refresh(&self.deps.db).await {
                tracing::warn!("Denylist reload failed (attempt {}): {}", attempt, e);
            }
            finding = self.blacklist.check(artifact);
        }
        finding
    }

    /// Runs one scanner with retries and publishes its completion
    async fn run_scanner(
        &self,
        scanner: Option<&Arc<dyn Scanner>>,
        timeout: Duration,
        artifact: &FileArtifact,
        cancel: &CancellationToken,
        (completed, total): (&AtomicUsize, usize),
        token: &str,
    ) -> Option<ScanFinding> {
        let scanner = scanner?;
        let source = scanner.source();

        let mut attempt: u32 = 0;
        let finding = loop {
            let finding = scanner.scan(artifact, timeout, cancel).await;
            if finding.outcome != ScanOutcome::Error
                || !finding.retryable
                || attempt >= self.settings.max_retries
                || cancel.is_cancelled()
            {
                break finding;
            }
            let backoff = self.settings.retry_backoff * 2u32.saturating_pow(attempt);
            tracing::info!(
                "🔁 Retrying {} scan in {:?} after: {}",
                source.display_name(),
                backoff,
                finding.detail
            );
            tokio::select! {
                _ = cancel.cancelled() => break finding,
                _ = tokio::time::sleep(backoff) => {}
            }
            attempt += 1;
        };

        if !cancel.is_cancelled() {
            let done = completed.fetch_add(1, Ordering::SeqCst) + 1;
            let percent = 30 + (50 * done / total.max(1)) as u8;
            let stage = match source {
                ScanSource::ReputationScanner => Stage::VirustotalChecking,
                _ => Stage::ClamavScanning,
            };
            self.publish(
                token,
                stage,
                percent,
                &format!("{} check: {}", source.display_name(), finding.outcome.as_str()),
            );
        }

        Some(finding)
    }

    /// Malware detections are added to the persistent hash blacklist
    async fn remember_detections(&self, artifact: &FileArtifact, findings: &[ScanFinding]) {
        for finding in findings.iter().filter(|f| {
            f.outcome == ScanOutcome::Blocked && f.source != ScanSource::Blacklist
        }) {
            if let Err(e) = self
                .deps
                .denylist
                .record_detection(&self.deps.db, &artifact.digest, finding.source, &finding.detail)
                .await
            {
                tracing::error!("Failed to blacklist {}: {}", artifact.digest, e);
            }
        }
    }
}

fn ensure_live(cancel: &CancellationToken) -> Result<(), PipelineError> {
    if cancel.is_cancelled() {
        Err(PipelineError::Transport("upload cancelled".to_string()))
    } else {
        Ok(())
    }
}
