use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tempfile::TempPath;
use utoipa::ToSchema;

/// Lifecycle of an upload session. States only move forward, except that
/// any state may move to `Failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Pending,
    Hashing,
    BlacklistCheck,
    Scanning,
    Verdict,
    Saving,
    Done,
    Failed,
}

impl SessionState {
    pub fn is_terminal(self) -> bool {
        matches!(self, SessionState::Done | SessionState::Failed)
    }

    /// Whether `next` is a legal successor of `self`
    pub fn can_transition_to(self, next: SessionState) -> bool {
        if self.is_terminal() {
            return false;
        }
        next == SessionState::Failed || next > self
    }
}

#[derive(Debug, Clone, Serialize, ToSchema)]
pub struct UploadSession {
    pub token: String,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
    pub size_limit: u64,
    pub state: SessionState,
    pub owner: Option<String>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl UploadSession {
    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at
    }
}

/// A fully received upload. Owns its temporary file: dropping the artifact
/// removes the file.
#[derive(Debug)]
pub struct FileArtifact {
    pub digest: String,
    pub size_bytes: u64,
    pub original_name: String,
    pub mime_type_guess: String,
    temp_path: TempPath,
}

impl FileArtifact {
    pub fn new(
        digest: String,
        size_bytes: u64,
        original_name: String,
        mime_type_guess: String,
        temp_path: TempPath,
    ) -> Self {
        Self {
            digest,
            size_bytes,
            original_name,
            mime_type_guess,
            temp_path,
        }
    }

    pub fn temporary_storage_path(&self) -> &Path {
        &self.temp_path
    }

    /// Lowercased extension of the original name, with leading dot
    pub fn extension(&self) -> Option<String> {
        crate::utils::validation::extension_of(&self.original_name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
pub enum ScanSource {
    Blacklist,
    LocalScanner,
    ReputationScanner,
}

impl ScanSource {
    /// Human-facing name used in warnings and logs
    pub fn display_name(self) -> &'static str {
        match self {
            ScanSource::Blacklist => "Blacklist",
            ScanSource::LocalScanner => "ClamAV",
            ScanSource::ReputationScanner => "VirusTotal",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum ScanOutcome {
    Clean,
    Suspicious,
    Blocked,
    Error,
}

impl ScanOutcome {
    pub fn as_str(self) -> &'static str {
        match self {
            ScanOutcome::Clean => "clean",
            ScanOutcome::Suspicious => "suspicious",
            ScanOutcome::Blocked => "infected",
            ScanOutcome::Error => "error",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct ScanFinding {
    pub source: ScanSource,
    pub outcome: ScanOutcome,
    pub detail: String,
    pub latency_ms: u64,
    /// False when a repeat attempt cannot change an `Error` outcome
    #[serde(skip)]
    pub retryable: bool,
}

impl ScanFinding {
    pub fn new(source: ScanSource, outcome: ScanOutcome, detail: impl Into<String>) -> Self {
        Self {
            source,
            outcome,
            detail: detail.into(),
            latency_ms: 0,
            retryable: true,
        }
    }

    pub fn final_answer(mut self) -> Self {
        self.retryable = false;
        self
    }

    pub fn with_latency(mut self, latency_ms: u64) -> Self {
        self.latency_ms = latency_ms;
        self
    }

    /// Short status string stored in logs and response bodies, e.g. `"infected: Eicar-Test"`
    pub fn summary(&self) -> String {
        if self.detail.is_empty() {
            self.outcome.as_str().to_string()
        } else {
            format!("{}: {}", self.outcome.as_str(), self.detail)
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Classification {
    Clean,
    Suspicious,
    Blocked,
}

impl Classification {
    pub fn as_str(self) -> &'static str {
        match self {
            Classification::Clean => "clean",
            Classification::Suspicious => "suspicious",
            Classification::Blocked => "infected",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
pub struct Verdict {
    pub classification: Classification,
    pub contributing_findings: Vec<ScanFinding>,
    pub warnings: Vec<String>,
}

/// Returned to the client once a file is stored
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct UploadResult {
    pub success: bool,
    #[serde(rename = "file_id")]
    pub download_id: String,
    pub filename: String,
    #[serde(rename = "size")]
    pub size_bytes: u64,
    pub download_url: String,
    /// `clean` or `suspicious`
    pub virus_scan: String,
    pub clamav_result: String,
    pub virustotal_result: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub warning: Option<String>,
    pub warnings: Vec<String>,
    pub expires_at: DateTime<Utc>,
}

/// Pipeline stages in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    Hashing,
    BlacklistCheck,
    ClamavScanning,
    VirustotalChecking,
    FinalCheck,
    Saving,
    Complete,
}

impl Stage {
    pub fn as_str(self) -> &'static str {
        match self {
            Stage::Hashing => "hashing",
            Stage::BlacklistCheck => "blacklist_check",
            Stage::ClamavScanning => "clamav_scanning",
            Stage::VirustotalChecking => "virustotal_checking",
            Stage::FinalCheck => "final_check",
            Stage::Saving => "saving",
            Stage::Complete => "complete",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct ProgressEvent {
    pub stage: Stage,
    pub percent: u8,
    pub message: String,
}

impl ProgressEvent {
    pub fn new(stage: Stage, percent: u8, message: impl Into<String>) -> Self {
        Self {
            stage,
            percent: percent.min(100),
            message: message.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_state_order_is_monotonic() {
        assert!(SessionState::Pending.can_transition_to(SessionState::Hashing));
        assert!(SessionState::Hashing.can_transition_to(SessionState::Scanning));
        assert!(!SessionState::Scanning.can_transition_to(SessionState::Hashing));
        assert!(!SessionState::Saving.can_transition_to(SessionState::Saving));
    }

    #[test]
    fn test_failed_reachable_from_any_live_state() {
        for state in [
            SessionState::Pending,
            SessionState::Hashing,
            SessionState::BlacklistCheck,
            SessionState::Scanning,
            SessionState::Verdict,
            SessionState::Saving,
        ] {
            assert!(state.can_transition_to(SessionState::Failed));
        }
        assert!(!SessionState::Done.can_transition_to(SessionState::Failed));
        assert!(!SessionState::Failed.can_transition_to(SessionState::Done));
    }

    #[test]
    fn test_finding_summary() {
        let finding = ScanFinding::new(ScanSource::LocalScanner, ScanOutcome::Blocked, "Eicar-Test");
        assert_eq!(finding.summary(), "infected: Eicar-Test");
        let clean = ScanFinding::new(ScanSource::LocalScanner, ScanOutcome::Clean, "");
        assert_eq!(clean.summary(), "clean");
    }

    #[test]
    fn test_progress_percent_is_capped() {
        assert_eq!(ProgressEvent::new(Stage::Saving, 140, "x").percent, 100);
    }
}
