use crate::models::{SessionState, UploadSession};
use crate::services::error::PipelineError;
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

struct SessionEntry {
    session: UploadSession,
    cancel: CancellationToken,
}

/// In-memory registry of upload sessions keyed by token
pub struct SessionStore {
    sessions: DashMap<String, SessionEntry>,
    ttl: chrono::Duration,
    retention: chrono::Duration,
    size_limit: u64,
}

impl SessionStore {
    pub fn new(ttl: Duration, retention: Duration, size_limit: u64) -> Self {
        Self {
            sessions: DashMap::new(),
            ttl: to_chrono(ttl),
            retention: to_chrono(retention),
            size_limit,
        }
    }

    pub fn create(&self, owner: Option<String>) -> UploadSession {
        let now = Utc::now();
        let session = UploadSession {
            token: Uuid::new_v4().to_string(),
            created_at: now,
            expires_at: now + self.ttl,
            size_limit: self.size_limit,
            state: SessionState::Pending,
            owner,
            finished_at: None,
        };
        self.sessions.insert(
            session.token.clone(),
            SessionEntry {
                session: session.clone(),
                cancel: CancellationToken::new(),
            },
        );
        tracing::info!("🎫 Upload session created: {}", session.token);
        session
    }

    pub fn get(&self, token: &str) -> Option<UploadSession> {
        self.sessions.get(token).map(|e| e.session.clone())
    }

    /// Claims a pending, unexpired session for a pipeline run (Pending -> Hashing)
    pub fn begin(&self, token: &str) -> Result<(UploadSession, CancellationToken), PipelineError> {
        let mut entry = self
            .sessions
            .get_mut(token)
            .ok_or(PipelineError::SessionNotFound)?;

        if entry.session.is_expired(Utc::now()) {
            return Err(PipelineError::SessionNotFound);
        }
        if entry.session.state != SessionState::Pending {
            return Err(PipelineError::SessionConflict(format!(
                "session is {:?}",
                entry.session.state
            )));
        }

        entry.session.state = SessionState::Hashing;
        Ok((entry.session.clone(), entry.cancel.clone()))
    }

    /// Moves a session forward. Illegal moves are ignored and reported as `false`.
    pub fn transition(&self, token: &str, next: SessionState) -> bool {
        let Some(mut entry) = self.sessions.get_mut(token) else {
            return false;
        };
        let current = entry.session.state;
        if !current.can_transition_to(next) {
            tracing::debug!(
                "Ignoring session {} transition {:?} -> {:?}",
                token,
                current,
                next
            );
            return false;
        }
        entry.session.state = next;
        if next.is_terminal() {
            entry.session.finished_at = Some(Utc::now());
        }
        true
    }

    pub fn fail(&self, token: &str) -> bool {
        self.transition(token, SessionState::Failed)
    }

    /// Client-initiated abort of a running or pending upload. Returns the
    /// state the session was in; a `Pending` session is failed on the spot.
    pub fn abort(&self, token: &str) -> Result<SessionState, PipelineError> {
        let mut entry = self
            .sessions
            .get_mut(token)
            .ok_or(PipelineError::SessionNotFound)?;
        let previous = entry.session.state;
        if previous.is_terminal() {
            return Err(PipelineError::SessionConflict(
                "upload already finished".to_string(),
            ));
        }
        entry.cancel.cancel();
        // Nothing is running yet, so nobody else will fail it
        if previous == SessionState::Pending {
            entry.session.state = SessionState::Failed;
            entry.session.finished_at = Some(Utc::now());
        }
        drop(entry);
        tracing::info!("✋ Upload session aborted: {}", token);
        Ok(previous)
    }

    /// Drops expired sessions and finished sessions past the retention window.
    /// Returns the removed tokens.
    pub fn purge_expired(&self, now: DateTime<Utc>) -> Vec<String> {
        let retention = self.retention;
        let mut removed = Vec::new();
        self.sessions.retain(|token, entry| {
            let s = &entry.session;
            let keep = match s.finished_at {
                Some(finished) => now < finished + retention,
                None => !s.is_expired(now),
            };
            if !keep {
                // Expired mid-flight: stop whatever is still running
                entry.cancel.cancel();
                removed.push(token.clone());
            }
            keep
        });
        removed
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}
