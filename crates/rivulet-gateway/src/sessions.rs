//! Signaling session table.
//!
//! A session binds one client id to one worker id under an immutable session
//! id. References are by id only: a session may dangle after either party
//! disappears, and routed messages to the missing side are dropped by the
//! hub. Status moves monotonically negotiating → connected → closed.

use std::collections::BTreeMap;
use std::sync::RwLock;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Sessions older than this are unconditionally dropped by the sweep.
pub const SESSION_MAX_AGE: Duration = Duration::from_secs(60 * 60);

/// Lifecycle of a signaling session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Negotiating,
    Connected,
    Closed,
}

/// One client↔worker signaling binding.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SignalingSession {
    pub session_id: String,
    pub client_id: String,
    pub worker_id: String,
    pub created_at: DateTime<Utc>,
    pub status: SessionStatus,
}

/// Errors surfaced by session operations.
#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum SessionError {
    #[error("session {session_id} not found")]
    NotFound { session_id: String },
    #[error("session {session_id} already exists")]
    AlreadyExists { session_id: String },
    /// Status may only move forward.
    #[error("session {session_id} cannot move from {from:?} to {to:?}")]
    Regression {
        session_id: String,
        from: SessionStatus,
        to: SessionStatus,
    },
}

/// Session table keyed by session id.
#[derive(Default)]
pub struct SessionTable {
    sessions: RwLock<BTreeMap<String, SignalingSession>>,
}

impl SessionTable {
    /// Empty table.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a session, overwriting any existing entry for the id.
    pub fn create(&self, session_id: &str, client_id: &str, worker_id: &str) -> SignalingSession {
        let session = SignalingSession {
            session_id: session_id.to_string(),
            client_id: client_id.to_string(),
            worker_id: worker_id.to_string(),
            created_at: Utc::now(),
            status: SessionStatus::Negotiating,
        };
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        sessions.insert(session_id.to_string(), session.clone());
        session
    }

    /// Insert a session, failing when the id is already in use.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::AlreadyExists`] on collision.
    pub fn create_unique(
        &self,
        session_id: &str,
        client_id: &str,
        worker_id: &str,
    ) -> Result<SignalingSession, SessionError> {
        {
            let sessions = self.sessions.read().expect("session lock poisoned");
            if sessions.contains_key(session_id) {
                return Err(SessionError::AlreadyExists {
                    session_id: session_id.to_string(),
                });
            }
        }
        Ok(self.create(session_id, client_id, worker_id))
    }

    /// Fetch a session by id.
    #[must_use]
    pub fn get(&self, session_id: &str) -> Option<SignalingSession> {
        let sessions = self.sessions.read().expect("session lock poisoned");
        sessions.get(session_id).cloned()
    }

    /// Advance a session's status.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::NotFound`] for unknown ids and
    /// [`SessionError::Regression`] for backward transitions.
    pub fn update_status(&self, session_id: &str, status: SessionStatus) -> Result<(), SessionError> {
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        let session = sessions
            .get_mut(session_id)
            .ok_or_else(|| SessionError::NotFound {
                session_id: session_id.to_string(),
            })?;
        if status < session.status {
            return Err(SessionError::Regression {
                session_id: session_id.to_string(),
                from: session.status,
                to: status,
            });
        }
        session.status = status;
        Ok(())
    }

    /// Remove a session by id.
    pub fn remove(&self, session_id: &str) {
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        sessions.remove(session_id);
    }

    /// Number of live sessions.
    #[must_use]
    pub fn count(&self) -> usize {
        self.sessions.read().expect("session lock poisoned").len()
    }

    /// Drop sessions older than [`SESSION_MAX_AGE`], reporting them in id
    /// order.
    pub fn sweep_at(&self, now: DateTime<Utc>) -> Vec<String> {
        let max_age = chrono::Duration::from_std(SESSION_MAX_AGE).expect("max age fits");
        let mut dropped = Vec::new();
        let mut sessions = self.sessions.write().expect("session lock poisoned");
        sessions.retain(|session_id, session| {
            if now - session.created_at > max_age {
                dropped.push(session_id.clone());
                false
            } else {
                true
            }
        });
        dropped
    }
}
