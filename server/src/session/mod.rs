//! Session Transport
//!
//! One [`AgentSession`] per accepted agent connection. The session owns its
//! transport exclusively; cleanup (transport shutdown, registry removal,
//! `active_agents` decrement) runs exactly once, either from [`AgentSession::close`]
//! or from `Drop` when the owning task is aborted.

pub mod frame;
pub mod queue;
pub mod server;

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite, AsyncWriteExt};

use crate::crypto::FrameCipher;
use crate::error::SessionError;
use crate::metrics::Metrics;

pub use queue::{FrameQueue, QueueClosed};
pub use server::{run_session, AgentServer, SessionContext, SessionEnd};

// ============================================================================
// STATE MACHINE
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Accepting,
    Active,
    Closing,
    Closed,
}

impl SessionStatus {
    pub fn can_transition_to(self, next: SessionStatus) -> bool {
        use SessionStatus::*;
        matches!(
            (self, next),
            (Accepting, Active) | (Accepting, Closing) | (Active, Closing) | (Closing, Closed)
        )
    }
}

impl fmt::Display for SessionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionStatus::Accepting => "accepting",
            SessionStatus::Active => "active",
            SessionStatus::Closing => "closing",
            SessionStatus::Closed => "closed",
        };
        f.write_str(name)
    }
}

static SESSION_COUNTER: AtomicU64 = AtomicU64::new(0);

/// `agent-<UTC yyyymmddHHMMSS>-<n>`, unique within the process
pub fn next_session_id() -> String {
    let n = SESSION_COUNTER.fetch_add(1, Ordering::Relaxed) + 1;
    format!("agent-{}-{}", Utc::now().format("%Y%m%d%H%M%S"), n)
}

// ============================================================================
// REGISTRY
// ============================================================================

/// Read-only view of a live session
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SessionInfo {
    pub id: String,
    pub peer: String,
    pub connected_at: DateTime<Utc>,
    pub status: SessionStatus,
}

/// Active sessions, mirrored into the `active_agents` gauge
pub struct SessionRegistry {
    sessions: RwLock<HashMap<String, SessionInfo>>,
    metrics: Metrics,
}

impl SessionRegistry {
    pub fn new(metrics: Metrics) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            metrics,
        }
    }

    fn register(&self, info: SessionInfo) {
        let previous = self.sessions.write().insert(info.id.clone(), info);
        if previous.is_none() {
            self.metrics.active_agents.inc();
        }
    }

    fn set_status(&self, id: &str, status: SessionStatus) {
        if let Some(info) = self.sessions.write().get_mut(id) {
            info.status = status;
        }
    }

    /// Returns whether the session was still registered
    fn remove(&self, id: &str) -> bool {
        let removed = self.sessions.write().remove(id).is_some();
        if removed {
            self.metrics.active_agents.dec();
        }
        removed
    }

    pub fn get(&self, id: &str) -> Option<SessionInfo> {
        self.sessions.read().get(id).cloned()
    }

    /// Oldest connection first
    pub fn list(&self) -> Vec<SessionInfo> {
        let mut sessions: Vec<SessionInfo> = self.sessions.read().values().cloned().collect();
        sessions.sort_by(|a, b| a.connected_at.cmp(&b.connected_at).then_with(|| a.id.cmp(&b.id)));
        sessions
    }

    pub fn len(&self) -> usize {
        self.sessions.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

// ============================================================================
// SESSION
// ============================================================================

pub struct AgentSession<S> {
    info: SessionInfo,
    stream: Option<S>,
    registry: Arc<SessionRegistry>,
}

impl<S> AgentSession<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Register a freshly accepted connection in `accepting` state
    pub fn accept(stream: S, peer: impl Into<String>, registry: Arc<SessionRegistry>) -> Self {
        let info = SessionInfo {
            id: next_session_id(),
            peer: peer.into(),
            connected_at: Utc::now(),
            status: SessionStatus::Accepting,
        };
        registry.register(info.clone());

        Self {
            info,
            stream: Some(stream),
            registry,
        }
    }

    pub fn id(&self) -> &str {
        &self.info.id
    }

    pub fn peer(&self) -> &str {
        &self.info.peer
    }

    pub fn status(&self) -> SessionStatus {
        self.info.status
    }

    pub fn info(&self) -> &SessionInfo {
        &self.info
    }

    pub fn transition(&mut self, next: SessionStatus) -> Result<(), SessionError> {
        let from = self.info.status;
        if !from.can_transition_to(next) {
            return Err(SessionError::InvalidTransition { from, to: next });
        }
        self.info.status = next;
        if next != SessionStatus::Closed {
            self.registry.set_status(&self.info.id, next);
        }
        Ok(())
    }

    pub fn activate(&mut self) -> Result<(), SessionError> {
        self.transition(SessionStatus::Active)
    }

    /// Next decrypted payload, or `None` at end of stream
    pub async fn read_frame(
        &mut self,
        cipher: &FrameCipher,
        max_frame_bytes: usize,
    ) -> Result<Option<Vec<u8>>, SessionError> {
        let stream = match (self.info.status, self.stream.as_mut()) {
            (SessionStatus::Active, Some(stream)) => stream,
            _ => {
                return Err(SessionError::Io(std::io::Error::new(
                    std::io::ErrorKind::NotConnected,
                    format!("session {} is {}", self.info.id, self.info.status),
                )))
            }
        };

        match frame::read_frame(stream, max_frame_bytes).await? {
            Some(body) => cipher.decrypt(&body).map(Some),
            None => Ok(None),
        }
    }

    /// Orderly close. Calling it again is a no-op.
    pub async fn close(&mut self) {
        if self.info.status == SessionStatus::Closed {
            return;
        }
        if self.info.status != SessionStatus::Closing {
            // Accepting and Active may both move to Closing
            let _ = self.transition(SessionStatus::Closing);
        }

        if let Some(mut stream) = self.stream.take() {
            if let Err(e) = stream.shutdown().await {
                tracing::debug!(session = %self.info.id, "transport shutdown: {}", e);
            }
        }

        let _ = self.transition(SessionStatus::Closed);
        self.registry.remove(&self.info.id);
    }
}

impl<S> Drop for AgentSession<S> {
    fn drop(&mut self) {
        if self.info.status != SessionStatus::Closed {
            // Aborted before an orderly close; the stream drops with us
            self.info.status = SessionStatus::Closed;
            self.registry.remove(&self.info.id);
        }
    }
}

#[cfg(test)]
mod tests;
