use crate::session::{SessionId, SessionInfo, TunnelSession};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Tracks open tunnel sessions and their lifecycle
#[derive(Clone, Default)]
pub struct SessionRegistry {
    /// Map of session id -> session
    sessions: Arc<RwLock<HashMap<SessionId, TunnelSession>>>,
}

impl SessionRegistry {
    /// Create an empty session registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Track a session that finished its handshake
    pub async fn insert(&self, session: TunnelSession) {
        let id = session.id();

        tracing::debug!(
            session_id = %id,
            destination = %session.destination(),
            "Registering session"
        );

        let mut sessions = self.sessions.write().await;
        sessions.insert(id, session);

        tracing::info!(active_sessions = sessions.len(), "Session registered");
    }

    /// Forget a session
    ///
    /// Removing an id that is not present is a no-op. Returns the removed
    /// session, if any.
    pub async fn remove(&self, id: SessionId) -> Option<TunnelSession> {
        let mut sessions = self.sessions.write().await;

        match sessions.remove(&id) {
            Some(session) => {
                let info = session.info();
                tracing::info!(
                    session_id = %id,
                    destination = %info.destination,
                    duration_secs = info.created_at.elapsed().as_secs(),
                    active_sessions = sessions.len(),
                    "Session unregistered"
                );
                Some(session)
            }
            None => {
                tracing::warn!(session_id = %id, "Attempted to unregister unknown session");
                None
            }
        }
    }

    pub async fn contains(&self, id: SessionId) -> bool {
        self.sessions.read().await.contains_key(&id)
    }

    /// Whether a tracked session was opened with this access token
    pub async fn contains_access_token(&self, access_token: &str) -> bool {
        let sessions = self.sessions.read().await;
        sessions
            .values()
            .any(|session| session.access_token() == access_token)
    }

    /// Ask every tracked session to stop, returns how many were asked
    pub async fn stop_all(&self) -> usize {
        let sessions = self.sessions.read().await;
        for session in sessions.values() {
            session.stop();
        }
        sessions.len()
    }

    pub async fn get(&self, id: SessionId) -> Option<SessionInfo> {
        let sessions = self.sessions.read().await;
        sessions.get(&id).map(TunnelSession::info)
    }

    pub async fn count(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn list(&self) -> Vec<SessionInfo> {
        let sessions = self.sessions.read().await;
        sessions.values().map(TunnelSession::info).collect()
    }

    /// Drop every session (used at shutdown)
    pub async fn clear(&self) {
        let mut sessions = self.sessions.write().await;
        let count = sessions.len();
        sessions.clear();

        tracing::info!(cleared_sessions = count, "All sessions cleared");
    }
}
