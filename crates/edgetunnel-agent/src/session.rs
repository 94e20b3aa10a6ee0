//! Tunnel session: one relay connection paired with one local TCP forward
//!
//! ```text
//! Created ──connect()──> Connecting ──handshake ok──> Active ──either side closes──> Closed
//!                            │                                                      ↑
//!                            └──────────────── handshake failed ────────────────────┘
//! ```
//!
//! A session that reached `Active` reports its closure exactly once, as a
//! [`SessionEvent`] posted to the owner's event queue.

use crate::forwarder::{ForwardEnd, TcpForwarder};
use edgetunnel_proto::ServiceDescriptor;
use edgetunnel_transport::{RelayConnection, RelayConnector, TransportError};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Identity of a session within the registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SessionId(Uuid);

impl SessionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SessionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Created,
    Connecting,
    Active,
    Closed,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            SessionState::Created => "created",
            SessionState::Connecting => "connecting",
            SessionState::Active => "active",
            SessionState::Closed => "closed",
        };
        write!(f, "{}", name)
    }
}

#[derive(Debug, Error)]
pub enum SessionError {
    #[error("Session cannot connect from state {0}")]
    InvalidState(SessionState),

    #[error("Relay handshake failed: {0}")]
    Handshake(#[from] TransportError),

    #[error("Session stopped during the relay handshake")]
    Cancelled,
}

/// Why a session closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    LocalClosed,
    RelayClosed,
    Stopped,
    Error(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::LocalClosed => write!(f, "local endpoint closed"),
            CloseReason::RelayClosed => write!(f, "relay connection closed"),
            CloseReason::Stopped => write!(f, "stopped"),
            CloseReason::Error(e) => write!(f, "error: {}", e),
        }
    }
}

impl From<ForwardEnd> for CloseReason {
    fn from(end: ForwardEnd) -> Self {
        match end {
            ForwardEnd::LocalClosed => CloseReason::LocalClosed,
            ForwardEnd::RelayClosed => CloseReason::RelayClosed,
            ForwardEnd::Cancelled => CloseReason::Stopped,
        }
    }
}

/// Events a session posts to its owner
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    Closed { id: SessionId, reason: CloseReason },
}

/// Posts the closed event of one session, at most once
#[derive(Debug)]
pub(crate) struct ClosedNotifier {
    id: SessionId,
    events: mpsc::UnboundedSender<SessionEvent>,
    fired: AtomicBool,
}

impl ClosedNotifier {
    pub(crate) fn new(id: SessionId, events: mpsc::UnboundedSender<SessionEvent>) -> Self {
        Self {
            id,
            events,
            fired: AtomicBool::new(false),
        }
    }

    /// Returns false when the event was already posted
    pub(crate) fn notify(&self, reason: CloseReason) -> bool {
        if self.fired.swap(true, Ordering::SeqCst) {
            tracing::debug!(session_id = %self.id, "Closed event already posted, ignoring");
            return false;
        }

        if self
            .events
            .send(SessionEvent::Closed {
                id: self.id,
                reason,
            })
            .is_err()
        {
            tracing::debug!(session_id = %self.id, "Session owner is gone, closed event dropped");
        }
        true
    }
}

/// Snapshot of a session for introspection
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub id: SessionId,
    pub token_hint: String,
    pub region: String,
    pub endpoint: String,
    pub destination: ServiceDescriptor,
    pub state: SessionState,
    /// Relay connection id once the handshake succeeded
    pub connection_id: Option<String>,
    pub created_at: Instant,
}

/// Shorten a secret for logs
pub fn redact(token: &str) -> String {
    let prefix: String = token.chars().take(6).collect();
    format!("{}...", prefix)
}

/// One secure tunnel towards a local destination
#[derive(Debug)]
pub struct TunnelSession {
    id: SessionId,
    access_token: String,
    region: String,
    endpoint: String,
    destination: ServiceDescriptor,
    state: Arc<watch::Sender<SessionState>>,
    cancel: CancellationToken,
    notifier: Arc<ClosedNotifier>,
    connection: Option<Arc<dyn RelayConnection>>,
    created_at: Instant,
}

impl TunnelSession {
    /// Create a session from validated parameters, no network activity yet
    pub fn new(
        access_token: impl Into<String>,
        region: impl Into<String>,
        endpoint: impl Into<String>,
        destination: ServiceDescriptor,
        events: mpsc::UnboundedSender<SessionEvent>,
    ) -> Self {
        let id = SessionId::new();
        Self {
            id,
            access_token: access_token.into(),
            region: region.into(),
            endpoint: endpoint.into(),
            destination,
            state: Arc::new(watch::Sender::new(SessionState::Created)),
            cancel: CancellationToken::new(),
            notifier: Arc::new(ClosedNotifier::new(id, events)),
            connection: None,
            created_at: Instant::now(),
        }
    }

    /// Tie the session to an owner's cancellation token
    ///
    /// Cancelling `parent` stops the session like [`TunnelSession::stop`].
    pub fn with_parent(mut self, parent: &CancellationToken) -> Self {
        self.cancel = parent.child_token();
        self
    }

    pub fn id(&self) -> SessionId {
        self.id
    }

    pub fn access_token(&self) -> &str {
        &self.access_token
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    pub fn destination(&self) -> &ServiceDescriptor {
        &self.destination
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    /// Watch state transitions
    pub fn subscribe_state(&self) -> watch::Receiver<SessionState> {
        self.state.subscribe()
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            token_hint: redact(&self.access_token),
            region: self.region.clone(),
            endpoint: self.endpoint.clone(),
            destination: self.destination.clone(),
            state: self.state(),
            connection_id: self
                .connection
                .as_ref()
                .map(|connection| connection.connection_id()),
            created_at: self.created_at,
        }
    }

    /// Perform the relay handshake, then start the local bridge
    ///
    /// On handshake failure the session goes straight to `Closed` and the
    /// error is returned to the caller. No closed event is posted for a
    /// session that never became active.
    pub async fn connect(
        &mut self,
        connector: &dyn RelayConnector,
        forwarder: &TcpForwarder,
    ) -> Result<(), SessionError> {
        if !transition(&self.state, SessionState::Created, SessionState::Connecting) {
            return Err(SessionError::InvalidState(self.state()));
        }

        tracing::info!(
            session_id = %self.id,
            endpoint = %self.endpoint,
            region = %self.region,
            token = %redact(&self.access_token),
            "Connecting to secure tunnel"
        );

        let handshake = tokio::select! {
            result = connector.connect(&self.access_token, &self.endpoint) => result,
            _ = self.cancel.cancelled() => {
                self.state.send_replace(SessionState::Closed);
                tracing::info!(session_id = %self.id, "Relay handshake abandoned, session stopped");
                return Err(SessionError::Cancelled);
            }
        };

        let connection = match handshake {
            Ok(connection) => connection,
            Err(e) => {
                self.state.send_replace(SessionState::Closed);
                tracing::error!(
                    session_id = %self.id,
                    endpoint = %self.endpoint,
                    error = %e,
                    "Failed to connect to secure tunnel"
                );
                return Err(SessionError::Handshake(e));
            }
        };

        // stop() may have raced the handshake
        if !transition(&self.state, SessionState::Connecting, SessionState::Active) {
            connection.close("session stopped during handshake").await;
            return Err(SessionError::InvalidState(self.state()));
        }

        tracing::info!(
            session_id = %self.id,
            connection_id = %connection.connection_id(),
            destination = %self.destination,
            "Secure tunnel active, starting local forward"
        );

        let handle = forwarder.bridge(
            self.destination.socket_addr(),
            connection.clone(),
            self.cancel.child_token(),
        );
        self.connection = Some(connection.clone());

        let id = self.id;
        let state = self.state.clone();
        let notifier = self.notifier.clone();
        tokio::spawn(async move {
            let reason = match handle.wait().await {
                Ok(stats) => CloseReason::from(stats.end),
                Err(e) => {
                    tracing::warn!(session_id = %id, error = %e, "Local forward failed");
                    CloseReason::Error(e.to_string())
                }
            };

            connection.close(&reason.to_string()).await;
            state.send_replace(SessionState::Closed);

            tracing::info!(session_id = %id, reason = %reason, "Secure tunnel closed");
            notifier.notify(reason);
        });

        Ok(())
    }

    /// Stop the session, safe from any state
    ///
    /// Returns without waiting. An active session completes its shutdown in
    /// the background and posts its closed event like any other closure.
    pub fn stop(&self) {
        tracing::debug!(session_id = %self.id, state = %self.state(), "Stopping secure tunnel");

        self.cancel.cancel();
        self.state.send_if_modified(|state| match state {
            SessionState::Created | SessionState::Connecting => {
                *state = SessionState::Closed;
                true
            }
            SessionState::Active | SessionState::Closed => false,
        });
    }
}

fn transition(
    state: &watch::Sender<SessionState>,
    from: SessionState,
    to: SessionState,
) -> bool {
    state.send_if_modified(|current| {
        if *current == from {
            *current = to;
            true
        } else {
            false
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgetunnel_transport::memory::MemoryRelayConnector;
    use edgetunnel_transport::TransportResult;
    use std::net::Ipv4Addr;
    use std::time::Duration;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpListener;

    fn session(
        port: u16,
    ) -> (TunnelSession, mpsc::UnboundedReceiver<SessionEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let destination = ServiceDescriptor::new("TEST", Ipv4Addr::LOCALHOST, port);
        (
            TunnelSession::new("token-abcdefgh", "us-east-1", "relay.test", destination, tx),
            rx,
        )
    }

    #[test]
    fn test_redact() {
        assert_eq!(redact("abcdefghijkl"), "abcdef...");
        assert_eq!(redact("abc"), "abc...");
    }

    #[tokio::test]
    async fn test_closed_notifier_fires_once() {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let id = SessionId::new();
        let notifier = ClosedNotifier::new(id, tx);

        assert!(notifier.notify(CloseReason::LocalClosed));
        assert!(!notifier.notify(CloseReason::RelayClosed));

        assert_eq!(
            rx.recv().await,
            Some(SessionEvent::Closed {
                id,
                reason: CloseReason::LocalClosed
            })
        );
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_connect_failure_closes_session() {
        let connector = MemoryRelayConnector::new();
        connector.reject_token("token-abcdefgh");
        let (mut session, mut events) = session(1);

        let err = session
            .connect(connector.as_ref(), &TcpForwarder::new())
            .await
            .unwrap_err();

        assert!(matches!(err, SessionError::Handshake(_)));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_no_reconnect_after_close() {
        let connector = MemoryRelayConnector::new();
        connector.reject_token("token-abcdefgh");
        let (mut session, _events) = session(1);
        let forwarder = TcpForwarder::new();

        assert!(session.connect(connector.as_ref(), &forwarder).await.is_err());
        let err = session
            .connect(connector.as_ref(), &forwarder)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidState(SessionState::Closed)));
        assert_eq!(connector.attempts().len(), 1);
    }

    #[tokio::test]
    async fn test_stop_before_connect() {
        let connector = MemoryRelayConnector::new();
        let (mut session, _events) = session(1);

        session.stop();
        assert_eq!(session.state(), SessionState::Closed);

        let err = session
            .connect(connector.as_ref(), &TcpForwarder::new())
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::InvalidState(_)));
        assert!(connector.attempts().is_empty());
    }

    #[tokio::test]
    async fn test_local_close_reports_once() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connector = MemoryRelayConnector::new();
        let (mut session, mut events) = session(port);

        session
            .connect(connector.as_ref(), &TcpForwarder::new())
            .await
            .unwrap();
        assert_eq!(session.state(), SessionState::Active);
        assert_eq!(session.info().connection_id.as_deref(), Some("memory-0"));

        let (mut local, _) = listener.accept().await.unwrap();
        local.shutdown().await.unwrap();
        drop(local);

        let event = events.recv().await.unwrap();
        assert_eq!(
            event,
            SessionEvent::Closed {
                id: session.id(),
                reason: CloseReason::LocalClosed
            }
        );
        assert_eq!(session.state(), SessionState::Closed);

        // Relay side was closed by the session
        let peer = connector.take_peer("token-abcdefgh").await.unwrap();
        assert!(peer.is_closed());

        // A later stop() does not produce a second event
        session.stop();
        tokio::task::yield_now().await;
        assert!(events.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_stop_active_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connector = MemoryRelayConnector::new();
        let (mut session, mut events) = session(port);

        session
            .connect(connector.as_ref(), &TcpForwarder::new())
            .await
            .unwrap();
        let (_local, _) = listener.accept().await.unwrap();

        session.stop();

        match events.recv().await.unwrap() {
            SessionEvent::Closed { id, reason } => {
                assert_eq!(id, session.id());
                assert_eq!(reason, CloseReason::Stopped);
            }
        }
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_relay_drop_reports_closed() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let connector = MemoryRelayConnector::new();
        let (mut session, mut events) = session(port);

        session
            .connect(connector.as_ref(), &TcpForwarder::new())
            .await
            .unwrap();
        let (_local, _) = listener.accept().await.unwrap();

        connector.take_peer("token-abcdefgh").await.unwrap().disconnect();

        match events.recv().await.unwrap() {
            SessionEvent::Closed { reason, .. } => assert_eq!(reason, CloseReason::RelayClosed),
        }
    }

    #[derive(Debug)]
    struct StalledConnector;

    #[async_trait::async_trait]
    impl RelayConnector for StalledConnector {
        async fn connect(
            &self,
            _access_token: &str,
            _endpoint: &str,
        ) -> TransportResult<Arc<dyn RelayConnection>> {
            std::future::pending().await
        }
    }

    #[tokio::test]
    async fn test_parent_cancel_abandons_handshake() {
        let parent = CancellationToken::new();
        let (session, mut events) = session(1);
        let mut session = session.with_parent(&parent);

        let canceller = parent.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            canceller.cancel();
        });

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            session.connect(&StalledConnector, &TcpForwarder::new()),
        )
        .await
        .expect("handshake was not abandoned");

        assert!(matches!(result, Err(SessionError::Cancelled)));
        assert_eq!(session.state(), SessionState::Closed);
        assert!(events.try_recv().is_err());
    }
}
