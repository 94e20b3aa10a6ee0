//! Tunneling feature: owns the active sessions and reacts to notifications
//!
//! ```text
//!  NotificationSource ──notification──┐
//!                                     ↓
//!                          TunnelingFeature::run ──FeatureEvent──> process
//!                                     ↑
//!  TunnelSession ─────SessionEvent────┘
//! ```
//!
//! Notifications and session closures are both handled on the task running
//! [`TunnelingFeature::run`], one at a time, in arrival order.

use crate::config::TunnelingConfig;
use crate::forwarder::TcpForwarder;
use crate::notification::{self, NotificationError};
use crate::registry::SessionRegistry;
use crate::services::{FileLinkState, ServiceError, ServiceRegistry};
use crate::session::{SessionEvent, SessionId, SessionInfo, TunnelSession};
use edgetunnel_proto::{notify_topic, ServiceDescriptor, TunnelNotification};
use edgetunnel_transport::{NotificationSource, RelayConnector};
use std::future::Future;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Error)]
pub enum AgentError {
    #[error("Tunneling feature already started")]
    AlreadyStarted,

    #[error("Subscription mode requires a notification source")]
    NotificationSourceMissing,

    #[error("Service registry error: {0}")]
    Services(#[from] ServiceError),
}

/// Lifecycle events reported to the owning process
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeatureEvent {
    Started,
    Stopped,
    /// A tunnel closed while the feature runs in exit-on-close mode
    ShutdownRequested { session_id: SessionId },
}

pub struct TunnelingFeature {
    config: TunnelingConfig,
    services: Arc<ServiceRegistry>,
    connector: Arc<dyn RelayConnector>,
    notification_source: Option<Arc<dyn NotificationSource>>,
    forwarder: TcpForwarder,
    sessions: SessionRegistry,
    session_tx: mpsc::UnboundedSender<SessionEvent>,
    session_rx: mpsc::UnboundedReceiver<SessionEvent>,
    notifications: Option<mpsc::Receiver<TunnelNotification>>,
    events: mpsc::UnboundedSender<FeatureEvent>,
    /// Parent of every session's cancellation, fired by stop()
    shutdown: CancellationToken,
    started: bool,
    stopping: bool,
}

impl TunnelingFeature {
    pub fn new(
        config: TunnelingConfig,
        services: Arc<ServiceRegistry>,
        connector: Arc<dyn RelayConnector>,
    ) -> (Self, mpsc::UnboundedReceiver<FeatureEvent>) {
        let (session_tx, session_rx) = mpsc::unbounded_channel();
        let (events, events_rx) = mpsc::unbounded_channel();

        (
            Self {
                config,
                services,
                connector,
                notification_source: None,
                forwarder: TcpForwarder::new(),
                sessions: SessionRegistry::new(),
                session_tx,
                session_rx,
                notifications: None,
                events,
                shutdown: CancellationToken::new(),
                started: false,
                stopping: false,
            },
            events_rx,
        )
    }

    /// Build the feature with the deployment's service table
    ///
    /// Link state is read from `config.link_state_path` at resolution time.
    pub fn from_config(
        config: TunnelingConfig,
        connector: Arc<dyn RelayConnector>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<FeatureEvent>), AgentError> {
        let link_state = Arc::new(FileLinkState::new(config.link_state_path.clone()));
        let services = Arc::new(ServiceRegistry::standard(link_state)?);
        Ok(Self::new(config, services, connector))
    }

    pub fn with_notification_source(mut self, source: Arc<dyn NotificationSource>) -> Self {
        self.notification_source = Some(source);
        self
    }

    pub fn with_forwarder(mut self, forwarder: TcpForwarder) -> Self {
        self.forwarder = forwarder;
        self
    }

    pub fn config(&self) -> &TunnelingConfig {
        &self.config
    }

    /// Shared view of the session registry
    pub fn sessions(&self) -> SessionRegistry {
        self.sessions.clone()
    }

    pub async fn active_sessions(&self) -> Vec<SessionInfo> {
        self.sessions.list().await
    }

    /// Start in subscription or static mode
    ///
    /// Configuration, subscription and connect failures are logged and
    /// leave the feature running without a session.
    pub async fn start(&mut self) -> Result<(), AgentError> {
        if self.started {
            return Err(AgentError::AlreadyStarted);
        }

        if self.config.subscribe_notification {
            self.start_subscription().await?;
        } else {
            self.start_static().await;
        }

        self.started = true;
        self.emit(FeatureEvent::Started);
        Ok(())
    }

    async fn start_subscription(&mut self) -> Result<(), AgentError> {
        let source = self
            .notification_source
            .clone()
            .ok_or(AgentError::NotificationSourceMissing)?;

        let thing_name = match self.config.thing_name.as_deref() {
            Some(name) if !name.is_empty() => name.to_string(),
            _ => {
                tracing::error!("Cannot subscribe to tunnel notifications without a thing name");
                return Ok(());
            }
        };

        let topic = notify_topic(&thing_name);
        tracing::info!(topic = %topic, "Subscribing to tunnel notifications");

        match source.subscribe(&thing_name).await {
            Ok(receiver) => {
                tracing::info!(topic = %topic, "Subscribed to tunnel notifications");
                self.notifications = Some(receiver);
            }
            Err(e) => {
                tracing::error!(topic = %topic, error = %e, "Failed to subscribe to tunnel notifications");
            }
        }

        Ok(())
    }

    async fn start_static(&mut self) {
        let tunnel = match self.config.static_tunnel() {
            Ok(tunnel) => tunnel,
            Err(e) => {
                tracing::error!(error = %e, "Invalid static tunnel configuration");
                return;
            }
        };

        tracing::info!(
            destination = %tunnel.destination,
            region = %tunnel.region,
            "Opening static secure tunnel"
        );

        if let Err(e) = self
            .open_session(
                tunnel.access_token,
                tunnel.region,
                tunnel.endpoint,
                tunnel.destination,
            )
            .await
        {
            tracing::error!(error = %e, "Failed to open static secure tunnel");
        }
    }

    /// Validate a notification and open the tunnel it asks for
    pub async fn on_notification(
        &self,
        notification: TunnelNotification,
    ) -> Result<SessionId, NotificationError> {
        let result = self.accept_notification(&notification).await;

        match &result {
            Ok(id) => tracing::info!(session_id = %id, "Tunnel notification accepted"),
            Err(NotificationError::Duplicate) => {
                tracing::info!("Received duplicate tunnel notification, ignoring")
            }
            Err(e) => tracing::error!(
                client_mode = %notification.client_mode,
                error = %e,
                "Rejected tunnel notification"
            ),
        }

        result
    }

    async fn accept_notification(
        &self,
        notification: &TunnelNotification,
    ) -> Result<SessionId, NotificationError> {
        let request = notification::validate(notification)?;

        if self.is_duplicate(&request.access_token).await {
            return Err(NotificationError::Duplicate);
        }

        let destination = self.services.resolve(&request.service).map_err(|source| {
            NotificationError::UnsupportedService {
                service: request.service.clone(),
                source,
            }
        })?;

        let endpoint = self.config.endpoint(&request.region);
        let id = self
            .open_session(request.access_token, request.region, endpoint, destination)
            .await?;
        Ok(id)
    }

    /// Whether an active session already carries this access token
    pub async fn is_duplicate(&self, access_token: &str) -> bool {
        self.sessions.contains_access_token(access_token).await
    }

    async fn open_session(
        &self,
        access_token: String,
        region: String,
        endpoint: String,
        destination: ServiceDescriptor,
    ) -> Result<SessionId, crate::session::SessionError> {
        let mut session = TunnelSession::new(
            access_token,
            region,
            endpoint,
            destination,
            self.session_tx.clone(),
        )
        .with_parent(&self.shutdown);

        session
            .connect(self.connector.as_ref(), &self.forwarder)
            .await?;

        let id = session.id();
        self.sessions.insert(session).await;
        Ok(id)
    }

    /// Forget a closed session
    ///
    /// Unknown ids are ignored. Returns whether a session was removed.
    pub async fn on_session_closed(&self, id: SessionId) -> bool {
        if self.sessions.remove(id).await.is_none() {
            return false;
        }

        if self.config.exit_on_tunnel_close && !self.stopping {
            tracing::info!(session_id = %id, "Tunnel closed, requesting shutdown");
            self.emit(FeatureEvent::ShutdownRequested { session_id: id });
        }
        true
    }

    /// Start, then serve notifications and session events until `shutdown`
    /// completes, then stop
    ///
    /// `shutdown` is also watched while a relay handshake is in flight.
    pub async fn run<F>(&mut self, shutdown: F) -> Result<(), AgentError>
    where
        F: Future<Output = ()>,
    {
        tokio::pin!(shutdown);

        let started = tokio::select! {
            result = self.start() => Some(result),
            _ = &mut shutdown => None,
        };
        match started {
            Some(result) => result?,
            None => {
                tracing::info!("Shutdown requested during startup, stopping tunneling feature");
                self.stop().await;
                return Ok(());
            }
        }

        loop {
            tokio::select! {
                _ = &mut shutdown => {
                    tracing::info!("Shutdown requested, stopping tunneling feature");
                    break;
                }
                notification = next_notification(&mut self.notifications) => match notification {
                    Some(notification) => {
                        let interrupted = tokio::select! {
                            _ = self.on_notification(notification) => false,
                            _ = &mut shutdown => true,
                        };
                        if interrupted {
                            tracing::info!("Shutdown requested during a relay handshake, stopping tunneling feature");
                            break;
                        }
                    }
                    None => {
                        tracing::info!("Tunnel notification stream ended");
                        self.notifications = None;
                    }
                },
                Some(event) = self.session_rx.recv() => match event {
                    SessionEvent::Closed { id, reason } => {
                        tracing::debug!(session_id = %id, reason = %reason, "Session reported closure");
                        self.on_session_closed(id).await;
                    }
                },
            }
        }

        self.stop().await;
        Ok(())
    }

    /// Stop every session and report the feature stopped
    ///
    /// Waits at most the configured grace period for sessions to report
    /// their closure.
    pub async fn stop(&mut self) {
        self.stopping = true;
        self.notifications = None;
        self.shutdown.cancel();

        let stopping = self.sessions.stop_all().await;
        tracing::info!(sessions = stopping, "Stopping tunneling feature");

        let sessions = &self.sessions;
        let session_rx = &mut self.session_rx;
        let drain = async {
            while sessions.count().await > 0 {
                match session_rx.recv().await {
                    Some(SessionEvent::Closed { id, .. }) => {
                        sessions.remove(id).await;
                    }
                    None => break,
                }
            }
        };

        if tokio::time::timeout(self.config.stop_grace(), drain)
            .await
            .is_err()
        {
            let remaining = self.sessions.count().await;
            tracing::warn!(remaining = remaining, "Sessions did not report closure in time");
        }

        self.sessions.clear().await;
        self.emit(FeatureEvent::Stopped);
    }

    fn emit(&self, event: FeatureEvent) {
        if self.events.send(event).is_err() {
            tracing::debug!("Feature event receiver dropped");
        }
    }
}

async fn next_notification(
    notifications: &mut Option<mpsc::Receiver<TunnelNotification>>,
) -> Option<TunnelNotification> {
    match notifications {
        Some(receiver) => receiver.recv().await,
        None => std::future::pending().await,
    }
}
