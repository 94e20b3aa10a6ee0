//! WebSocket relay connector and connection

use crate::config::WebSocketRelayConfig;
use async_trait::async_trait;
use bytes::Bytes;
use edgetunnel_transport::{RelayConnection, RelayConnector, TransportError, TransportResult};
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use rustls::pki_types::ServerName;
use std::sync::Arc;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tokio_tungstenite::tungstenite::client::IntoClientRequest;
use tokio_tungstenite::tungstenite::http::HeaderValue;
use tokio_tungstenite::tungstenite::Message;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

type WsStream = tokio_tungstenite::WebSocketStream<tokio_rustls::client::TlsStream<TcpStream>>;

/// Header carrying the destination access token
const ACCESS_TOKEN_HEADER: &str = "access-token";

/// Opens relay connections over WebSocket + TLS
pub struct WebSocketRelayConnector {
    config: WebSocketRelayConfig,
    tls_connector: tokio_rustls::TlsConnector,
}

impl std::fmt::Debug for WebSocketRelayConnector {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketRelayConnector")
            .field("config", &self.config)
            .finish()
    }
}

impl WebSocketRelayConnector {
    /// Create a connector, loading TLS trust anchors up front
    pub fn new(config: WebSocketRelayConfig) -> TransportResult<Self> {
        config.validate()?;
        let tls_connector = config.build_tls_connector()?;
        Ok(Self {
            config,
            tls_connector,
        })
    }

    async fn handshake(&self, access_token: &str, endpoint: &str) -> TransportResult<WsStream> {
        let tcp_stream = TcpStream::connect((endpoint, self.config.port))
            .await
            .map_err(|e| TransportError::ConnectionError(format!("TCP connect failed: {}", e)))?;

        let dns_name = ServerName::try_from(endpoint.to_string())
            .map_err(|e| TransportError::TlsError(format!("Invalid server name: {}", e)))?;

        let tls_stream = self
            .tls_connector
            .connect(dns_name, tcp_stream)
            .await
            .map_err(|e| TransportError::TlsError(format!("TLS handshake failed: {}", e)))?;

        let mut request = self
            .config
            .tunnel_url(endpoint)
            .into_client_request()
            .map_err(|e| TransportError::ConfigurationError(format!("Invalid URL: {}", e)))?;
        let token = HeaderValue::from_str(access_token).map_err(|_| {
            TransportError::AuthenticationFailed("access token is not a valid header value".to_string())
        })?;
        request.headers_mut().insert(ACCESS_TOKEN_HEADER, token);

        let (ws_stream, _response) = tokio_tungstenite::client_async(request, tls_stream)
            .await
            .map_err(|e| {
                TransportError::ConnectionError(format!("WebSocket handshake failed: {}", e))
            })?;

        Ok(ws_stream)
    }
}

#[async_trait]
impl RelayConnector for WebSocketRelayConnector {
    async fn connect(
        &self,
        access_token: &str,
        endpoint: &str,
    ) -> TransportResult<Arc<dyn RelayConnection>> {
        debug!(endpoint = %endpoint, port = self.config.port, "Connecting to relay");

        let ws_stream = tokio::time::timeout(
            self.config.connect_timeout,
            self.handshake(access_token, endpoint),
        )
        .await
        .map_err(|_| TransportError::ConnectionError("Relay handshake timed out".to_string()))??;

        let connection = WebSocketRelayConnection::new(ws_stream);
        info!(
            endpoint = %endpoint,
            connection_id = %connection.connection_id(),
            "Relay connection established"
        );

        Ok(Arc::new(connection))
    }
}

/// A relay connection over a single WebSocket
pub struct WebSocketRelayConnection {
    connection_id: String,
    sink: Mutex<SplitSink<WsStream, Message>>,
    source: Mutex<SplitStream<WsStream>>,
    closed: CancellationToken,
}

impl std::fmt::Debug for WebSocketRelayConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("WebSocketRelayConnection")
            .field("connection_id", &self.connection_id)
            .field("closed", &self.closed.is_cancelled())
            .finish()
    }
}

impl WebSocketRelayConnection {
    fn new(ws_stream: WsStream) -> Self {
        let (sink, source) = ws_stream.split();
        Self {
            connection_id: format!("ws-{}", uuid::Uuid::new_v4()),
            sink: Mutex::new(sink),
            source: Mutex::new(source),
            closed: CancellationToken::new(),
        }
    }
}

#[async_trait]
impl RelayConnection for WebSocketRelayConnection {
    async fn send_bytes(&self, data: &[u8]) -> TransportResult<()> {
        if self.closed.is_cancelled() {
            return Err(TransportError::StreamClosed);
        }

        self.sink
            .lock()
            .await
            .send(Message::Binary(data.to_vec()))
            .await
            .map_err(|e| TransportError::ConnectionError(format!("WebSocket send failed: {}", e)))
    }

    async fn recv_bytes(&self) -> TransportResult<Option<Bytes>> {
        let mut source = self.source.lock().await;

        loop {
            let next = tokio::select! {
                _ = self.closed.cancelled() => return Ok(None),
                next = source.next() => next,
            };

            match next {
                Some(Ok(Message::Binary(data))) => return Ok(Some(Bytes::from(data))),
                Some(Ok(Message::Close(frame))) => {
                    debug!(
                        connection_id = %self.connection_id,
                        frame = ?frame,
                        "Relay closed the connection"
                    );
                    self.closed.cancel();
                    return Ok(None);
                }
                Some(Ok(Message::Text(text))) => {
                    warn!(
                        connection_id = %self.connection_id,
                        len = text.len(),
                        "Ignoring text frame on relay connection"
                    );
                }
                // Ping/Pong are answered by tungstenite itself
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    self.closed.cancel();
                    return Err(TransportError::ConnectionError(format!(
                        "WebSocket receive failed: {}",
                        e
                    )));
                }
                None => {
                    self.closed.cancel();
                    return Ok(None);
                }
            }
        }
    }

    async fn close(&self, reason: &str) {
        if self.closed.is_cancelled() {
            return;
        }
        self.closed.cancel();

        debug!(connection_id = %self.connection_id, reason = %reason, "Closing relay connection");

        let mut sink = self.sink.lock().await;
        let _ = sink.send(Message::Close(None)).await;
        let _ = sink.close().await;
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn connection_id(&self) -> String {
        self.connection_id.clone()
    }
}
