use edgetunnel_transport::{RelayConnection, TransportError};
use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Errors that can occur during TCP forwarding
#[derive(Error, Debug)]
pub enum ForwarderError {
    #[error("Failed to connect to local address {address}: {source}")]
    ConnectionFailed {
        address: SocketAddr,
        source: std::io::Error,
    },

    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("IO error during forwarding: {0}")]
    Io(#[from] std::io::Error),

    #[error("Forward task aborted: {0}")]
    Aborted(String),
}

/// Which side ended a bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ForwardEnd {
    /// The local TCP endpoint reached EOF
    LocalClosed,
    /// The relay connection was closed
    RelayClosed,
    /// The bridge was cancelled by its owner
    Cancelled,
}

impl fmt::Display for ForwardEnd {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ForwardEnd::LocalClosed => write!(f, "local endpoint closed"),
            ForwardEnd::RelayClosed => write!(f, "relay connection closed"),
            ForwardEnd::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// Outcome of a completed bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ForwardStats {
    pub end: ForwardEnd,
    pub bytes_to_local: u64,
    pub bytes_to_relay: u64,
}

/// Handle to a running bridge
///
/// Awaiting [`ForwardHandle::wait`] is the bridge's termination notification.
#[derive(Debug)]
pub struct ForwardHandle {
    task: JoinHandle<Result<ForwardStats, ForwarderError>>,
    cancel: CancellationToken,
}

impl ForwardHandle {
    /// Ask the bridge to stop, it then completes with [`ForwardEnd::Cancelled`]
    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Wait for the bridge to terminate
    pub async fn wait(self) -> Result<ForwardStats, ForwarderError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(ForwarderError::Aborted(e.to_string())),
        }
    }
}

/// Bridges a relay connection to a local TCP endpoint
#[derive(Debug, Clone)]
pub struct TcpForwarder {
    buffer_size: usize,
}

impl Default for TcpForwarder {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpForwarder {
    /// Create a new TCP forwarder
    pub fn new() -> Self {
        Self {
            buffer_size: 16 * 1024,
        }
    }

    /// Start bridging `relay` with the local endpoint at `local_address`
    ///
    /// The bridge runs on its own task. It ends when either side closes,
    /// on the first I/O error, or when `cancel` fires.
    pub fn bridge(
        &self,
        local_address: SocketAddr,
        relay: Arc<dyn RelayConnection>,
        cancel: CancellationToken,
    ) -> ForwardHandle {
        let buffer_size = self.buffer_size;
        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            Self::forward(local_address, relay, task_cancel, buffer_size).await
        });

        ForwardHandle { task, cancel }
    }

    async fn forward(
        local_address: SocketAddr,
        relay: Arc<dyn RelayConnection>,
        cancel: CancellationToken,
        buffer_size: usize,
    ) -> Result<ForwardStats, ForwarderError> {
        let connection_id = relay.connection_id();

        tracing::info!(
            connection_id = %connection_id,
            local_address = %local_address,
            "Starting TCP forward"
        );

        let local_stream = tokio::select! {
            result = TcpStream::connect(local_address) => {
                result.map_err(|e| ForwarderError::ConnectionFailed {
                    address: local_address,
                    source: e,
                })?
            }
            _ = cancel.cancelled() => {
                return Ok(ForwardStats {
                    end: ForwardEnd::Cancelled,
                    bytes_to_local: 0,
                    bytes_to_relay: 0,
                });
            }
        };

        tracing::debug!(
            connection_id = %connection_id,
            local_address = %local_address,
            "Connected to local address"
        );

        let (mut local_read, mut local_write) = local_stream.into_split();
        let mut bytes_to_local = 0u64;
        let mut bytes_to_relay = 0u64;

        let result = tokio::select! {
            result = relay_to_local(relay.as_ref(), &mut local_write, &mut bytes_to_local) => result,
            result = local_to_relay(&mut local_read, relay.as_ref(), &mut bytes_to_relay, buffer_size) => result,
            _ = cancel.cancelled() => Ok(ForwardEnd::Cancelled),
        };

        let _ = local_write.shutdown().await;

        let end = result?;

        tracing::info!(
            connection_id = %connection_id,
            local_address = %local_address,
            end = %end,
            bytes_to_local = bytes_to_local,
            bytes_to_relay = bytes_to_relay,
            "TCP forward completed"
        );

        Ok(ForwardStats {
            end,
            bytes_to_local,
            bytes_to_relay,
        })
    }
}

/// Copy tunneled bytes from the relay into the local endpoint
async fn relay_to_local<W>(
    relay: &dyn RelayConnection,
    local: &mut W,
    total_bytes: &mut u64,
) -> Result<ForwardEnd, ForwarderError>
where
    W: AsyncWrite + Unpin,
{
    loop {
        match relay.recv_bytes().await? {
            Some(data) => {
                if data.is_empty() {
                    continue;
                }
                local.write_all(&data).await?;
                *total_bytes += data.len() as u64;
            }
            None => {
                tracing::debug!("Relay connection closed");
                return Ok(ForwardEnd::RelayClosed);
            }
        }
    }
}

/// Copy bytes read from the local endpoint into the relay
async fn local_to_relay<R>(
    local: &mut R,
    relay: &dyn RelayConnection,
    total_bytes: &mut u64,
    buffer_size: usize,
) -> Result<ForwardEnd, ForwarderError>
where
    R: AsyncRead + Unpin,
{
    let mut buffer = vec![0u8; buffer_size];

    loop {
        let n = local.read(&mut buffer).await?;
        if n == 0 {
            tracing::debug!("Local connection closed");
            return Ok(ForwardEnd::LocalClosed);
        }

        relay.send_bytes(&buffer[..n]).await?;
        *total_bytes += n as u64;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use edgetunnel_transport::memory::memory_relay_pair;
    use tokio::net::TcpListener;

    #[test]
    fn test_forwarder_error_display() {
        let err = ForwarderError::ConnectionFailed {
            address: "127.0.0.1:22".parse().unwrap(),
            source: std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
        };
        assert!(err.to_string().contains("127.0.0.1:22"));
    }

    #[tokio::test]
    async fn test_bridge_both_directions_until_local_close() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_address = listener.local_addr().unwrap();
        let (connection, mut peer) = memory_relay_pair("bridge-test");

        let handle = TcpForwarder::new().bridge(
            local_address,
            Arc::new(connection),
            CancellationToken::new(),
        );

        let (mut local, _) = listener.accept().await.unwrap();

        peer.send(b"ping").await.unwrap();
        let mut buf = [0u8; 4];
        local.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"ping");

        local.write_all(b"pong!").await.unwrap();
        assert_eq!(&peer.recv().await.unwrap()[..], b"pong!");

        drop(local);

        let stats = handle.wait().await.unwrap();
        assert_eq!(stats.end, ForwardEnd::LocalClosed);
        assert_eq!(stats.bytes_to_local, 4);
        assert_eq!(stats.bytes_to_relay, 5);
    }

    #[tokio::test]
    async fn test_bridge_ends_when_relay_closes() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_address = listener.local_addr().unwrap();
        let (connection, peer) = memory_relay_pair("bridge-test");

        let handle = TcpForwarder::new().bridge(
            local_address,
            Arc::new(connection),
            CancellationToken::new(),
        );
        let (mut local, _) = listener.accept().await.unwrap();

        peer.disconnect();

        let stats = handle.wait().await.unwrap();
        assert_eq!(stats.end, ForwardEnd::RelayClosed);

        // Local side sees EOF after the bridge shuts down its write half
        let mut buf = Vec::new();
        assert_eq!(local.read_to_end(&mut buf).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_bridge_cancelled() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_address = listener.local_addr().unwrap();
        let (connection, _peer) = memory_relay_pair("bridge-test");

        let handle = TcpForwarder::new().bridge(
            local_address,
            Arc::new(connection),
            CancellationToken::new(),
        );
        let (_local, _) = listener.accept().await.unwrap();

        handle.cancel();
        assert_eq!(handle.wait().await.unwrap().end, ForwardEnd::Cancelled);
    }

    #[tokio::test]
    async fn test_bridge_local_connect_failure() {
        // Bind then drop to get a port nothing listens on
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let local_address = listener.local_addr().unwrap();
        drop(listener);

        let (connection, _peer) = memory_relay_pair("bridge-test");
        let handle = TcpForwarder::new().bridge(
            local_address,
            Arc::new(connection),
            CancellationToken::new(),
        );

        let err = handle.wait().await.unwrap_err();
        assert!(matches!(err, ForwarderError::ConnectionFailed { .. }));
    }
}
