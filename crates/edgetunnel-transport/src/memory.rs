//! In-memory relay for tests
//!
//! [`MemoryRelayConnector`] hands out [`MemoryRelayConnection`]s whose far
//! end is a [`MemoryRelayPeer`] the test drives directly: it plays the
//! remote source of the tunnel.

use crate::{RelayConnection, RelayConnector, TransportError, TransportResult};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;

/// Device side of an in-memory relay connection
#[derive(Debug)]
pub struct MemoryRelayConnection {
    id: String,
    inbound: Mutex<mpsc::Receiver<Bytes>>,
    outbound: mpsc::Sender<Bytes>,
    closed: CancellationToken,
}

/// Remote side of an in-memory relay connection
#[derive(Debug)]
pub struct MemoryRelayPeer {
    to_device: mpsc::Sender<Bytes>,
    from_device: mpsc::Receiver<Bytes>,
    closed: CancellationToken,
}

/// Create a connected device/peer pair
pub fn memory_relay_pair(id: impl Into<String>) -> (MemoryRelayConnection, MemoryRelayPeer) {
    let (to_device, inbound) = mpsc::channel(64);
    let (outbound, from_device) = mpsc::channel(64);
    let closed = CancellationToken::new();

    (
        MemoryRelayConnection {
            id: id.into(),
            inbound: Mutex::new(inbound),
            outbound,
            closed: closed.clone(),
        },
        MemoryRelayPeer {
            to_device,
            from_device,
            closed,
        },
    )
}

#[async_trait]
impl RelayConnection for MemoryRelayConnection {
    async fn send_bytes(&self, data: &[u8]) -> TransportResult<()> {
        if self.closed.is_cancelled() {
            return Err(TransportError::StreamClosed);
        }
        self.outbound
            .send(Bytes::copy_from_slice(data))
            .await
            .map_err(|_| TransportError::StreamClosed)
    }

    async fn recv_bytes(&self) -> TransportResult<Option<Bytes>> {
        let mut inbound = self.inbound.lock().await;
        tokio::select! {
            _ = self.closed.cancelled() => Ok(None),
            data = inbound.recv() => Ok(data),
        }
    }

    async fn close(&self, _reason: &str) {
        self.closed.cancel();
    }

    fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    fn connection_id(&self) -> String {
        self.id.clone()
    }
}

impl MemoryRelayPeer {
    /// Push bytes towards the device
    pub async fn send(&self, data: &[u8]) -> TransportResult<()> {
        self.to_device
            .send(Bytes::copy_from_slice(data))
            .await
            .map_err(|_| TransportError::StreamClosed)
    }

    /// Next chunk the device sent, `None` once the device side is gone
    pub async fn recv(&mut self) -> Option<Bytes> {
        tokio::select! {
            data = self.from_device.recv() => data,
            _ = self.closed.cancelled() => None,
        }
    }

    /// Drop the relay connection from the remote side
    pub fn disconnect(&self) {
        self.closed.cancel();
    }

    /// Whether either side has closed the connection
    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }
}

/// Connector producing in-memory connections, recording every handshake
#[derive(Debug, Default)]
pub struct MemoryRelayConnector {
    peers: Mutex<HashMap<String, MemoryRelayPeer>>,
    rejected_tokens: std::sync::Mutex<HashSet<String>>,
    attempts: std::sync::Mutex<Vec<(String, String)>>,
    next_id: AtomicUsize,
}

impl MemoryRelayConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Make every handshake using this token fail
    pub fn reject_token(&self, access_token: &str) {
        if let Ok(mut rejected) = self.rejected_tokens.lock() {
            rejected.insert(access_token.to_string());
        }
    }

    /// Take the remote end of the connection opened with `access_token`
    pub async fn take_peer(&self, access_token: &str) -> Option<MemoryRelayPeer> {
        self.peers.lock().await.remove(access_token)
    }

    /// Every (access token, endpoint) pair a handshake was attempted with
    pub fn attempts(&self) -> Vec<(String, String)> {
        self.attempts
            .lock()
            .map(|attempts| attempts.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl RelayConnector for MemoryRelayConnector {
    async fn connect(
        &self,
        access_token: &str,
        endpoint: &str,
    ) -> TransportResult<Arc<dyn RelayConnection>> {
        if let Ok(mut attempts) = self.attempts.lock() {
            attempts.push((access_token.to_string(), endpoint.to_string()));
        }

        let rejected = self
            .rejected_tokens
            .lock()
            .map(|rejected| rejected.contains(access_token))
            .unwrap_or(false);
        if rejected {
            return Err(TransportError::AuthenticationFailed(
                "access token rejected".to_string(),
            ));
        }

        let id = format!("memory-{}", self.next_id.fetch_add(1, Ordering::SeqCst));
        let (connection, peer) = memory_relay_pair(id);
        self.peers
            .lock()
            .await
            .insert(access_token.to_string(), peer);

        Ok(Arc::new(connection))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_memory_pair_round_trip() {
        let (connection, mut peer) = memory_relay_pair("test");

        peer.send(b"hello").await.unwrap();
        let data = connection.recv_bytes().await.unwrap().unwrap();
        assert_eq!(&data[..], b"hello");

        connection.send_bytes(b"world").await.unwrap();
        assert_eq!(&peer.recv().await.unwrap()[..], b"world");
    }

    #[tokio::test]
    async fn test_peer_disconnect_ends_recv() {
        let (connection, peer) = memory_relay_pair("test");

        peer.disconnect();
        assert!(connection.recv_bytes().await.unwrap().is_none());
        assert!(connection.is_closed());
        assert!(connection.send_bytes(b"late").await.is_err());
    }

    #[tokio::test]
    async fn test_connector_rejects_token() {
        let connector = MemoryRelayConnector::new();
        connector.reject_token("bad");

        assert!(connector.connect("bad", "relay").await.is_err());
        assert!(connector.connect("good", "relay").await.is_ok());
        assert!(connector.take_peer("good").await.is_some());
        assert_eq!(connector.attempts().len(), 2);
    }
}
