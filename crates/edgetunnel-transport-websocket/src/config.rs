//! WebSocket relay configuration

use edgetunnel_transport::{TransportError, TransportResult};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Configuration for relay connections over WebSocket
#[derive(Debug, Clone)]
pub struct WebSocketRelayConfig {
    /// TCP port of the relay endpoint
    pub port: u16,

    /// Request path of the tunnel handshake
    pub path: String,

    /// Additional trust anchor (PEM) on top of the web PKI roots
    pub root_ca: Option<PathBuf>,

    /// Upper bound for TCP + TLS + WebSocket handshakes
    pub connect_timeout: Duration,
}

impl Default for WebSocketRelayConfig {
    fn default() -> Self {
        Self {
            port: 443,
            path: "/tunnel".to_string(),
            root_ca: None,
            connect_timeout: Duration::from_secs(30),
        }
    }
}

impl WebSocketRelayConfig {
    /// Trust an additional root CA
    pub fn with_root_ca(mut self, path: impl Into<PathBuf>) -> Self {
        self.root_ca = Some(path.into());
        self
    }

    /// Handshake URL for an endpoint, always in destination mode
    pub fn tunnel_url(&self, endpoint: &str) -> String {
        format!(
            "wss://{}:{}{}?local-proxy-mode=destination",
            endpoint, self.port, self.path
        )
    }

    pub(crate) fn validate(&self) -> TransportResult<()> {
        if self.path.is_empty() || !self.path.starts_with('/') {
            return Err(TransportError::ConfigurationError(
                "WebSocket path must start with '/'".to_string(),
            ));
        }
        if self.port == 0 {
            return Err(TransportError::ConfigurationError(
                "Relay port cannot be 0".to_string(),
            ));
        }
        Ok(())
    }

    /// Build rustls TlsConnector for the relay
    pub(crate) fn build_tls_connector(&self) -> TransportResult<tokio_rustls::TlsConnector> {
        ensure_crypto_provider();

        let mut roots = rustls::RootCertStore::empty();
        roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned());

        if let Some(path) = &self.root_ca {
            for cert in load_certs(path)? {
                roots.add(cert).map_err(|e| {
                    TransportError::ConfigurationError(format!("Invalid root cert: {}", e))
                })?;
            }
            tracing::debug!(root_ca = %path.display(), "Loaded additional root CA");
        }

        let client_crypto = rustls::ClientConfig::builder()
            .with_root_certificates(roots)
            .with_no_client_auth();

        Ok(tokio_rustls::TlsConnector::from(Arc::new(client_crypto)))
    }
}

// Initialize rustls crypto provider
static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

fn load_certs(path: &Path) -> TransportResult<Vec<rustls::pki_types::CertificateDer<'static>>> {
    let file = File::open(path)
        .map_err(|e| TransportError::TlsError(format!("Failed to open root CA file: {}", e)))?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse root CA: {}", e)))?;

    if certs.is_empty() {
        return Err(TransportError::TlsError(format!(
            "No certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}
