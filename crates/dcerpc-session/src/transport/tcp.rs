//! `ncacn_ip_tcp` transport
//!
//! Plain TCP for [`Scheme::Plain`] addresses; the secured scheme runs the
//! same PDU stream inside TLS.

use super::{connect_within, Channel, Endpoint, Scheme, StreamChannel, TargetAddress, Transport, TransportFamily};
use crate::error::{Result, SessionError};
use crate::framing::DEFAULT_MAX_PDU_SIZE;
use async_trait::async_trait;
use rustls::pki_types::ServerName;
use rustls::{ClientConfig, RootCertStore};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tracing::{debug, warn};

/// Well-known endpoint mapper port
pub const EPM_PORT: u16 = 135;

/// TCP transport, optionally wrapping connections in TLS
#[derive(Clone)]
pub struct TcpTransport {
    max_pdu_size: usize,
    tls: Option<Arc<ClientConfig>>,
}

impl Default for TcpTransport {
    fn default() -> Self {
        Self::new()
    }
}

impl TcpTransport {
    pub fn new() -> Self {
        Self {
            max_pdu_size: DEFAULT_MAX_PDU_SIZE,
            tls: None,
        }
    }

    pub fn with_max_pdu_size(mut self, size: usize) -> Self {
        self.max_pdu_size = size;
        self
    }

    /// Uses `config` for secured connections instead of the platform roots.
    pub fn with_tls_config(mut self, config: Arc<ClientConfig>) -> Self {
        self.tls = Some(config);
        self
    }

    fn tls_config(&self) -> Result<Arc<ClientConfig>> {
        if let Some(config) = &self.tls {
            return Ok(config.clone());
        }
        let mut roots = RootCertStore::empty();
        let native = rustls_native_certs::load_native_certs();
        for err in &native.errors {
            warn!("failed to load platform certificate: {}", err);
        }
        let (added, ignored) = roots.add_parsable_certificates(native.certs);
        debug!(added, ignored, "loaded platform root certificates");

        let config = ClientConfig::builder_with_provider(Arc::new(
            rustls::crypto::ring::default_provider(),
        ))
        .with_safe_default_protocol_versions()
        .map_err(|e| SessionError::InvalidInput(format!("TLS configuration: {}", e)))?
        .with_root_certificates(roots)
        .with_no_client_auth();
        Ok(Arc::new(config))
    }

    async fn open(&self, address: &TargetAddress) -> Result<Box<dyn Channel>> {
        let port = match &address.endpoint {
            Endpoint::Port(port) => *port,
            Endpoint::Pipe(pipe) => {
                return Err(SessionError::InvalidInput(format!(
                    "TCP transport cannot open pipe endpoint {}",
                    pipe
                )))
            }
        };

        let stream = TcpStream::connect((address.host.as_str(), port))
            .await
            .map_err(|e| SessionError::unreachable(address, e))?;
        stream.set_nodelay(true)?;
        debug!(%address, "TCP connection established");

        match address.scheme {
            Scheme::Plain => Ok(Box::new(StreamChannel::new(stream, self.max_pdu_size))),
            Scheme::Secured => {
                let server_name = ServerName::try_from(address.host.clone()).map_err(|e| {
                    SessionError::InvalidInput(format!("invalid TLS server name {}: {}", address.host, e))
                })?;
                let connector = TlsConnector::from(self.tls_config()?);
                let tls = connector
                    .connect(server_name, stream)
                    .await
                    .map_err(|e| SessionError::rejected(address, format!("TLS handshake failed: {}", e)))?;
                debug!(%address, "TLS session established");
                Ok(Box::new(StreamChannel::new(tls, self.max_pdu_size)))
            }
        }
    }
}

#[async_trait]
impl Transport for TcpTransport {
    fn family(&self) -> TransportFamily {
        TransportFamily::Tcp
    }

    async fn connect(&self, address: &TargetAddress, timeout: Duration) -> Result<Box<dyn Channel>> {
        connect_within(address, timeout, self.open(address)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use bytes::Bytes;
    use tokio::io::AsyncReadExt;
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_plain_connect_carries_pdus() {
        crate::testing::init_test_logging();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).await.unwrap();
            buf
        });

        let transport = TcpTransport::new();
        let mut channel = transport
            .connect(&TargetAddress::tcp("127.0.0.1", port), Duration::from_secs(5))
            .await
            .unwrap();
        channel.send(Bytes::from_static(b"ping")).await.unwrap();
        assert_eq!(&server.await.unwrap(), b"ping");
        channel.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_refused_connect_is_unreachable_not_timeout() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);

        let err = TcpTransport::new()
            .connect(&TargetAddress::tcp("127.0.0.1", port), Duration::from_secs(5))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::TransportUnreachable);
        assert!(!err.is_timeout());
    }

    #[tokio::test]
    async fn test_pipe_endpoint_is_invalid_for_tcp() {
        let err = TcpTransport::new()
            .connect(&TargetAddress::pipe("dc01", "lsarpc"), Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }
}
