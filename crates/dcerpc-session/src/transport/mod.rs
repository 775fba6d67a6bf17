//! Transports: point-to-point byte channels carrying framed PDUs
//!
//! A [`Transport`] knows how to open a [`Channel`] to a [`TargetAddress`].
//! Channels are exclusively owned by one session and carry exactly one
//! outstanding exchange at a time.

mod named_pipe;
mod tcp;

pub use named_pipe::{NamedPipeTransport, EPM_PIPE_NAME};
pub use tcp::{TcpTransport, EPM_PORT};

use crate::credentials::Credentials;
use crate::error::{Result, SessionError};
use crate::framing::PduFramer;
use async_trait::async_trait;
use bytes::Bytes;
use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};

/// Protocol sequences this crate can carry a session over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportFamily {
    /// `ncacn_np`: named pipes over SMB
    NamedPipe,
    /// `ncacn_ip_tcp`: raw TCP
    Tcp,
}

impl TransportFamily {
    pub fn protocol_sequence(&self) -> &'static str {
        match self {
            Self::NamedPipe => "ncacn_np",
            Self::Tcp => "ncacn_ip_tcp",
        }
    }

    pub fn from_protocol_sequence(seq: &str) -> Option<Self> {
        match seq.to_ascii_lowercase().as_str() {
            "ncacn_np" => Some(Self::NamedPipe),
            "ncacn_ip_tcp" => Some(Self::Tcp),
            _ => None,
        }
    }
}

impl fmt::Display for TransportFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.protocol_sequence())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Scheme {
    #[default]
    Plain,
    /// The encrypted counterpart of the same endpoint (TLS over TCP).
    Secured,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Endpoint {
    Port(u16),
    /// Pipe path in `\pipe\name` form.
    Pipe(String),
}

/// A connectable address. Replaced, not mutated, during fallback.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TargetAddress {
    pub host: String,
    pub endpoint: Endpoint,
    pub scheme: Scheme,
}

impl TargetAddress {
    pub fn tcp(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            endpoint: Endpoint::Port(port),
            scheme: Scheme::Plain,
        }
    }

    pub fn pipe(host: impl Into<String>, pipe: &str) -> Self {
        Self {
            host: host.into(),
            endpoint: Endpoint::Pipe(normalize_pipe_name(pipe)),
            scheme: Scheme::Plain,
        }
    }

    pub fn family(&self) -> TransportFamily {
        match self.endpoint {
            Endpoint::Port(_) => TransportFamily::Tcp,
            Endpoint::Pipe(_) => TransportFamily::NamedPipe,
        }
    }

    /// Same host and endpoint on the secured scheme.
    pub fn secured(&self) -> Self {
        Self {
            scheme: Scheme::Secured,
            ..self.clone()
        }
    }

    pub fn is_secured(&self) -> bool {
        self.scheme == Scheme::Secured
    }
}

impl fmt::Display for TargetAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.endpoint {
            Endpoint::Port(port) => write!(f, "{}:{}[{}]", self.family(), self.host, port)?,
            Endpoint::Pipe(pipe) => write!(f, "{}:{}[{}]", self.family(), self.host, pipe)?,
        }
        if self.is_secured() {
            f.write_str(" (secured)")?;
        }
        Ok(())
    }
}

/// Normalizes `epmapper`, `\pipe\epmapper` or `\\host\pipe\epmapper` to
/// `\pipe\epmapper`.
pub fn normalize_pipe_name(name: &str) -> String {
    let trimmed = name.trim_start_matches('\\');
    let bare = match trimmed.to_ascii_lowercase().find("pipe\\") {
        Some(idx) => &trimmed[idx + 5..],
        None => trimmed,
    };
    format!("\\pipe\\{}", bare)
}

#[async_trait]
pub trait Transport: Send + Sync {
    fn family(&self) -> TransportFamily;

    /// Gives the transport credentials it can embed in its own handshake.
    /// Transports that have none to embed ignore the call.
    fn attach_credentials(&mut self, _credentials: &Credentials) {}

    async fn connect(&self, address: &TargetAddress, timeout: Duration)
        -> Result<Box<dyn Channel>>;
}

/// A connected, framed byte channel
#[async_trait]
pub trait Channel: Send {
    async fn send(&mut self, pdu: Bytes) -> Result<()>;

    async fn receive(&mut self) -> Result<Bytes>;

    async fn close(&mut self) -> Result<()>;
}

/// Runs a connect future under `timeout`, mapping expiry to the distinct
/// [`SessionError::ConnectTimeout`].
pub async fn connect_within<T, F>(address: &TargetAddress, timeout: Duration, fut: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    match tokio::time::timeout(timeout, fut).await {
        Ok(result) => result,
        Err(_) => Err(SessionError::ConnectTimeout {
            address: address.to_string(),
            timeout,
        }),
    }
}

/// [`Channel`] over any async byte stream
pub struct StreamChannel<S> {
    framer: PduFramer<S>,
    closed: bool,
}

impl<S> StreamChannel<S> {
    pub fn new(stream: S, max_pdu_size: usize) -> Self {
        Self {
            framer: PduFramer::new(stream).with_max_pdu_size(max_pdu_size),
            closed: false,
        }
    }
}

#[async_trait]
impl<S> Channel for StreamChannel<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn send(&mut self, pdu: Bytes) -> Result<()> {
        if self.closed {
            return Err(SessionError::SessionClosed);
        }
        self.framer.write_pdu(&pdu).await
    }

    async fn receive(&mut self) -> Result<Bytes> {
        if self.closed {
            return Err(SessionError::SessionClosed);
        }
        self.framer.read_pdu().await
    }

    async fn close(&mut self) -> Result<()> {
        if std::mem::replace(&mut self.closed, true) {
            return Ok(());
        }
        self.framer.shutdown().await
    }
}
