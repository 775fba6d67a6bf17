//! Error types for session establishment and exchanges
//!
//! Every failure carries an [`ErrorKind`] so that fallback decisions and
//! caller diagnostics are driven by structured values, never by message text.

use crate::pdu::PacketType;
use std::time::Duration;
use thiserror::Error;

/// Coarse classification of a [`SessionError`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The endpoint mapper had no registration for any interface alternative.
    EndpointUnavailable,
    /// Socket-level failure or connect timeout.
    TransportUnreachable,
    /// The remote end actively refused the protocol.
    TransportRejected,
    /// Credential exchange failed or the security tier could not be satisfied.
    AuthNegotiationFailed,
    /// Bind rejected because a higher security tier is required.
    SecurityTierRejected,
    /// No declared interface alternative was accepted.
    UnsupportedInterfaceVersion,
    /// A single item in a paged result could not be decoded.
    ItemDecodeError,
    /// Framing, I/O or protocol failure on a live channel.
    ChannelError,
    /// The server answered a request with a fault PDU.
    RemoteFault,
    /// Malformed caller input (bindings, credentials, descriptors).
    InvalidInput,
    /// The session is closed or has failed and can no longer be used.
    SessionClosed,
}

/// Errors surfaced by the session layer
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("no endpoint registered for {interfaces}")]
    EndpointUnavailable { interfaces: String },

    #[error("cannot reach {address}: {source}")]
    TransportUnreachable {
        address: String,
        #[source]
        source: std::io::Error,
    },

    #[error(
        "connection to {address} timed out after {timeout:?}; \
         specify the NetBIOS name or FQDN of the host instead of its address"
    )]
    ConnectTimeout { address: String, timeout: Duration },

    #[error("{address} rejected the protocol: {reason}")]
    TransportRejected { address: String, reason: String },

    #[error("authentication negotiation failed: {0}")]
    AuthNegotiationFailed(#[from] AuthFailure),

    #[error("bind requires a higher security tier (status 0x{status:08x})")]
    SecurityTierRejected { status: u32 },

    #[error("{address} accepted none of the {tried} interface alternative(s)")]
    UnsupportedInterfaceVersion { address: String, tried: usize },

    #[error(transparent)]
    ItemDecode(#[from] ItemDecodeError),

    #[error(transparent)]
    Channel(#[from] ChannelError),

    #[error("remote fault: status 0x{status:08x}")]
    RemoteFault { status: u32 },

    #[error("invalid input: {0}")]
    InvalidInput(String),

    #[error("session is closed")]
    SessionClosed,

    #[error("session failed earlier ({0:?}) and must be closed")]
    SessionFailed(ErrorKind),
}

impl SessionError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Self::EndpointUnavailable { .. } => ErrorKind::EndpointUnavailable,
            Self::TransportUnreachable { .. } | Self::ConnectTimeout { .. } => {
                ErrorKind::TransportUnreachable
            }
            Self::TransportRejected { .. } => ErrorKind::TransportRejected,
            Self::AuthNegotiationFailed(_) => ErrorKind::AuthNegotiationFailed,
            Self::SecurityTierRejected { .. } => ErrorKind::SecurityTierRejected,
            Self::UnsupportedInterfaceVersion { .. } => ErrorKind::UnsupportedInterfaceVersion,
            Self::ItemDecode(_) => ErrorKind::ItemDecodeError,
            Self::Channel(_) => ErrorKind::ChannelError,
            Self::RemoteFault { .. } => ErrorKind::RemoteFault,
            Self::InvalidInput(_) => ErrorKind::InvalidInput,
            Self::SessionClosed | Self::SessionFailed(_) => ErrorKind::SessionClosed,
        }
    }

    /// True for a connect attempt that ran out of time, as opposed to one
    /// that was refused or failed at the socket level.
    pub fn is_timeout(&self) -> bool {
        matches!(
            self,
            Self::ConnectTimeout { .. } | Self::Channel(ChannelError::Timeout(_))
        )
    }

    /// True when the session that produced this error can no longer be used.
    pub fn is_fatal(&self) -> bool {
        !matches!(
            self,
            Self::RemoteFault { .. } | Self::ItemDecode(_) | Self::InvalidInput(_)
        )
    }

    pub(crate) fn unreachable(address: impl ToString, source: std::io::Error) -> Self {
        Self::TransportUnreachable {
            address: address.to_string(),
            source,
        }
    }

    pub(crate) fn rejected(address: impl ToString, reason: impl Into<String>) -> Self {
        Self::TransportRejected {
            address: address.to_string(),
            reason: reason.into(),
        }
    }
}

impl From<std::io::Error> for SessionError {
    fn from(err: std::io::Error) -> Self {
        Self::Channel(ChannelError::Io(err))
    }
}

impl From<NdrError> for SessionError {
    fn from(err: NdrError) -> Self {
        Self::Channel(ChannelError::Ndr(err))
    }
}

/// Reasons a credential exchange can fail
#[derive(Debug, Error)]
pub enum AuthFailure {
    #[error(
        "{mechanism} is disabled for {host} (status 0x{status:08x}); \
         supply the NetBIOS name or FQDN of the host as an alternate target"
    )]
    MechanismDisabled {
        mechanism: String,
        host: String,
        status: u32,
    },

    #[error("{address} still demands a higher security tier on the secured transport (status 0x{status:08x})")]
    SecurityTierExhausted { address: String, status: u32 },

    #[error("bind rejected by server (status 0x{status:08x})")]
    Rejected { status: u32 },

    #[error("security provider: {0}")]
    Provider(String),
}

/// Fatal failures on a live channel
#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("invalid PDU: {0}")]
    InvalidPdu(String),

    #[error("unexpected {0:?} PDU")]
    UnexpectedPdu(PacketType),

    #[error("call ID mismatch: expected {expected}, got {got}")]
    CallIdMismatch { expected: u32, got: u32 },

    #[error("PDU too large: {size} bytes exceeds maximum {max}")]
    PduTooLarge { size: usize, max: usize },

    #[error("fragment reassembly failed: {0}")]
    Fragment(String),

    #[error("exchange timed out after {0:?}")]
    Timeout(Duration),

    #[error("malformed stub data: {0}")]
    Ndr(#[from] NdrError),

    #[error("malformed page: {0}")]
    MalformedPage(String),

    #[error("message protection failed: {0}")]
    Protection(String),
}

/// A single result item that could not be decoded or processed.
///
/// Paged queries log and skip these instead of aborting.
#[derive(Debug, Clone, Error)]
#[error("cannot process item: {0}")]
pub struct ItemDecodeError(pub String);

impl ItemDecodeError {
    pub fn new(reason: impl Into<String>) -> Self {
        Self(reason.into())
    }
}

impl From<NdrError> for ItemDecodeError {
    fn from(err: NdrError) -> Self {
        Self(err.to_string())
    }
}

/// NDR decoding errors
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum NdrError {
    #[error("buffer underflow: need {needed} bytes, have {have}")]
    BufferUnderflow { needed: usize, have: usize },

    #[error("invalid data: {0}")]
    InvalidData(String),
}

pub type Result<T> = std::result::Result<T, SessionError>;
