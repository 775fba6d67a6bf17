//! Sessions: one bound, optionally authenticated channel to one service
//!
//! A [`Session`] is built from an immutable [`ServiceDescriptor`] and
//! [`Credentials`] pair. Negotiation (connect, bind, security upgrade and
//! version fallback) lives in `negotiator`; request/response and paged
//! exchanges live in `exchange`.
//!
//! ```text
//! Idle ──connect──▶ Connected ──bind──▶ Bound(level) ──auth3──▶ Authenticated
//!   ▲                   │                   │                        │
//!   └── tier / version ─┘                   └──────── close ─────────┴──▶ Closed
//!        fallback                 any unrecoverable error ──▶ Failed(kind)
//! ```

mod exchange;
mod negotiator;

pub use exchange::{Page, PageCodec, PagedCursor, PagedQuery, PagedSummary};
pub(crate) use negotiator::classify_bind_reply;

use crate::config::SessionConfig;
use crate::credentials::Credentials;
use crate::descriptor::{InterfaceAlternative, ServiceDescriptor};
use crate::error::{ErrorKind, Result, SessionError};
use crate::security::{Anonymous, AuthLevel, Authenticator, SecurityContext};
use crate::transport::{Channel, TargetAddress, TcpTransport, Transport};
use std::sync::Arc;
use tracing::debug;

/// Context id used for the single presentation context of a session.
const PRESENTATION_CONTEXT_ID: u16 = 0;
const AUTH_CONTEXT_ID: u32 = 0;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Connected,
    Bound { level: AuthLevel },
    Authenticated,
    Closed,
    Failed(ErrorKind),
}

/// What a caller can rely on for confidentiality of a live session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthState {
    Unauthenticated,
    BoundPlaintext,
    BoundSecured,
}

/// Outcome of the bind exchange
#[derive(Debug, Clone, Copy)]
pub(crate) struct Negotiated {
    pub max_xmit_frag: u16,
    pub level: AuthLevel,
}

/// Assembles a [`Session`]. Nothing touches the network until
/// [`SessionBuilder::connect`] or [`Session::establish`].
pub struct SessionBuilder {
    descriptor: ServiceDescriptor,
    credentials: Credentials,
    config: SessionConfig,
    transport: Option<Box<dyn Transport>>,
    authenticator: Arc<dyn Authenticator>,
}

impl SessionBuilder {
    pub fn new(descriptor: ServiceDescriptor, credentials: Credentials) -> Self {
        Self {
            descriptor,
            credentials,
            config: SessionConfig::default(),
            transport: None,
            authenticator: Arc::new(Anonymous),
        }
    }

    pub fn config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn transport(mut self, transport: impl Transport + 'static) -> Self {
        self.transport = Some(Box::new(transport));
        self
    }

    pub fn authenticator(mut self, authenticator: Arc<dyn Authenticator>) -> Self {
        self.authenticator = authenticator;
        self
    }

    /// An idle session; call [`Session::establish`] to bind it.
    pub fn build(self) -> Session {
        let transport = self.transport.unwrap_or_else(|| {
            Box::new(TcpTransport::new().with_max_pdu_size(self.config.max_pdu_size))
        });
        Session {
            descriptor: self.descriptor,
            credentials: self.credentials,
            negotiated: Negotiated {
                max_xmit_frag: self.config.max_xmit_frag,
                level: AuthLevel::None,
            },
            config: self.config,
            transport,
            authenticator: self.authenticator,
            state: SessionState::Idle,
            address: None,
            channel: None,
            security: None,
            bound: None,
            next_call_id: 1,
        }
    }

    /// Builds and establishes a session at `address`. On failure the
    /// half-built session is closed before the error is returned.
    pub async fn connect(self, address: TargetAddress) -> Result<Session> {
        let mut session = self.build();
        if let Err(err) = session.establish(address).await {
            session.close().await;
            return Err(err);
        }
        Ok(session)
    }
}

pub struct Session {
    descriptor: ServiceDescriptor,
    credentials: Credentials,
    config: SessionConfig,
    transport: Box<dyn Transport>,
    authenticator: Arc<dyn Authenticator>,
    state: SessionState,
    address: Option<TargetAddress>,
    channel: Option<Box<dyn Channel>>,
    security: Option<Box<dyn SecurityContext>>,
    bound: Option<InterfaceAlternative>,
    negotiated: Negotiated,
    next_call_id: u32,
}

impl Session {
    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn descriptor(&self) -> &ServiceDescriptor {
        &self.descriptor
    }

    /// Address of the live channel; reflects a secured-scheme upgrade.
    pub fn address(&self) -> Option<&TargetAddress> {
        self.address.as_ref()
    }

    /// The interface alternative the server accepted.
    pub fn bound_interface(&self) -> Option<&InterfaceAlternative> {
        self.bound.as_ref()
    }

    pub fn auth_level(&self) -> Option<AuthLevel> {
        match self.state {
            SessionState::Bound { level } => Some(level),
            SessionState::Authenticated => Some(self.negotiated.level),
            _ => None,
        }
    }

    pub fn auth_state(&self) -> AuthState {
        let secured = self.address.as_ref().is_some_and(|a| a.is_secured());
        match self.state {
            SessionState::Bound { level } if secured || level.requires_signing() => {
                AuthState::BoundSecured
            }
            SessionState::Bound { .. } => AuthState::BoundPlaintext,
            SessionState::Authenticated if secured || self.negotiated.level.requires_signing() => {
                AuthState::BoundSecured
            }
            SessionState::Authenticated => AuthState::BoundPlaintext,
            _ => AuthState::Unauthenticated,
        }
    }

    pub fn is_established(&self) -> bool {
        matches!(
            self.state,
            SessionState::Bound { .. } | SessionState::Authenticated
        )
    }

    /// Releases the channel. Safe to call any number of times, in any state.
    pub async fn close(&mut self) {
        if self.state == SessionState::Closed {
            return;
        }
        self.release_channel().await;
        self.bound = None;
        debug!("session closed (was {:?})", self.state);
        self.state = SessionState::Closed;
    }

    /// Fails fast unless the session can carry a call.
    fn ensure_established(&self) -> Result<()> {
        match self.state {
            SessionState::Bound { .. } | SessionState::Authenticated => Ok(()),
            SessionState::Closed => Err(SessionError::SessionClosed),
            SessionState::Failed(kind) => Err(SessionError::SessionFailed(kind)),
            SessionState::Idle | SessionState::Connected => Err(SessionError::InvalidInput(
                "session is not bound; call establish first".into(),
            )),
        }
    }

    async fn release_channel(&mut self) {
        self.security = None;
        if let Some(mut channel) = self.channel.take() {
            if let Err(err) = channel.close().await {
                debug!("error while closing channel: {}", err);
            }
        }
    }

    /// Moves to `Failed` and drops the channel, handing the error back.
    fn fail(&mut self, err: SessionError) -> SessionError {
        self.security = None;
        self.channel = None;
        self.state = SessionState::Failed(err.kind());
        err
    }

    fn next_call_id(&mut self) -> u32 {
        let id = self.next_call_id;
        self.next_call_id = self.next_call_id.wrapping_add(1).max(1);
        id
    }
}
