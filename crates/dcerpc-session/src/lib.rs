//! Authenticated DCE/RPC session establishment and transport negotiation
//!
//! This crate turns "talk to service X on host H with these credentials"
//! into a bound, optionally authenticated connection-oriented DCE/RPC
//! channel, and drives request/response and paged exchanges over it.
//!
//! # Features
//!
//! - Endpoint resolution: explicit string binding or the endpoint mapper
//!   (`ept_map` on port 135)
//! - TCP (optionally TLS) and named pipe transports
//! - Bind negotiation with bounded fallback: one security-tier upgrade to
//!   the secured scheme, and interface version / transfer syntax alternatives
//!   tried in preference order
//! - Pluggable security providers behind [`Authenticator`]
//! - Paged queries with per-item error isolation
//! - Credential resolution from `domain/user:password` target specs
//!
//! # Example
//!
//! ```no_run
//! use dcerpc_session::{
//!     CredentialOptions, CredentialResolver, EndpointResolver, EpmMapper, SessionBuilder,
//!     ServiceDescriptor, SyntaxId, TcpTransport, TransportFamily, Uuid, NDR_SYNTAX,
//! };
//! use bytes::Bytes;
//!
//! #[tokio::main]
//! async fn main() -> dcerpc_session::Result<()> {
//!     let lsarpc = SyntaxId::new(Uuid::parse("12345778-1234-abcd-ef00-0123456789ab").unwrap(), 0, 0);
//!     let descriptor = ServiceDescriptor::builder(TransportFamily::Tcp)
//!         .alternative(lsarpc, NDR_SYNTAX)
//!         .build()?;
//!
//!     let credentials = CredentialResolver::resolve("corp.local/alice:secret", &CredentialOptions::default())?;
//!     let mut resolver = EndpointResolver::new("dc01.corp.local", EpmMapper::new(TcpTransport::new()));
//!     let address = resolver.resolve(&descriptor).await?;
//!
//!     let mut session = SessionBuilder::new(descriptor, credentials).connect(address).await?;
//!     let reply = session.request(0, Bytes::new()).await;
//!     session.close().await;
//!     println!("{:?}", reply);
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod credentials;
pub mod descriptor;
pub mod error;
pub mod string_binding;

// Wire format
pub mod fragmentation;
pub mod framing;
pub mod ndr;
pub mod pdu;
pub mod security;

pub mod epm;
pub mod probe;
pub mod resolver;
pub mod session;
pub mod transport;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use error::{AuthFailure, ChannelError, ErrorKind, ItemDecodeError, NdrError, Result, SessionError};

pub use config::SessionConfig;
pub use credentials::{
    parse_credentials, parse_target, CredentialOptions, CredentialResolver, Credentials, KdcTarget,
    Secret,
};
pub use descriptor::{InterfaceAlternative, ServiceDescriptor, ServiceDescriptorBuilder};
pub use string_binding::StringBinding;

pub use pdu::{SyntaxId, Uuid, NDR64_SYNTAX, NDR_SYNTAX};
pub use security::{Anonymous, AuthLevel, AuthType, Authenticator, SecurityContext};

pub use epm::{EpmEntry, EpmLookupCodec, EpmMapper, EPM_INTERFACE};
pub use probe::{probe_machine_name, MachineName};
pub use resolver::{EndpointMapper, EndpointResolver};
pub use session::{
    AuthState, Page, PageCodec, PagedCursor, PagedQuery, PagedSummary, Session, SessionBuilder,
    SessionState,
};
pub use transport::{
    Channel, Endpoint, NamedPipeTransport, Scheme, TargetAddress, TcpTransport, Transport,
    TransportFamily, EPM_PIPE_NAME, EPM_PORT,
};
