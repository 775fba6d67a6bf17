//! Shared fixtures for the scenario tests under `src/*_tests.rs`

use bytes::Bytes;
use dcerpc_session::testing::ServerScript;
use dcerpc_session::{
    CredentialOptions, CredentialResolver, Credentials, ServiceDescriptor, SessionConfig, SyntaxId,
    TargetAddress, TransportFamily, Uuid, NDR_SYNTAX,
};
use std::time::Duration;
use tracing_subscriber::EnvFilter;

/// Directory service interface used throughout, in two versions.
pub const DIRECTORY_UUID: Uuid = Uuid::from_u128(0x6bffd098_a112_3610_9833_46c3f87e345a);
pub const DIRECTORY_V1: SyntaxId = SyntaxId::new(DIRECTORY_UUID, 1, 0);
pub const DIRECTORY_V2: SyntaxId = SyntaxId::new(DIRECTORY_UUID, 2, 0);

/// Initialize logging for tests; `RUST_LOG=debug` shows negotiation steps.
pub fn init_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Prefers v2, falls back to v1.
pub fn directory_descriptor() -> ServiceDescriptor {
    ServiceDescriptor::builder(TransportFamily::Tcp)
        .alternative(DIRECTORY_V2, NDR_SYNTAX)
        .alternative(DIRECTORY_V1, NDR_SYNTAX)
        .build()
        .unwrap()
}

pub fn alice() -> Credentials {
    CredentialResolver::resolve("corp.local/alice:S3cret", &CredentialOptions::default()).unwrap()
}

pub fn dc01() -> TargetAddress {
    TargetAddress::tcp("dc01.corp.local", 49667)
}

pub fn fast_config() -> SessionConfig {
    SessionConfig::default()
        .with_connect_timeout(Duration::from_millis(200))
        .with_exchange_timeout(Some(Duration::from_secs(5)))
}

/// Server that echoes every request stub back.
pub fn echo_script() -> ServerScript {
    ServerScript::new().handler(|_opnum, stub| Ok(stub))
}

/// Deterministic payload of `len` bytes.
pub fn pattern(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<_>>().into()
}
