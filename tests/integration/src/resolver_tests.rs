//! Resolver Tests - endpoint resolution through the endpoint mapper
//!
//! The mapper side runs the real `ept_map` codec against a scripted
//! endpoint mapper; the service side is a second scripted server.

use integration_tests::*;
use dcerpc_session::epm::{
    decode_map_request, encode_map_response, opnum, pipe_tower, tcp_tower, EPT_S_NOT_REGISTERED,
};
use dcerpc_session::testing::{FakeAuthenticator, ScriptedTransport, ServerScript};
use dcerpc_session::{
    AuthType, EndpointResolver, EpmMapper, ErrorKind, InterfaceAlternative, ServiceDescriptor,
    SessionBuilder, SessionError, SessionState, TargetAddress, TransportFamily, EPM_INTERFACE,
    EPM_PORT, NDR_SYNTAX,
};

/// Endpoint mapper that knows one TCP and one pipe registration of v1.
fn epm_script() -> ServerScript {
    let v1 = InterfaceAlternative::ndr(DIRECTORY_V1);
    ServerScript::new()
        .supports(EPM_INTERFACE, NDR_SYNTAX)
        .handler(move |op, stub| {
            if op != opnum::EPT_MAP {
                return Err(dcerpc_session::pdu::status::NCA_S_OP_RNG_ERROR);
            }
            let query = decode_map_request(&stub).map_err(|_| 0x1c01_000b_u32)?;
            if query.interface() != Some(DIRECTORY_V1) {
                return Ok(encode_map_response(&[], EPT_S_NOT_REGISTERED));
            }
            Ok(encode_map_response(
                &[
                    pipe_tower(&v1, "directory", "DC01"),
                    tcp_tower(&v1, 49668, [0, 0, 0, 0]),
                ],
                0,
            ))
        })
}

#[tokio::test]
async fn test_resolves_first_registered_alternative() {
    init_logging();

    let epm = ScriptedTransport::new(epm_script());
    let mut resolver = EndpointResolver::new("dc01.corp.local", EpmMapper::new(epm.clone()));
    let address = resolver.resolve(&directory_descriptor()).await.unwrap();

    // Unspecified address in the tower means "the host you asked".
    assert_eq!(address, TargetAddress::tcp("dc01.corp.local", 49668));

    // One anonymous endpoint mapper session per alternative.
    let log = epm.log();
    assert_eq!(log.connects.len(), 2);
    assert!(log
        .connects
        .iter()
        .all(|a| *a == TargetAddress::tcp("dc01.corp.local", EPM_PORT)));
    assert!(log.binds.iter().all(|b| b.auth_type == AuthType::None));
    assert_eq!(log.requests.len(), 2);
}

#[tokio::test]
async fn test_pipe_family_uses_pipe_tower() {
    let descriptor = ServiceDescriptor::builder(TransportFamily::NamedPipe)
        .alternative(DIRECTORY_V1, NDR_SYNTAX)
        .build()
        .unwrap();
    let epm = ScriptedTransport::new(epm_script());
    let address = EndpointResolver::new("10.0.0.5", EpmMapper::new(epm))
        .resolve(&descriptor)
        .await
        .unwrap();
    assert_eq!(address, TargetAddress::pipe("DC01", "directory"));
}

#[tokio::test]
async fn test_explicit_endpoint_never_contacts_mapper() {
    let descriptor = ServiceDescriptor::builder(TransportFamily::Tcp)
        .alternative(DIRECTORY_V1, NDR_SYNTAX)
        .explicit_endpoint("ncacn_ip_tcp:[49700]")
        .unwrap()
        .build()
        .unwrap();
    let epm = ScriptedTransport::new(epm_script());
    let address = EndpointResolver::new("dc01", EpmMapper::new(epm.clone()))
        .resolve(&descriptor)
        .await
        .unwrap();

    assert_eq!(address, TargetAddress::tcp("dc01", 49700));
    assert!(epm.log().connects.is_empty());
}

#[tokio::test]
async fn test_unregistered_interface_is_unavailable() {
    let descriptor = ServiceDescriptor::builder(TransportFamily::Tcp)
        .alternative(DIRECTORY_V2, NDR_SYNTAX)
        .build()
        .unwrap();
    let err = EndpointResolver::new("dc01", EpmMapper::new(ScriptedTransport::new(epm_script())))
        .resolve(&descriptor)
        .await
        .unwrap_err();

    assert_eq!(err.kind(), ErrorKind::EndpointUnavailable);
    assert!(err.to_string().contains(&DIRECTORY_UUID.to_string()));
}

#[tokio::test]
async fn test_mapper_fault_surfaces() {
    let script = ServerScript::new().handler(|_, _| Err(0x0000_0005));
    let err = EndpointResolver::new("dc01", EpmMapper::new(ScriptedTransport::new(script)))
        .resolve(&directory_descriptor())
        .await
        .unwrap_err();
    assert!(matches!(err, SessionError::RemoteFault { status: 5 }));
}

#[tokio::test]
async fn test_resolve_then_connect() {
    init_logging();

    let epm = ScriptedTransport::new(epm_script());
    let service = ScriptedTransport::new(echo_script().supports(DIRECTORY_V1, NDR_SYNTAX));

    let descriptor = directory_descriptor();
    let address = EndpointResolver::new("dc01.corp.local", EpmMapper::new(epm))
        .resolve(&descriptor)
        .await
        .unwrap();

    let mut session = SessionBuilder::new(descriptor, alice())
        .transport(service.clone())
        .authenticator(FakeAuthenticator::new())
        .connect(address)
        .await
        .unwrap();
    assert_eq!(session.state(), SessionState::Authenticated);
    assert_eq!(
        service.log().connects[0],
        TargetAddress::tcp("dc01.corp.local", 49668)
    );
    session.close().await;
}
