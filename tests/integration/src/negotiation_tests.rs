//! Negotiation Tests - bind, security tier and version fallback
//!
//! These tests drive full sessions against the scripted server:
//! - interface version fallback on a fresh connection per attempt
//! - one-shot security tier upgrade to the secured scheme
//! - terminal failures and their diagnostics
//! - the machine-name probe

use bytes::Bytes;
use integration_tests::*;
use dcerpc_session::probe::{encode_challenge, ntlm_negotiate_token};
use dcerpc_session::testing::{ConnectBehavior, FakeAuthenticator, ScriptedTransport, ServerScript};
use dcerpc_session::{
    probe_machine_name, AuthFailure, AuthLevel, AuthState, AuthType, ErrorKind, MachineName,
    SessionBuilder, SessionError, SessionState, TargetAddress, NDR_SYNTAX,
};
use futures::future::join_all;

#[tokio::test]
async fn test_version_fallback_binds_next_alternative() {
    init_logging();

    let transport = ScriptedTransport::new(echo_script().supports(DIRECTORY_V1, NDR_SYNTAX));
    let auth = FakeAuthenticator::new();

    let mut session = SessionBuilder::new(directory_descriptor(), alice())
        .transport(transport.clone())
        .authenticator(auth.clone())
        .connect(dc01())
        .await
        .unwrap();

    assert_eq!(session.state(), SessionState::Authenticated);
    assert_eq!(session.bound_interface().unwrap().interface, DIRECTORY_V1);

    // A round trip guarantees the server has consumed the auth3.
    session.request(0, Bytes::from_static(b"ping")).await.unwrap();

    let log = transport.log();
    assert_eq!(log.connects.len(), 2);
    assert_eq!(log.binds.len(), 2);
    assert_eq!(log.binds[0].interface, DIRECTORY_V2);
    assert_eq!(log.binds[1].interface, DIRECTORY_V1);

    // Fresh security context per attempt; nothing from the first leaks.
    assert_eq!(auth.contexts_started(), 2);
    assert_eq!(log.binds[0].token, Bytes::from_static(b"negotiate-1"));
    assert_eq!(log.binds[1].token, Bytes::from_static(b"negotiate-2"));
    assert_eq!(
        log.auth3_tokens,
        vec![Bytes::from_static(b"authenticate-2:challenge")]
    );

    session.close().await;
}

#[tokio::test]
async fn test_no_alternative_accepted() {
    init_logging();

    let other = dcerpc_session::SyntaxId::new(DIRECTORY_UUID, 3, 0);
    let transport = ScriptedTransport::new(echo_script().supports(other, NDR_SYNTAX));

    let err = SessionBuilder::new(directory_descriptor(), alice())
        .transport(transport.clone())
        .authenticator(FakeAuthenticator::new())
        .connect(dc01())
        .await
        .err().unwrap();

    assert!(matches!(
        err,
        SessionError::UnsupportedInterfaceVersion { tried: 2, .. }
    ));
    assert_eq!(transport.log().binds.len(), 2);
}

#[tokio::test]
async fn test_security_tier_upgrade_reconnects_secured() {
    init_logging();

    let transport = ScriptedTransport::new(echo_script().require_secured());
    let auth = FakeAuthenticator::new();

    let mut session = SessionBuilder::new(directory_descriptor(), alice())
        .transport(transport.clone())
        .authenticator(auth.clone())
        .connect(dc01())
        .await
        .unwrap();

    assert_eq!(session.state(), SessionState::Authenticated);
    assert_eq!(session.auth_state(), AuthState::BoundSecured);
    let address = session.address().unwrap();
    assert!(address.is_secured());
    assert_eq!(address.host, dc01().host);
    assert_eq!(address.endpoint, dc01().endpoint);

    let log = transport.log();
    assert_eq!(log.binds.len(), 2);
    assert!(!log.binds[0].address.is_secured());
    assert!(log.binds[1].address.is_secured());
    assert_eq!(auth.contexts_started(), 2);

    let echoed = session.request(1, pattern(64)).await.unwrap();
    assert_eq!(echoed, pattern(64));
    session.close().await;
}

#[tokio::test]
async fn test_second_tier_rejection_is_terminal() {
    init_logging();

    let transport = ScriptedTransport::new(echo_script().require_secured().reject_secured());
    let mut session = SessionBuilder::new(directory_descriptor(), alice())
        .transport(transport.clone())
        .authenticator(FakeAuthenticator::new())
        .build();

    let err = session.establish(dc01()).await.err().unwrap();
    assert!(matches!(
        err,
        SessionError::AuthNegotiationFailed(AuthFailure::SecurityTierExhausted { .. })
    ));
    assert_eq!(
        session.state(),
        SessionState::Failed(ErrorKind::AuthNegotiationFailed)
    );

    // Exactly one upgrade: the plain attempt and the secured one.
    let log = transport.log();
    assert_eq!(log.connects.len(), 2);
    assert_eq!(log.binds.len(), 2);

    session.close().await;
    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
    assert!(matches!(
        session.request(0, Bytes::new()).await,
        Err(SessionError::SessionClosed)
    ));
}

#[tokio::test]
async fn test_anonymous_bind_stays_plaintext() {
    init_logging();

    let transport = ScriptedTransport::new(echo_script());
    let mut session = SessionBuilder::new(directory_descriptor(), alice())
        .transport(transport.clone())
        .connect(dc01())
        .await
        .unwrap();

    assert_eq!(
        session.state(),
        SessionState::Bound {
            level: AuthLevel::None
        }
    );
    assert_eq!(session.auth_state(), AuthState::BoundPlaintext);
    assert_eq!(transport.log().binds[0].auth_type, AuthType::None);
    assert_eq!(transport.attached_credentials(), Some(alice()));
    session.close().await;
}

#[tokio::test]
async fn test_disabled_mechanism_names_alternate_target() {
    init_logging();

    let transport = ScriptedTransport::new(echo_script().mechanism_disabled());
    let err = SessionBuilder::new(directory_descriptor(), alice())
        .transport(transport)
        .authenticator(FakeAuthenticator::new())
        .connect(TargetAddress::tcp("10.0.0.5", 49667))
        .await
        .err().unwrap();

    assert_eq!(err.kind(), ErrorKind::AuthNegotiationFailed);
    let message = err.to_string();
    assert!(message.contains("NTLM"));
    assert!(message.contains("10.0.0.5"));
    assert!(message.contains("NetBIOS name or FQDN"));
}

#[tokio::test]
async fn test_connect_timeout_differs_from_refusal() {
    init_logging();

    let hanging = ScriptedTransport::new(echo_script()).then(ConnectBehavior::Hang);
    let err = SessionBuilder::new(directory_descriptor(), alice())
        .config(fast_config())
        .transport(hanging)
        .connect(dc01())
        .await
        .err().unwrap();
    assert_eq!(err.kind(), ErrorKind::TransportUnreachable);
    assert!(err.is_timeout());
    assert!(err.to_string().contains("NetBIOS name or FQDN"));

    let refusing = ScriptedTransport::new(echo_script()).then(ConnectBehavior::Refuse);
    let err = SessionBuilder::new(directory_descriptor(), alice())
        .config(fast_config())
        .transport(refusing)
        .connect(dc01())
        .await
        .err().unwrap();
    assert_eq!(err.kind(), ErrorKind::TransportUnreachable);
    assert!(!err.is_timeout());
}

#[tokio::test]
async fn test_establish_requires_matching_family() {
    let mut session = SessionBuilder::new(directory_descriptor(), alice())
        .transport(ScriptedTransport::new(echo_script()))
        .build();
    let err = session
        .establish(TargetAddress::pipe("dc01", "lsarpc"))
        .await
        .err().unwrap();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_independent_sessions_in_parallel() {
    init_logging();

    let transport = ScriptedTransport::new(echo_script());
    let tasks = (0..8u8).map(|i| {
        let transport = transport.clone();
        async move {
            let mut session = SessionBuilder::new(directory_descriptor(), alice())
                .transport(transport)
                .authenticator(FakeAuthenticator::new())
                .connect(dc01())
                .await?;
            let payload = Bytes::from(vec![i; 100 + i as usize]);
            let reply = session.request(0, payload.clone()).await;
            session.close().await;
            reply.map(|r| (payload, r))
        }
    });

    for result in join_all(tasks).await {
        let (sent, received) = result.unwrap();
        assert_eq!(sent, received);
    }
    assert_eq!(transport.log().binds.len(), 8);
}

#[tokio::test]
async fn test_probe_reads_machine_name() {
    init_logging();

    let names = MachineName {
        netbios_name: Some("DC01".into()),
        netbios_domain: Some("CORP".into()),
        dns_name: Some("dc01.corp.local".into()),
        dns_domain: Some("corp.local".into()),
    };
    let transport = ScriptedTransport::new(ServerScript::new().challenge(encode_challenge(&names)));

    let probed = probe_machine_name(
        &transport,
        &TargetAddress::tcp("10.0.0.5", 135),
        &fast_config(),
    )
    .await
    .unwrap();
    assert_eq!(probed.canonical(), Some("dc01.corp.local"));

    let log = transport.log();
    assert_eq!(log.binds.len(), 1);
    assert_eq!(log.binds[0].auth_type, AuthType::Ntlm);
    assert_eq!(log.binds[0].token, ntlm_negotiate_token());
    assert!(log.auth3_tokens.is_empty());
}

#[tokio::test]
async fn test_probe_timeout_is_distinct() {
    let transport = ScriptedTransport::new(ServerScript::new()).then(ConnectBehavior::Hang);
    let err = probe_machine_name(
        &transport,
        &TargetAddress::tcp("10.0.0.5", 135),
        &fast_config(),
    )
    .await
    .err().unwrap();
    assert!(err.is_timeout());
}
