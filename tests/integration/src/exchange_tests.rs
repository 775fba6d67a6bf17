//! Exchange Tests - requests, faults, timeouts and paged queries
//!
//! These tests exercise an established session:
//! - fragmented requests and responses
//! - remote faults that leave the session usable
//! - exchange timeouts that fail it
//! - paged queries with per-item error isolation, using the endpoint
//!   mapper lookup codec as the page format

use bytes::Bytes;
use integration_tests::*;
use dcerpc_session::epm::{
    decode_lookup_request, encode_lookup_response, tcp_tower, RawEntry, CONTEXT_HANDLE_SIZE,
    EPT_S_NOT_REGISTERED,
};
use dcerpc_session::testing::{FakeAuthenticator, ScriptedTransport, ServerScript};
use dcerpc_session::{
    ChannelError, EpmLookupCodec, ErrorKind, InterfaceAlternative, ItemDecodeError, PagedQuery,
    Session, SessionBuilder, SessionError, SessionState, Uuid,
};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;

const EPT_LOOKUP: u16 = dcerpc_session::epm::opnum::EPT_LOOKUP;

async fn connect(script: ServerScript) -> (Session, ScriptedTransport) {
    let transport = ScriptedTransport::new(script);
    let session = SessionBuilder::new(directory_descriptor(), alice())
        .config(fast_config())
        .transport(transport.clone())
        .authenticator(FakeAuthenticator::new())
        .connect(dc01())
        .await
        .unwrap();
    (session, transport)
}

fn entry(annotation: &str, port: u16) -> RawEntry {
    let tower = tcp_tower(&InterfaceAlternative::ndr(DIRECTORY_V1), port, [10, 0, 0, 5]);
    RawEntry {
        object: Uuid::NIL,
        tower: Some(tower.encode()),
        annotation: annotation.into(),
    }
}

fn corrupt_entry(annotation: &str) -> RawEntry {
    RawEntry {
        object: Uuid::NIL,
        tower: Some(Bytes::from_static(&[5, 0, 19, 0, 0x0d])),
        annotation: annotation.into(),
    }
}

/// Two-page endpoint map; the first page carries a corrupt tower.
/// Records every entry handle the client sends.
fn two_page_lookup(handles: Arc<Mutex<Vec<[u8; CONTEXT_HANDLE_SIZE]>>>) -> ServerScript {
    let continuation = [0x42u8; CONTEXT_HANDLE_SIZE];
    ServerScript::new().handler(move |opnum, stub| {
        if opnum != EPT_LOOKUP {
            return Err(dcerpc_session::pdu::status::NCA_S_OP_RNG_ERROR);
        }
        let request = decode_lookup_request(&stub).map_err(|_| 0x1c01_000b_u32)?;
        handles.lock().push(request.handle);
        if request.handle == [0u8; CONTEXT_HANDLE_SIZE] {
            Ok(encode_lookup_response(
                &continuation,
                &[entry("A", 49664), corrupt_entry("B"), entry("C", 49665)],
                0,
            ))
        } else if request.handle == continuation {
            Ok(encode_lookup_response(
                &[0u8; CONTEXT_HANDLE_SIZE],
                &[entry("D", 49666)],
                EPT_S_NOT_REGISTERED,
            ))
        } else {
            Err(0x1c01_000b)
        }
    })
}

#[tokio::test]
async fn test_large_request_and_response_fragment() {
    init_logging();

    let (mut session, transport) = connect(echo_script().max_frag(1024)).await;
    let payload = pattern(10_000);
    let reply = session.request(0, payload.clone()).await.unwrap();
    assert_eq!(reply, payload);

    let log = transport.log();
    assert_eq!(log.requests, vec![(0, 10_000)]);
    assert!(log.request_fragments.values().all(|&n| n > 1));
    session.close().await;
}

#[tokio::test]
async fn test_remote_fault_keeps_session_usable() {
    init_logging();

    let script = ServerScript::new().handler(|opnum, stub| match opnum {
        9 => Err(0x0000_0005),
        _ => Ok(stub),
    });
    let (mut session, _transport) = connect(script).await;

    let err = session.request(9, Bytes::new()).await.unwrap_err();
    assert!(matches!(err, SessionError::RemoteFault { status: 5 }));
    assert!(!err.is_fatal());
    assert_eq!(session.state(), SessionState::Authenticated);

    let reply = session.request(1, Bytes::from_static(b"still here")).await.unwrap();
    assert_eq!(reply, Bytes::from_static(b"still here"));
    session.close().await;
}

#[tokio::test]
async fn test_exchange_timeout_fails_session() {
    init_logging();

    let transport = ScriptedTransport::new(echo_script().response_delay(Duration::from_millis(500)));
    let mut session = SessionBuilder::new(directory_descriptor(), alice())
        .config(fast_config().with_exchange_timeout(Some(Duration::from_millis(50))))
        .transport(transport)
        .authenticator(FakeAuthenticator::new())
        .connect(dc01())
        .await
        .unwrap();

    let err = session.request(0, pattern(16)).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChannelError);
    assert!(err.is_timeout());
    assert_eq!(session.state(), SessionState::Failed(ErrorKind::ChannelError));

    assert!(matches!(
        session.request(0, pattern(16)).await,
        Err(SessionError::SessionFailed(ErrorKind::ChannelError))
    ));

    session.close().await;
    session.close().await;
    assert_eq!(session.state(), SessionState::Closed);
}

#[tokio::test]
async fn test_exchange_timeout_covers_every_fragment() {
    init_logging();

    // Each gap is well inside the limit; the whole response is not.
    let script = echo_script()
        .max_frag(1024)
        .fragment_delay(Duration::from_millis(40));
    let transport = ScriptedTransport::new(script);
    let mut session = SessionBuilder::new(directory_descriptor(), alice())
        .config(fast_config().with_exchange_timeout(Some(Duration::from_millis(150))))
        .transport(transport)
        .authenticator(FakeAuthenticator::new())
        .connect(dc01())
        .await
        .unwrap();

    let started = std::time::Instant::now();
    let err = session.request(0, pattern(10_000)).await.unwrap_err();
    assert!(err.is_timeout());
    assert!(started.elapsed() < Duration::from_millis(300));
    assert_eq!(session.state(), SessionState::Failed(ErrorKind::ChannelError));
    session.close().await;
}

#[tokio::test]
async fn test_oversized_response_fails_session() {
    let transport = ScriptedTransport::new(echo_script().max_frag(1024));
    let mut session = SessionBuilder::new(directory_descriptor(), alice())
        .config(fast_config().with_max_stub_size(4096))
        .transport(transport)
        .authenticator(FakeAuthenticator::new())
        .connect(dc01())
        .await
        .unwrap();

    let err = session.request(0, pattern(10_000)).await.unwrap_err();
    assert!(matches!(
        err,
        SessionError::Channel(ChannelError::Fragment(_))
    ));
    assert_eq!(session.state(), SessionState::Failed(ErrorKind::ChannelError));
}

#[tokio::test]
async fn test_request_before_establish_is_rejected() {
    let mut session = SessionBuilder::new(directory_descriptor(), alice())
        .transport(ScriptedTransport::new(echo_script()))
        .build();
    let err = session.request(0, Bytes::new()).await.unwrap_err();
    assert_eq!(err.kind(), ErrorKind::InvalidInput);
    assert_eq!(session.state(), SessionState::Idle);
}

#[tokio::test]
async fn test_paged_query_skips_bad_items_and_continues() {
    init_logging();

    let handles = Arc::new(Mutex::new(Vec::new()));
    let (mut session, _transport) = connect(two_page_lookup(handles.clone())).await;

    let mut seen = Vec::new();
    let summary = session
        .paged_query(&EpmLookupCodec, &PagedQuery::new("", 3), |entry| {
            seen.push(entry.annotation);
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(seen, vec!["A", "C", "D"]);
    assert_eq!(summary.pages, 2);
    assert_eq!(summary.delivered, 3);
    assert_eq!(summary.skipped, 1);
    assert_eq!(session.state(), SessionState::Authenticated);

    // The continuation goes back exactly as the server produced it.
    let handles = handles.lock();
    assert_eq!(handles.len(), 2);
    assert_eq!(handles[0], [0u8; CONTEXT_HANDLE_SIZE]);
    assert_eq!(handles[1], [0x42u8; CONTEXT_HANDLE_SIZE]);
}

#[tokio::test]
async fn test_callback_rejection_is_skipped() {
    let (mut session, _transport) = connect(two_page_lookup(Arc::default())).await;

    let mut seen = Vec::new();
    let summary = session
        .paged_query(&EpmLookupCodec, &PagedQuery::new("", 3), |entry| {
            if entry.annotation == "C" {
                return Err(ItemDecodeError::new("unwanted"));
            }
            seen.push(entry.annotation);
            Ok(())
        })
        .await
        .unwrap();

    assert_eq!(seen, vec!["A", "D"]);
    assert_eq!(summary.skipped, 2);
}

#[tokio::test]
async fn test_paged_query_is_repeatable() {
    let (mut session, _transport) = connect(two_page_lookup(Arc::default())).await;

    let mut runs = Vec::new();
    for _ in 0..2 {
        let mut bindings = Vec::new();
        let summary = session
            .paged_query(&EpmLookupCodec, &PagedQuery::new("", 3), |entry| {
                bindings.push(entry.binding());
                Ok(())
            })
            .await
            .unwrap();
        runs.push((bindings, summary));
    }
    assert_eq!(runs[0], runs[1]);
    assert_eq!(runs[0].0.len(), 3);
    assert_eq!(runs[0].1.pages, 2);
}

#[tokio::test]
async fn test_malformed_page_aborts_query() {
    let script = ServerScript::new().handler(|_, _| Ok(Bytes::from_static(b"short")));
    let (mut session, _transport) = connect(script).await;

    let err = session
        .paged_query(&EpmLookupCodec, &PagedQuery::new("", 10), |_| Ok(()))
        .await
        .unwrap_err();
    assert_eq!(err.kind(), ErrorKind::ChannelError);
    assert!(matches!(session.state(), SessionState::Failed(_)));
}
