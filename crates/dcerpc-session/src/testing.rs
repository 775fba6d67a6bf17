//! Scripted in-process DCE/RPC server
//!
//! [`ScriptedTransport`] hands out channels backed by `tokio::io::duplex`,
//! each served by a task that follows a [`ServerScript`]. Everything the
//! server sees is recorded in a shared [`ServerLog`].

use crate::credentials::Credentials;
use crate::error::{Result, SessionError};
use crate::fragmentation::{max_stub_size, split_stub, FragmentAssembler};
use crate::framing::{PduFramer, DEFAULT_MAX_PDU_SIZE};
use crate::pdu::{
    provider_reason, reject_reason, status, BindAckPdu, BindNakPdu, BindPdu, BindResult,
    FaultPdu, Pdu, RequestPdu, ResponsePdu, SyntaxId, DEFAULT_MAX_FRAG,
};
use crate::security::{AuthLevel, AuthType, AuthVerifier, Authenticator, SecurityContext};
use crate::transport::{connect_within, Channel, StreamChannel, TargetAddress, Transport, TransportFamily};
use async_trait::async_trait;
use bytes::Bytes;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::DuplexStream;
use tracing::trace;

/// Routes `tracing` output to the test harness; `RUST_LOG` picks levels.
#[cfg(test)]
pub(crate) fn init_test_logging() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

/// Request handler: opnum and stub in, response stub or fault status out.
pub type Handler = Arc<dyn Fn(u16, Bytes) -> std::result::Result<Bytes, u32> + Send + Sync>;

/// How the server behaves. Shared by every connection of a transport.
#[derive(Clone)]
pub struct ServerScript {
    /// Accepted (interface, transfer syntax) pairs; empty accepts all.
    pub supported: Vec<(SyntaxId, SyntaxId)>,
    /// Authenticated binds on the plain scheme get an authn-level fault.
    pub require_secured: bool,
    /// Authenticated binds on the secured scheme get the same fault.
    pub reject_secured: bool,
    /// Authenticated binds get `bind_nak` (authentication type not recognized).
    pub mechanism_disabled: bool,
    /// Token returned in the `bind_ack` verifier.
    pub challenge: Bytes,
    pub handler: Option<Handler>,
    pub response_delay: Option<Duration>,
    /// Pause between the fragments of one response.
    pub fragment_delay: Option<Duration>,
    pub max_frag: u16,
}

impl Default for ServerScript {
    fn default() -> Self {
        Self {
            supported: Vec::new(),
            require_secured: false,
            reject_secured: false,
            mechanism_disabled: false,
            challenge: Bytes::from_static(b"challenge"),
            handler: None,
            response_delay: None,
            fragment_delay: None,
            max_frag: DEFAULT_MAX_FRAG,
        }
    }
}

impl ServerScript {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn supports(mut self, interface: SyntaxId, transfer_syntax: SyntaxId) -> Self {
        self.supported.push((interface, transfer_syntax));
        self
    }

    pub fn require_secured(mut self) -> Self {
        self.require_secured = true;
        self
    }

    pub fn reject_secured(mut self) -> Self {
        self.reject_secured = true;
        self
    }

    pub fn mechanism_disabled(mut self) -> Self {
        self.mechanism_disabled = true;
        self
    }

    pub fn challenge(mut self, token: Bytes) -> Self {
        self.challenge = token;
        self
    }

    pub fn handler<F>(mut self, handler: F) -> Self
    where
        F: Fn(u16, Bytes) -> std::result::Result<Bytes, u32> + Send + Sync + 'static,
    {
        self.handler = Some(Arc::new(handler));
        self
    }

    pub fn response_delay(mut self, delay: Duration) -> Self {
        self.response_delay = Some(delay);
        self
    }

    pub fn fragment_delay(mut self, delay: Duration) -> Self {
        self.fragment_delay = Some(delay);
        self
    }

    pub fn max_frag(mut self, max_frag: u16) -> Self {
        self.max_frag = max_frag;
        self
    }

    fn accepts(&self, interface: SyntaxId, transfer_syntax: SyntaxId) -> bool {
        self.supported.is_empty() || self.supported.contains(&(interface, transfer_syntax))
    }
}

/// One bind the server received
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BindAttempt {
    pub address: TargetAddress,
    pub interface: SyntaxId,
    pub transfer_syntax: SyntaxId,
    pub auth_type: AuthType,
    pub auth_level: AuthLevel,
    pub token: Bytes,
}

#[derive(Debug, Clone, Default)]
pub struct ServerLog {
    pub connects: Vec<TargetAddress>,
    pub binds: Vec<BindAttempt>,
    pub auth3_tokens: Vec<Bytes>,
    /// (opnum, reassembled stub length) per request
    pub requests: Vec<(u16, usize)>,
    /// Request PDUs per call, including fragments
    pub request_fragments: HashMap<u32, usize>,
}

/// What happens on a connect attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectBehavior {
    Serve,
    /// Never completes; the caller's connect timeout fires.
    Hang,
    Refuse,
}

/// In-memory [`Transport`] whose channels are served by a [`ServerScript`]
#[derive(Clone)]
pub struct ScriptedTransport {
    family: TransportFamily,
    script: Arc<ServerScript>,
    plan: Arc<Mutex<VecDeque<ConnectBehavior>>>,
    log: Arc<Mutex<ServerLog>>,
    credentials: Arc<Mutex<Option<Credentials>>>,
}

impl ScriptedTransport {
    pub fn new(script: ServerScript) -> Self {
        Self::with_family(TransportFamily::Tcp, script)
    }

    pub fn with_family(family: TransportFamily, script: ServerScript) -> Self {
        Self {
            family,
            script: Arc::new(script),
            plan: Arc::new(Mutex::new(VecDeque::new())),
            log: Arc::new(Mutex::new(ServerLog::default())),
            credentials: Arc::new(Mutex::new(None)),
        }
    }

    /// Queues behaviours for the next connects; afterwards every connect
    /// is served.
    pub fn then(self, behavior: ConnectBehavior) -> Self {
        self.plan.lock().push_back(behavior);
        self
    }

    pub fn log(&self) -> ServerLog {
        self.log.lock().clone()
    }

    pub fn attached_credentials(&self) -> Option<Credentials> {
        self.credentials.lock().clone()
    }
}

#[async_trait]
impl Transport for ScriptedTransport {
    fn family(&self) -> TransportFamily {
        self.family
    }

    fn attach_credentials(&mut self, credentials: &Credentials) {
        *self.credentials.lock() = Some(credentials.clone());
    }

    async fn connect(&self, address: &TargetAddress, timeout: Duration) -> Result<Box<dyn Channel>> {
        self.log.lock().connects.push(address.clone());
        let behavior = self.plan.lock().pop_front().unwrap_or(ConnectBehavior::Serve);
        match behavior {
            ConnectBehavior::Hang => connect_within(address, timeout, std::future::pending()).await,
            ConnectBehavior::Refuse => Err(SessionError::unreachable(
                address,
                std::io::Error::from(std::io::ErrorKind::ConnectionRefused),
            )),
            ConnectBehavior::Serve => {
                let (client, server) = tokio::io::duplex(DEFAULT_MAX_PDU_SIZE);
                let server = FakeServer {
                    address: address.clone(),
                    script: self.script.clone(),
                    log: self.log.clone(),
                    framer: PduFramer::new(server),
                    bound_verifier: None,
                };
                tokio::spawn(server.run());
                Ok(Box::new(StreamChannel::new(client, DEFAULT_MAX_PDU_SIZE)))
            }
        }
    }
}

struct FakeServer {
    address: TargetAddress,
    script: Arc<ServerScript>,
    log: Arc<Mutex<ServerLog>>,
    framer: PduFramer<DuplexStream>,
    /// Verifier of the accepted bind, echoed on protected responses.
    bound_verifier: Option<AuthVerifier>,
}

impl FakeServer {
    async fn run(mut self) {
        let mut assemblers: HashMap<u32, (FragmentAssembler, u16)> = HashMap::new();
        while let Ok(data) = self.framer.read_pdu().await {
            let reply = match Pdu::decode(&data) {
                Ok(Pdu::Bind(bind)) => vec![self.on_bind(bind)],
                Ok(Pdu::Auth3(auth3)) => {
                    self.log.lock().auth3_tokens.push(auth3.auth_verifier.auth_value);
                    Vec::new()
                }
                Ok(Pdu::Request(request)) => self.on_request(&mut assemblers, request).await,
                Ok(other) => {
                    trace!("scripted server ignoring {:?}", other.header().packet_type);
                    Vec::new()
                }
                Err(_) => break,
            };
            for (index, pdu) in reply.into_iter().enumerate() {
                if let (true, Some(delay)) = (index > 0, self.script.fragment_delay) {
                    tokio::time::sleep(delay).await;
                }
                if self.framer.write_pdu(&pdu).await.is_err() {
                    return;
                }
            }
        }
    }

    fn on_bind(&mut self, bind: BindPdu) -> Bytes {
        let call_id = bind.header.call_id;
        let Some(context) = bind.context_list.first() else {
            return BindNakPdu::new(call_id, reject_reason::NOT_SPECIFIED).encode();
        };
        let transfer_syntax = context
            .transfer_syntaxes
            .first()
            .copied()
            .unwrap_or(crate::pdu::NDR_SYNTAX);
        let verifier = bind.auth_verifier.clone();
        self.log.lock().binds.push(BindAttempt {
            address: self.address.clone(),
            interface: context.abstract_syntax,
            transfer_syntax,
            auth_type: verifier.as_ref().map_or(AuthType::None, |v| v.auth_type),
            auth_level: verifier.as_ref().map_or(AuthLevel::None, |v| v.auth_level),
            token: verifier.as_ref().map(|v| v.auth_value.clone()).unwrap_or_default(),
        });

        if let Some(verifier) = &verifier {
            if self.script.mechanism_disabled {
                return BindNakPdu::new(call_id, reject_reason::AUTHENTICATION_TYPE_NOT_RECOGNIZED)
                    .encode();
            }
            let secured = self.address.is_secured();
            if (self.script.require_secured && !secured) || (self.script.reject_secured && secured) {
                return FaultPdu::new(call_id, status::RPC_S_UNSUPPORTED_AUTHN_LEVEL).encode();
            }
            self.bound_verifier = Some(verifier.clone());
        }

        if !self.script.accepts(context.abstract_syntax, transfer_syntax) {
            let ack = BindAckPdu::new(
                call_id,
                vec![BindResult::rejected(provider_reason::ABSTRACT_SYNTAX_NOT_SUPPORTED)],
            );
            return ack.encode();
        }

        let mut ack = BindAckPdu::new(call_id, vec![BindResult::accepted(transfer_syntax)]);
        ack.max_xmit_frag = self.script.max_frag;
        ack.max_recv_frag = self.script.max_frag;
        ack.auth_verifier = verifier.map(|v| {
            AuthVerifier::new(
                v.auth_type,
                v.auth_level,
                v.auth_context_id,
                self.script.challenge.clone(),
            )
        });
        ack.encode()
    }

    async fn on_request(
        &mut self,
        assemblers: &mut HashMap<u32, (FragmentAssembler, u16)>,
        request: RequestPdu,
    ) -> Vec<Bytes> {
        let call_id = request.header.call_id;
        *self.log.lock().request_fragments.entry(call_id).or_default() += 1;
        let (assembler, opnum) = assemblers
            .entry(call_id)
            .or_insert_with(|| (FragmentAssembler::new(call_id), request.opnum));
        let opnum = *opnum;
        let stub = match assembler.add_fragment(&request.header, &request.stub_data, request.alloc_hint) {
            Ok(Some(stub)) => stub,
            Ok(None) => return Vec::new(),
            Err(_) => {
                assemblers.remove(&call_id);
                return vec![FaultPdu::new(call_id, status::NCA_S_PROTO_ERROR).encode()];
            }
        };
        assemblers.remove(&call_id);
        self.log.lock().requests.push((opnum, stub.len()));

        if let Some(delay) = self.script.response_delay {
            tokio::time::sleep(delay).await;
        }

        let result = match &self.script.handler {
            Some(handler) => handler(opnum, stub),
            None => Err(status::NCA_S_OP_RNG_ERROR),
        };
        let response = match result {
            Ok(response) => response,
            Err(status) => return vec![FaultPdu::new(call_id, status).encode()],
        };

        let protected = request.auth_verifier.is_some();
        let signature_size = if protected { FakeContext::SIGNATURE.len() } else { 0 };
        split_stub(&response, max_stub_size(self.script.max_frag, signature_size))
            .into_iter()
            .map(|(chunk, flags)| {
                let mut pdu = ResponsePdu::new(call_id, chunk);
                pdu.alloc_hint = response.len() as u32;
                pdu.header.packet_flags = flags;
                if protected {
                    pdu.auth_verifier = self.bound_verifier.as_ref().map(|v| {
                        AuthVerifier::new(
                            v.auth_type,
                            v.auth_level,
                            v.auth_context_id,
                            Bytes::from_static(&FakeContext::SIGNATURE),
                        )
                    });
                }
                pdu.encode()
            })
            .collect()
    }
}

/// NTLM-shaped authenticator with a two-leg token exchange and identity
/// message protection.
#[derive(Debug, Default)]
pub struct FakeAuthenticator {
    started: AtomicUsize,
}

impl FakeAuthenticator {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Security contexts started so far, one per bind attempt.
    pub fn contexts_started(&self) -> usize {
        self.started.load(Ordering::SeqCst)
    }
}

impl Authenticator for FakeAuthenticator {
    fn auth_type(&self) -> AuthType {
        AuthType::Ntlm
    }

    fn start(&self, _: &Credentials, _: &TargetAddress) -> Result<Box<dyn SecurityContext>> {
        let generation = self.started.fetch_add(1, Ordering::SeqCst) + 1;
        Ok(Box::new(FakeContext {
            generation,
            established: false,
        }))
    }
}

struct FakeContext {
    generation: usize,
    established: bool,
}

impl FakeContext {
    const SIGNATURE: [u8; 16] = [0x01, 0, 0, 0, 0xaa, 0xaa, 0xaa, 0xaa, 0, 0, 0, 0, 0, 0, 0, 0];
}

impl SecurityContext for FakeContext {
    fn initial_token(&mut self) -> Result<Bytes> {
        Ok(Bytes::from(format!("negotiate-{}", self.generation)))
    }

    fn continue_token(&mut self, server_token: &[u8]) -> Result<Option<Bytes>> {
        self.established = true;
        let mut token = format!("authenticate-{}:", self.generation).into_bytes();
        token.extend_from_slice(server_token);
        Ok(Some(Bytes::from(token)))
    }

    fn is_established(&self) -> bool {
        self.established
    }

    fn signature_size(&self) -> usize {
        Self::SIGNATURE.len()
    }

    fn wrap(&mut self, _level: AuthLevel, stub: Bytes) -> Result<(Bytes, Bytes)> {
        Ok((stub, Bytes::from_static(&Self::SIGNATURE)))
    }
}
