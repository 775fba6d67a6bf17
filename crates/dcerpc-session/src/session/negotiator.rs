//! Connect, bind and security negotiation with bounded fallback
//!
//! Two kinds of rejection are recovered here instead of surfacing:
//!
//! - a security-tier rejection flips the address to its secured scheme and
//!   retries once on a fresh connection;
//! - an unsupported interface version or transfer syntax moves on to the
//!   next alternative of the descriptor, again on a fresh connection.
//!
//! Every attempt starts a new security context, so tokens minted for one
//! channel never travel on another.

use super::{Negotiated, Session, SessionState, AUTH_CONTEXT_ID, PRESENTATION_CONTEXT_ID};
use crate::descriptor::InterfaceAlternative;
use crate::error::{AuthFailure, ChannelError, Result, SessionError};
use crate::pdu::{
    provider_reason, reject_reason, status, Auth3Pdu, BindAckPdu, BindPdu, ContextElement,
    ContextResult, Pdu,
};
use crate::security::{AuthLevel, AuthType, AuthVerifier};
use crate::transport::TargetAddress;
use bytes::Bytes;
use std::future::Future;
use std::time::Duration;
use tracing::{debug, info, warn};

/// Maps a bind reply to an accepted `bind_ack` or to the structured
/// rejection it signals.
pub(crate) fn classify_bind_reply(
    reply: Pdu,
    address: &TargetAddress,
    mechanism: AuthType,
) -> Result<BindAckPdu> {
    let mechanism_disabled = |status: u32| -> SessionError {
        AuthFailure::MechanismDisabled {
            mechanism: mechanism.to_string(),
            host: address.host.clone(),
            status,
        }
        .into()
    };

    match reply {
        Pdu::BindAck(ack) => {
            let Some(result) = ack.results.first() else {
                return Err(SessionError::rejected(address, "bind_ack carried no context results"));
            };
            match (result.result, result.reason) {
                (ContextResult::Acceptance, _) => Ok(ack),
                (
                    ContextResult::ProviderRejection,
                    provider_reason::ABSTRACT_SYNTAX_NOT_SUPPORTED
                    | provider_reason::PROPOSED_TRANSFER_SYNTAXES_NOT_SUPPORTED,
                ) => Err(SessionError::UnsupportedInterfaceVersion {
                    address: address.to_string(),
                    tried: 1,
                }),
                (_, reason) => Err(AuthFailure::Rejected {
                    status: reason as u32,
                }
                .into()),
            }
        }
        Pdu::BindNak(nak) => match nak.reject_reason {
            reject_reason::AUTHENTICATION_TYPE_NOT_RECOGNIZED => {
                Err(mechanism_disabled(nak.reject_reason as u32))
            }
            reject_reason::PROTOCOL_VERSION_NOT_SUPPORTED => Err(SessionError::rejected(
                address,
                "protocol version not supported",
            )),
            reason => Err(AuthFailure::Rejected {
                status: reason as u32,
            }
            .into()),
        },
        Pdu::Fault(fault) => match fault.status {
            status::RPC_S_UNSUPPORTED_AUTHN_LEVEL => Err(SessionError::SecurityTierRejected {
                status: fault.status,
            }),
            status::RPC_S_UNKNOWN_AUTHN_SERVICE | status::STATUS_NOT_SUPPORTED => {
                Err(mechanism_disabled(fault.status))
            }
            status::NCA_S_UNK_IF => Err(SessionError::UnsupportedInterfaceVersion {
                address: address.to_string(),
                tried: 1,
            }),
            other => Err(AuthFailure::Rejected { status: other }.into()),
        },
        other => Err(SessionError::rejected(
            address,
            format!("unexpected {:?} reply to bind", other.header().packet_type),
        )),
    }
}

impl Session {
    /// Connects and binds the session at `address`.
    ///
    /// On success the state is `Bound` (anonymous) or `Authenticated`. On
    /// failure the state is `Failed(kind)` and the channel is released.
    pub async fn establish(&mut self, address: TargetAddress) -> Result<()> {
        match self.state {
            SessionState::Idle => {}
            SessionState::Closed => return Err(SessionError::SessionClosed),
            SessionState::Failed(kind) => return Err(SessionError::SessionFailed(kind)),
            _ => {
                return Err(SessionError::InvalidInput(
                    "session is already established".into(),
                ))
            }
        }
        if address.family() != self.descriptor.family() {
            return Err(SessionError::InvalidInput(format!(
                "{} does not match the service's {} transport",
                address,
                self.descriptor.family()
            )));
        }

        self.transport.attach_credentials(&self.credentials);
        match self.negotiate(address).await {
            Ok(()) => Ok(()),
            Err(err) => {
                self.release_channel().await;
                Err(self.fail(err))
            }
        }
    }

    async fn negotiate(&mut self, mut address: TargetAddress) -> Result<()> {
        let mut upgraded = false;
        loop {
            match self.bind_alternatives(&address).await {
                Err(SessionError::SecurityTierRejected { status }) => {
                    self.release_channel().await;
                    self.state = SessionState::Idle;
                    if upgraded || address.is_secured() {
                        return Err(AuthFailure::SecurityTierExhausted {
                            address: address.to_string(),
                            status,
                        }
                        .into());
                    }
                    warn!(
                        "{} requires a higher security tier (status 0x{:08x}), retrying on the secured scheme",
                        address, status
                    );
                    upgraded = true;
                    address = address.secured();
                }
                result => return result,
            }
        }
    }

    async fn bind_alternatives(&mut self, address: &TargetAddress) -> Result<()> {
        let alternatives = self.descriptor.alternatives().to_vec();
        for alternative in &alternatives {
            match self.bind_once(address, alternative).await {
                Err(SessionError::UnsupportedInterfaceVersion { .. }) => {
                    debug!("{} rejected {}, trying next alternative", address, alternative);
                    self.release_channel().await;
                    self.state = SessionState::Idle;
                }
                result => return result,
            }
        }
        Err(SessionError::UnsupportedInterfaceVersion {
            address: address.to_string(),
            tried: alternatives.len(),
        })
    }

    fn effective_level(&self) -> AuthLevel {
        if self.authenticator.auth_type() == AuthType::None {
            AuthLevel::None
        } else {
            self.config.auth_level
        }
    }

    /// One connection, one bind, one credential exchange.
    async fn bind_once(
        &mut self,
        address: &TargetAddress,
        alternative: &InterfaceAlternative,
    ) -> Result<()> {
        let channel = self
            .transport
            .connect(address, self.config.connect_timeout)
            .await?;
        self.channel = Some(channel);
        self.address = Some(address.clone());
        self.state = SessionState::Connected;
        debug!("connected to {}", address);

        let level = self.effective_level();
        let auth_type = self.authenticator.auth_type();
        let call_id = self.next_call_id();

        let mut bind = BindPdu::new(
            call_id,
            ContextElement::new(
                PRESENTATION_CONTEXT_ID,
                alternative.interface,
                alternative.transfer_syntax,
            ),
        );
        bind.max_xmit_frag = self.config.max_xmit_frag;
        bind.max_recv_frag = self.config.max_recv_frag;

        let mut security = None;
        if level != AuthLevel::None {
            let mut context = self.authenticator.start(&self.credentials, address)?;
            let token = context.initial_token()?;
            bind = bind.with_auth(AuthVerifier::new(auth_type, level, AUTH_CONTEXT_ID, token));
            security = Some(context);
        }

        debug!(
            "sending bind: call_id={}, {}, auth_type={}, level={:?}",
            call_id, alternative, auth_type, level
        );
        let limit = self.config.exchange_timeout;
        let reply = within_exchange_timeout(limit, async {
            self.send(bind.encode()).await?;
            self.receive_bind_reply(address).await
        })
        .await?;
        let ack = classify_bind_reply(reply, address, auth_type)?;
        if ack.header.call_id != call_id {
            return Err(ChannelError::CallIdMismatch {
                expected: call_id,
                got: ack.header.call_id,
            }
            .into());
        }

        self.negotiated = Negotiated {
            max_xmit_frag: negotiate_frag(self.config.max_xmit_frag, ack.max_recv_frag),
            level,
        };
        debug!(
            "bind_ack: call_id={}, max_xmit_frag={}, assoc_group={:#x}",
            call_id, self.negotiated.max_xmit_frag, ack.assoc_group_id
        );
        self.bound = Some(*alternative);
        self.state = SessionState::Bound { level };

        let Some(mut context) = security else {
            info!("bound {} at {} without authentication", alternative.interface, address);
            return Ok(());
        };

        if let Some(verifier) = &ack.auth_verifier {
            if !context.is_established() {
                if let Some(token) = context.continue_token(&verifier.auth_value)? {
                    let auth3 = Auth3Pdu::new(
                        call_id,
                        AuthVerifier::new(auth_type, level, AUTH_CONTEXT_ID, token),
                    );
                    debug!("sending auth3: call_id={}", call_id);
                    self.send(auth3.encode()).await?;
                }
            }
        }
        if !context.is_established() {
            return Err(AuthFailure::Provider(format!(
                "{} security context did not complete",
                auth_type
            ))
            .into());
        }

        self.security = Some(context);
        self.state = SessionState::Authenticated;
        info!(
            "bound {} at {} with {} ({:?})",
            alternative.interface, address, auth_type, level
        );
        Ok(())
    }

    async fn receive_bind_reply(&mut self, address: &TargetAddress) -> Result<Pdu> {
        let data = match self.receive().await {
            Ok(data) => data,
            Err(SessionError::Channel(
                ChannelError::ConnectionClosed
                | ChannelError::InvalidPdu(_)
                | ChannelError::PduTooLarge { .. },
            )) => return Err(SessionError::rejected(address, "no DCE/RPC reply to bind")),
            Err(err) => return Err(err),
        };
        Pdu::decode(&data)
            .map_err(|e| SessionError::rejected(address, format!("undecodable bind reply: {}", e)))
    }

    pub(super) async fn send(&mut self, pdu: Bytes) -> Result<()> {
        let channel = self.channel.as_mut().ok_or(SessionError::SessionClosed)?;
        channel.send(pdu).await
    }

    pub(super) async fn receive(&mut self) -> Result<Bytes> {
        let channel = self.channel.as_mut().ok_or(SessionError::SessionClosed)?;
        channel.receive().await
    }
}

/// Runs one whole exchange, send and every reply fragment, under a single
/// deadline.
pub(super) async fn within_exchange_timeout<T>(
    limit: Option<Duration>,
    exchange: impl Future<Output = Result<T>>,
) -> Result<T> {
    match limit {
        Some(limit) => match tokio::time::timeout(limit, exchange).await {
            Ok(result) => result,
            Err(_) => Err(ChannelError::Timeout(limit).into()),
        },
        None => exchange.await,
    }
}

/// Smaller of ours and theirs; a zero from the server means no limit.
fn negotiate_frag(ours: u16, theirs: u16) -> u16 {
    if theirs == 0 {
        ours
    } else {
        ours.min(theirs)
    }
}
