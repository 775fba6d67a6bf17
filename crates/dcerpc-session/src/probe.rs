//! Machine-name probe
//!
//! Kerberos needs the server's canonical name, not an IP address. The
//! probe binds the endpoint mapper with an NTLM NEGOTIATE token and reads
//! the computer names from the CHALLENGE the server puts in its
//! `bind_ack`. No credentials are sent and the connection is dropped right
//! after the reply.

use crate::config::SessionConfig;
use crate::epm::EPM_INTERFACE;
use crate::error::{AuthFailure, ChannelError, Result, SessionError};
use crate::pdu::{BindPdu, ContextElement, Pdu, NDR_SYNTAX};
use crate::security::{AuthLevel, AuthType, AuthVerifier};
use crate::session::classify_bind_reply;
use crate::transport::{TargetAddress, Transport};
use bytes::{BufMut, Bytes, BytesMut};
use tracing::debug;

const NTLMSSP_SIGNATURE: &[u8; 8] = b"NTLMSSP\0";
const NTLM_NEGOTIATE: u32 = 1;
const NTLM_CHALLENGE: u32 = 2;

/// UNICODE | REQUEST_TARGET | NTLM | ALWAYS_SIGN | EXTENDED_SESSIONSECURITY
/// | TARGET_INFO | 128 | 56
const NEGOTIATE_FLAGS: u32 = 0xa088_8205;

/// Offset of the TargetInfo fields in a CHALLENGE message.
const TARGET_INFO_OFFSET: usize = 40;

mod av_id {
    pub const EOL: u16 = 0;
    pub const NB_COMPUTER_NAME: u16 = 1;
    pub const NB_DOMAIN_NAME: u16 = 2;
    pub const DNS_COMPUTER_NAME: u16 = 3;
    pub const DNS_DOMAIN_NAME: u16 = 4;
}

/// Names the server reported about itself
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MachineName {
    pub netbios_name: Option<String>,
    pub netbios_domain: Option<String>,
    pub dns_name: Option<String>,
    pub dns_domain: Option<String>,
}

impl MachineName {
    /// FQDN when known, NetBIOS name otherwise.
    pub fn canonical(&self) -> Option<&str> {
        self.dns_name
            .as_deref()
            .or(self.netbios_name.as_deref())
            .filter(|name| !name.is_empty())
    }
}

/// NTLM NEGOTIATE message with empty domain and workstation fields.
pub fn ntlm_negotiate_token() -> Bytes {
    let mut buf = BytesMut::with_capacity(32);
    buf.put_slice(NTLMSSP_SIGNATURE);
    buf.put_u32_le(NTLM_NEGOTIATE);
    buf.put_u32_le(NEGOTIATE_FLAGS);
    buf.put_bytes(0, 16);
    buf.freeze()
}

fn malformed(what: &str) -> SessionError {
    AuthFailure::Provider(format!("malformed NTLM challenge: {}", what)).into()
}

fn utf16le(data: &[u8]) -> String {
    let units: Vec<u16> = data
        .chunks_exact(2)
        .map(|c| u16::from_le_bytes([c[0], c[1]]))
        .collect();
    String::from_utf16_lossy(&units)
}

/// Reads the target-info AV pairs of an NTLM CHALLENGE message.
pub fn parse_challenge(message: &[u8]) -> Result<MachineName> {
    if message.len() < TARGET_INFO_OFFSET + 8 || &message[..8] != NTLMSSP_SIGNATURE {
        return Err(malformed("bad signature or length"));
    }
    let message_type = u32::from_le_bytes([message[8], message[9], message[10], message[11]]);
    if message_type != NTLM_CHALLENGE {
        return Err(malformed("not a CHALLENGE message"));
    }

    let fields = &message[TARGET_INFO_OFFSET..TARGET_INFO_OFFSET + 8];
    let len = u16::from_le_bytes([fields[0], fields[1]]) as usize;
    let offset = u32::from_le_bytes([fields[4], fields[5], fields[6], fields[7]]) as usize;
    let mut info = message
        .get(offset..offset.saturating_add(len))
        .ok_or_else(|| malformed("target info out of bounds"))?;

    let mut names = MachineName::default();
    while info.len() >= 4 {
        let id = u16::from_le_bytes([info[0], info[1]]);
        let value_len = u16::from_le_bytes([info[2], info[3]]) as usize;
        if id == av_id::EOL {
            break;
        }
        let value = info
            .get(4..4 + value_len)
            .ok_or_else(|| malformed("AV pair overruns target info"))?;
        let slot = match id {
            av_id::NB_COMPUTER_NAME => Some(&mut names.netbios_name),
            av_id::NB_DOMAIN_NAME => Some(&mut names.netbios_domain),
            av_id::DNS_COMPUTER_NAME => Some(&mut names.dns_name),
            av_id::DNS_DOMAIN_NAME => Some(&mut names.dns_domain),
            _ => None,
        };
        if let Some(slot) = slot {
            *slot = Some(utf16le(value));
        }
        info = &info[4 + value_len..];
    }
    Ok(names)
}

/// Probes `address` (normally the endpoint mapper on 135) for the names
/// the server reports in an NTLM challenge.
pub async fn probe_machine_name(
    transport: &dyn Transport,
    address: &TargetAddress,
    config: &SessionConfig,
) -> Result<MachineName> {
    let mut channel = transport.connect(address, config.connect_timeout).await?;

    let mut bind = BindPdu::new(1, ContextElement::new(0, EPM_INTERFACE, NDR_SYNTAX))
        .with_auth(AuthVerifier::new(
            AuthType::Ntlm,
            AuthLevel::Connect,
            0,
            ntlm_negotiate_token(),
        ));
    bind.max_xmit_frag = config.max_xmit_frag;
    bind.max_recv_frag = config.max_recv_frag;
    debug!("probing {} with an NTLM negotiate bind", address);

    let exchange = async {
        channel.send(bind.encode()).await?;
        channel.receive().await
    };
    let reply = match config.exchange_timeout {
        Some(limit) => tokio::time::timeout(limit, exchange)
            .await
            .unwrap_or_else(|_| Err(ChannelError::Timeout(limit).into())),
        None => exchange.await,
    };
    if let Err(err) = channel.close().await {
        debug!("error while closing probe channel: {}", err);
    }

    let reply = Pdu::decode(&reply?)?;
    let ack = classify_bind_reply(reply, address, AuthType::Ntlm)?;
    let verifier = ack
        .auth_verifier
        .ok_or_else(|| malformed("bind_ack carried no challenge"))?;
    let names = parse_challenge(&verifier.auth_value)?;
    debug!("{} reports itself as {:?}", address, names);
    Ok(names)
}

/// Builds a CHALLENGE message announcing the given names.
#[cfg(any(test, feature = "test-util"))]
pub fn encode_challenge(names: &MachineName) -> Bytes {
    let mut info = BytesMut::new();
    for (id, value) in [
        (av_id::NB_DOMAIN_NAME, &names.netbios_domain),
        (av_id::NB_COMPUTER_NAME, &names.netbios_name),
        (av_id::DNS_DOMAIN_NAME, &names.dns_domain),
        (av_id::DNS_COMPUTER_NAME, &names.dns_name),
    ] {
        if let Some(value) = value {
            let units: Vec<u16> = value.encode_utf16().collect();
            info.put_u16_le(id);
            info.put_u16_le((units.len() * 2) as u16);
            for unit in units {
                info.put_u16_le(unit);
            }
        }
    }
    info.put_u16_le(av_id::EOL);
    info.put_u16_le(0);

    let header_len = 48u32;
    let mut buf = BytesMut::new();
    buf.put_slice(NTLMSSP_SIGNATURE);
    buf.put_u32_le(NTLM_CHALLENGE);
    buf.put_u16_le(0);
    buf.put_u16_le(0);
    buf.put_u32_le(header_len);
    buf.put_u32_le(NEGOTIATE_FLAGS);
    buf.put_slice(&[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
    buf.put_bytes(0, 8);
    buf.put_u16_le(info.len() as u16);
    buf.put_u16_le(info.len() as u16);
    buf.put_u32_le(header_len);
    buf.put_slice(&info);
    buf.freeze()
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dc01() -> MachineName {
        MachineName {
            netbios_name: Some("DC01".into()),
            netbios_domain: Some("CORP".into()),
            dns_name: Some("dc01.corp.local".into()),
            dns_domain: Some("corp.local".into()),
        }
    }

    #[test]
    fn test_negotiate_token_layout() {
        let token = ntlm_negotiate_token();
        assert_eq!(token.len(), 32);
        assert_eq!(&token[..8], NTLMSSP_SIGNATURE);
        assert_eq!(token[8], 1);
    }

    #[test]
    fn test_parse_challenge_names() {
        let names = parse_challenge(&encode_challenge(&dc01())).unwrap();
        assert_eq!(names, dc01());
        assert_eq!(names.canonical(), Some("dc01.corp.local"));
    }

    #[test]
    fn test_netbios_fallback() {
        let names = MachineName {
            netbios_name: Some("DC01".into()),
            ..Default::default()
        };
        let parsed = parse_challenge(&encode_challenge(&names)).unwrap();
        assert_eq!(parsed.canonical(), Some("DC01"));
    }

    #[test]
    fn test_truncated_challenge_is_rejected() {
        let challenge = encode_challenge(&dc01());
        assert!(parse_challenge(&challenge[..challenge.len() - 6]).is_err());
        assert!(parse_challenge(&ntlm_negotiate_token()).is_err());
    }
}
