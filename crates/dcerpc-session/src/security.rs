//! Authentication verifiers and pluggable security providers
//!
//! Wire format follows MS-RPCE 2.2.2.11 for the auth verifier. The actual
//! cryptography (NTLM, Kerberos, signing and sealing) lives behind
//! [`Authenticator`] / [`SecurityContext`]; this crate ships only the
//! anonymous provider.

use crate::credentials::Credentials;
use crate::error::Result;
use crate::transport::TargetAddress;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;

/// Authentication types (MS-RPCE 2.2.1.1.7)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AuthType {
    None = 0,
    GssNegotiate = 9,
    Ntlm = 10,
    GssKerberos = 16,
    Netlogon = 68,
}

impl AuthType {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::None),
            9 => Some(Self::GssNegotiate),
            10 => Some(Self::Ntlm),
            16 => Some(Self::GssKerberos),
            68 => Some(Self::Netlogon),
            _ => None,
        }
    }
}

impl fmt::Display for AuthType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::None => "anonymous",
            Self::GssNegotiate => "Negotiate",
            Self::Ntlm => "NTLM",
            Self::GssKerberos => "Kerberos",
            Self::Netlogon => "Netlogon",
        })
    }
}

/// Authentication levels (MS-RPCE 2.2.1.1.8)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
#[repr(u8)]
pub enum AuthLevel {
    #[default]
    None = 1,
    Connect = 2,
    Call = 3,
    Pkt = 4,
    PktIntegrity = 5,
    PktPrivacy = 6,
}

impl AuthLevel {
    pub fn from_u8(value: u8) -> Option<Self> {
        match value {
            1 => Some(Self::None),
            2 => Some(Self::Connect),
            3 => Some(Self::Call),
            4 => Some(Self::Pkt),
            5 => Some(Self::PktIntegrity),
            6 => Some(Self::PktPrivacy),
            _ => None,
        }
    }

    pub fn requires_signing(&self) -> bool {
        matches!(self, Self::PktIntegrity | Self::PktPrivacy)
    }

    pub fn requires_encryption(&self) -> bool {
        matches!(self, Self::PktPrivacy)
    }
}

/// Authentication verifier appended to authenticated PDUs
///
/// ```text
/// +-----------+------------+--------------+----------+-----------------+
/// | auth_type | auth_level | auth_pad_len | reserved | auth_context_id |
/// |    (1)    |    (1)     |     (1)      |   (1)    |       (4)       |
/// +-----------+------------+--------------+----------+-----------------+
/// | auth_value (auth_length bytes)                                     |
/// +--------------------------------------------------------------------+
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AuthVerifier {
    pub auth_type: AuthType,
    pub auth_level: AuthLevel,
    pub auth_pad_length: u8,
    pub auth_context_id: u32,
    pub auth_value: Bytes,
}

impl AuthVerifier {
    pub const HEADER_SIZE: usize = 8;

    pub fn new(
        auth_type: AuthType,
        auth_level: AuthLevel,
        auth_context_id: u32,
        auth_value: Bytes,
    ) -> Self {
        Self {
            auth_type,
            auth_level,
            auth_pad_length: 0,
            auth_context_id,
            auth_value,
        }
    }

    pub fn size(&self) -> usize {
        Self::HEADER_SIZE + self.auth_value.len()
    }

    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.auth_type as u8);
        buf.put_u8(self.auth_level as u8);
        buf.put_u8(self.auth_pad_length);
        buf.put_u8(0);
        buf.put_u32_le(self.auth_context_id);
        buf.put_slice(&self.auth_value);
    }

    /// Decodes a verifier occupying all of `data`.
    pub fn decode(data: &[u8], little_endian: bool) -> Option<Self> {
        if data.len() < Self::HEADER_SIZE {
            return None;
        }
        let id = [data[4], data[5], data[6], data[7]];
        Some(Self {
            auth_type: AuthType::from_u8(data[0])?,
            auth_level: AuthLevel::from_u8(data[1])?,
            auth_pad_length: data[2],
            auth_context_id: if little_endian {
                u32::from_le_bytes(id)
            } else {
                u32::from_be_bytes(id)
            },
            auth_value: Bytes::copy_from_slice(&data[Self::HEADER_SIZE..]),
        })
    }
}

/// Factory for per-connection security contexts.
///
/// The negotiator calls [`Authenticator::start`] once per bind attempt, so a
/// context and the tokens it produced are never carried over to a new
/// channel.
pub trait Authenticator: Send + Sync {
    fn auth_type(&self) -> AuthType;

    fn start(
        &self,
        credentials: &Credentials,
        target: &TargetAddress,
    ) -> Result<Box<dyn SecurityContext>>;
}

/// One side of a GSS-style token exchange plus per-message protection.
pub trait SecurityContext: Send {
    /// Token carried in the bind request.
    fn initial_token(&mut self) -> Result<Bytes>;

    /// Consumes the server's `bind_ack` token. `Some` is sent in an
    /// `auth3` PDU.
    fn continue_token(&mut self, server_token: &[u8]) -> Result<Option<Bytes>>;

    fn is_established(&self) -> bool;

    /// Bytes of signature [`SecurityContext::wrap`] appends to each fragment.
    fn signature_size(&self) -> usize {
        0
    }

    /// Signs or seals an outgoing stub. Returns the (possibly encrypted)
    /// stub and the signature for the auth verifier.
    fn wrap(&mut self, _level: AuthLevel, stub: Bytes) -> Result<(Bytes, Bytes)> {
        Ok((stub, Bytes::new()))
    }

    /// Verifies or unseals an incoming stub.
    fn unwrap(&mut self, _level: AuthLevel, stub: Bytes, _signature: &[u8]) -> Result<Bytes> {
        Ok(stub)
    }
}

/// Anonymous binds: no verifier, no protection.
#[derive(Debug, Clone, Copy, Default)]
pub struct Anonymous;

impl Authenticator for Anonymous {
    fn auth_type(&self) -> AuthType {
        AuthType::None
    }

    fn start(&self, _: &Credentials, _: &TargetAddress) -> Result<Box<dyn SecurityContext>> {
        Ok(Box::new(AnonymousContext))
    }
}

struct AnonymousContext;

impl SecurityContext for AnonymousContext {
    fn initial_token(&mut self) -> Result<Bytes> {
        Ok(Bytes::new())
    }

    fn continue_token(&mut self, _: &[u8]) -> Result<Option<Bytes>> {
        Ok(None)
    }

    fn is_established(&self) -> bool {
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_type_from_u8() {
        assert_eq!(AuthType::from_u8(10), Some(AuthType::Ntlm));
        assert_eq!(AuthType::from_u8(16), Some(AuthType::GssKerberos));
        assert_eq!(AuthType::from_u8(255), None);
        assert_eq!(AuthType::GssKerberos.to_string(), "Kerberos");
    }

    #[test]
    fn test_auth_level_ordering() {
        assert!(AuthLevel::None < AuthLevel::Connect);
        assert!(AuthLevel::PktIntegrity < AuthLevel::PktPrivacy);
        assert!(AuthLevel::PktPrivacy.requires_signing());
        assert!(!AuthLevel::Connect.requires_signing());
    }

    #[test]
    fn test_verifier_decode() {
        let verifier = AuthVerifier::new(
            AuthType::GssNegotiate,
            AuthLevel::PktIntegrity,
            79231,
            Bytes::from_static(b"token"),
        );
        let mut buf = BytesMut::new();
        verifier.encode(&mut buf);
        assert_eq!(buf.len(), verifier.size());
        assert_eq!(AuthVerifier::decode(&buf, true), Some(verifier));
        assert_eq!(AuthVerifier::decode(&buf[..4], true), None);
    }
}
