//! Connection-oriented DCE RPC PDUs
//!
//! Wire format per DCE 1.1 (C706) chapter 12 and MS-RPCE 2.2.2. Only the
//! PDUs a client needs to bind, authenticate and call are modelled; the
//! server-side encoders exist so an in-process peer can answer.
//!
//! ```text
//! +--------+--------+--------+--------+
//! |  vers  |vers_min| ptype  | pflags |
//! +--------+--------+--------+--------+
//! |        data representation        |
//! +--------+--------+--------+--------+
//! |   frag_len      |   auth_len      |
//! +--------+--------+--------+--------+
//! |             call_id               |
//! +--------+--------+--------+--------+
//! ```

use crate::error::{ChannelError, Result, SessionError};
use crate::ndr::align_padding;
use crate::security::AuthVerifier;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use std::str::FromStr;

pub const DCE_RPC_VERSION: u8 = 5;
pub const DCE_RPC_VERSION_MINOR: u8 = 0;

/// Default fragment size offered in bind requests.
pub const DEFAULT_MAX_FRAG: u16 = 4280;

/// Stub data preceding an auth verifier on request/response PDUs is padded
/// to this boundary; bind-family bodies use 4.
pub const STUB_AUTH_ALIGNMENT: usize = 16;
const BIND_AUTH_ALIGNMENT: usize = 4;

/// NDR data representation: little-endian integers, ASCII, IEEE floats.
pub const NDR_DATA_REP: [u8; 4] = [0x10, 0x00, 0x00, 0x00];

/// Fault and rejection status codes the negotiator keys on
pub mod status {
    pub const RPC_S_ACCESS_DENIED: u32 = 0x0000_0005;
    pub const RPC_S_UNKNOWN_AUTHN_SERVICE: u32 = 0x0000_06d3;
    pub const RPC_S_UNSUPPORTED_AUTHN_LEVEL: u32 = 0x0000_071d;
    pub const STATUS_NOT_SUPPORTED: u32 = 0xc000_00bb;
    pub const NCA_S_OP_RNG_ERROR: u32 = 0x1c01_0002;
    pub const NCA_S_UNK_IF: u32 = 0x1c01_0003;
    pub const NCA_S_PROTO_ERROR: u32 = 0x1c01_000b;
}

/// `bind_nak` rejection reasons (C706 12.6.3.1)
pub mod reject_reason {
    pub const NOT_SPECIFIED: u16 = 0;
    pub const TEMPORARY_CONGESTION: u16 = 1;
    pub const LOCAL_LIMIT_EXCEEDED: u16 = 2;
    pub const CALLED_PADDR_UNKNOWN: u16 = 3;
    pub const PROTOCOL_VERSION_NOT_SUPPORTED: u16 = 4;
    pub const DEFAULT_CONTEXT_NOT_SUPPORTED: u16 = 5;
    pub const USER_DATA_NOT_READABLE: u16 = 6;
    pub const NO_PSAP_AVAILABLE: u16 = 7;
    pub const AUTHENTICATION_TYPE_NOT_RECOGNIZED: u16 = 8;
    pub const INVALID_CHECKSUM: u16 = 9;
}

/// Per-context rejection reasons carried in `bind_ack` results
pub mod provider_reason {
    pub const NOT_SPECIFIED: u16 = 0;
    pub const ABSTRACT_SYNTAX_NOT_SUPPORTED: u16 = 1;
    pub const PROPOSED_TRANSFER_SYNTAXES_NOT_SUPPORTED: u16 = 2;
    pub const LOCAL_LIMIT_EXCEEDED: u16 = 3;
}

fn invalid(msg: impl Into<String>) -> SessionError {
    SessionError::Channel(ChannelError::InvalidPdu(msg.into()))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PacketType {
    Request = 0,
    Response = 2,
    Fault = 3,
    Bind = 11,
    BindAck = 12,
    BindNak = 13,
    AlterContext = 14,
    AlterContextResp = 15,
    Auth3 = 16,
    Shutdown = 17,
    CoCancel = 18,
    Orphaned = 19,
}

impl PacketType {
    pub fn from_u8(value: u8) -> Option<Self> {
        Some(match value {
            0 => Self::Request,
            2 => Self::Response,
            3 => Self::Fault,
            11 => Self::Bind,
            12 => Self::BindAck,
            13 => Self::BindNak,
            14 => Self::AlterContext,
            15 => Self::AlterContextResp,
            16 => Self::Auth3,
            17 => Self::Shutdown,
            18 => Self::CoCancel,
            19 => Self::Orphaned,
            _ => return None,
        })
    }
}

/// Packet flags
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PacketFlags(u8);

impl PacketFlags {
    pub const FIRST_FRAG: u8 = 0x01;
    pub const LAST_FRAG: u8 = 0x02;
    pub const PENDING_CANCEL: u8 = 0x04;
    pub const CONC_MPX: u8 = 0x10;
    pub const DID_NOT_EXECUTE: u8 = 0x20;
    pub const MAYBE: u8 = 0x40;
    pub const OBJECT_UUID: u8 = 0x80;

    /// Flags for a PDU that is both the first and last fragment.
    pub fn complete() -> Self {
        Self(Self::FIRST_FRAG | Self::LAST_FRAG)
    }

    pub fn fragment(first: bool, last: bool) -> Self {
        let mut bits = 0;
        if first {
            bits |= Self::FIRST_FRAG;
        }
        if last {
            bits |= Self::LAST_FRAG;
        }
        Self(bits)
    }

    pub fn is_first_frag(&self) -> bool {
        self.0 & Self::FIRST_FRAG != 0
    }

    pub fn is_last_frag(&self) -> bool {
        self.0 & Self::LAST_FRAG != 0
    }

    pub fn has_object_uuid(&self) -> bool {
        self.0 & Self::OBJECT_UUID != 0
    }

    pub fn with(self, bits: u8) -> Self {
        Self(self.0 | bits)
    }

    pub fn as_u8(&self) -> u8 {
        self.0
    }

    pub fn from_u8(value: u8) -> Self {
        Self(value)
    }
}

/// 128-bit DCE UUID
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Hash)]
pub struct Uuid {
    pub time_low: u32,
    pub time_mid: u16,
    pub time_hi_and_version: u16,
    pub clock_seq_hi_and_reserved: u8,
    pub clock_seq_low: u8,
    pub node: [u8; 6],
}

impl Uuid {
    pub const NIL: Self = Self::from_u128(0);

    /// Builds a UUID from its canonical big-endian integer form, so that
    /// `0x8a885d04_1ceb_11c9_9fe8_08002b104860` reads like the string.
    pub const fn from_u128(v: u128) -> Self {
        Self {
            time_low: (v >> 96) as u32,
            time_mid: (v >> 80) as u16,
            time_hi_and_version: (v >> 64) as u16,
            clock_seq_hi_and_reserved: (v >> 56) as u8,
            clock_seq_low: (v >> 48) as u8,
            node: [
                (v >> 40) as u8,
                (v >> 32) as u8,
                (v >> 24) as u8,
                (v >> 16) as u8,
                (v >> 8) as u8,
                v as u8,
            ],
        }
    }

    /// Parse from "xxxxxxxx-xxxx-xxxx-xxxx-xxxxxxxxxxxx"
    pub fn parse(s: &str) -> Option<Self> {
        let s = s.trim();
        let groups: Vec<&str> = s.split('-').collect();
        let lengths = [8, 4, 4, 4, 12];
        if groups.len() != lengths.len()
            || groups.iter().zip(lengths).any(|(g, len)| g.len() != len)
        {
            return None;
        }
        let hex: String = groups.concat();
        u128::from_str_radix(&hex, 16).ok().map(Self::from_u128)
    }

    pub fn is_nil(&self) -> bool {
        *self == Self::NIL
    }

    pub fn to_bytes_le(&self) -> [u8; 16] {
        let mut bytes = [0u8; 16];
        bytes[0..4].copy_from_slice(&self.time_low.to_le_bytes());
        bytes[4..6].copy_from_slice(&self.time_mid.to_le_bytes());
        bytes[6..8].copy_from_slice(&self.time_hi_and_version.to_le_bytes());
        bytes[8] = self.clock_seq_hi_and_reserved;
        bytes[9] = self.clock_seq_low;
        bytes[10..16].copy_from_slice(&self.node);
        bytes
    }

    pub fn from_bytes_le(bytes: &[u8]) -> Option<Self> {
        let b: &[u8; 16] = bytes.get(..16)?.try_into().ok()?;
        Some(Self {
            time_low: u32::from_le_bytes([b[0], b[1], b[2], b[3]]),
            time_mid: u16::from_le_bytes([b[4], b[5]]),
            time_hi_and_version: u16::from_le_bytes([b[6], b[7]]),
            clock_seq_hi_and_reserved: b[8],
            clock_seq_low: b[9],
            node: [b[10], b[11], b[12], b[13], b[14], b[15]],
        })
    }
}

impl FromStr for Uuid {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        Self::parse(s).ok_or_else(|| SessionError::InvalidInput(format!("invalid UUID '{}'", s)))
    }
}

impl fmt::Display for Uuid {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let n = &self.node;
        write!(
            f,
            "{:08x}-{:04x}-{:04x}-{:02x}{:02x}-{:02x}{:02x}{:02x}{:02x}{:02x}{:02x}",
            self.time_low,
            self.time_mid,
            self.time_hi_and_version,
            self.clock_seq_hi_and_reserved,
            self.clock_seq_low,
            n[0],
            n[1],
            n[2],
            n[3],
            n[4],
            n[5]
        )
    }
}

/// Interface or transfer syntax identifier: UUID plus version
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SyntaxId {
    pub uuid: Uuid,
    /// Major version in the low 16 bits, minor in the high 16 bits.
    pub version: u32,
}

impl SyntaxId {
    pub const fn new(uuid: Uuid, major: u16, minor: u16) -> Self {
        Self {
            uuid,
            version: (major as u32) | ((minor as u32) << 16),
        }
    }

    pub fn major_version(&self) -> u16 {
        self.version as u16
    }

    pub fn minor_version(&self) -> u16 {
        (self.version >> 16) as u16
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_slice(&self.uuid.to_bytes_le());
        buf.put_u32_le(self.version);
    }
}

impl fmt::Display for SyntaxId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} v{}.{}",
            self.uuid,
            self.major_version(),
            self.minor_version()
        )
    }
}

/// NDR 2.0 transfer syntax
pub const NDR_SYNTAX: SyntaxId =
    SyntaxId::new(Uuid::from_u128(0x8a885d04_1ceb_11c9_9fe8_08002b104860), 2, 0);

/// NDR64 1.0 transfer syntax
pub const NDR64_SYNTAX: SyntaxId =
    SyntaxId::new(Uuid::from_u128(0x71710533_beba_4937_8319_b5dbef9ccc36), 1, 0);

/// Bounds-checked field reader honouring the PDU's integer representation.
struct Fields<'a> {
    data: &'a [u8],
    pos: usize,
    little_endian: bool,
}

impl<'a> Fields<'a> {
    fn new(data: &'a [u8], pos: usize, little_endian: bool) -> Self {
        Self {
            data,
            pos,
            little_endian,
        }
    }

    fn take(&mut self, len: usize, what: &str) -> Result<&'a [u8]> {
        let end = self.pos + len;
        if end > self.data.len() {
            return Err(invalid(format!("truncated {}", what)));
        }
        let slice = &self.data[self.pos..end];
        self.pos = end;
        Ok(slice)
    }

    fn u8(&mut self, what: &str) -> Result<u8> {
        Ok(self.take(1, what)?[0])
    }

    fn u16(&mut self, what: &str) -> Result<u16> {
        let b = self.take(2, what)?;
        Ok(if self.little_endian {
            u16::from_le_bytes([b[0], b[1]])
        } else {
            u16::from_be_bytes([b[0], b[1]])
        })
    }

    fn u32(&mut self, what: &str) -> Result<u32> {
        let b = self.take(4, what)?;
        let arr = [b[0], b[1], b[2], b[3]];
        Ok(if self.little_endian {
            u32::from_le_bytes(arr)
        } else {
            u32::from_be_bytes(arr)
        })
    }

    fn uuid(&mut self) -> Result<Uuid> {
        let le = self.little_endian;
        let b = self.take(16, "UUID")?;
        let mut uuid = Uuid::from_bytes_le(b).ok_or_else(|| invalid("truncated UUID"))?;
        if !le {
            uuid.time_low = uuid.time_low.swap_bytes();
            uuid.time_mid = uuid.time_mid.swap_bytes();
            uuid.time_hi_and_version = uuid.time_hi_and_version.swap_bytes();
        }
        Ok(uuid)
    }

    fn syntax(&mut self) -> Result<SyntaxId> {
        let uuid = self.uuid()?;
        let version = self.u32("syntax version")?;
        Ok(SyntaxId { uuid, version })
    }

    fn align(&mut self, alignment: usize) -> Result<()> {
        let pad = align_padding(self.pos, alignment);
        self.take(pad, "alignment padding").map(|_| ())
    }

    fn rest(&self, end: usize) -> &'a [u8] {
        &self.data[self.pos.min(end)..end]
    }
}

/// Common 16-byte PDU header
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PduHeader {
    pub version: u8,
    pub version_minor: u8,
    pub packet_type: PacketType,
    pub packet_flags: PacketFlags,
    pub data_rep: [u8; 4],
    pub frag_length: u16,
    pub auth_length: u16,
    pub call_id: u32,
}

impl PduHeader {
    pub const SIZE: usize = 16;

    pub fn new(packet_type: PacketType, call_id: u32) -> Self {
        Self {
            version: DCE_RPC_VERSION,
            version_minor: DCE_RPC_VERSION_MINOR,
            packet_type,
            packet_flags: PacketFlags::complete(),
            data_rep: NDR_DATA_REP,
            frag_length: 0,
            auth_length: 0,
            call_id,
        }
    }

    pub fn is_little_endian(&self) -> bool {
        self.data_rep[0] & 0xf0 != 0
    }

    /// Reads just enough of a header to learn the fragment length. Used by
    /// the framer before the full PDU has arrived.
    pub fn peek_frag_length(data: &[u8]) -> Option<u16> {
        if data.len() < Self::SIZE {
            return None;
        }
        let le = data[4] & 0xf0 != 0;
        Some(if le {
            u16::from_le_bytes([data[8], data[9]])
        } else {
            u16::from_be_bytes([data[8], data[9]])
        })
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(invalid(format!("PDU header too short: {} bytes", data.len())));
        }
        if data[0] != DCE_RPC_VERSION {
            return Err(invalid(format!("unsupported RPC version {}", data[0])));
        }
        let packet_type = PacketType::from_u8(data[2])
            .ok_or_else(|| invalid(format!("unknown packet type {}", data[2])))?;
        let data_rep = [data[4], data[5], data[6], data[7]];
        let mut fields = Fields::new(data, 8, data_rep[0] & 0xf0 != 0);
        Ok(Self {
            version: data[0],
            version_minor: data[1],
            packet_type,
            packet_flags: PacketFlags::from_u8(data[3]),
            data_rep,
            frag_length: fields.u16("frag_length")?,
            auth_length: fields.u16("auth_length")?,
            call_id: fields.u32("call_id")?,
        })
    }

    fn encode(&self, buf: &mut BytesMut) {
        buf.put_u8(self.version);
        buf.put_u8(self.version_minor);
        buf.put_u8(self.packet_type as u8);
        buf.put_u8(self.packet_flags.as_u8());
        buf.put_slice(&NDR_DATA_REP);
        buf.put_u16_le(self.frag_length);
        buf.put_u16_le(self.auth_length);
        buf.put_u32_le(self.call_id);
    }
}

/// Prepends the header, pads the body and appends the verifier.
fn assemble(
    header: &PduHeader,
    body: &[u8],
    auth: Option<&AuthVerifier>,
    alignment: usize,
) -> Bytes {
    let auth_size = auth.map(|a| a.size() + alignment).unwrap_or(0);
    let mut buf = BytesMut::with_capacity(PduHeader::SIZE + body.len() + auth_size);
    let mut header = header.clone();

    let mut tail = BytesMut::new();
    if let Some(auth) = auth {
        let pad = align_padding(body.len(), alignment);
        tail.put_bytes(0, pad);
        let mut auth = auth.clone();
        auth.auth_pad_length = pad as u8;
        auth.encode(&mut tail);
        header.auth_length = auth.auth_value.len() as u16;
    } else {
        header.auth_length = 0;
    }

    header.frag_length = (PduHeader::SIZE + body.len() + tail.len()) as u16;
    header.encode(&mut buf);
    buf.put_slice(body);
    buf.put_slice(&tail);
    buf.freeze()
}

/// Splits off a trailing auth verifier. Returns the end offset of the
/// body (before auth padding) and the verifier.
fn split_verifier(
    data: &[u8],
    header: &PduHeader,
    body_start: usize,
) -> Result<(usize, Option<AuthVerifier>)> {
    let frag_end = (header.frag_length as usize).min(data.len());
    if header.auth_length == 0 {
        return Ok((frag_end, None));
    }
    let verifier_len = AuthVerifier::HEADER_SIZE + header.auth_length as usize;
    if frag_end < body_start + verifier_len {
        return Err(invalid("auth_length exceeds PDU body"));
    }
    let verifier_start = frag_end - verifier_len;
    let verifier = AuthVerifier::decode(
        &data[verifier_start..frag_end],
        header.is_little_endian(),
    )
    .ok_or_else(|| invalid("malformed auth verifier"))?;
    let body_end = verifier_start
        .checked_sub(verifier.auth_pad_length as usize)
        .filter(|end| *end >= body_start)
        .ok_or_else(|| invalid("auth padding exceeds PDU body"))?;
    Ok((body_end, Some(verifier)))
}

fn expect_type(header: &PduHeader, expected: PacketType) -> Result<()> {
    if header.packet_type != expected {
        return Err(SessionError::Channel(ChannelError::UnexpectedPdu(
            header.packet_type,
        )));
    }
    Ok(())
}

/// Presentation context proposed in a bind
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContextElement {
    pub context_id: u16,
    pub abstract_syntax: SyntaxId,
    pub transfer_syntaxes: Vec<SyntaxId>,
}

impl ContextElement {
    pub fn new(context_id: u16, abstract_syntax: SyntaxId, transfer_syntax: SyntaxId) -> Self {
        Self {
            context_id,
            abstract_syntax,
            transfer_syntaxes: vec![transfer_syntax],
        }
    }
}

/// Bind request
#[derive(Debug, Clone)]
pub struct BindPdu {
    pub header: PduHeader,
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group_id: u32,
    pub context_list: Vec<ContextElement>,
    pub auth_verifier: Option<AuthVerifier>,
}

impl BindPdu {
    pub fn new(call_id: u32, context: ContextElement) -> Self {
        Self {
            header: PduHeader::new(PacketType::Bind, call_id),
            max_xmit_frag: DEFAULT_MAX_FRAG,
            max_recv_frag: DEFAULT_MAX_FRAG,
            assoc_group_id: 0,
            context_list: vec![context],
            auth_verifier: None,
        }
    }

    pub fn with_auth(mut self, verifier: AuthVerifier) -> Self {
        self.auth_verifier = Some(verifier);
        self
    }

    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(64);
        body.put_u16_le(self.max_xmit_frag);
        body.put_u16_le(self.max_recv_frag);
        body.put_u32_le(self.assoc_group_id);
        body.put_u8(self.context_list.len() as u8);
        body.put_bytes(0, 3);
        for ctx in &self.context_list {
            body.put_u16_le(ctx.context_id);
            body.put_u8(ctx.transfer_syntaxes.len() as u8);
            body.put_u8(0);
            ctx.abstract_syntax.encode(&mut body);
            for ts in &ctx.transfer_syntaxes {
                ts.encode(&mut body);
            }
        }
        assemble(
            &self.header,
            &body,
            self.auth_verifier.as_ref(),
            BIND_AUTH_ALIGNMENT,
        )
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = PduHeader::decode(data)?;
        expect_type(&header, PacketType::Bind)?;
        let (_, auth_verifier) = split_verifier(data, &header, PduHeader::SIZE)?;
        let mut f = Fields::new(data, PduHeader::SIZE, header.is_little_endian());

        let max_xmit_frag = f.u16("max_xmit_frag")?;
        let max_recv_frag = f.u16("max_recv_frag")?;
        let assoc_group_id = f.u32("assoc_group_id")?;
        let count = f.u8("n_context_elem")?;
        f.take(3, "reserved")?;

        let mut context_list = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let context_id = f.u16("p_cont_id")?;
            let n_transfer = f.u8("n_transfer_syn")?;
            f.u8("reserved")?;
            let abstract_syntax = f.syntax()?;
            let transfer_syntaxes = (0..n_transfer)
                .map(|_| f.syntax())
                .collect::<Result<Vec<_>>>()?;
            context_list.push(ContextElement {
                context_id,
                abstract_syntax,
                transfer_syntaxes,
            });
        }

        Ok(Self {
            header,
            max_xmit_frag,
            max_recv_frag,
            assoc_group_id,
            context_list,
            auth_verifier,
        })
    }
}

/// Outcome of one presentation context in a `bind_ack`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum ContextResult {
    Acceptance = 0,
    UserRejection = 1,
    ProviderRejection = 2,
    NegotiateAck = 3,
}

impl ContextResult {
    fn from_u16(value: u16) -> Self {
        match value {
            0 => Self::Acceptance,
            1 => Self::UserRejection,
            3 => Self::NegotiateAck,
            _ => Self::ProviderRejection,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BindResult {
    pub result: ContextResult,
    pub reason: u16,
    pub transfer_syntax: SyntaxId,
}

impl BindResult {
    pub fn accepted(transfer_syntax: SyntaxId) -> Self {
        Self {
            result: ContextResult::Acceptance,
            reason: 0,
            transfer_syntax,
        }
    }

    pub fn rejected(reason: u16) -> Self {
        Self {
            result: ContextResult::ProviderRejection,
            reason,
            transfer_syntax: SyntaxId::new(Uuid::NIL, 0, 0),
        }
    }
}

/// Bind acknowledgment
#[derive(Debug, Clone)]
pub struct BindAckPdu {
    pub header: PduHeader,
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub assoc_group_id: u32,
    pub secondary_addr: String,
    pub results: Vec<BindResult>,
    pub auth_verifier: Option<AuthVerifier>,
}

impl BindAckPdu {
    pub fn new(call_id: u32, results: Vec<BindResult>) -> Self {
        Self {
            header: PduHeader::new(PacketType::BindAck, call_id),
            max_xmit_frag: DEFAULT_MAX_FRAG,
            max_recv_frag: DEFAULT_MAX_FRAG,
            assoc_group_id: 0,
            secondary_addr: String::new(),
            results,
            auth_verifier: None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(64);
        body.put_u16_le(self.max_xmit_frag);
        body.put_u16_le(self.max_recv_frag);
        body.put_u32_le(self.assoc_group_id);
        body.put_u16_le(self.secondary_addr.len() as u16 + 1);
        body.put_slice(self.secondary_addr.as_bytes());
        body.put_u8(0);
        body.put_bytes(0, align_padding(PduHeader::SIZE + body.len(), 4));
        body.put_u8(self.results.len() as u8);
        body.put_bytes(0, 3);
        for r in &self.results {
            body.put_u16_le(r.result as u16);
            body.put_u16_le(r.reason);
            r.transfer_syntax.encode(&mut body);
        }
        assemble(
            &self.header,
            &body,
            self.auth_verifier.as_ref(),
            BIND_AUTH_ALIGNMENT,
        )
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = PduHeader::decode(data)?;
        expect_type(&header, PacketType::BindAck)?;
        let (_, auth_verifier) = split_verifier(data, &header, PduHeader::SIZE)?;
        let mut f = Fields::new(data, PduHeader::SIZE, header.is_little_endian());

        let max_xmit_frag = f.u16("max_xmit_frag")?;
        let max_recv_frag = f.u16("max_recv_frag")?;
        let assoc_group_id = f.u32("assoc_group_id")?;
        let addr_len = f.u16("sec_addr length")? as usize;
        let addr = f.take(addr_len, "sec_addr")?;
        let secondary_addr = String::from_utf8_lossy(addr)
            .trim_end_matches('\0')
            .to_string();
        f.align(4)?;

        let count = f.u8("n_results")?;
        f.take(3, "reserved")?;
        let mut results = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let result = ContextResult::from_u16(f.u16("result")?);
            let reason = f.u16("reason")?;
            let transfer_syntax = f.syntax()?;
            results.push(BindResult {
                result,
                reason,
                transfer_syntax,
            });
        }

        Ok(Self {
            header,
            max_xmit_frag,
            max_recv_frag,
            assoc_group_id,
            secondary_addr,
            results,
            auth_verifier,
        })
    }
}

/// Bind rejection
#[derive(Debug, Clone)]
pub struct BindNakPdu {
    pub header: PduHeader,
    pub reject_reason: u16,
    /// Protocol versions the server supports, as (major, minor).
    pub versions: Vec<(u8, u8)>,
}

impl BindNakPdu {
    pub fn new(call_id: u32, reject_reason: u16) -> Self {
        Self {
            header: PduHeader::new(PacketType::BindNak, call_id),
            reject_reason,
            versions: vec![(DCE_RPC_VERSION, DCE_RPC_VERSION_MINOR)],
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(8);
        body.put_u16_le(self.reject_reason);
        body.put_u8(self.versions.len() as u8);
        for (major, minor) in &self.versions {
            body.put_u8(*major);
            body.put_u8(*minor);
        }
        assemble(&self.header, &body, None, BIND_AUTH_ALIGNMENT)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = PduHeader::decode(data)?;
        expect_type(&header, PacketType::BindNak)?;
        let mut f = Fields::new(data, PduHeader::SIZE, header.is_little_endian());
        let reject_reason = f.u16("reject reason")?;
        // The version list is optional in practice.
        let mut versions = Vec::new();
        if let Ok(count) = f.u8("n_protocols") {
            for _ in 0..count {
                let major = f.u8("major")?;
                let minor = f.u8("minor")?;
                versions.push((major, minor));
            }
        }
        Ok(Self {
            header,
            reject_reason,
            versions,
        })
    }
}

/// Request PDU
#[derive(Debug, Clone)]
pub struct RequestPdu {
    pub header: PduHeader,
    pub alloc_hint: u32,
    pub context_id: u16,
    pub opnum: u16,
    pub object_uuid: Option<Uuid>,
    pub stub_data: Bytes,
    pub auth_verifier: Option<AuthVerifier>,
}

impl RequestPdu {
    /// alloc_hint(4) + context_id(2) + opnum(2)
    pub const BODY_HEADER_SIZE: usize = 8;

    pub fn new(call_id: u32, opnum: u16, stub_data: Bytes) -> Self {
        Self {
            header: PduHeader::new(PacketType::Request, call_id),
            alloc_hint: stub_data.len() as u32,
            context_id: 0,
            opnum,
            object_uuid: None,
            stub_data,
            auth_verifier: None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(Self::BODY_HEADER_SIZE + 16 + self.stub_data.len());
        body.put_u32_le(self.alloc_hint);
        body.put_u16_le(self.context_id);
        body.put_u16_le(self.opnum);
        let mut header = self.header.clone();
        if let Some(uuid) = &self.object_uuid {
            body.put_slice(&uuid.to_bytes_le());
            header.packet_flags = header.packet_flags.with(PacketFlags::OBJECT_UUID);
        }
        body.put_slice(&self.stub_data);
        assemble(
            &header,
            &body,
            self.auth_verifier.as_ref(),
            STUB_AUTH_ALIGNMENT,
        )
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = PduHeader::decode(data)?;
        expect_type(&header, PacketType::Request)?;
        let (body_end, auth_verifier) = split_verifier(data, &header, PduHeader::SIZE)?;
        let mut f = Fields::new(data, PduHeader::SIZE, header.is_little_endian());

        let alloc_hint = f.u32("alloc_hint")?;
        let context_id = f.u16("p_cont_id")?;
        let opnum = f.u16("opnum")?;
        let object_uuid = if header.packet_flags.has_object_uuid() {
            Some(f.uuid()?)
        } else {
            None
        };
        let stub_data = Bytes::copy_from_slice(f.rest(body_end));

        Ok(Self {
            header,
            alloc_hint,
            context_id,
            opnum,
            object_uuid,
            stub_data,
            auth_verifier,
        })
    }
}

/// Response PDU
#[derive(Debug, Clone)]
pub struct ResponsePdu {
    pub header: PduHeader,
    pub alloc_hint: u32,
    pub context_id: u16,
    pub cancel_count: u8,
    pub stub_data: Bytes,
    pub auth_verifier: Option<AuthVerifier>,
}

impl ResponsePdu {
    /// alloc_hint(4) + context_id(2) + cancel_count(1) + reserved(1)
    pub const BODY_HEADER_SIZE: usize = 8;

    pub fn new(call_id: u32, stub_data: Bytes) -> Self {
        Self {
            header: PduHeader::new(PacketType::Response, call_id),
            alloc_hint: stub_data.len() as u32,
            context_id: 0,
            cancel_count: 0,
            stub_data,
            auth_verifier: None,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(Self::BODY_HEADER_SIZE + self.stub_data.len());
        body.put_u32_le(self.alloc_hint);
        body.put_u16_le(self.context_id);
        body.put_u8(self.cancel_count);
        body.put_u8(0);
        body.put_slice(&self.stub_data);
        assemble(
            &self.header,
            &body,
            self.auth_verifier.as_ref(),
            STUB_AUTH_ALIGNMENT,
        )
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = PduHeader::decode(data)?;
        expect_type(&header, PacketType::Response)?;
        let (body_end, auth_verifier) = split_verifier(data, &header, PduHeader::SIZE)?;
        let mut f = Fields::new(data, PduHeader::SIZE, header.is_little_endian());

        let alloc_hint = f.u32("alloc_hint")?;
        let context_id = f.u16("p_cont_id")?;
        let cancel_count = f.u8("cancel_count")?;
        f.u8("reserved")?;
        let stub_data = Bytes::copy_from_slice(f.rest(body_end));

        Ok(Self {
            header,
            alloc_hint,
            context_id,
            cancel_count,
            stub_data,
            auth_verifier,
        })
    }
}

/// Fault PDU
#[derive(Debug, Clone)]
pub struct FaultPdu {
    pub header: PduHeader,
    pub alloc_hint: u32,
    pub context_id: u16,
    pub cancel_count: u8,
    pub status: u32,
}

impl FaultPdu {
    pub fn new(call_id: u32, status: u32) -> Self {
        Self {
            header: PduHeader::new(PacketType::Fault, call_id),
            alloc_hint: 0,
            context_id: 0,
            cancel_count: 0,
            status,
        }
    }

    pub fn encode(&self) -> Bytes {
        let mut body = BytesMut::with_capacity(16);
        body.put_u32_le(self.alloc_hint);
        body.put_u16_le(self.context_id);
        body.put_u8(self.cancel_count);
        body.put_u8(0);
        body.put_u32_le(self.status);
        body.put_u32_le(0);
        assemble(&self.header, &body, None, STUB_AUTH_ALIGNMENT)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = PduHeader::decode(data)?;
        expect_type(&header, PacketType::Fault)?;
        let mut f = Fields::new(data, PduHeader::SIZE, header.is_little_endian());
        let alloc_hint = f.u32("alloc_hint")?;
        let context_id = f.u16("p_cont_id")?;
        let cancel_count = f.u8("cancel_count")?;
        f.u8("reserved")?;
        let status = f.u32("status")?;
        Ok(Self {
            header,
            alloc_hint,
            context_id,
            cancel_count,
            status,
        })
    }
}

/// Third leg of a multi-leg authentication (MS-RPCE 2.2.2.10)
#[derive(Debug, Clone)]
pub struct Auth3Pdu {
    pub header: PduHeader,
    pub auth_verifier: AuthVerifier,
}

impl Auth3Pdu {
    pub fn new(call_id: u32, auth_verifier: AuthVerifier) -> Self {
        Self {
            header: PduHeader::new(PacketType::Auth3, call_id),
            auth_verifier,
        }
    }

    pub fn encode(&self) -> Bytes {
        // Four bytes of padding precede the verifier.
        assemble(
            &self.header,
            &[0u8; 4],
            Some(&self.auth_verifier),
            BIND_AUTH_ALIGNMENT,
        )
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = PduHeader::decode(data)?;
        expect_type(&header, PacketType::Auth3)?;
        let (_, verifier) = split_verifier(data, &header, PduHeader::SIZE)?;
        let auth_verifier = verifier.ok_or_else(|| invalid("auth3 without verifier"))?;
        Ok(Self {
            header,
            auth_verifier,
        })
    }
}

/// Any PDU the client side sends or receives
#[derive(Debug, Clone)]
pub enum Pdu {
    Bind(BindPdu),
    BindAck(BindAckPdu),
    BindNak(BindNakPdu),
    Request(RequestPdu),
    Response(ResponsePdu),
    Fault(FaultPdu),
    Auth3(Auth3Pdu),
}

impl Pdu {
    pub fn decode(data: &[u8]) -> Result<Self> {
        let header = PduHeader::decode(data)?;
        Ok(match header.packet_type {
            PacketType::Bind => Self::Bind(BindPdu::decode(data)?),
            PacketType::BindAck => Self::BindAck(BindAckPdu::decode(data)?),
            PacketType::BindNak => Self::BindNak(BindNakPdu::decode(data)?),
            PacketType::Request => Self::Request(RequestPdu::decode(data)?),
            PacketType::Response => Self::Response(ResponsePdu::decode(data)?),
            PacketType::Fault => Self::Fault(FaultPdu::decode(data)?),
            PacketType::Auth3 => Self::Auth3(Auth3Pdu::decode(data)?),
            other => {
                return Err(SessionError::Channel(ChannelError::UnexpectedPdu(other)));
            }
        })
    }

    pub fn encode(&self) -> Bytes {
        match self {
            Self::Bind(p) => p.encode(),
            Self::BindAck(p) => p.encode(),
            Self::BindNak(p) => p.encode(),
            Self::Request(p) => p.encode(),
            Self::Response(p) => p.encode(),
            Self::Fault(p) => p.encode(),
            Self::Auth3(p) => p.encode(),
        }
    }

    pub fn header(&self) -> &PduHeader {
        match self {
            Self::Bind(p) => &p.header,
            Self::BindAck(p) => &p.header,
            Self::BindNak(p) => &p.header,
            Self::Request(p) => &p.header,
            Self::Response(p) => &p.header,
            Self::Fault(p) => &p.header,
            Self::Auth3(p) => &p.header,
        }
    }

    pub fn call_id(&self) -> u32 {
        self.header().call_id
    }
}
