//! Endpoint mapper (EPM) client
//!
//! Well-known endpoint: `ncacn_ip_tcp:host[135]`, interface
//! `e1af8308-5d1f-11c9-91a4-08002b14a0fa` v3.0. Two operations are used:
//! `ept_map` to resolve one interface to an endpoint, and `ept_lookup` to
//! enumerate the map page by page with the entry handle as continuation.

use crate::config::SessionConfig;
use crate::credentials::Credentials;
use crate::descriptor::{InterfaceAlternative, ServiceDescriptor};
use crate::error::{ChannelError, ItemDecodeError, Result, SessionError};
use crate::ndr::{NdrReader, NdrWriter};
use crate::pdu::{SyntaxId, Uuid, NDR_SYNTAX};
use crate::resolver::EndpointMapper;
use crate::security::AuthLevel;
use crate::session::{Page, PageCodec, PagedCursor, PagedQuery, SessionBuilder};
use crate::transport::{normalize_pipe_name, TargetAddress, Transport, TransportFamily, EPM_PORT};
use async_trait::async_trait;
use bytes::{BufMut, Bytes, BytesMut};
use std::fmt;
use tracing::debug;

/// Endpoint mapper interface, v3.0
pub const EPM_INTERFACE: SyntaxId =
    SyntaxId::new(Uuid::from_u128(0xe1af8308_5d1f_11c9_91a4_08002b14a0fa), 3, 0);

pub mod opnum {
    pub const EPT_LOOKUP: u16 = 2;
    pub const EPT_MAP: u16 = 3;
}

/// `ept_s_not_registered`: no (more) entries match.
pub const EPT_S_NOT_REGISTERED: u32 = 0x16c9_a0d6;

const RPC_C_EP_ALL_ELTS: u32 = 0;
const RPC_C_EP_MATCH_BY_IF: u32 = 1;
const RPC_C_VERS_ALL: u32 = 1;

/// Towers requested per `ept_map` call.
const MAX_TOWERS: u32 = 4;
// object uuid, tower referent, annotation offset and length
const LOOKUP_ENTRY_MIN_SIZE: usize = 16 + 4 + 4 + 4;

/// Size of an RPC context handle (attributes + UUID).
pub const CONTEXT_HANDLE_SIZE: usize = 20;

/// Tower floor protocol identifiers
pub mod protocol_id {
    pub const TCP: u8 = 0x07;
    pub const UDP: u8 = 0x08;
    pub const IP: u8 = 0x09;
    pub const RPC_CO: u8 = 0x0b;
    pub const UUID: u8 = 0x0d;
    pub const NAMED_PIPE: u8 = 0x0f;
    pub const LRPC: u8 = 0x10;
    pub const NETBIOS: u8 = 0x11;
    pub const HTTP: u8 = 0x1f;
}

/// One tower floor: a left-hand protocol identifier and right-hand
/// address data
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Floor {
    pub lhs: Bytes,
    pub rhs: Bytes,
}

impl Floor {
    fn simple(protocol: u8, rhs: impl Into<Bytes>) -> Self {
        Self {
            lhs: Bytes::copy_from_slice(&[protocol]),
            rhs: rhs.into(),
        }
    }

    /// Interface or transfer syntax floor: UUID and major version on the
    /// left, minor version on the right.
    pub fn syntax(id: &SyntaxId) -> Self {
        let mut lhs = BytesMut::with_capacity(19);
        lhs.put_u8(protocol_id::UUID);
        lhs.put_slice(&id.uuid.to_bytes_le());
        lhs.put_u16_le(id.major_version());
        Self {
            lhs: lhs.freeze(),
            rhs: Bytes::copy_from_slice(&id.minor_version().to_le_bytes()),
        }
    }

    pub fn rpc_co() -> Self {
        Self::simple(protocol_id::RPC_CO, vec![0, 0])
    }

    /// Port in network byte order.
    pub fn tcp(port: u16) -> Self {
        Self::simple(protocol_id::TCP, port.to_be_bytes().to_vec())
    }

    pub fn ip(addr: [u8; 4]) -> Self {
        Self::simple(protocol_id::IP, addr.to_vec())
    }

    /// NUL-terminated pipe path; an empty name queries any pipe.
    pub fn named_pipe(pipe: &str) -> Self {
        let mut rhs = if pipe.is_empty() {
            Vec::new()
        } else {
            normalize_pipe_name(pipe).into_bytes()
        };
        rhs.push(0);
        Self::simple(protocol_id::NAMED_PIPE, rhs)
    }

    pub fn netbios(name: &str) -> Self {
        let mut rhs = name.as_bytes().to_vec();
        rhs.push(0);
        Self::simple(protocol_id::NETBIOS, rhs)
    }

    pub fn protocol(&self) -> u8 {
        self.lhs.first().copied().unwrap_or(0)
    }

    fn syntax_id(&self) -> Option<SyntaxId> {
        if self.protocol() != protocol_id::UUID || self.lhs.len() < 19 || self.rhs.len() < 2 {
            return None;
        }
        let uuid = Uuid::from_bytes_le(&self.lhs[1..17])?;
        let major = u16::from_le_bytes([self.lhs[17], self.lhs[18]]);
        let minor = u16::from_le_bytes([self.rhs[0], self.rhs[1]]);
        Some(SyntaxId::new(uuid, major, minor))
    }

    fn rhs_string(&self) -> String {
        let end = self.rhs.iter().position(|&b| b == 0).unwrap_or(self.rhs.len());
        String::from_utf8_lossy(&self.rhs[..end]).into_owned()
    }
}

/// A protocol tower, as carried in `twr_t`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Tower {
    pub floors: Vec<Floor>,
}

impl Tower {
    /// Query tower for `ept_map`: interface and transfer syntax floors
    /// followed by wildcard address floors for `family`.
    pub fn query(alternative: &InterfaceAlternative, family: TransportFamily) -> Self {
        let mut floors = vec![
            Floor::syntax(&alternative.interface),
            Floor::syntax(&alternative.transfer_syntax),
            Floor::rpc_co(),
        ];
        match family {
            TransportFamily::Tcp => floors.extend([Floor::tcp(0), Floor::ip([0; 4])]),
            TransportFamily::NamedPipe => floors.extend([Floor::named_pipe(""), Floor::netbios("")]),
        }
        Self { floors }
    }

    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u16_le(self.floors.len() as u16);
        for floor in &self.floors {
            buf.put_u16_le(floor.lhs.len() as u16);
            buf.put_slice(&floor.lhs);
            buf.put_u16_le(floor.rhs.len() as u16);
            buf.put_slice(&floor.rhs);
        }
        buf.freeze()
    }

    pub fn decode(data: &[u8]) -> std::result::Result<Self, ItemDecodeError> {
        let mut rest = data;
        let mut take = |len: usize, what: &str| -> std::result::Result<Bytes, ItemDecodeError> {
            if rest.len() < len {
                return Err(ItemDecodeError::new(format!(
                    "tower truncated in {} ({} of {} bytes)",
                    what,
                    rest.len(),
                    len
                )));
            }
            let (head, tail) = rest.split_at(len);
            rest = tail;
            Ok(Bytes::copy_from_slice(head))
        };
        let le16 = |b: &Bytes| u16::from_le_bytes([b[0], b[1]]) as usize;

        let count = le16(&take(2, "floor count")?);
        let mut floors = Vec::with_capacity(count.min(16));
        for _ in 0..count {
            let lhs_len = le16(&take(2, "lhs length")?);
            let lhs = take(lhs_len, "lhs")?;
            let rhs_len = le16(&take(2, "rhs length")?);
            let rhs = take(rhs_len, "rhs")?;
            if lhs.is_empty() {
                return Err(ItemDecodeError::new("tower floor without protocol id"));
            }
            floors.push(Floor { lhs, rhs });
        }
        Ok(Self { floors })
    }

    pub fn interface(&self) -> Option<SyntaxId> {
        self.floors.first().and_then(Floor::syntax_id)
    }

    pub fn transfer_syntax(&self) -> Option<SyntaxId> {
        self.floors.get(1).and_then(Floor::syntax_id)
    }

    fn floor(&self, protocol: u8) -> Option<&Floor> {
        self.floors.iter().find(|f| f.protocol() == protocol)
    }

    /// Protocol sequence name, e.g. `ncacn_ip_tcp`.
    pub fn protocol_sequence(&self) -> Option<&'static str> {
        self.floors.iter().skip(3).find_map(|f| match f.protocol() {
            protocol_id::TCP => Some("ncacn_ip_tcp"),
            protocol_id::UDP => Some("ncadg_ip_udp"),
            protocol_id::NAMED_PIPE => Some("ncacn_np"),
            protocol_id::LRPC => Some("ncalrpc"),
            protocol_id::HTTP => Some("ncacn_http"),
            _ => None,
        })
    }

    /// Endpoint part of the binding, e.g. `135` or `\pipe\lsass`.
    pub fn endpoint(&self) -> Option<String> {
        let floor = self.floors.iter().skip(3).find(|f| {
            matches!(
                f.protocol(),
                protocol_id::TCP
                    | protocol_id::UDP
                    | protocol_id::HTTP
                    | protocol_id::NAMED_PIPE
                    | protocol_id::LRPC
            )
        })?;
        match floor.protocol() {
            protocol_id::TCP | protocol_id::UDP | protocol_id::HTTP if floor.rhs.len() >= 2 => {
                Some(u16::from_be_bytes([floor.rhs[0], floor.rhs[1]]).to_string())
            }
            protocol_id::NAMED_PIPE | protocol_id::LRPC => Some(floor.rhs_string()),
            _ => None,
        }
    }

    fn host(&self) -> Option<String> {
        if let Some(ip) = self.floor(protocol_id::IP).filter(|f| f.rhs.len() >= 4) {
            return Some(format!("{}.{}.{}.{}", ip.rhs[0], ip.rhs[1], ip.rhs[2], ip.rhs[3]));
        }
        self.floor(protocol_id::NETBIOS).map(Floor::rhs_string)
    }

    /// String binding for display, e.g. `ncacn_ip_tcp:10.0.0.5[49667]`.
    pub fn binding(&self) -> String {
        format!(
            "{}:{}[{}]",
            self.protocol_sequence().unwrap_or("unknown"),
            self.host().unwrap_or_default(),
            self.endpoint().unwrap_or_default()
        )
    }

    /// A connectable address when the tower describes `family`. Unspecified
    /// hosts (`0.0.0.0` or an empty NetBIOS name) become `queried_host`.
    pub fn to_address(&self, family: TransportFamily, queried_host: &str) -> Option<TargetAddress> {
        let host = self
            .host()
            .filter(|h| !h.is_empty() && h != "0.0.0.0")
            .unwrap_or_else(|| queried_host.to_string());
        match family {
            TransportFamily::Tcp => {
                let floor = self.floor(protocol_id::TCP).filter(|f| f.rhs.len() >= 2)?;
                let port = u16::from_be_bytes([floor.rhs[0], floor.rhs[1]]);
                (port != 0).then(|| TargetAddress::tcp(host, port))
            }
            TransportFamily::NamedPipe => {
                let pipe = self.floor(protocol_id::NAMED_PIPE)?.rhs_string();
                (!pipe.is_empty()).then(|| TargetAddress::pipe(host, &pipe))
            }
        }
    }
}

fn put_tower(writer: &mut NdrWriter, tower: &Tower) {
    writer.put_counted_octets(&tower.encode());
    writer.align(4);
}

fn get_tower(reader: &mut NdrReader<'_>) -> Result<Bytes> {
    let octets = Bytes::copy_from_slice(reader.get_counted_octets()?);
    reader.align(4)?;
    Ok(octets)
}

fn malformed(what: impl fmt::Display) -> SessionError {
    ChannelError::MalformedPage(what.to_string()).into()
}

/// Conformant-varying array header: max_count, offset, actual_count.
/// `actual_count` elements of at least `element_size` bytes must still fit
/// in the stub.
fn get_varying_count(reader: &mut NdrReader<'_>, limit: u32, element_size: usize) -> Result<usize> {
    let max_count = reader.get_u32()?;
    let offset = reader.get_u32()?;
    let actual = reader.get_u32()?;
    if offset != 0 || actual > max_count || actual > limit {
        return Err(malformed(format!(
            "array bounds max={} offset={} actual={}",
            max_count, offset, actual
        )));
    }
    let actual = actual as usize;
    if actual.saturating_mul(element_size) > reader.remaining() {
        return Err(malformed(format!(
            "{} elements do not fit in {} remaining bytes",
            actual,
            reader.remaining()
        )));
    }
    Ok(actual)
}

/// `ept_map` request stub
pub fn encode_map_request(tower: &Tower, max_towers: u32) -> Bytes {
    let mut w = NdrWriter::new();
    w.put_referent();
    w.put_uuid(&Uuid::NIL);
    w.put_referent();
    put_tower(&mut w, tower);
    w.put_bytes(&[0u8; CONTEXT_HANDLE_SIZE]);
    w.put_u32(max_towers);
    w.finish()
}

/// Decoded `ept_map` response
#[derive(Debug, Clone)]
pub struct MapResponse {
    pub towers: Vec<Tower>,
    pub status: u32,
}

pub fn decode_map_response(stub: &[u8]) -> Result<MapResponse> {
    let mut r = NdrReader::new(stub);
    r.get_bytes(CONTEXT_HANDLE_SIZE)?;
    let num_towers = r.get_u32()?;
    let count = get_varying_count(&mut r, num_towers.min(MAX_TOWERS), 4)?;
    let mut referents = Vec::with_capacity(count);
    for _ in 0..count {
        referents.push(r.get_u32()?);
    }
    let mut towers = Vec::with_capacity(count);
    for referent in referents {
        if referent == 0 {
            continue;
        }
        let octets = get_tower(&mut r)?;
        match Tower::decode(&octets) {
            Ok(tower) => towers.push(tower),
            Err(err) => debug!("ignoring undecodable ept_map tower: {}", err),
        }
    }
    let status = r.get_u32()?;
    Ok(MapResponse { towers, status })
}

/// One endpoint map entry returned by `ept_lookup`
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EpmEntry {
    pub object: Uuid,
    pub tower: Tower,
    pub annotation: String,
}

impl EpmEntry {
    pub fn interface(&self) -> Option<SyntaxId> {
        self.tower.interface()
    }

    pub fn binding(&self) -> String {
        self.tower.binding()
    }
}

/// Paged `ept_lookup`. The query filter, when non-empty, is an interface
/// UUID to match; the entry handle is the continuation token.
#[derive(Debug, Clone, Copy, Default)]
pub struct EpmLookupCodec;

impl PageCodec for EpmLookupCodec {
    type Item = EpmEntry;

    fn opnum(&self) -> u16 {
        opnum::EPT_LOOKUP
    }

    fn encode_request(&self, query: &PagedQuery, cursor: &PagedCursor) -> Result<Bytes> {
        let interface = match query.filter.trim() {
            "" => None,
            filter => Some(filter.parse::<Uuid>()?),
        };

        let mut w = NdrWriter::new();
        match interface {
            Some(uuid) => {
                w.put_u32(RPC_C_EP_MATCH_BY_IF);
                w.put_null_pointer();
                w.put_referent();
                w.put_uuid(&uuid);
                w.put_u16(0);
                w.put_u16(0);
            }
            None => {
                w.put_u32(RPC_C_EP_ALL_ELTS);
                w.put_null_pointer();
                w.put_null_pointer();
            }
        }
        w.put_u32(RPC_C_VERS_ALL);
        match cursor.token().len() {
            0 => w.put_bytes(&[0u8; CONTEXT_HANDLE_SIZE]),
            CONTEXT_HANDLE_SIZE => w.put_bytes(cursor.token()),
            len => {
                return Err(SessionError::InvalidInput(format!(
                    "entry handle must be {} bytes, got {}",
                    CONTEXT_HANDLE_SIZE, len
                )))
            }
        }
        w.put_u32(cursor.page_size().max(1));
        Ok(w.finish())
    }

    fn decode_page(&self, stub: Bytes) -> Result<Page<EpmEntry>> {
        let mut r = NdrReader::new(&stub);
        let handle = Bytes::copy_from_slice(r.get_bytes(CONTEXT_HANDLE_SIZE)?);
        let num_ents = r.get_u32()?;
        let count = get_varying_count(&mut r, num_ents, LOOKUP_ENTRY_MIN_SIZE)?;

        let mut fixed = Vec::with_capacity(count);
        for _ in 0..count {
            let object = r.get_uuid()?;
            let tower_referent = r.get_u32()?;
            let offset = r.get_u32()?;
            let actual = r.get_u32()? as usize;
            if offset != 0 {
                return Err(malformed("annotation offset"));
            }
            let raw = r.get_bytes(actual)?;
            let end = raw.iter().position(|&b| b == 0).unwrap_or(raw.len());
            let annotation = String::from_utf8_lossy(&raw[..end]).into_owned();
            r.align(4)?;
            fixed.push((object, tower_referent, annotation));
        }

        let mut items = Vec::with_capacity(count);
        for (object, tower_referent, annotation) in fixed {
            if tower_referent == 0 {
                items.push(Err(ItemDecodeError::new(format!(
                    "entry {} has no tower",
                    object
                ))));
                continue;
            }
            let octets = get_tower(&mut r)?;
            items.push(Tower::decode(&octets).map(|tower| EpmEntry {
                object,
                tower,
                annotation,
            }));
        }

        let status = r.get_u32()?;
        let last = match status {
            0 => handle.iter().all(|&b| b == 0),
            EPT_S_NOT_REGISTERED => true,
            other => return Err(SessionError::RemoteFault { status: other }),
        };
        Ok(Page {
            items,
            token: handle,
            last,
        })
    }
}

/// Descriptor of the endpoint mapper itself, bound over TCP.
pub fn epm_descriptor() -> Result<ServiceDescriptor> {
    ServiceDescriptor::builder(TransportFamily::Tcp)
        .alternative(EPM_INTERFACE, NDR_SYNTAX)
        .build()
}

/// Resolves endpoints through the target's endpoint mapper over an
/// anonymous session on port 135.
pub struct EpmMapper<T> {
    transport: T,
    config: SessionConfig,
    port: u16,
}

impl<T> EpmMapper<T>
where
    T: Transport + Clone + 'static,
{
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            config: SessionConfig::default(),
            port: EPM_PORT,
        }
    }

    pub fn with_config(mut self, config: SessionConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.port = port;
        self
    }

    async fn ept_map(
        &self,
        host: &str,
        alternative: &InterfaceAlternative,
        family: TransportFamily,
    ) -> Result<MapResponse> {
        let mut session = SessionBuilder::new(epm_descriptor()?, Credentials::anonymous())
            .config(self.config.clone().with_auth_level(AuthLevel::None))
            .transport(self.transport.clone())
            .connect(TargetAddress::tcp(host, self.port))
            .await?;
        let stub = encode_map_request(&Tower::query(alternative, family), MAX_TOWERS);
        let result = session.request(opnum::EPT_MAP, stub).await;
        session.close().await;
        decode_map_response(&result?)
    }
}

#[async_trait]
impl<T> EndpointMapper for EpmMapper<T>
where
    T: Transport + Clone + 'static,
{
    async fn map(
        &mut self,
        host: &str,
        alternative: &InterfaceAlternative,
        family: TransportFamily,
    ) -> Result<Option<TargetAddress>> {
        let response = self.ept_map(host, alternative, family).await?;
        match response.status {
            0 => {}
            EPT_S_NOT_REGISTERED => return Ok(None),
            status => return Err(SessionError::RemoteFault { status }),
        }
        let address = response
            .towers
            .iter()
            .find_map(|tower| tower.to_address(family, host));
        debug!(
            "ept_map {} on {}: {} tower(s), resolved {:?}",
            alternative.interface,
            host,
            response.towers.len(),
            address.as_ref().map(ToString::to_string)
        );
        Ok(address)
    }
}

#[cfg(any(test, feature = "test-util"))]
pub use server_side::*;

/// Server-side halves of the codecs, for scripted endpoint mappers.
#[cfg(any(test, feature = "test-util"))]
mod server_side {
    use super::*;

    /// Fields of an `ept_lookup` request
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct LookupRequest {
        pub interface: Option<Uuid>,
        pub handle: [u8; CONTEXT_HANDLE_SIZE],
        pub max_entries: u32,
    }

    pub fn decode_lookup_request(stub: &[u8]) -> Result<LookupRequest> {
        let mut r = NdrReader::new(stub);
        let _inquiry_type = r.get_u32()?;
        if r.get_u32()? != 0 {
            r.get_uuid()?;
        }
        let interface = if r.get_u32()? != 0 {
            let uuid = r.get_uuid()?;
            r.get_u16()?;
            r.get_u16()?;
            Some(uuid)
        } else {
            None
        };
        let _vers_option = r.get_u32()?;
        let mut handle = [0u8; CONTEXT_HANDLE_SIZE];
        handle.copy_from_slice(r.get_bytes(CONTEXT_HANDLE_SIZE)?);
        let max_entries = r.get_u32()?;
        Ok(LookupRequest {
            interface,
            handle,
            max_entries,
        })
    }

    /// Entry as the server writes it; the tower is raw octets so tests can
    /// plant corrupt ones.
    #[derive(Debug, Clone)]
    pub struct RawEntry {
        pub object: Uuid,
        pub tower: Option<Bytes>,
        pub annotation: String,
    }

    pub fn encode_lookup_response(
        handle: &[u8; CONTEXT_HANDLE_SIZE],
        entries: &[RawEntry],
        status: u32,
    ) -> Bytes {
        let mut w = NdrWriter::new();
        w.put_bytes(handle);
        w.put_u32(entries.len() as u32);
        w.put_u32(entries.len() as u32);
        w.put_u32(0);
        w.put_u32(entries.len() as u32);
        for entry in entries {
            w.put_uuid(&entry.object);
            match entry.tower {
                Some(_) => w.put_referent(),
                None => w.put_null_pointer(),
            }
            let mut annotation = entry.annotation.as_bytes().to_vec();
            annotation.push(0);
            w.put_u32(0);
            w.put_u32(annotation.len() as u32);
            w.put_bytes(&annotation);
            w.align(4);
        }
        for tower in entries.iter().filter_map(|e| e.tower.as_ref()) {
            w.put_counted_octets(tower);
            w.align(4);
        }
        w.put_u32(status);
        w.finish()
    }

    /// Returns the query tower of an `ept_map` request.
    pub fn decode_map_request(stub: &[u8]) -> Result<Tower> {
        let mut r = NdrReader::new(stub);
        if r.get_u32()? != 0 {
            r.get_uuid()?;
        }
        r.get_u32()?;
        let octets = get_tower(&mut r)?;
        Tower::decode(&octets).map_err(|e| SessionError::InvalidInput(e.to_string()))
    }

    pub fn encode_map_response(towers: &[Tower], status: u32) -> Bytes {
        let mut w = NdrWriter::new();
        w.put_bytes(&[0u8; CONTEXT_HANDLE_SIZE]);
        w.put_u32(towers.len() as u32);
        w.put_u32(MAX_TOWERS.max(towers.len() as u32));
        w.put_u32(0);
        w.put_u32(towers.len() as u32);
        for _ in towers {
            w.put_referent();
        }
        for tower in towers {
            put_tower(&mut w, tower);
        }
        w.put_u32(status);
        w.finish()
    }

    /// Tower a server registers for `alternative` at a TCP port.
    pub fn tcp_tower(alternative: &InterfaceAlternative, port: u16, ip: [u8; 4]) -> Tower {
        Tower {
            floors: vec![
                Floor::syntax(&alternative.interface),
                Floor::syntax(&alternative.transfer_syntax),
                Floor::rpc_co(),
                Floor::tcp(port),
                Floor::ip(ip),
            ],
        }
    }

    /// Tower a server registers for `alternative` on a named pipe.
    pub fn pipe_tower(alternative: &InterfaceAlternative, pipe: &str, netbios: &str) -> Tower {
        Tower {
            floors: vec![
                Floor::syntax(&alternative.interface),
                Floor::syntax(&alternative.transfer_syntax),
                Floor::rpc_co(),
                Floor::named_pipe(pipe),
                Floor::netbios(netbios),
            ],
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const LSARPC: SyntaxId =
        SyntaxId::new(Uuid::from_u128(0x12345778_1234_abcd_ef00_0123456789ab), 0, 0);

    fn lsarpc() -> InterfaceAlternative {
        InterfaceAlternative::ndr(LSARPC)
    }

    #[test]
    fn test_query_tower_layout() {
        let tower = Tower::query(&lsarpc(), TransportFamily::Tcp);
        let protocols: Vec<u8> = tower.floors.iter().map(Floor::protocol).collect();
        assert_eq!(
            protocols,
            vec![
                protocol_id::UUID,
                protocol_id::UUID,
                protocol_id::RPC_CO,
                protocol_id::TCP,
                protocol_id::IP
            ]
        );
        assert_eq!(tower.interface(), Some(LSARPC));
        assert_eq!(tower.transfer_syntax(), Some(NDR_SYNTAX));
        assert_eq!(Tower::decode(&tower.encode()).unwrap(), tower);
    }

    #[test]
    fn test_tower_addresses() {
        let tcp = tcp_tower(&lsarpc(), 49667, [0, 0, 0, 0]);
        assert_eq!(
            tcp.to_address(TransportFamily::Tcp, "dc01"),
            Some(TargetAddress::tcp("dc01", 49667))
        );
        assert_eq!(tcp.to_address(TransportFamily::NamedPipe, "dc01"), None);
        assert_eq!(tcp.binding(), "ncacn_ip_tcp:0.0.0.0[49667]");

        let routed = tcp_tower(&lsarpc(), 49667, [10, 0, 0, 5]);
        assert_eq!(
            routed.to_address(TransportFamily::Tcp, "dc01"),
            Some(TargetAddress::tcp("10.0.0.5", 49667))
        );

        let pipe = pipe_tower(&lsarpc(), "lsass", "DC01");
        assert_eq!(
            pipe.to_address(TransportFamily::NamedPipe, "10.0.0.5"),
            Some(TargetAddress::pipe("DC01", "lsass"))
        );
        assert_eq!(pipe.binding(), r"ncacn_np:DC01[\pipe\lsass]");
    }

    #[test]
    fn test_truncated_tower_is_an_item_error() {
        let encoded = tcp_tower(&lsarpc(), 135, [0; 4]).encode();
        assert!(Tower::decode(&encoded[..encoded.len() - 3]).is_err());
        assert!(Tower::decode(&[]).is_err());
    }

    #[test]
    fn test_map_request_carries_query_tower() {
        let query = Tower::query(&lsarpc(), TransportFamily::NamedPipe);
        let stub = encode_map_request(&query, MAX_TOWERS);
        assert_eq!(decode_map_request(&stub).unwrap(), query);
    }

    #[test]
    fn test_map_response_decoding() {
        let towers = vec![
            tcp_tower(&lsarpc(), 49667, [0; 4]),
            tcp_tower(&lsarpc(), 49668, [0; 4]),
        ];
        let decoded = decode_map_response(&encode_map_response(&towers, 0)).unwrap();
        assert_eq!(decoded.status, 0);
        assert_eq!(decoded.towers, towers);

        let empty = decode_map_response(&encode_map_response(&[], EPT_S_NOT_REGISTERED)).unwrap();
        assert!(empty.towers.is_empty());
        assert_eq!(empty.status, EPT_S_NOT_REGISTERED);
    }

    #[test]
    fn test_lookup_request_forwards_handle() {
        let mut cursor = PagedCursor::new(25);
        let handle: Bytes = (1..=20u8).collect::<Vec<_>>().into();
        cursor.advance(handle.clone(), false);

        let query = PagedQuery::new(LSARPC.uuid.to_string(), 25);
        let stub = EpmLookupCodec.encode_request(&query, &cursor).unwrap();
        let request = decode_lookup_request(&stub).unwrap();
        assert_eq!(&request.handle[..], &handle[..]);
        assert_eq!(request.interface, Some(LSARPC.uuid));
        assert_eq!(request.max_entries, 25);

        let all = EpmLookupCodec
            .encode_request(&PagedQuery::new("", 10), &PagedCursor::new(10))
            .unwrap();
        let request = decode_lookup_request(&all).unwrap();
        assert_eq!(request.interface, None);
        assert_eq!(request.handle, [0u8; CONTEXT_HANDLE_SIZE]);

        assert!(EpmLookupCodec
            .encode_request(&PagedQuery::new("not-a-uuid", 10), &PagedCursor::new(10))
            .is_err());
    }

    #[test]
    fn test_lookup_page_isolates_corrupt_tower() {
        let good = tcp_tower(&lsarpc(), 49667, [10, 0, 0, 5]).encode();
        let entries = vec![
            RawEntry {
                object: Uuid::NIL,
                tower: Some(good.clone()),
                annotation: "LSA".into(),
            },
            RawEntry {
                object: Uuid::NIL,
                tower: Some(good.slice(..7)),
                annotation: "broken".into(),
            },
            RawEntry {
                object: Uuid::NIL,
                tower: Some(good),
                annotation: "LSA again".into(),
            },
        ];
        let handle = [7u8; CONTEXT_HANDLE_SIZE];
        let page = EpmLookupCodec
            .decode_page(encode_lookup_response(&handle, &entries, 0))
            .unwrap();
        assert_eq!(page.items.len(), 3);
        assert!(page.items[0].is_ok());
        assert!(page.items[1].is_err());
        assert_eq!(page.items[2].as_ref().unwrap().annotation, "LSA again");
        assert_eq!(&page.token[..], &handle[..]);
        assert!(!page.last);
    }

    #[test]
    fn test_oversized_array_count_is_malformed() {
        let mut stub = vec![0u8; CONTEXT_HANDLE_SIZE];
        for value in [u32::MAX, u32::MAX, 0, u32::MAX] {
            stub.extend_from_slice(&value.to_le_bytes());
        }

        let err = EpmLookupCodec.decode_page(Bytes::from(stub.clone())).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Channel(ChannelError::MalformedPage(_))
        ));

        let err = decode_map_response(&stub).unwrap_err();
        assert!(matches!(
            err,
            SessionError::Channel(ChannelError::MalformedPage(_))
        ));

        // More towers than were asked for.
        let towers: Vec<_> = (0..5)
            .map(|i| tcp_tower(&lsarpc(), 49660 + i, [0; 4]))
            .collect();
        assert!(decode_map_response(&encode_map_response(&towers, 0)).is_err());
    }

    #[test]
    fn test_lookup_final_page() {
        let page = EpmLookupCodec
            .decode_page(encode_lookup_response(
                &[0u8; CONTEXT_HANDLE_SIZE],
                &[],
                EPT_S_NOT_REGISTERED,
            ))
            .unwrap();
        assert!(page.items.is_empty());
        assert!(page.last);

        let err = EpmLookupCodec
            .decode_page(encode_lookup_response(&[1u8; CONTEXT_HANDLE_SIZE], &[], 5))
            .unwrap_err();
        assert!(matches!(err, SessionError::RemoteFault { status: 5 }));
    }
}
