//! Request/response fragmentation (C706 12.5)
//!
//! ```text
//! max_frag size limit (e.g. 4280 bytes)
//! ├── PDU header (16 bytes)
//! ├── request/response body header (8 bytes)
//! ├── stub data fragment
//! ├── auth padding (up to 15 bytes, if authenticated)
//! └── auth verifier (8 + signature bytes, if authenticated)
//! ```

use crate::error::{ChannelError, Result};
use crate::pdu::{PacketFlags, PduHeader, RequestPdu, STUB_AUTH_ALIGNMENT};
use crate::security::AuthVerifier;
use bytes::{Bytes, BytesMut};

/// Stub bytes that fit in one fragment of `max_frag` bytes when each
/// fragment carries a signature of `signature_len` bytes.
pub fn max_stub_size(max_frag: u16, signature_len: usize) -> usize {
    let auth_overhead = if signature_len > 0 {
        (STUB_AUTH_ALIGNMENT - 1) + AuthVerifier::HEADER_SIZE + signature_len
    } else {
        0
    };
    let overhead = PduHeader::SIZE + RequestPdu::BODY_HEADER_SIZE + auth_overhead;
    (max_frag as usize).saturating_sub(overhead)
}

/// Splits a stub into fragment-sized chunks with their first/last flags.
/// An empty stub still yields a single complete fragment.
pub fn split_stub(stub: &Bytes, max_stub: usize) -> Vec<(Bytes, PacketFlags)> {
    if stub.len() <= max_stub || max_stub == 0 {
        return vec![(stub.clone(), PacketFlags::complete())];
    }
    let mut fragments = Vec::with_capacity(stub.len().div_ceil(max_stub));
    let mut offset = 0;
    while offset < stub.len() {
        let end = (offset + max_stub).min(stub.len());
        let flags = PacketFlags::fragment(offset == 0, end == stub.len());
        fragments.push((stub.slice(offset..end), flags));
        offset = end;
    }
    fragments
}

/// Largest reassembled stub accepted unless configured otherwise.
pub const DEFAULT_MAX_STUB_SIZE: usize = 16 * 1024 * 1024;

/// Reassembles the stub of a fragmented response for one call
pub struct FragmentAssembler {
    call_id: u32,
    stub_data: BytesMut,
    received_first: bool,
    max_stub_size: usize,
}

impl FragmentAssembler {
    pub fn new(call_id: u32) -> Self {
        Self {
            call_id,
            stub_data: BytesMut::new(),
            received_first: false,
            max_stub_size: DEFAULT_MAX_STUB_SIZE,
        }
    }

    pub fn with_max_stub_size(mut self, max_stub_size: usize) -> Self {
        self.max_stub_size = max_stub_size;
        self
    }

    /// Adds one fragment. Returns the whole stub once the last fragment
    /// has arrived.
    pub fn add_fragment(
        &mut self,
        header: &PduHeader,
        stub: &[u8],
        alloc_hint: u32,
    ) -> Result<Option<Bytes>> {
        if header.call_id != self.call_id {
            return Err(ChannelError::CallIdMismatch {
                expected: self.call_id,
                got: header.call_id,
            }
            .into());
        }

        let flags = header.packet_flags;
        if flags.is_first_frag() {
            if self.received_first {
                return Err(ChannelError::Fragment("duplicate first fragment".into()).into());
            }
            self.received_first = true;
            // The hint is the peer's word; never reserve past the limit.
            self.stub_data.reserve((alloc_hint as usize).min(self.max_stub_size));
        } else if !self.received_first {
            return Err(ChannelError::Fragment("fragment before first fragment".into()).into());
        }

        let total = self.stub_data.len() + stub.len();
        if total > self.max_stub_size {
            return Err(ChannelError::Fragment(format!(
                "reassembled stub of {} bytes exceeds limit of {}",
                total, self.max_stub_size
            ))
            .into());
        }
        self.stub_data.extend_from_slice(stub);

        if flags.is_last_frag() {
            Ok(Some(std::mem::take(&mut self.stub_data).freeze()))
        } else {
            Ok(None)
        }
    }
}
