//! Request/response and paged exchanges on an established session
//!
//! Calls are strictly sequential: every method takes `&mut Session`.

use super::negotiator::within_exchange_timeout;
use super::{Session, AUTH_CONTEXT_ID, PRESENTATION_CONTEXT_ID};
use crate::error::{ChannelError, ItemDecodeError, Result, SessionError};
use crate::fragmentation::{max_stub_size, split_stub, FragmentAssembler};
use crate::pdu::{Pdu, RequestPdu};
use crate::security::AuthVerifier;
use bytes::Bytes;
use tracing::{debug, trace, warn};

/// What a paged query asks for. The driver never interprets these fields;
/// the [`PageCodec`] does.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PagedQuery {
    pub filter: String,
    pub attributes: Vec<String>,
    /// Items requested per page. A hint; servers may return fewer.
    pub page_size: u32,
}

impl PagedQuery {
    pub fn new(filter: impl Into<String>, page_size: u32) -> Self {
        Self {
            filter: filter.into(),
            attributes: Vec::new(),
            page_size,
        }
    }

    pub fn with_attributes<I, S>(mut self, attributes: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.attributes = attributes.into_iter().map(Into::into).collect();
        self
    }
}

/// Position in a paged result set.
///
/// The token is opaque and handed back to the codec exactly as the server
/// produced it. Once exhausted, no further page is requested.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PagedCursor {
    token: Bytes,
    page_size: u32,
    exhausted: bool,
}

impl PagedCursor {
    pub fn new(page_size: u32) -> Self {
        Self {
            token: Bytes::new(),
            page_size,
            exhausted: false,
        }
    }

    pub fn token(&self) -> &Bytes {
        &self.token
    }

    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    pub fn is_exhausted(&self) -> bool {
        self.exhausted
    }

    /// Records the continuation a page carried.
    pub fn advance(&mut self, token: Bytes, last: bool) {
        self.exhausted = last || token.is_empty();
        self.token = token;
    }
}

/// One decoded page. Items that failed to decode keep their slot so the
/// failure can be reported in server order.
#[derive(Debug)]
pub struct Page<T> {
    pub items: Vec<std::result::Result<T, ItemDecodeError>>,
    pub token: Bytes,
    pub last: bool,
}

/// Wire codec for one paged operation
pub trait PageCodec {
    type Item;

    fn opnum(&self) -> u16;

    fn encode_request(&self, query: &PagedQuery, cursor: &PagedCursor) -> Result<Bytes>;

    /// Errors here are page-level and abort the query; per-item problems
    /// belong in [`Page::items`].
    fn decode_page(&self, stub: Bytes) -> Result<Page<Self::Item>>;
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PagedSummary {
    pub pages: usize,
    pub delivered: usize,
    pub skipped: usize,
}

impl Session {
    /// Sends one request and returns the reassembled response stub.
    ///
    /// A fault PDU becomes [`SessionError::RemoteFault`] and leaves the
    /// session usable. Any channel-level failure, including the exchange
    /// timeout, moves the session to `Failed`.
    pub async fn request(&mut self, opnum: u16, payload: Bytes) -> Result<Bytes> {
        self.ensure_established()?;
        let limit = self.config.exchange_timeout;
        match within_exchange_timeout(limit, self.call(opnum, payload)).await {
            Ok(stub) => Ok(stub),
            Err(err) if err.is_fatal() => {
                warn!("request opnum={} failed, session is unusable: {}", opnum, err);
                Err(self.fail(err))
            }
            Err(err) => Err(err),
        }
    }

    async fn call(&mut self, opnum: u16, payload: Bytes) -> Result<Bytes> {
        let call_id = self.next_call_id();
        let level = self.negotiated.level;
        let auth_type = self.authenticator.auth_type();
        let protect = level.requires_signing() && self.security.is_some();
        let signature_size = match (&self.security, protect) {
            (Some(context), true) => context.signature_size(),
            _ => 0,
        };

        let fragments = split_stub(
            &payload,
            max_stub_size(self.negotiated.max_xmit_frag, signature_size),
        );
        debug!(
            "sending request: call_id={}, opnum={}, stub_len={}, fragments={}",
            call_id,
            opnum,
            payload.len(),
            fragments.len()
        );

        for (chunk, flags) in fragments {
            let mut request = RequestPdu::new(call_id, opnum, chunk);
            request.alloc_hint = payload.len() as u32;
            request.context_id = PRESENTATION_CONTEXT_ID;
            request.header.packet_flags = flags;
            if protect {
                let context = self.security.as_mut().ok_or(SessionError::SessionClosed)?;
                let (stub, signature) = context.wrap(level, request.stub_data)?;
                request.stub_data = stub;
                request.auth_verifier =
                    Some(AuthVerifier::new(auth_type, level, AUTH_CONTEXT_ID, signature));
            }
            trace!("request fragment: call_id={}, flags={:?}", call_id, flags);
            self.send(request.encode()).await?;
        }

        let mut assembler =
            FragmentAssembler::new(call_id).with_max_stub_size(self.config.max_stub_size);
        loop {
            let data = self.receive().await?;
            match Pdu::decode(&data)? {
                Pdu::Response(response) => {
                    let stub = if protect {
                        let verifier = response.auth_verifier.ok_or_else(|| {
                            ChannelError::Protection("response carries no verifier".into())
                        })?;
                        let context = self.security.as_mut().ok_or(SessionError::SessionClosed)?;
                        context.unwrap(level, response.stub_data, &verifier.auth_value)?
                    } else {
                        response.stub_data
                    };
                    if let Some(whole) =
                        assembler.add_fragment(&response.header, &stub, response.alloc_hint)?
                    {
                        debug!("response: call_id={}, stub_len={}", call_id, whole.len());
                        return Ok(whole);
                    }
                }
                Pdu::Fault(fault) => {
                    if fault.header.call_id != call_id {
                        return Err(ChannelError::CallIdMismatch {
                            expected: call_id,
                            got: fault.header.call_id,
                        }
                        .into());
                    }
                    debug!("fault: call_id={}, status=0x{:08x}", call_id, fault.status);
                    return Err(SessionError::RemoteFault {
                        status: fault.status,
                    });
                }
                other => {
                    return Err(ChannelError::UnexpectedPdu(other.header().packet_type).into())
                }
            }
        }
    }

    /// Runs a paged query, handing every item to `on_item` in server order
    /// before the next page is requested.
    ///
    /// Items that fail to decode, and items `on_item` rejects, are logged
    /// and skipped. Page-level and channel-level failures abort the query.
    pub async fn paged_query<C, F>(
        &mut self,
        codec: &C,
        query: &PagedQuery,
        mut on_item: F,
    ) -> Result<PagedSummary>
    where
        C: PageCodec,
        F: FnMut(C::Item) -> std::result::Result<(), ItemDecodeError>,
    {
        let mut cursor = PagedCursor::new(query.page_size);
        let mut summary = PagedSummary::default();

        while !cursor.is_exhausted() {
            let stub = codec.encode_request(query, &cursor)?;
            let response = self.request(codec.opnum(), stub).await?;
            let page = match codec.decode_page(response) {
                Ok(page) => page,
                Err(err) if err.is_fatal() => return Err(self.fail(err)),
                Err(err) => return Err(err),
            };
            summary.pages += 1;
            trace!(
                "page {}: {} item(s), last={}",
                summary.pages,
                page.items.len(),
                page.last
            );

            for (index, item) in page.items.into_iter().enumerate() {
                match item.and_then(&mut on_item) {
                    Ok(()) => summary.delivered += 1,
                    Err(err) => {
                        summary.skipped += 1;
                        warn!("skipping item {} of page {}: {}", index, summary.pages, err);
                    }
                }
            }
            cursor.advance(page.token, page.last);
        }

        debug!(
            "paged query finished: pages={}, delivered={}, skipped={}",
            summary.pages, summary.delivered, summary.skipped
        );
        Ok(summary)
    }
}
