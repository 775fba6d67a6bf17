//! PDU framing over a byte stream
//!
//! Connection-oriented PDUs are self-delimiting through the `frag_length`
//! header field, so the same framer serves TCP, TLS and named pipes.

use crate::error::{ChannelError, Result};
use crate::pdu::PduHeader;
use bytes::{Bytes, BytesMut};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tracing::trace;

/// Maximum PDU size (64 KB, the `frag_length` ceiling)
pub const DEFAULT_MAX_PDU_SIZE: usize = 65536;

/// Reads and writes whole PDUs on a stream
pub struct PduFramer<S> {
    inner: S,
    max_pdu_size: usize,
    read_buf: BytesMut,
}

impl<S> PduFramer<S> {
    pub fn new(inner: S) -> Self {
        Self {
            inner,
            max_pdu_size: DEFAULT_MAX_PDU_SIZE,
            read_buf: BytesMut::with_capacity(8192),
        }
    }

    pub fn with_max_pdu_size(mut self, max_size: usize) -> Self {
        self.max_pdu_size = max_size;
        self
    }

    pub fn get_mut(&mut self) -> &mut S {
        &mut self.inner
    }
}

impl<S: AsyncRead + Unpin> PduFramer<S> {
    /// Reads one complete PDU fragment.
    pub async fn read_pdu(&mut self) -> Result<Bytes> {
        let frag_length = loop {
            if let Some(len) = PduHeader::peek_frag_length(&self.read_buf) {
                break len as usize;
            }
            self.fill().await?;
        };

        if frag_length < PduHeader::SIZE {
            return Err(ChannelError::InvalidPdu(format!(
                "fragment length {} is shorter than the header",
                frag_length
            ))
            .into());
        }
        if frag_length > self.max_pdu_size {
            return Err(ChannelError::PduTooLarge {
                size: frag_length,
                max: self.max_pdu_size,
            }
            .into());
        }

        while self.read_buf.len() < frag_length {
            self.fill().await?;
        }

        trace!(frag_length, "read PDU");
        Ok(self.read_buf.split_to(frag_length).freeze())
    }

    async fn fill(&mut self) -> Result<()> {
        self.read_buf.reserve(4096);
        let n = self.inner.read_buf(&mut self.read_buf).await?;
        if n == 0 {
            let err = if self.read_buf.is_empty() {
                ChannelError::ConnectionClosed
            } else {
                ChannelError::Io(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("connection closed mid-PDU ({} bytes buffered)", self.read_buf.len()),
                ))
            };
            return Err(err.into());
        }
        Ok(())
    }
}

impl<S: AsyncWrite + Unpin> PduFramer<S> {
    pub async fn write_pdu(&mut self, data: &[u8]) -> Result<()> {
        self.inner.write_all(data).await?;
        self.inner.flush().await?;
        Ok(())
    }

    pub async fn shutdown(&mut self) -> Result<()> {
        self.inner.shutdown().await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::SessionError;
    use crate::pdu::{Pdu, RequestPdu};
    use tokio::io::duplex;

    #[tokio::test]
    async fn test_reads_back_to_back_pdus() {
        crate::testing::init_test_logging();

        let (client, server) = duplex(4096);
        let mut writer = PduFramer::new(client);
        let mut reader = PduFramer::new(server);

        let write_handle = tokio::spawn(async move {
            for i in 0..3u32 {
                let request = RequestPdu::new(i, i as u16, Bytes::from(format!("msg{}", i)));
                writer.write_pdu(&request.encode()).await.unwrap();
            }
        });

        for i in 0..3u32 {
            let data = reader.read_pdu().await.unwrap();
            match Pdu::decode(&data).unwrap() {
                Pdu::Request(req) => {
                    assert_eq!(req.header.call_id, i);
                    assert_eq!(req.stub_data, Bytes::from(format!("msg{}", i)));
                }
                other => panic!("expected request PDU, got {:?}", other),
            }
        }
        write_handle.await.unwrap();
    }

    #[tokio::test]
    async fn test_oversized_pdu_rejected() {
        crate::testing::init_test_logging();

        let (client, server) = duplex(65536);
        let mut writer = PduFramer::new(client);
        let mut reader = PduFramer::new(server).with_max_pdu_size(64);

        let request = RequestPdu::new(1, 0, Bytes::from(vec![0u8; 100]));
        writer.write_pdu(&request.encode()).await.unwrap();

        match reader.read_pdu().await {
            Err(SessionError::Channel(ChannelError::PduTooLarge { max: 64, .. })) => {}
            other => panic!("expected PduTooLarge, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_clean_close_is_reported() {
        let (client, server) = duplex(64);
        drop(client);
        let mut reader = PduFramer::new(server);
        assert!(matches!(
            reader.read_pdu().await,
            Err(SessionError::Channel(ChannelError::ConnectionClosed))
        ));
    }
}
