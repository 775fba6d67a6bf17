//! Session configuration

use crate::fragmentation::DEFAULT_MAX_STUB_SIZE;
use crate::framing::DEFAULT_MAX_PDU_SIZE;
use crate::pdu::DEFAULT_MAX_FRAG;
use crate::security::AuthLevel;
use std::time::Duration;

/// Tunables for one session
#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub connect_timeout: Duration,
    /// Upper bound on one request/response exchange. `None` waits forever.
    pub exchange_timeout: Option<Duration>,
    pub max_xmit_frag: u16,
    pub max_recv_frag: u16,
    pub max_pdu_size: usize,
    /// Largest reassembled response stub.
    pub max_stub_size: usize,
    pub auth_level: AuthLevel,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            exchange_timeout: Some(Duration::from_secs(60)),
            max_xmit_frag: DEFAULT_MAX_FRAG,
            max_recv_frag: DEFAULT_MAX_FRAG,
            max_pdu_size: DEFAULT_MAX_PDU_SIZE,
            max_stub_size: DEFAULT_MAX_STUB_SIZE,
            auth_level: AuthLevel::PktPrivacy,
        }
    }
}

impl SessionConfig {
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn with_exchange_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.exchange_timeout = timeout;
        self
    }

    pub fn with_max_frag(mut self, xmit: u16, recv: u16) -> Self {
        self.max_xmit_frag = xmit;
        self.max_recv_frag = recv;
        self
    }

    pub fn with_max_pdu_size(mut self, size: usize) -> Self {
        self.max_pdu_size = size;
        self
    }

    pub fn with_max_stub_size(mut self, size: usize) -> Self {
        self.max_stub_size = size;
        self
    }

    pub fn with_auth_level(mut self, level: AuthLevel) -> Self {
        self.auth_level = level;
        self
    }
}
