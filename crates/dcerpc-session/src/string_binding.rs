//! String bindings (`ncacn_ip_tcp:host[port]`, `ncacn_np:host[\pipe\name]`)

use crate::error::{Result, SessionError};
use crate::transport::{normalize_pipe_name, Endpoint, Scheme, TargetAddress, TransportFamily};
use std::fmt;
use std::str::FromStr;

/// A parsed string binding. Host and endpoint may each be absent, as in
/// the bindings the endpoint mapper returns for dynamic registrations.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StringBinding {
    pub family: TransportFamily,
    pub host: Option<String>,
    pub endpoint: Option<Endpoint>,
}

impl StringBinding {
    pub fn new(family: TransportFamily, host: Option<String>, endpoint: Option<Endpoint>) -> Self {
        Self { family, host, endpoint }
    }

    /// A connectable address, using `default_host` when the binding names
    /// none.
    pub fn to_address(&self, default_host: &str) -> Result<TargetAddress> {
        let endpoint = self
            .endpoint
            .clone()
            .ok_or_else(|| SessionError::InvalidInput(format!("binding {} has no endpoint", self)))?;
        Ok(TargetAddress {
            host: self.host.clone().unwrap_or_else(|| default_host.to_string()),
            endpoint,
            scheme: Scheme::Plain,
        })
    }
}

impl FromStr for StringBinding {
    type Err = SessionError;

    fn from_str(s: &str) -> Result<Self> {
        let invalid = |why: &str| SessionError::InvalidInput(format!("string binding {:?}: {}", s, why));

        let (seq, rest) = s.split_once(':').ok_or_else(|| invalid("missing protocol sequence"))?;
        let family = TransportFamily::from_protocol_sequence(seq.trim())
            .ok_or_else(|| invalid("unsupported protocol sequence"))?;

        let (host, endpoint) = match rest.find('[') {
            Some(open) => {
                let close = rest[open..]
                    .find(']')
                    .map(|i| open + i)
                    .ok_or_else(|| invalid("unterminated endpoint"))?;
                (&rest[..open], Some(&rest[open + 1..close]))
            }
            None => (rest, None),
        };

        // Options such as `[135,Security=...]` follow the endpoint after a comma.
        let endpoint = endpoint
            .map(|e| e.split(',').next().unwrap_or("").trim())
            .filter(|e| !e.is_empty());

        let endpoint = match (family, endpoint) {
            (_, None) => None,
            (TransportFamily::Tcp, Some(port)) => Some(Endpoint::Port(
                port.parse().map_err(|_| invalid("port is not a number"))?,
            )),
            (TransportFamily::NamedPipe, Some(pipe)) => Some(Endpoint::Pipe(normalize_pipe_name(pipe))),
        };

        let host = host.trim();
        Ok(Self {
            family,
            host: (!host.is_empty()).then(|| host.to_string()),
            endpoint,
        })
    }
}

impl fmt::Display for StringBinding {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.family, self.host.as_deref().unwrap_or(""))?;
        match &self.endpoint {
            Some(Endpoint::Port(port)) => write!(f, "[{}]", port),
            Some(Endpoint::Pipe(pipe)) => write!(f, "[{}]", pipe),
            None => Ok(()),
        }
    }
}
