//! Endpoint resolution: explicit binding first, endpoint mapper otherwise

use crate::descriptor::{InterfaceAlternative, ServiceDescriptor};
use crate::error::{Result, SessionError};
use crate::transport::{TargetAddress, TransportFamily};
use async_trait::async_trait;
use tracing::debug;

/// Source of dynamic endpoint registrations.
///
/// `Ok(None)` means the mapper answered but knows no endpoint for this
/// alternative on this transport family.
#[async_trait]
pub trait EndpointMapper: Send {
    async fn map(
        &mut self,
        host: &str,
        alternative: &InterfaceAlternative,
        family: TransportFamily,
    ) -> Result<Option<TargetAddress>>;
}

/// Turns a [`ServiceDescriptor`] into a connectable address on one host
pub struct EndpointResolver<M> {
    host: String,
    mapper: M,
}

impl<M: EndpointMapper> EndpointResolver<M> {
    pub fn new(host: impl Into<String>, mapper: M) -> Self {
        Self {
            host: host.into(),
            mapper,
        }
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    /// An explicit endpoint is used as is and the mapper is not consulted.
    /// Otherwise alternatives are mapped in preference order and the first
    /// registration wins.
    pub async fn resolve(&mut self, descriptor: &ServiceDescriptor) -> Result<TargetAddress> {
        if let Some(binding) = descriptor.explicit_endpoint() {
            let address = binding.to_address(&self.host)?;
            debug!("using explicit endpoint {}", address);
            return Ok(address);
        }

        for alternative in descriptor.alternatives() {
            if let Some(address) = self
                .mapper
                .map(&self.host, alternative, descriptor.family())
                .await?
            {
                debug!("{} is registered at {}", alternative.interface, address);
                return Ok(address);
            }
            debug!("{} is not registered on {}", alternative.interface, self.host);
        }

        Err(SessionError::EndpointUnavailable {
            interfaces: descriptor.describe_interfaces(),
        })
    }
}
