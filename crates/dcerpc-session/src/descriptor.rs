//! Service descriptors

use crate::error::{Result, SessionError};
use crate::pdu::{SyntaxId, NDR_SYNTAX};
use crate::string_binding::StringBinding;
use crate::transport::TransportFamily;
use std::fmt;

/// One (interface version, transfer syntax) pair a service can be bound with
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct InterfaceAlternative {
    pub interface: SyntaxId,
    pub transfer_syntax: SyntaxId,
}

impl InterfaceAlternative {
    pub fn new(interface: SyntaxId, transfer_syntax: SyntaxId) -> Self {
        Self {
            interface,
            transfer_syntax,
        }
    }

    pub fn ndr(interface: SyntaxId) -> Self {
        Self::new(interface, NDR_SYNTAX)
    }
}

impl fmt::Display for InterfaceAlternative {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} over {}", self.interface, self.transfer_syntax)
    }
}

/// What a caller wants to talk to, independent of where it lives.
///
/// Alternatives are kept in preference order; the negotiator binds them
/// front to back.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServiceDescriptor {
    alternatives: Vec<InterfaceAlternative>,
    family: TransportFamily,
    explicit_endpoint: Option<StringBinding>,
}

impl ServiceDescriptor {
    pub fn builder(family: TransportFamily) -> ServiceDescriptorBuilder {
        ServiceDescriptorBuilder {
            alternatives: Vec::new(),
            family,
            explicit_endpoint: None,
        }
    }

    pub fn alternatives(&self) -> &[InterfaceAlternative] {
        &self.alternatives
    }

    pub fn family(&self) -> TransportFamily {
        self.family
    }

    pub fn explicit_endpoint(&self) -> Option<&StringBinding> {
        self.explicit_endpoint.as_ref()
    }

    /// Human-readable list of the interfaces, for diagnostics.
    pub fn describe_interfaces(&self) -> String {
        self.alternatives
            .iter()
            .map(|alt| alt.interface.to_string())
            .collect::<Vec<_>>()
            .join(", ")
    }
}

pub struct ServiceDescriptorBuilder {
    alternatives: Vec<InterfaceAlternative>,
    family: TransportFamily,
    explicit_endpoint: Option<StringBinding>,
}

impl ServiceDescriptorBuilder {
    pub fn alternative(mut self, interface: SyntaxId, transfer_syntax: SyntaxId) -> Self {
        self.alternatives
            .push(InterfaceAlternative::new(interface, transfer_syntax));
        self
    }

    /// Skips endpoint mapping and connects to `binding` directly.
    pub fn explicit_endpoint(mut self, binding: &str) -> Result<Self> {
        let binding: StringBinding = binding.parse()?;
        if binding.family != self.family {
            return Err(SessionError::InvalidInput(format!(
                "binding {} does not use {}",
                binding, self.family
            )));
        }
        self.explicit_endpoint = Some(binding);
        Ok(self)
    }

    pub fn build(self) -> Result<ServiceDescriptor> {
        if self.alternatives.is_empty() {
            return Err(SessionError::InvalidInput(
                "service descriptor needs at least one interface alternative".into(),
            ));
        }
        Ok(ServiceDescriptor {
            alternatives: self.alternatives,
            family: self.family,
            explicit_endpoint: self.explicit_endpoint,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pdu::{Uuid, NDR64_SYNTAX};

    const SAMR: Uuid = Uuid::from_u128(0x12345778_1234_abcd_ef00_0123456789ac);

    #[test]
    fn test_empty_descriptor_is_rejected() {
        assert!(ServiceDescriptor::builder(TransportFamily::Tcp).build().is_err());
    }

    #[test]
    fn test_alternatives_keep_order() {
        let desc = ServiceDescriptor::builder(TransportFamily::Tcp)
            .alternative(SyntaxId::new(SAMR, 1, 0), NDR64_SYNTAX)
            .alternative(SyntaxId::new(SAMR, 1, 0), NDR_SYNTAX)
            .build()
            .unwrap();
        assert_eq!(desc.alternatives()[0].transfer_syntax, NDR64_SYNTAX);
        assert_eq!(desc.alternatives()[1].transfer_syntax, NDR_SYNTAX);
        assert!(desc.explicit_endpoint().is_none());
    }

    #[test]
    fn test_explicit_endpoint_must_match_family() {
        let builder = ServiceDescriptor::builder(TransportFamily::NamedPipe)
            .alternative(SyntaxId::new(SAMR, 1, 0), NDR_SYNTAX);
        assert!(builder.explicit_endpoint("ncacn_ip_tcp:dc01[49667]").is_err());

        let desc = ServiceDescriptor::builder(TransportFamily::NamedPipe)
            .alternative(SyntaxId::new(SAMR, 1, 0), NDR_SYNTAX)
            .explicit_endpoint(r"ncacn_np:[\pipe\samr]")
            .unwrap()
            .build()
            .unwrap();
        assert!(desc.explicit_endpoint().is_some());
    }
}
