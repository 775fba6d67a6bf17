//! Credential resolution
//!
//! Parses `domain/user:password[@host]` target specifiers plus the usual
//! hash / key / domain-controller options into an immutable [`Credentials`].

use crate::error::{Result, SessionError};
use std::fmt;

/// LM hash of the empty password, used when only an NT hash is given.
pub const EMPTY_LM_HASH: &str = "aad3b435b51404eeaad3b435b51404ee";

/// The secret backing a principal. At most one form is active.
#[derive(Clone, PartialEq, Eq)]
pub enum Secret {
    None,
    Password(String),
    Hashes { lm: String, nt: String },
    /// Hex-encoded AES128 or AES256 Kerberos key.
    AesKey(String),
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::None => f.write_str("None"),
            Self::Password(_) => f.write_str("Password(<redacted>)"),
            Self::Hashes { .. } => f.write_str("Hashes(<redacted>)"),
            Self::AesKey(_) => f.write_str("AesKey(<redacted>)"),
        }
    }
}

/// Domain controller targeting
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KdcTarget {
    pub dc_host: Option<String>,
    pub dc_ip: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Credentials {
    domain: String,
    username: String,
    secret: Secret,
    use_kerberos: bool,
    kdc: KdcTarget,
}

impl Credentials {
    pub fn anonymous() -> Self {
        Self {
            domain: String::new(),
            username: String::new(),
            secret: Secret::None,
            use_kerberos: false,
            kdc: KdcTarget::default(),
        }
    }

    pub fn domain(&self) -> &str {
        &self.domain
    }

    pub fn username(&self) -> &str {
        &self.username
    }

    pub fn secret(&self) -> &Secret {
        &self.secret
    }

    pub fn use_kerberos(&self) -> bool {
        self.use_kerberos
    }

    pub fn kdc(&self) -> &KdcTarget {
        &self.kdc
    }

    pub fn is_anonymous(&self) -> bool {
        self.username.is_empty() && self.secret == Secret::None
    }

    /// Host to contact: the DC host name when given, then the DC address,
    /// then the domain itself.
    pub fn target_host(&self) -> &str {
        self.kdc
            .dc_host
            .as_deref()
            .or(self.kdc.dc_ip.as_deref())
            .unwrap_or(&self.domain)
    }

    /// Replaces the DC host, e.g. with a name learned from a probe session.
    pub fn with_dc_host(mut self, host: impl Into<String>) -> Self {
        self.kdc.dc_host = Some(host.into());
        self
    }
}

/// Flags that accompany a target specifier
#[derive(Debug, Clone, Default)]
pub struct CredentialOptions {
    /// `LMHASH:NTHASH`; the LM half may be empty.
    pub hashes: Option<String>,
    pub aes_key: Option<String>,
    pub no_pass: bool,
    pub kerberos: bool,
    pub dc_ip: Option<String>,
    pub dc_host: Option<String>,
}

/// Splits `domain/user:password` into its three parts. Every part is
/// optional; a missing part comes back empty.
pub fn parse_credentials(spec: &str) -> (String, String, String) {
    let (domain, rest) = match spec.split_once('/') {
        Some((d, r)) if !d.contains(':') => (d, r),
        _ => ("", spec),
    };
    let (user, password) = rest.split_once(':').unwrap_or((rest, ""));
    (domain.to_string(), user.to_string(), password.to_string())
}

/// Splits `domain/user:password@host`. The host is whatever follows the
/// last `@`, so passwords may contain `@`.
pub fn parse_target(spec: &str) -> (String, String, String, Option<String>) {
    let (creds, host) = match spec.rsplit_once('@') {
        Some((c, h)) if !h.is_empty() => (c, Some(h.to_string())),
        _ => (spec, None),
    };
    let (domain, user, password) = parse_credentials(creds);
    (domain, user, password, host)
}

fn is_hex(s: &str, lengths: &[usize]) -> bool {
    lengths.contains(&s.len()) && s.chars().all(|c| c.is_ascii_hexdigit())
}

pub struct CredentialResolver;

impl CredentialResolver {
    /// Normalizes a target specifier and option flags.
    ///
    /// A hash pair or AES key wins over a password in the specifier, and
    /// an AES key implies Kerberos.
    pub fn resolve(target_spec: &str, options: &CredentialOptions) -> Result<Credentials> {
        let (domain, username, password) = parse_credentials(target_spec);
        if domain.is_empty() {
            return Err(SessionError::InvalidInput("domain should be specified".into()));
        }

        let secret = if let Some(key) = &options.aes_key {
            if !is_hex(key, &[32, 64]) {
                return Err(SessionError::InvalidInput(
                    "AES key must be 32 or 64 hex characters".into(),
                ));
            }
            Secret::AesKey(key.to_ascii_lowercase())
        } else if let Some(hashes) = &options.hashes {
            let (lm, nt) = hashes.split_once(':').ok_or_else(|| {
                SessionError::InvalidInput("hashes must be in LMHASH:NTHASH form".into())
            })?;
            let lm = if lm.is_empty() { EMPTY_LM_HASH } else { lm };
            if !is_hex(lm, &[32]) || !is_hex(nt, &[32]) {
                return Err(SessionError::InvalidInput(
                    "LM and NT hashes must be 32 hex characters".into(),
                ));
            }
            Secret::Hashes {
                lm: lm.to_ascii_lowercase(),
                nt: nt.to_ascii_lowercase(),
            }
        } else if !password.is_empty() {
            Secret::Password(password)
        } else if options.no_pass || username.is_empty() {
            Secret::None
        } else {
            return Err(SessionError::InvalidInput(format!(
                "no secret given for {}\\{}; pass a password, -hashes, -aesKey or -no-pass",
                domain, username
            )));
        };

        Ok(Credentials {
            use_kerberos: options.kerberos || matches!(secret, Secret::AesKey(_)),
            domain,
            username,
            secret,
            kdc: KdcTarget {
                dc_host: options.dc_host.clone(),
                dc_ip: options.dc_ip.clone(),
            },
        })
    }
}
