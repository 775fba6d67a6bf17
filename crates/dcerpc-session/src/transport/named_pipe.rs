//! `ncacn_np` transport (Windows)
//!
//! Remote pipes are reached through SMB as `\\<server>\pipe\<name>`. When
//! credentials carrying a password are attached, an `IPC$` connection is
//! established with them first so the pipe opens under that identity.

use super::{Channel, Endpoint, TargetAddress, Transport, TransportFamily};
use crate::credentials::Credentials;
use crate::error::{Result, SessionError};
use crate::framing::DEFAULT_MAX_PDU_SIZE;
use async_trait::async_trait;
use std::time::Duration;

/// Well-known endpoint mapper pipe name
pub const EPM_PIPE_NAME: &str = r"\pipe\epmapper";

/// Full UNC path of a pipe endpoint on `host`.
pub fn unc_path(host: &str, pipe: &str) -> String {
    let bare = pipe.trim_start_matches('\\');
    let bare = bare
        .strip_prefix("pipe\\")
        .or_else(|| bare.strip_prefix("PIPE\\"))
        .unwrap_or(bare);
    format!(r"\\{}\pipe\{}", host, bare)
}

/// Named pipe transport
#[derive(Clone, Default)]
pub struct NamedPipeTransport {
    max_pdu_size: Option<usize>,
    credentials: Option<Credentials>,
}

impl NamedPipeTransport {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_max_pdu_size(mut self, size: usize) -> Self {
        self.max_pdu_size = Some(size);
        self
    }

    fn pipe_path(address: &TargetAddress) -> Result<String> {
        match &address.endpoint {
            Endpoint::Pipe(pipe) => Ok(unc_path(&address.host, pipe)),
            Endpoint::Port(port) => Err(SessionError::InvalidInput(format!(
                "named pipe transport cannot open port {}",
                port
            ))),
        }
    }
}

#[async_trait]
impl Transport for NamedPipeTransport {
    fn family(&self) -> TransportFamily {
        TransportFamily::NamedPipe
    }

    fn attach_credentials(&mut self, credentials: &Credentials) {
        self.credentials = Some(credentials.clone());
    }

    async fn connect(&self, address: &TargetAddress, timeout: Duration) -> Result<Box<dyn Channel>> {
        let path = Self::pipe_path(address)?;
        let max_pdu_size = self.max_pdu_size.unwrap_or(DEFAULT_MAX_PDU_SIZE);
        super::connect_within(
            address,
            timeout,
            imp::open(address, path, self.credentials.clone(), max_pdu_size),
        )
        .await
    }
}

#[cfg(windows)]
mod imp {
    use super::super::{Channel, StreamChannel, TargetAddress};
    use crate::credentials::{Credentials, Secret};
    use crate::error::{Result, SessionError};
    use std::ffi::OsStr;
    use std::os::windows::ffi::OsStrExt;
    use std::time::Duration;
    use tokio::net::windows::named_pipe::{ClientOptions, PipeMode};
    use tracing::debug;
    use windows::core::{PCWSTR, PWSTR};
    use windows::Win32::Foundation::{ERROR_PIPE_BUSY, NO_ERROR};
    use windows::Win32::NetworkManagement::WNet::{
        WNetAddConnection2W, NETRESOURCEW, NET_CONNECT_FLAGS, RESOURCETYPE_ANY,
    };

    fn wide(s: &str) -> Vec<u16> {
        OsStr::new(s).encode_wide().chain(std::iter::once(0)).collect()
    }

    /// Opens `\\host\IPC$` with a password credential.
    fn connect_ipc(host: &str, credentials: &Credentials) -> Result<()> {
        let Secret::Password(password) = credentials.secret() else {
            debug!(host, "no password to present over SMB; using the current logon");
            return Ok(());
        };
        let mut remote = wide(&format!(r"\\{}\IPC$", host));
        let user = wide(&format!(r"{}\{}", credentials.domain(), credentials.username()));
        let password = wide(password);

        let resource = NETRESOURCEW {
            dwType: RESOURCETYPE_ANY,
            lpRemoteName: PWSTR(remote.as_mut_ptr()),
            ..Default::default()
        };
        // SAFETY: every pointer references a NUL-terminated buffer that
        // outlives the call.
        let status = unsafe {
            WNetAddConnection2W(
                &resource,
                PCWSTR(password.as_ptr()),
                PCWSTR(user.as_ptr()),
                NET_CONNECT_FLAGS(0),
            )
        };
        if status != NO_ERROR {
            return Err(SessionError::unreachable(
                host,
                std::io::Error::from_raw_os_error(status.0 as i32),
            ));
        }
        debug!(host, "IPC$ connection established");
        Ok(())
    }

    pub(super) async fn open(
        address: &TargetAddress,
        path: String,
        credentials: Option<Credentials>,
        max_pdu_size: usize,
    ) -> Result<Box<dyn Channel>> {
        if let Some(credentials) = credentials.filter(|c| !c.is_anonymous()) {
            let host = address.host.clone();
            tokio::task::spawn_blocking(move || connect_ipc(&host, &credentials))
                .await
                .map_err(|e| SessionError::unreachable(address, std::io::Error::other(e)))??;
        }

        let client = loop {
            match ClientOptions::new().pipe_mode(PipeMode::Message).open(&path) {
                Ok(client) => break client,
                Err(e) if e.raw_os_error() == Some(ERROR_PIPE_BUSY.0 as i32) => {
                    tokio::time::sleep(Duration::from_millis(50)).await;
                }
                Err(e) => return Err(SessionError::unreachable(address, e)),
            }
        };
        debug!(%address, "named pipe opened");
        Ok(Box::new(StreamChannel::new(client, max_pdu_size)))
    }
}

#[cfg(not(windows))]
mod imp {
    use super::super::{Channel, TargetAddress};
    use crate::credentials::Credentials;
    use crate::error::{Result, SessionError};

    pub(super) async fn open(
        address: &TargetAddress,
        _path: String,
        _credentials: Option<Credentials>,
        _max_pdu_size: usize,
    ) -> Result<Box<dyn Channel>> {
        Err(SessionError::unreachable(
            address,
            std::io::Error::new(
                std::io::ErrorKind::Unsupported,
                "named pipes are only available on Windows",
            ),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unc_path() {
        assert_eq!(unc_path("dc01", r"\pipe\epmapper"), r"\\dc01\pipe\epmapper");
        assert_eq!(unc_path("dc01", "lsarpc"), r"\\dc01\pipe\lsarpc");
        assert_eq!(
            NamedPipeTransport::pipe_path(&TargetAddress::pipe("10.0.0.5", EPM_PIPE_NAME)).unwrap(),
            r"\\10.0.0.5\pipe\epmapper"
        );
        assert!(NamedPipeTransport::pipe_path(&TargetAddress::tcp("dc01", 135)).is_err());
    }

    #[cfg(not(windows))]
    #[tokio::test]
    async fn test_unsupported_platform_is_unreachable() {
        let err = NamedPipeTransport::new()
            .connect(&TargetAddress::pipe("dc01", "lsarpc"), Duration::from_secs(1))
            .await
            .err()
            .unwrap();
        assert_eq!(err.kind(), crate::error::ErrorKind::TransportUnreachable);
    }
}
