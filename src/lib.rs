#![doc = include_str!("../README.md")]
//! The crate is layered the way the protocols are: [`usbmuxd`] discovers
//! devices and opens tunneled streams, [`lockdown`] drives the control
//! daemon on the device (pairing, sessions, service activation), and the
//! clients in [`services`] speak the per-service sub-protocols over the
//! streams lockdown hands out. [`backup`] orchestrates the long-running
//! mobilebackup2 exchange on top of all of it.

mod ca;
pub mod devicelink;
pub mod lockdown;
pub mod pair_record;
pub mod provider;
mod tls;
pub mod usbmuxd;

pub mod backup;
pub mod services;

use std::io;
use std::sync::Arc;

use log::debug;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::ServerName;
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::pair_record::PairRecord;
use crate::services::afc::AfcError;

/// A trait combining all required characteristics for a device communication
/// socket.
///
/// Tokio's `TcpStream` and `UnixStream` implement this trait, as does the
/// in-memory `duplex` stream used by the tests.
pub trait ReadWrite: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send + Sync + std::fmt::Debug> ReadWrite for T {}

/// Interface for services that can be activated on a device through lockdown.
pub trait DeviceService: Sized {
    /// The service name as registered with lockdownd
    fn service_name() -> &'static str;

    /// Establishes a connection to this service via the given provider
    fn connect(
        provider: &impl provider::DeviceProvider,
    ) -> impl std::future::Future<Output = Result<Self, DeviceError>> + Send;
}

/// A byte-stream endpoint to one service on the device.
///
/// Owns its socket exclusively. After [`DeviceConnection::start_tls`] the
/// stream is transparently TLS-wrapped; callers keep using the same framing
/// methods either way.
pub struct DeviceConnection {
    socket: Option<Box<dyn ReadWrite>>,
    label: String,
}

impl std::fmt::Debug for DeviceConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DeviceConnection")
            .field("label", &self.label)
            .field("connected", &self.socket.is_some())
            .finish()
    }
}

impl DeviceConnection {
    pub fn new(socket: Box<dyn ReadWrite>, label: impl Into<String>) -> Self {
        Self {
            socket: Some(socket),
            label: label.into(),
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    /// Sends one property tree, framed as `{length: u32 BE}` + binary plist.
    ///
    /// This is the framing lockdown and every plist-oriented service use.
    pub async fn send_plist(&mut self, message: plist::Value) -> Result<(), DeviceError> {
        let socket = self
            .socket
            .as_mut()
            .ok_or(DeviceError::NoEstablishedConnection)?;
        debug!("Sending plist: {message:?}");

        let mut buf = Vec::new();
        message.to_writer_binary(&mut buf)?;
        socket.write_all(&(buf.len() as u32).to_be_bytes()).await?;
        socket.write_all(&buf).await?;
        socket.flush().await?;
        Ok(())
    }

    /// Reads one framed plist and decodes it as a dictionary.
    ///
    /// If the dictionary carries an `Error` key, the device-reported error
    /// string is mapped to a typed [`DeviceError`] instead.
    pub async fn read_plist(&mut self) -> Result<plist::Dictionary, DeviceError> {
        let res = match self.read_plist_value().await? {
            plist::Value::Dictionary(d) => d,
            _ => return Err(DeviceError::UnexpectedResponse),
        };

        if let Some(e) = res.get("Error") {
            let e: String = plist::from_value(e)?;
            return Err(DeviceError::from_device_error_type(e.as_str(), &res));
        }
        Ok(res)
    }

    /// Reads one framed plist without interpreting its shape.
    pub async fn read_plist_value(&mut self) -> Result<plist::Value, DeviceError> {
        let socket = self
            .socket
            .as_mut()
            .ok_or(DeviceError::NoEstablishedConnection)?;
        let mut len = [0u8; 4];
        socket.read_exact(&mut len).await?;
        let len = u32::from_be_bytes(len);
        let mut body = vec![0; len as usize];
        socket.read_exact(&mut body).await?;
        let res: plist::Value = plist::from_bytes(&body)?;
        debug!("Received plist: {res:?}");
        Ok(res)
    }

    /// Sends raw bytes, bypassing the plist envelope.
    pub async fn send_raw(&mut self, message: &[u8]) -> Result<(), DeviceError> {
        let socket = self
            .socket
            .as_mut()
            .ok_or(DeviceError::NoEstablishedConnection)?;
        socket.write_all(message).await?;
        socket.flush().await?;
        Ok(())
    }

    /// Reads exactly `len` raw bytes.
    pub async fn read_raw(&mut self, len: usize) -> Result<Vec<u8>, DeviceError> {
        let socket = self
            .socket
            .as_mut()
            .ok_or(DeviceError::NoEstablishedConnection)?;
        let mut buf = vec![0; len];
        socket.read_exact(&mut buf).await?;
        Ok(buf)
    }

    /// Reads exactly `buf.len()` raw bytes into the caller's buffer.
    pub async fn read_raw_into(&mut self, buf: &mut [u8]) -> Result<(), DeviceError> {
        let socket = self
            .socket
            .as_mut()
            .ok_or(DeviceError::NoEstablishedConnection)?;
        socket.read_exact(buf).await?;
        Ok(())
    }

    /// Upgrades the connection in place to TLS using the pairing credentials.
    ///
    /// The device certificate is the sole trust anchor; hostname verification
    /// does not apply to device-minted certificates.
    pub async fn start_tls(&mut self, pair_record: &PairRecord) -> Result<(), DeviceError> {
        if CryptoProvider::get_default().is_none() {
            if let Err(e) =
                CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider())
            {
                // Another task may have won the install race; not fatal.
                log::error!("Failed to set crypto provider: {e:?}");
            }
        }
        let config = tls::client_config(pair_record)?;
        let connector = tokio_rustls::TlsConnector::from(Arc::new(config));

        let socket = self
            .socket
            .take()
            .ok_or(DeviceError::NoEstablishedConnection)?;
        let socket = connector
            .connect(ServerName::try_from("Device").unwrap(), socket)
            .await?;
        self.socket = Some(Box::new(socket));
        Ok(())
    }
}

/// Comprehensive error type for all device communication failures
#[derive(Error, Debug)]
#[non_exhaustive]
pub enum DeviceError {
    #[error("device socket io failed")]
    Socket(#[from] io::Error),
    #[error("io on plist")]
    Plist(#[from] plist::Error),
    #[error("PEM parse failed")]
    PemParse(#[from] rustls::pki_types::pem::Error),
    #[error("TLS error")]
    Tls(#[from] rustls::Error),
    #[error("can't convert bytes to utf8")]
    Utf8(#[from] std::string::FromUtf8Error),
    #[error("unexpected response from device")]
    UnexpectedResponse,
    #[error("port 62078 did not identify as lockdown")]
    NotLockdown,
    #[error("no pairing record exists for this device")]
    NotPaired,
    #[error("pairing trust dialog pending")]
    PairingDialogResponsePending,
    #[error("user denied pairing trust")]
    UserDeniedPairing,
    #[error("device is password protected")]
    PasswordProtected,
    #[error("device does not recognize this host's pairing record")]
    InvalidHostId,
    #[error("no SSL session is active")]
    SessionInactive,
    #[error("this request was prohibited")]
    GetProhibited,
    #[error("request deprecated in this device OS version")]
    Deprecated,
    #[error("failed to start service {0}")]
    ServiceStartFailed(String),
    #[error("afc error: {0}")]
    Afc(#[from] AfcError),
    #[error("unknown afc opcode")]
    UnknownAfcOpcode,
    #[error("invalid afc magic")]
    InvalidAfcMagic,
    #[error("missing file attribute")]
    AfcMissingAttribute,
    #[error("device not found")]
    DeviceNotFound,
    #[error("device disconnected")]
    DeviceDisconnected,
    #[error("device locked")]
    DeviceLocked,
    #[error("backup denied by device policy (code {0})")]
    PolicyDenied(i64),
    #[error("backup failed with device error code {0}: {1}")]
    BackupFailed(i64, String),
    #[error("read timed out")]
    ReceiveTimeout,
    #[error("muxer rejected command")]
    MuxBadCommand,
    #[error("muxer does not know this device")]
    MuxBadDevice,
    #[error("device refused connection")]
    MuxConnectionRefused,
    #[error("muxer protocol version mismatch")]
    MuxBadVersion,
    #[error("no established connection")]
    NoEstablishedConnection,
    #[error("internal error: {0}")]
    InternalError(String),
    #[error("unknown error `{0}` returned from device")]
    UnknownErrorType(String),
}

impl DeviceError {
    /// Converts a device-reported error string to a typed error
    fn from_device_error_type(e: &str, context: &plist::Dictionary) -> Self {
        match e {
            "GetProhibited" => Self::GetProhibited,
            "InvalidHostID" => Self::InvalidHostId,
            "SessionInactive" => Self::SessionInactive,
            "DeviceLocked" => Self::DeviceLocked,
            "PairingDialogResponsePending" => Self::PairingDialogResponsePending,
            "UserDeniedPairing" => Self::UserDeniedPairing,
            "PasswordProtected" => Self::PasswordProtected,
            "DeprecatedInThisVersion" => Self::Deprecated,
            "InternalError" => {
                let detail = context
                    .get("DetailedError")
                    .and_then(|d| d.as_string())
                    .unwrap_or("No context")
                    .to_string();
                Self::InternalError(detail)
            }
            _ => Self::UnknownErrorType(e.to_string()),
        }
    }

    /// True for errors the caller is expected to retry through.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::ReceiveTimeout
                | Self::PairingDialogResponsePending
                | Self::Afc(AfcError::OpWouldBlock)
        )
    }
}
