//! Multiplexing daemon (usbmuxd) client.
//!
//! Speaks the framed request/response protocol of the local daemon that
//! tunnels TCP connections to attached devices. Exposes device enumeration,
//! attach/detach subscription, pair record storage, and the `Connect`
//! operation that turns the daemon socket into an opaque byte stream to a
//! device port.

use std::net::{AddrParseError, IpAddr, SocketAddr};
use std::str::FromStr;

#[cfg(not(unix))]
use std::net::{Ipv4Addr, SocketAddrV4};

use log::{debug, warn};
use tokio::io::{AsyncReadExt, AsyncWriteExt};

use crate::pair_record::PairRecord;
use crate::provider::UsbmuxdProvider;
use crate::{DeviceConnection, DeviceError, ReadWrite};

mod des;
mod raw_packet;

pub use raw_packet::{MuxHeader, RawPacket, HEADER_LEN};

/// How a device is attached to the host
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionType {
    Usb,
    Network(IpAddr),
    Unknown(String),
}

/// A device currently known to the daemon.
///
/// Valid for the lifetime of a single attach; a detach event invalidates
/// the `device_id`.
#[derive(Debug, Clone)]
pub struct UsbmuxdDevice {
    pub connection_type: ConnectionType,
    /// Unique device identifier (25 or 40 character serial)
    pub udid: String,
    /// Daemon-assigned id, stable until detach
    pub device_id: u32,
    /// Interface index for network-attached devices
    pub interface_index: Option<u32>,
}

impl UsbmuxdDevice {
    /// Creates a provider that opens tunneled connections to this device
    pub fn to_provider(&self, addr: UsbmuxdAddr, label: impl Into<String>) -> UsbmuxdProvider {
        UsbmuxdProvider {
            addr,
            udid: self.udid.clone(),
            device_id: self.device_id,
            label: label.into(),
        }
    }
}

/// Asynchronous attach/detach notifications delivered in listen mode
#[derive(Debug, Clone)]
pub enum DeviceEvent {
    Attached(UsbmuxdDevice),
    Detached(u32),
    Paired(u32),
}

/// Address of the multiplexing daemon
#[derive(Clone, Debug)]
pub enum UsbmuxdAddr {
    /// Unix domain socket path (Unix systems only)
    #[cfg(unix)]
    UnixSocket(String),
    /// TCP socket address
    TcpSocket(SocketAddr),
}

impl UsbmuxdAddr {
    pub const DEFAULT_PORT: u16 = 27015;
    pub const SOCKET_FILE: &'static str = "/var/run/usbmuxd";

    pub async fn to_socket(&self) -> Result<Box<dyn ReadWrite>, DeviceError> {
        Ok(match self {
            #[cfg(unix)]
            Self::UnixSocket(addr) => Box::new(tokio::net::UnixStream::connect(addr).await?),
            Self::TcpSocket(addr) => Box::new(tokio::net::TcpStream::connect(addr).await?),
        })
    }

    pub async fn connect(&self) -> Result<UsbmuxdConnection, DeviceError> {
        let socket = self.to_socket().await?;
        Ok(UsbmuxdConnection::new(socket))
    }

    /// Reads `USBMUXD_SOCKET_ADDRESS` if set, otherwise the platform default
    pub fn from_env_var() -> Result<Self, AddrParseError> {
        Ok(match std::env::var("USBMUXD_SOCKET_ADDRESS") {
            Ok(var) => {
                #[cfg(unix)]
                if var.contains(':') {
                    Self::TcpSocket(SocketAddr::from_str(&var)?)
                } else {
                    Self::UnixSocket(var)
                }
                #[cfg(not(unix))]
                Self::TcpSocket(SocketAddr::from_str(&var)?)
            }
            Err(_) => Self::default(),
        })
    }
}

impl Default for UsbmuxdAddr {
    fn default() -> Self {
        #[cfg(not(unix))]
        {
            Self::TcpSocket(SocketAddr::V4(SocketAddrV4::new(
                Ipv4Addr::new(127, 0, 0, 1),
                Self::DEFAULT_PORT,
            )))
        }
        #[cfg(unix)]
        Self::UnixSocket(Self::SOCKET_FILE.to_string())
    }
}

/// Active connection to the multiplexing daemon.
///
/// Requests carry monotonically increasing tags; every reply must echo the
/// tag of the request it answers. Listen-mode events carry tag 0 and are
/// only ever read through [`UsbmuxdSubscription`].
pub struct UsbmuxdConnection {
    socket: Box<dyn ReadWrite>,
    tag: u32,
}

impl UsbmuxdConnection {
    pub const XML_PLIST_VERSION: u32 = 1;
    pub const PLIST_MESSAGE_TYPE: u32 = 8;

    const CLIENT_VERSION: &'static str = "mobiledevice-rs";

    pub async fn default() -> Result<Self, DeviceError> {
        UsbmuxdAddr::default().connect().await
    }

    pub fn new(socket: Box<dyn ReadWrite>) -> Self {
        Self { socket, tag: 0 }
    }

    /// Lists all devices currently attached
    pub async fn get_devices(&mut self) -> Result<Vec<UsbmuxdDevice>, DeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ListDevices".into());
        req.insert("ClientVersionString".into(), Self::CLIENT_VERSION.into());
        let res = self.request(req).await?;

        let res = plist::to_value(&res)?;
        let res: des::ListDevicesResponse = plist::from_value(&res)?;

        res.device_list.into_iter().map(TryInto::try_into).collect()
    }

    /// Gets a specific device by UDID
    pub async fn get_device(&mut self, udid: &str) -> Result<UsbmuxdDevice, DeviceError> {
        let devices = self.get_devices().await?;
        devices
            .into_iter()
            .find(|x| x.udid == udid)
            .ok_or(DeviceError::DeviceNotFound)
    }

    /// Whether the daemon still lists a device with this UDID
    pub async fn is_device_connected(&mut self, udid: &str) -> Result<bool, DeviceError> {
        Ok(self.get_devices().await?.iter().any(|d| d.udid == udid))
    }

    /// Reads the daemon's stored pairing record for a device
    pub async fn get_pair_record(&mut self, udid: &str) -> Result<PairRecord, DeviceError> {
        debug!("Getting pair record for {udid}");
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ReadPairRecord".into());
        req.insert("PairRecordID".into(), udid.into());
        let res = self.request(req).await?;

        match res.get("PairRecordData") {
            Some(plist::Value::Data(d)) => PairRecord::from_bytes(d),
            _ => Err(DeviceError::NotPaired),
        }
    }

    /// Stores a pairing record in the daemon's cache
    pub async fn save_pair_record(
        &mut self,
        device_id: u32,
        udid: &str,
        record: Vec<u8>,
    ) -> Result<(), DeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "SavePairRecord".into());
        req.insert("PairRecordID".into(), udid.into());
        req.insert("PairRecordData".into(), plist::Value::Data(record));
        req.insert("DeviceID".into(), device_id.into());
        let res = self.request(req).await?;
        match result_number(&res) {
            Some(0) => Ok(()),
            _ => Err(DeviceError::UnexpectedResponse),
        }
    }

    /// Reads the system BUID the daemon was provisioned with
    pub async fn get_buid(&mut self) -> Result<String, DeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "ReadBUID".into());
        let mut res = self.request(req).await?;
        match res.remove("BUID") {
            Some(plist::Value::String(s)) => Ok(s),
            _ => Err(DeviceError::UnexpectedResponse),
        }
    }

    /// Opens a tunneled stream to a TCP port on the device.
    ///
    /// On success the daemon stops framing this socket; the same connection
    /// becomes an opaque byte stream to the device and is returned as a
    /// [`DeviceConnection`].
    pub async fn connect_to_device(
        mut self,
        device_id: u32,
        port: u16,
        label: impl Into<String>,
    ) -> Result<DeviceConnection, DeviceError> {
        debug!("Connecting to device {device_id} on port {port}");

        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "Connect".into());
        req.insert("DeviceID".into(), device_id.into());
        req.insert("PortNumber".into(), port.to_be().into());
        let res = self.request(req).await?;
        match result_number(&res) {
            Some(0) => Ok(DeviceConnection::new(self.socket, label)),
            Some(1) => Err(DeviceError::MuxBadCommand),
            Some(2) => Err(DeviceError::MuxBadDevice),
            Some(3) => Err(DeviceError::MuxConnectionRefused),
            Some(6) => Err(DeviceError::MuxBadVersion),
            _ => Err(DeviceError::UnexpectedResponse),
        }
    }

    /// Switches the connection into listen mode.
    ///
    /// After the daemon acknowledges, the socket carries only tag-0 event
    /// packets, read one at a time through the returned subscription.
    /// Dropping the subscription closes the socket and ends the stream.
    pub async fn subscribe(mut self) -> Result<UsbmuxdSubscription, DeviceError> {
        let mut req = plist::Dictionary::new();
        req.insert("MessageType".into(), "Listen".into());
        req.insert("ClientVersionString".into(), Self::CLIENT_VERSION.into());
        let res = self.request(req).await?;
        match result_number(&res) {
            Some(0) => Ok(UsbmuxdSubscription {
                socket: self.socket,
            }),
            _ => Err(DeviceError::UnexpectedResponse),
        }
    }

    /// Sends one request and reads its reply, enforcing tag correlation
    async fn request(
        &mut self,
        req: plist::Dictionary,
    ) -> Result<plist::Dictionary, DeviceError> {
        self.tag += 1;
        let tag = self.tag;
        let raw = RawPacket::plist(&req, Self::XML_PLIST_VERSION, Self::PLIST_MESSAGE_TYPE, tag)?;
        self.socket.write_all(&raw.serialize()).await?;
        self.socket.flush().await?;

        let (header, body) = read_packet(&mut self.socket).await?;
        if header.tag != tag {
            warn!("Reply tag {} does not match request tag {tag}", header.tag);
            return Err(DeviceError::UnexpectedResponse);
        }
        Ok(body)
    }
}

/// Receiving half of a listen-mode connection
pub struct UsbmuxdSubscription {
    socket: Box<dyn ReadWrite>,
}

impl UsbmuxdSubscription {
    /// Waits for the next attach/detach/paired event.
    ///
    /// Returns `Ok(None)` when the daemon closes the socket. Unknown event
    /// types are skipped.
    pub async fn next_event(&mut self) -> Result<Option<DeviceEvent>, DeviceError> {
        loop {
            let (header, body) = match read_packet(&mut self.socket).await {
                Ok(p) => p,
                Err(DeviceError::Socket(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    return Ok(None);
                }
                Err(e) => return Err(e),
            };
            if header.tag != 0 {
                warn!("Listen-mode packet with non-zero tag {}", header.tag);
                return Err(DeviceError::UnexpectedResponse);
            }
            match body.get("MessageType").and_then(|m| m.as_string()) {
                Some("Attached") => {
                    let entry = plist::to_value(&body)?;
                    let entry: des::DeviceEntry = plist::from_value(&entry)?;
                    return Ok(Some(DeviceEvent::Attached(entry.try_into()?)));
                }
                Some("Detached") => {
                    let id = body
                        .get("DeviceID")
                        .and_then(|d| d.as_unsigned_integer())
                        .ok_or(DeviceError::UnexpectedResponse)?;
                    return Ok(Some(DeviceEvent::Detached(id as u32)));
                }
                Some("Paired") => {
                    let id = body
                        .get("DeviceID")
                        .and_then(|d| d.as_unsigned_integer())
                        .ok_or(DeviceError::UnexpectedResponse)?;
                    return Ok(Some(DeviceEvent::Paired(id as u32)));
                }
                other => {
                    debug!("Ignoring listen event {other:?}");
                }
            }
        }
    }
}

async fn read_packet(
    socket: &mut Box<dyn ReadWrite>,
) -> Result<(MuxHeader, plist::Dictionary), DeviceError> {
    let mut header = [0u8; 16];
    socket.read_exact(&mut header).await?;
    let header = MuxHeader::parse(&header)?;
    debug!("Reading {} bytes from muxer", header.payload_len());

    let mut body = vec![0; header.payload_len()];
    socket.read_exact(&mut body).await?;
    let body: plist::Dictionary = plist::from_bytes(&body)?;
    Ok((header, body))
}

fn result_number(res: &plist::Dictionary) -> Option<u64> {
    res.get("Number").and_then(|x| x.as_unsigned_integer())
}
