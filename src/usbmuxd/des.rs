//! Serde views of the daemon's plist replies.

use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};

use log::{debug, warn};
use serde::Deserialize;

use crate::usbmuxd::{ConnectionType, UsbmuxdDevice};
use crate::DeviceError;

#[derive(Deserialize)]
pub struct ListDevicesResponse {
    #[serde(rename = "DeviceList")]
    pub device_list: Vec<DeviceEntry>,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DeviceEntry {
    #[serde(rename = "DeviceID")]
    pub device_id: u32,
    #[serde(rename = "Properties")]
    pub properties: DeviceProperties,
}

#[derive(Clone, Debug, Deserialize)]
pub struct DeviceProperties {
    #[serde(rename = "ConnectionType")]
    pub connection_type: String,
    #[serde(rename = "SerialNumber")]
    pub serial_number: String,
    #[serde(rename = "NetworkAddress")]
    pub network_address: Option<plist::Data>,
    #[serde(rename = "InterfaceIndex")]
    pub interface_index: Option<u32>,
}

impl TryFrom<DeviceEntry> for UsbmuxdDevice {
    type Error = DeviceError;

    fn try_from(dev: DeviceEntry) -> Result<Self, Self::Error> {
        let connection_type = match dev.properties.connection_type.as_str() {
            "USB" => ConnectionType::Usb,
            "Network" => {
                let addr = dev.properties.network_address.ok_or_else(|| {
                    warn!("Device is network attached, but has no network info");
                    DeviceError::UnexpectedResponse
                })?;
                ConnectionType::Network(parse_sockaddr(&Into::<Vec<u8>>::into(addr))?)
            }
            other => ConnectionType::Unknown(other.to_string()),
        };
        debug!("Connection type: {connection_type:?}");
        Ok(UsbmuxdDevice {
            connection_type,
            udid: dev.properties.serial_number,
            device_id: dev.device_id,
            interface_index: dev.properties.interface_index,
        })
    }
}

/// Decodes the raw `sockaddr` bytes the daemon stores for network
/// devices. On BSD-layout daemons byte 0 is the length and byte 1 the
/// address family; Windows daemons store a 16-bit family at offset 0, so
/// a zero at offset 1 means the family lives at offset 0. AF_INET carries
/// 4 address bytes at offset 4, AF_INET6 carries 16 at offset 8.
fn parse_sockaddr(addr: &[u8]) -> Result<IpAddr, DeviceError> {
    if addr.len() < 8 {
        warn!("Device address bytes len < 8");
        return Err(DeviceError::UnexpectedResponse);
    }
    let family = if addr[1] != 0 { addr[1] } else { addr[0] };
    match family {
        0x02 => Ok(IpAddr::V4(Ipv4Addr::new(
            addr[4], addr[5], addr[6], addr[7],
        ))),
        0x1E => {
            if addr.len() < 24 {
                warn!("IPv6 sockaddr is less than 24 bytes");
                return Err(DeviceError::UnexpectedResponse);
            }
            let mut segments = [0u16; 8];
            for (i, seg) in segments.iter_mut().enumerate() {
                *seg = u16::from_be_bytes([addr[8 + i * 2], addr[9 + i * 2]]);
            }
            Ok(IpAddr::V6(Ipv6Addr::from(segments)))
        }
        other => {
            warn!("Unknown address family: {other:02X}");
            Err(DeviceError::UnexpectedResponse)
        }
    }
}
