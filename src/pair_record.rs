//! Persistent per-host-per-device pairing credentials.
//!
//! The multiplexing daemon is the authoritative store for these records;
//! this type is a read-through view of one record, with the certificate
//! material parsed into rustls-ready form.

use std::path::Path;

use log::warn;
use plist::Data;
use rustls::pki_types::{pem::PemObject, CertificateDer};
use serde::{Deserialize, Serialize};

use crate::DeviceError;

#[derive(Clone, Debug)]
pub struct PairRecord {
    pub device_certificate: CertificateDer<'static>,
    pub host_private_key: Vec<u8>,
    pub host_certificate: CertificateDer<'static>,
    pub root_private_key: Vec<u8>,
    pub root_certificate: CertificateDer<'static>,
    pub system_buid: String,
    pub host_id: String,
    pub escrow_bag: Option<Vec<u8>>,
    pub wifi_mac_address: Option<String>,
    pub udid: Option<String>,
}

/// The on-wire/on-disk plist shape of a pairing record
#[derive(Serialize, Deserialize, Debug, Clone)]
#[serde(rename_all = "PascalCase")]
struct RawPairRecord {
    device_certificate: Data,
    host_private_key: Data,
    host_certificate: Data,
    root_private_key: Data,
    root_certificate: Data,
    #[serde(rename = "SystemBUID")]
    system_buid: String,
    #[serde(rename = "HostID")]
    host_id: String,
    escrow_bag: Option<Data>,
    #[serde(rename = "WiFiMACAddress")]
    wifi_mac_address: Option<String>,
    #[serde(rename = "UDID")]
    udid: Option<String>,
}

impl PairRecord {
    pub fn read_from_file(path: impl AsRef<Path>) -> Result<Self, DeviceError> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DeviceError> {
        let raw: RawPairRecord = match plist::from_bytes(bytes) {
            Ok(r) => r,
            Err(e) => {
                warn!("Unable to decode pair record plist: {e:?}");
                return Err(DeviceError::UnexpectedResponse);
            }
        };
        raw.try_into().map_err(|e| {
            warn!("Pair record certificate material is invalid: {e:?}");
            DeviceError::UnexpectedResponse
        })
    }

    pub fn from_value(v: &plist::Value) -> Result<Self, DeviceError> {
        let raw: RawPairRecord = plist::from_value(v)?;
        Ok(raw.try_into()?)
    }

    /// Serializes back to the XML plist form the daemon stores
    pub fn serialize(&self) -> Result<Vec<u8>, DeviceError> {
        let raw = RawPairRecord::from(self);
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &raw)?;
        Ok(buf)
    }
}

impl TryFrom<RawPairRecord> for PairRecord {
    type Error = rustls::pki_types::pem::Error;

    fn try_from(value: RawPairRecord) -> Result<Self, Self::Error> {
        Ok(Self {
            device_certificate: CertificateDer::from_pem_slice(&Into::<Vec<u8>>::into(
                value.device_certificate,
            ))?,
            host_private_key: value.host_private_key.into(),
            host_certificate: CertificateDer::from_pem_slice(&Into::<Vec<u8>>::into(
                value.host_certificate,
            ))?,
            root_private_key: value.root_private_key.into(),
            root_certificate: CertificateDer::from_pem_slice(&Into::<Vec<u8>>::into(
                value.root_certificate,
            ))?,
            system_buid: value.system_buid,
            host_id: value.host_id,
            escrow_bag: value.escrow_bag.map(Into::into),
            wifi_mac_address: value.wifi_mac_address,
            udid: value.udid,
        })
    }
}

impl From<&PairRecord> for RawPairRecord {
    fn from(value: &PairRecord) -> Self {
        Self {
            device_certificate: Data::new(value.device_certificate.to_vec()),
            host_private_key: Data::new(value.host_private_key.clone()),
            host_certificate: Data::new(value.host_certificate.to_vec()),
            root_private_key: Data::new(value.root_private_key.clone()),
            root_certificate: Data::new(value.root_certificate.to_vec()),
            system_buid: value.system_buid.clone(),
            host_id: value.host_id.clone(),
            escrow_bag: value.escrow_bag.clone().map(Data::new),
            wifi_mac_address: value.wifi_mac_address.clone(),
            udid: value.udid.clone(),
        }
    }
}
