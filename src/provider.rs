//! Sources of tunneled device connections.
//!
//! A provider knows how to open a fresh byte stream to a TCP port on one
//! specific device and where that device's pairing record lives. The
//! multiplexer-backed provider is the common case; the TCP provider serves
//! devices reachable directly over the network (RSD/tunnel endpoints are
//! equivalent sources of the same streams).

use std::net::{IpAddr, SocketAddr};

use tokio::net::TcpStream;

use crate::pair_record::PairRecord;
use crate::usbmuxd::UsbmuxdAddr;
use crate::{DeviceConnection, DeviceError};

pub trait DeviceProvider: Unpin + Send + Sync + std::fmt::Debug {
    fn connect(
        &self,
        port: u16,
    ) -> impl std::future::Future<Output = Result<DeviceConnection, DeviceError>> + Send;
    fn label(&self) -> &str;
    fn udid(&self) -> &str;
    fn get_pair_record(
        &self,
    ) -> impl std::future::Future<Output = Result<PairRecord, DeviceError>> + Send;
}

/// Opens tunneled connections through the multiplexing daemon
#[derive(Debug)]
pub struct UsbmuxdProvider {
    pub(crate) addr: UsbmuxdAddr,
    pub(crate) udid: String,
    pub(crate) device_id: u32,
    pub(crate) label: String,
}

impl DeviceProvider for UsbmuxdProvider {
    async fn connect(&self, port: u16) -> Result<DeviceConnection, DeviceError> {
        let usbmuxd = self.addr.connect().await?;
        usbmuxd
            .connect_to_device(self.device_id, port, &self.label)
            .await
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn udid(&self) -> &str {
        &self.udid
    }

    async fn get_pair_record(&self) -> Result<PairRecord, DeviceError> {
        let mut usbmuxd = self.addr.connect().await?;
        usbmuxd.get_pair_record(&self.udid).await
    }
}

/// Connects straight to a device address, with a caller-supplied record
#[derive(Debug)]
pub struct TcpProvider {
    pub addr: IpAddr,
    pub pair_record: PairRecord,
    pub label: String,
}

impl DeviceProvider for TcpProvider {
    async fn connect(&self, port: u16) -> Result<DeviceConnection, DeviceError> {
        let stream = TcpStream::connect(SocketAddr::new(self.addr, port)).await?;
        Ok(DeviceConnection::new(Box::new(stream), self.label.clone()))
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn udid(&self) -> &str {
        self.pair_record.udid.as_deref().unwrap_or_default()
    }

    async fn get_pair_record(&self) -> Result<PairRecord, DeviceError> {
        Ok(self.pair_record.clone())
    }
}
