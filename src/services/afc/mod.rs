//! Apple File Conduit client, limited to the operations the backup
//! exchange uses: opening the sync lock file, flock-style locking, reading
//! device files for Info.plist assembly, and file info queries.

use std::collections::HashMap;

use log::warn;

use crate::{DeviceConnection, DeviceError, DeviceService};

pub mod errors;
pub mod opcode;
pub mod packet;

pub use errors::AfcError;
pub use opcode::{AfcFileMode, AfcLockOp, AfcOpcode};
pub use packet::{AfcPacket, AfcPacketHeader, MAGIC};

/// Path of the iTunes sync lock on every device
pub const SYNC_LOCK_PATH: &str = "/com.apple.itunes.lock_sync";

/// An open file on the device. Plain handle; the owning [`AfcClient`]
/// performs all operations, and the handle must be closed through it.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FileHandle(pub(crate) u64);

#[derive(Clone, Debug)]
pub struct FileInfo {
    pub size: usize,
    pub is_dir: bool,
    pub created: chrono::NaiveDateTime,
    pub modified: chrono::NaiveDateTime,
}

pub struct AfcClient {
    pub connection: DeviceConnection,
    packet_num: u64,
}

impl DeviceService for AfcClient {
    fn service_name() -> &'static str {
        "com.apple.afc"
    }

    async fn connect(
        provider: &impl crate::provider::DeviceProvider,
    ) -> Result<Self, DeviceError> {
        let connection =
            super::start_service_connection(provider, Self::service_name(), false).await?;
        Ok(Self::new(connection))
    }
}

impl AfcClient {
    pub fn new(connection: DeviceConnection) -> Self {
        Self {
            connection,
            packet_num: 0,
        }
    }

    /// Opens a file on the device
    pub async fn open(
        &mut self,
        path: impl Into<String>,
        mode: AfcFileMode,
    ) -> Result<FileHandle, DeviceError> {
        let path = path.into();
        let mut header_payload = (mode as u64).to_le_bytes().to_vec();
        header_payload.extend(path.as_bytes());

        let res = self
            .round_trip(AfcOpcode::FileOpen, header_payload)
            .await?;
        if res.header_payload.len() < 8 {
            warn!("FileOpen reply did not carry a handle");
            return Err(DeviceError::UnexpectedResponse);
        }
        let fd = u64::from_le_bytes(res.header_payload[..8].try_into().unwrap());
        Ok(FileHandle(fd))
    }

    /// Applies a lock operation to an open file.
    ///
    /// An exclusive lock on a contended file fails with
    /// [`AfcError::OpWouldBlock`], which callers retry through.
    pub async fn lock(&mut self, fd: FileHandle, op: AfcLockOp) -> Result<(), DeviceError> {
        let mut header_payload = fd.0.to_le_bytes().to_vec();
        header_payload.extend((op as u64).to_le_bytes());
        self.round_trip(AfcOpcode::FileLock, header_payload).await?;
        Ok(())
    }

    /// Closes an open file
    pub async fn close(&mut self, fd: FileHandle) -> Result<(), DeviceError> {
        let header_payload = fd.0.to_le_bytes().to_vec();
        self.round_trip(AfcOpcode::FileClose, header_payload)
            .await?;
        Ok(())
    }

    /// Reads an open file to the end
    pub async fn read_to_end(&mut self, fd: FileHandle) -> Result<Vec<u8>, DeviceError> {
        const MAX_TRANSFER: u64 = 64 * 1024;

        let mut collected = Vec::new();
        loop {
            let mut header_payload = fd.0.to_le_bytes().to_vec();
            header_payload.extend(MAX_TRANSFER.to_le_bytes());
            let res = self.round_trip(AfcOpcode::Read, header_payload).await?;
            if res.payload.is_empty() {
                break;
            }
            collected.extend(res.payload);
        }
        Ok(collected)
    }

    /// Convenience: open, read fully, close
    pub async fn read_path(&mut self, path: &str) -> Result<Vec<u8>, DeviceError> {
        let fd = self.open(path, AfcFileMode::ReadOnly).await?;
        let result = self.read_to_end(fd).await;
        // close even when the read failed
        let close_result = self.close(fd).await;
        let data = result?;
        close_result?;
        Ok(data)
    }

    /// Queries file metadata
    pub async fn get_file_info(&mut self, path: &str) -> Result<FileInfo, DeviceError> {
        let res = self
            .round_trip(AfcOpcode::GetFileInfo, path.as_bytes().to_vec())
            .await?;

        let strings: Vec<String> = res
            .payload
            .split(|b| *b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .collect();
        let kvs: HashMap<&str, &str> = strings
            .chunks_exact(2)
            .map(|chunk| (chunk[0].as_str(), chunk[1].as_str()))
            .collect();

        let size = kvs
            .get("st_size")
            .and_then(|x| x.parse::<usize>().ok())
            .ok_or(DeviceError::AfcMissingAttribute)?;
        let is_dir = kvs
            .get("st_ifmt")
            .map(|x| *x == "S_IFDIR")
            .ok_or(DeviceError::AfcMissingAttribute)?;
        let created = kvs
            .get("st_birthtime")
            .and_then(|x| x.parse::<i64>().ok())
            .map(|n| chrono::DateTime::from_timestamp_nanos(n).naive_local())
            .ok_or(DeviceError::AfcMissingAttribute)?;
        let modified = kvs
            .get("st_mtime")
            .and_then(|x| x.parse::<i64>().ok())
            .map(|n| chrono::DateTime::from_timestamp_nanos(n).naive_local())
            .ok_or(DeviceError::AfcMissingAttribute)?;

        Ok(FileInfo {
            size,
            is_dir,
            created,
            modified,
        })
    }

    /// Lists the entries of a directory on the device
    pub async fn list_dir(&mut self, path: &str) -> Result<Vec<String>, DeviceError> {
        let res = self
            .round_trip(AfcOpcode::ReadDir, path.as_bytes().to_vec())
            .await?;
        Ok(res
            .payload
            .split(|b| *b == 0)
            .filter(|s| !s.is_empty())
            .map(|s| String::from_utf8_lossy(s).into_owned())
            .filter(|s| s != "." && s != "..")
            .collect())
    }

    async fn round_trip(
        &mut self,
        operation: AfcOpcode,
        header_payload: Vec<u8>,
    ) -> Result<AfcPacket, DeviceError> {
        let packet = AfcPacket::request(operation, self.packet_num, header_payload);
        self.packet_num += 1;
        self.connection.send_raw(&packet.serialize()).await?;

        let res = AfcPacket::read(&mut self.connection).await?;
        if res.header.operation == AfcOpcode::Status {
            if res.header_payload.len() < 8 {
                warn!("AFC status reply without a code");
                return Err(DeviceError::UnexpectedResponse);
            }
            let code = u64::from_le_bytes(res.header_payload[..8].try_into().unwrap());
            let e = AfcError::from(code);
            if e != AfcError::Success {
                return Err(DeviceError::Afc(e));
            }
        }
        Ok(res)
    }
}
