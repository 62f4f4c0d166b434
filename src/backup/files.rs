//! File transfer sublanguage of the backup exchange.
//!
//! Both directions frame file content the same way: length-prefixed path
//! strings, then a sequence of `{i32 BE size}{code byte}{size-1 bytes}`
//! chunks, with a zero size ending a file, a negative size ending a
//! batch, and a zero path length ending a batch normally. In a
//! `DLMessageUploadFiles` batch the device pushes backup data for the
//! host to store; a `DLMessageDownloadFiles` request asks the host to
//! stream previously stored files (Status.plist re-reads, restores) back
//! to the device.

use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};

use log::{debug, warn};
use plist::Value;
use tokio_util::sync::CancellationToken;

use super::{BackupEvent, BackupFile, EventSink};
use crate::{DeviceConnection, DeviceError};

pub const CODE_SUCCESS: u8 = 0x00;
pub const CODE_LOCAL_ERROR: u8 = 0x06;
pub const CODE_REMOTE_ERROR: u8 = 0x0b;
pub const CODE_FILE_DATA: u8 = 0x0c;

/// Chunk granularity for file content moving in either direction
pub const TRANSFER_BUF_LEN: usize = 32 * 1024;

/// Result of one received batch
#[derive(Debug, Default)]
pub struct ReceiveReport {
    pub received: Vec<BackupFile>,
    pub failed: Vec<BackupFile>,
    pub cancelled: bool,
}

/// Joins a device-supplied relative path onto `base`, refusing anything
/// that would escape it. Rejects absolute paths and any `..` component.
pub(crate) fn safe_join(base: &Path, relative: &str) -> Option<PathBuf> {
    let rel = Path::new(relative);
    if rel.is_absolute() {
        return None;
    }
    let mut out = base.to_path_buf();
    for component in rel.components() {
        match component {
            Component::Normal(c) => out.push(c),
            Component::CurDir => {}
            _ => return None,
        }
    }
    Some(out)
}

/// Receives one batch of files pushed by `DLMessageUploadFiles`.
///
/// Per-file transfer errors are recorded and reported, never fatal; only
/// I/O failures on the stream itself abort. Cancellation is honored at
/// chunk boundaries.
pub(crate) async fn receive_files(
    conn: &mut DeviceConnection,
    device_dir: &Path,
    events: &EventSink,
    cancel: &CancellationToken,
) -> Result<ReceiveReport, DeviceError> {
    let mut report = ReceiveReport::default();

    loop {
        if cancel.is_cancelled() {
            report.cancelled = true;
            return Ok(report);
        }

        let dlen = read_u32(conn).await?;
        if dlen == 0 {
            // terminating zero dword, end of batch
            return Ok(report);
        }
        let device_path = read_string(conn, dlen as usize).await?;

        let blen = read_u32(conn).await?;
        if blen == 0 || blen > i32::MAX as u32 {
            // The device is expected to always send the second path; treat
            // its absence as the end of the batch rather than an error.
            warn!("Missing backup path after {device_path:?}, ending batch");
            return Ok(report);
        }
        let backup_path = read_string(conn, blen as usize).await?;
        debug!("Receiving {device_path} -> {backup_path}");

        match safe_join(device_dir, &backup_path) {
            Some(local_path) => {
                let file = BackupFile {
                    device_path,
                    backup_path,
                    local_path,
                };
                receive_one(conn, file, &mut report, events, cancel).await?;
                if report.cancelled {
                    return Ok(report);
                }
            }
            None => {
                warn!("Rejecting unsafe backup path {backup_path:?}");
                let file = BackupFile {
                    device_path,
                    backup_path,
                    local_path: PathBuf::new(),
                };
                drain_file(conn).await?;
                events.emit(BackupEvent::FileTransferError(file.clone()));
                report.failed.push(file);
            }
        }
    }
}

/// Serves one `DLMessageDownloadFiles` request by streaming the named
/// files back to the device.
///
/// Each path is announced, then sent as data chunks with a success
/// trailer; a file that cannot be opened gets a local-error frame
/// instead. After the terminating zero dword the returned dictionary
/// holds one `DLFileErrorString`/`DLFileErrorCode` entry per failed path,
/// ready for a `-13 "Multi status"` response; it is empty when every file
/// went out.
pub(crate) async fn send_files(
    conn: &mut DeviceConnection,
    device_dir: &Path,
    paths: &[String],
) -> Result<plist::Dictionary, DeviceError> {
    let mut errors = plist::Dictionary::new();

    for path in paths {
        conn.send_raw(&(path.len() as u32).to_be_bytes()).await?;
        conn.send_raw(path.as_bytes()).await?;

        let opened = match safe_join(device_dir, path) {
            Some(local) => std::fs::File::open(&local),
            None => {
                warn!("Device requested unsafe path {path:?}");
                Err(std::io::Error::from(std::io::ErrorKind::NotFound))
            }
        };

        match opened {
            Ok(mut file) => {
                debug!("Sending {path} to device");
                let mut buf = vec![0u8; TRANSFER_BUF_LEN];
                loop {
                    let n = file.read(&mut buf).unwrap_or(0);
                    if n == 0 {
                        break;
                    }
                    conn.send_raw(&((n + 1) as u32).to_be_bytes()).await?;
                    conn.send_raw(&[CODE_FILE_DATA]).await?;
                    conn.send_raw(&buf[..n]).await?;
                }
                conn.send_raw(&1u32.to_be_bytes()).await?;
                conn.send_raw(&[CODE_SUCCESS]).await?;
            }
            Err(e) => {
                let desc = e.to_string();
                warn!("Cannot send {path}: {desc}");
                conn.send_raw(&((desc.len() + 1) as u32).to_be_bytes())
                    .await?;
                conn.send_raw(&[CODE_LOCAL_ERROR]).await?;
                conn.send_raw(desc.as_bytes()).await?;

                let code: i64 = match e.kind() {
                    std::io::ErrorKind::NotFound => -6,
                    _ => -1,
                };
                let mut entry = plist::Dictionary::new();
                entry.insert("DLFileErrorString".into(), desc.into());
                entry.insert("DLFileErrorCode".into(), code.into());
                errors.insert(path.clone(), Value::Dictionary(entry));
            }
        }
    }

    // terminating zero dword ends the batch
    conn.send_raw(&0u32.to_be_bytes()).await?;
    Ok(errors)
}

async fn receive_one(
    conn: &mut DeviceConnection,
    file: BackupFile,
    report: &mut ReceiveReport,
    events: &EventSink,
    cancel: &CancellationToken,
) -> Result<(), DeviceError> {
    events.emit(BackupEvent::BeforeReceivingFile(file.clone()));

    if let Some(parent) = file.local_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut out = std::fs::File::create(&file.local_path)?;

    loop {
        let size = read_i32(conn).await?;
        if size == 0 {
            // file ended without a success trailer; keep what we have
            warn!("File {} ended without completion code", file.backup_path);
            return Ok(());
        }
        if size < 0 {
            return Ok(());
        }

        let code = read_byte(conn).await?;
        let mut remaining = (size - 1) as usize;

        match code {
            CODE_FILE_DATA => {
                let mut buf = vec![0u8; TRANSFER_BUF_LEN];
                while remaining > 0 {
                    let n = remaining.min(TRANSFER_BUF_LEN);
                    conn.read_raw_into(&mut buf[..n]).await?;
                    out.write_all(&buf[..n])?;
                    remaining -= n;
                    events.emit(BackupEvent::FileReceiving {
                        file: file.clone(),
                        bytes: n,
                    });
                    if cancel.is_cancelled() {
                        // current chunk is flushed; abort before the next
                        report.cancelled = true;
                        return Ok(());
                    }
                }
            }
            CODE_SUCCESS => {
                if remaining > 0 {
                    conn.read_raw(remaining).await?;
                }
                out.flush()?;
                drop(out);
                events.emit(BackupEvent::FileReceived(file.clone()));
                report.received.push(file);
                return Ok(());
            }
            code => {
                let message = if remaining > 0 {
                    String::from_utf8_lossy(&conn.read_raw(remaining).await?).into_owned()
                } else {
                    String::new()
                };
                warn!(
                    "Transfer of {} failed with code {code:#04x}: {message}",
                    file.backup_path
                );
                events.emit(BackupEvent::FileTransferError(file.clone()));
                report.failed.push(file);
                return Ok(());
            }
        }
    }
}

/// Consumes a file's chunk stream without storing it, used when the
/// announced path was rejected.
async fn drain_file(conn: &mut DeviceConnection) -> Result<(), DeviceError> {
    loop {
        let size = read_i32(conn).await?;
        if size <= 0 {
            return Ok(());
        }
        let code = read_byte(conn).await?;
        let remaining = (size - 1) as usize;
        if remaining > 0 {
            conn.read_raw(remaining).await?;
        }
        if code != CODE_FILE_DATA {
            return Ok(());
        }
    }
}

async fn read_u32(conn: &mut DeviceConnection) -> Result<u32, DeviceError> {
    let buf = conn.read_raw(4).await?;
    Ok(u32::from_be_bytes(buf.try_into().unwrap()))
}

async fn read_i32(conn: &mut DeviceConnection) -> Result<i32, DeviceError> {
    let buf = conn.read_raw(4).await?;
    Ok(i32::from_be_bytes(buf.try_into().unwrap()))
}

async fn read_byte(conn: &mut DeviceConnection) -> Result<u8, DeviceError> {
    Ok(conn.read_raw(1).await?[0])
}

async fn read_string(conn: &mut DeviceConnection, len: usize) -> Result<String, DeviceError> {
    let buf = conn.read_raw(len).await?;
    Ok(String::from_utf8_lossy(&buf).into_owned())
}
