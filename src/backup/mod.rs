//! Device backup engine.
//!
//! Drives the full mobilebackup2 conversation: sync lock acquisition over
//! AFC, the `Backup` request, the DeviceLink message loop with its file
//! transfer sublanguage, Info.plist assembly, and deterministic teardown
//! on every exit path.
//!
//! All I/O for one backup runs on a single task; callers observe it
//! through a [`BackupEvent`] channel and control it through a
//! [`CancellationToken`].

mod files;
mod info;
mod status;

pub use files::{
    ReceiveReport, CODE_FILE_DATA, CODE_LOCAL_ERROR, CODE_REMOTE_ERROR, CODE_SUCCESS,
};
pub use status::{BackupStatus, SnapshotState, SnapshotTracker};

use std::path::{Path, PathBuf};
use std::time::Duration;

use log::{debug, info as log_info, warn};
use plist::{Dictionary, Value};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::devicelink::{self, DeviceLink};
use crate::lockdown::LockdownClient;
use crate::provider::DeviceProvider;
use crate::services::afc::{AfcClient, AfcError, AfcFileMode, AfcLockOp, FileHandle, SYNC_LOCK_PATH};
use crate::services::diagnostics::DiagnosticsRelayClient;
use crate::services::installation_proxy::InstallationProxyClient;
use crate::services::mobilebackup2::Mobilebackup2Client;
use crate::services::notifications::{self, NotificationProxyClient};
use crate::services::springboard::SpringBoardServicesClient;
use crate::usbmuxd::UsbmuxdAddr;
use crate::{DeviceError, DeviceService};

/// One file announced by the device during a backup
#[derive(Debug, Clone)]
pub struct BackupFile {
    /// Path on the device
    pub device_path: String,
    /// Path relative to the per-device backup directory
    pub backup_path: String,
    /// Resolved location on local disk
    pub local_path: PathBuf,
}

/// Everything the engine reports while a backup runs
#[derive(Debug, Clone)]
pub enum BackupEvent {
    Started,
    Status(String),
    /// Percentage scaled 0-100, as the device reports it
    Progress(f64),
    BeforeReceivingFile(BackupFile),
    FileReceiving { file: BackupFile, bytes: usize },
    FileReceived(BackupFile),
    FileTransferError(BackupFile),
    /// The device will prompt for its passcode before backing up
    PasscodeRequiredForBackup,
    Error(String),
    Completed {
        failed_files: Vec<BackupFile>,
        user_cancelled: bool,
        device_disconnected: bool,
    },
}

/// Fan-out side of the engine's event channel.
///
/// The engine never knows (or waits on) whatever consumes the events; a
/// sink built from a dropped receiver silently discards them.
#[derive(Clone)]
pub struct EventSink {
    tx: Option<mpsc::UnboundedSender<BackupEvent>>,
}

impl EventSink {
    pub fn new(tx: mpsc::UnboundedSender<BackupEvent>) -> Self {
        Self { tx: Some(tx) }
    }

    /// A sink that discards everything
    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub(crate) fn emit(&self, event: BackupEvent) {
        if let Some(tx) = &self.tx {
            let _ = tx.send(event);
        }
    }
}

/// Caller-tunable backup parameters
#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Directory that holds one subdirectory per device UDID
    pub backup_root: PathBuf,
    pub force_full_backup: bool,
    /// Read timeout on the service socket; a timeout is treated as
    /// "device not ready" and retried
    pub socket_timeout: Duration,
}

impl BackupOptions {
    pub fn new(backup_root: impl Into<PathBuf>) -> Self {
        Self {
            backup_root: backup_root.into(),
            force_full_backup: false,
            socket_timeout: Duration::from_secs(180),
        }
    }

    pub fn force_full_backup(mut self, force: bool) -> Self {
        self.force_full_backup = force;
        self
    }
}

/// Terminal state of one backup run
#[derive(Debug, Clone, Default)]
pub struct BackupSummary {
    pub failed_files: Vec<BackupFile>,
    pub user_cancelled: bool,
    pub device_disconnected: bool,
}

/// A backup session factory; at most one backup runs per instance at a time
pub struct DeviceBackup {
    options: BackupOptions,
    events: EventSink,
    cancel: CancellationToken,
    in_progress: bool,
}

impl DeviceBackup {
    pub fn new(options: BackupOptions, events: EventSink, cancel: CancellationToken) -> Self {
        Self {
            options,
            events,
            cancel,
            in_progress: false,
        }
    }

    /// Token that aborts the running backup when cancelled
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs a complete backup of the provider's device.
    ///
    /// User cancellation is a normal outcome reported in the summary. A
    /// mid-backup device disconnect, once confirmed by the multiplexer,
    /// surfaces as [`DeviceError::DeviceDisconnected`]; the final
    /// `Completed` event carries the disconnect flag either way. The AFC
    /// sync lock and every service connection are released on all paths.
    pub async fn run(
        &mut self,
        provider: &impl DeviceProvider,
    ) -> Result<BackupSummary, DeviceError> {
        if self.in_progress {
            return Err(DeviceError::InternalError(
                "a backup is already in progress".into(),
            ));
        }
        self.in_progress = true;

        let mut summary = BackupSummary::default();
        let result = self.run_inner(provider, &mut summary).await;
        self.in_progress = false;

        let result = match result {
            Err(DeviceError::Socket(e)) => {
                // The stream died mid-exchange; ask the multiplexer
                // whether the device is still there before blaming it
                if device_disconnected(provider.udid()).await {
                    summary.device_disconnected = true;
                    Err(DeviceError::DeviceDisconnected)
                } else {
                    Err(DeviceError::Socket(e))
                }
            }
            other => other,
        };

        if let Err(e) = &result {
            self.events.emit(BackupEvent::Error(e.to_string()));
        }
        self.events.emit(BackupEvent::Completed {
            failed_files: summary.failed_files.clone(),
            user_cancelled: summary.user_cancelled,
            device_disconnected: summary.device_disconnected,
        });

        result.map(|_| summary)
    }

    async fn run_inner(
        &self,
        provider: &impl DeviceProvider,
        summary: &mut BackupSummary,
    ) -> Result<(), DeviceError> {
        let udid = provider.udid().to_string();
        let device_dir = self.options.backup_root.join(&udid);

        let mut lockdown = LockdownClient::connect(provider).await?;
        let pair_record = provider.get_pair_record().await?;
        lockdown.start_session(&pair_record).await?;

        let product_version = lockdown
            .get_string_value("ProductVersion", None)
            .await
            .ok();

        if let Ok(will_encrypt) = lockdown
            .get_value(Some("WillEncrypt"), Some("com.apple.mobile.backup"))
            .await
        {
            log_info!("Backup encryption enabled on device: {will_encrypt:?}");
        }

        if let Some(version) = product_version.as_deref().and_then(OsVersion::parse) {
            if version.requires_passcode_check()
                && passcode_configured(provider).await.unwrap_or(true)
            {
                self.events.emit(BackupEvent::PasscodeRequiredForBackup);
            }
        }

        self.events.emit(BackupEvent::Started);

        let mut notifications = NotificationProxyClient::connect(provider).await?;
        for name in [
            notifications::SYNC_CANCEL_REQUEST,
            notifications::SYNC_SUSPEND_REQUEST,
            notifications::SYNC_RESUME_REQUEST,
        ] {
            if let Err(e) = notifications.observe(name).await {
                debug!("Could not observe {name}: {e}");
            }
        }

        let mut afc = AfcClient::connect(provider).await?;
        let mut mb2 = Mobilebackup2Client::connect(provider).await?;

        // The Hello exchange succeeded, so the device is talking to us;
        // assemble Info.plist before the device starts asking for it.
        std::fs::create_dir_all(&device_dir)?;
        self.write_info_plist(provider, &mut lockdown, &mut afc, &device_dir, &udid)
            .await?;

        let lock = acquire_sync_lock(&mut afc, &mut notifications).await?;
        let locked_result = self
            .run_locked(&mut mb2, &udid, &device_dir, summary)
            .await;
        release_sync_lock(&mut afc, &mut notifications, lock).await;

        let _ = mb2.disconnect().await;
        let _ = notifications.shutdown().await;
        lockdown.goodbye().await;

        locked_result
    }

    /// The part of the session that must hold the sync lock
    async fn run_locked(
        &self,
        mb2: &mut Mobilebackup2Client,
        udid: &str,
        device_dir: &Path,
        summary: &mut BackupSummary,
    ) -> Result<(), DeviceError> {
        let mut options = Dictionary::new();
        options.insert(
            "ForceFullBackup".into(),
            self.options.force_full_backup.into(),
        );
        mb2.send_request("Backup", udid, udid, Some(options)).await?;

        let mut exchange = BackupExchange {
            link: &mut mb2.link,
            device_dir: device_dir.to_path_buf(),
            events: self.events.clone(),
            cancel: self.cancel.clone(),
            timeout: self.options.socket_timeout,
            snapshot: SnapshotTracker::new(),
        };
        exchange.run(summary).await
    }

    async fn write_info_plist(
        &self,
        provider: &impl DeviceProvider,
        lockdown: &mut LockdownClient,
        afc: &mut AfcClient,
        device_dir: &Path,
        udid: &str,
    ) -> Result<(), DeviceError> {
        let mut installation_proxy = InstallationProxyClient::connect(provider).await?;
        let mut springboard = match SpringBoardServicesClient::connect(provider).await {
            Ok(client) => Some(client),
            Err(e) => {
                debug!("SpringBoard services unavailable, skipping icons: {e}");
                None
            }
        };

        let sources = info::collect_info_sources(
            lockdown,
            &mut installation_proxy,
            springboard.as_mut(),
            afc,
        )
        .await?;
        let info_plist = info::assemble_info_plist(sources, udid);

        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &info_plist)?;
        std::fs::write(device_dir.join("Info.plist"), buf)?;
        Ok(())
    }
}

/// Number of exclusive-lock attempts before giving up
const LOCK_ATTEMPTS: u32 = 50;
/// Delay between lock attempts
const LOCK_WAIT: Duration = Duration::from_millis(200);

/// Acquires the iTunes sync lock, with the notification choreography the
/// device expects around it.
async fn acquire_sync_lock(
    afc: &mut AfcClient,
    notifications: &mut NotificationProxyClient,
) -> Result<FileHandle, DeviceError> {
    notifications.post(notifications::SYNC_WILL_START).await?;
    let fd = afc.open(SYNC_LOCK_PATH, AfcFileMode::ReadWrite).await?;
    notifications
        .post(notifications::SYNC_LOCK_REQUEST)
        .await?;

    for _ in 0..LOCK_ATTEMPTS {
        match afc.lock(fd, AfcLockOp::Exclusive).await {
            Ok(()) => {
                notifications.post(notifications::SYNC_DID_START).await?;
                return Ok(fd);
            }
            Err(DeviceError::Afc(AfcError::OpWouldBlock)) => {
                tokio::time::sleep(LOCK_WAIT).await;
            }
            Err(e) => {
                let _ = afc.close(fd).await;
                return Err(e);
            }
        }
    }

    let _ = afc.close(fd).await;
    Err(DeviceError::Afc(AfcError::OpWouldBlock))
}

/// Releases the sync lock. Idempotent by construction: the handle is
/// consumed, and every step is best effort.
async fn release_sync_lock(
    afc: &mut AfcClient,
    notifications: &mut NotificationProxyClient,
    fd: FileHandle,
) {
    if let Err(e) = afc.lock(fd, AfcLockOp::Unlock).await {
        warn!("Unlocking sync lock failed: {e}");
    }
    if let Err(e) = afc.close(fd).await {
        warn!("Closing sync lock failed: {e}");
    }
    if let Err(e) = notifications.post(notifications::SYNC_DID_FINISH).await {
        warn!("syncDidFinish notification failed: {e}");
    }
}

/// Asks the multiplexer whether the device is still attached
async fn device_disconnected(udid: &str) -> bool {
    let addr = match UsbmuxdAddr::from_env_var() {
        Ok(addr) => addr,
        Err(_) => return false,
    };
    match addr.connect().await {
        Ok(mut conn) => matches!(conn.is_device_connected(udid).await, Ok(false)),
        Err(_) => false,
    }
}

/// Queries MobileGestalt's PasswordConfigured flag.
///
/// A `Deprecated` reply (seen on some OS versions for gestalt domains) is
/// conservatively treated as "passcode present".
async fn passcode_configured(provider: &impl DeviceProvider) -> Result<bool, DeviceError> {
    let mut diagnostics = DiagnosticsRelayClient::connect(provider).await?;
    let result = diagnostics.mobilegestalt(&["PasswordConfigured"]).await;
    let _ = diagnostics.goodbye().await;
    match result {
        Ok(Some(values)) => Ok(values
            .get("PasswordConfigured")
            .and_then(|v| v.as_boolean())
            .unwrap_or(false)),
        Ok(None) => Ok(false),
        Err(DeviceError::Deprecated) => Ok(true),
        Err(e) => Err(e),
    }
}

/// Dotted OS version triple
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
struct OsVersion(u32, u32, u32);

impl OsVersion {
    fn parse(s: &str) -> Option<Self> {
        let mut parts = s.split('.').map(|p| p.parse::<u32>().ok());
        let major = parts.next()??;
        let minor = parts.next().flatten().unwrap_or(0);
        let patch = parts.next().flatten().unwrap_or(0);
        Some(Self(major, minor, patch))
    }

    /// OS versions in [15.7.1, 16.0) and [16.1, ∞) refuse to back up
    /// passcode-configured devices without passcode entry.
    fn requires_passcode_check(self) -> bool {
        (self >= OsVersion(15, 7, 1) && self < OsVersion(16, 0, 0)) || self >= OsVersion(16, 1, 0)
    }
}

/// The receive/dispatch loop of one backup exchange
pub(crate) struct BackupExchange<'a> {
    pub(crate) link: &'a mut DeviceLink,
    pub(crate) device_dir: PathBuf,
    pub(crate) events: EventSink,
    pub(crate) cancel: CancellationToken,
    pub(crate) timeout: Duration,
    pub(crate) snapshot: SnapshotTracker,
}

impl BackupExchange<'_> {
    /// Runs until the device ends the exchange, a fatal error occurs, or
    /// the caller cancels. Per-file transfer failures accumulate in the
    /// summary instead of aborting.
    pub(crate) async fn run(&mut self, summary: &mut BackupSummary) -> Result<(), DeviceError> {
        loop {
            if self.cancel.is_cancelled() {
                summary.user_cancelled = true;
                return Ok(());
            }

            let (tag, msg) = match self.link.receive_timeout(self.timeout).await {
                Ok(received) => received,
                Err(DeviceError::ReceiveTimeout) => {
                    // the device pauses while it prepares a snapshot
                    self.snapshot.reenter_waiting();
                    self.events
                        .emit(BackupEvent::Status("Waiting for device".into()));
                    tokio::time::sleep(Duration::from_millis(100)).await;
                    continue;
                }
                Err(e) => return Err(e),
            };
            debug!("Backup exchange received {tag}");

            match tag.as_str() {
                "DLMessageUploadFiles" => {
                    // the device pushes backup data for us to store
                    let report = files::receive_files(
                        self.link.connection_mut(),
                        &self.device_dir,
                        &self.events,
                        &self.cancel,
                    )
                    .await?;

                    for file in &report.received {
                        self.refresh_status(file);
                    }
                    summary.failed_files.extend(report.failed);

                    self.link.send_status_response(0, None, None).await?;
                    self.emit_progress(&msg, 3);

                    if report.cancelled {
                        summary.user_cancelled = true;
                        return Ok(());
                    }
                }
                "DLMessageDownloadFiles" => {
                    // the device pulls files we stored earlier (Status.plist
                    // re-reads, restore data)
                    let paths = requested_paths(&msg);
                    let errors = files::send_files(
                        self.link.connection_mut(),
                        &self.device_dir,
                        &paths,
                    )
                    .await?;

                    if errors.is_empty() {
                        self.link.send_status_response(0, None, None).await?;
                    } else {
                        self.link
                            .send_status_response(
                                -13,
                                Some("Multi status"),
                                Some(Value::Dictionary(errors)),
                            )
                            .await?;
                    }
                    self.emit_progress(&msg, 3);
                }
                "DLMessageGetFreeDiskSpace" => {
                    let free = free_disk_space(&self.device_dir).unwrap_or(0);
                    self.link
                        .send_status_response(0, None, Some(Value::Integer(free.into())))
                        .await?;
                }
                "DLMessageContentsOfDirectory" => {
                    let contents = self.contents_of_directory(&msg);
                    self.link
                        .send_status_response(0, None, Some(Value::Dictionary(contents)))
                        .await?;
                }
                "DLMessageCreateDirectory" => {
                    let (code, message) = self.create_directory(&msg);
                    self.link
                        .send_status_response(code, message.as_deref(), None)
                        .await?;
                }
                "DLMessageMoveFiles" | "DLMessageMoveItems" => {
                    let code = self.move_files(&msg);
                    self.link.send_status_response(code, None, None).await?;
                    self.emit_progress(&msg, 3);
                }
                "DLMessageRemoveFiles" | "DLMessageRemoveItems" => {
                    let code = self.remove_files(&msg);
                    self.link.send_status_response(code, None, None).await?;
                    self.emit_progress(&msg, 3);
                }
                "DLMessageCopyItem" => {
                    self.copy_item(&msg);
                    self.link.send_status_response(0, None, None).await?;
                }
                "DLMessagePurgeDiskSpace" => {
                    self.link
                        .send_status_response(-1, Some("Operation not supported"), None)
                        .await?;
                }
                devicelink::PROCESS_MESSAGE => {
                    return self.process_message(&msg);
                }
                devicelink::DISCONNECT => {
                    debug!("Device requested disconnect");
                    return Ok(());
                }
                other => {
                    warn!("Unsupported DeviceLink message {other}");
                    self.link
                        .send_status_response(-1, Some("Operation not supported"), None)
                        .await?;
                }
            }
        }
    }

    /// Inner result codes carried by `DLMessageProcessMessage` terminate
    /// the exchange; 0 is success, the rest map to typed errors.
    fn process_message(&mut self, msg: &Value) -> Result<(), DeviceError> {
        let dict = devicelink::as_array(msg)?
            .get(1)
            .and_then(|v| v.as_dictionary())
            .ok_or(DeviceError::UnexpectedResponse)?;

        let code = dict
            .get("ErrorCode")
            .and_then(|c| c.as_signed_integer())
            .unwrap_or(0);
        match code {
            0 => {
                self.snapshot.advance(SnapshotState::Finished);
                Ok(())
            }
            -208 => Err(DeviceError::DeviceLocked),
            -38 | -207 => Err(DeviceError::PolicyDenied(code)),
            code => {
                let description = dict
                    .get("ErrorDescription")
                    .and_then(|d| d.as_string())
                    .unwrap_or_default()
                    .to_string();
                Err(DeviceError::BackupFailed(code, description))
            }
        }
    }

    /// The device rewrites Status.plist as the snapshot advances; decode
    /// each rewrite and track the stage.
    fn refresh_status(&mut self, file: &BackupFile) {
        if !file.backup_path.ends_with("Status.plist") {
            return;
        }
        match BackupStatus::from_file(&file.local_path) {
            Ok(status) => {
                self.snapshot.advance(status.snapshot_state);
                self.events.emit(BackupEvent::Status(format!(
                    "Snapshot {:?}",
                    self.snapshot.current()
                )));
            }
            Err(e) => warn!("Could not decode Status.plist: {e}"),
        }
    }

    fn emit_progress(&self, msg: &Value, index: usize) {
        if let Some(progress) = progress_at(msg, index) {
            self.events.emit(BackupEvent::Progress(progress));
        }
    }

    fn contents_of_directory(&self, msg: &Value) -> Dictionary {
        let mut contents = Dictionary::new();
        let dir = match message_string(msg, 1)
            .and_then(|rel| files::safe_join(&self.device_dir, &rel))
        {
            Some(dir) => dir,
            None => return contents,
        };
        let entries = match std::fs::read_dir(&dir) {
            Ok(entries) => entries,
            Err(_) => return contents,
        };
        for entry in entries.flatten() {
            let metadata = match entry.metadata() {
                Ok(m) => m,
                Err(_) => continue,
            };
            let mut file_dict = Dictionary::new();
            let file_type = if metadata.is_dir() {
                "DLFileTypeDirectory"
            } else if metadata.is_file() {
                "DLFileTypeRegular"
            } else {
                "DLFileTypeUnknown"
            };
            file_dict.insert("DLFileType".into(), file_type.into());
            file_dict.insert("DLFileSize".into(), metadata.len().into());
            contents.insert(
                entry.file_name().to_string_lossy().into_owned(),
                Value::Dictionary(file_dict),
            );
        }
        contents
    }

    fn create_directory(&self, msg: &Value) -> (i64, Option<String>) {
        let dir = match message_string(msg, 1)
            .and_then(|rel| files::safe_join(&self.device_dir, &rel))
        {
            Some(dir) => dir,
            None => return (-1, Some("Invalid path".into())),
        };
        match std::fs::create_dir_all(&dir) {
            Ok(()) => (0, None),
            Err(e) => (
                e.raw_os_error().unwrap_or(-1) as i64,
                Some(e.to_string()),
            ),
        }
    }

    fn move_files(&self, msg: &Value) -> i64 {
        let moves = match devicelink::as_array(msg)
            .ok()
            .and_then(|arr| arr.get(1))
            .and_then(|v| v.as_dictionary())
        {
            Some(map) => map,
            None => return -1,
        };
        for (from, to) in moves.iter() {
            let to = match to.as_string() {
                Some(to) => to,
                None => continue,
            };
            let (from, to) = match (
                files::safe_join(&self.device_dir, from),
                files::safe_join(&self.device_dir, to),
            ) {
                (Some(from), Some(to)) => (from, to),
                _ => return -1,
            };
            if let Some(parent) = to.parent() {
                let _ = std::fs::create_dir_all(parent);
            }
            // moving over an existing target replaces it
            if let Ok(metadata) = std::fs::metadata(&to) {
                let removed = if metadata.is_dir() {
                    std::fs::remove_dir_all(&to)
                } else {
                    std::fs::remove_file(&to)
                };
                if removed.is_err() {
                    return -1;
                }
            }
            if std::fs::rename(&from, &to).is_err() {
                return -1;
            }
        }
        0
    }

    fn remove_files(&self, msg: &Value) -> i64 {
        let items = match devicelink::as_array(msg)
            .ok()
            .and_then(|arr| arr.get(1))
            .and_then(|v| v.as_array())
        {
            Some(items) => items,
            None => return -1,
        };
        for item in items {
            let path = match item
                .as_string()
                .and_then(|rel| files::safe_join(&self.device_dir, rel))
            {
                Some(path) => path,
                None => continue,
            };
            let result = match std::fs::metadata(&path) {
                Ok(m) if m.is_dir() => std::fs::remove_dir_all(&path),
                Ok(_) => std::fs::remove_file(&path),
                // already absent is fine
                Err(_) => continue,
            };
            if result.is_err() {
                return -1;
            }
        }
        0
    }

    fn copy_item(&self, msg: &Value) {
        let (src, dst) = match (message_string(msg, 1), message_string(msg, 2)) {
            (Some(src), Some(dst)) => (src, dst),
            _ => return,
        };
        let (src, dst) = match (
            files::safe_join(&self.device_dir, &src),
            files::safe_join(&self.device_dir, &dst),
        ) {
            (Some(src), Some(dst)) => (src, dst),
            _ => return,
        };
        if src.is_dir() {
            debug!("Skipping directory copy {src:?} -> {dst:?}");
            return;
        }
        if let Some(parent) = dst.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        if let Err(e) = std::fs::copy(&src, &dst) {
            warn!("Copy {src:?} -> {dst:?} failed: {e}");
        }
    }
}

fn message_string(msg: &Value, index: usize) -> Option<String> {
    devicelink::as_array(msg)
        .ok()?
        .get(index)?
        .as_string()
        .map(ToString::to_string)
}

/// The file list at index 1 of a `DLMessageDownloadFiles` request
fn requested_paths(msg: &Value) -> Vec<String> {
    devicelink::as_array(msg)
        .ok()
        .and_then(|arr| arr.get(1))
        .and_then(|v| v.as_array())
        .map(|paths| {
            paths
                .iter()
                .filter_map(|p| p.as_string().map(ToString::to_string))
                .collect()
        })
        .unwrap_or_default()
}

/// A real at `index` is the device's overall progress, 0-100
fn progress_at(msg: &Value, index: usize) -> Option<f64> {
    let progress = devicelink::as_array(msg).ok()?.get(index)?.as_real()?;
    (progress > 0.0).then_some(progress)
}

#[cfg(unix)]
fn free_disk_space(path: &Path) -> Option<u64> {
    use std::os::unix::ffi::OsStrExt;

    let cpath = std::ffi::CString::new(path.as_os_str().as_bytes()).ok()?;
    let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
    if unsafe { libc::statvfs(cpath.as_ptr(), &mut stat) } == 0 {
        Some(stat.f_frsize as u64 * stat.f_bavail as u64)
    } else {
        None
    }
}

#[cfg(not(unix))]
fn free_disk_space(_path: &Path) -> Option<u64> {
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::devicelink::tests::{read_array, write_array};
    use crate::DeviceConnection;
    use tokio::io::AsyncWriteExt;

    fn exchange_parts(
        client: tokio::io::DuplexStream,
        dir: &Path,
    ) -> (DeviceLink, EventSink, mpsc::UnboundedReceiver<BackupEvent>, PathBuf) {
        let link = DeviceLink::new(DeviceConnection::new(Box::new(client), "test"));
        let (tx, rx) = mpsc::unbounded_channel();
        (link, EventSink::new(tx), rx, dir.to_path_buf())
    }

    async fn run_exchange(
        mut link: DeviceLink,
        events: EventSink,
        device_dir: PathBuf,
        cancel: CancellationToken,
    ) -> (Result<(), DeviceError>, BackupSummary) {
        let mut exchange = BackupExchange {
            link: &mut link,
            device_dir,
            events,
            cancel,
            timeout: Duration::from_secs(5),
            snapshot: SnapshotTracker::new(),
        };
        let mut summary = BackupSummary::default();
        let result = exchange.run(&mut summary).await;
        (result, summary)
    }

    async fn send_process_result(server: &mut tokio::io::DuplexStream, code: i64) {
        let mut dict = Dictionary::new();
        dict.insert("ErrorCode".into(), code.into());
        write_array(
            server,
            vec![
                Value::String(devicelink::PROCESS_MESSAGE.into()),
                Value::Dictionary(dict),
            ],
        )
        .await;
    }

    #[tokio::test]
    async fn happy_path_backup_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let (client, mut server) = tokio::io::duplex(512 * 1024);
        let payload = vec![0x42u8; 1024];
        let expected = payload.clone();

        let device = tokio::spawn(async move {
            // device pushes a batch of backup data with overall progress
            write_array(
                &mut server,
                vec![
                    Value::String("DLMessageUploadFiles".into()),
                    Value::Array(vec![Value::String("00/abcdef".into())]),
                    Value::Integer(0u64.into()),
                    Value::Real(42.5),
                ],
            )
            .await;

            // raw file stream: device path, backup path, data, success
            for s in ["Media/whatever", "00/abcdef"] {
                server
                    .write_all(&(s.len() as u32).to_be_bytes())
                    .await
                    .unwrap();
                server.write_all(s.as_bytes()).await.unwrap();
            }
            server
                .write_all(&((payload.len() + 1) as i32).to_be_bytes())
                .await
                .unwrap();
            server.write_all(&[files::CODE_FILE_DATA]).await.unwrap();
            server.write_all(&payload).await.unwrap();
            server.write_all(&1i32.to_be_bytes()).await.unwrap();
            server.write_all(&[files::CODE_SUCCESS]).await.unwrap();
            server.write_all(&0u32.to_be_bytes()).await.unwrap();

            // host acknowledges the batch
            let status = read_array(&mut server).await;
            assert_eq!(status[0].as_string(), Some(devicelink::STATUS_RESPONSE));
            assert_eq!(status[1].as_signed_integer(), Some(0));

            // device reports success and the exchange ends
            send_process_result(&mut server, 0).await;
        });

        let (link, events, mut rx, device_dir) = exchange_parts(client, dir.path());
        let (result, summary) =
            run_exchange(link, events, device_dir, CancellationToken::new()).await;

        result.unwrap();
        assert!(summary.failed_files.is_empty());
        assert!(!summary.user_cancelled);

        let on_disk = std::fs::read(dir.path().join("00/abcdef")).unwrap();
        assert_eq!(on_disk, expected);

        let mut received = 0;
        let mut progress = Vec::new();
        while let Ok(ev) = rx.try_recv() {
            match ev {
                BackupEvent::FileReceived(_) => received += 1,
                BackupEvent::Progress(p) => progress.push(p),
                _ => {}
            }
        }
        assert_eq!(received, 1);
        assert_eq!(progress, vec![42.5]);
        device.await.unwrap();
    }

    #[tokio::test]
    async fn download_request_streams_stored_file_back() {
        use tokio::io::AsyncReadExt;

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("Status.plist"), b"snapshot state").unwrap();
        let (client, mut server) = tokio::io::duplex(256 * 1024);

        let device = tokio::spawn(async move {
            write_array(
                &mut server,
                vec![
                    Value::String("DLMessageDownloadFiles".into()),
                    Value::Array(vec![Value::String("Status.plist".into())]),
                ],
            )
            .await;

            // path announcement
            let mut len = [0u8; 4];
            server.read_exact(&mut len).await.unwrap();
            let mut path = vec![0; u32::from_be_bytes(len) as usize];
            server.read_exact(&mut path).await.unwrap();
            assert_eq!(path, b"Status.plist");

            // data chunk, success trailer, batch terminator
            server.read_exact(&mut len).await.unwrap();
            let mut chunk = vec![0; u32::from_be_bytes(len) as usize];
            server.read_exact(&mut chunk).await.unwrap();
            assert_eq!(chunk[0], files::CODE_FILE_DATA);
            assert_eq!(&chunk[1..], b"snapshot state");

            server.read_exact(&mut len).await.unwrap();
            assert_eq!(u32::from_be_bytes(len), 1);
            let mut code = [0u8; 1];
            server.read_exact(&mut code).await.unwrap();
            assert_eq!(code[0], files::CODE_SUCCESS);

            server.read_exact(&mut len).await.unwrap();
            assert_eq!(u32::from_be_bytes(len), 0);

            let status = read_array(&mut server).await;
            assert_eq!(status[1].as_signed_integer(), Some(0));

            write_array(
                &mut server,
                vec![Value::String(devicelink::DISCONNECT.into())],
            )
            .await;
        });

        let (link, events, _rx, device_dir) = exchange_parts(client, dir.path());
        let (result, summary) =
            run_exchange(link, events, device_dir, CancellationToken::new()).await;
        result.unwrap();
        assert!(summary.failed_files.is_empty());
        device.await.unwrap();
    }

    #[tokio::test]
    async fn missing_download_file_gets_multi_status() {
        use tokio::io::AsyncReadExt;

        let dir = tempfile::tempdir().unwrap();
        let (client, mut server) = tokio::io::duplex(64 * 1024);

        let device = tokio::spawn(async move {
            write_array(
                &mut server,
                vec![
                    Value::String("DLMessageDownloadFiles".into()),
                    Value::Array(vec![Value::String("00/missing".into())]),
                ],
            )
            .await;

            let mut len = [0u8; 4];
            server.read_exact(&mut len).await.unwrap();
            let mut path = vec![0; u32::from_be_bytes(len) as usize];
            server.read_exact(&mut path).await.unwrap();

            // local-error frame instead of data, then the terminator
            server.read_exact(&mut len).await.unwrap();
            let mut frame = vec![0; u32::from_be_bytes(len) as usize];
            server.read_exact(&mut frame).await.unwrap();
            assert_eq!(frame[0], files::CODE_LOCAL_ERROR);

            server.read_exact(&mut len).await.unwrap();
            assert_eq!(u32::from_be_bytes(len), 0);

            let status = read_array(&mut server).await;
            assert_eq!(status[1].as_signed_integer(), Some(-13));
            assert_eq!(status[2].as_string(), Some("Multi status"));
            let errors = status[3].as_dictionary().unwrap();
            let entry = errors
                .get("00/missing")
                .and_then(|v| v.as_dictionary())
                .unwrap();
            assert_eq!(
                entry
                    .get("DLFileErrorCode")
                    .and_then(|v| v.as_signed_integer()),
                Some(-6)
            );
            assert!(entry.get("DLFileErrorString").is_some());

            write_array(
                &mut server,
                vec![Value::String(devicelink::DISCONNECT.into())],
            )
            .await;
        });

        let (link, events, _rx, device_dir) = exchange_parts(client, dir.path());
        let (result, _) = run_exchange(link, events, device_dir, CancellationToken::new()).await;
        result.unwrap();
        device.await.unwrap();
    }

    #[tokio::test]
    async fn device_locked_code_is_typed() {
        let dir = tempfile::tempdir().unwrap();
        let (client, mut server) = tokio::io::duplex(64 * 1024);
        tokio::spawn(async move {
            send_process_result(&mut server, -208).await;
        });

        let (link, events, _rx, device_dir) = exchange_parts(client, dir.path());
        let (result, _) = run_exchange(link, events, device_dir, CancellationToken::new()).await;
        assert!(matches!(result, Err(DeviceError::DeviceLocked)));
    }

    #[tokio::test]
    async fn policy_codes_are_typed() {
        for code in [-38i64, -207] {
            let dir = tempfile::tempdir().unwrap();
            let (client, mut server) = tokio::io::duplex(64 * 1024);
            tokio::spawn(async move {
                send_process_result(&mut server, code).await;
            });

            let (link, events, _rx, device_dir) = exchange_parts(client, dir.path());
            let (result, _) =
                run_exchange(link, events, device_dir, CancellationToken::new()).await;
            match result {
                Err(DeviceError::PolicyDenied(c)) => assert_eq!(c, code),
                other => panic!("expected PolicyDenied, got {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn create_move_remove_handlers() {
        let dir = tempfile::tempdir().unwrap();
        let (client, mut server) = tokio::io::duplex(64 * 1024);

        let device = tokio::spawn(async move {
            write_array(
                &mut server,
                vec![
                    Value::String("DLMessageCreateDirectory".into()),
                    Value::String("new/dir".into()),
                ],
            )
            .await;
            let status = read_array(&mut server).await;
            assert_eq!(status[1].as_signed_integer(), Some(0));

            let mut moves = Dictionary::new();
            moves.insert("new/dir".into(), "moved/dir".into());
            write_array(
                &mut server,
                vec![
                    Value::String("DLMessageMoveFiles".into()),
                    Value::Dictionary(moves),
                ],
            )
            .await;
            let status = read_array(&mut server).await;
            assert_eq!(status[1].as_signed_integer(), Some(0));

            write_array(
                &mut server,
                vec![
                    Value::String("DLMessageRemoveFiles".into()),
                    Value::Array(vec![Value::String("moved/dir".into())]),
                ],
            )
            .await;
            let status = read_array(&mut server).await;
            assert_eq!(status[1].as_signed_integer(), Some(0));

            write_array(
                &mut server,
                vec![Value::String(devicelink::DISCONNECT.into())],
            )
            .await;
        });

        let (link, events, _rx, device_dir) = exchange_parts(client, dir.path());
        let moved = dir.path().join("moved/dir");
        let created = dir.path().join("new/dir");

        let (result, _) = run_exchange(link, events, device_dir, CancellationToken::new()).await;
        result.unwrap();

        assert!(!created.exists());
        assert!(!moved.exists());
        device.await.unwrap();
    }

    #[tokio::test]
    async fn free_disk_space_reply_is_positive() {
        let dir = tempfile::tempdir().unwrap();
        let (client, mut server) = tokio::io::duplex(64 * 1024);

        let device = tokio::spawn(async move {
            write_array(
                &mut server,
                vec![Value::String("DLMessageGetFreeDiskSpace".into())],
            )
            .await;
            let status = read_array(&mut server).await;
            assert_eq!(status[1].as_signed_integer(), Some(0));
            let free = status[3].as_unsigned_integer().unwrap();
            write_array(
                &mut server,
                vec![Value::String(devicelink::DISCONNECT.into())],
            )
            .await;
            free
        });

        let (link, events, _rx, device_dir) = exchange_parts(client, dir.path());
        let (result, _) = run_exchange(link, events, device_dir, CancellationToken::new()).await;
        result.unwrap();

        #[cfg(unix)]
        assert!(device.await.unwrap() > 0);
        #[cfg(not(unix))]
        device.await.unwrap();
    }

    #[tokio::test]
    async fn cancellation_before_receive_sets_flag() {
        let dir = tempfile::tempdir().unwrap();
        let (client, _server) = tokio::io::duplex(4096);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let (link, events, _rx, device_dir) = exchange_parts(client, dir.path());
        let (result, summary) = run_exchange(link, events, device_dir, cancel).await;
        result.unwrap();
        assert!(summary.user_cancelled);
    }

    #[tokio::test]
    async fn copy_item_always_acknowledges() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("src.txt"), b"contents").unwrap();
        let (client, mut server) = tokio::io::duplex(64 * 1024);

        let device = tokio::spawn(async move {
            write_array(
                &mut server,
                vec![
                    Value::String("DLMessageCopyItem".into()),
                    Value::String("src.txt".into()),
                    Value::String("dst.txt".into()),
                ],
            )
            .await;
            let status = read_array(&mut server).await;
            assert_eq!(status[1].as_signed_integer(), Some(0));
            write_array(
                &mut server,
                vec![Value::String(devicelink::DISCONNECT.into())],
            )
            .await;
        });

        let (link, events, _rx, device_dir) = exchange_parts(client, dir.path());
        let (result, _) = run_exchange(link, events, device_dir, CancellationToken::new()).await;
        result.unwrap();

        assert_eq!(
            std::fs::read(dir.path().join("dst.txt")).unwrap(),
            b"contents"
        );
        device.await.unwrap();
    }

    #[test]
    fn os_version_ranges() {
        // below the first range
        assert!(!OsVersion::parse("15.7").unwrap().requires_passcode_check());
        // [15.7.1, 16.0)
        assert!(OsVersion::parse("15.7.1").unwrap().requires_passcode_check());
        assert!(OsVersion::parse("15.7.9").unwrap().requires_passcode_check());
        // the gap [16.0, 16.1)
        assert!(!OsVersion::parse("16.0").unwrap().requires_passcode_check());
        assert!(!OsVersion::parse("16.0.3").unwrap().requires_passcode_check());
        // [16.1, ∞)
        assert!(OsVersion::parse("16.1").unwrap().requires_passcode_check());
        assert!(OsVersion::parse("17.4").unwrap().requires_passcode_check());
        assert!(OsVersion::parse("18.0").unwrap().requires_passcode_check());
    }

    #[test]
    fn os_version_parse_tolerates_short_forms() {
        assert_eq!(OsVersion::parse("16"), Some(OsVersion(16, 0, 0)));
        assert_eq!(OsVersion::parse("16.1"), Some(OsVersion(16, 1, 0)));
        assert_eq!(OsVersion::parse("garbage"), None);
    }
}
