//! Status.plist decoding and snapshot state tracking.
//!
//! The device rewrites Status.plist throughout a backup; each rewrite is
//! decoded wholesale into [`BackupStatus`]. The snapshot stage only ever
//! moves forward, except that a read timeout legitimately drops the engine
//! back to `Waiting`.

use std::path::Path;

use log::warn;

use crate::DeviceError;

/// Ordinal stage within a single backup, as reported via Status.plist
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum SnapshotState {
    Uninitialized,
    Waiting,
    Modeling,
    Metadata,
    Running,
    Finished,
}

impl SnapshotState {
    pub fn parse(s: &str) -> Self {
        match s.to_ascii_lowercase().as_str() {
            "waiting" => Self::Waiting,
            "modeling" => Self::Modeling,
            "metadata" => Self::Metadata,
            "running" | "uploading" => Self::Running,
            "finished" => Self::Finished,
            other => {
                if other != "uninitialized" {
                    warn!("Unknown snapshot state {other:?}");
                }
                Self::Uninitialized
            }
        }
    }
}

/// Enforces forward-only snapshot transitions
#[derive(Debug)]
pub struct SnapshotTracker {
    current: SnapshotState,
}

impl SnapshotTracker {
    pub fn new() -> Self {
        Self {
            current: SnapshotState::Uninitialized,
        }
    }

    pub fn current(&self) -> SnapshotState {
        self.current
    }

    /// Advances to `next` if it is not a backwards transition. Backwards
    /// reports are logged and dropped; the device occasionally repeats an
    /// earlier stage in a stale Status.plist.
    pub fn advance(&mut self, next: SnapshotState) {
        if next >= self.current {
            self.current = next;
        } else {
            warn!(
                "Ignoring backwards snapshot transition {:?} -> {next:?}",
                self.current
            );
        }
    }

    /// The one sanctioned backwards transition: a transient read timeout
    /// re-enters `Waiting`.
    pub fn reenter_waiting(&mut self) {
        self.current = SnapshotState::Waiting;
    }
}

impl Default for SnapshotTracker {
    fn default() -> Self {
        Self::new()
    }
}

/// Decoded Status.plist
#[derive(Debug, Clone)]
pub struct BackupStatus {
    pub snapshot_state: SnapshotState,
    pub backup_state: String,
    pub date: Option<plist::Date>,
    pub version: String,
    pub uuid: String,
    pub is_full_backup: bool,
}

impl BackupStatus {
    pub fn from_file(path: &Path) -> Result<Self, DeviceError> {
        let bytes = std::fs::read(path)?;
        Self::from_bytes(&bytes)
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, DeviceError> {
        let dict: plist::Dictionary = plist::from_bytes(bytes)?;
        Ok(Self {
            snapshot_state: dict
                .get("SnapshotState")
                .and_then(|v| v.as_string())
                .map(SnapshotState::parse)
                .unwrap_or(SnapshotState::Uninitialized),
            backup_state: dict
                .get("BackupState")
                .and_then(|v| v.as_string())
                .unwrap_or_default()
                .to_string(),
            date: dict.get("Date").and_then(|v| v.as_date()),
            version: dict
                .get("Version")
                .and_then(|v| v.as_string())
                .unwrap_or_default()
                .to_string(),
            uuid: dict
                .get("UUID")
                .and_then(|v| v.as_string())
                .unwrap_or_default()
                .to_string(),
            is_full_backup: dict
                .get("IsFullBackup")
                .and_then(|v| v.as_boolean())
                .unwrap_or(false),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn states_are_ordered() {
        assert!(SnapshotState::Uninitialized < SnapshotState::Waiting);
        assert!(SnapshotState::Waiting < SnapshotState::Modeling);
        assert!(SnapshotState::Modeling < SnapshotState::Metadata);
        assert!(SnapshotState::Metadata < SnapshotState::Running);
        assert!(SnapshotState::Running < SnapshotState::Finished);
    }

    #[test]
    fn tracker_never_goes_backwards() {
        let mut tracker = SnapshotTracker::new();
        tracker.advance(SnapshotState::Running);
        tracker.advance(SnapshotState::Modeling);
        assert_eq!(tracker.current(), SnapshotState::Running);
        tracker.advance(SnapshotState::Finished);
        assert_eq!(tracker.current(), SnapshotState::Finished);
    }

    #[test]
    fn timeout_reenters_waiting() {
        let mut tracker = SnapshotTracker::new();
        tracker.advance(SnapshotState::Running);
        tracker.reenter_waiting();
        assert_eq!(tracker.current(), SnapshotState::Waiting);
        // and can move forward again afterwards
        tracker.advance(SnapshotState::Running);
        assert_eq!(tracker.current(), SnapshotState::Running);
    }

    #[test]
    fn status_plist_decodes() {
        let mut dict = plist::Dictionary::new();
        dict.insert("SnapshotState".into(), "finished".into());
        dict.insert("BackupState".into(), "new".into());
        dict.insert("Version".into(), "3.3".into());
        dict.insert("UUID".into(), "ABCD-1234".into());
        dict.insert("IsFullBackup".into(), true.into());
        let mut buf = Vec::new();
        plist::to_writer_xml(&mut buf, &dict).unwrap();

        let status = BackupStatus::from_bytes(&buf).unwrap();
        assert_eq!(status.snapshot_state, SnapshotState::Finished);
        assert_eq!(status.backup_state, "new");
        assert_eq!(status.version, "3.3");
        assert!(status.is_full_backup);
    }
}
