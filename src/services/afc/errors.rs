//! AFC status codes.
//!
//! Every reply packet with a `Status` opcode carries one of these codes
//! in its header payload. `OpWouldBlock` is the one retryable code: the
//! device returns it while another host still holds the sync lock.

use thiserror::Error;

#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
#[non_exhaustive]
pub enum AfcError {
    #[error("operation succeeded")]
    Success,
    #[error("unspecified device-side failure")]
    Unknown,
    #[error("malformed operation header")]
    InvalidHeader,
    #[error("device is out of resources")]
    NoResources,
    #[error("device could not read")]
    ReadFailed,
    #[error("device could not write")]
    WriteFailed,
    #[error("packet type not recognized")]
    UnknownPacketType,
    #[error("bad argument in request")]
    InvalidArgument,
    #[error("no such file or directory")]
    ObjectNotFound,
    #[error("target is a directory")]
    ObjectIsDirectory,
    #[error("permission denied")]
    PermissionDenied,
    #[error("service connection lost")]
    NotConnected,
    #[error("operation timed out")]
    TimedOut,
    #[error("request larger than the service accepts")]
    TooMuchData,
    #[error("end of data reached")]
    EndOfData,
    #[error("operation not supported by this device")]
    UnsupportedOperation,
    #[error("file or directory already exists")]
    ObjectExists,
    #[error("file is busy")]
    ObjectBusy,
    #[error("no space left on device")]
    NoSpaceLeft,
    #[error("lock is held elsewhere, try again")]
    OpWouldBlock,
    #[error("device-side io failure")]
    IoFailure,
    #[error("operation interrupted")]
    Interrupted,
    #[error("operation already in progress")]
    InProgress,
    #[error("internal device error")]
    InternalFailure,
    #[error("multiplexer error")]
    MuxError,
    #[error("device is out of memory")]
    NoMemory,
    #[error("not enough data in stream")]
    NotEnoughData,
    #[error("directory not empty")]
    DirectoryNotEmpty,
}

impl AfcError {
    /// Decodes the little-endian status code of a reply packet. Codes
    /// this crate has no name for decode as [`AfcError::Unknown`].
    pub fn from_status_code(code: u64) -> Self {
        use AfcError::*;
        match code {
            0 => Success,
            1 => Unknown,
            2 => InvalidHeader,
            3 => NoResources,
            4 => ReadFailed,
            5 => WriteFailed,
            6 => UnknownPacketType,
            7 => InvalidArgument,
            8 => ObjectNotFound,
            9 => ObjectIsDirectory,
            10 => PermissionDenied,
            11 => NotConnected,
            12 => TimedOut,
            13 => TooMuchData,
            14 => EndOfData,
            15 => UnsupportedOperation,
            16 => ObjectExists,
            17 => ObjectBusy,
            18 => NoSpaceLeft,
            19 => OpWouldBlock,
            20 => IoFailure,
            21 => Interrupted,
            22 => InProgress,
            23 => InternalFailure,
            30 => MuxError,
            31 => NoMemory,
            32 => NotEnoughData,
            33 => DirectoryNotEmpty,
            _ => Unknown,
        }
    }
}

impl From<u64> for AfcError {
    fn from(code: u64) -> Self {
        Self::from_status_code(code)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_contention_code_decodes() {
        assert_eq!(AfcError::from_status_code(19), AfcError::OpWouldBlock);
    }

    #[test]
    fn unassigned_codes_fall_back_to_unknown() {
        assert_eq!(AfcError::from_status_code(24), AfcError::Unknown);
        assert_eq!(AfcError::from_status_code(999), AfcError::Unknown);
    }
}
