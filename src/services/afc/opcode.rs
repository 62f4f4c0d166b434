//! AFC operation codes.
//!
//! Only the operations the backup flow exercises are sent by this crate,
//! but the full code space is decodable so status replies never surface as
//! unknown opcodes.

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u64)]
pub enum AfcOpcode {
    Status = 0x01,
    Data = 0x02,
    ReadDir = 0x03,
    ReadFile = 0x04,
    WriteFile = 0x05,
    WritePart = 0x06,
    Truncate = 0x07,
    RemovePath = 0x08,
    MakeDir = 0x09,
    GetFileInfo = 0x0a,
    GetDevInfo = 0x0b,
    WriteFileAtom = 0x0c,
    FileOpen = 0x0d,
    FileOpenRes = 0x0e,
    Read = 0x0f,
    Write = 0x10,
    FileSeek = 0x11,
    FileTell = 0x12,
    FileTellRes = 0x13,
    FileClose = 0x14,
    FileSetSize = 0x15,
    GetConInfo = 0x16,
    SetConOptions = 0x17,
    RenamePath = 0x18,
    SetFsBs = 0x19,
    SetSocketBs = 0x1A,
    FileLock = 0x1B,
    MakeLink = 0x1C,
    SetFileTime = 0x1E,
    RemovePathAndContents = 0x22,
}

/// Open modes for `FileOpen`, mirroring fopen(3) semantics
#[derive(Clone, Copy, Debug)]
#[repr(u64)]
pub enum AfcFileMode {
    ReadOnly = 0x01,
    ReadWrite = 0x02,
    WriteOnly = 0x03,
    WriteTruncate = 0x04,
    Append = 0x05,
    ReadAppend = 0x06,
}

/// Lock operations for `FileLock`, mirroring flock(2)
#[derive(Clone, Copy, Debug)]
#[repr(u64)]
pub enum AfcLockOp {
    Shared = 1 | 4,
    Exclusive = 2 | 4,
    Unlock = 8 | 4,
}

impl TryFrom<u64> for AfcOpcode {
    type Error = ();

    fn try_from(value: u64) -> Result<Self, Self::Error> {
        Ok(match value {
            0x01 => Self::Status,
            0x02 => Self::Data,
            0x03 => Self::ReadDir,
            0x04 => Self::ReadFile,
            0x05 => Self::WriteFile,
            0x06 => Self::WritePart,
            0x07 => Self::Truncate,
            0x08 => Self::RemovePath,
            0x09 => Self::MakeDir,
            0x0a => Self::GetFileInfo,
            0x0b => Self::GetDevInfo,
            0x0c => Self::WriteFileAtom,
            0x0d => Self::FileOpen,
            0x0e => Self::FileOpenRes,
            0x0f => Self::Read,
            0x10 => Self::Write,
            0x11 => Self::FileSeek,
            0x12 => Self::FileTell,
            0x13 => Self::FileTellRes,
            0x14 => Self::FileClose,
            0x15 => Self::FileSetSize,
            0x16 => Self::GetConInfo,
            0x17 => Self::SetConOptions,
            0x18 => Self::RenamePath,
            0x19 => Self::SetFsBs,
            0x1A => Self::SetSocketBs,
            0x1B => Self::FileLock,
            0x1C => Self::MakeLink,
            0x1E => Self::SetFileTime,
            0x22 => Self::RemovePathAndContents,
            _ => return Err(()),
        })
    }
}
