//! Framed packet codec for the multiplexer socket.
//!
//! Every message is a 16-byte little-endian header (total length including
//! the header, protocol version, message type, tag) followed by the payload.
//! This client only ever speaks the plist variant: version 1, type 8, with
//! an XML plist as payload.

use crate::DeviceError;

/// Size of the fixed header in bytes
pub const HEADER_LEN: u32 = 16;

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MuxHeader {
    pub length: u32,
    pub version: u32,
    pub message_type: u32,
    pub tag: u32,
}

impl MuxHeader {
    pub fn serialize(&self) -> [u8; 16] {
        let mut out = [0u8; 16];
        out[0..4].copy_from_slice(&self.length.to_le_bytes());
        out[4..8].copy_from_slice(&self.version.to_le_bytes());
        out[8..12].copy_from_slice(&self.message_type.to_le_bytes());
        out[12..16].copy_from_slice(&self.tag.to_le_bytes());
        out
    }

    /// Decodes a header, rejecting lengths that cannot hold the header
    /// itself. A length below 16 means the stream is no longer framed and
    /// the connection must be abandoned.
    pub fn parse(buf: &[u8; 16]) -> Result<Self, DeviceError> {
        let length = u32::from_le_bytes(buf[0..4].try_into().unwrap());
        if length < HEADER_LEN {
            return Err(DeviceError::UnexpectedResponse);
        }
        Ok(Self {
            length,
            version: u32::from_le_bytes(buf[4..8].try_into().unwrap()),
            message_type: u32::from_le_bytes(buf[8..12].try_into().unwrap()),
            tag: u32::from_le_bytes(buf[12..16].try_into().unwrap()),
        })
    }

    pub fn payload_len(&self) -> usize {
        (self.length - HEADER_LEN) as usize
    }
}

/// One complete outgoing plist packet
pub struct RawPacket {
    pub header: MuxHeader,
    pub payload: Vec<u8>,
}

impl RawPacket {
    pub fn plist(
        message: &plist::Dictionary,
        version: u32,
        message_type: u32,
        tag: u32,
    ) -> Result<Self, DeviceError> {
        let mut payload = Vec::new();
        plist::to_writer_xml(&mut payload, message)?;
        Ok(Self {
            header: MuxHeader {
                length: payload.len() as u32 + HEADER_LEN,
                version,
                message_type,
                tag,
            },
            payload,
        })
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header.length as usize);
        out.extend_from_slice(&self.header.serialize());
        out.extend_from_slice(&self.payload);
        out
    }
}
