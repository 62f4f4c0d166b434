//! AFC wire packets.
//!
//! Every packet starts with a 40-byte little-endian header: magic, total
//! length, header-payload length, packet number, opcode. Parameters (paths,
//! file handles) ride in the header payload; file data rides in the body.

use log::debug;

use crate::{DeviceConnection, DeviceError};

use super::opcode::AfcOpcode;

pub const MAGIC: u64 = 0x4141504c36414643; // "AAPL6AFC"

#[derive(Clone, Debug)]
pub struct AfcPacketHeader {
    pub magic: u64,
    pub entire_len: u64,
    pub header_payload_len: u64,
    pub packet_num: u64,
    pub operation: AfcOpcode,
}

#[derive(Clone, Debug)]
pub struct AfcPacket {
    pub header: AfcPacketHeader,
    pub header_payload: Vec<u8>,
    pub payload: Vec<u8>,
}

impl AfcPacketHeader {
    pub const LEN: u64 = 40;

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(Self::LEN as usize);
        out.extend_from_slice(&self.magic.to_le_bytes());
        out.extend_from_slice(&self.entire_len.to_le_bytes());
        out.extend_from_slice(&self.header_payload_len.to_le_bytes());
        out.extend_from_slice(&self.packet_num.to_le_bytes());
        out.extend_from_slice(&(self.operation as u64).to_le_bytes());
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, DeviceError> {
        if bytes.len() < Self::LEN as usize {
            return Err(DeviceError::UnexpectedResponse);
        }
        let mut chunks = bytes.chunks_exact(8);
        let magic = u64::from_le_bytes(chunks.next().unwrap().try_into().unwrap());
        let entire_len = u64::from_le_bytes(chunks.next().unwrap().try_into().unwrap());
        let header_payload_len = u64::from_le_bytes(chunks.next().unwrap().try_into().unwrap());
        let packet_num = u64::from_le_bytes(chunks.next().unwrap().try_into().unwrap());
        let operation = u64::from_le_bytes(chunks.next().unwrap().try_into().unwrap());

        if magic != MAGIC {
            return Err(DeviceError::InvalidAfcMagic);
        }
        let operation =
            AfcOpcode::try_from(operation).map_err(|_| DeviceError::UnknownAfcOpcode)?;

        Ok(Self {
            magic,
            entire_len,
            header_payload_len,
            packet_num,
            operation,
        })
    }

    pub async fn read(conn: &mut DeviceConnection) -> Result<Self, DeviceError> {
        let bytes = conn.read_raw(Self::LEN as usize).await?;
        Self::parse(&bytes)
    }
}

impl AfcPacket {
    /// Builds a parameter-only packet (no data body)
    pub fn request(operation: AfcOpcode, packet_num: u64, header_payload: Vec<u8>) -> Self {
        let header_len = header_payload.len() as u64 + AfcPacketHeader::LEN;
        Self {
            header: AfcPacketHeader {
                magic: MAGIC,
                entire_len: header_len,
                header_payload_len: header_len,
                packet_num,
                operation,
            },
            header_payload,
            payload: Vec::new(),
        }
    }

    pub fn serialize(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(self.header.entire_len as usize);
        out.extend_from_slice(&self.header.serialize());
        out.extend_from_slice(&self.header_payload);
        out.extend_from_slice(&self.payload);
        out
    }

    pub async fn read(conn: &mut DeviceConnection) -> Result<Self, DeviceError> {
        let header = AfcPacketHeader::read(conn).await?;
        debug!("afc header: {header:?}");
        let header_payload = conn
            .read_raw((header.header_payload_len - AfcPacketHeader::LEN) as usize)
            .await?;

        let payload = if header.header_payload_len == header.entire_len {
            Vec::new()
        } else {
            conn.read_raw((header.entire_len - header.header_payload_len) as usize)
                .await?
        };

        Ok(Self {
            header,
            header_payload,
            payload,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_round_trip() {
        let packet = AfcPacket::request(AfcOpcode::FileOpen, 3, b"/a/path\0".to_vec());
        let bytes = packet.serialize();
        assert_eq!(bytes.len(), packet.header.entire_len as usize);

        let header = AfcPacketHeader::parse(&bytes).unwrap();
        assert_eq!(header.operation, AfcOpcode::FileOpen);
        assert_eq!(header.packet_num, 3);
        assert_eq!(
            header.header_payload_len,
            AfcPacketHeader::LEN + 8
        );
    }

    #[test]
    fn bad_magic_is_rejected() {
        let mut packet = AfcPacket::request(AfcOpcode::FileOpen, 0, Vec::new());
        packet.header.magic = 0xDEADBEEF;
        let bytes = packet.serialize();
        assert!(matches!(
            AfcPacketHeader::parse(&bytes),
            Err(DeviceError::InvalidAfcMagic)
        ));
    }

    #[test]
    fn unknown_opcode_is_rejected() {
        let packet = AfcPacket::request(AfcOpcode::FileOpen, 0, Vec::new());
        let mut bytes = packet.serialize();
        bytes[32..40].copy_from_slice(&0xFFu64.to_le_bytes());
        assert!(matches!(
            AfcPacketHeader::parse(&bytes),
            Err(DeviceError::UnknownAfcOpcode)
        ));
    }
}
