//! RTCM3 Frame

use bytes::{BufMut, Bytes, BytesMut};
use crc::{Crc, CRC_24_LTE_A};

/// Frame preamble byte
pub const PREAMBLE: u8 = 0xD3;

/// Preamble plus the two bytes carrying the 10-bit payload length
pub const HEADER_LEN: usize = 3;

/// Trailing CRC24Q length
pub const CRC_LEN: usize = 3;

/// Largest payload a 10-bit length field can declare
pub const MAX_PAYLOAD_LEN: usize = 0x3FF;

// CRC-24Q (Qualcomm): poly 0x864CFB, init 0, no reflection, no final xor.
// The crc catalogue lists the same parameters as CRC-24/LTE-A.
const CRC24Q: Crc<u32> = Crc::<u32>::new(&CRC_24_LTE_A);

/// Compute CRC24Q over the given bytes
pub fn crc24q(data: &[u8]) -> u32 {
    CRC24Q.checksum(data)
}

/// Decoded RTCM3 frame
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RtcmFrame {
    /// Message number from the first 12 payload bits (0 if the payload is shorter than 2 bytes)
    pub message_type: u16,
    /// Declared payload length
    pub length: usize,
    /// Preamble, length header, payload and CRC exactly as received
    pub raw: Bytes,
    /// Whether the trailing CRC matched
    pub valid: bool,
}

impl RtcmFrame {
    /// Build a frame record from raw frame bytes. `raw` must hold a whole frame.
    pub(crate) fn from_raw(raw: Bytes, length: usize, valid: bool) -> Self {
        let payload = &raw[HEADER_LEN..HEADER_LEN + length];
        Self {
            message_type: message_type(payload).unwrap_or(0),
            length,
            raw,
            valid,
        }
    }

    /// Payload bytes between header and CRC
    pub fn payload(&self) -> &[u8] {
        &self.raw[HEADER_LEN..HEADER_LEN + self.length]
    }

    /// CRC value carried in the frame trailer
    pub fn crc(&self) -> u32 {
        let tail = &self.raw[HEADER_LEN + self.length..];
        u32::from_be_bytes([0, tail[0], tail[1], tail[2]])
    }

    /// Encode a payload into a complete frame with a correct CRC.
    ///
    /// Payloads longer than [`MAX_PAYLOAD_LEN`] are truncated to fit the
    /// length field.
    pub fn encode(payload: &[u8]) -> Bytes {
        let payload = &payload[..payload.len().min(MAX_PAYLOAD_LEN)];
        let len = payload.len();

        let mut buf = BytesMut::with_capacity(HEADER_LEN + len + CRC_LEN);
        buf.put_u8(PREAMBLE);
        buf.put_u16(len as u16 & 0x03FF);
        buf.put_slice(payload);

        let crc = crc24q(&buf);
        buf.put_slice(&crc.to_be_bytes()[1..]);
        buf.freeze()
    }
}

/// Message number carried in the top 12 bits of a payload
pub fn message_type(payload: &[u8]) -> Option<u16> {
    if payload.len() < 2 {
        return None;
    }
    Some(((payload[0] as u16) << 4) | ((payload[1] as u16) >> 4))
}

/// Declared payload length from the two bytes after the preamble
pub fn declared_length(header: &[u8]) -> usize {
    (((header[1] & 0x03) as usize) << 8) | header[2] as usize
}
