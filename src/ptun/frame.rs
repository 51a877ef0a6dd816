//! PTUN tunnel framing.
//!
//! Frames sent to the USB host carry a 3-byte header consisting of a status byte
//! and the little-endian payload length. Frames received from the USB host carry
//! only the 2-byte little-endian payload length.

use byteorder::{ByteOrder, LE};
use bytes::{BufMut, Bytes, BytesMut};
use macaddr::MacAddr6;
use std::{fmt, io};

/// Maximum Ethernet frame length; frames must be strictly shorter.
pub const MAX_FRAME: usize = 1560;

/// Size of the buffer used for receiving frames from the USB host.
pub const BUFFER_SIZE: usize = 2048;

/// Header length of frames sent to the USB host.
pub const OUT_HEADER_SIZE: usize = 3;

/// Header length of frames received from the USB host.
pub const IN_HEADER_SIZE: usize = 2;

/// Status byte of a valid frame.
pub const STATUS_OK: u8 = 0;

/// Tunnel framing error.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameError {
    /// Payload length is not below [`MAX_FRAME`].
    Oversize(usize),
    /// The received data is shorter than its header announces.
    Truncated {
        /// Announced payload length.
        len: usize,
        /// Available payload bytes.
        available: usize,
    },
}

impl fmt::Display for FrameError {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Oversize(len) => write!(f, "frame of {len} bytes exceeds maximum of {} bytes", MAX_FRAME - 1),
            Self::Truncated { len, available } => {
                write!(f, "frame announces {len} bytes but only {available} bytes are available")
            }
        }
    }
}

impl std::error::Error for FrameError {}

impl From<FrameError> for io::Error {
    fn from(err: FrameError) -> Self {
        io::Error::new(io::ErrorKind::InvalidData, err)
    }
}

/// Encodes an Ethernet frame for sending to the USB host.
pub fn encode(payload: &[u8]) -> Result<Bytes, FrameError> {
    if payload.len() >= MAX_FRAME {
        return Err(FrameError::Oversize(payload.len()));
    }

    let mut buf = BytesMut::with_capacity(OUT_HEADER_SIZE + payload.len());
    buf.put_u8(STATUS_OK);
    buf.put_u16_le(payload.len() as u16);
    buf.put_slice(payload);
    Ok(buf.freeze())
}

/// Decodes a frame received from the USB host, returning its payload.
///
/// Bytes following the announced payload are ignored.
pub fn decode(data: &[u8]) -> Result<&[u8], FrameError> {
    if data.len() < IN_HEADER_SIZE {
        return Err(FrameError::Truncated { len: IN_HEADER_SIZE, available: data.len() });
    }

    let len = LE::read_u16(data) as usize;
    if len >= MAX_FRAME {
        return Err(FrameError::Oversize(len));
    }

    let payload = &data[IN_HEADER_SIZE..];
    if payload.len() < len {
        return Err(FrameError::Truncated { len, available: payload.len() });
    }
    Ok(&payload[..len])
}

/// Ethernet header, used for logging.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EthernetHeader {
    /// Destination address.
    pub dst: MacAddr6,
    /// Source address.
    pub src: MacAddr6,
    /// EtherType.
    pub ethertype: u16,
}

impl EthernetHeader {
    /// Header size.
    pub const SIZE: usize = 14;

    /// Parses the header of an Ethernet frame.
    pub fn parse(frame: &[u8]) -> Option<Self> {
        if frame.len() < Self::SIZE {
            return None;
        }
        let mac = |b: &[u8]| MacAddr6::new(b[0], b[1], b[2], b[3], b[4], b[5]);
        Some(Self { dst: mac(&frame[0..6]), src: mac(&frame[6..12]), ethertype: byteorder::BE::read_u16(&frame[12..14]) })
    }
}

impl fmt::Display for EthernetHeader {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(f, "{} -> {} type {:#06x}", self.src, self.dst, self.ethertype)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn encode_header() {
        let frame = encode(&[0xaa; 60]).unwrap();
        assert_eq!(frame.len(), 63);
        assert_eq!(&frame[..3], &[0, 60, 0]);
        assert!(frame[3..].iter().all(|&b| b == 0xaa));

        let frame = encode(&[0; 1514]).unwrap();
        assert_eq!(&frame[..3], &[0, 0xea, 0x05]);
    }

    #[test]
    fn encode_rejects_oversize() {
        assert_eq!(encode(&[0; MAX_FRAME]), Err(FrameError::Oversize(MAX_FRAME)));
        assert!(encode(&[0; MAX_FRAME - 1]).is_ok());
        assert_eq!(encode(&[]).unwrap().as_ref(), &[0, 0, 0]);
    }

    #[test]
    fn decode_bounds() {
        assert_eq!(decode(&[3, 0, 1, 2, 3, 9, 9]).unwrap(), &[1, 2, 3]);
        assert_eq!(decode(&[0, 0]).unwrap(), &[] as &[u8]);
        assert_eq!(decode(&[1]), Err(FrameError::Truncated { len: 2, available: 1 }));
        assert_eq!(decode(&[4, 0, 1]), Err(FrameError::Truncated { len: 4, available: 1 }));

        let oversize = (MAX_FRAME as u16).to_le_bytes();
        assert_eq!(decode(&oversize), Err(FrameError::Oversize(MAX_FRAME)));
        assert_eq!(decode(&[0xff, 0xff]), Err(FrameError::Oversize(0xffff)));
    }

    #[test]
    fn ethernet_header() {
        let mut frame = vec![0xff; 6];
        frame.extend_from_slice(&[0x02, 0, 0, 0, 0, 1]);
        frame.extend_from_slice(&[0x08, 0x06]);
        let hdr = EthernetHeader::parse(&frame).unwrap();
        assert_eq!(hdr.dst, MacAddr6::broadcast());
        assert_eq!(hdr.src, MacAddr6::new(2, 0, 0, 0, 0, 1));
        assert_eq!(hdr.ethertype, 0x0806);
        assert!(EthernetHeader::parse(&frame[..13]).is_none());
    }
}
