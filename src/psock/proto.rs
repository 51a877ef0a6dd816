//! PSOCK wire format.
//!
//! All fields are little-endian and packed without padding.

use byteorder::{ReadBytesExt, WriteBytesExt, LE};
use std::io::{Cursor, Result};

/// Magic value identifying PSOCK messages.
pub const MAGIC: u32 = 0x58415054;

/// Command codes carried in [`Header::cmd`].
///
/// The bridge forwards them without interpretation.
pub mod cmd {
    /// Connect to a remote endpoint.
    pub const CONNECT: u32 = 1;
    /// Send data.
    pub const SEND: u32 = 2;
    /// Receive data.
    pub const RECV: u32 = 3;
    /// Disconnect from the remote endpoint.
    pub const DISCONNECT: u32 = 4;
}

/// Request header sent by the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Header {
    /// Protocol magic, must equal [`MAGIC`].
    pub magic: u32,
    /// Message type.
    pub msg_type: u8,
    /// Platform dependent tag.
    pub sysdep: u8,
    /// Sub-header.
    pub subhdr: u16,
    /// Command code, see [`cmd`].
    pub cmd: u32,
    /// Length of the payload following the header.
    pub len: u32,
}

impl Header {
    /// Size of the encoded header.
    pub const SIZE: usize = 16;

    /// Creates a header with valid magic.
    pub fn new(cmd: u32, len: u32) -> Self {
        Self { magic: MAGIC, cmd, len, ..Default::default() }
    }

    /// Whether the magic is valid.
    pub fn is_valid(&self) -> bool {
        self.magic == MAGIC
    }

    /// Parses a header.
    pub fn parse(data: &[u8; Self::SIZE]) -> Self {
        let mut c = Cursor::new(&data[..]);
        Self::read(&mut c).unwrap_or_default()
    }

    fn read(c: &mut Cursor<&[u8]>) -> Result<Self> {
        Ok(Self {
            magic: c.read_u32::<LE>()?,
            msg_type: c.read_u8()?,
            sysdep: c.read_u8()?,
            subhdr: c.read_u16::<LE>()?,
            cmd: c.read_u32::<LE>()?,
            len: c.read_u32::<LE>()?,
        })
    }

    /// Encodes the header.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut data = [0; Self::SIZE];
        let mut c = Cursor::new(&mut data[..]);
        // Writing into a buffer of the exact size cannot fail.
        let _ = self.write(&mut c);
        data
    }

    fn write(&self, c: &mut Cursor<&mut [u8]>) -> Result<()> {
        c.write_u32::<LE>(self.magic)?;
        c.write_u8(self.msg_type)?;
        c.write_u8(self.sysdep)?;
        c.write_u16::<LE>(self.subhdr)?;
        c.write_u32::<LE>(self.cmd)?;
        c.write_u32::<LE>(self.len)?;
        Ok(())
    }
}

/// Acknowledgment header sent by the USB host.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Ack {
    /// Protocol magic, must equal [`MAGIC`].
    pub magic: u32,
    /// Message type.
    pub msg_type: u8,
    /// Platform dependent tag.
    pub sysdep: u8,
    /// Sub-header.
    pub subhdr: u16,
    /// Command code of the acknowledged request.
    pub cmd: u32,
    /// Status code.
    pub ack: u32,
    /// Length of the payload following the ack.
    pub len: u32,
}

impl Ack {
    /// Size of the encoded ack.
    pub const SIZE: usize = 20;

    /// Creates an ack with valid magic.
    pub fn new(cmd: u32, ack: u32, len: u32) -> Self {
        Self { magic: MAGIC, cmd, ack, len, ..Default::default() }
    }

    /// Whether the magic is valid.
    pub fn is_valid(&self) -> bool {
        self.magic == MAGIC
    }

    /// Parses an ack.
    pub fn parse(data: &[u8; Self::SIZE]) -> Self {
        let mut c = Cursor::new(&data[..]);
        Self::read(&mut c).unwrap_or_default()
    }

    fn read(c: &mut Cursor<&[u8]>) -> Result<Self> {
        Ok(Self {
            magic: c.read_u32::<LE>()?,
            msg_type: c.read_u8()?,
            sysdep: c.read_u8()?,
            subhdr: c.read_u16::<LE>()?,
            cmd: c.read_u32::<LE>()?,
            ack: c.read_u32::<LE>()?,
            len: c.read_u32::<LE>()?,
        })
    }

    /// Encodes the ack.
    pub fn to_bytes(&self) -> [u8; Self::SIZE] {
        let mut data = [0; Self::SIZE];
        let mut c = Cursor::new(&mut data[..]);
        let _ = self.write(&mut c);
        data
    }

    fn write(&self, c: &mut Cursor<&mut [u8]>) -> Result<()> {
        c.write_u32::<LE>(self.magic)?;
        c.write_u8(self.msg_type)?;
        c.write_u8(self.sysdep)?;
        c.write_u16::<LE>(self.subhdr)?;
        c.write_u32::<LE>(self.cmd)?;
        c.write_u32::<LE>(self.ack)?;
        c.write_u32::<LE>(self.len)?;
        Ok(())
    }
}
