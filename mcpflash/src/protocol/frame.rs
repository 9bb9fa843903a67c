//! Bootloader frame construction and byte stuffing.
//!
//! ## Frame Format
//!
//! ```text
//! +-----+---------+-----------------+--------+--------+-----+
//! | SOH | Command |     Payload     | CRC lo | CRC hi | EOT |
//! +-----+---------+-----------------+--------+--------+-----+
//! | 1   | 1       |    variable     | 1      | 1      | 1   |
//! +-----+---------+-----------------+--------+--------+-----+
//! ```
//!
//! The CRC covers the command byte and the payload. On the wire every byte
//! between the leading SOH and the trailing EOT whose value is SOH, EOT or
//! DLE is preceded by a DLE byte.

use crate::error::{Error, Result};
use crate::protocol::crc::crc16;
use byteorder::{LittleEndian, WriteBytesExt};
use std::fmt;

/// Start of frame (SOH).
pub const FRAME_BEGIN: u8 = 0x01;

/// End of frame (EOT).
pub const FRAME_END: u8 = 0x04;

/// Escape marker (DLE).
pub const DATA_ESCAPE: u8 = 0x10;

/// Unescaped size of a frame with an empty payload.
pub const MIN_FRAME_LEN: usize = 5;

/// Bootloader commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum Command {
    /// Read the bootloader version (0x01).
    ReadVersion = 0x01,

    /// Erase the application flash (0x02).
    EraseFlash = 0x02,

    /// Program one firmware record (0x03).
    ProgramFlash = 0x03,

    /// Compute a CRC over a flash range on the device (0x04).
    ReadCrc = 0x04,

    /// Leave the bootloader and start the application (0x05).
    JumpToApp = 0x05,
}

impl Command {
    /// Unescaped length of a well-formed response to this command.
    pub fn response_len(self) -> usize {
        match self {
            Self::ReadVersion | Self::ReadCrc => MIN_FRAME_LEN + 2,
            Self::EraseFlash | Self::ProgramFlash | Self::JumpToApp => MIN_FRAME_LEN,
        }
    }
}

impl fmt::Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::ReadVersion => "ReadVersion",
            Self::EraseFlash => "EraseFlash",
            Self::ProgramFlash => "ProgramFlash",
            Self::ReadCrc => "ReadCrc",
            Self::JumpToApp => "JumpToApp",
        };
        f.write_str(name)
    }
}

/// Whether `byte` collides with a frame control value.
pub fn is_control(byte: u8) -> bool {
    matches!(byte, FRAME_BEGIN | FRAME_END | DATA_ESCAPE)
}

/// A logical bootloader frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    command: Command,
    payload: Vec<u8>,
}

impl Frame {
    /// Create a frame with the given command and payload.
    pub fn new(command: Command, payload: Vec<u8>) -> Self {
        Self { command, payload }
    }

    /// Build a read version request.
    pub fn read_version() -> Self {
        Self::new(Command::ReadVersion, Vec::new())
    }

    /// Build an erase flash request.
    pub fn erase_flash() -> Self {
        Self::new(Command::EraseFlash, Vec::new())
    }

    /// Build a program flash request carrying one firmware record.
    pub fn program_flash(record: &[u8]) -> Self {
        Self::new(Command::ProgramFlash, record.to_vec())
    }

    /// Build a read CRC request.
    ///
    /// Payload: start address (4 bytes LE) followed by length (4 bytes LE).
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn read_crc(address: u32, length: u32) -> Self {
        let mut payload = Vec::with_capacity(8);
        payload.write_u32::<LittleEndian>(address).unwrap();
        payload.write_u32::<LittleEndian>(length).unwrap();
        Self::new(Command::ReadCrc, payload)
    }

    /// Build a jump to application request.
    pub fn jump_to_app() -> Self {
        Self::new(Command::JumpToApp, Vec::new())
    }

    /// Get the command.
    pub fn command(&self) -> Command {
        self.command
    }

    /// Get the payload.
    pub fn payload(&self) -> &[u8] {
        &self.payload
    }

    /// Build the unescaped frame bytes, delimiters and CRC included.
    #[allow(clippy::unwrap_used)] // Writing to Vec<u8> cannot fail
    pub fn to_raw(&self) -> Vec<u8> {
        let mut buf = Vec::with_capacity(MIN_FRAME_LEN + self.payload.len());
        buf.push(FRAME_BEGIN);
        buf.push(self.command as u8);
        buf.extend_from_slice(&self.payload);

        let crc = crc16(&buf[1..]);
        buf.write_u16::<LittleEndian>(crc).unwrap();
        buf.push(FRAME_END);
        buf
    }

    /// Build the byte-stuffed wire representation.
    pub fn encode(&self) -> Vec<u8> {
        escape(&self.to_raw())
    }
}

/// Insert an escape marker before every interior control byte.
///
/// The first and last bytes are the frame delimiters and go out verbatim.
pub fn escape(raw: &[u8]) -> Vec<u8> {
    let last = raw.len().saturating_sub(1);
    let mut out = Vec::with_capacity(raw.len() + raw.len() / 4);

    for (i, &byte) in raw.iter().enumerate() {
        if i != 0 && i != last && is_control(byte) {
            out.push(DATA_ESCAPE);
        }
        out.push(byte);
    }

    out
}

/// Remove escape markers that precede a control byte.
///
/// A single forward scan: an escape marker followed by a control value is
/// dropped and the control value is kept as data without being re-examined.
/// Any other byte, including a trailing lone escape marker, is copied as is.
pub fn unescape(wire: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(wire.len());
    let mut i = 0;

    while i < wire.len() {
        let byte = wire[i];
        match wire.get(i + 1) {
            Some(&next) if byte == DATA_ESCAPE && is_control(next) => {
                out.push(next);
                i += 2;
            },
            _ => {
                out.push(byte);
                i += 1;
            },
        }
    }

    out
}

/// A validated, unescaped response frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    raw: Vec<u8>,
}

impl Response {
    /// Validate an unescaped response to `command`.
    ///
    /// Checks, in order: exact length, delimiters, echoed command byte, CRC.
    pub fn parse(command: Command, raw: Vec<u8>) -> Result<Self> {
        let expected = command.response_len();
        if raw.len() != expected {
            return Err(Error::LengthMismatch {
                command,
                expected,
                actual: raw.len(),
            });
        }

        let last = raw.len() - 1;
        if raw[0] != FRAME_BEGIN || raw[last] != FRAME_END {
            return Err(Error::Protocol(format!(
                "{command} response is not delimited by SOH/EOT: {raw:02X?}"
            )));
        }

        if raw[1] != command as u8 {
            return Err(Error::Protocol(format!(
                "{command} response carries command byte 0x{:02X}",
                raw[1]
            )));
        }

        let actual = u16::from_le_bytes([raw[last - 2], raw[last - 1]]);
        let expected = crc16(&raw[1..last - 2]);
        if actual != expected {
            return Err(Error::CrcMismatch { expected, actual });
        }

        Ok(Self { raw })
    }

    /// Response payload (between the command byte and the CRC).
    pub fn payload(&self) -> &[u8] {
        &self.raw[2..self.raw.len() - 3]
    }
}
