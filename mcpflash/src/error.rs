//! Error types for mcpflash.

use crate::protocol::frame::Command;
use std::io;
use thiserror::Error;

/// Result type for mcpflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for mcpflash operations.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial read, firmware file access).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// The transport could not be opened.
    #[error("Unable to open port {port}: {reason}")]
    TransportOpen {
        /// Port name that was requested.
        port: String,
        /// Reason reported by the transport.
        reason: String,
    },

    /// A request frame could not be written.
    #[error("Write failed: {0}")]
    WriteFailed(#[source] io::Error),

    /// No response arrived within the allotted window.
    #[error("Timeout: {0}")]
    Timeout(String),

    /// Decoded response has the wrong size for the command issued.
    #[error("Wrong response length for {command}: expected {expected} bytes, got {actual}")]
    LengthMismatch {
        /// Command whose response was being validated.
        command: Command,
        /// Expected unescaped length.
        expected: usize,
        /// Actual unescaped length.
        actual: usize,
    },

    /// Response checksum does not match the recomputed value.
    #[error("CRC mismatch: expected {expected:#06x}, got {actual:#06x}")]
    CrcMismatch {
        /// CRC computed over the received command and payload.
        expected: u16,
        /// CRC carried by the response.
        actual: u16,
    },

    /// EraseFlash acknowledgment did not echo the request.
    #[error("Unable to erase flash: acknowledgment {received:02X?} does not echo {sent:02X?}")]
    EchoMismatch {
        /// Unescaped request bytes.
        sent: Vec<u8>,
        /// Unescaped response bytes.
        received: Vec<u8>,
    },

    /// ProgramFlash acknowledgment grew past its byte bound.
    #[error("Acknowledgment exceeded {limit} bytes without an end marker")]
    ResponseOverflow {
        /// Maximum number of bytes accepted.
        limit: usize,
    },

    /// Structurally invalid response frame.
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Firmware image line that cannot be turned into a frame.
    #[error("Invalid firmware image at line {line}: {reason}")]
    InvalidImage {
        /// 1-based line number in the image.
        line: usize,
        /// What is wrong with the line.
        reason: String,
    },

    /// The embedding application requested a stop.
    #[error("Operation interrupted")]
    Interrupted,
}

impl Error {
    /// Whether this error terminates a flashing run.
    ///
    /// Only an erase echo mismatch is reported and then ignored.
    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::EchoMismatch { .. })
    }
}
