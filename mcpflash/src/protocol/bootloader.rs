//! Request/response exchanges with the bootloader.
//!
//! Every exchange is synchronous: a frame is written, then the caller
//! blocks until the response is read or the exchange fails. Waiting is
//! expressed through the `Delay` trait so tests can run without sleeping.

use crate::error::{Error, Result};
use crate::port::Port;
use crate::protocol::frame::{
    Command, DATA_ESCAPE, FRAME_END, Frame, Response, escape, unescape,
};
use log::{debug, info, trace, warn};
use std::fmt;
use std::io::ErrorKind;
use std::thread;
use std::time::Duration;

/// Capacity of a single response read.
pub const RESPONSE_BUFFER_LEN: usize = 128;

/// Upper bound on stale bytes discarded before the first request.
pub const MAX_DRAIN_BYTES: usize = 4096;

/// Blocking wait used between a request and its response.
pub trait Delay {
    /// Block for `duration`.
    fn delay(&mut self, duration: Duration);
}

impl<D: Delay + ?Sized> Delay for &mut D {
    fn delay(&mut self, duration: Duration) {
        (**self).delay(duration);
    }
}

/// `Delay` backed by `std::thread::sleep`.
#[derive(Debug, Clone, Copy, Default)]
pub struct StdDelay;

impl Delay for StdDelay {
    fn delay(&mut self, duration: Duration) {
        if !duration.is_zero() {
            thread::sleep(duration);
        }
    }
}

/// Timing parameters for exchanges.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Timing {
    /// Wait after a ReadVersion/ReadCrc request before polling.
    pub settle_delay: Duration,
    /// Wait after an EraseFlash request before polling.
    pub erase_settle_delay: Duration,
    /// Extra time to keep polling for a first response byte after settling.
    /// Zero checks exactly once.
    pub poll_window: Duration,
    /// Interval between availability polls.
    pub poll_interval: Duration,
    /// Idle time allowed while reading a ProgramFlash acknowledgment.
    pub ack_timeout: Duration,
    /// Maximum wire bytes accepted for a ProgramFlash acknowledgment.
    pub max_ack_len: usize,
}

impl Default for Timing {
    fn default() -> Self {
        Self {
            settle_delay: Duration::from_millis(500),
            erase_settle_delay: Duration::from_millis(500),
            poll_window: Duration::ZERO,
            poll_interval: Duration::from_millis(10),
            ack_timeout: Duration::from_secs(5),
            max_ack_len: 64,
        }
    }
}

impl Timing {
    fn poll_step(&self) -> Duration {
        self.poll_interval.max(Duration::from_millis(1))
    }
}

/// Bootloader version reported by ReadVersion.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BootloaderVersion {
    /// Major version (response byte 2).
    pub major: u8,
    /// Minor version (response byte 3).
    pub minor: u8,
}

impl fmt::Display for BootloaderVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.major, self.minor)
    }
}

/// Command-level access to a bootloader over an exclusively owned port.
pub struct Bootloader<P: Port, D: Delay = StdDelay> {
    port: P,
    delay: D,
    timing: Timing,
}

impl<P: Port> Bootloader<P> {
    /// Create a bootloader client that sleeps on the current thread.
    pub fn new(port: P, timing: Timing) -> Self {
        Self::with_delay(port, StdDelay, timing)
    }
}

impl<P: Port, D: Delay> Bootloader<P, D> {
    /// Create a bootloader client with a custom delay source.
    pub fn with_delay(port: P, delay: D, timing: Timing) -> Self {
        Self {
            port,
            delay,
            timing,
        }
    }

    /// Get the delay source.
    pub fn delay(&self) -> &D {
        &self.delay
    }

    /// Get a reference to the underlying port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Discard anything already buffered by the transport.
    ///
    /// Returns the number of bytes thrown away.
    pub fn drain(&mut self) -> Result<usize> {
        let mut discarded = 0;
        let mut buf = [0u8; 64];

        while discarded < MAX_DRAIN_BYTES {
            let available = self.port.bytes_available()?;
            if available == 0 {
                break;
            }

            let take = available.min(buf.len());
            let n = self.port.read(&mut buf[..take])?;
            if n == 0 {
                break;
            }
            discarded += n;
        }

        if discarded > 0 {
            warn!(
                "Discarded {discarded} stale bytes from {}",
                self.port.name()
            );
        }
        Ok(discarded)
    }

    /// Write one frame. Returns the unescaped bytes that were sent.
    pub fn send(&mut self, frame: &Frame) -> Result<Vec<u8>> {
        let raw = frame.to_raw();
        let wire = escape(&raw);
        trace!("Sending {}: {:02X?}", frame.command(), wire);

        self.port.write_all_bytes(&wire)?;
        Ok(raw)
    }

    /// Wait for a response to `command` and return it unescaped.
    ///
    /// Sleeps for `settle`, then polls for available bytes for up to
    /// `poll_window`. Reads until the transport runs dry or the response
    /// buffer is full.
    fn receive(&mut self, command: Command, settle: Duration) -> Result<Vec<u8>> {
        self.delay.delay(settle);

        let step = self.timing.poll_step();
        let mut waited = Duration::ZERO;
        let mut available = self.port.bytes_available()?;

        while available == 0 {
            if waited >= self.timing.poll_window {
                return Err(Error::Timeout(format!(
                    "no response to {command} after {} ms",
                    (settle + waited).as_millis()
                )));
            }
            self.delay.delay(step);
            waited += step;
            available = self.port.bytes_available()?;
        }

        let mut buf = [0u8; RESPONSE_BUFFER_LEN];
        let mut len = 0;
        while available > 0 && len < buf.len() {
            let n = self.port.read(&mut buf[len..])?;
            if n == 0 {
                break;
            }
            len += n;
            available = self.port.bytes_available()?;
        }

        trace!("{command} response: {:02X?}", &buf[..len]);
        Ok(unescape(&buf[..len]))
    }

    /// Query the bootloader version.
    pub fn read_version(&mut self) -> Result<BootloaderVersion> {
        self.send(&Frame::read_version())?;
        let raw = self.receive(Command::ReadVersion, self.timing.settle_delay)?;
        let response = Response::parse(Command::ReadVersion, raw)?;

        let payload = response.payload();
        let version = BootloaderVersion {
            major: payload[0],
            minor: payload[1],
        };
        debug!("Bootloader version {version}");
        Ok(version)
    }

    /// Erase the application flash.
    ///
    /// The bootloader acknowledges by echoing the request. A missing or
    /// different echo yields `Error::EchoMismatch`, which callers are
    /// expected to report and continue past.
    pub fn erase_flash(&mut self) -> Result<()> {
        info!("Erasing flash...");
        let sent = self.send(&Frame::erase_flash())?;

        let received = match self.receive(Command::EraseFlash, self.timing.erase_settle_delay) {
            Ok(bytes) => bytes,
            Err(Error::Timeout(msg)) => {
                debug!("Erase acknowledgment missing: {msg}");
                Vec::new()
            },
            Err(e) => return Err(e),
        };

        if received.get(..sent.len()) == Some(sent.as_slice()) {
            debug!("Erase acknowledged");
            Ok(())
        } else {
            Err(Error::EchoMismatch { sent, received })
        }
    }

    /// Program one firmware record and wait for its acknowledgment.
    pub fn program_flash(&mut self, record: &[u8]) -> Result<()> {
        self.send(&Frame::program_flash(record))?;
        let raw = self.read_ack()?;
        Response::parse(Command::ProgramFlash, raw)?;
        Ok(())
    }

    /// Ask the device for the CRC of `length` bytes of flash at `address`.
    pub fn read_crc(&mut self, address: u32, length: u32) -> Result<u16> {
        self.send(&Frame::read_crc(address, length))?;
        let raw = self.receive(Command::ReadCrc, self.timing.settle_delay)?;
        let response = Response::parse(Command::ReadCrc, raw)?;

        let payload = response.payload();
        let crc = u16::from_le_bytes([payload[0], payload[1]]);
        debug!("Device CRC over 0x{address:08X}+0x{length:X}: 0x{crc:04X}");
        Ok(crc)
    }

    /// Start the application. No response is expected.
    pub fn jump_to_app(&mut self) -> Result<()> {
        info!("Jumping to application");
        self.send(&Frame::jump_to_app())?;
        Ok(())
    }

    /// Read a ProgramFlash acknowledgment byte by byte up to an unescaped
    /// end marker.
    fn read_ack(&mut self) -> Result<Vec<u8>> {
        let step = self.timing.poll_step();
        let mut wire = Vec::with_capacity(8);
        let mut escaped = false;
        let mut idle = Duration::ZERO;
        let mut byte = [0u8; 1];

        loop {
            match self.port.read(&mut byte) {
                Ok(0) => {
                    self.delay.delay(step);
                    idle += step;
                },
                Ok(_) => {
                    if wire.len() >= self.timing.max_ack_len {
                        return Err(Error::ResponseOverflow {
                            limit: self.timing.max_ack_len,
                        });
                    }
                    idle = Duration::ZERO;
                    wire.push(byte[0]);

                    if escaped {
                        escaped = false;
                    } else if byte[0] == DATA_ESCAPE {
                        escaped = true;
                    } else if byte[0] == FRAME_END {
                        break;
                    }
                },
                Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                    idle += self.port.timeout().max(step);
                },
                Err(e) if e.kind() == ErrorKind::Interrupted => {
                    idle += step;
                },
                Err(e) => return Err(Error::Io(e)),
            }

            if idle >= self.timing.ack_timeout {
                return Err(Error::Timeout(format!(
                    "no acknowledgment after {} ms",
                    idle.as_millis()
                )));
            }
        }

        trace!("ProgramFlash acknowledgment: {wire:02X?}");
        Ok(unescape(&wire))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{MockPort, Reply, RecordingDelay};

    fn version_reply(major: u8, minor: u8) -> Reply {
        Reply::Frame(Frame::new(Command::ReadVersion, vec![major, minor]))
    }

    fn ack() -> Reply {
        Reply::Frame(Frame::new(Command::ProgramFlash, vec![]))
    }

    #[test]
    fn test_read_version_reports_bytes_two_and_three() {
        let mut delay = RecordingDelay::default();
        let port = MockPort::new(vec![version_reply(3, 2)]);
        let mut bl = Bootloader::with_delay(port, &mut delay, Timing::default());

        let version = bl.read_version().unwrap();
        assert_eq!(version, BootloaderVersion { major: 3, minor: 2 });
        assert_eq!(version.to_string(), "3.2");
        assert_eq!(
            bl.port().frames(),
            &[vec![0x01, 0x10, 0x01, 0x21, 0x10, 0x10, 0x04]]
        );
        drop(bl);
        assert_eq!(delay.total, Duration::from_millis(500));
    }

    #[test]
    fn test_read_version_without_response_times_out() {
        let port = MockPort::new(vec![Reply::Silence]);
        let mut bl = Bootloader::with_delay(port, RecordingDelay::default(), Timing::default());

        assert!(matches!(bl.read_version(), Err(Error::Timeout(_))));
    }

    #[test]
    fn test_read_version_polls_within_window() {
        let timing = Timing {
            poll_window: Duration::from_millis(100),
            poll_interval: Duration::from_millis(10),
            ..Timing::default()
        };
        let mut delay = RecordingDelay::default();
        let port = MockPort::new(vec![Reply::Silence]);
        let mut bl = Bootloader::with_delay(port, &mut delay, timing);

        assert!(matches!(bl.read_version(), Err(Error::Timeout(_))));
        drop(bl);
        assert_eq!(delay.total, Duration::from_millis(600));
    }

    #[test]
    fn test_read_version_short_response_is_length_mismatch() {
        let port = MockPort::new(vec![Reply::Raw(vec![0x01, 0x01, 0x03, 0x04])]);
        let mut bl = Bootloader::with_delay(port, RecordingDelay::default(), Timing::default());

        assert!(matches!(
            bl.read_version(),
            Err(Error::LengthMismatch {
                command: Command::ReadVersion,
                expected: 7,
                actual: 4,
            })
        ));
    }

    #[test]
    fn test_read_version_bad_crc() {
        let mut raw = Frame::new(Command::ReadVersion, vec![1, 2]).to_raw();
        raw[4] ^= 0x80;
        let port = MockPort::new(vec![Reply::Raw(escape(&raw))]);
        let mut bl = Bootloader::with_delay(port, RecordingDelay::default(), Timing::default());

        assert!(matches!(
            bl.read_version(),
            Err(Error::CrcMismatch { .. })
        ));
    }

    #[test]
    fn test_erase_echo_accepted() {
        let port = MockPort::new(vec![Reply::Raw(Frame::erase_flash().encode())]);
        let mut bl = Bootloader::with_delay(port, RecordingDelay::default(), Timing::default());

        bl.erase_flash().unwrap();
        assert_eq!(bl.port().frames(), &[vec![0x01, 0x02, 0x42, 0x20, 0x04]]);
    }

    #[test]
    fn test_erase_echo_mismatch_reports_both_sides() {
        let port = MockPort::new(vec![Reply::Raw(vec![0x01, 0x02, 0x00, 0x00, 0x04])]);
        let mut bl = Bootloader::with_delay(port, RecordingDelay::default(), Timing::default());

        match bl.erase_flash() {
            Err(Error::EchoMismatch { sent, received }) => {
                assert_eq!(sent, vec![0x01, 0x02, 0x42, 0x20, 0x04]);
                assert_eq!(received, vec![0x01, 0x02, 0x00, 0x00, 0x04]);
            },
            other => panic!("unexpected result: {other:?}"),
        }
    }

    #[test]
    fn test_erase_without_response_is_echo_mismatch() {
        let port = MockPort::new(vec![Reply::Silence]);
        let mut bl = Bootloader::with_delay(port, RecordingDelay::default(), Timing::default());

        assert!(matches!(
            bl.erase_flash(),
            Err(Error::EchoMismatch { ref received, .. }) if received.is_empty()
        ));
    }

    #[test]
    fn test_program_flash_reads_until_end_marker() {
        let port = MockPort::new(vec![ack()]);
        let mut bl = Bootloader::with_delay(port, RecordingDelay::default(), Timing::default());

        bl.program_flash(&[0x10, 0x00, 0x00, 0x00, 0xFF]).unwrap();
        assert_eq!(
            bl.port().frames(),
            &[Frame::program_flash(&[0x10, 0x00, 0x00, 0x00, 0xFF]).encode()]
        );
    }

    #[test]
    fn test_program_flash_ack_with_escaped_end_marker() {
        // An acknowledgment whose payload carries an escaped EOT must not be
        // cut short at the escaped byte.
        let frame = Frame::new(Command::ProgramFlash, vec![0x04]);
        let port = MockPort::new(vec![Reply::Frame(frame)]);
        let mut bl = Bootloader::with_delay(port, RecordingDelay::default(), Timing::default());

        // Six unescaped bytes is the wrong shape, which proves the whole
        // frame was read rather than the first four bytes.
        assert!(matches!(
            bl.program_flash(&[0xAA]),
            Err(Error::LengthMismatch { actual: 6, .. })
        ));
    }

    #[test]
    fn test_program_flash_read_error_is_fatal() {
        let port = MockPort::new(vec![Reply::ReadError(ErrorKind::BrokenPipe)]);
        let mut bl = Bootloader::with_delay(port, RecordingDelay::default(), Timing::default());

        assert!(matches!(bl.program_flash(&[0x00]), Err(Error::Io(_))));
    }

    #[test]
    fn test_program_flash_ack_timeout() {
        let timing = Timing {
            ack_timeout: Duration::from_secs(2),
            ..Timing::default()
        };
        let port = MockPort::new(vec![Reply::Silence]);
        let mut bl = Bootloader::with_delay(port, RecordingDelay::default(), timing);

        assert!(matches!(bl.program_flash(&[0x00]), Err(Error::Timeout(_))));
    }

    #[test]
    fn test_program_flash_interrupted_reads_count_as_idle() {
        let timing = Timing {
            ack_timeout: Duration::from_millis(100),
            poll_interval: Duration::from_millis(10),
            ..Timing::default()
        };
        let port = MockPort::new(vec![Reply::Stalled(ErrorKind::Interrupted)]);
        let mut bl = Bootloader::with_delay(port, RecordingDelay::default(), timing);

        assert!(matches!(bl.program_flash(&[0x00]), Err(Error::Timeout(_))));
    }

    #[test]
    fn test_program_flash_ack_overflow() {
        let timing = Timing {
            max_ack_len: 8,
            ..Timing::default()
        };
        let port = MockPort::new(vec![Reply::Raw(vec![0x55; 32])]);
        let mut bl = Bootloader::with_delay(port, RecordingDelay::default(), timing);

        assert!(matches!(
            bl.program_flash(&[0x00]),
            Err(Error::ResponseOverflow { limit: 8 })
        ));
    }

    #[test]
    fn test_write_failure_is_write_failed() {
        let port = MockPort::new(vec![]).fail_writes_after(0);
        let mut bl = Bootloader::with_delay(port, RecordingDelay::default(), Timing::default());

        assert!(matches!(bl.read_version(), Err(Error::WriteFailed(_))));
    }

    #[test]
    fn test_read_crc_value() {
        let reply = Reply::Frame(Frame::new(Command::ReadCrc, vec![0x34, 0x12]));
        let port = MockPort::new(vec![reply]);
        let mut bl = Bootloader::with_delay(port, RecordingDelay::default(), Timing::default());

        assert_eq!(bl.read_crc(0x9D00_0000, 0x1000).unwrap(), 0x1234);
        assert_eq!(
            bl.port().frames(),
            &[vec![
                0x01, 0x10, 0x04, 0x00, 0x00, 0x00, 0x9D, 0x00, 0x10, 0x10, 0x00, 0x00, 0x7C,
                0xD8, 0x04
            ]]
        );
    }

    #[test]
    fn test_jump_to_app_writes_only() {
        let port = MockPort::new(vec![]);
        let mut bl = Bootloader::with_delay(port, RecordingDelay::default(), Timing::default());

        bl.jump_to_app().unwrap();
        assert_eq!(
            bl.port().frames(),
            &[vec![0x01, 0x05, 0xA5, 0x50, 0x04]]
        );
    }

    #[test]
    fn test_drain_discards_stale_bytes() {
        let port = MockPort::new(vec![]).with_pending(vec![0xAA; 10]);
        let mut bl = Bootloader::with_delay(port, RecordingDelay::default(), Timing::default());

        assert_eq!(bl.drain().unwrap(), 10);
        assert_eq!(bl.drain().unwrap(), 0);
    }
}
