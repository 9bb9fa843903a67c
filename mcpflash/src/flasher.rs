//! Flash orchestration.
//!
//! A run talks to the bootloader in a fixed order:
//!
//! 1. drain stale input
//! 2. ReadVersion (any failure aborts)
//! 3. JumpToApp, if requested, and stop
//! 4. EraseFlash and one ProgramFlash per image record, if an image is given
//! 5. ReadCrc, if requested
//!
//! ## Example
//!
//! ```rust,no_run
//! use mcpflash::{FlashPlan, Flasher, HexImage, Timing};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let plan = FlashPlan {
//!         image: Some(HexImage::from_file("firmware.hex")?),
//!         ..FlashPlan::default()
//!     };
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let mut flasher = Flasher::open("/dev/ttyUSB0", 115_200, Timing::default())?;
//!         let report = flasher.run(&plan, |current, total| {
//!             println!("{current}/{total}");
//!         })?;
//!         println!("Bootloader version is {}", report.version);
//!     }
//!
//!     Ok(())
//! }
//! ```

use crate::error::{Error, Result};
use crate::image::HexImage;
use crate::is_interrupted_requested;
use crate::port::Port;
use crate::protocol::bootloader::{Bootloader, BootloaderVersion, Delay, StdDelay};
use crate::protocol::frame::Frame;
use log::{debug, info, warn};

/// Largest encoded ProgramFlash frame the bootloader accepts.
pub const MAX_FRAME_LEN: usize = 128;

/// Flash range for a ReadCrc request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CrcRange {
    /// Start address.
    pub address: u32,
    /// Number of bytes.
    pub length: u32,
}

/// What a run should do after reading the bootloader version.
#[derive(Debug, Clone, Default)]
pub struct FlashPlan {
    /// Image to erase and program.
    pub image: Option<HexImage>,
    /// Start the application instead of flashing.
    pub run: bool,
    /// Range to checksum on the device once everything else is done.
    pub read_crc: Option<CrcRange>,
}

/// Outcome of a completed run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FlashReport {
    /// Reported bootloader version.
    pub version: BootloaderVersion,
    /// Whether the erase was echoed back. `None` if no erase was issued.
    pub erase_acknowledged: Option<bool>,
    /// Records acknowledged by the device.
    pub records_written: usize,
    /// Records in the image.
    pub total_records: usize,
    /// CRC returned by ReadCrc, if requested.
    pub crc: Option<u16>,
    /// Whether JumpToApp was sent.
    pub jumped: bool,
}

/// Per-run state.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Session {
    /// Version reported by the bootloader.
    pub version: Option<BootloaderVersion>,
    /// Records in the image being flashed.
    pub total_records: usize,
    /// Records acknowledged so far.
    pub current_record: usize,
}

/// Drives a complete bootloader session over one port.
pub struct Flasher<P: Port, D: Delay = StdDelay> {
    bootloader: Bootloader<P, D>,
    session: Session,
    interrupted: fn() -> bool,
}

impl<P: Port, D: Delay> Flasher<P, D> {
    /// Create a flasher on top of a bootloader client.
    pub fn new(bootloader: Bootloader<P, D>) -> Self {
        Self {
            bootloader,
            session: Session::default(),
            interrupted: is_interrupted_requested,
        }
    }

    /// Replace the check consulted before the erase and before each record.
    ///
    /// Defaults to [`is_interrupted_requested`].
    #[must_use]
    pub fn with_interrupt_check(mut self, interrupted: fn() -> bool) -> Self {
        self.interrupted = interrupted;
        self
    }

    /// Get the state of the current or last run.
    pub fn session(&self) -> &Session {
        &self.session
    }

    /// Get the bootloader client.
    pub fn bootloader(&self) -> &Bootloader<P, D> {
        &self.bootloader
    }

    /// Consume the flasher and return the bootloader client.
    pub fn into_bootloader(self) -> Bootloader<P, D> {
        self.bootloader
    }

    /// Execute `plan`.
    ///
    /// `progress` is called with `(current, total)` after every
    /// acknowledged record.
    pub fn run<F>(&mut self, plan: &FlashPlan, mut progress: F) -> Result<FlashReport>
    where
        F: FnMut(usize, usize),
    {
        self.session = Session::default();

        self.bootloader.drain()?;

        let version = self.bootloader.read_version()?;
        info!("Bootloader version is {version}");
        self.session.version = Some(version);

        let mut report = FlashReport {
            version,
            erase_acknowledged: None,
            records_written: 0,
            total_records: 0,
            crc: None,
            jumped: false,
        };

        if plan.run {
            self.bootloader.jump_to_app()?;
            report.jumped = true;
            return Ok(report);
        }

        if let Some(image) = &plan.image {
            report.total_records = validate(image)?;
            self.session.total_records = report.total_records;

            report.erase_acknowledged = Some(self.erase()?);
            self.program(image, &mut progress)?;
            report.records_written = self.session.current_record;
            info!("Flashing complete!");
        }

        if let Some(range) = plan.read_crc {
            report.crc = Some(self.bootloader.read_crc(range.address, range.length)?);
        }

        Ok(report)
    }

    /// Erase flash, tolerating a missing or wrong echo.
    fn erase(&mut self) -> Result<bool> {
        self.ensure_not_interrupted()?;

        match self.bootloader.erase_flash() {
            Ok(()) => Ok(true),
            Err(e) if !e.is_fatal() => {
                warn!("{e}");
                Ok(false)
            },
            Err(e) => Err(e),
        }
    }

    fn program<F>(&mut self, image: &HexImage, progress: &mut F) -> Result<()>
    where
        F: FnMut(usize, usize),
    {
        info!("Flashing {} records...", self.session.total_records);

        for record in image.records()? {
            let record = record?;
            self.ensure_not_interrupted()?;

            debug!(
                "Programming line {} ({} bytes)",
                record.line,
                record.data.len()
            );
            self.bootloader.program_flash(&record.data)?;

            self.session.current_record += 1;
            progress(self.session.current_record, self.session.total_records);
        }

        Ok(())
    }

    fn ensure_not_interrupted(&self) -> Result<()> {
        if (self.interrupted)() {
            Err(Error::Interrupted)
        } else {
            Ok(())
        }
    }
}

#[cfg(feature = "native")]
mod native_impl {
    use super::{Bootloader, Flasher, Result};
    use crate::port::{NativePort, SerialConfig};
    use crate::protocol::bootloader::Timing;

    impl Flasher<NativePort> {
        /// Open `port_name` at `baud` and create a flasher on it.
        pub fn open(port_name: &str, baud: u32, timing: Timing) -> Result<Self> {
            let port = NativePort::open(&SerialConfig::new(port_name, baud))?;
            Ok(Self::new(Bootloader::new(port, timing)))
        }
    }
}

/// Walk the whole image once, rejecting anything that cannot be sent.
///
/// Returns the number of records.
fn validate(image: &HexImage) -> Result<usize> {
    let mut count = 0;
    for record in image.records()? {
        let record = record?;
        let encoded = Frame::program_flash(&record.data).encode().len();
        if encoded > MAX_FRAME_LEN {
            return Err(Error::InvalidImage {
                line: record.line,
                reason: format!("record encodes to {encoded} bytes, limit is {MAX_FRAME_LEN}"),
            });
        }
        count += 1;
    }
    debug!("Image holds {count} records");
    Ok(count)
}
