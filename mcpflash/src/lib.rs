//! # mcpflash
//!
//! A library for flashing Microchip PIC devices through their serial
//! bootloader.
//!
//! The crate provides:
//!
//! - the CRC16 used by bootloader frames
//! - frame construction, byte stuffing and response validation
//! - the five bootloader commands (ReadVersion, EraseFlash, ProgramFlash,
//!   ReadCrc, JumpToApp)
//! - a line-oriented hex image reader
//! - a `Flasher` that drives a complete session
//!
//! ## Features
//!
//! - `native` (default): serial port support via the `serialport` crate
//!
//! ## Example
//!
//! ```rust,no_run
//! use mcpflash::{Bootloader, NativePort, SerialConfig, Timing};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let port = NativePort::open(&SerialConfig::new("/dev/ttyUSB0", 115_200))?;
//!     let mut bootloader = Bootloader::new(port, Timing::default());
//!
//!     let version = bootloader.read_version()?;
//!     println!("Bootloader version is {version}");
//!
//!     bootloader.jump_to_app()?;
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod error;
pub mod flasher;
pub mod image;
pub mod port;
pub mod protocol;

#[cfg(test)]
pub(crate) mod testing;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker consulted between frames.
///
/// The checker should return `true` when the current run should stop
/// (for example after Ctrl-C in a CLI). Only the first registration wins.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

#[cfg(test)]
pub(crate) fn test_set_interrupted(value: bool) {
    use std::sync::atomic::{AtomicBool, Ordering};

    static TEST_INTERRUPT_FLAG: OnceLock<Arc<AtomicBool>> = OnceLock::new();

    let flag = TEST_INTERRUPT_FLAG
        .get_or_init(|| {
            let shared = Arc::new(AtomicBool::new(false));
            let checker = Arc::clone(&shared);
            set_interrupt_checker(move || checker.load(Ordering::Relaxed));
            shared
        })
        .clone();

    flag.store(value, Ordering::Relaxed);
}

#[cfg(feature = "native")]
pub use port::{NativePort, NativePortEnumerator};
pub use {
    error::{Error, Result},
    flasher::{CrcRange, FlashPlan, FlashReport, Flasher, Session},
    image::{HexImage, Record},
    port::{Port, PortEnumerator, PortInfo, SerialConfig},
    protocol::{Bootloader, BootloaderVersion, Command, Delay, Frame, StdDelay, Timing},
};

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_interrupt_checker_toggle() {
        test_set_interrupted(true);
        assert!(is_interrupted_requested());

        test_set_interrupted(false);
        assert!(!is_interrupted_requested());
    }
}
