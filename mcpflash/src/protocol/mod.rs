//! Bootloader wire protocol.

pub mod bootloader;
pub mod crc;
pub mod frame;

pub use bootloader::{Bootloader, BootloaderVersion, Delay, StdDelay, Timing};
pub use frame::{Command, Frame, Response};
