//! Firmware image sources.

pub mod hex;

pub use hex::{HexImage, HexRecords, Record};
