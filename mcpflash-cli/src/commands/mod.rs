//! Command implementations.

pub(crate) mod flash;
pub(crate) mod ports;
