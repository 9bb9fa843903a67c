//! CRC16 checksum used by the bootloader frames.
//!
//! Polynomial 0x1021, initial value 0, no final XOR (the XMODEM variant),
//! evaluated one nibble at a time against a 16-entry table. The bootloader
//! firmware computes it the same way, so the nibble order is part of the
//! wire format.

/// Nibble lookup table for polynomial 0x1021.
static CRC_TABLE: [u16; 16] = [
    0x0000, 0x1021, 0x2042, 0x3063, 0x4084, 0x50a5, 0x60c6, 0x70e7, 0x8108, 0x9129, 0xa14a,
    0xb16b, 0xc18c, 0xd1ad, 0xe1ce, 0xf1ef,
];

/// Calculate the frame CRC over `data`.
pub fn crc16(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |crc, &byte| {
        let crc = step(crc, byte >> 4);
        step(crc, byte & 0x0F)
    })
}

#[inline]
#[allow(clippy::cast_possible_truncation)]
fn step(crc: u16, nibble: u8) -> u16 {
    let index = usize::from(((crc >> 12) as u8 ^ nibble) & 0x0F);
    CRC_TABLE[index] ^ (crc << 4)
}
