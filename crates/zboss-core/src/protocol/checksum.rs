//! Checksums used by the NCP framing
//!
//! - CRC8 protects the low-level header (size, frame type and flags).
//! - CRC16 protects every high-level packet body.

/// CRC-8 (poly 0x07, init 0x00, no reflection) over `bytes`
pub fn crc8(bytes: &[u8]) -> u8 {
    let mut crc: u8 = 0x00;
    for &b in bytes {
        crc ^= b;
        for _ in 0..8 {
            if (crc & 0x80) != 0 {
                crc = (crc << 1) ^ 0x07;
            } else {
                crc <<= 1;
            }
        }
    }
    crc
}

/// CRC-16 (reflected poly 0x1021, init 0x0000) over `bytes`
pub fn crc16(bytes: &[u8]) -> u16 {
    let mut crc: u16 = 0x0000;
    for &b in bytes {
        crc ^= b as u16;
        for _ in 0..8 {
            if (crc & 0x0001) != 0 {
                crc = (crc >> 1) ^ 0x8408;
            } else {
                crc >>= 1;
            }
        }
    }
    crc
}
