//! CRC64 as used by Azure Storage.
//!
//! Reflected polynomial `0x9A6C9329AC4BC9B5` with the running value inverted
//! on entry and exit (the CRC-64/NVME parameters). Because the inversion is
//! undone at the start of every [`update`], a finished checksum can be fed
//! back in to extend it over more bytes.

use std::sync::OnceLock;

/// Reflected form of the CRC64 polynomial.
pub const POLYNOMIAL: u64 = 0x9A6C_9329_AC4B_C9B5;

static TABLE: OnceLock<[u64; 256]> = OnceLock::new();

fn table() -> &'static [u64; 256] {
    TABLE.get_or_init(|| {
        let mut table = [0u64; 256];
        for (i, slot) in table.iter_mut().enumerate() {
            let mut crc = i as u64;
            for _ in 0..8 {
                crc = if crc & 1 == 1 {
                    (crc >> 1) ^ POLYNOMIAL
                } else {
                    crc >> 1
                };
            }
            *slot = crc;
        }
        table
    })
}

/// Extend `crc` (a value previously returned by [`checksum`] or [`update`],
/// or `0` to start fresh) over `data`.
///
/// `update(update(0, a), b) == checksum(a ++ b)`.
pub fn update(crc: u64, data: &[u8]) -> u64 {
    let table = table();
    let mut crc = !crc;
    for &byte in data {
        crc = table[((crc as u8) ^ byte) as usize] ^ (crc >> 8);
    }
    !crc
}

/// CRC64 of `data` in one pass.
#[inline]
pub fn checksum(data: &[u8]) -> u64 {
    update(0, data)
}
