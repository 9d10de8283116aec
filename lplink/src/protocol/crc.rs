//! CRC-32 as computed by the MSPM0 bootstrap loader.
//!
//! The BSL and the MSPM0 CRC peripheral use the ISO 3309 polynomial in its
//! reflected form (`0xEDB88320`) with the register seeded to `0xFFFFFFFF`,
//! but they put the raw register on the wire without the final inversion
//! that the common "CRC-32" adds.

/// CRC-32 of `data` in the BSL convention.
pub fn crc32(data: &[u8]) -> u32 {
    // crc32fast applies the final xor, undo it
    !crc32fast::hash(data)
}
