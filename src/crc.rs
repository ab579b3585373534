//! Bitwise CRC-32 for platforms without a hardware or ROM routine.

/// CRC-32 using the IEEE 802.3 polynomial (0xEDB88320, bit-reversed 0x04C11DB7).
///
/// Same chaining convention as zlib: pass `0` to start, pass a previous result to continue.
pub fn crc32(init: u32, data: &[u8]) -> u32 {
    let mut crc = !init;

    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            if crc & 1 != 0 {
                crc = (crc >> 1) ^ 0xEDB88320;
            } else {
                crc >>= 1;
            }
        }
    }

    !crc
}
