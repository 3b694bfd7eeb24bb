//! CRC used by the Vantage serial protocol.
//!
//! The console appends this checksum (big-endian) to every data block it
//! sends, and expects it after every binary block it receives. Running the CRC
//! over a block including its checksum yields 0.

use bytes::BufMut;

/// CRC-16/CCITT as used by Davis consoles (same parameters as XMODEM).
pub const CRC_16_VANTAGE: crc::Algorithm<u16> = crc::Algorithm {
    width: 16,
    poly: 0x1021,
    init: 0x0000,
    refin: false,
    refout: false,
    xorout: 0x0000,
    check: 0x31c3,
    residue: 0x0000,
};

const CRC: crc::Crc<u16> = crc::Crc::<u16>::new(&CRC_16_VANTAGE);

/// Computes the checksum of `bytes`.
pub fn crc16(bytes: &[u8]) -> u16 {
    CRC.checksum(bytes)
}

/// Appends the checksum of `data` to `buffer`, high byte first.
pub fn put_crc<B: BufMut>(buffer: &mut B, data: &[u8]) {
    buffer.put_u16(crc16(data));
}

/// Returns `data` followed by its checksum.
pub fn with_crc(data: &[u8]) -> Vec<u8> {
    let mut buffer = Vec::with_capacity(data.len() + 2);
    buffer.extend_from_slice(data);
    put_crc(&mut buffer, data);
    buffer
}
