//! Commands that can be sent to a console.

use std::fmt::{
    self,
    Display,
};

use bytes::{
    BufMut,
    Bytes,
};

use crate::crc::with_crc;

/// Acknowledge
pub const ACK: u8 = 0x06;

/// Negative acknowledge. Asks the console to resend the last block.
pub const NAK: u8 = 0x21;

/// Sent by the console when a received CRC was wrong.
pub const CANCEL: u8 = 0x18;

pub const ESC: u8 = 0x1b;
pub const LF: u8 = b'\n';
pub const CR: u8 = b'\r';

/// A command for the console.
///
/// Text commands are terminated with a line feed when encoded, binary
/// commands are sent as they are. Binary payloads that the console expects
/// to be checksummed must already contain their CRC, see
/// [`Command::binary_with_crc`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Command {
    Text(String),
    Binary(Bytes),
}

impl Command {
    pub fn text(command: impl Into<String>) -> Self {
        Self::Text(command.into())
    }

    pub fn binary(data: impl Into<Bytes>) -> Self {
        Self::Binary(data.into())
    }

    /// Binary payload followed by its CRC.
    pub fn binary_with_crc(data: &[u8]) -> Self {
        Self::Binary(with_crc(data).into())
    }

    pub fn encode<B: BufMut>(&self, mut buffer: B) {
        match self {
            Self::Text(text) => {
                buffer.put_slice(text.as_bytes());
                buffer.put_u8(LF);
            }
            Self::Binary(data) => {
                buffer.put_slice(data);
            }
        }
    }

    pub fn encoded_len(&self) -> usize {
        match self {
            Self::Text(text) => text.len() + 1,
            Self::Binary(data) => data.len(),
        }
    }

    /// Wakes the console from its power-saving mode.
    pub fn wake_up() -> Self {
        Self::Binary(Bytes::from_static(&[ESC, LF]))
    }

    pub fn ack() -> Self {
        Self::Binary(Bytes::from_static(&[ACK]))
    }

    pub fn nak() -> Self {
        Self::Binary(Bytes::from_static(&[NAK]))
    }

    pub fn escape() -> Self {
        Self::Binary(Bytes::from_static(&[ESC]))
    }

    pub fn get_time() -> Self {
        Self::text("GETTIME")
    }

    pub fn set_time() -> Self {
        Self::text("SETTIME")
    }

    pub fn dump_after() -> Self {
        Self::text("DMPAFT")
    }

    /// Request `count` LOOP packets.
    pub fn loop_packets(count: u32) -> Self {
        Self::Text(format!("LPS 1 {count}"))
    }

    /// Request `count` LOOP2 packets.
    pub fn loop2_packets(count: u32) -> Self {
        Self::Text(format!("LPS 2 {count}"))
    }

    pub fn eeprom_read(address: u16, length: u16) -> Self {
        Self::Text(format!("EEBRD {address:02X} {length:02X}"))
    }

    pub fn eeprom_write_byte(address: u16, value: u8) -> Self {
        Self::Text(format!("EEWR {address:02X} {value:02X}"))
    }

    pub fn eeprom_write(address: u16, length: u16) -> Self {
        Self::Text(format!("EEBWR {address:02X} {length:02X}"))
    }

    /// Makes the console reinitialize after EEPROM settings changed.
    pub fn new_setup() -> Self {
        Self::text("NEWSETUP")
    }

    pub fn lamps(on: bool) -> Self {
        Self::Text(format!("LAMPS {}", if on { 1 } else { 0 }))
    }

    /// Calibrate the barometer.
    ///
    /// `barometer` is in thousandths of inHg, `elevation` in feet.
    pub fn barometer(barometer: u16, elevation: i32) -> Self {
        Self::Text(format!("BAR={barometer} {elevation}"))
    }

    /// Set the archive interval in minutes.
    pub fn archive_period(minutes: u8) -> Self {
        Self::Text(format!("SETPER {minutes}"))
    }
}

impl Display for Command {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Text(text) => f.write_str(text),
            Self::Binary(data) => write!(f, "0x{}", hex::encode(data)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn encoded(command: &Command) -> Vec<u8> {
        let mut buffer = vec![];
        command.encode(&mut buffer);
        assert_eq!(buffer.len(), command.encoded_len());
        buffer
    }

    #[test]
    fn it_terminates_text_commands() {
        assert_eq!(encoded(&Command::get_time()), b"GETTIME\n");
        assert_eq!(encoded(&Command::loop2_packets(1)), b"LPS 2 1\n");
        assert_eq!(encoded(&Command::lamps(false)), b"LAMPS 0\n");
    }

    #[test]
    fn it_sends_binary_verbatim() {
        assert_eq!(encoded(&Command::wake_up()), &[0x1b, 0x0a]);
        assert_eq!(encoded(&Command::ack()), &[0x06]);
    }

    #[test]
    fn it_formats_eeprom_addresses_as_hex() {
        assert_eq!(encoded(&Command::eeprom_read(0x2d, 1)), b"EEBRD 2D 01\n");
        assert_eq!(
            encoded(&Command::eeprom_write_byte(0x0b, 0xfe)),
            b"EEWR 0B FE\n"
        );
        assert_eq!(encoded(&Command::eeprom_write(0x14, 3)), b"EEBWR 14 03\n");
    }

    #[test]
    fn it_appends_the_crc() {
        let command = Command::binary_with_crc(&[0xc6, 0xce, 0xa2, 0x03]);
        assert_eq!(encoded(&command), &[0xc6, 0xce, 0xa2, 0x03, 0xe2, 0xb4]);
    }

    #[test]
    fn it_displays_binary_as_hex() {
        assert_eq!(Command::wake_up().to_string(), "0x1b0a");
        assert_eq!(Command::barometer(29921, 132).to_string(), "BAR=29921 132");
    }
}
