//! Decoders for the binary packets sent by the console.
//!
//! Every packet type is described by a static table of [`Field`]s. A field
//! knows where it is, how it's encoded, which raw value means "no sensor
//! data" and the unit of the raw value. Decoding a packet just runs through
//! its table, so a dashed field never affects its neighbours.

pub mod archive;
pub mod realtime;

use std::collections::BTreeMap;

use bytes::Buf;

use crate::units::NativeUnit;

/// Encoding of a field. Multi-byte values are little-endian.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Encoding {
    U8,
    I8,
    U16,
    I16,
}

impl Encoding {
    pub fn width(&self) -> usize {
        match self {
            Self::U8 | Self::I8 => 1,
            Self::U16 | Self::I16 => 2,
        }
    }

    fn read(&self, mut buffer: &[u8]) -> i32 {
        match self {
            Self::U8 => buffer.get_u8().into(),
            Self::I8 => buffer.get_i8().into(),
            Self::U16 => buffer.get_u16_le().into(),
            Self::I16 => buffer.get_i16_le().into(),
        }
    }
}

/// Describes a single field of a packet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Field {
    pub name: &'static str,
    pub offset: usize,
    pub encoding: Encoding,
    /// Raw value the console sends when it has no data for this field.
    pub sentinel: Option<i32>,
    pub unit: NativeUnit,
}

impl Field {
    pub const fn new(
        name: &'static str,
        offset: usize,
        encoding: Encoding,
        unit: NativeUnit,
    ) -> Self {
        Self {
            name,
            offset,
            encoding,
            sentinel: None,
            unit,
        }
    }

    pub const fn sentinel(mut self, sentinel: i32) -> Self {
        self.sentinel = Some(sentinel);
        self
    }

    /// Reads the field. Returns `None` if the raw value is the sentinel.
    ///
    /// # Panics
    ///
    /// Panics if `buffer` is too short. [`decode`] checks the length first.
    pub fn read(&self, buffer: &[u8]) -> RawReading {
        let value = self.encoding.read(&buffer[self.offset..]);
        RawReading {
            value: (Some(value) != self.sentinel).then_some(value),
            unit: self.unit,
        }
    }

    fn end(&self) -> usize {
        self.offset + self.encoding.width()
    }
}

/// A raw value as sent by the console.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct RawReading {
    /// `None` if the sensor reported no data.
    pub value: Option<i32>,
    pub unit: NativeUnit,
}

impl RawReading {
    pub fn is_missing(&self) -> bool {
        self.value.is_none()
    }
}

/// Decoded fields by name.
pub type Readings = BTreeMap<&'static str, RawReading>;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum PacketKind {
    Loop,
    Loop2,
    Archive,
}

impl PacketKind {
    pub fn name(&self) -> &'static str {
        match self {
            Self::Loop => "LOOP",
            Self::Loop2 => "LOOP2",
            Self::Archive => "archive",
        }
    }

    pub fn fields(&self) -> &'static [Field] {
        match self {
            Self::Loop => realtime::LOOP_FIELDS,
            Self::Loop2 => realtime::LOOP2_FIELDS,
            Self::Archive => archive::RECORD_FIELDS,
        }
    }

    /// Length of the packet without its CRC.
    pub fn length(&self) -> usize {
        match self {
            Self::Loop | Self::Loop2 => realtime::PACKET_LENGTH,
            Self::Archive => archive::RECORD_LENGTH,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
pub enum PacketError {
    #[error("expected at least {expected} bytes, got {actual}")]
    TooShort { expected: usize, actual: usize },

    #[error("invalid header: 0x{0}")]
    InvalidHeader(String),

    #[error("expected packet type {expected}, got {actual}")]
    WrongType { expected: u8, actual: u8 },
}

/// Decodes all fields of a packet.
pub fn decode(buffer: &[u8], kind: PacketKind) -> Result<Readings, PacketError> {
    if buffer.len() < kind.length() {
        return Err(PacketError::TooShort {
            expected: kind.length(),
            actual: buffer.len(),
        });
    }

    Ok(decode_fields(buffer, kind.fields()))
}

fn decode_fields(buffer: &[u8], fields: &'static [Field]) -> Readings {
    fields
        .iter()
        .map(|field| {
            debug_assert!(field.end() <= buffer.len());
            (field.name, field.read(buffer))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn it_reads_signed_values() {
        let field = Field::new("t", 1, Encoding::I16, NativeUnit::TenthsFahrenheit);
        let reading = field.read(&[0xff, 0xf4, 0xff]);
        assert_eq!(reading.value, Some(-12));
    }

    #[test]
    fn sentinels_mean_missing() {
        let field = Field::new("t", 0, Encoding::I16, NativeUnit::TenthsFahrenheit).sentinel(32767);
        assert!(field.read(&[0xff, 0x7f]).is_missing());
        assert_eq!(field.read(&[0xfe, 0x7f]).value, Some(32766));

        let field = Field::new("t", 0, Encoding::I16, NativeUnit::TenthsFahrenheit).sentinel(-32768);
        assert!(field.read(&[0x00, 0x80]).is_missing());
    }

    #[test]
    fn field_tables_fit_their_packets() {
        for kind in [PacketKind::Loop, PacketKind::Loop2, PacketKind::Archive] {
            for field in kind.fields() {
                assert!(
                    field.end() <= kind.length(),
                    "{} field {} overruns the packet",
                    kind.name(),
                    field.name
                );
            }
        }
    }

    #[test]
    fn field_names_are_unique() {
        for kind in [PacketKind::Loop, PacketKind::Loop2, PacketKind::Archive] {
            let readings = decode(&vec![0; kind.length()], kind).unwrap();
            assert_eq!(readings.len(), kind.fields().len(), "{}", kind.name());
        }
    }

    #[test]
    fn it_rejects_short_packets() {
        assert_eq!(
            decode(&[0; 51], PacketKind::Archive),
            Err(PacketError::TooShort {
                expected: 52,
                actual: 51
            })
        );
    }
}
