//! The console's configuration EEPROM.
//!
//! Settings live at fixed addresses. They are read in blocks with `EEBRD`,
//! written in blocks with `EEBWR` or byte-wise with `EEWR`. Most changes only
//! take effect after `NEWSETUP`.

use bitflags::bitflags;
use bytes::Buf;
use serde::Serialize;

use crate::{
    Error,
    answer::AnswerFormat,
    command::Command,
    config::{
        Location,
        RainCollectorSize,
    },
    connection::Connection,
    units::{
        Quantity,
        Unit,
        UnitPreferences,
    },
};

/// int16, tenths of a degree, north positive
pub const LATITUDE: u16 = 0x0b;
/// int16, tenths of a degree, east positive
pub const LONGITUDE: u16 = 0x0d;
/// uint16, feet
pub const ALTITUDE: u16 = 0x0f;
/// uint8, index into the console's time zone list
pub const TIME_ZONE: u16 = 0x11;
/// int16, hundredths of an hour
pub const GMT_OFFSET: u16 = 0x14;
/// uint8, 1 if [`GMT_OFFSET`] is used instead of [`TIME_ZONE`]
pub const GMT_OR_ZONE: u16 = 0x16;
pub const UNIT_BITS: u16 = 0x29;
/// complement of [`UNIT_BITS`]
pub const UNIT_BITS_COMPLEMENT: u16 = 0x2a;
pub const SETUP_BITS: u16 = 0x2b;
/// uint8, month the yearly rain total is reset
pub const RAIN_SEASON_START: u16 = 0x2c;
/// uint8, minutes
pub const ARCHIVE_INTERVAL: u16 = 0x2d;

/// Archive intervals the console supports, in minutes.
pub const ARCHIVE_INTERVALS: [u8; 7] = [1, 5, 10, 15, 30, 60, 120];

bitflags! {
    /// Display units of the console.
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct UnitBits: u8 {
        const BAROMETER = 0b0000_0011;
        const TEMPERATURE = 0b0000_1100;
        const ELEVATION_METERS = 0b0001_0000;
        const RAIN_MILLIMETERS = 0b0010_0000;
        const WIND = 0b1100_0000;
    }
}

impl UnitBits {
    pub fn barometer(&self) -> Unit {
        match self.bits() & Self::BAROMETER.bits() {
            0 => Unit::InHg,
            1 => Unit::MmHg,
            2 => Unit::Hectopascal,
            _ => Unit::Millibar,
        }
    }

    pub fn temperature(&self) -> Unit {
        match (self.bits() & Self::TEMPERATURE.bits()) >> 2 {
            0 | 1 => Unit::Fahrenheit,
            _ => Unit::Celsius,
        }
    }

    pub fn rain(&self) -> Unit {
        if self.contains(Self::RAIN_MILLIMETERS) {
            Unit::Millimeter
        }
        else {
            Unit::Inch
        }
    }

    pub fn wind(&self) -> Unit {
        match (self.bits() & Self::WIND.bits()) >> 6 {
            0 => Unit::Mph,
            1 => Unit::MetersPerSecond,
            2 => Unit::KilometersPerHour,
            _ => Unit::Knots,
        }
    }

    /// Unit preferences matching what the console displays.
    pub fn unit_preferences(&self) -> UnitPreferences {
        let mut preferences = UnitPreferences::new();
        preferences.set(Quantity::Temperature, self.temperature());
        preferences.set(Quantity::Pressure, self.barometer());
        preferences.set(Quantity::Speed, self.wind());
        preferences.set(Quantity::Rain, self.rain());
        preferences.set(
            Quantity::RainRate,
            if self.contains(Self::RAIN_MILLIMETERS) {
                Unit::MillimeterPerHour
            }
            else {
                Unit::InchPerHour
            },
        );
        preferences
    }
}

bitflags! {
    #[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
    pub struct SetupBits: u8 {
        const AM_PM_MODE = 0b0000_0001;
        const IS_AM = 0b0000_0010;
        const MONTH_DAY = 0b0000_0100;
        const WIND_CUP_LARGE = 0b0000_1000;
        const RAIN_COLLECTOR = 0b0011_0000;
        const LATITUDE_NORTH = 0b0100_0000;
        const LONGITUDE_EAST = 0b1000_0000;
    }
}

impl SetupBits {
    pub fn rain_collector_size(&self) -> Option<RainCollectorSize> {
        let bits = (self.bits() & Self::RAIN_COLLECTOR.bits()) >> 4;
        RainCollectorSize::try_from(bits).ok()
    }
}

/// Settings read from the EEPROM.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConsoleSetup {
    pub location: Location,
    pub time_zone: u8,
    pub gmt_offset_hours: f64,
    pub uses_gmt_offset: bool,
    #[serde(serialize_with = "serialize_bits")]
    pub unit_bits: UnitBits,
    #[serde(serialize_with = "serialize_bits")]
    pub setup_bits: SetupBits,
    pub rain_season_start: u8,
    pub archive_interval: u8,
}

fn serialize_bits<B, S>(bits: &B, serializer: S) -> Result<S::Ok, S::Error>
where
    B: bitflags::Flags<Bits = u8>,
    S: serde::Serializer,
{
    serializer.serialize_u8(bits.bits())
}

impl ConsoleSetup {
    pub fn rain_collector_size(&self) -> Option<RainCollectorSize> {
        self.setup_bits.rain_collector_size()
    }

    fn parse(data: &[u8]) -> Self {
        let at = |address: u16| usize::from(address - LATITUDE);

        let location = {
            let mut data = &data[at(LATITUDE)..];
            Location {
                latitude: f64::from(data.get_i16_le()) / 10.0,
                longitude: f64::from(data.get_i16_le()) / 10.0,
                altitude: data.get_u16_le().into(),
            }
        };
        let gmt_offset = {
            let mut data = &data[at(GMT_OFFSET)..];
            data.get_i16_le()
        };

        Self {
            location,
            time_zone: data[at(TIME_ZONE)],
            gmt_offset_hours: f64::from(gmt_offset) / 100.0,
            uses_gmt_offset: data[at(GMT_OR_ZONE)] != 0,
            unit_bits: UnitBits::from_bits_retain(data[at(UNIT_BITS)]),
            setup_bits: SetupBits::from_bits_retain(data[at(SETUP_BITS)]),
            rain_season_start: data[at(RAIN_SEASON_START)],
            archive_interval: data[at(ARCHIVE_INTERVAL)],
        }
    }
}

/// Reads `length` bytes starting at `address`.
pub async fn read_eeprom(
    connection: &Connection,
    address: u16,
    length: u16,
) -> Result<Vec<u8>, Error> {
    let format = AnswerFormat::compile(&format!("<ACK>{length}<CRC>"))?;
    let data = connection
        .send_command(
            &Command::eeprom_read(address, length),
            connection.options().command_timeout,
            &format,
        )
        .await?;
    Ok(data.to_vec())
}

/// Writes a block of bytes starting at `address`.
///
/// The console answers both the command and the data with an ACK only, so
/// none of this is retried.
pub async fn write_eeprom(connection: &Connection, address: u16, data: &[u8]) -> Result<(), Error> {
    let length = u16::try_from(data.len())
        .ok()
        .filter(|length| *length > 0)
        .ok_or_else(|| {
            Error::InvalidArgument {
                station: connection.station().clone(),
                reason: format!("can't write {} bytes to the EEPROM", data.len()),
            }
        })?;

    let timeout = connection.options().command_timeout;
    let ack = AnswerFormat::compile("<ACK>")?;

    connection
        .send_command(&Command::eeprom_write(address, length), timeout, &ack)
        .await?;
    connection
        .send_command(&Command::binary_with_crc(data), timeout, &ack)
        .await?;

    tracing::debug!(station = %connection.station(), address, length, "wrote eeprom");
    Ok(())
}

/// Writes a single byte.
pub async fn write_eeprom_byte(connection: &Connection, address: u16, value: u8) -> Result<(), Error> {
    connection
        .send_command(
            &Command::eeprom_write_byte(address, value),
            connection.options().command_timeout,
            &AnswerFormat::compile("<LF><CR>OK<LF><CR>")?,
        )
        .await?;
    Ok(())
}

/// Makes the console apply changed settings.
pub async fn new_setup(connection: &Connection) -> Result<(), Error> {
    connection
        .send_command(
            &Command::new_setup(),
            connection.options().command_timeout,
            &AnswerFormat::compile("<ACK>")?,
        )
        .await?;
    Ok(())
}

/// Reads location, time zone, units and setup bits in one go.
pub async fn read_setup(connection: &Connection) -> Result<ConsoleSetup, Error> {
    let length = ARCHIVE_INTERVAL - LATITUDE + 1;
    let data = read_eeprom(connection, LATITUDE, length).await?;

    let setup = ConsoleSetup::parse(&data);
    if data[usize::from(UNIT_BITS_COMPLEMENT - LATITUDE)] != !setup.unit_bits.bits() {
        tracing::warn!(station = %connection.station(), "unit bits don't match their complement");
    }

    Ok(setup)
}

/// Writes latitude and longitude to the EEPROM and the elevation through the
/// barometer calibration, then applies the setup.
pub async fn write_location(connection: &Connection, location: &Location) -> Result<(), Error> {
    let tenths = |degrees: f64, limit: f64| {
        if degrees.is_finite() && degrees.abs() <= limit {
            Ok((degrees * 10.0).round() as i16)
        }
        else {
            Err(Error::InvalidArgument {
                station: connection.station().clone(),
                reason: format!("coordinate out of range: {degrees}"),
            })
        }
    };

    let mut data = Vec::with_capacity(4);
    data.extend_from_slice(&tenths(location.latitude, 90.0)?.to_le_bytes());
    data.extend_from_slice(&tenths(location.longitude, 180.0)?.to_le_bytes());

    write_eeprom(connection, LATITUDE, &data).await?;
    crate::console::set_barometer(connection, 0, location.altitude).await?;
    new_setup(connection).await
}

/// Sets the archive interval. Only the values in [`ARCHIVE_INTERVALS`] are
/// accepted.
///
/// The console clears its archive memory when the interval changes.
pub async fn set_archive_interval(connection: &Connection, minutes: u8) -> Result<(), Error> {
    if !ARCHIVE_INTERVALS.contains(&minutes) {
        return Err(Error::InvalidArgument {
            station: connection.station().clone(),
            reason: format!("unsupported archive interval: {minutes} minutes"),
        });
    }

    connection
        .send_command(
            &Command::archive_period(minutes),
            connection.options().command_timeout,
            &AnswerFormat::compile("<ACK>")?,
        )
        .await?;
    Ok(())
}

pub async fn set_rain_season_start(connection: &Connection, month: u8) -> Result<(), Error> {
    if !(1..=12).contains(&month) {
        return Err(Error::InvalidArgument {
            station: connection.station().clone(),
            reason: format!("invalid month: {month}"),
        });
    }

    write_eeprom_byte(connection, RAIN_SEASON_START, month).await?;
    new_setup(connection).await
}
