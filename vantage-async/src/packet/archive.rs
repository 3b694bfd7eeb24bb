//! Archive records (revision B), as downloaded with DMP and DMPAFT.

use chrono::{
    Datelike,
    NaiveDate,
    NaiveDateTime,
    NaiveTime,
    Timelike,
};

use super::{
    Encoding::{
        I16,
        U8,
        U16,
    },
    Field,
    PacketError,
    PacketKind,
    Readings,
    decode,
};
use crate::units::NativeUnit::*;

pub const RECORD_LENGTH: usize = 52;

pub const RECORDS_PER_PAGE: usize = 5;

/// Length of a page without its CRC: sequence number, 5 records and 4 unused
/// bytes.
pub const PAGE_LENGTH: usize = 1 + RECORDS_PER_PAGE * RECORD_LENGTH + 4;

/// Date stamp of a record that was never written.
const EMPTY_DATE: u16 = 0xffff;

pub static RECORD_FIELDS: &[Field] = &[
    Field::new("outsideTemperature", 4, I16, TenthsFahrenheit).sentinel(32767),
    Field::new("outsideTemperatureHigh", 6, I16, TenthsFahrenheit).sentinel(-32768),
    Field::new("outsideTemperatureLow", 8, I16, TenthsFahrenheit).sentinel(32767),
    Field::new("rainfall", 10, U16, RainClicks),
    Field::new("rainRateHigh", 12, U16, RainClicksPerHour),
    Field::new("barometer", 14, U16, ThousandthsInHg).sentinel(0),
    Field::new("solarRadiation", 16, U16, WattsPerSquareMeter).sentinel(32767),
    Field::new("windSamples", 18, U16, Count),
    Field::new("insideTemperature", 20, I16, TenthsFahrenheit).sentinel(32767),
    Field::new("insideHumidity", 22, U8, Percent).sentinel(255),
    Field::new("outsideHumidity", 23, U8, Percent).sentinel(255),
    Field::new("windSpeedAverage", 24, U8, Mph).sentinel(255),
    Field::new("windSpeedHigh", 25, U8, Mph),
    Field::new("windDirectionHigh", 26, U8, DirectionCode).sentinel(255),
    Field::new("windDirectionPrevailing", 27, U8, DirectionCode).sentinel(255),
    Field::new("uvIndexAverage", 28, U8, TenthsUvIndex).sentinel(255),
    Field::new("et", 29, U8, ThousandthsInch),
    Field::new("solarRadiationHigh", 30, U16, WattsPerSquareMeter).sentinel(32767),
    Field::new("uvIndexHigh", 32, U8, TenthsUvIndex).sentinel(255),
    Field::new("forecastRule", 33, U8, Count).sentinel(193),
    Field::new("leafTemperature1", 34, U8, FahrenheitOffset90).sentinel(255),
    Field::new("leafTemperature2", 35, U8, FahrenheitOffset90).sentinel(255),
    Field::new("leafWetness1", 36, U8, LeafWetness).sentinel(255),
    Field::new("leafWetness2", 37, U8, LeafWetness).sentinel(255),
    Field::new("soilTemperature1", 38, U8, FahrenheitOffset90).sentinel(255),
    Field::new("soilTemperature2", 39, U8, FahrenheitOffset90).sentinel(255),
    Field::new("soilTemperature3", 40, U8, FahrenheitOffset90).sentinel(255),
    Field::new("soilTemperature4", 41, U8, FahrenheitOffset90).sentinel(255),
    Field::new("recordType", 42, U8, Count),
    Field::new("extraHumidity1", 43, U8, Percent).sentinel(255),
    Field::new("extraHumidity2", 44, U8, Percent).sentinel(255),
    Field::new("extraTemperature1", 45, U8, FahrenheitOffset90).sentinel(255),
    Field::new("extraTemperature2", 46, U8, FahrenheitOffset90).sentinel(255),
    Field::new("extraTemperature3", 47, U8, FahrenheitOffset90).sentinel(255),
    Field::new("soilMoisture1", 48, U8, Centibar).sentinel(255),
    Field::new("soilMoisture2", 49, U8, Centibar).sentinel(255),
    Field::new("soilMoisture3", 50, U8, Centibar).sentinel(255),
    Field::new("soilMoisture4", 51, U8, Centibar).sentinel(255),
];

/// Unpacks a date stamp: `day + month * 32 + (year - 2000) * 512`.
pub fn unpack_date(stamp: u16) -> Option<NaiveDate> {
    let day = u32::from(stamp & 0x1f);
    let month = u32::from((stamp >> 5) & 0x0f);
    let year = i32::from(stamp >> 9) + 2000;
    NaiveDate::from_ymd_opt(year, month, day)
}

/// Unpacks a time stamp: `hour * 100 + minute`.
pub fn unpack_time(stamp: u16) -> Option<NaiveTime> {
    NaiveTime::from_hms_opt(u32::from(stamp / 100), u32::from(stamp % 100), 0)
}

pub fn pack_date(date: NaiveDate) -> u16 {
    let year = (date.year() - 2000).clamp(0, 127) as u16;
    date.day() as u16 + date.month() as u16 * 32 + year * 512
}

pub fn pack_time(time: NaiveTime) -> u16 {
    (time.hour() * 100 + time.minute()) as u16
}

/// Date and time stamp, in the order DMPAFT expects them.
pub fn pack_timestamp(timestamp: NaiveDateTime) -> [u8; 4] {
    let date = pack_date(timestamp.date()).to_le_bytes();
    let time = pack_time(timestamp.time()).to_le_bytes();
    [date[0], date[1], time[0], time[1]]
}

/// A decoded archive record.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchiveRecord {
    /// Console-local time at the end of the archive interval.
    pub timestamp: NaiveDateTime,
    pub readings: Readings,
}

/// Decodes a single record. Returns `None` for records that were never
/// written.
pub fn decode_record(buffer: &[u8]) -> Result<Option<ArchiveRecord>, PacketError> {
    let readings = decode(buffer, PacketKind::Archive)?;

    let date_stamp = u16::from_le_bytes([buffer[0], buffer[1]]);
    let time_stamp = u16::from_le_bytes([buffer[2], buffer[3]]);
    if date_stamp == EMPTY_DATE {
        return Ok(None);
    }

    let (Some(date), Some(time)) = (unpack_date(date_stamp), unpack_time(time_stamp))
    else {
        tracing::debug!(date_stamp, time_stamp, "skipping record with invalid timestamp");
        return Ok(None);
    };

    Ok(Some(ArchiveRecord {
        timestamp: date.and_time(time),
        readings,
    }))
}

/// An archive page, i.e. what the console sends per ACK during a download.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ArchivePage {
    pub sequence: u8,
    /// The five records in order. `None` where a record slot is empty.
    pub records: Vec<Option<ArchiveRecord>>,
}

pub fn decode_page(buffer: &[u8]) -> Result<ArchivePage, PacketError> {
    if buffer.len() < PAGE_LENGTH {
        return Err(PacketError::TooShort {
            expected: PAGE_LENGTH,
            actual: buffer.len(),
        });
    }

    let records = buffer[1..1 + RECORDS_PER_PAGE * RECORD_LENGTH]
        .chunks_exact(RECORD_LENGTH)
        .map(decode_record)
        .collect::<Result<_, _>>()?;

    Ok(ArchivePage {
        sequence: buffer[0],
        records,
    })
}
