//! LOOP and LOOP2 packets.
//!
//! Both are 99 bytes: "LOO", the bar trend, the packet type, 90 bytes of
//! data, LF CR and the CRC.

use super::{
    Encoding::{
        I8,
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

/// Length of a LOOP or LOOP2 packet without its CRC.
pub const PACKET_LENGTH: usize = 97;

const HEADER: &[u8] = b"LOO";

/// 'P' in the bar trend field means the console doesn't know the trend.
const NO_BAR_TREND: i32 = b'P' as i32;

pub static LOOP_FIELDS: &[Field] = &[
    Field::new("barTrend", 3, I8, Count).sentinel(NO_BAR_TREND),
    Field::new("nextArchiveRecord", 5, U16, Count),
    Field::new("barometer", 7, U16, ThousandthsInHg).sentinel(0),
    Field::new("insideTemperature", 9, I16, TenthsFahrenheit).sentinel(32767),
    Field::new("insideHumidity", 11, U8, Percent).sentinel(255),
    Field::new("outsideTemperature", 12, I16, TenthsFahrenheit).sentinel(32767),
    Field::new("windSpeed", 14, U8, Mph).sentinel(255),
    Field::new("windSpeed10MinuteAverage", 15, U8, Mph).sentinel(255),
    Field::new("windDirection", 16, U16, Degrees).sentinel(0),
    Field::new("extraTemperature1", 18, U8, FahrenheitOffset90).sentinel(255),
    Field::new("extraTemperature2", 19, U8, FahrenheitOffset90).sentinel(255),
    Field::new("extraTemperature3", 20, U8, FahrenheitOffset90).sentinel(255),
    Field::new("extraTemperature4", 21, U8, FahrenheitOffset90).sentinel(255),
    Field::new("extraTemperature5", 22, U8, FahrenheitOffset90).sentinel(255),
    Field::new("extraTemperature6", 23, U8, FahrenheitOffset90).sentinel(255),
    Field::new("extraTemperature7", 24, U8, FahrenheitOffset90).sentinel(255),
    Field::new("soilTemperature1", 25, U8, FahrenheitOffset90).sentinel(255),
    Field::new("soilTemperature2", 26, U8, FahrenheitOffset90).sentinel(255),
    Field::new("soilTemperature3", 27, U8, FahrenheitOffset90).sentinel(255),
    Field::new("soilTemperature4", 28, U8, FahrenheitOffset90).sentinel(255),
    Field::new("leafTemperature1", 29, U8, FahrenheitOffset90).sentinel(255),
    Field::new("leafTemperature2", 30, U8, FahrenheitOffset90).sentinel(255),
    Field::new("leafTemperature3", 31, U8, FahrenheitOffset90).sentinel(255),
    Field::new("leafTemperature4", 32, U8, FahrenheitOffset90).sentinel(255),
    Field::new("outsideHumidity", 33, U8, Percent).sentinel(255),
    Field::new("extraHumidity1", 34, U8, Percent).sentinel(255),
    Field::new("extraHumidity2", 35, U8, Percent).sentinel(255),
    Field::new("extraHumidity3", 36, U8, Percent).sentinel(255),
    Field::new("extraHumidity4", 37, U8, Percent).sentinel(255),
    Field::new("extraHumidity5", 38, U8, Percent).sentinel(255),
    Field::new("extraHumidity6", 39, U8, Percent).sentinel(255),
    Field::new("extraHumidity7", 40, U8, Percent).sentinel(255),
    Field::new("rainRate", 41, U16, RainClicksPerHour).sentinel(65535),
    Field::new("uvIndex", 43, U8, TenthsUvIndex).sentinel(255),
    Field::new("solarRadiation", 44, U16, WattsPerSquareMeter).sentinel(32767),
    Field::new("stormRain", 46, U16, RainClicks),
    Field::new("stormStartDate", 48, U16, Count).sentinel(65535),
    Field::new("dayRain", 50, U16, RainClicks),
    Field::new("monthRain", 52, U16, RainClicks),
    Field::new("yearRain", 54, U16, RainClicks),
    Field::new("dayET", 56, U16, ThousandthsInch),
    Field::new("monthET", 58, U16, HundredthsInch),
    Field::new("yearET", 60, U16, HundredthsInch),
    Field::new("soilMoisture1", 62, U8, Centibar).sentinel(255),
    Field::new("soilMoisture2", 63, U8, Centibar).sentinel(255),
    Field::new("soilMoisture3", 64, U8, Centibar).sentinel(255),
    Field::new("soilMoisture4", 65, U8, Centibar).sentinel(255),
    Field::new("leafWetness1", 66, U8, LeafWetness).sentinel(255),
    Field::new("leafWetness2", 67, U8, LeafWetness).sentinel(255),
    Field::new("leafWetness3", 68, U8, LeafWetness).sentinel(255),
    Field::new("leafWetness4", 69, U8, LeafWetness).sentinel(255),
    Field::new("transmitterBatteryStatus", 86, U8, Count),
    Field::new("consoleBatteryVoltage", 87, U16, ConsoleVoltage),
    Field::new("forecastIcons", 89, U8, Count),
    Field::new("forecastRule", 90, U8, Count),
    Field::new("sunrise", 91, U16, Count),
    Field::new("sunset", 93, U16, Count),
];

pub static LOOP2_FIELDS: &[Field] = &[
    Field::new("barTrend", 3, I8, Count).sentinel(NO_BAR_TREND),
    Field::new("barometer", 7, U16, ThousandthsInHg).sentinel(0),
    Field::new("insideTemperature", 9, I16, TenthsFahrenheit).sentinel(32767),
    Field::new("insideHumidity", 11, U8, Percent).sentinel(255),
    Field::new("outsideTemperature", 12, I16, TenthsFahrenheit).sentinel(32767),
    Field::new("windSpeed", 14, U8, Mph).sentinel(255),
    Field::new("windDirection", 16, U16, Degrees).sentinel(0),
    Field::new("windSpeed10MinuteAverage", 18, U16, TenthsMph).sentinel(32767),
    Field::new("windSpeed2MinuteAverage", 20, U16, TenthsMph).sentinel(32767),
    Field::new("windGust10Minute", 22, U16, Mph).sentinel(32767),
    Field::new("windGustDirection10Minute", 24, U16, Degrees).sentinel(0),
    Field::new("dewPoint", 30, I16, Fahrenheit).sentinel(255),
    Field::new("outsideHumidity", 33, U8, Percent).sentinel(255),
    Field::new("heatIndex", 35, I16, Fahrenheit).sentinel(255),
    Field::new("windChill", 37, I16, Fahrenheit).sentinel(255),
    Field::new("thswIndex", 39, I16, Fahrenheit).sentinel(255),
    Field::new("rainRate", 41, U16, RainClicksPerHour).sentinel(65535),
    Field::new("uvIndex", 43, U8, TenthsUvIndex).sentinel(255),
    Field::new("solarRadiation", 44, U16, WattsPerSquareMeter).sentinel(32767),
    Field::new("stormRain", 46, U16, RainClicks),
    Field::new("stormStartDate", 48, U16, Count).sentinel(65535),
    Field::new("dayRain", 50, U16, RainClicks),
    Field::new("rain15Minute", 52, U16, RainClicks),
    Field::new("rainHour", 54, U16, RainClicks),
    Field::new("dayET", 56, U16, ThousandthsInch),
    Field::new("rain24Hour", 58, U16, RainClicks),
    Field::new("barometricReductionMethod", 60, U8, Count),
    Field::new("userBarometricOffset", 61, I16, ThousandthsInHg),
    Field::new("barometricCalibration", 63, I16, ThousandthsInHg),
    Field::new("barometricSensorRaw", 65, U16, ThousandthsInHg).sentinel(0),
    Field::new("absoluteBarometricPressure", 67, U16, ThousandthsInHg).sentinel(0),
    Field::new("altimeterSetting", 69, U16, ThousandthsInHg).sentinel(0),
];

fn packet_type(kind: PacketKind) -> u8 {
    match kind {
        PacketKind::Loop2 => 1,
        _ => 0,
    }
}

/// Checks the header and packet type, then decodes the fields.
pub fn decode_realtime(buffer: &[u8], kind: PacketKind) -> Result<Readings, PacketError> {
    if buffer.len() < PACKET_LENGTH {
        return Err(PacketError::TooShort {
            expected: PACKET_LENGTH,
            actual: buffer.len(),
        });
    }

    if &buffer[..3] != HEADER {
        return Err(PacketError::InvalidHeader(hex::encode(&buffer[..3])));
    }

    let expected = packet_type(kind);
    if buffer[4] != expected {
        return Err(PacketError::WrongType {
            expected,
            actual: buffer[4],
        });
    }

    decode(buffer, kind)
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;

    /// An empty packet with a valid header.
    pub fn packet(kind: PacketKind) -> Vec<u8> {
        let mut buffer = vec![0; PACKET_LENGTH];
        buffer[..3].copy_from_slice(HEADER);
        buffer[3] = b'P';
        buffer[4] = packet_type(kind);
        buffer[95] = b'\n';
        buffer[96] = b'\r';
        buffer
    }

    pub fn put_u16(buffer: &mut [u8], offset: usize, value: u16) {
        buffer[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
    }

    #[test]
    fn it_decodes_a_loop_packet() {
        let mut buffer = packet(PacketKind::Loop);
        put_u16(&mut buffer, 7, 29921);
        put_u16(&mut buffer, 12, 725);
        buffer[14] = 12;
        put_u16(&mut buffer, 16, 270);
        buffer[18] = 160;
        buffer[19] = 255;
        buffer[33] = 56;
        put_u16(&mut buffer, 41, 65535);
        put_u16(&mut buffer, 50, 42);
        put_u16(&mut buffer, 87, 768);

        let readings = decode_realtime(&buffer, PacketKind::Loop).unwrap();
        assert_eq!(readings["barometer"].value, Some(29921));
        assert_eq!(readings["outsideTemperature"].value, Some(725));
        assert_eq!(readings["windSpeed"].value, Some(12));
        assert_eq!(readings["windDirection"].value, Some(270));
        assert_eq!(readings["extraTemperature1"].value, Some(160));
        assert!(readings["extraTemperature2"].is_missing());
        assert_eq!(readings["outsideHumidity"].value, Some(56));
        assert!(readings["rainRate"].is_missing());
        assert_eq!(readings["dayRain"].value, Some(42));
        assert_eq!(readings["consoleBatteryVoltage"].value, Some(768));
        assert!(readings["barTrend"].is_missing());
    }

    #[test]
    fn dashed_humidity_does_not_affect_neighbours() {
        let mut buffer = packet(PacketKind::Loop2);
        put_u16(&mut buffer, 30, 48);
        buffer[33] = 255;
        put_u16(&mut buffer, 35, 80);
        put_u16(&mut buffer, 12, 801);

        let readings = decode_realtime(&buffer, PacketKind::Loop2).unwrap();
        assert!(readings["outsideHumidity"].is_missing());
        assert_eq!(readings["dewPoint"].value, Some(48));
        assert_eq!(readings["heatIndex"].value, Some(80));
        assert_eq!(readings["outsideTemperature"].value, Some(801));
    }

    #[test]
    fn it_reads_negative_temperatures() {
        let mut buffer = packet(PacketKind::Loop2);
        buffer[12..14].copy_from_slice(&(-55i16).to_le_bytes());
        buffer[37..39].copy_from_slice(&(-12i16).to_le_bytes());

        let readings = decode_realtime(&buffer, PacketKind::Loop2).unwrap();
        assert_eq!(readings["outsideTemperature"].value, Some(-55));
        assert_eq!(readings["windChill"].value, Some(-12));
    }

    #[test]
    fn it_checks_the_header() {
        let mut buffer = packet(PacketKind::Loop);
        buffer[0] = b'X';
        assert!(matches!(
            decode_realtime(&buffer, PacketKind::Loop),
            Err(PacketError::InvalidHeader(_))
        ));

        let buffer = packet(PacketKind::Loop);
        assert_eq!(
            decode_realtime(&buffer, PacketKind::Loop2),
            Err(PacketError::WrongType {
                expected: 1,
                actual: 0
            })
        );
    }
}
