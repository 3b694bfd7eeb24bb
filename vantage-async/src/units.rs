//! Unit conversion.
//!
//! Raw readings come in whatever encoding the console uses (tenths of °F,
//! rain bucket tips, ...). [`to_native`] turns them into engineering units,
//! which are then converted per physical quantity into metric and the user's
//! preferred units by [`to_target_unit`].
//!
//! Unknown quantities or units are never an error: the value is passed
//! through unconverted and a warning is logged. Each reading is converted on
//! its own, so a missing field doesn't affect the others.

use std::{
    collections::{
        BTreeMap,
        HashMap,
    },
    fmt::{
        self,
        Display,
    },
    str::FromStr,
};

use serde::{
    Deserialize,
    Serialize,
};

use crate::{
    config::RainCollectorSize,
    packet::{
        RawReading,
        Readings,
    },
};

/// How the console encodes a value.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum NativeUnit {
    TenthsFahrenheit,
    Fahrenheit,
    /// °F + 90, used by the single byte extra temperatures
    FahrenheitOffset90,
    ThousandthsInHg,
    Mph,
    TenthsMph,
    Degrees,
    /// 0 to 15, clockwise from north in 22.5° steps
    DirectionCode,
    Percent,
    /// tips of the rain bucket
    RainClicks,
    RainClicksPerHour,
    TenthsUvIndex,
    WattsPerSquareMeter,
    ThousandthsInch,
    HundredthsInch,
    /// raw ADC reading of the console battery
    ConsoleVoltage,
    Centibar,
    LeafWetness,
    /// Anything that is just a number, e.g. counters or codes.
    Count,
}

impl NativeUnit {
    pub fn quantity(&self) -> Quantity {
        match self {
            Self::TenthsFahrenheit | Self::Fahrenheit | Self::FahrenheitOffset90 => {
                Quantity::Temperature
            }
            Self::ThousandthsInHg => Quantity::Pressure,
            Self::Mph | Self::TenthsMph => Quantity::Speed,
            Self::Degrees | Self::DirectionCode => Quantity::Direction,
            Self::Percent => Quantity::Humidity,
            Self::RainClicks | Self::ThousandthsInch | Self::HundredthsInch => Quantity::Rain,
            Self::RainClicksPerHour => Quantity::RainRate,
            Self::TenthsUvIndex => Quantity::Uv,
            Self::WattsPerSquareMeter => Quantity::Irradiance,
            Self::ConsoleVoltage => Quantity::Voltage,
            Self::Centibar => Quantity::SoilMoisture,
            Self::LeafWetness => Quantity::LeafWetness,
            Self::Count => Quantity::Count,
        }
    }
}

/// Converts a raw value into the native unit of its quantity.
///
/// Rain is scaled by the size of the rain collector's bucket and ends up in
/// millimeters, everything else is a fixed transform.
pub fn to_native(raw: i32, unit: NativeUnit, rain_collector_size: RainCollectorSize) -> f64 {
    let raw = f64::from(raw);

    match unit {
        NativeUnit::TenthsFahrenheit | NativeUnit::TenthsMph | NativeUnit::TenthsUvIndex => {
            raw / 10.0
        }
        NativeUnit::FahrenheitOffset90 => raw - 90.0,
        NativeUnit::ThousandthsInHg => raw / 1000.0,
        NativeUnit::DirectionCode => raw * 22.5,
        NativeUnit::RainClicks | NativeUnit::RainClicksPerHour => {
            round(raw * rain_collector_size.millimeters_per_click(), 3)
        }
        NativeUnit::ThousandthsInch => round(raw * 0.0254, 3),
        NativeUnit::HundredthsInch => round(raw * 0.254, 3),
        NativeUnit::ConsoleVoltage => raw * 300.0 / 512.0 / 100.0,
        NativeUnit::Fahrenheit
        | NativeUnit::Mph
        | NativeUnit::Degrees
        | NativeUnit::Percent
        | NativeUnit::WattsPerSquareMeter
        | NativeUnit::Centibar
        | NativeUnit::LeafWetness
        | NativeUnit::Count => raw,
    }
}

/// A physical quantity.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum Quantity {
    Temperature,
    Speed,
    Direction,
    Pressure,
    Rain,
    RainRate,
    Uv,
    Irradiance,
    Humidity,
    Voltage,
    SoilMoisture,
    LeafWetness,
    Count,
}

impl Quantity {
    pub const ALL: [Quantity; 13] = [
        Self::Temperature,
        Self::Speed,
        Self::Direction,
        Self::Pressure,
        Self::Rain,
        Self::RainRate,
        Self::Uv,
        Self::Irradiance,
        Self::Humidity,
        Self::Voltage,
        Self::SoilMoisture,
        Self::LeafWetness,
        Self::Count,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            Self::Temperature => "temperature",
            Self::Speed => "speed",
            Self::Direction => "direction",
            Self::Pressure => "pressure",
            Self::Rain => "rain",
            Self::RainRate => "rainRate",
            Self::Uv => "uv",
            Self::Irradiance => "irradiance",
            Self::Humidity => "humidity",
            Self::Voltage => "voltage",
            Self::SoilMoisture => "soilMoisture",
            Self::LeafWetness => "leafWetness",
            Self::Count => "count",
        }
    }

    /// Unit of values coming out of [`to_native`].
    pub fn native_unit(&self) -> Unit {
        match self {
            Self::Temperature => Unit::Fahrenheit,
            Self::Speed => Unit::Mph,
            Self::Direction => Unit::Degrees,
            Self::Pressure => Unit::InHg,
            Self::Rain => Unit::Millimeter,
            Self::RainRate => Unit::MillimeterPerHour,
            Self::Uv => Unit::UvIndex,
            Self::Irradiance => Unit::WattsPerSquareMeter,
            Self::Humidity => Unit::Percent,
            Self::Voltage => Unit::Volt,
            Self::SoilMoisture => Unit::Centibar,
            Self::LeafWetness => Unit::LeafWetnessIndex,
            Self::Count => Unit::None,
        }
    }

    pub fn metric_unit(&self) -> Unit {
        match self {
            Self::Temperature => Unit::Celsius,
            Self::Speed => Unit::KilometersPerHour,
            Self::Pressure => Unit::Hectopascal,
            _ => self.native_unit(),
        }
    }
}

impl Display for Quantity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for Quantity {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|quantity| quantity.name() == s)
            .ok_or_else(|| UnknownName(s.to_owned()))
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub enum Unit {
    Fahrenheit,
    Celsius,
    Kelvin,
    Mph,
    KilometersPerHour,
    MetersPerSecond,
    Knots,
    Beaufort,
    Degrees,
    Compass,
    InHg,
    Hectopascal,
    Millibar,
    MmHg,
    Millimeter,
    Inch,
    MillimeterPerHour,
    InchPerHour,
    UvIndex,
    WattsPerSquareMeter,
    Percent,
    Volt,
    Centibar,
    LeafWetnessIndex,
    None,
}

impl Unit {
    pub const ALL: [Unit; 25] = [
        Self::Fahrenheit,
        Self::Celsius,
        Self::Kelvin,
        Self::Mph,
        Self::KilometersPerHour,
        Self::MetersPerSecond,
        Self::Knots,
        Self::Beaufort,
        Self::Degrees,
        Self::Compass,
        Self::InHg,
        Self::Hectopascal,
        Self::Millibar,
        Self::MmHg,
        Self::Millimeter,
        Self::Inch,
        Self::MillimeterPerHour,
        Self::InchPerHour,
        Self::UvIndex,
        Self::WattsPerSquareMeter,
        Self::Percent,
        Self::Volt,
        Self::Centibar,
        Self::LeafWetnessIndex,
        Self::None,
    ];

    pub fn symbol(&self) -> &'static str {
        match self {
            Self::Fahrenheit => "°F",
            Self::Celsius => "°C",
            Self::Kelvin => "K",
            Self::Mph => "mph",
            Self::KilometersPerHour => "km/h",
            Self::MetersPerSecond => "m/s",
            Self::Knots => "kn",
            Self::Beaufort => "bft",
            Self::Degrees => "°",
            Self::Compass => "compass",
            Self::InHg => "inHg",
            Self::Hectopascal => "hPa",
            Self::Millibar => "mbar",
            Self::MmHg => "mmHg",
            Self::Millimeter => "mm",
            Self::Inch => "in",
            Self::MillimeterPerHour => "mm/h",
            Self::InchPerHour => "in/h",
            Self::UvIndex => "index",
            Self::WattsPerSquareMeter => "W/m²",
            Self::Percent => "%",
            Self::Volt => "V",
            Self::Centibar => "cb",
            Self::LeafWetnessIndex => "wetness",
            Self::None => "",
        }
    }
}

impl Display for Unit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.symbol())
    }
}

impl FromStr for Unit {
    type Err = UnknownName;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        // a few ascii spellings for the symbols
        let s = match s {
            "F" | "degF" => "°F",
            "C" | "degC" => "°C",
            "deg" => "°",
            "W/m2" => "W/m²",
            s => s,
        };
        Self::ALL
            .into_iter()
            .find(|unit| unit.symbol() == s)
            .ok_or_else(|| UnknownName(s.to_owned()))
    }
}

impl TryFrom<String> for Unit {
    type Error = UnknownName;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Unit> for String {
    fn from(value: Unit) -> Self {
        value.symbol().to_owned()
    }
}

#[derive(Clone, Debug, PartialEq, Eq, thiserror::Error)]
#[error("unknown name: {0}")]
pub struct UnknownName(pub String);

/// A converted value. Most are numbers, but e.g. compass directions are text.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum Value {
    Number(f64),
    Text(String),
}

impl Value {
    pub fn as_f64(&self) -> Option<f64> {
        match self {
            Self::Number(value) => Some(*value),
            Self::Text(_) => None,
        }
    }
}

impl From<f64> for Value {
    fn from(value: f64) -> Self {
        Self::Number(value)
    }
}

/// A value with its unit. `value` is `None` if the sensor reported no data.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Measurement {
    pub value: Option<Value>,
    pub unit: Unit,
}

/// Converts a native value of `quantity` into `target`.
///
/// If `target` can't be parsed or doesn't fit the quantity, the value is
/// returned in its native unit.
pub fn to_target_unit(value: f64, quantity: Quantity, target: &str) -> Measurement {
    match target.parse::<Unit>() {
        Ok(unit) => convert(value, quantity, unit),
        Err(_) => {
            tracing::warn!(%quantity, unit = target, "unknown unit, leaving value unconverted");
            unconverted(value, quantity)
        }
    }
}

/// Converts a native value of `quantity` into `unit`.
pub fn convert(value: f64, quantity: Quantity, unit: Unit) -> Measurement {
    let converted = match (quantity, unit) {
        (quantity, unit) if unit == quantity.native_unit() => Some(Value::Number(value)),

        (Quantity::Temperature, Unit::Celsius) => Some(fahrenheit_to_celsius(value).into()),
        (Quantity::Temperature, Unit::Kelvin) => {
            Some((fahrenheit_to_celsius(value) + 273.15).into())
        }

        (Quantity::Speed, Unit::KilometersPerHour) => Some((value * 1.609344).into()),
        (Quantity::Speed, Unit::MetersPerSecond) => Some((value * 0.44704).into()),
        (Quantity::Speed, Unit::Knots) => Some((value * 0.868976).into()),
        (Quantity::Speed, Unit::Beaufort) => Some(f64::from(beaufort(value * 0.44704)).into()),

        (Quantity::Direction, Unit::Compass) => Some(Value::Text(compass(value).to_owned())),

        (Quantity::Pressure, Unit::Hectopascal | Unit::Millibar) => {
            Some((value * 33.863_886).into())
        }
        (Quantity::Pressure, Unit::MmHg) => Some((value * 25.4).into()),

        (Quantity::Rain, Unit::Inch) => Some((value / 25.4).into()),
        (Quantity::RainRate, Unit::InchPerHour) => Some((value / 25.4).into()),

        _ => None,
    };

    match converted {
        Some(value) => {
            Measurement {
                value: Some(value),
                unit,
            }
        }
        None => {
            tracing::warn!(%quantity, %unit, "no conversion, leaving value unconverted");
            unconverted(value, quantity)
        }
    }
}

fn unconverted(value: f64, quantity: Quantity) -> Measurement {
    Measurement {
        value: Some(Value::Number(value)),
        unit: quantity.native_unit(),
    }
}

fn fahrenheit_to_celsius(value: f64) -> f64 {
    (value - 32.0) * 5.0 / 9.0
}

/// Beaufort number for a wind speed in m/s.
fn beaufort(meters_per_second: f64) -> u8 {
    const LIMITS: [f64; 12] = [
        0.3, 1.6, 3.4, 5.5, 8.0, 10.8, 13.9, 17.2, 20.8, 24.5, 28.5, 32.7,
    ];
    LIMITS
        .iter()
        .position(|limit| meters_per_second < *limit)
        .unwrap_or(LIMITS.len()) as u8
}

/// 16 point compass direction for degrees.
fn compass(degrees: f64) -> &'static str {
    const POINTS: [&str; 16] = [
        "N", "NNE", "NE", "ENE", "E", "ESE", "SE", "SSE", "S", "SSW", "SW", "WSW", "W", "WNW", "NW",
        "NNW",
    ];
    let index = (degrees.rem_euclid(360.0) / 22.5 + 0.5).floor() as usize % 16;
    POINTS[index]
}

fn round(value: f64, decimals: i32) -> f64 {
    let factor = 10f64.powi(decimals);
    (value * factor).round() / factor
}

/// Which unit the user wants for each quantity, e.g.
/// `{ "temperature": "°C", "rain": "in" }`.
///
/// Quantities without an entry are left in their native unit.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct UnitPreferences {
    units: HashMap<String, String>,
}

impl UnitPreferences {
    pub fn new() -> Self {
        Self {
            units: HashMap::new(),
        }
    }

    pub fn set(&mut self, quantity: Quantity, unit: Unit) {
        self.units
            .insert(quantity.name().to_owned(), unit.symbol().to_owned());
    }

    pub fn get(&self, quantity: Quantity) -> Option<&str> {
        self.units.get(quantity.name()).map(String::as_str)
    }

    /// Logs a warning for every entry that names an unknown quantity.
    pub fn warn_unknown(&self) {
        for name in self.units.keys() {
            if name.parse::<Quantity>().is_err() {
                tracing::warn!(quantity = %name, "unknown quantity in unit preferences");
            }
        }
    }
}

impl Default for UnitPreferences {
    /// Metric units.
    fn default() -> Self {
        let mut preferences = Self::new();
        for quantity in Quantity::ALL {
            preferences.set(quantity, quantity.metric_unit());
        }
        preferences
    }
}

/// A reading in native, metric and user units.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ConvertedReading {
    pub quantity: Quantity,
    pub native: Measurement,
    pub metric: Measurement,
    pub user: Measurement,
}

/// Converts a single raw reading.
pub fn convert_reading(
    raw: &RawReading,
    rain_collector_size: RainCollectorSize,
    preferences: &UnitPreferences,
) -> ConvertedReading {
    let quantity = raw.unit.quantity();

    let Some(raw_value) = raw.value
    else {
        let missing = |unit| {
            Measurement {
                value: None,
                unit,
            }
        };
        // the unit a present value would have been converted to
        let user_unit = match preferences.get(quantity) {
            Some(unit) => to_target_unit(0.0, quantity, unit).unit,
            None => quantity.native_unit(),
        };
        return ConvertedReading {
            quantity,
            native: missing(quantity.native_unit()),
            metric: missing(quantity.metric_unit()),
            user: missing(user_unit),
        };
    };

    let native = to_native(raw_value, raw.unit, rain_collector_size);
    let user = match preferences.get(quantity) {
        Some(unit) => to_target_unit(native, quantity, unit),
        None => unconverted(native, quantity),
    };

    ConvertedReading {
        quantity,
        native: unconverted(native, quantity),
        metric: convert(native, quantity, quantity.metric_unit()),
        user,
    }
}

/// Converts all readings of a packet.
pub fn convert_packet(
    readings: &Readings,
    rain_collector_size: RainCollectorSize,
    preferences: &UnitPreferences,
) -> BTreeMap<&'static str, ConvertedReading> {
    readings
        .iter()
        .map(|(name, raw)| (*name, convert_reading(raw, rain_collector_size, preferences)))
        .collect()
}

#[cfg(test)]
mod tests {
    use approx::assert_relative_eq;

    use super::*;

    fn number(measurement: &Measurement) -> f64 {
        measurement.value.as_ref().and_then(Value::as_f64).unwrap()
    }

    #[test]
    fn rain_clicks_depend_on_the_collector() {
        assert_relative_eq!(
            to_native(10, NativeUnit::RainClicks, RainCollectorSize::HundredthInch),
            2.54
        );
        assert_relative_eq!(
            to_native(10, NativeUnit::RainClicks, RainCollectorSize::FifthMillimeter),
            2.0
        );
        assert_relative_eq!(
            to_native(10, NativeUnit::RainClicks, RainCollectorSize::TenthMillimeter),
            1.0
        );
    }

    #[test]
    fn it_scales_native_units() {
        let size = RainCollectorSize::default();
        assert_relative_eq!(to_native(725, NativeUnit::TenthsFahrenheit, size), 72.5);
        assert_relative_eq!(to_native(-12, NativeUnit::TenthsFahrenheit, size), -1.2);
        assert_relative_eq!(to_native(160, NativeUnit::FahrenheitOffset90, size), 70.0);
        assert_relative_eq!(to_native(29921, NativeUnit::ThousandthsInHg, size), 29.921);
        assert_relative_eq!(to_native(4, NativeUnit::DirectionCode, size), 90.0);
        assert_relative_eq!(to_native(35, NativeUnit::TenthsUvIndex, size), 3.5);
        assert_relative_eq!(to_native(768, NativeUnit::ConsoleVoltage, size), 4.5);
    }

    #[test]
    fn it_converts_temperatures() {
        assert_relative_eq!(number(&convert(212.0, Quantity::Temperature, Unit::Celsius)), 100.0);
        assert_relative_eq!(
            number(&convert(32.0, Quantity::Temperature, Unit::Kelvin)),
            273.15
        );
        assert_relative_eq!(
            number(&convert(50.0, Quantity::Temperature, Unit::Fahrenheit)),
            50.0
        );
    }

    #[test]
    fn it_converts_speed_and_pressure() {
        assert_relative_eq!(
            number(&convert(10.0, Quantity::Speed, Unit::KilometersPerHour)),
            16.09344
        );
        assert_relative_eq!(number(&convert(10.0, Quantity::Speed, Unit::Beaufort)), 3.0);
        assert_relative_eq!(
            number(&convert(29.921, Quantity::Pressure, Unit::Hectopascal)),
            1013.24,
            epsilon = 0.01
        );
    }

    #[test]
    fn it_renders_compass_directions() {
        assert_eq!(
            convert(350.0, Quantity::Direction, Unit::Compass).value,
            Some(Value::Text("N".to_owned()))
        );
        assert_eq!(
            convert(22.5, Quantity::Direction, Unit::Compass).value,
            Some(Value::Text("NNE".to_owned()))
        );
    }

    #[test]
    fn unknown_units_are_left_unconverted() {
        let measurement = to_target_unit(72.5, Quantity::Temperature, "rankine");
        assert_eq!(measurement.unit, Unit::Fahrenheit);
        assert_relative_eq!(number(&measurement), 72.5);

        // a known unit, but for the wrong quantity
        let measurement = to_target_unit(5.0, Quantity::Humidity, "km/h");
        assert_eq!(measurement.unit, Unit::Percent);
        assert_relative_eq!(number(&measurement), 5.0);
    }

    #[test]
    fn it_converts_readings_into_all_units() {
        let mut preferences = UnitPreferences::new();
        preferences.set(Quantity::Rain, Unit::Inch);

        let reading = RawReading {
            value: Some(10),
            unit: NativeUnit::RainClicks,
        };
        let converted = convert_reading(&reading, RainCollectorSize::FifthMillimeter, &preferences);

        assert_eq!(converted.quantity, Quantity::Rain);
        assert_eq!(converted.native.unit, Unit::Millimeter);
        assert_relative_eq!(number(&converted.native), 2.0);
        assert_relative_eq!(number(&converted.metric), 2.0);
        assert_eq!(converted.user.unit, Unit::Inch);
        assert_relative_eq!(number(&converted.user), 2.0 / 25.4);
    }

    #[test]
    fn missing_readings_stay_missing() {
        let reading = RawReading {
            value: None,
            unit: NativeUnit::TenthsFahrenheit,
        };
        let converted = convert_reading(
            &reading,
            RainCollectorSize::default(),
            &UnitPreferences::default(),
        );
        assert_eq!(converted.native.value, None);
        assert_eq!(converted.metric.value, None);
        assert_eq!(converted.user.value, None);
        assert_eq!(converted.user.unit, Unit::Celsius);
    }

    #[test]
    fn missing_readings_fall_back_like_present_ones() {
        let mut preferences = UnitPreferences::new();
        preferences.set(Quantity::Humidity, Unit::KilometersPerHour);

        let present = RawReading {
            value: Some(55),
            unit: NativeUnit::Percent,
        };
        let missing = RawReading {
            value: None,
            ..present
        };

        let present = convert_reading(&present, RainCollectorSize::default(), &preferences);
        let missing = convert_reading(&missing, RainCollectorSize::default(), &preferences);
        assert_eq!(present.user.unit, Unit::Percent);
        assert_eq!(missing.user.unit, present.user.unit);
        assert_eq!(missing.user.value, None);
    }

    #[test]
    fn preferences_deserialize_from_json() {
        let preferences: UnitPreferences =
            serde_json::from_str(r#"{ "temperature": "°F", "speed": "m/s", "snow": "cm" }"#)
                .unwrap();
        assert_eq!(preferences.get(Quantity::Temperature), Some("°F"));
        assert_eq!(preferences.get(Quantity::Speed), Some("m/s"));
        assert_eq!(preferences.get(Quantity::Rain), None);
        preferences.warn_unknown();
    }
}
