//! Station configuration and tunables.

use std::{
    fmt::{
        self,
        Display,
    },
    io,
    path::{
        Path,
        PathBuf,
    },
    time::Duration,
};

use chrono::NaiveDateTime;
use serde::{
    Deserialize,
    Serialize,
};

/// Identifies a station, e.g. in lock markers and error messages.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct StationId(pub String);

impl Display for StationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for StationId {
    fn from(value: &str) -> Self {
        Self(value.to_owned())
    }
}

/// A station as known to the configuration layer.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationConfig {
    pub id: StationId,

    /// Host of the TCP-to-serial bridge.
    pub host: String,

    pub port: u16,

    #[serde(default)]
    pub rain_collector_size: RainCollectorSize,

    #[serde(default)]
    pub location: Location,

    /// IANA timezone name of the station.
    #[serde(default)]
    pub timezone: Option<String>,

    /// Offset of the console's clock from UTC.
    #[serde(default)]
    pub utc_offset_minutes: i32,

    #[serde(default)]
    pub state: StationState,
}

impl StationConfig {
    pub fn new(id: impl Into<String>, host: impl Into<String>, port: u16) -> Self {
        Self {
            id: StationId(id.into()),
            host: host.into(),
            port,
            rain_collector_size: Default::default(),
            location: Default::default(),
            timezone: None,
            utc_offset_minutes: 0,
            state: Default::default(),
        }
    }

    /// `host:port`, which is also the key of the connection registry.
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

/// Size of the rain collector's tipping bucket.
///
/// Stored as the console does in its setup bits: 0 = 0.01 in, 1 = 0.2 mm,
/// 2 = 0.1 mm.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum RainCollectorSize {
    #[default]
    HundredthInch,
    FifthMillimeter,
    TenthMillimeter,
}

impl RainCollectorSize {
    /// Millimeters of rain per bucket tip.
    pub fn millimeters_per_click(&self) -> f64 {
        match self {
            Self::HundredthInch => 0.254,
            Self::FifthMillimeter => 0.2,
            Self::TenthMillimeter => 0.1,
        }
    }
}

impl TryFrom<u8> for RainCollectorSize {
    type Error = InvalidRainCollectorSize;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::HundredthInch),
            1 => Ok(Self::FifthMillimeter),
            2 => Ok(Self::TenthMillimeter),
            _ => Err(InvalidRainCollectorSize(value)),
        }
    }
}

impl From<RainCollectorSize> for u8 {
    fn from(value: RainCollectorSize) -> Self {
        match value {
            RainCollectorSize::HundredthInch => 0,
            RainCollectorSize::FifthMillimeter => 1,
            RainCollectorSize::TenthMillimeter => 2,
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, thiserror::Error)]
#[error("invalid rain collector size: {0}")]
pub struct InvalidRainCollectorSize(pub u8);

#[derive(Clone, Copy, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct Location {
    /// Degrees, north positive.
    pub latitude: f64,

    /// Degrees, east positive.
    pub longitude: f64,

    /// Feet above sea level.
    pub altitude: i32,
}

/// Mutable state, updated after successful exchanges.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StationState {
    /// Console-local time of the newest archive record downloaded.
    #[serde(default)]
    pub last_archive_date: Option<NaiveDateTime>,

    /// Console clock minus station-local time, as of the last check.
    #[serde(default)]
    pub delta_time_seconds: Option<i64>,
}

/// A JSON file holding all stations.
#[derive(Clone, Debug)]
pub struct StationsFile {
    path: PathBuf,
}

impl StationsFile {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Vec<StationConfig>, io::Error> {
        let data = std::fs::read(&self.path)?;
        Ok(serde_json::from_slice(&data)?)
    }

    pub fn find(&self, id: &StationId) -> Result<Option<StationConfig>, io::Error> {
        Ok(self.load()?.into_iter().find(|station| &station.id == id))
    }

    /// Replaces the station with the same id, or appends it.
    ///
    /// The file is written to a sibling and renamed over it.
    pub fn persist(&self, station: &StationConfig) -> Result<(), io::Error> {
        let mut stations = match self.load() {
            Ok(stations) => stations,
            Err(error) if error.kind() == io::ErrorKind::NotFound => vec![],
            Err(error) => return Err(error),
        };

        if let Some(existing) = stations.iter_mut().find(|s| s.id == station.id) {
            *existing = station.clone();
        }
        else {
            stations.push(station.clone());
        }

        let data = serde_json::to_vec_pretty(&stations)?;
        let temporary = self.path.with_extension("json.tmp");
        std::fs::write(&temporary, data)?;
        std::fs::rename(&temporary, &self.path)?;

        tracing::debug!(station = %station.id, path = %self.path.display(), "persisted station");

        Ok(())
    }
}

/// Timing and retry parameters.
#[derive(Clone, Debug)]
pub struct Options {
    pub connect_timeout: Duration,

    /// A connection without traffic for this long is closed, which also
    /// releases the station lock.
    pub idle_timeout: Duration,

    /// Pause before every command. The console needs some time between
    /// commands.
    pub command_spacing: Duration,

    /// How often a command is sent when its answer fails the CRC check.
    pub crc_attempts: usize,

    /// Locks not touched for this long are free.
    pub lock_horizon: Duration,

    pub lock_attempts: usize,

    pub lock_retry_interval: Duration,

    pub probe_timeout: Duration,

    pub wake_up_timeout: Duration,

    pub wake_up_attempts: usize,

    pub wake_up_pause: Duration,

    /// Timeout for ordinary commands.
    pub command_timeout: Duration,

    /// Timeout for a single archive page.
    pub page_timeout: Duration,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(2),
            idle_timeout: Duration::from_millis(1500),
            command_spacing: Duration::from_millis(200),
            crc_attempts: 2,
            lock_horizon: Duration::from_millis(4500),
            lock_attempts: 3,
            lock_retry_interval: Duration::from_secs(1),
            probe_timeout: Duration::from_secs(1),
            wake_up_timeout: Duration::from_millis(1200),
            wake_up_attempts: 3,
            wake_up_pause: Duration::from_millis(500),
            command_timeout: Duration::from_secs(1),
            page_timeout: Duration::from_secs(2),
        }
    }
}
