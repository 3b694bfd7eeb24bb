use std::{
    path::PathBuf,
    sync::Arc,
    time::Duration,
};

use clap::{
    Parser,
    Subcommand,
    ValueEnum,
};
use color_eyre::eyre::{
    Error,
    OptionExt,
};
use serde_json::json;
use vantage_async::{
    Options,
    StationConfig,
    StationId,
    Vantage,
    config::StationsFile,
    console::station_now,
    lock::{
        FileLockStore,
        LockStore,
        MemoryLockStore,
        PingProbe,
        Probe,
        StationLocks,
        TcpProbe,
    },
    packet::Readings,
    units::{
        UnitPreferences,
        convert_packet,
    },
};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let _ = dotenvy::dotenv();
    color_eyre::install()?;
    tracing_subscriber::fmt::init();

    let args = Args::parse();

    let stations = StationsFile::new(&args.stations);
    let mut station = stations
        .find(&StationId(args.station.clone()))?
        .ok_or_eyre(format!("station not found: {}", args.station))?;
    tracing::debug!(station = %station.id, address = %station.address(), "loaded station");

    let preferences = match &args.units {
        Some(path) => {
            let preferences: UnitPreferences = serde_json::from_slice(&std::fs::read(path)?)?;
            preferences.warn_unknown();
            preferences
        }
        None => UnitPreferences::default(),
    };

    let options = Options {
        command_timeout: args.command_timeout,
        idle_timeout: args.idle_timeout,
        ..Default::default()
    };
    let store: Arc<dyn LockStore> = match &args.lock_directory {
        Some(directory) => Arc::new(FileLockStore::new(directory)),
        None => Arc::new(MemoryLockStore::new()),
    };
    let probe: Arc<dyn Probe> = if args.ping {
        Arc::new(PingProbe::new("ping"))
    }
    else {
        Arc::new(TcpProbe)
    };
    let vantage = Vantage::new(
        options.clone(),
        Arc::new(StationLocks::new(store, probe, &options)),
    );

    let result = run(&vantage, args.command, &mut station, &stations, &preferences).await;
    vantage.shutdown().await;

    println!("{}", serde_json::to_string_pretty(&result?)?);

    Ok(())
}

async fn run(
    vantage: &Vantage,
    command: Command,
    station: &mut StationConfig,
    stations: &StationsFile,
    preferences: &UnitPreferences,
) -> Result<serde_json::Value, Error> {
    let output = match command {
        Command::Wake => {
            vantage.wake_up(station).await?;
            json!({ "awake": true })
        }
        Command::Time { sync } => {
            if sync {
                let delta = vantage
                    .sync_time(station, |station| stations.persist(station))
                    .await?;
                json!({ "deltaSeconds": delta, "synchronized": true })
            }
            else {
                let time = vantage.get_time(station).await?;
                let delta = (time - station_now(station)).num_seconds();
                json!({ "consoleTime": time, "deltaSeconds": delta })
            }
        }
        Command::Loop => {
            let readings = vantage.read_loop(station).await?;
            converted(&readings, station, preferences)?
        }
        Command::Loop2 => {
            let readings = vantage.read_loop2(station).await?;
            converted(&readings, station, preferences)?
        }
        Command::Archive => {
            let records = vantage
                .download_archive(station, |station| stations.persist(station))
                .await?;
            let records = records
                .iter()
                .map(|record| {
                    Ok(json!({
                        "timestamp": record.timestamp,
                        "readings": converted(&record.readings, station, preferences)?,
                    }))
                })
                .collect::<Result<Vec<_>, Error>>()?;
            json!({
                "records": records,
                "lastArchiveDate": station.state.last_archive_date,
            })
        }
        Command::Setup => serde_json::to_value(vantage.read_setup(station).await?)?,
        Command::Lamps { state } => {
            vantage.lamps(station, state == LampState::On).await?;
            json!({ "lamps": state })
        }
    };

    Ok(output)
}

fn converted(
    readings: &Readings,
    station: &StationConfig,
    preferences: &UnitPreferences,
) -> Result<serde_json::Value, Error> {
    Ok(serde_json::to_value(convert_packet(
        readings,
        station.rain_collector_size,
        preferences,
    ))?)
}

#[derive(Debug, Parser)]
struct Args {
    /// JSON file with the station configurations
    #[clap(long, env = "VANTAGE_STATIONS", default_value = "stations.json")]
    stations: PathBuf,

    /// Id of the station to talk to
    #[clap(short, long, env = "VANTAGE_STATION")]
    station: String,

    /// Directory for lock files. Without this, locks are only held within
    /// this process.
    #[clap(long, env = "VANTAGE_LOCK_DIRECTORY")]
    lock_directory: Option<PathBuf>,

    /// Check if the host is up with ping instead of a TCP connect
    #[clap(long)]
    ping: bool,

    /// JSON file mapping quantities to units, e.g. `{"temperature": "°C"}`
    #[clap(long, env = "VANTAGE_UNITS")]
    units: Option<PathBuf>,

    #[clap(long, value_parser = humantime::parse_duration, default_value = "1s")]
    command_timeout: Duration,

    /// Close the connection after this long without traffic
    #[clap(long, value_parser = humantime::parse_duration, default_value = "1500ms")]
    idle_timeout: Duration,

    #[clap(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Wake up the console
    Wake,

    /// Show the console's clock
    Time {
        /// Set the clock to station time
        #[clap(long)]
        sync: bool,
    },

    /// Read a LOOP packet
    Loop,

    /// Read a LOOP2 packet
    Loop2,

    /// Download new archive records
    Archive,

    /// Show the console's setup
    Setup,

    /// Turn the backlight on or off
    Lamps { state: LampState },
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum, serde::Serialize)]
#[serde(rename_all = "lowercase")]
enum LampState {
    On,
    Off,
}
