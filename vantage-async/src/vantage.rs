use std::{
    sync::Arc,
    time::Duration,
};

use bytes::Bytes;

use crate::{
    Error,
    answer::AnswerFormat,
    archive,
    command::Command,
    config::{
        Options,
        StationConfig,
    },
    connection::{
        Connection,
        Connections,
    },
    console,
    eeprom::{
        self,
        ConsoleSetup,
    },
    lock::StationLocks,
    packet::{
        Readings,
        archive::ArchiveRecord,
    },
    wake,
};

/// Talks to any number of stations.
///
/// Keeps one connection per station, which is opened on first use and
/// closed when idle. Opening a connection locks the station, closing it
/// releases the lock.
#[derive(Debug)]
pub struct Vantage {
    connections: Arc<Connections>,
    locks: Arc<StationLocks>,
    options: Options,
}

impl Vantage {
    pub fn new(options: Options, locks: Arc<StationLocks>) -> Self {
        Self {
            connections: Arc::new(Connections::default()),
            locks,
            options,
        }
    }

    /// Uses in-process locks.
    pub fn in_memory(options: Options) -> Self {
        let locks = Arc::new(StationLocks::in_memory(&options));
        Self::new(options, locks)
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn locks(&self) -> &Arc<StationLocks> {
        &self.locks
    }

    /// Returns the open connection to the station, or opens one.
    pub async fn connect(&self, station: &StationConfig) -> Result<Arc<Connection>, Error> {
        self.connections
            .get_or_connect(station, &self.locks, &self.options)
            .await
    }

    /// Sends a single command. `format` is compiled for this call.
    pub async fn send_command(
        &self,
        station: &StationConfig,
        command: &Command,
        timeout: Duration,
        format: &str,
    ) -> Result<Bytes, Error> {
        let format = AnswerFormat::compile(format)?;
        let connection = self.connect(station).await?;
        connection.send_command(command, timeout, &format).await
    }

    /// Wakes the console up.
    pub async fn wake_up(&self, station: &StationConfig) -> Result<(), Error> {
        self.awake(station).await?;
        Ok(())
    }

    async fn awake(&self, station: &StationConfig) -> Result<Arc<Connection>, Error> {
        let connection = self.connect(station).await?;
        wake::wake_up(&connection).await?;
        Ok(connection)
    }

    /// Downloads all new archive records.
    ///
    /// The station's `last_archive_date` is updated and passed to `persist`
    /// before this returns, while the station is still locked.
    pub async fn download_archive<F, E>(
        &self,
        station: &mut StationConfig,
        persist: F,
    ) -> Result<Vec<ArchiveRecord>, Error>
    where
        F: FnOnce(&StationConfig) -> Result<(), E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let connection = self.awake(station).await?;
        let records = archive::download_archive(&connection, station).await?;

        if !records.is_empty() {
            persist_state(station, persist)?;
        }

        Ok(records)
    }

    pub async fn read_loop(&self, station: &StationConfig) -> Result<Readings, Error> {
        let connection = self.awake(station).await?;
        console::read_loop(&connection).await
    }

    pub async fn read_loop2(&self, station: &StationConfig) -> Result<Readings, Error> {
        let connection = self.awake(station).await?;
        console::read_loop2(&connection).await
    }

    pub async fn get_time(&self, station: &StationConfig) -> Result<chrono::NaiveDateTime, Error> {
        let connection = self.awake(station).await?;
        console::get_time(&connection).await
    }

    /// Measures the clock drift, stores it in the station state and sets the
    /// console's clock. `persist` is called with the updated station.
    pub async fn sync_time<F, E>(&self, station: &mut StationConfig, persist: F) -> Result<i64, Error>
    where
        F: FnOnce(&StationConfig) -> Result<(), E>,
        E: std::error::Error + Send + Sync + 'static,
    {
        let connection = self.awake(station).await?;
        let delta = console::sync_time(&connection, station).await?;
        persist_state(station, persist)?;
        Ok(delta)
    }

    pub async fn read_setup(&self, station: &StationConfig) -> Result<ConsoleSetup, Error> {
        let connection = self.awake(station).await?;
        eeprom::read_setup(&connection).await
    }

    pub async fn lamps(&self, station: &StationConfig, on: bool) -> Result<(), Error> {
        let connection = self.awake(station).await?;
        wake::lamps(&connection, on).await
    }

    /// Closes all connections, releasing their locks.
    pub async fn shutdown(&self) {
        tracing::debug!(connections = self.connections.len(), "shutting down");
        self.connections.close_all().await;
    }
}

fn persist_state<F, E>(station: &StationConfig, persist: F) -> Result<(), Error>
where
    F: FnOnce(&StationConfig) -> Result<(), E>,
    E: std::error::Error + Send + Sync + 'static,
{
    persist(station).map_err(|error| {
        Error::Persist {
            station: station.id.clone(),
            source: Box::new(error),
        }
    })
}
