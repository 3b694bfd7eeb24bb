//! Per-station locks.
//!
//! A console only handles one command session at a time. Before a connection
//! is opened the station is locked; the lock is touched on every write and
//! periodically while the connection is open, and released when the connection is torn down. A lock
//! that wasn't touched within the staleness horizon is considered free, so a
//! crashed holder doesn't block the station forever.
//!
//! Before waiting for a lock, the host is probed. An unreachable host fails
//! immediately instead of waiting for a lock that nobody will release.
//!
//! [`LockStore`]s are synchronous and may block (e.g. on file I/O), so the
//! async operations run them with [`tokio::task::spawn_blocking`].

use std::{
    collections::HashMap,
    fmt::Debug,
    io,
    path::PathBuf,
    process::Stdio,
    sync::Arc,
    time::{
        Duration,
        SystemTime,
    },
};

use futures_util::future::BoxFuture;
use parking_lot::Mutex;
use tokio::{
    net::TcpStream,
    process::Command,
    sync::Notify,
};

use crate::{
    Error,
    config::{
        Options,
        StationConfig,
        StationId,
    },
};

/// Storage for lock markers.
pub trait LockStore: Debug + Send + Sync {
    /// When the station's marker was last touched, if there is one.
    fn touched_at(&self, station: &StationId) -> Result<Option<SystemTime>, io::Error>;

    /// Creates or refreshes the marker.
    fn touch(&self, station: &StationId) -> Result<(), io::Error>;

    /// Removes the marker. Removing a missing marker is not an error.
    fn remove(&self, station: &StationId) -> Result<(), io::Error>;
}

/// Lock markers that live in this process only.
#[derive(Debug, Default)]
pub struct MemoryLockStore {
    markers: Mutex<HashMap<StationId, SystemTime>>,
}

impl MemoryLockStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets a marker with an explicit timestamp.
    pub fn touch_at(&self, station: &StationId, time: SystemTime) {
        self.markers.lock().insert(station.clone(), time);
    }
}

impl LockStore for MemoryLockStore {
    fn touched_at(&self, station: &StationId) -> Result<Option<SystemTime>, io::Error> {
        Ok(self.markers.lock().get(station).copied())
    }

    fn touch(&self, station: &StationId) -> Result<(), io::Error> {
        self.touch_at(station, SystemTime::now());
        Ok(())
    }

    fn remove(&self, station: &StationId) -> Result<(), io::Error> {
        self.markers.lock().remove(station);
        Ok(())
    }
}

/// One marker file per station, using its modification time.
///
/// This lets separate processes (e.g. a web server and a collector job) share
/// the locks.
#[derive(Clone, Debug)]
pub struct FileLockStore {
    directory: PathBuf,
}

impl FileLockStore {
    pub fn new(directory: impl Into<PathBuf>) -> Self {
        Self {
            directory: directory.into(),
        }
    }

    fn path(&self, station: &StationId) -> PathBuf {
        self.directory.join(format!("{station}.lock"))
    }
}

impl LockStore for FileLockStore {
    fn touched_at(&self, station: &StationId) -> Result<Option<SystemTime>, io::Error> {
        match std::fs::metadata(self.path(station)) {
            Ok(metadata) => Ok(Some(metadata.modified()?)),
            Err(error) if error.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(error) => Err(error),
        }
    }

    fn touch(&self, station: &StationId) -> Result<(), io::Error> {
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(self.path(station))?;
        file.set_modified(SystemTime::now())
    }

    fn remove(&self, station: &StationId) -> Result<(), io::Error> {
        match std::fs::remove_file(self.path(station)) {
            Err(error) if error.kind() != io::ErrorKind::NotFound => Err(error),
            _ => Ok(()),
        }
    }
}

/// Checks whether a host is up.
pub trait Probe: Debug + Send + Sync {
    fn is_reachable<'a>(&'a self, host: &'a str, port: u16, timeout: Duration)
    -> BoxFuture<'a, bool>;
}

/// Probes by opening (and immediately closing) a TCP connection.
#[derive(Clone, Copy, Debug, Default)]
pub struct TcpProbe;

impl Probe for TcpProbe {
    fn is_reachable<'a>(
        &'a self,
        host: &'a str,
        port: u16,
        timeout: Duration,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            matches!(
                tokio::time::timeout(timeout, TcpStream::connect((host, port))).await,
                Ok(Ok(_))
            )
        })
    }
}

/// Probes with the system's `ping` command (one ICMP echo).
#[derive(Clone, Debug)]
pub struct PingProbe {
    program: String,
}

impl PingProbe {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }
}

impl Default for PingProbe {
    fn default() -> Self {
        Self::new("ping")
    }
}

impl Probe for PingProbe {
    fn is_reachable<'a>(
        &'a self,
        host: &'a str,
        _port: u16,
        timeout: Duration,
    ) -> BoxFuture<'a, bool> {
        Box::pin(async move {
            let wait_seconds = timeout.as_secs_f64().ceil().max(1.0) as u64;

            let status = Command::new(&self.program)
                .args(["-c", "1", "-W", &wait_seconds.to_string(), host])
                .stdin(Stdio::null())
                .stdout(Stdio::null())
                .stderr(Stdio::null())
                .kill_on_drop(true)
                .status();

            // ping's own deadline is in whole seconds, so give it a bit of slack
            match tokio::time::timeout(timeout + Duration::from_millis(500), status).await {
                Ok(Ok(status)) => status.success(),
                Ok(Err(error)) => {
                    tracing::warn!(?error, program = %self.program, "failed to run ping");
                    false
                }
                Err(_) => false,
            }
        })
    }
}

/// Grants one holder at a time per station.
#[derive(Debug)]
pub struct StationLocks {
    store: Arc<dyn LockStore>,
    probe: Arc<dyn Probe>,
    released: Notify,
    // serializes check-and-stamp within this process
    guard: tokio::sync::Mutex<()>,
    horizon: Duration,
    attempts: usize,
    retry_interval: Duration,
    probe_timeout: Duration,
}

impl StationLocks {
    pub fn new(store: Arc<dyn LockStore>, probe: Arc<dyn Probe>, options: &Options) -> Self {
        Self {
            store,
            probe,
            released: Notify::new(),
            guard: tokio::sync::Mutex::new(()),
            horizon: options.lock_horizon,
            attempts: options.lock_attempts.max(1),
            retry_interval: options.lock_retry_interval,
            probe_timeout: options.probe_timeout,
        }
    }

    /// In-process locks with a TCP probe.
    pub fn in_memory(options: &Options) -> Self {
        Self::new(Arc::new(MemoryLockStore::new()), Arc::new(TcpProbe), options)
    }

    /// Locks a station.
    ///
    /// Fails with [`Error::HostUnreachable`] if the probe fails, without
    /// looking at the lock. Otherwise the lock is checked up to
    /// `lock_attempts` times. Between checks this waits for a release or the
    /// retry interval, whichever comes first.
    pub async fn acquire(&self, station: &StationConfig) -> Result<(), Error> {
        if !self
            .probe
            .is_reachable(&station.host, station.port, self.probe_timeout)
            .await
        {
            tracing::debug!(station = %station.id, host = %station.host, "host unreachable");
            return Err(Error::HostUnreachable {
                station: station.id.clone(),
                host: station.host.clone(),
            });
        }

        for attempt in 1..=self.attempts {
            // registered before checking, so a release in between isn't missed
            let released = self.released.notified();

            if self.try_take(&station.id).await? {
                tracing::debug!(station = %station.id, attempt, "lock acquired");
                return Ok(());
            }

            tracing::debug!(station = %station.id, attempt, "station is locked");

            if attempt < self.attempts {
                tokio::select! {
                    _ = released => {},
                    _ = tokio::time::sleep(self.retry_interval) => {},
                }
            }
        }

        Err(Error::LockBusy {
            station: station.id.clone(),
        })
    }

    /// How long a lock stays fresh without being touched.
    pub fn horizon(&self) -> Duration {
        self.horizon
    }

    /// Refreshes the lock, keeping it from going stale.
    pub async fn touch(&self, station: &StationId) -> Result<(), Error> {
        let store = self.store.clone();
        self.blocking(station, move |station| store.touch(station))
            .await
    }

    /// Releases the lock. Releasing a free lock is a no-op.
    pub fn release(&self, station: &StationId) -> Result<(), Error> {
        self.store
            .remove(station)
            .map_err(|source| Error::lock_store(station, source))?;
        tracing::debug!(%station, "lock released");
        self.released.notify_waiters();
        Ok(())
    }

    pub fn is_free(&self, station: &StationId) -> Result<bool, Error> {
        is_free(self.store.as_ref(), station, self.horizon)
            .map_err(|source| Error::lock_store(station, source))
    }

    async fn try_take(&self, station: &StationId) -> Result<bool, Error> {
        let _guard = self.guard.lock().await;

        let store = self.store.clone();
        let horizon = self.horizon;
        self.blocking(station, move |station| {
            if is_free(store.as_ref(), station, horizon)? {
                store.touch(station)?;
                Ok(true)
            }
            else {
                Ok(false)
            }
        })
        .await
    }

    async fn blocking<T, F>(&self, station: &StationId, f: F) -> Result<T, Error>
    where
        F: FnOnce(&StationId) -> Result<T, io::Error> + Send + 'static,
        T: Send + 'static,
    {
        let owned = station.clone();
        tokio::task::spawn_blocking(move || f(&owned))
            .await
            .map_err(io::Error::other)
            .and_then(|result| result)
            .map_err(|source| Error::lock_store(station, source))
    }
}

fn is_free(store: &dyn LockStore, station: &StationId, horizon: Duration) -> Result<bool, io::Error> {
    Ok(store.touched_at(station)?.is_none_or(|touched_at| {
        // a timestamp in the future means someone else's clock is ahead, so it's fresh
        touched_at
            .elapsed()
            .is_ok_and(|elapsed| elapsed > horizon)
    }))
}
