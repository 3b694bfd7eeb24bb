//! TCP connections to consoles.
//!
//! Each connection spawns a reader task that pushes received chunks into a
//! channel. A command drains the channel until its [`AnswerFormat`] is
//! satisfied or its timeout fires.
//!
//! The reader task owns the teardown: when the socket is closed by the peer,
//! fails, idles for too long, or the connection is closed explicitly, the
//! connection is removed from the registry, pending commands fail with
//! [`Error::ConnectionClosed`] and the station lock is released.

use std::{
    collections::HashMap,
    io,
    net::SocketAddr,
    sync::{
        Arc,
        Weak,
        atomic::{
            AtomicBool,
            AtomicU64,
            Ordering,
        },
    },
    time::Duration,
};

use bytes::{
    Bytes,
    BytesMut,
};
use parking_lot::Mutex;
use tokio::{
    io::{
        AsyncReadExt,
        AsyncWriteExt,
    },
    net::{
        TcpSocket,
        TcpStream,
        tcp::{
            OwnedReadHalf,
            OwnedWriteHalf,
        },
    },
    sync::mpsc,
    task::JoinHandle,
    time::Instant,
};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

use crate::{
    Error,
    answer::{
        AnswerFormat,
        FrameError,
    },
    command::Command,
    config::{
        Options,
        StationConfig,
        StationId,
    },
    lock::StationLocks,
};

/// size of the read buffer: 1 KiB, an archive page is 267 bytes
const READ_BUFFER_SIZE: usize = 0x400;

/// An open connection to a console.
#[derive(Debug)]
pub struct Connection {
    station: StationId,
    address: String,
    io: tokio::sync::Mutex<CommandIo>,
    activity: Arc<Activity>,
    closed: CancellationToken,
    reader: Mutex<Option<JoinHandle<()>>>,
    locks: Arc<StationLocks>,
    options: Options,
}

/// The halves a command needs exclusively.
#[derive(Debug)]
struct CommandIo {
    writer: OwnedWriteHalf,
    chunks: mpsc::UnboundedReceiver<Bytes>,
}

impl Connection {
    /// Opens a TCP connection to the station and spawns its reader task.
    ///
    /// The caller must hold the station lock. It's released when the
    /// connection is torn down, at which point `on_teardown` is called too.
    pub(crate) async fn open<F>(
        station: &StationConfig,
        locks: Arc<StationLocks>,
        options: &Options,
        on_teardown: F,
    ) -> Result<Arc<Self>, Error>
    where
        F: FnOnce() + Send + 'static,
    {
        let address = station.address();

        let stream = match tokio::time::timeout(options.connect_timeout, connect(&address)).await
        {
            Ok(Ok(stream)) => stream,
            Ok(Err(source)) => {
                return Err(Error::ConnectError {
                    station: station.id.clone(),
                    address,
                    source,
                });
            }
            Err(_) => {
                return Err(Error::ConnectTimeout {
                    station: station.id.clone(),
                    address,
                });
            }
        };

        tracing::debug!(station = %station.id, %address, "connected");

        let (reader, writer) = stream.into_split();
        let (chunk_sender, chunk_receiver) = mpsc::unbounded_channel();
        let activity = Arc::new(Activity::new());
        let closed = CancellationToken::new();

        let teardown = Teardown {
            station: station.id.clone(),
            locks: locks.clone(),
            closed: closed.clone(),
            on_teardown: Some(Box::new(on_teardown)),
        };

        let span = tracing::info_span!("connection", station = %station.id, %address);
        let handle = tokio::spawn(
            read_chunks(
                reader,
                chunk_sender,
                activity.clone(),
                options.idle_timeout,
                closed.clone(),
                teardown,
            )
            .instrument(span),
        );

        Ok(Arc::new(Self {
            station: station.id.clone(),
            address,
            io: tokio::sync::Mutex::new(CommandIo {
                writer,
                chunks: chunk_receiver,
            }),
            activity,
            closed,
            reader: Mutex::new(Some(handle)),
            locks,
            options: options.clone(),
        }))
    }

    pub fn station(&self) -> &StationId {
        &self.station
    }

    pub fn address(&self) -> &str {
        &self.address
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    pub fn is_closed(&self) -> bool {
        self.closed.is_cancelled()
    }

    /// Closes the connection and waits until the teardown (including lock
    /// release) is done.
    pub async fn close(&self) {
        self.closed.cancel();
        let handle = self.reader.lock().take();
        if let Some(handle) = handle {
            if let Err(error) = handle.await {
                tracing::error!(station = %self.station, ?error, "reader task failed");
            }
        }
    }

    /// Sends a command and waits for its answer.
    ///
    /// Returns the payload, i.e. the data bytes of the answer. Answers that
    /// fail the CRC check are requested again by resending the same command,
    /// up to `crc_attempts` times in total. Other errors are returned
    /// immediately.
    ///
    /// Only one command can be in progress per connection. A concurrent call
    /// fails with [`Error::CommandInProgress`].
    pub async fn send_command(
        &self,
        command: &Command,
        timeout: Duration,
        format: &AnswerFormat,
    ) -> Result<Bytes, Error> {
        self.send_command_with_retry(command, command, timeout, format)
            .await
    }

    /// Like [`send_command`](Self::send_command), but sends `retry` instead
    /// of `command` after a CRC error.
    pub async fn send_command_with_retry(
        &self,
        command: &Command,
        retry: &Command,
        timeout: Duration,
        format: &AnswerFormat,
    ) -> Result<Bytes, Error> {
        let mut io = self.io.try_lock().map_err(|_| {
            Error::CommandInProgress {
                station: self.station.clone(),
            }
        })?;

        if self.is_closed() {
            return Err(Error::ConnectionClosed {
                station: self.station.clone(),
            });
        }

        let _busy = self.activity.busy();
        let attempts = self.options.crc_attempts.max(1);
        let mut current = command;

        for attempt in 1..=attempts {
            match self
                .exchange(&mut io, current, timeout, format, attempt)
                .await
            {
                Ok(payload) => return Ok(payload),
                Err(error) if error.is_crc_error() && attempt < attempts => {
                    tracing::warn!(station = %self.station, %command, attempt, %error, "retrying");
                    current = retry;
                }
                Err(error) => return Err(error),
            }
        }

        unreachable!("the last attempt always returns");
    }

    async fn exchange(
        &self,
        io: &mut CommandIo,
        command: &Command,
        timeout: Duration,
        format: &AnswerFormat,
        attempt: usize,
    ) -> Result<Bytes, Error> {
        tokio::time::sleep(self.options.command_spacing).await;

        // whatever arrived since the last command (e.g. a late answer after a timeout) would
        // shift this answer.
        while let Ok(chunk) = io.chunks.try_recv() {
            tracing::debug!(station = %self.station, data = hex::encode(&chunk), "discarding stale data");
        }

        let mut output = BytesMut::with_capacity(command.encoded_len());
        command.encode(&mut output);
        io.writer.write_all(&output).await?;
        io.writer.flush().await?;
        self.locks.touch(&self.station).await?;
        tracing::debug!(station = %self.station, %command, %format, attempt, "sent command");

        let deadline = Instant::now() + timeout;
        let expected = format.total_length();
        let mut buffer = BytesMut::with_capacity(expected.min(READ_BUFFER_SIZE));

        while buffer.len() < expected {
            match tokio::time::timeout_at(deadline, io.chunks.recv()).await {
                Ok(Some(chunk)) => buffer.extend_from_slice(&chunk),
                Ok(None) => {
                    return Err(Error::ConnectionClosed {
                        station: self.station.clone(),
                    });
                }
                Err(_) => {
                    return Err(Error::CommandTimeout {
                        station: self.station.clone(),
                        command: command.to_string(),
                        expected,
                        received: buffer.len(),
                        partial: hex::encode(&buffer),
                    });
                }
            }
        }

        if buffer.len() > expected {
            tracing::debug!(
                station = %self.station,
                extra = hex::encode(&buffer[expected..]),
                "ignoring bytes after answer"
            );
        }

        format
            .validate(&buffer)
            .map_err(|error| self.frame_error(command, attempt, error))
    }

    fn frame_error(&self, command: &Command, attempt: usize, error: FrameError) -> Error {
        let station = self.station.clone();
        let command = command.to_string();

        match error {
            FrameError::Incomplete { expected, received } => {
                Error::CommandTimeout {
                    station,
                    command,
                    expected,
                    received,
                    partial: String::new(),
                }
            }
            FrameError::Mismatch {
                offset,
                expected,
                actual,
            } => {
                Error::ProtocolMismatch {
                    station,
                    command,
                    offset,
                    expected: hex::encode(expected),
                    actual: hex::encode(actual),
                }
            }
            FrameError::Crc {
                received,
                calculated,
            } => {
                Error::Crc {
                    station,
                    command,
                    attempts: attempt,
                    received,
                    calculated,
                }
            }
        }
    }
}

async fn connect(address: &str) -> Result<TcpStream, io::Error> {
    let mut last_error = None;

    for address in tokio::net::lookup_host(address).await? {
        match connect_keepalive(address).await {
            Ok(stream) => return Ok(stream),
            Err(error) => last_error = Some(error),
        }
    }

    Err(last_error.unwrap_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses")
    }))
}

async fn connect_keepalive(address: SocketAddr) -> Result<TcpStream, io::Error> {
    let socket = if address.is_ipv4() {
        TcpSocket::new_v4()?
    }
    else {
        TcpSocket::new_v6()?
    };
    socket.set_keepalive(true)?;
    let stream = socket.connect(address).await?;
    stream.set_nodelay(true)?;
    Ok(stream)
}

/// Tracks traffic, so idle connections can be closed.
#[derive(Debug)]
struct Activity {
    last: Mutex<Instant>,
    busy: AtomicBool,
}

impl Activity {
    fn new() -> Self {
        Self {
            last: Mutex::new(Instant::now()),
            busy: AtomicBool::new(false),
        }
    }

    fn touch(&self) {
        *self.last.lock() = Instant::now();
    }

    fn busy(&self) -> BusyGuard<'_> {
        self.busy.store(true, Ordering::SeqCst);
        BusyGuard { activity: self }
    }

    /// When the connection counts as idle, given no further traffic. A
    /// connection with a command in progress is never idle.
    fn idle_deadline(&self, idle_timeout: Duration) -> Instant {
        if self.busy.load(Ordering::SeqCst) {
            Instant::now() + idle_timeout
        }
        else {
            *self.last.lock() + idle_timeout
        }
    }

    fn is_idle(&self, idle_timeout: Duration) -> bool {
        self.idle_deadline(idle_timeout) <= Instant::now()
    }
}

struct BusyGuard<'a> {
    activity: &'a Activity,
}

impl Drop for BusyGuard<'_> {
    fn drop(&mut self) {
        self.activity.touch();
        self.activity.busy.store(false, Ordering::SeqCst);
    }
}

/// Runs when the reader task ends, however it ends.
///
/// While the connection lives, the station lock is touched at half its
/// staleness horizon, so a long command doesn't let it go stale.
struct Teardown {
    station: StationId,
    locks: Arc<StationLocks>,
    closed: CancellationToken,
    on_teardown: Option<Box<dyn FnOnce() + Send>>,
}

impl Teardown {
    fn heartbeat(&self) -> tokio::time::Interval {
        let period = (self.locks.horizon() / 2).max(Duration::from_millis(1));
        let mut interval = tokio::time::interval_at(Instant::now() + period, period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        interval
    }
}

impl Drop for Teardown {
    fn drop(&mut self) {
        tracing::debug!(station = %self.station, "tearing down connection");

        self.closed.cancel();

        if let Some(on_teardown) = self.on_teardown.take() {
            on_teardown();
        }

        if let Err(error) = self.locks.release(&self.station) {
            tracing::error!(station = %self.station, %error, "failed to release lock");
        }
    }
}

async fn read_chunks(
    mut reader: OwnedReadHalf,
    chunk_sender: mpsc::UnboundedSender<Bytes>,
    activity: Arc<Activity>,
    idle_timeout: Duration,
    closed: CancellationToken,
    teardown: Teardown,
) {
    let mut heartbeat = teardown.heartbeat();
    let locks = teardown.locks.clone();
    let station = teardown.station.clone();

    loop {
        let idle_deadline = activity.idle_deadline(idle_timeout);
        let mut buffer = BytesMut::with_capacity(READ_BUFFER_SIZE);

        tokio::select! {
            _ = closed.cancelled() => {
                tracing::debug!("connection closed");
                break;
            }
            _ = heartbeat.tick() => {
                if let Err(error) = locks.touch(&station).await {
                    tracing::warn!(%error, "failed to refresh lock");
                }
            }
            _ = tokio::time::sleep_until(idle_deadline) => {
                if activity.is_idle(idle_timeout) {
                    tracing::debug!("connection idle");
                    break;
                }
            }
            result = reader.read_buf(&mut buffer) => {
                match result {
                    Ok(0) => {
                        tracing::debug!("connection closed by peer");
                        break;
                    }
                    Ok(_) => {
                        activity.touch();
                        tracing::trace!(data = hex::encode(&buffer), "received");
                        if chunk_sender.send(buffer.freeze()).is_err() {
                            break;
                        }
                    }
                    Err(error) => {
                        tracing::warn!(%error, "connection error");
                        break;
                    }
                }
            }
        }
    }

    // closing the channel fails a pending command
    drop(chunk_sender);
    drop(teardown);
}

/// All open connections, keyed by `host:port`.
#[derive(Debug, Default)]
pub(crate) struct Connections {
    live: Mutex<HashMap<String, (u64, Arc<Connection>)>>,
    connecting: Mutex<HashMap<String, Arc<tokio::sync::Mutex<()>>>>,
    next_id: AtomicU64,
}

impl Connections {
    /// Returns the open connection to the station, or locks the station and
    /// opens a new one.
    pub async fn get_or_connect(
        self: &Arc<Self>,
        station: &StationConfig,
        locks: &Arc<StationLocks>,
        options: &Options,
    ) -> Result<Arc<Connection>, Error> {
        let key = station.address();

        if let Some(connection) = self.get(&key) {
            return Ok(connection);
        }

        // only one caller connects to a station at a time
        let gate = ConnectGate {
            connections: self,
            key: key.clone(),
            gate: self.connecting.lock().entry(key.clone()).or_default().clone(),
        };
        let _gate = gate.gate.lock().await;

        if let Some(connection) = self.get(&key) {
            return Ok(connection);
        }

        locks.acquire(station).await?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let on_teardown = {
            let registry = Arc::downgrade(self);
            let key = key.clone();
            move || remove(&registry, &key, id)
        };

        match Connection::open(station, locks.clone(), options, on_teardown).await {
            Ok(connection) => {
                self.live.lock().insert(key, (id, connection.clone()));
                Ok(connection)
            }
            Err(error) => {
                if let Err(error) = locks.release(&station.id) {
                    tracing::error!(station = %station.id, %error, "failed to release lock");
                }
                Err(error)
            }
        }
    }

    fn get(&self, key: &str) -> Option<Arc<Connection>> {
        let mut live = self.live.lock();
        match live.get(key) {
            Some((_, connection)) if !connection.is_closed() => Some(connection.clone()),
            Some(_) => {
                live.remove(key);
                None
            }
            None => None,
        }
    }

    pub fn len(&self) -> usize {
        self.live.lock().len()
    }

    /// Closes all connections.
    pub async fn close_all(&self) {
        let connections: Vec<_> = self
            .live
            .lock()
            .drain()
            .map(|(_, (_, connection))| connection)
            .collect();

        for connection in connections {
            connection.close().await;
        }
    }
}

/// Removes its entry from `Connections::connecting` when the last caller
/// waiting on it is done.
struct ConnectGate<'a> {
    connections: &'a Connections,
    key: String,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for ConnectGate<'_> {
    fn drop(&mut self) {
        let mut connecting = self.connections.connecting.lock();
        let unused = connecting
            .get(&self.key)
            .is_some_and(|gate| Arc::ptr_eq(gate, &self.gate) && Arc::strong_count(gate) == 2);
        if unused {
            connecting.remove(&self.key);
        }
    }
}

fn remove(registry: &Weak<Connections>, key: &str, id: u64) {
    if let Some(registry) = registry.upgrade() {
        let mut live = registry.live.lock();
        // a newer connection might have replaced this one already
        if live.get(key).is_some_and(|(live_id, _)| *live_id == id) {
            live.remove(key);
        }
    }
}
