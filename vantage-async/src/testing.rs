//! A scripted console for tests.

use std::{
    net::SocketAddr,
    sync::Arc,
    time::Duration,
};

use parking_lot::Mutex;
use tokio::{
    io::{
        AsyncReadExt,
        AsyncWriteExt,
    },
    net::TcpListener,
};

use crate::{
    Options,
    StationConfig,
    command::ACK,
    crc::with_crc,
    lock::{
        MemoryLockStore,
        StationLocks,
        tests::StaticProbe,
    },
};

/// What the fake console does after receiving something.
#[derive(Clone, Debug)]
pub enum Reply {
    Send(Vec<u8>),
    Silent,
    HangUp,
}

impl Reply {
    /// ACK, `data` and its CRC.
    pub fn ack_with_crc(data: &[u8]) -> Self {
        let mut reply = vec![ACK];
        reply.extend(with_crc(data));
        Self::Send(reply)
    }

    pub fn ack() -> Self {
        Self::Send(vec![ACK])
    }
}

/// Listens on localhost and answers every received chunk with whatever the
/// responder returns. Commands are spaced out by the client, so one chunk is
/// one command.
#[derive(Debug)]
pub struct FakeConsole {
    pub address: SocketAddr,
    received: Arc<Mutex<Vec<Vec<u8>>>>,
}

impl FakeConsole {
    pub async fn spawn<F>(respond: F) -> Self
    where
        F: FnMut(&[u8]) -> Reply + Send + 'static,
    {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let address = listener.local_addr().unwrap();
        let received = Arc::new(Mutex::new(vec![]));
        let respond = Arc::new(Mutex::new(respond));

        tokio::spawn({
            let received = received.clone();
            async move {
                loop {
                    let Ok((mut stream, _)) = listener.accept().await
                    else {
                        break;
                    };
                    let received = received.clone();
                    let respond = respond.clone();

                    tokio::spawn(async move {
                        let mut buffer = [0; 1024];
                        loop {
                            let n = match stream.read(&mut buffer).await {
                                Ok(0) | Err(_) => break,
                                Ok(n) => n,
                            };
                            let chunk = buffer[..n].to_vec();
                            received.lock().push(chunk.clone());

                            let reply = {
                                let mut respond = respond.lock();
                                (*respond)(&chunk)
                            };
                            match reply {
                                Reply::Send(data) => {
                                    if stream.write_all(&data).await.is_err() {
                                        break;
                                    }
                                }
                                Reply::Silent => {}
                                Reply::HangUp => break,
                            }
                        }
                    });
                }
            }
        });

        Self { address, received }
    }

    pub fn station(&self) -> StationConfig {
        StationConfig::new("test", self.address.ip().to_string(), self.address.port())
    }

    pub fn received(&self) -> Vec<Vec<u8>> {
        self.received.lock().clone()
    }

    /// How often exactly `command` was received.
    pub fn count(&self, command: &[u8]) -> usize {
        self.received
            .lock()
            .iter()
            .filter(|chunk| chunk.as_slice() == command)
            .count()
    }
}

/// Short timings so tests don't take long.
pub fn options() -> Options {
    Options {
        connect_timeout: Duration::from_secs(1),
        idle_timeout: Duration::from_secs(2),
        command_spacing: Duration::from_millis(20),
        crc_attempts: 2,
        lock_horizon: Duration::from_secs(5),
        lock_attempts: 3,
        lock_retry_interval: Duration::from_millis(50),
        probe_timeout: Duration::from_millis(100),
        wake_up_timeout: Duration::from_millis(150),
        wake_up_attempts: 3,
        wake_up_pause: Duration::from_millis(30),
        command_timeout: Duration::from_millis(300),
        page_timeout: Duration::from_millis(300),
    }
}

pub fn locks(options: &Options) -> Arc<StationLocks> {
    Arc::new(StationLocks::new(
        Arc::new(MemoryLockStore::new()),
        StaticProbe::new(true),
        options,
    ))
}
