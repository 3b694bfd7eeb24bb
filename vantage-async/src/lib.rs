//! # Async client for Davis Vantage Pro2 consoles
//!
//! This crate talks to Vantage Pro2 consoles through a TCP-to-serial bridge,
//! using the console's serial protocol as described in the [Vantage Pro2
//! serial communication reference][1].
//!
//! The entry point is [`Vantage`], which keeps one connection per station
//! and makes sure that only one command session runs against a console at a
//! time. Responses are decoded by the [`packet`] module and converted into
//! engineering units by the [`units`] module.
//!
//! [1]: https://www.davisinstruments.com/pages/vantage-pro2-serial-protocol

pub mod answer;
pub mod archive;
pub mod command;
pub mod config;
pub mod connection;
pub mod console;
pub mod crc;
pub mod eeprom;
pub mod lock;
pub mod packet;
pub mod units;
mod vantage;
pub mod wake;

#[cfg(test)]
mod testing;

use std::io;

pub use crate::{
    answer::AnswerFormat,
    command::Command,
    config::{
        Options,
        RainCollectorSize,
        StationConfig,
        StationId,
    },
    connection::Connection,
    vantage::Vantage,
};

/// Errors returned when talking to a console.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error(transparent)]
    InvalidFormat(#[from] answer::InvalidFormat),

    #[error("connecting to {address} timed out")]
    ConnectTimeout { station: StationId, address: String },

    #[error("could not connect to {address}")]
    ConnectError {
        station: StationId,
        address: String,
        #[source]
        source: io::Error,
    },

    #[error("station {station}: host {host} is unreachable")]
    HostUnreachable { station: StationId, host: String },

    #[error("station {station} is locked by another session")]
    LockBusy { station: StationId },

    #[error("station {station}: lock store failed")]
    LockStore {
        station: StationId,
        #[source]
        source: io::Error,
    },

    #[error(
        "station {station}: command {command:?} timed out with {received} of {expected} bytes received (0x{partial})"
    )]
    CommandTimeout {
        station: StationId,
        command: String,
        expected: usize,
        received: usize,
        partial: String,
    },

    #[error(
        "station {station}: unexpected answer to {command:?} at offset {offset}: expected 0x{expected}, got 0x{actual}"
    )]
    ProtocolMismatch {
        station: StationId,
        command: String,
        offset: usize,
        expected: String,
        actual: String,
    },

    #[error(
        "station {station}: crc error in answer to {command:?} after {attempts} attempts (received {received:04x}, calculated {calculated:04x})"
    )]
    Crc {
        station: StationId,
        command: String,
        attempts: usize,
        received: u16,
        calculated: u16,
    },

    #[error("station {station}: console didn't wake up after {attempts} attempts")]
    WakeUpFailed { station: StationId, attempts: usize },

    #[error("station {station}: another command is in progress")]
    CommandInProgress { station: StationId },

    #[error("station {station}: connection closed")]
    ConnectionClosed { station: StationId },

    #[error("station {station}: invalid {kind} packet: {reason}")]
    InvalidPacket {
        station: StationId,
        kind: &'static str,
        reason: String,
    },

    #[error("station {station}: invalid argument: {reason}")]
    InvalidArgument { station: StationId, reason: String },

    #[error("station {station}: failed to persist state")]
    Persist {
        station: StationId,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("io error")]
    Io(#[from] io::Error),
}

impl Error {
    pub(crate) fn lock_store(station: &StationId, source: io::Error) -> Self {
        Self::LockStore {
            station: station.clone(),
            source,
        }
    }

    /// Whether the error was caused by corrupted data, i.e. sending the same
    /// command again might succeed.
    pub fn is_crc_error(&self) -> bool {
        matches!(self, Self::Crc { .. })
    }

    /// Station the error relates to, if any.
    pub fn station(&self) -> Option<&StationId> {
        match self {
            Self::ConnectTimeout { station, .. }
            | Self::ConnectError { station, .. }
            | Self::HostUnreachable { station, .. }
            | Self::LockBusy { station }
            | Self::LockStore { station, .. }
            | Self::CommandTimeout { station, .. }
            | Self::ProtocolMismatch { station, .. }
            | Self::Crc { station, .. }
            | Self::WakeUpFailed { station, .. }
            | Self::CommandInProgress { station }
            | Self::ConnectionClosed { station }
            | Self::InvalidPacket { station, .. }
            | Self::InvalidArgument { station, .. }
            | Self::Persist { station, .. } => Some(station),
            Self::InvalidFormat(_) | Self::Io(_) => None,
        }
    }
}
