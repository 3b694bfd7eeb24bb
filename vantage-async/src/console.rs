//! Everyday console operations: the clock, real-time packets and the
//! barometer calibration.

use chrono::{
    Datelike,
    NaiveDate,
    NaiveDateTime,
    TimeDelta,
    Timelike,
    Utc,
};

use crate::{
    Error,
    answer::AnswerFormat,
    command::Command,
    config::StationConfig,
    connection::Connection,
    packet::{
        PacketError,
        PacketKind,
        Readings,
        realtime::decode_realtime,
    },
};

/// Current time at the station, going by its configured UTC offset.
pub fn station_now(station: &StationConfig) -> NaiveDateTime {
    Utc::now().naive_utc() + TimeDelta::minutes(station.utc_offset_minutes.into())
}

/// Decodes the console's time format: seconds, minutes, hours, day, month,
/// years since 1900.
pub fn decode_time(data: &[u8]) -> Option<NaiveDateTime> {
    let [second, minute, hour, day, month, year] = *data
    else {
        return None;
    };
    NaiveDate::from_ymd_opt(1900 + i32::from(year), month.into(), day.into())?.and_hms_opt(
        hour.into(),
        minute.into(),
        second.into(),
    )
}

pub fn encode_time(time: NaiveDateTime) -> Option<[u8; 6]> {
    let year = u8::try_from(time.year() - 1900).ok()?;
    Some([
        time.second() as u8,
        time.minute() as u8,
        time.hour() as u8,
        time.day() as u8,
        time.month() as u8,
        year,
    ])
}

/// Reads the console's clock.
pub async fn get_time(connection: &Connection) -> Result<NaiveDateTime, Error> {
    let data = connection
        .send_command(
            &Command::get_time(),
            connection.options().command_timeout,
            &AnswerFormat::compile("<ACK>6<CRC>")?,
        )
        .await?;

    decode_time(&data).ok_or_else(|| {
        Error::InvalidPacket {
            station: connection.station().clone(),
            kind: "time",
            reason: format!("invalid date: 0x{}", hex::encode(&data)),
        }
    })
}

/// Sets the console's clock.
pub async fn set_time(connection: &Connection, time: NaiveDateTime) -> Result<(), Error> {
    let data = encode_time(time).ok_or_else(|| {
        Error::InvalidArgument {
            station: connection.station().clone(),
            reason: format!("time out of range: {time}"),
        }
    })?;

    let timeout = connection.options().command_timeout;
    let ack = AnswerFormat::compile("<ACK>")?;

    connection
        .send_command(&Command::set_time(), timeout, &ack)
        .await?;
    connection
        .send_command(&Command::binary_with_crc(&data), timeout, &ack)
        .await?;

    tracing::debug!(station = %connection.station(), %time, "set console time");
    Ok(())
}

/// Console time minus station time, in seconds.
pub async fn delta_time_seconds(
    connection: &Connection,
    station: &StationConfig,
) -> Result<i64, Error> {
    let console = get_time(connection).await?;
    Ok((console - station_now(station)).num_seconds())
}

/// Measures the console's clock drift, records it in the station state and
/// sets the clock to station time.
pub async fn sync_time(connection: &Connection, station: &mut StationConfig) -> Result<i64, Error> {
    let delta = delta_time_seconds(connection, station).await?;
    set_time(connection, station_now(station)).await?;

    tracing::info!(station = %station.id, delta, "synchronized console time");
    station.state.delta_time_seconds = Some(delta);

    Ok(delta)
}

async fn read_realtime(connection: &Connection, kind: PacketKind) -> Result<Readings, Error> {
    let command = match kind {
        PacketKind::Loop2 => Command::loop2_packets(1),
        _ => Command::loop_packets(1),
    };

    let data = connection
        .send_command(
            &command,
            connection.options().command_timeout,
            &AnswerFormat::compile("<ACK>97<CRC>")?,
        )
        .await?;

    decode_realtime(&data, kind).map_err(|error| invalid_packet(connection, kind, error))
}

/// Requests a single LOOP packet.
pub async fn read_loop(connection: &Connection) -> Result<Readings, Error> {
    read_realtime(connection, PacketKind::Loop).await
}

/// Requests a single LOOP2 packet.
pub async fn read_loop2(connection: &Connection) -> Result<Readings, Error> {
    read_realtime(connection, PacketKind::Loop2).await
}

pub(crate) fn invalid_packet(connection: &Connection, kind: PacketKind, error: PacketError) -> Error {
    Error::InvalidPacket {
        station: connection.station().clone(),
        kind: kind.name(),
        reason: error.to_string(),
    }
}

/// Calibrates the barometer and sets the elevation.
///
/// `barometer` is the current reading in thousandths of inHg, or 0 to only
/// set the elevation. `elevation` is in feet.
pub async fn set_barometer(connection: &Connection, barometer: u16, elevation: i32) -> Result<(), Error> {
    if barometer != 0 && !(20000..=32500).contains(&barometer) {
        return Err(Error::InvalidArgument {
            station: connection.station().clone(),
            reason: format!("barometer out of range: {barometer}"),
        });
    }
    if !(-2000..=15000).contains(&elevation) {
        return Err(Error::InvalidArgument {
            station: connection.station().clone(),
            reason: format!("elevation out of range: {elevation}"),
        });
    }

    connection
        .send_command(
            &Command::barometer(barometer, elevation),
            connection.options().command_timeout,
            &AnswerFormat::compile("<LF><CR>OK<LF><CR>")?,
        )
        .await?;
    Ok(())
}
