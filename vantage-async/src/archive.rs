//! Downloading archive records with DMPAFT.
//!
//! The console keeps its archive in a ring buffer of pages with 5 records
//! each. DMPAFT takes the timestamp of the newest record we already have and
//! answers with the number of pages to follow and the index of the first new
//! record in the first page. Every page is then requested with an ACK, or
//! requested again with a NAK if its CRC was wrong.

use bytes::Buf;
use chrono::NaiveDateTime;

use crate::{
    Error,
    answer::AnswerFormat,
    command::Command,
    config::StationConfig,
    connection::Connection,
    console::invalid_packet,
    packet::{
        PacketKind,
        archive::{
            ArchiveRecord,
            PAGE_LENGTH,
            RECORDS_PER_PAGE,
            decode_page,
            pack_timestamp,
        },
    },
};

/// Downloads all records newer than the station's `last_archive_date`.
///
/// On success the station's `last_archive_date` is advanced to the newest
/// record. Persisting it is up to the caller.
pub async fn download_archive(
    connection: &Connection,
    station: &mut StationConfig,
) -> Result<Vec<ArchiveRecord>, Error> {
    let since = station.state.last_archive_date;
    let stamp = since.map(pack_timestamp).unwrap_or_default();
    let options = connection.options();

    connection
        .send_command(
            &Command::dump_after(),
            options.command_timeout,
            &AnswerFormat::compile("<ACK>")?,
        )
        .await?;

    let mut header = connection
        .send_command(
            &Command::binary_with_crc(&stamp),
            options.command_timeout,
            &AnswerFormat::compile("<ACK>4<CRC>")?,
        )
        .await?;
    let pages = header.get_u16_le();
    let first_index = usize::from(header.get_u16_le());

    tracing::debug!(station = %station.id, ?since, pages, first_index, "downloading archive");

    if first_index >= RECORDS_PER_PAGE {
        return Err(Error::InvalidPacket {
            station: station.id.clone(),
            kind: PacketKind::Archive.name(),
            reason: format!("first record index out of range: {first_index}"),
        });
    }

    let page_format = AnswerFormat::compile(&format!("{PAGE_LENGTH}<CRC>"))?;
    let mut records = vec![];

    for page_number in 0..pages {
        let data = connection
            .send_command_with_retry(
                &Command::ack(),
                &Command::nak(),
                options.page_timeout,
                &page_format,
            )
            .await?;

        let page = decode_page(&data)
            .map_err(|error| invalid_packet(connection, PacketKind::Archive, error))?;
        tracing::trace!(station = %station.id, page_number, sequence = page.sequence, "received page");

        let skip = if page_number == 0 { first_index } else { 0 };
        records.extend(
            page.records
                .into_iter()
                .skip(skip)
                .flatten()
                .filter(|record| is_newer(record, since)),
        );
    }

    if let Some(newest) = records.iter().map(|record| record.timestamp).max() {
        station.state.last_archive_date = Some(newest);
    }

    tracing::debug!(station = %station.id, records = records.len(), "downloaded archive");

    Ok(records)
}

/// Records that aren't newer than what we asked for are from before the ring
/// buffer wrapped around.
fn is_newer(record: &ArchiveRecord, since: Option<NaiveDateTime>) -> bool {
    since.is_none_or(|since| record.timestamp > since)
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        command::{
            ACK,
            NAK,
        },
        crc::with_crc,
        packet::archive::tests::{
            datetime,
            empty_record,
            record,
        },
        testing::{
            FakeConsole,
            Reply,
            locks,
            options,
        },
    };

    fn page(sequence: u8, records: Vec<Vec<u8>>) -> Vec<u8> {
        let mut page = vec![sequence];
        let count = records.len();
        for record in records {
            page.extend(record);
        }
        for _ in count..RECORDS_PER_PAGE {
            page.extend(empty_record());
        }
        page.extend([0; 4]);
        page
    }

    /// Answers DMPAFT and then sends `pages` one by one. The first page is
    /// sent with a broken CRC `corrupt` times.
    async fn archive_console(pages: Vec<Vec<u8>>, first_index: u16, mut corrupt: usize) -> FakeConsole {
        let mut next = 0;
        FakeConsole::spawn(move |chunk| {
            match chunk {
                b"DMPAFT\n" => Reply::ack(),
                [ACK] | [NAK] => {
                    if chunk == [ACK] {
                        next += 1;
                    }
                    let mut data = with_crc(&pages[next - 1]);
                    if corrupt > 0 {
                        corrupt -= 1;
                        let last = data.len() - 1;
                        data[last] ^= 0xff;
                    }
                    Reply::Send(data)
                }
                _ => {
                    let mut header = vec![];
                    header.extend((pages.len() as u16).to_le_bytes());
                    header.extend(first_index.to_le_bytes());
                    Reply::ack_with_crc(&header)
                }
            }
        })
        .await
    }

    async fn open(console: &FakeConsole) -> Arc<Connection> {
        let options = options();
        let station = console.station();
        let locks = locks(&options);
        locks.acquire(&station).await.unwrap();
        Connection::open(&station, locks, &options, || {})
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn it_downloads_new_records() {
        let since = datetime(2024, 1, 2, 10, 0);
        let pages = vec![
            page(
                0,
                vec![
                    record(datetime(2024, 1, 2, 9, 55)),
                    record(datetime(2024, 1, 2, 10, 0)),
                    record(datetime(2024, 1, 2, 10, 5)),
                    record(datetime(2024, 1, 2, 10, 10)),
                    record(datetime(2024, 1, 2, 10, 15)),
                ],
            ),
            page(
                1,
                vec![
                    record(datetime(2024, 1, 2, 10, 20)),
                    record(datetime(2024, 1, 2, 10, 25)),
                    // left over from before the ring buffer wrapped
                    record(datetime(2023, 12, 1, 8, 0)),
                ],
            ),
        ];
        let console = archive_console(pages, 1, 0).await;
        let connection = open(&console).await;
        let mut station = console.station();
        station.state.last_archive_date = Some(since);

        let records = download_archive(&connection, &mut station).await.unwrap();
        let timestamps: Vec<_> = records.iter().map(|record| record.timestamp).collect();
        assert_eq!(
            timestamps,
            vec![
                datetime(2024, 1, 2, 10, 5),
                datetime(2024, 1, 2, 10, 10),
                datetime(2024, 1, 2, 10, 15),
                datetime(2024, 1, 2, 10, 20),
                datetime(2024, 1, 2, 10, 25),
            ]
        );
        assert_eq!(
            station.state.last_archive_date,
            Some(datetime(2024, 1, 2, 10, 25))
        );

        let received = console.received();
        assert_eq!(received[0], b"DMPAFT\n");
        assert_eq!(received[1], with_crc(&pack_timestamp(since)));
        assert_eq!(&received[2..], &[vec![ACK], vec![ACK]]);
    }

    #[tokio::test]
    async fn it_requests_corrupted_pages_again() {
        let pages = vec![page(0, vec![record(datetime(2024, 3, 1, 0, 5))])];
        let console = archive_console(pages, 0, 1).await;
        let connection = open(&console).await;
        let mut station = console.station();

        let records = download_archive(&connection, &mut station).await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(&console.received()[2..], &[vec![ACK], vec![NAK]]);
    }

    #[tokio::test]
    async fn it_keeps_the_date_when_nothing_is_new() {
        let console = archive_console(vec![], 0, 0).await;
        let connection = open(&console).await;
        let mut station = console.station();
        station.state.last_archive_date = Some(datetime(2024, 1, 2, 10, 0));

        let records = download_archive(&connection, &mut station).await.unwrap();
        assert!(records.is_empty());
        assert_eq!(
            station.state.last_archive_date,
            Some(datetime(2024, 1, 2, 10, 0))
        );
        assert_eq!(console.received().len(), 2);
    }
}
