//! Waking up the console and controlling its backlight.

use std::future::Future;

use crate::{
    Error,
    answer::AnswerFormat,
    command::Command,
    connection::Connection,
};

/// Wakes the console up.
///
/// The console sleeps between commands to save power, and doesn't listen
/// until it has been woken up. Sends ESC LF and expects LF CR. This is tried
/// `wake_up_attempts` times, with a pause of `wake_up_pause` between
/// attempts.
pub async fn wake_up(connection: &Connection) -> Result<(), Error> {
    let options = connection.options();
    let format = AnswerFormat::compile("<LF><CR>")?;
    let attempts = options.wake_up_attempts.max(1);

    for attempt in 1..=attempts {
        match connection
            .send_command(&Command::wake_up(), options.wake_up_timeout, &format)
            .await
        {
            Ok(_) => {
                tracing::debug!(station = %connection.station(), attempt, "console is awake");
                return Ok(());
            }
            Err(error @ (Error::CommandTimeout { .. } | Error::ProtocolMismatch { .. })) => {
                tracing::debug!(station = %connection.station(), attempt, %error, "console didn't wake up");
                if attempt < attempts {
                    tokio::time::sleep(options.wake_up_pause).await;
                }
            }
            Err(error) => return Err(error),
        }
    }

    Err(Error::WakeUpFailed {
        station: connection.station().clone(),
        attempts,
    })
}

/// Turns the backlight on or off.
pub async fn lamps(connection: &Connection, on: bool) -> Result<(), Error> {
    connection
        .send_command(
            &Command::lamps(on),
            connection.options().command_timeout,
            &AnswerFormat::compile("<LF><CR>OK<LF><CR>")?,
        )
        .await?;
    Ok(())
}

/// Runs `f` with the backlight on.
///
/// The backlight is turned off afterwards, even if `f` failed. A failure to
/// turn it off is only logged if `f` failed too, so the first error isn't
/// lost.
pub async fn with_lamps<'a, F, Fut, T>(connection: &'a Connection, f: F) -> Result<T, Error>
where
    F: FnOnce(&'a Connection) -> Fut,
    Fut: Future<Output = Result<T, Error>>,
{
    lamps(connection, true).await?;

    let result = f(connection).await;
    let off = lamps(connection, false).await;

    match (result, off) {
        (Ok(value), Ok(())) => Ok(value),
        (Ok(_), Err(error)) => Err(error),
        (Err(error), Ok(())) => Err(error),
        (Err(error), Err(off_error)) => {
            tracing::warn!(station = %connection.station(), error = %off_error, "failed to turn off lamps");
            Err(error)
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::{
        Options,
        testing::{
            FakeConsole,
            Reply,
            locks,
            options,
        },
    };

    async fn open(console: &FakeConsole, options: &Options) -> Arc<Connection> {
        let station = console.station();
        let locks = locks(options);
        locks.acquire(&station).await.unwrap();
        Connection::open(&station, locks, options, || {})
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn it_wakes_up_the_console() {
        let console = FakeConsole::spawn(|chunk| {
            if chunk == [0x1b, 0x0a] {
                Reply::Send(vec![0x0a, 0x0d])
            }
            else {
                Reply::Silent
            }
        })
        .await;
        let options = options();
        let connection = open(&console, &options).await;

        wake_up(&connection).await.unwrap();
        assert_eq!(console.received(), vec![vec![0x1b, 0x0a]]);
    }

    #[tokio::test]
    async fn it_retries_until_the_console_answers() {
        let mut remaining = 2;
        let console = FakeConsole::spawn(move |_| {
            if remaining > 0 {
                remaining -= 1;
                Reply::Silent
            }
            else {
                Reply::Send(b"\n\r".to_vec())
            }
        })
        .await;
        let options = options();
        let connection = open(&console, &options).await;

        wake_up(&connection).await.unwrap();
        assert_eq!(console.count(&[0x1b, 0x0a]), 3);
    }

    #[tokio::test]
    async fn it_gives_up_after_three_attempts() {
        let console = FakeConsole::spawn(|_| Reply::Silent).await;
        let options = options();
        let connection = open(&console, &options).await;

        let error = wake_up(&connection).await.unwrap_err();
        assert!(
            matches!(error, Error::WakeUpFailed { attempts: 3, .. }),
            "{error:?}"
        );

        // nothing else is sent afterwards
        tokio::time::sleep(options.wake_up_timeout * 2).await;
        assert_eq!(console.count(&[0x1b, 0x0a]), 3);
        assert_eq!(console.received().len(), 3);
    }

    #[tokio::test]
    async fn it_turns_the_lamps_off_after_failures() {
        let console = FakeConsole::spawn(|chunk| {
            if chunk.starts_with(b"LAMPS") {
                Reply::Send(b"\n\rOK\n\r".to_vec())
            }
            else {
                Reply::Silent
            }
        })
        .await;
        let options = options();
        let connection = open(&console, &options).await;

        let result: Result<(), Error> = with_lamps(&connection, |connection| {
            async move {
                connection
                    .send_command(
                        &Command::get_time(),
                        std::time::Duration::from_millis(50),
                        &AnswerFormat::compile("<ACK>6<CRC>")?,
                    )
                    .await?;
                Ok(())
            }
        })
        .await;

        assert!(matches!(result, Err(Error::CommandTimeout { .. })));
        assert_eq!(
            console.received(),
            vec![
                b"LAMPS 1\n".to_vec(),
                b"GETTIME\n".to_vec(),
                b"LAMPS 0\n".to_vec()
            ]
        );
    }
}
