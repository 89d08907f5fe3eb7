use std::time::Duration;

use futures::{SinkExt, StreamExt};
use tokio::{
    io::{AsyncRead, AsyncWrite},
    time,
};
use tokio_util::{
    codec::{Framed, LinesCodec, LinesCodecError},
    sync::CancellationToken,
};
use tracing::{debug, warn};

use super::{BoardConfig, LineKind, PinMap, SerialCommand, SerialError};

const MAX_SERIAL_LINE: usize = 1024;

/// Gap between consecutive `pin` commands.
pub const PIN_COMMAND_GAP: Duration = Duration::from_millis(200);

/// A configuration session over any byte stream attached to the board.
pub struct SerialSession<T> {
    framed: Framed<T, LinesCodec>,
    config: BoardConfig,
}

impl<T> SerialSession<T>
where
    T: AsyncRead + AsyncWrite + Unpin,
{
    pub fn new(io: T) -> Self {
        Self {
            framed: Framed::new(io, LinesCodec::new_with_max_length(MAX_SERIAL_LINE)),
            config: BoardConfig::default(),
        }
    }

    /// Board settings gathered from the lines read so far.
    pub fn config(&self) -> &BoardConfig {
        &self.config
    }

    pub async fn send(&mut self, command: &SerialCommand) -> Result<(), SerialError> {
        debug!(command = %command, "Sending serial command");
        self.framed.send(command.to_string()).await?;
        Ok(())
    }

    /// Push every pin assignment, pausing `gap` between commands.
    pub async fn apply_pins(&mut self, pins: &PinMap, gap: Duration) -> Result<(), SerialError> {
        for (i, command) in pins.commands().enumerate() {
            if i > 0 {
                time::sleep(gap).await;
            }
            self.send(&command).await?;
        }
        Ok(())
    }

    /// Next trimmed, non-empty line. `None` once the stream ends.
    ///
    /// Lines longer than the codec limit are logged and dropped; only I/O
    /// failures end the session.
    pub async fn next_line(&mut self) -> Result<Option<(LineKind, String)>, SerialError> {
        // After a decode error the framed stream yields one `None` before
        // it resumes reading.
        let mut resuming = false;
        loop {
            let line = match self.framed.next().await {
                Some(Ok(line)) => line,
                Some(Err(LinesCodecError::MaxLineLengthExceeded)) => {
                    warn!(max_len = MAX_SERIAL_LINE, "Skipping overlong serial line");
                    resuming = true;
                    continue;
                }
                Some(Err(e)) => return Err(e.into()),
                None if resuming => {
                    resuming = false;
                    continue;
                }
                None => return Ok(None),
            };
            resuming = false;
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            self.config.apply_line(line);
            return Ok(Some((LineKind::classify(line), line.to_owned())));
        }
    }

    /// Hand each line to `on_line` until cancelled or the stream ends.
    pub async fn read_lines(
        &mut self,
        cancel: &CancellationToken,
        mut on_line: impl FnMut(LineKind, &str),
    ) -> Result<(), SerialError> {
        loop {
            let next = tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                next = self.next_line() => next?,
            };
            match next {
                Some((kind, line)) => on_line(kind, &line),
                None => return Ok(()),
            }
        }
    }
}
