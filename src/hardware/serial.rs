//! Line-oriented transports for serial instruments.
//!
//! Instruments like the octoDAC answer every command with exactly one line,
//! so the transport surface is a single request/response call. The real
//! serial port is only compiled with the `serial` feature; tests use
//! [`ScriptedTransport`](super::mock::ScriptedTransport) or a
//! [`StreamTransport`] over an in-memory duplex stream.

use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, warn};

use crate::error::{AppResult, DaqError};

/// Half-duplex command/response channel.
#[async_trait]
pub trait LineTransport: Send {
    /// Write `line` plus a newline and return the reply line without its
    /// terminator.
    async fn query(&mut self, line: &str) -> AppResult<String>;
}

/// [`LineTransport`] over any byte stream.
///
/// A query whose future is dropped after the command went out leaves its
/// reply in flight. The transport counts such unanswered commands and reads
/// their replies off the stream before the next write, so a cancelled poll
/// never shifts later replies by one.
pub struct StreamTransport<S> {
    stream: BufReader<S>,
    name: String,
    timeout: Duration,
    unanswered: usize,
}

impl<S> StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    /// Wrap `stream`. `timeout` bounds every reply; `name` labels errors.
    pub fn new(stream: S, name: impl Into<String>, timeout: Duration) -> Self {
        Self {
            stream: BufReader::new(stream),
            name: name.into(),
            timeout,
            unanswered: 0,
        }
    }

    /// Commands written whose reply has not been read yet.
    pub fn unanswered(&self) -> usize {
        self.unanswered
    }

    /// Read one line within the reply timeout. `None` on timeout.
    async fn read_reply(&mut self, line: &str) -> AppResult<Option<String>> {
        let mut reply = String::new();
        match tokio::time::timeout(self.timeout, self.stream.read_line(&mut reply)).await {
            Ok(Ok(0)) => Err(DaqError::Instrument(format!(
                "{}: port closed while waiting for reply to '{line}'",
                self.name
            ))),
            Ok(Ok(_)) => Ok(Some(reply.trim_end_matches(['\r', '\n']).to_owned())),
            Ok(Err(e)) => Err(e.into()),
            Err(_) => Ok(None),
        }
    }

    /// Discard replies to commands whose query was abandoned.
    async fn resync(&mut self) -> AppResult<()> {
        while self.unanswered > 0 {
            match self.read_reply("earlier command").await? {
                Some(stale) => {
                    self.unanswered -= 1;
                    debug!(port = %self.name, reply = %stale, "Discarded stale reply");
                }
                None => {
                    warn!(
                        port = %self.name,
                        pending = self.unanswered,
                        "Replies to abandoned commands never arrived"
                    );
                    self.unanswered = 0;
                }
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<S> LineTransport for StreamTransport<S>
where
    S: AsyncRead + AsyncWrite + Unpin + Send,
{
    async fn query(&mut self, line: &str) -> AppResult<String> {
        self.resync().await?;

        let payload = format!("{line}\n");
        let writer = self.stream.get_mut();
        writer.write_all(payload.as_bytes()).await?;
        writer.flush().await?;
        self.unanswered += 1;

        match self.read_reply(line).await? {
            Some(reply) => {
                self.unanswered -= 1;
                debug!(port = %self.name, command = line, reply = %reply, "Serial transaction");
                Ok(reply)
            }
            None => Err(DaqError::Instrument(format!(
                "{}: no reply to '{line}' within {:?}",
                self.name, self.timeout
            ))),
        }
    }
}

#[cfg(feature = "serial")]
pub use port::SerialTransport;

#[cfg(feature = "serial")]
mod port {
    use std::time::Duration;

    use tokio_serial::{SerialPortBuilderExt, SerialStream};
    use tracing::info;

    use super::StreamTransport;
    use crate::error::{AppResult, DaqError};

    /// 8N1 serial port without flow control.
    pub type SerialTransport = StreamTransport<SerialStream>;

    impl StreamTransport<SerialStream> {
        /// Open `path` at `baud_rate`. `timeout` bounds every reply.
        pub fn open(path: &str, baud_rate: u32, timeout: Duration) -> AppResult<Self> {
            let port = tokio_serial::new(path, baud_rate)
                .data_bits(tokio_serial::DataBits::Eight)
                .parity(tokio_serial::Parity::None)
                .stop_bits(tokio_serial::StopBits::One)
                .flow_control(tokio_serial::FlowControl::None)
                .open_native_async()
                .map_err(|e| DaqError::Instrument(format!("Failed to open serial port {path}: {e}")))?;

            info!(path, baud_rate, "Opened serial port");
            Ok(Self::new(port, path, timeout))
        }
    }
}
