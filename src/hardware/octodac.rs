//! octoDAC event-driven laser controller.
//!
//! The octoDAC is an Arduino shield with eight 16-bit DAC outputs that plays
//! an uploaded waypoint list once per trigger edge on its MASTERFIRE input.
//!
//! Protocol (ASCII, one command per line, one reply line per command):
//!
//! | Command       | Meaning                                      |
//! |---------------|----------------------------------------------|
//! | `y`           | identification, replies `octoDAC`            |
//! | `a ch;t;amp`  | append waypoint (channel, µs, 0..=65535)     |
//! | `c`           | clear the uploaded waveform                  |
//! | `t`           | play the waveform once on the next trigger   |
//! | `? w`         | waveform in progress, `0` when finished      |
//! | `k`           | stop the waveform                            |
//! | `x`           | clear DAC registers (all outputs to 0)       |
//! | `s 0` / `s 1` | close / open the pseudo-shutter              |
//! | `<ch> <val>`  | set channel 1..=8 to a value                 |

use std::time::Duration;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::capabilities::{ChannelConfig, LaserController, OutputChannel};
use super::serial::LineTransport;
use crate::error::{AppResult, DaqError};
use crate::waveform::{WaveformBuffer, Waypoint};

/// Identification reply of a healthy device.
pub const OCTODAC_IDENTITY: &str = "octoDAC";

/// Output channels addressable with the set-channel command.
pub const OCTODAC_CHANNELS: u8 = 8;

/// The Arduino resets when the port opens and may answer the first queries
/// with boot noise.
const HANDSHAKE_ATTEMPTS: usize = 3;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_millis(5);

/// Driver for the octoDAC over any [`LineTransport`].
pub struct OctoDac<T: LineTransport> {
    transport: T,
    poll_interval: Duration,
}

impl<T: LineTransport> OctoDac<T> {
    pub fn new(transport: T) -> Self {
        Self {
            transport,
            poll_interval: DEFAULT_POLL_INTERVAL,
        }
    }

    /// Interval between `? w` polls while waiting for completion.
    #[must_use]
    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    async fn command(&mut self, line: &str) -> AppResult<String> {
        let reply = self.transport.query(line).await?;
        debug!(command = line, reply = %reply, "octoDAC command");
        Ok(reply)
    }

    /// Set output `channel` (1..=8) to `value`, clamped to 0..=65535.
    pub async fn set_channel(&mut self, channel: u8, value: i64) -> AppResult<()> {
        if channel == 0 || channel > OCTODAC_CHANNELS {
            return Err(DaqError::Instrument(format!(
                "octoDAC channel must be 1..={OCTODAC_CHANNELS}, got {channel}"
            )));
        }
        let value = value.clamp(0, i64::from(u16::MAX));
        self.command(&format!("{channel} {value}")).await?;
        Ok(())
    }

    pub async fn open_shutter(&mut self) -> AppResult<()> {
        self.command("s 1").await.map(|_| ())
    }

    pub async fn close_shutter(&mut self) -> AppResult<()> {
        self.command("s 0").await.map(|_| ())
    }

    /// `true` while an uploaded waveform is playing.
    pub async fn waveform_in_progress(&mut self) -> AppResult<bool> {
        let reply = self.command("? w").await?;
        Ok(reply.trim() != "0")
    }
}

#[async_trait]
impl<T: LineTransport> OutputChannel for OctoDac<T> {
    async fn handshake(&mut self) -> AppResult<()> {
        let mut received = String::new();
        for attempt in 1..=HANDSHAKE_ATTEMPTS {
            received = self.identify().await?;
            if received == OCTODAC_IDENTITY {
                info!(attempt, "Connected to octoDAC");
                return self.disable_all().await;
            }
            debug!(attempt, reply = %received, "Unexpected octoDAC identification");
        }
        Err(DaqError::DeviceHandshake {
            device: "octoDAC".into(),
            expected: OCTODAC_IDENTITY.into(),
            received,
        })
    }

    async fn configure(&mut self, config: &ChannelConfig) -> AppResult<()> {
        // the trigger input is wired to MASTERFIRE; only the timing is informative
        debug!(
            trigger = %config.trigger_source,
            samples = config.sample_count,
            "octoDAC configured"
        );
        Ok(())
    }

    async fn load(&mut self, buffer: &WaveformBuffer) -> AppResult<()> {
        let WaveformBuffer::Waypoints(list) = buffer else {
            return Err(DaqError::Configuration(format!(
                "octoDAC needs a waypoint buffer, got {}",
                buffer.kind()
            )));
        };

        self.command("c").await?;
        for waypoint in list.iter() {
            self.command(&format!(
                "a {};{};{}",
                waypoint.channel, waypoint.time_us, waypoint.intensity
            ))
            .await?;
        }
        debug!(waypoints = list.len(), "Uploaded octoDAC waveform");
        Ok(())
    }

    async fn start(&mut self) -> AppResult<()> {
        self.command("t").await.map(|_| ())
    }

    async fn wait_until_done(&mut self) -> AppResult<()> {
        while self.waveform_in_progress().await? {
            tokio::time::sleep(self.poll_interval).await;
        }
        Ok(())
    }

    async fn stop(&mut self) -> AppResult<()> {
        self.command("k").await.map(|_| ())
    }

    async fn close(&mut self) -> AppResult<()> {
        if let Err(e) = self.close_shutter().await {
            warn!(error = %e, "Failed to close octoDAC shutter");
        }
        self.clear_registers().await
    }
}

#[async_trait]
impl<T: LineTransport> LaserController for OctoDac<T> {
    async fn identify(&mut self) -> AppResult<String> {
        let reply = self.command("y").await?;
        Ok(reply.trim().to_owned())
    }

    async fn enable(&mut self, line: u8) -> AppResult<()> {
        let output = Waypoint::output_for_line(usize::from(line));
        self.set_channel(output, i64::from(u16::MAX)).await
    }

    async fn disable_all(&mut self) -> AppResult<()> {
        for channel in 1..=OCTODAC_CHANNELS {
            self.set_channel(channel, 0).await?;
        }
        Ok(())
    }

    async fn clear_registers(&mut self) -> AppResult<()> {
        self.command("x").await.map(|_| ())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::ScriptedTransport;
    use crate::parameter::ParameterSnapshot;
    use crate::waveform::{ChannelLayout, LaserEncoding, WaveformAssembler, WaypointList};

    fn device() -> (OctoDac<ScriptedTransport>, ScriptedTransport) {
        let transport = ScriptedTransport::new();
        (OctoDac::new(transport.clone()), transport)
    }

    #[tokio::test]
    async fn test_handshake_accepts_after_boot_noise() {
        let (mut dac, transport) = device();
        transport.reply("y", "\u{0}\u{0}").reply("y", OCTODAC_IDENTITY);

        dac.handshake().await.unwrap();
        let sent = transport.sent();
        assert_eq!(&sent[..2], &["y", "y"]);
        assert_eq!(sent[2..].len(), 8);
        assert_eq!(sent[2], "1 0");
        assert_eq!(sent[9], "8 0");
    }

    #[tokio::test]
    async fn test_handshake_mismatch() {
        let (mut dac, transport) = device();
        transport.reply("y", "NicoLase");

        let err = dac.handshake().await.unwrap_err();
        match err {
            DaqError::DeviceHandshake {
                expected, received, ..
            } => {
                assert_eq!(expected, "octoDAC");
                assert_eq!(received, "NicoLase");
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(transport.sent().len(), HANDSHAKE_ATTEMPTS);
    }

    #[tokio::test]
    async fn test_load_uploads_waypoints_after_clear() {
        let (mut dac, transport) = device();
        let (list, _) = WaypointList::from_unsorted(
            vec![
                Waypoint {
                    channel: 1,
                    time_us: 97_000,
                    intensity: 0,
                },
                Waypoint {
                    channel: 1,
                    time_us: 10_000,
                    intensity: 32768,
                },
            ],
            100,
        );

        dac.load(&WaveformBuffer::Waypoints(list)).await.unwrap();
        assert_eq!(
            transport.sent(),
            vec!["c", "a 1;10000;32768", "a 1;97000;0"]
        );
    }

    #[tokio::test]
    async fn test_load_rejects_dense_buffer() {
        let (mut dac, _) = device();
        let buffer = WaveformBuffer::Dense(ndarray::Array2::zeros((1, 10)));
        assert!(matches!(
            dac.load(&buffer).await,
            Err(DaqError::Configuration(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_wait_polls_until_idle() {
        let (mut dac, transport) = device();
        transport.reply("? w", "1").reply("? w", "1").reply("? w", "0");

        dac.wait_until_done().await.unwrap();
        assert_eq!(transport.sent(), vec!["? w", "? w", "? w"]);
    }

    #[tokio::test]
    async fn test_set_channel_clamps_value() {
        let (mut dac, transport) = device();
        dac.set_channel(3, 70_000).await.unwrap();
        dac.set_channel(4, -5).await.unwrap();
        assert!(dac.set_channel(9, 1).await.is_err());
        assert!(dac.set_channel(0, 1).await.is_err());
        assert_eq!(transport.sent(), vec!["3 65535", "4 0"]);
    }

    #[tokio::test]
    async fn test_controller_commands() {
        let (mut dac, transport) = device();
        dac.enable(1).await.unwrap();
        dac.start().await.unwrap();
        dac.stop().await.unwrap();
        dac.close().await.unwrap();
        assert_eq!(transport.sent(), vec!["2 65535", "t", "k", "s 0", "x"]);
    }

    #[tokio::test]
    async fn test_enable_and_waypoints_share_outputs() {
        let layout = ChannelLayout::default();
        let bundle = WaveformAssembler::new(layout.clone())
            .with_encoding(LaserEncoding::Waypoint)
            .recompute(&ParameterSnapshot::new("488 nm", "1x"))
            .unwrap();
        let (mut dac, transport) = device();
        dac.load(&bundle.laser).await.unwrap();

        let line = layout.laser_line("488 nm").unwrap();
        dac.enable(u8::try_from(line).unwrap()).await.unwrap();

        let sent = transport.sent();
        let enabled = sent.last().unwrap().split(' ').next().unwrap().to_owned();
        let active = sent
            .iter()
            .filter_map(|cmd| cmd.strip_prefix("a "))
            .map(|args| args.split(';').collect::<Vec<_>>())
            .find(|fields| fields[2] != "0")
            .unwrap();
        assert_eq!(active[0], enabled);

        // line 0 maps to output 1, which the set-channel command accepts
        dac.enable(0).await.unwrap();
        assert_eq!(transport.sent().last().unwrap(), "1 65535");
        assert!(transport.sent().iter().all(|cmd| !cmd.starts_with("a 0;")));
    }
}
