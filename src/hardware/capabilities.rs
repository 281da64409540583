//! Capability traits for output hardware.
//!
//! Each physical output (an analog output task, a counter, an event-driven
//! laser controller) implements [`OutputChannel`]. The digital line that
//! starts a cycle implements [`TriggerOutput`]. Lifecycle rules are enforced
//! one level up by [`ChannelSession`](super::session::ChannelSession), so
//! implementations only talk to their device.

use async_trait::async_trait;

use crate::error::AppResult;
use crate::waveform::WaveformBuffer;

/// Master trigger pulse: low, high for three samples, low.
pub const MASTER_TRIGGER_PATTERN: [bool; 5] = [false, true, true, true, false];

/// Timing shared by every channel of one acquisition.
#[derive(Debug, Clone, PartialEq)]
pub struct ChannelConfig {
    /// Sample clock in Hz.
    pub clock_rate: f64,
    /// Samples per channel per cycle.
    pub sample_count: usize,
    /// Terminal that starts the channel.
    pub trigger_source: String,
}

/// A clocked or event-driven output started by the master trigger.
///
/// # Contract
///
/// - `load` followed by `start` leaves the device waiting for the trigger
///   edge; it must not produce output before the edge.
/// - `wait_until_done` resolves once the loaded buffer has played out. It may
///   wait forever; callers bound it with a timeout and drop the future.
/// - `stop` leaves outputs at their last commanded level.
#[async_trait]
pub trait OutputChannel: Send {
    /// Identification handshake run once when the channel is opened.
    ///
    /// Devices without an identity query accept by default.
    async fn handshake(&mut self) -> AppResult<()> {
        Ok(())
    }

    /// Apply clock and trigger settings.
    async fn configure(&mut self, config: &ChannelConfig) -> AppResult<()>;

    /// Write one cycle's buffer to the device.
    async fn load(&mut self, buffer: &WaveformBuffer) -> AppResult<()>;

    /// Wait for the start trigger.
    async fn start(&mut self) -> AppResult<()>;

    /// Resolve when the buffer has been fully output.
    async fn wait_until_done(&mut self) -> AppResult<()>;

    async fn stop(&mut self) -> AppResult<()>;

    async fn close(&mut self) -> AppResult<()>;
}

/// Digital line that releases all armed channels at once.
#[async_trait]
pub trait TriggerOutput: Send {
    fn name(&self) -> &str;

    /// Write a sequence of levels to the line.
    async fn write_pattern(&mut self, pattern: &[bool]) -> AppResult<()>;

    /// Emit the master trigger pulse.
    async fn fire(&mut self) -> AppResult<()> {
        self.write_pattern(&MASTER_TRIGGER_PATTERN).await
    }

    async fn close(&mut self) -> AppResult<()> {
        Ok(())
    }
}

/// Event-driven laser controller (octoDAC-style).
#[async_trait]
pub trait LaserController: OutputChannel {
    /// Identity string reported by the device.
    async fn identify(&mut self) -> AppResult<String>;

    /// Drive one laser line at full scale.
    async fn enable(&mut self, line: u8) -> AppResult<()>;

    /// Drive every laser line to zero.
    async fn disable_all(&mut self) -> AppResult<()>;

    /// Reset the DAC output registers.
    async fn clear_registers(&mut self) -> AppResult<()>;
}
