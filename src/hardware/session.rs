//! Lifecycle wrapper around one output channel.
//!
//! ```text
//! Unconfigured ──configure──▶ Configured ──load──▶ Armed ──start──▶ Running
//!                                 ▲                  │                 │
//!                                 │                stop              stop
//!                             configure              ▼                 ▼
//!                                 └────────────────  Idle ◀────────────┘
//!                                                     │ load (config kept)
//!                                                     ▼
//!                                                   Armed
//! Idle/Configured/Unconfigured ──close──▶ Closed
//! handshake failure / timeout escalation ──▶ Unavailable ──reopen──▶ Unconfigured
//! ```

use std::fmt;
use std::time::Duration;

use tracing::{debug, error, info, warn};

use super::capabilities::{ChannelConfig, OutputChannel};
use crate::error::{AppResult, DaqError};
use crate::waveform::{ChannelRole, WaveformBuffer};

/// Lifecycle state of a [`ChannelSession`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Unconfigured,
    Configured,
    Armed,
    Running,
    Idle,
    Closed,
    Unavailable,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// One physical output and the state machine guarding it.
///
/// Stopping a device is asynchronous, so dropping an armed or running session
/// cannot stop it; it only logs a warning. Call [`shutdown`](Self::shutdown)
/// (or [`TriggerSequencer::close_all`](crate::sequencer::TriggerSequencer::close_all))
/// before letting a session go.
pub struct ChannelSession {
    role: ChannelRole,
    device: Box<dyn OutputChannel>,
    state: SessionState,
    config: Option<ChannelConfig>,
    consecutive_timeouts: u32,
}

impl ChannelSession {
    pub fn new(role: ChannelRole, device: Box<dyn OutputChannel>) -> Self {
        Self {
            role,
            device,
            state: SessionState::Unconfigured,
            config: None,
            consecutive_timeouts: 0,
        }
    }

    pub fn role(&self) -> ChannelRole {
        self.role
    }

    pub fn name(&self) -> &'static str {
        self.role.as_str()
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    pub fn config(&self) -> Option<&ChannelConfig> {
        self.config.as_ref()
    }

    pub fn consecutive_timeouts(&self) -> u32 {
        self.consecutive_timeouts
    }

    pub fn is_available(&self) -> bool {
        self.state != SessionState::Unavailable
    }

    /// Run the device handshake. A failed handshake leaves the session
    /// `Unavailable` until [`reopen`](Self::reopen) succeeds.
    pub async fn open(&mut self) -> AppResult<()> {
        match self.device.handshake().await {
            Ok(()) => {
                info!(channel = self.name(), "Channel opened");
                Ok(())
            }
            Err(e) => {
                error!(channel = self.name(), error = %e, "Channel handshake failed");
                self.state = SessionState::Unavailable;
                Err(e)
            }
        }
    }

    /// Handshake again and return to `Unconfigured` with the timeout counter
    /// cleared.
    pub async fn reopen(&mut self) -> AppResult<()> {
        if matches!(self.state, SessionState::Armed | SessionState::Running) {
            return Err(self.invalid("reopen"));
        }
        self.state = SessionState::Unconfigured;
        self.config = None;
        self.consecutive_timeouts = 0;
        self.open().await
    }

    /// Take the channel out of service.
    pub fn mark_unavailable(&mut self, reason: &str) {
        error!(channel = self.name(), reason, "Channel marked unavailable");
        self.state = SessionState::Unavailable;
    }

    pub async fn configure(&mut self, config: &ChannelConfig) -> AppResult<()> {
        match self.state {
            SessionState::Unconfigured | SessionState::Configured | SessionState::Idle => {}
            SessionState::Unavailable => return Err(self.unavailable()),
            _ => return Err(self.invalid("configure")),
        }

        self.device.configure(config).await?;
        self.config = Some(config.clone());
        self.state = SessionState::Configured;
        debug!(
            channel = self.name(),
            clock_rate = config.clock_rate,
            samples = config.sample_count,
            trigger = %config.trigger_source,
            "Channel configured"
        );
        Ok(())
    }

    /// Write the cycle buffer. Legal in `Configured`, or `Idle` after a
    /// completed cycle.
    pub async fn load(&mut self, buffer: &WaveformBuffer) -> AppResult<()> {
        match self.state {
            SessionState::Configured | SessionState::Idle => {}
            SessionState::Unavailable => return Err(self.unavailable()),
            _ => return Err(self.invalid("load")),
        }

        if let (Some(config), Some(samples)) = (&self.config, buffer.sample_count()) {
            if samples != config.sample_count {
                return Err(DaqError::Configuration(format!(
                    "{} buffer has {samples} samples, channel is configured for {}",
                    self.name(),
                    config.sample_count
                )));
            }
        }

        self.device.load(buffer).await?;
        self.state = SessionState::Armed;
        debug!(channel = self.name(), buffer = %buffer, "Buffer loaded");
        Ok(())
    }

    /// Armed → Running: the device now waits for the trigger edge.
    pub async fn start(&mut self) -> AppResult<()> {
        match self.state {
            SessionState::Armed => {}
            SessionState::Unavailable => return Err(self.unavailable()),
            _ => return Err(self.invalid("start")),
        }

        self.device.start().await?;
        self.state = SessionState::Running;
        Ok(())
    }

    /// Wait for the buffer to play out, giving up after `timeout`.
    ///
    /// Returns `Ok(false)` on timeout and counts it; a completion resets the
    /// count.
    pub async fn wait_until_done(&mut self, timeout: Duration) -> AppResult<bool> {
        match self.state {
            SessionState::Running => {}
            SessionState::Unavailable => return Err(self.unavailable()),
            _ => return Err(self.invalid("wait")),
        }

        match tokio::time::timeout(timeout, self.device.wait_until_done()).await {
            Ok(result) => {
                result?;
                self.consecutive_timeouts = 0;
                Ok(true)
            }
            Err(_) => {
                self.consecutive_timeouts += 1;
                warn!(
                    channel = self.name(),
                    timeout_ms = timeout.as_millis() as u64,
                    consecutive = self.consecutive_timeouts,
                    "Channel did not complete in time"
                );
                Ok(false)
            }
        }
    }

    /// Armed/Running → Idle. A no-op in every other state.
    pub async fn stop(&mut self) -> AppResult<()> {
        if !matches!(self.state, SessionState::Armed | SessionState::Running) {
            return Ok(());
        }
        self.device.stop().await?;
        self.state = SessionState::Idle;
        debug!(channel = self.name(), "Channel stopped");
        Ok(())
    }

    /// Release the device. Rejected while armed or running.
    pub async fn close(&mut self) -> AppResult<()> {
        match self.state {
            SessionState::Closed => return Ok(()),
            SessionState::Armed | SessionState::Running => return Err(self.invalid("close")),
            _ => {}
        }
        self.device.close().await?;
        self.state = SessionState::Closed;
        info!(channel = self.name(), "Channel closed");
        Ok(())
    }

    /// Stop if needed, then close.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        self.stop().await?;
        self.close().await
    }

    fn invalid(&self, operation: &'static str) -> DaqError {
        DaqError::InvalidTransition {
            channel: self.name().to_owned(),
            state: self.state.to_string(),
            operation,
        }
    }

    fn unavailable(&self) -> DaqError {
        DaqError::ChannelUnavailable(self.name().to_owned())
    }
}

impl Drop for ChannelSession {
    fn drop(&mut self) {
        if matches!(self.state, SessionState::Armed | SessionState::Running) {
            warn!(
                channel = self.name(),
                state = %self.state,
                "Channel session dropped without shutdown"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::hardware::mock::{MockChannel, TriggerBus, MOCK_IDENTITY};
    use ndarray::Array2;

    fn config(samples: usize) -> ChannelConfig {
        ChannelConfig {
            clock_rate: 1000.0,
            sample_count: samples,
            trigger_source: "/Dev1/PFI0".into(),
        }
    }

    fn session(bus: &TriggerBus) -> ChannelSession {
        ChannelSession::new(
            ChannelRole::GalvoEtl,
            Box::new(MockChannel::new("galvo_etl", bus.clone()).0),
        )
    }

    fn buffer(samples: usize) -> WaveformBuffer {
        WaveformBuffer::Dense(Array2::zeros((4, samples)))
    }

    #[tokio::test]
    async fn test_full_lifecycle() {
        let bus = TriggerBus::new();
        let mut session = session(&bus);
        session.open().await.unwrap();
        assert_eq!(session.state(), SessionState::Unconfigured);

        session.configure(&config(100)).await.unwrap();
        assert_eq!(session.state(), SessionState::Configured);
        session.load(&buffer(100)).await.unwrap();
        assert_eq!(session.state(), SessionState::Armed);
        session.start().await.unwrap();
        assert_eq!(session.state(), SessionState::Running);

        bus.fire();
        assert!(session.wait_until_done(Duration::from_secs(1)).await.unwrap());
        assert_eq!(session.state(), SessionState::Running);

        session.stop().await.unwrap();
        assert_eq!(session.state(), SessionState::Idle);

        // configuration survives a completed cycle
        session.load(&buffer(100)).await.unwrap();
        session.stop().await.unwrap();
        session.close().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
    }

    #[tokio::test]
    async fn test_load_requires_configuration() {
        let bus = TriggerBus::new();
        let mut session = session(&bus);
        let err = session.load(&buffer(10)).await.unwrap_err();
        assert!(matches!(err, DaqError::InvalidTransition { operation: "load", .. }));
    }

    #[tokio::test]
    async fn test_reload_while_armed_rejected() {
        let bus = TriggerBus::new();
        let mut session = session(&bus);
        session.configure(&config(10)).await.unwrap();
        session.load(&buffer(10)).await.unwrap();

        assert!(session.load(&buffer(10)).await.is_err());
        assert!(session.configure(&config(10)).await.is_err());
        assert!(session.close().await.is_err());
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_sample_count_mismatch() {
        let bus = TriggerBus::new();
        let mut session = session(&bus);
        session.configure(&config(10)).await.unwrap();
        let err = session.load(&buffer(20)).await.unwrap_err();
        assert!(matches!(err, DaqError::Configuration(_)));
        assert_eq!(session.state(), SessionState::Configured);
    }

    #[tokio::test]
    async fn test_stop_is_idempotent() {
        let bus = TriggerBus::new();
        let mut session = session(&bus);
        session.stop().await.unwrap();
        assert_eq!(session.state(), SessionState::Unconfigured);

        session.configure(&config(10)).await.unwrap();
        session.load(&buffer(10)).await.unwrap();
        session.stop().await.unwrap();
        session.stop().await.unwrap();
        assert_eq!(session.state(), SessionState::Idle);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_counts_and_resets() {
        let bus = TriggerBus::new();
        let (device, handle) = MockChannel::new("laser", bus.clone());
        let mut session = ChannelSession::new(ChannelRole::Laser, Box::new(device));
        session.configure(&config(10)).await.unwrap();

        handle.set_completes(false);
        for expected in 1..=2 {
            session.load(&buffer(10)).await.unwrap();
            session.start().await.unwrap();
            bus.fire();
            assert!(!session.wait_until_done(Duration::from_millis(50)).await.unwrap());
            assert_eq!(session.consecutive_timeouts(), expected);
            session.stop().await.unwrap();
        }

        handle.set_completes(true);
        session.load(&buffer(10)).await.unwrap();
        session.start().await.unwrap();
        bus.fire();
        assert!(session.wait_until_done(Duration::from_millis(50)).await.unwrap());
        assert_eq!(session.consecutive_timeouts(), 0);
        session.stop().await.unwrap();
    }

    #[tokio::test]
    async fn test_handshake_failure_and_reopen() {
        let bus = TriggerBus::new();
        let (device, handle) = MockChannel::new("laser", bus.clone());
        handle.set_identity("Arduino");
        let mut session = ChannelSession::new(ChannelRole::Laser, Box::new(device));

        let err = session.open().await.unwrap_err();
        assert!(matches!(err, DaqError::DeviceHandshake { .. }));
        assert_eq!(session.state(), SessionState::Unavailable);
        assert!(matches!(
            session.configure(&config(10)).await,
            Err(DaqError::ChannelUnavailable(_))
        ));

        handle.set_identity(MOCK_IDENTITY);
        session.reopen().await.unwrap();
        assert_eq!(session.state(), SessionState::Unconfigured);
        session.configure(&config(10)).await.unwrap();
    }

    #[tokio::test]
    async fn test_shutdown_stops_running_session() {
        let bus = TriggerBus::new();
        let mut session = session(&bus);
        session.configure(&config(10)).await.unwrap();
        session.load(&buffer(10)).await.unwrap();
        session.start().await.unwrap();

        session.shutdown().await.unwrap();
        assert_eq!(session.state(), SessionState::Closed);
    }
}
