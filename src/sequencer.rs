//! Readiness-then-fire sequencing across channel sessions.
//!
//! One cycle walks the sequencer through
//!
//! ```text
//! Idle ─configure_all─▶ AllConfigured ─arm─▶ AllArmed ─fire─▶ Fired ─wait─▶ Completing ─stop─▶ Idle
//! ```
//!
//! The master trigger is written only after every session reports armed. If
//! any `load` or `start` fails, the sessions armed so far are stopped
//! (best-effort) and the cycle ends with [`DaqError::TriggerSetup`] without a
//! trigger edge. Channel timeouts do not abort a cycle; they are reported as
//! [`TimeoutSignal`]s and escalate a channel to `Unavailable` once the
//! configured threshold of consecutive timeouts is reached.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::error::{AppResult, DaqError};
use crate::hardware::{ChannelConfig, ChannelSession, SessionState, TriggerOutput};
use crate::waveform::{ChannelRole, WaveformBundle};

/// Cycle phase of the [`TriggerSequencer`].
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SequencerState {
    Idle,
    AllConfigured,
    AllArmed,
    Fired,
    Completing,
}

/// A channel that did not complete within the wait timeout.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutSignal {
    pub channel: ChannelRole,
    /// Consecutive timeouts on this channel, this one included.
    pub consecutive: u32,
}

/// Outcome of one cycle.
#[derive(Debug, Clone, Default)]
pub struct CycleReport {
    /// Version of the bundle that was played.
    pub version: u64,
    /// Whether the master trigger was written.
    pub fired: bool,
    /// Whether an operator stop cut the cycle short.
    pub stopped: bool,
    pub completed: Vec<ChannelRole>,
    pub timeouts: Vec<TimeoutSignal>,
    /// Channels taken out of service at the end of this cycle.
    pub escalated: Vec<ChannelRole>,
    /// Non-fatal device errors seen while waiting or stopping.
    pub failures: Vec<String>,
    pub elapsed: Duration,
}

impl CycleReport {
    /// Fired, not stopped, and every channel completed.
    pub fn is_clean(&self) -> bool {
        self.fired && !self.stopped && self.timeouts.is_empty() && self.failures.is_empty()
    }
}

/// Cloneable operator stop. Idempotent; deliverable from any task.
#[derive(Clone)]
pub struct StopHandle {
    requested: Arc<watch::Sender<bool>>,
}

impl StopHandle {
    fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self {
            requested: Arc::new(tx),
        }
    }

    /// Request a stop. Outputs stay at their last commanded level.
    pub fn stop(&self) {
        self.requested.send_replace(true);
    }

    pub fn is_requested(&self) -> bool {
        *self.requested.borrow()
    }

    /// Clear a previous request before starting a new acquisition.
    pub fn reset(&self) {
        self.requested.send_replace(false);
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.requested.subscribe()
    }
}

/// Resolves once a stop has been requested.
async fn stop_requested(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
    }
}

/// Wait and escalation limits.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SequencerPolicy {
    /// Per-channel wait after the trigger.
    pub wait_timeout: Duration,
    /// Consecutive timeouts after which a channel becomes unavailable.
    pub escalation_threshold: u32,
}

impl Default for SequencerPolicy {
    fn default() -> Self {
        Self {
            wait_timeout: Duration::from_millis(1000),
            escalation_threshold: 3,
        }
    }
}

/// Drives every channel session through configure, arm, fire, wait and stop.
///
/// A cycle future dropped mid-wait leaves its sessions running. Run
/// [`close_all`](Self::close_all) before dropping the sequencer; `Drop` can
/// only report the channels that are still armed.
pub struct TriggerSequencer {
    sessions: Vec<ChannelSession>,
    trigger: Box<dyn TriggerOutput>,
    policy: SequencerPolicy,
    state: SequencerState,
    config: Option<ChannelConfig>,
    stop: StopHandle,
}

impl TriggerSequencer {
    /// `sessions` are armed in the given order and stopped in reverse.
    pub fn new(
        sessions: Vec<ChannelSession>,
        trigger: Box<dyn TriggerOutput>,
        policy: SequencerPolicy,
    ) -> Self {
        Self {
            sessions,
            trigger,
            policy,
            state: SequencerState::Idle,
            config: None,
            stop: StopHandle::new(),
        }
    }

    pub fn state(&self) -> SequencerState {
        self.state
    }

    pub fn policy(&self) -> SequencerPolicy {
        self.policy
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.stop.clone()
    }

    pub fn sessions(&self) -> &[ChannelSession] {
        &self.sessions
    }

    pub fn session(&self, role: ChannelRole) -> Option<&ChannelSession> {
        self.sessions.iter().find(|s| s.role() == role)
    }

    /// Configuration shared by all sessions, once configured.
    pub fn config(&self) -> Option<&ChannelConfig> {
        self.config.as_ref()
    }

    /// Run the identification handshake on every session.
    ///
    /// Failed channels are marked unavailable and returned; the rest stay
    /// usable.
    pub async fn open_all(&mut self) -> Vec<(ChannelRole, DaqError)> {
        let mut failures = Vec::new();
        for session in &mut self.sessions {
            if let Err(e) = session.open().await {
                failures.push((session.role(), e));
            }
        }
        failures
    }

    /// Configure every available session with one clock and trigger source.
    pub async fn configure_all(
        &mut self,
        clock_rate: f64,
        sample_count: usize,
        trigger_source: &str,
    ) -> AppResult<()> {
        if !matches!(self.state, SequencerState::Idle | SequencerState::AllConfigured) {
            return Err(DaqError::InvalidTransition {
                channel: "sequencer".into(),
                state: format!("{:?}", self.state),
                operation: "configure",
            });
        }

        let config = ChannelConfig {
            clock_rate,
            sample_count,
            trigger_source: trigger_source.to_owned(),
        };

        self.config = None;
        self.state = SequencerState::Idle;
        for session in &mut self.sessions {
            if !session.is_available() {
                warn!(channel = session.name(), "Skipping unavailable channel during configure");
                continue;
            }
            session.configure(&config).await?;
        }

        info!(
            clock_rate,
            sample_count,
            trigger = trigger_source,
            "All channels configured"
        );
        self.config = Some(config);
        self.state = SequencerState::AllConfigured;
        Ok(())
    }

    /// Whether the sessions already run with exactly this clock, sample
    /// count and trigger source.
    pub fn is_configured_for(&self, config: &ChannelConfig) -> bool {
        self.config.as_ref() == Some(config)
    }

    /// Arm every session with `bundle`, fire the master trigger, wait for all
    /// channels and stop them.
    ///
    /// # Errors
    ///
    /// - `Configuration` if the sequencer is not configured for the bundle's
    ///   sample clock and sample count.
    /// - `TriggerSetup` if any session fails to arm or the trigger write
    ///   fails; no trigger edge has been written and all sessions are stopped.
    pub async fn run_cycle(&mut self, bundle: &WaveformBundle) -> AppResult<CycleReport> {
        let config = self
            .config
            .as_ref()
            .ok_or_else(|| DaqError::Configuration("sequencer is not configured".into()))?;
        if config.sample_count != bundle.samples || config.clock_rate != bundle.samplerate {
            return Err(DaqError::Configuration(format!(
                "bundle has {} samples at {} Hz, channels are configured for {} at {} Hz",
                bundle.samples, bundle.samplerate, config.sample_count, config.clock_rate
            )));
        }

        let started = Instant::now();
        let mut report = CycleReport {
            version: bundle.version,
            ..CycleReport::default()
        };

        if self.stop.is_requested() {
            report.stopped = true;
            return Ok(report);
        }

        // Arm
        for idx in 0..self.sessions.len() {
            let session = &mut self.sessions[idx];
            let buffer = bundle.buffer(session.role());
            let armed = match session.load(buffer).await {
                Ok(()) => session.start().await,
                Err(e) => Err(e),
            };

            if let Err(e) = armed {
                let channel = session.name().to_owned();
                warn!(channel = %channel, error = %e, "Arming failed, rolling back");
                self.rollback(idx + 1).await;
                return Err(DaqError::TriggerSetup {
                    channel,
                    reason: e.to_string(),
                });
            }
        }
        self.state = SequencerState::AllArmed;

        if self.stop.is_requested() {
            self.rollback(self.sessions.len()).await;
            report.stopped = true;
            report.elapsed = started.elapsed();
            return Ok(report);
        }

        // Fire
        if let Err(e) = self.trigger.fire().await {
            let channel = self.trigger.name().to_owned();
            error!(channel = %channel, error = %e, "Master trigger write failed");
            self.rollback(self.sessions.len()).await;
            return Err(DaqError::TriggerSetup {
                channel,
                reason: e.to_string(),
            });
        }
        self.state = SequencerState::Fired;
        report.fired = true;
        debug!(version = bundle.version, "Master trigger fired");

        // Wait
        self.state = SequencerState::Completing;
        let timeout = self.policy.wait_timeout;
        let threshold = self.policy.escalation_threshold;
        let mut stop_rx = self.stop.subscribe();
        let mut escalate = Vec::new();

        for (idx, session) in self.sessions.iter_mut().enumerate() {
            let outcome = tokio::select! {
                biased;
                _ = stop_requested(&mut stop_rx) => None,
                result = session.wait_until_done(timeout) => Some(result),
            };

            match outcome {
                None => {
                    info!("Operator stop during cycle");
                    report.stopped = true;
                    break;
                }
                Some(Ok(true)) => report.completed.push(session.role()),
                Some(Ok(false)) => {
                    let consecutive = session.consecutive_timeouts();
                    report.timeouts.push(TimeoutSignal {
                        channel: session.role(),
                        consecutive,
                    });
                    if threshold > 0 && consecutive >= threshold {
                        escalate.push(idx);
                    }
                }
                Some(Err(e)) => {
                    warn!(channel = session.name(), error = %e, "Wait failed");
                    report.failures.push(format!("{}: {e}", session.name()));
                }
            }
        }

        // Stop in reverse arm order
        for session in self.sessions.iter_mut().rev() {
            if let Err(e) = session.stop().await {
                warn!(channel = session.name(), error = %e, "Stop failed");
                report.failures.push(format!("{}: {e}", session.name()));
            }
        }

        for idx in escalate {
            let session = &mut self.sessions[idx];
            let reason = format!("{} consecutive timeouts", session.consecutive_timeouts());
            session.mark_unavailable(&reason);
            report.escalated.push(session.role());
        }

        self.state = SequencerState::Idle;
        report.elapsed = started.elapsed();
        debug!(
            version = report.version,
            completed = report.completed.len(),
            timeouts = report.timeouts.len(),
            elapsed_ms = report.elapsed.as_millis() as u64,
            "Cycle finished"
        );
        Ok(report)
    }

    /// Stop the first `count` sessions in reverse order. Failures are logged
    /// and dropped.
    async fn rollback(&mut self, count: usize) {
        for session in self.sessions[..count].iter_mut().rev() {
            if let Err(e) = session.stop().await {
                warn!(channel = session.name(), error = %e, "Rollback stop failed");
            }
        }
        self.state = SequencerState::Idle;
    }

    /// Stop every session in reverse arm order.
    pub async fn stop_all(&mut self) -> AppResult<()> {
        let mut errors = Vec::new();
        for session in self.sessions.iter_mut().rev() {
            if let Err(e) = session.stop().await {
                errors.push(e);
            }
        }
        self.state = SequencerState::Idle;
        if errors.is_empty() {
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(errors))
        }
    }

    /// Stop and close every session, then release the trigger line.
    pub async fn close_all(&mut self) -> AppResult<()> {
        let mut errors = Vec::new();
        for session in self.sessions.iter_mut().rev() {
            if let Err(e) = session.shutdown().await {
                error!(channel = session.name(), error = %e, "Channel shutdown failed");
                errors.push(e);
            }
        }
        if let Err(e) = self.trigger.close().await {
            errors.push(e);
        }

        self.config = None;
        self.state = SequencerState::Idle;
        if errors.is_empty() {
            info!("All channels closed");
            Ok(())
        } else {
            Err(DaqError::ShutdownFailed(errors))
        }
    }

    /// Bring an unavailable channel back: handshake again and re-apply the
    /// current configuration.
    pub async fn reopen(&mut self, role: ChannelRole) -> AppResult<()> {
        let config = self.config.clone();
        let session = self
            .sessions
            .iter_mut()
            .find(|s| s.role() == role)
            .ok_or_else(|| DaqError::ChannelUnavailable(role.to_string()))?;

        session.reopen().await?;
        if let Some(config) = config {
            session.configure(&config).await?;
        }
        info!(channel = %role, "Channel reopened");
        Ok(())
    }
}

impl Drop for TriggerSequencer {
    fn drop(&mut self) {
        let armed: Vec<&str> = self
            .sessions
            .iter()
            .filter(|s| matches!(s.state(), SessionState::Armed | SessionState::Running))
            .map(ChannelSession::name)
            .collect();
        if !armed.is_empty() {
            warn!(channels = ?armed, "Sequencer dropped with armed channels, outputs were not stopped");
        }
    }
}

#[cfg(test)]
mod tests {
    use tracing_test::traced_test;

    use super::*;
    use crate::hardware::mock::{
        MockChannel, MockChannelHandle, MockJournal, MockTrigger, MockTriggerHandle, TriggerBus,
    };
    use crate::parameter::{ParameterKey, ParameterSnapshot};
    use crate::waveform::{ChannelLayout, WaveformAssembler};

    struct Rig {
        sequencer: TriggerSequencer,
        channels: Vec<MockChannelHandle>,
        trigger: MockTriggerHandle,
        journal: MockJournal,
        bundle: WaveformBundle,
    }

    fn rig(policy: SequencerPolicy) -> Rig {
        let bus = TriggerBus::new();
        let journal = MockJournal::new();
        let mut sessions = Vec::new();
        let mut channels = Vec::new();
        for role in ChannelRole::ALL {
            let (device, handle) = MockChannel::new(role.as_str(), bus.clone());
            sessions.push(ChannelSession::new(
                role,
                Box::new(device.with_journal(journal.clone())),
            ));
            channels.push(handle);
        }
        let (trigger, trigger_handle) = MockTrigger::new(bus);
        let sequencer = TriggerSequencer::new(
            sessions,
            Box::new(trigger.with_journal(journal.clone())),
            policy,
        );

        let snapshot = ParameterSnapshot::new("488 nm", "1x")
            .with(ParameterKey::Samplerate, 1000.0)
            .with(ParameterKey::Sweeptime, 0.1);
        let bundle = WaveformAssembler::new(ChannelLayout::default())
            .recompute(&snapshot)
            .unwrap();

        Rig {
            sequencer,
            channels,
            trigger: trigger_handle,
            journal,
            bundle,
        }
    }

    #[tokio::test]
    async fn test_cycle_order() {
        let mut rig = rig(SequencerPolicy::default());
        assert!(rig.sequencer.open_all().await.is_empty());
        rig.sequencer.configure_all(1000.0, 100, "/Dev1/PFI0").await.unwrap();
        rig.journal.clear();

        let report = rig.sequencer.run_cycle(&rig.bundle).await.unwrap();
        assert!(report.is_clean());
        assert_eq!(report.completed, ChannelRole::ALL.to_vec());
        assert_eq!(rig.trigger.fired_count(), 1);
        assert_eq!(rig.sequencer.state(), SequencerState::Idle);

        let fire = rig.journal.position("master_trigger:fire").unwrap();
        for role in ChannelRole::ALL {
            assert!(rig.journal.position(&format!("{role}:start")).unwrap() < fire);
        }
        let stops: Vec<String> = rig
            .journal
            .entries()
            .into_iter()
            .filter(|e| e.ends_with(":stop"))
            .collect();
        assert_eq!(stops, vec!["laser:stop", "galvo_etl:stop", "camera:stop"]);
    }

    #[tokio::test]
    async fn test_arm_failure_never_fires() {
        let mut rig = rig(SequencerPolicy::default());
        rig.sequencer.configure_all(1000.0, 100, "/Dev1/PFI0").await.unwrap();
        rig.channels[2].fail_next_start();

        let err = rig.sequencer.run_cycle(&rig.bundle).await.unwrap_err();
        match err {
            DaqError::TriggerSetup { channel, .. } => assert_eq!(channel, "laser"),
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(rig.trigger.fired_count(), 0);
        for session in rig.sequencer.sessions() {
            assert!(!matches!(
                session.state(),
                SessionState::Armed | SessionState::Running
            ));
        }

        // the next cycle works without reconfiguring
        let report = rig.sequencer.run_cycle(&rig.bundle).await.unwrap();
        assert!(report.fired);
        assert_eq!(rig.trigger.fired_count(), 1);
    }

    #[tokio::test]
    async fn test_rollback_failures_are_not_propagated() {
        let mut rig = rig(SequencerPolicy::default());
        rig.sequencer.configure_all(1000.0, 100, "/Dev1/PFI0").await.unwrap();
        rig.channels[0].fail_next_stop();
        rig.channels[2].fail_next_load();

        let err = rig.sequencer.run_cycle(&rig.bundle).await.unwrap_err();
        assert!(matches!(err, DaqError::TriggerSetup { .. }));
        assert_eq!(rig.channels[1].stop_count(), 1);
    }

    #[tokio::test]
    async fn test_trigger_failure_rolls_back() {
        let mut rig = rig(SequencerPolicy::default());
        rig.sequencer.configure_all(1000.0, 100, "/Dev1/PFI0").await.unwrap();
        rig.trigger.fail_next_fire();

        let err = rig.sequencer.run_cycle(&rig.bundle).await.unwrap_err();
        match err {
            DaqError::TriggerSetup { channel, .. } => assert_eq!(channel, "master_trigger"),
            other => panic!("unexpected error: {other}"),
        }
        assert!(rig.channels.iter().all(|c| c.stop_count() == 1));
    }

    #[tokio::test]
    async fn test_unconfigured_and_mismatched_cycles_rejected() {
        let mut rig = rig(SequencerPolicy::default());
        assert!(matches!(
            rig.sequencer.run_cycle(&rig.bundle).await,
            Err(DaqError::Configuration(_))
        ));

        rig.sequencer.configure_all(1000.0, 250, "/Dev1/PFI0").await.unwrap();
        assert!(!rig.sequencer.is_configured_for(&ChannelConfig {
            clock_rate: 1000.0,
            sample_count: 100,
            trigger_source: "/Dev1/PFI0".into(),
        }));
        assert!(matches!(
            rig.sequencer.run_cycle(&rig.bundle).await,
            Err(DaqError::Configuration(_))
        ));
        assert_eq!(rig.trigger.fired_count(), 0);
    }

    #[tokio::test]
    async fn test_clock_mismatch_rejected_at_equal_sample_count() {
        let mut rig = rig(SequencerPolicy::default());
        rig.sequencer.configure_all(2000.0, 100, "/Dev1/PFI0").await.unwrap();
        assert!(!rig.sequencer.is_configured_for(&ChannelConfig {
            clock_rate: 1000.0,
            sample_count: 100,
            trigger_source: "/Dev1/PFI0".into(),
        }));

        assert!(matches!(
            rig.sequencer.run_cycle(&rig.bundle).await,
            Err(DaqError::Configuration(_))
        ));
        assert_eq!(rig.trigger.fired_count(), 0);

        rig.sequencer.configure_all(1000.0, 100, "/Dev1/PFI0").await.unwrap();
        assert!(rig.sequencer.is_configured_for(&ChannelConfig {
            clock_rate: 1000.0,
            sample_count: 100,
            trigger_source: "/Dev1/PFI0".into(),
        }));
        assert!(rig.sequencer.run_cycle(&rig.bundle).await.unwrap().fired);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeouts_recorded_and_escalated() {
        let policy = SequencerPolicy {
            wait_timeout: Duration::from_millis(200),
            escalation_threshold: 2,
        };
        let mut rig = rig(policy);
        rig.sequencer.configure_all(1000.0, 100, "/Dev1/PFI0").await.unwrap();
        rig.channels[1].set_completes(false);

        let first = rig.sequencer.run_cycle(&rig.bundle).await.unwrap();
        assert_eq!(
            first.timeouts,
            vec![TimeoutSignal {
                channel: ChannelRole::GalvoEtl,
                consecutive: 1
            }]
        );
        // a timeout does not block the channels after it
        assert_eq!(first.completed, vec![ChannelRole::Camera, ChannelRole::Laser]);
        assert!(first.escalated.is_empty());

        let second = rig.sequencer.run_cycle(&rig.bundle).await.unwrap();
        assert_eq!(second.escalated, vec![ChannelRole::GalvoEtl]);
        assert_eq!(
            rig.sequencer.session(ChannelRole::GalvoEtl).unwrap().state(),
            SessionState::Unavailable
        );

        let err = rig.sequencer.run_cycle(&rig.bundle).await.unwrap_err();
        assert!(matches!(err, DaqError::TriggerSetup { .. }));
        assert_eq!(rig.trigger.fired_count(), 2);

        rig.channels[1].set_completes(true);
        rig.sequencer.reopen(ChannelRole::GalvoEtl).await.unwrap();
        let report = rig.sequencer.run_cycle(&rig.bundle).await.unwrap();
        assert!(report.is_clean());
    }

    #[tokio::test(start_paused = true)]
    async fn test_operator_stop_during_wait() {
        let mut rig = rig(SequencerPolicy {
            wait_timeout: Duration::from_secs(60),
            escalation_threshold: 3,
        });
        rig.sequencer.configure_all(1000.0, 100, "/Dev1/PFI0").await.unwrap();
        rig.channels[0].set_completes(false);

        let stop = rig.sequencer.stop_handle();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(50)).await;
            stop.stop();
            stop.stop();
        });

        let report = rig.sequencer.run_cycle(&rig.bundle).await.unwrap();
        assert!(report.fired);
        assert!(report.stopped);
        assert!(report.timeouts.is_empty());
        assert!(rig.channels.iter().all(|c| c.stop_count() == 1));
        assert_eq!(rig.sequencer.state(), SequencerState::Idle);
    }

    #[tokio::test]
    async fn test_pending_stop_skips_arming() {
        let mut rig = rig(SequencerPolicy::default());
        rig.sequencer.configure_all(1000.0, 100, "/Dev1/PFI0").await.unwrap();
        rig.sequencer.stop_handle().stop();

        let report = rig.sequencer.run_cycle(&rig.bundle).await.unwrap();
        assert!(report.stopped);
        assert!(!report.fired);
        assert!(rig.channels.iter().all(|c| c.load_count() == 0));

        rig.sequencer.stop_handle().reset();
        assert!(rig.sequencer.run_cycle(&rig.bundle).await.unwrap().fired);
    }

    #[tokio::test(start_paused = true)]
    #[traced_test]
    async fn test_drop_mid_cycle_reports_armed_channels() {
        let mut rig = rig(SequencerPolicy {
            wait_timeout: Duration::from_secs(60),
            escalation_threshold: 3,
        });
        rig.sequencer.configure_all(1000.0, 100, "/Dev1/PFI0").await.unwrap();
        rig.channels[0].set_completes(false);

        let cycle = tokio::time::timeout(
            Duration::from_millis(20),
            rig.sequencer.run_cycle(&rig.bundle),
        )
        .await;
        assert!(cycle.is_err());
        assert!(rig
            .sequencer
            .sessions()
            .iter()
            .all(|s| s.state() == SessionState::Running));

        drop(rig);
        assert!(logs_contain("Sequencer dropped with armed channels"));
        assert!(logs_contain("galvo_etl"));
    }

    #[tokio::test]
    #[traced_test]
    async fn test_drop_after_close_is_quiet() {
        let mut rig = rig(SequencerPolicy::default());
        rig.sequencer.configure_all(1000.0, 100, "/Dev1/PFI0").await.unwrap();
        rig.sequencer.run_cycle(&rig.bundle).await.unwrap();
        rig.sequencer.close_all().await.unwrap();

        drop(rig);
        assert!(!logs_contain("Sequencer dropped with armed channels"));
    }

    #[tokio::test]
    async fn test_close_all() {
        let mut rig = rig(SequencerPolicy::default());
        rig.sequencer.configure_all(1000.0, 100, "/Dev1/PFI0").await.unwrap();
        rig.sequencer.run_cycle(&rig.bundle).await.unwrap();
        rig.sequencer.close_all().await.unwrap();

        assert!(rig
            .sequencer
            .sessions()
            .iter()
            .all(|s| s.state() == SessionState::Closed));
        assert!(rig.sequencer.config().is_none());
    }
}
