//! Snap and live-preview acquisition on top of the parameter store and the
//! trigger sequencer.
//!
//! Live preview runs cycles back to back. Parameter changes arrive on an
//! `mpsc` channel and are applied only between cycles, so a cycle always
//! plays one consistent bundle. When a change alters the sample clock or the
//! sample count the channels are reconfigured before the next arm.

use tokio::sync::mpsc::{self, error::TryRecvError};
use tracing::{debug, info, warn};

use crate::error::{AppResult, DaqError};
use crate::hardware::ChannelConfig;
use crate::parameter::{ParameterChanges, ParameterStore};
use crate::sequencer::{CycleReport, StopHandle, TriggerSequencer};
use crate::waveform::ChannelRole;

/// Totals of a live preview run.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LiveSummary {
    /// Cycles in which the master trigger was written.
    pub cycles: u64,
    /// Cycles abandoned before the trigger because a channel failed to arm.
    pub aborted: u64,
    pub timeouts: u64,
    pub reconfigurations: u64,
    /// Parameter version of the last bundle that was played.
    pub last_version: u64,
}

/// Owns the store and the sequencer for one microscope.
pub struct AcquisitionController {
    store: ParameterStore,
    sequencer: TriggerSequencer,
    trigger_source: String,
}

impl AcquisitionController {
    pub fn new(
        store: ParameterStore,
        sequencer: TriggerSequencer,
        trigger_source: impl Into<String>,
    ) -> Self {
        Self {
            store,
            sequencer,
            trigger_source: trigger_source.into(),
        }
    }

    pub fn store(&self) -> &ParameterStore {
        &self.store
    }

    pub fn store_mut(&mut self) -> &mut ParameterStore {
        &mut self.store
    }

    pub fn sequencer(&self) -> &TriggerSequencer {
        &self.sequencer
    }

    pub fn stop_handle(&self) -> StopHandle {
        self.sequencer.stop_handle()
    }

    /// Handshake with every device. Channels that fail are reported and
    /// left unavailable.
    pub async fn open(&mut self) -> Vec<(ChannelRole, DaqError)> {
        let failures = self.sequencer.open_all().await;
        for (role, error) in &failures {
            warn!(channel = %role, error = %error, "Channel unavailable after open");
        }
        failures
    }

    /// Configure the channels for the current bundle if they are not already.
    ///
    /// Returns `true` if a configuration was written.
    pub async fn prepare(&mut self) -> AppResult<bool> {
        let bundle = self.store.waveforms();
        let wanted = ChannelConfig {
            clock_rate: bundle.samplerate,
            sample_count: bundle.samples,
            trigger_source: self.trigger_source.clone(),
        };
        if self.sequencer.is_configured_for(&wanted) {
            return Ok(false);
        }
        self.sequencer
            .configure_all(wanted.clock_rate, wanted.sample_count, &wanted.trigger_source)
            .await?;
        Ok(true)
    }

    /// Run a single cycle with the current waveforms.
    pub async fn snap(&mut self) -> AppResult<CycleReport> {
        self.sequencer.stop_handle().reset();
        self.prepare().await?;
        let bundle = self.store.waveforms();
        let report = self.sequencer.run_cycle(&bundle).await?;
        info!(
            version = report.version,
            fired = report.fired,
            timeouts = report.timeouts.len(),
            "Snap finished"
        );
        Ok(report)
    }

    /// Run cycles until the stop handle fires or `max_cycles` triggered
    /// cycles have run.
    ///
    /// Arm failures abort only the current cycle. After as many consecutive
    /// aborted cycles as the escalation threshold the preview gives up with
    /// the last error.
    pub async fn live(
        &mut self,
        changes: &mut mpsc::Receiver<ParameterChanges>,
        max_cycles: Option<u64>,
    ) -> AppResult<LiveSummary> {
        let stop = self.sequencer.stop_handle();
        stop.reset();

        let give_up_after = u64::from(self.sequencer.policy().escalation_threshold.max(1));
        let mut summary = LiveSummary::default();
        let mut consecutive_aborts = 0u64;
        let mut changes_open = true;

        info!(max_cycles = ?max_cycles, "Live preview started");
        loop {
            if stop.is_requested() {
                break;
            }
            if max_cycles.is_some_and(|max| summary.cycles >= max) {
                break;
            }

            if changes_open {
                changes_open = self.drain_changes(changes);
            }
            if self.prepare().await? {
                summary.reconfigurations += 1;
            }

            let bundle = self.store.waveforms();
            match self.sequencer.run_cycle(&bundle).await {
                Ok(report) => {
                    consecutive_aborts = 0;
                    if report.fired {
                        summary.cycles += 1;
                        summary.last_version = report.version;
                    }
                    summary.timeouts += report.timeouts.len() as u64;
                    for role in &report.escalated {
                        warn!(channel = %role, "Channel taken out of service during preview");
                    }
                    if report.stopped {
                        break;
                    }
                }
                Err(e @ DaqError::TriggerSetup { .. }) => {
                    summary.aborted += 1;
                    consecutive_aborts += 1;
                    if consecutive_aborts >= give_up_after {
                        warn!(error = %e, aborted = consecutive_aborts, "Giving up live preview");
                        return Err(e);
                    }
                    warn!(error = %e, "Cycle aborted before trigger");
                }
                Err(e) => return Err(e),
            }

            tokio::task::yield_now().await;
        }

        info!(
            cycles = summary.cycles,
            aborted = summary.aborted,
            timeouts = summary.timeouts,
            "Live preview stopped"
        );
        Ok(summary)
    }

    /// Apply every queued change event. Returns `false` once all senders are
    /// gone.
    fn drain_changes(&mut self, changes: &mut mpsc::Receiver<ParameterChanges>) -> bool {
        loop {
            match changes.try_recv() {
                Ok(event) => match self.store.apply_changes(&event) {
                    Ok(applied) => debug!(count = applied.len(), "Applied parameter changes"),
                    Err(e) => warn!(error = %e, "Rejected parameter changes, keeping previous waveforms"),
                },
                Err(TryRecvError::Empty) => return true,
                Err(TryRecvError::Disconnected) => return false,
            }
        }
    }

    /// Stop and close every channel.
    pub async fn shutdown(&mut self) -> AppResult<()> {
        self.sequencer.close_all().await
    }
}
