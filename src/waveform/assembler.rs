//! Turns a parameter snapshot into the per-channel buffers of one cycle.

use std::collections::BTreeMap;
use std::fmt;

use ndarray::Array2;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::buffer::{CounterPulse, Truncation, WaveformBuffer, Waypoint, WaypointList, WAYPOINT_CAPACITY};
use super::functions::{periodic_sweep, ramp, sample_count, single_pulse};
use crate::error::{AppResult, DaqError};
use crate::parameter::{ParameterKey as K, ParameterSnapshot};

/// Rows of the galvo/ETL analog bundle.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogicalChannel {
    GalvoLeft,
    GalvoRight,
    EtlLeft,
    EtlRight,
}

impl LogicalChannel {
    pub const ALL: [LogicalChannel; 4] = [
        Self::GalvoLeft,
        Self::GalvoRight,
        Self::EtlLeft,
        Self::EtlRight,
    ];
}

/// How laser intensity is delivered to the hardware.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LaserEncoding {
    /// One clocked analog row per laser line.
    #[default]
    Dense,
    /// Event list for a waypoint controller such as the octoDAC.
    Waypoint,
}

/// Mapping of logical channels to physical output rows.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelLayout {
    /// Galvo/ETL row order; must match the wiring of the analog outputs.
    pub galvo_etl_order: Vec<LogicalChannel>,
    /// Laser label to line index.
    pub laser_designation: BTreeMap<String, usize>,
}

impl Default for ChannelLayout {
    fn default() -> Self {
        Self {
            galvo_etl_order: LogicalChannel::ALL.to_vec(),
            laser_designation: [("405 nm", 0), ("488 nm", 1), ("561 nm", 2), ("638 nm", 3)]
                .into_iter()
                .map(|(label, line)| (label.to_owned(), line))
                .collect(),
        }
    }
}

impl ChannelLayout {
    /// Check that every logical channel appears exactly once and that laser
    /// lines form a contiguous range starting at zero.
    pub fn validate(&self) -> AppResult<()> {
        if self.galvo_etl_order.len() != LogicalChannel::ALL.len()
            || LogicalChannel::ALL
                .iter()
                .any(|ch| !self.galvo_etl_order.contains(ch))
        {
            return Err(DaqError::Configuration(format!(
                "galvo/ETL order must list each of {:?} exactly once, got {:?}",
                LogicalChannel::ALL,
                self.galvo_etl_order
            )));
        }

        if self.laser_designation.is_empty() {
            return Err(DaqError::Configuration(
                "laser designation must name at least one line".into(),
            ));
        }
        let mut lines: Vec<usize> = self.laser_designation.values().copied().collect();
        lines.sort_unstable();
        if lines.iter().enumerate().any(|(expected, &line)| expected != line) {
            return Err(DaqError::Configuration(format!(
                "laser designation lines must be 0..{} without gaps or duplicates, got {lines:?}",
                self.laser_designation.len()
            )));
        }
        Ok(())
    }

    pub fn laser_line(&self, label: &str) -> Option<usize> {
        self.laser_designation.get(label).copied()
    }

    pub fn laser_count(&self) -> usize {
        self.laser_designation.len()
    }
}

/// Logical channel groups armed by the sequencer, in arm order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChannelRole {
    /// Counter output that triggers the camera.
    Camera,
    /// Galvo and ETL analog bundle.
    GalvoEtl,
    /// Laser intensity bundle.
    Laser,
}

impl ChannelRole {
    /// Arm order of the roles.
    pub const ALL: [ChannelRole; 3] = [Self::Camera, Self::GalvoEtl, Self::Laser];

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Camera => "camera",
            Self::GalvoEtl => "galvo_etl",
            Self::Laser => "laser",
        }
    }
}

impl fmt::Display for ChannelRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Every buffer of one cycle, computed from a single snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct WaveformBundle {
    /// Snapshot version this bundle was computed from.
    pub version: u64,
    /// Dense sample count shared by every dense buffer.
    pub samples: usize,
    /// Sample clock in Hz.
    pub samplerate: f64,
    pub galvo_etl: WaveformBuffer,
    pub laser: WaveformBuffer,
    pub camera: WaveformBuffer,
    /// Set when the laser waypoint list was cut to the device capacity.
    pub truncation: Option<Truncation>,
}

impl WaveformBundle {
    pub fn buffer(&self, role: ChannelRole) -> &WaveformBuffer {
        match role {
            ChannelRole::Camera => &self.camera,
            ChannelRole::GalvoEtl => &self.galvo_etl,
            ChannelRole::Laser => &self.laser,
        }
    }
}

/// Builds [`WaveformBundle`]s from snapshots.
#[derive(Debug, Clone)]
pub struct WaveformAssembler {
    layout: ChannelLayout,
    encoding: LaserEncoding,
    mirror_galvo_frequency: bool,
    waypoint_capacity: usize,
}

impl WaveformAssembler {
    /// Dense laser encoding, mirrored galvo frequency, octoDAC capacity.
    pub fn new(layout: ChannelLayout) -> Self {
        Self {
            layout,
            encoding: LaserEncoding::Dense,
            mirror_galvo_frequency: true,
            waypoint_capacity: WAYPOINT_CAPACITY,
        }
    }

    #[must_use]
    pub fn with_encoding(mut self, encoding: LaserEncoding) -> Self {
        self.encoding = encoding;
        self
    }

    #[must_use]
    pub fn with_mirror_galvo_frequency(mut self, mirror: bool) -> Self {
        self.mirror_galvo_frequency = mirror;
        self
    }

    #[must_use]
    pub fn with_waypoint_capacity(mut self, capacity: usize) -> Self {
        self.waypoint_capacity = capacity;
        self
    }

    pub fn layout(&self) -> &ChannelLayout {
        &self.layout
    }

    pub fn encoding(&self) -> LaserEncoding {
        self.encoding
    }

    /// Compute every buffer for `snapshot`.
    ///
    /// # Errors
    ///
    /// `Configuration` for invalid timing (checked before any allocation), an
    /// active laser label missing from the designation map, or a
    /// non-positive camera pulse.
    pub fn recompute(&self, snapshot: &ParameterSnapshot) -> AppResult<WaveformBundle> {
        let samplerate = snapshot.get(K::Samplerate);
        let sweeptime = snapshot.get(K::Sweeptime);
        let samples = sample_count(samplerate, sweeptime)?;

        let active_line = self.layout.laser_line(snapshot.laser()).ok_or_else(|| {
            DaqError::Configuration(format!(
                "laser '{}' is not in the laser designation",
                snapshot.laser()
            ))
        })?;

        let galvo_etl = self.galvo_etl_bundle(snapshot, samples)?;
        let (laser, truncation) = match self.encoding {
            LaserEncoding::Dense => (self.dense_laser(snapshot, samples, active_line)?, None),
            LaserEncoding::Waypoint => {
                let (list, truncation) = self.waypoint_laser(snapshot, active_line);
                (WaveformBuffer::Waypoints(list), truncation)
            }
        };
        let camera = WaveformBuffer::Pulse(camera_pulse(snapshot)?);

        debug!(
            version = snapshot.version(),
            samples,
            laser = %laser,
            "Assembled waveform bundle"
        );

        Ok(WaveformBundle {
            version: snapshot.version(),
            samples,
            samplerate,
            galvo_etl,
            laser,
            camera,
            truncation,
        })
    }

    fn galvo_etl_bundle(
        &self,
        s: &ParameterSnapshot,
        samples: usize,
    ) -> AppResult<WaveformBuffer> {
        let rate = s.get(K::Samplerate);
        let sweep = s.get(K::Sweeptime);
        let right_frequency = if self.mirror_galvo_frequency {
            s.get(K::GalvoLeftFrequency)
        } else {
            s.get(K::GalvoRightFrequency)
        };

        let mut data = Array2::zeros((self.layout.galvo_etl_order.len(), samples));
        for (row, channel) in self.layout.galvo_etl_order.iter().enumerate() {
            let wave = match channel {
                LogicalChannel::GalvoLeft => periodic_sweep(
                    rate,
                    sweep,
                    s.get(K::GalvoLeftFrequency),
                    s.get(K::GalvoLeftAmplitude),
                    s.get(K::GalvoLeftOffset),
                    s.get(K::GalvoLeftDutyCycle),
                    s.get(K::GalvoLeftPhase),
                )?,
                LogicalChannel::GalvoRight => periodic_sweep(
                    rate,
                    sweep,
                    right_frequency,
                    s.get(K::GalvoRightAmplitude),
                    s.get(K::GalvoRightOffset),
                    s.get(K::GalvoRightDutyCycle),
                    s.get(K::GalvoRightPhase),
                )?,
                LogicalChannel::EtlLeft => ramp(
                    rate,
                    sweep,
                    s.get(K::EtlLeftDelay),
                    s.get(K::EtlLeftRampRising),
                    s.get(K::EtlLeftRampFalling),
                    s.get(K::EtlLeftAmplitude),
                    s.get(K::EtlLeftOffset),
                )?,
                LogicalChannel::EtlRight => ramp(
                    rate,
                    sweep,
                    s.get(K::EtlRightDelay),
                    s.get(K::EtlRightRampRising),
                    s.get(K::EtlRightRampFalling),
                    s.get(K::EtlRightAmplitude),
                    s.get(K::EtlRightOffset),
                )?,
            };
            data.row_mut(row).assign(&wave);
        }
        Ok(WaveformBuffer::Dense(data))
    }

    fn dense_laser(
        &self,
        s: &ParameterSnapshot,
        samples: usize,
        active_line: usize,
    ) -> AppResult<WaveformBuffer> {
        let voltage = s.get(K::MaxLaserVoltage) * s.get(K::Intensity) / 100.0;
        let pulse = single_pulse(
            s.get(K::Samplerate),
            s.get(K::Sweeptime),
            s.get(K::LaserLeftDelay),
            s.get(K::LaserLeftPulse),
            voltage,
            0.0,
        )?;

        let mut data = Array2::zeros((self.layout.laser_count(), samples));
        data.row_mut(active_line).assign(&pulse);
        Ok(WaveformBuffer::Dense(data))
    }

    fn waypoint_laser(
        &self,
        s: &ParameterSnapshot,
        active_line: usize,
    ) -> (WaypointList, Option<Truncation>) {
        let sweeptime = s.get(K::Sweeptime);
        let delay = s.get(K::LaserLeftDelay);
        let pulse = s.get(K::LaserLeftPulse);
        let intensity = waypoint_intensity(s.get(K::MaxLaserVoltage) * s.get(K::Intensity) / 100.0);

        let rise_us = sweep_offset_us(sweeptime, delay);
        let fall_us = sweep_offset_us(sweeptime, delay + pulse);

        let mut lines: Vec<usize> = self.layout.laser_designation.values().copied().collect();
        lines.sort_unstable();

        let mut entries = Vec::with_capacity(lines.len() * 2);
        for line in lines {
            let channel = Waypoint::output_for_line(line);
            entries.push(Waypoint {
                channel,
                time_us: rise_us,
                intensity: if line == active_line { intensity } else { 0 },
            });
            entries.push(Waypoint {
                channel,
                time_us: fall_us,
                intensity: 0,
            });
        }

        WaypointList::from_unsorted(entries, self.waypoint_capacity)
    }
}

/// Microseconds into the sweep for a percentage, clipped to the sweep.
fn sweep_offset_us(sweeptime: f64, pct: f64) -> u64 {
    let fraction = if pct.is_finite() { (pct / 100.0).clamp(0.0, 1.0) } else { 0.0 };
    (sweeptime * fraction * 1e6).round() as u64
}

/// `round(65535 * scale)` clamped into the 16-bit range.
fn waypoint_intensity(scale: f64) -> u16 {
    let raw = (65535.0 * scale).round();
    if raw > f64::from(u16::MAX) {
        warn!(requested = raw, "Laser waypoint intensity clamped to 65535");
        u16::MAX
    } else if raw < 0.0 {
        warn!(requested = raw, "Laser waypoint intensity clamped to 0");
        0
    } else {
        raw as u16
    }
}

fn camera_pulse(s: &ParameterSnapshot) -> AppResult<CounterPulse> {
    let sweeptime = s.get(K::Sweeptime);
    let pulse = CounterPulse {
        initial_delay_s: s.get(K::CameraDelay) / 100.0 * sweeptime,
        high_time_s: s.get(K::CameraPulse) / 100.0 * sweeptime,
    };
    if pulse.high_time_s <= 0.0 || pulse.initial_delay_s < 0.0 {
        return Err(DaqError::Configuration(format!(
            "camera pulse needs a positive high time and non-negative delay, got {pulse:?}"
        )));
    }
    Ok(pulse)
}
