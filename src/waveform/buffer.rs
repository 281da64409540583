//! Buffer encodings handed to output channels.

use std::fmt;

use ndarray::Array2;
use serde::Serialize;
use tracing::warn;

/// Hardware limit of the octoDAC waypoint memory.
pub const WAYPOINT_CAPACITY: usize = 100;

/// One event of an event-driven output: at `time_us` after the trigger, set
/// `channel` to `intensity`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Waypoint {
    /// Output line on the controller.
    pub channel: u8,
    /// Microseconds after the trigger edge.
    pub time_us: u64,
    /// Full-scale 16-bit output value.
    pub intensity: u16,
}

impl Waypoint {
    /// Controller output driven by laser designation line `line`.
    ///
    /// Outputs are numbered from 1, so line 0 plays on output 1. Waypoint
    /// uploads and direct enables both go through this mapping.
    pub fn output_for_line(line: usize) -> u8 {
        u8::try_from(line.saturating_add(1)).unwrap_or(u8::MAX)
    }
}

/// Record of a waypoint list that exceeded the device capacity.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Truncation {
    /// Entries supplied by the assembler.
    pub requested: usize,
    /// Entries kept after truncation.
    pub kept: usize,
}

/// Time-sorted waypoint list bounded by the device capacity.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct WaypointList {
    entries: Vec<Waypoint>,
}

impl WaypointList {
    /// Empty list.
    pub fn new() -> Self {
        Self::default()
    }

    /// Sorts `entries` by time (stable, so equal times keep their order) and
    /// truncates to `capacity`.
    ///
    /// Truncation emits a single warning and is reported back to the caller.
    pub fn from_unsorted(
        mut entries: Vec<Waypoint>,
        capacity: usize,
    ) -> (Self, Option<Truncation>) {
        entries.sort_by_key(|w| w.time_us);

        let requested = entries.len();
        let truncation = if requested > capacity {
            entries.truncate(capacity);
            warn!(
                requested,
                kept = capacity,
                "waypoint list truncated to device capacity"
            );
            Some(Truncation {
                requested,
                kept: capacity,
            })
        } else {
            None
        };

        (Self { entries }, truncation)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Waypoint> {
        self.entries.iter()
    }

    pub fn as_slice(&self) -> &[Waypoint] {
        &self.entries
    }
}

/// Camera trigger counter: one pulse `initial_delay_s` after the trigger,
/// held high for `high_time_s`.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CounterPulse {
    pub initial_delay_s: f64,
    pub high_time_s: f64,
}

/// Data loaded into one channel session per cycle.
#[derive(Debug, Clone, PartialEq)]
pub enum WaveformBuffer {
    /// `channels x samples` voltages for a clocked analog output.
    Dense(Array2<f64>),
    /// Event list for an event-driven controller.
    Waypoints(WaypointList),
    /// Counter output parameters.
    Pulse(CounterPulse),
}

impl WaveformBuffer {
    /// Samples per channel for dense buffers.
    pub fn sample_count(&self) -> Option<usize> {
        match self {
            Self::Dense(data) => Some(data.ncols()),
            _ => None,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Dense(_) => "dense",
            Self::Waypoints(_) => "waypoints",
            Self::Pulse(_) => "pulse",
        }
    }
}

impl fmt::Display for WaveformBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Dense(data) => write!(f, "dense {}x{}", data.nrows(), data.ncols()),
            Self::Waypoints(list) => write!(f, "{} waypoints", list.len()),
            Self::Pulse(p) => write!(
                f,
                "pulse delay={:.6}s high={:.6}s",
                p.initial_delay_s, p.high_time_s
            ),
        }
    }
}
