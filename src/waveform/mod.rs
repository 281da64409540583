//! Waveform synthesis.
//!
//! - [`functions`]: pure generators (pulse, ramp, sweep, square)
//! - [`buffer`]: dense, waypoint and counter-pulse buffer encodings
//! - [`assembler`]: snapshot to per-channel buffers in the channel layout

pub mod assembler;
pub mod buffer;
pub mod functions;

pub use assembler::{
    ChannelLayout, ChannelRole, LaserEncoding, LogicalChannel, WaveformAssembler, WaveformBundle,
};
pub use buffer::{CounterPulse, Truncation, WaveformBuffer, Waypoint, WaypointList, WAYPOINT_CAPACITY};
