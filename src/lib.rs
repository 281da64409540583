//! Core library for the spim_daq application.
//!
//! Waveform synthesis and synchronized triggering for a light-sheet
//! microscope: parameters are turned into galvo, ETL, laser and camera
//! buffers, loaded onto the output channels, and started together by one
//! master trigger edge.
//!
//! - [`parameter`]: named parameters, snapshots and the recomputing store
//! - [`calibration`]: per wavelength and zoom ETL calibration file
//! - [`waveform`]: waveform generators and per-channel assembly
//! - [`hardware`]: channel sessions, device traits and drivers
//! - [`sequencer`]: arm-then-fire cycle across all channels
//! - [`acquisition`]: snap and live preview
//! - [`config`]: figment-based settings

pub mod acquisition;
pub mod calibration;
pub mod config;
pub mod error;
pub mod hardware;
pub mod parameter;
pub mod sequencer;
pub mod waveform;

pub use acquisition::{AcquisitionController, LiveSummary};
pub use config::Settings;
pub use error::{AppResult, DaqError};
pub use parameter::{ParameterKey, ParameterSnapshot, ParameterStore};
pub use sequencer::{CycleReport, SequencerPolicy, StopHandle, TriggerSequencer};
