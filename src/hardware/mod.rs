//! Output hardware: capability traits, channel sessions and drivers.

pub mod capabilities;
pub mod mock;
pub mod octodac;
pub mod serial;
pub mod session;

pub use capabilities::{ChannelConfig, LaserController, OutputChannel, TriggerOutput, MASTER_TRIGGER_PATTERN};
pub use session::{ChannelSession, SessionState};
