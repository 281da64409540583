//! Custom error types for the waveform and sequencing engine.
//!
//! `DaqError` is the single error type of the library. Its variants follow the
//! failure classes of an acquisition cycle:
//!
//! - **`Configuration`**: invalid or missing parameters, zero-length buffers.
//!   Fatal to the current cycle; the previously computed waveform stays active.
//! - **`TriggerSetup`**: a channel failed to arm. The cycle is aborted and every
//!   session is rolled back before the error is returned, so the system stays
//!   usable for the next cycle.
//! - **`DeviceHandshake`**: the identification query at channel open returned
//!   something unexpected. Only the affected channel becomes unavailable.
//! - **`InvalidTransition`**: a session operation was requested in a lifecycle
//!   state that does not allow it (e.g. reloading an armed channel).
//!
//! Channel timeouts are not errors; they are reported as
//! [`TimeoutSignal`](crate::sequencer::TimeoutSignal) records in the cycle report.

use thiserror::Error;

/// Convenience alias for results using the library error type.
pub type AppResult<T> = std::result::Result<T, DaqError>;

#[allow(missing_docs)]
#[derive(Error, Debug)]
pub enum DaqError {
    #[error("Configuration error: {0}")]
    Configuration(String),

    #[error("Configuration load error: {0}")]
    ConfigLoad(#[from] figment::Error),

    #[error("Trigger setup failed on '{channel}': {reason}")]
    TriggerSetup { channel: String, reason: String },

    #[error("Device handshake failed on '{device}': expected '{expected}', received '{received}'")]
    DeviceHandshake {
        device: String,
        expected: String,
        received: String,
    },

    #[error("Channel '{channel}' cannot {operation} while {state}")]
    InvalidTransition {
        channel: String,
        state: String,
        operation: &'static str,
    },

    #[error("Channel '{0}' is unavailable")]
    ChannelUnavailable(String),

    #[error("Instrument error: {0}")]
    Instrument(String),

    #[error("Calibration error: {0}")]
    Calibration(String),

    #[error("CSV error: {0}")]
    Csv(#[from] csv::Error),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Shutdown failed with errors")]
    ShutdownFailed(Vec<DaqError>),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = DaqError::TriggerSetup {
            channel: "galvo_etl".into(),
            reason: "buffer rejected".into(),
        };
        assert_eq!(
            err.to_string(),
            "Trigger setup failed on 'galvo_etl': buffer rejected"
        );
    }

    #[test]
    fn test_invalid_transition_display() {
        let err = DaqError::InvalidTransition {
            channel: "laser".into(),
            state: "Armed".into(),
            operation: "configure",
        };
        assert_eq!(err.to_string(), "Channel 'laser' cannot configure while Armed");
    }

    #[test]
    fn test_shutdown_failed_error() {
        let err = DaqError::ShutdownFailed(vec![
            DaqError::Instrument("camera counter busy".into()),
            DaqError::ChannelUnavailable("laser".into()),
        ]);
        assert!(err.to_string().contains("Shutdown failed"));
    }
}
