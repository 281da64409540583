//! Configuration System using Figment
//!
//! Settings are loaded from:
//! 1. a TOML file (base configuration)
//! 2. environment variables prefixed with `SPIM_` (nested keys split on `__`)
//!
//! ```text
//! SPIM_APPLICATION__LOG_LEVEL=debug
//! SPIM_HARDWARE__WAIT_TIMEOUT_MS=500
//! SPIM_STARTUP__LASER="561 nm"
//! ```
//!
//! Every section has defaults, so an empty file yields a runnable mock setup.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::calibration::EtlCalibrationTable;
use crate::error::{AppResult, DaqError};
use crate::hardware::octodac::OCTODAC_CHANNELS;
use crate::parameter::{ParameterKey, ParameterSnapshot};
use crate::sequencer::SequencerPolicy;
use crate::waveform::{
    ChannelLayout, ChannelRole, LaserEncoding, WaveformAssembler, WAYPOINT_CAPACITY,
};

/// Top-level settings.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub application: ApplicationConfig,
    #[serde(default)]
    pub hardware: HardwareConfig,
    #[serde(default)]
    pub layout: ChannelLayout,
    #[serde(default)]
    pub waveform: WaveformConfig,
    #[serde(default)]
    pub startup: StartupConfig,
}

/// Application-level configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ApplicationConfig {
    pub name: String,
    /// Logging level (trace, debug, info, warn, error)
    pub log_level: String,
}

impl Default for ApplicationConfig {
    fn default() -> Self {
        Self {
            name: "spim_daq".into(),
            log_level: "info".into(),
        }
    }
}

/// Physical lines and device settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HardwareConfig {
    /// Digital line carrying the master trigger pulse.
    pub master_trigger_out_line: String,
    /// Start-trigger terminal shared by every output task.
    pub trigger_source: String,
    /// Counter output driving the camera.
    pub camera_trigger_out_line: String,
    /// Analog outputs for the galvo/ETL bundle, in layout order.
    pub galvo_etl_task_line: Vec<String>,
    /// One entry per laser line, in designation order.
    pub laser_task_line: Vec<String>,
    pub laser_encoding: LaserEncoding,
    /// Serial port of the waypoint laser controller.
    pub laser_port: Option<String>,
    pub laser_baud_rate: u32,
    pub laser_reply_timeout_ms: u64,
    /// Per-channel wait after the master trigger.
    pub wait_timeout_ms: u64,
    /// Consecutive timeouts before a channel is taken out of service.
    pub timeout_escalation: u32,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            master_trigger_out_line: "/PXI6259/port0/line1".into(),
            trigger_source: "/PXI6259/PFI0".into(),
            camera_trigger_out_line: "/PXI6259/ctr0".into(),
            galvo_etl_task_line: (0..4).map(|i| format!("PXI6259/ao{i}")).collect(),
            laser_task_line: (0..4).map(|i| format!("PXI6733/ao{i}")).collect(),
            laser_encoding: LaserEncoding::Dense,
            laser_port: None,
            laser_baud_rate: default_laser_baud_rate(),
            laser_reply_timeout_ms: default_laser_reply_timeout(),
            wait_timeout_ms: default_wait_timeout(),
            timeout_escalation: default_timeout_escalation(),
        }
    }
}

/// Waveform assembly options.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WaveformConfig {
    /// Right galvo follows the left galvo frequency.
    pub mirror_galvo_frequency: bool,
    pub waypoint_capacity: usize,
}

impl Default for WaveformConfig {
    fn default() -> Self {
        Self {
            mirror_galvo_frequency: true,
            waypoint_capacity: WAYPOINT_CAPACITY,
        }
    }
}

/// Initial selection and parameter overrides.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StartupConfig {
    pub laser: String,
    pub zoom: String,
    pub etl_calibration_file: Option<PathBuf>,
    /// Parameter name to startup value; unspecified parameters keep defaults.
    pub parameters: BTreeMap<String, f64>,
}

impl Default for StartupConfig {
    fn default() -> Self {
        Self {
            laser: "488 nm".into(),
            zoom: "1x".into(),
            etl_calibration_file: None,
            parameters: BTreeMap::new(),
        }
    }
}

fn default_laser_baud_rate() -> u32 {
    115_200
}

fn default_laser_reply_timeout() -> u64 {
    1000
}

fn default_wait_timeout() -> u64 {
    1000
}

fn default_timeout_escalation() -> u32 {
    3
}

impl Settings {
    /// Load from `path`, apply `SPIM_` environment overrides and validate.
    pub fn load_from<P: AsRef<Path>>(path: P) -> AppResult<Self> {
        let settings: Self = Figment::new()
            .merge(Toml::file(path.as_ref()))
            .merge(Env::prefixed("SPIM_").split("__"))
            .extract()?;

        settings.validate()?;
        info!(path = %path.as_ref().display(), "Loaded configuration");
        Ok(settings)
    }

    /// Parse and validate TOML text without touching the environment.
    pub fn from_toml_str(toml: &str) -> AppResult<Self> {
        let settings: Self = Figment::new().merge(Toml::string(toml)).extract()?;
        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> AppResult<()> {
        let valid_levels = ["trace", "debug", "info", "warn", "error"];
        if !valid_levels.contains(&self.application.log_level.as_str()) {
            return Err(DaqError::Configuration(format!(
                "invalid log level '{}', expected one of {valid_levels:?}",
                self.application.log_level
            )));
        }

        self.layout.validate()?;

        let hw = &self.hardware;
        if hw.galvo_etl_task_line.len() != self.layout.galvo_etl_order.len() {
            return Err(DaqError::Configuration(format!(
                "{} galvo/ETL lines configured, layout has {} channels",
                hw.galvo_etl_task_line.len(),
                self.layout.galvo_etl_order.len()
            )));
        }
        if hw.laser_task_line.len() != self.layout.laser_count() {
            return Err(DaqError::Configuration(format!(
                "{} laser lines configured, designation has {} entries",
                hw.laser_task_line.len(),
                self.layout.laser_count()
            )));
        }
        if hw.laser_encoding == LaserEncoding::Waypoint
            && self.layout.laser_count() > usize::from(OCTODAC_CHANNELS)
        {
            return Err(DaqError::Configuration(format!(
                "waypoint encoding supports at most {OCTODAC_CHANNELS} laser lines"
            )));
        }
        if hw.wait_timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "wait_timeout_ms must be positive".into(),
            ));
        }
        if hw.laser_reply_timeout_ms == 0 {
            return Err(DaqError::Configuration(
                "laser_reply_timeout_ms must be positive".into(),
            ));
        }
        if self.waveform.waypoint_capacity == 0 {
            return Err(DaqError::Configuration(
                "waypoint_capacity must be positive".into(),
            ));
        }

        if self.layout.laser_line(&self.startup.laser).is_none() {
            return Err(DaqError::Configuration(format!(
                "startup laser '{}' is not in the laser designation",
                self.startup.laser
            )));
        }
        for (name, value) in &self.startup.parameters {
            name.parse::<ParameterKey>()?;
            if !value.is_finite() {
                return Err(DaqError::Configuration(format!(
                    "startup parameter '{name}' must be finite"
                )));
            }
        }

        Ok(())
    }

    /// Snapshot at version 0 with the startup overrides applied.
    pub fn initial_snapshot(&self) -> AppResult<ParameterSnapshot> {
        let mut snapshot = ParameterSnapshot::new(&self.startup.laser, &self.startup.zoom);
        for (name, value) in &self.startup.parameters {
            snapshot.set(name.parse()?, *value);
        }
        Ok(snapshot)
    }

    pub fn assembler(&self) -> WaveformAssembler {
        WaveformAssembler::new(self.layout.clone())
            .with_encoding(self.hardware.laser_encoding)
            .with_mirror_galvo_frequency(self.waveform.mirror_galvo_frequency)
            .with_waypoint_capacity(self.waveform.waypoint_capacity)
    }

    pub fn policy(&self) -> SequencerPolicy {
        SequencerPolicy {
            wait_timeout: Duration::from_millis(self.hardware.wait_timeout_ms),
            escalation_threshold: self.hardware.timeout_escalation,
        }
    }

    /// Physical output behind a channel group, as written in the hardware
    /// section. Multi-line groups are joined with commas.
    pub fn output_line(&self, role: ChannelRole) -> String {
        let hw = &self.hardware;
        match role {
            ChannelRole::Camera => hw.camera_trigger_out_line.clone(),
            ChannelRole::GalvoEtl => hw.galvo_etl_task_line.join(","),
            ChannelRole::Laser => match (hw.laser_encoding, &hw.laser_port) {
                (LaserEncoding::Waypoint, Some(port)) => port.clone(),
                _ => hw.laser_task_line.join(","),
            },
        }
    }

    /// Calibration table from the startup file, or an empty table.
    pub fn load_calibration(&self) -> AppResult<EtlCalibrationTable> {
        match &self.startup.etl_calibration_file {
            Some(path) => EtlCalibrationTable::load(path),
            None => Ok(EtlCalibrationTable::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_output_lines_follow_hardware_section() {
        let settings = Settings::from_toml_str(
            r#"
            [hardware]
            camera_trigger_out_line = "/Dev1/ctr1"
            galvo_etl_task_line = ["Dev1/ao0", "Dev1/ao1", "Dev1/ao2", "Dev1/ao3"]
            "#,
        )
        .unwrap();
        assert_eq!(settings.output_line(ChannelRole::Camera), "/Dev1/ctr1");
        assert_eq!(
            settings.output_line(ChannelRole::GalvoEtl),
            "Dev1/ao0,Dev1/ao1,Dev1/ao2,Dev1/ao3"
        );
        assert_eq!(
            settings.output_line(ChannelRole::Laser),
            "PXI6733/ao0,PXI6733/ao1,PXI6733/ao2,PXI6733/ao3"
        );
        assert_eq!(settings.hardware.master_trigger_out_line, "/PXI6259/port0/line1");

        let mut waypoint = settings.clone();
        waypoint.hardware.laser_encoding = LaserEncoding::Waypoint;
        waypoint.hardware.laser_port = Some("/dev/ttyACM0".into());
        assert_eq!(waypoint.output_line(ChannelRole::Laser), "/dev/ttyACM0");
    }

    #[test]
    fn test_empty_config_uses_defaults() {
        let settings = Settings::from_toml_str("").unwrap();
        assert_eq!(settings.application.log_level, "info");
        assert_eq!(settings.hardware.wait_timeout_ms, 1000);
        assert!(settings.waveform.mirror_galvo_frequency);
        assert_eq!(settings.startup.laser, "488 nm");
        assert_eq!(settings.policy().escalation_threshold, 3);
    }

    #[test]
    fn test_full_config() {
        let toml = r#"
            [application]
            name = "bench"
            log_level = "debug"

            [hardware]
            trigger_source = "/Dev2/PFI0"
            laser_task_line = ["octoDAC:0", "octoDAC:1"]
            laser_encoding = "waypoint"
            laser_port = "/dev/ttyACM0"
            wait_timeout_ms = 250

            [layout]
            galvo_etl_order = ["etl_left", "etl_right", "galvo_left", "galvo_right"]
            laser_designation = { "488 nm" = 0, "561 nm" = 1 }

            [waveform]
            mirror_galvo_frequency = false

            [startup]
            laser = "561 nm"
            zoom = "2x"

            [startup.parameters]
            sweeptime = 0.2
            "etl_l_delay_%" = 5.0
        "#;
        let settings = Settings::from_toml_str(toml).unwrap();

        assert_eq!(settings.hardware.laser_encoding, LaserEncoding::Waypoint);
        assert_eq!(settings.policy().wait_timeout, Duration::from_millis(250));

        let snapshot = settings.initial_snapshot().unwrap();
        assert_eq!(snapshot.get(ParameterKey::Sweeptime), 0.2);
        assert_eq!(snapshot.get(ParameterKey::EtlLeftDelay), 5.0);
        assert_eq!(snapshot.get(ParameterKey::Samplerate), 100_000.0);
        assert_eq!(snapshot.laser(), "561 nm");

        let assembler = settings.assembler();
        assert_eq!(assembler.encoding(), LaserEncoding::Waypoint);
    }

    #[test]
    fn test_invalid_log_level() {
        let result = Settings::from_toml_str("[application]\nname = \"x\"\nlog_level = \"loud\"\n");
        assert!(matches!(result, Err(DaqError::Configuration(_))));
    }

    #[test]
    fn test_line_count_must_match_layout() {
        let result = Settings::from_toml_str("[hardware]\nlaser_task_line = [\"ao0\"]\n");
        assert!(matches!(result, Err(DaqError::Configuration(_))));
    }

    #[test]
    fn test_unknown_startup_parameter() {
        let result = Settings::from_toml_str("[startup.parameters]\nsweep_time = 0.2\n");
        assert!(matches!(result, Err(DaqError::Configuration(_))));
    }

    #[test]
    fn test_unknown_startup_laser() {
        let result = Settings::from_toml_str("[startup]\nlaser = \"999 nm\"\n");
        assert!(result.is_err());
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("spim.toml");
        std::fs::write(&path, "[hardware]\ntimeout_escalation = 5\n").unwrap();

        let settings = Settings::load_from(&path).unwrap();
        assert_eq!(settings.hardware.timeout_escalation, 5);
    }
}
