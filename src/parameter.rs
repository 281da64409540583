//! Versioned waveform parameters.
//!
//! [`ParameterSnapshot`] is a plain value holding every numeric parameter that
//! affects the waveforms, plus the active laser and zoom labels. The
//! [`ParameterStore`] owns the current snapshot together with the waveform
//! bundle computed from it and applies every mutation in a push model:
//!
//! 1. clone the snapshot and apply the change,
//! 2. recompute the waveforms from the candidate snapshot,
//! 3. on success swap both in and publish a [`ChangeEvent`]; on failure drop
//!    the candidate so the previous snapshot and waveforms stay active.
//!
//! Change events go out on a `tokio::sync::watch` channel so any number of
//! observers can follow the latest version without coupling to the store.

use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use tokio::sync::watch;
use tracing::{debug, info, warn};

use crate::calibration::{self, EtlCalibrationTable, EtlSettings};
use crate::error::{AppResult, DaqError};
use crate::waveform::assembler::{WaveformAssembler, WaveformBundle};
use crate::waveform::functions::sample_count;

/// Every waveform-affecting numeric parameter.
#[allow(missing_docs)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ParameterKey {
    Samplerate,
    Sweeptime,
    Intensity,
    MaxLaserVoltage,
    EtlLeftDelay,
    EtlLeftRampRising,
    EtlLeftRampFalling,
    EtlLeftAmplitude,
    EtlLeftOffset,
    EtlRightDelay,
    EtlRightRampRising,
    EtlRightRampFalling,
    EtlRightAmplitude,
    EtlRightOffset,
    GalvoLeftFrequency,
    GalvoLeftAmplitude,
    GalvoLeftOffset,
    GalvoLeftDutyCycle,
    GalvoLeftPhase,
    GalvoRightFrequency,
    GalvoRightAmplitude,
    GalvoRightOffset,
    GalvoRightDutyCycle,
    GalvoRightPhase,
    LaserLeftDelay,
    LaserLeftPulse,
    LaserLeftMaxAmplitude,
    LaserRightDelay,
    LaserRightPulse,
    LaserRightMaxAmplitude,
    CameraDelay,
    CameraPulse,
}

impl ParameterKey {
    /// Number of parameters in a snapshot.
    pub const COUNT: usize = 32;

    /// All keys in snapshot order.
    pub const ALL: [ParameterKey; Self::COUNT] = [
        Self::Samplerate,
        Self::Sweeptime,
        Self::Intensity,
        Self::MaxLaserVoltage,
        Self::EtlLeftDelay,
        Self::EtlLeftRampRising,
        Self::EtlLeftRampFalling,
        Self::EtlLeftAmplitude,
        Self::EtlLeftOffset,
        Self::EtlRightDelay,
        Self::EtlRightRampRising,
        Self::EtlRightRampFalling,
        Self::EtlRightAmplitude,
        Self::EtlRightOffset,
        Self::GalvoLeftFrequency,
        Self::GalvoLeftAmplitude,
        Self::GalvoLeftOffset,
        Self::GalvoLeftDutyCycle,
        Self::GalvoLeftPhase,
        Self::GalvoRightFrequency,
        Self::GalvoRightAmplitude,
        Self::GalvoRightOffset,
        Self::GalvoRightDutyCycle,
        Self::GalvoRightPhase,
        Self::LaserLeftDelay,
        Self::LaserLeftPulse,
        Self::LaserLeftMaxAmplitude,
        Self::LaserRightDelay,
        Self::LaserRightPulse,
        Self::LaserRightMaxAmplitude,
        Self::CameraDelay,
        Self::CameraPulse,
    ];

    /// The four keys written by a calibration lookup.
    pub const ETL_CALIBRATION: [ParameterKey; 4] = [
        Self::EtlLeftOffset,
        Self::EtlLeftAmplitude,
        Self::EtlRightOffset,
        Self::EtlRightAmplitude,
    ];

    /// Parameter name as used in configuration files and change events.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Samplerate => "samplerate",
            Self::Sweeptime => "sweeptime",
            Self::Intensity => "intensity",
            Self::MaxLaserVoltage => "max_laser_voltage",
            Self::EtlLeftDelay => "etl_l_delay_%",
            Self::EtlLeftRampRising => "etl_l_ramp_rising_%",
            Self::EtlLeftRampFalling => "etl_l_ramp_falling_%",
            Self::EtlLeftAmplitude => "etl_l_amplitude",
            Self::EtlLeftOffset => "etl_l_offset",
            Self::EtlRightDelay => "etl_r_delay_%",
            Self::EtlRightRampRising => "etl_r_ramp_rising_%",
            Self::EtlRightRampFalling => "etl_r_ramp_falling_%",
            Self::EtlRightAmplitude => "etl_r_amplitude",
            Self::EtlRightOffset => "etl_r_offset",
            Self::GalvoLeftFrequency => "galvo_l_frequency",
            Self::GalvoLeftAmplitude => "galvo_l_amplitude",
            Self::GalvoLeftOffset => "galvo_l_offset",
            Self::GalvoLeftDutyCycle => "galvo_l_duty_cycle",
            Self::GalvoLeftPhase => "galvo_l_phase",
            Self::GalvoRightFrequency => "galvo_r_frequency",
            Self::GalvoRightAmplitude => "galvo_r_amplitude",
            Self::GalvoRightOffset => "galvo_r_offset",
            Self::GalvoRightDutyCycle => "galvo_r_duty_cycle",
            Self::GalvoRightPhase => "galvo_r_phase",
            Self::LaserLeftDelay => "laser_l_delay_%",
            Self::LaserLeftPulse => "laser_l_pulse_%",
            Self::LaserLeftMaxAmplitude => "laser_l_max_amplitude",
            Self::LaserRightDelay => "laser_r_delay_%",
            Self::LaserRightPulse => "laser_r_pulse_%",
            Self::LaserRightMaxAmplitude => "laser_r_max_amplitude",
            Self::CameraDelay => "camera_delay_%",
            Self::CameraPulse => "camera_pulse_%",
        }
    }

    /// Startup value used when the configuration does not override it.
    pub fn default_value(self) -> f64 {
        match self {
            Self::Samplerate => 100_000.0,
            Self::Sweeptime => 0.1,
            Self::Intensity => 10.0,
            Self::MaxLaserVoltage => 5.0,
            Self::EtlLeftDelay => 7.5,
            Self::EtlLeftRampRising => 85.0,
            Self::EtlLeftRampFalling => 2.5,
            Self::EtlLeftAmplitude => 0.7,
            Self::EtlLeftOffset => 2.3,
            Self::EtlRightDelay => 2.5,
            Self::EtlRightRampRising => 5.0,
            Self::EtlRightRampFalling => 85.0,
            Self::EtlRightAmplitude => 0.65,
            Self::EtlRightOffset => 2.36,
            Self::GalvoLeftFrequency | Self::GalvoRightFrequency => 99.9,
            Self::GalvoLeftAmplitude | Self::GalvoRightAmplitude => 2.5,
            Self::GalvoLeftOffset | Self::GalvoRightOffset => 0.0,
            Self::GalvoLeftDutyCycle | Self::GalvoRightDutyCycle => 50.0,
            Self::GalvoLeftPhase | Self::GalvoRightPhase => std::f64::consts::FRAC_PI_2,
            Self::LaserLeftDelay | Self::LaserRightDelay => 10.0,
            Self::LaserLeftPulse | Self::LaserRightPulse => 87.0,
            Self::LaserLeftMaxAmplitude | Self::LaserRightMaxAmplitude => 100.0,
            Self::CameraDelay => 10.0,
            Self::CameraPulse => 1.0,
        }
    }

    fn index(self) -> usize {
        self as usize
    }
}

impl fmt::Display for ParameterKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ParameterKey {
    type Err = DaqError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .iter()
            .copied()
            .find(|key| key.as_str() == s)
            .ok_or_else(|| DaqError::Configuration(format!("unknown parameter '{s}'")))
    }
}

/// Ordered name/value pairs delivered as one change event.
pub type ParameterChanges = Vec<(String, f64)>;

// =============================================================================
// Snapshot
// =============================================================================

/// Immutable-by-convention view of all waveform parameters at one version.
#[derive(Debug, Clone, PartialEq)]
pub struct ParameterSnapshot {
    values: [f64; ParameterKey::COUNT],
    laser: String,
    zoom: String,
    version: u64,
}

impl ParameterSnapshot {
    /// Snapshot with every parameter at its default value.
    pub fn new(laser: impl Into<String>, zoom: impl Into<String>) -> Self {
        let mut values = [0.0; ParameterKey::COUNT];
        for key in ParameterKey::ALL {
            values[key.index()] = key.default_value();
        }
        Self {
            values,
            laser: laser.into(),
            zoom: zoom.into(),
            version: 0,
        }
    }

    pub fn get(&self, key: ParameterKey) -> f64 {
        self.values[key.index()]
    }

    /// Values of `keys` in the given order.
    pub fn get_many(&self, keys: &[ParameterKey]) -> Vec<f64> {
        keys.iter().map(|&key| self.get(key)).collect()
    }

    /// Set a value on this snapshot. Does not touch any store.
    pub fn set(&mut self, key: ParameterKey, value: f64) {
        self.values[key.index()] = value;
    }

    /// Builder form of [`set`](Self::set).
    #[must_use]
    pub fn with(mut self, key: ParameterKey, value: f64) -> Self {
        self.set(key, value);
        self
    }

    pub fn laser(&self) -> &str {
        &self.laser
    }

    pub fn zoom(&self) -> &str {
        &self.zoom
    }

    pub fn version(&self) -> u64 {
        self.version
    }

    /// `floor(samplerate * sweeptime)`.
    pub fn samples(&self) -> AppResult<usize> {
        sample_count(
            self.get(ParameterKey::Samplerate),
            self.get(ParameterKey::Sweeptime),
        )
    }

    /// Current ETL offsets and amplitudes.
    pub fn etl_settings(&self) -> EtlSettings {
        EtlSettings {
            left_offset: self.get(ParameterKey::EtlLeftOffset),
            left_amplitude: self.get(ParameterKey::EtlLeftAmplitude),
            right_offset: self.get(ParameterKey::EtlRightOffset),
            right_amplitude: self.get(ParameterKey::EtlRightAmplitude),
        }
    }

    fn set_etl(&mut self, settings: &EtlSettings) {
        self.set(ParameterKey::EtlLeftOffset, settings.left_offset);
        self.set(ParameterKey::EtlLeftAmplitude, settings.left_amplitude);
        self.set(ParameterKey::EtlRightOffset, settings.right_offset);
        self.set(ParameterKey::EtlRightAmplitude, settings.right_amplitude);
    }
}

/// Published after every successful recompute.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChangeEvent {
    /// Version of the snapshot now active.
    pub version: u64,
    /// Keys whose values were written by the mutation.
    pub changed: Vec<ParameterKey>,
}

// =============================================================================
// Store
// =============================================================================

/// Owner of the active snapshot and the waveforms computed from it.
pub struct ParameterStore {
    snapshot: ParameterSnapshot,
    bundle: Arc<WaveformBundle>,
    assembler: WaveformAssembler,
    calibration: EtlCalibrationTable,
    calibration_path: Option<PathBuf>,
    events: watch::Sender<ChangeEvent>,
}

impl ParameterStore {
    /// Build a store, applying the calibration row for the initial laser and
    /// zoom when one exists, and compute the first bundle.
    ///
    /// # Errors
    ///
    /// `Configuration` if the initial snapshot cannot produce waveforms.
    pub fn new(
        initial: ParameterSnapshot,
        assembler: WaveformAssembler,
        calibration: EtlCalibrationTable,
        calibration_path: Option<PathBuf>,
    ) -> AppResult<Self> {
        let mut snapshot = initial;
        match calibration.lookup(&snapshot.laser, &snapshot.zoom) {
            Some(settings) => snapshot.set_etl(settings),
            None if !calibration.is_empty() => warn!(
                laser = %snapshot.laser,
                zoom = %snapshot.zoom,
                "No ETL calibration for startup selection, keeping configured values"
            ),
            None => {}
        }

        let bundle = Arc::new(assembler.recompute(&snapshot)?);
        let (events, _) = watch::channel(ChangeEvent {
            version: snapshot.version,
            changed: Vec::new(),
        });

        info!(
            samples = bundle.samples,
            laser = %snapshot.laser,
            zoom = %snapshot.zoom,
            "Parameter store initialized"
        );

        Ok(Self {
            snapshot,
            bundle,
            assembler,
            calibration,
            calibration_path,
            events,
        })
    }

    pub fn snapshot(&self) -> &ParameterSnapshot {
        &self.snapshot
    }

    /// Waveforms computed from the active snapshot.
    pub fn waveforms(&self) -> Arc<WaveformBundle> {
        Arc::clone(&self.bundle)
    }

    pub fn calibration(&self) -> &EtlCalibrationTable {
        &self.calibration
    }

    pub fn assembler(&self) -> &WaveformAssembler {
        &self.assembler
    }

    /// Receiver of change events; starts at the current version.
    pub fn subscribe(&self) -> watch::Receiver<ChangeEvent> {
        self.events.subscribe()
    }

    /// Values for `names` in the given order.
    pub fn get_many(&self, names: &[&str]) -> AppResult<Vec<f64>> {
        names
            .iter()
            .map(|name| name.parse::<ParameterKey>().map(|key| self.snapshot.get(key)))
            .collect()
    }

    /// Set one parameter by name.
    pub fn set(&mut self, name: &str, value: f64) -> AppResult<u64> {
        let key = name.parse::<ParameterKey>()?;
        self.set_key(key, value)
    }

    /// Set one parameter and recompute.
    pub fn set_key(&mut self, key: ParameterKey, value: f64) -> AppResult<u64> {
        check_finite(key, value)?;
        let next = self.snapshot.clone().with(key, value);
        self.commit(next, vec![key])
    }

    /// Apply one change event atomically: a single recompute for the whole
    /// map. Unknown names are skipped with a warning.
    ///
    /// Returns the keys that were applied.
    pub fn apply_changes(&mut self, changes: &[(String, f64)]) -> AppResult<Vec<ParameterKey>> {
        let mut next = self.snapshot.clone();
        let mut applied = Vec::with_capacity(changes.len());

        for (name, value) in changes {
            let key = match name.parse::<ParameterKey>() {
                Ok(key) => key,
                Err(_) => {
                    warn!(parameter = %name, "Ignoring unknown parameter in change event");
                    continue;
                }
            };
            check_finite(key, *value)?;
            next.set(key, *value);
            if !applied.contains(&key) {
                applied.push(key);
            }
        }

        if applied.is_empty() {
            return Ok(applied);
        }
        self.commit(next, applied.clone())?;
        Ok(applied)
    }

    /// Load ETL offsets and amplitudes for `(wavelength, zoom)` from the
    /// calibration table.
    ///
    /// # Errors
    ///
    /// `Calibration` if the table has no such row.
    pub fn apply_calibration(&mut self, wavelength: &str, zoom: &str) -> AppResult<u64> {
        let settings = *self.calibration.lookup(wavelength, zoom).ok_or_else(|| {
            DaqError::Calibration(format!(
                "no calibration row for wavelength '{wavelength}' and zoom '{zoom}'"
            ))
        })?;

        let mut next = self.snapshot.clone();
        next.set_etl(&settings);
        self.commit(next, ParameterKey::ETL_CALIBRATION.to_vec())
    }

    /// Switch the active laser and re-apply the calibration for the new
    /// wavelength at the current zoom.
    pub fn set_laser(&mut self, laser: &str) -> AppResult<u64> {
        let mut next = self.snapshot.clone();
        next.laser = laser.to_owned();
        let changed = self.calibrate_selection(&mut next);
        let version = self.commit(next, changed)?;
        info!(laser, "Active laser changed");
        Ok(version)
    }

    /// Switch the zoom and re-apply the calibration for the active laser.
    pub fn set_zoom(&mut self, zoom: &str) -> AppResult<u64> {
        let mut next = self.snapshot.clone();
        next.zoom = zoom.to_owned();
        let changed = self.calibrate_selection(&mut next);
        let version = self.commit(next, changed)?;
        info!(zoom, "Zoom changed");
        Ok(version)
    }

    /// Persist the current ETL values into the calibration row of the active
    /// (laser, zoom) and rewrite the calibration file.
    pub fn save_calibration(&mut self) -> AppResult<()> {
        let path = self.calibration_path.clone().ok_or_else(|| {
            DaqError::Calibration("no calibration file configured".into())
        })?;
        let settings = self.snapshot.etl_settings();

        calibration::rewrite_row(&path, &self.snapshot.laser, &self.snapshot.zoom, &settings)?;
        self.calibration
            .update(&self.snapshot.laser, &self.snapshot.zoom, settings);

        info!(
            path = %path.display(),
            laser = %self.snapshot.laser,
            zoom = %self.snapshot.zoom,
            "Saved ETL calibration"
        );
        Ok(())
    }

    /// Load a calibration file and apply its row for the active selection.
    pub fn reload_calibration(&mut self, path: impl AsRef<Path>) -> AppResult<u64> {
        let path = path.as_ref();
        let table = EtlCalibrationTable::load(path)?;
        let previous = std::mem::replace(&mut self.calibration, table);

        let mut next = self.snapshot.clone();
        let changed = self.calibrate_selection(&mut next);
        match self.commit(next, changed) {
            Ok(version) => {
                self.calibration_path = Some(path.to_path_buf());
                Ok(version)
            }
            Err(e) => {
                self.calibration = previous;
                Err(e)
            }
        }
    }

    fn calibrate_selection(&self, next: &mut ParameterSnapshot) -> Vec<ParameterKey> {
        match self.calibration.lookup(&next.laser, &next.zoom) {
            Some(settings) => {
                next.set_etl(settings);
                ParameterKey::ETL_CALIBRATION.to_vec()
            }
            None => {
                warn!(
                    laser = %next.laser,
                    zoom = %next.zoom,
                    "No ETL calibration for selection, keeping current ETL values"
                );
                Vec::new()
            }
        }
    }

    fn commit(&mut self, mut next: ParameterSnapshot, changed: Vec<ParameterKey>) -> AppResult<u64> {
        next.version = self.snapshot.version + 1;

        let bundle = match self.assembler.recompute(&next) {
            Ok(bundle) => bundle,
            Err(e) => {
                warn!(error = %e, "Recompute failed, previous waveforms stay active");
                return Err(e);
            }
        };

        let version = next.version;
        self.snapshot = next;
        self.bundle = Arc::new(bundle);
        debug!(version, changed = ?changed, "Waveforms recomputed");
        self.events.send_replace(ChangeEvent { version, changed });

        Ok(version)
    }
}

fn check_finite(key: ParameterKey, value: f64) -> AppResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(DaqError::Configuration(format!(
            "parameter '{key}' must be finite, got {value}"
        )))
    }
}
