//! Pure waveform generators.
//!
//! Every generator returns a dense `Array1<f64>` of exactly
//! `floor(samplerate * sweeptime)` samples. Percentages are percent of the
//! sweep time; out-of-range percentages are clipped to the buffer rather than
//! rejected. Invalid timing (non-positive, non-finite, or a zero sample count)
//! fails with [`DaqError::Configuration`] before anything is allocated.

use std::f64::consts::{PI, TAU};

use ndarray::{s, Array1};

use crate::error::{AppResult, DaqError};

/// Number of samples in one sweep.
///
/// # Errors
///
/// Returns `Configuration` if either input is non-finite or non-positive, or if
/// the product rounds down to zero samples.
pub fn sample_count(samplerate: f64, sweeptime: f64) -> AppResult<usize> {
    if !samplerate.is_finite() || samplerate <= 0.0 {
        return Err(DaqError::Configuration(format!(
            "samplerate must be a positive finite number, got {samplerate}"
        )));
    }
    if !sweeptime.is_finite() || sweeptime <= 0.0 {
        return Err(DaqError::Configuration(format!(
            "sweeptime must be a positive finite number, got {sweeptime}"
        )));
    }

    let samples = (samplerate * sweeptime).floor();
    if samples < 1.0 {
        return Err(DaqError::Configuration(format!(
            "samplerate {samplerate} Hz x sweeptime {sweeptime} s yields zero samples"
        )));
    }
    if samples > usize::MAX as f64 {
        return Err(DaqError::Configuration(format!(
            "sample count {samples} does not fit in memory"
        )));
    }

    Ok(samples as usize)
}

/// Converts a percentage of the sweep into a sample index in `[0, samples]`.
pub(crate) fn percent_to_samples(samples: usize, pct: f64) -> usize {
    if !pct.is_finite() || pct <= 0.0 {
        return 0;
    }
    let idx = (samples as f64 * pct / 100.0).floor();
    if idx >= samples as f64 {
        samples
    } else {
        idx as usize
    }
}

fn ensure_finite(name: &str, value: f64) -> AppResult<()> {
    if value.is_finite() {
        Ok(())
    } else {
        Err(DaqError::Configuration(format!(
            "{name} must be finite, got {value}"
        )))
    }
}

/// Rectangular pulse: `offset` everywhere except `[delay, delay + pulse)`,
/// which holds `amplitude + offset`.
pub fn single_pulse(
    samplerate: f64,
    sweeptime: f64,
    delay_pct: f64,
    pulse_pct: f64,
    amplitude: f64,
    offset: f64,
) -> AppResult<Array1<f64>> {
    let samples = sample_count(samplerate, sweeptime)?;
    ensure_finite("amplitude", amplitude)?;
    ensure_finite("offset", offset)?;

    let start = percent_to_samples(samples, delay_pct);
    let width = percent_to_samples(samples, pulse_pct);
    let end = start.saturating_add(width).min(samples);

    let mut wave = Array1::from_elem(samples, offset);
    if start < end {
        wave.slice_mut(s![start..end]).fill(amplitude + offset);
    }
    Ok(wave)
}

/// Trapezoid: flat during the delay, linear rise to `amplitude + offset`,
/// linear fall back to `offset`, flat for the remainder.
///
/// Rise steps are `amplitude / (rise% * sweeptime * samplerate)`, measured
/// on the exact rise length rather than the whole samples it covers, so a
/// fractional rise ends slightly below the full amplitude. The fall starts
/// from that peak and reaches `offset` on its last sample. Segments running
/// past the end of the sweep are cut off.
pub fn ramp(
    samplerate: f64,
    sweeptime: f64,
    delay_pct: f64,
    rise_pct: f64,
    fall_pct: f64,
    amplitude: f64,
    offset: f64,
) -> AppResult<Array1<f64>> {
    let samples = sample_count(samplerate, sweeptime)?;
    ensure_finite("amplitude", amplitude)?;
    ensure_finite("offset", offset)?;

    let delay = percent_to_samples(samples, delay_pct);
    let rise = percent_to_samples(samples, rise_pct);
    let fall = percent_to_samples(samples, fall_pct);

    let mut wave = Array1::from_elem(samples, offset);

    let exact_rise = samplerate * sweeptime * rise_pct / 100.0;
    let mut peak = offset;
    for k in 0..rise {
        let idx = delay + k;
        if idx >= samples {
            break;
        }
        let fraction = ((k + 1) as f64 / exact_rise).min(1.0);
        peak = offset + amplitude * fraction;
        wave[idx] = peak;
    }

    let fall_start = delay + rise;
    for k in 0..fall {
        let idx = fall_start + k;
        if idx >= samples {
            break;
        }
        wave[idx] = peak + (offset - peak) * (k + 1) as f64 / fall as f64;
    }

    Ok(wave)
}

/// Phase of sample `i` wrapped to `[0, 2π)`.
fn wrapped_phase(i: usize, samplerate: f64, frequency: f64, phase: f64) -> f64 {
    let t = i as f64 / samplerate;
    (TAU * frequency * t + phase).rem_euclid(TAU)
}

fn duty_fraction(dutycycle_pct: f64) -> f64 {
    (dutycycle_pct / 100.0).clamp(0.0, 1.0)
}

/// Sawtooth/triangle sweep in `[-1, 1]`, scaled by `amplitude` and shifted by
/// `offset`.
///
/// The duty cycle sets the rising fraction of each period: 100 % is a rising
/// sawtooth, 50 % a symmetric triangle, 0 % a falling sawtooth. Frequencies
/// above Nyquist alias.
pub fn periodic_sweep(
    samplerate: f64,
    sweeptime: f64,
    frequency: f64,
    amplitude: f64,
    offset: f64,
    dutycycle_pct: f64,
    phase: f64,
) -> AppResult<Array1<f64>> {
    let samples = sample_count(samplerate, sweeptime)?;
    ensure_finite("frequency", frequency)?;
    ensure_finite("amplitude", amplitude)?;
    ensure_finite("offset", offset)?;
    ensure_finite("phase", phase)?;
    ensure_finite("duty cycle", dutycycle_pct)?;

    let width = duty_fraction(dutycycle_pct);

    Ok(Array1::from_shape_fn(samples, |i| {
        let tmod = wrapped_phase(i, samplerate, frequency, phase);
        let unit = if tmod < width * TAU {
            tmod / (PI * width) - 1.0
        } else {
            (PI * (width + 1.0) - tmod) / (PI * (1.0 - width))
        };
        amplitude * unit + offset
    }))
}

/// Square wave switching between `offset + amplitude` (for the duty-cycle
/// fraction of each period) and `offset - amplitude`.
pub fn square(
    samplerate: f64,
    sweeptime: f64,
    frequency: f64,
    amplitude: f64,
    offset: f64,
    dutycycle_pct: f64,
    phase: f64,
) -> AppResult<Array1<f64>> {
    let samples = sample_count(samplerate, sweeptime)?;
    ensure_finite("frequency", frequency)?;
    ensure_finite("amplitude", amplitude)?;
    ensure_finite("offset", offset)?;
    ensure_finite("phase", phase)?;
    ensure_finite("duty cycle", dutycycle_pct)?;

    let width = duty_fraction(dutycycle_pct);

    Ok(Array1::from_shape_fn(samples, |i| {
        let tmod = wrapped_phase(i, samplerate, frequency, phase);
        let unit = if tmod < width * TAU { 1.0 } else { -1.0 };
        amplitude * unit + offset
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_count_floors() {
        assert_eq!(sample_count(100_000.0, 0.1).unwrap(), 10_000);
        assert_eq!(sample_count(1000.0, 0.0015).unwrap(), 1);
        assert_eq!(sample_count(333.0, 0.01).unwrap(), 3);
    }

    #[test]
    fn test_sample_count_rejects_invalid_timing() {
        assert!(matches!(
            sample_count(0.0, 1.0),
            Err(DaqError::Configuration(_))
        ));
        assert!(matches!(
            sample_count(1000.0, -0.1),
            Err(DaqError::Configuration(_))
        ));
        assert!(matches!(
            sample_count(f64::NAN, 1.0),
            Err(DaqError::Configuration(_))
        ));
        assert!(matches!(
            sample_count(1000.0, 0.0001),
            Err(DaqError::Configuration(_))
        ));
    }

    #[test]
    fn test_single_pulse_reference_case() {
        let wave = single_pulse(1000.0, 1.0, 10.0, 20.0, 5.0, 0.0).unwrap();
        assert_eq!(wave.len(), 1000);
        assert!(wave.slice(s![0..100]).iter().all(|&v| v == 0.0));
        assert!(wave.slice(s![100..300]).iter().all(|&v| v == 5.0));
        assert!(wave.slice(s![300..]).iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_single_pulse_truncated_at_sweep_end() {
        let wave = single_pulse(1000.0, 1.0, 90.0, 50.0, 1.0, 0.5).unwrap();
        assert_eq!(wave[899], 0.5);
        assert!(wave.slice(s![900..]).iter().all(|&v| v == 1.5));
    }

    #[test]
    fn test_single_pulse_clips_out_of_range_percentages() {
        let wave = single_pulse(1000.0, 1.0, -10.0, 250.0, 2.0, 0.0).unwrap();
        assert!(wave.iter().all(|&v| v == 2.0));

        let wave = single_pulse(1000.0, 1.0, 120.0, 10.0, 2.0, 0.0).unwrap();
        assert!(wave.iter().all(|&v| v == 0.0));
    }

    #[test]
    fn test_ramp_shape() {
        let wave = ramp(1000.0, 1.0, 10.0, 20.0, 10.0, 2.0, 1.0).unwrap();
        assert_eq!(wave.len(), 1000);
        assert!(wave.slice(s![0..100]).iter().all(|&v| v == 1.0));
        assert!((wave[299] - 3.0).abs() < 1e-12);
        assert!((wave[399] - 1.0).abs() < 1e-12);
        assert!(wave.slice(s![400..]).iter().all(|&v| v == 1.0));
        for i in 100..300 {
            assert!(wave[i] > wave[i - 1]);
        }
    }

    #[test]
    fn test_ramp_rise_slope_bounded() {
        let wave = ramp(10_000.0, 0.1, 5.0, 40.0, 40.0, 1.5, -0.5).unwrap();
        let rise_samples = 400.0;
        let bound = 1.5 / rise_samples + 1e-12;
        for i in 50..450 {
            assert!((wave[i] - wave[i - 1]).abs() <= bound);
        }
    }

    #[test]
    fn test_ramp_fractional_rise_keeps_exact_slope() {
        // 999 samples, 10 % rise = 99.95 exact samples over 99 whole ones
        let wave = ramp(1000.0, 0.9995, 0.0, 10.0, 10.0, 1.0, 0.0).unwrap();
        assert_eq!(wave.len(), 999);
        let bound = 1.0 / (0.10 * 0.9995 * 1000.0) + 1e-12;
        assert!((wave[0] - 1.0 / 99.95).abs() < 1e-12);
        for i in 1..99 {
            assert!((wave[i] - wave[i - 1]).abs() <= bound);
        }
        assert!(wave[98] < 1.0);
        assert!(wave[197].abs() < 1e-12);
    }

    #[test]
    fn test_periodic_sweep_triangle_range() {
        let wave = periodic_sweep(10_000.0, 0.1, 100.0, 2.0, 0.5, 50.0, 0.0).unwrap();
        assert_eq!(wave.len(), 1000);
        assert!((wave[0] - (-1.5)).abs() < 1e-9);
        assert!((wave[50] - 2.5).abs() < 1e-9);
        assert!(wave.iter().all(|&v| (-1.5 - 1e-9..=2.5 + 1e-9).contains(&v)));
    }

    #[test]
    fn test_periodic_sweep_duty_cycle_clamped() {
        let over = periodic_sweep(1000.0, 0.1, 10.0, 1.0, 0.0, 150.0, 0.0).unwrap();
        let full = periodic_sweep(1000.0, 0.1, 10.0, 1.0, 0.0, 100.0, 0.0).unwrap();
        assert_eq!(over, full);

        let under = periodic_sweep(1000.0, 0.1, 10.0, 1.0, 0.0, -20.0, 0.0).unwrap();
        assert!(under.iter().all(|v| v.is_finite()));
    }

    #[test]
    fn test_periodic_sweep_accepts_aliasing_frequency() {
        let wave = periodic_sweep(1000.0, 0.1, 2500.0, 1.0, 0.0, 50.0, 0.0).unwrap();
        assert_eq!(wave.len(), 100);
    }

    #[test]
    fn test_square_duty_cycle() {
        // small phase keeps the duty-cycle edge off a sample instant
        let wave = square(1000.0, 1.0, 10.0, 1.0, 0.0, 25.0, 0.01).unwrap();
        let high = wave.iter().filter(|&&v| v > 0.0).count();
        assert_eq!(high, 250);
        assert!(wave.iter().all(|&v| v == 1.0 || v == -1.0));
    }

    #[test]
    fn test_generators_are_deterministic() {
        let a = periodic_sweep(20_000.0, 0.05, 99.9, 2.5, 0.0, 50.0, PI / 2.0).unwrap();
        let b = periodic_sweep(20_000.0, 0.05, 99.9, 2.5, 0.0, 50.0, PI / 2.0).unwrap();
        assert_eq!(a, b);
    }

    #[test]
    fn test_generators_reject_non_finite_inputs() {
        assert!(single_pulse(1000.0, 1.0, 0.0, 10.0, f64::INFINITY, 0.0).is_err());
        assert!(ramp(1000.0, 1.0, 0.0, 10.0, 10.0, 1.0, f64::NAN).is_err());
        assert!(square(1000.0, 1.0, f64::NAN, 1.0, 0.0, 50.0, 0.0).is_err());
    }
}
