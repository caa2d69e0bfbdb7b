//! Cycle metrics over a temperature series
//!
//! All functions are pure and deterministic: the same samples always give the same
//! result. They assume heating orientation (approach from below); `analyze_cycle`
//! mirrors the series for cooling cycles.
//!
//! Overshoot, undershoot and oscillations only look at the *settling phase*, the
//! samples from the first crossing of target onwards. Excursions during the rise
//! reflect approach dynamics, not tuning error.

use crate::data::{minutes_between, CycleMode, TemperatureSample};

use super::stats;
use super::AnalysisConfig;

/// Index of the first sample at or above target
fn first_crossing(samples: &[TemperatureSample], target: f64) -> Option<usize> {
    samples.iter().position(|s| s.temp >= target)
}

/// Peak excursion above target after the first crossing
///
/// `None` if the target was never reached.
pub fn overshoot(samples: &[TemperatureSample], target: f64) -> Option<f64> {
    let idx = first_crossing(samples, target)?;
    let peak = samples[idx..]
        .iter()
        .map(|s| s.temp)
        .fold(f64::NEG_INFINITY, f64::max);
    Some((peak - target).max(0.0))
}

/// Deepest dip below target after the first crossing
///
/// When the target was never reached this is the shortfall of the warmest sample.
pub fn undershoot(samples: &[TemperatureSample], target: f64) -> Option<f64> {
    if samples.is_empty() {
        return None;
    }

    match first_crossing(samples, target) {
        Some(idx) => {
            let trough = samples[idx..]
                .iter()
                .map(|s| s.temp)
                .fold(f64::INFINITY, f64::min);
            Some((target - trough).max(0.0))
        }
        None => {
            let peak = samples.iter().map(|s| s.temp).fold(f64::NEG_INFINITY, f64::max);
            Some((target - peak).max(0.0))
        }
    }
}

/// Sign changes of `temp - target` in the settling phase
///
/// A change only counts once the temperature leaves the `hysteresis` band on the
/// other side, so sensor noise around the crossing point is not double-counted.
pub fn oscillations(samples: &[TemperatureSample], target: f64, hysteresis: f64) -> u32 {
    let Some(idx) = first_crossing(samples, target) else {
        return 0;
    };

    let band = hysteresis.abs();
    let mut above = true;
    let mut count = 0;

    for sample in &samples[idx + 1..] {
        let delta = sample.temp - target;
        if above && delta < -band {
            above = false;
            count += 1;
        } else if !above && delta > band {
            above = true;
            count += 1;
        }
    }

    count
}

/// Minutes from `reference_ms` until the temperature settles
///
/// Settled means a run of `settling_window` consecutive samples, all within
/// `settling_tolerance` of target, whose MAD is below `settling_mad_threshold`.
/// The result is measured to the start of that run.
pub fn settling_time(
    samples: &[TemperatureSample],
    target: f64,
    reference_ms: u64,
    config: &AnalysisConfig,
) -> Option<f64> {
    let start = samples.iter().position(|s| s.timestamp_ms >= reference_ms)?;
    let tail = &samples[start..];
    let window = config.settling_window.max(2);

    if tail.len() < window {
        return None;
    }

    for run in tail.windows(window) {
        let within_band = run
            .iter()
            .all(|s| (s.temp - target).abs() <= config.settling_tolerance);
        if !within_band {
            continue;
        }

        let temps: Vec<f64> = run.iter().map(|s| s.temp).collect();
        if let Some(spread) = stats::mad(&temps) {
            if spread < config.settling_mad_threshold {
                return Some(minutes_between(reference_ms, run[0].timestamp_ms));
            }
        }
    }

    None
}

/// Minutes from the first sample until temperature reaches `target - tolerance`
///
/// `None` if it never gets there within the series.
pub fn rise_time(samples: &[TemperatureSample], target: f64, tolerance: f64) -> Option<f64> {
    let first = samples.first()?;
    let threshold = target - tolerance;
    samples
        .iter()
        .find(|s| s.temp >= threshold)
        .map(|s| minutes_between(first.timestamp_ms, s.timestamp_ms))
}

/// All metrics for one cycle
#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct CycleAnalysis {
    pub overshoot: Option<f64>,
    pub undershoot: Option<f64>,
    pub oscillations: u32,
    pub settling_time: Option<f64>,
    pub rise_time: Option<f64>,
}

/// Negate temperatures so a cooling cycle reads like a heating one
fn mirrored(samples: &[TemperatureSample]) -> Vec<TemperatureSample> {
    samples
        .iter()
        .map(|s| TemperatureSample::new(s.timestamp_ms, -s.temp))
        .collect()
}

/// Run every metric for a cycle in the given mode
///
/// `settling_reference_ms` is normally the instant the device turned off; the cycle
/// start is used when it is unknown.
pub fn analyze_cycle(
    mode: CycleMode,
    samples: &[TemperatureSample],
    target: f64,
    settling_reference_ms: Option<u64>,
    config: &AnalysisConfig,
) -> CycleAnalysis {
    let Some(first) = samples.first() else {
        return CycleAnalysis::default();
    };
    let reference = settling_reference_ms.unwrap_or(first.timestamp_ms);

    let (series, oriented_target) = match mode {
        CycleMode::Heat => (samples.to_vec(), target),
        CycleMode::Cool => (mirrored(samples), -target),
    };

    CycleAnalysis {
        overshoot: overshoot(&series, oriented_target),
        undershoot: undershoot(&series, oriented_target),
        oscillations: oscillations(&series, oriented_target, config.oscillation_hysteresis),
        settling_time: settling_time(&series, oriented_target, reference, config),
        rise_time: rise_time(&series, oriented_target, config.rise_tolerance),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: u64 = 60_000;

    fn series(temps: &[f64], step_minutes: u64) -> Vec<TemperatureSample> {
        temps
            .iter()
            .enumerate()
            .map(|(i, t)| TemperatureSample::new(i as u64 * step_minutes * MIN, *t))
            .collect()
    }

    #[test]
    fn test_overshoot_ignores_rise_phase() {
        // Monotonic approach that stops exactly at target
        let samples = series(&[19.0, 19.4, 19.8, 19.95, 20.0, 20.0, 20.0], 5);
        assert_eq!(overshoot(&samples, 20.0), Some(0.0));
    }

    #[test]
    fn test_overshoot_none_when_never_reached() {
        let samples = series(&[19.0, 19.3, 19.5], 5);
        assert_eq!(overshoot(&samples, 20.0), None);
        assert!((undershoot(&samples, 20.0).unwrap() - 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_overshoot_and_undershoot_after_crossing() {
        let samples = series(&[19.0, 19.6, 20.1, 20.4, 20.2, 19.8, 20.0], 5);
        assert!((overshoot(&samples, 20.0).unwrap() - 0.4).abs() < 1e-9);
        assert!((undershoot(&samples, 20.0).unwrap() - 0.2).abs() < 1e-9);
    }

    #[test]
    fn test_oscillations_respect_hysteresis() {
        // Noise of ±0.05 around target must not count
        let noisy = series(&[19.0, 20.0, 19.95, 20.05, 19.96, 20.04], 1);
        assert_eq!(oscillations(&noisy, 20.0, 0.1), 0);

        let swinging = series(&[19.0, 20.2, 19.8, 20.2, 19.8], 1);
        assert_eq!(oscillations(&swinging, 20.0, 0.1), 3);
    }

    #[test]
    fn test_rise_time() {
        let samples = series(&[18.0, 18.8, 19.5, 19.85, 20.0], 10);
        // reaches 19.8 (20.0 - 0.2) at the 4th sample: 30 minutes
        assert_eq!(rise_time(&samples, 20.0, 0.2), Some(30.0));
        assert_eq!(rise_time(&series(&[18.0, 18.5], 10), 20.0, 0.2), None);
    }

    #[test]
    fn test_settling_time_from_reference() {
        let samples = series(
            &[19.0, 19.8, 20.5, 20.4, 20.0, 20.02, 20.0, 20.01, 20.0, 20.0],
            5,
        );
        let config = AnalysisConfig::default();
        // device off at minute 10, settled run starts at index 4 (minute 20)
        assert_eq!(settling_time(&samples, 20.0, 10 * MIN, &config), Some(10.0));
    }

    #[test]
    fn test_settling_time_none_when_unsettled() {
        let samples = series(&[20.5, 19.5, 20.5, 19.5, 20.5, 19.5], 5);
        assert_eq!(settling_time(&samples, 20.0, 0, &AnalysisConfig::default()), None);
    }

    #[test]
    fn test_analysis_is_deterministic() {
        let samples = series(&[19.0, 19.7, 20.2, 20.3, 19.9, 20.1, 20.0, 20.0, 20.0, 20.0], 5);
        let config = AnalysisConfig::default();
        let a = analyze_cycle(CycleMode::Heat, &samples, 20.0, Some(15 * MIN), &config);
        let b = analyze_cycle(CycleMode::Heat, &samples, 20.0, Some(15 * MIN), &config);
        assert_eq!(a, b);
    }

    #[test]
    fn test_cooling_cycle_is_mirrored() {
        // Cooling from 26 towards 24, dipping to 23.7
        let samples = series(&[26.0, 25.2, 24.4, 23.9, 23.7, 23.9, 24.0, 24.0, 24.0, 24.0], 5);
        let analysis = analyze_cycle(
            CycleMode::Cool,
            &samples,
            24.0,
            Some(20 * MIN),
            &AnalysisConfig::default(),
        );
        assert!((analysis.overshoot.unwrap() - 0.3).abs() < 1e-9);
        assert!(analysis.rise_time.is_some());
    }
}
