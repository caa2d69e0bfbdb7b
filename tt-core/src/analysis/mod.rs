//! Cycle analysis
//!
//! Pure statistics over an ordered temperature series:
//! - `stats` - median, MAD and outlier rejection
//! - `cycle` - overshoot, undershoot, oscillations, settling and rise time

mod cycle;
pub mod stats;

use serde::{Deserialize, Serialize};

use crate::constants::analysis as defaults;

pub use cycle::{
    analyze_cycle, oscillations, overshoot, rise_time, settling_time, undershoot, CycleAnalysis,
};
pub use stats::{mad, mean, median, reject_outliers};

/// Tunables for cycle analysis
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct AnalysisConfig {
    /// °C band around target that a swing must leave to count as an oscillation
    pub oscillation_hysteresis: f64,
    /// °C
    pub settling_tolerance: f64,
    /// °C
    pub settling_mad_threshold: f64,
    /// Consecutive samples in a settling run
    pub settling_window: usize,
    /// °C below target at which the rise phase ends
    pub rise_tolerance: f64,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            oscillation_hysteresis: defaults::DEFAULT_OSCILLATION_HYSTERESIS,
            settling_tolerance: defaults::DEFAULT_SETTLING_TOLERANCE,
            settling_mad_threshold: defaults::DEFAULT_SETTLING_MAD_THRESHOLD,
            settling_window: defaults::DEFAULT_SETTLING_WINDOW,
            rise_tolerance: defaults::DEFAULT_RISE_TOLERANCE,
        }
    }
}
