//! Heating-type profiles
//!
//! Thermally slow systems (floor heating) get wider tolerance bands, longer minimum
//! intervals between adjustments and stronger derivative filtering than fast ones
//! (forced air). The values are empirically tuned starting points; every field can
//! be overridden through `ZoneConfig`.

use serde::{Deserialize, Serialize};

use crate::data::PidGains;

/// Emitter class of a zone
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "snake_case")]
pub enum HeatingType {
    FloorHydronic,
    #[default]
    Radiator,
    Convector,
    ForcedAir,
}

impl HeatingType {
    pub fn as_str(&self) -> &'static str {
        match self {
            HeatingType::FloorHydronic => "floor_hydronic",
            HeatingType::Radiator => "radiator",
            HeatingType::Convector => "convector",
            HeatingType::ForcedAir => "forced_air",
        }
    }

    /// Default profile for this heating type
    pub fn profile(&self) -> ClassProfile {
        match self {
            HeatingType::FloorHydronic => ClassProfile {
                heating_type: *self,
                thermal_time_constant_hours: 4.0,
                derivative_filter_alpha: 0.1,
                overhang_decay_multiplier: 3.0,
                thresholds: ConvergenceThresholds {
                    overshoot_max: 0.3,
                    undershoot_max: 0.3,
                    settling_time_max: 120.0,
                    rise_time_max: 180.0,
                    oscillations_max: 1,
                    drift_max: 0.3,
                },
                min_adjustment_interval_hours: 24.0,
                min_cycles_between_adjustments: 4,
                min_history: 6,
                baseline_gains: PidGains::new(18.0, 0.8, 60.0, 1.0),
            },
            HeatingType::Radiator => ClassProfile {
                heating_type: *self,
                thermal_time_constant_hours: 2.0,
                derivative_filter_alpha: 0.2,
                overhang_decay_multiplier: 2.0,
                thresholds: ConvergenceThresholds {
                    overshoot_max: 0.25,
                    undershoot_max: 0.25,
                    settling_time_max: 60.0,
                    rise_time_max: 90.0,
                    oscillations_max: 1,
                    drift_max: 0.25,
                },
                min_adjustment_interval_hours: 12.0,
                min_cycles_between_adjustments: 3,
                min_history: 4,
                baseline_gains: PidGains::new(30.0, 1.5, 30.0, 0.8),
            },
            HeatingType::Convector => ClassProfile {
                heating_type: *self,
                thermal_time_constant_hours: 1.0,
                derivative_filter_alpha: 0.3,
                overhang_decay_multiplier: 1.5,
                thresholds: ConvergenceThresholds {
                    overshoot_max: 0.2,
                    undershoot_max: 0.2,
                    settling_time_max: 45.0,
                    rise_time_max: 60.0,
                    oscillations_max: 2,
                    drift_max: 0.2,
                },
                min_adjustment_interval_hours: 6.0,
                min_cycles_between_adjustments: 3,
                min_history: 3,
                baseline_gains: PidGains::new(40.0, 2.5, 15.0, 0.5),
            },
            HeatingType::ForcedAir => ClassProfile {
                heating_type: *self,
                thermal_time_constant_hours: 0.5,
                derivative_filter_alpha: 0.4,
                overhang_decay_multiplier: 1.2,
                thresholds: ConvergenceThresholds {
                    overshoot_max: 0.15,
                    undershoot_max: 0.2,
                    settling_time_max: 20.0,
                    rise_time_max: 30.0,
                    oscillations_max: 2,
                    drift_max: 0.2,
                },
                min_adjustment_interval_hours: 4.0,
                min_cycles_between_adjustments: 3,
                min_history: 3,
                baseline_gains: PidGains::new(50.0, 4.0, 8.0, 0.3),
            },
        }
    }
}

/// Bands a cycle must stay within to count as converged
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ConvergenceThresholds {
    /// °C
    pub overshoot_max: f64,
    /// °C
    pub undershoot_max: f64,
    /// minutes
    pub settling_time_max: f64,
    /// minutes
    pub rise_time_max: f64,
    pub oscillations_max: u32,
    /// |end temp - target| in °C
    pub drift_max: f64,
}

/// Everything that differs between heating types
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ClassProfile {
    pub heating_type: HeatingType,
    pub thermal_time_constant_hours: f64,
    pub derivative_filter_alpha: f64,
    /// Integral unwinds this many times faster than it would integrate while in overhang
    pub overhang_decay_multiplier: f64,
    pub thresholds: ConvergenceThresholds,
    pub min_adjustment_interval_hours: f64,
    pub min_cycles_between_adjustments: u32,
    /// Eligible cycles required before the rule engine acts
    pub min_history: usize,
    /// Physics-derived starting gains; cumulative drift is measured against these
    pub baseline_gains: PidGains,
}

impl Default for ClassProfile {
    fn default() -> Self {
        HeatingType::default().profile()
    }
}
