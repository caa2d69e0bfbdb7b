//! Core data types for Thermotune
//!
//! Defines the records shared between the controller, the cycle tracker and the learner.

use serde::{Deserialize, Serialize};
use tt_protocol::HvacMode;

use crate::constants::time;

/// Direction of a heating/cooling cycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum CycleMode {
    Heat,
    Cool,
}

impl CycleMode {
    /// Cycle mode for an HVAC mode; `None` when the system is off
    pub fn from_hvac(mode: HvacMode) -> Option<Self> {
        match mode {
            HvacMode::Heat => Some(CycleMode::Heat),
            HvacMode::Cool => Some(CycleMode::Cool),
            HvacMode::Off => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            CycleMode::Heat => "heat",
            CycleMode::Cool => "cool",
        }
    }
}

/// A single zone temperature reading
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct TemperatureSample {
    pub timestamp_ms: u64,
    pub temp: f64,
}

impl TemperatureSample {
    pub fn new(timestamp_ms: u64, temp: f64) -> Self {
        Self { timestamp_ms, temp }
    }
}

/// Controller gains
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PidGains {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    #[serde(default)]
    pub ke: f64,
}

impl PidGains {
    pub fn new(kp: f64, ki: f64, kd: f64, ke: f64) -> Self {
        Self { kp, ki, kd, ke }
    }

    pub fn is_finite(&self) -> bool {
        self.kp.is_finite() && self.ki.is_finite() && self.kd.is_finite() && self.ke.is_finite()
    }
}

/// Why gains changed
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GainChangeReason {
    /// Physics-derived starting point
    Baseline,
    AutoApply,
    Manual,
    Rollback,
    Reset,
    #[serde(other)]
    Unknown,
}

/// Point-in-time copy of the controller gains for audit and rollback
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct PidSnapshot {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    #[serde(default)]
    pub ke: f64,
    #[serde(default = "unknown_reason")]
    pub reason: GainChangeReason,
    #[serde(rename = "timestamp", alias = "timestamp_ms", default)]
    pub timestamp_ms: u64,
}

fn unknown_reason() -> GainChangeReason {
    GainChangeReason::Unknown
}

impl PidSnapshot {
    pub fn new(gains: PidGains, reason: GainChangeReason, timestamp_ms: u64) -> Self {
        Self {
            kp: gains.kp,
            ki: gains.ki,
            kd: gains.kd,
            ke: gains.ke,
            reason,
            timestamp_ms,
        }
    }

    pub fn gains(&self) -> PidGains {
        PidGains::new(self.kp, self.ki, self.kd, self.ke)
    }
}

/// Conditions during a cycle that make it unrepresentative for tuning
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DisturbanceFlags {
    #[serde(default)]
    pub solar_gain: bool,
    #[serde(default)]
    pub outdoor_swing: bool,
    #[serde(default)]
    pub mass_recovery: bool,
}

impl DisturbanceFlags {
    pub fn any(&self) -> bool {
        self.solar_gain || self.outdoor_swing || self.mass_recovery
    }
}

/// Something that happened mid-cycle without aborting it
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum InterruptionKind {
    /// Small setpoint edit while the device was idle
    SetpointMinor { old: f64, new: f64 },
    /// Setpoint edit while the device was running
    SetpointWhileActive { old: f64, new: f64 },
    /// Contact opened and closed again within the grace period
    ContactPause { duration_secs: u64 },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Interruption {
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub kind: InterruptionKind,
}

impl Interruption {
    /// Setpoint edits move the reference the cycle is measured against
    pub fn affects_learning(&self) -> bool {
        matches!(
            self.kind,
            InterruptionKind::SetpointMinor { .. } | InterruptionKind::SetpointWhileActive { .. }
        )
    }
}

/// Integral behaviour observed over a cycle
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq)]
pub struct IntegralDiagnostics {
    #[serde(default)]
    pub integral_at_start: Option<f64>,
    #[serde(default)]
    pub integral_at_device_off: Option<f64>,
    #[serde(default)]
    pub integral_at_end: Option<f64>,
    /// Controller steps that unwound the integral during thermal overhang
    #[serde(default)]
    pub overhang_decay_steps: u32,
    /// Controller steps taken by the untuned-system safety net
    #[serde(default)]
    pub safety_net_decay_steps: u32,
}

/// Outcome of one completed heating/cooling cycle
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CycleMetrics {
    pub mode: CycleMode,
    pub start_ms: u64,
    #[serde(default)]
    pub end_ms: u64,
    pub start_temp: f64,
    #[serde(default)]
    pub end_temp: f64,
    pub target_temp: f64,
    pub duration_minutes: f64,
    #[serde(default)]
    pub overshoot: Option<f64>,
    #[serde(default)]
    pub undershoot: Option<f64>,
    #[serde(default)]
    pub settling_time: Option<f64>,
    #[serde(default)]
    pub oscillations: u32,
    #[serde(default)]
    pub rise_time: Option<f64>,
    #[serde(default)]
    pub outdoor_temp_avg: Option<f64>,
    #[serde(default)]
    pub disturbances: DisturbanceFlags,
    #[serde(default)]
    pub was_clamped: bool,
    #[serde(default)]
    pub interruptions: Vec<Interruption>,
    #[serde(default)]
    pub integral: IntegralDiagnostics,
    /// Finalized by the settling timeout rather than detected settling
    #[serde(default)]
    pub timed_out: bool,
}

impl CycleMetrics {
    pub fn is_disturbed(&self) -> bool {
        self.disturbances.any()
    }

    /// Whether the cycle may feed the learner's aggregates
    pub fn is_learning_eligible(&self) -> bool {
        !self.is_disturbed() && !self.interruptions.iter().any(Interruption::affects_learning)
    }

    /// Distance of the final temperature from target
    pub fn end_drift(&self) -> f64 {
        (self.end_temp - self.target_temp).abs()
    }
}

/// Minutes between two millisecond timestamps (saturating at zero)
pub fn minutes_between(from_ms: u64, to_ms: u64) -> f64 {
    to_ms.saturating_sub(from_ms) as f64 / time::MS_PER_MINUTE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_snapshot_uses_timestamp_key() {
        let snap = PidSnapshot::new(PidGains::new(1.0, 2.0, 3.0, 0.5), GainChangeReason::Manual, 99);
        let json = serde_json::to_value(snap).unwrap();
        assert_eq!(json["timestamp"], 99);
        assert_eq!(json["reason"], "manual");
    }

    #[test]
    fn test_snapshot_tolerates_legacy_reason() {
        let snap: PidSnapshot =
            serde_json::from_str(r#"{"kp":1,"ki":2,"kd":3,"reason":"physics_init"}"#).unwrap();
        assert_eq!(snap.reason, GainChangeReason::Unknown);
        assert_eq!(snap.ke, 0.0);
        assert_eq!(snap.timestamp_ms, 0);
    }

    #[test]
    fn test_setpoint_interruptions_exclude_from_learning() {
        let mut metrics: CycleMetrics = serde_json::from_str(
            r#"{"mode":"heat","start_ms":0,"start_temp":19.0,"target_temp":20.0,"duration_minutes":30}"#,
        )
        .unwrap();
        assert!(metrics.is_learning_eligible());

        metrics.interruptions.push(Interruption {
            timestamp_ms: 10,
            kind: InterruptionKind::ContactPause { duration_secs: 30 },
        });
        assert!(metrics.is_learning_eligible());

        metrics.interruptions.push(Interruption {
            timestamp_ms: 20,
            kind: InterruptionKind::SetpointWhileActive { old: 20.0, new: 20.5 },
        });
        assert!(!metrics.is_learning_eligible());
    }

    #[test]
    fn test_minutes_between_saturates() {
        assert_eq!(minutes_between(120_000, 60_000), 0.0);
        assert_eq!(minutes_between(0, 90_000), 1.5);
    }
}
