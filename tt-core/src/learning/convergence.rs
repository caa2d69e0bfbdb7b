//! Convergence tracking and confidence

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::constants::time;
use crate::data::{ConvergenceThresholds, CycleMetrics};

use super::LearningConfig;

/// Whether a cycle falls inside every class threshold
pub fn is_good_cycle(metrics: &CycleMetrics, thresholds: &ConvergenceThresholds) -> bool {
    let overshoot_ok = metrics.overshoot.unwrap_or(0.0) <= thresholds.overshoot_max;
    let undershoot_ok = metrics.undershoot.unwrap_or(0.0) <= thresholds.undershoot_max;
    let settling_ok = metrics
        .settling_time
        .is_some_and(|t| t <= thresholds.settling_time_max);
    let rise_ok = metrics.rise_time.is_some_and(|t| t <= thresholds.rise_time_max);
    let oscillations_ok = metrics.oscillations <= thresholds.oscillations_max;
    let drift_ok = metrics.end_drift() <= thresholds.drift_max;

    overshoot_ok && undershoot_ok && settling_ok && rise_ok && oscillations_ok && drift_ok
}

/// Per-mode convergence bookkeeping
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ConvergenceState {
    pub consecutive_good: u32,
    /// 0.0..=1.0
    pub confidence: f64,
    pub auto_apply_count: u32,
    /// Timestamps of automatic applications, for the seasonal window
    pub auto_apply_timestamps: Vec<u64>,
    pub last_adjustment_ms: Option<u64>,
    pub cycles_at_last_adjustment: u64,
    pub total_cycles: u64,
    pub last_confidence_update_ms: Option<u64>,
    pub regime_cooldown_until_ms: Option<u64>,
}

impl ConvergenceState {
    /// Confidence lost to elapsed time since the last update
    pub fn apply_time_decay(&mut self, now_ms: u64, decay_per_day: f64) {
        if let Some(last) = self.last_confidence_update_ms {
            let days = now_ms.saturating_sub(last) as f64 / time::MS_PER_DAY as f64;
            if days > 0.0 {
                self.confidence = (self.confidence - days * decay_per_day).max(0.0);
            }
        }
        self.last_confidence_update_ms = Some(now_ms);
    }

    /// Score one learning-eligible cycle; returns whether it was good
    pub fn record(
        &mut self,
        metrics: &CycleMetrics,
        thresholds: &ConvergenceThresholds,
        config: &LearningConfig,
    ) -> bool {
        let good = is_good_cycle(metrics, thresholds);
        if good {
            self.consecutive_good = self.consecutive_good.saturating_add(1);
            self.confidence = (self.confidence + config.confidence_gain).min(1.0);
        } else {
            self.consecutive_good = 0;
            self.confidence = (self.confidence - config.confidence_loss).max(0.0);
        }
        debug!(
            good,
            consecutive = self.consecutive_good,
            confidence = self.confidence,
            "Convergence updated"
        );
        good
    }

    pub fn is_converged(&self, required: u32) -> bool {
        self.consecutive_good >= required
    }

    /// Cycles recorded since the last applied adjustment
    pub fn cycles_since_adjustment(&self) -> u64 {
        self.total_cycles.saturating_sub(self.cycles_at_last_adjustment)
    }

    /// Automatic applications at or after `window_start_ms`
    pub fn auto_applies_since(&self, window_start_ms: u64) -> u32 {
        self.auto_apply_timestamps
            .iter()
            .filter(|ts| **ts >= window_start_ms)
            .count() as u32
    }

    pub fn confidence_pct(&self) -> u8 {
        (self.confidence.clamp(0.0, 1.0) * 100.0).round() as u8
    }
}
