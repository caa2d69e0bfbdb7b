//! Adaptive gain learning
//!
//! - `history` - bounded per-mode cycle history
//! - `rules` - prioritized rule engine over aggregated cycle metrics
//! - `convergence` - convergence tracking and confidence
//! - `safety` - automatic-apply gate
//! - `validation` - post-apply validation and rollback
//! - `learner` - per-zone learner tying it together

mod convergence;
mod history;
mod learner;
mod rules;
mod safety;
mod validation;

use serde::{Deserialize, Serialize};

use crate::constants::{analysis as analysis_const, learning as learn_const, safety as safety_const};

pub use convergence::{is_good_cycle, ConvergenceState};
pub use history::CycleHistory;
pub use learner::{AdaptiveLearner, GainAdjustment, RecordResult};
pub use rules::{
    evaluate_rules, resolve_proposals, summarize, GainFactors, MetricSummary, Resolution, RuleKind,
    RuleProposal,
};
pub use safety::{
    check_auto_apply, check_rate_limit, cumulative_drift, detect_regime_shift, AutoApplyDecision,
    BlockReason, GateContext,
};
pub use validation::{ValidationOutcome, ValidationSession};

/// Learner tunables
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct LearningConfig {
    pub max_cycle_history: usize,
    pub max_pid_history: usize,
    /// Recent eligible cycles aggregated per adjustment
    pub learning_window: usize,
    pub outlier_mad_k: f64,
    pub convergence_consecutive_cycles: u32,
    pub confidence_gain: f64,
    pub confidence_loss: f64,
    pub confidence_decay_per_day: f64,
    pub learning_rate_at_zero_confidence: f64,
    pub learning_rate_at_full_confidence: f64,
    pub max_step_change: f64,
    pub kp_range: (f64, f64),
    pub ki_range: (f64, f64),
    pub kd_range: (f64, f64),
    pub min_meaningful_change: f64,
    pub safety: SafetyLimits,
}

impl Default for LearningConfig {
    fn default() -> Self {
        Self {
            max_cycle_history: learn_const::MAX_CYCLE_HISTORY,
            max_pid_history: learn_const::MAX_PID_HISTORY,
            learning_window: learn_const::LEARNING_WINDOW,
            outlier_mad_k: analysis_const::OUTLIER_MAD_K,
            convergence_consecutive_cycles: learn_const::CONVERGENCE_CONSECUTIVE_CYCLES,
            confidence_gain: learn_const::CONFIDENCE_GAIN_PER_GOOD_CYCLE,
            confidence_loss: learn_const::CONFIDENCE_LOSS_PER_BAD_CYCLE,
            confidence_decay_per_day: learn_const::CONFIDENCE_DECAY_PER_DAY,
            learning_rate_at_zero_confidence: learn_const::LEARNING_RATE_AT_ZERO_CONFIDENCE,
            learning_rate_at_full_confidence: learn_const::LEARNING_RATE_AT_FULL_CONFIDENCE,
            max_step_change: learn_const::MAX_STEP_CHANGE,
            kp_range: learn_const::KP_RANGE,
            ki_range: learn_const::KI_RANGE,
            kd_range: learn_const::KD_RANGE,
            min_meaningful_change: learn_const::MIN_MEANINGFUL_CHANGE,
            safety: SafetyLimits::default(),
        }
    }
}

impl LearningConfig {
    /// Adjustment multiplier for a confidence level, linear between the two endpoints
    pub fn learning_rate(&self, confidence: f64) -> f64 {
        let c = confidence.clamp(0.0, 1.0);
        self.learning_rate_at_zero_confidence
            + (self.learning_rate_at_full_confidence - self.learning_rate_at_zero_confidence) * c
    }
}

/// Limits on automatic application
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct SafetyLimits {
    pub max_lifetime_auto_applies: u32,
    pub season_window_days: u64,
    pub max_auto_applies_per_season: u32,
    /// Largest relative drift of kp/ki/kd from the baseline gains
    pub max_cumulative_drift: f64,
    /// °C
    pub regime_shift_threshold: f64,
    pub regime_window_cycles: usize,
    pub regime_cooldown_hours: u64,
    pub validation_cycles: usize,
    pub validation_degradation: f64,
    /// °C
    pub validation_min_baseline: f64,
}

impl Default for SafetyLimits {
    fn default() -> Self {
        Self {
            max_lifetime_auto_applies: safety_const::MAX_LIFETIME_AUTO_APPLIES,
            season_window_days: safety_const::SEASON_WINDOW_DAYS,
            max_auto_applies_per_season: safety_const::MAX_AUTO_APPLIES_PER_SEASON,
            max_cumulative_drift: safety_const::MAX_CUMULATIVE_DRIFT,
            regime_shift_threshold: safety_const::REGIME_SHIFT_THRESHOLD,
            regime_window_cycles: safety_const::REGIME_WINDOW_CYCLES,
            regime_cooldown_hours: safety_const::REGIME_COOLDOWN_HOURS,
            validation_cycles: safety_const::VALIDATION_CYCLES,
            validation_degradation: safety_const::VALIDATION_DEGRADATION,
            validation_min_baseline: safety_const::VALIDATION_MIN_BASELINE,
        }
    }
}
