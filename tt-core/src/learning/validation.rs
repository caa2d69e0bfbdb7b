//! Post-apply validation
//!
//! After an automatic application the next few learning-eligible cycles of the same
//! mode are compared with the overshoot seen before the change. There is no
//! wall-clock expiry: an idle zone simply contributes no cycles until it runs again.

use tracing::debug;

use crate::analysis::stats;
use crate::data::{CycleMetrics, CycleMode, PidSnapshot};

use super::SafetyLimits;

#[derive(Debug, Clone, PartialEq)]
pub enum ValidationOutcome {
    Pending { observed: usize, required: usize },
    Passed { mean_overshoot: f64 },
    /// Gains must go back to `rollback`
    Failed { mean_overshoot: f64, limit: f64, rollback: PidSnapshot },
}

#[derive(Debug, Clone, PartialEq)]
pub struct ValidationSession {
    pub mode: CycleMode,
    pub baseline_overshoot: f64,
    pub pre_apply: PidSnapshot,
    pub observed: Vec<f64>,
    pub required: usize,
    pub started_ms: u64,
}

impl ValidationSession {
    pub fn new(
        mode: CycleMode,
        baseline_overshoot: f64,
        pre_apply: PidSnapshot,
        required: usize,
        started_ms: u64,
    ) -> Self {
        Self {
            mode,
            baseline_overshoot,
            pre_apply,
            observed: Vec::with_capacity(required),
            required: required.max(1),
            started_ms,
        }
    }

    /// Mean overshoot above which the change counts as a regression
    pub fn limit(&self, limits: &SafetyLimits) -> f64 {
        self.baseline_overshoot.max(limits.validation_min_baseline) * (1.0 + limits.validation_degradation)
    }

    /// Feed one finalized cycle
    ///
    /// Cycles of the other mode or ones excluded from learning leave the session
    /// untouched.
    pub fn observe(&mut self, metrics: &CycleMetrics, limits: &SafetyLimits) -> ValidationOutcome {
        if metrics.mode == self.mode && metrics.is_learning_eligible() {
            self.observed.push(metrics.overshoot.unwrap_or(0.0));
            debug!(
                observed = self.observed.len(),
                required = self.required,
                "Validation cycle observed"
            );
        }

        if self.observed.len() < self.required {
            return ValidationOutcome::Pending {
                observed: self.observed.len(),
                required: self.required,
            };
        }

        let mean_overshoot = stats::mean(&self.observed).unwrap_or(0.0);
        let limit = self.limit(limits);
        if mean_overshoot > limit {
            ValidationOutcome::Failed {
                mean_overshoot,
                limit,
                rollback: self.pre_apply,
            }
        } else {
            ValidationOutcome::Passed { mean_overshoot }
        }
    }
}
