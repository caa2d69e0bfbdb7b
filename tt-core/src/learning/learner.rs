//! Per-zone adaptive learner
//!
//! Owns one history, convergence state and gain set per mode plus at most one
//! validation session. Finalized cycles come in through `record_cycle`; proposals
//! come out of `calculate_adjustment` and only take effect through
//! `apply_adjustment`.

use std::collections::VecDeque;

use serde_json::Value;
use tracing::{debug, info, warn};
use tt_protocol::LearningStatus;

use crate::analysis::stats;
use crate::constants::time;
use crate::data::{
    ClassProfile, CycleMetrics, CycleMode, GainChangeReason, ModeRecord, PidGains, PidSnapshot,
    ValidationRecord, ZoneRecord,
};

use super::rules::{evaluate_rules, resolve_proposals, summarize, RuleKind};
use super::safety::{check_auto_apply, check_rate_limit, detect_regime_shift, AutoApplyDecision, BlockReason, GateContext};
use super::validation::{ValidationOutcome, ValidationSession};
use super::{ConvergenceState, CycleHistory, LearningConfig};

/// What happened when a cycle was recorded
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RecordResult {
    /// Cycle was eligible and inside every threshold
    pub good: bool,
    pub converged: bool,
    /// Gains restored by a failed validation
    pub rollback: Option<PidGains>,
    pub validation_passed: bool,
}

/// A proposed gain change
#[derive(Debug, Clone, PartialEq)]
pub struct GainAdjustment {
    pub mode: CycleMode,
    pub from: PidGains,
    pub to: PidGains,
    pub rules: Vec<RuleKind>,
    pub suppressed: Vec<(RuleKind, &'static str)>,
    pub learning_rate: f64,
    pub confidence: f64,
}

impl GainAdjustment {
    pub fn describe(&self) -> String {
        let rules: Vec<&str> = self.rules.iter().map(RuleKind::as_str).collect();
        format!(
            "kp {:.3}->{:.3} ki {:.4}->{:.4} kd {:.3}->{:.3} ({})",
            self.from.kp,
            self.to.kp,
            self.from.ki,
            self.to.ki,
            self.from.kd,
            self.to.kd,
            rules.join(", ")
        )
    }
}

#[derive(Debug, Clone)]
struct ModeLearning {
    history: CycleHistory,
    convergence: ConvergenceState,
    gains: PidGains,
    pid_history: VecDeque<PidSnapshot>,
    /// Persisted controller integral not yet handed back to a controller
    restored_integral: Option<f64>,
}

impl ModeLearning {
    fn new(gains: PidGains, history_capacity: usize) -> Self {
        Self {
            history: CycleHistory::new(history_capacity),
            convergence: ConvergenceState::default(),
            gains,
            pid_history: VecDeque::new(),
            restored_integral: None,
        }
    }

    /// Snapshot in force before the automatic apply stamped `applied_ms`
    fn prior_snapshot(&self, applied_ms: u64) -> Option<PidSnapshot> {
        let idx = self
            .pid_history
            .iter()
            .rposition(|s| s.reason == GainChangeReason::AutoApply && s.timestamp_ms == applied_ms)?;
        let prior = self.pid_history.get(idx.checked_sub(1)?)?;
        prior.gains().is_finite().then_some(*prior)
    }

    fn push_snapshot(&mut self, snapshot: PidSnapshot, capacity: usize) {
        while self.pid_history.len() >= capacity.max(1) {
            self.pid_history.pop_front();
        }
        self.pid_history.push_back(snapshot);
    }

    fn to_record(&self) -> ModeRecord {
        let c = &self.convergence;
        ModeRecord {
            cycle_history: self.history.to_vec(),
            convergence_confidence: c.confidence,
            auto_apply_count: c.auto_apply_count,
            pid_history: self.pid_history.iter().copied().collect(),
            consecutive_good: c.consecutive_good,
            auto_apply_timestamps: c.auto_apply_timestamps.clone(),
            last_adjustment_ms: c.last_adjustment_ms,
            cycles_at_last_adjustment: c.cycles_at_last_adjustment,
            total_cycles: c.total_cycles,
            last_confidence_update_ms: c.last_confidence_update_ms,
            regime_cooldown_until_ms: c.regime_cooldown_until_ms,
            validation: None,
            integral: self.restored_integral,
        }
    }

    fn restore(&mut self, record: ModeRecord, config: &LearningConfig) {
        self.history.clear();
        for cycle in record.cycle_history {
            self.history.push(cycle);
        }

        self.convergence = ConvergenceState {
            consecutive_good: record.consecutive_good,
            confidence: record.convergence_confidence,
            auto_apply_count: record.auto_apply_count,
            auto_apply_timestamps: record.auto_apply_timestamps,
            last_adjustment_ms: record.last_adjustment_ms,
            cycles_at_last_adjustment: record.cycles_at_last_adjustment.min(record.total_cycles),
            total_cycles: record.total_cycles,
            last_confidence_update_ms: record.last_confidence_update_ms,
            regime_cooldown_until_ms: record.regime_cooldown_until_ms,
        };

        self.pid_history.clear();
        for snapshot in record.pid_history {
            self.push_snapshot(snapshot, config.max_pid_history);
        }
        if let Some(last) = self.pid_history.back() {
            let gains = last.gains();
            if gains.is_finite() {
                self.gains = gains;
            }
        }
        self.restored_integral = record.integral;
    }
}

/// Adaptive gain learner for one zone
#[derive(Debug, Clone)]
pub struct AdaptiveLearner {
    profile: ClassProfile,
    config: LearningConfig,
    heating: ModeLearning,
    cooling: ModeLearning,
    validation: Option<ValidationSession>,
}

impl AdaptiveLearner {
    /// Both modes start from the profile's baseline gains
    pub fn new(profile: ClassProfile, config: LearningConfig) -> Self {
        let gains = profile.baseline_gains;
        Self {
            heating: ModeLearning::new(gains, config.max_cycle_history),
            cooling: ModeLearning::new(gains, config.max_cycle_history),
            profile,
            config,
            validation: None,
        }
    }

    /// Starting gains for one mode instead of the baseline
    pub fn with_gains(mut self, mode: CycleMode, gains: PidGains) -> Self {
        self.mode_mut(mode).gains = gains;
        self
    }

    fn mode(&self, mode: CycleMode) -> &ModeLearning {
        match mode {
            CycleMode::Heat => &self.heating,
            CycleMode::Cool => &self.cooling,
        }
    }

    fn mode_mut(&mut self, mode: CycleMode) -> &mut ModeLearning {
        match mode {
            CycleMode::Heat => &mut self.heating,
            CycleMode::Cool => &mut self.cooling,
        }
    }

    pub fn profile(&self) -> &ClassProfile {
        &self.profile
    }

    pub fn gains(&self, mode: CycleMode) -> PidGains {
        self.mode(mode).gains
    }

    pub fn convergence(&self, mode: CycleMode) -> &ConvergenceState {
        &self.mode(mode).convergence
    }

    pub fn history(&self, mode: CycleMode) -> &CycleHistory {
        &self.mode(mode).history
    }

    pub fn pid_history(&self, mode: CycleMode) -> impl Iterator<Item = &PidSnapshot> {
        self.mode(mode).pid_history.iter()
    }

    pub fn validation(&self) -> Option<&ValidationSession> {
        self.validation.as_ref()
    }

    pub fn is_converged(&self, mode: CycleMode) -> bool {
        self.mode(mode)
            .convergence
            .is_converged(self.config.convergence_consecutive_cycles)
    }

    pub fn confidence_pct(&self, mode: CycleMode) -> u8 {
        self.mode(mode).convergence.confidence_pct()
    }

    /// Append a finalized cycle and update convergence, regime and validation state
    pub fn record_cycle(&mut self, metrics: &CycleMetrics) -> RecordResult {
        let mode = metrics.mode;
        let now = metrics.end_ms;
        let config = self.config;
        let thresholds = self.profile.thresholds;
        let mut result = RecordResult::default();

        {
            let state = self.mode_mut(mode);
            state.convergence.apply_time_decay(now, config.confidence_decay_per_day);
            state.history.push(metrics.clone());
            state.convergence.total_cycles += 1;

            if metrics.is_learning_eligible() {
                result.good = state.convergence.record(metrics, &thresholds, &config);
            } else {
                debug!(
                    mode = mode.as_str(),
                    disturbed = metrics.is_disturbed(),
                    "Cycle kept for diagnostics, excluded from learning"
                );
            }

            let cooling_down = state
                .convergence
                .regime_cooldown_until_ms
                .is_some_and(|until| now < until);
            if !cooling_down {
                let shift = detect_regime_shift(
                    state.history.iter(),
                    config.safety.regime_window_cycles,
                    config.safety.regime_shift_threshold,
                );
                if let Some(shift) = shift {
                    let cooldown_ms = config.safety.regime_cooldown_hours.saturating_mul(time::MS_PER_HOUR);
                    let until = now.saturating_add(cooldown_ms);
                    state.convergence.regime_cooldown_until_ms = Some(until);
                    warn!(
                        mode = mode.as_str(),
                        shift_c = shift,
                        until_ms = until,
                        "Outdoor regime shift, pausing automatic application"
                    );
                }
            }
        }

        if let Some(session) = self.validation.as_mut().filter(|s| s.mode == mode) {
            let applied_ms = session.started_ms;
            match session.observe(metrics, &config.safety) {
                ValidationOutcome::Pending { .. } => {}
                ValidationOutcome::Passed { mean_overshoot } => {
                    info!(mode = mode.as_str(), mean_overshoot, "Validation passed");
                    self.validation = None;
                    result.validation_passed = true;
                }
                ValidationOutcome::Failed {
                    mean_overshoot,
                    limit,
                    rollback,
                } => {
                    warn!(
                        mode = mode.as_str(),
                        mean_overshoot,
                        limit,
                        "Validation failed, rolling back gains"
                    );
                    self.validation = None;
                    let gains = self
                        .mode(mode)
                        .prior_snapshot(applied_ms)
                        .unwrap_or(rollback)
                        .gains();
                    let capacity = config.max_pid_history;
                    let state = self.mode_mut(mode);
                    state.gains = gains;
                    state.push_snapshot(PidSnapshot::new(gains, GainChangeReason::Rollback, now), capacity);
                    state.convergence.consecutive_good = 0;
                    state.convergence.last_adjustment_ms = Some(now);
                    state.convergence.cycles_at_last_adjustment = state.convergence.total_cycles;
                    result.rollback = Some(gains);
                }
            }
        }

        result.converged = self.is_converged(mode);
        result
    }

    /// Run the rule engine over the recent eligible window
    ///
    /// `None` when there is not enough history, no rule fires, or the resulting
    /// change is too small to matter.
    pub fn calculate_adjustment(&self, mode: CycleMode) -> Option<GainAdjustment> {
        let state = self.mode(mode);
        let window = state.history.recent_eligible(self.config.learning_window);
        if window.len() < self.profile.min_history {
            debug!(
                mode = mode.as_str(),
                have = window.len(),
                need = self.profile.min_history,
                "Not enough eligible cycles to adjust"
            );
            return None;
        }

        let summary = summarize(&window, self.config.outlier_mad_k)?;
        let proposals = evaluate_rules(&summary, &self.profile.thresholds);
        if proposals.is_empty() {
            return None;
        }
        let resolution = resolve_proposals(&proposals);
        if resolution.factors.is_identity() {
            return None;
        }

        let confidence = state.convergence.confidence;
        let rate = self.config.learning_rate(confidence);
        let max_step = self.config.max_step_change;
        let scale = |factor: f64| (1.0 + (factor - 1.0) * rate).clamp(1.0 - max_step, 1.0 + max_step);

        let from = state.gains;
        let to = PidGains {
            kp: (from.kp * scale(resolution.factors.kp)).clamp(self.config.kp_range.0, self.config.kp_range.1),
            ki: (from.ki * scale(resolution.factors.ki)).clamp(self.config.ki_range.0, self.config.ki_range.1),
            kd: (from.kd * scale(resolution.factors.kd)).clamp(self.config.kd_range.0, self.config.kd_range.1),
            ke: from.ke,
        };

        let largest_change = [(from.kp, to.kp), (from.ki, to.ki), (from.kd, to.kd)]
            .into_iter()
            .map(|(a, b)| if a.abs() > f64::EPSILON { ((b - a) / a).abs() } else { (b - a).abs() })
            .fold(0.0, f64::max);
        if largest_change < self.config.min_meaningful_change {
            debug!(mode = mode.as_str(), largest_change, "Adjustment below meaningful change");
            return None;
        }

        Some(GainAdjustment {
            mode,
            from,
            to,
            rules: resolution.applied,
            suppressed: resolution.suppressed,
            learning_rate: rate,
            confidence,
        })
    }

    /// Hybrid time/cycle gate that applies to every adjustment
    pub fn rate_limit(&self, mode: CycleMode, now_ms: u64) -> Option<BlockReason> {
        check_rate_limit(&self.mode(mode).convergence, &self.profile, now_ms)
    }

    /// Full automatic-apply gate for a proposed adjustment
    pub fn check_auto_apply(&self, adjustment: &GainAdjustment, now_ms: u64) -> AutoApplyDecision {
        let mode = adjustment.mode;
        let ctx = GateContext {
            profile: &self.profile,
            limits: &self.config.safety,
            candidate: &adjustment.to,
            validation_active: self.validation.is_some(),
            converged: self.is_converged(mode),
            now_ms,
        };
        let decision = check_auto_apply(&self.mode(mode).convergence, &ctx);
        if let AutoApplyDecision::Blocked(reason) = decision {
            warn!(mode = mode.as_str(), reason = reason.as_str(), "Automatic apply blocked: {}", reason);
        }
        decision
    }

    /// Commit an adjustment and return the new gains
    ///
    /// The gains being replaced are recorded first unless they are already the
    /// newest snapshot, so a rollback always has its target in `pid_history`.
    /// Automatic applications are counted against the caps and start a validation
    /// session measured against the current window's median overshoot.
    pub fn apply_adjustment(&mut self, adjustment: &GainAdjustment, now_ms: u64, auto: bool) -> PidGains {
        let mode = adjustment.mode;
        let capacity = self.config.max_pid_history;
        let window = self.config.learning_window;
        let reason = if auto {
            GainChangeReason::AutoApply
        } else {
            GainChangeReason::Manual
        };

        let state = self.mode_mut(mode);
        let current = state.gains;
        let recorded = state.pid_history.back().copied().filter(|last| last.gains() == current);
        let pre_apply = match recorded {
            Some(last) => last,
            None => {
                let snapshot = PidSnapshot::new(current, GainChangeReason::Baseline, now_ms);
                state.push_snapshot(snapshot, capacity);
                snapshot
            }
        };
        let overshoots: Vec<f64> = state
            .history
            .recent_eligible(window)
            .iter()
            .map(|c| c.overshoot.unwrap_or(0.0))
            .collect();
        let baseline_overshoot = stats::median(&overshoots).unwrap_or(0.0);

        state.gains = adjustment.to;
        state.push_snapshot(PidSnapshot::new(adjustment.to, reason, now_ms), capacity);
        state.convergence.consecutive_good = 0;
        state.convergence.last_adjustment_ms = Some(now_ms);
        state.convergence.cycles_at_last_adjustment = state.convergence.total_cycles;

        if auto {
            state.convergence.auto_apply_count += 1;
            state.convergence.auto_apply_timestamps.push(now_ms);
            let count = state.convergence.auto_apply_count;
            self.validation = Some(ValidationSession::new(
                mode,
                baseline_overshoot,
                pre_apply,
                self.config.safety.validation_cycles,
                now_ms,
            ));
            info!(
                mode = mode.as_str(),
                auto_apply_count = count,
                baseline_overshoot,
                "Applied adjustment automatically: {}",
                adjustment.describe()
            );
        } else {
            info!(mode = mode.as_str(), "Applied adjustment: {}", adjustment.describe());
        }

        adjustment.to
    }

    fn discard_validation(&mut self, mode: CycleMode) {
        if self.validation.as_ref().is_some_and(|s| s.mode == mode) {
            info!(mode = mode.as_str(), "Validation session discarded");
            self.validation = None;
        }
    }

    /// Gains changed from outside the learner
    pub fn on_manual_gain_change(&mut self, mode: CycleMode, gains: PidGains, now_ms: u64) {
        let capacity = self.config.max_pid_history;
        self.discard_validation(mode);

        let state = self.mode_mut(mode);
        state.gains = gains;
        state.push_snapshot(PidSnapshot::new(gains, GainChangeReason::Manual, now_ms), capacity);
        state.history.clear();
        state.convergence.consecutive_good = 0;
        state.convergence.last_adjustment_ms = Some(now_ms);
        state.convergence.cycles_at_last_adjustment = state.convergence.total_cycles;
        info!(mode = mode.as_str(), kp = gains.kp, ki = gains.ki, kd = gains.kd, "Manual gain change");
    }

    /// Back to the baseline gains with a fresh history
    ///
    /// Lifetime and seasonal application counts survive a reset.
    pub fn reset(&mut self, mode: CycleMode, now_ms: u64) -> PidGains {
        let capacity = self.config.max_pid_history;
        let baseline = self.profile.baseline_gains;
        self.discard_validation(mode);

        let state = self.mode_mut(mode);
        state.gains = baseline;
        state.push_snapshot(PidSnapshot::new(baseline, GainChangeReason::Reset, now_ms), capacity);
        state.history.clear();
        let c = &mut state.convergence;
        c.consecutive_good = 0;
        c.confidence = 0.0;
        c.last_adjustment_ms = None;
        c.cycles_at_last_adjustment = c.total_cycles;
        c.regime_cooldown_until_ms = None;
        info!(mode = mode.as_str(), "Learning reset to baseline gains");
        baseline
    }

    pub fn learning_status(&self, mode: CycleMode) -> LearningStatus {
        if self.validation.as_ref().is_some_and(|s| s.mode == mode) {
            LearningStatus::Active
        } else if self.is_converged(mode) {
            LearningStatus::Converged
        } else if self.mode(mode).history.eligible_count() >= self.profile.min_history {
            LearningStatus::Ready
        } else {
            LearningStatus::Collecting
        }
    }

    /// Hand out the persisted controller integral for `mode`, once
    pub fn take_restored_integral(&mut self, mode: CycleMode) -> Option<f64> {
        self.mode_mut(mode).restored_integral.take()
    }

    pub fn to_record(&self, zone_id: &str) -> ZoneRecord {
        let mut record = ZoneRecord::new(zone_id);
        record.heating = self.heating.to_record();
        record.cooling = self.cooling.to_record();
        if let Some(session) = &self.validation {
            record.mode_mut(session.mode).validation = Some(ValidationRecord {
                baseline_overshoot: session.baseline_overshoot,
                observed: session.observed.clone(),
                required: session.required,
                started_ms: session.started_ms,
            });
        }
        record
    }

    /// Load persisted state; returns the number of dropped corrupt entries
    ///
    /// An open validation session resumes where it stopped. It is dropped when its
    /// rollback target is missing from `pid_history`.
    pub fn restore(&mut self, zone_id: &str, value: &Value) -> usize {
        let (mut record, mut dropped) = ZoneRecord::from_value_lossy(zone_id, value);
        let config = self.config;
        let saved = [
            (CycleMode::Heat, record.heating.validation.take()),
            (CycleMode::Cool, record.cooling.validation.take()),
        ];
        self.heating.restore(record.heating, &config);
        self.cooling.restore(record.cooling, &config);

        self.validation = None;
        for (mode, session) in saved {
            let Some(session) = session else {
                continue;
            };
            if self.validation.is_some() {
                warn!(zone = zone_id, mode = mode.as_str(), "Second open validation session dropped");
                dropped += 1;
                continue;
            }
            let Some(pre_apply) = self.mode(mode).prior_snapshot(session.started_ms) else {
                warn!(zone = zone_id, mode = mode.as_str(), "Validation session has no rollback target, dropped");
                dropped += 1;
                continue;
            };
            let mut resumed = ValidationSession::new(
                mode,
                session.baseline_overshoot,
                pre_apply,
                session.required,
                session.started_ms,
            );
            resumed.observed = session.observed;
            info!(
                zone = zone_id,
                mode = mode.as_str(),
                observed = resumed.observed.len(),
                required = resumed.required,
                "Resumed validation session"
            );
            self.validation = Some(resumed);
        }

        info!(
            zone = zone_id,
            heating_cycles = self.heating.history.len(),
            cooling_cycles = self.cooling.history.len(),
            dropped,
            "Restored learner state"
        );
        dropped
    }
}
