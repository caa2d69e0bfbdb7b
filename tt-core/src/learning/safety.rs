//! Automatic-apply safety gate
//!
//! Manual adjustments only pass the hybrid rate limit. Automatic ones must also clear
//! the lifetime cap, the seasonal cap, the cumulative drift cap, the regime-shift
//! cooldown and any running validation. The gate never fails; it answers with a
//! structured `BlockReason`.

use std::fmt;

use crate::analysis::stats;
use crate::constants::time;
use crate::data::{ClassProfile, CycleMetrics, PidGains};

use super::{ConvergenceState, SafetyLimits};

/// Why an adjustment may not be applied now
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum BlockReason {
    LifetimeCap { count: u32, cap: u32 },
    SeasonalCap { count: u32, cap: u32 },
    DriftCap { gain: &'static str, drift: f64, cap: f64 },
    RegimeShiftCooldown { until_ms: u64 },
    ValidationInProgress,
    RateLimited { hours_since: f64, cycles_since: u64 },
    AlreadyConverged,
}

impl BlockReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            BlockReason::LifetimeCap { .. } => "lifetime_cap",
            BlockReason::SeasonalCap { .. } => "seasonal_cap",
            BlockReason::DriftCap { .. } => "drift_cap",
            BlockReason::RegimeShiftCooldown { .. } => "regime_shift_cooldown",
            BlockReason::ValidationInProgress => "validation_in_progress",
            BlockReason::RateLimited { .. } => "rate_limited",
            BlockReason::AlreadyConverged => "already_converged",
        }
    }
}

impl fmt::Display for BlockReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockReason::LifetimeCap { count, cap } => {
                write!(f, "lifetime auto-apply cap reached ({}/{})", count, cap)
            }
            BlockReason::SeasonalCap { count, cap } => {
                write!(f, "seasonal auto-apply cap reached ({}/{})", count, cap)
            }
            BlockReason::DriftCap { gain, drift, cap } => write!(
                f,
                "{} would drift {:.0}% from baseline (cap {:.0}%)",
                gain,
                drift * 100.0,
                cap * 100.0
            ),
            BlockReason::RegimeShiftCooldown { until_ms } => {
                write!(f, "outdoor regime shift, cooling down until {}", until_ms)
            }
            BlockReason::ValidationInProgress => f.write_str("validation in progress"),
            BlockReason::RateLimited { hours_since, cycles_since } => write!(
                f,
                "rate limited ({:.1} h, {} cycles since last adjustment)",
                hours_since, cycles_since
            ),
            BlockReason::AlreadyConverged => f.write_str("already converged"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum AutoApplyDecision {
    Allowed,
    Blocked(BlockReason),
}

impl AutoApplyDecision {
    pub fn is_allowed(&self) -> bool {
        matches!(self, AutoApplyDecision::Allowed)
    }
}

/// Largest relative deviation of kp/ki/kd from baseline, with the gain's name
///
/// Gains whose baseline is zero are skipped.
pub fn cumulative_drift(baseline: &PidGains, candidate: &PidGains) -> (&'static str, f64) {
    [
        ("kp", baseline.kp, candidate.kp),
        ("ki", baseline.ki, candidate.ki),
        ("kd", baseline.kd, candidate.kd),
    ]
    .into_iter()
    .filter(|(_, base, _)| base.abs() > f64::EPSILON)
    .map(|(name, base, value)| (name, ((value - base) / base).abs()))
    .fold(("kp", 0.0), |worst, next| if next.1 > worst.1 { next } else { worst })
}

/// Compare mean outdoor temperature of the last two groups of `window` cycles
///
/// Cycles without outdoor data are skipped. Returns the shift in °C when it
/// exceeds `threshold`.
pub fn detect_regime_shift<'a, I>(cycles: I, window: usize, threshold: f64) -> Option<f64>
where
    I: DoubleEndedIterator<Item = &'a CycleMetrics>,
{
    if window == 0 {
        return None;
    }
    let recent: Vec<f64> = cycles
        .rev()
        .filter_map(|c| c.outdoor_temp_avg)
        .take(window * 2)
        .collect();
    if recent.len() < window * 2 {
        return None;
    }

    let newer = stats::mean(&recent[..window])?;
    let older = stats::mean(&recent[window..])?;
    let shift = (newer - older).abs();
    (shift > threshold).then_some(shift)
}

/// Hybrid gate: enough wall-clock time AND enough cycles since the last adjustment
pub fn check_rate_limit(state: &ConvergenceState, profile: &ClassProfile, now_ms: u64) -> Option<BlockReason> {
    let last = state.last_adjustment_ms?;
    let hours = now_ms.saturating_sub(last) as f64 / time::MS_PER_HOUR as f64;
    let cycles = state.cycles_since_adjustment();

    let interval_ok = hours >= profile.min_adjustment_interval_hours;
    let cycles_ok = cycles >= profile.min_cycles_between_adjustments as u64;
    if interval_ok && cycles_ok {
        None
    } else {
        Some(BlockReason::RateLimited {
            hours_since: hours,
            cycles_since: cycles,
        })
    }
}

/// Inputs to the automatic-apply gate that live outside `ConvergenceState`
#[derive(Debug, Clone, Copy)]
pub struct GateContext<'a> {
    pub profile: &'a ClassProfile,
    pub limits: &'a SafetyLimits,
    pub candidate: &'a PidGains,
    pub validation_active: bool,
    pub converged: bool,
    pub now_ms: u64,
}

/// Evaluate every automatic-apply limit; the lifetime cap is checked first
pub fn check_auto_apply(state: &ConvergenceState, ctx: &GateContext<'_>) -> AutoApplyDecision {
    let limits = ctx.limits;

    if state.auto_apply_count >= limits.max_lifetime_auto_applies {
        return AutoApplyDecision::Blocked(BlockReason::LifetimeCap {
            count: state.auto_apply_count,
            cap: limits.max_lifetime_auto_applies,
        });
    }

    let season_ms = limits.season_window_days.saturating_mul(time::MS_PER_DAY);
    let seasonal = state.auto_applies_since(ctx.now_ms.saturating_sub(season_ms));
    if seasonal >= limits.max_auto_applies_per_season {
        return AutoApplyDecision::Blocked(BlockReason::SeasonalCap {
            count: seasonal,
            cap: limits.max_auto_applies_per_season,
        });
    }

    let (gain, drift) = cumulative_drift(&ctx.profile.baseline_gains, ctx.candidate);
    if drift > limits.max_cumulative_drift {
        return AutoApplyDecision::Blocked(BlockReason::DriftCap {
            gain,
            drift,
            cap: limits.max_cumulative_drift,
        });
    }

    if let Some(until_ms) = state.regime_cooldown_until_ms.filter(|until| ctx.now_ms < *until) {
        return AutoApplyDecision::Blocked(BlockReason::RegimeShiftCooldown { until_ms });
    }

    if ctx.validation_active {
        return AutoApplyDecision::Blocked(BlockReason::ValidationInProgress);
    }

    if let Some(reason) = check_rate_limit(state, ctx.profile, ctx.now_ms) {
        return AutoApplyDecision::Blocked(reason);
    }

    if ctx.converged {
        return AutoApplyDecision::Blocked(BlockReason::AlreadyConverged);
    }

    AutoApplyDecision::Allowed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::HeatingType;

    const HOUR: u64 = 3_600_000;

    fn ctx<'a>(profile: &'a ClassProfile, limits: &'a SafetyLimits, candidate: &'a PidGains) -> GateContext<'a> {
        GateContext {
            profile,
            limits,
            candidate,
            validation_active: false,
            converged: false,
            now_ms: 1_000 * HOUR,
        }
    }

    #[test]
    fn test_lifetime_cap_checked_first() {
        let profile = HeatingType::Radiator.profile();
        let limits = SafetyLimits::default();
        let candidate = profile.baseline_gains;
        let state = ConvergenceState {
            auto_apply_count: limits.max_lifetime_auto_applies,
            consecutive_good: 10,
            confidence: 1.0,
            ..ConvergenceState::default()
        };
        let mut context = ctx(&profile, &limits, &candidate);
        context.validation_active = true;
        assert!(matches!(
            check_auto_apply(&state, &context),
            AutoApplyDecision::Blocked(BlockReason::LifetimeCap { .. })
        ));
    }

    #[test]
    fn test_seasonal_window_rolls() {
        let profile = HeatingType::Radiator.profile();
        let limits = SafetyLimits::default();
        let candidate = profile.baseline_gains;
        let now = 1_000 * HOUR;
        let state = ConvergenceState {
            auto_apply_count: 5,
            auto_apply_timestamps: vec![now - HOUR; 5],
            ..ConvergenceState::default()
        };
        let context = ctx(&profile, &limits, &candidate);
        assert!(matches!(
            check_auto_apply(&state, &context),
            AutoApplyDecision::Blocked(BlockReason::SeasonalCap { count: 5, .. })
        ));

        // Same applications, but older than the window
        let old = ConvergenceState {
            auto_apply_timestamps: vec![0; 5],
            ..state
        };
        let later = GateContext {
            now_ms: 100 * 24 * HOUR,
            ..context
        };
        assert!(check_auto_apply(&old, &later).is_allowed());
    }

    #[test]
    fn test_drift_cap() {
        let profile = HeatingType::Radiator.profile();
        let limits = SafetyLimits::default();
        let mut candidate = profile.baseline_gains;
        candidate.kd *= 1.6;
        let decision = check_auto_apply(&ConvergenceState::default(), &ctx(&profile, &limits, &candidate));
        match decision {
            AutoApplyDecision::Blocked(BlockReason::DriftCap { gain, .. }) => assert_eq!(gain, "kd"),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_rate_limit_needs_both() {
        let profile = HeatingType::Radiator.profile();
        let last = 10 * HOUR;
        let state = ConvergenceState {
            last_adjustment_ms: Some(last),
            cycles_at_last_adjustment: 10,
            total_cycles: 11,
            ..ConvergenceState::default()
        };
        // Neither satisfied
        assert!(check_rate_limit(&state, &profile, last + HOUR).is_some());
        // Only time satisfied
        assert!(check_rate_limit(&state, &profile, last + 24 * HOUR).is_some());
        // Both satisfied
        let enough = ConvergenceState {
            total_cycles: 13,
            ..state
        };
        assert!(check_rate_limit(&enough, &profile, last + 12 * HOUR).is_none());
    }

    #[test]
    fn test_regime_shift_detection() {
        let base: CycleMetrics = serde_json::from_str(
            r#"{"mode":"heat","start_ms":0,"start_temp":19.0,"target_temp":20.0,"duration_minutes":30}"#,
        )
        .unwrap();
        let cycles: Vec<CycleMetrics> = [2.0, 3.0, 2.5, 10.0, 11.0, 9.5]
            .iter()
            .map(|t| CycleMetrics {
                outdoor_temp_avg: Some(*t),
                ..base.clone()
            })
            .collect();
        let shift = detect_regime_shift(cycles.iter(), 3, 5.0).unwrap();
        assert!((shift - 7.666_666_666).abs() < 1e-6);
        assert!(detect_regime_shift(cycles[..4].iter(), 3, 5.0).is_none());
    }
}
