//! Rule engine
//!
//! Each rule looks at robust aggregates of recent cycles and proposes
//! multiplicative factors on kp/ki/kd. Rules are evaluated in priority order:
//!
//! | priority | rule          | fires when                         | proposes                      |
//! |----------|---------------|------------------------------------|-------------------------------|
//! | 1        | Oscillation   | oscillations > max                 | kp x0.90, ki x0.90, kd x1.15  |
//! | 2        | Overshoot     | overshoot > max                    | kp x0.92, kd x1.10 (ki x0.85 if severe) |
//! | 3        | Undershoot    | undershoot > max                   | ki x1.10                      |
//! | 4        | SlowSettling  | settling time > max                | kd x1.10                      |
//! | 5        | SlowRise      | rise time > max, output unsaturated| kp x1.08                      |
//!
//! When two rules push the same gain in opposite directions, the higher-priority
//! rule wins and the other is suppressed for that gain.

use tracing::info;

use crate::analysis::stats;
use crate::data::{ConvergenceThresholds, CycleMetrics};

/// Rules in priority order (first = highest)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum RuleKind {
    Oscillation,
    Overshoot,
    Undershoot,
    SlowSettling,
    SlowRise,
}

impl RuleKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            RuleKind::Oscillation => "oscillation",
            RuleKind::Overshoot => "overshoot",
            RuleKind::Undershoot => "undershoot",
            RuleKind::SlowSettling => "slow_settling",
            RuleKind::SlowRise => "slow_rise",
        }
    }
}

/// Multiplicative gain changes (1.0 = unchanged)
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct GainFactors {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
}

impl GainFactors {
    pub fn identity() -> Self {
        Self { kp: 1.0, ki: 1.0, kd: 1.0 }
    }

    pub fn is_identity(&self) -> bool {
        [self.kp, self.ki, self.kd]
            .iter()
            .all(|f| (f - 1.0).abs() < f64::EPSILON)
    }
}

impl Default for GainFactors {
    fn default() -> Self {
        Self::identity()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct RuleProposal {
    pub rule: RuleKind,
    pub factors: GainFactors,
    pub reason: String,
}

/// Robust aggregates over the learning window
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricSummary {
    pub cycles: usize,
    pub overshoot: Option<f64>,
    pub undershoot: Option<f64>,
    pub settling_time: Option<f64>,
    pub rise_time: Option<f64>,
    pub oscillations: f64,
    /// Fraction of cycles where the controller output hit a bound
    pub clamped_share: f64,
}

fn robust_median(values: &[f64], k: f64) -> Option<f64> {
    stats::median(&stats::reject_outliers(values, k))
}

/// Aggregate cycles with median after MAD outlier rejection
pub fn summarize(cycles: &[&CycleMetrics], outlier_k: f64) -> Option<MetricSummary> {
    if cycles.is_empty() {
        return None;
    }

    let overshoots: Vec<f64> = cycles.iter().map(|c| c.overshoot.unwrap_or(0.0)).collect();
    let undershoots: Vec<f64> = cycles.iter().filter_map(|c| c.undershoot).collect();
    let settling: Vec<f64> = cycles.iter().filter_map(|c| c.settling_time).collect();
    let rise: Vec<f64> = cycles.iter().filter_map(|c| c.rise_time).collect();
    let oscillations: Vec<f64> = cycles.iter().map(|c| c.oscillations as f64).collect();
    let clamped = cycles.iter().filter(|c| c.was_clamped).count();

    Some(MetricSummary {
        cycles: cycles.len(),
        overshoot: robust_median(&overshoots, outlier_k),
        undershoot: robust_median(&undershoots, outlier_k),
        settling_time: robust_median(&settling, outlier_k),
        rise_time: robust_median(&rise, outlier_k),
        oscillations: robust_median(&oscillations, outlier_k).unwrap_or(0.0),
        clamped_share: clamped as f64 / cycles.len() as f64,
    })
}

/// Every rule that fires for the summary, highest priority first
pub fn evaluate_rules(summary: &MetricSummary, thresholds: &ConvergenceThresholds) -> Vec<RuleProposal> {
    let mut proposals = Vec::new();

    if summary.oscillations > thresholds.oscillations_max as f64 {
        proposals.push(RuleProposal {
            rule: RuleKind::Oscillation,
            factors: GainFactors { kp: 0.90, ki: 0.90, kd: 1.15 },
            reason: format!(
                "median {:.1} oscillations > {}",
                summary.oscillations, thresholds.oscillations_max
            ),
        });
    }

    if let Some(overshoot) = summary.overshoot.filter(|o| *o > thresholds.overshoot_max) {
        let severe = overshoot > 2.0 * thresholds.overshoot_max;
        proposals.push(RuleProposal {
            rule: RuleKind::Overshoot,
            factors: GainFactors {
                kp: 0.92,
                ki: if severe { 0.85 } else { 1.0 },
                kd: 1.10,
            },
            reason: format!("median overshoot {:.2}°C > {:.2}°C", overshoot, thresholds.overshoot_max),
        });
    }

    if let Some(undershoot) = summary.undershoot.filter(|u| *u > thresholds.undershoot_max) {
        proposals.push(RuleProposal {
            rule: RuleKind::Undershoot,
            factors: GainFactors { kp: 1.0, ki: 1.10, kd: 1.0 },
            reason: format!("median undershoot {:.2}°C > {:.2}°C", undershoot, thresholds.undershoot_max),
        });
    }

    if let Some(settling) = summary.settling_time.filter(|s| *s > thresholds.settling_time_max) {
        proposals.push(RuleProposal {
            rule: RuleKind::SlowSettling,
            factors: GainFactors { kp: 1.0, ki: 1.0, kd: 1.10 },
            reason: format!("median settling {:.0} min > {:.0} min", settling, thresholds.settling_time_max),
        });
    }

    if let Some(rise) = summary.rise_time.filter(|r| *r > thresholds.rise_time_max) {
        // A saturated output cannot rise faster with more gain
        if summary.clamped_share < 0.5 {
            proposals.push(RuleProposal {
                rule: RuleKind::SlowRise,
                factors: GainFactors { kp: 1.08, ki: 1.0, kd: 1.0 },
                reason: format!("median rise {:.0} min > {:.0} min", rise, thresholds.rise_time_max),
            });
        }
    }

    proposals.sort_by_key(|p| p.rule);
    proposals
}

/// Combined factors after conflict resolution
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Resolution {
    pub factors: GainFactors,
    pub applied: Vec<RuleKind>,
    /// (losing rule, gain name)
    pub suppressed: Vec<(RuleKind, &'static str)>,
}

/// Merge proposals: same-direction factors compound, opposing ones lose to priority
pub fn resolve_proposals(proposals: &[RuleProposal]) -> Resolution {
    let mut ordered: Vec<&RuleProposal> = proposals.iter().collect();
    ordered.sort_by_key(|p| p.rule);

    let mut factors = [1.0_f64; 3];
    let mut owner: [Option<(RuleKind, f64)>; 3] = [None; 3];
    let mut resolution = Resolution::default();

    for proposal in ordered {
        let proposed = [
            ("kp", proposal.factors.kp),
            ("ki", proposal.factors.ki),
            ("kd", proposal.factors.kd),
        ];
        let mut used = false;

        for (idx, (gain, factor)) in proposed.into_iter().enumerate() {
            if (factor - 1.0).abs() < f64::EPSILON {
                continue;
            }
            let direction = (factor - 1.0).signum();
            match owner[idx] {
                Some((winner, dir)) if dir != direction => {
                    info!(
                        rule = proposal.rule.as_str(),
                        winner = winner.as_str(),
                        gain,
                        "Rule suppressed by higher-priority rule"
                    );
                    resolution.suppressed.push((proposal.rule, gain));
                }
                Some(_) => {
                    factors[idx] *= factor;
                    used = true;
                }
                None => {
                    owner[idx] = Some((proposal.rule, direction));
                    factors[idx] *= factor;
                    used = true;
                }
            }
        }

        if used {
            resolution.applied.push(proposal.rule);
        }
    }

    resolution.factors = GainFactors {
        kp: factors[0],
        ki: factors[1],
        kd: factors[2],
    };
    resolution
}
