//! Cycle tracking state machine
//!
//! Turns the zone's raw event stream into one `CycleMetrics` per completed cycle.
//!
//! ```text
//!   Idle --DeviceActivated--> Heating | Cooling
//!   Heating | Cooling --DeviceDeactivated / SettlingStarted--> Settling
//!   Settling --settled or deadline--> Idle (finalize)
//!   any active state --contact open / mode change / major setpoint edit--> Idle (abort)
//! ```
//!
//! Deadlines are plain timestamps checked on every sample and `Tick`; clearing the
//! active cycle cancels them.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use tt_protocol::{EventKind, GraceReason, HvacMode, ZoneEvent, MAX_PLAUSIBLE_TEMP, MIN_PLAUSIBLE_TEMP};

use crate::analysis::{self, AnalysisConfig};
use crate::constants::{cycle as cycle_const, time};
use crate::data::{
    minutes_between, ClassProfile, CycleMetrics, CycleMode, DisturbanceFlags, IntegralDiagnostics,
    Interruption, InterruptionKind, TemperatureSample,
};
use crate::pid::PidState;

/// Tracker state
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CycleState {
    Idle,
    Heating,
    Cooling,
    Settling,
}

impl CycleState {
    pub fn as_str(&self) -> &'static str {
        match self {
            CycleState::Idle => "idle",
            CycleState::Heating => "heating",
            CycleState::Cooling => "cooling",
            CycleState::Settling => "settling",
        }
    }

    pub fn is_active(&self) -> bool {
        !matches!(self, CycleState::Idle)
    }
}

/// Tracker tunables
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct TrackerConfig {
    pub min_duration_minutes: f64,
    pub min_samples: usize,
    pub thermal_time_constant_hours: f64,
    pub settling_timeout_factor: f64,
    pub settling_timeout_min_minutes: f64,
    pub settling_timeout_max_minutes: f64,
    /// °C
    pub major_setpoint_change: f64,
    pub contact_grace_secs: u64,
    pub restart_grace_minutes: u64,
    /// °C
    pub outdoor_swing_threshold: f64,
    pub mass_recovery_share: f64,
    pub max_samples: usize,
    pub analysis: AnalysisConfig,
}

impl Default for TrackerConfig {
    fn default() -> Self {
        Self {
            min_duration_minutes: cycle_const::MIN_CYCLE_DURATION_MINUTES,
            min_samples: cycle_const::MIN_CYCLE_SAMPLES,
            thermal_time_constant_hours: ClassProfile::default().thermal_time_constant_hours,
            settling_timeout_factor: cycle_const::SETTLING_TIMEOUT_FACTOR,
            settling_timeout_min_minutes: cycle_const::SETTLING_TIMEOUT_MIN_MINUTES,
            settling_timeout_max_minutes: cycle_const::SETTLING_TIMEOUT_MAX_MINUTES,
            major_setpoint_change: cycle_const::MAJOR_SETPOINT_CHANGE,
            contact_grace_secs: cycle_const::CONTACT_GRACE_SECS,
            restart_grace_minutes: cycle_const::RESTART_GRACE_MINUTES,
            outdoor_swing_threshold: cycle_const::OUTDOOR_SWING_THRESHOLD,
            mass_recovery_share: cycle_const::MASS_RECOVERY_SHARE,
            max_samples: cycle_const::MAX_SAMPLES_PER_CYCLE,
            analysis: AnalysisConfig::default(),
        }
    }
}

impl TrackerConfig {
    pub fn for_profile(profile: &ClassProfile) -> Self {
        Self {
            thermal_time_constant_hours: profile.thermal_time_constant_hours,
            ..Self::default()
        }
    }

    /// Settling timeout in minutes, scaled to the thermal time constant
    pub fn settling_timeout_minutes(&self) -> f64 {
        let min = self.settling_timeout_min_minutes;
        let max = self.settling_timeout_max_minutes.max(min);
        (self.thermal_time_constant_hours * 60.0 * self.settling_timeout_factor).clamp(min, max)
    }
}

/// Why a finished cycle produced no metrics
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum DiscardReason {
    TooShort { minutes: f64 },
    TooFewSamples { count: usize },
    GraceWindow(GraceReason),
}

impl fmt::Display for DiscardReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DiscardReason::TooShort { minutes } => write!(f, "too short ({:.1} min)", minutes),
            DiscardReason::TooFewSamples { count } => write!(f, "too few samples ({})", count),
            DiscardReason::GraceWindow(reason) => write!(f, "inside {:?} grace window", reason),
        }
    }
}

/// Why an active cycle was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    ContactOpen,
    ModeChange,
    MajorSetpointChange,
    SampleOverflow,
}

impl fmt::Display for AbortReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            AbortReason::ContactOpen => "contact open beyond grace period",
            AbortReason::ModeChange => "incompatible mode change",
            AbortReason::MajorSetpointChange => "major setpoint change while idle",
            AbortReason::SampleOverflow => "sample buffer full",
        };
        f.write_str(text)
    }
}

/// Result of feeding one event to the tracker
#[derive(Debug, Clone, PartialEq)]
pub enum TrackerOutcome {
    Started { cycle_id: u64, mode: CycleMode },
    Finalized(CycleMetrics),
    Discarded { cycle_id: u64, reason: DiscardReason },
    Aborted { cycle_id: u64, reason: AbortReason },
}

#[derive(Debug, Clone)]
struct ActiveCycle {
    id: u64,
    mode: CycleMode,
    start_ms: u64,
    start_temp: Option<f64>,
    target: f64,
    samples: Vec<TemperatureSample>,
    device_off_ms: Option<u64>,
    settling_deadline_ms: Option<u64>,
    interruptions: Vec<Interruption>,
    outdoor_min: Option<f64>,
    outdoor_max: Option<f64>,
    outdoor_sum: f64,
    outdoor_count: usize,
    solar_gain: bool,
    mass_recovery: bool,
    was_clamped: bool,
    grace: Option<GraceReason>,
    integral_at_start: Option<f64>,
    integral_at_device_off: Option<f64>,
    overhang_steps_at_start: u32,
    safety_steps_at_start: u32,
}

impl ActiveCycle {
    fn record_outdoor(&mut self, temp: f64) {
        self.outdoor_min = Some(self.outdoor_min.map_or(temp, |m| m.min(temp)));
        self.outdoor_max = Some(self.outdoor_max.map_or(temp, |m| m.max(temp)));
        self.outdoor_sum += temp;
        self.outdoor_count += 1;
    }

    fn outdoor_swing(&self) -> f64 {
        match (self.outdoor_min, self.outdoor_max) {
            (Some(lo), Some(hi)) => hi - lo,
            _ => 0.0,
        }
    }
}

/// Event-driven cycle tracker for one zone
#[derive(Debug, Clone)]
pub struct CycleTracker {
    config: TrackerConfig,
    state: CycleState,
    hvac_mode: HvacMode,
    target: Option<f64>,
    last_temp: Option<f64>,
    last_outdoor: Option<f64>,
    solar_high: bool,
    demand_share: f64,
    contact_open_since: Option<u64>,
    grace: Option<(u64, GraceReason)>,
    controller: Option<PidState>,
    active: Option<ActiveCycle>,
    next_cycle_id: u64,
    finalizing: bool,
}

impl CycleTracker {
    pub fn new(config: TrackerConfig) -> Self {
        Self {
            config,
            state: CycleState::Idle,
            hvac_mode: HvacMode::Off,
            target: None,
            last_temp: None,
            last_outdoor: None,
            solar_high: false,
            demand_share: 0.0,
            contact_open_since: None,
            grace: None,
            controller: None,
            active: None,
            next_cycle_id: 1,
            finalizing: false,
        }
    }

    pub fn with_mode(mut self, mode: HvacMode) -> Self {
        self.hvac_mode = mode;
        self
    }

    pub fn with_target(mut self, target: f64) -> Self {
        self.target = Some(target);
        self
    }

    pub fn state(&self) -> CycleState {
        self.state
    }

    pub fn hvac_mode(&self) -> HvacMode {
        self.hvac_mode
    }

    pub fn target(&self) -> Option<f64> {
        self.target
    }

    pub fn last_temperature(&self) -> Option<f64> {
        self.last_temp
    }

    pub fn active_cycle_id(&self) -> Option<u64> {
        self.active.as_ref().map(|c| c.id)
    }

    pub fn settling_deadline_ms(&self) -> Option<u64> {
        self.active.as_ref().and_then(|c| c.settling_deadline_ms)
    }

    /// Ignore cycles starting before `now + restart grace`
    pub fn begin_restart_grace(&mut self, now_ms: u64) {
        let grace_ms = self.config.restart_grace_minutes.saturating_mul(time::MS_PER_MINUTE as u64);
        let until = now_ms.saturating_add(grace_ms);
        self.grace = Some((until, GraceReason::Restart));
        debug!(until_ms = until, "Restart grace window armed");
    }

    /// Latest controller state, used for clamp and integral diagnostics
    pub fn record_controller_state(&mut self, state: PidState) {
        if let Some(active) = self.active.as_mut() {
            active.was_clamped |= state.is_clamped();
        }
        self.controller = Some(state);
    }

    /// Feed one event; returns everything that happened as a result
    pub fn handle(&mut self, event: &ZoneEvent) -> Vec<TrackerOutcome> {
        let now = event.timestamp_ms;
        let mut outcomes = Vec::new();

        match &event.kind {
            EventKind::DeviceActivated => self.on_device_activated(now, &mut outcomes),
            EventKind::DeviceDeactivated | EventKind::SettlingStarted => self.on_device_off(now),
            EventKind::TemperatureSample { temp } => self.on_sample(now, *temp, &mut outcomes),
            EventKind::SetpointChanged { target } => self.on_setpoint(now, *target, &mut outcomes),
            EventKind::ModeChanged { mode } => self.on_mode(*mode, &mut outcomes),
            EventKind::ContactPaused => {
                if self.contact_open_since.is_none() {
                    self.contact_open_since = Some(now);
                }
                self.check_contact(now, &mut outcomes);
            }
            EventKind::ContactResumed => self.on_contact_resumed(now, &mut outcomes),
            EventKind::OutdoorConditions { temp, .. } => {
                if let Some(t) = temp.filter(|t| t.is_finite()) {
                    self.last_outdoor = Some(t);
                    if let Some(active) = self.active.as_mut() {
                        active.record_outdoor(t);
                    }
                }
            }
            EventKind::SolarGain { high } => {
                self.solar_high = *high;
                if let Some(active) = self.active.as_mut() {
                    active.solar_gain |= *high;
                }
            }
            EventKind::ZoneDemandShare { active_fraction } => {
                self.demand_share = *active_fraction;
                let mass = *active_fraction >= self.config.mass_recovery_share;
                if let Some(active) = self.active.as_mut() {
                    active.mass_recovery |= mass;
                }
            }
            EventKind::GraceWindow { until_ms, reason } => {
                self.grace = Some((*until_ms, *reason));
            }
            EventKind::Tick => {
                self.check_contact(now, &mut outcomes);
                self.check_deadline(now, &mut outcomes);
            }
            EventKind::Feedforward { .. } | EventKind::ManualGains { .. } | EventKind::ResetLearning => {}
        }

        outcomes
    }

    fn on_device_activated(&mut self, now: u64, outcomes: &mut Vec<TrackerOutcome>) {
        match self.state {
            CycleState::Heating | CycleState::Cooling => {
                debug!("Device activated while already active, ignoring");
                return;
            }
            CycleState::Settling => {
                // Overlap: the previous cycle is recorded before the new one opens
                if let Some(outcome) = self.finalize(now, false) {
                    outcomes.push(outcome);
                }
            }
            CycleState::Idle => {}
        }

        let Some(mode) = CycleMode::from_hvac(self.hvac_mode) else {
            debug!("Device activated with HVAC off, no cycle opened");
            return;
        };
        let Some(target) = self.target else {
            warn!("Device activated before any setpoint was known, no cycle opened");
            return;
        };

        let id = self.next_cycle_id;
        self.next_cycle_id += 1;

        let grace = self
            .grace
            .filter(|(until, _)| now < *until)
            .map(|(_, reason)| reason);

        let mut cycle = ActiveCycle {
            id,
            mode,
            start_ms: now,
            start_temp: self.last_temp,
            target,
            samples: Vec::new(),
            device_off_ms: None,
            settling_deadline_ms: None,
            interruptions: Vec::new(),
            outdoor_min: None,
            outdoor_max: None,
            outdoor_sum: 0.0,
            outdoor_count: 0,
            solar_gain: self.solar_high,
            mass_recovery: self.demand_share >= self.config.mass_recovery_share,
            was_clamped: false,
            grace,
            integral_at_start: self.controller.map(|s| s.integral),
            integral_at_device_off: None,
            overhang_steps_at_start: self.controller.map_or(0, |s| s.overhang_decay_steps),
            safety_steps_at_start: self.controller.map_or(0, |s| s.safety_net_decay_steps),
        };
        if let Some(temp) = self.last_temp {
            cycle.samples.push(TemperatureSample::new(now, temp));
        }
        if let Some(outdoor) = self.last_outdoor {
            cycle.record_outdoor(outdoor);
        }

        self.state = match mode {
            CycleMode::Heat => CycleState::Heating,
            CycleMode::Cool => CycleState::Cooling,
        };
        self.active = Some(cycle);

        info!(cycle_id = id, mode = mode.as_str(), target, "Cycle started");
        outcomes.push(TrackerOutcome::Started { cycle_id: id, mode });
    }

    fn on_device_off(&mut self, now: u64) {
        if !matches!(self.state, CycleState::Heating | CycleState::Cooling) {
            return;
        }
        let timeout_ms = (self.config.settling_timeout_minutes() * time::MS_PER_MINUTE) as u64;
        let integral = self.controller.map(|s| s.integral);

        if let Some(active) = self.active.as_mut() {
            active.device_off_ms = Some(now);
            let deadline = now.saturating_add(timeout_ms);
            active.settling_deadline_ms = Some(deadline);
            active.integral_at_device_off = integral;
            debug!(cycle_id = active.id, deadline_ms = deadline, "Settling started");
        }
        self.state = CycleState::Settling;
    }

    fn on_sample(&mut self, now: u64, temp: Option<f64>, outcomes: &mut Vec<TrackerOutcome>) {
        let Some(temp) = temp else {
            warn!("Temperature sample missing, skipped");
            return;
        };
        if !temp.is_finite() || !(MIN_PLAUSIBLE_TEMP..=MAX_PLAUSIBLE_TEMP).contains(&temp) {
            warn!(temp, "Implausible temperature sample, skipped");
            return;
        }

        self.last_temp = Some(temp);
        if self.active.is_none() {
            return;
        }

        // Deadlines are checked before the sample joins the cycle
        self.check_contact(now, outcomes);
        if self.check_deadline(now, outcomes) {
            return;
        }

        let max_samples = self.config.max_samples;
        let overflow = match self.active.as_mut() {
            Some(active) => {
                if active.start_temp.is_none() {
                    active.start_temp = Some(temp);
                }
                if active.samples.len() >= max_samples {
                    true
                } else {
                    active.samples.push(TemperatureSample::new(now, temp));
                    false
                }
            }
            None => return,
        };

        if overflow {
            self.abort(AbortReason::SampleOverflow, outcomes);
            return;
        }

        if self.state == CycleState::Settling && self.is_settled() {
            if let Some(outcome) = self.finalize(now, false) {
                outcomes.push(outcome);
            }
        }
    }

    fn on_setpoint(&mut self, now: u64, target: f64, outcomes: &mut Vec<TrackerOutcome>) {
        self.target = Some(target);
        let state = self.state;
        let major = self.config.major_setpoint_change;

        let Some(active) = self.active.as_mut() else {
            return;
        };
        let old = active.target;
        let delta = (target - old).abs();
        if delta < f64::EPSILON {
            return;
        }

        if state == CycleState::Settling && delta > major {
            self.abort(AbortReason::MajorSetpointChange, outcomes);
            return;
        }

        let kind = if state == CycleState::Settling {
            InterruptionKind::SetpointMinor { old, new: target }
        } else {
            InterruptionKind::SetpointWhileActive { old, new: target }
        };
        active.target = target;
        active.interruptions.push(Interruption { timestamp_ms: now, kind });
        debug!(cycle_id = active.id, old, new = target, "Setpoint changed mid-cycle");
    }

    fn on_mode(&mut self, mode: HvacMode, outcomes: &mut Vec<TrackerOutcome>) {
        self.hvac_mode = mode;
        let compatible = match &self.active {
            Some(active) => CycleMode::from_hvac(mode) == Some(active.mode),
            None => true,
        };
        if !compatible {
            self.abort(AbortReason::ModeChange, outcomes);
        }
    }

    fn on_contact_resumed(&mut self, now: u64, outcomes: &mut Vec<TrackerOutcome>) {
        let Some(since) = self.contact_open_since else {
            return;
        };
        let open_ms = now.saturating_sub(since);
        if open_ms >= self.contact_grace_ms() {
            self.check_contact(now, outcomes);
            self.contact_open_since = None;
            return;
        }
        self.contact_open_since = None;

        if let Some(active) = self.active.as_mut() {
            active.interruptions.push(Interruption {
                timestamp_ms: now,
                kind: InterruptionKind::ContactPause {
                    duration_secs: open_ms / time::MS_PER_SECOND as u64,
                },
            });
            debug!(cycle_id = active.id, open_ms, "Contact pause within grace period");
        }
    }

    fn contact_grace_ms(&self) -> u64 {
        self.config.contact_grace_secs.saturating_mul(time::MS_PER_SECOND as u64)
    }

    fn check_contact(&mut self, now: u64, outcomes: &mut Vec<TrackerOutcome>) {
        let Some(since) = self.contact_open_since else {
            return;
        };
        if self.active.is_some() && now.saturating_sub(since) >= self.contact_grace_ms() {
            self.abort(AbortReason::ContactOpen, outcomes);
        }
    }

    /// Finalize on an expired settling deadline; returns whether it fired
    fn check_deadline(&mut self, now: u64, outcomes: &mut Vec<TrackerOutcome>) -> bool {
        let expired = self.state == CycleState::Settling
            && self
                .active
                .as_ref()
                .and_then(|c| c.settling_deadline_ms)
                .is_some_and(|deadline| now >= deadline);
        if !expired {
            return false;
        }
        if let Some(outcome) = self.finalize(now, true) {
            outcomes.push(outcome);
        }
        true
    }

    fn is_settled(&self) -> bool {
        let Some(active) = self.active.as_ref() else {
            return false;
        };
        let Some(off) = active.device_off_ms else {
            return false;
        };
        // Tolerance band and MAD are symmetric, so no mirroring is needed for cooling
        analysis::settling_time(&active.samples, active.target, off, &self.config.analysis).is_some()
    }

    fn abort(&mut self, reason: AbortReason, outcomes: &mut Vec<TrackerOutcome>) {
        if let Some(active) = self.active.take() {
            info!(cycle_id = active.id, mode = active.mode.as_str(), %reason, "Cycle aborted");
            outcomes.push(TrackerOutcome::Aborted { cycle_id: active.id, reason });
        }
        self.state = CycleState::Idle;
    }

    fn finalize(&mut self, now: u64, timed_out: bool) -> Option<TrackerOutcome> {
        if self.finalizing {
            return None;
        }
        self.finalizing = true;
        let outcome = self.active.take().map(|active| self.build_outcome(active, now, timed_out));
        self.state = CycleState::Idle;
        self.finalizing = false;
        outcome
    }

    fn build_outcome(&self, active: ActiveCycle, now: u64, timed_out: bool) -> TrackerOutcome {
        let duration = minutes_between(active.start_ms, now);
        let count = active.samples.len();

        let discard = if duration < self.config.min_duration_minutes {
            Some(DiscardReason::TooShort { minutes: duration })
        } else if count < self.config.min_samples {
            Some(DiscardReason::TooFewSamples { count })
        } else {
            active.grace.map(DiscardReason::GraceWindow)
        };
        if let Some(reason) = discard {
            info!(cycle_id = active.id, %reason, "Cycle discarded");
            return TrackerOutcome::Discarded { cycle_id: active.id, reason };
        }

        let result = analysis::analyze_cycle(
            active.mode,
            &active.samples,
            active.target,
            active.device_off_ms,
            &self.config.analysis,
        );

        let end_temp = active.samples.last().map_or(active.target, |s| s.temp);
        let outdoor_temp_avg =
            (active.outdoor_count > 0).then(|| active.outdoor_sum / active.outdoor_count as f64);
        let disturbances = DisturbanceFlags {
            solar_gain: active.solar_gain,
            outdoor_swing: active.outdoor_swing() > self.config.outdoor_swing_threshold,
            mass_recovery: active.mass_recovery,
        };
        let integral = IntegralDiagnostics {
            integral_at_start: active.integral_at_start,
            integral_at_device_off: active.integral_at_device_off,
            integral_at_end: self.controller.map(|s| s.integral),
            overhang_decay_steps: self
                .controller
                .map_or(0, |s| s.overhang_decay_steps.saturating_sub(active.overhang_steps_at_start)),
            safety_net_decay_steps: self
                .controller
                .map_or(0, |s| s.safety_net_decay_steps.saturating_sub(active.safety_steps_at_start)),
        };

        let metrics = CycleMetrics {
            mode: active.mode,
            start_ms: active.start_ms,
            end_ms: now,
            start_temp: active.start_temp.unwrap_or(end_temp),
            end_temp,
            target_temp: active.target,
            duration_minutes: duration,
            overshoot: result.overshoot,
            undershoot: result.undershoot,
            settling_time: result.settling_time,
            oscillations: result.oscillations,
            rise_time: result.rise_time,
            outdoor_temp_avg,
            disturbances,
            was_clamped: active.was_clamped,
            interruptions: active.interruptions,
            integral,
            timed_out,
        };

        info!(
            cycle_id = active.id,
            mode = metrics.mode.as_str(),
            duration_min = duration,
            overshoot = ?metrics.overshoot,
            oscillations = metrics.oscillations,
            settling_time = ?metrics.settling_time,
            timed_out,
            disturbed = metrics.is_disturbed(),
            "Cycle finalized"
        );
        TrackerOutcome::Finalized(metrics)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: u64 = 60_000;

    fn ev(minute: u64, kind: EventKind) -> ZoneEvent {
        ZoneEvent::new(minute * MIN, kind)
    }

    fn sample(minute: u64, temp: f64) -> ZoneEvent {
        ev(minute, EventKind::TemperatureSample { temp: Some(temp) })
    }

    fn heating_tracker() -> CycleTracker {
        CycleTracker::new(TrackerConfig::default())
            .with_mode(HvacMode::Heat)
            .with_target(20.0)
    }

    fn feed(tracker: &mut CycleTracker, events: &[ZoneEvent]) -> Vec<TrackerOutcome> {
        events.iter().flat_map(|e| tracker.handle(e)).collect()
    }

    #[test]
    fn test_only_activation_leaves_idle() {
        let mut tracker = heating_tracker();
        feed(
            &mut tracker,
            &[
                sample(0, 19.0),
                ev(1, EventKind::DeviceDeactivated),
                ev(2, EventKind::SettlingStarted),
                ev(3, EventKind::Tick),
            ],
        );
        assert_eq!(tracker.state(), CycleState::Idle);

        let out = tracker.handle(&ev(4, EventKind::DeviceActivated));
        assert_eq!(tracker.state(), CycleState::Heating);
        assert!(matches!(out[0], TrackerOutcome::Started { cycle_id: 1, mode: CycleMode::Heat }));
    }

    #[test]
    fn test_activation_with_hvac_off_is_ignored() {
        let mut tracker = CycleTracker::new(TrackerConfig::default()).with_target(20.0);
        assert!(tracker.handle(&ev(0, EventKind::DeviceActivated)).is_empty());
        assert_eq!(tracker.state(), CycleState::Idle);
    }

    #[test]
    fn test_short_cycle_is_discarded() {
        let mut tracker = heating_tracker();
        let mut events = vec![sample(0, 19.0), ev(0, EventKind::DeviceActivated)];
        for m in 1..5 {
            events.push(sample(m, 19.0 + m as f64 * 0.25));
        }
        events.push(ev(5, EventKind::DeviceDeactivated));
        let out = feed(&mut tracker, &events);
        assert!(out.iter().all(|o| !matches!(o, TrackerOutcome::Finalized(_))));

        let out = tracker.handle(&ev(6, EventKind::DeviceActivated));
        assert!(out
            .iter()
            .any(|o| matches!(o, TrackerOutcome::Discarded { reason: DiscardReason::TooShort { .. }, .. })));
    }

    #[test]
    fn test_contact_open_beyond_grace_aborts() {
        let mut tracker = heating_tracker();
        feed(
            &mut tracker,
            &[sample(0, 19.0), ev(0, EventKind::DeviceActivated), ev(5, EventKind::ContactPaused)],
        );
        assert_eq!(tracker.state(), CycleState::Heating);

        let out = tracker.handle(&ev(8, EventKind::Tick));
        assert_eq!(tracker.state(), CycleState::Idle);
        assert!(matches!(
            out[0],
            TrackerOutcome::Aborted { reason: AbortReason::ContactOpen, .. }
        ));
    }

    #[test]
    fn test_short_contact_pause_is_interruption() {
        let mut tracker = heating_tracker();
        feed(
            &mut tracker,
            &[
                sample(0, 19.0),
                ev(0, EventKind::DeviceActivated),
                ev(5, EventKind::ContactPaused),
                ZoneEvent::new(5 * MIN + 30_000, EventKind::ContactResumed),
            ],
        );
        assert_eq!(tracker.state(), CycleState::Heating);
        let active = tracker.active.as_ref().unwrap();
        assert_eq!(active.interruptions.len(), 1);
    }

    #[test]
    fn test_zero_grace_aborts_immediately() {
        let config = TrackerConfig {
            contact_grace_secs: 0,
            ..TrackerConfig::default()
        };
        let mut tracker = CycleTracker::new(config).with_mode(HvacMode::Heat).with_target(20.0);
        tracker.handle(&ev(0, EventKind::DeviceActivated));
        let out = tracker.handle(&ev(1, EventKind::ContactPaused));
        assert!(matches!(out[0], TrackerOutcome::Aborted { .. }));
    }

    #[test]
    fn test_major_setpoint_change_while_settling_aborts() {
        let mut tracker = heating_tracker();
        feed(
            &mut tracker,
            &[sample(0, 19.0), ev(0, EventKind::DeviceActivated), ev(20, EventKind::DeviceDeactivated)],
        );
        let out = tracker.handle(&ev(21, EventKind::SetpointChanged { target: 21.0 }));
        assert!(matches!(
            out[0],
            TrackerOutcome::Aborted { reason: AbortReason::MajorSetpointChange, .. }
        ));
    }

    #[test]
    fn test_setpoint_change_while_heating_keeps_cycle() {
        let mut tracker = heating_tracker();
        feed(&mut tracker, &[sample(0, 19.0), ev(0, EventKind::DeviceActivated)]);
        let out = tracker.handle(&ev(5, EventKind::SetpointChanged { target: 22.0 }));
        assert!(out.is_empty());
        assert_eq!(tracker.state(), CycleState::Heating);
        assert_eq!(tracker.active.as_ref().unwrap().target, 22.0);
    }

    #[test]
    fn test_incompatible_mode_change_aborts() {
        let mut tracker = heating_tracker();
        tracker.handle(&ev(0, EventKind::DeviceActivated));
        let out = tracker.handle(&ev(1, EventKind::ModeChanged { mode: HvacMode::Cool }));
        assert!(matches!(out[0], TrackerOutcome::Aborted { reason: AbortReason::ModeChange, .. }));
    }

    #[test]
    fn test_invalid_samples_are_skipped() {
        let mut tracker = heating_tracker();
        tracker.handle(&ev(0, EventKind::DeviceActivated));
        tracker.handle(&ev(1, EventKind::TemperatureSample { temp: None }));
        tracker.handle(&ev(2, EventKind::TemperatureSample { temp: Some(f64::NAN) }));
        tracker.handle(&ev(3, EventKind::TemperatureSample { temp: Some(150.0) }));
        assert!(tracker.active.as_ref().unwrap().samples.is_empty());
        assert_eq!(tracker.last_temperature(), None);
    }

    #[test]
    fn test_settling_timeout_finalizes() {
        let mut tracker = heating_tracker();
        let mut events = vec![sample(0, 19.0), ev(0, EventKind::DeviceActivated)];
        for m in 1..=20 {
            events.push(sample(m, 19.0 + m as f64 * 0.05));
        }
        events.push(ev(20, EventKind::DeviceDeactivated));
        feed(&mut tracker, &events);
        assert_eq!(tracker.state(), CycleState::Settling);

        let deadline = tracker.settling_deadline_ms().unwrap();
        let out = tracker.handle(&ZoneEvent::new(deadline, EventKind::Tick));
        match &out[0] {
            TrackerOutcome::Finalized(metrics) => assert!(metrics.timed_out),
            other => panic!("unexpected outcome {:?}", other),
        }
        assert_eq!(tracker.state(), CycleState::Idle);
    }

    #[test]
    fn test_overlap_finalizes_previous_cycle() {
        let mut tracker = heating_tracker();
        let mut events = vec![sample(0, 19.0), ev(0, EventKind::DeviceActivated)];
        for m in 1..=15 {
            events.push(sample(m, 19.0 + m as f64 * 0.06));
        }
        events.push(ev(15, EventKind::DeviceDeactivated));
        feed(&mut tracker, &events);

        let out = tracker.handle(&ev(16, EventKind::DeviceActivated));
        assert!(matches!(out[0], TrackerOutcome::Finalized(_)));
        assert!(matches!(out[1], TrackerOutcome::Started { cycle_id: 2, .. }));
        assert_eq!(tracker.state(), CycleState::Heating);
    }

    #[test]
    fn test_grace_window_discards() {
        let mut tracker = heating_tracker();
        tracker.begin_restart_grace(0);
        let mut events = vec![sample(0, 19.0), ev(1, EventKind::DeviceActivated)];
        for m in 2..=20 {
            events.push(sample(m, 19.5));
        }
        events.push(ev(20, EventKind::DeviceDeactivated));
        feed(&mut tracker, &events);
        let out = tracker.handle(&ev(21, EventKind::DeviceActivated));
        assert!(matches!(
            out[0],
            TrackerOutcome::Discarded { reason: DiscardReason::GraceWindow(GraceReason::Restart), .. }
        ));
    }

    /// Fifteen minutes of steady rise; `extra` is fed right after activation
    fn run_valid_cycle(tracker: &mut CycleTracker, extra: &[ZoneEvent]) -> CycleMetrics {
        let mut events = vec![sample(0, 19.0), ev(0, EventKind::DeviceActivated)];
        events.extend_from_slice(extra);
        for m in 1..=15 {
            events.push(sample(m, 19.0 + m as f64 * 0.06));
        }
        events.push(ev(15, EventKind::DeviceDeactivated));
        feed(tracker, &events);

        match tracker.handle(&ev(16, EventKind::DeviceActivated)).remove(0) {
            TrackerOutcome::Finalized(metrics) => metrics,
            other => panic!("unexpected outcome {:?}", other),
        }
    }

    #[test]
    fn test_too_few_samples_is_discarded() {
        let mut tracker = heating_tracker();
        feed(
            &mut tracker,
            &[
                sample(0, 19.0),
                ev(0, EventKind::DeviceActivated),
                sample(7, 19.5),
                ev(12, EventKind::DeviceDeactivated),
            ],
        );
        let out = tracker.handle(&ev(16, EventKind::DeviceActivated));
        assert!(matches!(
            out[0],
            TrackerOutcome::Discarded { reason: DiscardReason::TooFewSamples { count: 2 }, .. }
        ));
        assert!(out.iter().all(|o| !matches!(o, TrackerOutcome::Finalized(_))));
    }

    #[test]
    fn test_undisturbed_cycle_is_learning_eligible() {
        let mut tracker = heating_tracker();
        let metrics = run_valid_cycle(&mut tracker, &[]);
        assert!(!metrics.is_disturbed());
        assert!(metrics.is_learning_eligible());
    }

    #[test]
    fn test_solar_gain_marks_cycle_disturbed() {
        let mut tracker = heating_tracker();
        let metrics = run_valid_cycle(&mut tracker, &[ev(3, EventKind::SolarGain { high: true })]);
        assert!(metrics.disturbances.solar_gain);
        assert!(!metrics.is_learning_eligible());
    }

    #[test]
    fn test_high_demand_share_marks_mass_recovery() {
        let mut tracker = heating_tracker();
        let metrics = run_valid_cycle(
            &mut tracker,
            &[ev(2, EventKind::ZoneDemandShare { active_fraction: 0.6 })],
        );
        assert!(metrics.disturbances.mass_recovery);
        assert!(!metrics.disturbances.solar_gain);
        assert!(!metrics.is_learning_eligible());

        let mut tracker = heating_tracker();
        let metrics = run_valid_cycle(
            &mut tracker,
            &[ev(2, EventKind::ZoneDemandShare { active_fraction: 0.3 })],
        );
        assert!(!metrics.disturbances.mass_recovery);
    }

    #[test]
    fn test_outdoor_swing_marks_cycle_disturbed() {
        let mut tracker = heating_tracker();
        let metrics = run_valid_cycle(
            &mut tracker,
            &[
                ev(1, EventKind::OutdoorConditions { temp: Some(2.0), wind_speed: None }),
                ev(10, EventKind::OutdoorConditions { temp: Some(9.0), wind_speed: Some(3.0) }),
            ],
        );
        assert!(metrics.disturbances.outdoor_swing);
        assert!((metrics.outdoor_temp_avg.unwrap() - 5.5).abs() < 1e-9);
        assert!(!metrics.is_learning_eligible());
    }

    #[test]
    fn test_contact_resumed_after_grace_aborts() {
        let mut tracker = heating_tracker();
        feed(
            &mut tracker,
            &[sample(0, 19.0), ev(0, EventKind::DeviceActivated), ev(5, EventKind::ContactPaused)],
        );
        let out = tracker.handle(&ZoneEvent::new(5 * MIN + 150_000, EventKind::ContactResumed));
        assert!(matches!(
            out[..],
            [TrackerOutcome::Aborted { reason: AbortReason::ContactOpen, .. }]
        ));
        assert_eq!(tracker.state(), CycleState::Idle);

        // The contact is closed again, so the next cycle runs normally
        let out = tracker.handle(&ev(10, EventKind::DeviceActivated));
        assert!(matches!(out[0], TrackerOutcome::Started { cycle_id: 2, .. }));
    }

    #[test]
    fn test_sample_buffer_overflow_aborts() {
        let config = TrackerConfig {
            max_samples: 3,
            ..TrackerConfig::default()
        };
        let mut tracker = CycleTracker::new(config).with_mode(HvacMode::Heat).with_target(20.0);
        feed(
            &mut tracker,
            &[sample(0, 19.0), ev(0, EventKind::DeviceActivated), sample(1, 19.1), sample(2, 19.2)],
        );
        assert_eq!(tracker.state(), CycleState::Heating);

        let out = tracker.handle(&sample(3, 19.3));
        assert!(matches!(
            out[..],
            [TrackerOutcome::Aborted { reason: AbortReason::SampleOverflow, .. }]
        ));
        assert_eq!(tracker.state(), CycleState::Idle);
    }

    #[test]
    fn test_sample_after_deadline_is_not_analyzed() {
        let mut tracker = heating_tracker();
        let mut events = vec![sample(0, 19.0), ev(0, EventKind::DeviceActivated)];
        for m in 1..=20 {
            events.push(sample(m, 19.0 + m as f64 * 0.05));
        }
        events.push(ev(20, EventKind::DeviceDeactivated));
        feed(&mut tracker, &events);

        let deadline = tracker.settling_deadline_ms().unwrap();
        let out = tracker.handle(&ZoneEvent::new(deadline, EventKind::TemperatureSample { temp: Some(25.0) }));
        match &out[..] {
            [TrackerOutcome::Finalized(metrics)] => {
                assert!(metrics.timed_out);
                assert!((metrics.end_temp - 20.0).abs() < 1e-9);
                assert!(metrics.overshoot.unwrap_or(0.0) < 1.0);
            }
            other => panic!("unexpected outcomes {:?}", other),
        }
        assert_eq!(tracker.last_temperature(), Some(25.0));
    }

    #[test]
    fn test_timestamps_near_max_do_not_overflow() {
        let start = u64::MAX - 10;
        let mut tracker = heating_tracker();
        tracker.begin_restart_grace(start);
        feed(
            &mut tracker,
            &[
                ZoneEvent::new(start, EventKind::TemperatureSample { temp: Some(19.0) }),
                ZoneEvent::new(start, EventKind::DeviceActivated),
                ZoneEvent::new(start + 5, EventKind::DeviceDeactivated),
            ],
        );

        // The deadline saturates instead of wrapping into the past
        assert_eq!(tracker.state(), CycleState::Settling);
        assert_eq!(tracker.settling_deadline_ms(), Some(u64::MAX));
        assert!(tracker.handle(&ZoneEvent::new(start + 6, EventKind::Tick)).is_empty());
        assert_eq!(tracker.state(), CycleState::Settling);
    }

    #[test]
    fn test_settling_timeout_scaled_and_clamped() {
        let mut config = TrackerConfig::default();
        config.thermal_time_constant_hours = 4.0;
        assert_eq!(config.settling_timeout_minutes(), 120.0);
        config.thermal_time_constant_hours = 0.25;
        assert_eq!(config.settling_timeout_minutes(), 30.0);
        config.thermal_time_constant_hours = 1.0;
        assert_eq!(config.settling_timeout_minutes(), 60.0);
    }
}
