//! Zone ownership and dispatch
//!
//! A `Zone` owns one controller, one cycle tracker and one learner and is the only
//! thing that wires them together: events go to the tracker, finalized cycles go to
//! the learner, resulting gain changes go back to the controller. `ZoneRegistry`
//! holds the zones by id; zones never see each other.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, info_span, warn};
use tt_error::{Result, ThermotuneError};
use tt_protocol::{validate_zone_id, EventKind, HvacMode, ZoneEvent, ZoneStatusReport};

use crate::constants::time;
use crate::cycle::{CycleTracker, TrackerConfig, TrackerOutcome};
use crate::data::{ClassProfile, ConvergenceThresholds, CycleMetrics, CycleMode, HeatingType, PidGains, ZoneRecord};
use crate::learning::{AdaptiveLearner, AutoApplyDecision, BlockReason, GainAdjustment, LearningConfig};
use crate::pid::{Direction, PidConfig, PidController};

/// Warnings kept for the status report
const MAX_WARNINGS: usize = 10;

/// Per-zone configuration
///
/// Everything except `id` is optional; unset values come from the heating-type
/// profile and the crate defaults.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ZoneConfig {
    pub id: String,
    #[serde(default)]
    pub heating_type: HeatingType,
    /// Starting heating gains instead of the profile baseline
    #[serde(default)]
    pub gains: Option<PidGains>,
    #[serde(default)]
    pub cooling_gains: Option<PidGains>,
    /// Apply learned adjustments without operator confirmation
    #[serde(default)]
    pub auto_apply: bool,
    #[serde(default)]
    pub thresholds: Option<ConvergenceThresholds>,
    #[serde(default)]
    pub min_adjustment_interval_hours: Option<f64>,
    #[serde(default)]
    pub min_cycles_between_adjustments: Option<u32>,
    #[serde(default)]
    pub pid: Option<PidConfig>,
    #[serde(default)]
    pub tracker: Option<TrackerConfig>,
    #[serde(default)]
    pub learning: LearningConfig,
}

impl ZoneConfig {
    pub fn new(id: impl Into<String>, heating_type: HeatingType) -> Self {
        Self {
            id: id.into(),
            heating_type,
            gains: None,
            cooling_gains: None,
            auto_apply: false,
            thresholds: None,
            min_adjustment_interval_hours: None,
            min_cycles_between_adjustments: None,
            pid: None,
            tracker: None,
            learning: LearningConfig::default(),
        }
    }

    pub fn with_auto_apply(mut self, auto_apply: bool) -> Self {
        self.auto_apply = auto_apply;
        self
    }

    /// Heating-type profile with this zone's overrides applied
    pub fn profile(&self) -> ClassProfile {
        let mut profile = self.heating_type.profile();
        if let Some(thresholds) = self.thresholds {
            profile.thresholds = thresholds;
        }
        if let Some(hours) = self.min_adjustment_interval_hours {
            profile.min_adjustment_interval_hours = hours;
        }
        if let Some(cycles) = self.min_cycles_between_adjustments {
            profile.min_cycles_between_adjustments = cycles;
        }
        profile
    }

    pub fn validate(&self) -> Result<()> {
        validate_zone_id(&self.id).map_err(ThermotuneError::InvalidZoneId)?;
        for (field, gains) in [("gains", self.gains), ("cooling_gains", self.cooling_gains)] {
            if gains.is_some_and(|g| !g.is_finite()) {
                return Err(ThermotuneError::invalid_config(field, "gains must be finite"));
            }
        }
        if let Some(pid) = &self.pid {
            if !pid.out_min.is_finite() || !pid.out_max.is_finite() || pid.out_min >= pid.out_max {
                return Err(ThermotuneError::invalid_config("pid.out_min", "must be below out_max"));
            }
        }
        Ok(())
    }
}

/// Everything a single event changed
#[derive(Debug, Clone, Default)]
pub struct ZoneUpdate {
    /// Controller output when the event produced a new one
    pub output: Option<f64>,
    pub outcomes: Vec<TrackerOutcome>,
    /// Adjustment applied automatically
    pub applied: Option<GainAdjustment>,
    /// Adjustment waiting for operator confirmation
    pub recommendation: Option<GainAdjustment>,
    pub blocked: Option<BlockReason>,
    pub rollback: Option<PidGains>,
    /// Learner state changed and should be persisted
    pub dirty: bool,
}

impl ZoneUpdate {
    pub fn recorded(&self) -> impl Iterator<Item = &CycleMetrics> {
        self.outcomes.iter().filter_map(|o| match o {
            TrackerOutcome::Finalized(metrics) => Some(metrics),
            _ => None,
        })
    }
}

/// One climate zone
#[derive(Debug)]
pub struct Zone {
    config: ZoneConfig,
    pid: PidController,
    tracker: CycleTracker,
    learner: AdaptiveLearner,
    /// Mode whose gains are loaded in the controller
    control_mode: CycleMode,
    last_calc_ms: Option<u64>,
    outdoor: Option<f64>,
    wind: Option<f64>,
    last_output: Option<f64>,
    last_block: Option<BlockReason>,
    recommendation: Option<GainAdjustment>,
    warnings: Vec<String>,
    restart_grace_pending: bool,
}

impl Zone {
    pub fn new(config: ZoneConfig) -> Result<Self> {
        config.validate()?;
        let profile = config.profile();

        let mut learner = AdaptiveLearner::new(profile, config.learning);
        if let Some(gains) = config.gains {
            learner = learner.with_gains(CycleMode::Heat, gains);
        }
        if let Some(gains) = config.cooling_gains {
            learner = learner.with_gains(CycleMode::Cool, gains);
        }

        let pid_config = config.pid.unwrap_or_else(|| PidConfig::for_profile(&profile));
        let tracker_config = config.tracker.unwrap_or_else(|| TrackerConfig::for_profile(&profile));
        let pid = PidController::new(learner.gains(CycleMode::Heat), pid_config);

        info!(
            zone = %config.id,
            heating_type = profile.heating_type.as_str(),
            auto_apply = config.auto_apply,
            "Zone created"
        );

        Ok(Self {
            pid,
            tracker: CycleTracker::new(tracker_config),
            learner,
            control_mode: CycleMode::Heat,
            last_calc_ms: None,
            outdoor: None,
            wind: None,
            last_output: None,
            last_block: None,
            recommendation: None,
            warnings: Vec::new(),
            restart_grace_pending: false,
            config,
        })
    }

    pub fn id(&self) -> &str {
        &self.config.id
    }

    pub fn config(&self) -> &ZoneConfig {
        &self.config
    }

    pub fn controller(&self) -> &PidController {
        &self.pid
    }

    pub fn tracker(&self) -> &CycleTracker {
        &self.tracker
    }

    pub fn learner(&self) -> &AdaptiveLearner {
        &self.learner
    }

    /// Pending recommendation, only produced when auto-apply is off
    pub fn recommendation(&self) -> Option<&GainAdjustment> {
        self.recommendation.as_ref()
    }

    fn warn_status(&mut self, message: String) {
        if self.warnings.len() >= MAX_WARNINGS {
            self.warnings.remove(0);
        }
        self.warnings.push(message);
    }

    /// Load persisted learner state and the controller integral
    ///
    /// Cycles starting within the restart grace window after the next event are
    /// not learned from. Returns the number of dropped corrupt entries.
    pub fn restore(&mut self, value: &Value) -> usize {
        let dropped = self.learner.restore(&self.config.id, value);
        if dropped > 0 {
            self.warn_status(format!("{} corrupt persisted entries dropped", dropped));
        }

        self.pid.set_gains(self.learner.gains(self.control_mode));
        if let Some(integral) = self.learner.take_restored_integral(self.control_mode) {
            self.pid.restore_integral(integral);
            debug!(integral, "Controller integral restored");
        }
        let auto_applied = [CycleMode::Heat, CycleMode::Cool]
            .iter()
            .any(|m| self.learner.convergence(*m).auto_apply_count > 0);
        if auto_applied {
            self.pid.mark_auto_applied();
        }
        self.restart_grace_pending = true;
        dropped
    }

    pub fn to_record(&self) -> ZoneRecord {
        let mut record = self.learner.to_record(&self.config.id);
        record.mode_mut(self.control_mode).integral = Some(self.pid.state().integral);
        record
    }

    /// Feed one event through controller, tracker and learner
    pub fn handle_event(&mut self, event: &ZoneEvent) -> ZoneUpdate {
        let span = info_span!("zone", zone = %self.config.id);
        let _guard = span.enter();

        let now = event.timestamp_ms;
        let mut update = ZoneUpdate::default();

        if self.restart_grace_pending {
            self.restart_grace_pending = false;
            self.tracker.begin_restart_grace(now);
        }

        match &event.kind {
            EventKind::TemperatureSample { temp: Some(temp) } => {
                update.output = self.run_controller(now, *temp);
            }
            EventKind::ModeChanged { mode } => self.switch_mode(*mode),
            EventKind::OutdoorConditions { temp, wind_speed } => {
                if let Some(t) = temp.filter(|t| t.is_finite()) {
                    self.outdoor = Some(t);
                }
                if let Some(w) = wind_speed.filter(|w| w.is_finite()) {
                    self.wind = Some(w);
                }
            }
            EventKind::Feedforward { value } => self.pid.set_feedforward(*value),
            EventKind::ManualGains { kp, ki, kd, ke } => {
                let ke = ke.unwrap_or(self.learner.gains(self.control_mode).ke);
                let gains = PidGains::new(*kp, *ki, *kd, ke);
                self.learner.on_manual_gain_change(self.control_mode, gains, now);
                self.load_gains(gains);
                self.recommendation = None;
                update.dirty = true;
            }
            EventKind::ResetLearning => {
                let gains = self.learner.reset(self.control_mode, now);
                self.load_gains(gains);
                self.recommendation = None;
                self.last_block = None;
                update.dirty = true;
            }
            _ => {}
        }

        update.outcomes = self.tracker.handle(event);
        let finalized: Vec<CycleMetrics> = update.recorded().cloned().collect();
        for metrics in &finalized {
            self.learn_from(metrics, now, &mut update);
        }

        update
    }

    fn run_controller(&mut self, now: u64, temp: f64) -> Option<f64> {
        if self.tracker.hvac_mode() == HvacMode::Off {
            return None;
        }
        let target = self.tracker.target()?;
        let dt_secs = match self.last_calc_ms {
            Some(last) if now > last => (now - last) as f64 / time::MS_PER_SECOND,
            _ => 0.0,
        };
        self.last_calc_ms = Some(now);

        let output = self.pid.calc(temp, target, dt_secs, self.outdoor, self.wind);
        self.tracker.record_controller_state(self.pid.state());
        self.last_output = Some(output);
        debug!(temp, target, output, "Controller step");
        Some(output)
    }

    fn switch_mode(&mut self, mode: HvacMode) {
        let Some(cycle_mode) = CycleMode::from_hvac(mode) else {
            return;
        };
        if cycle_mode == self.control_mode {
            return;
        }
        self.control_mode = cycle_mode;
        self.pid.set_gains(self.learner.gains(cycle_mode));
        self.pid.set_direction(match cycle_mode {
            CycleMode::Heat => Direction::Direct,
            CycleMode::Cool => Direction::Reverse,
        });
        if let Some(integral) = self.learner.take_restored_integral(cycle_mode) {
            self.pid.restore_integral(integral);
        }
        self.last_calc_ms = None;
        self.recommendation = None;
        info!(mode = cycle_mode.as_str(), "Controller switched mode");
    }

    fn load_gains(&mut self, gains: PidGains) {
        self.pid.set_gains(gains);
        self.pid.prepare_bumpless_transfer();
    }

    fn learn_from(&mut self, metrics: &CycleMetrics, now: u64, update: &mut ZoneUpdate) {
        let mode = metrics.mode;
        let result = self.learner.record_cycle(metrics);
        update.dirty = true;

        if let Some(gains) = result.rollback {
            self.warn_status(format!("{} adjustment rolled back after validation", mode.as_str()));
            if mode == self.control_mode {
                self.load_gains(gains);
            }
            update.rollback = Some(gains);
            return;
        }

        let Some(adjustment) = self.learner.calculate_adjustment(mode) else {
            return;
        };

        if !self.config.auto_apply {
            match self.learner.rate_limit(mode, now) {
                Some(reason) => {
                    debug!(reason = reason.as_str(), "Recommendation held back");
                    self.last_block = Some(reason);
                    update.blocked = Some(reason);
                }
                None => {
                    info!(mode = mode.as_str(), "Recommended adjustment: {}", adjustment.describe());
                    self.recommendation = Some(adjustment.clone());
                    update.recommendation = Some(adjustment);
                }
            }
            return;
        }

        match self.learner.check_auto_apply(&adjustment, now) {
            AutoApplyDecision::Allowed => {
                let gains = self.learner.apply_adjustment(&adjustment, now, true);
                if mode == self.control_mode {
                    self.load_gains(gains);
                }
                self.pid.mark_auto_applied();
                self.last_block = None;
                update.applied = Some(adjustment);
            }
            AutoApplyDecision::Blocked(reason) => {
                self.last_block = Some(reason);
                update.blocked = Some(reason);
            }
        }
    }

    /// Apply the pending recommendation on operator request
    pub fn accept_recommendation(&mut self, now_ms: u64) -> Option<PidGains> {
        let adjustment = self.recommendation.take()?;
        let gains = self.learner.apply_adjustment(&adjustment, now_ms, false);
        if adjustment.mode == self.control_mode {
            self.load_gains(gains);
        }
        Some(gains)
    }

    pub fn status(&self) -> ZoneStatusReport {
        let mode = self.control_mode;
        let gains = self.pid.gains();
        ZoneStatusReport {
            zone: self.config.id.clone(),
            mode: self.tracker.hvac_mode(),
            cycle_state: self.tracker.state().as_str().to_string(),
            learning_status: self.learner.learning_status(mode),
            convergence_confidence_pct: self.learner.confidence_pct(mode),
            kp: gains.kp,
            ki: gains.ki,
            kd: gains.kd,
            ke: gains.ke,
            output: self.last_output,
            last_blocked_reason: self.last_block.map(|r| r.to_string()),
            warnings: self.warnings.clone(),
        }
    }
}

/// Zones by id
#[derive(Debug, Default)]
pub struct ZoneRegistry {
    zones: HashMap<String, Zone>,
}

impl ZoneRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, zone: Zone) -> Result<()> {
        if self.zones.contains_key(zone.id()) {
            return Err(ThermotuneError::DuplicateZone(zone.id().to_string()));
        }
        info!(zone = zone.id(), "Zone registered");
        self.zones.insert(zone.id().to_string(), zone);
        Ok(())
    }

    pub fn unregister(&mut self, zone_id: &str) -> Result<Zone> {
        let zone = self
            .zones
            .remove(zone_id)
            .ok_or_else(|| ThermotuneError::UnknownZone(zone_id.to_string()))?;
        info!(zone = zone_id, "Zone unregistered");
        Ok(zone)
    }

    pub fn get(&self, zone_id: &str) -> Option<&Zone> {
        self.zones.get(zone_id)
    }

    pub fn get_mut(&mut self, zone_id: &str) -> Option<&mut Zone> {
        self.zones.get_mut(zone_id)
    }

    pub fn dispatch(&mut self, zone_id: &str, event: &ZoneEvent) -> Result<ZoneUpdate> {
        let zone = self
            .zones
            .get_mut(zone_id)
            .ok_or_else(|| ThermotuneError::UnknownZone(zone_id.to_string()))?;
        Ok(zone.handle_event(event))
    }

    /// Deliver the same event to every zone, e.g. a `Tick`
    pub fn broadcast(&mut self, event: &ZoneEvent) -> Vec<(String, ZoneUpdate)> {
        self.zones
            .iter_mut()
            .map(|(id, zone)| (id.clone(), zone.handle_event(event)))
            .collect()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.zones.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.zones.len()
    }

    pub fn is_empty(&self) -> bool {
        self.zones.is_empty()
    }

    pub fn statuses(&self) -> Vec<ZoneStatusReport> {
        let mut reports: Vec<ZoneStatusReport> = self.zones.values().map(Zone::status).collect();
        reports.sort_by(|a, b| a.zone.cmp(&b.zone));
        reports
    }

    pub fn records(&self) -> Vec<ZoneRecord> {
        self.zones.values().map(Zone::to_record).collect()
    }
}
