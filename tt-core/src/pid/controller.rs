//! PID controller for zone heating and cooling
//!
//! # How It Works
//!
//! 1. **Proportional on measurement**: P is seeded from the error on the first call,
//!    then moves only with the measured temperature. Setpoint edits never kick P
//!    and never reset the integral.
//!
//! 2. **Integral in hours**: `I += ki * error * dt_hours` with directional anti-windup
//!    and a dynamic clamp that tracks error and feedforward.
//!
//! 3. **Filtered derivative**: D acts on an exponentially filtered rate of change
//!    (°C/h) so single noisy readings do not spike the output.
//!
//! 4. **Overhang decay**: when the integral and error disagree in sign (the room is
//!    still coasting past target), the integral unwinds toward zero instead of
//!    integrating normally.
//!
//! 5. **Safety net**: until the first automatic gain application, an integral that
//!    keeps pushing while the room is already well past setpoint is decayed
//!    progressively.

use serde::{Deserialize, Serialize};
use tracing::{debug, trace, warn};

use crate::constants::{pid as pid_const, time};
use crate::data::{ClassProfile, PidGains};

/// Controller action
///
/// `Direct` raises output when the measurement is below setpoint (heating),
/// `Reverse` raises it when the measurement is above (cooling).
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "snake_case")]
pub enum Direction {
    #[default]
    Direct,
    Reverse,
}

impl Direction {
    fn sign(&self) -> f64 {
        match self {
            Direction::Direct => 1.0,
            Direction::Reverse => -1.0,
        }
    }
}

/// Controller tunables
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct PidConfig {
    pub out_min: f64,
    pub out_max: f64,
    /// EMA weight of the newest rate sample (1.0 = unfiltered)
    pub derivative_filter_alpha: f64,
    pub overhang_decay_multiplier: f64,
    /// Calls further apart than this are treated as a restart
    pub max_dt_secs: f64,
    /// Wind compensation gain
    pub ke_wind: f64,
    pub safety_net_error_threshold: f64,
    pub safety_net_decay_per_hour: f64,
    pub safety_net_max_step: f64,
}

impl Default for PidConfig {
    fn default() -> Self {
        Self {
            out_min: pid_const::DEFAULT_OUT_MIN,
            out_max: pid_const::DEFAULT_OUT_MAX,
            derivative_filter_alpha: pid_const::DEFAULT_DERIVATIVE_FILTER_ALPHA,
            overhang_decay_multiplier: 2.0,
            max_dt_secs: pid_const::MAX_DT_SECS,
            ke_wind: pid_const::DEFAULT_KE_WIND,
            safety_net_error_threshold: pid_const::SAFETY_NET_ERROR_THRESHOLD,
            safety_net_decay_per_hour: pid_const::SAFETY_NET_DECAY_PER_HOUR,
            safety_net_max_step: pid_const::SAFETY_NET_MAX_STEP,
        }
    }
}

impl PidConfig {
    /// Defaults with the heating-type specific filter and decay values
    pub fn for_profile(profile: &ClassProfile) -> Self {
        Self {
            derivative_filter_alpha: profile.derivative_filter_alpha,
            overhang_decay_multiplier: profile.overhang_decay_multiplier,
            ..Self::default()
        }
    }
}

/// Observable controller state
#[derive(Debug, Clone, Copy, Serialize, PartialEq)]
pub struct PidState {
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub ke: f64,
    pub integral: f64,
    pub feedforward: f64,
    pub clamped_high: bool,
    pub clamped_low: bool,
    pub last_output: f64,
    /// Running count of overhang decay steps since creation
    pub overhang_decay_steps: u32,
    /// Running count of safety-net decay steps since creation
    pub safety_net_decay_steps: u32,
}

impl PidState {
    pub fn is_clamped(&self) -> bool {
        self.clamped_high || self.clamped_low
    }
}

/// PID controller with anti-windup, derivative filtering and bumpless transfer
#[derive(Debug, Clone)]
pub struct PidController {
    config: PidConfig,
    gains: PidGains,
    direction: Direction,
    integral: f64,
    /// Proportional term, `None` until seeded by the first call
    proportional: Option<f64>,
    last_measurement: Option<f64>,
    filtered_rate: f64,
    feedforward: f64,
    clamped_high: bool,
    clamped_low: bool,
    last_output: f64,
    auto_applied: bool,
    bumpless_pending: bool,
    overhang_decay_steps: u32,
    safety_net_decay_steps: u32,
}

impl PidController {
    pub fn new(gains: PidGains, config: PidConfig) -> Self {
        Self {
            config,
            gains,
            direction: Direction::Direct,
            integral: 0.0,
            proportional: None,
            last_measurement: None,
            filtered_rate: 0.0,
            feedforward: 0.0,
            clamped_high: false,
            clamped_low: false,
            last_output: config.out_min.max(0.0).min(config.out_max),
            auto_applied: false,
            bumpless_pending: false,
            overhang_decay_steps: 0,
            safety_net_decay_steps: 0,
        }
    }

    pub fn with_direction(mut self, direction: Direction) -> Self {
        self.direction = direction;
        self
    }

    /// Start with the safety net already disabled
    pub fn with_auto_applied(mut self, auto_applied: bool) -> Self {
        self.auto_applied = auto_applied;
        self
    }

    /// Compute the control output
    ///
    /// # Arguments
    /// * `measurement` - Zone temperature in °C
    /// * `setpoint` - Target temperature in °C
    /// * `dt_secs` - Seconds since the previous call (`<= 0` on the first call)
    /// * `outdoor_temp` - Outdoor temperature for the external term, if known
    /// * `wind_speed` - Wind speed in m/s, if known
    ///
    /// Returns output within `[out_min, out_max]`. Non-finite inputs return the
    /// previous output and leave all state untouched.
    pub fn calc(
        &mut self,
        measurement: f64,
        setpoint: f64,
        dt_secs: f64,
        outdoor_temp: Option<f64>,
        wind_speed: Option<f64>,
    ) -> f64 {
        let aux_finite = outdoor_temp.map_or(true, f64::is_finite) && wind_speed.map_or(true, f64::is_finite);
        if !measurement.is_finite() || !setpoint.is_finite() || !dt_secs.is_finite() || !aux_finite {
            warn!(measurement, setpoint, dt_secs, "Non-finite controller input, holding previous output");
            return self.last_output;
        }

        let sign = self.direction.sign();
        let error = sign * (setpoint - measurement);
        let PidGains { kp, ki, kd, ke } = self.gains;

        let clock_jump = dt_secs > self.config.max_dt_secs;
        if clock_jump {
            warn!(dt_secs, max = self.config.max_dt_secs, "Controller gap too large, treating call as restart");
            self.filtered_rate = 0.0;
        }
        let fresh = dt_secs <= 0.0 || clock_jump || self.last_measurement.is_none();
        let dt_hours = dt_secs / time::SECONDS_PER_HOUR;

        // Proportional on measurement
        let proportional = match (self.proportional, self.last_measurement) {
            (Some(p), Some(prev)) => p - kp * sign * (measurement - prev),
            _ => kp * error,
        };

        // Derivative on filtered rate (°C/h)
        if !fresh {
            if let Some(prev) = self.last_measurement {
                let rate = sign * (measurement - prev) / dt_hours;
                let alpha = self.config.derivative_filter_alpha.clamp(0.0, 1.0);
                self.filtered_rate = alpha * rate + (1.0 - alpha) * self.filtered_rate;
            }
        }
        let derivative = -kd * self.filtered_rate;

        let external = match outdoor_temp {
            Some(outdoor) => {
                let delta = sign * (setpoint - outdoor);
                ke * delta + self.config.ke_wind * wind_speed.unwrap_or(0.0) * delta
            }
            None => 0.0,
        };

        if !fresh {
            self.step_integral(error, ki, dt_hours);
        }

        if self.bumpless_pending {
            self.integral = self.last_output - proportional - derivative - external + self.feedforward;
            self.bumpless_pending = false;
            debug!(integral = self.integral, output = self.last_output, "Bumpless transfer applied");
        }

        let lower = self.config.out_min - error - self.feedforward;
        let upper = self.config.out_max - error - self.feedforward;
        self.integral = self.integral.clamp(lower.min(upper), upper.max(lower));

        let raw = proportional + self.integral + derivative + external - self.feedforward;
        let output = raw.clamp(self.config.out_min, self.config.out_max);
        self.clamped_high = raw >= self.config.out_max;
        self.clamped_low = raw <= self.config.out_min;

        trace!(
            p = proportional,
            i = self.integral,
            d = derivative,
            e = external,
            ff = self.feedforward,
            output,
            "PID step"
        );

        self.proportional = Some(proportional);
        self.last_measurement = Some(measurement);
        self.last_output = output;
        output
    }

    fn step_integral(&mut self, error: f64, ki: f64, dt_hours: f64) {
        if self.integral * error < 0.0 {
            // Overhang: unwind toward zero, never past it
            let step = ki * error.abs() * dt_hours * self.config.overhang_decay_multiplier;
            self.integral = if self.integral > 0.0 {
                (self.integral - step).max(0.0)
            } else {
                (self.integral + step).min(0.0)
            };
            self.overhang_decay_steps = self.overhang_decay_steps.saturating_add(1);
        } else {
            let pushing_high = self.clamped_high && error > 0.0;
            let pushing_low = self.clamped_low && error < 0.0;
            if !pushing_high && !pushing_low {
                self.integral += ki * error * dt_hours;
            }
        }

        if self.should_apply_decay() {
            let excursion = -error;
            let threshold = self.config.safety_net_error_threshold;
            if excursion > threshold && self.integral > 0.0 {
                let fraction = (self.config.safety_net_decay_per_hour * (excursion / threshold) * dt_hours)
                    .min(self.config.safety_net_max_step)
                    .max(0.0);
                self.integral *= 1.0 - fraction;
                self.safety_net_decay_steps = self.safety_net_decay_steps.saturating_add(1);
                debug!(excursion, fraction, integral = self.integral, "Safety-net integral decay");
            }
        }
    }

    /// Set the feedforward compensation subtracted from the output
    pub fn set_feedforward(&mut self, value: f64) {
        if value.is_finite() {
            self.feedforward = value;
        } else {
            warn!(value, "Ignoring non-finite feedforward");
        }
    }

    /// Scale the integral by `factor` (clamped to 0.0..=1.0)
    pub fn decay_integral(&mut self, factor: f64) {
        if !factor.is_finite() {
            return;
        }
        self.integral *= factor.clamp(0.0, 1.0);
    }

    /// Make the next `calc` continue from the current output
    pub fn prepare_bumpless_transfer(&mut self) {
        self.bumpless_pending = true;
    }

    /// Whether the untuned-system safety net is active
    pub fn should_apply_decay(&self) -> bool {
        !self.auto_applied
    }

    /// Permanently disable the safety net
    pub fn mark_auto_applied(&mut self) {
        self.auto_applied = true;
    }

    pub fn set_gains(&mut self, gains: PidGains) {
        if !gains.is_finite() {
            warn!(?gains, "Ignoring non-finite gains");
            return;
        }
        // Keep P proportional to the accumulated measurement change
        if let Some(p) = self.proportional {
            self.proportional = if self.gains.kp.abs() > f64::EPSILON {
                Some(p * gains.kp / self.gains.kp)
            } else {
                None
            };
        }
        self.gains = gains;
    }

    pub fn gains(&self) -> PidGains {
        self.gains
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    /// Switch controller action; a reversal starts from a clean state
    pub fn set_direction(&mut self, direction: Direction) {
        if direction == self.direction {
            return;
        }
        self.direction = direction;
        self.integral = 0.0;
        self.proportional = None;
        self.filtered_rate = 0.0;
        self.bumpless_pending = false;
        self.last_output = self.config.out_min.max(0.0).min(self.config.out_max);
    }

    /// Seed the integral from persisted state
    pub fn restore_integral(&mut self, value: f64) {
        if value.is_finite() {
            self.integral = value;
        }
    }

    pub fn output(&self) -> f64 {
        self.last_output
    }

    pub fn state(&self) -> PidState {
        PidState {
            kp: self.gains.kp,
            ki: self.gains.ki,
            kd: self.gains.kd,
            ke: self.gains.ke,
            integral: self.integral,
            feedforward: self.feedforward,
            clamped_high: self.clamped_high,
            clamped_low: self.clamped_low,
            last_output: self.last_output,
            overhang_decay_steps: self.overhang_decay_steps,
            safety_net_decay_steps: self.safety_net_decay_steps,
        }
    }

    /// Clear dynamic state; gains, direction and the auto-applied flag are kept
    pub fn reset(&mut self) {
        self.integral = 0.0;
        self.proportional = None;
        self.last_measurement = None;
        self.filtered_rate = 0.0;
        self.clamped_high = false;
        self.clamped_low = false;
        self.bumpless_pending = false;
        self.last_output = self.config.out_min.max(0.0).min(self.config.out_max);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn controller(kp: f64, ki: f64, kd: f64) -> PidController {
        PidController::new(PidGains::new(kp, ki, kd, 0.0), PidConfig::default())
    }

    #[test]
    fn test_first_call_seeds_proportional_only() {
        let mut pid = controller(10.0, 1.0, 5.0);
        let out = pid.calc(19.0, 20.0, 0.0, None, None);
        assert!((out - 10.0).abs() < 1e-9);
        assert_eq!(pid.state().integral, 0.0);
    }

    #[test]
    fn test_setpoint_change_does_not_bump_proportional() {
        let mut pid = controller(10.0, 0.0, 0.0);
        let first = pid.calc(19.0, 20.0, 0.0, None, None);
        let second = pid.calc(19.0, 21.0, 60.0, None, None);
        assert!((first - second).abs() < 1e-9);
    }

    #[test]
    fn test_integral_is_hour_denominated() {
        let mut pid = controller(0.0, 3.6, 0.0);
        pid.calc(19.0, 20.0, 0.0, None, None);
        let out = pid.calc(19.0, 20.0, 3600.0, None, None);
        assert!((pid.state().integral - 3.6).abs() < 1e-9);
        assert!((out - 3.6).abs() < 1e-9);
    }

    #[test]
    fn test_non_finite_input_returns_cached_output() {
        let mut pid = controller(10.0, 1.0, 1.0);
        let out = pid.calc(19.0, 20.0, 0.0, None, None);
        let before = pid.state();

        assert_eq!(pid.calc(f64::NAN, 20.0, 60.0, None, None), out);
        assert_eq!(pid.calc(19.0, f64::INFINITY, 60.0, None, None), out);
        assert_eq!(pid.calc(19.0, 20.0, f64::NAN, None, None), out);
        assert_eq!(pid.calc(19.0, 20.0, 60.0, Some(f64::NAN), None), out);
        assert_eq!(pid.state(), before);
    }

    #[test]
    fn test_anti_windup_blocks_only_further_saturation() {
        let config = PidConfig {
            out_max: 10.0,
            ..PidConfig::default()
        };
        let mut pid = PidController::new(PidGains::new(20.0, 3.6, 0.0, 0.0), config);
        pid.restore_integral(5.0);

        pid.calc(19.0, 20.0, 0.0, None, None);
        assert!(pid.state().clamped_high);

        // Still cold and saturated high: integral must not grow
        pid.calc(19.0, 20.0, 3600.0, None, None);
        assert!((pid.state().integral - 5.0).abs() < 1e-9);

        // Past setpoint: integral winds down
        pid.calc(20.5, 20.0, 3600.0, None, None);
        assert!(pid.state().integral < 5.0);
        assert!(pid.state().overhang_decay_steps >= 1);
    }

    #[test]
    fn test_overhang_never_crosses_zero() {
        let mut pid = controller(0.0, 100.0, 0.0).with_auto_applied(true);
        pid.restore_integral(2.0);
        pid.calc(20.2, 20.0, 0.0, None, None);
        pid.calc(20.2, 20.0, 3600.0, None, None);
        assert!(pid.state().integral >= 0.0);
    }

    #[test]
    fn test_filtered_derivative() {
        let config = PidConfig {
            out_min: -100.0,
            derivative_filter_alpha: 0.5,
            ..PidConfig::default()
        };
        let mut pid = PidController::new(PidGains::new(0.0, 0.0, 1.0, 0.0), config);
        pid.calc(19.0, 20.0, 0.0, None, None);
        // 0.5 °C in half an hour = 1 °C/h raw, 0.5 °C/h filtered
        let out = pid.calc(19.5, 20.0, 1800.0, None, None);
        assert!((out + 0.5).abs() < 1e-9);
    }

    #[test]
    fn test_restart_preserves_restored_integral() {
        let mut pid = controller(0.0, 1.0, 0.0);
        pid.restore_integral(12.0);
        let out = pid.calc(19.0, 20.0, 0.0, None, None);
        assert!((pid.state().integral - 12.0).abs() < 1e-9);
        assert!((out - 12.0).abs() < 1e-9);
    }

    #[test]
    fn test_clock_jump_skips_integral() {
        let mut pid = controller(0.0, 1.0, 0.0);
        pid.calc(19.0, 20.0, 0.0, None, None);
        pid.calc(19.0, 20.0, 7200.0, None, None);
        assert_eq!(pid.state().integral, 0.0);
    }

    #[test]
    fn test_feedforward_subtracted() {
        let mut pid = controller(10.0, 0.0, 0.0);
        pid.set_feedforward(3.0);
        let out = pid.calc(19.0, 20.0, 0.0, None, None);
        assert!((out - 7.0).abs() < 1e-9);
    }

    #[test]
    fn test_external_term() {
        let mut pid = PidController::new(PidGains::new(0.0, 0.0, 0.0, 0.5), PidConfig::default());
        let out = pid.calc(20.0, 20.0, 0.0, Some(0.0), None);
        assert!((out - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_bumpless_transfer_holds_output() {
        let mut pid = controller(30.0, 0.0, 0.0);
        let before = pid.calc(19.0, 20.0, 0.0, None, None);
        pid.set_gains(PidGains::new(10.0, 0.0, 0.0, 0.0));
        pid.prepare_bumpless_transfer();
        let after = pid.calc(19.0, 20.0, 60.0, None, None);
        assert!((before - after).abs() < 1e-9);
        assert!((pid.state().integral - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_safety_net_disabled_after_auto_apply() {
        let mut pid = controller(1.0, 1.0, 0.0);
        assert!(pid.should_apply_decay());
        pid.mark_auto_applied();
        assert!(!pid.should_apply_decay());
    }

    #[test]
    fn test_reverse_direction_for_cooling() {
        let mut pid = controller(10.0, 0.0, 0.0).with_direction(Direction::Reverse);
        let out = pid.calc(26.0, 24.0, 0.0, None, None);
        assert!((out - 20.0).abs() < 1e-9);
    }

    #[test]
    fn test_decay_integral_clamps_factor() {
        let mut pid = controller(0.0, 1.0, 0.0);
        pid.restore_integral(10.0);
        pid.decay_integral(0.5);
        assert!((pid.state().integral - 5.0).abs() < 1e-9);
        pid.decay_integral(2.0);
        assert!((pid.state().integral - 5.0).abs() < 1e-9);
        pid.decay_integral(-1.0);
        assert_eq!(pid.state().integral, 0.0);
    }
}
