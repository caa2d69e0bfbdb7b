//! Constants and configuration defaults for Thermotune
//!
//! Centralizes all magic numbers and tuning defaults.
//! This is the SINGLE SOURCE OF TRUTH for default values; every one of them can be
//! overridden through the serde config structs (`PidConfig`, `TrackerConfig`, ...).
//! Per-heating-type values live in `data::profile`.

/// Time conversions
pub mod time {
    pub const MS_PER_SECOND: f64 = 1000.0;
    pub const MS_PER_MINUTE: f64 = 60_000.0;
    pub const MS_PER_HOUR: u64 = 3_600_000;
    pub const MS_PER_DAY: u64 = 86_400_000;
    pub const SECONDS_PER_HOUR: f64 = 3600.0;
}

/// PID controller defaults
pub mod pid {
    /// Output lower bound (percent demand)
    pub const DEFAULT_OUT_MIN: f64 = 0.0;

    /// Output upper bound (percent demand)
    pub const DEFAULT_OUT_MAX: f64 = 100.0;

    /// Derivative filter strength when the heating type does not override it
    /// (1.0 = raw rate, lower = heavier filtering)
    pub const DEFAULT_DERIVATIVE_FILTER_ALPHA: f64 = 0.25;

    /// Larger gaps between calls are treated as a clock jump / restart
    pub const MAX_DT_SECS: f64 = 3600.0;

    /// Safety-net decay engages once temperature is this far past the setpoint (°C)
    pub const SAFETY_NET_ERROR_THRESHOLD: f64 = 0.3;

    /// Base safety-net decay rate (fraction of integral per hour at the threshold)
    pub const SAFETY_NET_DECAY_PER_HOUR: f64 = 0.5;

    /// Maximum fraction of the integral removed by one safety-net step
    pub const SAFETY_NET_MAX_STEP: f64 = 0.5;

    /// Wind compensation gain (per m/s per °C of indoor/outdoor difference)
    pub const DEFAULT_KE_WIND: f64 = 0.0;
}

/// Cycle analysis defaults
pub mod analysis {
    /// Hysteresis band around target when counting oscillations (°C)
    pub const DEFAULT_OSCILLATION_HYSTERESIS: f64 = 0.1;

    /// Samples must stay within this distance of target to count as settled (°C)
    pub const DEFAULT_SETTLING_TOLERANCE: f64 = 0.3;

    /// MAD of the settling window must fall below this (°C)
    pub const DEFAULT_SETTLING_MAD_THRESHOLD: f64 = 0.05;

    /// Consecutive samples forming a settling window
    pub const DEFAULT_SETTLING_WINDOW: usize = 5;

    /// Rise time ends at `target - tolerance` (°C)
    pub const DEFAULT_RISE_TOLERANCE: f64 = 0.2;

    /// Scale factor making MAD a consistent estimator of standard deviation
    pub const MAD_SCALE: f64 = 1.4826;

    /// Values further than K scaled MADs from the median are outliers
    pub const OUTLIER_MAD_K: f64 = 3.0;
}

/// Cycle tracker defaults
pub mod cycle {
    /// Cycles shorter than this never produce metrics (minutes)
    pub const MIN_CYCLE_DURATION_MINUTES: f64 = 10.0;

    /// Cycles with fewer valid samples never produce metrics
    pub const MIN_CYCLE_SAMPLES: usize = 5;

    /// Settling timeout = thermal time constant * factor, clamped to min/max
    pub const SETTLING_TIMEOUT_FACTOR: f64 = 1.0;
    pub const SETTLING_TIMEOUT_MIN_MINUTES: f64 = 30.0;
    pub const SETTLING_TIMEOUT_MAX_MINUTES: f64 = 120.0;

    /// Setpoint changes above this while the device is idle abort the cycle (°C)
    pub const MAJOR_SETPOINT_CHANGE: f64 = 0.5;

    /// Contact-open events shorter than this only mark an interruption (seconds)
    pub const CONTACT_GRACE_SECS: u64 = 120;

    /// Cycles starting this soon after a restart are ignored for learning (minutes)
    pub const RESTART_GRACE_MINUTES: u64 = 15;

    /// Outdoor temperature spread during a cycle that marks it disturbed (°C)
    pub const OUTDOOR_SWING_THRESHOLD: f64 = 5.0;

    /// Share of zones heating at once that marks a mass-recovery cycle
    pub const MASS_RECOVERY_SHARE: f64 = 0.5;

    /// Hard bound on buffered samples per cycle (3 days at one per minute)
    pub const MAX_SAMPLES_PER_CYCLE: usize = 4320;
}

/// Adaptive learning defaults
pub mod learning {
    /// Cycles kept per mode (FIFO eviction)
    pub const MAX_CYCLE_HISTORY: usize = 50;

    /// Gain snapshots kept per mode
    pub const MAX_PID_HISTORY: usize = 10;

    /// Recent eligible cycles aggregated by the rule engine
    pub const LEARNING_WINDOW: usize = 10;

    /// Consecutive in-threshold cycles required to declare convergence
    pub const CONVERGENCE_CONSECUTIVE_CYCLES: u32 = 3;

    pub const CONFIDENCE_GAIN_PER_GOOD_CYCLE: f64 = 0.1;
    pub const CONFIDENCE_LOSS_PER_BAD_CYCLE: f64 = 0.05;

    /// Confidence lost per elapsed day without a good cycle
    pub const CONFIDENCE_DECAY_PER_DAY: f64 = 0.02;

    /// Learning-rate multiplier at confidence 0.0 and 1.0
    pub const LEARNING_RATE_AT_ZERO_CONFIDENCE: f64 = 1.5;
    pub const LEARNING_RATE_AT_FULL_CONFIDENCE: f64 = 0.5;

    /// Largest relative change to any gain in one adjustment
    pub const MAX_STEP_CHANGE: f64 = 0.2;

    /// Absolute gain bounds
    pub const KP_RANGE: (f64, f64) = (0.1, 500.0);
    pub const KI_RANGE: (f64, f64) = (0.0, 100.0);
    pub const KD_RANGE: (f64, f64) = (0.0, 5000.0);

    /// Relative gain changes below this are not worth applying
    pub const MIN_MEANINGFUL_CHANGE: f64 = 0.01;
}

/// Automatic-apply safety limits
pub mod safety {
    /// Lifetime cap on automatic applications per mode
    pub const MAX_LIFETIME_AUTO_APPLIES: u32 = 20;

    /// Rolling seasonal window and its cap
    pub const SEASON_WINDOW_DAYS: u64 = 90;
    pub const MAX_AUTO_APPLIES_PER_SEASON: u32 = 5;

    /// Maximum relative drift of any gain from the physics baseline
    pub const MAX_CUMULATIVE_DRIFT: f64 = 0.5;

    /// Change of mean outdoor temperature between cycle groups that counts as a regime shift (°C)
    pub const REGIME_SHIFT_THRESHOLD: f64 = 5.0;

    /// Cycles per comparison group for regime detection
    pub const REGIME_WINDOW_CYCLES: usize = 3;

    /// Automatic application is paused this long after a regime shift
    pub const REGIME_COOLDOWN_HOURS: u64 = 48;

    /// Cycles observed after an automatic application
    pub const VALIDATION_CYCLES: usize = 5;

    /// Mean overshoot above baseline * (1 + this) triggers rollback
    pub const VALIDATION_DEGRADATION: f64 = 0.3;

    /// Baseline overshoot floor so a perfect baseline does not fail on noise (°C)
    pub const VALIDATION_MIN_BASELINE: f64 = 0.05;
}

/// Persistence defaults
pub mod persistence {
    /// Current persisted record version
    pub const RECORD_VERSION: u32 = 1;

    /// Maximum state file size accepted on load (10 MB)
    pub const MAX_STATE_FILE_SIZE: u64 = 10 * 1024 * 1024;

    /// Saves for the same zone within this window are coalesced
    pub const SAVE_DEBOUNCE_MS: u64 = 5000;

    /// Directory name under the platform data dir
    pub const STATE_DIR_NAME: &str = "thermotune";
}
