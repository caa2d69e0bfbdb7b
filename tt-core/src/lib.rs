//! Thermotune Core Library
//!
//! Self-tuning PID control for heating and cooling zones.
//!
//! # Features
//!
//! - **PID Controller**: anti-windup, filtered derivative, overhang decay, bumpless transfer
//! - **Cycle Analysis**: overshoot, undershoot, oscillations, settling and rise time
//! - **Cycle Tracking**: event-driven state machine producing validated cycle records
//! - **Adaptive Learning**: rule engine with rate limiting, safety caps, validation and rollback
//! - **Persistence**: tolerant per-zone JSON records with debounced saves
//!
//! # Module Structure
//!
//! - `pid/` - Controller
//! - `analysis/` - Pure cycle statistics
//! - `cycle/` - Cycle tracker
//! - `learning/` - Adaptive learner
//! - `data/` - Shared types, heating-type profiles, persistence
//! - `zone` - Per-zone owner and registry
//!
//! # Example
//!
//! ```no_run
//! use tt_core::{HeatingType, Zone, ZoneConfig, ZoneRegistry};
//! use tt_protocol::{EventKind, ZoneEvent};
//!
//! let mut registry = ZoneRegistry::new();
//! registry.register(Zone::new(ZoneConfig::new("living", HeatingType::Radiator)).unwrap()).unwrap();
//!
//! let update = registry
//!     .dispatch("living", &ZoneEvent::new(0, EventKind::TemperatureSample { temp: Some(19.5) }))
//!     .unwrap();
//! ```

// Grouped modules
pub mod analysis;
pub mod cycle;
pub mod data;
pub mod learning;
pub mod pid;

// Standalone modules
pub mod constants;
pub mod zone;

// Re-export primary types from data/
pub use data::{
    minutes_between, ClassProfile, ConvergenceThresholds, CycleMetrics, CycleMode,
    DisturbanceFlags, GainChangeReason, HeatingType, IntegralDiagnostics, Interruption,
    InterruptionKind, PidGains, PidSnapshot, TemperatureSample,
};

// Re-export persistence from data/
pub use data::{JsonFileStore, ModeRecord, SaveQueue, StateStore, ValidationRecord, ZoneRecord};

// Re-export error types
pub use tt_error::{Result, ThermotuneError};

// Re-export controller types
pub use pid::{Direction, PidConfig, PidController, PidState};

// Re-export analysis types
pub use analysis::{analyze_cycle, AnalysisConfig, CycleAnalysis};

// Re-export tracker types
pub use cycle::{AbortReason, CycleState, CycleTracker, DiscardReason, TrackerConfig, TrackerOutcome};

// Re-export learner types
pub use learning::{
    AdaptiveLearner, AutoApplyDecision, BlockReason, GainAdjustment, LearningConfig, RecordResult,
    RuleKind, SafetyLimits,
};

// Re-export zone types
pub use zone::{Zone, ZoneConfig, ZoneRegistry, ZoneUpdate};
