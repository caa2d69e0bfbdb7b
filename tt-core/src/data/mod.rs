//! Data types, heating-type profiles and persistence
//!
//! Contains the records shared by the controller, tracker and learner.

mod persistence;
mod profile;
mod types;

pub use persistence::{JsonFileStore, ModeRecord, SaveQueue, StateStore, ValidationRecord, ZoneRecord};
#[cfg(test)]
pub use persistence::MockStateStore;
pub use profile::{ClassProfile, ConvergenceThresholds, HeatingType};
pub use types::{
    minutes_between, CycleMetrics, CycleMode, DisturbanceFlags, GainChangeReason,
    IntegralDiagnostics, Interruption, InterruptionKind, PidGains, PidSnapshot,
    TemperatureSample,
};
