//! Cycle tracking
//!
//! Event-driven state machine producing validated cycle records.

mod tracker;

pub use tracker::{
    AbortReason, CycleState, CycleTracker, DiscardReason, TrackerConfig, TrackerOutcome,
};
