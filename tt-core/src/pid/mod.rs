//! PID control
//!
//! Contains the zone controller and its configuration.

mod controller;

pub use controller::{Direction, PidConfig, PidController, PidState};
