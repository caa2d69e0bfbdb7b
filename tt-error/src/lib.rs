//! Unified error handling for Thermotune
//!
//! This crate provides a single error type used across all Thermotune components.
//! It uses thiserror for ergonomic error definitions with proper Display and Error trait impls.
//!
//! The numeric control paths (PID, cycle analysis, learning) never return errors;
//! only the fallible boundaries do: persistence, zone registration, configuration
//! loading and event decoding.

use std::io;
use std::path::PathBuf;

/// Result type alias using ThermotuneError
pub type Result<T> = std::result::Result<T, ThermotuneError>;

/// Unified error type for all Thermotune operations
#[derive(thiserror::Error, Debug)]
pub enum ThermotuneError {
    // ============================================================================
    // I/O and File System Errors
    // ============================================================================
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("Failed to read file {path}: {source}")]
    FileRead {
        path: PathBuf,
        source: io::Error,
    },

    #[error("Failed to write file {path}: {source}")]
    FileWrite {
        path: PathBuf,
        source: io::Error,
    },

    #[error("File too large: {path} ({size} bytes, max {max_size} bytes)")]
    FileTooLarge {
        path: PathBuf,
        size: u64,
        max_size: u64,
    },

    // ============================================================================
    // Configuration Errors
    // ============================================================================
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Failed to parse JSON: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("Invalid configuration value for {field}: {reason}")]
    InvalidConfig {
        field: String,
        reason: String,
    },

    // ============================================================================
    // Zone and Event Errors
    // ============================================================================
    #[error("Unknown zone: {0}")]
    UnknownZone(String),

    #[error("Zone already registered: {0}")]
    DuplicateZone(String),

    #[error("Invalid zone id: {0}")]
    InvalidZoneId(String),

    #[error("Invalid event: {0}")]
    InvalidEvent(String),

    #[error("Message too large: {size} bytes (max {max_size} bytes)")]
    MessageTooLarge {
        size: usize,
        max_size: usize,
    },

    // ============================================================================
    // Persistence Errors
    // ============================================================================
    #[error("Persisted state for zone {zone} is unreadable: {reason}")]
    CorruptState {
        zone: String,
        reason: String,
    },

    // ============================================================================
    // Generic Errors
    // ============================================================================
    #[error("{0}")]
    Generic(String),
}

impl ThermotuneError {
    /// Create a generic error from a string
    pub fn generic(msg: impl Into<String>) -> Self {
        Self::Generic(msg.into())
    }

    /// Create a config error from a string
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    /// Create an invalid config value error
    pub fn invalid_config(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            field: field.into(),
            reason: reason.into(),
        }
    }

    /// Create a corrupt state error for a zone
    pub fn corrupt_state(zone: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::CorruptState {
            zone: zone.into(),
            reason: reason.into(),
        }
    }
}

// Allow converting from String to ThermotuneError
impl From<String> for ThermotuneError {
    fn from(s: String) -> Self {
        Self::Generic(s)
    }
}

// Allow converting from &str to ThermotuneError
impl From<&str> for ThermotuneError {
    fn from(s: &str) -> Self {
        Self::Generic(s.to_string())
    }
}
