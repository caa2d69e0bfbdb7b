use serde::{Deserialize, Serialize};

/// Maximum size of a single encoded event (8KB)
pub const MAX_MESSAGE_SIZE: usize = 8 * 1024;

/// Maximum zone identifier length
const MAX_ZONE_ID_LENGTH: usize = 64;

/// Plausible sensor range in °C; readings outside are treated as sensor faults
pub const MIN_PLAUSIBLE_TEMP: f64 = -50.0;
pub const MAX_PLAUSIBLE_TEMP: f64 = 100.0;

/// Accepted setpoint range in °C
pub const MIN_SETPOINT: f64 = 0.0;
pub const MAX_SETPOINT: f64 = 45.0;

/// HVAC operating mode reported by the host
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum HvacMode {
    Heat,
    Cool,
    Off,
}

impl HvacMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            HvacMode::Heat => "heat",
            HvacMode::Cool => "cool",
            HvacMode::Off => "off",
        }
    }
}

/// Why the host asks the core to ignore cycles for a while
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum GraceReason {
    Restart,
    Vacation,
    Setback,
}

/// A timestamped event for one zone
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ZoneEvent {
    /// Milliseconds since Unix epoch
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl ZoneEvent {
    pub fn new(timestamp_ms: u64, kind: EventKind) -> Self {
        Self { timestamp_ms, kind }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event", content = "data", rename_all = "snake_case")]
pub enum EventKind {
    /// Heating/cooling demand went false -> true
    DeviceActivated,
    /// Heating/cooling demand went true -> false
    DeviceDeactivated,
    /// Duty-cycling logic reports the active phase is over
    SettlingStarted,
    /// Zone temperature reading; `None` when the sensor is unavailable
    TemperatureSample { temp: Option<f64> },
    SetpointChanged { target: f64 },
    ModeChanged { mode: HvacMode },
    /// Window/door contact opened
    ContactPaused,
    ContactResumed,
    OutdoorConditions { temp: Option<f64>, wind_speed: Option<f64> },
    SolarGain { high: bool },
    /// Fraction of zones (0..1) currently demanding heat, computed by the host
    ZoneDemandShare { active_fraction: f64 },
    GraceWindow { until_ms: u64, reason: GraceReason },
    /// Precomputed compensation subtracted from the controller output
    Feedforward { value: f64 },
    /// Operator sets gains directly
    ManualGains { kp: f64, ki: f64, kd: f64, ke: Option<f64> },
    /// Operator wipes learned state for the active mode
    ResetLearning,
    /// Periodic wall-clock tick used for deadlines
    Tick,
}

impl EventKind {
    /// Validate event payload before it reaches a zone
    pub fn validate(&self) -> Result<(), String> {
        match self {
            EventKind::DeviceActivated
            | EventKind::DeviceDeactivated
            | EventKind::SettlingStarted
            | EventKind::ModeChanged { .. }
            | EventKind::ContactPaused
            | EventKind::ContactResumed
            | EventKind::SolarGain { .. }
            | EventKind::GraceWindow { .. }
            | EventKind::ResetLearning
            | EventKind::Tick => Ok(()),

            // Missing or implausible readings are dropped by the tracker, not rejected here
            EventKind::TemperatureSample { .. } => Ok(()),

            EventKind::SetpointChanged { target } => validate_setpoint(*target),

            EventKind::OutdoorConditions { temp, wind_speed } => {
                if let Some(t) = temp {
                    validate_temperature(*t)?;
                }
                if let Some(w) = wind_speed {
                    if !w.is_finite() || *w < 0.0 {
                        return Err(format!("Invalid wind speed: {}", w));
                    }
                }
                Ok(())
            }

            EventKind::ZoneDemandShare { active_fraction } => {
                if !active_fraction.is_finite() || !(0.0..=1.0).contains(active_fraction) {
                    return Err(format!("Demand share must be 0.0-1.0, got {}", active_fraction));
                }
                Ok(())
            }

            EventKind::Feedforward { value } => {
                if !value.is_finite() {
                    return Err("Feedforward must be finite".into());
                }
                Ok(())
            }

            EventKind::ManualGains { kp, ki, kd, ke } => {
                validate_gain("kp", *kp)?;
                validate_gain("ki", *ki)?;
                validate_gain("kd", *kd)?;
                if let Some(ke) = ke {
                    validate_gain("ke", *ke)?;
                }
                Ok(())
            }
        }
    }

    pub fn type_name(&self) -> &'static str {
        match self {
            EventKind::DeviceActivated => "DeviceActivated",
            EventKind::DeviceDeactivated => "DeviceDeactivated",
            EventKind::SettlingStarted => "SettlingStarted",
            EventKind::TemperatureSample { .. } => "TemperatureSample",
            EventKind::SetpointChanged { .. } => "SetpointChanged",
            EventKind::ModeChanged { .. } => "ModeChanged",
            EventKind::ContactPaused => "ContactPaused",
            EventKind::ContactResumed => "ContactResumed",
            EventKind::OutdoorConditions { .. } => "OutdoorConditions",
            EventKind::SolarGain { .. } => "SolarGain",
            EventKind::ZoneDemandShare { .. } => "ZoneDemandShare",
            EventKind::GraceWindow { .. } => "GraceWindow",
            EventKind::Feedforward { .. } => "Feedforward",
            EventKind::ManualGains { .. } => "ManualGains",
            EventKind::ResetLearning => "ResetLearning",
            EventKind::Tick => "Tick",
        }
    }
}

/// An event addressed to a zone, as read from the host event stream
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneEnvelope {
    pub zone: String,
    pub timestamp_ms: u64,
    #[serde(flatten)]
    pub kind: EventKind,
}

impl ZoneEnvelope {
    pub fn new(zone: impl Into<String>, event: ZoneEvent) -> Self {
        Self {
            zone: zone.into(),
            timestamp_ms: event.timestamp_ms,
            kind: event.kind,
        }
    }

    pub fn event(&self) -> ZoneEvent {
        ZoneEvent::new(self.timestamp_ms, self.kind.clone())
    }

    pub fn validate(&self) -> Result<(), String> {
        validate_zone_id(&self.zone)?;
        self.kind.validate()
    }
}

/// Decode and validate a single JSON-encoded envelope
pub fn decode_envelope(line: &str) -> Result<ZoneEnvelope, String> {
    if line.len() > MAX_MESSAGE_SIZE {
        return Err(format!(
            "Message too large: {} > {} bytes",
            line.len(),
            MAX_MESSAGE_SIZE
        ));
    }

    let envelope: ZoneEnvelope =
        serde_json::from_str(line).map_err(|e| format!("Malformed event: {}", e))?;
    envelope.validate()?;
    Ok(envelope)
}

/// Learning progress exposed to the host
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum LearningStatus {
    /// Not enough cycles yet
    Collecting,
    /// Enough history to propose adjustments
    Ready,
    /// An adjustment was applied and is being validated
    Active,
    Converged,
}

/// Per-zone status snapshot for display/telemetry
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ZoneStatusReport {
    pub zone: String,
    pub mode: HvacMode,
    pub cycle_state: String,
    pub learning_status: LearningStatus,
    pub convergence_confidence_pct: u8,
    pub kp: f64,
    pub ki: f64,
    pub kd: f64,
    pub ke: f64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_blocked_reason: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

pub fn validate_zone_id(zone: &str) -> Result<(), String> {
    if zone.is_empty() {
        return Err("Zone id cannot be empty".into());
    }

    if zone.len() > MAX_ZONE_ID_LENGTH {
        return Err(format!(
            "Zone id too long: {} > {} chars",
            zone.len(),
            MAX_ZONE_ID_LENGTH
        ));
    }

    for c in zone.chars() {
        if !c.is_ascii_alphanumeric() && c != '-' && c != '_' && c != '.' {
            return Err(format!("Zone id contains invalid character: {:?}", c));
        }
    }

    Ok(())
}

pub fn validate_temperature(temp: f64) -> Result<(), String> {
    if !temp.is_finite() {
        return Err("Temperature must be finite".into());
    }
    if !(MIN_PLAUSIBLE_TEMP..=MAX_PLAUSIBLE_TEMP).contains(&temp) {
        return Err(format!(
            "Temperature {:.1}°C outside plausible range ({}..{})",
            temp, MIN_PLAUSIBLE_TEMP, MAX_PLAUSIBLE_TEMP
        ));
    }
    Ok(())
}

pub fn validate_setpoint(target: f64) -> Result<(), String> {
    if !target.is_finite() {
        return Err("Setpoint must be finite".into());
    }
    if !(MIN_SETPOINT..=MAX_SETPOINT).contains(&target) {
        return Err(format!(
            "Setpoint {:.1}°C outside accepted range ({}..{})",
            target, MIN_SETPOINT, MAX_SETPOINT
        ));
    }
    Ok(())
}

fn validate_gain(name: &str, value: f64) -> Result<(), String> {
    if !value.is_finite() || value < 0.0 {
        return Err(format!("Gain {} must be finite and non-negative, got {}", name, value));
    }
    Ok(())
}
