//! Zone state persistence
//!
//! The learner serializes to a `ZoneRecord`. Storage goes through the `StateStore`
//! trait; `JsonFileStore` keeps one JSON file per zone. Saves are fire-and-forget:
//! zones hand records to a `SaveQueue`, which coalesces them per zone and releases
//! them once the debounce window has passed.

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use tt_error::{Result, ThermotuneError};

use crate::constants::persistence as persist_const;
use crate::data::{CycleMetrics, CycleMode, PidSnapshot};

/// Persisted learning state for one mode
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct ModeRecord {
    #[serde(default)]
    pub cycle_history: Vec<CycleMetrics>,
    #[serde(default)]
    pub convergence_confidence: f64,
    #[serde(default)]
    pub auto_apply_count: u32,
    #[serde(default)]
    pub pid_history: Vec<PidSnapshot>,
    #[serde(default)]
    pub consecutive_good: u32,
    #[serde(default)]
    pub auto_apply_timestamps: Vec<u64>,
    #[serde(default)]
    pub last_adjustment_ms: Option<u64>,
    #[serde(default)]
    pub cycles_at_last_adjustment: u64,
    #[serde(default)]
    pub total_cycles: u64,
    #[serde(default)]
    pub last_confidence_update_ms: Option<u64>,
    #[serde(default)]
    pub regime_cooldown_until_ms: Option<u64>,
    /// Open post-apply validation for this mode
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationRecord>,
    /// Controller integral at save time, for a bumpless restart
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integral: Option<f64>,
}

/// Progress of a validation session that was open at save time
///
/// The rollback target is not stored here; it is the snapshot preceding the
/// `AutoApply` entry stamped `started_ms` in the mode's `pid_history`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ValidationRecord {
    pub baseline_overshoot: f64,
    #[serde(default)]
    pub observed: Vec<f64>,
    pub required: usize,
    pub started_ms: u64,
}

/// Persisted state for one zone
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ZoneRecord {
    #[serde(default = "default_version")]
    pub version: u32,
    pub zone_id: String,
    #[serde(default)]
    pub heating: ModeRecord,
    #[serde(default)]
    pub cooling: ModeRecord,
}

fn default_version() -> u32 {
    persist_const::RECORD_VERSION
}

impl ZoneRecord {
    pub fn new(zone_id: impl Into<String>) -> Self {
        Self {
            version: persist_const::RECORD_VERSION,
            zone_id: zone_id.into(),
            heating: ModeRecord::default(),
            cooling: ModeRecord::default(),
        }
    }

    pub fn mode(&self, mode: CycleMode) -> &ModeRecord {
        match mode {
            CycleMode::Heat => &self.heating,
            CycleMode::Cool => &self.cooling,
        }
    }

    pub fn mode_mut(&mut self, mode: CycleMode) -> &mut ModeRecord {
        match mode {
            CycleMode::Heat => &mut self.heating,
            CycleMode::Cool => &mut self.cooling,
        }
    }

    /// Decode whatever is readable from a persisted value
    ///
    /// Never fails. Missing fields take defaults, list entries that do not parse are
    /// dropped one by one. Returns the record and the number of dropped entries.
    pub fn from_value_lossy(zone_id: &str, value: &Value) -> (Self, usize) {
        let mut record = ZoneRecord::new(zone_id);
        let Some(obj) = value.as_object() else {
            warn!(zone = zone_id, "Persisted state is not an object, starting fresh");
            return (record, 1);
        };

        if let Some(version) = obj.get("version").and_then(Value::as_u64) {
            if version as u32 != persist_const::RECORD_VERSION {
                debug!(zone = zone_id, version, "Persisted record has a different version");
            }
        }

        let mut dropped = 0;
        for (key, mode) in [("heating", CycleMode::Heat), ("cooling", CycleMode::Cool)] {
            match obj.get(key) {
                Some(Value::Object(mode_obj)) => {
                    let (decoded, lost) = decode_mode(zone_id, key, mode_obj);
                    *record.mode_mut(mode) = decoded;
                    dropped += lost;
                }
                Some(Value::Null) | None => {}
                Some(_) => {
                    warn!(zone = zone_id, mode = key, "Mode record is not an object, dropped");
                    dropped += 1;
                }
            }
        }

        (record, dropped)
    }
}

fn decode_list<T: DeserializeOwned>(zone: &str, field: &str, value: Option<&Value>) -> (Vec<T>, usize) {
    let Some(value) = value else {
        return (Vec::new(), 0);
    };
    let Some(items) = value.as_array() else {
        warn!(zone, field, "Expected a list, dropped");
        return (Vec::new(), 1);
    };

    let mut out = Vec::with_capacity(items.len());
    let mut dropped = 0;
    for (idx, item) in items.iter().enumerate() {
        match serde_json::from_value::<T>(item.clone()) {
            Ok(v) => out.push(v),
            Err(e) => {
                warn!(zone, field, index = idx, error = %e, "Dropping corrupt persisted entry");
                dropped += 1;
            }
        }
    }
    (out, dropped)
}

fn decode_mode(zone: &str, mode: &str, obj: &Map<String, Value>) -> (ModeRecord, usize) {
    let (cycle_history, lost_cycles) = decode_list(zone, "cycle_history", obj.get("cycle_history"));
    let (pid_history, lost_snapshots) = decode_list(zone, "pid_history", obj.get("pid_history"));
    let (auto_apply_timestamps, lost_ts) =
        decode_list(zone, "auto_apply_timestamps", obj.get("auto_apply_timestamps"));

    let get_u64 = |key: &str| obj.get(key).and_then(Value::as_u64);

    let confidence = obj
        .get("convergence_confidence")
        .and_then(Value::as_f64)
        .filter(|c| c.is_finite())
        .map_or(0.0, |c| c.clamp(0.0, 1.0));

    let mut lost_validation = 0;
    let validation = match obj.get("validation") {
        None | Some(Value::Null) => None,
        Some(v) => match serde_json::from_value::<ValidationRecord>(v.clone()) {
            Ok(session) if session.baseline_overshoot.is_finite() => Some(session),
            Ok(_) => {
                warn!(zone, mode, "Validation record has a non-finite baseline, dropped");
                lost_validation = 1;
                None
            }
            Err(e) => {
                warn!(zone, mode, error = %e, "Dropping corrupt validation record");
                lost_validation = 1;
                None
            }
        },
    };

    let record = ModeRecord {
        cycle_history,
        convergence_confidence: confidence,
        auto_apply_count: get_u64("auto_apply_count").map_or(0, |v| v.min(u32::MAX as u64) as u32),
        pid_history,
        consecutive_good: get_u64("consecutive_good").map_or(0, |v| v.min(u32::MAX as u64) as u32),
        auto_apply_timestamps,
        last_adjustment_ms: get_u64("last_adjustment_ms"),
        cycles_at_last_adjustment: get_u64("cycles_at_last_adjustment").unwrap_or(0),
        total_cycles: get_u64("total_cycles").unwrap_or(0),
        last_confidence_update_ms: get_u64("last_confidence_update_ms"),
        regime_cooldown_until_ms: get_u64("regime_cooldown_until_ms"),
        validation,
        integral: obj.get("integral").and_then(Value::as_f64).filter(|i| i.is_finite()),
    };

    let dropped = lost_cycles + lost_snapshots + lost_ts + lost_validation;
    if dropped > 0 {
        warn!(zone, mode, dropped, "Recovered mode record with losses");
    }
    (record, dropped)
}

// ============================================================================
// Storage
// ============================================================================

/// Load/save contract for zone records
#[cfg_attr(test, mockall::automock)]
pub trait StateStore: Send + Sync {
    /// Raw persisted value for a zone, `None` if nothing was saved yet
    fn load(&self, zone_id: &str) -> Result<Option<Value>>;

    fn save(&self, record: &ZoneRecord) -> Result<()>;
}

/// One JSON file per zone in a directory
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    /// `<data dir>/thermotune`, or `./thermotune` when there is no data dir
    pub fn default_dir() -> PathBuf {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(persist_const::STATE_DIR_NAME)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, zone_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", zone_id))
    }
}

impl StateStore for JsonFileStore {
    fn load(&self, zone_id: &str) -> Result<Option<Value>> {
        let path = self.path_for(zone_id);
        if !path.exists() {
            debug!("No state file for zone {} at {:?}", zone_id, path);
            return Ok(None);
        }

        let size = fs::metadata(&path)
            .map_err(|e| ThermotuneError::FileRead { path: path.clone(), source: e })?
            .len();
        if size > persist_const::MAX_STATE_FILE_SIZE {
            return Err(ThermotuneError::FileTooLarge {
                path,
                size,
                max_size: persist_const::MAX_STATE_FILE_SIZE,
            });
        }

        let contents = fs::read_to_string(&path)
            .map_err(|e| ThermotuneError::FileRead { path: path.clone(), source: e })?;
        let value = serde_json::from_str(&contents)
            .map_err(|e| ThermotuneError::corrupt_state(zone_id, e.to_string()))?;

        info!("Loaded state for zone {} from {:?}", zone_id, path);
        Ok(Some(value))
    }

    fn save(&self, record: &ZoneRecord) -> Result<()> {
        fs::create_dir_all(&self.dir)
            .map_err(|e| ThermotuneError::FileWrite { path: self.dir.clone(), source: e })?;

        let path = self.path_for(&record.zone_id);
        let json = serde_json::to_string_pretty(record)?;

        // Atomic write: temp file then rename
        let temp_path = path.with_extension("json.tmp");
        let mut file = fs::File::create(&temp_path)
            .map_err(|e| ThermotuneError::FileWrite { path: temp_path.clone(), source: e })?;
        file.write_all(json.as_bytes())
            .map_err(|e| ThermotuneError::FileWrite { path: temp_path.clone(), source: e })?;
        file.sync_all()
            .map_err(|e| ThermotuneError::FileWrite { path: temp_path.clone(), source: e })?;
        drop(file);

        fs::rename(&temp_path, &path)
            .map_err(|e| ThermotuneError::FileWrite { path: path.clone(), source: e })?;

        debug!("Saved state for zone {} to {:?}", record.zone_id, path);
        Ok(())
    }
}

// ============================================================================
// Save queue
// ============================================================================

#[derive(Debug)]
struct PendingSave {
    record: ZoneRecord,
    first_queued_ms: u64,
}

/// Debounced, per-zone coalescing save queue
///
/// The newest record for a zone replaces any queued one; the debounce window runs
/// from the first queueing so a busy zone still gets written.
#[derive(Debug)]
pub struct SaveQueue {
    pending: Mutex<HashMap<String, PendingSave>>,
    debounce_ms: u64,
}

impl Default for SaveQueue {
    fn default() -> Self {
        Self::new(persist_const::SAVE_DEBOUNCE_MS)
    }
}

impl SaveQueue {
    pub fn new(debounce_ms: u64) -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
            debounce_ms,
        }
    }

    pub fn enqueue(&self, record: ZoneRecord, now_ms: u64) {
        let mut pending = self.pending.lock();
        match pending.get_mut(&record.zone_id) {
            Some(slot) => slot.record = record,
            None => {
                pending.insert(
                    record.zone_id.clone(),
                    PendingSave {
                        record,
                        first_queued_ms: now_ms,
                    },
                );
            }
        }
    }

    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }

    /// Remove and return records whose debounce window has elapsed
    pub fn drain_due(&self, now_ms: u64) -> Vec<ZoneRecord> {
        let mut pending = self.pending.lock();
        let due: Vec<String> = pending
            .iter()
            .filter(|(_, p)| now_ms.saturating_sub(p.first_queued_ms) >= self.debounce_ms)
            .map(|(zone, _)| zone.clone())
            .collect();
        due.into_iter()
            .filter_map(|zone| pending.remove(&zone))
            .map(|p| p.record)
            .collect()
    }

    /// Remove and return everything, e.g. on shutdown
    pub fn drain_all(&self) -> Vec<ZoneRecord> {
        self.pending.lock().drain().map(|(_, p)| p.record).collect()
    }

    /// Write due records to `store`; failures are logged and dropped
    pub fn flush_due(&self, store: &dyn StateStore, now_ms: u64) -> usize {
        write_all(store, self.drain_due(now_ms))
    }

    pub fn flush_all(&self, store: &dyn StateStore) -> usize {
        write_all(store, self.drain_all())
    }
}

fn write_all(store: &dyn StateStore, records: Vec<ZoneRecord>) -> usize {
    let mut saved = 0;
    for record in records {
        match store.save(&record) {
            Ok(()) => saved += 1,
            Err(e) => warn!(zone = %record.zone_id, error = %e, "Failed to save zone state"),
        }
    }
    saved
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn record_with_history(zone: &str) -> ZoneRecord {
        let mut record = ZoneRecord::new(zone);
        let cycle: CycleMetrics = serde_json::from_str(
            r#"{"mode":"heat","start_ms":0,"start_temp":19.0,"target_temp":20.0,"duration_minutes":30}"#,
        )
        .unwrap();
        record.heating.cycle_history.push(cycle);
        record.heating.convergence_confidence = 0.4;
        record.heating.auto_apply_count = 2;
        record
    }

    #[test]
    fn test_file_store_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let record = record_with_history("living");

        store.save(&record).unwrap();
        let value = store.load("living").unwrap().unwrap();
        let (loaded, dropped) = ZoneRecord::from_value_lossy("living", &value);

        assert_eq!(dropped, 0);
        assert_eq!(loaded, record);
        assert!(!store.path_for("living").with_extension("json.tmp").exists());
    }

    #[test]
    fn test_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        assert!(store.load("nowhere").unwrap().is_none());
    }

    #[test]
    fn test_unparseable_file_is_corrupt_state() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        fs::write(store.path_for("bad"), "{ not json").unwrap();
        assert!(matches!(store.load("bad"), Err(ThermotuneError::CorruptState { .. })));
    }

    #[test]
    fn test_lossy_decode_drops_bad_entries() {
        let value = json!({
            "zone_id": "office",
            "heating": {
                "cycle_history": [
                    {"mode": "heat", "start_ms": 0, "start_temp": 19.0, "target_temp": 20.0, "duration_minutes": 30},
                    {"mode": "sideways"},
                    "garbage"
                ],
                "convergence_confidence": 3.5,
                "pid_history": [{"kp": 30, "ki": 1.5, "kd": 30}]
            },
            "cooling": 17
        });
        let (record, dropped) = ZoneRecord::from_value_lossy("office", &value);
        assert_eq!(record.heating.cycle_history.len(), 1);
        assert_eq!(record.heating.convergence_confidence, 1.0);
        assert_eq!(record.heating.pid_history.len(), 1);
        assert_eq!(dropped, 3);
    }

    #[test]
    fn test_validation_and_integral_survive_round_trip() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path());
        let mut record = record_with_history("hall");
        record.heating.integral = Some(12.5);
        record.heating.validation = Some(ValidationRecord {
            baseline_overshoot: 0.3,
            observed: vec![0.2],
            required: 5,
            started_ms: 7_200_000,
        });

        store.save(&record).unwrap();
        let value = store.load("hall").unwrap().unwrap();
        assert!(value["cooling"].get("validation").is_none());

        let (loaded, dropped) = ZoneRecord::from_value_lossy("hall", &value);
        assert_eq!(dropped, 0);
        assert_eq!(loaded, record);
    }

    #[test]
    fn test_corrupt_validation_record_is_dropped() {
        let value = json!({
            "zone_id": "hall",
            "heating": {
                "validation": {"baseline_overshoot": "high"},
                "integral": "NaN"
            }
        });
        let (record, dropped) = ZoneRecord::from_value_lossy("hall", &value);
        assert!(record.heating.validation.is_none());
        assert!(record.heating.integral.is_none());
        assert_eq!(dropped, 1);
    }

    #[test]
    fn test_lossy_decode_of_non_object() {
        let (record, _) = ZoneRecord::from_value_lossy("x", &json!([1, 2, 3]));
        assert!(record.heating.cycle_history.is_empty());
        assert_eq!(record.version, persist_const::RECORD_VERSION);
    }

    #[test]
    fn test_save_queue_coalesces_and_debounces() {
        let queue = SaveQueue::new(5000);
        let mut first = ZoneRecord::new("a");
        first.heating.auto_apply_count = 1;
        let mut second = ZoneRecord::new("a");
        second.heating.auto_apply_count = 2;

        queue.enqueue(first, 0);
        queue.enqueue(second, 3000);
        queue.enqueue(ZoneRecord::new("b"), 4000);
        assert_eq!(queue.len(), 2);

        let due = queue.drain_due(5000);
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].heating.auto_apply_count, 2);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_flush_logs_and_drops_failures() {
        let mut store = MockStateStore::new();
        store
            .expect_save()
            .times(2)
            .returning(|record| {
                if record.zone_id == "ok" {
                    Ok(())
                } else {
                    Err(ThermotuneError::generic("disk full"))
                }
            });

        let queue = SaveQueue::new(0);
        queue.enqueue(ZoneRecord::new("ok"), 0);
        queue.enqueue(ZoneRecord::new("broken"), 0);
        assert_eq!(queue.flush_all(&store), 1);
        assert!(queue.is_empty());
    }
}
