//! Whole-zone scenarios driven through the event interface

use tt_core::{
    AbortReason, BlockReason, CycleMode, CycleState, DiscardReason, HeatingType, JsonFileStore,
    StateStore, TrackerOutcome, Zone, ZoneConfig, ZoneUpdate,
};
use tt_protocol::{decode_envelope, EventKind, GraceReason, HvacMode, LearningStatus, ZoneEvent};

const MIN: u64 = 60_000;

fn ev(ms: u64, kind: EventKind) -> ZoneEvent {
    ZoneEvent::new(ms, kind)
}

fn sample(ms: u64, temp: f64) -> ZoneEvent {
    ev(ms, EventKind::TemperatureSample { temp: Some(temp) })
}

fn heating_zone(config: ZoneConfig) -> Zone {
    let mut zone = Zone::new(config).unwrap();
    zone.handle_event(&ev(0, EventKind::ModeChanged { mode: HvacMode::Heat }));
    zone.handle_event(&ev(0, EventKind::SetpointChanged { target: 20.0 }));
    zone
}

/// One 45-minute heating cycle against a 20.0 target peaking at `peak`
///
/// Rises in 3-minute steps, the device switches off at the peak, then two swings
/// of ±0.15 before the temperature settles.
fn run_cycle(zone: &mut Zone, start: u64, peak: f64) -> Vec<ZoneUpdate> {
    let rise = [19.15, 19.3, 19.45, 19.6, 19.75, 19.9, 20.05, 20.2_f64.min(peak)];
    let settle = [20.15, 19.85, 20.15, 20.0, 20.0, 20.02];

    let mut updates = vec![
        zone.handle_event(&sample(start, 19.0)),
        zone.handle_event(&ev(start, EventKind::DeviceActivated)),
    ];
    for (i, temp) in rise.iter().enumerate() {
        updates.push(zone.handle_event(&sample(start + (i as u64 + 1) * 3 * MIN, *temp)));
    }
    let off = start + 27 * MIN;
    updates.push(zone.handle_event(&sample(off, peak)));
    updates.push(zone.handle_event(&ev(off, EventKind::DeviceDeactivated)));
    for (i, temp) in settle.iter().enumerate() {
        updates.push(zone.handle_event(&sample(off + (i as u64 + 1) * 3 * MIN, *temp)));
    }
    updates
}

fn cycle_start(n: u64) -> u64 {
    n * 120 * MIN
}

#[test]
fn test_forty_five_minute_cycle_is_recorded() {
    let mut zone = heating_zone(ZoneConfig::new("living", HeatingType::Radiator));
    let updates = run_cycle(&mut zone, 0, 20.3);

    let recorded: Vec<_> = updates.iter().flat_map(|u| u.recorded().cloned()).collect();
    assert_eq!(recorded.len(), 1);
    let metrics = &recorded[0];

    assert_eq!(metrics.mode, CycleMode::Heat);
    assert!((metrics.duration_minutes - 45.0).abs() < 1e-9);
    assert!((metrics.overshoot.unwrap() - 0.3).abs() < 1e-6);
    assert_eq!(metrics.oscillations, 2);
    assert!(metrics.settling_time.unwrap() > 0.0);
    assert!(!metrics.timed_out);

    assert_eq!(zone.tracker().state(), CycleState::Idle);
    assert_eq!(zone.learner().history(CycleMode::Heat).len(), 1);
    assert!(updates.last().unwrap().dirty);
}

#[test]
fn test_short_cycle_is_not_recorded() {
    let mut zone = heating_zone(ZoneConfig::new("bath", HeatingType::Radiator));
    zone.handle_event(&sample(0, 19.0));
    zone.handle_event(&ev(0, EventKind::DeviceActivated));
    zone.handle_event(&sample(MIN, 19.2));
    zone.handle_event(&ev(2 * MIN, EventKind::DeviceDeactivated));

    // Reactivation closes the previous cycle after five minutes
    let update = zone.handle_event(&ev(5 * MIN, EventKind::DeviceActivated));
    assert!(matches!(
        update.outcomes[0],
        TrackerOutcome::Discarded { reason: DiscardReason::TooShort { .. }, .. }
    ));
    assert!(zone.learner().history(CycleMode::Heat).is_empty());
}

#[test]
fn test_contact_open_aborts_without_metrics() {
    let mut zone = heating_zone(ZoneConfig::new("hall", HeatingType::Radiator));
    zone.handle_event(&sample(0, 19.0));
    zone.handle_event(&ev(0, EventKind::DeviceActivated));
    zone.handle_event(&sample(3 * MIN, 19.3));
    zone.handle_event(&ev(4 * MIN, EventKind::ContactPaused));

    let update = zone.handle_event(&ev(7 * MIN, EventKind::Tick));
    assert!(matches!(
        update.outcomes[..],
        [TrackerOutcome::Aborted { reason: AbortReason::ContactOpen, .. }]
    ));
    assert_eq!(zone.tracker().state(), CycleState::Idle);
    assert_eq!(update.recorded().count(), 0);
    assert!(zone.learner().history(CycleMode::Heat).is_empty());
}

#[test]
fn test_recommendation_then_rate_limit() {
    let mut zone = heating_zone(ZoneConfig::new("study", HeatingType::Radiator));

    for n in 0..3 {
        run_cycle(&mut zone, cycle_start(n), 20.6);
    }
    assert!(zone.recommendation().is_none());

    let updates = run_cycle(&mut zone, cycle_start(3), 20.6);
    assert!(updates.iter().any(|u| u.recommendation.is_some()));
    assert_eq!(zone.status().learning_status, LearningStatus::Ready);

    let before = zone.controller().gains();
    let now = cycle_start(3) + 50 * MIN;
    let gains = zone.accept_recommendation(now).unwrap();
    assert!(gains.kp < before.kp);
    assert_eq!(zone.controller().gains(), gains);

    let updates = run_cycle(&mut zone, cycle_start(4), 20.6);
    let blocked = updates.iter().find_map(|u| u.blocked).unwrap();
    assert!(matches!(blocked, BlockReason::RateLimited { cycles_since: 1, .. }));
    assert!(zone.status().last_blocked_reason.unwrap().contains("rate limited"));
    assert_eq!(zone.controller().gains(), gains);
}

#[test]
fn test_lifetime_cap_blocks_further_auto_applies() {
    let mut config = ZoneConfig::new("loft", HeatingType::Radiator).with_auto_apply(true);
    config.learning.safety.max_lifetime_auto_applies = 1;
    config.learning.safety.validation_cycles = 1;
    let mut zone = heating_zone(config);

    let mut applied = 0;
    for n in 0..4 {
        applied += run_cycle(&mut zone, cycle_start(n), 20.6)
            .iter()
            .filter(|u| u.applied.is_some())
            .count();
    }
    assert_eq!(applied, 1);
    assert!(!zone.controller().should_apply_decay());

    let updates = run_cycle(&mut zone, cycle_start(4), 20.6);
    assert!(updates.iter().all(|u| u.applied.is_none()));
    let blocked = updates.iter().find_map(|u| u.blocked).unwrap();
    assert_eq!(blocked, BlockReason::LifetimeCap { count: 1, cap: 1 });
}

#[test]
fn test_degraded_validation_rolls_back() {
    let config = ZoneConfig::new("nursery", HeatingType::Radiator).with_auto_apply(true);
    let baseline = config.profile().baseline_gains;
    let mut zone = heating_zone(config);

    for n in 0..4 {
        run_cycle(&mut zone, cycle_start(n), 20.6);
    }
    assert_ne!(zone.controller().gains(), baseline);
    assert_eq!(zone.status().learning_status, LearningStatus::Active);

    let mut rollback = None;
    for n in 4..9 {
        for update in run_cycle(&mut zone, cycle_start(n), 21.0) {
            if update.blocked.is_some() {
                assert_eq!(update.blocked, Some(BlockReason::ValidationInProgress));
            }
            rollback = rollback.or(update.rollback);
        }
    }

    assert_eq!(rollback, Some(baseline));
    assert_eq!(zone.controller().gains(), baseline);
    assert_eq!(zone.learner().gains(CycleMode::Heat), baseline);
    assert!(zone.learner().validation().is_none());
    assert!(!zone.status().warnings.is_empty());
}

#[test]
fn test_state_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::new(dir.path());

    let config = ZoneConfig::new("garage", HeatingType::Radiator).with_auto_apply(true);
    let baseline = config.profile().baseline_gains;
    let mut zone = heating_zone(config.clone());
    for n in 0..4 {
        run_cycle(&mut zone, cycle_start(n), 20.6);
    }
    store.save(&zone.to_record()).unwrap();

    let value = store.load("garage").unwrap().unwrap();
    let mut restored = Zone::new(config).unwrap();
    assert_eq!(restored.restore(&value), 0);

    assert_eq!(restored.controller().gains(), zone.controller().gains());
    assert_eq!(restored.learner().history(CycleMode::Heat).len(), 4);
    assert_eq!(
        restored.learner().convergence(CycleMode::Heat).auto_apply_count,
        zone.learner().convergence(CycleMode::Heat).auto_apply_count
    );
    assert!(!restored.controller().should_apply_decay());

    // The open validation session continues against the same rollback target
    assert_eq!(restored.status().learning_status, LearningStatus::Active);
    let before = zone.learner().validation().unwrap();
    let after = restored.learner().validation().unwrap();
    assert_eq!(after.started_ms, before.started_ms);
    assert_eq!(after.observed.len(), before.observed.len());
    assert_eq!(after.pre_apply.gains(), baseline);

    // The first cycle after a restart falls inside the restart grace window
    let restart = cycle_start(10);
    restored.handle_event(&ev(restart, EventKind::ModeChanged { mode: HvacMode::Heat }));
    restored.handle_event(&ev(restart, EventKind::SetpointChanged { target: 20.0 }));
    let updates = run_cycle(&mut restored, restart, 20.3);
    assert!(updates.iter().flat_map(|u| u.outcomes.iter()).any(|o| matches!(
        o,
        TrackerOutcome::Discarded { reason: DiscardReason::GraceWindow(GraceReason::Restart), .. }
    )));
    assert_eq!(restored.learner().history(CycleMode::Heat).len(), 4);
}

#[test]
fn test_integral_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let store = JsonFileStore::new(dir.path());

    let config = ZoneConfig::new("porch", HeatingType::Radiator);
    let mut zone = heating_zone(config.clone());
    for m in 0..10 {
        zone.handle_event(&sample(m * MIN, 18.0));
    }
    let integral = zone.controller().state().integral;
    assert!(integral > 0.0);

    let record = zone.to_record();
    assert_eq!(record.heating.integral, Some(integral));
    assert!(record.cooling.integral.is_none());
    store.save(&record).unwrap();

    let mut restored = Zone::new(config).unwrap();
    assert_eq!(restored.controller().state().integral, 0.0);
    assert_eq!(restored.restore(&store.load("porch").unwrap().unwrap()), 0);
    assert!((restored.controller().state().integral - integral).abs() < 1e-9);
}

#[test]
fn test_disturbed_cycle_kept_but_not_learned() {
    let mut zone = heating_zone(ZoneConfig::new("conservatory", HeatingType::Radiator));
    zone.handle_event(&ev(0, EventKind::SolarGain { high: true }));
    let updates = run_cycle(&mut zone, 0, 20.3);

    let recorded: Vec<_> = updates.iter().flat_map(|u| u.recorded().cloned()).collect();
    assert_eq!(recorded.len(), 1);
    assert!(recorded[0].disturbances.solar_gain);

    let history = zone.learner().history(CycleMode::Heat);
    assert_eq!(history.len(), 1);
    assert_eq!(history.eligible_count(), 0);
    assert_eq!(zone.learner().convergence(CycleMode::Heat).consecutive_good, 0);
}

#[test]
fn test_timestamps_near_max_do_not_panic() {
    let mut zone = Zone::new(ZoneConfig::new("attic", HeatingType::Radiator)).unwrap();
    let value = serde_json::to_value(zone.to_record()).unwrap();
    zone.restore(&value);

    let ts = u64::MAX - 10;
    let events = [
        (ts, r#""event":"mode_changed","data":{"mode":"heat"}"#),
        (ts, r#""event":"setpoint_changed","data":{"target":20.0}"#),
        (ts, r#""event":"temperature_sample","data":{"temp":19.0}"#),
        (ts, r#""event":"device_activated""#),
        (ts + 1, r#""event":"temperature_sample","data":{"temp":19.1}"#),
        (ts + 2, r#""event":"device_deactivated""#),
        (ts + 3, r#""event":"tick""#),
    ];
    for (timestamp, body) in events {
        let line = format!(r#"{{"zone":"attic","timestamp_ms":{},{}}}"#, timestamp, body);
        let envelope = decode_envelope(&line).unwrap();
        zone.handle_event(&envelope.event());
    }

    assert_eq!(zone.tracker().state(), CycleState::Settling);
    assert_eq!(zone.tracker().settling_deadline_ms(), Some(u64::MAX));
}
