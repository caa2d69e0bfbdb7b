//! Event loop, ticker and state flushing
//!
//! Events arrive as JSON lines (one `ZoneEnvelope` each). Every line that changes a
//! zone produces one `ZoneStatusReport` JSON line on the output. Persistence goes
//! through the debounced `SaveQueue`, with the blocking file writes moved off the
//! async executor.

use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{watch, Mutex};
use tracing::{debug, info, warn};
use tt_core::{SaveQueue, StateStore, Zone, ZoneConfig, ZoneRegistry, ZoneUpdate};
use tt_error::{Result, ThermotuneError};
use tt_protocol::{decode_envelope, EventKind, ZoneEvent, ZoneStatusReport, MAX_MESSAGE_SIZE};

/// Wall-clock milliseconds since the Unix epoch
pub fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_else(|e| {
            warn!("System clock is before Unix epoch: {}", e);
            0
        })
}

/// Build the registry from config, restoring persisted state per zone
///
/// A zone whose state file is unreadable starts fresh; a bad zone config is fatal.
pub fn build_registry(configs: &[ZoneConfig], store: &dyn StateStore) -> Result<ZoneRegistry> {
    let mut registry = ZoneRegistry::new();
    for config in configs {
        let mut zone = Zone::new(config.clone())?;
        match store.load(&config.id) {
            Ok(Some(value)) => {
                let dropped = zone.restore(&value);
                info!(zone = %config.id, dropped, "Restored zone state");
            }
            Ok(None) => debug!(zone = %config.id, "No saved state"),
            Err(e) => warn!(zone = %config.id, error = %e, "Ignoring unreadable zone state"),
        }
        registry.register(zone)?;
    }
    Ok(registry)
}

fn is_notable(update: &ZoneUpdate) -> bool {
    update.dirty
        || update.output.is_some()
        || !update.outcomes.is_empty()
        || update.applied.is_some()
        || update.recommendation.is_some()
        || update.blocked.is_some()
        || update.rollback.is_some()
}

struct Inner {
    registry: ZoneRegistry,
    /// Latest event timestamp and when it arrived, for ticks on the event clock
    clock: Option<(u64, Instant)>,
}

/// Shared daemon state
pub struct Daemon {
    inner: Mutex<Inner>,
    saves: SaveQueue,
    store: Arc<dyn StateStore>,
}

impl Daemon {
    pub fn new(registry: ZoneRegistry, store: Arc<dyn StateStore>, save_debounce_ms: u64) -> Self {
        Self {
            inner: Mutex::new(Inner { registry, clock: None }),
            saves: SaveQueue::new(save_debounce_ms),
            store,
        }
    }

    /// Apply one encoded event; returns the zone status when something changed
    pub async fn handle_line(&self, line: &str) -> Result<Option<ZoneStatusReport>> {
        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ThermotuneError::MessageTooLarge {
                size: line.len(),
                max_size: MAX_MESSAGE_SIZE,
            });
        }
        let envelope = decode_envelope(line).map_err(ThermotuneError::InvalidEvent)?;
        let event = envelope.event();

        let mut inner = self.inner.lock().await;
        let update = inner.registry.dispatch(&envelope.zone, &event)?;
        let newest = inner.clock.map_or(true, |(ts, _)| event.timestamp_ms >= ts);
        if newest {
            inner.clock = Some((event.timestamp_ms, Instant::now()));
        }

        let Some(zone) = inner.registry.get(&envelope.zone) else {
            return Ok(None);
        };
        if update.dirty {
            self.saves.enqueue(zone.to_record(), now_ms());
        }
        if let Some(adj) = &update.applied {
            info!(zone = %envelope.zone, "{}", adj.describe());
        }
        Ok(is_notable(&update).then(|| zone.status()))
    }

    /// Deliver a `Tick` to every zone
    ///
    /// The tick timestamp follows the event clock: the last event time plus the
    /// wall time elapsed since it arrived.
    pub async fn tick(&self) -> Vec<ZoneStatusReport> {
        let mut inner = self.inner.lock().await;
        let ts = match inner.clock {
            Some((last, at)) => last.saturating_add(at.elapsed().as_millis() as u64),
            None => now_ms(),
        };

        let event = ZoneEvent::new(ts, EventKind::Tick);
        let updates = inner.registry.broadcast(&event);
        let mut reports = Vec::new();
        for (id, update) in updates {
            if !is_notable(&update) {
                continue;
            }
            if let Some(zone) = inner.registry.get(&id) {
                if update.dirty {
                    self.saves.enqueue(zone.to_record(), now_ms());
                }
                reports.push(zone.status());
            }
        }
        reports
    }

    pub async fn statuses(&self) -> Vec<ZoneStatusReport> {
        self.inner.lock().await.registry.statuses()
    }

    pub fn pending_saves(&self) -> usize {
        self.saves.len()
    }

    /// Write records whose debounce window elapsed
    pub async fn flush_due(self: &Arc<Self>) -> Result<usize> {
        let daemon = Arc::clone(self);
        let now = now_ms();
        tokio::task::spawn_blocking(move || daemon.saves.flush_due(daemon.store.as_ref(), now))
            .await
            .map_err(|e| ThermotuneError::generic(format!("Flush task failed: {}", e)))
    }

    /// Write everything pending, e.g. on shutdown
    pub async fn flush_all(self: &Arc<Self>) -> Result<usize> {
        let daemon = Arc::clone(self);
        tokio::task::spawn_blocking(move || daemon.saves.flush_all(daemon.store.as_ref()))
            .await
            .map_err(|e| ThermotuneError::generic(format!("Flush task failed: {}", e)))
    }
}

async fn write_report<W>(out: &mut W, report: &ZoneStatusReport) -> Result<()>
where
    W: AsyncWrite + Unpin,
{
    let mut line = serde_json::to_string(report)?;
    line.push('\n');
    out.write_all(line.as_bytes()).await?;
    out.flush().await?;
    Ok(())
}

/// Read events until EOF, writing status lines for zones that changed
///
/// Bad lines are logged and skipped; only output failures end the loop early.
pub async fn run_events<R, W>(daemon: Arc<Daemon>, input: R, output: &mut W) -> Result<u64>
where
    R: AsyncBufRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut lines = input.lines();
    let mut handled = 0u64;

    while let Some(line) = lines.next_line().await? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        match daemon.handle_line(line).await {
            Ok(Some(report)) => {
                handled += 1;
                write_report(output, &report).await?;
            }
            Ok(None) => handled += 1,
            Err(e) => warn!("Skipping event: {}", e),
        }
    }

    debug!("Event stream closed after {} events", handled);
    Ok(handled)
}

/// Periodic `Tick` delivery until shutdown
pub async fn run_ticker(daemon: Arc<Daemon>, interval_ms: u64, mut shutdown: watch::Receiver<bool>) {
    if interval_ms == 0 {
        debug!("Ticker disabled");
        return;
    }
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(interval_ms)) => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        let reports = daemon.tick().await;
        if !reports.is_empty() {
            debug!("Tick changed {} zones", reports.len());
        }
    }
    debug!("Ticker stopped");
}

/// Periodic debounced flushing until shutdown
pub async fn run_flusher(daemon: Arc<Daemon>, interval_ms: u64, mut shutdown: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(Duration::from_millis(interval_ms.max(50))) => {}
            _ = shutdown.changed() => break,
        }
        if *shutdown.borrow() {
            break;
        }
        match daemon.flush_due().await {
            Ok(0) => {}
            Ok(saved) => debug!("Saved {} zone records", saved),
            Err(e) => warn!("{}", e),
        }
    }
    debug!("Flusher stopped");
}
