//! HA coordination: periodic load snapshots for the scaling view and the
//! `/ha/status` surface.
//!
//! Collected per tick: CPU share and resident memory (from `/proc/self`,
//! absent off Linux), events/sec, summed adapter-channel backlog, and mean
//! webhook response time over the window.

use std::sync::atomic::Ordering;
use std::sync::{Arc, RwLock};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use zen_cluster::LeaderElection;
use zen_common::ZenError;
use zen_ingest::{IngesterStore, Metrics};

#[derive(Debug, Clone, Serialize, Default)]
pub struct HaSnapshot {
    pub leader: bool,
    pub pipelines: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub cpu_percent: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub resident_memory_bytes: Option<u64>,
    pub events_per_second: f64,
    pub events_total: u64,
    /// Summed backlog across all adapter-to-pump channels.
    pub queue_depth: u64,
    /// Mean webhook response time over the last tick window.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_time_ms: Option<f64>,
    pub collected_at: Option<DateTime<Utc>>,
}

pub struct HaCoordinator {
    metrics: Metrics,
    store: Arc<IngesterStore>,
    interval: Duration,
    snapshot: RwLock<HaSnapshot>,
}

impl HaCoordinator {
    pub fn new(metrics: Metrics, store: Arc<IngesterStore>, interval: Duration) -> Self {
        Self {
            metrics,
            store,
            interval,
            snapshot: RwLock::new(HaSnapshot::default()),
        }
    }

    pub fn snapshot(&self) -> HaSnapshot {
        self.snapshot.read().expect("ha snapshot lock").clone()
    }

    /// Collect load metrics every tick while leading.
    pub async fn run(
        &self,
        election: Arc<dyn LeaderElection>,
        cancel: CancellationToken,
    ) -> Result<(), ZenError> {
        let mut leadership = election.lead(&cancel).await?;
        info!(interval = ?self.interval, "HA coordinator started");

        let mut tick = tokio::time::interval(self.interval);
        let mut last_events: Option<(u64, DateTime<Utc>)> = None;
        let mut last_cpu: Option<(u64, DateTime<Utc>)> = None;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                changed = leadership.changed() => {
                    if changed.is_err() || !*leadership.borrow() {
                        warn!("Leadership lost, HA coordinator stopping");
                        return Ok(());
                    }
                }
                _ = tick.tick() => {
                    let now = Utc::now();
                    let events_total = self.metrics.events_observed.load(Ordering::Relaxed);
                    let events_per_second = rate(events_total, last_events, now);
                    last_events = Some((events_total, now));

                    let cpu_percent = cpu_ticks().and_then(|ticks| {
                        let percent = last_cpu.map(|(previous, at)| {
                            let elapsed = (now - at).num_milliseconds().max(1) as f64 / 1000.0;
                            let cpu_seconds =
                                ticks.saturating_sub(previous) as f64 / CLOCK_TICKS_PER_SECOND;
                            cpu_seconds / elapsed * 100.0
                        });
                        last_cpu = Some((ticks, now));
                        percent
                    });

                    let snapshot = HaSnapshot {
                        leader: *leadership.borrow(),
                        pipelines: self.store.snapshot().len(),
                        cpu_percent,
                        resident_memory_bytes: resident_memory_bytes(),
                        events_per_second,
                        events_total,
                        queue_depth: self.metrics.load.queue_depth_total(),
                        response_time_ms: self.metrics.load.take_response_time_ms(),
                        collected_at: Some(now),
                    };
                    debug!(
                        pipelines = snapshot.pipelines,
                        events_per_second = snapshot.events_per_second,
                        queue_depth = snapshot.queue_depth,
                        "HA snapshot collected"
                    );
                    *self.snapshot.write().expect("ha snapshot lock") = snapshot;
                }
            }
        }
    }
}

fn rate(current: u64, last: Option<(u64, DateTime<Utc>)>, now: DateTime<Utc>) -> f64 {
    match last {
        Some((previous, at)) => {
            let elapsed = (now - at).num_milliseconds().max(1) as f64 / 1000.0;
            current.saturating_sub(previous) as f64 / elapsed
        }
        None => 0.0,
    }
}

/// Kernel USER_HZ. Fixed at 100 on every Linux the process targets.
const CLOCK_TICKS_PER_SECOND: f64 = 100.0;

/// Resident set size from `/proc/self/status`. `None` off Linux.
#[cfg(target_os = "linux")]
fn resident_memory_bytes() -> Option<u64> {
    let status = std::fs::read_to_string("/proc/self/status").ok()?;
    let line = status.lines().find(|l| l.starts_with("VmRSS:"))?;
    let kib: u64 = line.split_whitespace().nth(1)?.parse().ok()?;
    Some(kib * 1024)
}

#[cfg(not(target_os = "linux"))]
fn resident_memory_bytes() -> Option<u64> {
    None
}

/// utime + stime from `/proc/self/stat`. `None` off Linux.
#[cfg(target_os = "linux")]
fn cpu_ticks() -> Option<u64> {
    let stat = std::fs::read_to_string("/proc/self/stat").ok()?;
    // The comm field may contain spaces; everything positional starts after
    // the closing paren.
    let rest = stat.rsplit_once(')')?.1;
    let fields: Vec<&str> = rest.split_whitespace().collect();
    // utime and stime are stat fields 14 and 15; the slice starts at field 3.
    let utime: u64 = fields.get(11)?.parse().ok()?;
    let stime: u64 = fields.get(12)?.parse().ok()?;
    Some(utime + stime)
}

#[cfg(not(target_os = "linux"))]
fn cpu_ticks() -> Option<u64> {
    None
}
