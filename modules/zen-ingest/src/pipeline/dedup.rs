//! Sliding-window deduplication over content fingerprints.
//!
//! Internally locked: today each pipeline owns one deduper and a single pump
//! drives it, but nothing here assumes that.

use std::collections::{HashSet, VecDeque};
use std::sync::Mutex;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use zen_common::{Category, DedupSpec, DedupStrategy, RawEvent, Severity, ZenError};

/// Everything the fingerprint covers besides the raw payload.
pub struct FingerprintInput<'a> {
    pub event: &'a RawEvent,
    pub category: Category,
    pub event_type: &'a str,
    pub severity: Severity,
}

/// Content hash over the canonical subset: source, category, event-type,
/// severity, resource, and the chosen detail keys (all keys when `fields`
/// is empty). Pure function of its inputs.
pub fn fingerprint(input: &FingerprintInput<'_>, fields: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.event.source.as_bytes());
    hasher.update(input.category.to_string().as_bytes());
    hasher.update(input.event_type.as_bytes());
    hasher.update(input.severity.to_string().as_bytes());
    if let Some(resource) = input.event.lookup("resource") {
        hasher.update(canonical_json(resource).as_bytes());
    }
    if fields.is_empty() {
        for (key, value) in &input.event.raw_data {
            if key == "resource" {
                continue;
            }
            hasher.update(key.as_bytes());
            hasher.update(canonical_json(value).as_bytes());
        }
    } else {
        for field in fields {
            hasher.update(field.as_bytes());
            if let Some(value) = input.event.lookup(field) {
                hasher.update(canonical_json(value).as_bytes());
            }
        }
    }
    hex::encode(hasher.finalize())
}

/// Hash over configured field paths only (the `key` strategy).
pub fn key_over_fields(event: &RawEvent, fields: &[String]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event.source.as_bytes());
    for field in fields {
        hasher.update(field.as_bytes());
        if let Some(value) = event.lookup(field) {
            hasher.update(canonical_json(value).as_bytes());
        }
    }
    hex::encode(hasher.finalize())
}

// serde_json::Map preserves no key order guarantee across construction
// paths, so hash through a sorted rendering.
fn canonical_json(value: &serde_json::Value) -> String {
    match value {
        serde_json::Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            let parts: Vec<String> = keys
                .into_iter()
                .map(|k| format!("\"{k}\":{}", canonical_json(&map[k])))
                .collect();
            format!("{{{}}}", parts.join(","))
        }
        serde_json::Value::Array(items) => {
            let parts: Vec<String> = items.iter().map(canonical_json).collect();
            format!("[{}]", parts.join(","))
        }
        other => other.to_string(),
    }
}

struct Bucket {
    start: DateTime<Utc>,
    keys: Vec<String>,
}

struct DedupState {
    buckets: VecDeque<Bucket>,
    index: HashSet<String>,
    total: usize,
    /// Rolling duplicate-rate estimate (adaptive strategy).
    effectiveness: f64,
    /// Estimate at the last field adjustment.
    applied_effectiveness: f64,
    /// Fraction of detail keys the adaptive fingerprint covers.
    active_fraction: f64,
}

pub struct Deduper {
    window: Duration,
    max_entries: usize,
    strategy: DedupStrategy,
    fields: Vec<String>,
    learning_rate: f64,
    min_change: f64,
    state: Mutex<DedupState>,
    cancel: CancellationToken,
    cleanup: Mutex<Option<JoinHandle<()>>>,
}

const DEFAULT_MAX_ENTRIES: usize = 10_000;

impl Deduper {
    /// Build from spec and start the cleanup task. Must run on a tokio
    /// runtime.
    pub fn from_spec(spec: &DedupSpec) -> Result<std::sync::Arc<Self>, ZenError> {
        let window = spec.effective_window()?;
        let deduper = std::sync::Arc::new(Self {
            window,
            max_entries: spec.max_entries.unwrap_or(DEFAULT_MAX_ENTRIES),
            strategy: spec.strategy,
            fields: spec.fields.clone(),
            learning_rate: spec.learning_rate.unwrap_or(0.1),
            min_change: spec.min_change.unwrap_or(0.2),
            state: Mutex::new(DedupState {
                buckets: VecDeque::new(),
                index: HashSet::new(),
                total: 0,
                effectiveness: 0.0,
                applied_effectiveness: 0.0,
                active_fraction: 1.0,
            }),
            cancel: CancellationToken::new(),
            cleanup: Mutex::new(None),
        });

        // Cleanup cadence is bounded by half the window.
        let interval = (window / 2).max(Duration::from_millis(50));
        let weak = std::sync::Arc::downgrade(&deduper);
        let cancel = deduper.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut tick = tokio::time::interval(interval);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tick.tick() => {
                        let Some(deduper) = weak.upgrade() else { break };
                        deduper.evict(Utc::now());
                    }
                }
            }
        });
        *deduper.cleanup.lock().expect("dedup lock") = Some(handle);
        Ok(deduper)
    }

    /// Record one event. Returns `true` when it is a duplicate within the
    /// window. `now` is passed explicitly so window behavior is testable
    /// without sleeping.
    pub fn observe(&self, input: &FingerprintInput<'_>, now: DateTime<Utc>) -> bool {
        let key = self.compute_key(input);
        self.evict(now);

        let mut state = self.state.lock().expect("dedup lock");
        let duplicate = state.index.contains(&key);
        if !duplicate {
            state.index.insert(key.clone());
            let granularity = bucket_granularity(self.window);
            let needs_new = match state.buckets.back() {
                Some(bucket) => {
                    (now - bucket.start).to_std().unwrap_or_default() >= granularity
                }
                None => true,
            };
            if needs_new {
                state.buckets.push_back(Bucket {
                    start: now,
                    keys: Vec::new(),
                });
            }
            state.buckets.back_mut().expect("bucket exists").keys.push(key);
            state.total += 1;

            // Size cap: purge oldest bucket first.
            while state.total > self.max_entries {
                let Some(bucket) = state.buckets.pop_front() else {
                    break;
                };
                state.total -= bucket.keys.len();
                for key in bucket.keys {
                    state.index.remove(&key);
                }
            }
        }

        if self.strategy == DedupStrategy::Adaptive {
            let hit = if duplicate { 1.0 } else { 0.0 };
            state.effectiveness =
                state.effectiveness * (1.0 - self.learning_rate) + hit * self.learning_rate;
            if (state.effectiveness - state.applied_effectiveness).abs() > self.min_change {
                // Narrow the covered field set a step; a coarser fingerprint
                // collapses more near-duplicates.
                state.active_fraction =
                    (state.active_fraction - self.learning_rate).clamp(0.25, 1.0);
                state.applied_effectiveness = state.effectiveness;
                debug!(
                    fraction = state.active_fraction,
                    effectiveness = state.effectiveness,
                    "Adaptive dedup adjusted field coverage"
                );
            }
        }

        duplicate
    }

    /// Halt the cleanup task. Leaking it is a test-observable defect.
    pub async fn stop(&self) {
        self.cancel.cancel();
        let handle = self.cleanup.lock().expect("dedup lock").take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
    }

    pub fn len(&self) -> usize {
        self.state.lock().expect("dedup lock").total
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn compute_key(&self, input: &FingerprintInput<'_>) -> String {
        match self.strategy {
            DedupStrategy::Fingerprint => fingerprint(input, &self.fields),
            DedupStrategy::Key => {
                if self.fields.is_empty() {
                    fingerprint(input, &[])
                } else {
                    key_over_fields(input.event, &self.fields)
                }
            }
            DedupStrategy::Hybrid => format!(
                "{}:{}",
                fingerprint(input, &self.fields),
                key_over_fields(input.event, &self.fields)
            ),
            DedupStrategy::Adaptive => {
                let fraction = self.state.lock().expect("dedup lock").active_fraction;
                let mut keys: Vec<String> = input.event.raw_data.keys().cloned().collect();
                keys.sort();
                let kept = ((keys.len() as f64 * fraction).ceil() as usize).max(1);
                keys.truncate(kept.min(keys.len()));
                fingerprint(input, &keys)
            }
        }
    }

    fn evict(&self, now: DateTime<Utc>) {
        let mut state = self.state.lock().expect("dedup lock");
        while let Some(bucket) = state.buckets.front() {
            let age = (now - bucket.start).to_std().unwrap_or_default();
            if age <= self.window {
                break;
            }
            let bucket = state.buckets.pop_front().expect("front exists");
            state.total -= bucket.keys.len();
            for key in bucket.keys {
                state.index.remove(&key);
            }
        }
    }
}

fn bucket_granularity(window: Duration) -> Duration {
    (window / 4).max(Duration::from_millis(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration as ChronoDuration;

    fn event(id: &str) -> RawEvent {
        let mut data = serde_json::Map::new();
        data.insert("id".to_string(), serde_json::json!(id));
        data.insert("severity".to_string(), serde_json::json!("HIGH"));
        RawEvent::new("test", data)
    }

    fn input<'a>(event: &'a RawEvent) -> FingerprintInput<'a> {
        FingerprintInput {
            event,
            category: Category::Security,
            event_type: "test_event",
            severity: Severity::High,
        }
    }

    fn spec(window_seconds: u64) -> DedupSpec {
        DedupSpec {
            window_seconds: Some(window_seconds),
            ..DedupSpec::default()
        }
    }

    #[test]
    fn fingerprint_is_pure_over_chosen_fields() {
        let a = event("dup");
        let b = event("dup");
        assert_eq!(fingerprint(&input(&a), &[]), fingerprint(&input(&b), &[]));

        let c = event("other");
        assert_ne!(fingerprint(&input(&a), &[]), fingerprint(&input(&c), &[]));

        // Restricting to a field both events agree on makes them equal.
        let fields = vec!["severity".to_string()];
        assert_eq!(
            fingerprint(&input(&a), &fields),
            fingerprint(&input(&c), &fields)
        );
    }

    #[tokio::test]
    async fn duplicate_within_window_collapses() {
        let deduper = Deduper::from_spec(&spec(60)).unwrap();
        let now = Utc::now();
        let e = event("dup");

        assert!(!deduper.observe(&input(&e), now));
        assert!(deduper.observe(&input(&e), now + ChronoDuration::seconds(1)));
        deduper.stop().await;
    }

    #[tokio::test]
    async fn duplicate_past_window_passes_again() {
        let deduper = Deduper::from_spec(&spec(60)).unwrap();
        let now = Utc::now();
        let e = event("dup");

        assert!(!deduper.observe(&input(&e), now));
        assert!(!deduper.observe(&input(&e), now + ChronoDuration::seconds(120)));
        deduper.stop().await;
    }

    #[tokio::test]
    async fn max_entries_purges_oldest_bucket() {
        let dedup_spec = DedupSpec {
            window_seconds: Some(3600),
            max_entries: Some(4),
            ..DedupSpec::default()
        };
        let deduper = Deduper::from_spec(&dedup_spec).unwrap();
        let now = Utc::now();
        for i in 0..8 {
            let e = event(&format!("e{i}"));
            deduper.observe(&input(&e), now + ChronoDuration::minutes(i * 20));
        }
        assert!(deduper.len() <= 4);
        deduper.stop().await;
    }

    #[tokio::test]
    async fn key_strategy_ignores_unconfigured_fields() {
        let dedup_spec = DedupSpec {
            window_seconds: Some(60),
            strategy: DedupStrategy::Key,
            fields: vec!["severity".to_string()],
            ..DedupSpec::default()
        };
        let deduper = Deduper::from_spec(&dedup_spec).unwrap();
        let now = Utc::now();

        // Different ids, same severity: key strategy treats them as dupes.
        assert!(!deduper.observe(&input(&event("a")), now));
        assert!(deduper.observe(&input(&event("b")), now));
        deduper.stop().await;
    }

    #[tokio::test]
    async fn stop_halts_cleanup_task() {
        let deduper = Deduper::from_spec(&spec(1)).unwrap();
        deduper.stop().await;
        let handle = deduper.cleanup.lock().unwrap().take();
        assert!(handle.is_none(), "cleanup handle consumed by stop");
    }
}
