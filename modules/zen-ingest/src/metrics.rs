//! Prometheus metric families, registered once and cloned everywhere.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use prometheus::{
    HistogramOpts, HistogramVec, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry,
};

/// Point-in-time load samples backing the HA snapshot: adapter-channel
/// backlog per pipeline and webhook response latency. Kept beside the
/// prometheus families because the HA coordinator reads live values, not
/// scrape output.
#[derive(Clone, Default)]
pub struct LoadTracker {
    queue_depths: Arc<Mutex<HashMap<String, u64>>>,
    response_micros: Arc<AtomicU64>,
    response_samples: Arc<AtomicU64>,
}

impl LoadTracker {
    /// Publish the current backlog of one pipeline's adapter channel.
    pub fn set_queue_depth(&self, source: &str, depth: u64) {
        self.queue_depths
            .lock()
            .expect("load tracker lock")
            .insert(source.to_string(), depth);
    }

    /// Drop a stopped pipeline's sample so it stops counting toward the
    /// total.
    pub fn clear_queue_depth(&self, source: &str) {
        self.queue_depths
            .lock()
            .expect("load tracker lock")
            .remove(source);
    }

    /// Summed backlog across all running pipelines.
    pub fn queue_depth_total(&self) -> u64 {
        self.queue_depths
            .lock()
            .expect("load tracker lock")
            .values()
            .sum()
    }

    pub fn record_response(&self, elapsed: Duration) {
        self.response_micros
            .fetch_add(elapsed.as_micros() as u64, Ordering::Relaxed);
        self.response_samples.fetch_add(1, Ordering::Relaxed);
    }

    /// Drain the response-time accumulator. Returns the mean latency in
    /// milliseconds since the previous drain, or `None` when no request
    /// arrived in the window.
    pub fn take_response_time_ms(&self) -> Option<f64> {
        let samples = self.response_samples.swap(0, Ordering::Relaxed);
        let micros = self.response_micros.swap(0, Ordering::Relaxed);
        if samples == 0 {
            return None;
        }
        Some(micros as f64 / samples as f64 / 1000.0)
    }
}

/// All metric families the processor, adapters, creator, GC, and webhook
/// surface emit. Cheap to clone; the underlying collectors are shared.
#[derive(Clone)]
pub struct Metrics {
    pub events_total: IntCounterVec,
    pub observations_created_total: IntCounterVec,
    pub observations_filtered_total: IntCounterVec,
    pub observations_deduped_total: IntCounterVec,
    pub observations_create_errors_total: IntCounterVec,
    pub observations_deleted_total: IntCounter,
    pub gc_runs_total: IntCounter,
    pub gc_duration_seconds: HistogramVec,
    pub gc_errors_total: IntCounter,
    pub webhook_requests_total: IntCounterVec,
    pub webhook_dropped_total: IntCounterVec,
    pub source_dropped_total: IntCounterVec,
    pub pipeline_state: IntGaugeVec,
    pub destination_delivery_total: IntCounterVec,
    /// Label-free mirror of `events_total`, readable without walking the
    /// registry. The HA coordinator samples it for its rate estimate.
    pub events_observed: Arc<AtomicU64>,
    /// Live queue-depth and response-time samples for the HA snapshot.
    pub load: LoadTracker,
}

impl Metrics {
    pub fn register(registry: &Registry) -> prometheus::Result<Self> {
        let metrics = Self::unregistered()?;
        registry.register(Box::new(metrics.events_total.clone()))?;
        registry.register(Box::new(metrics.observations_created_total.clone()))?;
        registry.register(Box::new(metrics.observations_filtered_total.clone()))?;
        registry.register(Box::new(metrics.observations_deduped_total.clone()))?;
        registry.register(Box::new(metrics.observations_create_errors_total.clone()))?;
        registry.register(Box::new(metrics.observations_deleted_total.clone()))?;
        registry.register(Box::new(metrics.gc_runs_total.clone()))?;
        registry.register(Box::new(metrics.gc_duration_seconds.clone()))?;
        registry.register(Box::new(metrics.gc_errors_total.clone()))?;
        registry.register(Box::new(metrics.webhook_requests_total.clone()))?;
        registry.register(Box::new(metrics.webhook_dropped_total.clone()))?;
        registry.register(Box::new(metrics.source_dropped_total.clone()))?;
        registry.register(Box::new(metrics.pipeline_state.clone()))?;
        registry.register(Box::new(metrics.destination_delivery_total.clone()))?;
        Ok(metrics)
    }

    /// Collectors without a registry. Tests use this to avoid cross-test
    /// registration clashes.
    pub fn unregistered() -> prometheus::Result<Self> {
        Ok(Self {
            events_total: IntCounterVec::new(
                Opts::new("events_total", "Raw events admitted into a pipeline"),
                &["source", "category", "severity"],
            )?,
            observations_created_total: IntCounterVec::new(
                Opts::new("observations_created_total", "Observations written to the cluster"),
                &["source"],
            )?,
            observations_filtered_total: IntCounterVec::new(
                Opts::new("observations_filtered_total", "Events dropped by the filter stage"),
                &["source", "reason"],
            )?,
            observations_deduped_total: IntCounterVec::new(
                Opts::new("observations_deduped_total", "Events collapsed by the dedup window"),
                &["source"],
            )?,
            observations_create_errors_total: IntCounterVec::new(
                Opts::new("observations_create_errors_total", "Failed Observation create calls"),
                &["source", "code"],
            )?,
            observations_deleted_total: IntCounter::new(
                "observations_deleted_total",
                "Expired Observations removed by the garbage collector",
            )?,
            gc_runs_total: IntCounter::new("gc_runs_total", "Garbage collector sweeps")?,
            gc_duration_seconds: HistogramVec::new(
                HistogramOpts::new("gc_duration_seconds", "Garbage collector sweep duration")
                    .buckets(vec![0.01, 0.1, 0.5, 1.0, 5.0, 15.0, 60.0]),
                &[],
            )?,
            gc_errors_total: IntCounter::new("gc_errors_total", "Garbage collector errors")?,
            webhook_requests_total: IntCounterVec::new(
                Opts::new("webhook_requests_total", "Webhook requests by endpoint and status"),
                &["endpoint", "status"],
            )?,
            webhook_dropped_total: IntCounterVec::new(
                Opts::new("webhook_dropped_total", "Webhook events dropped before the pipeline"),
                &["reason"],
            )?,
            source_dropped_total: IntCounterVec::new(
                Opts::new("source_dropped_total", "Adapter events dropped before the pipeline"),
                &["source", "reason"],
            )?,
            pipeline_state: IntGaugeVec::new(
                Opts::new(
                    "pipeline_state",
                    "Pipeline state per source: 0 stopped, 1 running, 2 degraded, 3 failed",
                ),
                &["source"],
            )?,
            destination_delivery_total: IntCounterVec::new(
                Opts::new(
                    "destination_delivery_total",
                    "Delivery outcomes per destination class",
                ),
                &["source", "destination_class", "result"],
            )?,
            events_observed: Arc::new(AtomicU64::new(0)),
            load: LoadTracker::default(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_depth_sums_live_pipelines_only() {
        let load = LoadTracker::default();
        load.set_queue_depth("a", 3);
        load.set_queue_depth("b", 5);
        assert_eq!(load.queue_depth_total(), 8);

        load.set_queue_depth("a", 1);
        load.clear_queue_depth("b");
        assert_eq!(load.queue_depth_total(), 1);
    }

    #[test]
    fn response_time_drains_per_window() {
        let load = LoadTracker::default();
        assert_eq!(load.take_response_time_ms(), None);

        load.record_response(Duration::from_millis(10));
        load.record_response(Duration::from_millis(30));
        let mean = load.take_response_time_ms().unwrap();
        assert!((mean - 20.0).abs() < 0.5, "mean should be ~20ms: {mean}");

        assert_eq!(load.take_response_time_ms(), None);
    }
}
