//! The control loop: reconciles the desired set of (Ingester, source)
//! pipelines against the running set.
//!
//! Leader-gated. A follower replica blocks in `run` before constructing any
//! adapter and emits nothing.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use rand::Rng;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use zen_cluster::{IngesterCondition, LeaderElection, CONDITION_DEGRADED};
use zen_common::{SourceConfig, ZenError};

use crate::adapters::factory::AdapterFactory;
use crate::adapters::SourceAdapter;
use crate::ingester::store::{IngesterStore, StatusReporter};
use crate::metrics::Metrics;
use crate::pipeline::processor::Processor;

/// Gauge values for `pipeline_state{source}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineState {
    Stopped = 0,
    Running = 1,
    Degraded = 2,
    Failed = 3,
}

/// Capped exponential backoff with jitter for adapter start retries.
#[derive(Debug, Clone)]
pub struct BackoffPolicy {
    pub initial: Duration,
    pub factor: f64,
    pub cap: Duration,
    pub jitter: f64,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            initial: Duration::from_secs(1),
            factor: 2.0,
            cap: Duration::from_secs(60),
            jitter: 0.2,
        }
    }
}

impl BackoffPolicy {
    pub fn delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self.initial.as_secs_f64() * self.factor.powi(exponent as i32);
        let capped = base.min(self.cap.as_secs_f64());
        let jittered = if self.jitter > 0.0 {
            capped * rand::rng().random_range(1.0 - self.jitter..=1.0 + self.jitter)
        } else {
            capped
        };
        Duration::from_secs_f64(jittered.min(self.cap.as_secs_f64() * (1.0 + self.jitter)))
    }
}

struct PipelineHandle {
    config: SourceConfig,
    revision: String,
    adapter: Box<dyn SourceAdapter>,
    cancel: CancellationToken,
    pump: Option<JoinHandle<()>>,
}

struct RetryState {
    attempts: u32,
    next_attempt: Instant,
}

struct PumpExit {
    source: String,
    revision: String,
    cancelled: bool,
}

pub struct Orchestrator {
    store: Arc<IngesterStore>,
    factory: Arc<dyn AdapterFactory>,
    processor: Arc<Processor>,
    metrics: Metrics,
    reporter: Arc<dyn StatusReporter>,
    reconcile_interval: Duration,
    backoff: BackoffPolicy,
    stop_grace: Duration,
}

impl Orchestrator {
    pub fn new(
        store: Arc<IngesterStore>,
        factory: Arc<dyn AdapterFactory>,
        processor: Arc<Processor>,
        metrics: Metrics,
        reporter: Arc<dyn StatusReporter>,
    ) -> Self {
        Self {
            store,
            factory,
            processor,
            metrics,
            reporter,
            reconcile_interval: Duration::from_secs(30),
            backoff: BackoffPolicy::default(),
            stop_grace: Duration::from_secs(5),
        }
    }

    pub fn with_reconcile_interval(mut self, interval: Duration) -> Self {
        self.reconcile_interval = interval;
        self
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Run until cancelled or leadership is lost. Blocks for election
    /// before touching any adapter; stops every pump before returning.
    pub async fn run(
        &self,
        election: Arc<dyn LeaderElection>,
        cancel: CancellationToken,
    ) -> Result<(), ZenError> {
        let mut leadership = election.lead(&cancel).await?;
        info!("Orchestrator elected leader");

        let (pump_tx, mut pump_rx) = mpsc::unbounded_channel::<PumpExit>();
        let mut handles: HashMap<String, PipelineHandle> = HashMap::new();
        let mut retries: HashMap<String, RetryState> = HashMap::new();
        let mut store_rx = self.store.subscribe();
        let mut tick = tokio::time::interval(self.reconcile_interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);

        loop {
            let earliest_retry = retries.values().map(|r| r.next_attempt).min();
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = leadership.changed() => {
                    if changed.is_err() || !*leadership.borrow() {
                        warn!("Leadership lost, stopping all pipelines");
                        break;
                    }
                }
                _ = store_rx.changed() => {
                    self.reconcile(&mut handles, &mut retries, &pump_tx).await;
                }
                _ = tick.tick() => {
                    self.reconcile(&mut handles, &mut retries, &pump_tx).await;
                }
                _ = async {
                    match earliest_retry {
                        Some(at) => tokio::time::sleep_until(at).await,
                        None => std::future::pending().await,
                    }
                } => {
                    self.reconcile(&mut handles, &mut retries, &pump_tx).await;
                }
                Some(exit) = pump_rx.recv() => {
                    self.on_pump_exit(&mut handles, &mut retries, exit).await;
                }
            }
        }

        self.stop_all(&mut handles).await;
        Ok(())
    }

    async fn reconcile(
        &self,
        handles: &mut HashMap<String, PipelineHandle>,
        retries: &mut HashMap<String, RetryState>,
        pump_tx: &mpsc::UnboundedSender<PumpExit>,
    ) {
        let desired = self.store.snapshot();

        // Stop: running pipelines that are gone or whose revision moved.
        // A changed revision is stop-then-start, never in-place.
        let stop: Vec<String> = handles
            .iter()
            .filter(|(source, handle)| {
                desired
                    .get(*source)
                    .map(|config| config.revision() != handle.revision)
                    .unwrap_or(true)
            })
            .map(|(source, _)| source.clone())
            .collect();
        for source in stop {
            if let Some(handle) = handles.remove(&source) {
                self.stop_pipeline(handle).await;
            }
            retries.remove(&source);
        }
        retries.retain(|source, _| desired.contains_key(source));

        // Start: desired pipelines not running, once any backoff is due.
        let now = Instant::now();
        for (source, config) in desired {
            if handles.contains_key(&source) {
                continue;
            }
            if let Some(retry) = retries.get(&source) {
                if retry.next_attempt > now {
                    continue;
                }
            }
            match self.start_pipeline(&config, pump_tx).await {
                Ok(handle) => {
                    retries.remove(&source);
                    handles.insert(source.clone(), handle);
                    self.set_state(&source, PipelineState::Running);
                }
                Err(e) => {
                    let retry = retries.entry(source.clone()).or_insert(RetryState {
                        attempts: 0,
                        next_attempt: now,
                    });
                    retry.attempts += 1;
                    let delay = self.backoff.delay(retry.attempts);
                    retry.next_attempt = now + delay;
                    self.set_state(&source, PipelineState::Failed);
                    warn!(
                        source = %source,
                        attempts = retry.attempts,
                        retry_in = ?delay,
                        error = %e,
                        "Pipeline start failed"
                    );
                    self.reporter
                        .report(
                            &config.owner,
                            IngesterCondition::new(
                                CONDITION_DEGRADED,
                                true,
                                "StartFailed",
                                &e.to_string(),
                            ),
                        )
                        .await;
                }
            }
        }
    }

    async fn start_pipeline(
        &self,
        config: &SourceConfig,
        pump_tx: &mpsc::UnboundedSender<PumpExit>,
    ) -> Result<PipelineHandle, ZenError> {
        let mut adapter = self.factory.build(config)?;
        let mut events = adapter.start(config).await?;

        let cancel = CancellationToken::new();
        let pump_cancel = cancel.clone();
        let processor = self.processor.clone();
        let pump_config = config.clone();
        let revision = config.revision();
        let exit = PumpExit {
            source: config.name.clone(),
            revision: revision.clone(),
            cancelled: false,
        };
        let pump_tx = pump_tx.clone();

        // One pump per pipeline: single consumer, synchronous processing,
        // so per-source ordering is the channel ordering.
        let load = self.metrics.load.clone();
        let pump = tokio::spawn(async move {
            let mut exit = exit;
            loop {
                load.set_queue_depth(&pump_config.name, events.len() as u64);
                tokio::select! {
                    _ = pump_cancel.cancelled() => {
                        exit.cancelled = true;
                        break;
                    }
                    event = events.recv() => {
                        match event {
                            Some(event) => {
                                if let Err(e) = processor
                                    .process_event(event, Some(&pump_config))
                                    .await
                                {
                                    // Per-event errors never kill the pump.
                                    warn!(source = %pump_config.name, error = %e, "Event processing failed");
                                }
                            }
                            None => {
                                exit.cancelled = pump_cancel.is_cancelled();
                                break;
                            }
                        }
                    }
                }
            }
            load.clear_queue_depth(&pump_config.name);
            let _ = pump_tx.send(exit);
        });

        info!(source = %config.name, kind = %config.kind, revision = %revision, "Pipeline started");
        Ok(PipelineHandle {
            config: config.clone(),
            revision,
            adapter,
            cancel,
            pump: Some(pump),
        })
    }

    async fn stop_pipeline(&self, mut handle: PipelineHandle) {
        let source = handle.config.name.clone();
        handle.cancel.cancel();
        handle.adapter.stop().await;
        if let Some(pump) = handle.pump.take() {
            if tokio::time::timeout(self.stop_grace, pump).await.is_err() {
                warn!(source = %source, "Pump did not stop within grace period");
            }
        }
        self.processor.release_source(&source).await;
        self.set_state(&source, PipelineState::Stopped);
        info!(source = %source, "Pipeline stopped");
    }

    async fn on_pump_exit(
        &self,
        handles: &mut HashMap<String, PipelineHandle>,
        retries: &mut HashMap<String, RetryState>,
        exit: PumpExit,
    ) {
        if exit.cancelled {
            // Expected: part of a stop flow.
            return;
        }
        let Some(handle) = handles.get(&exit.source) else {
            return;
        };
        if handle.revision != exit.revision {
            return;
        }

        // The adapter channel closed under us: degraded, retry with backoff.
        let handle = handles.remove(&exit.source).expect("handle present");
        let owner = handle.config.owner.clone();
        let mut handle = handle;
        handle.adapter.stop().await;
        self.processor.release_source(&exit.source).await;
        self.set_state(&exit.source, PipelineState::Degraded);

        let retry = retries.entry(exit.source.clone()).or_insert(RetryState {
            attempts: 0,
            next_attempt: Instant::now(),
        });
        retry.attempts += 1;
        let delay = self.backoff.delay(retry.attempts);
        retry.next_attempt = Instant::now() + delay;

        warn!(source = %exit.source, retry_in = ?delay, "Adapter channel closed unexpectedly");
        self.reporter
            .report(
                &owner,
                IngesterCondition::new(
                    CONDITION_DEGRADED,
                    true,
                    "ChannelClosed",
                    "adapter stream ended unexpectedly",
                ),
            )
            .await;
    }

    async fn stop_all(&self, handles: &mut HashMap<String, PipelineHandle>) {
        let sources: Vec<String> = handles.keys().cloned().collect();
        for source in sources {
            if let Some(handle) = handles.remove(&source) {
                self.stop_pipeline(handle).await;
            }
        }
        debug!("All pipelines stopped");
    }

    fn set_state(&self, source: &str, state: PipelineState) {
        self.metrics
            .pipeline_state
            .with_label_values(&[source])
            .set(state as i64);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_and_caps() {
        let policy = BackoffPolicy {
            jitter: 0.0,
            ..BackoffPolicy::default()
        };
        assert_eq!(policy.delay(1), Duration::from_secs(1));
        assert_eq!(policy.delay(2), Duration::from_secs(2));
        assert_eq!(policy.delay(3), Duration::from_secs(4));
        assert_eq!(policy.delay(10), Duration::from_secs(60));
    }

    #[test]
    fn backoff_jitter_stays_in_band() {
        let policy = BackoffPolicy::default();
        for attempt in 1..8 {
            let base = BackoffPolicy {
                jitter: 0.0,
                ..BackoffPolicy::default()
            }
            .delay(attempt)
            .as_secs_f64();
            let jittered = policy.delay(attempt).as_secs_f64();
            assert!(jittered >= base * 0.8 - f64::EPSILON);
            assert!(jittered <= base * 1.2 + f64::EPSILON);
        }
    }
}
