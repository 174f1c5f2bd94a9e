//! Single-event pipeline executor.
//!
//! Canonical order: filter and dedup in the configured order, then
//! normalize, then deliver. A missing stage config is a no-op stage.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::Utc;
use tokio::sync::Mutex;
use tracing::{debug, warn};

use zen_common::{ProcessingOrder, RawEvent, SourceConfig, ZenError};

use crate::metrics::Metrics;
use crate::pipeline::creator::{DeliveryResult, ObservationCreator};
use crate::pipeline::dedup::{fingerprint, Deduper, FingerprintInput};
use crate::pipeline::filter::EventFilter;
use crate::pipeline::normalize;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessOutcome {
    Delivered,
    AlreadyExists,
    Filtered,
    Deduplicated,
    Denied,
    /// Dropped because no (valid) source config was available.
    Invalid,
}

pub struct Processor {
    filter: Arc<EventFilter>,
    creator: Arc<ObservationCreator>,
    metrics: Metrics,
    /// Dedupers keyed by source, recreated when the config revision moves.
    dedupers: Mutex<HashMap<String, (String, Arc<Deduper>)>>,
}

impl Processor {
    pub fn new(filter: Arc<EventFilter>, creator: Arc<ObservationCreator>, metrics: Metrics) -> Self {
        Self {
            filter,
            creator,
            metrics,
            dedupers: Mutex::new(HashMap::new()),
        }
    }

    /// Run one raw event through the pipeline. Per-event errors come back
    /// to the pump as `Err` but must never kill it.
    pub async fn process_event(
        &self,
        event: RawEvent,
        config: Option<&SourceConfig>,
    ) -> Result<ProcessOutcome, ZenError> {
        let Some(config) = config else {
            // A nil config is a validation failure, not a crash.
            warn!(source = %event.source, "Dropping event without source config");
            self.metrics
                .observations_filtered_total
                .with_label_values(&[&event.source, "no_config"])
                .inc();
            return Ok(ProcessOutcome::Invalid);
        };

        let mapping = config
            .primary_destination()
            .and_then(|d| d.mapping.as_ref());

        // Probe the canonical dimensions once; filter and dedup may both run
        // before normalization.
        let severity = normalize::resolve_severity(&event, mapping);
        let priority = normalize::resolve_priority(severity, mapping);
        let namespace = normalize::resolve_namespace(&event);
        let event_type = normalize::resolve_event_type(&event, mapping)?;
        let category = normalize::resolve_category(&event, mapping);

        let print_input = FingerprintInput {
            event: &event,
            category,
            event_type: &event_type,
            severity,
        };
        let dedup_fields = config
            .deduplication
            .as_ref()
            .map(|d| d.fields.clone())
            .unwrap_or_default();
        let print = fingerprint(&print_input, &dedup_fields);

        let run_filter = || {
            self.filter.evaluate(
                &event,
                config.filters.as_ref(),
                severity,
                priority,
                namespace.as_deref(),
            )
        };

        match config.order {
            ProcessingOrder::FilterFirst => {
                let decision = run_filter();
                if let Some(reason) = decision.reason() {
                    self.count_filtered(&event.source, reason);
                    return Ok(ProcessOutcome::Filtered);
                }
                if self.is_duplicate(config, &print_input).await? {
                    self.count_deduped(&event.source);
                    return Ok(ProcessOutcome::Deduplicated);
                }
            }
            ProcessingOrder::DedupFirst => {
                if self.is_duplicate(config, &print_input).await? {
                    self.count_deduped(&event.source);
                    return Ok(ProcessOutcome::Deduplicated);
                }
                let decision = run_filter();
                if let Some(reason) = decision.reason() {
                    self.count_filtered(&event.source, reason);
                    return Ok(ProcessOutcome::Filtered);
                }
            }
        }

        let spec = normalize::normalize(&event, mapping)?;
        match self.creator.deliver(spec, config, &print).await? {
            DeliveryResult::Delivered => Ok(ProcessOutcome::Delivered),
            DeliveryResult::AlreadyExists => Ok(ProcessOutcome::AlreadyExists),
            DeliveryResult::Denied => Ok(ProcessOutcome::Denied),
        }
    }

    /// Drop the per-source deduper and halt its cleanup task. Called by the
    /// orchestrator when a pipeline stops.
    pub async fn release_source(&self, source: &str) {
        let removed = self.dedupers.lock().await.remove(source);
        if let Some((_, deduper)) = removed {
            deduper.stop().await;
            debug!(source, "Deduper released");
        }
    }

    async fn is_duplicate(
        &self,
        config: &SourceConfig,
        input: &FingerprintInput<'_>,
    ) -> Result<bool, ZenError> {
        let Some(spec) = &config.deduplication else {
            return Ok(false);
        };
        if !spec.enabled {
            return Ok(false);
        }

        let revision = config.revision();
        let mut dedupers = self.dedupers.lock().await;
        let current = matches!(dedupers.get(&config.name), Some((rev, _)) if *rev == revision);
        if !current {
            if let Some((_, old)) = dedupers.remove(&config.name) {
                // Stop the stale cleanup task off-lock.
                tokio::spawn(async move { old.stop().await });
            }
            let fresh = Deduper::from_spec(spec)?;
            dedupers.insert(config.name.clone(), (revision, fresh));
        }
        let deduper = dedupers
            .get(&config.name)
            .expect("deduper just ensured")
            .1
            .clone();
        drop(dedupers);

        Ok(deduper.observe(input, Utc::now()))
    }

    fn count_filtered(&self, source: &str, reason: &str) {
        self.metrics
            .observations_filtered_total
            .with_label_values(&[source, reason])
            .inc();
    }

    fn count_deduped(&self, source: &str) {
        self.metrics
            .observations_deduped_total
            .with_label_values(&[source])
            .inc();
    }
}
