//! The delivery sink: TTL defaulting, destination resolution, the policy
//! gate, and the single create attempt.

use std::sync::Arc;

use tracing::{debug, warn};

use zen_cluster::{ObservationWriter, WritePolicy, WriteTarget};
use zen_common::{
    is_valid_event_type, coerce_event_type, GvrSpec, ObservationSpec, SourceConfig, ZenError,
    MAX_TTL_SECONDS,
};

use crate::metrics::Metrics;

/// Pluggable short-name resolution: source name → destination triple.
/// Returning `None` falls through to the configured destination and then the
/// canonical Observation triple.
pub type DestinationResolver = Arc<dyn Fn(&str) -> Option<GvrSpec> + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeliveryResult {
    Delivered,
    /// Idempotent replay: the fingerprint-derived name already exists.
    AlreadyExists,
    Denied,
}

pub struct ObservationCreator {
    writer: Arc<dyn ObservationWriter>,
    policy: Arc<WritePolicy>,
    metrics: Metrics,
    default_ttl_seconds: u64,
    namespace: String,
    resolver: Option<DestinationResolver>,
}

impl ObservationCreator {
    pub fn new(
        writer: Arc<dyn ObservationWriter>,
        policy: Arc<WritePolicy>,
        metrics: Metrics,
        default_ttl_seconds: u64,
        namespace: String,
    ) -> Self {
        Self {
            writer,
            policy,
            metrics,
            default_ttl_seconds,
            namespace,
            resolver: None,
        }
    }

    pub fn with_resolver(mut self, resolver: DestinationResolver) -> Self {
        self.resolver = Some(resolver);
        self
    }

    /// Deliver one Observation. Exactly one create attempt; a name conflict
    /// on the fingerprint-derived name is idempotent success. A policy
    /// denial drops the event and leaves the pipeline healthy.
    pub async fn deliver(
        &self,
        mut spec: ObservationSpec,
        config: &SourceConfig,
        fingerprint: &str,
    ) -> Result<DeliveryResult, ZenError> {
        // Pre-create normalization.
        if !is_valid_event_type(&spec.event_type) {
            spec.event_type = coerce_event_type(&spec.event_type);
        }
        let ttl = spec
            .ttl_seconds_after_creation
            .unwrap_or(self.default_ttl_seconds)
            .clamp(1, MAX_TTL_SECONDS);
        spec.ttl_seconds_after_creation = Some(ttl);

        let gvr = self.resolve_destination(config);
        let name = observation_name(&spec.source, fingerprint);
        let target = WriteTarget {
            gvr: gvr.clone(),
            namespace: self.namespace.clone(),
            name,
        };

        if let Err(denial) = self.policy.check(&target.gvr, Some(&target.namespace)) {
            self.metrics
                .destination_delivery_total
                .with_label_values(&[&spec.source, "crd", denial.metric_label()])
                .inc();
            return Ok(DeliveryResult::Denied);
        }

        match self.writer.create(&target, &spec).await {
            Ok(()) => {
                self.metrics
                    .observations_created_total
                    .with_label_values(&[&spec.source])
                    .inc();
                self.metrics
                    .events_total
                    .with_label_values(&[
                        &spec.source,
                        &spec.category.to_string(),
                        &spec.severity.to_string(),
                    ])
                    .inc();
                self.metrics
                    .events_observed
                    .fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                self.metrics
                    .destination_delivery_total
                    .with_label_values(&[&spec.source, "crd", "delivered"])
                    .inc();
                debug!(source = %spec.source, name = %target.name, "Observation delivered");
                Ok(DeliveryResult::Delivered)
            }
            Err(ZenError::ConflictOnCreate { name }) => {
                // The name is derived from the fingerprint, so an existing
                // object means this exact event was already delivered.
                self.metrics
                    .destination_delivery_total
                    .with_label_values(&[&spec.source, "crd", "conflict"])
                    .inc();
                debug!(source = %spec.source, name = %name, "Observation already exists");
                Ok(DeliveryResult::AlreadyExists)
            }
            Err(e) => {
                let code = error_code(&e);
                self.metrics
                    .observations_create_errors_total
                    .with_label_values(&[&spec.source, code])
                    .inc();
                self.metrics
                    .destination_delivery_total
                    .with_label_values(&[&spec.source, "crd", "error"])
                    .inc();
                warn!(source = %spec.source, error = %e, "Observation create failed");
                Err(e)
            }
        }
    }

    fn resolve_destination(&self, config: &SourceConfig) -> GvrSpec {
        if let Some(resolver) = &self.resolver {
            if let Some(gvr) = resolver(&config.name) {
                return gvr;
            }
        }
        if let Some(destination) = config.primary_destination() {
            if let Some(gvr) = &destination.gvr {
                return gvr.clone();
            }
            if let Some(value) = &destination.value {
                return resolve_short_name(value);
            }
        }
        GvrSpec::observations()
    }
}

/// Deterministic name: the fingerprint prefix keyed by source. Conflicts on
/// this name are idempotent replays by construction.
pub fn observation_name(source: &str, fingerprint: &str) -> String {
    let prefix_len = fingerprint.len().min(16);
    format!("{source}-{}", &fingerprint[..prefix_len])
}

/// Short destination names resolve to canonical triples. Anything other
/// than the built-in name maps into the Zen group.
fn resolve_short_name(value: &str) -> GvrSpec {
    if value == zen_common::OBSERVATIONS_RESOURCE {
        GvrSpec::observations()
    } else {
        GvrSpec::new(zen_common::ZEN_GROUP, zen_common::ZEN_VERSION, value)
    }
}

fn error_code(error: &ZenError) -> &'static str {
    match error {
        ZenError::Transient(_) => "transient",
        ZenError::ConflictOnCreate { .. } => "conflict",
        ZenError::PolicyDenied(_) => "denied",
        ZenError::Validation(_) => "validation",
        _ => "error",
    }
}
