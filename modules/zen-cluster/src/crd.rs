//! The Ingester custom resource and its expansion into source snapshots.
//!
//! Only `v1` is served as a typed resource here; the `v1alpha1` shape is a
//! plain serde struct consumed by the migration path.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use zen_common::{
    DedupSpec, Destination, FilterSpec, IngesterKind, InformerParams, LogsParams,
    NativeEventParams, ProcessingOrder, SourceConfig, WebhookParams, ZenError,
};

/// One entry of the multi-source spec shape.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SourceEntry {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: IngesterKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub informer: Option<InformerParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<LogsParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k8s_events: Option<NativeEventParams>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ProcessingSpec {
    #[serde(default)]
    pub order: ProcessingOrder,
}

/// Ingester v1: one declarative ingestion intent, single- or multi-source.
#[derive(CustomResource, Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
#[kube(
    group = "zenwatcher.io",
    version = "v1",
    kind = "Ingester",
    plural = "ingesters",
    shortname = "ing",
    namespaced,
    status = "IngesterStatus"
)]
pub struct IngesterSpec {
    /// Legacy single-source shape. Mutually exclusive with `sources`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingester: Option<IngesterKind>,
    /// Multi-source shape; each entry materializes an independent pipeline.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<SourceEntry>>,
    pub destinations: Vec<Destination>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub deduplication: Option<DedupSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filters: Option<FilterSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub processing: Option<ProcessingSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub informer: Option<InformerParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub webhook: Option<WebhookParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub logs: Option<LogsParams>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub k8s_events: Option<NativeEventParams>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngesterStatus {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<IngesterCondition>,
}

/// Condition types surfaced on an Ingester.
pub const CONDITION_READY: &str = "Ready";
pub const CONDITION_DEGRADED: &str = "Degraded";
pub const CONDITION_CONFIG_INVALID: &str = "ConfigInvalid";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngesterCondition {
    #[serde(rename = "type")]
    pub condition_type: String,
    /// "True" / "False" / "Unknown", matching cluster conventions.
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub last_transition_time: DateTime<Utc>,
}

impl IngesterCondition {
    pub fn new(condition_type: &str, status: bool, reason: &str, message: &str) -> Self {
        Self {
            condition_type: condition_type.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
            last_transition_time: Utc::now(),
        }
    }
}

impl IngesterSpec {
    /// Expand into per-source snapshots. Each snapshot is independently
    /// validated; invalid entries come back as errors so the store can
    /// surface a `ConfigInvalid` condition without dropping valid siblings.
    pub fn expand(&self, owner: &str) -> Vec<Result<SourceConfig, ZenError>> {
        let order = self.processing.map(|p| p.order).unwrap_or_default();

        let entries: Vec<SourceEntry> = if let Some(sources) = &self.sources {
            sources.clone()
        } else {
            match (&self.source, self.ingester) {
                (Some(name), Some(kind)) => vec![SourceEntry {
                    name: name.clone(),
                    kind,
                    informer: self.informer.clone(),
                    webhook: self.webhook.clone(),
                    logs: self.logs.clone(),
                    k8s_events: self.k8s_events.clone(),
                }],
                _ => {
                    return vec![Err(ZenError::Validation(format!(
                        "ingester '{owner}' declares neither source/ingester nor sources[]"
                    )))]
                }
            }
        };

        entries
            .into_iter()
            .map(|entry| {
                let config = SourceConfig {
                    name: entry.name,
                    kind: entry.kind,
                    owner: owner.to_string(),
                    destinations: self.destinations.clone(),
                    filters: self.filters.clone(),
                    deduplication: self.deduplication.clone(),
                    order,
                    informer: entry.informer.or_else(|| self.informer.clone()),
                    webhook: entry.webhook.or_else(|| self.webhook.clone()),
                    logs: entry.logs.or_else(|| self.logs.clone()),
                    k8s_events: entry.k8s_events.or_else(|| self.k8s_events.clone()),
                };
                config.validate()?;
                Ok(config)
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zen_common::Destination;

    fn legacy_spec() -> IngesterSpec {
        IngesterSpec {
            source: Some("trivy".to_string()),
            ingester: Some(IngesterKind::Webhook),
            sources: None,
            destinations: vec![Destination::crd("observations")],
            deduplication: None,
            filters: None,
            processing: None,
            informer: None,
            webhook: Some(WebhookParams {
                path: "/hooks/trivy".to_string(),
                auth: None,
                rate_limit: None,
            }),
            logs: None,
            k8s_events: None,
        }
    }

    #[test]
    fn legacy_shape_expands_to_one_source() {
        let configs = legacy_spec().expand("trivy-ingester");
        assert_eq!(configs.len(), 1);
        let config = configs[0].as_ref().unwrap();
        assert_eq!(config.name, "trivy");
        assert_eq!(config.kind, IngesterKind::Webhook);
        assert_eq!(config.owner, "trivy-ingester");
    }

    #[test]
    fn multi_source_shape_expands_each_entry() {
        let mut spec = legacy_spec();
        spec.source = None;
        spec.ingester = None;
        spec.sources = Some(vec![
            SourceEntry {
                name: "kyverno".to_string(),
                kind: IngesterKind::NativeEvents,
                informer: None,
                webhook: None,
                logs: None,
                k8s_events: Some(NativeEventParams::default()),
            },
            SourceEntry {
                name: "falco".to_string(),
                kind: IngesterKind::Webhook,
                informer: None,
                webhook: Some(WebhookParams {
                    path: "/hooks/falco".to_string(),
                    auth: None,
                    rate_limit: None,
                }),
                logs: None,
                k8s_events: None,
            },
        ]);

        let configs = spec.expand("multi");
        assert_eq!(configs.len(), 2);
        assert!(configs.iter().all(|c| c.is_ok()));
    }

    #[test]
    fn empty_spec_is_one_validation_error() {
        let mut spec = legacy_spec();
        spec.source = None;
        spec.ingester = None;
        let configs = spec.expand("empty");
        assert_eq!(configs.len(), 1);
        assert!(configs[0].is_err());
    }

    #[test]
    fn invalid_entry_does_not_poison_siblings() {
        let mut spec = legacy_spec();
        spec.source = None;
        spec.ingester = None;
        spec.sources = Some(vec![
            SourceEntry {
                name: "Bad Name".to_string(),
                kind: IngesterKind::Webhook,
                informer: None,
                webhook: Some(WebhookParams {
                    path: "/hooks/bad".to_string(),
                    auth: None,
                    rate_limit: None,
                }),
                logs: None,
                k8s_events: None,
            },
            SourceEntry {
                name: "good".to_string(),
                kind: IngesterKind::Webhook,
                informer: None,
                webhook: Some(WebhookParams {
                    path: "/hooks/good".to_string(),
                    auth: None,
                    rate_limit: None,
                }),
                logs: None,
                k8s_events: None,
            },
        ]);

        let configs = spec.expand("mixed");
        assert!(configs[0].is_err());
        assert!(configs[1].is_ok());
    }
}
