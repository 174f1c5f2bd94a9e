//! v1alpha1 → v1 Ingester migration.
//!
//! v1alpha1 allowed destination classes other than `crd` and a top-level
//! `normalization` block. v1 keeps only `crd` destinations and attaches the
//! mapping per destination.

use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use zen_cluster::{IngesterSpec, ProcessingSpec, SourceEntry};
use zen_common::{
    DedupSpec, Destination, FilterSpec, GvrSpec, IngesterKind, InformerParams, LogsParams,
    NativeEventParams, NormalizationMapping, WebhookParams, ZenError,
};

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct V1Alpha1Destination {
    #[serde(rename = "type")]
    pub class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    /// Non-CRD destinations carried an endpoint; dropped in v1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gvr: Option<GvrSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<NormalizationMapping>,
}

/// The legacy spec shape. Not served as a typed resource; the migration
/// tooling and conversion path deserialize it directly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct IngesterV1Alpha1Spec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ingester: Option<IngesterKind>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sources: Option<Vec<SourceEntry>>,
    #[serde(default)]
    pub destinations: Vec<V1Alpha1Destination>,
    /// Top-level mapping, relocated into each CRD destination in v1.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub normalization: Option<NormalizationMapping>,
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

#[derive(Debug)]
pub struct MigrationOutcome {
    pub spec: IngesterSpec,
    pub warnings: Vec<String>,
}

/// Convert a v1alpha1 spec to v1. Non-CRD destinations are dropped with a
/// warning; a spec left without any destination is rejected.
pub fn migrate(old: &IngesterV1Alpha1Spec) -> Result<MigrationOutcome, ZenError> {
    let mut warnings = Vec::new();
    let mut destinations = Vec::new();

    for destination in &old.destinations {
        if destination.class != "crd" {
            warnings.push(format!(
                "Destination type '{}' is not supported in v1",
                destination.class
            ));
            continue;
        }
        destinations.push(Destination {
            class: "crd".to_string(),
            value: destination.value.clone(),
            gvr: destination.gvr.clone(),
            mapping: destination
                .mapping
                .clone()
                .or_else(|| old.normalization.clone()),
        });
    }

    if destinations.is_empty() {
        return Err(ZenError::Validation(
            "no crd destination survives migration to v1".to_string(),
        ));
    }

    Ok(MigrationOutcome {
        spec: IngesterSpec {
            source: old.source.clone(),
            ingester: old.ingester,
            sources: old.sources.clone(),
            destinations,
            deduplication: old.deduplication.clone(),
            filters: old.filters.clone(),
            processing: old.processing,
            informer: old.informer.clone(),
            webhook: old.webhook.clone(),
            logs: old.logs.clone(),
            k8s_events: old.k8s_events.clone(),
        },
        warnings,
    })
}
