use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::error::ZenError;
use crate::validation;

// --- Canonical Observation destination ---

/// API group every Zen resource lives under.
pub const ZEN_GROUP: &str = "zenwatcher.io";
/// Served version of the canonical Observation resource.
pub const ZEN_VERSION: &str = "v1";
/// Plural resource name of the canonical Observation class.
pub const OBSERVATIONS_RESOURCE: &str = "observations";

// --- Severity / category ---

/// Canonical severity set carried on every emitted Observation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum Severity {
    Info,
    Low,
    Medium,
    High,
    Critical,
}

impl Severity {
    /// Case-insensitive parse. Unrecognized input maps to `None` so callers
    /// can apply their own default.
    pub fn parse(s: &str) -> Option<Self> {
        match s.to_uppercase().as_str() {
            "CRITICAL" => Some(Self::Critical),
            "HIGH" => Some(Self::High),
            "MEDIUM" => Some(Self::Medium),
            "LOW" => Some(Self::Low),
            "INFO" => Some(Self::Info),
            _ => None,
        }
    }

    /// Default priority weight in [0, 1] when the mapping does not override.
    pub fn default_priority(&self) -> f64 {
        match self {
            Severity::Critical => 1.0,
            Severity::High => 0.8,
            Severity::Medium => 0.5,
            Severity::Low => 0.3,
            Severity::Info => 0.1,
        }
    }
}

impl std::fmt::Display for Severity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Severity::Critical => write!(f, "CRITICAL"),
            Severity::High => write!(f, "HIGH"),
            Severity::Medium => write!(f, "MEDIUM"),
            Severity::Low => write!(f, "LOW"),
            Severity::Info => write!(f, "INFO"),
        }
    }
}

/// Filter threshold set. `UNKNOWN` matches events whose severity could not
/// be resolved; it is not a valid Observation severity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "UPPERCASE")]
pub enum SeverityThreshold {
    Unknown,
    Low,
    Medium,
    High,
    Critical,
}

impl SeverityThreshold {
    /// Rank for ordering comparisons; UNKNOWN ranks below LOW.
    pub fn rank(&self) -> u8 {
        match self {
            SeverityThreshold::Unknown => 0,
            SeverityThreshold::Low => 1,
            SeverityThreshold::Medium => 2,
            SeverityThreshold::High => 3,
            SeverityThreshold::Critical => 4,
        }
    }
}

impl Severity {
    /// Rank on the same scale as [`SeverityThreshold::rank`]; INFO ranks
    /// with UNKNOWN.
    pub fn threshold_rank(&self) -> u8 {
        match self {
            Severity::Info => 0,
            Severity::Low => 1,
            Severity::Medium => 2,
            Severity::High => 3,
            Severity::Critical => 4,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    Security,
    Compliance,
    Performance,
    Operations,
    Cost,
    Custom,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Category::Security => write!(f, "security"),
            Category::Compliance => write!(f, "compliance"),
            Category::Performance => write!(f, "performance"),
            Category::Operations => write!(f, "operations"),
            Category::Cost => write!(f, "cost"),
            Category::Custom => write!(f, "custom"),
        }
    }
}

impl std::str::FromStr for Category {
    type Err = String;
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "security" => Ok(Self::Security),
            "compliance" => Ok(Self::Compliance),
            "performance" => Ok(Self::Performance),
            "operations" => Ok(Self::Operations),
            "cost" => Ok(Self::Cost),
            "custom" => Ok(Self::Custom),
            other => Err(format!("unknown category: {other}")),
        }
    }
}

// --- Resource addressing ---

/// A {group, version, resource} triple. The empty group is the core API.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema, Default)]
pub struct GvrSpec {
    #[serde(default)]
    pub group: String,
    pub version: String,
    pub resource: String,
}

impl GvrSpec {
    pub fn new(group: &str, version: &str, resource: &str) -> Self {
        Self {
            group: group.to_string(),
            version: version.to_string(),
            resource: resource.to_string(),
        }
    }

    /// The canonical Observation triple — the default delivery target.
    pub fn observations() -> Self {
        Self::new(ZEN_GROUP, ZEN_VERSION, OBSERVATIONS_RESOURCE)
    }

    /// Parse `group/version/resource`; a leading empty group (`/v1/pods`)
    /// addresses the core API.
    pub fn parse(s: &str) -> Result<Self, ZenError> {
        let parts: Vec<&str> = s.split('/').collect();
        match parts.as_slice() {
            [group, version, resource] if !version.is_empty() && !resource.is_empty() => {
                Ok(Self::new(group, version, resource))
            }
            _ => Err(ZenError::Validation(format!(
                "invalid GVR '{s}', expected group/version/resource"
            ))),
        }
    }

    pub fn api_version(&self) -> String {
        if self.group.is_empty() {
            self.version.clone()
        } else {
            format!("{}/{}", self.group, self.version)
        }
    }

    /// Kind heuristic for dynamic access: singularize the plural resource
    /// and capitalize. Good enough for the CRD-backed classes the policy
    /// gate admits.
    pub fn kind_hint(&self) -> String {
        let singular = if let Some(stem) = self.resource.strip_suffix("ies") {
            format!("{stem}y")
        } else if let Some(stem) = self.resource.strip_suffix('s') {
            stem.to_string()
        } else {
            self.resource.clone()
        };
        let mut chars = singular.chars();
        match chars.next() {
            Some(first) => first.to_uppercase().collect::<String>() + chars.as_str(),
            None => singular,
        }
    }
}

impl std::fmt::Display for GvrSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}/{}", self.group, self.version, self.resource)
    }
}

/// Reference to the cluster object an Observation is about.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourceRef {
    pub api_version: String,
    pub kind: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

// --- Raw event envelope ---

/// Common envelope every source adapter emits. Immutable after emission and
/// self-contained: fingerprinting and normalization need no further I/O.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawEvent {
    /// Originating source name (DNS label).
    pub source: String,
    /// When the source observed the event.
    pub timestamp: DateTime<Utc>,
    /// Source-native fields, untouched.
    pub raw_data: serde_json::Map<String, serde_json::Value>,
    /// Adapter-attached metadata (watch event type, pod name, pattern id...).
    pub metadata: BTreeMap<String, String>,
}

impl RawEvent {
    pub fn new(source: &str, raw_data: serde_json::Map<String, serde_json::Value>) -> Self {
        Self {
            source: source.to_string(),
            timestamp: Utc::now(),
            raw_data,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_metadata(mut self, key: &str, value: &str) -> Self {
        self.metadata.insert(key.to_string(), value.to_string());
        self
    }

    /// Look up a value by slash-separated path into `raw_data`.
    pub fn lookup(&self, path: &str) -> Option<&serde_json::Value> {
        let mut parts = path.split('/').filter(|p| !p.is_empty());
        let first = parts.next()?;
        let mut current = self.raw_data.get(first)?;
        for part in parts {
            current = current.get(part)?;
        }
        Some(current)
    }
}

// --- Observation (canonical output) ---

/// `spec` of the written Observation resource.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObservationSpec {
    pub source: String,
    pub category: Category,
    pub severity: Severity,
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource: Option<ResourceRef>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub detected_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ttl_seconds_after_creation: Option<u64>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ObservationStatus {
    #[serde(default)]
    pub processed: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_processed_at: Option<DateTime<Utc>>,
}

// --- Source configuration (derived from an Ingester spec) ---

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "kebab-case")]
pub enum IngesterKind {
    Informer,
    Webhook,
    Logs,
    NativeEvents,
}

impl std::fmt::Display for IngesterKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            IngesterKind::Informer => write!(f, "informer"),
            IngesterKind::Webhook => write!(f, "webhook"),
            IngesterKind::Logs => write!(f, "logs"),
            IngesterKind::NativeEvents => write!(f, "native-events"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ProcessingOrder {
    #[default]
    FilterFirst,
    DedupFirst,
}

/// A delivery target. `value` is a short name resolved by the creator;
/// `gvr` addresses the triple explicitly. Exactly one should be set.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema, Default)]
#[serde(rename_all = "camelCase")]
pub struct Destination {
    /// Resource class. Only `crd` is accepted at ingress.
    #[serde(rename = "type")]
    pub class: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub value: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gvr: Option<GvrSpec>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub mapping: Option<NormalizationMapping>,
}

impl Destination {
    pub fn crd(value: &str) -> Self {
        Self {
            class: "crd".to_string(),
            value: Some(value.to_string()),
            gvr: None,
            mapping: None,
        }
    }

    pub fn is_crd(&self) -> bool {
        self.class == "crd"
    }
}

/// Projection of raw fields into canonical Observation fields.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NormalizationMapping {
    /// Category label for everything this destination receives.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub domain: Option<Category>,
    /// Event-type label (lower snake case).
    #[serde(default, rename = "type", skip_serializing_if = "Option::is_none")]
    pub event_type: Option<String>,
    /// Source severity string (case-insensitive) → canonical severity.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub severity_map: BTreeMap<String, Severity>,
    /// Canonical severity → priority weight in [0, 1].
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub priority: BTreeMap<Severity, f64>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<FieldMapping>,
    /// Template for the `details.message` field; `{path}` placeholders are
    /// resolved against raw data.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message_template: Option<String>,
    /// Raw paths the resource reference is extracted from.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resource_paths: Option<ResourcePaths>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FieldMapping {
    /// Slash-separated path into raw data.
    pub from: String,
    /// Slash-separated path into Observation `details`.
    pub to: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transform: Option<FieldTransform>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum FieldTransform {
    ToLower,
    ToUpper,
    ToString,
    Split { separator: String, index: usize },
    Join { separator: String },
}

/// Raw paths the normalizer reads a [`ResourceRef`] from.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResourcePaths {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub api_version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct FilterSpec {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_priority: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_severity: Option<SeverityThreshold>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub include_namespaces: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub exclude_namespaces: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum DedupStrategy {
    #[default]
    Fingerprint,
    Key,
    Hybrid,
    Adaptive,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct DedupSpec {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default)]
    pub strategy: DedupStrategy,
    /// Duration string (`60s`, `5m`, ...). `windowSeconds` wins when both
    /// are present.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub window_seconds: Option<u64>,
    /// Field paths hashed by the `key` strategy.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub fields: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub learning_rate: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub min_change: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub adaptive: Option<bool>,
    /// Cache entry cap before the oldest bucket is purged.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_entries: Option<usize>,
}

fn default_true() -> bool {
    true
}

impl Default for DedupSpec {
    fn default() -> Self {
        Self {
            enabled: true,
            strategy: DedupStrategy::default(),
            window: None,
            window_seconds: None,
            fields: Vec::new(),
            learning_rate: None,
            min_change: None,
            adaptive: None,
            max_entries: None,
        }
    }
}

impl DedupSpec {
    /// Effective window. `windowSeconds` is authoritative; the duration
    /// string is parsed otherwise; default 60 s.
    pub fn effective_window(&self) -> Result<std::time::Duration, ZenError> {
        if let Some(seconds) = self.window_seconds {
            validation::validate_ttl_seconds("windowSeconds", seconds)?;
            return Ok(std::time::Duration::from_secs(seconds));
        }
        match &self.window {
            Some(s) => validation::parse_duration(s),
            None => Ok(std::time::Duration::from_secs(60)),
        }
    }
}

// --- Kind-specific adapter parameters ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct InformerParams {
    pub gvr: GvrSpec,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub label_selector: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub field_selector: Option<String>,
    /// Duration string; differing from the shared default forces a
    /// dedicated informer factory for this triple.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resync_period: Option<String>,
    /// Emit events for deletions too. Default off.
    #[serde(default)]
    pub include_deletes: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "lowercase")]
pub enum WebhookAuthType {
    Bearer,
    Basic,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookAuth {
    #[serde(rename = "type")]
    pub auth_type: WebhookAuthType,
    pub secret_ref: SecretRef,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitSpec {
    pub requests_per_minute: u32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct WebhookParams {
    /// Route path, unique across sources.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub auth: Option<WebhookAuth>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<RateLimitSpec>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogPattern {
    pub regex: String,
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub priority: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct LogsParams {
    /// Label selector matching the pods to tail.
    pub pod_selector: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub container: Option<String>,
    pub patterns: Vec<LogPattern>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub since_seconds: Option<i64>,
    /// Duration string; default 30s.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub poll_interval: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NativeEventParams {
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub involved_object_kinds: Vec<String>,
}

// --- The assembled per-source snapshot ---

/// Immutable snapshot of everything one pipeline needs. Distributed by
/// value from the ingester store; never mutated in place.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SourceConfig {
    pub name: String,
    pub kind: IngesterKind,
    /// Ingester object this snapshot came from.
    pub owner: String,
    pub destinations: Vec<Destination>,
    pub filters: Option<FilterSpec>,
    pub deduplication: Option<DedupSpec>,
    #[serde(default)]
    pub order: ProcessingOrder,
    pub informer: Option<InformerParams>,
    pub webhook: Option<WebhookParams>,
    pub logs: Option<LogsParams>,
    pub k8s_events: Option<NativeEventParams>,
}

impl SourceConfig {
    /// The primary destination: first `crd` entry. Later entries are
    /// informational.
    pub fn primary_destination(&self) -> Option<&Destination> {
        self.destinations.iter().find(|d| d.is_crd())
    }

    /// Content hash identifying this exact configuration. A changed
    /// revision means stop-then-start, never in-place reconfiguration.
    pub fn revision(&self) -> String {
        let serialized = serde_json::to_vec(self).unwrap_or_default();
        let digest = Sha256::digest(&serialized);
        hex::encode(&digest[..8])
    }

    /// Structural validation applied at load. Rejections surface as a
    /// `ConfigInvalid` condition on the owning Ingester.
    pub fn validate(&self) -> Result<(), ZenError> {
        if !validation::is_valid_source_name(&self.name) {
            return Err(ZenError::Validation(format!(
                "source '{}' is not a DNS label",
                self.name
            )));
        }
        if self.destinations.is_empty() {
            return Err(ZenError::Validation(format!(
                "source '{}' has no destinations",
                self.name
            )));
        }
        for dest in &self.destinations {
            if !dest.is_crd() {
                return Err(ZenError::Validation(format!(
                    "source '{}': destination type '{}' is not supported",
                    self.name, dest.class
                )));
            }
            if let Some(value) = &dest.value {
                if !validation::is_valid_source_name(value) {
                    return Err(ZenError::Validation(format!(
                        "source '{}': destination value '{value}' is not a DNS label",
                        self.name
                    )));
                }
            }
        }
        if let Some(filters) = &self.filters {
            if let Some(p) = filters.min_priority {
                validation::validate_ratio("minPriority", p)?;
            }
        }
        if let Some(dedup) = &self.deduplication {
            dedup.effective_window()?;
            if let Some(r) = dedup.learning_rate {
                validation::validate_ratio("learningRate", r)?;
            }
            if let Some(c) = dedup.min_change {
                validation::validate_ratio("minChange", c)?;
            }
        }
        let params_present = match self.kind {
            IngesterKind::Informer => self.informer.is_some(),
            IngesterKind::Webhook => self.webhook.is_some(),
            IngesterKind::Logs => self.logs.is_some(),
            // Native events informer works unparameterized.
            IngesterKind::NativeEvents => true,
        };
        if !params_present {
            return Err(ZenError::Validation(format!(
                "source '{}' is kind {} but carries no {} block",
                self.name, self.kind, self.kind
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn make_config(name: &str) -> SourceConfig {
        SourceConfig {
            name: name.to_string(),
            kind: IngesterKind::Webhook,
            owner: "test-ingester".to_string(),
            destinations: vec![Destination::crd("observations")],
            filters: None,
            deduplication: None,
            order: ProcessingOrder::default(),
            informer: None,
            webhook: Some(WebhookParams {
                path: "/hooks/test".to_string(),
                auth: None,
                rate_limit: None,
            }),
            logs: None,
            k8s_events: None,
        }
    }

    #[test]
    fn severity_parse_is_case_insensitive() {
        assert_eq!(Severity::parse("critical"), Some(Severity::Critical));
        assert_eq!(Severity::parse("HiGh"), Some(Severity::High));
        assert_eq!(Severity::parse("nonsense"), None);
    }

    #[test]
    fn kind_hint_singularizes() {
        assert_eq!(GvrSpec::observations().kind_hint(), "Observation");
        assert_eq!(GvrSpec::new("", "v1", "events").kind_hint(), "Event");
        assert_eq!(GvrSpec::new("g", "v1", "policies").kind_hint(), "Policy");
    }

    #[test]
    fn gvr_parse_round_trips() {
        let gvr = GvrSpec::parse("apps/v1/deployments").unwrap();
        assert_eq!(gvr.group, "apps");
        assert_eq!(gvr.api_version(), "apps/v1");

        let core = GvrSpec::parse("/v1/pods").unwrap();
        assert_eq!(core.group, "");
        assert_eq!(core.api_version(), "v1");

        assert!(GvrSpec::parse("not-a-gvr").is_err());
    }

    #[test]
    fn raw_event_lookup_walks_nested_paths() {
        let mut data = serde_json::Map::new();
        data.insert(
            "vulnerability".to_string(),
            serde_json::json!({"id": "CVE-2024-1", "cvss": {"score": 9.8}}),
        );
        let event = RawEvent::new("trivy", data);
        assert_eq!(
            event.lookup("vulnerability/id").unwrap(),
            &serde_json::json!("CVE-2024-1")
        );
        assert_eq!(
            event.lookup("vulnerability/cvss/score").unwrap(),
            &serde_json::json!(9.8)
        );
        assert!(event.lookup("missing/path").is_none());
    }

    #[test]
    fn revision_changes_with_config() {
        let a = make_config("test");
        let mut b = a.clone();
        assert_eq!(a.revision(), b.revision());
        b.order = ProcessingOrder::DedupFirst;
        assert_ne!(a.revision(), b.revision());
    }

    #[test]
    fn validate_rejects_non_crd_destination() {
        let mut cfg = make_config("test");
        cfg.destinations = vec![Destination {
            class: "webhook".to_string(),
            value: None,
            gvr: None,
            mapping: None,
        }];
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_missing_kind_params() {
        let mut cfg = make_config("test");
        cfg.webhook = None;
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn validate_rejects_empty_destinations() {
        let mut cfg = make_config("test");
        cfg.destinations.clear();
        assert!(cfg.validate().is_err());
    }

    #[test]
    fn window_seconds_wins_over_duration_string() {
        let spec = DedupSpec {
            window: Some("5m".to_string()),
            window_seconds: Some(30),
            ..DedupSpec::default()
        };
        assert_eq!(
            spec.effective_window().unwrap(),
            std::time::Duration::from_secs(30)
        );
    }
}
