//! Mapping-driven projection of raw events into Observation candidates.
//!
//! Pure functions, no I/O. The severity/priority/namespace probes are also
//! used by the filter and dedup stages, which may run before normalization.

use std::str::FromStr;

use serde_json::Value;

use zen_common::{
    coerce_event_type, is_valid_event_type, Category, FieldTransform, NormalizationMapping,
    ObservationSpec, RawEvent, ResourceRef, Severity, ZenError,
};

/// Raw paths probed when the mapping names none.
const DEFAULT_SEVERITY_PATHS: &[&str] = &["severity", "priority", "level"];
const DEFAULT_TYPE_PATHS: &[&str] = &["eventType", "type", "reason"];

/// Resolve the canonical severity for a raw event. The mapping's
/// severityMap is consulted with case-insensitive keys; an unmapped or
/// missing raw severity resolves to MEDIUM.
pub fn resolve_severity(event: &RawEvent, mapping: Option<&NormalizationMapping>) -> Severity {
    let raw = DEFAULT_SEVERITY_PATHS
        .iter()
        .find_map(|path| event.lookup(path))
        .and_then(|v| v.as_str())
        .or_else(|| event.metadata.get("severity").map(String::as_str));

    let raw = match raw {
        Some(r) => r,
        None => return Severity::Medium,
    };

    if let Some(mapping) = mapping {
        if let Some(severity) = mapping
            .severity_map
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case(raw))
            .map(|(_, v)| *v)
        {
            return severity;
        }
    }
    Severity::parse(raw).unwrap_or(Severity::Medium)
}

/// Priority weight for a severity, from the mapping or the default table.
pub fn resolve_priority(severity: Severity, mapping: Option<&NormalizationMapping>) -> f64 {
    mapping
        .and_then(|m| m.priority.get(&severity).copied())
        .unwrap_or_else(|| severity.default_priority())
}

/// Namespace the event is about, for namespace filtering.
pub fn resolve_namespace(event: &RawEvent) -> Option<String> {
    event
        .lookup("resource/namespace")
        .or_else(|| event.lookup("metadata/namespace"))
        .or_else(|| event.lookup("namespace"))
        .and_then(|v| v.as_str())
        .map(str::to_string)
        .or_else(|| event.metadata.get("namespace").cloned())
}

/// Category for a raw event: the mapping's domain, else adapter metadata,
/// else `custom`.
pub fn resolve_category(event: &RawEvent, mapping: Option<&NormalizationMapping>) -> Category {
    mapping
        .and_then(|m| m.domain)
        .or_else(|| {
            event
                .metadata
                .get("category")
                .and_then(|c| Category::from_str(c).ok())
        })
        .unwrap_or(Category::Custom)
}

/// Project a raw event into an Observation spec.
pub fn normalize(
    event: &RawEvent,
    mapping: Option<&NormalizationMapping>,
) -> Result<ObservationSpec, ZenError> {
    let category = resolve_category(event, mapping);

    let event_type = resolve_event_type(event, mapping)?;
    let severity = resolve_severity(event, mapping);

    // Details start as the untouched source payload; field mappings project
    // on top of it.
    let mut details = serde_json::Map::new();
    for (key, value) in &event.raw_data {
        details.insert(key.clone(), value.clone());
    }
    if let Some(mapping) = mapping {
        for field in &mapping.fields {
            let Some(value) = event.lookup(&field.from) else {
                continue;
            };
            let value = apply_transform(value, field.transform.as_ref());
            insert_at_path(&mut details, &field.to, value);
        }
        if let Some(template) = &mapping.message_template {
            let message = render_template(template, event);
            details.insert("message".to_string(), Value::String(message));
        }
    }

    let resource = extract_resource(event, mapping);

    let mut spec = ObservationSpec {
        source: event.source.clone(),
        category,
        severity,
        event_type,
        resource,
        details: if details.is_empty() {
            None
        } else {
            Some(Value::Object(details))
        },
        detected_at: Some(event.timestamp),
        ttl_seconds_after_creation: event
            .lookup("ttlSecondsAfterCreation")
            .and_then(|v| v.as_u64()),
    };

    // Drop empty optionals so the written object stays lean.
    if let Some(r) = &spec.resource {
        if r.name.is_empty() {
            spec.resource = None;
        }
    }
    Ok(spec)
}

/// Event-type label: the mapping's `type` (validated), else a coerced raw
/// field.
pub fn resolve_event_type(
    event: &RawEvent,
    mapping: Option<&NormalizationMapping>,
) -> Result<String, ZenError> {
    if let Some(event_type) = mapping.and_then(|m| m.event_type.as_deref()) {
        if !is_valid_event_type(event_type) {
            return Err(ZenError::Validation(format!(
                "mapping type '{event_type}' is not lower snake case"
            )));
        }
        return Ok(event_type.to_string());
    }
    let raw = DEFAULT_TYPE_PATHS
        .iter()
        .find_map(|path| event.lookup(path))
        .and_then(|v| v.as_str())
        .or_else(|| event.metadata.get("event_type").map(String::as_str))
        .unwrap_or("unknown");
    Ok(coerce_event_type(raw))
}

fn extract_resource(
    event: &RawEvent,
    mapping: Option<&NormalizationMapping>,
) -> Option<ResourceRef> {
    if let Some(paths) = mapping.and_then(|m| m.resource_paths.as_ref()) {
        let read = |path: &Option<String>| {
            path.as_deref()
                .and_then(|p| event.lookup(p))
                .and_then(|v| v.as_str())
                .map(str::to_string)
        };
        let name = read(&paths.name)?;
        return Some(ResourceRef {
            api_version: read(&paths.api_version).unwrap_or_else(|| "v1".to_string()),
            kind: read(&paths.kind).unwrap_or_else(|| "Unknown".to_string()),
            name,
            namespace: read(&paths.namespace),
        });
    }

    let resource = event.lookup("resource")?;
    let name = resource.get("name")?.as_str()?.to_string();
    Some(ResourceRef {
        api_version: resource
            .get("apiVersion")
            .and_then(|v| v.as_str())
            .unwrap_or("v1")
            .to_string(),
        kind: resource
            .get("kind")
            .and_then(|v| v.as_str())
            .unwrap_or("Unknown")
            .to_string(),
        name,
        namespace: resource
            .get("namespace")
            .and_then(|v| v.as_str())
            .map(str::to_string),
    })
}

fn apply_transform(value: &Value, transform: Option<&FieldTransform>) -> Value {
    let Some(transform) = transform else {
        return value.clone();
    };
    match transform {
        FieldTransform::ToLower => match value.as_str() {
            Some(s) => Value::String(s.to_lowercase()),
            None => value.clone(),
        },
        FieldTransform::ToUpper => match value.as_str() {
            Some(s) => Value::String(s.to_uppercase()),
            None => value.clone(),
        },
        FieldTransform::ToString => match value {
            Value::String(_) => value.clone(),
            other => Value::String(other.to_string()),
        },
        FieldTransform::Split { separator, index } => match value.as_str() {
            Some(s) => s
                .split(separator.as_str())
                .nth(*index)
                .map(|part| Value::String(part.to_string()))
                .unwrap_or(Value::Null),
            None => value.clone(),
        },
        FieldTransform::Join { separator } => match value.as_array() {
            Some(items) => Value::String(
                items
                    .iter()
                    .map(|v| v.as_str().map(str::to_string).unwrap_or_else(|| v.to_string()))
                    .collect::<Vec<_>>()
                    .join(separator),
            ),
            None => value.clone(),
        },
    }
}

fn insert_at_path(target: &mut serde_json::Map<String, Value>, path: &str, value: Value) {
    let parts: Vec<&str> = path.split('/').filter(|p| !p.is_empty()).collect();
    if parts.is_empty() {
        return;
    }
    let mut current = target;
    for part in &parts[..parts.len() - 1] {
        let entry = current
            .entry(part.to_string())
            .or_insert_with(|| Value::Object(serde_json::Map::new()));
        if !entry.is_object() {
            *entry = Value::Object(serde_json::Map::new());
        }
        current = entry.as_object_mut().expect("just ensured object");
    }
    current.insert(parts[parts.len() - 1].to_string(), value);
}

/// Replace `{path}` placeholders with values looked up in raw data.
fn render_template(template: &str, event: &RawEvent) -> String {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        out.push_str(&rest[..open]);
        match rest[open..].find('}') {
            Some(close) => {
                let path = &rest[open + 1..open + close];
                match event.lookup(path) {
                    Some(Value::String(s)) => out.push_str(s),
                    Some(other) => out.push_str(&other.to_string()),
                    None => {}
                }
                rest = &rest[open + close + 1..];
            }
            None => {
                out.push_str(&rest[open..]);
                rest = "";
            }
        }
    }
    out.push_str(rest);
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn event_with(fields: serde_json::Value) -> RawEvent {
        let map = fields.as_object().cloned().unwrap_or_default();
        RawEvent::new("trivy", map)
    }

    fn severity_mapping() -> NormalizationMapping {
        let mut severity_map = BTreeMap::new();
        severity_map.insert("crit".to_string(), Severity::Critical);
        severity_map.insert("warn".to_string(), Severity::Low);
        NormalizationMapping {
            domain: Some(Category::Security),
            event_type: Some("image_vulnerability".to_string()),
            severity_map,
            ..NormalizationMapping::default()
        }
    }

    #[test]
    fn severity_map_is_case_insensitive_and_defaults_medium() {
        let mapping = severity_mapping();
        let event = event_with(serde_json::json!({"severity": "CRIT"}));
        assert_eq!(resolve_severity(&event, Some(&mapping)), Severity::Critical);

        let event = event_with(serde_json::json!({"severity": "unheard-of"}));
        assert_eq!(resolve_severity(&event, Some(&mapping)), Severity::Medium);

        let event = event_with(serde_json::json!({}));
        assert_eq!(resolve_severity(&event, Some(&mapping)), Severity::Medium);
    }

    #[test]
    fn canonical_severity_parses_without_mapping() {
        let event = event_with(serde_json::json!({"severity": "HIGH"}));
        assert_eq!(resolve_severity(&event, None), Severity::High);
    }

    #[test]
    fn normalize_applies_mapping_fields_and_transforms() {
        let mut mapping = severity_mapping();
        mapping.fields = vec![
            zen_common::FieldMapping {
                from: "image/name".to_string(),
                to: "image".to_string(),
                transform: Some(FieldTransform::ToLower),
            },
            zen_common::FieldMapping {
                from: "image/name".to_string(),
                to: "registry".to_string(),
                transform: Some(FieldTransform::Split {
                    separator: "/".to_string(),
                    index: 0,
                }),
            },
        ];
        let event = event_with(serde_json::json!({
            "severity": "crit",
            "image": {"name": "GHCR.io/acme/app"},
        }));
        let spec = normalize(&event, Some(&mapping)).unwrap();
        assert_eq!(spec.category, Category::Security);
        assert_eq!(spec.event_type, "image_vulnerability");
        assert_eq!(spec.severity, Severity::Critical);
        let details = spec.details.unwrap();
        assert_eq!(details["image"], "ghcr.io/acme/app");
        assert_eq!(details["registry"], "GHCR.io");
    }

    #[test]
    fn normalize_extracts_resource_block() {
        let event = event_with(serde_json::json!({
            "resource": {"apiVersion": "apps/v1", "kind": "Deployment", "name": "web", "namespace": "prod"},
        }));
        let spec = normalize(&event, None).unwrap();
        let resource = spec.resource.unwrap();
        assert_eq!(resource.kind, "Deployment");
        assert_eq!(resource.namespace.as_deref(), Some("prod"));
    }

    #[test]
    fn normalize_is_fixed_point_on_canonical_input() {
        let event = event_with(serde_json::json!({
            "severity": "HIGH",
            "eventType": "pod_crash_loop",
        }));
        let first = normalize(&event, None).unwrap();

        // Re-normalizing an event carrying the canonical fields yields the
        // same projection.
        let mut raw = serde_json::Map::new();
        raw.insert("severity".to_string(), serde_json::json!(first.severity.to_string()));
        raw.insert("eventType".to_string(), serde_json::json!(first.event_type.clone()));
        let mut second_event = RawEvent::new(&event.source, raw);
        second_event.timestamp = event.timestamp;
        let second = normalize(&second_event, None).unwrap();

        assert_eq!(first.severity, second.severity);
        assert_eq!(first.event_type, second.event_type);
        assert_eq!(first.category, second.category);
    }

    #[test]
    fn invalid_mapping_type_is_rejected() {
        let mut mapping = severity_mapping();
        mapping.event_type = Some("Not-Snake".to_string());
        let event = event_with(serde_json::json!({}));
        assert!(normalize(&event, Some(&mapping)).is_err());
    }

    #[test]
    fn message_template_renders_paths() {
        let mut mapping = severity_mapping();
        mapping.message_template = Some("{vuln/id} in {image}".to_string());
        let event = event_with(serde_json::json!({
            "vuln": {"id": "CVE-2024-9"},
            "image": "acme/app",
        }));
        let spec = normalize(&event, Some(&mapping)).unwrap();
        assert_eq!(spec.details.unwrap()["message"], "CVE-2024-9 in acme/app");
    }
}
