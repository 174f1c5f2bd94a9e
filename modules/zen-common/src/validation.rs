//! Field validators shared by admission, the ingester store, and migration.

use std::sync::LazyLock;
use std::time::Duration;

use regex::Regex;

use crate::error::ZenError;

static SOURCE_NAME_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9-]+$").unwrap());
static EVENT_TYPE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[a-z0-9_]+$").unwrap());
static DURATION_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^([0-9]+)(ns|us|µs|ms|s|m|h)$").unwrap());

/// Seconds in a (non-leap) year. Upper bound for every TTL and dedup window.
pub const MAX_TTL_SECONDS: u64 = 31_536_000;

/// A source name is a DNS label: lowercase alphanumerics and hyphens.
pub fn is_valid_source_name(name: &str) -> bool {
    !name.is_empty() && name.len() <= 63 && SOURCE_NAME_RE.is_match(name)
}

/// Event types are lower snake case.
pub fn is_valid_event_type(event_type: &str) -> bool {
    !event_type.is_empty() && EVENT_TYPE_RE.is_match(event_type)
}

/// Coerce an arbitrary label into a valid event type: lowercase, runs of
/// non-alphanumerics become single underscores.
pub fn coerce_event_type(raw: &str) -> String {
    let lowered = raw.to_lowercase();
    let cleaned: String = lowered
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c } else { ' ' })
        .collect();
    let coerced = cleaned.split_whitespace().collect::<Vec<&str>>().join("_");
    if coerced.is_empty() {
        "unknown".to_string()
    } else {
        coerced
    }
}

/// Parse a duration string of the form `<digits><unit>` with unit in
/// ns/us/µs/ms/s/m/h.
pub fn parse_duration(s: &str) -> Result<Duration, ZenError> {
    let caps = DURATION_RE
        .captures(s)
        .ok_or_else(|| ZenError::Validation(format!("invalid duration '{s}'")))?;
    let amount: u64 = caps[1]
        .parse()
        .map_err(|_| ZenError::Validation(format!("invalid duration amount in '{s}'")))?;
    let duration = match &caps[2] {
        "ns" => Duration::from_nanos(amount),
        "us" | "µs" => Duration::from_micros(amount),
        "ms" => Duration::from_millis(amount),
        "s" => Duration::from_secs(amount),
        "m" => Duration::from_secs(amount * 60),
        "h" => Duration::from_secs(amount * 3600),
        unit => return Err(ZenError::Validation(format!("unknown duration unit '{unit}'"))),
    };
    Ok(duration)
}

/// Ratios (learningRate, minChange, minPriority) live in [0, 1].
pub fn validate_ratio(field: &str, value: f64) -> Result<(), ZenError> {
    if !(0.0..=1.0).contains(&value) {
        return Err(ZenError::Validation(format!(
            "{field} must be in [0, 1], got {value}"
        )));
    }
    Ok(())
}

/// TTLs and dedup windows are bounded to [1, one year] seconds.
pub fn validate_ttl_seconds(field: &str, value: u64) -> Result<(), ZenError> {
    if value < 1 || value > MAX_TTL_SECONDS {
        return Err(ZenError::Validation(format!(
            "{field} must be in [1, {MAX_TTL_SECONDS}], got {value}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_names() {
        assert!(is_valid_source_name("trivy"));
        assert!(is_valid_source_name("kyverno-audit-2"));
        assert!(!is_valid_source_name("Trivy"));
        assert!(!is_valid_source_name("audit_pipeline"));
        assert!(!is_valid_source_name(""));
    }

    #[test]
    fn event_types() {
        assert!(is_valid_event_type("pod_oom_killed"));
        assert!(is_valid_event_type("cve2024"));
        assert!(!is_valid_event_type("Pod-OOM"));
        assert!(!is_valid_event_type(""));
    }

    #[test]
    fn event_type_coercion() {
        assert_eq!(coerce_event_type("Pod OOM-Killed"), "pod_oom_killed");
        assert_eq!(coerce_event_type("CVE-2024-1234"), "cve_2024_1234");
        assert_eq!(coerce_event_type("---"), "unknown");
    }

    #[test]
    fn durations() {
        assert_eq!(parse_duration("60s").unwrap(), Duration::from_secs(60));
        assert_eq!(parse_duration("5m").unwrap(), Duration::from_secs(300));
        assert_eq!(parse_duration("2h").unwrap(), Duration::from_secs(7200));
        assert_eq!(parse_duration("250ms").unwrap(), Duration::from_millis(250));
        assert!(parse_duration("1d").is_err());
        assert!(parse_duration("60").is_err());
        assert!(parse_duration("s").is_err());
    }

    #[test]
    fn ratios_and_ttls() {
        assert!(validate_ratio("minPriority", 0.5).is_ok());
        assert!(validate_ratio("minPriority", 1.5).is_err());
        assert!(validate_ttl_seconds("ttl", 1).is_ok());
        assert!(validate_ttl_seconds("ttl", 0).is_err());
        assert!(validate_ttl_seconds("ttl", MAX_TTL_SECONDS + 1).is_err());
    }
}
