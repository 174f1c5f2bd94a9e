//! The keep/drop decision for one event against the merged filter config.
//!
//! Rule order: global namespace exclude > global namespace include >
//! per-source exclude > per-source include > min-severity > min-priority >
//! expression. An event passes iff no rule drops it.

use std::sync::{Arc, RwLock};

use zen_common::{FilterSpec, RawEvent, Severity};

/// Process-wide namespace rules, reloaded hot by the config loader.
#[derive(Debug, Clone, Default)]
pub struct GlobalFilterConfig {
    pub include_namespaces: Vec<String>,
    pub exclude_namespaces: Vec<String>,
}

/// Optional expression-level hook. The grammar lives outside the core; the
/// filter only evaluates the compiled predicate.
pub type ExpressionRule = Arc<dyn Fn(&RawEvent) -> bool + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterDecision {
    Pass,
    Drop(&'static str),
}

impl FilterDecision {
    pub fn is_drop(&self) -> bool {
        matches!(self, FilterDecision::Drop(_))
    }

    pub fn reason(&self) -> Option<&'static str> {
        match self {
            FilterDecision::Pass => None,
            FilterDecision::Drop(reason) => Some(reason),
        }
    }
}

struct FilterState {
    global: GlobalFilterConfig,
    expression: Option<ExpressionRule>,
}

/// Shared filter. Readers take one consistent snapshot per event; updates
/// swap the whole state and never apply partially.
pub struct EventFilter {
    state: RwLock<Arc<FilterState>>,
}

impl EventFilter {
    pub fn new(global: GlobalFilterConfig) -> Self {
        Self {
            state: RwLock::new(Arc::new(FilterState {
                global,
                expression: None,
            })),
        }
    }

    /// Hot reload. In-flight evaluations keep the snapshot they started
    /// with.
    pub fn update_config(&self, global: GlobalFilterConfig) {
        let expression = self.state.read().expect("filter lock").expression.clone();
        *self.state.write().expect("filter lock") = Arc::new(FilterState { global, expression });
    }

    pub fn set_expression(&self, expression: Option<ExpressionRule>) {
        let global = self.state.read().expect("filter lock").global.clone();
        *self.state.write().expect("filter lock") = Arc::new(FilterState { global, expression });
    }

    /// Evaluate one event. `severity` and `priority` are the probed values
    /// for the event; `namespace` is the namespace the event is about, when
    /// it has one.
    pub fn evaluate(
        &self,
        event: &RawEvent,
        source_filters: Option<&FilterSpec>,
        severity: Severity,
        priority: f64,
        namespace: Option<&str>,
    ) -> FilterDecision {
        let state = self.state.read().expect("filter lock").clone();

        if let Some(ns) = namespace {
            if state.global.exclude_namespaces.iter().any(|n| n == ns) {
                return FilterDecision::Drop("namespace_excluded");
            }
            if !state.global.include_namespaces.is_empty()
                && !state.global.include_namespaces.iter().any(|n| n == ns)
            {
                return FilterDecision::Drop("namespace_not_included");
            }
        }

        if let Some(filters) = source_filters {
            if let Some(ns) = namespace {
                if filters.exclude_namespaces.iter().any(|n| n == ns) {
                    return FilterDecision::Drop("namespace_excluded");
                }
                if !filters.include_namespaces.is_empty()
                    && !filters.include_namespaces.iter().any(|n| n == ns)
                {
                    return FilterDecision::Drop("namespace_not_included");
                }
            }
            if let Some(min) = filters.min_severity {
                if severity.threshold_rank() < min.rank() {
                    return FilterDecision::Drop("min_severity");
                }
            }
            if let Some(min) = filters.min_priority {
                if priority < min {
                    return FilterDecision::Drop("min_priority");
                }
            }
        }

        if let Some(expression) = &state.expression {
            if !expression(event) {
                return FilterDecision::Drop("expression");
            }
        }

        FilterDecision::Pass
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zen_common::SeverityThreshold;

    fn event() -> RawEvent {
        RawEvent::new("test", serde_json::Map::new())
    }

    fn filters(min_severity: Option<SeverityThreshold>) -> FilterSpec {
        FilterSpec {
            min_severity,
            ..FilterSpec::default()
        }
    }

    #[test]
    fn min_severity_drops_below_threshold() {
        let filter = EventFilter::new(GlobalFilterConfig::default());
        let spec = filters(Some(SeverityThreshold::High));

        let high = filter.evaluate(&event(), Some(&spec), Severity::High, 0.8, None);
        assert_eq!(high, FilterDecision::Pass);

        let low = filter.evaluate(&event(), Some(&spec), Severity::Low, 0.3, None);
        assert_eq!(low, FilterDecision::Drop("min_severity"));
    }

    #[test]
    fn global_exclude_wins_over_source_include() {
        let filter = EventFilter::new(GlobalFilterConfig {
            include_namespaces: vec![],
            exclude_namespaces: vec!["kube-system".to_string()],
        });
        let spec = FilterSpec {
            include_namespaces: vec!["kube-system".to_string()],
            ..FilterSpec::default()
        };
        let decision =
            filter.evaluate(&event(), Some(&spec), Severity::High, 0.8, Some("kube-system"));
        assert_eq!(decision, FilterDecision::Drop("namespace_excluded"));
    }

    #[test]
    fn include_list_restricts_when_non_empty() {
        let filter = EventFilter::new(GlobalFilterConfig::default());
        let spec = FilterSpec {
            include_namespaces: vec!["prod".to_string()],
            ..FilterSpec::default()
        };
        assert_eq!(
            filter.evaluate(&event(), Some(&spec), Severity::High, 0.8, Some("prod")),
            FilterDecision::Pass
        );
        assert_eq!(
            filter.evaluate(&event(), Some(&spec), Severity::High, 0.8, Some("dev")),
            FilterDecision::Drop("namespace_not_included")
        );
        // Events without a namespace are not subject to namespace rules.
        assert_eq!(
            filter.evaluate(&event(), Some(&spec), Severity::High, 0.8, None),
            FilterDecision::Pass
        );
    }

    #[test]
    fn min_priority_drops_below_threshold() {
        let filter = EventFilter::new(GlobalFilterConfig::default());
        let spec = FilterSpec {
            min_priority: Some(0.5),
            ..FilterSpec::default()
        };
        assert!(filter
            .evaluate(&event(), Some(&spec), Severity::Low, 0.3, None)
            .is_drop());
        assert_eq!(
            filter.evaluate(&event(), Some(&spec), Severity::Medium, 0.5, None),
            FilterDecision::Pass
        );
    }

    #[test]
    fn expression_rule_is_last() {
        let filter = EventFilter::new(GlobalFilterConfig::default());
        filter.set_expression(Some(Arc::new(|e: &RawEvent| e.source != "noisy")));
        let mut noisy = event();
        noisy.source = "noisy".to_string();
        assert_eq!(
            filter.evaluate(&noisy, None, Severity::High, 0.8, None),
            FilterDecision::Drop("expression")
        );
    }

    #[test]
    fn hot_reload_swaps_whole_config() {
        let filter = EventFilter::new(GlobalFilterConfig::default());
        assert_eq!(
            filter.evaluate(&event(), None, Severity::High, 0.8, Some("dev")),
            FilterDecision::Pass
        );
        filter.update_config(GlobalFilterConfig {
            include_namespaces: vec![],
            exclude_namespaces: vec!["dev".to_string()],
        });
        assert!(filter
            .evaluate(&event(), None, Severity::High, 0.8, Some("dev"))
            .is_drop());
    }
}
