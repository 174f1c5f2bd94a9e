//! Logs adapter: polls container logs and turns pattern matches into raw
//! events.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use zen_cluster::LogFetcher;
use zen_common::{parse_duration, LogPattern, RawEvent, SourceConfig, ZenError};

use crate::adapters::{offer, SourceAdapter, CHANNEL_CAPACITY, STOP_GRACE};
use crate::metrics::Metrics;

const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(30);

pub struct LogsAdapter {
    fetcher: Arc<dyn LogFetcher>,
    metrics: Metrics,
    namespace: String,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl LogsAdapter {
    pub fn new(fetcher: Arc<dyn LogFetcher>, metrics: Metrics, namespace: String) -> Self {
        Self {
            fetcher,
            metrics,
            namespace,
            cancel: None,
            task: None,
        }
    }
}

struct CompiledPattern {
    regex: Regex,
    event_type: String,
    priority: Option<f64>,
}

#[async_trait]
impl SourceAdapter for LogsAdapter {
    async fn start(&mut self, config: &SourceConfig) -> Result<mpsc::Receiver<RawEvent>, ZenError> {
        let params = config.logs.clone().ok_or_else(|| {
            ZenError::Validation(format!("source '{}' has no logs block", config.name))
        })?;
        let patterns = compile_patterns(&params.patterns)?;
        let poll_interval = params
            .poll_interval
            .as_deref()
            .map(parse_duration)
            .transpose()?
            .unwrap_or(DEFAULT_POLL_INTERVAL);
        // The fetch window matches the poll cadence so lines are seen about
        // once; the dedup stage absorbs the overlap.
        let since_seconds = params
            .since_seconds
            .unwrap_or(poll_interval.as_secs() as i64 + 1);

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let fetcher = self.fetcher.clone();
        let metrics = self.metrics.clone();
        let namespace = self.namespace.clone();
        let source = config.name.clone();
        let task_cancel = cancel.clone();
        let pod_selector = params.pod_selector.clone();

        let task = tokio::spawn(async move {
            let mut tick = tokio::time::interval(poll_interval);
            tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = tick.tick() => {}
                }

                let pods = match fetcher.list_pods(&namespace, &params.pod_selector).await {
                    Ok(pods) => pods,
                    Err(e) => {
                        warn!(source = %source, error = %e, "Pod listing failed");
                        continue;
                    }
                };
                for pod in pods {
                    if task_cancel.is_cancelled() {
                        break;
                    }
                    let logs = match fetcher
                        .fetch_logs(&namespace, &pod, params.container.as_deref(), Some(since_seconds))
                        .await
                    {
                        Ok(logs) => logs,
                        Err(e) => {
                            warn!(source = %source, pod = %pod, error = %e, "Log fetch failed");
                            continue;
                        }
                    };
                    for line in logs.lines() {
                        for pattern in &patterns {
                            if pattern.regex.is_match(line) {
                                let event = match_to_event(&source, &pod, line, pattern, &params);
                                offer(&tx, event, &metrics, &source);
                                break;
                            }
                        }
                    }
                }
            }
            debug!(source = %source, "Logs adapter producer stopped");
        });

        info!(source = %config.name, selector = %pod_selector, "Logs adapter started");
        self.cancel = Some(cancel);
        self.task = Some(task);
        Ok(rx)
    }

    async fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            cancel.cancel();
        }
        if let Some(task) = self.task.take() {
            let _ = tokio::time::timeout(STOP_GRACE, task).await;
        }
    }
}

fn compile_patterns(patterns: &[LogPattern]) -> Result<Vec<CompiledPattern>, ZenError> {
    patterns
        .iter()
        .map(|p| {
            let regex = Regex::new(&p.regex).map_err(|e| {
                ZenError::Validation(format!("invalid log pattern '{}': {e}", p.regex))
            })?;
            Ok(CompiledPattern {
                regex,
                event_type: p.event_type.clone(),
                priority: p.priority,
            })
        })
        .collect()
}

fn match_to_event(
    source: &str,
    pod: &str,
    line: &str,
    pattern: &CompiledPattern,
    params: &zen_common::LogsParams,
) -> RawEvent {
    let mut raw_data = serde_json::Map::new();
    raw_data.insert("message".to_string(), serde_json::json!(line));
    raw_data.insert("pod".to_string(), serde_json::json!(pod));
    if let Some(container) = &params.container {
        raw_data.insert("container".to_string(), serde_json::json!(container));
    }
    if let Some(priority) = pattern.priority {
        raw_data.insert("priority".to_string(), serde_json::json!(priority));
    }
    RawEvent::new(source, raw_data).with_metadata("event_type", &pattern.event_type)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bad_regex_fails_start_validation() {
        let patterns = vec![LogPattern {
            regex: "([unclosed".to_string(),
            event_type: "broken".to_string(),
            priority: None,
        }];
        assert!(compile_patterns(&patterns).is_err());
    }

    #[test]
    fn matched_line_carries_pattern_type() {
        let patterns = compile_patterns(&[LogPattern {
            regex: "(?i)panic".to_string(),
            event_type: "app_panic".to_string(),
            priority: Some(0.9),
        }])
        .unwrap();
        let params = zen_common::LogsParams {
            pod_selector: "app=web".to_string(),
            container: Some("web".to_string()),
            patterns: vec![],
            since_seconds: None,
            poll_interval: None,
        };
        let event = match_to_event("applogs", "web-0", "PANIC: oh no", &patterns[0], &params);
        assert_eq!(event.metadata["event_type"], "app_panic");
        assert_eq!(event.raw_data["pod"], "web-0");
        assert_eq!(event.raw_data["priority"], 0.9);
    }
}
