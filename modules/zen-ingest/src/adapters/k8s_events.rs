//! Native-events adapter: an informer over the core Event resource,
//! optionally restricted to involved-object kinds.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use zen_cluster::{InformerHub, SubscribeRequest, WatchKind};
use zen_common::{GvrSpec, RawEvent, SourceConfig, ZenError};

use crate::adapters::{offer, SourceAdapter, CHANNEL_CAPACITY, STOP_GRACE};
use crate::metrics::Metrics;

pub struct NativeEventsAdapter {
    hub: Arc<dyn InformerHub>,
    metrics: Metrics,
    namespace: String,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl NativeEventsAdapter {
    pub fn new(hub: Arc<dyn InformerHub>, metrics: Metrics, namespace: String) -> Self {
        Self {
            hub,
            metrics,
            namespace,
            cancel: None,
            task: None,
        }
    }
}

#[async_trait]
impl SourceAdapter for NativeEventsAdapter {
    async fn start(&mut self, config: &SourceConfig) -> Result<mpsc::Receiver<RawEvent>, ZenError> {
        let kinds: Vec<String> = config
            .k8s_events
            .as_ref()
            .map(|p| p.involved_object_kinds.clone())
            .unwrap_or_default();

        let subscription = self
            .hub
            .subscribe(SubscribeRequest {
                gvr: GvrSpec::new("", "v1", "events"),
                namespace: Some(self.namespace.clone()),
                label_selector: None,
                field_selector: None,
                resync: None,
            })
            .await?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let source = config.name.clone();
        let metrics = self.metrics.clone();
        let task_cancel = cancel.clone();

        let task = tokio::spawn(async move {
            // Keep the whole subscription alive: dropping its guard would
            // release the shared informer factory under us.
            let mut subscription = subscription;
            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    object_event = subscription.events.recv() => {
                        let Some(object_event) = object_event else { break };
                        if object_event.kind == WatchKind::Deleted {
                            continue;
                        }
                        let Some(raw) = to_raw_event(&source, &object_event.object, &kinds) else {
                            continue;
                        };
                        offer(&tx, raw, &metrics, &source);
                    }
                }
            }
            debug!(source = %source, "Native events producer stopped");
        });

        info!(source = %config.name, kinds = ?config.k8s_events.as_ref().map(|p| &p.involved_object_kinds), "Native events adapter started");
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

fn to_raw_event(
    source: &str,
    object: &kube::api::DynamicObject,
    kinds: &[String],
) -> Option<RawEvent> {
    let data = &object.data;
    let involved_kind = data
        .pointer("/involvedObject/kind")
        .and_then(|v| v.as_str())
        .unwrap_or_default();
    if !kinds.is_empty() && !kinds.iter().any(|k| k == involved_kind) {
        return None;
    }

    let mut raw_data = serde_json::Map::new();
    for key in ["reason", "message", "type", "count", "involvedObject"] {
        if let Some(value) = data.get(key) {
            raw_data.insert(key.to_string(), value.clone());
        }
    }
    // The native event severity maps from its type: Warning ranks above
    // Normal.
    let severity = match data.get("type").and_then(|v| v.as_str()) {
        Some("Warning") => "MEDIUM",
        _ => "INFO",
    };
    raw_data.insert("severity".to_string(), serde_json::json!(severity));
    if let Some(involved) = data.get("involvedObject") {
        raw_data.insert("resource".to_string(), involved.clone());
    }

    let event_type = data
        .get("reason")
        .and_then(|v| v.as_str())
        .unwrap_or("cluster_event");

    Some(
        RawEvent::new(source, raw_data)
            .with_metadata("event_type", &zen_common::coerce_event_type(event_type))
            .with_metadata("category", "operations"),
    )
}
