//! Informer adapter: a typed watch on one resource class, shared through the
//! informer manager.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use zen_cluster::{InformerHub, ObjectEvent, SubscribeRequest, WatchKind};
use zen_common::{parse_duration, RawEvent, SourceConfig, ZenError};

use crate::adapters::{offer, SourceAdapter, CHANNEL_CAPACITY, STOP_GRACE};
use crate::metrics::Metrics;

pub struct InformerAdapter {
    hub: Arc<dyn InformerHub>,
    metrics: Metrics,
    cancel: Option<CancellationToken>,
    task: Option<JoinHandle<()>>,
}

impl InformerAdapter {
    pub fn new(hub: Arc<dyn InformerHub>, metrics: Metrics) -> Self {
        Self {
            hub,
            metrics,
            cancel: None,
            task: None,
        }
    }
}

#[async_trait]
impl SourceAdapter for InformerAdapter {
    async fn start(&mut self, config: &SourceConfig) -> Result<mpsc::Receiver<RawEvent>, ZenError> {
        let params = config.informer.clone().ok_or_else(|| {
            ZenError::Validation(format!("source '{}' has no informer block", config.name))
        })?;
        let resync = params
            .resync_period
            .as_deref()
            .map(parse_duration)
            .transpose()?;

        let subscription = self
            .hub
            .subscribe(SubscribeRequest {
                gvr: params.gvr.clone(),
                namespace: params.namespace.clone(),
                label_selector: params.label_selector.clone(),
                field_selector: params.field_selector.clone(),
                resync,
            })
            .await?;

        let (tx, rx) = mpsc::channel(CHANNEL_CAPACITY);
        let cancel = CancellationToken::new();
        let source = config.name.clone();
        let metrics = self.metrics.clone();
        let include_deletes = params.include_deletes;
        let gvr = params.gvr.clone();
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
                        if object_event.kind == WatchKind::Deleted && !include_deletes {
                            continue;
                        }
                        let raw = to_raw_event(&source, &gvr.to_string(), &object_event);
                        offer(&tx, raw, &metrics, &source);
                    }
                }
            }
            // tx drops here: channel closes exactly once.
            debug!(source = %source, "Informer adapter producer stopped");
        });

        info!(source = %config.name, gvr = %params.gvr, "Informer adapter started");
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

fn to_raw_event(source: &str, gvr: &str, object_event: &ObjectEvent) -> RawEvent {
    let raw_data = serde_json::to_value(object_event.object.as_ref())
        .ok()
        .and_then(|v| v.as_object().cloned())
        .unwrap_or_default();
    let kind = match object_event.kind {
        WatchKind::Added => "added",
        WatchKind::Modified => "modified",
        WatchKind::Deleted => "deleted",
    };
    RawEvent::new(source, raw_data)
        .with_metadata("watch_event", kind)
        .with_metadata("gvr", gvr)
}
