//! Leader-gated garbage collection of expired Observations.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use zen_cluster::{LeaderElection, ObservationJanitor};
use zen_common::ZenError;
use zen_ingest::Metrics;

/// Parallel delete calls per sweep.
const DELETE_CONCURRENCY: usize = 8;

pub struct GarbageCollector {
    janitor: Arc<dyn ObservationJanitor>,
    namespaces: Vec<String>,
    interval: Duration,
    metrics: Metrics,
}

impl GarbageCollector {
    pub fn new(
        janitor: Arc<dyn ObservationJanitor>,
        namespaces: Vec<String>,
        interval: Duration,
        metrics: Metrics,
    ) -> Self {
        Self {
            janitor,
            namespaces,
            interval,
            metrics,
        }
    }

    /// Run sweeps until cancelled. Blocks for leadership first; a follower
    /// deletes nothing.
    pub async fn run(
        &self,
        election: Arc<dyn LeaderElection>,
        cancel: CancellationToken,
    ) -> Result<(), ZenError> {
        let mut leadership = election.lead(&cancel).await?;
        info!(interval = ?self.interval, "Garbage collector started");

        let mut tick = tokio::time::interval(self.interval);
        tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        tick.tick().await; // the sweep waits one full interval after boot

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return Ok(()),
                changed = leadership.changed() => {
                    if changed.is_err() || !*leadership.borrow() {
                        warn!("Leadership lost, garbage collector stopping");
                        return Ok(());
                    }
                }
                _ = tick.tick() => {
                    if let Err(e) = self.sweep(Utc::now()).await {
                        self.metrics.gc_errors_total.inc();
                        warn!(error = %e, "Garbage collection sweep failed");
                    }
                }
            }
        }
    }

    /// One sweep: list, pick expired, delete with bounded concurrency.
    pub async fn sweep(&self, now: DateTime<Utc>) -> Result<u64, ZenError> {
        self.metrics.gc_runs_total.inc();
        let timer = self
            .metrics
            .gc_duration_seconds
            .with_label_values::<&str>(&[])
            .start_timer();

        let mut deleted = 0u64;
        for namespace in &self.namespaces {
            let records = self.janitor.list(namespace).await?;
            let expired: Vec<_> = records
                .into_iter()
                .filter(|r| {
                    r.ttl_seconds
                        .map(|ttl| r.created_at + chrono::Duration::seconds(ttl as i64) < now)
                        .unwrap_or(false)
                })
                .collect();

            let results = stream::iter(expired)
                .map(|record| {
                    let janitor = self.janitor.clone();
                    async move {
                        let result = janitor.delete(&record.namespace, &record.name).await;
                        (record, result)
                    }
                })
                .buffer_unordered(DELETE_CONCURRENCY)
                .collect::<Vec<_>>()
                .await;

            for (record, result) in results {
                match result {
                    Ok(()) => {
                        deleted += 1;
                        self.metrics.observations_deleted_total.inc();
                    }
                    Err(e) => {
                        self.metrics.gc_errors_total.inc();
                        warn!(
                            namespace = %record.namespace,
                            name = %record.name,
                            error = %e,
                            "Failed to delete expired observation"
                        );
                    }
                }
            }
        }

        timer.observe_duration();
        if deleted > 0 {
            info!(deleted, "Garbage collection sweep complete");
        }
        Ok(deleted)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::sync::Mutex;
    use zen_cluster::ObservationRecord;

    struct MockJanitor {
        records: Mutex<Vec<ObservationRecord>>,
        deleted: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl ObservationJanitor for MockJanitor {
        async fn list(&self, namespace: &str) -> Result<Vec<ObservationRecord>, ZenError> {
            Ok(self
                .records
                .lock()
                .unwrap()
                .iter()
                .filter(|r| r.namespace == namespace)
                .cloned()
                .collect())
        }

        async fn delete(&self, _namespace: &str, name: &str) -> Result<(), ZenError> {
            self.deleted.lock().unwrap().push(name.to_string());
            Ok(())
        }
    }

    fn record(name: &str, age_seconds: i64, ttl: Option<u64>) -> ObservationRecord {
        ObservationRecord {
            name: name.to_string(),
            namespace: "zen-system".to_string(),
            created_at: Utc::now() - chrono::Duration::seconds(age_seconds),
            ttl_seconds: ttl,
        }
    }

    #[tokio::test]
    async fn sweep_reaps_expired_only() {
        let janitor = Arc::new(MockJanitor {
            records: Mutex::new(vec![
                record("expired", 3, Some(1)),
                record("fresh", 3, Some(3600)),
                record("no-ttl", 9999, None),
            ]),
            deleted: Mutex::new(Vec::new()),
        });
        let metrics = Metrics::unregistered().unwrap();
        let gc = GarbageCollector::new(
            janitor.clone(),
            vec!["zen-system".to_string()],
            Duration::from_secs(3600),
            metrics.clone(),
        );

        let deleted = gc.sweep(Utc::now()).await.unwrap();
        assert_eq!(deleted, 1);
        assert_eq!(*janitor.deleted.lock().unwrap(), vec!["expired"]);
        assert_eq!(metrics.observations_deleted_total.get(), 1);
        assert_eq!(metrics.gc_runs_total.get(), 1);
    }
}
