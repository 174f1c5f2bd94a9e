//! Source adapters: one variant per ingester kind, all behind the same
//! start/stop contract.

pub mod factory;
pub mod informer;
pub mod k8s_events;
pub mod logs;
pub mod webhook;

use async_trait::async_trait;
use tokio::sync::mpsc;

use zen_common::{RawEvent, SourceConfig, ZenError};

use crate::metrics::Metrics;

/// Bound on every adapter-to-pump channel.
pub const CHANNEL_CAPACITY: usize = 100;

/// Grace period `stop` waits for the producer task to drain.
pub const STOP_GRACE: std::time::Duration = std::time::Duration::from_secs(5);

/// The adapter contract.
///
/// `start` returns a lazy, cancellable, unicast channel of raw events.
/// `stop` signals cancellation, drains in-flight deliveries up to
/// [`STOP_GRACE`], and closes the channel exactly once (the pump observes
/// close as end-of-stream). Adapters are restartable after `stop`.
#[async_trait]
pub trait SourceAdapter: Send {
    async fn start(&mut self, config: &SourceConfig) -> Result<mpsc::Receiver<RawEvent>, ZenError>;

    async fn stop(&mut self);
}

/// Non-blocking hand-off into the pipeline channel. On a full channel the
/// event is dropped and counted; the producer never blocks.
pub(crate) fn offer(
    tx: &mpsc::Sender<RawEvent>,
    event: RawEvent,
    metrics: &Metrics,
    source: &str,
) -> bool {
    match tx.try_send(event) {
        Ok(()) => true,
        Err(mpsc::error::TrySendError::Full(_)) => {
            metrics
                .source_dropped_total
                .with_label_values(&[source, "backpressure"])
                .inc();
            false
        }
        Err(mpsc::error::TrySendError::Closed(_)) => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn offer_drops_on_full_channel_without_blocking() {
        let metrics = Metrics::unregistered().unwrap();
        let (tx, mut rx) = mpsc::channel(1);

        let event = RawEvent::new("test", serde_json::Map::new());
        assert!(offer(&tx, event.clone(), &metrics, "test"));

        let started = std::time::Instant::now();
        assert!(!offer(&tx, event.clone(), &metrics, "test"));
        assert!(started.elapsed() < std::time::Duration::from_millis(10));
        assert_eq!(
            metrics
                .source_dropped_total
                .with_label_values(&["test", "backpressure"])
                .get(),
            1
        );

        rx.recv().await.unwrap();
        assert!(offer(&tx, event, &metrics, "test"));
    }
}
