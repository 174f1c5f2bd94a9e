//! End-to-end pipeline scenarios against mock cluster collaborators.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use zen_cluster::{
    leader, DisabledElection, Ingester, IngesterSpec, ObservationWriter, WritePolicy, WriteTarget,
};
use zen_common::{
    DedupSpec, Destination, FilterSpec, GvrSpec, IngesterKind, ObservationSpec, ProcessingOrder,
    RawEvent, Severity, SeverityThreshold, SourceConfig, WebhookParams, ZenError,
};
use zen_ingest::adapters::factory::AdapterFactory;
use zen_ingest::adapters::SourceAdapter;
use zen_ingest::{
    EventFilter, GlobalFilterConfig, IngesterStore, Metrics, NoopStatusReporter,
    ObservationCreator, Orchestrator, ProcessOutcome, Processor,
};

// ---------------------------------------------------------------------------
// Mocks
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MockWriter {
    created: Mutex<Vec<(WriteTarget, ObservationSpec)>>,
    conflict_names: Mutex<Vec<String>>,
}

impl MockWriter {
    fn created(&self) -> Vec<(WriteTarget, ObservationSpec)> {
        self.created.lock().unwrap().clone()
    }
}

#[async_trait]
impl ObservationWriter for MockWriter {
    async fn create(&self, target: &WriteTarget, spec: &ObservationSpec) -> Result<(), ZenError> {
        if self.conflict_names.lock().unwrap().contains(&target.name) {
            return Err(ZenError::ConflictOnCreate {
                name: target.name.clone(),
            });
        }
        self.created
            .lock()
            .unwrap()
            .push((target.clone(), spec.clone()));
        Ok(())
    }
}

/// Factory whose adapters read from externally fed channels, so tests can
/// inject raw events per source.
#[derive(Default)]
struct ScriptedFactory {
    feeds: Arc<Mutex<HashMap<String, mpsc::Sender<RawEvent>>>>,
    builds: Arc<Mutex<u32>>,
}

impl ScriptedFactory {
    fn feed(&self, source: &str) -> Option<mpsc::Sender<RawEvent>> {
        self.feeds.lock().unwrap().get(source).cloned()
    }

    fn build_count(&self) -> u32 {
        *self.builds.lock().unwrap()
    }
}

struct ScriptedAdapter {
    feeds: Arc<Mutex<HashMap<String, mpsc::Sender<RawEvent>>>>,
    source: Option<String>,
}

#[async_trait]
impl SourceAdapter for ScriptedAdapter {
    async fn start(&mut self, config: &SourceConfig) -> Result<mpsc::Receiver<RawEvent>, ZenError> {
        let (tx, rx) = mpsc::channel(100);
        self.feeds
            .lock()
            .unwrap()
            .insert(config.name.clone(), tx);
        self.source = Some(config.name.clone());
        Ok(rx)
    }

    async fn stop(&mut self) {
        if let Some(source) = self.source.take() {
            // Dropping the sender closes the channel exactly once.
            self.feeds.lock().unwrap().remove(&source);
        }
    }
}

impl AdapterFactory for ScriptedFactory {
    fn build(&self, _config: &SourceConfig) -> Result<Box<dyn SourceAdapter>, ZenError> {
        *self.builds.lock().unwrap() += 1;
        Ok(Box::new(ScriptedAdapter {
            feeds: self.feeds.clone(),
            source: None,
        }))
    }
}

// ---------------------------------------------------------------------------
// Fixtures
// ---------------------------------------------------------------------------

fn source_config(name: &str) -> SourceConfig {
    SourceConfig {
        name: name.to_string(),
        kind: IngesterKind::Webhook,
        owner: format!("default/{name}"),
        destinations: vec![Destination::crd("observations")],
        filters: None,
        deduplication: None,
        order: ProcessingOrder::default(),
        informer: None,
        webhook: Some(WebhookParams {
            path: format!("/hooks/{name}"),
            auth: None,
            rate_limit: None,
        }),
        logs: None,
        k8s_events: None,
    }
}

fn raw_event(source: &str, severity: &str, id: &str) -> RawEvent {
    let mut data = serde_json::Map::new();
    data.insert("severity".to_string(), serde_json::json!(severity));
    data.insert("id".to_string(), serde_json::json!(id));
    RawEvent::new(source, data)
}

struct Harness {
    writer: Arc<MockWriter>,
    processor: Arc<Processor>,
}

fn harness() -> Harness {
    let metrics = Metrics::unregistered().unwrap();
    let writer = Arc::new(MockWriter::default());
    let policy = Arc::new(WritePolicy::new(&["zen-system".to_string()]));
    let creator = Arc::new(ObservationCreator::new(
        writer.clone(),
        policy,
        metrics.clone(),
        3600,
        "zen-system".to_string(),
    ));
    let filter = Arc::new(EventFilter::new(GlobalFilterConfig::default()));
    let processor = Arc::new(Processor::new(filter, creator, metrics));
    Harness { writer, processor }
}

// ---------------------------------------------------------------------------
// Scenario 1: filter-first drops LOW when minSeverity = HIGH
// ---------------------------------------------------------------------------

#[tokio::test]
async fn filter_first_drops_low_severity() {
    let h = harness();
    let mut config = source_config("test");
    config.order = ProcessingOrder::FilterFirst;
    config.filters = Some(FilterSpec {
        min_severity: Some(SeverityThreshold::High),
        ..FilterSpec::default()
    });

    let first = h
        .processor
        .process_event(raw_event("test", "HIGH", "e1"), Some(&config))
        .await
        .unwrap();
    assert_eq!(first, ProcessOutcome::Delivered);

    let second = h
        .processor
        .process_event(raw_event("test", "LOW", "e2"), Some(&config))
        .await
        .unwrap();
    assert_eq!(second, ProcessOutcome::Filtered);

    let created = h.writer.created();
    assert_eq!(created.len(), 1);
    assert_eq!(created[0].1.severity, Severity::High);
    assert_eq!(created[0].1.source, "test");
}

// ---------------------------------------------------------------------------
// Scenario 2: dedup-first collapses duplicates within the window
// ---------------------------------------------------------------------------

#[tokio::test]
async fn dedup_first_collapses_duplicates() {
    let h = harness();
    let mut config = source_config("test");
    config.order = ProcessingOrder::DedupFirst;
    config.deduplication = Some(DedupSpec {
        window_seconds: Some(60),
        ..DedupSpec::default()
    });

    let first = h
        .processor
        .process_event(raw_event("test", "HIGH", "dup"), Some(&config))
        .await
        .unwrap();
    assert_eq!(first, ProcessOutcome::Delivered);

    let second = h
        .processor
        .process_event(raw_event("test", "HIGH", "dup"), Some(&config))
        .await
        .unwrap();
    assert_eq!(second, ProcessOutcome::Deduplicated);

    assert_eq!(h.writer.created().len(), 1);
    h.processor.release_source("test").await;
}

// ---------------------------------------------------------------------------
// Scenario 3: the deny list is non-bypassable
// ---------------------------------------------------------------------------

#[tokio::test]
async fn deny_list_blocks_secrets_destination() {
    let h = harness();
    let mut config = source_config("test");
    config.destinations = vec![Destination {
        class: "crd".to_string(),
        value: None,
        gvr: Some(GvrSpec::new("", "v1", "secrets")),
        mapping: None,
    }];

    let outcome = h
        .processor
        .process_event(raw_event("test", "HIGH", "e1"), Some(&config))
        .await
        .unwrap();
    assert_eq!(outcome, ProcessOutcome::Denied);
    assert!(h.writer.created().is_empty());

    // The pipeline stays healthy: the next event to a sane destination
    // still flows.
    let mut sane = source_config("test");
    sane.destinations = vec![Destination::crd("observations")];
    let outcome = h
        .processor
        .process_event(raw_event("test", "HIGH", "e2"), Some(&sane))
        .await
        .unwrap();
    assert_eq!(outcome, ProcessOutcome::Delivered);
}

// ---------------------------------------------------------------------------
// Conflict on the fingerprint-derived name is idempotent success
// ---------------------------------------------------------------------------

#[tokio::test]
async fn create_conflict_is_idempotent_success() {
    let h = harness();
    let config = source_config("test");

    let first = h
        .processor
        .process_event(raw_event("test", "HIGH", "same"), Some(&config))
        .await
        .unwrap();
    assert_eq!(first, ProcessOutcome::Delivered);
    let name = h.writer.created()[0].0.name.clone();
    h.writer.conflict_names.lock().unwrap().push(name);

    let replay = h
        .processor
        .process_event(raw_event("test", "HIGH", "same"), Some(&config))
        .await
        .unwrap();
    assert_eq!(replay, ProcessOutcome::AlreadyExists);
    assert_eq!(h.writer.created().len(), 1);
}

// ---------------------------------------------------------------------------
// Missing config drops the event instead of crashing
// ---------------------------------------------------------------------------

#[tokio::test]
async fn nil_config_is_a_validation_drop() {
    let h = harness();
    let outcome = h
        .processor
        .process_event(raw_event("orphan", "HIGH", "e1"), None)
        .await
        .unwrap();
    assert_eq!(outcome, ProcessOutcome::Invalid);
    assert!(h.writer.created().is_empty());
}

// ---------------------------------------------------------------------------
// TTL defaulting: explicit wins, process default otherwise
// ---------------------------------------------------------------------------

#[tokio::test]
async fn ttl_defaulting_prefers_event_ttl() {
    let h = harness();
    let config = source_config("test");

    let mut with_ttl = raw_event("test", "HIGH", "a");
    with_ttl
        .raw_data
        .insert("ttlSecondsAfterCreation".to_string(), serde_json::json!(120));
    h.processor
        .process_event(with_ttl, Some(&config))
        .await
        .unwrap();
    h.processor
        .process_event(raw_event("test", "HIGH", "b"), Some(&config))
        .await
        .unwrap();

    let created = h.writer.created();
    assert_eq!(created[0].1.ttl_seconds_after_creation, Some(120));
    assert_eq!(created[1].1.ttl_seconds_after_creation, Some(3600));
}

// ---------------------------------------------------------------------------
// Per-source ordering is preserved through the pump
// ---------------------------------------------------------------------------

fn store_with(ingester_name: &str, source: &str) -> (Arc<IngesterStore>, Ingester) {
    let store = Arc::new(IngesterStore::new());
    let ingester = Ingester::new(
        ingester_name,
        IngesterSpec {
            source: Some(source.to_string()),
            ingester: Some(IngesterKind::Webhook),
            sources: None,
            destinations: vec![Destination::crd("observations")],
            deduplication: None,
            filters: None,
            processing: None,
            informer: None,
            webhook: Some(WebhookParams {
                path: format!("/hooks/{source}"),
                auth: None,
                rate_limit: None,
            }),
            logs: None,
            k8s_events: None,
        },
    );
    (store, ingester)
}

fn orchestrator(
    store: Arc<IngesterStore>,
    factory: Arc<ScriptedFactory>,
    processor: Arc<Processor>,
) -> Arc<Orchestrator> {
    Arc::new(
        Orchestrator::new(
            store,
            factory,
            processor,
            Metrics::unregistered().unwrap(),
            Arc::new(NoopStatusReporter),
        )
        .with_reconcile_interval(Duration::from_millis(50)),
    )
}

async fn wait_until<F: Fn() -> bool>(deadline: Duration, predicate: F) -> bool {
    let start = tokio::time::Instant::now();
    while start.elapsed() < deadline {
        if predicate() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    predicate()
}

#[tokio::test]
async fn events_flow_in_order_through_a_managed_pipeline() {
    let h = harness();
    let (store, ingester) = store_with("a", "ordered");
    let factory = Arc::new(ScriptedFactory::default());
    let orch = orchestrator(store.clone(), factory.clone(), h.processor.clone());

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let run = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.run(Arc::new(DisabledElection), run_cancel).await })
    };

    store.apply("default/a", &ingester);
    assert!(wait_until(Duration::from_secs(2), || factory.feed("ordered").is_some()).await);

    let feed = factory.feed("ordered").unwrap();
    for i in 0..5 {
        feed.send(raw_event("ordered", "HIGH", &format!("e{i}")))
            .await
            .unwrap();
    }

    assert!(wait_until(Duration::from_secs(2), || h.writer.created().len() == 5).await);
    let ids: Vec<String> = h
        .writer
        .created()
        .iter()
        .map(|(_, spec)| spec.details.as_ref().unwrap()["id"].as_str().unwrap().to_string())
        .collect();
    assert_eq!(ids, vec!["e0", "e1", "e2", "e3", "e4"]);

    cancel.cancel();
    run.await.unwrap().unwrap();
}

// ---------------------------------------------------------------------------
// Deleting an Ingester stops the pipeline within 5 s
// ---------------------------------------------------------------------------

#[tokio::test]
async fn deleting_ingester_stops_pipeline_quickly() {
    let h = harness();
    let (store, ingester) = store_with("a", "doomed");
    let factory = Arc::new(ScriptedFactory::default());
    let orch = orchestrator(store.clone(), factory.clone(), h.processor.clone());

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let run = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.run(Arc::new(DisabledElection), run_cancel).await })
    };

    store.apply("default/a", &ingester);
    assert!(wait_until(Duration::from_secs(2), || factory.feed("doomed").is_some()).await);

    store.remove("default/a");
    assert!(
        wait_until(Duration::from_secs(5), || factory.feed("doomed").is_none()).await,
        "pipeline should stop within 5s of ingester deletion"
    );

    cancel.cancel();
    run.await.unwrap().unwrap();
}

// ---------------------------------------------------------------------------
// Revision change is stop-then-start
// ---------------------------------------------------------------------------

#[tokio::test]
async fn config_change_restarts_pipeline() {
    let h = harness();
    let (store, ingester) = store_with("a", "mutable");
    let factory = Arc::new(ScriptedFactory::default());
    let orch = orchestrator(store.clone(), factory.clone(), h.processor.clone());

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let run = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.run(Arc::new(DisabledElection), run_cancel).await })
    };

    store.apply("default/a", &ingester);
    assert!(wait_until(Duration::from_secs(2), || factory.build_count() == 1).await);

    let mut changed = ingester.clone();
    changed.spec.processing = Some(zen_cluster::ProcessingSpec {
        order: ProcessingOrder::DedupFirst,
    });
    store.apply("default/a", &changed);

    assert!(
        wait_until(Duration::from_secs(2), || factory.build_count() == 2).await,
        "revision change should rebuild the adapter"
    );

    cancel.cancel();
    run.await.unwrap().unwrap();
}

// ---------------------------------------------------------------------------
// Scenario 4 (single-process rendition): a follower builds no adapters and
// produces nothing until elected
// ---------------------------------------------------------------------------

#[tokio::test]
async fn follower_produces_nothing_until_elected() {
    let h = harness();
    let (store, ingester) = store_with("a", "gated");
    let factory = Arc::new(ScriptedFactory::default());
    let orch = orchestrator(store.clone(), factory.clone(), h.processor.clone());

    let (lever, election) = leader::manual();
    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let run = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.run(Arc::new(election), run_cancel).await })
    };

    store.apply("default/a", &ingester);
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(factory.build_count(), 0, "follower must construct no adapters");

    lever.set_leader(true);
    assert!(wait_until(Duration::from_secs(2), || factory.build_count() == 1).await);

    // Losing leadership stops every pipeline.
    lever.set_leader(false);
    assert!(wait_until(Duration::from_secs(2), || factory.feed("gated").is_none()).await);
    run.await.unwrap().unwrap();

    cancel.cancel();
}

// ---------------------------------------------------------------------------
// Degraded pipeline restarts after an unexpected channel close
// ---------------------------------------------------------------------------

#[tokio::test]
async fn unexpected_channel_close_triggers_restart() {
    let h = harness();
    let (store, ingester) = store_with("a", "flaky");
    let factory = Arc::new(ScriptedFactory::default());
    let orch = orchestrator(store.clone(), factory.clone(), h.processor.clone());

    let cancel = CancellationToken::new();
    let run_cancel = cancel.clone();
    let run = {
        let orch = orch.clone();
        tokio::spawn(async move { orch.run(Arc::new(DisabledElection), run_cancel).await })
    };

    store.apply("default/a", &ingester);
    assert!(wait_until(Duration::from_secs(2), || factory.build_count() == 1).await);

    // Simulate the adapter stream dying: drop the feed sender.
    factory.feeds.lock().unwrap().remove("flaky");

    assert!(
        wait_until(Duration::from_secs(5), || factory.build_count() >= 2).await,
        "orchestrator should rebuild after backoff"
    );

    cancel.cancel();
    run.await.unwrap().unwrap();
}
