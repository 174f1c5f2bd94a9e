//! In-memory index of source snapshots, fed by the Ingester informer.
//!
//! One writer (the informer handler), many readers (the orchestrator).
//! Reads hand out clones; snapshots are never mutated in place.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::RwLock;

use async_trait::async_trait;
use futures::TryStreamExt;
use kube::api::{Api, Patch, PatchParams};
use kube::runtime::watcher;
use kube::{Client, ResourceExt};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use zen_cluster::{
    Ingester, IngesterCondition, CONDITION_CONFIG_INVALID, CONDITION_READY,
};
use zen_common::{SourceConfig, ZenError};

/// Sink for Ingester status conditions. The store and the orchestrator both
/// report through it; tests plug a recorder in.
#[async_trait]
pub trait StatusReporter: Send + Sync {
    /// `owner` is `namespace/name` of the Ingester.
    async fn report(&self, owner: &str, condition: IngesterCondition);
}

pub struct NoopStatusReporter;

#[async_trait]
impl StatusReporter for NoopStatusReporter {
    async fn report(&self, _owner: &str, _condition: IngesterCondition) {}
}

struct StoreState {
    by_source: HashMap<String, SourceConfig>,
    by_owner: HashMap<String, Vec<String>>,
    version: u64,
}

pub struct IngesterStore {
    state: RwLock<StoreState>,
    notify: watch::Sender<u64>,
    synced: AtomicBool,
}

impl Default for IngesterStore {
    fn default() -> Self {
        Self::new()
    }
}

impl IngesterStore {
    pub fn new() -> Self {
        let (notify, _) = watch::channel(0);
        Self {
            state: RwLock::new(StoreState {
                by_source: HashMap::new(),
                by_owner: HashMap::new(),
                version: 0,
            }),
            notify,
            synced: AtomicBool::new(false),
        }
    }

    /// Upsert the snapshots owned by one Ingester. Returns the status
    /// conditions to surface: `ConfigInvalid` for rejected entries, source
    /// conflicts for names claimed by another Ingester, `Ready` otherwise.
    pub fn apply(&self, owner: &str, ingester: &Ingester) -> Vec<IngesterCondition> {
        let expanded = ingester.spec.expand(owner);
        let mut conditions = Vec::new();
        let mut accepted = Vec::new();

        let mut state = self.state.write().expect("ingester store lock");

        // Re-applying an owner replaces its previous set wholesale.
        if let Some(previous) = state.by_owner.remove(owner) {
            for source in previous {
                state.by_source.remove(&source);
            }
        }

        for result in expanded {
            match result {
                Ok(config) => {
                    if let Some(existing) = state.by_source.get(&config.name) {
                        if existing.owner != owner {
                            // Source-name collision across Ingesters: skip
                            // the later entry.
                            let err = ZenError::ConfigurationDrift {
                                source_name: config.name.clone(),
                                owner: existing.owner.clone(),
                            };
                            warn!(source = %config.name, owner, "Skipping conflicting source");
                            conditions.push(IngesterCondition::new(
                                CONDITION_CONFIG_INVALID,
                                true,
                                "SourceConflict",
                                &err.to_string(),
                            ));
                            continue;
                        }
                    }
                    accepted.push(config.name.clone());
                    state.by_source.insert(config.name.clone(), config);
                }
                Err(e) => {
                    conditions.push(IngesterCondition::new(
                        CONDITION_CONFIG_INVALID,
                        true,
                        "ValidationFailed",
                        &e.to_string(),
                    ));
                }
            }
        }

        let all_accepted = conditions.is_empty();
        if !accepted.is_empty() {
            state.by_owner.insert(owner.to_string(), accepted);
        }
        state.version += 1;
        let version = state.version;
        drop(state);

        self.notify.send_replace(version);
        if all_accepted {
            conditions.push(IngesterCondition::new(
                CONDITION_READY,
                true,
                "Accepted",
                "all sources materialized",
            ));
        }
        conditions
    }

    pub fn remove(&self, owner: &str) {
        let mut state = self.state.write().expect("ingester store lock");
        if let Some(sources) = state.by_owner.remove(owner) {
            for source in sources {
                state.by_source.remove(&source);
            }
            state.version += 1;
            let version = state.version;
            drop(state);
            self.notify.send_replace(version);
            info!(owner, "Removed ingester sources");
        }
    }

    /// Atomic read of one snapshot.
    pub fn get_by_source(&self, source: &str) -> Option<SourceConfig> {
        self.state
            .read()
            .expect("ingester store lock")
            .by_source
            .get(source)
            .cloned()
    }

    /// The full desired set, cloned under the read lock.
    pub fn snapshot(&self) -> HashMap<String, SourceConfig> {
        self.state
            .read()
            .expect("ingester store lock")
            .by_source
            .clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.notify.subscribe()
    }

    pub fn mark_synced(&self) {
        self.synced.store(true, Ordering::Release);
    }

    /// Readiness gate: true only after the initial informer sync.
    pub fn is_synced(&self) -> bool {
        self.synced.load(Ordering::Acquire)
    }
}

// ---------------------------------------------------------------------------
// Informer loop
// ---------------------------------------------------------------------------

/// Watch Ingesters in one namespace and feed the store. Restarts the watch
/// with a flat delay on stream errors; returns only on cancellation.
pub async fn run_store(
    client: Client,
    store: std::sync::Arc<IngesterStore>,
    reporter: std::sync::Arc<dyn StatusReporter>,
    namespace: String,
    cancel: CancellationToken,
) {
    let api: Api<Ingester> = Api::namespaced(client, &namespace);
    loop {
        let stream = watcher(api.clone(), watcher::Config::default());
        let mut stream = Box::pin(stream);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = stream.try_next() => {
                    match event {
                        Ok(Some(event)) => {
                            handle_event(&store, &reporter, &namespace, event).await;
                        }
                        Ok(None) => break,
                        Err(e) => {
                            warn!(namespace = %namespace, error = %e, "Ingester watch failed, restarting");
                            break;
                        }
                    }
                }
            }
        }
        tokio::select! {
            _ = cancel.cancelled() => return,
            _ = tokio::time::sleep(std::time::Duration::from_secs(5)) => {}
        }
    }
}

async fn handle_event(
    store: &IngesterStore,
    reporter: &std::sync::Arc<dyn StatusReporter>,
    namespace: &str,
    event: watcher::Event<Ingester>,
) {
    match event {
        watcher::Event::Apply(ingester) | watcher::Event::InitApply(ingester) => {
            let owner = format!("{namespace}/{}", ingester.name_any());
            let conditions = store.apply(&owner, &ingester);
            for condition in conditions {
                reporter.report(&owner, condition).await;
            }
        }
        watcher::Event::Delete(ingester) => {
            let owner = format!("{namespace}/{}", ingester.name_any());
            store.remove(&owner);
        }
        watcher::Event::InitDone => {
            store.mark_synced();
            info!(namespace, "Ingester store synced");
        }
        watcher::Event::Init => {}
    }
}

/// Writes conditions back onto the owning Ingester's status subresource.
pub struct KubeStatusReporter {
    client: Client,
}

impl KubeStatusReporter {
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl StatusReporter for KubeStatusReporter {
    async fn report(&self, owner: &str, condition: IngesterCondition) {
        let Some((namespace, name)) = owner.split_once('/') else {
            warn!(owner, "Malformed owner reference, skipping status report");
            return;
        };
        let api: Api<Ingester> = Api::namespaced(self.client.clone(), namespace);
        let patch = serde_json::json!({
            "apiVersion": "zenwatcher.io/v1",
            "kind": "Ingester",
            "status": { "conditions": [condition] },
        });
        let params = PatchParams::apply("zen-watcher").force();
        if let Err(e) = api.patch_status(name, &params, &Patch::Apply(&patch)).await {
            warn!(owner, error = %e, "Failed to patch ingester status");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use zen_common::{Destination, IngesterKind, WebhookParams};

    fn ingester(source: &str) -> Ingester {
        Ingester::new(
            "test",
            zen_cluster::IngesterSpec {
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
        )
    }

    #[test]
    fn apply_then_get_round_trips() {
        let store = IngesterStore::new();
        let conditions = store.apply("default/a", &ingester("trivy"));
        assert!(conditions
            .iter()
            .any(|c| c.condition_type == CONDITION_READY && c.status == "True"));

        let config = store.get_by_source("trivy").unwrap();
        assert_eq!(config.owner, "default/a");
        assert!(store.get_by_source("other").is_none());
    }

    #[test]
    fn conflicting_source_is_skipped_with_condition() {
        let store = IngesterStore::new();
        store.apply("default/a", &ingester("trivy"));
        let conditions = store.apply("default/b", &ingester("trivy"));

        assert!(conditions
            .iter()
            .any(|c| c.condition_type == CONDITION_CONFIG_INVALID));
        // The original owner keeps the source.
        assert_eq!(store.get_by_source("trivy").unwrap().owner, "default/a");
    }

    #[test]
    fn reapply_replaces_owned_set() {
        let store = IngesterStore::new();
        store.apply("default/a", &ingester("trivy"));
        store.apply("default/a", &ingester("kyverno"));

        assert!(store.get_by_source("trivy").is_none());
        assert!(store.get_by_source("kyverno").is_some());
    }

    #[test]
    fn remove_clears_owned_sources_and_notifies() {
        let store = IngesterStore::new();
        let mut rx = store.subscribe();
        store.apply("default/a", &ingester("trivy"));
        assert!(rx.has_changed().unwrap());
        let _ = rx.borrow_and_update();

        store.remove("default/a");
        assert!(rx.has_changed().unwrap());
        assert!(store.snapshot().is_empty());
    }

    #[test]
    fn snapshots_are_copies() {
        let store = IngesterStore::new();
        store.apply("default/a", &ingester("trivy"));
        let mut snapshot = store.get_by_source("trivy").unwrap();
        snapshot.name = "mutated".to_string();
        assert_eq!(store.get_by_source("trivy").unwrap().name, "trivy");
    }
}
