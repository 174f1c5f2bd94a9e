//! Shared informer plumbing.
//!
//! Adapters watching the same resource share one watch; a per-source resync
//! that differs from the shared default gets a dedicated factory keyed by
//! the triple, living exactly as long as its subscribers.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures::TryStreamExt;
use kube::api::{Api, DynamicObject, ListParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::runtime::watcher;
use kube::Client;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use zen_common::{GvrSpec, ZenError};

/// Per-subscriber channel capacity. The adapter applies its own bounded
/// channel on top; this buffer only absorbs fan-out jitter.
const SUBSCRIBER_BUFFER: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchKind {
    Added,
    Modified,
    Deleted,
}

#[derive(Debug, Clone)]
pub struct ObjectEvent {
    pub kind: WatchKind,
    pub object: Arc<DynamicObject>,
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct SubscribeRequest {
    pub gvr: GvrSpec,
    pub namespace: Option<String>,
    pub label_selector: Option<String>,
    pub field_selector: Option<String>,
    /// `Some` forces a dedicated factory when it differs from the shared
    /// default.
    pub resync: Option<Duration>,
}

/// A live subscription. Dropping it releases the underlying factory once the
/// last subscriber is gone.
pub struct InformerSubscription {
    pub events: mpsc::Receiver<ObjectEvent>,
    _guard: SubscriptionGuard,
}

#[async_trait]
pub trait InformerHub: Send + Sync {
    async fn subscribe(&self, request: SubscribeRequest) -> Result<InformerSubscription, ZenError>;
}

// ---------------------------------------------------------------------------
// Manager
// ---------------------------------------------------------------------------

type FactoryKey = SubscribeRequest;

struct FactoryEntry {
    subscribers: Arc<Mutex<Vec<mpsc::Sender<ObjectEvent>>>>,
    cancel: CancellationToken,
    refs: usize,
}

pub struct InformerManager {
    client: Client,
    default_resync: Option<Duration>,
    factories: Arc<Mutex<HashMap<FactoryKey, FactoryEntry>>>,
}

impl InformerManager {
    pub fn new(client: Client, default_resync: Option<Duration>) -> Self {
        Self {
            client,
            default_resync,
            factories: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn factory_key(&self, request: &SubscribeRequest) -> FactoryKey {
        let mut key = request.clone();
        // A resync equal to the shared default shares the default factory.
        if key.resync == self.default_resync {
            key.resync = None;
        }
        key
    }
}

#[async_trait]
impl InformerHub for InformerManager {
    async fn subscribe(&self, request: SubscribeRequest) -> Result<InformerSubscription, ZenError> {
        let key = self.factory_key(&request);
        let (tx, rx) = mpsc::channel(SUBSCRIBER_BUFFER);

        let mut factories = self.factories.lock().expect("informer factory lock");
        match factories.get_mut(&key) {
            Some(entry) => {
                entry.refs += 1;
                entry.subscribers.lock().expect("subscriber lock").push(tx);
            }
            None => {
                let subscribers = Arc::new(Mutex::new(vec![tx]));
                let cancel = CancellationToken::new();
                let resync = request.resync.or(self.default_resync);
                spawn_watch_task(
                    self.client.clone(),
                    request.clone(),
                    resync,
                    subscribers.clone(),
                    cancel.clone(),
                );
                info!(gvr = %request.gvr, dedicated = request.resync.is_some(), "Informer factory started");
                factories.insert(
                    key.clone(),
                    FactoryEntry {
                        subscribers,
                        cancel,
                        refs: 1,
                    },
                );
            }
        }
        drop(factories);

        Ok(InformerSubscription {
            events: rx,
            _guard: SubscriptionGuard {
                factories: self.factories.clone(),
                key,
            },
        })
    }
}

struct SubscriptionGuard {
    factories: Arc<Mutex<HashMap<FactoryKey, FactoryEntry>>>,
    key: FactoryKey,
}

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        let mut factories = self.factories.lock().expect("informer factory lock");
        if let Some(entry) = factories.get_mut(&self.key) {
            entry.refs -= 1;
            if entry.refs == 0 {
                entry.cancel.cancel();
                factories.remove(&self.key);
                debug!(gvr = %self.key.gvr, "Informer factory released");
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Watch task
// ---------------------------------------------------------------------------

fn spawn_watch_task(
    client: Client,
    request: SubscribeRequest,
    resync: Option<Duration>,
    subscribers: Arc<Mutex<Vec<mpsc::Sender<ObjectEvent>>>>,
    cancel: CancellationToken,
) {
    tokio::spawn(async move {
        let gvk = GroupVersionKind::gvk(
            &request.gvr.group,
            &request.gvr.version,
            &request.gvr.kind_hint(),
        );
        let ar = ApiResource::from_gvk_with_plural(&gvk, &request.gvr.resource);
        let api: Api<DynamicObject> = match &request.namespace {
            Some(ns) => Api::namespaced_with(client.clone(), ns, &ar),
            None => Api::all_with(client.clone(), &ar),
        };

        let mut config = watcher::Config::default();
        if let Some(labels) = &request.label_selector {
            config = config.labels(labels);
        }
        if let Some(fields) = &request.field_selector {
            config = config.fields(fields);
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                result = drive_watch(&api, &config, resync, &subscribers, &cancel) => {
                    match result {
                        Ok(()) => break, // cancelled from inside
                        Err(e) => {
                            warn!(gvr = %request.gvr, error = %e, "Watch stream failed, restarting");
                            tokio::time::sleep(Duration::from_secs(5)).await;
                        }
                    }
                }
            }
        }
        debug!(gvr = %request.gvr, "Informer watch task stopped");
    });
}

async fn drive_watch(
    api: &Api<DynamicObject>,
    config: &watcher::Config,
    resync: Option<Duration>,
    subscribers: &Arc<Mutex<Vec<mpsc::Sender<ObjectEvent>>>>,
    cancel: &CancellationToken,
) -> anyhow::Result<()> {
    let mut stream = Box::pin(watcher(api.clone(), config.clone()));
    let mut resync_tick = resync.map(tokio::time::interval);
    if let Some(tick) = &mut resync_tick {
        tick.tick().await; // discard the immediate first tick
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return Ok(()),
            _ = async {
                match &mut resync_tick {
                    Some(tick) => { tick.tick().await; }
                    None => std::future::pending().await,
                }
            } => {
                // Periodic relist, mirroring a shared-informer resync.
                let objects = api.list(&ListParams::default()).await?;
                for object in objects.items {
                    fanout(subscribers, ObjectEvent {
                        kind: WatchKind::Modified,
                        object: Arc::new(object),
                    });
                }
            }
            event = stream.try_next() => {
                match event? {
                    Some(watcher::Event::Apply(object)) => fanout(subscribers, ObjectEvent {
                        kind: WatchKind::Modified,
                        object: Arc::new(object),
                    }),
                    Some(watcher::Event::InitApply(object)) => fanout(subscribers, ObjectEvent {
                        kind: WatchKind::Added,
                        object: Arc::new(object),
                    }),
                    Some(watcher::Event::Delete(object)) => fanout(subscribers, ObjectEvent {
                        kind: WatchKind::Deleted,
                        object: Arc::new(object),
                    }),
                    Some(watcher::Event::Init) | Some(watcher::Event::InitDone) => {}
                    None => anyhow::bail!("watch stream ended"),
                }
            }
        }
    }
}

fn fanout(subscribers: &Arc<Mutex<Vec<mpsc::Sender<ObjectEvent>>>>, event: ObjectEvent) {
    let mut subs = subscribers.lock().expect("subscriber lock");
    subs.retain(|tx| !tx.is_closed());
    for tx in subs.iter() {
        // A slow subscriber loses fan-out events rather than stalling the
        // watch; the adapter's own channel accounts for drops.
        let _ = tx.try_send(event.clone());
    }
}

