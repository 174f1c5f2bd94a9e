//! Process lifecycle: boots every component in dependency order, gates the
//! leader-only ones, and supervises shutdown.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use kube::Client;
use prometheus::Registry;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use zen_cluster::{
    DisabledElection, InformerManager, KubeCluster, LeaderElection, LeaseElection, SharedElection,
    WritePolicy,
};
use zen_common::{Config, LeaderElectionMode};
use zen_ingest::ingester::store::run_store;
use zen_ingest::{
    DefaultAdapterFactory, EventFilter, GlobalFilterConfig, IngesterStore, KubeStatusReporter,
    Metrics, ObservationCreator, Orchestrator, Processor,
};

use crate::gc::GarbageCollector;
use crate::ha::HaCoordinator;
use crate::http::{AppState, WebhookRouteTable};

/// Wall-clock budget each component gets to wind down.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(30);

pub async fn run(config: Config, cancel: CancellationToken) -> anyhow::Result<()> {
    // Metrics first: everything below takes a handle.
    let registry = Registry::new();
    let metrics = Metrics::register(&registry).context("metric registration")?;

    // Cluster client. Failing here is fatal: exit non-zero at startup.
    let client = Client::try_default()
        .await
        .context("kubernetes client construction")?;
    let primary_namespace = config
        .watch_namespaces
        .first()
        .cloned()
        .unwrap_or_else(|| "default".to_string());

    let policy = Arc::new(
        WritePolicy::new(&config.watch_namespaces)
            .allow_gvrs(&config.allowed_gvrs)
            .allow_namespaces(&config.allowed_namespaces),
    );
    let cluster = Arc::new(KubeCluster::new(
        client.clone(),
        policy.clone(),
        primary_namespace.clone(),
    ));

    // Filter and pipeline core.
    let filter = Arc::new(EventFilter::new(GlobalFilterConfig::default()));
    let creator = Arc::new(ObservationCreator::new(
        cluster.clone(),
        policy.clone(),
        metrics.clone(),
        config.observation_ttl_seconds,
        primary_namespace.clone(),
    ));
    let processor = Arc::new(Processor::new(filter.clone(), creator, metrics.clone()));

    // Shared adapter collaborators.
    let informers = Arc::new(InformerManager::new(client.clone(), None));
    let routes = Arc::new(WebhookRouteTable::default());
    let factory = Arc::new(DefaultAdapterFactory::new(
        informers,
        routes.clone(),
        cluster.clone(),
        cluster.clone(),
        metrics.clone(),
        primary_namespace.clone(),
    ));

    // Ingester store, fed by one informer per watch namespace.
    let store = Arc::new(IngesterStore::new());
    let reporter = Arc::new(KubeStatusReporter::new(client.clone()));
    let mut tasks: Vec<(&'static str, JoinHandle<()>)> = Vec::new();
    for namespace in &config.watch_namespaces {
        let store = store.clone();
        let reporter = reporter.clone();
        let client = client.clone();
        let namespace = namespace.clone();
        let cancel = cancel.clone();
        tasks.push((
            "ingester-store",
            tokio::spawn(async move {
                run_store(client, store, reporter, namespace, cancel).await;
            }),
        ));
    }

    // One election, fanned out to every leader-gated component.
    let election = shared_election(&config, client.clone(), &primary_namespace, &cancel, &mut tasks);

    // Orchestrator.
    let orchestrator = Arc::new(Orchestrator::new(
        store.clone(),
        factory,
        processor,
        metrics.clone(),
        Arc::new(KubeStatusReporter::new(client.clone())),
    ));
    {
        let election = election.clone();
        let cancel = cancel.clone();
        tasks.push((
            "orchestrator",
            tokio::spawn(async move {
                if let Err(e) = orchestrator.run(election, cancel).await {
                    error!(error = %e, "Orchestrator exited with error");
                }
            }),
        ));
    }

    // Garbage collector.
    let gc = Arc::new(GarbageCollector::new(
        cluster.clone(),
        config.watch_namespaces.clone(),
        Duration::from_secs(config.gc_interval_seconds),
        metrics.clone(),
    ));
    {
        let election = election.clone();
        let cancel = cancel.clone();
        tasks.push((
            "gc",
            tokio::spawn(async move {
                if let Err(e) = gc.run(election, cancel).await {
                    error!(error = %e, "Garbage collector exited with error");
                }
            }),
        ));
    }

    // HA coordinator, only when enabled.
    let ha = if config.ha_enabled {
        let ha = Arc::new(HaCoordinator::new(
            metrics.clone(),
            store.clone(),
            Duration::from_secs(30),
        ));
        let election = election.clone();
        let cancel = cancel.clone();
        let runner = ha.clone();
        tasks.push((
            "ha",
            tokio::spawn(async move {
                if let Err(e) = runner.run(election, cancel).await {
                    error!(error = %e, "HA coordinator exited with error");
                }
            }),
        ));
        Some(ha)
    } else {
        None
    };

    // HTTP last: readiness and webhooks come up once everything is wired.
    {
        let state = AppState {
            registry,
            routes,
            store,
            ha,
        };
        let host = config.web_host.clone();
        let port = config.web_port;
        let cancel = cancel.clone();
        tasks.push((
            "http",
            tokio::spawn(async move {
                if let Err(e) = crate::http::serve(state, &host, port, cancel).await {
                    error!(error = %e, "HTTP server exited with error");
                }
            }),
        ));
    }

    info!(tasks = tasks.len(), "Zen watcher running");
    cancel.cancelled().await;
    info!("Shutdown requested, draining components");

    let deadline = tokio::time::Instant::now() + SHUTDOWN_GRACE;
    let mut stuck = Vec::new();
    for (name, task) in tasks {
        match tokio::time::timeout_at(deadline, task).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(component = name, error = %e, "Component panicked during shutdown"),
            Err(_) => stuck.push(name),
        }
    }
    if !stuck.is_empty() {
        // A stuck component is reported but does not hold the process open.
        warn!(components = ?stuck, "Stuck shutdown, exiting anyway");
    }
    Ok(())
}

/// Build the configured election and mirror its signal into a
/// [`SharedElection`] so one Lease renew loop serves all gated components.
fn shared_election(
    config: &Config,
    client: Client,
    namespace: &str,
    cancel: &CancellationToken,
    tasks: &mut Vec<(&'static str, JoinHandle<()>)>,
) -> Arc<SharedElection> {
    let base: Arc<dyn LeaderElection> = match config.leader_election {
        LeaderElectionMode::Disabled => Arc::new(DisabledElection),
        LeaderElectionMode::Builtin => {
            let identity = std::env::var("HOSTNAME")
                .unwrap_or_else(|_| format!("zen-watcher-{}", std::process::id()));
            Arc::new(LeaseElection::new(
                client,
                namespace,
                &config.leader_election_id,
                &identity,
            ))
        }
    };

    let (tx, rx) = watch::channel(false);
    let cancel = cancel.clone();
    tasks.push((
        "leader-election",
        tokio::spawn(async move {
            match base.lead(&cancel).await {
                Ok(mut leadership) => {
                    let _ = tx.send(*leadership.borrow());
                    while leadership.changed().await.is_ok() {
                        let _ = tx.send(*leadership.borrow());
                    }
                    let _ = tx.send(false);
                }
                Err(e) => {
                    warn!(error = %e, "Leader election ended");
                    let _ = tx.send(false);
                }
            }
        }),
    ));
    Arc::new(SharedElection::new(rx))
}
