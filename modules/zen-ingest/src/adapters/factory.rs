//! Adapter construction: source config in, wired adapter out.

use std::sync::Arc;

use zen_cluster::{InformerHub, LogFetcher, SecretStore};
use zen_common::{IngesterKind, SourceConfig, ZenError};

use crate::adapters::informer::InformerAdapter;
use crate::adapters::k8s_events::NativeEventsAdapter;
use crate::adapters::logs::LogsAdapter;
use crate::adapters::webhook::{RouteRegistrar, WebhookAdapter};
use crate::adapters::SourceAdapter;
use crate::metrics::Metrics;

/// Builds the adapter for one source. A trait so the orchestrator can be
/// driven with synthetic adapters in tests.
pub trait AdapterFactory: Send + Sync {
    fn build(&self, config: &SourceConfig) -> Result<Box<dyn SourceAdapter>, ZenError>;
}

/// Production factory: pure function of (config, shared collaborators).
pub struct DefaultAdapterFactory {
    informers: Arc<dyn InformerHub>,
    registrar: Arc<dyn RouteRegistrar>,
    secrets: Arc<dyn SecretStore>,
    logs: Arc<dyn LogFetcher>,
    metrics: Metrics,
    namespace: String,
}

impl DefaultAdapterFactory {
    pub fn new(
        informers: Arc<dyn InformerHub>,
        registrar: Arc<dyn RouteRegistrar>,
        secrets: Arc<dyn SecretStore>,
        logs: Arc<dyn LogFetcher>,
        metrics: Metrics,
        namespace: String,
    ) -> Self {
        Self {
            informers,
            registrar,
            secrets,
            logs,
            metrics,
            namespace,
        }
    }
}

impl AdapterFactory for DefaultAdapterFactory {
    fn build(&self, config: &SourceConfig) -> Result<Box<dyn SourceAdapter>, ZenError> {
        config.validate()?;
        let adapter: Box<dyn SourceAdapter> = match config.kind {
            IngesterKind::Informer => Box::new(InformerAdapter::new(
                self.informers.clone(),
                self.metrics.clone(),
            )),
            IngesterKind::Webhook => Box::new(WebhookAdapter::new(
                self.registrar.clone(),
                self.secrets.clone(),
                self.metrics.clone(),
            )),
            IngesterKind::Logs => Box::new(LogsAdapter::new(
                self.logs.clone(),
                self.metrics.clone(),
                self.namespace.clone(),
            )),
            IngesterKind::NativeEvents => Box::new(NativeEventsAdapter::new(
                self.informers.clone(),
                self.metrics.clone(),
                self.namespace.clone(),
            )),
        };
        Ok(adapter)
    }
}
