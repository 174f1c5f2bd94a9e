pub mod adapters;
pub mod ingester;
pub mod metrics;
pub mod orchestrator;
pub mod pipeline;

pub use adapters::factory::{AdapterFactory, DefaultAdapterFactory};
pub use adapters::webhook::{RouteRegistrar, WebhookHandler, WebhookResponse};
pub use adapters::SourceAdapter;
pub use ingester::migrate::{migrate, IngesterV1Alpha1Spec, MigrationOutcome, V1Alpha1Destination};
pub use ingester::store::{
    IngesterStore, KubeStatusReporter, NoopStatusReporter, StatusReporter,
};
pub use metrics::{LoadTracker, Metrics};
pub use orchestrator::{BackoffPolicy, Orchestrator, PipelineState};
pub use pipeline::creator::{DeliveryResult, DestinationResolver, ObservationCreator};
pub use pipeline::dedup::Deduper;
pub use pipeline::filter::{EventFilter, FilterDecision, GlobalFilterConfig};
pub use pipeline::processor::{ProcessOutcome, Processor};
