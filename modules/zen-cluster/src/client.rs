//! Trait seams over the cluster client, plus the kube-backed implementation.
//!
//! Everything downstream of the adapters talks to these traits; tests swap
//! in mocks and never touch a network.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, LogParams, PostParams};
use kube::core::{ApiResource, GroupVersionKind};
use kube::Client;
use tracing::{debug, warn};

use zen_common::{GvrSpec, ObservationSpec, SecretRef, ZenError};

use crate::policy::WritePolicy;

/// Fully resolved write coordinates for one Observation.
#[derive(Debug, Clone, PartialEq)]
pub struct WriteTarget {
    pub gvr: GvrSpec,
    pub namespace: String,
    pub name: String,
}

/// A stored Observation as seen by the garbage collector.
#[derive(Debug, Clone)]
pub struct ObservationRecord {
    pub name: String,
    pub namespace: String,
    pub created_at: DateTime<Utc>,
    pub ttl_seconds: Option<u64>,
}

#[async_trait]
pub trait ObservationWriter: Send + Sync {
    /// Exactly one create attempt. Conflict surfaces as
    /// [`ZenError::ConflictOnCreate`]; the caller decides whether that is
    /// idempotent success.
    async fn create(&self, target: &WriteTarget, spec: &ObservationSpec) -> Result<(), ZenError>;
}

#[async_trait]
pub trait ObservationJanitor: Send + Sync {
    async fn list(&self, namespace: &str) -> Result<Vec<ObservationRecord>, ZenError>;
    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ZenError>;
}

/// Secret-like credential store the webhook adapter reads token material
/// from, by reference.
#[async_trait]
pub trait SecretStore: Send + Sync {
    async fn read_key(&self, secret: &SecretRef, default_key: &str) -> Result<String, ZenError>;
}

/// Container log access for the logs adapter.
#[async_trait]
pub trait LogFetcher: Send + Sync {
    async fn list_pods(&self, namespace: &str, label_selector: &str)
        -> Result<Vec<String>, ZenError>;
    async fn fetch_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        since_seconds: Option<i64>,
    ) -> Result<String, ZenError>;
}

// ---------------------------------------------------------------------------
// Kube-backed implementation
// ---------------------------------------------------------------------------

/// The real cluster client. Checks the write policy again before every
/// create, so a routing-gate bypass still cannot write outside the fence.
#[derive(Clone)]
pub struct KubeCluster {
    client: Client,
    policy: Arc<WritePolicy>,
    default_namespace: String,
}

impl KubeCluster {
    pub fn new(client: Client, policy: Arc<WritePolicy>, default_namespace: String) -> Self {
        Self {
            client,
            policy,
            default_namespace,
        }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    fn dynamic_api(&self, gvr: &GvrSpec, namespace: &str) -> Api<DynamicObject> {
        let gvk = GroupVersionKind::gvk(&gvr.group, &gvr.version, &gvr.kind_hint());
        let ar = ApiResource::from_gvk_with_plural(&gvk, &gvr.resource);
        Api::namespaced_with(self.client.clone(), namespace, &ar)
    }
}

#[async_trait]
impl ObservationWriter for KubeCluster {
    async fn create(&self, target: &WriteTarget, spec: &ObservationSpec) -> Result<(), ZenError> {
        self.policy
            .check(&target.gvr, Some(&target.namespace))
            .map_err(ZenError::PolicyDenied)?;

        let gvk = GroupVersionKind::gvk(
            &target.gvr.group,
            &target.gvr.version,
            &target.gvr.kind_hint(),
        );
        let ar = ApiResource::from_gvk_with_plural(&gvk, &target.gvr.resource);
        let mut object = DynamicObject::new(&target.name, &ar);
        object.data = serde_json::json!({
            "spec": spec,
        });
        object
            .metadata
            .labels
            .get_or_insert_with(Default::default)
            .insert("app.kubernetes.io/managed-by".to_string(), "zen-watcher".to_string());

        let api = self.dynamic_api(&target.gvr, &target.namespace);
        match api.create(&PostParams::default(), &object).await {
            Ok(_) => {
                debug!(name = %target.name, namespace = %target.namespace, "Observation created");
                Ok(())
            }
            Err(e) => Err(map_kube_error(e, &target.name)),
        }
    }
}

#[async_trait]
impl ObservationJanitor for KubeCluster {
    async fn list(&self, namespace: &str) -> Result<Vec<ObservationRecord>, ZenError> {
        let api = self.dynamic_api(&GvrSpec::observations(), namespace);
        let objects = api
            .list(&ListParams::default())
            .await
            .map_err(|e| map_kube_error(e, "list"))?;

        let mut records = Vec::with_capacity(objects.items.len());
        for object in objects.items {
            let name = match &object.metadata.name {
                Some(n) => n.clone(),
                None => continue,
            };
            let created_at = object
                .metadata
                .creation_timestamp
                .as_ref()
                .map(|t| t.0)
                .unwrap_or_else(Utc::now);
            let ttl_seconds = object
                .data
                .pointer("/spec/ttlSecondsAfterCreation")
                .and_then(|v| v.as_u64());
            records.push(ObservationRecord {
                name,
                namespace: namespace.to_string(),
                created_at,
                ttl_seconds,
            });
        }
        Ok(records)
    }

    async fn delete(&self, namespace: &str, name: &str) -> Result<(), ZenError> {
        let api = self.dynamic_api(&GvrSpec::observations(), namespace);
        match api.delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            // Already gone is fine: the sweep is idempotent.
            Err(kube::Error::Api(ae)) if ae.code == 404 => Ok(()),
            Err(e) => Err(map_kube_error(e, name)),
        }
    }
}

#[async_trait]
impl SecretStore for KubeCluster {
    async fn read_key(&self, secret: &SecretRef, default_key: &str) -> Result<String, ZenError> {
        let namespace = secret
            .namespace
            .clone()
            .unwrap_or_else(|| self.default_namespace.clone());
        let api: Api<Secret> = Api::namespaced(self.client.clone(), &namespace);
        let object = api
            .get(&secret.name)
            .await
            .map_err(|e| map_kube_error(e, &secret.name))?;

        let key = secret.key.as_deref().unwrap_or(default_key);
        let data = object.data.unwrap_or_default();
        let bytes = data.get(key).ok_or_else(|| {
            ZenError::Validation(format!(
                "secret '{}/{}' has no key '{key}'",
                namespace, secret.name
            ))
        })?;
        String::from_utf8(bytes.0.clone()).map_err(|_| {
            ZenError::Validation(format!(
                "secret '{}/{}' key '{key}' is not UTF-8",
                namespace, secret.name
            ))
        })
    }
}

#[async_trait]
impl LogFetcher for KubeCluster {
    async fn list_pods(
        &self,
        namespace: &str,
        label_selector: &str,
    ) -> Result<Vec<String>, ZenError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let pods = api
            .list(&ListParams::default().labels(label_selector))
            .await
            .map_err(|e| map_kube_error(e, label_selector))?;
        Ok(pods
            .items
            .into_iter()
            .filter_map(|p| p.metadata.name)
            .collect())
    }

    async fn fetch_logs(
        &self,
        namespace: &str,
        pod: &str,
        container: Option<&str>,
        since_seconds: Option<i64>,
    ) -> Result<String, ZenError> {
        let api: Api<Pod> = Api::namespaced(self.client.clone(), namespace);
        let params = LogParams {
            container: container.map(str::to_string),
            since_seconds,
            timestamps: true,
            ..LogParams::default()
        };
        api.logs(pod, &params)
            .await
            .map_err(|e| map_kube_error(e, pod))
    }
}

fn map_kube_error(error: kube::Error, name: &str) -> ZenError {
    match error {
        kube::Error::Api(ae) if ae.code == 409 => ZenError::ConflictOnCreate {
            name: name.to_string(),
        },
        kube::Error::Api(ae) if ae.code >= 500 => {
            warn!(code = ae.code, message = %ae.message, "Transient apiserver error");
            ZenError::Transient(ae.message)
        }
        kube::Error::Service(e) => ZenError::Transient(e.to_string()),
        kube::Error::HyperError(e) => ZenError::Transient(e.to_string()),
        other => ZenError::Anyhow(anyhow::anyhow!(other)),
    }
}
