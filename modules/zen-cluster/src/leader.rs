//! Leader election contract.
//!
//! Consumers (orchestrator, GC, HA) see only the contract: `lead` blocks
//! until elected and hands back a receiver that flips to `false` on loss.

use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Api, ObjectMeta, Patch, PatchParams, PostParams};
use kube::Client;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use zen_common::ZenError;

#[async_trait]
pub trait LeaderElection: Send + Sync {
    /// Block until this replica is elected leader (or `cancel` fires, which
    /// surfaces as a Transient error). The receiver reads `true` while
    /// leadership holds.
    async fn lead(&self, cancel: &CancellationToken) -> Result<watch::Receiver<bool>, ZenError>;
}

// ---------------------------------------------------------------------------
// Disabled mode: every replica leads
// ---------------------------------------------------------------------------

pub struct DisabledElection;

#[async_trait]
impl LeaderElection for DisabledElection {
    async fn lead(&self, _cancel: &CancellationToken) -> Result<watch::Receiver<bool>, ZenError> {
        let (tx, rx) = watch::channel(true);
        // Keep the sender alive for the process lifetime so the receiver
        // never observes a close.
        std::mem::forget(tx);
        Ok(rx)
    }
}

// ---------------------------------------------------------------------------
// Manual mode: leadership driven by a lever (tests, external election)
// ---------------------------------------------------------------------------

pub struct ManualElection {
    state: watch::Receiver<bool>,
}

#[derive(Clone)]
pub struct ManualLever {
    state: watch::Sender<bool>,
}

impl ManualLever {
    pub fn set_leader(&self, leading: bool) {
        let _ = self.state.send(leading);
    }
}

/// Build a (lever, election) pair. The election blocks in `lead` until the
/// lever is set to `true`.
pub fn manual() -> (ManualLever, ManualElection) {
    let (tx, rx) = watch::channel(false);
    (ManualLever { state: tx }, ManualElection { state: rx })
}

#[async_trait]
impl LeaderElection for ManualElection {
    async fn lead(&self, cancel: &CancellationToken) -> Result<watch::Receiver<bool>, ZenError> {
        let mut rx = self.state.clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(ZenError::Transient("cancelled while waiting for election".into())),
            result = rx.wait_for(|leading| *leading) => match result {
                Ok(_) => Ok(self.state.clone()),
                Err(_) => Err(ZenError::Transient("election lever dropped".into())),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Shared mode: one election, many gated components
// ---------------------------------------------------------------------------

/// Fans one leadership signal out to several leader-gated components, so a
/// single Lease renew loop serves the orchestrator, GC, and HA together.
pub struct SharedElection {
    state: watch::Receiver<bool>,
}

impl SharedElection {
    pub fn new(state: watch::Receiver<bool>) -> Self {
        Self { state }
    }
}

#[async_trait]
impl LeaderElection for SharedElection {
    async fn lead(&self, cancel: &CancellationToken) -> Result<watch::Receiver<bool>, ZenError> {
        let mut rx = self.state.clone();
        tokio::select! {
            _ = cancel.cancelled() => Err(ZenError::Transient("cancelled while waiting for election".into())),
            result = rx.wait_for(|leading| *leading) => match result {
                Ok(_) => Ok(self.state.clone()),
                Err(_) => Err(ZenError::Transient("election source dropped".into())),
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Builtin mode: coordination.k8s.io Lease
// ---------------------------------------------------------------------------

pub struct LeaseElection {
    api: Api<Lease>,
    lease_name: String,
    identity: String,
    lease_duration: Duration,
    renew_period: Duration,
}

impl LeaseElection {
    pub fn new(client: Client, namespace: &str, lease_name: &str, identity: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            lease_name: lease_name.to_string(),
            identity: identity.to_string(),
            lease_duration: Duration::from_secs(15),
            renew_period: Duration::from_secs(5),
        }
    }

    async fn try_acquire(&self) -> Result<bool, kube::Error> {
        let now = MicroTime(Utc::now());
        match self.api.get_opt(&self.lease_name).await? {
            None => {
                let lease = Lease {
                    metadata: ObjectMeta {
                        name: Some(self.lease_name.clone()),
                        ..ObjectMeta::default()
                    },
                    spec: Some(LeaseSpec {
                        holder_identity: Some(self.identity.clone()),
                        lease_duration_seconds: Some(self.lease_duration.as_secs() as i32),
                        acquire_time: Some(now.clone()),
                        renew_time: Some(now),
                        lease_transitions: Some(0),
                        ..LeaseSpec::default()
                    }),
                };
                match self.api.create(&PostParams::default(), &lease).await {
                    Ok(_) => Ok(true),
                    // Lost the create race.
                    Err(kube::Error::Api(ae)) if ae.code == 409 => Ok(false),
                    Err(e) => Err(e),
                }
            }
            Some(existing) => {
                let spec = existing.spec.unwrap_or_default();
                let holder = spec.holder_identity.clone().unwrap_or_default();
                let expired = spec
                    .renew_time
                    .as_ref()
                    .map(|t| {
                        let age = Utc::now() - t.0;
                        age.num_seconds() as u64 > self.lease_duration.as_secs()
                    })
                    .unwrap_or(true);

                if holder == self.identity || expired {
                    let transitions = spec.lease_transitions.unwrap_or(0)
                        + if holder == self.identity { 0 } else { 1 };
                    self.renew(transitions).await?;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    async fn renew(&self, transitions: i32) -> Result<(), kube::Error> {
        let now = MicroTime(Utc::now());
        let patch = serde_json::json!({
            "spec": {
                "holderIdentity": self.identity,
                "leaseDurationSeconds": self.lease_duration.as_secs(),
                "renewTime": now,
                "leaseTransitions": transitions,
            }
        });
        self.api
            .patch(
                &self.lease_name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await?;
        Ok(())
    }
}

#[async_trait]
impl LeaderElection for LeaseElection {
    async fn lead(&self, cancel: &CancellationToken) -> Result<watch::Receiver<bool>, ZenError> {
        // Acquisition loop: poll until the lease is ours.
        loop {
            if cancel.is_cancelled() {
                return Err(ZenError::Transient(
                    "cancelled while waiting for election".into(),
                ));
            }
            match self.try_acquire().await {
                Ok(true) => break,
                Ok(false) => {}
                Err(e) => warn!(error = %e, "Lease acquisition attempt failed"),
            }
            tokio::select! {
                _ = cancel.cancelled() => {}
                _ = tokio::time::sleep(self.renew_period) => {}
            }
        }
        info!(lease = %self.lease_name, identity = %self.identity, "Acquired leadership");

        let (tx, rx) = watch::channel(true);
        let api = self.api.clone();
        let lease_name = self.lease_name.clone();
        let identity = self.identity.clone();
        let lease_duration = self.lease_duration;
        let renew_period = self.renew_period;
        let cancel = cancel.clone();

        tokio::spawn(async move {
            let mut failures: u32 = 0;
            let max_failures = (lease_duration.as_secs() / renew_period.as_secs()).max(1) as u32;
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = tokio::time::sleep(renew_period) => {}
                }
                let now = MicroTime(Utc::now());
                let patch = serde_json::json!({
                    "spec": { "holderIdentity": identity, "renewTime": now }
                });
                match api
                    .patch(&lease_name, &PatchParams::default(), &Patch::Merge(&patch))
                    .await
                {
                    Ok(_) => failures = 0,
                    Err(e) => {
                        failures += 1;
                        warn!(error = %e, failures, "Lease renewal failed");
                        if failures >= max_failures {
                            warn!(lease = %lease_name, "Leadership lost");
                            let _ = tx.send(false);
                            break;
                        }
                    }
                }
            }
            let _ = tx.send(false);
        });

        Ok(rx)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn disabled_election_is_immediately_leader() {
        let cancel = CancellationToken::new();
        let rx = DisabledElection.lead(&cancel).await.unwrap();
        assert!(*rx.borrow());
    }

    #[tokio::test]
    async fn manual_election_blocks_until_lever_flips() {
        let (lever, election) = manual();
        let cancel = CancellationToken::new();

        let waited = tokio::spawn(async move { election.lead(&cancel).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waited.is_finished());

        lever.set_leader(true);
        let rx = waited.await.unwrap().unwrap();
        assert!(*rx.borrow());

        lever.set_leader(false);
        assert!(!*rx.borrow());
    }

    #[tokio::test]
    async fn manual_election_cancel_unblocks() {
        let (_lever, election) = manual();
        let cancel = CancellationToken::new();
        cancel.cancel();
        assert!(election.lead(&cancel).await.is_err());
    }
}
