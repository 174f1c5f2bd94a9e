//! The write-path safety rail: allow-list / deny-list over destination
//! resource classes.
//!
//! Both the processor's routing gate and the low-level writer evaluate the
//! same policy; either may short-circuit a write.

use std::collections::HashSet;

use tracing::warn;

use zen_common::{GvrSpec, PolicyDenial};

/// Core resource classes with cluster-privileged semantics. Never writable,
/// regardless of allow-list content.
const HARD_DENY: &[(&str, &str)] = &[
    ("", "secrets"),
    ("", "serviceaccounts"),
    ("rbac.authorization.k8s.io", "roles"),
    ("rbac.authorization.k8s.io", "rolebindings"),
    ("rbac.authorization.k8s.io", "clusterroles"),
    ("rbac.authorization.k8s.io", "clusterrolebindings"),
    ("admissionregistration.k8s.io", "validatingwebhookconfigurations"),
    ("admissionregistration.k8s.io", "mutatingwebhookconfigurations"),
    ("apiextensions.k8s.io", "customresourcedefinitions"),
];

/// Evaluated on every write: hard deny first, then the explicit allow sets.
#[derive(Debug, Clone)]
pub struct WritePolicy {
    allowed_gvrs: HashSet<GvrSpec>,
    allowed_namespaces: HashSet<String>,
    allow_cluster_scoped: bool,
}

impl WritePolicy {
    /// Default policy: the canonical Observation triple, the given watch
    /// namespaces, no cluster-scoped writes.
    pub fn new(watch_namespaces: &[String]) -> Self {
        let mut allowed_gvrs = HashSet::new();
        allowed_gvrs.insert(GvrSpec::observations());
        Self {
            allowed_gvrs,
            allowed_namespaces: watch_namespaces.iter().cloned().collect(),
            allow_cluster_scoped: false,
        }
    }

    /// Extend the allow-list with operator-approved triples. Entries on the
    /// hard deny list are refused here rather than at write time.
    pub fn allow_gvrs(mut self, gvrs: &[GvrSpec]) -> Self {
        for gvr in gvrs {
            if is_hard_denied(gvr) {
                warn!(gvr = %gvr, "Refusing to allow-list a hard-denied resource");
                continue;
            }
            self.allowed_gvrs.insert(gvr.clone());
        }
        self
    }

    pub fn allow_namespaces(mut self, namespaces: &[String]) -> Self {
        self.allowed_namespaces.extend(namespaces.iter().cloned());
        self
    }

    pub fn allow_cluster_scoped(mut self, allow: bool) -> Self {
        self.allow_cluster_scoped = allow;
        self
    }

    /// Validate a (triple, namespace) write target. `None` namespace means
    /// a cluster-scoped write.
    pub fn check(&self, gvr: &GvrSpec, namespace: Option<&str>) -> Result<(), PolicyDenial> {
        if is_hard_denied(gvr) {
            let denial = PolicyDenial::GvrDenied(gvr.to_string());
            warn!(gvr = %gvr, "Write blocked by hard deny list");
            return Err(denial);
        }
        let namespace = match namespace {
            Some(ns) => ns,
            None => {
                if self.allow_cluster_scoped {
                    return self.check_gvr(gvr);
                }
                warn!(gvr = %gvr, "Cluster-scoped write blocked");
                return Err(PolicyDenial::ClusterScopedNotAllowed(gvr.to_string()));
            }
        };
        self.check_gvr(gvr)?;
        if !self.allowed_namespaces.contains(namespace) {
            warn!(gvr = %gvr, namespace, "Write blocked: namespace not allowed");
            return Err(PolicyDenial::NamespaceNotAllowed(namespace.to_string()));
        }
        Ok(())
    }

    fn check_gvr(&self, gvr: &GvrSpec) -> Result<(), PolicyDenial> {
        if !self.allowed_gvrs.contains(gvr) {
            warn!(gvr = %gvr, "Write blocked: resource not on allow list");
            return Err(PolicyDenial::GvrNotAllowed(gvr.to_string()));
        }
        Ok(())
    }
}

fn is_hard_denied(gvr: &GvrSpec) -> bool {
    HARD_DENY
        .iter()
        .any(|(group, resource)| gvr.group == *group && gvr.resource == *resource)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy() -> WritePolicy {
        WritePolicy::new(&["zen-system".to_string()])
    }

    #[test]
    fn canonical_triple_in_watch_namespace_is_allowed() {
        assert!(policy()
            .check(&GvrSpec::observations(), Some("zen-system"))
            .is_ok());
    }

    #[test]
    fn secrets_are_denied_even_when_allow_listed() {
        let secrets = GvrSpec::new("", "v1", "secrets");
        let p = policy().allow_gvrs(&[secrets.clone()]);
        let denial = p.check(&secrets, Some("zen-system")).unwrap_err();
        assert!(matches!(denial, PolicyDenial::GvrDenied(_)));
    }

    #[test]
    fn rbac_and_webhook_configs_are_hard_denied() {
        let p = policy().allow_cluster_scoped(true);
        for (group, resource) in [
            ("rbac.authorization.k8s.io", "clusterrolebindings"),
            ("admissionregistration.k8s.io", "mutatingwebhookconfigurations"),
            ("apiextensions.k8s.io", "customresourcedefinitions"),
        ] {
            let gvr = GvrSpec::new(group, "v1", resource);
            assert!(matches!(
                p.check(&gvr, None).unwrap_err(),
                PolicyDenial::GvrDenied(_)
            ));
        }
    }

    #[test]
    fn unlisted_gvr_is_not_allowed() {
        let gvr = GvrSpec::new("apps", "v1", "deployments");
        assert!(matches!(
            policy().check(&gvr, Some("zen-system")).unwrap_err(),
            PolicyDenial::GvrNotAllowed(_)
        ));
    }

    #[test]
    fn foreign_namespace_is_not_allowed() {
        assert!(matches!(
            policy()
                .check(&GvrSpec::observations(), Some("kube-system"))
                .unwrap_err(),
            PolicyDenial::NamespaceNotAllowed(_)
        ));
    }

    #[test]
    fn cluster_scoped_denied_unless_approved() {
        assert!(matches!(
            policy().check(&GvrSpec::observations(), None).unwrap_err(),
            PolicyDenial::ClusterScopedNotAllowed(_)
        ));
        assert!(policy()
            .allow_cluster_scoped(true)
            .check(&GvrSpec::observations(), None)
            .is_ok());
    }

    #[test]
    fn allow_listing_extends_but_namespace_still_checked() {
        let deployments = GvrSpec::new("apps", "v1", "deployments");
        let p = policy().allow_gvrs(&[deployments.clone()]);
        assert!(p.check(&deployments, Some("zen-system")).is_ok());
        assert!(p.check(&deployments, Some("prod")).is_err());
    }
}
