//! Kind registry
//!
//! Maps an `(apiVersion, kind)` pair read from a manifest to the endpoint that
//! serves it and whether it is namespaced. One registry is built at startup and
//! handed to every component that has to interpret kind strings; there is no
//! process-wide scheme. Unknown kinds resolve to [`Error::Mapping`].

use dashmap::DashMap;
use kube::discovery::{ApiResource, Discovery, Scope};
use kube::Client;
use tracing::{debug, info};

use crate::context::RunContext;
use crate::kube_utils::build_api_resource;
use crate::retry::{retry_with_backoff, Backoff};
use crate::Error;

/// Kinds every registry knows without asking the server:
/// (apiVersion, kind, namespaced)
const BUILTIN_KINDS: &[(&str, &str, bool)] = &[
    ("v1", "Namespace", false),
    ("v1", "Secret", true),
    ("v1", "ConfigMap", true),
    ("v1", "ServiceAccount", true),
    ("v1", "Service", true),
    ("apps/v1", "Deployment", true),
    ("rbac.authorization.k8s.io/v1", "Role", true),
    ("rbac.authorization.k8s.io/v1", "RoleBinding", true),
    ("rbac.authorization.k8s.io/v1", "ClusterRole", false),
    ("rbac.authorization.k8s.io/v1", "ClusterRoleBinding", false),
    ("cluster.x-k8s.io/v1beta1", "Cluster", true),
    ("cluster.x-k8s.io/v1beta1", "MachineDeployment", true),
    ("cluster.x-k8s.io/v1beta1", "ClusterClass", true),
    ("controlplane.cluster.x-k8s.io/v1beta1", "KubeadmControlPlane", true),
    ("controlplane.cluster.x-k8s.io/v1beta1", "KubeadmControlPlaneTemplate", true),
    ("bootstrap.cluster.x-k8s.io/v1beta1", "KubeadmConfigTemplate", true),
    ("infrastructure.cluster.x-k8s.io/v1beta1", "DockerCluster", true),
    ("infrastructure.cluster.x-k8s.io/v1beta1", "DockerClusterTemplate", true),
    ("infrastructure.cluster.x-k8s.io/v1beta1", "DockerMachineTemplate", true),
];

/// A resolved kind: where it is served and how it is scoped
#[derive(Clone, Debug, PartialEq)]
pub struct KindEntry {
    /// Endpoint description used to build `Api<DynamicObject>`
    pub resource: ApiResource,
    /// Whether objects of this kind live inside a namespace
    pub namespaced: bool,
}

/// Explicit registry of kinds the provisioner can route.
///
/// Uses `DashMap` so lookups from concurrent provisioning rounds never block
/// each other; shared via `Arc<KindRegistry>`.
#[derive(Debug, Default)]
pub struct KindRegistry {
    entries: DashMap<(String, String), KindEntry>,
}

impl KindRegistry {
    /// An empty registry; every lookup fails until kinds are registered
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry preloaded with core, RBAC and Cluster API kinds
    pub fn with_builtin_kinds() -> Self {
        let registry = Self::new();
        for (api_version, kind, namespaced) in BUILTIN_KINDS {
            registry.register(build_api_resource(api_version, kind), *namespaced);
        }
        registry
    }

    /// Run API discovery and register everything the server serves, on top of
    /// the built-in kinds.
    ///
    /// Discovery is retried on `backoff`; a server that never answers yields
    /// the last discovery error, and a 4xx answer is returned at once.
    pub async fn discover(
        ctx: &RunContext,
        client: &Client,
        backoff: &Backoff,
    ) -> Result<Self, Error> {
        let discovery = retry_with_backoff(ctx, backoff, "api_discovery", || async {
            Discovery::new(client.clone()).run().await.map_err(Error::from)
        })
        .await?;

        let registry = Self::with_builtin_kinds();
        let builtin = registry.len();
        for group in discovery.groups() {
            for version in group.versions() {
                for (ar, caps) in group.versioned_resources(version) {
                    registry.register(ar, matches!(caps.scope, Scope::Namespaced));
                }
            }
        }

        info!(
            builtin,
            discovered = registry.len() - builtin,
            "kind registry populated via API discovery"
        );
        Ok(registry)
    }

    /// Register (or replace) one kind
    pub fn register(&self, resource: ApiResource, namespaced: bool) {
        debug!(
            api_version = %resource.api_version,
            kind = %resource.kind,
            namespaced,
            "registering kind"
        );
        self.entries.insert(
            (resource.api_version.clone(), resource.kind.clone()),
            KindEntry {
                resource,
                namespaced,
            },
        );
    }

    /// Route a kind to its endpoint
    pub fn resolve(&self, api_version: &str, kind: &str) -> Result<KindEntry, Error> {
        self.entries
            .get(&(api_version.to_string(), kind.to_string()))
            .map(|entry| entry.clone())
            .ok_or_else(|| Error::mapping(api_version, kind))
    }

    /// Whether the kind can be routed
    pub fn contains(&self, api_version: &str, kind: &str) -> bool {
        self.entries
            .contains_key(&(api_version.to_string(), kind.to_string()))
    }

    /// Number of registered kinds
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether no kinds are registered
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
