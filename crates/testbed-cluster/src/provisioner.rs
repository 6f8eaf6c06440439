//! Provisioning rounds
//!
//! One [`CapiProvisioner`] owns one round: a fixed set of dependency
//! manifests and suffixed `Cluster` manifests. Provisioning creates the
//! dependencies, then the clusters, then waits for every cluster to report
//! `Provisioned`. Teardown runs the other way round and tolerates objects
//! that are already gone, so it is safe after a round that failed halfway.
//!
//! There is no rollback: when provisioning fails, call
//! [`ClusterProvisioner::unprovision`].

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
#[cfg(test)]
use mockall::automock;
use parking_lot::Mutex;
use testbed_common::retry::poll_with_observer;
use testbed_common::{Error, RunContext};
use tracing::{debug, info, warn};

use crate::config::ProvisionerConfig;
use crate::credentials::{fetch_admin_credential, read_admin_credential, Credential};
use crate::health::{check_health, ClusterConnector};
use crate::manifest::{classify_manifests, generate_session_suffix, Manifest};
use crate::store::ObjectStore;
use crate::watch::{delete_and_wait, phase_reached, watch_until};
use crate::PHASE_PROVISIONED;

/// Where a round is in its lifecycle
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProvisionState {
    /// Nothing created yet, or everything torn down
    Unprovisioned,
    /// Every dependency exists
    DependenciesCreated,
    /// Every cluster object exists
    ClustersCreated,
    /// Every cluster reported `Provisioned`
    Provisioned,
    /// Teardown in progress
    Unprovisioning,
    /// Every cluster is confirmed deleted; dependencies remain
    ClustersDeleted,
    /// Every dependency is deleted
    DependenciesDeleted,
}

impl fmt::Display for ProvisionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

/// The manifests one round works on
#[derive(Clone, Debug)]
pub struct ProvisionSession {
    /// Suffix appended to every cluster name in this round
    pub suffix: String,
    /// Non-cluster manifests, in creation order
    pub dependencies: Vec<Manifest>,
    /// Suffixed cluster manifests, in creation order
    pub clusters: Vec<Manifest>,
}

impl ProvisionSession {
    /// Classify `manifests` under `suffix`
    pub fn new(manifests: &[Manifest], suffix: impl Into<String>) -> Self {
        let suffix = suffix.into();
        let classified = classify_manifests(manifests, Some(&suffix));
        Self {
            suffix,
            dependencies: classified.dependencies,
            clusters: classified.clusters,
        }
    }
}

/// Lifecycle of one provisioning round
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterProvisioner: Send + Sync {
    /// Create dependencies, then clusters, then wait for every cluster to
    /// reach `Provisioned`
    async fn provision(&self, ctx: &RunContext) -> Result<(), Error>;

    /// Poll until every cluster's credential is readable and its API server
    /// answers `/livez` and `/healthz`
    async fn wait_for_provisioned_clusters(&self, ctx: &RunContext) -> Result<(), Error>;

    /// Admin credential of every cluster, keyed by suffixed cluster name
    async fn admin_credentials(
        &self,
        ctx: &RunContext,
    ) -> Result<BTreeMap<String, Credential>, Error>;

    /// Number of clusters in this round
    fn num_clusters_provisioned_in_round(&self) -> usize;

    /// Delete every cluster and wait for each deletion, then delete
    /// dependencies; objects already gone are skipped
    async fn unprovision(&self, ctx: &RunContext) -> Result<(), Error>;
}

/// [`ClusterProvisioner`] for Cluster API manifests on a management cluster
pub struct CapiProvisioner {
    store: Arc<dyn ObjectStore>,
    connector: Arc<dyn ClusterConnector>,
    session: ProvisionSession,
    config: ProvisionerConfig,
    state: Mutex<StateLog>,
}

/// Current state plus every state entered, oldest first
#[derive(Debug)]
struct StateLog {
    current: ProvisionState,
    entered: Vec<ProvisionState>,
}

impl StateLog {
    fn new() -> Self {
        Self {
            current: ProvisionState::Unprovisioned,
            entered: vec![ProvisionState::Unprovisioned],
        }
    }
}

impl CapiProvisioner {
    /// A round over `manifests` with a freshly generated suffix
    pub fn new(
        store: Arc<dyn ObjectStore>,
        connector: Arc<dyn ClusterConnector>,
        manifests: &[Manifest],
        config: ProvisionerConfig,
    ) -> Self {
        Self::with_suffix(store, connector, manifests, generate_session_suffix(), config)
    }

    /// A round over `manifests` with a caller-chosen suffix
    pub fn with_suffix(
        store: Arc<dyn ObjectStore>,
        connector: Arc<dyn ClusterConnector>,
        manifests: &[Manifest],
        suffix: impl Into<String>,
        config: ProvisionerConfig,
    ) -> Self {
        let session = ProvisionSession::new(manifests, suffix);
        info!(
            suffix = %session.suffix,
            dependencies = session.dependencies.len(),
            clusters = session.clusters.len(),
            "provisioning round prepared"
        );
        Self {
            store,
            connector,
            session,
            config,
            state: Mutex::new(StateLog::new()),
        }
    }

    /// Current lifecycle state
    pub fn state(&self) -> ProvisionState {
        self.state.lock().current
    }

    /// Every state this round has entered, oldest first
    pub fn history(&self) -> Vec<ProvisionState> {
        self.state.lock().entered.clone()
    }

    /// The round's classified manifests
    pub fn session(&self) -> &ProvisionSession {
        &self.session
    }

    fn transition(&self, next: ProvisionState) {
        let previous = {
            let mut log = self.state.lock();
            log.entered.push(next);
            std::mem::replace(&mut log.current, next)
        };
        info!(suffix = %self.session.suffix, from = %previous, to = %next, "provisioning state changed");
    }

    async fn create_all(&self, manifests: &[Manifest], stage: &str) -> Result<(), Error> {
        for manifest in manifests {
            let target = manifest.resource_ref();
            self.store
                .create(manifest.object())
                .await
                .map_err(|e| Error::provision(stage, target.to_string(), e))?;
            debug!(resource = %target, "created");
        }
        Ok(())
    }

    async fn check_cluster_ready(&self, cluster: &Manifest) -> Result<(), Error> {
        let credential = read_admin_credential(self.store.as_ref(), &cluster.resource_ref()).await?;
        let probe = self.connector.connect(&credential).await?;
        check_health(probe.as_ref()).await
    }
}

#[async_trait]
impl ClusterProvisioner for CapiProvisioner {
    async fn provision(&self, ctx: &RunContext) -> Result<(), Error> {
        let state = self.state();
        if state != ProvisionState::Unprovisioned {
            return Err(Error::internal_with_context(
                "provision",
                format!("round {} is {}, not Unprovisioned", self.session.suffix, state),
            ));
        }

        self.create_all(&self.session.dependencies, "creating dependency")
            .await?;
        self.transition(ProvisionState::DependenciesCreated);

        self.create_all(&self.session.clusters, "creating cluster")
            .await?;
        self.transition(ProvisionState::ClustersCreated);

        for cluster in &self.session.clusters {
            let target = cluster.resource_ref();
            info!(cluster = %target, "waiting for cluster to be provisioned");
            watch_until(ctx, self.store.as_ref(), &target, phase_reached(PHASE_PROVISIONED))
                .await
                .map_err(|e| Error::provision("waiting for", target.to_string(), e))?;
            info!(cluster = %target, "cluster provisioned");
        }
        self.transition(ProvisionState::Provisioned);
        Ok(())
    }

    async fn wait_for_provisioned_clusters(&self, ctx: &RunContext) -> Result<(), Error> {
        poll_with_observer(
            ctx,
            "wait for provisioned clusters",
            self.config.readiness_interval,
            || async {
                for cluster in &self.session.clusters {
                    self.check_cluster_ready(cluster).await?;
                }
                Ok::<(), Error>(())
            },
            |failure| {
                debug!(attempt = failure.attempt, error = %failure.error, "clusters not ready yet");
            },
        )
        .await?;
        info!(suffix = %self.session.suffix, "all clusters healthy");
        Ok(())
    }

    async fn admin_credentials(
        &self,
        ctx: &RunContext,
    ) -> Result<BTreeMap<String, Credential>, Error> {
        let mut credentials = BTreeMap::new();
        for cluster in &self.session.clusters {
            let credential = fetch_admin_credential(
                ctx,
                self.store.as_ref(),
                &cluster.resource_ref(),
                self.config.credential_interval,
                self.config.credential_timeout,
            )
            .await?;
            credentials.insert(cluster.name().to_string(), credential);
        }
        Ok(credentials)
    }

    fn num_clusters_provisioned_in_round(&self) -> usize {
        self.session.clusters.len()
    }

    async fn unprovision(&self, ctx: &RunContext) -> Result<(), Error> {
        self.transition(ProvisionState::Unprovisioning);

        for cluster in &self.session.clusters {
            let target = cluster.resource_ref();
            match delete_and_wait(ctx, self.store.as_ref(), &target).await {
                Ok(()) => info!(cluster = %target, "cluster deleted"),
                Err(e) if e.is_not_found() => debug!(cluster = %target, "cluster already gone"),
                Err(e) => {
                    warn!(cluster = %target, error = %e, "cluster teardown failed");
                    return Err(e);
                }
            }
        }
        self.transition(ProvisionState::ClustersDeleted);

        for dependency in &self.session.dependencies {
            let target = dependency.resource_ref();
            match self.store.delete(&target).await {
                Ok(()) => debug!(resource = %target, "dependency deleted"),
                Err(e) if e.is_not_found() => debug!(resource = %target, "dependency already gone"),
                Err(e) => {
                    warn!(resource = %target, error = %e, "dependency teardown failed");
                    return Err(e);
                }
            }
        }
        self.transition(ProvisionState::DependenciesDeleted);
        self.transition(ProvisionState::Unprovisioned);
        Ok(())
    }
}

/// Tear down several rounds, attempting every one
///
/// Failures are collected rather than stopping at the first; more than one
/// is reported as [`Error::Aggregate`].
pub async fn unprovision_all(
    ctx: &RunContext,
    provisioners: &[Arc<dyn ClusterProvisioner>],
) -> Result<(), Error> {
    let mut errors = Vec::new();
    for provisioner in provisioners {
        if let Err(e) = provisioner.unprovision(ctx).await {
            warn!(error = %e, "round teardown failed");
            errors.push(e);
        }
    }
    Error::aggregate(errors)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::health::{HealthProbe, MockClusterConnector, MockHealthProbe};
    use crate::manifest::parse_manifests;
    use crate::store::{MockObjectStore, ResourceEvent};
    use base64::engine::general_purpose::STANDARD;
    use base64::Engine;
    use futures::stream;
    use futures::StreamExt;
    use kube::api::DynamicObject;
    use mockall::Sequence;
    use serde_json::json;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    const BUNDLE: &str = r#"
apiVersion: infrastructure.cluster.x-k8s.io/v1beta1
kind: DockerCluster
metadata: {name: dev, namespace: default}
---
apiVersion: controlplane.cluster.x-k8s.io/v1beta1
kind: KubeadmControlPlane
metadata: {name: dev-control-plane, namespace: default}
---
apiVersion: cluster.x-k8s.io/v1beta1
kind: Cluster
metadata: {name: dev, namespace: default}
"#;

    const KUBECONFIG: &str = "clusters:\n- name: c\n  cluster:\n    server: https://172.18.0.3:6443\nusers:\n- name: u\n  user:\n    token: t\n";

    fn created_name(object: &DynamicObject) -> String {
        object.metadata.name.clone().unwrap_or_default()
    }

    fn phased(phase: &str) -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "cluster.x-k8s.io/v1beta1",
            "kind": "Cluster",
            "metadata": { "name": "dev-abc", "namespace": "default", "resourceVersion": "3" },
            "status": { "phase": phase },
        }))
        .unwrap()
    }

    fn kubeconfig_secret() -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "v1",
            "kind": "Secret",
            "metadata": { "name": "dev-abc-kubeconfig", "namespace": "default" },
            "data": { "value": STANDARD.encode(KUBECONFIG) },
        }))
        .unwrap()
    }

    fn provisioner(store: MockObjectStore, connector: MockClusterConnector) -> CapiProvisioner {
        CapiProvisioner::with_suffix(
            Arc::new(store),
            Arc::new(connector),
            &parse_manifests(BUNDLE).unwrap(),
            "abc",
            ProvisionerConfig::default(),
        )
    }

    #[test]
    fn session_splits_and_suffixes() {
        let p = provisioner(MockObjectStore::new(), MockClusterConnector::new());
        assert_eq!(p.session().suffix, "abc");
        assert_eq!(p.session().dependencies.len(), 2);
        assert_eq!(p.session().clusters[0].name(), "dev-abc");
        assert_eq!(p.num_clusters_provisioned_in_round(), 1);
        assert_eq!(p.state(), ProvisionState::Unprovisioned);
    }

    #[test]
    fn generated_suffix_is_applied() {
        let p = CapiProvisioner::new(
            Arc::new(MockObjectStore::new()),
            Arc::new(MockClusterConnector::new()),
            &parse_manifests(BUNDLE).unwrap(),
            ProvisionerConfig::default(),
        );
        let expected = format!("dev-{}", p.session().suffix);
        assert_eq!(p.session().clusters[0].name(), expected);
    }

    #[tokio::test]
    async fn provision_creates_dependencies_before_clusters_then_waits() {
        let mut seq = Sequence::new();
        let mut store = MockObjectStore::new();
        for expected in ["dev", "dev-control-plane", "dev-abc"] {
            store
                .expect_create()
                .withf(move |o| created_name(o) == expected)
                .times(1)
                .in_sequence(&mut seq)
                .returning(|o| Ok(o.clone()));
        }
        store
            .expect_watch()
            .withf(|target, _| target.name == "dev-abc" && target.kind == "Cluster")
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| {
                Ok(stream::iter(
                    ["", "Provisioning", "Provisioned"]
                        .into_iter()
                        .map(|p| Ok(ResourceEvent::Modified(phased(p)))),
                )
                .boxed())
            });

        let p = provisioner(store, MockClusterConnector::new());
        p.provision(&RunContext::background()).await.unwrap();
        assert_eq!(p.state(), ProvisionState::Provisioned);
    }

    #[tokio::test]
    async fn failed_dependency_stops_round_and_teardown_still_succeeds() {
        let mut store = MockObjectStore::new();
        store
            .expect_create()
            .withf(|o| created_name(o) == "dev")
            .times(1)
            .returning(|o| Ok(o.clone()));
        store
            .expect_create()
            .withf(|o| created_name(o) == "dev-control-plane")
            .times(1)
            .returning(|_| Err(Error::internal("admission webhook denied the request")));
        store
            .expect_get()
            .returning(|t| Err(Error::not_found(t.to_string())));
        store.expect_watch().never();
        store.expect_delete().times(2).returning(|t| {
            if t.name == "dev" {
                Ok(())
            } else {
                Err(Error::not_found(t.to_string()))
            }
        });

        let p = provisioner(store, MockClusterConnector::new());
        let ctx = RunContext::background();

        match p.provision(&ctx).await {
            Err(Error::Provision { stage, resource, .. }) => {
                assert_eq!(stage, "creating dependency");
                assert_eq!(resource, "KubeadmControlPlane default/dev-control-plane");
            }
            other => panic!("expected provision error, got {other:?}"),
        }
        assert_eq!(p.state(), ProvisionState::Unprovisioned);

        p.unprovision(&ctx).await.unwrap();
        assert_eq!(p.state(), ProvisionState::Unprovisioned);
        assert_eq!(
            p.history(),
            vec![
                ProvisionState::Unprovisioned,
                ProvisionState::Unprovisioning,
                ProvisionState::ClustersDeleted,
                ProvisionState::DependenciesDeleted,
                ProvisionState::Unprovisioned,
            ]
        );
    }

    #[tokio::test]
    async fn failed_dependency_delete_stops_before_dependencies_deleted() {
        let mut store = MockObjectStore::new();
        store
            .expect_get()
            .returning(|t| Err(Error::not_found(t.to_string())));
        store
            .expect_delete()
            .times(1)
            .returning(|_| Err(Error::internal("etcd unavailable")));

        let p = provisioner(store, MockClusterConnector::new());
        assert!(p.unprovision(&RunContext::background()).await.is_err());
        assert_eq!(p.state(), ProvisionState::ClustersDeleted);
    }

    #[tokio::test]
    async fn provision_twice_is_rejected() {
        let mut store = MockObjectStore::new();
        store.expect_create().returning(|o| Ok(o.clone()));
        store.expect_watch().returning(|_, _| {
            Ok(stream::iter([Ok(ResourceEvent::Added(phased("Provisioned")))]).boxed())
        });

        let p = provisioner(store, MockClusterConnector::new());
        let ctx = RunContext::background();
        p.provision(&ctx).await.unwrap();
        assert!(p.provision(&ctx).await.is_err());
    }

    #[tokio::test]
    async fn admin_credentials_are_keyed_by_suffixed_name() {
        let mut store = MockObjectStore::new();
        store
            .expect_get()
            .withf(|t| t.kind == "Secret" && t.name == "dev-abc-kubeconfig")
            .returning(|_| Ok(kubeconfig_secret()));

        let p = provisioner(store, MockClusterConnector::new());
        let credentials = p.admin_credentials(&RunContext::background()).await.unwrap();

        assert_eq!(credentials.len(), 1);
        assert_eq!(credentials["dev-abc"].server(), "https://172.18.0.3:6443");
    }

    #[tokio::test(start_paused = true)]
    async fn waits_until_cluster_answers_health_probes() {
        let mut store = MockObjectStore::new();
        store.expect_get().returning(|_| Ok(kubeconfig_secret()));

        let connects = Arc::new(AtomicU32::new(0));
        let c = connects.clone();
        let mut connector = MockClusterConnector::new();
        connector.expect_connect().returning(move |credential| {
            assert_eq!(credential.cluster(), "dev-abc");
            if c.fetch_add(1, Ordering::SeqCst) == 0 {
                return Err(Error::internal("connection refused"));
            }
            let mut probe = MockHealthProbe::new();
            probe.expect_livez().returning(|| Ok("ok".to_string()));
            probe.expect_healthz().returning(|| Ok("ok".to_string()));
            Ok(Box::new(probe) as Box<dyn HealthProbe>)
        });

        let p = provisioner(store, connector);
        let started = tokio::time::Instant::now();
        p.wait_for_provisioned_clusters(&RunContext::background())
            .await
            .unwrap();

        assert_eq!(connects.load(Ordering::SeqCst), 2);
        assert_eq!(started.elapsed(), Duration::from_secs(5));
    }

    #[tokio::test]
    async fn unprovision_all_attempts_every_round() {
        let mut failing = MockClusterProvisioner::new();
        failing
            .expect_unprovision()
            .times(1)
            .returning(|_| Err(Error::internal("apiserver unavailable")));
        let mut healthy = MockClusterProvisioner::new();
        healthy.expect_unprovision().times(1).returning(|_| Ok(()));
        let mut also_failing = MockClusterProvisioner::new();
        also_failing
            .expect_unprovision()
            .times(1)
            .returning(|_| Err(Error::internal("forbidden")));

        let rounds: Vec<Arc<dyn ClusterProvisioner>> = vec![
            Arc::new(failing),
            Arc::new(healthy),
            Arc::new(also_failing),
        ];
        match unprovision_all(&RunContext::background(), &rounds).await {
            Err(Error::Aggregate { errors }) => assert_eq!(errors.len(), 2),
            other => panic!("expected aggregate error, got {other:?}"),
        }
    }
}
