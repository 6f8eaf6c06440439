//! In-memory management cluster for provisioning tests

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use futures::channel::mpsc;
use futures::StreamExt;
use kube::api::DynamicObject;
use parking_lot::Mutex;
use serde_json::json;
use testbed_cluster::credentials::Credential;
use testbed_cluster::health::{ClusterConnector, HealthProbe};
use testbed_cluster::store::{EventStream, ListQuery, ObjectStore, ResourceEvent, ResourceRef};
use testbed_common::Error;

type Sender = mpsc::UnboundedSender<Result<ResourceEvent, Error>>;

#[derive(Default)]
struct State {
    objects: BTreeMap<ResourceRef, DynamicObject>,
    watchers: Vec<(ResourceRef, Sender)>,
    log: Vec<String>,
    version: u64,
    reject_kind: Option<String>,
    phase_scripts: HashMap<String, Vec<String>>,
}

impl State {
    fn stamp(&mut self, object: &mut DynamicObject) {
        self.version += 1;
        object.metadata.resource_version = Some(self.version.to_string());
    }

    fn notify(&mut self, target: &ResourceRef, event: ResourceEvent) {
        self.watchers.retain(|(watched, tx)| {
            if watched != target {
                return true;
            }
            tx.unbounded_send(Ok(event.clone())).is_ok()
        });
    }
}

/// Object store with live watches, an operation log and scripted phases
#[derive(Default)]
pub struct MemoryStore {
    state: Mutex<State>,
    consumed: Arc<AtomicUsize>,
    deletions_seen: Arc<AtomicUsize>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fail every create of `kind`
    pub fn reject_creates_of(&self, kind: &str) {
        self.state.lock().reject_kind = Some(kind.to_string());
    }

    /// Phases applied to cluster `name` once a watch on it opens
    ///
    /// New clusters start with an empty phase.
    pub fn script_phases(&self, name: &str, phases: &[&str]) {
        self.state.lock().phase_scripts.insert(
            name.to_string(),
            phases.iter().map(|p| p.to_string()).collect(),
        );
    }

    /// Insert or replace an object without logging
    pub fn put(&self, object: DynamicObject) {
        let target = ResourceRef::from_object(&object).unwrap();
        let mut state = self.state.lock();
        let mut object = object;
        state.stamp(&mut object);
        state.objects.insert(target, object);
    }

    pub fn contains(&self, target: &ResourceRef) -> bool {
        self.state.lock().objects.contains_key(target)
    }

    pub fn len(&self) -> usize {
        self.state.lock().objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn log(&self) -> Vec<String> {
        self.state.lock().log.clone()
    }

    /// Events handed to watchers that were actually consumed
    pub fn events_consumed(&self) -> usize {
        self.consumed.load(Ordering::SeqCst)
    }

    /// Deleted events that were actually consumed
    pub fn deletions_seen(&self) -> usize {
        self.deletions_seen.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, target: &ResourceRef) -> Result<DynamicObject, Error> {
        let mut state = self.state.lock();
        state.log.push(format!("get {target}"));
        state
            .objects
            .get(target)
            .cloned()
            .ok_or_else(|| Error::not_found(target.to_string()))
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<DynamicObject>, Error> {
        let state = self.state.lock();
        Ok(state
            .objects
            .iter()
            .filter(|(r, _)| r.kind == query.kind && r.api_version == query.api_version)
            .filter(|(r, _)| query.namespace.is_none() || r.namespace == query.namespace)
            .filter(|(_, o)| query.matches_labels(o.metadata.labels.as_ref()))
            .map(|(_, o)| o.clone())
            .collect())
    }

    async fn create(&self, object: &DynamicObject) -> Result<DynamicObject, Error> {
        let target = ResourceRef::from_object(object)?;
        let mut state = self.state.lock();
        if state.reject_kind.as_deref() == Some(target.kind.as_str()) {
            return Err(Error::internal(format!("admission denied {target}")));
        }
        if state.objects.contains_key(&target) {
            return Err(Error::already_exists(target.to_string()));
        }
        state.log.push(format!("create {target}"));
        let mut created = object.clone();
        if target.kind == "Cluster" && created.data.get("status").is_none() {
            created.data["status"] = json!({ "phase": "" });
        }
        state.stamp(&mut created);
        state.objects.insert(target.clone(), created.clone());
        state.notify(&target, ResourceEvent::Added(created.clone()));
        Ok(created)
    }

    async fn update(&self, object: &DynamicObject) -> Result<DynamicObject, Error> {
        let target = ResourceRef::from_object(object)?;
        let mut state = self.state.lock();
        if !state.objects.contains_key(&target) {
            return Err(Error::not_found(target.to_string()));
        }
        state.log.push(format!("update {target}"));
        let mut updated = object.clone();
        state.stamp(&mut updated);
        state.objects.insert(target.clone(), updated.clone());
        state.notify(&target, ResourceEvent::Modified(updated.clone()));
        Ok(updated)
    }

    async fn delete(&self, target: &ResourceRef) -> Result<(), Error> {
        let mut state = self.state.lock();
        let removed = state
            .objects
            .remove(target)
            .ok_or_else(|| Error::not_found(target.to_string()))?;
        state.log.push(format!("delete {target}"));
        state.notify(target, ResourceEvent::Deleted(removed));
        state.watchers.retain(|(watched, _)| watched != target);
        Ok(())
    }

    async fn watch(
        &self,
        target: &ResourceRef,
        resource_version: Option<String>,
    ) -> Result<EventStream, Error> {
        let (tx, rx) = mpsc::unbounded();
        let mut state = self.state.lock();
        state.log.push(format!("watch {target}"));

        if resource_version.is_none() {
            if let Some(current) = state.objects.get(target).cloned() {
                let _ = tx.unbounded_send(Ok(ResourceEvent::Added(current)));
            }
        }

        let script = state.phase_scripts.remove(&target.name).unwrap_or_default();
        for phase in script {
            let Some(mut object) = state.objects.get(target).cloned() else {
                break;
            };
            object.data["status"] = json!({ "phase": phase });
            state.stamp(&mut object);
            state.objects.insert(target.clone(), object.clone());
            let _ = tx.unbounded_send(Ok(ResourceEvent::Modified(object)));
        }

        state.watchers.push((target.clone(), tx));

        let consumed = self.consumed.clone();
        let deletions = self.deletions_seen.clone();
        Ok(rx
            .inspect(move |event| {
                consumed.fetch_add(1, Ordering::SeqCst);
                if matches!(event, Ok(ResourceEvent::Deleted(_))) {
                    deletions.fetch_add(1, Ordering::SeqCst);
                }
            })
            .boxed())
    }
}

/// Connector whose probes always succeed
#[derive(Default)]
pub struct HealthyConnector {
    connected: Mutex<Vec<String>>,
}

impl HealthyConnector {
    pub fn connected(&self) -> Vec<String> {
        self.connected.lock().clone()
    }
}

struct HealthyProbe;

#[async_trait]
impl HealthProbe for HealthyProbe {
    async fn livez(&self) -> Result<String, Error> {
        Ok("ok".to_string())
    }

    async fn healthz(&self) -> Result<String, Error> {
        Ok("ok".to_string())
    }
}

#[async_trait]
impl ClusterConnector for HealthyConnector {
    async fn connect(&self, credential: &Credential) -> Result<Box<dyn HealthProbe>, Error> {
        self.connected.lock().push(credential.cluster().to_string());
        Ok(Box::new(HealthyProbe))
    }
}

/// Kubeconfig secret Cluster API would write for `cluster`
pub fn kubeconfig_secret(namespace: &str, cluster: &str) -> DynamicObject {
    let kubeconfig = format!(
        "clusters:\n- name: {cluster}\n  cluster:\n    server: https://{cluster}.local:6443\n\
         users:\n- name: admin\n  user:\n    token: t-{cluster}\n"
    );
    serde_json::from_value(json!({
        "apiVersion": "v1",
        "kind": "Secret",
        "metadata": { "name": format!("{cluster}-kubeconfig"), "namespace": namespace },
        "data": { "value": STANDARD.encode(kubeconfig) },
    }))
    .unwrap()
}

/// Label map with one entry
pub fn labels(key: &str, value: &str) -> BTreeMap<String, String> {
    BTreeMap::from([(key.to_string(), value.to_string())])
}
