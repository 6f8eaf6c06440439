//! Generic object store
//!
//! Provisioning only needs six verbs against the management cluster: get,
//! list, create, update, delete and watch, each addressed by kind, namespace
//! and name. [`ObjectStore`] is that seam; [`KubeStore`] implements it on
//! `kube::Api<DynamicObject>`, routing kinds through a shared [`KindRegistry`].

use std::collections::BTreeMap;
use std::fmt;
use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use futures::stream::{self, BoxStream};
use futures::StreamExt;
use kube::api::{Api, DeleteParams, DynamicObject, ListParams, PostParams, WatchEvent, WatchParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use testbed_common::kube_utils::{name_field_selector, WATCH_TIMEOUT_SECS};
use testbed_common::registry::KindRegistry;
use testbed_common::{Error, FIELD_MANAGER};
use tracing::debug;

/// Address of one object in the store
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ResourceRef {
    /// apiVersion, e.g. `cluster.x-k8s.io/v1beta1`
    pub api_version: String,
    /// Kind, e.g. `Cluster`
    pub kind: String,
    /// Namespace; `None` for cluster-scoped kinds or the client default
    pub namespace: Option<String>,
    /// Object name
    pub name: String,
}

impl ResourceRef {
    /// Address an object
    pub fn new(
        api_version: impl Into<String>,
        kind: impl Into<String>,
        namespace: Option<&str>,
        name: impl Into<String>,
    ) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            namespace: namespace.map(str::to_string),
            name: name.into(),
        }
    }

    /// Address a core/v1 Secret
    pub fn secret(namespace: Option<&str>, name: impl Into<String>) -> Self {
        Self::new("v1", "Secret", namespace, name)
    }

    /// Address a core/v1 Namespace
    pub fn namespace(name: impl Into<String>) -> Self {
        Self::new("v1", "Namespace", None, name)
    }

    /// Address the object described by `object`
    ///
    /// Fails if the object has no type information or no name.
    pub fn from_object(object: &DynamicObject) -> Result<Self, Error> {
        let types = object.types.as_ref().ok_or_else(|| {
            Error::serialization("object is missing apiVersion/kind")
        })?;
        let name = object.metadata.name.as_deref().ok_or_else(|| {
            Error::serialization_for_kind(&types.kind, "object is missing metadata.name")
        })?;
        Ok(Self::new(
            &types.api_version,
            &types.kind,
            object.metadata.namespace.as_deref(),
            name,
        ))
    }

    /// The same address pinned to `namespace`
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }
}

impl fmt::Display for ResourceRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.namespace {
            Some(ns) => write!(f, "{} {}/{}", self.kind, ns, self.name),
            None => write!(f, "{} {}", self.kind, self.name),
        }
    }
}

/// Selection for [`ObjectStore::list`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ListQuery {
    /// apiVersion of the listed kind
    pub api_version: String,
    /// Kind to list
    pub kind: String,
    /// Namespace to list in; `None` lists across namespaces
    pub namespace: Option<String>,
    /// Label selector, e.g. `testbed.dev/scenario=42`
    pub label_selector: Option<String>,
}

impl ListQuery {
    /// List every object of a kind
    pub fn new(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self {
            api_version: api_version.into(),
            kind: kind.into(),
            ..Default::default()
        }
    }

    /// Restrict to objects carrying `key=value`
    pub fn with_label(mut self, key: &str, value: &str) -> Self {
        self.label_selector = Some(format!("{}={}", key, value));
        self
    }

    /// Restrict to one namespace
    pub fn in_namespace(mut self, namespace: impl Into<String>) -> Self {
        self.namespace = Some(namespace.into());
        self
    }

    /// Whether an object's labels satisfy this query's equality selector
    pub fn matches_labels(&self, labels: Option<&BTreeMap<String, String>>) -> bool {
        let Some(selector) = &self.label_selector else {
            return true;
        };
        selector.split(',').all(|term| match term.split_once('=') {
            Some((key, value)) => labels
                .and_then(|l| l.get(key.trim()))
                .is_some_and(|v| v == value.trim()),
            None => labels.is_some_and(|l| l.contains_key(term.trim())),
        })
    }
}

/// One observation on a watch stream
#[derive(Clone, Debug)]
pub enum ResourceEvent {
    /// The object was created, or already existed when the watch started
    Added(DynamicObject),
    /// The object changed
    Modified(DynamicObject),
    /// The object was deleted; carries its last state
    Deleted(DynamicObject),
}

impl ResourceEvent {
    /// The object carried by the event
    pub fn object(&self) -> &DynamicObject {
        match self {
            ResourceEvent::Added(o) | ResourceEvent::Modified(o) | ResourceEvent::Deleted(o) => o,
        }
    }

    /// Whether this is a deletion
    pub fn is_deleted(&self) -> bool {
        matches!(self, ResourceEvent::Deleted(_))
    }
}

/// Live events for one object; dropping the stream ends the subscription
pub type EventStream = BoxStream<'static, Result<ResourceEvent, Error>>;

/// Verbs the provisioner needs from a cluster
///
/// Every method reports a missing object as [`Error::NotFound`] and an
/// existing one on create as [`Error::AlreadyExists`].
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ObjectStore: Send + Sync {
    /// Fetch one object
    async fn get(&self, target: &ResourceRef) -> Result<DynamicObject, Error>;

    /// List objects matching a query
    async fn list(&self, query: &ListQuery) -> Result<Vec<DynamicObject>, Error>;

    /// Create an object; its type and name come from the object itself
    async fn create(&self, object: &DynamicObject) -> Result<DynamicObject, Error>;

    /// Replace an existing object
    async fn update(&self, object: &DynamicObject) -> Result<DynamicObject, Error>;

    /// Delete one object; completion is observed through [`ObjectStore::watch`]
    async fn delete(&self, target: &ResourceRef) -> Result<(), Error>;

    /// Subscribe to events for exactly one object
    ///
    /// With `resource_version` set the stream starts after that version;
    /// without it the current state is delivered first as `Added`.
    async fn watch(
        &self,
        target: &ResourceRef,
        resource_version: Option<String>,
    ) -> Result<EventStream, Error>;
}

/// [`ObjectStore`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeStore {
    client: Client,
    registry: Arc<KindRegistry>,
}

impl KubeStore {
    /// Wrap a client, routing kinds through `registry`
    pub fn new(client: Client, registry: Arc<KindRegistry>) -> Self {
        Self { client, registry }
    }

    /// The underlying client
    pub fn client(&self) -> &Client {
        &self.client
    }

    fn api(
        &self,
        api_version: &str,
        kind: &str,
        namespace: Option<&str>,
    ) -> Result<Api<DynamicObject>, Error> {
        let entry = self.registry.resolve(api_version, kind)?;
        let client = self.client.clone();
        Ok(match (entry.namespaced, namespace) {
            (true, Some(ns)) => Api::namespaced_with(client, ns, &entry.resource),
            (true, None) => Api::default_namespaced_with(client, &entry.resource),
            (false, _) => Api::all_with(client, &entry.resource),
        })
    }

    fn api_for(&self, target: &ResourceRef) -> Result<Api<DynamicObject>, Error> {
        self.api(&target.api_version, &target.kind, target.namespace.as_deref())
    }
}

/// Translate API status codes into the store's error vocabulary
fn map_api_error(err: kube::Error, target: &ResourceRef) -> Error {
    match err {
        kube::Error::Api(ref ae) if ae.code == 404 => Error::not_found(target.to_string()),
        kube::Error::Api(ref ae) if ae.code == 409 => Error::already_exists(target.to_string()),
        other => Error::from(other),
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

#[async_trait]
impl ObjectStore for KubeStore {
    async fn get(&self, target: &ResourceRef) -> Result<DynamicObject, Error> {
        self.api_for(target)?
            .get(&target.name)
            .await
            .map_err(|e| map_api_error(e, target))
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<DynamicObject>, Error> {
        let api = match &query.namespace {
            Some(ns) => self.api(&query.api_version, &query.kind, Some(ns))?,
            None => {
                let entry = self.registry.resolve(&query.api_version, &query.kind)?;
                Api::all_with(self.client.clone(), &entry.resource)
            }
        };
        let mut params = ListParams::default();
        if let Some(selector) = &query.label_selector {
            params = params.labels(selector);
        }
        Ok(api.list(&params).await?.items)
    }

    async fn create(&self, object: &DynamicObject) -> Result<DynamicObject, Error> {
        let target = ResourceRef::from_object(object)?;
        self.api_for(&target)?
            .create(&post_params(), object)
            .await
            .map_err(|e| map_api_error(e, &target))
    }

    async fn update(&self, object: &DynamicObject) -> Result<DynamicObject, Error> {
        let target = ResourceRef::from_object(object)?;
        self.api_for(&target)?
            .replace(&target.name, &post_params(), object)
            .await
            .map_err(|e| map_api_error(e, &target))
    }

    async fn delete(&self, target: &ResourceRef) -> Result<(), Error> {
        self.api_for(target)?
            .delete(&target.name, &DeleteParams::background())
            .await
            .map(|_| ())
            .map_err(|e| map_api_error(e, target))
    }

    async fn watch(
        &self,
        target: &ResourceRef,
        resource_version: Option<String>,
    ) -> Result<EventStream, Error> {
        let api = self.api_for(target)?;
        let params = watch_params(&target.name);
        let open = move |version: String| {
            let api = api.clone();
            let params = params.clone();
            async move { api.watch(&params, &version).await.map(|events| events.boxed()) }
        };

        let version = resource_version.unwrap_or_else(|| "0".to_string());
        resumable_watch(target.clone(), version, open).await
    }
}

/// Watch parameters selecting one object by name
///
/// Each request is bounded by [`WATCH_TIMEOUT_SECS`]; [`resumable_watch`]
/// reopens it when the server ends it.
fn watch_params(name: &str) -> WatchParams {
    WatchParams::default()
        .fields(&name_field_selector(name))
        .timeout(WATCH_TIMEOUT_SECS)
}

type RawEvents = BoxStream<'static, Result<WatchEvent<DynamicObject>, kube::Error>>;

struct WatchCursor<O> {
    open: O,
    target: ResourceRef,
    version: String,
    events: Option<RawEvents>,
    finished: bool,
}

/// Single-object event stream that survives server-side watch expiry
///
/// The first request is made before returning so a failure to subscribe is
/// reported to the caller. Whenever the server ends a request the watch is
/// reopened from the last resourceVersion seen (bookmarks included). The
/// stream ends after a `Deleted` event or the first error.
async fn resumable_watch<O, Fut>(
    target: ResourceRef,
    version: String,
    mut open: O,
) -> Result<EventStream, Error>
where
    O: FnMut(String) -> Fut + Send + 'static,
    Fut: Future<Output = Result<RawEvents, kube::Error>> + Send + 'static,
{
    let first = open(version.clone())
        .await
        .map_err(|e| map_api_error(e, &target))?;
    let cursor = WatchCursor {
        open,
        target,
        version,
        events: Some(first),
        finished: false,
    };

    Ok(stream::unfold(cursor, |mut cursor| async move {
        if cursor.finished {
            return None;
        }
        loop {
            if cursor.events.is_none() {
                debug!(resource = %cursor.target, version = %cursor.version, "reopening watch");
                match (cursor.open)(cursor.version.clone()).await {
                    Ok(events) => cursor.events = Some(events),
                    Err(e) => {
                        cursor.finished = true;
                        let err = map_api_error(e, &cursor.target);
                        return Some((Err(err), cursor));
                    }
                }
            }
            let Some(events) = cursor.events.as_mut() else {
                continue;
            };

            let item = match events.next().await {
                Some(Ok(event)) => event,
                Some(Err(e)) => {
                    cursor.finished = true;
                    return Some((Err(Error::from(e)), cursor));
                }
                None => {
                    cursor.events = None;
                    continue;
                }
            };

            let event = match item {
                WatchEvent::Added(o) => ResourceEvent::Added(o),
                WatchEvent::Modified(o) => ResourceEvent::Modified(o),
                WatchEvent::Deleted(o) => {
                    cursor.finished = true;
                    ResourceEvent::Deleted(o)
                }
                WatchEvent::Bookmark(bookmark) => {
                    cursor.version = bookmark.metadata.resource_version;
                    continue;
                }
                WatchEvent::Error(e) => {
                    cursor.finished = true;
                    let err = Error::watch(
                        cursor.target.to_string(),
                        format!("{} ({}, code {})", e.message, e.reason, e.code),
                    );
                    return Some((Err(err), cursor));
                }
            };
            if let Some(version) = &event.object().metadata.resource_version {
                cursor.version = version.clone();
            }
            return Some((Ok(event), cursor));
        }
    })
    .boxed())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn cluster_object() -> DynamicObject {
        serde_json::from_value(json!({
            "apiVersion": "cluster.x-k8s.io/v1beta1",
            "kind": "Cluster",
            "metadata": { "name": "dev-abc", "namespace": "default" },
        }))
        .unwrap()
    }

    #[test]
    fn resource_ref_from_object() {
        let target = ResourceRef::from_object(&cluster_object()).unwrap();
        assert_eq!(
            target,
            ResourceRef::new("cluster.x-k8s.io/v1beta1", "Cluster", Some("default"), "dev-abc")
        );
        assert_eq!(target.to_string(), "Cluster default/dev-abc");
    }

    #[test]
    fn resource_ref_requires_type_and_name() {
        let mut object = cluster_object();
        object.metadata.name = None;
        assert!(ResourceRef::from_object(&object).is_err());

        let mut object = cluster_object();
        object.types = None;
        assert!(ResourceRef::from_object(&object).is_err());
    }

    #[test]
    fn cluster_scoped_display_omits_namespace() {
        assert_eq!(ResourceRef::namespace("test-1-host").to_string(), "Namespace test-1-host");
    }

    #[test]
    fn list_query_label_matching() {
        let labels: BTreeMap<String, String> =
            [("testbed.dev/scenario".to_string(), "42".to_string())].into();
        let query = ListQuery::new("v1", "Namespace").with_label("testbed.dev/scenario", "42");

        assert!(query.matches_labels(Some(&labels)));
        assert!(!query.matches_labels(None));
        assert!(!ListQuery::new("v1", "Namespace")
            .with_label("testbed.dev/scenario", "7")
            .matches_labels(Some(&labels)));
        assert!(ListQuery::new("v1", "Namespace").matches_labels(None));
    }

    #[test]
    fn not_found_and_conflict_are_translated() {
        let target = ResourceRef::secret(Some("default"), "dev-abc-kubeconfig");
        let api_error = |code| {
            kube::Error::Api(kube::error::ErrorResponse {
                status: "Failure".to_string(),
                message: "nope".to_string(),
                reason: "Reason".to_string(),
                code,
            })
        };

        assert!(matches!(
            map_api_error(api_error(404), &target),
            Error::NotFound { .. }
        ));
        assert!(matches!(
            map_api_error(api_error(409), &target),
            Error::AlreadyExists { .. }
        ));
        assert!(matches!(
            map_api_error(api_error(500), &target),
            Error::Kube { .. }
        ));
    }

    fn versioned(rv: &str) -> DynamicObject {
        let mut object = cluster_object();
        object.metadata.resource_version = Some(rv.to_string());
        object
    }

    fn bookmark(rv: &str) -> WatchEvent<DynamicObject> {
        WatchEvent::Bookmark(
            serde_json::from_value(json!({
                "apiVersion": "cluster.x-k8s.io/v1beta1",
                "kind": "Cluster",
                "metadata": { "resourceVersion": rv },
            }))
            .unwrap(),
        )
    }

    fn raw(events: Vec<WatchEvent<DynamicObject>>) -> RawEvents {
        stream::iter(events.into_iter().map(Ok)).boxed()
    }

    #[test]
    fn watch_requests_are_bounded_and_select_one_name() {
        let params = watch_params("dev-abc");
        assert_eq!(params.timeout, Some(WATCH_TIMEOUT_SECS));
        assert_eq!(params.field_selector.as_deref(), Some("metadata.name=dev-abc"));
    }

    #[tokio::test]
    async fn expired_watch_is_reopened_from_last_version() {
        let opened = Arc::new(parking_lot::Mutex::new(Vec::new()));
        let log = opened.clone();
        let mut batches = vec![
            vec![WatchEvent::Modified(versioned("10")), WatchEvent::Deleted(versioned("11"))],
            vec![bookmark("9")],
            vec![WatchEvent::Added(versioned("5"))],
        ];
        let open = move |version: String| {
            log.lock().push(version);
            let batch = batches.pop().unwrap_or_default();
            async move { Ok(raw(batch)) }
        };

        let target = ResourceRef::from_object(&cluster_object()).unwrap();
        let events: Vec<_> = resumable_watch(target, "0".to_string(), open)
            .await
            .unwrap()
            .collect()
            .await;

        let kinds: Vec<_> = events
            .iter()
            .map(|e| match e {
                Ok(ResourceEvent::Added(_)) => "added",
                Ok(ResourceEvent::Modified(_)) => "modified",
                Ok(ResourceEvent::Deleted(_)) => "deleted",
                Err(_) => "error",
            })
            .collect();
        assert_eq!(kinds, vec!["added", "modified", "deleted"]);
        assert_eq!(*opened.lock(), vec!["0", "5", "9"]);
    }

    #[tokio::test]
    async fn failed_reopen_ends_stream_with_error() {
        let mut calls = 0;
        let open = move |_version: String| {
            calls += 1;
            let first = calls == 1;
            async move {
                if first {
                    Ok(raw(vec![WatchEvent::Added(versioned("5"))]))
                } else {
                    Err(kube::Error::Api(kube::error::ErrorResponse {
                        status: "Failure".to_string(),
                        message: "forbidden".to_string(),
                        reason: "Forbidden".to_string(),
                        code: 403,
                    }))
                }
            }
        };

        let target = ResourceRef::from_object(&cluster_object()).unwrap();
        let events: Vec<_> = resumable_watch(target, "0".to_string(), open)
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(events.len(), 2);
        assert!(events[0].is_ok());
        assert!(matches!(events[1], Err(Error::Kube { .. })));
    }

    #[tokio::test]
    async fn server_error_event_ends_stream() {
        let open = |_version: String| async {
            Ok(raw(vec![
                WatchEvent::Error(kube::error::ErrorResponse {
                    status: "Failure".to_string(),
                    message: "too old resource version".to_string(),
                    reason: "Expired".to_string(),
                    code: 410,
                }),
                WatchEvent::Added(versioned("5")),
            ]))
        };

        let target = ResourceRef::from_object(&cluster_object()).unwrap();
        let events: Vec<_> = resumable_watch(target, "3".to_string(), open)
            .await
            .unwrap()
            .collect()
            .await;

        assert_eq!(events.len(), 1);
        assert!(matches!(events[0], Err(Error::Watch { .. })));
    }
}
