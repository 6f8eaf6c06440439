//! Namespace and bundle helpers for test scenarios

use std::collections::BTreeMap;

use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::DynamicObject;
use kube::core::TypeMeta;
use testbed_common::retry::{poll, poll_with_observer};
use testbed_common::{Error, RunContext};
use tracing::{debug, info, warn};

use crate::config::ProvisionerConfig;
use crate::manifest::{parse_manifests, scope_to_namespace, Manifest};
use crate::store::{ListQuery, ObjectStore, ResourceRef};

const NAMESPACE_KIND: &str = "Namespace";

/// Wait until every manifest exists in the store
///
/// Each manifest gets its own budget of `config.resource_timeout`. Every
/// manifest is waited on even after one fails; all failures are reported.
/// A manifest whose kind cannot be mapped fails without waiting.
pub async fn wait_for_resources<S>(
    ctx: &RunContext,
    store: &S,
    manifests: &[Manifest],
    namespace: Option<&str>,
    config: &ProvisionerConfig,
) -> Result<(), Error>
where
    S: ObjectStore + ?Sized,
{
    let mut errors = Vec::new();

    for manifest in manifests {
        let target = match namespace {
            Some(ns) => manifest.resource_ref().in_namespace(ns),
            None => manifest.resource_ref(),
        };
        let ctx = ctx.child_with_timeout(config.resource_timeout);
        let result = poll(&ctx, "wait for resource", config.resource_interval, || async {
            store.get(&target).await.map(|_| ())
        })
        .await;

        match result {
            Ok(()) => debug!(resource = %target, "resource present"),
            Err(e) => {
                warn!(resource = %target, error = %e, "resource never appeared");
                errors.push(e);
            }
        }
    }

    Error::aggregate(errors)
}

/// Create a bundle of manifests inside `namespace`
///
/// `Namespace` objects in the bundle are skipped and everything else is
/// pinned to `namespace`. The whole bundle is retried every
/// `config.deploy_interval` until one pass succeeds; objects left over from
/// an earlier pass are accepted. A bundle that does not parse, or a kind the
/// store cannot map, fails immediately.
pub async fn deploy_into_namespace<S>(
    ctx: &RunContext,
    store: &S,
    text: &str,
    namespace: &str,
    config: &ProvisionerConfig,
) -> Result<Vec<ResourceRef>, Error>
where
    S: ObjectStore + ?Sized,
{
    let manifests: Vec<Manifest> = parse_manifests(text)?
        .into_iter()
        .filter(|m| m.kind() != NAMESPACE_KIND)
        .collect();
    let manifests = scope_to_namespace(&manifests, namespace);

    poll_with_observer(
        ctx,
        "deploy bundle",
        config.deploy_interval,
        || async {
            for manifest in &manifests {
                match store.create(manifest.object()).await {
                    Ok(_) => {}
                    Err(e) if e.is_already_exists() => {}
                    Err(e) => return Err(e),
                }
            }
            Ok(())
        },
        |failure| {
            warn!(namespace, attempt = failure.attempt, error = %failure.error, "bundle deploy failed");
        },
    )
    .await?;

    info!(namespace, count = manifests.len(), "bundle deployed");
    Ok(manifests.iter().map(Manifest::resource_ref).collect())
}

/// Create namespace `name` carrying `labels`
pub async fn create_namespace_with_labels<S>(
    store: &S,
    name: &str,
    labels: &BTreeMap<String, String>,
) -> Result<DynamicObject, Error>
where
    S: ObjectStore + ?Sized,
{
    let namespace = DynamicObject {
        types: Some(TypeMeta {
            api_version: "v1".to_string(),
            kind: NAMESPACE_KIND.to_string(),
        }),
        metadata: ObjectMeta {
            name: Some(name.to_string()),
            labels: Some(labels.clone()),
            ..Default::default()
        },
        data: serde_json::Value::Object(Default::default()),
    };
    let created = store.create(&namespace).await?;
    info!(namespace = name, "namespace created");
    Ok(created)
}

/// Delete every namespace labelled `key=value`
///
/// Returns how many deletions were issued. Namespaces that vanish in the
/// meantime are skipped; other failures are collected.
pub async fn delete_labelled_namespaces<S>(store: &S, key: &str, value: &str) -> Result<usize, Error>
where
    S: ObjectStore + ?Sized,
{
    let query = ListQuery::new("v1", NAMESPACE_KIND).with_label(key, value);
    let namespaces = store.list(&query).await?;

    let mut deleted = 0;
    let mut errors = Vec::new();
    for namespace in namespaces {
        let Some(name) = namespace.metadata.name else {
            continue;
        };
        match store.delete(&ResourceRef::namespace(&name)).await {
            Ok(()) => {
                deleted += 1;
                info!(namespace = %name, "namespace deleted");
            }
            Err(e) if e.is_not_found() => debug!(namespace = %name, "namespace already gone"),
            Err(e) => errors.push(e),
        }
    }

    Error::aggregate(errors)?;
    Ok(deleted)
}
