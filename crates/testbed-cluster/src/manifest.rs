//! Manifest parsing and classification
//!
//! A provisioning round starts from a text bundle of YAML and/or JSON
//! documents. [`parse_manifests`] decodes it into [`Manifest`]s;
//! [`classify_manifests`] splits them into Cluster API `Cluster` objects and
//! the dependencies those clusters reference, renaming each cluster with the
//! session suffix so concurrent rounds never collide.

use kube::api::DynamicObject;
use rand::distributions::Alphanumeric;
use rand::Rng;
use serde_json::Value;
use testbed_common::yaml::{parse_yaml, split_documents};
use testbed_common::Error;

use crate::store::ResourceRef;
use crate::CLUSTER_KIND;

/// Length of generated session suffixes
pub const SESSION_SUFFIX_LEN: usize = 6;

/// One declarative resource, guaranteed to carry apiVersion, kind and name
#[derive(Clone, Debug, PartialEq)]
pub struct Manifest {
    object: DynamicObject,
}

impl Manifest {
    /// Wrap a decoded document, validating the fields every manifest needs
    ///
    /// `raw` is attached to the error when validation fails.
    pub fn from_value(value: Value, raw: &str) -> Result<Self, Error> {
        for field in ["apiVersion", "kind"] {
            if !value.get(field).is_some_and(Value::is_string) {
                return Err(Error::parse(format!("document has no string {field}"), raw));
            }
        }
        let object: DynamicObject =
            serde_json::from_value(value).map_err(|e| Error::parse(e.to_string(), raw))?;
        if object.metadata.name.as_deref().is_none_or(str::is_empty) {
            return Err(Error::parse("document has no metadata.name", raw));
        }
        Ok(Self { object })
    }

    /// apiVersion of the resource
    pub fn api_version(&self) -> &str {
        self.object
            .types
            .as_ref()
            .map(|t| t.api_version.as_str())
            .unwrap_or_default()
    }

    /// Kind of the resource
    pub fn kind(&self) -> &str {
        self.object
            .types
            .as_ref()
            .map(|t| t.kind.as_str())
            .unwrap_or_default()
    }

    /// Name of the resource
    pub fn name(&self) -> &str {
        self.object.metadata.name.as_deref().unwrap_or_default()
    }

    /// Namespace of the resource, if it names one
    pub fn namespace(&self) -> Option<&str> {
        self.object.metadata.namespace.as_deref()
    }

    /// Whether this is a Cluster API `Cluster`
    pub fn is_cluster(&self) -> bool {
        self.kind() == CLUSTER_KIND
    }

    /// Address of the resource in the store
    pub fn resource_ref(&self) -> ResourceRef {
        ResourceRef::new(self.api_version(), self.kind(), self.namespace(), self.name())
    }

    /// The underlying object, as sent to the store
    pub fn object(&self) -> &DynamicObject {
        &self.object
    }

    /// A copy renamed to `<name>-<suffix>`
    pub fn with_suffix(&self, suffix: &str) -> Self {
        let mut copy = self.clone();
        copy.object.metadata.name = Some(format!("{}-{}", self.name(), suffix));
        copy
    }

    /// A copy pinned to `namespace`
    pub fn with_namespace(&self, namespace: &str) -> Self {
        let mut copy = self.clone();
        copy.object.metadata.namespace = Some(namespace.to_string());
        copy
    }
}

/// Decode a bundle of YAML and/or JSON documents
///
/// Documents are separated by `---`; a document whose text starts with `{`
/// is read as a stream of concatenated JSON objects. Empty documents are
/// skipped. The first undecodable or incomplete document aborts the batch.
pub fn parse_manifests(text: &str) -> Result<Vec<Manifest>, Error> {
    let mut manifests = Vec::new();

    for raw in split_documents(text) {
        let values = if raw.trim_start().starts_with('{') {
            decode_json_stream(raw)?
        } else {
            vec![parse_yaml(raw)?]
        };

        for value in values.into_iter().filter(|v| !v.is_null()) {
            manifests.push(Manifest::from_value(value, raw)?);
        }
    }

    Ok(manifests)
}

fn decode_json_stream(raw: &str) -> Result<Vec<Value>, Error> {
    serde_json::Deserializer::from_str(raw)
        .into_iter::<Value>()
        .map(|value| value.map_err(|e| Error::parse(e.to_string(), raw)))
        .collect()
}

/// Manifests split by role, order preserved within each list
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ClassifiedManifests {
    /// Everything that is not a `Cluster`, in input order
    pub dependencies: Vec<Manifest>,
    /// Every `Cluster`, suffixed, in input order
    pub clusters: Vec<Manifest>,
}

/// Split manifests into dependencies and clusters
///
/// Every input lands in exactly one list. Clusters are renamed
/// `<name>-<suffix>`; an empty suffix leaves names unchanged.
pub fn classify_manifests(manifests: &[Manifest], suffix: Option<&str>) -> ClassifiedManifests {
    let suffix = suffix.filter(|s| !s.is_empty());
    let mut classified = ClassifiedManifests::default();

    for manifest in manifests {
        if manifest.is_cluster() {
            let cluster = match suffix {
                Some(s) => manifest.with_suffix(s),
                None => manifest.clone(),
            };
            classified.clusters.push(cluster);
        } else {
            classified.dependencies.push(manifest.clone());
        }
    }

    classified
}

/// Copies of `manifests` pinned to `namespace`
pub fn scope_to_namespace(manifests: &[Manifest], namespace: &str) -> Vec<Manifest> {
    manifests
        .iter()
        .map(|m| m.with_namespace(namespace))
        .collect()
}

/// A random suffix usable inside a DNS-1123 name
pub fn generate_session_suffix() -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(SESSION_SUFFIX_LEN)
        .map(|b| char::from(b).to_ascii_lowercase())
        .collect()
}
