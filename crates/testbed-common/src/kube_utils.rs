//! Kubernetes helpers shared by the provisioning crates
//!
//! Builds `ApiResource`s for kinds read out of manifests, creates clients from
//! kubeconfig files or in-memory kubeconfig text, and formats the selectors
//! used to scope watches to one object.

use std::path::Path;
use std::time::Duration;

use kube::config::{KubeConfigOptions, Kubeconfig};
use kube::discovery::ApiResource;
use kube::{Client, Config};

use crate::Error;

/// Default timeout for establishing a connection to the API server
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
/// Default timeout for reading a response from the API server
pub const DEFAULT_READ_TIMEOUT: Duration = Duration::from_secs(30);
/// Server-side lifetime of one watch request, in seconds
///
/// Shorter than [`DEFAULT_READ_TIMEOUT`]: the server ends a quiet watch
/// cleanly before the client's read timeout would fail it.
pub const WATCH_TIMEOUT_SECS: u32 = 20;

/// Build an ApiResource from an apiVersion and kind taken from a manifest.
///
/// The plural is derived with [`pluralize_kind`]; prefer discovery (see
/// [`crate::registry::KindRegistry::discover`]) when the server is reachable.
///
/// ```ignore
/// let ar = build_api_resource("cluster.x-k8s.io/v1beta1", "Cluster");
/// let api: Api<DynamicObject> = Api::namespaced_with(client, "default", &ar);
/// ```
pub fn build_api_resource(api_version: &str, kind: &str) -> ApiResource {
    let (group, version) = parse_api_version(api_version);
    ApiResource {
        group,
        version,
        kind: kind.to_string(),
        api_version: api_version.to_string(),
        plural: pluralize_kind(kind),
    }
}

/// Parse apiVersion into (group, version)
///
/// # Examples
/// ```
/// use testbed_common::kube_utils::parse_api_version;
///
/// let (group, version) = parse_api_version("cluster.x-k8s.io/v1beta1");
/// assert_eq!(group, "cluster.x-k8s.io");
/// assert_eq!(version, "v1beta1");
///
/// let (group, version) = parse_api_version("v1");
/// assert_eq!(group, "");
/// assert_eq!(version, "v1");
/// ```
pub fn parse_api_version(api_version: &str) -> (String, String) {
    match api_version.split_once('/') {
        Some((group, version)) => (group.to_string(), version.to_string()),
        None => (String::new(), api_version.to_string()),
    }
}

/// Irregular plurals for kinds that show up in cluster manifests
const KIND_PLURALS: &[(&str, &str)] = &[
    ("clusterclass", "clusterclasses"),
    ("ipaddress", "ipaddresses"),
    ("ipaddressclaim", "ipaddressclaims"),
    ("endpoints", "endpoints"),
];

/// Pluralize a Kubernetes resource kind
///
/// Uses a lookup table for irregular kinds, falling back to simple English
/// pluralization rules.
pub fn pluralize_kind(kind: &str) -> String {
    let lower = kind.to_lowercase();

    if let Some((_, plural)) = KIND_PLURALS.iter().find(|(singular, _)| *singular == lower) {
        return (*plural).to_string();
    }

    if lower.ends_with('s') || lower.ends_with("ch") || lower.ends_with("sh") {
        format!("{}es", lower)
    } else if lower.ends_with('y') && !lower.ends_with("ay") && !lower.ends_with("ey") {
        format!("{}ies", &lower[..lower.len() - 1])
    } else {
        format!("{}s", lower)
    }
}

/// Field selector matching exactly one object by name
pub fn name_field_selector(name: &str) -> String {
    format!("metadata.name={}", name)
}

/// Create a kube client from optional kubeconfig path
pub async fn create_client(kubeconfig: Option<&Path>) -> Result<Client, Error> {
    create_client_with_timeout(kubeconfig, DEFAULT_CONNECT_TIMEOUT, DEFAULT_READ_TIMEOUT).await
}

/// Create a kube client from optional kubeconfig path with custom timeouts
pub async fn create_client_with_timeout(
    kubeconfig: Option<&Path>,
    connect_timeout: Duration,
    read_timeout: Duration,
) -> Result<Client, Error> {
    let mut config = load_config(kubeconfig).await?;
    config.connect_timeout = Some(connect_timeout);
    config.read_timeout = Some(read_timeout);
    client_from_config(config)
}

/// Load client configuration from `kubeconfig`, or infer it from the
/// environment (`KUBECONFIG`, `~/.kube/config`, in-cluster) when `None`
pub async fn load_config(kubeconfig: Option<&Path>) -> Result<Config, Error> {
    match kubeconfig {
        Some(path) => {
            let kubeconfig = Kubeconfig::read_from(path).map_err(|e| {
                Error::internal_with_context(
                    "create_client",
                    format!("failed to read kubeconfig: {}", e),
                )
            })?;
            config_from_kubeconfig(kubeconfig).await
        }
        None => Config::infer().await.map_err(|e| {
            Error::internal_with_context("create_client", format!("failed to infer config: {}", e))
        }),
    }
}

/// Namespace selected by the current context, `default` when it names none
pub async fn default_namespace(kubeconfig: Option<&Path>) -> Result<String, Error> {
    Ok(load_config(kubeconfig).await?.default_namespace)
}

/// Build a client config from kubeconfig text held in memory
///
/// No network calls are made; exec/auth-provider plugins referenced by the
/// kubeconfig run lazily on first request.
pub async fn config_from_kubeconfig_yaml(kubeconfig: &str) -> Result<Config, Error> {
    let kubeconfig = Kubeconfig::from_yaml(kubeconfig).map_err(|e| {
        Error::internal_with_context("kubeconfig", format!("failed to parse kubeconfig: {}", e))
    })?;
    config_from_kubeconfig(kubeconfig).await
}

async fn config_from_kubeconfig(kubeconfig: Kubeconfig) -> Result<Config, Error> {
    Config::from_custom_kubeconfig(kubeconfig, &KubeConfigOptions::default())
        .await
        .map_err(|e| {
            Error::internal_with_context("kubeconfig", format!("failed to load kubeconfig: {}", e))
        })
}

/// Create a client from a prepared config
pub fn client_from_config(config: Config) -> Result<Client, Error> {
    Client::try_from(config).map_err(|e| {
        Error::internal_with_context("create_client", format!("failed to create client: {}", e))
    })
}
