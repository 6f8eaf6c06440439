//! Admin credentials for provisioned clusters
//!
//! Cluster API writes each workload cluster's admin kubeconfig into the
//! secret `<cluster>-kubeconfig` (key `value`) once the cluster is up. This
//! module polls for that secret, decodes it and checks that it carries a
//! server address plus usable auth material before handing it out.

use std::fmt;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use k8s_openapi::api::core::v1::Secret;
use kube::api::DynamicObject;
use serde::Deserialize;
use testbed_common::kube_utils::config_from_kubeconfig_yaml;
use testbed_common::retry::poll_with_observer;
use testbed_common::yaml::parse_yaml;
use testbed_common::{Error, RunContext};
use tracing::{info, warn};

use crate::store::{ObjectStore, ResourceRef};
use crate::{KUBECONFIG_SECRET_KEY, KUBECONFIG_SECRET_SUFFIX};

/// Name of the secret holding a cluster's admin kubeconfig
pub fn kubeconfig_secret_name(cluster: &str) -> String {
    format!("{}{}", cluster, KUBECONFIG_SECRET_SUFFIX)
}

/// How a credential authenticates
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CredentialAuth {
    /// `users[].user.token`
    BearerToken,
    /// `users[].user.client-certificate-data` plus `client-key-data`
    ClientCertificate,
}

/// Admin access to one provisioned cluster
///
/// Debug output never includes the kubeconfig itself.
#[derive(Clone)]
pub struct Credential {
    cluster: String,
    server: String,
    auth: CredentialAuth,
    kubeconfig: String,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credential")
            .field("cluster", &self.cluster)
            .field("server", &self.server)
            .field("auth", &self.auth)
            .finish_non_exhaustive()
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct KubeconfigView {
    #[serde(default)]
    clusters: Vec<NamedClusterView>,
    #[serde(default)]
    users: Vec<NamedUserView>,
    #[serde(default)]
    contexts: Vec<NamedContextView>,
    #[serde(default)]
    current_context: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedClusterView {
    name: String,
    #[serde(default)]
    cluster: ClusterView,
}

#[derive(Debug, Default, Deserialize)]
struct ClusterView {
    #[serde(default)]
    server: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedUserView {
    name: String,
    #[serde(default)]
    user: UserView,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "kebab-case")]
struct UserView {
    #[serde(default)]
    token: Option<String>,
    #[serde(default)]
    client_certificate_data: Option<String>,
    #[serde(default)]
    client_key_data: Option<String>,
}

#[derive(Debug, Deserialize)]
struct NamedContextView {
    name: String,
    context: ContextView,
}

#[derive(Debug, Deserialize)]
struct ContextView {
    cluster: String,
    user: String,
}

impl KubeconfigView {
    /// Cluster and user selected by the current context, or the sole
    /// context, or the first entries when there are no contexts
    fn selected(&self) -> (Option<&ClusterView>, Option<&UserView>) {
        let context = match &self.current_context {
            Some(name) => self.contexts.iter().find(|c| &c.name == name),
            None if self.contexts.len() == 1 => self.contexts.first(),
            None => None,
        };

        match context {
            Some(ctx) => (
                self.clusters
                    .iter()
                    .find(|c| c.name == ctx.context.cluster)
                    .map(|c| &c.cluster),
                self.users
                    .iter()
                    .find(|u| u.name == ctx.context.user)
                    .map(|u| &u.user),
            ),
            None => (
                self.clusters.first().map(|c| &c.cluster),
                self.users.first().map(|u| &u.user),
            ),
        }
    }
}

impl Credential {
    /// Validate kubeconfig text for `cluster`
    ///
    /// Requires a server and either a bearer token or client certificate and
    /// key data that decode as base64.
    pub fn from_kubeconfig(cluster: &str, kubeconfig: String) -> Result<Self, Error> {
        let value = parse_yaml(&kubeconfig)
            .map_err(|e| Error::credential(cluster, format!("kubeconfig is not YAML: {e}")))?;
        let view = KubeconfigView::deserialize(&value)
            .map_err(|e| Error::credential(cluster, format!("malformed kubeconfig: {e}")))?;

        let (selected_cluster, selected_user) = view.selected();
        let server = selected_cluster
            .and_then(|c| c.server.clone())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| Error::credential(cluster, "kubeconfig has no server"))?;
        let user = selected_user
            .ok_or_else(|| Error::credential(cluster, "kubeconfig has no user"))?;

        let auth = if user.token.as_deref().is_some_and(|t| !t.is_empty()) {
            CredentialAuth::BearerToken
        } else if let (Some(cert), Some(key)) =
            (&user.client_certificate_data, &user.client_key_data)
        {
            for (field, data) in [("client-certificate-data", cert), ("client-key-data", key)] {
                STANDARD.decode(data.trim()).map_err(|e| {
                    Error::credential(cluster, format!("{field} is not base64: {e}"))
                })?;
            }
            CredentialAuth::ClientCertificate
        } else {
            return Err(Error::credential(
                cluster,
                "kubeconfig has neither a bearer token nor client certificate and key",
            ));
        };

        Ok(Self {
            cluster: cluster.to_string(),
            server,
            auth,
            kubeconfig,
        })
    }

    /// Decode the `value` entry of a kubeconfig secret
    pub fn from_secret(cluster: &str, secret: &Secret) -> Result<Self, Error> {
        let bytes = secret
            .data
            .as_ref()
            .and_then(|d| d.get(KUBECONFIG_SECRET_KEY))
            .ok_or_else(|| {
                Error::credential(
                    cluster,
                    format!("kubeconfig secret missing '{}' key", KUBECONFIG_SECRET_KEY),
                )
            })?;
        let text = String::from_utf8(bytes.0.clone()).map_err(|e| {
            Error::credential(cluster, format!("kubeconfig is not valid UTF-8: {e}"))
        })?;
        Self::from_kubeconfig(cluster, text)
    }

    /// Decode a kubeconfig secret read through the dynamic API
    pub fn from_secret_object(cluster: &str, object: &DynamicObject) -> Result<Self, Error> {
        let secret: Secret = serde_json::to_value(object)
            .and_then(serde_json::from_value)
            .map_err(|e| Error::credential(cluster, format!("not a secret: {e}")))?;
        Self::from_secret(cluster, &secret)
    }

    /// Cluster this credential belongs to
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// API server address
    pub fn server(&self) -> &str {
        &self.server
    }

    /// How the credential authenticates
    pub fn auth(&self) -> CredentialAuth {
        self.auth
    }

    /// The kubeconfig text
    pub fn kubeconfig(&self) -> &str {
        &self.kubeconfig
    }

    /// Client configuration for this cluster
    pub async fn client_config(&self) -> Result<kube::Config, Error> {
        config_from_kubeconfig_yaml(&self.kubeconfig).await
    }
}

/// Read `cluster`'s kubeconfig secret once
///
/// The secret lives next to the cluster object.
pub async fn read_admin_credential<S>(store: &S, cluster: &ResourceRef) -> Result<Credential, Error>
where
    S: ObjectStore + ?Sized,
{
    let secret = ResourceRef::secret(
        cluster.namespace.as_deref(),
        kubeconfig_secret_name(&cluster.name),
    );
    let object = store.get(&secret).await?;
    Credential::from_secret_object(&cluster.name, &object)
}

/// Poll the store for `cluster`'s kubeconfig secret
///
/// Each miss is logged; the poll gives up after `timeout` (bounded by `ctx`)
/// with every miss attached.
pub async fn fetch_admin_credential<S>(
    ctx: &RunContext,
    store: &S,
    cluster: &ResourceRef,
    interval: Duration,
    timeout: Duration,
) -> Result<Credential, Error>
where
    S: ObjectStore + ?Sized,
{
    let ctx = ctx.child_with_timeout(timeout);

    let credential = poll_with_observer(
        &ctx,
        "fetch admin kubeconfig",
        interval,
        || read_admin_credential(store, cluster),
        |failure| {
            warn!(
                cluster = %cluster.name,
                attempt = failure.attempt,
                error = %failure.error,
                "admin kubeconfig not available yet"
            );
        },
    )
    .await?;

    info!(cluster = %cluster.name, server = %credential.server(), "admin kubeconfig available");
    Ok(credential)
}

/// Auth material for [`serialize_kubeconfig`]
#[derive(Clone, Copy)]
pub enum KubeconfigAuth<'a> {
    /// Bearer token, e.g. a service account token
    BearerToken(&'a str),
    /// PEM client certificate and key
    ClientCertificate {
        /// PEM certificate
        certificate_pem: &'a [u8],
        /// PEM private key
        key_pem: &'a [u8],
    },
}

/// Render a single-context kubeconfig for `server`
///
/// The context `default-context` joins cluster `default-cluster` and user
/// `default`, and selects `namespace` (`default` when `None`). CA and client
/// certificates are embedded as base64 data.
pub fn serialize_kubeconfig(
    server: &str,
    ca_pem: Option<&[u8]>,
    auth: KubeconfigAuth<'_>,
    namespace: Option<&str>,
) -> String {
    let ca = ca_pem
        .map(|pem| format!("\n    certificate-authority-data: {}", STANDARD.encode(pem)))
        .unwrap_or_default();
    let user = match auth {
        KubeconfigAuth::BearerToken(token) => format!("    token: {token}"),
        KubeconfigAuth::ClientCertificate {
            certificate_pem,
            key_pem,
        } => format!(
            "    client-certificate-data: {}\n    client-key-data: {}",
            STANDARD.encode(certificate_pem),
            STANDARD.encode(key_pem)
        ),
    };
    format!(
        r#"apiVersion: v1
kind: Config
clusters:
- name: default-cluster
  cluster:
    server: {server}{ca}
contexts:
- name: default-context
  context:
    cluster: default-cluster
    user: default
    namespace: {namespace}
current-context: default-context
users:
- name: default
  user:
{user}
"#,
        namespace = namespace.unwrap_or("default"),
    )
}
