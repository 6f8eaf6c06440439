//! Least-privilege clients for namespaced tests
//!
//! [`ScopedClientFactory`] creates a service account in the test namespace,
//! mints a token for it, grants it every verb on every resource in that
//! namespace only, and returns a client that impersonates the account.
//! [`ScopedClient`] additionally pins every call to the namespace, whatever
//! namespace the caller's object claims.
//!
//! Steps run in order and nothing is rolled back when one fails; deleting
//! the namespace removes whatever was created.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use http::{HeaderName, HeaderValue};
use k8s_openapi::api::authentication::v1::{TokenRequest, TokenRequestSpec};
use k8s_openapi::api::core::v1::ServiceAccount;
use k8s_openapi::api::rbac::v1::{PolicyRule, Role, RoleBinding, RoleRef, Subject};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, DynamicObject, PostParams};
use kube::Client;
#[cfg(test)]
use mockall::automock;
use testbed_common::kube_utils::client_from_config;
use testbed_common::registry::KindRegistry;
use testbed_common::{Error, RunContext, FIELD_MANAGER};
use tracing::{debug, info};

use crate::config::ScopeConfig;
use crate::credentials::{serialize_kubeconfig, KubeconfigAuth};
use crate::store::{EventStream, KubeStore, ListQuery, ObjectStore, ResourceRef};

const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";
const IMPERSONATE_UID_HEADER: &str = "impersonate-uid";

fn der_to_pem(der: &[u8]) -> String {
    let encoded = STANDARD.encode(der);
    let mut pem = String::from("-----BEGIN CERTIFICATE-----\n");
    for line in encoded.as_bytes().chunks(64) {
        pem.push_str(&String::from_utf8_lossy(line));
        pem.push('\n');
    }
    pem.push_str("-----END CERTIFICATE-----\n");
    pem
}

/// Identity-management calls the factory needs
#[cfg_attr(test, automock)]
#[async_trait]
pub trait IdentityApi: Send + Sync {
    /// Create a service account in `namespace`
    async fn create_service_account(
        &self,
        namespace: &str,
        account: &ServiceAccount,
    ) -> Result<ServiceAccount, Error>;

    /// Mint a token for `service_account`
    async fn request_token(
        &self,
        namespace: &str,
        service_account: &str,
        request: &TokenRequest,
    ) -> Result<TokenRequest, Error>;

    /// Create a role in `namespace`
    async fn create_role(&self, namespace: &str, role: &Role) -> Result<Role, Error>;

    /// Create a role binding in `namespace`
    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<RoleBinding, Error>;
}

/// [`IdentityApi`] backed by the Kubernetes API
#[derive(Clone)]
pub struct KubeIdentityApi {
    client: Client,
}

impl KubeIdentityApi {
    /// Issue identity calls with `client`
    pub fn new(client: Client) -> Self {
        Self { client }
    }
}

fn post_params() -> PostParams {
    PostParams {
        field_manager: Some(FIELD_MANAGER.to_string()),
        ..Default::default()
    }
}

fn map_create_error(err: kube::Error, resource: String) -> Error {
    match err {
        kube::Error::Api(ref ae) if ae.code == 404 => Error::not_found(resource),
        kube::Error::Api(ref ae) if ae.code == 409 => Error::already_exists(resource),
        other => Error::from(other),
    }
}

#[async_trait]
impl IdentityApi for KubeIdentityApi {
    async fn create_service_account(
        &self,
        namespace: &str,
        account: &ServiceAccount,
    ) -> Result<ServiceAccount, Error> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        api.create(&post_params(), account).await.map_err(|e| {
            let name = account.metadata.name.clone().unwrap_or_default();
            map_create_error(e, format!("ServiceAccount {namespace}/{name}"))
        })
    }

    async fn request_token(
        &self,
        namespace: &str,
        service_account: &str,
        request: &TokenRequest,
    ) -> Result<TokenRequest, Error> {
        let api: Api<ServiceAccount> = Api::namespaced(self.client.clone(), namespace);
        api.create_token_request(service_account, &post_params(), request)
            .await
            .map_err(|e| map_create_error(e, format!("ServiceAccount {namespace}/{service_account}")))
    }

    async fn create_role(&self, namespace: &str, role: &Role) -> Result<Role, Error> {
        let api: Api<Role> = Api::namespaced(self.client.clone(), namespace);
        api.create(&post_params(), role).await.map_err(|e| {
            let name = role.metadata.name.clone().unwrap_or_default();
            map_create_error(e, format!("Role {namespace}/{name}"))
        })
    }

    async fn create_role_binding(
        &self,
        namespace: &str,
        binding: &RoleBinding,
    ) -> Result<RoleBinding, Error> {
        let api: Api<RoleBinding> = Api::namespaced(self.client.clone(), namespace);
        api.create(&post_params(), binding).await.map_err(|e| {
            let name = binding.metadata.name.clone().unwrap_or_default();
            map_create_error(e, format!("RoleBinding {namespace}/{name}"))
        })
    }
}

/// A service account provisioned for one namespace
#[derive(Clone)]
pub struct ScopedIdentity {
    /// Namespace the account lives in and is limited to
    pub namespace: String,
    /// Service account name
    pub service_account: String,
    /// UID assigned by the server, if returned
    pub uid: Option<String>,
    /// Bearer token minted for the account
    pub token: String,
}

impl ScopedIdentity {
    /// The username the API server knows this account by
    pub fn username(&self) -> String {
        format!(
            "system:serviceaccount:{}:{}",
            self.namespace, self.service_account
        )
    }
}

impl fmt::Debug for ScopedIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ScopedIdentity")
            .field("namespace", &self.namespace)
            .field("service_account", &self.service_account)
            .field("uid", &self.uid)
            .field("token", &"<redacted>")
            .finish()
    }
}

fn object_meta(name: &str, namespace: &str) -> ObjectMeta {
    ObjectMeta {
        name: Some(name.to_string()),
        namespace: Some(namespace.to_string()),
        ..Default::default()
    }
}

fn service_account(name: &str, namespace: &str) -> ServiceAccount {
    ServiceAccount {
        metadata: object_meta(name, namespace),
        ..Default::default()
    }
}

fn token_request(expiration_seconds: Option<i64>) -> TokenRequest {
    TokenRequest {
        metadata: Default::default(),
        spec: TokenRequestSpec {
            audiences: vec![],
            expiration_seconds,
            bound_object_ref: None,
        },
        status: None,
    }
}

fn namespace_admin_role(name: &str, namespace: &str) -> Role {
    Role {
        metadata: object_meta(name, namespace),
        rules: Some(vec![PolicyRule {
            api_groups: Some(vec!["*".to_string()]),
            resources: Some(vec!["*".to_string()]),
            verbs: vec!["*".to_string()],
            ..Default::default()
        }]),
    }
}

fn role_binding(name: &str, namespace: &str) -> RoleBinding {
    RoleBinding {
        metadata: object_meta(name, namespace),
        role_ref: RoleRef {
            api_group: RBAC_API_GROUP.to_string(),
            kind: "Role".to_string(),
            name: name.to_string(),
        },
        subjects: Some(vec![Subject {
            kind: "ServiceAccount".to_string(),
            name: name.to_string(),
            namespace: Some(namespace.to_string()),
            ..Default::default()
        }]),
    }
}

/// Builds namespace-restricted clients
pub struct ScopedClientFactory {
    identity: Arc<dyn IdentityApi>,
    base_config: kube::Config,
    registry: Arc<KindRegistry>,
    config: ScopeConfig,
}

impl ScopedClientFactory {
    /// A factory issuing identity calls through `identity` and building
    /// clients from `base_config`, which must be allowed to impersonate
    pub fn new(
        identity: Arc<dyn IdentityApi>,
        base_config: kube::Config,
        registry: Arc<KindRegistry>,
        config: ScopeConfig,
    ) -> Self {
        Self {
            identity,
            base_config,
            registry,
            config,
        }
    }

    /// Create the service account, token, role and binding for `namespace`
    ///
    /// The token expires when `ctx` does; without a deadline the server
    /// default applies.
    pub async fn provision_identity(
        &self,
        ctx: &RunContext,
        namespace: &str,
    ) -> Result<ScopedIdentity, Error> {
        let name = self.config.service_account_name.as_str();
        let display = format!("ServiceAccount {namespace}/{name}");

        let expiration_seconds = match ctx.remaining() {
            Some(remaining) if remaining.is_zero() => {
                return Err(Error::timeout(format!("scope {namespace}"), Vec::new()));
            }
            Some(remaining) => Some(i64::try_from(remaining.as_secs()).unwrap_or(i64::MAX)),
            None => None,
        };

        let account = self
            .identity
            .create_service_account(namespace, &service_account(name, namespace))
            .await
            .map_err(|e| Error::provision("creating service account", display.clone(), e))?;
        debug!(namespace, service_account = name, "service account created");

        let token = self
            .identity
            .request_token(namespace, name, &token_request(expiration_seconds))
            .await
            .map_err(|e| Error::provision("requesting token for", display.clone(), e))?
            .status
            .map(|s| s.token)
            .filter(|t| !t.is_empty())
            .ok_or_else(|| Error::credential(namespace, "server returned empty token"))?;

        self.identity
            .create_role(namespace, &namespace_admin_role(name, namespace))
            .await
            .map_err(|e| Error::provision("creating role", format!("Role {namespace}/{name}"), e))?;

        self.identity
            .create_role_binding(namespace, &role_binding(name, namespace))
            .await
            .map_err(|e| {
                Error::provision("binding role", format!("RoleBinding {namespace}/{name}"), e)
            })?;

        info!(namespace, service_account = name, "scoped identity ready");
        Ok(ScopedIdentity {
            namespace: namespace.to_string(),
            service_account: name.to_string(),
            uid: account.metadata.uid,
            token,
        })
    }

    /// Base configuration impersonating `identity`, defaulting to its namespace
    ///
    /// The account's UID, when the server reported one, is impersonated as
    /// well so a recreated account of the same name is not matched.
    pub fn impersonation_config(&self, identity: &ScopedIdentity) -> Result<kube::Config, Error> {
        let mut config = self.base_config.clone();
        config.auth_info.impersonate = Some(identity.username());
        if let Some(uid) = &identity.uid {
            let value = HeaderValue::from_str(uid).map_err(|e| {
                Error::internal_with_context("impersonation", format!("invalid uid {uid:?}: {e}"))
            })?;
            config.headers.push((HeaderName::from_static(IMPERSONATE_UID_HEADER), value));
        }
        config.default_namespace = identity.namespace.clone();
        Ok(config)
    }

    /// Kubeconfig authenticating directly with `identity`'s token
    ///
    /// Server and CA come from the base configuration; the context selects
    /// the identity's namespace. For handing to tools that cannot
    /// impersonate.
    pub fn scoped_kubeconfig(&self, identity: &ScopedIdentity) -> String {
        let ca_pem = self
            .base_config
            .root_cert
            .as_ref()
            .map(|certs| certs.iter().map(|der| der_to_pem(der)).collect::<String>());
        serialize_kubeconfig(
            &self.base_config.cluster_url.to_string(),
            ca_pem.as_deref().map(str::as_bytes),
            KubeconfigAuth::BearerToken(&identity.token),
            Some(&identity.namespace),
        )
    }

    /// Provision an identity for `namespace` and return a client acting as it
    pub async fn scoped_client(
        &self,
        ctx: &RunContext,
        namespace: &str,
    ) -> Result<ScopedClient<KubeStore>, Error> {
        let identity = self.provision_identity(ctx, namespace).await?;
        let client = client_from_config(self.impersonation_config(&identity)?)?;
        let store = KubeStore::new(client, self.registry.clone());
        Ok(ScopedClient::new(store, identity))
    }
}

/// An [`ObjectStore`] whose every call is pinned to one namespace
pub struct ScopedClient<S> {
    inner: S,
    identity: ScopedIdentity,
}

impl<S: ObjectStore> ScopedClient<S> {
    /// Pin `inner` to `identity`'s namespace
    pub fn new(inner: S, identity: ScopedIdentity) -> Self {
        Self { inner, identity }
    }

    /// The namespace every call is pinned to
    pub fn namespace(&self) -> &str {
        &self.identity.namespace
    }

    /// The identity this client acts as
    pub fn identity(&self) -> &ScopedIdentity {
        &self.identity
    }

    fn pin_ref(&self, target: &ResourceRef) -> ResourceRef {
        target.clone().in_namespace(self.namespace())
    }

    fn pin_object(&self, object: &DynamicObject) -> DynamicObject {
        let mut pinned = object.clone();
        pinned.metadata.namespace = Some(self.namespace().to_string());
        pinned
    }
}

#[async_trait]
impl<S: ObjectStore> ObjectStore for ScopedClient<S> {
    async fn get(&self, target: &ResourceRef) -> Result<DynamicObject, Error> {
        self.inner.get(&self.pin_ref(target)).await
    }

    async fn list(&self, query: &ListQuery) -> Result<Vec<DynamicObject>, Error> {
        self.inner
            .list(&query.clone().in_namespace(self.namespace()))
            .await
    }

    async fn create(&self, object: &DynamicObject) -> Result<DynamicObject, Error> {
        self.inner.create(&self.pin_object(object)).await
    }

    async fn update(&self, object: &DynamicObject) -> Result<DynamicObject, Error> {
        self.inner.update(&self.pin_object(object)).await
    }

    async fn delete(&self, target: &ResourceRef) -> Result<(), Error> {
        self.inner.delete(&self.pin_ref(target)).await
    }

    async fn watch(
        &self,
        target: &ResourceRef,
        resource_version: Option<String>,
    ) -> Result<EventStream, Error> {
        self.inner.watch(&self.pin_ref(target), resource_version).await
    }
}
