//! API server health probes for provisioned clusters

use async_trait::async_trait;
use kube::Client;
#[cfg(test)]
use mockall::automock;
use testbed_common::kube_utils::client_from_config;
use testbed_common::Error;

use crate::credentials::Credential;

/// Liveness and health endpoints of one API server
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// `GET /livez`
    async fn livez(&self) -> Result<String, Error>;

    /// `GET /healthz`
    async fn healthz(&self) -> Result<String, Error>;
}

/// Opens probes against clusters using their admin credential
#[cfg_attr(test, automock)]
#[async_trait]
pub trait ClusterConnector: Send + Sync {
    /// Build a probe for the cluster `credential` grants access to
    async fn connect(&self, credential: &Credential) -> Result<Box<dyn HealthProbe>, Error>;
}

/// Run both probes, failing on the first endpoint that does
pub async fn check_health(probe: &dyn HealthProbe) -> Result<(), Error> {
    probe.livez().await?;
    probe.healthz().await?;
    Ok(())
}

/// [`HealthProbe`] over a kube client
pub struct ClusterHealth {
    client: Client,
}

impl ClusterHealth {
    /// Probe the API server `client` talks to
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    async fn get(&self, path: &str) -> Result<String, Error> {
        let request = http::Request::get(path).body(Vec::new()).map_err(|e| {
            Error::internal_with_context("health_probe", format!("invalid request for {path}: {e}"))
        })?;
        Ok(self.client.request_text(request).await?)
    }
}

#[async_trait]
impl HealthProbe for ClusterHealth {
    async fn livez(&self) -> Result<String, Error> {
        self.get("/livez").await
    }

    async fn healthz(&self) -> Result<String, Error> {
        self.get("/healthz").await
    }
}

/// [`ClusterConnector`] that builds kube clients from kubeconfig text
#[derive(Clone, Copy, Debug, Default)]
pub struct KubeConnector;

#[async_trait]
impl ClusterConnector for KubeConnector {
    async fn connect(&self, credential: &Credential) -> Result<Box<dyn HealthProbe>, Error> {
        let config = credential.client_config().await?;
        Ok(Box::new(ClusterHealth::new(client_from_config(config)?)))
    }
}
