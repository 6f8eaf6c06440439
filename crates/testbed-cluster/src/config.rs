//! Timing and naming configuration
//!
//! Defaults match what a kind-backed Cluster API management cluster needs.
//! Values can be loaded from serde input (durations as `*_secs` integers) or
//! overridden through `TESTBED_*` environment variables.

use std::time::Duration;

use serde::Deserialize;
use tracing::warn;

/// Source of environment variables
///
/// Lets tests supply overrides without touching process-global state.
#[cfg_attr(test, mockall::automock)]
pub trait EnvSource: Send + Sync {
    /// Value of `key`, if set
    fn var(&self, key: &str) -> Option<String>;
}

/// Reads the process environment
#[derive(Clone, Copy, Debug, Default)]
pub struct OsEnv;

impl EnvSource for OsEnv {
    fn var(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }
}

fn secs_override(env: &dyn EnvSource, key: &str, current: Duration) -> Duration {
    match env.var(key) {
        Some(raw) => match raw.trim().parse::<u64>() {
            Ok(secs) => Duration::from_secs(secs),
            Err(e) => {
                warn!(variable = key, value = %raw, error = %e, "ignoring invalid override");
                current
            }
        },
        None => current,
    }
}

/// Polling intervals and budgets for [`crate::provisioner::CapiProvisioner`]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(from = "ProvisionerConfigSecs")]
pub struct ProvisionerConfig {
    /// Interval between readiness checks in `wait_for_provisioned_clusters`
    pub readiness_interval: Duration,
    /// Interval between kubeconfig secret reads
    pub credential_interval: Duration,
    /// Budget for one cluster's kubeconfig secret to appear
    pub credential_timeout: Duration,
    /// Interval between existence checks in `wait_for_resources`
    pub resource_interval: Duration,
    /// Budget for `wait_for_resources`
    pub resource_timeout: Duration,
    /// Interval between bundle attempts in `deploy_into_namespace`
    pub deploy_interval: Duration,
}

impl Default for ProvisionerConfig {
    fn default() -> Self {
        Self {
            readiness_interval: Duration::from_secs(5),
            credential_interval: Duration::from_secs(10),
            credential_timeout: Duration::from_secs(60),
            resource_interval: Duration::from_secs(1),
            resource_timeout: Duration::from_secs(120),
            deploy_interval: Duration::from_secs(10),
        }
    }
}

#[derive(Deserialize)]
#[serde(default)]
struct ProvisionerConfigSecs {
    readiness_interval_secs: u64,
    credential_interval_secs: u64,
    credential_timeout_secs: u64,
    resource_interval_secs: u64,
    resource_timeout_secs: u64,
    deploy_interval_secs: u64,
}

impl Default for ProvisionerConfigSecs {
    fn default() -> Self {
        let d = ProvisionerConfig::default();
        Self {
            readiness_interval_secs: d.readiness_interval.as_secs(),
            credential_interval_secs: d.credential_interval.as_secs(),
            credential_timeout_secs: d.credential_timeout.as_secs(),
            resource_interval_secs: d.resource_interval.as_secs(),
            resource_timeout_secs: d.resource_timeout.as_secs(),
            deploy_interval_secs: d.deploy_interval.as_secs(),
        }
    }
}

impl From<ProvisionerConfigSecs> for ProvisionerConfig {
    fn from(s: ProvisionerConfigSecs) -> Self {
        Self {
            readiness_interval: Duration::from_secs(s.readiness_interval_secs),
            credential_interval: Duration::from_secs(s.credential_interval_secs),
            credential_timeout: Duration::from_secs(s.credential_timeout_secs),
            resource_interval: Duration::from_secs(s.resource_interval_secs),
            resource_timeout: Duration::from_secs(s.resource_timeout_secs),
            deploy_interval: Duration::from_secs(s.deploy_interval_secs),
        }
    }
}

impl ProvisionerConfig {
    /// Defaults overridden by the process environment
    pub fn from_env() -> Self {
        Self::from_env_source(&OsEnv)
    }

    /// Defaults overridden by `TESTBED_*` variables from `env`
    pub fn from_env_source(env: &dyn EnvSource) -> Self {
        let d = Self::default();
        Self {
            readiness_interval: secs_override(env, "TESTBED_READINESS_INTERVAL_SECS", d.readiness_interval),
            credential_interval: secs_override(env, "TESTBED_CREDENTIAL_INTERVAL_SECS", d.credential_interval),
            credential_timeout: secs_override(env, "TESTBED_CREDENTIAL_TIMEOUT_SECS", d.credential_timeout),
            resource_interval: secs_override(env, "TESTBED_RESOURCE_INTERVAL_SECS", d.resource_interval),
            resource_timeout: secs_override(env, "TESTBED_RESOURCE_TIMEOUT_SECS", d.resource_timeout),
            deploy_interval: secs_override(env, "TESTBED_DEPLOY_INTERVAL_SECS", d.deploy_interval),
        }
    }
}

/// Naming for [`crate::scoped::ScopedClientFactory`]
#[derive(Clone, Debug, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    /// Service account created in each scoped namespace
    pub service_account_name: String,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            service_account_name: "test-runner".to_string(),
        }
    }
}

impl ScopeConfig {
    /// Defaults overridden by the process environment
    pub fn from_env() -> Self {
        Self::from_env_source(&OsEnv)
    }

    /// Defaults overridden by `TESTBED_SERVICE_ACCOUNT` from `env`
    pub fn from_env_source(env: &dyn EnvSource) -> Self {
        match env.var("TESTBED_SERVICE_ACCOUNT").filter(|s| !s.is_empty()) {
            Some(service_account_name) => Self {
                service_account_name,
            },
            None => Self::default(),
        }
    }
}
