//! Ephemeral Cluster API clusters for isolated test runs
//!
//! A [`provisioner::CapiProvisioner`] creates a round of manifests on a
//! management cluster, waits for every `Cluster` to report `Provisioned`,
//! hands out admin credentials, and tears everything down again. Tests that
//! only need a namespace get a least-privilege client from
//! [`scoped::ScopedClientFactory`].

#![deny(missing_docs)]

pub mod config;
pub mod credentials;
pub mod health;
pub mod manifest;
pub mod provisioner;
pub mod resources;
pub mod scoped;
pub mod store;
pub mod watch;

pub use config::{ProvisionerConfig, ScopeConfig};
pub use credentials::Credential;
pub use manifest::{classify_manifests, parse_manifests, Manifest};
pub use provisioner::{CapiProvisioner, ClusterProvisioner, ProvisionState};
pub use scoped::{ScopedClient, ScopedClientFactory};
pub use store::{KubeStore, ObjectStore, ResourceEvent, ResourceRef};

/// Kind that marks a manifest as a cluster rather than a dependency
pub const CLUSTER_KIND: &str = "Cluster";

/// The only `status.phase` value that counts as ready
pub const PHASE_PROVISIONED: &str = "Provisioned";

/// Suffix Cluster API appends to a cluster's name for its kubeconfig secret
pub const KUBECONFIG_SECRET_SUFFIX: &str = "-kubeconfig";

/// Data key holding the kubeconfig inside that secret
pub const KUBECONFIG_SECRET_KEY: &str = "value";
