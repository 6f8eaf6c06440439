//! Common primitives for testbed: errors, retry, run contexts, and the kind
//! registry used to route manifests to API endpoints.

#![deny(missing_docs)]

pub mod context;
pub mod error;
pub mod kube_utils;
pub mod registry;
pub mod retry;
pub mod telemetry;
pub mod yaml;

pub use context::RunContext;
pub use error::Error;
pub use registry::KindRegistry;

/// Field manager name recorded on objects this crate writes
pub const FIELD_MANAGER: &str = "testbed";

/// Label key marking resources that belong to one test scenario
pub const SCENARIO_LABEL_KEY: &str = "testbed.dev/scenario";
