//! Error types for testbed
//!
//! Errors are structured with fields so a failed provisioning round can be
//! diagnosed from the log line alone: which resource, which stage, and every
//! attempt a retry loop made before giving up.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for testbed operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The addressed resource does not exist (or stopped existing)
    #[error("{resource} not found")]
    NotFound {
        /// Display form of the resource (`Kind namespace/name`)
        resource: String,
    },

    /// The resource being created already exists
    #[error("{resource} already exists")]
    AlreadyExists {
        /// Display form of the resource
        resource: String,
    },

    /// A retry loop or watch ran out of time
    #[error("{operation} timed out after {} attempt(s){}", .attempts.len(), join_attempts(.attempts))]
    Timeout {
        /// Name of the operation that was being retried
        operation: String,
        /// Every failed attempt, oldest first
        attempts: Vec<Error>,
    },

    /// A kind string could not be routed to an API endpoint
    #[error("no API mapping for kind {kind} in {api_version}")]
    Mapping {
        /// apiVersion of the unmapped kind
        api_version: String,
        /// The unmapped kind
        kind: String,
    },

    /// An observed object has a field of the wrong shape
    #[error("structural error in {resource}: {message}")]
    Structural {
        /// Display form of the resource
        resource: String,
        /// Which field was malformed and how
        message: String,
    },

    /// A provisioning round stopped partway through
    #[error("provisioning failed while {stage} {resource}: {source}")]
    Provision {
        /// Stage of the round (e.g. "creating dependency", "waiting for cluster")
        stage: String,
        /// Display form of the resource being worked on
        resource: String,
        /// What went wrong
        #[source]
        source: Box<Error>,
    },

    /// A manifest document could not be decoded
    #[error("failed to parse manifest: {message}\n{raw}")]
    Parse {
        /// Decoder message
        message: String,
        /// The offending document text
        raw: String,
    },

    /// A cluster credential could not be read or decoded
    #[error("credential error for {cluster}: {message}")]
    Credential {
        /// Cluster whose credential was being read
        cluster: String,
        /// Description of what failed
        message: String,
    },

    /// The server reported an error on a watch stream
    #[error("watch error on {resource}: {message}")]
    Watch {
        /// Display form of the watched resource
        resource: String,
        /// Message from the server
        message: String,
    },

    /// Several independent operations failed
    #[error("{} operation(s) failed{}", .errors.len(), join_attempts(.errors))]
    Aggregate {
        /// Every failure, in the order it was observed
        errors: Vec<Error>,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g. "provisioner", "retry")
        context: String,
    },
}

fn join_attempts(errors: &[Error]) -> String {
    errors
        .iter()
        .map(|e| format!("\n  - {e}"))
        .collect::<String>()
}

impl Error {
    /// Create a not-found error for a resource
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::NotFound {
            resource: resource.into(),
        }
    }

    /// Create an already-exists error for a resource
    pub fn already_exists(resource: impl Into<String>) -> Self {
        Self::AlreadyExists {
            resource: resource.into(),
        }
    }

    /// Create a timeout error carrying every failed attempt
    pub fn timeout(operation: impl Into<String>, attempts: Vec<Error>) -> Self {
        Self::Timeout {
            operation: operation.into(),
            attempts,
        }
    }

    /// Create a mapping error for an unroutable kind
    pub fn mapping(api_version: impl Into<String>, kind: impl Into<String>) -> Self {
        Self::Mapping {
            api_version: api_version.into(),
            kind: kind.into(),
        }
    }

    /// Create a structural error for a malformed field
    pub fn structural(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Structural {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Wrap an error with the provisioning stage it interrupted
    pub fn provision(stage: impl Into<String>, resource: impl Into<String>, source: Error) -> Self {
        Self::Provision {
            stage: stage.into(),
            resource: resource.into(),
            source: Box::new(source),
        }
    }

    /// Create a parse error, attaching the document that failed
    pub fn parse(msg: impl Into<String>, raw: impl Into<String>) -> Self {
        Self::Parse {
            message: msg.into(),
            raw: raw.into(),
        }
    }

    /// Create a credential error for a cluster
    pub fn credential(cluster: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Credential {
            cluster: cluster.into(),
            message: msg.into(),
        }
    }

    /// Create a watch error for a resource
    pub fn watch(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Watch {
            resource: resource.into(),
            message: msg.into(),
        }
    }

    /// Collapse a list of failures into one error
    ///
    /// Returns `Ok(())` when the list is empty and the sole error when it has
    /// exactly one entry.
    pub fn aggregate(mut errors: Vec<Error>) -> Result<(), Self> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Self::Aggregate { errors }),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Create an internal error with the given message
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: UNKNOWN_CONTEXT.to_string(),
        }
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Whether this error means "the resource is absent"
    ///
    /// Recognizes our own variant, raw API 404s, and NotFound wrapped by a
    /// provisioning stage.
    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 404,
            Error::Provision { source, .. } => source.is_not_found(),
            _ => false,
        }
    }

    /// Whether this error means "the resource already exists"
    pub fn is_already_exists(&self) -> bool {
        match self {
            Error::AlreadyExists { .. } => true,
            Error::Kube {
                source: kube::Error::Api(ae),
            } => ae.code == 409,
            _ => false,
        }
    }

    /// Whether this error is a retry or watch deadline
    pub fn is_timeout(&self) -> bool {
        matches!(self, Error::Timeout { .. })
    }

    /// Check if this error is retryable
    ///
    /// Mapping, structural and parse errors need a manifest or cluster fix;
    /// retrying them only burns the deadline.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Don't retry on 4xx errors other than conflicts and throttling
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code) && ae.code != 409 && ae.code != 429
                )
            }
            Error::NotFound { .. } => true,
            Error::AlreadyExists { .. } => false,
            Error::Timeout { .. } => false,
            Error::Mapping { .. } => false,
            Error::Structural { .. } => false,
            Error::Provision { source, .. } => source.is_retryable(),
            Error::Parse { .. } => false,
            Error::Credential { .. } => true,
            Error::Watch { .. } => true,
            Error::Aggregate { errors } => errors.iter().all(Error::is_retryable),
            Error::Serialization { .. } => false,
            Error::Internal { .. } => true,
        }
    }

    /// Get the context if this error has one
    pub fn context(&self) -> Option<&str> {
        match self {
            Error::Internal { context, .. } => Some(context),
            Error::Provision { stage, .. } => Some(stage),
            Error::Timeout { operation, .. } => Some(operation),
            _ => None,
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::serialization(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn api_error(code: u16) -> kube::Error {
        kube::Error::Api(kube::error::ErrorResponse {
            status: "Failure".to_string(),
            message: "boom".to_string(),
            reason: "Reason".to_string(),
            code,
        })
    }

    // ==========================================================================
    // Story Tests: Error Propagation Through a Provisioning Round
    // ==========================================================================

    /// Story: teardown treats an absent resource as already deleted
    ///
    /// Whether the absence came from our own lookup, straight from the API
    /// server, or from inside a failed provisioning stage, the caller asks one
    /// question and gets one answer.
    #[test]
    fn story_absence_is_recognized_from_every_source() {
        assert!(Error::not_found("Cluster default/dev-abc").is_not_found());
        assert!(Error::from(api_error(404)).is_not_found());
        assert!(Error::provision(
            "creating cluster",
            "Cluster default/dev-abc",
            Error::not_found("Namespace default")
        )
        .is_not_found());

        assert!(!Error::from(api_error(500)).is_not_found());
        assert!(!Error::internal("boom").is_not_found());
    }

    /// Story: a timed-out poll explains every attempt
    ///
    /// The caller needs to tell "never succeeded, here's why" apart from an
    /// unrelated failure, so the timeout lists each underlying error.
    #[test]
    fn story_timeout_lists_every_attempt() {
        let err = Error::timeout(
            "fetch kubeconfig",
            vec![
                Error::not_found("Secret default/dev-abc-kubeconfig"),
                Error::internal("connection reset"),
            ],
        );

        let msg = err.to_string();
        assert!(msg.contains("fetch kubeconfig timed out after 2 attempt(s)"));
        assert!(msg.contains("dev-abc-kubeconfig not found"));
        assert!(msg.contains("connection reset"));
        assert!(err.is_timeout());
        assert_eq!(err.context(), Some("fetch kubeconfig"));
    }

    /// Story: partial provisioning failures say where the round stopped
    #[test]
    fn story_provision_failure_names_stage_and_resource() {
        let err = Error::provision(
            "creating dependency",
            "DockerCluster default/dev",
            Error::mapping("infrastructure.cluster.x-k8s.io/v1beta1", "DockerCluster"),
        );

        let msg = err.to_string();
        assert!(msg.contains("creating dependency"));
        assert!(msg.contains("DockerCluster default/dev"));
        assert!(msg.contains("no API mapping for kind DockerCluster"));
        assert!(!err.is_retryable());
    }

    /// Story: malformed manifests surface the document that broke the batch
    #[test]
    fn story_parse_errors_carry_raw_text() {
        let err = Error::parse("expected a mapping", "kind: [unterminated");
        assert!(err.to_string().contains("kind: [unterminated"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn aggregate_collapses_small_lists() {
        assert!(Error::aggregate(vec![]).is_ok());

        match Error::aggregate(vec![Error::internal("one")]) {
            Err(Error::Internal { message, .. }) => assert_eq!(message, "one"),
            other => panic!("expected the single error back, got {other:?}"),
        }

        match Error::aggregate(vec![Error::internal("one"), Error::internal("two")]) {
            Err(err @ Error::Aggregate { .. }) => {
                let msg = err.to_string();
                assert!(msg.starts_with("2 operation(s) failed"));
                assert!(msg.contains("one") && msg.contains("two"));
            }
            other => panic!("expected an aggregate, got {other:?}"),
        }
    }

    #[test]
    fn conflicts_and_throttling_are_retryable() {
        assert!(Error::from(api_error(409)).is_retryable());
        assert!(Error::from(api_error(429)).is_retryable());
        assert!(Error::from(api_error(503)).is_retryable());
        assert!(!Error::from(api_error(403)).is_retryable());
        assert!(Error::from(api_error(409)).is_already_exists());
    }
}
