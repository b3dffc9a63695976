//! Error types for the Weld operator
//!
//! Errors carry enough context to classify them as retriable (re-enqueue the
//! bundle with back-off) or terminal (surfaced in status until the spec
//! changes). The classification drives both the per-resource Error condition
//! reason and the controller's requeue decision.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for Weld operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// The Bundle spec itself is invalid (duplicate resource names, dependency
    /// cycle, reference to a resource that does not exist, a resource with
    /// neither or both of `object` and `plugin`)
    #[error("invalid bundle spec for {bundle}: {message}")]
    InvalidSpec {
        /// Name of the bundle with the invalid spec
        bundle: String,
        /// Description of what's invalid
        message: String,
    },

    /// A reference could not be resolved against its producer object
    #[error("reference error in resource {resource}: {message}")]
    Reference {
        /// Name of the consumer resource
        resource: String,
        /// Description of what failed
        message: String,
        /// Missing paths are retriable (the producer may still be populating);
        /// unknown modifiers and malformed values are not
        retriable: bool,
    },

    /// Plugin lookup or invocation failed
    #[error("plugin error [{plugin}]: {message}")]
    Plugin {
        /// Name of the plugin
        plugin: String,
        /// Description of what failed
        message: String,
    },

    /// A spec entry collides with a live object not controlled by this Bundle
    #[error("object {kind}/{name} is not controlled by this bundle")]
    ForeignObject {
        /// Kind of the colliding object
        kind: String,
        /// Name of the colliding object
        name: String,
    },

    /// The cluster does not serve the requested group/version/kind
    #[error("kind {kind} is not registered with the cluster")]
    UnknownKind {
        /// The group/version/kind that failed to resolve
        kind: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },

    /// Aggregated per-resource failures for a reconciliation pass
    #[error("error processing resource(s): {resources:?}")]
    ResourceFailures {
        /// Names of the failed resources, in spec order
        resources: Vec<String>,
        /// True only if every failing resource failed retriably
        retriable: bool,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Context where the error occurred (e.g., "resource-sync", "store")
        context: String,
    },
}

impl Error {
    /// Create an invalid-spec error without bundle context
    pub fn invalid_spec(msg: impl Into<String>) -> Self {
        Self::InvalidSpec {
            bundle: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create an invalid-spec error with bundle context
    pub fn invalid_spec_for(bundle: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidSpec {
            bundle: bundle.into(),
            message: msg.into(),
        }
    }

    /// Create a retriable reference error (value not present yet)
    pub fn reference_pending(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Reference {
            resource: resource.into(),
            message: msg.into(),
            retriable: true,
        }
    }

    /// Create a terminal reference error (the reference can never resolve)
    pub fn reference_invalid(resource: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Reference {
            resource: resource.into(),
            message: msg.into(),
            retriable: false,
        }
    }

    /// Create a plugin error
    pub fn plugin(plugin: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Plugin {
            plugin: plugin.into(),
            message: msg.into(),
        }
    }

    /// Create a foreign-object error
    pub fn foreign_object(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::ForeignObject {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an unknown-kind error
    pub fn unknown_kind(kind: impl Into<String>) -> Self {
        Self::UnknownKind { kind: kind.into() }
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

    /// Create an internal error with context
    pub fn internal(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            message: msg.into(),
            context: context.into(),
        }
    }

    /// Check if this error is retriable
    ///
    /// Spec errors, foreign-object collisions, unknown kinds and plugin
    /// failures require a spec change and are not retried. Transport errors,
    /// conflicts and not-found races are retried with back-off.
    pub fn is_retriable(&self) -> bool {
        match self {
            Error::Kube { source } => match source {
                kube::Error::Api(ae) => match ae.code {
                    // Conflict: resource version or UID precondition failed,
                    // the next pass reads fresh state.
                    409 => true,
                    // Not found mid-pass: deleted and possibly recreated.
                    404 => true,
                    // Timeout / too many requests.
                    408 | 429 => true,
                    // Validation, forbidden, unprocessable and friends.
                    code if (400..500).contains(&code) => false,
                    _ => true,
                },
                // Transport-level failures (connection refused, TLS, etc.)
                _ => true,
            },
            Error::InvalidSpec { .. } => false,
            Error::Reference { retriable, .. } => *retriable,
            Error::Plugin { .. } => false,
            Error::ForeignObject { .. } => false,
            Error::UnknownKind { .. } => false,
            Error::Serialization { .. } => false,
            Error::ResourceFailures { retriable, .. } => *retriable,
            Error::Internal { .. } => true,
        }
    }

    /// Check if this is a write conflict (resource version or UID mismatch).
    ///
    /// A conflict on any managed object short-circuits the whole pass.
    pub fn is_conflict(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(ae)
            } if ae.code == 409 && ae.reason == "Conflict"
        )
    }

    /// Check if this is a not-found error
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::Kube {
                source: kube::Error::Api(ae)
            } if ae.code == 404
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use kube::core::ErrorResponse;

    fn api_error(code: u16, reason: &str) -> Error {
        Error::Kube {
            source: kube::Error::Api(ErrorResponse {
                status: "Failure".to_string(),
                message: format!("{} ({})", reason, code),
                reason: reason.to_string(),
                code,
            }),
        }
    }

    // ==========================================================================
    // Story Tests: error classification drives retry behavior
    // ==========================================================================

    /// Story: spec problems are never retried, the user must fix the bundle
    #[test]
    fn story_spec_errors_are_terminal() {
        let err = Error::invalid_spec("bundle contains two resources named \"db\"");
        assert!(!err.is_retriable());
        assert!(err.to_string().contains("two resources named"));

        let err = Error::invalid_spec_for("my-bundle", "dependency cycle: a -> b -> a");
        assert!(!err.is_retriable());
        assert!(err.to_string().contains("my-bundle"));
    }

    /// Story: a reference into a producer that has not populated the field yet
    /// retries; a reference with a bogus modifier never will
    #[test]
    fn story_reference_errors_split_by_cause() {
        let pending = Error::reference_pending("app", "path status.podIP not found in db");
        assert!(pending.is_retriable());

        let invalid = Error::reference_invalid("app", "unknown modifier \"frobnicate\"");
        assert!(!invalid.is_retriable());
        assert!(invalid.to_string().contains("app"));
    }

    /// Story: touching an object some other controller owns is a permanent
    /// error until the spec stops colliding with it
    #[test]
    fn story_foreign_objects_are_never_mutated_or_retried() {
        let err = Error::foreign_object("ConfigMap", "shared");
        assert!(!err.is_retriable());
        assert!(err.to_string().contains("ConfigMap/shared"));
    }

    /// Story: API error codes map onto the retry classification
    #[test]
    fn story_kube_error_codes_classify() {
        // Conflicts and races retry
        assert!(api_error(409, "Conflict").is_retriable());
        assert!(api_error(404, "NotFound").is_retriable());
        assert!(api_error(408, "Timeout").is_retriable());
        assert!(api_error(429, "TooManyRequests").is_retriable());

        // Validation-class failures don't
        assert!(!api_error(400, "BadRequest").is_retriable());
        assert!(!api_error(403, "Forbidden").is_retriable());
        assert!(!api_error(422, "Invalid").is_retriable());

        // Server-side blowups retry
        assert!(api_error(500, "InternalError").is_retriable());
        assert!(api_error(503, "ServiceUnavailable").is_retriable());
    }

    /// Story: only a genuine version/UID conflict short-circuits the pass;
    /// create colliding with an existing object does not
    #[test]
    fn story_conflict_detection_is_reason_sensitive() {
        assert!(api_error(409, "Conflict").is_conflict());
        assert!(!api_error(409, "AlreadyExists").is_conflict());
        assert!(!api_error(404, "NotFound").is_conflict());

        assert!(api_error(404, "NotFound").is_not_found());
        assert!(!api_error(409, "Conflict").is_not_found());
    }

    /// Story: the aggregated pass error is retriable only when every failing
    /// resource is
    #[test]
    fn story_aggregated_resource_failures() {
        let all_retriable = Error::ResourceFailures {
            resources: vec!["a".to_string(), "b".to_string()],
            retriable: true,
        };
        assert!(all_retriable.is_retriable());
        assert!(all_retriable
            .to_string()
            .contains("error processing resource(s)"));
        assert!(all_retriable.to_string().contains("\"a\""));

        let one_terminal = Error::ResourceFailures {
            resources: vec!["a".to_string()],
            retriable: false,
        };
        assert!(!one_terminal.is_retriable());
    }

    #[test]
    fn test_plugin_errors_are_terminal() {
        let err = Error::plugin("sqs-queue", "no such plugin");
        assert!(!err.is_retriable());
        assert!(err.to_string().contains("[sqs-queue]"));
    }

    #[test]
    fn test_unknown_kind_is_terminal() {
        let err = Error::unknown_kind("example.com/v1, Kind=Widget");
        assert!(!err.is_retriable());
    }

    #[test]
    fn test_internal_errors_retry() {
        let err = Error::internal("store", "cache not primed");
        assert!(err.is_retriable());
        assert!(err.to_string().contains("[store]"));
    }

    #[test]
    fn test_serialization_errors_are_terminal() {
        let err = Error::serialization_for_kind("Deployment", "missing field `spec`");
        assert!(!err.is_retriable());
        match &err {
            Error::Serialization { kind, .. } => assert_eq!(kind.as_deref(), Some("Deployment")),
            _ => panic!("Expected Serialization variant"),
        }
    }
}
