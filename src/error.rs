//! Error types for cluster-sync
//!
//! Errors carry enough context (request key, pipeline stage, kind) for
//! structured logging. Classification drives the controller's error
//! policy: retryable errors are requeued with backoff, everything else is
//! logged and dropped.

use thiserror::Error;

/// Main error type for cluster-sync operations
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {0}")]
    Kube(#[from] kube::Error),

    /// Object does not exist in the target cluster
    #[error("{kind} {name} not found")]
    NotFound {
        /// Kind identity of the missing object
        kind: String,
        /// Namespaced name of the missing object
        name: String,
    },

    /// Object already exists in the target cluster
    #[error("{kind} {name} already exists")]
    AlreadyExists {
        /// Kind identity of the conflicting object
        kind: String,
        /// Namespaced name of the conflicting object
        name: String,
    },

    /// Reconcile key could not be decoded
    #[error("malformed reconcile key {key:?}: {message}")]
    MalformedKey {
        /// The raw key
        key: String,
        /// What is wrong with it
        message: String,
    },

    /// Patched result is not a usable generic object
    #[error("invalid object: {0}")]
    InvalidObject(String),

    /// Rule engine failed to evaluate an object
    #[error("rule match error: {0}")]
    RuleMatch(String),

    /// Overlay patch could not be applied
    #[error("overlay error: {0}")]
    Overlay(String),

    /// Rate limiter failed to answer
    #[error("rate limiter error: {0}")]
    RateLimit(String),

    /// Identity of the local cluster could not be determined
    #[error("could not resolve cluster id: {0}")]
    ClusterIdentity(String),

    /// A pass exceeded its deadline
    #[error("reconcile of {key} timed out")]
    Timeout {
        /// Request key of the pass
        key: String,
    },

    /// A pass was interrupted by shutdown
    #[error("reconcile of {key} cancelled")]
    Cancelled {
        /// Request key of the pass
        key: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Transient error annotated with the request and stage it occurred in
    #[error("{stage} failed for {key}: {source}")]
    Stage {
        /// Request key being reconciled
        key: String,
        /// Pipeline stage (e.g. "fetch", "apply", "status")
        stage: &'static str,
        /// Underlying cause
        #[source]
        source: Box<Error>,
    },

    /// Internal/operational error
    #[error("internal error [{context}]: {message}")]
    Internal {
        /// Description of what failed
        message: String,
        /// Where it failed (e.g. "transport", "watch")
        context: String,
    },
}

impl Error {
    /// Create a not-found error for a kind and namespaced name
    pub fn not_found(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create an already-exists error for a kind and namespaced name
    pub fn already_exists(kind: impl Into<String>, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind: kind.into(),
            name: name.into(),
        }
    }

    /// Create a malformed-key error
    pub fn malformed_key(key: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::MalformedKey {
            key: key.into(),
            message: msg.into(),
        }
    }

    /// Create an invalid-object error
    pub fn invalid_object(msg: impl Into<String>) -> Self {
        Self::InvalidObject(msg.into())
    }

    /// Create a rule match error
    pub fn rule_match(msg: impl Into<String>) -> Self {
        Self::RuleMatch(msg.into())
    }

    /// Create an overlay error
    pub fn overlay(msg: impl Into<String>) -> Self {
        Self::Overlay(msg.into())
    }

    /// Create a rate limiter error
    pub fn rate_limit(msg: impl Into<String>) -> Self {
        Self::RateLimit(msg.into())
    }

    /// Create a cluster identity error
    pub fn cluster_identity(msg: impl Into<String>) -> Self {
        Self::ClusterIdentity(msg.into())
    }

    /// Create a serialization error
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization(msg.into())
    }

    /// Create an internal error with context
    pub fn internal_with_context(context: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Internal {
            context: context.into(),
            message: msg.into(),
        }
    }

    /// Wrap this error with the request key and pipeline stage
    pub fn at_stage(self, key: impl Into<String>, stage: &'static str) -> Self {
        Self::Stage {
            key: key.into(),
            stage,
            source: Box::new(self),
        }
    }

    /// Innermost error, looking through stage wrappers
    pub fn root(&self) -> &Error {
        match self {
            Error::Stage { source, .. } => source.root(),
            other => other,
        }
    }

    /// The stage this error was raised in, if recorded
    pub fn stage(&self) -> Option<&'static str> {
        match self {
            Error::Stage { stage, .. } => Some(stage),
            _ => None,
        }
    }

    /// True when the target object does not exist
    pub fn is_not_found(&self) -> bool {
        match self.root() {
            Error::NotFound { .. } => true,
            Error::Kube(kube::Error::Api(ae)) => ae.code == 404,
            _ => false,
        }
    }

    /// True when a create raced with an existing object
    pub fn is_already_exists(&self) -> bool {
        match self.root() {
            Error::AlreadyExists { .. } => true,
            Error::Kube(kube::Error::Api(ae)) => ae.code == 409 && ae.reason == "AlreadyExists",
            _ => false,
        }
    }

    /// Check if this error is retryable
    ///
    /// Malformed keys and invalid objects will fail identically on every
    /// attempt, so they are dropped. Everything else is treated as transient.
    pub fn is_retryable(&self) -> bool {
        match self.root() {
            Error::MalformedKey { .. } => false,
            Error::InvalidObject(_) => false,
            _ => true,
        }
    }
}
