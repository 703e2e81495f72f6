//! Error types for the load balancer reconciler
//!
//! Provides the domain sentinel conditions the reconcile flow branches on,
//! the raw provider error returned by cloud adapters, and the local invariant
//! violations that abort a reconcile without retrying.

use crate::cloud::errors as codes;
use std::time::Duration;
use thiserror::Error;

/// Unified error type for the reconciler
#[derive(Error, Debug)]
pub enum Error {
    // =========================================================================
    // Internal Errors
    // =========================================================================
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Configuration error: {0}")]
    Configuration(String),

    // =========================================================================
    // Domain Sentinels
    // =========================================================================
    #[error("{0}")]
    NotFound(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Instance not running: {0}")]
    InstanceNotRunning(String),

    #[error("Access denied: {0}")]
    AccessDenied(String),

    // =========================================================================
    // Provider Errors
    // =========================================================================
    /// Opaque error returned by the cloud API, keyed by its error code
    #[error("{code}: {message}")]
    Provider { code: String, message: String },

    // =========================================================================
    // Invariant Violations
    // =========================================================================
    #[error(
        "load balancer names must be unique within a region: {name:?} load balancer already exists in this region in VPC {vpc_id:?}"
    )]
    VpcMismatch { name: String, vpc_id: String },

    #[error(
        "load balancer names must be unique within a region: {name:?} load balancer already exists in this region with a different scheme {scheme:?}"
    )]
    SchemeMismatch { name: String, scheme: String },

    #[error(
        "number of allocated addresses ({allocated}) from pool {pool:?} must match the subnet count ({subnets})"
    )]
    AddressCountMismatch {
        pool: String,
        allocated: usize,
        subnets: usize,
    },

    #[error("Unsupported: {0}")]
    Unsupported(String),

    /// Cloud state was lost after the cluster published its endpoint
    #[error("Unrecoverable: {0}")]
    Unrecoverable(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    // =========================================================================
    // Wrapping
    // =========================================================================
    #[error("{context}: {source}")]
    Context {
        context: String,
        source: Box<Error>,
    },

    #[error("{}", format_aggregate(.0))]
    Aggregate(Vec<Error>),

    // =========================================================================
    // Parse / IO Errors
    // =========================================================================
    #[error("JSON parse error: {0}")]
    JsonParse(#[from] serde_json::Error),

    #[error("YAML parse error: {0}")]
    YamlParse(#[from] serde_yaml::Error),

    #[error("Metrics error: {0}")]
    Metrics(#[from] prometheus::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

fn format_aggregate(errors: &[Error]) -> String {
    match errors {
        [single] => single.to_string(),
        many => format!(
            "[{}]",
            many.iter()
                .map(|e| e.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        ),
    }
}

/// Action to take on error during reconciliation
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorAction {
    /// Requeue with exponential backoff
    RequeueWithBackoff,
    /// Requeue after specific duration
    RequeueAfter(Duration),
    /// Don't requeue, wait for changes
    NoRequeue,
}

impl Error {
    /// Build a provider error from a code and message
    pub fn provider(code: impl Into<String>, message: impl Into<String>) -> Self {
        Error::Provider {
            code: code.into(),
            message: message.into(),
        }
    }

    /// Wrap this error with additional context
    pub fn context(self, context: impl Into<String>) -> Self {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// Collapse a list of errors: none is success, one is returned as-is
    pub fn aggregate(mut errors: Vec<Error>) -> Result<()> {
        match errors.len() {
            0 => Ok(()),
            1 => Err(errors.remove(0)),
            _ => Err(Error::Aggregate(errors)),
        }
    }

    /// Innermost error beneath any context wrappers
    pub fn root(&self) -> &Error {
        let mut current = self;
        while let Error::Context { source, .. } = current {
            current = source;
        }
        current
    }

    /// Provider error code, if the root error came from the cloud API
    pub fn provider_code(&self) -> Option<&str> {
        match self.root() {
            Error::Provider { code, .. } => Some(code.as_str()),
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self.root(), Error::NotFound(_))
    }

    /// Check whether the provider rejected the call for rate limiting
    pub fn is_throttled(&self) -> bool {
        self.provider_code().is_some_and(codes::is_throttle_code)
    }

    /// Determine what action to take for this error
    pub fn action(&self) -> ErrorAction {
        if self.is_throttled() {
            return ErrorAction::RequeueAfter(Duration::from_secs(30));
        }

        match self.root() {
            Error::Timeout(_) => ErrorAction::RequeueAfter(Duration::from_secs(60)),

            // Misconfiguration - a retry sees the same cloud state
            Error::Configuration(_)
            | Error::VpcMismatch { .. }
            | Error::SchemeMismatch { .. }
            | Error::AddressCountMismatch { .. }
            | Error::Unsupported(_)
            | Error::Unrecoverable(_)
            | Error::AccessDenied(_)
            | Error::JsonParse(_)
            | Error::YamlParse(_) => ErrorAction::NoRequeue,

            Error::Aggregate(errors) => {
                if errors.iter().all(|e| e.action() == ErrorAction::NoRequeue) {
                    ErrorAction::NoRequeue
                } else {
                    ErrorAction::RequeueWithBackoff
                }
            }

            _ => ErrorAction::RequeueWithBackoff,
        }
    }

    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        !matches!(self.action(), ErrorAction::NoRequeue)
    }

    /// Check if this error is transient
    pub fn is_transient(&self) -> bool {
        matches!(
            self.root(),
            Error::Provider { .. } | Error::Timeout(_) | Error::InstanceNotRunning(_)
        ) && !matches!(self.root(), Error::Provider { code, .. } if codes::is_access_denied_code(code))
    }
}

/// Extension for attaching context to fallible results
pub trait ResultExt<T> {
    fn context(self, context: impl Into<String>) -> Result<T>;

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C;
}

impl<T> ResultExt<T> for Result<T> {
    fn context(self, context: impl Into<String>) -> Result<T> {
        self.map_err(|e| e.context(context))
    }

    fn with_context<C, F>(self, f: F) -> Result<T>
    where
        C: Into<String>,
        F: FnOnce() -> C,
    {
        self.map_err(|e| e.context(f()))
    }
}

/// Result type alias for the reconciler
pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[test]
    fn test_error_actions() {
        let err = Error::provider(codes::THROTTLING, "rate exceeded");
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(30))
        );

        let err = Error::VpcMismatch {
            name: "lb".into(),
            vpc_id: "vpc-other".into(),
        };
        assert_eq!(err.action(), ErrorAction::NoRequeue);

        let err = Error::Timeout("deletion".into()).context("failed to wait");
        assert_eq!(
            err.action(),
            ErrorAction::RequeueAfter(Duration::from_secs(60))
        );
    }

    #[test]
    fn test_error_retryable() {
        let transient = Error::provider("InternalFailure", "boom");
        assert!(transient.is_retryable());
        assert!(transient.is_transient());

        let config_err = Error::Configuration("invalid".into());
        assert!(!config_err.is_retryable());
        assert!(!config_err.is_transient());
    }

    #[test]
    fn test_context_chain_keeps_root() {
        let err = Error::NotFound("no load balancer found with name \"x\"".into())
            .context("failed to describe")
            .context("cluster default/test");

        assert!(err.is_not_found());
        assert_eq!(
            err.to_string(),
            "cluster default/test: failed to describe: no load balancer found with name \"x\""
        );
    }

    #[test]
    fn test_aggregate() {
        assert!(Error::aggregate(vec![]).is_ok());

        let single = Error::aggregate(vec![Error::Internal("one".into())]).unwrap_err();
        assert_matches!(single, Error::Internal(_));

        let many = Error::aggregate(vec![
            Error::Internal("one".into()),
            Error::Configuration("two".into()),
        ])
        .unwrap_err();
        assert_eq!(
            many.to_string(),
            "[Internal error: one, Configuration error: two]"
        );
        assert_eq!(many.action(), ErrorAction::RequeueWithBackoff);
    }
}
