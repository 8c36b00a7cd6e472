//! Error taxonomy for the enumeration engine.
//!
//! Errors are tagged where they are first observed (mostly in the retry
//! executor). Callers branch on [`EnumerateError::is_fatal`] and
//! [`EnumerateError::stop_reason`], never on message text.

use std::time::Duration;

use census_core::StopReason;

/// Failure of a single network call.
#[derive(Debug, thiserror::Error)]
pub enum CallError {
    #[error(transparent)]
    Kube(#[from] kube::Error),
    #[error("no response within {}s", .0.as_secs())]
    TimedOut(Duration),
}

impl CallError {
    /// HTTP status reported by the API server, if any.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Kube(kube::Error::Api(resp)) => Some(resp.code),
            _ => None,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EnumerateError {
    /// Credentials or client configuration are unusable.
    #[error("building cluster client: {0}")]
    Client(String),
    #[error("discovery cache is not initialized; run discovery before resolving resource types")]
    NotInitialized,
    #[error("cannot resolve {name:?}: as kind: {as_kind}; as resource: {as_resource}")]
    Unresolved { name: String, as_kind: String, as_resource: String },
    /// Non-retriable failure reported by the server or transport.
    #[error("{operation} failed: {source}")]
    Failed {
        operation: String,
        #[source]
        source: CallError,
    },
    #[error("{operation} exhausted {attempts} attempts: {source}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        #[source]
        source: CallError,
    },
    /// The run context fired (deadline, idle window, cancellation).
    #[error("{operation} interrupted: {reason}")]
    Interrupted {
        operation: String,
        reason: StopReason,
        /// Last retriable error seen before the context fired, if any.
        last_error: Option<String>,
    },
}

impl EnumerateError {
    pub fn interrupted(operation: &str, reason: StopReason) -> Self {
        Self::Interrupted { operation: operation.to_string(), reason, last_error: None }
    }

    /// True when the whole run must stop, not just the current resource type.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Interrupted { .. })
    }

    pub fn stop_reason(&self) -> Option<StopReason> {
        match self {
            Self::Interrupted { reason, .. } => Some(*reason),
            _ => None,
        }
    }

    /// HTTP status of the underlying call, when the server produced one.
    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Failed { source, .. } | Self::RetriesExhausted { source, .. } => source.status_code(),
            _ => None,
        }
    }
}
