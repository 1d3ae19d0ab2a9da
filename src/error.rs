//! Error types for queueing, fleet management and backend selection.
//!
//! Retry exhaustion and pod eviction are handled inside their components and
//! only show up here as terminal states; the variants below are what reaches
//! a caller.

use std::fmt;

use crate::backend::BackendKind;
use crate::types::RequestId;

/// Errors surfaced by the request queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// Admission rejected because the pending queue is at capacity.
    QueueFull { max: usize },

    /// The in-flight deadline of a request elapsed.
    RequestTimeout,

    /// The process handler reported a failure.
    Handler(String),

    /// The request was cancelled while still pending.
    Cancelled,

    /// No request with this id is tracked (never existed or history cleared).
    NotFound(RequestId),

    /// The queue was dropped before the request reached a terminal state.
    Closed,
}

impl fmt::Display for QueueError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::QueueFull { max } => write!(f, "Queue is full (max: {})", max),
            Self::RequestTimeout => write!(f, "Request timeout"),
            Self::Handler(msg) => write!(f, "{}", msg),
            Self::Cancelled => write!(f, "Cancelled by user"),
            Self::NotFound(id) => write!(f, "Request not found: {}", id),
            Self::Closed => write!(f, "Request queue closed"),
        }
    }
}

impl std::error::Error for QueueError {}

impl QueueError {
    /// Whether a failure of this kind goes through the retry policy.
    pub fn is_retriable(&self) -> bool {
        matches!(self, Self::RequestTimeout | Self::Handler(_))
    }
}

impl From<anyhow::Error> for QueueError {
    fn from(err: anyhow::Error) -> Self {
        Self::Handler(err.to_string())
    }
}

/// Errors raised by the pod fleet.
#[derive(Debug, Clone)]
pub enum FleetError {
    /// The pool already holds `max` pods (including those being provisioned).
    AtCapacity { max: usize },

    /// Deploying or readying a pod failed.
    Provisioning(String),

    /// No running pod could be selected or provisioned.
    NoPodsAvailable,

    /// A provider lifecycle call failed outside of provisioning.
    Provider(String),

    /// The fleet was shut down; no new pods are registered.
    ShutDown,
}

impl fmt::Display for FleetError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AtCapacity { max } => write!(f, "Fleet at capacity ({} pods)", max),
            Self::Provisioning(msg) => write!(f, "Pod provisioning failed: {}", msg),
            Self::NoPodsAvailable => write!(f, "No pods available"),
            Self::Provider(msg) => write!(f, "Provider error: {}", msg),
            Self::ShutDown => write!(f, "Fleet is shut down"),
        }
    }
}

impl std::error::Error for FleetError {}

/// One backend's reason for not serving a request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackendFailure {
    pub backend: BackendKind,
    pub reason: String,
}

/// Errors raised by backend selection.
#[derive(Debug, Clone)]
pub enum BackendError {
    /// Every backend in priority order was unhealthy or failed the operation.
    AllBackendsFailed(Vec<BackendFailure>),
}

impl fmt::Display for BackendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::AllBackendsFailed(failures) => {
                write!(f, "All backends failed:")?;
                for failure in failures {
                    write!(f, "\n{}: {}", failure.backend, failure.reason)?;
                }
                Ok(())
            }
        }
    }
}

impl std::error::Error for BackendError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_queue_error_messages() {
        assert_eq!(QueueError::QueueFull { max: 2 }.to_string(), "Queue is full (max: 2)");
        assert_eq!(QueueError::Cancelled.to_string(), "Cancelled by user");
        assert_eq!(QueueError::RequestTimeout.to_string(), "Request timeout");
    }

    #[test]
    fn test_retriable_kinds() {
        assert!(QueueError::RequestTimeout.is_retriable());
        assert!(QueueError::Handler("boom".into()).is_retriable());
        assert!(!QueueError::Cancelled.is_retriable());
        assert!(!QueueError::QueueFull { max: 1 }.is_retriable());
    }

    #[test]
    fn test_all_backends_failed_lists_each_reason() {
        let err = BackendError::AllBackendsFailed(vec![
            BackendFailure {
                backend: BackendKind::Local,
                reason: "health check failed".into(),
            },
            BackendFailure {
                backend: BackendKind::Gemini,
                reason: "quota exceeded".into(),
            },
        ]);
        let msg = err.to_string();
        assert!(msg.starts_with("All backends failed:"));
        assert!(msg.contains("local: health check failed"));
        assert!(msg.contains("gemini: quota exceeded"));
    }
}
