//! Error taxonomy for render sessions.

use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Errors raised while preparing, launching, or tearing down a render run.
#[derive(Debug, thiserror::Error)]
pub enum RenderError {
    #[error("No free port in {start}-{end} after {attempts} attempts")]
    PortUnavailable { start: u16, end: u16, attempts: u32 },

    #[error("Failed to launch render tool: {0}")]
    LaunchFailed(String),

    #[error("Render tool did not answer within {0:?}")]
    ReadinessTimeout(Duration),

    #[error("{remaining} process(es) still alive after stop")]
    StopFailed { remaining: usize },

    #[error("Refresh is unavailable while an external notebook is loaded")]
    ExternalDocument,

    #[error("No rendered endpoint is ready")]
    NotReady,

    #[error("Notebook serialization failed: {0}")]
    Serialize(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, RenderError>;

/// Caller-facing classification of a failed run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureKind {
    PortUnavailable,
    LaunchFailed,
    ReadinessTimeout,
    StopFailed,
    Document,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FailureKind::PortUnavailable => write!(f, "port_unavailable"),
            FailureKind::LaunchFailed => write!(f, "launch_failed"),
            FailureKind::ReadinessTimeout => write!(f, "readiness_timeout"),
            FailureKind::StopFailed => write!(f, "stop_failed"),
            FailureKind::Document => write!(f, "document"),
        }
    }
}

impl RenderError {
    pub fn kind(&self) -> FailureKind {
        match self {
            RenderError::PortUnavailable { .. } => FailureKind::PortUnavailable,
            RenderError::LaunchFailed(_) => FailureKind::LaunchFailed,
            RenderError::ReadinessTimeout(_) => FailureKind::ReadinessTimeout,
            RenderError::StopFailed { .. } => FailureKind::StopFailed,
            RenderError::ExternalDocument
            | RenderError::NotReady
            | RenderError::Serialize(_)
            | RenderError::Io(_)
            | RenderError::Json(_) => FailureKind::Document,
        }
    }

    /// Whether starting a fresh run has a reasonable chance of succeeding.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            RenderError::PortUnavailable { .. } | RenderError::ReadinessTimeout(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retryable_classification() {
        let port = RenderError::PortUnavailable {
            start: 7000,
            end: 7999,
            attempts: 10,
        };
        assert!(port.is_retryable());
        assert!(RenderError::ReadinessTimeout(Duration::from_secs(1)).is_retryable());
        assert!(!RenderError::LaunchFailed("missing".into()).is_retryable());
        assert!(!RenderError::StopFailed { remaining: 1 }.is_retryable());
    }

    #[test]
    fn test_failure_kind_serialize() {
        let json = serde_json::to_string(&FailureKind::ReadinessTimeout).unwrap();
        assert_eq!(json, "\"readiness_timeout\"");
        assert_eq!(FailureKind::LaunchFailed.to_string(), "launch_failed");
    }

    #[test]
    fn test_document_errors_share_one_kind() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "gone");
        let errors = [
            RenderError::Io(io),
            RenderError::Serialize("bad cell".into()),
            RenderError::ExternalDocument,
            RenderError::NotReady,
        ];
        for err in &errors {
            assert_eq!(err.kind(), FailureKind::Document, "{}", err);
        }
        assert_eq!(
            serde_json::to_string(&FailureKind::Document).unwrap(),
            "\"document\""
        );
    }

    #[test]
    fn test_port_unavailable_message() {
        let err = RenderError::PortUnavailable {
            start: 7000,
            end: 7001,
            attempts: 4,
        };
        assert_eq!(err.to_string(), "No free port in 7000-7001 after 4 attempts");
        assert_eq!(err.kind(), FailureKind::PortUnavailable);
    }
}
