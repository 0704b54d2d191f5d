//! Queue error model.

use thiserror::Error;

use crate::id::{LeadId, ProjectId};

/// Result type used across the queue.
pub type QueueResult<T> = Result<T, QueueError>;

/// Queue-level error.
///
/// `NotFound`, `InvalidArgument` and `Forbidden` are surfaced synchronously to
/// bulk operation callers. Dispatch errors are consumed by the retry policy and
/// only ever show up in audit entries and metrics.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// An unknown lead or project was referenced.
    #[error("not found: {0}")]
    NotFound(String),

    /// A malformed request (e.g. mismatched reorder arrays).
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Cross-project access.
    #[error("forbidden: {0}")]
    Forbidden(String),

    /// The messaging gateway reported a transient failure.
    #[error("dispatch failed: {0}")]
    DispatchFailure(String),

    /// The messaging gateway did not answer within the configured bound.
    #[error("dispatch timed out")]
    DispatchTimeout,

    /// Queue settings or runtime configuration outside documented bounds.
    #[error("configuration error: {0}")]
    Configuration(String),

    /// Backing store failure (lock poisoning, IO).
    #[error("storage error: {0}")]
    Storage(String),
}

impl QueueError {
    pub fn lead_not_found(id: LeadId) -> Self {
        Self::NotFound(format!("lead {id}"))
    }

    pub fn project_not_configured(id: ProjectId) -> Self {
        Self::NotFound(format!("no queue settings for project {id}"))
    }

    pub fn invalid_argument(msg: impl Into<String>) -> Self {
        Self::InvalidArgument(msg.into())
    }

    pub fn cross_project(lead: LeadId, project: ProjectId) -> Self {
        Self::Forbidden(format!("lead {lead} does not belong to project {project}"))
    }

    pub fn configuration(msg: impl Into<String>) -> Self {
        Self::Configuration(msg.into())
    }

    pub fn storage(msg: impl Into<String>) -> Self {
        Self::Storage(msg.into())
    }

    /// Whether the failure is handled by the retry policy rather than surfaced.
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::DispatchFailure(_) | Self::DispatchTimeout)
    }

    /// Short reason recorded in audit metadata for dispatch errors.
    pub fn audit_reason(&self) -> String {
        match self {
            Self::DispatchTimeout => "timeout".to_string(),
            Self::DispatchFailure(reason) => reason.clone(),
            other => other.to_string(),
        }
    }
}
