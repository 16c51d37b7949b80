use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::process::{ResourceClass, TierKind};
use crate::state_machine::JobState;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error("tier {tier} unavailable: {detail}")]
    TierUnavailable { tier: TierKind, detail: String },

    #[error("no tier available for process {process}: {detail}")]
    NoTierAvailable { process: String, detail: String },

    #[error("capacity exceeded for {tier}/{class}")]
    CapacityExceeded { tier: TierKind, class: ResourceClass },

    #[error("not authorized to {access} collection {collection}")]
    NotAuthorized { collection: String, access: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("execution failed on {tier}: {message}")]
    Execution { tier: TierKind, message: String },

    #[error("job cancelled{}", cancel_suffix(.forced))]
    Cancelled { forced: bool },

    #[error("Job not found: {0}")]
    JobNotFound(String),

    #[error("Workflow not found: {0}")]
    WorkflowNotFound(String),

    #[error("Process not found: {0}")]
    ProcessNotFound(String),

    #[error("invalid transition {from} -> {to}")]
    InvalidTransition { from: JobState, to: JobState },

    #[error("reservation {0} already released")]
    ReservationReleased(u64),

    #[error("results not ready: job {job_id} is {state}")]
    ResultsNotReady { job_id: String, state: JobState },

    #[error("job {job_id} failed: {detail}")]
    JobFailed { job_id: String, detail: ErrorDetail },

    #[error("provenance already recorded for job {0}")]
    ProvenanceExists(String),

    #[error("address blocked: {0}")]
    AddressBlocked(String),

    #[error("catalog error: {0}")]
    Catalog(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
}

fn cancel_suffix(forced: &bool) -> &'static str {
    if *forced {
        " (forced after grace period)"
    } else {
        ""
    }
}

/// Failure reported by an [`ExecutionTier`](crate::tier::ExecutionTier).
///
/// `Unavailable` is an infrastructure signal that lets the coordinator fall
/// back to the next preference; `Execution` is terminal for the job.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TierError {
    #[error("tier unavailable: {0}")]
    Unavailable(String),

    #[error("{0}")]
    Execution(String),

    #[error("execution cancelled")]
    Cancelled,
}

#[derive(Debug, Error)]
pub enum CatalogError {
    #[error("not authorized to {access} collection {collection}")]
    NotAuthorized { collection: String, access: String },

    #[error("collection not found: {0}")]
    NotFound(String),

    #[error("address blocked: {0}")]
    AddressBlocked(String),

    #[error("operation not supported by this catalog store: {0}")]
    Unsupported(&'static str),

    #[error("catalog backend error: {0}")]
    Backend(String),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl From<CatalogError> for EngineError {
    fn from(err: CatalogError) -> Self {
        match err {
            CatalogError::NotAuthorized { collection, access } => {
                EngineError::NotAuthorized { collection, access }
            }
            CatalogError::NotFound(what) => EngineError::NotFound(what),
            CatalogError::AddressBlocked(addr) => EngineError::AddressBlocked(addr),
            other => EngineError::Catalog(other.to_string()),
        }
    }
}

/// Stable classification of a job failure, persisted alongside the message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NoTierAvailable,
    NotAuthorized,
    NotFound,
    Validation,
    Execution,
    Cancelled,
    AddressBlocked,
    Catalog,
    /// A workflow step was not attempted because a dependency did not succeed.
    UpstreamFailed,
    Interrupted,
    Internal,
}

impl std::fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ErrorKind::NoTierAvailable => "NoTierAvailable",
            ErrorKind::NotAuthorized => "NotAuthorized",
            ErrorKind::NotFound => "NotFound",
            ErrorKind::Validation => "ValidationError",
            ErrorKind::Execution => "ExecutionError",
            ErrorKind::Cancelled => "Cancelled",
            ErrorKind::AddressBlocked => "AddressBlocked",
            ErrorKind::Catalog => "CatalogError",
            ErrorKind::UpstreamFailed => "UpstreamFailed",
            ErrorKind::Interrupted => "Interrupted",
            ErrorKind::Internal => "InternalError",
        };
        f.write_str(s)
    }
}

/// Human-readable failure carried by a terminal job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorDetail {
    pub kind: ErrorKind,
    pub message: String,
}

impl ErrorDetail {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl std::fmt::Display for ErrorDetail {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.kind, self.message)
    }
}

impl From<&EngineError> for ErrorDetail {
    fn from(err: &EngineError) -> Self {
        let kind = match err {
            EngineError::NoTierAvailable { .. }
            | EngineError::TierUnavailable { .. }
            | EngineError::CapacityExceeded { .. } => ErrorKind::NoTierAvailable,
            EngineError::NotAuthorized { .. } => ErrorKind::NotAuthorized,
            EngineError::NotFound(_) | EngineError::ProcessNotFound(_) => ErrorKind::NotFound,
            EngineError::Validation(_) => ErrorKind::Validation,
            EngineError::Execution { .. } => ErrorKind::Execution,
            EngineError::Cancelled { .. } => ErrorKind::Cancelled,
            EngineError::AddressBlocked(_) => ErrorKind::AddressBlocked,
            EngineError::Catalog(_) => ErrorKind::Catalog,
            EngineError::JobFailed { detail, .. } => detail.kind,
            _ => ErrorKind::Internal,
        };
        // Execution errors surface the tier's message verbatim.
        let message = match err {
            EngineError::Execution { message, .. } => message.clone(),
            other => other.to_string(),
        };
        Self { kind, message }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn execution_detail_keeps_tier_message() {
        let err = EngineError::Execution {
            tier: TierKind::InProcess,
            message: "buffer distance must be positive".into(),
        };
        let detail = ErrorDetail::from(&err);
        assert_eq!(detail.kind, ErrorKind::Execution);
        assert_eq!(detail.message, "buffer distance must be positive");
        assert_eq!(
            detail.to_string(),
            "ExecutionError: buffer distance must be positive"
        );
    }

    #[test]
    fn catalog_errors_map_to_engine_taxonomy() {
        let err: EngineError = CatalogError::NotAuthorized {
            collection: "parcels".into(),
            access: "read".into(),
        }
        .into();
        assert!(matches!(err, EngineError::NotAuthorized { .. }));

        let err: EngineError = CatalogError::NotFound("roads".into()).into();
        assert!(matches!(err, EngineError::NotFound(ref c) if c == "roads"));

        let err: EngineError = CatalogError::Unsupported("write").into();
        assert!(matches!(err, EngineError::Catalog(_)));
    }

    #[test]
    fn cancelled_display_mentions_force() {
        assert_eq!(
            EngineError::Cancelled { forced: true }.to_string(),
            "job cancelled (forced after grace period)"
        );
        assert_eq!(
            EngineError::Cancelled { forced: false }.to_string(),
            "job cancelled"
        );
    }

    #[test]
    fn error_is_send_sync() {
        fn assert_send_sync<T: Send + Sync>() {}
        assert_send_sync::<EngineError>();
        assert_send_sync::<CatalogError>();
    }
}
