//! Centralized error types for the Warden workspace.
//!
//! Two layers:
//! - [`ApiError`] is what the resource gateway returns. Its [`ErrorKind`] is
//!   assigned exactly once, at the gateway boundary, so callers switch on the
//!   kind instead of inspecting messages or cause chains.
//! - [`WardenError`] is the provisioning taxonomy seen by callers of the engine.

use crate::types::ScopeTarget;
use crate::state::Step;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

// ---------------------------------------------------------------------------
// Remote call classification
// ---------------------------------------------------------------------------

/// Failure class of a remote call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    NotFound,
    PermissionDenied,
    AlreadyExists,
    InvalidArgument,
    /// An organization policy constraint rejected the change.
    ConstraintViolation,
    RateLimited,
    /// Optimistic concurrency token (etag) no longer matches the server copy.
    StaleToken,
    /// Credentials are expired or revoked; the operator must sign in again.
    Reauthenticate,
    /// 5xx and transport-level failures.
    Unavailable,
    Other,
}

impl ErrorKind {
    /// Kinds the gateway retries on its own.
    pub fn is_transient(self) -> bool {
        matches!(self, ErrorKind::RateLimited | ErrorKind::Unavailable)
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ErrorKind::NotFound => "not-found",
            ErrorKind::PermissionDenied => "permission-denied",
            ErrorKind::AlreadyExists => "already-exists",
            ErrorKind::InvalidArgument => "invalid-argument",
            ErrorKind::ConstraintViolation => "constraint-violation",
            ErrorKind::RateLimited => "rate-limited",
            ErrorKind::StaleToken => "stale-token",
            ErrorKind::Reauthenticate => "reauthentication-required",
            ErrorKind::Unavailable => "unavailable",
            ErrorKind::Other => "other",
        };
        f.write_str(s)
    }
}

/// A classified remote failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{operation} failed ({kind}): {message}")]
pub struct ApiError {
    pub operation: String,
    pub kind: ErrorKind,
    pub message: String,
}

impl ApiError {
    pub fn new(operation: impl Into<String>, kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            kind,
            message: message.into(),
        }
    }

    #[inline]
    pub fn is(&self, kind: ErrorKind) -> bool {
        self.kind == kind
    }
}

pub type ApiResult<T> = Result<T, ApiError>;

// ---------------------------------------------------------------------------
// Provisioning taxonomy
// ---------------------------------------------------------------------------

/// Top-level error enum. Variants map to failure modes an operator can act on.
#[derive(Debug, Error)]
#[non_exhaustive]
pub enum WardenError {
    /// Bad input. Never retried.
    #[error("Invalid input: {0}")]
    Validation(String),

    #[error("Authentication error: {reason} (remedy: {remedy})")]
    Authentication { reason: String, remedy: String },

    #[error("Missing permission `{permission}` on {scope}; {grantor} must grant a role that contains it")]
    PermissionEscalation {
        permission: String,
        scope: ScopeTarget,
        grantor: String,
    },

    #[error("Constraint `{constraint}` blocks the operation: {reason}")]
    PolicyConflict { constraint: String, reason: String },

    #[error("Policy write on `{resource}` rejected for a stale token {attempts} times in a row")]
    StalePolicyToken { resource: String, attempts: u32 },

    /// The mutation most likely succeeded but its effect was not observed in time.
    #[error("Timed out after {elapsed:?} waiting for {description}")]
    PropagationTimeout {
        description: String,
        elapsed: Duration,
    },

    #[error("Resource conflict: {0}")]
    ResourceConflict(String),

    #[error(transparent)]
    Api(#[from] ApiError),

    #[error("Internal error: {0}")]
    Internal(String),

    /// An unexpected fault raised by a workflow step, with the original cause attached.
    #[error("Step `{step}` failed")]
    Step {
        step: Step,
        #[source]
        source: Box<WardenError>,
    },
}

impl WardenError {
    /// Builds an escalation naming the permission, the scope, and who can grant it.
    pub fn escalation(permission: impl Into<String>, scope: &ScopeTarget) -> Self {
        WardenError::PermissionEscalation {
            permission: permission.into(),
            scope: scope.clone(),
            grantor: scope.kind.grantor().to_string(),
        }
    }

    /// Expected failure modes are reported as values; everything else is a fault.
    pub fn is_expected(&self) -> bool {
        match self {
            WardenError::Validation(_)
            | WardenError::Authentication { .. }
            | WardenError::PermissionEscalation { .. }
            | WardenError::PolicyConflict { .. }
            | WardenError::StalePolicyToken { .. }
            | WardenError::PropagationTimeout { .. }
            | WardenError::ResourceConflict(_) => true,
            WardenError::Step { source, .. } => source.is_expected(),
            WardenError::Api(_) | WardenError::Internal(_) => false,
        }
    }

    /// Classified kind when the error came straight from the gateway.
    pub fn api_kind(&self) -> Option<ErrorKind> {
        match self {
            WardenError::Api(e) => Some(e.kind),
            WardenError::Step { source, .. } => source.api_kind(),
            _ => None,
        }
    }

    /// Operator-facing next action, when there is one.
    pub fn remedy(&self) -> Option<String> {
        match self {
            WardenError::Authentication { remedy, .. } => Some(remedy.clone()),
            WardenError::PermissionEscalation {
                permission,
                scope,
                grantor,
            } => Some(format!(
                "ask {grantor} to grant a role containing `{permission}` on `{}`",
                scope.resource
            )),
            WardenError::PolicyConflict { constraint, .. } => Some(format!(
                "ask an organization policy administrator to amend `{constraint}`"
            )),
            WardenError::PropagationTimeout { .. } => {
                Some("re-run the command; completed steps are skipped".into())
            }
            WardenError::Step { source, .. } => source.remedy(),
            _ => None,
        }
    }
}

pub type WardenResult<T> = Result<T, WardenError>;
