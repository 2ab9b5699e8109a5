//! Error taxonomy for the administration core.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use thiserror::Error;

use crate::audit_trail::AuditStoreError;
use crate::executor::ExecutorError;
use crate::topology::TopologyError;

/// Result type alias for administration operations.
pub type AdminResult<T> = Result<T, AdminError>;

/// Every failure the core reports to a caller.
#[derive(Debug, Error)]
pub enum AdminError {
    /// No bearer token and no hash parameter on a protected path.
    #[error("no credential provided")]
    MissingCredential,

    /// The `hash` query parameter did not resolve to an issued token.
    #[error("credential hash does not match an issued token")]
    InvalidCredentialHash,

    /// The token was found but failed validation.
    #[error("invalid credential: {reason}")]
    InvalidCredential { reason: String },

    /// A pool spec violated a structural invariant.
    #[error("topology error: {0}")]
    Topology(#[from] TopologyError),

    /// Malformed request payload outside the topology rules.
    #[error("invalid request: {reason}")]
    InvalidRequest { reason: String },

    #[error("pool {name} not found")]
    PoolNotFound { name: String },

    #[error("device {device} is not a member of pool {pool}")]
    DeviceNotInPool { pool: String, device: String },

    #[error("device {device} is already in use by pool {pool}")]
    DeviceAlreadyInUse { device: String, pool: String },

    /// The executor reported a failure.
    #[error("executor error: {0}")]
    Executor(#[from] ExecutorError),

    /// The attach/detach step of a device replacement failed.
    #[error("replace failed on pool {pool}: {cause}")]
    ReplaceFailed { pool: String, cause: ExecutorError },

    /// The audit record for an operation could not be persisted.
    #[error("audit write failed: {0}")]
    AuditWrite(#[from] AuditStoreError),

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl AdminError {
    /// Stable machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            AdminError::MissingCredential => "missing_credential",
            AdminError::InvalidCredentialHash => "invalid_credential_hash",
            AdminError::InvalidCredential { .. } => "invalid_credential",
            AdminError::Topology(_) => "topology_error",
            AdminError::InvalidRequest { .. } => "invalid_request",
            AdminError::PoolNotFound { .. } => "pool_not_found",
            AdminError::DeviceNotInPool { .. } => "device_not_in_pool",
            AdminError::DeviceAlreadyInUse { .. } => "device_already_in_use",
            AdminError::Executor(_) => "executor_error",
            AdminError::ReplaceFailed { .. } => "replace_failed",
            AdminError::AuditWrite(_) => "audit_write_failed",
            AdminError::NotFound { .. } => "not_found",
            AdminError::Internal { .. } => "internal_error",
        }
    }

    /// HTTP status class for this error.
    pub fn status_code(&self) -> StatusCode {
        match self {
            AdminError::MissingCredential
            | AdminError::InvalidCredentialHash
            | AdminError::InvalidCredential { .. } => StatusCode::UNAUTHORIZED,
            AdminError::Topology(_)
            | AdminError::InvalidRequest { .. }
            | AdminError::DeviceNotInPool { .. } => StatusCode::BAD_REQUEST,
            AdminError::DeviceAlreadyInUse { .. } => StatusCode::CONFLICT,
            AdminError::PoolNotFound { .. } | AdminError::NotFound { .. } => StatusCode::NOT_FOUND,
            AdminError::Executor(_) | AdminError::ReplaceFailed { .. } => StatusCode::BAD_GATEWAY,
            AdminError::AuditWrite(_) | AdminError::Internal { .. } => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }

    pub fn is_auth(&self) -> bool {
        self.status_code() == StatusCode::UNAUTHORIZED
    }
}

impl IntoResponse for AdminError {
    fn into_response(self) -> Response {
        let status = self.status_code();
        let mut body = serde_json::json!({
            "status": "error",
            "error": self.code(),
            "message": self.to_string(),
        });
        if let AdminError::Topology(ref reason) = self {
            if let Ok(detail) = serde_json::to_value(reason) {
                body["detail"] = detail;
            }
        }
        (status, Json(body)).into_response()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auth_errors_are_401() {
        assert_eq!(AdminError::MissingCredential.status_code(), StatusCode::UNAUTHORIZED);
        assert_eq!(AdminError::InvalidCredentialHash.status_code(), StatusCode::UNAUTHORIZED);
        let err = AdminError::InvalidCredential {
            reason: "expired".into(),
        };
        assert_eq!(err.status_code(), StatusCode::UNAUTHORIZED);
        assert!(err.is_auth());
    }

    #[test]
    fn test_validation_errors_are_400() {
        let err = AdminError::from(TopologyError::EmptyVdevList);
        assert_eq!(err.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(err.code(), "topology_error");
    }

    #[test]
    fn test_pool_not_found_is_404() {
        let err = AdminError::PoolNotFound { name: "tank".into() };
        assert_eq!(err.status_code(), StatusCode::NOT_FOUND);
        assert_eq!(format!("{}", err), "pool tank not found");
    }

    #[test]
    fn test_replace_failed_message_carries_cause() {
        let err = AdminError::ReplaceFailed {
            pool: "tank".into(),
            cause: ExecutorError::Rejected("device busy".into()),
        };
        let msg = format!("{}", err);
        assert!(msg.contains("tank"));
        assert!(msg.contains("device busy"));
        assert_eq!(err.code(), "replace_failed");
    }

    #[tokio::test]
    async fn test_error_response_envelope() {
        let response = AdminError::from(TopologyError::DuplicateName { name: "tank".into() })
            .into_response();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        let body = axum::body::to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let json: serde_json::Value = serde_json::from_slice(&body).unwrap();
        assert_eq!(json["status"], "error");
        assert_eq!(json["error"], "topology_error");
        assert_eq!(json["detail"]["kind"], "duplicate_name");
    }
}
