use axum::http::StatusCode;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("malformed envelope: {0}")]
    MalformedEnvelope(String),
    #[error("unknown identity")]
    UnknownIdentity,
    #[error("not found")]
    NotFound,
    #[error("approval token invalid")]
    TokenInvalid,
    #[error("approval token expired")]
    TokenExpired,
    #[error("approver must hold the admin role")]
    NotAdmin,
    #[error("requester may not approve their own request")]
    SelfApproval,
    #[error("tool execution timed out")]
    Timeout,
    #[error("database connection pool exhausted")]
    PoolExhausted,
    #[error("database error: {0}")]
    Db(String),
    #[error("audit write failed: {0}")]
    AuditWriteFailed(String),
    #[error("policy bundle invalid: {0}")]
    BundleInvalid(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl ServiceError {
    pub fn status_code(&self) -> StatusCode {
        match self {
            ServiceError::MalformedEnvelope(_) => StatusCode::BAD_REQUEST,
            ServiceError::UnknownIdentity => StatusCode::UNAUTHORIZED,
            ServiceError::NotFound => StatusCode::NOT_FOUND,
            ServiceError::TokenInvalid | ServiceError::TokenExpired => StatusCode::UNAUTHORIZED,
            ServiceError::NotAdmin | ServiceError::SelfApproval => StatusCode::FORBIDDEN,
            ServiceError::Timeout => StatusCode::GATEWAY_TIMEOUT,
            ServiceError::BundleInvalid(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ServiceError::PoolExhausted
            | ServiceError::Db(_)
            | ServiceError::AuditWriteFailed(_)
            | ServiceError::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Stable error kind recorded in audit entries and error payloads.
    pub fn kind(&self) -> &'static str {
        match self {
            ServiceError::MalformedEnvelope(_) => "envelope.malformed",
            ServiceError::UnknownIdentity => "identity.unknown",
            ServiceError::NotFound => "not_found",
            ServiceError::TokenInvalid => "approval.token_invalid",
            ServiceError::TokenExpired => "approval.token_expired",
            ServiceError::NotAdmin => "approval.not_admin",
            ServiceError::SelfApproval => "approval.self_approval",
            ServiceError::Timeout => "executor.timeout",
            ServiceError::PoolExhausted => "executor.pool_exhausted",
            ServiceError::Db(_) => "executor.db_error",
            ServiceError::AuditWriteFailed(_) => "audit.write_failed",
            ServiceError::BundleInvalid(_) => "policy.bundle_invalid",
            ServiceError::Internal(_) => "internal",
        }
    }
}
