use axum::{Json, http::StatusCode, response::IntoResponse};
use lapor_domain::error::{AccessDenial, DomainError};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("authentication required")]
    AuthRequired,
    #[error("not allowed to stream this channel")]
    ForbiddenStream,
    #[error("not a member of this room")]
    NotRoomMember,
    #[error("not allowed to write this record")]
    ForbiddenWrite,
    #[error("invalid catchup cursor")]
    InvalidCursor,
    #[error("not found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("transaction failed, try again")]
    TransactionFailed,
    #[error("internal error")]
    Internal,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) | ApiError::InvalidCursor => StatusCode::BAD_REQUEST,
            ApiError::AuthRequired => StatusCode::UNAUTHORIZED,
            ApiError::ForbiddenStream | ApiError::NotRoomMember | ApiError::ForbiddenWrite => {
                StatusCode::FORBIDDEN
            }
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::Conflict => StatusCode::CONFLICT,
            ApiError::TransactionFailed => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "VALIDATION_ERROR",
            ApiError::AuthRequired => "AUTH_REQUIRED",
            ApiError::ForbiddenStream => "FORBIDDEN_STREAM",
            ApiError::NotRoomMember => "NOT_ROOM_MEMBER",
            ApiError::ForbiddenWrite => "FORBIDDEN_WRITE",
            ApiError::InvalidCursor => "INVALID_CURSOR",
            ApiError::NotFound => "NOT_FOUND",
            ApiError::Conflict => "CONFLICT",
            ApiError::TransactionFailed => "TRANSACTION_FAILED",
            ApiError::Internal => "INTERNAL_ERROR",
        }
    }
}

impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(message) => ApiError::Validation(message),
            DomainError::NotFound => ApiError::NotFound,
            DomainError::Conflict => ApiError::Conflict,
            DomainError::AuthenticationRequired => ApiError::AuthRequired,
            DomainError::AuthorizationDenied(AccessDenial::ForbiddenStream) => {
                ApiError::ForbiddenStream
            }
            DomainError::AuthorizationDenied(AccessDenial::NotRoomMember) => ApiError::NotRoomMember,
            DomainError::AuthorizationDenied(AccessDenial::ForbiddenWrite) => {
                ApiError::ForbiddenWrite
            }
            DomainError::InvalidCursor => ApiError::InvalidCursor,
            DomainError::TransactionFailed(reason) => {
                tracing::warn!(reason = %reason, "mutation transaction failed");
                ApiError::TransactionFailed
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let message = self.to_string();
        let body = ErrorEnvelope {
            error: ErrorBody {
                code: self.error_code(),
                message,
            },
        };
        (status, Json(body)).into_response()
    }
}
