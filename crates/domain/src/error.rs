use serde::Serialize;
use thiserror::Error;

use crate::ports::db::DbError;

/// Why an actor was refused access to a channel or a write.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum AccessDenial {
    ForbiddenStream,
    NotRoomMember,
    ForbiddenWrite,
}

impl AccessDenial {
    pub fn as_str(&self) -> &'static str {
        match self {
            AccessDenial::ForbiddenStream => "forbidden_stream",
            AccessDenial::NotRoomMember => "not_room_member",
            AccessDenial::ForbiddenWrite => "forbidden_write",
        }
    }
}

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found")]
    NotFound,
    #[error("conflict")]
    Conflict,
    #[error("authentication required")]
    AuthenticationRequired,
    #[error("access denied: {}", .0.as_str())]
    AuthorizationDenied(AccessDenial),
    #[error("transaction failed: {0}")]
    TransactionFailed(String),
    #[error("invalid catchup cursor")]
    InvalidCursor,
}

impl DomainError {
    pub fn is_authorization_denied(&self) -> bool {
        matches!(self, DomainError::AuthorizationDenied(_))
    }
}

impl From<DbError> for DomainError {
    fn from(err: DbError) -> Self {
        match err {
            DbError::NotFound { .. } => DomainError::NotFound,
            DbError::AlreadyExists { .. } | DbError::Conflict { .. } => DomainError::Conflict,
            DbError::PermissionDenied { .. } => {
                DomainError::AuthorizationDenied(AccessDenial::ForbiddenWrite)
            }
            DbError::Unavailable(reason) | DbError::Operation(reason) => {
                DomainError::TransactionFailed(reason)
            }
            DbError::Finished => DomainError::TransactionFailed(err.to_string()),
        }
    }
}
