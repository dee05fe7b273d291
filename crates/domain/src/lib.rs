pub mod auth;
pub mod error;
pub mod identity;
pub mod ports;
pub mod realtime;
pub mod reports;
pub mod rooms;
pub mod store;
pub mod util;

pub type DomainResult<T> = Result<T, error::DomainError>;
