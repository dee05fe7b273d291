use validator::Validate;

use crate::error::ApiError;

pub fn validate<T: Validate>(value: &T) -> Result<(), ApiError> {
    value
        .validate()
        .map_err(|err| ApiError::Validation(err.to_string()))?;
    Ok(())
}

/// Trims an optional client tag, treating blank as absent.
pub fn optional_tag(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}
