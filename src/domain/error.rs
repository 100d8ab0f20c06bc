use thiserror::Error;

/// Errors raised by domain validation before any store access happens.
#[derive(Debug, Error)]
pub enum DomainError {
    #[error("validation failed for `{field}`: {reason}")]
    Validation { field: &'static str, reason: String },
    #[error("domain invariant violated: {message}")]
    Invariant { message: String },
}

impl DomainError {
    pub fn validation(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Validation {
            field,
            reason: reason.into(),
        }
    }

    pub fn invariant(message: impl Into<String>) -> Self {
        Self::Invariant {
            message: message.into(),
        }
    }
}
