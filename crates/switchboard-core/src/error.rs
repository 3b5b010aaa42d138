//! Error taxonomy shared by every coordination component.

use thiserror::Error;

use crate::store::StoreError;

#[derive(Error, Debug)]
pub enum CoreError {
    #[error("Not found: {0}")]
    NotFound(String),

    /// The operation raced with, or is blocked by, another actor's claim.
    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("Storage error: {0}")]
    Store(#[from] StoreError),

    #[error("Agent error: {0}")]
    Agent(String),
}

impl CoreError {
    pub fn not_found(what: &str, id: impl std::fmt::Display) -> Self {
        Self::NotFound(format!("{what} {id}"))
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Self::Conflict(_))
    }
}

pub type CoreResult<T> = Result<T, CoreError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn not_found_displays_kind_and_id() {
        let error = CoreError::not_found("session", "abc-123");
        assert_eq!(error.to_string(), "Not found: session abc-123");
        assert!(error.is_not_found());
        assert!(!error.is_conflict());
    }

    #[test]
    fn conflict_displays_message() {
        let error = CoreError::Conflict("already under remote control".to_string());
        assert!(error.to_string().contains("already under remote control"));
        assert!(error.is_conflict());
    }

    #[test]
    fn store_error_converts() {
        let io = std::io::Error::new(std::io::ErrorKind::Other, "disk full");
        let error: CoreError = StoreError::from(io).into();
        assert!(matches!(error, CoreError::Store(_)));
        assert!(error.to_string().contains("disk full"));
    }
}
