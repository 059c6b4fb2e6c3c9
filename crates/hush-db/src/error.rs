use hush_types::error::ErrorKind;
use rusqlite::ErrorCode;
use thiserror::Error;

/// Typed outcome of a rejected protocol operation.
///
/// Business-rule rejections are ordinary values here, never panics. Only
/// `Storage` and `Internal` describe faults.
#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("forbidden: {0}")]
    Forbidden(&'static str),

    #[error("{0} not found")]
    NotFound(&'static str),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("{0} already exists")]
    AlreadyExists(&'static str),

    #[error("validation failed: {0}")]
    Validation(String),

    #[error("storage error: {0}")]
    Storage(#[from] rusqlite::Error),

    #[error(transparent)]
    Internal(#[from] anyhow::Error),
}

impl ProtocolError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            ProtocolError::Forbidden(_) => ErrorKind::Forbidden,
            ProtocolError::NotFound(_) => ErrorKind::NotFound,
            ProtocolError::InvalidState(_) => ErrorKind::InvalidState,
            ProtocolError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            ProtocolError::Validation(_) => ErrorKind::ValidationError,
            // A unique index caught a duplicate the checks above it did not
            ProtocolError::Storage(e) if is_unique_violation(e) => ErrorKind::AlreadyExists,
            ProtocolError::Storage(_) | ProtocolError::Internal(_) => ErrorKind::Internal,
        }
    }

    /// Storage and internal faults; everything else is a business rejection.
    pub fn is_fault(&self) -> bool {
        self.kind() == ErrorKind::Internal
    }
}

fn is_unique_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _)
            if e.code == ErrorCode::ConstraintViolation
                && e.extended_code == rusqlite::ffi::SQLITE_CONSTRAINT_UNIQUE
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn business_rejections_are_not_faults() {
        assert_eq!(ProtocolError::Forbidden("x").kind(), ErrorKind::Forbidden);
        assert_eq!(ProtocolError::AlreadyExists("x").kind(), ErrorKind::AlreadyExists);
        assert!(!ProtocolError::InvalidState("x".into()).is_fault());
        assert!(ProtocolError::Internal(anyhow::anyhow!("boom")).is_fault());
        assert!(ProtocolError::Storage(rusqlite::Error::QueryReturnedNoRows).is_fault());
    }
}
