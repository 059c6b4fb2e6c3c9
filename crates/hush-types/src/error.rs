use serde::{Deserialize, Serialize};

/// Stable error kinds returned to clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// No identity could be resolved for the caller
    Unauthorized,
    /// Identity resolved but lacks permission for this resource
    Forbidden,
    NotFound,
    /// Operation is not legal in the current state machine state
    InvalidState,
    /// Duplicate escalation or unmasking request
    AlreadyExists,
    ValidationError,
    Internal,
}

/// JSON body of every error response.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorBody {
    pub error: ErrorKind,
    pub message: String,
}
