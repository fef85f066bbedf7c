use thiserror::Error;

use crate::uri::ObjectId;

/// Main error type for LwM2M engine operations
#[derive(Error, Debug, Clone, PartialEq)]
pub enum Lwm2mError {
    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Method not allowed: {0}")]
    MethodNotAllowed(String),

    #[error("Bad request: {0}")]
    BadRequest(String),

    #[error("Precondition failed: {0}")]
    PreconditionFailed(String),

    #[error("Conflict: {0}")]
    Conflict(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Object /{0} is already registered")]
    DuplicateObject(ObjectId),

    #[error("Already exists: {0}")]
    AlreadyExists(String),

    #[error("Invalid resource descriptor: {0}")]
    InvalidDescriptor(String),

    #[error("Transport error: {0}")]
    Transport(String),

    #[error("Timeout")]
    Timeout,
}

/// Result type alias for LwM2M engine operations
pub type Lwm2mResult<T> = Result<T, Lwm2mError>;

impl Lwm2mError {
    /// Shorthand for a `NotFound` error on a path
    pub fn not_found(what: impl std::fmt::Display) -> Self {
        Lwm2mError::NotFound(what.to_string())
    }

    /// Shorthand for a `MethodNotAllowed` error on a path
    pub fn not_allowed(what: impl std::fmt::Display) -> Self {
        Lwm2mError::MethodNotAllowed(what.to_string())
    }

    /// Shorthand for a `BadRequest` error
    pub fn bad_request(what: impl std::fmt::Display) -> Self {
        Lwm2mError::BadRequest(what.to_string())
    }
}
