//! Protocol status codes and operation kinds
//!
//! `Status` is what travels end-to-end from an object callback back to the
//! transport layer. Domain errors are translated exactly once, through
//! `From<&Lwm2mError>`; the numeric CoAP code depends on the operation that
//! produced the status.

use crate::error::Lwm2mError;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Operations the dispatcher can route to an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Operation {
    Read,
    Write,
    Execute,
    Create,
    Delete,
    Discover,
    WriteAttributes,
    Observe,
    CancelObserve,
    Notify,
}

impl Operation {
    /// Whether the dispatcher runs the terminal release pass for this operation
    pub fn needs_release(&self) -> bool {
        matches!(self, Operation::Write | Operation::Create | Operation::Execute)
    }

    /// Whether the operation reads values out of the object
    pub fn is_read_like(&self) -> bool {
        matches!(self, Operation::Read | Operation::Observe | Operation::Notify)
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Operation::Read => "Read",
            Operation::Write => "Write",
            Operation::Execute => "Execute",
            Operation::Create => "Create",
            Operation::Delete => "Delete",
            Operation::Discover => "Discover",
            Operation::WriteAttributes => "WriteAttributes",
            Operation::Observe => "Observe",
            Operation::CancelObserve => "CancelObserve",
            Operation::Notify => "Notify",
        };
        write!(f, "{}", name)
    }
}

/// Protocol status of an operation or of a single record
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum Status {
    /// Success
    #[default]
    NoError,
    /// Unknown object, instance or resource
    NotFound,
    /// Operation not permitted on the target
    MethodNotAllowed,
    /// Malformed or out-of-range value
    BadRequest,
    /// Operation requires configuration that is absent
    PreconditionFailed,
    /// Duplicate state
    Conflict,
    /// Allocation, clock or collaborator failure
    InternalError,
}

impl Status {
    /// Check if the status is a success
    pub fn is_success(&self) -> bool {
        matches!(self, Status::NoError)
    }

    /// CoAP code (class << 5 | detail) for this status as a response to `op`
    pub fn coap_code(&self, op: Operation) -> u8 {
        const fn code(class: u8, detail: u8) -> u8 {
            (class << 5) | detail
        }
        match self {
            Status::NoError => match op {
                Operation::Create => code(2, 1),
                Operation::Delete => code(2, 2),
                Operation::Write | Operation::Execute | Operation::WriteAttributes => code(2, 4),
                _ => code(2, 5),
            },
            Status::BadRequest => code(4, 0),
            Status::NotFound => code(4, 4),
            Status::MethodNotAllowed => code(4, 5),
            Status::Conflict => code(4, 9),
            Status::PreconditionFailed => code(4, 12),
            Status::InternalError => code(5, 0),
        }
    }

    /// Turn a failure status back into a domain error carrying `detail`
    pub fn into_result(self, detail: impl fmt::Display) -> Result<(), Lwm2mError> {
        let detail = detail.to_string();
        match self {
            Status::NoError => Ok(()),
            Status::NotFound => Err(Lwm2mError::NotFound(detail)),
            Status::MethodNotAllowed => Err(Lwm2mError::MethodNotAllowed(detail)),
            Status::BadRequest => Err(Lwm2mError::BadRequest(detail)),
            Status::PreconditionFailed => Err(Lwm2mError::PreconditionFailed(detail)),
            Status::Conflict => Err(Lwm2mError::Conflict(detail)),
            Status::InternalError => Err(Lwm2mError::Internal(detail)),
        }
    }

    /// Dotted form of the CoAP code, e.g. "4.04"
    pub fn coap_string(&self, op: Operation) -> String {
        let code = self.coap_code(op);
        format!("{}.{:02}", code >> 5, code & 0x1F)
    }
}

impl From<&Lwm2mError> for Status {
    fn from(error: &Lwm2mError) -> Self {
        match error {
            Lwm2mError::NotFound(_) => Status::NotFound,
            Lwm2mError::MethodNotAllowed(_) => Status::MethodNotAllowed,
            Lwm2mError::BadRequest(_) | Lwm2mError::InvalidDescriptor(_) => Status::BadRequest,
            Lwm2mError::PreconditionFailed(_) => Status::PreconditionFailed,
            Lwm2mError::Conflict(_)
            | Lwm2mError::DuplicateObject(_)
            | Lwm2mError::AlreadyExists(_) => Status::Conflict,
            Lwm2mError::Internal(_) | Lwm2mError::Transport(_) | Lwm2mError::Timeout => {
                Status::InternalError
            }
        }
    }
}

impl From<Lwm2mError> for Status {
    fn from(error: Lwm2mError) -> Self {
        Status::from(&error)
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Status::NoError => "NoError",
            Status::NotFound => "NotFound",
            Status::MethodNotAllowed => "MethodNotAllowed",
            Status::BadRequest => "BadRequest",
            Status::PreconditionFailed => "PreconditionFailed",
            Status::Conflict => "Conflict",
            Status::InternalError => "InternalError",
        };
        write!(f, "{}", name)
    }
}
