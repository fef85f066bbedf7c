//! Resource descriptors
//!
//! A descriptor declares what a resource is: its identifier, value type,
//! permitted operations and flags. Descriptors are fixed once the owning
//! object definition is registered.

use serde::{Deserialize, Serialize};

use crate::datatypes::value::ValueType;
use crate::error::{Lwm2mError, Lwm2mResult};
use crate::status::Operation;
use crate::uri::ResourceId;

/// Operations permitted on a resource
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ResourceOperations {
    /// No access
    NoAccess = 0,
    /// Read only
    ReadOnly = 1,
    /// Write only
    WriteOnly = 2,
    /// Read and write
    ReadWrite = 3,
    /// Execute
    Execute = 4,
}

impl ResourceOperations {
    /// Create from mode value
    pub fn from_value(value: u8) -> Lwm2mResult<Self> {
        match value {
            0 => Ok(ResourceOperations::NoAccess),
            1 => Ok(ResourceOperations::ReadOnly),
            2 => Ok(ResourceOperations::WriteOnly),
            3 => Ok(ResourceOperations::ReadWrite),
            4 => Ok(ResourceOperations::Execute),
            _ => Err(Lwm2mError::InvalidDescriptor(format!(
                "Invalid operation mask: {}",
                value
            ))),
        }
    }

    /// Get the mode value
    pub fn value(&self) -> u8 {
        *self as u8
    }

    /// Check if read is allowed
    pub fn can_read(&self) -> bool {
        matches!(self, ResourceOperations::ReadOnly | ResourceOperations::ReadWrite)
    }

    /// Check if write is allowed
    pub fn can_write(&self) -> bool {
        matches!(self, ResourceOperations::WriteOnly | ResourceOperations::ReadWrite)
    }

    /// Check if execute is allowed
    pub fn can_execute(&self) -> bool {
        matches!(self, ResourceOperations::Execute)
    }

    /// Check whether `op` may target a resource with these permissions
    ///
    /// Create may seed any resource that holds a value, read-only ones
    /// included. Discover and attribute writes never touch values and are
    /// always permitted.
    pub fn permits(&self, op: Operation) -> bool {
        match op {
            Operation::Read | Operation::Observe | Operation::Notify => self.can_read(),
            Operation::Write => self.can_write(),
            Operation::Create => self.can_read() || self.can_write(),
            Operation::Execute => self.can_execute(),
            Operation::Discover
            | Operation::WriteAttributes
            | Operation::CancelObserve
            | Operation::Delete => true,
        }
    }
}

/// Resource flags
///
/// A resource that is not `mandatory` is optional.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub struct ResourceFlags {
    pub mandatory: bool,
    pub multiple: bool,
    pub asynchronous: bool,
    pub streamable: bool,
}

impl ResourceFlags {
    pub const OPTIONAL: Self = Self {
        mandatory: false,
        multiple: false,
        asynchronous: false,
        streamable: false,
    };

    pub const MANDATORY: Self = Self {
        mandatory: true,
        ..Self::OPTIONAL
    };

    /// Same flags, marked multi-instance
    pub const fn multiple(mut self) -> Self {
        self.multiple = true;
        self
    }

    pub const fn asynchronous(mut self) -> Self {
        self.asynchronous = true;
        self
    }

    pub const fn streamable(mut self) -> Self {
        self.streamable = true;
        self
    }

    pub fn is_optional(&self) -> bool {
        !self.mandatory
    }
}

/// Resource descriptor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceDescriptor {
    pub id: ResourceId,
    pub value_type: ValueType,
    pub operations: ResourceOperations,
    pub flags: ResourceFlags,
}

impl ResourceDescriptor {
    pub const fn new(
        id: ResourceId,
        value_type: ValueType,
        operations: ResourceOperations,
        flags: ResourceFlags,
    ) -> Self {
        Self {
            id,
            value_type,
            operations,
            flags,
        }
    }

    /// Read-only resource
    pub const fn read_only(id: ResourceId, value_type: ValueType, flags: ResourceFlags) -> Self {
        Self::new(id, value_type, ResourceOperations::ReadOnly, flags)
    }

    /// Readable and writable resource
    pub const fn read_write(id: ResourceId, value_type: ValueType, flags: ResourceFlags) -> Self {
        Self::new(id, value_type, ResourceOperations::ReadWrite, flags)
    }

    /// Executable resource
    pub const fn executable(id: ResourceId, flags: ResourceFlags) -> Self {
        Self::new(id, ValueType::None, ResourceOperations::Execute, flags)
    }

    /// Reject type/operation combinations the dispatcher cannot serve
    pub fn validate(&self) -> Lwm2mResult<()> {
        let executable = self.operations.can_execute();
        if executable && self.value_type != ValueType::None {
            return Err(Lwm2mError::InvalidDescriptor(format!(
                "executable resource {} declares value type {}",
                self.id, self.value_type
            )));
        }
        if !executable && self.value_type == ValueType::None {
            return Err(Lwm2mError::InvalidDescriptor(format!(
                "resource {} has no value type",
                self.id
            )));
        }
        if executable && self.flags.multiple {
            return Err(Lwm2mError::InvalidDescriptor(format!(
                "executable resource {} cannot be multi-instance",
                self.id
            )));
        }
        if self.flags.streamable
            && !matches!(self.value_type, ValueType::Opaque | ValueType::String)
        {
            return Err(Lwm2mError::InvalidDescriptor(format!(
                "resource {} of type {} cannot be streamed",
                self.id, self.value_type
            )));
        }
        Ok(())
    }
}
