//! Resource value records

use serde::{Deserialize, Serialize};

use crate::datatypes::value::Value;
use crate::status::Status;
use crate::time::Timestamp;
use crate::uri::{InstanceId, ObjectId, ResourceId, ResourceInstanceId, Uri};

/// Payload unit for read results, write inputs and notification content
///
/// The `status` field carries the per-record outcome: callbacks leave it at
/// `NoError` on success and set it to report a failure for this record only.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub object: ObjectId,
    pub instance: InstanceId,
    pub resource: ResourceId,
    pub resource_instance: Option<ResourceInstanceId>,
    pub value: Value,
    pub timestamp: Option<Timestamp>,
    pub status: Status,
}

impl ResourceRecord {
    /// Create an empty record addressing a resource, for read-like operations
    pub fn target(object: ObjectId, instance: InstanceId, resource: ResourceId) -> Self {
        Self {
            object,
            instance,
            resource,
            resource_instance: None,
            value: Value::None,
            timestamp: None,
            status: Status::NoError,
        }
    }

    /// Create a record carrying a value, for write-like operations
    pub fn with_value(
        object: ObjectId,
        instance: InstanceId,
        resource: ResourceId,
        value: Value,
    ) -> Self {
        Self {
            value,
            ..Self::target(object, instance, resource)
        }
    }

    /// Address a specific resource instance
    pub fn at(mut self, resource_instance: ResourceInstanceId) -> Self {
        self.resource_instance = Some(resource_instance);
        self
    }

    /// Path this record addresses
    pub fn uri(&self) -> Uri {
        Uri {
            object: self.object,
            instance: Some(self.instance),
            resource: Some(self.resource),
            resource_instance: self.resource_instance,
        }
    }

    /// Populate the value of a read target
    pub fn set(&mut self, value: Value) {
        self.value = value;
        self.status = Status::NoError;
    }

    /// Mark this record as failed, dropping any value it carried
    pub fn fail(&mut self, status: Status) {
        self.value = Value::None;
        self.status = status;
    }

    pub fn is_ok(&self) -> bool {
        self.status.is_success()
    }
}
