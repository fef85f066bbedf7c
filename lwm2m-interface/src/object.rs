//! Object callback contract and object definitions

use std::any::Any;

use lwm2m_core::{
    InstanceId, Lwm2mError, Lwm2mResult, ObjectId, Operation, ResourceDescriptor, ResourceId,
    ResourceInstanceId, ResourceRecord, Timestamp, ID_INVALID,
};

use crate::context::ObjectContext;

/// Instance id of single-instance objects
pub const SINGLE_INSTANCE_ID: InstanceId = 0;

/// Instance multiplicity of an object
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Multiplicity {
    Single,
    Multiple,
}

/// Static shape of a registered object
#[derive(Debug, Clone, PartialEq)]
pub struct ObjectDefinition {
    pub id: ObjectId,
    pub multiplicity: Multiplicity,
    pub resources: Vec<ResourceDescriptor>,
}

impl ObjectDefinition {
    pub fn new(id: ObjectId, multiplicity: Multiplicity) -> Self {
        Self {
            id,
            multiplicity,
            resources: Vec::new(),
        }
    }

    pub fn with_resource(mut self, descriptor: ResourceDescriptor) -> Self {
        self.resources.push(descriptor);
        self
    }

    pub fn with_resources(mut self, descriptors: impl IntoIterator<Item = ResourceDescriptor>) -> Self {
        self.resources.extend(descriptors);
        self
    }

    pub fn resource(&self, id: ResourceId) -> Option<&ResourceDescriptor> {
        self.resources.iter().find(|r| r.id == id)
    }

    pub fn is_single(&self) -> bool {
        self.multiplicity == Multiplicity::Single
    }

    /// Check an instance id against the multiplicity
    pub fn check_instance_id(&self, instance: InstanceId) -> Lwm2mResult<()> {
        if instance == ID_INVALID {
            return Err(Lwm2mError::bad_request(format!(
                "instance id {} is reserved",
                instance
            )));
        }
        if self.is_single() && instance != SINGLE_INSTANCE_ID {
            return Err(Lwm2mError::MethodNotAllowed(format!(
                "object /{} is single-instance",
                self.id
            )));
        }
        Ok(())
    }

    /// Reject repeated resource ids and invalid descriptors
    pub fn validate(&self) -> Lwm2mResult<()> {
        if self.id == ID_INVALID {
            return Err(Lwm2mError::InvalidDescriptor(format!(
                "object id {} is reserved",
                self.id
            )));
        }
        for (index, descriptor) in self.resources.iter().enumerate() {
            if descriptor.id == ID_INVALID {
                return Err(Lwm2mError::InvalidDescriptor(format!(
                    "resource id {} is reserved",
                    descriptor.id
                )));
            }
            descriptor.validate()?;
            if self.resources[..index].iter().any(|r| r.id == descriptor.id) {
                return Err(Lwm2mError::InvalidDescriptor(format!(
                    "resource /{}/x/{} declared twice",
                    self.id, descriptor.id
                )));
            }
        }
        Ok(())
    }
}

/// Callback contract of a registered object
///
/// The dispatcher validates every target before calling into the object, so
/// `handle` only ever sees records for resources the definition declares with
/// an operation they permit. Observe and Notify reach `handle` as `Read`.
///
/// Per-record failures are reported through `ResourceRecord::status`;
/// returning `Err` fails every record of the group that has not failed on
/// its own.
pub trait Lwm2mObject: Any + Send {
    /// Serve one group of records belonging to `instance`
    fn handle(
        &mut self,
        ctx: &mut ObjectContext,
        op: Operation,
        instance: InstanceId,
        records: &mut [ResourceRecord],
    ) -> Lwm2mResult<()>;

    /// Release whatever a Write or Execute group still holds
    ///
    /// Called exactly once per group after `handle`, whatever its outcome.
    fn release(&mut self, _instance: InstanceId, _records: &mut [ResourceRecord]) {}

    /// Create object-specific state for a new instance
    fn create_instance(&mut self, _ctx: &mut ObjectContext, instance: InstanceId) -> Lwm2mResult<()> {
        Err(Lwm2mError::not_allowed(format!("create of instance {}", instance)))
    }

    /// Drop object-specific state of an instance
    fn delete_instance(&mut self, _ctx: &mut ObjectContext, instance: InstanceId) -> Lwm2mResult<()> {
        Err(Lwm2mError::not_allowed(format!("delete of instance {}", instance)))
    }

    /// Bring up state for an instance the registry adds directly
    ///
    /// Runs for the initial instances of `add_object` and for `add_instance`.
    /// No change markers are raised. State already held for `instance` is
    /// kept as it is.
    fn attach_instance(&mut self, _instance: InstanceId, _now: Timestamp) -> Lwm2mResult<()> {
        Ok(())
    }

    /// Drop the state of an instance the registry removes directly
    fn detach_instance(&mut self, _instance: InstanceId) {}

    /// Resource instance ids of a multi-instance resource
    fn resource_instances(
        &mut self,
        _instance: InstanceId,
        _resource: ResourceId,
    ) -> Lwm2mResult<Vec<ResourceInstanceId>> {
        Ok(Vec::new())
    }

    fn as_any(&self) -> &dyn Any;

    fn as_any_mut(&mut self) -> &mut dyn Any;
}
