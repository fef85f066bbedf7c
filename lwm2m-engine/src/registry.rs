//! Object registry
//!
//! Ordered collection of registered objects, each with the ids of its
//! instances. Instance state lives in the object handler; the registry
//! decides which instances exist and attaches or detaches the handler's
//! state as it adds and removes them.

use std::collections::{BTreeMap, BTreeSet};

use lwm2m_core::{InstanceId, Lwm2mError, Lwm2mResult, ObjectId, Timestamp};
use lwm2m_interface::{Lwm2mObject, ObjectDefinition};

/// One registered object
pub struct ObjectEntry {
    pub(crate) definition: ObjectDefinition,
    pub(crate) handler: Box<dyn Lwm2mObject>,
    pub(crate) instances: BTreeSet<InstanceId>,
}

impl std::fmt::Debug for ObjectEntry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ObjectEntry")
            .field("definition", &self.definition)
            .field("instances", &self.instances)
            .finish_non_exhaustive()
    }
}

impl ObjectEntry {
    pub fn definition(&self) -> &ObjectDefinition {
        &self.definition
    }

    pub fn instances(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.instances.iter().copied()
    }

    pub fn has_instance(&self, instance: InstanceId) -> bool {
        self.instances.contains(&instance)
    }

    pub(crate) fn require_instance(&self, instance: InstanceId) -> Lwm2mResult<()> {
        if !self.has_instance(instance) {
            return Err(Lwm2mError::not_found(format!(
                "/{}/{}",
                self.definition.id, instance
            )));
        }
        Ok(())
    }

    /// Validate a new instance id without inserting it
    pub(crate) fn check_new_instance(&self, instance: InstanceId) -> Lwm2mResult<()> {
        self.definition.check_instance_id(instance)?;
        if self.has_instance(instance) {
            return Err(Lwm2mError::AlreadyExists(format!(
                "/{}/{}",
                self.definition.id, instance
            )));
        }
        Ok(())
    }

    /// Lowest instance id not in use
    pub(crate) fn free_instance_id(&self) -> Lwm2mResult<InstanceId> {
        if self.definition.is_single() {
            return Err(Lwm2mError::MethodNotAllowed(format!(
                "object /{} is single-instance",
                self.definition.id
            )));
        }
        (0..InstanceId::MAX)
            .find(|iid| !self.instances.contains(iid))
            .ok_or_else(|| Lwm2mError::Internal(format!("object /{} is full", self.definition.id)))
    }

    pub fn handler(&self) -> &dyn Lwm2mObject {
        self.handler.as_ref()
    }
}

/// Registry of all objects known to the engine
#[derive(Debug, Default)]
pub struct ObjectRegistry {
    objects: BTreeMap<ObjectId, ObjectEntry>,
}

impl ObjectRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an object with its initial instances
    ///
    /// # Arguments
    /// * `definition` - Object id, multiplicity and resource descriptors
    /// * `handler` - Callback implementation, owning the instance state
    /// * `instances` - Instances that exist from the start
    /// * `now` - Current monotonic time, handed to `attach_instance`
    ///
    /// # Errors
    /// `DuplicateObject` if the id is taken, `InvalidDescriptor` for a bad
    /// definition, or the handler's attach error. Nothing is registered on
    /// error.
    pub fn add_object(
        &mut self,
        definition: ObjectDefinition,
        handler: Box<dyn Lwm2mObject>,
        instances: impl IntoIterator<Item = InstanceId>,
        now: Timestamp,
    ) -> Lwm2mResult<()> {
        if self.objects.contains_key(&definition.id) {
            return Err(Lwm2mError::DuplicateObject(definition.id));
        }
        definition.validate()?;

        let mut entry = ObjectEntry {
            definition,
            handler,
            instances: BTreeSet::new(),
        };
        for instance in instances {
            entry.check_new_instance(instance)?;
            entry.instances.insert(instance);
        }
        let ids: Vec<InstanceId> = entry.instances.iter().copied().collect();
        for (index, &instance) in ids.iter().enumerate() {
            if let Err(e) = entry.handler.attach_instance(instance, now) {
                for &attached in &ids[..index] {
                    entry.handler.detach_instance(attached);
                }
                return Err(e);
            }
        }
        log::debug!(
            "Registered object /{} with {} instance(s)",
            entry.definition.id,
            entry.instances.len()
        );
        self.objects.insert(entry.definition.id, entry);
        Ok(())
    }

    /// Unregister an object and all of its instances
    ///
    /// No callback runs; the removed entry is handed back to the caller.
    pub fn remove_object(&mut self, object: ObjectId) -> Lwm2mResult<ObjectEntry> {
        let entry = self
            .objects
            .remove(&object)
            .ok_or_else(|| Lwm2mError::not_found(format!("/{}", object)))?;
        log::debug!("Removed object /{}", object);
        Ok(entry)
    }

    pub fn add_instance(&mut self, object: ObjectId, instance: InstanceId, now: Timestamp) -> Lwm2mResult<()> {
        let entry = self.entry_mut(object)?;
        entry.check_new_instance(instance)?;
        entry.handler.attach_instance(instance, now)?;
        entry.instances.insert(instance);
        Ok(())
    }

    pub fn remove_instance(&mut self, object: ObjectId, instance: InstanceId) -> Lwm2mResult<()> {
        let entry = self.entry_mut(object)?;
        if !entry.instances.remove(&instance) {
            return Err(Lwm2mError::not_found(format!("/{}/{}", object, instance)));
        }
        entry.handler.detach_instance(instance);
        Ok(())
    }

    /// Look up an object, and optionally check one of its instances
    pub fn lookup(&self, object: ObjectId, instance: Option<InstanceId>) -> Lwm2mResult<&ObjectEntry> {
        let entry = self
            .objects
            .get(&object)
            .ok_or_else(|| Lwm2mError::not_found(format!("/{}", object)))?;
        if let Some(instance) = instance {
            entry.require_instance(instance)?;
        }
        Ok(entry)
    }

    pub(crate) fn entry_mut(&mut self, object: ObjectId) -> Lwm2mResult<&mut ObjectEntry> {
        self.objects
            .get_mut(&object)
            .ok_or_else(|| Lwm2mError::not_found(format!("/{}", object)))
    }

    pub fn contains(&self, object: ObjectId) -> bool {
        self.objects.contains_key(&object)
    }

    pub fn object_ids(&self) -> impl Iterator<Item = ObjectId> + '_ {
        self.objects.keys().copied()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    /// Typed access to an object handler
    pub fn handler<T: Lwm2mObject>(&self, object: ObjectId) -> Option<&T> {
        self.objects
            .get(&object)
            .and_then(|entry| entry.handler.as_any().downcast_ref::<T>())
    }

    pub fn handler_mut<T: Lwm2mObject>(&mut self, object: ObjectId) -> Option<&mut T> {
        self.objects
            .get_mut(&object)
            .and_then(|entry| entry.handler.as_any_mut().downcast_mut::<T>())
    }

    /// CoRE link list of objects and instances, as sent on Register/Update
    ///
    /// Objects without instances are listed by object path only.
    pub fn links(&self) -> String {
        let mut links = Vec::new();
        for (id, entry) in &self.objects {
            if entry.instances.is_empty() {
                links.push(format!("</{}>", id));
            } else {
                links.extend(entry.instances.iter().map(|iid| format!("</{}/{}>", id, iid)));
            }
        }
        links.join(",")
    }
}
