//! Callback context
//!
//! Object callbacks run while the engine lock is held, so they never call
//! back into the engine. Everything a callback wants the engine to do
//! afterwards is queued here and applied once the callback returns.

use lwm2m_core::{Event, InstanceId, ObjectId, ResourceId, ShortServerId, Timestamp, Uri};

/// What a change marker records
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ChangeKind {
    ResourceChanged,
    InstanceCreated,
    InstanceDeleted,
}

/// Entry of the pending notification set
///
/// `None` components stand for "all": a marker without an instance covers
/// the whole object, a marker without a resource the whole instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ChangeMarker {
    pub object: ObjectId,
    pub instance: Option<InstanceId>,
    pub resource: Option<ResourceId>,
    pub kind: ChangeKind,
}

impl ChangeMarker {
    pub fn resource(object: ObjectId, instance: Option<InstanceId>, resource: Option<ResourceId>) -> Self {
        Self {
            object,
            instance,
            resource,
            kind: ChangeKind::ResourceChanged,
        }
    }

    pub fn instance_created(object: ObjectId, instance: InstanceId) -> Self {
        Self {
            object,
            instance: Some(instance),
            resource: None,
            kind: ChangeKind::InstanceCreated,
        }
    }

    pub fn instance_deleted(object: ObjectId, instance: InstanceId) -> Self {
        Self {
            object,
            instance: Some(instance),
            resource: None,
            kind: ChangeKind::InstanceDeleted,
        }
    }

    /// Whether the set of instances changed, as opposed to a value
    pub fn is_structural(&self) -> bool {
        self.kind != ChangeKind::ResourceChanged
    }

    /// Path covered by this marker
    pub fn uri(&self) -> Uri {
        Uri {
            object: self.object,
            instance: self.instance,
            resource: self.instance.and(self.resource),
            resource_instance: None,
        }
    }
}

/// Engine action requested by a callback
#[derive(Debug, Clone, PartialEq)]
pub enum SideEffect {
    /// Deliver an event to the application
    Event(Event),
    /// Schedule a registration update for one server, or all when `None`
    RegistrationUpdate(Option<ShortServerId>),
    /// Fall back to bootstrap for the server
    BootstrapRequest(ShortServerId),
    /// Deregister from the server and stay away for `timeout` seconds
    ServerDisable { server: ShortServerId, timeout: u64 },
}

/// Context handed to every object callback
#[derive(Debug)]
pub struct ObjectContext {
    now: Timestamp,
    object: ObjectId,
    changes: Vec<ChangeMarker>,
    effects: Vec<SideEffect>,
}

impl ObjectContext {
    pub fn new(now: Timestamp, object: ObjectId) -> Self {
        Self {
            now,
            object,
            changes: Vec::new(),
            effects: Vec::new(),
        }
    }

    /// Current time in the engine's monotonic clock domain
    pub fn now(&self) -> Timestamp {
        self.now
    }

    /// Object the callback was invoked for
    pub fn object(&self) -> ObjectId {
        self.object
    }

    /// Mark a resource of the current object as changed
    pub fn resource_changed(&mut self, instance: InstanceId, resource: ResourceId) {
        self.changes
            .push(ChangeMarker::resource(self.object, Some(instance), Some(resource)));
    }

    /// Mark every resource of an instance as changed
    pub fn instance_changed(&mut self, instance: InstanceId) {
        self.changes
            .push(ChangeMarker::resource(self.object, Some(instance), None));
    }

    pub fn instance_created(&mut self, instance: InstanceId) {
        self.changes
            .push(ChangeMarker::instance_created(self.object, instance));
    }

    pub fn instance_deleted(&mut self, instance: InstanceId) {
        self.changes
            .push(ChangeMarker::instance_deleted(self.object, instance));
    }

    pub fn emit(&mut self, event: Event) {
        self.effects.push(SideEffect::Event(event));
    }

    pub fn request_update(&mut self, server: Option<ShortServerId>) {
        self.effects.push(SideEffect::RegistrationUpdate(server));
    }

    pub fn request_bootstrap(&mut self, server: ShortServerId) {
        self.effects.push(SideEffect::BootstrapRequest(server));
    }

    pub fn disable_server(&mut self, server: ShortServerId, timeout: u64) {
        self.effects.push(SideEffect::ServerDisable { server, timeout });
    }

    pub fn changes(&self) -> &[ChangeMarker] {
        &self.changes
    }

    pub fn effects(&self) -> &[SideEffect] {
        &self.effects
    }

    /// Drain everything queued so far
    pub fn take(&mut self) -> (Vec<ChangeMarker>, Vec<SideEffect>) {
        (
            std::mem::take(&mut self.changes),
            std::mem::take(&mut self.effects),
        )
    }
}
