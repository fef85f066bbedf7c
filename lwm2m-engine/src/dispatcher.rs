//! Operation dispatcher
//!
//! Routes one request against the registry. Validation happens before any
//! object callback runs: unknown objects and instances fail the whole
//! request, a target the object does not declare (or declares without the
//! requested permission) fails only that target. Contiguous targets of the
//! same instance are served by a single callback invocation.
//!
//! Reads of a whole instance or object leave out optional resources whose
//! value is unset; reads naming their targets report them as `NotFound`.

use std::collections::BTreeSet;

use bytes::Bytes;

use lwm2m_core::{
    InstanceId, Lwm2mError, Lwm2mResult, ObjectId, Operation, ResourceDescriptor, ResourceId,
    ResourceRecord, Status, Uri, Value,
};
use lwm2m_interface::{ObjectContext, ObjectDefinition};

use crate::observe::NotificationAttributes;
use crate::registry::{ObjectEntry, ObjectRegistry};

/// A decoded management request
#[derive(Debug, Clone, PartialEq)]
pub struct Request {
    pub op: Operation,
    pub uri: Uri,
    /// Explicit targets or payload; empty means "everything under `uri`"
    pub records: Vec<ResourceRecord>,
    /// Only meaningful for Write-Attributes
    pub attributes: NotificationAttributes,
}

impl Request {
    pub fn new(op: Operation, uri: Uri) -> Self {
        Self {
            op,
            uri,
            records: Vec::new(),
            attributes: NotificationAttributes::default(),
        }
    }

    pub fn read(uri: Uri) -> Self {
        Self::new(Operation::Read, uri)
    }

    pub fn discover(uri: Uri) -> Self {
        Self::new(Operation::Discover, uri)
    }

    pub fn observe(uri: Uri) -> Self {
        Self::new(Operation::Observe, uri)
    }

    pub fn cancel_observe(uri: Uri) -> Self {
        Self::new(Operation::CancelObserve, uri)
    }

    pub fn write_attributes(uri: Uri, attributes: NotificationAttributes) -> Self {
        Self {
            attributes,
            ..Self::new(Operation::WriteAttributes, uri)
        }
    }

    /// Write several resources of one instance
    pub fn write(object: ObjectId, instance: InstanceId, records: Vec<ResourceRecord>) -> Self {
        Self {
            records,
            ..Self::new(Operation::Write, Uri::instance(object, instance))
        }
    }

    /// Write a single resource
    pub fn write_value(object: ObjectId, instance: InstanceId, resource: ResourceId, value: Value) -> Self {
        Self::write(
            object,
            instance,
            vec![ResourceRecord::with_value(object, instance, resource, value)],
        )
    }

    pub fn execute(
        object: ObjectId,
        instance: InstanceId,
        resource: ResourceId,
        argument: Option<Bytes>,
    ) -> Self {
        Self {
            records: vec![ResourceRecord::with_value(
                object,
                instance,
                resource,
                Value::Argument(argument),
            )],
            ..Self::new(Operation::Execute, Uri::resource(object, instance, resource))
        }
    }

    /// Create an instance, with an explicit id or the lowest free one
    pub fn create(object: ObjectId, instance: Option<InstanceId>, records: Vec<ResourceRecord>) -> Self {
        let uri = match instance {
            Some(instance) => Uri::instance(object, instance),
            None => Uri::object(object),
        };
        Self {
            records,
            ..Self::new(Operation::Create, uri)
        }
    }

    pub fn delete(object: ObjectId, instance: InstanceId) -> Self {
        Self::new(Operation::Delete, Uri::instance(object, instance))
    }
}

/// Outcome of a dispatched request
#[derive(Debug, Clone, PartialEq, Default)]
pub struct Response {
    /// First failure among the records, or the request-level failure
    pub status: Status,
    pub records: Vec<ResourceRecord>,
    /// Instance id assigned by a Create
    pub created: Option<InstanceId>,
}

impl Response {
    pub fn error(status: Status) -> Self {
        Self {
            status,
            ..Self::default()
        }
    }

    fn from_records(records: Vec<ResourceRecord>) -> Self {
        let status = records
            .iter()
            .map(|r| r.status)
            .find(|s| !s.is_success())
            .unwrap_or_default();
        Self {
            status,
            records,
            created: None,
        }
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    /// Value of the first successful record for `resource`
    pub fn value(&self, resource: ResourceId) -> Option<&Value> {
        self.records
            .iter()
            .find(|r| r.resource == resource && r.is_ok())
            .map(|r| &r.value)
    }

    /// Paths listed by a Discover
    pub fn links(&self) -> Vec<Uri> {
        self.records.iter().map(ResourceRecord::uri).collect()
    }
}

/// Route a request against the registry
///
/// Side effects requested by callbacks, and the change markers of
/// successful writes, creates and deletes, are queued on `ctx`.
pub fn dispatch(registry: &mut ObjectRegistry, ctx: &mut ObjectContext, request: &Request) -> Response {
    match route(registry, ctx, request) {
        Ok(response) => {
            if !response.is_success() {
                log::debug!("{} {}: {:?}", request.op, request.uri, response.status);
            }
            response
        }
        Err(e) => {
            log::debug!("{} {} rejected: {}", request.op, request.uri, e);
            Response::error(Status::from(&e))
        }
    }
}

fn route(registry: &mut ObjectRegistry, ctx: &mut ObjectContext, request: &Request) -> Lwm2mResult<Response> {
    let entry = registry.entry_mut(request.uri.object)?;
    match request.op {
        Operation::Create => create(entry, ctx, request),
        Operation::Delete => delete(entry, ctx, &request.uri),
        Operation::Discover => discover(entry, &request.uri),
        Operation::WriteAttributes | Operation::CancelObserve => {
            check_path(entry, &request.uri)?;
            Ok(Response::default())
        }
        Operation::Execute => execute(entry, ctx, request),
        Operation::Read | Operation::Observe | Operation::Notify | Operation::Write => {
            access(entry, ctx, request)
        }
    }
}

/// Check that the instance and resource named by `uri` exist
fn check_path(entry: &ObjectEntry, uri: &Uri) -> Lwm2mResult<()> {
    if let Some(instance) = uri.instance {
        entry.require_instance(instance)?;
    }
    if let Some(resource) = uri.resource {
        entry
            .definition
            .resource(resource)
            .ok_or_else(|| Lwm2mError::not_found(uri))?;
    }
    Ok(())
}

/// Per-target validation against the definition; failures are recorded on the target
fn validate_target(definition: &ObjectDefinition, op: Operation, record: &mut ResourceRecord) {
    let Some(descriptor) = definition.resource(record.resource) else {
        record.fail(Status::MethodNotAllowed);
        return;
    };
    if !descriptor.operations.permits(op) {
        record.fail(Status::MethodNotAllowed);
        return;
    }
    if record.resource_instance.is_some() && !descriptor.flags.multiple {
        record.fail(Status::BadRequest);
        return;
    }
    if matches!(op, Operation::Write | Operation::Create) && !record.value.fits(descriptor.value_type) {
        record.fail(Status::BadRequest);
    }
}

/// Expand a path into read targets
fn expand_targets(entry: &ObjectEntry, uri: &Uri, op: Operation) -> Vec<ResourceRecord> {
    let object = entry.definition.id;
    let instances: Vec<InstanceId> = match uri.instance {
        Some(instance) => vec![instance],
        None => entry.instances().collect(),
    };
    let mut targets = Vec::new();
    for instance in instances {
        match uri.resource {
            Some(resource) => {
                let mut target = ResourceRecord::target(object, instance, resource);
                target.resource_instance = uri.resource_instance;
                targets.push(target);
            }
            None => targets.extend(
                entry
                    .definition
                    .resources
                    .iter()
                    .filter(|d| d.operations.permits(op))
                    .map(|d| ResourceRecord::target(object, instance, d.id)),
            ),
        }
    }
    targets
}

fn access(entry: &mut ObjectEntry, ctx: &mut ObjectContext, request: &Request) -> Lwm2mResult<Response> {
    let op = request.op;
    let uri = &request.uri;
    if op == Operation::Write && uri.instance.is_none() {
        return Err(Lwm2mError::not_allowed(format!("{} on a whole object", op)));
    }
    if let Some(instance) = uri.instance {
        entry.require_instance(instance)?;
    }

    let expanded = request.records.is_empty();
    let mut targets = if expanded {
        expand_targets(entry, uri, op)
    } else {
        request.records.clone()
    };
    for target in &targets {
        if target.object != uri.object || uri.instance.is_some_and(|i| i != target.instance) {
            return Err(Lwm2mError::bad_request(format!(
                "{} outside of {}",
                target.uri(),
                uri
            )));
        }
        entry.require_instance(target.instance)?;
    }
    for target in targets.iter_mut() {
        target.status = Status::NoError;
        validate_target(&entry.definition, op, target);
    }

    let mut records = run_groups(entry, ctx, op, targets);
    if expanded && uri.resource.is_none() && op.is_read_like() {
        drop_absent(&mut records);
    }
    if op == Operation::Write {
        for record in records.iter().filter(|r| r.is_ok()) {
            ctx.resource_changed(record.instance, record.resource);
        }
    }
    Ok(Response::from_records(records))
}

/// Leave unset optional values out of a read expanded from a path
///
/// An instance none of whose records could be read keeps its failures.
fn drop_absent(records: &mut Vec<ResourceRecord>) {
    let readable: BTreeSet<InstanceId> = records
        .iter()
        .filter(|r| r.is_ok())
        .map(|r| r.instance)
        .collect();
    records.retain(|r| r.status != Status::NotFound || !readable.contains(&r.instance));
}

fn execute(entry: &mut ObjectEntry, ctx: &mut ObjectContext, request: &Request) -> Lwm2mResult<Response> {
    let uri = &request.uri;
    let (Some(instance), Some(resource)) = (uri.instance, uri.resource) else {
        return Err(Lwm2mError::not_allowed(format!("execute on {}", uri)));
    };
    entry.require_instance(instance)?;
    if request.records.len() > 1 {
        return Err(Lwm2mError::bad_request("execute takes at most one argument"));
    }
    let value = request
        .records
        .first()
        .map(|r| r.value.clone())
        .unwrap_or(Value::Argument(None));
    if !value.is_execute_payload() {
        return Err(Lwm2mError::not_allowed(format!(
            "execute on {} with a {} value",
            uri,
            value.value_type()
        )));
    }

    let mut target = ResourceRecord::with_value(uri.object, instance, resource, value);
    validate_target(&entry.definition, Operation::Execute, &mut target);
    Ok(Response::from_records(run_groups(
        entry,
        ctx,
        Operation::Execute,
        vec![target],
    )))
}

fn create(entry: &mut ObjectEntry, ctx: &mut ObjectContext, request: &Request) -> Lwm2mResult<Response> {
    let object = entry.definition.id;
    let instance = match request.uri.instance {
        Some(instance) => instance,
        None => entry.free_instance_id()?,
    };
    entry.check_new_instance(instance)?;

    let mut initial = request.records.clone();
    for record in initial.iter_mut() {
        record.object = object;
        record.instance = instance;
        record.status = Status::NoError;
        validate_target(&entry.definition, Operation::Create, record);
    }
    if initial.iter().any(|r| !r.is_ok()) {
        return Ok(Response::from_records(initial));
    }

    entry.handler.create_instance(ctx, instance)?;
    entry.instances.insert(instance);

    if !initial.is_empty() {
        let written = run_groups(entry, ctx, Operation::Create, initial);
        if written.iter().any(|r| !r.is_ok()) {
            log::debug!("Rolling back /{}/{}: initial values rejected", object, instance);
            if let Err(e) = entry.handler.delete_instance(ctx, instance) {
                log::warn!("Rollback of /{}/{} failed: {}", object, instance, e);
            }
            entry.instances.remove(&instance);
            return Ok(Response::from_records(written));
        }
    }

    ctx.instance_created(instance);
    Ok(Response {
        status: Status::NoError,
        records: Vec::new(),
        created: Some(instance),
    })
}

fn delete(entry: &mut ObjectEntry, ctx: &mut ObjectContext, uri: &Uri) -> Lwm2mResult<Response> {
    let Some(instance) = uri.instance else {
        return Err(Lwm2mError::not_allowed(format!("delete of {}", uri)));
    };
    if uri.resource.is_some() {
        return Err(Lwm2mError::not_allowed(format!("delete of {}", uri)));
    }
    entry.require_instance(instance)?;
    entry.handler.delete_instance(ctx, instance)?;
    entry.instances.remove(&instance);
    ctx.instance_deleted(instance);
    Ok(Response::default())
}

fn discover(entry: &mut ObjectEntry, uri: &Uri) -> Lwm2mResult<Response> {
    check_path(entry, uri)?;
    let object = entry.definition.id;
    let instances: Vec<InstanceId> = match uri.instance {
        Some(instance) => vec![instance],
        None => entry.instances().collect(),
    };
    let descriptors: Vec<ResourceDescriptor> = match uri.resource {
        Some(resource) => entry
            .definition
            .resources
            .iter()
            .filter(|d| d.id == resource)
            .copied()
            .collect(),
        None => entry.definition.resources.clone(),
    };

    let mut records = Vec::new();
    for instance in instances {
        for descriptor in &descriptors {
            let target = ResourceRecord::target(object, instance, descriptor.id);
            if descriptor.flags.multiple {
                let ids = entry
                    .handler
                    .resource_instances(instance, descriptor.id)
                    .map_err(|e| Lwm2mError::Internal(e.to_string()))?;
                records.extend(ids.into_iter().map(|ri| target.clone().at(ri)));
            } else {
                records.push(target);
            }
        }
    }
    Ok(Response::from_records(records))
}

/// Serve validated targets, one callback per run of same-instance targets
fn run_groups(
    entry: &mut ObjectEntry,
    ctx: &mut ObjectContext,
    op: Operation,
    targets: Vec<ResourceRecord>,
) -> Vec<ResourceRecord> {
    let mut out = Vec::with_capacity(targets.len());
    let mut rest = targets.as_slice();
    while let Some(first) = rest.first() {
        let instance = first.instance;
        let len = rest.iter().take_while(|r| r.instance == instance).count();
        let (group, tail) = rest.split_at(len);
        out.extend(run_group(entry, ctx, op, instance, group.to_vec()));
        rest = tail;
    }
    out
}

fn run_group(
    entry: &mut ObjectEntry,
    ctx: &mut ObjectContext,
    op: Operation,
    instance: InstanceId,
    group: Vec<ResourceRecord>,
) -> Vec<ResourceRecord> {
    let mut group = if op.is_read_like() {
        match expand_resource_instances(entry, instance, &group) {
            Ok(expanded) => expanded,
            Err(e) => {
                log::warn!(
                    "Resource instance enumeration of /{}/{} failed: {}",
                    entry.definition.id,
                    instance,
                    e
                );
                let mut group = group;
                for record in group.iter_mut() {
                    record.fail(Status::InternalError);
                }
                return group;
            }
        }
    } else {
        group
    };

    let slots: Vec<usize> = group
        .iter()
        .enumerate()
        .filter(|(_, r)| r.is_ok())
        .map(|(i, _)| i)
        .collect();
    if slots.is_empty() {
        return group;
    }

    let mut batch: Vec<ResourceRecord> = slots.iter().map(|&i| group[i].clone()).collect();
    let callback_op = match op {
        Operation::Observe | Operation::Notify => Operation::Read,
        other => other,
    };
    if let Err(e) = entry.handler.handle(ctx, callback_op, instance, &mut batch) {
        let status = Status::from(&e);
        log::debug!(
            "{} on /{}/{} failed: {}",
            callback_op,
            entry.definition.id,
            instance,
            e
        );
        for record in batch.iter_mut().filter(|r| r.is_ok()) {
            record.fail(status);
        }
    }
    if op.needs_release() {
        entry.handler.release(instance, &mut batch);
    }

    for (slot, record) in slots.into_iter().zip(batch) {
        group[slot] = record;
    }
    group
}

/// Replace multi-instance resource targets by one target per resource instance
fn expand_resource_instances(
    entry: &mut ObjectEntry,
    instance: InstanceId,
    group: &[ResourceRecord],
) -> Lwm2mResult<Vec<ResourceRecord>> {
    let mut expanded = Vec::with_capacity(group.len());
    for record in group {
        let multiple = record.is_ok()
            && record.resource_instance.is_none()
            && entry
                .definition
                .resource(record.resource)
                .is_some_and(|d| d.flags.multiple);
        if multiple {
            let ids = entry.handler.resource_instances(instance, record.resource)?;
            expanded.extend(ids.into_iter().map(|ri| record.clone().at(ri)));
        } else {
            expanded.push(record.clone());
        }
    }
    Ok(expanded)
}
