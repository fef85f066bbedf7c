//! Server object (Object ID: 1)
//!
//! One instance per server account. The registration machinery reads its
//! tuning from here through the dispatcher, so a server writing e.g. its
//! Lifetime takes effect on the next tick.

use std::any::Any;
use std::collections::BTreeMap;

use lwm2m_core::{
    InstanceId, Lwm2mError, Lwm2mResult, Operation, ResourceDescriptor, ResourceFlags, ResourceId,
    ResourceRecord, ShortServerId, Status, Timestamp, Value, ValueType, ID_INVALID,
};
use lwm2m_registration::ServerSettings;
use lwm2m_registration::account::validate_binding;

use crate::context::ObjectContext;
use crate::object::{Lwm2mObject, Multiplicity, ObjectDefinition};

/// Server object (Object ID: 1)
#[derive(Debug, Clone, Default)]
pub struct ServerObject {
    instances: BTreeMap<InstanceId, ServerSettings>,
}

impl ServerObject {
    pub const OBJECT_ID: u16 = 1;

    pub const RES_SHORT_SERVER_ID: ResourceId = 0;
    pub const RES_LIFETIME: ResourceId = 1;
    pub const RES_DEFAULT_MIN_PERIOD: ResourceId = 2;
    pub const RES_DEFAULT_MAX_PERIOD: ResourceId = 3;
    pub const RES_DISABLE: ResourceId = 4;
    pub const RES_DISABLE_TIMEOUT: ResourceId = 5;
    pub const RES_NOTIFICATION_STORING: ResourceId = 6;
    pub const RES_BINDING: ResourceId = 7;
    pub const RES_REGISTRATION_UPDATE_TRIGGER: ResourceId = 8;
    pub const RES_BOOTSTRAP_REQUEST_TRIGGER: ResourceId = 9;
    pub const RES_PRIORITY_ORDER: ResourceId = 13;
    pub const RES_INITIAL_DELAY: ResourceId = 14;
    pub const RES_BLOCK_ON_FAILURE: ResourceId = 15;
    pub const RES_BOOTSTRAP_ON_FAILURE: ResourceId = 16;
    pub const RES_RETRY_COUNT: ResourceId = 17;
    pub const RES_RETRY_TIMER: ResourceId = 18;
    pub const RES_SEQUENCE_DELAY_TIMER: ResourceId = 19;
    pub const RES_SEQUENCE_RETRY_COUNT: ResourceId = 20;

    pub fn new() -> Self {
        Self::default()
    }

    pub fn definition() -> ObjectDefinition {
        let m = ResourceFlags::MANDATORY;
        let o = ResourceFlags::OPTIONAL;
        let unsigned = |id| ResourceDescriptor::read_write(id, ValueType::UnsignedInteger, o);
        ObjectDefinition::new(Self::OBJECT_ID, Multiplicity::Multiple).with_resources([
            ResourceDescriptor::read_only(Self::RES_SHORT_SERVER_ID, ValueType::Integer, m),
            ResourceDescriptor::read_write(Self::RES_LIFETIME, ValueType::Integer, m),
            ResourceDescriptor::read_write(Self::RES_DEFAULT_MIN_PERIOD, ValueType::Integer, o),
            ResourceDescriptor::read_write(Self::RES_DEFAULT_MAX_PERIOD, ValueType::Integer, o),
            ResourceDescriptor::executable(Self::RES_DISABLE, o),
            ResourceDescriptor::read_write(Self::RES_DISABLE_TIMEOUT, ValueType::Integer, o),
            ResourceDescriptor::read_write(Self::RES_NOTIFICATION_STORING, ValueType::Boolean, m),
            ResourceDescriptor::read_write(Self::RES_BINDING, ValueType::String, m),
            ResourceDescriptor::executable(Self::RES_REGISTRATION_UPDATE_TRIGGER, m),
            ResourceDescriptor::executable(Self::RES_BOOTSTRAP_REQUEST_TRIGGER, o),
            unsigned(Self::RES_PRIORITY_ORDER),
            unsigned(Self::RES_INITIAL_DELAY),
            ResourceDescriptor::read_write(Self::RES_BLOCK_ON_FAILURE, ValueType::Boolean, o),
            ResourceDescriptor::read_write(Self::RES_BOOTSTRAP_ON_FAILURE, ValueType::Boolean, o),
            unsigned(Self::RES_RETRY_COUNT),
            unsigned(Self::RES_RETRY_TIMER),
            unsigned(Self::RES_SEQUENCE_DELAY_TIMER),
            unsigned(Self::RES_SEQUENCE_RETRY_COUNT),
        ])
    }

    /// Add an instance for an already validated account
    pub fn insert(&mut self, instance: InstanceId, settings: ServerSettings) -> Lwm2mResult<()> {
        if self.instances.contains_key(&instance) {
            return Err(Lwm2mError::AlreadyExists(format!("/1/{}", instance)));
        }
        if self.instance_for(settings.short_server_id).is_some() {
            return Err(Lwm2mError::AlreadyExists(format!(
                "server {}",
                settings.short_server_id
            )));
        }
        self.instances.insert(instance, settings);
        Ok(())
    }

    pub fn remove(&mut self, instance: InstanceId) -> Option<ServerSettings> {
        self.instances.remove(&instance)
    }

    pub fn settings(&self, instance: InstanceId) -> Option<&ServerSettings> {
        self.instances.get(&instance)
    }

    pub fn settings_mut(&mut self, instance: InstanceId) -> Option<&mut ServerSettings> {
        self.instances.get_mut(&instance)
    }

    /// Instance holding the account with this short server id
    pub fn instance_for(&self, server: ShortServerId) -> Option<InstanceId> {
        self.instances
            .iter()
            .find(|(_, s)| s.short_server_id == server)
            .map(|(iid, _)| *iid)
    }

    /// First instance id not in use
    pub fn free_instance_id(&self) -> Option<InstanceId> {
        (0..InstanceId::MAX).find(|iid| !self.instances.contains_key(iid))
    }

    pub fn instances(&self) -> impl Iterator<Item = (InstanceId, &ServerSettings)> {
        self.instances.iter().map(|(iid, s)| (*iid, s))
    }

    /// Fold the records of a full-instance read back into account settings
    ///
    /// Security-side fields (URI, security mode) are kept as they are.
    pub fn apply_records(settings: &mut ServerSettings, records: &[ResourceRecord]) {
        for record in records.iter().filter(|r| r.is_ok()) {
            let value = &record.value;
            match record.resource {
                Self::RES_LIFETIME => set_u64(&mut settings.lifetime, value),
                Self::RES_DEFAULT_MIN_PERIOD => settings.default_min_period = value.as_u64(),
                Self::RES_DEFAULT_MAX_PERIOD => settings.default_max_period = value.as_u64(),
                Self::RES_DISABLE_TIMEOUT => set_u64(&mut settings.disable_timeout, value),
                Self::RES_NOTIFICATION_STORING => set_bool(&mut settings.notification_storing, value),
                Self::RES_BINDING => {
                    if let Some(binding) = value.as_str() {
                        settings.binding = binding.to_string();
                    }
                }
                Self::RES_PRIORITY_ORDER => {
                    settings.priority_order = value.as_u64().and_then(|v| u32::try_from(v).ok());
                }
                Self::RES_INITIAL_DELAY => set_u64(&mut settings.initial_delay, value),
                Self::RES_BLOCK_ON_FAILURE => set_bool(&mut settings.block_on_failure, value),
                Self::RES_BOOTSTRAP_ON_FAILURE => set_bool(&mut settings.bootstrap_on_failure, value),
                Self::RES_RETRY_COUNT => set_u32(&mut settings.retry.retry_count, value),
                Self::RES_RETRY_TIMER => set_u64(&mut settings.retry.retry_timer, value),
                Self::RES_SEQUENCE_DELAY_TIMER => {
                    set_u64(&mut settings.retry.sequence_delay_timer, value)
                }
                Self::RES_SEQUENCE_RETRY_COUNT => {
                    set_u32(&mut settings.retry.sequence_retry_count, value)
                }
                _ => {}
            }
        }
    }

    fn read_value(settings: &ServerSettings, resource: ResourceId) -> Lwm2mResult<Value> {
        let optional = |value: Option<u64>| {
            value
                .map(|v| Value::Integer(v as i64))
                .ok_or_else(|| Lwm2mError::not_found(format!("/1/x/{}", resource)))
        };
        Ok(match resource {
            Self::RES_SHORT_SERVER_ID => Value::Integer(settings.short_server_id as i64),
            Self::RES_LIFETIME => Value::Integer(settings.lifetime as i64),
            Self::RES_DEFAULT_MIN_PERIOD => optional(settings.default_min_period)?,
            Self::RES_DEFAULT_MAX_PERIOD => optional(settings.default_max_period)?,
            Self::RES_DISABLE_TIMEOUT => Value::Integer(settings.disable_timeout as i64),
            Self::RES_NOTIFICATION_STORING => Value::Boolean(settings.notification_storing),
            Self::RES_BINDING => Value::String(settings.binding.clone()),
            Self::RES_PRIORITY_ORDER => settings
                .priority_order
                .map(|v| Value::UnsignedInteger(v as u64))
                .ok_or_else(|| Lwm2mError::not_found(format!("/1/x/{}", resource)))?,
            Self::RES_INITIAL_DELAY => Value::UnsignedInteger(settings.initial_delay),
            Self::RES_BLOCK_ON_FAILURE => Value::Boolean(settings.block_on_failure),
            Self::RES_BOOTSTRAP_ON_FAILURE => Value::Boolean(settings.bootstrap_on_failure),
            Self::RES_RETRY_COUNT => Value::UnsignedInteger(settings.retry.retry_count as u64),
            Self::RES_RETRY_TIMER => Value::UnsignedInteger(settings.retry.retry_timer),
            Self::RES_SEQUENCE_DELAY_TIMER => {
                Value::UnsignedInteger(settings.retry.sequence_delay_timer)
            }
            Self::RES_SEQUENCE_RETRY_COUNT => {
                Value::UnsignedInteger(settings.retry.sequence_retry_count as u64)
            }
            _ => return Err(Lwm2mError::not_allowed(format!("read of /1/x/{}", resource))),
        })
    }

    /// Apply one write; returns whether the registration must be updated
    /// `creating` admits the Short Server ID, which is fixed once the
    /// instance exists
    fn write_value(settings: &mut ServerSettings, record: &ResourceRecord, creating: bool) -> Lwm2mResult<bool> {
        let value = &record.value;
        let unsigned = || {
            value
                .as_u64()
                .ok_or_else(|| Lwm2mError::bad_request(format!("{} expects a non-negative integer", record.uri())))
        };
        let boolean = || {
            value
                .as_bool()
                .ok_or_else(|| Lwm2mError::bad_request(format!("{} expects a boolean", record.uri())))
        };
        match record.resource {
            Self::RES_LIFETIME => {
                let lifetime = unsigned()?;
                if lifetime == 0 {
                    return Err(Lwm2mError::bad_request("lifetime must be positive"));
                }
                let changed = settings.lifetime != lifetime;
                settings.lifetime = lifetime;
                return Ok(changed);
            }
            Self::RES_BINDING => {
                let binding = value
                    .as_str()
                    .ok_or_else(|| Lwm2mError::bad_request("binding expects a string"))?;
                validate_binding(binding)?;
                let changed = settings.binding != binding;
                settings.binding = binding.to_string();
                return Ok(changed);
            }
            Self::RES_SHORT_SERVER_ID if creating => {
                settings.short_server_id = ShortServerId::try_from(unsigned()?)
                    .ok()
                    .filter(|ssid| *ssid != 0 && *ssid != ID_INVALID)
                    .ok_or_else(|| Lwm2mError::bad_request(format!("{} is out of range", record.uri())))?;
            }
            Self::RES_DEFAULT_MIN_PERIOD => settings.default_min_period = Some(unsigned()?),
            Self::RES_DEFAULT_MAX_PERIOD => settings.default_max_period = Some(unsigned()?),
            Self::RES_DISABLE_TIMEOUT => settings.disable_timeout = unsigned()?,
            Self::RES_NOTIFICATION_STORING => settings.notification_storing = boolean()?,
            Self::RES_PRIORITY_ORDER => settings.priority_order = Some(to_u32(unsigned()?)?),
            Self::RES_INITIAL_DELAY => settings.initial_delay = unsigned()?,
            Self::RES_BLOCK_ON_FAILURE => settings.block_on_failure = boolean()?,
            Self::RES_BOOTSTRAP_ON_FAILURE => settings.bootstrap_on_failure = boolean()?,
            Self::RES_RETRY_COUNT => settings.retry.retry_count = to_u32(unsigned()?)?,
            Self::RES_RETRY_TIMER => settings.retry.retry_timer = unsigned()?,
            Self::RES_SEQUENCE_DELAY_TIMER => settings.retry.sequence_delay_timer = unsigned()?,
            Self::RES_SEQUENCE_RETRY_COUNT => {
                settings.retry.sequence_retry_count = to_u32(unsigned()?)?
            }
            _ => return Err(Lwm2mError::not_allowed(record.uri())),
        }
        Ok(false)
    }

    fn execute(ctx: &mut ObjectContext, settings: &ServerSettings, resource: ResourceId) -> Lwm2mResult<()> {
        let server = settings.short_server_id;
        match resource {
            Self::RES_DISABLE => ctx.disable_server(server, settings.disable_timeout),
            Self::RES_REGISTRATION_UPDATE_TRIGGER => ctx.request_update(Some(server)),
            Self::RES_BOOTSTRAP_REQUEST_TRIGGER => ctx.request_bootstrap(server),
            _ => return Err(Lwm2mError::not_allowed(format!("execute on /1/x/{}", resource))),
        }
        Ok(())
    }
}

impl Lwm2mObject for ServerObject {
    fn handle(
        &mut self,
        ctx: &mut ObjectContext,
        op: Operation,
        instance: InstanceId,
        records: &mut [ResourceRecord],
    ) -> Lwm2mResult<()> {
        if op == Operation::Create {
            for record in records.iter_mut().filter(|r| r.resource == Self::RES_SHORT_SERVER_ID) {
                let owner = record
                    .value
                    .as_u64()
                    .and_then(|v| ShortServerId::try_from(v).ok())
                    .and_then(|ssid| self.instance_for(ssid));
                if owner.is_some_and(|owner| owner != instance) {
                    log::debug!("Short server id {} already in use", record.value);
                    record.fail(Status::Conflict);
                }
            }
        }
        let settings = self
            .instances
            .get_mut(&instance)
            .ok_or_else(|| Lwm2mError::not_found(format!("/1/{}", instance)))?;

        let mut update = false;
        for record in records.iter_mut().filter(|r| r.is_ok()) {
            let result = match op {
                Operation::Read => {
                    Self::read_value(settings, record.resource).map(|value| record.set(value))
                }
                Operation::Write | Operation::Create => {
                    let creating = op == Operation::Create;
                    Self::write_value(settings, record, creating).map(|changed| update |= changed)
                }
                Operation::Execute => Self::execute(ctx, settings, record.resource),
                _ => Err(Lwm2mError::not_allowed(format!("{} on /1/{}", op, instance))),
            };
            if let Err(e) = result {
                record.fail(Status::from(&e));
            }
        }
        if update {
            ctx.request_update(Some(settings.short_server_id));
        }
        Ok(())
    }

    fn create_instance(&mut self, _ctx: &mut ObjectContext, instance: InstanceId) -> Lwm2mResult<()> {
        if self.instances.contains_key(&instance) {
            return Err(Lwm2mError::AlreadyExists(format!("/1/{}", instance)));
        }
        let server = (1..ShortServerId::MAX)
            .find(|ssid| self.instance_for(*ssid).is_none())
            .ok_or_else(|| Lwm2mError::Internal("no free short server id".to_string()))?;
        log::info!("Created server instance /1/{} (short server id {} until set)", instance, server);
        self.instances.insert(instance, ServerSettings::new(server, ""));
        Ok(())
    }

    fn delete_instance(&mut self, _ctx: &mut ObjectContext, instance: InstanceId) -> Lwm2mResult<()> {
        self.instances
            .remove(&instance)
            .map(|_| ())
            .ok_or_else(|| Lwm2mError::not_found(format!("/1/{}", instance)))
    }

    /// Instances carry account settings, so `insert` must run first
    fn attach_instance(&mut self, instance: InstanceId, _now: Timestamp) -> Lwm2mResult<()> {
        if !self.instances.contains_key(&instance) {
            return Err(Lwm2mError::PreconditionFailed(format!(
                "/1/{} has no account settings",
                instance
            )));
        }
        Ok(())
    }

    fn detach_instance(&mut self, instance: InstanceId) {
        self.instances.remove(&instance);
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn to_u32(value: u64) -> Lwm2mResult<u32> {
    u32::try_from(value).map_err(|_| Lwm2mError::bad_request(format!("{} out of range", value)))
}

fn set_u64(target: &mut u64, value: &Value) {
    if let Some(v) = value.as_u64() {
        *target = v;
    }
}

fn set_u32(target: &mut u32, value: &Value) {
    if let Some(v) = value.as_u64().and_then(|v| u32::try_from(v).ok()) {
        *target = v;
    }
}

fn set_bool(target: &mut bool, value: &Value) {
    if let Some(v) = value.as_bool() {
        *target = v;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::SideEffect;
    use bytes::Bytes;

    fn object() -> ServerObject {
        let mut object = ServerObject::new();
        object
            .insert(0, ServerSettings::new(101, "coap://a").with_lifetime(300))
            .unwrap();
        object
    }

    #[test]
    fn test_definition_is_valid() {
        assert!(ServerObject::definition().validate().is_ok());
    }

    #[test]
    fn test_read_instance() {
        let mut server = object();
        let mut ctx = ObjectContext::new(0, 1);
        let mut records = [
            ResourceRecord::target(1, 0, ServerObject::RES_SHORT_SERVER_ID),
            ResourceRecord::target(1, 0, ServerObject::RES_LIFETIME),
            ResourceRecord::target(1, 0, ServerObject::RES_DEFAULT_MIN_PERIOD),
        ];
        server.handle(&mut ctx, Operation::Read, 0, &mut records).unwrap();
        assert_eq!(records[0].value, Value::Integer(101));
        assert_eq!(records[1].value, Value::Integer(300));
        assert_eq!(records[2].status, Status::NotFound);
    }

    #[test]
    fn test_lifetime_write_requests_update() {
        let mut server = object();
        let mut ctx = ObjectContext::new(0, 1);
        let mut records = [ResourceRecord::with_value(1, 0, 1, Value::Integer(50))];
        server.handle(&mut ctx, Operation::Write, 0, &mut records).unwrap();
        assert_eq!(server.settings(0).unwrap().lifetime, 50);
        assert_eq!(ctx.effects(), &[SideEffect::RegistrationUpdate(Some(101))]);

        // same value again does not
        let mut ctx = ObjectContext::new(0, 1);
        server.handle(&mut ctx, Operation::Write, 0, &mut records).unwrap();
        assert!(ctx.effects().is_empty());
    }

    #[test]
    fn test_invalid_writes() {
        let mut server = object();
        let mut ctx = ObjectContext::new(0, 1);
        let mut records = [
            ResourceRecord::with_value(1, 0, 1, Value::Integer(0)),
            ResourceRecord::with_value(1, 0, 7, Value::String("X".into())),
            ResourceRecord::with_value(1, 0, 17, Value::Integer(2)),
        ];
        server.handle(&mut ctx, Operation::Write, 0, &mut records).unwrap();
        assert_eq!(records[0].status, Status::BadRequest);
        assert_eq!(records[1].status, Status::BadRequest);
        assert!(records[2].is_ok());
        assert_eq!(server.settings(0).unwrap().retry.retry_count, 2);
    }

    #[test]
    fn test_short_server_id_only_set_on_create() {
        let mut server = object();
        let mut ctx = ObjectContext::new(0, 1);
        server.create_instance(&mut ctx, 1).unwrap();

        let ssid = |instance, value| [ResourceRecord::with_value(1, instance, 0, Value::Integer(value))];
        let mut records = ssid(1, 101);
        server.handle(&mut ctx, Operation::Create, 1, &mut records).unwrap();
        assert_eq!(records[0].status, Status::Conflict);
        let mut records = ssid(1, 0);
        server.handle(&mut ctx, Operation::Create, 1, &mut records).unwrap();
        assert_eq!(records[0].status, Status::BadRequest);

        let mut records = ssid(1, 7);
        server.handle(&mut ctx, Operation::Create, 1, &mut records).unwrap();
        assert!(records[0].is_ok());
        assert_eq!(server.instance_for(7), Some(1));

        let mut records = ssid(0, 8);
        server.handle(&mut ctx, Operation::Write, 0, &mut records).unwrap();
        assert_eq!(records[0].status, Status::MethodNotAllowed);
        assert_eq!(server.instance_for(101), Some(0));
    }

    #[test]
    fn test_triggers() {
        let mut server = object();
        let mut ctx = ObjectContext::new(0, 1);
        for resource in [8, 4, 9] {
            let mut records = [ResourceRecord::with_value(1, 0, resource, Value::Argument(Some(Bytes::new())))];
            server.handle(&mut ctx, Operation::Execute, 0, &mut records).unwrap();
        }
        assert_eq!(
            ctx.effects(),
            &[
                SideEffect::RegistrationUpdate(Some(101)),
                SideEffect::ServerDisable { server: 101, timeout: 86400 },
                SideEffect::BootstrapRequest(101),
            ]
        );
    }

    #[test]
    fn test_apply_records_round_trip() {
        let mut server = object();
        let mut ctx = ObjectContext::new(0, 1);
        let mut records: Vec<_> = ServerObject::definition()
            .resources
            .iter()
            .filter(|r| r.operations.can_read())
            .map(|r| ResourceRecord::target(1, 0, r.id))
            .collect();
        server.handle(&mut ctx, Operation::Read, 0, &mut records).unwrap();

        let mut settings = ServerSettings::new(101, "coap://a");
        ServerObject::apply_records(&mut settings, &records);
        assert_eq!(&settings, server.settings(0).unwrap());
    }

    #[test]
    fn test_create_assigns_free_short_server_id() {
        let mut server = object();
        let mut ctx = ObjectContext::new(0, 1);
        server.create_instance(&mut ctx, 1).unwrap();
        assert_eq!(server.settings(1).unwrap().short_server_id, 1);
        assert!(server.create_instance(&mut ctx, 1).is_err());
        server.delete_instance(&mut ctx, 1).unwrap();
        assert!(server.delete_instance(&mut ctx, 1).is_err());
    }
}
