//! Generic sensor object (IPSO 3300 family)
//!
//! The object id is configurable so the same implementation serves e.g.
//! Temperature (3303) or Humidity (3304).
//!
//! # Resources
//!
//! - 5700: Sensor Value
//! - 5701: Sensor Units
//! - 5601/5602: Min/Max Measured Value
//! - 5603/5604: Min/Max Range Value
//! - 5605: Reset Min and Max Measured Values (E)
//! - 5750: Application Type
//! - 5518: Timestamp
//! - 5852/5854: On Time / Off Time, seconds spent with a non-zero / zero value

use std::any::Any;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use lwm2m_core::{
    InstanceId, Lwm2mError, Lwm2mResult, ObjectId, Operation, ResourceDescriptor, ResourceFlags,
    ResourceId, ResourceRecord, Status, Timestamp, Value, ValueType,
};

use crate::context::ObjectContext;
use crate::object::{Lwm2mObject, Multiplicity, ObjectDefinition};

/// Which optional sensor resources are present
#[derive(Debug, Clone, PartialEq)]
pub struct SensorConfig {
    pub object_id: ObjectId,
    pub units: Option<String>,
    /// Min/Max Range Value
    pub range: Option<(f64, f64)>,
    /// Min/Max Measured Value and their reset
    pub min_max_measured: bool,
    pub application_type: bool,
    pub timestamp: bool,
    pub on_off_time: bool,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            object_id: GenericSensor::DEFAULT_OBJECT_ID,
            units: None,
            range: None,
            min_max_measured: false,
            application_type: false,
            timestamp: false,
            on_off_time: false,
        }
    }
}

impl SensorConfig {
    pub fn new(object_id: ObjectId) -> Self {
        Self {
            object_id,
            ..Self::default()
        }
    }

    pub fn with_units(mut self, units: impl Into<String>) -> Self {
        self.units = Some(units.into());
        self
    }

    pub fn with_range(mut self, min: f64, max: f64) -> Self {
        self.range = Some((min, max));
        self
    }

    pub fn with_min_max_measured(mut self) -> Self {
        self.min_max_measured = true;
        self
    }

    pub fn with_application_type(mut self) -> Self {
        self.application_type = true;
        self
    }

    pub fn with_timestamp(mut self) -> Self {
        self.timestamp = true;
        self
    }

    pub fn with_on_off_time(mut self) -> Self {
        self.on_off_time = true;
        self
    }

    pub fn resources(&self) -> Vec<ResourceDescriptor> {
        use GenericSensor as S;
        let o = ResourceFlags::OPTIONAL;
        let float = |id| ResourceDescriptor::read_only(id, ValueType::Float, o);

        let mut resources = vec![ResourceDescriptor::read_only(
            S::RES_SENSOR_VALUE,
            ValueType::Float,
            ResourceFlags::MANDATORY,
        )];
        if self.units.is_some() {
            resources.push(ResourceDescriptor::read_only(S::RES_SENSOR_UNITS, ValueType::String, o));
        }
        if self.min_max_measured {
            resources.push(float(S::RES_MIN_MEASURED));
            resources.push(float(S::RES_MAX_MEASURED));
        }
        if self.range.is_some() {
            resources.push(float(S::RES_MIN_RANGE));
            resources.push(float(S::RES_MAX_RANGE));
        }
        if self.min_max_measured {
            resources.push(ResourceDescriptor::executable(S::RES_RESET_MIN_MAX, o));
        }
        if self.application_type {
            resources.push(ResourceDescriptor::read_write(S::RES_APPLICATION_TYPE, ValueType::String, o));
        }
        if self.timestamp {
            resources.push(ResourceDescriptor::read_only(S::RES_TIMESTAMP, ValueType::Time, o));
        }
        if self.on_off_time {
            resources.push(ResourceDescriptor::read_write(S::RES_ON_TIME, ValueType::Integer, o));
            resources.push(ResourceDescriptor::read_write(S::RES_OFF_TIME, ValueType::Integer, o));
        }
        resources
    }
}

#[derive(Debug, Clone, PartialEq)]
struct SensorState {
    value: f64,
    min_measured: Option<f64>,
    max_measured: Option<f64>,
    application_type: String,
    timestamp: Option<i64>,
    on: bool,
    on_time: u64,
    off_time: u64,
    /// Last time the on/off accumulators were brought up to date
    since: Timestamp,
}

impl SensorState {
    fn new(now: Timestamp) -> Self {
        Self {
            value: 0.0,
            min_measured: None,
            max_measured: None,
            application_type: String::new(),
            timestamp: None,
            on: false,
            on_time: 0,
            off_time: 0,
            since: now,
        }
    }

    fn accumulate(&mut self, now: Timestamp) {
        let elapsed = now.saturating_sub(self.since);
        if self.on {
            self.on_time = self.on_time.saturating_add(elapsed);
        } else {
            self.off_time = self.off_time.saturating_add(elapsed);
        }
        self.since = now;
    }

    fn on_time(&self, now: Timestamp) -> u64 {
        if self.on {
            self.on_time.saturating_add(now.saturating_sub(self.since))
        } else {
            self.on_time
        }
    }

    fn off_time(&self, now: Timestamp) -> u64 {
        if self.on {
            self.off_time
        } else {
            self.off_time.saturating_add(now.saturating_sub(self.since))
        }
    }
}

/// Generic sensor object
#[derive(Debug, Clone)]
pub struct GenericSensor {
    config: SensorConfig,
    definition: ObjectDefinition,
    instances: BTreeMap<InstanceId, SensorState>,
}

impl GenericSensor {
    pub const DEFAULT_OBJECT_ID: ObjectId = 3300;

    pub const RES_SENSOR_VALUE: ResourceId = 5700;
    pub const RES_SENSOR_UNITS: ResourceId = 5701;
    pub const RES_MIN_MEASURED: ResourceId = 5601;
    pub const RES_MAX_MEASURED: ResourceId = 5602;
    pub const RES_MIN_RANGE: ResourceId = 5603;
    pub const RES_MAX_RANGE: ResourceId = 5604;
    pub const RES_RESET_MIN_MAX: ResourceId = 5605;
    pub const RES_APPLICATION_TYPE: ResourceId = 5750;
    pub const RES_TIMESTAMP: ResourceId = 5518;
    pub const RES_ON_TIME: ResourceId = 5852;
    pub const RES_OFF_TIME: ResourceId = 5854;

    pub fn new(config: SensorConfig) -> Self {
        let definition = ObjectDefinition::new(config.object_id, Multiplicity::Multiple)
            .with_resources(config.resources());
        Self {
            config,
            definition,
            instances: BTreeMap::new(),
        }
    }

    pub fn object_id(&self) -> ObjectId {
        self.config.object_id
    }

    pub fn definition(&self) -> ObjectDefinition {
        self.definition.clone()
    }

    pub fn instance_ids(&self) -> impl Iterator<Item = InstanceId> + '_ {
        self.instances.keys().copied()
    }

    pub fn insert_instance(&mut self, instance: InstanceId, now: Timestamp) -> Lwm2mResult<()> {
        if self.instances.contains_key(&instance) {
            return Err(Lwm2mError::AlreadyExists(format!(
                "/{}/{}",
                self.config.object_id, instance
            )));
        }
        self.instances.insert(instance, SensorState::new(now));
        Ok(())
    }

    pub fn remove_instance(&mut self, instance: InstanceId) -> Lwm2mResult<()> {
        self.instances
            .remove(&instance)
            .map(|_| ())
            .ok_or_else(|| Lwm2mError::not_found(format!("/{}/{}", self.config.object_id, instance)))
    }

    pub fn value(&self, instance: InstanceId) -> Option<f64> {
        self.instances.get(&instance).map(|s| s.value)
    }

    pub fn on_time(&self, instance: InstanceId, now: Timestamp) -> Option<u64> {
        self.instances.get(&instance).map(|s| s.on_time(now))
    }

    pub fn off_time(&self, instance: InstanceId, now: Timestamp) -> Option<u64> {
        self.instances.get(&instance).map(|s| s.off_time(now))
    }

    fn state_mut(&mut self, instance: InstanceId) -> Lwm2mResult<&mut SensorState> {
        let object = self.config.object_id;
        self.instances
            .get_mut(&instance)
            .ok_or_else(|| Lwm2mError::not_found(format!("/{}/{}", object, instance)))
    }

    /// Record a new measurement
    ///
    /// Every derived resource the measurement touches is marked changed;
    /// callers wrap this in one notification lock so observers see the new
    /// value together with its min/max and on/off times.
    pub fn update_value(&mut self, ctx: &mut ObjectContext, instance: InstanceId, value: f64) -> Lwm2mResult<()> {
        let timestamp = if self.config.timestamp {
            Some(unix_time()?)
        } else {
            None
        };
        let min_max = self.config.min_max_measured;
        let on_off = self.config.on_off_time;
        let now = ctx.now();
        let state = self.state_mut(instance)?;

        if state.value != value {
            state.value = value;
            ctx.resource_changed(instance, Self::RES_SENSOR_VALUE);
        }
        if min_max {
            if state.min_measured.is_none_or(|min| value < min) {
                state.min_measured = Some(value);
                ctx.resource_changed(instance, Self::RES_MIN_MEASURED);
            }
            if state.max_measured.is_none_or(|max| value > max) {
                state.max_measured = Some(value);
                ctx.resource_changed(instance, Self::RES_MAX_MEASURED);
            }
        }
        if timestamp.is_some() {
            state.timestamp = timestamp;
            ctx.resource_changed(instance, Self::RES_TIMESTAMP);
        }
        let on = value != 0.0;
        if on != state.on {
            state.accumulate(now);
            state.on = on;
            if on_off {
                ctx.resource_changed(instance, Self::RES_ON_TIME);
                ctx.resource_changed(instance, Self::RES_OFF_TIME);
            }
        }
        Ok(())
    }

    fn read_value(&self, state: &SensorState, resource: ResourceId, now: Timestamp) -> Lwm2mResult<Value> {
        Ok(match resource {
            Self::RES_SENSOR_VALUE => Value::Float(state.value),
            Self::RES_SENSOR_UNITS => Value::String(self.config.units.clone().unwrap_or_default()),
            Self::RES_MIN_MEASURED => Value::Float(state.min_measured.unwrap_or(state.value)),
            Self::RES_MAX_MEASURED => Value::Float(state.max_measured.unwrap_or(state.value)),
            Self::RES_MIN_RANGE => Value::Float(self.config.range.map_or(0.0, |r| r.0)),
            Self::RES_MAX_RANGE => Value::Float(self.config.range.map_or(0.0, |r| r.1)),
            Self::RES_APPLICATION_TYPE => Value::String(state.application_type.clone()),
            Self::RES_TIMESTAMP => state
                .timestamp
                .map(Value::Time)
                .ok_or_else(|| Lwm2mError::not_found("no measurement yet"))?,
            Self::RES_ON_TIME => Value::Integer(clamp_i64(state.on_time(now))),
            Self::RES_OFF_TIME => Value::Integer(clamp_i64(state.off_time(now))),
            _ => return Err(Lwm2mError::not_allowed(format!("read of resource {}", resource))),
        })
    }

    fn write_value(state: &mut SensorState, record: &ResourceRecord, now: Timestamp) -> Lwm2mResult<()> {
        match record.resource {
            Self::RES_APPLICATION_TYPE => {
                state.application_type = record
                    .value
                    .as_str()
                    .ok_or_else(|| Lwm2mError::bad_request("application type expects a string"))?
                    .to_string();
            }
            Self::RES_ON_TIME | Self::RES_OFF_TIME => {
                if record.value.as_i64() != Some(0) {
                    return Err(Lwm2mError::bad_request(format!(
                        "{} can only be reset to 0",
                        record.uri()
                    )));
                }
                state.accumulate(now);
                if record.resource == Self::RES_ON_TIME {
                    state.on_time = 0;
                } else {
                    state.off_time = 0;
                }
            }
            _ => return Err(Lwm2mError::not_allowed(record.uri())),
        }
        Ok(())
    }
}

impl Lwm2mObject for GenericSensor {
    fn handle(
        &mut self,
        ctx: &mut ObjectContext,
        op: Operation,
        instance: InstanceId,
        records: &mut [ResourceRecord],
    ) -> Lwm2mResult<()> {
        let now = ctx.now();
        let object = self.config.object_id;
        let Some(state) = self.instances.get(&instance) else {
            return Err(Lwm2mError::not_found(format!("/{}/{}", object, instance)));
        };

        match op {
            Operation::Read => {
                for record in records.iter_mut() {
                    match self.read_value(state, record.resource, now) {
                        Ok(value) => record.set(value),
                        Err(e) => record.fail(Status::from(&e)),
                    }
                }
            }
            Operation::Write | Operation::Create => {
                let state = self.state_mut(instance)?;
                for record in records.iter_mut() {
                    if let Err(e) = Self::write_value(state, record, now) {
                        record.fail(Status::from(&e));
                    }
                }
            }
            Operation::Execute => {
                let state = self.state_mut(instance)?;
                for record in records.iter_mut() {
                    if record.resource != Self::RES_RESET_MIN_MAX {
                        record.fail(Status::MethodNotAllowed);
                        continue;
                    }
                    state.min_measured = Some(state.value);
                    state.max_measured = Some(state.value);
                    ctx.resource_changed(instance, Self::RES_MIN_MEASURED);
                    ctx.resource_changed(instance, Self::RES_MAX_MEASURED);
                }
            }
            _ => return Err(Lwm2mError::not_allowed(format!("{} on /{}/{}", op, object, instance))),
        }
        Ok(())
    }

    fn create_instance(&mut self, ctx: &mut ObjectContext, instance: InstanceId) -> Lwm2mResult<()> {
        self.insert_instance(instance, ctx.now())
    }

    fn delete_instance(&mut self, _ctx: &mut ObjectContext, instance: InstanceId) -> Lwm2mResult<()> {
        self.remove_instance(instance)
    }

    fn attach_instance(&mut self, instance: InstanceId, now: Timestamp) -> Lwm2mResult<()> {
        self.instances
            .entry(instance)
            .or_insert_with(|| SensorState::new(now));
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

fn clamp_i64(value: u64) -> i64 {
    i64::try_from(value).unwrap_or(i64::MAX)
}

fn unix_time() -> Lwm2mResult<i64> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Lwm2mError::Internal(format!("system clock: {}", e)))?;
    Ok(clamp_i64(elapsed.as_secs()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::context::ChangeMarker;

    fn sensor() -> GenericSensor {
        let mut sensor = GenericSensor::new(
            SensorConfig::new(3303)
                .with_units("Cel")
                .with_range(-40.0, 85.0)
                .with_min_max_measured()
                .with_on_off_time(),
        );
        sensor.insert_instance(0, 0).unwrap();
        sensor
    }

    fn read(sensor: &mut GenericSensor, resource: ResourceId, now: Timestamp) -> Value {
        let mut ctx = ObjectContext::new(now, sensor.object_id());
        let mut records = [ResourceRecord::target(sensor.object_id(), 0, resource)];
        sensor.handle(&mut ctx, Operation::Read, 0, &mut records).unwrap();
        records[0].value.clone()
    }

    #[test]
    fn test_definition() {
        let def = sensor().definition();
        assert_eq!(def.id, 3303);
        assert!(def.validate().is_ok());
        assert!(def.resource(GenericSensor::RES_TIMESTAMP).is_none());
        assert!(def.resource(GenericSensor::RES_RESET_MIN_MAX).is_some());
    }

    #[test]
    fn test_update_tracks_min_max() {
        let mut sensor = sensor();
        let mut ctx = ObjectContext::new(0, 3303);
        sensor.update_value(&mut ctx, 0, 21.5).unwrap();
        sensor.update_value(&mut ctx, 0, 18.0).unwrap();
        sensor.update_value(&mut ctx, 0, 25.0).unwrap();
        assert_eq!(read(&mut sensor, 5601, 0), Value::Float(18.0));
        assert_eq!(read(&mut sensor, 5602, 0), Value::Float(25.0));
        assert_eq!(read(&mut sensor, 5700, 0), Value::Float(25.0));
        assert_eq!(read(&mut sensor, 5604, 0), Value::Float(85.0));

        let mut records = [ResourceRecord::with_value(3303, 0, 5605, Value::Argument(None))];
        sensor.handle(&mut ctx, Operation::Execute, 0, &mut records).unwrap();
        assert_eq!(read(&mut sensor, 5601, 0), Value::Float(25.0));
    }

    #[test]
    fn test_update_marks_touched_resources() {
        let mut sensor = sensor();
        let mut ctx = ObjectContext::new(10, 3303);
        sensor.update_value(&mut ctx, 0, 1.0).unwrap();
        let resources: Vec<_> = ctx.changes().iter().filter_map(|m: &ChangeMarker| m.resource).collect();
        assert_eq!(resources, vec![5700, 5601, 5602, 5852, 5854]);
    }

    #[test]
    fn test_on_off_time_accumulates() {
        let mut sensor = sensor();
        let mut ctx = ObjectContext::new(10, 3303);
        sensor.update_value(&mut ctx, 0, 1.0).unwrap();
        let mut ctx = ObjectContext::new(25, 3303);
        sensor.update_value(&mut ctx, 0, 0.0).unwrap();

        assert_eq!(sensor.on_time(0, 30), Some(15));
        assert_eq!(sensor.off_time(0, 30), Some(15));
        assert_eq!(read(&mut sensor, 5852, 30), Value::Integer(15));
    }

    #[test]
    fn test_on_time_reset_only_to_zero() {
        let mut sensor = sensor();
        let mut ctx = ObjectContext::new(0, 3303);
        sensor.update_value(&mut ctx, 0, 1.0).unwrap();

        let mut ctx = ObjectContext::new(100, 3303);
        let mut records = [
            ResourceRecord::with_value(3303, 0, 5852, Value::Integer(5)),
            ResourceRecord::with_value(3303, 0, 5854, Value::Integer(0)),
        ];
        sensor.handle(&mut ctx, Operation::Write, 0, &mut records).unwrap();
        assert_eq!(records[0].status, Status::BadRequest);
        assert!(records[1].is_ok());
        assert_eq!(sensor.on_time(0, 100), Some(100));

        let mut records = [ResourceRecord::with_value(3303, 0, 5852, Value::Integer(0))];
        sensor.handle(&mut ctx, Operation::Write, 0, &mut records).unwrap();
        assert_eq!(sensor.on_time(0, 130), Some(30));
    }

    #[test]
    fn test_unknown_instance() {
        let mut sensor = sensor();
        let mut ctx = ObjectContext::new(0, 3303);
        assert!(matches!(
            sensor.update_value(&mut ctx, 9, 1.0),
            Err(Lwm2mError::NotFound(_))
        ));
        sensor.create_instance(&mut ctx, 9).unwrap();
        assert!(sensor.update_value(&mut ctx, 9, 1.0).is_ok());
    }
}
