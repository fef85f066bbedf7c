//! Device object (Object ID: 3)
//!
//! Single-instance object describing the endpoint itself.
//!
//! # Resources
//!
//! - 0..3: manufacturer, model number, serial number, firmware version
//! - 4: Reboot (E), 5: Factory Reset (E)
//! - 6..8: available power sources with their voltage and current (multiple)
//! - 9: battery level, 10: memory free
//! - 11: error code (multiple), 12: Reset Error Code (E)
//! - 13: current time, 14: UTC offset, 15: timezone
//! - 16: supported binding and modes
//! - 17..19: device type, hardware version, software version
//! - 20: battery status, 21: memory total
//!
//! Optional resources are picked once through [`DeviceConfig`].

use std::any::Any;
use std::collections::BTreeMap;
use std::time::{SystemTime, UNIX_EPOCH};

use lwm2m_core::{
    Event, InstanceId, Lwm2mError, Lwm2mResult, Operation, ResourceDescriptor, ResourceFlags,
    ResourceId, ResourceInstanceId, ResourceRecord, Status, Value, ValueType,
};

use crate::context::ObjectContext;
use crate::object::{Lwm2mObject, Multiplicity, ObjectDefinition, SINGLE_INSTANCE_ID};

/// Power source kind (resource 6)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum PowerSourceType {
    Dc = 0,
    InternalBattery = 1,
    ExternalBattery = 2,
    FuelCell = 3,
    PowerOverEthernet = 4,
    Usb = 5,
    Ac = 6,
    Solar = 7,
}

impl PowerSourceType {
    pub fn from_value(value: u8) -> Lwm2mResult<Self> {
        Ok(match value {
            0 => Self::Dc,
            1 => Self::InternalBattery,
            2 => Self::ExternalBattery,
            3 => Self::FuelCell,
            4 => Self::PowerOverEthernet,
            5 => Self::Usb,
            6 => Self::Ac,
            7 => Self::Solar,
            _ => return Err(Lwm2mError::bad_request(format!("power source type {}", value))),
        })
    }

    pub fn value(self) -> u8 {
        self as u8
    }
}

/// Battery status (resource 20)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u8)]
pub enum BatteryStatus {
    Normal = 0,
    Charging = 1,
    ChargeComplete = 2,
    Damaged = 3,
    Low = 4,
    NotInstalled = 5,
    #[default]
    Unknown = 6,
}

impl BatteryStatus {
    pub fn value(self) -> u8 {
        self as u8
    }
}

/// Device error code (resource 11)
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum ErrorCode {
    NoError = 0,
    LowBatteryPower = 1,
    ExternalPowerSupplyOff = 2,
    GpsModuleFailure = 3,
    LowReceivedSignalStrength = 4,
    OutOfMemory = 5,
    SmsFailure = 6,
    IpConnectivityFailure = 7,
    PeripheralMalfunction = 8,
}

impl ErrorCode {
    pub fn value(self) -> u8 {
        self as u8
    }
}

/// One entry of the power source list
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PowerSource {
    pub kind: PowerSourceType,
    /// Voltage in millivolts
    pub voltage_mv: i64,
    /// Current in milliamperes
    pub current_ma: i64,
}

impl PowerSource {
    pub fn new(kind: PowerSourceType) -> Self {
        Self {
            kind,
            voltage_mv: 0,
            current_ma: 0,
        }
    }
}

/// Which optional Device resources are present, and their static values
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub manufacturer: Option<String>,
    pub model_number: Option<String>,
    pub serial_number: Option<String>,
    pub firmware_version: Option<String>,
    pub device_type: Option<String>,
    pub hardware_version: Option<String>,
    pub software_version: Option<String>,
    /// Supported binding and modes, e.g. "UQ"
    pub binding: String,
    pub factory_reset: bool,
    pub reset_error_code: bool,
    /// Resources 6, 7 and 8
    pub power_sources: bool,
    /// Resources 9 and 20
    pub battery: bool,
    /// Resources 10 and 21
    pub memory: bool,
    /// Resources 13, 14 and 15
    pub clock: bool,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            manufacturer: None,
            model_number: None,
            serial_number: None,
            firmware_version: None,
            device_type: None,
            hardware_version: None,
            software_version: None,
            binding: "U".to_string(),
            factory_reset: false,
            reset_error_code: false,
            power_sources: false,
            battery: false,
            memory: false,
            clock: false,
        }
    }
}

impl DeviceConfig {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_manufacturer(mut self, value: impl Into<String>) -> Self {
        self.manufacturer = Some(value.into());
        self
    }

    pub fn with_model_number(mut self, value: impl Into<String>) -> Self {
        self.model_number = Some(value.into());
        self
    }

    pub fn with_serial_number(mut self, value: impl Into<String>) -> Self {
        self.serial_number = Some(value.into());
        self
    }

    pub fn with_firmware_version(mut self, value: impl Into<String>) -> Self {
        self.firmware_version = Some(value.into());
        self
    }

    pub fn with_device_type(mut self, value: impl Into<String>) -> Self {
        self.device_type = Some(value.into());
        self
    }

    pub fn with_hardware_version(mut self, value: impl Into<String>) -> Self {
        self.hardware_version = Some(value.into());
        self
    }

    pub fn with_software_version(mut self, value: impl Into<String>) -> Self {
        self.software_version = Some(value.into());
        self
    }

    pub fn with_binding(mut self, value: impl Into<String>) -> Self {
        self.binding = value.into();
        self
    }

    pub fn with_factory_reset(mut self) -> Self {
        self.factory_reset = true;
        self
    }

    pub fn with_reset_error_code(mut self) -> Self {
        self.reset_error_code = true;
        self
    }

    pub fn with_power_sources(mut self) -> Self {
        self.power_sources = true;
        self
    }

    pub fn with_battery(mut self) -> Self {
        self.battery = true;
        self
    }

    pub fn with_memory(mut self) -> Self {
        self.memory = true;
        self
    }

    pub fn with_clock(mut self) -> Self {
        self.clock = true;
        self
    }

    /// Resolve the resource list
    pub fn resources(&self) -> Vec<ResourceDescriptor> {
        use DeviceObject as D;
        let opt = ResourceFlags::OPTIONAL;
        let string = |id| ResourceDescriptor::read_only(id, ValueType::String, opt);
        let integer = |id| ResourceDescriptor::read_only(id, ValueType::Integer, opt);

        let mut resources = Vec::new();
        let strings = [
            (D::RES_MANUFACTURER, &self.manufacturer),
            (D::RES_MODEL_NUMBER, &self.model_number),
            (D::RES_SERIAL_NUMBER, &self.serial_number),
            (D::RES_FIRMWARE_VERSION, &self.firmware_version),
        ];
        resources.extend(strings.iter().filter(|(_, v)| v.is_some()).map(|(id, _)| string(*id)));
        resources.push(ResourceDescriptor::executable(D::RES_REBOOT, ResourceFlags::MANDATORY));
        if self.factory_reset {
            resources.push(ResourceDescriptor::executable(D::RES_FACTORY_RESET, opt));
        }
        if self.power_sources {
            for id in [
                D::RES_AVAILABLE_POWER_SOURCES,
                D::RES_POWER_SOURCE_VOLTAGE,
                D::RES_POWER_SOURCE_CURRENT,
            ] {
                resources.push(ResourceDescriptor::read_only(id, ValueType::Integer, opt.multiple()));
            }
        }
        if self.battery {
            resources.push(integer(D::RES_BATTERY_LEVEL));
        }
        if self.memory {
            resources.push(integer(D::RES_MEMORY_FREE));
        }
        resources.push(ResourceDescriptor::read_only(
            D::RES_ERROR_CODE,
            ValueType::Integer,
            ResourceFlags::MANDATORY.multiple(),
        ));
        if self.reset_error_code {
            resources.push(ResourceDescriptor::executable(D::RES_RESET_ERROR_CODE, opt));
        }
        if self.clock {
            resources.push(ResourceDescriptor::read_write(D::RES_CURRENT_TIME, ValueType::Time, opt));
            resources.push(ResourceDescriptor::read_write(D::RES_UTC_OFFSET, ValueType::String, opt));
            resources.push(ResourceDescriptor::read_write(D::RES_TIMEZONE, ValueType::String, opt));
        }
        resources.push(ResourceDescriptor::read_only(
            D::RES_SUPPORTED_BINDING,
            ValueType::String,
            ResourceFlags::MANDATORY,
        ));
        let strings = [
            (D::RES_DEVICE_TYPE, &self.device_type),
            (D::RES_HARDWARE_VERSION, &self.hardware_version),
            (D::RES_SOFTWARE_VERSION, &self.software_version),
        ];
        resources.extend(strings.iter().filter(|(_, v)| v.is_some()).map(|(id, _)| string(*id)));
        if self.battery {
            resources.push(integer(D::RES_BATTERY_STATUS));
        }
        if self.memory {
            resources.push(integer(D::RES_MEMORY_TOTAL));
        }
        resources
    }
}

/// Device object (Object ID: 3)
#[derive(Debug, Clone)]
pub struct DeviceObject {
    config: DeviceConfig,
    definition: ObjectDefinition,
    power_sources: BTreeMap<ResourceInstanceId, PowerSource>,
    battery_level: i64,
    battery_status: BatteryStatus,
    memory_free: i64,
    memory_total: i64,
    error_codes: Vec<ErrorCode>,
    /// Seconds added to the system clock for Current Time
    time_offset: i64,
    utc_offset: String,
    timezone: String,
}

impl DeviceObject {
    pub const OBJECT_ID: u16 = 3;

    pub const RES_MANUFACTURER: ResourceId = 0;
    pub const RES_MODEL_NUMBER: ResourceId = 1;
    pub const RES_SERIAL_NUMBER: ResourceId = 2;
    pub const RES_FIRMWARE_VERSION: ResourceId = 3;
    pub const RES_REBOOT: ResourceId = 4;
    pub const RES_FACTORY_RESET: ResourceId = 5;
    pub const RES_AVAILABLE_POWER_SOURCES: ResourceId = 6;
    pub const RES_POWER_SOURCE_VOLTAGE: ResourceId = 7;
    pub const RES_POWER_SOURCE_CURRENT: ResourceId = 8;
    pub const RES_BATTERY_LEVEL: ResourceId = 9;
    pub const RES_MEMORY_FREE: ResourceId = 10;
    pub const RES_ERROR_CODE: ResourceId = 11;
    pub const RES_RESET_ERROR_CODE: ResourceId = 12;
    pub const RES_CURRENT_TIME: ResourceId = 13;
    pub const RES_UTC_OFFSET: ResourceId = 14;
    pub const RES_TIMEZONE: ResourceId = 15;
    pub const RES_SUPPORTED_BINDING: ResourceId = 16;
    pub const RES_DEVICE_TYPE: ResourceId = 17;
    pub const RES_HARDWARE_VERSION: ResourceId = 18;
    pub const RES_SOFTWARE_VERSION: ResourceId = 19;
    pub const RES_BATTERY_STATUS: ResourceId = 20;
    pub const RES_MEMORY_TOTAL: ResourceId = 21;

    pub fn new(config: DeviceConfig) -> Self {
        let definition = ObjectDefinition::new(Self::OBJECT_ID, Multiplicity::Single)
            .with_resources(config.resources());
        Self {
            config,
            definition,
            power_sources: BTreeMap::new(),
            battery_level: 0,
            battery_status: BatteryStatus::default(),
            memory_free: 0,
            memory_total: 0,
            error_codes: Vec::new(),
            time_offset: 0,
            utc_offset: String::new(),
            timezone: String::new(),
        }
    }

    pub fn definition(&self) -> ObjectDefinition {
        self.definition.clone()
    }

    pub fn config(&self) -> &DeviceConfig {
        &self.config
    }

    fn require(&self, resource: ResourceId) -> Lwm2mResult<()> {
        if self.definition.resource(resource).is_none() {
            return Err(Lwm2mError::PreconditionFailed(format!(
                "resource /3/0/{} is not configured",
                resource
            )));
        }
        Ok(())
    }

    pub fn power_sources(&self) -> impl Iterator<Item = (ResourceInstanceId, &PowerSource)> {
        self.power_sources.iter().map(|(id, source)| (*id, source))
    }

    /// Add a power source, returning its resource instance id
    pub fn add_power_source(
        &mut self,
        ctx: &mut ObjectContext,
        source: PowerSource,
    ) -> Lwm2mResult<ResourceInstanceId> {
        self.require(Self::RES_AVAILABLE_POWER_SOURCES)?;
        let id = (0..ResourceInstanceId::MAX)
            .find(|id| !self.power_sources.contains_key(id))
            .ok_or_else(|| Lwm2mError::Internal("power source list is full".to_string()))?;
        self.power_sources.insert(id, source);
        self.power_sources_changed(ctx);
        Ok(id)
    }

    pub fn remove_power_source(&mut self, ctx: &mut ObjectContext, id: ResourceInstanceId) -> Lwm2mResult<()> {
        self.require(Self::RES_AVAILABLE_POWER_SOURCES)?;
        self.power_sources
            .remove(&id)
            .ok_or_else(|| Lwm2mError::not_found(format!("power source {}", id)))?;
        self.power_sources_changed(ctx);
        Ok(())
    }

    pub fn set_power_source_voltage(
        &mut self,
        ctx: &mut ObjectContext,
        id: ResourceInstanceId,
        voltage_mv: i64,
    ) -> Lwm2mResult<()> {
        self.require(Self::RES_POWER_SOURCE_VOLTAGE)?;
        let source = self
            .power_sources
            .get_mut(&id)
            .ok_or_else(|| Lwm2mError::not_found(format!("power source {}", id)))?;
        if source.voltage_mv != voltage_mv {
            source.voltage_mv = voltage_mv;
            ctx.resource_changed(SINGLE_INSTANCE_ID, Self::RES_POWER_SOURCE_VOLTAGE);
        }
        Ok(())
    }

    pub fn set_power_source_current(
        &mut self,
        ctx: &mut ObjectContext,
        id: ResourceInstanceId,
        current_ma: i64,
    ) -> Lwm2mResult<()> {
        self.require(Self::RES_POWER_SOURCE_CURRENT)?;
        let source = self
            .power_sources
            .get_mut(&id)
            .ok_or_else(|| Lwm2mError::not_found(format!("power source {}", id)))?;
        if source.current_ma != current_ma {
            source.current_ma = current_ma;
            ctx.resource_changed(SINGLE_INSTANCE_ID, Self::RES_POWER_SOURCE_CURRENT);
        }
        Ok(())
    }

    fn power_sources_changed(&self, ctx: &mut ObjectContext) {
        for resource in [
            Self::RES_AVAILABLE_POWER_SOURCES,
            Self::RES_POWER_SOURCE_VOLTAGE,
            Self::RES_POWER_SOURCE_CURRENT,
        ] {
            ctx.resource_changed(SINGLE_INSTANCE_ID, resource);
        }
    }

    pub fn battery_level(&self) -> i64 {
        self.battery_level
    }

    /// Set the battery level in percent
    pub fn set_battery_level(&mut self, ctx: &mut ObjectContext, level: i64) -> Lwm2mResult<()> {
        self.require(Self::RES_BATTERY_LEVEL)?;
        if !(0..=100).contains(&level) {
            return Err(Lwm2mError::bad_request(format!("battery level {}", level)));
        }
        if self.battery_level != level {
            self.battery_level = level;
            ctx.resource_changed(SINGLE_INSTANCE_ID, Self::RES_BATTERY_LEVEL);
        }
        Ok(())
    }

    pub fn set_battery_status(&mut self, ctx: &mut ObjectContext, status: BatteryStatus) -> Lwm2mResult<()> {
        self.require(Self::RES_BATTERY_STATUS)?;
        if self.battery_status != status {
            self.battery_status = status;
            ctx.resource_changed(SINGLE_INSTANCE_ID, Self::RES_BATTERY_STATUS);
        }
        Ok(())
    }

    /// Set free and total memory in KiB
    pub fn set_memory(&mut self, ctx: &mut ObjectContext, free: i64, total: i64) -> Lwm2mResult<()> {
        self.require(Self::RES_MEMORY_FREE)?;
        if free < 0 || total < free {
            return Err(Lwm2mError::bad_request(format!("memory {}/{}", free, total)));
        }
        if self.memory_free != free {
            self.memory_free = free;
            ctx.resource_changed(SINGLE_INSTANCE_ID, Self::RES_MEMORY_FREE);
        }
        if self.memory_total != total {
            self.memory_total = total;
            ctx.resource_changed(SINGLE_INSTANCE_ID, Self::RES_MEMORY_TOTAL);
        }
        Ok(())
    }

    pub fn error_codes(&self) -> &[ErrorCode] {
        &self.error_codes
    }

    /// Raise an error code; raising one that is already set is a conflict
    pub fn add_error_code(&mut self, ctx: &mut ObjectContext, code: ErrorCode) -> Lwm2mResult<()> {
        if code == ErrorCode::NoError {
            return Err(Lwm2mError::bad_request("error code 0 cannot be raised"));
        }
        if self.error_codes.contains(&code) {
            return Err(Lwm2mError::Conflict(format!("error code {} already set", code.value())));
        }
        self.error_codes.push(code);
        ctx.resource_changed(SINGLE_INSTANCE_ID, Self::RES_ERROR_CODE);
        Ok(())
    }

    pub fn remove_error_code(&mut self, ctx: &mut ObjectContext, code: ErrorCode) -> Lwm2mResult<()> {
        let before = self.error_codes.len();
        self.error_codes.retain(|c| *c != code);
        if self.error_codes.len() == before {
            return Err(Lwm2mError::not_found(format!("error code {}", code.value())));
        }
        ctx.resource_changed(SINGLE_INSTANCE_ID, Self::RES_ERROR_CODE);
        Ok(())
    }

    pub fn clear_error_codes(&mut self, ctx: &mut ObjectContext) {
        if !self.error_codes.is_empty() {
            self.error_codes.clear();
            ctx.resource_changed(SINGLE_INSTANCE_ID, Self::RES_ERROR_CODE);
        }
    }

    /// Current time as seconds since the Unix epoch
    pub fn current_time(&self) -> Lwm2mResult<i64> {
        Ok(unix_time()?.saturating_add(self.time_offset))
    }

    fn read_value(&self, record: &ResourceRecord) -> Lwm2mResult<Value> {
        let string = |value: &Option<String>| Value::String(value.clone().unwrap_or_default());
        let power_source = |ri: Option<ResourceInstanceId>| {
            ri.and_then(|ri| self.power_sources.get(&ri))
                .ok_or_else(|| Lwm2mError::not_found(record.uri()))
        };
        Ok(match record.resource {
            Self::RES_MANUFACTURER => string(&self.config.manufacturer),
            Self::RES_MODEL_NUMBER => string(&self.config.model_number),
            Self::RES_SERIAL_NUMBER => string(&self.config.serial_number),
            Self::RES_FIRMWARE_VERSION => string(&self.config.firmware_version),
            Self::RES_AVAILABLE_POWER_SOURCES => {
                Value::Integer(power_source(record.resource_instance)?.kind.value() as i64)
            }
            Self::RES_POWER_SOURCE_VOLTAGE => {
                Value::Integer(power_source(record.resource_instance)?.voltage_mv)
            }
            Self::RES_POWER_SOURCE_CURRENT => {
                Value::Integer(power_source(record.resource_instance)?.current_ma)
            }
            Self::RES_BATTERY_LEVEL => Value::Integer(self.battery_level),
            Self::RES_MEMORY_FREE => Value::Integer(self.memory_free),
            Self::RES_ERROR_CODE => {
                let index = record.resource_instance.unwrap_or(0) as usize;
                match self.error_codes.get(index) {
                    Some(code) => Value::Integer(code.value() as i64),
                    None if index == 0 => Value::Integer(ErrorCode::NoError.value() as i64),
                    None => return Err(Lwm2mError::not_found(record.uri())),
                }
            }
            Self::RES_CURRENT_TIME => Value::Time(self.current_time()?),
            Self::RES_UTC_OFFSET => Value::String(self.utc_offset.clone()),
            Self::RES_TIMEZONE => Value::String(self.timezone.clone()),
            Self::RES_SUPPORTED_BINDING => Value::String(self.config.binding.clone()),
            Self::RES_DEVICE_TYPE => string(&self.config.device_type),
            Self::RES_HARDWARE_VERSION => string(&self.config.hardware_version),
            Self::RES_SOFTWARE_VERSION => string(&self.config.software_version),
            Self::RES_BATTERY_STATUS => Value::Integer(self.battery_status.value() as i64),
            Self::RES_MEMORY_TOTAL => Value::Integer(self.memory_total),
            _ => return Err(Lwm2mError::not_found(record.uri())),
        })
    }

    fn write_value(&mut self, record: &ResourceRecord) -> Lwm2mResult<()> {
        match record.resource {
            Self::RES_CURRENT_TIME => {
                let time = record
                    .value
                    .as_i64()
                    .ok_or_else(|| Lwm2mError::bad_request("current time"))?;
                self.time_offset = time.saturating_sub(unix_time()?);
            }
            Self::RES_UTC_OFFSET => {
                self.utc_offset = text(&record.value)?;
            }
            Self::RES_TIMEZONE => {
                self.timezone = text(&record.value)?;
            }
            _ => return Err(Lwm2mError::not_allowed(record.uri())),
        }
        Ok(())
    }

    fn execute(&mut self, ctx: &mut ObjectContext, resource: ResourceId) -> Lwm2mResult<()> {
        match resource {
            Self::RES_REBOOT => {
                log::info!("Reboot requested");
                ctx.emit(Event::RebootRequested);
            }
            Self::RES_FACTORY_RESET => {
                log::info!("Factory reset requested");
                ctx.emit(Event::FactoryResetRequested);
            }
            Self::RES_RESET_ERROR_CODE => self.clear_error_codes(ctx),
            _ => return Err(Lwm2mError::not_allowed(format!("execute on /3/0/{}", resource))),
        }
        Ok(())
    }
}

impl Lwm2mObject for DeviceObject {
    fn handle(
        &mut self,
        ctx: &mut ObjectContext,
        op: Operation,
        instance: InstanceId,
        records: &mut [ResourceRecord],
    ) -> Lwm2mResult<()> {
        if instance != SINGLE_INSTANCE_ID {
            return Err(Lwm2mError::not_found(format!("/3/{}", instance)));
        }
        for record in records.iter_mut() {
            let result = match op {
                Operation::Read => self.read_value(record).map(|value| record.set(value)),
                Operation::Write => self.write_value(record),
                Operation::Execute => self.execute(ctx, record.resource),
                _ => Err(Lwm2mError::not_allowed(format!("{} on /3/0", op))),
            };
            if let Err(e) = result {
                record.fail(Status::from(&e));
            }
        }
        Ok(())
    }

    fn resource_instances(
        &mut self,
        _instance: InstanceId,
        resource: ResourceId,
    ) -> Lwm2mResult<Vec<ResourceInstanceId>> {
        Ok(match resource {
            Self::RES_AVAILABLE_POWER_SOURCES
            | Self::RES_POWER_SOURCE_VOLTAGE
            | Self::RES_POWER_SOURCE_CURRENT => self.power_sources.keys().copied().collect(),
            Self::RES_ERROR_CODE => {
                let count = self.error_codes.len().max(1) as ResourceInstanceId;
                (0..count).collect()
            }
            _ => Vec::new(),
        })
    }

    fn as_any(&self) -> &dyn Any {
        self
    }

    fn as_any_mut(&mut self) -> &mut dyn Any {
        self
    }
}

fn unix_time() -> Lwm2mResult<i64> {
    let elapsed = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Lwm2mError::Internal(format!("system clock: {}", e)))?;
    i64::try_from(elapsed.as_secs()).map_err(|e| Lwm2mError::Internal(format!("system clock: {}", e)))
}

fn text(value: &Value) -> Lwm2mResult<String> {
    value
        .as_str()
        .map(str::to_string)
        .ok_or_else(|| Lwm2mError::bad_request(format!("expected string, got {}", value.value_type())))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn full_device() -> DeviceObject {
        DeviceObject::new(
            DeviceConfig::new()
                .with_manufacturer("ACME")
                .with_serial_number("0001")
                .with_factory_reset()
                .with_reset_error_code()
                .with_power_sources()
                .with_battery()
                .with_memory()
                .with_clock(),
        )
    }

    fn read(device: &mut DeviceObject, resource: ResourceId, ri: Option<ResourceInstanceId>) -> ResourceRecord {
        let mut ctx = ObjectContext::new(0, 3);
        let mut record = ResourceRecord::target(3, 0, resource);
        record.resource_instance = ri;
        let mut records = [record];
        device.handle(&mut ctx, Operation::Read, 0, &mut records).unwrap();
        records[0].clone()
    }

    #[test]
    fn test_config_resolves_resources() {
        let minimal = DeviceObject::new(DeviceConfig::new()).definition();
        let ids: Vec<_> = minimal.resources.iter().map(|r| r.id).collect();
        assert_eq!(ids, vec![4, 11, 16]);
        assert!(minimal.validate().is_ok());

        let full = full_device().definition();
        assert!(full.resource(DeviceObject::RES_BATTERY_STATUS).is_some());
        assert!(full.resource(DeviceObject::RES_MODEL_NUMBER).is_none());
        assert!(full.validate().is_ok());
    }

    #[test]
    fn test_read_static_values() {
        let mut device = full_device();
        assert_eq!(read(&mut device, 0, None).value, Value::String("ACME".into()));
        assert_eq!(read(&mut device, 16, None).value, Value::String("U".into()));
    }

    #[test]
    fn test_unconfigured_mutator_is_precondition_failed() {
        let mut device = DeviceObject::new(DeviceConfig::new());
        let mut ctx = ObjectContext::new(0, 3);
        assert!(matches!(
            device.set_battery_level(&mut ctx, 50),
            Err(Lwm2mError::PreconditionFailed(_))
        ));
        assert!(ctx.changes().is_empty());
    }

    #[test]
    fn test_battery_level_range() {
        let mut device = full_device();
        let mut ctx = ObjectContext::new(0, 3);
        device.set_battery_level(&mut ctx, 80).unwrap();
        device.set_battery_level(&mut ctx, 80).unwrap();
        assert_eq!(ctx.changes().len(), 1);
        assert!(device.set_battery_level(&mut ctx, 101).is_err());
        assert_eq!(read(&mut device, 9, None).value, Value::Integer(80));
    }

    #[test]
    fn test_power_source_arena() {
        let mut device = full_device();
        let mut ctx = ObjectContext::new(0, 3);
        let dc = device.add_power_source(&mut ctx, PowerSource::new(PowerSourceType::Dc)).unwrap();
        let usb = device.add_power_source(&mut ctx, PowerSource::new(PowerSourceType::Usb)).unwrap();
        assert_eq!((dc, usb), (0, 1));

        device.set_power_source_voltage(&mut ctx, usb, 5000).unwrap();
        device.remove_power_source(&mut ctx, dc).unwrap();
        assert_eq!(device.resource_instances(0, 6).unwrap(), vec![1]);
        assert_eq!(read(&mut device, 6, Some(1)).value, Value::Integer(5));
        assert_eq!(read(&mut device, 7, Some(1)).value, Value::Integer(5000));
        assert_eq!(read(&mut device, 6, Some(0)).status, Status::NotFound);

        // freed id is reused
        let ac = device.add_power_source(&mut ctx, PowerSource::new(PowerSourceType::Ac)).unwrap();
        assert_eq!(ac, 0);
    }

    #[test]
    fn test_error_codes() {
        let mut device = full_device();
        let mut ctx = ObjectContext::new(0, 3);
        assert_eq!(device.resource_instances(0, 11).unwrap(), vec![0]);
        assert_eq!(read(&mut device, 11, Some(0)).value, Value::Integer(0));

        device.add_error_code(&mut ctx, ErrorCode::LowBatteryPower).unwrap();
        device.add_error_code(&mut ctx, ErrorCode::OutOfMemory).unwrap();
        assert!(matches!(
            device.add_error_code(&mut ctx, ErrorCode::OutOfMemory),
            Err(Lwm2mError::Conflict(_))
        ));
        assert_eq!(device.resource_instances(0, 11).unwrap(), vec![0, 1]);
        assert_eq!(read(&mut device, 11, Some(1)).value, Value::Integer(5));

        let mut records = [ResourceRecord::with_value(3, 0, 12, Value::Argument(None))];
        device.handle(&mut ctx, Operation::Execute, 0, &mut records).unwrap();
        assert!(device.error_codes().is_empty());
    }

    #[test]
    fn test_reboot_emits_event() {
        let mut device = full_device();
        let mut ctx = ObjectContext::new(0, 3);
        let mut records = [ResourceRecord::with_value(3, 0, 4, Value::Argument(None))];
        device.handle(&mut ctx, Operation::Execute, 0, &mut records).unwrap();
        assert!(records[0].is_ok());
        let (_, effects) = ctx.take();
        assert_eq!(effects, vec![crate::SideEffect::Event(Event::RebootRequested)]);
    }

    #[test]
    fn test_current_time_write() {
        let mut device = full_device();
        let mut ctx = ObjectContext::new(0, 3);
        let now = device.current_time().unwrap();
        let mut records = [ResourceRecord::with_value(3, 0, 13, Value::Time(now + 3600))];
        device.handle(&mut ctx, Operation::Write, 0, &mut records).unwrap();
        let shifted = device.current_time().unwrap();
        assert!((shifted - now - 3600).abs() <= 1);
    }
}
