//! Object interface module for the LwM2M endpoint engine
//!
//! This crate defines the callback contract every registered object
//! implements, the context through which callbacks queue side effects, and
//! the reference objects built on top of it.
//!
//! # Reference objects
//!
//! | Object | ID | Instances |
//! |--------|----|-----------|
//! | Server | 1 | multiple |
//! | Device | 3 | single |
//! | Generic Sensor | 3300 (configurable) | multiple |
//!
//! # Example
//!
//! ```rust
//! use lwm2m_interface::{DeviceConfig, DeviceObject, Lwm2mObject, ObjectContext};
//! use lwm2m_core::{Operation, ResourceRecord};
//!
//! let mut device = DeviceObject::new(DeviceConfig::new().with_manufacturer("ACME"));
//! let mut ctx = ObjectContext::new(0, DeviceObject::OBJECT_ID);
//! let mut records = [ResourceRecord::target(3, 0, DeviceObject::RES_MANUFACTURER)];
//! device.handle(&mut ctx, Operation::Read, 0, &mut records).unwrap();
//! assert_eq!(records[0].value.as_str(), Some("ACME"));
//! ```

pub mod context;
pub mod object;
pub mod device;
pub mod server;
pub mod sensor;

pub use context::{ChangeKind, ChangeMarker, ObjectContext, SideEffect};
pub use object::{Lwm2mObject, Multiplicity, ObjectDefinition, SINGLE_INSTANCE_ID};
pub use device::{BatteryStatus, DeviceConfig, DeviceObject, ErrorCode, PowerSource, PowerSourceType};
pub use server::ServerObject;
pub use sensor::{GenericSensor, SensorConfig};
