//! Data types used by the object model

pub mod value;
pub mod record;
pub mod descriptor;

pub use value::{Value, ValueType};
pub use record::ResourceRecord;
pub use descriptor::{ResourceDescriptor, ResourceFlags, ResourceOperations};
