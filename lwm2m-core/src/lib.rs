//! Core types and utilities for the LwM2M endpoint engine
//!
//! This crate provides fundamental types, error handling, and utilities
//! used throughout the engine: identifiers and paths, resource values and
//! descriptors, protocol status codes, engine events and the clock seam.

pub mod error;
pub mod status;
pub mod uri;
pub mod datatypes;
pub mod event;
pub mod time;

pub use error::{Lwm2mError, Lwm2mResult};
pub use status::{Operation, Status};
pub use uri::{
    InstanceId, ObjectId, ResourceId, ResourceInstanceId, ShortServerId, Uri, ID_INVALID,
};
pub use datatypes::*;
pub use event::{CallbackEventListener, Event, EventListener};
pub use time::{Clock, ManualClock, MonotonicClock, Timestamp};
